use crate::color;
use crate::device::{Device, GlyphRef};
use crate::output::{Bookmark, NamedDest, OutputDevice};
use log::{debug, warn};
use std::io::{self, Write};

// The interpreter-side half of the backend: show operators, unit scaling
// and the drawing procedures the translator emits calls to.
const PROLOG: &str = "\
/linewidth .4 def
/resolution 720 def
/pagesize [612 792] def
/inch {72 mul} bind def

/setup {
\tcounttomark 2 idiv {def} repeat pop
\t/scaling 72 resolution div def
\tlinewidth setlinewidth
\t1 setlinecap
\t0 pagesize 1 get translate
\tscaling scaling scale
\t0 0 moveto
} def

/pagesetup {
\t/page exch def
\tcurrentdict /pagedict known currentdict page known and {
\t\tpage load pagedict exch get cvx exec
\t} if
} def

/w {neg moveto show} bind def
/m {neg moveto} bind def
/g {neg moveto {glyphshow} forall} bind def
/rgb {3 {255 div 3 1 roll} repeat setrgbcolor} bind def
/done {/lastpage where {pop lastpage} if} def

/f {
\tdup /font exch def findfont exch
\tdup /ptsize exch def scaling div dup /size exch def scalefont setfont
\tlinewidth ptsize mul scaling 10 mul div setlinewidth
} bind def

/savedmatrix matrix def
/drawl {
\tneg lineto
} bind def
/drawe {
\tsavedmatrix currentmatrix pop scale
\t.5 0 rmoveto currentpoint .5 0 rmoveto .5 0 360 arc
\tsavedmatrix setmatrix
} bind def
/drawa {
\t/dy2 exch def
\t/dx2 exch def
\t/dy1 exch def
\t/dx1 exch def
\tcurrentpoint dy1 neg add exch dx1 add exch
\tdx1 dx1 mul dy1 dy1 mul add sqrt
\tdy1 dx1 neg atan
\tdy2 neg dx2 atan
\tarc
} bind def
/draws {
\t/y2 exch def
\t/x2 exch def
\t/y1 exch def
\t/x1 exch def
\t/y0 exch def
\t/x0 exch def
\tx0 5 x1 mul add 6 div
\ty0 5 y1 mul add -6 div
\tx2 5 x1 mul add 6 div
\ty2 5 y1 mul add -6 div
\tx1 x2 add 2 div
\ty1 y2 add -2 div
\tcurveto
} bind def
";

// Glyph placement adjustments for the Symbol font's bracket pieces.
const FIXLIST: &[(&str, i32, i32)] = &[
    ("br", -5, 4),
    ("lc", 20, 0),
    ("lf", 20, 0),
    ("rc", -11, 0),
    ("rf", -11, 0),
    ("rn", -50, 0),
];

pub struct PsDevice<W: Write> {
    w: W,
    gname: bool,
    o_f: usize,
    o_s: i32,
    o_m: u32,
    o_h: i32,
    o_v: i32,
    p_f: i32,
    p_s: i32,
    p_m: u32,
    q_type: u8,
    q_h: i32,
    q_v: i32,
    q_end: i32,
    fonts_used: Vec<String>,
    draw_path: bool,
    draw_point: bool,
}

impl<W: Write> PsDevice<W> {
    pub fn new(w: W, gname: bool) -> Self {
        PsDevice {
            w,
            gname,
            o_f: 0,
            o_s: 0,
            o_m: 0,
            o_h: 0,
            o_v: 0,
            p_f: 0,
            p_s: 0,
            p_m: 0,
            q_type: 0,
            q_h: 0,
            q_v: 0,
            q_end: 0,
            fonts_used: Vec::new(),
            draw_path: false,
            draw_point: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn into_writer(self) -> W {
        self.w
    }

    fn out(&mut self, s: &str) -> io::Result<()> {
        self.w.write_all(s.as_bytes())
    }

    fn o_flush(&mut self) -> io::Result<()> {
        match self.q_type {
            1 => {
                let line = format!(") {} {} w\n", self.q_h, self.q_v);
                self.out(&line)?;
            }
            2 => {
                let line = format!("] {} {} g\n", self.q_h, self.q_v);
                self.out(&line)?;
            }
            _ => {}
        }
        self.q_type = 0;
        Ok(())
    }

    fn fontup_id(&mut self, dev: &Device, fid: usize) -> io::Result<()> {
        if self.o_m != self.p_m {
            self.o_flush()?;
            let line = format!(
                "{} {} {} rgb\n",
                color::red(self.o_m),
                color::green(self.o_m),
                color::blue(self.o_m)
            );
            self.out(&line)?;
            self.p_m = self.o_m;
        }
        if fid as i32 != self.p_f || self.o_s != self.p_s {
            let Some(font) = dev.font(fid) else {
                return Ok(());
            };
            let fontname = font.fontname().to_string();
            self.o_flush()?;
            let line = format!("{} /{} f\n", self.o_s, fontname);
            self.out(&line)?;
            self.p_f = fid as i32;
            self.p_s = self.o_s;
            if !self.fonts_used.iter().any(|f| *f == fontname) {
                self.fonts_used.push(fontname);
            }
        }
        Ok(())
    }

    fn fixpos(&self, dev: &Device, hit: &GlyphRef) -> (i32, i32) {
        if hit.font.name() == "S" && hit.font.fontname() == "Symbol" {
            for &(name, dh, dv) in FIXLIST {
                if hit.glyph.name == name {
                    return (dev.charwid(dh, self.o_s), dev.charwid(dv, self.o_s));
                }
            }
        }
        (0, 0)
    }

    // Appends one glyph to the open run, or starts a new run when the
    // run type or the predicted position no longer matches.
    fn o_queue(&mut self, dev: &Device, hit: &GlyphRef) -> io::Result<()> {
        let numeric = hit
            .glyph
            .id
            .bytes()
            .next()
            .is_some_and(|b| b.is_ascii_digit());
        let ty: u8 = if !self.gname && numeric { 1 } else { 2 };
        if self.q_type != ty || self.q_end != self.o_h || self.q_v != self.o_v {
            self.o_flush()?;
            self.q_h = self.o_h;
            self.q_v = self.o_v;
            self.q_type = ty;
            self.out(if ty == 1 { "(" } else { "[" })?;
        }
        if self.q_type == 1 {
            let num: i32 = hit.glyph.id.parse().unwrap_or(0);
            if (32..=126).contains(&num) {
                let c = num as u8 as char;
                if matches!(c, '(' | ')' | '\\') {
                    self.out("\\")?;
                }
                self.out(&c.to_string())?;
            } else {
                let line = format!("\\{}{}{}", (num >> 6) & 7, (num >> 3) & 7, num & 7);
                self.out(&line)?;
            }
        } else {
            let name = format!("/{}", hit.glyph.id);
            self.out(&name)?;
        }
        self.q_end = self.o_h + dev.charwid(hit.glyph.wid, self.o_s);
        Ok(())
    }

    fn drawmv(&mut self) -> io::Result<()> {
        if !self.draw_point {
            let line = format!("{} {} m ", self.o_h, self.o_v);
            self.out(&line)?;
        }
        self.draw_point = true;
        Ok(())
    }
}

impl<W: Write> OutputDevice for PsDevice<W> {
    fn doc_begin(
        &mut self,
        dev: &Device,
        title: Option<&str>,
        pagewidth: i32,
        pageheight: i32,
        linewidth: i32,
    ) -> io::Result<()> {
        let w = (pagewidth * 72 + 127) / 254;
        let h = (pageheight * 72 + 127) / 254;
        self.out("%!PS-Adobe-2.0\n")?;
        self.out("%%Version: 1.0\n")?;
        self.out("%%Creator: inkpost\n")?;
        if let Some(title) = title {
            let line = format!("%%Title: {}\n", title);
            self.out(&line)?;
        }
        self.out("%%DocumentFonts: (atend)\n")?;
        self.out("%%Pages: (atend)\n")?;
        self.out("%%EndComments\n")?;
        self.out("%%BeginProlog\n")?;
        self.out(PROLOG)?;
        self.out("%%EndProlog\n")?;
        self.out("%%BeginSetup\n")?;
        let line = format!(
            "<< /PageSize [{} {}] /ImagingBBox null >> setpagedevice\n",
            w, h
        );
        self.out(&line)?;
        let line = format!(
            "mark\n/linewidth {}.{:02} /resolution {} /pagesize [{} {}]\nsetup\n",
            linewidth / 100,
            linewidth % 100,
            dev.res,
            w,
            h
        );
        self.out(&line)?;
        self.out("%%EndSetup\n")?;
        Ok(())
    }

    fn doc_end(&mut self, pages: i32) -> io::Result<()> {
        self.o_flush()?;
        self.out("%%Trailer\n")?;
        self.out("done\n")?;
        let line = format!("%%DocumentFonts: {}\n", self.fonts_used.join(" "));
        self.out(&line)?;
        let line = format!("%%Pages: {}\n", pages);
        self.out(&line)?;
        Ok(())
    }

    fn page_begin(&mut self, n: i32) -> io::Result<()> {
        self.o_flush()?;
        let line = format!("%%Page: {} {}\n", n, n);
        self.out(&line)?;
        self.out("/saveobj save def\n")?;
        self.out("mark\n")?;
        let line = format!("{} pagesetup\n", n);
        self.out(&line)?;
        self.o_h = 0;
        self.o_v = 0;
        self.p_f = 0;
        self.p_s = 0;
        self.p_m = 0;
        Ok(())
    }

    fn page_end(&mut self, n: i32) -> io::Result<()> {
        self.o_flush()?;
        self.out("cleartomark\n")?;
        self.out("showpage\n")?;
        self.out("saveobj restore\n")?;
        let line = format!("%%EndPage: {} {}\n", n, n);
        self.out(&line)?;
        Ok(())
    }

    fn set_h(&mut self, h: i32) {
        self.o_h = h;
    }

    fn set_v(&mut self, v: i32) {
        self.o_v = v;
    }

    fn move_rel(&mut self, h: i32, v: i32) {
        self.o_h += h;
        self.o_v += v;
    }

    fn set_font(&mut self, _dev: &Device, pos: usize) {
        self.o_f = pos;
    }

    fn set_size(&mut self, s: i32) {
        if s > 0 {
            self.o_s = s;
        }
    }

    fn set_color(&mut self, color: u32) {
        self.o_m = color;
    }

    fn set_rotation(&mut self, deg: i32) {
        debug!("page rotation {} ignored in postscript output", deg);
    }

    fn font_mounted(&mut self, pos: usize) {
        if self.p_f == pos as i32 {
            self.p_f = -1;
        }
    }

    fn glyph(&mut self, dev: &Device, name: &str) -> io::Result<()> {
        let Some(hit) = dev.glyph(name, self.o_f) else {
            let adv = if name == " " {
                dev.spacewid(self.o_f, self.o_s).unwrap_or(1)
            } else {
                1
            };
            self.move_rel(adv, 0);
            return Ok(());
        };
        self.fontup_id(dev, dev.font_pos(hit.font))?;
        let (dh, dv) = self.fixpos(dev, &hit);
        self.o_h += dh;
        self.o_v += dv;
        self.o_queue(dev, &hit)?;
        self.o_h -= dh;
        self.o_v -= dv;
        Ok(())
    }

    fn draw_begin(&mut self, dev: &Device) -> io::Result<()> {
        self.o_flush()?;
        self.fontup_id(dev, self.o_f)?;
        if self.draw_path {
            return Ok(());
        }
        self.out("newpath ")?;
        Ok(())
    }

    fn draw_end(&mut self, close: bool, fill: bool) -> io::Result<()> {
        if self.draw_path {
            return Ok(());
        }
        self.draw_point = false;
        if close {
            self.out("closepath ")?;
        }
        self.out(if fill { "fill\n" } else { "stroke\n" })?;
        Ok(())
    }

    fn draw_line(&mut self, h: i32, v: i32) -> io::Result<()> {
        self.drawmv()?;
        self.move_rel(h, v);
        let line = format!("{} {} drawl ", self.o_h, self.o_v);
        self.out(&line)?;
        Ok(())
    }

    fn draw_circle(&mut self, d: i32) -> io::Result<()> {
        self.drawmv()?;
        self.move_rel(d, 0);
        let line = format!("{} {} drawe ", d, d);
        self.out(&line)?;
        Ok(())
    }

    fn draw_ellipse(&mut self, h: i32, v: i32) -> io::Result<()> {
        self.drawmv()?;
        self.move_rel(h, 0);
        let line = format!("{} {} drawe ", h, v);
        self.out(&line)?;
        Ok(())
    }

    fn draw_arc(&mut self, h1: i32, v1: i32, h2: i32, v2: i32) -> io::Result<()> {
        self.drawmv()?;
        let line = format!("{} {} {} {} drawa ", h1, v1, h2, v2);
        self.out(&line)?;
        self.move_rel(h1 + h2, v1 + v2);
        Ok(())
    }

    fn draw_spline(&mut self, h1: i32, v1: i32, h2: i32, v2: i32) -> io::Result<()> {
        self.drawmv()?;
        let line = format!(
            "{} {} {} {} {} {} draws ",
            self.o_h,
            self.o_v,
            self.o_h + h1,
            self.o_v + v1,
            self.o_h + h1 + h2,
            self.o_v + v1 + v2
        );
        self.out(&line)?;
        self.move_rel(h1, v1);
        Ok(())
    }

    fn draw_marked_begin(&mut self, dev: &Device, arg: &str) -> io::Result<()> {
        self.o_flush()?;
        self.fontup_id(dev, self.o_f)?;
        self.draw_path = true;
        let line = format!("gsave newpath {}\n", arg);
        self.out(&line)?;
        Ok(())
    }

    fn draw_marked_end(&mut self, arg: &str) -> io::Result<()> {
        self.draw_path = false;
        self.draw_point = false;
        let line = format!("{} grestore\n", arg);
        self.out(&line)?;
        Ok(())
    }

    fn raw(&mut self, line: &str) -> io::Result<()> {
        self.o_flush()?;
        let line = format!("{}\n", line);
        self.out(&line)?;
        Ok(())
    }

    fn set_param(&mut self, key: &str, value: &str) -> io::Result<()> {
        match key {
            "linecap" => {
                self.o_flush()?;
                let line = format!("{} setlinecap\n", value);
                self.out(&line)?;
            }
            "linejoin" => {
                self.o_flush()?;
                let line = format!("{} setlinejoin\n", value);
                self.out(&line)?;
            }
            _ => debug!("ignoring device parameter {}={}", key, value),
        }
        Ok(())
    }

    fn include_pdf(&mut self, path: &str, _hwid: i32, _vwid: i32) -> io::Result<()> {
        warn!("{}: pdf inclusion has no postscript rendition; skipping", path);
        Ok(())
    }

    fn include_eps(&mut self, path: &str, hwid: i32, vwid: i32) -> io::Result<()> {
        let Ok(data) = std::fs::read(path) else {
            warn!("{}: cannot read; skipping inclusion", path);
            return Ok(());
        };
        let text = String::from_utf8_lossy(&data);
        let bbox = text
            .lines()
            .find_map(|l| l.strip_prefix("%%BoundingBox:"))
            .map(|l| {
                l.split_whitespace()
                    .filter_map(|w| w.parse::<f64>().ok())
                    .collect::<Vec<f64>>()
            });
        let Some(bbox) = bbox.filter(|b| b.len() == 4) else {
            warn!("{}: no bounding box; skipping inclusion", path);
            return Ok(());
        };
        let (bw, bh) = (bbox[2] - bbox[0], bbox[3] - bbox[1]);
        if bw <= 0.0 || bh <= 0.0 {
            warn!("{}: degenerate bounding box; skipping inclusion", path);
            return Ok(());
        }
        let scale = if hwid > 0 {
            hwid as f64 / bw
        } else if vwid > 0 {
            vwid as f64 / bh
        } else {
            // Natural size: one EPS point per 1/72 inch of device units.
            1.0
        };
        self.o_flush()?;
        let line = format!("%%BeginDocument: {}\n", path);
        self.out(&line)?;
        self.out("/inksave save def\n/showpage { } def\n")?;
        let line = format!(
            "{} {} neg translate\n{:.4} {:.4} scale\n{:.4} {:.4} translate\n",
            self.o_h, self.o_v, scale, scale, -bbox[0], -bbox[1]
        );
        self.out(&line)?;
        self.w.write_all(&data)?;
        self.out("\ninksave restore\n%%EndDocument\n")?;
        Ok(())
    }

    fn link(&mut self, target: &str, _hwid: i32, _vwid: i32) {
        debug!("link {} ignored in postscript output", target);
    }

    fn info(&mut self, _key: &str, _value: &str) {}

    fn set_bookmarks(&mut self, marks: Vec<Bookmark>) {
        if !marks.is_empty() {
            debug!("bookmarks are not representable in postscript output");
        }
    }

    fn set_named_dests(&mut self, _names: Vec<NamedDest>) {}

    fn finish(&mut self) -> io::Result<()> {
        self.w.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::write_device;
    use crate::device::Device;

    const FONT_P: &str = "\
name P
fontname Courier
spacewidth 24
charset
A 60 0 65 65
B 60 0 66 66
nl 60 0 10 10
bs 60 0 92 92
";

    fn device_with_numeric_font() -> Device {
        let root = write_device(&[("P", FONT_P)]);
        let mut device = Device::open(&root, "utf").expect("open device");
        device.mount(1, "R").expect("mount R");
        device.mount(3, "P").expect("mount P");
        device
    }

    fn run_ps(gname: bool, f: impl FnOnce(&mut PsDevice<Vec<u8>>, &Device)) -> String {
        let dev = device_with_numeric_font();
        let mut ps = PsDevice::new(Vec::new(), gname);
        ps.doc_begin(&dev, None, 2159, 2794, 40).expect("doc begin");
        ps.page_begin(1).expect("page");
        f(&mut ps, &dev);
        ps.page_end(1).expect("page end");
        ps.doc_end(1).expect("doc end");
        String::from_utf8(ps.w).expect("utf8 output")
    }

    #[test]
    fn contiguous_numeric_glyphs_share_one_show() {
        let out = run_ps(false, |ps, dev| {
            ps.set_font(dev, 3);
            ps.set_size(10);
            ps.set_h(100);
            ps.set_v(200);
            ps.glyph(dev, "A").expect("A");
            ps.move_rel(60, 0);
            ps.glyph(dev, "B").expect("B");
        });
        assert!(out.contains("(AB) 100 200 w\n"));
        assert_eq!(out.matches(" w\n").count(), 1);
    }

    #[test]
    fn jump_splits_the_show() {
        let out = run_ps(false, |ps, dev| {
            ps.set_font(dev, 3);
            ps.set_size(10);
            ps.glyph(dev, "A").expect("A");
            ps.move_rel(100, 0);
            ps.glyph(dev, "B").expect("B");
        });
        assert_eq!(out.matches(" w\n").count(), 2);
    }

    #[test]
    fn named_glyphs_use_glyphshow_runs() {
        let out = run_ps(false, |ps, dev| {
            ps.set_font(dev, 1);
            ps.set_size(10);
            ps.set_h(100);
            ps.set_v(200);
            ps.glyph(dev, "A").expect("A");
            ps.move_rel(72, 0);
            ps.glyph(dev, "B").expect("B");
        });
        assert!(out.contains("[/A/B] 100 200 g\n"));
    }

    #[test]
    fn gname_forces_name_show_for_numeric_ids() {
        let out = run_ps(true, |ps, dev| {
            ps.set_font(dev, 3);
            ps.set_size(10);
            ps.glyph(dev, "A").expect("A");
        });
        assert!(out.contains("[/65"));
    }

    #[test]
    fn control_and_reserved_codes_are_escaped() {
        let out = run_ps(false, |ps, dev| {
            ps.set_font(dev, 3);
            ps.set_size(10);
            ps.glyph(dev, "nl").expect("newline glyph");
            ps.move_rel(60, 0);
            ps.glyph(dev, "bs").expect("backslash glyph");
        });
        assert!(out.contains("(\\012\\\\)"));
    }

    #[test]
    fn trailer_lists_fonts_seen() {
        let out = run_ps(false, |ps, dev| {
            ps.set_font(dev, 1);
            ps.set_size(10);
            ps.glyph(dev, "A").expect("A");
            ps.set_font(dev, 3);
            ps.glyph(dev, "A").expect("A on P");
        });
        assert!(out.contains("%%DocumentFonts: Times-Roman Courier\n"));
        assert!(out.contains("10 /Times-Roman f\n"));
        assert!(out.contains("10 /Courier f\n"));
    }

    #[test]
    fn drawing_uses_prolog_procedures() {
        let out = run_ps(false, |ps, dev| {
            ps.set_size(10);
            ps.set_h(50);
            ps.set_v(60);
            ps.draw_begin(dev).expect("begin");
            ps.draw_line(10, 0).expect("line");
            ps.draw_end(false, false).expect("end");
        });
        assert!(out.contains("newpath 50 60 m 60 60 drawl stroke\n"));
    }
}
