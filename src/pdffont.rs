use crate::font::Font;
use crate::pdf::ObjWriter;
use log::warn;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

// Simple output fonts address glyphs with a single byte.
const SUBSET_SIZE: usize = 256;

// One output font resource: a 256-glyph page of a simple font, or the
// single wide resource of a CID font (index 0).
pub(crate) struct SubsetFont {
    pub index: usize,
    pub obj: usize,
    pub gbeg: usize,
    pub gend: usize,
}

// One source font as it appears in the output: shared descriptor,
// per-glyph subset assignment, and the subsets themselves. The
// description path is retained so the finalizer can reopen the font at
// trailer time, after the mounted copy may be long gone.
pub(crate) struct EmbeddedFont {
    name: String,
    path: Option<PathBuf>,
    desc: PathBuf,
    cid: bool,
    gmap: Vec<i32>,
    gpos: Vec<i32>,
    subs: Vec<SubsetFont>,
    desc_obj: usize,
}

pub(crate) struct EmbeddedFonts {
    fonts: Vec<EmbeddedFont>,
}

fn is_wide_program(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("ttf") | Some("otf")
    )
}

impl EmbeddedFonts {
    pub fn new() -> Self {
        EmbeddedFonts { fonts: Vec::new() }
    }

    // Finds or creates the resource for one glyph and widens its used
    // range. Returns a stable (font, subset) pair; the same glyph always
    // resolves to the same pair.
    pub fn resolve<W: Write>(
        &mut self,
        out: &mut ObjWriter<W>,
        font: &Font,
        gidx: usize,
    ) -> (usize, usize) {
        let fi = match self.fonts.iter().position(|f| f.name == font.fontname()) {
            Some(i) => i,
            None => {
                self.fonts.push(EmbeddedFont {
                    name: font.fontname().to_string(),
                    path: font.path().map(Path::to_path_buf),
                    desc: font.desc_path().to_path_buf(),
                    cid: font.path().is_some_and(is_wide_program),
                    gmap: vec![0; font.glyph_count()],
                    gpos: vec![0; font.glyph_count()],
                    subs: Vec::new(),
                    desc_obj: 0,
                });
                self.fonts.len() - 1
            }
        };
        let ef = &mut self.fonts[fi];
        if gidx >= ef.gmap.len() {
            ef.gmap.resize(gidx + 1, 0);
            ef.gpos.resize(gidx + 1, 0);
        }
        if ef.cid {
            if ef.subs.is_empty() {
                ef.subs.push(SubsetFont {
                    index: 0,
                    obj: out.alloc(),
                    gbeg: usize::MAX,
                    gend: 0,
                });
            }
            let code = font
                .glyph_at(gidx)
                .map(|g| g.code.max(0) as usize)
                .unwrap_or(0);
            let sub = &mut ef.subs[0];
            sub.gbeg = sub.gbeg.min(code);
            sub.gend = sub.gend.max(code);
            (fi, 0)
        } else {
            // Simple fonts address glyphs with one byte, so glyph i lives
            // in 256-glyph page i/256 at position i%256.
            let ix = gidx / SUBSET_SIZE + 1;
            let pos = gidx % SUBSET_SIZE;
            ef.gmap[gidx] = ix as i32;
            ef.gpos[gidx] = pos as i32;
            let si = match ef.subs.iter().position(|s| s.index == ix) {
                Some(si) => si,
                None => {
                    ef.subs.push(SubsetFont {
                        index: ix,
                        obj: out.alloc(),
                        gbeg: usize::MAX,
                        gend: 0,
                    });
                    ef.subs.len() - 1
                }
            };
            let sub = &mut ef.subs[si];
            sub.gbeg = sub.gbeg.min(pos);
            sub.gend = sub.gend.max(pos);
            (fi, ix)
        }
    }

    pub fn resource_name(&self, fi: usize, ix: usize) -> String {
        format!("{}.{}", self.fonts[fi].name, ix)
    }

    pub fn subset_obj(&self, fi: usize, ix: usize) -> usize {
        let ef = &self.fonts[fi];
        let want = if ef.cid { 0 } else { ix };
        ef.subs
            .iter()
            .find(|s| s.index == want)
            .map(|s| s.obj)
            .unwrap_or(0)
    }

    pub fn is_cid(&self, fi: usize) -> bool {
        self.fonts[fi].cid
    }

    pub fn glyph_code(&self, fi: usize, font: &Font, gidx: usize) -> u32 {
        let ef = &self.fonts[fi];
        if ef.cid {
            font.glyph_at(gidx).map(|g| g.code.max(0) as u32).unwrap_or(0)
        } else {
            ef.gpos.get(gidx).copied().unwrap_or(0) as u32
        }
    }

    // Writes every deferred font object: one descriptor per source font,
    // then the per-subset encoding and font dictionaries, with widths
    // taken from the final used ranges. Invoked once, at trailer time.
    pub fn finalize<W: Write>(&mut self, out: &mut ObjWriter<W>, res: i32) -> io::Result<()> {
        for fi in 0..self.fonts.len() {
            let reopened = Font::open(&self.fonts[fi].desc).ok();
            if reopened.is_none() {
                warn!(
                    "font description {} vanished; emitting empty widths",
                    self.fonts[fi].desc.display()
                );
            }
            self.fonts[fi].desc_obj = write_descriptor(out, &self.fonts[fi])?;
            let ef = &self.fonts[fi];
            for sub in &ef.subs {
                if ef.cid {
                    write_cid_font(out, ef, sub, reopened.as_ref(), res)?;
                } else {
                    write_simple_font(out, ef, sub, reopened.as_ref(), res)?;
                }
            }
        }
        Ok(())
    }
}

fn write_descriptor<W: Write>(out: &mut ObjWriter<W>, ef: &EmbeddedFont) -> io::Result<usize> {
    let program = match &ef.path {
        Some(p) => match std::fs::read(p) {
            Ok(data) => Some(data),
            Err(_) => {
                warn!("font program {} unreadable; not embedding it", p.display());
                None
            }
        },
        None => None,
    };
    let mut file_ref = None;
    if let Some(data) = program {
        if ef.cid {
            let hex = hex_stream(&data);
            let id = out.begin_obj(0)?;
            out.put(&format!(
                "<<\n  /Filter /ASCIIHexDecode\n  /Length {}\n  /Length1 {}\n>>\nstream\n",
                hex.len(),
                data.len()
            ))?;
            out.put(&hex)?;
            out.put("endstream\n")?;
            out.end_obj()?;
            file_ref = Some(("FontFile2", id));
        } else {
            let (body, l1, l2, l3) = type1_regions(data);
            let id = out.begin_obj(0)?;
            out.put(&format!(
                "<<\n  /Length {}\n  /Length1 {}\n  /Length2 {}\n  /Length3 {}\n>>\nstream\n",
                body.len(),
                l1,
                l2,
                l3
            ))?;
            out.put_bytes(&body)?;
            out.put("\nendstream\n")?;
            out.end_obj()?;
            file_ref = Some(("FontFile", id));
        }
    }
    let des = out.begin_obj(0)?;
    out.put("<<\n  /Type /FontDescriptor\n")?;
    out.put(&format!("  /FontName /{}\n", ef.name))?;
    out.put("  /Flags 4\n")?;
    out.put("  /FontBBox [ -1000 -1000 1000 1000 ]\n")?;
    out.put("  /MissingWidth 1000\n")?;
    out.put("  /StemV 100\n")?;
    out.put("  /ItalicAngle 0\n")?;
    out.put("  /CapHeight 100\n")?;
    out.put("  /Ascent 100\n")?;
    out.put("  /Descent 100\n")?;
    if let Some((key, id)) = file_ref {
        out.put(&format!("  /{} {} 0 R\n", key, id))?;
    }
    out.put(">>\n")?;
    out.end_obj()?;
    Ok(des)
}

fn hex_stream(data: &[u8]) -> String {
    let mut hex = String::with_capacity(data.len() * 2 + data.len() / 40 + 2);
    for (i, b) in data.iter().enumerate() {
        hex.push_str(&format!("{:02x}", b));
        if i % 40 == 39 && i + 1 != data.len() {
            hex.push('\n');
        }
    }
    hex.push_str(">\n");
    hex
}

// Splits a Type1 program into its clear-text, encrypted, and fixed-content
// regions. Segmented (PFB) programs carry explicit lengths; flat programs
// are split at the eexec keyword and at the trailing zeros run.
fn type1_regions(data: Vec<u8>) -> (Vec<u8>, usize, usize, usize) {
    if data.first() == Some(&0x80) {
        let mut body = Vec::with_capacity(data.len());
        let (mut l1, mut l2, mut l3) = (0usize, 0usize, 0usize);
        let mut seen_binary = false;
        let mut pos = 0;
        while pos + 6 <= data.len() && data[pos] == 0x80 {
            let kind = data[pos + 1];
            if kind == 3 {
                break;
            }
            let len = u32::from_le_bytes([
                data[pos + 2],
                data[pos + 3],
                data[pos + 4],
                data[pos + 5],
            ]) as usize;
            let end = (pos + 6 + len).min(data.len());
            let seg = &data[pos + 6..end];
            match kind {
                1 if seen_binary => l3 += seg.len(),
                1 => l1 += seg.len(),
                2 => {
                    seen_binary = true;
                    l2 += seg.len();
                }
                _ => {}
            }
            body.extend_from_slice(seg);
            pos = end;
        }
        return (body, l1, l2, l3);
    }
    let eexec = data
        .windows(5)
        .position(|w| w == b"eexec")
        .map(|i| {
            let mut p = i + 5;
            if data.get(p) == Some(&b'\r') {
                p += 1;
            }
            if data.get(p) == Some(&b'\n') {
                p += 1;
            }
            p
        });
    let Some(l1) = eexec else {
        let l1 = data.len();
        return (data, l1, 0, 0);
    };
    let mut boundary = data.len();
    if let Some(cm) = data
        .windows(11)
        .rposition(|w| w == b"cleartomark")
    {
        let mut b = cm;
        let mut zeros = 0;
        while b > l1 {
            match data[b - 1] {
                b'0' if zeros < 520 => {
                    zeros += 1;
                    b -= 1;
                }
                b'\n' | b'\r' | b' ' | b'\t' => b -= 1,
                _ => break,
            }
        }
        boundary = b;
    }
    let l2 = boundary.saturating_sub(l1);
    let l3 = data.len() - boundary;
    (data, l1, l2, l3)
}

fn write_simple_font<W: Write>(
    out: &mut ObjWriter<W>,
    ef: &EmbeddedFont,
    sub: &SubsetFont,
    font: Option<&Font>,
    res: i32,
) -> io::Result<()> {
    let mut map = [None::<usize>; SUBSET_SIZE];
    for (i, &s) in ef.gmap.iter().enumerate() {
        if s as usize == sub.index {
            map[ef.gpos[i] as usize] = Some(i);
        }
    }
    let enc = out.begin_obj(0)?;
    out.put("<<\n  /Type /Encoding\n  /Differences [ 0")?;
    for slot in &map {
        let id = slot
            .and_then(|i| font.and_then(|f| f.glyph_at(i)))
            .map(|g| g.id.as_str())
            .unwrap_or(".notdef");
        out.put(&format!(" /{}", id))?;
    }
    out.put(" ]\n>>\n")?;
    out.end_obj()?;

    let (first, last) = if sub.gbeg <= sub.gend {
        (sub.gbeg, sub.gend)
    } else {
        (0, 0)
    };
    out.begin_obj(sub.obj)?;
    out.put("<<\n  /Type /Font\n  /Subtype /Type1\n")?;
    out.put(&format!("  /BaseFont /{}\n", ef.name))?;
    out.put(&format!("  /FirstChar {}\n  /LastChar {}\n", first, last))?;
    out.put("  /Widths [")?;
    for code in first..=last {
        let wid = map[code]
            .and_then(|i| font.and_then(|f| f.glyph_at(i)))
            .map(|g| g.wid * res / 72)
            .unwrap_or(0);
        out.put(&format!(" {}", wid))?;
    }
    out.put(" ]\n")?;
    out.put(&format!("  /FontDescriptor {} 0 R\n", ef.desc_obj))?;
    out.put(&format!("  /Encoding {} 0 R\n", enc))?;
    out.put(">>\n")?;
    out.end_obj()?;
    Ok(())
}

fn write_cid_font<W: Write>(
    out: &mut ObjWriter<W>,
    ef: &EmbeddedFont,
    sub: &SubsetFont,
    font: Option<&Font>,
    res: i32,
) -> io::Result<()> {
    let (first, last) = if sub.gbeg <= sub.gend {
        (sub.gbeg, sub.gend)
    } else {
        (0, 0)
    };
    let mut widths = vec![0i32; last - first + 1];
    if let Some(f) = font {
        for g in f.glyphs() {
            let code = g.code.max(0) as usize;
            if code >= first && code <= last {
                widths[code - first] = g.wid * res / 72;
            }
        }
    }
    let cidf = out.begin_obj(0)?;
    out.put("<<\n  /Type /Font\n  /Subtype /CIDFontType2\n")?;
    out.put(&format!("  /BaseFont /{}\n", ef.name))?;
    out.put("  /CIDSystemInfo << /Registry (Adobe) /Ordering (Identity) /Supplement 0 >>\n")?;
    out.put(&format!("  /FontDescriptor {} 0 R\n", ef.desc_obj))?;
    out.put("  /DW 1000\n")?;
    out.put("  /CIDToGIDMap /Identity\n")?;
    out.put(&format!("  /W [ {} [", first))?;
    for w in &widths {
        out.put(&format!(" {}", w))?;
    }
    out.put(" ] ]\n")?;
    out.put(">>\n")?;
    out.end_obj()?;

    out.begin_obj(sub.obj)?;
    out.put("<<\n  /Type /Font\n  /Subtype /Type0\n")?;
    out.put(&format!("  /BaseFont /{}\n", ef.name))?;
    out.put("  /Encoding /Identity-H\n")?;
    out.put(&format!("  /DescendantFonts [ {} 0 R ]\n", cidf))?;
    out.put(">>\n")?;
    out.end_obj()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::font::tests::write_fixture;

    fn many_glyph_font() -> Font {
        let mut body = String::from("name X\nfontname Bigface\nspacewidth 20\ncharset\n");
        for i in 0..300 {
            body.push_str(&format!("g{} {} 0 g{}.id {}\n", i, 10 + i, i, i));
        }
        Font::open(&write_fixture("X", &body)).expect("open")
    }

    #[test]
    fn same_glyph_resolves_to_same_resource() {
        let font = many_glyph_font();
        let mut out = ObjWriter::new(Vec::new());
        let mut fonts = EmbeddedFonts::new();
        let a = fonts.resolve(&mut out, &font, 5);
        let ids_before = out.object_count();
        let b = fonts.resolve(&mut out, &font, 5);
        assert_eq!(a, b);
        assert_eq!(out.object_count(), ids_before);
    }

    #[test]
    fn glyphs_in_distinct_buckets_get_distinct_subsets() {
        let font = many_glyph_font();
        let mut out = ObjWriter::new(Vec::new());
        let mut fonts = EmbeddedFonts::new();
        let (fi, low) = fonts.resolve(&mut out, &font, 5);
        let (_, high) = fonts.resolve(&mut out, &font, 299);
        assert_eq!(low, 1);
        assert_eq!(high, 2);
        assert_ne!(fonts.subset_obj(fi, low), fonts.subset_obj(fi, high));
    }

    #[test]
    fn used_range_widens_monotonically() {
        let font = many_glyph_font();
        let mut out = ObjWriter::new(Vec::new());
        let mut fonts = EmbeddedFonts::new();
        fonts.resolve(&mut out, &font, 3);
        fonts.resolve(&mut out, &font, 7);
        fonts.resolve(&mut out, &font, 5);
        let sub = &fonts.fonts[0].subs[0];
        assert_eq!((sub.gbeg, sub.gend), (3, 7));
    }

    #[test]
    fn flat_type1_is_split_at_eexec_and_zeros() {
        let mut data = b"%!PS-AdobeFont-1.0\n/len 1 def\ncurrentfile eexec\n".to_vec();
        let l1 = data.len();
        data.extend_from_slice(&[0xA7; 64]);
        let l2 = 64;
        let zeros = "00000000000000000000000000000000\n".repeat(16);
        let tail_start = data.len();
        data.extend_from_slice(zeros.as_bytes());
        data.extend_from_slice(b"cleartomark\n");
        let total = data.len();
        let (body, r1, r2, r3) = type1_regions(data);
        assert_eq!(body.len(), total);
        assert_eq!((r1, r2, r3), (l1, l2, total - tail_start));
    }

    #[test]
    fn pfb_segments_are_concatenated_with_lengths() {
        let clear = b"%!PS-AdobeFont-1.0 eexec\n";
        let binary = [0x55u8; 10];
        let fixed = b"0000\ncleartomark\n";
        let mut data = Vec::new();
        for (kind, seg) in [(1u8, &clear[..]), (2, &binary[..]), (1, &fixed[..])] {
            data.push(0x80);
            data.push(kind);
            data.extend_from_slice(&(seg.len() as u32).to_le_bytes());
            data.extend_from_slice(seg);
        }
        data.extend_from_slice(&[0x80, 3]);
        let (body, l1, l2, l3) = type1_regions(data);
        assert_eq!(l1, clear.len());
        assert_eq!(l2, binary.len());
        assert_eq!(l3, fixed.len());
        assert_eq!(body.len(), l1 + l2 + l3);
    }

    #[test]
    fn finalize_without_program_embeds_no_font_file() {
        let font = many_glyph_font();
        let mut out = ObjWriter::new(Vec::new());
        let mut fonts = EmbeddedFonts::new();
        fonts.resolve(&mut out, &font, 0);
        fonts.resolve(&mut out, &font, 1);
        fonts.finalize(&mut out, 720).expect("finalize");
        let text = String::from_utf8(out.into_inner()).expect("utf8");
        assert!(text.contains("/FontDescriptor"));
        assert!(text.contains("/BaseFont /Bigface"));
        assert!(!text.contains("/FontFile"));
        // Widths for codes 0..=1: 10 and 11 device units scaled by 720/72.
        assert!(text.contains("/Widths [ 100 110 ]"));
    }
}
