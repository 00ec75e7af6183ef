use crate::color;
use crate::device::{Device, GlyphRef};
use crate::embed::{self, ObjKind};
use crate::output::{Bookmark, NamedDest, OutputDevice};
use crate::pdffont::EmbeddedFonts;
use log::{debug, warn};
use std::collections::HashMap;
use std::io::{self, Write};

// Per-page resource tables are bounded; entries past the cap are dropped
// rather than grown without limit.
const PAGE_ANNOTS_MAX: usize = 256;
const PAGE_XOBJS_MAX: usize = 256;

// Control-point ratio for approximating a quarter circle with one cubic.
const BEZIER_CIRCLE: i64 = 551915;

// Object allocator and byte-counting writer. Offsets recorded here become
// the cross-reference table, so every write must pass through it.
pub(crate) struct ObjWriter<W: Write> {
    w: W,
    pos: usize,
    offsets: Vec<usize>,
}

impl<W: Write> ObjWriter<W> {
    pub(crate) fn new(w: W) -> Self {
        ObjWriter {
            w,
            pos: 0,
            offsets: vec![0],
        }
    }

    pub(crate) fn alloc(&mut self) -> usize {
        self.offsets.push(0);
        self.offsets.len() - 1
    }

    pub(crate) fn put(&mut self, s: &str) -> io::Result<()> {
        self.put_bytes(s.as_bytes())
    }

    pub(crate) fn put_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.w.write_all(bytes)?;
        self.pos += bytes.len();
        Ok(())
    }

    // Starts an object definition, allocating when id is zero. The current
    // byte position becomes the object's xref offset.
    pub(crate) fn begin_obj(&mut self, id: usize) -> io::Result<usize> {
        let id = if id == 0 { self.alloc() } else { id };
        self.offsets[id] = self.pos;
        self.put(&format!("{} 0 obj\n", id))?;
        Ok(id)
    }

    pub(crate) fn end_obj(&mut self) -> io::Result<()> {
        self.put("endobj\n\n")
    }

    pub(crate) fn byte_pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn object_count(&self) -> usize {
        self.offsets.len()
    }

    pub(crate) fn offset_of(&self, id: usize) -> usize {
        self.offsets.get(id).copied().unwrap_or(0)
    }

    pub(crate) fn flush(&mut self) -> io::Result<()> {
        self.w.flush()
    }

    #[cfg(test)]
    pub(crate) fn into_inner(self) -> W {
        self.w
    }
}

// Thousandths, printed with a truncated three-digit fraction.
fn fmt_milli(n: i64) -> String {
    let sign = if n < 0 { "-" } else { "" };
    let n = n.abs();
    format!("{}{}.{:03}", sign, n / 1000, n % 1000)
}

fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '(' | ')' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// PDF text string: plain parenthesized ASCII when possible, otherwise
// UTF-16BE hex with a byte-order marker.
pub(crate) fn pdf_text_string(s: &str) -> String {
    let plain = s
        .bytes()
        .all(|b| b < 0x80 && b != b'(' && b != b')' && b != b'\\');
    if plain {
        return format!("({})", s);
    }
    let mut out = String::from("<FEFF");
    for c in s.chars() {
        let mut units = [0u16; 2];
        for unit in c.encode_utf16(&mut units) {
            out.push_str(&format!("{:04X}", unit));
        }
    }
    out.push('>');
    out
}

// Bookmark tree links derived from the flat leveled list: the parent is
// the nearest preceding mark with a strictly lower level, siblings are the
// nearest equal level with nothing lower in between.
pub(crate) fn mark_parent(levels: &[i32], i: usize) -> Option<usize> {
    (0..i).rev().find(|&j| levels[j] < levels[i])
}

pub(crate) fn mark_next(levels: &[i32], i: usize) -> Option<usize> {
    for j in i + 1..levels.len() {
        if levels[j] < levels[i] {
            return None;
        }
        if levels[j] == levels[i] {
            return Some(j);
        }
    }
    None
}

pub(crate) fn mark_prev(levels: &[i32], i: usize) -> Option<usize> {
    for j in (0..i).rev() {
        if levels[j] < levels[i] {
            return None;
        }
        if levels[j] == levels[i] {
            return Some(j);
        }
    }
    None
}

pub(crate) fn mark_first_child(levels: &[i32], i: usize) -> Option<usize> {
    (i + 1 < levels.len() && levels[i + 1] > levels[i]).then_some(i + 1)
}

pub(crate) fn mark_last_child(levels: &[i32], i: usize) -> Option<usize> {
    let mut last = None;
    for j in i + 1..levels.len() {
        if levels[j] <= levels[i] {
            break;
        }
        if mark_parent(levels, j) == Some(i) {
            last = Some(j);
        }
    }
    last
}

pub(crate) fn mark_descendants(levels: &[i32], i: usize) -> usize {
    (i + 1..levels.len())
        .take_while(|&j| levels[j] > levels[i])
        .count()
}

struct Annot {
    h: i32,
    v: i32,
    hwid: i32,
    vwid: i32,
    target: String,
}

pub struct PdfDevice<W: Write> {
    out: ObjWriter<W>,
    started: bool,
    root_id: usize,
    pages_id: usize,
    res: i32,
    linewidth: i32,
    page_width: i32,
    page_height: i32,
    title: Option<String>,
    info_keys: Vec<(String, String)>,
    fonts: EmbeddedFonts,

    page_ids: Vec<usize>,
    pg: String,
    in_page: bool,
    page_fonts: Vec<(usize, usize)>,
    page_xobjs: Vec<usize>,
    page_annots: Vec<Annot>,
    rotate: i32,

    o_f: usize,
    o_s: i32,
    o_m: u32,
    o_h: i32,
    o_v: i32,
    p_h: i32,
    p_v: i32,
    o_pf: i32,
    p_pf: i32,
    p_s: i32,
    p_m: u32,
    queued: bool,

    marks: Vec<Bookmark>,
    dests: Vec<NamedDest>,
}

impl<W: Write> PdfDevice<W> {
    pub fn new(w: W) -> Self {
        PdfDevice {
            out: ObjWriter::new(w),
            started: false,
            root_id: 0,
            pages_id: 0,
            res: 720,
            linewidth: 40,
            page_width: 612,
            page_height: 792,
            title: None,
            info_keys: Vec::new(),
            fonts: EmbeddedFonts::new(),
            page_ids: Vec::new(),
            pg: String::new(),
            in_page: false,
            page_fonts: Vec::new(),
            page_xobjs: Vec::new(),
            page_annots: Vec::new(),
            rotate: 0,
            o_f: 0,
            o_s: 0,
            o_m: 0,
            o_h: 0,
            o_v: 0,
            p_h: 0,
            p_v: 0,
            o_pf: 0,
            p_pf: 0,
            p_s: 0,
            p_m: 0,
            queued: false,
            marks: Vec::new(),
            dests: Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn into_writer(self) -> W {
        self.out.into_inner()
    }

    fn pdfx(&self, h: i32) -> i64 {
        h as i64 * 1000 * 72 / self.res as i64
    }

    fn pdfy(&self, v: i32) -> i64 {
        self.page_height as i64 * 1000 - v as i64 * 1000 * 72 / self.res as i64
    }

    fn pdfpos(&self, h: i32, v: i32) -> String {
        format!("{} {}", fmt_milli(self.pdfx(h)), fmt_milli(self.pdfy(v)))
    }

    fn pdfpos_milli(&self, hm: i64, vm: i64) -> String {
        // Like pdfpos but for intermediate points already in milli-units.
        let h = hm * 72 / self.res as i64;
        let v = self.page_height as i64 * 1000 - vm * 72 / self.res as i64;
        format!("{} {}", fmt_milli(h), fmt_milli(v))
    }

    fn pdfcolor(m: u32) -> String {
        let r = color::red(m) as i64 * 1000 / 255;
        let g = color::green(m) as i64 * 1000 / 255;
        let b = color::blue(m) as i64 * 1000 / 255;
        format!("{} {} {}", fmt_milli(r), fmt_milli(g), fmt_milli(b))
    }

    fn o_flush(&mut self) {
        if self.queued {
            self.pg.push_str("> Tj\n");
        }
        self.queued = false;
    }

    fn fontup(&mut self) {
        if self.o_m != self.p_m {
            self.o_flush();
            let c = Self::pdfcolor(self.o_m);
            self.pg.push_str(&format!("{} rg\n", c));
            self.p_m = self.o_m;
        }
        if self.o_pf != self.p_pf || self.o_s != self.p_s {
            let Some(&(fi, ix)) = usize::try_from(self.o_pf)
                .ok()
                .and_then(|i| self.page_fonts.get(i))
            else {
                return;
            };
            self.o_flush();
            let name = self.fonts.resource_name(fi, ix);
            self.pg
                .push_str(&format!("/{} {} Tf\n", name, self.o_s));
            self.p_pf = self.o_pf;
            self.p_s = self.o_s;
        }
    }

    fn load_page_font(&mut self, hit: &GlyphRef) -> usize {
        let key = self.fonts.resolve(&mut self.out, hit.font, hit.index);
        if let Some(i) = self.page_fonts.iter().position(|&e| e == key) {
            return i;
        }
        self.page_fonts.push(key);
        self.page_fonts.len() - 1
    }

    fn queue_glyph(&mut self, dev: &Device, hit: &GlyphRef) {
        if self.o_h != self.p_h || self.o_v != self.p_v {
            self.o_flush();
            let pos = self.pdfpos(self.o_h, self.o_v);
            self.pg.push_str(&format!("1 0 0 1 {} Tm\n", pos));
            self.p_h = self.o_h;
            self.p_v = self.o_v;
        }
        if !self.queued {
            self.pg.push('<');
        }
        self.queued = true;
        let Some(&(fi, _)) = usize::try_from(self.o_pf)
            .ok()
            .and_then(|i| self.page_fonts.get(i))
        else {
            return;
        };
        let code = self.fonts.glyph_code(fi, hit.font, hit.index);
        if self.fonts.is_cid(fi) {
            self.pg.push_str(&format!("{:04x}", code));
        } else {
            self.pg.push_str(&format!("{:02x}", code));
        }
        self.p_h += dev.charwid(hit.glyph.wid, self.o_s);
    }

    fn bezier_k(n: i32) -> i32 {
        (n as i64 * BEZIER_CIRCLE / 1_000_000) as i32
    }

    // Four cubic quadrants starting from the leftmost point, centre half a
    // span to the right; the local cursor advances half the span per call.
    fn ellipse_path(&mut self, w: i32, h: i32) {
        let (wa, wb) = (w / 2, w - w / 2);
        let (ha, hb) = (h / 2, h - h / 2);
        let (mut x, mut y) = (self.o_h, self.o_v);
        let quads = [
            (wa, -ha, true),
            (wb, ha, false),
            (-wb, hb, true),
            (-wa, -hb, false),
        ];
        for (dx, dy, vertical) in quads {
            let (c1x, c1y, c2x, c2y) = if vertical {
                (x, y + Self::bezier_k(dy), x + dx - Self::bezier_k(dx), y + dy)
            } else {
                (x + Self::bezier_k(dx), y, x + dx, y + dy - Self::bezier_k(dy))
            };
            let seg = format!(
                "{} {} {} c\n",
                self.pdfpos(c1x, c1y),
                self.pdfpos(c2x, c2y),
                self.pdfpos(x + dx, y + dy)
            );
            self.pg.push_str(&seg);
            x += dx;
            y += dy;
        }
    }

    fn first_page(data: &[u8]) -> Option<(usize, usize)> {
        let trailer = embed::trailer_pos(data)?;
        let root = embed::deref(data, embed::dict_val(data, trailer, b"/Root")?)?;
        let mut pages = embed::dict_val_resolved(data, root, b"/Pages")?;
        let mut page = pages;
        // Descend a possibly nested pages tree to the first leaf.
        for _ in 0..8 {
            let Some(kids) = embed::dict_val(data, page, b"/Kids") else {
                return Some((pages, page));
            };
            let kids = if embed::kind(data, kids) == Some(ObjKind::Ref) {
                embed::deref(data, kids)?
            } else {
                kids
            };
            let first = embed::list_val(data, kids, 0)?;
            pages = page;
            page = if embed::kind(data, first) == Some(ObjKind::Ref) {
                embed::deref(data, first)?
            } else {
                first
            };
        }
        None
    }

    fn page_content(data: &[u8], page: usize) -> Option<Vec<u8>> {
        let val = embed::dict_val(data, page, b"/Contents")?;
        let mut out = Vec::new();
        match embed::kind(data, val)? {
            ObjKind::Ref => {
                let (p, n) = embed::stream_data(data, embed::deref(data, val)?)?;
                out.extend_from_slice(&data[p..p + n]);
            }
            ObjKind::List => {
                for item in embed::list_items(data, val) {
                    let pos = if embed::kind(data, item) == Some(ObjKind::Ref) {
                        embed::deref(data, item)?
                    } else {
                        item
                    };
                    let (p, n) = embed::stream_data(data, pos)?;
                    out.extend_from_slice(&data[p..p + n]);
                    out.push(b'\n');
                }
            }
            _ => return None,
        }
        Some(out)
    }
}

// Deep-copies values out of a foreign document, re-allocating every
// indirect object it reaches. The old-to-new id map keeps shared and
// cyclic references from duplicating or recursing forever.
struct ObjCopier<'a> {
    src: &'a [u8],
    map: HashMap<(i64, i64), usize>,
}

impl ObjCopier<'_> {
    fn copy_val<W: Write>(
        &mut self,
        out: &mut ObjWriter<W>,
        pos: usize,
        depth: usize,
    ) -> io::Result<Vec<u8>> {
        if depth > 24 {
            return Ok(b"null".to_vec());
        }
        match embed::kind(self.src, pos) {
            Some(ObjKind::Ref) => match embed::read_ref(self.src, pos) {
                Some((obj, rev)) => {
                    let id = self.copy_indirect(out, obj, rev, depth + 1)?;
                    Ok(format!("{} 0 R", id).into_bytes())
                }
                None => Ok(b"null".to_vec()),
            },
            Some(ObjKind::Dict) => {
                let mut v = b"<<".to_vec();
                for (key, val) in embed::dict_pairs(self.src, pos) {
                    let klen = embed::skip_len(self.src, key);
                    v.push(b' ');
                    v.extend_from_slice(&self.src[key..key + klen]);
                    v.push(b' ');
                    v.extend_from_slice(&self.copy_val(out, val, depth + 1)?);
                }
                v.extend_from_slice(b" >>");
                Ok(v)
            }
            Some(ObjKind::List) => {
                let mut v = b"[".to_vec();
                for item in embed::list_items(self.src, pos) {
                    v.push(b' ');
                    v.extend_from_slice(&self.copy_val(out, item, depth + 1)?);
                }
                v.extend_from_slice(b" ]");
                Ok(v)
            }
            Some(_) => {
                let p = pos + embed::ws_len(self.src, pos);
                let len = embed::skip_len(self.src, p);
                Ok(self.src[p..(p + len).min(self.src.len())].to_vec())
            }
            None => Ok(b"null".to_vec()),
        }
    }

    fn copy_indirect<W: Write>(
        &mut self,
        out: &mut ObjWriter<W>,
        obj: i64,
        rev: i64,
        depth: usize,
    ) -> io::Result<usize> {
        if let Some(&id) = self.map.get(&(obj, rev)) {
            return Ok(id);
        }
        let id = out.alloc();
        self.map.insert((obj, rev), id);
        let body = match embed::find_obj(self.src, obj, rev) {
            Some(pos) => {
                let mut body = self.copy_val(out, pos, depth)?;
                if embed::kind(self.src, pos) == Some(ObjKind::Dict) {
                    if let Some((p, n)) = embed::stream_data(self.src, pos) {
                        body.extend_from_slice(b"\nstream\n");
                        body.extend_from_slice(&self.src[p..p + n]);
                        body.extend_from_slice(b"\nendstream");
                    }
                }
                body
            }
            None => b"null".to_vec(),
        };
        out.begin_obj(id)?;
        out.put_bytes(&body)?;
        out.put("\n")?;
        out.end_obj()?;
        Ok(id)
    }
}

impl<W: Write> OutputDevice for PdfDevice<W> {
    fn doc_begin(
        &mut self,
        dev: &Device,
        title: Option<&str>,
        pagewidth: i32,
        pageheight: i32,
        linewidth: i32,
    ) -> io::Result<()> {
        self.res = dev.res.max(1);
        self.linewidth = linewidth;
        self.page_width = (pagewidth * 72 + 127) / 254;
        self.page_height = (pageheight * 72 + 127) / 254;
        self.title = title.map(str::to_string);
        self.out.put("%PDF-1.6\n")?;
        self.root_id = self.out.alloc();
        self.pages_id = self.out.alloc();
        self.started = true;
        Ok(())
    }

    fn doc_end(&mut self, _pages: i32) -> io::Result<()> {
        if !self.started {
            return Ok(());
        }
        self.out.begin_obj(self.pages_id)?;
        self.out.put("<<\n  /Type /Pages\n")?;
        self.out.put(&format!(
            "  /MediaBox [ 0 0 {} {} ]\n",
            self.page_width, self.page_height
        ))?;
        self.out
            .put(&format!("  /Count {}\n", self.page_ids.len()))?;
        let kids: String = self
            .page_ids
            .iter()
            .map(|id| format!(" {} 0 R", id))
            .collect();
        self.out.put(&format!("  /Kids [{} ]\n", kids))?;
        self.out.put(">>\n")?;
        self.out.end_obj()?;

        let outline_root = if self.marks.is_empty() {
            None
        } else {
            Some(self.out.alloc())
        };
        let mut mark_ids = Vec::with_capacity(self.marks.len());
        for _ in 0..self.marks.len() {
            mark_ids.push(self.out.alloc());
        }
        let dests_id = if self.dests.is_empty() {
            None
        } else {
            Some(self.out.alloc())
        };

        self.out.begin_obj(self.root_id)?;
        self.out.put("<<\n  /Type /Catalog\n")?;
        self.out
            .put(&format!("  /Pages {} 0 R\n", self.pages_id))?;
        if let Some(id) = outline_root {
            self.out.put(&format!("  /Outlines {} 0 R\n", id))?;
        }
        if let Some(id) = dests_id {
            self.out.put(&format!("  /Dests {} 0 R\n", id))?;
        }
        self.out.put(">>\n")?;
        self.out.end_obj()?;

        let res = self.res;
        self.fonts.finalize(&mut self.out, res)?;

        if let Some(root) = outline_root {
            let levels: Vec<i32> = self.marks.iter().map(|m| m.level).collect();
            let marks = std::mem::take(&mut self.marks);
            for (i, mark) in marks.iter().enumerate() {
                self.out.begin_obj(mark_ids[i])?;
                self.out.put("<<\n")?;
                self.out
                    .put(&format!("  /Title {}\n", pdf_text_string(&mark.text)))?;
                let parent = match mark_parent(&levels, i) {
                    Some(p) => mark_ids[p],
                    None => root,
                };
                self.out.put(&format!("  /Parent {} 0 R\n", parent))?;
                if let Some(p) = mark_prev(&levels, i) {
                    self.out.put(&format!("  /Prev {} 0 R\n", mark_ids[p]))?;
                }
                if let Some(n) = mark_next(&levels, i) {
                    self.out.put(&format!("  /Next {} 0 R\n", mark_ids[n]))?;
                }
                if let Some(c) = mark_first_child(&levels, i) {
                    self.out.put(&format!("  /First {} 0 R\n", mark_ids[c]))?;
                }
                if let Some(c) = mark_last_child(&levels, i) {
                    self.out.put(&format!("  /Last {} 0 R\n", mark_ids[c]))?;
                }
                let kids = mark_descendants(&levels, i);
                if kids > 0 {
                    self.out.put(&format!("  /Count {}\n", kids))?;
                }
                let page = usize::try_from(mark.page - 1).ok();
                if let Some(&pid) = page.and_then(|p| self.page_ids.get(p)) {
                    self.out.put(&format!(
                        "  /Dest [ {} 0 R /XYZ 0 {} 0 ]\n",
                        pid,
                        fmt_milli(self.pdfy(mark.offset))
                    ))?;
                }
                self.out.put(">>\n")?;
                self.out.end_obj()?;
            }
            let first = mark_ids.first().copied().unwrap_or(root);
            let last_top = (0..levels.len())
                .filter(|&i| mark_parent(&levels, i).is_none())
                .next_back();
            let last = last_top.map(|i| mark_ids[i]).unwrap_or(first);
            self.out.begin_obj(root)?;
            self.out.put("<<\n  /Type /Outlines\n")?;
            self.out.put(&format!("  /First {} 0 R\n", first))?;
            self.out.put(&format!("  /Last {} 0 R\n", last))?;
            self.out.put(&format!("  /Count {}\n", levels.len()))?;
            self.out.put(">>\n")?;
            self.out.end_obj()?;
        }

        if let Some(id) = dests_id {
            let dests = std::mem::take(&mut self.dests);
            self.out.begin_obj(id)?;
            self.out.put("<<\n")?;
            for dest in &dests {
                let page = usize::try_from(dest.page - 1).ok();
                if let Some(&pid) = page.and_then(|p| self.page_ids.get(p)) {
                    self.out.put(&format!(
                        "  /{} [ {} 0 R /XYZ 0 {} 0 ]\n",
                        dest.text,
                        pid,
                        fmt_milli(self.pdfy(dest.offset))
                    ))?;
                }
            }
            self.out.put(">>\n")?;
            self.out.end_obj()?;
        }

        let info_id = self.out.begin_obj(0)?;
        self.out.put("<<\n")?;
        if let Some(title) = &self.title {
            self.out
                .put(&format!("  /Title {}\n", pdf_text_string(title)))?;
        }
        let info_keys = std::mem::take(&mut self.info_keys);
        for (key, value) in &info_keys {
            if key == "Title" && self.title.is_some() {
                continue;
            }
            self.out
                .put(&format!("  /{} {}\n", key, pdf_text_string(value)))?;
        }
        self.out.put("  /Creator (inkpost)\n")?;
        self.out.put("  /Producer (inkpost)\n")?;
        self.out.put(">>\n")?;
        self.out.end_obj()?;

        for id in 1..self.out.object_count() {
            if self.out.offset_of(id) == 0 {
                return Err(io::Error::other(format!(
                    "object {} allocated but never written",
                    id
                )));
            }
        }

        let count = self.out.object_count();
        let xref_off = self.out.byte_pos();
        self.out.put(&format!("xref\n0 {}\n", count))?;
        self.out.put("0000000000 65535 f \n")?;
        for id in 1..count {
            let line = format!("{:010} 00000 n \n", self.out.offset_of(id));
            self.out.put(&line)?;
        }
        self.out.put("trailer\n<<\n")?;
        self.out.put(&format!("  /Size {}\n", count))?;
        self.out.put(&format!("  /Root {} 0 R\n", self.root_id))?;
        self.out.put(&format!("  /Info {} 0 R\n", info_id))?;
        self.out.put(">>\n")?;
        self.out
            .put(&format!("startxref\n{}\n%%EOF\n", xref_off))?;
        Ok(())
    }

    fn page_begin(&mut self, _n: i32) -> io::Result<()> {
        self.pg.clear();
        self.pg.push_str("BT\n");
        self.in_page = true;
        self.page_fonts.clear();
        self.page_xobjs.clear();
        self.page_annots.clear();
        self.o_h = 0;
        self.o_v = 0;
        // Nothing has been shown yet, so the first run must set its
        // position explicitly.
        self.p_h = -1;
        self.p_v = -1;
        self.p_s = 0;
        self.p_m = 0;
        self.p_pf = -1;
        self.queued = false;
        Ok(())
    }

    fn page_end(&mut self, _n: i32) -> io::Result<()> {
        if !self.started || !self.in_page {
            return Ok(());
        }
        self.o_flush();
        self.pg.push_str("ET\n");
        let pg = std::mem::take(&mut self.pg);
        let cont = self.out.begin_obj(0)?;
        self.out
            .put(&format!("<<\n  /Length {}\n>>\nstream\n", pg.len()))?;
        self.out.put(&pg)?;
        self.out.put("endstream\n")?;
        self.out.end_obj()?;

        let annots = std::mem::take(&mut self.page_annots);
        let mut annot_ids = Vec::with_capacity(annots.len());
        for a in &annots {
            let id = self.out.begin_obj(0)?;
            let x1 = fmt_milli(self.pdfx(a.h));
            let y1 = fmt_milli(self.pdfy(a.v));
            let x2 = fmt_milli(self.pdfx(a.h + a.hwid));
            let y2 = fmt_milli(self.pdfy(a.v - a.vwid));
            self.out.put("<<\n  /Type /Annot\n  /Subtype /Link\n")?;
            self.out
                .put(&format!("  /Rect [ {} {} {} {} ]\n", x1, y1, x2, y2))?;
            self.out.put("  /Border [ 0 0 0 ]\n")?;
            if let Some(name) = a.target.strip_prefix('#') {
                self.out.put(&format!("  /Dest /{}\n", name))?;
            } else {
                self.out.put(&format!(
                    "  /A << /Type /Action /S /URI /URI ({}) >>\n",
                    escape_string(&a.target)
                ))?;
            }
            self.out.put(">>\n")?;
            self.out.end_obj()?;
            annot_ids.push(id);
        }

        let font_entries: String = self
            .page_fonts
            .iter()
            .map(|&(fi, ix)| {
                format!(
                    " /{} {} 0 R",
                    self.fonts.resource_name(fi, ix),
                    self.fonts.subset_obj(fi, ix)
                )
            })
            .collect();
        let page_id = self.out.begin_obj(0)?;
        self.page_ids.push(page_id);
        self.out.put("<<\n  /Type /Page\n")?;
        self.out
            .put(&format!("  /Parent {} 0 R\n", self.pages_id))?;
        self.out.put("  /Resources <<\n")?;
        self.out
            .put(&format!("    /Font <<{} >>\n", font_entries))?;
        if !self.page_xobjs.is_empty() {
            let xobjs: String = self
                .page_xobjs
                .iter()
                .map(|id| format!(" /FO{} {} 0 R", id, id))
                .collect();
            self.out.put(&format!("    /XObject <<{} >>\n", xobjs))?;
        }
        self.out.put("  >>\n")?;
        self.out.put(&format!("  /Contents {} 0 R\n", cont))?;
        if !annot_ids.is_empty() {
            let ids: String = annot_ids.iter().map(|id| format!(" {} 0 R", id)).collect();
            self.out.put(&format!("  /Annots [{} ]\n", ids))?;
        }
        if self.rotate != 0 {
            self.out.put(&format!("  /Rotate {}\n", self.rotate))?;
        }
        self.out.put(">>\n")?;
        self.out.end_obj()?;
        self.in_page = false;
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

    fn set_font(&mut self, dev: &Device, pos: usize) {
        if dev.font(pos).is_some() {
            self.o_f = pos;
        }
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
        self.rotate = deg;
    }

    fn font_mounted(&mut self, _pos: usize) {
        self.p_pf = -1;
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
        self.o_pf = self.load_page_font(&hit) as i32;
        self.fontup();
        self.queue_glyph(dev, &hit);
        Ok(())
    }

    fn draw_begin(&mut self, _dev: &Device) -> io::Result<()> {
        self.o_flush();
        self.fontup();
        let pos = self.pdfpos(self.o_h, self.o_v);
        self.pg.push_str(&format!("{} m\n", pos));
        Ok(())
    }

    fn draw_end(&mut self, close: bool, fill: bool) -> io::Result<()> {
        if fill {
            self.pg.push_str("f\n");
        } else {
            let c = Self::pdfcolor(self.o_m);
            self.pg.push_str(&format!("{} RG\n", c));
            // Stroke width follows the em: size * linewidth / 1000 points.
            let lw = fmt_milli(self.o_s as i64 * self.linewidth as i64);
            self.pg.push_str(&format!("{} w\n", lw));
            self.pg.push_str(if close { "s\n" } else { "S\n" });
        }
        Ok(())
    }

    fn draw_line(&mut self, h: i32, v: i32) -> io::Result<()> {
        self.o_flush();
        self.move_rel(h, v);
        let pos = self.pdfpos(self.o_h, self.o_v);
        self.pg.push_str(&format!("{} l\n", pos));
        Ok(())
    }

    fn draw_circle(&mut self, d: i32) -> io::Result<()> {
        self.o_flush();
        self.ellipse_path(d, d);
        self.move_rel(d, 0);
        Ok(())
    }

    fn draw_ellipse(&mut self, h: i32, v: i32) -> io::Result<()> {
        self.o_flush();
        self.ellipse_path(h, v);
        self.move_rel(h, 0);
        Ok(())
    }

    // Arcs degrade to a line toward the endpoint in the PDF family.
    fn draw_arc(&mut self, h1: i32, v1: i32, h2: i32, v2: i32) -> io::Result<()> {
        self.draw_line(h1 + h2, v1 + v2)
    }

    fn draw_spline(&mut self, h1: i32, v1: i32, h2: i32, v2: i32) -> io::Result<()> {
        self.o_flush();
        let (x0, y0) = (self.o_h as i64 * 1000, self.o_v as i64 * 1000);
        let (x1, y1) = (x0 + h1 as i64 * 1000, y0 + v1 as i64 * 1000);
        let (x2, y2) = (x1 + h2 as i64 * 1000, y1 + v2 as i64 * 1000);
        let c1 = ((x0 + 5 * x1) / 6, (y0 + 5 * y1) / 6);
        let c2 = ((x2 + 5 * x1) / 6, (y2 + 5 * y1) / 6);
        let end = ((x1 + x2) / 2, (y1 + y2) / 2);
        let seg = format!(
            "{} {} {} c\n",
            self.pdfpos_milli(c1.0, c1.1),
            self.pdfpos_milli(c2.0, c2.1),
            self.pdfpos_milli(end.0, end.1)
        );
        self.pg.push_str(&seg);
        self.move_rel(h1, v1);
        Ok(())
    }

    fn draw_marked_begin(&mut self, _dev: &Device, _arg: &str) -> io::Result<()> {
        Ok(())
    }

    fn draw_marked_end(&mut self, _arg: &str) -> io::Result<()> {
        Ok(())
    }

    fn raw(&mut self, line: &str) -> io::Result<()> {
        self.o_flush();
        debug!("raw postscript has no pdf rendition: {}", line);
        Ok(())
    }

    fn set_param(&mut self, key: &str, value: &str) -> io::Result<()> {
        match key {
            "linecap" => {
                self.o_flush();
                self.pg.push_str(&format!("{} J\n", value));
            }
            "linejoin" => {
                self.o_flush();
                self.pg.push_str(&format!("{} j\n", value));
            }
            _ => debug!("ignoring device parameter {}={}", key, value),
        }
        Ok(())
    }

    fn include_pdf(&mut self, path: &str, hwid: i32, vwid: i32) -> io::Result<()> {
        if !self.in_page {
            warn!("{}: pdf inclusion outside a page; skipping", path);
            return Ok(());
        }
        if self.page_xobjs.len() >= PAGE_XOBJS_MAX {
            warn!("{}: too many xobjects on this page; skipping", path);
            return Ok(());
        }
        let Ok(data) = std::fs::read(path) else {
            warn!("{}: cannot read; skipping inclusion", path);
            return Ok(());
        };
        let Some((pages, page)) = Self::first_page(&data) else {
            warn!("{}: not a usable pdf; skipping inclusion", path);
            return Ok(());
        };
        let mediabox = embed::dict_val_resolved(&data, page, b"/MediaBox")
            .or_else(|| embed::dict_val_resolved(&data, pages, b"/MediaBox"));
        let bbox: Option<Vec<f64>> = mediabox.map(|mb| {
            (0..4)
                .filter_map(|i| embed::list_val(&data, mb, i))
                .map(|p| embed::real_at(&data, p))
                .collect()
        });
        let Some(bbox) = bbox.filter(|b| b.len() == 4) else {
            warn!("{}: no media box; skipping inclusion", path);
            return Ok(());
        };
        let (bw, bh) = (bbox[2] - bbox[0], bbox[3] - bbox[1]);
        if bw <= 0.0 || bh <= 0.0 {
            warn!("{}: degenerate media box; skipping inclusion", path);
            return Ok(());
        }
        let Some(content) = Self::page_content(&data, page) else {
            warn!("{}: no page contents; skipping inclusion", path);
            return Ok(());
        };

        let mut copier = ObjCopier {
            src: &data,
            map: HashMap::new(),
        };
        let resources = embed::dict_val(&data, page, b"/Resources")
            .or_else(|| embed::dict_val(&data, pages, b"/Resources"));
        let resources = match resources {
            Some(pos) => copier.copy_val(&mut self.out, pos, 0)?,
            None => b"<< >>".to_vec(),
        };

        let form = self.out.begin_obj(0)?;
        self.out
            .put("<<\n  /Type /XObject\n  /Subtype /Form\n  /FormType 1\n")?;
        self.out.put(&format!(
            "  /BBox [ {} {} {} {} ]\n",
            bbox[0], bbox[1], bbox[2], bbox[3]
        ))?;
        self.out.put("  /Resources ")?;
        self.out.put_bytes(&resources)?;
        self.out.put("\n")?;
        self.out
            .put(&format!("  /Length {}\n>>\nstream\n", content.len()))?;
        self.out.put_bytes(&content)?;
        self.out.put("\nendstream\n")?;
        self.out.end_obj()?;
        self.page_xobjs.push(form);

        let wpt = hwid as f64 * 72.0 / self.res as f64;
        let hpt = vwid as f64 * 72.0 / self.res as f64;
        let (wpt, hpt) = match (hwid > 0, vwid > 0) {
            (true, true) => (wpt, hpt),
            (true, false) => (wpt, wpt * bh / bw),
            (false, true) => (hpt * bw / bh, hpt),
            (false, false) => (bw, bh),
        };
        let (sx, sy) = (wpt / bw, hpt / bh);
        let x = self.pdfx(self.o_h) as f64 / 1000.0;
        let y = self.pdfy(self.o_v) as f64 / 1000.0;
        let (tx, ty) = (x - bbox[0] * sx, y - bbox[1] * sy);
        self.o_flush();
        self.pg.push_str(&format!(
            "q\n{:.4} 0 0 {:.4} {:.4} {:.4} cm\n/FO{} Do\nQ\n",
            sx, sy, tx, ty, form
        ));
        Ok(())
    }

    fn include_eps(&mut self, path: &str, _hwid: i32, _vwid: i32) -> io::Result<()> {
        warn!("{}: eps inclusion has no pdf rendition; skipping", path);
        Ok(())
    }

    fn link(&mut self, target: &str, hwid: i32, vwid: i32) {
        if !self.in_page {
            return;
        }
        if self.page_annots.len() >= PAGE_ANNOTS_MAX {
            warn!("too many annotations on this page; dropping link {}", target);
            return;
        }
        self.page_annots.push(Annot {
            h: self.o_h,
            v: self.o_v,
            hwid,
            vwid,
            target: target.to_string(),
        });
    }

    fn info(&mut self, key: &str, value: &str) {
        self.info_keys.push((key.to_string(), value.to_string()));
    }

    fn set_bookmarks(&mut self, marks: Vec<Bookmark>) {
        self.marks = marks;
    }

    fn set_named_dests(&mut self, names: Vec<NamedDest>) {
        self.dests = names;
    }

    fn finish(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::open_mounted;

    fn begin_doc(dev: &Device) -> PdfDevice<Vec<u8>> {
        let mut pdf = PdfDevice::new(Vec::new());
        pdf.doc_begin(dev, None, 2159, 2794, 40).expect("doc begin");
        pdf
    }

    fn into_bytes(mut pdf: PdfDevice<Vec<u8>>, pages: i32) -> Vec<u8> {
        pdf.doc_end(pages).expect("doc end");
        pdf.out.into_inner()
    }

    fn content_stream(bytes: &[u8]) -> String {
        let text = String::from_utf8_lossy(bytes);
        let start = text.find("stream\n").expect("stream start") + 7;
        let end = text[start..].find("endstream").expect("stream end") + start;
        text[start..end].to_string()
    }

    #[test]
    fn milli_formatting_truncates() {
        assert_eq!(fmt_milli(12345), "12.345");
        assert_eq!(fmt_milli(-250), "-0.250");
        assert_eq!(fmt_milli(0), "0.000");
    }

    #[test]
    fn text_strings_use_utf16_when_needed() {
        assert_eq!(pdf_text_string("Plain Title"), "(Plain Title)");
        assert_eq!(pdf_text_string("a(b"), "<FEFF006100280062>");
        assert_eq!(pdf_text_string("é"), "<FEFF00E9>");
        // Astral characters become surrogate pairs.
        assert_eq!(pdf_text_string("𝕏"), "<FEFFD835DD4F>");
    }

    #[test]
    fn two_glyphs_one_run() {
        let dev = open_mounted();
        let mut pdf = begin_doc(&dev);
        pdf.page_begin(1).expect("page");
        pdf.set_font(&dev, 1);
        pdf.set_size(10);
        pdf.glyph(&dev, "A").expect("glyph A");
        // A is 72 units wide at size 10, so this move is continuous.
        pdf.move_rel(72, 0);
        pdf.glyph(&dev, "B").expect("glyph B");
        pdf.page_end(1).expect("page end");
        let bytes = into_bytes(pdf, 1);
        let content = content_stream(&bytes);
        assert_eq!(content.matches(" Tf").count(), 1);
        assert_eq!(content.matches(" Tm").count(), 1);
        assert_eq!(content.matches(" Tj").count(), 1);
        assert!(content.contains("<0001> Tj"));
    }

    #[test]
    fn discontinuous_jump_splits_the_run() {
        let dev = open_mounted();
        let mut pdf = begin_doc(&dev);
        pdf.page_begin(1).expect("page");
        pdf.set_font(&dev, 1);
        pdf.set_size(10);
        pdf.glyph(&dev, "A").expect("glyph A");
        pdf.move_rel(100, 0);
        pdf.glyph(&dev, "B").expect("glyph B");
        pdf.page_end(1).expect("page end");
        let content = content_stream(&into_bytes(pdf, 1));
        assert_eq!(content.matches(" Tj").count(), 2);
        assert_eq!(content.matches(" Tm").count(), 2);
    }

    #[test]
    fn empty_page_is_wrapper_only() {
        let dev = open_mounted();
        let mut pdf = begin_doc(&dev);
        pdf.page_begin(1).expect("page");
        pdf.page_end(1).expect("page end");
        let bytes = into_bytes(pdf, 1);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("/Length 6"));
        assert!(text.contains("BT\nET\n"));
        assert!(text.contains("/Font << >>"));
    }

    #[test]
    fn xref_offsets_point_at_object_headers() {
        let dev = open_mounted();
        let mut pdf = begin_doc(&dev);
        pdf.page_begin(1).expect("page");
        pdf.set_font(&dev, 1);
        pdf.set_size(10);
        pdf.glyph(&dev, "A").expect("glyph");
        pdf.page_end(1).expect("page end");
        let bytes = into_bytes(pdf, 1);
        let text = String::from_utf8_lossy(&bytes).to_string();
        let sx = text.rfind("startxref\n").expect("startxref");
        let table: usize = text[sx + 10..]
            .lines()
            .next()
            .expect("offset line")
            .trim()
            .parse()
            .expect("xref offset");
        let mut lines = text[table..].lines();
        assert_eq!(lines.next(), Some("xref"));
        let count: usize = lines
            .next()
            .expect("subsection")
            .split_whitespace()
            .nth(1)
            .expect("count")
            .parse()
            .expect("count parses");
        assert!(lines.next().expect("free entry").starts_with("0000000000 65535 f"));
        for id in 1..count {
            let off: usize = lines
                .next()
                .expect("entry")
                .split_whitespace()
                .next()
                .expect("offset field")
                .parse()
                .expect("offset parses");
            let header = format!("{} 0 obj\n", id);
            assert!(
                bytes[off..].starts_with(header.as_bytes()),
                "object {} offset mismatch",
                id
            );
        }
    }

    #[test]
    fn generated_document_parses_with_lopdf() {
        let dev = open_mounted();
        let mut pdf = begin_doc(&dev);
        for page in 1..=2 {
            pdf.page_begin(page).expect("page");
            pdf.set_font(&dev, 1);
            pdf.set_size(10);
            pdf.glyph(&dev, "A").expect("glyph");
            pdf.page_end(page).expect("page end");
        }
        let bytes = into_bytes(pdf, 2);
        let doc = lopdf::Document::load_mem(&bytes).expect("valid pdf");
        assert_eq!(doc.get_pages().len(), 2);
    }

    #[test]
    fn spline_with_zero_tail_degrades_to_the_line_endpoint() {
        let dev = open_mounted();
        let mut pdf = begin_doc(&dev);
        pdf.page_begin(1).expect("page");
        pdf.draw_begin(&dev).expect("draw begin");
        pdf.draw_spline(60, 30, 0, 0).expect("spline");
        pdf.draw_end(false, false).expect("draw end");
        pdf.page_end(1).expect("page end");
        let content = content_stream(&into_bytes(pdf, 1));
        let curve = content
            .lines()
            .find(|l| l.ends_with(" c"))
            .expect("curve emitted");
        let fields: Vec<&str> = curve.split_whitespace().collect();
        // The endpoint (last coordinate pair) must equal pdfpos(60, 30):
        // 60 units at 720dpi is 6pt, and the letter page is 792pt tall.
        assert_eq!(fields[4], "6.000");
        assert_eq!(fields[5], "789.000");
    }

    #[test]
    fn malformed_inclusion_is_skipped() {
        let dev = open_mounted();
        let dir = std::env::temp_dir().join(format!(
            "inkpost_pdf_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let bogus = dir.join("not-a-pdf.bin");
        std::fs::write(&bogus, b"garbage bytes").expect("write");

        let mut pdf = begin_doc(&dev);
        pdf.page_begin(1).expect("page");
        pdf.set_h(100);
        pdf.set_v(200);
        let objects_before = pdf.out.object_count();
        pdf.include_pdf(bogus.to_str().expect("path"), 720, 0)
            .expect("inclusion must not error");
        assert_eq!(pdf.out.object_count(), objects_before);
        assert_eq!((pdf.o_h, pdf.o_v), (100, 200));
        pdf.page_end(1).expect("page end");
        let bytes = into_bytes(pdf, 1);
        assert!(lopdf::Document::load_mem(&bytes).is_ok());
    }

    #[test]
    fn bookmark_links_follow_the_level_derivation() {
        let levels = [0, 1, 1, 2, 0];
        assert_eq!(mark_parent(&levels, 1), Some(0));
        assert_eq!(mark_parent(&levels, 2), Some(0));
        assert_eq!(mark_parent(&levels, 3), Some(2));
        assert_eq!(mark_parent(&levels, 4), None);
        assert_eq!(mark_first_child(&levels, 0), Some(1));
        assert_eq!(mark_last_child(&levels, 0), Some(2));
        assert_eq!(mark_first_child(&levels, 2), Some(3));
        assert_eq!(mark_last_child(&levels, 2), Some(3));
        assert_eq!(mark_next(&levels, 1), Some(2));
        assert_eq!(mark_next(&levels, 2), None);
        assert_eq!(mark_prev(&levels, 2), Some(1));
        assert_eq!(mark_next(&levels, 0), Some(4));
        assert_eq!(mark_descendants(&levels, 0), 3);
        assert_eq!(mark_descendants(&levels, 2), 1);
    }

    #[test]
    fn bookmarks_and_dests_reach_the_catalog() {
        let dev = open_mounted();
        let mut pdf = begin_doc(&dev);
        pdf.page_begin(1).expect("page");
        pdf.page_end(1).expect("page end");
        pdf.set_bookmarks(vec![
            Bookmark { text: "One".into(), page: 1, offset: 0, level: 0 },
            Bookmark { text: "Sub".into(), page: 1, offset: 100, level: 1 },
        ]);
        pdf.set_named_dests(vec![NamedDest {
            text: "intro".into(),
            page: 1,
            offset: 0,
        }]);
        let bytes = into_bytes(pdf, 1);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("/Outlines"));
        assert!(text.contains("/Title (One)"));
        assert!(text.contains("/Dests"));
        assert!(text.contains("/intro [ "));
        assert!(lopdf::Document::load_mem(&bytes).is_ok());
    }

    #[test]
    fn include_own_output_as_form_xobject() {
        let dev = open_mounted();
        let mut inner = begin_doc(&dev);
        inner.page_begin(1).expect("page");
        inner.page_end(1).expect("page end");
        let inner_bytes = into_bytes(inner, 1);
        let dir = std::env::temp_dir().join(format!(
            "inkpost_incl_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let inner_path = dir.join("inner.pdf");
        std::fs::write(&inner_path, &inner_bytes).expect("write");

        let mut outer = begin_doc(&dev);
        outer.page_begin(1).expect("page");
        outer.set_h(720);
        outer.set_v(1440);
        outer
            .include_pdf(inner_path.to_str().expect("path"), 1440, 0)
            .expect("include");
        outer.page_end(1).expect("page end");
        let bytes = into_bytes(outer, 1);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("/Subtype /Form"));
        assert!(text.contains(" Do\nQ"));
        assert!(text.contains("/XObject <<"));
        assert!(lopdf::Document::load_mem(&bytes).is_ok());
    }
}
