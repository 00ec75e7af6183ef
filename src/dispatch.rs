use crate::color;
use crate::device::Device;
use crate::error::InkpostError;
use crate::output::{Bookmark, NamedDest, OutputDevice};
use log::{debug, warn};
use std::io::{BufRead, Read};
use std::path::PathBuf;

pub struct DriverOptions {
    pub font_dir: PathBuf,
    pub device: String,
    pub title: Option<String>,
    // Page size in tenths of a millimetre.
    pub pagewidth: i32,
    pub pageheight: i32,
    // Drawing line thickness in thousandths of an em.
    pub linewidth: i32,
}

impl Default for DriverOptions {
    fn default() -> Self {
        DriverOptions {
            font_dir: PathBuf::from("/usr/share/inkpost/font"),
            device: "utf".to_string(),
            title: None,
            pagewidth: 2159,
            pageheight: 2794,
            linewidth: 40,
        }
    }
}

// Byte reader with one-byte pushback, the shape the command language was
// designed around.
struct Tokens<R: BufRead> {
    r: R,
    peeked: Option<u8>,
}

impl<R: BufRead> Tokens<R> {
    fn new(r: R) -> Self {
        Tokens { r, peeked: None }
    }

    fn next(&mut self) -> Option<u8> {
        if let Some(b) = self.peeked.take() {
            return Some(b);
        }
        let mut buf = [0u8; 1];
        match self.r.read(&mut buf) {
            Ok(1) => Some(buf[0]),
            _ => None,
        }
    }

    fn back(&mut self, b: u8) {
        self.peeked = Some(b);
    }

    fn skip_space(&mut self) {
        while let Some(b) = self.next() {
            if !b.is_ascii_whitespace() {
                self.back(b);
                break;
            }
        }
    }

    fn num(&mut self) -> i32 {
        self.skip_space();
        let mut n: i32 = 0;
        let mut neg = false;
        while let Some(b) = self.next() {
            if n == 0 && (b == b'-' || b == b'+') {
                neg = b == b'-';
                continue;
            }
            if !b.is_ascii_digit() {
                self.back(b);
                break;
            }
            n = n.wrapping_mul(10).wrapping_add((b - b'0') as i32);
        }
        if neg { -n } else { n }
    }

    // Like num but only blanks are skipped and absence is reported, so
    // drawing loops can stop at the end of their own line.
    fn read_num(&mut self) -> Option<i32> {
        while let Some(b) = self.next() {
            if b != b' ' {
                self.back(b);
                break;
            }
        }
        match self.peeked {
            Some(b) if b == b'-' || b == b'+' || b.is_ascii_digit() => Some(self.num()),
            _ => None,
        }
    }

    fn is_eol(&mut self) -> bool {
        while let Some(b) = self.next() {
            if b != b' ' {
                self.back(b);
                return b == b'\n';
            }
        }
        true
    }

    fn skip_line(&mut self) {
        while let Some(b) = self.next() {
            if b == b'\n' {
                break;
            }
        }
    }

    fn word(&mut self) -> String {
        self.skip_space();
        let mut s = Vec::new();
        while let Some(b) = self.next() {
            if b.is_ascii_whitespace() {
                self.back(b);
                break;
            }
            s.push(b);
        }
        String::from_utf8_lossy(&s).into_owned()
    }

    fn rest_of_line(&mut self) -> String {
        let mut s = Vec::new();
        while let Some(b) = self.next() {
            if b == b'\n' {
                self.back(b);
                break;
            }
            s.push(b);
        }
        String::from_utf8_lossy(&s).into_owned()
    }

    fn utf8_char(&mut self) -> String {
        let Some(c) = self.next() else {
            return String::new();
        };
        let len = if c & 0xc0 != 0xc0 {
            1
        } else if c & 0x20 == 0 {
            2
        } else if c & 0x10 == 0 {
            3
        } else if c & 0x08 == 0 {
            4
        } else {
            1
        };
        let mut bytes = vec![c];
        for _ in 1..len {
            match self.next() {
                Some(b) => bytes.push(b),
                None => break,
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

// Splits one argument off `src`: either a double-quoted span (with ""
// escaping a literal quote) or a blank-delimited word.
fn strcut(src: &str) -> (String, &str) {
    let src = src.trim_start_matches([' ', '\n']);
    if let Some(rest) = src.strip_prefix('"') {
        let mut out = String::new();
        let mut chars = rest.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == '"' {
                if chars.peek().map(|&(_, c2)| c2) == Some('"') {
                    out.push('"');
                    chars.next();
                } else {
                    return (out, &rest[i + 1..]);
                }
            } else {
                out.push(c);
            }
        }
        (out, "")
    } else {
        match src.find([' ', '\n']) {
            Some(i) => (src[..i].to_string(), &src[i..]),
            None => (src.to_string(), ""),
        }
    }
}

struct Driver<'a, R: BufRead> {
    t: Tokens<R>,
    out: &'a mut dyn OutputDevice,
    opts: &'a DriverOptions,
    dev: Option<Device>,
    devname: String,
    pages: i32,
    marks: Vec<Bookmark>,
    names: Vec<NamedDest>,
}

// Consumes the whole device-language stream, driving the backend, and
// finishes the document. Returns the number of pages.
pub fn run<R: BufRead>(
    input: R,
    out: &mut dyn OutputDevice,
    opts: &DriverOptions,
) -> Result<i32, InkpostError> {
    let mut driver = Driver {
        t: Tokens::new(input),
        out,
        opts,
        dev: None,
        devname: opts.device.clone(),
        pages: 0,
        marks: Vec::new(),
        names: Vec::new(),
    };
    while let Some(c) = driver.t.next() {
        if !c.is_ascii_whitespace() {
            driver.command(c)?;
        }
    }
    let Driver {
        out, pages, marks, names, ..
    } = driver;
    if pages > 0 {
        out.page_end(pages)?;
    }
    out.set_bookmarks(marks);
    out.set_named_dests(names);
    out.doc_end(pages)?;
    out.finish()?;
    Ok(pages)
}

impl<R: BufRead> Driver<'_, R> {
    fn command(&mut self, c: u8) -> Result<(), InkpostError> {
        match c {
            b'0'..=b'9' => {
                let d2 = self
                    .t
                    .next()
                    .filter(|b| b.is_ascii_digit())
                    .map(|b| (b - b'0') as i32)
                    .unwrap_or(0);
                self.out.move_rel((c - b'0') as i32 * 10 + d2, 0);
                let g = self.t.utf8_char();
                self.glyph(&g)?;
            }
            b's' => {
                let n = self.t.num();
                self.out.set_size(n);
            }
            b'f' => {
                let n = self.t.num();
                if let Some(dev) = &self.dev {
                    if n >= 0 {
                        self.out.set_font(dev, n as usize);
                    }
                }
            }
            b'H' => {
                let n = self.t.num();
                self.out.set_h(n);
            }
            b'V' => {
                let n = self.t.num();
                self.out.set_v(n);
            }
            b'h' => {
                let n = self.t.num();
                self.out.move_rel(n, 0);
            }
            b'v' => {
                let n = self.t.num();
                self.out.move_rel(0, n);
            }
            b'c' => {
                let g = self.t.utf8_char();
                self.glyph(&g)?;
            }
            b'C' => {
                let g = self.t.word();
                self.glyph(&g)?;
            }
            b'm' => {
                let w = self.t.word();
                match color::parse(&w) {
                    Some(m) => self.out.set_color(m),
                    None => debug!("unknown color {}", w),
                }
            }
            b'N' => {
                self.t.num();
            }
            b'p' => {
                if self.pages > 0 {
                    self.out.page_end(self.pages)?;
                }
                self.pages = self.t.num();
                self.out.page_begin(self.pages)?;
            }
            b'w' => {}
            b'n' => {
                self.t.num();
                self.t.num();
            }
            b'D' => self.draw()?,
            b'x' => self.device_cmd()?,
            b'#' => self.t.skip_line(),
            _ => {
                warn!("unknown command {}", c as char);
                self.t.skip_line();
            }
        }
        Ok(())
    }

    fn glyph(&mut self, name: &str) -> Result<(), InkpostError> {
        if name.is_empty() {
            return Ok(());
        }
        let Some(dev) = &self.dev else {
            warn!("glyph before device initialization");
            return Ok(());
        };
        self.out.glyph(dev, name)?;
        Ok(())
    }

    fn draw(&mut self) -> Result<(), InkpostError> {
        let Some(c) = self.t.next() else {
            return Ok(());
        };
        let Some(dev) = &self.dev else {
            self.t.skip_line();
            return Ok(());
        };
        self.out.draw_begin(dev)?;
        match c.to_ascii_lowercase() {
            b'l' => {
                let h = self.t.num();
                let v = self.t.num();
                self.out.draw_line(h, v)?;
            }
            b'c' => {
                let d = self.t.num();
                self.out.draw_circle(d)?;
            }
            b'e' => {
                let h = self.t.num();
                let v = self.t.num();
                self.out.draw_ellipse(h, v)?;
            }
            b'a' => self.arc_segment()?,
            b'~' => self.spline_segment()?,
            b'p' => self.poly()?,
            _ => {}
        }
        self.out
            .draw_end(matches!(c, b'p' | b'P'), matches!(c, b'E' | b'C' | b'P'))?;
        self.t.skip_line();
        Ok(())
    }

    fn line_segments(&mut self) -> Result<(), InkpostError> {
        while let Some(h) = self.t.read_num() {
            let Some(v) = self.t.read_num() else { break };
            self.out.draw_line(h, v)?;
        }
        Ok(())
    }

    fn arc_segment(&mut self) -> Result<(), InkpostError> {
        let (Some(h1), Some(v1), Some(h2), Some(v2)) = (
            self.t.read_num(),
            self.t.read_num(),
            self.t.read_num(),
            self.t.read_num(),
        ) else {
            return Ok(());
        };
        self.out.draw_arc(h1, v1, h2, v2)?;
        Ok(())
    }

    fn spline_segment(&mut self) -> Result<(), InkpostError> {
        let mut h1 = self.t.num();
        let mut v1 = self.t.num();
        if self.t.is_eol() {
            self.out.draw_line(h1, v1)?;
            return Ok(());
        }
        while let Some(h2) = self.t.read_num() {
            let Some(v2) = self.t.read_num() else { break };
            self.out.draw_spline(h1, v1, h2, v2)?;
            h1 = h2;
            v1 = v2;
        }
        self.out.draw_spline(h1, v1, 0, 0)?;
        Ok(())
    }

    fn poly(&mut self) -> Result<(), InkpostError> {
        let mut kind = b'l';
        while !self.t.is_eol() && matches!(kind, b'l' | b'~' | b'a') {
            let Some(c) = self.t.next() else { break };
            self.t.back(c);
            if c != b'-' && c != b'+' && !c.is_ascii_digit() {
                kind = c;
                self.t.word();
                continue;
            }
            match kind {
                b'l' => self.line_segments()?,
                b'~' => self.spline_segment()?,
                b'a' => self.arc_segment()?,
                _ => {}
            }
        }
        Ok(())
    }

    fn device_cmd(&mut self) -> Result<(), InkpostError> {
        let cmd = self.t.word();
        match cmd.bytes().next() {
            Some(b'f') => {
                let pos = self.t.num();
                let font = self.t.word();
                if let Some(dev) = &mut self.dev {
                    if pos >= 0 {
                        match dev.mount(pos as usize, &font) {
                            Ok(()) => self.out.font_mounted(pos as usize),
                            Err(err) => warn!("{}", err),
                        }
                    }
                }
            }
            Some(b'i') => {
                let dev = Device::open(&self.opts.font_dir, &self.devname)?;
                self.out.doc_begin(
                    &dev,
                    self.opts.title.as_deref(),
                    self.opts.pagewidth,
                    self.opts.pageheight,
                    self.opts.linewidth,
                )?;
                self.dev = Some(dev);
            }
            Some(b'T') => {
                self.devname = self.t.word();
            }
            Some(b's') => {}
            Some(b'X') => self.extension()?,
            _ => {}
        }
        self.t.skip_line();
        Ok(())
    }

    fn extension(&mut self) -> Result<(), InkpostError> {
        let cmd = self.t.word();
        let arg = self.t.rest_of_line();
        match cmd.as_str() {
            "PS" | "ps" => self.out.raw(&arg)?,
            "rotate" => self.out.set_rotation(arg.trim().parse().unwrap_or(0)),
            "eps" | "pdf" => {
                let (path, rest) = strcut(&arg);
                let mut nums = rest.split_whitespace().map(|w| w.parse::<i32>().ok());
                let hwid = nums.next().flatten().unwrap_or(0);
                let vwid = nums.next().flatten().unwrap_or(0);
                if !path.is_empty() {
                    if cmd == "eps" {
                        self.out.include_eps(&path, hwid, vwid)?;
                    } else {
                        self.out.include_pdf(&path, hwid, vwid)?;
                    }
                }
            }
            "name" => {
                let (text, rest) = strcut(&arg);
                let mut nums = rest.split_whitespace().map(|w| w.parse::<i32>().ok());
                let page = nums.next().flatten();
                let offset = nums.next().flatten().unwrap_or(0);
                if let Some(page) = page {
                    if !text.is_empty() {
                        self.names.push(NamedDest { text, page, offset });
                    }
                }
            }
            "mark" => {
                let (text, rest) = strcut(&arg);
                let mut nums = rest.split_whitespace().map(|w| w.parse::<i32>().ok());
                let page = nums.next().flatten();
                let offset = nums.next().flatten().unwrap_or(0);
                let level = nums.next().flatten().unwrap_or(0);
                if let Some(page) = page {
                    if !text.is_empty() {
                        self.marks.push(Bookmark {
                            text,
                            page,
                            offset,
                            level,
                        });
                    }
                }
            }
            "link" => {
                let (target, rest) = strcut(&arg);
                let mut nums = rest.split_whitespace().map(|w| w.parse::<i32>().ok());
                let hwid = nums.next().flatten();
                let vwid = nums.next().flatten();
                if let (Some(hwid), Some(vwid)) = (hwid, vwid) {
                    if !target.is_empty() {
                        self.out.link(&target, hwid, vwid);
                    }
                }
            }
            "info" => {
                let s = arg.trim_start();
                let (key, value) = s.split_once(' ').unwrap_or((s, ""));
                if !key.is_empty() {
                    self.out.info(key, value.trim_start());
                }
            }
            "set" => {
                let mut words = arg.split_whitespace();
                if let (Some(key), Some(value)) = (words.next(), words.next()) {
                    self.out.set_param(key, value)?;
                }
            }
            "BeginObject" => {
                if let Some(dev) = &self.dev {
                    self.out.draw_marked_begin(dev, &arg)?;
                }
            }
            "EndObject" => self.out.draw_marked_end(&arg)?,
            _ => {}
        }
        Ok(())
    }
}
