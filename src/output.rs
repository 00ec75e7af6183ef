use crate::device::Device;
use std::io;

#[derive(Debug, Clone)]
pub struct Bookmark {
    pub text: String,
    pub page: i32,
    pub offset: i32,
    pub level: i32,
}

#[derive(Debug, Clone)]
pub struct NamedDest {
    pub text: String,
    pub page: i32,
    pub offset: i32,
}

// The command surface the dispatcher drives. One rendering backend per
// output format; every emitting operation reports write failures so the
// single forward pass can stop on the first broken pipe.
pub trait OutputDevice {
    fn doc_begin(
        &mut self,
        dev: &Device,
        title: Option<&str>,
        pagewidth: i32,
        pageheight: i32,
        linewidth: i32,
    ) -> io::Result<()>;
    fn doc_end(&mut self, pages: i32) -> io::Result<()>;
    fn page_begin(&mut self, n: i32) -> io::Result<()>;
    fn page_end(&mut self, n: i32) -> io::Result<()>;

    fn set_h(&mut self, h: i32);
    fn set_v(&mut self, v: i32);
    fn move_rel(&mut self, h: i32, v: i32);
    fn set_font(&mut self, dev: &Device, pos: usize);
    fn set_size(&mut self, s: i32);
    fn set_color(&mut self, color: u32);
    fn set_rotation(&mut self, deg: i32);
    fn font_mounted(&mut self, pos: usize);
    fn glyph(&mut self, dev: &Device, name: &str) -> io::Result<()>;

    fn draw_begin(&mut self, dev: &Device) -> io::Result<()>;
    fn draw_end(&mut self, close: bool, fill: bool) -> io::Result<()>;
    fn draw_line(&mut self, h: i32, v: i32) -> io::Result<()>;
    fn draw_circle(&mut self, d: i32) -> io::Result<()>;
    fn draw_ellipse(&mut self, h: i32, v: i32) -> io::Result<()>;
    fn draw_arc(&mut self, h1: i32, v1: i32, h2: i32, v2: i32) -> io::Result<()>;
    fn draw_spline(&mut self, h1: i32, v1: i32, h2: i32, v2: i32) -> io::Result<()>;
    fn draw_marked_begin(&mut self, dev: &Device, arg: &str) -> io::Result<()>;
    fn draw_marked_end(&mut self, arg: &str) -> io::Result<()>;

    fn raw(&mut self, line: &str) -> io::Result<()>;
    fn set_param(&mut self, key: &str, value: &str) -> io::Result<()>;
    fn include_pdf(&mut self, path: &str, hwid: i32, vwid: i32) -> io::Result<()>;
    fn include_eps(&mut self, path: &str, hwid: i32, vwid: i32) -> io::Result<()>;
    fn link(&mut self, target: &str, hwid: i32, vwid: i32);
    fn info(&mut self, key: &str, value: &str);
    fn set_bookmarks(&mut self, marks: Vec<Bookmark>);
    fn set_named_dests(&mut self, names: Vec<NamedDest>);

    fn finish(&mut self) -> io::Result<()>;
}
