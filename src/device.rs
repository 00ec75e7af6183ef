use crate::error::InkpostError;
use crate::font::{Font, Glyph};
use std::path::{Path, PathBuf};

// The output device description: resolution constants from DESC plus the
// fonts mounted at numbered positions during the run.
#[derive(Debug)]
pub struct Device {
    dir: PathBuf,
    pub res: i32,
    pub uwid: i32,
    pub hor: i32,
    pub ver: i32,
    fonts: Vec<Option<Font>>,
}

pub struct GlyphRef<'a> {
    pub font: &'a Font,
    pub glyph: &'a Glyph,
    pub index: usize,
}

impl<'a> GlyphRef<'a> {
    fn new(font: &'a Font, index: usize) -> Option<GlyphRef<'a>> {
        let glyph = font.glyph_at(index)?;
        Some(GlyphRef { font, glyph, index })
    }
}

impl Device {
    pub fn open(dir: &Path, dev: &str) -> Result<Device, InkpostError> {
        let dir = dir.join(format!("dev{}", dev));
        let desc = dir.join("DESC");
        let text = std::fs::read_to_string(&desc)
            .map_err(|_| InkpostError::DeviceOpen(desc.display().to_string()))?;
        let mut device = Device {
            dir,
            res: 0,
            uwid: 0,
            hor: 0,
            ver: 0,
            fonts: Vec::new(),
        };
        let mut words = text.split_whitespace();
        while let Some(tok) = words.next() {
            match tok {
                "fonts" => {
                    let n: usize = words.next().and_then(|w| w.parse().ok()).unwrap_or(0);
                    // Position 0 is never mounted from DESC.
                    device.fonts.resize_with(n + 1, || None);
                    for _ in 0..n {
                        words.next();
                    }
                }
                "sizes" => {
                    for w in words.by_ref() {
                        if w == "0" {
                            break;
                        }
                    }
                }
                "res" => device.res = words.next().and_then(|w| w.parse().ok()).unwrap_or(0),
                "unitwidth" => device.uwid = words.next().and_then(|w| w.parse().ok()).unwrap_or(0),
                "hor" => device.hor = words.next().and_then(|w| w.parse().ok()).unwrap_or(0),
                "ver" => device.ver = words.next().and_then(|w| w.parse().ok()).unwrap_or(0),
                "charset" => break,
                _ => {}
            }
        }
        if device.res <= 0 || device.uwid <= 0 {
            return Err(InkpostError::MalformedDescription(format!(
                "{}: res/unitwidth missing",
                desc.display()
            )));
        }
        Ok(device)
    }

    pub fn mount(&mut self, pos: usize, name: &str) -> Result<(), InkpostError> {
        let font = Font::open(&self.dir.join(name))?;
        if pos >= self.fonts.len() {
            self.fonts.resize_with(pos + 1, || None);
        }
        self.fonts[pos] = Some(font);
        Ok(())
    }

    pub fn font(&self, pos: usize) -> Option<&Font> {
        self.fonts.get(pos).and_then(|f| f.as_ref())
    }

    // Mount position of a font handle, e.g. after a special-font fallback.
    pub fn font_pos(&self, font: &Font) -> usize {
        self.fonts
            .iter()
            .position(|f| f.as_ref().is_some_and(|m| std::ptr::eq(m, font)))
            .unwrap_or(0)
    }

    // Charset-name lookup in the font at `pos`, falling back to any
    // mounted special font.
    pub fn glyph(&self, name: &str, pos: usize) -> Option<GlyphRef<'_>> {
        if let Some(font) = self.font(pos) {
            if let Some(index) = font.find(name) {
                return GlyphRef::new(font, index);
            }
        }
        for font in self.fonts.iter().flatten() {
            if font.special() {
                if let Some(index) = font.find(name) {
                    return GlyphRef::new(font, index);
                }
            }
        }
        None
    }

    pub fn glyph_by_id(&self, id: &str, pos: usize) -> Option<GlyphRef<'_>> {
        let font = self.font(pos)?;
        GlyphRef::new(font, font.glyph_by_id(id)?)
    }

    // Width at point size `sz`; the original troff rounds widths up.
    pub fn charwid(&self, wid: i32, sz: i32) -> i32 {
        (wid * sz + self.uwid / 2) / self.uwid
    }

    pub fn spacewid(&self, pos: usize, sz: i32) -> Option<i32> {
        self.font(pos).map(|f| self.charwid(f.spacewid(), sz))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    const DESC: &str = "\
fonts 2 R S
sizes 8 10 12 0
res 720
hor 1
ver 1
unitwidth 10
charset
";

    const FONT_R: &str = "\
name R
fontname Times-Roman
spacewidth 25
charset
A 72 2 A 65
B 70 2 B 66
";

    const FONT_S: &str = "\
name S
fontname Symbol
special
spacewidth 25
charset
*a 60 0 alpha 945
";

    // Builds a devutf-like device tree under a unique temp directory and
    // returns the font directory (the parent of dev<name>).
    pub(crate) fn write_device(extra_fonts: &[(&str, &str)]) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "inkpost_dev_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        let dev = root.join("devutf");
        std::fs::create_dir_all(&dev).expect("mkdir");
        for (name, body) in [("DESC", DESC), ("R", FONT_R), ("S", FONT_S)]
            .iter()
            .chain(extra_fonts.iter())
        {
            let mut f = std::fs::File::create(dev.join(name)).expect("create");
            f.write_all(body.as_bytes()).expect("write");
        }
        root
    }

    pub(crate) fn open_mounted() -> Device {
        let root = write_device(&[]);
        let mut device = Device::open(&root, "utf").expect("open device");
        device.mount(1, "R").expect("mount R");
        device.mount(2, "S").expect("mount S");
        device
    }

    #[test]
    fn desc_constants_are_loaded() {
        let device = open_mounted();
        assert_eq!((device.res, device.uwid, device.hor, device.ver), (720, 10, 1, 1));
    }

    #[test]
    fn charwid_rounds_up() {
        let device = open_mounted();
        // 25 units at size 10 with unitwidth 10: (25*10 + 5) / 10 = 25
        assert_eq!(device.charwid(25, 10), 25);
        // 25 units at size 11: (275 + 5) / 10 = 28
        assert_eq!(device.charwid(25, 11), 28);
    }

    #[test]
    fn glyph_lookup_falls_back_to_special_fonts() {
        let device = open_mounted();
        let hit = device.glyph("A", 1).expect("A on R");
        assert_eq!(hit.glyph.id, "A");
        let hit = device.glyph("*a", 1).expect("alpha via special S");
        assert_eq!(hit.glyph.id, "alpha");
        assert!(device.glyph("nosuch", 1).is_none());
    }

    #[test]
    fn missing_device_directory_is_fatal() {
        let err = Device::open(Path::new("/nonexistent"), "utf").expect_err("must fail");
        assert!(matches!(err, InkpostError::DeviceOpen(_)));
    }
}
