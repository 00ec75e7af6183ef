use crate::error::InkpostError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

// One glyph of a device font description. Immutable after the font is
// loaded; `code` is the device position used for wide (CID) addressing.
#[derive(Debug, Clone)]
pub struct Glyph {
    pub id: String,
    pub name: String,
    pub wid: i32,
    pub kind: i32,
    pub code: i32,
}

#[derive(Debug)]
pub struct Font {
    name: String,
    fontname: String,
    spacewid: i32,
    special: bool,
    path: Option<PathBuf>,
    desc: PathBuf,
    glyphs: Vec<Glyph>,
    by_id: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
}

impl Font {
    pub fn open(path: &Path) -> Result<Font, InkpostError> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| InkpostError::FontOpen(path.display().to_string()))?;
        let mut font = Font {
            name: String::new(),
            fontname: String::new(),
            spacewid: 0,
            special: false,
            path: None,
            desc: path.to_path_buf(),
            glyphs: Vec::new(),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
        };
        let mut in_charset = false;
        let mut last_mapped = None;
        for line in text.lines() {
            if in_charset {
                font.read_charset_row(line, &mut last_mapped);
                continue;
            }
            let mut words = line.split_whitespace();
            let Some(key) = words.next() else { continue };
            match key {
                "name" => font.name = words.next().unwrap_or("").to_string(),
                "fontname" => font.fontname = words.next().unwrap_or("").to_string(),
                "spacewidth" => {
                    font.spacewid = words.next().and_then(|w| w.parse().ok()).unwrap_or(0)
                }
                "special" => font.special = true,
                "fontpath" => font.path = words.next().map(PathBuf::from),
                "ligatures" => {}
                "charset" => in_charset = true,
                _ => {}
            }
        }
        Ok(font)
    }

    // A charset row is `name width type id [code …]`; a width of `"` maps
    // the name onto the previous row's glyph, and `---` names are
    // synthesized from the running mapping count.
    fn read_charset_row(&mut self, line: &str, last_mapped: &mut Option<usize>) {
        let mut words = line.split_whitespace();
        let (Some(name), Some(tok)) = (words.next(), words.next()) else {
            return;
        };
        let name = if name == "---" {
            format!("c{:04}", self.by_name.len())
        } else {
            name.to_string()
        };
        if tok == "\"" {
            if let Some(prev) = *last_mapped {
                self.by_name.insert(name, prev);
            }
            return;
        }
        let wid: i32 = tok.parse().unwrap_or(0);
        let (Some(kind), Some(id)) = (words.next(), words.next()) else {
            return;
        };
        let kind: i32 = kind.parse().unwrap_or(0);
        let index = match self.by_id.get(id) {
            Some(&i) => i,
            None => {
                let code = words.next().and_then(|w| w.parse().ok()).unwrap_or(0);
                let i = self.glyphs.len();
                self.glyphs.push(Glyph {
                    id: id.to_string(),
                    name: name.clone(),
                    wid,
                    kind,
                    code,
                });
                self.by_id.insert(id.to_string(), i);
                i
            }
        };
        self.by_name.insert(name, index);
        *last_mapped = Some(index);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // The PostScript name, used as the output resource base name.
    pub fn fontname(&self) -> &str {
        &self.fontname
    }

    pub fn spacewid(&self) -> i32 {
        self.spacewid
    }

    pub fn special(&self) -> bool {
        self.special
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn desc_path(&self) -> &Path {
        &self.desc
    }

    pub fn glyph_count(&self) -> usize {
        self.glyphs.len()
    }

    pub fn glyph_at(&self, index: usize) -> Option<&Glyph> {
        self.glyphs.get(index)
    }

    pub fn glyphs(&self) -> impl Iterator<Item = &Glyph> {
        self.glyphs.iter()
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn glyph_by_id(&self, id: &str) -> Option<usize> {
        self.by_id.get(id).copied()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) fn write_fixture(name: &str, body: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "inkpost_font_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).expect("create");
        f.write_all(body.as_bytes()).expect("write");
        path
    }

    const SAMPLE: &str = "\
name R
fontname Times-Roman
spacewidth 25
ligatures fi fl 0
charset
A 72 2 A 65
a 44 0 a 97
aa \" 0 a
--- 50 0 bullet 183
";

    #[test]
    fn parses_header_and_charset() {
        let path = write_fixture("R", SAMPLE);
        let font = Font::open(&path).expect("open");
        assert_eq!(font.name(), "R");
        assert_eq!(font.fontname(), "Times-Roman");
        assert_eq!(font.spacewid(), 25);
        assert!(!font.special());
        assert_eq!(font.glyph_count(), 3);
        let a = font.glyph_at(font.find("A").unwrap()).unwrap();
        assert_eq!((a.wid, a.kind, a.code), (72, 2, 65));
    }

    #[test]
    fn quote_rows_alias_the_previous_glyph() {
        let path = write_fixture("R", SAMPLE);
        let font = Font::open(&path).expect("open");
        assert_eq!(font.find("aa"), font.find("a"));
    }

    #[test]
    fn unnamed_rows_are_synthesized() {
        let path = write_fixture("R", SAMPLE);
        let font = Font::open(&path).expect("open");
        let idx = font.find("c0003").expect("synthesized name");
        assert_eq!(font.glyph_at(idx).unwrap().id, "bullet");
    }

    #[test]
    fn lookup_by_device_id() {
        let path = write_fixture("R", SAMPLE);
        let font = Font::open(&path).expect("open");
        assert_eq!(font.glyph_by_id("a"), font.find("a"));
        assert_eq!(font.glyph_by_id("zz"), None);
    }

    #[test]
    fn missing_file_is_a_font_open_error() {
        let err = Font::open(Path::new("/nonexistent/R")).expect_err("must fail");
        assert!(matches!(err, InkpostError::FontOpen(_)));
    }
}
