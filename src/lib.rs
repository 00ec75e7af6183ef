//! Postprocessor for typesetter device-language output: consumes the
//! command stream and renders it as PDF or PostScript.

mod color;
mod device;
mod dispatch;
mod embed;
mod error;
mod font;
mod output;
mod pdf;
mod pdffont;
mod ps;

pub use color::parse as parse_color;
pub use device::{Device, GlyphRef};
pub use dispatch::{DriverOptions, run};
pub use error::InkpostError;
pub use font::{Font, Glyph};
pub use output::{Bookmark, NamedDest, OutputDevice};
pub use pdf::PdfDevice;
pub use ps::PsDevice;
