//! inkpost - render typesetter device output as PDF or PostScript
//!
//! Reads the device-language command stream on standard input and writes
//! the rendered document to standard output or a file.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use inkpost::{DriverOptions, OutputDevice, PdfDevice, PsDevice};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
enum Mode {
    /// PDF output (default)
    #[default]
    Pdf,
    /// PostScript output
    Ps,
}

#[derive(Parser)]
#[command(
    name = "inkpost",
    version,
    about = "Render typesetter device output as PDF or PostScript"
)]
struct Args {
    /// Font and device description directory
    #[arg(short = 'F', long = "fdir", default_value = "/usr/share/inkpost/font")]
    font_dir: PathBuf,

    /// Paper size: a preset (letter, legal, ledger, tabloid), an ISO size
    /// (a4, b5, ...), or WxH in tenths of a millimetre (2100x2970)
    #[arg(short = 'p', long = "paper", default_value = "letter")]
    paper: String,

    /// Document title
    #[arg(short = 't', long)]
    title: Option<String>,

    /// Drawing line thickness in thousandths of an em
    #[arg(short = 'w', long = "linewidth", default_value_t = 40)]
    linewidth: i32,

    /// Swap page width and height
    #[arg(short = 'l', long)]
    landscape: bool,

    /// Always draw glyphs by name (PostScript glyphshow)
    #[arg(short = 'n', long)]
    gname: bool,

    /// Output format
    #[arg(short = 'm', long = "mode", value_enum, default_value_t = Mode::Pdf)]
    mode: Mode,

    /// Output file (standard output when absent)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
}

const PAPERS: &[(&str, i32, i32)] = &[
    ("letter", 2159, 2794),
    ("legal", 2159, 3556),
    ("ledger", 4318, 2794),
    ("tabloid", 2794, 4318),
];

// Page size in tenths of a millimetre.
fn paper_size(s: &str) -> Option<(i32, i32)> {
    for &(name, w, h) in PAPERS {
        if name == s {
            return Some((w, h));
        }
    }
    if let Some((w, h)) = s.split_once('x') {
        if let (Ok(w), Ok(h)) = (w.parse(), h.parse()) {
            return Some((w, h));
        }
    }
    // ISO A/B/C series, halving the sheet per step.
    let mut chars = s.chars();
    let (series, digit) = (chars.next()?, chars.next()?);
    if chars.next().is_some() {
        return None;
    }
    let n = digit.to_digit(10)? as i32;
    let (d1, d2) = match series.to_ascii_lowercase() {
        'a' => (8410, 11890),
        'b' => (10000, 14140),
        'c' => (9170, 12970),
        _ => return None,
    };
    let mut w = (if n & 1 == 1 { d2 } else { d1 }) >> ((n + 1) >> 1);
    let mut h = (if n & 1 == 1 { d1 } else { d2 }) >> (n >> 1);
    w -= w % 10;
    h -= h % 10;
    Some((w, h))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let (mut width, mut height) = paper_size(&args.paper)
        .with_context(|| format!("unknown paper size {}", args.paper))?;
    if args.landscape {
        std::mem::swap(&mut width, &mut height);
    }
    let opts = DriverOptions {
        font_dir: args.font_dir,
        title: args.title,
        pagewidth: width,
        pageheight: height,
        linewidth: args.linewidth,
        ..DriverOptions::default()
    };
    let writer: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(
            std::fs::File::create(path)
                .with_context(|| format!("cannot create {}", path.display()))?,
        ),
        None => Box::new(io::stdout().lock()),
    };
    let writer = BufWriter::new(writer);
    let mut device: Box<dyn OutputDevice> = match args.mode {
        Mode::Pdf => Box::new(PdfDevice::new(writer)),
        Mode::Ps => Box::new(PsDevice::new(writer, args.gname)),
    };
    inkpost::run(io::stdin().lock(), device.as_mut(), &opts)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_and_custom_sizes() {
        assert_eq!(paper_size("letter"), Some((2159, 2794)));
        assert_eq!(paper_size("tabloid"), Some((2794, 4318)));
        assert_eq!(paper_size("2100x2970"), Some((2100, 2970)));
        assert_eq!(paper_size("potato"), None);
    }

    #[test]
    fn iso_sizes_halve_per_step() {
        assert_eq!(paper_size("a4"), Some((2100, 2970)));
        assert_eq!(paper_size("a3"), Some((2970, 4200)));
        assert_eq!(paper_size("a0"), Some((8410, 11890)));
        assert_eq!(paper_size("b5"), Some((1760, 2500)));
        assert_eq!(paper_size("d4"), None);
    }
}
