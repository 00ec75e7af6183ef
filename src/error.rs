use std::fmt;

#[derive(Debug)]
pub enum InkpostError {
    DeviceOpen(String),
    FontOpen(String),
    MalformedDescription(String),
    Io(std::io::Error),
}

impl fmt::Display for InkpostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InkpostError::DeviceOpen(path) => write!(f, "cannot open device: {}", path),
            InkpostError::FontOpen(path) => write!(f, "cannot open font: {}", path),
            InkpostError::MalformedDescription(message) => {
                write!(f, "malformed description: {}", message)
            }
            InkpostError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for InkpostError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InkpostError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for InkpostError {
    fn from(value: std::io::Error) -> Self {
        InkpostError::Io(value)
    }
}
