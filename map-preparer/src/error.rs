use thiserror::Error;

/// Everything that can go wrong while decoding, rasterizing or partitioning.
///
/// `Format` errors are fatal for the file being processed; callers never try
/// to resume a half-decoded stream.
#[derive(Debug, Error)]
pub enum Error {
    #[error("format error: {0}")]
    Format(String),

    #[error("missing attribute column {0}")]
    Lookup(String),

    #[error("cell ({x}, {y}) outside the {width}x{height} raster")]
    OutOfRange { x: i64, y: i64, width: u32, height: u32 },

    #[error("invalid settings: {0}")]
    Config(String),

    #[error("restore buffer out of step: {0}")]
    Restore(String),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }
}

/// Maps an unexpected end of stream onto a format error naming what was being
/// read; any other I/O failure stays an I/O error.
pub(crate) fn truncated(what: &'static str) -> impl FnOnce(std::io::Error) -> Error {
    move |e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Format(format!("stream truncated while reading {}", what))
        } else {
            Error::Io(e)
        }
    }
}
