//! Error types for the image filesystem.
//!
//! All fallible operations return a [`Result<T>`], an alias for
//! `Result<T, CimError>`.  Every error value carries the image path, the
//! failing operation, the path and stream involved (where applicable), and a
//! structured cause.
//!
//! Errors are organized into a few categories:
//!
//! - **Resolution**: [`FileNotFound`], [`NotADirectory`], [`IsADirectory`]
//! - **Format**: [`BadFormat`], [`BadOffset`], [`UnsupportedStreamType`]
//! - **Writer rules**: [`NoActiveStream`], [`WriteTruncated`], [`WroteTooMuch`]
//! - **Layering**: [`LayerLoop`]
//! - **System**: [`Io`]
//!
//! [`FileNotFound`]: ErrorKind::FileNotFound
//! [`NotADirectory`]: ErrorKind::NotADirectory
//! [`IsADirectory`]: ErrorKind::IsADirectory
//! [`BadFormat`]: ErrorKind::BadFormat
//! [`BadOffset`]: ErrorKind::BadOffset
//! [`UnsupportedStreamType`]: ErrorKind::UnsupportedStreamType
//! [`NoActiveStream`]: ErrorKind::NoActiveStream
//! [`WriteTruncated`]: ErrorKind::WriteTruncated
//! [`WroteTooMuch`]: ErrorKind::WroteTooMuch
//! [`LayerLoop`]: ErrorKind::LayerLoop
//! [`Io`]: ErrorKind::Io

use std::{
    fmt, io,
    path::{Path, PathBuf},
};

/// Result type alias for operations that may return a [`CimError`].
pub type Result<T> = std::result::Result<T, CimError>;

/// The cause of a failed image operation.
#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    /// A path resolution step failed.
    #[error("file not found")]
    FileNotFound,

    /// Traversal into a non-directory, or a directory was required.
    #[error("not a directory")]
    NotADirectory,

    /// A read was attempted on a directory.
    #[error("is a directory")]
    IsADirectory,

    /// A stream record carries a type the operation does not support.
    #[error("unsupported stream type {0}")]
    UnsupportedStreamType(u16),

    /// Magic, version or size validation failed on a header or table.
    #[error("bad format: {0}")]
    BadFormat(String),

    /// A region offset names an invalid region or an out-of-bounds range.
    #[error("invalid region offset {0:#x}")]
    BadOffset(u64),

    /// `write` was called without a preceding entry that opens a stream.
    #[error("no active stream")]
    NoActiveStream,

    /// A stream was closed with declared bytes still unwritten.
    #[error("stream closed before all declared bytes were written")]
    WriteTruncated,

    /// A write would exceed the declared file size.
    #[error("write exceeds the declared file size")]
    WroteTooMuch,

    /// A layer redirect chain is longer than the parent set.
    #[error("layer redirect chain does not terminate")]
    LayerLoop,

    /// I/O failure from the host, wrapping the host error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ErrorKind {
    pub(crate) fn bad_format(msg: impl Into<String>) -> ErrorKind {
        ErrorKind::BadFormat(msg.into())
    }
}

/// An error raised by an image operation, carrying the image it occurred on,
/// the operation name and the path involved.
#[derive(Debug)]
pub struct CimError {
    pub image: PathBuf,
    pub op: &'static str,
    pub path: Option<String>,
    /// Target path of a failed link operation.
    pub new_path: Option<String>,
    pub stream: Option<String>,
    pub kind: ErrorKind,
}

impl CimError {
    pub(crate) fn new(image: &Path, op: &'static str, kind: ErrorKind) -> CimError {
        CimError {
            image: image.to_path_buf(),
            op,
            path: None,
            new_path: None,
            stream: None,
            kind,
        }
    }

    pub(crate) fn path(mut self, path: impl Into<String>) -> CimError {
        self.path = Some(path.into());
        self
    }

    pub(crate) fn new_path(mut self, path: impl Into<String>) -> CimError {
        self.new_path = Some(path.into());
        self
    }

    pub(crate) fn stream(mut self, stream: impl Into<String>) -> CimError {
        self.stream = Some(stream.into());
        self
    }
}

impl fmt::Display for CimError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.image.display(), self.op)?;
        if let Some(path) = &self.path {
            write!(f, " {path}")?;
        }
        if let Some(new_path) = &self.new_path {
            write!(f, " -> {new_path}")?;
        }
        if let Some(stream) = &self.stream {
            write!(f, ":{stream}")?;
        }
        write!(f, ": {}", self.kind)
    }
}

impl std::error::Error for CimError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl From<CimError> for io::Error {
    fn from(err: CimError) -> io::Error {
        io::Error::other(err)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_display() {
        let err = CimError::new(Path::new("/images/layer.fs"), "openat", ErrorKind::FileNotFound)
            .path("/Files/Windows");
        assert_eq!(
            err.to_string(),
            "/images/layer.fs: openat /Files/Windows: file not found"
        );

        let err = CimError::new(Path::new("img/layer.fs"), "link", ErrorKind::FileNotFound)
            .path("a")
            .new_path("b");
        assert_eq!(err.to_string(), "img/layer.fs: link a -> b: file not found");
    }
}
