//! A content-addressed, read/write image filesystem for container layers.
//!
//! An image packs a directory tree into a small set of append-only region
//! files plus one filesystem file, openable randomly and layerable atop
//! parent images.  [`reader::Cim`] opens and resolves an image,
//! [`writer::Writer`] builds or appends one, and [`layer::expand`]
//! materializes a stack of parent filesystems into a single coherent view
//! using per-file layer redirects.

pub mod error;
pub mod format;
pub mod image;
pub mod layer;
pub mod mount;
pub mod reader;
mod utf16;
mod util;
pub mod writer;

#[cfg(any(test, feature = "test"))]
pub mod test;

pub use error::{CimError, ErrorKind, Result};
pub use format::{FileId, Filetime, Guid, FILESYSTEM_FILE_NAME};
pub use reader::{Cim, File, FileInfo};
pub use writer::Writer;
