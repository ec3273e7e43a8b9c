//! Image writing.
//!
//! [`Writer`] builds a new filesystem file on top of zero or more existing
//! ones.  It enforces the rules of the image-building service it wraps: at
//! most one active stream, exact declared sizes, canonical security
//! descriptors, and host-native path normalization.  The service itself is
//! an injected [`ImageBackend`]; the native on-disk implementation lives in
//! [`crate::image`].

use std::{
    io,
    path::{Path, PathBuf},
};

use crate::{
    error::{CimError, ErrorKind, Result},
    format::{FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_SPARSE_FILE},
    image::ImageWriter,
    reader::FileInfo,
    util,
};

/// The image-building service contract.  Paths are backslash-separated with
/// no leading separator.  The backend holds at most one open stream: a
/// `create_file` for a data-bearing entry opens it, and `close_stream`
/// closes it.  `commit` finalizes the filesystem file and every region file
/// this builder produced.
pub trait ImageBackend {
    fn create_file(&mut self, path: &str, info: &FileInfo) -> io::Result<()>;
    fn write_stream(&mut self, buf: &[u8]) -> io::Result<()>;
    fn close_stream(&mut self) -> io::Result<()>;
    fn create_hard_link(&mut self, existing: &str, path: &str) -> io::Result<()>;
    fn delete_path(&mut self, path: &str) -> io::Result<()>;
    fn commit(&mut self) -> io::Result<()>;
}

/// Self-relative security descriptor for the SDDL string
/// `D:NO_ACCESS_CONTROL`: revision 1, SE_SELF_RELATIVE | SE_DACL_PRESENT,
/// null DACL.  A legally-empty descriptor would be operationally broken once
/// mounted, so empty input descriptors are rewritten to this.
pub(crate) const NO_ACCESS_CONTROL_SD: [u8; 20] = [
    1, 0, 0x04, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// Writes a single image filesystem.  On disk the image is composed of a
/// filesystem file and several object-ID and region files.
pub struct Writer<B> {
    backend: B,
    image_path: PathBuf,
    active: bool,
    remaining: u64,
    closed: bool,
}

impl Writer<ImageWriter> {
    /// Creates a new image with no parent.  `path` names the filesystem file
    /// to produce; region files are created alongside it.
    pub fn create(path: impl AsRef<Path>) -> Result<Writer<ImageWriter>> {
        let path = path.as_ref();
        let (dir, name) = split_fs_path(path)?;
        let backend = ImageWriter::create(dir, name)?;
        Ok(Writer::new(backend, path))
    }

    /// Opens the existing image at `path` read-only as a parent.  A
    /// successful [`commit`](Writer::commit) produces a new filesystem file
    /// named `new_fs_name` in the same directory whose parent chain includes
    /// the original.
    pub fn append(path: impl AsRef<Path>, new_fs_name: &str) -> Result<Writer<ImageWriter>> {
        let path = path.as_ref();
        let (dir, name) = split_fs_path(path)?;
        let backend = ImageWriter::append(dir, name, new_fs_name)?;
        Ok(Writer::new(backend, dir.join(new_fs_name)))
    }
}

fn split_fs_path(path: &Path) -> Result<(&Path, &str)> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            CimError::new(path, "create", ErrorKind::bad_format("invalid filesystem file name"))
        })?;
    Ok((dir, name))
}

impl<B: ImageBackend> Writer<B> {
    /// Wraps an image-building service.  `image_path` is used for error
    /// reporting only.
    pub fn new(backend: B, image_path: impl Into<PathBuf>) -> Writer<B> {
        Writer {
            backend,
            image_path: image_path.into(),
            active: false,
            remaining: 0,
            closed: false,
        }
    }

    fn err(&self, op: &'static str, kind: ErrorKind) -> CimError {
        CimError::new(&self.image_path, op, kind)
    }

    /// Closes the active stream, if any.  Closing a stream with declared
    /// bytes still unwritten is an error.
    fn close_active(&mut self, op: &'static str) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        let remaining = self.remaining;
        self.remaining = 0;
        self.backend
            .close_stream()
            .map_err(|e| self.err(op, e.into()))?;
        if remaining > 0 {
            return Err(self.err(op, ErrorKind::WriteTruncated));
        }
        Ok(())
    }

    /// Declares a new entry at `path`.  If the entry is a regular file (not
    /// a directory, not sparse, not reparse-tagged) it becomes the sole
    /// active stream and exactly `info.size` bytes must be written before
    /// the next entry is declared.
    pub fn write_file(&mut self, path: &str, info: &FileInfo) -> Result<()> {
        self.close_active("writefile")?;
        let npath = util::normalize_image_path(path);

        let mut canonical;
        let info = if info.security_descriptor.is_empty() {
            canonical = info.clone();
            canonical.security_descriptor = NO_ACCESS_CONTROL_SD.to_vec();
            &canonical
        } else {
            info
        };

        self.backend
            .create_file(&npath, info)
            .map_err(|e| self.err("writefile", e.into()).path(path.to_string()))?;

        let directory = info.attributes & FILE_ATTRIBUTE_DIRECTORY != 0;
        let sparse = info.attributes & FILE_ATTRIBUTE_SPARSE_FILE != 0;
        let reparse = info.reparse_tag != 0 || !info.reparse_data.is_empty();
        if !directory && !sparse && !reparse {
            self.active = true;
            self.remaining = info.size;
        }
        Ok(())
    }

    /// Writes `buf` to the active stream.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        if !self.active {
            return Err(self.err("write", ErrorKind::NoActiveStream));
        }
        if buf.len() as u64 > self.remaining {
            return Err(self.err("write", ErrorKind::WroteTooMuch));
        }
        self.backend
            .write_stream(buf)
            .map_err(|e| self.err("write", e.into()))?;
        self.remaining -= buf.len() as u64;
        Ok(())
    }

    /// Creates a hard link at `path` to the file at `existing`.
    pub fn link(&mut self, existing: &str, path: &str) -> Result<()> {
        self.close_active("link")?;
        self.backend
            .create_hard_link(
                &util::normalize_image_path(existing),
                &util::normalize_image_path(path),
            )
            .map_err(|e| {
                self.err("link", e.into())
                    .path(existing.to_string())
                    .new_path(path.to_string())
            })
    }

    /// Removes the entry at `path`.  In append mode this shadows a parent
    /// entry.
    pub fn unlink(&mut self, path: &str) -> Result<()> {
        self.close_active("unlink")?;
        self.backend
            .delete_path(&util::normalize_image_path(path))
            .map_err(|e| self.err("unlink", e.into()).path(path.to_string()))
    }

    /// Finalizes the filesystem file and all region files this writer
    /// produced.  After `commit` returns, opening the new filesystem file
    /// observes every byte written.
    pub fn commit(&mut self) -> Result<()> {
        self.close_active("commit")?;
        self.backend
            .commit()
            .map_err(|e| self.err("commit", e.into()))
    }

    /// Releases the underlying handle.  Idempotent; does not imply
    /// [`commit`](Writer::commit).
    pub fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.active = false;
            self.remaining = 0;
        }
        Ok(())
    }
}

impl<B: ImageBackend> io::Write for Writer<B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Writer::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
