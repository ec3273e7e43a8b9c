//! Test utilities.
//!
//! Helpers for writing tests: temporary image directories and a canned
//! image builder shared across the unit tests.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::{
    format::{FILE_ATTRIBUTE_DIRECTORY, FILESYSTEM_FILE_NAME},
    image::ImageWriter,
    reader::FileInfo,
    writer::Writer,
};

/// Allocates a temporary image directory.  The directory is removed when the
/// returned guard is dropped.
pub fn tempdir() -> TempDir {
    TempDir::new().expect("failed to create temporary directory")
}

/// A [`FileInfo`] describing a directory.
pub fn dir_info() -> FileInfo {
    FileInfo {
        attributes: FILE_ATTRIBUTE_DIRECTORY,
        ..Default::default()
    }
}

/// A [`FileInfo`] describing a regular file of `size` bytes.
pub fn file_info(size: u64) -> FileInfo {
    FileInfo {
        size,
        ..Default::default()
    }
}

/// Writes one entry with its content and closes the stream.
pub fn put_file(w: &mut Writer<ImageWriter>, path: &str, content: &[u8]) {
    w.write_file(path, &file_info(content.len() as u64))
        .expect("write_file");
    w.write(content).expect("write");
}

/// Builds a small image in `dir` and returns the filesystem file path:
///
/// ```text
/// Files/
///   Readme.TXT        ("hello image")
///   Windows/
///     System32/
///       config.dat    ("configuration")
/// empty/
/// ```
pub fn write_basic_image(dir: &Path) -> PathBuf {
    let fs_path = dir.join(FILESYSTEM_FILE_NAME);
    let mut w = Writer::create(&fs_path).expect("create image");
    w.write_file("Files", &dir_info()).expect("mkdir Files");
    put_file(&mut w, "Files/Readme.TXT", b"hello image");
    w.write_file("Files/Windows", &dir_info()).expect("mkdir");
    w.write_file("Files/Windows/System32", &dir_info())
        .expect("mkdir");
    put_file(&mut w, "Files/Windows/System32/config.dat", b"configuration");
    w.write_file("empty", &dir_info()).expect("mkdir empty");
    w.commit().expect("commit");
    w.close().expect("close");
    fs_path
}
