//! Thin adapter to the host image mount service.
//!
//! Mounting a finished image is the host's business: the core only splits
//! the filesystem file path into the directory/name pair the service
//! expects.  The service is an injected collaborator, never a process
//! singleton, so tests and alternative hosts can substitute their own.
//!
//! This module also defines [`FileInfoInternal`], the C-ABI record the host
//! image-building service takes for each created file.

use std::{io, path::Path};

use crate::{
    error::{CimError, ErrorKind, Result},
    format::{Filetime, Guid},
    reader::FileInfo,
};

/// The host mount service contract.
pub trait MountApi {
    fn mount_image(
        &self,
        image_dir: &Path,
        fs_name: &str,
        flags: u32,
        volume: &Guid,
    ) -> io::Result<()>;
    fn unmount_image(&self, volume: &Guid) -> io::Result<()>;
}

/// Mounts the image whose filesystem file is at `image_path` to the volume
/// `volume`.
pub fn mount_image(api: &impl MountApi, image_path: &Path, volume: &Guid) -> Result<()> {
    let dir = image_path.parent().unwrap_or(Path::new("."));
    let name = image_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            CimError::new(
                image_path,
                "mount",
                ErrorKind::bad_format("invalid filesystem file name"),
            )
        })?;
    api.mount_image(dir, name, 0, volume)
        .map_err(|e| CimError::new(image_path, "mount", e.into()))
}

/// Unmounts the volume `volume`.
pub fn unmount_image(api: &impl MountApi, volume: &Guid) -> Result<()> {
    api.unmount_image(volume)
        .map_err(|e| CimError::new(Path::new(""), "unmount", e.into()))
}

/// A filetime split into the two 32-bit halves the host ABI uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct WindowsFiletime {
    pub low: u32,
    pub high: u32,
}

impl From<Filetime> for WindowsFiletime {
    fn from(ft: Filetime) -> WindowsFiletime {
        WindowsFiletime {
            low: ft.0 as u32,
            high: (ft.0 >> 32) as u32,
        }
    }
}

/// The fixed record passed to the host image-building service when creating
/// a file.  Pointers to empty slices must be null with length zero, except
/// that the security descriptor must always be non-empty (the writer
/// rewrites empty descriptors before marshalling).
#[repr(C)]
#[derive(Debug)]
pub struct FileInfoInternal {
    pub attributes: u32,
    pub file_size: i64,
    pub creation_time: WindowsFiletime,
    pub last_write_time: WindowsFiletime,
    pub change_time: WindowsFiletime,
    pub last_access_time: WindowsFiletime,
    pub security_descriptor: *const u8,
    pub security_descriptor_size: u32,
    pub reparse_data: *const u8,
    pub reparse_data_size: u32,
    pub extended_attributes: *const u8,
    pub ea_count: u32,
}

fn slice_ptr(data: &[u8]) -> (*const u8, u32) {
    if data.is_empty() {
        (std::ptr::null(), 0)
    } else {
        (data.as_ptr(), data.len() as u32)
    }
}

impl FileInfoInternal {
    /// Marshals a [`FileInfo`] for the host ABI.  The pointers borrow from
    /// `info`, which must outlive the returned record.
    pub fn from_info(info: &FileInfo) -> FileInfoInternal {
        debug_assert!(!info.security_descriptor.is_empty());
        let (security_descriptor, security_descriptor_size) =
            slice_ptr(&info.security_descriptor);
        let (reparse_data, reparse_data_size) = slice_ptr(&info.reparse_data);
        let (extended_attributes, ea_count) = slice_ptr(&info.extended_attributes);
        FileInfoInternal {
            attributes: info.attributes,
            file_size: info.size as i64,
            creation_time: info.creation_time.into(),
            last_write_time: info.last_write_time.into(),
            change_time: info.change_time.into(),
            last_access_time: info.last_access_time.into(),
            security_descriptor,
            security_descriptor_size,
            reparse_data,
            reparse_data_size,
            extended_attributes,
            ea_count,
        }
    }
}
