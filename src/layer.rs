//! Layer expansion.
//!
//! A child image only records what its own layer changed.  Expansion walks
//! the child and, for every directory, synthesizes redirect entries for
//! parent files the child does not shadow: each gets the parent's attributes
//! plus a WCI link reparse buffer naming the parent layer and path, marked
//! sparse so its size is reported without backing data.  Entries the child
//! tombstones are unlinked so they do not shadow the parent at mount time.
//!
//! Because parents may themselves contain WCI links (from their own
//! expansion), the effective parent of a directory is found by following the
//! redirect chain across layers; the chain is bounded by the layer count.

use std::{
    collections::HashMap,
    mem::size_of,
    path::{Path, PathBuf},
};

use log::debug;
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

use crate::{
    error::{CimError, ErrorKind, Result},
    format::{
        Guid, FILE_ATTRIBUTE_REPARSE_POINT, FILE_ATTRIBUTE_SPARSE_FILE, REPARSE_TAG_WCI_LINK,
        REPARSE_TAG_WCI_TOMBSTONE,
    },
    reader::{walk, Cim, File, WalkControl},
    utf16, util,
    writer::{ImageBackend, Writer},
};

/// One parent filesystem in the layer stack.
#[derive(Clone, Debug)]
pub struct Layer {
    pub id: Guid,
    pub path: PathBuf,
}

const WCI_VERSION: u32 = 1;

/// Fixed part of the WCI link reparse buffer; the UTF-16LE target name
/// follows.
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
struct WciReparseHeader {
    tag: U32,
    size: U16,
    reserved: U16,
    version: U32,
    flags: U32,
    layer_id: Guid,
    name_length: U16,
}

/// Encodes a WCI link reparse buffer pointing at `target` (a
/// backslash-separated path with no leading separator) in the layer
/// `layer_id`.  The stored size field excludes the leading eight bytes; this
/// relationship is load-bearing for the host driver and preserved exactly.
pub fn encode_wci_link(layer_id: Guid, target: &str) -> Vec<u8> {
    let name: Vec<u16> = target.encode_utf16().collect();
    let header = WciReparseHeader {
        tag: REPARSE_TAG_WCI_LINK.into(),
        size: ((size_of::<WciReparseHeader>() - 8 + name.len() * 2) as u16).into(),
        version: WCI_VERSION.into(),
        layer_id,
        name_length: (name.len() as u16).into(),
        ..Default::default()
    };
    let mut buf = header.as_bytes().to_vec();
    for unit in name {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
    buf
}

/// Decodes a WCI link reparse buffer into the target layer and path.
pub fn decode_wci_link(data: &[u8]) -> std::result::Result<(Guid, String), ErrorKind> {
    let (header, rest) = WciReparseHeader::read_from_prefix(data)
        .map_err(|_| ErrorKind::bad_format("short WCI reparse buffer"))?;
    if header.tag.get() != REPARSE_TAG_WCI_LINK {
        return Err(ErrorKind::BadFormat(format!(
            "wrong reparse tag {:#x}",
            header.tag.get()
        )));
    }
    if header.version.get() != WCI_VERSION {
        return Err(ErrorKind::BadFormat(format!(
            "unsupported WCI version {}",
            header.version.get()
        )));
    }
    let name_bytes = header.name_length.get() as usize * 2;
    if header.size.get() as usize + 8 > data.len() || name_bytes > rest.len() {
        return Err(ErrorKind::BadFormat(format!(
            "invalid WCI reparse length {}",
            header.size.get()
        )));
    }
    Ok((header.layer_id, utf16::parse_utf16le(&rest[..name_bytes])))
}

/// Follows the redirect chain from `parent_id` to find the directory that
/// effectively backs `path`.  Returns the layer the chain ended in and the
/// backing directory, if one exists.  The chain is bounded by the layer
/// count; exceeding it means the redirects cycle.
fn find_parent(
    path: &str,
    parent_id: Guid,
    layers: &HashMap<Guid, Cim>,
    image_path: &Path,
) -> Result<(Guid, Option<File>)> {
    let mut id = parent_id;
    let mut path = path.to_string();
    for _ in 0..layers.len() {
        let layer = layers.get(&id).ok_or_else(|| {
            CimError::new(image_path, "expand", ErrorKind::BadFormat(format!("unknown layer {id}")))
                .path(path.clone())
        })?;
        let (file, rest) = layer.root()?.walk_path(&path)?;
        if !file.is_dir() {
            return Ok((id, None));
        }
        if file.reparse_tag() != REPARSE_TAG_WCI_LINK {
            if rest.is_empty() {
                return Ok((id, Some(file)));
            }
            return Ok((id, None));
        }
        let info = file.stat()?;
        let (next_id, target) = decode_wci_link(&info.reparse_data).map_err(|kind| {
            CimError::new(layer.image_path(), "expand", kind).path(file.name().to_string())
        })?;
        let base = target.replace('\\', "/");
        path = if rest.is_empty() {
            base
        } else {
            format!("{}/{rest}", base.trim_end_matches('/'))
        };
        id = next_id;
    }
    Err(CimError::new(image_path, "expand", ErrorKind::LayerLoop).path(path))
}

/// Materializes the layer stack under the child image at `image_path` into
/// the append-mode writer `w`: walks the child's subtree `prefix`, unlinks
/// tombstoned entries, and synthesizes redirect entries for unshadowed
/// parent files.  `parent_id` names the immediate parent within `layers`.
/// The caller commits the writer.
pub fn expand<B: ImageBackend>(
    w: &mut Writer<B>,
    image_path: &Path,
    prefix: &str,
    parent_id: Guid,
    layers: &[Layer],
) -> Result<()> {
    let child = Cim::open(image_path)?;
    let mut readers = HashMap::new();
    for layer in layers {
        readers.insert(layer.id, Cim::open(&layer.path)?);
    }
    if !readers.contains_key(&parent_id) {
        return Err(CimError::new(
            image_path,
            "expand",
            ErrorKind::bad_format("parent layer does not exist"),
        ));
    }

    let start = if prefix.is_empty() {
        child.root()?
    } else {
        match child.open_file(&util::join("/", prefix)) {
            Ok(file) => file,
            Err(err) if matches!(err.kind, ErrorKind::FileNotFound) => return Ok(()),
            Err(err) => return Err(err),
        }
    };
    debug!("expanding {} under {}", image_path.display(), start.name());

    walk(&start, &mut |file, stream| {
        if stream.is_some() {
            return Ok(WalkControl::Continue);
        }
        if file.reparse_tag() == REPARSE_TAG_WCI_TOMBSTONE {
            w.unlink(file.name())?;
        }
        if !file.is_dir() {
            return Ok(WalkControl::Continue);
        }

        let (layer_id, parent_dir) = find_parent(file.name(), parent_id, &readers, image_path)?;
        let Some(parent_dir) = parent_dir else {
            return Ok(WalkControl::Continue);
        };

        for name in parent_dir.readdir()? {
            // Entries already present in the child shadow the parent; this
            // also covers tombstones.
            match file.open_at(&name) {
                Ok(_) => continue,
                Err(err) if matches!(err.kind, ErrorKind::FileNotFound) => {}
                Err(err) => return Err(err),
            }
            let source = parent_dir.open_at(&name)?;
            let mut info = source.stat()?;
            if info.reparse_data.is_empty() {
                // Redirect to the parent file; sparse, so the size is
                // reported without backing data.
                let target = util::normalize_image_path(source.name());
                info.reparse_data = encode_wci_link(layer_id, &target);
                info.reparse_tag = REPARSE_TAG_WCI_LINK;
                info.attributes |= FILE_ATTRIBUTE_REPARSE_POINT | FILE_ATTRIBUTE_SPARSE_FILE;
            }
            w.write_file(&util::join(file.name(), &name), &info)?;
        }
        Ok(WalkControl::Continue)
    })
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_wci_link_round_trip() {
        let id = Guid::generate();
        let buf = encode_wci_link(id, "Files\\Windows\\System32");
        let (decoded_id, target) = decode_wci_link(&buf).unwrap();
        assert_eq!(decoded_id, id);
        assert_eq!(target, "Files\\Windows\\System32");
    }

    #[test]
    fn test_wci_link_size_field() {
        // size excludes the leading 8 bytes of the buffer
        let buf = encode_wci_link(Guid::default(), "ab");
        assert_eq!(buf.len(), size_of::<WciReparseHeader>() + 4);
        let size = u16::from_le_bytes([buf[4], buf[5]]);
        assert_eq!(size as usize, buf.len() - 8);
    }

    #[test]
    fn test_decode_rejects_bad_buffers() {
        assert!(decode_wci_link(&[0; 4]).is_err());

        let mut buf = encode_wci_link(Guid::default(), "x");
        buf[0] = 0; // clobber the tag
        assert!(decode_wci_link(&buf).is_err());

        let mut buf = encode_wci_link(Guid::default(), "x");
        buf[8] = 9; // unsupported version
        assert!(decode_wci_link(&buf).is_err());

        let mut buf = encode_wci_link(Guid::default(), "x");
        let oversize = (buf.len() as u16).to_le_bytes();
        buf[4] = oversize[0];
        buf[5] = oversize[1];
        assert!(decode_wci_link(&buf).is_err());
    }
}
