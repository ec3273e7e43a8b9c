//! Image reading and path resolution.
//!
//! This module opens the region set of an image (including all parent
//! images), validates every header, and exposes file handles that resolve
//! paths through the case-insensitive sorted link tables, read file data
//! (including remapped PE image streams), and enumerate directories and
//! alternate streams.
//!
//! A [`Cim`] is cheap to clone; [`File`] handles share the underlying region
//! descriptors.  The inode, security-descriptor and directory-table caches
//! are guarded by a single mutex and never invalidated: the format is
//! append-only per filesystem file.

use std::{
    collections::HashMap,
    fs,
    io,
    mem::size_of,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use log::debug;
use zerocopy::FromBytes;

use crate::{
    error::{CimError, ErrorKind, Result},
    format::{
        self, FileId, FileRecord, Filesystem, FilesystemHeader, FileTableDirectoryEntry, Filetime,
        Guid, PeImage, PeImageMapping, RegionHeader, RegionOffset, RegionSet, StreamType,
        FILES_PER_TABLE, FILE_ATTRIBUTE_ARCHIVE, FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_HIDDEN,
        FILE_ATTRIBUTE_READONLY, FILE_ATTRIBUTE_REPARSE_POINT, FILE_ATTRIBUTE_SYSTEM,
        FILE_FLAG_ARCHIVE, FILE_FLAG_HIDDEN, FILE_FLAG_READ_ONLY, FILE_FLAG_SYSTEM, FT_FILESYSTEM,
        FT_REGION, LINK_TABLE_ENTRY_FILE_ID, LINK_TABLE_ENTRY_STREAM, MAGIC,
        UPCASE_TABLE_LENGTH, VERSION_MAJOR,
    },
    utf16, util,
};

/// Metadata for one file of an image, as returned by [`File::stat`] and as
/// accepted by the writer when declaring a new entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileInfo {
    /// The file ID; zero when the info describes an entry to be written.
    pub file_id: FileId,
    pub size: u64,
    pub attributes: u32,
    pub reparse_tag: u32,
    pub creation_time: Filetime,
    pub last_write_time: Filetime,
    pub change_time: Filetime,
    pub last_access_time: Filetime,
    pub security_descriptor: Vec<u8>,
    pub extended_attributes: Vec<u8>,
    pub reparse_data: Vec<u8>,
}

/// A directory entry name paired with the file ID it resolves to.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub file_id: FileId,
}

/// Name and size of an alternate data stream.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    pub name: String,
    pub size: u64,
}

struct Region {
    file: fs::File,
    size: u64,
}

pub(crate) struct Inode {
    pub(crate) id: FileId,
    pub(crate) record: FileRecord,
}

impl Inode {
    pub(crate) fn is_dir(&self) -> bool {
        self.record.default_stream.stream_type() == Some(StreamType::LinkTable)
    }
}

#[derive(Default)]
struct Caches {
    ftables: Vec<Option<Arc<[u8]>>>,
    inodes: HashMap<FileId, Arc<Inode>>,
    dir_tables: HashMap<FileId, Arc<[u8]>>,
    sds: HashMap<u64, Arc<[u8]>>,
}

pub(crate) struct CimInner {
    image_path: PathBuf,
    regions: Vec<Region>,
    /// Region sets in load order: parents first, the image's own set last.
    region_sets: Vec<(Guid, u16)>,
    ftdes: Vec<FileTableDirectoryEntry>,
    upcase: Arc<Vec<u16>>,
    upcase_offset: RegionOffset,
    root: FileId,
    caches: Mutex<Caches>,
}

/// An opened image: the filesystem file plus every region file of its own and
/// its parents' region sets.
#[derive(Clone)]
pub struct Cim {
    inner: Arc<CimInner>,
}

/// An open file handle.  The handle owns its resolved path, a reference to
/// the immutable inode, and a read cursor.  A single handle's cursor is not
/// synchronized; callers serialize reads on one handle.
pub struct File {
    cim: Arc<CimInner>,
    name: String,
    ino: Arc<Inode>,
    offset: u64,
    pe: Option<PeState>,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("name", &self.name)
            .field("offset", &self.offset)
            .finish()
    }
}

struct PeState {
    data_offset: RegionOffset,
    data_length: u64,
    mappings: Vec<(u32, u32)>,
}

/// An open alternate data stream, with its own read cursor.
pub struct Stream {
    cim: Arc<CimInner>,
    file_name: String,
    name: String,
    record: format::Stream,
    offset: u64,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("file_name", &self.file_name)
            .field("name", &self.name)
            .field("offset", &self.offset)
            .finish()
    }
}

/// Flow control returned by a [`walk`] visitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    /// Skip the children of the directory just visited.
    SkipDir,
}

fn validate_common(header: &format::CommonHeader, file_type: u8) -> std::result::Result<(), ErrorKind> {
    if header.magic != MAGIC {
        return Err(ErrorKind::bad_format("bad magic"));
    }
    if header.version_major.get() != VERSION_MAJOR {
        return Err(ErrorKind::BadFormat(format!(
            "unsupported version {}.{}",
            header.version_major.get(),
            header.version_minor.get()
        )));
    }
    if header.file_type != file_type {
        return Err(ErrorKind::BadFormat(format!(
            "unexpected file type {}",
            header.file_type
        )));
    }
    Ok(())
}

fn read_struct_at<T: FromBytes>(file: &fs::File, offset: u64) -> io::Result<T> {
    let mut buf = vec![0u8; size_of::<T>()];
    file.read_exact_at(&mut buf, offset)?;
    Ok(T::read_from_bytes(&buf).unwrap())
}

impl Cim {
    /// Opens the image whose filesystem file is at `image_path`.  Region
    /// files are expected in the same directory, parents' sets included.
    pub fn open(image_path: impl AsRef<Path>) -> Result<Cim> {
        let image_path = image_path.as_ref();
        let inner = CimInner::open(image_path)
            .map_err(|kind| CimError::new(image_path, "open", kind))?;
        Ok(Cim {
            inner: Arc::new(inner),
        })
    }

    /// Opens the root directory.
    pub fn root(&self) -> Result<File> {
        self.open_id(self.inner.root)
            .map(|mut f| {
                f.name = "/".to_string();
                f
            })
    }

    /// Opens the file at `path`, resolved from the root.  A trailing `/`
    /// asserts that the target is a directory.
    pub fn open_file(&self, path: &str) -> Result<File> {
        File::open_common(&self.inner, None, path)
    }

    /// Opens a file directly by its file ID.
    pub fn open_id(&self, id: FileId) -> Result<File> {
        let ino = self
            .inner
            .inode(id)
            .map_err(|kind| self.inner.err("openid", kind))?;
        Ok(File {
            cim: self.inner.clone(),
            name: String::new(),
            ino,
            offset: 0,
            pe: None,
        })
    }

    /// The path this image was opened from.
    pub fn image_path(&self) -> &Path {
        &self.inner.image_path
    }

    pub(crate) fn region_sets(&self) -> &[(Guid, u16)] {
        &self.inner.region_sets
    }

    pub(crate) fn region_count(&self) -> usize {
        self.inner.regions.len()
    }

    pub(crate) fn upcase(&self) -> Arc<Vec<u16>> {
        self.inner.upcase.clone()
    }

    pub(crate) fn upcase_offset(&self) -> RegionOffset {
        self.inner.upcase_offset
    }
}

impl CimInner {
    fn open(image_path: &Path) -> std::result::Result<CimInner, ErrorKind> {
        let dir = image_path.parent().unwrap_or(Path::new("."));
        let fs_file = fs::File::open(image_path)?;

        let header: FilesystemHeader = read_struct_at(&fs_file, 0)?;
        validate_common(&header.common, FT_FILESYSTEM)?;
        let parent_count = header.parent_count.get() as usize;
        let expected_length = size_of::<FilesystemHeader>() + parent_count * size_of::<RegionSet>();
        if header.common.header_length.get() as usize != expected_length {
            return Err(ErrorKind::BadFormat(format!(
                "inconsistent header length {}",
                header.common.header_length.get()
            )));
        }

        let mut sets = Vec::with_capacity(parent_count + 1);
        for i in 0..parent_count {
            let offset = (size_of::<FilesystemHeader>() + i * size_of::<RegionSet>()) as u64;
            let set: RegionSet = read_struct_at(&fs_file, offset)?;
            sets.push(set);
        }
        sets.push(header.regions);

        let region_count: usize = sets.iter().map(|s| s.count.get() as usize).sum();
        if region_count == 0 || region_count > 0x10000 {
            return Err(ErrorKind::BadFormat(format!(
                "invalid region count {region_count}"
            )));
        }

        let mut regions = Vec::with_capacity(region_count);
        for set in &sets {
            for i in 0..set.count.get() {
                let name = format!("{}_{}_{}", format::REGION_FILE_PREFIX, set.id, i);
                let file = fs::File::open(dir.join(&name))?;
                let size = file.metadata()?.len();
                let region_header: RegionHeader = read_struct_at(&file, 0)?;
                validate_common(&region_header.common, FT_REGION)?;
                if region_header.common.header_length.get() as usize != size_of::<RegionHeader>() {
                    return Err(ErrorKind::BadFormat(format!(
                        "inconsistent region header length in {name}"
                    )));
                }
                regions.push(Region { file, size });
            }
        }

        let mut inner = CimInner {
            image_path: image_path.to_path_buf(),
            regions,
            region_sets: sets.iter().map(|s| (s.id, s.count.get())).collect(),
            ftdes: Vec::new(),
            upcase: Arc::new(Vec::new()),
            upcase_offset: RegionOffset::NULL,
            root: FileId(0),
            caches: Mutex::new(Caches::default()),
        };

        let filesystem: Filesystem = inner.read_struct(header.filesystem_offset, 0)?;

        let ftd_len = filesystem.file_table_directory_length.get() as usize;
        let mut ftd_bytes = vec![0u8; ftd_len * size_of::<FileTableDirectoryEntry>()];
        inner.read_at(filesystem.file_table_directory_offset, 0, &mut ftd_bytes)?;
        inner.ftdes = ftd_bytes
            .chunks_exact(size_of::<FileTableDirectoryEntry>())
            .map(|chunk| FileTableDirectoryEntry::read_from_bytes(chunk).unwrap())
            .collect();
        inner.caches.get_mut().unwrap().ftables = vec![None; ftd_len];

        let mut upcase_bytes = vec![0u8; UPCASE_TABLE_LENGTH * 2];
        inner.read_at(filesystem.upcase_table_offset, 0, &mut upcase_bytes)?;
        inner.upcase = Arc::new(
            upcase_bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect(),
        );
        inner.upcase_offset = filesystem.upcase_table_offset;

        inner.root = FileId(filesystem.root_directory.get());
        let root = inner.inode(inner.root)?;
        if !root.is_dir() {
            return Err(ErrorKind::bad_format("root is not a directory"));
        }

        debug!(
            "opened image {} with {} regions ({} parents)",
            image_path.display(),
            inner.regions.len(),
            parent_count
        );
        Ok(inner)
    }

    fn err(&self, op: &'static str, kind: ErrorKind) -> CimError {
        CimError::new(&self.image_path, op, kind)
    }

    /// Resolves a region offset plus a relative offset to a validated byte
    /// range of `len` bytes within a region file.
    fn check_range(
        &self,
        off: RegionOffset,
        rel: u64,
        len: u64,
    ) -> std::result::Result<(&Region, u64), ErrorKind> {
        if off.is_null() {
            return Err(ErrorKind::BadOffset(off.raw()));
        }
        let region = self
            .regions
            .get(off.region_index() as usize)
            .ok_or(ErrorKind::BadOffset(off.raw()))?;
        let start = off
            .byte_offset()
            .checked_add(rel)
            .ok_or(ErrorKind::BadOffset(off.raw()))?;
        let end = start.checked_add(len).ok_or(ErrorKind::BadOffset(off.raw()))?;
        if end > region.size {
            return Err(ErrorKind::BadOffset(off.raw()));
        }
        Ok((region, start))
    }

    fn read_at(
        &self,
        off: RegionOffset,
        rel: u64,
        buf: &mut [u8],
    ) -> std::result::Result<(), ErrorKind> {
        let (region, start) = self.check_range(off, rel, buf.len() as u64)?;
        region.file.read_exact_at(buf, start)?;
        Ok(())
    }

    fn read_struct<T: FromBytes>(
        &self,
        off: RegionOffset,
        rel: u64,
    ) -> std::result::Result<T, ErrorKind> {
        let mut buf = vec![0u8; size_of::<T>()];
        self.read_at(off, rel, &mut buf)?;
        Ok(T::read_from_bytes(&buf).unwrap())
    }

    /// Reads a u16-counted byte blob.
    fn read_counted16(&self, off: RegionOffset) -> std::result::Result<Vec<u8>, ErrorKind> {
        let mut len = [0u8; 2];
        self.read_at(off, 0, &mut len)?;
        let mut buf = vec![0u8; u16::from_le_bytes(len) as usize];
        self.read_at(off, 2, &mut buf)?;
        Ok(buf)
    }

    /// Fetches the raw record for a file ID, zero-extending records written
    /// by older format revisions.
    fn file_record(&self, id: FileId) -> std::result::Result<FileRecord, ErrorKind> {
        if id.is_null() {
            return Err(ErrorKind::BadFormat(format!("invalid file id {id}")));
        }
        let table = ((id.0 - 1) / FILES_PER_TABLE) as usize;
        let index = ((id.0 - 1) % FILES_PER_TABLE) as usize;
        let ftde = self
            .ftdes
            .get(table)
            .filter(|e| index < e.count.get() as usize)
            .ok_or_else(|| ErrorKind::BadFormat(format!("invalid file id {id}")))?;
        let entry_size = ftde.entry_size.get() as usize;

        let slab = {
            let caches = self.caches.lock().unwrap();
            caches.ftables[table].clone()
        };
        let slab = match slab {
            Some(slab) => slab,
            None => {
                let mut bytes = vec![0u8; ftde.count.get() as usize * entry_size];
                self.read_at(ftde.offset, 0, &mut bytes)?;
                let slab: Arc<[u8]> = bytes.into();
                let mut caches = self.caches.lock().unwrap();
                caches.ftables[table].get_or_insert_with(|| slab).clone()
            }
        };

        let mut buf = [0u8; size_of::<FileRecord>()];
        let take = entry_size.min(buf.len());
        buf[..take].copy_from_slice(&slab[index * entry_size..index * entry_size + take]);
        Ok(FileRecord::read_from_bytes(&buf).unwrap())
    }

    pub(crate) fn inode(&self, id: FileId) -> std::result::Result<Arc<Inode>, ErrorKind> {
        {
            let caches = self.caches.lock().unwrap();
            if let Some(ino) = caches.inodes.get(&id) {
                return Ok(ino.clone());
            }
        }
        let record = self.file_record(id)?;
        let raw = record.default_stream.raw_type();
        if record.default_stream.stream_type().is_none() {
            return Err(ErrorKind::UnsupportedStreamType(raw));
        }
        let ino = Arc::new(Inode { id, record });
        let mut caches = self.caches.lock().unwrap();
        Ok(caches.inodes.entry(id).or_insert(ino).clone())
    }

    fn security_descriptor(
        &self,
        off: RegionOffset,
    ) -> std::result::Result<Arc<[u8]>, ErrorKind> {
        {
            let caches = self.caches.lock().unwrap();
            if let Some(sd) = caches.sds.get(&off.raw()) {
                return Ok(sd.clone());
            }
        }
        let sd: Arc<[u8]> = self.read_counted16(off)?.into();
        let mut caches = self.caches.lock().unwrap();
        Ok(caches.sds.entry(off.raw()).or_insert(sd).clone())
    }

    /// Returns a directory's link table, or `None` for an empty directory.
    fn directory_table(
        &self,
        ino: &Inode,
    ) -> std::result::Result<Option<Arc<[u8]>>, ErrorKind> {
        let stream = &ino.record.default_stream;
        let size = stream.size();
        if size == 0 {
            return Ok(None);
        }
        {
            let caches = self.caches.lock().unwrap();
            if let Some(table) = caches.dir_tables.get(&ino.id) {
                return Ok(Some(table.clone()));
            }
        }
        if size < size_of::<format::LinkTableHeader>() as u64 {
            return Err(ErrorKind::BadFormat(format!("invalid link table size {size}")));
        }
        let mut bytes = vec![0u8; size as usize];
        self.read_at(stream.data_offset, 0, &mut bytes)?;
        validate_link_table(&mut bytes, LINK_TABLE_ENTRY_FILE_ID)?;
        let table: Arc<[u8]> = bytes.into();
        let mut caches = self.caches.lock().unwrap();
        Ok(Some(caches.dir_tables.entry(ino.id).or_insert(table).clone()))
    }

    /// Returns a file's alternate stream table, or `None` if it has none.
    fn stream_table(&self, ino: &Inode) -> std::result::Result<Option<Vec<u8>>, ErrorKind> {
        let off = ino.record.stream_table_offset;
        if off.is_null() {
            return Ok(None);
        }
        let header: format::LinkTableHeader = self.read_struct(off, 0)?;
        let length = header.length.get() as usize;
        if length < size_of::<format::LinkTableHeader>() {
            return Err(ErrorKind::BadFormat(format!(
                "invalid link table size {length}"
            )));
        }
        let mut bytes = vec![0u8; length];
        self.read_at(off, 0, &mut bytes)?;
        validate_link_table(&mut bytes, LINK_TABLE_ENTRY_STREAM)?;
        Ok(Some(bytes))
    }

    fn find_child(
        &self,
        ino: &Inode,
        name: &str,
    ) -> std::result::Result<Option<FileId>, ErrorKind> {
        let Some(table) = self.directory_table(ino)? else {
            return Ok(None);
        };
        let Some(entry) = bsearch_link_table(&table, LINK_TABLE_ENTRY_FILE_ID, name, &self.upcase)?
        else {
            return Ok(None);
        };
        Ok(Some(FileId(u32::from_le_bytes(entry.try_into().unwrap()))))
    }

    fn stat(&self, ino: &Inode) -> std::result::Result<FileInfo, ErrorKind> {
        let record = &ino.record;
        let mut info = FileInfo {
            file_id: ino.id,
            size: record.default_stream.size(),
            reparse_tag: record.reparse_tag.get(),
            creation_time: Filetime(record.creation_time.get()),
            last_write_time: Filetime(record.last_write_time.get()),
            change_time: Filetime(record.change_time.get()),
            last_access_time: Filetime(record.last_access_time.get()),
            ..Default::default()
        };
        let flags = record.flags.get();
        if flags & FILE_FLAG_READ_ONLY != 0 {
            info.attributes |= FILE_ATTRIBUTE_READONLY;
        }
        if flags & FILE_FLAG_HIDDEN != 0 {
            info.attributes |= FILE_ATTRIBUTE_HIDDEN;
        }
        if flags & FILE_FLAG_SYSTEM != 0 {
            info.attributes |= FILE_ATTRIBUTE_SYSTEM;
        }
        if flags & FILE_FLAG_ARCHIVE != 0 {
            info.attributes |= FILE_ATTRIBUTE_ARCHIVE;
        }
        if ino.is_dir() {
            info.attributes |= FILE_ATTRIBUTE_DIRECTORY;
        }
        if !record.sd_offset.is_null() {
            info.security_descriptor = self.security_descriptor(record.sd_offset)?.to_vec();
        }
        if !record.ea_offset.is_null() {
            let mut ea = vec![0u8; record.ea_length.get() as usize];
            self.read_at(record.ea_offset, 0, &mut ea)?;
            info.extended_attributes = ea;
        }
        if !record.reparse_offset.is_null() {
            info.reparse_data = self.read_counted16(record.reparse_offset)?;
            info.attributes |= FILE_ATTRIBUTE_REPARSE_POINT;
        }
        Ok(info)
    }

    /// Reads from a plain data stream at the given cursor, zero-filling
    /// sparse streams (a null data offset with a nonzero size).
    fn read_data_stream(
        &self,
        stream: &format::Stream,
        offset: u64,
        buf: &mut [u8],
    ) -> std::result::Result<usize, ErrorKind> {
        let remaining = stream.size().saturating_sub(offset);
        if remaining == 0 {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(remaining) as usize;
        if stream.data_offset.is_null() {
            buf[..n].fill(0);
        } else {
            self.read_at(stream.data_offset, offset, &mut buf[..n])?;
        }
        Ok(n)
    }
}

fn validate_link_table(
    bytes: &mut Vec<u8>,
    entry_size: usize,
) -> std::result::Result<(), ErrorKind> {
    let length = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    if length < size_of::<format::LinkTableHeader>() || length > bytes.len() {
        return Err(ErrorKind::BadFormat(format!(
            "link table size mismatch {} > {}",
            length,
            bytes.len()
        )));
    }
    bytes.truncate(length);
    let count = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
    let max_count = (length - 8) / (entry_size + 4);
    if count > max_count {
        return Err(ErrorKind::BadFormat(format!(
            "link table count mismatch {count} > {max_count}"
        )));
    }
    Ok(())
}

/// Parses the `i`th name of a link table, validating the name offset and
/// length against the table bounds.
fn parse_name(
    table: &[u8],
    count: usize,
    entry_size: usize,
    i: usize,
) -> std::result::Result<&[u8], ErrorKind> {
    let offsets = 8 + count * entry_size;
    let pos = offsets + i * 4;
    let name_offset = u32::from_le_bytes(table[pos..pos + 4].try_into().unwrap()) as usize;
    if name_offset + 2 > table.len() {
        return Err(ErrorKind::BadFormat(format!(
            "invalid name offset {name_offset}"
        )));
    }
    let name_len =
        u16::from_le_bytes(table[name_offset..name_offset + 2].try_into().unwrap()) as usize;
    if name_len > (table.len() - name_offset - 2) / 2 {
        return Err(ErrorKind::BadFormat(format!("invalid name length {name_len}")));
    }
    Ok(&table[name_offset + 2..name_offset + 2 + name_len * 2])
}

/// Binary search over a sorted link table.  Returns the matching value bytes.
fn bsearch_link_table<'a>(
    table: &'a [u8],
    entry_size: usize,
    name: &str,
    upcase: &[u16],
) -> std::result::Result<Option<&'a [u8]>, ErrorKind> {
    let count = u32::from_le_bytes(table[4..8].try_into().unwrap()) as usize;
    let mut lo = 0;
    let mut hi = count;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let entry_name = parse_name(table, count, entry_size, mid)?;
        match utf16::cmp_utf8_utf16le(name, entry_name, upcase) {
            std::cmp::Ordering::Less => hi = mid,
            std::cmp::Ordering::Greater => lo = mid + 1,
            std::cmp::Ordering::Equal => {
                return Ok(Some(&table[8 + mid * entry_size..8 + (mid + 1) * entry_size]));
            }
        }
    }
    Ok(None)
}

/// Iterates a link table in stored order, yielding each name and value.
fn enum_link_table<'a>(
    table: &'a [u8],
    entry_size: usize,
    mut f: impl FnMut(String, &'a [u8]) -> std::result::Result<(), ErrorKind>,
) -> std::result::Result<(), ErrorKind> {
    let count = u32::from_le_bytes(table[4..8].try_into().unwrap()) as usize;
    for i in 0..count {
        let name = parse_name(table, count, entry_size, i)?;
        f(
            utf16::parse_utf16le(name),
            &table[8 + i * entry_size..8 + (i + 1) * entry_size],
        )?;
    }
    Ok(())
}

impl File {
    fn open_common(cim: &Arc<CimInner>, dirf: Option<&File>, path: &str) -> Result<File> {
        let dir_only = path.ends_with('/');
        let cleaned = util::clean(path);
        let absolute = cleaned.starts_with('/');

        // The full requested path, for error reporting and the handle name.
        let full = match dirf {
            Some(dirf) if !absolute => {
                if cleaned == "." {
                    dirf.name.clone()
                } else {
                    util::join(&dirf.name, &cleaned)
                }
            }
            _ => {
                if absolute {
                    cleaned.clone()
                } else if cleaned == "." {
                    "/".to_string()
                } else {
                    util::join("/", &cleaned)
                }
            }
        };

        let mut ino = match dirf {
            Some(dirf) if !absolute => {
                if !dirf.is_dir() {
                    return Err(cim
                        .err("openat", ErrorKind::NotADirectory)
                        .path(dirf.name.clone()));
                }
                dirf.ino.clone()
            }
            _ => cim
                .inode(cim.root)
                .map_err(|kind| cim.err("openat", kind))?,
        };

        let rel = cleaned.trim_start_matches('/');
        if !rel.is_empty() && rel != "." {
            for segment in rel.split('/') {
                if !ino.is_dir() {
                    return Err(cim
                        .err("openat", ErrorKind::NotADirectory)
                        .path(full.clone()));
                }
                let child = cim
                    .find_child(&ino, segment)
                    .map_err(|kind| cim.err("openat", kind).path(full.clone()))?;
                let Some(child) = child else {
                    return Err(cim
                        .err("openat", ErrorKind::FileNotFound)
                        .path(full.clone()));
                };
                ino = cim
                    .inode(child)
                    .map_err(|kind| cim.err("openat", kind).path(full.clone()))?;
            }
        }

        if dir_only && !ino.is_dir() {
            return Err(cim.err("openat", ErrorKind::NotADirectory).path(full));
        }

        Ok(File {
            cim: cim.clone(),
            name: full,
            ino,
            offset: 0,
            pe: None,
        })
    }

    /// Opens a path relative to this file (which must be a directory unless
    /// the path is absolute).
    pub fn open_at(&self, path: &str) -> Result<File> {
        File::open_common(&self.cim, Some(self), path)
    }

    /// The resolved path of this handle.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dir(&self) -> bool {
        self.ino.is_dir()
    }

    pub fn file_id(&self) -> FileId {
        self.ino.id
    }

    pub fn reparse_tag(&self) -> u32 {
        self.ino.record.reparse_tag.get()
    }

    /// Size of the default stream.  For PE image streams this is the aligned
    /// in-memory image size.
    pub fn size(&self) -> u64 {
        self.ino.record.default_stream.size()
    }

    pub(crate) fn record(&self) -> &FileRecord {
        &self.ino.record
    }

    pub(crate) fn image_path(&self) -> &Path {
        &self.cim.image_path
    }

    /// Returns this file's metadata, including the security descriptor,
    /// extended attributes and reparse data blobs.
    pub fn stat(&self) -> Result<FileInfo> {
        self.cim
            .stat(&self.ino)
            .map_err(|kind| self.cim.err("stat", kind).path(self.name.clone()))
    }

    fn pe_state(&mut self) -> std::result::Result<&PeState, ErrorKind> {
        if self.pe.is_none() {
            let stream = &self.ino.record.default_stream;
            let descriptor: PeImage = self.cim.read_struct(stream.data_offset, 0)?;
            let count = descriptor.mapping_count.get() as usize;
            let mut bytes = vec![0u8; count * size_of::<PeImageMapping>()];
            self.cim
                .read_at(stream.data_offset, size_of::<PeImage>() as u64, &mut bytes)?;
            let mappings = bytes
                .chunks_exact(size_of::<PeImageMapping>())
                .map(|chunk| {
                    let m = PeImageMapping::read_from_bytes(chunk).unwrap();
                    (m.file_offset.get(), m.delta.get())
                })
                .collect();
            self.pe = Some(PeState {
                data_offset: descriptor.data_offset,
                // avoid ever producing negative lengths downstream
                data_length: descriptor.data_length.get() & 0x7fff_ffff_ffff_ffff,
                mappings,
            });
        }
        Ok(self.pe.as_ref().unwrap())
    }

    fn read_inner(&mut self, buf: &mut [u8]) -> std::result::Result<usize, ErrorKind> {
        if self.is_dir() {
            return Err(ErrorKind::IsADirectory);
        }
        let stream = self.ino.record.default_stream;
        match stream.stream_type() {
            Some(StreamType::Data) => {
                let n = self.cim.read_data_stream(&stream, self.offset, buf)?;
                self.offset += n as u64;
                Ok(n)
            }
            Some(StreamType::PeImage) => self.read_pe(&stream, buf),
            _ => Err(ErrorKind::UnsupportedStreamType(stream.raw_type())),
        }
    }

    /// Reads from a PE image stream.  The on-disk data is dense; the mapping
    /// table translates the logical (in-memory) offset to the on-disk offset
    /// by subtracting the mapping's delta.  Logical offsets past the dense
    /// data read as zeros up to the aligned image size.
    fn read_pe(
        &mut self,
        stream: &format::Stream,
        buf: &mut [u8],
    ) -> std::result::Result<usize, ErrorKind> {
        let remaining = stream.size().saturating_sub(self.offset);
        if remaining == 0 {
            return Ok(0);
        }
        let offset = self.offset;
        let (delta, segment_end, data_offset) = {
            let pe = self.pe_state()?;
            let mut delta = 0u64;
            let mut segment_end = pe.data_length;
            for (file_offset, mapping_delta) in &pe.mappings {
                if *file_offset as u64 > offset {
                    segment_end = *file_offset as u64;
                    break;
                }
                delta = *mapping_delta as u64;
            }
            (delta, segment_end, pe.data_offset)
        };

        let mut n = (buf.len() as u64).min(remaining) as usize;
        let available = segment_end.saturating_sub(offset);
        if available == 0 {
            // Past the dense data: the aligned tail of the image is zeros.
            buf[..n].fill(0);
        } else {
            n = n.min(available as usize);
            let physical = offset
                .checked_sub(delta)
                .ok_or_else(|| ErrorKind::bad_format("pe mapping delta exceeds offset"))?;
            self.cim.read_at(data_offset, physical, &mut buf[..n])?;
        }
        self.offset += n as u64;
        Ok(n)
    }

    /// Reads from the default stream at the cursor.  Returns `Ok(0)` at end
    /// of stream; no data beyond the declared size is ever returned.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let name = self.name.clone();
        self.read_inner(buf)
            .map_err(|kind| self.cim.err("read", kind).path(name))
    }

    /// Returns the names of this directory's children, in stored order.
    pub fn readdir(&self) -> Result<Vec<String>> {
        Ok(self
            .read_dir_entries()?
            .into_iter()
            .map(|e| e.name)
            .collect())
    }

    /// Returns this directory's entries with the file IDs they resolve to.
    pub fn read_dir_entries(&self) -> Result<Vec<DirEntry>> {
        let err = |kind| {
            self.cim
                .err("readdir", kind)
                .path(self.name.clone())
        };
        if !self.is_dir() {
            return Err(err(ErrorKind::NotADirectory));
        }
        let mut entries = Vec::new();
        if let Some(table) = self.cim.directory_table(&self.ino).map_err(err)? {
            enum_link_table(&table, LINK_TABLE_ENTRY_FILE_ID, |name, value| {
                entries.push(DirEntry {
                    name,
                    file_id: FileId(u32::from_le_bytes(value.try_into().unwrap())),
                });
                Ok(())
            })
            .map_err(err)?;
        }
        Ok(entries)
    }

    /// Lists this file's alternate data streams.
    pub fn readstreams(&self) -> Result<Vec<StreamInfo>> {
        Ok(self
            .stream_entries()
            .map_err(|kind| {
                self.cim
                    .err("readstreams", kind)
                    .path(self.name.clone())
            })?
            .into_iter()
            .map(|(name, record)| StreamInfo {
                name,
                size: record.size(),
            })
            .collect())
    }

    pub(crate) fn stream_entries(
        &self,
    ) -> std::result::Result<Vec<(String, format::Stream)>, ErrorKind> {
        let mut entries = Vec::new();
        if let Some(table) = self.cim.stream_table(&self.ino)? {
            enum_link_table(&table, LINK_TABLE_ENTRY_STREAM, |name, value| {
                entries.push((name, format::Stream::read_from_bytes(value).unwrap()));
                Ok(())
            })?;
        }
        Ok(entries)
    }

    /// Opens the named alternate data stream.  Alternate streams are always
    /// plain data; any other stream type is rejected.
    pub fn open_stream(&self, name: &str) -> Result<Stream> {
        let err = |kind: ErrorKind| {
            self.cim
                .err("openstream", kind)
                .path(self.name.clone())
                .stream(name.to_string())
        };
        let table = self
            .cim
            .stream_table(&self.ino)
            .map_err(&err)?
            .ok_or_else(|| err(ErrorKind::FileNotFound))?;
        let entry = bsearch_link_table(&table, LINK_TABLE_ENTRY_STREAM, name, &self.cim.upcase)
            .map_err(&err)?
            .ok_or_else(|| err(ErrorKind::FileNotFound))?;
        let record = format::Stream::read_from_bytes(entry).unwrap();
        if record.stream_type() != Some(StreamType::Data) {
            return Err(err(ErrorKind::UnsupportedStreamType(record.raw_type())));
        }
        Ok(Stream {
            cim: self.cim.clone(),
            file_name: self.name.clone(),
            name: name.to_string(),
            record,
            offset: 0,
        })
    }

    /// Resolves as much of `path` as possible, stopping at the first
    /// component that is missing, not a directory, or carries a reparse
    /// point.  Returns the deepest file reached and the unresolved remainder
    /// (empty if the path fully resolved).
    pub fn walk_path(&self, path: &str) -> Result<(File, String)> {
        let cleaned = util::clean(path);
        let rel = cleaned.trim_start_matches('/');
        let mut current = File {
            cim: self.cim.clone(),
            name: self.name.clone(),
            ino: self.ino.clone(),
            offset: 0,
            pe: None,
        };
        if rel.is_empty() || rel == "." {
            return Ok((current, String::new()));
        }
        let segments: Vec<&str> = rel.split('/').collect();
        for (i, segment) in segments.iter().enumerate() {
            if !current.is_dir() || current.reparse_tag() != 0 {
                return Ok((current, segments[i..].join("/")));
            }
            let child = self
                .cim
                .find_child(&current.ino, segment)
                .map_err(|kind| self.cim.err("walkpath", kind).path(cleaned.clone()))?;
            let Some(child) = child else {
                return Ok((current, segments[i..].join("/")));
            };
            let name = util::join(&current.name, segment);
            let ino = self
                .cim
                .inode(child)
                .map_err(|kind| self.cim.err("walkpath", kind).path(cleaned.clone()))?;
            current = File {
                cim: self.cim.clone(),
                name,
                ino,
                offset: 0,
                pe: None,
            };
        }
        Ok((current, String::new()))
    }
}

impl io::Read for File {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_inner(buf).map_err(|kind| {
            io::Error::other(
                self.cim
                    .err("read", kind)
                    .path(self.name.clone()),
            )
        })
    }
}

impl Stream {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.record.size()
    }

    /// Reads from the stream at the cursor; `Ok(0)` at end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self
            .cim
            .read_data_stream(&self.record, self.offset, buf)
            .map_err(|kind| {
                self.cim
                    .err("read", kind)
                    .path(self.file_name.clone())
                    .stream(self.name.clone())
            })?;
        self.offset += n as u64;
        Ok(n)
    }
}

impl io::Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Stream::read(self, buf).map_err(io::Error::other)
    }
}

/// Pre-order traversal over `file` and everything below it.  The visitor is
/// called once per file, then once per alternate stream of that file;
/// returning [`WalkControl::SkipDir`] from the file visit skips the
/// directory's children.  No locks are held across visitor calls.
pub fn walk(
    file: &File,
    visit: &mut dyn FnMut(&File, Option<&StreamInfo>) -> Result<WalkControl>,
) -> Result<()> {
    let control = visit(file, None)?;
    for stream in file.readstreams()? {
        visit(file, Some(&stream))?;
    }
    if file.is_dir() && control != WalkControl::SkipDir {
        for name in file.readdir()? {
            let child = file.open_at(&name)?;
            walk(&child, visit)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::utf16::{build_upcase_table, encode_utf16le};

    /// Builds a sorted file-ID link table the way the writer lays it out.
    fn make_table(entries: &[(&str, u32)]) -> Vec<u8> {
        let count = entries.len();
        let mut table = vec![0u8; 8 + count * 4 + count * 4];
        for (i, (_, id)) in entries.iter().enumerate() {
            table[8 + i * 4..8 + (i + 1) * 4].copy_from_slice(&id.to_le_bytes());
        }
        for (i, (name, _)) in entries.iter().enumerate() {
            let pos = table.len() as u32;
            let offsets = 8 + count * 4 + i * 4;
            table[offsets..offsets + 4].copy_from_slice(&pos.to_le_bytes());
            let encoded = encode_utf16le(name);
            table.extend_from_slice(&((encoded.len() / 2) as u16).to_le_bytes());
            table.extend_from_slice(&encoded);
        }
        let length = table.len() as u32;
        table[0..4].copy_from_slice(&length.to_le_bytes());
        table[4..8].copy_from_slice(&(count as u32).to_le_bytes());
        table
    }

    #[test]
    fn test_bsearch_link_table() {
        let upcase = build_upcase_table();
        // sorted by upcased name
        let table = make_table(&[("alpha", 1), ("BETA", 2), ("delta", 3), ("Gamma", 4)]);
        for (name, id) in [
            ("Alpha", 1u32),
            ("beta", 2),
            ("DELTA", 3),
            ("gamma", 4),
            ("ALPHA", 1),
        ] {
            let entry = bsearch_link_table(&table, 4, name, &upcase)
                .unwrap()
                .unwrap_or_else(|| panic!("{name} not found"));
            assert_eq!(u32::from_le_bytes(entry.try_into().unwrap()), id);
        }
        for name in ["aardvark", "bet", "betas", "zzz", ""] {
            assert!(bsearch_link_table(&table, 4, name, &upcase)
                .unwrap()
                .is_none());
        }
    }

    #[test]
    fn test_enum_link_table() {
        let table = make_table(&[("a", 7), ("b", 9)]);
        let mut seen = Vec::new();
        enum_link_table(&table, 4, |name, value| {
            seen.push((name, u32::from_le_bytes(value.try_into().unwrap())));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![("a".to_string(), 7), ("b".to_string(), 9)]);
    }

    #[test]
    fn test_validate_link_table_bounds() {
        let mut table = make_table(&[("a", 1)]);
        let len = table.len();
        // oversized internal length
        table[0..4].copy_from_slice(&((len + 10) as u32).to_le_bytes());
        assert!(matches!(
            validate_link_table(&mut table.clone(), 4),
            Err(ErrorKind::BadFormat(_))
        ));
        // absurd entry count
        table[0..4].copy_from_slice(&(len as u32).to_le_bytes());
        table[4..8].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(
            validate_link_table(&mut table, 4),
            Err(ErrorKind::BadFormat(_))
        ));
    }

    #[test]
    fn test_parse_name_bounds() {
        let mut table = make_table(&[("abc", 1)]);
        // corrupt the name offset to point past the end
        let pos = 8 + 4;
        let table_len = table.len() as u32;
        table[pos..pos + 4].copy_from_slice(&table_len.to_le_bytes());
        assert!(parse_name(&table, 1, 4, 0).is_err());
    }
}
