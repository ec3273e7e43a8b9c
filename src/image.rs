//! Native on-disk image building.
//!
//! [`ImageWriter`] is the image-building service behind [`crate::writer`]:
//! it accumulates a pending tree in memory and, at commit, lays the tree out
//! into the three region files (metadata, page-aligned data, small data),
//! the parallel object-ID files used for content deduplication, and the
//! filesystem file.
//!
//! In append mode the parent image's tree is merged in up front.  Parent
//! file records and their region offsets are reused verbatim; only the
//! directories, the link tables and the file table are rebuilt, and the
//! parent's embedded upcase table is shared by region offset rather than
//! rewritten.

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashMap, HashSet},
    fs,
    io::{self, Write},
    mem::size_of,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    rc::Rc,
    sync::Arc,
};

use log::{debug, trace};
use sha2::{Digest, Sha256};
use zerocopy::{FromBytes, IntoBytes};

use crate::{
    error::{CimError, ErrorKind, Result},
    format::{
        self, CommonHeader, FileRecord, Filesystem, FilesystemHeader, FileTableDirectoryEntry,
        Guid, ObjectId, ObjectIdEntry, ObjectIdHeader, PeImage, PeImageMapping, RegionHeader,
        RegionOffset, RegionSet, RegionType, StreamType, FILES_PER_TABLE, FILE_ATTRIBUTE_ARCHIVE,
        FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_HIDDEN, FILE_ATTRIBUTE_READONLY,
        FILE_ATTRIBUTE_SYSTEM, FILE_FLAG_ARCHIVE, FILE_FLAG_HIDDEN, FILE_FLAG_READ_ONLY,
        FILE_FLAG_SYSTEM, FT_FILESYSTEM, FT_OBJECTID, FT_REGION, PAGE_SIZE, PE_IMAGE_FLAG_VALID,
    },
    reader::{Cim, File, FileInfo},
    utf16,
    writer::ImageBackend,
};

/// Key of a deduplicated object: its length and truncated content digest.
type ObjectKey = (u64, [u8; 24]);

/// Upcased scalar sequence; sorting by it yields link-table order.
type NameKey = Vec<u32>;

enum Node {
    Dir(Box<DirNode>),
    Leaf(Rc<RefCell<LeafNode>>),
}

struct DirNode {
    meta: Meta,
    id: Cell<u32>,
    children: BTreeMap<NameKey, (String, Node)>,
}

struct LeafNode {
    meta: Meta,
    id: Cell<u32>,
    content: Content,
    streams: BTreeMap<NameKey, (String, AltStream)>,
}

enum Meta {
    /// A newly declared entry.
    New(FileInfo),
    /// An entry merged from the parent image; the raw record (and every
    /// region offset inside it) is reused.
    Parent(FileRecord),
}

enum Content {
    Data {
        size: u64,
        bytes: Vec<u8>,
    },
    Pe {
        image_length: u32,
        mappings: Vec<(u32, u32)>,
        bytes: Vec<u8>,
    },
    /// Default stream taken from the parent record.
    Parent,
}

enum AltStream {
    New { size: u64, bytes: Vec<u8> },
    Parent(format::Stream),
}

enum Active {
    Default(Rc<RefCell<LeafNode>>),
    Alt(Rc<RefCell<LeafNode>>, NameKey),
}

fn new_dir(meta: Meta) -> DirNode {
    DirNode {
        meta,
        id: Cell::new(0),
        children: BTreeMap::new(),
    }
}

fn implicit_dir() -> DirNode {
    new_dir(Meta::New(FileInfo {
        attributes: FILE_ATTRIBUTE_DIRECTORY,
        ..Default::default()
    }))
}

/// Builds an image in memory and emits it as a filesystem file plus region
/// and object-ID files at commit time.
pub struct ImageWriter {
    image_dir: PathBuf,
    fs_name: String,
    set_id: Guid,
    /// Parent region sets in load order (oldest first).
    parent_sets: Vec<(Guid, u16)>,
    /// Total parent region count; the global index of our metadata region.
    base_index: u16,
    upcase: Arc<Vec<u16>>,
    parent_upcase_offset: Option<RegionOffset>,
    root: DirNode,
    active: Option<Active>,
    /// Known objects, preloaded from the parents' object-ID tables.
    dedupe: HashMap<ObjectKey, RegionOffset>,
}

impl ImageWriter {
    /// Starts a new image with no parent in `image_dir`; the filesystem file
    /// will be named `fs_name`.
    pub fn create(image_dir: &Path, fs_name: &str) -> Result<ImageWriter> {
        Ok(ImageWriter {
            image_dir: image_dir.to_path_buf(),
            fs_name: fs_name.to_string(),
            set_id: Guid::generate(),
            parent_sets: Vec::new(),
            base_index: 0,
            upcase: Arc::new(utf16::build_upcase_table()),
            parent_upcase_offset: None,
            root: implicit_dir(),
            active: None,
            dedupe: HashMap::new(),
        })
    }

    /// Starts a new filesystem view `new_fs_name` on top of the existing
    /// image `old_fs_name` in the same directory.  The new filesystem's
    /// region-set parent chain includes the original's.
    pub fn append(image_dir: &Path, old_fs_name: &str, new_fs_name: &str) -> Result<ImageWriter> {
        let parent_path = image_dir.join(old_fs_name);
        let parent = Cim::open(&parent_path)?;
        let base = parent.region_count();
        if base + 3 > 0x10000 {
            return Err(CimError::new(
                &parent_path,
                "append",
                ErrorKind::bad_format("region array exhausted"),
            ));
        }

        let upcase = parent.upcase();
        let root = load_parent_dir(&parent.root()?, &upcase, &mut HashMap::new())?;
        let dedupe = load_parent_objects(image_dir, parent.region_sets())
            .map_err(|kind| CimError::new(&parent_path, "append", kind))?;

        debug!(
            "appending {new_fs_name} onto {old_fs_name} ({base} parent regions, {} known objects)",
            dedupe.len()
        );
        Ok(ImageWriter {
            image_dir: image_dir.to_path_buf(),
            fs_name: new_fs_name.to_string(),
            set_id: Guid::generate(),
            parent_sets: parent.region_sets().to_vec(),
            base_index: base as u16,
            parent_upcase_offset: Some(parent.upcase_offset()),
            upcase,
            root,
            active: None,
            dedupe,
        })
    }

    /// Adds a file whose default stream is a PE image: `data` is the dense
    /// 512-byte aligned on-disk bytes, while the stream reports the aligned
    /// in-memory `image_length` and reads are remapped through `mappings`
    /// (pairs of logical file offset and delta).
    pub fn add_pe_file(
        &mut self,
        path: &str,
        info: &FileInfo,
        image_length: u32,
        mappings: &[(u32, u32)],
        data: &[u8],
    ) -> io::Result<()> {
        let segments = split_path(path);
        let Some((name, parents)) = segments.split_last() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty path"));
        };
        let leaf = LeafNode {
            meta: Meta::New(info.clone()),
            id: Cell::new(0),
            content: Content::Pe {
                image_length,
                mappings: mappings.to_vec(),
                bytes: data.to_vec(),
            },
            streams: BTreeMap::new(),
        };
        let upcase = self.upcase.clone();
        let dir = lookup_dir(&mut self.root, parents, true, &upcase)?;
        dir.children.insert(
            utf16::upcase_key(name, &upcase),
            (name.clone(), Node::Leaf(Rc::new(RefCell::new(leaf)))),
        );
        self.active = None;
        Ok(())
    }

    fn commit_inner(&mut self) -> io::Result<()> {
        let base = self.base_index;
        let mut ctx = BuildContext {
            meta: RegionBuilder::new(base, 0, RegionType::Metadata, 8),
            data: RegionBuilder::new(base + 1, 1, RegionType::Data, PAGE_SIZE),
            small: RegionBuilder::new(base + 2, 2, RegionType::SmallData, 8),
            dedupe: std::mem::take(&mut self.dedupe),
            emitted: HashSet::new(),
            records: Vec::new(),
        };

        let upcase_offset = match self.parent_upcase_offset {
            Some(offset) => offset,
            None => {
                let bytes: Vec<u8> = self.upcase.iter().flat_map(|c| c.to_le_bytes()).collect();
                ctx.meta.append(&bytes)
            }
        };

        let mut next_id = 1u32;
        assign_ids(&self.root, &mut next_id);
        let count = (next_id - 1) as usize;
        ctx.records = vec![[0u8; size_of::<FileRecord>()]; count];
        trace!("committing {count} files");

        serialize_dir(&self.root, &mut ctx)?;

        let mut ftdes = Vec::new();
        for chunk in ctx.records.chunks(FILES_PER_TABLE as usize) {
            let slab: Vec<u8> = chunk.concat();
            let offset = ctx.meta.append(&slab);
            ftdes.push(FileTableDirectoryEntry {
                offset,
                count: (chunk.len() as u16).into(),
                entry_size: (size_of::<FileRecord>() as u16).into(),
                ..Default::default()
            });
        }
        let mut ftd_bytes = Vec::new();
        for entry in &ftdes {
            ftd_bytes.extend_from_slice(entry.as_bytes());
        }
        let ftd_offset = ctx.meta.append(&ftd_bytes);

        let filesystem = Filesystem {
            upcase_table_offset: upcase_offset,
            file_table_directory_offset: ftd_offset,
            file_table_directory_length: (ftdes.len() as u32).into(),
            root_directory: self.root.id.get().into(),
        };
        let filesystem_offset = ctx.meta.append(filesystem.as_bytes());

        // All regions (and their object-ID tables) reach disk before the
        // filesystem file that references them.
        for builder in [&ctx.meta, &ctx.data, &ctx.small] {
            builder.write_files(&self.image_dir, self.set_id)?;
        }

        let header_length = (size_of::<FilesystemHeader>()
            + self.parent_sets.len() * size_of::<RegionSet>()) as u32;
        let header = FilesystemHeader {
            common: CommonHeader::new(FT_FILESYSTEM, header_length),
            regions: RegionSet {
                id: self.set_id,
                count: 3.into(),
                ..Default::default()
            },
            filesystem_offset,
            parent_count: (self.parent_sets.len() as u16).into(),
            ..Default::default()
        };
        let mut fs_bytes = header.as_bytes().to_vec();
        for (id, set_count) in &self.parent_sets {
            let set = RegionSet {
                id: *id,
                count: (*set_count).into(),
                ..Default::default()
            };
            fs_bytes.extend_from_slice(set.as_bytes());
        }
        let fs_path = self.image_dir.join(&self.fs_name);
        let mut fs_file = fs::File::create(&fs_path)?;
        fs_file.write_all(&fs_bytes)?;
        fs_file.sync_all()?;

        debug!(
            "committed {} ({} metadata bytes, {} data bytes, {} small-data bytes)",
            fs_path.display(),
            ctx.meta.buf.len(),
            ctx.data.buf.len(),
            ctx.small.buf.len()
        );
        Ok(())
    }
}

impl ImageBackend for ImageWriter {
    fn create_file(&mut self, path: &str, info: &FileInfo) -> io::Result<()> {
        self.active = None;

        // `name:stream` declares an alternate data stream on an existing file.
        if let Some((file_path, stream_name)) = path.split_once(':') {
            let segments = split_path(file_path);
            let upcase = self.upcase.clone();
            let leaf = lookup_leaf(&mut self.root, &segments, &upcase)?;
            let key = utf16::upcase_key(stream_name, &upcase);
            leaf.borrow_mut().streams.insert(
                key.clone(),
                (
                    stream_name.to_string(),
                    AltStream::New {
                        size: info.size,
                        bytes: Vec::new(),
                    },
                ),
            );
            self.active = Some(Active::Alt(leaf, key));
            return Ok(());
        }

        let segments = split_path(path);
        let Some((name, parents)) = segments.split_last() else {
            // The empty path declares the root directory itself.
            if info.attributes & FILE_ATTRIBUTE_DIRECTORY == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "root must be a directory",
                ));
            }
            self.root.meta = Meta::New(info.clone());
            return Ok(());
        };

        let upcase = self.upcase.clone();
        let dir = lookup_dir(&mut self.root, parents, true, &upcase)?;
        let key = utf16::upcase_key(name, &upcase);

        if info.attributes & FILE_ATTRIBUTE_DIRECTORY != 0 {
            // Re-declaring a directory keeps its children.
            let children = match dir.children.remove(&key) {
                Some((_, Node::Dir(old))) => old.children,
                _ => BTreeMap::new(),
            };
            let node = DirNode {
                meta: Meta::New(info.clone()),
                id: Cell::new(0),
                children,
            };
            dir.children
                .insert(key, (name.clone(), Node::Dir(Box::new(node))));
        } else {
            let leaf = Rc::new(RefCell::new(LeafNode {
                meta: Meta::New(info.clone()),
                id: Cell::new(0),
                content: Content::Data {
                    size: info.size,
                    bytes: Vec::new(),
                },
                streams: BTreeMap::new(),
            }));
            dir.children
                .insert(key, (name.clone(), Node::Leaf(leaf.clone())));
            self.active = Some(Active::Default(leaf));
        }
        Ok(())
    }

    fn write_stream(&mut self, buf: &[u8]) -> io::Result<()> {
        let Some(active) = &self.active else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no active stream",
            ));
        };
        match active {
            Active::Default(leaf) => match &mut leaf.borrow_mut().content {
                Content::Data { bytes, .. } => bytes.extend_from_slice(buf),
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "stream is not writable",
                    ))
                }
            },
            Active::Alt(leaf, key) => {
                let mut leaf = leaf.borrow_mut();
                let (_, stream) = leaf.streams.get_mut(key).unwrap();
                match stream {
                    AltStream::New { bytes, .. } => bytes.extend_from_slice(buf),
                    AltStream::Parent(_) => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "stream is not writable",
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    fn close_stream(&mut self) -> io::Result<()> {
        self.active = None;
        Ok(())
    }

    fn create_hard_link(&mut self, existing: &str, path: &str) -> io::Result<()> {
        self.active = None;
        let upcase = self.upcase.clone();
        let leaf = lookup_leaf(&mut self.root, &split_path(existing), &upcase)?;
        let segments = split_path(path);
        let Some((name, parents)) = segments.split_last() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty path"));
        };
        let dir = lookup_dir(&mut self.root, parents, true, &upcase)?;
        dir.children.insert(
            utf16::upcase_key(name, &upcase),
            (name.clone(), Node::Leaf(leaf)),
        );
        Ok(())
    }

    fn delete_path(&mut self, path: &str) -> io::Result<()> {
        self.active = None;
        let segments = split_path(path);
        let Some((name, parents)) = segments.split_last() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty path"));
        };
        let upcase = self.upcase.clone();
        let dir = lookup_dir(&mut self.root, parents, false, &upcase)?;
        if dir
            .children
            .remove(&utf16::upcase_key(name, &upcase))
            .is_none()
        {
            return Err(io::Error::new(io::ErrorKind::NotFound, path.to_string()));
        }
        Ok(())
    }

    fn commit(&mut self) -> io::Result<()> {
        self.active = None;
        self.commit_inner()
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split(['\\', '/'])
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Walks to (optionally creating) the directory named by `segments`.
fn lookup_dir<'a>(
    root: &'a mut DirNode,
    segments: &[String],
    create: bool,
    upcase: &[u16],
) -> io::Result<&'a mut DirNode> {
    let mut current = root;
    for segment in segments {
        let key = utf16::upcase_key(segment, upcase);
        let node = current;
        let slot = if create {
            node.children
                .entry(key)
                .or_insert_with(|| (segment.clone(), Node::Dir(Box::new(implicit_dir()))))
        } else {
            node.children
                .get_mut(&key)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, segment.clone()))?
        };
        current = match &mut slot.1 {
            Node::Dir(dir) => dir.as_mut(),
            Node::Leaf(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{segment} is not a directory"),
                ))
            }
        };
    }
    Ok(current)
}

fn lookup_leaf(
    root: &mut DirNode,
    segments: &[String],
    upcase: &[u16],
) -> io::Result<Rc<RefCell<LeafNode>>> {
    let Some((name, parents)) = segments.split_last() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty path"));
    };
    let dir = lookup_dir(root, parents, false, upcase)?;
    match dir.children.get(&utf16::upcase_key(name, upcase)) {
        Some((_, Node::Leaf(leaf))) => Ok(leaf.clone()),
        Some((_, Node::Dir(_))) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{name} is a directory"),
        )),
        None => Err(io::Error::new(io::ErrorKind::NotFound, name.clone())),
    }
}

/// Recursively merges a parent directory into pending nodes.  Hard-linked
/// files keep a single node so they share a file ID in the new image.
fn load_parent_dir(
    dir: &File,
    upcase: &[u16],
    leaves: &mut HashMap<u32, Rc<RefCell<LeafNode>>>,
) -> Result<DirNode> {
    let mut node = new_dir(Meta::Parent(*dir.record()));
    for entry in dir.read_dir_entries()? {
        let child = dir.open_at(&entry.name)?;
        let key = utf16::upcase_key(&entry.name, upcase);
        let value = if child.is_dir() {
            Node::Dir(Box::new(load_parent_dir(&child, upcase, leaves)?))
        } else {
            let leaf = match leaves.get(&entry.file_id.0) {
                Some(leaf) => leaf.clone(),
                None => {
                    let streams = child
                        .stream_entries()
                        .map_err(|kind| {
                            CimError::new(child.image_path(), "append", kind)
                                .path(child.name().to_string())
                        })?
                        .into_iter()
                        .map(|(name, record)| {
                            (
                                utf16::upcase_key(&name, upcase),
                                (name, AltStream::Parent(record)),
                            )
                        })
                        .collect();
                    let leaf = Rc::new(RefCell::new(LeafNode {
                        meta: Meta::Parent(*child.record()),
                        id: Cell::new(0),
                        content: Content::Parent,
                        streams,
                    }));
                    leaves.insert(entry.file_id.0, leaf.clone());
                    leaf
                }
            };
            Node::Leaf(leaf)
        };
        node.children.insert(key, (entry.name, value));
    }
    Ok(node)
}

/// Loads the parents' object-ID tables so identical objects written into the
/// new view are not stored again.
fn load_parent_objects(
    image_dir: &Path,
    sets: &[(Guid, u16)],
) -> std::result::Result<HashMap<ObjectKey, RegionOffset>, ErrorKind> {
    let mut objects = HashMap::new();
    let mut global: u32 = 0;
    for (id, count) in sets {
        for i in 0..*count {
            let name = format!("{}_{}_{}", format::OBJECTID_FILE_PREFIX, id, i);
            let file = match fs::File::open(image_dir.join(&name)) {
                Ok(file) => file,
                // Object-ID files are optional.
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    global += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let mut header_bytes = vec![0u8; size_of::<ObjectIdHeader>()];
            file.read_exact_at(&mut header_bytes, 0)?;
            let header = ObjectIdHeader::read_from_bytes(&header_bytes).unwrap();
            if header.common.magic != format::MAGIC || header.common.file_type != FT_OBJECTID {
                return Err(ErrorKind::BadFormat(format!("bad object id file {name}")));
            }
            let entry_count = header.count.get() as usize;
            let mut table = vec![0u8; entry_count * size_of::<ObjectIdEntry>()];
            file.read_exact_at(&mut table, header.table_offset.get() as u64)?;
            for chunk in table.chunks_exact(size_of::<ObjectIdEntry>()) {
                let entry = ObjectIdEntry::read_from_bytes(chunk).unwrap();
                objects.insert(
                    (entry.object_id.length.get(), entry.object_id.digest),
                    RegionOffset::new(entry.offset.get(), global as u16),
                );
            }
            global += 1;
        }
    }
    Ok(objects)
}

struct RegionBuilder {
    buf: Vec<u8>,
    global_index: u16,
    local_index: u16,
    region_type: RegionType,
    alignment: usize,
    objects: Vec<ObjectIdEntry>,
}

impl RegionBuilder {
    fn new(
        global_index: u16,
        local_index: u16,
        region_type: RegionType,
        alignment: usize,
    ) -> RegionBuilder {
        let header = RegionHeader {
            common: CommonHeader::new(FT_REGION, size_of::<RegionHeader>() as u32),
            index: local_index.into(),
            region_type: region_type as u8,
            ..Default::default()
        };
        RegionBuilder {
            buf: header.as_bytes().to_vec(),
            global_index,
            local_index,
            region_type,
            alignment,
            objects: Vec::new(),
        }
    }

    fn append(&mut self, data: &[u8]) -> RegionOffset {
        let rem = self.buf.len() % self.alignment;
        if rem != 0 {
            self.buf.resize(self.buf.len() + self.alignment - rem, 0);
        }
        let offset = self.buf.len() as u64;
        self.buf.extend_from_slice(data);
        RegionOffset::new(offset, self.global_index)
    }

    /// Appends a deduplicated object, recording it in the object-ID table.
    fn append_object(
        &mut self,
        data: &[u8],
        dedupe: &mut HashMap<ObjectKey, RegionOffset>,
    ) -> RegionOffset {
        let digest: [u8; 24] = Sha256::digest(data)[..24].try_into().unwrap();
        let key = (data.len() as u64, digest);
        if let Some(offset) = dedupe.get(&key) {
            trace!("object {} deduplicated at {:?}", hex::encode(digest), offset);
            return *offset;
        }
        let offset = self.append(data);
        self.objects.push(ObjectIdEntry {
            object_id: ObjectId {
                length: key.0.into(),
                digest,
            },
            offset: offset.byte_offset().into(),
        });
        dedupe.insert(key, offset);
        offset
    }

    fn write_files(&self, image_dir: &Path, set_id: Guid) -> io::Result<()> {
        let region_name = format!(
            "{}_{}_{}",
            format::REGION_FILE_PREFIX,
            set_id,
            self.local_index
        );
        let mut region = fs::File::create(image_dir.join(region_name))?;
        region.write_all(&self.buf)?;
        region.sync_all()?;

        let header = ObjectIdHeader {
            common: CommonHeader::new(FT_OBJECTID, size_of::<ObjectIdHeader>() as u32),
            index: self.local_index.into(),
            region_type: self.region_type as u8,
            table_offset: (size_of::<ObjectIdHeader>() as u32).into(),
            count: (self.objects.len() as u32).into(),
            ..Default::default()
        };
        let mut bytes = header.as_bytes().to_vec();
        for entry in &self.objects {
            bytes.extend_from_slice(entry.as_bytes());
        }
        let objectid_name = format!(
            "{}_{}_{}",
            format::OBJECTID_FILE_PREFIX,
            set_id,
            self.local_index
        );
        let mut objectid = fs::File::create(image_dir.join(objectid_name))?;
        objectid.write_all(&bytes)?;
        objectid.sync_all()?;
        Ok(())
    }
}

struct BuildContext {
    meta: RegionBuilder,
    data: RegionBuilder,
    small: RegionBuilder,
    dedupe: HashMap<ObjectKey, RegionOffset>,
    emitted: HashSet<u32>,
    records: Vec<[u8; size_of::<FileRecord>()]>,
}

fn assign_ids(dir: &DirNode, next: &mut u32) {
    dir.id.set(*next);
    *next += 1;
    for (_, (_, node)) in &dir.children {
        match node {
            Node::Dir(child) => assign_ids(child, next),
            Node::Leaf(leaf) => {
                let leaf = leaf.borrow();
                if leaf.id.get() == 0 {
                    leaf.id.set(*next);
                    *next += 1;
                }
            }
        }
    }
}

fn counted16(data: &[u8]) -> io::Result<Vec<u8>> {
    let len: u16 = data
        .len()
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "counted blob too large"))?;
    let mut bytes = len.to_le_bytes().to_vec();
    bytes.extend_from_slice(data);
    Ok(bytes)
}

/// Serializes a link table: header, fixed-size values, name offsets, then
/// the length-prefixed UTF-16LE names.  Entries must already be in upcased
/// sort order.
fn build_link_table(entries: &[(String, Vec<u8>)], entry_size: usize) -> Vec<u8> {
    let count = entries.len();
    let mut buf = vec![0u8; size_of::<format::LinkTableHeader>() + count * (entry_size + 4)];
    for (i, (_, value)) in entries.iter().enumerate() {
        debug_assert_eq!(value.len(), entry_size);
        buf[8 + i * entry_size..8 + (i + 1) * entry_size].copy_from_slice(value);
    }
    for (i, (name, _)) in entries.iter().enumerate() {
        let name_offset = buf.len() as u32;
        let pos = 8 + count * entry_size + i * 4;
        buf[pos..pos + 4].copy_from_slice(&name_offset.to_le_bytes());
        let encoded = utf16::encode_utf16le(name);
        buf.extend_from_slice(&((encoded.len() / 2) as u16).to_le_bytes());
        buf.extend_from_slice(&encoded);
    }
    let length = buf.len() as u32;
    buf[0..4].copy_from_slice(&length.to_le_bytes());
    buf[4..8].copy_from_slice(&(count as u32).to_le_bytes());
    buf
}

fn attribute_flags(attributes: u32) -> u16 {
    let mut flags = 0;
    if attributes & FILE_ATTRIBUTE_READONLY != 0 {
        flags |= FILE_FLAG_READ_ONLY;
    }
    if attributes & FILE_ATTRIBUTE_HIDDEN != 0 {
        flags |= FILE_FLAG_HIDDEN;
    }
    if attributes & FILE_ATTRIBUTE_SYSTEM != 0 {
        flags |= FILE_FLAG_SYSTEM;
    }
    if attributes & FILE_ATTRIBUTE_ARCHIVE != 0 {
        flags |= FILE_FLAG_ARCHIVE;
    }
    flags
}

/// Builds the record of a newly declared entry, writing its security
/// descriptor, extended attributes and reparse blob as metadata objects.
fn build_record(
    info: &FileInfo,
    default_stream: format::Stream,
    stream_table_offset: RegionOffset,
    ctx: &mut BuildContext,
) -> io::Result<FileRecord> {
    let sd_offset = if info.security_descriptor.is_empty() {
        RegionOffset::NULL
    } else {
        let blob = counted16(&info.security_descriptor)?;
        ctx.meta.append_object(&blob, &mut ctx.dedupe)
    };
    let ea_offset = if info.extended_attributes.is_empty() {
        RegionOffset::NULL
    } else {
        ctx.meta
            .append_object(&info.extended_attributes, &mut ctx.dedupe)
    };
    let ea_length: u16 = info.extended_attributes.len().try_into().map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "extended attributes too large")
    })?;
    let reparse_offset = if info.reparse_tag == 0 && info.reparse_data.is_empty() {
        RegionOffset::NULL
    } else {
        let blob = counted16(&info.reparse_data)?;
        ctx.meta.append_object(&blob, &mut ctx.dedupe)
    };
    Ok(FileRecord {
        flags: attribute_flags(info.attributes).into(),
        ea_length: ea_length.into(),
        reparse_tag: info.reparse_tag.into(),
        creation_time: info.creation_time.0.into(),
        last_write_time: info.last_write_time.0.into(),
        change_time: info.change_time.0.into(),
        last_access_time: info.last_access_time.0.into(),
        default_stream,
        sd_offset,
        ea_offset,
        reparse_offset,
        stream_table_offset,
    })
}

/// Writes stream data to the region appropriate for its size.
fn place_stream_data(size: u64, bytes: &[u8], ctx: &mut BuildContext) -> format::Stream {
    if bytes.is_empty() {
        // Empty, or declared sparse: the size is reported with no backing.
        return format::Stream::new(RegionOffset::NULL, size, StreamType::Data);
    }
    let offset = if size >= PAGE_SIZE as u64 {
        ctx.data.append_object(bytes, &mut ctx.dedupe)
    } else {
        ctx.small.append_object(bytes, &mut ctx.dedupe)
    };
    format::Stream::new(offset, size, StreamType::Data)
}

fn serialize_leaf(leaf: &LeafNode, ctx: &mut BuildContext) -> io::Result<()> {
    let id = leaf.id.get();
    if !ctx.emitted.insert(id) {
        return Ok(()); // hard link, already emitted
    }

    let default_stream = match &leaf.content {
        Content::Parent => match &leaf.meta {
            Meta::Parent(record) => record.default_stream,
            Meta::New(_) => unreachable!("parent content requires a parent record"),
        },
        Content::Data { size, bytes } => place_stream_data(*size, bytes, ctx),
        Content::Pe {
            image_length,
            mappings,
            bytes,
        } => {
            let data_offset = ctx.data.append_object(bytes, &mut ctx.dedupe);
            let descriptor = PeImage {
                data_offset,
                data_length: (bytes.len() as u64).into(),
                image_length: (*image_length).into(),
                mapping_count: (mappings.len() as u16).into(),
                flags: PE_IMAGE_FLAG_VALID.into(),
            };
            let mut blob = descriptor.as_bytes().to_vec();
            for (file_offset, delta) in mappings {
                let mapping = PeImageMapping {
                    file_offset: (*file_offset).into(),
                    delta: (*delta).into(),
                };
                blob.extend_from_slice(mapping.as_bytes());
            }
            let offset = ctx.meta.append(&blob);
            format::Stream::new(offset, *image_length as u64, StreamType::PeImage)
        }
    };

    let stream_table_offset = if leaf.streams.is_empty() {
        match &leaf.meta {
            Meta::Parent(record) => record.stream_table_offset,
            Meta::New(_) => RegionOffset::NULL,
        }
    } else {
        let mut entries = Vec::with_capacity(leaf.streams.len());
        for (_, (name, stream)) in &leaf.streams {
            let record = match stream {
                AltStream::Parent(record) => *record,
                AltStream::New { size, bytes } => place_stream_data(*size, bytes, ctx),
            };
            entries.push((name.clone(), record.as_bytes().to_vec()));
        }
        let table = build_link_table(&entries, format::LINK_TABLE_ENTRY_STREAM);
        ctx.meta.append(&table)
    };

    let record = match &leaf.meta {
        Meta::Parent(parent) => {
            let mut record = *parent;
            record.default_stream = default_stream;
            record.stream_table_offset = stream_table_offset;
            record
        }
        Meta::New(info) => build_record(info, default_stream, stream_table_offset, ctx)?,
    };
    ctx.records[id as usize - 1] = record.as_bytes().try_into().unwrap();
    Ok(())
}

fn serialize_dir(dir: &DirNode, ctx: &mut BuildContext) -> io::Result<()> {
    let mut entries = Vec::with_capacity(dir.children.len());
    for (_, (name, node)) in &dir.children {
        let id = match node {
            Node::Dir(child) => {
                serialize_dir(child, ctx)?;
                child.id.get()
            }
            Node::Leaf(leaf) => {
                let leaf = leaf.borrow();
                serialize_leaf(&leaf, ctx)?;
                leaf.id.get()
            }
        };
        entries.push((name.clone(), id.to_le_bytes().to_vec()));
    }

    let default_stream = if entries.is_empty() {
        format::Stream::new(RegionOffset::NULL, 0, StreamType::LinkTable)
    } else {
        let table = build_link_table(&entries, format::LINK_TABLE_ENTRY_FILE_ID);
        let offset = ctx.meta.append(&table);
        format::Stream::new(offset, table.len() as u64, StreamType::LinkTable)
    };

    let record = match &dir.meta {
        Meta::Parent(parent) => {
            let mut record = *parent;
            record.default_stream = default_stream;
            record
        }
        Meta::New(info) => build_record(info, default_stream, RegionOffset::NULL, ctx)?,
    };
    ctx.records[dir.id.get() as usize - 1] = record.as_bytes().try_into().unwrap();
    Ok(())
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_build_link_table_layout() {
        let entries = vec![
            ("a".to_string(), 1u32.to_le_bytes().to_vec()),
            ("bc".to_string(), 2u32.to_le_bytes().to_vec()),
        ];
        let table = build_link_table(&entries, 4);
        let length = u32::from_le_bytes(table[0..4].try_into().unwrap());
        assert_eq!(length as usize, table.len());
        assert_eq!(u32::from_le_bytes(table[4..8].try_into().unwrap()), 2);
        // values
        assert_eq!(u32::from_le_bytes(table[8..12].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(table[12..16].try_into().unwrap()), 2);
        // first name
        let name0 = u32::from_le_bytes(table[16..20].try_into().unwrap()) as usize;
        assert_eq!(
            u16::from_le_bytes(table[name0..name0 + 2].try_into().unwrap()),
            1
        );
        assert_eq!(&table[name0 + 2..name0 + 4], &[b'a', 0]);
    }

    #[test]
    fn test_region_builder_alignment_and_dedupe() {
        let mut dedupe = HashMap::new();
        let mut builder = RegionBuilder::new(5, 1, RegionType::Data, PAGE_SIZE);
        let first = builder.append_object(b"hello", &mut dedupe);
        assert_eq!(first.region_index(), 5);
        assert_eq!(first.byte_offset() as usize, PAGE_SIZE);
        let again = builder.append_object(b"hello", &mut dedupe);
        assert_eq!(first, again);
        assert_eq!(builder.objects.len(), 1);
        let other = builder.append_object(b"world", &mut dedupe);
        assert_eq!(other.byte_offset() as usize, 2 * PAGE_SIZE);
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("Files\\a\\b"), vec!["Files", "a", "b"]);
        assert_eq!(split_path("Files/a"), vec!["Files", "a"]);
        assert!(split_path("").is_empty());
    }

    #[test]
    fn test_counted16() {
        assert_eq!(counted16(b"ab").unwrap(), vec![2, 0, b'a', b'b']);
        assert!(counted16(&vec![0u8; 0x10000]).is_err());
    }

    #[test]
    fn test_round_trip_basic_image() {
        use std::io::Read;

        let td = crate::test::tempdir();
        let fs_path = crate::test::write_basic_image(td.path());

        let cim = Cim::open(&fs_path).unwrap();
        let mut readme = cim.open_file("Files/Readme.TXT").unwrap();
        let mut content = Vec::new();
        readme.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"hello image");

        let system32 = cim.open_file("/Files/Windows/System32/").unwrap();
        assert_eq!(system32.readdir().unwrap(), vec!["config.dat".to_string()]);
        assert!(cim.open_file("empty").unwrap().readdir().unwrap().is_empty());
    }

    #[test]
    fn test_commit_emits_object_id_files() {
        let td = crate::test::tempdir();
        crate::test::write_basic_image(td.path());

        let names: Vec<String> = std::fs::read_dir(td.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        for i in 0..3 {
            assert!(
                names
                    .iter()
                    .any(|n| n.starts_with("region_") && n.ends_with(&format!("_{i}"))),
                "missing region {i} in {names:?}"
            );
            assert!(
                names
                    .iter()
                    .any(|n| n.starts_with("objectid_") && n.ends_with(&format!("_{i}"))),
                "missing objectid {i} in {names:?}"
            );
        }
    }
}
