//! On-disk format definitions for the image filesystem.
//!
//! This module defines the binary layout of every structure stored in the
//! filesystem, region and object-ID files, using safe zerocopy-based parsing.

// All of the structures are defined in terms of pure LE integer fields; the
// conversion to enum values is handled separately so that arbitrary on-disk
// bytes always parse.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use zerocopy::{
    little_endian::{U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

/// Alignment of data for large files inside an image.
pub const PAGE_SIZE: usize = 4096;

/// Every file of an image starts with this magic number.
pub const MAGIC: [u8; 8] = *b"cimfile0";

/// Current format version.  Readers require major equality.
pub const VERSION_MAJOR: u32 = 1;
pub const VERSION_MINOR: u32 = 0;

/// Default name of the filesystem file within an image directory.
pub const FILESYSTEM_FILE_NAME: &str = "layer.fs";

pub const REGION_FILE_PREFIX: &str = "region";
pub const OBJECTID_FILE_PREFIX: &str = "objectid";

/* File types stored in the common header */

pub const FT_FILESYSTEM: u8 = 0;
pub const FT_REGION: u8 = 1;
pub const FT_OBJECTID: u8 = 2;

/// The common header for all image-related files.
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct CommonHeader {
    pub magic: [u8; 8],
    pub header_length: U32,
    pub file_type: u8,
    pub reserved: u8,
    pub reserved2: U16,
    pub version_major: U32,
    pub version_minor: U32,
    pub reserved3: U64,
}

impl CommonHeader {
    pub fn new(file_type: u8, header_length: u32) -> Self {
        CommonHeader {
            magic: MAGIC,
            header_length: header_length.into(),
            file_type,
            version_major: VERSION_MAJOR.into(),
            version_minor: VERSION_MINOR.into(),
            ..Default::default()
        }
    }
}

/* Region files
 *
 * Region files contain all the data and metadata for an image.  They are
 * arranged as unordered sequences of objects of varying size, and each region
 * file type has its own alignment requirement.
 */

/// Each region file has a type, and all objects within that file are of the
/// same type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RegionType {
    /// All metadata objects (file tables, link tables, security descriptors).
    Metadata = 0,
    /// Page-aligned file data.
    Data = 1,
    /// 8-byte aligned file data, for small files.
    SmallData = 2,
}

/// Header of a region file.
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct RegionHeader {
    pub common: CommonHeader,
    pub index: U16,
    pub region_type: u8,
    pub reserved: u8,
    pub reserved2: U32,
}

/* Object ID files
 *
 * There is an object ID file corresponding to each region file, containing
 * IDs for each object that the region file contains.  The IDs are not used at
 * runtime but are used at write time to deduplicate objects.
 */

/// Header of an object ID file.
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ObjectIdHeader {
    pub common: CommonHeader,
    pub index: U16,
    pub region_type: u8,
    pub reserved: u8,
    pub reserved2: U32,
    pub table_offset: U32,
    pub count: U32,
}

/// An object ID: the object length plus a truncated content digest.
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ObjectId {
    pub length: U64,
    pub digest: [u8; 24],
}

/// One entry of the object ID table: the ID and the byte offset of the object
/// within the corresponding region file.
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ObjectIdEntry {
    pub object_id: ObjectId,
    pub offset: U64,
}

/* Region offsets */

/// A location within the image's flat region array: the lower 48 bits are a
/// byte offset and the upper 16 bits the index of the region file.  The zero
/// value denotes null.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(transparent)]
pub struct RegionOffset(U64);

impl RegionOffset {
    pub const NULL: RegionOffset = RegionOffset(U64::new(0));

    pub fn new(byte_offset: u64, region_index: u16) -> Self {
        RegionOffset(((region_index as u64) << 48 | byte_offset).into())
    }

    pub fn byte_offset(self) -> u64 {
        self.0.get() & 0xffff_ffff_ffff
    }

    pub fn region_index(self) -> u16 {
        (self.0.get() >> 48) as u16
    }

    pub fn is_null(self) -> bool {
        self.0.get() == 0
    }

    pub fn raw(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Debug for RegionOffset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}+{:#x}", self.region_index(), self.byte_offset())
    }
}

/* Region sets */

/// A region set names a group of region files `region_<guid>_<i>` within the
/// image directory.
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct RegionSet {
    pub id: Guid,
    pub count: U16,
    pub reserved: U16,
    pub reserved1: U32,
}

/* Filesystem file
 *
 * The filesystem file points to the filesystem object inside a region file
 * and specifies region sets.  The fixed header is followed by `parent_count`
 * region sets for the parent images, oldest first.
 */

#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct FilesystemHeader {
    pub common: CommonHeader,
    pub regions: RegionSet,
    pub filesystem_offset: RegionOffset,
    pub reserved: U32,
    pub reserved1: U16,
    pub parent_count: U16,
}

/// Only characters in the BMP are upcased.
pub const UPCASE_TABLE_LENGTH: usize = 0x10000;

/// A filesystem object specifies a root directory and the tables necessary to
/// define a filesystem.
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct Filesystem {
    pub upcase_table_offset: RegionOffset,
    pub file_table_directory_offset: RegionOffset,
    pub file_table_directory_length: U32,
    pub root_directory: U32,
}

/* File tables
 *
 * Files are laid out in a series of file tables, and file tables are
 * specified by a directory.  Each directory entry gives the number of valid
 * files within the table as well as the entry size, which may grow to specify
 * additional file metadata in future versions.
 */

#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct FileTableDirectoryEntry {
    pub offset: RegionOffset,
    pub count: U16,
    pub entry_size: U16,
    pub reserved: U32,
}

pub const FILES_PER_TABLE: u32 = 1024;

/// Index of a file within the file table directory.  IDs start at 1; zero is
/// invalid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub u32);

impl FileId {
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/* Streams */

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum StreamType {
    Data = 0,
    LinkTable = 1,
    PeImage = 2,
}

/// A stream points to file data, a link table (for directories), or a
/// `PeImage` object for files that are PE images.  The length field packs the
/// byte size in the lower 48 bits and the stream type in the upper 16.
#[derive(Clone, Copy, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct Stream {
    pub data_offset: RegionOffset,
    length_and_type: U64,
}

impl Stream {
    pub fn new(data_offset: RegionOffset, size: u64, stream_type: StreamType) -> Self {
        Stream {
            data_offset,
            length_and_type: ((stream_type as u64) << 48 | size).into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.length_and_type.get() & 0xffff_ffff_ffff
    }

    pub fn raw_type(&self) -> u16 {
        (self.length_and_type.get() >> 48) as u16
    }

    pub fn stream_type(&self) -> Option<StreamType> {
        match self.raw_type() {
            0 => Some(StreamType::Data),
            1 => Some(StreamType::LinkTable),
            2 => Some(StreamType::PeImage),
            _ => None,
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:?} ({:?}, {} bytes)",
            self.data_offset,
            self.stream_type(),
            self.size()
        )
    }
}

/* PE images
 *
 * A file that is a PE image can be encoded through a PeImage object in order
 * to provide an on-disk 4KiB image mapping for a 512-byte aligned PE image.
 * The image is aligned well on disk for image mappings, but discontiguous for
 * ordinary reads.  The descriptor is followed by `mapping_count` entries.
 */

#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct PeImage {
    pub data_offset: RegionOffset,
    pub data_length: U64,
    pub image_length: U32,
    pub mapping_count: U16,
    pub flags: U16,
}

pub const PE_IMAGE_FLAG_VALID: u16 = 1;

#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct PeImageMapping {
    pub file_offset: U32,
    pub delta: U32,
}

/* File records */

pub const FILE_FLAG_READ_ONLY: u16 = 1 << 0;
pub const FILE_FLAG_HIDDEN: u16 = 1 << 1;
pub const FILE_FLAG_SYSTEM: u16 = 1 << 2;
pub const FILE_FLAG_ARCHIVE: u16 = 1 << 3;

/// A file record represents one file in a filesystem.  The record layout may
/// grow in future minor versions; readers copy `entry_size` bytes into a
/// zero-padded buffer of the current size before decoding.
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct FileRecord {
    pub flags: U16,
    pub ea_length: U16,
    pub reparse_tag: U32,
    pub creation_time: U64,
    pub last_write_time: U64,
    pub change_time: U64,
    pub last_access_time: U64,
    /// File default data stream, or the directory link table.
    pub default_stream: Stream,
    /// u16-counted bytes.
    pub sd_offset: RegionOffset,
    /// Raw bytes; the length is `ea_length`.
    pub ea_offset: RegionOffset,
    /// u16-counted bytes.
    pub reparse_offset: RegionOffset,
    /// Link table of alternate stream records.
    pub stream_table_offset: RegionOffset,
}

/* Link tables
 *
 * A link table stores either directory entries or alternate data streams: the
 * header, `link_count` fixed-size values, `link_count` 32-bit name offsets
 * pointing back into the table at a `{u16 length, u16 chars[]}` UTF-16LE
 * name.  Entries are sorted by upcased name.
 */

#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct LinkTableHeader {
    pub length: U32,
    pub link_count: U32,
}

/// Size of a directory link table value (a file ID).
pub const LINK_TABLE_ENTRY_FILE_ID: usize = 4;
/// Size of a stream link table value (a stream record).
pub const LINK_TABLE_ENTRY_STREAM: usize = 16;

/* File attributes and reparse tags */

pub const FILE_ATTRIBUTE_READONLY: u32 = 0x0000_0001;
pub const FILE_ATTRIBUTE_HIDDEN: u32 = 0x0000_0002;
pub const FILE_ATTRIBUTE_SYSTEM: u32 = 0x0000_0004;
pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x0000_0010;
pub const FILE_ATTRIBUTE_ARCHIVE: u32 = 0x0000_0020;
pub const FILE_ATTRIBUTE_SPARSE_FILE: u32 = 0x0000_0200;
pub const FILE_ATTRIBUTE_REPARSE_POINT: u32 = 0x0000_0400;

/// Per-file redirect to a parent layer, placed by layer expansion.
pub const REPARSE_TAG_WCI_LINK: u32 = 0x8000_0018;
/// Suppresses a parent-layer file during mount.
pub const REPARSE_TAG_WCI_TOMBSTONE: u32 = 0xA000_001F;

/* GUIDs */

/// A GUID in Windows memory layout (data1/data2/data3 little-endian).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(transparent)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    /// Generates a new random GUID.
    pub fn generate() -> Self {
        let mut bytes: [u8; 16] = rand::rng().random();
        // RFC 4122 version 4, variant 1
        bytes[7] = bytes[7] & 0x0f | 0x40;
        bytes[8] = bytes[8] & 0x3f | 0x80;
        Guid(bytes)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = &self.0;
        let data1 = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        let data2 = u16::from_le_bytes([b[4], b[5]]);
        let data3 = u16::from_le_bytes([b[6], b[7]]);
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{}-{}",
            data1,
            data2,
            data3,
            hex::encode(&b[8..10]),
            hex::encode(&b[10..16])
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/* Filetimes */

/// Ticks between 1601-01-01 and the Unix epoch.
const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

/// A point in time expressed as 100ns ticks since 1601-01-01.  Zero means
/// "not set".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Filetime(pub u64);

impl Filetime {
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Converts to wall-clock time.  Returns `None` for the unset value.
    pub fn to_system_time(self) -> Option<SystemTime> {
        if self.is_zero() {
            return None;
        }
        if self.0 >= FILETIME_UNIX_EPOCH {
            let nanos = (self.0 - FILETIME_UNIX_EPOCH) * 100;
            Some(UNIX_EPOCH + Duration::from_nanos(nanos))
        } else {
            let nanos = (FILETIME_UNIX_EPOCH - self.0) * 100;
            Some(UNIX_EPOCH - Duration::from_nanos(nanos))
        }
    }

    pub fn from_system_time(time: SystemTime) -> Filetime {
        let ticks = match time.duration_since(UNIX_EPOCH) {
            Ok(after) => FILETIME_UNIX_EPOCH + after.as_nanos() as u64 / 100,
            Err(err) => FILETIME_UNIX_EPOCH.saturating_sub(err.duration().as_nanos() as u64 / 100),
        };
        Filetime(ticks)
    }
}
