//! End-to-end tests: images written with the native builder and read back.

use std::{
    io::Read,
    path::{Path, PathBuf},
};

use anyhow::Result;
use once_cell::sync::Lazy;
use similar_asserts::assert_eq;
use tempfile::TempDir;

use cimfs::{
    format::{
        FILESYSTEM_FILE_NAME, FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_REPARSE_POINT,
        FILE_ATTRIBUTE_SPARSE_FILE, REPARSE_TAG_WCI_LINK, REPARSE_TAG_WCI_TOMBSTONE,
    },
    image::ImageWriter,
    layer::{self, Layer},
    reader::{walk, WalkControl},
    writer::ImageBackend,
    Cim, ErrorKind, FileInfo, Guid, Writer,
};

fn dir_info() -> FileInfo {
    FileInfo {
        attributes: FILE_ATTRIBUTE_DIRECTORY,
        ..Default::default()
    }
}

fn file_info(size: u64) -> FileInfo {
    FileInfo {
        size,
        ..Default::default()
    }
}

fn put_file(w: &mut Writer<ImageWriter>, path: &str, content: &[u8]) -> Result<()> {
    w.write_file(path, &file_info(content.len() as u64))?;
    w.write(content)?;
    Ok(())
}

/// Files/Readme.TXT, Files/Windows/System32/config.dat, empty/
fn write_basic_image(dir: &Path) -> Result<PathBuf> {
    let fs_path = dir.join(FILESYSTEM_FILE_NAME);
    let mut w = Writer::create(&fs_path)?;
    w.write_file("Files", &dir_info())?;
    put_file(&mut w, "Files/Readme.TXT", b"hello image")?;
    w.write_file("Files/Windows", &dir_info())?;
    w.write_file("Files/Windows/System32", &dir_info())?;
    put_file(&mut w, "Files/Windows/System32/config.dat", b"configuration")?;
    w.write_file("empty", &dir_info())?;
    w.commit()?;
    w.close()?;
    Ok(fs_path)
}

fn read_all(file: &mut cimfs::File) -> Result<Vec<u8>> {
    let mut content = Vec::new();
    file.read_to_end(&mut content)?;
    Ok(content)
}

/// One shared read-only copy of the basic image for the tests that never
/// write into its directory.
static BASIC_IMAGE: Lazy<(TempDir, PathBuf)> = Lazy::new(|| {
    let td = TempDir::new().expect("tempdir");
    let fs_path = write_basic_image(td.path()).expect("basic image");
    (td, fs_path)
});

fn basic_image() -> &'static Path {
    &BASIC_IMAGE.1
}

#[test]
fn test_open_root() -> Result<()> {
    let cim = Cim::open(basic_image())?;
    let root = cim.open_file("/")?;
    assert!(root.is_dir());
    assert_eq!(root.readdir()?, vec!["empty".to_string(), "Files".to_string()]);

    // an image with no entries has an empty root
    let empty_td = TempDir::new()?;
    let empty_path = empty_td.path().join(FILESYSTEM_FILE_NAME);
    let mut w = Writer::create(&empty_path)?;
    w.commit()?;
    let empty = Cim::open(&empty_path)?;
    assert!(empty.open_file("/")?.readdir()?.is_empty());
    Ok(())
}

#[test]
fn test_absolute_vs_relative() -> Result<()> {
    let cim = Cim::open(basic_image())?;

    let absolute = cim.open_file("Files/Windows/System32")?;
    let relative = cim
        .open_file("Files")?
        .open_at("Windows")?
        .open_at("System32")?;
    assert_eq!(absolute.file_id(), relative.file_id());
    assert_eq!(absolute.stat()?, relative.stat()?);
    assert_eq!(absolute.name(), relative.name());

    // a trailing slash asserts the target is a directory
    assert!(cim.open_file("Files/Windows/").is_ok());
    let err = cim.open_file("Files/Readme.TXT/").unwrap_err();
    assert!(matches!(err.kind, ErrorKind::NotADirectory));
    Ok(())
}

#[test]
fn test_case_insensitive_lookup() -> Result<()> {
    let td = TempDir::new()?;
    let fs_path = td.path().join(FILESYSTEM_FILE_NAME);
    let mut w = Writer::create(&fs_path)?;
    w.write_file("Foo", &dir_info())?;
    put_file(&mut w, "Foo/Bar.TXT", b"hi")?;
    w.commit()?;

    let cim = Cim::open(&fs_path)?;
    let mut file = cim.open_file("foo/bar.txt")?;
    assert_eq!(read_all(&mut file)?, b"hi");

    let upper = cim.open_file("FOO/BAR.TXT")?;
    assert_eq!(upper.file_id(), file.file_id());
    Ok(())
}

#[test]
fn test_read_totality() -> Result<()> {
    let cim = Cim::open(basic_image())?;

    for buffer_size in [1usize, 3, 4096] {
        let mut file = cim.open_file("/Files/Readme.TXT")?;
        let mut content = Vec::new();
        let mut buf = vec![0u8; buffer_size];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            content.extend_from_slice(&buf[..n]);
        }
        assert_eq!(content, b"hello image");
        // end of stream is sticky
        assert_eq!(file.read(&mut buf)?, 0);
    }
    Ok(())
}

#[test]
fn test_lookup_enumeration_equivalence() -> Result<()> {
    let cim = Cim::open(basic_image())?;

    let mut directories = vec![cim.root()?];
    while let Some(dir) = directories.pop() {
        for entry in dir.read_dir_entries()? {
            let opened = dir.open_at(&entry.name)?;
            assert_eq!(opened.file_id(), entry.file_id, "{}", opened.name());
            assert_eq!(cim.open_id(entry.file_id)?.stat()?, opened.stat()?);
            if opened.is_dir() {
                directories.push(opened);
            }
        }
        let err = dir.open_at("no-such-entry").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::FileNotFound));
    }
    Ok(())
}

#[test]
fn test_error_context() -> Result<()> {
    let fs_path = basic_image();
    let cim = Cim::open(fs_path)?;
    let err = cim.open_file("/Files/missing.txt").unwrap_err();
    assert!(matches!(err.kind, ErrorKind::FileNotFound));
    assert_eq!(err.image, fs_path);
    assert_eq!(err.path.as_deref(), Some("/Files/missing.txt"));
    assert_eq!(err.op, "openat");

    let err = cim.open_file("/Files/Readme.TXT/below").unwrap_err();
    assert!(matches!(err.kind, ErrorKind::NotADirectory));

    let mut dir = cim.open_file("/Files")?;
    let err = cimfs::File::read(&mut dir, &mut [0u8; 4]).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::IsADirectory));
    Ok(())
}

#[test]
fn test_stat_metadata() -> Result<()> {
    let td = TempDir::new()?;
    let fs_path = td.path().join(FILESYSTEM_FILE_NAME);
    let mut w = Writer::create(&fs_path)?;
    let mut info = file_info(4);
    info.creation_time = cimfs::Filetime(132_223_104_000_000_000);
    info.extended_attributes = vec![9, 8, 7];
    w.write_file("blob.bin", &info)?;
    w.write(&[1, 2, 3, 4])?;
    w.commit()?;

    let cim = Cim::open(&fs_path)?;
    let stat = cim.open_file("blob.bin")?.stat()?;
    assert_eq!(stat.size, 4);
    assert_eq!(stat.creation_time, cimfs::Filetime(132_223_104_000_000_000));
    assert_eq!(stat.extended_attributes, vec![9, 8, 7]);
    // empty input descriptors are canonicalized, never empty on read
    assert!(!stat.security_descriptor.is_empty());
    assert_eq!(stat.security_descriptor[0], 1); // revision
    assert_eq!(stat.attributes & FILE_ATTRIBUTE_DIRECTORY, 0);
    Ok(())
}

#[test]
fn test_exact_size_end_to_end() -> Result<()> {
    let td = TempDir::new()?;
    let fs_path = td.path().join(FILESYSTEM_FILE_NAME);
    let mut w = Writer::create(&fs_path)?;
    w.write_file("a.bin", &file_info(4))?;
    w.write(&[1, 2])?;
    w.write(&[3, 4])?;
    // opening the next entry implies a clean close of the previous stream
    put_file(&mut w, "b.bin", b"x")?;
    w.commit()?;

    let cim = Cim::open(&fs_path)?;
    let mut a = cim.open_file("a.bin")?;
    assert_eq!(read_all(&mut a)?, vec![1, 2, 3, 4]);

    let mut w = Writer::create(td.path().join("bad.fs"))?;
    w.write_file("a.bin", &file_info(4))?;
    w.write(&[1, 2])?;
    let err = w.commit().unwrap_err();
    assert!(matches!(err.kind, ErrorKind::WriteTruncated));

    let mut w = Writer::create(td.path().join("bad2.fs"))?;
    w.write_file("a.bin", &file_info(4))?;
    let err = w.write(&[1, 2, 3, 4, 5]).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::WroteTooMuch));
    Ok(())
}

#[test]
fn test_hard_links_share_file_id() -> Result<()> {
    let td = TempDir::new()?;
    let fs_path = td.path().join(FILESYSTEM_FILE_NAME);
    let mut w = Writer::create(&fs_path)?;
    w.write_file("Files", &dir_info())?;
    put_file(&mut w, "Files/original.txt", b"shared bytes")?;
    w.link("Files/original.txt", "Files/alias.txt")?;
    w.commit()?;

    let cim = Cim::open(&fs_path)?;
    let original = cim.open_file("Files/original.txt")?;
    let mut alias = cim.open_file("Files/alias.txt")?;
    assert_eq!(original.file_id(), alias.file_id());
    assert_eq!(read_all(&mut alias)?, b"shared bytes");
    Ok(())
}

#[test]
fn test_alternate_streams() -> Result<()> {
    let td = TempDir::new()?;
    let fs_path = td.path().join(FILESYSTEM_FILE_NAME);
    let mut w = Writer::create(&fs_path)?;
    put_file(&mut w, "data.bin", b"default stream")?;
    w.write_file("data.bin:meta", &file_info(9))?;
    w.write(b"side data")?;
    w.commit()?;

    let cim = Cim::open(&fs_path)?;
    let file = cim.open_file("data.bin")?;
    let streams = file.readstreams()?;
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].name, "meta");
    assert_eq!(streams[0].size, 9);

    // stream lookup is case-insensitive too
    let mut stream = file.open_stream("META")?;
    let mut content = Vec::new();
    stream.read_to_end(&mut content)?;
    assert_eq!(content, b"side data");

    let err = file.open_stream("nope").unwrap_err();
    assert!(matches!(err.kind, ErrorKind::FileNotFound));
    assert_eq!(err.stream.as_deref(), Some("nope"));
    Ok(())
}

#[test]
fn test_walk_visits_streams_and_skips() -> Result<()> {
    let td = TempDir::new()?;
    let fs_path = td.path().join(FILESYSTEM_FILE_NAME);
    let mut w = Writer::create(&fs_path)?;
    w.write_file("Files", &dir_info())?;
    put_file(&mut w, "Files/a.txt", b"a")?;
    w.write_file("Files/a.txt:extra", &file_info(1))?;
    w.write(b"e")?;
    w.write_file("skipme", &dir_info())?;
    put_file(&mut w, "skipme/hidden.txt", b"h")?;
    w.commit()?;

    let cim = Cim::open(&fs_path)?;
    let mut visited = Vec::new();
    walk(&cim.root()?, &mut |file, stream| {
        match stream {
            Some(stream) => visited.push(format!("{}:{}", file.name(), stream.name)),
            None => visited.push(file.name().to_string()),
        }
        if file.name() == "/skipme" && stream.is_none() {
            return Ok(WalkControl::SkipDir);
        }
        Ok(WalkControl::Continue)
    })?;
    assert_eq!(
        visited,
        vec![
            "/".to_string(),
            "/Files".to_string(),
            "/Files/a.txt".to_string(),
            "/Files/a.txt:extra".to_string(),
            "/skipme".to_string(),
        ]
    );
    Ok(())
}

#[test]
fn test_pe_remap() -> Result<()> {
    let td = TempDir::new()?;
    let fs_path = td.path().join(FILESYSTEM_FILE_NAME);

    // 0x1800 dense bytes; logical [0x1000, 0x1800) maps to physical
    // [0x800, 0x1000), and the aligned tail reads as zeros.
    let dense: Vec<u8> = (0..0x1800u32).map(|i| (i % 251) as u8).collect();
    let mut backend = ImageWriter::create(td.path(), FILESYSTEM_FILE_NAME)?;
    backend.add_pe_file(
        "app.exe",
        &file_info(0),
        0x2000,
        &[(0, 0), (0x1000, 0x800)],
        &dense,
    )?;
    backend.commit()?;

    let cim = Cim::open(&fs_path)?;
    let mut file = cim.open_file("app.exe")?;
    assert_eq!(file.size(), 0x2000);
    let content = read_all(&mut file)?;

    let mut expected = dense[..0x1000].to_vec();
    expected.extend_from_slice(&dense[0x800..0x1000]);
    expected.extend_from_slice(&[0u8; 0x800]);
    assert_eq!(content.len(), expected.len());
    assert_eq!(content, expected);
    Ok(())
}

#[test]
fn test_append_shadowing() -> Result<()> {
    let td = TempDir::new()?;
    let base_path = write_basic_image(td.path())?;

    let mut w = Writer::append(&base_path, "child.fs")?;
    put_file(&mut w, "Files/Readme.TXT", b"NEW CONTENT")?;
    put_file(&mut w, "Files/added.txt", b"added by child")?;
    w.unlink("Files/Windows/System32/config.dat")?;
    w.commit()?;

    // the child view shadows, adds, and removes
    let child = Cim::open(td.path().join("child.fs"))?;
    let mut readme = child.open_file("Files/Readme.TXT")?;
    assert_eq!(read_all(&mut readme)?, b"NEW CONTENT");
    let mut added = child.open_file("Files/added.txt")?;
    assert_eq!(read_all(&mut added)?, b"added by child");
    let err = child.open_file("Files/Windows/System32/config.dat").unwrap_err();
    assert!(matches!(err.kind, ErrorKind::FileNotFound));

    // directories not touched by the child are still reachable
    assert!(child.open_file("Files/Windows/System32/").is_ok());

    // the original view is untouched
    let base = Cim::open(&base_path)?;
    let mut readme = base.open_file("Files/Readme.TXT")?;
    assert_eq!(read_all(&mut readme)?, b"hello image");
    let mut config = base.open_file("Files/Windows/System32/config.dat")?;
    assert_eq!(read_all(&mut config)?, b"configuration");
    Ok(())
}

#[test]
fn test_append_reuses_parent_data() -> Result<()> {
    let td = TempDir::new()?;
    let base_path = write_basic_image(td.path())?;
    let parent_regions = std::fs::read_dir(td.path())?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("region_"))
        .count();
    assert_eq!(parent_regions, 3);

    let mut w = Writer::append(&base_path, "child.fs")?;
    // identical content dedupes against the parent's object table
    put_file(&mut w, "Files/copy.txt", b"hello image")?;
    w.commit()?;

    let child = Cim::open(td.path().join("child.fs"))?;
    let mut copy = child.open_file("Files/copy.txt")?;
    assert_eq!(read_all(&mut copy)?, b"hello image");

    // six region files now: the parent's three plus the child's three
    let regions = std::fs::read_dir(td.path())?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("region_"))
        .count();
    assert_eq!(regions, 6);
    Ok(())
}

#[test]
fn test_layer_expansion() -> Result<()> {
    let p2_dir = TempDir::new()?;
    let p1_dir = TempDir::new()?;
    let child_dir = TempDir::new()?;
    let p1_id = Guid::generate();
    let p2_id = Guid::generate();

    // P2: the bottom layer has Files/a.txt and Files/b.txt
    let p2_path = p2_dir.path().join(FILESYSTEM_FILE_NAME);
    let mut w = Writer::create(&p2_path)?;
    w.write_file("Files", &dir_info())?;
    put_file(&mut w, "Files/a.txt", b"from p2")?;
    put_file(&mut w, "Files/b.txt", b"b content")?;
    w.commit()?;

    // P1 shadows Files/a.txt; expanding it over P2 synthesizes a redirect
    // for Files/b.txt
    let p1_path = p1_dir.path().join(FILESYSTEM_FILE_NAME);
    let mut w = Writer::create(&p1_path)?;
    w.write_file("Files", &dir_info())?;
    put_file(&mut w, "Files/a.txt", b"from p1")?;
    w.commit()?;

    let p2_layer = Layer {
        id: p2_id,
        path: p2_path.clone(),
    };
    let mut w = Writer::append(&p1_path, "expanded.fs")?;
    layer::expand(&mut w, &p1_path, "Files", p2_id, &[p2_layer.clone()])?;
    w.commit()?;
    let p1_expanded = p1_dir.path().join("expanded.fs");

    let p1_view = Cim::open(&p1_expanded)?;
    let b = p1_view.open_file("Files/b.txt")?;
    let b_stat = b.stat()?;
    assert_eq!(b_stat.reparse_tag, REPARSE_TAG_WCI_LINK);
    let (layer_id, target) = layer::decode_wci_link(&b_stat.reparse_data)?;
    assert_eq!(layer_id, p2_id);
    assert_eq!(target, "Files\\b.txt");
    assert_ne!(b_stat.attributes & FILE_ATTRIBUTE_SPARSE_FILE, 0);
    assert_ne!(b_stat.attributes & FILE_ATTRIBUTE_REPARSE_POINT, 0);
    assert_eq!(b_stat.size, b"b content".len() as u64);

    // C tombstones Files/a.txt on top of [P1 expanded, P2]
    let child_path = child_dir.path().join(FILESYSTEM_FILE_NAME);
    let mut w = Writer::create(&child_path)?;
    w.write_file("Files", &dir_info())?;
    let tombstone = FileInfo {
        reparse_tag: REPARSE_TAG_WCI_TOMBSTONE,
        attributes: FILE_ATTRIBUTE_REPARSE_POINT,
        ..Default::default()
    };
    w.write_file("Files/a.txt", &tombstone)?;
    w.commit()?;

    let layers = vec![
        Layer {
            id: p1_id,
            path: p1_expanded.clone(),
        },
        p2_layer,
    ];
    let mut w = Writer::append(&child_path, "expanded.fs")?;
    layer::expand(&mut w, &child_path, "Files", p1_id, &layers)?;
    w.commit()?;

    let merged = Cim::open(child_dir.path().join("expanded.fs"))?;
    // the tombstoned file is gone
    let err = merged.open_file("Files/a.txt").unwrap_err();
    assert!(matches!(err.kind, ErrorKind::FileNotFound));
    // the redirect synthesized by P1's expansion is carried through,
    // still naming P2's layer
    let b_stat = merged.open_file("Files/b.txt")?.stat()?;
    assert_eq!(b_stat.reparse_tag, REPARSE_TAG_WCI_LINK);
    let (layer_id, target) = layer::decode_wci_link(&b_stat.reparse_data)?;
    assert_eq!(layer_id, p2_id);
    assert_eq!(target, "Files\\b.txt");
    Ok(())
}

#[test]
fn test_layer_loop_detected() -> Result<()> {
    // A layer whose directory redirect points back at itself cannot
    // terminate; the chain is bounded by the layer count.
    let dir = TempDir::new()?;
    let id = Guid::generate();
    let fs_path = dir.path().join(FILESYSTEM_FILE_NAME);
    let mut w = Writer::create(&fs_path)?;
    let mut looping = dir_info();
    looping.reparse_tag = REPARSE_TAG_WCI_LINK;
    looping.reparse_data = layer::encode_wci_link(id, "Files");
    looping.attributes |= FILE_ATTRIBUTE_REPARSE_POINT;
    w.write_file("Files", &looping)?;
    w.commit()?;

    let child_dir = TempDir::new()?;
    let child_path = child_dir.path().join(FILESYSTEM_FILE_NAME);
    let mut w = Writer::create(&child_path)?;
    w.write_file("Files", &dir_info())?;
    w.write_file("Files/x", &dir_info())?;
    w.commit()?;

    let layers = vec![Layer {
        id,
        path: fs_path,
    }];
    let mut w = Writer::append(&child_path, "expanded.fs")?;
    let err = layer::expand(&mut w, &child_path, "Files", id, &layers).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::LayerLoop));
    Ok(())
}
