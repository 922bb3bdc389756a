use std::io::Write;
use std::path::Path;

use tarfslib::indexed_archive;
use tarfslib::path_tree::LookupResult;

fn write_file(builder: &mut tar::Builder<&mut Vec<u8>>, path: &str, contents: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_path(path).unwrap();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(1_700_000_000);
    header.set_cksum();
    builder.append(&header, contents).unwrap();
}

fn write_symlink(builder: &mut tar::Builder<&mut Vec<u8>>, path: &str, target: &str) {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Symlink);
    header.set_path(path).unwrap();
    header.set_size(0);
    header.set_mode(0o777);
    header.set_cksum();
    builder.append_link(&mut header, path, target).unwrap();
}

fn build_archive() -> Vec<u8> {
    let mut bytes = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut bytes);
        write_file(&mut builder, "README.md", b"hello, world\n");
        write_file(&mut builder, "src/main.rs", b"fn main() {}\n");
        write_symlink(&mut builder, "latest", "README.md");
        builder.finish().unwrap();
    }
    bytes
}

fn build_inner_archive() -> Vec<u8> {
    let mut bytes = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut bytes);
        write_file(&mut builder, "notes.txt", b"nested contents\n");
        builder.finish().unwrap();
    }
    bytes
}

#[test]
fn builds_a_tree_that_mirrors_the_archive_layout() {
    let dir = tempfile::tempdir().unwrap();
    let archive_path = dir.path().join("sample.tar");
    std::fs::File::create(&archive_path).unwrap().write_all(&build_archive()).unwrap();
    let file = std::fs::File::open(&archive_path).unwrap();

    let tree = indexed_archive::build_tree(&file, 0, false, 1).unwrap();

    match tree.lookup(Path::new("/README.md"), false).unwrap() {
        LookupResult::File(record) => {
            assert_eq!(record.size, 13);
            assert_eq!(record.mtime, 1_700_000_000);
        }
        _ => panic!("expected a file"),
    }

    match tree.lookup(Path::new("/src"), true).unwrap() {
        LookupResult::Dir(children) => assert!(children.contains_key("main.rs")),
        _ => panic!("expected an auto-vivified directory"),
    }

    match tree.lookup(Path::new("/latest"), false).unwrap() {
        LookupResult::File(record) => {
            assert_eq!(record.linkname, "README.md");
            assert_eq!(record.size, "README.md".len() as u64);
        }
        _ => panic!("expected a symlink"),
    }
}

#[test]
fn recursively_mounted_archive_appears_as_a_directory() {
    let inner = build_inner_archive();
    let mut outer_bytes = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut outer_bytes);
        write_file(&mut builder, "payload.tar", &inner);
        builder.finish().unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    let archive_path = dir.path().join("outer.tar");
    std::fs::File::create(&archive_path).unwrap().write_all(&outer_bytes).unwrap();
    let file = std::fs::File::open(&archive_path).unwrap();

    let tree = indexed_archive::build_tree(&file, 0, true, 1).unwrap();

    assert!(tree.is_dir(Path::new("/payload")));
    match tree.lookup(Path::new("/payload/notes.txt"), false).unwrap() {
        LookupResult::File(record) => assert_eq!(record.size, 16),
        _ => panic!("expected the nested file"),
    }
}

#[test]
fn index_round_trips_through_disk_and_reproduces_the_same_tree() {
    let dir = tempfile::tempdir().unwrap();
    let archive_path = dir.path().join("sample.tar");
    std::fs::File::create(&archive_path).unwrap().write_all(&build_archive()).unwrap();
    let file = std::fs::File::open(&archive_path).unwrap();

    let opts = tarfslib::MountOptions { write_index: true, ..Default::default() };
    let tree = indexed_archive::index_archive(&archive_path, &file, &opts).unwrap();
    assert!(tree.exists(Path::new("/README.md")));

    let index_path = dir.path().join("sample.tar.index.custom");
    assert!(index_path.is_file());

    // Loading again should hit the just-written index rather than rescan.
    let reloaded = indexed_archive::index_archive(&archive_path, &file, &opts).unwrap();
    match reloaded.lookup(Path::new("/src/main.rs"), false).unwrap() {
        LookupResult::File(record) => assert_eq!(record.size, 13),
        _ => panic!("expected a file"),
    }
}
