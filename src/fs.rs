use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use fuse::{FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEntry, Request};
use libc::{EIO, ENOENT, EROFS};
use time::Timespec;

use crate::path_tree::{EntryKind, FileRecord, LookupResult, PathNode, PathTree};

const ROOT_INO: u64 = 1;
const TTL: Timespec = Timespec { sec: 1, nsec: 0 };

/// Assigns a stable inode number to every path in a `PathTree`, built once
/// at mount time (the tree itself never changes afterwards). The old
/// `fuse` API is inode-based rather than path-based, so callbacks need a
/// way back from an `ino` to the path it names; the teacher's `tarfs.rs`
/// solved the same problem with an `index_to_inode`/`inode_to_index`
/// offset, here generalized to arbitrary paths rather than a flat index.
struct InodeTable {
    paths: Vec<PathBuf>,
    by_path: HashMap<PathBuf, u64>,
}

impl InodeTable {
    fn build(tree: &PathTree) -> InodeTable {
        let root = PathBuf::from("/");
        let mut paths = vec![PathBuf::new(), root.clone()];
        let mut by_path = HashMap::new();
        by_path.insert(root.clone(), ROOT_INO);

        fn walk(children: &BTreeMap<String, PathNode>, prefix: &Path, paths: &mut Vec<PathBuf>, by_path: &mut HashMap<PathBuf, u64>) {
            for (name, node) in children {
                let path = prefix.join(name);
                let ino = paths.len() as u64;
                paths.push(path.clone());
                by_path.insert(path.clone(), ino);
                if let PathNode::Dir(dir) = node {
                    walk(&dir.children, &path, paths, by_path);
                }
            }
        }
        walk(tree.root_children(), &root, &mut paths, &mut by_path);

        InodeTable { paths, by_path }
    }

    fn path(&self, ino: u64) -> Option<&Path> {
        self.paths.get(ino as usize).map(PathBuf::as_path)
    }

    fn ino(&self, path: &Path) -> Option<u64> {
        self.by_path.get(path).copied()
    }
}

/// Read-only FUSE adapter generic over any `Read + Seek` backing store: the
/// archive `File` for a normal mount, or a `JoinedFile` for the
/// concatenated-stream mount. The path tree is immutable once built, so
/// only `backing`'s read cursor needs the exclusive `&mut self` access the
/// `fuse` crate's single-threaded dispatch already guarantees.
pub struct TarFs<R: Read + Seek> {
    tree: PathTree,
    inodes: InodeTable,
    backing: R,
}

impl<R: Read + Seek> TarFs<R> {
    pub fn new(tree: PathTree, backing: R) -> TarFs<R> {
        let inodes = InodeTable::build(&tree);
        TarFs { tree, inodes, backing }
    }

    fn parent_ino(&self, ino: u64) -> u64 {
        if ino == ROOT_INO {
            return ROOT_INO;
        }
        match self.inodes.path(ino).and_then(Path::parent) {
            Some(parent) => self.inodes.ino(parent).unwrap_or(ROOT_INO),
            None => ROOT_INO,
        }
    }

    fn attr_for(&self, ino: u64, record: &FileRecord) -> FileAttr {
        let mtime = Timespec::new(record.mtime, 0);
        // Write bits are always masked off: every write-oriented callback
        // either falls through to ENOSYS or answers EROFS, so reporting
        // them would be a lie the kernel might act on.
        let perm = (record.mode & 0o555) as u16;
        FileAttr {
            ino,
            size: record.size,
            blocks: (record.size + 511) / 512,
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: kind_to_file_type(record.kind),
            perm,
            nlink: 2,
            uid: record.uid,
            gid: record.gid,
            rdev: 0,
            flags: 0,
        }
    }
}

fn kind_to_file_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::Regular => FileType::RegularFile,
        EntryKind::Directory => FileType::Directory,
        EntryKind::Symlink => FileType::Symlink,
        EntryKind::Char => FileType::CharDevice,
        EntryKind::Block => FileType::BlockDevice,
        EntryKind::Fifo => FileType::NamedPipe,
    }
}

fn node_file_type(node: &PathNode) -> FileType {
    match node {
        PathNode::Dir(_) => FileType::Directory,
        PathNode::Leaf(record) => kind_to_file_type(record.kind),
    }
}

fn read_clamped<R: Read + Seek>(backing: &mut R, base_offset: u64, member_size: u64, rel_offset: u64, size: usize) -> std::io::Result<Vec<u8>> {
    if rel_offset >= member_size {
        return Ok(Vec::new());
    }
    let available = (member_size - rel_offset).min(size as u64) as usize;

    backing.seek(SeekFrom::Start(base_offset + rel_offset))?;
    let mut buf = vec![0u8; available];
    let mut total = 0;
    while total < available {
        let n = backing.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    buf.truncate(total);
    Ok(buf)
}

impl<R: Read + Seek> Filesystem for TarFs<R> {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent_path = match self.inodes.path(parent) {
            Some(p) => p.to_path_buf(),
            None => return reply.error(ENOENT),
        };
        let child_path = parent_path.join(name);
        let ino = match self.inodes.ino(&child_path) {
            Some(ino) => ino,
            None => return reply.error(ENOENT),
        };
        match self.tree.lookup(&child_path, false) {
            Some(LookupResult::File(record)) => reply.entry(&TTL, &self.attr_for(ino, &record), 0),
            _ => reply.error(ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let path = match self.inodes.path(ino) {
            Some(p) => p.to_path_buf(),
            None => return reply.error(EROFS),
        };
        match self.tree.lookup(&path, false) {
            Some(LookupResult::File(record)) => reply.attr(&TTL, &self.attr_for(ino, &record)),
            _ => reply.error(EROFS),
        }
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let path = match self.inodes.path(ino) {
            Some(p) => p.to_path_buf(),
            None => return reply.error(ENOENT),
        };
        let children = match self.tree.lookup(&path, true) {
            Some(LookupResult::Dir(children)) => children,
            _ => return reply.error(ENOENT),
        };

        let mut entries: Vec<(u64, FileType, String)> = Vec::with_capacity(children.len() + 2);
        entries.push((ino, FileType::Directory, ".".to_string()));
        entries.push((self.parent_ino(ino), FileType::Directory, "..".to_string()));
        for (name, node) in children {
            let child_path = path.join(name);
            let child_ino = self.inodes.ino(&child_path).unwrap_or(ino);
            entries.push((child_ino, node_file_type(node), name.clone()));
        }

        for (i, (entry_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            let next_offset = (i + 1) as i64;
            if reply.add(*entry_ino, next_offset, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        // Mirrors getattr/read: an unanswerable lookup on this read-only
        // filesystem is EROFS, not ENOENT (the kernel already guarantees
        // ino refers to a symlink via a prior lookup/getattr).
        let path = match self.inodes.path(ino) {
            Some(p) => p.to_path_buf(),
            None => return reply.error(EROFS),
        };
        match self.tree.lookup(&path, false) {
            Some(LookupResult::File(record)) if record.kind == EntryKind::Symlink => {
                reply.data(record.linkname.as_bytes())
            }
            _ => reply.error(EROFS),
        }
    }

    fn read(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, size: u32, reply: ReplyData) {
        let path = match self.inodes.path(ino) {
            Some(p) => p.to_path_buf(),
            None => return reply.error(ENOENT),
        };
        let record = match self.tree.lookup(&path, false) {
            Some(LookupResult::File(record)) if record.kind != EntryKind::Directory => record,
            _ => return reply.error(EROFS),
        };

        match read_clamped(&mut self.backing, record.offset, record.size, offset as u64, size as usize) {
            Ok(buf) => reply.data(&buf),
            Err(e) => {
                log::warn!("read error on {}: {}", path.display(), e);
                reply.error(EIO)
            }
        }
    }
}

/// Synthesizes a one-file tree exposing a `JoinedFile` at `/joined`,
/// mirroring `JoinedFileMount.py`'s `FuseFileObjectMount`: a single
/// regular file whose size and ownership come from the first part's own
/// `stat()`, backed by logical offset 0 of the joined stream.
pub fn single_file_tree(name: &str, size: u64, stat_source: &std::fs::Metadata) -> PathTree {
    use std::os::unix::fs::MetadataExt;

    let mut tree = PathTree::new();
    tree.set_root_meta(FileRecord {
        offset: 0,
        size: 0,
        mtime: stat_source.mtime(),
        mode: 0o777 | crate::path_tree::S_IFDIR,
        kind: EntryKind::Directory,
        linkname: String::new(),
        uid: stat_source.uid(),
        gid: stat_source.gid(),
        istar: false,
    });
    tree.set_file(
        Path::new(&format!("/{}", name)),
        FileRecord {
            offset: 0,
            size,
            mtime: stat_source.mtime(),
            mode: (stat_source.mode() as u16 & 0o777) | crate::path_tree::S_IFREG,
            kind: EntryKind::Regular,
            linkname: String::new(),
            uid: stat_source.uid(),
            gid: stat_source.gid(),
            istar: false,
        },
    )
    .expect("a single top-level file always inserts cleanly");
    tree
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_record(mode: u16, offset: u64, size: u64) -> FileRecord {
        FileRecord {
            offset,
            size,
            mtime: 0,
            mode,
            kind: EntryKind::Regular,
            linkname: String::new(),
            uid: 0,
            gid: 0,
            istar: false,
        }
    }

    #[test]
    fn attr_for_masks_off_write_bits() {
        let tree = PathTree::new();
        let inodes = InodeTable::build(&tree);
        let fs = TarFs { tree, inodes, backing: Cursor::new(Vec::<u8>::new()) };

        let record = sample_record(0o755 | crate::path_tree::S_IFREG, 0, 0);
        let attr = fs.attr_for(2, &record);

        // Scenario S6: a 0o755 member reports 0o555, every write bit gone.
        assert_eq!(attr.perm, 0o555);
    }

    #[test]
    fn attr_for_preserves_read_and_execute_bits() {
        let tree = PathTree::new();
        let inodes = InodeTable::build(&tree);
        let fs = TarFs { tree, inodes, backing: Cursor::new(Vec::<u8>::new()) };

        let record = sample_record(0o644 | crate::path_tree::S_IFREG, 0, 0);
        let attr = fs.attr_for(2, &record);

        assert_eq!(attr.perm, 0o444);
    }

    #[test]
    fn read_clamped_returns_the_requested_slice() {
        let mut backing = Cursor::new(b"0123456789".to_vec());
        let buf = read_clamped(&mut backing, 2, 5, 1, 100).unwrap();
        // member occupies bytes [2,7) of the backing store; rel_offset 1
        // starts at byte 3 and the member has 4 bytes left ("3456").
        assert_eq!(buf, b"3456");
    }

    #[test]
    fn read_clamped_stops_at_member_end_even_if_more_was_requested() {
        let mut backing = Cursor::new(b"0123456789".to_vec());
        let buf = read_clamped(&mut backing, 0, 3, 0, 10).unwrap();
        assert_eq!(buf, b"012");
    }

    #[test]
    fn read_clamped_past_member_end_returns_empty() {
        let mut backing = Cursor::new(b"0123456789".to_vec());
        let buf = read_clamped(&mut backing, 0, 3, 3, 10).unwrap();
        assert!(buf.is_empty());
    }
}
