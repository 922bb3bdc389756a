use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::error::Error;

pub const S_IFIFO: u16 = 0o010_000;
pub const S_IFCHR: u16 = 0o020_000;
pub const S_IFDIR: u16 = 0o040_000;
pub const S_IFREG: u16 = 0o100_000;
pub const S_IFLNK: u16 = 0o120_000;
pub const S_IFBLK: u16 = 0o060_000;

/// The kind of a TAR member, reduced to what the filesystem adapter needs
/// to answer `getattr`/`readdir` correctly. Hardlinks (`tar::EntryType::Link`)
/// are folded into `Symlink`: we leave them unresolved and let `readlink`
/// hand back the recorded link name verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    Char,
    Block,
    Fifo,
}

impl EntryKind {
    pub fn mode_bits(self) -> u16 {
        match self {
            EntryKind::Regular => S_IFREG,
            EntryKind::Directory => S_IFDIR,
            EntryKind::Symlink => S_IFLNK,
            EntryKind::Char => S_IFCHR,
            EntryKind::Block => S_IFBLK,
            EntryKind::Fifo => S_IFIFO,
        }
    }

    pub fn from_tar(entry_type: tar::EntryType) -> EntryKind {
        use tar::EntryType::*;
        match entry_type {
            Regular | Continuous => EntryKind::Regular,
            Directory => EntryKind::Directory,
            Symlink | Link => EntryKind::Symlink,
            Char => EntryKind::Char,
            Block => EntryKind::Block,
            Fifo => EntryKind::Fifo,
            other => {
                log::debug!("unsupported TAR entry type {:?}, treating as regular file", other);
                EntryKind::Regular
            }
        }
    }

    pub fn tag_byte(self) -> u8 {
        match self {
            EntryKind::Regular => 0,
            EntryKind::Directory => 1,
            EntryKind::Symlink => 2,
            EntryKind::Char => 3,
            EntryKind::Block => 4,
            EntryKind::Fifo => 5,
        }
    }

    pub fn from_tag_byte(tag: u8) -> Result<EntryKind, Error> {
        match tag {
            0 => Ok(EntryKind::Regular),
            1 => Ok(EntryKind::Directory),
            2 => Ok(EntryKind::Symlink),
            3 => Ok(EntryKind::Char),
            4 => Ok(EntryKind::Block),
            5 => Ok(EntryKind::Fifo),
            other => Err(Error::CorruptIndex(format!("unknown entry kind tag {}", other))),
        }
    }
}

/// One archive member's metadata, exactly as much as `getattr`/`read` need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub offset: u64,
    pub size: u64,
    pub mtime: i64,
    pub mode: u16,
    pub kind: EntryKind,
    pub linkname: String,
    pub uid: u32,
    pub gid: u32,
    pub istar: bool,
}

impl FileRecord {
    /// Fallback metadata for a directory that was only ever created by
    /// path auto-vivification (no TAR member carried an explicit entry
    /// for it).
    pub fn synthesized_dir() -> FileRecord {
        FileRecord {
            offset: 0,
            size: 1,
            mtime: 0,
            mode: 0o555 | S_IFDIR,
            kind: EntryKind::Directory,
            linkname: String::new(),
            uid: 0,
            gid: 0,
            istar: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PathNode {
    Leaf(FileRecord),
    Dir(DirNode),
}

#[derive(Debug, Clone, Default)]
pub struct DirNode {
    pub self_meta: Option<FileRecord>,
    pub children: BTreeMap<String, PathNode>,
}

impl DirNode {
    pub fn empty() -> DirNode {
        DirNode::default()
    }
}

pub enum LookupResult<'a> {
    File(FileRecord),
    Dir(&'a BTreeMap<String, PathNode>),
}

/// Normalizes an archive-internal path to the tree's canonical key space:
/// a leading `/`, `.`/repeated separators collapsed, `..` segments dropped
/// (well-formed TAR member names never carry them; this mirrors
/// `os.path.normpath`'s string-level behavior closely enough for archive
/// paths, without chasing the filesystem for a real parent).
pub fn normalize(raw: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in raw.components() {
        if let Component::Normal(segment) = component {
            out.push(segment);
        }
    }
    out
}

fn components_of(path: &Path) -> Vec<String> {
    normalize(path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

/// The in-memory directory hierarchy built by one archive scan. Built once
/// at mount time and never mutated again once handed to the filesystem
/// adapter.
#[derive(Debug, Clone, Default)]
pub struct PathTree {
    root: DirNode,
}

enum NodeRef<'a> {
    Leaf(&'a FileRecord),
    Dir(&'a DirNode),
}

impl PathTree {
    pub fn new() -> PathTree {
        PathTree { root: DirNode::empty() }
    }

    pub fn from_root(root: DirNode) -> PathTree {
        PathTree { root }
    }

    pub fn root_children(&self) -> &BTreeMap<String, PathNode> {
        &self.root.children
    }

    pub fn into_children(self) -> BTreeMap<String, PathNode> {
        self.root.children
    }

    pub fn set_root_meta(&mut self, record: FileRecord) {
        self.root.self_meta = Some(record);
    }

    fn descend(&self, path: &Path) -> Option<NodeRef<'_>> {
        let comps = components_of(path);
        if comps.is_empty() {
            return Some(NodeRef::Dir(&self.root));
        }
        let mut cur = &self.root;
        for (i, comp) in comps.iter().enumerate() {
            let node = cur.children.get(comp)?;
            let is_last = i == comps.len() - 1;
            match (node, is_last) {
                (PathNode::Leaf(r), true) => return Some(NodeRef::Leaf(r)),
                (PathNode::Leaf(_), false) => return None,
                (PathNode::Dir(d), true) => return Some(NodeRef::Dir(d)),
                (PathNode::Dir(d), false) => cur = d,
            }
        }
        unreachable!()
    }

    /// `list_dir == false` collapses a directory into its own `FileRecord`
    /// (its self-entry, or a synthesized one); `list_dir == true` returns
    /// its children map for `readdir`.
    pub fn lookup(&self, path: &Path, list_dir: bool) -> Option<LookupResult<'_>> {
        match self.descend(path)? {
            NodeRef::Leaf(record) => Some(LookupResult::File(record.clone())),
            NodeRef::Dir(dir) => {
                if list_dir {
                    Some(LookupResult::Dir(&dir.children))
                } else {
                    match &dir.self_meta {
                        Some(record) => Some(LookupResult::File(record.clone())),
                        None => Some(LookupResult::File(FileRecord::synthesized_dir())),
                    }
                }
            }
        }
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.descend(path).is_some()
    }

    pub fn is_dir(&self, path: &Path) -> bool {
        matches!(self.descend(path), Some(NodeRef::Dir(_)))
    }

    fn ancestor_dir_mut(&mut self, comps: &[String]) -> Result<&mut DirNode, Error> {
        let mut cur = &mut self.root;
        for comp in comps {
            let entry = cur
                .children
                .entry(comp.clone())
                .or_insert_with(|| PathNode::Dir(DirNode::empty()));
            match entry {
                PathNode::Dir(d) => cur = d,
                PathNode::Leaf(_) => {
                    return Err(Error::PathConflict {
                        path: comp.clone(),
                        reason: "ancestor component is a file".into(),
                    })
                }
            }
        }
        Ok(cur)
    }

    pub fn set_file(&mut self, path: &Path, record: FileRecord) -> Result<(), Error> {
        let comps = components_of(path);
        let name = comps.last().cloned().ok_or_else(|| Error::PathConflict {
            path: "/".into(),
            reason: "cannot replace the root with a file".into(),
        })?;
        let parent = self.ancestor_dir_mut(&comps[..comps.len() - 1])?;
        parent.children.insert(name, PathNode::Leaf(record));
        Ok(())
    }

    /// Inserts a directory at `path`. `contents` is merged into whatever
    /// children the path already has (auto-vivified ancestors keep the
    /// children inserted under them by earlier `set_file` calls); a prior
    /// leaf at `path` is replaced outright.
    pub fn set_dir(
        &mut self,
        path: &Path,
        record: FileRecord,
        contents: BTreeMap<String, PathNode>,
    ) -> Result<(), Error> {
        let comps = components_of(path);
        if comps.is_empty() {
            self.root.self_meta = Some(record);
            self.root.children.extend(contents);
            return Ok(());
        }
        let name = comps.last().cloned().unwrap();
        let parent = self.ancestor_dir_mut(&comps[..comps.len() - 1])?;
        let slot = parent
            .children
            .entry(name)
            .or_insert_with(|| PathNode::Dir(DirNode::empty()));
        match slot {
            PathNode::Dir(d) => {
                d.self_meta = Some(record);
                d.children.extend(contents);
            }
            PathNode::Leaf(_) => {
                *slot = PathNode::Dir(DirNode { self_meta: Some(record), children: contents });
            }
        }
        Ok(())
    }

    fn remove(&mut self, path: &Path) -> Option<PathNode> {
        let comps = components_of(path);
        let name = comps.last()?.clone();
        let mut cur = &mut self.root;
        for comp in &comps[..comps.len() - 1] {
            match cur.children.get_mut(comp)? {
                PathNode::Dir(d) => cur = d,
                PathNode::Leaf(_) => return None,
            }
        }
        cur.children.remove(&name)
    }

    fn insert_node(&mut self, path: &Path, node: PathNode) -> Result<(), Error> {
        let comps = components_of(path);
        let name = comps.last().cloned().ok_or_else(|| Error::PathConflict {
            path: "/".into(),
            reason: "cannot replace the root".into(),
        })?;
        let parent = self.ancestor_dir_mut(&comps[..comps.len() - 1])?;
        parent.children.insert(name, node);
        Ok(())
    }

    /// Relocates the whole subtree at `from` to `to`, used to preserve a
    /// synthesized TAR-directory mount when a later plain entry claims its
    /// path (see `indexed_archive::build_tree`'s collision handling).
    pub fn rename(&mut self, from: &Path, to: &Path) -> Result<(), Error> {
        let node = self.remove(from).ok_or_else(|| Error::NotFound(from.display().to_string()))?;
        self.insert_node(to, node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regular(offset: u64, size: u64) -> FileRecord {
        FileRecord {
            offset,
            size,
            mtime: 0,
            mode: 0o644 | S_IFREG,
            kind: EntryKind::Regular,
            linkname: String::new(),
            uid: 0,
            gid: 0,
            istar: false,
        }
    }

    fn dir(mode: u16) -> FileRecord {
        FileRecord {
            offset: 0,
            size: 0,
            mtime: 0,
            mode: mode | S_IFDIR,
            kind: EntryKind::Directory,
            linkname: String::new(),
            uid: 0,
            gid: 0,
            istar: false,
        }
    }

    #[test]
    fn set_file_autovivifies_ancestors() {
        let mut tree = PathTree::new();
        tree.set_file(Path::new("/a/b/c.txt"), regular(10, 3)).unwrap();

        assert!(tree.is_dir(Path::new("/a")));
        assert!(tree.is_dir(Path::new("/a/b")));
        match tree.lookup(Path::new("/a/b/c.txt"), false).unwrap() {
            LookupResult::File(r) => assert_eq!(r.offset, 10),
            _ => panic!("expected a file"),
        }
    }

    #[test]
    fn auto_vivified_dir_synthesizes_metadata() {
        let mut tree = PathTree::new();
        tree.set_file(Path::new("/a/b.txt"), regular(0, 0)).unwrap();
        match tree.lookup(Path::new("/a"), false).unwrap() {
            LookupResult::File(r) => {
                assert_eq!(r.kind, EntryKind::Directory);
                assert!(!r.istar);
            }
            _ => panic!("expected a directory record"),
        }
    }

    #[test]
    fn set_dir_merges_into_autovivified_children() {
        let mut tree = PathTree::new();
        tree.set_file(Path::new("/a/b.txt"), regular(1, 1)).unwrap();
        tree.set_dir(Path::new("/a"), dir(0o755), BTreeMap::new()).unwrap();

        match tree.lookup(Path::new("/a"), true).unwrap() {
            LookupResult::Dir(children) => assert!(children.contains_key("b.txt")),
            _ => panic!("expected a directory"),
        }
        match tree.lookup(Path::new("/a"), false).unwrap() {
            LookupResult::File(r) => assert_eq!(r.mode & 0o777, 0o755),
            _ => panic!("expected the dir's own record"),
        }
    }

    #[test]
    fn rename_moves_a_whole_subtree() {
        let mut tree = PathTree::new();
        tree.set_file(Path::new("/foo/inner.txt"), regular(2, 2)).unwrap();
        tree.rename(Path::new("/foo"), Path::new("/foo.tar")).unwrap();

        assert!(!tree.exists(Path::new("/foo")));
        assert!(tree.exists(Path::new("/foo.tar/inner.txt")));
    }

    #[test]
    fn lookup_missing_path_is_none() {
        let tree = PathTree::new();
        assert!(tree.lookup(Path::new("/nope"), false).is_none());
    }

    #[test]
    fn normalize_collapses_dot_segments() {
        assert_eq!(normalize(Path::new("./a/./b/")), PathBuf::from("/a/b"));
        assert_eq!(normalize(Path::new("a/../b")), PathBuf::from("/a/b"));
    }
}
