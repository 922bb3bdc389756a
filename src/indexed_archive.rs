use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::cache_dir;
use crate::error::Error;
use crate::index_codec::{self, Codec, Compression};
use crate::path_tree::{normalize, EntryKind, FileRecord, LookupResult, PathTree, S_IFDIR};
use crate::scanner::TarScanner;

/// Parameters for one `index_archive` call, threaded explicitly rather
/// than through an ambient global (the source's `printDebug` integer).
#[derive(Debug, Clone)]
pub struct Options {
    pub write_index: bool,
    pub clear_cache: bool,
    pub recursive: bool,
    pub codec: Codec,
    pub compression: Compression,
    pub verbosity: u8,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            write_index: true,
            clear_cache: false,
            recursive: false,
            codec: Codec::Custom,
            compression: Compression::None,
            verbosity: 1,
        }
    }
}

/// Runs the full load-or-build-then-persist cycle for `archive_path` and
/// returns the resulting path tree. The tree's root carries no self-entry
/// yet; callers that go on to mount it should call `stamp_root` first.
pub fn index_archive(archive_path: &Path, file: &File, opts: &Options) -> Result<PathTree, Error> {
    if opts.clear_cache {
        clear_index_cache(archive_path);
    } else if let Some(tree) = try_load(archive_path, (opts.codec, opts.compression))? {
        return Ok(tree);
    }

    let tree = build_tree(file, 0, opts.recursive, opts.verbosity)?;

    if opts.write_index {
        persist(&tree, archive_path, opts.codec, opts.compression);
    }

    Ok(tree)
}

/// Deletes every `(codec, compression)` index file for `archive_path` at
/// both candidate locations.
pub fn clear_index_cache(archive_path: &Path) {
    for path in cache_dir::all_candidate_paths(archive_path) {
        if path.is_file() {
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("could not remove stale index {}: {}", path.display(), e);
            } else {
                log::debug!("removed stale index {}", path.display());
            }
        }
    }
}

fn try_load(archive_path: &Path, preferred: (Codec, Compression)) -> Result<Option<PathTree>, Error> {
    for path in cache_dir::ordered_candidate_paths(archive_path, preferred) {
        if !path.is_file() {
            continue;
        }
        let len = std::fs::metadata(&path)?.len();
        if len == 0 {
            log::debug!("deleting empty index {}", path.display());
            let _ = std::fs::remove_file(&path);
            continue;
        }
        let compression = index_codec::backend_from_file_name(&path.to_string_lossy())
            .map(|(_, c)| c)
            .unwrap_or(Compression::None);
        match index_codec::read_index_from_path(&path, compression) {
            Ok(tree) => {
                log::info!("loaded index from {}", path.display());
                return Ok(Some(tree));
            }
            Err(e) => {
                log::warn!("corrupt index {} ({}), deleting and rebuilding", path.display(), e);
                let _ = std::fs::remove_file(&path);
            }
        }
    }
    Ok(None)
}

fn persist(tree: &PathTree, archive_path: &Path, codec: Codec, compression: Compression) {
    let sibling = cache_dir::sibling_index_path(archive_path, codec, compression);
    match index_codec::write_index_to_path(tree, &sibling, compression) {
        Ok(()) => {
            log::info!("wrote index to {}", sibling.display());
            return;
        }
        Err(e) => log::warn!("could not write index to {}: {}, trying the cache directory", sibling.display(), e),
    }

    let cache_path = match cache_dir::cache_index_path(archive_path, codec, compression) {
        Some(p) => p,
        None => {
            log::warn!("could not resolve a cache directory either; subsequent mounts will be slow");
            return;
        }
    };
    if let Some(parent) = cache_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            log::warn!("could not create {}: {}", parent.display(), e);
            return;
        }
    }
    match index_codec::write_index_to_path(tree, &cache_path, compression) {
        Ok(()) => log::info!("wrote index to {}", cache_path.display()),
        Err(e) => log::warn!("could not write index to file, subsequent mounts will be slow: {}", e),
    }
}

/// Stamps the tree's root `.` self-entry from the mounted archive file's
/// own `stat()`, the way `TarMount.__init__` does in the original — this
/// is never persisted (see `index_codec::encode_tree`), only applied
/// in-memory after load-or-build on every mount.
pub fn stamp_root(tree: &mut PathTree, file: &File) -> Result<(), Error> {
    let metadata = file.metadata()?;
    let mode = promote_to_directory_mode(metadata.mode() as u16);
    tree.set_root_meta(FileRecord {
        offset: 0,
        size: metadata.len(),
        mtime: metadata.mtime(),
        mode,
        kind: EntryKind::Directory,
        linkname: String::new(),
        uid: metadata.uid(),
        gid: metadata.gid(),
        istar: false,
    });
    Ok(())
}

/// One read-read bit promoted to the matching execute bit, the way
/// `createIndex` promotes a nested archive's mode when mounting it as a
/// directory — a file readable by its owner should be listable too.
fn promote_to_directory_mode(mode: u16) -> u16 {
    let mut perm = mode & 0o777;
    if perm & 0o400 != 0 {
        perm |= 0o100;
    }
    if perm & 0o040 != 0 {
        perm |= 0o010;
    }
    if perm & 0o004 != 0 {
        perm |= 0o001;
    }
    perm | S_IFDIR
}

fn path_ends_with_tar(path: &Path) -> bool {
    path.to_string_lossy().ends_with(".tar")
}

fn strip_tar_suffix(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    PathBuf::from(s.strip_suffix(".tar").unwrap_or(&s).to_string())
}

/// Builds a path tree from one TAR stream starting at `base_offset` inside
/// `file`. Nested archives are scanned by cloning the file handle and
/// seeking the clone, rather than saving and restoring a shared cursor —
/// each recursive call owns an independent reader.
pub fn build_tree(file: &File, base_offset: u64, recursive: bool, verbosity: u8) -> Result<PathTree, Error> {
    let mut reader = file.try_clone()?;
    reader.seek(SeekFrom::Start(base_offset))?;
    let mut archive = tar::Archive::new(reader);

    let mut tree = PathTree::new();
    let scanner = TarScanner::new(&mut archive)?;

    for scanned in scanner {
        let scanned = scanned?;
        let path = normalize(&scanned.path);
        if path == Path::new("/") {
            continue;
        }

        let mode = (scanned.mode as u16 & 0o7777) | scanned.kind.mode_bits();
        let mut record = FileRecord {
            offset: base_offset + scanned.payload_offset,
            size: scanned.size,
            mtime: scanned.mtime,
            mode,
            kind: scanned.kind,
            linkname: scanned.linkname,
            uid: scanned.uid,
            gid: scanned.gid,
            istar: false,
        };

        if recursive && scanned.kind == EntryKind::Regular && path_ends_with_tar(&path) {
            match build_tree(file, record.offset, recursive, verbosity) {
                Ok(nested) => {
                    let extracted = strip_tar_suffix(&path);
                    let final_path = if !tree.exists(&extracted) { extracted } else { path.clone() };

                    record.mode = promote_to_directory_mode(record.mode);
                    record.kind = EntryKind::Directory;
                    record.istar = true;

                    if tree.exists(&final_path) {
                        log::warn!("{} already exists in the index and will be overwritten", final_path.display());
                    }
                    tree.set_dir(&final_path, record, nested.into_children())?;
                    if verbosity >= 2 {
                        log::debug!("mounted nested archive at {}", final_path.display());
                    }
                    continue;
                }
                Err(e) => {
                    log::debug!("{} is not a nested TAR archive ({}), keeping it as a plain file", path.display(), e);
                }
            }
        }

        if tree.exists(&path) {
            let istar_here = matches!(tree.lookup(&path, false), Some(LookupResult::File(existing)) if existing.istar);
            if istar_here {
                let relocated = format!("{}.tar", path.display());
                tree.rename(&path, Path::new(&relocated))?;
            } else {
                log::warn!("{} already exists in the index and will be overwritten", path.display());
            }
        }

        match scanned.kind {
            EntryKind::Directory => tree.set_dir(&path, record, BTreeMap::new())?,
            _ => tree.set_file(&path, record)?,
        }
    }

    Ok(tree)
}
