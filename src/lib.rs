pub mod cache_dir;
pub mod error;
pub mod fs;
pub mod index_codec;
pub mod indexed_archive;
pub mod joined_file;
pub mod path_tree;
pub mod scanner;

use std::fs::File;
use std::path::Path;

pub use error::Error;
pub use index_codec::{Codec, Compression};
pub use indexed_archive::Options as MountOptions;

/// Builds (or loads) the index for `archive_path` and mounts it read-only
/// at `mountpoint`. Blocks until the filesystem is unmounted, matching
/// `fuse::mount`'s own behavior.
pub fn setup_tar_mount(archive_path: &Path, mountpoint: &Path, opts: MountOptions) -> Result<(), Error> {
    let (tree, file) = index_tar_archive(archive_path, opts)?;
    let adapter = fs::TarFs::new(tree, file);
    fuse::mount(adapter, &mountpoint, &[]).map_err(Error::from)
}

/// The mount-free half of `setup_tar_mount`: opens the archive, runs the
/// load-or-build-then-persist cycle and stamps the root's own metadata,
/// without touching FUSE. Exposed so the index can be inspected or tested
/// without a real kernel mount.
pub fn index_tar_archive(archive_path: &Path, opts: MountOptions) -> Result<(path_tree::PathTree, File), Error> {
    let file = File::open(archive_path)?;
    let mut tree = indexed_archive::index_archive(archive_path, &file, &opts)?;
    indexed_archive::stamp_root(&mut tree, &file)?;
    Ok((tree, file))
}

/// The mount-free half of `setup_joined_mount`: opens and validates every
/// part and builds the single-file tree, without touching FUSE or the
/// mountpoint directory.
pub fn prepare_joined_mount(parts: Vec<std::path::PathBuf>) -> Result<(path_tree::PathTree, joined_file::JoinedFile), Error> {
    let stat_source = std::fs::metadata(&parts[0])?;
    let joined = joined_file::JoinedFile::new(parts)?;
    let tree = fs::single_file_tree("joined", joined.len(), &stat_source);
    Ok((tree, joined))
}

/// Mounts the concatenation of `parts` as a single file named `joined` at
/// `mountpoint`, mirroring `JoinedFileMount.py`'s `FuseFileObjectMount`.
pub fn setup_joined_mount(parts: Vec<std::path::PathBuf>, mountpoint: &Path) -> Result<(), Error> {
    let (tree, joined) = prepare_joined_mount(parts)?;
    let adapter = fs::TarFs::new(tree, joined);
    fuse::mount(adapter, &mountpoint, &[]).map_err(Error::from)
}
