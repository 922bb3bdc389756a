use std::path::{Path, PathBuf};

use crate::index_codec::{index_file_suffix, Codec, Compression};

/// `<archive>.index.<codec>[.<compression>]`, sitting right next to the
/// archive itself.
pub fn sibling_index_path(archive_path: &Path, codec: Codec, compression: Compression) -> PathBuf {
    let mut path = archive_path.as_os_str().to_os_string();
    path.push(index_file_suffix(codec, compression));
    PathBuf::from(path)
}

/// `~/.ratarmount/<archive-path-with-slashes-as-underscores>.index.<codec>[.<compression>]`.
/// Returns `None` if the home directory cannot be resolved (headless
/// environments, missing `HOME`), in which case only the sibling path is
/// tried.
pub fn cache_index_path(archive_path: &Path, codec: Codec, compression: Compression) -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    let canonical = archive_path.canonicalize().unwrap_or_else(|_| archive_path.to_path_buf());
    let escaped = canonical.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "_");
    let mut path = home.join(".ratarmount").join(escaped).into_os_string();
    path.push(index_file_suffix(codec, compression));
    Some(PathBuf::from(path))
}

/// Every `(codec, compression)` combination's candidate paths, used by
/// `--recreate-index` to wipe a stale index regardless of which backend
/// produced it.
pub fn all_candidate_paths(archive_path: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for &codec in Codec::ALL {
        for &compression in Compression::ALL {
            out.push(sibling_index_path(archive_path, codec, compression));
            if let Some(p) = cache_index_path(archive_path, codec, compression) {
                out.push(p);
            }
        }
    }
    out
}

/// Candidate paths in load order for a preferred `(codec, compression)`:
/// the preferred backend is tried at both locations first, then every
/// other combination, mirroring `ratarmount.py`'s `possibleIndexFilePaths`
/// used together with `availableSerializationBackends`.
pub fn ordered_candidate_paths(archive_path: &Path, preferred: (Codec, Compression)) -> Vec<PathBuf> {
    let mut out = Vec::new();
    out.push(sibling_index_path(archive_path, preferred.0, preferred.1));
    if let Some(p) = cache_index_path(archive_path, preferred.0, preferred.1) {
        out.push(p);
    }
    for &codec in Codec::ALL {
        for &compression in Compression::ALL {
            if (codec, compression) == preferred {
                continue;
            }
            out.push(sibling_index_path(archive_path, codec, compression));
            if let Some(p) = cache_index_path(archive_path, codec, compression) {
                out.push(p);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sibling_path_appends_the_expected_suffix() {
        let p = sibling_index_path(Path::new("/data/archive.tar"), Codec::Custom, Compression::Gzip);
        assert_eq!(p, PathBuf::from("/data/archive.tar.index.custom.gz"));
    }

    #[test]
    fn ordered_candidates_put_the_preferred_backend_first() {
        let candidates = ordered_candidate_paths(Path::new("/data/archive.tar"), (Codec::Custom, Compression::None));
        assert_eq!(candidates[0], PathBuf::from("/data/archive.tar.index.custom"));
    }
}
