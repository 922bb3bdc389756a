use std::io::Read;
use std::path::PathBuf;

use crate::error::Error;
use crate::path_tree::EntryKind;

/// One scanned TAR member, already stripped of `tar`-crate lifetimes so it
/// can be handed to `IndexedArchive::build_tree` and, recursively, to a
/// nested scan over the same member's payload.
pub struct ScannedEntry {
    pub path: PathBuf,
    pub payload_offset: u64,
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
    pub linkname: String,
    pub uid: u32,
    pub gid: u32,
    pub kind: EntryKind,
}

/// Lazily yields `ScannedEntry` values in archive order. Built over
/// `tar::Archive::entries()`, so it reads sequentially and never seeks
/// backward, matching the "tolerates archives larger than memory" property.
pub struct TarScanner<'a, R: Read> {
    entries: tar::Entries<'a, R>,
}

impl<'a, R: Read> TarScanner<'a, R> {
    pub fn new(archive: &'a mut tar::Archive<R>) -> Result<TarScanner<'a, R>, Error> {
        let entries = archive
            .entries()
            .map_err(|e| Error::MalformedArchive(e.to_string()))?;
        Ok(TarScanner { entries })
    }
}

impl<'a, R: Read> Iterator for TarScanner<'a, R> {
    type Item = Result<ScannedEntry, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry_result = self.entries.next()?;
        Some(scan_one(entry_result))
    }
}

fn scan_one<R: Read>(entry_result: std::io::Result<tar::Entry<'_, R>>) -> Result<ScannedEntry, Error> {
    let mut entry = entry_result.map_err(|e| Error::MalformedArchive(e.to_string()))?;

    let path = entry
        .path()
        .map_err(|e| Error::MalformedArchive(e.to_string()))?
        .into_owned();
    let linkname = entry
        .link_name()
        .map_err(|e| Error::MalformedArchive(e.to_string()))?
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();

    let pax_mtime = pax_mtime_seconds(&mut entry);
    let header = entry.header();
    let kind = EntryKind::from_tar(header.entry_type());
    let mtime = pax_mtime.unwrap_or_else(|| header.mtime().unwrap_or(0) as i64);
    let mut size = header.size().unwrap_or(0);
    if kind == EntryKind::Symlink {
        // Mirrors the teacher's tarindexer.rs: a symlink's reported size is
        // the length of its target string, not the (usually zero) TAR size
        // field, so `stat()` on the link itself is meaningful.
        size = linkname.len() as u64;
    }

    Ok(ScannedEntry {
        path,
        payload_offset: entry.raw_file_position(),
        size,
        mode: header.mode().unwrap_or(0),
        mtime,
        linkname,
        uid: header.uid().unwrap_or(0) as u32,
        gid: header.gid().unwrap_or(0) as u32,
        kind,
    })
}

/// Honors PAX extended `mtime` attributes the way `tarindexer.rs`'s
/// `get_timespec_for`/`parse_timespec_from_pax_extension` do: the
/// fractional part (if any) is truncated, since `FileRecord::mtime` only
/// carries whole seconds.
fn pax_mtime_seconds<R: Read>(entry: &mut tar::Entry<'_, R>) -> Option<i64> {
    let extensions = entry.pax_extensions().ok().flatten()?;
    for extension in extensions {
        let extension = extension.ok()?;
        if extension.key().ok()? != "mtime" {
            continue;
        }
        let value = extension.value().ok()?;
        let seconds_part = value.split('.').next().unwrap_or(value);
        if let Ok(seconds) = seconds_part.parse::<i64>() {
            return Some(seconds);
        }
    }
    None
}
