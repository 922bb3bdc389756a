use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::Error;
use crate::path_tree::{DirNode, EntryKind, FileRecord, PathNode, PathTree};

const TAG_BEGIN_DICT: u8 = 0x01;
const TAG_END_DICT: u8 = 0x02;
const TAG_KV: u8 = 0x03;
const TAG_STRING: u8 = 0x04;
const TAG_FILE_RECORD: u8 = 0x05;

const SELF_KEY: &str = ".";

/// The one serialization backend this crate ships, replacing the source's
/// dependency on an external MessagePack library for a 9-field fixed
/// layout (see spec §4.D / SPEC_FULL.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Custom,
}

impl Codec {
    pub const ALL: &'static [Codec] = &[Codec::Custom];

    pub fn extension(self) -> &'static str {
        match self {
            Codec::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Lz4,
}

impl Compression {
    pub const ALL: &'static [Compression] = &[Compression::None, Compression::Lz4, Compression::Gzip];

    pub fn extension(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Gzip => Some("gz"),
            Compression::Lz4 => Some("lz4"),
        }
    }
}

/// Parses a `-s/--serialization-backend` value such as `custom.gz` into a
/// `(Codec, Compression)` pair, mirroring `serializationBackendFromFileName`
/// in `ratarmount.py`: unknown codec names fall back to `custom` with a
/// warning instead of aborting.
pub fn parse_backend(name: &str) -> (Codec, Compression) {
    let mut parts = name.splitn(2, '.');
    let codec_part = parts.next().unwrap_or("custom");
    let compression_part = parts.next();

    let codec = if codec_part == "custom" {
        Codec::Custom
    } else {
        log::warn!("serialization backend '{}' is not supported, defaulting to 'custom'", codec_part);
        Codec::Custom
    };
    let compression = match compression_part {
        Some("gz") => Compression::Gzip,
        Some("lz4") => Compression::Lz4,
        _ => Compression::None,
    };
    (codec, compression)
}

pub fn index_file_suffix(codec: Codec, compression: Compression) -> String {
    match compression.extension() {
        Some(ext) => format!(".index.{}.{}", codec.extension(), ext),
        None => format!(".index.{}", codec.extension()),
    }
}

/// Recovers `(Codec, Compression)` from a candidate index file name's
/// trailing dot-segments, the inverse of `index_file_suffix`.
pub fn backend_from_file_name(name: &str) -> Option<(Codec, Compression)> {
    for &compression in Compression::ALL {
        for &codec in Codec::ALL {
            if name.ends_with(&index_file_suffix(codec, compression)) {
                return Some((codec, compression));
            }
        }
    }
    None
}

fn write_tag<W: Write>(w: &mut W, tag: u8) -> Result<(), Error> {
    w.write_u8(tag).map_err(Error::from)
}

fn write_string<W: Write>(w: &mut W, s: &str) -> Result<(), Error> {
    write_tag(w, TAG_STRING)?;
    w.write_u32::<LittleEndian>(s.len() as u32)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn read_string<R: Read>(r: &mut R) -> Result<String, Error> {
    let tag = r.read_u8()?;
    if tag != TAG_STRING {
        return Err(Error::CorruptIndex(format!("expected string tag, found {:#x}", tag)));
    }
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| Error::CorruptIndex(e.to_string()))
}

fn write_file_record<W: Write>(w: &mut W, record: &FileRecord) -> Result<(), Error> {
    let mut payload = Vec::new();
    payload.write_u64::<LittleEndian>(record.offset)?;
    payload.write_u64::<LittleEndian>(record.size)?;
    payload.write_i64::<LittleEndian>(record.mtime)?;
    payload.write_u16::<LittleEndian>(record.mode)?;
    payload.write_u8(record.kind.tag_byte())?;
    payload.write_u32::<LittleEndian>(record.linkname.len() as u32)?;
    payload.write_all(record.linkname.as_bytes())?;
    payload.write_u32::<LittleEndian>(record.uid)?;
    payload.write_u32::<LittleEndian>(record.gid)?;
    payload.write_u8(if record.istar { 1 } else { 0 })?;

    write_tag(w, TAG_FILE_RECORD)?;
    w.write_u32::<LittleEndian>(payload.len() as u32)?;
    w.write_all(&payload)?;
    Ok(())
}

fn read_file_record<R: Read>(r: &mut R) -> Result<FileRecord, Error> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    let mut cur = std::io::Cursor::new(payload);

    let offset = cur.read_u64::<LittleEndian>()?;
    let size = cur.read_u64::<LittleEndian>()?;
    let mtime = cur.read_i64::<LittleEndian>()?;
    let mode = cur.read_u16::<LittleEndian>()?;
    let kind = EntryKind::from_tag_byte(cur.read_u8()?)?;
    let linkname_len = cur.read_u32::<LittleEndian>()? as usize;
    let mut linkname_bytes = vec![0u8; linkname_len];
    cur.read_exact(&mut linkname_bytes)?;
    let linkname = String::from_utf8(linkname_bytes).map_err(|e| Error::CorruptIndex(e.to_string()))?;
    let uid = cur.read_u32::<LittleEndian>()?;
    let gid = cur.read_u32::<LittleEndian>()?;
    let istar = cur.read_u8()? != 0;

    Ok(FileRecord { offset, size, mtime, mode, kind, linkname, uid, gid, istar })
}

fn write_dict<W: Write>(w: &mut W, dir: &DirNode) -> Result<(), Error> {
    write_tag(w, TAG_BEGIN_DICT)?;
    if let Some(self_meta) = &dir.self_meta {
        write_tag(w, TAG_KV)?;
        write_string(w, SELF_KEY)?;
        write_file_record(w, self_meta)?;
    }
    for (name, node) in &dir.children {
        write_tag(w, TAG_KV)?;
        write_string(w, name)?;
        match node {
            PathNode::Leaf(record) => write_file_record(w, record)?,
            PathNode::Dir(child) => write_dict(w, child)?,
        }
    }
    write_tag(w, TAG_END_DICT)?;
    Ok(())
}

fn read_dict<R: Read>(r: &mut R) -> Result<DirNode, Error> {
    let begin = r.read_u8()?;
    if begin != TAG_BEGIN_DICT {
        return Err(Error::CorruptIndex(format!("expected begin-dict tag, found {:#x}", begin)));
    }
    read_dict_body(r)
}

/// Reads the key/value entries of a dict whose begin-dict tag has already
/// been consumed by the caller (either `read_dict` at the top level, or a
/// nested-dict branch below that peeked the tag to tell a record from a
/// subdirectory).
fn read_dict_body<R: Read>(r: &mut R) -> Result<DirNode, Error> {
    let mut dir = DirNode::empty();
    loop {
        let tag = r.read_u8()?;
        match tag {
            TAG_END_DICT => break,
            TAG_KV => {
                let key = read_string(r)?;
                let value_tag = r.read_u8()?;
                match value_tag {
                    TAG_FILE_RECORD => {
                        let record = read_file_record(r)?;
                        if key == SELF_KEY {
                            dir.self_meta = Some(record);
                        } else {
                            dir.children.insert(key, PathNode::Leaf(record));
                        }
                    }
                    TAG_BEGIN_DICT => {
                        let child = read_dict_body(r)?;
                        dir.children.insert(key, PathNode::Dir(child));
                    }
                    other => return Err(Error::CorruptIndex(format!("unexpected value tag {:#x}", other))),
                }
            }
            other => return Err(Error::CorruptIndex(format!("unexpected tag {:#x} in dict", other))),
        }
    }
    Ok(dir)
}

/// The root's own self-entry is never persisted: it is re-stamped from the
/// archive file's current `stat()` on every mount (see
/// `indexed_archive::stamp_root`), so a stale one baked into an old index
/// file would just be overwritten anyway.
pub fn encode_tree<W: Write>(tree: &PathTree, w: &mut W) -> Result<(), Error> {
    let root = DirNode { self_meta: None, children: tree.root_children().clone() };
    write_dict(w, &root)
}

pub fn decode_tree<R: Read>(r: &mut R) -> Result<PathTree, Error> {
    let root = read_dict(r)?;
    Ok(PathTree::from_root(root))
}

/// Writes `tree` to `path`, wrapping the binary codec in the requested
/// compression layer (mirroring Python's `gzip`/`lz4` module selection in
/// `writeIndex`).
pub fn write_index_to_path(tree: &PathTree, path: &Path, compression: Compression) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    match compression {
        Compression::None => encode_tree(tree, &mut writer),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(writer, flate2::Compression::default());
            encode_tree(tree, &mut encoder)?;
            encoder.finish()?;
            Ok(())
        }
        Compression::Lz4 => {
            let mut encoder = lz4::EncoderBuilder::new().build(writer)?;
            encode_tree(tree, &mut encoder)?;
            let (_, result) = encoder.finish();
            result.map_err(Error::from)
        }
    }
}

/// Reads an index previously written by `write_index_to_path`.
pub fn read_index_from_path(path: &Path, compression: Compression) -> Result<PathTree, Error> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    match compression {
        Compression::None => decode_tree(&mut reader),
        Compression::Gzip => decode_tree(&mut GzDecoder::new(reader)),
        Compression::Lz4 => decode_tree(&mut lz4::Decoder::new(reader)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn sample_tree() -> PathTree {
        let mut tree = PathTree::new();
        tree.set_file(
            Path::new("/a.txt"),
            FileRecord {
                offset: 512,
                size: 11,
                mtime: 1_600_000_000,
                mode: 0o100_644,
                kind: EntryKind::Regular,
                linkname: String::new(),
                uid: 1000,
                gid: 1000,
                istar: false,
            },
        )
        .unwrap();
        tree.set_file(
            Path::new("/dir/link"),
            FileRecord {
                offset: 0,
                size: 6,
                mtime: 0,
                mode: 0o120_777,
                kind: EntryKind::Symlink,
                linkname: "target".into(),
                uid: 0,
                gid: 0,
                istar: false,
            },
        )
        .unwrap();
        tree
    }

    #[test]
    fn round_trips_through_the_binary_codec() {
        let tree = sample_tree();
        let mut buf = Vec::new();
        encode_tree(&tree, &mut buf).unwrap();

        let decoded = decode_tree(&mut &buf[..]).unwrap();
        match decoded.lookup(Path::new("/a.txt"), false).unwrap() {
            crate::path_tree::LookupResult::File(r) => {
                assert_eq!(r.offset, 512);
                assert_eq!(r.uid, 1000);
            }
            _ => panic!("expected a file"),
        }
        match decoded.lookup(Path::new("/dir/link"), false).unwrap() {
            crate::path_tree::LookupResult::File(r) => assert_eq!(r.linkname, "target"),
            _ => panic!("expected a symlink"),
        }
    }

    #[test]
    fn rejects_truncated_input() {
        let tree = sample_tree();
        let mut buf = Vec::new();
        encode_tree(&tree, &mut buf).unwrap();
        buf.truncate(buf.len() - 4);

        assert!(decode_tree(&mut &buf[..]).is_err());
    }

    #[test]
    fn backend_round_trips_through_file_names() {
        assert_eq!(parse_backend("custom.gz"), (Codec::Custom, Compression::Gzip));
        assert_eq!(parse_backend("custom"), (Codec::Custom, Compression::None));
        assert_eq!(backend_from_file_name("foo.tar.index.custom.lz4"), Some((Codec::Custom, Compression::Lz4)));
    }
}
