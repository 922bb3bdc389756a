use std::io;

use failure::Fail;

/// All error kinds surfaced by the indexed archive core, the index codec and
/// the filesystem adapter. See section 7 of the design spec for the
/// propagation policy of each variant.
#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "malformed archive: {}", _0)]
    MalformedArchive(String),

    #[fail(display = "corrupt index: {}", _0)]
    CorruptIndex(String),

    #[fail(display = "path conflict at {}: {}", path, reason)]
    PathConflict { path: String, reason: String },

    #[fail(display = "I/O error: {}", _0)]
    Io(#[fail(cause)] io::Error),

    #[fail(display = "path not found: {}", _0)]
    NotFound(String),

    #[fail(display = "invalid seek to negative offset {}", _0)]
    InvalidSeek(i64),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}
