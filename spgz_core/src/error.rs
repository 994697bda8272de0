//! Typed errors for the compressed sparse block store.
//!
//! Three failure kinds are named by the format itself (`InvalidFormat`,
//! `IsDirectory`, `PunchHoleNotSupported`) and must be distinguishable by
//! callers without parsing message text; everything else collapses into the
//! opaque `Io` variant.

use std::io;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Header missing, short, or magic mismatch on an otherwise readable file.
    #[error("invalid SPGZ format: {0}")]
    InvalidFormat(String),

    /// The open target names a directory, not a regular file or device.
    #[error("refusing to open a directory as a compressed file")]
    IsDirectory,

    /// The host filesystem rejected a hole-punch request (e.g. not an
    /// extent-based filesystem, or the kernel lacks `FALLOC_FL_PUNCH_HOLE`
    /// support for this file's backing store).
    #[error("host filesystem does not support punching holes: {0}")]
    PunchHoleNotSupported(#[source] io::Error),

    /// Any other underlying read/write/seek/truncate/sync failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}
