//! Compressed sparse block store: a random-access file format that keeps
//! each fixed-size logical block independently gzip-compressed in a
//! fixed-size physical slot, so a host filesystem can hole-punch slots that
//! decode to all zeros.

pub mod block;
pub mod compfile;
pub mod error;
pub mod format;
pub mod sparsefile;

pub use block::Block;
pub use compfile::{CompFile, OpenMode};
pub use error::{Error, Result};
pub use format::{Header, B_DEFAULT, HEADER_SIZE, MAGIC, U_DEFAULT};
pub use sparsefile::{HostFile, SparseFile};
