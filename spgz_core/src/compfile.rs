//! `CompFile`: a random-access, seekable, readable and writable handle onto
//! an SPGZ-formatted host file, backed by a cache of exactly one resident
//! logical block.

use std::io;

use crate::block::Block;
use crate::error::{Error, Result};
use crate::format::{self, Header};
use crate::sparsefile::{HostFile, SparseFile};

/// The subset of open intent `CompFile` needs, since `std::fs::OpenOptions`
/// exposes no getters to recover it from an already-built `File`.
#[derive(Debug, Clone, Copy)]
pub struct OpenMode {
    write: bool,
    create: bool,
    create_new: bool,
}

impl OpenMode {
    pub fn read_only() -> Self {
        Self {
            write: false,
            create: false,
            create_new: false,
        }
    }

    pub fn read_write() -> Self {
        Self {
            write: true,
            create: false,
            create_new: false,
        }
    }

    /// Read-write, creating the file if it doesn't exist.
    pub fn create() -> Self {
        Self {
            write: true,
            create: true,
            create_new: false,
        }
    }

    /// Read-write, failing if the file already exists.
    pub fn create_new() -> Self {
        Self {
            write: true,
            create: false,
            create_new: true,
        }
    }

    fn to_std_options(self) -> std::fs::OpenOptions {
        let mut opts = std::fs::OpenOptions::new();
        opts.read(true).write(self.write);
        if self.create_new {
            opts.create_new(true);
        } else if self.create {
            opts.create(true);
        }
        opts
    }
}

/// A compressed sparse block store opened for random access.
///
/// Holds at most one decoded block in memory at a time (`block`); switching
/// to a different block always flushes the currently resident one first if
/// it's dirty, so the cache never silently drops a write.
pub struct CompFile {
    f: Box<dyn SparseFile>,
    header: Header,
    block: Block,
    loaded: bool,
    offset: u64,
    writable: bool,
}

impl CompFile {
    /// Open `path`, creating a fresh SPGZ file with a default block size if
    /// `mode` permits creation and no file exists yet.
    pub fn open(path: impl AsRef<std::path::Path>, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref();
        if path.is_dir() {
            return Err(Error::IsDirectory);
        }
        let file = mode.to_std_options().open(path)?;
        Self::from_sparse_file(Box::new(HostFile::from_file(file)), mode.write, Header::default_new())
    }

    /// Like [`CompFile::open`], but if this call creates the file, its
    /// header is written with `block_size_units` (`U` in the format) instead
    /// of the default. Ignored when opening an existing file — its own
    /// header prefix always wins.
    pub fn open_with_block_size(
        path: impl AsRef<std::path::Path>,
        mode: OpenMode,
        block_size_units: u32,
    ) -> Result<Self> {
        let path = path.as_ref();
        if path.is_dir() {
            return Err(Error::IsDirectory);
        }
        let file = mode.to_std_options().open(path)?;
        Self::from_sparse_file(
            Box::new(HostFile::from_file(file)),
            mode.write,
            Header::new(block_size_units),
        )
    }

    /// Build a `CompFile` over an already-open `std::fs::File`.
    pub fn from_file(file: std::fs::File, writable: bool) -> Result<Self> {
        if file.metadata()?.is_dir() {
            return Err(Error::IsDirectory);
        }
        Self::from_sparse_file(Box::new(HostFile::from_file(file)), writable, Header::default_new())
    }

    /// Build a `CompFile` over an arbitrary [`SparseFile`] — the seam used
    /// for testing and for non-regular-file backing stores (raw block
    /// devices opened by the caller, etc). `header_for_creation` is only
    /// used when the backing store is empty and `writable` is true.
    pub fn from_sparse_file(
        f: Box<dyn SparseFile>,
        writable: bool,
        header_for_creation: Header,
    ) -> Result<Self> {
        let len = f.len()?;
        let header = if len == 0 {
            if !writable {
                // An empty, read-only-opened file: the header read hits EOF
                // immediately and the mode doesn't permit writing one, so
                // this is the plain EOF condition, not a format error.
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "empty file and not opened for writing: no header to read",
                )));
            }
            f.write_all_at(&header_for_creation.to_prefix_bytes(), 0)?;
            f.set_len(format::HEADER_SIZE)?;
            header_for_creation
        } else if len < format::HEADER_PREFIX_LEN as u64 {
            return Err(Error::InvalidFormat(format!(
                "file is {} bytes, shorter than the {}-byte magic+size prefix",
                len,
                format::HEADER_PREFIX_LEN
            )));
        } else {
            let mut prefix = [0u8; format::HEADER_PREFIX_LEN];
            f.read_exact_at(&mut prefix, 0)?;
            Header::from_prefix_bytes(&prefix)?
        };

        Ok(Self {
            f,
            header,
            block: Block::empty(),
            loaded: false,
            offset: 0,
            writable,
        })
    }

    /// The logical block size in effect for this file.
    pub fn block_size(&self) -> u64 {
        self.header.block_size()
    }

    /// Byte-exact logical size: `last_block_num * block_size + (decoded
    /// length of the last block)`. There is no stored size field, so this
    /// requires loading the last block when it isn't already resident — done
    /// into a throwaway `Block` rather than `ensure_block`, so calling
    /// `size()` never evicts whatever block is presently cached.
    pub fn size(&mut self) -> Result<u64> {
        let host_len = self.f.len()?;
        let block_size = self.header.block_size();
        match format::last_block_num(host_len, block_size) {
            None => Ok(0),
            Some(last) => {
                let last_len = if self.loaded && self.block.num == last {
                    self.block.data.len() as u64
                } else {
                    Block::load(self.f.as_ref(), &self.header, last, host_len)?.data.len() as u64
                };
                Ok(last * block_size + last_len)
            }
        }
    }

    /// Make block `num` the resident one, flushing whatever was resident
    /// before if it's dirty.
    fn ensure_block(&mut self, num: u64) -> Result<()> {
        if self.loaded && self.block.num == num {
            return Ok(());
        }
        if self.loaded && self.block.dirty {
            self.block.store(self.f.as_ref(), &self.header, false)?;
        }
        let host_len = self.f.len()?;
        self.block = Block::load(self.f.as_ref(), &self.header, num, host_len)?;
        self.loaded = true;
        Ok(())
    }

    /// Read into `buf` from the current offset, advancing it. Like ordinary
    /// `Read::read`, this only ever touches the single resident block and so
    /// may return fewer bytes than `buf.len()` well short of EOF.
    ///
    /// Only loads the block `offset` falls in — never recomputes the overall
    /// file size — so repeated reads of a non-last block in a multi-block
    /// file never pay for decompressing an unrelated last block. EOF is
    /// indistinguishable from "intra-block offset at or past this block's
    /// data": both fall out of `avail` being `0` (see §4.4).
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let block_size = self.header.block_size();
        let num = self.offset / block_size;
        let in_block = (self.offset % block_size) as usize;
        self.ensure_block(num)?;

        let avail = self.block.data.len().saturating_sub(in_block);
        let n = avail.min(buf.len());
        buf[..n].copy_from_slice(&self.block.data[in_block..in_block + n]);
        self.offset += n as u64;
        Ok(n)
    }

    /// Write from `buf` at the current offset, advancing it. Only ever
    /// touches the single resident block, so a write spanning a block
    /// boundary is clipped to the bytes that fit in the current block —
    /// callers that want to write across multiple blocks in one call should
    /// use [`CompFile::copy_in`].
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "file not opened for writing",
            )));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let block_size = self.header.block_size();
        let num = self.offset / block_size;
        let in_block = (self.offset % block_size) as usize;
        self.ensure_block(num)?;

        let room = (block_size as usize) - in_block;
        let n = room.min(buf.len());
        if self.block.data.len() < in_block + n {
            self.block.data.resize(in_block + n, 0);
        }
        self.block.data[in_block..in_block + n].copy_from_slice(&buf[..n]);
        self.block.dirty = true;
        self.offset += n as u64;
        Ok(n)
    }

    /// Read repeatedly, looping across block boundaries, until `buf` is full
    /// or EOF. Returns the number of bytes actually read.
    pub fn copy_out(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Write repeatedly, looping across block boundaries, until all of `buf`
    /// has been written.
    pub fn copy_in(&mut self, buf: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.write(&buf[written..])?;
            if n == 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "copy_in: wrote zero bytes",
                )));
            }
            written += n;
        }
        Ok(())
    }

    /// Reposition the logical cursor, `io::Seek`-style.
    pub fn seek(&mut self, pos: io::SeekFrom) -> Result<u64> {
        let new_offset = match pos {
            io::SeekFrom::Start(o) => o as i128,
            io::SeekFrom::End(rel) => self.size()? as i128 + rel as i128,
            io::SeekFrom::Current(rel) => self.offset as i128 + rel as i128,
        };
        if new_offset < 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative offset",
            )));
        }
        self.offset = new_offset as u64;
        Ok(self.offset)
    }

    /// Resize the logical file to exactly `size` bytes, zero-extending or
    /// truncating as needed. Shrinking into the middle of a block resizes
    /// that block's decoded data and truncates the host file immediately
    /// past it, discarding any later blocks entirely.
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        if !self.writable {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "file not opened for writing",
            )));
        }
        let block_size = self.header.block_size();

        if size == 0 {
            self.f.set_len(format::HEADER_SIZE)?;
            self.block = Block::empty();
            self.loaded = false;
            return Ok(());
        }

        // Literal `k = size / B`, `r = size - k*B` per the format's own
        // truncate arithmetic: at an exact multiple of `B` this lands on the
        // next, empty block as the new last block (store's all-zero path
        // then hole-punches it down to a single-byte slot) rather than
        // keeping the prior block as last.
        let last_num = size / block_size;
        let in_block_len = (size - last_num * block_size) as usize;

        self.ensure_block(last_num)?;
        self.block.data.resize(in_block_len, 0);
        self.block.dirty = true;
        self.block.store(self.f.as_ref(), &self.header, true)?;

        if self.offset > size {
            self.offset = size;
        }
        Ok(())
    }

    /// Flush the resident block (if dirty) and fsync the host file.
    pub fn sync(&mut self) -> Result<()> {
        if self.loaded && self.block.dirty {
            self.block.store(self.f.as_ref(), &self.header, false)?;
        }
        self.f.sync()?;
        Ok(())
    }

    /// Flush and release the underlying host file.
    pub fn close(&mut self) -> Result<()> {
        if self.loaded && self.block.dirty {
            self.block.store(self.f.as_ref(), &self.header, false)?;
        }
        self.f.close()?;
        Ok(())
    }
}

impl io::Read for CompFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        CompFile::read(self, buf).map_err(io::Error::from)
    }
}

impl io::Write for CompFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        CompFile::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        CompFile::sync(self).map_err(io::Error::from)
    }
}

impl io::Seek for CompFile {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        CompFile::seek(self, pos).map_err(io::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{SeekFrom, Write as _};

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("spgz_compfile_test_{}_{}", std::process::id(), name))
    }

    #[test]
    fn hello_world_round_trips() {
        let path = temp_path("hello");
        {
            let mut cf = CompFile::open(&path, OpenMode::create()).unwrap();
            cf.copy_in(b"hello world").unwrap();
            cf.close().unwrap();
        }
        {
            let mut cf = CompFile::open(&path, OpenMode::read_only()).unwrap();
            let mut buf = Vec::new();
            std::io::Read::read_to_end(&mut cf, &mut buf).unwrap();
            assert_eq!(buf, b"hello world");
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn multi_block_roundtrip_with_zero_middle() {
        let path = temp_path("multiblock");
        let mut cf = CompFile::open(&path, OpenMode::create()).unwrap();
        let block_size = cf.block_size() as usize;

        let mut data = Vec::new();
        data.extend(std::iter::repeat(b'x').take(block_size));
        data.extend(std::iter::repeat(0u8).take(block_size));
        data.extend(std::iter::repeat(b'y').take(block_size / 2));

        cf.copy_in(&data).unwrap();
        cf.seek(SeekFrom::Start(0)).unwrap();
        let mut readback = vec![0u8; data.len()];
        let n = cf.copy_out(&mut readback).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(readback, data);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn truncate_shrinks_and_zero_extends() {
        let path = temp_path("truncate");
        let mut cf = CompFile::open(&path, OpenMode::create()).unwrap();
        cf.copy_in(&vec![b'z'; 5000]).unwrap();
        cf.truncate(100).unwrap();
        assert_eq!(cf.size().unwrap(), 100);

        cf.truncate(500).unwrap();
        assert_eq!(cf.size().unwrap(), 500);
        cf.seek(SeekFrom::Start(100)).unwrap();
        let mut tail = vec![0xFFu8; 400];
        cf.copy_out(&mut tail).unwrap();
        assert!(tail.iter().all(|&b| b == 0));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let path = temp_path("badmagic");
        {
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(&vec![0u8; format::HEADER_SIZE as usize]).unwrap();
        }
        let err = CompFile::open(&path, OpenMode::read_write()).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat(_)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn opening_a_directory_is_rejected() {
        let dir = std::env::temp_dir().join(format!("spgz_compfile_test_dir_{}", std::process::id()));
        let _ = std::fs::create_dir(&dir);
        let err = CompFile::open(&dir, OpenMode::read_write()).unwrap_err();
        assert!(matches!(err, Error::IsDirectory));
        let _ = std::fs::remove_dir(&dir);
    }

    #[test]
    fn read_write_traits_work_through_std_io() {
        let path = temp_path("stdio");
        let mut cf = CompFile::open(&path, OpenMode::create()).unwrap();
        std::io::Write::write_all(&mut cf, b"abc123").unwrap();
        std::io::Seek::seek(&mut cf, SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 6];
        std::io::Read::read_exact(&mut cf, &mut buf).unwrap();
        assert_eq!(&buf, b"abc123");
        let _ = std::fs::remove_file(&path);
    }
}
