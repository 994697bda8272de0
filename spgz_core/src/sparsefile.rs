//! The storage abstraction the compressed block store is layered over, plus
//! a `HostFile` adapter implementing it over a real `std::fs::File` using
//! positional I/O (`pread`/`pwrite` via `FileExt`) and Linux `fallocate(2)`
//! hole punching.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;

use nix::fcntl::{fallocate, FallocateFlags};

/// Positional, hole-punchable storage for the compressed block store.
///
/// Every method is `&self`: callers address the file purely by byte offset,
/// so there is no shared cursor to race over within a process. Object-safe
/// so `CompFile` can hold one as `Box<dyn SparseFile>`.
pub trait SparseFile {
    /// Read up to `buf.len()` bytes starting at `offset`. Like `pread`: may
    /// return fewer bytes than requested even before EOF; `0` means EOF.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Write `buf` starting at `offset`. Like `pwrite`: may write fewer bytes
    /// than given in one call.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// Current length of the host file in bytes.
    fn len(&self) -> io::Result<u64>;

    /// Resize the host file, extending with a hole or truncating.
    fn set_len(&self, len: u64) -> io::Result<()>;

    /// Deallocate storage for `[offset, offset+length)`; subsequent reads in
    /// that range return zeros. Fails (surfaced by the caller as
    /// `Error::PunchHoleNotSupported`) if the filesystem can't do this.
    fn punch_hole(&self, offset: u64, length: u64) -> io::Result<()>;

    /// Flush any buffered writes and metadata to stable storage.
    fn sync(&self) -> io::Result<()>;

    /// Release the underlying resource. Default: just `sync`; actual fd
    /// closure happens on `Drop`.
    fn close(&mut self) -> io::Result<()> {
        self.sync()
    }

    /// Read repeatedly until `buf` is full or EOF. Returns the number of
    /// bytes actually read; less than `buf.len()` only at true EOF.
    fn read_at_upto(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut read = 0;
        while read < buf.len() {
            let n = self.read_at(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }

    /// Read exactly `buf.len()` bytes, failing with `UnexpectedEof` short of that.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let n = self.read_at_upto(buf, offset)?;
        if n < buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read_exact_at: unexpected end of file",
            ));
        }
        Ok(())
    }

    /// Write all of `buf`, looping over short writes.
    fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.write_at(buf, offset)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write_all_at: wrote zero bytes",
                ));
            }
            buf = &buf[n..];
            offset += n as u64;
        }
        Ok(())
    }
}

/// `SparseFile` over a real `std::fs::File`, the normal case — a path on an
/// extent-based filesystem, or a raw block device opened by path.
pub struct HostFile {
    file: File,
}

impl HostFile {
    pub fn from_file(file: File) -> Self {
        Self { file }
    }

    pub fn into_file(self) -> File {
        self.file
    }
}

impl SparseFile for HostFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file.read_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.file.write_at(buf, offset)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn punch_hole(&self, offset: u64, length: u64) -> io::Result<()> {
        if length == 0 {
            return Ok(());
        }
        let flags = FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE;
        fallocate(self.file.as_raw_fd(), flags, offset as i64, length as i64)
            .map_err(|err| io::Error::from_raw_os_error(err as i32))
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("spgz_sparsefile_test_{}_{}", std::process::id(), name))
    }

    #[test]
    fn read_write_at_round_trip() {
        let path = temp_path("rw");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        let host = HostFile::from_file(file);
        host.write_all_at(b"hello world", 10).unwrap();
        let mut buf = [0u8; 5];
        let n = host.read_at(&mut buf, 10).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn punch_hole_zeroes_region() {
        let path = temp_path("punch");
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.write_all(&vec![0xAAu8; 8192]).unwrap();
        drop(file);

        let file = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let host = HostFile::from_file(file);
        if host.punch_hole(0, 4096).is_ok() {
            let mut buf = [0xFFu8; 4096];
            host.read_at(&mut buf, 0).unwrap();
            assert!(buf.iter().all(|&b| b == 0));
        }
        let _ = std::fs::remove_file(&path);
    }
}
