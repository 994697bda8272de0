//! A single resident logical block: its decoded bytes, whether it has been
//! modified since load, and the gzip codec used to (de)serialize it to its
//! physical slot.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::format::{self, Header, BLOCK_COMPRESSED, BLOCK_UNCOMPRESSED};
use crate::sparsefile::SparseFile;

/// One logical block, resident in memory.
///
/// `data` holds exactly the block's logical bytes (never padded to
/// `block_size`, except when a non-last block's compressed form dropped
/// trailing zeros — see [`Block::load`]). `dirty` tracks whether `data` has
/// changed since the last `load`/`store`, so `store` can skip rewriting a
/// slot nothing touched.
pub struct Block {
    pub num: u64,
    pub data: Vec<u8>,
    pub dirty: bool,
}

impl Block {
    /// An empty block, not yet associated with any slot.
    pub fn empty() -> Self {
        Self {
            num: 0,
            data: Vec::new(),
            dirty: false,
        }
    }

    /// `data` is all zero bytes. An all-zero block is never written to disk;
    /// its slot is hole-punched instead.
    pub fn is_all_zero(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }

    /// Load block `num` from its physical slot.
    ///
    /// `host_len` is the current host file length, used both to tell whether
    /// this slot exists at all and, for the compressed case, whether `num`
    /// is the *last* block (only the last block's decompressed payload may be
    /// short of `block_size`; any earlier block that decompresses short had
    /// its trailing zeros dropped by the compressor and must be zero-padded
    /// back out here).
    pub fn load(f: &dyn SparseFile, header: &Header, num: u64, host_len: u64) -> Result<Self> {
        let block_size = header.block_size();
        let slot_size = header.slot_size();
        let slot_start = format::slot_offset(num, block_size);

        if host_len <= slot_start {
            // Slot doesn't exist yet: a fresh, all-zero block.
            return Ok(Self {
                num,
                data: Vec::new(),
                dirty: false,
            });
        }

        let avail = (host_len - slot_start).min(slot_size);
        let mut raw = vec![0u8; avail as usize];
        f.read_exact_at(&mut raw, slot_start)?;

        let type_byte = raw[0];
        let payload = raw.split_off(1);

        let mut data = match type_byte {
            BLOCK_UNCOMPRESSED => payload,
            BLOCK_COMPRESSED => gzip_decompress(&payload)?,
            other => {
                return Err(Error::InvalidFormat(format!(
                    "block {}: unknown slot type byte {:#x}",
                    num, other
                )))
            }
        };

        let last_block_num = format::last_block_num(host_len, block_size);
        if (data.len() as u64) < block_size && last_block_num != Some(num) {
            // Not the last block: the compressor must have dropped trailing
            // zeros. Restore the full block length.
            data.resize(block_size as usize, 0);
        }

        Ok(Self {
            num,
            data,
            dirty: false,
        })
    }

    /// Write this block to its physical slot, or punch a hole if it's all
    /// zero. No-op if the block isn't dirty.
    ///
    /// `truncate`: when set, the host file is cut to exactly the end of the
    /// bytes just written for this slot, discarding anything physically
    /// beyond it (used when this store call is the tail of an explicit
    /// `CompFile::truncate`). When clear, the unused tail of the slot is
    /// punched only if this slot is presently the last one in the file —
    /// never truncating away data belonging to later blocks.
    pub fn store(&mut self, f: &dyn SparseFile, header: &Header, truncate: bool) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let block_size = header.block_size();
        let slot_start = format::slot_offset(self.num, block_size);
        let slot_size = header.slot_size();

        if self.is_all_zero() {
            let punch_end = slot_start + self.data.len() as u64 + 1;
            if f.len()? < punch_end {
                f.set_len(punch_end)?;
            }
            f.punch_hole(slot_start, punch_end - slot_start)
                .map_err(Error::PunchHoleNotSupported)?;
            if truncate {
                f.set_len(punch_end)?;
            }
            self.dirty = false;
            return Ok(());
        }

        let compressed = gzip_compress(&self.data)?;
        // n_enc: total encoded length including the leading type byte.
        let n_enc = 1 + compressed.len() as u64;

        // This follows the source's literal arithmetic rather than "fixing"
        // the apparent off-by-one: the tail region punched below is
        // `[slot_start + n_enc, slot_start + B - n_enc)`, not "rest of slot".
        // Written as `n_enc + 2*4096 < data.len()` rather than
        // `n_enc < data.len() - 2*4096` so it can't underflow when `data` is
        // shorter than 8192 bytes; both forms agree whenever the subtraction
        // wouldn't have underflowed, and this one is always unsigned-safe.
        let (type_byte, payload): (u8, &[u8]) = if n_enc + 2 * 4096 < self.data.len() as u64 {
            (BLOCK_COMPRESSED, &compressed)
        } else {
            (BLOCK_UNCOMPRESSED, &self.data)
        };

        let mut out = Vec::with_capacity(1 + payload.len());
        out.push(type_byte);
        out.extend_from_slice(payload);
        f.write_all_at(&out, slot_start)?;

        let slot_end = slot_start + out.len() as u64;
        if type_byte == BLOCK_COMPRESSED {
            let tail_end = slot_start + block_size - n_enc;
            if tail_end > slot_end {
                f.punch_hole(slot_end, tail_end - slot_end)
                    .map_err(Error::PunchHoleNotSupported)?;
            }
        }

        if truncate {
            f.set_len(slot_end)?;
        } else {
            let host_len = f.len()?;
            if slot_end < slot_start + slot_size && host_len <= slot_start + slot_size {
                // This slot is (still) the last one in the file: punch the
                // unused tail rather than leaving stale bytes resident.
                f.punch_hole(slot_end, slot_start + slot_size - slot_end)
                    .map_err(Error::PunchHoleNotSupported)?;
            }
        }

        self.dirty = false;
        Ok(())
    }
}

fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparsefile::HostFile;

    fn temp_host(name: &str) -> (std::path::PathBuf, HostFile) {
        let path = std::env::temp_dir()
            .join(format!("spgz_block_test_{}_{}", std::process::id(), name));
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        (path, HostFile::from_file(file))
    }

    #[test]
    fn store_then_load_round_trips_compressible_data() {
        let (path, host) = temp_host("compressible");
        let header = Header::new(1); // block_size = 4095
        host.set_len(format::HEADER_SIZE).unwrap();

        let mut block = Block {
            num: 0,
            data: vec![b'a'; 4095],
            dirty: true,
        };
        block.store(&host, &header, false).unwrap();

        let host_len = host.len().unwrap();
        let loaded = Block::load(&host, &header, 0, host_len).unwrap();
        assert_eq!(loaded.data, vec![b'a'; 4095]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn store_then_load_round_trips_random_data() {
        let (path, host) = temp_host("random");
        let header = Header::new(1);
        host.set_len(format::HEADER_SIZE).unwrap();

        let data: Vec<u8> = (0..4095u32).map(|i| (i % 251) as u8).collect();
        let mut block = Block {
            num: 0,
            data: data.clone(),
            dirty: true,
        };
        block.store(&host, &header, false).unwrap();

        let host_len = host.len().unwrap();
        let loaded = Block::load(&host, &header, 0, host_len).unwrap();
        assert_eq!(loaded.data, data);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn all_zero_block_is_sparsified() {
        let (path, host) = temp_host("zero");
        let header = Header::new(1);
        host.set_len(format::HEADER_SIZE).unwrap();

        let mut block = Block {
            num: 0,
            data: vec![0u8; 4095],
            dirty: true,
        };
        block.store(&host, &header, false).unwrap();

        let host_len = host.len().unwrap();
        let loaded = Block::load(&host, &header, 0, host_len).unwrap();
        assert_eq!(loaded.data.len(), 4095);
        assert!(loaded.is_all_zero());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_slot_loads_as_empty() {
        let (path, host) = temp_host("missing");
        let header = Header::new(1);
        host.set_len(format::HEADER_SIZE).unwrap();
        let loaded = Block::load(&host, &header, 0, format::HEADER_SIZE).unwrap();
        assert!(loaded.data.is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn large_compressible_block_uses_compressed_storage() {
        let (path, host) = temp_host("largecompressible");
        let header = Header::default_new(); // block_size ~1 MiB
        host.set_len(format::HEADER_SIZE).unwrap();

        let data = vec![b'z'; header.block_size() as usize];
        let mut block = Block {
            num: 0,
            data: data.clone(),
            dirty: true,
        };
        block.store(&host, &header, false).unwrap();

        // A highly compressible 1 MiB block should occupy far less than
        // a full slot on disk.
        let host_len = host.len().unwrap();
        assert!(host_len < format::HEADER_SIZE + header.slot_size() / 2);

        let loaded = Block::load(&host, &header, 0, host_len).unwrap();
        assert_eq!(loaded.data, data);
        let _ = std::fs::remove_file(&path);
    }
}
