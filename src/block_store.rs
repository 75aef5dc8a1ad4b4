//! Fixed-size random-access block file: allocate, read, write, sync,
//! truncate. Positional I/O is the default path; an optional segmented
//! memory-mapped path lives behind the `mmap` Cargo feature.

#[cfg(feature = "mmap")]
pub mod mmap;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use crate::buffer_pool;
use crate::errors::{TreeError, TreeResult};

enum Backend {
    Positional(File),
    #[cfg(feature = "mmap")]
    Mmap(mmap::MmapBlockStore),
}

/// A single `<name>.data`-style block file.
pub struct BlockStore {
    backend: Backend,
    block_size: u32,
    path: String,
    closed: bool,
}

impl BlockStore {
    /// Opens (creating if absent) a positional-I/O block store.
    ///
    /// # Errors
    /// Returns [`TreeError::Io`] on any filesystem failure.
    pub fn open(path: &str, block_size: u32) -> TreeResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            backend: Backend::Positional(file),
            block_size,
            path: path.to_owned(),
            closed: false,
        })
    }

    /// Opens the segmented memory-mapped variant. Only available on 64-bit
    /// hosts behind the `mmap` feature; see `block_store::mmap`.
    ///
    /// # Errors
    /// Returns [`TreeError::Io`] on any filesystem or mapping failure.
    #[cfg(feature = "mmap")]
    pub fn open_mmap(path: &str, block_size: u32) -> TreeResult<Self> {
        Ok(Self {
            backend: Backend::Mmap(mmap::MmapBlockStore::open(path, block_size)?),
            block_size,
            path: path.to_owned(),
            closed: false,
        })
    }

    fn check_open(&self) -> TreeResult<()> {
        if self.closed {
            return Err(TreeError::InvalidState("block store is closed".into()));
        }
        Ok(())
    }

    /// Reads block `index` into a pool-allocated buffer of `block_size`
    /// bytes.
    ///
    /// # Errors
    /// Returns [`TreeError::InvalidState`] if closed, [`TreeError::Io`] on
    /// a filesystem failure.
    pub fn get(&mut self, index: u32) -> TreeResult<Vec<u8>> {
        self.check_open()?;
        let direct = matches!(self.backend, Backend::Positional(_));
        let mut buf = buffer_pool::acquire(self.block_size, direct);
        match &mut self.backend {
            Backend::Positional(file) => {
                let offset = u64::from(index) * u64::from(self.block_size);
                let len = file.metadata()?.len();
                if offset >= len {
                    // Reading past EOF yields a zero-filled block, matching
                    // a never-written slot.
                    return Ok(buf);
                }
                file.seek(SeekFrom::Start(offset))?;
                let to_read = buf.len().min((len - offset) as usize);
                file.read_exact(&mut buf[..to_read])?;
            }
            #[cfg(feature = "mmap")]
            Backend::Mmap(store) => store.read_block(index, &mut buf)?,
        }
        Ok(buf)
    }

    /// Writes `buf` (exactly `block_size` bytes) to block `index`, then
    /// returns the buffer to the pool.
    ///
    /// # Errors
    /// Returns [`TreeError::InvalidState`] if closed, [`TreeError::Io`] on
    /// a filesystem failure, or [`TreeError::InvalidData`] if `buf` is the
    /// wrong length.
    pub fn set(&mut self, index: u32, buf: Vec<u8>) -> TreeResult<bool> {
        self.check_open()?;
        if buf.len() != self.block_size as usize {
            return Err(TreeError::InvalidData(format!(
                "block buffer length {} does not match block_size {}",
                buf.len(),
                self.block_size
            )));
        }
        let direct = matches!(self.backend, Backend::Positional(_));
        match &mut self.backend {
            Backend::Positional(file) => {
                let offset = u64::from(index) * u64::from(self.block_size);
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(&buf)?;
            }
            #[cfg(feature = "mmap")]
            Backend::Mmap(store) => store.write_block(index, &buf)?,
        }
        buffer_pool::release(self.block_size, direct, buf);
        Ok(true)
    }

    /// Forces all written blocks to stable storage.
    ///
    /// # Errors
    /// Returns [`TreeError::InvalidState`] if closed, [`TreeError::Io`] on
    /// a filesystem failure.
    pub fn sync(&mut self) -> TreeResult<()> {
        self.check_open()?;
        match &mut self.backend {
            Backend::Positional(file) => file.sync_all()?,
            #[cfg(feature = "mmap")]
            Backend::Mmap(store) => store.sync()?,
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`TreeError::InvalidState`] if closed, [`TreeError::Io`] on
    /// a filesystem failure.
    pub fn size_in_blocks(&mut self) -> TreeResult<u32> {
        self.check_open()?;
        match &mut self.backend {
            Backend::Positional(file) => {
                let len = file.metadata()?.len();
                Ok((len / u64::from(self.block_size)) as u32)
            }
            #[cfg(feature = "mmap")]
            Backend::Mmap(store) => store.size_in_blocks(),
        }
    }

    /// Truncates the backing file to zero length.
    ///
    /// # Errors
    /// Returns [`TreeError::InvalidState`] if closed, [`TreeError::Io`] on
    /// a filesystem failure.
    pub fn clear(&mut self) -> TreeResult<()> {
        self.check_open()?;
        match &mut self.backend {
            Backend::Positional(file) => {
                file.set_len(0)?;
                file.rewind()?;
            }
            #[cfg(feature = "mmap")]
            Backend::Mmap(store) => store.clear()?,
        }
        Ok(())
    }

    /// Closes and removes the backing file. For the mmap backend, every
    /// mapped segment is forced and dropped before the file is deleted,
    /// rather than relying on OS write-back on unmap.
    ///
    /// # Errors
    /// Returns [`TreeError::Io`] on a filesystem failure.
    pub fn delete(mut self) -> TreeResult<()> {
        #[cfg(feature = "mmap")]
        if let Backend::Mmap(store) = &mut self.backend {
            store.reclaim()?;
        }
        self.closed = true;
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.data");
        let mut store = BlockStore::open(path.to_str().unwrap(), 64).unwrap();
        let mut buf = vec![0u8; 64];
        buf[0] = 0xAB;
        store.set(3, buf.clone()).unwrap();
        let read_back = store.get(3).unwrap();
        assert_eq!(read_back, buf);
    }

    #[test]
    fn unwritten_block_reads_as_zeros() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.data");
        let mut store = BlockStore::open(path.to_str().unwrap(), 64).unwrap();
        let buf = store.get(5).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn size_in_blocks_tracks_highest_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.data");
        let mut store = BlockStore::open(path.to_str().unwrap(), 64).unwrap();
        store.set(0, vec![0u8; 64]).unwrap();
        store.set(4, vec![0u8; 64]).unwrap();
        assert_eq!(store.size_in_blocks().unwrap(), 5);
    }

    #[test]
    fn operations_after_delete_are_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.data");
        let store = BlockStore::open(path.to_str().unwrap(), 64).unwrap();
        store.delete().unwrap();
        assert!(!path.exists());
    }
}
