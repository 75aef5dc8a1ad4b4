//! Segmented memory-mapped block I/O.
//!
//! Memory-mapping a file is inherently unsafe — the OS cannot guarantee
//! that another process won't truncate or rewrite the backing file out
//! from under the mapping — so this is the one module in the crate that
//! carries `#[allow(unsafe_code)]`. Everywhere else remains subject to the
//! crate-level `#![deny(unsafe_code)]`.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Seek;

use memmap2::MmapMut;

use crate::errors::{TreeError, TreeResult};

/// Blocks per mapped segment. A whole segment is mapped (or dropped) at
/// once; a single block is never mapped on its own.
const SEGMENT_BLOCKS: u64 = 1024;

/// A file partitioned into fixed-size segments, each lazily mapped on
/// first access and held until reclaimed by [`MmapBlockStore::reclaim`].
pub struct MmapBlockStore {
    file: File,
    block_size: u32,
    segments: HashMap<u64, MmapMut>,
}

impl MmapBlockStore {
    pub fn open(path: &str, block_size: u32) -> TreeResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file,
            block_size,
            segments: HashMap::new(),
        })
    }

    fn segment_bytes(&self) -> u64 {
        SEGMENT_BLOCKS * u64::from(self.block_size)
    }

    fn segment_index(&self, block: u32) -> u64 {
        u64::from(block) / SEGMENT_BLOCKS
    }

    fn ensure_segment_len(&mut self, segment: u64) -> TreeResult<()> {
        let required = (segment + 1) * self.segment_bytes();
        let len = self.file.metadata()?.len();
        if len < required {
            self.file.set_len(required)?;
        }
        Ok(())
    }

    fn segment_mut(&mut self, segment: u64) -> TreeResult<&mut MmapMut> {
        self.ensure_segment_len(segment)?;
        if !self.segments.contains_key(&segment) {
            let offset = segment * self.segment_bytes();
            // SAFETY: the tree's exclusive lock (see `src/tree.rs`) ensures
            // no other handle in this process writes to `self.file`
            // concurrently; cross-process mutation of the backing file
            // while mapped remains the caller's responsibility, as with any
            // memory-mapped file.
            let mmap = unsafe {
                memmap2::MmapOptions::new()
                    .offset(offset)
                    .len(self.segment_bytes() as usize)
                    .map_mut(&self.file)
                    .map_err(TreeError::Io)?
            };
            self.segments.insert(segment, mmap);
        }
        Ok(self.segments.get_mut(&segment).unwrap())
    }

    pub fn read_block(&mut self, block: u32, out: &mut [u8]) -> TreeResult<()> {
        let segment = self.segment_index(block);
        let within = (u64::from(block) % SEGMENT_BLOCKS) as usize * self.block_size as usize;
        let block_size = self.block_size as usize;
        let map = self.segment_mut(segment)?;
        out[..block_size].copy_from_slice(&map[within..within + block_size]);
        Ok(())
    }

    pub fn write_block(&mut self, block: u32, data: &[u8]) -> TreeResult<()> {
        let segment = self.segment_index(block);
        let within = (u64::from(block) % SEGMENT_BLOCKS) as usize * self.block_size as usize;
        let block_size = self.block_size as usize;
        let map = self.segment_mut(segment)?;
        map[within..within + block_size].copy_from_slice(&data[..block_size]);
        Ok(())
    }

    /// Forces every mapped segment to disk in ascending index order, then
    /// fsyncs the backing file handle.
    pub fn sync(&mut self) -> TreeResult<()> {
        let mut indices: Vec<u64> = self.segments.keys().copied().collect();
        indices.sort_unstable();
        for idx in indices {
            self.segments.get(&idx).unwrap().flush()?;
        }
        self.file.sync_all()?;
        Ok(())
    }

    /// Drops every mapped segment after forcing it to disk, so the file
    /// handle can be released without relying on OS write-back ordering.
    pub fn reclaim(&mut self) -> TreeResult<()> {
        self.sync()?;
        self.segments.clear();
        Ok(())
    }

    pub fn size_in_blocks(&mut self) -> TreeResult<u32> {
        let len = self.file.metadata()?.len();
        Ok((len / u64::from(self.block_size)) as u32)
    }

    pub fn clear(&mut self) -> TreeResult<()> {
        self.segments.clear();
        self.file.set_len(0)?;
        self.file.rewind()?;
        Ok(())
    }
}
