//! Dense free-block bitset, persisted as a sidecar file on clean shutdown.

use crate::errors::{TreeError, TreeResult};

const BITS_PER_WORD: u32 = 64;

/// Bit `i` set means block `i` is free for reuse by the next `allocate`.
#[derive(Debug, Clone, Default)]
pub struct FreeBitmap {
    words: Vec<u64>,
}

impl FreeBitmap {
    #[must_use]
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    fn word_index(i: u32) -> usize {
        (i / BITS_PER_WORD) as usize
    }

    fn bit_index(i: u32) -> u32 {
        i % BITS_PER_WORD
    }

    pub fn set(&mut self, i: u32) {
        let w = Self::word_index(i);
        if w >= self.words.len() {
            self.words.resize(w + 1, 0);
        }
        self.words[w] |= 1u64 << Self::bit_index(i);
    }

    pub fn clear(&mut self, i: u32) {
        let w = Self::word_index(i);
        if w < self.words.len() {
            self.words[w] &= !(1u64 << Self::bit_index(i));
        }
    }

    #[must_use]
    pub fn get(&self, i: u32) -> bool {
        let w = Self::word_index(i);
        self.words
            .get(w)
            .is_some_and(|word| word & (1u64 << Self::bit_index(i)) != 0)
    }

    /// Lowest set bit at or after `from`, if any.
    #[must_use]
    pub fn next_set_bit(&self, from: u32) -> Option<u32> {
        let mut w = Self::word_index(from);
        if w >= self.words.len() {
            return None;
        }
        let first_bit = Self::bit_index(from);
        let mut word = self.words[w] & (!0u64 << first_bit);
        loop {
            if word != 0 {
                return Some(w as u32 * BITS_PER_WORD + word.trailing_zeros());
            }
            w += 1;
            if w >= self.words.len() {
                return None;
            }
            word = self.words[w];
        }
    }

    #[must_use]
    pub fn cardinality(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// Highest bit index the bitmap can currently represent; grows via
    /// `set`, never shrinks except through `trim`/`serialize`.
    #[must_use]
    pub fn length(&self) -> u32 {
        self.words.len() as u32 * BITS_PER_WORD
    }

    /// Drops trailing all-zero words, matching the on-disk convention that
    /// `words_in_use` reflects only the occupied prefix.
    pub fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }

    /// On-disk layout: `u32 words_in_use | word[words_in_use]`, host-endian
    /// — a deliberate, documented exception to the rest of the format's
    /// big-endian convention (see `DESIGN.md`).
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut trimmed = self.clone();
        trimmed.trim();
        let mut out = Vec::with_capacity(4 + trimmed.words.len() * 8);
        out.extend_from_slice(&(trimmed.words.len() as u32).to_ne_bytes());
        for word in &trimmed.words {
            out.extend_from_slice(&word.to_ne_bytes());
        }
        out
    }

    /// # Errors
    /// Returns [`TreeError::InvalidData`] if `buf` is too short for the
    /// `words_in_use` count it declares.
    pub fn deserialize(buf: &[u8]) -> TreeResult<Self> {
        if buf.len() < 4 {
            return Err(TreeError::InvalidData(
                "free bitmap buffer shorter than its header".into(),
            ));
        }
        let words_in_use = u32::from_ne_bytes(buf[0..4].try_into().unwrap()) as usize;
        let needed = 4 + words_in_use * 8;
        if buf.len() < needed {
            return Err(TreeError::InvalidData(format!(
                "free bitmap buffer too short: need {needed} bytes, have {}",
                buf.len()
            )));
        }
        let mut words = Vec::with_capacity(words_in_use);
        let mut pos = 4;
        for _ in 0..words_in_use {
            words.push(u64::from_ne_bytes(buf[pos..pos + 8].try_into().unwrap()));
            pos += 8;
        }
        Ok(Self { words })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_clear_roundtrip() {
        let mut bm = FreeBitmap::new();
        assert!(!bm.get(5));
        bm.set(5);
        assert!(bm.get(5));
        bm.clear(5);
        assert!(!bm.get(5));
    }

    #[test]
    fn next_set_bit_scans_forward() {
        let mut bm = FreeBitmap::new();
        bm.set(3);
        bm.set(70);
        assert_eq!(bm.next_set_bit(0), Some(3));
        assert_eq!(bm.next_set_bit(4), Some(70));
        assert_eq!(bm.next_set_bit(71), None);
    }

    #[test]
    fn cardinality_counts_set_bits() {
        let mut bm = FreeBitmap::new();
        for i in [1, 2, 64, 128, 129] {
            bm.set(i);
        }
        assert_eq!(bm.cardinality(), 5);
    }

    #[test]
    fn serialize_deserialize_roundtrips_and_trims() {
        let mut bm = FreeBitmap::new();
        bm.set(0);
        bm.set(200);
        bm.clear(200);
        let bytes = bm.serialize();
        // Trailing all-zero words beyond bit 0's word are trimmed away.
        assert_eq!(bytes.len(), 4 + 8);
        let decoded = FreeBitmap::deserialize(&bytes).unwrap();
        assert!(decoded.get(0));
        assert!(!decoded.get(200));
        assert_eq!(decoded.cardinality(), 1);
    }

    #[test]
    fn deserialize_rejects_truncated_buffer() {
        let buf = [2u8, 0, 0, 0, 1, 2, 3];
        assert!(FreeBitmap::deserialize(&buf).is_err());
    }
}
