//! Generational buffer pool: a process-wide, thread-safe stack of
//! `block_size`-byte buffers keyed by `(block_size, direct)`, so repeated
//! open/close cycles (and repeated block reads) don't thrash the allocator.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

type PoolKey = (u32, bool);

struct Pool {
    buffers: Vec<Vec<u8>>,
    created: u64,
}

static POOLS: Lazy<Mutex<HashMap<PoolKey, Pool>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// A pooled, zero-filled buffer of exactly `block_size` bytes. Dropping it
/// without calling [`release`] simply deallocates — the pool never leaks,
/// it just stops benefiting from reuse for that buffer.
#[must_use]
pub fn acquire(block_size: u32, direct: bool) -> Vec<u8> {
    let key = (block_size, direct);
    let mut pools = POOLS.lock();
    let pool = pools.entry(key).or_insert_with(|| Pool {
        buffers: Vec::new(),
        created: 0,
    });
    if let Some(mut buf) = pool.buffers.pop() {
        buf.iter_mut().for_each(|b| *b = 0);
        buf
    } else {
        pool.created += 1;
        vec![0u8; block_size as usize]
    }
}

/// Returns a buffer to the pool for reuse. The pool is append-only in
/// capacity: it tracks how many buffers it has ever created but never
/// shrinks below that count.
pub fn release(block_size: u32, direct: bool, buf: Vec<u8>) {
    let key = (block_size, direct);
    let mut pools = POOLS.lock();
    let pool = pools.entry(key).or_insert_with(|| Pool {
        buffers: Vec::new(),
        created: 0,
    });
    pool.buffers.push(buf);
}

/// Count of buffers this pool has allocated from the system allocator,
/// for a given key, since process start. Exposed for tests/diagnostics.
#[must_use]
pub fn created_count(block_size: u32, direct: bool) -> u64 {
    POOLS
        .lock()
        .get(&(block_size, direct))
        .map_or(0, |p| p.created)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reused_buffer_is_zeroed_and_right_sized() {
        let key_size = 4096;
        let mut buf = acquire(key_size, false);
        buf[0] = 0xFF;
        release(key_size, false, buf);
        let buf2 = acquire(key_size, false);
        assert_eq!(buf2.len(), key_size as usize);
        assert!(buf2.iter().all(|&b| b == 0));
    }

    #[test]
    fn distinct_keys_do_not_share_buffers() {
        let before_a = created_count(111, false);
        let before_b = created_count(111, true);
        let _a = acquire(111, false);
        let _b = acquire(111, true);
        assert_eq!(created_count(111, false), before_a + 1);
        assert_eq!(created_count(111, true), before_b + 1);
    }
}
