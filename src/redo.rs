//! Append-only redo log: header/footer-framed operation records, optional
//! buffer-alignment padding, and an optional dedicated writer thread.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::codec::Codec;
use crate::errors::{TreeError, TreeResult};

pub const HEADER_MAGIC: u16 = 0x754C;
pub const FOOTER_MAGIC: u8 = 0x24;
pub const PADDING_MAGIC: u8 = 0x42;
pub const OP_PUT: u8 = 0xA;
pub const OP_REMOVE: u8 = 0xB;

const HEADER_LEN: u64 = 6; // magic16 + len32
const FOOTER_LEN: u64 = 1;

/// Redo framing/threading options, applied once at construction.
#[derive(Debug, Clone, Copy)]
pub struct RedoOptions {
    pub flush_on_write: bool,
    pub sync_on_flush: bool,
    pub align_blocks: bool,
    pub buffer_size: usize,
}

impl Default for RedoOptions {
    fn default() -> Self {
        Self {
            flush_on_write: false,
            sync_on_flush: true,
            align_blocks: true,
            buffer_size: 4096,
        }
    }
}

fn align_bits(buffer_size: usize) -> u32 {
    let target = buffer_size.max(512);
    let mut bits = 0u32;
    while (1usize << bits) < target {
        bits += 1;
    }
    bits
}

/// A decoded redo record, ready to be replayed against a tree.
pub enum RedoOp<K, V> {
    Put(K, V),
    Remove(K),
}

/// Encodes a PUT record payload: `0xA | key | value`.
pub fn encode_put<K: Codec, V: Codec>(key: &K, value: &V) -> Vec<u8> {
    let mut out = vec![0u8; 1 + K::byte_length() + V::byte_length()];
    out[0] = OP_PUT;
    key.serialize(&mut out[1..1 + K::byte_length()]);
    value.serialize(&mut out[1 + K::byte_length()..]);
    out
}

/// Encodes a REMOVE record payload: `0xB | key`.
pub fn encode_remove<K: Codec>(key: &K) -> Vec<u8> {
    let mut out = vec![0u8; 1 + K::byte_length()];
    out[0] = OP_REMOVE;
    key.serialize(&mut out[1..]);
    out
}

/// # Errors
/// Returns [`TreeError::InvalidData`] for an unrecognized opcode or a
/// payload shorter than its opcode requires.
pub fn decode_payload<K: Codec, V: Codec>(payload: &[u8]) -> TreeResult<RedoOp<K, V>> {
    if payload.is_empty() {
        return Err(TreeError::InvalidData("empty redo payload".into()));
    }
    match payload[0] {
        OP_PUT => {
            let klen = K::byte_length();
            let vlen = V::byte_length();
            if payload.len() < 1 + klen + vlen {
                return Err(TreeError::InvalidData("truncated PUT redo record".into()));
            }
            let key = K::deserialize(&payload[1..1 + klen]);
            let value = V::deserialize(&payload[1 + klen..1 + klen + vlen]);
            Ok(RedoOp::Put(key, value))
        }
        OP_REMOVE => {
            let klen = K::byte_length();
            if payload.len() < 1 + klen {
                return Err(TreeError::InvalidData(
                    "truncated REMOVE redo record".into(),
                ));
            }
            Ok(RedoOp::Remove(K::deserialize(&payload[1..1 + klen])))
        }
        other => Err(TreeError::InvalidData(format!(
            "unrecognized redo opcode {other:#x}"
        ))),
    }
}

enum WriterMessage {
    Write(Vec<u8>),
    Shutdown,
}

/// The append-only redo file, optionally backed by a dedicated writer
/// thread that drains a bounded queue in order.
pub struct RedoLog {
    file: Option<File>,
    path: String,
    options: RedoOptions,
    writer: Option<WriterHandle>,
}

struct WriterHandle {
    sender: SyncSender<WriterMessage>,
    stop: Arc<AtomicBool>,
    handle: std::thread::JoinHandle<TreeResult<()>>,
}

impl RedoLog {
    /// # Errors
    /// Returns [`TreeError::Io`] on a filesystem failure.
    pub fn open(path: &str, options: RedoOptions) -> TreeResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file: Some(file),
            path: path.to_owned(),
            options,
            writer: None,
        })
    }

    /// Starts a dedicated writer thread draining a bounded queue (capacity
    /// 1), guaranteeing redo ordering independent of the calling thread.
    pub fn start_writer_thread(&mut self) {
        if self.writer.is_some() {
            return;
        }
        let Some(file) = self.file.take() else {
            return;
        };
        let (tx, rx): (SyncSender<WriterMessage>, Receiver<WriterMessage>) = sync_channel(1);
        let stop = Arc::new(AtomicBool::new(false));
        let options = self.options;
        let path = self.path.clone();
        let handle = std::thread::spawn(move || -> TreeResult<()> {
            let mut file = file;
            for msg in rx {
                match msg {
                    WriterMessage::Write(framed) => {
                        file.write_all(&framed)?;
                        if options.flush_on_write {
                            file.flush()?;
                            if options.sync_on_flush {
                                file.sync_all()?;
                            }
                        }
                    }
                    WriterMessage::Shutdown => break,
                }
            }
            log::debug!("redo writer thread for {path} drained and exiting");
            Ok(())
        });
        self.writer = Some(WriterHandle {
            sender: tx,
            stop,
            handle,
        });
    }

    /// Two-phase shutdown handshake: signal stop, wait up to three
    /// seconds, then wait up to thirty more. Residual queued buffers are
    /// flushed before the thread exits because `Shutdown` is only
    /// processed after every preceding `Write` in the channel.
    ///
    /// # Errors
    /// Returns [`TreeError::Io`] if the writer thread itself failed.
    pub fn stop_writer_thread(&mut self) -> TreeResult<()> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        writer.stop.store(true, AtomicOrdering::SeqCst);
        let _ = writer.sender.send(WriterMessage::Shutdown);
        drop(writer.sender);

        let deadline_soft = Instant::now() + Duration::from_secs(3);
        while !writer.handle.is_finished() && Instant::now() < deadline_soft {
            std::thread::sleep(Duration::from_millis(20));
        }
        let deadline_hard = Instant::now() + Duration::from_secs(30);
        while !writer.handle.is_finished() && Instant::now() < deadline_hard {
            std::thread::sleep(Duration::from_millis(50));
        }

        match writer.handle.join() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TreeError::InvalidState(
                "redo writer thread panicked".into(),
            )),
        }
    }

    fn frame(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN as usize + payload.len() + FOOTER_LEN as usize);
        out.extend_from_slice(&HEADER_MAGIC.to_be_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out.push(FOOTER_MAGIC);
        out
    }

    /// Appends `payload` as a framed record and returns the starting
    /// offset of the frame (post any alignment padding).
    ///
    /// # Errors
    /// Returns [`TreeError::Io`] on a filesystem failure, or
    /// [`TreeError::InvalidState`] if routed to a writer thread that has
    /// already been stopped.
    pub fn write(&mut self, payload: &[u8]) -> TreeResult<u64> {
        let framed = self.frame(payload);

        if let Some(writer) = &self.writer {
            writer
                .sender
                .send(WriterMessage::Write(framed))
                .map_err(|_| TreeError::InvalidState("redo writer thread is stopped".into()))?;
            // The thread owns the file handle; offset bookkeeping for the
            // threaded path is the caller's responsibility via `size()`.
            return Ok(0);
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TreeError::InvalidState("redo log is closed".into()))?;
        let mut start = file.seek(SeekFrom::End(0))?;

        if self.options.align_blocks {
            let bits = align_bits(self.options.buffer_size);
            let boundary = 1u64 << bits;
            let next_boundary = start.div_ceil(boundary) * boundary.max(1);
            let next_boundary = if next_boundary == start {
                start
            } else {
                next_boundary
            };
            let frame_len = framed.len() as u64;
            let current_boundary = (start / boundary) * boundary;
            if start + frame_len > current_boundary + boundary && start != current_boundary {
                let pad_len = (current_boundary + boundary) - start;
                let mut pad = vec![0u8; pad_len as usize];
                pad[0] = PADDING_MAGIC;
                file.write_all(&pad)?;
                start = current_boundary + boundary;
            }
        }

        file.write_all(&framed)?;
        if self.options.flush_on_write {
            file.flush()?;
            if self.options.sync_on_flush {
                file.sync_all()?;
            }
        }
        Ok(start)
    }

    /// Reads the record starting at `offset` into `out`. Returns the
    /// offset immediately past the footer, or `None` on EOF or a framing
    /// mismatch (corruption). Transparently skips a padding run by
    /// advancing to the next alignment boundary and retrying once.
    ///
    /// # Errors
    /// Returns [`TreeError::Io`] on a filesystem failure, or
    /// [`TreeError::InvalidData`] if the declared payload length would
    /// overflow `out`.
    pub fn read(&mut self, offset: u64, out: &mut Vec<u8>) -> TreeResult<Option<u64>> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TreeError::InvalidState("redo log is closed".into()))?;
        let len = file.metadata()?.len();
        if offset >= len {
            return Ok(None);
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut first = [0u8; 1];
        if file.read_exact(&mut first).is_err() {
            return Ok(None);
        }
        if first[0] == PADDING_MAGIC {
            let bits = align_bits(self.options.buffer_size);
            let boundary = 1u64 << bits;
            let next_boundary = (offset / boundary + 1) * boundary;
            return self.read(next_boundary, out);
        }

        let mut rest = [0u8; HEADER_LEN as usize - 1];
        if file.read_exact(&mut rest).is_err() {
            return Ok(None);
        }
        let magic = u16::from_be_bytes([first[0], rest[0]]);
        if magic != HEADER_MAGIC {
            return Ok(None);
        }
        let payload_len = u32::from_be_bytes(rest[1..5].try_into().unwrap()) as usize;
        out.resize(payload_len, 0);
        if file.read_exact(out).is_err() {
            return Ok(None);
        }
        let mut footer = [0u8; 1];
        if file.read_exact(&mut footer).is_err() || footer[0] != FOOTER_MAGIC {
            return Ok(None);
        }
        Ok(Some(offset + HEADER_LEN + payload_len as u64 + FOOTER_LEN))
    }

    /// Reads a record of known payload length `len` anchored to the end of
    /// the file: seeks to `size - HEADER - len - FOOTER`.
    ///
    /// # Errors
    /// See [`RedoLog::read`].
    pub fn read_from_end(&mut self, len: usize, out: &mut Vec<u8>) -> TreeResult<Option<u64>> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TreeError::InvalidState("redo log is closed".into()))?;
        let size = file.metadata()?.len();
        let frame_len = HEADER_LEN + len as u64 + FOOTER_LEN;
        if size < frame_len {
            return Ok(None);
        }
        let offset = size - frame_len;
        self.read(offset, out)
    }

    /// Verifies the last byte of the file equals [`FOOTER_MAGIC`].
    ///
    /// # Errors
    /// Returns [`TreeError::Io`] on a filesystem failure.
    pub fn is_valid(&mut self) -> TreeResult<bool> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TreeError::InvalidState("redo log is closed".into()))?;
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(true);
        }
        file.seek(SeekFrom::End(-1))?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last)?;
        Ok(last[0] == FOOTER_MAGIC)
    }

    /// Truncates the redo log, used once its records are durably folded
    /// into the tree's persisted blocks via `sync()`.
    ///
    /// # Errors
    /// Returns [`TreeError::Io`] on a filesystem failure.
    pub fn truncate(&mut self) -> TreeResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TreeError::InvalidState("redo log is closed".into()))?;
        file.set_len(0)?;
        file.rewind()?;
        Ok(())
    }

    /// # Errors
    /// Returns [`TreeError::Io`] on a filesystem failure.
    pub fn size(&mut self) -> TreeResult<u64> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TreeError::InvalidState("redo log is closed".into()))?;
        Ok(file.metadata()?.len())
    }

    /// # Errors
    /// Returns [`TreeError::Io`] on a filesystem failure.
    pub fn delete(mut self) -> TreeResult<()> {
        self.stop_writer_thread()?;
        self.file = None;
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_remove_payloads_roundtrip() {
        let payload = encode_put(&5u32, &10u32);
        match decode_payload::<u32, u32>(&payload).unwrap() {
            RedoOp::Put(k, v) => {
                assert_eq!(k, 5);
                assert_eq!(v, 10);
            }
            RedoOp::Remove(_) => panic!("expected PUT"),
        }

        let payload = encode_remove(&7u32);
        match decode_payload::<u32, u32>(&payload).unwrap() {
            RedoOp::Remove(k) => assert_eq!(k, 7),
            RedoOp::Put(..) => panic!("expected REMOVE"),
        }
    }

    #[test]
    fn decode_rejects_unknown_opcode() {
        let payload = vec![0xFFu8, 1, 2, 3];
        assert!(decode_payload::<u32, u32>(&payload).is_err());
    }

    #[test]
    fn write_then_read_roundtrips_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.redo");
        let mut log = RedoLog::open(
            path.to_str().unwrap(),
            RedoOptions {
                align_blocks: false,
                ..RedoOptions::default()
            },
        )
        .unwrap();
        let payload = encode_put(&1u32, &2u32);
        let offset = log.write(&payload).unwrap();
        let mut out = Vec::new();
        let next = log.read(offset, &mut out).unwrap().unwrap();
        assert_eq!(out, payload);
        assert!(next > offset);
        assert!(log.is_valid().unwrap());
    }

    #[test]
    fn read_from_end_locates_the_last_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.redo");
        let mut log = RedoLog::open(
            path.to_str().unwrap(),
            RedoOptions {
                align_blocks: false,
                ..RedoOptions::default()
            },
        )
        .unwrap();
        log.write(&encode_put(&1u32, &2u32)).unwrap();
        let last_payload = encode_put(&3u32, &4u32);
        log.write(&last_payload).unwrap();

        let mut out = Vec::new();
        log.read_from_end(last_payload.len(), &mut out).unwrap();
        assert_eq!(out, last_payload);
    }

    #[test]
    fn truncate_empties_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.redo");
        let mut log = RedoLog::open(path.to_str().unwrap(), RedoOptions::default()).unwrap();
        log.write(&encode_put(&1u32, &2u32)).unwrap();
        assert!(log.size().unwrap() > 0);
        log.truncate().unwrap();
        assert_eq!(log.size().unwrap(), 0);
    }
}
