//! Ring-buffered log store.
//!
//! One [`LogBuffer`] per process stream (stdout or stderr). Writes are
//! byte-oriented and lossy at the head: when capacity would be exceeded the
//! oldest bytes are dropped and the absolute start offset advances by the
//! dropped count. Readers address data by absolute offset and never block the
//! writer.

use std::{collections::VecDeque, sync::Mutex};

use tokio::sync::Notify;

/// Result of a `read_since` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadChunk {
    pub bytes: Vec<u8>,
    /// Absolute offset to resume from.
    pub new_offset: u64,
    /// Bytes the reader missed because the head dropped past its offset.
    pub dropped_before: u64,
}

struct Ring {
    buf: VecDeque<u8>,
    capacity: usize,
    /// Absolute offset of `buf[0]`.
    start_offset: u64,
}

impl Ring {
    fn end_offset(&self) -> u64 {
        self.start_offset + self.buf.len() as u64
    }

    fn push(&mut self, bytes: &[u8]) {
        if bytes.len() >= self.capacity {
            // The write alone overflows the ring: keep only its tail.
            let skip = bytes.len() - self.capacity;
            self.start_offset = self.end_offset() + skip as u64;
            self.buf.clear();
            self.buf.extend(&bytes[skip..]);
            return;
        }
        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buf.drain(..overflow);
            self.start_offset += overflow as u64;
        }
        self.buf.extend(bytes);
    }

    fn read_since(&self, offset: u64) -> ReadChunk {
        let end = self.end_offset();
        if offset >= end {
            return ReadChunk {
                bytes: Vec::new(),
                new_offset: end,
                dropped_before: 0,
            };
        }
        let (from, dropped) = if offset < self.start_offset {
            (self.start_offset, self.start_offset - offset)
        } else {
            (offset, 0)
        };
        let skip = (from - self.start_offset) as usize;
        ReadChunk {
            bytes: self.buf.iter().skip(skip).copied().collect(),
            new_offset: end,
            dropped_before: dropped,
        }
    }
}

/// Single-writer / multi-reader byte ring with absolute offsets.
///
/// The interior mutex is only held for copy-in/copy-out; streaming readers
/// park on the [`Notify`] between reads.
pub struct LogBuffer {
    ring: Mutex<Ring>,
    notify: Notify,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
                capacity: capacity.max(1),
                start_offset: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Append bytes, dropping from the head as needed, and wake readers.
    pub fn write(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        {
            let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
            ring.push(bytes);
        }
        self.notify.notify_waiters();
    }

    /// Read everything at or after `offset`.
    pub fn read_since(&self, offset: u64) -> ReadChunk {
        self.ring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .read_since(offset)
    }

    /// Absolute offset of the oldest retained byte.
    pub fn start_offset(&self) -> u64 {
        self.ring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .start_offset
    }

    /// Absolute offset one past the newest byte.
    pub fn end_offset(&self) -> u64 {
        self.ring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .end_offset()
    }

    /// Wait until data exists beyond `offset`.
    ///
    /// Registers for notification before re-checking, so a write racing with
    /// the check is never missed.
    pub async fn wait_beyond(&self, offset: u64) {
        loop {
            let notified = self.notify.notified();
            if self.end_offset() > offset {
                return;
            }
            notified.await;
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_from_zero_returns_everything() {
        let buf = LogBuffer::new(1024);
        buf.write(b"hello ");
        buf.write(b"world");
        let chunk = buf.read_since(0);
        assert_eq!(chunk.bytes, b"hello world");
        assert_eq!(chunk.new_offset, 11);
        assert_eq!(chunk.dropped_before, 0);
    }

    #[test]
    fn incremental_reads_resume_at_offset() {
        let buf = LogBuffer::new(1024);
        buf.write(b"abc");
        let first = buf.read_since(0);
        buf.write(b"def");
        let second = buf.read_since(first.new_offset);
        assert_eq!(second.bytes, b"def");
        assert_eq!(second.new_offset, 6);
    }

    #[test]
    fn read_past_end_is_empty() {
        let buf = LogBuffer::new(1024);
        buf.write(b"xy");
        let chunk = buf.read_since(10);
        assert!(chunk.bytes.is_empty());
        assert_eq!(chunk.new_offset, 2);
    }

    #[test]
    fn head_drop_advances_offsets_and_reports_dropped() {
        let buf = LogBuffer::new(8);
        buf.write(b"01234567");
        buf.write(b"89"); // drops "01"
        assert_eq!(buf.start_offset(), 2);
        let chunk = buf.read_since(0);
        assert_eq!(chunk.bytes, b"23456789");
        assert_eq!(chunk.dropped_before, 2);
        assert_eq!(chunk.new_offset, 10);
    }

    #[test]
    fn oversized_write_keeps_tail() {
        let buf = LogBuffer::new(4);
        buf.write(b"abcdefgh");
        let chunk = buf.read_since(0);
        assert_eq!(chunk.bytes, b"efgh");
        assert_eq!(chunk.dropped_before, 4);
        assert_eq!(chunk.new_offset, 8);
    }

    #[test]
    fn newest_bytes_always_retained() {
        let buf = LogBuffer::new(16);
        for i in 0..100u8 {
            buf.write(&[i]);
        }
        let chunk = buf.read_since(buf.start_offset());
        assert_eq!(chunk.bytes.len(), 16);
        assert_eq!(*chunk.bytes.last().unwrap(), 99);
    }

    #[tokio::test]
    async fn wait_beyond_wakes_on_write() {
        let buf = std::sync::Arc::new(LogBuffer::new(64));
        let waiter = {
            let buf = std::sync::Arc::clone(&buf);
            tokio::spawn(async move {
                buf.wait_beyond(0).await;
                buf.read_since(0)
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        buf.write(b"ping");
        let chunk = waiter.await.unwrap();
        assert_eq!(chunk.bytes, b"ping");
    }

    #[tokio::test]
    async fn wait_beyond_returns_immediately_when_data_exists() {
        let buf = LogBuffer::new(64);
        buf.write(b"x");
        tokio::time::timeout(std::time::Duration::from_millis(50), buf.wait_beyond(0))
            .await
            .expect("should not block");
    }
}
