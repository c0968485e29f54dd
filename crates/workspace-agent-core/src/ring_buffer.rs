//! Fixed-capacity history of interactive session output.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default history capacity (1 MiB).
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

/// Longest run of UTF-8 continuation bytes a single character can carry.
const MAX_CONTINUATION_BYTES: usize = 3;

struct Inner {
    buf: Vec<u8>,
    /// Next write position.
    head: usize,
    /// Number of retained bytes.
    size: usize,
}

/// Circular byte store retaining the most recent output.
///
/// Writes beyond capacity silently overwrite the oldest bytes. Reads
/// always return valid UTF-8: if overwriting cut a character in half, the
/// partial leading bytes are skipped rather than emitted.
pub struct OutputRingBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl Default for OutputRingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl OutputRingBuffer {
    /// Create a buffer holding at most `capacity` bytes (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                buf: vec![0; capacity],
                head: 0,
                size: 0,
            }),
        }
    }

    /// Append bytes, overwriting the oldest data on overflow.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let cap = self.capacity;
        // Only the newest `cap` bytes of an oversized write can survive.
        let data = if data.len() > cap {
            &data[data.len() - cap..]
        } else {
            data
        };

        let mut inner = self.lock();
        let head = inner.head;
        let first = (cap - head).min(data.len());
        inner.buf[head..head + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        inner.buf[..rest].copy_from_slice(&data[first..]);
        inner.head = (head + data.len()) % cap;
        inner.size = (inner.size + data.len()).min(cap);
    }

    /// Snapshot the retained output as text, oldest first.
    #[must_use]
    pub fn read_all(&self) -> String {
        let bytes = {
            let inner = self.lock();
            self.contiguous(&inner)
        };
        decode_from_boundary(&bytes)
    }

    /// Drop all retained output.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.head = 0;
        inner.size = 0;
    }

    /// Number of bytes currently retained.
    #[must_use]
    pub fn size(&self) -> usize {
        self.lock().size
    }

    /// Whether nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Maximum number of bytes retained.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    fn contiguous(&self, inner: &Inner) -> Vec<u8> {
        let cap = self.capacity;
        let start = (inner.head + cap - inner.size) % cap;
        let mut out = Vec::with_capacity(inner.size);
        if start + inner.size <= cap {
            out.extend_from_slice(&inner.buf[start..start + inner.size]);
        } else {
            out.extend_from_slice(&inner.buf[start..]);
            out.extend_from_slice(&inner.buf[..inner.size - (cap - start)]);
        }
        out
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

const fn is_continuation(byte: u8) -> bool {
    byte & 0b1100_0000 == 0b1000_0000
}

/// Decode starting at the first character boundary, dropping any bytes
/// that do not form complete characters.
fn decode_from_boundary(bytes: &[u8]) -> String {
    let skip = bytes
        .iter()
        .take(MAX_CONTINUATION_BYTES)
        .take_while(|b| is_continuation(**b))
        .count();
    let bytes = &bytes[skip..];

    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_owned(),
        Err(_) => {
            let mut out = String::with_capacity(bytes.len());
            for chunk in bytes.utf8_chunks() {
                out.push_str(chunk.valid());
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn test_round_trip_under_capacity() {
        let buffer = OutputRingBuffer::new(64);
        buffer.write(b"hello ");
        buffer.write("wörld ✓".as_bytes());
        assert_eq!(buffer.read_all(), "hello wörld ✓");
        assert_eq!(buffer.size(), "hello wörld ✓".len());
    }

    #[test]
    fn test_overflow_keeps_newest_bytes() {
        let buffer = OutputRingBuffer::new(8);
        buffer.write(b"abcdef");
        buffer.write(b"ghijkl");
        assert_eq!(buffer.read_all(), "efghijkl");
        assert_eq!(buffer.size(), 8);
    }

    #[test]
    fn test_oversized_single_write() {
        let buffer = OutputRingBuffer::new(4);
        buffer.write(b"0123456789");
        assert_eq!(buffer.read_all(), "6789");
    }

    #[test]
    fn test_skips_partial_leading_character() {
        let buffer = OutputRingBuffer::new(5);
        // "€" is three bytes; after overflow only its last two remain.
        buffer.write("a€".as_bytes());
        buffer.write(b"bcd");
        assert_eq!(buffer.read_all(), "bcd");
    }

    #[test]
    fn test_byte_at_a_time_across_wraparound() {
        let text = "aé€😀".repeat(40);
        for cap in [7, 10, 13, 64] {
            let buffer = OutputRingBuffer::new(cap);
            for byte in text.as_bytes() {
                buffer.write(std::slice::from_ref(byte));
                let read = buffer.read_all();
                assert!(read.len() <= cap);
            }
            let read = buffer.read_all();
            assert!(text.ends_with(&read), "cap {cap}: {read:?}");
            assert!(read.len() + 3 >= cap, "cap {cap}: dropped too much");
        }
    }

    #[test]
    fn test_truncated_trailing_character_is_withheld() {
        let buffer = OutputRingBuffer::new(32);
        let snowman = "☃".as_bytes();
        buffer.write(b"x");
        buffer.write(&snowman[..2]);
        assert_eq!(buffer.read_all(), "x");
        buffer.write(&snowman[2..]);
        assert_eq!(buffer.read_all(), "x☃");
    }

    #[test]
    fn test_clear() {
        let buffer = OutputRingBuffer::new(16);
        buffer.write(b"some output");
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.read_all(), "");
        buffer.write(b"again");
        assert_eq!(buffer.read_all(), "again");
    }

    #[test]
    fn test_concurrent_reads_never_torn() {
        let buffer = Arc::new(OutputRingBuffer::new(16));
        let writer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for _ in 0..5_000 {
                    buffer.write(b"wxyz");
                }
            })
        };
        for _ in 0..5_000 {
            let read = buffer.read_all();
            assert_eq!(read.len() % 4, 0);
            assert_eq!(read, "wxyz".repeat(read.len() / 4));
        }
        writer.join().unwrap();
    }
}
