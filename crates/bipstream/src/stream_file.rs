//! Backing-store contract for bytes that have left the buffer.

use crate::{StreamError, StreamPos};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Byte-addressable persistence keyed by stream position.
///
/// The stream only requires positional reads plus an availability probe; a
/// flusher drains committed bytes into the store through `write` and then
/// advances the stream's recyclable position. Implementations decide layout
/// and durability; any store that can answer `read(pos, ..)` for every
/// position it acknowledged suffices.
pub trait StreamFile: Send + Sync {
    /// Persists `buf` at stream position `pos`.
    fn write(&self, pos: StreamPos, buf: &[u8]) -> Result<(), StreamError>;

    /// Fills `buf` with the bytes at stream position `pos`.
    fn read(&self, pos: StreamPos, buf: &mut [u8]) -> Result<(), StreamError>;

    /// Number of contiguous bytes available starting at `pos`.
    fn max_available_from_pos(&self, pos: StreamPos) -> usize;
}

#[derive(Debug, Default)]
struct MemState {
    start_pos: StreamPos,
    bytes: Vec<u8>,
}

/// In-memory [`StreamFile`] for tests and ephemeral streams.
///
/// Counts reads and writes so tests can observe which store served a range.
#[derive(Debug, Default)]
pub struct MemoryStreamFile {
    state: Mutex<MemState>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStreamFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store whose first byte sits at `start_pos`.
    pub fn starting_at(start_pos: StreamPos) -> Self {
        Self {
            state: Mutex::new(MemState {
                start_pos,
                bytes: Vec::new(),
            }),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of positional reads served.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of positional writes accepted.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl StreamFile for MemoryStreamFile {
    fn write(&self, pos: StreamPos, buf: &[u8]) -> Result<(), StreamError> {
        let mut state = self.lock();
        let end = state.start_pos + state.bytes.len() as u64;
        if pos < state.start_pos || pos > end {
            return Err(StreamError::FileRead(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("write at {pos} leaves a gap (store ends at {end})"),
            )));
        }

        let offset = (pos - state.start_pos) as usize;
        let needed = offset + buf.len();
        if state.bytes.len() < needed {
            state.bytes.resize(needed, 0);
        }
        state.bytes[offset..needed].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read(&self, pos: StreamPos, buf: &mut [u8]) -> Result<(), StreamError> {
        let state = self.lock();
        let end = state.start_pos + state.bytes.len() as u64;
        if pos < state.start_pos || pos + buf.len() as u64 > end {
            return Err(StreamError::FileRead(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {pos}+{} outside store", buf.len()),
            )));
        }

        let offset = (pos - state.start_pos) as usize;
        buf.copy_from_slice(&state.bytes[offset..offset + buf.len()]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn max_available_from_pos(&self, pos: StreamPos) -> usize {
        let state = self.lock();
        let end = state.start_pos + state.bytes.len() as u64;
        end.saturating_sub(pos) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_file_round_trip() {
        let file = MemoryStreamFile::new();
        file.write(0, b"hello").unwrap();
        file.write(5, b" world").unwrap();

        let mut buf = [0u8; 11];
        file.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
        assert_eq!(file.max_available_from_pos(6), 5);
        assert_eq!(file.read_count(), 1);
        assert_eq!(file.write_count(), 2);
    }

    #[test]
    fn test_memory_file_rejects_gap() {
        let file = MemoryStreamFile::new();
        file.write(0, b"abc").unwrap();
        assert!(file.write(10, b"xyz").is_err());
    }

    #[test]
    fn test_memory_file_nonzero_start() {
        let file = MemoryStreamFile::starting_at(1000);
        file.write(1000, b"data").unwrap();

        let mut buf = [0u8; 4];
        file.read(1000, &mut buf).unwrap();
        assert_eq!(&buf, b"data");
        assert!(file.read(999, &mut buf).is_err());
        assert_eq!(file.max_available_from_pos(500), 504);
    }

    #[test]
    fn test_memory_file_read_past_end() {
        let file = MemoryStreamFile::new();
        file.write(0, b"short").unwrap();
        let mut buf = [0u8; 16];
        assert!(file.read(0, &mut buf).is_err());
    }
}
