//! Segmented on-disk backend for a [`bipstream::Stream`].
//!
//! The store is a directory of fixed-size segment files named
//! `<base>_0000`, `<base>_0001`, … Segment `k` holds the stream positions
//! `[k * segment_size, (k + 1) * segment_size)`, so locating a byte is pure
//! arithmetic and old segments can be dropped whole to reclaim disk. On open
//! the directory is scanned to recover the append high-water mark.
//!
//! A flusher drains the stream into [`SegmentedStreamFile::write`]; readers
//! reach it through the [`StreamFile`] contract once bytes have left the
//! stream's buffer.

use bipstream::{StreamError, StreamFile, StreamPos};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::debug;

/// Default size of one segment file.
pub const DEFAULT_SEGMENT_SIZE: u64 = 100 * 1024 * 1024;
/// Default digit width of the segment sequence suffix.
pub const DEFAULT_FILENAME_DIGITS: usize = 4;

/// Errors from the segmented store.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("segment io failed")]
    Io(#[from] io::Error),

    /// The segment holding the requested position was never written or was
    /// already dropped.
    #[error("segment {seq} is missing")]
    MissingSegment { seq: u64 },
}

impl From<FileError> for StreamError {
    fn from(err: FileError) -> Self {
        match err {
            FileError::Io(err) => StreamError::FileRead(err),
            FileError::MissingSegment { seq } => StreamError::FileRead(io::Error::new(
                io::ErrorKind::NotFound,
                format!("segment {seq} is missing"),
            )),
        }
    }
}

struct SegState {
    /// Open handles by segment sequence number.
    files: HashMap<u64, File>,
    /// Oldest segment still on disk.
    start_seq: u64,
}

/// Byte-addressable store split across fixed-size segment files.
pub struct SegmentedStreamFile {
    dir: PathBuf,
    base_name: String,
    segment_size: u64,
    digits: usize,
    state: Mutex<SegState>,
    /// Highest stream position ever written, recovered on open.
    append_pos: AtomicU64,
}

impl SegmentedStreamFile {
    /// Opens (or creates) a store under `dir` with the default segment size.
    pub fn open(dir: impl AsRef<Path>, base_name: &str) -> Result<Self, FileError> {
        Self::open_with_segment_size(dir, base_name, DEFAULT_SEGMENT_SIZE)
    }

    /// Opens (or creates) a store with an explicit segment size.
    ///
    /// Scans the directory for existing segments and recovers the append
    /// high-water mark from the newest one.
    pub fn open_with_segment_size(
        dir: impl AsRef<Path>,
        base_name: &str,
        segment_size: u64,
    ) -> Result<Self, FileError> {
        assert!(segment_size > 0);
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let prefix = format!("{base_name}_");
        let mut start_seq = u64::MAX;
        let mut newest: Option<(u64, u64)> = None;
        for dent in fs::read_dir(&dir)? {
            let dent = dent?;
            let name = dent.file_name();
            let Some(seq) = name
                .to_str()
                .and_then(|n| n.strip_prefix(&prefix))
                .and_then(|suffix| suffix.parse::<u64>().ok())
            else {
                continue;
            };
            start_seq = start_seq.min(seq);
            let len = dent.metadata()?.len();
            if newest.map_or(true, |(s, _)| seq > s) {
                newest = Some((seq, len));
            }
        }

        let append_pos = newest.map_or(0, |(seq, len)| seq * segment_size + len);
        debug!(
            dir = %dir.display(),
            base_name,
            append_pos,
            "opened segmented stream file"
        );

        Ok(Self {
            dir,
            base_name: base_name.to_string(),
            segment_size,
            digits: DEFAULT_FILENAME_DIGITS,
            state: Mutex::new(SegState {
                files: HashMap::new(),
                start_seq: if start_seq == u64::MAX { 0 } else { start_seq },
            }),
            append_pos: AtomicU64::new(append_pos),
        })
    }

    /// Highest stream position written so far.
    pub fn append_position(&self) -> StreamPos {
        self.append_pos.load(Ordering::Acquire)
    }

    /// Persists `buf` at `pos`, spanning segments as needed.
    pub fn write_at(&self, pos: StreamPos, buf: &[u8]) -> Result<(), FileError> {
        let mut pos = pos;
        let mut rest = buf;
        while !rest.is_empty() {
            let seq = pos / self.segment_size;
            let offset = pos % self.segment_size;
            let chunk = ((self.segment_size - offset) as usize).min(rest.len());

            let mut state = self.lock();
            let file = self.open_segment(&mut state, seq, true)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&rest[..chunk])?;
            drop(state);

            pos += chunk as u64;
            rest = &rest[chunk..];
        }

        self.append_pos
            .fetch_max(pos, Ordering::AcqRel);
        Ok(())
    }

    /// Fills `buf` from `pos`, spanning segments as needed.
    pub fn read_at(&self, pos: StreamPos, buf: &mut [u8]) -> Result<(), FileError> {
        let mut pos = pos;
        let mut rest = &mut buf[..];
        while !rest.is_empty() {
            let seq = pos / self.segment_size;
            let offset = pos % self.segment_size;
            let chunk = ((self.segment_size - offset) as usize).min(rest.len());

            let mut state = self.lock();
            let file = self.open_segment(&mut state, seq, false)?;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut rest[..chunk])?;
            drop(state);

            pos += chunk as u64;
            rest = &mut rest[chunk..];
        }
        Ok(())
    }

    /// Removes every segment lying entirely below `pos`.
    ///
    /// Returns the number of segments dropped.
    pub fn drop_segments_below(&self, pos: StreamPos) -> Result<usize, FileError> {
        let keep_from = pos / self.segment_size;
        let mut dropped = 0;

        let mut state = self.lock();
        for seq in state.start_seq..keep_from {
            let path = self.segment_path(seq);
            if path.exists() {
                fs::remove_file(&path)?;
                state.files.remove(&seq);
                dropped += 1;
                debug!(seq, "dropped stream segment");
            }
        }
        state.start_seq = state.start_seq.max(keep_from);

        Ok(dropped)
    }

    fn segment_path(&self, seq: u64) -> PathBuf {
        self.dir
            .join(format!("{}_{:0width$}", self.base_name, seq, width = self.digits))
    }

    fn open_segment<'a>(
        &self,
        state: &'a mut SegState,
        seq: u64,
        create: bool,
    ) -> Result<&'a mut File, FileError> {
        match state.files.entry(seq) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(slot) => {
                let path = self.segment_path(seq);
                let existed = path.exists();
                if !existed && !create {
                    return Err(FileError::MissingSegment { seq });
                }
                let file = OpenOptions::new()
                    .read(true)
                    .write(create)
                    .create(create)
                    .open(&path)?;
                if !existed {
                    debug!(seq, path = %path.display(), "created stream segment");
                }
                Ok(slot.insert(file))
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, SegState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StreamFile for SegmentedStreamFile {
    fn write(&self, pos: StreamPos, buf: &[u8]) -> Result<(), StreamError> {
        self.write_at(pos, buf)?;
        Ok(())
    }

    fn read(&self, pos: StreamPos, buf: &mut [u8]) -> Result<(), StreamError> {
        self.read_at(pos, buf)?;
        Ok(())
    }

    fn max_available_from_pos(&self, pos: StreamPos) -> usize {
        self.append_pos
            .load(Ordering::Acquire)
            .saturating_sub(pos) as usize
    }
}
