use crate::config::{
    StreamConfig, BLOCK_THRESHOLD_PERCENT, MIN_BYTES_TO_READ_FROM_FILE,
    RESERVE_SPIN_SLEEP_MICROS, RESUME_THRESHOLD_PERCENT, WAIT_FOR_FILE_SLEEP_MICROS,
};
use crate::stats::{StatsSnapshot, StreamStats};
use crate::stream_file::StreamFile;
use crate::{StreamError, StreamPos};
use bipbuf::{BipBuffer, PageId, ReserveError, ReserveQueue, SlotId};
use crossbeam_utils::CachePadded;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

// =============================================================================
// LOCKING & SHARING PROTOCOL
// =============================================================================
//
// One mutex (`inner`) owns every piece of bookkeeping: the bip-buffer region
// pointers, the reservation queue, and the serial-read wait position. All
// buffer and queue operations happen under it. The logical positions are
// plain atomics, written only while holding `inner` (except the recyclable
// position, which has its own tiny mutex shared with the recyclable condvar);
// they can therefore be read lock-free for flow-control checks and
// preconditions, at worst observing a slightly stale value that the locked
// re-check corrects.
//
// The bytes themselves are touched OUTSIDE the mutex:
//
// - A writer gets `[offset, offset + amount)` from `reserve` while locked,
//   then fills it unlocked. Exclusivity holds because no other reservation
//   overlaps the range until it is committed and recycled.
// - A reader pins the page backing its range while locked, then reads
//   unlocked. Immutability holds because `reserve` refuses to advance the
//   append pointer across a pinned page.
//
// Callbacks (`write_fn`, `read_fn`, the registered handlers) always run
// without `inner` held, so they may call back into the stream's read side.
// The ready-position handler runs under the small notification mutex and
// must not append to the same stream.
//
// =============================================================================

/// Sentinel meaning no serial reader is blocked.
const SERIAL_WAIT_NONE: StreamPos = StreamPos::MAX;

/// Context of one in-flight reservation, stored in the reserve queue.
#[derive(Debug, Clone, Copy, Default)]
struct ReserveCtx {
    start_pos: StreamPos,
    offset: usize,
    reserved: usize,
    /// Bytes the writer reported; informational (zero on writer error).
    written: usize,
}

struct StreamInner {
    buffer: BipBuffer,
    queue: ReserveQueue<ReserveCtx>,
    /// Position a serial reader is blocked waiting for.
    serial_read_wait_pos: StreamPos,
}

type PosHandler = Box<dyn Fn(StreamPos, usize) + Send + Sync>;
type FetchHandler = Box<dyn Fn(StreamPos, usize) -> Result<(), StreamError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipMode {
    DontSkip,
    Skip,
}

/// Concurrent append-only byte stream over a bip-buffer.
///
/// Multiple appender threads call [`write`](Self::write); each gets a
/// contiguous reservation, fills it without holding any lock, and the
/// committed boundary advances only when a contiguous prefix of reservations
/// has completed. Readers locate ranges either in the buffer (pinning the
/// backing page) or, once the buffer has moved on, in the attached
/// [`StreamFile`].
///
/// Handlers and the stream file are registered through `&mut self` before
/// the stream is shared; everything else takes `&self`.
pub struct Stream {
    inner: Mutex<StreamInner>,
    /// Paired with `inner`; wakes blocked serial readers.
    serial_read_cv: Condvar,
    /// Paired with `recycle_lock`; wakes writers blocked on backlog.
    recycle_lock: Mutex<()>,
    recycle_cv: Condvar,

    /// Base pointer of the buffer allocation owned by `inner`.
    base: *mut u8,
    capacity: usize,

    trigger_flush_to_disk_size: usize,
    block_threshold: u64,
    resume_threshold: u64,
    trigger_min_to_read_size: AtomicUsize,
    flush_on_commit: bool,

    append_pos: AtomicU64,
    last_committed_pos: AtomicU64,
    oldest_buffered_pos: AtomicU64,
    last_recyclable_pos: AtomicU64,
    read_pos: AtomicU64,
    stopped: AtomicBool,

    /// Last position the ready handler was told about.
    last_notified_pos: Mutex<StreamPos>,

    ready_pos_handler: Option<PosHandler>,
    filled_handler: Option<PosHandler>,
    fetch_handler: Option<FetchHandler>,

    stream_file: Option<Arc<dyn StreamFile>>,

    stats: CachePadded<StreamStats>,
}

// SAFETY: `base` aliases the allocation owned by `inner`'s BipBuffer, which
// lives exactly as long as `self` and never moves. Byte ranges reached
// through it are only dereferenced under the reserve/pin protocol described
// at the top of this file, which guarantees each range a single writer or
// immutability while readers hold it.
unsafe impl Send for Stream {}
unsafe impl Sync for Stream {}

impl Stream {
    /// Creates a stream with default thresholds.
    pub fn new(capacity: usize, max_appenders: usize) -> Self {
        Self::with_config(StreamConfig::new(capacity, max_appenders))
    }

    /// Creates a stream from an explicit configuration.
    pub fn with_config(config: StreamConfig) -> Self {
        let mut buffer = BipBuffer::new(config.capacity);
        if let Some(margin) = config.reserve_margin {
            buffer.set_reserve_margin(margin);
        }
        let capacity = buffer.capacity();
        let base = buffer.range_ptr(0);

        let trigger_flush_to_disk_size =
            config.trigger_flush_to_disk_size.unwrap_or(capacity / 2);
        let block_threshold = (capacity * BLOCK_THRESHOLD_PERCENT / 100) as u64;
        let resume_threshold = (capacity * RESUME_THRESHOLD_PERCENT / 100) as u64;
        debug_assert!(block_threshold as usize > trigger_flush_to_disk_size);
        debug_assert!(resume_threshold as usize > trigger_flush_to_disk_size);

        debug!(
            capacity,
            max_appenders = config.max_appenders,
            "stream created"
        );

        Self {
            inner: Mutex::new(StreamInner {
                buffer,
                queue: ReserveQueue::with_capacity(config.max_appenders),
                serial_read_wait_pos: SERIAL_WAIT_NONE,
            }),
            serial_read_cv: Condvar::new(),
            recycle_lock: Mutex::new(()),
            recycle_cv: Condvar::new(),
            base,
            capacity,
            trigger_flush_to_disk_size,
            block_threshold,
            resume_threshold,
            trigger_min_to_read_size: AtomicUsize::new(config.trigger_min_to_read_size),
            flush_on_commit: config.flush_on_commit,
            append_pos: AtomicU64::new(0),
            last_committed_pos: AtomicU64::new(0),
            oldest_buffered_pos: AtomicU64::new(0),
            last_recyclable_pos: AtomicU64::new(0),
            read_pos: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            last_notified_pos: Mutex::new(0),
            ready_pos_handler: None,
            filled_handler: None,
            fetch_handler: None,
            stream_file: None,
            stats: CachePadded::new(StreamStats::default()),
        }
    }

    /// Positions the stream at `start_pos`. Call once, before sharing.
    pub fn init(&self, start_pos: StreamPos) {
        self.append_pos.store(start_pos, Ordering::Release);
        self.last_committed_pos.store(start_pos, Ordering::Release);
        self.oldest_buffered_pos.store(start_pos, Ordering::Release);
        self.last_recyclable_pos.store(start_pos, Ordering::Release);
        self.read_pos.store(start_pos, Ordering::Release);
        *self.lock_notified() = start_pos;
    }

    // ---------------------------------------------------------------------
    // REGISTRATION (before sharing)
    // ---------------------------------------------------------------------

    /// Attaches the backing store used once bytes leave the buffer.
    pub fn set_stream_file(&mut self, file: Arc<dyn StreamFile>) {
        self.stream_file = Some(file);
    }

    /// Registers the new-data handler, called (outside the stream mutex)
    /// with `(from_pos, byte_count)` when the completed position outgrows
    /// the last notification by the configured minimum.
    ///
    /// The handler must not append to this stream.
    pub fn on_ready_pos(&mut self, f: impl Fn(StreamPos, usize) + Send + Sync + 'static) {
        self.ready_pos_handler = Some(Box::new(f));
    }

    /// Registers the flusher wake-up handler, called with
    /// `(from_pos, byte_count)` when unflushed data piles up.
    pub fn on_filled(&mut self, f: impl Fn(StreamPos, usize) + Send + Sync + 'static) {
        self.filled_handler = Some(Box::new(f));
    }

    /// Registers the serial-fetch fallback, invoked with the wanted
    /// `(position, amount)` before a serial read blocks on missing data.
    pub fn on_fetch(
        &mut self,
        f: impl Fn(StreamPos, usize) -> Result<(), StreamError> + Send + Sync + 'static,
    ) {
        self.fetch_handler = Some(Box::new(f));
    }

    // ---------------------------------------------------------------------
    // WRITE PATH
    // ---------------------------------------------------------------------

    /// Appends `byte_count` bytes produced by `write_fn`.
    ///
    /// The callback runs without any lock held, on a contiguous range inside
    /// the buffer, and receives the logical position of its first byte. Its
    /// `Ok(n)` is the written byte count reported back to the caller; on
    /// `Err` the reservation is still committed (with zero written bytes) so
    /// the commit ordering stays intact, and the error is propagated.
    pub fn write<F>(&self, byte_count: usize, write_fn: F) -> Result<usize, StreamError>
    where
        F: FnOnce(StreamPos, &mut [u8]) -> Result<usize, StreamError>,
    {
        debug_assert!(byte_count > 0);
        if self.stopped.load(Ordering::Acquire) {
            return Err(StreamError::Stopped);
        }

        if self.need_block_reserve() {
            self.wait_for_flush_or_readers()?;
        }

        let slot;
        let start_pos;
        let offset;
        let flush_from;
        let flush_until;
        {
            let mut inner = self.lock_inner();
            loop {
                while self.need_block_reserve() {
                    drop(inner);
                    self.wait_for_flush_or_readers()?;
                    inner = self.lock_inner();
                }

                let Some(produced) = inner.queue.produce(ReserveCtx::default()) else {
                    // A slow committer can fill the queue; let it drain.
                    inner = self.backoff_relocked(inner, &self.stats.reserve_queue_spins)?;
                    continue;
                };

                match inner.buffer.reserve(byte_count) {
                    Ok(reserved) => {
                        let start = self.append_pos.load(Ordering::Relaxed);
                        *inner.queue.get_mut(produced) = ReserveCtx {
                            start_pos: start,
                            offset: reserved,
                            reserved: byte_count,
                            written: 0,
                        };
                        self.append_pos
                            .store(start + byte_count as u64, Ordering::Release);

                        // The reserve may have cycled the buffer; refresh the
                        // oldest buffered position from the new trails.
                        let total = inner.buffer.read_ranges().total() as u64;
                        self.oldest_buffered_pos.store(
                            self.last_committed_pos.load(Ordering::Relaxed) - total,
                            Ordering::Release,
                        );

                        slot = produced;
                        start_pos = start;
                        offset = reserved;
                        break;
                    }
                    Err(ReserveError::TooLarge { amount, limit }) => {
                        inner.queue.undo_produce(produced);
                        return Err(StreamError::ReserveTooLarge { amount, limit });
                    }
                    Err(ReserveError::WouldBlock) => {
                        // A reader pin sits in the append path; give readers
                        // a chance to unlatch and committers to advance.
                        inner.queue.undo_produce(produced);
                        inner =
                            self.backoff_relocked(inner, &self.stats.reserve_buffer_spins)?;
                    }
                }
            }
            flush_from = self.last_recyclable_pos.load(Ordering::Relaxed);
            flush_until = self.last_committed_pos.load(Ordering::Relaxed);
        }

        let fill =
            (flush_until - flush_from) as f32 / self.trigger_flush_to_disk_size as f32;
        self.wake_flusher(fill, flush_from, (flush_until - flush_from) as usize);

        // SAFETY: `[offset, offset + byte_count)` was reserved for this call
        // alone; nothing reads it before commit and no other reservation
        // overlaps it. The allocation outlives `self`.
        let range =
            unsafe { std::slice::from_raw_parts_mut(self.base.add(offset), byte_count) };
        let result = write_fn(start_pos, range);
        let written = match &result {
            Ok(n) => *n,
            Err(_) => 0,
        };

        self.commit_append(slot, written);

        result
    }

    /// Commit phase of an append: consume the queue slot, and when the head
    /// collapses, advance the buffer commit pointer and the committed
    /// boundary to the furthest contiguous completion.
    fn commit_append(&self, slot: SlotId, written: usize) {
        let mut signal_serial = false;
        let mut collapsed = false;
        let new_completed;
        {
            let mut inner = self.lock_inner();
            inner.queue.get_mut(slot).written = written;
            let ctx = *inner.queue.get(slot);
            let mut completed = ctx.start_pos + ctx.reserved as u64;

            let result = inner.queue.consume(slot);
            if let Some(last) = result.last {
                let boundary = last.start_pos + last.reserved as u64;
                debug_assert!(completed <= boundary);
                completed = boundary;

                inner.buffer.commit(last.offset + last.reserved);
                debug_assert!(boundary > self.last_committed_pos.load(Ordering::Relaxed));
                self.last_committed_pos.store(boundary, Ordering::Release);
                collapsed = true;
            }
            new_completed = completed;

            if self.last_committed_pos.load(Ordering::Relaxed) >= inner.serial_read_wait_pos {
                signal_serial = true;
            }
        }

        if signal_serial {
            self.serial_read_cv.notify_all();
        }

        if let Some(handler) = &self.ready_pos_handler {
            let mut last_notified = self.lock_notified();
            let min = self.trigger_min_to_read_size.load(Ordering::Relaxed) as u64;
            if new_completed > *last_notified + min {
                let from = *last_notified;
                handler(from, (new_completed - from) as usize);
                *last_notified = new_completed;
            }
        }

        if self.flush_on_commit && collapsed {
            let from = self.last_recyclable_pos.load(Ordering::Relaxed);
            self.wake_flusher(2.0, from, (new_completed - from) as usize);
        }
    }

    // ---------------------------------------------------------------------
    // READ PATH
    // ---------------------------------------------------------------------

    /// Reads exactly `byte_count` committed bytes starting at `first_pos`.
    ///
    /// The callback sees one contiguous slice: when the range straddles the
    /// buffer trails (or the tail of the backing file) the pieces are
    /// stitched into a local copy first.
    pub fn read<F>(
        &self,
        first_pos: StreamPos,
        byte_count: usize,
        read_fn: F,
    ) -> Result<usize, StreamError>
    where
        F: FnOnce(&[u8]) -> Result<usize, StreamError>,
    {
        debug_assert!(byte_count > 0);
        if self.stopped.load(Ordering::Acquire) {
            return Err(StreamError::Stopped);
        }

        let data = self.acquire_range(first_pos, byte_count)?;
        read_fn(data.as_slice())
    }

    /// Like [`read`](Self::read), but hands the callback only the contiguous
    /// bytes available at `first_pos` and reports how many it consumed via
    /// `actual_read`.
    pub fn read_partial<F>(
        &self,
        first_pos: StreamPos,
        byte_count: usize,
        actual_read: &mut usize,
        read_fn: F,
    ) -> Result<usize, StreamError>
    where
        F: FnOnce(&[u8], &mut usize) -> Result<usize, StreamError>,
    {
        debug_assert!(byte_count > 0);
        if self.stopped.load(Ordering::Acquire) {
            return Err(StreamError::Stopped);
        }

        let hold = self.get_data_from_pos(first_pos, byte_count)?;
        read_fn(hold.as_slice(), actual_read)
    }

    /// Serial read of a typed prefix that announces its payload size.
    ///
    /// Blocks until `byte_count` bytes are committed at the read cursor,
    /// exposes them to `read_fn` together with the position right after them,
    /// then blocks until the announced payload is committed as well and
    /// advances the cursor past prefix and payload.
    ///
    /// At most one thread may read serially; the cursor is not protected
    /// against concurrent serial readers.
    pub fn read_serial<F>(&self, byte_count: usize, read_fn: F) -> Result<usize, StreamError>
    where
        F: FnOnce(StreamPos, &[u8], &mut usize) -> Result<usize, StreamError>,
    {
        debug_assert!(byte_count > 0);
        if self.stopped.load(Ordering::Acquire) {
            return Err(StreamError::Stopped);
        }

        if self.read_pos.load(Ordering::Acquire) + byte_count as u64
            > self.last_committed_pos.load(Ordering::Acquire)
        {
            self.wait_for_data(byte_count, SkipMode::DontSkip)?;
        }

        let to_read = self.read_pos.load(Ordering::Acquire);
        let data = self.acquire_range(to_read, byte_count)?;

        let trail_pos = to_read + byte_count as u64;
        let mut payload_size = 0usize;
        let result = read_fn(trail_pos, data.as_slice(), &mut payload_size);
        drop(data);

        self.wait_for_data(byte_count + payload_size, SkipMode::Skip)?;

        result
    }

    /// Blocks until `amount` bytes past the read cursor are committed.
    ///
    /// In skip mode the cursor advances past them on success.
    fn wait_for_data(&self, amount: usize, skip: SkipMode) -> Result<(), StreamError> {
        let target = self.read_pos.load(Ordering::Acquire) + amount as u64;

        if target <= self.last_committed_pos.load(Ordering::Acquire) {
            if skip == SkipMode::Skip {
                self.read_pos.store(target, Ordering::Release);
            }
            return Ok(());
        }

        StreamStats::bump(&self.stats.read_not_enough_data);

        // Give an on-demand producer a chance to fill the gap first.
        if let Some(fetch) = &self.fetch_handler {
            fetch(target - amount as u64, amount)?;
        }

        let mut inner = self.lock_inner();
        inner.serial_read_wait_pos = target;
        let mut inner = self
            .serial_read_cv
            .wait_while(inner, |inner| {
                !self.stopped.load(Ordering::Relaxed)
                    && self.last_committed_pos.load(Ordering::Relaxed)
                        < inner.serial_read_wait_pos
            })
            .unwrap_or_else(PoisonError::into_inner);
        inner.serial_read_wait_pos = SERIAL_WAIT_NONE;
        drop(inner);

        if self.stopped.load(Ordering::Acquire) {
            return Err(StreamError::Stopped);
        }

        debug_assert!(target <= self.last_committed_pos.load(Ordering::Relaxed));
        if skip == SkipMode::Skip {
            self.read_pos.store(target, Ordering::Release);
        }
        Ok(())
    }

    /// Produces one contiguous view of `[pos, pos + amount)`, stitching the
    /// two buffer trails (or a file segment and the buffer) through a local
    /// copy when needed.
    fn acquire_range(&self, pos: StreamPos, amount: usize) -> Result<RangeData<'_>, StreamError> {
        let first = self.get_data_from_pos(pos, amount)?;
        let got = first.len();
        if got >= amount {
            return Ok(RangeData::Hold(first));
        }

        let mut local = vec![0u8; amount];
        local[..got].copy_from_slice(first.as_slice());
        drop(first);

        let rest = self.get_data_from_pos(pos + got as u64, amount - got)?;
        if rest.len() != amount - got {
            return Err(StreamError::ReadNoReadableRange);
        }
        local[got..].copy_from_slice(rest.as_slice());
        drop(rest);

        Ok(RangeData::Local(local))
    }

    /// Locates `[req_pos, req_pos + amount)`, preferring the buffer.
    ///
    /// Returns a hold covering the contiguous bytes found at `req_pos` (up to
    /// `amount`); the hold keeps the backing page pinned, or owns the copy
    /// fetched from the stream file.
    fn get_data_from_pos(
        &self,
        req_pos: StreamPos,
        amount: usize,
    ) -> Result<ReadHold<'_>, StreamError> {
        debug_assert!(amount > 0);

        if req_pos + amount as u64 > self.last_committed_pos.load(Ordering::Acquire) {
            StreamStats::bump(&self.stats.read_not_enough_data);
            return Err(StreamError::ReadNotCommitted {
                pos: req_pos,
                amount,
            });
        }

        if req_pos < self.oldest_buffered_pos.load(Ordering::Acquire) {
            return self.read_from_file(req_pos, amount);
        }

        let mut inner = self.lock_inner();
        let ranges = inner.buffer.read_ranges();
        let (trail_b, trail_a) = (ranges.trail_b, ranges.trail_a);
        if trail_a.len == 0 && trail_b.len == 0 {
            StreamStats::bump(&self.stats.read_no_readable_range);
            return Err(StreamError::ReadNoReadableRange);
        }

        let committed = self.last_committed_pos.load(Ordering::Relaxed);
        let oldest = committed - ranges.total() as u64;
        self.oldest_buffered_pos.store(oldest, Ordering::Release);

        if req_pos < oldest {
            // The buffer moved on while this thread was unlocked.
            drop(inner);
            return self.read_from_file(req_pos, amount);
        }

        // The readable bytes are logically [trail_a, trail_b), ending at the
        // committed boundary; map the logical distance back into a trail.
        let behind = (committed - req_pos) as usize;
        let (offset, actual) = if behind <= trail_b.len {
            (trail_b.offset + trail_b.len - behind, amount.min(behind))
        } else {
            let into_a = behind - trail_b.len;
            (trail_a.offset + trail_a.len - into_a, amount.min(into_a))
        };

        let page = match inner.buffer.start_read(offset, actual) {
            Ok(page) => page,
            Err(_) => {
                StreamStats::bump(&self.stats.read_pin_failed);
                return Err(StreamError::ReadPinFailed);
            }
        };
        drop(inner);

        // SAFETY: offset stays inside the allocation; the page pin keeps the
        // range immutable until the hold is dropped.
        let ptr = unsafe { self.base.add(offset) }.cast_const();
        Ok(ReadHold::Buffer {
            stream: self,
            ptr,
            len: actual,
            page,
        })
    }

    /// Serves a read from the stream file, waiting for the flusher to catch
    /// up when the file does not have the bytes yet.
    fn read_from_file(
        &self,
        req_pos: StreamPos,
        amount: usize,
    ) -> Result<ReadHold<'_>, StreamError> {
        StreamStats::bump(&self.stats.read_not_in_buffer);

        let Some(file) = self.stream_file.as_deref() else {
            return Err(StreamError::FileRead(io::Error::new(
                io::ErrorKind::NotFound,
                "bytes left the buffer and no stream file is attached",
            )));
        };

        let min_needed = MIN_BYTES_TO_READ_FROM_FILE.min(amount);
        let available = loop {
            StreamStats::bump(&self.stats.wait_for_file_polls);
            let available = file.max_available_from_pos(req_pos);
            if available >= min_needed {
                break available;
            }
            if self.stopped.load(Ordering::Acquire) {
                return Err(StreamError::Stopped);
            }
            thread::sleep(Duration::from_micros(WAIT_FOR_FILE_SLEEP_MICROS));
        };

        let actual = available.min(amount);
        let mut buf = vec![0u8; actual];
        file.read(req_pos, &mut buf)?;
        trace!(pos = req_pos, bytes = actual, "read served from stream file");

        Ok(ReadHold::File { buf })
    }

    // ---------------------------------------------------------------------
    // FLOW CONTROL & LIFECYCLE
    // ---------------------------------------------------------------------

    /// Declares everything before `pos` safe to overwrite.
    ///
    /// Clamped to the committed boundary; wakes writers blocked on backlog.
    pub fn set_last_recyclable_pos(&self, pos: StreamPos) {
        let new_pos = pos.min(self.last_committed_pos.load(Ordering::Acquire));
        if new_pos <= self.last_recyclable_pos.load(Ordering::Relaxed) {
            return;
        }

        let guard = self
            .recycle_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.last_recyclable_pos.fetch_max(new_pos, Ordering::AcqRel);
        drop(guard);
        self.recycle_cv.notify_all();
    }

    /// Stops the stream. Sticky: blocked readers and writers wake with
    /// [`StreamError::Stopped`] and further operations fail the same way.
    pub fn set_stop(&self) {
        self.stopped.store(true, Ordering::Release);
        debug!("stream stopped");

        // Take each condvar's mutex so no sleeper can miss the flag.
        drop(self.lock_inner());
        self.serial_read_cv.notify_all();
        drop(
            self.recycle_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        self.recycle_cv.notify_all();
    }

    fn need_block_reserve(&self) -> bool {
        self.append_pos
            .load(Ordering::Relaxed)
            .saturating_sub(self.last_recyclable_pos.load(Ordering::Relaxed))
            >= self.block_threshold
    }

    /// Waits until the flusher (or the set of readers) advances the
    /// recyclable position enough to resume appending.
    fn wait_for_flush_or_readers(&self) -> Result<(), StreamError> {
        let from = self.last_recyclable_pos.load(Ordering::Acquire);
        let committed = self.last_committed_pos.load(Ordering::Acquire);
        self.wake_flusher(2.0, from, committed.saturating_sub(from) as usize);

        let guard = self
            .recycle_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let guard = self
            .recycle_cv
            .wait_while(guard, |_| {
                !self.stopped.load(Ordering::Relaxed)
                    && self
                        .append_pos
                        .load(Ordering::Relaxed)
                        .saturating_sub(self.last_recyclable_pos.load(Ordering::Relaxed))
                        >= self.resume_threshold
            })
            .unwrap_or_else(PoisonError::into_inner);
        drop(guard);

        if self.stopped.load(Ordering::Acquire) {
            return Err(StreamError::Stopped);
        }
        Ok(())
    }

    fn wake_flusher(&self, fill_factor: f32, from: StreamPos, amount: usize) {
        if fill_factor > 1.0 {
            if let Some(handler) = &self.filled_handler {
                trace!(fill_factor, from, amount, "waking flusher");
                handler(from, amount);
            }
        }
    }

    /// Drops the lock, naps, and re-acquires; used by the reserve retries.
    fn backoff_relocked<'a>(
        &'a self,
        guard: MutexGuard<'a, StreamInner>,
        counter: &std::sync::atomic::AtomicU64,
    ) -> Result<MutexGuard<'a, StreamInner>, StreamError> {
        drop(guard);
        if self.stopped.load(Ordering::Acquire) {
            return Err(StreamError::Stopped);
        }
        thread::sleep(Duration::from_micros(RESERVE_SPIN_SLEEP_MICROS));
        StreamStats::bump(counter);
        Ok(self.lock_inner())
    }

    fn lock_inner(&self) -> MutexGuard<'_, StreamInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_notified(&self) -> MutexGuard<'_, StreamPos> {
        self.last_notified_pos
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ---------------------------------------------------------------------
    // ACCESSORS
    // ---------------------------------------------------------------------

    /// Buffer capacity after alignment.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Next unused stream position.
    #[inline]
    pub fn append_position(&self) -> StreamPos {
        self.append_pos.load(Ordering::Acquire)
    }

    /// Bytes strictly below this position are committed and observable.
    #[inline]
    pub fn last_committed_pos(&self) -> StreamPos {
        self.last_committed_pos.load(Ordering::Acquire)
    }

    /// Serial read cursor.
    #[inline]
    pub fn read_position(&self) -> StreamPos {
        self.read_pos.load(Ordering::Acquire)
    }

    /// Smallest position still resident in the buffer.
    #[inline]
    pub fn oldest_buffered_position(&self) -> StreamPos {
        self.oldest_buffered_pos.load(Ordering::Acquire)
    }

    /// Highest position external clients declared overwritable.
    #[inline]
    pub fn last_recyclable_pos(&self) -> StreamPos {
        self.last_recyclable_pos.load(Ordering::Acquire)
    }

    /// Returns `true` once [`set_stop`](Self::set_stop) was called.
    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Unflushed backlog as a ratio of the flush trigger size; above 1.0 the
    /// flusher should run (and appenders may start throttling).
    pub fn fill_factor(&self) -> f32 {
        let backlog = self
            .append_pos
            .load(Ordering::Relaxed)
            .saturating_sub(self.last_recyclable_pos.load(Ordering::Relaxed));
        backlog as f32 / self.trigger_flush_to_disk_size as f32
    }

    /// Number of times the buffer wrapped back to its start.
    pub fn buffer_cycles(&self) -> u64 {
        self.lock_inner().buffer.cycles()
    }

    /// Overrides the buffer reserve margin.
    pub fn set_buffer_reserve_margin(&self, margin: usize) {
        self.lock_inner().buffer.set_reserve_margin(margin);
    }

    /// Overrides the minimum committed delta for ready notifications.
    pub fn set_trigger_min_to_read_size(&self, size: usize) {
        self.trigger_min_to_read_size.store(size, Ordering::Relaxed);
    }

    /// Point-in-time copy of the operation counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

/// A located range: either pinned buffer bytes or a copy from the file.
enum ReadHold<'a> {
    Buffer {
        stream: &'a Stream,
        ptr: *const u8,
        len: usize,
        page: PageId,
    },
    File {
        buf: Vec<u8>,
    },
}

impl ReadHold<'_> {
    fn len(&self) -> usize {
        match self {
            Self::Buffer { len, .. } => *len,
            Self::File { buf } => buf.len(),
        }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            // SAFETY: the pin taken in `get_data_from_pos` keeps these bytes
            // immutable until `drop` releases it.
            Self::Buffer { ptr, len, .. } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
            Self::File { buf } => buf,
        }
    }
}

impl Drop for ReadHold<'_> {
    fn drop(&mut self) {
        if let Self::Buffer { stream, page, .. } = self {
            stream.lock_inner().buffer.end_read(*page);
        }
    }
}

/// One contiguous view over a requested range.
enum RangeData<'a> {
    Hold(ReadHold<'a>),
    Local(Vec<u8>),
}

impl RangeData<'_> {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Hold(hold) => hold.as_slice(),
            Self::Local(buf) => buf,
        }
    }
}
