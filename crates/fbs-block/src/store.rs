//! The block store: lazy device lifecycle, cached reads with batched
//! prefetch, and serialized flush cycles.
//!
//! All cache bookkeeping sits behind one store-wide mutex. Device I/O never
//! runs under it: a miss registers its whole run as loading, drops the lock,
//! reads, then re-locks to publish. A flush cycle takes the queue under the
//! lock and writes with the lock released.

use crate::cache::{BlockCell, CacheState, CacheStats, Lookup, PendingLoad};
use crate::device::{ByteDevice, FileByteDevice};
use crate::handle::BlockHandle;
use crate::vectored::{coalesce_runs, read_exact_or_zero_at, write_all_at};
use fbs_error::{FbsError, Result};
use fbs_types::{BLOCK_SHIFT, BLOCK_SIZE, BlockIndex, MAX_RUN_BLOCKS, StoreConfig};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Highest block index whose last byte is still addressable with a `u64`.
const LAST_ADDRESSABLE_BLOCK: u64 = u64::MAX >> BLOCK_SHIFT;

/// Result of [`BlockStore::info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreInfo {
    /// Whole blocks in the file (`len / BLOCK_SIZE`, truncating).
    pub block_count: u64,
}

enum DeviceState<D> {
    Unopened,
    Open(Arc<D>),
    Closed,
}

/// Flush cycle bookkeeping.
#[derive(Debug, Default)]
struct FlushCycles {
    running: Option<u64>,
    next: u64,
    /// Callers parked until the running cycle finishes.
    waiting: usize,
    /// Most recent failed cycle and its error text.
    last_failure: Option<(u64, String)>,
}

#[derive(Debug)]
struct StoreState {
    cache: CacheState,
    flush: FlushCycles,
}

type Opener<D> = Box<dyn Fn() -> Result<D> + Send + Sync>;

/// Block-granular cached view of one byte device.
///
/// The device is opened on first use ([`ready`](Self::ready), [`get`](Self::get),
/// [`flush`](Self::flush), [`info`](Self::info)). A failed open leaves the store
/// unopened so the next call tries again. After [`close`](Self::close) every
/// operation fails with [`FbsError::Closed`].
pub struct BlockStore<D: ByteDevice> {
    config: StoreConfig,
    opener: Opener<D>,
    device: Mutex<DeviceState<D>>,
    state: Mutex<StoreState>,
    flush_done: Condvar,
}

impl BlockStore<FileByteDevice> {
    /// Store over the file at `path`, created on open if missing.
    pub fn new(path: impl Into<PathBuf>, config: StoreConfig) -> Result<Self> {
        let path = path.into();
        Self::with_opener(config, move || FileByteDevice::open(&path))
    }
}

impl<D: ByteDevice> BlockStore<D> {
    /// Store whose device is produced by `opener` on first use.
    pub fn with_opener<F>(config: StoreConfig, opener: F) -> Result<Self>
    where
        F: Fn() -> Result<D> + Send + Sync + 'static,
    {
        config
            .validate()
            .map_err(|err| FbsError::InvalidConfig(err.to_string()))?;
        Ok(Self {
            config,
            opener: Box::new(opener),
            device: Mutex::new(DeviceState::Unopened),
            state: Mutex::new(StoreState {
                cache: CacheState::new(config.max_cache),
                flush: FlushCycles::default(),
            }),
            flush_done: Condvar::new(),
        })
    }

    /// Store over an already-open device.
    pub fn with_device(device: D, config: StoreConfig) -> Result<Self> {
        let store = Self::with_opener(config, || Err(FbsError::Closed))?;
        *store.device.lock() = DeviceState::Open(Arc::new(device));
        Ok(store)
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn device(&self) -> Result<Arc<D>> {
        let mut slot = self.device.lock();
        if let DeviceState::Open(device) = &*slot {
            return Ok(Arc::clone(device));
        }
        if matches!(*slot, DeviceState::Closed) {
            return Err(FbsError::Closed);
        }
        let device = Arc::new((self.opener)().inspect_err(|err| {
            tracing::warn!(target: "fbs::store", error = %err, "device_open_failed");
        })?);
        *slot = DeviceState::Open(Arc::clone(&device));
        tracing::debug!(target: "fbs::store", "device_opened");
        Ok(device)
    }

    /// Open the device if it is not open yet.
    pub fn ready(&self) -> Result<()> {
        self.device().map(drop)
    }

    /// Release the device. Queued blocks are not flushed.
    ///
    /// Closing an unopened or already closed store succeeds.
    pub fn close(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.device.lock(), DeviceState::Closed);
        if let DeviceState::Open(_) = previous {
            let queued = self.state.lock().cache.queued_len();
            if queued > 0 {
                tracing::warn!(target: "fbs::store", queued, "closed_with_unflushed_blocks");
            }
            tracing::debug!(target: "fbs::store", "device_closed");
        }
        Ok(())
    }

    /// Size of the underlying file in whole blocks.
    pub fn info(&self) -> Result<StoreInfo> {
        let len = self.device()?.len_bytes()?;
        Ok(StoreInfo {
            block_count: BlockIndex::count_for_len(len),
        })
    }

    /// Pin block `index`, reading it (and its prefetch window) on a miss.
    ///
    /// Concurrent requests for a block that is already being read wait for
    /// that read instead of issuing their own. Blocks past the end of the
    /// file read as zeros.
    pub fn get(&self, index: BlockIndex) -> Result<BlockHandle<'_, D>> {
        if index.0 > LAST_ADDRESSABLE_BLOCK {
            return Err(FbsError::OutOfRange(format!(
                "block {index} is past the addressable range"
            )));
        }
        let device = self.device()?;
        loop {
            let mut state = self.state.lock();
            match state.cache.lookup(index) {
                Lookup::Ready => {
                    if let Some(cell) = state.cache.acquire(index) {
                        return Ok(BlockHandle::new(self, index, cell));
                    }
                }
                Lookup::Loading(pending) => {
                    drop(state);
                    if let Err(detail) = pending.wait() {
                        return Err(FbsError::LoadFailed {
                            block: index.0,
                            detail,
                        });
                    }
                }
                Lookup::Missing => return self.load(&device, state, index),
            }
        }
    }

    /// Extent of the read issued for a miss on `index`: the prefetch window
    /// narrowed to the contiguous non-resident blocks around `index`.
    fn plan_run(&self, cache: &CacheState, index: BlockIndex) -> Range<u64> {
        let (lo, hi) = self.config.read_batch.window(index);
        let hi = hi.0.min(LAST_ADDRESSABLE_BLOCK + 1);
        let mut start = index.0;
        while start > lo.0 && !cache.contains(BlockIndex(start - 1)) {
            start -= 1;
        }
        let mut end = index.0 + 1;
        while end < hi && !cache.contains(BlockIndex(end)) {
            end += 1;
        }
        start..end
    }

    fn load(
        &self,
        device: &D,
        mut state: MutexGuard<'_, StoreState>,
        index: BlockIndex,
    ) -> Result<BlockHandle<'_, D>> {
        state.cache.maintain();
        let run = self.plan_run(&state.cache, index);
        let count = usize::try_from(run.end - run.start)
            .map_err(|_| FbsError::OutOfRange(format!("read run at block {index}")))?;
        let offset = BlockIndex(run.start)
            .byte_offset()
            .ok_or_else(|| FbsError::OutOfRange(format!("block {} offset", run.start)))?;
        let requested_pos = usize::try_from(index.0 - run.start)
            .map_err(|_| FbsError::OutOfRange(format!("read run at block {index}")))?;

        let pending = Arc::new(PendingLoad::default());
        let mut cells = Vec::with_capacity(count);
        for raw in run.clone() {
            let cell = Arc::new(BlockCell::default());
            if raw == index.0 {
                state
                    .cache
                    .insert_pinned(BlockIndex(raw), Arc::clone(&cell), Arc::clone(&pending));
            } else {
                state
                    .cache
                    .insert_idle(BlockIndex(raw), Arc::clone(&cell), Arc::clone(&pending));
            }
            cells.push(cell);
        }
        let requested = Arc::clone(&cells[requested_pos]);
        drop(state);

        tracing::debug!(
            target: "fbs::store",
            block = index.0,
            start = run.start,
            count,
            "batched_read"
        );
        let mut bufs = vec![vec![0_u8; BLOCK_SIZE]; count];
        match read_exact_or_zero_at(device, offset, &mut bufs) {
            Ok(()) => {
                for (cell, buf) in cells.iter().zip(bufs) {
                    cell.fill(buf);
                }
                self.state.lock().cache.finish_load(run, &pending);
                pending.complete(Ok(()));
                Ok(BlockHandle::new(self, index, requested))
            }
            Err(source) => {
                self.state.lock().cache.abort_load(run.clone(), &pending);
                tracing::warn!(
                    target: "fbs::store",
                    start = run.start,
                    count,
                    error = %source,
                    "batched_read_failed"
                );
                pending.complete(Err(source.to_string()));
                Err(FbsError::Read {
                    start: run.start,
                    count,
                    source,
                })
            }
        }
    }

    /// Write every queued block and wait until it is on the device.
    ///
    /// Calls that arrive while a cycle is running wait for it and then
    /// start a new cycle if blocks were queued meanwhile. A caller that
    /// waited on a cycle which failed gets [`FbsError::FlushFailed`]; the
    /// blocks of failed runs stay queued for the next attempt.
    pub fn flush(&self) -> Result<()> {
        let device = self.device()?;
        let mut state = self.state.lock();
        let mut joined = None;
        while let Some(cycle) = state.flush.running {
            joined.get_or_insert(cycle);
            state.flush.waiting += 1;
            self.flush_done.wait(&mut state);
            state.flush.waiting -= 1;
        }
        if let (Some(first), Some((failed, detail))) = (joined, state.flush.last_failure.as_ref()) {
            if *failed >= first {
                return Err(FbsError::FlushFailed(detail.clone()));
            }
        }
        if state.cache.queued_len() == 0 {
            return Ok(());
        }

        let cycle = state.flush.next;
        state.flush.next += 1;
        state.flush.running = Some(cycle);
        let batch = state.cache.take_queue();
        drop(state);

        let guard = CycleGuard {
            store: self,
            cycle,
            written: batch.iter().map(|(index, _)| *index).collect(),
            finished: false,
        };
        let (requeue, outcome) = self.write_cycle(&device, cycle, &batch);
        guard.finish(&requeue, outcome.as_ref().err().map(ToString::to_string));
        outcome
    }

    /// Write one cycle's blocks as coalesced runs. Returns the blocks that
    /// must be queued again and the first error.
    fn write_cycle(
        &self,
        device: &D,
        cycle: u64,
        batch: &[(BlockIndex, Arc<BlockCell>)],
    ) -> (Vec<BlockIndex>, Result<()>) {
        let indices: Vec<BlockIndex> = batch.iter().map(|(index, _)| *index).collect();
        let runs = coalesce_runs(&indices, MAX_RUN_BLOCKS);
        let workers = self.config.resolved_flush_workers().min(runs.len()).max(1);
        tracing::debug!(
            target: "fbs::store",
            cycle,
            blocks = batch.len(),
            runs = runs.len(),
            workers,
            "flush_cycle_start"
        );

        let next = AtomicUsize::new(0);
        let failures: Mutex<Vec<(usize, FbsError)>> = Mutex::new(Vec::new());
        let work = || {
            loop {
                let pos = next.fetch_add(1, Ordering::Relaxed);
                let Some(run) = runs.get(pos) else {
                    break;
                };
                if let Err(err) = write_run(device, &batch[run.clone()]) {
                    tracing::warn!(target: "fbs::store", cycle, error = %err, "write_run_failed");
                    failures.lock().push((pos, err));
                }
            }
        };
        if workers == 1 {
            work();
        } else {
            std::thread::scope(|scope| {
                for _ in 0..workers {
                    scope.spawn(&work);
                }
            });
        }

        let mut failures = failures.into_inner();
        failures.sort_by_key(|(pos, _)| *pos);
        let requeue: Vec<BlockIndex> = failures
            .iter()
            .flat_map(|(pos, _)| indices[runs[*pos].clone()].iter().copied())
            .collect();
        if let Some((_, err)) = failures.into_iter().next() {
            return (requeue, Err(err));
        }

        if self.config.sync_on_flush {
            if let Err(err) = device.sync() {
                tracing::warn!(target: "fbs::store", cycle, error = %err, "flush_sync_failed");
                return (indices, Err(FbsError::Io(err)));
            }
        }
        tracing::debug!(target: "fbs::store", cycle, blocks = batch.len(), "flush_cycle_done");
        (Vec::new(), Ok(()))
    }

    /// Number of [`flush`](Self::flush) calls waiting for a running cycle.
    #[must_use]
    pub fn flushes_waiting(&self) -> usize {
        self.state.lock().flush.waiting
    }

    pub(crate) fn mark_dirty(&self, index: BlockIndex) {
        self.state.lock().cache.mark_queued(index);
    }

    pub(crate) fn reacquire(&self, index: BlockIndex) {
        let cell = self.state.lock().cache.acquire(index);
        debug_assert!(cell.is_some(), "reacquire of non-resident block {index}");
    }

    pub(crate) fn release(&self, index: BlockIndex) {
        self.state.lock().cache.release(index);
    }

    /// Occupancy snapshot.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.state.lock().cache.stats()
    }

    /// Live references on `index`, `None` if it is not resident.
    #[must_use]
    pub fn ref_count(&self, index: BlockIndex) -> Option<u32> {
        self.state.lock().cache.ref_count(index)
    }

    #[must_use]
    pub fn is_cached(&self, index: BlockIndex) -> bool {
        self.state.lock().cache.contains(index)
    }
}

/// Completes a flush cycle: settles its blocks in the cache, clears the
/// running marker and wakes waiters.
///
/// If the cycle unwinds before [`finish`](Self::finish), dropping the guard
/// requeues every block and records the cycle as failed.
struct CycleGuard<'s, D: ByteDevice> {
    store: &'s BlockStore<D>,
    cycle: u64,
    written: Vec<BlockIndex>,
    finished: bool,
}

impl<D: ByteDevice> CycleGuard<'_, D> {
    fn finish(mut self, requeue: &[BlockIndex], failure: Option<String>) {
        let written = std::mem::take(&mut self.written);
        self.complete(&written, requeue, failure);
    }

    fn complete(&mut self, written: &[BlockIndex], requeue: &[BlockIndex], failure: Option<String>) {
        self.finished = true;
        let mut state = self.store.state.lock();
        state.cache.finish_write(written, requeue);
        state.cache.maintain();
        state.flush.running = None;
        if let Some(detail) = failure {
            state.flush.last_failure = Some((self.cycle, detail));
        }
        drop(state);
        self.store.flush_done.notify_all();
    }
}

impl<D: ByteDevice> Drop for CycleGuard<'_, D> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        tracing::error!(target: "fbs::store", cycle = self.cycle, "flush_cycle_panicked");
        let written = std::mem::take(&mut self.written);
        let detail = format!("flush cycle {} panicked", self.cycle);
        self.complete(&written, &written, Some(detail));
    }
}

/// Write one run of consecutive blocks with a single vectored request
/// (continued on short writes).
fn write_run<D: ByteDevice + ?Sized>(
    device: &D,
    run: &[(BlockIndex, Arc<BlockCell>)],
) -> Result<()> {
    let Some((start, _)) = run.first() else {
        return Ok(());
    };
    let offset = start
        .byte_offset()
        .ok_or_else(|| FbsError::OutOfRange(format!("block {start} offset")))?;
    let guards: Vec<_> = run.iter().map(|(_, cell)| cell.read()).collect();
    let bufs: Vec<&[u8]> = guards.iter().map(|guard| &**guard).collect();
    write_all_at(device, offset, &bufs).map_err(|source| FbsError::Write {
        start: start.0,
        count: run.len(),
        source,
    })
}

impl<D: ByteDevice> fmt::Debug for BlockStore<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open = match &*self.device.lock() {
            DeviceState::Unopened => "unopened",
            DeviceState::Open(_) => "open",
            DeviceState::Closed => "closed",
        };
        f.debug_struct("BlockStore")
            .field("config", &self.config)
            .field("device", &open)
            .field("cache", &self.cache_stats())
            .finish_non_exhaustive()
    }
}
