//! Generational cache bookkeeping.
//!
//! Every resident block has an [`Entry`] in the map. Entries nobody holds a
//! reference to live in one of two dense generation lists, "young" and
//! "old". Each entry remembers which physical list it is in and at which
//! position, so removal is a swap with the list's last element plus one
//! position update.
//!
//! The two lists are addressed through a role index. Demoting the whole
//! young generation is a flip of that index: entries keep pointing at their
//! physical list, which simply changes role.
//!
//! Transitions: pinned → young (last release), young/old → pinned
//! (acquire), young → old (generation swap), old → evicted. Nothing is
//! evicted from young directly.

use fbs_types::BlockIndex;
use parking_lot::{
    Condvar, MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};
use std::any::Any;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

/// Value a caller hangs off a resident block.
pub(crate) type Attachment = Arc<dyn Any + Send + Sync>;

/// Buffer of one cached block, shared between the map and live handles.
///
/// Empty while the block's load is in flight. The attachment goes away
/// with the cell when the block is evicted.
#[derive(Debug, Default)]
pub(crate) struct BlockCell {
    data: RwLock<Vec<u8>>,
    attachment: Mutex<Option<Attachment>>,
}

impl BlockCell {
    pub(crate) fn fill(&self, bytes: Vec<u8>) {
        *self.data.write() = bytes;
    }

    pub(crate) fn read(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.data.read(), Vec::as_slice)
    }

    pub(crate) fn write(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        RwLockWriteGuard::map(self.data.write(), Vec::as_mut_slice)
    }

    pub(crate) fn set_attachment(&self, value: Attachment) -> Option<Attachment> {
        self.attachment.lock().replace(value)
    }

    pub(crate) fn attachment(&self) -> Option<Attachment> {
        self.attachment.lock().clone()
    }

    pub(crate) fn clear_attachment(&self) -> Option<Attachment> {
        self.attachment.lock().take()
    }
}

/// A read in flight, shared by every block of its run.
///
/// Requesters that find a block still loading wait here instead of issuing
/// their own read.
#[derive(Debug, Default)]
pub(crate) struct PendingLoad {
    outcome: Mutex<Option<Result<(), String>>>,
    done: Condvar,
}

impl PendingLoad {
    pub(crate) fn complete(&self, outcome: Result<(), String>) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    /// Block until the load finishes; `Err` carries the failure text.
    pub(crate) fn wait(&self) -> Result<(), String> {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            self.done.wait(&mut outcome);
        }
    }
}

/// Physical list and position of an unpinned entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    list: usize,
    pos: usize,
}

#[derive(Debug)]
struct Entry {
    cell: Arc<BlockCell>,
    refs: u32,
    slot: Option<Slot>,
    /// In the pending flush queue.
    queued: bool,
    /// Taken by the running flush cycle, write not finished yet.
    writing: bool,
    loading: Option<Arc<PendingLoad>>,
}

impl Entry {
    fn new(cell: Arc<BlockCell>, loading: Arc<PendingLoad>) -> Self {
        Self {
            cell,
            refs: 0,
            slot: None,
            queued: false,
            writing: false,
            loading: Some(loading),
        }
    }

    fn evictable(&self) -> bool {
        self.refs == 0 && !self.queued && !self.writing && self.loading.is_none()
    }
}

/// Result of looking an index up.
#[derive(Debug)]
pub(crate) enum Lookup {
    Missing,
    Loading(Arc<PendingLoad>),
    Ready,
}

/// Snapshot of cache occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries in the map.
    pub resident: usize,
    /// Entries with at least one reference.
    pub pinned: usize,
    /// Unpinned entries in the young generation.
    pub young: usize,
    /// Unpinned entries in the old generation.
    pub old: usize,
    /// Entries waiting in the flush queue.
    pub queued: usize,
    /// Entries evicted since the store was created.
    pub evictions: u64,
}

#[derive(Debug)]
pub(crate) struct CacheState {
    max_cache: usize,
    entries: HashMap<BlockIndex, Entry>,
    lists: [Vec<BlockIndex>; 2],
    /// Physical index of the young list; the other one is old.
    young: usize,
    queue: Vec<BlockIndex>,
    evictions: u64,
}

impl CacheState {
    pub(crate) fn new(max_cache: usize) -> Self {
        Self {
            max_cache,
            entries: HashMap::new(),
            lists: [Vec::new(), Vec::new()],
            young: 0,
            queue: Vec::new(),
            evictions: 0,
        }
    }

    fn old(&self) -> usize {
        1 - self.young
    }

    pub(crate) fn contains(&self, index: BlockIndex) -> bool {
        self.entries.contains_key(&index)
    }

    pub(crate) fn lookup(&self, index: BlockIndex) -> Lookup {
        match self.entries.get(&index) {
            None => Lookup::Missing,
            Some(Entry {
                loading: Some(pending),
                ..
            }) => Lookup::Loading(Arc::clone(pending)),
            Some(_) => Lookup::Ready,
        }
    }

    #[must_use]
    pub(crate) fn ref_count(&self, index: BlockIndex) -> Option<u32> {
        self.entries.get(&index).map(|entry| entry.refs)
    }

    pub(crate) fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            resident: self.entries.len(),
            pinned: self.entries.values().filter(|entry| entry.refs > 0).count(),
            young: self.lists[self.young].len(),
            old: self.lists[self.old()].len(),
            queued: self.queue.len(),
            evictions: self.evictions,
        }
    }

    fn attach(&mut self, index: BlockIndex) {
        let list = self.young;
        let pos = self.lists[list].len();
        self.lists[list].push(index);
        if let Some(entry) = self.entries.get_mut(&index) {
            entry.slot = Some(Slot { list, pos });
        }
    }

    /// Swap-remove position `pos` of physical list `list`.
    fn detach_at(&mut self, list: usize, pos: usize) -> BlockIndex {
        let index = self.lists[list].swap_remove(pos);
        if let Some(moved) = self.lists[list].get(pos).copied() {
            if let Some(entry) = self.entries.get_mut(&moved) {
                entry.slot = Some(Slot { list, pos });
            }
        }
        if let Some(entry) = self.entries.get_mut(&index) {
            entry.slot = None;
        }
        index
    }

    fn detach(&mut self, index: BlockIndex) {
        if let Some(slot) = self.entries.get(&index).and_then(|entry| entry.slot) {
            let _ = self.detach_at(slot.list, slot.pos);
        }
    }

    /// Register a run member the caller will hold a reference to.
    pub(crate) fn insert_pinned(
        &mut self,
        index: BlockIndex,
        cell: Arc<BlockCell>,
        loading: Arc<PendingLoad>,
    ) {
        let mut entry = Entry::new(cell, loading);
        entry.refs = 1;
        self.entries.insert(index, entry);
    }

    /// Register a prefetched run member: unreferenced, straight into young.
    pub(crate) fn insert_idle(
        &mut self,
        index: BlockIndex,
        cell: Arc<BlockCell>,
        loading: Arc<PendingLoad>,
    ) {
        self.entries.insert(index, Entry::new(cell, loading));
        self.attach(index);
        self.maintain();
    }

    /// Take a reference on a resident, loaded entry.
    pub(crate) fn acquire(&mut self, index: BlockIndex) -> Option<Arc<BlockCell>> {
        let entry = self.entries.get_mut(&index)?;
        entry.refs += 1;
        let cell = Arc::clone(&entry.cell);
        if entry.refs == 1 {
            self.detach(index);
        }
        Some(cell)
    }

    /// Drop a reference; the last one moves the entry to the young tail.
    pub(crate) fn release(&mut self, index: BlockIndex) {
        let Some(entry) = self.entries.get_mut(&index) else {
            debug_assert!(false, "release of non-resident block {index}");
            return;
        };
        debug_assert!(entry.refs > 0, "release of unpinned block {index}");
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            self.attach(index);
            self.maintain();
        }
    }

    /// Queue an entry for the next flush cycle. Idempotent.
    pub(crate) fn mark_queued(&mut self, index: BlockIndex) {
        if let Some(entry) = self.entries.get_mut(&index) {
            if !entry.queued {
                entry.queued = true;
                self.queue.push(index);
            }
        }
    }

    /// Take the whole flush queue, sorted by index, and mark it writing.
    pub(crate) fn take_queue(&mut self) -> Vec<(BlockIndex, Arc<BlockCell>)> {
        let queued = std::mem::take(&mut self.queue);
        let mut taken = Vec::with_capacity(queued.len());
        for index in queued {
            if let Some(entry) = self.entries.get_mut(&index) {
                entry.queued = false;
                entry.writing = true;
                taken.push((index, Arc::clone(&entry.cell)));
            }
        }
        taken.sort_unstable_by_key(|(index, _)| *index);
        taken
    }

    /// Clear the writing mark; `requeue` goes back into the flush queue.
    pub(crate) fn finish_write(&mut self, written: &[BlockIndex], requeue: &[BlockIndex]) {
        for index in written {
            if let Some(entry) = self.entries.get_mut(index) {
                entry.writing = false;
            }
        }
        for index in requeue {
            self.mark_queued(*index);
        }
    }

    /// Clear the in-flight marker on every run member still tagged with `load`.
    pub(crate) fn finish_load(&mut self, run: Range<u64>, load: &Arc<PendingLoad>) {
        for raw in run {
            if let Some(entry) = self.entries.get_mut(&BlockIndex(raw)) {
                if entry
                    .loading
                    .as_ref()
                    .is_some_and(|pending| Arc::ptr_eq(pending, load))
                {
                    entry.loading = None;
                }
            }
        }
    }

    /// Forget every run member still tagged with the failed `load`.
    pub(crate) fn abort_load(&mut self, run: Range<u64>, load: &Arc<PendingLoad>) {
        for raw in run {
            let index = BlockIndex(raw);
            let owned = self.entries.get(&index).is_some_and(|entry| {
                entry
                    .loading
                    .as_ref()
                    .is_some_and(|pending| Arc::ptr_eq(pending, load))
            });
            if owned {
                self.detach(index);
                let _ = self.entries.remove(&index);
            }
        }
    }

    /// One maintenance pass: demote young wholesale when old has drained,
    /// otherwise evict at most one old entry once over capacity.
    pub(crate) fn maintain(&mut self) {
        let young = self.young;
        let old = self.old();
        if self.lists[old].is_empty() && self.lists[young].len() > self.max_cache / 2 {
            self.young = old;
            tracing::trace!(
                target: "fbs::cache",
                demoted = self.lists[young].len(),
                "generation_swap"
            );
            return;
        }

        if self.lists[young].len() + self.lists[old].len() < self.max_cache {
            return;
        }

        let victim = self.lists[old].iter().position(|index| {
            self.entries
                .get(index)
                .is_some_and(Entry::evictable)
        });
        if let Some(pos) = victim {
            let index = self.detach_at(old, pos);
            let _ = self.entries.remove(&index);
            self.evictions += 1;
            tracing::trace!(target: "fbs::cache", block = index.0, "block_evicted");
        }
    }

    /// Verify the structural invariants; panics on violation.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let mut unpinned = 0;
        for (list_id, list) in self.lists.iter().enumerate() {
            for (pos, index) in list.iter().enumerate() {
                let entry = self.entries.get(index).expect("listed entry is resident");
                assert_eq!(entry.refs, 0, "listed entry {index} is pinned");
                assert_eq!(entry.slot, Some(Slot { list: list_id, pos }));
                unpinned += 1;
            }
        }
        let pinned = self.entries.values().filter(|e| e.refs > 0).count();
        for entry in self.entries.values() {
            assert_eq!(entry.refs > 0, entry.slot.is_none());
        }
        assert_eq!(unpinned + pinned, self.entries.len());
        for index in &self.queue {
            assert!(self.entries.get(index).is_some_and(|e| e.queued));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn loaded(state: &mut CacheState, index: u64, pinned: bool) {
        let pending = Arc::new(PendingLoad::default());
        let cell = Arc::new(BlockCell::default());
        if pinned {
            state.insert_pinned(BlockIndex(index), cell, Arc::clone(&pending));
        } else {
            state.insert_idle(BlockIndex(index), cell, Arc::clone(&pending));
        }
        state.finish_load(index..index + 1, &pending);
    }

    #[test]
    fn release_moves_to_young_and_acquire_detaches() {
        let mut state = CacheState::new(128);
        loaded(&mut state, 1, true);
        assert_eq!(state.stats().pinned, 1);
        assert_eq!(state.stats().young, 0);

        state.release(BlockIndex(1));
        assert_eq!(state.ref_count(BlockIndex(1)), Some(0));
        assert_eq!(state.stats().young, 1);

        assert!(state.acquire(BlockIndex(1)).is_some());
        assert_eq!(state.ref_count(BlockIndex(1)), Some(1));
        assert_eq!(state.stats().young, 0);
        state.assert_consistent();
    }

    #[test]
    fn swap_remove_updates_moved_position() {
        let mut state = CacheState::new(128);
        for i in 0..4 {
            loaded(&mut state, i, false);
        }
        // young = [0, 1, 2, 3]; pin 1 so 3 moves into its slot.
        assert!(state.acquire(BlockIndex(1)).is_some());
        assert_eq!(state.lists[state.young], vec![
            BlockIndex(0),
            BlockIndex(3),
            BlockIndex(2)
        ]);
        state.assert_consistent();

        // Removing the moved element must hit the right slot.
        assert!(state.acquire(BlockIndex(3)).is_some());
        assert_eq!(state.lists[state.young], vec![BlockIndex(0), BlockIndex(2)]);
        state.assert_consistent();
    }

    #[test]
    fn young_is_demoted_once_over_half_capacity() {
        let mut state = CacheState::new(4);
        loaded(&mut state, 0, false);
        loaded(&mut state, 1, false);
        assert_eq!(state.stats().young, 2);
        assert_eq!(state.stats().old, 0);

        loaded(&mut state, 2, false);
        assert_eq!(state.stats().young, 0);
        assert_eq!(state.stats().old, 3);
        state.assert_consistent();
    }

    #[test]
    fn eviction_only_takes_from_old() {
        let mut state = CacheState::new(4);
        for i in 0..3 {
            loaded(&mut state, i, false);
        }
        // old = {0,1,2}, young empty.
        loaded(&mut state, 3, false);
        // combined 4 >= 4: one old entry evicted.
        let stats = state.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.young, 1);
        assert_eq!(stats.old, 2);
        assert!(state.contains(BlockIndex(3)), "young entry survives");
        assert!(!state.contains(BlockIndex(0)));
        state.assert_consistent();
    }

    #[test]
    fn queued_and_writing_entries_are_never_evicted() {
        let mut state = CacheState::new(1);
        loaded(&mut state, 0, true);
        state.mark_queued(BlockIndex(0));
        state.mark_queued(BlockIndex(0));
        assert_eq!(state.queued_len(), 1);
        state.release(BlockIndex(0));
        // Demoted to old on release.
        assert_eq!(state.stats().old, 1);

        for i in 1..20 {
            loaded(&mut state, i, true);
            state.release(BlockIndex(i));
            assert!(state.contains(BlockIndex(0)), "queued block evicted at {i}");
        }

        let taken = state.take_queue();
        assert_eq!(taken.len(), 1);
        for i in 20..40 {
            loaded(&mut state, i, true);
            state.release(BlockIndex(i));
            assert!(state.contains(BlockIndex(0)), "writing block evicted at {i}");
        }

        state.finish_write(&[BlockIndex(0)], &[]);
        for i in 40..80 {
            loaded(&mut state, i, true);
            state.release(BlockIndex(i));
        }
        assert!(!state.contains(BlockIndex(0)));
        state.assert_consistent();
    }

    #[test]
    fn loading_entries_are_never_evicted() {
        let mut state = CacheState::new(0);
        let pending = Arc::new(PendingLoad::default());
        state.insert_idle(
            BlockIndex(9),
            Arc::new(BlockCell::default()),
            Arc::clone(&pending),
        );
        for _ in 0..4 {
            state.maintain();
        }
        assert!(state.contains(BlockIndex(9)));
        state.finish_load(9..10, &pending);
        state.maintain();
        state.maintain();
        assert!(!state.contains(BlockIndex(9)));
    }

    #[test]
    fn abort_load_forgets_only_its_own_run() {
        let mut state = CacheState::new(128);
        loaded(&mut state, 4, false);
        let pending = Arc::new(PendingLoad::default());
        state.insert_idle(BlockIndex(5), Arc::new(BlockCell::default()), Arc::clone(&pending));
        state.insert_pinned(BlockIndex(6), Arc::new(BlockCell::default()), Arc::clone(&pending));
        state.abort_load(4..7, &pending);
        assert!(state.contains(BlockIndex(4)));
        assert!(!state.contains(BlockIndex(5)));
        assert!(!state.contains(BlockIndex(6)));
        state.assert_consistent();
    }

    #[test]
    fn finish_write_requeues_failed_blocks() {
        let mut state = CacheState::new(128);
        loaded(&mut state, 1, true);
        loaded(&mut state, 2, true);
        state.mark_queued(BlockIndex(2));
        state.mark_queued(BlockIndex(1));
        let taken = state.take_queue();
        let order: Vec<_> = taken.iter().map(|(index, _)| *index).collect();
        assert_eq!(order, vec![BlockIndex(1), BlockIndex(2)]);
        assert_eq!(state.queued_len(), 0);

        state.finish_write(&order, &[BlockIndex(2)]);
        assert_eq!(state.queued_len(), 1);
        state.assert_consistent();
    }

    #[test]
    fn pending_load_wakes_waiters() {
        let pending = Arc::new(PendingLoad::default());
        std::thread::scope(|s| {
            let waiter = s.spawn(|| pending.wait());
            pending.complete(Err("boom".to_owned()));
            assert_eq!(waiter.join().unwrap(), Err("boom".to_owned()));
        });
    }

    #[derive(Debug, Clone)]
    enum Op {
        Get(u8),
        Release(usize),
        Dirty(usize),
        Flush,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0_u8..48).prop_map(Op::Get),
            (0_usize..64).prop_map(Op::Release),
            (0_usize..64).prop_map(Op::Dirty),
            Just(Op::Flush),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn random_workloads_preserve_invariants(
            max_cache in 0_usize..12,
            ops in proptest::collection::vec(op_strategy(), 1..200),
        ) {
            let mut state = CacheState::new(max_cache);
            let mut held: Vec<BlockIndex> = Vec::new();
            let mut dirty: Vec<BlockIndex> = Vec::new();

            for op in ops {
                match op {
                    Op::Get(raw) => {
                        let index = BlockIndex(u64::from(raw));
                        if state.contains(index) {
                            prop_assert!(state.acquire(index).is_some());
                        } else {
                            state.maintain();
                            loaded(&mut state, index.0, true);
                        }
                        held.push(index);
                    }
                    Op::Release(pick) => {
                        if !held.is_empty() {
                            let index = held.swap_remove(pick % held.len());
                            state.release(index);
                        }
                    }
                    Op::Dirty(pick) => {
                        if !held.is_empty() {
                            let index = held[pick % held.len()];
                            state.mark_queued(index);
                            dirty.push(index);
                        }
                    }
                    Op::Flush => {
                        let taken: Vec<_> =
                            state.take_queue().into_iter().map(|(index, _)| index).collect();
                        state.finish_write(&taken, &[]);
                        dirty.clear();
                    }
                }
                state.assert_consistent();
                for index in &dirty {
                    prop_assert!(state.contains(*index), "dirty block {} evicted", index);
                }
                for index in &held {
                    prop_assert!(state.contains(*index), "pinned block {} evicted", index);
                }
            }

            for index in held.drain(..) {
                state.release(index);
            }
            let taken: Vec<_> = state.take_queue().into_iter().map(|(index, _)| index).collect();
            state.finish_write(&taken, &[]);
            // Each pass evicts one entry or swaps generations once.
            for _ in 0..state.stats().resident + 2 {
                state.maintain();
            }
            let stats = state.stats();
            prop_assert!(stats.young + stats.old <= max_cache);
        }
    }
}
