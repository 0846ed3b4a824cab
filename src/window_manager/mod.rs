mod slot_list;

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};
use try_lock::{Locked, TryLock};

use crate::error::ArenaError;
use crate::modules::backing_store::{BackingStoreModule, StoreError};
use crate::util::get_page_size;

use slot_list::{SlotList, NIL};

/// Number of entries to add when the segment map must grow.
const SEGMAP_INCR: usize = 16;

/// Whether window operations must synchronize with other threads.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessMode {
    /// Multiple threads may map and unmap concurrently.
    Concurrent,
    /// The caller guarantees single-threaded access, e.g. during a finalize
    /// pass after all workers have joined. The critical region is entered
    /// without waiting and contention is treated as a logic error.
    ExclusiveOwner,
}

struct WindowState {
    slots: SlotList,

    /// unused window descriptors, refilled by eviction
    free_slots: Vec<usize>,

    /// segment index -> slot index, `NIL` while the segment is not resident
    segment_map: Vec<usize>,

    /// cumulative number of OS mapping calls
    mapping_calls: usize,
}

// Window bases point into file-backed mappings owned by the manager and are
// not tied to the thread that created them.
unsafe impl Send for WindowState {}

/// Multiplexes the unbounded sequence of backing-store segments onto a
/// bounded pool of OS mappings, with reference counting and LRU eviction.
///
/// Offsets passed to [`map`](Self::map) and [`unmap`](Self::unmap) are
/// relative to the start of the segmented region.
pub(crate) struct WindowManager<B: BackingStoreModule> {
    store: Arc<B>,

    /// absolute byte offset of the first segment, page aligned
    first_segment_offset: u64,

    segment_size: usize,
    max_windows: usize,

    state: TryLock<WindowState>,
    exclusive: AtomicBool,
}

impl<B: BackingStoreModule> WindowManager<B> {
    pub(crate) fn new(
        store: Arc<B>,
        first_segment_offset: u64,
        segment_size: usize,
        segment_table_size: u64,
        max_windows: usize,
    ) -> Self {
        let page = get_page_size();
        assert_eq!(first_segment_offset % page as u64, 0);
        assert_eq!(segment_size % page, 0);
        assert!(max_windows >= 1);

        let segmap_len = (segment_table_size / segment_size as u64) as usize + 1;
        debug!(
            "window manager: segment size {}, pool limit {}, segment map sized for {} entries",
            segment_size, max_windows, segmap_len
        );

        Self {
            store,
            first_segment_offset,
            segment_size,
            max_windows,
            state: TryLock::new(WindowState {
                slots: SlotList::new(),
                free_slots: Vec::new(),
                segment_map: vec![NIL; segmap_len],
                mapping_calls: 0,
            }),
            exclusive: AtomicBool::new(false),
        }
    }

    /// Maps the segment containing `offset` and returns a pointer to the
    /// byte at `offset`, mapping or evicting as needed. Every successful
    /// call must be paired with an [`unmap`](Self::unmap) of the same
    /// offset.
    pub(crate) fn map(&self, offset: u64) -> Result<NonNull<u8>, ArenaError> {
        let segment = (offset / self.segment_size as u64) as usize;
        let in_segment = (offset % self.segment_size as u64) as usize;

        let mut state = self.lock();

        if segment >= state.segment_map.len() {
            let new_len = segment + SEGMAP_INCR;
            trace!(
                "growing segment map from {} to {} entries",
                state.segment_map.len(),
                new_len
            );
            state.segment_map.resize(new_len, NIL);
        }

        // resident fast path: revive the window from the LRU list when idle
        let slot_ix = state.segment_map[segment];
        if slot_ix != NIL {
            if state.slots.slot(slot_ix).refcnt == 0 {
                state.slots.unlink(slot_ix);
            }
            let slot = state.slots.slot_mut(slot_ix);
            slot.refcnt += 1;
            let base = slot.base.expect("resident window without a mapping");
            return Ok(unsafe { NonNull::new_unchecked(base.as_ptr().add(in_segment)) });
        }

        // find a descriptor: spare pool capacity first, then the oldest
        // idle window
        let slot_ix = if let Some(ix) = state.free_slots.pop() {
            ix
        } else if state.slots.len() < self.max_windows {
            state.slots.push_slot()
        } else if self.evict_oldest(&mut state) {
            state
                .free_slots
                .pop()
                .expect("eviction did not release a descriptor")
        } else {
            warn!(
                "all {} map windows in use, check virtual memory limits",
                self.max_windows
            );
            return Err(ArenaError::WindowsExhausted);
        };

        let segment_offset =
            self.first_segment_offset + segment as u64 * self.segment_size as u64;
        state.mapping_calls += 1;
        let base = match unsafe { self.store.map_region(segment_offset, self.segment_size) } {
            Ok(base) => base,
            Err(err) => {
                // memory pressure: retry exactly once after forcing an idle
                // window out
                let retry =
                    matches!(err, StoreError::OutOfMemory) && self.evict_oldest(&mut state);
                if !retry {
                    state.free_slots.push(slot_ix);
                    return Err(err.into());
                }

                warn!("window mapping failed under memory pressure, retrying after eviction");
                state.mapping_calls += 1;
                match unsafe { self.store.map_region(segment_offset, self.segment_size) } {
                    Ok(base) => base,
                    Err(err) => {
                        state.free_slots.push(slot_ix);
                        return Err(err.into());
                    }
                }
            }
        };

        let slot = state.slots.slot_mut(slot_ix);
        debug_assert_eq!(slot.refcnt, 0);
        slot.segment = segment;
        slot.base = Some(base);
        slot.refcnt = 1;
        state.segment_map[segment] = slot_ix;

        Ok(unsafe { NonNull::new_unchecked(base.as_ptr().add(in_segment)) })
    }

    /// Releases one reference on the window of the segment containing
    /// `offset`. At zero references the window moves to the LRU tail, so
    /// the least recently released window is always evicted first.
    pub(crate) fn unmap(&self, offset: u64, ptr: NonNull<u8>) {
        let segment = (offset / self.segment_size as u64) as usize;

        let mut state = self.lock();

        assert!(segment < state.segment_map.len());
        let slot_ix = state.segment_map[segment];
        assert_ne!(slot_ix, NIL, "unmap of segment {} which is not resident", segment);

        let slot = state.slots.slot_mut(slot_ix);
        let base = slot.base.expect("resident window without a mapping").as_ptr() as usize;
        let p = ptr.as_ptr() as usize;
        assert!(
            p >= base && p < base + self.segment_size,
            "pointer does not lie in the window of segment {}",
            segment
        );

        assert!(slot.refcnt > 0, "window reference count underflow");
        slot.refcnt -= 1;
        if slot.refcnt == 0 {
            state.slots.push_tail(slot_ix);
        }
    }

    /// Cumulative number of real OS mapping calls. Diagnostic only.
    pub(crate) fn mapping_count(&self) -> usize {
        self.lock().mapping_calls
    }

    /// Number of currently resident windows.
    pub(crate) fn resident_windows(&self) -> usize {
        let state = self.lock();
        state.slots.iter().filter(|slot| slot.base.is_some()).count()
    }

    /// Assumes it is called while no other thread touches this manager.
    pub(crate) fn set_access_mode(&self, mode: AccessMode) {
        self.exclusive
            .store(matches!(mode, AccessMode::ExclusiveOwner), Ordering::Relaxed);
    }

    /// Unmaps the least recently idled window and gives its descriptor
    /// back. Returns `false` when no window is idle.
    fn evict_oldest(&self, state: &mut WindowState) -> bool {
        let victim = match state.slots.pop_head() {
            Some(victim) => victim,
            None => return false,
        };

        let slot = state.slots.slot_mut(victim);
        debug_assert_eq!(slot.refcnt, 0);
        let base = slot.base.take().expect("idle window without a mapping");
        let segment = slot.segment;
        trace!("evicting idle window of segment {}", segment);

        state.segment_map[segment] = NIL;
        unsafe { self.store.unmap_region(base, self.segment_size) };
        state.free_slots.push(victim);

        true
    }

    fn lock(&self) -> Locked<'_, WindowState> {
        if self.exclusive.load(Ordering::Relaxed) {
            // the caller promised exclusive access, contention is a logic
            // error
            self.state
                .try_lock()
                .expect("window state contended in exclusive-owner mode")
        } else {
            loop {
                if let Some(state) = self.state.try_lock() {
                    return state;
                }
                core::hint::spin_loop();
            }
        }
    }
}

impl<B: BackingStoreModule> Drop for WindowManager<B> {
    fn drop(&mut self) {
        let mut state = self.lock();
        for ix in 0..state.slots.len() {
            let slot = state.slots.slot_mut(ix);
            if let Some(base) = slot.base.take() {
                unsafe { self.store.unmap_region(base, self.segment_size) };
            }
        }
    }
}
