use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};
use try_lock::{Locked, TryLock};

use crate::arena_config::{ArenaConfig, SegmentSizing};
use crate::error::ArenaError;
use crate::header::ArenaHeader;
use crate::modules::backing_store::BackingStoreModule;
use crate::node_guard::NodeGuard;
use crate::node_handle::{
    housekeeping_generation, housekeeping_tag, pack_housekeeping, NodeHandle, NodeIndex,
    CHECKED_INDEX_MAX, NODE_INDEX_NULL, TAG_ALLOCATED, TAG_FREE, UNCHECKED_INDEX_MAX,
};
use crate::util::{align_up, ceil_div, get_page_size};
use crate::window_manager::{AccessMode, WindowManager};

/// Hard cap on the window pool chosen by the sizing heuristic.
const MAX_WINDOWS: u64 = 20;

/// Lower bound on the pool: references can be held on more than one window
/// at the same time.
const MIN_WINDOWS: u64 = 4;

/// Scales the segment table estimate upward, since the entry count cannot
/// anticipate hard links.
const HARDLINK_FUDGE: f64 = 1.2;

/// How many virgin nodes to place on the free list per refill.
const VIRGIN_BATCH_MAX: u64 = 8192;

/// Point-in-time accounting of an arena. `free_nodes` walks the whole free
/// list, so this is a diagnostic, not a fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// segments holding at least one materialized node
    pub materialized_segments: u64,

    /// nodes that have been placed on the free list so far, whether they
    /// are currently allocated or free
    pub materialized_nodes: u64,

    /// current length of the free list
    pub free_nodes: u64,

    /// materialized nodes currently allocated
    pub allocated_nodes: u64,

    /// windows currently resident
    pub resident_windows: usize,

    /// cumulative number of OS mapping calls
    pub mapping_calls: usize,
}

/// Fixed-size node allocator over a segmented, disk-backed arena.
///
/// Nodes are addressed by handles, accessed through short-lived
/// [`NodeGuard`] mappings and reclaimed through a free list threaded
/// through the node bodies themselves. All sizing and free-list state is
/// persisted in a header page, so a later pass can [`reattach`]
/// (Self::reattach) to the same backing store.
pub struct NodeArena<B: BackingStoreModule> {
    store: Arc<B>,
    windows: WindowManager<B>,

    /// the mapped header page; stays mapped for the arena's lifetime
    header: NonNull<ArenaHeader>,
    header_page: usize,

    /// serializes free-list and frontier updates. Lock order: this lock is
    /// always acquired before the window lock, never the other way around.
    alloc_lock: TryLock<()>,
    exclusive: AtomicBool,

    /// frontier position (total materialized nodes), mirrored so `map` can
    /// bounds-check a handle without taking `alloc_lock`. Written only
    /// while `alloc_lock` is held.
    materialized: AtomicU64,

    /// cached from the header, hot on every handle decode
    generation_check: bool,
}

// The header points into a shared file mapping owned by this arena. Its
// persistent fields are only written under `alloc_lock`; the sizing fields
// read elsewhere never change after construction. Paths that run without
// `alloc_lock` read the frontier through the `materialized` mirror, never
// through the header.
unsafe impl<B: BackingStoreModule + Send + Sync> Send for NodeArena<B> {}
unsafe impl<B: BackingStoreModule + Send + Sync> Sync for NodeArena<B> {}

impl<B: BackingStoreModule> NodeArena<B> {
    /// Creates the persistent layout at `header_offset` in `store` (one
    /// header page followed by the segmented region) and returns an arena
    /// over it. The first segment is pre-grown.
    pub fn initialize(store: B, header_offset: u64, config: ArenaConfig) -> Result<Self, ArenaError> {
        let page = get_page_size();
        assert_eq!(header_offset % page as u64, 0);
        assert!(config.alignment.is_power_of_two());
        assert!(
            config.node_size >= size_of::<u64>() + 1,
            "node too small for free-list linkage and housekeeping"
        );
        assert!(
            config.housekeeping_offset >= size_of::<u64>(),
            "housekeeping byte overlaps the free-list linkage"
        );
        assert!(config.housekeeping_offset < config.node_size);

        let node_size = align_up(config.node_size, config.alignment) as u64;

        let (segment_size, segment_table_size, max_windows) = match config.sizing {
            SegmentSizing::Auto {
                vm_budget,
                estimated_entries,
            } => {
                let segment_table_size =
                    (HARDLINK_FUDGE * estimated_entries as f64) as u64 * node_size;

                // the segment must stay a multiple of both the page size
                // and the node size
                let min_segment = page as u64 * node_size;
                let window_mem = vm_budget.min(segment_table_size);
                let segment_size =
                    (ceil_div(window_mem / MAX_WINDOWS, min_segment) * min_segment).max(min_segment);

                let max_windows = (vm_budget / segment_size).min(MAX_WINDOWS).max(MIN_WINDOWS);

                (segment_size, segment_table_size, max_windows)
            }
            SegmentSizing::Explicit {
                segment_size,
                max_windows,
            } => {
                let segment_size = segment_size as u64;
                assert_eq!(segment_size % page as u64, 0);
                assert_eq!(segment_size % node_size, 0);
                assert!(max_windows >= 1);

                (segment_size, segment_size * max_windows as u64, max_windows as u64)
            }
        };

        let nodes_per_segment = segment_size / node_size;
        let first_segment_offset = header_offset + page as u64;

        // map the header page and write the persistent context
        let header = unsafe { store.map_region(header_offset, page)? }.cast::<ArenaHeader>();
        unsafe {
            header.as_ptr().write(ArenaHeader {
                node_size,
                housekeeping_offset: config.housekeeping_offset as u64,
                nodes_per_segment,
                segment_size,
                segment_table_size,
                max_windows,
                alignment: config.alignment as u64,
                generation_check: config.generation_check as u64,
                free_head: NODE_INDEX_NULL,
                first_segment_offset,
                virgin_segment_offset: 0,
                virgin_node_index: 0,
            });
        }

        debug!(
            "pre-growing first node segment at {} size {}",
            first_segment_offset, segment_size
        );
        store.grow_to(first_segment_offset + segment_size)?;

        let store = Arc::new(store);
        let windows = WindowManager::new(
            store.clone(),
            first_segment_offset,
            segment_size as usize,
            segment_table_size,
            max_windows as usize,
        );

        debug!(
            "node arena initialized: node size {}, {} nodes per segment, segment size {}, \
             table estimate {}, window budget {}",
            node_size, nodes_per_segment, segment_size, segment_table_size, max_windows
        );

        Ok(Self {
            store,
            windows,
            header,
            header_page: page,
            alloc_lock: TryLock::new(()),
            exclusive: AtomicBool::new(false),
            materialized: AtomicU64::new(0),
            generation_check: config.generation_check,
        })
    }

    /// Reattaches to a backing store laid out by an earlier
    /// [`initialize`](Self::initialize), re-reading the persisted sizing
    /// and free-list state instead of recomputing anything.
    pub fn reattach(store: B, header_offset: u64) -> Result<Self, ArenaError> {
        let page = get_page_size();
        assert_eq!(header_offset % page as u64, 0);

        let header = unsafe { store.map_region(header_offset, page)? }.cast::<ArenaHeader>();
        let (first_segment_offset, segment_size, segment_table_size, max_windows, generation_check, materialized) = {
            let hdr = unsafe { header.as_ref() };
            assert!(
                hdr.node_size > 0 && hdr.segment_size > 0,
                "reattach to an uninitialized header"
            );
            (
                hdr.first_segment_offset,
                hdr.segment_size,
                hdr.segment_table_size,
                hdr.max_windows,
                hdr.generation_check != 0,
                hdr.virgin_segment_offset / hdr.node_size + hdr.virgin_node_index,
            )
        };

        let store = Arc::new(store);
        let windows = WindowManager::new(
            store.clone(),
            first_segment_offset,
            segment_size as usize,
            segment_table_size,
            max_windows as usize,
        );

        debug!(
            "node arena reattached: segment size {}, window budget {}",
            segment_size, max_windows
        );

        Ok(Self {
            store,
            windows,
            header,
            header_page: page,
            alloc_lock: TryLock::new(()),
            exclusive: AtomicBool::new(false),
            materialized: AtomicU64::new(materialized),
            generation_check,
        })
    }

    /// Allocates a node and returns its handle. The node's bytes are
    /// zeroed and its generation is bumped.
    ///
    /// Fails when the backing store cannot grow or no window can be
    /// mapped; the free list is left untouched in that case.
    pub fn allocate(&self) -> Result<NodeHandle, ArenaError> {
        let _alloc = self.lock_alloc();

        if self.hdr().free_head == NODE_INDEX_NULL {
            self.refill_free_list()?;
        }

        let nix = self.hdr().free_head;
        debug_assert_ne!(nix, NODE_INDEX_NULL);
        let node_size = self.hdr().node_size;
        let hk_offset = self.hdr().housekeeping_offset as usize;

        let node = self.windows.map(nix * node_size)?;
        let handle = unsafe {
            let p = node.as_ptr();

            let hk = p.add(hk_offset).read();
            match housekeeping_tag(hk) {
                TAG_FREE => {}
                TAG_ALLOCATED => panic!("allocating node {} which is already allocated", nix),
                tag => panic!("node {} housekeeping corrupted (tag {:#x})", nix, tag),
            }

            // follow the linkage to the new head, then claim the node
            let next = (p as *const u64).read_unaligned();
            (*self.header.as_ptr()).free_head = next;

            core::ptr::write_bytes(p, 0, node_size as usize);

            let generation = (housekeeping_generation(hk) + 1) & 0xf;
            p.add(hk_offset)
                .write(pack_housekeeping(generation, TAG_ALLOCATED));

            if self.generation_check {
                assert!(nix <= CHECKED_INDEX_MAX);
                NodeHandle::checked(generation, nix)
            } else {
                assert!(nix <= UNCHECKED_INDEX_MAX);
                NodeHandle::unchecked(nix)
            }
        };
        self.windows.unmap(nix * node_size, node);

        trace!("allocated node {}", nix);
        Ok(handle)
    }

    /// Maps the node referenced by `handle` and returns a guard over its
    /// bytes. Fails with [`ArenaError::StaleHandle`] when the handle refers
    /// to a freed node, a reused node (generation checking enabled) or an
    /// out-of-range index.
    pub fn map(&self, handle: NodeHandle) -> Result<NodeGuard<'_, B>, ArenaError> {
        let node = self.map_verified(handle, TAG_ALLOCATED)?;

        Ok(NodeGuard::new(self, handle, node, self.hdr().node_size as usize))
    }

    /// Frees the node and invalidates the caller's handle in place. The
    /// node goes to the head of the free list, so it is the first one
    /// handed out again.
    pub fn free(&self, handle: &mut NodeHandle) -> Result<(), ArenaError> {
        let nh = *handle;
        assert!(!nh.is_null());

        let _alloc = self.lock_alloc();

        let (nix, _) = self.decode(nh);
        let node = match self.map_verified(nh, TAG_ALLOCATED) {
            Ok(node) => node,
            Err(err) => {
                *handle = NodeHandle::NULL;
                return Err(err);
            }
        };

        let node_size = self.hdr().node_size;
        let hk_offset = self.hdr().housekeeping_offset as usize;
        unsafe {
            let p = node.as_ptr();

            let hk = p.add(hk_offset).read();
            p.add(hk_offset)
                .write(pack_housekeeping(housekeeping_generation(hk), TAG_FREE));

            (p as *mut u64).write_unaligned(self.hdr().free_head);
            (*self.header.as_ptr()).free_head = nix;
        }
        self.windows.unmap(nix * node_size, node);

        trace!("freed node {}", nix);
        *handle = NodeHandle::NULL;
        Ok(())
    }

    /// Point-in-time accounting; walks the free list.
    pub fn stats(&self) -> Result<ArenaStats, ArenaError> {
        let _alloc = self.lock_alloc();

        let node_size = self.hdr().node_size;
        let hk_offset = self.hdr().housekeeping_offset as usize;
        let materialized_nodes = self.materialized_nodes();

        let mut free_nodes = 0;
        let mut nix = self.hdr().free_head;
        while nix != NODE_INDEX_NULL {
            let node = self.windows.map(nix * node_size)?;
            let next = unsafe { (node.as_ptr() as *const u64).read_unaligned() };
            debug_assert_eq!(
                housekeeping_tag(unsafe { node.as_ptr().add(hk_offset).read() }),
                TAG_FREE
            );
            self.windows.unmap(nix * node_size, node);

            free_nodes += 1;
            nix = next;
        }

        Ok(ArenaStats {
            materialized_segments: ceil_div(materialized_nodes, self.hdr().nodes_per_segment),
            materialized_nodes,
            free_nodes,
            allocated_nodes: materialized_nodes - free_nodes,
            resident_windows: self.windows.resident_windows(),
            mapping_calls: self.windows.mapping_count(),
        })
    }

    /// Cumulative number of real OS mapping calls. Diagnostic only.
    pub fn mapping_count(&self) -> usize {
        self.windows.mapping_count()
    }

    /// Number of currently resident windows.
    pub fn resident_windows(&self) -> usize {
        self.windows.resident_windows()
    }

    /// Internal node size, the caller's size padded to the alignment.
    pub fn node_size(&self) -> usize {
        self.hdr().node_size as usize
    }

    /// Toggles locking of the arena and its window pool.
    ///
    /// Assumes it is called while no other thread touches this arena.
    pub fn set_access_mode(&self, mode: AccessMode) {
        self.exclusive
            .store(matches!(mode, AccessMode::ExclusiveOwner), Ordering::Relaxed);
        self.windows.set_access_mode(mode);
    }

    /// Materializes a batch of virgin nodes: threads them into a chain,
    /// each tagged free and with its generation seeded from its index, and
    /// splices the chain onto the free-list head. Advances the frontier,
    /// eagerly growing the backing file when the frontier steps into the
    /// next segment.
    ///
    /// Must be called with `alloc_lock` held.
    fn refill_free_list(&self) -> Result<(), ArenaError> {
        let (node_size, nodes_per_segment, segment_size, hk_offset) = {
            let hdr = self.hdr();
            (
                hdr.node_size,
                hdr.nodes_per_segment,
                hdr.segment_size,
                hdr.housekeeping_offset as usize,
            )
        };

        debug_assert!(self.hdr().virgin_node_index < nodes_per_segment);
        let begin = self.hdr().virgin_segment_offset / node_size + self.hdr().virgin_node_index;
        let end = (self.hdr().virgin_segment_offset + segment_size) / node_size;
        debug_assert!(end > begin);
        let batch = VIRGIN_BATCH_MAX.min(end - begin);
        trace!("materializing {} virgin nodes starting at {}", batch, begin);

        let window = self.windows.map(begin * node_size)?;
        unsafe {
            let mut p = window.as_ptr();
            for nix in begin..begin + batch - 1 {
                (p as *mut u64).write_unaligned(nix + 1);
                p.add(hk_offset)
                    .write(pack_housekeeping(nix as u8 & 0xf, TAG_FREE));
                p = p.add(node_size as usize);
            }
            let last = begin + batch - 1;
            (p as *mut u64).write_unaligned(self.hdr().free_head);
            p.add(hk_offset)
                .write(pack_housekeeping(last as u8 & 0xf, TAG_FREE));

            let hdr = self.header.as_ptr();
            (*hdr).free_head = begin;
            (*hdr).virgin_node_index += batch;
        }
        self.materialized
            .store(self.materialized_nodes(), Ordering::Release);
        self.windows.unmap(begin * node_size, window);

        // frontier reached the segment's end: step into the next segment
        // and pre-grow the backing file for it
        if self.hdr().virgin_node_index >= nodes_per_segment {
            debug_assert_eq!(self.hdr().virgin_node_index, nodes_per_segment);
            unsafe {
                let hdr = self.header.as_ptr();
                (*hdr).virgin_segment_offset += segment_size;
                (*hdr).virgin_node_index = 0;
            }

            let grow_end =
                self.hdr().first_segment_offset + self.hdr().virgin_segment_offset + segment_size;
            debug!("pre-growing next node segment, store end {}", grow_end);
            if let Err(err) = self.store.grow_to(grow_end) {
                // only a pre-growth: the allocation that actually reaches
                // this segment will surface the failure
                warn!("unable to pre-grow node segment: {}", err);
            }
        }

        Ok(())
    }

    /// Maps the node and verifies its housekeeping byte against the handle
    /// and `expected_tag`. On a stale handle the window is released again.
    fn map_verified(&self, handle: NodeHandle, expected_tag: u8) -> Result<NonNull<u8>, ArenaError> {
        assert!(!handle.is_null());
        let (nix, generation) = self.decode(handle);

        if nix >= self.materialized.load(Ordering::Acquire) {
            warn!("node index {} out of range", nix);
            return Err(ArenaError::StaleHandle);
        }

        let offset = nix * self.hdr().node_size;
        let node = self.windows.map(offset)?;

        let hk = unsafe {
            node.as_ptr()
                .add(self.hdr().housekeeping_offset as usize)
                .read()
        };
        let tag = housekeeping_tag(hk);
        if tag != TAG_FREE && tag != TAG_ALLOCATED {
            panic!("node {} housekeeping corrupted (tag {:#x})", nix, tag);
        }

        let stale = tag != expected_tag
            || (self.generation_check && housekeeping_generation(hk) != generation);
        if stale {
            self.windows.unmap(offset, node);
            warn!("stale handle for node {}", nix);
            return Err(ArenaError::StaleHandle);
        }

        Ok(node)
    }

    /// Releases the window of a node mapped through [`map`](Self::map).
    pub(crate) fn release(&self, handle: NodeHandle, node: NonNull<u8>) {
        let (nix, _) = self.decode(handle);

        let hk = unsafe {
            node.as_ptr()
                .add(self.hdr().housekeeping_offset as usize)
                .read()
        };
        assert_eq!(
            housekeeping_tag(hk),
            TAG_ALLOCATED,
            "released node {} is not allocated",
            nix
        );

        self.windows.unmap(nix * self.hdr().node_size, node);
    }

    fn decode(&self, handle: NodeHandle) -> (NodeIndex, u8) {
        if self.generation_check {
            (handle.index_checked(), handle.generation())
        } else {
            (handle.index_unchecked(), 0)
        }
    }

    /// Total number of nodes placed on the free list so far.
    fn materialized_nodes(&self) -> u64 {
        let hdr = self.hdr();
        hdr.virgin_segment_offset / hdr.node_size + hdr.virgin_node_index
    }

    fn hdr(&self) -> &ArenaHeader {
        unsafe { self.header.as_ref() }
    }

    fn lock_alloc(&self) -> Locked<'_, ()> {
        if self.exclusive.load(Ordering::Relaxed) {
            // the caller promised exclusive access, contention is a logic
            // error
            self.alloc_lock
                .try_lock()
                .expect("allocator contended in exclusive-owner mode")
        } else {
            loop {
                if let Some(guard) = self.alloc_lock.try_lock() {
                    return guard;
                }
                core::hint::spin_loop();
            }
        }
    }
}

impl<B: BackingStoreModule> Drop for NodeArena<B> {
    fn drop(&mut self) {
        unsafe {
            self.store
                .unmap_region(self.header.cast::<u8>(), self.header_page)
        };
    }
}
