use static_assertions::const_assert;

/// Smallest host page size the header has to fit into. The header page
/// itself is always one host page.
pub(crate) const HEADER_MIN_PAGE: usize = 4096;

/// Persistent sizing and free-list metadata, stored in the page preceding
/// the segmented region. `reattach` reads these fields back instead of
/// recomputing them.
///
/// **Important**: Don't remove `#[repr(C)]` — this struct is accessed
/// through the mapped header page across process lifetimes.
#[repr(C)]
pub(crate) struct ArenaHeader {
    /// internal node size in bytes, padded to the caller's alignment
    pub node_size: u64,

    /// byte offset within each node reserved for the housekeeping byte
    pub housekeeping_offset: u64,

    /// an integral number of nodes fits into every segment
    pub nodes_per_segment: u64,

    /// segment size in bytes, a multiple of the page size and of `node_size`
    pub segment_size: u64,

    /// estimated size of the whole segmented region
    pub segment_table_size: u64,

    /// maximum number of windows resident at any time
    pub max_windows: u64,

    /// the caller's alignment constraint
    pub alignment: u64,

    /// nonzero when handles carry a generation
    pub generation_check: u64,

    /// index of the first node on the free list, `NODE_INDEX_NULL` when empty
    pub free_head: u64,

    /// absolute byte offset of the first segment in the backing store
    pub first_segment_offset: u64,

    /// offset, relative to the first segment, of the segment holding one or
    /// more virgin nodes. Bumped only when every node of the segment has
    /// been placed on the free list; `virgin_node_index` is reset to zero
    /// at the same time.
    pub virgin_segment_offset: u64,

    /// index within that segment of the next node not yet placed on the
    /// free list. Never reaches `nodes_per_segment`.
    pub virgin_node_index: u64,
}

const_assert!(core::mem::size_of::<ArenaHeader>() <= HEADER_MIN_PAGE);
