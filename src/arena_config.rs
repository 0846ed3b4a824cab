/// How the segment size and window budget are chosen at `initialize`.
#[derive(Clone, Copy, Debug)]
pub enum SegmentSizing {
    /// Derive segment size and window budget from a virtual memory budget
    /// and the expected number of entries. The goal is to fit the whole
    /// expected data set into the window budget when memory allows, and to
    /// degrade to a hard cap of windows otherwise.
    Auto {
        /// virtual memory available for windows, in bytes
        vm_budget: u64,
        /// expected number of entries (directories plus non-directories)
        estimated_entries: u64,
    },
    /// Pin the layout. `segment_size` must be a multiple of the host page
    /// size and of the padded node size.
    Explicit {
        segment_size: usize,
        max_windows: usize,
    },
}

/// Construction parameters for a [`NodeArena`](crate::NodeArena).
#[derive(Clone, Copy, Debug)]
pub struct ArenaConfig {
    /// caller-visible node size in bytes; rounded up to `alignment`
    pub node_size: usize,

    /// byte offset within each node the caller reserves for allocator
    /// housekeeping. Must lie behind the free-list linkage word at the
    /// start of the node and in front of the node's end.
    pub housekeeping_offset: usize,

    /// alignment constraint on node offsets, a power of two
    pub alignment: usize,

    pub sizing: SegmentSizing,

    /// when true, handles carry a generation that is validated on every
    /// dereference, catching stale handles to freed and reused nodes
    pub generation_check: bool,
}
