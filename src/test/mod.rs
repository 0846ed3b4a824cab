use crate::{
    modules::backing_store::{test::get_test_store, FileBackingStore},
    util::get_page_size,
    ArenaConfig, NodeArena, SegmentSizing,
};

mod scenarios;

pub(crate) fn get_test_arena(test_name: &str, config: ArenaConfig) -> NodeArena<FileBackingStore> {
    NodeArena::initialize(get_test_store(test_name), 0, config).unwrap()
}

/// One page per segment keeps the window pool busy even in small tests.
pub(crate) fn page_config(generation_check: bool, max_windows: usize) -> ArenaConfig {
    ArenaConfig {
        node_size: 64,
        housekeeping_offset: 8,
        alignment: 8,
        sizing: SegmentSizing::Explicit {
            segment_size: get_page_size(),
            max_windows,
        },
        generation_check,
    }
}
