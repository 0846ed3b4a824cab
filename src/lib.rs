mod arena_config;
mod error;
mod header;
mod node_arena;
mod node_guard;
mod node_handle;
mod util;
mod window_manager;

#[cfg(test)]
mod test;

pub use crate::arena_config::{ArenaConfig, SegmentSizing};
pub use crate::error::ArenaError;
pub use crate::node_arena::{ArenaStats, NodeArena};
pub use crate::node_guard::NodeGuard;
pub use crate::node_handle::NodeHandle;
pub use crate::window_manager::AccessMode;
pub mod modules;
