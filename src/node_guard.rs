use core::fmt;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use crate::modules::backing_store::BackingStoreModule;
use crate::node_arena::NodeArena;
use crate::node_handle::NodeHandle;

/// A mapped node: dereferences to the node's bytes and releases the
/// underlying window when dropped.
///
/// The first pointer-sized word and the housekeeping byte belong to the
/// allocator only while the node is free; an allocated node's bytes are the
/// caller's, except for the housekeeping byte.
pub struct NodeGuard<'a, B: BackingStoreModule> {
    arena: &'a NodeArena<B>,
    handle: NodeHandle,
    node: NonNull<u8>,
    len: usize,
}

impl<'a, B: BackingStoreModule> NodeGuard<'a, B> {
    pub(crate) fn new(
        arena: &'a NodeArena<B>,
        handle: NodeHandle,
        node: NonNull<u8>,
        len: usize,
    ) -> Self {
        Self {
            arena,
            handle,
            node,
            len,
        }
    }

    /// The handle this guard was mapped from.
    pub fn handle(&self) -> NodeHandle {
        self.handle
    }
}

// manual impl: the arena reference must not drag a `B: Debug` bound in
impl<B: BackingStoreModule> fmt::Debug for NodeGuard<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeGuard")
            .field("handle", &self.handle)
            .field("len", &self.len)
            .finish()
    }
}

impl<B: BackingStoreModule> Deref for NodeGuard<'_, B> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        unsafe { core::slice::from_raw_parts(self.node.as_ptr(), self.len) }
    }
}

impl<B: BackingStoreModule> DerefMut for NodeGuard<'_, B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { core::slice::from_raw_parts_mut(self.node.as_ptr(), self.len) }
    }
}

impl<B: BackingStoreModule> Drop for NodeGuard<'_, B> {
    fn drop(&mut self) {
        self.arena.release(self.handle, self.node);
    }
}
