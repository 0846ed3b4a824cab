mod file_store;

use core::fmt;
use core::ptr::NonNull;

pub use file_store::FileBackingStore;

/// Failure classes of the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// Address space or memory exhausted. This is the only mapping failure
    /// that is worth retrying after evicting an idle window.
    OutOfMemory,
    /// Any other I/O failure of the underlying store.
    Io,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::OutOfMemory => write!(f, "out of memory"),
            StoreError::Io => write!(f, "i/o error"),
        }
    }
}

/// An auto-growing mapper over a backing file: maps byte ranges of the
/// store shared-writable and transparently extends the store when a range
/// lies beyond its current end.
pub trait BackingStoreModule {
    /// Maps `[offset, offset + size)` read-write and shared, growing the
    /// store first if the range is not yet backed.
    ///
    /// ### Safety
    ///
    /// `offset` and `size` must be multiples of the host page size. The
    /// returned mapping must be released with `unmap_region` before the
    /// store is dropped.
    unsafe fn map_region(&self, offset: u64, size: usize) -> Result<NonNull<u8>, StoreError>;

    /// Releases a mapping previously returned by `map_region`.
    ///
    /// ### Safety
    ///
    /// `ptr` and `size` must describe exactly one region returned by
    /// `map_region`, and no reference into the region may outlive this call.
    unsafe fn unmap_region(&self, ptr: NonNull<u8>, size: usize);

    /// Extends the store to at least `len` bytes. Never shrinks it.
    fn grow_to(&self, len: u64) -> Result<(), StoreError>;

    /// Current size of the store in bytes.
    fn len(&self) -> u64;
}

#[cfg(test)]
pub(crate) mod test {
    use super::{BackingStoreModule, FileBackingStore};

    pub(crate) fn get_test_store(test_name: &str) -> FileBackingStore {
        FileBackingStore::create(format!("/tmp/{}.tmp", test_name), 0).unwrap()
    }

    fn gen_number(i: usize) -> u8 {
        (i * 3 + (i % 5) * 11 + (i % 13) * 29) as u8
    }

    /// maps a region, writes a pattern through it, unmaps, then maps again
    /// and checks the pattern survived
    pub(super) fn test_backing_store_round_trip<S: BackingStoreModule>(store: S, size: usize) {
        let ptr = unsafe { store.map_region(0, size).unwrap() };
        let slice = unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), size) };
        for (i, byte) in slice.iter_mut().enumerate() {
            *byte = gen_number(i);
        }
        unsafe { store.unmap_region(ptr, size) };

        let ptr = unsafe { store.map_region(0, size).unwrap() };
        let slice = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), size) };
        for (i, byte) in slice.iter().enumerate() {
            assert_eq!(*byte, gen_number(i), "mismatch at offset {}", i);
        }
        unsafe { store.unmap_region(ptr, size) };
    }

    /// mapping past the end of the store has to grow it on demand
    pub(super) fn test_backing_store_auto_grow<S: BackingStoreModule>(store: S, page: usize) {
        assert_eq!(store.len(), 0);

        let ptr = unsafe { store.map_region(page as u64 * 3, page).unwrap() };
        assert!(store.len() >= page as u64 * 4);
        unsafe { store.unmap_region(ptr, page) };

        store.grow_to(page as u64 * 8).unwrap();
        assert_eq!(store.len(), page as u64 * 8);

        // growing backwards must not shrink the store
        store.grow_to(page as u64).unwrap();
        assert_eq!(store.len(), page as u64 * 8);
    }
}
