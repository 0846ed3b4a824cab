use std::{
    fs::File,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    ptr::{null_mut, NonNull},
    sync::Mutex,
};

use libc::{c_void, mmap, munmap, MAP_FAILED, MAP_SHARED, PROT_READ, PROT_WRITE};
use log::error;

use crate::util::get_page_size;

use super::{BackingStoreModule, StoreError};

/// Backing store over a regular file, mapped with `mmap(MAP_SHARED)` and
/// grown with `set_len` (the `ftruncate` idiom).
pub struct FileBackingStore {
    file: File,

    /// path of the file, kept for diagnostics
    path: PathBuf,

    /// cached file size; guarded so concurrent growth never truncates
    len: Mutex<u64>,
}

impl FileBackingStore {
    /// Creates (or truncates) the file at `path` and sizes it to
    /// `initial_len` bytes.
    pub fn create<P: AsRef<Path>>(path: P, initial_len: u64) -> std::io::Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .truncate(true)
            .create(true)
            .open(&path)?;

        file.set_len(initial_len)?;

        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            len: Mutex::new(initial_len),
        })
    }

    /// Opens an existing store for a later pass, keeping its contents.
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = File::options().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();

        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            len: Mutex::new(len),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BackingStoreModule for FileBackingStore {
    unsafe fn map_region(&self, offset: u64, size: usize) -> Result<NonNull<u8>, StoreError> {
        let page = get_page_size() as u64;
        debug_assert_eq!(offset % page, 0, "offset {} not page aligned", offset);
        debug_assert_eq!(size as u64 % page, 0, "size {} not page aligned", size);

        // writes through a mapping beyond EOF fault, so extend first
        self.grow_to(offset + size as u64)?;

        let ptr = mmap(
            null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            MAP_SHARED,
            self.file.as_raw_fd(),
            offset as libc::off_t,
        );

        if ptr == MAP_FAILED {
            let errno = std::io::Error::last_os_error();
            error!(
                "unable to map {} bytes of {} at {}: {}",
                size,
                self.path.display(),
                offset,
                errno
            );
            return Err(match errno.raw_os_error() {
                Some(libc::ENOMEM) => StoreError::OutOfMemory,
                _ => StoreError::Io,
            });
        }

        Ok(NonNull::new_unchecked(ptr as *mut u8))
    }

    unsafe fn unmap_region(&self, ptr: NonNull<u8>, size: usize) {
        let code = munmap(ptr.as_ptr() as *mut c_void, size);
        if code != 0 {
            error!(
                "unable to unmap {} bytes of {}: {}",
                size,
                self.path.display(),
                std::io::Error::last_os_error()
            );
        }
    }

    fn grow_to(&self, len: u64) -> Result<(), StoreError> {
        let mut current = self.len.lock().unwrap();
        if *current >= len {
            return Ok(());
        }

        self.file.set_len(len).map_err(|err| {
            error!("unable to grow {} to {}: {}", self.path.display(), len, err);
            StoreError::Io
        })?;
        *current = len;

        Ok(())
    }

    fn len(&self) -> u64 {
        *self.len.lock().unwrap()
    }
}
