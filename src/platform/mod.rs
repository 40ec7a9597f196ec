//! The OS-facing seam.
//!
//! Every system call the pool makes — mapping and growing the backing
//! region, finding out how much RAM or disk is free, and taking the
//! process-shared lock — goes through the `Platform` trait: one seam
//! through which all address-space acquisition passes, with a
//! `lazy_static`-backed default instance. `Platform` is not
//! runtime-registrable: exactly one of `unix`/`windows` is compiled
//! in, selected by `cfg`.
use std::path::Path;
use std::ptr::NonNull;
use std::time::Duration;

use crate::error::Error;
use crate::names::Names;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

/// A mapped backing region: the pool's address space in this process.
pub struct RawRegion {
    pub base: NonNull<u8>,
    pub mapped_size: u64,
    #[cfg(unix)]
    pub(crate) fd: std::os::unix::io::RawFd,
    #[cfg(windows)]
    pub(crate) file_handle: windows_sys::Win32::Foundation::HANDLE,
    #[cfg(windows)]
    pub(crate) mapping_handle: windows_sys::Win32::Foundation::HANDLE,
}

// SAFETY: a RawRegion is just an owned OS handle plus a mapped
// pointer; moving ownership between threads (not concurrent use
// without the pool's lock) is sound, matching how `crate::pool::Pool`
// uses it.
unsafe impl Send for RawRegion {}
unsafe impl Sync for RawRegion {}

#[cfg(unix)]
impl Drop for RawRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.mapped_size as usize);
            libc::close(self.fd);
        }
    }
}

#[cfg(windows)]
impl Drop for RawRegion {
    fn drop(&mut self) {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Memory::UnmapViewOfFile;

        unsafe {
            UnmapViewOfFile(windows_sys::Win32::System::Memory::MEMORY_MAPPED_VIEW_ADDRESS {
                Value: self.base.as_ptr() as *mut std::ffi::c_void,
            });
            CloseHandle(self.mapping_handle);
            CloseHandle(self.file_handle);
        }
    }
}

/// The small out-of-band word holding the region's current
/// "global size", used by the remap-on-lock-entry protocol so a
/// process can tell whether another process has grown the pool.
pub struct GlobalSizeWord {
    pub(crate) base: NonNull<u8>,
    #[cfg(unix)]
    pub(crate) fd: std::os::unix::io::RawFd,
    #[cfg(windows)]
    pub(crate) file_handle: windows_sys::Win32::Foundation::HANDLE,
    #[cfg(windows)]
    pub(crate) mapping_handle: windows_sys::Win32::Foundation::HANDLE,
}

unsafe impl Send for GlobalSizeWord {}
unsafe impl Sync for GlobalSizeWord {}

#[cfg(unix)]
impl Drop for GlobalSizeWord {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, GLOBAL_SIZE_MAPPING_LEN);
            libc::close(self.fd);
        }
    }
}

#[cfg(windows)]
impl Drop for GlobalSizeWord {
    fn drop(&mut self) {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Memory::UnmapViewOfFile;

        unsafe {
            UnmapViewOfFile(windows_sys::Win32::System::Memory::MEMORY_MAPPED_VIEW_ADDRESS {
                Value: self.base.as_ptr() as *mut std::ffi::c_void,
            });
            CloseHandle(self.mapping_handle);
            CloseHandle(self.file_handle);
        }
    }
}

/// Length, in bytes, of the mapping backing a `GlobalSizeWord`. Only
/// the first 8 bytes are meaningful; the rest is padding to a
/// mapping-friendly size.
pub(crate) const GLOBAL_SIZE_MAPPING_LEN: usize = 4096;

/// A handle to the pool's process-shared lock. On Unix this is a unit
/// value: the lock itself lives inside the pool region, at the byte
/// offset `crate::chunk::HEADER_SIZE`. On Windows, the lock is a named
/// kernel object with no in-region state, so this carries its handle.
pub struct LockToken {
    #[cfg(windows)]
    pub(crate) mutex: windows_sys::Win32::Foundation::HANDLE,
}

unsafe impl Send for LockToken {}
unsafe impl Sync for LockToken {}

#[cfg(windows)]
impl Drop for LockToken {
    fn drop(&mut self) {
        unsafe {
            windows_sys::Win32::Foundation::CloseHandle(self.mutex);
        }
    }
}

/// The operating-system primitives a pool needs, parameterized out so
/// that exactly one implementation (`unix` or `windows`) is compiled
/// in for a given target.
#[allow(clippy::too_many_arguments)]
pub trait Platform: Sync {
    /// The mapping granularity for this platform.
    fn page_size(&self) -> u64;

    /// Total physical memory installed, or 0 if it cannot be
    /// determined. Used to size `BLOCKFILE`-prefixed caches.
    fn total_system_memory(&self) -> u64;

    /// Free space on the filesystem backing `path`, used to refuse
    /// `extend()` calls that would overcommit disk.
    fn disk_free_space(&self, path: &Path) -> Result<u64, Error>;

    /// The directory whose free space should be checked before
    /// creating a new region: `/dev/shm` on Linux, `/tmp` on other
    /// Unix-likes that lack a dedicated shm filesystem, and the
    /// directory holding the backing file on Windows.
    fn shm_directory(&self) -> std::path::PathBuf;

    /// Whether this platform supports robust-mutex ownership recovery
    /// (`EOWNERDEAD` + "make consistent"). False on platforms (e.g.
    /// macOS) that lack the primitive; `lock`/`lock_timeout` then
    /// never return `Ok(true)`.
    fn robust(&self) -> bool;

    /// Creates the named backing region if absent (sizing it to
    /// `size` bytes) or opens it if another process beat us to it.
    /// Returns the mapped region either way, plus whether this call
    /// was the one that created it (the "first attacher"): only the
    /// first attacher should initialize the pool header, lock, and
    /// global-size word.
    fn create_region(&self, names: &Names, size: u64) -> Result<(RawRegion, bool), Error>;

    /// Opens a region that must already exist.
    fn open_region(&self, names: &Names) -> Result<RawRegion, Error>;

    /// Grows the backing object to `new_size` bytes and remaps it,
    /// replacing `region`'s base pointer and mapped size in place.
    /// Returns `Error::NotSupported` on platforms that cannot resize
    /// a mapped object in place (per design notes, e.g. unsupported
    /// targets).
    fn resize_region(&self, names: &Names, region: &mut RawRegion, new_size: u64) -> Result<(), Error>;

    /// Remaps `region` to the backing object's current real size,
    /// without changing it (used when another process has already
    /// grown the object and we are just catching up).
    fn remap_to_current_size(&self, names: &Names, region: &mut RawRegion) -> Result<(), Error>;

    /// Removes the named region from the filesystem/object namespace.
    /// Idempotent: `Ok(())` even if already gone.
    fn unlink_region(&self, names: &Names) -> Result<(), Error>;

    /// Maps (creating if `create`) the small global-size word.
    fn map_global_size(&self, names: &Names, create: bool) -> Result<GlobalSizeWord, Error>;

    fn read_global_size(&self, word: &GlobalSizeWord) -> u64;
    fn write_global_size(&self, word: &GlobalSizeWord, size: u64);
    fn unlink_global_size(&self, names: &Names) -> Result<(), Error>;

    /// Initializes the process-shared, recursive, (where supported)
    /// robust lock at `lock_mem` (a pointer into the region, valid
    /// only on Unix; ignored on Windows). Called exactly once, by
    /// whichever process creates the pool.
    fn init_lock(&self, names: &Names, lock_mem: *mut u8) -> Result<(), Error>;

    /// Opens this process's handle onto the pool's lock.
    fn open_lock(&self, names: &Names) -> Result<LockToken, Error>;

    /// Acquires the lock, blocking indefinitely. Returns `Ok(true)` if
    /// the previous owner died while holding it and this call
    /// recovered the lock into a consistent state.
    fn lock(&self, token: &LockToken, lock_mem: *mut u8) -> Result<bool, Error>;

    /// Acquires the lock, giving up with `Error::TimedOut` after
    /// `timeout` has elapsed.
    fn lock_timeout(&self, token: &LockToken, lock_mem: *mut u8, timeout: Duration) -> Result<bool, Error>;

    fn unlock(&self, token: &LockToken, lock_mem: *mut u8) -> Result<(), Error>;
}

#[cfg(unix)]
pub use self::unix::UnixPlatform as DefaultPlatform;
#[cfg(windows)]
pub use self::windows::WindowsPlatform as DefaultPlatform;

lazy_static::lazy_static! {
    static ref DEFAULT_PLATFORM: DefaultPlatform = DefaultPlatform::new();
}

/// Returns the process-wide platform implementation.
pub fn get_platform() -> &'static dyn Platform {
    &*DEFAULT_PLATFORM
}
