//! POSIX implementation of the `Platform` seam: `shm_open`/`mmap` for
//! regions, a `pthread_mutex_t` embedded in the region for the lock,
//! and `statvfs`/`sysconf` for the resource-sizing queries.
use std::ffi::CString;
use std::path::Path;
use std::ptr::NonNull;
use std::time::{Duration, Instant};

use super::{GlobalSizeWord, LockToken, Platform, RawRegion, GLOBAL_SIZE_MAPPING_LEN};
use crate::error::Error;
use crate::names::Names;

/// Platforms whose `libc` binding exposes `PTHREAD_MUTEX_ROBUST` and
/// the matching `pthread_mutex*_setrobust`/`*_consistent` calls.
/// macOS and other BSD-adjacent targets do not: `shared.c`'s own
/// `#if !defined(__APPLE__) && !defined(AIX)` guard is the model for
/// this cfg.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const HAVE_ROBUST_MUTEXES: bool = true;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const HAVE_ROBUST_MUTEXES: bool = false;

fn last_os_error() -> Error {
    let code = std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO);
    match code {
        libc::ENOENT => Error::NotFound,
        libc::ENOSPC => Error::NoSpace,
        libc::ENOMEM => Error::NoMemory,
        _ => Error::Other { os_error: code },
    }
}

fn os_err(code: i32) -> Error {
    match code {
        libc::ENOMEM => Error::NoMemory,
        libc::ENOSPC => Error::NoSpace,
        libc::ENOENT => Error::NotFound,
        _ => Error::Other { os_error: code },
    }
}

fn cname(name: &str) -> Result<CString, Error> {
    CString::new(name).map_err(|_| Error::Invalid)
}

#[derive(Debug)]
pub struct UnixPlatform {
    page_size: u64,
}

impl UnixPlatform {
    pub fn new() -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        UnixPlatform {
            page_size: if page_size > 0 { page_size as u64 } else { 4096 },
        }
    }

    fn map_object(fd: libc::c_int, len: usize) -> Result<NonNull<u8>, Error> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            Err(last_os_error())
        } else {
            Ok(unsafe { NonNull::new_unchecked(ptr as *mut u8) })
        }
    }

    fn object_size(fd: libc::c_int) -> Result<u64, Error> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } != 0 {
            return Err(last_os_error());
        }
        Ok(st.st_size as u64)
    }
}

impl Default for UnixPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for UnixPlatform {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn total_system_memory(&self) -> u64 {
        unsafe {
            let pages = libc::sysconf(libc::_SC_PHYS_PAGES);
            let page_size = libc::sysconf(libc::_SC_PAGESIZE);
            if pages > 0 && page_size > 0 {
                pages as u64 * page_size as u64
            } else {
                0
            }
        }
    }

    fn disk_free_space(&self, path: &Path) -> Result<u64, Error> {
        let c = cname(path.to_str().ok_or(Error::Invalid)?)?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(last_os_error());
        }
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }

    fn robust(&self) -> bool {
        HAVE_ROBUST_MUTEXES
    }

    #[cfg(target_os = "linux")]
    fn shm_directory(&self) -> std::path::PathBuf {
        std::path::PathBuf::from("/dev/shm")
    }

    #[cfg(not(target_os = "linux"))]
    fn shm_directory(&self) -> std::path::PathBuf {
        std::path::PathBuf::from("/tmp")
    }

    fn create_region(&self, names: &Names, size: u64) -> Result<(RawRegion, bool), Error> {
        let c = cname(&names.region)?;

        let created_fd = unsafe {
            libc::shm_open(c.as_ptr(), libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o600)
        };

        let (fd, created) = if created_fd >= 0 {
            (created_fd, true)
        } else if std::io::Error::last_os_error().raw_os_error() == Some(libc::EEXIST) {
            let fd = unsafe { libc::shm_open(c.as_ptr(), libc::O_RDWR, 0o600) };
            if fd < 0 {
                return Err(last_os_error());
            }
            (fd, false)
        } else {
            return Err(last_os_error());
        };

        if created && unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let e = last_os_error();
            unsafe { libc::close(fd) };
            return Err(e);
        }

        let mapped_size = if created { size } else { Self::object_size(fd)? };
        let base = match Self::map_object(fd, mapped_size as usize) {
            Ok(b) => b,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        Ok((RawRegion { base, mapped_size, fd }, created))
    }

    fn open_region(&self, names: &Names) -> Result<RawRegion, Error> {
        let c = cname(&names.region)?;
        let fd = unsafe { libc::shm_open(c.as_ptr(), libc::O_RDWR, 0o600) };
        if fd < 0 {
            return Err(last_os_error());
        }

        let mapped_size = match Self::object_size(fd) {
            Ok(s) => s,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };
        let base = match Self::map_object(fd, mapped_size as usize) {
            Ok(b) => b,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        Ok(RawRegion { base, mapped_size, fd })
    }

    fn resize_region(&self, _names: &Names, region: &mut RawRegion, new_size: u64) -> Result<(), Error> {
        if unsafe { libc::ftruncate(region.fd, new_size as libc::off_t) } != 0 {
            return Err(last_os_error());
        }
        self.remap_locked(region, new_size)
    }

    fn remap_to_current_size(&self, _names: &Names, region: &mut RawRegion) -> Result<(), Error> {
        let real_size = Self::object_size(region.fd)?;
        self.remap_locked(region, real_size)
    }

    fn unlink_region(&self, names: &Names) -> Result<(), Error> {
        let c = cname(&names.region)?;
        if unsafe { libc::shm_unlink(c.as_ptr()) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(last_os_error());
            }
        }
        Ok(())
    }

    fn map_global_size(&self, names: &Names, create: bool) -> Result<GlobalSizeWord, Error> {
        let c = cname(&names.global_size)?;

        let fd = if create {
            let fd = unsafe {
                libc::shm_open(c.as_ptr(), libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o600)
            };
            if fd >= 0 {
                if unsafe { libc::ftruncate(fd, GLOBAL_SIZE_MAPPING_LEN as libc::off_t) } != 0 {
                    let e = last_os_error();
                    unsafe { libc::close(fd) };
                    return Err(e);
                }
                fd
            } else if std::io::Error::last_os_error().raw_os_error() == Some(libc::EEXIST) {
                let fd = unsafe { libc::shm_open(c.as_ptr(), libc::O_RDWR, 0o600) };
                if fd < 0 {
                    return Err(last_os_error());
                }
                fd
            } else {
                return Err(last_os_error());
            }
        } else {
            let fd = unsafe { libc::shm_open(c.as_ptr(), libc::O_RDWR, 0o600) };
            if fd < 0 {
                return Err(last_os_error());
            }
            fd
        };

        let base = match Self::map_object(fd, GLOBAL_SIZE_MAPPING_LEN) {
            Ok(b) => b,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        Ok(GlobalSizeWord { base, fd })
    }

    fn read_global_size(&self, word: &GlobalSizeWord) -> u64 {
        unsafe { std::ptr::read_volatile(word.base.as_ptr() as *const u64) }
    }

    fn write_global_size(&self, word: &GlobalSizeWord, size: u64) {
        unsafe { std::ptr::write_volatile(word.base.as_ptr() as *mut u64, size) };
    }

    fn unlink_global_size(&self, names: &Names) -> Result<(), Error> {
        let c = cname(&names.global_size)?;
        if unsafe { libc::shm_unlink(c.as_ptr()) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(last_os_error());
            }
        }
        Ok(())
    }

    fn init_lock(&self, _names: &Names, lock_mem: *mut u8) -> Result<(), Error> {
        unsafe {
            let mutex_ptr = lock_mem as *mut libc::pthread_mutex_t;
            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();

            let mut rc = libc::pthread_mutexattr_init(&mut attr);
            if rc != 0 {
                return Err(os_err(rc));
            }

            rc = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            if rc == 0 {
                rc = libc::pthread_mutexattr_settype(&mut attr, libc::PTHREAD_MUTEX_RECURSIVE);
            }
            #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
            if rc == 0 {
                rc = libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
            }

            if rc != 0 {
                libc::pthread_mutexattr_destroy(&mut attr);
                return Err(os_err(rc));
            }

            rc = libc::pthread_mutex_init(mutex_ptr, &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            if rc != 0 {
                return Err(os_err(rc));
            }
        }
        Ok(())
    }

    fn open_lock(&self, _names: &Names) -> Result<LockToken, Error> {
        // The lock lives inside the region itself; nothing to open.
        Ok(LockToken {})
    }

    fn lock(&self, _token: &LockToken, lock_mem: *mut u8) -> Result<bool, Error> {
        let mutex_ptr = lock_mem as *mut libc::pthread_mutex_t;
        let rc = unsafe { libc::pthread_mutex_lock(mutex_ptr) };
        self.handle_lock_result(mutex_ptr, rc)
    }

    fn lock_timeout(&self, _token: &LockToken, lock_mem: *mut u8, timeout: Duration) -> Result<bool, Error> {
        let mutex_ptr = lock_mem as *mut libc::pthread_mutex_t;
        let deadline = Instant::now() + timeout;
        let mut backoff = Duration::from_micros(100);

        loop {
            let rc = unsafe { libc::pthread_mutex_trylock(mutex_ptr) };
            if rc == 0 || rc == libc::EOWNERDEAD {
                return self.handle_lock_result(mutex_ptr, rc);
            }
            if rc != libc::EBUSY {
                return Err(os_err(rc));
            }
            if Instant::now() >= deadline {
                return Err(Error::TimedOut);
            }
            std::thread::sleep(backoff.min(deadline.saturating_duration_since(Instant::now())));
            backoff = (backoff * 2).min(Duration::from_millis(20));
        }
    }

    fn unlock(&self, _token: &LockToken, lock_mem: *mut u8) -> Result<(), Error> {
        let rc = unsafe { libc::pthread_mutex_unlock(lock_mem as *mut libc::pthread_mutex_t) };
        if rc == 0 {
            Ok(())
        } else {
            Err(os_err(rc))
        }
    }
}

impl UnixPlatform {
    fn handle_lock_result(&self, mutex_ptr: *mut libc::pthread_mutex_t, rc: i32) -> Result<bool, Error> {
        if rc == 0 {
            return Ok(false);
        }
        if rc == libc::EOWNERDEAD {
            log::warn!("recovering cross-process pool lock from a dead owner");
            #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
            {
                let rc2 = unsafe { libc::pthread_mutex_consistent(mutex_ptr) };
                if rc2 != 0 {
                    return Err(os_err(rc2));
                }
            }
            let _ = mutex_ptr;
            return Ok(true);
        }
        Err(os_err(rc))
    }

    fn remap_locked(&self, region: &mut RawRegion, new_size: u64) -> Result<(), Error> {
        unsafe {
            libc::munmap(
                region.base.as_ptr() as *mut libc::c_void,
                region.mapped_size as usize,
            );
        }
        let base = Self::map_object(region.fd, new_size as usize)?;
        region.base = base;
        region.mapped_size = new_size;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn page_size_is_sane() {
        let p = UnixPlatform::new();
        assert!(p.page_size() >= 512);
        assert_eq!(p.page_size() % 2, 0);
    }

    #[test]
    fn total_memory_nonzero_on_a_real_host() {
        let p = UnixPlatform::new();
        assert!(p.total_system_memory() > 0);
    }
}
