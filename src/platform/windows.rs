//! Windows implementation of the `Platform` seam: a disk-backed file
//! mapping (`CreateFileW` + `CreateFileMappingW` + `MapViewOfFile`)
//! standing in for `shm_open`/`mmap`, and a named `Mutex` standing in
//! for the process-shared `pthread_mutex_t` (Windows mutexes are
//! already both recursive and abandonment-aware, which is why this
//! side of the seam needs no separate "make consistent" step).
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::time::Duration;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, ERROR_FILE_NOT_FOUND, HANDLE,
    WAIT_ABANDONED, WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, GetDiskFreeSpaceExW, SetEndOfFile, SetFilePointerEx, FILE_ATTRIBUTE_NORMAL,
    FILE_BEGIN, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_ALWAYS, OPEN_EXISTING,
};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
    MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{
    GetSystemInfo, GlobalMemoryStatusEx, MEMORYSTATUSEX, SYSTEM_INFO,
};
use windows_sys::Win32::System::Threading::{CreateMutexW, ReleaseMutex, WaitForSingleObject};

use super::{GlobalSizeWord, LockToken, Platform, RawRegion, GLOBAL_SIZE_MAPPING_LEN};
use crate::error::Error;
use crate::names::Names;

fn last_error() -> Error {
    let code = unsafe { GetLastError() };
    Error::Other { os_error: code as i32 }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn backing_file_path(display_name: &str) -> PathBuf {
    let leaf: String = display_name
        .trim_start_matches("Global\\")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    std::env::temp_dir().join(format!("{}.crossmem", leaf))
}

fn open_or_create_file(path: &Path) -> Result<(HANDLE, bool), Error> {
    let wpath = wide(path.to_str().ok_or(Error::Invalid)?);
    let handle = unsafe {
        CreateFileW(
            wpath.as_ptr(),
            windows_sys::Win32::Storage::FileSystem::GENERIC_READ
                | windows_sys::Win32::Storage::FileSystem::GENERIC_WRITE,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            std::ptr::null(),
            OPEN_ALWAYS,
            FILE_ATTRIBUTE_NORMAL,
            0,
        )
    };
    if handle == -1i32 as HANDLE || handle == 0 {
        return Err(last_error());
    }
    let created = unsafe { GetLastError() } != ERROR_ALREADY_EXISTS;
    Ok((handle, created))
}

fn set_file_size(file: HANDLE, size: u64) -> Result<(), Error> {
    let mut distance = windows_sys::Win32::Foundation::LARGE_INTEGER { QuadPart: size as i64 };
    if unsafe { SetFilePointerEx(file, distance, std::ptr::null_mut(), FILE_BEGIN) } == 0 {
        return Err(last_error());
    }
    if unsafe { SetEndOfFile(file) } == 0 {
        return Err(last_error());
    }
    let _ = &mut distance;
    Ok(())
}

fn map_file(file: HANDLE, name: &str, size: u64) -> Result<(HANDLE, NonNull<u8>), Error> {
    let wname = wide(name);
    let mapping = unsafe {
        CreateFileMappingW(
            file,
            std::ptr::null(),
            PAGE_READWRITE,
            (size >> 32) as u32,
            size as u32,
            wname.as_ptr(),
        )
    };
    if mapping == 0 {
        return Err(last_error());
    }

    let view = unsafe { MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, 0) };
    if view.Value.is_null() {
        let e = last_error();
        unsafe { CloseHandle(mapping) };
        return Err(e);
    }

    Ok((mapping, unsafe { NonNull::new_unchecked(view.Value as *mut u8) }))
}

#[derive(Debug)]
pub struct WindowsPlatform {
    page_size: u64,
}

impl WindowsPlatform {
    pub fn new() -> Self {
        let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        WindowsPlatform {
            page_size: info.dwPageSize as u64,
        }
    }
}

impl Default for WindowsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for WindowsPlatform {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn total_system_memory(&self) -> u64 {
        let mut status: MEMORYSTATUSEX = unsafe { std::mem::zeroed() };
        status.dwLength = std::mem::size_of::<MEMORYSTATUSEX>() as u32;
        if unsafe { GlobalMemoryStatusEx(&mut status) } != 0 {
            status.ullTotalPhys
        } else {
            0
        }
    }

    fn disk_free_space(&self, path: &Path) -> Result<u64, Error> {
        let wpath = wide(path.to_str().ok_or(Error::Invalid)?);
        let mut free_to_caller: u64 = 0;
        let ok = unsafe {
            GetDiskFreeSpaceExW(
                wpath.as_ptr(),
                &mut free_to_caller,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(last_error());
        }
        Ok(free_to_caller)
    }

    fn robust(&self) -> bool {
        // Windows mutexes already surface WAIT_ABANDONED with no
        // separate consistency step required.
        false
    }

    fn shm_directory(&self) -> std::path::PathBuf {
        std::env::temp_dir()
    }

    fn create_region(&self, names: &Names, size: u64) -> Result<(RawRegion, bool), Error> {
        let path = backing_file_path(&names.region);
        let (file_handle, created) = open_or_create_file(&path)?;
        if created {
            if let Err(e) = set_file_size(file_handle, size) {
                unsafe { CloseHandle(file_handle) };
                return Err(e);
            }
        }
        let mapped_size = if created {
            size
        } else {
            file_length(file_handle)?
        };

        let (mapping_handle, base) = match map_file(file_handle, &names.region, mapped_size) {
            Ok(v) => v,
            Err(e) => {
                unsafe { CloseHandle(file_handle) };
                return Err(e);
            }
        };

        Ok((
            RawRegion {
                base,
                mapped_size,
                file_handle,
                mapping_handle,
            },
            created,
        ))
    }

    fn open_region(&self, names: &Names) -> Result<RawRegion, Error> {
        let path = backing_file_path(&names.region);
        let wpath = wide(path.to_str().ok_or(Error::Invalid)?);
        let file_handle = unsafe {
            CreateFileW(
                wpath.as_ptr(),
                windows_sys::Win32::Storage::FileSystem::GENERIC_READ
                    | windows_sys::Win32::Storage::FileSystem::GENERIC_WRITE,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                std::ptr::null(),
                OPEN_EXISTING,
                FILE_ATTRIBUTE_NORMAL,
                0,
            )
        };
        if file_handle == -1i32 as HANDLE || file_handle == 0 {
            let code = unsafe { GetLastError() };
            return Err(if code == ERROR_FILE_NOT_FOUND {
                Error::NotFound
            } else {
                Error::Other { os_error: code as i32 }
            });
        }

        let mapped_size = match file_length(file_handle) {
            Ok(s) => s,
            Err(e) => {
                unsafe { CloseHandle(file_handle) };
                return Err(e);
            }
        };
        let (mapping_handle, base) = match map_file(file_handle, &names.region, mapped_size) {
            Ok(v) => v,
            Err(e) => {
                unsafe { CloseHandle(file_handle) };
                return Err(e);
            }
        };

        Ok(RawRegion {
            base,
            mapped_size,
            file_handle,
            mapping_handle,
        })
    }

    fn resize_region(&self, names: &Names, region: &mut RawRegion, new_size: u64) -> Result<(), Error> {
        set_file_size(region.file_handle, new_size)?;
        self.remap(names, region, new_size)
    }

    fn remap_to_current_size(&self, names: &Names, region: &mut RawRegion) -> Result<(), Error> {
        let size = file_length(region.file_handle)?;
        self.remap(names, region, size)
    }

    fn unlink_region(&self, names: &Names) -> Result<(), Error> {
        let path = backing_file_path(&names.region);
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(_) => Err(last_error()),
        }
    }

    fn map_global_size(&self, names: &Names, create: bool) -> Result<GlobalSizeWord, Error> {
        let path = backing_file_path(&names.global_size);
        let (file_handle, created) = if create {
            open_or_create_file(&path)?
        } else {
            let wpath = wide(path.to_str().ok_or(Error::Invalid)?);
            let h = unsafe {
                CreateFileW(
                    wpath.as_ptr(),
                    windows_sys::Win32::Storage::FileSystem::GENERIC_READ
                        | windows_sys::Win32::Storage::FileSystem::GENERIC_WRITE,
                    FILE_SHARE_READ | FILE_SHARE_WRITE,
                    std::ptr::null(),
                    OPEN_EXISTING,
                    FILE_ATTRIBUTE_NORMAL,
                    0,
                )
            };
            if h == -1i32 as HANDLE || h == 0 {
                return Err(last_error());
            }
            (h, false)
        };

        if created {
            if let Err(e) = set_file_size(file_handle, GLOBAL_SIZE_MAPPING_LEN as u64) {
                unsafe { CloseHandle(file_handle) };
                return Err(e);
            }
        }

        let (mapping_handle, base) =
            match map_file(file_handle, &names.global_size, GLOBAL_SIZE_MAPPING_LEN as u64) {
                Ok(v) => v,
                Err(e) => {
                    unsafe { CloseHandle(file_handle) };
                    return Err(e);
                }
            };

        Ok(GlobalSizeWord {
            base,
            file_handle,
            mapping_handle,
        })
    }

    fn read_global_size(&self, word: &GlobalSizeWord) -> u64 {
        unsafe { std::ptr::read_volatile(word.base.as_ptr() as *const u64) }
    }

    fn write_global_size(&self, word: &GlobalSizeWord, size: u64) {
        unsafe { std::ptr::write_volatile(word.base.as_ptr() as *mut u64, size) };
    }

    fn unlink_global_size(&self, names: &Names) -> Result<(), Error> {
        let path = backing_file_path(&names.global_size);
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(_) => Err(last_error()),
        }
    }

    fn init_lock(&self, _names: &Names, _lock_mem: *mut u8) -> Result<(), Error> {
        // The lock is a named kernel object, not in-region state;
        // `open_lock` both creates and opens it.
        Ok(())
    }

    fn open_lock(&self, names: &Names) -> Result<LockToken, Error> {
        let wname = wide(&names.lock);
        let mutex = unsafe { CreateMutexW(std::ptr::null(), 0, wname.as_ptr()) };
        if mutex == 0 {
            return Err(last_error());
        }
        Ok(LockToken { mutex })
    }

    fn lock(&self, token: &LockToken, _lock_mem: *mut u8) -> Result<bool, Error> {
        let result = unsafe { WaitForSingleObject(token.mutex, u32::MAX) };
        match result {
            WAIT_OBJECT_0 => Ok(false),
            WAIT_ABANDONED => {
                log::warn!("recovering cross-process pool lock from a dead owner");
                Ok(true)
            }
            WAIT_FAILED => Err(last_error()),
            _ => Err(Error::Other { os_error: result as i32 }),
        }
    }

    fn lock_timeout(&self, token: &LockToken, _lock_mem: *mut u8, timeout: Duration) -> Result<bool, Error> {
        let millis = timeout.as_millis().min(u32::MAX as u128) as u32;
        let result = unsafe { WaitForSingleObject(token.mutex, millis) };
        match result {
            WAIT_OBJECT_0 => Ok(false),
            WAIT_ABANDONED => {
                log::warn!("recovering cross-process pool lock from a dead owner");
                Ok(true)
            }
            WAIT_TIMEOUT => Err(Error::TimedOut),
            WAIT_FAILED => Err(last_error()),
            _ => Err(Error::Other { os_error: result as i32 }),
        }
    }

    fn unlock(&self, token: &LockToken, _lock_mem: *mut u8) -> Result<(), Error> {
        if unsafe { ReleaseMutex(token.mutex) } == 0 {
            Err(last_error())
        } else {
            Ok(())
        }
    }
}

impl WindowsPlatform {
    fn remap(&self, names: &Names, region: &mut RawRegion, new_size: u64) -> Result<(), Error> {
        unsafe {
            UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                Value: region.base.as_ptr() as *mut std::ffi::c_void,
            });
            CloseHandle(region.mapping_handle);
        }
        let (mapping_handle, base) = map_file(region.file_handle, &names.region, new_size)?;
        region.mapping_handle = mapping_handle;
        region.base = base;
        region.mapped_size = new_size;
        Ok(())
    }
}

fn file_length(handle: HANDLE) -> Result<u64, Error> {
    let mut size: i64 = 0;
    if unsafe { windows_sys::Win32::Storage::FileSystem::GetFileSizeEx(handle, &mut size) } == 0 {
        return Err(last_error());
    }
    Ok(size as u64)
}
