//! The lock / remap-on-entry protocol.
//!
//! Acquiring the pool lock is never just a mutex wait: another process
//! may have grown the region since this process last mapped it, and a
//! stale mapping means every `Offset` in the pool resolves to the
//! wrong address. Every lock acquisition therefore also compares the
//! process-local mapped size against the small out-of-band "global
//! size" word and remaps before returning if they differ, exactly as
//! `shared.c`'s `am_shm_lock`/`am_shm_lock_timeout` do before handing
//! back control to the caller.
use std::time::Duration;

use crate::chunk::HEADER_SIZE;
use crate::error::Error;
use crate::names::Names;
use crate::platform::{GlobalSizeWord, LockToken, Platform, RawRegion};

#[inline]
fn lock_mem_ptr(region: &RawRegion) -> *mut u8 {
    unsafe { region.base.as_ptr().add(HEADER_SIZE as usize) }
}

/// Remaps `region` in place if the global-size word disagrees with
/// what this process currently has mapped.
fn remap_if_stale(
    platform: &dyn Platform,
    names: &Names,
    region: &mut RawRegion,
    global_size: &GlobalSizeWord,
) -> Result<(), Error> {
    let published = platform.read_global_size(global_size);
    if published != 0 && published != region.mapped_size {
        log::debug!(
            "remapping pool '{}': local size {} stale, global size is {}",
            names.region,
            region.mapped_size,
            published
        );
        platform.remap_to_current_size(names, region)?;
    }
    Ok(())
}

/// Acquires the pool lock, blocking indefinitely, then remaps if the
/// region grew since the last time this process held it. Returns
/// `Ok(true)` if the lock was recovered from a dead owner.
pub fn lock(
    platform: &dyn Platform,
    names: &Names,
    region: &mut RawRegion,
    global_size: &GlobalSizeWord,
    token: &LockToken,
) -> Result<bool, Error> {
    let recovered = platform.lock(token, lock_mem_ptr(region))?;
    remap_if_stale(platform, names, region, global_size)?;
    Ok(recovered)
}

/// Like `lock`, but gives up with `Error::TimedOut` after `timeout`.
pub fn lock_timeout(
    platform: &dyn Platform,
    names: &Names,
    region: &mut RawRegion,
    global_size: &GlobalSizeWord,
    token: &LockToken,
    timeout: Duration,
) -> Result<bool, Error> {
    let recovered = platform.lock_timeout(token, lock_mem_ptr(region), timeout)?;
    remap_if_stale(platform, names, region, global_size)?;
    Ok(recovered)
}

/// Releases the pool lock. Does not remap: the next `lock`/
/// `lock_timeout` call will, if needed.
pub fn unlock(platform: &dyn Platform, region: &RawRegion, token: &LockToken) -> Result<(), Error> {
    platform.unlock(token, lock_mem_ptr(region))
}
