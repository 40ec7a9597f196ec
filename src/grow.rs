//! Growing a pool's backing region in place.
//!
//! Mirrors `shared.c`'s `am_shm_extend`: resize the backing object,
//! remap it, extend the tail chunk (or append a new one) to cover the
//! newly available bytes, and publish the new size through the
//! out-of-band global-size word so other attached processes notice on
//! their next lock acquisition (see `crate::lock`).
use crate::chunk::PoolView;
use crate::error::Error;
use crate::names::Names;
use crate::offset::{Offset, OffsetLinks};
use crate::platform::{GlobalSizeWord, Platform, RawRegion};

/// Grows `region` by `additional` bytes, up to the pool's configured
/// `max_size`. The caller must hold the pool's lock.
///
/// Returns `Error::NotSupported` on platforms that cannot resize a
/// mapped region in place (this crate treats any non-Linux,
/// non-Windows Unix the same as the original's macOS branch, per the
/// design notes).
#[cfg(any(target_os = "linux", target_os = "android", windows))]
pub fn extend(
    platform: &dyn Platform,
    names: &Names,
    region: &mut RawRegion,
    global_size: &GlobalSizeWord,
    additional: u64,
) -> Result<(), Error> {
    if additional == 0 {
        return Ok(());
    }

    let requested_new_size = region.mapped_size + additional;

    let (max_size, old_size, tail, tail_is_free) = unsafe {
        let view = PoolView::new(region.base);
        let header = view.header();
        let tail = header.chain_last;
        let tail_is_free = view.chunk(tail).used == 0;
        (header.max_size, header.size, tail, tail_is_free)
    };

    if requested_new_size > max_size {
        return Err(Error::NoSpace);
    }

    log::debug!(
        "growing pool '{}' from {} to {} bytes",
        names.region,
        old_size,
        requested_new_size
    );
    platform.resize_region(names, region, requested_new_size)?;

    let mut view = unsafe { PoolView::new(region.base) };
    let grew_by = requested_new_size - old_size;
    view.header_mut().size = requested_new_size;

    unsafe {
        if tail_is_free {
            view.remove_from_freelist(tail);
            view.chunk_mut(tail).size += grew_by;
            view.add_to_freelist(tail);
        } else {
            let new_chunk = Offset::new(old_size as u32);
            let c = view.chunk_mut(new_chunk);
            c.size = grew_by;
            c.user_size = 0;
            c.used = 0;
            c.chain = OffsetLinks::EMPTY;
            view.splice_after(tail, new_chunk);
            view.add_to_freelist(new_chunk);
        }
    }

    platform.write_global_size(global_size, requested_new_size);
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android", windows)))]
pub fn extend(
    _platform: &dyn Platform,
    _names: &Names,
    _region: &mut RawRegion,
    _global_size: &GlobalSizeWord,
    _additional: u64,
) -> Result<(), Error> {
    Err(Error::NotSupported)
}
