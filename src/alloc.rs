//! Allocation, free, and realloc: the operations that walk and mutate
//! the chunk chain and freelists built in `crate::chunk`. Every
//! function here assumes the pool's lock is already held by the
//! caller (`crate::pool::Pool`) and that `view`'s mapping is current.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use crate::chunk::{align_up, PoolView, ALIGN, CHUNK_HEADER_SIZE};
use crate::offset::{Offset, OffsetLinks};

/// Smallest leftover a split is allowed to create: big enough to host
/// its own chunk header plus at least one alignment unit of payload,
/// so it is itself a legal chunk rather than unusable slack.
const MIN_SPLIT_REMNANT: u64 = CHUNK_HEADER_SIZE + ALIGN;

/// Walks the whole pool to confirm every chain/freelist invariant
/// holds. Only ever compiled in for tests or the `check_contracts`
/// feature: a full-pool walk on every allocation is far too expensive
/// for production use.
#[cfg(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts"))]
unsafe fn assert_consistent(view: &PoolView) {
    debug_assert!(crate::debug_check::pool_is_consistent(view));
}

#[cfg(not(any(all(test, feature = "check_contracts_in_tests"), feature = "check_contracts")))]
unsafe fn assert_consistent(_view: &PoolView) {}

/// Finds a free chunk able to hold `user_size` bytes, marks it used,
/// and splits off the leftover into a new free chunk when the split
/// would leave a remnant big enough to be useful on its own.
///
/// # Safety
///
/// `view`'s mapping must be current and its freelists well-formed.
#[requires(user_size > 0, "zero-sized allocations are handled by the caller before the lock is even taken")]
#[ensures(ret.is_some() -> view.chunk(ret.unwrap()).used != 0, "a returned chunk is always marked used")]
pub unsafe fn allocate(view: &mut PoolView, user_size: u64) -> Option<Offset> {
    let need = align_up(user_size) + CHUNK_HEADER_SIZE;
    let chunk = view.find_free_chunk(need)?;

    view.remove_from_freelist(chunk);
    split_if_worthwhile(view, chunk, need);

    let c = view.chunk_mut(chunk);
    c.used = 1;
    c.user_size = user_size;
    assert_consistent(view);
    Some(chunk)
}

/// # Safety
///
/// `chunk` must currently be unlinked from any freelist, with `size
/// >= need`.
unsafe fn split_if_worthwhile(view: &mut PoolView, chunk: Offset, need: u64) {
    let total = view.chunk(chunk).size;
    let remainder = total - need;
    if remainder < MIN_SPLIT_REMNANT {
        return;
    }

    view.chunk_mut(chunk).size = need;

    let new_offset = Offset::new(chunk.raw() + need as u32);
    {
        let new_chunk = view.chunk_mut(new_offset);
        new_chunk.size = remainder;
        new_chunk.user_size = 0;
        new_chunk.used = 0;
        new_chunk.chain = OffsetLinks::EMPTY;
    }

    view.splice_after(chunk, new_offset);
    view.add_to_freelist(new_offset);
}

/// Marks `chunk` free, coalesces it with either spatially-adjacent
/// neighbor that is also free, and links the (possibly now larger)
/// result into the matching freelist.
///
/// # Safety
///
/// `chunk` must currently be an allocated (used) chunk in this pool.
pub unsafe fn free(view: &mut PoolView, chunk: Offset) {
    view.chunk_mut(chunk).used = 0;
    view.chunk_mut(chunk).user_size = 0;

    let mut merged = chunk;

    let next = view.chain_next(merged);
    if next.is_some() && view.chunk(next).used == 0 {
        view.remove_from_freelist(next);
        let next_size = view.chunk(next).size;
        view.unlink_chain(next);
        view.chunk_mut(merged).size += next_size;
    }

    let prev = view.chain_prev(merged);
    if prev.is_some() && view.chunk(prev).used == 0 {
        view.remove_from_freelist(prev);
        let merged_size = view.chunk(merged).size;
        view.unlink_chain(merged);
        view.chunk_mut(prev).size += merged_size;
        merged = prev;
    }

    view.add_to_freelist(merged);
    assert_consistent(view);
}

/// Resizes `chunk`'s user-visible payload to `new_user_size`. Grows
/// and shrinks in place when the chunk already has (or, after
/// shrinking, would retain) enough room; otherwise allocates a fresh
/// chunk, copies the overlapping prefix, and frees the old one —
/// exactly the three cases `shared.c`'s `am_shm_realloc` handles.
///
/// Returns `None` (and leaves `chunk` untouched) if growth in place
/// was required but no free chunk was big enough.
///
/// # Safety
///
/// `chunk` must currently be an allocated (used) chunk in this pool.
pub unsafe fn reallocate(view: &mut PoolView, chunk: Offset, new_user_size: u64) -> Option<Offset> {
    let need = align_up(new_user_size) + CHUNK_HEADER_SIZE;
    let current = view.chunk(chunk).size;

    if need <= current {
        split_if_worthwhile(view, chunk, need);
        view.chunk_mut(chunk).user_size = new_user_size;
        assert_consistent(view);
        return Some(chunk);
    }

    let old_user_size = view.chunk(chunk).user_size;
    let new_chunk = allocate(view, new_user_size)?;

    let src = view.payload_ptr(chunk).as_ptr();
    let dst = view.payload_ptr(new_chunk).as_ptr();
    let to_copy = old_user_size.min(new_user_size) as usize;
    std::ptr::copy_nonoverlapping(src, dst, to_copy);

    free(view, chunk);
    assert_consistent(view);
    Some(new_chunk)
}
