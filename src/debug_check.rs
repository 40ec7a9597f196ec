//! Debug-only invariant verification over a mapped pool.
//!
//! A side-channel module that contract annotations (`#[ensures(...)]`)
//! call into, compiled in only for `cfg(test)` builds (with
//! `check_contracts_in_tests`) or when a caller opts into the
//! `check_contracts` feature. Walking the whole chunk chain on every
//! allocation is too expensive for production use, hence the gating.
use std::collections::HashSet;

use crate::chunk::{bucket_of, PoolView, NUM_BUCKETS};
use crate::offset::Offset;

/// Walks the spatial chain and confirms: every chunk's size is
/// accounted for exactly once, the chain's total size plus the header
/// and lock area equals the pool's published `size`, no two
/// spatially-adjacent chunks are both free (they should have been
/// coalesced), and the chain is correctly doubly-linked.
///
/// # Safety
///
/// `view`'s mapping must be current.
pub unsafe fn chain_is_consistent(view: &PoolView) -> bool {
    let header = view.header();
    let mut cursor = header.chain_first;
    let mut prev = Offset::NONE;
    let mut total = crate::chunk::DATA_OFFSET;
    let mut previous_was_free = false;
    let mut visited = HashSet::new();

    while cursor.is_some() {
        if !visited.insert(cursor.raw()) {
            return false; // cycle
        }

        let chunk = view.chunk(cursor);
        if chunk.chain.prev != prev {
            return false;
        }

        let this_is_free = chunk.used == 0;
        if previous_was_free && this_is_free {
            return false; // adjacent free chunks should have coalesced
        }

        total += chunk.size;
        previous_was_free = this_is_free;
        prev = cursor;
        cursor = chunk.chain.next;
    }

    if prev != header.chain_last {
        return false;
    }

    total == header.size
}

/// Confirms every chunk reachable from a freelist bucket head is
/// actually free, falls in that bucket's size range, and that walking
/// all buckets visits exactly the same set of offsets as walking the
/// chain and filtering on `used == 0`.
///
/// # Safety
///
/// `view`'s mapping must be current.
pub unsafe fn freelists_are_consistent(view: &PoolView) -> bool {
    let header = view.header();

    let mut from_freelists = HashSet::new();
    for bucket in 0..NUM_BUCKETS {
        let mut cursor = header.freelist_heads[bucket];
        while cursor.is_some() {
            if !from_freelists.insert(cursor.raw()) {
                return false; // cycle or cross-bucket duplicate
            }
            let chunk = view.chunk(cursor);
            if chunk.used != 0 || bucket_of(chunk.size) != bucket {
                return false;
            }
            cursor = view.freelist_next(cursor);
        }
    }

    let mut from_chain = HashSet::new();
    let mut cursor = header.chain_first;
    while cursor.is_some() {
        let chunk = view.chunk(cursor);
        if chunk.used == 0 {
            from_chain.insert(cursor.raw());
        }
        cursor = chunk.chain.next;
    }

    from_freelists == from_chain
}

/// The conjunction of every invariant this module checks.
///
/// # Safety
///
/// `view`'s mapping must be current.
pub unsafe fn pool_is_consistent(view: &PoolView) -> bool {
    chain_is_consistent(view) && freelists_are_consistent(view)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chunk::{PoolHeader, ALIGN, CHUNK_HEADER_SIZE, DATA_OFFSET};
    use crate::offset::OffsetLinks;
    use std::ptr::NonNull;

    fn fresh_pool(payload: u64) -> (Vec<u8>, PoolView) {
        let total = DATA_OFFSET + payload;
        let mut buf = vec![0u8; total as usize];
        let base = NonNull::new(buf.as_mut_ptr()).unwrap();
        let mut view = unsafe { PoolView::new(base) };

        let first = Offset::new(DATA_OFFSET as u32);
        *view.header_mut() = PoolHeader {
            size: total,
            max_size: total,
            user_offset: 0,
            open: 1,
            freelist_heads: [Offset::NONE; NUM_BUCKETS],
            chain_first: first,
            chain_last: first,
        };

        unsafe {
            let c = view.chunk_mut(first);
            c.size = payload;
            c.user_size = 0;
            c.used = 0;
            c.chain = OffsetLinks::EMPTY;
            view.add_to_freelist(first);
        }

        (buf, view)
    }

    #[test]
    fn fresh_pool_is_consistent() {
        let (_buf, view) = fresh_pool(4096);
        assert!(unsafe { pool_is_consistent(&view) });
    }

    #[test]
    fn detects_adjacent_free_chunks() {
        let (_buf, mut view) = fresh_pool(4096);
        let first = view.header().chain_first;
        let half = align_for_test(2000);

        unsafe {
            view.remove_from_freelist(first);
            view.chunk_mut(first).size = half;

            let second = Offset::new(first.raw() + half as u32);
            let c = view.chunk_mut(second);
            c.size = 4096 - half;
            c.user_size = 0;
            c.used = 0;
            c.chain = OffsetLinks::EMPTY;
            view.splice_after(first, second);

            view.add_to_freelist(first);
            view.add_to_freelist(second);
        }

        assert!(!unsafe { chain_is_consistent(&view) });
    }

    fn align_for_test(n: u64) -> u64 {
        (n + (ALIGN - 1)) & !(ALIGN - 1)
    }

    #[test]
    fn chunk_header_size_is_nonzero() {
        assert!(CHUNK_HEADER_SIZE > 0);
    }
}
