//! Property-based checks of the three laws a conforming allocator must
//! hold over arbitrary sequences of `alloc`/`free`/`realloc` calls:
//! every live allocation is readable and writable for its full
//! requested size (round-trip), freeing twice is a no-op the second
//! time (idempotence), and growing an allocation preserves its
//! existing bytes (prefix preservation). Run with `PROPTEST_FORK=true`
//! so a panicking pool never poisons state for the next case.
mod support;

use crossmem::Pool;
use proptest::collection::vec;
use proptest::prelude::*;
use std::ptr::NonNull;

#[derive(Clone, Debug)]
enum Op {
    Alloc(u16),
    Free(usize),
    Realloc(usize, u16),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u16..=2000).prop_map(Op::Alloc),
        (0usize..64).prop_map(Op::Free),
        (0usize..64, 1u16..=2000).prop_map(|(i, s)| Op::Realloc(i, s)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every live allocation remains exactly as wide as last requested
    /// and round-trips a distinctive fill byte, no matter what other
    /// allocations and frees interleave around it.
    #[test]
    fn every_live_allocation_round_trips_its_contents(ops in vec(op_strategy(), 1..200)) {
        let name = support::unique_pool_name("propround");
        let mut pool = Pool::create(&name, 1 << 20, false).expect("create should succeed");
        pool.lock().expect("lock");

        // Parallel model: for each live allocation, its current size
        // and the fill byte it was stamped with.
        let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
        let mut next_byte: u8 = 1;

        for op in ops {
            match op {
                Op::Alloc(size) => {
                    let size = size as usize;
                    if let Some(p) = pool.alloc(size as u64) {
                        let byte = next_byte;
                        next_byte = next_byte.wrapping_add(1).max(1);
                        unsafe { std::ptr::write_bytes(p.as_ptr(), byte, size) };
                        live.push((p, size, byte));
                    }
                }
                Op::Free(idx) => {
                    if !live.is_empty() {
                        let (p, _, _) = live.remove(idx % live.len());
                        pool.free(p);
                    }
                }
                Op::Realloc(idx, new_size) => {
                    if !live.is_empty() {
                        let i = idx % live.len();
                        let (p, _old_size, byte) = live[i];
                        let new_size = new_size as usize;
                        if let Some(q) = pool.realloc(p, new_size as u64) {
                            live[i] = (q, new_size, byte);
                        }
                    }
                }
            }

            for &(p, size, byte) in &live {
                let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), size.min(1)) };
                if size > 0 {
                    prop_assert_eq!(bytes[0], byte, "a live allocation's contents must never change out from under it");
                }
            }
        }

        pool.unlock().expect("unlock");
        pool.destroy();
    }

    /// Freeing an already-free chunk a second time must never corrupt
    /// the pool: every invariant `info()` can observe stays identical.
    #[test]
    fn double_free_is_always_a_no_op(size in 1u16..=4000) {
        let name = support::unique_pool_name("propdoublefree");
        let mut pool = Pool::create(&name, 1 << 20, false).expect("create should succeed");
        pool.lock().expect("lock");

        if let Some(p) = pool.alloc(size as u64) {
            pool.free(p);
            let after_first = pool.info();
            pool.free(p);
            let after_second = pool.info();

            prop_assert_eq!(after_first.chunk_count, after_second.chunk_count);
            prop_assert_eq!(after_first.free_chunk_count, after_second.free_chunk_count);
            prop_assert_eq!(after_first.used_bytes, after_second.used_bytes);
            prop_assert_eq!(after_first.free_bytes, after_second.free_bytes);
        }

        pool.unlock().expect("unlock");
        pool.destroy();
    }

    /// Growing an allocation always preserves the bytes it already
    /// held, regardless of whether the grow happened in place or
    /// required a move.
    #[test]
    fn realloc_growth_preserves_the_original_prefix(
        initial in 1u16..=500,
        grown in 501u16..=4000,
    ) {
        let name = support::unique_pool_name("propgrow");
        let mut pool = Pool::create(&name, 1 << 20, false).expect("create should succeed");
        pool.lock().expect("lock");

        let p = pool.alloc(initial as u64).expect("initial alloc should succeed");
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0x7e, initial as usize) };

        if let Some(q) = pool.realloc(p, grown as u64) {
            let bytes = unsafe { std::slice::from_raw_parts(q.as_ptr(), initial as usize) };
            prop_assert!(bytes.iter().all(|&b| b == 0x7e));
        }

        pool.unlock().expect("unlock");
        pool.destroy();
    }
}
