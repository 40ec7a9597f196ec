//! A cross-process shared-memory allocator.
//!
//! A [`Pool`] is a dynamic-memory heap carved out of a single
//! memory-mapped region that multiple OS processes can map into their
//! own address spaces. It hands out `alloc`/`free`/`realloc` the way a
//! regular heap does, but every in-pool pointer is actually a 32-bit
//! byte offset from the region's base, because the region is mapped
//! at independent addresses in every attached process and can be
//! remapped to a new address within a process when another process
//! grows it.
//!
//! All mutating operations on a pool serialize on a single
//! cross-process, recursive, (where the platform supports it) robust
//! mutex: there is no thread-caching or per-CPU sharding here, only
//! the one critical section.
mod alloc;
mod chunk;
mod env;
mod error;
mod grow;
mod lock;
mod names;
mod offset;
mod platform;
mod pool;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
mod debug_check;

pub use error::Error;
pub use pool::{delete_by_name, Pool, PoolInfo};
