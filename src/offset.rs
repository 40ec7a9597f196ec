//! Offset primitives.
//!
//! Every in-pool linkage is a 32-bit byte offset from the pool's base,
//! never a pointer: the region is mapped at independent, unrelated
//! addresses in every attached process, and may be remapped to a new
//! address within the same process after a growth. An `Offset` is
//! only ever turned into a real pointer while the pool's lock is held
//! (see `crate::lock`), and the resulting pointer must not outlive
//! that critical section.
use std::ffi::c_void;
use std::ptr::NonNull;

/// A 32-bit byte offset into a pool, or the "none" sentinel.
///
/// `Offset::NONE` is distinct from any in-pool location: the pool
/// header itself occupies the first bytes of the region, so a valid
/// chunk offset is always `>= CHUNK_HEADER_SIZE`-adjacent to the
/// header (never 0), which would otherwise collide with a C-style "0
/// means end of list" convention. We sidestep that ambiguity by giving
/// "none" a sentinel value outside the representable address space of
/// any pool this crate will ever create.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
#[repr(transparent)]
pub struct Offset(u32);

impl Offset {
    /// The "no such offset" sentinel, used for list ends.
    pub const NONE: Offset = Offset(u32::MAX);

    /// Wraps a raw byte offset. Does not validate that the offset
    /// actually lies within any particular pool.
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Offset(raw)
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == Self::NONE.0
    }

    #[inline]
    pub const fn is_some(self) -> bool {
        !self.is_none()
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Converts this offset to an address relative to `base`.
    ///
    /// # Safety
    ///
    /// `base` must be the current mapping's base address, and this
    /// offset must address a live, in-bounds location in that
    /// mapping. The caller must hold the pool's lock: the mapping may
    /// move between lock acquisitions.
    #[inline]
    pub unsafe fn to_ptr(self, base: NonNull<u8>) -> *mut u8 {
        debug_assert!(self.is_some(), "to_ptr on Offset::NONE");
        base.as_ptr().add(self.0 as usize)
    }

    /// Like `to_ptr`, but returns `None` for `Offset::NONE` instead of
    /// asserting.
    ///
    /// # Safety
    ///
    /// Same requirements as `to_ptr` when the result is `Some`.
    #[inline]
    pub unsafe fn to_ptr_checked(self, base: NonNull<u8>) -> Option<*mut u8> {
        if self.is_none() {
            None
        } else {
            Some(self.to_ptr(base))
        }
    }

    /// Computes the offset of `ptr` relative to `base`.
    ///
    /// # Safety
    ///
    /// `ptr` must lie within the mapping rooted at `base`, and the
    /// distance must fit in a `u32`.
    #[inline]
    pub unsafe fn from_ptr(base: NonNull<u8>, ptr: *const c_void) -> Self {
        let delta = (ptr as usize) - (base.as_ptr() as usize);
        debug_assert!(delta <= u32::MAX as usize, "pool larger than 4 GiB");
        Offset(delta as u32)
    }
}

/// The spatial-chain/freelist doubly-linked list node shape: a `prev`
/// and `next` offset pair, shared by `ChunkHeader.chain` (the
/// address-ordered chain of all chunks) and `FreelistLinks` (the
/// per-bucket chain of free chunks).
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct OffsetLinks {
    pub prev: Offset,
    pub next: Offset,
}

impl OffsetLinks {
    pub const EMPTY: OffsetLinks = OffsetLinks {
        prev: Offset::NONE,
        next: Offset::NONE,
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn none_is_distinguishable() {
        assert!(Offset::NONE.is_none());
        assert!(!Offset::new(0).is_none());
        assert!(Offset::new(0).is_some());
    }

    #[test]
    fn roundtrip_to_from_ptr() {
        let mut buf = vec![0u8; 64];
        let base = NonNull::new(buf.as_mut_ptr()).unwrap();

        let offset = Offset::new(40);
        let ptr = unsafe { offset.to_ptr(base) };
        let back = unsafe { Offset::from_ptr(base, ptr as *const c_void) };
        assert_eq!(offset, back);
    }
}
