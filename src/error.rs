//! The error taxonomy exposed by the pool's public operations.
//!
//! Mirrors the `AM_*` status codes of the original C allocator this
//! crate is modeled on: a small closed set of conditions callers can
//! match on, plus the raw OS error code for diagnostics.
use std::fmt;

/// Failure modes the pool's public operations can report.
///
/// `os_error`, when present, is the raw `errno` (Unix) or
/// `GetLastError()` (Windows) value that caused the failure, kept
/// around purely for diagnostics the way `am_shm_t.error` is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// A required argument was null, empty, or otherwise nonsensical.
    Invalid,
    /// Allocation of a host-side resource (not a pool chunk) failed.
    NoMemory,
    /// Not enough free disk space to back a newly created region.
    NoSpace,
    /// A platform mapping/unmapping primitive failed.
    Fault { os_error: i32 },
    /// A `lock_timeout` call exceeded its deadline.
    TimedOut,
    /// The region's name has no corresponding platform object.
    NotFound,
    /// Growth is not supported on this platform, or the pool is
    /// already at its configured maximum size.
    NotSupported,
    /// An otherwise-unclassified platform failure.
    Other { os_error: i32 },
}

impl Error {
    /// Returns the raw OS error code carried by this variant, if any.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Error::Fault { os_error } | Error::Other { os_error } => Some(*os_error),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Invalid => write!(f, "invalid argument"),
            Error::NoMemory => write!(f, "out of memory"),
            Error::NoSpace => write!(f, "insufficient free disk space"),
            Error::Fault { os_error } => write!(f, "mapping failure (os error {})", os_error),
            Error::TimedOut => write!(f, "timed out waiting for the pool lock"),
            Error::NotFound => write!(f, "no such shared pool"),
            Error::NotSupported => write!(f, "operation not supported on this platform"),
            Error::Other { os_error } => write!(f, "platform error (os error {})", os_error),
        }
    }
}

impl std::error::Error for Error {}
