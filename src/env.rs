//! Environment-variable overrides for the pool's size limits.
//!
//! Grounded in `shared.c`'s `am_shm_max_pool_size()`: the override is
//! only honored when it parses as a whole, non-negative integer (in
//! decimal, hex `0x...`, or octal `0...`, exactly as C's
//! `strtoull(s, &endp, 0)` would accept) and the parsed value is
//! strictly positive and strictly below the hard ceiling. The value
//! returned to callers is always rounded up to a whole number of
//! pages first, matching `am_shm_create`'s call site
//! (`shared.c:678`/`shared.c:681`), which wraps both the
//! `BLOCKFILE`-cache and flat-override results in `page_size(...)`
//! before using them as `max_size`.
use std::env;

use crate::chunk::page_align;

/// Name of the environment variable that can lower (never raise) the
/// per-pool byte ceiling.
pub const SHARED_MAX_SIZE_VAR: &str = "CROSSMEM_SHARED_MAX_SIZE";

/// Hard ceiling on any pool's `max_size`, regardless of environment
/// overrides. `shared.c` defines an analogous compile-time constant;
/// this crate picks 1 GiB (see DESIGN.md's Open Question decisions).
pub const HARD_CEILING: u64 = 1 << 30;

/// Pool names beginning with this prefix opt into the "cache" sizing
/// path of `Pool::create` (quarter-of-physical-RAM default instead of
/// the flat hard ceiling).
pub const CACHE_NAME_PREFIX: &str = "BLOCKFILE";

fn parse_override(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    let value = if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).ok()?
    } else if trimmed.len() > 1 && trimmed.starts_with('0') {
        u64::from_str_radix(&trimmed[1..], 8).ok()?
    } else {
        trimmed.parse::<u64>().ok()?
    };

    if value > 0 && value < HARD_CEILING {
        Some(value)
    } else {
        None
    }
}

/// Reads `SHARED_MAX_SIZE_VAR`, honoring it only when strictly
/// positive and strictly below `HARD_CEILING`; otherwise returns the
/// hard ceiling itself, page-aligned to `page_size`.
pub fn shared_max_size(page_size: u64) -> u64 {
    let raw = env::var(SHARED_MAX_SIZE_VAR)
        .ok()
        .and_then(|v| parse_override(&v))
        .unwrap_or(HARD_CEILING);
    page_align(raw, page_size)
}

/// Determines `max_size` for a pool named `name`, given the host's
/// total physical memory (0 if unknown), its page size, and whether
/// the caller asked for the new-style initializer. Grounded in
/// `shared.c`'s branch in `am_shm_create` between the `BLOCKFILE`
/// cache-sizing path and the flat override path; the result is always
/// page-aligned before being returned, matching both of that
/// function's call sites.
pub fn max_size_for(name: &str, use_new_initializer: bool, total_system_memory: u64, page_size: u64) -> u64 {
    if use_new_initializer && name.starts_with(CACHE_NAME_PREFIX) {
        let overridden = env::var(SHARED_MAX_SIZE_VAR)
            .ok()
            .and_then(|v| parse_override(&v));

        let raw = if let Some(v) = overridden {
            v
        } else {
            let quarter = total_system_memory / 4;
            if quarter > 0 && quarter < HARD_CEILING {
                quarter
            } else {
                HARD_CEILING
            }
        };
        page_align(raw, page_size)
    } else {
        shared_max_size(page_size)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_decimal_hex_octal() {
        assert_eq!(parse_override("4096"), Some(4096));
        assert_eq!(parse_override("0x1000"), Some(0x1000));
        assert_eq!(parse_override("0777"), Some(0o777));
    }

    #[test]
    fn rejects_zero_negative_and_oversized() {
        assert_eq!(parse_override("0"), None);
        assert_eq!(parse_override("not a number"), None);
        assert_eq!(parse_override(&HARD_CEILING.to_string()), None);
        assert_eq!(parse_override(&(HARD_CEILING * 2).to_string()), None);
    }

    #[test]
    fn cache_path_falls_back_to_quarter_of_ram() {
        // No env var set in this process; use a RAM size comfortably
        // under the hard ceiling so the quarter is the selected value.
        // HARD_CEILING/4 is already page-aligned for any realistic
        // page size, so it survives the rounding step unchanged.
        let total = HARD_CEILING; // quarter = HARD_CEILING/4 < HARD_CEILING
        let max = max_size_for("BLOCKFILE_agent_cache", true, total, 4096);
        assert_eq!(max, total / 4);
    }

    #[test]
    fn results_are_always_page_aligned() {
        assert_eq!(shared_max_size(4096) % 4096, 0);
        assert_eq!(max_size_for("policy_cache", false, 0, 4096) % 4096, 0);
        assert_eq!(max_size_for("BLOCKFILE_cache", true, 3 * 4096, 4096) % 4096, 0);
    }

    #[test]
    fn non_cache_path_uses_flat_ceiling_when_unset() {
        assert_eq!(max_size_for("policy_cache", false, 0, 4096), HARD_CEILING);
    }
}
