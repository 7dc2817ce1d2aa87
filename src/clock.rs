//! Monotonic millisecond clock.
//!
//! All deadline bookkeeping in the core (idle sweeps, reconnect backoff,
//! stat intervals) works on milliseconds since process start, so values are
//! small, cheap to compare, and immune to wall-clock jumps.

use std::time::Instant;

use once_cell::sync::Lazy;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds elapsed since the first call in this process.
pub fn monotonic_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// Wall-clock seconds since the Unix epoch, for stat reporting.
pub fn unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_ms_is_nondecreasing() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }
}
