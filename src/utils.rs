use std::time::Duration;

use nix::time::{clock_gettime, ClockId};

/// CLOCK_MONOTONIC in nanoseconds. Comparable across processes on the same host.
pub fn monotonic_ns() -> u64 {
    clock_gettime(ClockId::CLOCK_MONOTONIC)
        .map(|ts| {
            (ts.tv_sec() as u64)
                .saturating_mul(1_000_000_000)
                .saturating_add(ts.tv_nsec() as u64)
        })
        .unwrap_or(0)
}

/// Age of a `monotonic_ns` timestamp, `None` if it was never set.
pub fn age_of(timestamp_ns: u64) -> Option<Duration> {
    if timestamp_ns == 0 {
        return None;
    }
    Some(Duration::from_nanos(
        monotonic_ns().saturating_sub(timestamp_ns),
    ))
}

/// Generate a random browser id of the form `browser_<16 hex digits>`.
pub fn generate_channel_id() -> String {
    format!("browser_{:016x}", rand::random::<u64>())
}
