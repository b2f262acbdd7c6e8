//! Local clock representation: 64-bit fixed point with 32 bits of whole
//! seconds and 32 bits of fraction, measured from a process-wide
//! monotonic epoch. Timing anchors express their local instant in the
//! same representation.

use lazy_static::lazy_static;
use std::time::{Duration, Instant};

lazy_static! {
    static ref EPOCH: Instant = Instant::now();
}

/// Current local time in 32.32 fixed point seconds since the epoch.
pub fn now() -> u64 {
    from_duration(EPOCH.elapsed())
}

/// Convert a duration to 32.32 fixed point seconds.
pub fn from_duration(d: Duration) -> u64 {
    (d.as_secs() << 32) | ((u64::from(d.subsec_nanos()) << 32) / 1_000_000_000)
}

/// Convert 32.32 fixed point seconds to a duration.
pub fn to_duration(t: u64) -> Duration {
    let nanos = ((t & 0xFFFF_FFFF) * 1_000_000_000) >> 32;
    Duration::new(t >> 32, nanos as u32)
}

/// Stereo frames at `rate` covered by the fixed point interval `t`.
pub fn interval_to_frames(t: u64, rate: u32) -> u64 {
    ((t as u128 * rate as u128) >> 32) as u64
}

/// Fixed point interval covering `frames` stereo frames at `rate`.
pub fn frames_to_interval(frames: u64, rate: u32) -> u64 {
    (((frames as u128) << 32) / rate as u128) as u64
}
