//! Timestamp reconstruction
//!
//! The adapter counts microseconds in a wrapping 32-bit register (about 71
//! minutes per cycle). `ClockModel` extends these samples to 64 bits and maps
//! them, like locally captured timestamps, onto the time of day.

use std::time::Instant;

use chrono::{Local, Timelike};

const ROLLOVER_SPAN: i64 = 0x1_0000_0000;

/// Monotonic microsecond clock starting when the session was opened
#[derive(Debug, Clone, Copy)]
pub struct LocalClock {
    origin: Instant,
}

impl LocalClock {
    /// Start a new clock at zero
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Microseconds since the clock was started
    pub fn now_us(&self) -> i64 {
        self.origin.elapsed().as_micros() as i64
    }
}

impl Default for LocalClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A point in time of day with microsecond resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    /// Microseconds since local midnight of the first converted timestamp
    pub micros: i64,
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut t = self.micros.max(0);
        let micro = t % 1000;
        t /= 1000;
        let milli = t % 1000;
        t /= 1000;
        let sec = t % 60;
        t /= 60;
        let min = t % 60;
        t /= 60;
        let hour = t % 24;
        write!(
            f,
            "{:02}:{:02}:{:02}.{:03}.{:03}",
            hour, min, sec, milli, micro
        )
    }
}

/// Microseconds since local midnight
pub fn micros_since_midnight() -> i64 {
    let now = Local::now();
    let secs = now.num_seconds_from_midnight() as i64;
    // leap seconds show up as nanosecond values above 1e9
    let millis = (now.nanosecond() / 1_000_000).min(999) as i64;
    (secs * 1000 + millis) * 1000
}

/// Rollover tracking and wall-clock mapping for one session
#[derive(Debug, Clone, Default)]
pub struct ClockModel {
    last_device: Option<u32>,
    rollover: i64,
    offset: Option<(i64, i64)>,
}

impl ClockModel {
    /// Create a model with no samples seen
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend a 32-bit device timestamp to 64 bits
    ///
    /// A sample smaller than its predecessor counts as exactly one wrap, so
    /// samples must arrive more often than once per 32-bit cycle.
    pub fn extend(&mut self, device_us: u32) -> i64 {
        if let Some(last) = self.last_device {
            if device_us < last {
                self.rollover += ROLLOVER_SPAN;
            }
        }
        self.last_device = Some(device_us);
        device_us as i64 + self.rollover
    }

    /// Number of wraps observed so far
    pub fn rollovers(&self) -> i64 {
        self.rollover / ROLLOVER_SPAN
    }

    /// Map a 64-bit stamp onto the time of day
    ///
    /// The first call fixes the offset between stamps and local time; it is
    /// never recomputed afterwards.
    pub fn time_of_day(&mut self, stamp_us: i64) -> Timestamp {
        self.time_of_day_with(stamp_us, micros_since_midnight)
    }

    fn time_of_day_with(&mut self, stamp_us: i64, midnight: impl FnOnce() -> i64) -> Timestamp {
        let (clock_offset, stamp_offset) = *self.offset.get_or_insert_with(|| (midnight(), stamp_us));
        Timestamp {
            micros: stamp_us + clock_offset - stamp_offset,
        }
    }

    /// Convert a message timestamp
    ///
    /// With a device timestamp the value is rollover-corrected first; without
    /// one the locally captured microseconds are used unmodified.
    pub fn convert(&mut self, device_us: Option<u32>, local_us: i64) -> Timestamp {
        let stamp = match device_us {
            Some(device) => self.extend(device),
            None => local_us,
        };
        self.time_of_day(stamp)
    }
}
