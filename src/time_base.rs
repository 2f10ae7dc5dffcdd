use serde::{Deserialize, Serialize};

/// Mapping from the headset's monotonic clock to unix wall time.
///
/// Anchored once when a recording starts and shared by value with every
/// sampler of that recording, so all streams convert through the same pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeBase {
    pub anchor_monotonic: f64,
    pub anchor_wall_ms: i64,
}

impl TimeBase {
    pub fn anchor(device_monotonic_now: f64, wall_now_ms: i64) -> Self {
        TimeBase {
            anchor_monotonic: device_monotonic_now,
            anchor_wall_ms: wall_now_ms,
        }
    }

    /// Anchor against the current system wall clock
    pub fn anchor_now(device_monotonic_now: f64) -> Self {
        Self::anchor(device_monotonic_now, chrono::Utc::now().timestamp_millis())
    }

    /// Convert a device timestamp (seconds) to unix milliseconds
    pub fn to_wall_ms(&self, device_time_s: f64) -> i64 {
        self.anchor_wall_ms + ((device_time_s - self.anchor_monotonic) * 1000.0).round() as i64
    }
}
