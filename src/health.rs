use std::time::{Duration, Instant};

/// Silence tracking for one sampled stream.
///
/// Owned by the sampler loop. Warns once when the hardware stops producing
/// fresh samples and once more when it recovers.
#[derive(Debug, Clone)]
pub struct StreamHealth {
    name: String,
    last_fresh: Instant,
    silence_threshold: Duration,
    silent: bool,
}

impl StreamHealth {
    pub fn new(name: &str, silence_threshold: Duration) -> Self {
        StreamHealth {
            name: name.to_string(),
            last_fresh: Instant::now(),
            silence_threshold,
            silent: false,
        }
    }

    /// Record a fresh sample
    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    pub fn update_at(&mut self, now: Instant) {
        if self.silent {
            log::info!(
                "[{}] samples resumed after {:.1}s",
                self.name,
                now.duration_since(self.last_fresh).as_secs_f64()
            );
            self.silent = false;
        }
        self.last_fresh = now;
    }

    /// Called on ticks without a fresh sample. Returns true when the stream
    /// has just crossed the silence threshold.
    pub fn check(&mut self) -> bool {
        self.check_at(Instant::now())
    }

    pub fn check_at(&mut self, now: Instant) -> bool {
        let since = now.saturating_duration_since(self.last_fresh);
        if !self.silent && since > self.silence_threshold {
            self.silent = true;
            log::warn!(
                "[{}] no new samples for {:.1}s",
                self.name,
                since.as_secs_f64()
            );
            return true;
        }
        false
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_detection() {
        let start = Instant::now();
        let mut health = StreamHealth::new("imu", Duration::from_secs(1));
        health.update_at(start);

        assert!(!health.check_at(start + Duration::from_millis(500)));
        assert!(!health.is_silent());

        assert!(health.check_at(start + Duration::from_millis(1100)));
        assert!(health.is_silent());

        // Only reported once
        assert!(!health.check_at(start + Duration::from_secs(5)));

        health.update_at(start + Duration::from_secs(6));
        assert!(!health.is_silent());
    }
}
