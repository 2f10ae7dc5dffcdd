use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::device::EncoderParams;
use crate::error::{CaptureError, CaptureResult};
use crate::retry::RetryPolicy;
use crate::sampler::SamplerOptions;
use crate::stream::{StreamId, StreamSpec};
use crate::writer::WriterOptions;

/// Deferred start timing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartConfig {
    pub settle_delay_ms: u64,
    /// Deadline measured from the moment the deferred start is scheduled
    pub max_wait_for_camera_open_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for StartConfig {
    fn default() -> Self {
        StartConfig {
            settle_delay_ms: 500,
            max_wait_for_camera_open_ms: 2000,
            poll_interval_ms: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    pub imu_rate_hz: f64,
    pub pose_rate_hz: f64,
    pub controllers: bool,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        StreamsConfig {
            imu_rate_hz: 500.0,
            pose_rate_hz: 90.0,
            controllers: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub flush_every_rows: usize,
    pub flush_interval_ms: u64,
    pub drain_timeout_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            flush_every_rows: 200,
            flush_interval_ms: 250,
            drain_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub join_timeout_ms: u64,
    pub silence_threshold_ms: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            join_timeout_ms: 1000,
            silence_threshold_ms: 2000,
        }
    }
}

/// Full capture configuration, loadable from JSON
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub start: StartConfig,
    pub encoder: EncoderParams,
    pub streams: StreamsConfig,
    pub writer: WriterConfig,
    pub sampler: SamplerConfig,
    pub retry: RetryPolicy,
}

impl CaptureConfig {
    pub fn load(path: &Path) -> CaptureResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| CaptureError::IoFailure(format!("read {}: {}", path.display(), e)))?;
        let config: CaptureConfig = serde_json::from_str(&text)
            .map_err(|e| CaptureError::InvalidParameters(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CaptureResult<()> {
        if !(self.streams.imu_rate_hz > 0.0) || !(self.streams.pose_rate_hz > 0.0) {
            return Err(CaptureError::InvalidParameters(
                "sampling rates must be positive".to_string(),
            ));
        }
        if self.start.poll_interval_ms == 0 {
            return Err(CaptureError::InvalidParameters(
                "poll_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.writer.drain_timeout_ms == 0 || self.sampler.join_timeout_ms == 0 {
            return Err(CaptureError::InvalidParameters(
                "drain and join timeouts must be non-zero".to_string(),
            ));
        }
        if self.writer.flush_every_rows == 0 || self.writer.flush_interval_ms == 0 {
            return Err(CaptureError::InvalidParameters(
                "flush cadence must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Sensor streams recorded alongside the video
    pub fn stream_specs(&self) -> Vec<StreamSpec> {
        let mut specs = vec![
            StreamSpec::imu(self.streams.imu_rate_hz),
            StreamSpec::pose(StreamId::HeadPose, self.streams.pose_rate_hz),
        ];
        if self.streams.controllers {
            specs.push(StreamSpec::pose(StreamId::LeftControllerPose, self.streams.pose_rate_hz));
            specs.push(StreamSpec::pose(StreamId::RightControllerPose, self.streams.pose_rate_hz));
        }
        specs
    }

    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            flush_every_rows: self.writer.flush_every_rows,
            flush_interval: Duration::from_millis(self.writer.flush_interval_ms),
            drain_timeout: Duration::from_millis(self.writer.drain_timeout_ms),
        }
    }

    pub fn sampler_options(&self) -> SamplerOptions {
        SamplerOptions {
            join_timeout: Duration::from_millis(self.sampler.join_timeout_ms),
            silence_threshold: Duration::from_millis(self.sampler.silence_threshold_ms),
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.start.settle_delay_ms)
    }

    pub fn max_wait_for_camera_open(&self) -> Duration {
        Duration::from_millis(self.start.max_wait_for_camera_open_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.start.poll_interval_ms)
    }
}
