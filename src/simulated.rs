//! Simulated headset, camera session and recorder.
//!
//! Used by the CLI when no headset runtime is present. The headset walks a
//! slow circle while turning its head, and reports linear and angular
//! acceleration as unavailable so the sampler fills them from velocity.

use anyhow::Context;
use glam::{DQuat, DVec3};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::device::{CameraSession, EncoderParams, RecorderFactory, RecorderHandle, SnapshotSource};
use crate::stream::{Snapshot, StreamId};

const IMU_HARDWARE_HZ: f64 = 1000.0;
const TRACKING_HARDWARE_HZ: f64 = 72.0;
const CIRCLE_RADIUS_M: f64 = 1.0;
const CIRCLE_RATE_RAD_S: f64 = 0.4;
const HEAD_YAW_AMPLITUDE_RAD: f64 = 0.5;
const HEAD_YAW_RATE_RAD_S: f64 = 0.5;
const EYE_HEIGHT_M: f64 = 1.6;

pub struct SimulatedHeadset {
    origin: Instant,
    /// Device uptime at `origin`; the runtime clock does not start at zero
    boot_offset_s: f64,
}

impl SimulatedHeadset {
    pub fn new() -> Self {
        SimulatedHeadset {
            origin: Instant::now(),
            boot_offset_s: 1000.0,
        }
    }

    fn quantized_now(&self, hardware_hz: f64) -> f64 {
        let t = self.monotonic_now();
        (t * hardware_hz).floor() / hardware_hz
    }

    fn head(&self, t: f64) -> (DVec3, DQuat, DVec3, DVec3) {
        let phase = CIRCLE_RATE_RAD_S * t;
        let position = DVec3::new(
            CIRCLE_RADIUS_M * phase.cos(),
            EYE_HEIGHT_M,
            CIRCLE_RADIUS_M * phase.sin(),
        );
        let velocity = DVec3::new(
            -CIRCLE_RADIUS_M * CIRCLE_RATE_RAD_S * phase.sin(),
            0.0,
            CIRCLE_RADIUS_M * CIRCLE_RATE_RAD_S * phase.cos(),
        );
        let yaw = HEAD_YAW_AMPLITUDE_RAD * (HEAD_YAW_RATE_RAD_S * t).sin();
        let yaw_rate =
            HEAD_YAW_AMPLITUDE_RAD * HEAD_YAW_RATE_RAD_S * (HEAD_YAW_RATE_RAD_S * t).cos();
        (
            position,
            DQuat::from_rotation_y(yaw),
            velocity,
            DVec3::new(0.0, yaw_rate, 0.0),
        )
    }

    fn pose_values(position: DVec3, rotation: DQuat) -> Vec<f64> {
        vec![
            position.x, position.y, position.z, rotation.x, rotation.y, rotation.z, rotation.w,
        ]
    }
}

impl Default for SimulatedHeadset {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotSource for SimulatedHeadset {
    fn monotonic_now(&self) -> f64 {
        self.boot_offset_s + self.origin.elapsed().as_secs_f64()
    }

    fn snapshot(&self, stream: StreamId) -> Option<Snapshot> {
        match stream {
            StreamId::Imu => {
                let t = self.quantized_now(IMU_HARDWARE_HZ);
                let (_, _, velocity, angular_velocity) = self.head(t);
                let mut values = Vec::with_capacity(12);
                values.extend_from_slice(&[0.0, 0.0, 0.0]);
                values.extend_from_slice(&angular_velocity.to_array());
                values.extend_from_slice(&velocity.to_array());
                values.extend_from_slice(&[0.0, 0.0, 0.0]);
                Some(Snapshot::new(t, values))
            }
            StreamId::HeadPose => {
                let t = self.quantized_now(TRACKING_HARDWARE_HZ);
                let (position, rotation, _, _) = self.head(t);
                Some(Snapshot::new(t, Self::pose_values(position, rotation)))
            }
            StreamId::LeftControllerPose | StreamId::RightControllerPose => {
                let t = self.quantized_now(TRACKING_HARDWARE_HZ);
                let (position, rotation, _, _) = self.head(t);
                let side = if stream == StreamId::LeftControllerPose { -0.2 } else { 0.2 };
                let hand = position + rotation * DVec3::new(side, -0.4, -0.3);
                Some(Snapshot::new(t, Self::pose_values(hand, rotation)))
            }
        }
    }
}

/// Camera session that reports open a fixed delay after each reopen
pub struct SimulatedCamera {
    open: Arc<AtomicBool>,
    reopen_delay: Duration,
}

impl SimulatedCamera {
    pub fn new(reopen_delay: Duration) -> Self {
        SimulatedCamera {
            open: Arc::new(AtomicBool::new(true)),
            reopen_delay,
        }
    }
}

impl CameraSession for SimulatedCamera {
    fn reopen_session(&self) {
        self.open.store(false, Ordering::SeqCst);
        let open = Arc::clone(&self.open);
        let delay = self.reopen_delay;
        thread::spawn(move || {
            thread::sleep(delay);
            open.store(true, Ordering::SeqCst);
            log::debug!("Simulated camera session reopened");
        });
    }

    fn is_session_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Recorder that creates its output file on start and records nothing
pub struct SimulatedRecorderFactory;

impl RecorderFactory for SimulatedRecorderFactory {
    fn construct(&self, params: &EncoderParams, output: &Path) -> anyhow::Result<Box<dyn RecorderHandle>> {
        log::info!(
            "Simulated recorder {}x{}@{} ({} bps) -> {}",
            params.width,
            params.height,
            params.frame_rate,
            params.bitrate,
            output.display()
        );
        Ok(Box::new(SimulatedRecorder {
            output: output.to_path_buf(),
            started: false,
        }))
    }
}

struct SimulatedRecorder {
    output: PathBuf,
    started: bool,
}

impl RecorderHandle for SimulatedRecorder {
    fn update_output_file(&mut self, output: &Path) -> anyhow::Result<()> {
        self.output = output.to_path_buf();
        Ok(())
    }

    fn start(&mut self) -> anyhow::Result<()> {
        File::create(&self.output)
            .with_context(|| format!("creating {}", self.output.display()))?;
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        if !self.started {
            anyhow::bail!("recorder was not started");
        }
        self.started = false;
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.started = false;
        Ok(())
    }
}
