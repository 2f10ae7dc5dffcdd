use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::layout;

/// Sensor streams recorded next to the video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamId {
    Imu,
    HeadPose,
    LeftControllerPose,
    RightControllerPose,
}

impl StreamId {
    pub fn name(&self) -> &'static str {
        match self {
            StreamId::Imu => "imu",
            StreamId::HeadPose => "hmd_pose",
            StreamId::LeftControllerPose => "left_controller_pose",
            StreamId::RightControllerPose => "right_controller_pose",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            StreamId::Imu => layout::IMU_FILE,
            StreamId::HeadPose => layout::HMD_POSES_FILE,
            StreamId::LeftControllerPose => layout::LEFT_CONTROLLER_POSES_FILE,
            StreamId::RightControllerPose => layout::RIGHT_CONTROLLER_POSES_FILE,
        }
    }
}

pub const IMU_FIELDS: [&str; 14] = [
    "unix_time",
    "ovr_timestamp",
    "acc_x",
    "acc_y",
    "acc_z",
    "gyro_x",
    "gyro_y",
    "gyro_z",
    "vel_x",
    "vel_y",
    "vel_z",
    "ang_acc_x",
    "ang_acc_y",
    "ang_acc_z",
];

pub const POSE_FIELDS: [&str; 9] = [
    "unix_time",
    "ovr_timestamp",
    "pos_x",
    "pos_y",
    "pos_z",
    "rot_x",
    "rot_y",
    "rot_z",
    "rot_w",
];

/// Ordered column names of one CSV file. The first two columns are always
/// the wall time and the device time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<String>,
}

impl Schema {
    pub fn new<S: AsRef<str>>(fields: &[S]) -> Self {
        Schema {
            fields: fields.iter().map(|f| f.as_ref().to_string()).collect(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Number of value columns after the two time columns
    pub fn value_count(&self) -> usize {
        self.fields.len().saturating_sub(2)
    }

    pub fn header_line(&self) -> String {
        self.fields.join(",")
    }
}

/// A vector quantity in the snapshot that, when reported as all-zero, is
/// recomputed as the time derivative of another vector of the same width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Derivation {
    pub source: usize,
    pub target: usize,
    pub width: usize,
}

/// Everything a sampler needs to know about one stream
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub id: StreamId,
    pub schema: Schema,
    pub derivations: Vec<Derivation>,
    pub rate_hz: f64,
}

impl StreamSpec {
    /// IMU stream: acceleration falls back to d(velocity)/dt and angular
    /// acceleration to d(angular velocity)/dt.
    pub fn imu(rate_hz: f64) -> Self {
        StreamSpec {
            id: StreamId::Imu,
            schema: Schema::new(&IMU_FIELDS),
            derivations: vec![
                Derivation { source: 6, target: 0, width: 3 },
                Derivation { source: 3, target: 9, width: 3 },
            ],
            rate_hz,
        }
    }

    pub fn pose(id: StreamId, rate_hz: f64) -> Self {
        StreamSpec {
            id,
            schema: Schema::new(&POSE_FIELDS),
            derivations: Vec::new(),
            rate_hz,
        }
    }
}

/// Raw reading from the hardware state for one stream. `values` follows the
/// stream schema without the two time columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub device_time_s: f64,
    pub values: Vec<f64>,
}

impl Snapshot {
    pub fn new(device_time_s: f64, values: Vec<f64>) -> Self {
        Snapshot { device_time_s, values }
    }
}

/// One CSV row, immutable once built
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    wall_time_ms: i64,
    device_time_s: f64,
    values: Vec<f64>,
}

impl Sample {
    pub fn new(wall_time_ms: i64, device_time_s: f64, values: Vec<f64>) -> Self {
        Sample {
            wall_time_ms,
            device_time_s,
            values,
        }
    }

    pub fn wall_time_ms(&self) -> i64 {
        self.wall_time_ms
    }

    pub fn device_time_s(&self) -> f64 {
        self.device_time_s
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn to_csv_line(&self) -> String {
        let mut line = String::with_capacity(16 + self.values.len() * 12);
        let _ = write!(line, "{},{}", self.wall_time_ms, self.device_time_s);
        for v in &self.values {
            let _ = write!(line, ",{}", v);
        }
        line
    }
}
