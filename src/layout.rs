//! Session directory naming and the file set produced per recording.

use chrono::{DateTime, TimeZone};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const VIDEO_FILE: &str = "center_camera.mp4";
pub const CHARACTERISTICS_FILE: &str = "center_camera_characteristics.json";
pub const IMU_FILE: &str = "imu.csv";
pub const HMD_POSES_FILE: &str = "hmd_poses.csv";
pub const LEFT_CONTROLLER_POSES_FILE: &str = "left_controller_poses.csv";
pub const RIGHT_CONTROLLER_POSES_FILE: &str = "right_controller_poses.csv";

const SESSION_NAME_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Directory name for a session started at `at`, e.g. `20251119_120000`
pub fn session_dir_name<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    at.format(SESSION_NAME_FORMAT).to_string()
}

/// New session directory path under `root`, named from local time
pub fn new_session_dir(root: &Path) -> PathBuf {
    root.join(session_dir_name(&chrono::Local::now()))
}

/// Matches exactly eight digits, an underscore, six digits
pub fn is_session_dir_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() == 15
        && bytes[8] == b'_'
        && bytes[..8].iter().all(u8::is_ascii_digit)
        && bytes[9..].iter().all(u8::is_ascii_digit)
}

/// Sorted names of the session directories under `root`. A missing root
/// has no sessions.
pub fn list_sessions(root: &Path) -> io::Result<Vec<String>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut sessions = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if is_session_dir_name(name) {
                sessions.push(name.to_string());
            }
        }
    }
    sessions.sort();
    Ok(sessions)
}
