use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::device::EncoderParams;
use crate::error::CaptureResult;
use crate::layout;

/// Pinhole intrinsics of the center camera
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

/// Sidecar document describing the recorded camera
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CameraCharacteristics {
    pub camera_id: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub intrinsics: Option<Intrinsics>,
    #[serde(default)]
    pub distortion: Vec<f64>,
    pub timestamp_source: String,
    /// Anything else the platform reports, kept verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl CameraCharacteristics {
    pub fn for_encoder(camera_id: &str, params: &EncoderParams) -> Self {
        CameraCharacteristics {
            camera_id: camera_id.to_string(),
            width: params.width,
            height: params.height,
            frame_rate: params.frame_rate,
            timestamp_source: "monotonic".to_string(),
            ..Default::default()
        }
    }

    /// Write the sidecar into `session_dir`, returning its path
    pub fn save(&self, session_dir: &Path) -> CaptureResult<PathBuf> {
        fs::create_dir_all(session_dir)?;
        let path = session_dir.join(layout::CHARACTERISTICS_FILE);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> CaptureResult<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}
