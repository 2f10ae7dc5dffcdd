//! Collaborators the capture core talks to.
//!
//! Platform adapters implement these; the core never sees the native
//! recorder or the headset runtime directly. Device-layer failures come back
//! as `anyhow::Error` and are converted at the session boundary.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::stream::{Snapshot, StreamId};

/// Encoding parameters handed to the recorder at construction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderParams {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate: u32,
    pub key_frame_interval_s: u32,
}

impl Default for EncoderParams {
    fn default() -> Self {
        EncoderParams {
            width: 1280,
            height: 960,
            frame_rate: 30,
            bitrate: 10_000_000,
            key_frame_interval_s: 1,
        }
    }
}

/// Constructs native recorder handles
pub trait RecorderFactory: Send + Sync {
    fn construct(&self, params: &EncoderParams, output: &Path) -> anyhow::Result<Box<dyn RecorderHandle>>;
}

/// One live native recorder. Dropping the box releases the native handle.
pub trait RecorderHandle: Send {
    fn update_output_file(&mut self, output: &Path) -> anyhow::Result<()>;
    fn start(&mut self) -> anyhow::Result<()>;
    fn stop(&mut self) -> anyhow::Result<()>;
    fn close(&mut self) -> anyhow::Result<()>;
}

/// The headset camera session whose configuration depends on the recorder
/// output target
pub trait CameraSession: Send + Sync {
    /// Fire-and-forget request to tear down and reopen the hardware session
    fn reopen_session(&self);
    fn is_session_open(&self) -> bool;
}

/// Hardware state the samplers poll
pub trait SnapshotSource: Send + Sync {
    /// Current reading of the device monotonic clock, in seconds
    fn monotonic_now(&self) -> f64;

    /// Latest state for a stream, `None` while the stream is not tracked
    fn snapshot(&self, stream: StreamId) -> Option<Snapshot>;
}
