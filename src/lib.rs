// Quest Capture core
// Recording-session lifecycle and timestamp synchronization for headset capture

pub mod config;
pub mod device;
pub mod error;
pub mod health;
pub mod layout;
pub mod metadata;
pub mod retry;
pub mod sampler;
pub mod session;
pub mod simulated;
pub mod stream;
pub mod time_base;
pub mod writer;

pub use config::CaptureConfig;
pub use device::{CameraSession, EncoderParams, RecorderFactory, RecorderHandle, SnapshotSource};
pub use error::{CaptureError, CaptureResult};
pub use metadata::CameraCharacteristics;
pub use sampler::SensorSampler;
pub use session::{RecordingSession, SessionState, StreamReport};
pub use stream::{Sample, Snapshot, StreamId, StreamSpec};
pub use time_base::TimeBase;
pub use writer::SampleWriter;
