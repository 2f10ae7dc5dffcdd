//! Recording session state machine.
//!
//! Owns the native recorder handle and the sensor samplers of one session
//! directory. Starting is deferred while the camera session reopens after
//! an output change: the start waits a settle delay, then polls the camera
//! until it reports open or the deadline passes, and starts regardless
//! once the deadline is hit. All device failures are caught, logged and
//! converted here; the state always moves to a safe value.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::CaptureConfig;
use crate::device::{CameraSession, RecorderFactory, RecorderHandle, SnapshotSource};
use crate::error::{CaptureError, CaptureResult};
use crate::layout;
use crate::metadata::CameraCharacteristics;
use crate::sampler::{SamplerStats, SensorSampler};
use crate::stream::StreamId;
use crate::time_base::TimeBase;
use crate::writer::{SampleWriter, WriterStats};

/// Session state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No recorder handle
    Idle,
    /// Recorder constructed for an output file, not recording
    Prepared,
    /// Output changed and the camera session asked to reopen
    AwaitingHardwareReady,
    Recording,
    /// Transient while stop commands are issued
    Stopping,
    /// Handle released; `prepare` starts over
    Closed,
}

/// Per-stream counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamReport {
    pub stream: StreamId,
    pub sampler: SamplerStats,
    pub writer: WriterStats,
}

struct PendingStart {
    cancel_tx: Sender<()>,
}

struct SessionInner {
    state: SessionState,
    handle: Option<Box<dyn RecorderHandle>>,
    session_dir: Option<PathBuf>,
    samplers: Vec<SensorSampler>,
    time_base: Option<TimeBase>,
    pending_start: Option<PendingStart>,
    start_generation: u64,
    /// Counters of the last sampler set closed
    final_reports: Vec<StreamReport>,
}

#[derive(Clone, Copy)]
struct DeferredTiming {
    settle: Duration,
    deadline: Instant,
    max_wait: Duration,
    poll: Duration,
}

pub struct RecordingSession {
    config: CaptureConfig,
    factory: Arc<dyn RecorderFactory>,
    camera: Option<Arc<dyn CameraSession>>,
    source: Arc<dyn SnapshotSource>,
    inner: Arc<Mutex<SessionInner>>,
}

impl RecordingSession {
    pub fn new(
        config: CaptureConfig,
        factory: Arc<dyn RecorderFactory>,
        camera: Option<Arc<dyn CameraSession>>,
        source: Arc<dyn SnapshotSource>,
    ) -> Self {
        RecordingSession {
            config,
            factory,
            camera,
            source,
            inner: Arc::new(Mutex::new(SessionInner {
                state: SessionState::Idle,
                handle: None,
                session_dir: None,
                samplers: Vec::new(),
                time_base: None,
                pending_start: None,
                start_generation: 0,
                final_reports: Vec::new(),
            })),
        }
    }

    pub fn state(&self) -> SessionState {
        lock_inner(&self.inner).state
    }

    pub fn is_recording(&self) -> bool {
        self.state() == SessionState::Recording
    }

    /// Anchor of the current (or last) recording
    pub fn time_base(&self) -> Option<TimeBase> {
        lock_inner(&self.inner).time_base
    }

    pub fn session_dir(&self) -> Option<PathBuf> {
        lock_inner(&self.inner).session_dir.clone()
    }

    /// Per-stream counters of the open sensor files, or of the last set
    /// closed once the session has been stopped and closed
    pub fn stream_stats(&self) -> Vec<StreamReport> {
        let inner = lock_inner(&self.inner);
        if inner.samplers.is_empty() {
            return inner.final_reports.clone();
        }
        inner.samplers.iter().map(report).collect()
    }

    /// Tear down any previous recorder, construct a new one writing into
    /// `session_dir`, save the camera sidecar and open the sensor files.
    /// On failure the session is left `Idle`.
    pub fn prepare(&self, session_dir: &Path, metadata: &CameraCharacteristics) -> CaptureResult<()> {
        let mut inner = lock_inner(&self.inner);
        teardown(&mut inner);
        inner.state = SessionState::Idle;

        fs::create_dir_all(session_dir).map_err(|e| {
            CaptureError::IoFailure(format!("create {}: {}", session_dir.display(), e))
        })?;

        let output = session_dir.join(layout::VIDEO_FILE);
        let params = self.config.encoder;
        let factory = Arc::clone(&self.factory);
        let handle = self
            .config
            .retry
            .run("recorder construct", || {
                guarded_construct(|| factory.construct(&params, &output))
            })
            .map_err(|e| {
                log::error!("Failed to construct recorder for {}: {:#}", output.display(), e);
                CaptureError::DeviceInitFailure(format!("{:#}", e))
            })?;
        inner.handle = Some(handle);

        if let Err(e) = metadata.save(session_dir) {
            log::warn!("Could not write camera characteristics: {}", e);
        }

        match self.open_samplers(session_dir) {
            Ok(samplers) => inner.samplers = samplers,
            Err(e) => {
                log::error!("Could not open sensor files in {}: {}", session_dir.display(), e);
                teardown(&mut inner);
                inner.state = SessionState::Idle;
                return Err(e);
            }
        }

        inner.session_dir = Some(session_dir.to_path_buf());
        inner.state = SessionState::Prepared;
        log::info!("Prepared recording into {}", session_dir.display());
        Ok(())
    }

    /// Point the existing recorder at `session_dir` without reconstructing
    /// it, save the sidecar and ask the camera session to reopen. Starts
    /// issued until the camera reports open are deferred; a start already
    /// pending is rescheduled against the new reopen. If the sensor files
    /// cannot be opened nothing changes.
    pub fn reopen_with_output(
        &self,
        session_dir: &Path,
        metadata: &CameraCharacteristics,
    ) -> CaptureResult<()> {
        let mut inner = lock_inner(&self.inner);
        if inner.handle.is_none() {
            return Err(CaptureError::NotPrepared);
        }
        if inner.state == SessionState::Recording {
            return Err(CaptureError::InvalidParameters(
                "stop recording before changing the output".to_string(),
            ));
        }

        fs::create_dir_all(session_dir).map_err(|e| {
            CaptureError::IoFailure(format!("create {}: {}", session_dir.display(), e))
        })?;
        let moved = inner.session_dir.as_deref() != Some(session_dir);
        let replacement = if moved {
            match self.open_samplers(session_dir) {
                Ok(samplers) => Some(samplers),
                Err(e) => {
                    log::error!("Could not open sensor files in {}: {}", session_dir.display(), e);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let had_pending_start = inner.pending_start.is_some();
        cancel_pending_start(&mut inner);

        let output = session_dir.join(layout::VIDEO_FILE);
        if let Some(handle) = inner.handle.as_mut() {
            // Failure is logged inside; the reopen still goes ahead
            let _ = guarded("update_output_file", || handle.update_output_file(&output));
        }

        if let Err(e) = metadata.save(session_dir) {
            log::warn!("Could not write camera characteristics: {}", e);
        }

        if let Some(samplers) = replacement {
            close_samplers(&mut inner);
            inner.samplers = samplers;
            inner.session_dir = Some(session_dir.to_path_buf());
        }

        match &self.camera {
            Some(camera) => camera.reopen_session(),
            None => log::debug!("No camera session to reopen"),
        }
        inner.state = SessionState::AwaitingHardwareReady;
        log::info!("Output set to {}, waiting for camera reopen", output.display());

        if had_pending_start {
            log::info!("Rescheduling pending start after output change");
            self.schedule_deferred_start(&mut inner);
        }
        Ok(())
    }

    /// Start recording. Deferred while the camera session reopens, a no-op
    /// without a recorder handle or while already recording. Cancels any
    /// earlier deferred start.
    pub fn start(&self) -> CaptureResult<()> {
        let mut inner = lock_inner(&self.inner);
        if inner.handle.is_none() {
            log::debug!("start() ignored, no recorder prepared");
            return Ok(());
        }

        match inner.state {
            SessionState::Recording => {
                log::debug!("start() ignored, already recording");
                Ok(())
            }
            SessionState::AwaitingHardwareReady => {
                cancel_pending_start(&mut inner);
                self.schedule_deferred_start(&mut inner);
                Ok(())
            }
            _ => {
                cancel_pending_start(&mut inner);
                begin_recording(&mut inner, self.source.as_ref())
            }
        }
    }

    /// Stop recording and any pending deferred start. The session ends up
    /// `Prepared` even if the device stop fails.
    pub fn stop(&self) -> CaptureResult<()> {
        let mut inner = lock_inner(&self.inner);
        cancel_pending_start(&mut inner);

        match inner.state {
            SessionState::Recording => stop_recording(&mut inner),
            SessionState::AwaitingHardwareReady => {
                inner.state = SessionState::Prepared;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Stop if recording, close the sensor files, close and release the
    /// recorder. Never fails; calling it again does nothing.
    pub fn close(&self) {
        let mut inner = lock_inner(&self.inner);
        if inner.state == SessionState::Closed {
            return;
        }
        teardown(&mut inner);
        inner.state = SessionState::Closed;
        log::info!("Recording session closed");
    }

    fn open_samplers(&self, session_dir: &Path) -> CaptureResult<Vec<SensorSampler>> {
        let mut samplers = Vec::new();
        for spec in self.config.stream_specs() {
            let path = session_dir.join(spec.id.file_name());
            let writer = SampleWriter::open(&path, spec.schema.clone(), self.config.writer_options())?;
            samplers.push(SensorSampler::new(
                spec,
                Arc::clone(&self.source),
                writer,
                self.config.sampler_options(),
            ));
        }
        Ok(samplers)
    }

    fn schedule_deferred_start(&self, inner: &mut SessionInner) {
        let generation = inner.start_generation;
        let (cancel_tx, cancel_rx) = channel::bounded::<()>(1);
        let timing = DeferredTiming {
            settle: self.config.settle_delay(),
            deadline: Instant::now() + self.config.max_wait_for_camera_open(),
            max_wait: self.config.max_wait_for_camera_open(),
            poll: self.config.poll_interval(),
        };

        let weak = Arc::downgrade(&self.inner);
        let camera = self.camera.clone();
        let source = Arc::clone(&self.source);
        let spawned = thread::Builder::new()
            .name("deferred-start".into())
            .spawn(move || run_deferred_start(weak, camera, source, cancel_rx, generation, timing));

        match spawned {
            Ok(_) => {
                log::debug!("Deferred start scheduled (generation {})", generation);
                inner.pending_start = Some(PendingStart { cancel_tx });
            }
            Err(e) => {
                log::error!("Could not schedule deferred start ({}), starting now", e);
                let _ = begin_recording(inner, self.source.as_ref());
            }
        }
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock_inner(inner: &Mutex<SessionInner>) -> MutexGuard<'_, SessionInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run one device command, turning errors and panics into
/// `DeviceCommandFailure`
fn guarded<F>(command: &str, op: F) -> CaptureResult<()>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(op)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            log::error!("Recorder {} failed: {:#}", command, e);
            Err(CaptureError::command(command, format!("{:#}", e)))
        }
        Err(_) => {
            log::error!("Recorder {} panicked", command);
            Err(CaptureError::command(command, "device adapter panicked"))
        }
    }
}

fn guarded_construct<F>(op: F) -> anyhow::Result<Box<dyn RecorderHandle>>
where
    F: FnOnce() -> anyhow::Result<Box<dyn RecorderHandle>>,
{
    match panic::catch_unwind(AssertUnwindSafe(op)) {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("device adapter panicked during construct")),
    }
}

fn cancel_pending_start(inner: &mut SessionInner) {
    inner.start_generation += 1;
    if let Some(pending) = inner.pending_start.take() {
        drop(pending.cancel_tx);
        log::debug!("Canceled pending deferred start");
    }
}

/// Anchor the session clock, start the recorder and every sampler
fn begin_recording(inner: &mut SessionInner, source: &dyn SnapshotSource) -> CaptureResult<()> {
    let handle = match inner.handle.as_mut() {
        Some(handle) => handle,
        None => return Ok(()),
    };

    let time_base = TimeBase::anchor_now(source.monotonic_now());
    let result = guarded("start", || handle.start());

    for sampler in inner.samplers.iter_mut() {
        let rate = sampler.spec().rate_hz;
        if let Err(e) = sampler.start(time_base, rate) {
            log::error!("[{}] sampler did not start: {}", sampler.spec().id.name(), e);
        }
    }

    inner.time_base = Some(time_base);
    inner.state = SessionState::Recording;
    log::info!(
        "Recording started (anchor {:.3}s -> {})",
        time_base.anchor_monotonic,
        time_base.anchor_wall_ms
    );
    result
}

fn stop_recording(inner: &mut SessionInner) -> CaptureResult<()> {
    inner.state = SessionState::Stopping;
    let result = match inner.handle.as_mut() {
        Some(handle) => guarded("stop", || handle.stop()),
        None => Ok(()),
    };

    for sampler in inner.samplers.iter_mut() {
        if let Err(e) = sampler.stop() {
            log::warn!("[{}] {}", sampler.spec().id.name(), e);
        }
    }

    inner.state = SessionState::Prepared;
    log::info!("Recording stopped");
    result
}

fn report(sampler: &SensorSampler) -> StreamReport {
    StreamReport {
        stream: sampler.spec().id,
        sampler: sampler.stats(),
        writer: sampler.writer_stats(),
    }
}

fn close_samplers(inner: &mut SessionInner) {
    if inner.samplers.is_empty() {
        return;
    }
    let mut reports = Vec::with_capacity(inner.samplers.len());
    for mut sampler in inner.samplers.drain(..) {
        if let Err(e) = sampler.close() {
            log::warn!("[{}] {}", sampler.spec().id.name(), e);
        }
        reports.push(report(&sampler));
    }
    inner.final_reports = reports;
}

/// Best-effort release of everything the session owns
fn teardown(inner: &mut SessionInner) {
    cancel_pending_start(inner);
    if inner.state == SessionState::Recording {
        let _ = stop_recording(inner);
    }
    close_samplers(inner);

    if let Some(mut handle) = inner.handle.take() {
        let _ = guarded("close", || handle.close());
        // Released whether or not close succeeded
        drop(handle);
    }
    inner.session_dir = None;
}

/// True when the wait ended early because the start was canceled
fn wait_canceled(cancel_rx: &Receiver<()>, wait: Duration) -> bool {
    !matches!(cancel_rx.recv_timeout(wait), Err(RecvTimeoutError::Timeout))
}

fn run_deferred_start(
    inner: Weak<Mutex<SessionInner>>,
    camera: Option<Arc<dyn CameraSession>>,
    source: Arc<dyn SnapshotSource>,
    cancel_rx: Receiver<()>,
    generation: u64,
    timing: DeferredTiming,
) {
    if wait_canceled(&cancel_rx, timing.settle) {
        return;
    }

    if let Some(camera) = camera {
        loop {
            if camera.is_session_open() {
                break;
            }
            let now = Instant::now();
            if now >= timing.deadline {
                log::warn!(
                    "Camera session not open after {:.1}s, starting recording anyway",
                    timing.max_wait.as_secs_f64()
                );
                break;
            }
            if wait_canceled(&cancel_rx, timing.poll.min(timing.deadline - now)) {
                return;
            }
        }
    }

    let inner = match inner.upgrade() {
        Some(inner) => inner,
        None => return,
    };
    let mut guard = lock_inner(&inner);
    if guard.start_generation != generation || guard.pending_start.is_none() {
        return;
    }
    guard.pending_start = None;
    let _ = begin_recording(&mut guard, source.as_ref());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StartConfig;
    use crate::retry::RetryPolicy;
    use crate::stream::Snapshot;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct DeviceLog {
        constructs: AtomicU32,
        updates: AtomicU32,
        starts: AtomicU32,
        stops: AtomicU32,
        closes: AtomicU32,
        releases: AtomicU32,
        fail_constructs: AtomicU32,
        fail_stop: AtomicBool,
        fail_close: AtomicBool,
        panic_on_start: AtomicBool,
        last_output: Mutex<Option<PathBuf>>,
    }

    impl DeviceLog {
        fn count(counter: &AtomicU32) -> u32 {
            counter.load(Ordering::SeqCst)
        }
    }

    struct MockFactory {
        log: Arc<DeviceLog>,
    }

    struct MockHandle {
        log: Arc<DeviceLog>,
    }

    impl RecorderFactory for MockFactory {
        fn construct(
            &self,
            _params: &crate::device::EncoderParams,
            output: &Path,
        ) -> anyhow::Result<Box<dyn RecorderHandle>> {
            self.log.constructs.fetch_add(1, Ordering::SeqCst);
            if self.log.fail_constructs.load(Ordering::SeqCst) > 0 {
                self.log.fail_constructs.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("encoder unavailable");
            }
            *self.log.last_output.lock().unwrap() = Some(output.to_path_buf());
            Ok(Box::new(MockHandle {
                log: Arc::clone(&self.log),
            }))
        }
    }

    impl RecorderHandle for MockHandle {
        fn update_output_file(&mut self, output: &Path) -> anyhow::Result<()> {
            self.log.updates.fetch_add(1, Ordering::SeqCst);
            *self.log.last_output.lock().unwrap() = Some(output.to_path_buf());
            Ok(())
        }

        fn start(&mut self) -> anyhow::Result<()> {
            if self.log.panic_on_start.load(Ordering::SeqCst) {
                panic!("native start crashed");
            }
            self.log.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) -> anyhow::Result<()> {
            self.log.stops.fetch_add(1, Ordering::SeqCst);
            if self.log.fail_stop.load(Ordering::SeqCst) {
                anyhow::bail!("stop rejected");
            }
            Ok(())
        }

        fn close(&mut self) -> anyhow::Result<()> {
            self.log.closes.fetch_add(1, Ordering::SeqCst);
            if self.log.fail_close.load(Ordering::SeqCst) {
                anyhow::bail!("close rejected");
            }
            Ok(())
        }
    }

    impl Drop for MockHandle {
        fn drop(&mut self) {
            self.log.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockCamera {
        open: AtomicBool,
        reopens: AtomicU32,
    }

    impl CameraSession for MockCamera {
        fn reopen_session(&self) {
            self.reopens.fetch_add(1, Ordering::SeqCst);
            self.open.store(false, Ordering::SeqCst);
        }

        fn is_session_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    struct ClockSource {
        origin: Instant,
    }

    impl SnapshotSource for ClockSource {
        fn monotonic_now(&self) -> f64 {
            self.origin.elapsed().as_secs_f64()
        }

        fn snapshot(&self, stream: StreamId) -> Option<Snapshot> {
            let t = self.monotonic_now();
            let values = match stream {
                StreamId::Imu => vec![0.0, 0.0, 0.0, 0.1, 0.0, 0.0, t, 0.0, 0.0, 0.0, 0.0, 0.0],
                _ => vec![0.0, 1.6, t, 0.0, 0.0, 0.0, 1.0],
            };
            Some(Snapshot::new(t, values))
        }
    }

    // Field order matters: the session closes before the directory goes
    struct Fixture {
        session: RecordingSession,
        log: Arc<DeviceLog>,
        camera: Arc<MockCamera>,
        dir: tempfile::TempDir,
    }

    fn test_config() -> CaptureConfig {
        let mut config = CaptureConfig::default();
        config.start = StartConfig {
            settle_delay_ms: 20,
            max_wait_for_camera_open_ms: 300,
            poll_interval_ms: 5,
        };
        config.streams.controllers = false;
        config.streams.imu_rate_hz = 200.0;
        config.streams.pose_rate_hz = 100.0;
        config.retry = RetryPolicy {
            construct_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 1,
        };
        config
    }

    fn fixture_with(config: CaptureConfig, with_camera: bool) -> Fixture {
        let log = Arc::new(DeviceLog::default());
        let camera = Arc::new(MockCamera::default());
        let camera_dyn: Option<Arc<dyn CameraSession>> = if with_camera {
            Some(camera.clone() as Arc<dyn CameraSession>)
        } else {
            None
        };
        let session = RecordingSession::new(
            config,
            Arc::new(MockFactory { log: Arc::clone(&log) }),
            camera_dyn,
            Arc::new(ClockSource {
                origin: Instant::now(),
            }),
        );
        Fixture {
            session,
            log,
            camera,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(test_config(), true)
    }

    impl Fixture {
        fn session_path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn prepare(&self) -> PathBuf {
            let path = self.session_path("20250101_120000");
            self.session
                .prepare(&path, &CameraCharacteristics::default())
                .unwrap();
            path
        }

        fn prepare_and_reopen(&self) -> PathBuf {
            let path = self.prepare();
            self.session
                .reopen_with_output(&path, &CameraCharacteristics::default())
                .unwrap();
            path
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_prepare_constructs_and_writes_sidecar() {
        let f = fixture();
        let path = f.prepare();

        assert_eq!(f.session.state(), SessionState::Prepared);
        assert_eq!(DeviceLog::count(&f.log.constructs), 1);
        assert_eq!(
            f.log.last_output.lock().unwrap().as_deref(),
            Some(path.join("center_camera.mp4").as_path())
        );
        assert!(path.join("center_camera_characteristics.json").exists());
        assert!(path.join("imu.csv").exists());
        assert!(path.join("hmd_poses.csv").exists());
        assert_eq!(f.session.session_dir(), Some(path));
    }

    #[test]
    fn test_prepare_failure_stays_idle() {
        let f = fixture();
        f.log.fail_constructs.store(5, Ordering::SeqCst);

        let result = f
            .session
            .prepare(&f.session_path("s"), &CameraCharacteristics::default());
        assert!(matches!(result, Err(CaptureError::DeviceInitFailure(_))));
        assert_eq!(f.session.state(), SessionState::Idle);
        // Both configured attempts were made
        assert_eq!(DeviceLog::count(&f.log.constructs), 2);

        // Start without a handle is a no-op
        f.session.start().unwrap();
        assert_eq!(f.session.state(), SessionState::Idle);
        assert_eq!(DeviceLog::count(&f.log.starts), 0);
    }

    #[test]
    fn test_construct_retry_recovers() {
        let f = fixture();
        f.log.fail_constructs.store(1, Ordering::SeqCst);
        f.prepare();
        assert_eq!(f.session.state(), SessionState::Prepared);
        assert_eq!(DeviceLog::count(&f.log.constructs), 2);
    }

    #[test]
    fn test_immediate_start_without_reopen() {
        let f = fixture();
        let path = f.prepare();

        f.session.start().unwrap();
        assert_eq!(f.session.state(), SessionState::Recording);
        assert_eq!(DeviceLog::count(&f.log.starts), 1);
        assert!(f.session.time_base().is_some());

        assert!(wait_for(
            || f.session.stream_stats().iter().all(|s| s.sampler.rows_emitted >= 3),
            Duration::from_secs(2)
        ));
        f.session.stop().unwrap();
        assert_eq!(f.session.state(), SessionState::Prepared);
        assert_eq!(DeviceLog::count(&f.log.stops), 1);

        f.session.close();
        let imu = fs::read_to_string(path.join("imu.csv")).unwrap();
        assert!(imu.starts_with("unix_time,ovr_timestamp,acc_x"));
        assert!(imu.lines().count() >= 4);
    }

    #[test]
    fn test_stats_cover_drained_rows_after_close() {
        let f = fixture();
        f.prepare();
        f.session.start().unwrap();
        assert!(wait_for(
            || f.session.stream_stats().iter().all(|s| s.sampler.rows_emitted >= 3),
            Duration::from_secs(2)
        ));
        f.session.stop().unwrap();
        f.session.close();

        let reports = f.session.stream_stats();
        assert_eq!(reports.len(), 2);
        for report in reports {
            assert!(report.sampler.rows_emitted >= 3);
            assert_eq!(report.writer.rows_written, report.sampler.rows_emitted);
            assert_eq!(report.writer.rows_failed, 0);
        }
    }

    #[test]
    fn test_deferred_start_waits_for_camera() {
        let f = fixture();
        f.prepare_and_reopen();
        assert_eq!(f.session.state(), SessionState::AwaitingHardwareReady);
        assert_eq!(f.camera.reopens.load(Ordering::SeqCst), 1);

        f.session.start().unwrap();
        thread::sleep(Duration::from_millis(80));
        assert_eq!(DeviceLog::count(&f.log.starts), 0);
        assert_eq!(f.session.state(), SessionState::AwaitingHardwareReady);

        let opened_at = Instant::now();
        f.camera.open.store(true, Ordering::SeqCst);
        assert!(wait_for(
            || DeviceLog::count(&f.log.starts) == 1,
            Duration::from_secs(1)
        ));
        // Well before the 300ms deadline would have fired
        assert!(opened_at.elapsed() < Duration::from_millis(200));
        assert_eq!(f.session.state(), SessionState::Recording);
    }

    #[test]
    fn test_deferred_start_proceeds_after_deadline() {
        let f = fixture();
        f.prepare_and_reopen();

        let scheduled = Instant::now();
        f.session.start().unwrap();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(DeviceLog::count(&f.log.starts), 0);

        assert!(wait_for(
            || DeviceLog::count(&f.log.starts) == 1,
            Duration::from_secs(2)
        ));
        let waited = scheduled.elapsed();
        assert!(waited >= Duration::from_millis(300));
        // Lands at the deadline, not a poll cycle or settle delay later
        assert!(waited < Duration::from_millis(600), "started after {:?}", waited);
        assert_eq!(f.session.state(), SessionState::Recording);
    }

    #[test]
    fn test_second_start_replaces_first() {
        let f = fixture();
        f.prepare_and_reopen();
        f.camera.open.store(true, Ordering::SeqCst);

        f.session.start().unwrap();
        f.session.start().unwrap();
        thread::sleep(Duration::from_millis(200));

        assert_eq!(DeviceLog::count(&f.log.starts), 1);
        assert_eq!(f.session.state(), SessionState::Recording);
    }

    #[test]
    fn test_stop_cancels_deferred_start() {
        let f = fixture();
        f.prepare_and_reopen();

        f.session.start().unwrap();
        f.session.stop().unwrap();
        f.camera.open.store(true, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(400));

        assert_eq!(DeviceLog::count(&f.log.starts), 0);
        assert_eq!(DeviceLog::count(&f.log.stops), 0);
        assert_eq!(f.session.state(), SessionState::Prepared);
    }

    #[test]
    fn test_close_cancels_deferred_start() {
        let f = fixture();
        f.prepare_and_reopen();

        f.session.start().unwrap();
        f.session.close();
        f.camera.open.store(true, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(400));

        assert_eq!(DeviceLog::count(&f.log.starts), 0);
        assert_eq!(DeviceLog::count(&f.log.stops), 0);
        assert_eq!(DeviceLog::count(&f.log.closes), 1);
        assert_eq!(f.session.state(), SessionState::Closed);
    }

    #[test]
    fn test_start_without_camera_waits_settle_only() {
        let f = fixture_with(test_config(), false);
        f.prepare_and_reopen();

        let scheduled = Instant::now();
        f.session.start().unwrap();
        assert!(wait_for(
            || DeviceLog::count(&f.log.starts) == 1,
            Duration::from_secs(1)
        ));
        let waited = scheduled.elapsed();
        assert!(waited >= Duration::from_millis(20));
        assert!(waited < Duration::from_millis(300));
    }

    #[test]
    fn test_reopen_updates_in_place() {
        let f = fixture();
        let first = f.prepare();
        let second = f.session_path("20250101_130000");

        f.session
            .reopen_with_output(&second, &CameraCharacteristics::default())
            .unwrap();

        assert_eq!(DeviceLog::count(&f.log.constructs), 1);
        assert_eq!(DeviceLog::count(&f.log.updates), 1);
        assert_eq!(
            f.log.last_output.lock().unwrap().as_deref(),
            Some(second.join("center_camera.mp4").as_path())
        );
        assert!(second.join("center_camera_characteristics.json").exists());
        assert!(second.join("imu.csv").exists());
        assert!(first.join("imu.csv").exists());
        assert_eq!(f.session.session_dir(), Some(second));
    }

    #[test]
    fn test_failed_reopen_keeps_previous_streams() {
        let f = fixture();
        let first = f.prepare();
        let second = f.session_path("20250101_130000");
        fs::create_dir_all(second.join("imu.csv")).unwrap();

        let result = f
            .session
            .reopen_with_output(&second, &CameraCharacteristics::default());
        assert!(matches!(result, Err(CaptureError::IoFailure(_))));
        assert_eq!(f.session.state(), SessionState::Prepared);
        assert_eq!(f.session.session_dir(), Some(first.clone()));
        assert_eq!(f.session.stream_stats().len(), 2);
        assert_eq!(DeviceLog::count(&f.log.updates), 0);
        assert_eq!(f.camera.reopens.load(Ordering::SeqCst), 0);
        assert_eq!(
            f.log.last_output.lock().unwrap().as_deref(),
            Some(first.join("center_camera.mp4").as_path())
        );

        // Once the path is usable the retry opens every stream there
        fs::remove_dir(second.join("imu.csv")).unwrap();
        f.session
            .reopen_with_output(&second, &CameraCharacteristics::default())
            .unwrap();
        assert_eq!(f.session.session_dir(), Some(second.clone()));
        assert_eq!(f.session.stream_stats().len(), 2);

        f.camera.open.store(true, Ordering::SeqCst);
        f.session.start().unwrap();
        assert!(wait_for(
            || f.session.stream_stats().iter().all(|s| s.sampler.rows_emitted >= 3),
            Duration::from_secs(2)
        ));
        f.session.close();

        let imu = fs::read_to_string(second.join("imu.csv")).unwrap();
        assert!(imu.lines().count() >= 4);
    }

    #[test]
    fn test_reopen_reschedules_pending_start() {
        let f = fixture();
        f.prepare_and_reopen();
        f.session.start().unwrap();

        let second = f.session_path("20250101_130000");
        f.session
            .reopen_with_output(&second, &CameraCharacteristics::default())
            .unwrap();
        assert_eq!(f.camera.reopens.load(Ordering::SeqCst), 2);
        assert_eq!(f.session.state(), SessionState::AwaitingHardwareReady);

        f.camera.open.store(true, Ordering::SeqCst);
        assert!(wait_for(
            || DeviceLog::count(&f.log.starts) == 1,
            Duration::from_secs(1)
        ));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(DeviceLog::count(&f.log.starts), 1);
        assert_eq!(f.session.state(), SessionState::Recording);
    }

    #[test]
    fn test_reopen_requires_prepare() {
        let f = fixture();
        let result = f
            .session
            .reopen_with_output(&f.session_path("s"), &CameraCharacteristics::default());
        assert_eq!(result, Err(CaptureError::NotPrepared));
    }

    #[test]
    fn test_failed_stop_still_leaves_recording() {
        let f = fixture();
        f.prepare();
        f.session.start().unwrap();
        f.log.fail_stop.store(true, Ordering::SeqCst);

        let result = f.session.stop();
        assert!(matches!(result, Err(CaptureError::DeviceCommandFailure { .. })));
        assert_eq!(f.session.state(), SessionState::Prepared);
        assert!(!f.session.is_recording());
    }

    #[test]
    fn test_close_is_idempotent() {
        let f = fixture();
        f.prepare();
        f.session.start().unwrap();

        f.session.close();
        f.session.close();

        assert_eq!(f.session.state(), SessionState::Closed);
        assert_eq!(DeviceLog::count(&f.log.stops), 1);
        assert_eq!(DeviceLog::count(&f.log.closes), 1);
        assert_eq!(DeviceLog::count(&f.log.releases), 1);
    }

    #[test]
    fn test_failed_close_still_releases() {
        let f = fixture();
        f.prepare();
        f.log.fail_close.store(true, Ordering::SeqCst);

        f.session.close();
        assert_eq!(DeviceLog::count(&f.log.closes), 1);
        assert_eq!(DeviceLog::count(&f.log.releases), 1);
        assert_eq!(f.session.state(), SessionState::Closed);

        f.log.fail_close.store(false, Ordering::SeqCst);
        f.prepare();
        assert_eq!(f.session.state(), SessionState::Prepared);
        assert_eq!(DeviceLog::count(&f.log.constructs), 2);
    }

    #[test]
    fn test_prepare_twice_closes_previous_handle() {
        let f = fixture();
        f.prepare();
        f.session.start().unwrap();
        f.prepare();

        assert_eq!(DeviceLog::count(&f.log.constructs), 2);
        assert_eq!(DeviceLog::count(&f.log.stops), 1);
        assert_eq!(DeviceLog::count(&f.log.closes), 1);
        assert_eq!(DeviceLog::count(&f.log.releases), 1);
        assert_eq!(f.session.state(), SessionState::Prepared);
    }

    #[test]
    fn test_panicking_adapter_is_contained() {
        let f = fixture();
        f.prepare();
        f.log.panic_on_start.store(true, Ordering::SeqCst);

        let result = f.session.start();
        assert!(matches!(result, Err(CaptureError::DeviceCommandFailure { .. })));
        assert_eq!(f.session.state(), SessionState::Recording);

        f.session.close();
        assert_eq!(DeviceLog::count(&f.log.releases), 1);
    }
}
