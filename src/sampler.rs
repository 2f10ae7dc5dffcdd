//! Fixed-rate polling loop for one sensor stream.
//!
//! Each sampler owns a dedicated thread and a [`SampleWriter`]. Per tick it
//! reads the latest hardware snapshot, drops it if the device time has not
//! advanced, fills unavailable (all-zero) derived vectors by finite
//! differences, stamps wall time through the session [`TimeBase`] and
//! queues the row. File I/O never happens on this thread.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::device::SnapshotSource;
use crate::error::{CaptureError, CaptureResult};
use crate::health::StreamHealth;
use crate::stream::{Derivation, Sample, Snapshot, StreamSpec};
use crate::time_base::TimeBase;
use crate::writer::{RowSink, SampleWriter, WriterStats};

/// Below this step a finite difference is too noisy to emit
pub const MIN_DERIVATIVE_DT_S: f64 = 1e-4;

#[derive(Debug, Clone, Copy)]
pub struct SamplerOptions {
    pub join_timeout: Duration,
    pub silence_threshold: Duration,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        SamplerOptions {
            join_timeout: Duration::from_secs(1),
            silence_threshold: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub rows_emitted: u64,
    pub duplicates_dropped: u64,
    pub derived_fills: u64,
    pub unavailable: u64,
}

#[derive(Default)]
struct SamplerCounters {
    rows_emitted: AtomicU64,
    duplicates_dropped: AtomicU64,
    derived_fills: AtomicU64,
    unavailable: AtomicU64,
}

/// Snapshot accepted by [`DerivativeState::process`]
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    pub snapshot: Snapshot,
    pub filled: usize,
}

/// Dedup and derivative-fallback state of one sampling run
#[derive(Debug, Clone, Default)]
pub struct DerivativeState {
    last_device_time_s: f64,
    previous: Option<Vec<f64>>,
}

impl DerivativeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_device_time_s(&self) -> f64 {
        self.last_device_time_s
    }

    /// `None` when the snapshot is not newer than the last accepted one, or
    /// carries a non-finite device time
    pub fn process(&mut self, mut snapshot: Snapshot, derivations: &[Derivation]) -> Option<Accepted> {
        if !snapshot.device_time_s.is_finite() || snapshot.device_time_s <= self.last_device_time_s {
            return None;
        }

        let dt = snapshot.device_time_s - self.last_device_time_s;
        let raw = snapshot.values.clone();
        let mut filled = 0;

        if let Some(prev) = &self.previous {
            if dt >= MIN_DERIVATIVE_DT_S {
                for d in derivations {
                    if fill_derivative(&mut snapshot.values, prev, d, dt) {
                        filled += 1;
                    }
                }
            }
        }

        self.last_device_time_s = snapshot.device_time_s;
        self.previous = Some(raw);
        Some(Accepted { snapshot, filled })
    }
}

fn fill_derivative(values: &mut [f64], prev: &[f64], d: &Derivation, dt: f64) -> bool {
    let target_end = d.target + d.width;
    let source_end = d.source + d.width;
    if target_end > values.len() || source_end > values.len() || source_end > prev.len() {
        return false;
    }
    if values[d.target..target_end].iter().any(|v| *v != 0.0) {
        return false;
    }
    for i in 0..d.width {
        values[d.target + i] = (values[d.source + i] - prev[d.source + i]) / dt;
    }
    true
}

struct Worker {
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    handle: JoinHandle<()>,
}

pub struct SensorSampler {
    spec: StreamSpec,
    source: Arc<dyn SnapshotSource>,
    writer: SampleWriter,
    options: SamplerOptions,
    counters: Arc<SamplerCounters>,
    worker: Option<Worker>,
}

impl SensorSampler {
    pub fn new(
        spec: StreamSpec,
        source: Arc<dyn SnapshotSource>,
        writer: SampleWriter,
        options: SamplerOptions,
    ) -> Self {
        SensorSampler {
            spec,
            source,
            writer,
            options,
            counters: Arc::new(SamplerCounters::default()),
            worker: None,
        }
    }

    pub fn spec(&self) -> &StreamSpec {
        &self.spec
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Start polling at `rate_hz` with fresh dedup/derivative state. A
    /// running loop is stopped first.
    pub fn start(&mut self, time_base: TimeBase, rate_hz: f64) -> CaptureResult<()> {
        if !(rate_hz > 0.0) {
            return Err(CaptureError::InvalidParameters(format!(
                "{} sampling rate must be positive, got {}",
                self.spec.id.name(),
                rate_hz
            )));
        }
        if self.worker.is_some() {
            let _ = self.stop();
        }

        let sink = self.writer.sink().ok_or_else(|| {
            CaptureError::IoFailure(format!("writer for {} is closed", self.writer.path().display()))
        })?;
        let period = Duration::from_millis(((1000.0 / rate_hz) as u64).max(1));

        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let (done_tx, done_rx) = channel::bounded::<()>(1);
        let run = SamplerRun {
            spec: self.spec.clone(),
            source: Arc::clone(&self.source),
            sink,
            time_base,
            period,
            counters: Arc::clone(&self.counters),
            silence_threshold: self.options.silence_threshold,
        };

        let handle = thread::Builder::new()
            .name(format!("sampler-{}", self.spec.id.name()))
            .spawn(move || {
                run.run(stop_rx);
                let _ = done_tx.send(());
            })
            .map_err(|e| CaptureError::IoFailure(format!("spawn sampler thread: {}", e)))?;

        log::info!(
            "[{}] sampling every {}ms",
            self.spec.id.name(),
            period.as_millis()
        );
        self.worker = Some(Worker {
            stop_tx,
            done_rx,
            handle,
        });
        Ok(())
    }

    /// Signal the loop to exit and wait up to the join timeout. On timeout
    /// the thread is abandoned. Safe to call repeatedly.
    pub fn stop(&mut self) -> CaptureResult<()> {
        let worker = match self.worker.take() {
            Some(worker) => worker,
            None => return Ok(()),
        };
        drop(worker.stop_tx);

        let result = match worker.done_rx.recv_timeout(self.options.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    log::error!("[{}] sampler thread panicked", self.spec.id.name());
                }
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "[{}] sampler did not exit within {:?}, abandoning thread",
                    self.spec.id.name(),
                    self.options.join_timeout
                );
                Err(CaptureError::TimeoutExceeded {
                    what: format!("{} sampler join", self.spec.id.name()),
                    waited: self.options.join_timeout,
                })
            }
        };

        self.writer.request_flush();
        result
    }

    /// Stop sampling, then drain and close the writer
    pub fn close(&mut self) -> CaptureResult<()> {
        let stopped = self.stop();
        let closed = self.writer.close();
        stopped.and(closed)
    }

    pub fn stats(&self) -> SamplerStats {
        SamplerStats {
            rows_emitted: self.counters.rows_emitted.load(Ordering::Relaxed),
            duplicates_dropped: self.counters.duplicates_dropped.load(Ordering::Relaxed),
            derived_fills: self.counters.derived_fills.load(Ordering::Relaxed),
            unavailable: self.counters.unavailable.load(Ordering::Relaxed),
        }
    }

    pub fn writer_stats(&self) -> WriterStats {
        self.writer.stats()
    }
}

impl Drop for SensorSampler {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Everything the sampling thread owns
struct SamplerRun {
    spec: StreamSpec,
    source: Arc<dyn SnapshotSource>,
    sink: RowSink,
    time_base: TimeBase,
    period: Duration,
    counters: Arc<SamplerCounters>,
    silence_threshold: Duration,
}

impl SamplerRun {
    fn run(self, stop_rx: Receiver<()>) {
        let name = self.spec.id.name();
        let mut state = DerivativeState::new();
        let mut health = StreamHealth::new(name, self.silence_threshold);

        loop {
            match self.source.snapshot(self.spec.id) {
                None => {
                    self.counters.unavailable.fetch_add(1, Ordering::Relaxed);
                    health.check();
                }
                Some(snapshot) => match state.process(snapshot, &self.spec.derivations) {
                    None => {
                        self.counters.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
                        health.check();
                    }
                    Some(accepted) => {
                        health.update();
                        if accepted.filled > 0 {
                            self.counters
                                .derived_fills
                                .fetch_add(accepted.filled as u64, Ordering::Relaxed);
                        }
                        let t = accepted.snapshot.device_time_s;
                        let sample =
                            Sample::new(self.time_base.to_wall_ms(t), t, accepted.snapshot.values);
                        if !self.sink.enqueue(sample) {
                            log::warn!("[{}] writer closed, sampler exiting", name);
                            break;
                        }
                        self.counters.rows_emitted.fetch_add(1, Ordering::Relaxed);
                    }
                },
            }

            match stop_rx.recv_timeout(self.period) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => break,
            }
        }
        log::debug!("[{}] sampler loop exited", name);
    }
}
