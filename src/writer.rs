//! Background CSV writer.
//!
//! Producers push immutable [`Sample`]s into an unbounded channel and never
//! touch the file. A dedicated consumer thread drains the channel in FIFO
//! order, writes the header lazily before the first row and flushes after
//! `flush_every_rows` rows or once the oldest buffered row is
//! `flush_interval` old, whichever comes first.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{CaptureError, CaptureResult};
use crate::stream::{Sample, Schema};

#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    pub flush_every_rows: usize,
    pub flush_interval: Duration,
    pub drain_timeout: Duration,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions {
            flush_every_rows: 200,
            flush_interval: Duration::from_millis(250),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub rows_written: u64,
    pub rows_failed: u64,
}

#[derive(Default)]
struct WriterCounters {
    rows_written: AtomicU64,
    rows_failed: AtomicU64,
}

enum WriterCommand {
    Row(Sample),
    Flush,
    Shutdown,
}

/// Cloneable producer end of a [`SampleWriter`]
#[derive(Clone)]
pub struct RowSink {
    tx: Sender<WriterCommand>,
}

impl RowSink {
    /// Queue a row. Returns false once the writer has shut down.
    pub fn enqueue(&self, sample: Sample) -> bool {
        self.tx.send(WriterCommand::Row(sample)).is_ok()
    }
}

pub struct SampleWriter {
    path: PathBuf,
    tx: Option<Sender<WriterCommand>>,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
    counters: Arc<WriterCounters>,
    drain_timeout: Duration,
}

impl SampleWriter {
    /// Open `path` for appending, creating parent directories. The header is
    /// not written here; a file that already has content is assumed to
    /// carry it.
    pub fn open(path: &Path, schema: Schema, options: WriterOptions) -> CaptureResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    CaptureError::IoFailure(format!("create {}: {}", parent.display(), e))
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| CaptureError::IoFailure(format!("open {}: {}", path.display(), e)))?;
        let header_written = file.metadata().map(|m| m.len() > 0).unwrap_or(false);

        let (tx, rx) = channel::unbounded();
        let (done_tx, done_rx) = channel::bounded(1);
        let counters = Arc::new(WriterCounters::default());

        let thread_counters = Arc::clone(&counters);
        let thread_path = path.to_path_buf();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("rows")
            .to_string();
        let handle = thread::Builder::new()
            .name(format!("writer-{}", name))
            .spawn(move || {
                let consumer = Consumer {
                    out: BufWriter::new(file),
                    schema,
                    header_pending: !header_written,
                    unflushed: 0,
                    oldest_unflushed: None,
                    options,
                    counters: thread_counters,
                    path: thread_path,
                };
                consumer.run(rx);
                let _ = done_tx.send(());
            })
            .map_err(|e| CaptureError::IoFailure(format!("spawn writer thread: {}", e)))?;

        log::debug!("Opened sample writer {}", path.display());

        Ok(SampleWriter {
            path: path.to_path_buf(),
            tx: Some(tx),
            done_rx,
            handle: Some(handle),
            counters,
            drain_timeout: options.drain_timeout,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue one row built from its parts
    pub fn enqueue_row(&self, wall_time_ms: i64, device_time_s: f64, values: Vec<f64>) -> bool {
        self.enqueue(Sample::new(wall_time_ms, device_time_s, values))
    }

    pub fn enqueue(&self, sample: Sample) -> bool {
        match &self.tx {
            Some(tx) => tx.send(WriterCommand::Row(sample)).is_ok(),
            None => false,
        }
    }

    /// Producer handle for another thread, `None` after close
    pub fn sink(&self) -> Option<RowSink> {
        self.tx.as_ref().map(|tx| RowSink { tx: tx.clone() })
    }

    /// Ask the consumer to flush once everything queued so far is written
    pub fn request_flush(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(WriterCommand::Flush);
        }
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            rows_written: self.counters.rows_written.load(Ordering::Relaxed),
            rows_failed: self.counters.rows_failed.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }

    /// Drain queued rows, flush and release the file. Waits at most the
    /// drain timeout; on expiry the consumer is left to finish on its own.
    /// Calling it again is a no-op.
    pub fn close(&mut self) -> CaptureResult<()> {
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => return Ok(()),
        };
        let _ = tx.send(WriterCommand::Shutdown);
        drop(tx);

        match self.done_rx.recv_timeout(self.drain_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    if handle.join().is_err() {
                        log::error!("Writer thread for {} panicked", self.path.display());
                    }
                }
                log::debug!(
                    "Closed {} ({} rows, {} failed)",
                    self.path.display(),
                    self.counters.rows_written.load(Ordering::Relaxed),
                    self.counters.rows_failed.load(Ordering::Relaxed)
                );
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                self.handle.take();
                log::warn!(
                    "Writer for {} did not drain within {:?}, detaching",
                    self.path.display(),
                    self.drain_timeout
                );
                Err(CaptureError::TimeoutExceeded {
                    what: format!("drain of {}", self.path.display()),
                    waited: self.drain_timeout,
                })
            }
        }
    }
}

impl Drop for SampleWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct Consumer {
    out: BufWriter<File>,
    schema: Schema,
    header_pending: bool,
    unflushed: usize,
    oldest_unflushed: Option<Instant>,
    options: WriterOptions,
    counters: Arc<WriterCounters>,
    path: PathBuf,
}

impl Consumer {
    fn run(mut self, rx: Receiver<WriterCommand>) {
        loop {
            // Wait no longer than the oldest unflushed row may stay buffered
            let wait = match self.oldest_unflushed {
                Some(at) => self.options.flush_interval.saturating_sub(at.elapsed()),
                None => self.options.flush_interval,
            };
            match rx.recv_timeout(wait) {
                Ok(WriterCommand::Row(sample)) => self.write_row(&sample),
                Ok(WriterCommand::Flush) => self.flush(),
                Ok(WriterCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            if self.flush_due() {
                self.flush();
            }
        }
        self.flush();
        // BufWriter and File drop here, releasing the handle
    }

    fn flush_due(&self) -> bool {
        match self.oldest_unflushed {
            Some(at) => {
                self.unflushed >= self.options.flush_every_rows
                    || at.elapsed() >= self.options.flush_interval
            }
            None => false,
        }
    }

    fn write_row(&mut self, sample: &Sample) {
        if sample.values().len() != self.schema.value_count() {
            self.counters.rows_failed.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Skipping row for {}: {} values, schema expects {}",
                self.path.display(),
                sample.values().len(),
                self.schema.value_count()
            );
            return;
        }

        if self.header_pending {
            if let Err(e) = writeln!(self.out, "{}", self.schema.header_line()) {
                self.counters.rows_failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("Header write to {} failed: {}", self.path.display(), e);
                return;
            }
            self.header_pending = false;
        }

        match writeln!(self.out, "{}", sample.to_csv_line()) {
            Ok(()) => {
                self.counters.rows_written.fetch_add(1, Ordering::Relaxed);
                self.unflushed += 1;
                self.oldest_unflushed.get_or_insert_with(Instant::now);
            }
            Err(e) => {
                self.counters.rows_failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("Row write to {} failed: {}", self.path.display(), e);
            }
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.out.flush() {
            log::warn!("Flush of {} failed: {}", self.path.display(), e);
        }
        self.unflushed = 0;
        self.oldest_unflushed = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{StreamId, StreamSpec};

    fn pose_schema() -> Schema {
        StreamSpec::pose(StreamId::HeadPose, 90.0).schema
    }

    fn pose_values(x: f64) -> Vec<f64> {
        vec![x, 1.6, 0.0, 0.0, 0.0, 0.0, 1.0]
    }

    #[test]
    fn test_header_once_then_rows_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hmd_poses.csv");
        let mut writer = SampleWriter::open(&path, pose_schema(), WriterOptions::default()).unwrap();

        for i in 0..50 {
            assert!(writer.enqueue_row(1000 + i, 0.1 + i as f64 * 0.01, pose_values(i as f64)));
        }
        writer.close().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 51);
        assert_eq!(lines[0], pose_schema().header_line());
        for (i, line) in lines[1..].iter().enumerate() {
            assert!(line.starts_with(&format!("{},", 1000 + i)));
        }
        assert_eq!(writer.stats().rows_written, 50);
    }

    #[test]
    fn test_no_header_without_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("imu.csv");
        let mut writer = SampleWriter::open(&path, pose_schema(), WriterOptions::default()).unwrap();
        writer.close().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_reopen_appends_without_second_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hmd_poses.csv");

        let mut first = SampleWriter::open(&path, pose_schema(), WriterOptions::default()).unwrap();
        first.enqueue_row(1, 0.1, pose_values(1.0));
        first.close().unwrap();

        let mut second = SampleWriter::open(&path, pose_schema(), WriterOptions::default()).unwrap();
        second.enqueue_row(2, 0.2, pose_values(2.0));
        second.close().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("unix_time").count(), 1);
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn test_malformed_row_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hmd_poses.csv");
        let mut writer = SampleWriter::open(&path, pose_schema(), WriterOptions::default()).unwrap();

        writer.enqueue_row(1, 0.1, pose_values(1.0));
        writer.enqueue_row(2, 0.2, vec![1.0, 2.0]);
        writer.enqueue_row(3, 0.3, pose_values(3.0));
        writer.close().unwrap();

        let stats = writer.stats();
        assert_eq!(stats.rows_written, 2);
        assert_eq!(stats.rows_failed, 1);
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hmd_poses.csv");
        let mut writer = SampleWriter::open(&path, pose_schema(), WriterOptions::default()).unwrap();
        let sink = writer.sink().unwrap();

        writer.close().unwrap();
        writer.close().unwrap();
        assert!(writer.is_closed());
        assert!(writer.sink().is_none());
        assert!(!writer.enqueue_row(1, 0.1, pose_values(1.0)));
        assert!(!sink.enqueue(Sample::new(1, 0.1, pose_values(1.0))));
    }

    #[test]
    fn test_idle_flush_makes_rows_visible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hmd_poses.csv");
        let options = WriterOptions {
            flush_every_rows: 10_000,
            flush_interval: Duration::from_millis(20),
            ..WriterOptions::default()
        };
        let mut writer = SampleWriter::open(&path, pose_schema(), options).unwrap();
        writer.enqueue_row(1, 0.1, pose_values(1.0));

        thread::sleep(Duration::from_millis(300));
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);
        writer.close().unwrap();
    }

    #[test]
    fn test_steady_producer_flushes_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hmd_poses.csv");
        let options = WriterOptions {
            flush_every_rows: 10_000,
            flush_interval: Duration::from_millis(50),
            ..WriterOptions::default()
        };
        let mut writer = SampleWriter::open(&path, pose_schema(), options).unwrap();

        // Rows arrive faster than the interval, so the channel never idles
        for i in 0..20 {
            writer.enqueue_row(1000 + i, 0.1 + i as f64 * 0.02, pose_values(i as f64));
            thread::sleep(Duration::from_millis(20));
        }

        let on_disk = fs::read_to_string(&path).unwrap().lines().count();
        assert!(on_disk >= 10, "only {} lines flushed", on_disk);
        writer.close().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 21);
    }

    #[test]
    fn test_open_fails_on_directory_path() {
        let dir = tempfile::tempdir().unwrap();
        let result = SampleWriter::open(dir.path(), pose_schema(), WriterOptions::default());
        assert!(matches!(result, Err(CaptureError::IoFailure(_))));
    }
}
