use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use quest_capture_rs::layout;
use quest_capture_rs::simulated::{SimulatedCamera, SimulatedHeadset, SimulatedRecorderFactory};
use quest_capture_rs::{CameraCharacteristics, CaptureConfig, RecordingSession};

#[derive(Parser, Debug)]
#[command(name = "quest_capture")]
#[command(about = "Synchronized headset video, IMU and pose capture", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record one session against the simulated headset
    Record {
        /// Duration in seconds (0 = until Ctrl-C)
        #[arg(long, default_value = "10")]
        duration: u64,

        /// Root directory for session folders
        #[arg(long, default_value = "recordings")]
        output_dir: PathBuf,

        /// JSON capture configuration
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override IMU sampling rate (Hz)
        #[arg(long)]
        imu_rate: Option<f64>,

        /// Override pose sampling rate (Hz)
        #[arg(long)]
        pose_rate: Option<f64>,

        /// Skip the controller pose files
        #[arg(long)]
        no_controllers: bool,
    },
    /// List recorded sessions
    List {
        #[arg(long, default_value = "recordings")]
        output_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Command::Record {
            duration,
            output_dir,
            config,
            imu_rate,
            pose_rate,
            no_controllers,
        } => {
            let mut capture = match config {
                Some(path) => CaptureConfig::load(&path)?,
                None => CaptureConfig::default(),
            };
            if let Some(rate) = imu_rate {
                capture.streams.imu_rate_hz = rate;
            }
            if let Some(rate) = pose_rate {
                capture.streams.pose_rate_hz = rate;
            }
            if no_controllers {
                capture.streams.controllers = false;
            }
            capture.validate()?;
            record(capture, output_dir, duration).await
        }
        Command::List { output_dir } => {
            let sessions = layout::list_sessions(&output_dir)?;
            if sessions.is_empty() {
                println!("No recording sessions in {}", output_dir.display());
            }
            for name in sessions {
                println!("{}", name);
            }
            Ok(())
        }
    }
}

async fn record(config: CaptureConfig, output_dir: PathBuf, duration: u64) -> Result<()> {
    let session_dir = layout::new_session_dir(&output_dir);
    let characteristics = CameraCharacteristics::for_encoder("center", &config.encoder);

    let session = Arc::new(RecordingSession::new(
        config,
        Arc::new(SimulatedRecorderFactory),
        Some(Arc::new(SimulatedCamera::new(Duration::from_millis(300)))),
        Arc::new(SimulatedHeadset::new()),
    ));

    session.prepare(&session_dir, &characteristics)?;
    session.reopen_with_output(&session_dir, &characteristics)?;
    session.start()?;
    log::info!("Recording into {}", session_dir.display());

    if duration > 0 {
        tokio::select! {
            _ = sleep(Duration::from_secs(duration)) => log::info!("Duration reached, stopping..."),
            _ = tokio::signal::ctrl_c() => log::info!("Interrupted, stopping..."),
        }
    } else {
        tokio::signal::ctrl_c().await?;
        log::info!("Interrupted, stopping...");
    }

    // Stop and close join threads and drain files; keep them off the runtime
    let closing = Arc::clone(&session);
    let reports = tokio::task::spawn_blocking(move || {
        if let Err(e) = closing.stop() {
            log::warn!("Stop reported: {}", e);
        }
        closing.close();
        closing.stream_stats()
    })
    .await?;

    println!("\n=== Session {} ===", session_dir.display());
    for report in reports {
        println!(
            "{:<24} rows {:>7}  duplicates {:>7}  derived {:>7}  write failures {}",
            report.stream.name(),
            report.writer.rows_written,
            report.sampler.duplicates_dropped,
            report.sampler.derived_fills,
            report.writer.rows_failed
        );
    }

    Ok(())
}
