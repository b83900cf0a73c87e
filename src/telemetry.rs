//! Per-session telemetry.
//!
//! While a session runs, a background task samples the pressure channel and
//! the needle source and appends them to two CSV files in the session
//! directory:
//!
//! ```text
//! <root>/<yyyy-mm-dd>/<session id>/tp.csv   t,pressure
//! <root>/<yyyy-mm-dd>/<session id>/ta.csv   t,angle
//! ```
//!
//! `t` is seconds since the session started. A resumed session appends to
//! the same files. Telemetry failures are logged and never stop a session.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::sensor::SensorSample;
use crate::units::PressureUnit;
use crate::vision::NeedleAngleSource;

pub const PRESSURE_FILE: &str = "tp.csv";
pub const ANGLE_FILE: &str = "ta.csv";

/// Telemetry errors.
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to create {path}: {source}")]
    Create { path: PathBuf, source: io::Error },
    #[error("Failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Where and how often telemetry is recorded.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub root: PathBuf,
    /// How often the latest readings are looked at.
    pub sample_interval: Duration,
    /// How often buffered rows reach the disk.
    pub flush_interval: Duration,
}

impl TelemetryConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sample_interval: Duration::from_millis(50),
            flush_interval: Duration::from_secs(1),
        }
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Directory of one session.
    pub fn session_dir(&self, session: Uuid, started_at: DateTime<Local>) -> PathBuf {
        self.root
            .join(started_at.format("%Y-%m-%d").to_string())
            .join(session.to_string())
    }
}

struct CsvSeries {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl CsvSeries {
    fn open(path: PathBuf, header: &str) -> Result<Self, TelemetryError> {
        let fresh = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| TelemetryError::Create {
                path: path.clone(),
                source,
            })?;
        let mut series = Self {
            path,
            writer: BufWriter::new(file),
        };
        if fresh {
            series.row(format_args!("{}", header))?;
        }
        Ok(series)
    }

    fn row(&mut self, line: std::fmt::Arguments<'_>) -> Result<(), TelemetryError> {
        writeln!(self.writer, "{}", line).map_err(|source| TelemetryError::Write {
            path: self.path.clone(),
            source,
        })
    }

    fn flush(&mut self) -> Result<(), TelemetryError> {
        self.writer.flush().map_err(|source| TelemetryError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

/// Pressure and angle series of one session.
pub struct TelemetryRecorder {
    dir: PathBuf,
    started_at: DateTime<Utc>,
    unit: PressureUnit,
    pressure: CsvSeries,
    angle: CsvSeries,
    rows: usize,
}

impl TelemetryRecorder {
    /// Open (or reopen) the series files of a session in `dir`.
    pub fn open(
        dir: &Path,
        started_at: DateTime<Local>,
        unit: PressureUnit,
    ) -> Result<Self, TelemetryError> {
        fs::create_dir_all(dir).map_err(|source| TelemetryError::Create {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            started_at: started_at.with_timezone(&Utc),
            unit,
            pressure: CsvSeries::open(dir.join(PRESSURE_FILE), "t,pressure")?,
            angle: CsvSeries::open(dir.join(ANGLE_FILE), "t,angle")?,
            rows: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rows written since the recorder was opened.
    pub fn rows(&self) -> usize {
        self.rows
    }

    fn elapsed(&self, at: DateTime<Utc>) -> f64 {
        (at - self.started_at).num_microseconds().unwrap_or(0) as f64 / 1e6
    }

    /// Append a pressure, given in `unit`, taken at `at`.
    pub fn record_pressure(
        &mut self,
        at: DateTime<Utc>,
        value: f64,
        unit: PressureUnit,
    ) -> Result<(), TelemetryError> {
        let t = self.elapsed(at);
        let value = unit.convert(value, self.unit);
        self.pressure.row(format_args!("{:.3},{:.6}", t, value))?;
        self.rows += 1;
        Ok(())
    }

    /// Append a needle angle in degrees taken at `at`.
    pub fn record_angle(&mut self, at: DateTime<Utc>, angle: f64) -> Result<(), TelemetryError> {
        let t = self.elapsed(at);
        self.angle.row(format_args!("{:.3},{:.4}", t, angle))?;
        self.rows += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), TelemetryError> {
        self.pressure.flush()?;
        self.angle.flush()
    }

    /// Record in the background until the returned task is finished.
    pub fn spawn(
        self,
        config: &TelemetryConfig,
        samples: watch::Receiver<Option<SensorSample>>,
        needle: Arc<dyn NeedleAngleSource>,
    ) -> TelemetryTask {
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(record_loop(
            self,
            config.sample_interval,
            config.flush_interval,
            samples,
            needle,
            stop_rx,
        ));
        TelemetryTask {
            stop: stop_tx,
            handle,
        }
    }
}

/// Running telemetry task of a session.
pub struct TelemetryTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Option<TelemetryRecorder>>,
}

impl TelemetryTask {
    /// Stop sampling, flush and hand the recorder back. `None` when
    /// recording had failed.
    pub async fn finish(self) -> Option<TelemetryRecorder> {
        // Fails only when the task already ended on its own.
        let _ = self.stop.send(());
        match self.handle.await {
            Ok(recorder) => recorder,
            Err(e) => {
                warn!("Telemetry task failed: {}", e);
                None
            }
        }
    }
}

async fn record_loop(
    mut recorder: TelemetryRecorder,
    sample_interval: Duration,
    flush_interval: Duration,
    samples: watch::Receiver<Option<SensorSample>>,
    needle: Arc<dyn NeedleAngleSource>,
    mut stop: oneshot::Receiver<()>,
) -> Option<TelemetryRecorder> {
    let mut sampler = interval(sample_interval);
    sampler.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut flusher = interval(flush_interval);
    flusher.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_sequence = None;
    let mut last_frame = None;

    loop {
        let step = tokio::select! {
            _ = &mut stop => break,
            _ = flusher.tick() => recorder.flush(),
            _ = sampler.tick() => sample_once(
                &mut recorder,
                &samples,
                needle.as_ref(),
                &mut last_sequence,
                &mut last_frame,
            ),
        };
        if let Err(e) = step {
            warn!("Telemetry stopped: {}", e);
            return None;
        }
    }

    if let Err(e) = recorder.flush() {
        warn!("Telemetry flush failed: {}", e);
        return None;
    }
    debug!(
        "Telemetry in {}: {} rows",
        recorder.dir().display(),
        recorder.rows()
    );
    Some(recorder)
}

fn sample_once(
    recorder: &mut TelemetryRecorder,
    samples: &watch::Receiver<Option<SensorSample>>,
    needle: &dyn NeedleAngleSource,
    last_sequence: &mut Option<u64>,
    last_frame: &mut Option<DateTime<Utc>>,
) -> Result<(), TelemetryError> {
    let reading = match &*samples.borrow() {
        Some(Ok(reading)) if reading.valid => Some(*reading),
        _ => None,
    };
    if let Some(reading) = reading {
        if *last_sequence != Some(reading.sequence) {
            recorder.record_pressure(reading.timestamp, reading.value, reading.unit)?;
            *last_sequence = Some(reading.sequence);
        }
    }
    if let Some(angle) = needle.latest_angle().filter(|a| a.valid) {
        if *last_frame != Some(angle.timestamp) {
            recorder.record_angle(angle.timestamp, angle.angle)?;
            *last_frame = Some(angle.timestamp);
        }
    }
    Ok(())
}
