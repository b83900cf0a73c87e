//! Graduation engine: sequences ramps, captures points and builds the table.

use std::fmt;
use std::sync::Arc;

use chrono::{Local, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    Anomaly, ArchivedSession, CalibrationSession, CheckpointRequest, Decision, EngineConfig,
    EngineHandle, EngineState, EngineStatus,
};
use crate::catalog::{GaugeModel, ModelError, PreloadTable};
use crate::cell::LatestCell;
use crate::controller::{
    plan_steps, AbortHandle, Actuator, ControllerError, PressureController, Step, StrokeMode,
    ValveState,
};
use crate::journal::SessionJournal;
use crate::sensor::{PressureSensorChannel, SensorError};
use crate::table::{GraduationPoint, GraduationTable, NonlinearityReport, TableError};
use crate::telemetry::{TelemetryConfig, TelemetryRecorder, TelemetryTask};
use crate::units::PressureUnit;
use crate::vision::NeedleAngleSource;

const CHECKPOINT_CAPACITY: usize = 8;

/// Why a session stopped without ending.
#[derive(Debug, Clone, PartialEq)]
pub enum PauseReason {
    Sensor(SensorError),
    RampTimeout { target: f64 },
    NoFreshPressure { target: f64 },
    AngleUnavailable { target: f64 },
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sensor(e) => write!(f, "sensor error: {}", e),
            Self::RampTimeout { target } => write!(f, "target {:.3} not reached in time", target),
            Self::NoFreshPressure { target } => {
                write!(f, "no fresh pressure reading at {:.3}", target)
            }
            Self::AngleUnavailable { target } => {
                write!(f, "no valid needle angle at {:.3}", target)
            }
        }
    }
}

/// Engine errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Sensor is not polling")]
    SensorNotRunning,
    #[error("A calibration session is already active")]
    AlreadyInitialized,
    #[error("No gauge model selected")]
    NoGaugeModel,
    #[error("Invalid gauge model: {0}")]
    InvalidGaugeModel(#[from] ModelError),
    #[error("No pressure unit selected")]
    NoUnitSelected,
    #[error("No preload coefficient for upper limit {limit} {unit}")]
    PreloadNotConfigured { limit: f64, unit: PressureUnit },
    #[error("No active session")]
    NoSession,
    #[error("Session paused: {reason}")]
    Paused { reason: PauseReason },
    #[error("Session aborted")]
    Aborted,
    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),
    #[error("Table error: {0}")]
    Table(#[from] TableError),
}

/// Orchestrates one graduation at a time.
///
/// The engine owns the sensor channel and the single optional session.
/// Front ends take the checkpoint receiver with
/// [`take_checkpoints`](Self::take_checkpoints) and use an
/// [`EngineHandle`] for abort and status from other tasks.
pub struct GraduationEngine {
    config: EngineConfig,
    sensor: Box<dyn PressureSensorChannel>,
    needle: Arc<dyn NeedleAngleSource>,
    actuator: Arc<dyn Actuator>,
    preload: PreloadTable,
    abort: AbortHandle,
    session: Option<CalibrationSession>,
    archived: Option<ArchivedSession>,
    status: LatestCell<EngineStatus>,
    checkpoint_tx: mpsc::Sender<CheckpointRequest>,
    checkpoint_rx: Option<mpsc::Receiver<CheckpointRequest>>,
    journal: SessionJournal,
    telemetry: Option<TelemetryConfig>,
}

impl GraduationEngine {
    pub fn new(
        config: EngineConfig,
        sensor: Box<dyn PressureSensorChannel>,
        needle: Arc<dyn NeedleAngleSource>,
        actuator: Arc<dyn Actuator>,
        preload: PreloadTable,
    ) -> Self {
        let (checkpoint_tx, checkpoint_rx) = mpsc::channel(CHECKPOINT_CAPACITY);
        let engine = Self {
            config,
            sensor,
            needle,
            abort: AbortHandle::new(actuator.clone()),
            actuator,
            preload,
            session: None,
            archived: None,
            status: LatestCell::new(),
            checkpoint_tx,
            checkpoint_rx: Some(checkpoint_rx),
            journal: SessionJournal::new(),
            telemetry: None,
        };
        engine.publish_status(None);
        engine
    }

    pub fn with_journal(mut self, journal: SessionJournal) -> Self {
        self.journal = journal;
        self
    }

    /// Record pressure and angle series of every session under
    /// `config.root`.
    pub fn with_telemetry(mut self, config: TelemetryConfig) -> Self {
        self.telemetry = Some(config);
        self
    }

    /// Receiver of operator checkpoints. Until it is taken, every
    /// checkpoint resolves as [`Decision::Cancel`].
    pub fn take_checkpoints(&mut self) -> Option<mpsc::Receiver<CheckpointRequest>> {
        self.checkpoint_rx.take()
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            abort: self.abort.clone(),
            status: self.status.clone(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sensor(&self) -> &dyn PressureSensorChannel {
        self.sensor.as_ref()
    }

    /// Sensor access for connecting and starting the polling loop.
    pub fn sensor_mut(&mut self) -> &mut dyn PressureSensorChannel {
        self.sensor.as_mut()
    }

    pub fn preload_table(&self) -> &PreloadTable {
        &self.preload
    }

    pub fn session(&self) -> Option<&CalibrationSession> {
        self.session.as_ref()
    }

    pub fn journal(&self) -> &SessionJournal {
        &self.journal
    }

    /// Result of the last session that ended.
    pub fn last_session(&self) -> Option<&ArchivedSession> {
        self.archived.as_ref()
    }

    pub fn last_table(&self) -> Option<&GraduationTable> {
        self.archived.as_ref().map(|a| &a.table)
    }

    pub fn last_report(&self) -> Option<NonlinearityReport> {
        self.archived.as_ref().map(|a| a.report())
    }

    /// Current status snapshot.
    pub fn status(&self) -> EngineStatus {
        self.snapshot(self.session.as_ref())
    }

    /// Check the preconditions and open a session. No hardware is touched.
    pub fn initialize(
        &mut self,
        model: Option<Arc<GaugeModel>>,
        unit: Option<PressureUnit>,
        mode: StrokeMode,
    ) -> Result<Uuid, EngineError> {
        if !self.sensor.is_polling() {
            return Err(EngineError::SensorNotRunning);
        }
        if self.session.is_some() {
            return Err(EngineError::AlreadyInitialized);
        }
        let model = model.ok_or(EngineError::NoGaugeModel)?;
        model.validate()?;
        let unit = unit.ok_or(EngineError::NoUnitSelected)?;

        let limit = self
            .preload
            .preload_limit(&model)
            .ok_or(EngineError::PreloadNotConfigured {
                limit: model.upper_limit(),
                unit: model.unit(),
            })?;
        let limit = model.unit().convert(limit, unit);

        self.abort.reset();
        let controller = PressureController::new(
            &model,
            unit,
            limit,
            self.config.controller.clone(),
            self.actuator.clone(),
            self.sensor.subscribe(),
            self.abort.subscribe(),
        )?;

        let targets: Vec<f64> = model
            .pressures()
            .into_iter()
            .map(|p| model.unit().convert(p, unit))
            .collect();
        let steps = plan_steps(&targets, mode);
        let id = Uuid::new_v4();
        let session = CalibrationSession {
            id,
            table: GraduationTable::new(model.name(), unit, mode),
            model,
            unit,
            mode,
            state: EngineState::Ready,
            controller,
            steps,
            cursor: 0,
            aligned: false,
            started_at: Local::now(),
            telemetry_dir: None,
        };

        info!(
            "Session {} initialized: model '{}', {} steps in {}, preload limit {:.3} {}",
            id,
            session.model.name(),
            session.steps.len(),
            unit,
            limit,
            unit
        );
        self.journal.session_started(
            id,
            session.model.name(),
            unit,
            mode,
            session.steps.len(),
        );
        self.publish_status(Some(&session));
        self.session = Some(session);
        Ok(id)
    }

    /// Run or resume the active session.
    ///
    /// Returns the finalized table on completion. On
    /// [`EngineError::Paused`] the session and its partial table stay
    /// active and a further call resumes at the next uncaptured point. Any
    /// other error ends the session.
    pub async fn run(&mut self) -> Result<GraduationTable, EngineError> {
        let mut session = self.session.take().ok_or(EngineError::NoSession)?;
        let telemetry = self.start_telemetry(&mut session);
        let outcome = self.drive(&mut session).await;
        if let Some(task) = telemetry {
            task.finish().await;
        }

        match outcome {
            Ok(()) => {
                let table = session.table.clone();
                info!("Session {} complete: {} points", session.id, table.len());
                self.journal.session_ended(
                    EngineState::Complete,
                    &format!("{} points", table.len()),
                );
                self.archive(session, EngineState::Complete);
                Ok(table)
            }
            Err(EngineError::Paused { reason }) => {
                session.state = EngineState::Paused;
                warn!("Session {} paused: {}", session.id, reason);
                self.journal.warning(format!("Paused: {}", reason));
                self.publish_status(Some(&session));
                self.session = Some(session);
                Err(EngineError::Paused { reason })
            }
            Err(EngineError::Aborted) => {
                session.controller.abort();
                self.journal.session_ended(EngineState::Aborted, "");
                self.archive(session, EngineState::Aborted);
                Err(EngineError::Aborted)
            }
            Err(e) => {
                error!("Session {} failed: {}", session.id, e);
                session.controller.abort();
                self.journal
                    .session_ended(EngineState::Faulted, &e.to_string());
                self.archive(session, EngineState::Faulted);
                Err(e)
            }
        }
    }

    /// Abort from the owning task: valves close and an idle or paused
    /// session ends. Use [`EngineHandle::abort`] while `run` is in progress.
    pub fn abort(&mut self) {
        self.abort.abort();
        if let Some(mut session) = self.session.take() {
            session.controller.abort();
            self.journal.session_ended(EngineState::Aborted, "");
            self.archive(session, EngineState::Aborted);
        }
    }

    /// Open the session's telemetry files and start recording. A resumed
    /// session appends to the files of its first run.
    fn start_telemetry(&self, session: &mut CalibrationSession) -> Option<TelemetryTask> {
        let config = self.telemetry.as_ref()?;
        let dir = config.session_dir(session.id, session.started_at);
        match TelemetryRecorder::open(&dir, session.started_at, session.unit) {
            Ok(recorder) => {
                session.telemetry_dir = Some(dir);
                Some(recorder.spawn(config, self.sensor.subscribe(), self.needle.clone()))
            }
            Err(e) => {
                warn!("Telemetry off for session {}: {}", session.id, e);
                None
            }
        }
    }

    async fn drive(&mut self, session: &mut CalibrationSession) -> Result<(), EngineError> {
        session.state = EngineState::Running;
        self.publish_status(Some(session));

        if self.config.sight_alignment && !session.aligned {
            if let Err(e) = session.controller.sight_alignment().await {
                return Err(self.controller_failure(session, e).await);
            }
            session.aligned = true;
        }

        while let Some(step) = session.next_step() {
            if self.abort.is_aborted() {
                return Err(EngineError::Aborted);
            }
            if let Err(e) = session.controller.ramp_to(step.target, step.direction).await {
                return Err(self.controller_failure(session, e).await);
            }

            let point = self.capture(session, step).await?;
            session.table.add_point(point)?;
            session.cursor += 1;
            debug!(
                "Captured {} point {:.3} -> {:.2}",
                step.direction, point.pressure, point.angle
            );
            self.journal.point_captured(
                session.cursor,
                session.steps.len(),
                step.direction,
                point.pressure,
                session.unit,
                point.angle,
            );
            session.controller.release_and_seek_next()?;
            self.publish_status(Some(session));
        }

        session.controller.finish();
        session.table.finalize()?;
        Ok(())
    }

    /// Wait at a held target for a fresh pressure/angle pair.
    async fn capture(
        &mut self,
        session: &mut CalibrationSession,
        step: Step,
    ) -> Result<GraduationPoint, EngineError> {
        let held_at = Instant::now();
        let held_since = Utc::now();
        let deadline = held_at + self.config.capture_timeout;
        let mut ticker = interval(self.config.capture_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let samples = self.sensor.subscribe();

        loop {
            ticker.tick().await;
            if self.abort.is_aborted() {
                return Err(EngineError::Aborted);
            }

            let sample = samples.borrow().clone();
            let reading = match sample {
                Some(Err(e)) => {
                    return Err(EngineError::Paused {
                        reason: PauseReason::Sensor(e),
                    })
                }
                Some(Ok(r))
                    if r.valid && r.received_at >= held_at && r.age() <= self.config.staleness =>
                {
                    Some(r)
                }
                _ => None,
            };
            let angle = self
                .needle
                .latest_angle()
                .filter(|a| {
                    a.valid && a.captured_since(held_since) && a.age() <= self.config.staleness
                });

            if let (Some(reading), Some(angle)) = (reading, angle) {
                let pressure = reading.value_in(session.unit);
                let model_pressure = session.unit.convert(pressure, session.model.unit());
                let expected = session.model.expected_angle_at(model_pressure);

                if angle.angle - expected > self.config.angle_margin {
                    let anomaly = Anomaly::AngleExceeded {
                        target: step.target,
                        direction: step.direction,
                        measured: angle.angle,
                        expected,
                    };
                    session.state = EngineState::AwaitingOperator;
                    self.publish_status(Some(session));
                    let decision = self.checkpoint(anomaly).await;
                    session.state = EngineState::Running;
                    if decision == Decision::Cancel {
                        return Err(EngineError::Aborted);
                    }
                }
                return Ok(GraduationPoint::new(
                    step.target,
                    pressure,
                    angle.angle,
                    step.direction,
                ));
            }

            if Instant::now() >= deadline {
                let reason = if reading.is_none() {
                    PauseReason::NoFreshPressure {
                        target: step.target,
                    }
                } else {
                    PauseReason::AngleUnavailable {
                        target: step.target,
                    }
                };
                return Err(EngineError::Paused { reason });
            }
        }
    }

    /// Map a controller failure to the engine outcome.
    async fn controller_failure(
        &mut self,
        session: &mut CalibrationSession,
        err: ControllerError,
    ) -> EngineError {
        match err {
            ControllerError::Sensor(e) => EngineError::Paused {
                reason: PauseReason::Sensor(e),
            },
            ControllerError::RampTimeout { target, .. } => EngineError::Paused {
                reason: PauseReason::RampTimeout { target },
            },
            ControllerError::Aborted => EngineError::Aborted,
            ControllerError::PreloadExceeded { measured, limit } => {
                session.state = EngineState::Faulted;
                self.publish_status(Some(session));
                // Acknowledgement only; the session faults either way.
                self.checkpoint(Anomaly::PreloadExceeded { measured, limit })
                    .await;
                EngineError::Controller(err)
            }
            other => EngineError::Controller(other),
        }
    }

    /// Hand an anomaly to the operator and wait for the answer.
    async fn checkpoint(&mut self, anomaly: Anomaly) -> Decision {
        warn!("Checkpoint: {}", anomaly);
        self.journal.checkpoint(anomaly.to_string());
        if self.checkpoint_rx.is_some() {
            warn!("No operator attached; checkpoint cancelled");
            return Decision::Cancel;
        }

        let (request, answer) = CheckpointRequest::new(anomaly);
        if self.checkpoint_tx.send(request).await.is_err() {
            warn!("Checkpoint receiver dropped; cancelling");
            return Decision::Cancel;
        }

        let mut aborted = self.abort.subscribe();
        let decision = tokio::select! {
            decision = answer => decision.unwrap_or(Decision::Cancel),
            _ = async {
                let _ = aborted.wait_for(|a| *a).await;
            } => Decision::Cancel,
        };
        info!("Checkpoint resolved: {:?}", decision);
        self.journal.checkpoint(format!("Operator: {:?}", decision));
        decision
    }

    fn archive(&mut self, session: CalibrationSession, outcome: EngineState) {
        let archived = ArchivedSession {
            id: session.id,
            model: session.model,
            table: session.table,
            outcome,
            started_at: session.started_at,
            finished_at: Local::now(),
            telemetry_dir: session.telemetry_dir,
        };
        self.archived = Some(archived);
        self.publish_status(None);
    }

    fn snapshot(&self, session: Option<&CalibrationSession>) -> EngineStatus {
        let (pressure, unit, rate, sensor_error) = match self.sensor.latest() {
            Some(Ok(r)) => {
                let unit = session.map(|s| s.unit).unwrap_or(r.unit);
                (
                    Some(r.value_in(unit)),
                    Some(unit),
                    Some(r.rate_in(unit)),
                    None,
                )
            }
            Some(Err(e)) => (None, None, None, Some(e.to_string())),
            None => (None, None, None, None),
        };
        let valve_state = self.actuator.valve_feedback().unwrap_or(ValveState::Unknown);
        let finished = self.archived.as_ref();

        EngineStatus {
            pressure,
            unit,
            rate,
            sensor_error,
            valve_state,
            valve_description: valve_state.description().to_string(),
            in_progress: session.is_some_and(|s| {
                matches!(
                    s.state,
                    EngineState::Running | EngineState::AwaitingOperator
                )
            }),
            state: session
                .map(|s| s.state)
                .or(finished.map(|a| a.outcome))
                .unwrap_or(EngineState::Idle),
            captured_points: session
                .map(|s| s.table.len())
                .or(finished.map(|a| a.table.len()))
                .unwrap_or(0),
            planned_points: session
                .map(|s| s.steps.len())
                .unwrap_or(0),
            started_at: session
                .map(|s| s.started_at)
                .or(finished.map(|a| a.started_at)),
            finished_at: if session.is_some() {
                None
            } else {
                finished.map(|a| a.finished_at)
            },
        }
    }

    fn publish_status(&self, session: Option<&CalibrationSession>) {
        self.status.publish(self.snapshot(session));
    }
}

impl Drop for GraduationEngine {
    fn drop(&mut self) {
        if self.session.is_some() {
            self.abort();
        }
    }
}
