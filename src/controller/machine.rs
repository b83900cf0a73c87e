//! Pressure controller state machine.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{Actuator, ActuatorCommand, ActuatorError, Direction, ValveState};
use crate::catalog::GaugeModel;
use crate::sensor::{SensorError, SensorSample};
use crate::units::PressureUnit;

/// Controller errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControllerError {
    #[error("Gauge model has no scale points")]
    InsufficientScalePoints,
    #[error("Preload exceeded: measured {measured:.3}, limit {limit:.3}")]
    PreloadExceeded { measured: f64, limit: f64 },
    #[error("Sensor error: {0}")]
    Sensor(#[from] SensorError),
    #[error("Target {target:.3} not reached within {seconds}s")]
    RampTimeout { target: f64, seconds: u64 },
    #[error("Aborted")]
    Aborted,
    #[error("Actuator error: {0}")]
    Actuator(#[from] ActuatorError),
    #[error("Operation not allowed in state {state}")]
    InvalidState { state: String },
}

impl ControllerError {
    /// Whether the error is a safety interlock that ends the session.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::PreloadExceeded { .. } | Self::Actuator(_))
    }
}

/// Controller states.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerState {
    Idle,
    SightAlignment,
    Ramping(Direction),
    HoldAtTarget { target: f64 },
    ReleaseAndSeekNext,
    /// Motion suspended by a sensor problem or timeout; a new ramp resumes.
    Paused,
    Complete,
    Aborted,
    Faulted(ControllerError),
}

impl ControllerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Aborted | Self::Faulted(_))
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::SightAlignment => write!(f, "sight alignment"),
            Self::Ramping(direction) => write!(f, "ramping {}", direction),
            Self::HoldAtTarget { target } => write!(f, "holding at {:.3}", target),
            Self::ReleaseAndSeekNext => write!(f, "seeking next point"),
            Self::Paused => write!(f, "paused"),
            Self::Complete => write!(f, "complete"),
            Self::Aborted => write!(f, "aborted"),
            Self::Faulted(e) => write!(f, "faulted: {}", e),
        }
    }
}

/// Controller tunables.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Hold band half-width as a fraction of the gauge upper limit.
    pub tolerance: f64,
    /// Time the pressure must stay inside the band before holding.
    pub settle_window: Duration,
    /// Readings older than this count as missing.
    pub staleness: Duration,
    /// Longest time a single ramp may take.
    pub ramp_timeout: Duration,
    /// How often the latest reading is sampled.
    pub sample_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.005,
            settle_window: Duration::from_millis(1500),
            staleness: Duration::from_millis(500),
            ramp_timeout: Duration::from_secs(180),
            sample_interval: Duration::from_millis(40),
        }
    }
}

impl ControllerConfig {
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_settle_window(mut self, window: Duration) -> Self {
        self.settle_window = window;
        self
    }

    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    pub fn with_ramp_timeout(mut self, timeout: Duration) -> Self {
        self.ramp_timeout = timeout;
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }
}

/// Stops the stand from any task.
///
/// Aborting commands the motor to stop and the valves to close right away;
/// the running ramp notices at its next sample.
#[derive(Clone)]
pub struct AbortHandle {
    flag: Arc<watch::Sender<bool>>,
    actuator: Arc<dyn Actuator>,
}

impl AbortHandle {
    pub fn new(actuator: Arc<dyn Actuator>) -> Self {
        let (flag, _rx) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
            actuator,
        }
    }

    pub fn abort(&self) {
        for command in [ActuatorCommand::MotorStop, ActuatorCommand::CloseBoth] {
            if let Err(e) = self.actuator.command(command) {
                error!("Abort: {}", e);
            }
        }
        self.flag.send_replace(true);
        warn!("Abort requested");
    }

    pub fn is_aborted(&self) -> bool {
        *self.flag.borrow()
    }

    /// Re-arm for a new session.
    pub fn reset(&self) {
        self.flag.send_replace(false);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.flag.subscribe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Motion {
    Unknown,
    Holding,
    Driving(Direction),
}

/// Drives the motor and valves toward target pressures.
pub struct PressureController {
    unit: PressureUnit,
    first_target: f64,
    tolerance: f64,
    preload_limit: f64,
    preloaded: bool,
    config: ControllerConfig,
    actuator: Arc<dyn Actuator>,
    sensor: watch::Receiver<Option<SensorSample>>,
    abort: watch::Receiver<bool>,
    state: ControllerState,
    motion: Motion,
}

impl PressureController {
    /// Create a controller for `model`, working in `unit`.
    ///
    /// `preload_limit` is in `unit`. It bounds the pressure until the first
    /// target is held; venting is never checked against it.
    pub fn new(
        model: &GaugeModel,
        unit: PressureUnit,
        preload_limit: f64,
        config: ControllerConfig,
        actuator: Arc<dyn Actuator>,
        sensor: watch::Receiver<Option<SensorSample>>,
        abort: watch::Receiver<bool>,
    ) -> Result<Self, ControllerError> {
        let first = model
            .scale_points()
            .first()
            .ok_or(ControllerError::InsufficientScalePoints)?;
        let span = model.unit().convert(model.upper_limit(), unit).abs();
        let tolerance = if span > 0.0 {
            config.tolerance * span
        } else {
            config.tolerance
        };
        Ok(Self {
            unit,
            first_target: model.unit().convert(first.pressure, unit),
            tolerance,
            preload_limit,
            preloaded: false,
            config,
            actuator,
            sensor,
            abort,
            state: ControllerState::Idle,
            motion: Motion::Unknown,
        })
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn unit(&self) -> PressureUnit {
        self.unit
    }

    pub fn preload_limit(&self) -> f64 {
        self.preload_limit
    }

    /// Whether the first target was held and the preload limit released.
    pub fn is_preloaded(&self) -> bool {
        self.preloaded
    }

    /// Absolute hold band half-width in the controller unit.
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Valve position from feedback; `Unknown` when feedback is missing.
    pub fn valve_state(&self) -> ValveState {
        self.actuator.valve_feedback().unwrap_or(ValveState::Unknown)
    }

    /// Bring pressure to `target` and hold it there.
    pub async fn ramp_to(&mut self, target: f64, direction: Direction) -> Result<(), ControllerError> {
        self.ensure_active()?;
        info!("Ramping {} to {:.3} {}", direction, target, self.unit);
        self.state = ControllerState::Ramping(direction);
        self.settle_at(target, false).await?;
        if !self.preloaded {
            self.preloaded = true;
            debug!("Preload phase over at {:.3} {}", target, self.unit);
        }
        self.state = ControllerState::HoldAtTarget { target };
        info!("Holding at {:.3} {}", target, self.unit);
        Ok(())
    }

    /// Vent down to the first scale point before graduation starts.
    pub async fn sight_alignment(&mut self) -> Result<(), ControllerError> {
        self.ensure_active()?;
        info!(
            "Sight alignment: venting to {:.3} {}",
            self.first_target, self.unit
        );
        self.state = ControllerState::SightAlignment;
        self.settle_at(self.first_target, true).await?;
        self.state = ControllerState::Idle;
        Ok(())
    }

    /// Leave the current hold after the point was captured.
    pub fn release_and_seek_next(&mut self) -> Result<(), ControllerError> {
        match self.state {
            ControllerState::HoldAtTarget { .. } => {
                self.state = ControllerState::ReleaseAndSeekNext;
                Ok(())
            }
            _ => Err(self.invalid_state()),
        }
    }

    /// Stop the motor and close both valves.
    pub fn close_valves(&mut self) -> Result<(), ControllerError> {
        self.send(ActuatorCommand::MotorStop)?;
        self.send(ActuatorCommand::CloseBoth)?;
        self.motion = Motion::Holding;
        Ok(())
    }

    /// Close everything and finish the sequence.
    pub fn finish(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.safe_stop();
        self.state = ControllerState::Complete;
        info!("Controller sequence complete");
    }

    /// Close everything and stop. No effect once terminal.
    pub fn abort(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.safe_stop();
        self.state = ControllerState::Aborted;
        warn!("Controller aborted");
    }

    fn ensure_active(&mut self) -> Result<(), ControllerError> {
        if self.state.is_terminal() {
            return Err(self.invalid_state());
        }
        if *self.abort.borrow() {
            self.abort();
            return Err(ControllerError::Aborted);
        }
        Ok(())
    }

    fn invalid_state(&self) -> ControllerError {
        ControllerError::InvalidState {
            state: self.state.to_string(),
        }
    }

    async fn settle_at(&mut self, target: f64, vent_only: bool) -> Result<(), ControllerError> {
        let deadline = Instant::now() + self.config.ramp_timeout;
        let mut ticker = interval(self.config.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut settled_since: Option<Instant> = None;

        loop {
            let sampled = match self.next_pressure(&mut ticker, !vent_only).await {
                Ok(sampled) => sampled,
                Err(e) => return Err(self.interrupt(e)),
            };

            if let Some(pressure) = sampled {
                let in_band = if vent_only {
                    pressure <= target + self.tolerance
                } else {
                    (target - pressure).abs() <= self.tolerance
                };
                let commanded = if in_band {
                    self.hold()
                } else {
                    settled_since = None;
                    if vent_only || pressure > target {
                        self.drive(Direction::Backward)
                    } else {
                        self.drive(Direction::Forward)
                    }
                };
                if let Err(e) = commanded {
                    return Err(self.interrupt(e.into()));
                }
                if in_band {
                    let since = *settled_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= self.config.settle_window {
                        return Ok(());
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(self.interrupt(ControllerError::RampTimeout {
                    target,
                    seconds: self.config.ramp_timeout.as_secs(),
                }));
            }
        }
    }

    /// Wait one sample period and return the fresh pressure, if any.
    async fn next_pressure(
        &mut self,
        ticker: &mut Interval,
        check_preload: bool,
    ) -> Result<Option<f64>, ControllerError> {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = self.abort.changed() => {
                if changed.is_err() {
                    // Handle gone: keep sampling on the ticker alone.
                    ticker.tick().await;
                }
            }
        }
        if *self.abort.borrow() {
            return Err(ControllerError::Aborted);
        }

        let sample = self.sensor.borrow().clone();
        let reading = match sample {
            None => return Ok(None),
            Some(Err(e)) => return Err(ControllerError::Sensor(e)),
            Some(Ok(reading)) => reading,
        };
        if !reading.valid || reading.age() > self.config.staleness {
            debug!("Ignoring stale reading #{}", reading.sequence);
            return Ok(None);
        }

        let pressure = reading.value_in(self.unit);
        if check_preload && !self.preloaded && pressure > self.preload_limit {
            return Err(ControllerError::PreloadExceeded {
                measured: pressure,
                limit: self.preload_limit,
            });
        }
        Ok(Some(pressure))
    }

    /// Stop motion and move to the state matching `err`.
    fn interrupt(&mut self, err: ControllerError) -> ControllerError {
        self.safe_stop();
        self.state = match &err {
            ControllerError::Aborted => ControllerState::Aborted,
            e if e.is_fault() => ControllerState::Faulted(err.clone()),
            _ => ControllerState::Paused,
        };
        match self.state {
            ControllerState::Faulted(_) => error!("Controller fault: {}", err),
            ControllerState::Aborted => warn!("Controller aborted"),
            _ => warn!("Controller paused: {}", err),
        }
        err
    }

    fn drive(&mut self, direction: Direction) -> Result<(), ActuatorError> {
        if self.motion == Motion::Driving(direction) {
            return Ok(());
        }
        let (valve, motor) = match direction {
            Direction::Forward => (ActuatorCommand::OpenInlet, ActuatorCommand::MotorForward),
            Direction::Backward => (ActuatorCommand::OpenOutlet, ActuatorCommand::MotorBackward),
        };
        self.actuator.command(ActuatorCommand::MotorStop)?;
        self.actuator.command(valve)?;
        self.actuator.command(motor)?;
        self.motion = Motion::Driving(direction);
        Ok(())
    }

    fn hold(&mut self) -> Result<(), ActuatorError> {
        if self.motion == Motion::Holding {
            return Ok(());
        }
        self.actuator.command(ActuatorCommand::MotorStop)?;
        self.actuator.command(ActuatorCommand::CloseBoth)?;
        self.motion = Motion::Holding;
        Ok(())
    }

    fn send(&self, command: ActuatorCommand) -> Result<(), ControllerError> {
        self.actuator.command(command).map_err(ControllerError::from)
    }

    fn safe_stop(&mut self) {
        for command in [ActuatorCommand::MotorStop, ActuatorCommand::CloseBoth] {
            if let Err(e) = self.actuator.command(command) {
                error!("Failed to {}: {}", command, e);
            }
        }
        self.motion = Motion::Holding;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ScalePoint;
    use crate::sensor::PressureSensorChannel;
    use crate::sim::{RigConfig, SimulatedRig, SimulatedSensorChannel};

    fn model() -> GaugeModel {
        GaugeModel::new(
            "MP-15",
            PressureUnit::Kgf,
            1.5,
            vec![
                ScalePoint::new(0.0, 0.0),
                ScalePoint::new(5.0, 45.0),
                ScalePoint::new(10.0, 90.0),
                ScalePoint::new(15.0, 135.0),
            ],
        )
        .unwrap()
    }

    fn fast_config() -> ControllerConfig {
        ControllerConfig::default()
            .with_tolerance(0.02)
            .with_settle_window(Duration::from_millis(20))
            .with_staleness(Duration::from_millis(200))
            .with_sample_interval(Duration::from_millis(2))
            .with_ramp_timeout(Duration::from_secs(5))
    }

    struct Bench {
        rig: SimulatedRig,
        sensor: SimulatedSensorChannel,
        abort: AbortHandle,
    }

    impl Bench {
        fn new(initial: f64, rate: f64) -> Self {
            let rig = SimulatedRig::new(
                RigConfig::default()
                    .with_rate(rate)
                    .with_initial_pressure(initial),
            );
            let mut sensor = SimulatedSensorChannel::new(rig.clone(), Duration::from_millis(2));
            sensor.connect("SIM").unwrap();
            sensor.start_polling().unwrap();
            let abort = AbortHandle::new(Arc::new(rig.clone()));
            Self { rig, sensor, abort }
        }

        fn controller(&self, limit: f64, config: ControllerConfig) -> PressureController {
            PressureController::new(
                &model(),
                PressureUnit::Kgf,
                limit,
                config,
                Arc::new(self.rig.clone()),
                self.sensor.subscribe(),
                self.abort.subscribe(),
            )
            .unwrap()
        }
    }

    #[test]
    fn test_requires_scale_points() {
        let empty = GaugeModel {
            name: "empty".to_string(),
            unit: PressureUnit::Kgf,
            printing_template: String::new(),
            accuracy_class: 1.0,
            scale_points: vec![],
        };
        let rig = Arc::new(SimulatedRig::new(RigConfig::default()));
        let (_tx, sensor) = watch::channel(None);
        let result = PressureController::new(
            &empty,
            PressureUnit::Kgf,
            10.0,
            ControllerConfig::default(),
            rig.clone(),
            sensor,
            AbortHandle::new(rig).subscribe(),
        );
        assert!(matches!(
            result,
            Err(ControllerError::InsufficientScalePoints)
        ));
    }

    #[tokio::test]
    async fn test_ramp_reaches_hold() {
        let bench = Bench::new(0.0, 40.0);
        let mut controller = bench.controller(20.0, fast_config());
        controller.ramp_to(10.0, Direction::Forward).await.unwrap();

        assert_eq!(
            controller.state(),
            &ControllerState::HoldAtTarget { target: 10.0 }
        );
        assert!((bench.rig.pressure() - 10.0).abs() <= controller.tolerance());
        assert_eq!(controller.valve_state(), ValveState::BothClosed);

        controller.release_and_seek_next().unwrap();
        assert!(controller.release_and_seek_next().is_err());
        controller.ramp_to(5.0, Direction::Backward).await.unwrap();
        assert!((bench.rig.pressure() - 5.0).abs() <= controller.tolerance());
    }

    #[tokio::test]
    async fn test_preload_limit_released_after_first_hold() {
        let bench = Bench::new(0.0, 40.0);
        let mut controller = bench.controller(8.0, fast_config());
        assert!(!controller.is_preloaded());

        controller.ramp_to(5.0, Direction::Forward).await.unwrap();
        assert!(controller.is_preloaded());
        controller.release_and_seek_next().unwrap();
        controller.ramp_to(15.0, Direction::Forward).await.unwrap();
        assert!((bench.rig.pressure() - 15.0).abs() <= controller.tolerance());
    }

    #[tokio::test]
    async fn test_preload_faults_above_limit_before_first_hold() {
        let bench = Bench::new(0.0, 40.0);
        let mut controller = bench.controller(8.0, fast_config());

        let err = controller
            .ramp_to(15.0, Direction::Forward)
            .await
            .unwrap_err();
        match &err {
            ControllerError::PreloadExceeded { measured, limit } => {
                assert!(*measured > 8.0);
                assert_eq!(*limit, 8.0);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(controller.state(), &ControllerState::Faulted(err));
        assert!(!controller.is_preloaded());
        assert!(bench.rig.pressure() < 15.0);
        assert_eq!(controller.valve_state(), ValveState::BothClosed);
        assert_eq!(bench.rig.motor(), None);

        assert!(matches!(
            controller.ramp_to(5.0, Direction::Backward).await,
            Err(ControllerError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_sensor_error_pauses_and_resumes() {
        let bench = Bench::new(0.0, 40.0);
        let mut controller = bench.controller(20.0, fast_config());
        bench.sensor.inject_fault(SensorError::WriteFailed {
            port: "SIM".to_string(),
            sent: 3,
            total: 5,
            code: 0,
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = controller.ramp_to(5.0, Direction::Forward).await.unwrap_err();
        assert!(matches!(err, ControllerError::Sensor(SensorError::WriteFailed { sent: 3, .. })));
        assert_eq!(controller.state(), &ControllerState::Paused);

        bench.sensor.clear_fault();
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.ramp_to(5.0, Direction::Forward).await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_from_another_task() {
        let bench = Bench::new(0.0, 2.0);
        let mut controller = bench.controller(20.0, fast_config());
        let abort = bench.abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            abort.abort();
        });

        let err = controller.ramp_to(15.0, Direction::Forward).await.unwrap_err();
        assert_eq!(err, ControllerError::Aborted);
        assert_eq!(controller.state(), &ControllerState::Aborted);
        assert_eq!(bench.rig.valve_feedback(), Some(ValveState::BothClosed));
    }

    #[tokio::test]
    async fn test_ramp_timeout_pauses() {
        let bench = Bench::new(0.0, 1.0);
        let config = fast_config().with_ramp_timeout(Duration::from_millis(30));
        let mut controller = bench.controller(20.0, config);
        let err = controller.ramp_to(10.0, Direction::Forward).await.unwrap_err();
        assert!(matches!(err, ControllerError::RampTimeout { .. }));
        assert_eq!(controller.state(), &ControllerState::Paused);
    }

    #[tokio::test]
    async fn test_sight_alignment_vents_to_first_point() {
        let bench = Bench::new(3.0, 40.0);
        let mut controller = bench.controller(1.0, fast_config());
        controller.sight_alignment().await.unwrap();
        assert!(bench.rig.pressure() <= controller.tolerance());
        assert_eq!(controller.state(), &ControllerState::Idle);
    }

    #[tokio::test]
    async fn test_lost_feedback_is_unknown() {
        let bench = Bench::new(0.0, 40.0);
        let mut controller = bench.controller(20.0, fast_config());
        controller.close_valves().unwrap();
        assert_eq!(controller.valve_state(), ValveState::BothClosed);
        bench.rig.set_feedback_available(false);
        assert_eq!(controller.valve_state(), ValveState::Unknown);

        controller.finish();
        assert_eq!(controller.state(), &ControllerState::Complete);
        controller.abort();
        assert_eq!(controller.state(), &ControllerState::Complete);
    }
}
