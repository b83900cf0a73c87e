//! Simulated pressure stand.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::time::Instant;
use tracing::debug;

use crate::controller::{Actuator, ActuatorCommand, ActuatorError, Direction, ValveState};
use crate::units::PressureUnit;

/// Plant parameters of the simulated stand.
#[derive(Debug, Clone)]
pub struct RigConfig {
    pub unit: PressureUnit,
    /// Pressure change per second while the motor runs against an open valve.
    pub rate: f64,
    pub initial_pressure: f64,
    /// Lowest reachable pressure (atmosphere).
    pub min_pressure: f64,
    /// Highest reachable pressure (press end stop).
    pub max_pressure: f64,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            unit: PressureUnit::Kgf,
            rate: 2.0,
            initial_pressure: 0.0,
            min_pressure: 0.0,
            max_pressure: 1000.0,
        }
    }
}

impl RigConfig {
    pub fn with_unit(mut self, unit: PressureUnit) -> Self {
        self.unit = unit;
        self
    }

    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_initial_pressure(mut self, pressure: f64) -> Self {
        self.initial_pressure = pressure;
        self
    }

    pub fn with_max_pressure(mut self, pressure: f64) -> Self {
        self.max_pressure = pressure;
        self
    }
}

#[derive(Debug)]
struct RigState {
    pressure: f64,
    motor: Option<Direction>,
    valve: ValveState,
    feedback: bool,
    updated_at: Instant,
    commands: Vec<ActuatorCommand>,
}

/// Shared plant model: the actuator side drives it, the simulated sensor
/// and needle read it.
#[derive(Debug, Clone)]
pub struct SimulatedRig {
    config: RigConfig,
    state: Arc<Mutex<RigState>>,
}

impl SimulatedRig {
    pub fn new(config: RigConfig) -> Self {
        let state = RigState {
            pressure: config.initial_pressure,
            motor: None,
            valve: ValveState::Unknown,
            feedback: true,
            updated_at: Instant::now(),
            commands: Vec::new(),
        };
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn unit(&self) -> PressureUnit {
        self.config.unit
    }

    /// Current pressure in the rig unit.
    pub fn pressure(&self) -> f64 {
        let mut state = self.lock();
        self.advance(&mut state);
        state.pressure
    }

    /// Force the plant to a pressure.
    pub fn set_pressure(&self, pressure: f64) {
        let mut state = self.lock();
        self.advance(&mut state);
        state.pressure = pressure;
    }

    /// Enable or drop valve position feedback.
    pub fn set_feedback_available(&self, available: bool) {
        self.lock().feedback = available;
    }

    pub fn motor(&self) -> Option<Direction> {
        self.lock().motor
    }

    /// Every command received so far.
    pub fn command_log(&self) -> Vec<ActuatorCommand> {
        self.lock().commands.clone()
    }

    fn lock(&self) -> MutexGuard<'_, RigState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn advance(&self, state: &mut RigState) {
        let now = Instant::now();
        let dt = now.duration_since(state.updated_at).as_secs_f64();
        state.updated_at = now;
        let delta = match (state.motor, state.valve) {
            (Some(Direction::Forward), ValveState::InletOpen) => self.config.rate * dt,
            (Some(Direction::Backward), ValveState::OutletOpen) => -self.config.rate * dt,
            _ => 0.0,
        };
        state.pressure = (state.pressure + delta)
            .clamp(self.config.min_pressure, self.config.max_pressure);
    }
}

impl Actuator for SimulatedRig {
    fn command(&self, command: ActuatorCommand) -> Result<(), ActuatorError> {
        let mut state = self.lock();
        self.advance(&mut state);
        match command {
            ActuatorCommand::OpenInlet => state.valve = ValveState::InletOpen,
            ActuatorCommand::OpenOutlet => state.valve = ValveState::OutletOpen,
            ActuatorCommand::CloseBoth => state.valve = ValveState::BothClosed,
            ActuatorCommand::MotorForward => state.motor = Some(Direction::Forward),
            ActuatorCommand::MotorBackward => state.motor = Some(Direction::Backward),
            ActuatorCommand::MotorStop => state.motor = None,
        }
        state.commands.push(command);
        debug!("Rig: {} at {:.3} {}", command, state.pressure, self.config.unit);
        Ok(())
    }

    fn valve_feedback(&self) -> Option<ValveState> {
        let state = self.lock();
        state.feedback.then_some(state.valve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pressure_follows_motor_and_valve() {
        let rig = SimulatedRig::new(RigConfig::default().with_rate(1000.0));
        rig.command(ActuatorCommand::MotorForward).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        // inlet still closed
        assert_eq!(rig.pressure(), 0.0);

        rig.command(ActuatorCommand::OpenInlet).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        rig.command(ActuatorCommand::MotorStop).unwrap();
        let held = rig.pressure();
        assert!(held > 0.0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(rig.pressure(), held);
    }

    #[test]
    fn test_valve_feedback() {
        let rig = SimulatedRig::new(RigConfig::default());
        assert_eq!(rig.valve_feedback(), Some(ValveState::Unknown));
        rig.command(ActuatorCommand::CloseBoth).unwrap();
        assert_eq!(rig.valve_feedback(), Some(ValveState::BothClosed));
        rig.set_feedback_available(false);
        assert_eq!(rig.valve_feedback(), None);
    }
}
