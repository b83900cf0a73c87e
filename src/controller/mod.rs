//! Pressure control: actuator boundary, stroke planning and the controller
//! state machine.

mod actuator;
mod machine;
mod plan;

pub use actuator::{Actuator, ActuatorCommand, ActuatorError, ValveState};
pub use machine::{
    AbortHandle, ControllerConfig, ControllerError, ControllerState, PressureController,
};
pub use plan::{plan_steps, Direction, Step, StrokeMode};
