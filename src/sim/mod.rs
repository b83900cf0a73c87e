//! Simulated stand: plant model, stub transducer and ideal needle.

mod needle;
mod rig;
mod sensor;

pub use needle::SimulatedNeedle;
pub use rig::{RigConfig, SimulatedRig};
pub use sensor::{FaultInjector, SimulatedSensorChannel};
