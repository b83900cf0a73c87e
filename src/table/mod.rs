//! Graduation tables and their evaluation.

mod graduation;
mod nonlinearity;

pub use graduation::{GraduationPoint, GraduationTable, TableError};
pub use nonlinearity::{DeviationRow, HysteresisRow, NonlinearityReport};
