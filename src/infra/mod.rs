//! Infrastructure errors and runtime bootstrap.

pub mod error;
pub mod telemetry;
