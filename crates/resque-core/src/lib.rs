//! # Resque Core
//!
//! Core types and error definitions shared by the resque-rs crates.
//! Everything here is independent of the backing store and of the job
//! runtime, so the configuration crate and the jobs crate can both build on it.

pub mod error;
pub mod id;
pub mod telemetry;

pub use error::*;
pub use id::*;
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
