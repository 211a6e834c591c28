//! # Resque Config
//!
//! Configuration for resque-rs. Values are layered from TOML files and
//! `RESQUE__*` environment variables, then validated before use.

mod jobs_config;
mod loader;

pub use jobs_config::*;
pub use loader::*;
