//! Tessera Core - shared configuration and error handling
//!
//! This crate provides the run configuration model, config file discovery and
//! validation, and the top-level error type used by the Tessera test
//! orchestrator.

pub mod config;
pub mod error;

pub use config::{Config, FlakyConfig, SchedulerConfig};
pub use error::{ConfigError, Result, TesseraError};
