//! Exit codes for the CLI

#![allow(dead_code)]

use tessera_core::{ConfigError, TesseraError};
use tessera_tasks::{DagError, SchedulerError};

use crate::cli::commands::{RunFailure, TaskFileError};

/// Success
pub const SUCCESS: u8 = 0;

/// General error
pub const ERROR: u8 = 1;

/// One or more tasks did not pass
pub const TESTS_FAILED: u8 = 1;

/// Configuration, task file or task graph error
pub const CONFIG_ERROR: u8 = 2;

/// No task could make progress
pub const DEADLOCK: u8 = 3;

/// User cancelled
pub const CANCELLED: u8 = 130;

/// Map a command error to the process exit code
pub fn for_error(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(failure) = cause.downcast_ref::<RunFailure>() {
            return match failure {
                RunFailure::TasksFailed { .. } => TESTS_FAILED,
                RunFailure::Cancelled => CANCELLED,
            };
        }
        if let Some(err) = cause.downcast_ref::<SchedulerError>() {
            return match err {
                SchedulerError::Deadlock { .. } => DEADLOCK,
                SchedulerError::Graph(_) => CONFIG_ERROR,
                _ => ERROR,
            };
        }
        if cause.is::<DagError>()
            || cause.is::<TaskFileError>()
            || cause.is::<ConfigError>()
            || cause.is::<TesseraError>()
        {
            return CONFIG_ERROR;
        }
    }
    ERROR
}
