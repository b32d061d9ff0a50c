//! Configuration validation

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::{Config, SchedulerConfig};

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_scheduler(&config.scheduler)?;
    validate_flaky(config)?;
    debug!("configuration validation passed");
    Ok(())
}

fn validate_scheduler(scheduler: &SchedulerConfig) -> Result<()> {
    if scheduler.max_parallel == 0 {
        return Err(ConfigError::invalid("scheduler.max_parallel", "must be at least 1").into());
    }

    for (field, value) in [
        ("scheduler.cpu_threshold", scheduler.cpu_threshold),
        ("scheduler.memory_threshold", scheduler.memory_threshold),
        ("scheduler.disk_threshold", scheduler.disk_threshold),
    ] {
        if !(value > 0.0 && value <= 100.0) {
            return Err(ConfigError::invalid(field, "must be a percentage in (0, 100]").into());
        }
    }

    if scheduler.default_timeout_secs == 0 {
        return Err(
            ConfigError::invalid("scheduler.default_timeout_secs", "must be greater than 0").into(),
        );
    }

    if scheduler.sample_interval_ms == 0 {
        return Err(
            ConfigError::invalid("scheduler.sample_interval_ms", "must be greater than 0").into(),
        );
    }

    Ok(())
}

fn validate_flaky(config: &Config) -> Result<()> {
    if config.flaky.enabled && config.flaky.path.as_os_str().is_empty() {
        return Err(ConfigError::invalid("flaky.path", "path cannot be empty").into());
    }

    if config.scheduler.skip_quarantined && !config.flaky.enabled {
        return Err(ConfigError::invalid(
            "scheduler.skip_quarantined",
            "requires flaky.enabled = true",
        )
        .into());
    }

    Ok(())
}
