//! Configuration types

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scheduler / run configuration
    pub scheduler: SchedulerConfig,

    /// Flaky test quarantine configuration
    pub flaky: FlakyConfig,
}

/// Scheduling, admission and retry settings for a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of tasks running at once
    pub max_parallel: usize,

    /// CPU usage (percent) that projected admissions must stay under
    pub cpu_threshold: f64,

    /// Memory usage (percent) that projected admissions must stay under
    pub memory_threshold: f64,

    /// Disk usage (percent) above which nothing new is admitted
    pub disk_threshold: f64,

    /// Skip all pending work after the first task that fails for good
    pub fail_fast: bool,

    /// Skip tasks that are present in the flaky store
    pub skip_quarantined: bool,

    /// Skip dependents of a task that failed for good instead of stalling
    pub cascade_skips: bool,

    /// Timeout applied to tasks that don't declare one
    pub default_timeout_secs: u64,

    /// Retry budget applied to tasks that don't declare one
    pub default_max_retries: u32,

    /// Delay before a failed task becomes eligible again
    pub retry_delay_ms: u64,

    /// Wait between ticks when nothing could be admitted but work is running
    pub backpressure_wait_ms: u64,

    /// Wait between ticks when nothing is running and resources are exhausted
    pub resource_wait_ms: u64,

    /// How often the background sampler refreshes host metrics
    pub sample_interval_ms: u64,

    /// Grace period between SIGTERM and SIGKILL for timed-out tasks
    pub kill_grace_ms: u64,

    /// Extra environment variables passed to every task
    pub env: HashMap<String, String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            cpu_threshold: 80.0,
            memory_threshold: 85.0,
            disk_threshold: 90.0,
            fail_fast: false,
            skip_quarantined: false,
            cascade_skips: true,
            default_timeout_secs: 900,
            default_max_retries: 2,
            retry_delay_ms: 5_000,
            backpressure_wait_ms: 1_000,
            resource_wait_ms: 5_000,
            sample_interval_ms: 1_000,
            kill_grace_ms: 2_000,
            env: HashMap::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn backpressure_wait(&self) -> Duration {
        Duration::from_millis(self.backpressure_wait_ms)
    }

    pub fn resource_wait(&self) -> Duration {
        Duration::from_millis(self.resource_wait_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Flaky test quarantine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlakyConfig {
    /// Whether quarantine membership is persisted at all
    pub enabled: bool,

    /// Store location, relative to the run root unless absolute
    pub path: PathBuf,
}

impl Default for FlakyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from(super::defaults::DEFAULT_FLAKY_FILE),
        }
    }
}

impl FlakyConfig {
    /// Resolve the store path against a run root
    pub fn resolve_path(&self, root: &std::path::Path) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            root.join(&self.path)
        }
    }
}
