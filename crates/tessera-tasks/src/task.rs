//! Task types, definitions and the per-task state machine

use std::borrow::Borrow;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::executor::ExecutionOutcome;

/// Unique identifier for a task within a run
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create a new task ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build the conventional `<app>-<suite>` identifier (e.g. `blog-unit`)
    pub fn for_suite(app: &str, suite: &str) -> Self {
        Self(format!("{}-{}", app, suite))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Approximate footprint of a task, in percent of the host
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceEstimate {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

impl ResourceEstimate {
    pub fn new(cpu_percent: f64, memory_percent: f64) -> Self {
        Self {
            cpu_percent,
            memory_percent,
        }
    }
}

/// Lifecycle status of a task.
///
/// `Failed`, `Timeout` and `Error` are retryable; once the retry budget is
/// spent they are also final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Timeout,
    Error,
    Skipped,
}

impl TaskStatus {
    /// Failure outcomes that may be retried
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Timeout | Self::Error)
    }

    /// Whether the status is settled outside the coordinator's retry handling
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Skipped) => true,
            (Running, Passed) | (Running, Failed) | (Running, Timeout) | (Running, Error) => true,
            (Failed, Pending) | (Timeout, Pending) | (Error, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Attempted a status change the state machine does not allow
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Task '{id}' cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Definition of a task as supplied by the caller.
///
/// Timeout and retry budget are optional here and filled from run defaults
/// when the spec is turned into a [`Task`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task identifier
    pub id: TaskId,

    /// Shell command to execute
    #[serde(default)]
    pub command: Option<String>,

    /// Tasks that must pass first
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,

    /// Lower runs earlier among ready tasks
    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub max_retries: Option<u32>,

    #[serde(default)]
    pub resource_estimate: ResourceEstimate,

    /// Expected runtime, used to start long tasks first
    #[serde(default)]
    pub estimated_duration_secs: f64,

    /// Environment variables to pass
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory relative to the run root
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl TaskSpec {
    /// Create a new task spec
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            command: None,
            dependencies: BTreeSet::new(),
            priority: 0,
            timeout_secs: None,
            max_retries: None,
            resource_estimate: ResourceEstimate::default(),
            estimated_duration_secs: 0.0,
            env: HashMap::new(),
            working_dir: None,
        }
    }

    /// Set the command
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Add a dependency
    pub fn with_dependency(mut self, dep: impl Into<TaskId>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_resource_estimate(mut self, cpu_percent: f64, memory_percent: f64) -> Self {
        self.resource_estimate = ResourceEstimate::new(cpu_percent, memory_percent);
        self
    }

    pub fn with_estimated_duration(mut self, duration: Duration) -> Self {
        self.estimated_duration_secs = duration.as_secs_f64();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Turn the spec into a schedulable task, applying run defaults
    pub fn into_task(self, default_timeout: Duration, default_max_retries: u32) -> Task {
        Task {
            timeout: self
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(default_timeout),
            max_retries: self.max_retries.unwrap_or(default_max_retries),
            estimated_duration: Duration::try_from_secs_f64(self.estimated_duration_secs)
                .unwrap_or_default(),
            id: self.id,
            command: self.command,
            dependencies: self.dependencies,
            priority: self.priority,
            resource_estimate: self.resource_estimate,
            env: self.env,
            working_dir: self.working_dir,
            status: TaskStatus::Pending,
            retry_count: 0,
            attempts: 0,
            start_time: None,
            end_time: None,
            output: String::new(),
            error: None,
            exit_code: None,
            skip_reason: None,
            quarantined: false,
        }
    }
}

/// A schedulable task plus its mutable run state
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub command: Option<String>,
    pub dependencies: BTreeSet<TaskId>,
    pub priority: i32,
    pub timeout: Duration,
    pub max_retries: u32,
    pub resource_estimate: ResourceEstimate,
    pub estimated_duration: Duration,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,

    // Run state, mutated only by the scheduler
    pub status: TaskStatus,
    pub retry_count: u32,
    /// Number of times the command was started
    pub attempts: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Combined stdout/stderr of the latest attempt
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub skip_reason: Option<String>,
    /// Written to the flaky store after exhausting its retries
    pub quarantined: bool,
}

impl Task {
    /// Wall-clock time of the latest attempt
    pub fn duration(&self) -> Option<Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }

    pub fn is_successful(&self) -> bool {
        self.status == TaskStatus::Passed
    }

    /// Whether another attempt is allowed after a failure
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Command to run, if one is configured and non-blank
    pub fn runnable_command(&self) -> Option<&str> {
        self.command.as_deref().filter(|c| !c.trim().is_empty())
    }

    fn transition(&mut self, to: TaskStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(to) {
            return Err(InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// `PENDING → RUNNING`
    pub fn start(&mut self, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Running)?;
        self.attempts += 1;
        self.start_time = Some(at);
        self.end_time = None;
        self.output.clear();
        self.error = None;
        self.exit_code = None;
        Ok(())
    }

    /// `RUNNING → PASSED | FAILED | TIMEOUT | ERROR`
    pub fn finish(&mut self, outcome: ExecutionOutcome) -> Result<(), InvalidTransition> {
        self.transition(outcome.status.into())?;
        self.end_time = Some(outcome.finished_at);
        self.output = outcome.output;
        self.error = outcome.error;
        self.exit_code = outcome.exit_code;
        Ok(())
    }

    /// Failure back to `PENDING`, consuming one retry
    pub fn reset_for_retry(&mut self) -> Result<(), InvalidTransition> {
        if !self.can_retry() {
            return Err(InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: TaskStatus::Pending,
            });
        }
        self.transition(TaskStatus::Pending)?;
        self.retry_count += 1;
        self.start_time = None;
        self.end_time = None;
        Ok(())
    }

    /// `PENDING → SKIPPED`
    pub fn skip(&mut self, reason: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Skipped)?;
        self.start_time = None;
        self.end_time = None;
        self.skip_reason = Some(reason.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionOutcome, ExecutionStatus};

    fn task(spec: TaskSpec) -> Task {
        spec.into_task(Duration::from_secs(900), 2)
    }

    #[test]
    fn test_task_id_for_suite() {
        let id = TaskId::for_suite("blog", "unit");
        assert_eq!(id.to_string(), "blog-unit");
        assert_eq!(id.as_str(), "blog-unit");
    }

    #[test]
    fn test_spec_applies_defaults() {
        let t = task(TaskSpec::new("blog-unit").with_command("npm test"));
        assert_eq!(t.timeout, Duration::from_secs(900));
        assert_eq!(t.max_retries, 2);
        assert_eq!(t.status, TaskStatus::Pending);

        let t = task(
            TaskSpec::new("blog-e2e")
                .with_command("npx playwright test")
                .with_timeout(Duration::from_secs(30))
                .with_max_retries(0),
        );
        assert_eq!(t.timeout, Duration::from_secs(30));
        assert_eq!(t.max_retries, 0);
    }

    #[test]
    fn test_spec_deserialize_minimal() {
        let spec: TaskSpec = serde_json::from_str(
            r#"{"id": "server-integration", "command": "npm run test:integration",
                "dependencies": ["server-unit"], "priority": 2}"#,
        )
        .unwrap();
        assert_eq!(spec.id, TaskId::new("server-integration"));
        assert!(spec.dependencies.contains("server-unit"));
        assert_eq!(spec.priority, 2);
        assert!(spec.timeout_secs.is_none());
    }

    #[test]
    fn test_state_machine_happy_path() {
        let mut t = task(TaskSpec::new("a").with_command("true"));
        let started = Utc::now();
        t.start(started).unwrap();
        assert_eq!(t.status, TaskStatus::Running);
        assert_eq!(t.attempts, 1);

        let outcome = ExecutionOutcome::from_status(ExecutionStatus::Passed, started);
        t.finish(outcome).unwrap();
        assert!(t.is_successful());
        assert!(t.duration().is_some());
    }

    #[test]
    fn test_retry_consumes_budget() {
        let mut t = task(TaskSpec::new("a").with_command("false").with_max_retries(1));
        t.start(Utc::now()).unwrap();
        t.finish(ExecutionOutcome::from_status(ExecutionStatus::Failed, Utc::now()))
            .unwrap();
        assert!(t.can_retry());
        t.reset_for_retry().unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.retry_count, 1);
        assert!(t.start_time.is_none());

        t.start(Utc::now()).unwrap();
        t.finish(ExecutionOutcome::from_status(ExecutionStatus::Timeout, Utc::now()))
            .unwrap();
        assert!(!t.can_retry());
        assert!(t.reset_for_retry().is_err());
        assert_eq!(t.retry_count, 1);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut t = task(TaskSpec::new("a").with_command("true"));
        let err = t
            .finish(ExecutionOutcome::from_status(ExecutionStatus::Passed, Utc::now()))
            .unwrap_err();
        assert_eq!(err.from, TaskStatus::Pending);
        assert_eq!(err.to, TaskStatus::Passed);

        t.start(Utc::now()).unwrap();
        assert!(t.skip("too late").is_err());
    }

    #[test]
    fn test_skip_clears_times() {
        let mut t = task(TaskSpec::new("a"));
        t.skip("no command configured").unwrap();
        assert_eq!(t.status, TaskStatus::Skipped);
        assert!(t.duration().is_none());
        assert_eq!(t.skip_reason.as_deref(), Some("no command configured"));
    }

    #[test]
    fn test_runnable_command_ignores_blank() {
        assert!(task(TaskSpec::new("a").with_command("   ")).runnable_command().is_none());
        assert_eq!(
            task(TaskSpec::new("a").with_command("npm test")).runnable_command(),
            Some("npm test")
        );
    }
}
