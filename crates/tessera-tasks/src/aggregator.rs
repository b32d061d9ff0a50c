//! Run result aggregation

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::task::{Task, TaskId, TaskStatus};

/// How the run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every task settled
    Completed,
    /// Stopped admitting work after a final failure
    FailFast,
    /// Cancelled from outside
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::FailFast => write!(f, "stopped (fail-fast)"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Final state of one task
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub status: TaskStatus,
    pub attempts: u32,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub quarantined: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output: String,
}

impl TaskRecord {
    pub fn duration(&self) -> Option<Duration> {
        self.duration_ms.map(Duration::from_millis)
    }
}

impl From<&Task> for TaskRecord {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            status: task.status,
            attempts: task.attempts,
            retry_count: task.retry_count,
            exit_code: task.exit_code,
            start_time: task.start_time,
            end_time: task.end_time,
            duration_ms: task.duration().map(|d| d.as_millis() as u64),
            error: task.error.clone(),
            skip_reason: task.skip_reason.clone(),
            quarantined: task.quarantined,
            output: task.output.clone(),
        }
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    /// Final `failed`, `timeout` and `error` tasks
    pub failed: usize,
    pub timed_out: usize,
    pub errored: usize,
    pub skipped: usize,
    pub quarantined: Vec<TaskId>,
    /// Passed over tasks that ran, 0 when nothing ran
    pub success_rate: f64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Sum of every task's final attempt duration
    pub cumulative_task_ms: u64,
    pub outcome: RunOutcome,
    /// Records in topological order
    pub tasks: Vec<TaskRecord>,
}

impl RunSummary {
    /// No task ended in a failure status
    pub fn is_success(&self) -> bool {
        self.tasks
            .iter()
            .all(|t| matches!(t.status, TaskStatus::Passed | TaskStatus::Skipped))
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn get(&self, id: &str) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.id.as_str() == id)
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.iter().filter(|t| t.status.is_failure())
    }
}

/// Collects terminal task records over a run
#[derive(Debug)]
pub struct ResultAggregator {
    position: HashMap<TaskId, usize>,
    records: Vec<TaskRecord>,
    started_at: DateTime<Utc>,
    clock: Instant,
}

impl ResultAggregator {
    /// Start aggregating; `order` fixes the order of records in the summary
    pub fn new(order: &[TaskId]) -> Self {
        Self {
            position: order
                .iter()
                .enumerate()
                .map(|(i, id)| (id.clone(), i))
                .collect(),
            records: Vec::with_capacity(order.len()),
            started_at: Utc::now(),
            clock: Instant::now(),
        }
    }

    /// Record a task in its terminal state. Returns false when ignored.
    pub fn record(&mut self, task: &Task) -> bool {
        if !task.status.is_terminal() {
            warn!(task = %task.id, status = %task.status, "ignoring non-terminal task record");
            return false;
        }
        if self.is_recorded(&task.id) {
            warn!(task = %task.id, "task already recorded, ignoring duplicate");
            return false;
        }
        self.records.push(TaskRecord::from(task));
        true
    }

    pub fn is_recorded(&self, id: &TaskId) -> bool {
        self.records.iter().any(|r| &r.id == id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn summary(&self, outcome: RunOutcome) -> RunSummary {
        let mut tasks = self.records.clone();
        tasks.sort_by_key(|r| self.position.get(&r.id).copied().unwrap_or(usize::MAX));

        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
        let passed = count(TaskStatus::Passed);
        let timed_out = count(TaskStatus::Timeout);
        let errored = count(TaskStatus::Error);
        let failed = count(TaskStatus::Failed) + timed_out + errored;
        let skipped = count(TaskStatus::Skipped);

        let ran = tasks.len() - skipped;
        let success_rate = if ran == 0 {
            0.0
        } else {
            passed as f64 / ran as f64
        };

        RunSummary {
            total: tasks.len(),
            passed,
            failed,
            timed_out,
            errored,
            skipped,
            quarantined: tasks
                .iter()
                .filter(|t| t.quarantined)
                .map(|t| t.id.clone())
                .collect(),
            success_rate,
            started_at: self.started_at,
            duration_ms: self.clock.elapsed().as_millis() as u64,
            cumulative_task_ms: tasks.iter().filter_map(|t| t.duration_ms).sum(),
            outcome,
            tasks,
        }
    }
}
