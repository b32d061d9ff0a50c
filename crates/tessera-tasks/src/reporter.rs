//! Task execution reporting

use std::sync::Arc;
use std::time::Duration;

use crate::task::{TaskId, TaskStatus};

/// Events emitted during a run
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// The coordinator accepted the task set
    RunStarted { total: usize, max_parallel: usize },
    /// An attempt is starting
    Started {
        id: TaskId,
        attempt: u32,
        command: String,
    },
    /// A task produced output
    Output {
        id: TaskId,
        line: String,
        is_stderr: bool,
    },
    /// A task passed
    Completed {
        id: TaskId,
        attempt: u32,
        duration: Duration,
    },
    /// An attempt failed and the task will run again after `delay`
    Retrying {
        id: TaskId,
        status: TaskStatus,
        attempt: u32,
        max_retries: u32,
        delay: Duration,
        error: Option<String>,
    },
    /// A task failed for good
    Failed {
        id: TaskId,
        status: TaskStatus,
        duration: Duration,
        error: String,
    },
    /// A task was written to the flaky store
    Quarantined { id: TaskId },
    /// A task will not run
    Skipped { id: TaskId, reason: String },
    /// Admission was refused for resource pressure
    Throttled { reason: String },
    /// The run is over
    RunFinished {
        total: usize,
        passed: usize,
        failed: usize,
        skipped: usize,
        duration: Duration,
    },
}

/// Trait for reporting task execution progress
pub trait TaskReporter: Send + Sync {
    /// Handle a task event
    fn report(&self, event: &TaskEvent);
}

/// Simple reporter that logs to tracing
#[derive(Debug, Default)]
pub struct TracingReporter;

impl TaskReporter for TracingReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::RunStarted {
                total,
                max_parallel,
            } => {
                tracing::info!(total, max_parallel, "Starting run of {} tasks", total);
            }
            TaskEvent::Started {
                id,
                attempt,
                command,
            } => {
                tracing::info!(task = %id, attempt, "Starting {}: {}", id, command);
            }
            TaskEvent::Output { id, line, is_stderr } => {
                if *is_stderr {
                    tracing::debug!(task = %id, stream = "stderr", "{}", line);
                } else {
                    tracing::trace!(task = %id, stream = "stdout", "{}", line);
                }
            }
            TaskEvent::Completed {
                id,
                attempt,
                duration,
            } => {
                tracing::info!(task = %id, attempt, "{} passed in {:.1}s", id, duration.as_secs_f64());
            }
            TaskEvent::Retrying {
                id,
                status,
                attempt,
                max_retries,
                delay,
                error,
            } => {
                tracing::warn!(
                    task = %id,
                    %status,
                    attempt,
                    max_retries,
                    error = error.as_deref().unwrap_or(""),
                    "{} {}, retrying in {:.1}s",
                    id,
                    status,
                    delay.as_secs_f64()
                );
            }
            TaskEvent::Failed {
                id,
                status,
                duration,
                error,
            } => {
                tracing::error!(task = %id, %status, "{} failed after {:.1}s: {}", id, duration.as_secs_f64(), error);
            }
            TaskEvent::Quarantined { id } => {
                tracing::warn!(task = %id, "{} quarantined as flaky", id);
            }
            TaskEvent::Skipped { id, reason } => {
                tracing::info!(task = %id, "{} skipped: {}", id, reason);
            }
            TaskEvent::Throttled { reason } => {
                tracing::debug!("Admission throttled: {}", reason);
            }
            TaskEvent::RunFinished {
                total,
                passed,
                failed,
                skipped,
                duration,
            } => {
                tracing::info!(
                    "Run complete: {}/{} passed, {} failed, {} skipped ({:.1}s)",
                    passed,
                    total,
                    failed,
                    skipped,
                    duration.as_secs_f64()
                );
            }
        }
    }
}

/// Reporter that collects events for later inspection (useful for testing)
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: std::sync::Mutex<Vec<TaskEvent>>,
}

impl CollectingReporter {
    /// Get all collected events
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl TaskReporter for CollectingReporter {
    fn report(&self, event: &TaskEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Registry of task reporters
pub struct TaskReporterRegistry {
    reporters: Vec<Arc<dyn TaskReporter>>,
}

impl TaskReporterRegistry {
    pub fn new() -> Self {
        Self {
            reporters: vec![Arc::new(TracingReporter)],
        }
    }

    pub fn empty() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn register<R: TaskReporter + 'static>(&mut self, reporter: R) {
        self.reporters.push(Arc::new(reporter));
    }

    /// Register a reporter the caller keeps a handle to
    pub fn register_shared(&mut self, reporter: Arc<dyn TaskReporter>) {
        self.reporters.push(reporter);
    }

    pub fn all(&self) -> &[Arc<dyn TaskReporter>] {
        &self.reporters
    }

    /// Broadcast an event to all registered reporters
    pub fn broadcast(&self, event: &TaskEvent) {
        for reporter in &self.reporters {
            reporter.report(event);
        }
    }
}

impl Default for TaskReporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskReporter for TaskReporterRegistry {
    fn report(&self, event: &TaskEvent) {
        self.broadcast(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_reporter() {
        let reporter = CollectingReporter::default();
        let id = TaskId::new("blog-unit");

        reporter.report(&TaskEvent::Started {
            id: id.clone(),
            attempt: 1,
            command: "npm test".to_string(),
        });
        reporter.report(&TaskEvent::Completed {
            id,
            attempt: 1,
            duration: Duration::from_secs(5),
        });

        let events = reporter.events();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_tracing_reporter() {
        let reporter = TracingReporter;
        let id = TaskId::new("blog-unit");

        // Just verify it doesn't panic
        reporter.report(&TaskEvent::Retrying {
            id: id.clone(),
            status: TaskStatus::Timeout,
            attempt: 1,
            max_retries: 2,
            delay: Duration::from_secs(5),
            error: None,
        });
        reporter.report(&TaskEvent::Failed {
            id,
            status: TaskStatus::Failed,
            duration: Duration::from_secs(1),
            error: "exit 1".to_string(),
        });
    }

    #[test]
    fn test_empty_registry() {
        let registry = TaskReporterRegistry::empty();
        assert!(registry.all().is_empty());
    }

    #[test]
    fn test_broadcast() {
        let collecting = Arc::new(CollectingReporter::default());
        let mut registry = TaskReporterRegistry::empty();
        registry.register_shared(collecting.clone());

        registry.broadcast(&TaskEvent::Skipped {
            id: TaskId::new("blog-e2e"),
            reason: "fail-fast".to_string(),
        });

        assert_eq!(collecting.events().len(), 1);
    }

    #[test]
    fn test_register() {
        let mut registry = TaskReporterRegistry::empty();
        registry.register(TracingReporter);
        assert_eq!(registry.all().len(), 1);

        registry.register(CollectingReporter::default());
        assert_eq!(registry.all().len(), 2);
    }

    #[test]
    fn test_registry_is_a_reporter() {
        let collecting = Arc::new(CollectingReporter::default());
        let mut registry = TaskReporterRegistry::empty();
        registry.register_shared(collecting.clone());

        let reporter: Arc<dyn TaskReporter> = Arc::new(registry);
        reporter.report(&TaskEvent::Quarantined {
            id: TaskId::new("blog-e2e"),
        });
        assert_eq!(collecting.events().len(), 1);
    }
}
