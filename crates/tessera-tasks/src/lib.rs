//! Tessera Tasks - test task scheduling and execution engine
//!
//! This crate provides dependency-aware, resource-governed parallel execution
//! of test commands, with retries, timeouts and durable quarantine of flaky
//! tasks.

pub mod aggregator;
pub mod dag;
pub mod executor;
pub mod flaky;
pub mod governor;
pub mod reporter;
pub mod scheduler;
pub mod task;

pub use aggregator::{ResultAggregator, RunOutcome, RunSummary, TaskRecord};
pub use dag::{DagError, TaskDag, TaskNode};
pub use executor::{
    ExecutionError, ExecutionOutcome, ExecutionRequest, ExecutionStatus, ScriptedExecutor,
    ShellExecutor, TaskExecutor,
};
pub use flaky::{FlakyStore, FlakyStoreError};
pub use governor::{
    Admission, CpuMeter, CpuTimes, ManualSampler, ResourceGovernor, ResourceLimits, ResourceSampler,
    ResourceSnapshot, SamplingError, SystemSampler,
};
pub use reporter::{CollectingReporter, TaskEvent, TaskReporter, TaskReporterRegistry, TracingReporter};
pub use scheduler::{SchedulerError, SchedulerOptions, TaskScheduler};
pub use task::{InvalidTransition, ResourceEstimate, Task, TaskId, TaskSpec, TaskStatus};
