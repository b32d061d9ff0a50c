//! Task scheduler: the coordinating control loop
//!
//! One coordinator owns all task state. Each tick it drains worker
//! completions, applies the retry and quarantine policy, picks ready tasks in
//! priority order and asks the resource governor whether each may start.
//! Admitted tasks run on spawned workers that report back over a channel.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tessera_core::SchedulerConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::aggregator::{ResultAggregator, RunOutcome, RunSummary};
use crate::dag::{DagError, TaskDag};
use crate::executor::{ExecutionError, ExecutionOutcome, ExecutionRequest, TaskExecutor};
use crate::flaky::FlakyStore;
use crate::governor::{Admission, ResourceGovernor, ResourceLimits, SystemSampler};
use crate::reporter::{TaskEvent, TaskReporter};
use crate::task::{InvalidTransition, TaskId, TaskStatus};

/// Options for the task scheduler
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Maximum concurrent tasks
    pub max_parallel: usize,
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub disk_threshold: f64,
    /// Stop admitting work after the first final failure
    pub fail_fast: bool,
    /// Skip tasks found in the flaky store
    pub skip_quarantined: bool,
    /// Skip dependents of tasks that will never pass
    pub cascade_skips: bool,
    pub retry_delay: Duration,
    pub backpressure_wait: Duration,
    pub resource_wait: Duration,
    pub sample_interval: Duration,
    /// Working directory root
    pub root_dir: PathBuf,
    /// Environment added to every task
    pub env: HashMap<String, String>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from_config(
            &SchedulerConfig::default(),
            std::env::current_dir().unwrap_or_default(),
        )
    }
}

impl SchedulerOptions {
    pub fn from_config(config: &SchedulerConfig, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            max_parallel: config.max_parallel,
            cpu_threshold: config.cpu_threshold,
            memory_threshold: config.memory_threshold,
            disk_threshold: config.disk_threshold,
            fail_fast: config.fail_fast,
            skip_quarantined: config.skip_quarantined,
            cascade_skips: config.cascade_skips,
            retry_delay: config.retry_delay(),
            backpressure_wait: config.backpressure_wait(),
            resource_wait: config.resource_wait(),
            sample_interval: config.sample_interval(),
            root_dir: root_dir.into(),
            env: config.env.clone(),
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_skip_quarantined(mut self, skip: bool) -> Self {
        self.skip_quarantined = skip;
        self
    }

    pub fn with_cascade_skips(mut self, cascade: bool) -> Self {
        self.cascade_skips = cascade;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Waits used when admission is refused with and without running work
    pub fn with_waits(mut self, backpressure: Duration, resource: Duration) -> Self {
        self.backpressure_wait = backpressure;
        self.resource_wait = resource;
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = root_dir.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Admission limits for the default governor
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            max_parallel: self.max_parallel.max(1),
            cpu_threshold: self.cpu_threshold,
            memory_threshold: self.memory_threshold,
            disk_threshold: self.disk_threshold,
        }
    }
}

/// Run-level failures, distinct from tasks that failed
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Graph(#[from] DagError),

    #[error("Deadlock: no task can make progress ({} waiting: {})", .stuck.len(), join_ids(.stuck))]
    Deadlock { stuck: Vec<TaskId> },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Worker reported unknown task '{0}'")]
    UnknownTask(TaskId),
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter().map(TaskId::as_str).collect::<Vec<_>>().join(", ")
}

/// Task scheduler: executes a DAG of tasks with bounded, resource-aware parallelism
pub struct TaskScheduler {
    options: SchedulerOptions,
    executor: Arc<dyn TaskExecutor>,
    reporter: Arc<dyn TaskReporter>,
    governor: Option<Arc<ResourceGovernor>>,
    flaky: FlakyStore,
    cancel: CancellationToken,
}

impl TaskScheduler {
    /// Create a new scheduler.
    ///
    /// Without [`TaskScheduler::with_governor`] the host is sampled through
    /// [`SystemSampler`]; without [`TaskScheduler::with_flaky_store`]
    /// quarantine is kept in memory only.
    pub fn new(
        options: SchedulerOptions,
        executor: Arc<dyn TaskExecutor>,
        reporter: Arc<dyn TaskReporter>,
    ) -> Self {
        Self {
            options,
            executor,
            reporter,
            governor: None,
            flaky: FlakyStore::in_memory(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_governor(mut self, governor: Arc<ResourceGovernor>) -> Self {
        self.governor = Some(governor);
        self
    }

    pub fn with_flaky_store(mut self, flaky: FlakyStore) -> Self {
        self.flaky = flaky;
        self
    }

    /// Cancel the run when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn flaky_store(&self) -> &FlakyStore {
        &self.flaky
    }

    /// Token that cancels the run
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute every task in the DAG and summarise the result.
    ///
    /// Tasks that fail do not make this an error; inspect
    /// [`RunSummary::is_success`]. Errors are reserved for an invalid graph and
    /// a run that can no longer make progress.
    #[instrument(skip_all, fields(task_count = dag.len(), max_parallel = self.options.max_parallel))]
    pub async fn run(&self, dag: &mut TaskDag) -> Result<RunSummary, SchedulerError> {
        dag.validate()?;

        let governor = self.governor.clone().unwrap_or_else(|| {
            Arc::new(ResourceGovernor::new(
                self.options.limits(),
                Arc::new(SystemSampler::new(self.options.root_dir.clone())),
            ))
        });
        // The first reading may block while the CPU baseline accumulates
        let initial = Arc::clone(&governor);
        if let Err(e) = tokio::task::spawn_blocking(move || initial.refresh()).await {
            warn!(error = %e, "initial resource sample failed");
        }
        let sampler_cancel = CancellationToken::new();
        let sampler = governor.spawn_sampler(self.options.sample_interval, sampler_cancel.clone());

        let workers_cancel = self.cancel.child_token();
        let max_parallel = self.options.max_parallel.max(1);
        let (tx, rx) = mpsc::channel(max_parallel);
        let mut run = Run {
            scheduler: self,
            governor,
            aggregator: ResultAggregator::new(dag.sorted()),
            dag,
            max_parallel,
            running: HashSet::new(),
            retry_at: HashMap::new(),
            cancelling: false,
            fail_fast_triggered: false,
            last_throttle: None,
            workers_cancel: workers_cancel.clone(),
            pending_writes: Vec::new(),
            tx,
            rx,
        };

        let result = run.drive().await;

        // Stray workers only exist if the loop bailed out early
        workers_cancel.cancel();
        sampler_cancel.cancel();
        if let Err(e) = sampler.await {
            warn!(error = %e, "resource sampler did not shut down cleanly");
        }
        for write in run.pending_writes.drain(..) {
            if let Err(e) = write.await {
                warn!(error = %e, "flaky store write did not complete");
            }
        }
        let flaky = self.flaky.clone();
        match tokio::task::spawn_blocking(move || flaky.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to flush flaky store"),
            Err(e) => warn!(error = %e, "flaky store flush did not complete"),
        }
        result
    }
}

/// Message from a worker
#[derive(Debug)]
struct Completion {
    id: TaskId,
    outcome: ExecutionOutcome,
}

/// State of one scheduling session
struct Run<'a> {
    scheduler: &'a TaskScheduler,
    dag: &'a mut TaskDag,
    governor: Arc<ResourceGovernor>,
    aggregator: ResultAggregator,
    max_parallel: usize,
    running: HashSet<TaskId>,
    /// Earliest instant a retried task may start again
    retry_at: HashMap<TaskId, Instant>,
    cancelling: bool,
    fail_fast_triggered: bool,
    last_throttle: Option<String>,
    workers_cancel: CancellationToken,
    /// Flaky store writes still in flight
    pending_writes: Vec<JoinHandle<()>>,
    tx: mpsc::Sender<Completion>,
    rx: mpsc::Receiver<Completion>,
}

impl Run<'_> {
    fn report(&self, event: TaskEvent) {
        self.scheduler.reporter.report(&event);
    }

    async fn drive(&mut self) -> Result<RunSummary, SchedulerError> {
        let scheduler = self.scheduler;
        self.report(TaskEvent::RunStarted {
            total: self.dag.len(),
            max_parallel: self.max_parallel,
        });
        info!(total = self.dag.len(), "run started");

        self.prepare()?;

        loop {
            if scheduler.cancel.is_cancelled() && !self.cancelling {
                self.begin_cancel()?;
            }

            while let Ok(completion) = self.rx.try_recv() {
                self.complete(completion)?;
            }

            if self.dag.is_exhausted() {
                break;
            }
            if self.dag.has_progress_stalled() {
                let stuck = self.dag.stuck_tasks();
                warn!(stuck = ?stuck, "no runnable tasks remain");
                return Err(SchedulerError::Deadlock { stuck });
            }

            let now = Instant::now();
            let candidates = self.candidates(now);
            let mut admitted = 0usize;
            let mut refused = false;

            for id in &candidates {
                if self.running.len() >= self.max_parallel {
                    refused = true;
                    break;
                }
                let Some(task) = self.dag.get(id) else {
                    continue;
                };
                let decision = self.governor.can_admit(task, self.running.len());
                match decision {
                    Admission::Admit => {
                        self.dispatch(id)?;
                        admitted += 1;
                    }
                    Admission::ConcurrencyLimit { .. } => {
                        refused = true;
                        break;
                    }
                    pressure => {
                        refused = true;
                        self.throttled(&pressure);
                    }
                }
            }
            if admitted > 0 {
                self.last_throttle = None;
                continue;
            }

            let mut wait = self.next_retry_due().map(|due| due.saturating_duration_since(now));
            if refused {
                let idle = if self.running.is_empty() {
                    scheduler.options.resource_wait
                } else {
                    scheduler.options.backpressure_wait
                };
                wait = Some(wait.map_or(idle, |w| w.min(idle)));
            }

            let cancel = scheduler.cancel.clone();
            let cancelling = self.cancelling;
            let woke = tokio::select! {
                completion = self.rx.recv() => completion,
                _ = sleep_for(wait) => None,
                _ = cancel.cancelled(), if !cancelling => None,
            };
            if let Some(completion) = woke {
                self.complete(completion)?;
            }
        }

        let outcome = if self.cancelling {
            RunOutcome::Cancelled
        } else if self.fail_fast_triggered {
            RunOutcome::FailFast
        } else {
            RunOutcome::Completed
        };
        let summary = self.aggregator.summary(outcome);
        self.report(TaskEvent::RunFinished {
            total: summary.total,
            passed: summary.passed,
            failed: summary.failed,
            skipped: summary.skipped,
            duration: summary.duration(),
        });
        info!(
            passed = summary.passed,
            failed = summary.failed,
            skipped = summary.skipped,
            outcome = %outcome,
            "run finished"
        );
        Ok(summary)
    }

    /// Skip tasks that cannot run before the loop starts
    fn prepare(&mut self) -> Result<(), SchedulerError> {
        let order = self.dag.sorted().to_vec();
        for id in order {
            let Some(task) = self.dag.get(&id) else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }

            if task.runnable_command().is_none() {
                self.skip(&id, "no command configured".to_string())?;
                self.cascade(&id, "was skipped")?;
            } else if self.scheduler.options.skip_quarantined
                && self.scheduler.flaky.contains(id.as_str())
            {
                self.skip(&id, "quarantined as flaky".to_string())?;
                self.cascade(&id, "is quarantined")?;
            }
        }
        Ok(())
    }

    /// Ready tasks outside their retry delay, best first
    fn candidates(&self, now: Instant) -> Vec<TaskId> {
        if self.cancelling || self.fail_fast_triggered {
            return Vec::new();
        }
        let mut ready: Vec<_> = self
            .dag
            .ready_set()
            .into_iter()
            .filter(|t| self.retry_at.get(&t.id).map_or(true, |due| *due <= now))
            .collect();
        ready.sort_by_key(|t| (t.priority, Reverse(t.estimated_duration), t.id.clone()));
        ready.into_iter().map(|t| t.id.clone()).collect()
    }

    fn next_retry_due(&self) -> Option<Instant> {
        self.retry_at.values().min().copied()
    }

    fn throttled(&mut self, decision: &Admission) {
        let reason = decision.to_string();
        if self.last_throttle.as_deref() != Some(reason.as_str()) {
            debug!(reason = %reason, "admission refused");
            self.report(TaskEvent::Throttled {
                reason: reason.clone(),
            });
            self.last_throttle = Some(reason);
        }
    }

    /// Mark a task running and hand it to a worker
    fn dispatch(&mut self, id: &TaskId) -> Result<(), SchedulerError> {
        let scheduler = self.scheduler;
        let options = &scheduler.options;
        let task = self
            .dag
            .get_mut(id)
            .ok_or_else(|| SchedulerError::UnknownTask(id.clone()))?;
        task.start(Utc::now())?;

        let mut env = options.env.clone();
        env.extend(task.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        let working_dir = match &task.working_dir {
            Some(dir) => options.root_dir.join(dir),
            None => options.root_dir.clone(),
        };
        let request = ExecutionRequest {
            id: id.clone(),
            command: task.runnable_command().unwrap_or_default().to_string(),
            env,
            working_dir,
            timeout: task.timeout,
            attempt: task.attempts,
        };

        info!(task = %id, attempt = request.attempt, "dispatching task");
        self.report(TaskEvent::Started {
            id: id.clone(),
            attempt: request.attempt,
            command: request.command.clone(),
        });
        self.running.insert(id.clone());
        self.retry_at.remove(id);

        let executor = Arc::clone(&scheduler.executor);
        let cancel = self.workers_cancel.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let id = request.id.clone();
            let started_at = Utc::now();
            let outcome =
                match tokio::spawn(async move { executor.execute(request, cancel).await }).await {
                    Ok(outcome) => outcome,
                    Err(e) => ExecutionOutcome::from_error(
                        &ExecutionError::Panicked(e.to_string()),
                        started_at,
                    ),
                };
            if tx.send(Completion { id, outcome }).await.is_err() {
                debug!("coordinator gone, dropping completion");
            }
        });
        Ok(())
    }

    /// Apply the retry and quarantine policy to a finished attempt
    fn complete(&mut self, completion: Completion) -> Result<(), SchedulerError> {
        let Completion { id, outcome } = completion;
        self.running.remove(&id);

        let retry_delay = self.scheduler.options.retry_delay;
        let cancelled = self.scheduler.cancel.is_cancelled();
        let duration = outcome.duration;
        let task = self
            .dag
            .get_mut(&id)
            .ok_or_else(|| SchedulerError::UnknownTask(id.clone()))?;
        task.finish(outcome)?;
        let status = task.status;
        let attempt = task.attempts;

        if status == TaskStatus::Passed {
            info!(task = %id, attempt, duration_ms = duration.as_millis() as u64, "task passed");
            self.aggregator.record(task);
            self.report(TaskEvent::Completed {
                id,
                attempt,
                duration,
            });
            return Ok(());
        }

        let retries_left = task.can_retry();
        if retries_left && !cancelled && !self.fail_fast_triggered {
            let error = task.error.clone();
            let max_retries = task.max_retries;
            task.reset_for_retry()?;
            self.retry_at.insert(id.clone(), Instant::now() + retry_delay);
            warn!(task = %id, %status, attempt, max_retries, "task failed, will retry");
            self.report(TaskEvent::Retrying {
                id,
                status,
                attempt,
                max_retries,
                delay: retry_delay,
                error,
            });
            return Ok(());
        }

        // Final failure; only a spent retry budget means flaky
        let quarantine = !retries_left && !cancelled;
        task.quarantined = quarantine;
        let error = task
            .error
            .clone()
            .unwrap_or_else(|| format!("task {}", status));
        self.aggregator.record(task);
        warn!(task = %id, %status, attempt, "task failed for good");
        self.report(TaskEvent::Failed {
            id: id.clone(),
            status,
            duration,
            error,
        });

        if quarantine {
            if self.scheduler.flaky.mark(&id) {
                let store = self.scheduler.flaky.clone();
                let task_id = id.clone();
                self.pending_writes.push(tokio::task::spawn_blocking(move || {
                    if let Err(e) = store.flush() {
                        warn!(task = %task_id, error = %e, "failed to record task in flaky store");
                    }
                }));
            }
            self.report(TaskEvent::Quarantined { id: id.clone() });
        }

        self.cascade(&id, &format!("ended {}", status))?;

        if self.scheduler.options.fail_fast && !self.fail_fast_triggered && !cancelled {
            self.fail_fast_triggered = true;
            warn!(task = %id, "fail-fast triggered, skipping pending tasks");
            self.skip_all_pending(&format!("fail-fast after '{}' failed", id))?;
        }
        Ok(())
    }

    /// Skip the pending dependents of a task that will never pass
    fn cascade(&mut self, id: &TaskId, what: &str) -> Result<(), SchedulerError> {
        if !self.scheduler.options.cascade_skips {
            return Ok(());
        }
        for dependent in self.dag.dependents_of(id) {
            self.skip(&dependent, format!("dependency '{}' {}", id, what))?;
        }
        Ok(())
    }

    fn begin_cancel(&mut self) -> Result<(), SchedulerError> {
        self.cancelling = true;
        warn!(running = self.running.len(), "run cancelled");
        self.skip_all_pending("run cancelled")
    }

    fn skip_all_pending(&mut self, reason: &str) -> Result<(), SchedulerError> {
        for id in self.dag.stuck_tasks() {
            self.skip(&id, reason.to_string())?;
        }
        Ok(())
    }

    /// `PENDING → SKIPPED`; tasks in any other state are left alone
    fn skip(&mut self, id: &TaskId, reason: String) -> Result<(), SchedulerError> {
        let Some(task) = self.dag.get_mut(id) else {
            return Err(SchedulerError::UnknownTask(id.clone()));
        };
        if task.status != TaskStatus::Pending {
            return Ok(());
        }
        task.skip(reason.clone())?;
        self.retry_at.remove(id);
        self.aggregator.record(task);
        debug!(task = %id, reason = %reason, "task skipped");
        self.report(TaskEvent::Skipped {
            id: id.clone(),
            reason,
        });
        Ok(())
    }
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}
