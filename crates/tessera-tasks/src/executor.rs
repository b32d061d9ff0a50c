//! Execution engine: runs one admitted task's command with a timeout

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::reporter::{TaskEvent, TaskReporter};
use crate::task::{TaskId, TaskStatus};

/// How long output readers may keep draining after the process is gone
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything the engine needs to run one attempt of a task
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub id: TaskId,
    pub command: String,
    /// Variables added on top of the inherited process environment
    pub env: HashMap<String, String>,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    /// 1-based attempt number
    pub attempt: u32,
}

/// Result classification of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Passed,
    Failed,
    Timeout,
    Error,
}

impl From<ExecutionStatus> for TaskStatus {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Passed => TaskStatus::Passed,
            ExecutionStatus::Failed => TaskStatus::Failed,
            ExecutionStatus::Timeout => TaskStatus::Timeout,
            ExecutionStatus::Error => TaskStatus::Error,
        }
    }
}

/// Why an attempt could not produce an exit status
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to wait for command: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Timed out after {}s", .0.as_secs_f64())]
    TimedOut(Duration),

    #[error("Run was cancelled")]
    Cancelled,

    #[error("Worker panicked: {0}")]
    Panicked(String),
}

impl ExecutionError {
    /// Status an attempt ends in when it fails this way
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::TimedOut(_) => ExecutionStatus::Timeout,
            _ => ExecutionStatus::Error,
        }
    }
}

/// Observable result of one attempt
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    /// Combined stdout/stderr in arrival order
    pub output: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
}

impl ExecutionOutcome {
    /// Outcome finishing now with no output
    pub fn from_status(status: ExecutionStatus, started_at: DateTime<Utc>) -> Self {
        let finished_at = Utc::now();
        Self {
            status,
            exit_code: None,
            output: String::new(),
            error: None,
            started_at,
            finished_at,
            duration: (finished_at - started_at).to_std().unwrap_or_default(),
        }
    }

    /// Outcome of an attempt that ended without a usable exit status
    pub fn from_error(error: &ExecutionError, started_at: DateTime<Utc>) -> Self {
        let mut outcome = Self::from_status(error.status(), started_at);
        outcome.error = Some(error.to_string());
        outcome
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    fn from_exit(status: ExitStatus, started_at: DateTime<Utc>) -> Self {
        match status.code() {
            Some(0) => Self::from_status(ExecutionStatus::Passed, started_at).with_exit_code(0),
            Some(code) => {
                let mut outcome =
                    Self::from_status(ExecutionStatus::Failed, started_at).with_exit_code(code);
                outcome.error = Some(format!("Command exited with code {}", code));
                outcome
            }
            None => {
                let mut outcome = Self::from_status(ExecutionStatus::Failed, started_at);
                outcome.error = Some("Command terminated by signal".to_string());
                outcome
            }
        }
    }
}

/// Runs one attempt of a task.
///
/// Implementations must honour the request timeout and stop promptly when the
/// cancellation token fires, reporting `Error` in that case.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest, cancel: CancellationToken)
        -> ExecutionOutcome;
}

/// Executes commands through the platform shell
pub struct ShellExecutor {
    kill_grace: Duration,
    reporter: Option<Arc<dyn TaskReporter>>,
}

impl ShellExecutor {
    pub fn new(kill_grace: Duration) -> Self {
        Self {
            kill_grace,
            reporter: None,
        }
    }

    /// Stream output lines to a reporter as they arrive
    pub fn with_reporter(mut self, reporter: Arc<dyn TaskReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// SIGTERM the process group, then SIGKILL once the grace period runs out
    async fn terminate(&self, id: &TaskId, child: &mut Child, pid: Option<u32>) {
        if let Some(pid) = pid {
            if signal_group(pid, GroupSignal::Terminate) {
                if tokio::time::timeout(self.kill_grace, child.wait())
                    .await
                    .is_ok()
                {
                    debug!(task = %id, "process group exited after SIGTERM");
                    return;
                }
                warn!(task = %id, grace_ms = self.kill_grace.as_millis() as u64, "process ignored SIGTERM, killing");
                signal_group(pid, GroupSignal::Kill);
            }
        }

        if let Err(e) = child.kill().await {
            debug!(task = %id, error = %e, "kill after termination failed");
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

enum Exit {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    #[instrument(skip_all, fields(task = %request.id, attempt = request.attempt))]
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        let started_at = Utc::now();
        info!(command = %request.command, timeout_secs = request.timeout.as_secs(), "starting task process");

        let mut command = shell_command(&request.command);
        command
            .envs(&request.env)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let error = ExecutionError::Spawn(e);
                warn!(error = %error, "task process could not start");
                return ExecutionOutcome::from_error(&error, started_at);
            }
        };
        let pid = child.id();

        let output = Arc::new(Mutex::new(String::new()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(
                stdout,
                request.id.clone(),
                false,
                output.clone(),
                self.reporter.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(
                stderr,
                request.id.clone(),
                true,
                output.clone(),
                self.reporter.clone(),
            ));
        }

        let exit = tokio::select! {
            status = child.wait() => Exit::Exited(status),
            _ = tokio::time::sleep(request.timeout) => Exit::TimedOut,
            _ = cancel.cancelled() => Exit::Cancelled,
        };

        let outcome = match exit {
            Exit::Exited(Ok(status)) => ExecutionOutcome::from_exit(status, started_at),
            Exit::Exited(Err(e)) => ExecutionOutcome::from_error(&ExecutionError::Wait(e), started_at),
            Exit::TimedOut => {
                warn!(timeout_secs = request.timeout.as_secs_f64(), "task timed out, terminating");
                self.terminate(&request.id, &mut child, pid).await;
                ExecutionOutcome::from_error(&ExecutionError::TimedOut(request.timeout), started_at)
            }
            Exit::Cancelled => {
                info!("run cancelled, terminating task");
                self.terminate(&request.id, &mut child, pid).await;
                ExecutionOutcome::from_error(&ExecutionError::Cancelled, started_at)
            }
        };

        // Reap anything the command left behind in its group
        if let Some(pid) = pid {
            signal_group(pid, GroupSignal::Kill);
        }

        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
                abort.abort();
            }
        }

        let output = std::mem::take(&mut *output.lock().unwrap_or_else(PoisonError::into_inner));
        info!(
            status = ?outcome.status,
            exit_code = ?outcome.exit_code,
            duration_ms = outcome.duration.as_millis() as u64,
            "task process finished"
        );
        outcome.with_output(output)
    }
}

fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        c
    }
}

fn spawn_reader<R>(
    stream: R,
    id: TaskId,
    is_stderr: bool,
    sink: Arc<Mutex<String>>,
    reporter: Option<Arc<dyn TaskReporter>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let chunk = String::from_utf8_lossy(&buf);
                    sink.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push_str(&chunk);
                    if let Some(reporter) = &reporter {
                        reporter.report(&TaskEvent::Output {
                            id: id.clone(),
                            line: chunk.trim_end_matches(['\r', '\n']).to_string(),
                            is_stderr,
                        });
                    }
                }
                Err(e) => {
                    debug!(task = %id, error = %e, "output stream closed");
                    break;
                }
            }
        }
    })
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Send a signal to the whole process group led by `pid`
#[cfg(unix)]
fn signal_group(pid: u32, signal: GroupSignal) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    let signal = match signal {
        GroupSignal::Terminate => libc::SIGTERM,
        GroupSignal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe { libc::kill(-pgid, signal) == 0 }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: GroupSignal) -> bool {
    false
}

/// Executor that replays scripted results without spawning processes.
///
/// Each task id has a queue of statuses; the last status repeats once the
/// queue is down to one entry. Unscripted tasks pass.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<TaskId, VecDeque<ExecutionStatus>>>,
    delays: Mutex<HashMap<TaskId, Duration>>,
    default_delay: Duration,
    journal: Mutex<Journal>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

#[derive(Debug, Default)]
struct Journal {
    started: Vec<TaskId>,
    finished: Vec<TaskId>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated runtime of every attempt
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn with_script(
        self,
        id: impl Into<TaskId>,
        statuses: impl IntoIterator<Item = ExecutionStatus>,
    ) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), statuses.into_iter().collect());
        self
    }

    pub fn with_task_delay(self, id: impl Into<TaskId>, delay: Duration) -> Self {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), delay);
        self
    }

    /// Task ids in the order attempts started
    pub fn started(&self) -> Vec<TaskId> {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .started
            .clone()
    }

    /// Task ids in the order attempts finished
    pub fn finished(&self) -> Vec<TaskId> {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finished
            .clone()
    }

    /// Highest number of attempts observed in flight at once
    pub fn max_concurrency(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn next_status(&self, id: &TaskId) -> ExecutionStatus {
        let mut scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        match scripts.get_mut(id) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(ExecutionStatus::Passed),
            Some(queue) => queue.front().copied().unwrap_or(ExecutionStatus::Passed),
            None => ExecutionStatus::Passed,
        }
    }

    fn delay_for(&self, id: &TaskId) -> Duration {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
            .unwrap_or(self.default_delay)
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        let started_at = Utc::now();
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .started
            .push(request.id.clone());
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);

        let delay = self.delay_for(&request.id);
        let outcome = tokio::select! {
            _ = tokio::time::sleep(delay) => {
                let status = self.next_status(&request.id);
                let outcome = ExecutionOutcome::from_status(status, started_at)
                    .with_output(format!("{} attempt {}\n", request.id, request.attempt));
                match status {
                    ExecutionStatus::Passed => outcome.with_exit_code(0),
                    ExecutionStatus::Failed => outcome.with_exit_code(1),
                    _ => outcome,
                }
            }
            _ = cancel.cancelled() => ExecutionOutcome::from_error(&ExecutionError::Cancelled, started_at),
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finished
            .push(request.id);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::CollectingReporter;

    fn request(command: &str, timeout: Duration) -> ExecutionRequest {
        ExecutionRequest {
            id: TaskId::new("blog-unit"),
            command: command.to_string(),
            env: HashMap::new(),
            working_dir: std::env::temp_dir(),
            timeout,
            attempt: 1,
        }
    }

    #[test]
    fn test_execution_status_maps_to_task_status() {
        assert_eq!(TaskStatus::from(ExecutionStatus::Passed), TaskStatus::Passed);
        assert_eq!(TaskStatus::from(ExecutionStatus::Timeout), TaskStatus::Timeout);
        assert_eq!(TaskStatus::from(ExecutionStatus::Error), TaskStatus::Error);
    }

    #[test]
    fn test_error_outcome_status() {
        let outcome =
            ExecutionOutcome::from_error(&ExecutionError::TimedOut(Duration::from_secs(5)), Utc::now());
        assert_eq!(outcome.status, ExecutionStatus::Timeout);
        assert_eq!(outcome.error.as_deref(), Some("Timed out after 5s"));

        let outcome = ExecutionOutcome::from_error(&ExecutionError::Cancelled, Utc::now());
        assert_eq!(outcome.status, ExecutionStatus::Error);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_executor_passes() {
        let executor = ShellExecutor::default();
        let outcome = executor
            .execute(request("echo hello", Duration::from_secs(10)), CancellationToken::new())
            .await;
        assert_eq!(outcome.status, ExecutionStatus::Passed);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.output, "hello\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_executor_reports_exit_code() {
        let executor = ShellExecutor::default();
        let outcome = executor
            .execute(
                request("echo oops >&2; exit 3", Duration::from_secs(10)),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(outcome.exit_code, Some(3));
        assert!(outcome.output.contains("oops"));
        assert_eq!(outcome.error.as_deref(), Some("Command exited with code 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_executor_passes_env_and_working_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut req = request("echo \"$SUITE\" && pwd", Duration::from_secs(10));
        req.env.insert("SUITE".to_string(), "integration".to_string());
        req.working_dir = dir.path().to_path_buf();

        let outcome = ShellExecutor::default()
            .execute(req, CancellationToken::new())
            .await;
        assert_eq!(outcome.status, ExecutionStatus::Passed);
        let canonical = dir.path().canonicalize().unwrap();
        assert!(outcome.output.starts_with("integration\n"));
        assert!(outcome.output.contains(canonical.to_str().unwrap()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_executor_streams_output_events() {
        let reporter = Arc::new(CollectingReporter::default());
        let executor = ShellExecutor::default().with_reporter(reporter.clone());
        executor
            .execute(request("echo one; echo two", Duration::from_secs(10)), CancellationToken::new())
            .await;

        let lines: Vec<String> = reporter
            .events()
            .into_iter()
            .filter_map(|e| match e {
                TaskEvent::Output { line, .. } => Some(line),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn test_shell_executor_spawn_failure_is_error() {
        let mut req = request("true", Duration::from_secs(10));
        req.working_dir = PathBuf::from("/definitely/not/a/real/dir");
        let outcome = ShellExecutor::default()
            .execute(req, CancellationToken::new())
            .await;
        assert_eq!(outcome.status, ExecutionStatus::Error);
        assert!(outcome.error.unwrap().starts_with("Failed to spawn command"));
    }

    /// Live and not a zombie waiting to be reaped
    #[cfg(target_os = "linux")]
    fn process_alive(pid: libc::pid_t) -> bool {
        if unsafe { libc::kill(pid, 0) } != 0 {
            return false;
        }
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => !stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_shell_executor_timeout_kills_process_group() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("pid");
        let command = format!("sleep 60 & echo $! > {}; wait", pid_file.display());

        let executor = ShellExecutor::new(Duration::from_millis(200));
        let outcome = executor
            .execute(request(&command, Duration::from_millis(500)), CancellationToken::new())
            .await;

        assert_eq!(outcome.status, ExecutionStatus::Timeout);
        assert!(outcome.duration < Duration::from_secs(10));

        let pid: libc::pid_t = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            !process_alive(pid),
            "background child {} survived the timeout",
            pid
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_executor_cancellation_is_error() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let outcome = ShellExecutor::new(Duration::from_millis(200))
            .execute(request("sleep 30", Duration::from_secs(60)), cancel)
            .await;
        assert_eq!(outcome.status, ExecutionStatus::Error);
        assert_eq!(outcome.error.as_deref(), Some("Run was cancelled"));
    }

    #[tokio::test]
    async fn test_scripted_executor_replays_statuses() {
        let executor = ScriptedExecutor::new().with_script(
            "blog-e2e",
            [ExecutionStatus::Failed, ExecutionStatus::Passed],
        );
        let mut req = request("ignored", Duration::from_secs(1));
        req.id = TaskId::new("blog-e2e");

        let first = executor.execute(req.clone(), CancellationToken::new()).await;
        let second = executor.execute(req.clone(), CancellationToken::new()).await;
        let third = executor.execute(req, CancellationToken::new()).await;
        assert_eq!(first.status, ExecutionStatus::Failed);
        assert_eq!(second.status, ExecutionStatus::Passed);
        assert_eq!(third.status, ExecutionStatus::Passed);
        assert_eq!(executor.started().len(), 3);
        assert_eq!(executor.max_concurrency(), 1);
    }
}
