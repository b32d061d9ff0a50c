//! Run command - execute a task list

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use console::style;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tessera_core::config::{load_config_or_default, validate_config};
use tessera_core::Config;
use tessera_tasks::{
    FlakyStore, RunOutcome, RunSummary, SchedulerOptions, ShellExecutor, TaskEvent, TaskReporter,
    TaskReporterRegistry, TaskScheduler,
};

use super::plan::print_plan;
use super::task_file::load_task_dag;
use crate::cli::{output, Cli, OutputFormat};

/// Run a task list
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Task list file (JSON or YAML)
    #[arg(short, long)]
    pub tasks: PathBuf,

    /// Maximum concurrent tasks
    #[arg(short = 'j', long)]
    pub parallel: Option<usize>,

    /// Default per-task timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Default retries per task
    #[arg(long)]
    pub retry: Option<u32>,

    /// Stop starting new tasks after the first failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Skip tasks that are quarantined as flaky
    #[arg(long)]
    pub skip_flaky: bool,

    /// Do not read or write the flaky store
    #[arg(long, conflicts_with = "skip_flaky")]
    pub no_flaky_store: bool,

    /// Show execution plan without running
    #[arg(long)]
    pub dry_run: bool,
}

/// A run that finished without every task passing
#[derive(Debug, thiserror::Error)]
pub enum RunFailure {
    #[error("{failed} of {total} tasks failed")]
    TasksFailed { failed: usize, total: usize },

    #[error("Run cancelled")]
    Cancelled,
}

impl RunCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        info!(tasks = %self.tasks.display(), dry_run = self.dry_run, "executing run command");
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.execute_async(cli))
    }

    async fn execute_async(&self, cli: &Cli) -> anyhow::Result<()> {
        let cwd = std::env::current_dir()?;
        let (mut config, config_path) = load_config_or_default(&cwd)?;
        if let Some(path) = &config_path {
            info!(path = %path.display(), "using configuration");
        }
        self.apply_overrides(&mut config);
        validate_config(&config)?;

        let mut dag = load_task_dag(
            &self.tasks,
            &config.scheduler,
            self.timeout.map(Duration::from_secs),
            self.retry,
        )?;

        if self.dry_run {
            print_plan(&dag, cli)?;
            if cli.is_text() {
                println!();
                println!("{}", style("[DRY RUN - no tasks will be executed]").yellow().bold());
            }
            return Ok(());
        }

        let flaky = open_flaky_store(&config, &cwd);

        let mut registry = TaskReporterRegistry::new();
        if cli.is_text() {
            registry.register(ConsoleReporter::new(cli.verbose));
        }
        let reporter: Arc<dyn TaskReporter> = Arc::new(registry);

        let executor =
            ShellExecutor::new(config.scheduler.kill_grace()).with_reporter(reporter.clone());
        let options = SchedulerOptions::from_config(&config.scheduler, &cwd);

        let cancel = CancellationToken::new();
        let interrupt = spawn_interrupt_handler(cancel.clone(), cli.is_text());

        let scheduler = TaskScheduler::new(options, Arc::new(executor), reporter)
            .with_flaky_store(flaky)
            .with_cancellation(cancel);
        let result = scheduler.run(&mut dag).await;
        interrupt.abort();
        let summary = result?;

        match cli.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
            OutputFormat::Text if !cli.quiet => print_summary(&summary, scheduler.flaky_store()),
            OutputFormat::Text => {}
        }

        check_outcome(&summary)
    }

    fn apply_overrides(&self, config: &mut Config) {
        let scheduler = &mut config.scheduler;
        if let Some(parallel) = self.parallel {
            scheduler.max_parallel = parallel;
        }
        if self.fail_fast {
            scheduler.fail_fast = true;
        }
        if self.skip_flaky {
            scheduler.skip_quarantined = true;
            config.flaky.enabled = true;
        }
        if self.no_flaky_store {
            config.flaky.enabled = false;
            scheduler.skip_quarantined = false;
        }
    }
}

/// Open the configured flaky store, falling back to an in-memory one
fn open_flaky_store(config: &Config, cwd: &std::path::Path) -> FlakyStore {
    if !config.flaky.enabled {
        return FlakyStore::in_memory();
    }
    let path = config.flaky.resolve_path(cwd);
    match FlakyStore::open(&path) {
        Ok(store) => store,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "flaky store unreadable, quarantine will not persist");
            output::warning(&format!(
                "Could not open flaky store at {}: {}",
                path.display(),
                e
            ));
            FlakyStore::in_memory()
        }
    }
}

/// Cancel the run on Ctrl-C
fn spawn_interrupt_handler(cancel: CancellationToken, announce: bool) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            if announce {
                output::warning("Interrupted, stopping running tasks...");
            }
            cancel.cancel();
        }
    })
}

fn check_outcome(summary: &RunSummary) -> anyhow::Result<()> {
    if summary.outcome == RunOutcome::Cancelled {
        return Err(RunFailure::Cancelled.into());
    }
    if !summary.is_success() {
        return Err(RunFailure::TasksFailed {
            failed: summary.failed,
            total: summary.total,
        }
        .into());
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, flaky: &FlakyStore) {
    let failures: Vec<_> = summary.failures().collect();
    if !failures.is_empty() {
        println!();
        println!("{}", output::header("Failures:"));
        for record in failures {
            println!(
                "  {} {} {} {}",
                style("✗").red(),
                output::task_style().apply_to(&record.id),
                style(format!("[{}]", record.status)).red(),
                style(record.error.as_deref().unwrap_or("")).dim()
            );
        }
    }

    if !summary.quarantined.is_empty() {
        println!();
        println!("{}", output::header("Quarantined as flaky:"));
        for id in &summary.quarantined {
            println!("  {} {}", style("○").yellow(), id);
        }
        if let Some(path) = flaky.path() {
            println!(
                "  {}",
                style(format!(
                    "(recorded in {}, release with `tessera flaky remove <id>`)",
                    output::path_style().apply_to(path.display())
                ))
                .dim()
            );
        }
    }

    println!();
    println!(
        "{}",
        output::key_value("Success rate", &format!("{:.1}%", summary.success_rate * 100.0))
    );
    println!(
        "{}",
        output::key_value(
            "Wall clock",
            &format!(
                "{} (task time {})",
                output::seconds(summary.duration()),
                output::seconds(Duration::from_millis(summary.cumulative_task_ms))
            )
        )
    );
    if summary.outcome != RunOutcome::Completed {
        println!("{}", output::key_value("Outcome", &summary.outcome.to_string()));
    }
}

/// Console reporter with live progress
struct ConsoleReporter {
    verbose: bool,
}

impl ConsoleReporter {
    fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl TaskReporter for ConsoleReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::RunStarted {
                total,
                max_parallel,
            } => {
                println!(
                    "{} Running {} ({} at a time)",
                    style("→").blue(),
                    output::plural(*total, "task"),
                    max_parallel
                );
                println!();
            }
            TaskEvent::Started {
                id,
                attempt,
                command,
            } => {
                let retry = if *attempt > 1 {
                    style(format!(" (attempt {})", attempt)).yellow().to_string()
                } else {
                    String::new()
                };
                println!(
                    "  {} {}{} {}",
                    style("▸").dim(),
                    style(id).bold(),
                    retry,
                    if self.verbose {
                        style(format!("({})", command)).dim().to_string()
                    } else {
                        String::new()
                    }
                );
            }
            TaskEvent::Output { id, line, is_stderr } => {
                if self.verbose {
                    if *is_stderr {
                        println!("    {} {}", style(format!("[{}]", id)).red().dim(), line);
                    } else {
                        println!("    {} {}", style(format!("[{}]", id)).dim(), line);
                    }
                }
            }
            TaskEvent::Completed { id, duration, .. } => {
                println!(
                    "  {} {} {}",
                    style("✓").green(),
                    style(id).green(),
                    style(output::seconds(*duration)).dim()
                );
            }
            TaskEvent::Retrying {
                id,
                status,
                attempt,
                max_retries,
                delay,
                ..
            } => {
                println!(
                    "  {} {} {} {}",
                    style("↻").yellow(),
                    style(id).yellow(),
                    style(status).yellow(),
                    style(format!(
                        "(retry {}/{} in {})",
                        attempt,
                        max_retries,
                        output::seconds(*delay)
                    ))
                    .dim()
                );
            }
            TaskEvent::Failed {
                id,
                status,
                duration,
                error,
            } => {
                println!(
                    "  {} {} {} {} {}",
                    style("✗").red(),
                    style(id).red(),
                    style(status).red().bold(),
                    style(output::seconds(*duration)).dim(),
                    style(error).red().dim()
                );
            }
            TaskEvent::Quarantined { id } => {
                println!(
                    "  {} {} {}",
                    style("○").yellow(),
                    style(id).yellow(),
                    style("(quarantined as flaky)").dim()
                );
            }
            TaskEvent::Skipped { id, reason } => {
                println!(
                    "  {} {} {}",
                    style("○").yellow(),
                    style(id).yellow(),
                    style(format!("({})", reason)).dim()
                );
            }
            TaskEvent::Throttled { reason } => {
                if self.verbose {
                    println!("  {} {}", style("─").dim(), style(reason).dim());
                }
            }
            TaskEvent::RunFinished {
                total,
                passed,
                failed,
                skipped,
                duration,
            } => {
                println!();
                println!(
                    "  {} {}/{} passed, {} failed, {} skipped ({})",
                    if *failed == 0 {
                        style("✓").green().bold()
                    } else {
                        style("✗").red().bold()
                    },
                    passed,
                    total,
                    failed,
                    skipped,
                    output::seconds(*duration)
                );
            }
        }
    }
}
