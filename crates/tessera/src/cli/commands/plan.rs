//! Plan command

use std::path::PathBuf;

use clap::Args;
use tracing::info;

use tessera_core::config::load_config_or_default;
use tessera_tasks::TaskDag;

use super::task_file::load_task_dag;
use crate::cli::{output, Cli, OutputFormat};

/// Validate a task list and show its execution waves
#[derive(Debug, Args)]
pub struct PlanCommand {
    /// Task list file (JSON or YAML)
    #[arg(short, long)]
    pub tasks: PathBuf,
}

impl PlanCommand {
    /// Execute the plan command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        info!(tasks = %self.tasks.display(), "executing plan command");
        let cwd = std::env::current_dir()?;
        let (config, _) = load_config_or_default(&cwd)?;
        let dag = load_task_dag(&self.tasks, &config.scheduler, None, None)?;
        print_plan(&dag, cli)
    }
}

/// Print the execution waves of a validated graph
pub(crate) fn print_plan(dag: &TaskDag, cli: &Cli) -> anyhow::Result<()> {
    if cli.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&plan_json(dag))?);
        return Ok(());
    }
    if cli.quiet {
        return Ok(());
    }

    output::info(&format!(
        "{} in {}",
        output::plural(dag.len(), "task"),
        output::plural(dag.waves().len(), "wave")
    ));
    println!();
    print!("{}", dag.execution_plan());
    Ok(())
}

fn plan_json(dag: &TaskDag) -> serde_json::Value {
    let waves: Vec<serde_json::Value> = dag
        .waves()
        .iter()
        .enumerate()
        .map(|(i, wave)| {
            let tasks: Vec<serde_json::Value> = wave
                .iter()
                .filter_map(|id| dag.get(id))
                .map(|task| {
                    serde_json::json!({
                        "id": task.id,
                        "command": task.runnable_command(),
                        "dependencies": task.dependencies,
                        "priority": task.priority,
                    })
                })
                .collect();
            serde_json::json!({ "wave": i, "tasks": tasks })
        })
        .collect();

    serde_json::json!({
        "total": dag.len(),
        "waves": waves,
    })
}
