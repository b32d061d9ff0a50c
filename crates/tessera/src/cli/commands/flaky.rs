//! Flaky quarantine management command

use std::path::PathBuf;

use clap::{Args, Subcommand};
use console::style;
use tracing::info;

use tessera_core::config::load_config_or_default;
use tessera_tasks::FlakyStore;

use crate::cli::{output, Cli, OutputFormat};

/// Flaky task quarantine management
#[derive(Debug, Args)]
pub struct FlakyCommand {
    /// Store file (defaults to the configured flaky store)
    #[arg(long, global = true)]
    pub file: Option<PathBuf>,

    #[command(subcommand)]
    pub action: FlakyAction,
}

/// Flaky subcommands
#[derive(Debug, Subcommand)]
pub enum FlakyAction {
    /// List quarantined tasks
    List,
    /// Release a task from quarantine
    Remove(FlakyRemoveCommand),
    /// Release every quarantined task
    Clear(FlakyClearCommand),
}

/// Release a task from quarantine
#[derive(Debug, Args)]
pub struct FlakyRemoveCommand {
    /// Task id
    pub id: String,
}

/// Release every quarantined task
#[derive(Debug, Args)]
pub struct FlakyClearCommand {
    /// Skip confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

impl FlakyCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let store = self.open_store()?;
        match &self.action {
            FlakyAction::List => list(&store, cli),
            FlakyAction::Remove(cmd) => cmd.execute(&store, cli),
            FlakyAction::Clear(cmd) => cmd.execute(&store, cli),
        }
    }

    fn open_store(&self) -> anyhow::Result<FlakyStore> {
        let path = match &self.file {
            Some(path) => path.clone(),
            None => {
                let cwd = std::env::current_dir()?;
                let (config, _) = load_config_or_default(&cwd)?;
                config.flaky.resolve_path(&cwd)
            }
        };
        info!(path = %path.display(), "opening flaky store");
        Ok(FlakyStore::open(path)?)
    }
}

fn list(store: &FlakyStore, cli: &Cli) -> anyhow::Result<()> {
    let tests = store.list();

    if cli.format == OutputFormat::Json {
        let json = serde_json::json!({
            "path": store.path(),
            "tests": tests,
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    if tests.is_empty() {
        if !cli.quiet {
            output::success("No tasks are quarantined.");
        }
        return Ok(());
    }

    println!(
        "{} ({})",
        output::header("Quarantined tasks"),
        output::plural(tests.len(), "task")
    );
    for id in &tests {
        println!("  {} {}", style("○").yellow(), id);
    }
    Ok(())
}

impl FlakyRemoveCommand {
    fn execute(&self, store: &FlakyStore, cli: &Cli) -> anyhow::Result<()> {
        let removed = store.remove(&self.id)?;

        if cli.format == OutputFormat::Json {
            let json = serde_json::json!({ "id": self.id, "removed": removed });
            println!("{}", serde_json::to_string_pretty(&json)?);
        } else if !cli.quiet {
            if removed {
                output::success(&format!("Released {} from quarantine", style(&self.id).bold()));
            } else {
                output::warning(&format!("{} is not quarantined", style(&self.id).bold()));
            }
        }
        Ok(())
    }
}

impl FlakyClearCommand {
    fn execute(&self, store: &FlakyStore, cli: &Cli) -> anyhow::Result<()> {
        if store.is_empty() {
            if !cli.quiet && cli.format == OutputFormat::Text {
                output::success("No tasks are quarantined.");
            }
            return Ok(());
        }

        if !self.yes {
            let confirmed = dialoguer::Confirm::new()
                .with_prompt(format!(
                    "Release all {} from quarantine?",
                    output::plural(store.len(), "task")
                ))
                .default(false)
                .interact()?;

            if !confirmed {
                println!("{}", style("Aborted.").yellow());
                return Ok(());
            }
        }

        let removed = store.clear()?;

        if cli.format == OutputFormat::Json {
            println!("{}", serde_json::json!({ "removed": removed }));
        } else if !cli.quiet {
            output::success(&format!(
                "Released {} from quarantine",
                output::plural(removed, "task")
            ));
        }
        Ok(())
    }
}
