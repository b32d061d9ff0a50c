//! Init command

use std::path::PathBuf;

use clap::Args;
use console::style;
use dialoguer::Confirm;
use tracing::info;

use tessera_core::config::defaults::{
    default_config_toml, DEFAULT_CONFIG_TEMPLATE, DEFAULT_CONFIG_TOML,
};

use crate::cli::{output, Cli};

/// Write a starter configuration file
#[derive(Debug, Args)]
pub struct InitCommand {
    /// Force overwrite existing configuration
    #[arg(short, long)]
    pub force: bool,

    /// Never prompt
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Write every setting, not just the common ones
    #[arg(long)]
    pub full: bool,

    /// Output file path
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl InitCommand {
    /// Execute the init command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        info!(force = self.force, full = self.full, "executing init command");
        let cwd = std::env::current_dir()?;
        let config_path = self
            .output
            .clone()
            .unwrap_or_else(|| cwd.join(DEFAULT_CONFIG_TOML));

        if config_path.exists() && !self.force {
            if self.yes {
                anyhow::bail!(
                    "Configuration file already exists at {}. Use --force to overwrite.",
                    config_path.display()
                );
            }

            let overwrite = Confirm::new()
                .with_prompt(format!(
                    "Configuration file already exists at {}. Overwrite?",
                    config_path.display()
                ))
                .default(false)
                .interact()?;

            if !overwrite {
                println!("{}", style("Aborted.").yellow());
                return Ok(());
            }
        }

        let content = if self.full {
            default_config_toml()
        } else {
            DEFAULT_CONFIG_TEMPLATE.to_string()
        };
        std::fs::write(&config_path, content)?;

        if !cli.quiet {
            output::success(&format!(
                "Created configuration at {}",
                output::path_style().apply_to(config_path.display())
            ));
            println!();
            println!("Next steps:");
            println!("  1. Edit {} to set parallelism and thresholds", config_path.display());
            println!(
                "  2. Run {} to check your task list",
                style("tessera plan --tasks <file>").cyan()
            );
            println!(
                "  3. Run {} to execute it",
                style("tessera run --tasks <file>").cyan()
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;
    use tessera_core::config::load_config;

    fn init(args: &[&str]) -> (Cli, InitCommand) {
        let mut argv = vec!["tessera", "-q", "init"];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv.clone()).unwrap();
        let cmd = match Cli::try_parse_from(argv).unwrap().command {
            crate::cli::Commands::Init(cmd) => cmd,
            other => panic!("unexpected command {:?}", other),
        };
        (cli, cmd)
    }

    #[test]
    fn test_writes_loadable_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tessera.toml");
        let path_arg = path.to_string_lossy().to_string();

        let (cli, cmd) = init(&["-y", "--full", "--output", &path_arg]);
        cmd.execute(&cli).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.scheduler.max_parallel, 4);
    }

    #[test]
    fn test_refuses_to_overwrite_without_force() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tessera.toml");
        std::fs::write(&path, "[scheduler]\nmax_parallel = 9\n").unwrap();
        let path_arg = path.to_string_lossy().to_string();

        let (cli, cmd) = init(&["-y", "--output", &path_arg]);
        assert!(cmd.execute(&cli).is_err());

        let (cli, cmd) = init(&["-y", "--force", "--output", &path_arg]);
        cmd.execute(&cli).unwrap();
        assert_eq!(load_config(&path).unwrap().scheduler.max_parallel, 4);
    }
}
