//! Task list loading shared by `run` and `plan`

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, instrument};

use tessera_core::SchedulerConfig;
use tessera_tasks::{TaskDag, TaskSpec};

/// Errors reading a task list
#[derive(Debug, thiserror::Error)]
pub enum TaskFileError {
    #[error("Task file not found: {0}")]
    NotFound(PathBuf),

    #[error("Could not read task file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in task file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid YAML in task file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Read task specs from a JSON (`.json`) or YAML file.
///
/// The document is either a list of tasks or a mapping with a `tasks` list.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_task_specs(path: &Path) -> Result<Vec<TaskSpec>, TaskFileError> {
    if !path.exists() {
        return Err(TaskFileError::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path).map_err(|source| TaskFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let is_json = path.extension().is_some_and(|e| e.eq_ignore_ascii_case("json"));
    let specs = if is_json {
        parse_json(&content).map_err(|source| TaskFileError::Json {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        parse_yaml(&content).map_err(|source| TaskFileError::Yaml {
            path: path.to_path_buf(),
            source,
        })?
    };

    debug!(count = specs.len(), "loaded task specs");
    Ok(specs)
}

fn parse_json(content: &str) -> Result<Vec<TaskSpec>, serde_json::Error> {
    let mut value: serde_json::Value = serde_json::from_str(content)?;
    if let Some(tasks) = value.get_mut("tasks") {
        value = tasks.take();
    }
    serde_json::from_value(value)
}

fn parse_yaml(content: &str) -> Result<Vec<TaskSpec>, serde_yaml::Error> {
    let value: serde_yaml::Value = serde_yaml::from_str(content)?;
    let value = match value.get("tasks") {
        Some(tasks) => tasks.clone(),
        None => value,
    };
    if value.is_null() {
        return Ok(Vec::new());
    }
    serde_yaml::from_value(value)
}

/// Load a task list and build its validated graph.
///
/// Tasks without their own timeout or retry budget take `timeout` / `retries`,
/// falling back to the scheduler configuration.
pub fn load_task_dag(
    path: &Path,
    config: &SchedulerConfig,
    timeout: Option<Duration>,
    retries: Option<u32>,
) -> anyhow::Result<TaskDag> {
    let specs = load_task_specs(path)?;
    let timeout = timeout.unwrap_or_else(|| config.default_timeout());
    let retries = retries.unwrap_or(config.default_max_retries);

    let tasks = specs.into_iter().map(|spec| spec.into_task(timeout, retries));
    TaskDag::build(tasks).with_context(|| format!("Invalid task graph in {}", path.display()))
}
