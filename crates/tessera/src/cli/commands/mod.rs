//! CLI commands

mod completions;
mod flaky;
mod init;
mod plan;
mod run;
mod task_file;

pub use completions::CompletionsCommand;
pub use flaky::FlakyCommand;
pub use init::InitCommand;
pub use plan::PlanCommand;
pub use run::{RunCommand, RunFailure};
pub use task_file::TaskFileError;
