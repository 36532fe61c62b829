// ABOUTME: Library root for the workspace project migrator
// ABOUTME: Exposes the migration core; the binary in main.rs is a thin shell around it

pub mod config;
pub mod credentials;
pub mod error;
pub mod metadata;
pub mod orchestrator;
pub mod ownership;
pub mod project;
pub mod remote;
pub mod report;
pub mod runtime;
pub mod store;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Configuration;
pub use error::{ApiError, MigratorError};
pub use orchestrator::{Collaborators, Orchestrator, RunFailure, RunState};
pub use report::{Direction, MigrationReport, RunStatus};
