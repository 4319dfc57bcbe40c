//! Typed error hierarchy for devdock.
//!
//! Top-level enums per subsystem:
//! - `ExecError`: spawning and supervising external CLIs
//! - `StatusError`: deriving project state from `docker compose ps`
//! - `TemplateError`: stub rendering with the closed slot schema
//! - `PortError`: port allocation
//! - `DashboardError`: everything surfaced through the HTTP API

use thiserror::Error;

/// Errors from running an external command.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Command not found: {0}")]
    NotFound(String),

    #[error("Command timed out after {0}s")]
    Timeout(u64),

    #[error("Command was cancelled")]
    Cancelled,

    #[error("Command exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from probing a project's containers.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Docker is not available: {0}")]
    DockerUnavailable(String),

    #[error("No compose file in {0}")]
    ComposeFileMissing(std::path::PathBuf),

    #[error("Could not parse compose output: {0}")]
    Parse(String),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Errors from rendering stub files.
#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("Unknown placeholder {{{{{0}}}}}")]
    UnknownSlot(String),

    #[error("No value supplied for placeholder {{{{{0}}}}}")]
    MissingValue(String),

    #[error("Unterminated placeholder at byte {0}")]
    Unterminated(usize),
}

/// Errors from the port allocator.
#[derive(Debug, Error, PartialEq)]
pub enum PortError {
    #[error("Port {port} requested for {service} is already used by {owner}")]
    InUse {
        port: u16,
        service: String,
        owner: String,
    },

    #[error("Port {port} requested for both {first} and {second}")]
    Duplicate {
        port: u16,
        first: String,
        second: String,
    },

    #[error("No free port available for {0}")]
    Exhausted(String),

    #[error("Unknown service '{0}'")]
    UnknownService(String),
}

/// Errors surfaced through the dashboard API.
#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("Project '{0}' not found")]
    ProjectNotFound(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Permission denied: {message}")]
    Permission {
        message: String,
        instructions: Option<String>,
    },

    #[error("External tool failed: {0}")]
    ExternalTool(String),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type DashboardResult<T> = Result<T, DashboardError>;
