use kiln_process::ServerStatus;
use thiserror::Error;

use crate::file_sandbox::SandboxError;
use crate::installer::InstallError;

/// Operation-level failures of the lifecycle supervisor.
///
/// Process-level outcomes (crash, exit, forced kill on stop timeout) are not
/// errors; they surface as status transitions.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("server {server_id} is already {status}")]
    AlreadyRunning {
        server_id: String,
        status: ServerStatus,
    },

    #[error("server {0} is not running")]
    NotRunning(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("invocation for server {0} resolved to an empty command")]
    InvalidCommand(String),

    #[error("failed to prepare root for server {server_id}: {source}")]
    RootUnavailable {
        server_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn server {server_id} ({program}): {source}")]
    SpawnFailure {
        server_id: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("start of server {0} was cancelled by a concurrent stop or kill")]
    Cancelled(String),

    #[error("server {0} is being installed")]
    Installing(String),

    #[error("agent is shutting down; server {0} accepts no new requests")]
    ShuttingDown(String),
}

impl SupervisorError {
    /// Stable machine-readable code sent to the control plane.
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::AlreadyRunning { .. } => "already_running",
            SupervisorError::NotRunning(_) => "not_running",
            SupervisorError::Sandbox(e) => e.code(),
            SupervisorError::InvalidCommand(_) => "invalid_command",
            SupervisorError::RootUnavailable { .. } => "root_unavailable",
            SupervisorError::SpawnFailure { .. } => "spawn_failed",
            SupervisorError::Cancelled(_) => "cancelled",
            SupervisorError::Installing(_) => "install_in_progress",
            SupervisorError::ShuttingDown(_) => "shutting_down",
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            SupervisorError::AlreadyRunning { .. } => {
                Some("Stop or kill the server before starting it again.")
            }
            SupervisorError::SpawnFailure { .. } => {
                Some("Ensure the server binary is installed and the server root is writable.")
            }
            SupervisorError::InvalidCommand(_) => {
                Some("Check the startup command template and its variables.")
            }
            SupervisorError::Installing(_) => {
                Some("Wait for the install to finish before starting the server.")
            }
            _ => None,
        }
    }
}

/// Failure of one inbound control frame.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("power {action} for server {server_id} requires a runtime config")]
    MissingConfig {
        server_id: String,
        action: &'static str,
    },

    #[error("failed to {op} root of server {server_id}: {source}")]
    Io {
        server_id: String,
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Supervisor(e) => e.code(),
            DispatchError::Install(e) => e.code(),
            DispatchError::Sandbox(e) => e.code(),
            DispatchError::MissingConfig { .. } => "missing_config",
            DispatchError::Io { .. } => "io_error",
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            DispatchError::Supervisor(e) => e.hint(),
            DispatchError::Install(InstallError::ServerActive { .. }) => {
                Some("Stop the server before reinstalling it.")
            }
            DispatchError::MissingConfig { .. } => {
                Some("Send the server's runtime config with start and restart requests.")
            }
            _ => None,
        }
    }
}
