use std::collections::BTreeMap;

use kiln_process::{InstallRecipe, ServerStatus};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::command_line;
use crate::file_sandbox::{FileSandbox, SandboxError, normalize_server_id};
use crate::registry::{ExitInfo, Registry};

const SCRIPT_PATH: &str = ".kiln/install.sh";
const DEFAULT_ENTRYPOINT: &str = "sh";

#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("server {server_id} is {status}; stop it before installing")]
    ServerActive {
        server_id: String,
        status: ServerStatus,
    },

    #[error("an install for server {0} is already running")]
    InProgress(String),

    #[error("install entrypoint for server {0} is empty")]
    EmptyEntrypoint(String),

    #[error("failed to write install script for server {server_id}: {source}")]
    Io {
        server_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run install entrypoint {program} for server {server_id}: {source}")]
    Spawn {
        server_id: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("install script for server {server_id} failed ({exit})")]
    ScriptFailed { server_id: String, exit: ExitInfo },
}

impl InstallError {
    pub fn code(&self) -> &'static str {
        match self {
            InstallError::Sandbox(e) => e.code(),
            InstallError::ServerActive { .. } => "server_active",
            InstallError::InProgress(_) => "install_in_progress",
            InstallError::EmptyEntrypoint(_) => "invalid_recipe",
            InstallError::Io { .. } => "install_io",
            InstallError::Spawn { .. } => "install_spawn_failed",
            InstallError::ScriptFailed { .. } => "install_failed",
        }
    }
}

async fn forward_lines<R>(reader: R, on_progress: &(impl Fn(&str) + Sync))
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\n', '\r']);
                if !line.is_empty() {
                    on_progress(line);
                }
            }
        }
    }
}

/// Runs install recipes as shell scripts inside the server root.
#[derive(Debug, Clone)]
pub struct Installer {
    registry: Registry,
    sandbox: FileSandbox,
}

impl Installer {
    pub fn new(registry: Registry, sandbox: FileSandbox) -> Self {
        Self { registry, sandbox }
    }

    /// Writes the recipe to the server root and runs it to completion. Every
    /// non-empty output line is handed to `on_progress`. The server cannot be
    /// started until the install ends.
    pub async fn install(
        &self,
        server_id: &str,
        recipe: &InstallRecipe,
        variables: &BTreeMap<String, String>,
        on_progress: impl Fn(&str) + Sync,
    ) -> Result<ExitInfo, InstallError> {
        let server_id = normalize_server_id(server_id)?;
        let _claim = self.registry.begin_install(server_id).await?;

        let entrypoint = recipe
            .entrypoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .unwrap_or(DEFAULT_ENTRYPOINT);
        let argv = command_line::tokenize(entrypoint);
        let Some((program, args)) = argv.split_first() else {
            return Err(InstallError::EmptyEntrypoint(server_id.to_string()));
        };

        let root = self.sandbox.server_root(server_id)?;
        let script = self.sandbox.resolve(server_id, SCRIPT_PATH)?;
        let io_err = |source| InstallError::Io {
            server_id: server_id.to_string(),
            source,
        };
        if let Some(parent) = script.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(&script, recipe.script.as_bytes())
            .await
            .map_err(io_err)?;

        let env = command_line::build_environment(command_line::agent_environment(), variables, &root);
        tracing::info!(server_id, program = %program, script = %script.display(), "running install script");

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .arg(&script)
            .current_dir(&root)
            .env_clear()
            .envs(&env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| InstallError::Spawn {
                server_id: server_id.to_string(),
                program: program.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let progress = &on_progress;
        tokio::join!(
            async {
                if let Some(out) = stdout {
                    forward_lines(out, progress).await;
                }
            },
            async {
                if let Some(err) = stderr {
                    forward_lines(err, progress).await;
                }
            },
        );

        let status = child.wait().await.map_err(io_err)?;
        let exit = ExitInfo::from(status);
        if !status.success() {
            tracing::warn!(server_id, exit = %exit, "install script failed");
            return Err(InstallError::ScriptFailed {
                server_id: server_id.to_string(),
                exit,
            });
        }
        tracing::info!(server_id, "install finished");
        Ok(exit)
    }
}
