use std::{sync::Arc, time::Duration};

use kiln_process::{OutputStream, RuntimeConfig, ServerStatus};
use tokio::{
    io::AsyncWriteExt,
    process::{Child, Command},
    sync::{Mutex, watch},
};

use crate::command_line;
use crate::config::AgentConfig;
use crate::error::SupervisorError;
use crate::event_sink::EventSink;
use crate::file_sandbox::{FileSandbox, normalize_server_id};
use crate::mounts;
use crate::output_relay;
use crate::registry::{EntrySnapshot, ExitInfo, ProcessHandle, Registry, StartConfig, StopBegin};

const DEFAULT_STOP_COMMAND: &str = "stop";

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub settle_delay: Duration,
    pub stop_timeout: Duration,
    pub restart_delay: Duration,
}

impl From<&AgentConfig> for SupervisorSettings {
    fn from(cfg: &AgentConfig) -> Self {
        Self {
            settle_delay: cfg.settle_delay,
            stop_timeout: cfg.stop_timeout,
            restart_delay: cfg.restart_delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    /// True when the stop timeout elapsed and SIGKILL was sent.
    pub forced: bool,
    /// `None` when no process had been spawned yet.
    pub exit: Option<ExitInfo>,
}

fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the agent dies, the server goes with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// SIGKILL to the whole process group. Wrappers such as `sh -c` take their
/// children down with them.
#[cfg(unix)]
fn kill_group(pgid: Option<i32>) {
    if let Some(pgid) = pgid.filter(|p| *p > 0) {
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: Option<i32>) {}

async fn wait_exit(rx: &mut watch::Receiver<Option<ExitInfo>>) -> Option<ExitInfo> {
    match rx.wait_for(|v| v.is_some()).await {
        Ok(v) => *v,
        Err(_) => None,
    }
}

/// Owns every child process of the agent and drives the lifecycle state
/// machine over the shared [`Registry`].
#[derive(Clone, Debug)]
pub struct Supervisor {
    registry: Registry,
    sandbox: FileSandbox,
    events: EventSink,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(
        registry: Registry,
        sandbox: FileSandbox,
        events: EventSink,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            registry,
            sandbox,
            events,
            settings,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn sandbox(&self) -> &FileSandbox {
        &self.sandbox
    }

    pub async fn status(&self, server_id: &str) -> ServerStatus {
        self.registry.status(server_id).await
    }

    pub async fn list(&self) -> Vec<EntrySnapshot> {
        self.registry.snapshot().await
    }

    /// Starts a server and returns its pid once spawned. The server is
    /// reported STARTING and promoted to RUNNING by the settle timer.
    pub async fn start(
        &self,
        server_id: &str,
        runtime: &RuntimeConfig,
    ) -> Result<Option<u32>, SupervisorError> {
        let server_id = normalize_server_id(server_id)?;
        let epoch = self.registry.reserve(server_id).await?;

        match self.spawn_reserved(server_id, epoch, runtime).await {
            Ok(pid) => Ok(pid),
            Err(err) => {
                tracing::warn!(server_id, epoch, error = %err, "start failed");
                if self.registry.remove(server_id, Some(epoch)).await.is_some() {
                    self.events.status(server_id, ServerStatus::Offline);
                }
                self.events
                    .notice(server_id, format!("[kiln] start failed: {err}"));
                Err(err)
            }
        }
    }

    async fn spawn_reserved(
        &self,
        server_id: &str,
        epoch: u64,
        runtime: &RuntimeConfig,
    ) -> Result<Option<u32>, SupervisorError> {
        let root_dir = self.sandbox.server_root(server_id)?;
        tokio::fs::create_dir_all(&root_dir)
            .await
            .map_err(|source| SupervisorError::RootUnavailable {
                server_id: server_id.to_string(),
                source,
            })?;

        for warning in mounts::prepare_mounts(server_id, &root_dir, &runtime.mounts).await {
            self.events.notice(server_id, warning);
        }

        let resolved = command_line::resolve_template(
            &runtime.command,
            runtime.memory_mb,
            &runtime.variables,
            &runtime.allocation,
        );
        let argv = command_line::tokenize(&resolved);
        let Some((program, args)) = argv.split_first() else {
            return Err(SupervisorError::InvalidCommand(server_id.to_string()));
        };
        let env = command_line::build_environment(command_line::agent_environment(), &runtime.variables, &root_dir);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&root_dir)
            .env_clear()
            .envs(&env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    // Own process group so stop/kill can signal the whole tree.
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::SpawnFailure {
            server_id: server_id.to_string(),
            program: program.clone(),
            source,
        })?;
        let started_at = now_unix_ms();
        let pid = child.id();
        let pgid = pid.map(|p| p as i32);

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (exit_tx, exit_rx) = watch::channel(None);

        let config = Arc::new(StartConfig {
            root_dir,
            argv,
            env,
            memory_mb: runtime.memory_mb,
            cpu_shares: runtime.cpu_shares,
            mounts: runtime.mounts.clone(),
            stop_command: runtime
                .stop_command
                .clone()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_STOP_COMMAND.to_string()),
        });
        let handle = ProcessHandle {
            pid,
            pgid,
            stdin: stdin.map(|s| Arc::new(Mutex::new(s))),
            exit: exit_rx,
        };

        if !self
            .registry
            .attach(server_id, epoch, config.clone(), handle, started_at)
            .await
        {
            // Stopped or killed while spawning: the child must not outlive its entry.
            tracing::info!(server_id, epoch, ?pid, "start cancelled; killing fresh child");
            kill_group(pgid);
            let _ = child.start_kill();
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            return Err(SupervisorError::Cancelled(server_id.to_string()));
        }

        if let Some(out) = stdout {
            output_relay::spawn_relay(out, server_id, OutputStream::Stdout, self.events.clone());
        }
        if let Some(err) = stderr {
            output_relay::spawn_relay(err, server_id, OutputStream::Stderr, self.events.clone());
        }
        self.spawn_exit_watcher(server_id.to_string(), epoch, child, exit_tx);

        tracing::info!(
            server_id,
            epoch,
            ?pid,
            argv = ?config.argv,
            cwd = %config.root_dir.display(),
            env_vars = config.env.len(),
            memory_mb = config.memory_mb,
            cpu_shares = config.cpu_shares,
            mounts = config.mounts.len(),
            "server spawned"
        );
        self.events.status(server_id, ServerStatus::Starting);
        self.arm_settle_timer(server_id.to_string(), epoch);

        Ok(pid)
    }

    /// Promotes to RUNNING after the settle delay, unless the incarnation
    /// exited, was killed or began stopping in the meantime. Slow starters
    /// are reported RUNNING before they are ready.
    fn arm_settle_timer(&self, server_id: String, epoch: u64) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.settings.settle_delay).await;
            if this.registry.promote(&server_id, epoch).await {
                tracing::debug!(server_id = %server_id, epoch, "settle timer promoted server");
                this.events.status(&server_id, ServerStatus::Running);
            }
        });
    }

    fn spawn_exit_watcher(
        &self,
        server_id: String,
        epoch: u64,
        mut child: Child,
        exit_tx: watch::Sender<Option<ExitInfo>>,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            let info = match child.wait().await {
                Ok(status) => ExitInfo::from(status),
                Err(e) => {
                    tracing::warn!(server_id = %server_id, epoch, error = %e, "wait failed");
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };

            // Deregister before waking stoppers so they observe a clean registry.
            match this.registry.remove(&server_id, Some(epoch)).await {
                Some(_) => {
                    tracing::info!(server_id = %server_id, epoch, exit = %info, "server exited");
                    this.events
                        .notice(&server_id, format!("[kiln] server exited ({info})"));
                    this.events.status(&server_id, ServerStatus::Offline);
                }
                None => {
                    tracing::debug!(server_id = %server_id, epoch, exit = %info, "exit after entry was removed");
                }
            }
            exit_tx.send_replace(Some(info));
        });
    }

    /// Graceful stop: write the stop command, wait for exit, escalate to
    /// SIGKILL after the stop timeout. Returns once the process has exited.
    pub async fn stop(&self, server_id: &str) -> Result<StopOutcome, SupervisorError> {
        let server_id = normalize_server_id(server_id)?;
        let (epoch, handle, stop_command, transitioned) = match self.registry.begin_stop(server_id).await {
            StopBegin::Absent => return Err(SupervisorError::NotRunning(server_id.to_string())),
            StopBegin::Released => {
                tracing::info!(server_id, "stop released a pre-spawn reservation");
                self.events.status(server_id, ServerStatus::Offline);
                return Ok(StopOutcome {
                    forced: false,
                    exit: None,
                });
            }
            StopBegin::Stopping {
                epoch,
                handle,
                stop_command,
                transitioned,
            } => (epoch, handle, stop_command, transitioned),
        };

        if transitioned {
            tracing::info!(server_id, epoch, timeout_ms = self.settings.stop_timeout.as_millis() as u64, "stop requested");
            self.events.status(server_id, ServerStatus::Stopping);
        }

        let mut exit = handle.exit.clone();
        let graceful = async {
            if transitioned {
                self.write_line(server_id, &handle, &stop_command).await;
            }
            wait_exit(&mut exit).await
        };
        if let Ok(info) = tokio::time::timeout(self.settings.stop_timeout, graceful).await {
            return Ok(StopOutcome {
                forced: false,
                exit: info,
            });
        }

        // A concurrent kill may already have taken the entry and signalled.
        let forced = self.registry.is_current(server_id, epoch).await;
        if forced {
            tracing::warn!(server_id, epoch, "stop timed out; sending SIGKILL");
            kill_group(handle.pgid);
            self.events.notice(
                server_id,
                format!(
                    "[kiln] stop timed out after {}ms; sent SIGKILL",
                    self.settings.stop_timeout.as_millis()
                ),
            );
        }

        let mut exit = handle.exit.clone();
        let info = wait_exit(&mut exit).await;
        Ok(StopOutcome { forced, exit: info })
    }

    /// Immediate SIGKILL. The entry is gone and OFFLINE emitted before this
    /// returns; the later exit event finds nothing to remove.
    pub async fn kill(&self, server_id: &str) -> Result<(), SupervisorError> {
        let server_id = normalize_server_id(server_id)?;
        let Some(entry) = self.registry.remove(server_id, None).await else {
            return Err(SupervisorError::NotRunning(server_id.to_string()));
        };

        // A reservation without a handle is killed by the start path on attach.
        if let Some(handle) = &entry.handle {
            kill_group(handle.pgid);
        }
        tracing::info!(server_id, epoch = entry.epoch, "server killed");
        self.events.notice(server_id, "[kiln] server killed");
        self.events.status(server_id, ServerStatus::Offline);
        Ok(())
    }

    /// Stop, then start again after the restart delay. Restart of an offline
    /// server is a plain start.
    pub async fn restart(
        &self,
        server_id: &str,
        runtime: &RuntimeConfig,
    ) -> Result<Option<u32>, SupervisorError> {
        match self.stop(server_id).await {
            Ok(_) | Err(SupervisorError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        tokio::time::sleep(self.settings.restart_delay).await;
        self.start(server_id, runtime).await
    }

    /// Writes `line` to the server's stdin. Returns whether it was delivered.
    pub async fn send_command(&self, server_id: &str, line: &str) -> bool {
        let Ok(server_id) = normalize_server_id(server_id) else {
            tracing::warn!(server_id, "command dropped: invalid server id");
            return false;
        };
        let Some(handle) = self.registry.handle(server_id).await else {
            tracing::warn!(server_id, "command dropped: server is not running");
            return false;
        };
        self.write_line(server_id, &handle, line).await
    }

    async fn write_line(&self, server_id: &str, handle: &ProcessHandle, line: &str) -> bool {
        let Some(stdin) = &handle.stdin else {
            tracing::warn!(server_id, "command dropped: stdin unavailable");
            return false;
        };

        let mut data = line.trim_end_matches(['\r', '\n']).to_string();
        data.push('\n');

        let mut stdin = stdin.lock().await;
        let res = match stdin.write_all(data.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        match res {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(server_id, error = %e, "command dropped: stdin not writable");
                false
            }
        }
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.registry.is_closed().await
    }

    /// Refuses further starts, then stops every tracked server concurrently
    /// and waits for all of them.
    pub async fn shutdown(&self) {
        // Nothing can be reserved after this, so the list below is complete.
        self.registry.close().await;
        let tracked = self.list().await;
        if tracked.is_empty() {
            return;
        }
        tracing::info!(servers = tracked.len(), "stopping all servers");

        let results =
            futures_util::future::join_all(tracked.iter().map(|e| self.stop(&e.server_id))).await;
        for (entry, res) in tracked.iter().zip(results) {
            match res {
                Ok(outcome) => tracing::info!(
                    server_id = %entry.server_id,
                    pid = ?entry.pid,
                    forced = outcome.forced,
                    "server stopped for shutdown"
                ),
                Err(e) => tracing::debug!(server_id = %entry.server_id, error = %e, "nothing to stop"),
            }
        }
    }
}
