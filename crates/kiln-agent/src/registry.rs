//! Supervision entries keyed by server id.
//!
//! Every mutation happens inside one short critical section and re-validates
//! the entry it acts on: asynchronous completions (exit watcher, settle timer,
//! spawn) carry the `epoch` they were armed for and are no-ops against any
//! other incarnation of the same server.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
};

use kiln_process::{MountSpec, ServerStatus};
use tokio::{
    process::ChildStdin,
    sync::{Mutex, watch},
};

use crate::error::SupervisorError;
use crate::installer::InstallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {code}"),
            (None, Some(sig)) => write!(f, "signal {sig}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Resolved launch parameters of one incarnation.
#[derive(Debug, Clone)]
pub struct StartConfig {
    pub root_dir: PathBuf,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Advisory only; not enforced by the supervisor.
    pub memory_mb: u64,
    /// Advisory only; not enforced by the supervisor.
    pub cpu_shares: u64,
    pub mounts: Vec<MountSpec>,
    pub stop_command: String,
}

/// The supervisor's grip on a spawned child. The `Child` itself lives in the
/// exit watcher task; this carries what is needed to signal and feed it.
#[derive(Debug, Clone)]
pub(crate) struct ProcessHandle {
    pub(crate) pid: Option<u32>,
    pub(crate) pgid: Option<i32>,
    pub(crate) stdin: Option<Arc<Mutex<ChildStdin>>>,
    pub(crate) exit: watch::Receiver<Option<ExitInfo>>,
}

#[derive(Debug)]
pub struct SupervisionEntry {
    pub server_id: String,
    pub epoch: u64,
    pub status: ServerStatus,
    pub started_at_unix_ms: Option<u64>,
    pub config: Option<Arc<StartConfig>>,
    pub(crate) handle: Option<ProcessHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub server_id: String,
    pub epoch: u64,
    pub status: ServerStatus,
    pub pid: Option<u32>,
    pub started_at_unix_ms: Option<u64>,
}

impl From<&SupervisionEntry> for EntrySnapshot {
    fn from(e: &SupervisionEntry) -> Self {
        Self {
            server_id: e.server_id.clone(),
            epoch: e.epoch,
            status: e.status,
            pid: e.handle.as_ref().and_then(|h| h.pid),
            started_at_unix_ms: e.started_at_unix_ms,
        }
    }
}

/// Result of moving an entry towards STOPPING.
#[derive(Debug)]
pub(crate) enum StopBegin {
    Absent,
    /// The entry was still a pre-spawn reservation and has been removed.
    Released,
    Stopping {
        epoch: u64,
        handle: ProcessHandle,
        stop_command: String,
        /// False when another stop already moved the entry to STOPPING.
        transitioned: bool,
    },
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, SupervisionEntry>,
    next_epoch: u64,
    closed: bool,
}

type InstallSet = Arc<std::sync::Mutex<HashSet<String>>>;

/// Marks a server as installing until dropped, including when the install
/// future is cancelled.
#[derive(Debug)]
pub(crate) struct InstallClaim {
    installing: InstallSet,
    server_id: String,
}

impl Drop for InstallClaim {
    fn drop(&mut self) {
        let mut set = self.installing.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.server_id);
    }
}

#[derive(Clone, Debug, Default)]
pub struct Registry {
    inner: Arc<Mutex<State>>,
    // Inserted into only while `inner` is held, so reserve and begin_install
    // cannot interleave.
    installing: InstallSet,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_installing(&self, server_id: &str) -> bool {
        let set = self.installing.lock().unwrap_or_else(|e| e.into_inner());
        set.contains(server_id)
    }

    /// Creates a STARTING reservation with no process attached yet.
    pub async fn reserve(&self, server_id: &str) -> Result<u64, SupervisorError> {
        let mut state = self.inner.lock().await;
        if state.closed {
            return Err(SupervisorError::ShuttingDown(server_id.to_string()));
        }
        if let Some(existing) = state.entries.get(server_id) {
            return Err(SupervisorError::AlreadyRunning {
                server_id: server_id.to_string(),
                status: existing.status,
            });
        }
        if self.is_installing(server_id) {
            return Err(SupervisorError::Installing(server_id.to_string()));
        }

        state.next_epoch = state.next_epoch.saturating_add(1);
        let epoch = state.next_epoch;
        state.entries.insert(
            server_id.to_string(),
            SupervisionEntry {
                server_id: server_id.to_string(),
                epoch,
                status: ServerStatus::Starting,
                started_at_unix_ms: None,
                config: None,
                handle: None,
            },
        );
        Ok(epoch)
    }

    /// Claims the server for an install. Refused while it has an entry or
    /// another install holds the claim; `reserve` is refused while it is held.
    pub(crate) async fn begin_install(&self, server_id: &str) -> Result<InstallClaim, InstallError> {
        let state = self.inner.lock().await;
        if let Some(existing) = state.entries.get(server_id) {
            return Err(InstallError::ServerActive {
                server_id: server_id.to_string(),
                status: existing.status,
            });
        }

        let mut set = self.installing.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(server_id.to_string()) {
            return Err(InstallError::InProgress(server_id.to_string()));
        }
        Ok(InstallClaim {
            installing: self.installing.clone(),
            server_id: server_id.to_string(),
        })
    }

    /// Refuses every later `reserve`. Entries already present are kept.
    pub async fn close(&self) {
        self.inner.lock().await.closed = true;
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    /// Attaches a spawned process to its reservation. Returns false when the
    /// reservation was released meanwhile; the caller then owns an untracked
    /// child and must kill it.
    pub(crate) async fn attach(
        &self,
        server_id: &str,
        epoch: u64,
        config: Arc<StartConfig>,
        handle: ProcessHandle,
        started_at_unix_ms: u64,
    ) -> bool {
        let mut state = self.inner.lock().await;
        let Some(e) = state.entries.get_mut(server_id) else {
            return false;
        };
        if e.epoch != epoch || e.status != ServerStatus::Starting || e.handle.is_some() {
            return false;
        }
        e.config = Some(config);
        e.handle = Some(handle);
        e.started_at_unix_ms = Some(started_at_unix_ms);
        true
    }

    /// STARTING → RUNNING for the given incarnation only.
    pub async fn promote(&self, server_id: &str, epoch: u64) -> bool {
        let mut state = self.inner.lock().await;
        match state.entries.get_mut(server_id) {
            Some(e)
                if e.epoch == epoch && e.status == ServerStatus::Starting && e.handle.is_some() =>
            {
                e.status = ServerStatus::Running;
                true
            }
            _ => false,
        }
    }

    pub(crate) async fn begin_stop(&self, server_id: &str) -> StopBegin {
        let mut state = self.inner.lock().await;
        let Some(e) = state.entries.get_mut(server_id) else {
            return StopBegin::Absent;
        };

        let Some(handle) = e.handle.clone() else {
            state.entries.remove(server_id);
            return StopBegin::Released;
        };

        let transitioned = e.status != ServerStatus::Stopping;
        e.status = ServerStatus::Stopping;
        let stop_command = e
            .config
            .as_ref()
            .map(|c| c.stop_command.clone())
            .unwrap_or_default();
        StopBegin::Stopping {
            epoch: e.epoch,
            handle,
            stop_command,
            transitioned,
        }
    }

    /// Removes the entry if it matches `epoch` (any incarnation when `None`).
    /// Exactly one caller ever receives the removed entry.
    pub async fn remove(&self, server_id: &str, epoch: Option<u64>) -> Option<SupervisionEntry> {
        let mut state = self.inner.lock().await;
        let matches = state
            .entries
            .get(server_id)
            .is_some_and(|e| epoch.is_none_or(|want| e.epoch == want));
        if !matches {
            return None;
        }
        state.entries.remove(server_id)
    }

    pub(crate) async fn handle(&self, server_id: &str) -> Option<ProcessHandle> {
        let state = self.inner.lock().await;
        state.entries.get(server_id).and_then(|e| e.handle.clone())
    }

    pub async fn is_current(&self, server_id: &str, epoch: u64) -> bool {
        let state = self.inner.lock().await;
        state
            .entries
            .get(server_id)
            .is_some_and(|e| e.epoch == epoch)
    }

    pub async fn status(&self, server_id: &str) -> ServerStatus {
        let state = self.inner.lock().await;
        state
            .entries
            .get(server_id)
            .map(|e| e.status)
            .unwrap_or(ServerStatus::Offline)
    }

    pub async fn get(&self, server_id: &str) -> Option<EntrySnapshot> {
        let state = self.inner.lock().await;
        state.entries.get(server_id).map(EntrySnapshot::from)
    }

    pub async fn snapshot(&self) -> Vec<EntrySnapshot> {
        let state = self.inner.lock().await;
        let mut out: Vec<EntrySnapshot> = state.entries.values().map(EntrySnapshot::from).collect();
        out.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        out
    }

    /// `(server_id, pid)` for every RUNNING entry with a known pid.
    pub async fn running_pids(&self) -> Vec<(String, u32)> {
        let state = self.inner.lock().await;
        state
            .entries
            .values()
            .filter(|e| e.status == ServerStatus::Running)
            .filter_map(|e| Some((e.server_id.clone(), e.handle.as_ref()?.pid?)))
            .collect()
    }
}
