use std::collections::BTreeMap;

/// Lifecycle status of one supervised server.
///
/// NOTE: `Offline` is never stored by the agent. A server without a
/// supervision entry is offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Offline,
    Starting,
    Running,
    Stopping,
}

impl ServerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::Offline => "offline",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Start,
    Stop,
    Restart,
    Kill,
}

/// Origin of a console line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
    /// Lines written by the agent itself (mount warnings, exit notices).
    Agent,
}

fn default_ip() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Allocation {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default)]
    pub port: u16,
}

impl Default for Allocation {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: 0,
        }
    }
}

/// Host directory linked into a server root before spawn.
///
/// `read_only` is advisory: the link is a plain directory symlink.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Runtime configuration carried by a `power` start/restart request.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RuntimeConfig {
    /// Invocation template, e.g. `java -Xmx{{SERVER_MEMORY}}M -jar {{SERVER_JARFILE}}`.
    pub command: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub allocation: Allocation,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub cpu_shares: u64,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    /// Line written to stdin on graceful stop. Defaults to `stop`.
    #[serde(default)]
    pub stop_command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InstallRecipe {
    pub script: String,
    #[serde(default)]
    pub entrypoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NodeStats {
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub disk_used_bytes: u64,
    pub disk_total_bytes: u64,
    pub uptime_secs: u64,
    pub load_average: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlToAgentFrame {
    Create {
        #[serde(default)]
        id: Option<String>,
        server_id: String,
    },
    Install {
        #[serde(default)]
        id: Option<String>,
        server_id: String,
        recipe: InstallRecipe,
        #[serde(default)]
        variables: BTreeMap<String, String>,
    },
    Power {
        #[serde(default)]
        id: Option<String>,
        server_id: String,
        action: PowerAction,
        #[serde(default)]
        config: Option<RuntimeConfig>,
    },
    Command {
        #[serde(default)]
        id: Option<String>,
        server_id: String,
        line: String,
    },
    Delete {
        #[serde(default)]
        id: Option<String>,
        server_id: String,
    },
    #[serde(other)]
    Unknown,
}

impl ControlToAgentFrame {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ControlToAgentFrame::Create { id, .. }
            | ControlToAgentFrame::Install { id, .. }
            | ControlToAgentFrame::Power { id, .. }
            | ControlToAgentFrame::Command { id, .. }
            | ControlToAgentFrame::Delete { id, .. } => id.as_deref(),
            ControlToAgentFrame::Unknown => None,
        }
    }

    pub fn server_id(&self) -> Option<&str> {
        match self {
            ControlToAgentFrame::Create { server_id, .. }
            | ControlToAgentFrame::Install { server_id, .. }
            | ControlToAgentFrame::Power { server_id, .. }
            | ControlToAgentFrame::Command { server_id, .. }
            | ControlToAgentFrame::Delete { server_id, .. } => Some(server_id),
            ControlToAgentFrame::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentToControlFrame {
    Hello {
        node: String,
        agent_version: String,
    },
    Resp {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    Status {
        server_id: String,
        status: ServerStatus,
    },
    Console {
        server_id: String,
        line: String,
        stream: OutputStream,
    },
    Error {
        server_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: ErrorPayload,
    },
    ServerStats {
        server_id: String,
        cpu_percent: f64,
        memory_bytes: u64,
    },
    NodeStats(NodeStats),
}

impl AgentToControlFrame {
    /// Server this frame is scoped to, if any.
    pub fn server_id(&self) -> Option<&str> {
        match self {
            AgentToControlFrame::Status { server_id, .. }
            | AgentToControlFrame::Console { server_id, .. }
            | AgentToControlFrame::Error { server_id, .. }
            | AgentToControlFrame::ServerStats { server_id, .. } => Some(server_id),
            _ => None,
        }
    }
}
