use std::{path::PathBuf, time::Duration};

const DEFAULT_SETTLE_MS: u64 = 3000;
const DEFAULT_STOP_TIMEOUT_SEC: u64 = 10;
const DEFAULT_RESTART_DELAY_MS: u64 = 2000;
const DEFAULT_STATS_INTERVAL_MS: u64 = 2000;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub data_root: PathBuf,
    pub control_ws_url: Option<String>,
    pub node_name: String,
    pub node_token: Option<String>,
    /// Delay after spawn before a still-alive server is reported running.
    pub settle_delay: Duration,
    pub stop_timeout: Duration,
    pub restart_delay: Duration,
    pub stats_interval: Duration,
    pub log_dir: Option<PathBuf>,
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_u64(raw: Option<String>) -> Option<u64> {
    non_empty(raw).and_then(|v| v.parse::<u64>().ok())
}

pub(crate) fn parse_ws_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    // Accept http(s) URLs by converting to ws(s).
    if let Some(rest) = trimmed.strip_prefix("https://") {
        return Some(format!("wss://{rest}"));
    }
    if let Some(rest) = trimmed.strip_prefix("http://") {
        return Some(format!("ws://{rest}"));
    }
    Some(trimmed.to_string())
}

fn absolutize(raw: &str) -> PathBuf {
    let p = PathBuf::from(raw);
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    // Best-effort canonicalization: the directory may not exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let data_root = non_empty(lookup("KILN_DATA_ROOT")).unwrap_or_else(|| "./data".to_string());

        let node_name = non_empty(lookup("KILN_NODE_NAME"))
            .or_else(|| non_empty(lookup("HOSTNAME")))
            .unwrap_or_else(|| "default".to_string());

        let settle_ms = parse_u64(lookup("KILN_SETTLE_MS"))
            .map(|v| v.clamp(100, 120_000))
            .unwrap_or(DEFAULT_SETTLE_MS);
        let stop_timeout_sec = parse_u64(lookup("KILN_STOP_TIMEOUT_SEC"))
            .map(|v| v.clamp(1, 600))
            .unwrap_or(DEFAULT_STOP_TIMEOUT_SEC);
        let restart_delay_ms = parse_u64(lookup("KILN_RESTART_DELAY_MS"))
            .map(|v| v.min(60_000))
            .unwrap_or(DEFAULT_RESTART_DELAY_MS);
        let stats_interval_ms = parse_u64(lookup("KILN_STATS_INTERVAL_MS"))
            .map(|v| v.clamp(250, 60_000))
            .unwrap_or(DEFAULT_STATS_INTERVAL_MS);

        Self {
            data_root: absolutize(&data_root),
            control_ws_url: lookup("KILN_CONTROL_WS_URL").and_then(|v| parse_ws_url(&v)),
            node_name,
            node_token: non_empty(lookup("KILN_NODE_TOKEN")),
            settle_delay: Duration::from_millis(settle_ms),
            stop_timeout: Duration::from_secs(stop_timeout_sec),
            restart_delay: Duration::from_millis(restart_delay_ms),
            stats_interval: Duration::from_millis(stats_interval_ms),
            log_dir: non_empty(lookup("KILN_LOG_DIR")).map(PathBuf::from),
        }
    }

    pub fn servers_dir(&self) -> PathBuf {
        self.data_root.join("servers")
    }
}
