use std::{collections::HashMap, path::PathBuf, time::Duration};

use kiln_process::{AgentToControlFrame, NodeStats};
use tokio::time::Instant;

use crate::event_sink::EventSink;
use crate::procfs::{self, CpuTimes};
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerSample {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

impl ServerSample {
    const ZERO: ServerSample = ServerSample {
        cpu_percent: 0.0,
        memory_bytes: 0,
    };
}

fn cpu_percent(prev_ticks: u64, prev_at: Instant, ticks: u64, now: Instant) -> f64 {
    let dt = now.duration_since(prev_at).as_secs_f64();
    if dt <= 0.0 {
        return 0.0;
    }
    let delta_ticks = ticks.saturating_sub(prev_ticks) as f64;
    let cpu = (delta_ticks / procfs::ticks_per_sec() as f64) / dt * 100.0;
    // Two decimals is all the panel shows.
    let cpu = (cpu * 100.0).round() / 100.0;
    if cpu.is_finite() { cpu.max(0.0) } else { 0.0 }
}

/// Periodic resource sampling for running servers and the node itself.
#[derive(Debug)]
pub struct StatsSampler {
    registry: Registry,
    events: EventSink,
    data_root: PathBuf,
    interval: Duration,
    // Keyed by pid as well so a restarted server never diffs against its
    // previous incarnation.
    last: HashMap<(String, u32), (u64, Instant)>,
    last_node_cpu: Option<CpuTimes>,
}

impl StatsSampler {
    pub fn new(registry: Registry, events: EventSink, data_root: PathBuf, interval: Duration) -> Self {
        Self {
            registry,
            events,
            data_root,
            interval,
            last: HashMap::new(),
            last_node_cpu: None,
        }
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            self.sample_once().await;
        }
    }

    pub async fn sample_once(&mut self) {
        let running = self.registry.running_pids().await;
        let mut seen = Vec::with_capacity(running.len());

        for (server_id, pid) in running {
            let sample = self.sample_server(&server_id, pid).await;
            self.events.emit(AgentToControlFrame::ServerStats {
                server_id: server_id.clone(),
                cpu_percent: sample.cpu_percent,
                memory_bytes: sample.memory_bytes,
            });
            seen.push((server_id, pid));
        }
        self.last.retain(|key, _| seen.contains(key));

        let node = self.sample_node().await;
        self.events.emit(AgentToControlFrame::NodeStats(node));
    }

    /// A failed read zeroes both fields for this server only.
    pub async fn sample_server(&mut self, server_id: &str, pid: u32) -> ServerSample {
        let now = Instant::now();
        let key = (server_id.to_string(), pid);
        let Some(ticks) = procfs::read_pid_cpu_ticks(pid).await else {
            self.last.remove(&key);
            tracing::debug!(server_id, pid, "cpu sample unavailable");
            return ServerSample::ZERO;
        };
        let Some(memory_bytes) = procfs::read_pid_rss_bytes(pid).await else {
            self.last.remove(&key);
            tracing::debug!(server_id, pid, "memory sample unavailable");
            return ServerSample::ZERO;
        };

        let cpu = self
            .last
            .get(&key)
            .map(|&(prev_ticks, prev_at)| cpu_percent(prev_ticks, prev_at, ticks, now))
            .unwrap_or(0.0);
        self.last.insert(key, (ticks, now));

        ServerSample {
            cpu_percent: cpu,
            memory_bytes,
        }
    }

    pub async fn sample_node(&mut self) -> NodeStats {
        let cpu_now = procfs::read_cpu_times().await;
        let cpu_percent = match (cpu_now, self.last_node_cpu) {
            (Some(now), Some(prev)) => now.percent_since(prev),
            _ => 0.0,
        };
        self.last_node_cpu = cpu_now;

        let (memory_used_bytes, memory_total_bytes) = procfs::read_memory().await.unwrap_or((0, 0));
        let (disk_used_bytes, disk_total_bytes) =
            procfs::disk_usage(&self.data_root).unwrap_or((0, 0));

        NodeStats {
            cpu_percent,
            memory_used_bytes,
            memory_total_bytes,
            disk_used_bytes,
            disk_total_bytes,
            uptime_secs: procfs::read_uptime_secs().await.unwrap_or(0),
            load_average: procfs::read_loadavg().await.unwrap_or([0.0; 3]),
        }
    }
}
