use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod command_line;
mod config;
mod control_tunnel;
mod dispatcher;
mod error;
mod error_payload;
mod event_sink;
mod file_sandbox;
mod installer;
mod mounts;
mod output_relay;
mod procfs;
mod registry;
mod stats_sampler;
mod supervisor;

use config::AgentConfig;
use dispatcher::Dispatcher;
use event_sink::EventSink;
use file_sandbox::FileSandbox;
use installer::Installer;
use registry::Registry;
use stats_sampler::StatsSampler;
use supervisor::{Supervisor, SupervisorSettings};

const TUNNEL_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// The returned guard flushes the log file on drop and must outlive the agent.
fn init_tracing(cfg: &AgentConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &cfg.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "kiln-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cfg = AgentConfig::from_env();
    let _log_guard = init_tracing(&cfg);

    let servers_dir = cfg.servers_dir();
    tokio::fs::create_dir_all(&servers_dir).await?;
    tracing::info!(
        data_root = %cfg.data_root.display(),
        node = %cfg.node_name,
        settle_ms = cfg.settle_delay.as_millis() as u64,
        stop_timeout_ms = cfg.stop_timeout.as_millis() as u64,
        "kiln-agent starting"
    );

    let (events, events_rx) = EventSink::channel();
    let registry = Registry::new();
    let sandbox = FileSandbox::new(servers_dir);
    let supervisor = Supervisor::new(
        registry.clone(),
        sandbox.clone(),
        events.clone(),
        SupervisorSettings::from(&cfg),
    );
    let installer = Installer::new(registry.clone(), sandbox.clone());
    let dispatcher = Dispatcher::new(supervisor.clone(), sandbox, installer, events.clone());

    let sampler = StatsSampler::new(registry, events, cfg.data_root.clone(), cfg.stats_interval);
    let sampler_task = tokio::spawn(sampler.run());
    let (tunnel_stop, tunnel_stop_rx) = watch::channel(false);
    let tunnel_task = control_tunnel::spawn(
        control_tunnel::TunnelSettings::from_config(&cfg),
        dispatcher,
        events_rx,
        tunnel_stop_rx,
    );

    wait_for_shutdown_signal().await?;
    tracing::info!("shutdown requested");

    sampler_task.abort();
    // Closes the registry first: from here on the dispatcher refuses inbound
    // frames, while the tunnel keeps carrying STOPPING/OFFLINE out.
    supervisor.shutdown().await;
    let _ = tunnel_stop.send(true);
    if tokio::time::timeout(TUNNEL_FLUSH_TIMEOUT, tunnel_task)
        .await
        .is_err()
    {
        tracing::warn!("control tunnel did not flush before exit");
    }

    tracing::info!("kiln-agent stopped");
    Ok(())
}
