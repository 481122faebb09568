use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use kiln_process::{AgentToControlFrame, ControlToAgentFrame};
use tokio::sync::{mpsc::UnboundedReceiver, watch};
use tokio_tungstenite::tungstenite::{Message as WsMessage, client::IntoClientRequest};
use tracing::{Instrument, info_span};

use crate::config::AgentConfig;
use crate::dispatcher::Dispatcher;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub url: String,
    pub node: String,
    pub token: Option<String>,
}

impl TunnelSettings {
    pub fn from_config(cfg: &AgentConfig) -> Option<Self> {
        Some(Self {
            url: cfg.control_ws_url.clone()?,
            node: cfg.node_name.clone(),
            token: cfg.node_token.clone(),
        })
    }
}

fn decode_frame(text: &str) -> ControlToAgentFrame {
    match serde_json::from_str::<ControlToAgentFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(error = %e, "undecodable control frame");
            ControlToAgentFrame::Unknown
        }
    }
}

/// Drops everything queued while there is no connection to deliver it to.
fn discard_pending(events: &mut UnboundedReceiver<AgentToControlFrame>) -> usize {
    let mut n = 0;
    while events.try_recv().is_ok() {
        n += 1;
    }
    n
}

/// Resolves once shutdown is signalled or the signalling side is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Sleeps for `wait`, discarding events as they arrive. Returns false once
/// the event channel has closed or shutdown was signalled.
async fn sleep_discarding(
    events: &mut UnboundedReceiver<AgentToControlFrame>,
    shutdown: &mut watch::Receiver<bool>,
    wait: Duration,
) -> bool {
    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);
    let mut dropped = 0usize;
    let open = loop {
        tokio::select! {
            _ = &mut deadline => break true,
            _ = shutdown_requested(shutdown) => break false,
            ev = events.recv() => match ev {
                Some(_) => dropped += 1,
                None => break false,
            },
        }
    };
    if dropped > 0 {
        tracing::debug!(dropped, "discarded events while disconnected");
    }
    open
}

/// Without a control URL the agent still runs; events are drained so the
/// queue cannot grow without bound.
async fn drain_forever(
    mut events: UnboundedReceiver<AgentToControlFrame>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut dropped = 0u64;
    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => return,
            ev = events.recv() => {
                if ev.is_none() {
                    return;
                }
                dropped += 1;
                if dropped % 1000 == 0 {
                    tracing::debug!(dropped, "no control plane configured; discarding events");
                }
            }
        }
    }
}

/// Runs the tunnel until `shutdown` turns true. Inbound frames keep flowing
/// to the dispatcher until then; on shutdown, events already queued are sent
/// before the connection is closed.
pub fn spawn(
    settings: Option<TunnelSettings>,
    dispatcher: Dispatcher,
    events: UnboundedReceiver<AgentToControlFrame>,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let Some(settings) = settings else {
        tracing::warn!("KILN_CONTROL_WS_URL not set; running without a control plane");
        return tokio::spawn(drain_forever(events, shutdown));
    };

    let span = info_span!("control_tunnel", node = %settings.node, url = %settings.url);
    tokio::spawn(run(settings, dispatcher, events, shutdown).instrument(span))
}

async fn run(
    settings: TunnelSettings,
    dispatcher: Dispatcher,
    mut events: UnboundedReceiver<AgentToControlFrame>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if *shutdown.borrow() {
            return;
        }
        let stale = discard_pending(&mut events);
        if stale > 0 {
            tracing::debug!(dropped = stale, "discarded events while disconnected");
        }

        let attempt_at = tokio::time::Instant::now();
        let res = run_once(&settings, &dispatcher, &mut events, &mut shutdown).await;
        // A connection that held for a while starts over from the initial backoff.
        if attempt_at.elapsed() >= MAX_BACKOFF {
            backoff = INITIAL_BACKOFF;
        }
        match res {
            Ok(true) => {
                // Clean close; reconnect with a small delay.
                tracing::info!("control tunnel closed");
                backoff = INITIAL_BACKOFF;
            }
            Ok(false) => return,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), backoff_ms = backoff.as_millis() as u64, "control tunnel disconnected");
            }
        }

        if !sleep_discarding(&mut events, &mut shutdown, backoff).await {
            return;
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// One connection. Returns `Ok(false)` when the agent is shutting down.
async fn run_once(
    settings: &TunnelSettings,
    dispatcher: &Dispatcher,
    events: &mut UnboundedReceiver<AgentToControlFrame>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<bool> {
    let mut req = settings.url.as_str().into_client_request()?;
    if let Some(tok) = settings.token.as_deref() {
        let value = format!("Bearer {tok}");
        req.headers_mut().insert("Authorization", value.parse()?);
    }

    let (ws, _) = tokio_tungstenite::connect_async(req).await?;
    let (mut sink, mut stream) = ws.split();
    tracing::info!("control tunnel connected");

    let hello = AgentToControlFrame::Hello {
        node: settings.node.clone(),
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    sink.send(WsMessage::Text(serde_json::to_string(&hello)?.into()))
        .await?;

    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(msg) = msg else {
                    return Ok(true);
                };
                match msg? {
                    WsMessage::Text(text) => dispatcher.dispatch(decode_frame(&text)),
                    WsMessage::Close(_) => return Ok(true),
                    _ => {}
                }
            }
            ev = events.recv() => {
                let Some(frame) = ev else {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Ok(false);
                };
                sink.send(WsMessage::Text(serde_json::to_string(&frame)?.into()))
                    .await?;
            }
            _ = shutdown_requested(shutdown) => {
                let mut flushed = 0usize;
                while let Ok(frame) = events.try_recv() {
                    sink.send(WsMessage::Text(serde_json::to_string(&frame)?.into()))
                        .await?;
                    flushed += 1;
                }
                tracing::info!(flushed, "control tunnel closing for shutdown");
                let _ = sink.send(WsMessage::Close(None)).await;
                return Ok(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use kiln_process::ServerStatus;
    use tokio::net::TcpListener;

    use super::*;
    use crate::event_sink::EventSink;
    use crate::file_sandbox::FileSandbox;
    use crate::installer::Installer;
    use crate::registry::Registry;
    use crate::supervisor::{Supervisor, SupervisorSettings};

    fn dispatcher(sink: EventSink, root: &std::path::Path) -> Dispatcher {
        let registry = Registry::new();
        let sandbox = FileSandbox::new(root.join("servers"));
        let supervisor = Supervisor::new(
            registry.clone(),
            sandbox.clone(),
            sink.clone(),
            SupervisorSettings {
                settle_delay: Duration::from_millis(100),
                stop_timeout: Duration::from_millis(500),
                restart_delay: Duration::from_millis(50),
            },
        );
        Dispatcher::new(
            supervisor,
            sandbox.clone(),
            Installer::new(registry, sandbox),
            sink,
        )
    }

    #[test]
    fn undecodable_frames_become_unknown() {
        assert_eq!(decode_frame("not json"), ControlToAgentFrame::Unknown);
        assert_eq!(
            decode_frame(r#"{"type":"reboot","server_id":"srv1"}"#),
            ControlToAgentFrame::Unknown
        );
        assert!(matches!(
            decode_frame(r#"{"type":"create","server_id":"srv1"}"#),
            ControlToAgentFrame::Create { .. }
        ));
    }

    #[tokio::test]
    async fn pending_events_are_discarded() {
        let (sink, mut rx) = EventSink::channel();
        sink.status("srv1", ServerStatus::Starting);
        sink.status("srv1", ServerStatus::Offline);
        assert_eq!(discard_pending(&mut rx), 2);
        assert_eq!(discard_pending(&mut rx), 0);
    }

    #[tokio::test]
    async fn sleep_discarding_reports_closed_channel() {
        let (sink, mut rx) = EventSink::channel();
        let (_stop_tx, mut stop_rx) = watch::channel(false);
        sink.notice("srv1", "dropped");
        drop(sink);
        assert!(!sleep_discarding(&mut rx, &mut stop_rx, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn sleep_discarding_ends_on_shutdown() {
        let (_sink, mut rx) = EventSink::channel();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        stop_tx.send(true).unwrap();
        let slept = tokio::time::timeout(
            Duration::from_secs(1),
            sleep_discarding(&mut rx, &mut stop_rx, Duration::from_secs(30)),
        )
        .await
        .unwrap();
        assert!(!slept);
    }

    #[tokio::test]
    async fn tunnel_sends_hello_and_answers_requests() {
        let tmp = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (sink, rx) = EventSink::channel();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let settings = TunnelSettings {
            url: format!("ws://{addr}"),
            node: "node-a".to_string(),
            token: Some("secret".to_string()),
        };
        let task = spawn(Some(settings), dispatcher(sink, tmp.path()), rx, stop_rx);

        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

        let hello = ws.next().await.unwrap().unwrap();
        let hello: AgentToControlFrame = serde_json::from_str(hello.to_text().unwrap()).unwrap();
        assert!(matches!(hello, AgentToControlFrame::Hello { ref node, .. } if node == "node-a"));

        let req = r#"{"type":"command","id":"r1","server_id":"srv1","line":"list"}"#;
        ws.send(WsMessage::Text(req.into())).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let reply: AgentToControlFrame = serde_json::from_str(reply.to_text().unwrap()).unwrap();
        match reply {
            AgentToControlFrame::Resp { id, ok, payload } => {
                assert_eq!(id, "r1");
                assert!(ok);
                assert_eq!(payload, Some(serde_json::json!({ "delivered": false })));
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        task.abort();
    }

    #[tokio::test]
    async fn shutdown_flushes_queued_events_then_closes() {
        let tmp = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (sink, rx) = EventSink::channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let settings = TunnelSettings {
            url: format!("ws://{addr}"),
            node: "node-a".to_string(),
            token: None,
        };
        let task = spawn(Some(settings), dispatcher(sink.clone(), tmp.path()), rx, stop_rx);

        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        ws.next().await.unwrap().unwrap();

        sink.status("srv1", ServerStatus::Stopping);
        sink.status("srv1", ServerStatus::Offline);
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        let mut got = Vec::new();
        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                WsMessage::Text(_) => {
                    let frame: AgentToControlFrame = serde_json::from_str(msg.to_text().unwrap()).unwrap();
                    got.push(frame);
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
        assert_eq!(
            got,
            vec![
                AgentToControlFrame::Status {
                    server_id: "srv1".to_string(),
                    status: ServerStatus::Stopping,
                },
                AgentToControlFrame::Status {
                    server_id: "srv1".to_string(),
                    status: ServerStatus::Offline,
                },
            ]
        );
    }
}
