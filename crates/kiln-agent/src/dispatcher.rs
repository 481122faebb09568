use std::collections::BTreeMap;

use kiln_process::{
    AgentToControlFrame, ControlToAgentFrame, ErrorPayload, InstallRecipe, OutputStream,
    PowerAction, RuntimeConfig,
};
use serde_json::{Value, json};
use tracing::Instrument;

use crate::error::{DispatchError, SupervisorError};
use crate::event_sink::EventSink;
use crate::file_sandbox::{FileSandbox, normalize_server_id};
use crate::installer::Installer;
use crate::supervisor::Supervisor;

fn action_name(action: PowerAction) -> &'static str {
    match action {
        PowerAction::Start => "start",
        PowerAction::Stop => "stop",
        PowerAction::Restart => "restart",
        PowerAction::Kill => "kill",
    }
}

/// Routes inbound control frames to the supervisor and its collaborators.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    supervisor: Supervisor,
    sandbox: FileSandbox,
    installer: Installer,
    events: EventSink,
}

impl Dispatcher {
    pub fn new(
        supervisor: Supervisor,
        sandbox: FileSandbox,
        installer: Installer,
        events: EventSink,
    ) -> Self {
        Self {
            supervisor,
            sandbox,
            installer,
            events,
        }
    }

    /// Handles `frame` on its own task; frames dispatched in order may
    /// complete in any order.
    pub fn dispatch(&self, frame: ControlToAgentFrame) {
        let this = self.clone();
        tokio::spawn(async move { this.handle(frame).await });
    }

    pub async fn handle(&self, frame: ControlToAgentFrame) {
        let Some(server_id) = frame.server_id().map(str::to_string) else {
            tracing::debug!("ignoring unknown control frame");
            return;
        };
        let request_id = frame.request_id().map(str::to_string);
        let span = tracing::info_span!("request", server_id = %server_id, request_id = ?request_id);

        async move {
            match self.execute(&server_id, frame).await {
                Ok(payload) => {
                    if let Some(id) = request_id {
                        self.events.emit(AgentToControlFrame::Resp {
                            id,
                            ok: true,
                            payload: Some(payload),
                        });
                    }
                }
                Err(err) => {
                    tracing::warn!(code = err.code(), error = %err, "request failed");
                    self.events.error(
                        &server_id,
                        request_id.as_deref(),
                        ErrorPayload::from(&err),
                    );
                }
            }
        }
        .instrument(span)
        .await
    }

    /// `server_id` is validated once here and is the only key used below,
    /// for the registry and the sandbox alike.
    async fn execute(
        &self,
        server_id: &str,
        frame: ControlToAgentFrame,
    ) -> Result<Value, DispatchError> {
        let server_id = normalize_server_id(server_id)?;
        if self.supervisor.is_shutting_down().await {
            return Err(SupervisorError::ShuttingDown(server_id.to_string()).into());
        }

        match frame {
            ControlToAgentFrame::Create { .. } => self.create(server_id).await,
            ControlToAgentFrame::Install {
                recipe, variables, ..
            } => self.install(server_id, &recipe, &variables).await,
            ControlToAgentFrame::Power { action, config, .. } => {
                self.power(server_id, action, config.as_ref()).await
            }
            ControlToAgentFrame::Command { line, .. } => {
                let delivered = self.supervisor.send_command(server_id, &line).await;
                Ok(json!({ "delivered": delivered }))
            }
            ControlToAgentFrame::Delete { .. } => self.delete(server_id).await,
            ControlToAgentFrame::Unknown => Ok(Value::Null),
        }
    }

    async fn create(&self, server_id: &str) -> Result<Value, DispatchError> {
        let root = self.sandbox.server_root(server_id)?;
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| DispatchError::Io {
                server_id: server_id.to_string(),
                op: "create",
                source,
            })?;
        tracing::info!(root = %root.display(), "server root ready");
        Ok(json!({ "root": root.display().to_string() }))
    }

    async fn install(
        &self,
        server_id: &str,
        recipe: &InstallRecipe,
        variables: &BTreeMap<String, String>,
    ) -> Result<Value, DispatchError> {
        let events = self.events.clone();
        let exit = self
            .installer
            .install(server_id, recipe, variables, |line: &str| {
                events.console(server_id, line, OutputStream::Stdout)
            })
            .await?;
        Ok(json!({ "exit_code": exit.code }))
    }

    async fn power(
        &self,
        server_id: &str,
        action: PowerAction,
        config: Option<&RuntimeConfig>,
    ) -> Result<Value, DispatchError> {
        let need_config = || {
            config.ok_or_else(|| DispatchError::MissingConfig {
                server_id: server_id.to_string(),
                action: action_name(action),
            })
        };

        match action {
            PowerAction::Start => {
                let pid = self.supervisor.start(server_id, need_config()?).await?;
                Ok(json!({ "pid": pid }))
            }
            PowerAction::Restart => {
                let pid = self.supervisor.restart(server_id, need_config()?).await?;
                Ok(json!({ "pid": pid }))
            }
            PowerAction::Stop => {
                let outcome = self.supervisor.stop(server_id).await?;
                Ok(json!({
                    "forced": outcome.forced,
                    "exit_code": outcome.exit.and_then(|e| e.code),
                    "signal": outcome.exit.and_then(|e| e.signal),
                }))
            }
            PowerAction::Kill => {
                self.supervisor.kill(server_id).await?;
                Ok(json!({ "killed": true }))
            }
        }
    }

    async fn delete(&self, server_id: &str) -> Result<Value, DispatchError> {
        let root = self.sandbox.server_root(server_id)?;
        match self.supervisor.kill(server_id).await {
            Ok(()) | Err(SupervisorError::NotRunning(_)) => {}
            Err(e) => return Err(e.into()),
        }

        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(DispatchError::Io {
                    server_id: server_id.to_string(),
                    op: "delete",
                    source,
                });
            }
        }
        tracing::info!(root = %root.display(), "server deleted");
        Ok(json!({ "deleted": true }))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use kiln_process::ServerStatus;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::registry::Registry;
    use crate::supervisor::SupervisorSettings;

    struct Harness {
        dispatcher: Dispatcher,
        supervisor: Supervisor,
        sandbox: FileSandbox,
        events: UnboundedReceiver<AgentToControlFrame>,
        _tmp: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let (sink, events) = EventSink::channel();
        let registry = Registry::new();
        let sandbox = FileSandbox::new(tmp.path().join("servers"));
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
        let installer = Installer::new(registry, sandbox.clone());
        Harness {
            dispatcher: Dispatcher::new(supervisor.clone(), sandbox.clone(), installer, sink),
            supervisor,
            sandbox,
            events,
            _tmp: tmp,
        }
    }

    fn power(id: &str, action: PowerAction, command: Option<&str>) -> ControlToAgentFrame {
        ControlToAgentFrame::Power {
            id: Some(id.to_string()),
            server_id: "srv1".to_string(),
            action,
            config: command.map(|c| RuntimeConfig {
                command: c.to_string(),
                ..RuntimeConfig::default()
            }),
        }
    }

    async fn next_reply(rx: &mut UnboundedReceiver<AgentToControlFrame>) -> AgentToControlFrame {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(
                frame,
                AgentToControlFrame::Resp { .. } | AgentToControlFrame::Error { .. }
            ) {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn create_makes_root_and_replies() {
        let mut h = harness();
        h.dispatcher
            .handle(ControlToAgentFrame::Create {
                id: Some("r1".to_string()),
                server_id: "srv1".to_string(),
            })
            .await;

        match next_reply(&mut h.events).await {
            AgentToControlFrame::Resp { id, ok, .. } => {
                assert_eq!(id, "r1");
                assert!(ok);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(h.sandbox.server_root("srv1").unwrap().is_dir());
    }

    #[tokio::test]
    async fn start_without_config_is_an_error_frame() {
        let mut h = harness();
        h.dispatcher
            .handle(power("r1", PowerAction::Start, None))
            .await;

        match next_reply(&mut h.events).await {
            AgentToControlFrame::Error {
                server_id,
                request_id,
                error,
            } => {
                assert_eq!(server_id, "srv1");
                assert_eq!(request_id.as_deref(), Some("r1"));
                assert_eq!(error.code, "missing_config");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_start_reports_already_running() {
        let mut h = harness();
        h.dispatcher
            .handle(power("r1", PowerAction::Start, Some("sleep 30")))
            .await;
        assert!(matches!(
            next_reply(&mut h.events).await,
            AgentToControlFrame::Resp { ok: true, .. }
        ));

        h.dispatcher
            .handle(power("r2", PowerAction::Start, Some("sleep 30")))
            .await;
        match next_reply(&mut h.events).await {
            AgentToControlFrame::Error { error, .. } => assert_eq!(error.code, "already_running"),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(h.supervisor.list().await.len(), 1);

        h.supervisor.kill("srv1").await.unwrap();
    }

    #[tokio::test]
    async fn command_reports_delivery() {
        let mut h = harness();
        h.dispatcher
            .handle(ControlToAgentFrame::Command {
                id: Some("r1".to_string()),
                server_id: "srv1".to_string(),
                line: "say hi".to_string(),
            })
            .await;

        match next_reply(&mut h.events).await {
            AgentToControlFrame::Resp { payload, .. } => {
                assert_eq!(payload, Some(json!({ "delivered": false })));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn install_relays_progress_as_console() {
        let mut h = harness();
        h.dispatcher
            .handle(ControlToAgentFrame::Install {
                id: Some("r1".to_string()),
                server_id: "srv1".to_string(),
                recipe: InstallRecipe {
                    script: "echo fetching\n".to_string(),
                    entrypoint: None,
                },
                variables: BTreeMap::new(),
            })
            .await;

        let mut saw_progress = false;
        loop {
            match h.events.recv().await.unwrap() {
                AgentToControlFrame::Console { line, .. } if line == "fetching" => {
                    saw_progress = true
                }
                AgentToControlFrame::Resp { ok, .. } => {
                    assert!(ok);
                    break;
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert!(saw_progress);
    }

    #[tokio::test]
    async fn delete_kills_and_removes_root() {
        let mut h = harness();
        h.dispatcher
            .handle(power("r1", PowerAction::Start, Some("sleep 30")))
            .await;
        next_reply(&mut h.events).await;
        let root = h.sandbox.server_root("srv1").unwrap();
        assert!(root.is_dir());

        h.dispatcher
            .handle(ControlToAgentFrame::Delete {
                id: Some("r2".to_string()),
                server_id: "srv1".to_string(),
            })
            .await;
        assert!(matches!(
            next_reply(&mut h.events).await,
            AgentToControlFrame::Resp { ok: true, .. }
        ));
        assert!(!root.exists());
        assert_eq!(h.supervisor.status("srv1").await, ServerStatus::Offline);

        // Deleting an absent server is fine.
        h.dispatcher
            .handle(ControlToAgentFrame::Delete {
                id: Some("r3".to_string()),
                server_id: "srv1".to_string(),
            })
            .await;
        assert!(matches!(
            next_reply(&mut h.events).await,
            AgentToControlFrame::Resp { ok: true, .. }
        ));
    }

    #[tokio::test]
    async fn success_without_request_id_sends_no_resp() {
        let mut h = harness();
        h.dispatcher
            .handle(ControlToAgentFrame::Create {
                id: None,
                server_id: "srv1".to_string(),
            })
            .await;
        h.dispatcher.handle(ControlToAgentFrame::Unknown).await;
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_server_id_is_access_error() {
        let mut h = harness();
        h.dispatcher
            .handle(ControlToAgentFrame::Create {
                id: Some("r1".to_string()),
                server_id: "../../etc".to_string(),
            })
            .await;
        match next_reply(&mut h.events).await {
            AgentToControlFrame::Error { error, .. } => assert_eq!(error.code, "invalid_server_id"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn padded_delete_leaves_running_server_alone() {
        let mut h = harness();
        h.dispatcher
            .handle(power("r1", PowerAction::Start, Some("sleep 30")))
            .await;
        next_reply(&mut h.events).await;
        let root = h.sandbox.server_root("srv1").unwrap();

        for padded in [" srv1", "srv1 "] {
            h.dispatcher
                .handle(ControlToAgentFrame::Delete {
                    id: Some("r2".to_string()),
                    server_id: padded.to_string(),
                })
                .await;
            match next_reply(&mut h.events).await {
                AgentToControlFrame::Error {
                    server_id, error, ..
                } => {
                    assert_eq!(server_id, padded);
                    assert_eq!(error.code, "invalid_server_id");
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert!(root.is_dir());
        assert_ne!(h.supervisor.status("srv1").await, ServerStatus::Offline);

        h.supervisor.kill("srv1").await.unwrap();
    }

    #[tokio::test]
    async fn frames_are_refused_once_shutdown_begins() {
        let mut h = harness();
        h.supervisor.shutdown().await;

        h.dispatcher
            .handle(power("r1", PowerAction::Start, Some("sleep 30")))
            .await;
        match next_reply(&mut h.events).await {
            AgentToControlFrame::Error {
                request_id, error, ..
            } => {
                assert_eq!(request_id.as_deref(), Some("r1"));
                assert_eq!(error.code, "shutting_down");
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        h.dispatcher
            .handle(ControlToAgentFrame::Create {
                id: Some("r2".to_string()),
                server_id: "srv2".to_string(),
            })
            .await;
        match next_reply(&mut h.events).await {
            AgentToControlFrame::Error { error, .. } => assert_eq!(error.code, "shutting_down"),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(h.supervisor.list().await.is_empty());
        assert!(!h.sandbox.server_root("srv2").unwrap().exists());
    }
}
