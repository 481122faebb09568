use kiln_process::{AgentToControlFrame, ErrorPayload, OutputStream, ServerStatus};
use tokio::sync::mpsc;

/// Multiplexed outbound event queue shared by every server.
///
/// Unbounded so producers (output relays, exit watchers) never apply
/// backpressure to a child's pipes.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<AgentToControlFrame>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentToControlFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, frame: AgentToControlFrame) {
        // Receiver only goes away during agent shutdown.
        let _ = self.tx.send(frame);
    }

    pub fn status(&self, server_id: &str, status: ServerStatus) {
        self.emit(AgentToControlFrame::Status {
            server_id: server_id.to_string(),
            status,
        });
    }

    pub fn console(&self, server_id: &str, line: impl Into<String>, stream: OutputStream) {
        self.emit(AgentToControlFrame::Console {
            server_id: server_id.to_string(),
            line: line.into(),
            stream,
        });
    }

    /// Console line written by the agent itself.
    pub fn notice(&self, server_id: &str, line: impl Into<String>) {
        self.console(server_id, line, OutputStream::Agent);
    }

    pub fn error(&self, server_id: &str, request_id: Option<&str>, error: ErrorPayload) {
        self.emit(AgentToControlFrame::Error {
            server_id: server_id.to_string(),
            request_id: request_id.map(str::to_string),
            error,
        });
    }
}
