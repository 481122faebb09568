use kiln_process::OutputStream;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::event_sink::EventSink;

/// Forwards every non-empty line of `reader` as a console event.
///
/// Lines split across reads are joined by the buffered reader. Invalid UTF-8
/// is replaced instead of ending the stream.
pub async fn relay_lines<R>(reader: R, server_id: String, stream: OutputStream, sink: EventSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\n', '\r']);
                if line.is_empty() {
                    continue;
                }
                sink.console(&server_id, line, stream);
            }
            Err(e) => {
                tracing::debug!(server_id = %server_id, ?stream, error = %e, "output stream closed with error");
                break;
            }
        }
    }
}

pub fn spawn_relay<R>(reader: R, server_id: &str, stream: OutputStream, sink: EventSink)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(relay_lines(reader, server_id.to_string(), stream, sink));
}
