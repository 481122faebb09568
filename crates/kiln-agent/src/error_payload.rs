use kiln_process::ErrorPayload;

use crate::error::{DispatchError, SupervisorError};
use crate::installer::InstallError;

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

pub fn format_error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = Vec::<String>::new();
    let mut cur = Some(err);
    while let Some(e) = cur {
        let s = e.to_string();
        // thiserror messages often embed their source already.
        if !s.is_empty() && !parts.last().is_some_and(|last| last.contains(&s)) {
            parts.push(s);
        }
        cur = e.source();
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

pub fn encode(code: &str, message: impl Into<String>, hint: Option<&str>) -> ErrorPayload {
    ErrorPayload {
        code: code.to_string(),
        message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
        hint: hint.map(|h| truncate_utf8(h, MAX_HINT_BYTES)),
    }
}

impl From<&SupervisorError> for ErrorPayload {
    fn from(err: &SupervisorError) -> Self {
        encode(err.code(), format_error_chain(err), err.hint())
    }
}

impl From<&InstallError> for ErrorPayload {
    fn from(err: &InstallError) -> Self {
        encode(err.code(), format_error_chain(err), None)
    }
}

impl From<&DispatchError> for ErrorPayload {
    fn from(err: &DispatchError) -> Self {
        encode(err.code(), format_error_chain(err), err.hint())
    }
}
