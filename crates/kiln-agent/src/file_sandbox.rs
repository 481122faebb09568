use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SandboxError {
    #[error("server_id must be non-empty")]
    EmptyServerId,
    #[error("invalid server_id: {0}")]
    InvalidServerId(String),
    #[error("access denied: {0} escapes the server root")]
    AccessDenied(String),
}

impl SandboxError {
    pub fn code(&self) -> &'static str {
        match self {
            SandboxError::EmptyServerId | SandboxError::InvalidServerId(_) => "invalid_server_id",
            SandboxError::AccessDenied(_) => "access_denied",
        }
    }
}

/// Maps server ids and root-relative paths onto the data root.
#[derive(Debug, Clone)]
pub struct FileSandbox {
    servers_dir: PathBuf,
}

/// Validates a server id as given. Ids are never trimmed, so a padded id is
/// rejected rather than aliased onto another server's root.
pub(crate) fn normalize_server_id(id: &str) -> Result<&str, SandboxError> {
    if id.is_empty() {
        return Err(SandboxError::EmptyServerId);
    }

    // Server ids become directory names.
    if matches!(id, "." | "..")
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(SandboxError::InvalidServerId(id.to_string()));
    }

    Ok(id)
}

pub(crate) fn normalize_rel_path(rel: &str) -> Result<PathBuf, SandboxError> {
    if rel.is_empty() {
        return Ok(PathBuf::new());
    }

    let p = Path::new(rel);
    if p.is_absolute() {
        return Err(SandboxError::AccessDenied(rel.to_string()));
    }

    // Deny parent traversal and any prefix component.
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir | Component::Prefix(_) | Component::RootDir => {
                return Err(SandboxError::AccessDenied(rel.to_string()));
            }
        }
    }

    Ok(out)
}

impl FileSandbox {
    pub fn new(servers_dir: impl Into<PathBuf>) -> Self {
        Self {
            servers_dir: servers_dir.into(),
        }
    }

    pub fn server_root(&self, server_id: &str) -> Result<PathBuf, SandboxError> {
        let id = normalize_server_id(server_id)?;
        Ok(self.servers_dir.join(id))
    }

    /// Resolves `relative_path` inside the server's root.
    ///
    /// The result is lexically contained in the root; symlinks placed by
    /// mounts are followed by the OS, not by this check.
    pub fn resolve(&self, server_id: &str, relative_path: &str) -> Result<PathBuf, SandboxError> {
        let root = self.server_root(server_id)?;
        let rel = normalize_rel_path(relative_path)?;
        Ok(root.join(rel))
    }
}
