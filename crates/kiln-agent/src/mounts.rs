use std::path::{Path, PathBuf};

use anyhow::Context;
use kiln_process::MountSpec;

use crate::file_sandbox::normalize_rel_path;

async fn clear_target(target: &Path) -> anyhow::Result<()> {
    let meta = match tokio::fs::symlink_metadata(target).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("stat {}", target.display())),
    };

    // symlink_metadata does not follow links, so a linked directory is removed
    // as a link and its source is never touched.
    if meta.is_dir() {
        tokio::fs::remove_dir_all(target)
            .await
            .with_context(|| format!("remove directory {}", target.display()))
    } else {
        tokio::fs::remove_file(target)
            .await
            .with_context(|| format!("remove {}", target.display()))
    }
}

async fn link_one(root: &Path, mount: &MountSpec) -> anyhow::Result<PathBuf> {
    let rel = normalize_rel_path(&mount.target)?;
    if rel.as_os_str().is_empty() {
        anyhow::bail!("mount target must not be the server root");
    }
    let target = root.join(rel);
    let source = PathBuf::from(&mount.source);

    tokio::fs::metadata(&source)
        .await
        .with_context(|| format!("mount source {}", source.display()))?;

    clear_target(&target).await?;

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }

    #[cfg(unix)]
    tokio::fs::symlink(&source, &target)
        .await
        .with_context(|| format!("link {} -> {}", target.display(), source.display()))?;

    #[cfg(not(unix))]
    anyhow::bail!("directory mounts require a unix host");

    Ok(target)
}

/// Links every mount into `root`, returning one warning per failed mount.
///
/// `read_only` is recorded in the log only; a symlink grants the same access
/// as the source directory.
pub async fn prepare_mounts(server_id: &str, root: &Path, mounts: &[MountSpec]) -> Vec<String> {
    let mut warnings = Vec::new();
    for mount in mounts {
        match link_one(root, mount).await {
            Ok(target) => {
                tracing::debug!(
                    server_id,
                    source = %mount.source,
                    target = %target.display(),
                    read_only = mount.read_only,
                    "mount linked"
                );
                if mount.read_only {
                    tracing::warn!(
                        server_id,
                        target = %mount.target,
                        "read-only mount is not enforced by a directory symlink"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(server_id, target = %mount.target, error = %format!("{e:#}"), "mount failed");
                warnings.push(format!(
                    "[kiln] mount {} -> {} failed: {e:#}",
                    mount.target, mount.source
                ));
            }
        }
    }
    warnings
}
