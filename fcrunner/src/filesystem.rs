use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::config::LogConfig;

/// Recreate every log directory empty and delete stale temp files.
pub async fn cleanup(logs: &LogConfig) -> Result<()> {
    for dir in logs.log_dirs() {
        empty_dir(&dir)
            .await
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    }

    let mut removed = 0;
    for prefix in &logs.temp_prefixes {
        removed += remove_prefixed(&logs.temp_dir, prefix)
            .await
            .with_context(|| format!("failed to clean up {} files", prefix))?;
    }

    info!(removed, temp_dir = %logs.temp_dir.display(), "filesystem cleaned up");
    Ok(())
}

/// Remove `dir` (if present) and create it again, empty.
pub async fn empty_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("failed to remove {}", dir.display())),
    }
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))
}

/// Delete files (and sockets) directly in `dir` whose names start with
/// `prefix`. Returns how many were removed.
pub async fn remove_prefixed(dir: &Path, prefix: &str) -> Result<usize> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read {}", dir.display()))?;

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(prefix) {
            continue;
        }
        let file_type = entry.file_type().await?;
        if file_type.is_dir() {
            continue;
        }
        let path = entry.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "removed temp file");
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("failed to remove {}", path.display())),
        }
    }
    Ok(removed)
}
