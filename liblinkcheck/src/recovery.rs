use crate::types::Set;
use serde::{Deserialize, Serialize};
use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::warn;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("recovery file i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("recovery file is not valid: {0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct PendingTask {
    set: Set,
}

/// Reads the unprocessed sets left by a previous run. A missing file is empty.
pub async fn load(path: &Path) -> Result<Vec<Set>, RecoveryError> {
    let data = match tokio::fs::read(path).await {
        Ok(d) => d,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let tasks: Vec<PendingTask> = serde_json::from_slice(&data)?;
    Ok(tasks.into_iter().map(|t| t.set).collect())
}

/// Replaces the file with exactly `sets`.
///
/// Written to a sibling file first and renamed over, so a crash leaves
/// either the old document or the new one.
pub async fn save(path: &Path, sets: &[Set]) -> Result<(), RecoveryError> {
    let tasks: Vec<PendingTask> = sets
        .iter()
        .cloned()
        .map(|set| PendingTask { set })
        .collect();
    let data = serde_json::to_vec_pretty(&tasks)?;

    let staging = staging_path(path);
    let mut file = tokio::fs::File::create(&staging).await?;
    file.write_all(&data).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&staging, path).await?;
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Read-modify-rewrite: existing entries are kept, `sets` go last.
///
/// Unreadable existing content is dropped with a warning rather than
/// blocking the new entries.
pub async fn append(path: &Path, sets: &[Set]) -> Result<(), RecoveryError> {
    let mut all = match load(path).await {
        Ok(existing) => existing,
        Err(RecoveryError::Format(e)) => {
            warn!(path = %path.display(), error = %e, "discarding unreadable recovery file");
            Vec::new()
        }
        Err(e) => return Err(e),
    };
    all.extend_from_slice(sets);
    save(path, &all).await
}

pub async fn remove(path: &Path) -> Result<(), RecoveryError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
