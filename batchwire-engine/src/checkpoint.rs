//! Registry checkpoints
//!
//! Snapshots are stored as pretty-printed JSON. Writes go to a temporary
//! sibling file first and are renamed into place, so a crash mid-write never
//! leaves a truncated checkpoint behind.

use anyhow::{Context, Result};
use batchwire_core::dto::snapshot::RegistrySnapshot;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "checkpoint".into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Writes a snapshot to `path`, replacing any previous checkpoint
pub async fn save(path: &Path, snapshot: &RegistrySnapshot) -> Result<()> {
    let json =
        serde_json::to_vec_pretty(snapshot).context("Failed to serialize registry snapshot")?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let tmp = temp_path(path);
    tokio::fs::write(&tmp, json)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move checkpoint into {}", path.display()))?;

    debug!(
        "Checkpointed {} job record(s) to {}",
        snapshot.records.len(),
        path.display()
    );
    Ok(())
}

/// Reads a checkpoint; `None` when none has been written yet
pub async fn load(path: &Path) -> Result<Option<RegistrySnapshot>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No checkpoint at {}", path.display());
            return Ok(None);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };

    let snapshot: RegistrySnapshot = serde_json::from_slice(&bytes)
        .with_context(|| format!("Invalid checkpoint {}", path.display()))?;
    snapshot.check_version()?;

    Ok(Some(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchwire_core::domain::handle::{BackendKind, JobHandle};
    use batchwire_core::domain::job::JobSpec;
    use batchwire_core::domain::record::JobRecord;

    fn snapshot() -> RegistrySnapshot {
        RegistrySnapshot::new(vec![JobRecord::submitted(
            JobSpec::new("j1", "true"),
            JobHandle::new(BackendKind::Lsf, "42"),
            0,
        )])
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("registry.json");
        let snapshot = snapshot();

        save(&path, &snapshot).await.unwrap();
        assert!(!temp_path(&path).exists());

        let loaded = load(&path).await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn test_missing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("none.json")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_garbage_and_foreign_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(load(&path).await.is_err());

        let mut future = snapshot();
        future.version = 99;
        tokio::fs::write(&path, serde_json::to_vec(&future).unwrap())
            .await
            .unwrap();
        assert!(load(&path).await.is_err());
    }

    #[test]
    fn test_temp_path() {
        assert_eq!(
            temp_path(Path::new("/var/lib/bw/registry.json")),
            PathBuf::from("/var/lib/bw/registry.json.tmp")
        );
    }
}
