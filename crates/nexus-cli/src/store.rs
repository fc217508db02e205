//! File-backed checkpoint store: one JSON file per checkpoint.
//!
//! Writes go to a temp file first and land by rename, so a crash never
//! leaves a half-written checkpoint behind. File names lead with the
//! creation timestamp, so a lexicographic listing is chronological.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use uuid::Uuid;

use nexus_core::checkpoint::Checkpoint;
use nexus_core::host::PersistenceGateway;

/// Platform-default state directory for checkpoints.
pub fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("nexus")
        .join("checkpoints")
}

/// JSON-file implementation of [`PersistenceGateway`].
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create state dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn entries(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read state dir {}", self.dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".json") {
                entries.push((name, entry.path()));
            }
        }
        entries.sort();
        Ok(entries)
    }
}

#[async_trait]
impl PersistenceGateway for JsonFileStore {
    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let name = format!(
            "{}-{}.json",
            checkpoint.created_at.format("%Y%m%dT%H%M%S%.3f"),
            checkpoint.id.simple()
        );
        let json = serde_json::to_vec_pretty(checkpoint)?;

        let tmp = self.dir.join(format!(".{name}.tmp"));
        let path = self.dir.join(&name);
        std::fs::write(&tmp, &json)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to commit {}", path.display()))?;
        tracing::debug!(checkpoint_id = %checkpoint.id, path = %path.display(), "checkpoint stored");
        Ok(())
    }

    async fn read_checkpoint(&self, id: Uuid) -> Result<Option<Checkpoint>> {
        let needle = format!("{}.json", id.simple());
        for (name, path) in self.entries()? {
            if name.ends_with(&needle) {
                let json = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let checkpoint = serde_json::from_str(&json)
                    .with_context(|| format!("corrupt checkpoint {}", path.display()))?;
                return Ok(Some(checkpoint));
            }
        }
        Ok(None)
    }

    async fn list_checkpoints(&self) -> Result<Vec<Uuid>> {
        let mut ids = Vec::new();
        for (name, _) in self.entries()? {
            // <timestamp>-<uuid-simple>.json
            let Some(hex) = name
                .trim_end_matches(".json")
                .rsplit('-')
                .next()
            else {
                continue;
            };
            if let Ok(id) = Uuid::parse_str(hex) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nexus_core::plan::{Plan, Task};

    fn checkpoint() -> Checkpoint {
        let plan = Plan::new("store-test", vec![Task::new("T1", "one")]);
        Checkpoint::capture(&plan, Utc::now())
    }

    #[tokio::test]
    async fn write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();

        let cp = checkpoint();
        store.write_checkpoint(&cp).await.unwrap();

        let back = store
            .read_checkpoint(cp.id)
            .await
            .unwrap()
            .expect("checkpoint present");
        assert_eq!(back.id, cp.id);
        assert_eq!(back.task_statuses, cp.task_statuses);
        assert_eq!(back.plan.name, "store-test");
    }

    #[tokio::test]
    async fn missing_checkpoint_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        assert!(store.read_checkpoint(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_chronological() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();

        let mut first = checkpoint();
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let second = checkpoint();
        store.write_checkpoint(&second).await.unwrap();
        store.write_checkpoint(&first).await.unwrap();

        let ids = store.list_checkpoints().await.unwrap();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        store.write_checkpoint(&checkpoint()).await.unwrap();

        let stray: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(stray.is_empty());
    }
}
