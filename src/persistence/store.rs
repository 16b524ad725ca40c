use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

use super::checkpoint::Checkpoint;
use crate::error::{BulwarkError, Result};

/// Durable destination for checkpoints. One record per component; saving
/// replaces the previous record.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn load(&self, checkpoint_type: &str, component: &str) -> Result<Option<Checkpoint>>;
}

/// One JSON file per component under a directory.
///
/// Writes go to a temporary file that is renamed over the target, so a crash
/// mid-write leaves the previous checkpoint intact.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, checkpoint_type: &str, component: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", Checkpoint::key(checkpoint_type, component)))
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&checkpoint.checkpoint_type, &checkpoint.component);
        let tmp = path.with_extension("json.tmp");

        let body = serde_json::to_vec_pretty(checkpoint)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(path = %path.display(), "checkpoint file replaced");
        Ok(())
    }

    async fn load(&self, checkpoint_type: &str, component: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(checkpoint_type, component);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&raw).map_err(|e| {
            BulwarkError::Persistence(format!("corrupt checkpoint {}: {}", path.display(), e))
        })?;
        Ok(Some(checkpoint))
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let key = Checkpoint::key(&checkpoint.checkpoint_type, &checkpoint.component);
        self.records.write().await.insert(key, checkpoint.clone());
        Ok(())
    }

    async fn load(&self, checkpoint_type: &str, component: &str) -> Result<Option<Checkpoint>> {
        let key = Checkpoint::key(checkpoint_type, component);
        Ok(self.records.read().await.get(&key).cloned())
    }
}
