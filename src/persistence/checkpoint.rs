//! Checkpoint Service
//!
//! Durable snapshots for crash recovery. Checkpoints are created:
//! - On a regular interval by the owning task
//! - After state changes that must survive a restart (e.g. a stop adjustment)
//! - Before shutdown

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};

use super::store::SnapshotStore;
use crate::error::{BulwarkError, Result};

/// Checkpoint data structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_type: String,
    pub component: String,
    pub data: serde_json::Value,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Store key for a component
    pub fn key(checkpoint_type: &str, component: &str) -> String {
        format!("{}__{}", checkpoint_type, component)
    }
}

/// Trait for types that can be checkpointed
pub trait Checkpointable: Send + Sync {
    /// Get checkpoint type identifier
    fn checkpoint_type(&self) -> &str;

    /// Get component name
    fn component_name(&self) -> &str;

    /// Serialize current state to JSON
    fn to_checkpoint(&self) -> Result<serde_json::Value>;

    /// Restore state from checkpoint
    fn from_checkpoint(&mut self, data: &serde_json::Value) -> Result<()>;

    /// Monotonic version, bumped by every mutation
    fn version(&self) -> i64;
}

/// Writes and restores checkpoints through a [`SnapshotStore`]
#[derive(Clone)]
pub struct CheckpointService {
    store: Arc<dyn SnapshotStore>,
}

impl CheckpointService {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self { store }
    }

    /// Create a checkpoint for a component
    pub async fn create_checkpoint<T: Checkpointable + ?Sized>(&self, component: &T) -> Result<()> {
        let checkpoint = Checkpoint {
            checkpoint_type: component.checkpoint_type().to_string(),
            component: component.component_name().to_string(),
            data: component.to_checkpoint()?,
            version: component.version(),
            created_at: Utc::now(),
        };

        self.store.save(&checkpoint).await?;
        debug!(
            checkpoint_type = %checkpoint.checkpoint_type,
            component = %checkpoint.component,
            version = checkpoint.version,
            "checkpoint written"
        );
        Ok(())
    }

    /// Restore a component from its latest checkpoint.
    ///
    /// Returns `Ok(false)` when no checkpoint exists yet.
    pub async fn restore_checkpoint<T: Checkpointable + ?Sized>(&self, component: &mut T) -> Result<bool> {
        let checkpoint_type = component.checkpoint_type().to_string();
        let component_name = component.component_name().to_string();

        let Some(checkpoint) = self.store.load(&checkpoint_type, &component_name).await? else {
            debug!(%checkpoint_type, component = %component_name, "no checkpoint found");
            return Ok(false);
        };

        match component.from_checkpoint(&checkpoint.data) {
            Ok(()) => {
                info!(
                    %checkpoint_type,
                    component = %component_name,
                    version = checkpoint.version,
                    created_at = %checkpoint.created_at,
                    "restored checkpoint"
                );
                Ok(true)
            }
            Err(e) => {
                error!(
                    %checkpoint_type,
                    component = %component_name,
                    error = %e,
                    "failed to restore checkpoint"
                );
                Err(BulwarkError::Persistence(format!(
                    "checkpoint restore failed for {}/{}: {}",
                    checkpoint_type, component_name, e
                )))
            }
        }
    }

    /// Check if a checkpoint exists for a component
    pub async fn has_checkpoint(&self, checkpoint_type: &str, component: &str) -> Result<bool> {
        Ok(self.store.load(checkpoint_type, component).await?.is_some())
    }
}
