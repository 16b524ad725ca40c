//! Crash-recovery snapshots

pub mod checkpoint;
pub mod store;

pub use checkpoint::{Checkpoint, CheckpointService, Checkpointable};
pub use store::{JsonFileStore, MemoryStore, SnapshotStore};
