//! Stage output checkpoints.
//!
//! Every stage of an orchestrated run saves its output dataset here, and
//! the next stage (or a retry of the next stage) reads its input back from
//! the store instead of re-running upstream work.
//!
//! Two stores are provided:
//! - [`MemoryCheckpointStore`]: process-local, the default
//! - [`ParquetCheckpointStore`]: one ZSTD-compressed Parquet file per run and stage
//!
//! # Usage
//!
//! ```rust,ignore
//! use sales_etl::checkpoint::{CheckpointStore, MemoryCheckpointStore};
//! use sales_etl::pipeline::{RunId, Stage};
//!
//! let store = MemoryCheckpointStore::new();
//! let run = RunId::today();
//! store.save(&run, Stage::Extract, &dataset).await?;
//! let restored = store.load(&run, Stage::Extract).await?;
//! ```

pub mod parquet_store;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::dataset::Dataset;
use crate::error::CheckpointError;
use crate::pipeline::{RunId, Stage};

pub use parquet_store::ParquetCheckpointStore;

/// Persists stage outputs for the duration of a run.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Stores the output of `stage`, replacing any earlier one.
    async fn save(&self, run: &RunId, stage: Stage, dataset: &Dataset)
        -> Result<(), CheckpointError>;

    /// Returns the stored output of `stage`, or `None` if there is none.
    async fn load(&self, run: &RunId, stage: Stage) -> Result<Option<Dataset>, CheckpointError>;

    /// Removes every checkpoint belonging to `run`.
    async fn clear(&self, run: &RunId) -> Result<(), CheckpointError>;
}

/// In-memory checkpoint store.
#[derive(Debug, Default, Clone)]
pub struct MemoryCheckpointStore {
    entries: Arc<Mutex<HashMap<(RunId, Stage), Dataset>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints across all runs.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(
        &self,
        run: &RunId,
        stage: Stage,
        dataset: &Dataset,
    ) -> Result<(), CheckpointError> {
        self.entries
            .lock()
            .await
            .insert((run.clone(), stage), dataset.clone());
        Ok(())
    }

    async fn load(&self, run: &RunId, stage: Stage) -> Result<Option<Dataset>, CheckpointError> {
        Ok(self
            .entries
            .lock()
            .await
            .get(&(run.clone(), stage))
            .cloned())
    }

    async fn clear(&self, run: &RunId) -> Result<(), CheckpointError> {
        self.entries.lock().await.retain(|(id, _), _| id != run);
        Ok(())
    }
}
