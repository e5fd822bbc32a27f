//! Parquet-backed checkpoint store.
//!
//! Layout: `<root>/<run id>/<stage>.parquet`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use super::CheckpointStore;
use crate::dataset::{columnar, Dataset};
use crate::error::CheckpointError;
use crate::pipeline::{RunId, Stage};

/// Stores each stage output as a ZSTD-compressed Parquet file.
#[derive(Debug, Clone)]
pub struct ParquetCheckpointStore {
    root: PathBuf,
}

impl ParquetCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run: &RunId) -> PathBuf {
        self.root.join(run.to_string())
    }

    /// Path of the checkpoint file for `stage` of `run`.
    pub fn path_for(&self, run: &RunId, stage: Stage) -> PathBuf {
        self.run_dir(run).join(format!("{}.parquet", stage))
    }
}

#[async_trait]
impl CheckpointStore for ParquetCheckpointStore {
    async fn save(
        &self,
        run: &RunId,
        stage: Stage,
        dataset: &Dataset,
    ) -> Result<(), CheckpointError> {
        let batch = columnar::to_record_batch(dataset)?;
        let path = self.path_for(run, stage);
        let rows = batch.num_rows();

        let written = path.clone();
        tokio::task::spawn_blocking(move || write_batch(&written, &batch))
            .await
            .map_err(|e| CheckpointError::Io(std::io::Error::other(e)))??;

        tracing::debug!(path = %path.display(), rows, stage = %stage, "Checkpoint written");
        Ok(())
    }

    async fn load(&self, run: &RunId, stage: Stage) -> Result<Option<Dataset>, CheckpointError> {
        let path = self.path_for(run, stage);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }

        let batches = tokio::task::spawn_blocking(move || read_batches(&path))
            .await
            .map_err(|e| CheckpointError::Io(std::io::Error::other(e)))??;

        columnar::from_record_batches(&batches).map(Some)
    }

    async fn clear(&self, run: &RunId) -> Result<(), CheckpointError> {
        let dir = self.run_dir(run);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn write_batch(path: &Path, batch: &RecordBatch) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = std::fs::File::create(path)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(Default::default()))
        .build();

    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

/// Reads every batch, re-attaching the file's Arrow schema (with its
/// provenance metadata) to each one.
fn read_batches(path: &Path) -> Result<Vec<RecordBatch>, CheckpointError> {
    let file = std::fs::File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let schema = Arc::clone(builder.schema());
    let reader = builder.build()?;

    let mut batches = Vec::new();
    for batch in reader {
        let batch = batch?;
        batches.push(RecordBatch::try_new(
            Arc::clone(&schema),
            batch.columns().to_vec(),
        )?);
    }

    if batches.is_empty() {
        batches.push(RecordBatch::new_empty(schema));
    }
    Ok(batches)
}
