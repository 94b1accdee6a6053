use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

use crate::error::CheckpointError;
use crate::state::{Checkpoint, CheckpointStore, MigrationRun};

const RUN_FILE: &str = "run.json";
const CHECKPOINT_SUFFIX: &str = "checkpoint.json";

/// Stores one directory per run: `run.json` plus one `<table>.checkpoint.json` per table.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileCheckpointStore { root: root.into() }
    }

    fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    fn checkpoint_path(&self, run_id: Uuid, table: &str) -> PathBuf {
        let file_name = format!("{}.{}", sanitize(table), CHECKPOINT_SUFFIX);
        self.run_dir(run_id).join(file_name)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load_run(&self, run_id: Uuid) -> Result<MigrationRun, CheckpointError> {
        let path = self.run_dir(run_id).join(RUN_FILE);
        read_json(&path)
            .await?
            .ok_or_else(|| CheckpointError::RunNotFound(run_id.to_string()))
    }

    async fn save_run(&self, run: &MigrationRun) -> Result<(), CheckpointError> {
        write_json(&self.run_dir(run.id).join(RUN_FILE), run).await
    }

    async fn load_checkpoint(
        &self,
        run_id: Uuid,
        table: &str,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        read_json(&self.checkpoint_path(run_id, table)).await
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.checkpoint_path(checkpoint.run_id, &checkpoint.table);
        write_json(&path, checkpoint).await
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, CheckpointError> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

// Write to a sibling temp file, then rename over the target so readers never see a torn record.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let content = serde_json::to_vec_pretty(value)?;
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content).await?;
    fs::rename(&temp_path, path).await?;

    Ok(())
}

fn sanitize(table: &str) -> String {
    table
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
