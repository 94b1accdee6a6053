use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::CheckpointError;
use crate::state::{Checkpoint, CheckpointStore, MigrationRun};

/// Keeps records in memory and remembers every checkpoint ever saved.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    runs: Mutex<HashMap<Uuid, MigrationRun>>,
    checkpoints: Mutex<HashMap<(Uuid, String), Checkpoint>>,
    history: Mutex<Vec<Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn history(&self, table: &str) -> Vec<Checkpoint> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|checkpoint| checkpoint.table == table)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load_run(&self, run_id: Uuid) -> Result<MigrationRun, CheckpointError> {
        self.runs
            .lock()
            .unwrap()
            .get(&run_id)
            .cloned()
            .ok_or_else(|| CheckpointError::RunNotFound(run_id.to_string()))
    }

    async fn save_run(&self, run: &MigrationRun) -> Result<(), CheckpointError> {
        self.runs.lock().unwrap().insert(run.id, run.clone());
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        run_id: Uuid,
        table: &str,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self
            .checkpoints
            .lock()
            .unwrap()
            .get(&(run_id, table.to_string()))
            .cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.checkpoints.lock().unwrap().insert(
            (checkpoint.run_id, checkpoint.table.clone()),
            checkpoint.clone(),
        );
        self.history.lock().unwrap().push(checkpoint.clone());
        Ok(())
    }
}
