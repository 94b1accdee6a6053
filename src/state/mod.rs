//! Persistent run records and per-table checkpoints, used to resume a run.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::value::Value;
use crate::error::CheckpointError;

pub mod file_store;
#[cfg(test)]
pub mod memory_store;

pub use file_store::FileCheckpointStore;

/// Lifecycle state shared by runs and the tables inside them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pending,
    Running,
    Paused,
    Failed,
    Completed,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Status::Pending => "PENDING",
            Status::Running => "RUNNING",
            Status::Paused => "PAUSED",
            Status::Failed => "FAILED",
            Status::Completed => "COMPLETED",
        };
        f.pad(name)
    }
}

/// Last durable progress of one table within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Uuid,
    pub table: String,
    /// Key of the last committed row. `None` until the first batch commits.
    pub last_key: Option<Value>,
    pub committed_rows: u64,
    pub batch_seq: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn start(run_id: Uuid, table: &str) -> Self {
        Checkpoint {
            run_id,
            table: table.to_string(),
            last_key: None,
            committed_rows: 0,
            batch_seq: 0,
            updated_at: Utc::now(),
        }
    }

    /// Checkpoint after one more committed batch. The watermark must move strictly forward.
    pub fn advance(&self, last_key: Value, rows: u64) -> Result<Checkpoint, CheckpointError> {
        if let Some(previous) = &self.last_key {
            if last_key.compare_key(previous) != Some(Ordering::Greater) {
                return Err(CheckpointError::NotMonotonic {
                    table: self.table.clone(),
                    previous: previous.to_string(),
                    next: last_key.to_string(),
                });
            }
        }

        Ok(Checkpoint {
            run_id: self.run_id,
            table: self.table.clone(),
            last_key: Some(last_key),
            committed_rows: self.committed_rows + rows,
            batch_seq: self.batch_seq + 1,
            updated_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableState {
    pub status: Status,
    pub rows_committed: u64,
    pub rows_rejected: u64,
    pub error: Option<String>,
}

impl Default for TableState {
    fn default() -> Self {
        TableState {
            status: Status::Pending,
            rows_committed: 0,
            rows_rejected: 0,
            error: None,
        }
    }
}

/// Persisted record of a migration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRun {
    pub id: Uuid,
    pub tables: Vec<String>,
    pub state: Status,
    pub table_states: BTreeMap<String, TableState>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl MigrationRun {
    pub fn new(tables: Vec<String>) -> Self {
        let table_states = tables
            .iter()
            .map(|table| (table.clone(), TableState::default()))
            .collect();

        MigrationRun {
            id: Uuid::new_v4(),
            tables,
            state: Status::Pending,
            table_states,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn table_status(&self, table: &str) -> Status {
        self.table_states
            .get(table)
            .map(|state| state.status)
            .unwrap_or(Status::Pending)
    }

    pub fn update_table(&mut self, table: &str, update: impl FnOnce(&mut TableState)) {
        update(self.table_states.entry(table.to_string()).or_default());
    }

    pub fn mark_running(&mut self) {
        self.state = Status::Running;
        self.finished_at = None;
    }

    /// Derives the run state from its tables once every table task has ended.
    pub fn finish(&mut self) {
        let statuses: Vec<Status> = self
            .tables
            .iter()
            .map(|table| self.table_status(table))
            .collect();

        self.state = if statuses.iter().all(|status| *status == Status::Completed) {
            Status::Completed
        } else if statuses.contains(&Status::Failed) {
            Status::Failed
        } else {
            Status::Paused
        };
        self.finished_at = Some(Utc::now());
    }
}

/// Durable storage for run records and checkpoints.
///
/// Each checkpoint record is written by a single table task. Run records are
/// written by the coordinator only.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load_run(&self, run_id: Uuid) -> Result<MigrationRun, CheckpointError>;

    async fn save_run(&self, run: &MigrationRun) -> Result<(), CheckpointError>;

    async fn load_checkpoint(
        &self,
        run_id: Uuid,
        table: &str,
    ) -> Result<Option<Checkpoint>, CheckpointError>;

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoints_only_move_forward() {
        let start = Checkpoint::start(Uuid::new_v4(), "orders");
        let first = start.advance(Value::Int(100), 100).unwrap();
        let second = first.advance(Value::Int(200), 100).unwrap();

        assert_eq!(second.batch_seq, 2);
        assert_eq!(second.committed_rows, 200);

        let err = second.advance(Value::Int(200), 1).unwrap_err();
        assert!(matches!(err, CheckpointError::NotMonotonic { .. }));
        assert!(second.advance(Value::Int(150), 1).is_err());
    }

    #[test]
    fn run_state_follows_table_outcomes() {
        let mut run = MigrationRun::new(vec!["a".into(), "b".into()]);

        run.update_table("a", |state| state.status = Status::Completed);
        run.update_table("b", |state| state.status = Status::Paused);
        run.finish();
        assert_eq!(run.state, Status::Paused);

        run.update_table("b", |state| state.status = Status::Failed);
        run.finish();
        assert_eq!(run.state, Status::Failed);

        run.update_table("b", |state| state.status = Status::Completed);
        run.finish();
        assert_eq!(run.state, Status::Completed);
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn checkpoint_survives_json() {
        let checkpoint = Checkpoint::start(Uuid::new_v4(), "users")
            .advance(Value::Text("u-42".into()), 42)
            .unwrap();

        let json = serde_json::to_string(&checkpoint).unwrap();
        let restored: Checkpoint = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, checkpoint);
    }
}
