use std::sync::Arc;

use tokio::time::Instant;

use crate::common::schema::TableSpec;
use crate::common::value::Row;
use crate::connection::{ConnectionProvider, Role};
use crate::error::{ClientError, RejectedRow, TargetWriteError};
use crate::extract::extractor::Batch;
use crate::migrate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOutcome {
    pub committed: u64,
    pub rejected: Vec<RejectedRow>,
}

/// Commits batches of coerced rows into the target table.
#[derive(Clone)]
pub struct BatchWriter {
    provider: ConnectionProvider,
    spec: Arc<TableSpec>,
    columns: Vec<String>,
    retry: RetryPolicy,
}

impl BatchWriter {
    pub fn new(provider: ConnectionProvider, spec: Arc<TableSpec>, retry: RetryPolicy) -> Self {
        let columns = spec.target_column_names();
        BatchWriter {
            provider,
            spec,
            columns,
            retry,
        }
    }

    /// Creates the target table when it does not exist yet.
    pub async fn ensure_table(&self) -> Result<(), TargetWriteError> {
        let table = &self.spec.target_name;
        let what = format!("Creating table {}", table);

        self.retry
            .run(&what, || async move {
                let mut conn = self.provider.acquire(Role::Target).await?;
                conn.create_table(&self.spec)
                    .await
                    .map_err(|err| TargetWriteError::write(table, err))
            })
            .await
    }

    /// Writes one batch. Returns once the target acknowledged every row that was
    /// sent. Rows that cannot be coerced are rejected up front. When the target
    /// refuses the values of an insert, the rows are split in halves until the
    /// refused rows are isolated and everything else is committed.
    pub async fn write(&self, batch: &Batch) -> Result<WriteOutcome, TargetWriteError> {
        let start_time = Instant::now();
        let mut outcome = WriteOutcome::default();
        let mut rows = Vec::with_capacity(batch.rows.len());

        for row in &batch.rows {
            match self.spec.coerce_row(row.clone()) {
                Ok(coerced) => rows.push(coerced),
                Err(reason) => outcome.rejected.push(self.reject(row, reason)),
            }
        }

        if !rows.is_empty() {
            self.insert_bisecting(rows, &mut outcome).await?;
        }

        debug!(
            "{}: committed batch {} ({} to {}) with {} rows, took: {}s",
            self.spec.target_name,
            batch.seq,
            batch.first_key,
            batch.last_key,
            outcome.committed,
            start_time.elapsed().as_secs_f32()
        );

        Ok(outcome)
    }

    async fn insert_bisecting(
        &self,
        rows: Vec<Row>,
        outcome: &mut WriteOutcome,
    ) -> Result<(), TargetWriteError> {
        // Left halves are popped first, so rows still commit in key order.
        let mut pending = vec![rows];

        while let Some(mut rows) = pending.pop() {
            match self.insert(&rows).await {
                Ok(acked) => outcome.committed += acked,
                Err(TargetWriteError::Write {
                    source: ClientError::InvalidData(reason),
                    ..
                }) => {
                    if rows.len() == 1 {
                        outcome.rejected.push(self.reject(&rows[0], reason));
                    } else {
                        debug!(
                            "{}: {} rows refused ({}), splitting",
                            self.spec.target_name,
                            rows.len(),
                            reason
                        );
                        let right = rows.split_off(rows.len() / 2);
                        pending.push(right);
                        pending.push(rows);
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    async fn insert(&self, rows: &[Row]) -> Result<u64, TargetWriteError> {
        let table = &self.spec.target_name;
        let what = format!("Writing {} rows to {}", rows.len(), table);

        let acked = self
            .retry
            .run(&what, || async move {
                let mut conn = self.provider.acquire(Role::Target).await?;
                conn.bulk_insert(table, &self.columns, rows)
                    .await
                    .map_err(|err| TargetWriteError::write(table, err))
            })
            .await?;

        let expected = rows.len() as u64;
        if acked < expected {
            return Err(TargetWriteError::Unacknowledged {
                table: table.clone(),
                expected,
                acked,
            });
        }

        Ok(expected)
    }

    fn reject(&self, row: &Row, reason: String) -> RejectedRow {
        let key = self.spec.key_of(row).to_string();
        warn!("{}: rejected row {}: {}", self.spec.target_name, key, reason);
        RejectedRow { key, reason }
    }
}
