use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::common::schema::{SourceColumn, TableSpec};
use crate::connection::{ConnectionProvider, FederatedSource, Role};
use crate::error::{MigrationError, Result, SchemaError, SourceReadError, TargetWriteError};
use crate::extract::extractor::SnapshotReader;
use crate::insert::inserter::BatchWriter;
use crate::mappings::Mappings;
use crate::migrate::migration_options::MigrationOptions;
use crate::migrate::migration_result::TableReport;
use crate::migrate::table_schema_mapper::TableSchemaMapper;
use crate::state::{Checkpoint, CheckpointStore, Status};
use crate::verify::Verifier;

pub struct TableMigrator {
    provider: ConnectionProvider,
    store: Arc<dyn CheckpointStore>,
    mappings: Mappings,
    options: MigrationOptions,
    run_id: Uuid,
    cancel: CancellationToken,
}

impl TableMigrator {
    pub fn new(
        provider: ConnectionProvider,
        store: Arc<dyn CheckpointStore>,
        mappings: Mappings,
        options: MigrationOptions,
        run_id: Uuid,
        cancel: CancellationToken,
    ) -> Self {
        TableMigrator {
            provider,
            store,
            mappings,
            options,
            run_id,
            cancel,
        }
    }

    /// Migrates one table and reports how far it got. Errors end up in the report.
    pub async fn migrate_table(&mut self, table_name: &str) -> TableReport {
        info!("Migrating table: {}", table_name);

        let start_time = Instant::now();
        let mut report = TableReport::new(table_name, Status::Running);

        match self.transfer(table_name, &mut report).await {
            Ok(status) => report.status = status,
            Err(err) => {
                error!("Error while migrating table {}: {}", table_name, err);
                report.status = Status::Failed;
                report.error = Some(err.to_string());
            }
        }

        info!(
            "Table {} {}, rows: {}, rejected: {}, took: {}s",
            table_name,
            report.status,
            report.rows_committed,
            report.rejected.len(),
            start_time.elapsed().as_secs_f32()
        );

        report
    }

    async fn transfer(&mut self, table_name: &str, report: &mut TableReport) -> Result<Status> {
        let columns = self.describe(table_name).await?;

        let spec = Arc::new(TableSchemaMapper::map_schema(
            &self.mappings,
            table_name,
            &columns,
            &self.options.table(table_name),
            self.options.format_snake_case,
        )?);
        // A primary key is unique by definition, a configured one has to be checked.
        if self.options.table(table_name).key.is_some() {
            self.check_unique_key(&spec).await?;
        }
        if !spec.dropped.is_empty() {
            info!("{}: leaving out columns {}", table_name, spec.dropped.join(", "));
        }

        let writer = BatchWriter::new(
            self.provider.clone(),
            spec.clone(),
            self.options.retry.clone(),
        );
        writer.ensure_table().await?;

        let status = match self.options.federated.clone() {
            Some(source) => self.pull(&spec, &source, report).await?,
            None => self.copy_rows(&spec, &writer, report).await?,
        };

        if status == Status::Completed {
            self.verify(&spec, report).await;
        }

        Ok(status)
    }

    async fn describe(&self, table_name: &str) -> Result<Vec<SourceColumn>, SourceReadError> {
        let what = format!("Describing {}", table_name);

        let columns = self
            .options
            .retry
            .run(&what, || async move {
                let mut conn = self.provider.acquire(Role::Source).await?;
                conn.describe_table(table_name)
                    .await
                    .map_err(|err| SourceReadError::query(table_name, err))
            })
            .await?;

        if columns.is_empty() {
            return Err(SourceReadError::TableNotFound {
                table: table_name.to_string(),
            });
        }
        Ok(columns)
    }

    async fn check_unique_key(&self, spec: &TableSpec) -> Result<()> {
        let table = &spec.name;
        let column = &spec.key_column().name;
        let what = format!("Checking key of {}", table);

        let duplicates = self
            .options
            .retry
            .run(&what, || async move {
                let mut conn = self.provider.acquire(Role::Source).await?;
                conn.count_duplicate_keys(table, column)
                    .await
                    .map_err(|err| SourceReadError::query(table, err))
            })
            .await?;

        if duplicates > 0 {
            return Err(SchemaError::KeyNotUnique {
                table: table.clone(),
                column: column.clone(),
                duplicates,
            }
            .into());
        }
        Ok(())
    }

    // Reader task feeding the writer through a bounded queue. A checkpoint is
    // saved after every acknowledged batch and only then.
    async fn copy_rows(
        &self,
        spec: &Arc<TableSpec>,
        writer: &BatchWriter,
        report: &mut TableReport,
    ) -> Result<Status> {
        let mut checkpoint = match self.store.load_checkpoint(self.run_id, &spec.name).await? {
            Some(checkpoint) => {
                info!(
                    "Resuming {} after key {} ({} rows committed)",
                    spec.name,
                    checkpoint
                        .last_key
                        .as_ref()
                        .map_or_else(|| "start".to_string(), |key| key.to_string()),
                    checkpoint.committed_rows
                );
                checkpoint
            }
            None => Checkpoint::start(self.run_id, &spec.name),
        };
        report.rows_committed = checkpoint.committed_rows;

        let reader = SnapshotReader::new(
            self.provider.clone(),
            spec.clone(),
            self.options.batch_size,
            self.options.retry.clone(),
        );
        let reader_cancel = self.cancel.child_token();
        let (tx, mut rx) = mpsc::channel(self.options.queue_depth.max(1));
        let reader_task = tokio::spawn(reader.run(
            checkpoint.last_key.clone(),
            checkpoint.batch_seq,
            tx,
            reader_cancel.clone(),
        ));

        let mut paused = false;

        loop {
            let batch = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    paused = true;
                    break;
                }
                batch = rx.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };

            let outcome = match writer.write(&batch).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    reader_cancel.cancel();
                    drop(rx);
                    let _ = reader_task.await;
                    return Err(err.into());
                }
            };

            checkpoint = checkpoint.advance(batch.last_key.clone(), outcome.committed)?;
            self.store.save_checkpoint(&checkpoint).await?;

            report.rows_committed = checkpoint.committed_rows;
            report.rejected.extend(outcome.rejected);
        }

        // Whatever is still queued was never written; the checkpoint does not cover it.
        reader_cancel.cancel();
        drop(rx);

        let summary = reader_task
            .await
            .map_err(|err| MigrationError::Task(err.to_string()))??;

        if summary.exhausted && !paused {
            Ok(Status::Completed)
        } else {
            info!(
                "Table {} paused after batch {}",
                spec.name, checkpoint.batch_seq
            );
            Ok(Status::Paused)
        }
    }

    async fn pull(
        &self,
        spec: &TableSpec,
        source: &FederatedSource,
        report: &mut TableReport,
    ) -> Result<Status> {
        debug!("Pulling {} through the target's postgresql() function", spec.name);

        let mut conn = self
            .provider
            .acquire(Role::Target)
            .await
            .map_err(TargetWriteError::from)?;
        let rows = conn
            .federated_pull(spec, source)
            .await
            .map_err(|err| TargetWriteError::write(&spec.target_name, err))?;

        report.rows_committed = rows;
        Ok(Status::Completed)
    }

    async fn verify(&self, spec: &TableSpec, report: &mut TableReport) {
        let Some(options) = self.options.verify.clone() else {
            return;
        };

        let verifier = Verifier::new(self.provider.clone(), options, self.options.batch_size);
        match verifier.verify_table(spec).await {
            Ok(discrepancies) => {
                for discrepancy in &discrepancies {
                    warn!("{}: {}", spec.target_name, discrepancy);
                }
                report.discrepancies = discrepancies;
            }
            Err(err) => warn!("Verification of {} failed: {}", spec.target_name, err),
        }
    }
}
