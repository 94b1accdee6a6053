use std::sync::Arc;

use futures::future::join_all;
use log::info;
use tokio::spawn;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::connection::{ConnectionProvider, Role};
use crate::error::{MigrationError, Result, SourceReadError};
use crate::mappings::Mappings;
use crate::migrate::migration_options::MigrationOptions;
use crate::migrate::migration_result::{RunReport, TableReport};
use crate::migrate::table_migrator::TableMigrator;
use crate::state::{CheckpointStore, MigrationRun, Status};

#[derive(Debug, Clone, PartialEq)]
pub enum TableSelection {
    All,
    Named(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct MigrationRequest {
    pub tables: TableSelection,
    /// Continue an earlier run instead of starting a new one.
    pub resume: Option<Uuid>,
}

/// Drives a run: table tasks in parallel, bounded by the configured parallelism.
pub struct DatabaseMigrator {
    provider: ConnectionProvider,
    store: Arc<dyn CheckpointStore>,
    mappings: Mappings,
    options: MigrationOptions,
    cancel: CancellationToken,
}

impl DatabaseMigrator {
    pub fn new(
        provider: ConnectionProvider,
        store: Arc<dyn CheckpointStore>,
        mappings: Mappings,
        options: MigrationOptions,
        cancel: CancellationToken,
    ) -> Self {
        DatabaseMigrator {
            provider,
            store,
            mappings,
            options,
            cancel,
        }
    }

    pub async fn run(&mut self, request: MigrationRequest) -> Result<RunReport> {
        let start_time = Instant::now();

        let mut run = match request.resume {
            Some(run_id) => {
                let run = self.store.load_run(run_id).await?;
                info!("Resuming run {} ({})", run.id, run.state);
                run
            }
            None => {
                let tables = self.fetch_tables(&request.tables).await?;
                MigrationRun::new(tables)
            }
        };

        if run.tables.is_empty() {
            return Err(MigrationError::NoTables);
        }

        info!("Run {}, tables to migrate: {}", run.id, run.tables.join(", "));

        run.mark_running();
        self.store.save_run(&run).await?;

        let run_id = run.id;
        let tables = run.tables.clone();
        let run = Arc::new(Mutex::new(run));

        let reports = self.run_migration(run_id, &tables, run.clone()).await;

        let mut run = run.lock().await;
        run.finish();
        self.store.save_run(&run).await?;

        info!(
            "Migration finished, total time took: {}s",
            start_time.elapsed().as_secs_f32()
        );

        Ok(RunReport {
            run_id,
            state: run.state,
            tables: reports,
        })
    }

    async fn fetch_tables(&self, selection: &TableSelection) -> Result<Vec<String>> {
        let mut conn = self.provider.acquire(Role::Source).await?;
        let tables = conn
            .list_tables()
            .await
            .map_err(|err| SourceReadError::query("information_schema.tables", err))?;

        let requested = match selection {
            TableSelection::Named(names) => names.clone(),
            TableSelection::All if !self.options.whitelisted_tables.is_empty() => {
                self.options.whitelisted_tables.clone()
            }
            TableSelection::All => return Ok(tables),
        };

        // Missing tables stay in the run so they fail visibly in the report.
        check_missing_tables(&tables, &requested);
        Ok(requested)
    }

    async fn run_migration(
        &self,
        run_id: Uuid,
        tables: &[String],
        run: Arc<Mutex<MigrationRun>>,
    ) -> Vec<TableReport> {
        // Every table task holds one connection per role while it copies.
        let pool_limit = self.provider.size(Role::Source).min(self.provider.size(Role::Target));
        let workers = self.options.parallelism.clamp(1, pool_limit as usize);
        if workers < self.options.parallelism {
            warn!(
                "Parallelism {} exceeds the connection pools, using {}",
                self.options.parallelism, workers
            );
        }
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut migration_tasks = Vec::new();

        for table in tables {
            let previous = run.lock().await.table_states.get(table).cloned();
            if let Some(state) = previous.filter(|state| state.status == Status::Completed) {
                info!("Table {} already completed, skipping", table);
                let mut report = TableReport::new(table, Status::Completed);
                report.rows_committed = state.rows_committed;
                migration_tasks.push(spawn(async move { report }));
                continue;
            }

            let semaphore = Arc::clone(&semaphore);
            let table = table.clone();
            let run = run.clone();
            let store = self.store.clone();
            let cancel = self.cancel.clone();
            let mut table_migrator = TableMigrator::new(
                self.provider.clone(),
                self.store.clone(),
                self.mappings.clone(),
                self.options.clone(),
                run_id,
                self.cancel.clone(),
            );

            let task = spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return TableReport::failed(&table, "worker pool closed".to_string());
                };

                let report = if cancel.is_cancelled() {
                    TableReport::new(&table, Status::Paused)
                } else {
                    record(&run, store.as_ref(), &table, |state| {
                        state.status = Status::Running;
                        state.error = None;
                    })
                    .await;
                    table_migrator.migrate_table(&table).await
                };

                record(&run, store.as_ref(), &table, |state| {
                    state.status = report.status;
                    state.rows_committed = report.rows_committed;
                    state.rows_rejected += report.rejected.len() as u64;
                    state.error = report.error.clone();
                })
                .await;

                report
            });

            migration_tasks.push(task);
        }

        join_all(migration_tasks)
            .await
            .into_iter()
            .zip(tables)
            .map(|(result, table)| {
                result.unwrap_or_else(|err| {
                    TableReport::failed(table, MigrationError::Task(err.to_string()).to_string())
                })
            })
            .collect()
    }
}

// Run records are saved under the lock so concurrent tables never interleave writes.
async fn record(
    run: &Mutex<MigrationRun>,
    store: &dyn CheckpointStore,
    table: &str,
    update: impl FnOnce(&mut crate::state::TableState),
) {
    let mut run = run.lock().await;
    run.update_table(table, update);
    if let Err(err) = store.save_run(&run).await {
        warn!("Failed to save run {}: {}", run.id, err);
    }
}

fn check_missing_tables(tables: &[String], requested: &[String]) {
    let missing_tables: Vec<_> = requested
        .iter()
        .filter(|table| !tables.contains(table))
        .cloned()
        .collect();

    if !missing_tables.is_empty() {
        warn!(
            "The following tables were not found in the source database: {}",
            missing_tables.join(", ")
        );
    }
}
