use std::cmp::Ordering;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::common::schema::TableSpec;
use crate::common::value::{ColumnRef, Row, Value};
use crate::connection::{ConnectionProvider, PageRequest, PooledClient, Role};
use crate::error::SourceReadError;
use crate::migrate::retry::RetryPolicy;

/// One page of source rows on its way to the target.
#[derive(Debug, Clone)]
pub struct Batch {
    pub seq: u64,
    pub rows: Vec<Row>,
    pub first_key: Value,
    pub last_key: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadSummary {
    pub pages: u64,
    pub rows: u64,
    /// The whole table was read, as opposed to stopping on cancellation.
    pub exhausted: bool,
}

/// A source connection that keeps one read snapshot open across pages.
///
/// A connection whose read failed is dropped while still inside its snapshot, so
/// the pool closes it. The next page opens a fresh snapshot from the watermark.
#[derive(Default)]
pub struct ReadSession {
    conn: Mutex<Option<PooledClient>>,
}

impl ReadSession {
    /// Ends the snapshot and hands the connection back to the pool.
    pub async fn close(self) {
        if let Some(mut conn) = self.conn.into_inner() {
            if let Err(err) = conn.end_snapshot().await {
                debug!("Closing read snapshot failed: {}", err);
            }
        }
    }
}

/// Reads a table in key order, one keyset page at a time.
#[derive(Clone)]
pub struct SnapshotReader {
    provider: ConnectionProvider,
    spec: Arc<TableSpec>,
    columns: Vec<ColumnRef>,
    page_size: usize,
    retry: RetryPolicy,
}

impl SnapshotReader {
    pub fn new(
        provider: ConnectionProvider,
        spec: Arc<TableSpec>,
        page_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        let columns = spec.source_columns();
        SnapshotReader {
            provider,
            spec,
            columns,
            page_size: page_size.max(1),
            retry,
        }
    }

    /// Fetches the rows following `after`, or the first page when `after` is `None`.
    pub async fn next_page(
        &self,
        session: &ReadSession,
        after: Option<&Value>,
    ) -> Result<Vec<Row>, SourceReadError> {
        let table = &self.spec.name;
        let what = format!("Reading {}", table);

        let rows = self
            .retry
            .run(&what, || async move {
                let mut slot = session.conn.lock().await;
                let mut conn = match slot.take() {
                    Some(conn) => conn,
                    None => self.open_snapshot().await?,
                };
                let request = PageRequest {
                    table,
                    columns: &self.columns,
                    key_column: &self.spec.key_column().name,
                    after,
                    limit: self.page_size,
                };
                let rows = conn
                    .read_page(&request)
                    .await
                    .map_err(|err| SourceReadError::query(table, err))?;
                *slot = Some(conn);
                Ok::<_, SourceReadError>(rows)
            })
            .await?;

        self.check_key_order(after, &rows)?;
        Ok(rows)
    }

    async fn open_snapshot(&self) -> Result<PooledClient, SourceReadError> {
        let mut conn = self.provider.acquire(Role::Source).await?;
        conn.begin_snapshot()
            .await
            .map_err(|err| SourceReadError::query(&self.spec.name, err))?;
        Ok(conn)
    }

    /// Produces batches into `tx` until the table is exhausted or `cancel` fires.
    ///
    /// `tx` is bounded, so the reader stays at most one page ahead of a full queue.
    /// All pages come from one snapshot unless a read fails and a new one is opened.
    pub async fn run(
        self,
        start_after: Option<Value>,
        start_seq: u64,
        tx: mpsc::Sender<Batch>,
        cancel: CancellationToken,
    ) -> Result<ReadSummary, SourceReadError> {
        let session = ReadSession::default();
        let result = self.produce(&session, start_after, start_seq, tx, cancel).await;
        session.close().await;
        result
    }

    async fn produce(
        &self,
        session: &ReadSession,
        start_after: Option<Value>,
        start_seq: u64,
        tx: mpsc::Sender<Batch>,
        cancel: CancellationToken,
    ) -> Result<ReadSummary, SourceReadError> {
        let mut summary = ReadSummary::default();
        let mut after = start_after;
        let mut seq = start_seq;

        while !cancel.is_cancelled() {
            let read_start = Instant::now();
            let rows = self.next_page(session, after.as_ref()).await?;

            let Some(last) = rows.last() else {
                summary.exhausted = true;
                break;
            };

            let last_key = self.spec.key_of(last).clone();
            let first_key = self.spec.key_of(&rows[0]).clone();
            let short_page = rows.len() < self.page_size;
            seq += 1;

            summary.pages += 1;
            summary.rows += rows.len() as u64;

            debug!(
                "{}: read batch {} with {} rows, took: {}s",
                self.spec.name,
                seq,
                rows.len(),
                read_start.elapsed().as_secs_f32()
            );

            let batch = Batch {
                seq,
                rows,
                first_key,
                last_key: last_key.clone(),
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = tx.send(batch) => {
                    if sent.is_err() {
                        // The writer is gone; it reports its own outcome.
                        break;
                    }
                }
            }

            after = Some(last_key);

            if short_page {
                summary.exhausted = true;
                break;
            }
        }

        debug!(
            "{}: reader stopped after {} pages, {} rows",
            self.spec.name, summary.pages, summary.rows
        );

        Ok(summary)
    }

    fn check_key_order(&self, after: Option<&Value>, rows: &[Row]) -> Result<(), SourceReadError> {
        let mut previous = after.cloned();

        for row in rows {
            let key = self.spec.key_of(row);
            let advanced = match &previous {
                Some(previous) => key.compare_key(previous) == Some(Ordering::Greater),
                None => !key.is_null(),
            };

            if !advanced {
                return Err(SourceReadError::KeyNotIncreasing {
                    table: self.spec.name.clone(),
                    previous: previous
                        .map(|value| value.to_string())
                        .unwrap_or_else(|| "start".to_string()),
                    next: key.to_string(),
                });
            }
            previous = Some(key.clone());
        }

        Ok(())
    }
}
