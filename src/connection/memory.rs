//! In-memory store with fault injection, standing in for either engine in tests.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::common::schema::{SourceColumn, TableSpec};
use crate::common::value::{ColumnRef, Row, Value};
use crate::connection::{Connection, Connector, PageRequest};
use crate::error::ClientError;

type InsertHook = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    tables: BTreeMap<String, Table>,
    connections_opened: usize,
    login_error: Option<String>,
    reads: usize,
    failing_reads: usize,
    insert_calls: usize,
    fail_inserts_after: Option<usize>,
    failing_inserts: usize,
    rejected_value: Option<Value>,
    rejected_statement: Option<String>,
    busy_inserts: usize,
    committed_batches: Vec<Vec<Value>>,
    on_insert: Option<InsertHook>,
}

#[derive(Clone)]
struct Table {
    columns: Vec<SourceColumn>,
    key_index: usize,
    rows: Vec<Row>,
}

impl Table {
    fn sorted_rows(&self) -> Vec<Row> {
        let mut rows = self.rows.clone();
        let key = self.key_index;
        rows.sort_by(|a, b| a[key].compare_key(&b[key]).unwrap_or(Ordering::Equal));
        rows
    }

    fn column_index(&self, name: &str) -> Result<usize, ClientError> {
        self.columns
            .iter()
            .position(|c| c.column_name == name)
            .ok_or_else(|| ClientError::Rejected(format!("no column {}", name)))
    }

    fn page(&self, request: &PageRequest<'_>) -> Result<Vec<Row>, ClientError> {
        let key = self.column_index(request.key_column)?;
        let mut rows = self.rows.clone();
        rows.sort_by(|a, b| a[key].compare_key(&b[key]).unwrap_or(Ordering::Equal));

        rows.iter()
            .filter(|row| match request.after {
                Some(after) => row[key].compare_key(after) == Some(Ordering::Greater),
                None => true,
            })
            .take(request.limit)
            .map(|row| self.project(row, request.columns))
            .collect()
    }

    fn project(&self, row: &Row, columns: &[ColumnRef]) -> Result<Row, ClientError> {
        columns
            .iter()
            .map(|column| {
                self.columns
                    .iter()
                    .position(|c| c.column_name == column.name)
                    .map(|index| row[index].clone())
                    .ok_or_else(|| ClientError::Rejected(format!("no column {}", column.name)))
            })
            .collect()
    }
}

impl MemoryStore {
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            store: self.clone(),
        }
    }

    pub fn create_table(&self, name: &str, columns: Vec<SourceColumn>, rows: Vec<Row>) {
        let key_index = columns
            .iter()
            .position(|column| column.is_primary_key)
            .unwrap_or(0);
        self.state().tables.insert(
            name.to_string(),
            Table {
                columns,
                key_index,
                rows,
            },
        );
    }

    /// Rows of `table` in key order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state()
            .tables
            .get(table)
            .map(Table::sorted_rows)
            .unwrap_or_default()
    }

    pub fn insert_row(&self, table: &str, row: Row) {
        self.state().tables.get_mut(table).unwrap().rows.push(row);
    }

    pub fn set_value(&self, table: &str, row: usize, column: usize, value: Value) {
        let mut state = self.state();
        let table = state.tables.get_mut(table).unwrap();
        table.rows[row][column] = value;
    }

    pub fn remove_row(&self, table: &str, row: usize) {
        self.state().tables.get_mut(table).unwrap().rows.remove(row);
    }

    pub fn connections_opened(&self) -> usize {
        self.state().connections_opened
    }

    pub fn reads(&self) -> usize {
        self.state().reads
    }

    pub fn insert_calls(&self) -> usize {
        self.state().insert_calls
    }

    /// Keys of every acknowledged bulk insert, in commit order.
    pub fn committed_batches(&self) -> Vec<Vec<Value>> {
        self.state().committed_batches.clone()
    }

    pub fn reject_logins(&self, message: &str) {
        self.state().login_error = Some(message.to_string());
    }

    /// The next `times` page reads fail with a connectivity error.
    pub fn fail_reads(&self, times: usize) {
        self.state().failing_reads = times;
    }

    /// Once `after` bulk inserts went through, the following `times` fail.
    pub fn fail_inserts(&self, after: usize, times: usize) {
        let mut state = self.state();
        state.fail_inserts_after = Some(after);
        state.failing_inserts = times;
    }

    pub fn heal(&self) {
        let mut state = self.state();
        state.failing_reads = 0;
        state.fail_inserts_after = None;
        state.failing_inserts = 0;
    }

    /// Bulk inserts containing `value` anywhere are refused as malformed.
    pub fn reject_value(&self, value: Value) {
        self.state().rejected_value = Some(value);
    }

    /// Every bulk insert is refused as a bad statement.
    pub fn reject_statements(&self, message: &str) {
        self.state().rejected_statement = Some(message.to_string());
    }

    /// The next `times` bulk inserts are turned away because the server is busy.
    pub fn busy_inserts(&self, times: usize) {
        self.state().busy_inserts = times;
    }

    /// Called with the number of acknowledged inserts after each one.
    pub fn on_insert(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        self.state().on_insert = Some(Arc::new(hook));
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.lock().unwrap()
    }

    fn with_table<T>(
        &self,
        table: &str,
        f: impl FnOnce(&mut Table) -> Result<T, ClientError>,
    ) -> Result<T, ClientError> {
        let mut state = self.state();
        let table = state
            .tables
            .get_mut(table)
            .ok_or_else(|| ClientError::Rejected(format!("table {} does not exist", table)))?;
        f(table)
    }
}

pub struct MemoryConnector {
    store: MemoryStore,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, ClientError> {
        let mut state = self.store.state();
        if let Some(message) = &state.login_error {
            return Err(ClientError::Authentication(message.clone()));
        }
        state.connections_opened += 1;

        Ok(Box::new(MemoryConnection {
            store: self.store.clone(),
            snapshot: None,
        }))
    }
}

pub struct MemoryConnection {
    store: MemoryStore,
    snapshot: Option<BTreeMap<String, Table>>,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn engine(&self) -> &'static str {
        "memory"
    }

    async fn ping(&mut self) -> Result<(), ClientError> {
        Ok(())
    }

    // A connection dropped inside a snapshot is not handed out again.
    fn is_broken(&self) -> bool {
        self.snapshot.is_some()
    }

    async fn begin_snapshot(&mut self) -> Result<(), ClientError> {
        self.snapshot = Some(self.store.state().tables.clone());
        Ok(())
    }

    async fn end_snapshot(&mut self) -> Result<(), ClientError> {
        self.snapshot = None;
        Ok(())
    }

    async fn query(&mut self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>, ClientError> {
        Err(ClientError::Unsupported {
            engine: "memory",
            operation: "query",
        })
    }

    async fn execute(&mut self, _sql: &str, _params: &[Value]) -> Result<u64, ClientError> {
        Err(ClientError::Unsupported {
            engine: "memory",
            operation: "execute",
        })
    }

    async fn bulk_insert(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[Row],
    ) -> Result<u64, ClientError> {
        let hook = {
            let mut state = self.store.state();
            state.insert_calls += 1;

            if let Some(after) = state.fail_inserts_after {
                let acknowledged = state.committed_batches.len();
                if acknowledged >= after && state.failing_inserts > 0 {
                    state.failing_inserts -= 1;
                    return Err(ClientError::Connection("connection reset by peer".into()));
                }
            }

            if state.busy_inserts > 0 {
                state.busy_inserts -= 1;
                return Err(ClientError::Busy("too many parts".into()));
            }

            if let Some(message) = &state.rejected_statement {
                return Err(ClientError::Rejected(message.clone()));
            }

            if let Some(rejected) = &state.rejected_value {
                if rows.iter().flatten().any(|value| value == rejected) {
                    return Err(ClientError::InvalidData(format!(
                        "cannot parse input: unexpected {}",
                        rejected
                    )));
                }
            }

            let target = state
                .tables
                .get_mut(table)
                .ok_or_else(|| ClientError::Rejected(format!("table {} does not exist", table)))?;

            let names: Vec<&str> = target
                .columns
                .iter()
                .map(|c| c.column_name.as_str())
                .collect();
            if names != columns.iter().map(String::as_str).collect::<Vec<_>>() {
                return Err(ClientError::Rejected("column list mismatch".into()));
            }

            let key = target.key_index;
            for row in rows {
                match target.rows.iter_mut().find(|existing| existing[key] == row[key]) {
                    Some(existing) => *existing = row.clone(),
                    None => target.rows.push(row.clone()),
                }
            }

            let keys = rows.iter().map(|row| row[key].clone()).collect();
            state.committed_batches.push(keys);
            state
                .on_insert
                .clone()
                .map(|hook| (hook, state.committed_batches.len()))
        };

        if let Some((hook, count)) = hook {
            hook(count);
        }

        Ok(rows.len() as u64)
    }

    async fn list_tables(&mut self) -> Result<Vec<String>, ClientError> {
        Ok(self.store.state().tables.keys().cloned().collect())
    }

    async fn describe_table(&mut self, table: &str) -> Result<Vec<SourceColumn>, ClientError> {
        Ok(self
            .store
            .state()
            .tables
            .get(table)
            .map(|table| table.columns.clone())
            .unwrap_or_default())
    }

    async fn read_page(&mut self, request: &PageRequest<'_>) -> Result<Vec<Row>, ClientError> {
        {
            let mut state = self.store.state();
            state.reads += 1;
            if state.failing_reads > 0 {
                state.failing_reads -= 1;
                return Err(ClientError::Connection("server closed the connection".into()));
            }
        }

        if let Some(snapshot) = &self.snapshot {
            return snapshot
                .get(request.table)
                .ok_or_else(|| {
                    ClientError::Rejected(format!("table {} does not exist", request.table))
                })?
                .page(request);
        }

        self.store.with_table(request.table, |table| table.page(request))
    }

    async fn fetch_rows(
        &mut self,
        table: &str,
        columns: &[ColumnRef],
        key_column: &str,
        keys: &[Value],
    ) -> Result<Vec<Row>, ClientError> {
        self.store.with_table(table, |table| {
            let key = table.column_index(key_column)?;
            table
                .sorted_rows()
                .iter()
                .filter(|row| keys.contains(&row[key]))
                .map(|row| table.project(row, columns))
                .collect()
        })
    }

    async fn count_rows(&mut self, table: &str) -> Result<u64, ClientError> {
        self.store
            .with_table(table, |table| Ok(table.rows.len() as u64))
    }

    async fn count_duplicate_keys(
        &mut self,
        table: &str,
        key_column: &str,
    ) -> Result<u64, ClientError> {
        self.store.with_table(table, |table| {
            let key = table.column_index(key_column)?;
            let mut keys: Vec<&Value> = table.rows.iter().map(|row| &row[key]).collect();
            let total = keys.len();
            keys.sort_by(|a, b| a.compare_key(b).unwrap_or(Ordering::Equal));
            keys.dedup();
            let nulls = keys.iter().filter(|key| key.is_null()).count();
            Ok((total - keys.len() + nulls) as u64)
        })
    }

    // Every n-th row in key order, which keeps tests deterministic.
    async fn sample_rows(
        &mut self,
        table: &str,
        columns: &[ColumnRef],
        key_column: &str,
        fraction: f64,
    ) -> Result<Vec<Row>, ClientError> {
        if fraction <= 0.0 {
            return Ok(Vec::new());
        }
        let step = (1.0 / fraction).round().max(1.0) as usize;

        let request = PageRequest {
            table,
            columns,
            key_column,
            after: None,
            limit: usize::MAX,
        };
        self.store.with_table(table, |stored| {
            Ok(stored.page(&request)?.into_iter().step_by(step).collect())
        })
    }

    async fn create_table(&mut self, spec: &TableSpec) -> Result<(), ClientError> {
        let mut state = self.store.state();
        if state.tables.contains_key(&spec.target_name) {
            return Ok(());
        }

        let columns = spec
            .columns
            .iter()
            .enumerate()
            .map(|(index, column)| SourceColumn {
                column_name: column.target_name.clone(),
                data_type: column.target_type.clone(),
                numeric_precision: None,
                numeric_scale: None,
                is_nullable: column.is_nullable,
                default: column.default.clone(),
                is_primary_key: index == spec.key_index,
            })
            .collect();

        state.tables.insert(
            spec.target_name.clone(),
            Table {
                columns,
                key_index: spec.key_index,
                rows: Vec::new(),
            },
        );
        Ok(())
    }
}
