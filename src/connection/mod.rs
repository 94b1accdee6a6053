//! Client capabilities of the two stores and the pooled provider handing them out.

use std::fmt;

use async_trait::async_trait;

use crate::common::schema::{SourceColumn, TableSpec};
use crate::common::value::{ColumnRef, Row, Value};
use crate::error::ClientError;

pub mod clickhouse;
#[cfg(test)]
pub mod memory;
pub mod postgres;
pub mod provider;

pub use provider::{ConnectionProvider, PoolOptions, PooledClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Source,
    Target,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Source => write!(f, "source"),
            Role::Target => write!(f, "target"),
        }
    }
}

/// One keyset page: rows with `key > after`, ordered by key.
#[derive(Debug, Clone)]
pub struct PageRequest<'a> {
    pub table: &'a str,
    pub columns: &'a [ColumnRef],
    pub key_column: &'a str,
    pub after: Option<&'a Value>,
    pub limit: usize,
}

/// Where a target engine can reach the source directly.
#[derive(Debug, Clone)]
pub struct FederatedSource {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub schema: String,
    pub username: String,
    pub password: String,
}

/// A live connection to one of the stores.
///
/// `query`, `execute` and `bulk_insert` are the raw driver capabilities. The
/// remaining methods are the statements the engine issues, rendered by each
/// driver in its own dialect.
#[async_trait]
pub trait Connection: Send {
    fn engine(&self) -> &'static str;

    async fn ping(&mut self) -> Result<(), ClientError>;

    /// Set once the underlying transport failed; the pool drops broken connections.
    fn is_broken(&self) -> bool {
        false
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, ClientError>;

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, ClientError>;

    /// Inserts `rows` in one operation and returns how many rows the store acknowledged.
    async fn bulk_insert(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[Row],
    ) -> Result<u64, ClientError>;

    async fn list_tables(&mut self) -> Result<Vec<String>, ClientError>;

    async fn describe_table(&mut self, table: &str) -> Result<Vec<SourceColumn>, ClientError>;

    async fn read_page(&mut self, request: &PageRequest<'_>) -> Result<Vec<Row>, ClientError>;

    async fn fetch_rows(
        &mut self,
        table: &str,
        columns: &[ColumnRef],
        key_column: &str,
        keys: &[Value],
    ) -> Result<Vec<Row>, ClientError>;

    async fn count_rows(&mut self, table: &str) -> Result<u64, ClientError>;

    /// Rows whose `key_column` value is shared with another row or is NULL.
    async fn count_duplicate_keys(
        &mut self,
        _table: &str,
        _key_column: &str,
    ) -> Result<u64, ClientError> {
        Err(ClientError::Unsupported {
            engine: self.engine(),
            operation: "counting duplicate keys",
        })
    }

    /// Roughly `fraction` of the rows of `table`, drawn by the store without
    /// reading the whole table.
    async fn sample_rows(
        &mut self,
        _table: &str,
        _columns: &[ColumnRef],
        _key_column: &str,
        _fraction: f64,
    ) -> Result<Vec<Row>, ClientError> {
        Err(ClientError::Unsupported {
            engine: self.engine(),
            operation: "sampling rows",
        })
    }

    /// Pins every following read on this connection to one point in time,
    /// until [`Connection::end_snapshot`].
    async fn begin_snapshot(&mut self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn end_snapshot(&mut self) -> Result<(), ClientError> {
        Ok(())
    }

    /// Creates the target table for `spec` unless it already exists.
    async fn create_table(&mut self, spec: &TableSpec) -> Result<(), ClientError>;

    /// Lets the target pull the whole table straight from the source.
    async fn federated_pull(
        &mut self,
        _spec: &TableSpec,
        _source: &FederatedSource,
    ) -> Result<u64, ClientError> {
        Err(ClientError::Unsupported {
            engine: self.engine(),
            operation: "federated pull",
        })
    }
}

/// Opens new connections for a pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn Connection>, ClientError>;
}
