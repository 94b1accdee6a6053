//! Error taxonomy of the migration engine.
//!
//! Every error kind knows whether it is transient. Transient errors are retried
//! by [`crate::migrate::retry::RetryPolicy`], everything else fails the table
//! it belongs to. Errors never cross table boundaries.

use std::time::Duration;

use thiserror::Error;

use crate::connection::Role;

/// Failure reported by a wire driver (PostgreSQL, ClickHouse or the in-memory store).
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("connection failure: {0}")]
    Connection(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("statement rejected: {0}")]
    Rejected(String),

    /// The store could not accept some of the values it was sent.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The server refused work because of its own load. Worth another try later.
    #[error("server busy: {0}")]
    Busy(String),

    #[error("{operation} is not supported by {engine}")]
    Unsupported {
        engine: &'static str,
        operation: &'static str,
    },
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Connection(_) | ClientError::Timeout(_) | ClientError::Busy(_)
        )
    }
}

#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("timed out acquiring {role} connection")]
    Timeout { role: Role },

    #[error("authentication failed for {role}: {message}")]
    Authentication { role: Role, message: String },

    #[error("{role} unavailable: {source}")]
    Unavailable {
        role: Role,
        #[source]
        source: ClientError,
    },
}

impl ConnectionError {
    pub fn from_client(role: Role, error: ClientError) -> Self {
        match error {
            ClientError::Authentication(message) => {
                ConnectionError::Authentication { role, message }
            }
            ClientError::Timeout(_) => ConnectionError::Timeout { role },
            source => ConnectionError::Unavailable { role, source },
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            ConnectionError::Timeout { .. } => true,
            ConnectionError::Authentication { .. } => false,
            ConnectionError::Unavailable { source, .. } => source.is_transient(),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum SourceReadError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("reading {table} failed: {source}")]
    Query {
        table: String,
        #[source]
        source: ClientError,
    },

    #[error("table {table} not found in source")]
    TableNotFound { table: String },

    #[error("key of {table} did not advance past {previous} (got {next})")]
    KeyNotIncreasing {
        table: String,
        previous: String,
        next: String,
    },
}

impl SourceReadError {
    pub fn query(table: impl Into<String>, source: ClientError) -> Self {
        SourceReadError::Query {
            table: table.into(),
            source,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            SourceReadError::Connection(err) => err.is_transient(),
            SourceReadError::Query { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

/// A single row the target refused or that failed coercion.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRow {
    pub key: String,
    pub reason: String,
}

#[derive(Error, Debug, Clone)]
pub enum TargetWriteError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("writing {table} failed: {source}")]
    Write {
        table: String,
        #[source]
        source: ClientError,
    },

    #[error("target acknowledged {acked} of {expected} rows for {table}")]
    Unacknowledged {
        table: String,
        expected: u64,
        acked: u64,
    },
}

impl TargetWriteError {
    pub fn write(table: impl Into<String>, source: ClientError) -> Self {
        TargetWriteError::Write {
            table: table.into(),
            source,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            TargetWriteError::Connection(err) => err.is_transient(),
            TargetWriteError::Write { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

/// Failure while reading either side for verification. Reported, never fatal.
#[derive(Error, Debug, Clone)]
pub enum VerifyError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("reading {table} from {role} failed: {source}")]
    Query {
        role: Role,
        table: String,
        #[source]
        source: ClientError,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("unsupported type {data_type} for column {table}.{column}")]
    UnsupportedType {
        table: String,
        column: String,
        data_type: String,
    },

    #[error("table {table} has no single-column primary key to order by")]
    MissingKey { table: String },

    #[error("key column {table}.{column} is not unique: {duplicates} rows share a key or have none")]
    KeyNotUnique {
        table: String,
        column: String,
        duplicates: u64,
    },

    #[error("key column {table}.{column} cannot be dropped")]
    DroppedKey { table: String, column: String },

    #[error("column {table}.{column} named in configuration does not exist")]
    UnknownColumn { table: String, column: String },
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("checkpoint for {table} would move from {previous} to {next}")]
    NotMonotonic {
        table: String,
        previous: String,
        next: String,
    },

    #[error("migration run {0} not found")]
    RunNotFound(String),
}

/// Error that ends the migration of one table.
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Read(#[from] SourceReadError),

    #[error(transparent)]
    Write(#[from] TargetWriteError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("no tables to migrate")]
    NoTables,

    #[error("table task panicked: {0}")]
    Task(String),
}

pub type Result<T, E = MigrationError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_is_transient_rejection_is_not() {
        assert!(ClientError::Connection("reset".into()).is_transient());
        assert!(ClientError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!ClientError::Rejected("syntax".into()).is_transient());

        let write = TargetWriteError::write("users", ClientError::Connection("reset".into()));
        assert!(write.is_transient());

        let auth = ConnectionError::from_client(
            Role::Target,
            ClientError::Authentication("bad password".into()),
        );
        assert!(!auth.is_transient());
        assert!(!SourceReadError::from(auth).is_transient());
    }
}
