use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow};
use sqlx::query::Query;
use sqlx::{Column, ConnectOptions, Connection as _, Postgres, Row as _, TypeInfo};
use uuid::Uuid;

use crate::common::helpers::quote_identifier;
use crate::common::schema::{SourceColumn, TableSpec};
use crate::common::value::{ColumnRef, Row, Value, ValueKind};
use crate::config::DatabaseConfig;
use crate::connection::{Connection, Connector, PageRequest};
use crate::error::ClientError;

const ENGINE: &str = "postgresql";
const MAX_BIND_PARAMETERS: usize = 65_535;
const BEGIN_SNAPSHOT: &str = "BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY";

pub struct PostgresConnector {
    options: PgConnectOptions,
    schema: String,
    statement_timeout: Duration,
}

impl PostgresConnector {
    pub fn new(config: &DatabaseConfig, statement_timeout: Duration) -> Self {
        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.username)
            .password(&config.password)
            .database(&config.database);
        options.disable_statement_logging();

        PostgresConnector {
            options,
            schema: config.schema.clone(),
            statement_timeout,
        }
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, ClientError> {
        let conn = tokio::time::timeout(self.statement_timeout, self.options.connect())
            .await
            .map_err(|_| ClientError::Timeout(self.statement_timeout))?
            .map_err(classify)?;

        Ok(Box::new(PostgresConnection {
            conn,
            schema: self.schema.clone(),
            statement_timeout: self.statement_timeout,
            broken: false,
            in_snapshot: false,
        }))
    }
}

pub struct PostgresConnection {
    conn: PgConnection,
    schema: String,
    statement_timeout: Duration,
    broken: bool,
    in_snapshot: bool,
}

impl PostgresConnection {
    fn table_ref(&self, table: &str) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.schema, '"'),
            quote_identifier(table, '"')
        )
    }

    async fn fetch(
        &mut self,
        sql: &str,
        params: &[Value],
        columns: Option<&[ColumnRef]>,
    ) -> Result<Vec<Row>, ClientError> {
        let query = bind_all(sqlx::query(sql), params);
        let timeout = self.statement_timeout;

        let rows = match tokio::time::timeout(timeout, query.fetch_all(&mut self.conn)).await {
            Ok(result) => result.map_err(classify),
            Err(_) => Err(ClientError::Timeout(timeout)),
        };

        let rows = match rows {
            Ok(rows) => rows,
            Err(err) => {
                if err.is_transient() {
                    self.broken = true;
                }
                return Err(err);
            }
        };

        rows.iter()
            .map(|row| {
                let values = decode_row(row)?;
                match columns {
                    Some(columns) => conform_row(values, columns),
                    None => Ok(values),
                }
            })
            .collect()
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    fn engine(&self) -> &'static str {
        ENGINE
    }

    async fn ping(&mut self) -> Result<(), ClientError> {
        let timeout = self.statement_timeout;
        match tokio::time::timeout(timeout, self.conn.ping()).await {
            Ok(result) => result.map_err(classify),
            Err(_) => Err(ClientError::Timeout(timeout)),
        }
    }

    // Closing a connection that still holds a snapshot rolls its transaction back.
    fn is_broken(&self) -> bool {
        self.broken || self.in_snapshot
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, ClientError> {
        self.fetch(sql, params, None).await
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, ClientError> {
        let query = bind_all(sqlx::query(sql), params);
        let timeout = self.statement_timeout;
        let result = match tokio::time::timeout(timeout, query.execute(&mut self.conn)).await {
            Ok(result) => result.map_err(classify),
            Err(_) => Err(ClientError::Timeout(timeout)),
        };
        if matches!(&result, Err(err) if err.is_transient()) {
            self.broken = true;
        }
        result.map(|done| done.rows_affected())
    }

    async fn bulk_insert(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[Row],
    ) -> Result<u64, ClientError> {
        if rows.is_empty() || columns.is_empty() {
            return Ok(0);
        }

        let column_list = columns
            .iter()
            .map(|column| quote_identifier(column, '"'))
            .collect::<Vec<_>>()
            .join(", ");
        let insert_statement = format!("INSERT INTO {} ({}) VALUES ", self.table_ref(table), column_list);
        let rows_per_statement = (MAX_BIND_PARAMETERS / columns.len()).max(1);

        let mut acked = 0;
        for chunk in rows.chunks(rows_per_statement) {
            let mut sql = insert_statement.clone();
            let mut params = Vec::with_capacity(chunk.len() * columns.len());

            for (row_index, row) in chunk.iter().enumerate() {
                if row_index > 0 {
                    sql.push_str(", ");
                }
                let placeholders = (0..row.len())
                    .map(|offset| format!("${}", params.len() + offset + 1))
                    .collect::<Vec<_>>()
                    .join(", ");
                sql.push_str(&format!("({})", placeholders));
                params.extend(row.iter().cloned());
            }

            acked += self.execute(&sql, &params).await?;
        }

        Ok(acked)
    }

    async fn list_tables(&mut self) -> Result<Vec<String>, ClientError> {
        let schema = Value::Text(self.schema.clone());
        let rows = self
            .query(
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_type = 'BASE TABLE' ORDER BY table_name",
                &[schema],
            )
            .await?;

        rows.into_iter()
            .map(|row| match row.into_iter().next() {
                Some(Value::Text(name)) => Ok(name),
                _ => Err(ClientError::Rejected("Failed to retrieve table name".into())),
            })
            .collect()
    }

    async fn describe_table(&mut self, table: &str) -> Result<Vec<SourceColumn>, ClientError> {
        let query = "SELECT
                c.column_name::text,
                CASE WHEN c.data_type = 'USER-DEFINED' OR c.data_type = 'ARRAY'
                     THEN c.udt_name::text ELSE c.data_type::text END,
                c.numeric_precision::int4,
                c.numeric_scale::int4,
                c.is_nullable::text = 'YES',
                c.column_default::text,
                EXISTS (
                    SELECT 1
                    FROM information_schema.table_constraints tc
                    JOIN information_schema.key_column_usage kcu
                      ON tc.constraint_name = kcu.constraint_name
                     AND tc.table_schema = kcu.table_schema
                     AND tc.table_name = kcu.table_name
                    WHERE tc.constraint_type = 'PRIMARY KEY'
                      AND tc.table_schema = c.table_schema
                      AND tc.table_name = c.table_name
                      AND kcu.column_name = c.column_name
                )
            FROM information_schema.columns c
            WHERE c.table_schema = $1 AND c.table_name = $2
            ORDER BY c.ordinal_position";

        let params = [Value::Text(self.schema.clone()), Value::Text(table.to_string())];
        let rows = self.query(query, &params).await?;

        rows.into_iter().map(source_column_from_row).collect()
    }

    async fn read_page(&mut self, request: &PageRequest<'_>) -> Result<Vec<Row>, ClientError> {
        let (sql, params) = page_statement(&self.table_ref(request.table), request);
        self.fetch(&sql, &params, Some(request.columns)).await
    }

    async fn fetch_rows(
        &mut self,
        table: &str,
        columns: &[ColumnRef],
        key_column: &str,
        keys: &[Value],
    ) -> Result<Vec<Row>, ClientError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (1..=keys.len())
            .map(|index| format!("${}", index))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM {} WHERE {} IN ({})",
            select_list(columns),
            self.table_ref(table),
            quote_identifier(key_column, '"'),
            placeholders
        );

        self.fetch(&sql, keys, Some(columns)).await
    }

    async fn count_rows(&mut self, table: &str) -> Result<u64, ClientError> {
        let sql = format!("SELECT count(*) FROM {}", self.table_ref(table));
        let rows = self.query(&sql, &[]).await?;

        match rows.first().and_then(|row| row.first()) {
            Some(Value::Int(count)) => Ok(*count as u64),
            _ => Err(ClientError::Rejected(format!("no row count for {}", table))),
        }
    }

    async fn count_duplicate_keys(
        &mut self,
        table: &str,
        key_column: &str,
    ) -> Result<u64, ClientError> {
        let sql = duplicate_keys_statement(&self.table_ref(table), key_column);
        let rows = self.query(&sql, &[]).await?;

        match rows.first().and_then(|row| row.first()) {
            Some(Value::Int(count)) => Ok(*count as u64),
            _ => Err(ClientError::Rejected(format!("no key count for {}", table))),
        }
    }

    async fn sample_rows(
        &mut self,
        table: &str,
        columns: &[ColumnRef],
        _key_column: &str,
        fraction: f64,
    ) -> Result<Vec<Row>, ClientError> {
        let sql = sample_statement(&self.table_ref(table), columns, fraction);
        self.fetch(&sql, &[], Some(columns)).await
    }

    async fn begin_snapshot(&mut self) -> Result<(), ClientError> {
        self.execute(BEGIN_SNAPSHOT, &[]).await?;
        self.in_snapshot = true;
        Ok(())
    }

    async fn end_snapshot(&mut self) -> Result<(), ClientError> {
        self.execute("COMMIT", &[]).await?;
        self.in_snapshot = false;
        Ok(())
    }

    async fn create_table(&mut self, _spec: &TableSpec) -> Result<(), ClientError> {
        Err(ClientError::Unsupported {
            engine: ENGINE,
            operation: "creating column-store tables",
        })
    }
}

/// Keyset page query with its parameters.
fn page_statement(table_ref: &str, request: &PageRequest<'_>) -> (String, Vec<Value>) {
    let mut key = quote_identifier(request.key_column, '"');
    let text_key = request
        .columns
        .iter()
        .any(|column| column.name == request.key_column && column.kind == ValueKind::Text);
    if text_key {
        // Byte order, so the engine and the database agree on what "after" means.
        key.push_str(" COLLATE \"C\"");
    }

    let mut sql = format!("SELECT {} FROM {}", select_list(request.columns), table_ref);

    let mut params = Vec::new();
    if let Some(after) = request.after {
        sql.push_str(&format!(" WHERE {} > $1", key));
        params.push(after.clone());
    }
    sql.push_str(&format!(" ORDER BY {} LIMIT {}", key, request.limit));

    (sql, params)
}

// NULL keys count as duplicates: keyset paging can never reach them.
fn duplicate_keys_statement(table_ref: &str, key_column: &str) -> String {
    format!(
        "SELECT count(*) - count(DISTINCT {}) FROM {}",
        quote_identifier(key_column, '"'),
        table_ref
    )
}

// BERNOULLI visits every page but only returns the sampled rows.
fn sample_statement(table_ref: &str, columns: &[ColumnRef], fraction: f64) -> String {
    let percent = (fraction * 100.0).clamp(0.0, 100.0);
    format!(
        "SELECT {} FROM {} TABLESAMPLE BERNOULLI ({})",
        select_list(columns),
        table_ref,
        percent
    )
}

/// Select list that lets text-like and exact numeric columns arrive as text.
fn select_list(columns: &[ColumnRef]) -> String {
    columns
        .iter()
        .map(|column| {
            let name = quote_identifier(&column.name, '"');
            match column.kind {
                ValueKind::Text | ValueKind::Decimal | ValueKind::Json => format!("{}::text", name),
                _ => name,
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn conform_row(values: Row, columns: &[ColumnRef]) -> Result<Row, ClientError> {
    values
        .into_iter()
        .zip(columns)
        .map(|(value, column)| {
            column
                .kind
                .conform(value)
                .map_err(|reason| ClientError::Rejected(format!("{}: {}", column.name, reason)))
        })
        .collect()
}

fn source_column_from_row(row: Row) -> Result<SourceColumn, ClientError> {
    let mut fields = row.into_iter();
    let mut next = || fields.next().unwrap_or(Value::Null);

    let column_name = text(next())?;
    let data_type = text(next())?.to_lowercase();
    let numeric_precision = unsigned(next());
    let numeric_scale = unsigned(next());
    let is_nullable = matches!(next(), Value::Bool(true));
    let default = match next() {
        Value::Text(default) => Some(default),
        _ => None,
    };
    let is_primary_key = matches!(next(), Value::Bool(true));

    Ok(SourceColumn {
        column_name,
        data_type,
        numeric_precision,
        numeric_scale,
        is_nullable,
        default,
        is_primary_key,
    })
}

fn text(value: Value) -> Result<String, ClientError> {
    match value {
        Value::Text(text) => Ok(text),
        other => Err(ClientError::Rejected(format!(
            "expected text in column metadata, got {}",
            other.type_name()
        ))),
    }
}

fn unsigned(value: Value) -> Option<u32> {
    match value {
        Value::Int(value) if value >= 0 => Some(value as u32),
        _ => None,
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &[Value],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param.clone() {
            Value::Null => query.bind(None::<String>),
            Value::Bool(v) => query.bind(v),
            Value::Int(v) => query.bind(v),
            Value::Float(v) => query.bind(v),
            Value::Decimal(v) | Value::Text(v) | Value::Json(v) => query.bind(v),
            Value::Uuid(v) => query.bind(v),
            Value::Date(v) => query.bind(v),
            Value::Timestamp(v) => query.bind(v),
            Value::TimestampTz(v) => query.bind(v),
            Value::Bytes(v) => query.bind(v),
        };
    }
    query
}

fn decode_row(row: &PgRow) -> Result<Row, ClientError> {
    row.columns()
        .iter()
        .map(|column| {
            let index = column.ordinal();
            let type_name = column.type_info().name().to_uppercase();
            decode_value(row, index, &type_name).map_err(|err| {
                ClientError::Rejected(format!("decoding {}: {}", column.name(), err))
            })
        })
        .collect()
}

fn decode_value(row: &PgRow, index: usize, type_name: &str) -> Result<Value, sqlx::Error> {
    let value = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.map(Value::Bool),
        "INT2" => row
            .try_get::<Option<i16>, _>(index)?
            .map(|v| Value::Int(v as i64)),
        "INT4" => row
            .try_get::<Option<i32>, _>(index)?
            .map(|v| Value::Int(v as i64)),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.map(Value::Int),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)?
            .map(|v| Value::Float(v as f64)),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.map(Value::Float),
        "UUID" => row.try_get::<Option<Uuid>, _>(index)?.map(Value::Uuid),
        "DATE" => row.try_get::<Option<NaiveDate>, _>(index)?.map(Value::Date),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)?
            .map(Value::Timestamp),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)?
            .map(Value::TimestampTz),
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(index)?
            .map(|v| Value::Json(v.to_string())),
        "BYTEA" => row.try_get::<Option<Vec<u8>>, _>(index)?.map(Value::Bytes),
        _ => row.try_get::<Option<String>, _>(index)?.map(Value::Text),
    };

    Ok(value.unwrap_or(Value::Null))
}

fn classify(err: sqlx::Error) -> ClientError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|code| code.to_string()).unwrap_or_default();
            classify_sqlstate(&code, db_err.message().to_string())
        }
        sqlx::Error::Io(err) => ClientError::Connection(err.to_string()),
        sqlx::Error::Tls(err) => ClientError::Connection(err.to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            ClientError::Connection(err.to_string())
        }
        other => ClientError::Rejected(other.to_string()),
    }
}

fn classify_sqlstate(code: &str, message: String) -> ClientError {
    match code.get(..2).unwrap_or_default() {
        // invalid authorization
        "28" => ClientError::Authentication(message),
        // connection exception, operator intervention (shutdown)
        "08" | "57" => ClientError::Connection(message),
        // insufficient resources, serialization failure and deadlock
        "53" | "40" => ClientError::Busy(message),
        // data exception, integrity constraint violation
        "22" | "23" => ClientError::InvalidData(message),
        _ => ClientError::Rejected(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstates_map_to_client_errors() {
        let msg = || "boom".to_string();

        assert!(matches!(classify_sqlstate("28P01", msg()), ClientError::Authentication(_)));
        assert!(classify_sqlstate("08006", msg()).is_transient());
        assert!(classify_sqlstate("57P01", msg()).is_transient());
        assert!(classify_sqlstate("53300", msg()).is_transient());
        assert!(matches!(classify_sqlstate("22P02", msg()), ClientError::InvalidData(_)));
        assert!(matches!(classify_sqlstate("42P01", msg()), ClientError::Rejected(_)));
    }

    fn columns() -> Vec<ColumnRef> {
        vec![
            ColumnRef::new("code", ValueKind::Text),
            ColumnRef::new("amount", ValueKind::Decimal),
            ColumnRef::new("created", ValueKind::TimestampTz),
            ColumnRef::new("payload", ValueKind::Json),
        ]
    }

    #[test]
    fn text_like_columns_are_read_as_text() {
        assert_eq!(
            select_list(&columns()),
            "\"code\"::text, \"amount\"::text, \"created\", \"payload\"::text"
        );
    }

    #[test]
    fn first_page_has_no_lower_bound() {
        let columns = columns();
        let request = PageRequest {
            table: "orders",
            columns: &columns[1..],
            key_column: "created",
            after: None,
            limit: 500,
        };

        let (sql, params) = page_statement("\"public\".\"orders\"", &request);

        assert_eq!(
            sql,
            "SELECT \"amount\"::text, \"created\", \"payload\"::text FROM \"public\".\"orders\" \
             ORDER BY \"created\" LIMIT 500"
        );
        assert!(params.is_empty());
    }

    #[test]
    fn text_keys_page_in_byte_order() {
        let columns = columns();
        let after = Value::Text("B-17".into());
        let request = PageRequest {
            table: "vouchers",
            columns: &columns,
            key_column: "code",
            after: Some(&after),
            limit: 100,
        };

        let (sql, params) = page_statement("\"sales\".\"vouchers\"", &request);

        assert!(sql.ends_with(
            "WHERE \"code\" COLLATE \"C\" > $1 ORDER BY \"code\" COLLATE \"C\" LIMIT 100"
        ));
        assert_eq!(params, vec![after]);
    }

    #[test]
    fn duplicate_keys_count_nulls_too() {
        assert_eq!(
            duplicate_keys_statement("\"public\".\"events\"", "grp"),
            "SELECT count(*) - count(DISTINCT \"grp\") FROM \"public\".\"events\""
        );
    }
}
