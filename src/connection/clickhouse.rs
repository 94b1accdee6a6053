//! ClickHouse over its HTTP interface.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use crate::common::helpers::quote_identifier;
use crate::common::schema::{SourceColumn, TableSpec};
use crate::common::value::{ColumnRef, Row, Value};
use crate::config::DatabaseConfig;
use crate::connection::{Connection, Connector, FederatedSource, PageRequest};
use crate::error::ClientError;
use crate::insert::format::{bind_literals, format_json_row, format_string_value, parse_json_value};
use crate::mappings::Coercion;

const ENGINE: &str = "clickhouse";
const SUMMARY_HEADER: &str = "X-ClickHouse-Summary";

// Error codes ClickHouse puts in its response body ("Code: 516. DB::Exception ...").
// UNKNOWN_USER, REQUIRED_PASSWORD, ACCESS_DENIED, AUTHENTICATION_FAILED
const AUTHENTICATION_CODES: &[u32] = &[192, 194, 497, 516];
// TIMEOUT_EXCEEDED, SOCKET_TIMEOUT, NETWORK_ERROR
const CONNECTION_CODES: &[u32] = &[159, 209, 210];
// TOO_MANY_SIMULTANEOUS_QUERIES, MEMORY_LIMIT_EXCEEDED, TABLE_IS_READ_ONLY,
// TOO_MANY_PARTS, UNKNOWN_STATUS_OF_INSERT, SYSTEM_ERROR, KEEPER_EXCEPTION
const BUSY_CODES: &[u32] = &[202, 241, 242, 252, 319, 425, 999];
// Parse and conversion failures caused by the values of an insert.
const INVALID_DATA_CODES: &[u32] = &[
    6, 25, 26, 27, 32, 33, 38, 41, 53, 69, 70, 72, 117, 131, 349, 407,
];

#[derive(Clone)]
pub struct ClickHouseConnector {
    client: Client,
    url: String,
    database: String,
    username: String,
    password: String,
}

impl ClickHouseConnector {
    pub fn new(config: &DatabaseConfig, statement_timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(statement_timeout)
            .connect_timeout(statement_timeout)
            .build()
            .map_err(|err| ClientError::Connection(err.to_string()))?;

        Ok(ClickHouseConnector {
            client,
            url: format!("http://{}:{}/", config.host, config.port),
            database: config.database.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }
}

#[async_trait]
impl Connector for ClickHouseConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, ClientError> {
        let mut conn = ClickHouseConnection {
            http: self.clone(),
            broken: false,
        };
        // HTTP is stateless; a round trip checks reachability and credentials.
        conn.post("SELECT 1".to_string()).await?;
        Ok(Box::new(conn))
    }
}

pub struct ClickHouseConnection {
    http: ClickHouseConnector,
    broken: bool,
}

struct Response {
    body: String,
    written_rows: Option<u64>,
}

impl ClickHouseConnection {
    fn table_ref(&self, table: &str) -> String {
        table_ref(&self.http.database, table)
    }

    async fn post(&mut self, body: String) -> Result<Response, ClientError> {
        let result = self.send(body).await;
        if matches!(&result, Err(err) if err.is_transient()) {
            self.broken = true;
        }
        result
    }

    async fn send(&self, body: String) -> Result<Response, ClientError> {
        let response = self
            .http
            .client
            .post(&self.http.url)
            .query(&[
                ("database", self.http.database.as_str()),
                ("wait_end_of_query", "1"),
                ("output_format_json_quote_64bit_integers", "0"),
                ("output_format_json_quote_decimals", "1"),
                ("date_time_input_format", "best_effort"),
            ])
            .header("X-ClickHouse-User", &self.http.username)
            .header("X-ClickHouse-Key", &self.http.password)
            .body(body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let written_rows = response
            .headers()
            .get(SUMMARY_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_written_rows);
        let body = response.text().await.map_err(classify_transport)?;

        if status.is_success() {
            Ok(Response { body, written_rows })
        } else {
            Err(classify_response(status, body))
        }
    }

    async fn select(&mut self, sql: String, columns: &[ColumnRef]) -> Result<Vec<Row>, ClientError> {
        let response = self.post(format!("{} FORMAT JSONCompactEachRow", sql)).await?;
        let rows = parse_rows(&response.body)?;

        rows.into_iter()
            .map(|row| {
                if row.len() != columns.len() {
                    return Err(ClientError::Rejected(format!(
                        "expected {} columns, got {}",
                        columns.len(),
                        row.len()
                    )));
                }
                row.into_iter()
                    .zip(columns)
                    .map(|(value, column)| {
                        column.kind.conform(value).map_err(|reason| {
                            ClientError::Rejected(format!("{}: {}", column.name, reason))
                        })
                    })
                    .collect()
            })
            .collect()
    }
}

#[async_trait]
impl Connection for ClickHouseConnection {
    fn engine(&self) -> &'static str {
        ENGINE
    }

    async fn ping(&mut self) -> Result<(), ClientError> {
        self.post("SELECT 1".to_string()).await.map(|_| ())
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, ClientError> {
        let sql = bind_literals(sql, params).map_err(ClientError::Rejected)?;
        let response = self.post(format!("{} FORMAT JSONCompactEachRow", sql)).await?;
        parse_rows(&response.body)
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, ClientError> {
        let sql = bind_literals(sql, params).map_err(ClientError::Rejected)?;
        let response = self.post(sql).await?;
        Ok(response.written_rows.unwrap_or(0))
    }

    async fn bulk_insert(
        &mut self,
        table: &str,
        columns: &[String],
        rows: &[Row],
    ) -> Result<u64, ClientError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let column_list = columns
            .iter()
            .map(|column| quote_identifier(column, '`'))
            .collect::<Vec<_>>()
            .join(", ");

        let mut body = format!(
            "INSERT INTO {} ({}) FORMAT JSONCompactEachRow\n",
            self.table_ref(table),
            column_list
        );
        for row in rows {
            body.push_str(&format_json_row(row));
            body.push('\n');
        }

        let response = self.post(body).await?;
        Ok(response.written_rows.unwrap_or(rows.len() as u64))
    }

    async fn list_tables(&mut self) -> Result<Vec<String>, ClientError> {
        let database = Value::Text(self.http.database.clone());
        let rows = self
            .query(
                "SELECT name FROM system.tables WHERE database = ? AND NOT is_temporary ORDER BY name",
                &[database],
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
        let params = [
            Value::Text(self.http.database.clone()),
            Value::Text(table.to_string()),
        ];
        let rows = self
            .query(
                "SELECT name, type, default_expression, is_in_sorting_key \
                 FROM system.columns WHERE database = ? AND table = ? ORDER BY position",
                &params,
            )
            .await?;

        rows.into_iter()
            .map(|row| {
                let mut fields = row.into_iter();
                match (fields.next(), fields.next(), fields.next(), fields.next()) {
                    (
                        Some(Value::Text(name)),
                        Some(Value::Text(data_type)),
                        default,
                        in_key,
                    ) => Ok(SourceColumn {
                        column_name: name,
                        is_nullable: data_type.starts_with("Nullable("),
                        data_type,
                        numeric_precision: None,
                        numeric_scale: None,
                        default: match default {
                            Some(Value::Text(text)) if !text.is_empty() => Some(text),
                            _ => None,
                        },
                        is_primary_key: matches!(in_key, Some(Value::Int(1)) | Some(Value::Bool(true))),
                    }),
                    _ => Err(ClientError::Rejected("unexpected system.columns row".into())),
                }
            })
            .collect()
    }

    async fn read_page(&mut self, request: &PageRequest<'_>) -> Result<Vec<Row>, ClientError> {
        let sql = page_statement(&self.table_ref(request.table), request)?;
        self.select(sql, request.columns).await
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

        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = bind_literals(
            &format!(
                "SELECT {} FROM {} FINAL WHERE {} IN ({})",
                select_list(columns),
                self.table_ref(table),
                quote_identifier(key_column, '`'),
                placeholders
            ),
            keys,
        )
        .map_err(ClientError::Rejected)?;

        self.select(sql, columns).await
    }

    async fn count_rows(&mut self, table: &str) -> Result<u64, ClientError> {
        let sql = format!("SELECT count() FROM {} FINAL", self.table_ref(table));
        let rows = self.query(&sql, &[]).await?;

        match rows.first().and_then(|row| row.first()) {
            Some(Value::Int(count)) => Ok(*count as u64),
            Some(Value::Text(count)) => count
                .parse()
                .map_err(|_| ClientError::Rejected(format!("bad row count '{}'", count))),
            _ => Err(ClientError::Rejected(format!("no row count for {}", table))),
        }
    }

    async fn create_table(&mut self, spec: &TableSpec) -> Result<(), ClientError> {
        let sql = create_table_statement(&self.table_ref(&spec.target_name), spec);
        debug!("Creating table {}", spec.target_name);
        self.post(sql).await.map(|_| ())
    }

    async fn federated_pull(
        &mut self,
        spec: &TableSpec,
        source: &FederatedSource,
    ) -> Result<u64, ClientError> {
        let sql = federated_pull_statement(&self.table_ref(&spec.target_name), spec, source);
        let response = self.post(sql).await?;
        Ok(response.written_rows.unwrap_or(0))
    }
}

fn table_ref(database: &str, table: &str) -> String {
    format!(
        "{}.{}",
        quote_identifier(database, '`'),
        quote_identifier(table, '`')
    )
}

// FINAL merges rows that share a key, so rewritten batches read back once.
fn page_statement(table_ref: &str, request: &PageRequest<'_>) -> Result<String, ClientError> {
    let key = quote_identifier(request.key_column, '`');
    let mut sql = format!("SELECT {} FROM {} FINAL", select_list(request.columns), table_ref);
    if let Some(after) = request.after {
        sql = bind_literals(&format!("{} WHERE {} > ?", sql, key), &[after.clone()])
            .map_err(ClientError::Rejected)?;
    }
    sql.push_str(&format!(" ORDER BY {} LIMIT {}", key, request.limit));
    Ok(sql)
}

fn create_table_statement(table_ref: &str, spec: &TableSpec) -> String {
    let columns = spec
        .columns
        .iter()
        .map(|column| format!("{} {}", quote_identifier(&column.target_name, '`'), column.target_type))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}) ENGINE = ReplacingMergeTree ORDER BY {}",
        table_ref,
        columns,
        quote_identifier(&spec.key_column().target_name, '`')
    )
}

/// `INSERT ... SELECT` through the `postgresql` table function. Columns whose
/// text form differs between the engines are converted on the way in.
fn federated_pull_statement(table_ref: &str, spec: &TableSpec, source: &FederatedSource) -> String {
    let target_columns = spec
        .columns
        .iter()
        .map(|column| quote_identifier(&column.target_name, '`'))
        .collect::<Vec<_>>()
        .join(", ");

    let source_columns = spec
        .columns
        .iter()
        .map(|column| {
            let name = quote_identifier(&column.name, '`');
            match column.coercion {
                Coercion::UuidToString | Coercion::JsonToString => format!("toString({})", name),
                Coercion::BytesToHex => format!("lower(hex({}))", name),
                _ => name,
            }
        })
        .collect::<Vec<_>>()
        .join(", ");

    // postgresql('host:port', 'database', 'table', 'user', 'password', 'schema')
    format!(
        "INSERT INTO {} ({}) SELECT {} FROM postgresql({}, {}, {}, {}, {}, {})",
        table_ref,
        target_columns,
        source_columns,
        format_string_value(format!("{}:{}", source.host, source.port)),
        format_string_value(&source.database),
        format_string_value(&spec.name),
        format_string_value(&source.username),
        format_string_value(&source.password),
        format_string_value(&source.schema),
    )
}

fn select_list(columns: &[ColumnRef]) -> String {
    columns
        .iter()
        .map(|column| quote_identifier(&column.name, '`'))
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_rows(body: &str) -> Result<Vec<Row>, ClientError> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields: Vec<serde_json::Value> = serde_json::from_str(line)
                .map_err(|err| ClientError::Rejected(format!("malformed result row: {}", err)))?;
            Ok(fields.into_iter().map(parse_json_value).collect())
        })
        .collect()
}

fn parse_written_rows(summary: &str) -> Option<u64> {
    let summary: serde_json::Value = serde_json::from_str(summary).ok()?;
    match summary.get("written_rows")? {
        serde_json::Value::String(rows) => rows.parse().ok(),
        serde_json::Value::Number(rows) => rows.as_u64(),
        _ => None,
    }
}

fn classify_transport(err: reqwest::Error) -> ClientError {
    if err.is_timeout() {
        ClientError::Timeout(Duration::ZERO)
    } else {
        ClientError::Connection(err.to_string())
    }
}

fn classify_response(status: StatusCode, body: String) -> ClientError {
    let message = body.trim().to_string();
    let code = error_code(&message);
    let is = |codes: &[u32]| code.map_or(false, |code| codes.contains(&code));

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN || is(AUTHENTICATION_CODES) {
        ClientError::Authentication(message)
    } else if status == StatusCode::BAD_GATEWAY
        || status == StatusCode::GATEWAY_TIMEOUT
        || is(CONNECTION_CODES)
    {
        ClientError::Connection(message)
    } else if status == StatusCode::SERVICE_UNAVAILABLE
        || status == StatusCode::TOO_MANY_REQUESTS
        || is(BUSY_CODES)
    {
        ClientError::Busy(message)
    } else if is(INVALID_DATA_CODES) {
        ClientError::InvalidData(message)
    } else {
        ClientError::Rejected(message)
    }
}

/// The number after `Code: ` in a ClickHouse exception text.
fn error_code(message: &str) -> Option<u32> {
    let (_, rest) = message.split_once("Code: ")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}
