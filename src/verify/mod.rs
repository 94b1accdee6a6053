//! Post-run comparison of source and target tables.
//!
//! Verification only reads. It compares row counts, the fields of a random
//! sample of rows and, when asked for, a SHA-256 digest over every row in key
//! order. Without the digest the source draws the sample itself and is not
//! scanned. Findings are returned as [`VerificationDiscrepancy`] values and never
//! fail the run.

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::common::schema::TableSpec;
use crate::common::value::{ColumnRef, Row, Value};
use crate::connection::{ConnectionProvider, PageRequest, Role};
use crate::error::{ClientError, VerifyError};

const FETCH_CHUNK: usize = 1_000;
const FIELD_SEPARATOR: u8 = 0x1f;
const ROW_SEPARATOR: u8 = 0x1e;

#[derive(Debug, Clone, PartialEq)]
pub struct VerifyOptions {
    /// Share of source rows compared field by field, between 0 and 1.
    pub sample_fraction: f64,
    pub checksum: bool,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        VerifyOptions {
            sample_fraction: 0.01,
            checksum: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VerificationDiscrepancy {
    RowCount {
        source: u64,
        target: u64,
    },
    MissingRow {
        key: String,
    },
    FieldMismatch {
        key: String,
        column: String,
        source: String,
        target: String,
    },
    Checksum {
        source: String,
        target: String,
    },
}

impl fmt::Display for VerificationDiscrepancy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VerificationDiscrepancy::RowCount { source, target } => {
                write!(f, "row count differs: source {}, target {}", source, target)
            }
            VerificationDiscrepancy::MissingRow { key } => {
                write!(f, "row {} is missing from the target", key)
            }
            VerificationDiscrepancy::FieldMismatch {
                key,
                column,
                source,
                target,
            } => write!(
                f,
                "row {} column {} differs: source '{}', target '{}'",
                key, column, source, target
            ),
            VerificationDiscrepancy::Checksum { source, target } => {
                write!(f, "checksum differs: source {}, target {}", source, target)
            }
        }
    }
}

pub struct Verifier {
    provider: ConnectionProvider,
    options: VerifyOptions,
    page_size: usize,
}

impl Verifier {
    pub fn new(provider: ConnectionProvider, options: VerifyOptions, page_size: usize) -> Self {
        Verifier {
            provider,
            options,
            page_size: page_size.max(1),
        }
    }

    pub async fn verify_table(
        &self,
        spec: &TableSpec,
    ) -> Result<Vec<VerificationDiscrepancy>, VerifyError> {
        let start_time = Instant::now();
        let mut discrepancies = Vec::new();

        let source_count = self.count(Role::Source, &spec.name).await?;
        let target_count = self.count(Role::Target, &spec.target_name).await?;
        if source_count != target_count {
            discrepancies.push(VerificationDiscrepancy::RowCount {
                source: source_count,
                target: target_count,
            });
        }

        let (sample, source_digest) = if self.options.checksum {
            let scan = self.scan_source(spec).await?;
            (scan.sample, scan.digest)
        } else {
            (self.sample_source(spec, source_count).await?, None)
        };
        discrepancies.extend(self.compare_sample(spec, sample).await?);

        if let Some(source_digest) = source_digest {
            let target_digest = self.target_digest(spec).await?;
            if source_digest != target_digest {
                discrepancies.push(VerificationDiscrepancy::Checksum {
                    source: source_digest,
                    target: target_digest,
                });
            }
        }

        info!(
            "Table {} verified, discrepancies: {}, took: {}s",
            spec.target_name,
            discrepancies.len(),
            start_time.elapsed().as_secs_f32()
        );

        Ok(discrepancies)
    }

    async fn count(&self, role: Role, table: &str) -> Result<u64, VerifyError> {
        let mut conn = self.provider.acquire(role).await?;
        conn.count_rows(table)
            .await
            .map_err(|source| query_error(role, table, source))
    }

    // Stores that cannot sample on their own are scanned instead.
    async fn sample_source(
        &self,
        spec: &TableSpec,
        source_count: u64,
    ) -> Result<Vec<Row>, VerifyError> {
        let columns = spec.source_columns();
        let key_column = &spec.key_column().name;

        let drawn = {
            let mut conn = self.provider.acquire(Role::Source).await?;
            conn.sample_rows(&spec.name, &columns, key_column, self.options.sample_fraction)
                .await
        };
        let rows = match drawn {
            Ok(rows) => rows,
            Err(ClientError::Unsupported { .. }) => return Ok(self.scan_source(spec).await?.sample),
            Err(source) => return Err(query_error(Role::Source, &spec.name, source)),
        };

        let mut sample: Vec<Row> = rows
            .into_iter()
            .filter_map(|row| spec.coerce_row(row).ok())
            .collect();

        if sample.is_empty() && source_count > 0 {
            let first = self
                .page(Role::Source, &spec.name, &columns, key_column, None)
                .await?
                .into_iter()
                .find_map(|row| spec.coerce_row(row).ok());
            sample.extend(first);
        }

        Ok(sample)
    }

    // One pass over the source: draws the sample and feeds the digest.
    async fn scan_source(&self, spec: &TableSpec) -> Result<SourceScan, VerifyError> {
        let mut rng = StdRng::from_entropy();
        let mut hasher = self.options.checksum.then(Sha256::new);
        let mut sample = Vec::new();
        let mut fallback: Option<Row> = None;
        let mut seen = 0u64;

        let columns = spec.source_columns();
        let key_column = &spec.key_column().name;
        let mut after: Option<Value> = None;

        loop {
            let rows = self
                .page(Role::Source, &spec.name, &columns, key_column, after.as_ref())
                .await?;
            let Some(last) = rows.last() else { break };
            after = Some(spec.key_of(last).clone());
            let full_page = rows.len() == self.page_size;

            for row in rows {
                // Rows the writer rejects never reach the target; they show up in the counts.
                let Ok(coerced) = spec.coerce_row(row) else {
                    continue;
                };

                if let Some(hasher) = hasher.as_mut() {
                    feed(hasher, &coerced);
                }

                seen += 1;
                if rng.gen_bool(self.options.sample_fraction) {
                    sample.push(coerced);
                } else if sample.is_empty() && rng.gen_range(0..seen) == 0 {
                    fallback = Some(coerced);
                }
            }

            if !full_page {
                break;
            }
        }

        if sample.is_empty() {
            sample.extend(fallback);
        }

        Ok(SourceScan {
            sample,
            digest: hasher.map(|hasher| hex::encode(hasher.finalize())),
        })
    }

    async fn compare_sample(
        &self,
        spec: &TableSpec,
        sample: Vec<Row>,
    ) -> Result<Vec<VerificationDiscrepancy>, VerifyError> {
        let columns = spec.target_columns();
        let key_column = &spec.key_column().target_name;
        let mut discrepancies = Vec::new();

        for chunk in sample.chunks(FETCH_CHUNK) {
            let keys: Vec<Value> = chunk.iter().map(|row| spec.key_of(row).clone()).collect();

            let mut conn = self.provider.acquire(Role::Target).await?;
            let target_rows = conn
                .fetch_rows(&spec.target_name, &columns, key_column, &keys)
                .await
                .map_err(|source| query_error(Role::Target, &spec.target_name, source))?;

            for expected in chunk {
                let key = spec.key_of(expected);
                let found = target_rows
                    .iter()
                    .find(|row| spec.key_of(row).same_as(key));

                let Some(actual) = found else {
                    discrepancies.push(VerificationDiscrepancy::MissingRow {
                        key: key.to_string(),
                    });
                    continue;
                };

                for ((want, got), column) in expected.iter().zip(actual).zip(&spec.columns) {
                    if !want.same_as(got) {
                        discrepancies.push(VerificationDiscrepancy::FieldMismatch {
                            key: key.to_string(),
                            column: column.target_name.clone(),
                            source: want.to_string(),
                            target: got.to_string(),
                        });
                    }
                }
            }
        }

        Ok(discrepancies)
    }

    async fn target_digest(&self, spec: &TableSpec) -> Result<String, VerifyError> {
        let mut hasher = Sha256::new();
        let columns = spec.target_columns();
        let key_column = &spec.key_column().target_name;
        let mut after: Option<Value> = None;

        loop {
            let rows = self
                .page(Role::Target, &spec.target_name, &columns, key_column, after.as_ref())
                .await?;
            let Some(last) = rows.last() else { break };
            after = Some(spec.key_of(last).clone());
            let full_page = rows.len() == self.page_size;

            for row in &rows {
                feed(&mut hasher, row);
            }

            if !full_page {
                break;
            }
        }

        Ok(hex::encode(hasher.finalize()))
    }

    async fn page(
        &self,
        role: Role,
        table: &str,
        columns: &[ColumnRef],
        key_column: &str,
        after: Option<&Value>,
    ) -> Result<Vec<Row>, VerifyError> {
        let mut conn = self.provider.acquire(role).await?;
        let request = PageRequest {
            table,
            columns,
            key_column,
            after,
            limit: self.page_size,
        };
        conn.read_page(&request)
            .await
            .map_err(|source| query_error(role, table, source))
    }
}

struct SourceScan {
    sample: Vec<Row>,
    digest: Option<String>,
}

fn feed(hasher: &mut Sha256, row: &[Value]) {
    for value in row {
        hasher.update(value.canonical_text().as_bytes());
        hasher.update([FIELD_SEPARATOR]);
    }
    hasher.update([ROW_SEPARATOR]);
}

fn query_error(role: Role, table: &str, source: ClientError) -> VerifyError {
    VerifyError::Query {
        role,
        table: table.to_string(),
        source,
    }
}
