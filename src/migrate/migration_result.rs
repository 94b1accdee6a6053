use uuid::Uuid;

use crate::error::RejectedRow;
use crate::state::Status;
use crate::verify::VerificationDiscrepancy;

#[derive(Debug, Clone, PartialEq)]
pub struct TableReport {
    pub table_name: String,
    pub status: Status,
    pub rows_committed: u64,
    pub rejected: Vec<RejectedRow>,
    pub error: Option<String>,
    pub discrepancies: Vec<VerificationDiscrepancy>,
}

impl TableReport {
    pub fn new(table_name: &str, status: Status) -> Self {
        TableReport {
            table_name: table_name.to_string(),
            status,
            rows_committed: 0,
            rejected: Vec::new(),
            error: None,
            discrepancies: Vec::new(),
        }
    }

    pub fn failed(table_name: &str, error: String) -> Self {
        TableReport {
            error: Some(error),
            ..TableReport::new(table_name, Status::Failed)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: Uuid,
    pub state: Status,
    pub tables: Vec<TableReport>,
}

impl RunReport {
    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|table| table.table_name == name)
    }

    pub fn rows_committed(&self) -> u64 {
        self.tables.iter().map(|table| table.rows_committed).sum()
    }

    /// Human readable summary, one line per table plus its findings.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "Run {} {}: {} tables, {} rows committed",
            self.run_id,
            self.state,
            self.tables.len(),
            self.rows_committed()
        )];

        for table in &self.tables {
            let mut line = format!(
                "  {:<32} {:<9} rows: {}",
                table.table_name, table.status, table.rows_committed
            );
            if !table.rejected.is_empty() {
                let keys: Vec<&str> = table.rejected.iter().map(|row| row.key.as_str()).collect();
                line.push_str(&format!(
                    ", rejected: {} ({})",
                    table.rejected.len(),
                    keys.join(", ")
                ));
            }
            if let Some(error) = &table.error {
                line.push_str(&format!(", error: {}", error));
            }
            lines.push(line);

            for discrepancy in &table.discrepancies {
                lines.push(format!("    ! {}", discrepancy));
            }
        }

        lines.join("\n")
    }

    pub fn log_summary(&self) {
        for line in self.summary().lines() {
            match self.state {
                Status::Completed => info!("{}", line),
                _ => warn!("{}", line),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_rejections_and_errors() {
        let mut users = TableReport::new("users", Status::Completed);
        users.rows_committed = 41;
        users.rejected.push(RejectedRow {
            key: "u7".into(),
            reason: "bad uuid".into(),
        });

        let report = RunReport {
            run_id: Uuid::nil(),
            state: Status::Failed,
            tables: vec![
                users,
                TableReport::failed("shapes", "unsupported type geometry".into()),
            ],
        };

        let summary = report.summary();

        assert!(summary.contains("FAILED: 2 tables, 41 rows committed"));
        assert!(summary.contains("rejected: 1 (u7)"));
        assert!(summary.contains("error: unsupported type geometry"));
        assert_eq!(report.table("shapes").unwrap().status, Status::Failed);
    }
}
