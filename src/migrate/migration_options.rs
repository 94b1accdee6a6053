use std::collections::HashMap;

use anyhow::{bail, Result};

use crate::connection::FederatedSource;
use crate::migrate::retry::RetryPolicy;
use crate::verify::VerifyOptions;

pub const DEFAULT_BATCH_SIZE: usize = 5_000;
pub const MAX_BATCH_SIZE: usize = 100_000;
pub const DEFAULT_QUEUE_DEPTH: usize = 4;

/// Per-table overrides from the configuration file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableOptions {
    pub drop_columns: Vec<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub(crate) format_snake_case: bool,
    pub(crate) parallelism: usize,
    pub(crate) batch_size: usize,
    pub(crate) queue_depth: usize,
    pub(crate) retry: RetryPolicy,
    pub(crate) whitelisted_tables: Vec<String>,
    pub(crate) tables: HashMap<String, TableOptions>,
    pub(crate) verify: Option<VerifyOptions>,
    pub(crate) federated: Option<FederatedSource>,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        MigrationOptions {
            format_snake_case: false,
            parallelism: 4,
            batch_size: DEFAULT_BATCH_SIZE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            retry: RetryPolicy::default(),
            whitelisted_tables: Vec::new(),
            tables: HashMap::new(),
            verify: None,
            federated: None,
        }
    }
}

impl MigrationOptions {
    pub fn table(&self, name: &str) -> TableOptions {
        self.tables.get(name).cloned().unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            bail!(
                "Batch size must be between 1 and {}, got {}",
                MAX_BATCH_SIZE,
                self.batch_size
            );
        }
        if self.queue_depth == 0 {
            bail!("Queue depth must be at least 1");
        }
        if self.parallelism == 0 {
            bail!("Parallelism must be at least 1");
        }
        if let Some(verify) = &self.verify {
            if !(0.0..=1.0).contains(&verify.sample_fraction) {
                bail!(
                    "Sample fraction must be between 0 and 1, got {}",
                    verify.sample_fraction
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_bounds() {
        let mut options = MigrationOptions::default();
        assert!(options.validate().is_ok());

        options.batch_size = 0;
        assert!(options.validate().is_err());

        options.batch_size = MAX_BATCH_SIZE;
        assert!(options.validate().is_ok());

        options.batch_size = MAX_BATCH_SIZE + 1;
        assert!(options.validate().is_err());
    }
}
