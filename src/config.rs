use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use toml::Value;

use crate::migrate::migration_options::{TableOptions, DEFAULT_BATCH_SIZE, DEFAULT_QUEUE_DEPTH};
use crate::verify::VerifyOptions;

const DEFAULT_SCHEMA: &str = "public";
const DEFAULT_POOL_SIZE: u32 = 4;

#[derive(Debug)]
pub(crate) struct Config {
    source_database: DatabaseConfig,
    target_database: DatabaseConfig,
    settings: SettingsConfig,
    verify: VerifyOptions,
    tables: HashMap<String, TableOptions>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub schema: String,
    pub pool_size: u32,
}

#[derive(Debug, Clone)]
pub struct SettingsConfig {
    pub batch_size: usize,
    pub queue_depth: usize,
    pub max_retries: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub acquire_timeout: Duration,
    pub statement_timeout: Duration,
    pub checkpoint_dir: String,
    pub whitelisted_tables: Vec<String>,
}

impl Config {
    pub(crate) fn from_toml(config: Value) -> Result<Self> {
        let source_database = parse_database_config(
            config
                .get("source")
                .ok_or(anyhow!("Missing or invalid source database settings"))?,
        )?;
        let target_database = parse_database_config(
            config
                .get("target")
                .ok_or(anyhow!("Missing or invalid target database settings"))?,
        )?;
        let settings = parse_settings_config(config.get("settings"))?;
        let verify = parse_verify_config(config.get("verify"))?;
        let tables = parse_tables_config(config.get("tables"))?;

        Ok(Config {
            source_database,
            target_database,
            settings,
            verify,
            tables,
        })
    }

    pub fn source_database(&self) -> &DatabaseConfig {
        &self.source_database
    }

    pub fn target_database(&self) -> &DatabaseConfig {
        &self.target_database
    }

    pub fn settings(&self) -> &SettingsConfig {
        &self.settings
    }

    pub fn verify(&self) -> &VerifyOptions {
        &self.verify
    }

    pub fn tables(&self) -> &HashMap<String, TableOptions> {
        &self.tables
    }
}

fn parse_database_config(config: &Value) -> Result<DatabaseConfig> {
    let host = config
        .get("host")
        .and_then(|value| value.as_str())
        .ok_or_else(|| anyhow!("Missing or invalid host"))?
        .to_string();

    let port = config
        .get("port")
        .and_then(|value| value.as_integer())
        .ok_or_else(|| anyhow!("Missing or invalid port"))?
        .try_into()?;

    let username = config
        .get("username")
        .and_then(|value| value.as_str())
        .ok_or_else(|| anyhow!("Missing or invalid username"))?
        .to_string();

    let password = config
        .get("password")
        .and_then(|value| value.as_str())
        .ok_or_else(|| anyhow!("Missing or invalid password"))?
        .to_string();

    let database = config
        .get("database")
        .and_then(|value| value.as_str())
        .ok_or_else(|| anyhow!("Missing or invalid database"))?
        .to_string();

    let schema = match config.get("schema") {
        Some(value) => value
            .as_str()
            .ok_or_else(|| anyhow!("Missing or invalid schema"))?
            .to_string(),
        None => DEFAULT_SCHEMA.to_string(),
    };

    let pool_size = optional_integer(config, "pool_size")?
        .map(u32::try_from)
        .transpose()?
        .unwrap_or(DEFAULT_POOL_SIZE);

    Ok(DatabaseConfig {
        host,
        port,
        username,
        password,
        database,
        schema,
        pool_size,
    })
}

fn parse_settings_config(config: Option<&Value>) -> Result<SettingsConfig> {
    let empty = Value::Table(Default::default());
    let config = config.unwrap_or(&empty);

    let batch_size = optional_integer(config, "batch_size")?
        .map(usize::try_from)
        .transpose()?
        .unwrap_or(DEFAULT_BATCH_SIZE);

    let queue_depth = optional_integer(config, "queue_depth")?
        .map(usize::try_from)
        .transpose()?
        .unwrap_or(DEFAULT_QUEUE_DEPTH);

    let max_retries = optional_integer(config, "max_retries")?
        .map(usize::try_from)
        .transpose()?
        .unwrap_or(5);

    let millis = |key: &str, default: u64| -> Result<Duration> {
        let value = optional_integer(config, key)?
            .map(u64::try_from)
            .transpose()?
            .unwrap_or(default);
        Ok(Duration::from_millis(value))
    };

    let retry_base_delay = millis("retry_base_delay_ms", 250)?;
    let retry_max_delay = millis("retry_max_delay_ms", 10_000)?;
    let acquire_timeout = millis("acquire_timeout_ms", 30_000)?;
    let statement_timeout = millis("statement_timeout_ms", 300_000)?;

    let checkpoint_dir = match config.get("checkpoint_dir") {
        Some(value) => value
            .as_str()
            .ok_or_else(|| anyhow!("Missing or invalid checkpoint directory"))?
            .to_string(),
        None => "checkpoints".to_string(),
    };

    let whitelisted_tables = match config.get("whitelisted_tables") {
        Some(value) => string_list(value)
            .ok_or_else(|| anyhow!("Missing or invalid whitelisted tables"))?,
        None => Vec::new(),
    };

    Ok(SettingsConfig {
        batch_size,
        queue_depth,
        max_retries,
        retry_base_delay,
        retry_max_delay,
        acquire_timeout,
        statement_timeout,
        checkpoint_dir,
        whitelisted_tables,
    })
}

fn parse_verify_config(config: Option<&Value>) -> Result<VerifyOptions> {
    let mut verify = VerifyOptions::default();
    let Some(config) = config else {
        return Ok(verify);
    };

    if let Some(value) = config.get("sample_fraction") {
        let fraction = value
            .as_float()
            .or_else(|| value.as_integer().map(|v| v as f64))
            .ok_or_else(|| anyhow!("Missing or invalid sample fraction"))?;
        if !(0.0..=1.0).contains(&fraction) {
            bail!("Sample fraction must be between 0 and 1, got {}", fraction);
        }
        verify.sample_fraction = fraction;
    }

    if let Some(value) = config.get("checksum") {
        verify.checksum = value
            .as_bool()
            .ok_or_else(|| anyhow!("Missing or invalid checksum flag"))?;
    }

    Ok(verify)
}

fn parse_tables_config(config: Option<&Value>) -> Result<HashMap<String, TableOptions>> {
    let Some(config) = config else {
        return Ok(HashMap::new());
    };
    let tables = config
        .as_table()
        .ok_or_else(|| anyhow!("Missing or invalid tables settings"))?;

    tables
        .iter()
        .map(|(name, table)| {
            let drop_columns = match table.get("drop_columns") {
                Some(value) => string_list(value).ok_or_else(|| {
                    anyhow!("Missing or invalid drop_columns for table {}", name)
                })?,
                None => Vec::new(),
            };

            let key = match table.get("key") {
                Some(value) => Some(
                    value
                        .as_str()
                        .ok_or_else(|| anyhow!("Missing or invalid key for table {}", name))?
                        .to_string(),
                ),
                None => None,
            };

            Ok((name.clone(), TableOptions { drop_columns, key }))
        })
        .collect()
}

fn optional_integer(config: &Value, key: &str) -> Result<Option<i64>> {
    match config.get(key) {
        Some(value) => value
            .as_integer()
            .map(Some)
            .ok_or_else(|| anyhow!("Missing or invalid {}", key.replace('_', " "))),
        None => Ok(None),
    }
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|value| value.as_str().map(|s| s.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        [source]
        host = "localhost"
        port = 5432
        username = "postgres"
        password = "secret"
        database = "shop"

        [target]
        host = "localhost"
        port = 8123
        username = "default"
        password = ""
        database = "analytics"
        pool_size = 8

        [settings]
        batch_size = 10000
        whitelisted_tables = ["users", "orders"]

        [verify]
        sample_fraction = 0.05
        checksum = true

        [tables.users]
        drop_columns = ["password_hash"]

        [tables.events]
        key = "event_id"
    "#;

    #[test]
    fn full_config_parses() {
        let config = Config::from_toml(CONFIG.parse().unwrap()).unwrap();

        assert_eq!(config.source_database().schema, "public");
        assert_eq!(config.source_database().pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(config.target_database().pool_size, 8);
        assert_eq!(config.settings().batch_size, 10_000);
        assert_eq!(config.settings().queue_depth, DEFAULT_QUEUE_DEPTH);
        assert_eq!(config.settings().whitelisted_tables, vec!["users", "orders"]);
        assert_eq!(config.verify().sample_fraction, 0.05);
        assert!(config.verify().checksum);
        assert_eq!(
            config.tables()["users"].drop_columns,
            vec!["password_hash".to_string()]
        );
        assert_eq!(config.tables()["events"].key.as_deref(), Some("event_id"));
    }

    #[test]
    fn missing_sections_and_fields_are_reported() {
        let no_target: Value = r#"
            [source]
            host = "localhost"
            port = 5432
            username = "postgres"
            password = "secret"
            database = "shop"
        "#
        .parse()
        .unwrap();
        let err = Config::from_toml(no_target).unwrap_err();
        assert!(err.to_string().contains("target database"));

        let bad_port: Value = CONFIG.replace("port = 8123", "port = \"8123\"").parse().unwrap();
        let err = Config::from_toml(bad_port).unwrap_err();
        assert_eq!(err.to_string(), "Missing or invalid port");
    }

    #[test]
    fn out_of_range_sample_fraction_is_rejected() {
        let config: Value = CONFIG
            .replace("sample_fraction = 0.05", "sample_fraction = 1.5")
            .parse()
            .unwrap();

        assert!(Config::from_toml(config).is_err());
    }
}
