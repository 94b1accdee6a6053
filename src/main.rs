#[macro_use]
extern crate log;

use std::io::Write;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::{env, fs, thread};

use anyhow::{Context, Result};
use chrono::Local;
use env_logger::Env;
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;
use toml::Value;

use crate::args::Args;
use crate::common::helpers::print_error_chain;
use crate::config::Config;
use crate::connection::clickhouse::ClickHouseConnector;
use crate::connection::postgres::PostgresConnector;
use crate::connection::{ConnectionProvider, FederatedSource, PoolOptions};
use crate::mappings::Mappings;
use crate::migrate::migration_options::MigrationOptions;
use crate::migrate::migrator::{DatabaseMigrator, MigrationRequest, TableSelection};
use crate::migrate::retry::RetryPolicy;
use crate::state::{FileCheckpointStore, Status};
use crate::verify::VerifyOptions;

mod args;
mod common;
mod config;
mod connection;
mod error;
mod extract;
mod insert;
mod mappings;
mod migrate;
mod state;
mod verify;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    match init().await.with_context(|| "Migration failed") {
        Ok(state) => ExitCode::from(exit_status(state)),
        Err(err) => {
            print_error_chain(&err);
            ExitCode::FAILURE
        }
    }
}

/// 0 for a completed run, 2 for a paused one that can be resumed, 1 otherwise.
fn exit_status(state: Status) -> u8 {
    match state {
        Status::Completed => 0,
        Status::Paused => 2,
        _ => 1,
    }
}

async fn init() -> Result<Status> {
    let options = Args::from_args();

    initialize_logger(options.verbose, options.quiet);

    // Parse config
    let config = load_config(&options.config).context("Failed to load config file")?;
    let mappings = load_mappings(&options.mappings).context("Failed to load mappings file")?;

    debug!("Total mappings loaded: {}", mappings.len());
    info!("Initializing connections...");

    let settings = config.settings();
    let source = PostgresConnector::new(config.source_database(), settings.statement_timeout);
    let target = ClickHouseConnector::new(config.target_database(), settings.statement_timeout)
        .context("Failed to create ClickHouse client")?;

    let pool_options = PoolOptions {
        source_size: config.source_database().pool_size,
        target_size: config.target_database().pool_size,
        acquire_timeout: settings.acquire_timeout,
    };
    let provider = ConnectionProvider::new(Arc::new(source), Arc::new(target), &pool_options);
    provider
        .check()
        .await
        .context("Failed to connect to the databases")?;

    let migration_options = build_migration_options(&config, &options);
    migration_options.validate()?;

    let cancel = CancellationToken::new();
    watch_interrupt(cancel.clone());

    let store = Arc::new(FileCheckpointStore::new(&settings.checkpoint_dir));
    let mut migrator =
        DatabaseMigrator::new(provider, store, mappings, migration_options, cancel);

    let request = MigrationRequest {
        tables: if options.tables.is_empty() {
            TableSelection::All
        } else {
            TableSelection::Named(options.tables.clone())
        },
        resume: options.resume,
    };

    let report = migrator.run(request).await?;
    report.log_summary();
    if report.state != Status::Completed {
        warn!("Run {} ended {}", report.run_id, report.state);
    }

    Ok(report.state)
}

fn build_migration_options(config: &Config, options: &Args) -> MigrationOptions {
    let settings = config.settings();

    let verify = if options.verify || options.checksum || options.sample.is_some() {
        let defaults = config.verify();
        Some(VerifyOptions {
            sample_fraction: options.sample.unwrap_or(defaults.sample_fraction),
            checksum: options.checksum || defaults.checksum,
        })
    } else {
        None
    };

    let federated = options.federated.then(|| {
        let source = config.source_database();
        FederatedSource {
            host: source.host.clone(),
            port: source.port,
            database: source.database.clone(),
            schema: source.schema.clone(),
            username: source.username.clone(),
            password: source.password.clone(),
        }
    });

    MigrationOptions {
        format_snake_case: options.format,
        parallelism: options
            .parallelism
            .unwrap_or(config.target_database().pool_size as usize),
        batch_size: options.batch_size.unwrap_or(settings.batch_size),
        queue_depth: settings.queue_depth,
        retry: RetryPolicy::new(
            settings.max_retries,
            settings.retry_base_delay,
            settings.retry_max_delay,
        ),
        whitelisted_tables: settings.whitelisted_tables.clone(),
        tables: config.tables().clone(),
        verify,
        federated,
    }
}

// First Ctrl-C pauses at the next batch boundary.
fn watch_interrupt(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, pausing after the batches in flight");
            cancel.cancel();
        }
    });
}

fn initialize_logger(verbose: bool, quiet: bool) {
    if quiet {
        env::set_var("RUST_LOG", "warn");
    } else {
        env::set_var("RUST_LOG", if verbose { "debug" } else { "info" });
    }

    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .filter_module("sqlx", log::LevelFilter::Error)
        .filter_module("reqwest", log::LevelFilter::Error)
        .filter_module("hyper", log::LevelFilter::Error)
        .format(|buf, record| {
            let timestamp = Local::now().format("%H:%M:%S");

            writeln!(
                buf,
                "{} {:<5} [{}] - {}",
                timestamp,
                record.level(),
                thread::current().name().unwrap_or("<unnamed>"),
                record.args()
            )
        })
        .init();
}

fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Cannot read {}", path.display()))?;
    let value = content.parse::<Value>()?;
    let config = Config::from_toml(value)?;
    Ok(config)
}

// The mappings file only adds to or overrides the built-in table.
fn load_mappings(path: &Path) -> Result<Mappings> {
    let mappings = Mappings::builtin();
    if !path.exists() {
        return Ok(mappings);
    }

    let content = fs::read_to_string(path)?;
    let value = content.parse::<Value>()?;
    mappings.merge_toml(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_completed_runs_exit_cleanly() {
        assert_eq!(exit_status(Status::Completed), 0);
        assert_eq!(exit_status(Status::Failed), 1);
        assert_eq!(exit_status(Status::Paused), 2);
        assert_eq!(exit_status(Status::Running), 1);
    }
}
