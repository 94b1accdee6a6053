use std::path::PathBuf;

use structopt::clap::AppSettings;
use structopt::StructOpt;
use uuid::Uuid;

#[derive(Debug, StructOpt)]
#[structopt(
name = "PgHouseMigrator",
version = env ! ("CARGO_PKG_VERSION"),
about = "Migrates PostgreSQL tables to ClickHouse with checkpoints, resume and verification.",
setting = AppSettings::ColoredHelp,
)]
pub struct Args {
    /// Activate verbose mode
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Activate quiet mode
    #[structopt(short = "q", long = "quiet")]
    pub quiet: bool,

    /// Path of the configuration file
    #[structopt(short = "c", long = "config", default_value = "config.toml", parse(from_os_str))]
    pub config: PathBuf,

    /// Path of an optional file with additional type mappings
    #[structopt(short = "m", long = "mappings", default_value = "mappings.toml", parse(from_os_str))]
    pub mappings: PathBuf,

    /// Tables to migrate, all tables when omitted
    #[structopt(short = "t", long = "table")]
    pub tables: Vec<String>,

    /// Rows per batch, overrides the configuration file
    #[structopt(short = "b", long = "batch-size")]
    pub batch_size: Option<usize>,

    /// Tables migrated at the same time, defaults to the target pool size
    #[structopt(short = "p", long = "parallelism")]
    pub parallelism: Option<usize>,

    /// Resume the run with this id
    #[structopt(short = "r", long = "resume")]
    pub resume: Option<Uuid>,

    /// Verify every table after it was migrated
    #[structopt(long = "verify")]
    pub verify: bool,

    /// Share of rows compared during verification
    #[structopt(long = "sample")]
    pub sample: Option<f64>,

    /// Also compare a checksum over all rows during verification
    #[structopt(long = "checksum")]
    pub checksum: bool,

    /// Let ClickHouse pull each table straight from PostgreSQL
    #[structopt(long = "federated")]
    pub federated: bool,

    /// Format snake case table and column names
    #[structopt(short = "f", long = "format")]
    pub format: bool,
}
