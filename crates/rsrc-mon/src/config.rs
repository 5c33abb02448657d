use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use clap::ValueEnum;
use tracing_subscriber::filter::LevelFilter;
use utils::version;

use crate::monitor::MonitorConfig;
use crate::pool::PoolConfig;

pub const DEFAULT_SHM_ID: &str = "rsrc_mon_device_pool";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    None,
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::None => LevelFilter::OFF,
            // tracing has no level above error
            LogLevel::Fatal | LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Real-time view of the encoder/decoder resources on this host.
///
/// BEST marks the module of lowest realtime load, the one selected for the
/// next auto-allocated job. Returns 0 on success, 1 on failure.
#[derive(Parser, Debug, Clone)]
#[command(about, long_about, version = &**version::VERSION, disable_version_flag = true)]
pub struct Cli {
    #[arg(
        value_name = "INTERVAL",
        conflicts_with = "interval",
        help = "Reporting interval in seconds, same as --interval"
    )]
    pub interval_arg: Option<u64>,

    #[arg(
        short = 'n',
        long,
        env = "RSRC_MON_INTERVAL",
        default_value_t = 0,
        help = "Reporting interval in seconds. If 0, report only once"
    )]
    pub interval: u64,

    #[arg(
        short = 't',
        long,
        default_value_t = 0,
        help = "Seconds to wait for at least one device before failing. If 0, wait indefinitely"
    )]
    pub timeout: u64,

    #[arg(
        short = 'r',
        long,
        help = "Register cards regardless of firmware revision compatibility"
    )]
    pub ignore_fw_revision: bool,

    #[arg(short = 'i', long, help = "Do not refresh the device list on every iteration")]
    pub no_refresh: bool,

    #[arg(short = 'o', long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    #[arg(
        short = 'l',
        long,
        value_enum,
        help = "Log level; RUST_LOG applies when unset, defaulting to info"
    )]
    pub log_level: Option<LogLevel>,

    #[arg(
        long,
        env = "RSRC_MON_LOG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Also write diagnostics to this file, rotated daily"
    )]
    pub log_file: Option<PathBuf>,

    #[arg(
        long,
        env = "RSRC_MON_SHM_ID",
        default_value = DEFAULT_SHM_ID,
        help = "Shared memory id of the device pool"
    )]
    pub shm_id: String,

    #[arg(
        long,
        value_hint = clap::ValueHint::DirPath,
        default_value = "/sys",
        help = "Sysfs root scanned for NVMe controllers"
    )]
    pub sysfs_root: PathBuf,

    #[arg(
        long,
        value_hint = clap::ValueHint::DirPath,
        default_value = "/dev",
        help = "Directory holding the device nodes"
    )]
    pub dev_root: PathBuf,

    #[arg(
        long,
        default_value = "T4",
        help = "Model substring identifying supported cards"
    )]
    pub model_tag: String,

    #[arg(
        long,
        default_value_t = 1000,
        help = "Milliseconds to wait for the pool lock before skipping a read"
    )]
    pub lock_timeout_ms: u64,

    #[arg(short = 'v', long, action = clap::ArgAction::Version, help = "Print version")]
    version: (),
}

impl Cli {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_arg.unwrap_or(self.interval))
    }

    pub fn match_fw_revision(&self) -> bool {
        !self.ignore_fw_revision
    }
}

impl From<&Cli> for PoolConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            shm_id: cli.shm_id.clone(),
            match_fw_revision: cli.match_fw_revision(),
            init_timeout: Duration::from_secs(cli.timeout),
            lock_timeout: Duration::from_millis(cli.lock_timeout_ms),
            ..PoolConfig::default()
        }
    }
}

impl From<&Cli> for MonitorConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            interval: cli.interval(),
            refresh: !cli.no_refresh,
            match_fw_revision: cli.match_fw_revision(),
        }
    }
}
