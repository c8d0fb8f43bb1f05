//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use uuid::Uuid;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "feedline";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_OPS_PORT: u16 = 3100;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_DB_JOBS_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_JOB_FANOUT_POST_CONCURRENCY: u32 = 2;
const DEFAULT_JOB_FANOUT_BATCH_CONCURRENCY: u32 = 8;
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 60 * 60;
const DEFAULT_FANOUT_BATCH_SIZE: u64 = 100;
const DEFAULT_FANOUT_JOB_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_STORE_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_STORE_RETRY_BASE_MS: u64 = 100;
const DEFAULT_CACHE_LIST_LIMIT: u64 = 1000;
const DEFAULT_CACHE_PAGE_SIZE: u32 = 10;
const DEFAULT_CACHE_MAX_PAGE_SIZE: u32 = 20;
const DEFAULT_CACHE_MATERIALIZE_ATTEMPTS: u32 = 3;
const DEFAULT_CACHE_MAX_KEYS: u64 = 100_000;
/// One feed window occupies three keys.
const MIN_CACHE_MAX_KEYS: usize = 3;

/// Command-line arguments for the feedline binary.
#[derive(Debug, Parser)]
#[command(name = "feedline", version, about = "Fan-out-on-write timeline pipeline")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "FEEDLINE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the fan-out workers and the ops listener.
    Serve(Box<ServeArgs>),
    /// Fan a post out to its author's followers.
    Fanout(FanoutArgs),
    /// Print one page of a subscriber's feed as JSON.
    Timeline(TimelineArgs),
    /// Apply database migrations and create the job queue schema.
    Migrate(MigrateArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the ops listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the ops listener port.
    #[arg(long = "server-ops-port", value_name = "PORT")]
    pub ops_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the jobs database pool size.
    #[arg(long = "database-jobs-max-connections", value_name = "COUNT")]
    pub database_jobs_max_connections: Option<u32>,

    /// Override the fanout-post worker concurrency.
    #[arg(long = "jobs-fanout-post-concurrency", value_name = "COUNT")]
    pub jobs_fanout_post_concurrency: Option<u32>,

    /// Override the fanout-batch worker concurrency.
    #[arg(long = "jobs-fanout-batch-concurrency", value_name = "COUNT")]
    pub jobs_fanout_batch_concurrency: Option<u32>,

    /// Override the number of followers per fan-out batch.
    #[arg(long = "fanout-batch-size", value_name = "COUNT")]
    pub fanout_batch_size: Option<u64>,

    /// Override the feed window length.
    #[arg(long = "cache-list-limit", value_name = "COUNT")]
    pub cache_list_limit: Option<u64>,

    /// Override the number of keys the cache keeps before evicting.
    #[arg(long = "cache-max-keys", value_name = "COUNT")]
    pub cache_max_keys: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct FanoutArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Post to deliver.
    #[arg(long = "post-id", value_name = "UUID")]
    pub post_id: Uuid,

    /// Author of the post.
    #[arg(long = "author-id", value_name = "UUID")]
    pub author_id: Uuid,
}

#[derive(Debug, Args, Clone)]
pub struct TimelineArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Subscriber whose feed is read.
    #[arg(long = "subscriber-id", value_name = "UUID")]
    pub subscriber_id: Uuid,

    /// Return entries older than this cursor.
    #[arg(long, value_name = "CURSOR", conflicts_with = "after")]
    pub before: Option<String>,

    /// Return entries newer than this cursor.
    #[arg(long, value_name = "CURSOR")]
    pub after: Option<String>,

    /// Requested page size; clamped to the configured maximum.
    #[arg(long, value_name = "COUNT")]
    pub size: Option<String>,

    /// Join posts, counters and follow state into each entry.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub hydrate: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub jobs: JobsSettings,
    pub fanout: FanoutSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub ops_addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
    pub jobs_max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct JobsSettings {
    pub fanout_post_concurrency: NonZeroU32,
    pub fanout_batch_concurrency: NonZeroU32,
    pub job_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct FanoutSettings {
    pub batch_size: NonZeroUsize,
    pub job_max_attempts: NonZeroU32,
    pub store_retry_attempts: NonZeroU32,
    pub store_retry_base_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub list_limit: NonZeroUsize,
    pub default_page_size: NonZeroU32,
    pub max_page_size: NonZeroU32,
    pub materialize_attempts: NonZeroU32,
    pub max_keys: NonZeroUsize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("FEEDLINE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Fanout(args)) => raw.apply_database_override(&args.database),
        Some(Command::Timeline(args)) => raw.apply_database_override(&args.database),
        Some(Command::Migrate(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    jobs: RawJobsSettings,
    fanout: RawFanoutSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.ops_port {
            self.server.ops_port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_jobs_max_connections {
            self.database.jobs_max_connections = Some(max);
        }
        if let Some(value) = overrides.jobs_fanout_post_concurrency {
            self.jobs.fanout_post_concurrency = Some(value);
        }
        if let Some(value) = overrides.jobs_fanout_batch_concurrency {
            self.jobs.fanout_batch_concurrency = Some(value);
        }
        if let Some(value) = overrides.fanout_batch_size {
            self.fanout.batch_size = Some(value);
        }
        if let Some(value) = overrides.cache_list_limit {
            self.cache.list_limit = Some(value);
        }
        if let Some(value) = overrides.cache_max_keys {
            self.cache.max_keys = Some(value);
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            jobs,
            fanout,
            cache,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            jobs: build_jobs_settings(jobs)?,
            fanout: build_fanout_settings(fanout)?,
            cache: build_cache_settings(cache)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let ops_port = server.ops_port.unwrap_or(DEFAULT_OPS_PORT);
    if ops_port == 0 {
        return Err(LoadError::invalid(
            "server.ops_port",
            "port must be greater than zero",
        ));
    }

    let ops_addr = parse_socket_addr(&host, ops_port)
        .map_err(|reason| LoadError::invalid("server.ops_addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        ops_addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_value = database
        .max_connections
        .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
    let jobs_value = database
        .jobs_max_connections
        .unwrap_or(DEFAULT_DB_JOBS_MAX_CONNECTIONS);

    Ok(DatabaseSettings {
        url,
        max_connections: non_zero_u32(max_value.into(), "database.max_connections")?,
        jobs_max_connections: non_zero_u32(jobs_value.into(), "database.jobs_max_connections")?,
    })
}

fn build_jobs_settings(jobs: RawJobsSettings) -> Result<JobsSettings, LoadError> {
    let fanout_post = jobs
        .fanout_post_concurrency
        .unwrap_or(DEFAULT_JOB_FANOUT_POST_CONCURRENCY);
    let fanout_batch = jobs
        .fanout_batch_concurrency
        .unwrap_or(DEFAULT_JOB_FANOUT_BATCH_CONCURRENCY);

    let timeout_secs = jobs.timeout_seconds.unwrap_or(DEFAULT_JOB_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "jobs.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(JobsSettings {
        fanout_post_concurrency: non_zero_u32(fanout_post.into(), "jobs.fanout_post_concurrency")?,
        fanout_batch_concurrency: non_zero_u32(
            fanout_batch.into(),
            "jobs.fanout_batch_concurrency",
        )?,
        job_timeout: Duration::from_secs(timeout_secs),
    })
}

fn build_fanout_settings(fanout: RawFanoutSettings) -> Result<FanoutSettings, LoadError> {
    let batch_size = non_zero_usize(
        fanout.batch_size.unwrap_or(DEFAULT_FANOUT_BATCH_SIZE),
        "fanout.batch_size",
    )?;
    let job_max_attempts = non_zero_u32(
        fanout
            .job_max_attempts
            .unwrap_or(DEFAULT_FANOUT_JOB_MAX_ATTEMPTS)
            .into(),
        "fanout.job_max_attempts",
    )?;
    if i32::try_from(job_max_attempts.get()).is_err() {
        return Err(LoadError::invalid(
            "fanout.job_max_attempts",
            "value exceeds supported range for i32",
        ));
    }
    let store_retry_attempts = non_zero_u32(
        fanout
            .store_retry_attempts
            .unwrap_or(DEFAULT_STORE_RETRY_ATTEMPTS)
            .into(),
        "fanout.store_retry_attempts",
    )?;
    let base_ms = fanout
        .store_retry_base_ms
        .unwrap_or(DEFAULT_STORE_RETRY_BASE_MS);

    Ok(FanoutSettings {
        batch_size,
        job_max_attempts,
        store_retry_attempts,
        store_retry_base_delay: Duration::from_millis(base_ms),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let list_limit = non_zero_usize(
        cache.list_limit.unwrap_or(DEFAULT_CACHE_LIST_LIMIT),
        "cache.list_limit",
    )?;
    let default_page_size = non_zero_u32(
        cache
            .default_page_size
            .unwrap_or(DEFAULT_CACHE_PAGE_SIZE)
            .into(),
        "cache.default_page_size",
    )?;
    let max_page_size = non_zero_u32(
        cache
            .max_page_size
            .unwrap_or(DEFAULT_CACHE_MAX_PAGE_SIZE)
            .into(),
        "cache.max_page_size",
    )?;
    if default_page_size > max_page_size {
        return Err(LoadError::invalid(
            "cache.default_page_size",
            format!("must not exceed cache.max_page_size ({max_page_size})"),
        ));
    }
    if max_page_size.get() as usize >= list_limit.get() {
        return Err(LoadError::invalid(
            "cache.max_page_size",
            format!("must be smaller than cache.list_limit ({list_limit})"),
        ));
    }
    let materialize_attempts = non_zero_u32(
        cache
            .materialize_attempts
            .unwrap_or(DEFAULT_CACHE_MATERIALIZE_ATTEMPTS)
            .into(),
        "cache.materialize_attempts",
    )?;
    let max_keys = non_zero_usize(
        cache.max_keys.unwrap_or(DEFAULT_CACHE_MAX_KEYS),
        "cache.max_keys",
    )?;
    if max_keys.get() < MIN_CACHE_MAX_KEYS {
        return Err(LoadError::invalid(
            "cache.max_keys",
            format!("must be at least {MIN_CACHE_MAX_KEYS}"),
        ));
    }

    Ok(CacheSettings {
        list_limit,
        default_page_size,
        max_page_size,
        materialize_attempts,
        max_keys,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    ops_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
    jobs_max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawJobsSettings {
    fanout_post_concurrency: Option<u32>,
    fanout_batch_concurrency: Option<u32>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFanoutSettings {
    batch_size: Option<u64>,
    job_max_attempts: Option<u32>,
    store_retry_attempts: Option<u32>,
    store_retry_base_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    list_limit: Option<u64>,
    default_page_size: Option<u32>,
    max_page_size: Option<u32>,
    materialize_attempts: Option<u32>,
    max_keys: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
