use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for drivemirror.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "drivemirror".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Which kind of credentials to load into the pool.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialMode {
    /// A single serialized OAuth refresh token record.
    #[default]
    RefreshToken,
    /// A directory of service account key files.
    ServiceAccount,
}

/// Where to find the credentials used to talk to the drive.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Selects between service accounts and a refresh token.
    ///
    /// Can be overridden with the `IS_SERVICE_ACCOUNT` environment variable.
    pub mode: CredentialMode,
    /// Directory containing one service account JSON key per file.
    pub accounts_dir: PathBuf,
    /// File containing the refresh token record.
    pub token_file: PathBuf,
    /// Start at a random service account instead of the first one.
    pub randomize_start: bool,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            mode: CredentialMode::default(),
            accounts_dir: PathBuf::from("accounts"),
            token_file: PathBuf::from("token.json"),
            randomize_start: true,
        }
    }
}

/// Endpoints of the upstream drive.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the drive v3 API, including the trailing slash.
    pub api_url: Url,
    /// Overrides the token endpoint declared by the credentials.
    pub oauth_token_url: Option<Url>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_url: Url::parse("https://www.googleapis.com/drive/v3/")
                .expect("static url is valid"),
            oauth_token_url: None,
        }
    }
}

/// Tuning of the streaming pipeline.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Size in bytes of every ranged upstream request.
    pub chunk_size: u64,
    /// Consecutive transient failures tolerated per chunk once a stream is running.
    pub max_chunk_retries: usize,
    /// Attempts to open a stream before a transient failure is reported.
    pub max_request_attempts: usize,
    /// Fixed delay between retries.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            max_chunk_retries: 10,
            max_request_attempts: 3,
            retry_backoff: Duration::from_secs(2),
        }
    }
}

/// Tuning of the access token exchange.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TokensConfig {
    /// Attempts per token exchange on transient failures.
    pub exchange_attempts: usize,
    /// Delay between exchange attempts.
    #[serde(with = "humantime_serde")]
    pub exchange_backoff: Duration,
    /// Tokens are dropped from the cache this long before they really expire.
    #[serde(with = "humantime_serde")]
    pub safety_margin: Duration,
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            exchange_attempts: 3,
            exchange_backoff: Duration::from_millis(500),
            safety_margin: Duration::from_secs(100),
        }
    }
}

/// Tuning of listings, searches and metadata lookups.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ListingConfig {
    /// How long a page of a listing or search is cached.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// How long file metadata is cached.
    #[serde(with = "humantime_serde")]
    pub info_ttl: Duration,
    /// How long the download rankings are cached.
    #[serde(with = "humantime_serde")]
    pub stats_ttl: Duration,
    /// Number of entries of a page resolved concurrently.
    pub batch_size: usize,
    /// Maximum number of concurrent upstream listing calls.
    ///
    /// A value of `None` indicates no limit.
    pub max_concurrent: Option<usize>,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            info_ttl: Duration::from_secs(60),
            stats_ttl: Duration::from_secs(5 * 60),
            batch_size: 50,
            max_concurrent: Some(20),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The folder listed when no folder id is requested.
    ///
    /// Can be overridden with the `ROOT_FOLDER_ID` environment variable.
    pub root_folder_id: Option<String>,

    /// Where to load credentials from.
    pub credentials: CredentialsConfig,

    /// Upstream endpoints.
    pub upstream: UpstreamConfig,

    /// Streaming pipeline tuning.
    pub streaming: StreamingConfig,

    /// Token exchange tuning.
    pub tokens: TokensConfig,

    /// Listing and search tuning.
    pub listing: ListingConfig,

    /// The timeout for establishing a connection to upstream.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for a stalled upstream read.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,

    /// The total timeout of API and token requests.
    #[serde(with = "humantime_serde")]
    pub api_timeout: Duration,
}

/// Checks if we are running in docker.
fn is_docker() -> bool {
    if fs::metadata("/.dockerenv").is_ok() {
        return true;
    }

    fs::read_to_string("/proc/self/cgroup")
        .map(|s| s.contains("/docker"))
        .unwrap_or(false)
}

/// Default value for the "bind" configuration.
fn default_bind() -> String {
    if is_docker() {
        // Docker images rely on this service being exposed
        "0.0.0.0:8000".to_owned()
    } else {
        "127.0.0.1:8000".to_owned()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: default_bind(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            root_folder_id: None,
            credentials: CredentialsConfig::default(),
            upstream: UpstreamConfig::default(),
            streaming: StreamingConfig::default(),
            tokens: TokensConfig::default(),
            listing: ListingConfig::default(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            api_timeout: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Loads the config from `path`, or the defaults, and applies environment overrides.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            )?,
            None => Config::default(),
        };
        config.apply_env(|name| env::var(name).ok())?;
        Ok(config)
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(folder_id) = lookup("ROOT_FOLDER_ID").filter(|id| !id.trim().is_empty()) {
            self.root_folder_id = Some(folder_id.trim().to_owned());
        }

        if let Some(flag) = lookup("IS_SERVICE_ACCOUNT") {
            let is_service_account = parse_bool(&flag)
                .with_context(|| format!("invalid IS_SERVICE_ACCOUNT value `{flag}`"))?;
            self.credentials.mode = match is_service_account {
                true => CredentialMode::ServiceAccount,
                false => CredentialMode::RefreshToken,
            };
        }

        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" | "" => Some(false),
        _ => None,
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
