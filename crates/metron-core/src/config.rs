//! Daemon configuration: TOML parsing, validation and server resolution.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::sampler;

/// Error type for configuration loading failures.
#[derive(Debug)]
pub enum ConfigError {
    /// Could not read the configuration file.
    Read(std::io::Error),
    /// The file is not valid TOML.
    Parse(toml::de::Error),
    /// A `[[server]]` hostname did not resolve.
    Resolve {
        server: String,
        source: std::io::Error,
    },
    /// A value failed validation.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read(e) => write!(f, "read config: {}", e),
            ConfigError::Parse(e) => write!(f, "parse config: {}", e),
            ConfigError::Resolve { server, source } => {
                write!(f, "resolve server {}: {}", server, source)
            }
            ConfigError::Invalid(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Read(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Validated daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub daemon: bool,
    pub log: LogConfig,
    /// Update poll period, seconds.
    pub check_interval: u64,
    pub connect_timeout: u64,
    pub send_timeout: u64,
    pub recv_timeout: u64,
    pub max_free_envelopes: usize,
    pub pid_path: PathBuf,
    /// Host identity stamped into every envelope.
    pub identify: String,
    pub update: UpdateConfig,
    pub worker_module: Option<String>,
    pub metrics: Vec<MetricDescriptor>,
    pub servers: Vec<ServerEntry>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log file path; stderr when absent.
    pub path: Option<PathBuf>,
    pub level: String,
}

#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// Version check URL; no update child runs when absent.
    pub url: Option<String>,
    /// Updater executable invoked when a new version is offered.
    pub exe: PathBuf,
}

/// One `[[metric]]` entry: what to sample, how it is labelled on the wire,
/// and how often.
#[derive(Debug, Clone)]
pub struct MetricDescriptor {
    pub name: String,
    pub metric: sampler::MetricId,
    /// Wire identifier reported to the collector.
    pub id: String,
    /// Sampling period, seconds.
    pub interval: u64,
    /// Wire kind tag.
    pub kind: String,
}

/// One resolved server address. A `[[server]]` whose hostname resolves to
/// several addresses produces one entry per address, in resolver order.
#[derive(Debug, Clone)]
pub struct ServerEntry {
    pub host: String,
    pub port: u16,
    pub addr: SocketAddr,
    /// `ip:port`, used in log messages.
    pub display: String,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_daemon")]
    daemon: bool,
    identify: Option<String>,
    #[serde(default = "default_check_interval")]
    check_interval: u64,
    #[serde(default = "default_timeout")]
    connect_timeout: u64,
    #[serde(default = "default_timeout")]
    send_timeout: u64,
    #[serde(default = "default_timeout")]
    recv_timeout: u64,
    #[serde(default = "default_max_free_envelopes")]
    max_free_envelopes: usize,
    #[serde(default = "default_pid_path")]
    pid: PathBuf,
    worker_module: Option<String>,
    #[serde(default)]
    log: RawLog,
    #[serde(default)]
    update: RawUpdate,
    #[serde(default)]
    metric: Vec<RawMetric>,
    #[serde(default)]
    server: Vec<RawServer>,
}

#[derive(Debug, Deserialize)]
struct RawLog {
    path: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for RawLog {
    fn default() -> Self {
        Self {
            path: None,
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawUpdate {
    url: Option<String>,
    #[serde(default = "default_update_exe")]
    exe: PathBuf,
}

impl Default for RawUpdate {
    fn default() -> Self {
        Self {
            url: None,
            exe: default_update_exe(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawMetric {
    name: String,
    id: String,
    interval: u64,
    #[serde(default = "default_metric_kind")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    host: String,
    port: u16,
}

fn default_daemon() -> bool {
    true
}

fn default_check_interval() -> u64 {
    600
}

fn default_timeout() -> u64 {
    60
}

fn default_max_free_envelopes() -> usize {
    64
}

fn default_pid_path() -> PathBuf {
    PathBuf::from("/usr/local/metron/run/metrond.pid")
}

fn default_update_exe() -> PathBuf {
    PathBuf::from("/usr/local/metron/sbin/update")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metric_kind() -> String {
    "1".to_string()
}

const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

impl Config {
    /// Loads and validates a configuration file.
    ///
    /// # Arguments
    ///
    /// * `path` - the TOML configuration file
    ///
    /// # Returns
    ///
    /// The validated configuration, with every `[[server]]` expanded to its
    /// resolved addresses. Any validation failure is fatal.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let raw: RawConfig = toml::from_str(&content)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let identify = raw.identify.unwrap_or_default();
        if identify.trim().is_empty() {
            return Err(ConfigError::Invalid("identify is required".to_string()));
        }

        if !LOG_LEVELS.contains(&raw.log.level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "unknown log level '{}'",
                raw.log.level
            )));
        }

        if raw.metric.is_empty() {
            return Err(ConfigError::Invalid("no metrics configured".to_string()));
        }
        let mut metrics = Vec::with_capacity(raw.metric.len());
        for m in raw.metric {
            let Some(metric) = sampler::lookup(&m.name) else {
                return Err(ConfigError::Invalid(format!(
                    "unknown metric name '{}'",
                    m.name
                )));
            };
            if m.interval == 0 {
                return Err(ConfigError::Invalid(format!(
                    "metric '{}' interval must be greater than zero",
                    m.name
                )));
            }
            metrics.push(MetricDescriptor {
                name: m.name,
                metric,
                id: m.id,
                interval: m.interval,
                kind: m.kind,
            });
        }

        if raw.server.is_empty() {
            return Err(ConfigError::Invalid("no servers configured".to_string()));
        }
        let mut servers = Vec::new();
        for s in raw.server {
            let before = servers.len();
            let addrs = (s.host.as_str(), s.port)
                .to_socket_addrs()
                .map_err(|source| ConfigError::Resolve {
                    server: format!("{}:{}", s.host, s.port),
                    source,
                })?;
            for addr in addrs {
                servers.push(ServerEntry {
                    host: s.host.clone(),
                    port: s.port,
                    addr,
                    display: addr.to_string(),
                });
            }
            if servers.len() == before {
                return Err(ConfigError::Resolve {
                    server: format!("{}:{}", s.host, s.port),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "resolved to no addresses",
                    ),
                });
            }
        }

        Ok(Config {
            daemon: raw.daemon,
            log: LogConfig {
                path: raw.log.path,
                level: raw.log.level,
            },
            check_interval: raw.check_interval,
            connect_timeout: raw.connect_timeout,
            send_timeout: raw.send_timeout,
            recv_timeout: raw.recv_timeout,
            max_free_envelopes: raw.max_free_envelopes,
            pid_path: raw.pid,
            identify,
            update: UpdateConfig {
                url: raw.update.url,
                exe: raw.update.exe,
            },
            worker_module: raw.worker_module,
            metrics,
            servers,
        })
    }
}
