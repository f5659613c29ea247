//! Daemon configuration.
//!
//! Options come from an optional TOML file overlaid with command-line
//! flags; the result is one immutable [`Options`] value handed to the core.
//! Broker descriptors are validated here so the bridge only ever sees
//! usable endpoints.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::mqtt::{self, BrokerConfig};
use crate::phy::backend::DEFAULT_DEVICE_ROOT;
use crate::server;

/// Config file consulted when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rcmon.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Parser, Debug, Default)]
#[command(name = "rcmon", version, about = "Rate-control telemetry fan-out daemon")]
pub struct Args {
    /// Configuration file (default /etc/rcmon.toml, if present)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address to listen on; repeat for multiple interfaces
    #[arg(short = 'l', long = "listen", value_name = "ADDR")]
    pub listen: Vec<String>,

    /// Port of the plain channel (compressed channel uses the next port)
    #[arg(long)]
    pub port: Option<u16>,

    /// Root directory of the per-device debug filesystem
    #[arg(long, value_name = "DIR")]
    pub device_root: Option<PathBuf>,

    /// Device scan interval in milliseconds
    #[arg(long, value_name = "MS")]
    pub scan_interval_ms: Option<u64>,

    /// Client id for brokers that do not set their own
    #[arg(short = 'i', long, value_name = "ID")]
    pub id: Option<String>,

    /// Topic prefix prepended to all published topics (must end with '/')
    #[arg(short = 't', long, value_name = "PREFIX")]
    pub topic: Option<String>,

    /// CA trust-store path for TLS broker connections
    #[arg(short = 'C', long, value_name = "PATH")]
    pub ca_path: Option<PathBuf>,

    /// MQTT broker as ADDRESS[:PORT], '[ADDRESS]'[:PORT] for IPv6; repeatable
    #[arg(short = 'b', long = "broker", value_name = "ADDR")]
    pub brokers: Vec<String>,

    /// zstd dictionary file; enables the compressed channel
    #[arg(short = 'D', long, value_name = "FILE")]
    pub dict: Option<PathBuf>,

    /// zstd compression level
    #[arg(short = 'c', long, value_name = "LEVEL")]
    pub level: Option<i32>,

    /// Size of the buffer collecting data before compression
    #[arg(short = 'B', long, value_name = "BYTES")]
    pub buffer_size: Option<usize>,

    /// Maximum wait between flushes of the compression buffer
    #[arg(short = 'T', long, value_name = "MS")]
    pub timeout_ms: Option<u64>,
}

/// Compressed-channel settings; present only when a dictionary was
/// configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZstdOptions {
    pub dictionary: PathBuf,
    pub level: i32,
    pub buffer_size: usize,
    pub timeout_ms: u64,
}

pub const DEFAULT_ZSTD_LEVEL: i32 = 3;
pub const DEFAULT_ZSTD_BUFSIZE: usize = 4096;
pub const DEFAULT_ZSTD_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 1000;

/// The resolved, immutable daemon configuration.
#[derive(Debug)]
pub struct Options {
    pub listen: Vec<String>,
    pub port: u16,
    pub device_root: PathBuf,
    pub scan_interval_ms: u64,
    pub zstd: Option<ZstdOptions>,
    pub brokers: Vec<BrokerConfig>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen: Option<Vec<String>>,
    port: Option<u16>,
    device_root: Option<PathBuf>,
    scan_interval_ms: Option<u64>,
    zstd: Option<FileZstd>,
    mqtt: Option<FileMqtt>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FileZstd {
    dictionary: Option<PathBuf>,
    level: Option<i32>,
    buffer_size: Option<usize>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FileMqtt {
    id: Option<String>,
    topic: Option<String>,
    ca_path: Option<PathBuf>,
    #[serde(default)]
    broker: Vec<FileBroker>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileBroker {
    addr: String,
    port: Option<u16>,
    bind_addr: Option<String>,
    id: Option<String>,
    topic: Option<String>,
}

impl Options {
    /// Loads the config file (when present) and overlays command-line
    /// flags. Invalid broker descriptors are skipped with a warning rather
    /// than failing startup.
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => FileConfig::read(path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    FileConfig::read(path)?
                } else {
                    FileConfig::default()
                }
            }
        };
        Ok(Self::merge(args, file))
    }

    fn merge(args: &Args, file: FileConfig) -> Self {
        let mut listen = if args.listen.is_empty() {
            file.listen.unwrap_or_default()
        } else {
            args.listen.clone()
        };
        if listen.is_empty() {
            listen.push("127.0.0.1".to_owned());
        }

        let file_zstd = file.zstd.unwrap_or_default();
        let zstd = args
            .dict
            .clone()
            .or(file_zstd.dictionary)
            .map(|dictionary| ZstdOptions {
                dictionary,
                level: args.level.or(file_zstd.level).unwrap_or(DEFAULT_ZSTD_LEVEL),
                buffer_size: args
                    .buffer_size
                    .or(file_zstd.buffer_size)
                    .unwrap_or(DEFAULT_ZSTD_BUFSIZE),
                timeout_ms: args
                    .timeout_ms
                    .or(file_zstd.timeout_ms)
                    .unwrap_or(DEFAULT_ZSTD_TIMEOUT_MS),
            });

        let file_mqtt = file.mqtt.unwrap_or_default();
        let global_id = args.id.clone().or(file_mqtt.id);
        let global_topic = args.topic.clone().or(file_mqtt.topic);
        let ca_path = args.ca_path.clone().or(file_mqtt.ca_path);

        let mut brokers = Vec::new();
        for b in file_mqtt.broker {
            brokers.extend(BrokerConfig::validated(
                b.addr,
                b.port.unwrap_or(mqtt::DEFAULT_PORT),
                b.bind_addr,
                b.id.or_else(|| global_id.clone()),
                b.topic.or_else(|| global_topic.clone()),
                ca_path.clone(),
            ));
        }
        for endpoint in &args.brokers {
            match mqtt::parse_endpoint(endpoint) {
                Ok((addr, port)) => brokers.extend(BrokerConfig::validated(
                    addr,
                    port,
                    None,
                    global_id.clone(),
                    global_topic.clone(),
                    ca_path.clone(),
                )),
                Err(e) => warn!("{e}"),
            }
        }

        let options = Self {
            listen,
            port: args.port.or(file.port).unwrap_or(server::DEFAULT_PORT),
            device_root: args
                .device_root
                .clone()
                .or(file.device_root)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DEVICE_ROOT)),
            scan_interval_ms: args
                .scan_interval_ms
                .or(file.scan_interval_ms)
                .unwrap_or(DEFAULT_SCAN_INTERVAL_MS),
            zstd,
            brokers,
        };
        debug!("resolved options: {options:?}");
        options
    }
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }
}
