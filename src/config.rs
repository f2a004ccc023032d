use ringlog::Level;
use serde::Deserialize;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Default, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    general: General,
    #[serde(default)]
    log: Log,
    #[serde(default)]
    table: Table,
    #[serde(default)]
    exposition: Exposition,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let interval = self.general.interval()?;
        let timeout = self.general.timeout()?;

        if interval.is_zero() {
            return Err(ConfigError::Invalid(
                "general.interval must be greater than zero".into(),
            ));
        }

        if timeout.is_zero() || timeout > interval {
            return Err(ConfigError::Invalid(format!(
                "general.timeout must be between zero and the interval ({})",
                self.general.interval
            )));
        }

        if self.exposition.cardinality == 0 {
            return Err(ConfigError::Invalid(
                "exposition.cardinality must be greater than zero".into(),
            ));
        }

        self.exposition.listen()?;

        Ok(())
    }

    pub fn general(&self) -> &General {
        &self.general
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn exposition(&self) -> &Exposition {
        &self.exposition
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct General {
    #[serde(default = "interval")]
    interval: String,
    #[serde(default = "timeout")]
    timeout: String,
}

impl Default for General {
    fn default() -> Self {
        Self {
            interval: interval(),
            timeout: timeout(),
        }
    }
}

fn interval() -> String {
    "5s".into()
}

fn timeout() -> String {
    "1s".into()
}

impl General {
    /// Time between the start of consecutive sync cycles.
    pub fn interval(&self) -> Result<Duration, ConfigError> {
        parse_duration("general.interval", &self.interval)
    }

    /// Deadline applied to each sync cycle.
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration("general.timeout", &self.timeout)
    }
}

fn parse_duration(name: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value)
        .map_err(|e| ConfigError::Invalid(format!("{name}: bad duration `{value}`: {e}")))
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct Log {
    #[serde(with = "LevelDef")]
    #[serde(default = "log_level")]
    level: Level,
}

impl Default for Log {
    fn default() -> Self {
        Self { level: log_level() }
    }
}

impl Log {
    pub fn level(&self) -> Level {
        self.level
    }
}

fn log_level() -> Level {
    Level::Info
}

#[derive(Deserialize)]
#[serde(remote = "Level")]
#[serde(rename_all = "lowercase")]
enum LevelDef {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct Table {
    #[serde(default = "table_path")]
    path: PathBuf,
}

impl Default for Table {
    fn default() -> Self {
        Self { path: table_path() }
    }
}

fn table_path() -> PathBuf {
    "/sys/fs/bpf/tc/globals/cilium_metrics".into()
}

impl Table {
    /// Path of the pinned metrics map in bpffs.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct Exposition {
    #[serde(default = "enabled")]
    enabled: bool,
    #[serde(default = "listen")]
    listen: String,
    #[serde(default = "cardinality")]
    cardinality: usize,
}

impl Default for Exposition {
    fn default() -> Self {
        Self {
            enabled: enabled(),
            listen: listen(),
            cardinality: cardinality(),
        }
    }
}

fn enabled() -> bool {
    true
}

fn listen() -> String {
    "0.0.0.0:9962".into()
}

fn cardinality() -> usize {
    1024
}

impl Exposition {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn listen(&self) -> Result<SocketAddr, ConfigError> {
        self.listen.parse().map_err(|e| {
            ConfigError::Invalid(format!(
                "exposition.listen: bad address `{}`: {e}",
                self.listen
            ))
        })
    }

    /// Label combinations allowed per metric family.
    pub fn cardinality(&self) -> usize {
        self.cardinality
    }
}
