use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use url::Url;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::polling::Schedule;

pub const DEFAULT_PATH: &str = "/etc/eni-hook/config.toml";
pub const ENV_VAR: &str = "ENI_HOOK_CONFIG_PATH";

pub const DEFAULT_METADATA_ENDPOINT: &str = "http://169.254.169.254";
pub const DEFAULT_PRIMARY_INTERFACE: &str = "eth0";
pub const DEFAULT_TABLE_OFFSET: u32 = 1000;
pub const DEFAULT_SYSFS_NET: &str = "/sys/class/net";
pub const DEFAULT_LOCK_DIR: &str = "/run/eni-hook";

/// Tokens live at most six hours on the metadata service.
const MAX_TOKEN_TTL: Duration = Duration::from_secs(21_600);

const KNOWN_KEYS: &[(&str, &[&str])] = &[
    ("metadata", &["endpoint", "token_ttl", "request_timeout"]),
    ("polling", &["ipv4", "ipv6", "gateway"]),
    ("routing", &["primary_interface", "table_offset"]),
    ("system", &["sysfs_net", "lock_dir"]),
];

const SCHEDULE_KEYS: &[&str] = &["attempts", "interval"];

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration file not found")]
    NoFile,
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
    #[error("Invalid metadata endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub metadata: Metadata,
    pub polling: Polling,
    pub routing: Routing,
    pub system: System,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub endpoint: String,
    #[serde(with = "humantime_serde")]
    pub token_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(from = "PollingFile")]
pub struct Polling {
    /// Waiting for the interface's IPv4 addresses to show up in metadata.
    pub ipv4: Schedule,
    /// Waiting for the interface's IPv6 addresses to show up in metadata.
    pub ipv6: Schedule,
    /// Waiting for a router advertised IPv6 default route.
    pub gateway: Schedule,
}

/// `[polling]` as written in the file. Fields left out fall back to the
/// defaults of their own schedule, not to a shared one.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PollingFile {
    ipv4: ScheduleFile,
    ipv6: ScheduleFile,
    gateway: ScheduleFile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScheduleFile {
    attempts: Option<usize>,
    #[serde(with = "humantime_serde::option")]
    interval: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Routing {
    pub primary_interface: String,
    pub table_offset: u32,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct System {
    pub sysfs_net: PathBuf,
    pub lock_dir: PathBuf,
}

impl Default for Metadata {
    fn default() -> Self {
        Metadata {
            endpoint: DEFAULT_METADATA_ENDPOINT.to_string(),
            token_ttl: Duration::from_secs(60),
            request_timeout: Duration::from_secs(2),
        }
    }
}

impl Default for Polling {
    fn default() -> Self {
        Polling {
            ipv4: Schedule::default(),
            ipv6: Schedule::default(),
            gateway: Schedule::new(20, Duration::from_millis(500)),
        }
    }
}

impl ScheduleFile {
    fn over(self, base: Schedule) -> Schedule {
        Schedule::new(
            self.attempts.unwrap_or(base.attempts),
            self.interval.unwrap_or(base.interval),
        )
    }
}

impl From<PollingFile> for Polling {
    fn from(file: PollingFile) -> Self {
        let base = Polling::default();
        Polling {
            ipv4: file.ipv4.over(base.ipv4),
            ipv6: file.ipv6.over(base.ipv6),
            gateway: file.gateway.over(base.gateway),
        }
    }
}

impl Default for Routing {
    fn default() -> Self {
        Routing {
            primary_interface: DEFAULT_PRIMARY_INTERFACE.to_string(),
            table_offset: DEFAULT_TABLE_OFFSET,
        }
    }
}

impl Default for System {
    fn default() -> Self {
        System {
            sysfs_net: PathBuf::from(DEFAULT_SYSFS_NET),
            lock_dir: PathBuf::from(DEFAULT_LOCK_DIR),
        }
    }
}

impl Metadata {
    pub fn endpoint_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&self.endpoint)
    }
}

/// Reads the configuration file, falling back to built-in defaults when it does not exist.
pub async fn load(path: &Path) -> Result<Config, Error> {
    match read(path).await {
        Err(Error::NoFile) => {
            tracing::debug!(path = %path.display(), "no configuration file, using defaults");
            Ok(Config::default())
        }
        res => res,
    }
}

pub async fn read(path: &Path) -> Result<Config, Error> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NoFile
        } else {
            Error::IO(e)
        }
    })?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<Config, Error> {
    let table = content.parse::<toml::Table>()?;
    for key in wrong_keys(&table) {
        tracing::warn!(%key, "ignoring unsupported key in configuration file");
    }
    let config = toml::from_str::<Config>(content)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    fn validate(&self) -> Result<(), Error> {
        self.metadata.endpoint_url()?;
        if self.metadata.token_ttl < Duration::from_secs(1) || self.metadata.token_ttl > MAX_TOKEN_TTL {
            return Err(Error::InvalidValue {
                key: "metadata.token_ttl",
                reason: "must be between 1s and 6h".into(),
            });
        }
        for (key, schedule) in [
            ("polling.ipv4.attempts", &self.polling.ipv4),
            ("polling.ipv6.attempts", &self.polling.ipv6),
            ("polling.gateway.attempts", &self.polling.gateway),
        ] {
            if schedule.attempts == 0 {
                return Err(Error::InvalidValue {
                    key,
                    reason: "must be at least 1".into(),
                });
            }
        }
        if self.routing.primary_interface.is_empty() {
            return Err(Error::InvalidValue {
                key: "routing.primary_interface",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

fn wrong_keys(table: &toml::Table) -> Vec<String> {
    let mut wrong = Vec::new();
    for (section, value) in table.iter() {
        let Some((_, keys)) = KNOWN_KEYS.iter().find(|(name, _)| *name == section.as_str()) else {
            wrong.push(section.clone());
            continue;
        };
        let Some(inner) = value.as_table() else {
            continue;
        };
        for (key, value) in inner.iter() {
            if !keys.contains(&key.as_str()) {
                wrong.push(format!("{section}.{key}"));
                continue;
            }
            // every `[polling.*]` subtable is a schedule
            if section == "polling" {
                if let Some(schedule) = value.as_table() {
                    wrong.extend(
                        schedule
                            .keys()
                            .filter(|k| !SCHEDULE_KEYS.contains(&k.as_str()))
                            .map(|k| format!("{section}.{key}.{k}")),
                    );
                }
            }
        }
    }
    wrong
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_file_yields_defaults() -> anyhow::Result<()> {
        let config = parse("")?;
        assert_eq!(config, Config::default());
        assert_eq!(config.polling.ipv4.attempts, 60);
        assert_eq!(config.polling.gateway.attempts, 20);
        assert_eq!(config.routing.table_offset, 1000);
        Ok(())
    }

    #[test]
    fn parses_partial_sections() -> anyhow::Result<()> {
        let config = parse(
            r#"
            [metadata]
            endpoint = "http://127.0.0.1:1338"
            token_ttl = "5m"

            [polling.ipv6]
            attempts = 4

            [routing]
            table_offset = 500
            "#,
        )?;

        assert_eq!(config.metadata.endpoint, "http://127.0.0.1:1338");
        assert_eq!(config.metadata.token_ttl, Duration::from_secs(300));
        assert_eq!(config.metadata.request_timeout, Duration::from_secs(2));
        assert_eq!(config.polling.ipv6.attempts, 4);
        assert_eq!(config.polling.ipv6.interval, Duration::from_millis(500));
        assert_eq!(config.routing.table_offset, 500);
        assert_eq!(config.routing.primary_interface, "eth0");
        Ok(())
    }

    #[test]
    fn partial_schedule_keeps_its_own_defaults() -> anyhow::Result<()> {
        let config = parse("[polling.gateway]\ninterval = \"1s\"\n\n[polling.ipv4]\nattempts = 10\n")?;

        assert_eq!(config.polling.gateway, Schedule::new(20, Duration::from_secs(1)));
        assert_eq!(config.polling.ipv4, Schedule::new(10, Duration::from_millis(500)));
        assert_eq!(config.polling.ipv6, Schedule::default());
        Ok(())
    }

    #[test]
    fn unknown_schedule_keys_are_reported() -> anyhow::Result<()> {
        let table = r#"
            [polling.gateway]
            atempts = 5
            [polling.ipv4]
            attempts = 5
            [polling.retries]
            attempts = 1
        "#
        .parse::<toml::Table>()?;

        let mut keys = wrong_keys(&table);
        keys.sort();
        assert_eq!(
            keys,
            vec!["polling.gateway.atempts".to_string(), "polling.retries".to_string()]
        );
        Ok(())
    }

    #[test]
    fn unknown_keys_are_reported() -> anyhow::Result<()> {
        let table = r#"
            verbose = true
            [routing]
            table_offset = 10
            primary = "eth0"
        "#
        .parse::<toml::Table>()?;

        let mut keys = wrong_keys(&table);
        keys.sort();
        assert_eq!(keys, vec!["routing.primary".to_string(), "verbose".to_string()]);
        Ok(())
    }

    #[test]
    fn rejects_zero_attempts() {
        let res = parse("[polling.gateway]\nattempts = 0\n");
        assert!(matches!(
            res,
            Err(Error::InvalidValue {
                key: "polling.gateway.attempts",
                ..
            })
        ));
    }

    #[test]
    fn rejects_invalid_endpoint() {
        let res = parse("[metadata]\nendpoint = \"not a url\"\n");
        assert!(matches!(res, Err(Error::InvalidEndpoint(_))));
    }

    #[test]
    fn rejects_excessive_token_ttl() {
        let res = parse("[metadata]\ntoken_ttl = \"7h\"\n");
        assert!(matches!(res, Err(Error::InvalidValue { key: "metadata.token_ttl", .. })));
    }

    #[tokio::test]
    async fn missing_file_loads_defaults() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let config = load(&dir.path().join("missing.toml")).await?;
        assert_eq!(config, Config::default());
        Ok(())
    }

    #[tokio::test]
    async fn read_reports_missing_file() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let res = read(&dir.path().join("missing.toml")).await;
        assert!(matches!(res, Err(Error::NoFile)));
        Ok(())
    }
}
