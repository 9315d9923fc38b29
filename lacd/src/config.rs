use liblinkcheck::{FanOutConfig, ProbeConfig, QueueConfig};
use serde::Deserialize;
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

pub const LOCAL_CONFIG: &str = "config.toml";

#[derive(Debug, Error)]
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
    #[error("missing or empty config {}", describe_missing(.0))]
    Missing(Vec<&'static str>),
    #[error("key \"{0}\" must not be 0")]
    Zero(&'static str),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    log: RawLog,
    store: RawStore,
    api: RawApi,
    queue: RawQueue,
    worker_pool: RawWorkerPool,
    probe: RawProbe,
    links: RawLinks,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawLog {
    path: Option<PathBuf>,
    filter: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawStore {
    path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawApi {
    port: Option<u16>,
    base_path: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawQueue {
    path: Option<PathBuf>,
    workers: Option<usize>,
    capacity: Option<usize>,
    batch_timeout_secs: Option<u64>,
    shutdown_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawWorkerPool {
    workers_ratio: Option<usize>,
    workers_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawProbe {
    resolver: Option<SocketAddr>,
    dns_timeout_ms: Option<u64>,
    http_timeout_ms: Option<u64>,
    max_probes_per_second: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawLinks {
    recheck_statuses_on_print: bool,
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub path: Option<PathBuf>,
    pub filter: String,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub port: u16,
    pub base_path: String,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub log: LogSettings,
    pub store_path: PathBuf,
    pub api: ApiSettings,
    pub queue: QueueConfig,
    pub fan_out: FanOutConfig,
    pub probe: ProbeConfig,
    pub shutdown_timeout: Duration,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        raw.validate()
    }
}

impl RawConfig {
    fn validate(self) -> Result<Settings, ConfigError> {
        let mut missing = Vec::new();
        let store_path = required(self.store.path.filter(|p| !p.as_os_str().is_empty()), "store.path", &mut missing);
        let port = required(self.api.port, "api.port", &mut missing);
        let queue_path = required(self.queue.path.filter(|p| !p.as_os_str().is_empty()), "queue.path", &mut missing);
        let workers = required(self.queue.workers, "queue.workers", &mut missing);
        let ratio = required(self.worker_pool.workers_ratio, "worker_pool.workers_ratio", &mut missing);
        let limit = required(self.worker_pool.workers_limit, "worker_pool.workers_limit", &mut missing);

        let (Some(store_path), Some(port), Some(queue_path), Some(workers), Some(ratio), Some(limit)) =
            (store_path, port, queue_path, workers, ratio, limit)
        else {
            return Err(ConfigError::Missing(missing));
        };

        // ratio divides the batch size
        for (key, value) in [
            ("worker_pool.workers_ratio", ratio),
            ("worker_pool.workers_limit", limit),
            ("queue.workers", workers),
            ("queue.capacity", self.queue.capacity.unwrap_or(1)),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(key));
            }
        }
        // every batch would miss its deadline
        if self.queue.batch_timeout_secs == Some(0) {
            return Err(ConfigError::Zero("queue.batch_timeout_secs"));
        }

        let probe_defaults = ProbeConfig::default();
        let queue_defaults = QueueConfig::default();

        Ok(Settings {
            log: LogSettings {
                path: self.log.path,
                filter: self.log.filter.unwrap_or_else(|| "info".to_string()),
            },
            store_path,
            api: ApiSettings {
                port,
                base_path: normalize_base_path(self.api.base_path.as_deref().unwrap_or("")),
                password: self.api.password.filter(|p| !p.is_empty()),
            },
            queue: QueueConfig {
                workers,
                capacity: self.queue.capacity.unwrap_or(queue_defaults.capacity),
                batch_timeout: self
                    .queue
                    .batch_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(queue_defaults.batch_timeout),
                recovery_path: queue_path,
                recheck_on_report: self.links.recheck_statuses_on_print,
            },
            fan_out: FanOutConfig {
                workers_ratio: ratio,
                workers_limit: limit,
            },
            probe: ProbeConfig {
                resolver: self.probe.resolver.unwrap_or(probe_defaults.resolver),
                dns_timeout: self
                    .probe
                    .dns_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(probe_defaults.dns_timeout),
                http_timeout: self
                    .probe
                    .http_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(probe_defaults.http_timeout),
                max_probes_per_second: self
                    .probe
                    .max_probes_per_second
                    .unwrap_or(probe_defaults.max_probes_per_second),
            },
            shutdown_timeout: Duration::from_secs(self.queue.shutdown_timeout_secs.unwrap_or(15)),
        })
    }
}

fn describe_missing(keys: &[&'static str]) -> String {
    let noun = if keys.len() == 1 { "field" } else { "fields" };
    format!("{}: {}", noun, keys.join(", "))
}

fn required<T>(value: Option<T>, key: &'static str, missing: &mut Vec<&'static str>) -> Option<T> {
    if value.is_none() {
        missing.push(key);
    }
    value
}

/// `""`, `"/"` -> `""`; `"api/"` -> `"/api"`.
fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("lacd").join(LOCAL_CONFIG))
}

/// Explicit path wins; otherwise `./config.toml`, then the per-user one.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if explicit.is_some() {
        return explicit;
    }
    let local = PathBuf::from(LOCAL_CONFIG);
    if local.is_file() {
        return Some(local);
    }
    user_config_path().filter(|p| p.is_file())
}

pub fn default_config_toml() -> String {
    r#"# Link availability checker (lacd) configuration

[log]
# Also write logs here (stdout is always used)
# path = "lacd.log"
# Overridden by RUST_LOG
filter = "info"

[store]
# Append-only record of checked sets, one JSON object per line
path = "links.jsonl"

[api]
port = 8080
base_path = "/api"
# Required by /system routes; leave unset to disable them
# password = "change-me"

[queue]
# Unprocessed batches are saved here on shutdown and replayed on start
path = "queue.json"
workers = 4
capacity = 1000
batch_timeout_secs = 5
shutdown_timeout_secs = 15

[worker_pool]
# One transient prober per `workers_ratio` domains, at most `workers_limit`
workers_ratio = 2
workers_limit = 50

[probe]
resolver = "1.1.1.1:53"
dns_timeout_ms = 4000
http_timeout_ms = 4000
max_probes_per_second = 100

[links]
recheck_statuses_on_print = false
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let settings = Settings::from_toml(&default_config_toml()).unwrap();
        assert_eq!(settings.api.port, 8080);
        assert_eq!(settings.api.base_path, "/api");
        assert!(settings.api.password.is_none());
        assert_eq!(settings.queue.workers, 4);
        assert_eq!(settings.queue.recovery_path, PathBuf::from("queue.json"));
        assert_eq!(settings.fan_out.workers_ratio, 2);
        assert_eq!(settings.probe.resolver, "1.1.1.1:53".parse().unwrap());
        assert_eq!(settings.shutdown_timeout, Duration::from_secs(15));
        assert!(!settings.queue.recheck_on_report);
    }

    #[test]
    fn all_missing_fields_are_reported_together() {
        let err = Settings::from_toml("[api]\nport = 1\n").unwrap_err();
        match err {
            ConfigError::Missing(keys) => assert_eq!(
                keys,
                vec![
                    "store.path",
                    "queue.path",
                    "queue.workers",
                    "worker_pool.workers_ratio",
                    "worker_pool.workers_limit"
                ]
            ),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_ratio_is_rejected() {
        let content = default_config_toml().replace("workers_ratio = 2", "workers_ratio = 0");
        let err = Settings::from_toml(&content).unwrap_err();
        assert_eq!(err.to_string(), "key \"worker_pool.workers_ratio\" must not be 0");
    }

    #[test]
    fn zero_batch_timeout_is_rejected() {
        let content = default_config_toml().replace("batch_timeout_secs = 5", "batch_timeout_secs = 0");
        let err = Settings::from_toml(&content).unwrap_err();
        assert!(matches!(err, ConfigError::Zero("queue.batch_timeout_secs")));
    }

    #[test]
    fn single_missing_field_message() {
        let content = default_config_toml().replace("port = 8080", "");
        let err = Settings::from_toml(&content).unwrap_err();
        assert_eq!(err.to_string(), "missing or empty config field: api.port");
    }

    #[test]
    fn base_path_is_normalized() {
        assert_eq!(normalize_base_path(""), "");
        assert_eq!(normalize_base_path("/"), "");
        assert_eq!(normalize_base_path("api/"), "/api");
        assert_eq!(normalize_base_path("/v1/links/"), "/v1/links");
    }

    #[test]
    fn load_reports_the_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[store\n").unwrap();
        let err = Settings::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { path: ref p, .. } if p == &path));

        let err = Settings::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
