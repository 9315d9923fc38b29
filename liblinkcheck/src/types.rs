use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use thiserror::Error;

pub const AVAILABLE: &str = "available";
pub const NOT_AVAILABLE: &str = "not available";

/// One domain and whether it answered with `200 OK`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub domain: String,
    #[serde(default)]
    pub status: bool,
}

impl Link {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            status: false,
        }
    }

    pub fn label(&self) -> &'static str {
        status_label(self.status)
    }
}

pub fn status_label(status: bool) -> &'static str {
    if status {
        AVAILABLE
    } else {
        NOT_AVAILABLE
    }
}

/// A batch of links. `number == 0` until the store assigns one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Set {
    #[serde(default)]
    pub number: u64,
    pub links: Vec<Link>,
}

impl Set {
    pub fn from_domains<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            number: 0,
            links: domains.into_iter().map(Link::new).collect(),
        }
    }

    pub fn domains(&self) -> Vec<String> {
        self.links.iter().map(|l| l.domain.clone()).collect()
    }

    pub fn is_numbered(&self) -> bool {
        self.number != 0
    }

    /// Writes statuses back in input order. Lengths must match.
    pub fn apply_statuses(&mut self, statuses: &[bool]) {
        debug_assert_eq!(self.links.len(), statuses.len());
        for (link, status) in self.links.iter_mut().zip(statuses) {
            link.status = *status;
        }
    }
}

/// The only failures a probe ever reports. Everything else is "not available".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("probe cancelled")]
    Cancelled,
    #[error("probe deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub resolver: SocketAddr,
    pub dns_timeout: Duration,
    pub http_timeout: Duration,
    pub max_probes_per_second: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            resolver: SocketAddr::from(([1, 1, 1, 1], 53)),
            dns_timeout: Duration::from_secs(4),
            http_timeout: Duration::from_secs(4),
            max_probes_per_second: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FanOutConfig {
    /// Domains per transient prober. Must be non-zero.
    pub workers_ratio: usize,
    /// Hard cap on transient probers per batch.
    pub workers_limit: usize,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            workers_ratio: 2,
            workers_limit: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub workers: usize,
    pub capacity: usize,
    pub batch_timeout: Duration,
    pub recovery_path: PathBuf,
    pub recheck_on_report: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            capacity: 1000,
            batch_timeout: Duration::from_secs(5),
            recovery_path: PathBuf::from("queue.json"),
            recheck_on_report: false,
        }
    }
}
