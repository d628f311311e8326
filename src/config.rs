// src/config.rs

//! Runtime configuration, read once from the environment at startup.
//! Every knob has a default suitable for a single-instance development run;
//! the signing key is the only value that really must be set in production.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

const ENV_PREFIX: &str = "OUTPOST_";
const DEV_SIGNING_KEY: &str = "insecure-dev-key";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} has unusable value {value:?}")]
    Invalid { name: String, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP surface binds to.
    pub bind_addr: SocketAddr,
    /// HMAC key shared by dispatcher and scanner endpoints.
    pub signing_key: String,
    /// When set, lease state lives in Redis; otherwise in-process.
    pub redis_url: Option<String>,
    /// Base URLs of the scanner instances the dispatcher fans out to.
    pub scanner_base_urls: Vec<String>,
    /// Capacity of each per-protocol ingress queue.
    pub queue_capacity: usize,
    /// Deadline for one whole scan attempt.
    pub scan_timeout: Duration,
    /// Deadline for one network request inside a probe.
    pub probe_timeout: Duration,
    /// TCP connect deadline inside blocking probes.
    pub connect_timeout: Duration,
    /// Attempts per queued scan before it is dropped.
    pub scan_attempts: u32,
    /// Concurrent probe cap per target IP, shared across instances.
    pub max_probes_per_ip: u32,
    /// Synchronous dispatch for integration testing; bypasses the queues.
    pub test_mode: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let signing_key = match lookup(&key("SIGNING_KEY")) {
            Some(value) if !value.is_empty() => value,
            _ => {
                warn!("no signing key configured, using the development default");
                DEV_SIGNING_KEY.to_string()
            }
        };

        let scanner_base_urls = match lookup(&key("SCANNER_URLS")) {
            Some(raw) => raw
                .split(',')
                .map(|u| u.trim().trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty())
                .collect(),
            None => vec!["http://127.0.0.1:8080".to_string()],
        };

        Ok(Self {
            bind_addr: parsed(&lookup, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            signing_key,
            redis_url: lookup(&key("REDIS_URL")).filter(|u| !u.is_empty()),
            scanner_base_urls,
            queue_capacity: parsed(&lookup, "QUEUE_CAPACITY", 256)?,
            scan_timeout: Duration::from_secs(parsed(&lookup, "SCAN_TIMEOUT_SECS", 90)?),
            probe_timeout: Duration::from_secs(parsed(&lookup, "PROBE_TIMEOUT_SECS", 10)?),
            connect_timeout: Duration::from_secs(parsed(&lookup, "CONNECT_TIMEOUT_SECS", 5)?),
            scan_attempts: parsed(&lookup, "SCAN_ATTEMPTS", 3)?,
            max_probes_per_ip: parsed(&lookup, "MAX_PROBES_PER_IP", 2)?,
            test_mode: flag(&lookup, "TEST_MODE")?,
        })
    }
}

fn key(name: &str) -> String {
    format!("{ENV_PREFIX}{name}")
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    let name = key(name);
    match lookup(&name) {
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
            name,
            value: value.clone(),
        }),
        None => Ok(default),
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<bool, ConfigError> {
    let name = key(name);
    match lookup(&name).as_deref() {
        None | Some("") | Some("0") | Some("false") => Ok(false),
        Some("1") | Some("true") => Ok(true),
        Some(other) => Err(ConfigError::Invalid {
            name,
            value: other.to_string(),
        }),
    }
}
