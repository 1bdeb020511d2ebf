//! Runtime configuration.
//!
//! Everything is loadable from `WIRETAP_*` environment variables with sane
//! defaults, so the binary runs without any setup; library embedders fill
//! the struct directly.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listen address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Relay chunk size in bytes.
    pub buffer_size: usize,
    /// Idle timeout for relay reads.
    pub timeout: Duration,
    /// Whether the relay keeps going after a completed request/response
    /// cycle.
    pub keep_alive: bool,
    /// Directory holding (or receiving) `mitm.pem` / `mitm.key`.
    pub ca_dir: PathBuf,
    /// How long `stop()` waits for in-flight connections before aborting
    /// them.
    pub shutdown_grace: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8888,
            buffer_size: 8192,
            timeout: Duration::from_secs(5),
            keep_alive: true,
            ca_dir: default_ca_dir(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ProxyConfig {
    /// Loads configuration from `WIRETAP_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let host = env::var("WIRETAP_HOST").unwrap_or(defaults.host);
        let port = match env::var("WIRETAP_PORT") {
            Ok(value) => value.parse().context("invalid WIRETAP_PORT")?,
            Err(_) => defaults.port,
        };
        let buffer_size = match env::var("WIRETAP_BUFFER_SIZE") {
            Ok(value) => value.parse().context("invalid WIRETAP_BUFFER_SIZE")?,
            Err(_) => defaults.buffer_size,
        };
        let timeout = match env::var("WIRETAP_TIMEOUT_SECS") {
            Ok(value) => {
                Duration::from_secs(value.parse().context("invalid WIRETAP_TIMEOUT_SECS")?)
            }
            Err(_) => defaults.timeout,
        };
        let keep_alive = match env::var("WIRETAP_KEEP_ALIVE") {
            Ok(value) => value.parse().context("invalid WIRETAP_KEEP_ALIVE")?,
            Err(_) => defaults.keep_alive,
        };
        let ca_dir = env::var("WIRETAP_CA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.ca_dir);
        let shutdown_grace = match env::var("WIRETAP_SHUTDOWN_GRACE_SECS") {
            Ok(value) => Duration::from_secs(
                value
                    .parse()
                    .context("invalid WIRETAP_SHUTDOWN_GRACE_SECS")?,
            ),
            Err(_) => defaults.shutdown_grace,
        };

        Ok(Self {
            host,
            port,
            buffer_size,
            timeout,
            keep_alive,
            ca_dir,
            shutdown_grace,
        })
    }
}

/// Platform data directory for persisted CA material.
fn default_ca_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "wiretap")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".wiretap"))
}
