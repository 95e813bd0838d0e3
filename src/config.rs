//! Configuration for stream endpoints.
//!
//! One [`StreamConfig`] serves both the consumer and the producer; the
//! consumer-group fields are simply unused by the producer. Configuration
//! can be constructed programmatically or deserialized from JSON/YAML.
//!
//! # Quick Start
//!
//! ```rust
//! use resp_stream::config::StreamConfig;
//!
//! let config = StreamConfig {
//!     stream: "events".into(),
//!     ..Default::default()
//! };
//! ```
//!
//! # Identity defaults
//!
//! The consumer group defaults to a hex SHA-256 of the hostname, so every
//! consumer on a host lands in the same group unless told otherwise. The
//! consumer name defaults to a hex SHA-256 of the username plus an RFC 3339
//! timestamp, which is unique per active consumer.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime};

use crate::error::{Result, StreamError};

/// Connection and endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Store host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Store port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for the HELLO handshake.
    #[serde(default = "default_username")]
    pub username: String,

    /// Password for the HELLO handshake. When unset, HELLO carries no AUTH
    /// clause at all.
    #[serde(default)]
    pub password: Option<String>,

    /// Stream key to read from or append to.
    pub stream: String,

    /// Consumer group name. Defaults to a hex SHA-256 of the hostname.
    #[serde(default)]
    pub group: Option<String>,

    /// Consumer name within the group. Defaults to a hex SHA-256 of the
    /// username plus the current RFC 3339 timestamp.
    #[serde(default)]
    pub consumer: Option<String>,

    /// Capacity of the delivery channel between the decoder and the caller.
    /// The next blocking read is only issued once a slot is reserved.
    #[serde(default = "default_entry_buffer")]
    pub entry_buffer: usize,

    /// Reconnect automatically after transport failures.
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Delay before a reconnect attempt (keeps refused connects from
    /// spinning). Duration string, e.g. `"250ms"`.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: String,

    /// Upper bound on the final-reply race during `close()`. Duration
    /// string, e.g. `"5s"`.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_username() -> String {
    "default".to_string()
}

fn default_entry_buffer() -> usize {
    16
}

fn default_true() -> bool {
    true
}

fn default_reconnect_delay() -> String {
    "250ms".to_string()
}

fn default_shutdown_timeout() -> String {
    "5s".to_string()
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: default_username(),
            password: None,
            stream: String::new(),
            group: None,
            consumer: None,
            entry_buffer: 16,
            auto_reconnect: true,
            reconnect_delay: default_reconnect_delay(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

impl StreamConfig {
    /// Create a config for testing against a local listener.
    pub fn for_testing(stream: &str, port: u16) -> Self {
        Self {
            stream: stream.to_string(),
            port,
            auto_reconnect: false,
            reconnect_delay: "10ms".to_string(),
            shutdown_timeout: "1s".to_string(),
            ..Default::default()
        }
    }

    /// Reject configs that cannot work before any socket is opened.
    pub fn validate(&self) -> Result<()> {
        if self.stream.is_empty() {
            return Err(StreamError::Config("stream key must not be empty".into()));
        }
        if self.entry_buffer == 0 {
            return Err(StreamError::Config("entry_buffer must be at least 1".into()));
        }
        Ok(())
    }

    /// `host:port` address for the TCP connect.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Consumer group name, deriving the hostname-based default if unset.
    pub fn group_name(&self) -> String {
        self.group.clone().unwrap_or_else(|| {
            let hostname = whoami::fallible::hostname().unwrap_or_else(|_| "localhost".into());
            sha256_hex(&hostname)
        })
    }

    /// Consumer name, deriving the per-instance default if unset.
    ///
    /// The derived name hashes in a timestamp, so call it once per consumer
    /// and keep the result.
    pub fn consumer_name(&self) -> String {
        self.consumer.clone().unwrap_or_else(|| {
            let stamp = humantime::format_rfc3339(SystemTime::now());
            sha256_hex(&format!("{}{}", self.username, stamp))
        })
    }

    /// Parse the reconnect delay string.
    pub fn reconnect_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.reconnect_delay).unwrap_or(Duration::from_millis(250))
    }

    /// Parse the shutdown timeout string.
    pub fn shutdown_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.shutdown_timeout).unwrap_or(Duration::from_secs(5))
    }
}
