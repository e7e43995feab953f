//! Configuration for the poll manager, clients and servers.
//!
//! Every struct has a `Default` and deserializes with missing fields falling
//! back to it, so a JSON file only needs to name what it changes:
//!
//! ```
//! use wirecall::config::RpcConfig;
//!
//! let config = RpcConfig::from_json_str(r#"{ "client": { "call_timeout_ms": 250 } }"#).unwrap();
//! assert_eq!(config.client.call_timeout_ms, Some(250));
//! assert_eq!(config.poll.io_threads, 1);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, RpcError};
use crate::protocol::{ABSOLUTE_MAX_PAYLOAD_SIZE, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::writer::{WriterConfig, DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_PENDING_FRAMES};

/// Default number of I/O worker threads.
pub const DEFAULT_IO_THREADS: usize = 1;

/// Default name prefix for I/O worker threads.
pub const DEFAULT_THREAD_NAME: &str = "wirecall-io";

/// Default connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Default backpressure timeout in milliseconds.
pub const DEFAULT_BACKPRESSURE_TIMEOUT_MS: u64 = 5_000;

/// Default time given to in-flight I/O tasks on shutdown, in milliseconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 1_000;

/// Default maximum concurrent handlers per server.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Poll manager settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Worker threads driving socket I/O.
    pub io_threads: usize,
    /// Name prefix for the worker threads.
    pub thread_name: String,
    /// Grace period for in-flight tasks when the manager shuts down.
    pub shutdown_timeout_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            io_threads: DEFAULT_IO_THREADS,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl PollConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Client settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// TCP connect timeout.
    pub connect_timeout_ms: u64,
    /// Default deadline for `sync_call`; `None` waits indefinitely.
    pub call_timeout_ms: Option<u64>,
    /// Largest reply payload accepted.
    pub max_payload_size: u32,
    /// Writer channel capacity.
    pub channel_capacity: usize,
    /// Queued frames before senders wait.
    pub max_pending_frames: usize,
    /// How long a sender waits for the queue to drain.
    pub backpressure_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            call_timeout_ms: None,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            backpressure_timeout_ms: DEFAULT_BACKPRESSURE_TIMEOUT_MS,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_pending_frames: self.max_pending_frames,
            channel_capacity: self.channel_capacity,
            backpressure_timeout: Duration::from_millis(self.backpressure_timeout_ms),
        }
    }

    /// Reject settings the connection cannot run with.
    pub fn validate(&self) -> Result<()> {
        check_connection_limits(self.max_payload_size, self.channel_capacity)
    }
}

/// Server settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Handlers running at once across all connections; further requests wait.
    pub max_concurrent_handlers: usize,
    /// Largest request payload accepted.
    pub max_payload_size: u32,
    /// Writer channel capacity per connection.
    pub channel_capacity: usize,
    /// Queued reply frames per connection before handlers wait.
    pub max_pending_frames: usize,
    /// How long a reply waits for the queue to drain.
    pub backpressure_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            backpressure_timeout_ms: DEFAULT_BACKPRESSURE_TIMEOUT_MS,
        }
    }
}

impl ServerConfig {
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_pending_frames: self.max_pending_frames,
            channel_capacity: self.channel_capacity,
            backpressure_timeout: Duration::from_millis(self.backpressure_timeout_ms),
        }
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_handlers == 0 {
            return Err(RpcError::Config(
                "max_concurrent_handlers must be at least 1".to_string(),
            ));
        }
        check_connection_limits(self.max_payload_size, self.channel_capacity)
    }
}

/// The size prefix is an i32 that also counts the xid and tag.
fn check_connection_limits(max_payload_size: u32, channel_capacity: usize) -> Result<()> {
    if max_payload_size > ABSOLUTE_MAX_PAYLOAD_SIZE {
        return Err(RpcError::Config(format!(
            "max_payload_size {} exceeds the protocol limit {}",
            max_payload_size, ABSOLUTE_MAX_PAYLOAD_SIZE
        )));
    }
    if channel_capacity == 0 {
        return Err(RpcError::Config(
            "channel_capacity must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// All settings of a process, loadable as one JSON document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub poll: PollConfig,
    pub client: ClientConfig,
    pub server: ServerConfig,
}

impl RpcConfig {
    /// Parse from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}
