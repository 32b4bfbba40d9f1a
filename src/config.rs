//! Configuration file support.
//!
//! ```toml
//! [stream]
//! default_format = "json"   # json | ndjson | msgpack
//! flush_every = 100
//!
//! [server]
//! listen = "127.0.0.1:8080"
//! records = 1000            # omit for an unbounded listing
//! ```

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;

use crate::error::{Result, StreamError};
use crate::streaming::{FlushPolicy, FormatNegotiator, StreamFormat, StreamPump};

/// Default listen address for `catalog-stream serve`
pub const DEFAULT_LISTEN: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080));

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub stream: StreamConfig,
    pub server: ServerConfig,
}

/// Format and flush settings shared by every streamed response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    /// Format used when the `Accept` header names none of the streamed types
    pub default_format: StreamFormat,
    /// Records between forced flushes
    pub flush_every: FlushPolicy,
}

impl StreamConfig {
    pub fn negotiator(&self) -> FormatNegotiator {
        FormatNegotiator::new(self.default_format)
    }

    /// Negotiate a format for one request and build its pump.
    pub fn pump_for(&self, accept: &str) -> StreamPump {
        StreamPump::new(self.negotiator().select(accept), self.flush_every)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Records per listing; `None` streams until the client hangs up
    pub records: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN,
            records: None,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| StreamError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            StreamError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }
}
