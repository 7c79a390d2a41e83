//! Fluent construction of [`TransferConfig`].
//!
//! Every setter consumes and returns the builder, starting from the defaults.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use pixcache_engine::TransferConfig;
//!
//! let config = TransferConfig::builder()
//!     .with_connect_timeout(Duration::from_secs(2))
//!     .with_read_timeout(Duration::from_secs(5))
//!     .with_user_agent("thumbnailer/0.3")
//!     .build();
//! assert_eq!(config.read_timeout, Duration::from_secs(5));
//! ```

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

use crate::TransferConfig;

/// Accumulates overrides on top of [`TransferConfig::default`]
#[derive(Debug, Clone)]
pub struct TransferConfigBuilder {
    config: TransferConfig,
}

impl TransferConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: TransferConfig::default(),
        }
    }

    /// Bound on establishing the TCP/TLS connection
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Bound on waiting for each body chunk once the response has started
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    /// Identifying header sent with every request
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Insert one header. A name or value that does not parse is logged and dropped.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        match (
            name.as_ref().parse::<HeaderName>(),
            HeaderValue::from_str(value.as_ref()),
        ) {
            (Ok(name), Ok(value)) => {
                self.config.headers.insert(name, value);
            }
            _ => warn!(name = name.as_ref(), "Ignoring invalid header"),
        }
        self
    }

    /// Replace the whole header map, defaults included
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.config.headers = headers;
        self
    }

    pub fn with_system_proxy(mut self, use_system_proxy: bool) -> Self {
        self.config.use_system_proxy = use_system_proxy;
        self
    }

    /// Write buffer used while streaming to disk, at least one byte
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.config.buffer_size = buffer_size.max(1);
        self
    }

    pub fn build(self) -> TransferConfig {
        self.config
    }
}

impl Default for TransferConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
