//! Centralized configuration for mwrpc.
//!
//! Protocol constants and timeout defaults live on holder structs; the
//! per-client knobs are collected in [`ClientOptions`].

use crate::backoff::BackoffConfig;
use crate::error::{Result, RpcError};
use crate::session::Credentials;
use std::time::Duration;

/// Wire protocol constants.
pub struct ProtocolConfig;

impl ProtocolConfig {
    pub const VERSION: &'static str = "1";
    pub const SUPPORTED_VERSIONS: &'static [&'static str] = &["1"];
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024; // 64MB

    // Well-known methods
    pub const LOGIN_METHOD: &'static str = "auth.login";
    pub const API_KEY_LOGIN_METHOD: &'static str = "auth.login_with_api_key";
    pub const PING_METHOD: &'static str = "core.ping";
    pub const JOB_QUERY_METHOD: &'static str = "core.get_jobs";
    pub const JOB_ABORT_METHOD: &'static str = "core.job_abort";
}

/// Timeout and interval defaults.
pub struct TimeoutConfig;

impl TimeoutConfig {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    /// Upper bound on how long `Client::close` waits for background tasks.
    pub const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);
    /// Upper bound on a graceful transport close from the writer task.
    pub const TRANSPORT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
    pub const JOB_POLL_INTERVAL: Duration = Duration::from_secs(1);
    pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
}

/// Per-client settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Endpoint URL (`ws://`, `wss://` or `tcp://`).
    pub url: String,
    pub credentials: Credentials,
    pub connect_timeout: Duration,
    /// Bounds the connect frame exchange and the login call.
    pub handshake_timeout: Duration,
    pub reconnect: BackoffConfig,
    pub auto_reconnect: bool,
    pub job_poll_interval: Duration,
    /// `None` disables keepalive pings.
    pub keepalive_interval: Option<Duration>,
    pub notification_capacity: usize,
    /// Largest inbound frame accepted, on every transport.
    pub max_message_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            credentials: Credentials::None,
            connect_timeout: TimeoutConfig::CONNECT_TIMEOUT,
            handshake_timeout: TimeoutConfig::HANDSHAKE_TIMEOUT,
            reconnect: BackoffConfig::default(),
            auto_reconnect: true,
            job_poll_interval: TimeoutConfig::JOB_POLL_INTERVAL,
            keepalive_interval: None,
            notification_capacity: 256,
            max_message_size: ProtocolConfig::MAX_MESSAGE_SIZE,
        }
    }
}

impl ClientOptions {
    /// Create options for the given endpoint URL with default values.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: BackoffConfig) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_job_poll_interval(mut self, interval: Duration) -> Self {
        self.job_poll_interval = interval;
        self
    }

    pub fn with_keepalive(mut self, interval: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Reject settings the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(RpcError::Config {
                message: message.to_string(),
            })
        };

        if self.job_poll_interval.is_zero() {
            return invalid("job poll interval must be positive");
        }
        if self.keepalive_interval.is_some_and(|i| i.is_zero()) {
            return invalid("keepalive interval must be positive");
        }
        if self.max_message_size == 0 {
            return invalid("max message size must be positive");
        }
        Ok(())
    }
}
