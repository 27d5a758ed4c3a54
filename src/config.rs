//! Client configuration

use crate::auth_client::{DEFAULT_AUTH_TIMEOUT, DEFAULT_AUTH_URL};
use crate::token_store::TokenStore;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default pause between two reconnections of a subscription
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Largest gRPC message accepted from the server (100 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// How the gRPC connection is secured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// No TLS at all, for local endpoints
    PlainText,
    /// TLS without certificate verification
    InsecureTls,
    /// TLS verified against the system trust roots
    #[default]
    SecureTls,
}

impl TransportMode {
    /// Port used when the endpoint address carries none and none is configured
    pub fn default_port(self) -> u16 {
        match self {
            TransportMode::PlainText => 9000,
            TransportMode::InsecureTls | TransportMode::SecureTls => 443,
        }
    }
}

/// Configuration for [`crate::Client`]
///
/// ```
/// use dfuse_client::{ClientConfig, TransportMode};
///
/// let config = ClientConfig::default()
///     .with_auth_url("https://auth.dfuse.io")
///     .with_transport(TransportMode::PlainText)
///     .with_port(9000);
/// assert!(config.authenticated);
/// ```
#[derive(Clone)]
pub struct ClientConfig {
    /// Token persistence, defaults to a keyed file store under the user configuration directory
    pub store: Option<Arc<dyn TokenStore>>,

    /// Authentication server base URL
    pub auth_url: String,

    /// Port appended to endpoint addresses that have none
    pub port: Option<u16>,

    pub transport: TransportMode,

    /// When false no API key is required and no token is ever attached to calls
    pub authenticated: bool,

    /// Timeout of a token issuance round trip
    pub auth_timeout: Duration,

    /// Pause before each reconnection of a subscription after a transient failure
    pub reconnect_delay: Duration,

    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            store: None,
            auth_url: DEFAULT_AUTH_URL.to_string(),
            port: None,
            transport: TransportMode::default(),
            authenticated: true,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn with_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_auth_url(mut self, auth_url: impl Into<String>) -> Self {
        self.auth_url = auth_url.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_transport(mut self, transport: TransportMode) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_plain_text(self) -> Self {
        self.with_transport(TransportMode::PlainText)
    }

    pub fn with_insecure(self) -> Self {
        self.with_transport(TransportMode::InsecureTls)
    }

    /// Disable API token retrieval, for endpoints that do not require authentication
    pub fn without_authentication(mut self) -> Self {
        self.authenticated = false;
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let store = self
            .store
            .as_ref()
            .map_or_else(|| "<unset>".to_string(), |store| store.to_string());

        f.debug_struct("ClientConfig")
            .field("store", &store)
            .field("auth_url", &self.auth_url)
            .field("port", &self.port)
            .field("transport", &self.transport)
            .field("authenticated", &self.authenticated)
            .field("auth_timeout", &self.auth_timeout)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}
