//! # Network Layer
//!
//! The cache talks to the origin through [`NetworkLayer`], which hands out
//! one [`NetworkTransaction`] per request. [`ReqwestNetworkLayer`] is the
//! production implementation.

use async_trait::async_trait;

mod config;
mod proxy;
mod reqwest_layer;

pub use config::{NetworkConfig, NetworkConfigBuilder};
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType, build_proxy_from_config};
pub use reqwest_layer::{ReqwestNetworkLayer, create_client};

use crate::request::HttpRequest;
use crate::response::ResponseInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum RequestPriority {
    Idle,
    Lowest,
    Low,
    #[default]
    Medium,
    Highest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthCredentials {
    pub username: String,
    pub password: String,
}

impl AuthCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum NetError {
    #[error("name not resolved: {0}")]
    NameNotResolved(String),

    #[error("internet disconnected")]
    InternetDisconnected,

    #[error("address unreachable: {0}")]
    AddressUnreachable(String),

    #[error("connection timed out")]
    ConnectionTimedOut,

    #[error("connection reset")]
    ConnectionReset,

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("invalid proxy configuration: {0}")]
    Proxy(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("{0}")]
    Other(String),
}

impl NetError {
    /// Errors that suggest the origin is unreachable rather than broken.
    pub fn is_offline(&self) -> bool {
        matches!(
            self,
            NetError::NameNotResolved(_)
                | NetError::InternetDisconnected
                | NetError::AddressUnreachable(_)
                | NetError::ConnectionTimedOut
        )
    }
}

pub trait NetworkLayer: Send + Sync {
    fn create_transaction(
        &self,
        priority: RequestPriority,
    ) -> Result<Box<dyn NetworkTransaction>, NetError>;
}

/// One request/response exchange with the origin.
#[async_trait]
pub trait NetworkTransaction: Send {
    /// Sends the request and resolves once response headers are available.
    async fn start(&mut self, request: &HttpRequest) -> Result<(), NetError>;

    /// Resends the last request with credentials after a 401/407.
    async fn restart_with_auth(&mut self, credentials: &AuthCredentials) -> Result<(), NetError>;

    /// Whether the transaction can answer the last challenge on its own,
    /// e.g. with credentials embedded in the URL.
    fn is_ready_to_restart_for_auth(&self) -> bool {
        false
    }

    /// Reads body bytes. `Ok(0)` is the end of the body.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, NetError>;

    fn response_info(&self) -> Option<&ResponseInfo>;

    fn total_received_bytes(&self) -> u64;

    fn set_priority(&mut self, _priority: RequestPriority) {}
}
