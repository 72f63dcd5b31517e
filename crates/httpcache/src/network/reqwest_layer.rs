use std::error::Error as StdError;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use rustls::{ClientConfig, crypto::aws_lc_rs};
use rustls_platform_verifier::BuilderVerifierExt;
use tracing::{debug, info};

use super::proxy::build_proxy_from_config;
use super::{
    AuthCredentials, NetError, NetworkConfig, NetworkLayer, NetworkTransaction, RequestPriority,
};
use crate::headers::ResponseHeaders;
use crate::request::HttpRequest;
use crate::response::{ResponseInfo, SecurityInfo};

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &NetworkConfig) -> Result<Client, NetError> {
    let provider = Arc::new(aws_lc_rs::default_provider());

    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| NetError::Certificate(e.to_string()))?
        .with_platform_verifier()
        .map_err(|e| NetError::Certificate(e.to_string()))?
        .with_no_client_auth();

    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(5)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .use_preconfigured_tls(tls_config)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if !config.read_timeout.is_zero() {
        client_builder = client_builder.pool_idle_timeout(config.read_timeout);
    }

    if let Some(proxy_config) = &config.proxy {
        let proxy = build_proxy_from_config(proxy_config)?;
        client_builder = client_builder.proxy(proxy);
        info!(proxy_url = %proxy_config.url, "Using explicitly configured proxy");
    } else if config.use_system_proxy {
        debug!("Using system proxy settings");
    } else {
        client_builder = client_builder.no_proxy();
        debug!("Proxy disabled");
    }

    client_builder
        .build()
        .map_err(|e| NetError::Other(error_chain(&e)))
}

/// Network layer backed by a shared reqwest client.
#[derive(Clone)]
pub struct ReqwestNetworkLayer {
    client: Client,
}

impl ReqwestNetworkLayer {
    pub fn new(config: &NetworkConfig) -> Result<Self, NetError> {
        Ok(Self {
            client: create_client(config)?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl NetworkLayer for ReqwestNetworkLayer {
    fn create_transaction(
        &self,
        priority: RequestPriority,
    ) -> Result<Box<dyn NetworkTransaction>, NetError> {
        Ok(Box::new(ReqwestTransaction {
            client: self.client.clone(),
            priority,
            request: None,
            response: None,
            body: None,
            pending: Bytes::new(),
            received: 0,
        }))
    }
}

struct ReqwestTransaction {
    client: Client,
    priority: RequestPriority,
    request: Option<HttpRequest>,
    response: Option<ResponseInfo>,
    body: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    pending: Bytes,
    received: u64,
}

impl ReqwestTransaction {
    async fn send(&mut self, credentials: Option<&AuthCredentials>) -> Result<(), NetError> {
        let request = self
            .request
            .as_ref()
            .ok_or_else(|| NetError::Other("transaction was not started".into()))?;

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(upload) = &request.upload {
            builder = builder.body(upload.bytes.clone());
        }
        if let Some(credentials) = credentials {
            builder = builder.basic_auth(&credentials.username, Some(&credentials.password));
        }

        self.body = None;
        self.pending = Bytes::new();

        let request_time = Utc::now();
        let response = builder.send().await.map_err(NetError::from)?;

        let headers = ResponseHeaders::from_parts(
            response.status().as_u16(),
            response.version(),
            response.headers().clone(),
        );
        let mut info = ResponseInfo::new(headers);
        info.request_time = request_time;
        info.response_time = Utc::now();
        info.network_accessed = true;
        if response.url().scheme() == "https" {
            info.security_info = Some(SecurityInfo::default());
        }

        debug!(
            url = %response.url(),
            status = response.status().as_u16(),
            priority = ?self.priority,
            "Network response received"
        );

        self.response = Some(info);
        self.body = Some(response.bytes_stream().boxed());
        Ok(())
    }
}

#[async_trait]
impl NetworkTransaction for ReqwestTransaction {
    async fn start(&mut self, request: &HttpRequest) -> Result<(), NetError> {
        self.request = Some(request.clone());
        self.send(None).await
    }

    async fn restart_with_auth(&mut self, credentials: &AuthCredentials) -> Result<(), NetError> {
        self.send(Some(credentials)).await
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, NetError> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.len());
                buf[..n].copy_from_slice(&self.pending[..n]);
                self.pending.advance(n);
                return Ok(n);
            }

            let Some(body) = self.body.as_mut() else {
                return Ok(0);
            };
            match body.next().await {
                Some(Ok(chunk)) => {
                    self.received += chunk.len() as u64;
                    self.pending = chunk;
                }
                Some(Err(e)) => {
                    self.body = None;
                    return Err(NetError::from(e));
                }
                None => {
                    self.body = None;
                    return Ok(0);
                }
            }
        }
    }

    fn response_info(&self) -> Option<&ResponseInfo> {
        self.response.as_ref()
    }

    fn total_received_bytes(&self) -> u64 {
        self.received
    }

    fn set_priority(&mut self, priority: RequestPriority) {
        self.priority = priority;
    }
}

impl From<reqwest::Error> for NetError {
    fn from(err: reqwest::Error) -> Self {
        let message = error_chain(&err);
        if err.is_timeout() {
            NetError::ConnectionTimedOut
        } else if err.is_connect() {
            let host = err
                .url()
                .and_then(|u| u.host_str())
                .unwrap_or_default()
                .to_owned();
            let lower = message.to_ascii_lowercase();
            if lower.contains("dns error") || lower.contains("failed to lookup address") {
                NetError::NameNotResolved(host)
            } else if lower.contains("certificate") {
                NetError::Certificate(message)
            } else {
                NetError::AddressUnreachable(message)
            }
        } else if err.is_body() || err.is_decode() {
            NetError::ConnectionReset
        } else {
            NetError::Http(message)
        }
    }
}

/// Error message including every source in the chain.
fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}
