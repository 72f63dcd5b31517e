use reqwest::Proxy;

use super::NetError;

/// Proxy configuration types
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub enum ProxyType {
    /// HTTP proxy
    Http,
    /// HTTPS proxy
    Https,
    /// SOCKS5 proxy
    Socks5,
    /// All protocols proxy
    All,
}

/// Proxy authentication
#[derive(Debug, Clone)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Proxy server URL (e.g., "http://proxy.example.com:8080")
    pub url: String,
    pub proxy_type: ProxyType,
    pub auth: Option<ProxyAuth>,
}

impl ProxyConfig {
    /// Parses `[socks5|http|https]://[user:pass@]host:port`, picking the
    /// proxy type from the scheme.
    pub fn from_url(url: &str) -> Result<Self, NetError> {
        let parsed = url::Url::parse(url).map_err(|e| NetError::Proxy(format!("{url}: {e}")))?;
        let proxy_type = match parsed.scheme() {
            "http" => ProxyType::Http,
            "https" => ProxyType::Https,
            "socks5" | "socks5h" => ProxyType::Socks5,
            other => return Err(NetError::Proxy(format!("unsupported scheme {other}"))),
        };
        let auth = (!parsed.username().is_empty()).then(|| ProxyAuth {
            username: parsed.username().to_owned(),
            password: parsed.password().unwrap_or_default().to_owned(),
        });

        let mut bare = parsed.clone();
        let _ = bare.set_username("");
        let _ = bare.set_password(None);
        Ok(Self {
            url: bare.to_string(),
            proxy_type,
            auth,
        })
    }
}

/// Build a reqwest Proxy from the proxy configuration
pub fn build_proxy_from_config(config: &ProxyConfig) -> Result<Proxy, NetError> {
    let proxy_url = &config.url;

    let mut proxy = match config.proxy_type {
        ProxyType::Http => Proxy::http(proxy_url)
            .map_err(|e| NetError::Proxy(format!("Invalid HTTP proxy URL: {e}")))?,
        ProxyType::Https => Proxy::https(proxy_url)
            .map_err(|e| NetError::Proxy(format!("Invalid HTTPS proxy URL: {e}")))?,
        ProxyType::Socks5 => {
            let url = if proxy_url.starts_with("socks5://") || proxy_url.starts_with("socks5h://")
            {
                proxy_url.to_string()
            } else {
                format!("socks5://{proxy_url}")
            };
            Proxy::all(&url).map_err(|e| NetError::Proxy(format!("Invalid SOCKS5 proxy URL: {e}")))?
        }
        ProxyType::All => {
            Proxy::all(proxy_url).map_err(|e| NetError::Proxy(format!("Invalid proxy URL: {e}")))?
        }
    };

    if let Some(auth) = &config.auth {
        proxy = proxy.basic_auth(&auth.username, &auth.password);
    }

    Ok(proxy)
}
