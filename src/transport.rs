//! Outbound HTTP clients: one shared direct client and one per proxy URL.

use std::time::Duration;

use dashmap::DashMap;
use reqwest::{Client, Url};

use crate::error::{Error, Result};

/// How a proxy is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    /// SOCKS5 dialer (`socks5://`, `socks5h://`).
    Socks5,
    /// HTTP CONNECT proxy (`http://`, `https://`).
    Http,
}

/// A parsed per-channel proxy URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySpec {
    pub kind: ProxyKind,
    url: Url,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxySpec {
    /// Parse a proxy URL, pulling out optional basic-auth credentials.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw.trim())
            .map_err(|e| Error::Config(format!("invalid proxy url '{}': {}", raw, e)))?;

        if url.host_str().map_or(true, str::is_empty) {
            return Err(Error::Config(format!("proxy url '{}' has no host", raw)));
        }

        let kind = if url.scheme().starts_with("socks5") {
            ProxyKind::Socks5
        } else if matches!(url.scheme(), "http" | "https") {
            ProxyKind::Http
        } else {
            return Err(Error::Config(format!(
                "unsupported proxy scheme '{}' in '{}'",
                url.scheme(),
                raw
            )));
        };

        let username = Some(url.username().to_string()).filter(|u| !u.is_empty());
        let password = url.password().map(str::to_string);

        Ok(Self {
            kind,
            url,
            username,
            password,
        })
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> Option<u16> {
        self.url.port_or_known_default()
    }

    fn to_proxy(&self) -> Result<reqwest::Proxy> {
        let proxy = match self.kind {
            // The SOCKS5 connector reads credentials from the URL itself.
            ProxyKind::Socks5 => reqwest::Proxy::all(self.url.as_str()),
            ProxyKind::Http => {
                let mut bare = self.url.clone();
                let _ = bare.set_username("");
                let _ = bare.set_password(None);
                reqwest::Proxy::all(bare.as_str()).map(|p| match &self.username {
                    Some(user) => p.basic_auth(user, self.password.as_deref().unwrap_or("")),
                    None => p,
                })
            }
        };
        proxy.map_err(|e| Error::Config(format!("invalid proxy '{}': {}", self.host(), e)))
    }
}

fn base_builder(timeout: Option<Duration>) -> reqwest::ClientBuilder {
    let builder = Client::builder().connect_timeout(Duration::from_secs(10));
    match timeout {
        Some(t) => builder.timeout(t),
        None => builder,
    }
}

/// Build the direct client. `None` means no overall request timeout.
pub fn default_client(timeout: Option<Duration>) -> Result<Client> {
    base_builder(timeout)
        .build()
        .map_err(|e| Error::Config(format!("failed to build http client: {}", e)))
}

/// Build a fresh client tunnelling through `proxy_url`. Not cached.
pub fn proxy_client(proxy_url: &str, timeout: Option<Duration>) -> Result<Client> {
    let spec = ProxySpec::parse(proxy_url)?;
    base_builder(timeout)
        .proxy(spec.to_proxy()?)
        .build()
        .map_err(|e| Error::Config(format!("failed to build proxy client: {}", e)))
}

/// Process-wide outbound transport.
///
/// Created once at startup and shared by every dispatch. Proxy clients are
/// cached by URL so each proxy keeps a single connection pool for the life of
/// the process.
pub struct Transport {
    direct: Client,
    proxied: DashMap<String, Client>,
    timeout: Option<Duration>,
}

impl Transport {
    pub fn new(timeout: Option<Duration>) -> Result<Self> {
        Ok(Self {
            direct: default_client(timeout)?,
            proxied: DashMap::new(),
            timeout,
        })
    }

    pub fn default_client(&self) -> &Client {
        &self.direct
    }

    /// Client for a channel: direct without a proxy, otherwise the cached
    /// client for that proxy URL.
    pub fn client_for(&self, proxy: Option<&str>) -> Result<Client> {
        let Some(proxy) = proxy.filter(|p| !p.is_empty()) else {
            return Ok(self.direct.clone());
        };

        if let Some(client) = self.proxied.get(proxy) {
            return Ok(client.clone());
        }

        let client = proxy_client(proxy, self.timeout)?;
        tracing::debug!(proxy = %redact_proxy(proxy), "Built proxy client");
        Ok(self
            .proxied
            .entry(proxy.to_string())
            .or_insert(client)
            .clone())
    }

    /// Number of distinct proxy clients built so far.
    pub fn cached_proxies(&self) -> usize {
        self.proxied.len()
    }
}

/// Proxy URL with any credentials removed, for logs.
pub fn redact_proxy(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            let _ = url.set_username("");
            let _ = url.set_password(None);
            url.to_string()
        }
        Err(_) => "[unparsable]".to_string(),
    }
}
