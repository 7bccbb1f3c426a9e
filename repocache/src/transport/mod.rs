//! Upstream transports.
//!
//! A [`Fetcher`] performs one conditional fetch and hands back a
//! [`FetchedResource`] that owns the open connection. The caller reads the
//! body (when modified) and must [`close`](FetchedResource::close) it.
//!
//! ```text
//! TransportRegistry ── "http" / "https" ──► HttpFetcher (reqwest, blocking)
//!                   └─ "ftp" ─────────────► FtpFetcher  (suppaftp, passive)
//! ```
//!
//! Failure contract shared by all fetchers:
//!
//! | Upstream says            | Result                          |
//! |--------------------------|---------------------------------|
//! | resource absent          | `ProxyError::ResourceUnavailable` |
//! | anything else going wrong| `ProxyError::Transfer` / `Io`   |

mod ftp;
mod http;
#[cfg(test)]
pub(crate) mod mock;

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::time::SystemTime;

use url::Url;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};

pub use ftp::FtpFetcher;
pub use http::HttpFetcher;

/// Result of one upstream fetch attempt.
pub trait FetchedResource: Send {
    /// Whether the upstream copy differs from the local one.
    ///
    /// Always true when there was no local copy.
    fn is_modified(&self) -> bool;

    fn content_type(&self) -> Option<&str>;

    fn content_length(&self) -> Option<u64>;

    fn last_modified(&self) -> Option<SystemTime>;

    /// The remote byte stream.
    fn body(&mut self) -> &mut dyn Read;

    /// Release the underlying connection.
    fn close(self: Box<Self>) -> ProxyResult<()>;
}

/// Conditional fetch over one protocol.
pub trait Fetcher: Send + Sync {
    /// Fetch `url`, skipping the body when it is not newer than
    /// `local_last_modified`.
    ///
    /// `user_agent` is the requesting client's agent, forwarded where the
    /// protocol supports it.
    fn fetch(
        &self,
        url: &Url,
        local_last_modified: Option<SystemTime>,
        user_agent: Option<&str>,
    ) -> ProxyResult<Box<dyn FetchedResource>>;
}

/// Fetchers keyed by URL scheme.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    fetchers: HashMap<String, Arc<dyn Fetcher>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with HTTP(S) and FTP fetchers built from `config`.
    pub fn from_config(config: &ProxyConfig) -> ProxyResult<Self> {
        let http: Arc<dyn Fetcher> =
            Arc::new(HttpFetcher::new(&config.http, config.http_proxy.as_deref())?);
        let ftp: Arc<dyn Fetcher> = Arc::new(FtpFetcher::new(&config.ftp));

        Ok(Self::new()
            .with_fetcher("http", Arc::clone(&http))
            .with_fetcher("https", http)
            .with_fetcher("ftp", ftp))
    }

    /// Register `fetcher` for `scheme`, replacing any previous one.
    pub fn with_fetcher(mut self, scheme: &str, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetchers.insert(scheme.to_ascii_lowercase(), fetcher);
        self
    }

    /// Fetcher for the scheme of `url`.
    ///
    /// # Errors
    ///
    /// `Initialization` when no fetcher handles the scheme.
    pub fn resolve(&self, url: &Url) -> ProxyResult<Arc<dyn Fetcher>> {
        self.fetchers.get(url.scheme()).cloned().ok_or_else(|| {
            ProxyError::Initialization(format!(
                "no transport for scheme '{}' ({})",
                url.scheme(),
                url
            ))
        })
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.fetchers.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

/// Outgoing user agent: the client's agent followed by ours.
pub(crate) fn upstream_user_agent(client: Option<&str>) -> String {
    format!("{} {}", client.unwrap_or(""), crate::user_agent())
        .trim()
        .to_string()
}
