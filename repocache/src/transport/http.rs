//! HTTP(S) transport over a blocking reqwest client.

use std::io::Read;
use std::time::SystemTime;

use reqwest::blocking::{Client, Response};
use reqwest::header::{
    HeaderMap, CONTENT_LENGTH, CONTENT_TYPE, IF_MODIFIED_SINCE, LAST_MODIFIED, USER_AGENT,
};
use reqwest::{Proxy, StatusCode};
use tracing::debug;
use url::Url;

use super::{upstream_user_agent, FetchedResource, Fetcher};
use crate::config::HttpSettings;
use crate::error::{ProxyError, ProxyResult};
use crate::util::{format_http_date, parse_http_date};

/// Conditional GET fetcher.
///
/// Connections are pooled per host. An upstream proxy, when configured, is
/// used for every request; proxy credentials come from the proxy URL's user
/// info. Without a configured proxy, environment proxy variables are ignored.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Build the client.
    ///
    /// # Errors
    ///
    /// `Initialization` when the proxy URL is invalid or the client cannot be
    /// built.
    pub fn new(settings: &HttpSettings, proxy: Option<&str>) -> ProxyResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.socket_timeout)
            .pool_max_idle_per_host(settings.max_connections);

        builder = match proxy {
            Some(proxy) => builder.proxy(upstream_proxy(proxy)?),
            None => builder.no_proxy(),
        };

        let client = builder.build().map_err(|e| {
            ProxyError::Initialization(format!("failed to create HTTP client: {}", e))
        })?;

        Ok(Self { client })
    }
}

/// Proxy for all schemes, with basic credentials from the URL if present.
fn upstream_proxy(proxy_url: &str) -> ProxyResult<Proxy> {
    let invalid = |e: &dyn std::fmt::Display| {
        ProxyError::Initialization(format!("invalid proxy URL '{}': {}", proxy_url, e))
    };

    let parsed = Url::parse(proxy_url).map_err(|e| invalid(&e))?;
    let mut proxy = Proxy::all(parsed.as_str()).map_err(|e| invalid(&e))?;

    if !parsed.username().is_empty() {
        proxy = proxy.basic_auth(parsed.username(), parsed.password().unwrap_or(""));
    }

    Ok(proxy)
}

impl Fetcher for HttpFetcher {
    fn fetch(
        &self,
        url: &Url,
        local_last_modified: Option<SystemTime>,
        user_agent: Option<&str>,
    ) -> ProxyResult<Box<dyn FetchedResource>> {
        let mut request = self
            .client
            .get(url.as_str())
            .header(USER_AGENT, upstream_user_agent(user_agent));

        if let Some(local) = local_last_modified {
            request = request.header(IF_MODIFIED_SINCE, format_http_date(local));
        }

        let response = request
            .send()
            .map_err(|e| ProxyError::transfer(url.as_str(), e))?;

        let status = response.status();
        debug!(url = %url, status = status.as_u16(), "Upstream responded");

        if status == StatusCode::NOT_FOUND {
            return Err(ProxyError::ResourceUnavailable(url.to_string()));
        }
        if status != StatusCode::OK && status != StatusCode::NOT_MODIFIED {
            return Err(ProxyError::transfer(url.as_str(), format!("HTTP {}", status)));
        }

        let headers = response.headers();
        Ok(Box::new(HttpResource {
            modified: local_last_modified.is_none() || status != StatusCode::NOT_MODIFIED,
            content_type: header_str(headers, CONTENT_TYPE).map(str::to_string),
            content_length: header_str(headers, CONTENT_LENGTH).and_then(|v| v.parse().ok()),
            last_modified: header_str(headers, LAST_MODIFIED).and_then(parse_http_date),
            response,
        }))
    }
}

fn header_str(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// An open HTTP response.
struct HttpResource {
    response: Response,
    modified: bool,
    content_type: Option<String>,
    content_length: Option<u64>,
    last_modified: Option<SystemTime>,
}

impl FetchedResource for HttpResource {
    fn is_modified(&self) -> bool {
        self.modified
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    fn body(&mut self) -> &mut dyn Read {
        &mut self.response
    }

    fn close(self: Box<Self>) -> ProxyResult<()> {
        // dropping the response returns the connection to the pool
        Ok(())
    }
}
