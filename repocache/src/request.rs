//! Parsed inbound requests.
//!
//! A request path has the form `/<backend>/<resource path>`. The backend
//! segment selects the repository and the rest is the resource inside it.
//! Paths arrive percent-encoded and are decoded before anything else looks
//! at them, so `pkg_1.0%7erc1_all.deb` and `pkg_1.0~rc1_all.deb` are one
//! resource.
//!
//! ```
//! use repocache::request::RequestedData;
//!
//! let request = RequestedData::parse("/debian/pool/main/a/apt/apt_2.6.1_amd64.deb")
//!     .unwrap()
//!     .with_origin("http", "localhost:3142")
//!     .unwrap();
//!
//! assert_eq!(request.backend(), "debian");
//! assert_eq!(request.target(), "/pool/main/a/apt/apt_2.6.1_amd64.deb");
//! assert_eq!(request.host(), Some("localhost"));
//! assert_eq!(request.host_url().as_deref(), Some("http://localhost:3142"));
//! ```

use std::collections::HashMap;
use std::time::SystemTime;

use percent_encoding::percent_decode_str;
use url::Url;

use crate::error::{ProxyError, ProxyResult};

/// One inbound request, immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedData {
    path: String,
    backend: String,
    target: String,
    scheme: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    user_agent: Option<String>,
    if_modified_since: Option<SystemTime>,
}

impl RequestedData {
    /// Percent-decode a request path and split it into backend name and
    /// target resource.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` when the decoded path is not UTF-8, contains a NUL or
    /// a `/../` segment, has no backend segment, or names no resource inside
    /// the backend.
    pub fn parse(raw: &str) -> ProxyResult<Self> {
        let decoded = percent_decode_str(raw).decode_utf8().map_err(|_| {
            ProxyError::InvalidRequest(format!("'{}' does not decode to UTF-8", raw))
        })?;
        let path = decoded.as_ref();

        if path.contains('\0') {
            return Err(ProxyError::InvalidRequest(format!("NUL byte in '{}'", raw)));
        }
        if path.contains("/../") || path.ends_with("/..") {
            return Err(ProxyError::InvalidRequest(format!(
                "path traversal in '{}'",
                path
            )));
        }

        let rest = path
            .strip_prefix('/')
            .ok_or_else(|| ProxyError::InvalidRequest(format!("relative path '{}'", path)))?;

        let (backend, target) = match rest.find('/') {
            Some(idx) if idx > 0 => (&rest[..idx], &rest[idx..]),
            _ => {
                return Err(ProxyError::InvalidRequest(format!(
                    "no backend in '{}'",
                    path
                )))
            }
        };

        if target.trim_start_matches('/').is_empty() {
            return Err(ProxyError::InvalidRequest(format!(
                "no resource in '{}'",
                path
            )));
        }

        Ok(Self {
            path: path.to_string(),
            backend: backend.to_string(),
            target: target.to_string(),
            scheme: None,
            host: None,
            port: None,
            user_agent: None,
            if_modified_since: None,
        })
    }

    /// Record where the request was addressed (`Host` header form).
    ///
    /// Default ports for the scheme are dropped.
    pub fn with_origin(mut self, scheme: &str, authority: &str) -> ProxyResult<Self> {
        let origin = Url::parse(&format!("{}://{}/", scheme, authority)).map_err(|e| {
            ProxyError::InvalidRequest(format!("invalid host '{}': {}", authority, e))
        })?;
        let host = origin
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ProxyError::InvalidRequest(format!("invalid host '{}'", authority)))?;

        self.scheme = Some(origin.scheme().to_string());
        self.host = Some(host.to_string());
        self.port = origin.port();
        Ok(self)
    }

    /// Substitute the origin through a remap table.
    ///
    /// A remap target is a full authority, so it may carry its own port.
    pub fn with_remaps(self, remaps: &HashMap<String, String>) -> ProxyResult<Self> {
        let target = self.host.as_ref().and_then(|host| remaps.get(host)).cloned();
        match (target, self.scheme.clone()) {
            (Some(target), Some(scheme)) => self.with_origin(&scheme, &target),
            _ => Ok(self),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_if_modified_since(mut self, since: SystemTime) -> Self {
        self.if_modified_since = Some(since);
        self
    }

    /// The full requested path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Backend name (first path segment).
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Resource path inside the backend, with its leading slash.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Last segment of the target.
    pub fn file_name(&self) -> &str {
        self.target.rsplit('/').next().unwrap_or(&self.target)
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// `scheme://host[:port]`, when the origin is known.
    pub fn host_url(&self) -> Option<String> {
        let scheme = self.scheme.as_deref()?;
        let host = self.host.as_deref()?;
        Some(match self.port {
            Some(port) => format!("{}://{}:{}", scheme, host, port),
            None => format!("{}://{}", scheme, host),
        })
    }

    /// Reconstructed absolute URL of the request.
    pub fn url(&self) -> Option<String> {
        self.host_url().map(|base| format!("{}{}", base, self.path))
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    /// The client's conditional timestamp.
    pub fn if_modified_since(&self) -> Option<SystemTime> {
        self.if_modified_since
    }
}
