//! Backends and their resolution.
//!
//! A [`Backend`] is one repository: a storage directory owned exclusively by
//! it and an ordered list of mirror base URLs. The [`BackendResolver`] maps a
//! request to a backend:
//!
//! 1. a backend configured under the requested backend name, else
//! 2. a backend created on demand for the requested host, with a single
//!    mirror `<scheme>://<host>/<backend name>` and directory
//!    `<cache_dir>/<host>`.
//!
//! On-demand backends are created once per host and reused for the lifetime
//! of the resolver.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::package::BackendType;
use crate::request::RequestedData;

/// One repository instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    name: String,
    backend_type: BackendType,
    directory: PathBuf,
    urls: Vec<String>,
}

impl Backend {
    pub fn new(name: impl Into<String>, backend_type: BackendType, directory: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            backend_type,
            directory: directory.into(),
            urls: Vec::new(),
        }
    }

    /// Append a mirror; duplicates are ignored and order is preserved.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.add_url(url);
        self
    }

    pub fn add_url(&mut self, url: impl Into<String>) {
        let url = url.into();
        if !self.urls.contains(&url) {
            self.urls.push(url);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Mirror base URLs in failover order.
    pub fn urls(&self) -> &[String] {
        &self.urls
    }
}

/// Resolves requests to backends.
#[derive(Debug)]
pub struct BackendResolver {
    cache_dir: PathBuf,
    configured: HashMap<String, Arc<Backend>>,
    on_demand: Mutex<HashMap<String, Arc<Backend>>>,
    remaps: HashMap<String, String>,
}

impl BackendResolver {
    /// Build the resolver, creating the directories of configured backends.
    ///
    /// # Errors
    ///
    /// `Initialization` when a configured directory cannot be created.
    pub fn new(config: &ProxyConfig) -> ProxyResult<Self> {
        let mut configured = HashMap::new();

        for backend_config in &config.backends {
            let directory = backend_config
                .directory
                .clone()
                .unwrap_or_else(|| config.cache_dir.join(&backend_config.name));
            fs::create_dir_all(&directory).map_err(|e| {
                ProxyError::Initialization(format!(
                    "cannot create directory {} for backend '{}': {}",
                    directory.display(),
                    backend_config.name,
                    e
                ))
            })?;

            let mut backend =
                Backend::new(&backend_config.name, backend_config.backend_type, directory);
            for url in &backend_config.urls {
                backend.add_url(url.as_str());
            }
            configured.insert(backend_config.name.clone(), Arc::new(backend));
        }

        Ok(Self {
            cache_dir: config.cache_dir.clone(),
            configured,
            on_demand: Mutex::new(HashMap::new()),
            remaps: config.remaps.clone(),
        })
    }

    /// Backend serving `request`.
    ///
    /// # Errors
    ///
    /// `UnknownBackend` when no backend is configured under the name and none
    /// can be derived from the request's host.
    pub fn resolve(&self, request: &RequestedData) -> ProxyResult<Arc<Backend>> {
        if let Some(backend) = self.configured.get(request.backend()) {
            return Ok(Arc::clone(backend));
        }

        let request = request.clone().with_remaps(&self.remaps)?;
        let (Some(host), Some(host_url)) = (request.host(), request.host_url()) else {
            return Err(ProxyError::UnknownBackend(format!(
                "no backend named '{}' and no host to derive one from",
                request.backend()
            )));
        };

        let directory = host_directory(&self.cache_dir, host)?;

        let mut on_demand = self.on_demand.lock();
        if let Some(backend) = on_demand.get(host) {
            debug!(host, backend = backend.name(), "Reusing on-demand backend");
            return Ok(Arc::clone(backend));
        }

        fs::create_dir_all(&directory).map_err(|e| {
            ProxyError::UnknownBackend(format!(
                "cannot create directory {} for host '{}': {}",
                directory.display(),
                host,
                e
            ))
        })?;

        let url = format!("{}/{}", host_url, request.backend());
        info!(host, url = %url, directory = %directory.display(), "Created backend");

        let backend = Arc::new(Backend::new(host, BackendType::Deb, directory).with_url(url));
        on_demand.insert(host.to_string(), Arc::clone(&backend));
        Ok(backend)
    }

    /// Number of backends created on demand so far.
    pub fn on_demand_count(&self) -> usize {
        self.on_demand.lock().len()
    }
}

/// Storage directory of an on-demand backend.
///
/// The host comes from the client, so it must be a single plain path
/// component that stays inside `cache_dir`.
fn host_directory(cache_dir: &Path, host: &str) -> ProxyResult<PathBuf> {
    let mut components = Path::new(host).components();
    let plain = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !host.contains('\\');

    let directory = cache_dir.join(host);
    if !plain || !directory.starts_with(cache_dir) {
        return Err(ProxyError::UnknownBackend(format!(
            "host '{}' cannot name a cache directory",
            host
        )));
    }
    Ok(directory)
}
