//! Component construction and shutdown sequencing.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backend::BackendResolver;
use crate::config::ProxyConfig;
use crate::error::ProxyResult;
use crate::finder::RepoFinder;
use crate::lock::LockRegistry;
use crate::orchestrator::FetchOrchestrator;
use crate::pool::{EvictionDaemon, PackagePool};
use crate::transport::TransportRegistry;

/// A running proxy engine.
///
/// Construction is synchronous because the HTTP transport uses a blocking
/// client; only the eviction daemon runs on the tokio runtime passed to
/// [`start`](Self::start).
pub struct ProxyApp {
    config: ProxyConfig,
    finder: Arc<RepoFinder>,
    pool: Arc<PackagePool>,
    locks: Arc<LockRegistry>,
    eviction: Option<EvictionDaemon>,
    shutdown: CancellationToken,
}

impl ProxyApp {
    /// Build all components and spawn the eviction daemon on `runtime`.
    ///
    /// The daemon only runs when a `max_versions` policy is configured.
    ///
    /// # Errors
    ///
    /// `Initialization` for invalid configuration, patterns, proxy URL or
    /// backend directories.
    pub fn start(config: ProxyConfig, runtime: &Handle) -> ProxyResult<Self> {
        config.validate()?;
        info!(cache_dir = %config.cache_dir.display(), "Starting repocache engine");

        let locks = Arc::new(LockRegistry::new());
        let transports = TransportRegistry::from_config(&config)?;
        info!(schemes = ?transports.schemes(), "Transports ready");

        let orchestrator = Arc::new(FetchOrchestrator::new(
            Arc::clone(&locks),
            transports,
            config.freshness_window,
        ));
        let resolver = Arc::new(BackendResolver::new(&config)?);
        let pool = Arc::new(PackagePool::new(&config)?);
        let finder = Arc::new(RepoFinder::new(
            resolver,
            Arc::clone(&pool),
            orchestrator,
        ));

        let shutdown = CancellationToken::new();
        let eviction = match config.max_versions {
            Some(max_versions) => {
                let _guard = runtime.enter();
                info!(max_versions, "Eviction enabled");
                Some(EvictionDaemon::spawn(
                    Arc::clone(&pool),
                    &config.eviction,
                    shutdown.child_token(),
                ))
            }
            None => {
                info!("Eviction disabled, keeping all versions");
                None
            }
        };

        Ok(Self {
            config,
            finder,
            pool,
            locks,
            eviction,
            shutdown,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Shared request entry point.
    pub fn finder(&self) -> Arc<RepoFinder> {
        Arc::clone(&self.finder)
    }

    pub fn pool(&self) -> &Arc<PackagePool> {
        &self.pool
    }

    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// Token cancelled when the app shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop background work; pending evictions are drained first.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        if let Some(daemon) = self.eviction.take() {
            daemon.shutdown().await;
        }
        info!("repocache engine stopped");
    }
}

impl std::fmt::Debug for ProxyApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyApp")
            .field("cache_dir", &self.config.cache_dir)
            .field("eviction", &self.eviction.is_some())
            .finish()
    }
}
