//! Mirror iteration with failover.
//!
//! [`RepoFinder::find_and_serve`] resolves the backend, looks up the pool
//! object and tries each mirror in order until one attempt succeeds:
//!
//! | Attempt error           | Reaction                                     |
//! |-------------------------|----------------------------------------------|
//! | `ResourceUnavailable`   | next mirror                                  |
//! | `Initialization`        | log, next mirror                             |
//! | I/O class, uncommitted  | discard response state, next mirror          |
//! | I/O class, committed    | fail the request (bytes already sent)        |
//! | anything else           | fail the request                             |
//!
//! When every mirror is exhausted the request fails as unavailable.

use std::sync::Arc;

use tracing::{debug, info, warn};
use url::Url;

use crate::backend::BackendResolver;
use crate::error::{ProxyError, ProxyResult};
use crate::orchestrator::{FetchOrchestrator, ServeOutcome};
use crate::pool::{PackagePool, PoolObject};
use crate::request::RequestedData;
use crate::response::ResponseSink;

/// Entry point for serving one request.
#[derive(Debug, Clone)]
pub struct RepoFinder {
    resolver: Arc<BackendResolver>,
    pool: Arc<PackagePool>,
    orchestrator: Arc<FetchOrchestrator>,
}

impl RepoFinder {
    pub fn new(
        resolver: Arc<BackendResolver>,
        pool: Arc<PackagePool>,
        orchestrator: Arc<FetchOrchestrator>,
    ) -> Self {
        Self {
            resolver,
            pool,
            orchestrator,
        }
    }

    pub fn pool(&self) -> &Arc<PackagePool> {
        &self.pool
    }

    /// Serve `request` into `sink` from the first mirror that has it.
    pub fn find_and_serve(
        &self,
        request: &RequestedData,
        sink: &mut dyn ResponseSink,
    ) -> ProxyResult<ServeOutcome> {
        let backend = self.resolver.resolve(request)?;
        let object = self.pool.get_object(&backend, request.target())?;

        for base in backend.urls() {
            let target = match mirror_url(base, request.target()) {
                Ok(target) => target,
                Err(e) => {
                    warn!(mirror = %base, error = %e, "Skipping mirror");
                    continue;
                }
            };

            match self.orchestrator.send_and_save(request, &object, &target, sink) {
                Ok(outcome) => {
                    debug!(url = %target, ?outcome, "Request served");
                    self.after_success(&object, outcome);
                    return Ok(outcome);
                }
                Err(ProxyError::ResourceUnavailable(_)) => {
                    info!(url = %target, "Not found on mirror, trying next");
                }
                Err(ProxyError::Initialization(reason)) => {
                    warn!(url = %target, reason = %reason, "Mirror unusable, trying next");
                }
                Err(e) if e.is_io() && !sink.is_committed() => {
                    warn!(url = %target, error = %e, "Mirror failed, trying next");
                }
                Err(e) => return Err(e),
            }

            sink.reset();
        }

        Err(ProxyError::ResourceUnavailable(request.path().to_string()))
    }

    fn after_success(&self, object: &PoolObject, outcome: ServeOutcome) {
        if outcome == ServeOutcome::Fetched
            && self.pool.max_versions().is_some()
            && object.package().is_some()
        {
            self.pool.schedule_eviction(object);
        }
    }
}

/// Absolute URL of `target` on the mirror at `base`.
///
/// `target` is decoded text; each segment is percent-encoded again.
fn mirror_url(base: &str, target: &str) -> ProxyResult<Url> {
    let invalid = |reason: &str| {
        ProxyError::Initialization(format!("invalid mirror URL '{}': {}", base, reason))
    };

    let mut url = Url::parse(base).map_err(|e| invalid(&e.to_string()))?;
    url.path_segments_mut()
        .map_err(|()| invalid("cannot be a base"))?
        .pop_if_empty()
        .extend(target.trim_start_matches('/').split('/'));
    Ok(url)
}
