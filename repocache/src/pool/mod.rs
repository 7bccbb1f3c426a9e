//! Package pool: on-disk objects and version-based eviction.
//!
//! The pool maps `(backend, resource path)` to a [`PoolObject`] under the
//! backend's directory and attaches package metadata when the file name
//! matches the backend type's pattern.
//!
//! # Eviction
//!
//! Freshly fetched packages are queued with [`PackagePool::schedule_eviction`].
//! A sweep swaps the whole pending set out under the lock and then, outside
//! the lock, keeps only the newest `max_versions` files of each family:
//!
//! ```text
//! pending set ──swap──► [objects] ──► list siblings of same family
//!                                        │
//!                                        ▼
//!                              sort oldest → newest
//!                                        │
//!                                        ▼
//!                           delete count - max_versions oldest
//! ```
//!
//! Sweeps run from the [`EvictionDaemon`].

mod eviction;
mod object;

pub use eviction::EvictionDaemon;
pub use object::{PoolObject, STAGING_SUFFIX};

use std::collections::HashMap;
use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::package::{
    BackendType, DebianVersionComparator, PackageNameParser, RepoPackage, VersionComparator,
};

/// Outcome of one eviction sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Pending objects processed.
    pub examined: usize,
    /// Superseded files deleted.
    pub deleted: usize,
    /// Deletions that failed.
    pub failed: usize,
}

impl EvictionReport {
    fn merge(&mut self, other: EvictionReport) {
        self.examined += other.examined;
        self.deleted += other.deleted;
        self.failed += other.failed;
    }
}

/// Cache storage shared by all backends.
pub struct PackagePool {
    parsers: HashMap<BackendType, PackageNameParser>,
    comparator: Arc<dyn VersionComparator>,
    max_versions: Option<usize>,
    pending: Mutex<HashMap<PathBuf, PoolObject>>,
}

impl PackagePool {
    /// Pool with the configured patterns and retention policy.
    ///
    /// # Errors
    ///
    /// `Initialization` for an invalid pattern or `max_versions = 0`.
    pub fn new(config: &ProxyConfig) -> ProxyResult<Self> {
        if config.max_versions == Some(0) {
            return Err(ProxyError::Initialization(
                "max_versions must be at least 1".to_string(),
            ));
        }

        let parsers = BackendType::ALL
            .iter()
            .map(|&backend_type| {
                PackageNameParser::new(config.pattern_for(backend_type))
                    .map(|parser| (backend_type, parser))
            })
            .collect::<ProxyResult<HashMap<_, _>>>()?;

        Ok(Self {
            parsers,
            comparator: Arc::new(DebianVersionComparator),
            max_versions: config.max_versions,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Replace the version comparator.
    pub fn with_comparator(mut self, comparator: Arc<dyn VersionComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn max_versions(&self) -> Option<usize> {
        self.max_versions
    }

    /// Object for `resource_path` under `backend`.
    ///
    /// Nothing is created on disk; parent directories appear when a fetch
    /// starts staging the file. An unparseable file name is not an error; the object just carries no
    /// package metadata.
    pub fn get_object(&self, backend: &Backend, resource_path: &str) -> ProxyResult<PoolObject> {
        let relative = resource_path.trim_start_matches('/');
        if relative.is_empty() || relative.ends_with('/') {
            return Err(ProxyError::InvalidRequest(format!(
                "'{}' does not name a file",
                resource_path
            )));
        }

        let path = backend.directory().join(relative);

        let name = relative.rsplit('/').next().unwrap_or(relative);
        let package = match self.parser(backend.backend_type()).parse(name) {
            Ok(package) => Some(package),
            Err(e) => {
                debug!(resource = resource_path, reason = %e, "Not a versioned package");
                None
            }
        };

        Ok(PoolObject::new(path, backend.backend_type(), package).with_root(backend.directory()))
    }

    fn parser(&self, backend_type: BackendType) -> &PackageNameParser {
        &self.parsers[&backend_type]
    }

    /// Queue an object for the next sweep. Re-queuing is a no-op.
    pub fn schedule_eviction(&self, object: &PoolObject) {
        let mut pending = self.pending.lock();
        if !pending.contains_key(object.path()) {
            debug!(object = %object.path().display(), "Scheduled eviction");
            pending.insert(object.path().to_path_buf(), object.clone());
        }
    }

    /// Number of objects waiting for a sweep.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drain the pending set and evict superseded versions.
    pub fn run_eviction_sweep(&self) -> EvictionReport {
        let batch = mem::take(&mut *self.pending.lock());
        let mut report = EvictionReport::default();

        for object in batch.into_values() {
            report.merge(self.evict_superseded(&object));
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                deleted = report.deleted,
                failed = report.failed,
                "Eviction sweep finished"
            );
        }
        report
    }

    /// Keep only the newest `max_versions` files of the object's family.
    fn evict_superseded(&self, object: &PoolObject) -> EvictionReport {
        let mut report = EvictionReport {
            examined: 1,
            ..EvictionReport::default()
        };

        let Some(max_versions) = self.max_versions else {
            return report;
        };
        let Some(package) = object.package() else {
            warn!(object = %object.path().display(), "Eviction requested for an unversioned file");
            return report;
        };
        let Some(directory) = object.path().parent() else {
            return report;
        };

        let mut family = match self.family_members(directory, object.backend_type(), package) {
            Ok(family) => family,
            Err(e) => {
                error!(directory = %directory.display(), error = %e, "Cannot list package directory");
                return report;
            }
        };

        if family.len() <= max_versions {
            return report;
        }

        family.sort_by(|(a, _), (b, _)| self.comparator.compare_versions(a, b));
        let excess = family.len() - max_versions;

        for (superseded, path) in family.into_iter().take(excess) {
            match fs::remove_file(&path) {
                Ok(()) => {
                    info!(package = %superseded, path = %path.display(), "Evicted superseded version");
                    report.deleted += 1;
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Failed to evict superseded version");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Files in `directory` of the same family as `package`.
    fn family_members(
        &self,
        directory: &Path,
        backend_type: BackendType,
        package: &RepoPackage,
    ) -> ProxyResult<Vec<(RepoPackage, PathBuf)>> {
        let parser = self.parser(backend_type);
        let mut members = Vec::new();

        for entry in fs::read_dir(directory)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Ok(candidate) = parser.parse(name) {
                if candidate.same_family(package) {
                    members.push((candidate, entry.path()));
                }
            }
        }
        Ok(members)
    }
}

impl std::fmt::Debug for PackagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackagePool")
            .field("max_versions", &self.max_versions)
            .field("pending", &self.pending_count())
            .finish()
    }
}
