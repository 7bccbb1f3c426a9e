//! Fetch orchestration: cache hit or refetch, tee, commit or roll back.
//!
//! [`FetchOrchestrator::send_and_save`] serves one request against one
//! mirror. The per-object lock from the [`LockRegistry`] decides who may
//! touch the file:
//!
//! ```text
//!                  read lock
//!                      │
//!          ┌───────────┴────────────┐
//!     object cached              object missing
//!          │                         │
//!   check due? ──no──► serve    drop read, take write
//!          │ yes                     │
//!   conditional fetch         cached meanwhile? ──yes──► serve
//!          │                         │ no
//!   not modified ──► serve      fetch ──► tee to staging + client
//!          │ modified                          │
//!   drop read, take write          length check, stamp, commit
//!          │
//!   changed meanwhile? ──yes──► serve
//!          │ no
//!   tee to staging + client, commit
//! ```
//!
//! Re-checking after the write lock is taken means a burst of requests for
//! an uncached resource produces exactly one upstream fetch: the first
//! writer commits, the others find the object cached.
//!
//! A failed attempt on a previously missing object removes both staging and
//! final files before the lock is released.

mod freshness;

pub use freshness::FreshnessTracker;

use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use reqwest::StatusCode;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ProxyError, ProxyResult};
use crate::lock::LockRegistry;
use crate::pool::PoolObject;
use crate::request::RequestedData;
use crate::response::ResponseSink;
use crate::transport::{FetchedResource, TransportRegistry};
use crate::util::truncate_to_seconds;

/// Copy buffer size (64 KiB).
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// How a request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// Served from the local copy, possibly as 304.
    Cached,
    /// Fetched from upstream and stored.
    Fetched,
}

impl ServeOutcome {
    pub fn from_cache(&self) -> bool {
        matches!(self, ServeOutcome::Cached)
    }
}

/// Drives transports, the pool object and the response for one attempt.
#[derive(Debug)]
pub struct FetchOrchestrator {
    locks: Arc<LockRegistry>,
    transports: TransportRegistry,
    freshness: FreshnessTracker,
}

impl FetchOrchestrator {
    pub fn new(
        locks: Arc<LockRegistry>,
        transports: TransportRegistry,
        freshness_window: Duration,
    ) -> Self {
        Self {
            locks,
            transports,
            freshness: FreshnessTracker::new(freshness_window),
        }
    }

    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// Serve `object`, refreshing it from `target` when needed.
    ///
    /// # Errors
    ///
    /// - `ResourceUnavailable` when the mirror does not have the resource
    /// - `Initialization` when no transport handles the URL scheme
    /// - I/O class errors for transfer or storage failures; the sink may
    ///   already be committed in that case
    pub fn send_and_save(
        &self,
        request: &RequestedData,
        object: &PoolObject,
        target: &Url,
        sink: &mut dyn ResponseSink,
    ) -> ProxyResult<ServeOutcome> {
        let key = object.path().to_string_lossy().into_owned();
        let lease = self.locks.acquire(&key);
        debug!(resource = %key, "Acquired resource lease");

        let read = lease.read();
        let Some(local) = object.last_modified() else {
            drop(read);
            let _write = lease.write();

            // another writer may have created it while we waited
            if object.last_modified().is_some() {
                debug!(resource = %key, "Created by a concurrent request");
                serve_local(object, request, sink)?;
                return Ok(ServeOutcome::Cached);
            }

            let result = self
                .open(target, None, request)
                .and_then(|fetched| self.store(fetched, object, target, sink));
            if result.is_err() {
                if let Err(e) = object.remove() {
                    warn!(resource = %key, error = %e, "Failed to remove partial object");
                }
            } else {
                self.freshness.mark_checked(&key);
            }
            return result.map(|()| ServeOutcome::Fetched);
        };

        if object.is_immutable() || !self.freshness.check_due(&key) {
            debug!(resource = %key, immutable = object.is_immutable(), "Serving cached copy");
            serve_local(object, request, sink)?;
            return Ok(ServeOutcome::Cached);
        }

        let fetched = self.open(target, Some(local), request)?;
        if !fetched.is_modified() {
            close(fetched, target);
            debug!(resource = %key, "Upstream not modified");
            serve_local(object, request, sink)?;
            return Ok(ServeOutcome::Cached);
        }

        if let Some(remote) = fetched.last_modified() {
            if remote < local {
                warn!(resource = %key, url = %target, "Upstream copy is older than the cached one");
            }
        }

        drop(read);
        let _write = lease.write();

        if object.last_modified() != Some(local) {
            close(fetched, target);
            debug!(resource = %key, "Refreshed by a concurrent request");
            serve_local(object, request, sink)?;
            return Ok(ServeOutcome::Cached);
        }

        let result = self.store(fetched, object, target, sink);
        if result.is_err() {
            if let Err(e) = object.discard_staging() {
                warn!(resource = %key, error = %e, "Failed to remove staging file");
            }
        }
        result.map(|()| ServeOutcome::Fetched)
    }

    fn open(
        &self,
        target: &Url,
        local: Option<SystemTime>,
        request: &RequestedData,
    ) -> ProxyResult<Box<dyn FetchedResource>> {
        let fetcher = self.transports.resolve(target)?;
        fetcher.fetch(target, local, request.user_agent())
    }

    /// Tee the fetched body to staging and the client, then commit.
    fn store(
        &self,
        mut fetched: Box<dyn FetchedResource>,
        object: &PoolObject,
        target: &Url,
        sink: &mut dyn ResponseSink,
    ) -> ProxyResult<()> {
        let result = copy_and_commit(fetched.as_mut(), object, target, sink);
        close(fetched, target);
        result
    }
}

fn copy_and_commit(
    fetched: &mut dyn FetchedResource,
    object: &PoolObject,
    target: &Url,
    sink: &mut dyn ResponseSink,
) -> ProxyResult<()> {
    let stamp = fetched.last_modified().unwrap_or_else(SystemTime::now);
    let declared = fetched.content_length();

    let head = sink.head_mut();
    head.status = StatusCode::OK;
    head.content_type = Some(
        fetched
            .content_type()
            .unwrap_or_else(|| object.content_type())
            .to_string(),
    );
    head.content_length = declared;
    head.last_modified = Some(stamp);

    if object.is_directory() {
        let copied = tee(fetched.body(), &mut io::sink(), sink, target)?;
        check_length(declared, copied, target)?;
        sink.flush()?;
        debug!(resource = %object.path().display(), url = %target, "Passed through without caching");
        return Ok(());
    }

    let mut staging = BufWriter::new(object.create_staging()?);
    let copied = tee(fetched.body(), &mut staging, sink, target)?;
    staging.flush()?;
    drop(staging.into_inner().map_err(|e| e.into_error())?);

    object.set_staging_modified(stamp)?;
    check_length(declared, copied, target)?;
    object.commit()?;
    sink.flush()?;

    info!(resource = %object.path().display(), url = %target, bytes = copied, "Fetched and stored");
    Ok(())
}

/// A declared length must match the bytes actually received.
fn check_length(declared: Option<u64>, copied: u64, target: &Url) -> ProxyResult<()> {
    match declared {
        Some(expected) if expected != copied => Err(ProxyError::IncompleteTransfer {
            url: target.to_string(),
            expected,
            received: copied,
        }),
        _ => Ok(()),
    }
}

/// Copy `source` into both writers chunk by chunk; returns bytes copied.
fn tee(
    source: &mut dyn Read,
    file: &mut dyn Write,
    sink: &mut dyn ResponseSink,
    target: &Url,
) -> ProxyResult<u64> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let read = match source.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProxyError::transfer(target.as_str(), e)),
        };

        file.write_all(&buffer[..read])?;
        sink.write_all(&buffer[..read])?;
        copied += read as u64;
    }

    Ok(copied)
}

/// Answer from the cached file: 304 when the client is current, else 200.
fn serve_local(
    object: &PoolObject,
    request: &RequestedData,
    sink: &mut dyn ResponseSink,
) -> ProxyResult<()> {
    let mut file = object.open()?;
    let metadata = file.metadata()?;
    let last_modified = metadata.modified()?;

    let head = sink.head_mut();
    head.content_type = Some(object.content_type().to_string());
    head.last_modified = Some(last_modified);

    let current = request
        .if_modified_since()
        .is_some_and(|since| truncate_to_seconds(since) >= truncate_to_seconds(last_modified));

    if current {
        head.status = StatusCode::NOT_MODIFIED;
        head.content_length = None;
    } else {
        head.status = StatusCode::OK;
        head.content_length = Some(metadata.len());
        io::copy(&mut file, sink)?;
    }

    sink.flush()?;
    Ok(())
}

fn close(fetched: Box<dyn FetchedResource>, target: &Url) {
    if let Err(e) = fetched.close() {
        warn!(url = %target, error = %e, "Failed to close upstream resource");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::config::ProxyConfig;
    use crate::package::BackendType;
    use crate::pool::PackagePool;
    use crate::response::BufferedResponse;
    use crate::transport::mock::{Script, ScriptedFetcher, Upstream};
    use std::fs;
    use std::thread;
    use std::time::UNIX_EPOCH;
    use tempfile::TempDir;

    const MIRROR: &str = "http://mirror.test/debian";

    struct Fixture {
        _temp: TempDir,
        backend: Backend,
        pool: PackagePool,
        fetcher: Arc<ScriptedFetcher>,
        orchestrator: FetchOrchestrator,
    }

    fn fixture(fetcher: ScriptedFetcher, window: Duration) -> Fixture {
        let temp = TempDir::new().unwrap();
        let backend = Backend::new("debian", BackendType::Deb, temp.path().join("debian"))
            .with_url(MIRROR);
        let pool = PackagePool::new(&ProxyConfig::new(temp.path())).unwrap();
        let fetcher = Arc::new(fetcher);
        let transports = TransportRegistry::new().with_fetcher("http", fetcher.clone());
        let orchestrator =
            FetchOrchestrator::new(Arc::new(LockRegistry::new()), transports, window);
        Fixture {
            _temp: temp,
            backend,
            pool,
            fetcher,
            orchestrator,
        }
    }

    fn stamp(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn url(resource: &str) -> Url {
        Url::parse(&format!("{}{}", MIRROR, resource)).unwrap()
    }

    impl Fixture {
        fn serve(&self, resource: &str) -> (ProxyResult<ServeOutcome>, BufferedResponse) {
            self.serve_request(RequestedData::parse(&format!("/debian{}", resource)).unwrap())
        }

        fn serve_request(
            &self,
            request: RequestedData,
        ) -> (ProxyResult<ServeOutcome>, BufferedResponse) {
            let object = self.pool.get_object(&self.backend, request.target()).unwrap();
            let mut response = BufferedResponse::new();
            let result = self.orchestrator.send_and_save(
                &request,
                &object,
                &url(request.target()),
                &mut response,
            );
            (result, response)
        }

        fn path(&self, resource: &str) -> std::path::PathBuf {
            self.backend.directory().join(resource.trim_start_matches('/'))
        }
    }

    #[test]
    fn test_cold_fetch_stores_and_streams() {
        let resource = "/pool/a_1.0_all.deb";
        let f = fixture(
            ScriptedFetcher::new().script(
                url(resource).as_str(),
                Script::Serve(Upstream::new(b"package bytes", stamp(1_600_000_000))),
            ),
            Duration::from_secs(60),
        );

        let (result, response) = f.serve(resource);
        assert_eq!(result.unwrap(), ServeOutcome::Fetched);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), b"package bytes");
        assert_eq!(response.head().content_length, Some(13));
        assert_eq!(response.head().last_modified, Some(stamp(1_600_000_000)));

        let path = f.path(resource);
        assert_eq!(fs::read(&path).unwrap(), b"package bytes");
        assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), stamp(1_600_000_000));
        assert!(!path.with_file_name("a_1.0_all.deb.tmp").exists());
        assert!(f.orchestrator.locks().is_empty());
    }

    #[test]
    fn test_immutable_package_never_rechecked() {
        let resource = "/pool/a_1.0_all.deb";
        let f = fixture(
            ScriptedFetcher::new().script(
                url(resource).as_str(),
                Script::Serve(Upstream::new(b"v1", stamp(1_000))),
            ),
            Duration::ZERO,
        );

        assert_eq!(f.serve(resource).0.unwrap(), ServeOutcome::Fetched);
        let (result, response) = f.serve(resource);
        assert_eq!(result.unwrap(), ServeOutcome::Cached);
        assert_eq!(response.body(), b"v1");
        assert_eq!(f.fetcher.fetches(), 1);
    }

    #[test]
    fn test_mutable_resource_throttled_within_window() {
        let resource = "/dists/stable/Release";
        let f = fixture(
            ScriptedFetcher::new().script(
                url(resource).as_str(),
                Script::Serve(Upstream::new(b"index", stamp(1_000))),
            ),
            Duration::from_secs(60),
        );

        f.serve(resource).0.unwrap();
        assert_eq!(f.serve(resource).0.unwrap(), ServeOutcome::Cached);
        assert_eq!(f.fetcher.fetches(), 1);
    }

    #[test]
    fn test_stale_not_modified_serves_cache() {
        let resource = "/dists/stable/Release";
        let f = fixture(
            ScriptedFetcher::new().script(
                url(resource).as_str(),
                Script::Serve(Upstream::new(b"index", stamp(1_000))),
            ),
            Duration::ZERO,
        );

        f.serve(resource).0.unwrap();
        let (result, first) = f.serve(resource);
        assert_eq!(result.unwrap(), ServeOutcome::Cached);
        let (_, second) = f.serve(resource);

        assert_eq!(f.fetcher.fetches(), 3);
        assert_eq!(f.fetcher.bodies(), 1);
        assert_eq!(first.head(), second.head());
        assert_eq!(first.body(), second.body());
        assert_eq!(first.body(), b"index");
    }

    #[test]
    fn test_stale_modified_replaces_object() {
        let resource = "/dists/stable/Release";
        let fetcher = ScriptedFetcher::new().script(
            url(resource).as_str(),
            Script::Serve(Upstream::new(b"old index", stamp(1_000))),
        );
        let f = fixture(fetcher, Duration::ZERO);
        f.serve(resource).0.unwrap();

        f.fetcher.set(
            url(resource).as_str(),
            Script::Serve(Upstream::new(b"new index", stamp(2_000))),
        );
        let (result, response) = f.serve(resource);

        assert_eq!(result.unwrap(), ServeOutcome::Fetched);
        assert_eq!(response.body(), b"new index");
        assert_eq!(fs::read(f.path(resource)).unwrap(), b"new index");
        assert_eq!(
            fs::metadata(f.path(resource)).unwrap().modified().unwrap(),
            stamp(2_000)
        );
    }

    #[test]
    fn test_conditional_client_gets_not_modified() {
        let resource = "/pool/a_1.0_all.deb";
        let f = fixture(
            ScriptedFetcher::new().script(
                url(resource).as_str(),
                Script::Serve(Upstream::new(b"bytes", stamp(1_000))),
            ),
            Duration::from_secs(60),
        );
        f.serve(resource).0.unwrap();

        for since in [stamp(1_000), stamp(5_000)] {
            let request = RequestedData::parse(&format!("/debian{}", resource))
                .unwrap()
                .with_if_modified_since(since);
            let (result, response) = f.serve_request(request);
            assert_eq!(result.unwrap(), ServeOutcome::Cached);
            assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
            assert!(response.body().is_empty());
        }

        let request = RequestedData::parse(&format!("/debian{}", resource))
            .unwrap()
            .with_if_modified_since(stamp(999));
        let (_, response) = f.serve_request(request);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), b"bytes");
    }

    #[test]
    fn test_partial_transfer_leaves_nothing_behind() {
        let resource = "/pool/a_1.0_all.deb";
        let f = fixture(
            ScriptedFetcher::new().script(
                url(resource).as_str(),
                Script::Serve(Upstream::new(&[7u8; 80], stamp(1_000)).with_declared_length(100)),
            ),
            Duration::from_secs(60),
        );

        let (result, _) = f.serve(resource);
        let err = result.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::IncompleteTransfer {
                expected: 100,
                received: 80,
                ..
            }
        ));
        assert!(err.is_io());
        assert!(!f.path(resource).exists());
        assert!(!f.path("/pool/a_1.0_all.deb.tmp").exists());
        assert!(f.orchestrator.locks().is_empty());
    }

    #[test]
    fn test_failed_refresh_keeps_existing_copy() {
        let resource = "/dists/stable/Release";
        let f = fixture(
            ScriptedFetcher::new().script(
                url(resource).as_str(),
                Script::Serve(Upstream::new(b"good", stamp(1_000))),
            ),
            Duration::ZERO,
        );
        f.serve(resource).0.unwrap();

        f.fetcher.set(
            url(resource).as_str(),
            Script::Serve(Upstream::new(b"trunc", stamp(2_000)).with_declared_length(50)),
        );
        assert!(f.serve(resource).0.is_err());
        assert_eq!(fs::read(f.path(resource)).unwrap(), b"good");
        assert!(!f.path("/dists/stable/Release.tmp").exists());
    }

    #[test]
    fn test_unavailable_leaves_nothing_behind() {
        let resource = "/pool/missing_1.0_all.deb";
        let f = fixture(ScriptedFetcher::new(), Duration::from_secs(60));

        let (result, response) = f.serve(resource);
        assert!(matches!(result, Err(ProxyError::ResourceUnavailable(_))));
        assert!(!response.is_committed());
        assert!(!f.path(resource).exists());
    }

    #[test]
    fn test_missing_remote_stamp_uses_now() {
        let resource = "/dists/stable/InRelease";
        let f = fixture(
            ScriptedFetcher::new().script(
                url(resource).as_str(),
                Script::Serve(Upstream::new(b"signed", stamp(0)).without_last_modified()),
            ),
            Duration::from_secs(60),
        );

        let before = truncate_to_seconds(SystemTime::now());
        f.serve(resource).0.unwrap();
        let stored = fs::metadata(f.path(resource)).unwrap().modified().unwrap();
        assert!(stored >= before);
    }

    #[test]
    fn test_unknown_scheme_is_initialization_error() {
        let f = fixture(ScriptedFetcher::new(), Duration::from_secs(60));
        let request = RequestedData::parse("/debian/pool/a_1.0_all.deb").unwrap();
        let object = f.pool.get_object(&f.backend, request.target()).unwrap();
        let target = Url::parse("gopher://mirror.test/debian/pool/a_1.0_all.deb").unwrap();

        let mut response = BufferedResponse::new();
        let err = f
            .orchestrator
            .send_and_save(&request, &object, &target, &mut response)
            .unwrap_err();
        assert!(matches!(err, ProxyError::Initialization(_)));
    }

    #[test]
    fn test_cached_listing_makes_room_for_packages_below_it() {
        let listing = "/pool";
        let package = "/pool/a_1.0_all.deb";
        let f = fixture(
            ScriptedFetcher::new()
                .script(
                    url(listing).as_str(),
                    Script::Serve(Upstream::new(b"<html>index of pool</html>", stamp(1_000))),
                )
                .script(
                    url(package).as_str(),
                    Script::Serve(Upstream::new(b"package", stamp(1_000))),
                ),
            Duration::from_secs(60),
        );

        assert_eq!(f.serve(listing).0.unwrap(), ServeOutcome::Fetched);
        assert!(f.path(listing).is_file());

        let (result, response) = f.serve(package);
        assert_eq!(result.unwrap(), ServeOutcome::Fetched);
        assert_eq!(response.body(), b"package");
        assert!(f.path(listing).is_dir());
        assert_eq!(fs::read(f.path(package)).unwrap(), b"package");
    }

    #[test]
    fn test_listing_of_cached_directory_is_passed_through() {
        let listing = "/pool";
        let f = fixture(
            ScriptedFetcher::new().script(
                url(listing).as_str(),
                Script::Serve(Upstream::new(b"<html>index of pool</html>", stamp(1_000))),
            ),
            Duration::from_secs(60),
        );
        fs::create_dir_all(f.path("/pool/main")).unwrap();

        for _ in 0..2 {
            let (result, response) = f.serve(listing);
            assert_eq!(result.unwrap(), ServeOutcome::Fetched);
            assert_eq!(response.body(), b"<html>index of pool</html>");
        }
        assert!(f.path("/pool/main").is_dir());
        assert!(!f.path("/pool.tmp").exists());
        assert_eq!(f.fetcher.fetches(), 2);
    }

    #[test]
    fn test_concurrent_stale_refresh_downloads_once() {
        let resource = "/dists/stable/Release";
        let f = fixture(
            ScriptedFetcher::new()
                .with_delay(Duration::from_millis(200))
                .script(
                    url(resource).as_str(),
                    Script::Serve(Upstream::new(b"old index", stamp(1_000))),
                ),
            Duration::ZERO,
        );
        assert_eq!(f.serve(resource).0.unwrap(), ServeOutcome::Fetched);
        f.fetcher.set(
            url(resource).as_str(),
            Script::Serve(Upstream::new(b"new index", stamp(2_000))),
        );

        let results: Vec<(ServeOutcome, Vec<u8>)> = thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(|| {
                        let (result, response) = f.serve(resource);
                        (result.unwrap(), response.body())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        // seed download plus exactly one refresh
        assert_eq!(f.fetcher.downloads(), 2);
        assert_eq!(results[0].1, results[1].1);
        assert_eq!(results[0].1, b"new index");
        assert_eq!(
            results.iter().filter(|(outcome, _)| outcome.from_cache()).count(),
            1
        );
        assert_eq!(fs::read(f.path(resource)).unwrap(), b"new index");
        assert!(f.orchestrator.locks().is_empty());
    }

    #[test]
    fn test_concurrent_cold_requests_fetch_once() {
        let resource = "/pool/big_2.0_amd64.deb";
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let f = fixture(
            ScriptedFetcher::new()
                .with_delay(Duration::from_millis(50))
                .script(
                    url(resource).as_str(),
                    Script::Serve(Upstream::new(&payload, stamp(1_000))),
                ),
            Duration::from_secs(60),
        );

        let bodies: Vec<Vec<u8>> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        let (result, response) = f.serve(resource);
                        result.unwrap();
                        response.body()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(f.fetcher.fetches(), 1);
        assert!(bodies.iter().all(|body| *body == payload));
        assert!(f.orchestrator.locks().is_empty());
    }
}
