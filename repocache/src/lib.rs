//! RepoCache - caching reverse proxy for package repositories
//!
//! This library provides the fetch-and-cache engine behind the `repocache`
//! binary: clients request a repository path, the proxy serves a cached copy
//! when it is fresh enough and otherwise fetches it from the first upstream
//! mirror that has it, writing the download to disk and to the client at the
//! same time. Superseded package versions are retired in the background.
//!
//! # Architecture
//!
//! ```text
//! RepoFinder ──► BackendResolver ──► PackagePool::get_object
//!     │
//!     └──► FetchOrchestrator::send_and_save
//!              ├── LockRegistry      (one writer per resource)
//!              ├── TransportRegistry (http / ftp fetchers)
//!              └── PoolObject        (staging file, atomic commit)
//!
//! EvictionDaemon ──► PackagePool::run_eviction_sweep ──► VersionComparator
//! ```

pub mod app;
pub mod backend;
pub mod config;
pub mod error;
pub mod finder;
pub mod lock;
pub mod orchestrator;
pub mod package;
pub mod pool;
pub mod request;
pub mod response;
pub mod transport;
pub mod util;

pub use error::{ProxyError, ProxyResult};

/// Version of the repocache library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identifier appended to the client's user agent on upstream requests.
pub fn user_agent() -> String {
    format!("repocache/{}", VERSION)
}
