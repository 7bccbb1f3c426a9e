//! Application wiring and lifecycle.
//!
//! [`ProxyApp`] builds every component from a [`ProxyConfig`] in dependency
//! order and owns the background eviction daemon:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        ProxyApp                          │
//! │                                                          │
//! │  LockRegistry ─┐                                         │
//! │  Transports ───┼──► FetchOrchestrator ─┐                 │
//! │                │                       ├──► RepoFinder   │
//! │  BackendResolver ──────────────────────┤                 │
//! │  PackagePool ──────────────────────────┘                 │
//! │       └── EvictionDaemon (tokio task, cancellable)       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! let runtime = tokio::runtime::Runtime::new()?;
//! let mut app = ProxyApp::start(config, runtime.handle())?;
//!
//! let finder = app.finder();
//! // ... serve requests ...
//!
//! runtime.block_on(app.shutdown());
//! ```
//!
//! [`ProxyConfig`]: crate::config::ProxyConfig

mod bootstrap;

pub use bootstrap::ProxyApp;
