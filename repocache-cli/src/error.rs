//! CLI error type.

use std::io;

use thiserror::Error;

/// Errors that end the `repocache` process.
#[derive(Debug, Error)]
pub enum CliError {
    /// Engine construction or configuration failed.
    #[error(transparent)]
    Proxy(#[from] repocache::ProxyError),

    #[error("failed to initialize logging: {0}")]
    Logging(String),

    #[error("failed to create tokio runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] io::Error),
}
