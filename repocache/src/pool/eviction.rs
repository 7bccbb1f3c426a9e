//! Background eviction daemon.
//!
//! One tokio task per pool: after `start_delay` it sweeps every `interval`
//! on the blocking thread pool. Cancelling the token makes the task run a
//! last sweep so that nothing scheduled before shutdown is lost.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{EvictionReport, PackagePool};
use crate::config::EvictionSettings;

/// Handle to the running eviction task.
#[derive(Debug)]
pub struct EvictionDaemon {
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl EvictionDaemon {
    /// Spawn the daemon on the current tokio runtime.
    ///
    /// The daemon stops when `shutdown` (or a parent token) is cancelled.
    pub fn spawn(
        pool: Arc<PackagePool>,
        settings: &EvictionSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let handle = tokio::spawn(run(
            pool,
            settings.start_delay,
            settings.interval,
            shutdown.clone(),
        ));
        Self { handle, shutdown }
    }

    /// Stop the daemon and wait for its final sweep.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Eviction daemon terminated abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn run(
    pool: Arc<PackagePool>,
    start_delay: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    info!(
        start_delay_secs = start_delay.as_secs(),
        interval_secs = interval.as_secs(),
        "Eviction daemon started"
    );

    let started = tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(start_delay) => true,
    };

    if started {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    sweep(&pool).await;
                }
            }
        }
    }

    let report = sweep(&pool).await;
    info!(deleted = report.deleted, "Eviction daemon stopped after final sweep");
}

async fn sweep(pool: &Arc<PackagePool>) -> EvictionReport {
    let pool = Arc::clone(pool);
    match tokio::task::spawn_blocking(move || pool.run_eviction_sweep()).await {
        Ok(report) => {
            debug!(?report, "Eviction sweep completed");
            report
        }
        Err(e) => {
            warn!(error = %e, "Eviction sweep panicked");
            EvictionReport::default()
        }
    }
}
