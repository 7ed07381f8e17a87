//! Periodic background sync between the state cache and the durable store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use eventcrew_core::config::CacheConfig;

use crate::cache::{FlushReport, TenantStateCache};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncSettings {
    pub flush_interval: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl From<&CacheConfig> for SyncSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            flush_interval: Duration::from_secs(config.flush_interval_secs),
            retry_base: Duration::from_millis(config.retry_base_ms),
            retry_max: Duration::from_millis(config.retry_max_ms),
        }
    }
}

impl SyncSettings {
    /// Delay before the next round. A clean round waits the regular interval;
    /// after `failed_rounds` consecutive failures the wait doubles from
    /// `retry_base`, capped at `retry_max`.
    pub fn next_delay(&self, failed_rounds: u32) -> Duration {
        if failed_rounds == 0 {
            return self.flush_interval;
        }
        let exponent = failed_rounds.saturating_sub(1).min(16);
        let backoff = self.retry_base.saturating_mul(1_u32 << exponent);
        backoff.min(self.retry_max)
    }
}

/// Runs flush and idle eviction until `shutdown` flips to `true`, then performs
/// one final flush and returns its report.
pub fn spawn_sync_loop(
    cache: Arc<TenantStateCache>,
    settings: SyncSettings,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<FlushReport> {
    tokio::spawn(async move {
        info!(
            event_name = "sync.started",
            flush_interval_secs = settings.flush_interval.as_secs(),
            "state sync loop started"
        );

        let mut failed_rounds: u32 = 0;
        loop {
            let delay = settings.next_delay(failed_rounds);
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {
                    let report = cache.flush_dirty().await;
                    if report.is_clean() {
                        failed_rounds = 0;
                    } else {
                        failed_rounds = failed_rounds.saturating_add(1);
                        warn!(
                            event_name = "sync.round_failed",
                            failed = report.failed,
                            failed_rounds,
                            retry_in_ms = settings.next_delay(failed_rounds).as_millis() as u64,
                            "flush round failed; backing off"
                        );
                    }
                    cache.evict_idle().await;
                }
            }
        }

        let report = cache.flush_dirty().await;
        if report.busy > 0 {
            warn!(
                event_name = "sync.stopped",
                flushed = report.flushed,
                failed = report.failed,
                busy = report.busy,
                "state sync loop stopped; conversations still checked out were not flushed"
            );
        } else {
            info!(
                event_name = "sync.stopped",
                flushed = report.flushed,
                failed = report.failed,
                busy = report.busy,
                "state sync loop stopped after final flush"
            );
        }
        report
    })
}
