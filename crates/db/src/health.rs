use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::repositories::RepositoryError;

/// Tracks whether writes to the durable store are currently succeeding.
///
/// While degraded, conversations keep working from memory only and a crash
/// can lose whatever has not been synced yet.
#[derive(Debug, Default)]
pub struct StoreHealth {
    degraded: AtomicBool,
    consecutive_failures: AtomicU32,
    details: Mutex<HealthDetails>,
}

#[derive(Clone, Debug, Default)]
struct HealthDetails {
    last_error: Option<String>,
    last_success_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StoreHealthSnapshot {
    pub degraded: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl StoreHealth {
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        {
            let mut details = self.lock_details();
            details.last_success_at = Some(Utc::now());
        }

        if self.degraded.swap(false, Ordering::SeqCst) {
            info!(event_name = "store.recovered", "conversation store reachable again");
        }
    }

    pub fn record_failure(&self, error: &RepositoryError) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        {
            let mut details = self.lock_details();
            details.last_error = Some(error.to_string());
        }

        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(
                event_name = "store.degraded",
                consecutive_failures = failures,
                error = %error,
                "conversation store unreachable; continuing in memory-only mode"
            );
        }
    }

    pub fn snapshot(&self) -> StoreHealthSnapshot {
        let details = self.lock_details().clone();
        StoreHealthSnapshot {
            degraded: self.is_degraded(),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            last_error: details.last_error,
            last_success_at: details.last_success_at,
        }
    }

    fn lock_details(&self) -> std::sync::MutexGuard<'_, HealthDetails> {
        match self.details.lock() {
            Ok(details) => details,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
