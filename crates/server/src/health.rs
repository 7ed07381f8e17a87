use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use eventcrew_db::{ping, DbPool, TenantStateCache};
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    pub db_pool: DbPool,
    pub cache: Arc<TenantStateCache>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub state_sync: HealthCheck,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let state_sync = state_sync_check(&state.cache);
    let ready = database.status == "ready" && state_sync.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "eventcrew-server runtime initialized".to_string(),
        },
        database,
        state_sync,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match ping(pool).await {
        Ok(()) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

fn state_sync_check(cache: &TenantStateCache) -> HealthCheck {
    let snapshot = cache.health();
    if !snapshot.degraded {
        return HealthCheck { status: "ready", detail: "conversation writes are durable".to_string() };
    }

    HealthCheck {
        status: "degraded",
        detail: format!(
            "memory-only mode after {} failed writes: {}",
            snapshot.consecutive_failures,
            snapshot.last_error.as_deref().unwrap_or("unknown error")
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{extract::State, http::StatusCode, Json};
    use eventcrew_core::domain::tenant::TenantId;
    use eventcrew_db::{
        connect_with_settings, CacheSettings, InMemoryConversationRepository, TenantStateCache,
    };

    use crate::health::{health, HealthState};

    fn cache_over(store: Arc<InMemoryConversationRepository>) -> Arc<TenantStateCache> {
        Arc::new(TenantStateCache::new(store, CacheSettings::default()))
    }

    #[tokio::test]
    async fn health_returns_ready_when_database_and_sync_are_healthy() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        let cache = cache_over(Arc::new(InMemoryConversationRepository::default()));

        let (status, Json(payload)) =
            health(State(HealthState { db_pool: pool.clone(), cache })).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.status, "ready");
        assert_eq!(payload.state_sync.status, "ready");

        pool.close().await;
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_database_is_unavailable() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        pool.close().await;
        let cache = cache_over(Arc::new(InMemoryConversationRepository::default()));

        let (status, Json(payload)) = health(State(HealthState { db_pool: pool, cache })).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.database.status, "degraded");
        assert_eq!(payload.service.status, "ready");
    }

    #[tokio::test]
    async fn health_reports_memory_only_mode_while_store_writes_fail() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        let store = Arc::new(InMemoryConversationRepository::default());
        store.set_available(false);
        let cache = cache_over(store.clone());

        cache.create(&TenantId::new("acme"), None).await.commit().await;

        let (status, Json(payload)) =
            health(State(HealthState { db_pool: pool.clone(), cache: cache.clone() })).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.state_sync.status, "degraded");
        assert!(payload.state_sync.detail.contains("memory-only"));
        assert_eq!(payload.database.status, "ready");

        store.set_available(true);
        cache.flush_dirty().await;
        let (status, _) = health(State(HealthState { db_pool: pool.clone(), cache })).await;
        assert_eq!(status, StatusCode::OK);

        pool.close().await;
    }
}
