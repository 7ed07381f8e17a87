use std::sync::Arc;

use eventcrew_agent::{AgentRuntime, DelegationSettings, HttpLlmClient};
use eventcrew_core::config::{AppConfig, ConfigError};
use eventcrew_db::{
    connect_with_config, migrations, CacheSettings, DbPool, SqlConversationRepository,
    TenantStateCache,
};
use thiserror::Error;
use tracing::info;

use crate::audit::TracingAuditSink;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub cache: Arc<TenantStateCache>,
    pub runtime: Arc<AgentRuntime>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("oracle client setup failed: {0}")]
    Oracle(#[source] anyhow::Error),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let oracle = HttpLlmClient::from_config(&config.llm).map_err(BootstrapError::Oracle)?;
    info!(
        event_name = "system.bootstrap.oracle_configured",
        correlation_id = "bootstrap",
        provider = ?oracle.provider(),
        model = %oracle.model(),
        "oracle client configured"
    );

    let cache = Arc::new(TenantStateCache::new(
        Arc::new(SqlConversationRepository::new(db_pool.clone())),
        CacheSettings::from(&config.cache),
    ));
    let runtime = Arc::new(AgentRuntime::new(
        cache.clone(),
        Arc::new(oracle),
        Arc::new(TracingAuditSink),
        DelegationSettings::from(&config.delegation),
    ));

    Ok(Application { config, db_pool, cache, runtime })
}
