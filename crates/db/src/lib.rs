pub mod cache;
pub mod connection;
pub mod health;
pub mod migrations;
pub mod repositories;
pub mod sync;

pub use cache::{
    CacheError, CacheSettings, ConversationLease, EvictionReport, FlushReport, MutationKind,
    TenantStateCache,
};
pub use connection::{connect, connect_with_config, connect_with_settings, ping, DbPool};
pub use health::{StoreHealth, StoreHealthSnapshot};
pub use repositories::{
    ConversationMutation, ConversationRepository, InMemoryConversationRepository,
    RepositoryError, SqlConversationRepository,
};
pub use sync::{spawn_sync_loop, SyncSettings};
