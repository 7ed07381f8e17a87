use async_trait::async_trait;
use thiserror::Error;

use eventcrew_core::domain::conversation::{Conversation, ConversationId};
use eventcrew_core::domain::tenant::TenantId;
use eventcrew_core::errors::DomainError;

pub mod conversation;
pub mod memory;

pub use conversation::SqlConversationRepository;
pub use memory::InMemoryConversationRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("mutation rejected: {0}")]
    Mutation(#[from] DomainError),
}

impl RepositoryError {
    /// Whether a later attempt could succeed without any change to the data.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Unavailable(_))
    }
}

pub type ConversationMutation =
    Box<dyn FnOnce(&mut Conversation) -> Result<(), DomainError> + Send>;

/// Durable conversation store keyed by `(tenant id, conversation id)`.
///
/// Every write replaces the whole record in a single statement, so readers
/// never observe a partially written conversation.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Loads every readable conversation for a tenant. Corrupt records are
    /// logged and skipped; a connectivity failure fails the whole call.
    async fn load_all_for_tenant(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<Conversation>, RepositoryError>;

    async fn load_one(
        &self,
        tenant_id: &TenantId,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError>;

    async fn upsert(&self, conversation: &Conversation) -> Result<(), RepositoryError>;

    /// Load, mutate, and write back one conversation as a single unit.
    /// Returns `None` when the record does not exist.
    async fn read_modify_write(
        &self,
        tenant_id: &TenantId,
        id: &ConversationId,
        mutation: ConversationMutation,
    ) -> Result<Option<Conversation>, RepositoryError>;
}
