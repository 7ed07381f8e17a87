use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::RwLock;

use eventcrew_core::domain::conversation::{Conversation, ConversationId};
use eventcrew_core::domain::tenant::TenantId;

use super::{ConversationMutation, ConversationRepository, RepositoryError};

type RecordKey = (String, String);

/// Process-local store used by tests and single-node demos. It can be switched
/// offline to exercise the cache's degraded mode.
pub struct InMemoryConversationRepository {
    records: RwLock<HashMap<RecordKey, Conversation>>,
    available: AtomicBool,
    upserts: AtomicUsize,
}

impl Default for InMemoryConversationRepository {
    fn default() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            upserts: AtomicUsize::new(0),
        }
    }
}

impl InMemoryConversationRepository {
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of successful upserts, including those made by read-modify-write.
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }

    fn ensure_available(&self) -> Result<(), RepositoryError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RepositoryError::Unavailable("in-memory store is offline".to_string()))
        }
    }
}

fn key(tenant_id: &TenantId, id: &ConversationId) -> RecordKey {
    (tenant_id.as_str().to_string(), id.as_str().to_string())
}

#[async_trait::async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn load_all_for_tenant(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<Conversation>, RepositoryError> {
        self.ensure_available()?;
        let records = self.records.read().await;
        let mut conversations: Vec<Conversation> = records
            .iter()
            .filter(|((tenant, _), _)| tenant == tenant_id.as_str())
            .map(|(_, conversation)| conversation.clone())
            .collect();
        conversations.sort_by(|left, right| {
            left.created_at.cmp(&right.created_at).then_with(|| left.id.cmp(&right.id))
        });
        Ok(conversations)
    }

    async fn load_one(
        &self,
        tenant_id: &TenantId,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        self.ensure_available()?;
        let records = self.records.read().await;
        Ok(records.get(&key(tenant_id, id)).cloned())
    }

    async fn upsert(&self, conversation: &Conversation) -> Result<(), RepositoryError> {
        self.ensure_available()?;
        let mut records = self.records.write().await;
        records.insert(key(conversation.tenant_id(), &conversation.id), conversation.clone());
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_modify_write(
        &self,
        tenant_id: &TenantId,
        id: &ConversationId,
        mutation: ConversationMutation,
    ) -> Result<Option<Conversation>, RepositoryError> {
        self.ensure_available()?;
        let mut records = self.records.write().await;
        let Some(stored) = records.get_mut(&key(tenant_id, id)) else {
            return Ok(None);
        };

        let mut working = stored.clone();
        mutation(&mut working)?;
        *stored = working.clone();
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(Some(working))
    }
}
