//! Tenant-scoped write-back cache of conversation state.
//!
//! Locking is two-level. The tenant registry and each tenant's conversation
//! map sit behind std locks that are only held for structural changes and
//! never across I/O. Each conversation has its own async mutex; holding it
//! (through a [`ConversationLease`]) is the only way to read or mutate the
//! conversation, which gives exactly one writer per `(tenant, conversation)`.
//!
//! Mutations mark the entry dirty. Critical mutations are written to the store
//! when the lease is committed; everything else waits for [`TenantStateCache::flush_dirty`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OnceCell, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use eventcrew_core::config::CacheConfig;
use eventcrew_core::domain::conversation::{Conversation, ConversationId, ExternalContext};
use eventcrew_core::domain::tenant::TenantId;
use eventcrew_core::errors::ApplicationError;

use crate::health::{StoreHealth, StoreHealthSnapshot};
use crate::repositories::{ConversationRepository, RepositoryError};

/// Critical mutations (conversation created, message appended, phase change)
/// are synced when the lease commits. Background ones wait for the periodic
/// flush.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationKind {
    Critical,
    Background,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheSettings {
    pub idle_eviction: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for CacheSettings {
    fn from(config: &CacheConfig) -> Self {
        Self { idle_eviction: Duration::from_secs(config.idle_eviction_secs) }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("conversation `{conversation_id}` was not found for tenant `{tenant_id}`")]
    NotFound { tenant_id: TenantId, conversation_id: ConversationId },
}

impl From<CacheError> for ApplicationError {
    fn from(error: CacheError) -> Self {
        match error {
            CacheError::NotFound { conversation_id, .. } => Self::NotFound { conversation_id },
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub flushed: usize,
    pub failed: usize,
    /// Entries skipped because a lease was holding them.
    pub busy: usize,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub evicted: usize,
    /// Idle entries kept because their final flush failed.
    pub retained: usize,
}

struct CachedConversation {
    conversation: Conversation,
    dirty: bool,
    last_synced_at: Option<DateTime<Utc>>,
    last_touched: Instant,
    evicted: bool,
}

impl CachedConversation {
    fn fresh(conversation: Conversation) -> Self {
        Self {
            conversation,
            dirty: true,
            last_synced_at: None,
            last_touched: Instant::now(),
            evicted: false,
        }
    }

    fn loaded(conversation: Conversation) -> Self {
        Self {
            conversation,
            dirty: false,
            last_synced_at: Some(Utc::now()),
            last_touched: Instant::now(),
            evicted: false,
        }
    }
}

type Slot = Arc<AsyncMutex<CachedConversation>>;

#[derive(Default)]
struct TenantState {
    conversations: Mutex<HashMap<ConversationId, Slot>>,
    warmed: OnceCell<()>,
}

impl TenantState {
    fn lock_map(&self) -> MutexGuard<'_, HashMap<ConversationId, Slot>> {
        match self.conversations.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn slot(&self, id: &ConversationId) -> Option<Slot> {
        self.lock_map().get(id).cloned()
    }

    fn slots(&self) -> Vec<(ConversationId, Slot)> {
        let mut slots: Vec<(ConversationId, Slot)> =
            self.lock_map().iter().map(|(id, slot)| (id.clone(), slot.clone())).collect();
        slots.sort_by(|left, right| left.0.cmp(&right.0));
        slots
    }

    /// Inserts `slot` unless another caller already cached this id, returning
    /// whichever slot ends up in the map.
    fn insert_if_absent(&self, id: ConversationId, slot: Slot) -> Slot {
        self.lock_map().entry(id).or_insert(slot).clone()
    }

    fn absorb(&self, tenant_id: &TenantId, conversations: Vec<Conversation>) -> usize {
        let mut map = self.lock_map();
        let mut absorbed = 0;
        for conversation in conversations {
            if conversation.tenant_id() != tenant_id {
                continue;
            }
            map.entry(conversation.id.clone()).or_insert_with(|| {
                absorbed += 1;
                Arc::new(AsyncMutex::new(CachedConversation::loaded(conversation)))
            });
        }
        absorbed
    }

    fn remove(&self, id: &ConversationId) {
        self.lock_map().remove(id);
    }

    fn len(&self) -> usize {
        self.lock_map().len()
    }
}

/// Explicitly owned registry of per-tenant conversation state. Construct one per
/// process (or per test) and share it behind an `Arc`.
pub struct TenantStateCache {
    store: Arc<dyn ConversationRepository>,
    health: Arc<StoreHealth>,
    settings: CacheSettings,
    tenants: RwLock<HashMap<TenantId, Arc<TenantState>>>,
}

impl TenantStateCache {
    pub fn new(store: Arc<dyn ConversationRepository>, settings: CacheSettings) -> Self {
        Self {
            store,
            health: Arc::new(StoreHealth::default()),
            settings,
            tenants: RwLock::new(HashMap::new()),
        }
    }

    pub fn health(&self) -> StoreHealthSnapshot {
        self.health.snapshot()
    }

    pub fn is_degraded(&self) -> bool {
        self.health.is_degraded()
    }

    /// Number of conversations currently resident for a tenant.
    pub fn resident_count(&self, tenant_id: &TenantId) -> usize {
        self.existing_tenant(tenant_id).map(|state| state.len()).unwrap_or(0)
    }

    /// Starts a new conversation in `InformationCollection`. Creation is a
    /// critical mutation, so committing the lease writes it through.
    pub async fn create(
        &self,
        tenant_id: &TenantId,
        external_context: Option<ExternalContext>,
    ) -> ConversationLease {
        let state = self.tenant(tenant_id).await;

        let mut conversation =
            Conversation::new(ConversationId::generate(), tenant_id.clone(), Utc::now());
        conversation.external_context = external_context;
        let id = conversation.id.clone();

        let slot: Slot = Arc::new(AsyncMutex::new(CachedConversation::fresh(conversation)));
        let guard = slot.clone().lock_owned().await;
        state.insert_if_absent(id.clone(), slot);

        debug!(
            event_name = "cache.conversation_created",
            tenant_id = %tenant_id,
            conversation_id = %id,
            "conversation created"
        );

        let mut lease = self.lease(guard);
        lease.sync_pending = true;
        lease
    }

    /// Exclusive access to one conversation, loading it from the store on a
    /// cache miss. Conversations are only ever found under their own tenant.
    pub async fn checkout(
        &self,
        tenant_id: &TenantId,
        id: &ConversationId,
    ) -> Result<ConversationLease, CacheError> {
        loop {
            let state = self.tenant(tenant_id).await;
            let slot = match state.slot(id) {
                Some(slot) => slot,
                None => {
                    let loaded = self.load_from_store(tenant_id, id).await?;
                    state.insert_if_absent(
                        id.clone(),
                        Arc::new(AsyncMutex::new(CachedConversation::loaded(loaded))),
                    )
                }
            };

            let mut guard = slot.lock_owned().await;
            if guard.evicted {
                continue;
            }
            guard.last_touched = Instant::now();
            return Ok(self.lease(guard));
        }
    }

    pub async fn get(
        &self,
        tenant_id: &TenantId,
        id: &ConversationId,
    ) -> Result<Conversation, CacheError> {
        let lease = self.checkout(tenant_id, id).await?;
        Ok(lease.conversation().clone())
    }

    /// Applies one mutation under the conversation's lock and commits it.
    pub async fn apply<T>(
        &self,
        tenant_id: &TenantId,
        id: &ConversationId,
        kind: MutationKind,
        mutation: impl FnOnce(&mut Conversation) -> T,
    ) -> Result<T, CacheError> {
        let mut lease = self.checkout(tenant_id, id).await?;
        let output = lease.mutate(kind, mutation);
        lease.commit().await;
        Ok(output)
    }

    /// Writes every dirty entry to the store, tenant by tenant. Entries whose
    /// write fails stay dirty for the next round.
    pub async fn flush_dirty(&self) -> FlushReport {
        let mut report = FlushReport::default();

        for (tenant_id, state) in self.tenant_snapshot() {
            for (id, slot) in state.slots() {
                let Ok(mut entry) = slot.try_lock() else {
                    report.busy += 1;
                    continue;
                };
                if entry.evicted || !entry.dirty {
                    continue;
                }

                match sync_entry(&mut entry, self.store.as_ref(), &self.health).await {
                    Ok(()) => report.flushed += 1,
                    Err(error) => {
                        report.failed += 1;
                        debug!(
                            event_name = "cache.flush_entry_failed",
                            tenant_id = %tenant_id,
                            conversation_id = %id,
                            error = %error,
                            "flush failed; entry stays dirty"
                        );
                    }
                }
            }
        }

        if report.flushed > 0 || report.failed > 0 {
            info!(
                event_name = "cache.flushed",
                flushed = report.flushed,
                failed = report.failed,
                busy = report.busy,
                "dirty conversations flushed"
            );
        }

        report
    }

    /// Drops conversations untouched for the configured idle period, flushing
    /// them first. An entry whose flush fails stays resident.
    pub async fn evict_idle(&self) -> EvictionReport {
        let mut report = EvictionReport::default();

        for (tenant_id, state) in self.tenant_snapshot() {
            for (id, slot) in state.slots() {
                let Ok(mut entry) = slot.try_lock() else {
                    continue;
                };
                if entry.evicted || entry.last_touched.elapsed() < self.settings.idle_eviction {
                    continue;
                }

                if entry.dirty
                    && sync_entry(&mut entry, self.store.as_ref(), &self.health).await.is_err()
                {
                    report.retained += 1;
                    continue;
                }

                entry.evicted = true;
                state.remove(&id);
                report.evicted += 1;
                debug!(
                    event_name = "cache.conversation_evicted",
                    tenant_id = %tenant_id,
                    conversation_id = %id,
                    last_synced_at = ?entry.last_synced_at,
                    "idle conversation evicted"
                );
            }
        }

        report
    }

    fn lease(&self, guard: OwnedMutexGuard<CachedConversation>) -> ConversationLease {
        ConversationLease {
            guard,
            store: self.store.clone(),
            health: self.health.clone(),
            sync_pending: false,
        }
    }

    async fn load_from_store(
        &self,
        tenant_id: &TenantId,
        id: &ConversationId,
    ) -> Result<Conversation, CacheError> {
        let not_found =
            || CacheError::NotFound { tenant_id: tenant_id.clone(), conversation_id: id.clone() };

        match self.store.load_one(tenant_id, id).await {
            Ok(Some(conversation)) if conversation.tenant_id() == tenant_id => {
                self.health.record_success();
                Ok(conversation)
            }
            Ok(_) => Err(not_found()),
            Err(error) => {
                if error.is_transient() {
                    self.health.record_failure(&error);
                }
                warn!(
                    event_name = "cache.load_failed",
                    tenant_id = %tenant_id,
                    conversation_id = %id,
                    error = %error,
                    "conversation could not be loaded from the store"
                );
                Err(not_found())
            }
        }
    }

    async fn tenant(&self, tenant_id: &TenantId) -> Arc<TenantState> {
        let state = match self.existing_tenant(tenant_id) {
            Some(state) => state,
            None => {
                let mut tenants = match self.tenants.write() {
                    Ok(tenants) => tenants,
                    Err(poisoned) => poisoned.into_inner(),
                };
                tenants.entry(tenant_id.clone()).or_default().clone()
            }
        };

        self.warm_up(tenant_id, &state).await;
        state
    }

    fn existing_tenant(&self, tenant_id: &TenantId) -> Option<Arc<TenantState>> {
        let tenants = match self.tenants.read() {
            Ok(tenants) => tenants,
            Err(poisoned) => poisoned.into_inner(),
        };
        tenants.get(tenant_id).cloned()
    }

    fn tenant_snapshot(&self) -> Vec<(TenantId, Arc<TenantState>)> {
        let tenants = match self.tenants.read() {
            Ok(tenants) => tenants,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut snapshot: Vec<(TenantId, Arc<TenantState>)> =
            tenants.iter().map(|(id, state)| (id.clone(), state.clone())).collect();
        snapshot.sort_by(|left, right| left.0.cmp(&right.0));
        snapshot
    }

    /// Loads the tenant's stored conversations once. A failed warm-up is
    /// retried on the next access instead of failing the request.
    async fn warm_up(&self, tenant_id: &TenantId, state: &TenantState) {
        let result = state
            .warmed
            .get_or_try_init(|| async {
                let conversations = self.store.load_all_for_tenant(tenant_id).await?;
                let absorbed = state.absorb(tenant_id, conversations);
                self.health.record_success();
                info!(
                    event_name = "cache.tenant_warmed",
                    tenant_id = %tenant_id,
                    conversations = absorbed,
                    "tenant state loaded from store"
                );
                Ok::<(), RepositoryError>(())
            })
            .await;

        if let Err(error) = result {
            if error.is_transient() {
                self.health.record_failure(&error);
            }
            warn!(
                event_name = "cache.tenant_warm_up_failed",
                tenant_id = %tenant_id,
                error = %error,
                "tenant warm-up failed; serving from memory"
            );
        }
    }
}

/// Exclusive, mutable access to one cached conversation.
///
/// Dropping a lease without committing keeps any mutations in memory (dirty),
/// to be written by the next periodic flush.
pub struct ConversationLease {
    guard: OwnedMutexGuard<CachedConversation>,
    store: Arc<dyn ConversationRepository>,
    health: Arc<StoreHealth>,
    sync_pending: bool,
}

impl ConversationLease {
    pub fn conversation(&self) -> &Conversation {
        &self.guard.conversation
    }

    pub fn id(&self) -> &ConversationId {
        &self.guard.conversation.id
    }

    pub fn is_dirty(&self) -> bool {
        self.guard.dirty
    }

    pub fn mutate<T>(&mut self, kind: MutationKind, mutation: impl FnOnce(&mut Conversation) -> T) -> T {
        let output = mutation(&mut self.guard.conversation);
        self.mark(kind);
        output
    }

    /// Runs a fallible mutation against a working copy; the cached conversation
    /// only changes if the mutation succeeds.
    pub fn try_mutate<T, E>(
        &mut self,
        kind: MutationKind,
        mutation: impl FnOnce(&mut Conversation) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut working = self.guard.conversation.clone();
        let output = mutation(&mut working)?;
        self.guard.conversation = working;
        self.mark(kind);
        Ok(output)
    }

    /// Writes the conversation now if it is dirty. Returns whether the store
    /// holds the current state afterwards.
    pub async fn sync_now(&mut self) -> bool {
        self.sync_pending = false;
        if !self.guard.dirty {
            return true;
        }
        sync_entry(&mut self.guard, self.store.as_ref(), &self.health).await.is_ok()
    }

    /// Releases the lease, writing through first if a critical mutation is
    /// still unsynced. Returns the committed state.
    pub async fn commit(mut self) -> Conversation {
        if self.sync_pending {
            self.sync_now().await;
        }
        self.guard.conversation.clone()
    }

    fn mark(&mut self, kind: MutationKind) {
        self.guard.dirty = true;
        self.guard.last_touched = Instant::now();
        if kind == MutationKind::Critical {
            self.sync_pending = true;
        }
    }
}

async fn sync_entry(
    entry: &mut CachedConversation,
    store: &dyn ConversationRepository,
    health: &StoreHealth,
) -> Result<(), RepositoryError> {
    match store.upsert(&entry.conversation).await {
        Ok(()) => {
            entry.dirty = false;
            entry.last_synced_at = Some(Utc::now());
            health.record_success();
            Ok(())
        }
        Err(error) => {
            health.record_failure(&error);
            warn!(
                event_name = "cache.sync_failed",
                tenant_id = %entry.conversation.tenant_id(),
                conversation_id = %entry.conversation.id,
                error = %error,
                "conversation sync failed; keeping in-memory copy"
            );
            Err(error)
        }
    }
}
