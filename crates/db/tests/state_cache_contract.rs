use std::sync::Arc;

use chrono::Utc;

use eventcrew_core::domain::conversation::{ConversationId, ConversationPhase, Message, MessageRole};
use eventcrew_core::domain::tenant::TenantId;
use eventcrew_db::migrations::run_pending;
use eventcrew_db::{
    connect_with_settings, CacheError, CacheSettings, ConversationRepository, MutationKind,
    SqlConversationRepository, TenantStateCache,
};

async fn sql_store() -> Arc<SqlConversationRepository> {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    run_pending(&pool).await.expect("migrations");
    Arc::new(SqlConversationRepository::new(pool))
}

#[tokio::test]
async fn phase_transition_survives_restart() {
    let store = sql_store().await;
    let tenant = TenantId::new("acme");

    let id = {
        let cache = TenantStateCache::new(store.clone(), CacheSettings::default());
        let id = cache.create(&tenant, None).await.commit().await.id;
        cache
            .apply(&tenant, &id, MutationKind::Critical, |conversation| {
                conversation.advance_to(ConversationPhase::ProposalReview, Utc::now())
            })
            .await
            .expect("apply")
            .expect("advance");
        id
    };

    let restarted = TenantStateCache::new(store.clone(), CacheSettings::default());
    let conversation = restarted.get(&tenant, &id).await.expect("reload");
    assert_eq!(conversation.phase(), ConversationPhase::ProposalReview);
}

#[tokio::test]
async fn concurrent_appends_are_serialised_per_conversation() {
    let store = sql_store().await;
    let cache = Arc::new(TenantStateCache::new(store.clone(), CacheSettings::default()));
    let tenant = TenantId::new("acme");
    let id = cache.create(&tenant, None).await.commit().await.id;

    let mut handles = Vec::new();
    for writer in 0..8 {
        let cache = cache.clone();
        let tenant = tenant.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            for sequence in 0..5 {
                let mut lease = cache.checkout(&tenant, &id).await.expect("checkout");
                lease.mutate(MutationKind::Critical, |conversation| {
                    conversation.append_message(Message::user(
                        format!("writer-{writer}-{sequence}"),
                        Utc::now(),
                    ));
                });
                tokio::task::yield_now().await;
                lease.mutate(MutationKind::Critical, |conversation| {
                    conversation.append_message(Message::system(
                        format!("ack-{writer}-{sequence}"),
                        Utc::now(),
                    ));
                });
                lease.commit().await;
            }
        }));
    }
    for handle in handles {
        handle.await.expect("writer task");
    }

    let conversation = cache.get(&tenant, &id).await.expect("get");
    let messages = conversation.messages();
    assert_eq!(messages.len(), 80);

    // Each writer's message is immediately followed by its own acknowledgement.
    for pair in messages.chunks(2) {
        assert_eq!(pair[0].role, MessageRole::User);
        let suffix = pair[0].body.trim_start_matches("writer-");
        assert_eq!(pair[1].body, format!("ack-{suffix}"));
    }

    // Per-writer order is preserved.
    for writer in 0..8 {
        let sequence: Vec<&str> = messages
            .iter()
            .filter(|message| message.body.starts_with(&format!("writer-{writer}-")))
            .map(|message| message.body.as_str())
            .collect();
        let expected: Vec<String> = (0..5).map(|n| format!("writer-{writer}-{n}")).collect();
        assert_eq!(sequence, expected.iter().map(String::as_str).collect::<Vec<_>>());
    }

    let stored = store.load_one(&tenant, &id).await.expect("load").expect("present");
    assert_eq!(stored.messages(), messages);
}

#[tokio::test]
async fn flush_twice_stores_identical_record() {
    let store = sql_store().await;
    let cache = TenantStateCache::new(store.clone(), CacheSettings::default());
    let tenant = TenantId::new("acme");
    let id = cache.create(&tenant, None).await.commit().await.id;
    cache
        .apply(&tenant, &id, MutationKind::Background, |conversation| {
            conversation.requirements.insert("budget".to_string(), "$50k".to_string());
        })
        .await
        .expect("apply");

    let first = cache.flush_dirty().await;
    let after_first = store.load_one(&tenant, &id).await.expect("load");
    let second = cache.flush_dirty().await;
    let after_second = store.load_one(&tenant, &id).await.expect("load");

    assert_eq!(first.flushed, 1);
    assert_eq!(second.flushed, 0);
    assert_eq!(after_first, after_second);
    assert_eq!(store.load_all_for_tenant(&tenant).await.expect("all").len(), 1);
}

#[tokio::test]
async fn tenants_never_share_conversations() {
    let store = sql_store().await;
    let cache = TenantStateCache::new(store.clone(), CacheSettings::default());
    let acme = TenantId::new("acme");
    let globex = TenantId::new("globex");

    let acme_id = cache.create(&acme, None).await.commit().await.id;
    cache
        .apply(&acme, &acme_id, MutationKind::Critical, |conversation| {
            conversation.append_message(Message::user("acme secret", Utc::now()));
        })
        .await
        .expect("apply");

    assert!(cache.get(&globex, &acme_id).await.is_err());

    let restarted = TenantStateCache::new(store, CacheSettings::default());
    assert!(restarted.get(&globex, &acme_id).await.is_err());
    let reloaded = restarted.get(&acme, &acme_id).await.expect("owner still sees it");
    assert_eq!(reloaded.messages()[0].body, "acme secret");
}

#[tokio::test]
async fn corrupt_record_does_not_degrade_the_store() {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    run_pending(&pool).await.expect("migrations");
    sqlx::query(
        "INSERT INTO conversation (tenant_id, id, phase, messages_json, assignments_json,
            requirements_json, external_context_json, created_at, updated_at)
         VALUES ('acme', 'conv-bad', 'implementation', '{not json', '[]', '{}', NULL,
            '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
    )
    .execute(&pool)
    .await
    .expect("insert corrupt row");

    let cache = TenantStateCache::new(
        Arc::new(SqlConversationRepository::new(pool)),
        CacheSettings::default(),
    );
    let tenant = TenantId::new("acme");
    let error = cache
        .get(&tenant, &ConversationId("conv-bad".to_string()))
        .await
        .expect_err("corrupt record is unreadable");

    assert!(matches!(error, CacheError::NotFound { .. }));
    assert!(!cache.is_degraded());
    assert_eq!(cache.health().consecutive_failures, 0);
}
