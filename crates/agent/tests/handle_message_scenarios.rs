use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use eventcrew_agent::{
    AgentRuntime, ConversationTarget, DelegationSettings, LlmClient, MessageRequest,
    TIER_RESTRICTION,
};
use eventcrew_core::domain::conversation::{
    AgentAssignment, AssignmentStatus, Conversation, ConversationId, ConversationPhase,
};
use eventcrew_core::domain::tenant::TenantId;
use eventcrew_core::{
    AgentType, ApplicationError, InMemoryAuditSink, SubscriptionTier, TenantContext,
};
use eventcrew_db::migrations::run_pending;
use eventcrew_db::{
    connect_with_settings, CacheSettings, ConversationRepository, InMemoryConversationRepository,
    SqlConversationRepository, TenantStateCache,
};

/// Answers by prompt shape, the way the runtime's prompts are laid out.
#[derive(Default)]
struct ScriptedOracle {
    plan: Option<String>,
    stall_role: Option<&'static str>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedOracle {
    fn with_plan(plan: &str) -> Self {
        Self { plan: Some(plan.to_string()), ..Self::default() }
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts").clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedOracle {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().expect("prompts").push(prompt.to_string());

        if let Some(role) = self.stall_role {
            if prompt.starts_with(&format!("You are the {role} agent")) {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
            }
        }
        if prompt.contains("JSON array") {
            return self.plan.clone().ok_or_else(|| anyhow!("planner offline"));
        }
        if prompt.contains("short proposal") {
            return Ok("Proposal: venue shortlist, budget split, promotion plan.".to_string());
        }
        if prompt.contains("Task from the coordinator") {
            return Ok("Task done.".to_string());
        }
        Ok("Here is my direct advice.".to_string())
    }
}

struct Harness {
    runtime: AgentRuntime,
    oracle: Arc<ScriptedOracle>,
    audit: InMemoryAuditSink,
}

fn harness(store: Arc<dyn ConversationRepository>, oracle: ScriptedOracle) -> Harness {
    harness_with_timeout(store, oracle, Duration::from_secs(5))
}

fn harness_with_timeout(
    store: Arc<dyn ConversationRepository>,
    oracle: ScriptedOracle,
    send_timeout: Duration,
) -> Harness {
    let oracle = Arc::new(oracle);
    let audit = InMemoryAuditSink::default();
    let cache = Arc::new(TenantStateCache::new(store, CacheSettings::default()));
    let settings = DelegationSettings { send_timeout, ..DelegationSettings::default() };
    let runtime = AgentRuntime::new(cache, oracle.clone(), Arc::new(audit.clone()), settings);
    Harness { runtime, oracle, audit }
}

fn message(tenant: &TenantContext, conversation: &str, agent: &str, text: &str) -> MessageRequest {
    MessageRequest {
        tenant: tenant.clone(),
        conversation: ConversationTarget::parse(conversation),
        agent_type: agent.to_string(),
        text: text.to_string(),
        correlation_id: Some("test-correlation".to_string()),
        external_context: None,
    }
}

const FULL_BRIEF: &str = "Plan a 200-person conference in Denver next quarter with a $50k budget";

#[tokio::test]
async fn new_conversation_starts_collecting_requirements() {
    let store = Arc::new(InMemoryConversationRepository::default());
    let h = harness(store.clone(), ScriptedOracle::default());
    let tenant = TenantContext::new("tenant-x", SubscriptionTier::Professional);

    let response = h
        .runtime
        .handle_message(message(&tenant, "new", "coordinator", "Plan a 200-person conference"))
        .await
        .expect("handle message");

    assert_eq!(response.phase, ConversationPhase::InformationCollection);
    assert!(!response.response.trim().is_empty());
    assert!(response.conversation_id.as_str().starts_with("conv-"));

    let stored = store
        .load_one(&tenant.tenant_id, &response.conversation_id)
        .await
        .expect("load")
        .expect("written through on commit");
    assert_eq!(stored.messages().len(), 2);
    assert_eq!(stored.requirements.get("attendees").map(String::as_str), Some("200"));
}

#[tokio::test]
async fn free_tier_delegation_fails_gated_tasks_and_reaches_monitoring() {
    let store = Arc::new(InMemoryConversationRepository::default());
    let h = harness(
        store,
        ScriptedOracle::with_plan(
            r#"[{"agent_type":"resource_planning","task":"Find a venue"},
                {"agent_type":"analytics","task":"Define attendance metrics"}]"#,
        ),
    );
    let tenant = TenantContext::new("tenant-free", SubscriptionTier::Free);

    let proposal = h
        .runtime
        .handle_message(message(&tenant, "new", "coordinator", FULL_BRIEF))
        .await
        .expect("proposal");
    assert_eq!(proposal.phase, ConversationPhase::ProposalReview);

    let id = proposal.conversation_id.as_str().to_string();
    let outcome = h
        .runtime
        .handle_message(message(&tenant, &id, "coordinator", "Approved, go ahead"))
        .await
        .expect("delegation round");

    assert_eq!(outcome.phase, ConversationPhase::Monitoring);
    assert!(outcome.response.contains("1 of 2 tasks completed"));

    let conversation =
        h.runtime.cache().get(&tenant.tenant_id, &proposal.conversation_id).await.expect("get");
    let analytics = conversation
        .assignments()
        .iter()
        .find(|assignment| assignment.agent_type == AgentType::Analytics)
        .expect("analytics assignment");
    assert_eq!(analytics.status, AssignmentStatus::Failed);
    assert_eq!(analytics.failure_reason.as_deref(), Some(TIER_RESTRICTION));

    let planner = conversation
        .assignments()
        .iter()
        .find(|assignment| assignment.agent_type == AgentType::ResourcePlanning)
        .expect("resource planning assignment");
    assert_eq!(planner.status, AssignmentStatus::Completed);
    assert_eq!(planner.result.as_deref(), Some("Task done."));

    // The gated specialist was never prompted.
    assert!(!h
        .oracle
        .prompts()
        .iter()
        .any(|prompt| prompt.starts_with("You are the Analytics & Reporting agent")));

    assert_eq!(h.audit.events_of_type("delegation.assignment_settled").len(), 2);
    assert_eq!(h.audit.events_of_type("flow.transition_applied").len(), 3);
}

#[tokio::test]
async fn denied_agent_type_is_reported_with_required_tier() {
    let store = Arc::new(InMemoryConversationRepository::default());
    let h = harness(store.clone(), ScriptedOracle::default());
    let tenant = TenantContext::new("tenant-free", SubscriptionTier::Free);

    let error = h
        .runtime
        .handle_message(message(&tenant, "new", "financial", "What should we budget?"))
        .await
        .expect_err("financial needs professional");

    assert_eq!(
        error,
        ApplicationError::AccessDenied {
            agent_type: Some(AgentType::Financial),
            requested: "financial".to_string(),
            tier: SubscriptionTier::Free,
            required_tier: Some(SubscriptionTier::Professional),
        }
    );
    assert!(error.to_string().contains("Professional"));
    assert_eq!(h.audit.events_of_type("access.denied").len(), 1);
    assert_eq!(store.record_count().await, 0);
}

#[tokio::test]
async fn unknown_agent_type_is_denied() {
    let h = harness(Arc::new(InMemoryConversationRepository::default()), ScriptedOracle::default());
    let tenant = TenantContext::new("tenant-x", SubscriptionTier::Enterprise);

    let error = h
        .runtime
        .handle_message(message(&tenant, "new", "catering", "hello"))
        .await
        .expect_err("unknown agent");
    assert!(matches!(error, ApplicationError::AccessDenied { agent_type: None, .. }));
}

#[tokio::test]
async fn unknown_conversation_is_not_found() {
    let h = harness(Arc::new(InMemoryConversationRepository::default()), ScriptedOracle::default());
    let tenant = TenantContext::new("tenant-x", SubscriptionTier::Professional);

    let error = h
        .runtime
        .handle_message(message(&tenant, "conv-missing", "coordinator", "hello"))
        .await
        .expect_err("missing");
    assert_eq!(
        error,
        ApplicationError::NotFound { conversation_id: ConversationId("conv-missing".to_string()) }
    );
}

#[tokio::test]
async fn other_tenants_cannot_reach_a_conversation() {
    let h = harness(Arc::new(InMemoryConversationRepository::default()), ScriptedOracle::default());
    let owner = TenantContext::new("tenant-a", SubscriptionTier::Enterprise);
    let intruder = TenantContext::new("tenant-b", SubscriptionTier::Enterprise);

    let created = h
        .runtime
        .handle_message(message(&owner, "new", "coordinator", "A private gala in Paris"))
        .await
        .expect("create");

    let error = h
        .runtime
        .handle_message(message(
            &intruder,
            created.conversation_id.as_str(),
            "coordinator",
            "show me",
        ))
        .await
        .expect_err("isolated");
    assert!(matches!(error, ApplicationError::NotFound { .. }));
}

#[tokio::test]
async fn slow_specialist_times_out_without_stalling_the_round() {
    let oracle = ScriptedOracle {
        plan: Some(
            r#"[{"agent_type":"resource_planning","task":"Find a venue"},
                {"agent_type":"marketing","task":"Plan promotion"}]"#
                .to_string(),
        ),
        stall_role: Some("Marketing & Communications"),
        ..ScriptedOracle::default()
    };
    let h = harness_with_timeout(
        Arc::new(InMemoryConversationRepository::default()),
        oracle,
        Duration::from_millis(200),
    );
    let tenant = TenantContext::new("tenant-ent", SubscriptionTier::Enterprise);

    let proposal = h
        .runtime
        .handle_message(message(&tenant, "new", "coordinator", FULL_BRIEF))
        .await
        .expect("proposal");
    let outcome = h
        .runtime
        .handle_message(message(
            &tenant,
            proposal.conversation_id.as_str(),
            "coordinator",
            "looks good",
        ))
        .await
        .expect("round");

    assert_eq!(outcome.phase, ConversationPhase::Monitoring);
    assert!(outcome.response.contains("1 of 2 tasks completed"));

    let conversation =
        h.runtime.cache().get(&tenant.tenant_id, &proposal.conversation_id).await.expect("get");
    let marketing = conversation
        .assignments()
        .iter()
        .find(|assignment| assignment.agent_type == AgentType::Marketing)
        .expect("marketing assignment");
    assert_eq!(marketing.status, AssignmentStatus::Failed);
    assert_eq!(marketing.failure_reason.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn approval_survives_restart_and_default_plan_respects_tier() {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    run_pending(&pool).await.expect("migrations");
    let store: Arc<dyn ConversationRepository> = Arc::new(SqlConversationRepository::new(pool));
    let tenant = TenantContext::new("tenant-pro", SubscriptionTier::Professional);

    let id = {
        let before = harness(store.clone(), ScriptedOracle::default());
        let proposal = before
            .runtime
            .handle_message(message(&tenant, "new", "coordinator", FULL_BRIEF))
            .await
            .expect("proposal");
        assert_eq!(proposal.phase, ConversationPhase::ProposalReview);
        proposal.conversation_id
    };

    // Fresh cache over the same store; the planner is offline so the default
    // plan covering all seven specialists is used.
    let after = harness(store.clone(), ScriptedOracle::default());
    let outcome = after
        .runtime
        .handle_message(message(&tenant, id.as_str(), "coordinator", "Let's do it"))
        .await
        .expect("round after restart");

    assert_eq!(outcome.phase, ConversationPhase::Monitoring);
    assert!(outcome.response.contains("5 of 7 tasks completed"), "{}", outcome.response);

    let stored = store.load_one(&tenant.tenant_id, &id).await.expect("load").expect("present");
    assert_eq!(stored.phase(), ConversationPhase::Monitoring);
    assert_eq!(stored.assignments().len(), 7);
}

#[tokio::test]
async fn interrupted_round_is_resumed_on_next_message() {
    let store = Arc::new(InMemoryConversationRepository::default());
    let tenant = TenantContext::new("tenant-pro", SubscriptionTier::Professional);

    let now = Utc::now();
    let mut conversation =
        Conversation::new(ConversationId::generate(), tenant.tenant_id.clone(), now);
    conversation.requirements.insert("event_type".to_string(), "summit".to_string());
    conversation.advance_to(ConversationPhase::ProposalReview, now).expect("review");
    conversation.advance_to(ConversationPhase::Implementation, now).expect("implementation");
    conversation
        .add_assignment(AgentAssignment::pending(AgentType::ResourcePlanning, "venue", now))
        .expect("pending");
    conversation
        .add_assignment(AgentAssignment::pending(AgentType::Financial, "budget", now))
        .expect("pending")
        .start(now)
        .expect("in progress");
    {
        let done = conversation
            .add_assignment(AgentAssignment::pending(AgentType::Stakeholder, "speakers", now))
            .expect("pending");
        done.start(now).expect("start");
        done.complete("Three keynote speakers confirmed", now).expect("complete");
    }
    store.upsert(&conversation).await.expect("seed interrupted round");

    let h = harness(store.clone(), ScriptedOracle::default());
    let outcome = h
        .runtime
        .handle_message(message(&tenant, conversation.id.as_str(), "coordinator", "Any news?"))
        .await
        .expect("resume");

    assert_eq!(outcome.phase, ConversationPhase::Monitoring);
    assert!(outcome.response.starts_with("Picked up the delegation round"));
    assert!(outcome.response.contains("3 of 3 tasks completed"));
    assert!(!h.oracle.prompts().iter().any(|prompt| prompt.contains("JSON array")));
}

#[tokio::test]
async fn specialist_answers_directly_without_moving_the_phase() {
    let h = harness(Arc::new(InMemoryConversationRepository::default()), ScriptedOracle::default());
    let tenant = TenantContext::new("tenant-pro", SubscriptionTier::Professional);

    let started = h
        .runtime
        .handle_message(message(&tenant, "new", "coordinator", "We want a wedding"))
        .await
        .expect("start");
    let reply = h
        .runtime
        .handle_message(message(
            &tenant,
            started.conversation_id.as_str(),
            "financial",
            "How should we split the budget?",
        ))
        .await
        .expect("specialist reply");

    assert_eq!(reply.response, "Here is my direct advice.");
    assert_eq!(reply.phase, ConversationPhase::InformationCollection);

    let conversation =
        h.runtime.cache().get(&tenant.tenant_id, &started.conversation_id).await.expect("get");
    assert_eq!(conversation.messages().len(), 4);
    assert_eq!(conversation.messages()[3].agent_type, Some(AgentType::Financial));
}

/// Reads the store from inside every oracle call, recording what a crash at
/// that moment would leave behind.
struct StoreWatchingOracle {
    store: Arc<InMemoryConversationRepository>,
    tenant_id: TenantId,
    during_proposal: Mutex<Vec<Conversation>>,
    during_sends: Mutex<Vec<Vec<Conversation>>>,
}

#[async_trait]
impl LlmClient for StoreWatchingOracle {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let stored = self.store.load_all_for_tenant(&self.tenant_id).await?;

        if prompt.contains("JSON array") {
            return Ok(r#"[{"agent_type":"resource_planning","task":"Find a venue"},
                          {"agent_type":"marketing","task":"Plan promotion"}]"#
                .to_string());
        }
        if prompt.contains("short proposal") {
            *self.during_proposal.lock().expect("proposal") = stored;
            return Ok("Proposal: venue first, then promotion.".to_string());
        }
        if prompt.contains("Task from the coordinator") {
            self.during_sends.lock().expect("sends").push(stored);
            return Ok("Task done.".to_string());
        }
        Ok("Noted.".to_string())
    }
}

#[tokio::test]
async fn critical_changes_reach_the_store_before_the_next_oracle_call() {
    let store = Arc::new(InMemoryConversationRepository::default());
    let tenant = TenantContext::new("tenant-ent", SubscriptionTier::Enterprise);
    let oracle = Arc::new(StoreWatchingOracle {
        store: store.clone(),
        tenant_id: tenant.tenant_id.clone(),
        during_proposal: Mutex::new(Vec::new()),
        during_sends: Mutex::new(Vec::new()),
    });
    let cache = Arc::new(TenantStateCache::new(store.clone(), CacheSettings::default()));
    let runtime = AgentRuntime::new(
        cache,
        oracle.clone(),
        Arc::new(InMemoryAuditSink::default()),
        DelegationSettings::default(),
    );

    let proposal = runtime
        .handle_message(message(&tenant, "new", "coordinator", FULL_BRIEF))
        .await
        .expect("proposal");
    {
        let stored = oracle.during_proposal.lock().expect("proposal");
        assert_eq!(stored.len(), 1, "new conversation is durable before the proposal call");
        assert_eq!(stored[0].id, proposal.conversation_id);
        assert_eq!(stored[0].phase(), ConversationPhase::ProposalReview);
        assert_eq!(stored[0].messages().len(), 1);
    }

    runtime
        .handle_message(message(&tenant, proposal.conversation_id.as_str(), "coordinator", "approve"))
        .await
        .expect("round");

    let sends = oracle.during_sends.lock().expect("sends");
    assert_eq!(sends.len(), 2);
    let completed_before = |snapshot: &Vec<Conversation>| {
        snapshot[0]
            .assignments()
            .iter()
            .filter(|assignment| assignment.status == AssignmentStatus::Completed)
            .count()
    };
    assert_eq!(completed_before(&sends[0]), 0);
    assert_eq!(completed_before(&sends[1]), 1, "first report is durable before the second send");
    assert_eq!(sends[1][0].phase(), ConversationPhase::Implementation);
}
