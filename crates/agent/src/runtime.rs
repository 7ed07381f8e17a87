use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use eventcrew_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use eventcrew_core::domain::agent::AgentType;
use eventcrew_core::domain::conversation::{ConversationId, ConversationPhase, ExternalContext, Message};
use eventcrew_core::domain::tenant::TenantContext;
use eventcrew_core::errors::ApplicationError;
use eventcrew_core::gate::{AccessDecision, FeatureGate};
use eventcrew_db::{ConversationLease, MutationKind, TenantStateCache};

use crate::approval::ApprovalDetector;
use crate::delegation::{DelegationSettings, DelegationStateMachine};
use crate::factory::AgentFactory;
use crate::llm::{complete_within, LlmClient};

/// Which conversation a message belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConversationTarget {
    New,
    Existing(ConversationId),
}

impl ConversationTarget {
    /// `"new"` (or an empty id) starts a conversation; anything else names one.
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("new") {
            Self::New
        } else {
            Self::Existing(ConversationId(trimmed.to_string()))
        }
    }
}

#[derive(Clone, Debug)]
pub struct MessageRequest {
    pub tenant: TenantContext,
    pub conversation: ConversationTarget,
    pub agent_type: String,
    pub text: String,
    pub correlation_id: Option<String>,
    pub external_context: Option<ExternalContext>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub response: String,
    pub conversation_id: ConversationId,
    pub phase: ConversationPhase,
}

/// The single entry point for user messages. Owns nothing global: the cache,
/// oracle and audit sink are injected, so independent runtimes can coexist.
pub struct AgentRuntime {
    cache: Arc<TenantStateCache>,
    gate: FeatureGate,
    factory: AgentFactory,
    machine: DelegationStateMachine,
    oracle: Arc<dyn LlmClient>,
    audit: Arc<dyn AuditSink>,
}

impl AgentRuntime {
    pub fn new(
        cache: Arc<TenantStateCache>,
        oracle: Arc<dyn LlmClient>,
        audit: Arc<dyn AuditSink>,
        settings: DelegationSettings,
    ) -> Self {
        let gate = FeatureGate;
        let factory = AgentFactory::new(gate);
        let machine =
            DelegationStateMachine::new(oracle.clone(), audit.clone(), factory.clone(), settings);
        Self { cache, gate, factory, machine, oracle, audit }
    }

    pub fn with_approval_detector(mut self, detector: Arc<dyn ApprovalDetector>) -> Self {
        self.machine = self.machine.with_approval_detector(detector);
        self
    }

    pub fn cache(&self) -> &Arc<TenantStateCache> {
        &self.cache
    }

    pub async fn handle_message(
        &self,
        request: MessageRequest,
    ) -> Result<MessageResponse, ApplicationError> {
        let started = Instant::now();
        let correlation_id =
            request.correlation_id.clone().unwrap_or_else(|| format!("req-{}", Uuid::new_v4()));
        let tenant = &request.tenant;
        let existing = match &request.conversation {
            ConversationTarget::New => None,
            ConversationTarget::Existing(id) => Some(id.clone()),
        };
        let audit = AuditContext::new(tenant.tenant_id.clone(), existing, correlation_id.as_str(), "user");

        let agent_type = self.authorize(tenant, &request.agent_type, &audit)?;

        let mut lease = match &request.conversation {
            ConversationTarget::New => {
                self.cache.create(&tenant.tenant_id, request.external_context.clone()).await
            }
            ConversationTarget::Existing(id) => {
                let mut lease = self.cache.checkout(&tenant.tenant_id, id).await?;
                if let Some(context) = request.external_context.clone() {
                    lease.mutate(MutationKind::Background, |conversation| {
                        conversation.external_context = Some(context);
                    });
                }
                lease
            }
        };
        let audit = audit.with_conversation(lease.id().clone());

        lease.mutate(MutationKind::Critical, |conversation| {
            conversation.append_message(Message::user(request.text.clone(), Utc::now()));
        });
        // Durable before any oracle call.
        lease.sync_now().await;

        let reply = if agent_type.is_coordinator() {
            self.machine.on_user_message(&mut lease, tenant, &audit, &request.text).await
        } else {
            self.specialist_reply(&lease, tenant, agent_type, &request.text).await
        };
        let response = match reply {
            Ok(response) => response,
            Err(error) => {
                lease.commit().await;
                return Err(error);
            }
        };

        lease.mutate(MutationKind::Critical, |conversation| {
            conversation.append_message(Message::agent(agent_type, response.clone(), Utc::now()));
        });
        let conversation = lease.commit().await;

        info!(
            event_name = "runtime.message_handled",
            tenant_id = %tenant.tenant_id,
            conversation_id = %conversation.id,
            correlation_id = %correlation_id,
            agent_type = %agent_type,
            phase = %conversation.phase(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "message handled"
        );

        let phase = conversation.phase();
        Ok(MessageResponse { response, conversation_id: conversation.id, phase })
    }

    fn authorize(
        &self,
        tenant: &TenantContext,
        requested: &str,
        audit: &AuditContext,
    ) -> Result<AgentType, ApplicationError> {
        let parsed = AgentType::parse(requested);
        let decision = match parsed {
            Some(agent_type) => self.gate.evaluate(tenant.tier, agent_type),
            None => self.gate.evaluate_name(tenant.tier, requested),
        };

        match (decision, parsed) {
            (AccessDecision::Allow, Some(agent_type)) => Ok(agent_type),
            (AccessDecision::Deny { reason_code, required_tier, .. }, _) => {
                self.audit.emit(
                    AuditEvent::from_context(
                        audit,
                        "access.denied",
                        AuditCategory::Access,
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("agent_type", requested.trim())
                    .with_metadata("tier", tenant.tier.as_str())
                    .with_metadata("reason_code", reason_code),
                );
                info!(
                    event_name = "access.denied",
                    tenant_id = %tenant.tenant_id,
                    tier = %tenant.tier,
                    agent_type = %requested.trim(),
                    reason_code,
                    "agent type not available on tenant tier"
                );
                Err(ApplicationError::AccessDenied {
                    agent_type: parsed,
                    requested: requested.trim().to_string(),
                    tier: tenant.tier,
                    required_tier,
                })
            }
            // Allow is only ever produced for a parsed agent type.
            (AccessDecision::Allow, None) => Err(ApplicationError::AccessDenied {
                agent_type: None,
                requested: requested.trim().to_string(),
                tier: tenant.tier,
                required_tier: None,
            }),
        }
    }

    /// A specialist answering the user directly. Does not move the phase.
    async fn specialist_reply(
        &self,
        lease: &ConversationLease,
        tenant: &TenantContext,
        agent_type: AgentType,
        text: &str,
    ) -> Result<String, ApplicationError> {
        let conversation = lease.conversation();
        let handle =
            self.factory.create(tenant, agent_type, conversation.external_context.as_ref())?;
        let prompt = handle.chat_prompt(&conversation.requirements, text);

        match complete_within(self.oracle.as_ref(), &prompt, self.machine.settings().send_timeout)
            .await
        {
            Ok(reply) if !reply.trim().is_empty() => Ok(reply.trim().to_string()),
            Ok(_) => Ok(unavailable_reply(agent_type)),
            Err(error) => {
                warn!(
                    event_name = "runtime.specialist_unavailable",
                    tenant_id = %tenant.tenant_id,
                    conversation_id = %conversation.id,
                    agent_type = %agent_type,
                    error = %error,
                    "specialist could not answer"
                );
                Ok(unavailable_reply(agent_type))
            }
        }
    }
}

fn unavailable_reply(agent_type: AgentType) -> String {
    format!(
        "The {} agent could not answer right now. Please try again in a moment.",
        agent_type.display_name()
    )
}
