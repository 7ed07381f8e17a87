//! Coordinator side of the conversation flow.
//!
//! Each coordinator turn runs against a checked-out conversation, so the whole
//! delegation round (planning, every send, every settlement) happens under the
//! conversation's lock. Assignment failures are recorded on the assignment and
//! never abort the round; the conversation always ends the round in
//! `Monitoring`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use eventcrew_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use eventcrew_core::config::DelegationConfig;
use eventcrew_core::domain::agent::AgentType;
use eventcrew_core::domain::conversation::{
    AgentAssignment, AssignmentId, AssignmentStatus, Conversation, ConversationPhase, Message,
};
use eventcrew_core::domain::tenant::TenantContext;
use eventcrew_core::errors::{ApplicationError, DomainError};
use eventcrew_core::flows::{FlowContext, FlowEngine, FlowEvent, PlanningFlow, TransitionOutcome};
use eventcrew_core::gate::AccessDecision;
use eventcrew_db::{ConversationLease, MutationKind};

use crate::approval::{ApprovalDetector, KeywordApprovalDetector};
use crate::channel::{AgentChannel, TaskRequest};
use crate::factory::{AgentFactory, AgentHandle};
use crate::llm::{complete_within, LlmClient};
use crate::planning::{event_summary, TaskPlanner};
use crate::requirements::{clarification_prompt, RequirementExtractor};

pub const TIER_RESTRICTION: &str = "tier restriction";

const APPROVAL_HINT: &str = "Reply \"approve\" when you are happy with this plan and I will brief the team.";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DelegationSettings {
    pub send_timeout: Duration,
    pub required_fields: Vec<String>,
    pub max_tasks: usize,
}

impl From<&DelegationConfig> for DelegationSettings {
    fn from(config: &DelegationConfig) -> Self {
        Self {
            send_timeout: Duration::from_secs(config.send_timeout_secs),
            required_fields: config.required_fields.clone(),
            max_tasks: config.max_tasks,
        }
    }
}

impl Default for DelegationSettings {
    fn default() -> Self {
        Self::from(&DelegationConfig::default())
    }
}

enum Settlement {
    Completed(String),
    Failed { reason: String, note: String },
}

pub struct DelegationStateMachine {
    flow: FlowEngine<PlanningFlow>,
    extractor: RequirementExtractor,
    approval: Arc<dyn ApprovalDetector>,
    planner: TaskPlanner,
    factory: AgentFactory,
    channel: AgentChannel,
    oracle: Arc<dyn LlmClient>,
    audit: Arc<dyn AuditSink>,
    settings: DelegationSettings,
}

impl DelegationStateMachine {
    pub fn new(
        oracle: Arc<dyn LlmClient>,
        audit: Arc<dyn AuditSink>,
        factory: AgentFactory,
        settings: DelegationSettings,
    ) -> Self {
        Self {
            flow: FlowEngine::default(),
            extractor: RequirementExtractor::new(),
            approval: Arc::new(KeywordApprovalDetector::default()),
            planner: TaskPlanner::new(oracle.clone(), settings.send_timeout, settings.max_tasks),
            channel: AgentChannel::new(oracle.clone(), settings.send_timeout),
            factory,
            oracle,
            audit,
            settings,
        }
    }

    pub fn with_approval_detector(mut self, detector: Arc<dyn ApprovalDetector>) -> Self {
        self.approval = detector;
        self
    }

    pub fn settings(&self) -> &DelegationSettings {
        &self.settings
    }

    /// Handles one user message addressed to the coordinator and returns the
    /// coordinator's reply. The user message is expected to be appended
    /// already.
    pub async fn on_user_message(
        &self,
        lease: &mut ConversationLease,
        tenant: &TenantContext,
        audit: &AuditContext,
        text: &str,
    ) -> Result<String, ApplicationError> {
        match lease.conversation().phase() {
            ConversationPhase::InformationCollection => {
                self.collect_requirements(lease, tenant, audit, text).await
            }
            ConversationPhase::ProposalReview => {
                self.review_proposal(lease, tenant, audit, text).await
            }
            ConversationPhase::Implementation => self.run_round(lease, tenant, audit).await,
            ConversationPhase::Monitoring => Ok(status_report(lease.conversation())),
        }
    }

    async fn collect_requirements(
        &self,
        lease: &mut ConversationLease,
        tenant: &TenantContext,
        audit: &AuditContext,
        text: &str,
    ) -> Result<String, ApplicationError> {
        self.merge_requirements(lease, text);

        let context = self.flow_context(lease.conversation());
        if !context.missing_required_fields.is_empty() {
            let missing: Vec<&str> =
                context.missing_required_fields.iter().map(String::as_str).collect();
            return Ok(clarification_prompt(&missing));
        }

        self.advance(lease, FlowEvent::RequirementsGathered, audit).await?;
        Ok(self.propose(lease.conversation(), tenant).await)
    }

    async fn review_proposal(
        &self,
        lease: &mut ConversationLease,
        tenant: &TenantContext,
        audit: &AuditContext,
        text: &str,
    ) -> Result<String, ApplicationError> {
        if !self.approval.is_approval(text).await {
            let updated = self.merge_requirements(lease, text);
            if updated.is_empty() {
                return Ok(format!("Tell me what you would like to change. {APPROVAL_HINT}"));
            }
            return Ok(format!("Updated the plan with your new {}. {APPROVAL_HINT}", updated.join(", ")));
        }

        self.advance(lease, FlowEvent::ProposalApproved, audit).await?;
        self.run_round(lease, tenant, audit).await
    }

    /// Runs (or resumes) the delegation round, then moves to `Monitoring`.
    async fn run_round(
        &self,
        lease: &mut ConversationLease,
        tenant: &TenantContext,
        audit: &AuditContext,
    ) -> Result<String, ApplicationError> {
        let resumed = !lease.conversation().assignments().is_empty();
        if resumed {
            info!(
                event_name = "delegation.round_resumed",
                tenant_id = %tenant.tenant_id,
                conversation_id = %lease.id(),
                outstanding = lease.conversation().delegation_tally().outstanding,
                "resuming interrupted delegation round"
            );
        } else {
            let tasks = self.planner.plan(&lease.conversation().requirements).await;
            let now = Utc::now();
            lease.try_mutate(MutationKind::Background, |conversation| {
                for task in tasks {
                    conversation.add_assignment(AgentAssignment::pending(task.agent_type, task.task, now))?;
                }
                Ok::<(), DomainError>(())
            })?;
            lease.sync_now().await;
        }

        let external_context = lease.conversation().external_context.clone();
        let coordinator =
            self.factory.create(tenant, AgentType::Coordinator, external_context.as_ref())?;

        for id in lease.conversation().outstanding_assignment_ids() {
            self.dispatch(lease, tenant, audit, &coordinator, &id).await?;
        }

        self.advance(lease, FlowEvent::AssignmentsSettled, audit).await?;
        Ok(round_summary(lease.conversation(), resumed))
    }

    async fn dispatch(
        &self,
        lease: &mut ConversationLease,
        tenant: &TenantContext,
        audit: &AuditContext,
        coordinator: &AgentHandle,
        id: &AssignmentId,
    ) -> Result<(), ApplicationError> {
        let Some(assignment) =
            lease.conversation().assignments().iter().find(|assignment| &assignment.id == id).cloned()
        else {
            return Ok(());
        };
        let agent_type = assignment.agent_type;

        if let AccessDecision::Deny { required_tier, .. } =
            self.factory.gate().evaluate(tenant.tier, agent_type)
        {
            let upgrade = required_tier
                .map(|tier| format!(" (available on the {} plan)", tier.display_name()))
                .unwrap_or_default();
            let note = format!(
                "{} task skipped: {TIER_RESTRICTION}{upgrade}.",
                agent_type.display_name()
            );
            return self
                .settle(
                    lease,
                    audit,
                    &assignment,
                    Settlement::Failed { reason: TIER_RESTRICTION.to_string(), note },
                )
                .await;
        }

        let external_context = lease.conversation().external_context.clone();
        let handle = match self.factory.create(tenant, agent_type, external_context.as_ref()) {
            Ok(handle) => handle,
            Err(error) => {
                let reason = error.to_string();
                let note = format!("{} task failed: {reason}", agent_type.display_name());
                return self.settle(lease, audit, &assignment, Settlement::Failed { reason, note }).await;
            }
        };

        if assignment.status == AssignmentStatus::Pending {
            let now = Utc::now();
            lease.try_mutate(MutationKind::Background, |conversation| {
                match conversation.assignment_mut(id) {
                    Some(assignment) => assignment.start(now),
                    None => Err(missing_assignment(id)),
                }
            })?;
        }

        let request = TaskRequest {
            task: assignment.task.clone(),
            requirements: lease.conversation().requirements.clone(),
        };
        let settlement = match self.channel.send(coordinator, &handle, &request).await {
            Ok(report) => Settlement::Completed(report.body),
            Err(error) => {
                let reason = error.failure_reason();
                warn!(
                    event_name = "delegation.send_failed",
                    tenant_id = %tenant.tenant_id,
                    conversation_id = %lease.id(),
                    agent_type = %agent_type,
                    error = %error,
                    "delegated task failed"
                );
                let note = format!("{} task failed: {reason}.", agent_type.display_name());
                Settlement::Failed { reason, note }
            }
        };
        self.settle(lease, audit, &assignment, settlement).await
    }

    /// Records the outcome of one assignment and writes it through before the
    /// next send, so a restarted round never re-dispatches a settled task.
    async fn settle(
        &self,
        lease: &mut ConversationLease,
        audit: &AuditContext,
        assignment: &AgentAssignment,
        settlement: Settlement,
    ) -> Result<(), ApplicationError> {
        let now = Utc::now();
        let agent_type = assignment.agent_type;
        lease.try_mutate(MutationKind::Critical, |conversation| {
            let stored =
                conversation.assignment_mut(&assignment.id).ok_or_else(|| missing_assignment(&assignment.id))?;
            let message = match &settlement {
                Settlement::Completed(body) => {
                    stored.complete(body.clone(), now)?;
                    Message::agent(agent_type, body.clone(), now)
                }
                Settlement::Failed { reason, note } => {
                    stored.fail(reason.clone(), now)?;
                    Message::system(note.clone(), now)
                }
            };
            conversation.append_message(message);
            Ok::<(), DomainError>(())
        })?;
        lease.sync_now().await;

        let event = match &settlement {
            Settlement::Completed(_) => AuditEvent::from_context(
                audit,
                "delegation.assignment_settled",
                AuditCategory::Delegation,
                AuditOutcome::Success,
            )
            .with_metadata("status", AssignmentStatus::Completed.as_str()),
            Settlement::Failed { reason, .. } => AuditEvent::from_context(
                audit,
                "delegation.assignment_settled",
                AuditCategory::Delegation,
                AuditOutcome::Failed,
            )
            .with_metadata("status", AssignmentStatus::Failed.as_str())
            .with_metadata("reason", reason.clone()),
        };
        self.audit.emit(
            event
                .with_metadata("assignment_id", assignment.id.0.clone())
                .with_metadata("agent_type", agent_type.as_str()),
        );
        Ok(())
    }

    /// Returns the names of the requirement fields the message changed.
    fn merge_requirements(&self, lease: &mut ConversationLease, text: &str) -> Vec<String> {
        let extracted = self.extractor.extract(text);
        if extracted.is_empty() {
            return Vec::new();
        }
        lease.mutate(MutationKind::Background, |conversation| {
            let mut changed = Vec::new();
            for (field, value) in extracted {
                if conversation.requirements.get(&field) != Some(&value) {
                    changed.push(field.replace('_', " "));
                    conversation.requirements.insert(field, value);
                }
            }
            changed
        })
    }

    fn flow_context(&self, conversation: &Conversation) -> FlowContext {
        FlowContext::for_conversation(conversation, &self.settings.required_fields)
    }

    /// Phase changes are critical and are written through immediately.
    async fn advance(
        &self,
        lease: &mut ConversationLease,
        event: FlowEvent,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, ApplicationError> {
        let context = self.flow_context(lease.conversation());
        let outcome = lease.try_mutate(MutationKind::Critical, |conversation| {
            self.flow.advance(conversation, event, &context, self.audit.as_ref(), audit)
        })?;
        lease.sync_now().await;
        info!(
            event_name = "delegation.phase_changed",
            tenant_id = %audit.tenant_id,
            conversation_id = %lease.id(),
            from = %outcome.from,
            to = %outcome.to,
            "conversation phase advanced"
        );
        Ok(outcome)
    }

    async fn propose(&self, conversation: &Conversation, tenant: &TenantContext) -> String {
        let team = self.factory.gate().allowed_agents(tenant.tier);
        let prompt = proposal_prompt(conversation, team);
        match complete_within(self.oracle.as_ref(), &prompt, self.settings.send_timeout).await {
            Ok(text) if !text.trim().is_empty() => format!("{}\n\n{APPROVAL_HINT}", text.trim()),
            Ok(_) => fallback_proposal(conversation, team),
            Err(error) => {
                warn!(
                    event_name = "delegation.proposal_fallback",
                    conversation_id = %conversation.id,
                    error = %error,
                    "oracle proposal unavailable; using template"
                );
                fallback_proposal(conversation, team)
            }
        }
    }
}

fn missing_assignment(id: &AssignmentId) -> DomainError {
    DomainError::InvariantViolation(format!("assignment `{}` is not part of this conversation", id.0))
}

fn specialists(team: &[AgentType]) -> Vec<&'static str> {
    team.iter()
        .filter(|agent| !agent.is_coordinator())
        .map(|agent| agent.display_name())
        .collect()
}

fn proposal_prompt(conversation: &Conversation, team: &[AgentType]) -> String {
    let mut prompt = String::from(
        "You are the coordinator of an event planning team. Write a short proposal for the event \
         below: the approach, the main workstreams and who owns them. Do not ask questions.\n",
    );
    prompt.push_str(&format!("Event: {}.\n", event_summary(&conversation.requirements)));
    prompt.push_str(&format!("Available specialists: {}.\n", specialists(team).join(", ")));
    prompt
}

fn fallback_proposal(conversation: &Conversation, team: &[AgentType]) -> String {
    format!(
        "Here is my proposal for {}: I will brief the {} team{} and bring their recommendations \
         together for you.\n\n{APPROVAL_HINT}",
        event_summary(&conversation.requirements),
        specialists(team).join(", "),
        if specialists(team).len() == 1 { "" } else { "s" }
    )
}

fn round_summary(conversation: &Conversation, resumed: bool) -> String {
    let tally = conversation.delegation_tally();
    let mut summary = String::new();
    if resumed {
        summary.push_str("Picked up the delegation round where it left off. ");
    }
    summary.push_str(&format!("{} of {} tasks completed.", tally.completed, tally.total));

    let failures: Vec<String> = conversation
        .assignments()
        .iter()
        .filter(|assignment| assignment.status == AssignmentStatus::Failed)
        .map(|assignment| {
            format!(
                "- {}: {}",
                assignment.agent_type.display_name(),
                assignment.failure_reason.as_deref().unwrap_or("failed")
            )
        })
        .collect();
    if !failures.is_empty() {
        summary.push_str("\nNot completed:\n");
        summary.push_str(&failures.join("\n"));
    }
    if tally.completed > 0 {
        summary.push_str("\nThe specialists' reports are in the conversation above.");
    }
    summary
}

fn status_report(conversation: &Conversation) -> String {
    let tally = conversation.delegation_tally();
    let mut report = format!(
        "Delegation is finished: {} of {} tasks completed.",
        tally.completed, tally.total
    );
    for assignment in conversation.assignments() {
        report.push_str(&format!(
            "\n- {}: {}",
            assignment.agent_type.display_name(),
            match assignment.status {
                AssignmentStatus::Failed => format!(
                    "failed ({})",
                    assignment.failure_reason.as_deref().unwrap_or("no reason recorded")
                ),
                status => status.as_str().replace('_', " "),
            }
        ));
    }
    report
}
