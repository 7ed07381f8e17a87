use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::AgentType;
use crate::domain::tenant::TenantId;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn generate() -> Self {
        Self(format!("conv-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Phases of the coordinator's delegation flow. Phases only ever move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationPhase {
    InformationCollection,
    ProposalReview,
    Implementation,
    Monitoring,
}

impl ConversationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InformationCollection => "information_collection",
            Self::ProposalReview => "proposal_review",
            Self::Implementation => "implementation",
            Self::Monitoring => "monitoring",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "information_collection" => Some(Self::InformationCollection),
            "proposal_review" => Some(Self::ProposalReview),
            "implementation" => Some(Self::Implementation),
            "monitoring" => Some(Self::Monitoring),
            _ => None,
        }
    }

    pub fn next(&self) -> Option<Self> {
        match self {
            Self::InformationCollection => Some(Self::ProposalReview),
            Self::ProposalReview => Some(Self::Implementation),
            Self::Implementation => Some(Self::Monitoring),
            Self::Monitoring => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.next().is_none()
    }
}

impl fmt::Display for ConversationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Agent,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub agent_type: Option<AgentType>,
}

impl Message {
    pub fn user(body: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self { role: MessageRole::User, body: body.into(), timestamp, agent_type: None }
    }

    pub fn agent(agent_type: AgentType, body: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self { role: MessageRole::Agent, body: body.into(), timestamp, agent_type: Some(agent_type) }
    }

    pub fn system(body: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self { role: MessageRole::System, body: body.into(), timestamp, agent_type: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssignmentId(pub String);

impl AssignmentId {
    pub fn generate() -> Self {
        Self(format!("asg-{}", Uuid::new_v4()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A unit of delegated work owned by exactly one conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAssignment {
    pub id: AssignmentId,
    pub agent_type: AgentType,
    pub task: String,
    pub status: AssignmentStatus,
    pub result: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentAssignment {
    pub fn pending(agent_type: AgentType, task: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: AssignmentId::generate(),
            agent_type,
            task: task.into(),
            status: AssignmentStatus::Pending,
            result: None,
            failure_reason: None,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn start(&mut self, at: DateTime<Utc>) -> Result<(), DomainError> {
        self.move_to(AssignmentStatus::InProgress, at)
    }

    pub fn complete(&mut self, result: impl Into<String>, at: DateTime<Utc>) -> Result<(), DomainError> {
        self.move_to(AssignmentStatus::Completed, at)?;
        self.result = Some(result.into());
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>, at: DateTime<Utc>) -> Result<(), DomainError> {
        self.move_to(AssignmentStatus::Failed, at)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    fn move_to(&mut self, next: AssignmentStatus, at: DateTime<Utc>) -> Result<(), DomainError> {
        let allowed = matches!(
            (self.status, next),
            (AssignmentStatus::Pending, AssignmentStatus::InProgress)
                | (AssignmentStatus::Pending, AssignmentStatus::Failed)
                | (AssignmentStatus::InProgress, AssignmentStatus::Completed)
                | (AssignmentStatus::InProgress, AssignmentStatus::Failed)
        );
        if !allowed {
            return Err(DomainError::InvalidAssignmentTransition { from: self.status, to: next });
        }
        self.status = next;
        self.updated_at = at;
        Ok(())
    }
}

/// Read-only snapshot of an entity owned by an external collaborator
/// (for example an event record). Never a live reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalContext {
    pub kind: String,
    pub reference: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ExternalContext {
    pub fn new(kind: impl Into<String>, reference: impl Into<String>) -> Self {
        Self { kind: kind.into(), reference: reference.into(), attributes: BTreeMap::new() }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Requirement keys gathered during `InformationCollection`.
pub mod requirement_fields {
    pub const EVENT_TYPE: &str = "event_type";
    pub const ATTENDEES: &str = "attendees";
    pub const BUDGET: &str = "budget";
    pub const TIMELINE: &str = "timeline";
    pub const LOCATION: &str = "location";

    pub const ALL: [&str; 5] = [EVENT_TYPE, ATTENDEES, BUDGET, TIMELINE, LOCATION];

    pub fn is_known(field: &str) -> bool {
        ALL.contains(&field)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationTally {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub outstanding: usize,
}

impl DelegationTally {
    pub fn settled(&self) -> bool {
        self.outstanding == 0
    }
}

/// Every field of a conversation, used to rebuild one from durable storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationParts {
    pub id: ConversationId,
    pub tenant_id: TenantId,
    pub phase: ConversationPhase,
    pub messages: Vec<Message>,
    pub assignments: Vec<AgentAssignment>,
    pub requirements: BTreeMap<String, String>,
    pub external_context: Option<ExternalContext>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One dialogue between a tenant's user and the coordinator.
///
/// The owning tenant is fixed at construction, messages are append-only, and
/// the phase can only advance one step at a time. Assignments may only be
/// recorded while the conversation is in `Implementation`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    tenant_id: TenantId,
    phase: ConversationPhase,
    messages: Vec<Message>,
    assignments: Vec<AgentAssignment>,
    pub requirements: BTreeMap<String, String>,
    pub external_context: Option<ExternalContext>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: ConversationId, tenant_id: TenantId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            tenant_id,
            phase: ConversationPhase::InformationCollection,
            messages: Vec::new(),
            assignments: Vec::new(),
            requirements: BTreeMap::new(),
            external_context: None,
            created_at,
            updated_at: created_at,
        }
    }

    pub fn from_parts(parts: ConversationParts) -> Self {
        Self {
            id: parts.id,
            tenant_id: parts.tenant_id,
            phase: parts.phase,
            messages: parts.messages,
            assignments: parts.assignments,
            requirements: parts.requirements,
            external_context: parts.external_context,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn phase(&self) -> ConversationPhase {
        self.phase
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn assignments(&self) -> &[AgentAssignment] {
        &self.assignments
    }

    pub fn append_message(&mut self, message: Message) {
        self.updated_at = self.updated_at.max(message.timestamp);
        self.messages.push(message);
    }

    /// Moves to the immediately following phase. Entering `Implementation`
    /// starts a fresh, empty assignment list.
    pub fn advance_to(
        &mut self,
        next: ConversationPhase,
        at: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if self.phase.next() != Some(next) {
            return Err(DomainError::InvalidPhaseTransition { from: self.phase, to: next });
        }
        if next == ConversationPhase::Implementation {
            self.assignments = Vec::new();
        }
        self.phase = next;
        self.updated_at = self.updated_at.max(at);
        Ok(())
    }

    pub fn add_assignment(
        &mut self,
        assignment: AgentAssignment,
    ) -> Result<&mut AgentAssignment, DomainError> {
        if self.phase != ConversationPhase::Implementation {
            return Err(DomainError::InvariantViolation(format!(
                "assignments can only be created during implementation (current phase: {})",
                self.phase
            )));
        }
        self.updated_at = self.updated_at.max(assignment.updated_at);
        self.assignments.push(assignment);
        let index = self.assignments.len() - 1;
        Ok(&mut self.assignments[index])
    }

    pub fn assignment_mut(&mut self, id: &AssignmentId) -> Option<&mut AgentAssignment> {
        self.assignments.iter_mut().find(|assignment| &assignment.id == id)
    }

    pub fn outstanding_assignment_ids(&self) -> Vec<AssignmentId> {
        self.assignments
            .iter()
            .filter(|assignment| !assignment.status.is_terminal())
            .map(|assignment| assignment.id.clone())
            .collect()
    }

    pub fn delegation_tally(&self) -> DelegationTally {
        let mut tally = DelegationTally { total: self.assignments.len(), ..DelegationTally::default() };
        for assignment in &self.assignments {
            match assignment.status {
                AssignmentStatus::Completed => tally.completed += 1,
                AssignmentStatus::Failed => tally.failed += 1,
                AssignmentStatus::Pending | AssignmentStatus::InProgress => tally.outstanding += 1,
            }
        }
        tally
    }

    pub fn missing_requirements<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .filter(|field| {
                self.requirements.get(field.as_str()).map(|value| value.trim().is_empty()).unwrap_or(true)
            })
            .map(String::as_str)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{
        AgentAssignment, AssignmentStatus, Conversation, ConversationId, ConversationPhase,
        Message,
    };
    use crate::domain::agent::AgentType;
    use crate::domain::tenant::TenantId;
    use crate::errors::DomainError;

    fn conversation() -> Conversation {
        Conversation::new(ConversationId("conv-1".to_string()), TenantId::new("acme"), Utc::now())
    }

    fn advance_to_implementation(conversation: &mut Conversation) {
        conversation
            .advance_to(ConversationPhase::ProposalReview, Utc::now())
            .expect("collection -> review");
        conversation
            .advance_to(ConversationPhase::Implementation, Utc::now())
            .expect("review -> implementation");
    }

    #[test]
    fn new_conversation_starts_in_information_collection() {
        let conversation = conversation();
        assert_eq!(conversation.phase(), ConversationPhase::InformationCollection);
        assert!(conversation.messages().is_empty());
        assert!(conversation.assignments().is_empty());
    }

    #[test]
    fn phases_cannot_skip_or_go_backwards() {
        let mut conversation = conversation();
        let skip = conversation
            .advance_to(ConversationPhase::Implementation, Utc::now())
            .expect_err("cannot skip proposal review");
        assert!(matches!(
            skip,
            DomainError::InvalidPhaseTransition {
                from: ConversationPhase::InformationCollection,
                to: ConversationPhase::Implementation
            }
        ));

        conversation.advance_to(ConversationPhase::ProposalReview, Utc::now()).expect("forward");
        let back = conversation
            .advance_to(ConversationPhase::InformationCollection, Utc::now())
            .expect_err("cannot go back");
        assert!(matches!(back, DomainError::InvalidPhaseTransition { .. }));
        assert_eq!(conversation.phase(), ConversationPhase::ProposalReview);
    }

    #[test]
    fn entering_implementation_yields_empty_assignment_list() {
        let mut conversation = conversation();
        advance_to_implementation(&mut conversation);

        assert_eq!(conversation.phase(), ConversationPhase::Implementation);
        assert_eq!(conversation.assignments().len(), 0);
        assert_eq!(conversation.delegation_tally().total, 0);
        assert!(conversation.delegation_tally().settled());
    }

    #[test]
    fn assignments_are_rejected_outside_implementation() {
        let mut conversation = conversation();
        let error = conversation
            .add_assignment(AgentAssignment::pending(AgentType::Financial, "budget", Utc::now()))
            .expect_err("assignment before implementation");
        assert!(matches!(error, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn assignment_lifecycle_and_tally() {
        let mut conversation = conversation();
        advance_to_implementation(&mut conversation);

        let first = conversation
            .add_assignment(AgentAssignment::pending(AgentType::Financial, "budget", Utc::now()))
            .expect("add")
            .id
            .clone();
        let second = conversation
            .add_assignment(AgentAssignment::pending(AgentType::Marketing, "promo", Utc::now()))
            .expect("add")
            .id
            .clone();

        let assignment = conversation.assignment_mut(&first).expect("first");
        assignment.start(Utc::now()).expect("start");
        assignment.complete("budget drafted", Utc::now()).expect("complete");

        let tally = conversation.delegation_tally();
        assert_eq!((tally.total, tally.completed, tally.outstanding), (2, 1, 1));
        assert_eq!(conversation.outstanding_assignment_ids(), vec![second.clone()]);

        conversation.assignment_mut(&second).expect("second").fail("timeout", Utc::now()).expect("fail");
        let tally = conversation.delegation_tally();
        assert_eq!((tally.completed, tally.failed), (1, 1));
        assert!(tally.settled());
    }

    #[test]
    fn terminal_assignment_cannot_transition_again() {
        let mut assignment = AgentAssignment::pending(AgentType::Analytics, "report", Utc::now());
        assignment.fail("tier restriction", Utc::now()).expect("pending -> failed");
        let error = assignment.start(Utc::now()).expect_err("failed is terminal");
        assert!(matches!(
            error,
            DomainError::InvalidAssignmentTransition {
                from: AssignmentStatus::Failed,
                to: AssignmentStatus::InProgress
            }
        ));
        assert_eq!(assignment.failure_reason.as_deref(), Some("tier restriction"));
    }

    #[test]
    fn missing_requirements_reports_absent_and_blank_fields() {
        let mut conversation = conversation();
        conversation.requirements.insert("event_type".to_string(), "conference".to_string());
        conversation.requirements.insert("budget".to_string(), " ".to_string());

        let required =
            vec!["event_type".to_string(), "budget".to_string(), "attendees".to_string()];
        assert_eq!(conversation.missing_requirements(&required), vec!["budget", "attendees"]);
    }
}
