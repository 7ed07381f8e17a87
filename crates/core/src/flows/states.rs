use serde::{Deserialize, Serialize};

use crate::domain::conversation::{Conversation, ConversationPhase};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowType {
    EventPlanning,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowEvent {
    RequirementsGathered,
    ProposalApproved,
    AssignmentsSettled,
}

/// Facts about the conversation the flow needs to guard its transitions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FlowContext {
    pub missing_required_fields: Vec<String>,
    pub outstanding_assignments: usize,
}

impl FlowContext {
    pub fn for_conversation(conversation: &Conversation, required_fields: &[String]) -> Self {
        Self {
            missing_required_fields: conversation
                .missing_requirements(required_fields)
                .into_iter()
                .map(str::to_owned)
                .collect(),
            outstanding_assignments: conversation.delegation_tally().outstanding,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowAction {
    PresentProposal,
    InitializeAssignments,
    DelegateTasks,
    ReportOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: ConversationPhase,
    pub to: ConversationPhase,
    pub event: FlowEvent,
    pub actions: Vec<FlowAction>,
}
