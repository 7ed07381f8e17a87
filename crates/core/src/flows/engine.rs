use chrono::Utc;
use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::conversation::{Conversation, ConversationPhase};
use crate::errors::DomainError;
use crate::flows::states::{FlowAction, FlowContext, FlowEvent, FlowType, TransitionOutcome};

pub trait FlowDefinition {
    fn flow_type(&self) -> FlowType;
    fn initial_state(&self) -> ConversationPhase;
    fn transition(
        &self,
        current: &ConversationPhase,
        event: &FlowEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>;
}

/// information_collection -> proposal_review -> implementation -> monitoring.
#[derive(Clone, Debug, Default)]
pub struct PlanningFlow;

impl FlowDefinition for PlanningFlow {
    fn flow_type(&self) -> FlowType {
        FlowType::EventPlanning
    }

    fn initial_state(&self) -> ConversationPhase {
        ConversationPhase::InformationCollection
    }

    fn transition(
        &self,
        current: &ConversationPhase,
        event: &FlowEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        transition_planning(current, event, context)
    }
}

pub struct FlowEngine<F> {
    flow: F,
}

impl<F> FlowEngine<F>
where
    F: FlowDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn flow_type(&self) -> FlowType {
        self.flow.flow_type()
    }

    pub fn initial_state(&self) -> ConversationPhase {
        self.flow.initial_state()
    }

    pub fn apply(
        &self,
        current: &ConversationPhase,
        event: &FlowEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        self.flow.transition(current, event, context)
    }

    pub fn apply_with_audit<S>(
        &self,
        current: &ConversationPhase,
        event: &FlowEvent,
        context: &FlowContext,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply(current, event, context);
        match &result {
            Ok(outcome) => {
                sink.emit(
                    AuditEvent::new(
                        audit.tenant_id.clone(),
                        audit.conversation_id.clone(),
                        audit.correlation_id.clone(),
                        "flow.transition_applied",
                        AuditCategory::Flow,
                        audit.actor.clone(),
                        AuditOutcome::Success,
                    )
                    .with_metadata("from", outcome.from.as_str())
                    .with_metadata("to", outcome.to.as_str())
                    .with_metadata("event", format!("{:?}", outcome.event)),
                );
            }
            Err(error) => {
                sink.emit(
                    AuditEvent::new(
                        audit.tenant_id.clone(),
                        audit.conversation_id.clone(),
                        audit.correlation_id.clone(),
                        "flow.transition_rejected",
                        AuditCategory::Flow,
                        audit.actor.clone(),
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }

    /// Evaluates `event` against the conversation's current phase and, when the
    /// flow accepts it, moves the conversation to the resulting phase.
    pub fn advance<S>(
        &self,
        conversation: &mut Conversation,
        event: FlowEvent,
        context: &FlowContext,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, DomainError>
    where
        S: AuditSink + ?Sized,
    {
        let current = conversation.phase();
        let outcome = self.apply_with_audit(&current, &event, context, sink, audit)?;
        conversation.advance_to(outcome.to, Utc::now())?;
        Ok(outcome)
    }
}

impl Default for FlowEngine<PlanningFlow> {
    fn default() -> Self {
        Self::new(PlanningFlow)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("missing required fields before leaving {state}: {missing_fields:?}")]
    MissingRequiredFields { state: ConversationPhase, missing_fields: Vec<String> },
    #[error("{outstanding} assignment(s) still outstanding in {state}")]
    AssignmentsOutstanding { state: ConversationPhase, outstanding: usize },
    #[error("invalid transition from {state} using event {event:?}")]
    InvalidTransition { state: ConversationPhase, event: FlowEvent },
}

fn transition_planning(
    current: &ConversationPhase,
    event: &FlowEvent,
    context: &FlowContext,
) -> Result<TransitionOutcome, FlowTransitionError> {
    use ConversationPhase::{InformationCollection, Implementation, Monitoring, ProposalReview};
    use FlowAction::{DelegateTasks, InitializeAssignments, PresentProposal, ReportOutcome};
    use FlowEvent::{AssignmentsSettled, ProposalApproved, RequirementsGathered};

    let (to, actions) = match (current, event) {
        (InformationCollection, RequirementsGathered) => {
            if !context.missing_required_fields.is_empty() {
                return Err(FlowTransitionError::MissingRequiredFields {
                    state: *current,
                    missing_fields: context.missing_required_fields.clone(),
                });
            }
            (ProposalReview, vec![PresentProposal])
        }
        (ProposalReview, ProposalApproved) => {
            (Implementation, vec![InitializeAssignments, DelegateTasks])
        }
        (Implementation, AssignmentsSettled) => {
            if context.outstanding_assignments > 0 {
                return Err(FlowTransitionError::AssignmentsOutstanding {
                    state: *current,
                    outstanding: context.outstanding_assignments,
                });
            }
            (Monitoring, vec![ReportOutcome])
        }
        _ => {
            return Err(FlowTransitionError::InvalidTransition {
                state: *current,
                event: event.clone(),
            });
        }
    };

    Ok(TransitionOutcome { from: *current, to, event: event.clone(), actions })
}
