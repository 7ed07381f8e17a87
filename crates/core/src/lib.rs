pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;
pub mod gate;

pub use audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink};
pub use domain::agent::AgentType;
pub use domain::conversation::{
    AgentAssignment, AssignmentId, AssignmentStatus, Conversation, ConversationId,
    ConversationParts, ConversationPhase, DelegationTally, ExternalContext, Message, MessageRole,
};
pub use domain::tenant::{SubscriptionTier, TenantContext, TenantId};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use gate::{AccessDecision, FeatureGate};
