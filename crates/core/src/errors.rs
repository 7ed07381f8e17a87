use std::time::Duration;

use thiserror::Error;

use crate::domain::agent::AgentType;
use crate::domain::conversation::{AssignmentStatus, ConversationId, ConversationPhase};
use crate::domain::tenant::SubscriptionTier;
use crate::flows::FlowTransitionError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: ConversationPhase, to: ConversationPhase },
    #[error("invalid assignment transition from {from:?} to {to:?}")]
    InvalidAssignmentTransition { from: AssignmentStatus, to: AssignmentStatus },
    #[error(transparent)]
    FlowTransition(#[from] FlowTransitionError),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("{}", access_denied_message(.agent_type, .requested, .tier, .required_tier))]
    AccessDenied {
        agent_type: Option<AgentType>,
        requested: String,
        tier: SubscriptionTier,
        required_tier: Option<SubscriptionTier>,
    },
    #[error("conversation `{conversation_id}` was not found")]
    NotFound { conversation_id: ConversationId },
    #[error("conversation store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("oracle did not answer within {}ms", .after.as_millis())]
    OracleTimeout { after: Duration },
    #[error("oracle failure: {0}")]
    Oracle(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

fn access_denied_message(
    agent_type: &Option<AgentType>,
    requested: &str,
    tier: &SubscriptionTier,
    required_tier: &Option<SubscriptionTier>,
) -> String {
    match (agent_type, required_tier) {
        (Some(agent), Some(required)) => format!(
            "The {} agent requires the {} plan or higher; your organization is on the {} plan. Upgrade to {} to use it.",
            agent.display_name(),
            required.display_name(),
            tier.display_name(),
            required.display_name()
        ),
        _ => format!("Agent type `{requested}` is not available on any subscription plan."),
    }
}

impl ApplicationError {
    /// True for errors returned directly to the calling collaborator.
    pub fn is_caller_visible(&self) -> bool {
        matches!(self, Self::AccessDenied { .. } | Self::NotFound { .. })
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &str {
        match self {
            Self::Forbidden { message, .. } => message,
            Self::NotFound { .. } => "The requested conversation does not exist.",
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Forbidden { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::BadRequest { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::Forbidden { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let unassigned = || "unassigned".to_owned();
        match value {
            denied @ ApplicationError::AccessDenied { .. } => {
                Self::Forbidden { message: denied.to_string(), correlation_id: unassigned() }
            }
            not_found @ ApplicationError::NotFound { .. } => {
                Self::NotFound { message: not_found.to_string(), correlation_id: unassigned() }
            }
            ApplicationError::Domain(_) => Self::BadRequest {
                message: "domain validation failed".to_owned(),
                correlation_id: unassigned(),
            },
            ApplicationError::StoreUnavailable(message) | ApplicationError::Oracle(message) => {
                Self::ServiceUnavailable { message, correlation_id: unassigned() }
            }
            timeout @ ApplicationError::OracleTimeout { .. } => Self::ServiceUnavailable {
                message: timeout.to_string(),
                correlation_id: unassigned(),
            },
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: unassigned() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::domain::agent::AgentType;
    use crate::domain::conversation::ConversationId;
    use crate::domain::tenant::SubscriptionTier;
    use crate::errors::{ApplicationError, DomainError, InterfaceError};

    #[test]
    fn access_denied_names_the_required_tier() {
        let error = ApplicationError::AccessDenied {
            agent_type: Some(AgentType::Analytics),
            requested: "analytics".to_owned(),
            tier: SubscriptionTier::Free,
            required_tier: Some(SubscriptionTier::Enterprise),
        };

        let message = error.to_string();
        assert!(message.contains("Analytics & Reporting"));
        assert!(message.contains("Enterprise plan"));
        assert!(message.contains("Free plan"));
        assert!(error.is_caller_visible());
    }

    #[test]
    fn unknown_agent_denial_is_still_descriptive() {
        let error = ApplicationError::AccessDenied {
            agent_type: None,
            requested: "catering".to_owned(),
            tier: SubscriptionTier::Enterprise,
            required_tier: None,
        };
        assert!(error.to_string().contains("`catering` is not available"));
    }

    #[test]
    fn access_denied_maps_to_forbidden_with_upgrade_message() {
        let interface = ApplicationError::AccessDenied {
            agent_type: Some(AgentType::Financial),
            requested: "financial".to_owned(),
            tier: SubscriptionTier::Free,
            required_tier: Some(SubscriptionTier::Professional),
        }
        .into_interface("req-1");

        assert!(matches!(interface, InterfaceError::Forbidden { .. }));
        assert_eq!(interface.correlation_id(), "req-1");
        assert!(interface.user_message().contains("Upgrade to Professional"));
    }

    #[test]
    fn not_found_maps_to_not_found() {
        let interface = ApplicationError::NotFound {
            conversation_id: ConversationId("conv-missing".to_owned()),
        }
        .into_interface("req-2");

        assert!(matches!(interface, InterfaceError::NotFound { .. }));
        assert_eq!(interface.user_message(), "The requested conversation does not exist.");
    }

    #[test]
    fn domain_error_maps_to_bad_request_interface_error() {
        let interface = ApplicationError::from(DomainError::InvariantViolation(
            "assignment outside implementation".to_owned(),
        ))
        .into_interface("req-3");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest {
                ref correlation_id,
                ..
            } if correlation_id == "req-3"
        ));
        assert!(!ApplicationError::Domain(DomainError::InvariantViolation(String::new()))
            .is_caller_visible());
    }

    #[test]
    fn store_and_oracle_failures_map_to_service_unavailable() {
        let store = ApplicationError::StoreUnavailable("database is locked".to_owned())
            .into_interface("req-4");
        let timeout = ApplicationError::OracleTimeout { after: Duration::from_millis(1500) }
            .into_interface("req-5");

        assert!(matches!(store, InterfaceError::ServiceUnavailable { .. }));
        assert!(matches!(timeout, InterfaceError::ServiceUnavailable { ref message, .. } if message.contains("1500ms")));
        assert_eq!(
            store.user_message(),
            "The service is temporarily unavailable. Please retry shortly."
        );
    }

    #[test]
    fn configuration_error_maps_to_internal() {
        let interface =
            ApplicationError::Configuration("missing llm model".to_owned()).into_interface("req-6");

        assert!(matches!(interface, InterfaceError::Internal { .. }));
        assert_eq!(interface.user_message(), "An unexpected internal error occurred.");
    }
}
