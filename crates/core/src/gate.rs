//! Subscription-tier feature gate.
//!
//! The capability table is static: each tier inherits everything the tier
//! below it allows. Unknown agent names are denied, and a denial is a value
//! the caller branches on, never an error.

use crate::domain::agent::AgentType;
use crate::domain::tenant::SubscriptionTier;

const FREE_AGENTS: &[AgentType] = &[AgentType::Coordinator, AgentType::ResourcePlanning];

const PROFESSIONAL_AGENTS: &[AgentType] = &[
    AgentType::Coordinator,
    AgentType::ResourcePlanning,
    AgentType::Financial,
    AgentType::Stakeholder,
    AgentType::Marketing,
    AgentType::ProjectManagement,
];

const ENTERPRISE_AGENTS: &[AgentType] = &AgentType::ALL;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    Deny { reason_code: &'static str, required_tier: Option<SubscriptionTier>, user_message: String },
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeatureGate;

impl FeatureGate {
    pub fn allowed_agents(&self, tier: SubscriptionTier) -> &'static [AgentType] {
        match tier {
            SubscriptionTier::Free => FREE_AGENTS,
            SubscriptionTier::Professional => PROFESSIONAL_AGENTS,
            SubscriptionTier::Enterprise => ENTERPRISE_AGENTS,
        }
    }

    pub fn is_allowed(&self, tier: SubscriptionTier, agent_type: AgentType) -> bool {
        self.allowed_agents(tier).contains(&agent_type)
    }

    /// Name-based variant for input that has not been parsed yet. Anything
    /// outside the eight known roles is denied.
    pub fn is_allowed_name(&self, tier: SubscriptionTier, agent_name: &str) -> bool {
        AgentType::parse(agent_name).map(|agent| self.is_allowed(tier, agent)).unwrap_or(false)
    }

    pub fn minimum_tier(&self, agent_type: AgentType) -> SubscriptionTier {
        SubscriptionTier::ALL
            .into_iter()
            .find(|tier| self.is_allowed(*tier, agent_type))
            .unwrap_or(SubscriptionTier::Enterprise)
    }

    pub fn evaluate(&self, tier: SubscriptionTier, agent_type: AgentType) -> AccessDecision {
        if self.is_allowed(tier, agent_type) {
            return AccessDecision::Allow;
        }

        let required = self.minimum_tier(agent_type);
        AccessDecision::Deny {
            reason_code: "tier_restriction",
            required_tier: Some(required),
            user_message: format!(
                "The {} agent is available on the {} plan and above. Upgrade from {} to {} to use it.",
                agent_type.display_name(),
                required.display_name(),
                tier.display_name(),
                required.display_name()
            ),
        }
    }

    pub fn evaluate_name(&self, tier: SubscriptionTier, agent_name: &str) -> AccessDecision {
        match AgentType::parse(agent_name) {
            Some(agent_type) => self.evaluate(tier, agent_type),
            None => AccessDecision::Deny {
                reason_code: "unknown_agent_type",
                required_tier: None,
                user_message: format!("Agent type `{}` is not available.", agent_name.trim()),
            },
        }
    }
}
