use std::collections::BTreeMap;

use tracing::debug;

use eventcrew_core::domain::agent::AgentType;
use eventcrew_core::domain::conversation::ExternalContext;
use eventcrew_core::domain::tenant::{TenantContext, TenantId};
use eventcrew_core::errors::ApplicationError;
use eventcrew_core::gate::{AccessDecision, FeatureGate};

/// A tenant-bound agent instance. The external context is a snapshot taken
/// at creation time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentHandle {
    tenant_id: TenantId,
    agent_type: AgentType,
    external_context: Option<ExternalContext>,
}

impl AgentHandle {
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    pub fn external_context(&self) -> Option<&ExternalContext> {
        self.external_context.as_ref()
    }

    pub fn system_prompt(&self) -> String {
        let mut prompt = format!(
            "You are the {} agent of an event planning team. {}",
            self.agent_type.display_name(),
            role_brief(self.agent_type)
        );
        if let Some(context) = &self.external_context {
            prompt.push_str("\n\n");
            prompt.push_str(&describe_context(context));
        }
        prompt
    }

    /// Prompt for a delegated task. `answer` carries the coordinator's reply
    /// when the agent asked a follow-up question.
    pub fn task_prompt(
        &self,
        task: &str,
        requirements: &BTreeMap<String, String>,
        answer: Option<&str>,
    ) -> String {
        let mut prompt = self.system_prompt();
        prompt.push_str("\n\nEvent requirements:\n");
        prompt.push_str(&describe_requirements(requirements));
        prompt.push_str("\nTask from the coordinator: ");
        prompt.push_str(task);
        match answer {
            Some(answer) => {
                prompt.push_str("\n\nThe coordinator answered your question: ");
                prompt.push_str(answer);
                prompt.push_str("\nNow write your final report.");
            }
            None => prompt.push_str(
                "\n\nWrite a short report with concrete recommendations. If you cannot proceed \
                 without more information, reply with a single line starting with `QUESTION:`.",
            ),
        }
        prompt
    }

    /// Prompt for a user talking to this agent directly.
    pub fn chat_prompt(&self, requirements: &BTreeMap<String, String>, message: &str) -> String {
        let mut prompt = self.system_prompt();
        if !requirements.is_empty() {
            prompt.push_str("\n\nKnown event requirements:\n");
            prompt.push_str(&describe_requirements(requirements));
        }
        prompt.push_str("\nUser: ");
        prompt.push_str(message);
        prompt
    }
}

/// Builds agent handles, refusing any type the tenant's tier does not include.
#[derive(Clone, Debug, Default)]
pub struct AgentFactory {
    gate: FeatureGate,
}

impl AgentFactory {
    pub fn new(gate: FeatureGate) -> Self {
        Self { gate }
    }

    pub fn gate(&self) -> &FeatureGate {
        &self.gate
    }

    pub fn create(
        &self,
        tenant: &TenantContext,
        agent_type: AgentType,
        external_context: Option<&ExternalContext>,
    ) -> Result<AgentHandle, ApplicationError> {
        if let AccessDecision::Deny { required_tier, .. } = self.gate.evaluate(tenant.tier, agent_type)
        {
            return Err(ApplicationError::AccessDenied {
                agent_type: Some(agent_type),
                requested: agent_type.as_str().to_string(),
                tier: tenant.tier,
                required_tier,
            });
        }

        debug!(
            event_name = "agent.created",
            tenant_id = %tenant.tenant_id,
            agent_type = %agent_type,
            has_external_context = external_context.is_some(),
            "agent handle created"
        );

        Ok(AgentHandle {
            tenant_id: tenant.tenant_id.clone(),
            agent_type,
            external_context: external_context.cloned(),
        })
    }
}

fn role_brief(agent_type: AgentType) -> &'static str {
    match agent_type {
        AgentType::Coordinator => {
            "You gather the event requirements, present a plan, and delegate the work to \
             the specialists."
        }
        AgentType::ResourcePlanning => {
            "You source venues, vendors, equipment and staffing that fit the headcount and dates."
        }
        AgentType::Financial => {
            "You build the budget breakdown, track costs against it and flag overruns early."
        }
        AgentType::Stakeholder => {
            "You identify sponsors, speakers, VIPs and internal owners and plan how to keep \
             them informed."
        }
        AgentType::Marketing => {
            "You plan promotion, registration and attendee communications."
        }
        AgentType::ProjectManagement => {
            "You turn the plan into a timeline with milestones, owners and dependencies."
        }
        AgentType::Analytics => {
            "You define the success metrics and how attendance and engagement will be measured."
        }
        AgentType::ComplianceSecurity => {
            "You cover permits, insurance, accessibility, data protection and on-site security."
        }
    }
}

fn describe_requirements(requirements: &BTreeMap<String, String>) -> String {
    if requirements.is_empty() {
        return "- none recorded yet\n".to_string();
    }
    requirements.iter().map(|(field, value)| format!("- {field}: {value}\n")).collect()
}

fn describe_context(context: &ExternalContext) -> String {
    let mut description = format!("Linked {} record `{}`.", context.kind, context.reference);
    for (key, value) in &context.attributes {
        description.push_str(&format!("\n- {key}: {value}"));
    }
    description
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use eventcrew_core::domain::agent::AgentType;
    use eventcrew_core::domain::conversation::ExternalContext;
    use eventcrew_core::domain::tenant::{SubscriptionTier, TenantContext};
    use eventcrew_core::errors::ApplicationError;

    use super::AgentFactory;

    #[test]
    fn free_tier_cannot_create_financial_agent() {
        let factory = AgentFactory::default();
        let tenant = TenantContext::new("acme", SubscriptionTier::Free);

        let error = factory.create(&tenant, AgentType::Financial, None).expect_err("denied");
        assert_eq!(
            error,
            ApplicationError::AccessDenied {
                agent_type: Some(AgentType::Financial),
                requested: "financial".to_string(),
                tier: SubscriptionTier::Free,
                required_tier: Some(SubscriptionTier::Professional),
            }
        );
    }

    #[test]
    fn every_allowed_type_yields_a_tenant_bound_handle() {
        let factory = AgentFactory::default();
        for tier in SubscriptionTier::ALL {
            let tenant = TenantContext::new("acme", tier);
            for agent_type in AgentType::ALL {
                let result = factory.create(&tenant, agent_type, None);
                assert_eq!(result.is_ok(), factory.gate().is_allowed(tier, agent_type));
                if let Ok(handle) = result {
                    assert_eq!(handle.tenant_id().as_str(), "acme");
                    assert_eq!(handle.agent_type(), agent_type);
                }
            }
        }
    }

    #[test]
    fn handle_keeps_a_snapshot_of_external_context() {
        let factory = AgentFactory::default();
        let tenant = TenantContext::new("acme", SubscriptionTier::Professional);
        let mut context = ExternalContext::new("event", "evt-42").with_attribute("venue", "Hall A");

        let handle =
            factory.create(&tenant, AgentType::Marketing, Some(&context)).expect("create handle");
        context.attributes.insert("venue".to_string(), "Hall B".to_string());

        let snapshot = handle.external_context().expect("context");
        assert_eq!(snapshot.attributes.get("venue").map(String::as_str), Some("Hall A"));
        assert!(handle.system_prompt().contains("evt-42"));
    }

    #[test]
    fn task_prompt_switches_to_final_report_after_an_answer() {
        let factory = AgentFactory::default();
        let tenant = TenantContext::new("acme", SubscriptionTier::Professional);
        let handle = factory.create(&tenant, AgentType::Financial, None).expect("handle");
        let mut requirements = BTreeMap::new();
        requirements.insert("budget".to_string(), "$50,000".to_string());

        let first = handle.task_prompt("Draft the budget", &requirements, None);
        assert!(first.contains("QUESTION:"));
        assert!(first.contains("- budget: $50,000"));

        let second = handle.task_prompt("Draft the budget", &requirements, Some("200 people"));
        assert!(second.contains("200 people"));
        assert!(!second.contains("QUESTION:"));
    }
}
