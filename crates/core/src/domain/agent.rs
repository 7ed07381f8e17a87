use std::fmt;

use serde::{Deserialize, Serialize};

/// The eight planning roles. `Coordinator` drives the conversation and is the
/// only role that delegates; every other role is a specialist.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Coordinator,
    ResourcePlanning,
    Financial,
    Stakeholder,
    Marketing,
    ProjectManagement,
    Analytics,
    ComplianceSecurity,
}

impl AgentType {
    pub const ALL: [AgentType; 8] = [
        Self::Coordinator,
        Self::ResourcePlanning,
        Self::Financial,
        Self::Stakeholder,
        Self::Marketing,
        Self::ProjectManagement,
        Self::Analytics,
        Self::ComplianceSecurity,
    ];

    pub const SPECIALISTS: [AgentType; 7] = [
        Self::ResourcePlanning,
        Self::Financial,
        Self::Stakeholder,
        Self::Marketing,
        Self::ProjectManagement,
        Self::Analytics,
        Self::ComplianceSecurity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::ResourcePlanning => "resource_planning",
            Self::Financial => "financial",
            Self::Stakeholder => "stakeholder",
            Self::Marketing => "marketing",
            Self::ProjectManagement => "project_management",
            Self::Analytics => "analytics",
            Self::ComplianceSecurity => "compliance_security",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Self::ALL.into_iter().find(|agent| agent.as_str() == normalized)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Coordinator => "Event Coordinator",
            Self::ResourcePlanning => "Resource Planning",
            Self::Financial => "Financial Planning",
            Self::Stakeholder => "Stakeholder Management",
            Self::Marketing => "Marketing & Communications",
            Self::ProjectManagement => "Project Management",
            Self::Analytics => "Analytics & Reporting",
            Self::ComplianceSecurity => "Compliance & Security",
        }
    }

    pub fn is_coordinator(&self) -> bool {
        matches!(self, Self::Coordinator)
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
