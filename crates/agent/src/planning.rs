use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use eventcrew_core::domain::agent::AgentType;
use eventcrew_core::domain::conversation::requirement_fields as fields;

use crate::llm::{complete_within, LlmClient};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedTask {
    pub agent_type: AgentType,
    pub task: String,
}

#[derive(Deserialize)]
struct RawTask {
    #[serde(alias = "agent")]
    agent_type: String,
    #[serde(alias = "description")]
    task: String,
}

/// Turns the gathered requirements into a delegation task list.
pub struct TaskPlanner {
    oracle: Arc<dyn LlmClient>,
    timeout: Duration,
    max_tasks: usize,
}

impl TaskPlanner {
    pub fn new(oracle: Arc<dyn LlmClient>, timeout: Duration, max_tasks: usize) -> Self {
        Self { oracle, timeout, max_tasks }
    }

    /// Asks the oracle for a plan; falls back to [`default_plan`] when it fails
    /// or answers with nothing usable.
    pub async fn plan(&self, requirements: &BTreeMap<String, String>) -> Vec<PlannedTask> {
        let prompt = planning_prompt(requirements);
        let mut tasks = match complete_within(self.oracle.as_ref(), &prompt, self.timeout).await {
            Ok(raw) => parse_plan(&raw).unwrap_or_else(|| {
                warn!(event_name = "planning.unusable_plan", "oracle plan unusable; using default plan");
                default_plan(requirements)
            }),
            Err(error) => {
                warn!(
                    event_name = "planning.oracle_failed",
                    error = %error,
                    "oracle planning failed; using default plan"
                );
                default_plan(requirements)
            }
        };
        tasks.truncate(self.max_tasks);
        tasks
    }
}

/// Parses the first JSON array in `raw`. Entries naming an unknown agent type,
/// or the coordinator itself, are dropped. `None` when nothing usable is left.
pub fn parse_plan(raw: &str) -> Option<Vec<PlannedTask>> {
    let start = raw.find('[')?;
    let end = raw.rfind(']')?;
    if end < start {
        return None;
    }
    let entries: Vec<RawTask> = serde_json::from_str(&raw[start..=end]).ok()?;

    let tasks: Vec<PlannedTask> = entries
        .into_iter()
        .filter_map(|entry| {
            let task = entry.task.trim();
            match AgentType::parse(&entry.agent_type) {
                Some(agent_type) if !agent_type.is_coordinator() && !task.is_empty() => {
                    Some(PlannedTask { agent_type, task: task.to_string() })
                }
                _ => {
                    warn!(
                        event_name = "planning.task_dropped",
                        agent_type = %entry.agent_type,
                        "dropping planned task with unusable agent type"
                    );
                    None
                }
            }
        })
        .collect();

    (!tasks.is_empty()).then_some(tasks)
}

/// One task per specialist role, worded from the requirements.
pub fn default_plan(requirements: &BTreeMap<String, String>) -> Vec<PlannedTask> {
    let event = event_summary(requirements);
    AgentType::SPECIALISTS
        .into_iter()
        .map(|agent_type| PlannedTask { agent_type, task: default_task(agent_type, &event) })
        .collect()
}

fn default_task(agent_type: AgentType, event: &str) -> String {
    match agent_type {
        AgentType::ResourcePlanning => {
            format!("Shortlist venues, vendors and staffing for {event}.")
        }
        AgentType::Financial => format!("Draft a line-item budget for {event}."),
        AgentType::Stakeholder => {
            format!("Identify sponsors, speakers and internal owners for {event}.")
        }
        AgentType::Marketing => {
            format!("Outline promotion and attendee communications for {event}.")
        }
        AgentType::ProjectManagement => {
            format!("Build a milestone timeline with owners for {event}.")
        }
        AgentType::Analytics => format!("Define success metrics and reporting for {event}."),
        AgentType::ComplianceSecurity => {
            format!("List permits, insurance and security requirements for {event}.")
        }
        AgentType::Coordinator => format!("Coordinate {event}."),
    }
}

pub fn event_summary(requirements: &BTreeMap<String, String>) -> String {
    let get = |field: &str| requirements.get(field).map(String::as_str).filter(|v| !v.is_empty());

    let mut summary = format!("the {}", get(fields::EVENT_TYPE).unwrap_or("event"));
    if let Some(attendees) = get(fields::ATTENDEES) {
        summary.push_str(&format!(" for {attendees} attendees"));
    }
    if let Some(location) = get(fields::LOCATION) {
        summary.push_str(&format!(" in {location}"));
    }
    if let Some(timeline) = get(fields::TIMELINE) {
        summary.push_str(&format!(" ({timeline})"));
    }
    if let Some(budget) = get(fields::BUDGET) {
        summary.push_str(&format!(" with a budget of {budget}"));
    }
    summary
}

fn planning_prompt(requirements: &BTreeMap<String, String>) -> String {
    let roles: Vec<&str> = AgentType::SPECIALISTS.iter().map(AgentType::as_str).collect();
    let mut prompt = String::from(
        "You coordinate a team of event planning specialists. Split the work for the event below \
         into tasks. Respond with only a JSON array of objects with the keys `agent_type` and \
         `task`.\n",
    );
    prompt.push_str(&format!("Valid agent types: {}.\n", roles.join(", ")));
    prompt.push_str("Event requirements:\n");
    for (field, value) in requirements {
        prompt.push_str(&format!("- {field}: {value}\n"));
    }
    prompt
}
