//! Coordinator-to-specialist task exchange.
//!
//! A send is one request/response round trip through the oracle, bounded by
//! the configured timeout. A specialist may ask one `QUESTION:` back; the
//! coordinator answers from the recorded requirements and the specialist's
//! next reply is taken as its report.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use eventcrew_core::domain::agent::AgentType;
use eventcrew_core::domain::tenant::TenantId;

use crate::factory::AgentHandle;
use crate::llm::LlmClient;

const QUESTION_PREFIX: &str = "question:";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("no reply within {}ms", .after.as_millis())]
    Timeout { after: Duration },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("agents belong to different tenants (`{from}` -> `{to}`)")]
    TenantMismatch { from: TenantId, to: TenantId },
    #[error("`{0}` cannot delegate; only the coordinator sends tasks")]
    NotCoordinator(AgentType),
}

impl ChannelError {
    /// Short reason recorded on a failed assignment.
    pub fn failure_reason(&self) -> String {
        match self {
            Self::Timeout { .. } => "timeout".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskRequest {
    pub task: String,
    pub requirements: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskReport {
    pub agent_type: AgentType,
    pub body: String,
    /// The specialist's follow-up question, if it asked one.
    pub follow_up: Option<String>,
}

pub struct AgentChannel {
    oracle: Arc<dyn LlmClient>,
    send_timeout: Duration,
}

impl AgentChannel {
    pub fn new(oracle: Arc<dyn LlmClient>, send_timeout: Duration) -> Self {
        Self { oracle, send_timeout }
    }

    pub async fn send(
        &self,
        from: &AgentHandle,
        to: &AgentHandle,
        request: &TaskRequest,
    ) -> Result<TaskReport, ChannelError> {
        if !from.agent_type().is_coordinator() {
            return Err(ChannelError::NotCoordinator(from.agent_type()));
        }
        if from.tenant_id() != to.tenant_id() {
            return Err(ChannelError::TenantMismatch {
                from: from.tenant_id().clone(),
                to: to.tenant_id().clone(),
            });
        }

        match tokio::time::timeout(self.send_timeout, self.exchange(to, request)).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout { after: self.send_timeout }),
        }
    }

    async fn exchange(
        &self,
        to: &AgentHandle,
        request: &TaskRequest,
    ) -> Result<TaskReport, ChannelError> {
        let first = self.ask(&to.task_prompt(&request.task, &request.requirements, None)).await?;
        let Some(question) = parse_question(&first) else {
            return Ok(TaskReport { agent_type: to.agent_type(), body: first, follow_up: None });
        };

        debug!(
            event_name = "channel.follow_up",
            agent_type = %to.agent_type(),
            question = %question,
            "specialist asked for more information"
        );
        let answer = answer_from_requirements(&request.requirements);
        let prompt = to.task_prompt(&request.task, &request.requirements, Some(&answer));
        let body = self.ask(&prompt).await?;

        Ok(TaskReport { agent_type: to.agent_type(), body, follow_up: Some(question) })
    }

    async fn ask(&self, prompt: &str) -> Result<String, ChannelError> {
        let reply = self
            .oracle
            .complete(prompt)
            .await
            .map_err(|error| ChannelError::Transport(error.to_string()))?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(ChannelError::Transport("agent returned an empty reply".to_string()));
        }
        Ok(reply.to_string())
    }
}

fn parse_question(reply: &str) -> Option<String> {
    let trimmed = reply.trim_start();
    let prefix = trimmed.get(..QUESTION_PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(QUESTION_PREFIX) {
        return None;
    }
    let question = trimmed[QUESTION_PREFIX.len()..].trim();
    Some(if question.is_empty() { "(no question text)".to_string() } else { question.to_string() })
}

fn answer_from_requirements(requirements: &BTreeMap<String, String>) -> String {
    if requirements.is_empty() {
        return "Nothing more is known yet. Make reasonable assumptions and state them in the report."
            .to_string();
    }
    let known: Vec<String> =
        requirements.iter().map(|(field, value)| format!("{field}: {value}")).collect();
    format!(
        "Everything recorded so far is {}. Anything else is open; state your assumptions.",
        known.join("; ")
    )
}
