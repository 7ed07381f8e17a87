//! Agent Runtime - coordinator flow, delegation, and specialist agents
//!
//! This crate turns a user message into a coordinator (or specialist) reply:
//! - Extracts event requirements from free text (`requirements`)
//! - Decides when a proposal has been approved (`approval`)
//! - Builds tier-checked agent handles (`factory`)
//! - Sends tasks from the coordinator to specialists (`channel`)
//! - Plans and runs the delegation round (`planning`, `delegation`)
//!
//! # Architecture
//!
//! Every message goes through `AgentRuntime::handle_message`:
//! 1. **Gate** - the tenant's tier must include the addressed agent type
//! 2. **Checkout** - the conversation is leased from the tenant state cache
//! 3. **Phase step** - the coordinator advances the conversation flow,
//!    running a full delegation round once the proposal is approved
//! 4. **Commit** - critical changes are written through before returning
//!
//! # Key Types
//!
//! - `AgentRuntime` - entry point (see `runtime` module)
//! - `LlmClient` - pluggable oracle trait, `HttpLlmClient` for OpenAI/Anthropic/Ollama
//! - `ApprovalDetector` - swappable approval policy
//! - `AgentChannel` - the only path between agents
//!
//! # Safety Principle
//!
//! The oracle only writes text and suggests task lists. Phase changes, access
//! decisions and assignment outcomes are decided deterministically here.

pub mod approval;
pub mod channel;
pub mod delegation;
pub mod factory;
pub mod llm;
pub mod planning;
pub mod requirements;
pub mod runtime;

pub use approval::{ApprovalDetector, KeywordApprovalDetector, OracleApprovalDetector};
pub use channel::{AgentChannel, ChannelError, TaskReport, TaskRequest};
pub use delegation::{DelegationSettings, DelegationStateMachine, TIER_RESTRICTION};
pub use factory::{AgentFactory, AgentHandle};
pub use llm::{complete_within, HttpLlmClient, LlmClient};
pub use planning::{PlannedTask, TaskPlanner};
pub use requirements::RequirementExtractor;
pub use runtime::{AgentRuntime, ConversationTarget, MessageRequest, MessageResponse};
