use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::llm::{complete_within, LlmClient};

/// Decides whether a user message approves the current proposal.
#[async_trait]
pub trait ApprovalDetector: Send + Sync {
    async fn is_approval(&self, message: &str) -> bool;
}

pub const DEFAULT_APPROVAL_PHRASES: &[&str] = &[
    "approve",
    "approved",
    "looks good",
    "go ahead",
    "lgtm",
    "sounds good",
    "let's do it",
];

const NEGATIONS: &[&str] = &[
    "not", "no", "don't", "dont", "never", "cannot", "can't", "cant", "won't", "wont", "isn't",
    "doesn't", "without", "hold",
];

/// Lookback, in tokens, for a negation in front of a matched phrase.
const NEGATION_WINDOW: usize = 3;

#[derive(Clone, Debug)]
pub struct KeywordApprovalDetector {
    phrases: Vec<Vec<String>>,
}

impl Default for KeywordApprovalDetector {
    fn default() -> Self {
        Self::with_phrases(DEFAULT_APPROVAL_PHRASES.iter().copied())
    }
}

impl KeywordApprovalDetector {
    pub fn with_phrases<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let phrases = phrases
            .into_iter()
            .map(|phrase| tokenize(phrase.as_ref()))
            .filter(|tokens| !tokens.is_empty())
            .collect();
        Self { phrases }
    }

    /// True when any approval phrase appears without a negation just before it.
    pub fn matches(&self, message: &str) -> bool {
        let tokens = tokenize(message);
        self.phrases.iter().any(|phrase| {
            tokens
                .windows(phrase.len())
                .enumerate()
                .any(|(start, window)| window == phrase.as_slice() && !negated(&tokens, start))
        })
    }
}

#[async_trait]
impl ApprovalDetector for KeywordApprovalDetector {
    async fn is_approval(&self, message: &str) -> bool {
        self.matches(message)
    }
}

fn negated(tokens: &[String], start: usize) -> bool {
    let from = start.saturating_sub(NEGATION_WINDOW);
    tokens[from..start].iter().any(|token| NEGATIONS.contains(&token.as_str()))
}

fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase().replace(['\u{2019}', '\u{2018}'], "'");
    lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|token| token.trim_matches('\''))
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Asks the oracle for a yes/no verdict. Anything other than a clear "yes",
/// including a timeout, counts as not approved.
pub struct OracleApprovalDetector {
    oracle: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl OracleApprovalDetector {
    pub fn new(oracle: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { oracle, timeout }
    }
}

#[async_trait]
impl ApprovalDetector for OracleApprovalDetector {
    async fn is_approval(&self, message: &str) -> bool {
        let prompt = format!(
            "An event planning assistant has just shown the user a proposal. \
             Does the user's reply approve the proposal? Answer with a single word, yes or no.\n\n\
             Reply: {message}"
        );
        match complete_within(self.oracle.as_ref(), &prompt, self.timeout).await {
            Ok(verdict) => verdict.trim().to_ascii_lowercase().starts_with("yes"),
            Err(error) => {
                warn!(event_name = "approval.oracle_failed", error = %error, "approval check failed");
                false
            }
        }
    }
}
