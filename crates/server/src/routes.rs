use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use eventcrew_agent::{AgentRuntime, ConversationTarget, MessageRequest, MessageResponse};
use eventcrew_core::domain::agent::AgentType;
use eventcrew_core::domain::conversation::ExternalContext;
use eventcrew_core::domain::tenant::{SubscriptionTier, TenantContext};
use eventcrew_core::errors::InterfaceError;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct MessageState {
    pub runtime: Arc<AgentRuntime>,
}

/// Body of `POST /v1/messages`. A missing `conversation_id` (or `"new"`)
/// starts a conversation; a missing `agent_type` addresses the coordinator.
#[derive(Clone, Debug, Deserialize)]
pub struct MessagePayload {
    pub tenant_id: String,
    pub tier: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    pub text: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub external_context: Option<ExternalContext>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug)]
pub struct ApiError(pub InterfaceError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, detail) = match &self.0 {
            InterfaceError::Forbidden { .. } => (StatusCode::FORBIDDEN, "forbidden", None),
            InterfaceError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found", None),
            InterfaceError::BadRequest { message, .. } => {
                (StatusCode::BAD_REQUEST, "bad_request", Some(message.clone()))
            }
            InterfaceError::ServiceUnavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", None)
            }
            InterfaceError::Internal { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", None)
            }
        };

        let body = ErrorBody {
            error: code,
            message: self.0.user_message().to_string(),
            correlation_id: self.0.correlation_id().to_string(),
            detail,
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: MessageState) -> Router {
    Router::new().route("/v1/messages", post(handle_message)).with_state(state)
}

pub async fn handle_message(
    State(state): State<MessageState>,
    Json(payload): Json<MessagePayload>,
) -> Result<Json<MessageResponse>, ApiError> {
    let correlation_id =
        payload.correlation_id.clone().unwrap_or_else(|| format!("req-{}", Uuid::new_v4()));
    let request = into_request(payload, &correlation_id)?;

    info!(
        event_name = "http.message_received",
        correlation_id = %correlation_id,
        tenant_id = %request.tenant.tenant_id,
        agent_type = %request.agent_type,
        "message received"
    );

    match state.runtime.handle_message(request).await {
        Ok(response) => Ok(Json(response)),
        Err(error) if error.is_caller_visible() => {
            info!(
                event_name = "http.message_rejected",
                correlation_id = %correlation_id,
                error = %error,
                "message rejected"
            );
            Err(ApiError(error.into_interface(correlation_id)))
        }
        Err(error) => {
            warn!(
                event_name = "http.message_failed",
                correlation_id = %correlation_id,
                error = %error,
                "message handling failed"
            );
            Err(ApiError(error.into_interface(correlation_id)))
        }
    }
}

fn into_request(payload: MessagePayload, correlation_id: &str) -> Result<MessageRequest, ApiError> {
    let bad_request = |message: String| {
        ApiError(InterfaceError::BadRequest { message, correlation_id: correlation_id.to_string() })
    };

    let tenant_id = payload.tenant_id.trim();
    if tenant_id.is_empty() {
        return Err(bad_request("tenant_id must not be empty".to_string()));
    }
    let tier = SubscriptionTier::parse(&payload.tier).ok_or_else(|| {
        bad_request(format!(
            "unknown tier `{}` (expected free|professional|enterprise)",
            payload.tier.trim()
        ))
    })?;

    Ok(MessageRequest {
        tenant: TenantContext::new(tenant_id, tier),
        conversation: payload
            .conversation_id
            .as_deref()
            .map(ConversationTarget::parse)
            .unwrap_or(ConversationTarget::New),
        agent_type: payload
            .agent_type
            .unwrap_or_else(|| AgentType::Coordinator.as_str().to_string()),
        text: payload.text,
        correlation_id: Some(correlation_id.to_string()),
        external_context: payload.external_context,
    })
}
