use eventcrew_core::audit::{AuditEvent, AuditOutcome, AuditSink};
use tracing::{info, warn};

/// Emits audit events as structured log records under the `audit` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        let conversation_id =
            event.conversation_id.as_ref().map(|id| id.0.as_str()).unwrap_or("unknown");
        let metadata = serde_json::to_string(&event.metadata).unwrap_or_default();

        match event.outcome {
            AuditOutcome::Success => info!(
                target: "audit",
                event_name = %event.event_type,
                event_id = %event.event_id,
                category = ?event.category,
                tenant_id = %event.tenant_id,
                conversation_id,
                correlation_id = %event.correlation_id,
                actor = %event.actor,
                metadata = %metadata,
                "audit event"
            ),
            AuditOutcome::Rejected | AuditOutcome::Failed => warn!(
                target: "audit",
                event_name = %event.event_type,
                event_id = %event.event_id,
                category = ?event.category,
                outcome = ?event.outcome,
                tenant_id = %event.tenant_id,
                conversation_id,
                correlation_id = %event.correlation_id,
                actor = %event.actor,
                metadata = %metadata,
                "audit event"
            ),
        }
    }
}
