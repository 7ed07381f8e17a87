use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};
use tracing::warn;

use eventcrew_core::domain::conversation::{
    AgentAssignment, Conversation, ConversationId, ConversationParts, ConversationPhase,
    ExternalContext, Message,
};
use eventcrew_core::domain::tenant::TenantId;

use super::{ConversationMutation, ConversationRepository, RepositoryError};
use crate::DbPool;

const SELECT_COLUMNS: &str = "SELECT
        tenant_id,
        id,
        phase,
        messages_json,
        assignments_json,
        requirements_json,
        external_context_json,
        created_at,
        updated_at
     FROM conversation";

const UPSERT_SQL: &str = "INSERT INTO conversation (
        tenant_id,
        id,
        phase,
        messages_json,
        assignments_json,
        requirements_json,
        external_context_json,
        created_at,
        updated_at
     ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
     ON CONFLICT(tenant_id, id) DO UPDATE SET
        phase = excluded.phase,
        messages_json = excluded.messages_json,
        assignments_json = excluded.assignments_json,
        requirements_json = excluded.requirements_json,
        external_context_json = excluded.external_context_json,
        updated_at = excluded.updated_at";

pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ConversationRepository for SqlConversationRepository {
    async fn load_all_for_tenant(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<Conversation>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE tenant_id = ? ORDER BY created_at ASC, id ASC"
        ))
        .bind(tenant_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut conversations = Vec::with_capacity(rows.len());
        for row in rows {
            let row_id = row.try_get::<String, _>("id").unwrap_or_default();
            match conversation_from_row(&row) {
                Ok(conversation) => conversations.push(conversation),
                Err(error) => warn!(
                    event_name = "store.record_skipped",
                    tenant_id = %tenant_id,
                    conversation_id = %row_id,
                    error = %error,
                    "skipping unreadable conversation record"
                ),
            }
        }

        Ok(conversations)
    }

    async fn load_one(
        &self,
        tenant_id: &TenantId,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE tenant_id = ? AND id = ?"))
            .bind(tenant_id.as_str())
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn upsert(&self, conversation: &Conversation) -> Result<(), RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        write_conversation(&mut *conn, conversation).await
    }

    async fn read_modify_write(
        &self,
        tenant_id: &TenantId,
        id: &ConversationId,
        mutation: ConversationMutation,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE tenant_id = ? AND id = ?"))
            .bind(tenant_id.as_str())
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let mut conversation = conversation_from_row(&row)?;
        mutation(&mut conversation)?;
        write_conversation(&mut *tx, &conversation).await?;
        tx.commit().await?;

        Ok(Some(conversation))
    }
}

async fn write_conversation(
    conn: &mut SqliteConnection,
    conversation: &Conversation,
) -> Result<(), RepositoryError> {
    let external_context_json =
        conversation.external_context.as_ref().map(encode_json).transpose()?;

    sqlx::query(UPSERT_SQL)
        .bind(conversation.tenant_id().as_str())
        .bind(conversation.id.as_str())
        .bind(conversation.phase().as_str())
        .bind(encode_json(&conversation.messages())?)
        .bind(encode_json(&conversation.assignments())?)
        .bind(encode_json(&conversation.requirements)?)
        .bind(external_context_json)
        .bind(conversation.created_at.to_rfc3339())
        .bind(conversation.updated_at.to_rfc3339())
        .execute(conn)
        .await?;

    Ok(())
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation, RepositoryError> {
    let phase_raw = row.try_get::<String, _>("phase")?;
    let phase = ConversationPhase::parse(&phase_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown conversation phase `{phase_raw}`")))?;

    let messages: Vec<Message> = decode_json("messages_json", row.try_get("messages_json")?)?;
    let assignments: Vec<AgentAssignment> =
        decode_json("assignments_json", row.try_get("assignments_json")?)?;
    let requirements: BTreeMap<String, String> =
        decode_json("requirements_json", row.try_get("requirements_json")?)?;
    let external_context: Option<ExternalContext> = row
        .try_get::<Option<String>, _>("external_context_json")?
        .map(|raw| decode_json("external_context_json", raw))
        .transpose()?;

    Ok(Conversation::from_parts(ConversationParts {
        id: ConversationId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        phase,
        messages,
        assignments,
        requirements,
        external_context,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    }))
}

fn encode_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|error| RepositoryError::Decode(format!("could not encode record: {error}")))
}

fn decode_json<T: serde::de::DeserializeOwned>(
    column: &str,
    value: String,
) -> Result<T, RepositoryError> {
    serde_json::from_str(&value)
        .map_err(|error| RepositoryError::Decode(format!("invalid json in `{column}` ({error})")))
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use eventcrew_core::domain::agent::AgentType;
    use eventcrew_core::domain::conversation::{
        AgentAssignment, AssignmentStatus, Conversation, ConversationId, ConversationPhase,
        ExternalContext, Message,
    };
    use eventcrew_core::domain::tenant::TenantId;
    use eventcrew_core::errors::DomainError;

    use super::SqlConversationRepository;
    use crate::repositories::{ConversationRepository, RepositoryError};
    use crate::{connect_with_settings, migrations::run_pending, DbPool};

    async fn setup() -> (DbPool, SqlConversationRepository) {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("migrations");
        (pool.clone(), SqlConversationRepository::new(pool))
    }

    fn sample(tenant: &str, id: &str) -> Conversation {
        let mut conversation =
            Conversation::new(ConversationId(id.to_string()), TenantId::new(tenant), Utc::now());
        conversation.append_message(Message::user("Plan a 200-person conference", Utc::now()));
        conversation.append_message(Message::agent(
            AgentType::Coordinator,
            "What is the budget?",
            Utc::now(),
        ));
        conversation.requirements.insert("attendees".to_string(), "200".to_string());
        conversation.external_context = Some(
            ExternalContext::new("event", "evt-9").with_attribute("venue", "Hall B"),
        );
        conversation
    }

    #[tokio::test]
    async fn upsert_then_load_one_restores_every_field() {
        let (_pool, repo) = setup().await;
        let mut conversation = sample("acme", "conv-1");
        conversation.advance_to(ConversationPhase::ProposalReview, Utc::now()).expect("review");
        conversation
            .advance_to(ConversationPhase::Implementation, Utc::now())
            .expect("implementation");
        conversation
            .add_assignment(AgentAssignment::pending(AgentType::Financial, "budget", Utc::now()))
            .expect("assignment");

        repo.upsert(&conversation).await.expect("upsert");
        let loaded = repo
            .load_one(&TenantId::new("acme"), &conversation.id)
            .await
            .expect("load")
            .expect("present");

        assert_eq!(loaded.phase(), ConversationPhase::Implementation);
        assert_eq!(loaded.messages(), conversation.messages());
        assert_eq!(loaded.assignments()[0].status, AssignmentStatus::Pending);
        assert_eq!(loaded.requirements, conversation.requirements);
        assert_eq!(loaded.external_context, conversation.external_context);
    }

    #[tokio::test]
    async fn upsert_replaces_instead_of_duplicating() {
        let (pool, repo) = setup().await;
        let mut conversation = sample("acme", "conv-1");
        repo.upsert(&conversation).await.expect("first upsert");
        conversation.append_message(Message::user("Budget is $50k", Utc::now()));
        repo.upsert(&conversation).await.expect("second upsert");

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversation")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(count, 1);

        let loaded = repo
            .load_one(&TenantId::new("acme"), &conversation.id)
            .await
            .expect("load")
            .expect("present");
        assert_eq!(loaded.messages().len(), 3);
    }

    #[tokio::test]
    async fn records_are_scoped_by_tenant() {
        let (_pool, repo) = setup().await;
        repo.upsert(&sample("acme", "conv-1")).await.expect("acme");
        repo.upsert(&sample("globex", "conv-2")).await.expect("globex");

        let acme = repo.load_all_for_tenant(&TenantId::new("acme")).await.expect("load acme");
        assert_eq!(acme.len(), 1);
        assert_eq!(acme[0].tenant_id().as_str(), "acme");

        let cross = repo
            .load_one(&TenantId::new("acme"), &ConversationId("conv-2".to_string()))
            .await
            .expect("cross-tenant lookup");
        assert!(cross.is_none());
    }

    #[tokio::test]
    async fn corrupt_rows_are_skipped_during_warm_up() {
        let (pool, repo) = setup().await;
        repo.upsert(&sample("acme", "conv-good")).await.expect("good");
        sqlx::query(
            "INSERT INTO conversation (tenant_id, id, phase, messages_json, assignments_json,
                requirements_json, external_context_json, created_at, updated_at)
             VALUES ('acme', 'conv-bad', 'implementation', '{not json', '[]', '{}', NULL,
                '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .expect("insert corrupt row");

        let loaded = repo.load_all_for_tenant(&TenantId::new("acme")).await.expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id.as_str(), "conv-good");

        let direct = repo
            .load_one(&TenantId::new("acme"), &ConversationId("conv-bad".to_string()))
            .await
            .expect_err("direct load of corrupt row");
        assert!(matches!(direct, RepositoryError::Decode(_)));
    }

    #[tokio::test]
    async fn read_modify_write_commits_mutation() {
        let (_pool, repo) = setup().await;
        let conversation = sample("acme", "conv-1");
        repo.upsert(&conversation).await.expect("upsert");

        let updated = repo
            .read_modify_write(
                &TenantId::new("acme"),
                &conversation.id,
                Box::new(|conversation| {
                    conversation.advance_to(ConversationPhase::ProposalReview, Utc::now())
                }),
            )
            .await
            .expect("rmw")
            .expect("present");
        assert_eq!(updated.phase(), ConversationPhase::ProposalReview);

        let loaded = repo
            .load_one(&TenantId::new("acme"), &conversation.id)
            .await
            .expect("load")
            .expect("present");
        assert_eq!(loaded.phase(), ConversationPhase::ProposalReview);
    }

    #[tokio::test]
    async fn read_modify_write_leaves_record_untouched_on_rejection() {
        let (_pool, repo) = setup().await;
        let conversation = sample("acme", "conv-1");
        repo.upsert(&conversation).await.expect("upsert");

        let error = repo
            .read_modify_write(
                &TenantId::new("acme"),
                &conversation.id,
                Box::new(|conversation| {
                    conversation.append_message(Message::system("partial", Utc::now()));
                    Err(DomainError::InvariantViolation("rejected".to_string()))
                }),
            )
            .await
            .expect_err("mutation rejected");
        assert!(matches!(error, RepositoryError::Mutation(_)));

        let loaded = repo
            .load_one(&TenantId::new("acme"), &conversation.id)
            .await
            .expect("load")
            .expect("present");
        assert_eq!(loaded.messages().len(), 2);

        let missing = repo
            .read_modify_write(
                &TenantId::new("acme"),
                &ConversationId("conv-missing".to_string()),
                Box::new(|_| Ok(())),
            )
            .await
            .expect("missing rmw");
        assert!(missing.is_none());
    }
}
