use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::Row;

use signoff_core::audit::{AuditAction, AuditActorType, AuditEntry};
use signoff_core::domain::request::RequestId;

use super::{AuditRepository, RepositoryError};
use crate::DbPool;

pub struct SqlAuditRepository {
    pool: DbPool,
}

impl SqlAuditRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const AUDIT_COLUMNS: &str = "id, request_id, sequence, action, actor_id, actor_type, details,
    prev_hash, entry_hash, signature, created_at";

fn parse_action(raw: &str) -> Result<AuditAction, RepositoryError> {
    match raw {
        "submitted" => Ok(AuditAction::Submitted),
        "auto_approved" => Ok(AuditAction::AutoApproved),
        "step_skipped" => Ok(AuditAction::StepSkipped),
        "step_advanced" => Ok(AuditAction::StepAdvanced),
        "step_unresolvable" => Ok(AuditAction::StepUnresolvable),
        "decision_recorded" => Ok(AuditAction::DecisionRecorded),
        "approved" => Ok(AuditAction::Approved),
        "rejected" => Ok(AuditAction::Rejected),
        "returned" => Ok(AuditAction::Returned),
        "cancelled" => Ok(AuditAction::Cancelled),
        "resubmitted" => Ok(AuditAction::Resubmitted),
        "escalated" => Ok(AuditAction::Escalated),
        "expired" => Ok(AuditAction::Expired),
        "reminder_sent" => Ok(AuditAction::ReminderSent),
        other => Err(RepositoryError::Decode(format!("unknown audit action `{other}`"))),
    }
}

fn actor_type_as_str(actor_type: AuditActorType) -> &'static str {
    match actor_type {
        AuditActorType::User => "user",
        AuditActorType::System => "system",
    }
}

fn parse_actor_type(raw: &str) -> Result<AuditActorType, RepositoryError> {
    match raw {
        "user" => Ok(AuditActorType::User),
        "system" => Ok(AuditActorType::System),
        other => Err(RepositoryError::Decode(format!("unknown audit actor type `{other}`"))),
    }
}

fn parse_timestamp(label: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("{label}: {e}")))
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<AuditEntry, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let request_id: String =
        row.try_get("request_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let sequence: i64 =
        row.try_get("sequence").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let action_str: String =
        row.try_get("action").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let actor_id: String =
        row.try_get("actor_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let actor_type_str: String =
        row.try_get("actor_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let details_raw: String =
        row.try_get("details").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let prev_hash: Option<String> =
        row.try_get("prev_hash").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let entry_hash: String =
        row.try_get("entry_hash").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let signature: String =
        row.try_get("signature").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at_str: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let details: BTreeMap<String, String> = serde_json::from_str(&details_raw)
        .map_err(|e| RepositoryError::Decode(format!("details: {e}")))?;

    Ok(AuditEntry {
        entry_id: id,
        request_id: RequestId(request_id),
        sequence: u32::try_from(sequence)
            .map_err(|_| RepositoryError::Decode(format!("sequence out of range: {sequence}")))?,
        action: parse_action(&action_str)?,
        actor_id,
        actor_type: parse_actor_type(&actor_type_str)?,
        details,
        prev_hash,
        entry_hash,
        signature,
        created_at: parse_timestamp("created_at", &created_at_str)?,
    })
}

#[async_trait::async_trait]
impl AuditRepository for SqlAuditRepository {
    async fn append(&self, entry: AuditEntry) -> Result<(), RepositoryError> {
        let details = serde_json::to_string(&entry.details)
            .map_err(|e| RepositoryError::Decode(format!("details: {e}")))?;

        sqlx::query(
            "INSERT INTO approval_audit_entry
                 (id, request_id, sequence, action, actor_id, actor_type, details,
                  prev_hash, entry_hash, signature, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.entry_id)
        .bind(&entry.request_id.0)
        .bind(i64::from(entry.sequence))
        .bind(entry.action.as_key())
        .bind(&entry.actor_id)
        .bind(actor_type_as_str(entry.actor_type))
        .bind(&details)
        .bind(&entry.prev_hash)
        .bind(&entry.entry_hash)
        .bind(&entry.signature)
        .bind(entry.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_for_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<AuditEntry>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
            "SELECT {AUDIT_COLUMNS} FROM approval_audit_entry
             WHERE request_id = ? ORDER BY sequence ASC"
        ))
        .bind(&request_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn list_all(
        &self,
        action: Option<&str>,
        actor_id: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<AuditEntry>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
            "SELECT {AUDIT_COLUMNS} FROM approval_audit_entry
             WHERE (?1 IS NULL OR action = ?1)
               AND (?2 IS NULL OR actor_id = ?2)
             ORDER BY created_at ASC, request_id ASC, sequence ASC
             LIMIT ?3 OFFSET ?4"
        ))
        .bind(action)
        .bind(actor_id)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_entry).collect()
    }
}
