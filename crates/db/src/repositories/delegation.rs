use chrono::{DateTime, Utc};
use sqlx::Row;

use signoff_core::domain::delegation::{ApprovalDelegation, DelegationId};
use signoff_core::domain::flow::FlowId;

use super::{DelegationRepository, RepositoryError};
use crate::DbPool;

pub struct SqlDelegationRepository {
    pool: DbPool,
}

impl SqlDelegationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const DELEGATION_COLUMNS: &str =
    "id, delegator_id, delegate_id, starts_at, ends_at, reason, entity_type, flow_id, is_active";

fn parse_timestamp(label: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("{label}: {e}")))
}

fn row_to_delegation(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovalDelegation, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let delegator_id: String =
        row.try_get("delegator_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let delegate_id: String =
        row.try_get("delegate_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let starts_at_str: String =
        row.try_get("starts_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let ends_at_str: String =
        row.try_get("ends_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let reason: Option<String> =
        row.try_get("reason").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let entity_type: Option<String> =
        row.try_get("entity_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let flow_id: Option<String> =
        row.try_get("flow_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let is_active: bool =
        row.try_get("is_active").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(ApprovalDelegation {
        id: DelegationId(id),
        delegator_id,
        delegate_id,
        starts_at: parse_timestamp("starts_at", &starts_at_str)?,
        ends_at: parse_timestamp("ends_at", &ends_at_str)?,
        reason,
        entity_type,
        flow_id: flow_id.map(FlowId),
        is_active,
    })
}

#[async_trait::async_trait]
impl DelegationRepository for SqlDelegationRepository {
    async fn find_by_id(
        &self,
        id: &DelegationId,
    ) -> Result<Option<ApprovalDelegation>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {DELEGATION_COLUMNS} FROM approval_delegation WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(ref row) => Ok(Some(row_to_delegation(row)?)),
            None => Ok(None),
        }
    }

    async fn list_all(&self) -> Result<Vec<ApprovalDelegation>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
            "SELECT {DELEGATION_COLUMNS} FROM approval_delegation ORDER BY starts_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_delegation).collect()
    }

    async fn list_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<ApprovalDelegation>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
            "SELECT {DELEGATION_COLUMNS} FROM approval_delegation
             WHERE delegator_id = ?1 OR delegate_id = ?1
             ORDER BY starts_at ASC, id ASC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_delegation).collect()
    }

    async fn save(&self, delegation: ApprovalDelegation) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO approval_delegation
                 (id, delegator_id, delegate_id, starts_at, ends_at, reason,
                  entity_type, flow_id, is_active)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 delegator_id = excluded.delegator_id,
                 delegate_id = excluded.delegate_id,
                 starts_at = excluded.starts_at,
                 ends_at = excluded.ends_at,
                 reason = excluded.reason,
                 entity_type = excluded.entity_type,
                 flow_id = excluded.flow_id,
                 is_active = excluded.is_active",
        )
        .bind(&delegation.id.0)
        .bind(&delegation.delegator_id)
        .bind(&delegation.delegate_id)
        .bind(delegation.starts_at.to_rfc3339())
        .bind(delegation.ends_at.to_rfc3339())
        .bind(&delegation.reason)
        .bind(&delegation.entity_type)
        .bind(delegation.flow_id.as_ref().map(|id| id.0.as_str()))
        .bind(delegation.is_active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use signoff_core::domain::delegation::{ApprovalDelegation, DelegationId};
    use signoff_core::domain::flow::FlowId;

    use super::SqlDelegationRepository;
    use crate::repositories::DelegationRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn sample_delegation(id: &str, delegator: &str, delegate: &str) -> ApprovalDelegation {
        let starts_at = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        ApprovalDelegation {
            id: DelegationId(id.to_string()),
            delegator_id: delegator.to_string(),
            delegate_id: delegate.to_string(),
            starts_at,
            ends_at: starts_at + Duration::days(14),
            reason: Some("parental leave".to_string()),
            entity_type: Some("invoice".to_string()),
            flow_id: Some(FlowId("f-1".to_string())),
            is_active: true,
        }
    }

    #[tokio::test]
    async fn save_and_find_round_trips_scope_and_window() {
        let pool = setup().await;
        let repo = SqlDelegationRepository::new(pool);
        let delegation = sample_delegation("del-1", "u-amy", "u-bob");

        repo.save(delegation.clone()).await.expect("save");
        let found = repo
            .find_by_id(&DelegationId("del-1".to_string()))
            .await
            .expect("find")
            .expect("delegation exists");

        assert_eq!(found, delegation);
    }

    #[tokio::test]
    async fn list_for_user_matches_either_side_of_the_grant() {
        let pool = setup().await;
        let repo = SqlDelegationRepository::new(pool);

        repo.save(sample_delegation("del-1", "u-amy", "u-bob")).await.expect("save 1");
        repo.save(sample_delegation("del-2", "u-bob", "u-cara")).await.expect("save 2");
        repo.save(sample_delegation("del-3", "u-dave", "u-erin")).await.expect("save 3");

        let for_bob = repo.list_for_user("u-bob").await.expect("list for bob");
        assert_eq!(for_bob.len(), 2);

        let all = repo.list_all().await.expect("list all");
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn save_upserts_deactivation() {
        let pool = setup().await;
        let repo = SqlDelegationRepository::new(pool);
        let mut delegation = sample_delegation("del-1", "u-amy", "u-bob");
        repo.save(delegation.clone()).await.expect("save");

        delegation.is_active = false;
        repo.save(delegation).await.expect("upsert");

        let found = repo
            .find_by_id(&DelegationId("del-1".to_string()))
            .await
            .expect("find")
            .expect("delegation exists");
        assert!(!found.is_active);
    }
}
