use chrono::{DateTime, Utc};
use sqlx::Row;

use signoff_core::conditions::ContextMap;
use signoff_core::domain::decision::{ApprovalDecision, DecisionId, DecisionKind};
use signoff_core::domain::flow::{FlowId, StepId};
use signoff_core::domain::request::{ApprovalRequest, RequestId, RequestPriority, RequestStatus};

use super::{RepositoryError, RequestRepository};
use crate::DbPool;

pub struct SqlRequestRepository {
    pool: DbPool,
}

impl SqlRequestRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const REQUEST_COLUMNS: &str = "id, entity_type, entity_id, flow_id, current_step_id, status,
    context_snapshot, requested_by, requested_at, resolved_at, resolution_note, priority,
    due_by, resubmitted_from, step_entered_at, version";

pub fn status_as_str(status: RequestStatus) -> &'static str {
    match status {
        RequestStatus::Pending => "pending",
        RequestStatus::Approved => "approved",
        RequestStatus::Rejected => "rejected",
        RequestStatus::Returned => "returned",
        RequestStatus::Cancelled => "cancelled",
        RequestStatus::Expired => "expired",
    }
}

fn parse_status(raw: &str) -> Result<RequestStatus, RepositoryError> {
    match raw {
        "pending" => Ok(RequestStatus::Pending),
        "approved" => Ok(RequestStatus::Approved),
        "rejected" => Ok(RequestStatus::Rejected),
        "returned" => Ok(RequestStatus::Returned),
        "cancelled" => Ok(RequestStatus::Cancelled),
        "expired" => Ok(RequestStatus::Expired),
        other => Err(RepositoryError::Decode(format!("unknown request status `{other}`"))),
    }
}

pub fn priority_as_str(priority: RequestPriority) -> &'static str {
    match priority {
        RequestPriority::Low => "low",
        RequestPriority::Normal => "normal",
        RequestPriority::High => "high",
        RequestPriority::Urgent => "urgent",
    }
}

fn parse_priority(raw: &str) -> Result<RequestPriority, RepositoryError> {
    match raw {
        "low" => Ok(RequestPriority::Low),
        "normal" => Ok(RequestPriority::Normal),
        "high" => Ok(RequestPriority::High),
        "urgent" => Ok(RequestPriority::Urgent),
        other => Err(RepositoryError::Decode(format!("unknown request priority `{other}`"))),
    }
}

fn parse_decision(raw: &str) -> Result<DecisionKind, RepositoryError> {
    match raw {
        "approved" => Ok(DecisionKind::Approved),
        "rejected" => Ok(DecisionKind::Rejected),
        "returned" => Ok(DecisionKind::Returned),
        "delegated" => Ok(DecisionKind::Delegated),
        "abstained" => Ok(DecisionKind::Abstained),
        other => Err(RepositoryError::Decode(format!("unknown decision `{other}`"))),
    }
}

fn parse_timestamp(label: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("{label}: {e}")))
}

fn parse_optional_timestamp(
    label: &str,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    raw.map(|value| parse_timestamp(label, &value)).transpose()
}

fn row_to_request(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovalRequest, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let entity_type: String =
        row.try_get("entity_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let entity_id: String =
        row.try_get("entity_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let flow_id: String =
        row.try_get("flow_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let current_step_id: Option<String> =
        row.try_get("current_step_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let status_str: String =
        row.try_get("status").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let context_raw: String =
        row.try_get("context_snapshot").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let requested_by: String =
        row.try_get("requested_by").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let requested_at_str: String =
        row.try_get("requested_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let resolved_at_str: Option<String> =
        row.try_get("resolved_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let resolution_note: Option<String> =
        row.try_get("resolution_note").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let priority_str: String =
        row.try_get("priority").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let due_by_str: Option<String> =
        row.try_get("due_by").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let resubmitted_from: Option<String> =
        row.try_get("resubmitted_from").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let step_entered_at_str: Option<String> =
        row.try_get("step_entered_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let version: i64 =
        row.try_get("version").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let context_snapshot: ContextMap = serde_json::from_str(&context_raw)
        .map_err(|e| RepositoryError::Decode(format!("context_snapshot: {e}")))?;

    Ok(ApprovalRequest {
        id: RequestId(id),
        entity_type,
        entity_id,
        flow_id: FlowId(flow_id),
        current_step_id: current_step_id.map(StepId),
        status: parse_status(&status_str)?,
        context_snapshot,
        requested_by,
        requested_at: parse_timestamp("requested_at", &requested_at_str)?,
        resolved_at: parse_optional_timestamp("resolved_at", resolved_at_str)?,
        resolution_note,
        priority: parse_priority(&priority_str)?,
        due_by: parse_optional_timestamp("due_by", due_by_str)?,
        resubmitted_from: resubmitted_from.map(RequestId),
        step_entered_at: parse_optional_timestamp("step_entered_at", step_entered_at_str)?,
        version: u32::try_from(version)
            .map_err(|_| RepositoryError::Decode(format!("version out of range: {version}")))?,
    })
}

fn row_to_decision(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovalDecision, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let request_id: String =
        row.try_get("request_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let step_id: String =
        row.try_get("step_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let decided_by: String =
        row.try_get("decided_by").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let decision_str: String =
        row.try_get("decision").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let comment: Option<String> =
        row.try_get("comment").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let conditions_raw: Option<String> =
        row.try_get("conditions").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let delegated_to: Option<String> =
        row.try_get("delegated_to").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let decided_at_str: String =
        row.try_get("decided_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let superseded: bool =
        row.try_get("superseded").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(ApprovalDecision {
        id: DecisionId(id),
        request_id: RequestId(request_id),
        step_id: StepId(step_id),
        decided_by,
        decision: parse_decision(&decision_str)?,
        comment,
        conditions: conditions_raw
            .map(|raw| {
                serde_json::from_str(&raw)
                    .map_err(|e| RepositoryError::Decode(format!("conditions: {e}")))
            })
            .transpose()?,
        delegated_to,
        decided_at: parse_timestamp("decided_at", &decided_at_str)?,
        superseded,
    })
}

#[async_trait::async_trait]
impl RequestRepository for SqlRequestRepository {
    async fn find_by_id(
        &self,
        id: &RequestId,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {REQUEST_COLUMNS} FROM approval_request WHERE id = ?"))
                .bind(&id.0)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some(ref row) => Ok(Some(row_to_request(row)?)),
            None => Ok(None),
        }
    }

    async fn find_open_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM approval_request
             WHERE entity_type = ? AND entity_id = ? AND status = 'pending'"
        ))
        .bind(entity_type)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(ref row) => Ok(Some(row_to_request(row)?)),
            None => Ok(None),
        }
    }

    async fn list_pending(&self) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM approval_request
             WHERE status = 'pending'
             ORDER BY requested_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_request).collect()
    }

    async fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM approval_request
             WHERE entity_type = ? AND entity_id = ?
             ORDER BY requested_at ASC, id ASC"
        ))
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_request).collect()
    }

    async fn insert(&self, request: ApprovalRequest) -> Result<(), RepositoryError> {
        let context = serde_json::to_string(&request.context_snapshot)
            .map_err(|e| RepositoryError::Decode(format!("context_snapshot: {e}")))?;

        sqlx::query(
            "INSERT INTO approval_request
                 (id, entity_type, entity_id, flow_id, current_step_id, status,
                  context_snapshot, requested_by, requested_at, resolved_at, resolution_note,
                  priority, due_by, resubmitted_from, step_entered_at, version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.id.0)
        .bind(&request.entity_type)
        .bind(&request.entity_id)
        .bind(&request.flow_id.0)
        .bind(request.current_step_id.as_ref().map(|id| id.0.as_str()))
        .bind(status_as_str(request.status))
        .bind(&context)
        .bind(&request.requested_by)
        .bind(request.requested_at.to_rfc3339())
        .bind(request.resolved_at.map(|at| at.to_rfc3339()))
        .bind(&request.resolution_note)
        .bind(priority_as_str(request.priority))
        .bind(request.due_by.map(|at| at.to_rfc3339()))
        .bind(request.resubmitted_from.as_ref().map(|id| id.0.as_str()))
        .bind(request.step_entered_at.map(|at| at.to_rfc3339()))
        .bind(i64::from(request.version))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(
        &self,
        request: ApprovalRequest,
        expected_version: u32,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE approval_request SET
                 current_step_id = ?,
                 status = ?,
                 resolved_at = ?,
                 resolution_note = ?,
                 step_entered_at = ?,
                 version = ?
             WHERE id = ? AND version = ?",
        )
        .bind(request.current_step_id.as_ref().map(|id| id.0.as_str()))
        .bind(status_as_str(request.status))
        .bind(request.resolved_at.map(|at| at.to_rfc3339()))
        .bind(&request.resolution_note)
        .bind(request.step_entered_at.map(|at| at.to_rfc3339()))
        .bind(i64::from(request.version))
        .bind(&request.id.0)
        .bind(i64::from(expected_version))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict { id: request.id.0, expected_version });
        }
        Ok(())
    }

    async fn append_decision(&self, decision: ApprovalDecision) -> Result<(), RepositoryError> {
        let conditions = decision
            .conditions
            .as_ref()
            .map(|value| {
                serde_json::to_string(value)
                    .map_err(|e| RepositoryError::Decode(format!("conditions: {e}")))
            })
            .transpose()?;

        sqlx::query(
            "INSERT INTO approval_decision
                 (id, request_id, step_id, decided_by, decision, comment, conditions,
                  delegated_to, decided_at, superseded)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&decision.id.0)
        .bind(&decision.request_id.0)
        .bind(&decision.step_id.0)
        .bind(&decision.decided_by)
        .bind(decision.decision.as_key())
        .bind(&decision.comment)
        .bind(&conditions)
        .bind(&decision.delegated_to)
        .bind(decision.decided_at.to_rfc3339())
        .bind(decision.superseded)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn supersede_decision(&self, id: &DecisionId) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE approval_decision SET superseded = 1 WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn decisions_for_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<ApprovalDecision>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(
            "SELECT id, request_id, step_id, decided_by, decision, comment, conditions,
                    delegated_to, decided_at, superseded
             FROM approval_decision
             WHERE request_id = ?
             ORDER BY decided_at ASC, id ASC",
        )
        .bind(&request_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_decision).collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use signoff_core::domain::decision::{ApprovalDecision, DecisionId, DecisionKind};
    use signoff_core::domain::flow::{ApprovalFlow, FlowId, StepId};
    use signoff_core::domain::request::{
        ApprovalRequest, RequestId, RequestPriority, RequestStatus,
    };

    use super::SqlRequestRepository;
    use crate::repositories::{
        FlowRepository, RepositoryError, RequestRepository, SqlFlowRepository,
    };
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    async fn insert_flow(pool: &sqlx::SqlitePool, id: &str) {
        let repo = SqlFlowRepository::new(pool.clone());
        repo.save(ApprovalFlow {
            id: FlowId(id.to_string()),
            name: "Invoice sign-off".to_string(),
            slug: format!("slug-{id}"),
            entity_type: "invoice".to_string(),
            trigger_conditions: None,
            priority: 0,
            allow_parallel_steps: false,
            auto_approve_below: None,
            auto_reject_after_hours: None,
            is_active: true,
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
            steps: Vec::new(),
        })
        .await
        .expect("insert parent flow");
    }

    fn sample_request(id: &str, entity_id: &str) -> ApprovalRequest {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        ApprovalRequest {
            id: RequestId(id.to_string()),
            entity_type: "invoice".to_string(),
            entity_id: entity_id.to_string(),
            flow_id: FlowId("f-1".to_string()),
            current_step_id: Some(StepId("s-1".to_string())),
            status: RequestStatus::Pending,
            context_snapshot: [("amount".to_string(), 2_500.into())].into_iter().collect(),
            requested_by: "u-requester".to_string(),
            requested_at: now,
            resolved_at: None,
            resolution_note: None,
            priority: RequestPriority::High,
            due_by: None,
            resubmitted_from: None,
            step_entered_at: Some(now),
            version: 1,
        }
    }

    fn sample_decision(id: &str, request_id: &str, decided_by: &str) -> ApprovalDecision {
        ApprovalDecision {
            id: DecisionId(id.to_string()),
            request_id: RequestId(request_id.to_string()),
            step_id: StepId("s-1".to_string()),
            decided_by: decided_by.to_string(),
            decision: DecisionKind::Approved,
            comment: Some("looks right".to_string()),
            conditions: Some(serde_json::json!({ "on_behalf_of": "u-amy" })),
            delegated_to: None,
            decided_at: Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
            superseded: false,
        }
    }

    #[tokio::test]
    async fn insert_and_find_round_trips_the_projection() {
        let pool = setup().await;
        insert_flow(&pool, "f-1").await;
        let repo = SqlRequestRepository::new(pool);
        let request = sample_request("r-1", "INV-1");

        repo.insert(request.clone()).await.expect("insert");
        let found = repo
            .find_by_id(&RequestId("r-1".to_string()))
            .await
            .expect("find")
            .expect("request exists");

        assert_eq!(found, request);
    }

    #[tokio::test]
    async fn find_open_ignores_terminal_rows() {
        let pool = setup().await;
        insert_flow(&pool, "f-1").await;
        let repo = SqlRequestRepository::new(pool);

        let mut resolved = sample_request("r-1", "INV-1");
        resolved.status = RequestStatus::Rejected;
        resolved.current_step_id = None;
        repo.insert(resolved).await.expect("insert terminal");
        assert!(repo
            .find_open_for_entity("invoice", "INV-1")
            .await
            .expect("find open")
            .is_none());

        repo.insert(sample_request("r-2", "INV-1")).await.expect("insert open");
        let open = repo
            .find_open_for_entity("invoice", "INV-1")
            .await
            .expect("find open")
            .expect("open request");
        assert_eq!(open.id.0, "r-2");

        let history = repo.list_for_entity("invoice", "INV-1").await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id.0, "r-1");
    }

    #[tokio::test]
    async fn update_is_version_guarded() {
        let pool = setup().await;
        insert_flow(&pool, "f-1").await;
        let repo = SqlRequestRepository::new(pool);
        let request = sample_request("r-1", "INV-1");
        repo.insert(request.clone()).await.expect("insert");

        let mut advanced = request.clone();
        advanced.status = RequestStatus::Approved;
        advanced.current_step_id = None;
        advanced.resolved_at = Some(Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap());
        advanced.version = 2;
        repo.update(advanced.clone(), 1).await.expect("first writer wins");

        // A writer that read version 1 must not overwrite version 2.
        let mut stale = request;
        stale.status = RequestStatus::Returned;
        stale.version = 2;
        let error = repo.update(stale, 1).await.expect_err("stale write is rejected");
        assert!(matches!(error, RepositoryError::Conflict { expected_version: 1, .. }));

        let stored = repo
            .find_by_id(&RequestId("r-1".to_string()))
            .await
            .expect("find")
            .expect("request exists");
        assert_eq!(stored.status, RequestStatus::Approved);
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn decisions_append_and_supersede() {
        let pool = setup().await;
        insert_flow(&pool, "f-1").await;
        let repo = SqlRequestRepository::new(pool);
        repo.insert(sample_request("r-1", "INV-1")).await.expect("insert");

        let first = sample_decision("d-1", "r-1", "u-amy");
        let second = sample_decision("d-2", "r-1", "u-bob");
        repo.append_decision(first.clone()).await.expect("append first");
        repo.append_decision(second).await.expect("append second");

        repo.supersede_decision(&first.id).await.expect("supersede");

        let decisions = repo.decisions_for_request(&RequestId("r-1".to_string()))
            .await
            .expect("list decisions");
        assert_eq!(decisions.len(), 2);
        assert!(decisions.iter().find(|d| d.id.0 == "d-1").expect("d-1").superseded);
        assert!(!decisions.iter().find(|d| d.id.0 == "d-2").expect("d-2").superseded);
        assert_eq!(
            decisions[1].conditions,
            Some(serde_json::json!({ "on_behalf_of": "u-amy" }))
        );
    }

    #[tokio::test]
    async fn list_pending_returns_open_requests_oldest_first() {
        let pool = setup().await;
        insert_flow(&pool, "f-1").await;
        let repo = SqlRequestRepository::new(pool);

        let mut older = sample_request("r-1", "INV-1");
        older.requested_at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        repo.insert(older).await.expect("insert older");
        repo.insert(sample_request("r-2", "INV-2")).await.expect("insert newer");
        let mut closed = sample_request("r-3", "INV-3");
        closed.status = RequestStatus::Cancelled;
        closed.current_step_id = None;
        repo.insert(closed).await.expect("insert closed");

        let pending = repo.list_pending().await.expect("list pending");
        let ids: Vec<&str> = pending.iter().map(|request| request.id.0.as_str()).collect();
        assert_eq!(ids, vec!["r-1", "r-2"]);
    }
}
