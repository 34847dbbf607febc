use chrono::{DateTime, Utc};
use sqlx::Row;

use signoff_core::conditions::Condition;
use signoff_core::domain::flow::{
    ApprovalFlow, ApprovalStep, ApproverSpec, EscalationTarget, FlowId, StepId,
};

use super::{FlowRepository, RepositoryError};
use crate::DbPool;

pub struct SqlFlowRepository {
    pool: DbPool,
}

impl SqlFlowRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_steps(&self, flow_id: &str) -> Result<Vec<ApprovalStep>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(
            "SELECT id, flow_id, step_order, approver, requires_all, min_approvals,
                    skip_conditions, timeout_hours, reminder_after_hours, escalation
             FROM approval_step WHERE flow_id = ? ORDER BY step_order ASC",
        )
        .bind(flow_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_step).collect()
    }

    async fn assemble(
        &self,
        row: Option<sqlx::sqlite::SqliteRow>,
    ) -> Result<Option<ApprovalFlow>, RepositoryError> {
        let Some(row) = row else {
            return Ok(None);
        };
        let mut flow = row_to_flow(&row)?;
        flow.steps = self.load_steps(&flow.id.0).await?;
        Ok(Some(flow))
    }
}

const FLOW_COLUMNS: &str = "id, name, slug, entity_type, trigger_conditions, priority,
    allow_parallel_steps, auto_approve_below, auto_reject_after_hours, is_active, created_at";

fn parse_timestamp(label: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("{label}: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(label: &str, raw: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(raw).map_err(|e| RepositoryError::Decode(format!("{label}: {e}")))
}

fn to_json<T: serde::Serialize>(label: &str, value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Decode(format!("{label}: {e}")))
}

fn row_to_flow(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovalFlow, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let name: String = row.try_get("name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let slug: String = row.try_get("slug").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let entity_type: String =
        row.try_get("entity_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let trigger_conditions: Option<String> =
        row.try_get("trigger_conditions").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let priority: i32 =
        row.try_get("priority").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let allow_parallel_steps: bool =
        row.try_get("allow_parallel_steps").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let auto_approve_below: Option<String> =
        row.try_get("auto_approve_below").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let auto_reject_after_hours: Option<i64> = row
        .try_get("auto_reject_after_hours")
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let is_active: bool =
        row.try_get("is_active").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at_str: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(ApprovalFlow {
        id: FlowId(id),
        name,
        slug,
        entity_type,
        trigger_conditions: trigger_conditions
            .map(|raw| from_json::<Condition>("trigger_conditions", &raw))
            .transpose()?,
        priority,
        allow_parallel_steps,
        auto_approve_below: auto_approve_below
            .map(|raw| from_json::<Condition>("auto_approve_below", &raw))
            .transpose()?,
        auto_reject_after_hours,
        is_active,
        created_at: parse_timestamp("created_at", &created_at_str)?,
        steps: Vec::new(),
    })
}

fn row_to_step(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovalStep, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let flow_id: String =
        row.try_get("flow_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let step_order: i64 =
        row.try_get("step_order").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let approver_raw: String =
        row.try_get("approver").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let requires_all: bool =
        row.try_get("requires_all").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let min_approvals: i64 =
        row.try_get("min_approvals").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let skip_conditions: Option<String> =
        row.try_get("skip_conditions").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let timeout_hours: Option<i64> =
        row.try_get("timeout_hours").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let reminder_after_hours: Option<i64> =
        row.try_get("reminder_after_hours").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let escalation: Option<String> =
        row.try_get("escalation").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(ApprovalStep {
        id: StepId(id),
        flow_id: FlowId(flow_id),
        step_order: u32::try_from(step_order)
            .map_err(|_| RepositoryError::Decode(format!("step_order out of range: {step_order}")))?,
        approver: from_json::<ApproverSpec>("approver", &approver_raw)?,
        requires_all,
        min_approvals: u32::try_from(min_approvals).map_err(|_| {
            RepositoryError::Decode(format!("min_approvals out of range: {min_approvals}"))
        })?,
        skip_conditions: skip_conditions
            .map(|raw| from_json::<Condition>("skip_conditions", &raw))
            .transpose()?,
        timeout_hours,
        reminder_after_hours,
        escalation: escalation
            .map(|raw| from_json::<EscalationTarget>("escalation", &raw))
            .transpose()?,
    })
}

#[async_trait::async_trait]
impl FlowRepository for SqlFlowRepository {
    async fn find_by_id(&self, id: &FlowId) -> Result<Option<ApprovalFlow>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {FLOW_COLUMNS} FROM approval_flow WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;
        self.assemble(row).await
    }

    async fn find_by_slug(&self, slug: &str) -> Result<Option<ApprovalFlow>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {FLOW_COLUMNS} FROM approval_flow WHERE slug = ?"))
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        self.assemble(row).await
    }

    async fn list_active_for_entity_type(
        &self,
        entity_type: &str,
    ) -> Result<Vec<ApprovalFlow>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
            "SELECT {FLOW_COLUMNS} FROM approval_flow
             WHERE entity_type = ? AND is_active = 1
             ORDER BY priority DESC, created_at ASC, id ASC"
        ))
        .bind(entity_type)
        .fetch_all(&self.pool)
        .await?;

        let mut flows = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut flow = row_to_flow(row)?;
            flow.steps = self.load_steps(&flow.id.0).await?;
            flows.push(flow);
        }
        Ok(flows)
    }

    async fn save(&self, flow: ApprovalFlow) -> Result<(), RepositoryError> {
        let trigger_conditions = flow
            .trigger_conditions
            .as_ref()
            .map(|c| to_json("trigger_conditions", c))
            .transpose()?;
        let auto_approve_below = flow
            .auto_approve_below
            .as_ref()
            .map(|c| to_json("auto_approve_below", c))
            .transpose()?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO approval_flow (id, name, slug, entity_type, trigger_conditions,
                                        priority, allow_parallel_steps, auto_approve_below,
                                        auto_reject_after_hours, is_active, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 slug = excluded.slug,
                 entity_type = excluded.entity_type,
                 trigger_conditions = excluded.trigger_conditions,
                 priority = excluded.priority,
                 allow_parallel_steps = excluded.allow_parallel_steps,
                 auto_approve_below = excluded.auto_approve_below,
                 auto_reject_after_hours = excluded.auto_reject_after_hours,
                 is_active = excluded.is_active",
        )
        .bind(&flow.id.0)
        .bind(&flow.name)
        .bind(&flow.slug)
        .bind(&flow.entity_type)
        .bind(&trigger_conditions)
        .bind(flow.priority)
        .bind(flow.allow_parallel_steps)
        .bind(&auto_approve_below)
        .bind(flow.auto_reject_after_hours)
        .bind(flow.is_active)
        .bind(flow.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM approval_step WHERE flow_id = ?")
            .bind(&flow.id.0)
            .execute(&mut *tx)
            .await?;

        for step in &flow.steps {
            let approver = to_json("approver", &step.approver)?;
            let skip_conditions = step
                .skip_conditions
                .as_ref()
                .map(|c| to_json("skip_conditions", c))
                .transpose()?;
            let escalation =
                step.escalation.as_ref().map(|e| to_json("escalation", e)).transpose()?;

            sqlx::query(
                "INSERT INTO approval_step (id, flow_id, step_order, approver, requires_all,
                                            min_approvals, skip_conditions, timeout_hours,
                                            reminder_after_hours, escalation)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&step.id.0)
            .bind(&step.flow_id.0)
            .bind(i64::from(step.step_order))
            .bind(&approver)
            .bind(step.requires_all)
            .bind(i64::from(step.min_approvals))
            .bind(&skip_conditions)
            .bind(step.timeout_hours)
            .bind(step.reminder_after_hours)
            .bind(&escalation)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn set_active(&self, id: &FlowId, is_active: bool) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE approval_flow SET is_active = ? WHERE id = ?")
            .bind(is_active)
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use signoff_core::conditions::Condition;
    use signoff_core::domain::flow::{
        ApprovalFlow, ApprovalStep, ApproverSpec, EscalationTarget, FlowId, StepId,
    };

    use super::SqlFlowRepository;
    use crate::repositories::FlowRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn sample_flow(id: &str, slug: &str) -> ApprovalFlow {
        ApprovalFlow {
            id: FlowId(id.to_string()),
            name: "Invoice sign-off".to_string(),
            slug: slug.to_string(),
            entity_type: "invoice".to_string(),
            trigger_conditions: Some(Condition::Gte {
                field: "amount".to_string(),
                value: 1_000.into(),
            }),
            priority: 10,
            allow_parallel_steps: false,
            auto_approve_below: Some(Condition::Lt {
                field: "amount".to_string(),
                value: 100.into(),
            }),
            auto_reject_after_hours: Some(72),
            is_active: true,
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
            steps: vec![
                ApprovalStep {
                    id: StepId(format!("{id}-s-1")),
                    flow_id: FlowId(id.to_string()),
                    step_order: 1,
                    approver: ApproverSpec::Role { role_name: "finance_manager".to_string() },
                    requires_all: false,
                    min_approvals: 2,
                    skip_conditions: Some(Condition::Lt {
                        field: "amount".to_string(),
                        value: 500.into(),
                    }),
                    timeout_hours: Some(24),
                    reminder_after_hours: Some(8),
                    escalation: Some(EscalationTarget::ApproverManagers),
                },
                ApprovalStep {
                    id: StepId(format!("{id}-s-2")),
                    flow_id: FlowId(id.to_string()),
                    step_order: 2,
                    approver: ApproverSpec::User { user_id: "u-cfo".to_string() },
                    requires_all: true,
                    min_approvals: 1,
                    skip_conditions: None,
                    timeout_hours: None,
                    reminder_after_hours: None,
                    escalation: None,
                },
            ],
        }
    }

    #[tokio::test]
    async fn save_and_find_round_trips_conditions_and_steps() {
        let pool = setup().await;
        let repo = SqlFlowRepository::new(pool);
        let flow = sample_flow("f-1", "invoice-signoff");

        repo.save(flow.clone()).await.expect("save");
        let found = repo
            .find_by_id(&FlowId("f-1".to_string()))
            .await
            .expect("find")
            .expect("flow exists");

        assert_eq!(found, flow);
        let by_slug =
            repo.find_by_slug("invoice-signoff").await.expect("find by slug").expect("exists");
        assert_eq!(by_slug.id, flow.id);
    }

    #[tokio::test]
    async fn save_replaces_step_definitions() {
        let pool = setup().await;
        let repo = SqlFlowRepository::new(pool);
        let mut flow = sample_flow("f-1", "invoice-signoff");
        repo.save(flow.clone()).await.expect("save");

        flow.steps.truncate(1);
        flow.steps[0].min_approvals = 3;
        repo.save(flow.clone()).await.expect("resave");

        let found =
            repo.find_by_id(&flow.id).await.expect("find").expect("flow exists");
        assert_eq!(found.steps.len(), 1);
        assert_eq!(found.steps[0].min_approvals, 3);
    }

    #[tokio::test]
    async fn list_active_filters_and_orders_by_priority() {
        let pool = setup().await;
        let repo = SqlFlowRepository::new(pool);

        let mut low = sample_flow("f-low", "invoice-low");
        low.priority = 1;
        let mut high = sample_flow("f-high", "invoice-high");
        high.priority = 50;
        let mut inactive = sample_flow("f-off", "invoice-off");
        inactive.is_active = false;
        let mut other = sample_flow("f-proj", "project-flow");
        other.entity_type = "project".to_string();
        for flow in [low, high, inactive, other] {
            repo.save(flow).await.expect("save");
        }

        let active = repo.list_active_for_entity_type("invoice").await.expect("list");
        let ids: Vec<&str> = active.iter().map(|flow| flow.id.0.as_str()).collect();
        assert_eq!(ids, vec!["f-high", "f-low"]);
    }

    #[tokio::test]
    async fn set_active_toggles_visibility() {
        let pool = setup().await;
        let repo = SqlFlowRepository::new(pool);
        let flow = sample_flow("f-1", "invoice-signoff");
        repo.save(flow.clone()).await.expect("save");

        repo.set_active(&flow.id, false).await.expect("deactivate");
        assert!(repo.list_active_for_entity_type("invoice").await.expect("list").is_empty());

        repo.set_active(&flow.id, true).await.expect("reactivate");
        assert_eq!(repo.list_active_for_entity_type("invoice").await.expect("list").len(), 1);
    }
}
