use chrono::{DateTime, TimeZone, Utc};

use signoff_core::conditions::Condition;
use signoff_core::domain::delegation::{ApprovalDelegation, DelegationId};
use signoff_core::domain::flow::{
    ApprovalFlow, ApprovalStep, ApproverSpec, EscalationTarget, FlowId, StepId,
};
use signoff_core::domain::request::{
    ApprovalRequest, RequestId, RequestPriority, RequestStatus,
};

use crate::connection::DbPool;
use crate::repositories::{
    DelegationRepository, FlowRepository, RepositoryError, RequestRepository,
    SqlDelegationRepository, SqlFlowRepository, SqlRequestRepository,
};

const SEED_FLOW_STANDARD: &str = "flow-seed-invoice-standard";
const SEED_FLOW_HIGH_VALUE: &str = "flow-seed-invoice-high-value";
const SEED_DELEGATION: &str = "del-seed-cfo-deputy";
const SEED_REQUEST: &str = "request-seed-approved-001";

const SEED_FLOWS: &[SeedFlowInfo] = &[
    SeedFlowInfo {
        slug: "invoice-signoff",
        description: "two-stage invoice sign-off with auto-approve below 100",
    },
    SeedFlowInfo {
        slug: "invoice-high-value",
        description: "department-manager gate for invoices of 10000 and above",
    },
];

#[derive(Clone, Copy, Debug)]
pub struct SeedFlowInfo {
    pub slug: &'static str,
    pub description: &'static str,
}

#[derive(Debug)]
pub struct SeedResult {
    pub flows: Vec<SeedFlowInfo>,
    pub delegations: usize,
    pub requests: usize,
}

#[derive(Debug)]
pub struct SeedVerification {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}

/// Deterministic demo dataset: two invoice flows, one standing delegation and
/// one resolved historical request. Loading twice leaves the same rows behind.
pub struct SeedDataset;

impl SeedDataset {
    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let flows = SqlFlowRepository::new(pool.clone());
        let delegations = SqlDelegationRepository::new(pool.clone());
        let requests = SqlRequestRepository::new(pool.clone());

        flows.save(standard_flow()).await?;
        flows.save(high_value_flow()).await?;
        delegations.save(cfo_delegation()).await?;

        let history = approved_history_request();
        if requests.find_by_id(&history.id).await?.is_none() {
            requests.insert(history).await?;
        }

        Ok(SeedResult { flows: SEED_FLOWS.to_vec(), delegations: 1, requests: 1 })
    }

    pub async fn verify(pool: &DbPool) -> Result<SeedVerification, RepositoryError> {
        let flows = SqlFlowRepository::new(pool.clone());
        let delegations = SqlDelegationRepository::new(pool.clone());
        let requests = SqlRequestRepository::new(pool.clone());

        let mut checks: Vec<(&'static str, bool)> = Vec::new();

        let standard = flows.find_by_slug("invoice-signoff").await?;
        checks.push((
            "standard-flow",
            standard.as_ref().is_some_and(|flow| flow.steps.len() == 2 && flow.is_active),
        ));
        checks.push((
            "standard-flow-auto-approve",
            standard.as_ref().is_some_and(|flow| flow.auto_approve_below.is_some()),
        ));

        let high_value = flows.find_by_slug("invoice-high-value").await?;
        checks.push((
            "high-value-flow",
            high_value.as_ref().is_some_and(|flow| {
                flow.trigger_conditions.is_some() && flow.priority > standard_flow().priority
            }),
        ));

        let delegation =
            delegations.find_by_id(&DelegationId(SEED_DELEGATION.to_string())).await?;
        checks.push((
            "cfo-delegation",
            delegation.is_some_and(|grant| grant.is_active && grant.starts_at < grant.ends_at),
        ));

        let history = requests.find_by_id(&RequestId(SEED_REQUEST.to_string())).await?;
        checks.push((
            "approved-history-request",
            history.is_some_and(|request| {
                request.status == RequestStatus::Approved && request.resolved_at.is_some()
            }),
        ));

        let all_present = checks.iter().all(|(_, present)| *present);
        Ok(SeedVerification { all_present, checks })
    }

    /// Remove seeded rows from a test database. Steps cascade with their flow.
    pub async fn clean(pool: &DbPool) -> Result<(), RepositoryError> {
        let mut tx = pool.begin().await?;

        sqlx::query("DELETE FROM approval_request WHERE id = ?")
            .bind(SEED_REQUEST)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM approval_delegation WHERE id = ?")
            .bind(SEED_DELEGATION)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM approval_flow WHERE id IN (?, ?)")
            .bind(SEED_FLOW_STANDARD)
            .bind(SEED_FLOW_HIGH_VALUE)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn seeded_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
}

fn standard_flow() -> ApprovalFlow {
    ApprovalFlow {
        id: FlowId(SEED_FLOW_STANDARD.to_string()),
        name: "Invoice sign-off".to_string(),
        slug: "invoice-signoff".to_string(),
        entity_type: "invoice".to_string(),
        trigger_conditions: None,
        priority: 10,
        allow_parallel_steps: false,
        auto_approve_below: Some(Condition::Lt {
            field: "amount".to_string(),
            value: 100.into(),
        }),
        auto_reject_after_hours: Some(72),
        is_active: true,
        created_at: seeded_at(),
        steps: vec![
            ApprovalStep {
                id: StepId(format!("{SEED_FLOW_STANDARD}-s-1")),
                flow_id: FlowId(SEED_FLOW_STANDARD.to_string()),
                step_order: 1,
                approver: ApproverSpec::Role { role_name: "finance_manager".to_string() },
                requires_all: false,
                min_approvals: 1,
                skip_conditions: Some(Condition::Lt {
                    field: "amount".to_string(),
                    value: 500.into(),
                }),
                timeout_hours: Some(24),
                reminder_after_hours: Some(8),
                escalation: Some(EscalationTarget::ApproverManagers),
            },
            ApprovalStep {
                id: StepId(format!("{SEED_FLOW_STANDARD}-s-2")),
                flow_id: FlowId(SEED_FLOW_STANDARD.to_string()),
                step_order: 2,
                approver: ApproverSpec::User { user_id: "u-cfo".to_string() },
                requires_all: true,
                min_approvals: 1,
                skip_conditions: None,
                timeout_hours: Some(48),
                reminder_after_hours: Some(24),
                escalation: None,
            },
        ],
    }
}

fn high_value_flow() -> ApprovalFlow {
    ApprovalFlow {
        id: FlowId(SEED_FLOW_HIGH_VALUE.to_string()),
        name: "High-value invoice sign-off".to_string(),
        slug: "invoice-high-value".to_string(),
        entity_type: "invoice".to_string(),
        trigger_conditions: Some(Condition::Gte {
            field: "amount".to_string(),
            value: 10_000.into(),
        }),
        priority: 20,
        allow_parallel_steps: false,
        auto_approve_below: None,
        auto_reject_after_hours: Some(120),
        is_active: true,
        created_at: seeded_at(),
        steps: vec![ApprovalStep {
            id: StepId(format!("{SEED_FLOW_HIGH_VALUE}-s-1")),
            flow_id: FlowId(SEED_FLOW_HIGH_VALUE.to_string()),
            step_order: 1,
            approver: ApproverSpec::DepartmentManager,
            requires_all: true,
            min_approvals: 1,
            skip_conditions: None,
            timeout_hours: Some(24),
            reminder_after_hours: Some(8),
            escalation: Some(EscalationTarget::User { user_id: "u-cfo".to_string() }),
        }],
    }
}

fn cfo_delegation() -> ApprovalDelegation {
    ApprovalDelegation {
        id: DelegationId(SEED_DELEGATION.to_string()),
        delegator_id: "u-cfo".to_string(),
        delegate_id: "u-deputy-cfo".to_string(),
        starts_at: seeded_at(),
        ends_at: Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap(),
        reason: Some("quarter-close travel".to_string()),
        entity_type: Some("invoice".to_string()),
        flow_id: None,
        is_active: true,
    }
}

fn approved_history_request() -> ApprovalRequest {
    let requested_at = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
    ApprovalRequest {
        id: RequestId(SEED_REQUEST.to_string()),
        entity_type: "invoice".to_string(),
        entity_id: "INV-2026-0001".to_string(),
        flow_id: FlowId(SEED_FLOW_STANDARD.to_string()),
        current_step_id: None,
        status: RequestStatus::Approved,
        context_snapshot: [
            ("amount".to_string(), 2_400.into()),
            ("department".to_string(), "finance".into()),
        ]
        .into_iter()
        .collect(),
        requested_by: "u-requester".to_string(),
        requested_at,
        resolved_at: Some(Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap()),
        resolution_note: None,
        priority: RequestPriority::Normal,
        due_by: None,
        resubmitted_from: None,
        step_entered_at: None,
        version: 4,
    }
}

#[cfg(test)]
mod tests {
    use super::SeedDataset;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn load_then_verify_passes_every_check() {
        let pool = setup().await;

        let result = SeedDataset::load(&pool).await.expect("load");
        assert_eq!(result.flows.len(), 2);

        let verification = SeedDataset::verify(&pool).await.expect("verify");
        let failed: Vec<&str> = verification
            .checks
            .iter()
            .filter_map(|(check, passed)| (!passed).then_some(*check))
            .collect();
        assert!(verification.all_present, "failed checks: {}", failed.join(", "));
    }

    #[tokio::test]
    async fn load_is_idempotent() {
        let pool = setup().await;

        SeedDataset::load(&pool).await.expect("first load");
        SeedDataset::load(&pool).await.expect("second load");

        let verification = SeedDataset::verify(&pool).await.expect("verify");
        assert!(verification.all_present);
    }

    #[tokio::test]
    async fn clean_removes_the_seeded_rows() {
        let pool = setup().await;

        SeedDataset::load(&pool).await.expect("load");
        SeedDataset::clean(&pool).await.expect("clean");

        let verification = SeedDataset::verify(&pool).await.expect("verify");
        assert!(!verification.all_present);
        assert!(verification.checks.iter().all(|(_, passed)| !passed));
    }
}
