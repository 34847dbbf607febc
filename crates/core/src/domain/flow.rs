use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::errors::EngineError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

/// Who is asked to decide a step. Closed variant so a new approver kind is a
/// compile-time-checked exhaustive match, not a runtime type probe.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApproverSpec {
    User { user_id: String },
    Role { role_name: String },
    Group { group_name: String },
    /// Managers of the department named in the request's context snapshot.
    DepartmentManager,
}

/// Where a timed-out step is reassigned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscalationTarget {
    User { user_id: String },
    /// The managers of the step's current base approvers, via the directory.
    ApproverManagers,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub id: StepId,
    pub flow_id: FlowId,
    pub step_order: u32,
    pub approver: ApproverSpec,
    /// When true, every currently-resolved approver must approve; otherwise
    /// `min_approvals` distinct approvals complete the step.
    pub requires_all: bool,
    pub min_approvals: u32,
    pub skip_conditions: Option<Condition>,
    pub timeout_hours: Option<i64>,
    pub reminder_after_hours: Option<i64>,
    pub escalation: Option<EscalationTarget>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalFlow {
    pub id: FlowId,
    pub name: String,
    pub slug: String,
    pub entity_type: String,
    pub trigger_conditions: Option<Condition>,
    pub priority: i32,
    pub allow_parallel_steps: bool,
    pub auto_approve_below: Option<Condition>,
    pub auto_reject_after_hours: Option<i64>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub steps: Vec<ApprovalStep>,
}

impl ApprovalFlow {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.slug.trim().is_empty() {
            return Err(EngineError::InvalidConfiguration(format!(
                "flow `{}` has an empty slug",
                self.id.0
            )));
        }
        if let Some(hours) = self.auto_reject_after_hours {
            if hours <= 0 {
                return Err(EngineError::InvalidConfiguration(format!(
                    "flow `{}` has non-positive auto_reject_after_hours",
                    self.slug
                )));
            }
        }

        let mut previous_order: Option<u32> = None;
        for step in &self.steps {
            if step.flow_id != self.id {
                return Err(EngineError::InvalidConfiguration(format!(
                    "step `{}` does not belong to flow `{}`",
                    step.id.0, self.slug
                )));
            }
            if previous_order.is_some_and(|order| step.step_order <= order) {
                return Err(EngineError::InvalidConfiguration(format!(
                    "flow `{}` steps are not strictly ascending at order {}",
                    self.slug, step.step_order
                )));
            }
            previous_order = Some(step.step_order);

            if !step.requires_all && step.min_approvals < 1 {
                return Err(EngineError::InvalidConfiguration(format!(
                    "step `{}` requires min_approvals >= 1",
                    step.id.0
                )));
            }
            if step.timeout_hours.is_some_and(|hours| hours <= 0)
                || step.reminder_after_hours.is_some_and(|hours| hours <= 0)
            {
                return Err(EngineError::InvalidConfiguration(format!(
                    "step `{}` has a non-positive timer",
                    step.id.0
                )));
            }
        }
        Ok(())
    }

    /// Frozen copy taken at submission time. In-flight requests resolve steps
    /// against this snapshot, so flow edits never touch them.
    pub fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            flow_id: self.id.clone(),
            slug: self.slug.clone(),
            auto_reject_after_hours: self.auto_reject_after_hours,
            steps: self.steps.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub flow_id: FlowId,
    pub slug: String,
    pub auto_reject_after_hours: Option<i64>,
    pub steps: Vec<ApprovalStep>,
}

impl FlowSnapshot {
    pub fn step(&self, id: &StepId) -> Option<&ApprovalStep> {
        self.steps.iter().find(|step| &step.id == id)
    }

    pub fn first_step(&self) -> Option<&ApprovalStep> {
        self.steps.first()
    }

    /// Next step in `step_order` after the given one.
    pub fn step_after(&self, id: &StepId) -> Option<&ApprovalStep> {
        let current = self.step(id)?;
        self.steps.iter().find(|step| step.step_order > current.step_order)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{ApprovalFlow, ApprovalStep, ApproverSpec, FlowId, StepId};

    fn step(flow: &str, id: &str, order: u32) -> ApprovalStep {
        ApprovalStep {
            id: StepId(id.to_string()),
            flow_id: FlowId(flow.to_string()),
            step_order: order,
            approver: ApproverSpec::User { user_id: "u-approver".to_string() },
            requires_all: false,
            min_approvals: 1,
            skip_conditions: None,
            timeout_hours: None,
            reminder_after_hours: None,
            escalation: None,
        }
    }

    fn flow(steps: Vec<ApprovalStep>) -> ApprovalFlow {
        ApprovalFlow {
            id: FlowId("flow-1".to_string()),
            name: "Invoice sign-off".to_string(),
            slug: "invoice-signoff".to_string(),
            entity_type: "invoice".to_string(),
            trigger_conditions: None,
            priority: 0,
            allow_parallel_steps: false,
            auto_approve_below: None,
            auto_reject_after_hours: None,
            is_active: true,
            created_at: Utc::now(),
            steps,
        }
    }

    #[test]
    fn validate_accepts_ascending_steps() {
        let flow = flow(vec![step("flow-1", "s-1", 1), step("flow-1", "s-2", 2)]);
        assert!(flow.validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_step_order() {
        let flow = flow(vec![step("flow-1", "s-1", 1), step("flow-1", "s-2", 1)]);
        assert!(flow.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_min_approvals() {
        let mut bad = step("flow-1", "s-1", 1);
        bad.min_approvals = 0;
        let flow = flow(vec![bad]);
        assert!(flow.validate().is_err());
    }

    #[test]
    fn validate_rejects_step_from_other_flow() {
        let flow = flow(vec![step("flow-2", "s-1", 1)]);
        assert!(flow.validate().is_err());
    }

    #[test]
    fn snapshot_walks_steps_in_order() {
        let flow = flow(vec![
            step("flow-1", "s-1", 1),
            step("flow-1", "s-2", 2),
            step("flow-1", "s-3", 5),
        ]);
        let snapshot = flow.snapshot();

        assert_eq!(snapshot.first_step().map(|s| s.id.0.as_str()), Some("s-1"));
        assert_eq!(
            snapshot.step_after(&StepId("s-2".to_string())).map(|s| s.id.0.as_str()),
            Some("s-3")
        );
        assert!(snapshot.step_after(&StepId("s-3".to_string())).is_none());
    }
}
