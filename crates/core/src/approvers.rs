use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::conditions::ContextMap;
use crate::delegation::{DelegationResolver, DelegationScope};
use crate::directory::DirectoryService;
use crate::domain::delegation::ApprovalDelegation;
use crate::domain::flow::{ApprovalStep, ApproverSpec};

/// Context key holding the department for `department_manager` steps.
pub const DEPARTMENT_CONTEXT_KEY: &str = "department";

/// Outcome of resolving one step: the base approver set plus every delegate
/// acting on a base approver's behalf, with the principals each delegate
/// covers tracked so `requires_all` accounting stays correct.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedApprovers {
    base: BTreeSet<String>,
    delegate_principals: BTreeMap<String, BTreeSet<String>>,
    pub cycle_detected: bool,
}

impl ResolvedApprovers {
    pub fn base(&self) -> &BTreeSet<String> {
        &self.base
    }

    pub fn base_count(&self) -> usize {
        self.base.len()
    }

    /// A step with no base approvers is unresolvable.
    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }

    /// Everyone currently allowed to decide the step.
    pub fn eligible(&self) -> BTreeSet<String> {
        let mut eligible = self.base.clone();
        eligible.extend(self.delegate_principals.keys().cloned());
        eligible
    }

    /// Base approvers whose authority the user carries: themselves when they
    /// are a base approver, plus anyone who delegated to them.
    pub fn principals_for(&self, user_id: &str) -> BTreeSet<String> {
        let mut principals = BTreeSet::new();
        if self.base.contains(user_id) {
            principals.insert(user_id.to_string());
        }
        if let Some(covered) = self.delegate_principals.get(user_id) {
            principals.extend(covered.iter().cloned());
        }
        principals
    }

    pub fn add_delegate(&mut self, delegate_id: impl Into<String>, principal_id: impl Into<String>) {
        self.delegate_principals
            .entry(delegate_id.into())
            .or_default()
            .insert(principal_id.into());
    }
}

pub struct ApproverResolver<'a> {
    directory: &'a dyn DirectoryService,
    delegation_resolver: DelegationResolver,
}

impl<'a> ApproverResolver<'a> {
    pub fn new(directory: &'a dyn DirectoryService, delegation_resolver: DelegationResolver) -> Self {
        Self { directory, delegation_resolver }
    }

    /// Resolve the step's approvers against the context snapshot at instant
    /// `at`. `reassigned` replaces the base set when the step was escalated
    /// to new assignees; standing delegations apply to whichever base set is
    /// in effect.
    pub fn resolve(
        &self,
        step: &ApprovalStep,
        entity_type: &str,
        context: &ContextMap,
        delegations: &[ApprovalDelegation],
        reassigned: Option<&[String]>,
        at: DateTime<Utc>,
    ) -> ResolvedApprovers {
        let base: BTreeSet<String> = match reassigned {
            Some(users) => users.iter().cloned().collect(),
            None => self.base_approvers(step, context).into_iter().collect(),
        };

        let mut resolved = ResolvedApprovers { base, ..ResolvedApprovers::default() };
        let scope = DelegationScope { entity_type, flow_id: &step.flow_id };
        for principal in resolved.base.clone() {
            let resolution =
                self.delegation_resolver.effective_delegates(delegations, &principal, scope, at);
            resolved.cycle_detected |= resolution.cycle_detected;
            for delegate in resolution.delegates {
                if resolved.base.contains(&delegate) {
                    continue;
                }
                resolved.add_delegate(delegate, principal.clone());
            }
        }
        resolved
    }

    fn base_approvers(&self, step: &ApprovalStep, context: &ContextMap) -> Vec<String> {
        match &step.approver {
            ApproverSpec::User { user_id } => vec![user_id.clone()],
            ApproverSpec::Role { role_name } => self.directory.users_with_role(role_name),
            ApproverSpec::Group { group_name } => self.directory.group_members(group_name),
            ApproverSpec::DepartmentManager => context
                .get(DEPARTMENT_CONTEXT_KEY)
                .and_then(|value| value.as_text())
                .map(|department| self.directory.department_managers(department))
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::{ApproverResolver, DEPARTMENT_CONTEXT_KEY};
    use crate::conditions::ContextMap;
    use crate::delegation::DelegationResolver;
    use crate::directory::InMemoryDirectory;
    use crate::domain::delegation::{ApprovalDelegation, DelegationId};
    use crate::domain::flow::{ApprovalStep, ApproverSpec, FlowId, StepId};

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    fn step(approver: ApproverSpec) -> ApprovalStep {
        ApprovalStep {
            id: StepId("s-1".to_string()),
            flow_id: FlowId("flow-1".to_string()),
            step_order: 1,
            approver,
            requires_all: false,
            min_approvals: 1,
            skip_conditions: None,
            timeout_hours: None,
            reminder_after_hours: None,
            escalation: None,
        }
    }

    fn grant(delegator: &str, delegate: &str) -> ApprovalDelegation {
        ApprovalDelegation {
            id: DelegationId(format!("del-{delegator}-{delegate}")),
            delegator_id: delegator.to_string(),
            delegate_id: delegate.to_string(),
            starts_at: at() - Duration::days(1),
            ends_at: at() + Duration::days(1),
            reason: None,
            entity_type: None,
            flow_id: None,
            is_active: true,
        }
    }

    #[test]
    fn user_step_resolves_to_the_named_user() {
        let directory = InMemoryDirectory::default();
        let resolver = ApproverResolver::new(&directory, DelegationResolver::default());

        let resolved = resolver.resolve(
            &step(ApproverSpec::User { user_id: "u-amy".to_string() }),
            "invoice",
            &ContextMap::new(),
            &[],
            None,
            at(),
        );

        assert_eq!(resolved.base().iter().map(String::as_str).collect::<Vec<_>>(), vec!["u-amy"]);
        assert!(resolved.eligible().contains("u-amy"));
    }

    #[test]
    fn role_and_group_steps_resolve_through_the_directory() {
        let directory = InMemoryDirectory::default()
            .with_role("finance_manager", &["u-amy", "u-zoe"])
            .with_group("auditors", &["u-kim"]);
        let resolver = ApproverResolver::new(&directory, DelegationResolver::default());

        let role = resolver.resolve(
            &step(ApproverSpec::Role { role_name: "finance_manager".to_string() }),
            "invoice",
            &ContextMap::new(),
            &[],
            None,
            at(),
        );
        let group = resolver.resolve(
            &step(ApproverSpec::Group { group_name: "auditors".to_string() }),
            "invoice",
            &ContextMap::new(),
            &[],
            None,
            at(),
        );

        assert_eq!(role.base_count(), 2);
        assert_eq!(group.base().iter().map(String::as_str).collect::<Vec<_>>(), vec!["u-kim"]);
    }

    #[test]
    fn department_manager_step_reads_the_context_snapshot() {
        let directory =
            InMemoryDirectory::default().with_department_managers("finance", &["u-cfo"]);
        let resolver = ApproverResolver::new(&directory, DelegationResolver::default());
        let mut context = ContextMap::new();
        context.insert(DEPARTMENT_CONTEXT_KEY.to_string(), "finance".into());

        let resolved = resolver.resolve(
            &step(ApproverSpec::DepartmentManager),
            "invoice",
            &context,
            &[],
            None,
            at(),
        );
        let missing_department = resolver.resolve(
            &step(ApproverSpec::DepartmentManager),
            "invoice",
            &ContextMap::new(),
            &[],
            None,
            at(),
        );

        assert_eq!(resolved.base().iter().map(String::as_str).collect::<Vec<_>>(), vec!["u-cfo"]);
        assert!(missing_department.is_empty());
    }

    #[test]
    fn delegates_inherit_eligibility_and_cover_their_principal() {
        let directory = InMemoryDirectory::default();
        let resolver = ApproverResolver::new(&directory, DelegationResolver::default());
        let delegations = vec![grant("u-amy", "u-bob"), grant("u-bob", "u-carol")];

        let resolved = resolver.resolve(
            &step(ApproverSpec::User { user_id: "u-amy".to_string() }),
            "invoice",
            &ContextMap::new(),
            &delegations,
            None,
            at(),
        );

        assert!(resolved.eligible().contains("u-bob"));
        assert!(resolved.eligible().contains("u-carol"));
        assert_eq!(
            resolved.principals_for("u-bob").iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["u-amy"]
        );
        assert!(resolved.principals_for("u-dave").is_empty());
    }

    #[test]
    fn delegate_already_in_base_is_not_double_tracked() {
        let directory =
            InMemoryDirectory::default().with_role("finance_manager", &["u-amy", "u-bob"]);
        let resolver = ApproverResolver::new(&directory, DelegationResolver::default());
        let delegations = vec![grant("u-amy", "u-bob")];

        let resolved = resolver.resolve(
            &step(ApproverSpec::Role { role_name: "finance_manager".to_string() }),
            "invoice",
            &ContextMap::new(),
            &delegations,
            None,
            at(),
        );

        assert_eq!(resolved.eligible().len(), 2);
        assert_eq!(
            resolved.principals_for("u-bob").iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["u-bob"]
        );
    }

    #[test]
    fn reassignment_replaces_the_base_set() {
        let directory = InMemoryDirectory::default();
        let resolver = ApproverResolver::new(&directory, DelegationResolver::default());
        let reassigned = vec!["u-vp".to_string()];

        let resolved = resolver.resolve(
            &step(ApproverSpec::User { user_id: "u-amy".to_string() }),
            "invoice",
            &ContextMap::new(),
            &[],
            Some(&reassigned),
            at(),
        );

        assert_eq!(resolved.base().iter().map(String::as_str).collect::<Vec<_>>(), vec!["u-vp"]);
        assert!(!resolved.eligible().contains("u-amy"));
    }
}
