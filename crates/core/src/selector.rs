use crate::conditions::ContextMap;
use crate::domain::flow::ApprovalFlow;

/// True when the flow is a candidate for this submission: active, bound to the
/// entity type, and its trigger conditions (if any) match the context.
pub fn flow_matches(flow: &ApprovalFlow, entity_type: &str, context: &ContextMap) -> bool {
    flow.is_active
        && flow.entity_type == entity_type
        && flow
            .trigger_conditions
            .as_ref()
            .map_or(true, |conditions| conditions.evaluate(context))
}

/// Pick the single applicable flow for a submission: the matching flow with
/// the highest priority. Ties break by earliest `created_at`, then lowest id,
/// so selection is deterministic and the oldest flow wins.
pub fn select_flow<'a>(
    flows: impl IntoIterator<Item = &'a ApprovalFlow>,
    entity_type: &str,
    context: &ContextMap,
) -> Option<&'a ApprovalFlow> {
    let mut candidates: Vec<&ApprovalFlow> = flows
        .into_iter()
        .filter(|flow| flow_matches(flow, entity_type, context))
        .collect();
    candidates.sort_by(|left, right| {
        right
            .priority
            .cmp(&left.priority)
            .then_with(|| left.created_at.cmp(&right.created_at))
            .then_with(|| left.id.0.cmp(&right.id.0))
    });
    candidates.into_iter().next()
}

/// True when the selected flow short-circuits the request straight to
/// approved, with no steps evaluated.
pub fn auto_approves(flow: &ApprovalFlow, context: &ContextMap) -> bool {
    flow.auto_approve_below.as_ref().is_some_and(|predicate| predicate.evaluate(context))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{auto_approves, select_flow};
    use crate::conditions::{Condition, ContextMap};
    use crate::domain::flow::{ApprovalFlow, FlowId};

    fn flow(id: &str, priority: i32, age_days: i64) -> ApprovalFlow {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        ApprovalFlow {
            id: FlowId(id.to_string()),
            name: format!("Flow {id}"),
            slug: format!("flow-{id}"),
            entity_type: "invoice".to_string(),
            trigger_conditions: None,
            priority,
            allow_parallel_steps: false,
            auto_approve_below: None,
            auto_reject_after_hours: None,
            is_active: true,
            created_at: base - Duration::days(age_days),
            steps: Vec::new(),
        }
    }

    fn context(entries: &[(&str, i64)]) -> ContextMap {
        entries.iter().map(|(key, value)| (key.to_string(), (*value).into())).collect()
    }

    #[test]
    fn highest_priority_flow_wins() {
        let flows = vec![flow("a", 1, 0), flow("b", 10, 0), flow("c", 5, 0)];

        let selected = select_flow(&flows, "invoice", &ContextMap::new());
        assert_eq!(selected.map(|f| f.id.0.as_str()), Some("b"));
    }

    #[test]
    fn priority_ties_break_toward_the_oldest_flow() {
        let flows = vec![flow("newer", 5, 1), flow("older", 5, 30)];

        let selected = select_flow(&flows, "invoice", &ContextMap::new());
        assert_eq!(selected.map(|f| f.id.0.as_str()), Some("older"));
    }

    #[test]
    fn identical_age_ties_break_by_lowest_id() {
        let flows = vec![flow("b", 5, 0), flow("a", 5, 0)];

        let selected = select_flow(&flows, "invoice", &ContextMap::new());
        assert_eq!(selected.map(|f| f.id.0.as_str()), Some("a"));
    }

    #[test]
    fn inactive_and_foreign_entity_flows_are_excluded() {
        let mut inactive = flow("inactive", 100, 0);
        inactive.is_active = false;
        let mut other_entity = flow("project", 100, 0);
        other_entity.entity_type = "project".to_string();
        let flows = vec![inactive, other_entity, flow("plain", 1, 0)];

        let selected = select_flow(&flows, "invoice", &ContextMap::new());
        assert_eq!(selected.map(|f| f.id.0.as_str()), Some("plain"));
    }

    #[test]
    fn trigger_conditions_filter_candidates() {
        let mut gated = flow("gated", 10, 0);
        gated.trigger_conditions =
            Some(Condition::Gte { field: "amount".to_string(), value: 1_000.into() });
        let flows = vec![gated, flow("fallback", 1, 0)];

        let high = select_flow(&flows, "invoice", &context(&[("amount", 5_000)]));
        let low = select_flow(&flows, "invoice", &context(&[("amount", 50)]));

        assert_eq!(high.map(|f| f.id.0.as_str()), Some("gated"));
        assert_eq!(low.map(|f| f.id.0.as_str()), Some("fallback"));
    }

    #[test]
    fn no_candidates_yields_none() {
        let flows = vec![flow("a", 1, 0)];
        assert!(select_flow(&flows, "expense", &ContextMap::new()).is_none());
    }

    #[test]
    fn auto_approve_requires_a_matching_predicate() {
        let mut fast_path = flow("fast", 1, 0);
        fast_path.auto_approve_below =
            Some(Condition::Lt { field: "amount".to_string(), value: 100.into() });

        assert!(auto_approves(&fast_path, &context(&[("amount", 50)])));
        assert!(!auto_approves(&fast_path, &context(&[("amount", 500)])));
        assert!(!auto_approves(&flow("plain", 1, 0), &context(&[("amount", 50)])));
    }
}
