use crate::domain::flow::StepId;
use crate::domain::request::ApprovalRequest;
use crate::engine::ApprovalEngine;

/// One pending request awaiting the user's decision.
#[derive(Clone, Debug)]
pub struct QueueItem {
    pub request: ApprovalRequest,
    pub step_id: StepId,
    /// Hours since the current step was entered, for urgency display.
    pub waiting_hours: i64,
}

impl ApprovalEngine {
    /// All pending requests the user may currently decide on: they are in
    /// the resolved approver set for the request's current step and hold no
    /// live decision on that step. Computed on demand from current state.
    pub fn queue_for_user(&self, user_id: &str) -> Vec<QueueItem> {
        let now = self.now();
        let mut items: Vec<QueueItem> = Vec::new();

        for record_arc in self.all_records() {
            let record = Self::lock_record(&record_arc);
            if !record.request.is_open() {
                continue;
            }
            let Some(step) = record.current_step().cloned() else {
                continue;
            };
            let resolved = self.resolve_step(&record, &step, now);
            if !resolved.eligible().contains(user_id) {
                continue;
            }
            if record.live_decision_index(&step.id, user_id).is_some() {
                continue;
            }
            let waiting_hours = record
                .request
                .step_entered_at
                .map(|entered| (now - entered).num_hours())
                .unwrap_or(0);
            items.push(QueueItem { request: record.request.clone(), step_id: step.id, waiting_hours });
        }

        items.sort_by(|left, right| {
            right
                .request
                .priority
                .cmp(&left.request.priority)
                .then_with(|| right.waiting_hours.cmp(&left.waiting_hours))
                .then_with(|| left.request.id.0.cmp(&right.request.id.0))
        });
        items
    }

    pub fn queue_count_for_user(&self, user_id: &str) -> usize {
        self.queue_for_user(user_id).len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use crate::clock::{Clock, ManualClock};
    use crate::conditions::ContextMap;
    use crate::directory::{InMemoryDirectory, NullNotificationSink};
    use crate::domain::decision::DecisionKind;
    use crate::domain::flow::{ApprovalFlow, ApprovalStep, ApproverSpec, FlowId, StepId};
    use crate::domain::request::RequestPriority;
    use crate::engine::{ApprovalEngine, DecideInput, SubmitRequest};

    fn engine(directory: InMemoryDirectory) -> (Arc<ApprovalEngine>, Arc<ManualClock>) {
        let clock =
            Arc::new(ManualClock::starting_at(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()));
        let engine = Arc::new(ApprovalEngine::new(
            Arc::new(directory),
            Arc::new(NullNotificationSink),
            clock.clone(),
            "test-audit-key",
        ));
        (engine, clock)
    }

    fn two_step_flow() -> ApprovalFlow {
        let step = |id: &str, order: u32, approver: ApproverSpec| ApprovalStep {
            id: StepId(id.to_string()),
            flow_id: FlowId("f-1".to_string()),
            step_order: order,
            approver,
            requires_all: false,
            min_approvals: 1,
            skip_conditions: None,
            timeout_hours: None,
            reminder_after_hours: None,
            escalation: None,
        };
        ApprovalFlow {
            id: FlowId("f-1".to_string()),
            name: "Invoice sign-off".to_string(),
            slug: "invoice-signoff".to_string(),
            entity_type: "invoice".to_string(),
            trigger_conditions: None,
            priority: 0,
            allow_parallel_steps: false,
            auto_approve_below: None,
            auto_reject_after_hours: None,
            is_active: true,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            steps: vec![
                step("s-1", 1, ApproverSpec::Role { role_name: "finance".to_string() }),
                step("s-2", 2, ApproverSpec::User { user_id: "u-cfo".to_string() }),
            ],
        }
    }

    fn submission(entity_id: &str, priority: RequestPriority) -> SubmitRequest {
        SubmitRequest {
            entity_type: "invoice".to_string(),
            entity_id: entity_id.to_string(),
            context: ContextMap::new(),
            requested_by: "u-requester".to_string(),
            priority,
            due_by: None,
            note: None,
        }
    }

    fn approve(request_id: &crate::domain::request::RequestId, user: &str) -> DecideInput {
        DecideInput {
            request_id: request_id.clone(),
            decided_by: user.to_string(),
            decision: DecisionKind::Approved,
            comment: None,
            conditions: None,
            delegate_to: None,
        }
    }

    #[test]
    fn queue_lists_only_steps_the_user_can_decide() {
        let directory = InMemoryDirectory::default().with_role("finance", &["u-amy", "u-bob"]);
        let (engine, _clock) = engine(directory);
        engine.register_flow(two_step_flow()).expect("register flow");

        let request =
            engine.submit(submission("INV-1", RequestPriority::Normal)).expect("submit");

        assert_eq!(engine.queue_count_for_user("u-amy"), 1);
        assert_eq!(engine.queue_count_for_user("u-bob"), 1);
        assert_eq!(engine.queue_count_for_user("u-cfo"), 0, "step 2 is not active yet");

        engine.decide(approve(&request.id, "u-amy")).expect("advance to step 2");

        assert_eq!(engine.queue_count_for_user("u-amy"), 0);
        assert_eq!(engine.queue_count_for_user("u-cfo"), 1);
    }

    #[test]
    fn a_user_who_already_decided_drops_out_of_the_queue() {
        let directory =
            InMemoryDirectory::default().with_role("finance", &["u-amy", "u-bob", "u-cara"]);
        let (engine, _clock) = engine(directory);
        let mut flow = two_step_flow();
        flow.steps[0].min_approvals = 2;
        engine.register_flow(flow).expect("register flow");

        let request =
            engine.submit(submission("INV-1", RequestPriority::Normal)).expect("submit");
        engine.decide(approve(&request.id, "u-amy")).expect("first approval");

        assert_eq!(engine.queue_count_for_user("u-amy"), 0, "already decided on this step");
        assert_eq!(engine.queue_count_for_user("u-bob"), 1);
        assert_eq!(engine.queue_count_for_user("u-cara"), 1);
    }

    #[test]
    fn waiting_hours_track_time_since_step_entry() {
        let directory = InMemoryDirectory::default().with_role("finance", &["u-amy"]);
        let (engine, clock) = engine(directory);
        engine.register_flow(two_step_flow()).expect("register flow");
        engine.submit(submission("INV-1", RequestPriority::Normal)).expect("submit");

        clock.advance_hours(30);

        let queue = engine.queue_for_user("u-amy");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].waiting_hours, 30);
        assert_eq!(queue[0].step_id.0, "s-1");
    }

    #[test]
    fn queue_orders_by_priority_then_longest_waiting() {
        let directory = InMemoryDirectory::default().with_role("finance", &["u-amy"]);
        let (engine, clock) = engine(directory);
        engine.register_flow(two_step_flow()).expect("register flow");

        engine.submit(submission("INV-old", RequestPriority::Normal)).expect("submit");
        clock.advance_hours(12);
        engine.submit(submission("INV-new", RequestPriority::Normal)).expect("submit");
        engine.submit(submission("INV-hot", RequestPriority::Urgent)).expect("submit");

        let queue = engine.queue_for_user("u-amy");
        let order: Vec<&str> =
            queue.iter().map(|item| item.request.entity_id.as_str()).collect();
        assert_eq!(order, vec!["INV-hot", "INV-old", "INV-new"]);
    }

    #[test]
    fn standing_delegates_see_their_principal_queue() {
        let directory = InMemoryDirectory::default().with_role("finance", &["u-amy"]);
        let (engine, clock) = engine(directory);
        engine.register_flow(two_step_flow()).expect("register flow");

        let now = clock.now();
        engine
            .add_delegation(crate::domain::delegation::ApprovalDelegation {
                id: crate::domain::delegation::DelegationId("del-1".to_string()),
                delegator_id: "u-amy".to_string(),
                delegate_id: "u-eve".to_string(),
                starts_at: now,
                ends_at: now + chrono::Duration::hours(24),
                reason: None,
                entity_type: None,
                flow_id: None,
                is_active: true,
            })
            .expect("add delegation");
        engine.submit(submission("INV-1", RequestPriority::Normal)).expect("submit");

        assert_eq!(engine.queue_count_for_user("u-eve"), 1);

        clock.advance_hours(48);
        assert_eq!(engine.queue_count_for_user("u-eve"), 0, "window ended");
    }
}
