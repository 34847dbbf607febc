use crate::audit::{AuditAction, AuditActorType};
use crate::directory::NotificationKind;
use crate::engine::ApprovalEngine;

/// What one sweep pass did. Rerunning on unchanged state reports all zeroes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reminders: usize,
    pub escalations: usize,
    pub expirations: usize,
}

impl ApprovalEngine {
    /// One pass over every pending request: expire requests past the flow's
    /// overall timeout, escalate steps past `timeout_hours`, emit one
    /// reminder per step entry past `reminder_after_hours`. Idempotent: the
    /// per-step-entry flags keep a second pass on unchanged state silent.
    /// Scheduling the pass is the host's job.
    pub fn sweep_once(&self) -> SweepReport {
        let now = self.now();
        let mut report = SweepReport::default();

        for record_arc in self.all_records() {
            let mut record = Self::lock_record(&record_arc);
            if !record.request.is_open() {
                continue;
            }

            if self.overall_timeout_elapsed(&record, now) {
                self.expire_request(&mut record, now);
                report.expirations += 1;
                continue;
            }

            let Some(step) = record.current_step().cloned() else {
                continue;
            };
            let Some(entered) = record.request.step_entered_at else {
                continue;
            };
            let waiting_hours = (now - entered).num_hours();

            if !record.escalated
                && step.timeout_hours.is_some_and(|hours| waiting_hours >= hours)
            {
                self.escalate_current_step(
                    &mut record,
                    "timeout-sweeper",
                    AuditActorType::System,
                    now,
                );
                report.escalations += 1;
            }

            if !record.reminder_sent
                && step.reminder_after_hours.is_some_and(|hours| waiting_hours >= hours)
            {
                let resolved = self.resolve_step(&record, &step, now);
                record.reminder_sent = true;
                self.append_audit(
                    &record.request.id,
                    AuditAction::ReminderSent,
                    "timeout-sweeper",
                    AuditActorType::System,
                    &[("step", step.id.0.clone()), ("waiting_hours", waiting_hours.to_string())],
                    now,
                );
                self.send_notification(
                    NotificationKind::ReminderDue,
                    &record.request.id,
                    resolved.eligible().into_iter().collect(),
                    format!(
                        "{} {} has been waiting {} hours for your decision",
                        record.request.entity_type, record.request.entity_id, waiting_hours
                    ),
                );
                report.reminders += 1;
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use super::SweepReport;
    use crate::audit::AuditAction;
    use crate::clock::ManualClock;
    use crate::conditions::ContextMap;
    use crate::directory::{InMemoryDirectory, InMemoryNotificationSink, NotificationKind};
    use crate::domain::decision::DecisionKind;
    use crate::domain::flow::{ApprovalFlow, ApprovalStep, ApproverSpec, FlowId, StepId};
    use crate::domain::request::{RequestPriority, RequestStatus};
    use crate::engine::{ApprovalEngine, DecideInput, SubmitRequest};

    struct Harness {
        engine: Arc<ApprovalEngine>,
        clock: Arc<ManualClock>,
        notifications: InMemoryNotificationSink,
    }

    fn harness(directory: InMemoryDirectory) -> Harness {
        let clock =
            Arc::new(ManualClock::starting_at(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()));
        let notifications = InMemoryNotificationSink::default();
        let engine = Arc::new(ApprovalEngine::new(
            Arc::new(directory),
            Arc::new(notifications.clone()),
            clock.clone(),
            "test-audit-key",
        ));
        Harness { engine, clock, notifications }
    }

    fn timed_flow() -> ApprovalFlow {
        ApprovalFlow {
            id: FlowId("f-1".to_string()),
            name: "Invoice sign-off".to_string(),
            slug: "invoice-signoff".to_string(),
            entity_type: "invoice".to_string(),
            trigger_conditions: None,
            priority: 0,
            allow_parallel_steps: false,
            auto_approve_below: None,
            auto_reject_after_hours: Some(72),
            is_active: true,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            steps: vec![ApprovalStep {
                id: StepId("s-1".to_string()),
                flow_id: FlowId("f-1".to_string()),
                step_order: 1,
                approver: ApproverSpec::User { user_id: "u-amy".to_string() },
                requires_all: false,
                min_approvals: 1,
                skip_conditions: None,
                timeout_hours: Some(24),
                reminder_after_hours: Some(8),
                escalation: None,
            }],
        }
    }

    fn submission(entity_id: &str) -> SubmitRequest {
        SubmitRequest {
            entity_type: "invoice".to_string(),
            entity_id: entity_id.to_string(),
            context: ContextMap::new(),
            requested_by: "u-requester".to_string(),
            priority: RequestPriority::Normal,
            due_by: None,
            note: None,
        }
    }

    #[test]
    fn quiet_state_sweeps_to_nothing() {
        let h = harness(InMemoryDirectory::default().with_manager("u-amy", "u-vp"));
        h.engine.register_flow(timed_flow()).expect("register flow");
        h.engine.submit(submission("INV-1")).expect("submit");

        assert_eq!(h.engine.sweep_once(), SweepReport::default());
    }

    #[test]
    fn reminder_fires_once_per_step_entry() {
        let h = harness(InMemoryDirectory::default().with_manager("u-amy", "u-vp"));
        h.engine.register_flow(timed_flow()).expect("register flow");
        let request = h.engine.submit(submission("INV-1")).expect("submit");

        h.clock.advance_hours(9);
        let first = h.engine.sweep_once();
        assert_eq!(first.reminders, 1);
        assert_eq!(h.notifications.count_of(NotificationKind::ReminderDue), 1);

        let audit_before = h.engine.request_detail(&request.id).expect("detail").audit.len();
        let second = h.engine.sweep_once();
        assert_eq!(second, SweepReport::default(), "a second pass must be silent");
        assert_eq!(h.notifications.count_of(NotificationKind::ReminderDue), 1);
        let audit_after = h.engine.request_detail(&request.id).expect("detail").audit.len();
        assert_eq!(audit_before, audit_after, "idempotent sweep adds no audit entries");
    }

    #[test]
    fn step_timeout_escalates_without_advancing_then_overall_timeout_expires() {
        let h = harness(InMemoryDirectory::default().with_manager("u-amy", "u-vp"));
        h.engine.register_flow(timed_flow()).expect("register flow");
        let request = h.engine.submit(submission("INV-1")).expect("submit");

        h.clock.advance_hours(25);
        let report = h.engine.sweep_once();
        assert_eq!(report.escalations, 1);

        let escalated = h.engine.get_request(&request.id).expect("state");
        assert_eq!(escalated.status, RequestStatus::Pending);
        assert_eq!(escalated.current_step_id.as_ref().map(|id| id.0.as_str()), Some("s-1"));
        assert_eq!(h.engine.queue_count_for_user("u-vp"), 1, "manager took over the step");
        assert_eq!(h.engine.queue_count_for_user("u-amy"), 0);

        let again = h.engine.sweep_once();
        assert_eq!(again.escalations, 0, "a step escalates at most once per entry");

        h.clock.advance_hours(48);
        let expiry = h.engine.sweep_once();
        assert_eq!(expiry.expirations, 1);
        let expired = h.engine.get_request(&request.id).expect("state");
        assert_eq!(expired.status, RequestStatus::Expired);
        assert!(expired.current_step_id.is_none());

        let detail = h.engine.request_detail(&request.id).expect("detail");
        assert!(detail.audit.iter().any(|entry| entry.action == AuditAction::Escalated));
        assert!(detail.audit.iter().any(|entry| entry.action == AuditAction::Expired));
    }

    #[test]
    fn a_decided_request_is_left_alone() {
        let h = harness(InMemoryDirectory::default().with_manager("u-amy", "u-vp"));
        h.engine.register_flow(timed_flow()).expect("register flow");
        let request = h.engine.submit(submission("INV-1")).expect("submit");
        h.engine
            .decide(DecideInput {
                request_id: request.id.clone(),
                decided_by: "u-amy".to_string(),
                decision: DecisionKind::Approved,
                comment: None,
                conditions: None,
                delegate_to: None,
            })
            .expect("approve");

        h.clock.advance_hours(100);
        assert_eq!(h.engine.sweep_once(), SweepReport::default());
        let resolved = h.engine.get_request(&request.id).expect("state");
        assert_eq!(resolved.status, RequestStatus::Approved);
    }

    #[test]
    fn reminder_flag_resets_when_a_new_step_is_entered() {
        let directory = InMemoryDirectory::default().with_manager("u-amy", "u-vp");
        let h = harness(directory);
        let mut flow = timed_flow();
        flow.steps.push(ApprovalStep {
            id: StepId("s-2".to_string()),
            flow_id: FlowId("f-1".to_string()),
            step_order: 2,
            approver: ApproverSpec::User { user_id: "u-bob".to_string() },
            requires_all: false,
            min_approvals: 1,
            skip_conditions: None,
            timeout_hours: None,
            reminder_after_hours: Some(8),
            escalation: None,
        });
        h.engine.register_flow(flow).expect("register flow");
        let request = h.engine.submit(submission("INV-1")).expect("submit");

        h.clock.advance_hours(9);
        assert_eq!(h.engine.sweep_once().reminders, 1);

        h.engine
            .decide(DecideInput {
                request_id: request.id.clone(),
                decided_by: "u-amy".to_string(),
                decision: DecisionKind::Approved,
                comment: None,
                conditions: None,
                delegate_to: None,
            })
            .expect("advance to step 2");

        h.clock.advance_hours(9);
        assert_eq!(h.engine.sweep_once().reminders, 1, "fresh step entry earns its own reminder");
        assert_eq!(h.notifications.count_of(NotificationKind::ReminderDue), 2);
    }
}
