use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::approvers::{ApproverResolver, ResolvedApprovers};
use crate::audit::{AuditAction, AuditActorType, AuditEntry, AuditRecorder, ChainVerification};
use crate::clock::Clock;
use crate::conditions::ContextMap;
use crate::delegation::DelegationResolver;
use crate::directory::{DirectoryService, Notification, NotificationKind, NotificationSink};
use crate::domain::decision::{ApprovalDecision, DecisionId, DecisionKind};
use crate::domain::delegation::{ApprovalDelegation, DelegationId};
use crate::domain::flow::{ApprovalFlow, ApprovalStep, EscalationTarget, FlowId, StepId};
use crate::domain::request::{ApprovalRequest, RequestId, RequestPriority, RequestStatus};
use crate::errors::{EngineError, TransitionBlock};
use crate::selector::{auto_approves, select_flow};

/// A submission entering the engine through the stable contract.
#[derive(Clone, Debug)]
pub struct SubmitRequest {
    pub entity_type: String,
    pub entity_id: String,
    pub context: ContextMap,
    pub requested_by: String,
    pub priority: RequestPriority,
    pub due_by: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

/// One approver action on a request's current step.
#[derive(Clone, Debug)]
pub struct DecideInput {
    pub request_id: RequestId,
    pub decided_by: String,
    pub decision: DecisionKind,
    pub comment: Option<String>,
    pub conditions: Option<serde_json::Value>,
    pub delegate_to: Option<String>,
}

/// Full view of one request: projection, snapshotted steps, decisions, audit.
#[derive(Clone, Debug)]
pub struct RequestDetail {
    pub request: ApprovalRequest,
    pub steps: Vec<ApprovalStep>,
    pub decisions: Vec<ApprovalDecision>,
    pub audit: Vec<AuditEntry>,
}

/// Filter for the global audit query.
#[derive(Clone, Debug)]
pub struct AuditFilter {
    pub action: Option<AuditAction>,
    pub actor_id: Option<String>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for AuditFilter {
    fn default() -> Self {
        Self { action: None, actor_id: None, offset: 0, limit: 50 }
    }
}

/// A per-request hand-off recorded by a `delegated` decision. Unlike a
/// standing delegation it applies to exactly one request and step.
#[derive(Clone, Debug)]
pub(crate) struct AdHocDelegate {
    pub(crate) delegate_id: String,
    pub(crate) principal_ids: BTreeSet<String>,
}

/// Mutable state of one request. Every transition runs under this record's
/// mutex, which is what makes step-completion counting race-free.
pub(crate) struct RequestRecord {
    pub(crate) request: ApprovalRequest,
    pub(crate) flow: crate::domain::flow::FlowSnapshot,
    pub(crate) decisions: Vec<ApprovalDecision>,
    /// Escalation reassignments, keyed by step id.
    pub(crate) reassignments: HashMap<String, Vec<String>>,
    /// `delegated` decisions, keyed by step id.
    pub(crate) adhoc_delegates: HashMap<String, Vec<AdHocDelegate>>,
    /// Sweep idempotency flags, reset on each step entry.
    pub(crate) reminder_sent: bool,
    pub(crate) escalated: bool,
}

impl RequestRecord {
    pub(crate) fn current_step(&self) -> Option<&ApprovalStep> {
        self.request.current_step_id.as_ref().and_then(|id| self.flow.step(id))
    }

    pub(crate) fn live_decision_index(&self, step_id: &StepId, user_id: &str) -> Option<usize> {
        self.decisions.iter().position(|decision| {
            !decision.superseded
                && &decision.step_id == step_id
                && decision.decided_by == user_id
        })
    }
}

/// The approval workflow engine: flow selection, the request state machine,
/// queue and sweep computation, and the append-only audit trail, behind the
/// stable submit/decide/cancel/resubmit/escalate contract.
pub struct ApprovalEngine {
    flows: RwLock<HashMap<String, ApprovalFlow>>,
    delegations: RwLock<Vec<ApprovalDelegation>>,
    requests: RwLock<HashMap<String, Arc<Mutex<RequestRecord>>>>,
    audit: AuditRecorder,
    directory: Arc<dyn DirectoryService>,
    notifications: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    delegation_resolver: DelegationResolver,
}

impl ApprovalEngine {
    pub fn new(
        directory: Arc<dyn DirectoryService>,
        notifications: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        audit_signing_key: impl AsRef<[u8]>,
    ) -> Self {
        Self {
            flows: RwLock::new(HashMap::new()),
            delegations: RwLock::new(Vec::new()),
            requests: RwLock::new(HashMap::new()),
            audit: AuditRecorder::new(audit_signing_key),
            directory,
            notifications,
            clock,
            delegation_resolver: DelegationResolver::default(),
        }
    }

    pub fn with_max_delegation_depth(mut self, max_depth: usize) -> Self {
        self.delegation_resolver = DelegationResolver::new(max_depth);
        self
    }

    // ---- stable contract ----------------------------------------------------

    pub fn submit(&self, input: SubmitRequest) -> Result<ApprovalRequest, EngineError> {
        self.create_request(input, None)
    }

    pub fn decide(&self, input: DecideInput) -> Result<ApprovalRequest, EngineError> {
        let record_arc = self.record_arc(&input.request_id)?;
        let mut record = Self::lock_record(&record_arc);
        let now = self.clock.now();

        if record.request.status.is_terminal() {
            tracing::warn!(
                request = input.request_id.0.as_str(),
                actor = input.decided_by.as_str(),
                status = ?record.request.status,
                "decision rejected: request is terminal"
            );
            return Err(EngineError::illegal(
                &input.request_id.0,
                TransitionBlock::Terminal { status: record.request.status },
            ));
        }
        let step = match record.current_step() {
            Some(step) => step.clone(),
            None => {
                return Err(EngineError::illegal(
                    &input.request_id.0,
                    TransitionBlock::NoCurrentStep,
                ))
            }
        };

        let resolved = self.resolve_step(&record, &step, now);
        if !resolved.eligible().contains(&input.decided_by) {
            return Err(EngineError::illegal(
                &input.request_id.0,
                TransitionBlock::NotEligible { actor: input.decided_by },
            ));
        }
        let delegate_to = match input.decision {
            DecisionKind::Delegated => match &input.delegate_to {
                Some(delegate) => Some(delegate.clone()),
                None => {
                    return Err(EngineError::illegal(
                        &input.request_id.0,
                        TransitionBlock::MissingDelegate,
                    ))
                }
            },
            _ => None,
        };
        if let Some(index) = record.live_decision_index(&step.id, &input.decided_by) {
            match record.decisions[index].decision {
                DecisionKind::Approved => {
                    return Err(EngineError::illegal(
                        &input.request_id.0,
                        TransitionBlock::AlreadyDecided { actor: input.decided_by },
                    ))
                }
                // A hand-off or abstention can be replaced by a real decision.
                _ => record.decisions[index].superseded = true,
            }
        }

        let decision = ApprovalDecision {
            id: DecisionId(Uuid::new_v4().to_string()),
            request_id: input.request_id.clone(),
            step_id: step.id.clone(),
            decided_by: input.decided_by.clone(),
            decision: input.decision,
            comment: input.comment.clone(),
            conditions: input.conditions.clone(),
            delegated_to: delegate_to.clone(),
            decided_at: now,
            superseded: false,
        };
        record.decisions.push(decision);
        record.request.version += 1;

        let mut decision_details = vec![
            ("decision", input.decision.as_key().to_string()),
            ("step", step.id.0.clone()),
        ];
        let principals = resolved.principals_for(&input.decided_by);
        if !principals.contains(&input.decided_by) {
            decision_details.push((
                "on_behalf_of",
                principals.iter().cloned().collect::<Vec<_>>().join(","),
            ));
        }
        if let Some(delegate) = &delegate_to {
            decision_details.push(("delegated_to", delegate.clone()));
        }
        self.append_audit(
            &input.request_id,
            AuditAction::DecisionRecorded,
            &input.decided_by,
            AuditActorType::User,
            &decision_details,
            now,
        );

        match input.decision {
            DecisionKind::Rejected => {
                self.finalize(
                    &mut record,
                    RequestStatus::Rejected,
                    AuditAction::Rejected,
                    &input.decided_by,
                    AuditActorType::User,
                    input.comment,
                    now,
                );
            }
            DecisionKind::Returned => {
                self.finalize(
                    &mut record,
                    RequestStatus::Returned,
                    AuditAction::Returned,
                    &input.decided_by,
                    AuditActorType::User,
                    input.comment,
                    now,
                );
            }
            DecisionKind::Delegated => {
                let delegate = delegate_to.unwrap_or_default();
                record
                    .adhoc_delegates
                    .entry(step.id.0.clone())
                    .or_default()
                    .push(AdHocDelegate { delegate_id: delegate.clone(), principal_ids: principals });
                self.send_notification(
                    NotificationKind::ApprovalRequested,
                    &record.request.id,
                    vec![delegate],
                    format!(
                        "decision on {} {} was handed off to you",
                        record.request.entity_type, record.request.entity_id
                    ),
                );
            }
            DecisionKind::Approved | DecisionKind::Abstained => {
                if Self::step_satisfied(&record, &step, &resolved) {
                    self.append_audit(
                        &record.request.id,
                        AuditAction::StepAdvanced,
                        &input.decided_by,
                        AuditActorType::User,
                        &[("completed_step", step.id.0.clone())],
                        now,
                    );
                    self.enter_from(
                        &mut record,
                        Some(&step.id),
                        &input.decided_by,
                        AuditActorType::User,
                        now,
                    );
                }
            }
        }

        Ok(record.request.clone())
    }

    /// Cancel a pending request. Idempotent against an already-cancelled
    /// request; cancelling any other terminal state is illegal.
    pub fn cancel(
        &self,
        request_id: &RequestId,
        actor: &str,
        admin_override: bool,
    ) -> Result<ApprovalRequest, EngineError> {
        let record_arc = self.record_arc(request_id)?;
        let mut record = Self::lock_record(&record_arc);
        let now = self.clock.now();

        match record.request.status {
            RequestStatus::Cancelled => return Ok(record.request.clone()),
            RequestStatus::Pending => {}
            status => {
                return Err(EngineError::illegal(&request_id.0, TransitionBlock::Terminal { status }))
            }
        }
        if record.request.requested_by != actor && !admin_override {
            return Err(EngineError::illegal(&request_id.0, TransitionBlock::NotRequester));
        }

        record.request.status = RequestStatus::Cancelled;
        record.request.current_step_id = None;
        record.request.resolved_at = Some(now);
        record.request.version += 1;
        self.append_audit(
            request_id,
            AuditAction::Cancelled,
            actor,
            AuditActorType::User,
            &[("admin_override", admin_override.to_string())],
            now,
        );
        self.send_notification(
            NotificationKind::RequestResolved,
            request_id,
            vec![record.request.requested_by.clone()],
            format!("{} {} was cancelled", record.request.entity_type, record.request.entity_id),
        );
        Ok(record.request.clone())
    }

    /// Create a fresh request for the same entity after a return or
    /// rejection. The prior request is linked, never mutated.
    pub fn resubmit(
        &self,
        request_id: &RequestId,
        actor: &str,
        context: ContextMap,
    ) -> Result<ApprovalRequest, EngineError> {
        let prior = {
            let record_arc = self.record_arc(request_id)?;
            let record = Self::lock_record(&record_arc);
            if !matches!(record.request.status, RequestStatus::Returned | RequestStatus::Rejected) {
                return Err(EngineError::illegal(&request_id.0, TransitionBlock::NotResubmittable));
            }
            if record.request.requested_by != actor {
                return Err(EngineError::illegal(&request_id.0, TransitionBlock::NotRequester));
            }
            record.request.clone()
        };

        self.create_request(
            SubmitRequest {
                entity_type: prior.entity_type,
                entity_id: prior.entity_id,
                context,
                requested_by: prior.requested_by,
                priority: prior.priority,
                due_by: prior.due_by,
                note: None,
            },
            Some(prior.id),
        )
    }

    /// Explicit escalation. On a pending request the current step is
    /// reassigned to the escalation target (or, past the flow's overall
    /// timeout, the request expires); on a terminal request this returns the
    /// current state unchanged.
    pub fn escalate(&self, request_id: &RequestId, actor: &str) -> Result<ApprovalRequest, EngineError> {
        let record_arc = self.record_arc(request_id)?;
        let mut record = Self::lock_record(&record_arc);
        let now = self.clock.now();

        if record.request.status.is_terminal() {
            return Ok(record.request.clone());
        }
        if self.overall_timeout_elapsed(&record, now) {
            self.expire_request(&mut record, now);
        } else {
            self.escalate_current_step(&mut record, actor, AuditActorType::User, now);
        }
        Ok(record.request.clone())
    }

    // ---- queries ------------------------------------------------------------

    pub fn get_request(&self, request_id: &RequestId) -> Result<ApprovalRequest, EngineError> {
        let record_arc = self.record_arc(request_id)?;
        let record = Self::lock_record(&record_arc);
        Ok(record.request.clone())
    }

    pub fn request_detail(&self, request_id: &RequestId) -> Result<RequestDetail, EngineError> {
        let record_arc = self.record_arc(request_id)?;
        let record = Self::lock_record(&record_arc);
        Ok(RequestDetail {
            request: record.request.clone(),
            steps: record.flow.steps.clone(),
            decisions: record.decisions.clone(),
            audit: self.audit.entries_for_request(request_id),
        })
    }

    /// Raise the configuration gap on the current step, if any: a step whose
    /// approver set is empty cannot progress without administrator action.
    pub fn probe_current_step(&self, request_id: &RequestId) -> Result<(), EngineError> {
        let record_arc = self.record_arc(request_id)?;
        let record = Self::lock_record(&record_arc);
        let Some(step) = record.current_step().cloned() else {
            return Ok(());
        };
        let resolved = self.resolve_step(&record, &step, self.clock.now());
        if resolved.is_empty() {
            return Err(EngineError::StepUnresolvable {
                request_id: request_id.0.clone(),
                step_id: step.id.0,
            });
        }
        Ok(())
    }

    /// Every request ever opened for the entity, oldest first.
    pub fn entity_history(&self, entity_type: &str, entity_id: &str) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> = self
            .all_records()
            .iter()
            .map(|arc| Self::lock_record(arc).request.clone())
            .filter(|request| request.entity_type == entity_type && request.entity_id == entity_id)
            .collect();
        requests.sort_by(|left, right| {
            left.requested_at.cmp(&right.requested_at).then_with(|| left.id.0.cmp(&right.id.0))
        });
        requests
    }

    pub fn global_audit(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        self.audit
            .all_entries()
            .into_iter()
            .filter(|entry| filter.action.map_or(true, |action| entry.action == action))
            .filter(|entry| {
                filter.actor_id.as_deref().map_or(true, |actor| entry.actor_id == actor)
            })
            .skip(filter.offset)
            .take(filter.limit)
            .collect()
    }

    pub fn verify_audit_chain(&self, request_id: &RequestId) -> ChainVerification {
        self.audit.verify_chain(request_id)
    }

    // ---- administration -----------------------------------------------------

    pub fn register_flow(&self, flow: ApprovalFlow) -> Result<(), EngineError> {
        flow.validate()?;
        let mut flows = self.write_flows();
        if flows.contains_key(&flow.id.0) {
            return Err(EngineError::InvalidConfiguration(format!(
                "flow `{}` is already registered",
                flow.id.0
            )));
        }
        if flows.values().any(|existing| existing.slug == flow.slug) {
            return Err(EngineError::InvalidConfiguration(format!(
                "flow slug `{}` is already in use",
                flow.slug
            )));
        }
        flows.insert(flow.id.0.clone(), flow);
        Ok(())
    }

    /// Replace a flow definition. In-flight requests are untouched: they
    /// resolve steps against the snapshot taken at submission.
    pub fn update_flow(&self, flow: ApprovalFlow) -> Result<(), EngineError> {
        flow.validate()?;
        let mut flows = self.write_flows();
        if !flows.contains_key(&flow.id.0) {
            return Err(EngineError::InvalidConfiguration(format!(
                "flow `{}` is not registered",
                flow.id.0
            )));
        }
        flows.insert(flow.id.0.clone(), flow);
        Ok(())
    }

    pub fn set_flow_active(&self, flow_id: &FlowId, is_active: bool) -> Result<(), EngineError> {
        let mut flows = self.write_flows();
        match flows.get_mut(&flow_id.0) {
            Some(flow) => {
                flow.is_active = is_active;
                Ok(())
            }
            None => Err(EngineError::InvalidConfiguration(format!(
                "flow `{}` is not registered",
                flow_id.0
            ))),
        }
    }

    pub fn add_delegation(&self, delegation: ApprovalDelegation) -> Result<(), EngineError> {
        delegation.validate()?;
        self.write_delegations().push(delegation);
        Ok(())
    }

    pub fn end_delegation(&self, delegation_id: &DelegationId) -> Result<(), EngineError> {
        let mut delegations = self.write_delegations();
        match delegations.iter_mut().find(|delegation| &delegation.id == delegation_id) {
            Some(delegation) => {
                delegation.is_active = false;
                Ok(())
            }
            None => Err(EngineError::InvalidConfiguration(format!(
                "delegation `{}` is not registered",
                delegation_id.0
            ))),
        }
    }

    /// Active delegations touching the user at instant `at`, as delegator or
    /// delegate.
    pub fn delegations_affecting(&self, user_id: &str, at: DateTime<Utc>) -> Vec<ApprovalDelegation> {
        self.read_delegations()
            .iter()
            .filter(|delegation| delegation.active_at(at))
            .filter(|delegation| {
                delegation.delegator_id == user_id || delegation.delegate_id == user_id
            })
            .cloned()
            .collect()
    }

    // ---- internals ----------------------------------------------------------

    fn create_request(
        &self,
        input: SubmitRequest,
        resubmitted_from: Option<RequestId>,
    ) -> Result<ApprovalRequest, EngineError> {
        let now = self.clock.now();
        // The map write lock is held across the open-request check and the
        // insert so two racing submissions cannot both pass the check.
        let mut requests = self.write_requests();
        for existing in requests.values() {
            let existing = Self::lock_record(existing);
            if existing.request.is_open()
                && existing.request.entity_type == input.entity_type
                && existing.request.entity_id == input.entity_id
            {
                return Err(EngineError::OpenRequestExists {
                    entity_type: input.entity_type,
                    entity_id: input.entity_id,
                    request_id: existing.request.id.0.clone(),
                });
            }
        }

        let flow = {
            let flows = self.read_flows();
            select_flow(flows.values(), &input.entity_type, &input.context)
                .cloned()
                .ok_or(EngineError::NoApplicableFlow { entity_type: input.entity_type.clone() })?
        };

        let request_id = RequestId(Uuid::new_v4().to_string());
        let request = ApprovalRequest {
            id: request_id.clone(),
            entity_type: input.entity_type,
            entity_id: input.entity_id,
            flow_id: flow.id.clone(),
            current_step_id: None,
            status: RequestStatus::Pending,
            context_snapshot: input.context,
            requested_by: input.requested_by,
            requested_at: now,
            resolved_at: None,
            resolution_note: None,
            priority: input.priority,
            due_by: input.due_by,
            resubmitted_from: resubmitted_from.clone(),
            step_entered_at: None,
            version: 1,
        };
        let mut record = RequestRecord {
            flow: flow.snapshot(),
            request,
            decisions: Vec::new(),
            reassignments: HashMap::new(),
            adhoc_delegates: HashMap::new(),
            reminder_sent: false,
            escalated: false,
        };

        if auto_approves(&flow, &record.request.context_snapshot) {
            record.request.status = RequestStatus::Approved;
            record.request.resolved_at = Some(now);
            let mut details = vec![("flow", flow.slug.clone())];
            if let Some(prior) = &resubmitted_from {
                details.push(("resubmitted_from", prior.0.clone()));
            }
            self.append_audit(
                &request_id,
                AuditAction::AutoApproved,
                "workflow-engine",
                AuditActorType::System,
                &details,
                now,
            );
            self.send_notification(
                NotificationKind::RequestResolved,
                &request_id,
                vec![record.request.requested_by.clone()],
                format!(
                    "{} {} was auto-approved",
                    record.request.entity_type, record.request.entity_id
                ),
            );
        } else {
            let (action, mut details) = match &resubmitted_from {
                Some(prior) => (
                    AuditAction::Resubmitted,
                    vec![("flow", flow.slug.clone()), ("resubmitted_from", prior.0.clone())],
                ),
                None => (AuditAction::Submitted, vec![("flow", flow.slug.clone())]),
            };
            if let Some(note) = &input.note {
                details.push(("note", note.clone()));
            }
            let requester = record.request.requested_by.clone();
            self.append_audit(&request_id, action, &requester, AuditActorType::User, &details, now);
            self.enter_from(&mut record, None, &requester, AuditActorType::User, now);
        }

        let created = record.request.clone();
        requests.insert(request_id.0.clone(), Arc::new(Mutex::new(record)));
        Ok(created)
    }

    /// Walk forward from `after` (or the first step) to the next step whose
    /// skip conditions do not match, auditing every skip; finalize as
    /// approved when no step remains.
    fn enter_from(
        &self,
        record: &mut RequestRecord,
        after: Option<&StepId>,
        actor_id: &str,
        actor_type: AuditActorType,
        now: DateTime<Utc>,
    ) {
        let steps = record.flow.steps.clone();
        let mut min_order = after
            .and_then(|id| record.flow.step(id))
            .map(|step| step.step_order);

        loop {
            let next = steps.iter().find(|step| match min_order {
                Some(order) => step.step_order > order,
                None => true,
            });
            let Some(step) = next else {
                self.finalize(
                    record,
                    RequestStatus::Approved,
                    AuditAction::Approved,
                    actor_id,
                    actor_type,
                    None,
                    now,
                );
                return;
            };

            let skipped = step
                .skip_conditions
                .as_ref()
                .is_some_and(|conditions| conditions.evaluate(&record.request.context_snapshot));
            if skipped {
                self.append_audit(
                    &record.request.id,
                    AuditAction::StepSkipped,
                    "workflow-engine",
                    AuditActorType::System,
                    &[("step", step.id.0.clone()), ("step_order", step.step_order.to_string())],
                    now,
                );
                min_order = Some(step.step_order);
                continue;
            }

            record.request.current_step_id = Some(step.id.clone());
            record.request.step_entered_at = Some(now);
            record.reminder_sent = false;
            record.escalated = false;
            record.request.version += 1;

            let resolved = self.resolve_step(record, step, now);
            if resolved.is_empty() {
                tracing::warn!(
                    request = record.request.id.0.as_str(),
                    step = step.id.0.as_str(),
                    "step resolves to no approvers; request held for administrator"
                );
                self.append_audit(
                    &record.request.id,
                    AuditAction::StepUnresolvable,
                    "workflow-engine",
                    AuditActorType::System,
                    &[("step", step.id.0.clone()), ("reason", "no approvers resolve".to_string())],
                    now,
                );
            } else if !step.requires_all && (step.min_approvals as usize) > resolved.base_count() {
                tracing::warn!(
                    request = record.request.id.0.as_str(),
                    step = step.id.0.as_str(),
                    min_approvals = step.min_approvals,
                    resolved = resolved.base_count(),
                    "min_approvals exceeds the resolved approver count"
                );
                self.append_audit(
                    &record.request.id,
                    AuditAction::StepUnresolvable,
                    "workflow-engine",
                    AuditActorType::System,
                    &[
                        ("step", step.id.0.clone()),
                        ("reason", "min_approvals exceeds resolved approvers".to_string()),
                    ],
                    now,
                );
            } else {
                self.send_notification(
                    NotificationKind::ApprovalRequested,
                    &record.request.id,
                    resolved.eligible().into_iter().collect(),
                    format!(
                        "approval requested for {} {}",
                        record.request.entity_type, record.request.entity_id
                    ),
                );
            }
            return;
        }
    }

    fn finalize(
        &self,
        record: &mut RequestRecord,
        status: RequestStatus,
        action: AuditAction,
        actor_id: &str,
        actor_type: AuditActorType,
        note: Option<String>,
        now: DateTime<Utc>,
    ) {
        record.request.status = status;
        record.request.current_step_id = None;
        record.request.resolved_at = Some(now);
        if note.is_some() {
            record.request.resolution_note = note;
        }
        record.request.version += 1;
        self.append_audit(&record.request.id, action, actor_id, actor_type, &[], now);
        self.send_notification(
            NotificationKind::RequestResolved,
            &record.request.id,
            vec![record.request.requested_by.clone()],
            format!(
                "{} {} was resolved as {}",
                record.request.entity_type,
                record.request.entity_id,
                action.as_key()
            ),
        );
    }

    /// Completion rule for the current step. Abstaining approvers leave the
    /// denominator; a delegate's approval covers every principal they act
    /// for; at least one counting approval is always required.
    fn step_satisfied(
        record: &RequestRecord,
        step: &ApprovalStep,
        resolved: &ResolvedApprovers,
    ) -> bool {
        let approvals: Vec<&ApprovalDecision> = record
            .decisions
            .iter()
            .filter(|decision| decision.step_id == step.id && decision.counts_toward_completion())
            .collect();
        if approvals.is_empty() {
            return false;
        }

        if step.requires_all {
            let abstained: BTreeSet<&str> = record
                .decisions
                .iter()
                .filter(|decision| {
                    !decision.superseded
                        && decision.step_id == step.id
                        && decision.decision == DecisionKind::Abstained
                })
                .map(|decision| decision.decided_by.as_str())
                .collect();
            let mut covered: BTreeSet<String> = BTreeSet::new();
            for approval in &approvals {
                covered.extend(resolved.principals_for(&approval.decided_by));
            }
            resolved
                .base()
                .iter()
                .filter(|principal| !abstained.contains(principal.as_str()))
                .all(|principal| covered.contains(principal))
        } else {
            let distinct: BTreeSet<&str> =
                approvals.iter().map(|decision| decision.decided_by.as_str()).collect();
            distinct.len() >= step.min_approvals as usize
        }
    }

    /// Reassign the current step to the escalation target without advancing
    /// it. With no configured target the current approvers' managers stand
    /// in; an empty target set leaves the request pending with a warning.
    pub(crate) fn escalate_current_step(
        &self,
        record: &mut RequestRecord,
        actor_id: &str,
        actor_type: AuditActorType,
        now: DateTime<Utc>,
    ) {
        let Some(step) = record.current_step().cloned() else {
            return;
        };
        let targets: Vec<String> = match &step.escalation {
            Some(EscalationTarget::User { user_id }) => vec![user_id.clone()],
            Some(EscalationTarget::ApproverManagers) | None => {
                let resolved = self.resolve_step(record, &step, now);
                resolved
                    .base()
                    .iter()
                    .filter_map(|approver| self.directory.manager_of(approver))
                    .collect::<BTreeSet<String>>()
                    .into_iter()
                    .collect()
            }
        };

        record.escalated = true;
        record.request.version += 1;
        if targets.is_empty() {
            tracing::warn!(
                request = record.request.id.0.as_str(),
                step = step.id.0.as_str(),
                "escalation found no target; request stays with current approvers"
            );
            self.append_audit(
                &record.request.id,
                AuditAction::Escalated,
                actor_id,
                actor_type,
                &[("step", step.id.0.clone()), ("outcome", "no_escalation_target".to_string())],
                now,
            );
            return;
        }

        record.reassignments.insert(step.id.0.clone(), targets.clone());
        self.append_audit(
            &record.request.id,
            AuditAction::Escalated,
            actor_id,
            actor_type,
            &[("step", step.id.0.clone()), ("reassigned_to", targets.join(","))],
            now,
        );
        self.send_notification(
            NotificationKind::StepEscalated,
            &record.request.id,
            targets,
            format!(
                "{} {} escalated to you after a step timeout",
                record.request.entity_type, record.request.entity_id
            ),
        );
    }

    pub(crate) fn expire_request(&self, record: &mut RequestRecord, now: DateTime<Utc>) {
        self.finalize(
            record,
            RequestStatus::Expired,
            AuditAction::Expired,
            "timeout-sweeper",
            AuditActorType::System,
            None,
            now,
        );
    }

    pub(crate) fn overall_timeout_elapsed(&self, record: &RequestRecord, now: DateTime<Utc>) -> bool {
        record
            .flow
            .auto_reject_after_hours
            .is_some_and(|hours| (now - record.request.requested_at).num_hours() >= hours)
    }

    /// Resolve the current approvers for a step: the base set (or its
    /// escalation reassignment), standing delegations, then per-request
    /// hand-offs.
    pub(crate) fn resolve_step(
        &self,
        record: &RequestRecord,
        step: &ApprovalStep,
        at: DateTime<Utc>,
    ) -> ResolvedApprovers {
        let delegations = self.read_delegations().clone();
        let resolver = ApproverResolver::new(self.directory.as_ref(), self.delegation_resolver);
        let reassigned = record.reassignments.get(&step.id.0).map(Vec::as_slice);
        let mut resolved = resolver.resolve(
            step,
            &record.request.entity_type,
            &record.request.context_snapshot,
            &delegations,
            reassigned,
            at,
        );
        if let Some(grants) = record.adhoc_delegates.get(&step.id.0) {
            for grant in grants {
                for principal in &grant.principal_ids {
                    resolved.add_delegate(grant.delegate_id.clone(), principal.clone());
                }
            }
        }
        resolved
    }

    pub(crate) fn append_audit(
        &self,
        request_id: &RequestId,
        action: AuditAction,
        actor_id: &str,
        actor_type: AuditActorType,
        details: &[(&str, String)],
        at: DateTime<Utc>,
    ) {
        let details: BTreeMap<String, String> =
            details.iter().map(|(key, value)| (key.to_string(), value.clone())).collect();
        self.audit.append(request_id, action, actor_id, actor_type, details, at);
    }

    pub(crate) fn send_notification(
        &self,
        kind: NotificationKind,
        request_id: &RequestId,
        recipients: Vec<String>,
        message: String,
    ) {
        self.notifications.notify(Notification {
            kind,
            request_id: request_id.0.clone(),
            recipients,
            message,
        });
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn all_records(&self) -> Vec<Arc<Mutex<RequestRecord>>> {
        self.read_requests().values().cloned().collect()
    }

    fn record_arc(&self, request_id: &RequestId) -> Result<Arc<Mutex<RequestRecord>>, EngineError> {
        self.read_requests()
            .get(&request_id.0)
            .cloned()
            .ok_or(EngineError::UnknownRequest { request_id: request_id.0.clone() })
    }

    pub(crate) fn lock_record(arc: &Arc<Mutex<RequestRecord>>) -> MutexGuard<'_, RequestRecord> {
        match arc.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read_flows(&self) -> RwLockReadGuard<'_, HashMap<String, ApprovalFlow>> {
        match self.flows.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_flows(&self) -> RwLockWriteGuard<'_, HashMap<String, ApprovalFlow>> {
        match self.flows.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read_delegations(&self) -> RwLockReadGuard<'_, Vec<ApprovalDelegation>> {
        match self.delegations.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_delegations(&self) -> RwLockWriteGuard<'_, Vec<ApprovalDelegation>> {
        match self.delegations.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read_requests(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Mutex<RequestRecord>>>> {
        match self.requests.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_requests(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Mutex<RequestRecord>>>> {
        match self.requests.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
