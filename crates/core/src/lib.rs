pub mod approvers;
pub mod audit;
pub mod clock;
pub mod conditions;
pub mod config;
pub mod delegation;
pub mod directory;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod queue;
pub mod selector;
pub mod sweeper;

pub use approvers::{ApproverResolver, ResolvedApprovers, DEPARTMENT_CONTEXT_KEY};
pub use audit::{AuditAction, AuditActorType, AuditEntry, AuditRecorder, ChainVerification};
pub use clock::{Clock, ManualClock, SystemClock};
pub use conditions::{Condition, ContextMap, ContextValue};
pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
pub use delegation::{
    DelegationResolution, DelegationResolver, DelegationScope, DEFAULT_MAX_DELEGATION_DEPTH,
};
pub use directory::{
    DirectoryService, InMemoryDirectory, InMemoryNotificationSink, Notification, NotificationKind,
    NotificationSink, NullNotificationSink,
};
pub use domain::decision::{ApprovalDecision, DecisionId, DecisionKind};
pub use domain::delegation::{ApprovalDelegation, DelegationId};
pub use domain::flow::{
    ApprovalFlow, ApprovalStep, ApproverSpec, EscalationTarget, FlowId, FlowSnapshot, StepId,
};
pub use domain::request::{ApprovalRequest, RequestId, RequestPriority, RequestStatus};
pub use engine::{ApprovalEngine, AuditFilter, DecideInput, RequestDetail, SubmitRequest};
pub use errors::{EngineError, TransitionBlock};
pub use queue::QueueItem;
pub use selector::{auto_approves, flow_matches, select_flow};
pub use sweeper::SweepReport;
