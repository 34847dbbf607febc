use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conditions::ContextMap;
use crate::domain::flow::{FlowId, StepId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Returned,
    Cancelled,
    Expired,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: RequestId,
    pub entity_type: String,
    pub entity_id: String,
    pub flow_id: FlowId,
    /// None once the request is terminal.
    pub current_step_id: Option<StepId>,
    pub status: RequestStatus,
    pub context_snapshot: ContextMap,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
    pub priority: RequestPriority,
    pub due_by: Option<DateTime<Utc>>,
    /// Prior request in the resubmission chain, if any.
    pub resubmitted_from: Option<RequestId>,
    /// When the current step was entered; feeds reminders, timeouts and
    /// queue waiting time.
    pub step_entered_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency token, bumped on every applied transition.
    pub version: u32,
}

impl ApprovalRequest {
    pub fn is_open(&self) -> bool {
        self.status == RequestStatus::Pending
    }
}
