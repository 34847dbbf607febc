use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::flow::StepId;
use crate::domain::request::RequestId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecisionId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Approved,
    Rejected,
    Returned,
    Delegated,
    Abstained,
}

impl DecisionKind {
    pub fn as_key(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Returned => "returned",
            Self::Delegated => "delegated",
            Self::Abstained => "abstained",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub id: DecisionId,
    pub request_id: RequestId,
    pub step_id: StepId,
    pub decided_by: String,
    pub decision: DecisionKind,
    pub comment: Option<String>,
    /// Structured extra data attached by the approver (for example a note
    /// that the decision was made under a delegation).
    pub conditions: Option<serde_json::Value>,
    pub delegated_to: Option<String>,
    pub decided_at: DateTime<Utc>,
    /// A superseded decision no longer counts for eligibility or completion;
    /// rows are never deleted.
    pub superseded: bool,
}

impl ApprovalDecision {
    pub fn counts_toward_completion(&self) -> bool {
        !self.superseded && self.decision == DecisionKind::Approved
    }
}
