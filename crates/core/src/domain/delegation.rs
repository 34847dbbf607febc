use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::flow::FlowId;
use crate::errors::EngineError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DelegationId(pub String);

/// A standing, time-bounded grant of decision authority over the half-open
/// window `[starts_at, ends_at)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDelegation {
    pub id: DelegationId,
    pub delegator_id: String,
    pub delegate_id: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub reason: Option<String>,
    /// None applies to every entity type.
    pub entity_type: Option<String>,
    /// None applies to every flow.
    pub flow_id: Option<FlowId>,
    pub is_active: bool,
}

impl ApprovalDelegation {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.starts_at >= self.ends_at {
            return Err(EngineError::InvalidConfiguration(format!(
                "delegation `{}` window is empty or inverted",
                self.id.0
            )));
        }
        if self.delegator_id == self.delegate_id {
            return Err(EngineError::InvalidConfiguration(format!(
                "delegation `{}` delegates to its own delegator",
                self.id.0
            )));
        }
        Ok(())
    }

    pub fn active_at(&self, at: DateTime<Utc>) -> bool {
        self.is_active && self.starts_at <= at && at < self.ends_at
    }

    pub fn in_scope(&self, entity_type: &str, flow_id: &FlowId) -> bool {
        let entity_matches =
            self.entity_type.as_deref().map_or(true, |scoped| scoped == entity_type);
        let flow_matches = self.flow_id.as_ref().map_or(true, |scoped| scoped == flow_id);
        entity_matches && flow_matches
    }
}
