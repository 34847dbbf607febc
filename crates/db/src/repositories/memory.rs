use std::collections::HashMap;

use tokio::sync::RwLock;

use signoff_core::audit::AuditEntry;
use signoff_core::domain::decision::{ApprovalDecision, DecisionId};
use signoff_core::domain::delegation::{ApprovalDelegation, DelegationId};
use signoff_core::domain::flow::{ApprovalFlow, FlowId};
use signoff_core::domain::request::{ApprovalRequest, RequestId};

use super::{
    AuditRepository, DelegationRepository, FlowRepository, RepositoryError, RequestRepository,
};

#[derive(Default)]
pub struct InMemoryFlowRepository {
    flows: RwLock<HashMap<String, ApprovalFlow>>,
}

#[async_trait::async_trait]
impl FlowRepository for InMemoryFlowRepository {
    async fn find_by_id(&self, id: &FlowId) -> Result<Option<ApprovalFlow>, RepositoryError> {
        let flows = self.flows.read().await;
        Ok(flows.get(&id.0).cloned())
    }

    async fn find_by_slug(&self, slug: &str) -> Result<Option<ApprovalFlow>, RepositoryError> {
        let flows = self.flows.read().await;
        Ok(flows.values().find(|flow| flow.slug == slug).cloned())
    }

    async fn list_active_for_entity_type(
        &self,
        entity_type: &str,
    ) -> Result<Vec<ApprovalFlow>, RepositoryError> {
        let flows = self.flows.read().await;
        let mut matching: Vec<ApprovalFlow> = flows
            .values()
            .filter(|flow| flow.is_active && flow.entity_type == entity_type)
            .cloned()
            .collect();
        matching.sort_by(|left, right| {
            right
                .priority
                .cmp(&left.priority)
                .then_with(|| left.created_at.cmp(&right.created_at))
                .then_with(|| left.id.0.cmp(&right.id.0))
        });
        Ok(matching)
    }

    async fn save(&self, flow: ApprovalFlow) -> Result<(), RepositoryError> {
        let mut flows = self.flows.write().await;
        flows.insert(flow.id.0.clone(), flow);
        Ok(())
    }

    async fn set_active(&self, id: &FlowId, is_active: bool) -> Result<(), RepositoryError> {
        let mut flows = self.flows.write().await;
        if let Some(flow) = flows.get_mut(&id.0) {
            flow.is_active = is_active;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryRequestRepository {
    requests: RwLock<HashMap<String, ApprovalRequest>>,
    decisions: RwLock<Vec<ApprovalDecision>>,
}

#[async_trait::async_trait]
impl RequestRepository for InMemoryRequestRepository {
    async fn find_by_id(
        &self,
        id: &RequestId,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let requests = self.requests.read().await;
        Ok(requests.get(&id.0).cloned())
    }

    async fn find_open_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let requests = self.requests.read().await;
        Ok(requests
            .values()
            .find(|request| {
                request.is_open()
                    && request.entity_type == entity_type
                    && request.entity_id == entity_id
            })
            .cloned())
    }

    async fn list_pending(&self) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let requests = self.requests.read().await;
        let mut pending: Vec<ApprovalRequest> =
            requests.values().filter(|request| request.is_open()).cloned().collect();
        pending.sort_by(|left, right| {
            left.requested_at.cmp(&right.requested_at).then_with(|| left.id.0.cmp(&right.id.0))
        });
        Ok(pending)
    }

    async fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let requests = self.requests.read().await;
        let mut history: Vec<ApprovalRequest> = requests
            .values()
            .filter(|request| {
                request.entity_type == entity_type && request.entity_id == entity_id
            })
            .cloned()
            .collect();
        history.sort_by(|left, right| {
            left.requested_at.cmp(&right.requested_at).then_with(|| left.id.0.cmp(&right.id.0))
        });
        Ok(history)
    }

    async fn insert(&self, request: ApprovalRequest) -> Result<(), RepositoryError> {
        let mut requests = self.requests.write().await;
        requests.insert(request.id.0.clone(), request);
        Ok(())
    }

    async fn update(
        &self,
        request: ApprovalRequest,
        expected_version: u32,
    ) -> Result<(), RepositoryError> {
        let mut requests = self.requests.write().await;
        match requests.get(&request.id.0) {
            Some(stored) if stored.version == expected_version => {
                requests.insert(request.id.0.clone(), request);
                Ok(())
            }
            _ => Err(RepositoryError::Conflict { id: request.id.0, expected_version }),
        }
    }

    async fn append_decision(&self, decision: ApprovalDecision) -> Result<(), RepositoryError> {
        let mut decisions = self.decisions.write().await;
        decisions.push(decision);
        Ok(())
    }

    async fn supersede_decision(&self, id: &DecisionId) -> Result<(), RepositoryError> {
        let mut decisions = self.decisions.write().await;
        if let Some(decision) = decisions.iter_mut().find(|decision| &decision.id == id) {
            decision.superseded = true;
        }
        Ok(())
    }

    async fn decisions_for_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<ApprovalDecision>, RepositoryError> {
        let decisions = self.decisions.read().await;
        let mut matching: Vec<ApprovalDecision> = decisions
            .iter()
            .filter(|decision| &decision.request_id == request_id)
            .cloned()
            .collect();
        matching.sort_by(|left, right| {
            left.decided_at.cmp(&right.decided_at).then_with(|| left.id.0.cmp(&right.id.0))
        });
        Ok(matching)
    }
}

#[derive(Default)]
pub struct InMemoryDelegationRepository {
    delegations: RwLock<HashMap<String, ApprovalDelegation>>,
}

#[async_trait::async_trait]
impl DelegationRepository for InMemoryDelegationRepository {
    async fn find_by_id(
        &self,
        id: &DelegationId,
    ) -> Result<Option<ApprovalDelegation>, RepositoryError> {
        let delegations = self.delegations.read().await;
        Ok(delegations.get(&id.0).cloned())
    }

    async fn list_all(&self) -> Result<Vec<ApprovalDelegation>, RepositoryError> {
        let delegations = self.delegations.read().await;
        let mut all: Vec<ApprovalDelegation> = delegations.values().cloned().collect();
        all.sort_by(|left, right| {
            left.starts_at.cmp(&right.starts_at).then_with(|| left.id.0.cmp(&right.id.0))
        });
        Ok(all)
    }

    async fn list_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<ApprovalDelegation>, RepositoryError> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|delegation| {
                delegation.delegator_id == user_id || delegation.delegate_id == user_id
            })
            .collect())
    }

    async fn save(&self, delegation: ApprovalDelegation) -> Result<(), RepositoryError> {
        let mut delegations = self.delegations.write().await;
        delegations.insert(delegation.id.0.clone(), delegation);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryAuditRepository {
    entries: RwLock<Vec<AuditEntry>>,
}

#[async_trait::async_trait]
impl AuditRepository for InMemoryAuditRepository {
    async fn append(&self, entry: AuditEntry) -> Result<(), RepositoryError> {
        let mut entries = self.entries.write().await;
        entries.push(entry);
        Ok(())
    }

    async fn list_for_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<AuditEntry>, RepositoryError> {
        let entries = self.entries.read().await;
        let mut chain: Vec<AuditEntry> = entries
            .iter()
            .filter(|entry| &entry.request_id == request_id)
            .cloned()
            .collect();
        chain.sort_by_key(|entry| entry.sequence);
        Ok(chain)
    }

    async fn list_all(
        &self,
        action: Option<&str>,
        actor_id: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<AuditEntry>, RepositoryError> {
        let entries = self.entries.read().await;
        let mut matching: Vec<AuditEntry> = entries
            .iter()
            .filter(|entry| action.map_or(true, |action| entry.action.as_key() == action))
            .filter(|entry| actor_id.map_or(true, |actor| entry.actor_id == actor))
            .cloned()
            .collect();
        matching.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.request_id.0.cmp(&right.request_id.0))
                .then_with(|| left.sequence.cmp(&right.sequence))
        });
        Ok(matching.into_iter().skip(offset as usize).take(limit as usize).collect())
    }
}
