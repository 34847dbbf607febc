use async_trait::async_trait;
use thiserror::Error;

use signoff_core::audit::AuditEntry;
use signoff_core::domain::decision::{ApprovalDecision, DecisionId};
use signoff_core::domain::delegation::{ApprovalDelegation, DelegationId};
use signoff_core::domain::flow::{ApprovalFlow, FlowId};
use signoff_core::domain::request::{ApprovalRequest, RequestId};

pub mod audit;
pub mod delegation;
pub mod flow;
pub mod memory;
pub mod request;

pub use audit::SqlAuditRepository;
pub use delegation::SqlDelegationRepository;
pub use flow::SqlFlowRepository;
pub use memory::{
    InMemoryAuditRepository, InMemoryDelegationRepository, InMemoryFlowRepository,
    InMemoryRequestRepository,
};
pub use request::SqlRequestRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("concurrent modification of `{id}`: expected version {expected_version}")]
    Conflict { id: String, expected_version: u32 },
}

#[async_trait]
pub trait FlowRepository: Send + Sync {
    async fn find_by_id(&self, id: &FlowId) -> Result<Option<ApprovalFlow>, RepositoryError>;
    async fn find_by_slug(&self, slug: &str) -> Result<Option<ApprovalFlow>, RepositoryError>;
    async fn list_active_for_entity_type(
        &self,
        entity_type: &str,
    ) -> Result<Vec<ApprovalFlow>, RepositoryError>;
    /// Upsert the flow and replace its step definitions.
    async fn save(&self, flow: ApprovalFlow) -> Result<(), RepositoryError>;
    async fn set_active(&self, id: &FlowId, is_active: bool) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait RequestRepository: Send + Sync {
    async fn find_by_id(&self, id: &RequestId)
        -> Result<Option<ApprovalRequest>, RepositoryError>;
    async fn find_open_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<ApprovalRequest>, RepositoryError>;
    async fn list_pending(&self) -> Result<Vec<ApprovalRequest>, RepositoryError>;
    /// Every request ever opened for the entity, oldest first.
    async fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError>;
    async fn insert(&self, request: ApprovalRequest) -> Result<(), RepositoryError>;
    /// Version-guarded write: fails with `Conflict` unless the stored row
    /// still carries `expected_version`, so a losing concurrent writer must
    /// re-read and retry.
    async fn update(
        &self,
        request: ApprovalRequest,
        expected_version: u32,
    ) -> Result<(), RepositoryError>;
    async fn append_decision(&self, decision: ApprovalDecision) -> Result<(), RepositoryError>;
    async fn supersede_decision(&self, id: &DecisionId) -> Result<(), RepositoryError>;
    async fn decisions_for_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<ApprovalDecision>, RepositoryError>;
}

#[async_trait]
pub trait DelegationRepository: Send + Sync {
    async fn find_by_id(
        &self,
        id: &DelegationId,
    ) -> Result<Option<ApprovalDelegation>, RepositoryError>;
    async fn list_all(&self) -> Result<Vec<ApprovalDelegation>, RepositoryError>;
    /// Delegations naming the user as delegator or delegate.
    async fn list_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<ApprovalDelegation>, RepositoryError>;
    async fn save(&self, delegation: ApprovalDelegation) -> Result<(), RepositoryError>;
}

/// Append-only store for the audit chain; there is deliberately no update or
/// delete operation.
#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<(), RepositoryError>;
    async fn list_for_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<AuditEntry>, RepositoryError>;
    async fn list_all(
        &self,
        action: Option<&str>,
        actor_id: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<AuditEntry>, RepositoryError>;
}
