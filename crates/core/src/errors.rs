use thiserror::Error;

use crate::domain::request::RequestStatus;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("no active flow matches entity type `{entity_type}`")]
    NoApplicableFlow { entity_type: String },
    #[error(
        "an open approval request `{request_id}` already exists for `{entity_type}/{entity_id}`"
    )]
    OpenRequestExists { entity_type: String, entity_id: String, request_id: String },
    #[error("unknown approval request `{request_id}`")]
    UnknownRequest { request_id: String },
    #[error("illegal transition on request `{request_id}`: {block}")]
    IllegalTransition { request_id: String, block: TransitionBlock },
    #[error("step `{step_id}` of request `{request_id}` resolves to no approvers")]
    StepUnresolvable { request_id: String, step_id: String },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// The exact rule that blocked a transition, surfaced so callers can act on
/// the failure without guessing.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransitionBlock {
    #[error("request is already {status:?}")]
    Terminal { status: RequestStatus },
    #[error("actor `{actor}` is not an eligible approver for the current step")]
    NotEligible { actor: String },
    #[error("actor `{actor}` already decided on this step")]
    AlreadyDecided { actor: String },
    #[error("only the original requester may perform this action")]
    NotRequester,
    #[error("resubmission is only legal from a returned or rejected request")]
    NotResubmittable,
    #[error("a delegated decision requires a delegate_to user")]
    MissingDelegate,
    #[error("request has no current step")]
    NoCurrentStep,
}

impl EngineError {
    pub fn illegal(request_id: impl Into<String>, block: TransitionBlock) -> Self {
        Self::IllegalTransition { request_id: request_id.into(), block }
    }
}
