use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::step::WorkflowStep;

/// Failures reported by the backend collaborator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("order {0} not found")]
    NotFound(Uuid),

    #[error("rejected by backend: {0}")]
    Rejected(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("malformed backend payload: {0}")]
    Decode(String),
}

/// Operator-facing failures of a requested transition.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransitionError {
    #[error("cannot move from {from} to {to}")]
    InvalidTransition { from: WorkflowStep, to: WorkflowStep },

    #[error("another transition is still in flight")]
    TransitionInProgress,

    #[error("backend refused the command: {0}")]
    CommandRejected(String),

    #[error("no active order")]
    NoActiveOrder,

    #[error("proof of delivery must be attached first")]
    ProofRequired,
}

impl From<BackendError> for TransitionError {
    fn from(err: BackendError) -> Self {
        TransitionError::CommandRejected(err.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BindError {
    #[error("order {order_id} is not assigned to this courier")]
    NotAssigned { order_id: Uuid },

    #[error("order {order_id} is already {step}")]
    AlreadyTerminal { order_id: Uuid, step: WorkflowStep },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Transition(err) => match err {
                TransitionError::InvalidTransition { .. }
                | TransitionError::TransitionInProgress
                | TransitionError::ProofRequired => StatusCode::CONFLICT,
                TransitionError::CommandRejected(_) => StatusCode::BAD_GATEWAY,
                TransitionError::NoActiveOrder => StatusCode::NOT_FOUND,
            },
            AppError::Bind(err) => match err {
                BindError::NotAssigned { .. } | BindError::AlreadyTerminal { .. } => {
                    StatusCode::CONFLICT
                }
                BindError::Backend(BackendError::NotFound(_)) => StatusCode::NOT_FOUND,
                BindError::Backend(_) => StatusCode::BAD_GATEWAY,
            },
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = match &self {
            AppError::NotFound(msg)
            | AppError::BadRequest(msg)
            | AppError::Internal(msg) => msg.clone(),
            AppError::Transition(err) => err.to_string(),
            AppError::Bind(err) => err.to_string(),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
