use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{InterestDecision, InterestStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    Conflict,
    RateLimited,
    Internal,
}

/// Error body returned by the REST backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {decision:?} an interest request that is already {current:?}")]
pub struct TransitionError {
    pub current: InterestStatus,
    pub decision: InterestDecision,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("hub record is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("hub record is missing field `{0}`")]
    MissingField(&'static str),
    #[error("handshake rejected by hub: {0}")]
    HandshakeRejected(String),
    #[error("argument {index} of `{target}` has unexpected shape")]
    BadArgument { target: String, index: usize },
}
