use std::time::Duration;

use shared::{
    domain::{InterestRequestId, InterestStatus, UserId},
    error::{ApiError, FrameError},
};
use thiserror::Error;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("hub session is not running")]
    NotConnected,
    #[error("hub connect to {url} timed out after {timeout:?}")]
    ConnectTimeout { url: String, timeout: Duration },
    #[error("hub invocation `{target}` failed: {message}")]
    Invocation { target: String, message: String },
    #[error("hub invocation `{target}` got no completion within {timeout:?}")]
    InvocationTimeout { target: String, timeout: Duration },
    #[error("hub connection lost before `{target}` completed")]
    ConnectionLost { target: String },
    #[error("no conversation is open")]
    NoOpenConversation,
    #[error("conversation with {0} is blocked")]
    ConversationBlocked(UserId),
    #[error("message body is empty")]
    EmptyMessage,
    #[error("interest request {id} is already {status:?}")]
    AlreadyTerminal {
        id: InterestRequestId,
        status: InterestStatus,
    },
    #[error("interest request {0} is not in the current list")]
    UnknownRequest(InterestRequestId),
    #[error("interest request {0} already has an action in flight")]
    ActionInFlight(InterestRequestId),
    #[error(
        "{method} {path} failed with status {status}: {}",
        .body.as_ref().map(|b| b.message.as_str()).unwrap_or("no error body")
    )]
    Api {
        method: &'static str,
        path: String,
        status: u16,
        body: Option<ApiError>,
    },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    /// Whether the server refused a mutation because the target is already
    /// in a final state.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::AlreadyTerminal { .. } => true,
            Self::Api { status, body, .. } => {
                *status == 409
                    || body
                        .as_ref()
                        .is_some_and(|b| b.code == shared::error::ErrorCode::Conflict)
            }
            _ => false,
        }
    }

    /// Short text suitable for a dismissible alert.
    pub fn alert_text(&self) -> String {
        match self {
            Self::AlreadyTerminal { status, .. } => {
                let status = format!("{status:?}").to_lowercase();
                format!("This request was already {status}.")
            }
            Self::ActionInFlight(_) => "This request is still being processed.".to_string(),
            Self::Api {
                body: Some(body), ..
            } => body.message.clone(),
            Self::Http(_) | Self::WebSocket(_) | Self::ConnectTimeout { .. } => {
                "Server unreachable; check your connection and retry.".to_string()
            }
            other => other.to_string(),
        }
    }
}
