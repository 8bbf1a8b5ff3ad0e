use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransitionError;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);
id_newtype!(ConversationId);
id_newtype!(InterestRequestId);
id_newtype!(JobPostId);

/// Identity of the signed-in user, handed to every component explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub user_id: UserId,
    pub display_name: String,
    pub image_url: Option<String>,
}

impl LocalIdentity {
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            image_url: None,
        }
    }

    pub fn with_image_url(mut self, image_url: impl Into<String>) -> Self {
        self.image_url = Some(image_url.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    #[default]
    Delivered,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub is_local_sender: bool,
    #[serde(default)]
    pub delivery: DeliveryStatus,
}

impl Message {
    /// A message authored on this client and not yet acknowledged by the hub.
    pub fn local(
        sender_id: UserId,
        receiver_id: UserId,
        body: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: None,
            correlation_id: Some(Uuid::new_v4()),
            sender_id,
            receiver_id,
            body: body.into(),
            sent_at,
            is_local_sender: true,
            delivery: DeliveryStatus::Pending,
        }
    }

    /// A message pushed by the hub. The push carries no timestamp, so the
    /// receipt time stands in for `sent_at`.
    pub fn received(
        sender_id: UserId,
        local_user: UserId,
        body: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: None,
            correlation_id: None,
            sender_id,
            receiver_id: local_user,
            body: body.into(),
            sent_at: received_at,
            is_local_sender: false,
            delivery: DeliveryStatus::Delivered,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.message_id.is_some()
    }

    /// The other participant from the local user's point of view.
    pub fn counterpart(&self) -> &UserId {
        if self.is_local_sender {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub counterpart_user_id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub last_message: String,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterestStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterestDecision {
    Accept,
    Reject,
}

impl InterestDecision {
    pub fn as_path_segment(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
        }
    }
}

impl InterestStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Pending moves to Accepted or Rejected exactly once; terminal states
    /// reject every further decision.
    pub fn apply(self, decision: InterestDecision) -> Result<Self, TransitionError> {
        match (self, decision) {
            (Self::Pending, InterestDecision::Accept) => Ok(Self::Accepted),
            (Self::Pending, InterestDecision::Reject) => Ok(Self::Rejected),
            (current, decision) => Err(TransitionError { current, decision }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterestRequest {
    pub id: InterestRequestId,
    pub job_post_id: JobPostId,
    pub requester_id: UserId,
    pub requester_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_image_url: Option<String>,
    pub target_id: UserId,
    pub target_name: String,
    pub status: InterestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    InterestReceived,
    InterestAccepted,
    InterestRejected,
    NewMessage,
    Other(String),
}

impl NotificationKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "interestreceived" | "interest" | "interestrequest" => Self::InterestReceived,
            "interestaccepted" | "accepted" => Self::InterestAccepted,
            "interestrejected" | "rejected" => Self::InterestRejected,
            "newmessage" | "message" => Self::NewMessage,
            _ => Self::Other(raw.to_string()),
        }
    }

    pub fn concerns_interest_requests(&self) -> bool {
        matches!(
            self,
            Self::InterestReceived | Self::InterestAccepted | Self::InterestRejected
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub sender_id: UserId,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_post_id: Option<JobPostId>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub notification_type: String,
    #[serde(default)]
    pub is_read: bool,
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        NotificationKind::parse(&self.notification_type)
    }
}
