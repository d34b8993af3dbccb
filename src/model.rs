//! Core data types shared by the transport, routing engine and scheduler.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// A configured mailbox the dispatcher polls.
///
/// Owned by the directory; the core only reads it.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    /// Mailbox address, used for logging.
    pub address: String,
    /// Login username for both retrieval and submission.
    pub username: String,
    pub password: SecretString,
    /// Retrieval endpoint, `host` or `host:port`.
    pub server: String,
    pub is_active: bool,
    /// Opaque per-account settings blob.
    pub settings: Option<String>,
    /// Last-seen UID cursor. Read but never advanced by the core.
    pub last_uid: u32,
}

/// A named forwarding destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardTarget {
    pub id: i64,
    /// Unique, case-sensitive routing key.
    pub name: String,
    pub email: String,
    pub description: Option<String>,
}

/// A fetched message, normalized for routing. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedMessage {
    /// `{account_id}-{uid}`. Not stable if the server reassigns UIDs.
    pub message_id: String,
    pub subject: String,
    pub from: String,
    pub to: String,
    pub received_at: DateTime<Utc>,
    /// Untouched RFC 5322 payload, when the server returned one.
    pub raw: Option<Vec<u8>>,
    /// Decoded text body, when one could be extracted.
    pub body: Option<String>,
}

/// Final status of a dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Forwarded,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forwarded => "forwarded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "forwarded" => Some(Self::Forwarded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// The durable record of what happened to one fetched message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub account_id: i64,
    pub message_id: String,
    pub subject: String,
    pub from: String,
    pub to: String,
    pub received_at: DateTime<Utc>,
    pub forward_to: Option<String>,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_at: Option<DateTime<Utc>>,
}

impl DispatchOutcome {
    /// A successful forward to `forward_to`, stamped with the current time.
    pub fn forwarded(account_id: i64, message: &NormalizedMessage, forward_to: &str) -> Self {
        Self {
            forward_to: Some(forward_to.to_string()),
            status: OutcomeStatus::Forwarded,
            forwarded_at: Some(Utc::now()),
            ..Self::base(account_id, message)
        }
    }

    /// A failed dispatch. `forward_to` is set when the target had been resolved.
    pub fn failed(
        account_id: i64,
        message: &NormalizedMessage,
        forward_to: Option<&str>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            forward_to: forward_to.map(str::to_string),
            status: OutcomeStatus::Failed,
            error: Some(error.into()),
            ..Self::base(account_id, message)
        }
    }

    fn base(account_id: i64, message: &NormalizedMessage) -> Self {
        Self {
            account_id,
            message_id: message.message_id.clone(),
            subject: message.subject.clone(),
            from: message.from.clone(),
            to: message.to.clone(),
            received_at: message.received_at,
            forward_to: None,
            status: OutcomeStatus::Failed,
            error: None,
            forwarded_at: None,
        }
    }
}
