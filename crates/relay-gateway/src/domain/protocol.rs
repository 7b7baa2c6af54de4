//! Subscription wire protocol.
//!
//! ```text
//! Client -> Server:
//!   {"type":"subscribe","id":"a","path":"/comment/watchPostComments","input":{"postID":123}}
//!   {"type":"unsubscribe","id":"a"}
//!
//! Server -> Client:
//!   {"type":"subscribed","id":"a"}
//!   {"type":"message","id":"a","message":{...}}
//!   {"type":"error","error":{"code":"NOT_FOUND","serverStack":"..."}}
//! ```

use crate::domain::error::{ApiError, ApiErrorCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Client-chosen subscription id, unique within one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriptionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Frames accepted from the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe {
        id: SubscriptionId,
        path: String,
        #[serde(default)]
        input: Value,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
}

/// Frames sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// The handler for `id` finished registering.
    Subscribed { id: SubscriptionId },
    Message {
        id: SubscriptionId,
        message: Value,
    },
    Error { error: ErrorBody },
}

impl ServerMessage {
    /// Error frame for `err`, with the detail attached only when `expose` is set.
    pub fn error(err: &ApiError, expose: bool) -> Self {
        Self::Error {
            error: ErrorBody {
                code: err.code(),
                server_stack: expose.then(|| err.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: ApiErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_stack: Option<String>,
}
