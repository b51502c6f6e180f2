//! Actions: the transaction-correlated messages sagas exchange over the broker.
//!
//! An [`Action`] is immutable once constructed. On the wire it travels as a JSON
//! envelope `{"transaction_id": ..., "payload": ...}` keyed by its transaction id,
//! so every record of one saga lands on the same partition.
//!
//! Two well-known headers carry caller identity: `user_id` and `roles`
//! (comma-separated). [`Identity::from_headers`] extracts them.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::broker::{InboundRecord, OutboundMessage};
use crate::error::SagaError;

/// String-keyed, byte-valued header map.
pub type Headers = BTreeMap<String, Bytes>;

/// Header carrying the authenticated user id.
pub const USER_ID_HEADER: &str = "user_id";

/// Header carrying the authenticated user's roles, comma-separated.
pub const ROLES_HEADER: &str = "roles";

// =============================================================================
// Transaction Id
// =============================================================================

/// Correlation id grouping every action of one saga execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// Create a transaction id from any string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random transaction id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for TransactionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TransactionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TransactionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// =============================================================================
// Identity
// =============================================================================

/// Authenticated caller identity carried in message headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub roles: Vec<String>,
}

impl Identity {
    /// Extract the identity pair from headers.
    ///
    /// Returns `None` unless both `user_id` and `roles` are present and UTF-8.
    pub fn from_headers(headers: &Headers) -> Option<Self> {
        let user_id = std::str::from_utf8(headers.get(USER_ID_HEADER)?).ok()?;
        let roles = std::str::from_utf8(headers.get(ROLES_HEADER)?).ok()?;

        Some(Self {
            user_id: user_id.to_string(),
            roles: split_roles(roles),
        })
    }

    /// Write the identity pair into a header map.
    pub fn write_headers(&self, headers: &mut Headers) {
        headers.insert(
            USER_ID_HEADER.to_string(),
            Bytes::from(self.user_id.clone()),
        );
        headers.insert(ROLES_HEADER.to_string(), Bytes::from(self.roles.join(",")));
    }
}

fn split_roles(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|role| !role.is_empty())
        .map(str::to_string)
        .collect()
}

// =============================================================================
// Action
// =============================================================================

/// A message envelope correlated to a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    topic: String,
    transaction_id: TransactionId,
    payload: Value,
    headers: Option<Headers>,
    user_id: Option<String>,
    user_roles: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct WireEnvelope {
    transaction_id: TransactionId,
    payload: Value,
}

impl Action {
    pub fn new(topic: impl Into<String>, transaction_id: TransactionId, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            transaction_id,
            payload,
            headers: None,
            user_id: None,
            user_roles: None,
        }
    }

    /// Attach headers, consuming the action.
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Attach a caller identity, consuming the action.
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.user_id = Some(identity.user_id);
        self.user_roles = Some(identity.roles);
        self
    }

    /// Parse an inbound broker record.
    ///
    /// The record value must be a JSON `{transaction_id, payload}` envelope;
    /// anything else is a [`SagaError::MalformedMessage`].
    pub fn from_record(record: &InboundRecord) -> Result<Self, SagaError> {
        let envelope: WireEnvelope =
            serde_json::from_slice(&record.value).map_err(|source| {
                SagaError::MalformedMessage {
                    topic: record.topic.clone(),
                    source,
                }
            })?;

        let mut action = Action::new(
            record.topic.clone(),
            envelope.transaction_id,
            envelope.payload,
        );
        if let Some(identity) = Identity::from_headers(&record.headers) {
            action = action.with_identity(identity);
        }
        if !record.headers.is_empty() {
            action = action.with_headers(record.headers.clone());
        }
        Ok(action)
    }

    /// Encode the action as an outbound broker message.
    ///
    /// The key is the transaction id. Identity fields are written back into
    /// the `user_id`/`roles` headers when both are set.
    pub fn to_outbound(&self) -> OutboundMessage {
        let envelope = json!({
            "transaction_id": self.transaction_id,
            "payload": self.payload,
        });

        let mut headers = self.headers.clone().unwrap_or_default();
        if let Some(identity) = self.identity() {
            identity.write_headers(&mut headers);
        }

        OutboundMessage {
            key: Some(Bytes::from(self.transaction_id.as_str().to_string())),
            value: Bytes::from(envelope.to_string()),
            headers,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn into_payload(self) -> Value {
        self.payload
    }

    pub fn headers(&self) -> Option<&Headers> {
        self.headers.as_ref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn user_roles(&self) -> Option<&[String]> {
        self.user_roles.as_deref()
    }

    /// The caller identity, if both halves are present.
    pub fn identity(&self) -> Option<Identity> {
        match (&self.user_id, &self.user_roles) {
            (Some(user_id), Some(roles)) => Some(Identity {
                user_id: user_id.clone(),
                roles: roles.clone(),
            }),
            _ => None,
        }
    }
}
