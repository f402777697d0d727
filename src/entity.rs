use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unit of the broadcast channel: `{"type": "...", "payload": "..."}`.
///
/// `kind` is an open set ("chat", "status", "offer", ...) and `payload` is
/// passed through untouched. Fields are private so a message cannot change
/// while it is being fanned out.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Message {
    #[serde(rename = "type")]
    kind: String,
    payload: String,
}

impl Message {
    pub fn new(kind: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}

/// Side of a negotiation.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn opposite(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }

    /// Slot of this role in per-role arrays.
    pub(crate) fn index(self) -> usize {
        match self {
            Role::Initiator => 0,
            Role::Responder => 1,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy, Hash)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of one endpoint connection registered with the hub.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Offer or answer. `body` is opaque to the relay.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct SessionDescription {
    pub role: Role,
    pub body: String,
}

impl SessionDescription {
    pub fn offer(body: impl Into<String>) -> Self {
        Self {
            role: Role::Initiator,
            body: body.into(),
        }
    }

    pub fn answer(body: impl Into<String>) -> Self {
        Self {
            role: Role::Responder,
            body: body.into(),
        }
    }
}

/// Connectivity candidate submitted by `role` for the session `session_id`.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Candidate {
    pub session_id: SessionId,
    pub role: Role,
    pub body: String,
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct SessionCreated {
    pub session_id: SessionId,
}
