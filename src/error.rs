use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;
use tokio_tungstenite::tungstenite;

use crate::{
    entity::{Role, SessionId},
    session::SessionState,
};

#[derive(Error, Debug)]
pub enum RelayError {
    /// Transport failures. Handled by dropping the offending connection.
    #[error("Websocket error: {0}")]
    WsError(#[from] tungstenite::error::Error),
    #[error("Send deadline of {0:?} exceeded")]
    SendTimeout(Duration),
    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Negotiation
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("Session already closed: {0}")]
    SessionClosed(SessionId),
    #[error("Invalid transition in state {state}: {reason}")]
    InvalidTransition {
        state: SessionState,
        reason: TransitionError,
    },
    #[error("Candidate queue of the {0} is full")]
    QueueFull(Role),
    #[error("Session cancelled: {0}")]
    Cancelled(SessionId),

    #[error("Broadcast hub is not running")]
    HubClosed,
    #[error("Std IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Config error: {0}")]
    ConfigError(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Tokio join error: {0}")]
    TokioJoinError(#[from] JoinError),
}

/// Why a session refused a submission.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    #[error("the {0} already submitted a description")]
    DuplicateDescription(Role),
    #[error("the {0} has not submitted a description yet")]
    MissingDescription(Role),
    #[error("the {0} already signalled the end of its candidates")]
    CandidatesComplete(Role),
    #[error("a candidate receiver for the {0} is already attached")]
    AlreadyAttached(Role),
    #[error("the offer can no longer be dispatched")]
    NotDispatchable,
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::MalformedMessage(err.to_string())
    }
}

impl RelayError {
    /// Stable, machine readable name of the error class.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::WsError(_) | RelayError::SendTimeout(_) | RelayError::ConnectionClosed => {
                "transport_failure"
            }
            RelayError::MalformedMessage(_) => "malformed_message",
            RelayError::SessionNotFound(_) => "session_not_found",
            RelayError::SessionClosed(_) => "session_closed",
            RelayError::InvalidTransition { .. } => "invalid_transition",
            RelayError::QueueFull(_) => "queue_full",
            RelayError::Cancelled(_) => "cancelled",
            RelayError::HubClosed
            | RelayError::IoError(_)
            | RelayError::ConfigError(_)
            | RelayError::InvalidConfig(_)
            | RelayError::TokioJoinError(_) => "internal",
        }
    }

    pub fn is_transport_failure(&self) -> bool {
        self.code() == "transport_failure"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_failures_are_malformed_messages() {
        let err: RelayError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.code(), "malformed_message");
        assert!(!err.is_transport_failure());
    }

    #[test]
    fn duplicate_description_reads_clearly() {
        let err = RelayError::InvalidTransition {
            state: SessionState::OfferReceived,
            reason: TransitionError::DuplicateDescription(Role::Initiator),
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition in state offer_received: the initiator already submitted a description"
        );
        assert!(RelayError::SendTimeout(Duration::from_millis(5)).is_transport_failure());
    }
}
