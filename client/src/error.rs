//! Error kinds surfaced by the client core

use shared::ProtocolError;
use thiserror::Error;

/// Bad or missing local input. Never reaches the network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("participant id is empty")]
    EmptyParticipant,
    #[error("score must be a non-negative integer (got {0})")]
    NegativeScore(i64),
    #[error("duration must be a non-negative number of milliseconds (got {0})")]
    NegativeDuration(i64),
    #[error("stage code is empty")]
    EmptyCategory,
    #[error("prompt is empty")]
    EmptyPrompt,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),

    #[error("persistent channel is not open")]
    NotConnected,

    #[error("remote endpoint unreachable: {0}")]
    Unreachable(String),

    /// Negative acknowledgement (`status` is `None`) or non-success HTTP status.
    #[error("remote rejected request{}: {body}", http_suffix(.status))]
    RemoteRejected { status: Option<u16>, body: String },

    #[error("unreadable frame: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("identity storage failed: {0}")]
    Identity(String),
}

fn http_suffix(status: &Option<u16>) -> String {
    status
        .map(|code| format!(" (HTTP {})", code))
        .unwrap_or_default()
}

impl ClientError {
    /// Whether the failure is attributable to local input rather than the remote side.
    pub fn is_local(&self) -> bool {
        matches!(self, ClientError::Validation(_) | ClientError::NotConnected)
    }
}
