use serde::{Deserialize, Serialize};

use crate::state::StateError;

/// Service-level failures, grouped by how callers are expected to react
/// rather than by where they happened.
#[derive(Debug, thiserror::Error)]
pub enum MatchmakingError {
    /// Malformed input from a client (empty id on remove, bad ticket shape)
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A client-supplied global id is already live in the system
    #[error("global id {0} is already live")]
    DuplicateId(String),

    /// The referenced ticket is not live in the system
    #[error("no live ticket with id {0}")]
    NotFound(String),

    /// A non-batched state-store operation failed
    #[error("state store failure")]
    Internal(#[from] StateError),

    /// Another director already holds the active lease
    /// (fatal at startup, never retried)
    #[error("another director is already active")]
    LeaderConflict,
}

/// Status codes returned on the ticket surface
/// (the full catalogue; Unspecified/UnknownError/MatchmakerBusy are
/// reserved and currently never produced)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Ok,
    BadRequest,
    DuplicateId,
    Expired,
    NotFound,
    InternalError,
    Unspecified,
    UnknownError,
    MatchmakerBusy,
}

impl From<&MatchmakingError> for TicketStatus {
    fn from(err: &MatchmakingError) -> Self {
        match err {
            MatchmakingError::BadRequest(_) => TicketStatus::BadRequest,
            MatchmakingError::DuplicateId(_) => TicketStatus::DuplicateId,
            MatchmakingError::NotFound(_) => TicketStatus::NotFound,
            MatchmakingError::Internal(_) => TicketStatus::InternalError,
            MatchmakingError::LeaderConflict => TicketStatus::InternalError,
        }
    }
}
