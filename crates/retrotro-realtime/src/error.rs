//! The error taxonomy handlers and collaborators report through.

use thiserror::Error;

/// An error surfaced while driving a connection, dispatching a handler, or
/// talking to a collaborator (repository, policy, bus transport).
///
/// Router dispatch never lets this escape to the caller as a Rust error: it
/// is converted into a caller-directed `error` outbound event (or, for
/// [`EngineError::Auth`], a closed connection) at the router boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Malformed inbound frame. The connection stays open; the frame is dropped.
    #[error("malformed frame: {0}")]
    Protocol(#[from] retrotro_wire::ParseError),

    /// Invalid or missing bearer credential at handshake time.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The principal is not allowed to perform this operation.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// The referenced session, item, or user does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The user has already reached `max_votes_per_user` for this session.
    #[error("vote limit reached")]
    VoteLimitReached,

    /// The user has already reached `max_votes_per_item` for this item.
    #[error("item vote limit reached")]
    ItemVoteLimitReached,

    /// A bus transport failed to publish. Local fan-out still happened.
    #[error("bus publish failed: {0}")]
    Transport(String),

    /// The connection's outbound queue was full; the connection was evicted.
    #[error("outbound queue full, connection evicted")]
    Backpressure,

    /// A repository call failed while mutating durable state.
    #[error("repository error: {0}")]
    TransientRepository(String),

    /// Wraps an I/O failure, e.g. from the TCP listener or the websocket stream.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Wraps a JSON (de)serialization failure outside of frame parsing proper.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// The stable machine-readable code sent to clients in an `error` event.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Protocol(_) => "protocol_error",
            EngineError::Auth(_) => "auth_error",
            EngineError::Authorization(_) => "authorization_error",
            EngineError::NotFound(_) => "not_found",
            EngineError::VoteLimitReached => "vote_limit_reached",
            EngineError::ItemVoteLimitReached => "item_vote_limit_reached",
            EngineError::Transport(_) => "transport_error",
            EngineError::Backpressure => "backpressure",
            EngineError::TransientRepository(_) => "repository_error",
            EngineError::Io(_) => "io_error",
            EngineError::Json(_) => "json_error",
        }
    }

    /// Whether this error should be reported to the caller as an `error`
    /// event, as opposed to being logged-and-swallowed or closing the
    /// connection outright.
    pub fn is_caller_reportable(&self) -> bool {
        !matches!(self, EngineError::Auth(_) | EngineError::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_strings() {
        assert_eq!(EngineError::VoteLimitReached.code(), "vote_limit_reached");
        assert_eq!(
            EngineError::ItemVoteLimitReached.code(),
            "item_vote_limit_reached"
        );
    }

    #[test]
    fn auth_errors_are_not_reported_to_the_caller() {
        assert!(!EngineError::Auth("bad token".into()).is_caller_reportable());
        assert!(EngineError::NotFound("item".into()).is_caller_reportable());
    }
}
