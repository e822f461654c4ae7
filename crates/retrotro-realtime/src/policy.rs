//! Authorization and authentication collaborators.
//!
//! Concrete authorization policy is external to the engineering core; the
//! engine only defines the trait boundary it consults at each decision
//! point in the router.

use async_trait::async_trait;

use retrotro_wire::UserId;

use crate::error::EngineError;
use crate::phase::Phase;
use crate::repository::SessionState;

/// Validates a handshake bearer credential.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolves a bearer token to `(user_id, display_name)`, or fails with
    /// [`EngineError::Auth`].
    async fn authenticate(&self, token: &str) -> Result<(UserId, String), EngineError>;
}

/// Authorization decisions consulted by the message router.
///
/// Kept as one trait with one method per decision (eight distinct checks)
/// rather than one trait per handler, the way a single listener trait
/// groups several related callbacks together.
#[async_trait]
pub trait AuthPolicy: Send + Sync {
    async fn can_edit_item(
        &self,
        state: &SessionState,
        user: UserId,
        author: UserId,
    ) -> Result<(), EngineError>;

    async fn can_delete_item(
        &self,
        state: &SessionState,
        user: UserId,
        author: UserId,
    ) -> Result<(), EngineError>;

    async fn can_control_phase(&self, state: &SessionState, user: UserId)
        -> Result<(), EngineError>;

    async fn can_control_timer(&self, state: &SessionState, user: UserId)
        -> Result<(), EngineError>;

    async fn can_reveal_roti(&self, state: &SessionState, user: UserId) -> Result<(), EngineError>;

    async fn can_claim_facilitator(
        &self,
        state: &SessionState,
        user: UserId,
    ) -> Result<(), EngineError>;

    async fn can_transfer_facilitator(
        &self,
        state: &SessionState,
        user: UserId,
        target: UserId,
    ) -> Result<(), EngineError>;

    async fn can_control_lc_topic(
        &self,
        state: &SessionState,
        user: UserId,
    ) -> Result<(), EngineError>;
}

/// An [`AuthPolicy`] implementing the default rules: facilitator-only
/// controls, author-or-facilitator item edits, and the `waiting`-phase-only
/// facilitator claim/transfer window. It does
/// not honor `allow_item_edit`/`allow_vote_change` itself — those are
/// checked by the router alongside this policy, since they are session
/// settings rather than principal authorization.
#[derive(Debug, Default)]
pub struct DefaultAuthPolicy;

fn require(condition: bool, message: impl Into<String>) -> Result<(), EngineError> {
    if condition {
        Ok(())
    } else {
        Err(EngineError::Authorization(message.into()))
    }
}

fn is_facilitator(state: &SessionState, user: UserId) -> bool {
    state.facilitator_id == Some(user)
}

#[async_trait]
impl AuthPolicy for DefaultAuthPolicy {
    async fn can_edit_item(
        &self,
        state: &SessionState,
        user: UserId,
        author: UserId,
    ) -> Result<(), EngineError> {
        require(
            user == author || is_facilitator(state, user),
            "only the author or the facilitator may edit this item",
        )
    }

    async fn can_delete_item(
        &self,
        state: &SessionState,
        user: UserId,
        author: UserId,
    ) -> Result<(), EngineError> {
        require(
            user == author || is_facilitator(state, user),
            "only the author or the facilitator may delete this item",
        )
    }

    async fn can_control_phase(
        &self,
        state: &SessionState,
        user: UserId,
    ) -> Result<(), EngineError> {
        require(is_facilitator(state, user), "only the facilitator may change phase")
    }

    async fn can_control_timer(
        &self,
        state: &SessionState,
        user: UserId,
    ) -> Result<(), EngineError> {
        require(is_facilitator(state, user), "only the facilitator may control the timer")
    }

    async fn can_reveal_roti(
        &self,
        state: &SessionState,
        user: UserId,
    ) -> Result<(), EngineError> {
        require(is_facilitator(state, user), "only the facilitator may reveal ROTI results")
    }

    async fn can_claim_facilitator(
        &self,
        state: &SessionState,
        _user: UserId,
    ) -> Result<(), EngineError> {
        require(
            state.current_phase == Phase::Waiting,
            "facilitator can only be claimed during the waiting phase",
        )
    }

    async fn can_transfer_facilitator(
        &self,
        state: &SessionState,
        user: UserId,
        _target: UserId,
    ) -> Result<(), EngineError> {
        require(state.current_phase == Phase::Waiting, "facilitator can only be transferred during the waiting phase")?;
        require(is_facilitator(state, user), "only the current facilitator may transfer the role")
    }

    async fn can_control_lc_topic(
        &self,
        state: &SessionState,
        user: UserId,
    ) -> Result<(), EngineError> {
        require(is_facilitator(state, user), "only the facilitator may move the topic carousel")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_facilitator(facilitator: UserId) -> SessionState {
        SessionState {
            facilitator_id: Some(facilitator),
            ..SessionState::default()
        }
    }

    #[tokio::test]
    async fn non_facilitator_cannot_control_phase() {
        let facilitator = UserId::generate();
        let other = UserId::generate();
        let policy = DefaultAuthPolicy;
        let state = state_with_facilitator(facilitator);
        assert!(policy.can_control_phase(&state, facilitator).await.is_ok());
        assert!(policy.can_control_phase(&state, other).await.is_err());
    }

    #[tokio::test]
    async fn author_or_facilitator_may_edit_item() {
        let facilitator = UserId::generate();
        let author = UserId::generate();
        let stranger = UserId::generate();
        let policy = DefaultAuthPolicy;
        let state = state_with_facilitator(facilitator);
        assert!(policy.can_edit_item(&state, author, author).await.is_ok());
        assert!(policy.can_edit_item(&state, facilitator, author).await.is_ok());
        assert!(policy.can_edit_item(&state, stranger, author).await.is_err());
    }

    #[tokio::test]
    async fn facilitator_claim_requires_waiting_phase() {
        let policy = DefaultAuthPolicy;
        let mut state = SessionState::default();
        let user = UserId::generate();
        assert!(policy.can_claim_facilitator(&state, user).await.is_ok());
        state.current_phase = Phase::Vote;
        assert!(policy.can_claim_facilitator(&state, user).await.is_err());
    }
}
