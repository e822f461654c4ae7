//! C5: the phase sequencer.

use std::sync::Arc;

pub use retrotro_wire::phase::{Phase, PhaseOrder, SessionType};
use retrotro_wire::outbound::{OutboundEvent, PhaseChangedPayload};
use retrotro_wire::RoomId;

use crate::bus::Bus;
use crate::error::EngineError;
use crate::repository::Repository;

/// Advances or sets a session's phase, persisting and broadcasting each
/// change. Stateless beyond its collaborators: the session's current phase
/// lives in the repository, not here.
pub struct PhaseSequencer {
    repository: Arc<dyn Repository>,
    bus: Arc<Bus>,
}

impl PhaseSequencer {
    pub fn new(repository: Arc<dyn Repository>, bus: Arc<Bus>) -> Self {
        Self { repository, bus }
    }

    /// Advances `room` to the successor of its current phase, or leaves it
    /// unchanged if already terminal.
    pub async fn next_phase(
        &self,
        room: &RoomId,
        session_type: SessionType,
    ) -> Result<Phase, EngineError> {
        let state = self.repository.session_state(room).await?;
        let order = PhaseOrder::for_session_type(session_type);
        let next = order.successor(state.current_phase);
        self.set_phase_unchecked(room, next).await?;
        Ok(next)
    }

    /// Jumps directly to `phase`, which must be valid for `session_type`.
    pub async fn set_phase(
        &self,
        room: &RoomId,
        session_type: SessionType,
        phase: Phase,
    ) -> Result<(), EngineError> {
        let order = PhaseOrder::for_session_type(session_type);
        if !order.contains(phase) {
            return Err(EngineError::Authorization(format!(
                "{phase:?} is not valid for {session_type:?}"
            )));
        }
        self.set_phase_unchecked(room, phase).await
    }

    async fn set_phase_unchecked(&self, room: &RoomId, phase: Phase) -> Result<(), EngineError> {
        self.repository.set_phase(room, phase).await?;
        self.bus
            .broadcast_to_room(
                room,
                OutboundEvent::PhaseChanged(PhaseChangedPayload { current_phase: phase }),
            )
            .await
    }
}
