//! Cross-pod transport frames carried over the bus.

use serde::{Deserialize, Serialize};

use crate::ids::{PodId, RoomId, UserId};
use crate::outbound::OutboundEvent;

/// Whether a presence envelope announces a join or a leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceAction {
    Join,
    Leave,
}

/// A frame published on the bus for other pods to observe.
///
/// `Room` carries an already-encoded outbound event to be fanned out
/// verbatim to every local connection in `room_id`; `Presence` announces a
/// join or leave so every pod can keep its own roster and grace-period
/// bookkeeping in sync without a round trip through the repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    Room {
        pod_id: PodId,
        room_id: RoomId,
        inner_message: OutboundEvent,
    },
    Presence {
        pod_id: PodId,
        room_id: RoomId,
        user_id: UserId,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        user_name: Option<String>,
        action: PresenceAction,
    },
}

impl Envelope {
    /// The pod that originated this envelope.
    pub fn pod_id(&self) -> PodId {
        match self {
            Envelope::Room { pod_id, .. } | Envelope::Presence { pod_id, .. } => *pod_id,
        }
    }

    /// The room this envelope concerns.
    pub fn room_id(&self) -> &RoomId {
        match self {
            Envelope::Room { room_id, .. } | Envelope::Presence { room_id, .. } => room_id,
        }
    }
}
