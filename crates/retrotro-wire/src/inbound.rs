//! Inbound messages: the requests a connected client can send.

use serde::{Deserialize, Serialize};

use crate::ids::{ItemId, RoomId, UserId};
use crate::parse_error::ParseError;
use crate::phase::Phase;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRetroPayload {
    pub retro_id: RoomId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRetroPayload {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemCreatePayload {
    pub column_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemUpdatePayload {
    pub item_id: ItemId,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDeletePayload {
    pub item_id: ItemId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemGroupPayload {
    pub parent_id: ItemId,
    pub child_ids: Vec<ItemId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteAddPayload {
    pub item_id: ItemId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRemovePayload {
    pub item_id: ItemId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseNextPayload {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseSetPayload {
    pub phase: Phase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerStartPayload {
    pub duration_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerPausePayload {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerResumePayload {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerAddTimePayload {
    pub seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerResetPayload {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerStopPayload {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftTypingPayload {
    pub column_id: String,
    pub content_length: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftClearedPayload {
    pub column_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoodSetPayload {
    pub mood: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotiVotePayload {
    pub rating: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotiRevealPayload {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorClaimPayload {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorTransferPayload {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscussSetItemPayload {
    pub item_id: ItemId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LcNextTopicPayload {}

/// A single inbound message, tagged on the wire as `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum InboundMessage {
    JoinRetro(JoinRetroPayload),
    LeaveRetro(LeaveRetroPayload),
    Heartbeat(HeartbeatPayload),
    ItemCreate(ItemCreatePayload),
    ItemUpdate(ItemUpdatePayload),
    ItemDelete(ItemDeletePayload),
    ItemGroup(ItemGroupPayload),
    VoteAdd(VoteAddPayload),
    VoteRemove(VoteRemovePayload),
    PhaseNext(PhaseNextPayload),
    PhaseSet(PhaseSetPayload),
    TimerStart(TimerStartPayload),
    TimerPause(TimerPausePayload),
    TimerResume(TimerResumePayload),
    TimerAddTime(TimerAddTimePayload),
    TimerReset(TimerResetPayload),
    TimerStop(TimerStopPayload),
    DraftTyping(DraftTypingPayload),
    DraftCleared(DraftClearedPayload),
    MoodSet(MoodSetPayload),
    RotiVote(RotiVotePayload),
    RotiReveal(RotiRevealPayload),
    FacilitatorClaim(FacilitatorClaimPayload),
    FacilitatorTransfer(FacilitatorTransferPayload),
    DiscussSetItem(DiscussSetItemPayload),
    LcNextTopic(LcNextTopicPayload),
}

/// The `type` strings `InboundMessage` knows how to parse a payload for.
///
/// Kept in lockstep with the variant list above; used only to tell an
/// unknown message type apart from a malformed payload for a known one.
const KNOWN_TYPES: &[&str] = &[
    "join_retro",
    "leave_retro",
    "heartbeat",
    "item_create",
    "item_update",
    "item_delete",
    "item_group",
    "vote_add",
    "vote_remove",
    "phase_next",
    "phase_set",
    "timer_start",
    "timer_pause",
    "timer_resume",
    "timer_add_time",
    "timer_reset",
    "timer_stop",
    "draft_typing",
    "draft_cleared",
    "mood_set",
    "roti_vote",
    "roti_reveal",
    "facilitator_claim",
    "facilitator_transfer",
    "discuss_set_item",
    "lc_next_topic",
];

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

impl InboundMessage {
    /// Parses a single client frame.
    ///
    /// Frames are newline-delimited JSON objects of the shape
    /// `{"type": "...", "payload": {...}}`. An unrecognized `type` and a
    /// malformed `payload` for a recognized `type` are reported as distinct
    /// [`ParseError`] variants so the caller can log (and, per policy,
    /// possibly tolerate) them differently.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let text = std::str::from_utf8(bytes)?;
        let raw: RawFrame = serde_json::from_str(text)?;
        let reframed = serde_json::json!({ "type": raw.kind, "payload": raw.payload });
        serde_json::from_value(reframed).map_err(|err| {
            if KNOWN_TYPES.contains(&raw.kind.as_str()) {
                ParseError::InvalidPayload(raw.kind.clone(), err)
            } else {
                ParseError::UnknownType(raw.kind.clone())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_join_retro() {
        let frame = br#"{"type":"join_retro","payload":{"retroId":"sess-1"}}"#;
        let msg = InboundMessage::parse(frame).unwrap();
        match msg {
            InboundMessage::JoinRetro(p) => assert_eq!(p.retro_id.as_str(), "sess-1"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn empty_payload_messages_accept_an_empty_object() {
        let frame = br#"{"type":"phase_next","payload":{}}"#;
        assert!(matches!(
            InboundMessage::parse(frame).unwrap(),
            InboundMessage::PhaseNext(_)
        ));
    }

    #[test]
    fn empty_payload_messages_accept_a_missing_payload_field() {
        let frame = br#"{"type":"heartbeat"}"#;
        assert!(matches!(
            InboundMessage::parse(frame).unwrap(),
            InboundMessage::Heartbeat(_)
        ));
    }

    #[test]
    fn unknown_type_is_reported_distinctly_from_bad_payload() {
        let frame = br#"{"type":"self_destruct","payload":{}}"#;
        match InboundMessage::parse(frame) {
            Err(ParseError::UnknownType(kind)) => assert_eq!(kind, "self_destruct"),
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn malformed_payload_on_a_known_type_is_invalid_payload() {
        let frame = br#"{"type":"item_create","payload":{"columnId":"ideas"}}"#;
        match InboundMessage::parse(frame) {
            Err(ParseError::InvalidPayload(kind, _)) => assert_eq!(kind, "item_create"),
            other => panic!("expected InvalidPayload, got {other:?}"),
        }
    }

    #[test]
    fn rejects_non_utf8_frames() {
        let frame = [0xff, 0xfe, 0xfd];
        assert!(matches!(
            InboundMessage::parse(&frame),
            Err(ParseError::Utf8(_))
        ));
    }
}
