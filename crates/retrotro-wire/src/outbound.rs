//! Outbound events: the messages the server fans out to clients.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{ItemId, UserId};
use crate::phase::{Phase, SessionType};

/// A member of a room, as reported in roster/state snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberView {
    pub user_id: UserId,
    pub user_name: String,
}

/// A board item (card), as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemView {
    pub id: ItemId,
    pub column_id: String,
    pub content: String,
    pub author_id: UserId,
    pub group_id: Option<ItemId>,
}

/// One submitted ROTI rating, revealed alongside the others.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotiVoteView {
    pub user_id: UserId,
    pub rating: u8,
}

/// A point-in-time snapshot of a room's timer, used in `retro_state`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub phase: Phase,
    pub running: bool,
    pub remaining_seconds: u64,
}

/// Whether a vote was added or removed, as reported in `vote_updated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerTickPayload {
    pub remaining_seconds: u64,
    pub phase: Phase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerStartedPayload {
    pub phase: Phase,
    pub duration_seconds: u64,
    pub end_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerPausedPayload {
    pub remaining_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerResumedPayload {
    pub remaining_seconds: u64,
    pub end_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerExtendedPayload {
    pub added_seconds: u64,
    pub new_remaining: u64,
    pub new_end_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerEndedPayload {
    pub phase: Phase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseChangedPayload {
    pub current_phase: Phase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantJoinedPayload {
    pub user_id: UserId,
    pub user_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantLeftPayload {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMembersUpdatedPayload {
    pub members: Vec<MemberView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftTypingPayload {
    pub user_id: UserId,
    pub user_name: String,
    pub column_id: String,
    pub content_length: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftClearedPayload {
    pub user_id: UserId,
    pub column_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorChangedPayload {
    pub facilitator_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotiVoteSubmittedPayload {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotiResultsRevealedPayload {
    pub average: f64,
    pub distribution: BTreeMap<u8, u32>,
    pub votes: Vec<RotiVoteView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoodUpdatedPayload {
    pub user_id: UserId,
    pub mood: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemsGroupedPayload {
    pub parent_id: ItemId,
    pub affected_item_ids: Vec<ItemId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetroStatePayload {
    pub session_id: crate::ids::RoomId,
    pub session_type: SessionType,
    pub current_phase: Phase,
    pub members: Vec<MemberView>,
    pub items: Vec<ItemView>,
    pub facilitator_id: Option<UserId>,
    pub timer: Option<TimerSnapshot>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetroEndedPayload {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemCreatedPayload {
    pub item: ItemView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemUpdatedPayload {
    pub item: ItemView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDeletedPayload {
    pub item_id: ItemId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteUpdatedPayload {
    pub item_id: ItemId,
    pub action: VoteAction,
    pub user_id: UserId,
    pub user_vote_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicChangedPayload {
    pub item_id: ItemId,
}

/// A single outbound event, tagged on the wire as `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundEvent {
    TimerTick(TimerTickPayload),
    TimerStarted(TimerStartedPayload),
    TimerPaused(TimerPausedPayload),
    TimerResumed(TimerResumedPayload),
    TimerExtended(TimerExtendedPayload),
    TimerEnded(TimerEndedPayload),
    PhaseChanged(PhaseChangedPayload),
    ParticipantJoined(ParticipantJoinedPayload),
    ParticipantLeft(ParticipantLeftPayload),
    TeamMembersUpdated(TeamMembersUpdatedPayload),
    DraftTyping(DraftTypingPayload),
    DraftCleared(DraftClearedPayload),
    FacilitatorChanged(FacilitatorChangedPayload),
    RotiVoteSubmitted(RotiVoteSubmittedPayload),
    RotiResultsRevealed(RotiResultsRevealedPayload),
    MoodUpdated(MoodUpdatedPayload),
    ItemsGrouped(ItemsGroupedPayload),
    RetroState(Box<RetroStatePayload>),
    RetroEnded(RetroEndedPayload),
    ItemCreated(ItemCreatedPayload),
    ItemUpdated(ItemUpdatedPayload),
    ItemDeleted(ItemDeletedPayload),
    VoteUpdated(VoteUpdatedPayload),
    TopicChanged(TopicChangedPayload),
    Error(ErrorPayload),
}

impl OutboundEvent {
    /// Serializes this event to a single-line JSON frame.
    ///
    /// The server may coalesce several of these into one websocket frame,
    /// joined by `\n`; clients must split on `\n` before parsing.
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).expect("OutboundEvent serialization never fails")
    }
}
