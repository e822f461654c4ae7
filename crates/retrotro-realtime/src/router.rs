//! C6: the message router.
//!
//! One dispatch per inbound message type: validate via the policy
//! collaborator, mutate durable state via the repository collaborator, emit
//! outbound events via the bus. Kept as a single `match` over
//! [`InboundMessage`] rather than a lookup table, since the handler set is
//! fixed at compile time and a table buys nothing but indirection.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use retrotro_wire::inbound::{
    DiscussSetItemPayload, DraftClearedPayload, DraftTypingPayload, FacilitatorTransferPayload,
    ItemCreatePayload, ItemDeletePayload, ItemGroupPayload, ItemUpdatePayload, MoodSetPayload,
    PhaseSetPayload, RotiVotePayload, TimerAddTimePayload, TimerStartPayload, VoteAddPayload,
    VoteRemovePayload,
};
use retrotro_wire::outbound::{
    DraftClearedPayload as OutDraftClearedPayload, DraftTypingPayload as OutDraftTypingPayload,
    FacilitatorChangedPayload, ItemCreatedPayload, ItemDeletedPayload, ItemUpdatedPayload,
    ItemView, ItemsGroupedPayload, MemberView, MoodUpdatedPayload, OutboundEvent,
    ParticipantJoinedPayload, ParticipantLeftPayload, RetroStatePayload, RotiResultsRevealedPayload,
    RotiVoteSubmittedPayload, RotiVoteView, TeamMembersUpdatedPayload, TimerSnapshot,
    TopicChangedPayload, VoteAction, VoteUpdatedPayload,
};
use retrotro_wire::{ConnectionId, InboundMessage, ItemId, RoomId, UserId};

use crate::bus::Bus;
use crate::error::EngineError;
use crate::hub::Hub;
use crate::phase::PhaseSequencer;
use crate::policy::AuthPolicy;
use crate::repository::{ItemRecord, Repository};
use crate::timer::TimerService;

/// The per-connection state the router reads and mutates across dispatches.
/// Owned by the connection's reader task; never shared across connections.
pub struct ConnectionContext {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub user_name: String,
    pub room: Option<RoomId>,
}

impl ConnectionContext {
    pub fn new(connection_id: ConnectionId, user_id: UserId, user_name: String) -> Self {
        Self {
            connection_id,
            user_id,
            user_name,
            room: None,
        }
    }
}

fn current_room(ctx: &ConnectionContext) -> Result<RoomId, EngineError> {
    ctx.room
        .clone()
        .ok_or_else(|| EngineError::NotFound("not joined to a retro".into()))
}

fn item_view(record: ItemRecord) -> ItemView {
    ItemView {
        id: record.id,
        column_id: record.column_id,
        content: record.content,
        author_id: record.author_id,
        group_id: record.group_id,
    }
}

/// Dispatches one decoded [`InboundMessage`] per call. Stateless beyond its
/// collaborators, with one exception: the Lean Coffee topic carousel's
/// current position, which has no persisted column and is kept here as
/// ephemeral per-room navigation state.
pub struct Router {
    hub: Arc<Hub>,
    bus: Arc<Bus>,
    repository: Arc<dyn Repository>,
    policy: Arc<dyn AuthPolicy>,
    phases: Arc<PhaseSequencer>,
    timers: Arc<TimerService>,
    current_topics: Mutex<HashMap<RoomId, ItemId>>,
}

impl Router {
    pub fn new(
        hub: Arc<Hub>,
        bus: Arc<Bus>,
        repository: Arc<dyn Repository>,
        policy: Arc<dyn AuthPolicy>,
        phases: Arc<PhaseSequencer>,
        timers: Arc<TimerService>,
    ) -> Self {
        Self {
            hub,
            bus,
            repository,
            policy,
            phases,
            timers,
            current_topics: Mutex::new(HashMap::new()),
        }
    }

    pub async fn dispatch(
        &self,
        ctx: &mut ConnectionContext,
        message: InboundMessage,
    ) -> Result<(), EngineError> {
        match message {
            InboundMessage::JoinRetro(p) => self.handle_join_retro(ctx, p.retro_id).await,
            InboundMessage::LeaveRetro(_) => self.handle_leave_retro(ctx).await,
            InboundMessage::Heartbeat(_) => Ok(()),
            InboundMessage::ItemCreate(p) => self.handle_item_create(ctx, p).await,
            InboundMessage::ItemUpdate(p) => self.handle_item_update(ctx, p).await,
            InboundMessage::ItemDelete(p) => self.handle_item_delete(ctx, p).await,
            InboundMessage::ItemGroup(p) => self.handle_item_group(ctx, p).await,
            InboundMessage::VoteAdd(p) => self.handle_vote_add(ctx, p).await,
            InboundMessage::VoteRemove(p) => self.handle_vote_remove(ctx, p).await,
            InboundMessage::PhaseNext(_) => self.handle_phase_next(ctx).await,
            InboundMessage::PhaseSet(p) => self.handle_phase_set(ctx, p).await,
            InboundMessage::TimerStart(p) => self.handle_timer_start(ctx, p).await,
            InboundMessage::TimerPause(_) => self.handle_timer_pause(ctx).await,
            InboundMessage::TimerResume(_) => self.handle_timer_resume(ctx).await,
            InboundMessage::TimerAddTime(p) => self.handle_timer_add_time(ctx, p).await,
            InboundMessage::TimerReset(_) => self.handle_timer_reset(ctx).await,
            InboundMessage::TimerStop(_) => self.handle_timer_stop(ctx).await,
            InboundMessage::DraftTyping(p) => self.handle_draft_typing(ctx, p).await,
            InboundMessage::DraftCleared(p) => self.handle_draft_cleared(ctx, p).await,
            InboundMessage::MoodSet(p) => self.handle_mood_set(ctx, p).await,
            InboundMessage::RotiVote(p) => self.handle_roti_vote(ctx, p).await,
            InboundMessage::RotiReveal(_) => self.handle_roti_reveal(ctx).await,
            InboundMessage::FacilitatorClaim(_) => self.handle_facilitator_claim(ctx).await,
            InboundMessage::FacilitatorTransfer(p) => self.handle_facilitator_transfer(ctx, p).await,
            InboundMessage::DiscussSetItem(p) => self.handle_discuss_set_item(ctx, p).await,
            InboundMessage::LcNextTopic(_) => self.handle_lc_next_topic(ctx).await,
        }
    }

    async fn handle_join_retro(
        &self,
        ctx: &mut ConnectionContext,
        room: RoomId,
    ) -> Result<(), EngineError> {
        self.hub.join_room(ctx.connection_id, room.clone());
        ctx.room = Some(room.clone());

        let state = self.repository.session_state(&room).await?;
        let items = self.repository.items(&room).await?;
        let timer = self
            .timers
            .remaining(&room)
            .map(|(running, remaining_seconds)| TimerSnapshot {
                phase: state.current_phase,
                running,
                remaining_seconds,
            });
        let snapshot = RetroStatePayload {
            session_id: room.clone(),
            session_type: state.session_type,
            current_phase: state.current_phase,
            members: self.bus.room_clients(&room),
            items: items.into_iter().map(item_view).collect(),
            facilitator_id: state.facilitator_id,
            timer,
        };
        let frame: Arc<str> = Arc::from(OutboundEvent::RetroState(Box::new(snapshot)).to_frame());
        self.hub.send_to(ctx.connection_id, frame);

        // Local broadcast goes straight through the hub, not
        // `Bus::broadcast_to_room`: join/leave travel on the presence
        // subject, not the room subject, so the remote side is informed via
        // `publish_presence_join` below rather than a mirrored room envelope.
        self.hub.broadcast_raw(
            &room,
            Arc::from(
                OutboundEvent::ParticipantJoined(ParticipantJoinedPayload {
                    user_id: ctx.user_id,
                    user_name: ctx.user_name.clone(),
                })
                .to_frame(),
            ),
            None,
        );
        let members: Vec<MemberView> = self.bus.room_clients(&room);
        self.hub.broadcast_raw(
            &room,
            Arc::from(OutboundEvent::TeamMembersUpdated(TeamMembersUpdatedPayload { members }).to_frame()),
            None,
        );

        self.bus
            .publish_presence_join(&room, ctx.user_id, &ctx.user_name)
            .await
    }

    async fn handle_leave_retro(&self, ctx: &mut ConnectionContext) -> Result<(), EngineError> {
        let Some(room) = ctx.room.take() else {
            return Ok(());
        };
        self.hub.leave_room(ctx.connection_id);

        // An explicit leave never schedules the hub's grace period; it
        // resolves immediately, unless the user still holds another
        // connection (another tab) in the same room.
        if !self.bus.is_user_in_room(&room, ctx.user_id) {
            self.hub.broadcast_raw(
                &room,
                Arc::from(
                    OutboundEvent::ParticipantLeft(ParticipantLeftPayload { user_id: ctx.user_id })
                        .to_frame(),
                ),
                None,
            );
            let members = self.bus.room_clients(&room);
            self.hub.broadcast_raw(
                &room,
                Arc::from(OutboundEvent::TeamMembersUpdated(TeamMembersUpdatedPayload { members }).to_frame()),
                None,
            );
        }

        self.bus.publish_presence_leave(&room, ctx.user_id).await
    }

    async fn handle_item_create(
        &self,
        ctx: &ConnectionContext,
        payload: ItemCreatePayload,
    ) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        let record = self
            .repository
            .create_item(&room, &payload.column_id, &payload.content, ctx.user_id)
            .await?;
        self.bus
            .broadcast_to_room(&room, OutboundEvent::ItemCreated(ItemCreatedPayload { item: item_view(record) }))
            .await
    }

    async fn handle_item_update(
        &self,
        ctx: &ConnectionContext,
        payload: ItemUpdatePayload,
    ) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        let state = self.repository.session_state(&room).await?;
        if !state.allow_item_edit {
            return Err(EngineError::Authorization(
                "item edits are disabled for this session".into(),
            ));
        }
        let existing = self.repository.item(&room, payload.item_id).await?;
        self.policy
            .can_edit_item(&state, ctx.user_id, existing.author_id)
            .await?;
        let record = self
            .repository
            .update_item(&room, payload.item_id, &payload.content)
            .await?;
        self.bus
            .broadcast_to_room(&room, OutboundEvent::ItemUpdated(ItemUpdatedPayload { item: item_view(record) }))
            .await
    }

    async fn handle_item_delete(
        &self,
        ctx: &ConnectionContext,
        payload: ItemDeletePayload,
    ) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        let state = self.repository.session_state(&room).await?;
        let existing = self.repository.item(&room, payload.item_id).await?;
        self.policy
            .can_delete_item(&state, ctx.user_id, existing.author_id)
            .await?;
        self.repository.delete_item(&room, payload.item_id).await?;
        self.bus
            .broadcast_to_room(&room, OutboundEvent::ItemDeleted(ItemDeletedPayload { item_id: payload.item_id }))
            .await
    }

    /// Groups `childIds` under `parentId`, flattening one level: any item
    /// already grouped under one of the children is re-parented directly to
    /// `parentId` too, so the group tree never deepens past one level.
    async fn handle_item_group(
        &self,
        ctx: &ConnectionContext,
        payload: ItemGroupPayload,
    ) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        let mut affected = Vec::new();
        for child in payload.child_ids {
            let descendants = self.repository.descendants(&room, child).await?;
            self.repository
                .set_item_group(&room, child, Some(payload.parent_id))
                .await?;
            affected.push(child);
            for descendant in descendants {
                self.repository
                    .set_item_group(&room, descendant, Some(payload.parent_id))
                    .await?;
                affected.push(descendant);
            }
        }
        self.bus
            .broadcast_to_room(
                &room,
                OutboundEvent::ItemsGrouped(ItemsGroupedPayload {
                    parent_id: payload.parent_id,
                    affected_item_ids: affected,
                }),
            )
            .await
    }

    async fn handle_vote_add(
        &self,
        ctx: &ConnectionContext,
        payload: VoteAddPayload,
    ) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        let state = self.repository.session_state(&room).await?;
        let (total, per_item) = self
            .repository
            .vote_counts(&room, ctx.user_id, payload.item_id)
            .await?;
        if total >= state.max_votes_per_user {
            return Err(EngineError::VoteLimitReached);
        }
        if per_item >= state.max_votes_per_item {
            return Err(EngineError::ItemVoteLimitReached);
        }
        let user_vote_count = self
            .repository
            .add_vote(&room, ctx.user_id, payload.item_id)
            .await?;
        self.bus
            .broadcast_to_room(
                &room,
                OutboundEvent::VoteUpdated(VoteUpdatedPayload {
                    item_id: payload.item_id,
                    action: VoteAction::Add,
                    user_id: ctx.user_id,
                    user_vote_count,
                }),
            )
            .await
    }

    async fn handle_vote_remove(
        &self,
        ctx: &ConnectionContext,
        payload: VoteRemovePayload,
    ) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        let state = self.repository.session_state(&room).await?;
        if !state.allow_vote_change {
            return Err(EngineError::Authorization(
                "vote changes are disabled for this session".into(),
            ));
        }
        let user_vote_count = self
            .repository
            .remove_vote(&room, ctx.user_id, payload.item_id)
            .await?;
        self.bus
            .broadcast_to_room(
                &room,
                OutboundEvent::VoteUpdated(VoteUpdatedPayload {
                    item_id: payload.item_id,
                    action: VoteAction::Remove,
                    user_id: ctx.user_id,
                    user_vote_count,
                }),
            )
            .await
    }

    async fn handle_phase_next(&self, ctx: &ConnectionContext) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        let state = self.repository.session_state(&room).await?;
        self.policy.can_control_phase(&state, ctx.user_id).await?;
        self.phases.next_phase(&room, state.session_type).await?;
        Ok(())
    }

    async fn handle_phase_set(
        &self,
        ctx: &ConnectionContext,
        payload: PhaseSetPayload,
    ) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        let state = self.repository.session_state(&room).await?;
        self.policy.can_control_phase(&state, ctx.user_id).await?;
        self.phases
            .set_phase(&room, state.session_type, payload.phase)
            .await
    }

    async fn handle_timer_start(
        &self,
        ctx: &ConnectionContext,
        payload: TimerStartPayload,
    ) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        let state = self.repository.session_state(&room).await?;
        self.policy.can_control_timer(&state, ctx.user_id).await?;
        self.timers.start(&room, payload.duration_seconds).await
    }

    async fn handle_timer_pause(&self, ctx: &ConnectionContext) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        let state = self.repository.session_state(&room).await?;
        self.policy.can_control_timer(&state, ctx.user_id).await?;
        self.timers.pause(&room).await
    }

    async fn handle_timer_resume(&self, ctx: &ConnectionContext) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        let state = self.repository.session_state(&room).await?;
        self.policy.can_control_timer(&state, ctx.user_id).await?;
        self.timers.resume(&room).await
    }

    async fn handle_timer_add_time(
        &self,
        ctx: &ConnectionContext,
        payload: TimerAddTimePayload,
    ) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        let state = self.repository.session_state(&room).await?;
        self.policy.can_control_timer(&state, ctx.user_id).await?;
        self.timers.add_time(&room, payload.seconds).await
    }

    async fn handle_timer_reset(&self, ctx: &ConnectionContext) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        let state = self.repository.session_state(&room).await?;
        self.policy.can_control_timer(&state, ctx.user_id).await?;
        self.timers.reset(&room).await
    }

    async fn handle_timer_stop(&self, ctx: &ConnectionContext) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        let state = self.repository.session_state(&room).await?;
        self.policy.can_control_timer(&state, ctx.user_id).await?;
        self.timers.stop(&room).await
    }

    async fn handle_draft_typing(
        &self,
        ctx: &ConnectionContext,
        payload: DraftTypingPayload,
    ) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        self.bus
            .broadcast_to_room_except(
                &room,
                OutboundEvent::DraftTyping(OutDraftTypingPayload {
                    user_id: ctx.user_id,
                    user_name: ctx.user_name.clone(),
                    column_id: payload.column_id,
                    content_length: payload.content_length,
                }),
                ctx.connection_id,
            )
            .await
    }

    async fn handle_draft_cleared(
        &self,
        ctx: &ConnectionContext,
        payload: DraftClearedPayload,
    ) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        self.bus
            .broadcast_to_room_except(
                &room,
                OutboundEvent::DraftCleared(OutDraftClearedPayload {
                    user_id: ctx.user_id,
                    column_id: payload.column_id,
                }),
                ctx.connection_id,
            )
            .await
    }

    async fn handle_mood_set(
        &self,
        ctx: &ConnectionContext,
        payload: MoodSetPayload,
    ) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        self.repository
            .set_mood(&room, ctx.user_id, &payload.mood)
            .await?;
        self.bus
            .broadcast_to_room(
                &room,
                OutboundEvent::MoodUpdated(MoodUpdatedPayload { user_id: ctx.user_id, mood: payload.mood }),
            )
            .await
    }

    async fn handle_roti_vote(
        &self,
        ctx: &ConnectionContext,
        payload: RotiVotePayload,
    ) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        if !(1..=5).contains(&payload.rating) {
            // Out-of-range rating reports the same way as any other
            // rejected request: a caller-only `error` reply.
            return Err(EngineError::Authorization("rating must be between 1 and 5".into()));
        }
        self.repository
            .submit_roti_vote(&room, ctx.user_id, payload.rating)
            .await?;
        self.bus
            .broadcast_to_room(
                &room,
                OutboundEvent::RotiVoteSubmitted(RotiVoteSubmittedPayload { user_id: ctx.user_id }),
            )
            .await
    }

    async fn handle_roti_reveal(&self, ctx: &ConnectionContext) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        let state = self.repository.session_state(&room).await?;
        self.policy.can_reveal_roti(&state, ctx.user_id).await?;
        self.repository.set_roti_revealed(&room, true).await?;

        let votes = self.repository.roti_votes(&room).await?;
        let mut distribution: BTreeMap<u8, u32> = BTreeMap::new();
        for vote in &votes {
            *distribution.entry(vote.rating).or_insert(0) += 1;
        }
        let average = if votes.is_empty() {
            0.0
        } else {
            votes.iter().map(|v| v.rating as f64).sum::<f64>() / votes.len() as f64
        };
        let views = votes
            .into_iter()
            .map(|v| RotiVoteView { user_id: v.user_id, rating: v.rating })
            .collect();

        self.bus
            .broadcast_to_room(
                &room,
                OutboundEvent::RotiResultsRevealed(RotiResultsRevealedPayload {
                    average,
                    distribution,
                    votes: views,
                }),
            )
            .await
    }

    async fn handle_facilitator_claim(&self, ctx: &ConnectionContext) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        let state = self.repository.session_state(&room).await?;
        self.policy.can_claim_facilitator(&state, ctx.user_id).await?;
        self.repository.set_facilitator(&room, Some(ctx.user_id)).await?;
        self.bus
            .broadcast_to_room(
                &room,
                OutboundEvent::FacilitatorChanged(FacilitatorChangedPayload { facilitator_id: ctx.user_id }),
            )
            .await
    }

    async fn handle_facilitator_transfer(
        &self,
        ctx: &ConnectionContext,
        payload: FacilitatorTransferPayload,
    ) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        let state = self.repository.session_state(&room).await?;
        self.policy
            .can_transfer_facilitator(&state, ctx.user_id, payload.user_id)
            .await?;
        if !self.bus.is_user_in_room(&room, payload.user_id) {
            return Err(EngineError::NotFound(format!(
                "user {} is not connected to this room",
                payload.user_id
            )));
        }
        self.repository
            .set_facilitator(&room, Some(payload.user_id))
            .await?;
        self.bus
            .broadcast_to_room(
                &room,
                OutboundEvent::FacilitatorChanged(FacilitatorChangedPayload { facilitator_id: payload.user_id }),
            )
            .await
    }

    async fn handle_discuss_set_item(
        &self,
        ctx: &ConnectionContext,
        payload: DiscussSetItemPayload,
    ) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        let state = self.repository.session_state(&room).await?;
        self.policy.can_control_lc_topic(&state, ctx.user_id).await?;
        self.repository.item(&room, payload.item_id).await?;
        self.current_topics.lock().insert(room.clone(), payload.item_id);
        self.bus
            .broadcast_to_room(&room, OutboundEvent::TopicChanged(TopicChangedPayload { item_id: payload.item_id }))
            .await
    }

    /// Advances the Lean Coffee topic carousel to the item following
    /// whichever one `discuss_set_item` or a prior call to this handler last
    /// selected, wrapping around. The carousel position has no persisted
    /// column, so it lives here as in-memory per-room state rather than in
    /// the repository.
    async fn handle_lc_next_topic(&self, ctx: &ConnectionContext) -> Result<(), EngineError> {
        let room = current_room(ctx)?;
        let state = self.repository.session_state(&room).await?;
        self.policy.can_control_lc_topic(&state, ctx.user_id).await?;

        let mut items = self.repository.items(&room).await?;
        if items.is_empty() {
            return Err(EngineError::NotFound(format!("no items to discuss in {room}")));
        }
        items.sort_by(|a, b| a.id.to_string().cmp(&b.id.to_string()));

        let current = self.current_topics.lock().get(&room).copied();
        let next = match current.and_then(|id| items.iter().position(|item| item.id == id)) {
            Some(idx) => items[(idx + 1) % items.len()].id,
            None => items[0].id,
        };
        self.current_topics.lock().insert(room.clone(), next);
        self.bus
            .broadcast_to_room(&room, OutboundEvent::TopicChanged(TopicChangedPayload { item_id: next }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::transport::in_process::InProcessTransport;
    use crate::policy::DefaultAuthPolicy;
    use crate::repository::InMemoryRepository;
    use retrotro_wire::PodId;
    use tokio::sync::mpsc;

    async fn router() -> (Router, Arc<Hub>, Arc<dyn Repository>) {
        let hub = Hub::new();
        let transport = Arc::new(InProcessTransport::shared());
        let bus = Arc::new(Bus::new(PodId::generate(), Arc::clone(&hub), transport));
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::default());
        let policy: Arc<dyn AuthPolicy> = Arc::new(DefaultAuthPolicy);
        let phases = Arc::new(PhaseSequencer::new(Arc::clone(&repo), Arc::clone(&bus)));
        let timers = Arc::new(TimerService::new(Arc::clone(&repo), Arc::clone(&bus), 5, 10));
        (
            Router::new(hub.clone(), bus, Arc::clone(&repo), policy, phases, timers),
            hub,
            repo,
        )
    }

    fn connect(hub: &Arc<Hub>, user_id: UserId, user_name: &str) -> ConnectionContext {
        let (tx, _rx) = mpsc::channel(32);
        let conn = ConnectionId::generate();
        hub.register(conn, user_id, user_name.to_string(), tx);
        ConnectionContext::new(conn, user_id, user_name.to_string())
    }

    #[tokio::test]
    async fn join_then_leave_round_trips_room_membership() {
        let (router, hub, _repo) = router().await;
        let user = UserId::generate();
        let mut ctx = connect(&hub, user, "alice");
        let room = RoomId::new("sess-1");

        router
            .dispatch(&mut ctx, InboundMessage::JoinRetro(retrotro_wire::inbound::JoinRetroPayload { retro_id: room.clone() }))
            .await
            .unwrap();
        assert!(hub.is_user_in_room(&room, user));

        router
            .dispatch(&mut ctx, InboundMessage::LeaveRetro(Default::default()))
            .await
            .unwrap();
        assert!(!hub.is_user_in_room(&room, user));
    }

    #[tokio::test]
    async fn vote_add_enforces_the_per_item_cap() {
        let (router, hub, _repo) = router().await;
        let user = UserId::generate();
        let mut ctx = connect(&hub, user, "alice");
        let room = RoomId::new("sess-1");
        router
            .dispatch(&mut ctx, InboundMessage::JoinRetro(retrotro_wire::inbound::JoinRetroPayload { retro_id: room.clone() }))
            .await
            .unwrap();

        let item = ItemId::generate();
        for expected in 1..=3u32 {
            let result = router
                .dispatch(&mut ctx, InboundMessage::VoteAdd(VoteAddPayload { item_id: item }))
                .await;
            assert!(result.is_ok(), "vote {expected} should succeed");
        }
        let result = router
            .dispatch(&mut ctx, InboundMessage::VoteAdd(VoteAddPayload { item_id: item }))
            .await;
        assert!(matches!(result, Err(EngineError::ItemVoteLimitReached)));
    }

    #[tokio::test]
    async fn only_the_facilitator_may_advance_the_phase() {
        let (router, hub, _repo) = router().await;
        let facilitator = UserId::generate();
        let mut ctx = connect(&hub, facilitator, "alice");
        let room = RoomId::new("sess-1");
        router
            .dispatch(&mut ctx, InboundMessage::JoinRetro(retrotro_wire::inbound::JoinRetroPayload { retro_id: room.clone() }))
            .await
            .unwrap();

        let result = router.dispatch(&mut ctx, InboundMessage::PhaseNext(Default::default())).await;
        assert!(matches!(result, Err(EngineError::Authorization(_))));
    }

    #[tokio::test]
    async fn item_group_flattens_grandchildren() {
        let (router, hub, repo) = router().await;
        let user = UserId::generate();
        let mut ctx = connect(&hub, user, "alice");
        let room = RoomId::new("sess-1");
        router
            .dispatch(&mut ctx, InboundMessage::JoinRetro(retrotro_wire::inbound::JoinRetroPayload { retro_id: room.clone() }))
            .await
            .unwrap();

        let a = repo.create_item(&room, "ideas", "a", user).await.unwrap();
        let b = repo.create_item(&room, "ideas", "b", user).await.unwrap();
        let c = repo.create_item(&room, "ideas", "c", user).await.unwrap();
        let d = repo.create_item(&room, "ideas", "d", user).await.unwrap();
        repo.set_item_group(&room, b.id, Some(a.id)).await.unwrap();
        repo.set_item_group(&room, c.id, Some(b.id)).await.unwrap();

        router
            .dispatch(
                &mut ctx,
                InboundMessage::ItemGroup(ItemGroupPayload { parent_id: d.id, child_ids: vec![b.id] }),
            )
            .await
            .unwrap();

        assert_eq!(repo.item(&room, b.id).await.unwrap().group_id, Some(d.id));
        assert_eq!(repo.item(&room, c.id).await.unwrap().group_id, Some(d.id));
    }
}
