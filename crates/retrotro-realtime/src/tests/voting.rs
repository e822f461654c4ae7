//! Vote caps: a user stops being able to vote on an item once either the
//! per-item or per-user ceiling is reached, and every accepted vote is
//! reflected to the rest of the room in order.

use std::time::Duration;

use retrotro_wire::inbound::{JoinRetroPayload, VoteAddPayload};
use retrotro_wire::outbound::{OutboundEvent, VoteAction};
use retrotro_wire::{InboundMessage, ItemId, RoomId};

use crate::config::Config;
use crate::tests::{collect_for, Harness};

#[tokio::test]
async fn six_votes_on_one_item_stop_after_the_per_item_cap() {
    let harness = Harness::start(Config::default()).await;
    let room = RoomId::new("sess-1");
    let item = ItemId::generate();

    let mut voter = harness.client("voter").await;
    voter
        .send(&InboundMessage::JoinRetro(JoinRetroPayload { retro_id: room.clone() }))
        .await
        .unwrap();

    let mut observer = harness.client("observer").await;
    observer
        .send(&InboundMessage::JoinRetro(JoinRetroPayload { retro_id: room.clone() }))
        .await
        .unwrap();

    // Drain both clients' own join chatter before the votes start.
    let _ = collect_for(&mut voter, Duration::from_millis(150)).await;
    let _ = collect_for(&mut observer, Duration::from_millis(150)).await;

    for _ in 0..6u32 {
        voter
            .send(&InboundMessage::VoteAdd(VoteAddPayload { item_id: item }))
            .await
            .unwrap();
    }

    let voter_events = collect_for(&mut voter, Duration::from_millis(400)).await;
    let error_codes: Vec<&str> = voter_events
        .iter()
        .filter_map(|event| match event {
            OutboundEvent::Error(payload) => Some(payload.code.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        error_codes,
        vec!["item_vote_limit_reached", "item_vote_limit_reached", "item_vote_limit_reached"],
        "only the first three of six vote_add calls on one item may succeed"
    );

    let observer_events = collect_for(&mut observer, Duration::from_millis(100)).await;
    let vote_counts: Vec<u32> = observer_events
        .iter()
        .filter_map(|event| match event {
            OutboundEvent::VoteUpdated(payload) if payload.item_id == item => {
                assert_eq!(payload.action, VoteAction::Add);
                Some(payload.user_vote_count)
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        vote_counts,
        vec![1, 2, 3],
        "the room should see exactly the three accepted votes, in order"
    );

    harness.stop().await;
}
