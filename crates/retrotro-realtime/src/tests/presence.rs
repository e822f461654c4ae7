//! A reconnect inside the grace window must never look like a departure to
//! the rest of the room — whether it lands back on the same pod or a
//! different one.

use std::sync::Arc;
use std::time::Duration;

use retrotro_wire::inbound::JoinRetroPayload;
use retrotro_wire::outbound::OutboundEvent;
use retrotro_wire::{InboundMessage, RoomId};

use crate::bus::transport::in_process::InProcessTransport;
use crate::repository::InMemoryRepository;
use crate::tests::{collect_for, fast_grace_config, Harness};

async fn join(client: &mut crate::testutil::TestClient, room: &RoomId) {
    client
        .send(&InboundMessage::JoinRetro(JoinRetroPayload { retro_id: room.clone() }))
        .await
        .unwrap();
}

#[tokio::test]
async fn reconnecting_to_the_same_pod_within_grace_reports_no_departure() {
    let harness = Harness::start(fast_grace_config()).await;
    let room = RoomId::new("sess-1");

    let mut observer = harness.client("observer").await;
    join(&mut observer, &room).await;

    let mut reloading = harness.client("reloading-user").await;
    join(&mut reloading, &room).await;

    // Drain the join chatter so it isn't mistaken for what follows.
    let _ = collect_for(&mut observer, Duration::from_millis(150)).await;

    // A page reload: the socket drops with no explicit leave_retro.
    reloading.close().await;
    drop(reloading);

    let mut reconnected = harness.client("reloading-user").await;
    join(&mut reconnected, &room).await;

    // The grace period is 300ms; watch comfortably past it.
    let events = collect_for(&mut observer, Duration::from_millis(600)).await;
    assert!(
        !events.iter().any(|event| matches!(event, OutboundEvent::ParticipantLeft(_))),
        "a reconnect inside the grace window must not be reported as a departure"
    );

    harness.stop().await;
}

#[tokio::test]
async fn migrating_to_a_different_pod_within_grace_cancels_the_origin_disconnect() {
    let transport = InProcessTransport::shared();
    let repository: Arc<dyn crate::repository::Repository> = Arc::new(InMemoryRepository::default());
    let config = fast_grace_config();

    let pod_a = Harness::start_pod(Arc::new(transport.clone()), Arc::clone(&repository), config.clone()).await;
    let pod_b = Harness::start_pod(Arc::new(transport.clone()), Arc::clone(&repository), config.clone()).await;

    let room = RoomId::new("sess-1");

    let mut observer = pod_a.client("observer").await;
    join(&mut observer, &room).await;

    let mut migrating = pod_a.client("migrating-user").await;
    join(&mut migrating, &room).await;

    let _ = collect_for(&mut observer, Duration::from_millis(150)).await;

    // Drops pod A's connection without an explicit leave_retro...
    migrating.close().await;
    drop(migrating);

    // ...and lands on pod B instead, well inside pod A's grace window. The
    // presence join pod B publishes over the shared bus must cancel pod A's
    // pending disconnect before it ever fires.
    let mut on_pod_b = pod_b.client("migrating-user").await;
    join(&mut on_pod_b, &room).await;

    let events = collect_for(&mut observer, Duration::from_millis(600)).await;
    assert!(
        !events.iter().any(|event| matches!(event, OutboundEvent::ParticipantLeft(_))),
        "the origin pod's grace must be canceled by the remote join, not left to fire"
    );

    pod_a.stop().await;
    pod_b.stop().await;
}
