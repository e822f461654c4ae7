//! C3: the cross-pod relay.

pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use retrotro_wire::envelope::PresenceAction;
use retrotro_wire::outbound::{
    MemberView, OutboundEvent, ParticipantJoinedPayload, ParticipantLeftPayload,
    TeamMembersUpdatedPayload,
};
use retrotro_wire::{Envelope, PodId, RoomId, UserId};

use crate::error::EngineError;
use crate::hub::{GraceExpired, Hub};

/// A user believed connected on another pod.
#[derive(Debug, Clone)]
struct RemoteUser {
    user_name: String,
    origin_pod: PodId,
}

/// A pluggable relay that makes the hub behave as if every pod shared one
/// memory. Transports only need to move [`Envelope`]s in and out; the bus
/// itself owns echo suppression and remote-presence bookkeeping.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Publishes one envelope. At-least-once on durable transports,
    /// best-effort on the datagram fabric.
    async fn publish(&self, envelope: Envelope) -> Result<(), EngineError>;

    /// Starts whatever background work this transport needs (a poll loop,
    /// a NATS subscription, a LISTEN connection) and returns a channel of
    /// received envelopes. The task(s) must stop when `cancel` fires.
    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>, EngineError>;
}

/// The cross-pod relay: local hub fan-out plus publish/subscribe over a
/// [`BusTransport`].
pub struct Bus {
    pod_id: PodId,
    hub: Arc<Hub>,
    transport: Arc<dyn BusTransport>,
    remote_users: Arc<Mutex<HashMap<(RoomId, UserId), RemoteUser>>>,
    cancel: CancellationToken,
}

impl Bus {
    pub fn new(pod_id: PodId, hub: Arc<Hub>, transport: Arc<dyn BusTransport>) -> Self {
        Self {
            pod_id,
            hub,
            transport,
            remote_users: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
        }
    }

    /// Starts the subscription task and the grace-expiry consumer task.
    /// Returns once both are running; they keep running until [`Bus::stop`]
    /// is called.
    pub async fn start(
        &self,
        grace_rx: mpsc::UnboundedReceiver<GraceExpired>,
    ) -> Result<(), EngineError> {
        let mut envelopes = self.transport.subscribe(self.cancel.clone()).await?;

        let hub = Arc::clone(&self.hub);
        let remote_users = Arc::clone(&self.remote_users);
        let pod_id = self.pod_id;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    envelope = envelopes.recv() => {
                        let Some(envelope) = envelope else { break };
                        handle_inbound_envelope(&hub, &remote_users, pod_id, envelope);
                    }
                }
            }
        });

        let transport = Arc::clone(&self.transport);
        let pod_id = self.pod_id;
        let hub = Arc::clone(&self.hub);
        let remote_users = Arc::clone(&self.remote_users);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut grace_rx = grace_rx;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    expired = grace_rx.recv() => {
                        let Some(expired) = expired else { break };
                        remote_users.lock().remove(&(expired.room.clone(), expired.user));

                        // Grace firing broadcasts participant_left plus the
                        // derived team_members_updated, same as any other handler.
                        hub.broadcast_raw(
                            &expired.room,
                            Arc::from(
                                OutboundEvent::ParticipantLeft(ParticipantLeftPayload {
                                    user_id: expired.user,
                                })
                                .to_frame(),
                            ),
                            None,
                        );
                        let members = room_clients_snapshot(&hub, &remote_users, &expired.room);
                        hub.broadcast_raw(
                            &expired.room,
                            Arc::from(
                                OutboundEvent::TeamMembersUpdated(TeamMembersUpdatedPayload { members })
                                    .to_frame(),
                            ),
                            None,
                        );

                        let envelope = Envelope::Presence {
                            pod_id,
                            room_id: expired.room,
                            user_id: expired.user,
                            user_name: None,
                            action: PresenceAction::Leave,
                        };
                        if let Err(err) = transport.publish(envelope).await {
                            warn!(%err, "failed to publish grace-expiry presence leave");
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Cancels the subscription context; subscriber tasks drain and return.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Local fan-out plus publish to the room subject.
    pub async fn broadcast_to_room(&self, room: &RoomId, event: OutboundEvent) -> Result<(), EngineError> {
        let frame: Arc<str> = Arc::from(event.to_frame());
        self.hub.broadcast_raw(room, frame, None);
        self.publish_to_remote_pods(room, event).await
    }

    /// Local fan-out excluding `exclude`, publish without exclusion (remote
    /// pods have no knowledge of the excluded local connection).
    pub async fn broadcast_to_room_except(
        &self,
        room: &RoomId,
        event: OutboundEvent,
        exclude: retrotro_wire::ConnectionId,
    ) -> Result<(), EngineError> {
        let frame: Arc<str> = Arc::from(event.to_frame());
        self.hub.broadcast_raw(room, frame, Some(exclude));
        self.publish_to_remote_pods(room, event).await
    }

    /// Publishes only, for callers that already did the local broadcast.
    pub async fn publish_to_remote_pods(
        &self,
        room: &RoomId,
        event: OutboundEvent,
    ) -> Result<(), EngineError> {
        let envelope = Envelope::Room {
            pod_id: self.pod_id,
            room_id: room.clone(),
            inner_message: event,
        };
        self.transport.publish(envelope).await
    }

    /// Removes `(room, user)` from the remote-user map (a reconnection may
    /// have landed there) and publishes a join envelope.
    pub async fn publish_presence_join(
        &self,
        room: &RoomId,
        user: UserId,
        user_name: &str,
    ) -> Result<(), EngineError> {
        self.remote_users.lock().remove(&(room.clone(), user));
        let envelope = Envelope::Presence {
            pod_id: self.pod_id,
            room_id: room.clone(),
            user_id: user,
            user_name: Some(user_name.to_string()),
            action: PresenceAction::Join,
        };
        self.transport.publish(envelope).await
    }

    pub async fn publish_presence_leave(
        &self,
        room: &RoomId,
        user: UserId,
    ) -> Result<(), EngineError> {
        let envelope = Envelope::Presence {
            pod_id: self.pod_id,
            room_id: room.clone(),
            user_id: user,
            user_name: None,
            action: PresenceAction::Leave,
        };
        self.transport.publish(envelope).await
    }

    /// Union of local hub members and remote mirror entries, deduplicated
    /// by user id with locals winning on collision.
    pub fn room_clients(&self, room: &RoomId) -> Vec<MemberView> {
        room_clients_snapshot(&self.hub, &self.remote_users, room)
    }

    /// Local-or-remote membership probe.
    pub fn is_user_in_room(&self, room: &RoomId, user: UserId) -> bool {
        self.hub.is_user_in_room(room, user)
            || self.remote_users.lock().contains_key(&(room.clone(), user))
    }
}

/// Union of local hub members and remote mirror entries for `room`,
/// deduplicated by user id with locals winning on collision.
fn room_clients_snapshot(
    hub: &Arc<Hub>,
    remote_users: &Arc<Mutex<HashMap<(RoomId, UserId), RemoteUser>>>,
    room: &RoomId,
) -> Vec<MemberView> {
    let mut members: HashMap<UserId, String> = hub.room_clients(room).into_iter().collect();
    let remote = remote_users.lock();
    for (&(ref remote_room, user_id), remote_user) in remote.iter() {
        if remote_room == room {
            members
                .entry(user_id)
                .or_insert_with(|| remote_user.user_name.clone());
        }
    }
    members
        .into_iter()
        .map(|(user_id, user_name)| MemberView { user_id, user_name })
        .collect()
}

fn handle_inbound_envelope(
    hub: &Arc<Hub>,
    remote_users: &Arc<Mutex<HashMap<(RoomId, UserId), RemoteUser>>>,
    self_pod: PodId,
    envelope: Envelope,
) {
    if envelope.pod_id() == self_pod {
        debug!(pod_id = %self_pod, "suppressing echo of our own envelope");
        return;
    }
    match envelope {
        Envelope::Room {
            room_id,
            inner_message,
            ..
        } => {
            let frame: Arc<str> = Arc::from(inner_message.to_frame());
            hub.broadcast_raw(&room_id, frame, None);
        }
        Envelope::Presence {
            pod_id,
            room_id,
            user_id,
            user_name,
            action,
        } => match action {
            PresenceAction::Join => {
                hub.cancel_pending_disconnect(&room_id, user_id);
                remote_users.lock().insert(
                    (room_id.clone(), user_id),
                    RemoteUser {
                        user_name: user_name.clone().unwrap_or_default(),
                        origin_pod: pod_id,
                    },
                );
                // Mirrors a remote join into this pod's local view of the
                // room the same way a local join would.
                hub.broadcast_raw(
                    &room_id,
                    Arc::from(
                        OutboundEvent::ParticipantJoined(ParticipantJoinedPayload {
                            user_id,
                            user_name: user_name.unwrap_or_default(),
                        })
                        .to_frame(),
                    ),
                    None,
                );
                let members = room_clients_snapshot(hub, remote_users, &room_id);
                hub.broadcast_raw(
                    &room_id,
                    Arc::from(
                        OutboundEvent::TeamMembersUpdated(TeamMembersUpdatedPayload { members })
                            .to_frame(),
                    ),
                    None,
                );
            }
            PresenceAction::Leave => {
                remote_users.lock().remove(&(room_id, user_id));
            }
        },
    }
    debug!("processed remote bus envelope");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::transport::in_process::InProcessTransport;
    use retrotro_wire::outbound::RetroEndedPayload;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn echo_is_suppressed() {
        let hub = Hub::new();
        let shared = InProcessTransport::shared();
        let transport: Arc<dyn BusTransport> = Arc::new(shared.clone());
        let pod_id = PodId::generate();
        let bus = Bus::new(pod_id, Arc::clone(&hub), transport);
        let (_grace_tx, grace_rx) = mpsc::unbounded_channel();
        bus.start(grace_rx).await.unwrap();

        let room = RoomId::new("sess-1");
        // Publish an envelope stamped with our own pod id directly through
        // the shared transport, bypassing `Bus::broadcast_to_room` so we
        // can observe that the subscriber drops it.
        shared
            .publish(Envelope::Room {
                pod_id,
                room_id: room.clone(),
                inner_message: OutboundEvent::RetroEnded(RetroEndedPayload::default()),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!hub.is_user_in_room(&room, UserId::generate()));
        assert!(logs_contain("suppressing echo of our own envelope"));
        bus.stop();
    }

    #[tokio::test]
    async fn remote_join_cancels_a_local_pending_disconnect() {
        let (hub, grace_rx) = Hub::with_grace(Duration::from_millis(30));
        let shared = InProcessTransport::shared();
        let transport: Arc<dyn BusTransport> = Arc::new(shared.clone());
        let local_pod = PodId::generate();
        let remote_pod = PodId::generate();
        let bus = Bus::new(local_pod, Arc::clone(&hub), transport);
        bus.start(grace_rx).await.unwrap();

        let room = RoomId::new("sess-1");
        let user = UserId::generate();
        let (tx, _rx) = mpsc::channel(8);
        let conn = retrotro_wire::ConnectionId::generate();
        hub.register(conn, user, "alice".into(), tx);
        hub.join_room(conn, room.clone());
        hub.unregister(conn);

        shared
            .publish(Envelope::Presence {
                pod_id: remote_pod,
                room_id: room.clone(),
                user_id: user,
                user_name: Some("alice".into()),
                action: PresenceAction::Join,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(bus.is_user_in_room(&room, user));
        bus.stop();
    }
}
