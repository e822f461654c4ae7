//! C2: the process-local connection/room registry.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use retrotro_wire::{ConnectionId, RoomId, UserId};

/// Notification sent when a `(room, user)` grace period expires with the
/// user still absent. Consumed by whatever owns both the hub and the bus
/// (see [`crate::bus::Bus`]) to perform the full broadcast path — the hub
/// itself only ever does local bookkeeping.
#[derive(Debug, Clone)]
pub struct GraceExpired {
    pub room: RoomId,
    pub user: UserId,
}

struct ConnectionEntry {
    user_id: UserId,
    user_name: String,
    room: Option<RoomId>,
    outbound: mpsc::Sender<Arc<str>>,
}

struct PendingDisconnect {
    token: u64,
    canceled: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct HubInner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
    pending: HashMap<(RoomId, UserId), PendingDisconnect>,
}

impl HubInner {
    fn room_connections(&self, room: &RoomId) -> impl Iterator<Item = &ConnectionEntry> + '_ {
        self.rooms
            .get(room)
            .into_iter()
            .flatten()
            .filter_map(|id| self.connections.get(id))
    }

    fn room_has_user(&self, room: &RoomId, user: UserId) -> bool {
        self.room_connections(room).any(|entry| entry.user_id == user)
    }

    /// Cancels a pending disconnect for `(room, user)`, if one exists.
    /// Sets the canceled flag and aborts the grace task under the same
    /// lock a concurrent `fire` would need, so the two can never race.
    fn cancel_pending(&mut self, room: &RoomId, user: UserId) {
        if let Some(pending) = self.pending.remove(&(room.clone(), user)) {
            pending.canceled.store(true, Ordering::SeqCst);
            pending.handle.abort();
        }
    }
}

/// The process-local registry of connections and rooms: local fan-out and
/// reconnection grace timers. Does not know about other pods — that is the
/// bus's job (see [`crate::bus::Bus`]).
pub struct Hub {
    inner: Mutex<HubInner>,
    grace: Duration,
    grace_tx: mpsc::UnboundedSender<GraceExpired>,
    pending_token: AtomicU64,
}

impl Hub {
    /// Creates a hub with the given grace period, returning it alongside
    /// the receiver for grace-expiry notifications the bus must consume.
    pub fn with_grace(grace: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<GraceExpired>) {
        let (grace_tx, grace_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Self {
            inner: Mutex::new(HubInner::default()),
            grace,
            grace_tx,
            pending_token: AtomicU64::new(0),
        });
        (hub, grace_rx)
    }

    /// Creates a hub with the default 10-second grace period and silently
    /// discards its grace-expiry channel. Intended for tests that only
    /// exercise membership, not presence suppression end-to-end.
    pub fn new() -> Arc<Self> {
        Self::with_grace(Duration::from_secs(10)).0
    }

    /// Registers a freshly accepted connection with no room membership yet.
    pub fn register(
        &self,
        id: ConnectionId,
        user_id: UserId,
        user_name: String,
        outbound: mpsc::Sender<Arc<str>>,
    ) {
        let mut inner = self.inner.lock();
        inner.connections.insert(
            id,
            ConnectionEntry {
                user_id,
                user_name,
                room: None,
                outbound,
            },
        );
    }

    /// Removes `id`. If it was the user's last connection in its room,
    /// schedules a [`PendingDisconnect`] at `now + grace`.
    pub fn unregister(self: &Arc<Self>, id: ConnectionId) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.connections.remove(&id) else {
            return;
        };
        let Some(room) = entry.room.clone() else {
            return;
        };
        if let Some(members) = inner.rooms.get_mut(&room) {
            members.remove(&id);
            if members.is_empty() {
                inner.rooms.remove(&room);
            }
        }
        if inner.room_has_user(&room, entry.user_id) {
            return;
        }
        self.schedule_pending_disconnect(&mut inner, room, entry.user_id);
    }

    fn schedule_pending_disconnect(
        self: &Arc<Self>,
        inner: &mut HubInner,
        room: RoomId,
        user: UserId,
    ) {
        // A fresh schedule always replaces (and cancels) any prior one for
        // this key, keeping the "at most one pending entry" invariant.
        inner.cancel_pending(&room, user);

        let token = self.pending_token.fetch_add(1, Ordering::SeqCst);
        let canceled = Arc::new(AtomicBool::new(false));
        let hub = Arc::clone(self);
        let fire_room = room.clone();
        let task_canceled = Arc::clone(&canceled);
        let grace = self.grace;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if task_canceled.load(Ordering::SeqCst) {
                return;
            }
            hub.fire_pending_disconnect(fire_room, user, token);
        });

        inner.pending.insert(
            (room, user),
            PendingDisconnect {
                token,
                canceled,
                handle,
            },
        );
    }

    fn fire_pending_disconnect(&self, room: RoomId, user: UserId, token: u64) {
        let mut inner = self.inner.lock();
        match inner.pending.get(&(room.clone(), user)) {
            Some(pending) if pending.token == token => {
                inner.pending.remove(&(room.clone(), user));
            }
            // Already canceled, or superseded by a newer schedule for the
            // same key — either way, this firing is a no-op.
            _ => return,
        }
        if inner.room_has_user(&room, user) {
            return;
        }
        debug!(%room, %user, "pending disconnect grace expired, notifying bus");
        let _ = self.grace_tx.send(GraceExpired { room, user });
    }

    /// Moves `id` into `room`, leaving any prior room. Cancels a matching
    /// pending disconnect on `room` (reconnection suppresses the grace).
    pub fn join_room(&self, id: ConnectionId, room: RoomId) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.connections.get(&id) else {
            return;
        };
        let user_id = entry.user_id;
        if let Some(prior) = entry.room.clone() {
            if let Some(members) = inner.rooms.get_mut(&prior) {
                members.remove(&id);
            }
        }
        inner.rooms.entry(room.clone()).or_default().insert(id);
        if let Some(entry) = inner.connections.get_mut(&id) {
            entry.room = Some(room.clone());
        }
        inner.cancel_pending(&room, user_id);
    }

    /// Removes `id` from its current room, if any. Explicit departures
    /// never schedule a grace period.
    pub fn leave_room(&self, id: ConnectionId) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.connections.get_mut(&id) else {
            return;
        };
        if let Some(room) = entry.room.take() {
            if let Some(members) = inner.rooms.get_mut(&room) {
                members.remove(&id);
            }
        }
    }

    /// Enqueues an already-encoded frame to every connection in `room`,
    /// skipping `exclude` if given. A room with no members is a no-op with
    /// a warning, not an error. Connections whose outbound queue is full
    /// are evicted.
    pub fn broadcast_raw(self: &Arc<Self>, room: &RoomId, frame: Arc<str>, exclude: Option<ConnectionId>) {
        let mut stalled = Vec::new();
        {
            let inner = self.inner.lock();
            let Some(members) = inner.rooms.get(room) else {
                warn!(%room, "broadcast to unknown room");
                return;
            };
            for &id in members {
                if Some(id) == exclude {
                    continue;
                }
                let Some(entry) = inner.connections.get(&id) else {
                    continue;
                };
                if entry.outbound.try_send(Arc::clone(&frame)).is_err() {
                    stalled.push(id);
                }
            }
        }
        for id in stalled {
            warn!(connection = %id, "outbound queue full, evicting connection");
            self.unregister(id);
        }
    }

    /// Enqueues an already-encoded frame to a single connection, for replies
    /// that are not meant to be seen by the rest of the room (e.g. the
    /// `retro_state` snapshot sent to a joining connection). Silently a
    /// no-op if `id` is no longer registered. A full queue evicts the
    /// connection, same as [`Hub::broadcast_raw`].
    pub fn send_to(self: &Arc<Self>, id: ConnectionId, frame: Arc<str>) {
        let stalled = {
            let inner = self.inner.lock();
            match inner.connections.get(&id) {
                Some(entry) => entry.outbound.try_send(frame).is_err(),
                None => return,
            }
        };
        if stalled {
            warn!(connection = %id, "outbound queue full, evicting connection");
            self.unregister(id);
        }
    }

    /// Returns a deduplicated-by-user snapshot of `room`'s local members.
    pub fn room_clients(&self, room: &RoomId) -> Vec<(UserId, String)> {
        let inner = self.inner.lock();
        let mut seen = HashSet::new();
        inner
            .room_connections(room)
            .filter(|entry| seen.insert(entry.user_id))
            .map(|entry| (entry.user_id, entry.user_name.clone()))
            .collect()
    }

    /// Local membership probe.
    pub fn is_user_in_room(&self, room: &RoomId, user: UserId) -> bool {
        self.inner.lock().room_has_user(room, user)
    }

    /// Explicit cancel, used by the bus when a remote join arrives during
    /// the grace window.
    pub fn cancel_pending_disconnect(&self, room: &RoomId, user: UserId) {
        self.inner.lock().cancel_pending(room, user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn sender() -> (mpsc::Sender<Arc<str>>, mpsc::Receiver<Arc<str>>) {
        mpsc::channel(8)
    }

    #[tokio::test]
    async fn join_room_cancels_a_pending_disconnect() {
        let (hub, mut grace_rx) = Hub::with_grace(Duration::from_millis(20));
        let room = RoomId::new("sess-1");
        let user = UserId::generate();
        let (tx_a, _rx_a) = sender();
        let a = ConnectionId::generate();
        hub.register(a, user, "alice".into(), tx_a);
        hub.join_room(a, room.clone());
        hub.unregister(a);

        let (tx_b, _rx_b) = sender();
        let b = ConnectionId::generate();
        hub.register(b, user, "alice".into(), tx_b);
        hub.join_room(b, room.clone());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(grace_rx.try_recv().is_err());
        assert!(hub.is_user_in_room(&room, user));
    }

    #[tokio::test]
    #[traced_test]
    async fn grace_fires_when_the_user_never_returns() {
        let (hub, mut grace_rx) = Hub::with_grace(Duration::from_millis(10));
        let room = RoomId::new("sess-1");
        let user = UserId::generate();
        let (tx, _rx) = sender();
        let conn = ConnectionId::generate();
        hub.register(conn, user, "alice".into(), tx);
        hub.join_room(conn, room.clone());
        hub.unregister(conn);

        let expired = tokio::time::timeout(Duration::from_millis(200), grace_rx.recv())
            .await
            .expect("grace notification should arrive")
            .expect("channel should stay open");
        assert_eq!(expired.room, room);
        assert_eq!(expired.user, user);
        assert!(logs_contain("pending disconnect grace expired"));
    }

    #[tokio::test]
    async fn room_clients_deduplicates_by_user() {
        let hub = Hub::new();
        let room = RoomId::new("sess-1");
        let user = UserId::generate();
        let (tx1, _rx1) = sender();
        let (tx2, _rx2) = sender();
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        hub.register(a, user, "alice".into(), tx1);
        hub.register(b, user, "alice-tab-2".into(), tx2);
        hub.join_room(a, room.clone());
        hub.join_room(b, room.clone());
        assert_eq!(hub.room_clients(&room).len(), 1);
    }

    #[tokio::test]
    async fn broadcast_evicts_a_connection_with_a_full_queue() {
        let hub = Hub::new();
        let room = RoomId::new("sess-1");
        let user = UserId::generate();
        let (tx, _rx) = mpsc::channel::<Arc<str>>(1);
        let conn = ConnectionId::generate();
        hub.register(conn, user, "alice".into(), tx);
        hub.join_room(conn, room.clone());

        let frame: Arc<str> = Arc::from("one");
        hub.broadcast_raw(&room, Arc::clone(&frame), None);
        hub.broadcast_raw(&room, Arc::clone(&frame), None);

        assert!(!hub.is_user_in_room(&room, user));
    }
}
