//! Datagram transport: NATS core pub/sub.
//!
//! Subjects are named per room rather than per pod: `retrotro.room.<roomId>`
//! for room broadcasts, `retrotro.presence.join.<roomId>` and
//! `retrotro.presence.leave.<roomId>` for presence. This resolves the
//! protocol's open question in favor of per-room addressing, which lets a
//! deployment later shard NATS subscriptions by room without a wire change.

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use retrotro_wire::envelope::PresenceAction;
use retrotro_wire::{Envelope, RoomId};

use crate::bus::BusTransport;
use crate::error::EngineError;

const WILDCARD_SUBJECT: &str = "retrotro.>";

fn room_subject(room: &RoomId) -> String {
    format!("retrotro.room.{}", room.as_str())
}

fn presence_subject(action: PresenceAction, room: &RoomId) -> String {
    let action = match action {
        PresenceAction::Join => "join",
        PresenceAction::Leave => "leave",
    };
    format!("retrotro.presence.{action}.{}", room.as_str())
}

fn subject_for(envelope: &Envelope) -> String {
    match envelope {
        Envelope::Room { room_id, .. } => room_subject(room_id),
        Envelope::Presence { room_id, action, .. } => presence_subject(*action, room_id),
    }
}

fn transport_error(err: impl std::error::Error) -> EngineError {
    EngineError::Transport(err.to_string())
}

/// Transport backed by an already-connected NATS client.
pub struct DatagramTransport {
    client: async_nats::Client,
}

impl DatagramTransport {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BusTransport for DatagramTransport {
    async fn publish(&self, envelope: Envelope) -> Result<(), EngineError> {
        let subject = subject_for(&envelope);
        let payload = serde_json::to_vec(&envelope)?;
        self.client
            .publish(subject, payload.into())
            .await
            .map_err(transport_error)?;
        Ok(())
    }

    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>, EngineError> {
        let mut subscriber = self
            .client
            .subscribe(WILDCARD_SUBJECT)
            .await
            .map_err(transport_error)?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = subscriber.next() => {
                        let Some(message) = message else { break };
                        match serde_json::from_slice::<Envelope>(&message.payload) {
                            Ok(envelope) => {
                                if tx.send(envelope).is_err() {
                                    break;
                                }
                            }
                            Err(err) => warn!(%err, "failed to decode NATS envelope"),
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}
