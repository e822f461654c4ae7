//! In-process transport: a [`tokio::sync::broadcast`] channel standing in
//! for a real message bus. Used as the default feature and in tests, where
//! several simulated pods share one process and a single-pod deployment has
//! no need to stand up a real bus.

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use retrotro_wire::Envelope;

use crate::bus::BusTransport;
use crate::error::EngineError;

const CHANNEL_CAPACITY: usize = 1024;

/// A transport backed by one broadcast channel shared by every clone.
/// Envelopes still carry the publishing pod's id, so multiple `Bus`
/// instances built from clones of the same `InProcessTransport` behave like
/// distinct pods talking over a real bus (echo suppression included).
#[derive(Clone)]
pub struct InProcessTransport {
    sender: broadcast::Sender<Envelope>,
}

impl InProcessTransport {
    /// Creates a fresh, independent in-process bus.
    pub fn shared() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }
}

#[async_trait]
impl BusTransport for InProcessTransport {
    async fn publish(&self, envelope: Envelope) -> Result<(), EngineError> {
        // No subscribers is not an error: a single-pod deployment publishes
        // to nobody, which is expected.
        let _ = self.sender.send(envelope);
        Ok(())
    }

    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>, EngineError> {
        let mut broadcast_rx = self.sender.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = broadcast_rx.recv() => {
                        match received {
                            Ok(envelope) => {
                                if tx.send(envelope).is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "in-process transport subscriber lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrotro_wire::envelope::PresenceAction;
    use retrotro_wire::{PodId, RoomId, UserId};

    #[tokio::test]
    async fn published_envelopes_reach_a_subscriber() {
        let transport = InProcessTransport::shared();
        let mut rx = transport.subscribe(CancellationToken::new()).await.unwrap();

        let envelope = Envelope::Presence {
            pod_id: PodId::generate(),
            room_id: RoomId::new("sess-1"),
            user_id: UserId::generate(),
            user_name: None,
            action: PresenceAction::Leave,
        };
        transport.publish(envelope.clone()).await.unwrap();

        let received = rx.recv().await.expect("subscriber should receive the envelope");
        assert_eq!(received.room_id(), envelope.room_id());
    }

    #[tokio::test]
    async fn cancellation_stops_delivery() {
        let transport = InProcessTransport::shared();
        let cancel = CancellationToken::new();
        let mut rx = transport.subscribe(cancel.clone()).await.unwrap();
        cancel.cancel();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let envelope = Envelope::Presence {
            pod_id: PodId::generate(),
            room_id: RoomId::new("sess-1"),
            user_id: UserId::generate(),
            user_name: None,
            action: PresenceAction::Join,
        };
        transport.publish(envelope).await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
