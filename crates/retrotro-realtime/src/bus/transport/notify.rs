//! Notify transport: Postgres `LISTEN`/`NOTIFY` on a single channel, JSON
//! payloads. For deployments that already run Postgres and want push
//! delivery without standing up a separate bus.

use async_trait::async_trait;
use futures_util::future;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Config, NoTls};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use retrotro_wire::Envelope;

use crate::bus::BusTransport;
use crate::error::EngineError;

const CHANNEL: &str = "retrotro_bus";

fn transport_error(err: tokio_postgres::Error) -> EngineError {
    EngineError::Transport(err.to_string())
}

/// Transport backed by Postgres `LISTEN`/`NOTIFY`. Opens a fresh connection
/// per publish (NOTIFY does not need a long-lived session) and one
/// dedicated listening connection per [`subscribe`](Self::subscribe) call.
pub struct NotifyTransport {
    config: Config,
}

impl NotifyTransport {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BusTransport for NotifyTransport {
    async fn publish(&self, envelope: Envelope) -> Result<(), EngineError> {
        let (client, connection) = self.config.connect(NoTls).await.map_err(transport_error)?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(%err, "notify transport publish connection closed with error");
            }
        });
        let payload = serde_json::to_string(&envelope)?;
        client
            .execute("SELECT pg_notify($1, $2)", &[&CHANNEL, &payload])
            .await
            .map_err(transport_error)?;
        Ok(())
    }

    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>, EngineError> {
        let (client, mut connection) = self.config.connect(NoTls).await.map_err(transport_error)?;
        client
            .batch_execute(&format!("LISTEN {CHANNEL}"))
            .await
            .map_err(transport_error)?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = future::poll_fn(|cx| connection.poll_message(cx)) => {
                        match message {
                            Some(Ok(AsyncMessage::Notification(notification))) => {
                                match serde_json::from_str::<Envelope>(notification.payload()) {
                                    Ok(envelope) => {
                                        if tx.send(envelope).is_err() {
                                            break;
                                        }
                                    }
                                    Err(err) => warn!(%err, "failed to decode NOTIFY payload"),
                                }
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                warn!(%err, "notify listen connection error");
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}
