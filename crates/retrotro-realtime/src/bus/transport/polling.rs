//! Polling transport: a `bus_messages` table polled on an interval. For
//! deployments with a shared Postgres database but no dedicated message bus,
//! at the cost of at-least-once delivery instead of a push guarantee.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use retrotro_wire::Envelope;

use crate::bus::BusTransport;
use crate::error::EngineError;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

fn transport_error(err: sqlx::Error) -> EngineError {
    EngineError::Transport(err.to_string())
}

/// Transport backed by a polled Postgres table.
pub struct PollingTransport {
    pool: PgPool,
}

impl PollingTransport {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates `bus_messages` if it does not already exist. Callers
    /// typically run this once at startup alongside their own migrations.
    pub async fn ensure_schema(&self) -> Result<(), EngineError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS bus_messages (\
                id BIGSERIAL PRIMARY KEY, \
                payload JSONB NOT NULL, \
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()\
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(transport_error)?;
        Ok(())
    }
}

#[async_trait]
impl BusTransport for PollingTransport {
    async fn publish(&self, envelope: Envelope) -> Result<(), EngineError> {
        let payload = serde_json::to_value(&envelope)?;
        sqlx::query("INSERT INTO bus_messages (payload) VALUES ($1)")
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(transport_error)?;
        Ok(())
    }

    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>, EngineError> {
        let pool = self.pool.clone();
        let mut watermark: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM bus_messages")
            .fetch_one(&pool)
            .await
            .map_err(transport_error)?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let rows = sqlx::query("SELECT id, payload FROM bus_messages WHERE id > $1 ORDER BY id")
                            .bind(watermark)
                            .fetch_all(&pool)
                            .await;
                        let rows = match rows {
                            Ok(rows) => rows,
                            Err(err) => {
                                warn!(%err, "polling transport query failed");
                                continue;
                            }
                        };
                        for row in rows {
                            let id: i64 = row.get("id");
                            watermark = watermark.max(id);
                            let payload: serde_json::Value = row.get("payload");
                            match serde_json::from_value::<Envelope>(payload) {
                                Ok(envelope) => {
                                    if tx.send(envelope).is_err() {
                                        return;
                                    }
                                }
                                Err(err) => warn!(%err, "failed to decode polled bus message"),
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}
