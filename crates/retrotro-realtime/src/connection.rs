//! C1: the per-connection websocket endpoint.
//!
//! One reader task and one writer task per connection, splitting the
//! websocket stream into its two halves the way a duplex IPC connection
//! splits into a send half and a receive half. The reader parses frames and
//! drives the router; the writer drains the hub-assigned outbound queue,
//! coalescing a burst of already-queued frames into one websocket message.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use retrotro_wire::outbound::ErrorPayload;
use retrotro_wire::{ConnectionId, InboundMessage, OutboundEvent};

use crate::config::Config;
use crate::error::EngineError;
use crate::hub::Hub;
use crate::policy::Authenticator;
use crate::router::{ConnectionContext, Router};

/// Extracts the bearer token from the `token` query parameter of the
/// handshake request URI.
fn token_from_request(request: &Request) -> Option<String> {
    let query = request.uri().query()?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "token").then(|| value.to_string())
    })
}

/// Accepts one already-connected TCP stream as a websocket connection,
/// authenticates it, and drives it to completion. Returns once the
/// connection has fully closed (from either end) and the hub has been
/// notified.
pub async fn accept_and_run(
    raw: TcpStream,
    config: Arc<Config>,
    hub: Arc<Hub>,
    router: Arc<Router>,
    authenticator: Arc<dyn Authenticator>,
) -> Result<(), EngineError> {
    let token_slot: parking_lot::Mutex<Option<String>> = parking_lot::Mutex::new(None);
    let callback = |request: &Request, response: Response| {
        *token_slot.lock() = token_from_request(request);
        Ok(response)
    };

    let stream = tokio_tungstenite::accept_hdr_async(raw, callback)
        .await
        .map_err(|err| EngineError::Auth(format!("websocket handshake failed: {err}")))?;

    let token = token_slot
        .into_inner()
        .ok_or_else(|| EngineError::Auth("missing token query parameter".into()))?;
    let (user_id, user_name) = authenticator.authenticate(&token).await?;

    let connection_id = ConnectionId::generate();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Arc<str>>(config.outbound_queue_capacity);
    hub.register(connection_id, user_id, user_name.clone(), outbound_tx.clone());
    info!(%connection_id, %user_id, "connection established");

    let (mut sink, mut source) = stream.split();
    let mut ctx = ConnectionContext::new(connection_id, user_id, user_name);

    let writer = writer_loop(&mut sink, outbound_rx, Arc::clone(&config));
    let reader = reader_loop(&mut source, &router, &mut ctx, &outbound_tx, &config);

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }

    hub.unregister(connection_id);
    let _ = sink.close().await;
    info!(%connection_id, "connection closed");
    Ok(())
}

/// Drains the outbound queue, coalescing whatever is already buffered at
/// the moment a frame becomes available into a single `\n`-joined message.
/// Every write is bounded by `config.write_deadline()`; a peer whose socket
/// buffer never drains (a stalled or vanished reader on the other end) is
/// treated as closed rather than left to hang the writer forever.
async fn writer_loop<S>(sink: &mut S, mut rx: mpsc::Receiver<Arc<str>>, config: Arc<Config>)
where
    S: futures_util::Sink<Message> + Unpin,
{
    let mut ping_interval = tokio::time::interval(config.pong_deadline() * 9 / 10);
    ping_interval.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let mut batch = String::from(&*frame);
                while let Ok(more) = rx.try_recv() {
                    batch.push('\n');
                    batch.push_str(&more);
                }
                match tokio::time::timeout(config.write_deadline(), sink.send(Message::Text(batch.into()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
            _ = ping_interval.tick() => {
                match tokio::time::timeout(config.write_deadline(), sink.send(Message::Ping(Vec::new().into()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
        }
    }
}

/// Parses and dispatches inbound frames until the stream ends, the
/// connection is closed by the peer, or the peer goes silent for longer
/// than `config.pong_deadline()`. The deadline is renewed on every `pong`
/// received, mirroring the writer's ping cadence: a client that stops
/// responding to pings, with a socket that never itself errors, is evicted
/// rather than left to hang this task forever. Parse failures are logged
/// and dropped, keeping the connection open. A panic inside a handler is
/// caught here, logged, and reported to the caller as an `error` event
/// rather than unwinding across the connection task.
async fn reader_loop<S>(
    source: &mut S,
    router: &Router,
    ctx: &mut ConnectionContext,
    outbound_tx: &mpsc::Sender<Arc<str>>,
    config: &Config,
) where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut deadline = tokio::time::Instant::now() + config.pong_deadline();

    loop {
        let frame = match tokio::time::timeout_at(deadline, source.next()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(_elapsed) => {
                warn!("no pong within the deadline, closing connection");
                break;
            }
        };

        let message = match frame {
            Ok(Message::Text(text)) => text.as_bytes().to_vec(),
            Ok(Message::Binary(bytes)) => bytes.to_vec(),
            Ok(Message::Pong(_)) => {
                deadline = tokio::time::Instant::now() + config.pong_deadline();
                continue;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                warn!(%err, "websocket stream error");
                break;
            }
        };

        let inbound = match InboundMessage::parse(&message) {
            Ok(inbound) => inbound,
            Err(err) => {
                debug!(%err, "dropping malformed frame");
                continue;
            }
        };

        let outcome = AssertUnwindSafe(router.dispatch(ctx, inbound))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(%message, "handler panicked, reporting to caller");
                Err(EngineError::TransientRepository("internal error".into()))
            }
        };

        if let Err(err) = result {
            if err.is_caller_reportable() {
                let event = OutboundEvent::Error(ErrorPayload {
                    code: err.code().to_string(),
                    message: err.to_string(),
                });
                let _ = outbound_tx.try_send(Arc::from(event.to_frame()));
            } else {
                warn!(%err, "closing connection after non-reportable error");
                break;
            }
        }
    }
}
