//! C1: the accept loop binding the engine to a TCP listener.
//!
//! No HTTP framework sits in front of this: clients speak the websocket
//! handshake directly against the bound port. The shutdown handshake is a
//! oneshot-signal-then-join pair, generalized from a single long-lived
//! connection to an accept loop spawning many.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::connection;
use crate::hub::Hub;
use crate::policy::Authenticator;
use crate::router::Router;

/// Builder for the engine's TCP accept loop.
pub struct ServerBuilder {
    addr: SocketAddr,
    config: Config,
}

impl ServerBuilder {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            config: Config::default(),
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Binds the listener and spawns the accept loop. Returns a handle the
    /// caller uses to stop the server; the bound address is reported back
    /// in case `addr` used an ephemeral port (`:0`).
    pub async fn start(
        self,
        hub: Arc<Hub>,
        router: Arc<Router>,
        authenticator: Arc<dyn Authenticator>,
    ) -> std::io::Result<(ServerHandle, SocketAddr)> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        let config = Arc::new(self.config);

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("accept loop shutting down");
                        break;
                    }
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(err) => {
                                warn!(%err, "failed to accept connection");
                                continue;
                            }
                        };
                        debug_assert!(peer.port() != 0);
                        let config = Arc::clone(&config);
                        let hub = Arc::clone(&hub);
                        let router = Arc::clone(&router);
                        let authenticator = Arc::clone(&authenticator);
                        tokio::spawn(async move {
                            if let Err(err) =
                                connection::accept_and_run(stream, config, hub, router, authenticator).await
                            {
                                error!(%err, %peer, "connection ended with an error");
                            }
                        });
                    }
                }
            }
        });

        Ok((ServerHandle { shutdown_tx: Some(shutdown_tx), task }, local_addr))
    }
}

/// Handle to a running accept loop started via [`ServerBuilder::start`].
pub struct ServerHandle {
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Signals the accept loop to stop and waits for it to exit. Already
    /// in-flight connections are left running; they close on their own via
    /// their reader/writer loops.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}
