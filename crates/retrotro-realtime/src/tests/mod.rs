//! Multi-component scenarios exercising the engine end to end: a bound TCP
//! listener, real websocket clients via [`crate::testutil::TestClient`], and
//! the in-process bus. Each submodule covers one walkthrough from the
//! protocol's end-to-end scenario list.

mod presence;
mod voting;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use retrotro_wire::outbound::OutboundEvent;
use retrotro_wire::{PodId, UserId};

use crate::bus::transport::in_process::InProcessTransport;
use crate::bus::{Bus, BusTransport};
use crate::config::Config;
use crate::error::EngineError;
use crate::hub::Hub;
use crate::phase::PhaseSequencer;
use crate::policy::{AuthPolicy, Authenticator, DefaultAuthPolicy};
use crate::repository::{InMemoryRepository, Repository};
use crate::router::Router;
use crate::server::{ServerBuilder, ServerHandle};
use crate::testutil::TestClient;
use crate::timer::TimerService;

/// Resolves a bearer token to a user id by hashing the token itself, so the
/// same token always authenticates as the same user — including across two
/// independently constructed authenticators standing in for two different
/// pods in the cross-pod migration scenario.
#[derive(Debug, Default)]
struct TestAuthenticator;

#[async_trait]
impl Authenticator for TestAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<(UserId, String), EngineError> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        token.hash(&mut hasher);
        let low = hasher.finish() as u128;
        hasher.write_u8(0xA5);
        let high = hasher.finish() as u128;
        let id = Uuid::from_u128((high << 64) | low);
        Ok((UserId::new(id), token.to_string()))
    }
}

/// One running engine, bound to an ephemeral localhost port, with its
/// repository exposed so a test can inspect durable state a real client
/// would only ever see reflected back through events.
pub(super) struct Harness {
    pub repository: Arc<dyn Repository>,
    pub addr: SocketAddr,
    handle: ServerHandle,
}

impl Harness {
    /// Starts a single isolated pod: its own hub, bus (in-process transport),
    /// and in-memory repository.
    pub async fn start(config: Config) -> Self {
        let transport = Arc::new(InProcessTransport::shared());
        let repository: Arc<dyn Repository> = Arc::new(InMemoryRepository::default());
        Self::start_pod(transport, repository, config).await
    }

    /// Starts a pod sharing the given transport and repository with other
    /// pods, for scenarios that simulate more than one process.
    pub async fn start_pod(
        transport: Arc<dyn BusTransport>,
        repository: Arc<dyn Repository>,
        config: Config,
    ) -> Self {
        let (hub, grace_rx) = Hub::with_grace(config.disconnect_grace());
        let bus = Arc::new(Bus::new(PodId::generate(), Arc::clone(&hub), transport));
        bus.start(grace_rx).await.expect("bus must start");

        let policy: Arc<dyn AuthPolicy> = Arc::new(DefaultAuthPolicy);
        let phases = Arc::new(PhaseSequencer::new(Arc::clone(&repository), Arc::clone(&bus)));
        let timers = Arc::new(TimerService::new(
            Arc::clone(&repository),
            Arc::clone(&bus),
            config.tick_sparse_interval_s,
            config.tick_dense_threshold_s,
        ));
        let router = Arc::new(Router::new(
            Arc::clone(&hub),
            bus,
            Arc::clone(&repository),
            policy,
            phases,
            timers,
        ));
        let authenticator: Arc<dyn Authenticator> = Arc::new(TestAuthenticator);

        let (handle, addr) = ServerBuilder::new("127.0.0.1:0".parse().unwrap())
            .config(config)
            .start(hub, router, authenticator)
            .await
            .expect("server must bind to an ephemeral port");

        Self { repository, addr, handle }
    }

    pub async fn client(&self, token: &str) -> TestClient {
        TestClient::connect(self.addr, token).await
    }

    pub async fn stop(self) {
        self.handle.stop().await;
    }
}

/// Collects every event a client receives over `window`, stopping early once
/// nothing new arrives for a whole second. Used where a scenario cares about
/// the full set of events observed rather than an exact frame-by-frame count
/// (the server may or may not coalesce adjacent broadcasts into one frame).
pub(super) async fn collect_for(client: &mut TestClient, window: Duration) -> Vec<OutboundEvent> {
    let deadline = tokio::time::Instant::now() + window;
    let mut events = Vec::new();
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        match tokio::time::timeout(deadline - now, client.recv_batch()).await {
            Ok(Ok(batch)) => events.extend(batch),
            _ => break,
        }
    }
    events
}

/// Collects events until at least `n` have arrived. Used under a paused
/// clock, where the usual wall-clock window in [`collect_for`] doesn't apply.
pub(super) async fn collect_at_least(client: &mut TestClient, n: usize) -> Vec<OutboundEvent> {
    let mut events = Vec::new();
    while events.len() < n {
        events.extend(client.recv_batch().await.expect("event should arrive"));
    }
    events
}

/// A short grace period so presence scenarios don't need to wait out the
/// ten-second default.
pub(super) fn fast_grace_config() -> Config {
    Config {
        disconnect_grace_ms: 300,
        ..Config::default()
    }
}
