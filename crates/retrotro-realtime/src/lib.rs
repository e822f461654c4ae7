//! The retrotro realtime engine.
//!
//! This crate implements the server side of the retrotro collaboration
//! protocol: a process-local connection/room registry (C2, [`hub`]), a
//! cross-pod relay (C3, [`bus`]) over a pluggable transport, a timer
//! service (C4, [`timer`]), a phase sequencer (C5, [`phase`] via
//! [`retrotro_wire::phase`]), a message router (C6, [`router`]), and the
//! websocket connection/accept-loop plumbing (C1, [`connection`] and
//! [`server`]) that ties them together.
//!
//! The wire types exchanged with clients — [`retrotro_wire::InboundMessage`],
//! [`retrotro_wire::OutboundEvent`], and the cross-pod [`retrotro_wire::Envelope`]
//! — live in the sibling `retrotro-wire` crate so a client can depend on
//! them without pulling in this crate's networking and persistence stack.
//!
//! # Getting started
//!
//! Construct a [`hub::Hub`], a [`bus::Bus`] over whichever
//! [`bus::BusTransport`] fits the deployment (the `in_process` transport
//! needs nothing further and is the default feature), a
//! [`repository::Repository`], an [`policy::AuthPolicy`], a
//! [`phase::PhaseSequencer`], and a [`timer::TimerService`]; wire them into
//! a [`router::Router`]; then hand the router to
//! [`server::ServerBuilder::start`] along with an [`policy::Authenticator`].
//!
//! ```no_run
//! # async fn func() -> Result<(), retrotro_realtime::error::EngineError> {
//! use std::sync::Arc;
//! use retrotro_realtime::bus::transport::in_process::InProcessTransport;
//! use retrotro_realtime::bus::{Bus, BusTransport};
//! use retrotro_realtime::hub::Hub;
//! use retrotro_realtime::phase::PhaseSequencer;
//! use retrotro_realtime::policy::DefaultAuthPolicy;
//! use retrotro_realtime::repository::InMemoryRepository;
//! use retrotro_realtime::router::Router;
//! use retrotro_realtime::timer::TimerService;
//! use retrotro_wire::PodId;
//!
//! let (hub, grace_rx) = Hub::with_grace(std::time::Duration::from_secs(10));
//! let transport: Arc<dyn BusTransport> = Arc::new(InProcessTransport::shared());
//! let bus = Arc::new(Bus::new(PodId::generate(), Arc::clone(&hub), transport));
//! bus.start(grace_rx).await?;
//!
//! let repository = Arc::new(InMemoryRepository::default());
//! let policy = Arc::new(DefaultAuthPolicy);
//! let phases = Arc::new(PhaseSequencer::new(repository.clone(), bus.clone()));
//! let timers = Arc::new(TimerService::new(repository.clone(), bus.clone(), 5, 10));
//! let _router = Arc::new(Router::new(hub, bus, repository, policy, phases, timers));
//! # Ok(()) }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod phase;
pub mod policy;
pub mod repository;
pub mod router;
pub mod server;
#[cfg(test)]
mod testutil;
pub mod timer;

#[cfg(test)]
mod tests;

pub use config::Config;
pub use error::EngineError;
pub use hub::Hub;
pub use router::Router;
