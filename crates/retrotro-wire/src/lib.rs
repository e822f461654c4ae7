//! Wire types for the retrotro realtime collaboration protocol.
//!
//! This crate has no networking or runtime dependencies of its own: it
//! exists so that both the server (`retrotro-realtime`) and any Rust client
//! can share one definition of the inbound/outbound message shapes, the
//! cross-pod [`envelope::Envelope`] frame, and the session/phase model.
//!
//! Frames exchanged with a client are newline-delimited JSON objects of the
//! shape `{"type": "...", "payload": {...}}`; see [`inbound::InboundMessage`]
//! and [`outbound::OutboundEvent`].

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod envelope;
pub mod ids;
pub mod inbound;
mod parse_error;
pub mod outbound;
pub mod phase;

pub use envelope::Envelope;
pub use ids::{ConnectionId, ItemId, PodId, RoomId, UserId};
pub use inbound::InboundMessage;
pub use outbound::OutboundEvent;
pub use parse_error::ParseError;
pub use phase::{Phase, PhaseOrder, SessionType};
