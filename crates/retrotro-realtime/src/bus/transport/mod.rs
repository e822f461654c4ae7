//! Concrete [`super::BusTransport`] implementations, one per deployment
//! shape a pod might run behind.

#[cfg(feature = "in_process")]
pub mod in_process;

#[cfg(feature = "polling")]
pub mod polling;

#[cfg(feature = "datagram")]
pub mod datagram;

#[cfg(feature = "notify")]
pub mod notify;
