//! Connection runtime: readiness multiplexing, per-connection state,
//! the send pipeline, and the liveness subsystem.
//!
//! The event loop in [`crate::server`] owns a [`poller::Poller`] and all
//! decoder state; the send pipeline and heartbeat run against shared
//! [`connection::Connection`] handles from any thread.

pub mod connection;
pub mod heartbeat;
pub mod poller;
mod sender;

pub use connection::{Connection, ConnectionTable, Handle};
pub use poller::{Event, Interest, Poller};
