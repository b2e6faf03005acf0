//! Connection Manager (spec.md §4.E): the outer TCP listener, the
//! role-inverted TLS handshake in both directions, and the live connection
//! table handlers write through via [`crate::sink::PacketSink`].

pub mod events;
pub mod manager;

pub use events::ConnectionEvent;
pub use manager::{ConnectionManager, DeviceConnection};
