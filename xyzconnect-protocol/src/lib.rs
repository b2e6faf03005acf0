//! Link layer and session core for a KDE-Connect-compatible desktop daemon.
//!
//! Discovery finds peers on the LAN, [`connection::ConnectionManager`]
//! handshakes and holds the live TLS sessions, [`router::PacketRouter`]
//! dispatches framed packets to the handlers in [`handlers`], and
//! [`state_machine::StateMachine`] plus [`sync::SyncOrchestrator`] track
//! where the daemon is in its pairing/sync lifecycle. The binary crate
//! (`xyzconnect-daemon`) wires these pieces together with a config file, a
//! data directory, and structured logging.

pub mod connection;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod handlers;
pub mod known_devices;
pub mod packet;
pub mod pairing;
pub mod persistence;
pub mod router;
pub mod sink;
pub mod state_machine;
pub mod sync;
pub mod transport;

pub use connection::{ConnectionEvent, ConnectionManager, DeviceConnection};
pub use crypto::Identity;
pub use discovery::{Discovery, DiscoveryConfig, DiscoveryEvent, DiscoveredDevice};
pub use error::{NetworkError, PairingError, ProtocolError, Result, StateError};
pub use packet::{Packet, PROTOCOL_VERSION};
pub use pairing::PairingHandler;
pub use router::PacketRouter;
pub use sink::PacketSink;
pub use state_machine::{DaemonState, StateMachine};
pub use sync::{SyncConfig, SyncOrchestrator};
