//! The write side of a device connection, as seen by handlers.
//!
//! Per spec.md §9, handlers (pairing, sync, contacts/sms/notifications) get
//! an immutable view of a device connection plus a write sink; the
//! connection's lifetime is owned exclusively by the connection manager.
//! This trait is that write sink, injected into every handler at
//! construction so none of them depend on the connection manager directly.

use async_trait::async_trait;

use crate::error::Result;
use crate::packet::Packet;

#[async_trait]
pub trait PacketSink: Send + Sync {
    /// Send `packet` to `device_id`'s active connection, if any. A missing
    /// connection is a [`crate::error::ProtocolError::DeviceNotFound`], not
    /// a panic.
    async fn send_packet(&self, device_id: &str, packet: Packet) -> Result<()>;
}
