//! Connection Manager event hub (spec.md §4.E / §9 typed event hub).

use crate::packet::Packet;

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected {
        device_id: String,
        device_name: String,
        protocol_version: u32,
    },
    Disconnected {
        device_id: String,
    },
    PacketReceived {
        device_id: String,
        packet: Packet,
    },
}
