//! Packet router (spec.md §4.F).
//!
//! Dispatches by `type` to typed handlers. Buffers partial data per device
//! so a `Packet` split across two TCP reads (or two packets concatenated
//! into one read) is never lost or reordered.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::Result;
use crate::packet::Packet;

#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn handle(&self, device_id: &str, packet: &Packet);
}

pub struct PacketRouter {
    handlers: RwLock<HashMap<String, std::sync::Arc<dyn PacketHandler>>>,
    buffers: RwLock<HashMap<String, Vec<u8>>>,
}

impl PacketRouter {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            buffers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, packet_type: impl Into<String>, handler: std::sync::Arc<dyn PacketHandler>) {
        self.handlers.write().await.insert(packet_type.into(), handler);
    }

    /// Append `bytes` to `device_id`'s partial-line buffer, split on `\n`,
    /// and dispatch every complete trimmed line. The remainder after the
    /// last `\n` (or the whole chunk, if it contains none) stays buffered.
    ///
    /// The buffer holds raw bytes, not a `String`: a multi-byte UTF-8
    /// character can straddle a chunk boundary, and decoding each chunk in
    /// isolation (e.g. `String::from_utf8_lossy`) would replace each half
    /// with U+FFFD instead of reassembling the character. Only a complete
    /// line is ever decoded, the same approach `transport::tls::receive_packet`
    /// uses for its own per-connection buffer.
    pub async fn route(&self, device_id: &str, bytes: &[u8]) -> Result<()> {
        let mut buffers = self.buffers.write().await;
        let buffer = buffers.entry(device_id.to_string()).or_default();
        buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            lines.push(line);
        }
        drop(buffers);

        for line in lines {
            match String::from_utf8(line) {
                Ok(line) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        self.dispatch_line(device_id, trimmed).await;
                    }
                }
                Err(e) => warn!(device_id, "dropping non-UTF-8 line: {e}"),
            }
        }
        Ok(())
    }

    async fn dispatch_line(&self, device_id: &str, line: &str) {
        let packet = match Packet::parse(line) {
            Ok(p) => p,
            Err(e) => {
                warn!(device_id, "dropping unparseable packet: {e}");
                return;
            }
        };
        self.dispatch_packet(device_id, &packet).await;
    }

    /// Dispatch an already-framed packet, bypassing the line buffer. Used by
    /// [`crate::connection::manager::ConnectionManager`], whose TLS stream
    /// frames one packet per read and has no need for the byte buffer above.
    pub async fn dispatch_packet(&self, device_id: &str, packet: &Packet) {
        let handler = self.handlers.read().await.get(&packet.packet_type).cloned();
        match handler {
            Some(handler) => handler.handle(device_id, packet).await,
            None => debug!(device_id, packet_type = %packet.packet_type, "no handler for packet type"),
        }
    }

    /// Discard any partial data buffered for `device_id`, on disconnect.
    pub async fn reset_buffer(&self, device_id: &str) {
        self.buffers.write().await.remove(device_id);
    }
}

impl Default for PacketRouter {
    fn default() -> Self {
        Self::new()
    }
}
