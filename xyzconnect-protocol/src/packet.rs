//! Packet codec (spec.md §4.A).
//!
//! Wire format is newline-delimited UTF-8 JSON: `{"id":..,"type":..,"body":..}\n`.
//! Packets may arrive concatenated or split across reads; this module only
//! handles a single already-delimited line. Splitting/buffering lives in
//! [`crate::router`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ProtocolError, Result};

/// Protocol version this crate advertises and requires for the
/// post-TLS identity re-exchange consistency check (spec.md §4.D).
pub const PROTOCOL_VERSION: u32 = 8;

/// Fixed incoming capabilities advertised in every identity packet we send.
pub const INCOMING_CAPABILITIES: &[&str] = &[
    "kdeconnect.sms.messages",
    "kdeconnect.sms.attachment_file",
    "kdeconnect.contacts.response_uids_timestamps",
    "kdeconnect.contacts.response_vcards",
    "kdeconnect.notification",
];

/// Fixed outgoing capabilities advertised in every identity packet we send.
pub const OUTGOING_CAPABILITIES: &[&str] = &[
    "kdeconnect.sms.request",
    "kdeconnect.sms.request_conversations",
    "kdeconnect.sms.request_conversation",
    "kdeconnect.sms.request_attachment",
    "kdeconnect.contacts.request_all_uids_timestamps",
    "kdeconnect.contacts.request_vcards_by_uid",
    "kdeconnect.ping",
    "kdeconnect.findmyphone.request",
];

/// A generic protocol packet: `{id, type, body}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Packet {
    pub id: i64,
    #[serde(rename = "type")]
    pub packet_type: String,
    pub body: Value,
}

impl Packet {
    /// Build a packet with `id` set to the current millisecond timestamp.
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id: current_timestamp_ms(),
            packet_type: packet_type.into(),
            body,
        }
    }

    /// Serialize to wire bytes: compact JSON followed by a single `\n`.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Parse one newline-delimited line (without its trailing `\n`) into a
    /// packet, rejecting anything that doesn't meet the codec-level shape:
    /// a JSON object with a numeric `id`, a string `type`, and an object
    /// `body`.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ProtocolError::InvalidPacket("empty line".into()));
        }

        let value: Value = serde_json::from_str(line)?;
        let obj = value
            .as_object()
            .ok_or_else(|| ProtocolError::InvalidPacket("packet is not a JSON object".into()))?;

        let id = obj
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| ProtocolError::InvalidPacket("missing numeric id".into()))?;

        let packet_type = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::InvalidPacket("missing string type".into()))?
            .to_string();

        let body = obj
            .get("body")
            .cloned()
            .ok_or_else(|| ProtocolError::InvalidPacket("missing body".into()))?;
        if !body.is_object() {
            return Err(ProtocolError::InvalidPacket(
                "body must be a JSON object".into(),
            ));
        }

        Ok(Self {
            id,
            packet_type,
            body,
        })
    }

    pub fn is_type(&self, t: &str) -> bool {
        self.packet_type == t
    }
}

/// Parameters for building our own identity packet.
pub struct IdentityParams<'a> {
    pub device_id: &'a str,
    pub device_name: &'a str,
    pub tcp_port: u16,
}

/// Build our identity packet with the fixed capability arrays (spec.md §4.A).
pub fn create_identity_packet(params: IdentityParams<'_>) -> Packet {
    let body = serde_json::json!({
        "deviceId": params.device_id,
        "deviceName": params.device_name,
        "deviceType": "desktop",
        "protocolVersion": PROTOCOL_VERSION,
        "tcpPort": params.tcp_port,
        "incomingCapabilities": INCOMING_CAPABILITIES,
        "outgoingCapabilities": OUTGOING_CAPABILITIES,
    });
    Packet::new("kdeconnect.identity", body)
}

/// A validated identity packet body.
#[derive(Debug, Clone)]
pub struct Identity {
    pub device_id: String,
    pub device_name: String,
    pub device_type: String,
    pub protocol_version: u32,
    pub tcp_port: u16,
}

/// `deviceId` is 32-38 chars of `[A-Za-z0-9_-]`.
pub fn is_valid_device_id(id: &str) -> bool {
    let len = id.chars().count();
    (32..=38).contains(&len)
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validate that `packet` is a well-formed `kdeconnect.identity` packet and
/// extract its body, per spec.md §4.A.
pub fn validate_identity_packet(packet: &Packet) -> Result<Identity> {
    if !packet.is_type("kdeconnect.identity") {
        return Err(ProtocolError::InvalidIdentity(format!(
            "unexpected packet type: {}",
            packet.packet_type
        )));
    }

    let body = packet
        .body
        .as_object()
        .ok_or_else(|| ProtocolError::InvalidIdentity("body is not an object".into()))?;

    let device_id = body
        .get("deviceId")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::InvalidIdentity("missing deviceId".into()))?;
    if !is_valid_device_id(device_id) {
        return Err(ProtocolError::InvalidIdentity(format!(
            "deviceId '{device_id}' is not 32-38 chars of [A-Za-z0-9_-]"
        )));
    }

    let device_name = body
        .get("deviceName")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::InvalidIdentity("missing deviceName".into()))?;

    let device_type = body
        .get("deviceType")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::InvalidIdentity("missing deviceType".into()))?;

    let protocol_version = body
        .get("protocolVersion")
        .and_then(Value::as_u64)
        .ok_or_else(|| ProtocolError::InvalidIdentity("missing protocolVersion".into()))?
        as u32;

    let tcp_port = body
        .get("tcpPort")
        .and_then(Value::as_u64)
        .ok_or_else(|| ProtocolError::InvalidIdentity("missing tcpPort".into()))?;
    if !(1..=65535).contains(&tcp_port) {
        return Err(ProtocolError::InvalidIdentity(format!(
            "tcpPort {tcp_port} out of range"
        )));
    }

    Ok(Identity {
        device_id: device_id.to_string(),
        device_name: device_name.to_string(),
        device_type: device_type.to_string(),
        protocol_version,
        tcp_port: tcp_port as u16,
    })
}

pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}
