//! Contacts handler (spec.md §4.J).
//!
//! KDE Connect's contacts plugin replies to `request_all_uids_timestamps`
//! with a uid→timestamp map and to `request_vcards_by_uid` with a uid→vCard
//! text map carrying a reserved `"uids"` key that is not itself a vCard.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::packet::Packet;
use crate::persistence::{Contact, Persistence};
use crate::router::PacketHandler;
use crate::sink::PacketSink;

const REQUEST_ALL_UIDS: &str = "kdeconnect.contacts.request_all_uids_timestamps";
const RESPONSE_UIDS: &str = "kdeconnect.contacts.response_uids_timestamps";
const REQUEST_VCARDS: &str = "kdeconnect.contacts.request_vcards_by_uid";
const RESPONSE_VCARDS: &str = "kdeconnect.contacts.response_vcards";

pub struct ContactsHandler {
    sink: Arc<dyn PacketSink>,
    persistence: Arc<dyn Persistence>,
}

impl ContactsHandler {
    pub fn new(sink: Arc<dyn PacketSink>, persistence: Arc<dyn Persistence>) -> Arc<Self> {
        Arc::new(Self { sink, persistence })
    }

    pub async fn request_all_uids_timestamps(&self, device_id: &str) -> Result<()> {
        self.sink
            .send_packet(device_id, Packet::new(REQUEST_ALL_UIDS, json!({})))
            .await
    }

    async fn request_vcards(&self, device_id: &str, uids: Vec<String>) -> Result<()> {
        self.sink
            .send_packet(device_id, Packet::new(REQUEST_VCARDS, json!({ "uids": uids })))
            .await
    }
}

#[async_trait]
impl PacketHandler for ContactsHandler {
    async fn handle(&self, device_id: &str, packet: &Packet) {
        match packet.packet_type.as_str() {
            RESPONSE_UIDS => {
                let uids = extract_uids(&packet.body);
                if uids.is_empty() {
                    debug!(device_id, "uid/timestamp response carried no uids");
                    return;
                }
                // Request vCards for every known uid immediately; we keep no
                // local timestamp cache to diff against, so this always
                // refetches the full set rather than only what changed.
                if let Err(e) = self.request_vcards(device_id, uids).await {
                    warn!(device_id, "failed to request vcards: {e}");
                }
            }
            RESPONSE_VCARDS => {
                let contacts = parse_vcards_response(&packet.body);
                if let Err(e) = self.persistence.save_contacts(device_id, contacts).await {
                    warn!(device_id, "failed to persist contacts: {e}");
                }
            }
            _ => {}
        }
    }
}

/// Accepts either `{"uids": {uid: timestamp, ...}}`, `{"uids": [uid, ...]}`,
/// or a bare `{uid: timestamp, ...}` body with no `"uids"` wrapper.
fn extract_uids(body: &Value) -> Vec<String> {
    if let Some(uids_value) = body.get("uids") {
        match uids_value {
            Value::Array(arr) => {
                return arr.iter().filter_map(|v| v.as_str().map(String::from)).collect()
            }
            Value::Object(map) => return map.keys().cloned().collect(),
            _ => {}
        }
    }
    match body {
        Value::Object(map) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

fn parse_vcards_response(body: &Value) -> Vec<Contact> {
    let Some(map) = body.as_object() else {
        return Vec::new();
    };
    let mut contacts = Vec::new();
    for (uid, value) in map {
        if uid == "uids" {
            continue;
        }
        let Some(vcard_text) = value.as_str() else {
            continue;
        };
        if let Some(contact) = parse_vcard(uid, vcard_text) {
            contacts.push(contact);
        }
    }
    contacts
}

/// Tolerant of CRLF line endings and unknown vCard properties; only `FN`
/// (display name) and any `TEL*` property are extracted. `None` if the
/// vCard carries no (non-empty) `FN` — per spec.md §4.J, an unnamed entry
/// is skipped rather than given a synthetic name.
fn parse_vcard(uid: &str, text: &str) -> Option<Contact> {
    let mut name = None;
    let mut phone_numbers = Vec::new();

    for raw_line in text.split('\n') {
        let line = raw_line.trim_end_matches('\r').trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.split(';').next().unwrap_or(key).to_ascii_uppercase();
        match key.as_str() {
            "FN" => name = Some(value.to_string()),
            "TEL" => phone_numbers.push(value.to_string()),
            _ => {}
        }
    }

    let name = name.filter(|n| !n.is_empty())?;
    Some(Contact {
        uid: uid.to_string(),
        name,
        phone_numbers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_uids_handles_object_and_array_and_bare_forms() {
        assert_eq!(
            extract_uids(&json!({"uids": {"1": 100, "2": 200}})).len(),
            2
        );
        assert_eq!(extract_uids(&json!({"uids": ["1", "2", "3"]})).len(), 3);
        assert_eq!(extract_uids(&json!({"1": 100})).len(), 1);
        assert!(extract_uids(&json!([1, 2])).is_empty());
    }

    #[test]
    fn parse_vcard_extracts_name_and_phones_tolerant_of_crlf() {
        let text = "BEGIN:VCARD\r\nFN:Alice Example\r\nTEL;TYPE=CELL:555-0100\r\nTEL:555-0101\r\nEND:VCARD\r\n";
        let contact = parse_vcard("uid-1", text).unwrap();
        assert_eq!(contact.name, "Alice Example");
        assert_eq!(contact.phone_numbers, vec!["555-0100", "555-0101"]);
    }

    #[test]
    fn parse_vcards_response_skips_reserved_uids_key() {
        let body = json!({
            "uids": ["1"],
            "1": "BEGIN:VCARD\nFN:Bob\nEND:VCARD\n",
        });
        let contacts = parse_vcards_response(&body);
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].name, "Bob");
    }

    #[test]
    fn parse_vcard_skips_unnamed_contact() {
        assert!(parse_vcard("uid-2", "BEGIN:VCARD\nEND:VCARD\n").is_none());
        assert!(parse_vcard("uid-3", "BEGIN:VCARD\nFN:\nEND:VCARD\n").is_none());
    }

    #[test]
    fn parse_vcards_response_drops_unnamed_entries() {
        let body = json!({
            "uids": ["1", "2"],
            "1": "BEGIN:VCARD\nFN:Bob\nEND:VCARD\n",
            "2": "BEGIN:VCARD\nEND:VCARD\n",
        });
        let contacts = parse_vcards_response(&body);
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].name, "Bob");
    }
}
