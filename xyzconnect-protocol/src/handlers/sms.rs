//! SMS handler (spec.md §4.J).
//!
//! Outgoing sends are correlated to their eventual status by reusing the
//! request packet's `id` as a queue id, since the protocol carries no
//! separate correlation field. A status can race the call that sent it: the
//! peer's reply can be routed and handled before `send_message`'s own
//! continuation resumes past its `send_packet` await point and records the
//! queue id as pending. `early_status` buffers exactly that case.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::error::Result;
use crate::packet::Packet;
use crate::persistence::{Message, Persistence};
use crate::router::PacketHandler;
use crate::sink::PacketSink;

const REQUEST_CONVERSATIONS: &str = "kdeconnect.sms.request_conversations";
const REQUEST_CONVERSATION: &str = "kdeconnect.sms.request_conversation";
const REQUEST_SEND: &str = "kdeconnect.sms.request";
const MESSAGES: &str = "kdeconnect.sms.messages";
const SEND_STATUS: &str = "kdeconnect.sms.send_status";

#[derive(Debug, Clone)]
pub enum SmsEvent {
    ConversationUpdated { device_id: String, thread_id: i64 },
    SendResult { queue_id: i64, success: bool },
}

pub struct SmsHandler {
    sink: Arc<dyn PacketSink>,
    persistence: Arc<dyn Persistence>,
    events: broadcast::Sender<SmsEvent>,
    pending: RwLock<HashSet<i64>>,
    early_status: RwLock<HashMap<i64, bool>>,
}

impl SmsHandler {
    pub fn new(sink: Arc<dyn PacketSink>, persistence: Arc<dyn Persistence>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            sink,
            persistence,
            events,
            pending: RwLock::new(HashSet::new()),
            early_status: RwLock::new(HashMap::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SmsEvent> {
        self.events.subscribe()
    }

    pub async fn request_conversations(&self, device_id: &str) -> Result<()> {
        self.sink
            .send_packet(device_id, Packet::new(REQUEST_CONVERSATIONS, json!({})))
            .await
    }

    pub async fn request_conversation(&self, device_id: &str, thread_id: i64) -> Result<()> {
        self.sink
            .send_packet(
                device_id,
                Packet::new(REQUEST_CONVERSATION, json!({ "threadID": thread_id })),
            )
            .await
    }

    /// Send a message and return the queue id it will be acknowledged under.
    pub async fn send_message(&self, device_id: &str, address: &str, text: &str) -> Result<i64> {
        let packet = Packet::new(
            REQUEST_SEND,
            json!({
                "sendSms": true,
                "phoneNumber": address,
                "messageBody": text,
            }),
        );
        let queue_id = packet.id;

        self.sink.send_packet(device_id, packet).await?;

        let raced = self.early_status.write().await.remove(&queue_id);
        match raced {
            Some(success) => {
                let _ = self.events.send(SmsEvent::SendResult { queue_id, success });
            }
            None => {
                self.pending.write().await.insert(queue_id);
            }
        }
        Ok(queue_id)
    }

    async fn handle_messages(&self, device_id: &str, body: &Value) {
        let Some(messages) = body.get("messages").and_then(Value::as_array) else {
            debug!(device_id, "sms.messages packet carried no messages array");
            return;
        };

        let mut thread_ids = HashSet::new();
        for entry in messages {
            let thread_id = entry.get("thread_id").and_then(Value::as_i64).unwrap_or(0);
            thread_ids.insert(thread_id);
            let message = Message {
                device_id: device_id.to_string(),
                thread_id,
                body: entry.clone(),
            };
            if let Err(e) = self.persistence.save_message(message).await {
                warn!(device_id, "failed to persist message: {e}");
            }
        }
        for thread_id in thread_ids {
            let _ = self.events.send(SmsEvent::ConversationUpdated {
                device_id: device_id.to_string(),
                thread_id,
            });
        }
    }

    async fn handle_send_status(&self, body: &Value) {
        let Some(queue_id) = body.get("queueId").and_then(Value::as_i64) else {
            return;
        };
        let success = body.get("success").and_then(Value::as_bool).unwrap_or(false);

        let resolved = self.pending.write().await.remove(&queue_id);
        if resolved {
            let _ = self.events.send(SmsEvent::SendResult { queue_id, success });
        } else {
            self.early_status.write().await.insert(queue_id, success);
        }
    }
}

#[async_trait]
impl PacketHandler for SmsHandler {
    async fn handle(&self, device_id: &str, packet: &Packet) {
        match packet.packet_type.as_str() {
            MESSAGES => self.handle_messages(device_id, &packet.body).await,
            SEND_STATUS => self.handle_send_status(&packet.body).await,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    struct RecordingSink(Mutex<Vec<(String, Packet)>>);

    #[async_trait]
    impl PacketSink for RecordingSink {
        async fn send_packet(&self, device_id: &str, packet: Packet) -> Result<()> {
            self.0.lock().await.push((device_id.to_string(), packet));
            Ok(())
        }
    }

    fn persistence() -> Arc<crate::persistence::JsonFilePersistence> {
        let dir = TempDir::new().unwrap();
        Arc::new(crate::persistence::JsonFilePersistence::new(
            dir.path().join("store.json"),
        ))
    }

    #[tokio::test]
    async fn send_status_arriving_after_send_resolves_immediately() {
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let handler = SmsHandler::new(sink.clone(), persistence());
        let mut rx = handler.subscribe();

        let queue_id = handler.send_message("dev1", "+15550100", "hi").await.unwrap();
        handler
            .handle_send_status(&json!({ "queueId": queue_id, "success": true }))
            .await;

        assert!(!handler.pending.read().await.contains(&queue_id));
        match rx.recv().await.unwrap() {
            SmsEvent::SendResult { queue_id: id, success } => {
                assert_eq!(id, queue_id);
                assert!(success);
            }
            other => panic!("expected SendResult, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn early_status_arriving_before_pending_is_registered_is_buffered() {
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let handler = SmsHandler::new(sink.clone(), persistence());

        // Simulate the race: a status for a queue id shows up before any
        // send_message call has registered it as pending.
        handler
            .handle_send_status(&json!({ "queueId": 42, "success": true }))
            .await;
        assert_eq!(handler.early_status.read().await.get(&42), Some(&true));
    }

    #[tokio::test]
    async fn messages_packet_persists_and_emits_one_event_per_thread() {
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let handler = SmsHandler::new(sink, persistence());
        let mut rx = handler.subscribe();

        let packet = Packet::new(
            MESSAGES,
            json!({
                "messages": [
                    {"thread_id": 1, "body": "hi"},
                    {"thread_id": 1, "body": "there"},
                    {"thread_id": 2, "body": "other thread"},
                ]
            }),
        );
        handler.handle("dev1", &packet).await;

        let mut thread_ids = Vec::new();
        for _ in 0..2 {
            if let SmsEvent::ConversationUpdated { thread_id, .. } = rx.recv().await.unwrap() {
                thread_ids.push(thread_id);
            }
        }
        thread_ids.sort();
        assert_eq!(thread_ids, vec![1, 2]);
    }
}
