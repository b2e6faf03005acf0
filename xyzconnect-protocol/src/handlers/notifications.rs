//! Notifications handler (spec.md §4.J).
//!
//! `time`, `dismissable`, and `silent` arrive with inconsistent types across
//! KDE Connect implementations (numeric or stringified timestamps, real or
//! stringified booleans); this handler coerces all of them rather than
//! rejecting the packet.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::Result;
use crate::packet::{current_timestamp_ms, Packet};
use crate::persistence::{Notification, Persistence};
use crate::router::PacketHandler;
use crate::sink::PacketSink;

const NOTIFICATION: &str = "kdeconnect.notification";
const REQUEST: &str = "kdeconnect.notification.request";

#[derive(Debug, Clone)]
pub enum NotificationEvent {
    Upserted(Notification),
    Removed { id: String },
}

pub struct NotificationsHandler {
    sink: Arc<dyn PacketSink>,
    persistence: Arc<dyn Persistence>,
    events: broadcast::Sender<NotificationEvent>,
}

impl NotificationsHandler {
    pub fn new(sink: Arc<dyn PacketSink>, persistence: Arc<dyn Persistence>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            sink,
            persistence,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.events.subscribe()
    }

    /// Ask the peer to dismiss a notification we're mirroring, by id.
    pub async fn dismiss(&self, device_id: &str, id: &str) -> Result<()> {
        self.sink
            .send_packet(device_id, Packet::new(REQUEST, json!({ "cancel": id })))
            .await
    }

    async fn handle_notification(&self, body: &Value) {
        let Some(id) = body.get("id").and_then(Value::as_str) else {
            warn!("notification packet missing id, dropping");
            return;
        };

        let is_cancel = body
            .get("isCancel")
            .map(coerce_bool)
            .unwrap_or(false);

        if is_cancel {
            if let Err(e) = self.persistence.remove_notification(id).await {
                warn!("failed to remove notification {id}: {e}");
                return;
            }
            let _ = self.events.send(NotificationEvent::Removed { id: id.to_string() });
            return;
        }

        let text = body
            .get("text")
            .and_then(Value::as_str)
            .or_else(|| body.get("ticker").and_then(Value::as_str))
            .unwrap_or("")
            .to_string();

        let notification = Notification {
            id: id.to_string(),
            app_name: body
                .get("appName")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            title: body.get("title").and_then(Value::as_str).unwrap_or("").to_string(),
            text,
            time: coerce_time(body.get("time")),
            dismissable: is_true(body.get("isClearable")),
            silent: is_true(body.get("silent")),
        };

        if let Err(e) = self.persistence.save_notification(notification.clone()).await {
            warn!("failed to persist notification {id}: {e}");
            return;
        }
        let _ = self.events.send(NotificationEvent::Upserted(notification));
    }
}

#[async_trait]
impl PacketHandler for NotificationsHandler {
    async fn handle(&self, _device_id: &str, packet: &Packet) {
        if packet.is_type(NOTIFICATION) {
            self.handle_notification(&packet.body).await;
        }
    }
}

fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        Value::Number(n) => n.as_i64().map(|i| i != 0).unwrap_or(false),
        _ => false,
    }
}

/// Strict `=== true` check, per spec.md §4.J's upsert formula: a string
/// `"true"` or a nonzero number must not count, unlike `isCancel`'s more
/// lenient [`coerce_bool`].
fn is_true(value: Option<&Value>) -> bool {
    matches!(value, Some(Value::Bool(true)))
}

fn coerce_time(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_i64().unwrap_or_else(current_timestamp_ms),
        Some(Value::String(s)) => s.parse().unwrap_or_else(|_| current_timestamp_ms()),
        _ => current_timestamp_ms(),
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

    fn handler() -> Arc<NotificationsHandler> {
        let dir = TempDir::new().unwrap();
        let persistence = Arc::new(crate::persistence::JsonFilePersistence::new(
            dir.path().join("store.json"),
        ));
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        NotificationsHandler::new(sink, persistence)
    }

    #[tokio::test]
    async fn upserts_with_string_coerced_time_and_strict_booleans() {
        let handler = handler();
        let mut rx = handler.subscribe();

        // `isClearable`/`silent` as string "true"/"false" must NOT count as
        // true per the strict `=== true` formula, even though `time` still
        // accepts a numeric string.
        let packet = Packet::new(
            NOTIFICATION,
            json!({
                "id": "n1",
                "appName": "sms",
                "title": "Alice",
                "text": "hi",
                "time": "12345",
                "isClearable": "true",
                "silent": "false",
            }),
        );
        handler.handle("dev1", &packet).await;

        match rx.recv().await.unwrap() {
            NotificationEvent::Upserted(n) => {
                assert_eq!(n.time, 12345);
                assert!(!n.dismissable);
                assert!(!n.silent);
            }
            other => panic!("expected Upserted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dismissable_and_silent_require_a_literal_boolean_true() {
        let handler = handler();
        let mut rx = handler.subscribe();

        let packet = Packet::new(
            NOTIFICATION,
            json!({
                "id": "n1",
                "title": "x",
                "text": "y",
                "isClearable": true,
                "silent": 1,
            }),
        );
        handler.handle("dev1", &packet).await;

        match rx.recv().await.unwrap() {
            NotificationEvent::Upserted(n) => {
                assert!(n.dismissable);
                // A nonzero number is not a literal `true`.
                assert!(!n.silent);
            }
            other => panic!("expected Upserted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn text_falls_back_to_ticker_when_absent() {
        let handler = handler();
        let mut rx = handler.subscribe();

        let packet = Packet::new(
            NOTIFICATION,
            json!({ "id": "n1", "title": "x", "ticker": "fallback text" }),
        );
        handler.handle("dev1", &packet).await;

        match rx.recv().await.unwrap() {
            NotificationEvent::Upserted(n) => assert_eq!(n.text, "fallback text"),
            other => panic!("expected Upserted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn is_cancel_removes_rather_than_upserts() {
        let handler = handler();
        let mut rx = handler.subscribe();

        let upsert = Packet::new(NOTIFICATION, json!({"id": "n1", "title": "x", "text": "y"}));
        handler.handle("dev1", &upsert).await;
        rx.recv().await.unwrap();

        let cancel = Packet::new(NOTIFICATION, json!({"id": "n1", "isCancel": true}));
        handler.handle("dev1", &cancel).await;

        match rx.recv().await.unwrap() {
            NotificationEvent::Removed { id } => assert_eq!(id, "n1"),
            other => panic!("expected Removed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_time_defaults_to_now() {
        let handler = handler();
        let mut rx = handler.subscribe();
        let packet = Packet::new(NOTIFICATION, json!({"id": "n2", "title": "x", "text": "y"}));
        handler.handle("dev1", &packet).await;
        match rx.recv().await.unwrap() {
            NotificationEvent::Upserted(n) => assert!(n.time > 0),
            other => panic!("expected Upserted, got {other:?}"),
        }
    }
}
