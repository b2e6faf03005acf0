//! Persistence seam (SPEC_FULL.md §2 ambient-stack supplement).
//!
//! spec.md's Non-goals exclude a concrete SQLite layer, but the sync
//! orchestrator and the contacts/SMS/notifications handlers all need to
//! persist *something*. This trait is the boundary: a real daemon wires it
//! to SQLite, this crate ships [`JsonFilePersistence`] — one whole-file
//! JSON document per concern under the data directory, the same pattern
//! spec.md §4.K mandates for the known-device store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contact {
    pub uid: String,
    pub name: String,
    pub phone_numbers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub device_id: String,
    pub thread_id: i64,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: String,
    pub app_name: String,
    pub title: String,
    pub text: String,
    pub time: i64,
    pub dismissable: bool,
    pub silent: bool,
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save_contacts(&self, device_id: &str, contacts: Vec<Contact>) -> Result<()>;
    async fn save_message(&self, message: Message) -> Result<()>;
    async fn save_notification(&self, notification: Notification) -> Result<()>;
    async fn remove_notification(&self, id: &str) -> Result<()>;
    async fn load_last_sync(&self, device_id: &str) -> Result<Option<i64>>;
    async fn save_last_sync(&self, device_id: &str, timestamp_ms: i64) -> Result<()>;
}

#[derive(Default, Serialize, Deserialize)]
struct Store {
    contacts: HashMap<String, Vec<Contact>>,
    messages: Vec<Message>,
    notifications: HashMap<String, Notification>,
    last_sync: HashMap<String, i64>,
}

/// Whole-file JSON implementation of [`Persistence`], good enough to run a
/// real daemon without a database and to back the test suite.
pub struct JsonFilePersistence {
    path: PathBuf,
    store: Mutex<Store>,
}

impl JsonFilePersistence {
    pub fn new(path: PathBuf) -> Self {
        let store = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Self {
            path,
            store: Mutex::new(store),
        }
    }

    async fn flush(&self, store: &Store) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(store)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }
}

#[async_trait]
impl Persistence for JsonFilePersistence {
    async fn save_contacts(&self, device_id: &str, contacts: Vec<Contact>) -> Result<()> {
        let mut store = self.store.lock().await;
        store.contacts.insert(device_id.to_string(), contacts);
        self.flush(&store).await
    }

    async fn save_message(&self, message: Message) -> Result<()> {
        let mut store = self.store.lock().await;
        store.messages.push(message);
        self.flush(&store).await
    }

    async fn save_notification(&self, notification: Notification) -> Result<()> {
        let mut store = self.store.lock().await;
        store.notifications.insert(notification.id.clone(), notification);
        self.flush(&store).await
    }

    async fn remove_notification(&self, id: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        store.notifications.remove(id);
        self.flush(&store).await
    }

    async fn load_last_sync(&self, device_id: &str) -> Result<Option<i64>> {
        let store = self.store.lock().await;
        Ok(store.last_sync.get(device_id).copied())
    }

    async fn save_last_sync(&self, device_id: &str, timestamp_ms: i64) -> Result<()> {
        let mut store = self.store.lock().await;
        store.last_sync.insert(device_id.to_string(), timestamp_ms);
        self.flush(&store).await
    }
}

pub fn default_path(data_dir: &Path) -> PathBuf {
    data_dir.join("store.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn notification_upsert_and_dismiss_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = JsonFilePersistence::new(dir.path().join("store.json"));

        store
            .save_notification(Notification {
                id: "1".into(),
                app_name: "sms".into(),
                title: "Alice".into(),
                text: "hi".into(),
                time: 1000,
                dismissable: true,
                silent: false,
            })
            .await
            .unwrap();
        store.remove_notification("1").await.unwrap();

        let reloaded = JsonFilePersistence::new(dir.path().join("store.json"));
        assert!(reloaded.store.lock().await.notifications.is_empty());
    }

    #[tokio::test]
    async fn last_sync_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        let store = JsonFilePersistence::new(path.clone());
        store.save_last_sync("dev1", 5000).await.unwrap();

        let reloaded = JsonFilePersistence::new(path);
        assert_eq!(reloaded.load_last_sync("dev1").await.unwrap(), Some(5000));
    }
}
