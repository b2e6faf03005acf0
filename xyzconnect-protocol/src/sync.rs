//! Sync Orchestrator (spec.md §4.I).
//!
//! Drives one device's contacts + conversation sync to completion and marks
//! it `READY` once a silence window passes with no further activity, then
//! (if `auto_sync` is on) re-triggers the same sync on a fixed interval.
//! Timers use the same single-shot cancelable pattern as
//! [`crate::pairing::handler`]: replacing a device's sender in the timer map
//! drops the old one, which closes its `oneshot::Receiver` and ends the
//! stale task's `select!` on its own — no explicit cancel message needed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::handlers::{ContactsHandler, SmsHandler};
use crate::packet::current_timestamp_ms;
use crate::persistence::Persistence;
use crate::state_machine::{DaemonState, PartialContext, StateMachine, SyncPhase};

const DEFAULT_SILENCE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long to wait after the last activity before declaring a sync
    /// session complete and transitioning `SYNCING` -> `READY`.
    pub silence_timeout: Duration,
    /// How often to re-run the whole sync while `auto_sync` is on.
    pub resync_interval: Duration,
    /// Whether to request contacts at all; conversations are always
    /// requested regardless of this flag.
    pub sync_contacts: bool,
    /// Whether to re-trigger sync on `resync_interval` after the first run.
    pub auto_sync: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            silence_timeout: DEFAULT_SILENCE_TIMEOUT,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            sync_contacts: true,
            auto_sync: true,
        }
    }
}

pub struct SyncOrchestrator {
    state_machine: Arc<StateMachine>,
    contacts: Arc<ContactsHandler>,
    sms: Arc<SmsHandler>,
    persistence: Arc<dyn Persistence>,
    config: SyncConfig,
    silence_cancel: RwLock<HashMap<String, oneshot::Sender<()>>>,
    resync_tasks: RwLock<HashMap<String, JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl SyncOrchestrator {
    pub fn new(
        state_machine: Arc<StateMachine>,
        contacts: Arc<ContactsHandler>,
        sms: Arc<SmsHandler>,
        persistence: Arc<dyn Persistence>,
        config: SyncConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            state_machine,
            contacts,
            sms,
            persistence,
            config,
            silence_cancel: RwLock::new(HashMap::new()),
            resync_tasks: RwLock::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Kick off a sync session: transition to `SYNCING`, fire the contacts
    /// (gated on `sync_contacts`) and conversations (always) requests in
    /// parallel, arm the silence timer, and — on the first call only, if
    /// `auto_sync` is on — start the periodic re-sync task.
    ///
    /// No-op if the orchestrator has been [`destroy`](Self::destroy)ed, or if
    /// the state machine is already `SYNCING` and can't re-enter it (a resync
    /// race, or a caller starting the same device twice).
    pub async fn start_sync(self: &Arc<Self>, device_id: &str, device_name: &str) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !self.state_machine.can_transition(DaemonState::Syncing) {
            return Ok(());
        }
        self.state_machine.transition(
            DaemonState::Syncing,
            Some(PartialContext {
                device_id: Some(device_id.to_string()),
                device_name: Some(device_name.to_string()),
                sync_phase: Some(SyncPhase::Contacts),
                ..Default::default()
            }),
        )?;

        let (contacts_result, sms_result) = tokio::join!(
            async {
                if self.config.sync_contacts {
                    self.contacts.request_all_uids_timestamps(device_id).await
                } else {
                    Ok(())
                }
            },
            self.sms.request_conversations(device_id)
        );
        if let Err(e) = contacts_result {
            warn!(device_id, "contacts sync request failed: {e}");
        }
        if let Err(e) = sms_result {
            warn!(device_id, "conversation sync request failed: {e}");
        }

        self.arm_silence_timer(device_id.to_string()).await;

        if self.config.auto_sync {
            self.ensure_resync_task(device_id.to_string(), device_name.to_string())
                .await;
        }

        Ok(())
    }

    /// Call when a message or contacts update arrives for `device_id` mid
    /// sync: resets the silence timer and, for messages, advances the
    /// context's `sync_phase` from Contacts to Messages (spec.md §9's
    /// context-only SYNCING -> SYNCING update).
    pub async fn note_activity(self: &Arc<Self>, device_id: &str, phase: SyncPhase) {
        if !self.silence_cancel.read().await.contains_key(device_id) {
            return;
        }
        self.state_machine.update_context(PartialContext {
            sync_phase: Some(phase),
            ..Default::default()
        });
        self.arm_silence_timer(device_id.to_string()).await;
    }

    async fn arm_silence_timer(self: &Arc<Self>, device_id: String) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        // Inserting replaces (and drops) any prior sender for this device,
        // which cancels that device's in-flight timer task.
        self.silence_cancel
            .write()
            .await
            .insert(device_id.clone(), cancel_tx);

        let this = self.clone();
        let timeout = self.config.silence_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    this.on_silence(&device_id).await;
                }
                _ = cancel_rx => {}
            }
        });
    }

    async fn on_silence(&self, device_id: &str) {
        self.silence_cancel.write().await.remove(device_id);

        if self.state_machine.state() == DaemonState::Syncing {
            if let Err(e) = self.state_machine.transition(DaemonState::Ready, None) {
                debug!(device_id, "silence fired after state moved on: {e}");
            }
        }

        if let Err(e) = self
            .persistence
            .save_last_sync(device_id, current_timestamp_ms())
            .await
        {
            warn!(device_id, "failed to persist last sync time: {e}");
        }
    }

    async fn ensure_resync_task(self: &Arc<Self>, device_id: String, device_name: String) {
        let mut tasks = self.resync_tasks.write().await;
        if tasks.contains_key(&device_id) {
            return;
        }
        let this = self.clone();
        let interval = self.config.resync_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = this.start_sync(&device_id, &device_name).await {
                    warn!(device_id, "periodic resync failed: {e}");
                }
            }
        });
        tasks.insert(device_id, handle);
    }

    /// Cancel `device_id`'s silence timer and periodic resync, without
    /// forcing a state transition — the caller (typically the connection
    /// manager's `Disconnected` handler) decides what state follows.
    pub async fn stop_sync(&self, device_id: &str) {
        self.silence_cancel.write().await.remove(device_id);
        if let Some(handle) = self.resync_tasks.write().await.remove(device_id) {
            handle.abort();
        }
    }

    /// Stop every device's timers and mark the orchestrator destroyed, for
    /// daemon shutdown. Every subsequent `start_sync` call becomes a no-op.
    pub async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.silence_cancel.write().await.clear();
        let mut tasks = self.resync_tasks.write().await;
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::JsonFilePersistence;
    use crate::sink::PacketSink;
    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    struct RecordingSink(Mutex<Vec<String>>);

    #[async_trait]
    impl PacketSink for RecordingSink {
        async fn send_packet(&self, device_id: &str, _packet: crate::packet::Packet) -> Result<()> {
            self.0.lock().await.push(device_id.to_string());
            Ok(())
        }
    }

    fn orchestrator(config: SyncConfig) -> (Arc<SyncOrchestrator>, Arc<StateMachine>) {
        let dir = TempDir::new().unwrap();
        let persistence = Arc::new(JsonFilePersistence::new(dir.path().join("store.json")));
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let contacts = ContactsHandler::new(sink.clone(), persistence.clone());
        let sms = SmsHandler::new(sink, persistence.clone());
        let sm = Arc::new(StateMachine::new());
        sm.transition(DaemonState::Disconnected, None).unwrap();
        sm.transition(DaemonState::Discovering, None).unwrap();
        sm.transition(DaemonState::Connected, None).unwrap();
        let orchestrator = SyncOrchestrator::new(sm.clone(), contacts, sms, persistence, config);
        (orchestrator, sm)
    }

    #[tokio::test]
    async fn silence_completes_sync_and_transitions_to_ready() {
        let (orchestrator, sm) = orchestrator(SyncConfig {
            silence_timeout: Duration::from_millis(50),
            resync_interval: Duration::from_secs(600),
            sync_contacts: true,
            auto_sync: false,
        });

        orchestrator.start_sync("dev1", "Phone").await.unwrap();
        assert_eq!(sm.state(), DaemonState::Syncing);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sm.state(), DaemonState::Ready);
    }

    #[tokio::test]
    async fn activity_resets_silence_timer() {
        let (orchestrator, sm) = orchestrator(SyncConfig {
            silence_timeout: Duration::from_millis(80),
            resync_interval: Duration::from_secs(600),
            sync_contacts: true,
            auto_sync: false,
        });

        orchestrator.start_sync("dev1", "Phone").await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        orchestrator.note_activity("dev1", SyncPhase::Messages).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Still syncing: the reset at +50ms pushed completion to ~+130ms.
        assert_eq!(sm.state(), DaemonState::Syncing);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sm.state(), DaemonState::Ready);
    }

    #[tokio::test]
    async fn auto_sync_off_does_not_resync() {
        let dir = TempDir::new().unwrap();
        let persistence = Arc::new(JsonFilePersistence::new(dir.path().join("store.json")));
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let contacts = ContactsHandler::new(sink.clone(), persistence.clone());
        let sms = SmsHandler::new(sink.clone(), persistence.clone());
        let sm = Arc::new(StateMachine::new());
        sm.transition(DaemonState::Disconnected, None).unwrap();
        sm.transition(DaemonState::Discovering, None).unwrap();
        sm.transition(DaemonState::Connected, None).unwrap();

        let orchestrator = SyncOrchestrator::new(
            sm,
            contacts,
            sms,
            persistence,
            SyncConfig {
                silence_timeout: Duration::from_millis(20),
                resync_interval: Duration::from_millis(40),
                sync_contacts: true,
                auto_sync: false,
            },
        );

        orchestrator.start_sync("dev1", "Phone").await.unwrap();
        let initial_calls = sink.0.lock().await.len();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sink.0.lock().await.len(), initial_calls);
    }

    #[tokio::test]
    async fn stop_sync_cancels_timers_without_forcing_a_transition() {
        let (orchestrator, sm) = orchestrator(SyncConfig {
            silence_timeout: Duration::from_millis(30),
            resync_interval: Duration::from_secs(600),
            sync_contacts: true,
            auto_sync: true,
        });

        orchestrator.start_sync("dev1", "Phone").await.unwrap();
        orchestrator.stop_sync("dev1").await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        // The timer was cancelled before it could fire, so nothing forced
        // READY; the state machine simply holds whatever it was left at.
        assert_eq!(sm.state(), DaemonState::Syncing);
    }

    #[tokio::test]
    async fn starting_sync_twice_while_still_syncing_is_a_no_op() {
        let (orchestrator, sm) = orchestrator(SyncConfig {
            silence_timeout: Duration::from_millis(200),
            resync_interval: Duration::from_secs(600),
            sync_contacts: true,
            auto_sync: false,
        });

        orchestrator.start_sync("dev1", "Phone").await.unwrap();
        assert_eq!(sm.state(), DaemonState::Syncing);
        let before = sm.context().last_transition_time;

        // Still well inside the silence window: the state machine can't
        // re-enter SYNCING from SYNCING, so this call must be a no-op
        // rather than resetting the silence timer or re-requesting sync.
        orchestrator.start_sync("dev1", "Phone").await.unwrap();
        assert_eq!(sm.state(), DaemonState::Syncing);
        assert_eq!(sm.context().last_transition_time, before);
    }

    #[tokio::test]
    async fn destroyed_orchestrator_ignores_start_sync() {
        let (orchestrator, sm) = orchestrator(SyncConfig {
            silence_timeout: Duration::from_millis(30),
            resync_interval: Duration::from_secs(600),
            sync_contacts: true,
            auto_sync: false,
        });

        orchestrator.destroy().await;
        orchestrator.start_sync("dev1", "Phone").await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(sm.state(), DaemonState::Connected);
    }
}
