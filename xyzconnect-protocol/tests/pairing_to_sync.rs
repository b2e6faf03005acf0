//! Pairing through to a completed sync session, wired the way
//! `xyzconnect-daemon` wires it: a pairing acceptance flips trust, which
//! unblocks `SyncOrchestrator::start_sync`, which settles to `READY` once
//! the silence window passes with no further activity.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Mutex;

use xyzconnect_protocol::crypto::generate_certificate;
use xyzconnect_protocol::handlers::{ContactsHandler, SmsHandler};
use xyzconnect_protocol::packet::Packet;
use xyzconnect_protocol::pairing::{PairingEvent, PairingHandler};
use xyzconnect_protocol::persistence::JsonFilePersistence;
use xyzconnect_protocol::sink::PacketSink;
use xyzconnect_protocol::state_machine::{DaemonState, StateMachine};
use xyzconnect_protocol::sync::{SyncConfig, SyncOrchestrator};
use xyzconnect_protocol::Result;

struct RecordingSink(Mutex<Vec<(String, Packet)>>);

#[async_trait]
impl PacketSink for RecordingSink {
    async fn send_packet(&self, device_id: &str, packet: Packet) -> Result<()> {
        self.0.lock().await.push((device_id.to_string(), packet));
        Ok(())
    }
}

#[tokio::test]
async fn accepted_pairing_unblocks_sync_which_settles_to_ready_after_silence() {
    let trust_dir = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();

    let our = generate_certificate("a".repeat(32).as_str()).unwrap();
    let peer = generate_certificate("b".repeat(32).as_str()).unwrap();

    let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
    let pairing = Arc::new(PairingHandler::with_timeout(
        trust_dir.path().to_path_buf(),
        our.cert_pem.clone(),
        sink.clone(),
        Duration::from_secs(30),
    ));
    let mut pairing_events = pairing.subscribe();

    let persistence = Arc::new(JsonFilePersistence::new(store_dir.path().join("store.json")));
    let contacts = ContactsHandler::new(sink.clone(), persistence.clone());
    let sms = SmsHandler::new(sink.clone(), persistence.clone());

    let state_machine = Arc::new(StateMachine::new());
    state_machine.transition(DaemonState::Disconnected, None).unwrap();
    state_machine.transition(DaemonState::Discovering, None).unwrap();
    state_machine.transition(DaemonState::Connected, None).unwrap();

    let sync = SyncOrchestrator::new(
        state_machine.clone(),
        contacts,
        sms,
        persistence,
        SyncConfig {
            silence_timeout: Duration::from_millis(80),
            resync_interval: Duration::from_secs(600),
            sync_contacts: true,
            auto_sync: false,
        },
    );

    assert!(!pairing.is_paired("phone"));

    // Peer initiates pairing; we accept it.
    let request = Packet::new("kdeconnect.pair", serde_json::json!({ "pair": true }));
    pairing
        .handle_pairing_packet("phone", "Phone", &request, Some(&peer.cert_pem))
        .await
        .unwrap();
    pairing
        .accept_incoming_pairing("phone", &peer.cert_pem)
        .await
        .unwrap();
    assert!(pairing.is_paired("phone"));

    match pairing_events.recv().await.unwrap() {
        PairingEvent::IncomingRequest { device_id, .. } => assert_eq!(device_id, "phone"),
        other => panic!("expected IncomingRequest first, got {other:?}"),
    }
    match pairing_events.recv().await.unwrap() {
        PairingEvent::Result { device_id, accepted } => {
            assert_eq!(device_id, "phone");
            assert!(accepted);
        }
        other => panic!("expected Result, got {other:?}"),
    }

    // Now that we're paired, start the sync the daemon's pairing-event loop
    // would kick off.
    sync.start_sync("phone", "Phone").await.unwrap();
    assert_eq!(state_machine.state(), DaemonState::Syncing);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(state_machine.state(), DaemonState::Ready);

    // The contacts + conversation requests and the pairing handshake packets
    // all went out over the same sink.
    let sent = sink.0.lock().await;
    let types: Vec<&str> = sent.iter().map(|(_, p)| p.packet_type.as_str()).collect();
    assert!(types.contains(&"kdeconnect.contacts.request_all_uids_timestamps"));
    assert!(types.contains(&"kdeconnect.sms.request_conversations"));
    assert!(types.contains(&"kdeconnect.pair"));
}

#[tokio::test]
async fn unpair_stops_sync_without_forcing_a_state_transition() {
    let trust_dir = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();

    let our = generate_certificate("a".repeat(32).as_str()).unwrap();
    let peer = generate_certificate("b".repeat(32).as_str()).unwrap();
    let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));

    let pairing = Arc::new(PairingHandler::new(
        trust_dir.path().to_path_buf(),
        our.cert_pem.clone(),
        sink.clone(),
    ));
    let request = Packet::new("kdeconnect.pair", serde_json::json!({ "pair": true }));
    pairing
        .handle_pairing_packet("phone", "Phone", &request, Some(&peer.cert_pem))
        .await
        .unwrap();
    pairing
        .accept_incoming_pairing("phone", &peer.cert_pem)
        .await
        .unwrap();

    let persistence = Arc::new(JsonFilePersistence::new(store_dir.path().join("store.json")));
    let contacts = ContactsHandler::new(sink.clone(), persistence.clone());
    let sms = SmsHandler::new(sink.clone(), persistence.clone());
    let state_machine = Arc::new(StateMachine::new());
    state_machine.transition(DaemonState::Disconnected, None).unwrap();
    state_machine.transition(DaemonState::Discovering, None).unwrap();
    state_machine.transition(DaemonState::Connected, None).unwrap();

    let sync = SyncOrchestrator::new(
        state_machine.clone(),
        contacts,
        sms,
        persistence,
        SyncConfig {
            silence_timeout: Duration::from_millis(60),
            resync_interval: Duration::from_secs(600),
            sync_contacts: true,
            auto_sync: false,
        },
    );
    sync.start_sync("phone", "Phone").await.unwrap();

    pairing.unpair("phone").await.unwrap();
    sync.stop_sync("phone").await;
    assert!(!pairing.is_paired("phone"));

    tokio::time::sleep(Duration::from_millis(150)).await;
    // Silence timer was cancelled by stop_sync before it could fire.
    assert_eq!(state_machine.state(), DaemonState::Syncing);
}
