//! Pairing handler (spec.md §4.G).
//!
//! Trust is purely file-presence based: a device is paired iff
//! `<trust_dir>/<deviceId>.pem` exists. That file survives daemon restarts,
//! which is exactly the durability spec.md §3's invariants require.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::crypto::public_key_der_hex;
use crate::error::{PairingError, ProtocolError, Result};
use crate::packet::{current_timestamp_ms, Packet};
use crate::pairing::events::PairingEvent;
use crate::pairing::key::generate_verification_key;
use crate::sink::PacketSink;

pub const DEFAULT_PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

/// An outgoing pairing request we're waiting on the peer to answer.
struct PendingPairing {
    verification_key: String,
    cancel: oneshot::Sender<()>,
}

/// An incoming pairing request waiting on the local user's decision.
#[derive(Debug, Clone)]
pub struct IncomingPairingRequest {
    pub device_id: String,
    pub device_name: String,
    pub timestamp_ms: i64,
}

pub struct PairingHandler {
    trust_dir: PathBuf,
    our_cert_pem: String,
    timeout: Duration,
    sink: Arc<dyn PacketSink>,
    events: broadcast::Sender<PairingEvent>,
    outgoing: RwLock<HashMap<String, PendingPairing>>,
    incoming: RwLock<HashMap<String, IncomingPairingRequest>>,
}

impl PairingHandler {
    pub fn new(trust_dir: PathBuf, our_cert_pem: String, sink: Arc<dyn PacketSink>) -> Self {
        Self::with_timeout(trust_dir, our_cert_pem, sink, DEFAULT_PAIRING_TIMEOUT)
    }

    pub fn with_timeout(
        trust_dir: PathBuf,
        our_cert_pem: String,
        sink: Arc<dyn PacketSink>,
        timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            trust_dir,
            our_cert_pem,
            timeout,
            sink,
            events,
            outgoing: RwLock::new(HashMap::new()),
            incoming: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PairingEvent> {
        self.events.subscribe()
    }

    fn trust_path(&self, device_id: &str) -> PathBuf {
        self.trust_dir.join(format!("{device_id}.pem"))
    }

    /// `true` iff a trust certificate for `device_id` exists on disk.
    pub fn is_paired(&self, device_id: &str) -> bool {
        self.trust_path(device_id).exists()
    }

    /// All device ids with a trust certificate on disk.
    pub fn load_trusted_devices(&self) -> Result<Vec<String>> {
        let mut result = Vec::new();
        if !self.trust_dir.exists() {
            return Ok(result);
        }
        for entry in std::fs::read_dir(&self.trust_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("pem") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    result.push(stem.to_string());
                }
            }
        }
        Ok(result)
    }

    /// Request pairing with `device_id`, whose peer certificate is
    /// `peer_cert_pem` (taken from the already-established TLS connection).
    pub async fn request_pairing(
        &self,
        device_id: &str,
        peer_cert_pem: Option<&str>,
    ) -> std::result::Result<(), PairingError> {
        if self.is_paired(device_id) {
            return Err(PairingError::AlreadyPaired);
        }
        let peer_cert_pem = peer_cert_pem.ok_or(PairingError::NoPeerCert)?;

        // Reset the peer's belief first, in case we deleted our copy of
        // their trust locally while they still think we're paired.
        let unpair = Packet::new("kdeconnect.pair", serde_json::json!({ "pair": false }));
        let _ = self.sink.send_packet(device_id, unpair).await;

        let now_ms = current_timestamp_ms();
        let verification_key = generate_verification_key(&self.our_cert_pem, peer_cert_pem, now_ms)
            .map_err(|_| PairingError::NoPeerCert)?;

        let request = Packet::new(
            "kdeconnect.pair",
            serde_json::json!({ "pair": true, "timestamp": now_ms / 1000 }),
        );
        self.sink
            .send_packet(device_id, request)
            .await
            .map_err(|_| PairingError::NoPeerCert)?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        {
            let mut outgoing = self.outgoing.write().await;
            outgoing.insert(
                device_id.to_string(),
                PendingPairing {
                    verification_key: verification_key.clone(),
                    cancel: cancel_tx,
                },
            );
        }
        info!(device_id, verification_key, "pairing requested");

        self.arm_timeout(device_id.to_string(), cancel_rx);
        Ok(())
    }

    fn arm_timeout(&self, device_id: String, cancel_rx: oneshot::Receiver<()>) {
        let timeout = self.timeout;
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    info!(device_id = %device_id, "pairing request timed out");
                    let _ = events.send(PairingEvent::Result {
                        device_id,
                        accepted: false,
                    });
                }
                _ = cancel_rx => {
                    debug!(device_id = %device_id, "pairing timeout canceled");
                }
            }
        });
    }

    /// Handle an incoming `kdeconnect.pair` packet.
    ///
    /// `peer_cert_pem` is the certificate presented on the TLS connection
    /// this packet arrived on; required to store trust on acceptance.
    pub async fn handle_pairing_packet(
        &self,
        device_id: &str,
        device_name: &str,
        packet: &Packet,
        peer_cert_pem: Option<&str>,
    ) -> Result<()> {
        let pair = packet
            .body
            .get("pair")
            .and_then(serde_json::Value::as_bool)
            .ok_or_else(|| ProtocolError::InvalidPacket("pair packet missing pair field".into()))?;

        if !pair {
            let pending = {
                let mut outgoing = self.outgoing.write().await;
                outgoing.remove(device_id)
            };
            if let Some(pending) = pending {
                let _ = pending.cancel.send(());
                let _ = self.events.send(PairingEvent::Result {
                    device_id: device_id.to_string(),
                    accepted: false,
                });
            } else {
                self.remove_trust(device_id)?;
                let _ = self.events.send(PairingEvent::Unpaired {
                    device_id: device_id.to_string(),
                });
            }
            return Ok(());
        }

        // pair == true
        let pending = {
            let mut outgoing = self.outgoing.write().await;
            outgoing.remove(device_id)
        };
        if let Some(pending) = pending {
            let _ = pending.cancel.send(());
            if let Some(cert) = peer_cert_pem {
                self.store_trust(device_id, cert)?;
            }
            let _ = self.events.send(PairingEvent::Result {
                device_id: device_id.to_string(),
                accepted: true,
            });
            return Ok(());
        }

        if self.is_paired(device_id) {
            // Duplicate acceptance/retransmit with no pending request:
            // idempotent no-op, first acceptance already won.
            debug!(device_id, "duplicate pair:true for already-paired device, ignoring");
            return Ok(());
        }

        // Peer-initiated pairing: enqueue, do not auto-respond.
        let mut incoming = self.incoming.write().await;
        incoming.insert(
            device_id.to_string(),
            IncomingPairingRequest {
                device_id: device_id.to_string(),
                device_name: device_name.to_string(),
                timestamp_ms: current_timestamp_ms(),
            },
        );
        drop(incoming);
        let _ = self.events.send(PairingEvent::IncomingRequest {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            timestamp_ms: current_timestamp_ms(),
        });
        Ok(())
    }

    /// User accepted an incoming pairing request.
    pub async fn accept_incoming_pairing(
        &self,
        device_id: &str,
        peer_cert_pem: &str,
    ) -> Result<()> {
        let mut incoming = self.incoming.write().await;
        incoming
            .remove(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
        drop(incoming);

        self.store_trust(device_id, peer_cert_pem)?;
        let accept = Packet::new("kdeconnect.pair", serde_json::json!({ "pair": true }));
        self.sink.send_packet(device_id, accept).await?;
        let _ = self.events.send(PairingEvent::Result {
            device_id: device_id.to_string(),
            accepted: true,
        });
        Ok(())
    }

    /// User rejected an incoming pairing request.
    pub async fn reject_incoming_pairing(&self, device_id: &str) -> Result<()> {
        let mut incoming = self.incoming.write().await;
        incoming.remove(device_id);
        drop(incoming);

        let reject = Packet::new("kdeconnect.pair", serde_json::json!({ "pair": false }));
        let _ = self.sink.send_packet(device_id, reject).await;
        let _ = self.events.send(PairingEvent::Result {
            device_id: device_id.to_string(),
            accepted: false,
        });
        Ok(())
    }

    /// Unpair from `device_id`: best-effort notify, then remove trust.
    pub async fn unpair(&self, device_id: &str) -> Result<()> {
        let unpair = Packet::new("kdeconnect.pair", serde_json::json!({ "pair": false }));
        let _ = self.sink.send_packet(device_id, unpair).await;
        self.remove_trust(device_id)?;
        let _ = self.events.send(PairingEvent::Unpaired {
            device_id: device_id.to_string(),
        });
        Ok(())
    }

    fn store_trust(&self, device_id: &str, cert_pem: &str) -> Result<()> {
        std::fs::create_dir_all(&self.trust_dir)?;
        let path = self.trust_path(device_id);
        std::fs::write(&path, cert_pem)?;
        set_mode(&path, 0o644)?;
        Ok(())
    }

    fn remove_trust(&self, device_id: &str) -> Result<()> {
        let path = self.trust_path(device_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Cancel all outstanding timers and empty the in-memory queues.
    pub async fn cleanup(&self) {
        let mut outgoing = self.outgoing.write().await;
        for (_, pending) in outgoing.drain() {
            let _ = pending.cancel.send(());
        }
        let mut incoming = self.incoming.write().await;
        incoming.clear();
    }

    /// Expose our SPKI hex for diagnostics/fingerprint display.
    pub fn our_public_key_hex(&self) -> Result<String> {
        public_key_der_hex(&self.our_cert_pem)
    }
}

#[cfg(unix)]
fn set_mode(path: &std::path::Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &std::path::Path, _mode: u32) -> Result<()> {
    Ok(())
}
