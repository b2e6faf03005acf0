//! Connection Manager (spec.md §4.E).
//!
//! Owns the outer TCP listener, the outgoing dial path, the per-peer
//! handshake (in both directions, with bit-exact role inversion), and the
//! live connection table. Handlers never see a `TcpStream` or
//! `TlsConnection` directly — they go through [`PacketSink`], which this
//! type implements.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::connection::events::ConnectionEvent;
use crate::crypto::Identity;
use crate::discovery::DiscoveredDevice;
use crate::error::{NetworkError, ProtocolError, Result};
use crate::packet::{create_identity_packet, validate_identity_packet, IdentityParams, Packet};
use crate::router::PacketRouter;
use crate::sink::PacketSink;
use crate::transport::tls::{self, Role, TlsConnection, UpgradeParams};
use crate::transport::{read_line_raw, write_packet_raw};

const PORT_RANGE: RangeInclusive<u16> = 1716..=1764;
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A live, established device connection as seen from outside the manager.
#[derive(Debug, Clone)]
pub struct DeviceConnection {
    pub device_id: String,
    pub device_name: String,
    pub protocol_version: u32,
    pub peer_cert_pem: String,
    pub address: SocketAddr,
}

enum Command {
    Send(Packet),
    Close,
}

struct ActiveConnection {
    command_tx: mpsc::UnboundedSender<Command>,
    snapshot: DeviceConnection,
}

pub struct ConnectionManager {
    identity: Identity,
    device_name: String,
    handshake_timeout: Duration,
    connections: RwLock<HashMap<String, ActiveConnection>>,
    router: Arc<PacketRouter>,
    events: broadcast::Sender<ConnectionEvent>,
    port: RwLock<Option<u16>>,
}

impl ConnectionManager {
    pub fn new(identity: Identity, device_name: String, router: Arc<PacketRouter>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            identity,
            device_name,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            connections: RwLock::new(HashMap::new()),
            router,
            events,
            port: RwLock::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    /// Bind the first free TCP port in 1716..=1764 and spawn the accept loop.
    /// `NetworkError::BindFailed` if the whole range is taken.
    pub async fn start(self: &Arc<Self>) -> Result<u16> {
        for candidate in PORT_RANGE {
            match TcpListener::bind(("0.0.0.0", candidate)).await {
                Ok(listener) => {
                    *self.port.write().await = Some(candidate);
                    info!(port = candidate, "connection manager listening");
                    let this = self.clone();
                    tokio::spawn(async move { this.accept_loop(listener).await });
                    return Ok(candidate);
                }
                Err(_) => continue,
            }
        }
        Err(NetworkError::BindFailed(format!(
            "no free TCP port in {}..={}",
            PORT_RANGE.start(),
            PORT_RANGE.end()
        ))
        .into())
    }

    pub async fn tcp_port(&self) -> Option<u16> {
        *self.port.read().await
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (socket, addr) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            let this = self.clone();
            // A failed handshake with one peer must never bring down the
            // accept loop or touch any other in-flight handshake.
            tokio::spawn(async move {
                if let Err(e) = this.handle_incoming(socket, addr).await {
                    warn!(%addr, "incoming handshake failed: {e}");
                }
            });
        }
    }

    /// Peer dialed us: we accepted the outer TCP connection, so per the
    /// role-inversion rule we play TLS **client**.
    async fn handle_incoming(self: &Arc<Self>, mut socket: TcpStream, addr: SocketAddr) -> Result<()> {
        let line = read_line_raw(&mut socket).await?;
        let pre_tls = Packet::parse(&line)?;
        let pre_identity = validate_identity_packet(&pre_tls)?;

        let mut tls = tls::upgrade(
            socket,
            UpgradeParams {
                cert_pem: &self.identity.cert_pem,
                key_pem: &self.identity.key_pem,
                role: Role::Client,
                timeout: self.handshake_timeout,
            },
        )
        .await?;

        let our_identity = self.identity_packet().await;
        // Neither side should have to block a write on the other's read:
        // exchange concurrently so either send/receive order is tolerated.
        let (send_result, recv_result) =
            tokio::join!(tls.send_packet(&our_identity), tls.receive_packet());
        send_result?;
        let post_identity = validate_identity_packet(&recv_result?)?;

        self.verify_identity_consistency(&pre_identity.device_id, &post_identity, &tls)?;

        self.finish_handshake(
            tls,
            post_identity.device_id,
            post_identity.device_name,
            post_identity.protocol_version,
            addr,
        )
        .await
    }

    /// We dialed the peer: we originated the outer TCP connection, so per
    /// the role-inversion rule we play TLS **server**.
    pub async fn connect_to_device(self: &Arc<Self>, device: &DiscoveredDevice) -> Result<()> {
        let mut socket = TcpStream::connect(device.address).await.map_err(|e| {
            NetworkError::ConnectionFailed(format!("dial {}: {e}", device.address))
        })?;

        write_packet_raw(&mut socket, &self.identity_packet().await).await?;

        let mut tls = tls::upgrade(
            socket,
            UpgradeParams {
                cert_pem: &self.identity.cert_pem,
                key_pem: &self.identity.key_pem,
                role: Role::Server,
                timeout: self.handshake_timeout,
            },
        )
        .await?;

        let our_identity = self.identity_packet().await;
        let (send_result, recv_result) =
            tokio::join!(tls.send_packet(&our_identity), tls.receive_packet());
        send_result?;
        let post_identity = validate_identity_packet(&recv_result?)?;

        self.verify_identity_consistency(&device.device_id, &post_identity, &tls)?;

        self.finish_handshake(
            tls,
            post_identity.device_id,
            post_identity.device_name,
            post_identity.protocol_version,
            device.address,
        )
        .await
    }

    async fn identity_packet(&self) -> Packet {
        let tcp_port = self.port.read().await.unwrap_or(0);
        create_identity_packet(IdentityParams {
            device_id: &self.identity.device_id,
            device_name: &self.device_name,
            tcp_port,
        })
    }

    /// The post-TLS identity's `deviceId` must agree both with the peer
    /// certificate's CN (bound identity) and with `expected_device_id` (the
    /// pre-TLS identity on the accept side, or the discovery record on the
    /// dial side). Either disagreement aborts the handshake.
    fn verify_identity_consistency(
        &self,
        expected_device_id: &str,
        post_identity: &crate::packet::Identity,
        tls: &TlsConnection,
    ) -> Result<()> {
        let peer_device_id = tls.peer_device_id()?;
        if peer_device_id != post_identity.device_id {
            return Err(ProtocolError::VersionMismatch(format!(
                "peer certificate CN '{peer_device_id}' does not match identity deviceId '{}'",
                post_identity.device_id
            )));
        }
        if post_identity.device_id != expected_device_id {
            return Err(ProtocolError::VersionMismatch(format!(
                "post-TLS identity deviceId '{}' does not match pre-handshake deviceId '{expected_device_id}'",
                post_identity.device_id
            )));
        }
        Ok(())
    }

    /// Register the connection (newest-connection-wins: any prior entry for
    /// this device id is told to close), fire `Connected`, and spawn its
    /// receive loop.
    async fn finish_handshake(
        self: &Arc<Self>,
        tls: TlsConnection,
        device_id: String,
        device_name: String,
        protocol_version: u32,
        addr: SocketAddr,
    ) -> Result<()> {
        let snapshot = DeviceConnection {
            device_id: device_id.clone(),
            device_name: device_name.clone(),
            protocol_version,
            peer_cert_pem: tls.peer_cert_pem().to_string(),
            address: addr,
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let my_tx = command_tx.clone();

        let previous = self.connections.write().await.insert(
            device_id.clone(),
            ActiveConnection {
                command_tx,
                snapshot,
            },
        );
        if let Some(previous) = previous {
            let _ = previous.command_tx.send(Command::Close);
        }

        self.router.reset_buffer(&device_id).await;
        info!(device_id = %device_id, %addr, "device connected");
        let _ = self.events.send(ConnectionEvent::Connected {
            device_id: device_id.clone(),
            device_name,
            protocol_version,
        });

        let this = self.clone();
        tokio::spawn(async move { this.run_connection(device_id, tls, command_rx, my_tx).await });

        Ok(())
    }

    async fn run_connection(
        self: Arc<Self>,
        device_id: String,
        mut tls: TlsConnection,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
        my_tx: mpsc::UnboundedSender<Command>,
    ) {
        loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(Command::Send(packet)) => {
                            if let Err(e) = tls.send_packet(&packet).await {
                                warn!(device_id = %device_id, "send failed, closing connection: {e}");
                                break;
                            }
                        }
                        Some(Command::Close) | None => break,
                    }
                }
                received = tls.receive_packet() => {
                    match received {
                        Ok(packet) => {
                            let _ = self.events.send(ConnectionEvent::PacketReceived {
                                device_id: device_id.clone(),
                                packet: packet.clone(),
                            });
                            self.router.dispatch_packet(&device_id, &packet).await;
                        }
                        Err(ProtocolError::InvalidPacket(msg)) => {
                            warn!(device_id = %device_id, "dropping unparseable packet: {msg}");
                        }
                        Err(e) => {
                            debug!(device_id = %device_id, "connection closed: {e}");
                            break;
                        }
                    }
                }
            }
        }

        let _ = tls.shutdown().await;
        self.teardown(&device_id, &my_tx).await;
    }

    /// Remove the connection table entry and fire `Disconnected` exactly
    /// once, but only if the entry still belongs to this run: a
    /// newest-connection-wins replacement already overwrote the map, and
    /// the replaced connection's own teardown must not clobber it or emit a
    /// spurious event for a device that is, from the outside, still
    /// connected.
    async fn teardown(&self, device_id: &str, my_tx: &mpsc::UnboundedSender<Command>) {
        let mut connections = self.connections.write().await;
        let owns_entry = connections
            .get(device_id)
            .map(|c| c.command_tx.same_channel(my_tx))
            .unwrap_or(false);
        if !owns_entry {
            return;
        }
        connections.remove(device_id);
        drop(connections);

        self.router.reset_buffer(device_id).await;
        info!(device_id, "device disconnected");
        let _ = self.events.send(ConnectionEvent::Disconnected {
            device_id: device_id.to_string(),
        });
    }

    pub async fn has_connection(&self, device_id: &str) -> bool {
        self.connections.read().await.contains_key(device_id)
    }

    pub async fn snapshot(&self, device_id: &str) -> Option<DeviceConnection> {
        self.connections
            .read()
            .await
            .get(device_id)
            .map(|c| c.snapshot.clone())
    }

    pub async fn connected_devices(&self) -> Vec<DeviceConnection> {
        self.connections
            .read()
            .await
            .values()
            .map(|c| c.snapshot.clone())
            .collect()
    }

    pub async fn disconnect(&self, device_id: &str) {
        if let Some(conn) = self.connections.read().await.get(device_id) {
            let _ = conn.command_tx.send(Command::Close);
        }
    }

    pub async fn stop(&self) {
        let connections = self.connections.read().await;
        for conn in connections.values() {
            let _ = conn.command_tx.send(Command::Close);
        }
    }
}

#[async_trait]
impl PacketSink for ConnectionManager {
    async fn send_packet(&self, device_id: &str, packet: Packet) -> Result<()> {
        let tx = self
            .connections
            .read()
            .await
            .get(device_id)
            .map(|c| c.command_tx.clone());
        match tx {
            Some(tx) => tx
                .send(Command::Send(packet))
                .map_err(|_| ProtocolError::DeviceNotFound(device_id.to_string())),
            None => Err(ProtocolError::DeviceNotFound(device_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_certificate;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::time::{timeout, Duration};

    fn identity(device_id: &str) -> Identity {
        let cert = generate_certificate(device_id).unwrap();
        Identity {
            device_id: device_id.to_string(),
            cert_pem: cert.cert_pem,
            key_pem: cert.key_pem,
        }
    }

    #[tokio::test]
    async fn dial_and_accept_complete_a_role_inverted_handshake() {
        let a_id = "a".repeat(32);
        let b_id = "b".repeat(32);

        let a_router = Arc::new(PacketRouter::new());
        let b_router = Arc::new(PacketRouter::new());
        let a = ConnectionManager::new(identity(&a_id), "Device A".into(), a_router);
        let b = ConnectionManager::new(identity(&b_id), "Device B".into(), b_router);

        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();

        let b_port = b.start().await.unwrap();
        a.start().await.unwrap();

        let b_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), b_port);
        let discovered = DiscoveredDevice {
            device_id: b_id.clone(),
            device_name: "Device B".into(),
            device_type: "desktop".into(),
            protocol_version: crate::packet::PROTOCOL_VERSION,
            tcp_port: b_port,
            address: b_addr,
        };

        a.connect_to_device(&discovered).await.unwrap();

        let a_event = timeout(Duration::from_secs(2), a_events.recv()).await.unwrap().unwrap();
        match a_event {
            ConnectionEvent::Connected { device_id, .. } => assert_eq!(device_id, b_id),
            other => panic!("expected Connected, got {other:?}"),
        }

        let b_event = timeout(Duration::from_secs(2), b_events.recv()).await.unwrap().unwrap();
        match b_event {
            ConnectionEvent::Connected { device_id, .. } => assert_eq!(device_id, a_id),
            other => panic!("expected Connected, got {other:?}"),
        }

        assert!(a.has_connection(&b_id).await);
        assert!(b.has_connection(&a_id).await);
    }

    #[tokio::test]
    async fn newest_connection_replaces_prior_without_double_disconnect_event() {
        let a_id = "a".repeat(32);
        let b_id = "b".repeat(32);

        let a_router = Arc::new(PacketRouter::new());
        let b_router = Arc::new(PacketRouter::new());
        let a = ConnectionManager::new(identity(&a_id), "Device A".into(), a_router);
        let b = ConnectionManager::new(identity(&b_id), "Device B".into(), b_router);

        let mut b_events = b.subscribe();
        let b_port = b.start().await.unwrap();
        a.start().await.unwrap();

        let b_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), b_port);
        let discovered = DiscoveredDevice {
            device_id: b_id.clone(),
            device_name: "Device B".into(),
            device_type: "desktop".into(),
            protocol_version: crate::packet::PROTOCOL_VERSION,
            tcp_port: b_port,
            address: b_addr,
        };

        a.connect_to_device(&discovered).await.unwrap();
        timeout(Duration::from_secs(2), b_events.recv()).await.unwrap().unwrap();

        // Second dial from the same peer id replaces the first connection.
        a.connect_to_device(&discovered).await.unwrap();
        timeout(Duration::from_secs(2), b_events.recv()).await.unwrap().unwrap();

        assert!(b.has_connection(&a_id).await);
    }
}
