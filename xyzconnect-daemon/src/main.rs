mod config;
mod error;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tracing::{debug, info, warn};

use xyzconnect_protocol::connection::ConnectionEvent;
use xyzconnect_protocol::discovery::DiscoveryEvent;
use xyzconnect_protocol::handlers::{ContactsHandler, NotificationsHandler, SmsHandler};
use xyzconnect_protocol::pairing::PairingEvent;
use xyzconnect_protocol::persistence::JsonFilePersistence;
use xyzconnect_protocol::router::PacketHandler;
use xyzconnect_protocol::state_machine::{DaemonState, PartialContext, SyncPhase};
use xyzconnect_protocol::sync::SyncOrchestrator;
use xyzconnect_protocol::{
    crypto, known_devices, persistence, Discovery, Packet, PacketRouter, PacketSink,
    PairingHandler, StateMachine,
};
use xyzconnect_protocol::ConnectionManager;

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "xyzconnect-daemon", about = "KDE Connect compatible desktop sync daemon")]
struct Cli {
    /// Override the advertised device name from the config file.
    #[arg(long)]
    device_name: Option<String>,

    /// Use per-non-loopback-interface UDP broadcast instead of a single
    /// 255.255.255.255 send (spec.md §9).
    #[arg(long)]
    per_interface_broadcast: bool,

    /// Raise log verbosity one notch past the `RUST_LOG`/default filter.
    #[arg(short, long)]
    verbose: bool,
}

/// Forwards `kdeconnect.pair` packets from the router into the pairing
/// handler, filling in the device name and peer certificate the pairing
/// handler's own signature needs but the router's dispatch does not carry.
struct PairingPacketHandler {
    pairing: Arc<PairingHandler>,
    connections: Arc<ConnectionManager>,
}

#[async_trait]
impl PacketHandler for PairingPacketHandler {
    async fn handle(&self, device_id: &str, packet: &Packet) {
        let snapshot = self.connections.snapshot(device_id).await;
        let (device_name, peer_cert_pem) = match &snapshot {
            Some(conn) => (conn.device_name.as_str(), Some(conn.peer_cert_pem.as_str())),
            None => (device_id, None),
        };
        if let Err(e) = self
            .pairing
            .handle_pairing_packet(device_id, device_name, packet, peer_cert_pem)
            .await
        {
            warn!(device_id, "failed to handle pairing packet: {e}");
        }
    }
}

/// Main daemon state: every piece SPEC_FULL.md §4 names, wired together.
struct Daemon {
    config: Config,
    state_machine: Arc<StateMachine>,
    connections: Arc<ConnectionManager>,
    discovery: Arc<Discovery>,
    pairing: Arc<PairingHandler>,
    contacts: Arc<ContactsHandler>,
    sms: Arc<SmsHandler>,
    notifications: Arc<NotificationsHandler>,
    sync: Arc<SyncOrchestrator>,
}

impl Daemon {
    async fn new(config: Config, cli: &Cli) -> Result<Self> {
        config.ensure_directories().context("failed to create directories")?;

        let device_id = match &config.device.device_id {
            Some(id) => id.clone(),
            None => crypto::load_or_create_device_id(&config.paths.config_dir)
                .context("failed to load or create device id")?,
        };
        let identity = crypto::load_or_create_certificate(
            &config.certificate_path(),
            &config.private_key_path(),
            &device_id,
        )
        .context("failed to load or create certificate")?;

        let device_name = cli.device_name.clone().unwrap_or_else(|| config.device.name.clone());
        let our_cert_pem = identity.cert_pem.clone();

        let router = Arc::new(PacketRouter::new());
        let connections = ConnectionManager::new(identity, device_name.clone(), router.clone());

        let persistence: Arc<dyn persistence::Persistence> = Arc::new(JsonFilePersistence::new(
            persistence::default_path(&config.paths.data_dir),
        ));

        let contacts = ContactsHandler::new(connections.clone() as Arc<dyn PacketSink>, persistence.clone());
        let sms = SmsHandler::new(connections.clone() as Arc<dyn PacketSink>, persistence.clone());
        let notifications =
            NotificationsHandler::new(connections.clone() as Arc<dyn PacketSink>, persistence.clone());

        let pairing = Arc::new(PairingHandler::with_timeout(
            config.paths.config_dir.join("trusted"),
            our_cert_pem,
            connections.clone() as Arc<dyn PacketSink>,
            std::time::Duration::from_secs(config.sync.pairing_timeout_secs),
        ));

        router
            .register("kdeconnect.contacts.response_uids_timestamps", contacts.clone())
            .await;
        router.register("kdeconnect.contacts.response_vcards", contacts.clone()).await;
        router.register("kdeconnect.sms.messages", sms.clone()).await;
        router.register("kdeconnect.sms.send_status", sms.clone()).await;
        router.register("kdeconnect.notification", notifications.clone()).await;
        router
            .register(
                "kdeconnect.pair",
                Arc::new(PairingPacketHandler {
                    pairing: pairing.clone(),
                    connections: connections.clone(),
                }),
            )
            .await;

        let state_machine = Arc::new(StateMachine::new());
        let sync = SyncOrchestrator::new(
            state_machine.clone(),
            contacts.clone(),
            sms.clone(),
            persistence.clone(),
            config.sync_config(),
        );

        let per_interface_broadcast = cli.per_interface_broadcast || config.network.per_interface_broadcast;
        let discovery_config = config.discovery_config(per_interface_broadcast);
        let tcp_port = connections.start().await.context("failed to start connection manager")?;
        let discovery = Discovery::bind(device_id, device_name, tcp_port, discovery_config)
            .await
            .context("failed to bind discovery socket")?;

        Ok(Self {
            config,
            state_machine,
            connections,
            discovery,
            pairing,
            contacts,
            sms,
            notifications,
            sync,
        })
    }

    /// Spawn the event-wiring tasks that drive state transitions and sync
    /// from connection/discovery/pairing activity.
    fn start(self: &Arc<Self>) {
        self.discovery.start();

        self.state_machine
            .transition(DaemonState::Disconnected, None)
            .expect("Init -> Disconnected is always legal");
        self.state_machine
            .transition(DaemonState::Discovering, None)
            .expect("Disconnected -> Discovering is always legal");

        let this = self.clone();
        tokio::spawn(async move { this.discovery_loop().await });

        let this = self.clone();
        tokio::spawn(async move { this.connection_loop().await });

        let this = self.clone();
        tokio::spawn(async move { this.pairing_loop().await });
    }

    async fn discovery_loop(self: Arc<Self>) {
        let mut events = self.discovery.subscribe();
        loop {
            let event = match events.recv().await {
                Ok(e) => e,
                Err(_) => continue,
            };
            match event {
                DiscoveryEvent::DeviceFound(device) => {
                    if self.connections.has_connection(&device.device_id).await {
                        continue;
                    }
                    info!(device_id = %device.device_id, name = %device.device_name, "discovered device, dialing");
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.connections.connect_to_device(&device).await {
                            warn!(device_id = %device.device_id, "failed to connect: {e}");
                        }
                    });
                }
                DiscoveryEvent::DeviceLost { device_id } => {
                    debug!(device_id, "device lost from discovery table");
                }
            }
        }
    }

    async fn connection_loop(self: Arc<Self>) {
        let mut events = self.connections.subscribe();
        loop {
            let event = match events.recv().await {
                Ok(e) => e,
                Err(_) => continue,
            };
            match event {
                ConnectionEvent::Connected {
                    device_id,
                    device_name,
                    protocol_version,
                } => {
                    info!(device_id, device_name, protocol_version, "device connected");
                    let _ = known_devices::save(
                        known_devices::KnownDevice {
                            device_id: device_id.clone(),
                            device_name: device_name.clone(),
                            address: String::new(),
                            port: self.connections.tcp_port().await.unwrap_or(0),
                        },
                        &self.config.paths.data_dir.join("known_devices.json"),
                    );

                    if self.state_machine.can_transition(DaemonState::Connected) {
                        let _ = self.state_machine.transition(
                            DaemonState::Connected,
                            Some(PartialContext {
                                device_id: Some(device_id.clone()),
                                device_name: Some(device_name.clone()),
                                ..Default::default()
                            }),
                        );
                    }

                    if self.pairing.is_paired(&device_id) {
                        if let Err(e) = self.sync.start_sync(&device_id, &device_name).await {
                            warn!(device_id, "failed to start sync: {e}");
                        }
                    } else {
                        info!(device_id, "connected but not paired; awaiting pairing");
                    }
                }
                ConnectionEvent::Disconnected { device_id } => {
                    info!(device_id, "device disconnected");
                    self.sync.stop_sync(&device_id).await;
                    if self.state_machine.can_transition(DaemonState::Disconnected) {
                        let _ = self.state_machine.transition(DaemonState::Disconnected, None);
                        let _ = self.state_machine.transition(DaemonState::Discovering, None);
                    }
                }
                ConnectionEvent::PacketReceived { device_id, packet } => {
                    let phase = sync_phase_for(&packet.packet_type);
                    if let Some(phase) = phase {
                        self.sync.note_activity(&device_id, phase).await;
                    }
                }
            }
        }
    }

    async fn pairing_loop(self: Arc<Self>) {
        let mut events = self.pairing.subscribe();
        loop {
            let event = match events.recv().await {
                Ok(e) => e,
                Err(_) => continue,
            };
            match event {
                PairingEvent::IncomingRequest {
                    device_id,
                    device_name,
                    ..
                } => {
                    info!(device_id, device_name, "incoming pairing request awaiting local decision");
                }
                PairingEvent::Result { device_id, accepted } => {
                    info!(device_id, accepted, "pairing result");
                    if accepted {
                        if let Some(conn) = self.connections.snapshot(&device_id).await {
                            if let Err(e) = self.sync.start_sync(&device_id, &conn.device_name).await {
                                warn!(device_id, "failed to start sync after pairing: {e}");
                            }
                        }
                    }
                }
                PairingEvent::Unpaired { device_id } => {
                    info!(device_id, "device unpaired");
                    self.sync.stop_sync(&device_id).await;
                }
            }
        }
    }

    /// Send a `kdeconnect.ping` to `device_id`; outgoing-only capability,
    /// spec.md §1/§6, with no dedicated handler module of its own.
    #[allow(dead_code)]
    async fn send_ping(&self, device_id: &str) -> Result<()> {
        self.connections
            .send_packet(device_id, Packet::new("kdeconnect.ping", serde_json::json!({})))
            .await
            .context("failed to send ping")
    }

    /// Send a `kdeconnect.findmyphone.request`; outgoing-only capability.
    #[allow(dead_code)]
    async fn request_find_my_phone(&self, device_id: &str) -> Result<()> {
        self.connections
            .send_packet(
                device_id,
                Packet::new("kdeconnect.findmyphone.request", serde_json::json!({})),
            )
            .await
            .context("failed to send findmyphone request")
    }

    async fn run(self: &Arc<Self>) -> Result<()> {
        info!("xyzconnect daemon running");
        info!(device_name = %self.config.device.name, "device identity ready");
        let port = self.connections.tcp_port().await;
        info!(?port, "listening for peer connections");

        tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
        info!("received shutdown signal");
        Ok(())
    }

    async fn shutdown(&self) {
        info!("shutting down daemon");
        self.sync.destroy().await;
        self.pairing.cleanup().await;
        self.connections.stop().await;
        self.state_machine.destroy();
        info!("daemon shutdown complete");
    }
}

/// Which sync phase a `kdeconnect.*` packet type corresponds to, for
/// resetting the sync orchestrator's silence timer (spec.md §4.I).
fn sync_phase_for(packet_type: &str) -> Option<SyncPhase> {
    if packet_type.starts_with("kdeconnect.contacts.") {
        Some(SyncPhase::Contacts)
    } else if packet_type.starts_with("kdeconnect.sms.") {
        Some(SyncPhase::Messages)
    } else {
        None
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    info!("starting xyzconnect daemon");

    let config = Config::load().context("failed to load configuration")?;
    info!(device_name = %config.device.name, discovery_port = config.network.discovery_port, "configuration loaded");

    let daemon = Arc::new(Daemon::new(config, &cli).await.context("failed to create daemon")?);
    daemon.start();

    let result = daemon.run().await;
    daemon.shutdown().await;
    result
}
