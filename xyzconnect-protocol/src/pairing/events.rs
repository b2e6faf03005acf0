//! Pairing event types, fanned out over a [`tokio::sync::broadcast`] channel
//! so the state machine, sync orchestrator, and an eventual IPC layer can
//! each hold their own subscription.

#[derive(Debug, Clone)]
pub enum PairingEvent {
    /// A peer asked to pair with us; awaits `accept_incoming_pairing` or
    /// `reject_incoming_pairing`.
    IncomingRequest {
        device_id: String,
        device_name: String,
        timestamp_ms: i64,
    },

    /// The result of a pairing we requested, or of a peer's response to our
    /// request. `accepted = false` covers both explicit rejection and
    /// timeout.
    Result {
        device_id: String,
        accepted: bool,
    },

    /// The device was unpaired (by us, or by the peer sending `pair:false`
    /// with no pairing in flight).
    Unpaired { device_id: String },
}
