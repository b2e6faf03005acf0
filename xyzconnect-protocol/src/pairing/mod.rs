//! Device pairing (spec.md §4.G).
//!
//! 1. Either side sends `kdeconnect.pair` with `pair: true` over the already
//!    established TLS connection.
//! 2. The verification key ([`key::generate_verification_key`]) is shown on
//!    both devices; the user confirms out of band.
//! 3. The peer responds `pair: true` (accept, certificate stored) or
//!    `pair: false` (reject).
//! 4. Trust is durable: a stored certificate in the trust directory is what
//!    "paired" means, not any in-memory flag.

pub mod events;
pub mod handler;
pub mod key;

pub use events::PairingEvent;
pub use handler::{IncomingPairingRequest, PairingHandler, DEFAULT_PAIRING_TIMEOUT};
pub use key::generate_verification_key;
