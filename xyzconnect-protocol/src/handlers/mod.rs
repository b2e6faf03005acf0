//! Protocol handlers (spec.md §4.J): each owns one packet-type family, reads
//! through [`crate::sink::PacketSink`] to talk back, and writes through
//! [`crate::persistence::Persistence`] rather than touching storage itself.

pub mod contacts;
pub mod notifications;
pub mod sms;

pub use contacts::ContactsHandler;
pub use notifications::{NotificationEvent, NotificationsHandler};
pub use sms::{SmsEvent, SmsHandler};
