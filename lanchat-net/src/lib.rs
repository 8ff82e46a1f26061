//! Local-network peer-to-peer chat networking.
//!
//! Three components form the core: [`Server`] publishes this device's
//! own service instance over mDNS and accepts inbound connections,
//! [`ServicesBrowser`] watches the network for peers advertising the
//! same [`shared::types::ServiceType`], and [`Connection`] turns one
//! established byte stream into an ordered send/receive channel driven
//! by socket readiness. Each component reports to its consumer over an
//! event channel; the event enums are the whole contract.

pub mod connection;
pub mod error;
pub mod mdns;
pub mod server;

pub use connection::{Connection, ConnectionEvent};
pub use error::NetError;
pub use mdns::browser::{BrowserEvent, ServicesBrowser};
pub use server::{Server, ServerEvent};
