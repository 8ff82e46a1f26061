/// Default mDNS domain; the only domain this system publishes and
/// searches in.
pub const DEFAULT_DOMAIN: &str = "local.";

/// Default service type name advertised by a chat peer.
pub const CHAT_SERVICE_NAME: &str = "lanchat";

/// TXT record key carrying the human-readable device name.
pub const TXT_DEVICE: &str = "device";

/// Default capacity of a connection's read scratch buffer and the cap
/// on a single outbound write, in bytes.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;
