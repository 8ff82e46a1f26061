use std::collections::HashMap;
use std::net::IpAddr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Transport protocol of a discoverable service category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl TransportProtocol {
    pub fn label(&self) -> &'static str {
        match self {
            TransportProtocol::Tcp => "tcp",
            TransportProtocol::Udp => "udp",
        }
    }
}

/// A discoverable service category: a name plus a transport protocol.
///
/// Publish and search for the same logical service must use the same
/// identifier string, so both sides always derive it from here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceType {
    name: String,
    protocol: TransportProtocol,
}

impl ServiceType {
    pub fn new(name: impl Into<String>, protocol: TransportProtocol) -> Self {
        Self {
            name: name.into(),
            protocol,
        }
    }

    pub fn tcp(name: impl Into<String>) -> Self {
        Self::new(name, TransportProtocol::Tcp)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    /// Canonical DNS-SD identifier, e.g. "_lanchat._tcp".
    pub fn identifier(&self) -> String {
        format!("_{}._{}", self.name, self.protocol.label())
    }

    /// Fully qualified type within a domain, e.g. "_lanchat._tcp.local.".
    /// This is the form the mDNS daemon expects for register and browse.
    pub fn qualified(&self, domain: &str) -> String {
        format!("{}.{}", self.identifier(), domain)
    }
}

/// A resolved peer advertisement on the network.
/// This is the canonical data model handed from the browser to consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredService {
    /// Service type, e.g. "_lanchat._tcp.local."
    pub service_type: String,

    /// Full DNS-SD instance name, e.g. "alice._lanchat._tcp.local.".
    /// This is the identity key within a domain.
    pub fullname: String,

    /// Hostname, e.g. "laptop.local."
    pub hostname: String,

    /// All resolved addresses for the peer
    pub addresses: Vec<IpAddr>,

    /// Service port
    pub port: u16,

    /// TXT record key-value pairs
    pub txt: HashMap<String, String>,

    /// When this advertisement was resolved
    pub discovered_at: DateTime<Utc>,
}

impl DiscoveredService {
    /// Instance label without the type/domain suffix, for display.
    pub fn instance(&self) -> &str {
        self.fullname
            .strip_suffix(&format!(".{}", self.service_type))
            .unwrap_or(&self.fullname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_is_canonical() {
        let ty = ServiceType::tcp("lanchat");
        assert_eq!(ty.identifier(), "_lanchat._tcp");
        assert_eq!(ty.qualified("local."), "_lanchat._tcp.local.");
    }

    #[test]
    fn identifier_is_stable_across_values() {
        let a = ServiceType::new("chat", TransportProtocol::Udp);
        let b = ServiceType::new("chat", TransportProtocol::Udp);
        assert_eq!(a, b);
        assert_eq!(a.identifier(), b.identifier());
        assert_eq!(a.identifier(), "_chat._udp");
    }

    #[test]
    fn instance_strips_type_suffix() {
        let svc = DiscoveredService {
            service_type: "_lanchat._tcp.local.".to_string(),
            fullname: "alice._lanchat._tcp.local.".to_string(),
            hostname: "laptop.local.".to_string(),
            addresses: vec![],
            port: 4444,
            txt: HashMap::new(),
            discovered_at: Utc::now(),
        };
        assert_eq!(svc.instance(), "alice");
    }
}
