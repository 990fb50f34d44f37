use serde::{Deserialize, Serialize};
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

/// The address TCP rules bind to when no external ip is given.
pub const UNSPECIFIED_IP: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// An opaque key/value pair passed through to the data plane (e.g. a load-balancing weight).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleExtension {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// Routes external HTTP traffic for a domain to a workload's container port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRule {
    pub rule_id: String,
    pub workload_id: String,
    pub container_port: u16,

    /// An empty domain places no constraint on the request's hostname.
    #[serde(default)]
    pub domain: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<String>,

    #[serde(default)]
    pub extensions: Vec<RuleExtension>,

    /// Per-rule proxy configuration (timeouts, body limits, ...).
    #[serde(default)]
    pub configs: Vec<RuleExtension>,

    pub version: u64,
}

/// Routes external TCP traffic arriving on `ip:port` to a workload's container port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpRule {
    pub rule_id: String,
    pub workload_id: String,
    pub container_port: u16,
    pub ip: IpAddr,
    pub port: u16,

    #[serde(default)]
    pub extensions: Vec<RuleExtension>,

    pub version: u64,
}

/// An external `(ip, port)` pair claimed by a TCP rule.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortAddr {
    pub ip: IpAddr,
    pub port: u16,
}

/// Returns true if the string is empty or made only of whitespace.
pub fn is_blank(s: &str) -> bool {
    s.chars().all(char::is_whitespace)
}

// === impl HttpRule ===

impl HttpRule {
    /// Returns the referenced certificate id, ignoring blank references.
    pub fn certificate_ref(&self) -> Option<&str> {
        self.certificate_id.as_deref().filter(|id| !is_blank(id))
    }
}

// === impl TcpRule ===

impl TcpRule {
    pub fn addr(&self) -> PortAddr {
        PortAddr::new(self.ip, self.port)
    }
}

// === impl PortAddr ===

impl PortAddr {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for PortAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        SocketAddr::new(self.ip, self.port).fmt(f)
    }
}
