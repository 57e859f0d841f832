//! Port and rule-set model shared by discovery, the firewall adapter and
//! reconciliation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Transport protocol of a firewall rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub const ALL: [Protocol; 2] = [Protocol::Tcp, Protocol::Udp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// A port number (1-65535) bound to a protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Port {
    number: u16,
    protocol: Protocol,
}

impl Port {
    pub const DEFAULT_SSH: Port = Port {
        number: 22,
        protocol: Protocol::Tcp,
    };

    /// Returns `None` for port 0.
    pub fn new(number: u16, protocol: Protocol) -> Option<Self> {
        (number != 0).then_some(Self { number, protocol })
    }

    /// Accepts any integer, rejecting values outside 1-65535.
    pub fn from_u64(number: u64, protocol: Protocol) -> Option<Self> {
        u16::try_from(number)
            .ok()
            .and_then(|n| Self::new(n, protocol))
    }

    pub fn tcp(number: u16) -> Option<Self> {
        Self::new(number, Protocol::Tcp)
    }

    pub fn udp(number: u16) -> Option<Self> {
        Self::new(number, Protocol::Udp)
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.number, self.protocol)
    }
}

impl FromStr for Port {
    type Err = String;

    /// Parses the `443/tcp` form used by firewall listings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (number, protocol) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("missing protocol in {s:?}"))?;
        let protocol: Protocol = protocol.parse()?;
        let number: u16 = number
            .parse()
            .map_err(|_| format!("invalid port number in {s:?}"))?;
        Port::new(number, protocol).ok_or_else(|| format!("port out of range in {s:?}"))
    }
}

impl TryFrom<String> for Port {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Port> for String {
    fn from(port: Port) -> Self {
        port.to_string()
    }
}

/// Allowed ports partitioned by protocol.
///
/// Used both for the desired state computed by discovery and for the actual
/// state reported by a firewall backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRuleSet")]
pub struct RuleSet {
    tcp: BTreeSet<u16>,
    udp: BTreeSet<u16>,
}

/// Wire form of [`RuleSet`], checked before it becomes one
#[derive(Deserialize)]
struct RawRuleSet {
    #[serde(default)]
    tcp: BTreeSet<u16>,
    #[serde(default)]
    udp: BTreeSet<u16>,
}

impl TryFrom<RawRuleSet> for RuleSet {
    type Error = String;

    fn try_from(raw: RawRuleSet) -> Result<Self, Self::Error> {
        if raw.tcp.contains(&0) || raw.udp.contains(&0) {
            return Err("port 0 is not a valid rule".to_string());
        }
        Ok(Self {
            tcp: raw.tcp,
            udp: raw.udp,
        })
    }
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ports<I: IntoIterator<Item = Port>>(ports: I) -> Self {
        let mut set = Self::new();
        for port in ports {
            set.insert(port);
        }
        set
    }

    /// Inserts a port. Returns true when it was not present yet.
    pub fn insert(&mut self, port: Port) -> bool {
        self.numbers_mut(port.protocol()).insert(port.number())
    }

    /// Inserts a raw number, ignoring port 0.
    pub fn insert_number(&mut self, number: u16, protocol: Protocol) -> bool {
        match Port::new(number, protocol) {
            Some(port) => self.insert(port),
            None => false,
        }
    }

    /// Inserts the number for both tcp and udp.
    pub fn insert_both(&mut self, number: u16) {
        for protocol in Protocol::ALL {
            self.insert_number(number, protocol);
        }
    }

    pub fn contains(&self, port: &Port) -> bool {
        self.numbers(port.protocol()).contains(&port.number())
    }

    pub fn numbers(&self, protocol: Protocol) -> &BTreeSet<u16> {
        match protocol {
            Protocol::Tcp => &self.tcp,
            Protocol::Udp => &self.udp,
        }
    }

    fn numbers_mut(&mut self, protocol: Protocol) -> &mut BTreeSet<u16> {
        match protocol {
            Protocol::Tcp => &mut self.tcp,
            Protocol::Udp => &mut self.udp,
        }
    }

    /// Every port, tcp first, ascending within a protocol.
    pub fn ports(&self) -> Vec<Port> {
        Protocol::ALL
            .iter()
            .flat_map(|&protocol| {
                self.numbers(protocol)
                    .iter()
                    .filter_map(move |&n| Port::new(n, protocol))
            })
            .collect()
    }

    /// Ports present in `self` but not in `other`, per protocol.
    pub fn difference(&self, other: &RuleSet) -> Vec<Port> {
        self.ports()
            .into_iter()
            .filter(|port| !other.contains(port))
            .collect()
    }

    pub fn extend(&mut self, other: &RuleSet) {
        for port in other.ports() {
            self.insert(port);
        }
    }

    pub fn len(&self) -> usize {
        self.tcp.len() + self.udp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tcp.is_empty() && self.udp.is_empty()
    }
}

impl FromIterator<Port> for RuleSet {
    fn from_iter<T: IntoIterator<Item = Port>>(iter: T) -> Self {
        Self::from_ports(iter)
    }
}

impl fmt::Display for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.ports().iter().map(|p| p.to_string()).collect();
        if rendered.is_empty() {
            f.write_str("(none)")
        } else {
            f.write_str(&rendered.join(", "))
        }
    }
}

/// Renders a list of ports as `22/tcp, 443/udp`.
pub fn join_ports(ports: &[Port]) -> String {
    ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_rejects_zero() {
        assert!(Port::tcp(0).is_none());
        assert!(Port::from_u64(65536, Protocol::Udp).is_none());
        assert_eq!(Port::from_u64(65535, Protocol::Udp).unwrap().number(), 65535);
    }

    #[test]
    fn test_port_parse_and_display() {
        let port: Port = "443/udp".parse().unwrap();
        assert_eq!(port, Port::udp(443).unwrap());
        assert_eq!(port.to_string(), "443/udp");
        assert!("443".parse::<Port>().is_err());
        assert!("0/tcp".parse::<Port>().is_err());
        assert!("1000-2000/tcp".parse::<Port>().is_err());
        assert!("53/icmp".parse::<Port>().is_err());
    }

    #[test]
    fn test_rule_set_dedups() {
        let mut set = RuleSet::new();
        assert!(set.insert(Port::tcp(22).unwrap()));
        assert!(!set.insert(Port::tcp(22).unwrap()));
        set.insert_both(443);
        assert_eq!(set.len(), 3);
        assert!(!set.insert_number(0, Protocol::Tcp));
    }

    #[test]
    fn test_difference_is_per_protocol() {
        let desired: RuleSet = [Port::tcp(22), Port::tcp(443), Port::udp(443)]
            .into_iter()
            .flatten()
            .collect();
        let actual: RuleSet = [Port::tcp(22), Port::tcp(80), Port::tcp(443)]
            .into_iter()
            .flatten()
            .collect();

        assert_eq!(actual.difference(&desired), vec![Port::tcp(80).unwrap()]);
        assert_eq!(desired.difference(&actual), vec![Port::udp(443).unwrap()]);
    }

    #[test]
    fn test_ports_order_tcp_first() {
        let mut set = RuleSet::new();
        set.insert_number(53, Protocol::Udp);
        set.insert_number(8080, Protocol::Tcp);
        set.insert_number(22, Protocol::Tcp);
        let rendered: Vec<String> = set.ports().iter().map(|p| p.to_string()).collect();
        assert_eq!(rendered, vec!["22/tcp", "8080/tcp", "53/udp"]);
        assert_eq!(set.to_string(), "22/tcp, 8080/tcp, 53/udp");
    }

    #[test]
    fn test_rule_set_json_shape() {
        let mut set = RuleSet::new();
        set.insert_both(443);
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json, serde_json::json!({"tcp": [443], "udp": [443]}));
        assert_eq!(RuleSet::new().to_string(), "(none)");

        let port_json = serde_json::to_value(Port::tcp(22).unwrap()).unwrap();
        assert_eq!(port_json, serde_json::json!("22/tcp"));
    }

    #[test]
    fn test_rule_set_deserialize_keeps_port_range() {
        let set: RuleSet = serde_json::from_str(r#"{"tcp": [22, 443]}"#).unwrap();
        assert_eq!(set.to_string(), "22/tcp, 443/tcp");

        assert!(serde_json::from_str::<RuleSet>(r#"{"tcp": [0]}"#).is_err());
        assert!(serde_json::from_str::<RuleSet>(r#"{"udp": [22, 0]}"#).is_err());
        assert!(serde_json::from_str::<RuleSet>(r#"{"tcp": [65536]}"#).is_err());
    }
}
