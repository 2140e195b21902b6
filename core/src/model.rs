//! Data model shared by the detector, the store and the CLI.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Byte position counted from the first byte of a capture file.
pub type CaptureOffset = u64;

pub const EVIDENCE_TYPE: &str = "NETWORK_gps_location_leaked";
pub const EVIDENCE_CATEGORY: &str = "Malware";
pub const SOURCE_TARGET_TAG: &str = "CC";
pub const EVIDENCE_CONFIDENCE: f32 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the packet the attacker was seen on, relative to the victim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Source,
    Destination,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Source => "source",
            Direction::Destination => "destination",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    High,
}

impl ThreatLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::High => "high",
        }
    }
}

/// Monitoring-platform key of a tracked host: `profile_<ip>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileId(pub String);

impl ProfileId {
    pub fn for_ip(ip: IpAddr) -> Self {
        ProfileId(format!("profile_{ip}"))
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindowId(pub String);

impl fmt::Display for TimeWindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Port/transport pair in the `53/udp` form the port metadata is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortProto {
    pub port: u16,
    pub transport: Transport,
}

impl fmt::Display for PortProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.transport)
    }
}

/// 5-tuple and timestamp of one dissected packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketFields {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub protocol: Transport,
    pub src_port: u16,
    pub dst_port: u16,
    /// Seconds since the epoch.
    pub timestamp: f64,
}

/// One hit reported by the pattern scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub rule_name: String,
    /// Rule variable that fired, without the leading `$`.
    pub variable: String,
    pub offset: CaptureOffset,
    pub matched_strings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub unique_id: String,
    pub evidence_type: String,
    pub rule_name: String,
    pub attacker_ip: IpAddr,
    pub attacker_direction: Direction,
    pub victim_profile_id: ProfileId,
    pub victim_time_window: TimeWindowId,
    pub port: u16,
    pub protocol: Transport,
    pub confidence: f32,
    pub threat_level: ThreatLevel,
    pub category: String,
    pub source_target_tag: String,
    pub description: String,
    /// Seconds since the epoch, taken from the packet.
    pub timestamp: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_id_format() {
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        assert_eq!(ProfileId::for_ip(ip).to_string(), "profile_10.0.0.7");
        let v6: IpAddr = "fe80::1".parse().unwrap();
        assert_eq!(ProfileId::for_ip(v6).0, "profile_fe80::1");
    }

    #[test]
    fn port_proto_display() {
        let pp = PortProto { port: 443, transport: Transport::Tcp };
        assert_eq!(pp.to_string(), "443/tcp");
    }

    #[test]
    fn enums_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&Direction::Destination).unwrap(), "\"destination\"");
        assert_eq!(serde_json::to_string(&Transport::Udp).unwrap(), "\"udp\"");
    }
}
