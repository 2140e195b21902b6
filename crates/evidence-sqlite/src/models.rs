use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: Uuid,
    pub started_at: i64,
    pub tool_version: String,
    pub capture_path: String,
    pub args_json: String,
}

/// Flat view of a stored evidence row, used for listing and export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRow {
    pub uid: String,
    pub evidence_type: String,
    pub rule_name: String,
    pub attacker: String,
    pub attacker_direction: String,
    pub profile_id: String,
    pub tw_id: String,
    pub port: i64,
    pub proto: String,
    pub confidence: f64,
    pub threat_level: String,
    pub category: String,
    pub source_target_tag: Option<String>,
    pub description: String,
    pub ts: f64,
    pub ts_text: String,
}

/// Host-platform state loaded in one go, e.g. from a YAML file:
///
/// ```yaml
/// profiles:
///   - address: 192.168.1.5
///     windows:
///       - { id: timewindow1, start: 1700000000.0, end: 1700003600.0 }
/// port_info:
///   "53/udp": DNS
/// identifications:
///   "8.8.8.8": "dns.google"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSeed {
    #[serde(default)]
    pub profiles: Vec<SeedProfile>,
    #[serde(default)]
    pub port_info: BTreeMap<String, String>,
    #[serde(default)]
    pub identifications: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedProfile {
    pub address: String,
    #[serde(default)]
    pub windows: Vec<SeedWindow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedWindow {
    pub id: String,
    pub start: f64,
    pub end: f64,
}

impl StoreSeed {
    pub fn from_yaml(s: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }
}
