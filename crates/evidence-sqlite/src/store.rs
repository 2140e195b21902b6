use crate::Db;
use anyhow::Result;
use leaktrace_core::{EvidenceRecord, EvidenceStore, PortProto, ProfileId, TimeWindowId};
use std::net::IpAddr;

impl EvidenceStore for Db {
    fn has_profile(&self, ip: IpAddr) -> Result<bool> {
        self.profile_exists(ip)
    }

    fn time_window_for(&self, profile: &ProfileId, timestamp: f64) -> Result<Option<TimeWindowId>> {
        self.lookup_time_window(profile, timestamp)
    }

    fn port_service_info(&self, port: PortProto) -> Result<Option<String>> {
        self.lookup_port_info(&port.to_string())
    }

    fn threat_intel_annotation(&self, ip: IpAddr) -> Result<Option<String>> {
        self.lookup_identification(ip)
    }

    fn write_evidence(&self, evidence: &EvidenceRecord) -> Result<()> {
        self.insert_evidence(evidence)?;
        tracing::debug!(uid = %evidence.unique_id, profile = %evidence.victim_profile_id, "evidence stored");
        Ok(())
    }
}
