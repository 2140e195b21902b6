//! Query/write contract of the monitoring platform's state store.

use crate::model::{EvidenceRecord, PortProto, ProfileId, TimeWindowId};
use anyhow::Result;
use std::net::IpAddr;

/// An `Err` from any method means the store itself could not be reached;
/// callers treat that as fatal for the whole run.
pub trait EvidenceStore {
    fn has_profile(&self, ip: IpAddr) -> Result<bool>;

    fn time_window_for(&self, profile: &ProfileId, timestamp: f64) -> Result<Option<TimeWindowId>>;

    fn port_service_info(&self, port: PortProto) -> Result<Option<String>>;

    /// Reverse-DNS / threat-intel text attached to an address, if any.
    fn threat_intel_annotation(&self, ip: IpAddr) -> Result<Option<String>>;

    fn write_evidence(&self, evidence: &EvidenceRecord) -> Result<()>;
}

impl<S: EvidenceStore + ?Sized> EvidenceStore for &S {
    fn has_profile(&self, ip: IpAddr) -> Result<bool> {
        (**self).has_profile(ip)
    }

    fn time_window_for(&self, profile: &ProfileId, timestamp: f64) -> Result<Option<TimeWindowId>> {
        (**self).time_window_for(profile, timestamp)
    }

    fn port_service_info(&self, port: PortProto) -> Result<Option<String>> {
        (**self).port_service_info(port)
    }

    fn threat_intel_annotation(&self, ip: IpAddr) -> Result<Option<String>> {
        (**self).threat_intel_annotation(ip)
    }

    fn write_evidence(&self, evidence: &EvidenceRecord) -> Result<()> {
        (**self).write_evidence(evidence)
    }
}
