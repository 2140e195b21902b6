//! Turns scanner hits into evidence against monitored hosts.

use crate::resolver::{Miss, OffsetResolver, Resolution};
use crate::tshark::Dissector;
use leaktrace_core::*;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum Suppression {
    Unresolved(Miss),
    NoMonitoredHost,
    NoTimeWindow { profile: ProfileId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Evidence(EvidenceRecord),
    Suppressed(Suppression),
}

/// Victim/attacker split of a packet's endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribution {
    pub victim: ProfileId,
    pub attacker: IpAddr,
    pub direction: Direction,
}

pub struct Correlator<S, D> {
    store: S,
    resolver: OffsetResolver<D>,
    capture: PathBuf,
    readiness: Backoff,
}

impl<S: EvidenceStore, D: Dissector> Correlator<S, D> {
    pub fn new(store: S, resolver: OffsetResolver<D>, capture: impl Into<PathBuf>) -> Self {
        Correlator { store, resolver, capture: capture.into(), readiness: Backoff::default() }
    }

    /// How long to keep polling the store for a profile or time window that
    /// the host platform may not have written yet.
    pub fn with_readiness(mut self, readiness: Backoff) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn capture(&self) -> &Path {
        &self.capture
    }

    pub fn resolver(&self) -> &OffsetResolver<D> {
        &self.resolver
    }

    /// Resolves, attributes and records one hit. Writes at most one evidence row.
    pub fn correlate(&self, hit: &MatchRecord) -> Result<Outcome, DetectError> {
        let packet = match self.resolver.resolve(&self.capture, hit.offset)? {
            Resolution::Found(p) => p,
            Resolution::NotFound(miss) => {
                tracing::debug!(rule = %hit.rule_name, offset = hit.offset, %miss, "hit not attributable to a packet");
                return Ok(Outcome::Suppressed(Suppression::Unresolved(miss)));
            }
        };
        let fields = &packet.fields;

        let Some(attr) = self.attribute(fields)? else {
            tracing::debug!(src = %fields.src_ip, dst = %fields.dst_ip, "neither endpoint is monitored");
            return Ok(Outcome::Suppressed(Suppression::NoMonitoredHost));
        };

        let window = self
            .readiness
            .poll(|| self.store.time_window_for(&attr.victim, fields.timestamp))
            .map_err(DetectError::StoreUnavailable)?;
        let Some(window) = window else {
            tracing::debug!(profile = %attr.victim, ts = fields.timestamp, "no time window for packet");
            return Ok(Outcome::Suppressed(Suppression::NoTimeWindow { profile: attr.victim }));
        };

        let portproto = PortProto { port: fields.dst_port, transport: fields.protocol };
        let service = self.store.port_service_info(portproto).map_err(DetectError::StoreUnavailable)?;
        let annotation = self.store.threat_intel_annotation(attr.attacker).map_err(DetectError::StoreUnavailable)?;
        let description = describe(
            &hit.rule_name,
            attr.attacker,
            attr.direction,
            annotation.as_deref(),
            portproto,
            service.as_deref(),
            &hit.matched_strings,
        );

        let evidence = EvidenceRecord {
            unique_id: Uuid::new_v4().to_string(),
            evidence_type: EVIDENCE_TYPE.to_string(),
            rule_name: hit.rule_name.clone(),
            attacker_ip: attr.attacker,
            attacker_direction: attr.direction,
            victim_profile_id: attr.victim,
            victim_time_window: window,
            port: fields.dst_port,
            protocol: fields.protocol,
            confidence: EVIDENCE_CONFIDENCE,
            threat_level: ThreatLevel::High,
            category: EVIDENCE_CATEGORY.to_string(),
            source_target_tag: SOURCE_TARGET_TAG.to_string(),
            description,
            timestamp: fields.timestamp,
        };
        self.store.write_evidence(&evidence).map_err(DetectError::StoreUnavailable)?;
        tracing::info!(
            uid = %evidence.unique_id,
            profile = %evidence.victim_profile_id,
            tw = %evidence.victim_time_window,
            attacker = %evidence.attacker_ip,
            packet = packet.record.sequence_number,
            "{}",
            evidence.description
        );
        Ok(Outcome::Evidence(evidence))
    }

    /// Source side is checked before destination side on every attempt, so a
    /// packet between two monitored hosts always blames the destination.
    pub fn attribute(&self, fields: &PacketFields) -> Result<Option<Attribution>, DetectError> {
        self.readiness
            .poll(|| -> anyhow::Result<Option<Attribution>> {
                if self.store.has_profile(fields.src_ip)? {
                    return Ok(Some(Attribution {
                        victim: ProfileId::for_ip(fields.src_ip),
                        attacker: fields.dst_ip,
                        direction: Direction::Destination,
                    }));
                }
                if self.store.has_profile(fields.dst_ip)? {
                    return Ok(Some(Attribution {
                        victim: ProfileId::for_ip(fields.dst_ip),
                        attacker: fields.src_ip,
                        direction: Direction::Source,
                    }));
                }
                Ok(None)
            })
            .map_err(DetectError::StoreUnavailable)
    }
}

/// Human-readable evidence text, e.g.
/// `gps location to destination address: 203.0.113.9 (dns.example) port: 53/udp DNS. Leaked location: ll=12.34,-56.78`.
pub fn describe(
    rule_name: &str,
    attacker: IpAddr,
    direction: Direction,
    annotation: Option<&str>,
    portproto: PortProto,
    service: Option<&str>,
    matched_strings: &[String],
) -> String {
    let rule = rule_name.replace('_', " ");
    let side = match direction {
        Direction::Destination => "to destination",
        Direction::Source => "from source",
    };
    let mut out = format!("{rule} {side} address: {attacker}");
    if let Some(a) = annotation.map(str::trim).filter(|a| !a.is_empty()) {
        out.push(' ');
        out.push_str(a);
    }
    out.push_str(&format!(" port: {portproto}"));
    if let Some(s) = service.map(str::trim).filter(|s| !s.is_empty()) {
        out.push(' ');
        out.push_str(s);
    }
    out.push_str(". Leaked location: ");
    out.push_str(&matched_strings.join(" "));
    out
}
