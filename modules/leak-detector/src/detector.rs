//! Detection run over one capture: scan, then correlate every hit in order.

use crate::correlate::{Correlator, Outcome, Suppression};
use crate::tshark::Dissector;
use crate::yara::{ScanError, Scanner};
use leaktrace_core::{CancelFlag, DetectError, EvidenceRecord, EvidenceStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A per-rule or per-hit failure that did not stop the run.
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub scope: String,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub rule_sets: usize,
    pub matches: usize,
    pub evidence: Vec<EvidenceRecord>,
    /// Suppressed hits per reason.
    pub suppressed: BTreeMap<&'static str, usize>,
    pub failures: Vec<Failure>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn suppressed_total(&self) -> usize {
        self.suppressed.values().sum()
    }
}

impl Suppression {
    pub fn reason(&self) -> &'static str {
        match self {
            Suppression::Unresolved(_) => "unresolved",
            Suppression::NoMonitoredHost => "no_monitored_host",
            Suppression::NoTimeWindow { .. } => "no_time_window",
        }
    }
}

pub struct LeakDetector<Sc, S, D> {
    scanner: Sc,
    correlator: Correlator<S, D>,
}

impl<Sc: Scanner, S: EvidenceStore, D: Dissector> LeakDetector<Sc, S, D> {
    pub fn new(scanner: Sc, correlator: Correlator<S, D>) -> Self {
        LeakDetector { scanner, correlator }
    }

    pub fn correlator(&self) -> &Correlator<S, D> {
        &self.correlator
    }

    pub fn ensure_tools(&self) -> Result<(), DetectError> {
        self.scanner.ensure_available()?;
        self.correlator.resolver().dissector().ensure_available()
    }

    /// Runs every rule set over the capture and correlates each hit.
    ///
    /// Only a missing tool or an unreachable store ends the run early with
    /// `Err`. Cancellation is honoured between hits and never interrupts an
    /// evidence write.
    pub fn run(&self, rule_sets: &[PathBuf], cancel: &CancelFlag) -> Result<RunSummary, DetectError> {
        self.ensure_tools()?;
        let capture = self.correlator.capture().to_path_buf();
        let mut summary = RunSummary::default();

        'rules: for rule_set in rule_sets {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let hits = match self.scanner.scan(rule_set, &capture) {
                Ok(h) => h,
                Err(ScanError::Unavailable { tool, source }) => {
                    return Err(DetectError::ToolUnavailable { tool, reason: source.to_string() })
                }
                Err(e @ ScanError::Failed { .. }) => {
                    tracing::warn!(rule_set = %rule_set.display(), error = %e, "scan failed, skipping rule set");
                    summary.failures.push(Failure {
                        scope: format!("rule_set:{}", rule_set.display()),
                        code: "scan_failure",
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            summary.rule_sets += 1;
            tracing::debug!(rule_set = %rule_set.display(), hits = hits.len(), "scan finished");

            for hit in &hits {
                if cancel.is_cancelled() {
                    summary.cancelled = true;
                    break 'rules;
                }
                summary.matches += 1;
                match self.correlator.correlate(hit) {
                    Ok(Outcome::Evidence(ev)) => summary.evidence.push(ev),
                    Ok(Outcome::Suppressed(s)) => *summary.suppressed.entry(s.reason()).or_default() += 1,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        tracing::warn!(rule = %hit.rule_name, offset = hit.offset, error = %e, "failed to process hit");
                        summary.failures.push(Failure {
                            scope: format!("match:{}@{:#x}", hit.rule_name, hit.offset),
                            code: e.code(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        tracing::info!(
            rule_sets = summary.rule_sets,
            matches = summary.matches,
            evidence = summary.evidence.len(),
            suppressed = summary.suppressed_total(),
            failures = summary.failures.len(),
            cancelled = summary.cancelled,
            "detection finished"
        );
        Ok(summary)
    }
}
