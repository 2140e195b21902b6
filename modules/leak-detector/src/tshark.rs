//! Packet dissection through `tshark`.

use leaktrace_core::{DetectError, PacketFields, Transport};
use serde_json::Value;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Printed by the shell when the dissector is OOM-killed mid-output.
pub const KILL_MARKER: &str = "Killed";
/// Closes the first packet object and the array of a cut-off dump.
const RECOVERY_SUFFIX: &str = "}]";

#[derive(Error, Debug)]
pub enum DissectError {
    #[error("`{tool}` could not be started: {source}")]
    Unavailable { tool: String, source: io::Error },

    #[error("{0}")]
    Failed(String),
}

impl From<DissectError> for DetectError {
    fn from(e: DissectError) -> Self {
        match e {
            DissectError::Unavailable { tool, source } => DetectError::ToolUnavailable { tool, reason: source.to_string() },
            DissectError::Failed(reason) => DetectError::DissectorFailure { reason },
        }
    }
}

/// Produces the JSON dump of a single frame of a capture.
pub trait Dissector {
    fn ensure_available(&self) -> Result<(), DetectError> {
        Ok(())
    }

    /// Raw JSON text for frame `frame_number` (1-based).
    fn dissect(&self, capture: &Path, frame_number: u64) -> Result<String, DissectError>;
}

impl<D: Dissector + ?Sized> Dissector for &D {
    fn ensure_available(&self) -> Result<(), DetectError> {
        (**self).ensure_available()
    }

    fn dissect(&self, capture: &Path, frame_number: u64) -> Result<String, DissectError> {
        (**self).dissect(capture, frame_number)
    }
}

#[derive(Debug, Clone)]
pub struct TsharkDissector {
    bin: PathBuf,
}

impl Default for TsharkDissector {
    fn default() -> Self {
        TsharkDissector::new("tshark")
    }
}

impl TsharkDissector {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        TsharkDissector { bin: bin.into() }
    }

    fn tool_name(&self) -> String {
        self.bin.display().to_string()
    }
}

impl Dissector for TsharkDissector {
    fn ensure_available(&self) -> Result<(), DetectError> {
        probe_binary(&self.bin, "-v")
    }

    fn dissect(&self, capture: &Path, frame_number: u64) -> Result<String, DissectError> {
        let output = Command::new(&self.bin)
            .arg("-r")
            .arg(capture)
            .args(["-T", "json", "-Y"])
            .arg(format!("frame.number=={frame_number}"))
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|source| match source.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                    DissectError::Unavailable { tool: self.tool_name(), source }
                }
                _ => DissectError::Failed(format!("failed to run {}: {source}", self.tool_name())),
            })?;
        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        // a killed run can still leave a recoverable first packet on stdout
        if text.trim().is_empty() && !output.status.success() {
            return Err(DissectError::Failed(format!("{} exited with {}", self.tool_name(), output.status)));
        }
        Ok(text)
    }
}

/// Spawns `bin flag` to check that the binary exists; its exit status is ignored.
pub(crate) fn probe_binary(bin: &Path, flag: &str) -> Result<(), DetectError> {
    Command::new(bin)
        .arg(flag)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|_| ())
        .map_err(|e| DetectError::ToolUnavailable { tool: bin.display().to_string(), reason: e.to_string() })
}

/// Parses a dissector dump, repairing a cut-off dump once before giving up.
pub fn parse_dissection(text: &str) -> Result<Vec<Value>, DissectError> {
    match serde_json::from_str::<Vec<Value>>(text) {
        Ok(packets) => Ok(packets),
        Err(first) => {
            let repaired = format!("{}{}", text.replace(KILL_MARKER, "").trim_end(), RECOVERY_SUFFIX);
            match serde_json::from_str::<Vec<Value>>(&repaired) {
                Ok(packets) => {
                    tracing::debug!("recovered truncated dissector output");
                    Ok(packets)
                }
                Err(_) => Err(DissectError::Failed(format!("unparseable dissector output: {first}"))),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    /// Neither tcp nor udp is in the protocol stack.
    Unsupported(String),
    Missing(&'static str),
}

/// Picks the 5-tuple and timestamp out of one dumped packet.
pub fn extract_fields(packet: &Value) -> Result<PacketFields, FieldError> {
    let layers = packet
        .get("_source")
        .and_then(|s| s.get("layers"))
        .ok_or(FieldError::Missing("_source.layers"))?;

    let protocols = text_field(layers, "frame", "frame.protocols").ok_or(FieldError::Missing("frame.protocols"))?;
    let stack: Vec<&str> = protocols.split(':').collect();

    let (family, src_key, dst_key) = if stack.contains(&"ipv6") {
        ("ipv6", "ipv6.src", "ipv6.dst")
    } else {
        ("ip", "ip.src", "ip.dst")
    };
    let (protocol, sport_key, dport_key) = if stack.contains(&"tcp") {
        (Transport::Tcp, "tcp.srcport", "tcp.dstport")
    } else if stack.contains(&"udp") {
        (Transport::Udp, "udp.srcport", "udp.dstport")
    } else {
        return Err(FieldError::Unsupported(protocols.to_string()));
    };

    let timestamp = text_field(layers, "frame", "frame.time_epoch")
        .and_then(parse_epoch)
        .ok_or(FieldError::Missing("frame.time_epoch"))?;
    let src_ip = parsed::<IpAddr>(layers, family, src_key).ok_or(FieldError::Missing(src_key))?;
    let dst_ip = parsed::<IpAddr>(layers, family, dst_key).ok_or(FieldError::Missing(dst_key))?;
    let layer = protocol.as_str();
    let src_port = parsed::<u16>(layers, layer, sport_key).ok_or(FieldError::Missing(sport_key))?;
    let dst_port = parsed::<u16>(layers, layer, dport_key).ok_or(FieldError::Missing(dport_key))?;

    Ok(PacketFields { src_ip, dst_ip, protocol, src_port, dst_port, timestamp })
}

/// String value of `layers[layer][key]`; repeated fields dump as arrays, the first wins.
fn text_field<'a>(layers: &'a Value, layer: &str, key: &str) -> Option<&'a str> {
    let v = layers.get(layer)?.get(key)?;
    match v {
        Value::String(s) => Some(s.as_str()),
        Value::Array(items) => items.first()?.as_str(),
        _ => None,
    }
}

fn parsed<T: std::str::FromStr>(layers: &Value, layer: &str, key: &str) -> Option<T> {
    if let Some(s) = text_field(layers, layer, key) {
        return s.trim().parse().ok();
    }
    let n = layers.get(layer)?.get(key)?;
    n.as_u64().and_then(|n| n.to_string().parse().ok())
}

/// Seconds since the epoch, or an RFC 3339 instant as newer dissectors print it.
fn parse_epoch(s: &str) -> Option<f64> {
    let s = s.trim();
    if let Ok(ts) = s.parse::<f64>() {
        return Some(ts);
    }
    let t = OffsetDateTime::parse(s, &Rfc3339).ok()?;
    Some(t.unix_timestamp_nanos() as f64 / 1e9)
}
