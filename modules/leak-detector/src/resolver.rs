//! Maps a scanner byte offset to the packet that owns it.

use crate::capture::{CaptureError, CaptureReader, PacketRecord};
use crate::index::PacketIndex;
use crate::tshark::{extract_fields, parse_dissection, DissectError, Dissector, FieldError};
use leaktrace_core::{CaptureOffset, DetectError, PacketFields};
use std::cell::RefCell;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocateStrategy {
    /// Walk the capture from the start on every lookup.
    #[default]
    Scan,
    /// Walk once, then binary-search; rebuilt when the file changes.
    Indexed,
}

/// Why an offset produced no packet fields. None of these are errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Miss {
    OutsideCapture,
    MalformedCapture(String),
    DissectorFailure(String),
    UnsupportedProtocol(String),
    MissingField(&'static str),
}

impl fmt::Display for Miss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Miss::OutsideCapture => f.write_str("offset is not inside any packet"),
            Miss::MalformedCapture(r) => write!(f, "malformed capture: {r}"),
            Miss::DissectorFailure(r) => write!(f, "dissector failed: {r}"),
            Miss::UnsupportedProtocol(p) => write!(f, "not a tcp/udp packet ({p})"),
            Miss::MissingField(k) => write!(f, "dissector output lacks {k}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPacket {
    pub record: PacketRecord,
    pub fields: PacketFields,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found(ResolvedPacket),
    NotFound(Miss),
}

/// Record owning `offset`, by walking the capture from the start.
/// The first record whose `[start_offset, end_offset]` holds the offset wins.
pub fn locate_by_scan(capture: &Path, offset: CaptureOffset) -> Result<Option<PacketRecord>, CaptureError> {
    let mut reader = CaptureReader::open(capture)?;
    while let Some(record) = reader.next_record()? {
        if record.contains(offset) {
            return Ok(Some(record));
        }
    }
    Ok(None)
}

pub struct OffsetResolver<D> {
    dissector: D,
    strategy: LocateStrategy,
    index: RefCell<Option<PacketIndex>>,
}

impl<D: Dissector> OffsetResolver<D> {
    pub fn new(dissector: D) -> Self {
        OffsetResolver { dissector, strategy: LocateStrategy::Scan, index: RefCell::new(None) }
    }

    pub fn with_strategy(mut self, strategy: LocateStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn dissector(&self) -> &D {
        &self.dissector
    }

    /// Boundary lookup only; no dissection.
    pub fn locate(&self, capture: &Path, offset: CaptureOffset) -> Result<Option<PacketRecord>, CaptureError> {
        match self.strategy {
            LocateStrategy::Scan => locate_by_scan(capture, offset),
            LocateStrategy::Indexed => self.locate_indexed(capture, offset),
        }
    }

    fn locate_indexed(&self, capture: &Path, offset: CaptureOffset) -> Result<Option<PacketRecord>, CaptureError> {
        let mut slot = self.index.borrow_mut();
        let stale = match slot.as_ref() {
            Some(idx) => !idx.is_current(capture),
            None => true,
        };
        if stale {
            let idx = PacketIndex::build(capture)?;
            if idx.is_empty() {
                tracing::debug!(capture = %capture.display(), "capture holds no packets");
            }
            *slot = Some(idx);
        }
        match slot.as_ref() {
            Some(idx) => idx.lookup(offset),
            None => Ok(None),
        }
    }

    /// Finds the owning packet and asks the dissector for its fields.
    ///
    /// `Err` is reserved for a missing dissector binary and I/O failures;
    /// everything else that prevents attribution is a [`Miss`].
    pub fn resolve(&self, capture: &Path, offset: CaptureOffset) -> Result<Resolution, DetectError> {
        let record = match self.locate(capture, offset) {
            Ok(Some(r)) => r,
            Ok(None) => return Ok(Resolution::NotFound(Miss::OutsideCapture)),
            Err(e) if e.is_malformed() => return Ok(Resolution::NotFound(Miss::MalformedCapture(e.to_string()))),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(offset, packet = record.sequence_number, start = record.start_offset, end = record.end_offset, "offset located");

        let text = match self.dissector.dissect(capture, record.sequence_number) {
            Ok(t) => t,
            Err(DissectError::Failed(reason)) => return Ok(Resolution::NotFound(Miss::DissectorFailure(reason))),
            Err(e) => return Err(e.into()),
        };
        let packets = match parse_dissection(&text) {
            Ok(p) => p,
            Err(e) => return Ok(Resolution::NotFound(Miss::DissectorFailure(e.to_string()))),
        };
        let Some(packet) = packets.first() else {
            return Ok(Resolution::NotFound(Miss::DissectorFailure(format!(
                "no output for frame {}",
                record.sequence_number
            ))));
        };
        match extract_fields(packet) {
            Ok(fields) => Ok(Resolution::Found(ResolvedPacket { record, fields })),
            Err(FieldError::Unsupported(p)) => Ok(Resolution::NotFound(Miss::UnsupportedProtocol(p))),
            Err(FieldError::Missing(k)) => Ok(Resolution::NotFound(Miss::MissingField(k))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::tests::capture_bytes;
    use std::cell::Cell;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_capture(data: &[u8]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(data).unwrap();
        f.flush().unwrap();
        f
    }

    fn udp_dump(frame: u64) -> String {
        format!(
            r#"[{{"_source":{{"layers":{{
                "frame":{{"frame.number":"{frame}","frame.time_epoch":"1700000000.5","frame.protocols":"eth:ethertype:ip:udp:data"}},
                "ip":{{"ip.src":"10.0.0.{frame}","ip.dst":"10.0.1.1"}},
                "udp":{{"udp.srcport":"5000","udp.dstport":"53"}}}}}}}}]"#
        )
    }

    /// Answers every frame with a UDP packet whose source ends in the frame number.
    struct EchoDissector {
        calls: Cell<u32>,
    }

    impl Dissector for EchoDissector {
        fn dissect(&self, _capture: &Path, frame_number: u64) -> Result<String, DissectError> {
            self.calls.set(self.calls.get() + 1);
            Ok(udp_dump(frame_number))
        }
    }

    struct Canned(&'static str);

    impl Dissector for Canned {
        fn dissect(&self, _capture: &Path, _frame_number: u64) -> Result<String, DissectError> {
            Ok(self.0.to_string())
        }
    }

    fn echo() -> EchoDissector {
        EchoDissector { calls: Cell::new(0) }
    }

    #[test]
    fn middle_of_second_packet() {
        let f = temp_capture(&capture_bytes(&[50, 50, 50]));
        let r = OffsetResolver::new(echo());
        let rec = r.locate(f.path(), 24 + 66 + 16 + 25).unwrap().unwrap();
        assert_eq!(rec.sequence_number, 2);
        let rec = r.locate(f.path(), 24 + 16 + 25).unwrap().unwrap();
        assert_eq!(rec.sequence_number, 1);
    }

    #[test]
    fn boundary_goes_to_earlier_packet() {
        let f = temp_capture(&capture_bytes(&[50, 50, 50]));
        let r = OffsetResolver::new(echo());
        assert_eq!(r.locate(f.path(), 90).unwrap().unwrap().sequence_number, 1);
        assert_eq!(r.locate(f.path(), 91).unwrap().unwrap().sequence_number, 2);
    }

    #[test]
    fn offsets_outside_packets() {
        let f = temp_capture(&capture_bytes(&[50, 50, 50]));
        let r = OffsetResolver::new(echo());
        for off in [0, 10, 24, 223, 10_000] {
            assert_eq!(r.resolve(f.path(), off).unwrap(), Resolution::NotFound(Miss::OutsideCapture), "offset {off}");
        }
        assert_eq!(r.dissector().calls.get(), 0);
    }

    #[test]
    fn every_offset_maps_to_its_packet() {
        let lengths = [3, 0, 40, 1];
        let f = temp_capture(&capture_bytes(&lengths));
        let scan = OffsetResolver::new(echo());
        let indexed = OffsetResolver::new(echo()).with_strategy(LocateStrategy::Indexed);
        let mut header = 24u64;
        for (i, &len) in lengths.iter().enumerate() {
            let end = header + 16 + len as u64;
            for off in header + 1..=end {
                let a = scan.locate(f.path(), off).unwrap().unwrap();
                assert_eq!(a.sequence_number, i as u64 + 1);
                assert_eq!(indexed.locate(f.path(), off).unwrap(), Some(a));
            }
            header = end;
        }
        assert_eq!(indexed.locate(f.path(), header + 1).unwrap(), None);
    }

    #[test]
    fn resolves_fields_and_is_idempotent() {
        let f = temp_capture(&capture_bytes(&[50, 50, 50]));
        let r = OffsetResolver::new(echo());
        let first = r.resolve(f.path(), 200).unwrap();
        let second = r.resolve(f.path(), 200).unwrap();
        assert_eq!(first, second);
        match first {
            Resolution::Found(p) => {
                assert_eq!(p.record.sequence_number, 3);
                assert_eq!(p.fields.src_ip.to_string(), "10.0.0.3");
                assert_eq!(p.fields.dst_port, 53);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncated_capture_is_not_found() {
        let mut data = capture_bytes(&[20, 20]);
        let len_at = 24 + 16 + 20 + 8;
        data[len_at..len_at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        let f = temp_capture(&data);
        for strategy in [LocateStrategy::Scan, LocateStrategy::Indexed] {
            let r = OffsetResolver::new(echo()).with_strategy(strategy);
            assert!(matches!(r.resolve(f.path(), 30).unwrap(), Resolution::Found(_)));
            assert!(matches!(r.resolve(f.path(), 70).unwrap(), Resolution::NotFound(Miss::MalformedCapture(_))));
        }
    }

    #[test]
    fn empty_dump_is_dissector_failure() {
        let f = temp_capture(&capture_bytes(&[50]));
        let r = OffsetResolver::new(Canned("[]"));
        assert!(matches!(r.resolve(f.path(), 30).unwrap(), Resolution::NotFound(Miss::DissectorFailure(_))));
        let r = OffsetResolver::new(Canned("garbage"));
        assert!(matches!(r.resolve(f.path(), 30).unwrap(), Resolution::NotFound(Miss::DissectorFailure(_))));
    }

    #[test]
    fn non_transport_packet_is_unsupported() {
        let f = temp_capture(&capture_bytes(&[50]));
        let r = OffsetResolver::new(Canned(
            r#"[{"_source":{"layers":{"frame":{"frame.time_epoch":"1.0","frame.protocols":"eth:ethertype:arp"}}}}]"#,
        ));
        assert!(matches!(r.resolve(f.path(), 30).unwrap(), Resolution::NotFound(Miss::UnsupportedProtocol(_))));
    }

    #[test]
    fn missing_capture_is_io_error() {
        let r = OffsetResolver::new(echo());
        let err = r.resolve(Path::new("/nonexistent/capture.pcap"), 30).unwrap_err();
        assert!(matches!(err, DetectError::Io(_)));
        assert!(!err.is_fatal());
    }
}
