//! Sequential reader over the classic capture container.
//!
//! The reader only tracks record boundaries; it never decodes packet bytes.
//! A capture is a 24-byte global header followed by records, each a 16-byte
//! header whose bytes `8..12` hold the captured length, then that many
//! payload bytes.

use leaktrace_core::{CaptureOffset, DetectError};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use thiserror::Error;

pub const GLOBAL_HEADER_LEN: u64 = 24;
pub const RECORD_HEADER_LEN: u64 = 16;

const BUFFER_SIZE: usize = 64 * 1024;
const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];

/// Boundaries of one record in the capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketRecord {
    /// 1-based, matches the dissector's frame numbering.
    pub sequence_number: u64,
    /// Offset of the first byte of the record header.
    pub header_offset: CaptureOffset,
    /// `header_offset + 1`; the scanner reports hits one past the boundary.
    pub start_offset: CaptureOffset,
    /// Offset just past the last payload byte.
    pub end_offset: CaptureOffset,
    pub payload_length: u32,
}

impl PacketRecord {
    /// Inclusive on both ends. Adjacent records never share an offset
    /// because the next record starts one past this one's end.
    pub fn contains(&self, offset: CaptureOffset) -> bool {
        offset >= self.start_offset && offset <= self.end_offset
    }

    pub fn record_len(&self) -> u64 {
        self.end_offset - self.header_offset
    }
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture holds {0} bytes, less than the {GLOBAL_HEADER_LEN}-byte global header")]
    ShortGlobalHeader(u64),

    #[error("pcapng captures are not supported")]
    PcapNg,

    #[error("packet {sequence} declares {declared} payload bytes but only {available} remain")]
    TruncatedPayload { sequence: u64, declared: u32, available: u64 },

    /// A malformation recorded earlier, e.g. while indexing.
    #[error("{0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CaptureError {
    pub fn is_malformed(&self) -> bool {
        !matches!(self, CaptureError::Io(_))
    }
}

impl From<CaptureError> for DetectError {
    fn from(e: CaptureError) -> Self {
        match e {
            CaptureError::Io(io) => DetectError::Io(io),
            other => DetectError::MalformedCapture { reason: other.to_string() },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Little,
    Big,
}

/// Single-pass boundary walker. Yields records in file order.
pub struct CaptureReader<R> {
    inner: R,
    position: u64,
    next_sequence: u64,
    order: ByteOrder,
    header_read: bool,
    done: bool,
}

impl CaptureReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let file = File::open(path.as_ref())?;
        Ok(CaptureReader::new(BufReader::with_capacity(BUFFER_SIZE, file)))
    }
}

impl<R: Read> CaptureReader<R> {
    pub fn new(inner: R) -> Self {
        CaptureReader {
            inner,
            position: 0,
            next_sequence: 1,
            order: ByteOrder::Little,
            header_read: false,
            done: false,
        }
    }

    /// Next record boundary, or `None` once fewer than 16 header bytes remain.
    pub fn next_record(&mut self) -> Result<Option<PacketRecord>, CaptureError> {
        if self.done {
            return Ok(None);
        }
        if !self.header_read {
            self.read_global_header()?;
        }

        let header_offset = self.position;
        let mut header = [0u8; RECORD_HEADER_LEN as usize];
        let got = self.fill(&mut header)?;
        if got < header.len() {
            if got > 0 {
                tracing::debug!(offset = header_offset, trailing = got, "ignoring partial record header at end of capture");
            }
            self.done = true;
            return Ok(None);
        }

        let len_bytes = [header[8], header[9], header[10], header[11]];
        let payload_length = match self.order {
            ByteOrder::Little => u32::from_le_bytes(len_bytes),
            ByteOrder::Big => u32::from_be_bytes(len_bytes),
        };

        let sequence = self.next_sequence;
        let skipped = io::copy(&mut (&mut self.inner).take(payload_length as u64), &mut io::sink())?;
        self.position += skipped;
        if skipped < payload_length as u64 {
            self.done = true;
            return Err(CaptureError::TruncatedPayload { sequence, declared: payload_length, available: skipped });
        }

        self.next_sequence += 1;
        Ok(Some(PacketRecord {
            sequence_number: sequence,
            header_offset,
            start_offset: header_offset + 1,
            end_offset: self.position,
            payload_length,
        }))
    }

    fn read_global_header(&mut self) -> Result<(), CaptureError> {
        let mut header = [0u8; GLOBAL_HEADER_LEN as usize];
        let got = self.fill(&mut header)?;
        self.header_read = true;
        if got < header.len() {
            self.done = true;
            return Err(CaptureError::ShortGlobalHeader(got as u64));
        }
        self.order = match [header[0], header[1], header[2], header[3]] {
            [0xa1, 0xb2, 0xc3, 0xd4] | [0xa1, 0xb2, 0x3c, 0x4d] => ByteOrder::Big,
            PCAPNG_MAGIC => {
                self.done = true;
                return Err(CaptureError::PcapNg);
            }
            [0xd4, 0xc3, 0xb2, 0xa1] | [0x4d, 0x3c, 0xb2, 0xa1] => ByteOrder::Little,
            other => {
                tracing::debug!(magic = ?other, "unknown capture magic, assuming little-endian records");
                ByteOrder::Little
            }
        };
        Ok(())
    }

    /// Reads until `buf` is full or the stream ends.
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.position += filled as u64;
        Ok(filled)
    }
}

impl<R: Read> Iterator for CaptureReader<R> {
    type Item = Result<PacketRecord, CaptureError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// Little-endian capture with one record per payload length.
    pub(crate) fn capture_bytes(payload_lengths: &[u32]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&[0xd4, 0xc3, 0xb2, 0xa1]);
        data.extend_from_slice(&[0x02, 0x00, 0x04, 0x00]);
        data.extend_from_slice(&[0u8; 8]);
        data.extend_from_slice(&65535u32.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());
        for (i, &len) in payload_lengths.iter().enumerate() {
            data.extend_from_slice(&(1_700_000_000u32 + i as u32).to_le_bytes());
            data.extend_from_slice(&0u32.to_le_bytes());
            data.extend_from_slice(&len.to_le_bytes());
            data.extend_from_slice(&len.to_le_bytes());
            data.extend(std::iter::repeat(0xab).take(len as usize));
        }
        data
    }

    fn records(data: Vec<u8>) -> Vec<PacketRecord> {
        CaptureReader::new(Cursor::new(data)).collect::<Result<Vec<_>, _>>().unwrap()
    }

    #[test]
    fn walks_record_boundaries() {
        let recs = records(capture_bytes(&[50, 50, 50]));
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0].sequence_number, 1);
        assert_eq!(recs[0].header_offset, 24);
        assert_eq!(recs[0].start_offset, 25);
        assert_eq!(recs[0].end_offset, 90);
        assert_eq!(recs[1].start_offset, 91);
        assert_eq!(recs[1].end_offset, 156);
        assert_eq!(recs[2].sequence_number, 3);
        assert_eq!(recs[2].end_offset, 222);
    }

    #[test]
    fn records_tile_the_file() {
        let data = capture_bytes(&[0, 1, 60, 1514, 7]);
        let total = data.len() as u64;
        let recs = records(data);
        let sum: u64 = recs.iter().map(|r| RECORD_HEADER_LEN + r.payload_length as u64).sum();
        assert_eq!(GLOBAL_HEADER_LEN + sum, total);
        for pair in recs.windows(2) {
            assert_eq!(pair[0].end_offset, pair[1].header_offset);
            assert_eq!(pair[1].sequence_number, pair[0].sequence_number + 1);
            assert!(!pair[1].contains(pair[0].end_offset));
        }
        for r in &recs {
            assert!(r.start_offset < r.end_offset);
            assert_eq!(r.record_len(), RECORD_HEADER_LEN + r.payload_length as u64);
        }
    }

    #[test]
    fn empty_capture_has_no_records() {
        assert!(records(capture_bytes(&[])).is_empty());
    }

    #[test]
    fn partial_trailing_header_is_end_of_file() {
        let mut data = capture_bytes(&[10]);
        data.extend_from_slice(&[1, 2, 3, 4, 5]);
        assert_eq!(records(data).len(), 1);
    }

    #[test]
    fn short_global_header_is_malformed() {
        let mut reader = CaptureReader::new(Cursor::new(vec![0xd4, 0xc3, 0xb2]));
        let err = reader.next_record().unwrap_err();
        assert!(matches!(err, CaptureError::ShortGlobalHeader(3)));
        assert!(err.is_malformed());
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn oversized_length_is_truncation() {
        let mut data = capture_bytes(&[20, 20]);
        // second record claims 4000 bytes
        let len_at = 24 + 16 + 20 + 8;
        data[len_at..len_at + 4].copy_from_slice(&4000u32.to_le_bytes());
        let mut reader = CaptureReader::new(Cursor::new(data));
        assert!(reader.next_record().unwrap().is_some());
        let err = reader.next_record().unwrap_err();
        assert!(matches!(err, CaptureError::TruncatedPayload { sequence: 2, declared: 4000, available: 20 }));
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn big_endian_lengths() {
        let mut data = vec![0xa1, 0xb2, 0xc3, 0xd4];
        data.extend_from_slice(&[0u8; 20]);
        data.extend_from_slice(&[0u8; 8]);
        data.extend_from_slice(&30u32.to_be_bytes());
        data.extend_from_slice(&30u32.to_be_bytes());
        data.extend_from_slice(&[0u8; 30]);
        let recs = records(data);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].payload_length, 30);
        assert_eq!(recs[0].end_offset, 24 + 16 + 30);
    }

    #[test]
    fn pcapng_rejected() {
        let mut data = PCAPNG_MAGIC.to_vec();
        data.extend_from_slice(&[0u8; 40]);
        let mut reader = CaptureReader::new(Cursor::new(data));
        assert!(matches!(reader.next_record(), Err(CaptureError::PcapNg)));
    }

    #[test]
    fn malformed_maps_to_detect_error() {
        let e: DetectError = CaptureError::PcapNg.into();
        assert!(matches!(e, DetectError::MalformedCapture { .. }));
        assert!(!e.is_fatal());
    }
}
