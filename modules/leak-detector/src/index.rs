//! One-time index of packet boundaries for captures with many matches.

use crate::capture::{CaptureError, CaptureReader, PacketRecord};
use leaktrace_core::CaptureOffset;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Identity of a capture file at index time. A mismatch means the file changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileKey {
    path: PathBuf,
    len: u64,
    modified: Option<SystemTime>,
}

impl FileKey {
    pub fn of(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(FileKey { path: path.to_path_buf(), len: meta.len(), modified: meta.modified().ok() })
    }
}

pub struct PacketIndex {
    key: FileKey,
    records: Vec<PacketRecord>,
    /// Set when the walk stopped on a malformed record instead of end-of-file.
    malformed_tail: Option<String>,
}

impl PacketIndex {
    pub fn build(path: &Path) -> Result<Self, CaptureError> {
        let key = FileKey::of(path)?;
        let mut reader = CaptureReader::open(path)?;
        let mut records = Vec::new();
        let mut malformed_tail = None;
        loop {
            match reader.next_record() {
                Ok(Some(r)) => records.push(r),
                Ok(None) => break,
                Err(e) if e.is_malformed() => {
                    malformed_tail = Some(e.to_string());
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        tracing::debug!(path = %path.display(), packets = records.len(), "indexed capture");
        Ok(PacketIndex { key, records, malformed_tail })
    }

    pub fn is_current(&self, path: &Path) -> bool {
        FileKey::of(path).map(|k| k == self.key).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Same answer a linear walk would give: the owning record, `None` past the
    /// last record, or the malformation that stopped the walk.
    pub fn lookup(&self, offset: CaptureOffset) -> Result<Option<PacketRecord>, CaptureError> {
        let idx = self.records.partition_point(|r| r.end_offset < offset);
        match self.records.get(idx) {
            Some(r) if r.contains(offset) => Ok(Some(*r)),
            // a walk for an unowned offset always reaches the tail
            _ => match &self.malformed_tail {
                Some(reason) => Err(CaptureError::Malformed(reason.clone())),
                None => Ok(None),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::tests::capture_bytes;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_capture(data: &[u8]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(data).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn lookup_matches_boundaries() {
        let f = temp_capture(&capture_bytes(&[50, 50, 50]));
        let idx = PacketIndex::build(f.path()).unwrap();
        assert_eq!(idx.len(), 3);
        assert!(!idx.is_empty());
        assert_eq!(idx.lookup(0).unwrap(), None);
        assert_eq!(idx.lookup(24).unwrap(), None);
        assert_eq!(idx.lookup(25).unwrap().unwrap().sequence_number, 1);
        assert_eq!(idx.lookup(90).unwrap().unwrap().sequence_number, 1);
        assert_eq!(idx.lookup(91).unwrap().unwrap().sequence_number, 2);
        assert_eq!(idx.lookup(222).unwrap().unwrap().sequence_number, 3);
        assert_eq!(idx.lookup(223).unwrap(), None);
    }

    #[test]
    fn truncated_tail_reported_past_valid_records() {
        let mut data = capture_bytes(&[20, 20]);
        let len_at = 24 + 16 + 20 + 8;
        data[len_at..len_at + 4].copy_from_slice(&999u32.to_le_bytes());
        let f = temp_capture(&data);
        let idx = PacketIndex::build(f.path()).unwrap();
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.lookup(30).unwrap().unwrap().sequence_number, 1);
        assert!(idx.lookup(70).is_err());
        assert!(idx.lookup(3).is_err());
    }

    #[test]
    fn empty_capture_indexes_nothing() {
        let f = temp_capture(&capture_bytes(&[]));
        let idx = PacketIndex::build(f.path()).unwrap();
        assert!(idx.is_empty());
        assert_eq!(idx.lookup(24).unwrap(), None);
    }

    #[test]
    fn detects_file_change() {
        let mut f = temp_capture(&capture_bytes(&[10]));
        let idx = PacketIndex::build(f.path()).unwrap();
        assert!(idx.is_current(f.path()));
        f.write_all(&capture_bytes(&[5])[24..]).unwrap();
        f.flush().unwrap();
        assert!(!idx.is_current(f.path()));
    }
}
