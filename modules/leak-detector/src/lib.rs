//! Attribution of pattern-scanner hits in a packet capture to the packets,
//! hosts and time windows they belong to.
//!
//! The scanner reports raw byte offsets into the capture file. The
//! [`resolver`] walks the capture's record boundaries to find the packet that
//! owns an offset and has the dissector fill in its 5-tuple; the
//! [`correlate`] step decides which monitored host is the victim and writes
//! one evidence record per attributable hit.

pub mod capture;
pub mod correlate;
pub mod detector;
pub mod index;
pub mod resolver;
pub mod tshark;
pub mod yara;

pub use capture::{CaptureError, CaptureReader, PacketRecord};
pub use correlate::{Attribution, Correlator, Outcome, Suppression};
pub use detector::{Failure, LeakDetector, RunSummary};
pub use resolver::{LocateStrategy, Miss, OffsetResolver, Resolution, ResolvedPacket};
pub use tshark::{DissectError, Dissector, TsharkDissector};
pub use yara::{ScanError, Scanner, YaraScanner};
