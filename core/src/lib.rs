//! Shared types and contracts for the leaktrace workspace.

pub mod backoff;
pub mod cancel;
pub mod error;
pub mod model;
pub mod store;

pub use backoff::Backoff;
pub use cancel::CancelFlag;
pub use error::DetectError;
pub use model::*;
pub use store::EvidenceStore;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
