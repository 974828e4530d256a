//! Error types and small shared value types for the vhdstore workspace.
//!
//! Kept in its own crate so both the core library and the CLI binaries can
//! depend on a single definition of failure modes and the datapath URI
//! format, without the core crate pulling in CLI-only concerns.

mod error;
mod uri;

pub use error::{VhdStoreError, VhdStoreResult};
pub use uri::DatapathUri;
