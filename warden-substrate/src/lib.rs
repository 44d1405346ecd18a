//! Warden Substrate - Storage Abstraction
//!
//! Defines the abstract key-value + set + atomic-script service the cache
//! engine runs against, and ships the in-memory reference substrate used
//! in tests and single-process deployments. A networked substrate (any
//! server with per-key linearizability and atomic scripting) implements
//! the same trait.

pub mod contract;
pub mod memory;
mod scripts;

pub use contract::{AuthorizeReply, DominanceReply, Substrate};
pub use memory::MemorySubstrate;
