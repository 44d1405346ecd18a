//! Warden Core - Shared Types
//!
//! Pure data structures and pure functions with no I/O. All other crates
//! depend on this. This crate contains the error types, the on-substrate
//! key layout, the substrate pattern dialect, and the permission grammar
//! contract - no storage logic.

mod error;
pub mod grammar;
pub mod keys;
pub mod pattern;

// Re-export error types
pub use error::*;

// Re-export the grammar contract and its default implementation
pub use grammar::{PermissionGrammar, SegmentGrammar};

// Re-export the pattern entry points
pub use pattern::PatternError;
