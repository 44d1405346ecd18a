//! Warden Engine - Access-Aware Cache Facade
//!
//! The stateless entrypoint over the substrate: permission-gated single
//! items, per-client private values, unprotected values, and
//! permission-aware collection caching with dominance matching. All
//! multi-key consistency lives in the substrate's atomic scripts; the
//! facade only names keys, orchestrates calls, and (de)serializes
//! payloads.
//!
//! # Example
//!
//! ```ignore
//! let substrate = Arc::new(MemorySubstrate::new());
//! let grammar = Arc::new(SegmentGrammar::new());
//! let cache = Cache::new(substrate, grammar);
//!
//! cache.set("item-1", &payload, ttl, "client-a", &perms).await?;
//! let hit: Option<Payload> = cache.get("client-a", "item-1").await?;
//! ```

mod admin;
mod config;
mod facade;

pub use config::CacheConfig;
pub use facade::Cache;

// Re-export the pieces callers need to assemble a cache.
pub use warden_core::{
    PermissionGrammar, SegmentGrammar, SubstrateError, WardenError, WardenResult,
};
pub use warden_substrate::{MemorySubstrate, Substrate};
