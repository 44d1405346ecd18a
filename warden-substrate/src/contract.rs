//! Substrate contract: string and set primitives plus atomic scripts.
//!
//! The engine's consistency story depends on two substrate guarantees:
//! linearizability per key, and all-or-nothing execution of each script
//! method with no interleaved commands. Implementations must uphold both.

use async_trait::async_trait;
use std::time::Duration;
use warden_core::SubstrateResult;

/// Reply from the authorize-get script.
///
/// `authorized` reports the permission intersection; `value` is the
/// payload fetched in the same atomic step, and may be `None` even when
/// authorized if the value key expired independently of the perms key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeReply {
    pub authorized: bool,
    pub value: Option<Vec<u8>>,
}

/// Reply from the dominance-get script: whether some variant dominated
/// the caller, and the payloads the caller is allowed to see from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DominanceReply {
    pub hit: bool,
    pub values: Vec<Vec<u8>>,
}

/// The abstract storage service the engine runs against.
///
/// String values are opaque byte strings. Sets are unordered collections
/// of UTF-8 members; implementations expose them in a stable order (the
/// reference substrate uses lexicographic order). A `ttl` of `None` means
/// the key does not expire.
#[async_trait]
pub trait Substrate: Send + Sync {
    // ========================================================================
    // STRING PRIMITIVES
    // ========================================================================

    /// Read a string value. `None` when absent or expired.
    async fn get(&self, key: &str) -> SubstrateResult<Option<Vec<u8>>>;

    /// Write a string value, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> SubstrateResult<()>;

    /// Whether a live key of any kind exists.
    async fn exists(&self, key: &str) -> SubstrateResult<bool>;

    /// Re-arm a key's TTL. Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> SubstrateResult<bool>;

    // ========================================================================
    // SET PRIMITIVES
    // ========================================================================

    /// Add members to a set, creating it without a TTL if absent.
    /// Returns the number of members newly added.
    async fn sadd(&self, key: &str, members: &[String]) -> SubstrateResult<usize>;

    /// All members of a set; empty when the key is absent.
    async fn smembers(&self, key: &str) -> SubstrateResult<Vec<String>>;

    /// Intersection of two sets.
    async fn sinter(&self, lhs: &str, rhs: &str) -> SubstrateResult<Vec<String>>;

    /// Cardinality of a set; zero when absent.
    async fn scard(&self, key: &str) -> SubstrateResult<usize>;

    /// Membership test for each of `members`, in order.
    async fn smismember(&self, key: &str, members: &[String]) -> SubstrateResult<Vec<bool>>;

    // ========================================================================
    // ATOMIC SCRIPTS
    // ========================================================================
    //
    // Each method below runs as one indivisible unit inside the substrate.
    // Readers never observe a partial run, and a failed run leaves no
    // partial writes behind.

    /// Propagate script (write path): add `perms` to the client's
    /// permission set and to the root item, then flow them through the
    /// backprop graph, re-filtering by each edge's type pattern.
    /// Cycle-safe; a malformed edge key aborts the run.
    async fn propagate(
        &self,
        root_item: &str,
        perms: &[String],
        client_id: &str,
    ) -> SubstrateResult<()>;

    /// Authorize-get script (read path): intersect the client's perms
    /// with the item's perms and fetch the value in the same step.
    async fn authorize_get(
        &self,
        client_perms_key: &str,
        item_perms_key: &str,
        value_key: &str,
    ) -> SubstrateResult<AuthorizeReply>;

    /// Filter-permissions script (collection write): copy every client
    /// permission matching `pattern` into `dst_key`; returns the
    /// destination's resulting cardinality.
    async fn filter_permissions(
        &self,
        client_perms_key: &str,
        dst_key: &str,
        pattern: &str,
    ) -> SubstrateResult<usize>;

    /// Dominance-get script (collection read): find the best variant of
    /// `collection_key` whose permission snapshot dominates the caller's
    /// filtered permissions, and emit the values the caller intersects
    /// with.
    async fn dominance_get(
        &self,
        client_id: &str,
        collection_key: &str,
    ) -> SubstrateResult<DominanceReply>;
}
