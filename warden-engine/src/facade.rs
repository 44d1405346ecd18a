//! The cache facade: stateless orchestration of namer + scripts.
//!
//! Every operation is one or a few substrate calls; the ones that must be
//! indivisible (authorize-then-fetch, propagate, subset-then-fetch) are
//! single script invocations. Between calls the facade holds no locks -
//! all writes are additive to monotonic sets, so interleavings can only
//! make a later read see a larger set, never torn state.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;
use warden_core::{keys, PermissionGrammar, WardenError, WardenResult};
use warden_substrate::Substrate;

use crate::config::CacheConfig;

/// Access-aware cache over an atomic-script substrate.
///
/// Stateless: instances hold only the substrate handle, the grammar
/// provider, and configuration, and may be called concurrently from any
/// number of tasks.
pub struct Cache {
    pub(crate) substrate: Arc<dyn Substrate>,
    pub(crate) grammar: Arc<dyn PermissionGrammar>,
    pub(crate) config: CacheConfig,
}

impl Cache {
    /// Create a cache with default configuration.
    pub fn new(substrate: Arc<dyn Substrate>, grammar: Arc<dyn PermissionGrammar>) -> Self {
        Self::with_config(substrate, grammar, CacheConfig::default())
    }

    /// Create a cache with explicit configuration.
    pub fn with_config(
        substrate: Arc<dyn Substrate>,
        grammar: Arc<dyn PermissionGrammar>,
        config: CacheConfig,
    ) -> Self {
        Self {
            substrate,
            grammar,
            config,
        }
    }

    // ========================================================================
    // PROTECTED ITEMS
    // ========================================================================

    /// Store a protected item: write the payload, grow the client's and
    /// the item's permission sets through the propagate script, and
    /// re-arm the TTL on the item's perms key.
    ///
    /// An empty `perms` slice skips propagation entirely; the payload is
    /// still written.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        client_id: &str,
        perms: &[String],
    ) -> WardenResult<()> {
        let payload = encode(value)?;
        self.substrate
            .set(&keys::item_value(key), &payload, Some(ttl))
            .await?;
        if perms.is_empty() {
            debug!(item = key, "set with no permissions, skipping propagation");
            return Ok(());
        }
        self.substrate.propagate(key, perms, client_id).await?;
        self.substrate.expire(&keys::item_perms(key), ttl).await?;
        Ok(())
    }

    /// [`set`](Self::set) with the configured default TTL.
    pub async fn set_with_default_ttl<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        client_id: &str,
        perms: &[String],
    ) -> WardenResult<()> {
        self.set(key, value, self.config.default_ttl, client_id, perms)
            .await
    }

    /// Fetch a protected item. `None` when the client's permissions do
    /// not intersect the item's, or when the value expired.
    pub async fn get<T: DeserializeOwned>(
        &self,
        client_id: &str,
        key: &str,
    ) -> WardenResult<Option<T>> {
        let reply = self
            .substrate
            .authorize_get(
                &keys::client_perms(client_id),
                &keys::item_perms(key),
                &keys::item_value(key),
            )
            .await?;
        if !reply.authorized {
            debug!(client = client_id, item = key, "authorization miss");
            return Ok(None);
        }
        match reply.value {
            Some(bytes) => Ok(Some(decode(key, &bytes)?)),
            None => {
                // Perms outlived the value; the partial-expiry miss.
                debug!(item = key, "authorized but value expired");
                Ok(None)
            }
        }
    }

    // ========================================================================
    // PRIVATE ITEMS
    // ========================================================================

    /// Store a per-client value. Bypasses the permission gate: the value
    /// is reachable only through the same `(key, client_id)` pair.
    pub async fn set_private<T: Serialize>(
        &self,
        key: &str,
        client_id: &str,
        value: &T,
        ttl: Duration,
    ) -> WardenResult<()> {
        let payload = encode(value)?;
        self.substrate
            .set(&keys::item_private(key, client_id), &payload, Some(ttl))
            .await?;
        Ok(())
    }

    /// Fetch a per-client value.
    pub async fn get_private<T: DeserializeOwned>(
        &self,
        key: &str,
        client_id: &str,
    ) -> WardenResult<Option<T>> {
        match self.substrate.get(&keys::item_private(key, client_id)).await? {
            Some(bytes) => Ok(Some(decode(key, &bytes)?)),
            None => Ok(None),
        }
    }

    // ========================================================================
    // UNPROTECTED ITEMS
    // ========================================================================

    /// Store a value with no permission gate - unless the item is
    /// already protected, in which case this silently does nothing. That
    /// no-op is the documented contract, not an error: a protected item
    /// must never be downgraded by an unprotected writer.
    pub async fn set_unprotected<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> WardenResult<()> {
        if self.substrate.exists(&keys::item_perms(key)).await? {
            warn!(item = key, "unprotected write over protected item skipped");
            return Ok(());
        }
        let payload = encode(value)?;
        self.substrate
            .set(&keys::item_value(key), &payload, Some(ttl))
            .await?;
        Ok(())
    }

    /// [`set_unprotected`](Self::set_unprotected) with the configured
    /// default TTL.
    pub async fn set_unprotected_with_default_ttl<T: Serialize>(
        &self,
        key: &str,
        value: &T,
    ) -> WardenResult<()> {
        self.set_unprotected(key, value, self.config.default_ttl).await
    }

    /// Fetch a value through the unprotected path. Misses whenever a
    /// perms key exists: protected items are invisible here.
    pub async fn get_unprotected<T: DeserializeOwned>(&self, key: &str) -> WardenResult<Option<T>> {
        if self.substrate.exists(&keys::item_perms(key)).await? {
            debug!(item = key, "unprotected read of protected item");
            return Ok(None);
        }
        match self.substrate.get(&keys::item_value(key)).await? {
            Some(bytes) => Ok(Some(decode(key, &bytes)?)),
            None => Ok(None),
        }
    }

    // ========================================================================
    // COLLECTIONS
    // ========================================================================

    /// Cache a collection under a fresh variant: snapshot the writer's
    /// permissions through the collection's context filter and record
    /// which items the collection contained.
    ///
    /// Never idempotent - every call allocates a new variant. The
    /// context filter is persisted without a TTL; re-declaring it with a
    /// different pattern is rejected while
    /// [`enforce_filter_consistency`](crate::CacheConfig) is on.
    pub async fn set_collection(
        &self,
        client_id: &str,
        collection: &str,
        items: &[String],
        ttl: Duration,
        filter: &str,
    ) -> WardenResult<()> {
        self.declare_filter(collection, filter).await?;

        let variant = Uuid::now_v7().to_string();
        self.substrate
            .sadd(&keys::variant_items(collection, &variant), items)
            .await?;
        self.substrate
            .expire(&keys::variant_items(collection, &variant), ttl)
            .await?;

        let count = self
            .substrate
            .filter_permissions(
                &keys::client_perms(client_id),
                &keys::variant_perms(collection, &variant),
                filter,
            )
            .await?;
        self.substrate
            .expire(&keys::variant_perms(collection, &variant), ttl)
            .await?;
        self.substrate
            .set(
                &keys::variant_count(collection, &variant),
                count.to_string().as_bytes(),
                Some(ttl),
            )
            .await?;

        // Register the variant last so readers never pick up a variant
        // whose records are still being written.
        self.substrate
            .sadd(&keys::collection_variants(collection), &[variant.clone()])
            .await?;
        // Legacy flat view: the union of every variant's items, read by
        // set_backpropagation.
        self.substrate
            .sadd(&keys::collection_items(collection), items)
            .await?;

        debug!(
            collection,
            variant = %variant,
            items = items.len(),
            snapshot = count,
            "collection variant written"
        );
        Ok(())
    }

    /// Fetch a collection for a client via dominance matching. `None`
    /// when no variant's snapshot covers the client's filtered
    /// permissions.
    pub async fn get_collection<T: DeserializeOwned>(
        &self,
        client_id: &str,
        collection: &str,
    ) -> WardenResult<Option<Vec<T>>> {
        let reply = self.substrate.dominance_get(client_id, collection).await?;
        if !reply.hit {
            debug!(client = client_id, collection, "no dominating variant");
            return Ok(None);
        }
        let mut values = Vec::with_capacity(reply.values.len());
        for bytes in &reply.values {
            values.push(decode(collection, bytes)?);
        }
        Ok(Some(values))
    }

    async fn declare_filter(&self, collection: &str, filter: &str) -> WardenResult<()> {
        let filter_key = keys::collection_filter(collection);
        match self.substrate.get(&filter_key).await? {
            Some(existing) if existing == filter.as_bytes() => Ok(()),
            Some(existing) => {
                let existing = String::from_utf8_lossy(&existing).into_owned();
                if self.config.enforce_filter_consistency {
                    return Err(WardenError::FilterConflict {
                        collection: collection.to_string(),
                        existing,
                        requested: filter.to_string(),
                    });
                }
                warn!(
                    collection,
                    old = %existing,
                    new = %filter,
                    "replacing collection context filter"
                );
                self.substrate.set(&filter_key, filter.as_bytes(), None).await?;
                Ok(())
            }
            None => {
                self.substrate.set(&filter_key, filter.as_bytes(), None).await?;
                Ok(())
            }
        }
    }
}

fn encode<T: Serialize>(value: &T) -> WardenResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|err| WardenError::Serialize {
        reason: err.to_string(),
    })
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> WardenResult<T> {
    serde_json::from_slice(bytes).map_err(|err| WardenError::Deserialize {
        key: key.to_string(),
        reason: err.to_string(),
    })
}
