//! On-substrate key layout for the cache engine.
//!
//! Every function here is pure and total: logical names in, substrate keys
//! out. The layout is part of the external contract - atomic scripts walk
//! it and integration tests probe it - so it must never drift.
//!
//! # Layout
//!
//! ```text
//! item:<itemKey>:value
//! item:<itemKey>:perms
//! item:<itemKey>:backprop:<typeToken>
//! item:<itemKey>:private:<clientID>
//! client:<clientID>:perms
//! collection:<ck>:items                  (legacy flat set)
//! collection:<ck>:variants
//! collection:<ck>:filter                 (never expired)
//! collection:<ck>:<variantID>:items
//! collection:<ck>:<variantID>:perms
//! collection:<ck>:<variantID>:count
//! ```

/// Prefix owned by item records.
pub const ITEM_PREFIX: &str = "item:";

/// Prefix owned by client permission sets.
pub const CLIENT_PREFIX: &str = "client:";

/// Prefix owned by collection records.
pub const COLLECTION_PREFIX: &str = "collection:";

/// Key of an item's payload.
pub fn item_value(item: &str) -> String {
    format!("{ITEM_PREFIX}{item}:value")
}

/// Key of an item's permission set.
pub fn item_perms(item: &str) -> String {
    format!("{ITEM_PREFIX}{item}:perms")
}

/// Key of an item's backpropagation edge set for one permission type.
pub fn item_backprop(item: &str, edge_type: &str) -> String {
    format!("{ITEM_PREFIX}{item}:backprop:{edge_type}")
}

/// Key of an item's per-client private value.
pub fn item_private(item: &str, client: &str) -> String {
    format!("{ITEM_PREFIX}{item}:private:{client}")
}

/// Key of a client's accumulated permission set.
pub fn client_perms(client: &str) -> String {
    format!("{CLIENT_PREFIX}{client}:perms")
}

/// Key of a collection's legacy flat item set, the one read by
/// `set_backpropagation`. Maintained as the union of all variant item sets.
pub fn collection_items(collection: &str) -> String {
    format!("{COLLECTION_PREFIX}{collection}:items")
}

/// Key of a collection's variant-id set.
pub fn collection_variants(collection: &str) -> String {
    format!("{COLLECTION_PREFIX}{collection}:variants")
}

/// Key of a collection's context filter. This key is never expired: the
/// filter is topology, not data.
pub fn collection_filter(collection: &str) -> String {
    format!("{COLLECTION_PREFIX}{collection}:filter")
}

/// Key of one variant's item set.
pub fn variant_items(collection: &str, variant: &str) -> String {
    format!("{COLLECTION_PREFIX}{collection}:{variant}:items")
}

/// Key of one variant's permission snapshot.
pub fn variant_perms(collection: &str, variant: &str) -> String {
    format!("{COLLECTION_PREFIX}{collection}:{variant}:perms")
}

/// Key of one variant's cached permission count.
pub fn variant_count(collection: &str, variant: &str) -> String {
    format!("{COLLECTION_PREFIX}{collection}:{variant}:count")
}

/// Prefix under which all of an item's backprop edge keys live. The
/// propagate script enumerates substrate keys with this prefix to discover
/// the item's out-edges.
pub fn backprop_prefix(item: &str) -> String {
    format!("{ITEM_PREFIX}{item}:backprop:")
}

/// Extract the edge type token from a backprop edge key of `item`.
///
/// Returns `None` when the key is not an edge key of `item`, or when the
/// type suffix is empty - the latter is the malformed-edge case the
/// propagate script must treat as fatal rather than skip.
pub fn edge_type_from_key<'a>(item: &str, key: &'a str) -> Option<&'a str> {
    let prefix = backprop_prefix(item);
    let suffix = key.strip_prefix(prefix.as_str())?;
    if suffix.is_empty() {
        None
    } else {
        Some(suffix)
    }
}
