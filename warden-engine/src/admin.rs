//! Backpropagation admin: wiring the permission-flow topology.
//!
//! Edges must be installed BEFORE the writes whose permissions should
//! flow through them: the propagate script reads each item's current
//! edges to decide where permissions go.

use tracing::debug;
use warden_core::{keys, WardenResult};

use crate::facade::Cache;

impl Cache {
    /// Install a typed backprop edge from every current member of the
    /// collection's legacy item set to `target`.
    ///
    /// After this, any permission matching `edge_type` that lands on one
    /// of those items also lands on `target`, transitively. Idempotent:
    /// edges are set members.
    pub async fn set_backpropagation(
        &self,
        collection: &str,
        edge_type: &str,
        target: &str,
    ) -> WardenResult<()> {
        let items = self
            .substrate
            .smembers(&keys::collection_items(collection))
            .await?;
        for item in &items {
            self.substrate
                .sadd(&keys::item_backprop(item, edge_type), &[target.to_string()])
                .await?;
        }
        debug!(
            collection,
            edge_type,
            target,
            items = items.len(),
            "backprop edges installed"
        );
        Ok(())
    }

    /// Wire every key to every other under the universal type pattern,
    /// so the whole clique shares all future permissions in both
    /// directions. Used for aliased cache entries that represent the
    /// same real-world entity. Idempotent.
    pub async fn set_permission_union(&self, items: &[&str]) -> WardenResult<()> {
        let every_type = self.grammar.every_type_pattern();
        let mut unique: Vec<&str> = Vec::with_capacity(items.len());
        for item in items.iter().copied() {
            if !unique.contains(&item) {
                unique.push(item);
            }
        }
        for source in unique.iter().copied() {
            for target in unique.iter().copied() {
                if source != target {
                    self.substrate
                        .sadd(
                            &keys::item_backprop(source, &every_type),
                            &[target.to_string()],
                        )
                        .await?;
                }
            }
        }
        debug!(members = unique.len(), "permission union wired");
        Ok(())
    }
}
