//! The four atomic script kernels.
//!
//! These are the operations a networked substrate would run server-side
//! as atomic scripts. Here they are methods on the locked [`State`], so a
//! single lock acquisition in [`MemorySubstrate`] gives the same
//! guarantee: no reader observes a partial run.
//!
//! The naive host-side flow - read perms, test membership, fetch value -
//! is racy against a concurrent write. Fusing authorize-then-fetch and
//! subset-then-fetch into one kernel is what makes the access check
//! non-bypassable.
//!
//! [`MemorySubstrate`]: crate::memory::MemorySubstrate

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::time::Instant;

use warden_core::pattern::Pattern;
use warden_core::{keys, SubstrateError, SubstrateResult};

use crate::contract::{AuthorizeReply, DominanceReply};
use crate::memory::State;

impl State {
    /// Propagate: grow the client's permission set and the root item's
    /// permission set by `perms`, then flow the new permissions through
    /// the backprop graph.
    ///
    /// Each frontier entry carries the permission subset that reached it;
    /// every hop re-filters that subset by the edge's type pattern. The
    /// visited set guarantees termination on cyclic graphs: a node is
    /// traversed at most once per run, though later paths may still union
    /// more permissions into an already-visited node.
    pub(crate) fn run_propagate(
        &mut self,
        root_item: &str,
        perms: &[String],
        client_id: &str,
        now: Instant,
    ) -> SubstrateResult<()> {
        if perms.is_empty() {
            return Ok(());
        }

        // The traversal only reads topology, so all additions are planned
        // first and applied at the end: a malformed edge or pattern aborts
        // the run with nothing written, per the all-or-nothing contract.
        let mut planned: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        planned
            .entry(keys::client_perms(client_id))
            .or_default()
            .extend(perms.iter().cloned());

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(root_item.to_string());
        let mut frontier: VecDeque<(String, Vec<String>)> = VecDeque::new();
        frontier.push_back((root_item.to_string(), perms.to_vec()));

        while let Some((item, carried)) = frontier.pop_front() {
            planned
                .entry(keys::item_perms(&item))
                .or_default()
                .extend(carried.iter().cloned());

            let prefix = keys::backprop_prefix(&item);
            let edge_keys: Vec<String> = self
                .entries
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&prefix))
                .filter(|(_, entry)| entry.is_live(now))
                .map(|(key, _)| key.clone())
                .collect();

            for edge_key in edge_keys {
                let edge_type = keys::edge_type_from_key(&item, &edge_key).ok_or_else(|| {
                    SubstrateError::Script {
                        reason: format!("malformed backprop edge key {edge_key:?}"),
                    }
                })?;
                let edge_pattern = Pattern::compile(edge_type)?;
                let matching: Vec<String> = carried
                    .iter()
                    .filter(|perm| edge_pattern.matches(perm))
                    .cloned()
                    .collect();
                if matching.is_empty() {
                    continue;
                }
                let targets: Vec<String> = match self.set_value(&edge_key, now)? {
                    Some(members) => members.iter().cloned().collect(),
                    None => continue,
                };
                for target in targets {
                    planned
                        .entry(keys::item_perms(&target))
                        .or_default()
                        .extend(matching.iter().cloned());
                    if visited.insert(target.clone()) {
                        frontier.push_back((target, matching.clone()));
                    }
                }
            }
        }

        // Validate every destination before the first write.
        for key in planned.keys() {
            if matches!(
                self.live(key, now),
                Some(crate::memory::Entry {
                    slot: crate::memory::Slot::Str(_),
                    ..
                })
            ) {
                return Err(SubstrateError::WrongType { key: key.clone() });
            }
        }
        for (key, members) in planned {
            let members: Vec<String> = members.into_iter().collect();
            self.add_members(&key, &members, now)?;
        }

        Ok(())
    }

    /// Authorize-get: intersect client perms with item perms, fetching
    /// the value in the same step. An authorized reply can still carry no
    /// value when the value key expired independently of the perms key.
    pub(crate) fn run_authorize_get(
        &self,
        client_perms_key: &str,
        item_perms_key: &str,
        value_key: &str,
        now: Instant,
    ) -> SubstrateResult<AuthorizeReply> {
        let client = self.set_value(client_perms_key, now)?;
        let item = self.set_value(item_perms_key, now)?;
        let authorized = match (client, item) {
            (Some(client), Some(item)) => client.intersection(item).next().is_some(),
            _ => false,
        };
        if !authorized {
            return Ok(AuthorizeReply {
                authorized: false,
                value: None,
            });
        }
        Ok(AuthorizeReply {
            authorized: true,
            value: self.str_value(value_key, now)?.cloned(),
        })
    }

    /// Filter-permissions: copy every client permission matching
    /// `pattern` into `dst_key` and report the destination cardinality.
    pub(crate) fn run_filter_permissions(
        &mut self,
        client_perms_key: &str,
        dst_key: &str,
        pattern: &str,
        now: Instant,
    ) -> SubstrateResult<usize> {
        let compiled = Pattern::compile(pattern)?;
        let matching: Vec<String> = self
            .set_value(client_perms_key, now)?
            .map(|members| {
                members
                    .iter()
                    .filter(|member| compiled.matches(member))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        self.add_members(dst_key, &matching, now)?;
        Ok(self.set_value(dst_key, now)?.map_or(0, BTreeSet::len))
    }

    /// Dominance-get: serve a collection from the best variant whose
    /// permission snapshot dominates the caller.
    ///
    /// Variants are tried in descending order of their cached permission
    /// count - the widest known snapshot is the most likely to dominate.
    /// A dominating variant holding an item the caller intersects with
    /// but whose value has expired is stale: the whole variant is
    /// abandoned and the next one tried.
    pub(crate) fn run_dominance_get(
        &self,
        client_id: &str,
        collection_key: &str,
        now: Instant,
    ) -> SubstrateResult<DominanceReply> {
        let miss = DominanceReply {
            hit: false,
            values: Vec::new(),
        };

        let filter = match self.str_value(&keys::collection_filter(collection_key), now)? {
            Some(bytes) => {
                String::from_utf8(bytes.clone()).map_err(|_| SubstrateError::Script {
                    reason: format!("context filter of {collection_key:?} is not UTF-8"),
                })?
            }
            None => return Ok(miss),
        };
        let compiled = Pattern::compile(&filter)?;

        let client_perms: BTreeSet<String> = self
            .set_value(&keys::client_perms(client_id), now)?
            .cloned()
            .unwrap_or_default();
        let client_filtered: Vec<&String> = client_perms
            .iter()
            .filter(|perm| compiled.matches(perm))
            .collect();

        let variants = match self.set_value(&keys::collection_variants(collection_key), now)? {
            Some(variants) if !variants.is_empty() => variants.clone(),
            _ => return Ok(miss),
        };

        // Variants whose count key expired are skipped outright; the
        // count is the cheapest liveness probe for the whole variant.
        let mut ranked: Vec<(String, usize)> = Vec::new();
        for variant in &variants {
            let Some(bytes) = self.str_value(&keys::variant_count(collection_key, variant), now)?
            else {
                continue;
            };
            let count: usize = std::str::from_utf8(bytes)
                .ok()
                .and_then(|text| text.parse().ok())
                .ok_or_else(|| SubstrateError::Script {
                    reason: format!("unreadable count for variant {variant:?}"),
                })?;
            ranked.push((variant.clone(), count));
        }
        ranked.sort_by(|a, b| b.1.cmp(&a.1));

        'variants: for (variant, _) in &ranked {
            let dominated = match self.set_value(&keys::variant_perms(collection_key, variant), now)? {
                Some(snapshot) => client_filtered.iter().all(|perm| snapshot.contains(*perm)),
                None => client_filtered.is_empty(),
            };
            if !dominated {
                continue;
            }

            let items = self
                .set_value(&keys::variant_items(collection_key, variant), now)?
                .cloned()
                .unwrap_or_default();
            let mut emitted: Vec<Vec<u8>> = Vec::new();
            for item in &items {
                // Per-item re-check against the FULL client permission
                // set: dominance admits the variant, this decides which
                // of its items this caller may actually see.
                let intersects = self
                    .set_value(&keys::item_perms(item), now)?
                    .map_or(false, |perms| {
                        perms.intersection(&client_perms).next().is_some()
                    });
                if !intersects {
                    continue;
                }
                match self.str_value(&keys::item_value(item), now)? {
                    Some(value) => emitted.push(value.clone()),
                    None => continue 'variants,
                }
            }
            return Ok(DominanceReply {
                hit: true,
                values: emitted,
            });
        }

        Ok(miss)
    }
}

#[cfg(test)]
mod tests {
    use crate::contract::Substrate;
    use crate::memory::MemorySubstrate;
    use std::time::Duration;
    use warden_core::keys;

    const TTL: Duration = Duration::from_secs(600);

    async fn seed_item(substrate: &MemorySubstrate, item: &str, value: &[u8], perms: &[&str]) {
        substrate
            .set(&keys::item_value(item), value, Some(TTL))
            .await
            .unwrap();
        let perms: Vec<String> = perms.iter().map(|p| p.to_string()).collect();
        substrate
            .sadd(&keys::item_perms(item), &perms)
            .await
            .unwrap();
    }

    async fn grant(substrate: &MemorySubstrate, client: &str, perms: &[&str]) {
        let perms: Vec<String> = perms.iter().map(|p| p.to_string()).collect();
        substrate
            .sadd(&keys::client_perms(client), &perms)
            .await
            .unwrap();
    }

    // ========================================================================
    // PROPAGATE
    // ========================================================================

    #[tokio::test]
    async fn test_propagate_updates_client_and_item_together() {
        let substrate = MemorySubstrate::new();
        substrate
            .propagate("item-1", &["perm:read".to_string()], "client-a")
            .await
            .unwrap();
        assert_eq!(
            substrate.smembers(&keys::item_perms("item-1")).await.unwrap(),
            vec!["perm:read".to_string()]
        );
        assert_eq!(
            substrate
                .smembers(&keys::client_perms("client-a"))
                .await
                .unwrap(),
            vec!["perm:read".to_string()]
        );
    }

    #[tokio::test]
    async fn test_propagate_empty_perms_is_a_no_op() {
        let substrate = MemorySubstrate::new();
        substrate.propagate("item-1", &[], "client-a").await.unwrap();
        assert!(substrate.is_empty());
    }

    #[tokio::test]
    async fn test_propagate_follows_typed_edges() {
        let substrate = MemorySubstrate::new();
        substrate
            .sadd(
                &keys::item_backprop("child", "perm:type:%d+"),
                &["parent".to_string()],
            )
            .await
            .unwrap();

        substrate
            .propagate(
                "child",
                &["perm:type:42".to_string(), "perm:othertype:9".to_string()],
                "client-a",
            )
            .await
            .unwrap();

        let parent = substrate.smembers(&keys::item_perms("parent")).await.unwrap();
        assert_eq!(parent, vec!["perm:type:42".to_string()]);
        let child = substrate.smembers(&keys::item_perms("child")).await.unwrap();
        assert_eq!(
            child,
            vec!["perm:othertype:9".to_string(), "perm:type:42".to_string()]
        );
    }

    #[tokio::test]
    async fn test_propagate_refilters_at_every_hop() {
        let substrate = MemorySubstrate::new();
        // child -(digits)-> mid -(letters)-> top
        substrate
            .sadd(&keys::item_backprop("child", "%d+"), &["mid".to_string()])
            .await
            .unwrap();
        substrate
            .sadd(&keys::item_backprop("mid", "%a+"), &["top".to_string()])
            .await
            .unwrap();

        substrate
            .propagate("child", &["123".to_string(), "abc".to_string()], "c")
            .await
            .unwrap();

        // "123" reaches mid; nothing survives mid's letters-only edge.
        assert_eq!(
            substrate.smembers(&keys::item_perms("mid")).await.unwrap(),
            vec!["123".to_string()]
        );
        assert_eq!(
            substrate.smembers(&keys::item_perms("top")).await.unwrap(),
            Vec::<String>::new()
        );
    }

    #[tokio::test]
    async fn test_propagate_terminates_on_cycles() {
        let substrate = MemorySubstrate::new();
        substrate
            .sadd(&keys::item_backprop("a", ".*"), &["b".to_string()])
            .await
            .unwrap();
        substrate
            .sadd(&keys::item_backprop("b", ".*"), &["a".to_string()])
            .await
            .unwrap();

        substrate
            .propagate("a", &["perm:cycle".to_string()], "c")
            .await
            .unwrap();

        for item in ["a", "b"] {
            assert_eq!(
                substrate.smembers(&keys::item_perms(item)).await.unwrap(),
                vec!["perm:cycle".to_string()],
                "item {item} missing the propagated permission"
            );
        }
    }

    #[tokio::test]
    async fn test_propagate_multiple_edges_to_same_target_union() {
        let substrate = MemorySubstrate::new();
        substrate
            .sadd(&keys::item_backprop("src", "%d+"), &["dst".to_string()])
            .await
            .unwrap();
        substrate
            .sadd(&keys::item_backprop("src", "%a+"), &["dst".to_string()])
            .await
            .unwrap();

        substrate
            .propagate("src", &["123".to_string(), "abc".to_string()], "c")
            .await
            .unwrap();

        assert_eq!(
            substrate.smembers(&keys::item_perms("dst")).await.unwrap(),
            vec!["123".to_string(), "abc".to_string()]
        );
    }

    #[tokio::test]
    async fn test_propagate_malformed_edge_key_is_fatal() {
        let substrate = MemorySubstrate::new();
        // An edge key with an empty type suffix.
        substrate
            .sadd("item:bad:backprop:", &["other".to_string()])
            .await
            .unwrap();

        let err = substrate
            .propagate("bad", &["perm:x".to_string()], "c")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            warden_core::SubstrateError::Script { .. }
        ));
    }

    // ========================================================================
    // AUTHORIZE-GET
    // ========================================================================

    #[tokio::test]
    async fn test_authorize_get_requires_intersection() {
        let substrate = MemorySubstrate::new();
        seed_item(&substrate, "item-1", b"payload", &["perm:read"]).await;
        grant(&substrate, "client-a", &["perm:read", "perm:extra"]).await;
        grant(&substrate, "client-b", &["perm:other"]).await;

        let reply = substrate
            .authorize_get(
                &keys::client_perms("client-a"),
                &keys::item_perms("item-1"),
                &keys::item_value("item-1"),
            )
            .await
            .unwrap();
        assert!(reply.authorized);
        assert_eq!(reply.value, Some(b"payload".to_vec()));

        let reply = substrate
            .authorize_get(
                &keys::client_perms("client-b"),
                &keys::item_perms("item-1"),
                &keys::item_value("item-1"),
            )
            .await
            .unwrap();
        assert!(!reply.authorized);
        assert_eq!(reply.value, None);
    }

    #[tokio::test]
    async fn test_authorize_get_authorized_but_value_expired() {
        let substrate = MemorySubstrate::new();
        grant(&substrate, "c", &["perm:read"]).await;
        substrate
            .sadd(&keys::item_perms("i"), &["perm:read".to_string()])
            .await
            .unwrap();
        // perms alive, value never written: authorized with no payload.
        let reply = substrate
            .authorize_get(
                &keys::client_perms("c"),
                &keys::item_perms("i"),
                &keys::item_value("i"),
            )
            .await
            .unwrap();
        assert!(reply.authorized);
        assert_eq!(reply.value, None);
    }

    // ========================================================================
    // FILTER-PERMISSIONS
    // ========================================================================

    #[tokio::test]
    async fn test_filter_permissions_copies_matches_and_counts() {
        let substrate = MemorySubstrate::new();
        grant(&substrate, "c", &["perm:x:1", "perm:x:2", "perm:y:1"]).await;

        let count = substrate
            .filter_permissions(&keys::client_perms("c"), "dst", "perm:x:.*")
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            substrate.smembers("dst").await.unwrap(),
            vec!["perm:x:1".to_string(), "perm:x:2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_filter_permissions_no_matches_leaves_dst_absent() {
        let substrate = MemorySubstrate::new();
        grant(&substrate, "c", &["perm:y:1"]).await;
        let count = substrate
            .filter_permissions(&keys::client_perms("c"), "dst", "perm:x:.*")
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert!(!substrate.exists("dst").await.unwrap());
    }

    #[tokio::test]
    async fn test_filter_permissions_malformed_pattern_errors() {
        let substrate = MemorySubstrate::new();
        grant(&substrate, "c", &["perm:x:1"]).await;
        assert!(substrate
            .filter_permissions(&keys::client_perms("c"), "dst", "%")
            .await
            .is_err());
    }

    // ========================================================================
    // DOMINANCE-GET
    // ========================================================================

    async fn seed_variant(
        substrate: &MemorySubstrate,
        collection: &str,
        variant: &str,
        items: &[&str],
        perms: &[&str],
    ) {
        let items: Vec<String> = items.iter().map(|i| i.to_string()).collect();
        substrate
            .sadd(&keys::variant_items(collection, variant), &items)
            .await
            .unwrap();
        let perms: Vec<String> = perms.iter().map(|p| p.to_string()).collect();
        substrate
            .sadd(&keys::variant_perms(collection, variant), &perms)
            .await
            .unwrap();
        substrate
            .set(
                &keys::variant_count(collection, variant),
                perms.len().to_string().as_bytes(),
                Some(TTL),
            )
            .await
            .unwrap();
        substrate
            .sadd(&keys::collection_variants(collection), &[variant.to_string()])
            .await
            .unwrap();
    }

    async fn seed_filter(substrate: &MemorySubstrate, collection: &str, filter: &str) {
        substrate
            .set(&keys::collection_filter(collection), filter.as_bytes(), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dominance_missing_collection_is_a_miss() {
        let substrate = MemorySubstrate::new();
        let reply = substrate.dominance_get("c", "nope").await.unwrap();
        assert!(!reply.hit);
        assert!(reply.values.is_empty());
    }

    #[tokio::test]
    async fn test_dominance_subset_hit_with_per_item_filtering() {
        let substrate = MemorySubstrate::new();
        seed_item(&substrate, "item-a", b"A", &["perm:x:1"]).await;
        seed_item(&substrate, "item-b", b"B", &["perm:x:2"]).await;
        seed_item(&substrate, "item-c", b"C", &["perm:x:3"]).await;
        seed_filter(&substrate, "coll", "perm:x:.*").await;
        seed_variant(
            &substrate,
            "coll",
            "v1",
            &["item-a", "item-b", "item-c"],
            &["perm:x:1", "perm:x:2", "perm:x:3"],
        )
        .await;
        grant(&substrate, "reader", &["perm:x:1", "perm:x:2"]).await;

        let reply = substrate.dominance_get("reader", "coll").await.unwrap();
        assert!(reply.hit);
        assert_eq!(reply.values, vec![b"A".to_vec(), b"B".to_vec()]);
    }

    #[tokio::test]
    async fn test_dominance_extra_client_perm_is_a_miss() {
        let substrate = MemorySubstrate::new();
        seed_filter(&substrate, "coll", "perm:read:%d+").await;
        seed_variant(
            &substrate,
            "coll",
            "v1",
            &["item-a"],
            &["perm:read:1", "perm:read:2"],
        )
        .await;
        grant(&substrate, "reader", &["perm:read:1", "perm:read:3"]).await;

        let reply = substrate.dominance_get("reader", "coll").await.unwrap();
        assert!(!reply.hit);
    }

    #[tokio::test]
    async fn test_dominance_irrelevant_perms_do_not_break_the_subset() {
        let substrate = MemorySubstrate::new();
        seed_item(&substrate, "item-a", b"A", &["perm:x:1"]).await;
        seed_filter(&substrate, "coll", "perm:x:.*").await;
        seed_variant(&substrate, "coll", "v1", &["item-a"], &["perm:x:1"]).await;
        // perm:unrelated is outside the context filter and must not count.
        grant(&substrate, "reader", &["perm:x:1", "perm:unrelated"]).await;

        let reply = substrate.dominance_get("reader", "coll").await.unwrap();
        assert!(reply.hit);
        assert_eq!(reply.values, vec![b"A".to_vec()]);
    }

    #[tokio::test]
    async fn test_dominance_stale_variant_falls_through_to_next() {
        let substrate = MemorySubstrate::new();
        seed_item(&substrate, "alive", b"ALIVE", &["perm:x:1"]).await;
        // "gone" has perms but its value was never written (expired).
        substrate
            .sadd(&keys::item_perms("gone"), &["perm:x:1".to_string()])
            .await
            .unwrap();

        seed_filter(&substrate, "coll", "perm:x:.*").await;
        // Wider variant (tried first) contains the stale item.
        seed_variant(
            &substrate,
            "coll",
            "v-wide",
            &["alive", "gone"],
            &["perm:x:1", "perm:x:2"],
        )
        .await;
        seed_variant(&substrate, "coll", "v-narrow", &["alive"], &["perm:x:1"]).await;
        grant(&substrate, "reader", &["perm:x:1"]).await;

        let reply = substrate.dominance_get("reader", "coll").await.unwrap();
        assert!(reply.hit);
        assert_eq!(reply.values, vec![b"ALIVE".to_vec()]);
    }

    #[tokio::test]
    async fn test_dominance_expired_count_skips_variant() {
        let substrate = MemorySubstrate::new();
        seed_item(&substrate, "item-a", b"A", &["perm:x:1"]).await;
        seed_filter(&substrate, "coll", "perm:x:.*").await;
        seed_variant(&substrate, "coll", "v1", &["item-a"], &["perm:x:1"]).await;
        // Kill v1's count: the variant must be skipped entirely.
        substrate
            .set(&keys::variant_count("coll", "v1"), b"1", Some(Duration::from_millis(5)))
            .await
            .unwrap();
        std::thread::sleep(Duration::from_millis(15));
        grant(&substrate, "reader", &["perm:x:1"]).await;

        let reply = substrate.dominance_get("reader", "coll").await.unwrap();
        assert!(!reply.hit);
    }

    #[tokio::test]
    async fn test_dominance_prefers_widest_variant() {
        let substrate = MemorySubstrate::new();
        seed_item(&substrate, "item-a", b"A", &["perm:x:1"]).await;
        seed_item(&substrate, "item-b", b"B", &["perm:x:2"]).await;
        seed_filter(&substrate, "coll", "perm:x:.*").await;
        seed_variant(&substrate, "coll", "v-narrow", &["item-a"], &["perm:x:1"]).await;
        seed_variant(
            &substrate,
            "coll",
            "v-wide",
            &["item-a", "item-b"],
            &["perm:x:1", "perm:x:2"],
        )
        .await;
        grant(&substrate, "reader", &["perm:x:1"]).await;

        // Both variants dominate {perm:x:1}; the wide one wins and the
        // per-item check trims it to what the reader may see.
        let reply = substrate.dominance_get("reader", "coll").await.unwrap();
        assert!(reply.hit);
        assert_eq!(reply.values, vec![b"A".to_vec()]);
    }
}
