//! In-memory reference substrate.
//!
//! One process-local map behind an `RwLock`. Script methods hold the lock
//! for their whole run, which is exactly the atomicity the contract
//! requires; primitives are single lock acquisitions and therefore
//! linearizable per key. Expiry is lazy: a key past its deadline is
//! invisible to reads and dropped the next time a write touches it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use warden_core::{SubstrateError, SubstrateResult};

use crate::contract::{AuthorizeReply, DominanceReply, Substrate};

/// What a key holds: an opaque byte string or a set of members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Slot {
    Str(Vec<u8>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry {
    pub(crate) slot: Slot,
    pub(crate) deadline: Option<Instant>,
}

impl Entry {
    pub(crate) fn is_live(&self, now: Instant) -> bool {
        self.deadline.map_or(true, |deadline| deadline > now)
    }
}

/// The substrate's keyspace. `BTreeMap` gives ordered prefix scans for
/// edge enumeration and deterministic set iteration for tests.
#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) entries: BTreeMap<String, Entry>,
}

impl State {
    pub(crate) fn live(&self, key: &str, now: Instant) -> Option<&Entry> {
        self.entries.get(key).filter(|entry| entry.is_live(now))
    }

    pub(crate) fn str_value(&self, key: &str, now: Instant) -> SubstrateResult<Option<&Vec<u8>>> {
        match self.live(key, now) {
            Some(Entry {
                slot: Slot::Str(value),
                ..
            }) => Ok(Some(value)),
            Some(_) => Err(SubstrateError::WrongType {
                key: key.to_string(),
            }),
            None => Ok(None),
        }
    }

    pub(crate) fn set_value(
        &self,
        key: &str,
        now: Instant,
    ) -> SubstrateResult<Option<&BTreeSet<String>>> {
        match self.live(key, now) {
            Some(Entry {
                slot: Slot::Set(members),
                ..
            }) => Ok(Some(members)),
            Some(_) => Err(SubstrateError::WrongType {
                key: key.to_string(),
            }),
            None => Ok(None),
        }
    }

    pub(crate) fn put_str(&mut self, key: &str, value: &[u8], ttl: Option<Duration>, now: Instant) {
        let deadline = ttl.map(|ttl| now + ttl);
        self.entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Str(value.to_vec()),
                deadline,
            },
        );
    }

    /// Union members into the set at `key`, creating it (without a TTL)
    /// if absent. Returns how many members were newly added.
    pub(crate) fn add_members(
        &mut self,
        key: &str,
        members: &[String],
        now: Instant,
    ) -> SubstrateResult<usize> {
        if members.is_empty() {
            return Ok(0);
        }
        self.drop_if_expired(key, now);
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::Set(BTreeSet::new()),
            deadline: None,
        });
        match &mut entry.slot {
            Slot::Set(set) => {
                let before = set.len();
                for member in members {
                    set.insert(member.clone());
                }
                Ok(set.len() - before)
            }
            Slot::Str(_) => Err(SubstrateError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    pub(crate) fn set_deadline(&mut self, key: &str, ttl: Duration, now: Instant) -> bool {
        self.drop_if_expired(key, now);
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.deadline = Some(now + ttl);
                true
            }
            None => false,
        }
    }

    fn drop_if_expired(&mut self, key: &str, now: Instant) {
        if self.entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            self.entries.remove(key);
        }
    }
}

/// In-process substrate backing tests and single-node deployments.
#[derive(Debug, Default)]
pub struct MemorySubstrate {
    state: RwLock<State>,
}

impl MemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let state = self.state.read().unwrap();
        state
            .entries
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every key. Test hook.
    pub fn clear(&self) {
        self.state.write().unwrap().entries.clear();
    }
}

#[async_trait]
impl Substrate for MemorySubstrate {
    async fn get(&self, key: &str) -> SubstrateResult<Option<Vec<u8>>> {
        let now = Instant::now();
        let state = self.state.read().unwrap();
        Ok(state.str_value(key, now)?.cloned())
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> SubstrateResult<()> {
        let now = Instant::now();
        let mut state = self.state.write().unwrap();
        state.put_str(key, value, ttl, now);
        Ok(())
    }

    async fn exists(&self, key: &str) -> SubstrateResult<bool> {
        let now = Instant::now();
        let state = self.state.read().unwrap();
        Ok(state.live(key, now).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> SubstrateResult<bool> {
        let now = Instant::now();
        let mut state = self.state.write().unwrap();
        Ok(state.set_deadline(key, ttl, now))
    }

    async fn sadd(&self, key: &str, members: &[String]) -> SubstrateResult<usize> {
        let now = Instant::now();
        let mut state = self.state.write().unwrap();
        state.add_members(key, members, now)
    }

    async fn smembers(&self, key: &str) -> SubstrateResult<Vec<String>> {
        let now = Instant::now();
        let state = self.state.read().unwrap();
        Ok(state
            .set_value(key, now)?
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sinter(&self, lhs: &str, rhs: &str) -> SubstrateResult<Vec<String>> {
        let now = Instant::now();
        let state = self.state.read().unwrap();
        match (state.set_value(lhs, now)?, state.set_value(rhs, now)?) {
            (Some(a), Some(b)) => Ok(a.intersection(b).cloned().collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn scard(&self, key: &str) -> SubstrateResult<usize> {
        let now = Instant::now();
        let state = self.state.read().unwrap();
        Ok(state.set_value(key, now)?.map_or(0, BTreeSet::len))
    }

    async fn smismember(&self, key: &str, members: &[String]) -> SubstrateResult<Vec<bool>> {
        let now = Instant::now();
        let state = self.state.read().unwrap();
        let set = state.set_value(key, now)?;
        Ok(members
            .iter()
            .map(|member| set.is_some_and(|s| s.contains(member)))
            .collect())
    }

    async fn propagate(
        &self,
        root_item: &str,
        perms: &[String],
        client_id: &str,
    ) -> SubstrateResult<()> {
        let now = Instant::now();
        let mut state = self.state.write().unwrap();
        state.run_propagate(root_item, perms, client_id, now)
    }

    async fn authorize_get(
        &self,
        client_perms_key: &str,
        item_perms_key: &str,
        value_key: &str,
    ) -> SubstrateResult<AuthorizeReply> {
        let now = Instant::now();
        let state = self.state.read().unwrap();
        state.run_authorize_get(client_perms_key, item_perms_key, value_key, now)
    }

    async fn filter_permissions(
        &self,
        client_perms_key: &str,
        dst_key: &str,
        pattern: &str,
    ) -> SubstrateResult<usize> {
        let now = Instant::now();
        let mut state = self.state.write().unwrap();
        state.run_filter_permissions(client_perms_key, dst_key, pattern, now)
    }

    async fn dominance_get(
        &self,
        client_id: &str,
        collection_key: &str,
    ) -> SubstrateResult<DominanceReply> {
        let now = Instant::now();
        let state = self.state.read().unwrap();
        state.run_dominance_get(client_id, collection_key, now)
    }
}
