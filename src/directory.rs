//! Shard (forest) directory: C1.
//!
//! A `ForestConfiguration` is a snapshot of shards and their currently
//! preferred host. Identity is the shard id; hosts may change across
//! snapshots while identity stays stable.

use std::collections::HashSet;

use indexmap::IndexMap;

use crate::error::Error;

/// Stable shard identifier. Cheap to compare, hash and copy; directory
/// diffing relies on this being cheaper than comparing whole `Shard` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId(pub u64);

/// A shard (forest): a horizontally-partitioned slice of the document
/// store, queryable independently.
///
/// Two shards are equal iff their ids are equal; `name`/`host`/`database`
/// may legitimately differ across directory snapshots for the same id.
#[derive(Debug, Clone)]
pub struct Shard {
    pub id: ShardId,
    pub name: String,
    pub preferred_host: String,
    pub database: String,
}

impl PartialEq for Shard {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Shard {}

/// Snapshot of the forest/host topology, as provided by an external
/// discovery service. The core never talks to that service directly,
/// only to what `ShardDirectory::list_shards` returns.
pub trait ShardDirectory: Send + Sync {
    fn list_shards(&self) -> Vec<Shard>;
}

/// A directory snapshot captured once, cheap to diff against the next one.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    shards: IndexMap<ShardId, Shard>,
}

impl Directory {
    pub fn from_shards(shards: Vec<Shard>) -> Result<Self, Error> {
        let mut map = IndexMap::with_capacity(shards.len());
        for shard in shards {
            if shard.preferred_host.is_empty() {
                return Err(Error::MissingPreferredHost(shard.id));
            }
            map.insert(shard.id, shard);
        }
        Ok(Self { shards: map })
    }

    pub fn capture(directory: &dyn ShardDirectory) -> Result<Self, Error> {
        Self::from_shards(directory.list_shards())
    }

    pub fn shards(&self) -> impl Iterator<Item = &Shard> {
        self.shards.values()
    }

    pub fn get(&self, id: ShardId) -> Option<&Shard> {
        self.shards.get(&id)
    }

    pub fn contains(&self, id: ShardId) -> bool {
        self.shards.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn ids(&self) -> HashSet<ShardId> {
        self.shards.keys().copied().collect()
    }

    /// Hosts referenced by this snapshot, deduplicated, in first-seen order.
    pub fn hosts(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut hosts = Vec::new();
        for shard in self.shards.values() {
            if seen.insert(shard.preferred_host.clone()) {
                hosts.push(shard.preferred_host.clone());
            }
        }
        hosts
    }
}

/// Result of diffing two directory snapshots.
pub struct DirectoryDelta {
    pub added: Vec<ShardId>,
    pub black_listed: Vec<ShardId>,
    pub restarted_candidates: Vec<ShardId>,
}

impl Directory {
    /// Diff `self` (the new directory) against `old`.
    pub fn diff(&self, old: &Directory) -> DirectoryDelta {
        let new_ids = self.ids();
        let old_ids = old.ids();

        let added = new_ids.difference(&old_ids).copied().collect();
        let black_listed = old_ids.difference(&new_ids).copied().collect();
        // Any shard present in both old and new is a candidate for
        // "restarted" if it happens to be quarantined; the engine decides
        // that against its quarantine map, not against the directory.
        let restarted_candidates = new_ids.intersection(&old_ids).copied().collect();

        DirectoryDelta {
            added,
            black_listed,
            restarted_candidates,
        }
    }
}
