// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Catalog of live subscriptions.
//!
//! The registry is the only shared-mutable structure in the hub and its
//! lock is held for index operations only — matching work happens on
//! snapshots taken under the lock, delivery work happens on the
//! per-subscription tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use strand_codec::paths_intersect;
use strand_proto::{ClientId, Query, SpaceId, SubscriptionId};
use strand_store::EpochRecord;

use crate::subtask::SubMsg;

/// Server-side connection identity; subscriptions die with it.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ConnId(pub u64);

/// One live subscription.
#[derive(Clone)]
pub struct SubEntry {
    /// Consumer identity; equivalence is `(consumer, query)`.
    pub consumer: ClientId,
    /// The watched query.
    pub query: Query,
    /// Connection that opened the subscription.
    pub conn: ConnId,
    /// Control channel into the subscription's delivery task.
    pub ctrl: mpsc::Sender<SubMsg>,
    /// Last epoch handed to the sink; `-1` until the first send. Shared
    /// with the delivery task and preserved across equivalent
    /// resubscribes.
    pub last_delivered: Arc<AtomicI64>,
}

impl SubEntry {
    /// Whether this entry already delivered anything (a delta body is only
    /// useful to a consumer with a prior baseline).
    #[must_use]
    pub fn has_baseline(&self) -> bool {
        self.last_delivered.load(Ordering::Acquire) >= 0
    }
}

/// `space → { subscription → entry }`, with idempotent equivalent inserts.
#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    spaces: Mutex<HashMap<SpaceId, HashMap<SubscriptionId, SubEntry>>>,
}

impl SubscriptionRegistry {
    /// Fresh, empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a subscription, or returns the existing identifier when an
    /// equivalent live `(consumer, query)` subscription already exists
    /// (its delivery state, including `last_delivered`, is preserved).
    ///
    /// Returns `(id, inserted)`.
    pub fn insert(
        &self,
        space: &SpaceId,
        entry: SubEntry,
    ) -> (SubscriptionId, bool) {
        let mut spaces = self
            .spaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let subs = spaces.entry(space.clone()).or_default();
        if let Some((id, existing)) = subs
            .iter()
            .find(|(_, e)| e.consumer == entry.consumer && e.query == entry.query)
        {
            if !existing.ctrl.is_closed() {
                return (*id, false);
            }
            // The old task died with its transport; adopt its delivery
            // position and replace it under the same identity.
            let id = *id;
            let last = Arc::clone(&existing.last_delivered);
            let mut entry = entry;
            entry.last_delivered = last;
            subs.insert(id, entry);
            return (id, true);
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        subs.insert(id, entry);
        (id, true)
    }

    /// Removes one subscription, returning its entry.
    pub fn remove(&self, space: &SpaceId, id: SubscriptionId) -> Option<SubEntry> {
        let mut spaces = self
            .spaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        spaces.get_mut(space).and_then(|subs| subs.remove(&id))
    }

    /// Looks one subscription up.
    pub fn get(&self, space: &SpaceId, id: SubscriptionId) -> Option<SubEntry> {
        let spaces = self
            .spaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        spaces.get(space).and_then(|subs| subs.get(&id).cloned())
    }

    /// Removes every subscription opened by a connection, across spaces,
    /// returning what was removed.
    pub fn remove_connection(&self, conn: ConnId) -> Vec<(SpaceId, SubscriptionId, SubEntry)> {
        let mut spaces = self
            .spaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut removed = Vec::new();
        for (space, subs) in spaces.iter_mut() {
            let ids: Vec<SubscriptionId> = subs
                .iter()
                .filter(|(_, e)| e.conn == conn)
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                if let Some(entry) = subs.remove(&id) {
                    removed.push((space.clone(), id, entry));
                }
            }
        }
        removed
    }

    /// Every live subscription in a space.
    pub fn entries(&self, space: &SpaceId) -> Vec<(SubscriptionId, SubEntry)> {
        let spaces = self
            .spaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        spaces.get(space).map_or_else(Vec::new, |subs| {
            subs.iter().map(|(id, entry)| (*id, entry.clone())).collect()
        })
    }

    /// Subscriptions in `space` matched by a committed epoch record.
    pub fn matches(
        &self,
        space: &SpaceId,
        record: &EpochRecord,
    ) -> Vec<(SubscriptionId, SubEntry)> {
        let spaces = self
            .spaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(subs) = spaces.get(space) else {
            return Vec::new();
        };
        subs.iter()
            .filter(|(_, entry)| query_matches(&entry.query, record))
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }
}

/// Whether an epoch record contains at least one write to the query's
/// document whose affected paths intersect the query scope.
///
/// A write with no recorded paths is treated as a root mutation, which
/// matches every scope on the document. The `schema` handle is an opaque
/// hook and the default predicate always matches.
#[must_use]
pub fn query_matches(query: &Query, record: &EpochRecord) -> bool {
    record.writes.iter().any(|write| {
        if write.doc != query.doc {
            return false;
        }
        if write.paths.is_empty() || query.path.is_empty() {
            return true;
        }
        write
            .paths
            .iter()
            .any(|path| paths_intersect(path, &query.path))
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::collections::BTreeSet;
    use strand_codec::DocId;
    use strand_store::EpochWrite;

    fn entry(consumer: &str, doc: &str) -> (SubEntry, mpsc::Receiver<SubMsg>) {
        let (ctrl, rx) = mpsc::channel(4);
        (
            SubEntry {
                consumer: ClientId::from(consumer),
                query: Query::doc_root(doc),
                conn: ConnId(1),
                ctrl,
                last_delivered: Arc::new(AtomicI64::new(-1)),
            },
            rx,
        )
    }

    fn record_touching(doc: &str, path: &[&str]) -> EpochRecord {
        EpochRecord {
            epoch: 1,
            committed_at: 0,
            writes: vec![EpochWrite {
                index: 0,
                doc: DocId::from(doc),
                branch: strand_proto::BranchName::main(),
                new_heads: BTreeSet::new(),
                paths: vec![path.iter().map(|k| (*k).to_owned()).collect()],
            }],
            changes: vec![],
        }
    }

    #[test]
    fn equivalent_subscribe_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        let space = SpaceId::from("did:key:s1");
        let (first, _rx) = entry("c1", "doc:x");
        let (id_a, inserted_a) = registry.insert(&space, first.clone());
        let (id_b, inserted_b) = registry.insert(&space, first);
        assert!(inserted_a);
        assert!(!inserted_b);
        assert_eq!(id_a, id_b);
    }

    #[test]
    fn a_dead_equivalent_subscription_is_replaced_under_the_same_id() {
        let registry = SubscriptionRegistry::new();
        let space = SpaceId::from("did:key:s1");
        let (first, rx) = entry("c1", "doc:x");
        first.last_delivered.store(7, Ordering::Release);
        let (id_a, _) = registry.insert(&space, first);
        drop(rx); // transport gone

        let (fresh, _rx2) = entry("c1", "doc:x");
        let (id_b, inserted) = registry.insert(&space, fresh);
        assert!(inserted);
        assert_eq!(id_a, id_b);
        let adopted = registry.get(&space, id_b).unwrap();
        assert_eq!(adopted.last_delivered.load(Ordering::Acquire), 7);
    }

    #[test]
    fn distinct_queries_get_distinct_ids() {
        let registry = SubscriptionRegistry::new();
        let space = SpaceId::from("did:key:s1");
        let (a, _rx_a) = entry("c1", "doc:x");
        let (b, _rx_b) = entry("c1", "doc:y");
        let (id_a, _) = registry.insert(&space, a);
        let (id_b, _) = registry.insert(&space, b);
        assert_ne!(id_a, id_b);
    }

    #[test]
    fn connection_removal_sweeps_all_spaces() {
        let registry = SubscriptionRegistry::new();
        let s1 = SpaceId::from("did:key:s1");
        let s2 = SpaceId::from("did:key:s2");
        let (a, _rx_a) = entry("c1", "doc:x");
        let (b, _rx_b) = entry("c1", "doc:y");
        registry.insert(&s1, a);
        registry.insert(&s2, b);
        let removed = registry.remove_connection(ConnId(1));
        assert_eq!(removed.len(), 2);
        assert!(registry.matches(&s1, &record_touching("doc:x", &[])).is_empty());
    }

    #[test]
    fn root_queries_match_any_path_and_prefixes_match_both_ways() {
        let root = Query::doc_root("doc:x");
        let scoped = Query {
            doc: DocId::from("doc:x"),
            path: vec!["a".to_owned(), "b".to_owned()],
            schema: None,
        };
        assert!(query_matches(&root, &record_touching("doc:x", &["deep", "leaf"])));
        assert!(query_matches(&scoped, &record_touching("doc:x", &["a", "b", "c"])));
        assert!(query_matches(&scoped, &record_touching("doc:x", &["a"])));
        assert!(!query_matches(&scoped, &record_touching("doc:x", &["z"])));
        assert!(!query_matches(&scoped, &record_touching("doc:other", &["a", "b"])));
    }
}
