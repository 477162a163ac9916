// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Change-DAG document state and deterministic replay.
//!
//! A [`Doc`] holds the set of integrated changes, the current DAG tips, and
//! the materialized JSON tree. Materialization replays changes in
//! topological order (parents before children), ties broken by ascending
//! change id, so every replica that holds the same change set renders the
//! same tree regardless of arrival order.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::change::{change_id, Change, ChangeId, PathOp};
use crate::codec::CodecError;
use crate::ident::{genesis_head, DocId, Head};
use crate::json::Json;

/// An integrated change: decoded form plus the exact bytes it hashed from.
#[derive(Debug, Clone)]
struct StoredChange {
    change: Change,
    bytes: Vec<u8>,
}

/// A document: change DAG plus materialized state.
#[derive(Debug, Clone)]
pub struct Doc {
    doc_id: DocId,
    changes: BTreeMap<ChangeId, StoredChange>,
    tips: BTreeSet<Head>,
    root: Json,
}

impl Doc {
    /// Creates the empty document for `doc_id`. Its head-set is exactly the
    /// genesis head.
    #[must_use]
    pub fn new(doc_id: DocId) -> Self {
        let mut tips = BTreeSet::new();
        tips.insert(genesis_head(&doc_id));
        Self {
            doc_id,
            changes: BTreeMap::new(),
            tips,
            root: Json::empty_object(),
        }
    }

    /// The document identifier.
    #[must_use]
    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    /// Current head-set: the tips of the change DAG. Never empty — a fresh
    /// document reports its genesis head.
    #[must_use]
    pub fn heads(&self) -> BTreeSet<Head> {
        self.tips.clone()
    }

    /// Materialized JSON tree.
    #[must_use]
    pub fn json(&self) -> &Json {
        &self.root
    }

    /// Number of integrated changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// True when no change has been integrated yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Integrates encoded change blobs in the given order.
    ///
    /// Already-integrated changes are skipped (idempotence is what makes
    /// redelivery safe). Each new change must name only present
    /// predecessors: the genesis head or an already-integrated change.
    ///
    /// # Errors
    /// [`CodecError::MalformedChange`] when a blob does not decode or names
    /// a different document; [`CodecError::CausalityViolation`] when a
    /// stated predecessor is absent. The document is left unchanged on
    /// error.
    pub fn apply(&mut self, blobs: &[Vec<u8>]) -> Result<(), CodecError> {
        let staged = self.stage(blobs, false)?;
        self.integrate(staged);
        Ok(())
    }

    /// Best-effort merge of encoded change blobs.
    ///
    /// Unlike [`Doc::apply`], the batch may arrive in any order: changes
    /// whose predecessors are later in the batch are retried once the
    /// predecessors land. Only a predecessor missing from both the document
    /// and the batch is a causality violation.
    ///
    /// # Errors
    /// Same taxonomy as [`Doc::apply`]; the document is left unchanged on
    /// error.
    pub fn merge(&mut self, blobs: &[Vec<u8>]) -> Result<(), CodecError> {
        let staged = self.stage(blobs, true)?;
        self.integrate(staged);
        Ok(())
    }

    /// Decodes and causality-checks a batch without mutating the document.
    fn stage(
        &self,
        blobs: &[Vec<u8>],
        reorder: bool,
    ) -> Result<Vec<(ChangeId, StoredChange)>, CodecError> {
        let genesis = genesis_head(&self.doc_id);
        let mut pending: VecDeque<(ChangeId, StoredChange)> = VecDeque::new();
        for bytes in blobs {
            let change = Change::decode(bytes)
                .map_err(|err| CodecError::MalformedChange(err.to_string()))?;
            if change.doc != self.doc_id {
                return Err(CodecError::MalformedChange(format!(
                    "change for {} integrated into {}",
                    change.doc, self.doc_id
                )));
            }
            if change.parents.is_empty() {
                return Err(CodecError::MalformedChange(
                    "change names no predecessor heads".to_owned(),
                ));
            }
            let id = change_id(bytes);
            pending.push_back((
                id,
                StoredChange {
                    change,
                    bytes: bytes.clone(),
                },
            ));
        }

        let mut present: BTreeSet<Head> = self.changes.keys().map(|id| id.as_head()).collect();
        present.insert(genesis);

        let mut staged = Vec::with_capacity(pending.len());
        let mut stalled = 0usize;
        while let Some((id, stored)) = pending.pop_front() {
            if present.contains(&id.as_head()) {
                // Duplicate of an integrated or already-staged change.
                stalled = 0;
                continue;
            }
            let missing = stored
                .change
                .parents
                .iter()
                .find(|parent| !present.contains(*parent));
            if let Some(parent) = missing {
                if reorder && stalled < pending.len() {
                    stalled += 1;
                    pending.push_back((id, stored));
                    continue;
                }
                return Err(CodecError::CausalityViolation {
                    change: id,
                    missing: *parent,
                });
            }
            stalled = 0;
            present.insert(id.as_head());
            staged.push((id, stored));
        }
        Ok(staged)
    }

    /// Commits a staged batch: updates tips and rematerializes.
    fn integrate(&mut self, staged: Vec<(ChangeId, StoredChange)>) {
        if staged.is_empty() {
            return;
        }
        for (id, stored) in staged {
            for parent in &stored.change.parents {
                self.tips.remove(parent);
            }
            self.tips.insert(id.as_head());
            self.changes.insert(id, stored);
        }
        self.root = self.replay();
    }

    /// Replays the full change set in canonical order.
    fn replay(&self) -> Json {
        let mut root = Json::empty_object();
        for id in self.topo_order() {
            if let Some(stored) = self.changes.get(&id) {
                apply_ops(&mut root, &stored.change.ops);
            }
        }
        root
    }

    /// Topological order over the DAG, ties broken by ascending change id.
    fn topo_order(&self) -> Vec<ChangeId> {
        let mut unmet: BTreeMap<ChangeId, usize> = BTreeMap::new();
        let mut children: BTreeMap<Head, Vec<ChangeId>> = BTreeMap::new();
        for (id, stored) in &self.changes {
            let mut count = 0;
            for parent in &stored.change.parents {
                if self.changes.contains_key(&ChangeId(parent.0)) {
                    count += 1;
                    children.entry(*parent).or_default().push(*id);
                }
            }
            unmet.insert(*id, count);
        }

        let mut ready: BTreeSet<ChangeId> = unmet
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.changes.len());
        while let Some(id) = ready.iter().next().copied() {
            ready.remove(&id);
            order.push(id);
            if let Some(kids) = children.get(&id.as_head()) {
                for kid in kids {
                    if let Some(count) = unmet.get_mut(kid) {
                        *count -= 1;
                        if *count == 0 {
                            ready.insert(*kid);
                        }
                    }
                }
            }
        }
        debug_assert_eq!(order.len(), self.changes.len(), "change DAG has a cycle");
        order
    }

    /// Returns encoded changes reachable from the current heads but not
    /// from `base_heads`, in replay order. Unknown base heads contribute
    /// nothing; passing the current head-set yields an empty diff.
    #[must_use]
    pub fn diff(&self, base_heads: &BTreeSet<Head>) -> Vec<Vec<u8>> {
        let known = self.ancestors(base_heads);
        self.topo_order()
            .into_iter()
            .filter(|id| !known.contains(&id.as_head()))
            .filter_map(|id| self.changes.get(&id).map(|s| s.bytes.clone()))
            .collect()
    }

    /// Transitive closure of `heads` through parent links (inclusive).
    fn ancestors(&self, heads: &BTreeSet<Head>) -> BTreeSet<Head> {
        let mut seen: BTreeSet<Head> = BTreeSet::new();
        let mut queue: VecDeque<Head> = heads.iter().copied().collect();
        while let Some(head) = queue.pop_front() {
            if !seen.insert(head) {
                continue;
            }
            if let Some(stored) = self.changes.get(&ChangeId(head.0)) {
                for parent in &stored.change.parents {
                    queue.push_back(*parent);
                }
            }
        }
        seen
    }

    /// Serializes the document to bytes: identifier plus changes in replay
    /// order.
    ///
    /// # Errors
    /// Returns [`CodecError::MalformedChange`] when CBOR serialization
    /// fails, which only happens on I/O-level allocation failure.
    pub fn save(&self) -> Result<Vec<u8>, CodecError> {
        let saved = SavedDoc {
            doc: self.doc_id.clone(),
            changes: self
                .topo_order()
                .into_iter()
                .filter_map(|id| self.changes.get(&id).map(|s| s.bytes.clone()))
                .collect(),
        };
        let mut out = Vec::new();
        ciborium::into_writer(&saved, &mut out)
            .map_err(|err| CodecError::MalformedChange(err.to_string()))?;
        Ok(out)
    }

    /// Deserializes a document previously produced by [`Doc::save`].
    ///
    /// # Errors
    /// [`CodecError::MalformedChange`] when the bytes are not a saved
    /// document; [`CodecError::CausalityViolation`] when the saved change
    /// list is internally inconsistent.
    pub fn load(bytes: &[u8]) -> Result<Self, CodecError> {
        let saved: SavedDoc = ciborium::from_reader(bytes)
            .map_err(|err| CodecError::MalformedChange(err.to_string()))?;
        let mut doc = Doc::new(saved.doc);
        // Saved order is replay order, but tolerate reordered inputs.
        doc.merge(&saved.changes)?;
        Ok(doc)
    }
}

/// Applies a change's operations to a tree in declaration order.
fn apply_ops(root: &mut Json, ops: &[PathOp]) {
    for op in ops {
        match op {
            PathOp::Set { path, value } => root.set_path(path, value.clone()),
            PathOp::Delete { path } => root.delete_path(path),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct SavedDoc {
    doc: DocId,
    changes: Vec<Vec<u8>>,
}
