// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Epoch records: what one committed transaction did.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strand_codec::{DocId, Head, Path};
use strand_proto::{BranchName, Epoch};

/// One write inside an epoch record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochWrite {
    /// Position of the write in the transaction's write list.
    pub index: u32,
    /// Document written.
    pub doc: DocId,
    /// Branch written.
    pub branch: BranchName,
    /// Branch head-set after this write (the final set when a transaction
    /// writes the same branch more than once).
    pub new_heads: BTreeSet<Head>,
    /// Paths the write's changes touched, for subscription matching.
    pub paths: Vec<Path>,
}

/// A change blob tagged with the write it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeAt {
    /// Index into [`EpochRecord::writes`].
    pub write: u32,
    /// The encoded change blob, immutable once committed.
    pub bytes: Vec<u8>,
}

/// The persisted record of one committed epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Epoch this record occupies; gap-free per space.
    pub epoch: Epoch,
    /// Commit wall-clock time, milliseconds since the Unix epoch.
    pub committed_at: u64,
    /// Write refs with their resulting head-sets, in declaration order.
    pub writes: Vec<EpochWrite>,
    /// Change blobs in declaration order across the whole transaction.
    pub changes: Vec<ChangeAt>,
}

impl EpochRecord {
    /// Documents this epoch touched, deduplicated, in first-write order.
    #[must_use]
    pub fn touched_docs(&self) -> Vec<&DocId> {
        let mut seen = BTreeSet::new();
        self.writes
            .iter()
            .filter(|w| seen.insert(&w.doc))
            .map(|w| &w.doc)
            .collect()
    }

    /// Change blobs belonging to one document, in declaration order.
    #[must_use]
    pub fn changes_for_doc(&self, doc: &DocId) -> Vec<Vec<u8>> {
        self.changes
            .iter()
            .filter(|c| {
                self.writes
                    .get(c.write as usize)
                    .is_some_and(|w| &w.doc == doc)
            })
            .map(|c| c.bytes.clone())
            .collect()
    }

    /// Change blobs belonging to one branch, in declaration order.
    #[must_use]
    pub fn changes_for_branch(&self, doc: &DocId, branch: &BranchName) -> Vec<Vec<u8>> {
        self.changes
            .iter()
            .filter(|c| {
                self.writes
                    .get(c.write as usize)
                    .is_some_and(|w| &w.doc == doc && &w.branch == branch)
            })
            .map(|c| c.bytes.clone())
            .collect()
    }

    /// Paths this epoch touched on one document.
    #[must_use]
    pub fn paths_for_doc(&self, doc: &DocId) -> Vec<Path> {
        self.writes
            .iter()
            .filter(|w| &w.doc == doc)
            .flat_map(|w| w.paths.iter().cloned())
            .collect()
    }
}
