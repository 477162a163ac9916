// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Change-blob builders.

use std::collections::BTreeSet;

use strand_codec::{genesis_head, Change, DocId, Head, Json, PathOp};

/// Builds encoded change blobs with sensible defaults.
pub struct ChangeBuilder {
    doc: DocId,
    parents: Vec<Head>,
    author: String,
    seq: u64,
    ops: Vec<PathOp>,
}

impl ChangeBuilder {
    /// A change descending from the genesis head of `doc`.
    #[must_use]
    pub fn from_genesis(doc: &DocId) -> Self {
        Self {
            doc: doc.clone(),
            parents: vec![genesis_head(doc)],
            author: "testkit".to_owned(),
            seq: 1,
            ops: Vec::new(),
        }
    }

    /// A change descending from `heads` (empty means genesis).
    #[must_use]
    pub fn from_heads(doc: &DocId, heads: &BTreeSet<Head>) -> Self {
        let parents = if heads.is_empty() {
            vec![genesis_head(doc)]
        } else {
            heads.iter().copied().collect()
        };
        Self {
            doc: doc.clone(),
            parents,
            author: "testkit".to_owned(),
            seq: 1,
            ops: Vec::new(),
        }
    }

    /// Overrides the author.
    #[must_use]
    pub fn author(mut self, author: &str) -> Self {
        self.author = author.to_owned();
        self
    }

    /// Overrides the author-local sequence number.
    #[must_use]
    pub fn seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// Appends a set operation.
    #[must_use]
    pub fn set(mut self, path: &[&str], value: Json) -> Self {
        self.ops.push(PathOp::Set {
            path: path.iter().map(|k| (*k).to_owned()).collect(),
            value,
        });
        self
    }

    /// Appends a delete operation.
    #[must_use]
    pub fn delete(mut self, path: &[&str]) -> Self {
        self.ops.push(PathOp::Delete {
            path: path.iter().map(|k| (*k).to_owned()).collect(),
        });
        self
    }

    /// Encodes the change blob.
    #[must_use]
    pub fn build(self) -> Vec<u8> {
        Change {
            doc: self.doc,
            parents: self.parents,
            author: self.author,
            seq: self.seq,
            ops: self.ops,
        }
        .encode()
        .expect("change encodes")
    }
}
