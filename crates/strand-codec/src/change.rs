// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Change blob schema, encoding, and identity hashing.
//!
//! A change is the unit of history: it names the heads it descends from
//! (`parents`) and carries an ordered list of path operations. On the wire
//! and in the epoch log a change is an opaque CBOR byte blob; its identity
//! is `blake3("strand:change:" || bytes)` over those exact bytes, so a
//! re-encoded change with different field order would be a *different*
//! change. Producers must treat encoded bytes as immutable.

use blake3::Hasher;
use serde::{Deserialize, Serialize};

use crate::ident::{DocId, Hash, Head};
use crate::json::{Json, Path};

/// Identity of a change: content hash of its encoded bytes.
///
/// A committed change's id doubles as a [`Head`] once it becomes a DAG tip.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct ChangeId(pub Hash);

impl ChangeId {
    /// The head corresponding to this change when it is a DAG tip.
    #[must_use]
    pub fn as_head(self) -> Head {
        Head(self.0)
    }
}

impl std::fmt::Display for ChangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// One mutation within a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PathOp {
    /// Write `value` at `path`, creating intermediate objects.
    Set {
        /// Object keys from the root; empty replaces the root.
        path: Path,
        /// Value to write.
        value: Json,
    },
    /// Remove the value at `path`; missing paths are a no-op.
    Delete {
        /// Object keys from the root; empty resets to an empty object.
        path: Path,
    },
}

impl PathOp {
    /// The path this operation touches.
    #[must_use]
    pub fn path(&self) -> &[String] {
        match self {
            PathOp::Set { path, .. } | PathOp::Delete { path } => path,
        }
    }
}

/// Decoded form of a change blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Document this change belongs to.
    pub doc: DocId,
    /// Heads this change descends from. A change descending from the
    /// genesis head names it explicitly; `parents` is never empty.
    pub parents: Vec<Head>,
    /// Stable author identifier, used only for tie-break diagnostics.
    pub author: String,
    /// Author-local sequence number; monotonic per author per doc.
    pub seq: u64,
    /// Ordered mutations applied when the change is integrated.
    pub ops: Vec<PathOp>,
}

impl Change {
    /// Encodes the change to its canonical CBOR byte blob.
    ///
    /// # Errors
    /// Returns an error when CBOR serialization fails, which only happens
    /// on allocation failure in practice.
    pub fn encode(&self) -> Result<Vec<u8>, ciborium::ser::Error<std::io::Error>> {
        let mut out = Vec::new();
        ciborium::into_writer(self, &mut out)?;
        Ok(out)
    }

    /// Decodes a change from its byte blob.
    ///
    /// # Errors
    /// Returns an error when the bytes are not a CBOR encoding of a change.
    pub fn decode(bytes: &[u8]) -> Result<Self, ciborium::de::Error<std::io::Error>> {
        ciborium::from_reader(bytes)
    }
}

/// Lists the paths an encoded change touches, in operation order.
///
/// This is the only peek inside a blob the rest of the system ever needs:
/// subscription matching intersects these paths with query scopes. Callers
/// outside this crate must not decode blobs themselves.
///
/// # Errors
/// Returns the decode error when the bytes are not a change blob.
pub fn affected_paths(bytes: &[u8]) -> Result<Vec<Path>, ciborium::de::Error<std::io::Error>> {
    let change = Change::decode(bytes)?;
    Ok(change.ops.iter().map(|op| op.path().to_vec()).collect())
}

/// Computes the identity of an encoded change blob.
pub fn change_id(bytes: &[u8]) -> ChangeId {
    let mut hasher = Hasher::new();
    hasher.update(b"strand:change:");
    hasher.update(bytes);
    ChangeId(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::ident::genesis_head;

    #[test]
    fn change_id_depends_on_exact_bytes() {
        let doc = DocId::from("doc:t");
        let change = Change {
            doc: doc.clone(),
            parents: vec![genesis_head(&doc)],
            author: "a".into(),
            seq: 1,
            ops: vec![PathOp::Set {
                path: vec!["k".into()],
                value: Json::Num(1.0),
            }],
        };
        let bytes = change.encode().unwrap();
        assert_eq!(change_id(&bytes), change_id(&bytes));

        let mut other = change;
        other.seq = 2;
        let other_bytes = other.encode().unwrap();
        assert_ne!(change_id(&bytes), change_id(&other_bytes));
    }

    #[test]
    fn decode_round_trips() {
        let doc = DocId::from("doc:t");
        let change = Change {
            doc: doc.clone(),
            parents: vec![genesis_head(&doc)],
            author: "a".into(),
            seq: 1,
            ops: vec![PathOp::Delete {
                path: vec!["gone".into()],
            }],
        };
        let bytes = change.encode().unwrap();
        assert_eq!(Change::decode(&bytes).unwrap(), change);
    }

    #[test]
    fn garbage_bytes_do_not_decode() {
        assert!(Change::decode(b"definitely not cbor").is_err());
    }
}
