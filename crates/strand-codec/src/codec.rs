// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The [`Codec`] trait and the shipped change-DAG implementation.
//!
//! The trait is the seam that hides the CRDT from the rest of the system:
//! the store, the transaction engine, the fan-out engine, and the client
//! core all consume these seven operations and never look inside a blob.
//! Swapping in a different CRDT (or a foreign library) means implementing
//! this trait and passing the conformance suite in `tests/conformance.rs`.

use std::collections::BTreeSet;

use crate::change::ChangeId;
use crate::doc::Doc;
use crate::ident::{genesis_head, DocId, Head};

/// Errors surfaced by codec operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Bytes did not decode as a change (or saved document), or the change
    /// is internally invalid for the target document.
    #[error("[CODEC_MALFORMED] {0}")]
    MalformedChange(String),
    /// A change named a predecessor head that is not present.
    #[error("[CODEC_CAUSALITY] change {change} names missing predecessor {missing}")]
    CausalityViolation {
        /// The change that failed to integrate.
        change: ChangeId,
        /// The predecessor head that was absent.
        missing: Head,
    },
}

/// Operations the rest of the system is allowed to ask of the CRDT.
///
/// Implementations must be deterministic: the same change set yields the
/// same head-set and the same materialized JSON on every replica. No
/// ordering semantics beyond the codec's own DAG are assumed by callers.
pub trait Codec: Send + Sync {
    /// Produces the empty document for `doc_id`.
    fn genesis(&self, doc_id: &DocId) -> Doc;

    /// Deterministic head of the empty document, derivable without storage.
    fn genesis_head(&self, doc_id: &DocId) -> Head;

    /// Integrates encoded change blobs in order.
    ///
    /// # Errors
    /// [`CodecError::MalformedChange`] when a blob does not decode;
    /// [`CodecError::CausalityViolation`] when a stated predecessor head is
    /// not present. The document is unchanged on error.
    fn apply(&self, doc: &mut Doc, blobs: &[Vec<u8>]) -> Result<(), CodecError>;

    /// Current head-set of a document.
    fn heads(&self, doc: &Doc) -> BTreeSet<Head>;

    /// Serializes a document to a snapshot byte blob.
    ///
    /// # Errors
    /// Propagates serialization failure as [`CodecError::MalformedChange`].
    fn save(&self, doc: &Doc) -> Result<Vec<u8>, CodecError>;

    /// Deserializes a snapshot byte blob produced by [`Codec::save`].
    ///
    /// # Errors
    /// Same taxonomy as [`Codec::apply`].
    fn load(&self, bytes: &[u8]) -> Result<Doc, CodecError>;

    /// Minimal ordered change sequence reachable from the current heads but
    /// not from `base_heads`.
    fn diff(&self, doc: &Doc, base_heads: &BTreeSet<Head>) -> Vec<Vec<u8>>;

    /// Best-effort merge for divergent tips: integrates the batch in any
    /// order, skipping duplicates.
    ///
    /// # Errors
    /// Same taxonomy as [`Codec::apply`]; a predecessor missing from both
    /// the document and the batch is still a causality violation.
    fn merge(&self, doc: &mut Doc, blobs: &[Vec<u8>]) -> Result<(), CodecError>;
}

/// The shipped codec: change-DAG documents with deterministic replay.
///
/// Stateless — every operation is a function of its arguments — so a single
/// shared instance serves every space.
#[derive(Debug, Clone, Copy, Default)]
pub struct DagCodec;

impl Codec for DagCodec {
    fn genesis(&self, doc_id: &DocId) -> Doc {
        Doc::new(doc_id.clone())
    }

    fn genesis_head(&self, doc_id: &DocId) -> Head {
        genesis_head(doc_id)
    }

    fn apply(&self, doc: &mut Doc, blobs: &[Vec<u8>]) -> Result<(), CodecError> {
        doc.apply(blobs)
    }

    fn heads(&self, doc: &Doc) -> BTreeSet<Head> {
        doc.heads()
    }

    fn save(&self, doc: &Doc) -> Result<Vec<u8>, CodecError> {
        doc.save()
    }

    fn load(&self, bytes: &[u8]) -> Result<Doc, CodecError> {
        Doc::load(bytes)
    }

    fn diff(&self, doc: &Doc, base_heads: &BTreeSet<Head>) -> Vec<Vec<u8>> {
        doc.diff(base_heads)
    }

    fn merge(&self, doc: &mut Doc, blobs: &[Vec<u8>]) -> Result<(), CodecError> {
        doc.merge(blobs)
    }
}
