// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Strand change codec: the one crate that understands change blobs.
//!
//! Every other Strand crate treats a change as an opaque byte sequence with
//! three observable properties: it has a content-derived identity, it names
//! the heads it descends from, and applying it advances a document. This
//! crate owns those semantics and hides them behind the [`Codec`] trait.
//!
//! # Determinism contract
//!
//! - Change identity is `blake3("strand:change:" || bytes)` over the exact
//!   encoded blob. Same bytes, same change — deduplication is a feature.
//! - The genesis head of a document is derivable without storage:
//!   `blake3("strand:genesis:" || doc_id)`. An empty document's head-set is
//!   exactly `{genesis_head(doc_id)}`.
//! - Materialized JSON is a pure function of the applied change set: changes
//!   replay in topological order over the change DAG, ties broken by
//!   ascending change id (lexicographic over 32-byte ids). No wall clock,
//!   no map iteration order, no host-language object identity.
//!
//! # Modules
//!
//! - [`json`] — tagged-union JSON tree and path operations
//! - [`change`] — change blob schema, encoding, identity hashing
//! - [`doc`] — change-DAG document state and replay
//! - [`codec`] — the [`Codec`] trait and the shipped [`DagCodec`]

pub mod change;
pub mod codec;
pub mod doc;
pub mod json;

mod ident;

pub use change::{affected_paths, change_id, Change, ChangeId, PathOp};
pub use codec::{Codec, CodecError, DagCodec};
pub use doc::Doc;
pub use ident::{genesis_head, DocId, Hash, Head};
pub use json::{paths_intersect, Json, Path};
