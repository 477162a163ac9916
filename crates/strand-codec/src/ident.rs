// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Identifier and hashing utilities.
use blake3::Hasher;
use serde::{Deserialize, Serialize};

/// Canonical 256-bit hash used throughout the codec for addressing changes
/// and heads.
pub type Hash = [u8; 32];

/// Opaque document identifier.
///
/// Documents are named by callers (`"doc:x"` is as good as a UUID); the
/// codec only ever hashes the identifier, it never parses it. The wrapper
/// prevents accidental mixing with branch names and space identifiers,
/// which are also strings.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(pub String);

impl DocId {
    /// Builds a `DocId` from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// A head hash: one tip of a branch's change DAG.
///
/// Heads are either change identities (see [`crate::change::ChangeId`]) or
/// the deterministic genesis head of a document. The inner bytes are public
/// for zero-cost access; the `Display` impl renders lowercase hex for
/// logging and error messages.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct Head(pub Hash);

impl Head {
    /// View the head as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &Hash {
        &self.0
    }
}

impl std::fmt::Display for Head {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Produces the deterministic genesis head for a document.
///
/// Domain-separated (`b"strand:genesis:"`) so a genesis head can never
/// collide with a change identity, which uses the `b"strand:change:"`
/// prefix over different content.
pub fn genesis_head(doc: &DocId) -> Head {
    let mut hasher = Hasher::new();
    hasher.update(b"strand:genesis:");
    hasher.update(doc.as_str().as_bytes());
    Head(hasher.finalize().into())
}
