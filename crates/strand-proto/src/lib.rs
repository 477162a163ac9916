// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wire schema for the Strand storage hub.
//!
//! Everything a client and the hub exchange lives here: the invocation
//! envelope with its five `/storage/*` commands, transaction receipts,
//! delivery batches, and the framed-CBOR packet codec in [`wire`].
//! The crate is deliberately transport-agnostic — `strand-server` frames
//! these types over TCP, tests frame them over in-memory pipes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strand_codec::{DocId, Head, Path};

pub mod frames;
pub mod wire;

pub use frames::{
    ClientFrame, DeliverFrame, DocEntry, EntryBody, EntryKind, ErrorPayload, ReturnValue,
    ServerFrame,
};

/// Opaque tenant identifier (e.g. `did:key:...`). The hub never parses it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpaceId(pub String);

impl SpaceId {
    /// Builds a `SpaceId` from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpaceId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Named history of a document within a space.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchName(pub String);

impl BranchName {
    /// The default branch every document starts with.
    #[must_use]
    pub fn main() -> Self {
        Self("main".to_owned())
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BranchName {
    fn default() -> Self {
        Self::main()
    }
}

impl std::fmt::Display for BranchName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BranchName {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Per-space monotonic commit index. `0` means "nothing committed".
pub type Epoch = u64;

/// An epoch position that can also be "before everything" (`-1`), as used
/// by hello/resume negotiation and durable cursors.
pub type EpochCursor = i64;

/// The cursor value meaning "no epoch acknowledged yet".
pub const CURSOR_NONE: EpochCursor = -1;

/// Stable client identity for durable cursors; survives reconnects.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    /// Builds a `ClientId` from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Server-assigned subscription stream identifier, carried by deliver
/// frames and acks.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-assigned request correlation identifier.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// A live query: one document, one path scope, an opaque schema hook.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Query {
    /// Document to watch.
    pub doc: DocId,
    /// Path prefix scope; empty means the document root (all mutations).
    #[serde(default)]
    pub path: Path,
    /// Opaque schema predicate handle. The hub only treats match/no-match
    /// and the default predicate always matches.
    #[serde(default)]
    pub schema: Option<String>,
}

impl Query {
    /// A root query over a whole document.
    pub fn doc_root(doc: impl Into<DocId>) -> Self {
        Self {
            doc: doc.into(),
            path: Vec::new(),
            schema: None,
        }
    }
}

/// A read assertion: the branch must still be at `expected_heads` when the
/// transaction commits. An empty set asserts "at genesis or not yet
/// created".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadAssertion {
    /// Document read.
    pub doc: DocId,
    /// Branch read.
    #[serde(default)]
    pub branch: BranchName,
    /// Head-set observed when the read was taken.
    pub expected_heads: BTreeSet<Head>,
}

/// A write: change blobs applied against a declared base head-set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRecord {
    /// Document written.
    pub doc: DocId,
    /// Branch written.
    #[serde(default)]
    pub branch: BranchName,
    /// Head-set the changes were produced against. Empty is equivalent to
    /// the genesis head-set of the document.
    pub base_heads: BTreeSet<Head>,
    /// Opaque encoded change blobs, in application order.
    pub changes: Vec<Vec<u8>>,
    /// When true, a base mismatch is resolved by codec merge instead of a
    /// conflict.
    #[serde(default)]
    pub allow_server_merge: bool,
}

/// A transaction: optional read assertions plus writes, applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRequest {
    /// Client-assigned transaction identifier, echoed in the receipt.
    pub tx_id: u64,
    /// Read assertions validated against current branch heads.
    #[serde(default)]
    pub reads: Vec<ReadAssertion>,
    /// Writes applied in declaration order.
    #[serde(default)]
    pub writes: Vec<WriteRecord>,
}

/// Identifies one write within a transaction and its receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRef {
    /// Position of the write in the transaction's write list.
    pub index: u32,
    /// Document written.
    pub doc: DocId,
    /// Branch written.
    pub branch: BranchName,
}

/// Per-write outcome inside an `ok` receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    /// Which write this outcome belongs to.
    pub r#ref: WriteRef,
    /// Branch head-set after the write.
    pub new_heads: BTreeSet<Head>,
    /// Whether the changes were applied (false only for empty change
    /// lists).
    pub applied: bool,
}

/// Why a transaction conflicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictReason {
    /// A read assertion no longer matches the branch heads.
    ReadSetStale,
    /// A write's base head-set no longer matches the branch heads.
    BaseHeadsMismatch,
    /// The codec rejected a change (malformed or missing predecessor).
    Causality,
    /// The per-space writer could not serve the transaction in time.
    Timeout,
}

/// One conflicting read or write inside a `conflict` receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictEntry {
    /// Which read/write conflicted.
    pub r#ref: WriteRef,
    /// Why it conflicted.
    pub reason: ConflictReason,
}

/// Transaction outcome returned to the submitting client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Receipt {
    /// The transaction committed (or was a read-only no-op).
    Ok {
        /// Echo of the client-assigned transaction identifier.
        tx_id: u64,
        /// Commit wall-clock time, milliseconds since the Unix epoch.
        committed_at: u64,
        /// Epoch assigned to the commit; the pre-existing current epoch
        /// for read-only transactions.
        epoch: Epoch,
        /// Per-write outcomes, in write order. Empty for read-only
        /// transactions.
        results: Vec<WriteOutcome>,
    },
    /// The transaction conflicted and left no trace.
    Conflict {
        /// Echo of the client-assigned transaction identifier.
        tx_id: u64,
        /// Every accumulated conflict.
        conflicts: Vec<ConflictEntry>,
    },
}

/// The five storage commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Resume negotiation: record the client cursor.
    #[serde(rename = "/storage/hello")]
    Hello,
    /// Open a live subscription.
    #[serde(rename = "/storage/subscribe")]
    Subscribe,
    /// One-shot read: backfill then complete, no live deliveries.
    #[serde(rename = "/storage/get")]
    Get,
    /// Submit a transaction.
    #[serde(rename = "/storage/tx")]
    Tx,
    /// Tear down a subscription.
    #[serde(rename = "/storage/unsubscribe")]
    Unsubscribe,
}

impl Command {
    /// Canonical command string, as carried in `invocation.cmd`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Hello => "/storage/hello",
            Command::Subscribe => "/storage/subscribe",
            Command::Get => "/storage/get",
            Command::Tx => "/storage/tx",
            Command::Unsubscribe => "/storage/unsubscribe",
        }
    }

    /// Whether the command mutates space state (and therefore requires the
    /// `write` capability).
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(self, Command::Tx)
    }
}

/// Command-specific arguments. The variant must agree with
/// [`Invocation::cmd`]; [`Invocation::validate`] checks the pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandArgs {
    /// Arguments for [`Command::Hello`].
    Hello {
        /// Durable client identity.
        client_id: ClientId,
        /// Last epoch the client knows it fully applied; `-1` for none.
        since_epoch: EpochCursor,
    },
    /// Arguments for [`Command::Subscribe`].
    Subscribe {
        /// Consumer identity; one consumer may hold many subscriptions.
        consumer_id: ClientId,
        /// What to watch.
        query: Query,
    },
    /// Arguments for [`Command::Get`].
    Get {
        /// Consumer identity.
        consumer_id: ClientId,
        /// What to read.
        query: Query,
    },
    /// Arguments for [`Command::Tx`].
    Tx(TxRequest),
    /// Arguments for [`Command::Unsubscribe`].
    Unsubscribe {
        /// Subscription to tear down.
        subscription: SubscriptionId,
    },
}

impl CommandArgs {
    /// The command these arguments belong to.
    #[must_use]
    pub fn command(&self) -> Command {
        match self {
            CommandArgs::Hello { .. } => Command::Hello,
            CommandArgs::Subscribe { .. } => Command::Subscribe,
            CommandArgs::Get { .. } => Command::Get,
            CommandArgs::Tx(_) => Command::Tx,
            CommandArgs::Unsubscribe { .. } => Command::Unsubscribe,
        }
    }
}

/// The invocation half of a request envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    /// Issuer identity (token subject), opaque to the hub.
    pub iss: String,
    /// Command being invoked.
    pub cmd: Command,
    /// Target space.
    pub sub: SpaceId,
    /// Command-specific arguments.
    pub args: CommandArgs,
    /// Opaque proof references consumed by the authorizer.
    #[serde(default)]
    pub prf: Vec<String>,
}

impl Invocation {
    /// Checks that `args` agrees with `cmd`.
    ///
    /// # Errors
    /// Returns the mismatching pair when the envelope was assembled
    /// inconsistently; such requests are answered as malformed.
    pub fn validate(&self) -> Result<(), (Command, Command)> {
        let declared = self.args.command();
        if declared == self.cmd {
            Ok(())
        } else {
            Err((self.cmd, declared))
        }
    }
}

/// The authorization half of a request envelope, validated externally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    /// Signature over the invocation, opaque to the hub.
    #[serde(default)]
    pub signature: Vec<u8>,
    /// Bearer token naming the granted capabilities.
    #[serde(default)]
    pub access: String,
}

/// A full client request: invocation plus authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation identifier echoed by the matching `task/return`.
    pub id: RequestId,
    /// What to do.
    pub invocation: Invocation,
    /// Proof the caller may do it.
    #[serde(default)]
    pub authorization: Authorization,
}
