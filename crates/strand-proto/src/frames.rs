// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Server→client and client→server frame kinds.
//!
//! A connection carries exactly two directions of traffic:
//!
//! - client→server: request [`Envelope`]s and delivery [`ClientFrame::Ack`]s
//! - server→client: [`ServerFrame::TaskReturn`] completions (one per
//!   request) and [`ServerFrame::Deliver`] subscription batches
//!
//! Every request is answered by exactly one `task/return`; a subscribe's
//! return doubles as the backfill-complete sentinel and is emitted only
//! after the initial backfill batches are enqueued ahead of it.

use serde::{Deserialize, Serialize};
use strand_codec::{DocId, Path};

use crate::{Envelope, Epoch, Receipt, RequestId, SpaceId, SubscriptionId};

/// Frames a client sends after the request envelope itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    /// A request envelope.
    Request(Envelope),
    /// Acknowledge delivery of every batch up to `epoch` on a stream.
    #[serde(rename_all = "camelCase")]
    Ack {
        /// Stream being acknowledged.
        stream_id: SubscriptionId,
        /// Highest contiguously applied epoch.
        epoch: Epoch,
    },
}

/// Frames the server emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "the", rename_all = "camelCase")]
pub enum ServerFrame {
    /// Command completion; acks a request.
    #[serde(rename = "task/return")]
    TaskReturn {
        /// Request this return answers.
        of: RequestId,
        /// The result payload.
        is: ReturnValue,
    },
    /// Subscription delivery batch.
    #[serde(rename = "deliver")]
    Deliver(DeliverFrame),
}

/// Result payload of a `task/return` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReturnValue {
    /// Hello accepted; reports the space's current epoch.
    #[serde(rename_all = "camelCase")]
    HelloOk {
        /// Current epoch of the space at hello time.
        current_epoch: Epoch,
    },
    /// Backfill finished for a subscribe or get; live deliveries (if any)
    /// follow strictly after this frame.
    Complete {
        /// Stream assigned to the subscription; absent for one-shot gets.
        subscription: Option<SubscriptionId>,
    },
    /// Transaction outcome.
    Receipt(Receipt),
    /// Unsubscribed; no further delivers for the stream.
    Unsubscribed,
    /// The request failed before reaching its engine.
    Error(ErrorPayload),
}

/// Error payload used in error returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Numeric code following HTTP semantics (400, 401, 403, 500).
    pub code: u32,
    /// Stable identifier (e.g. `E_MALFORMED`, `E_FORBIDDEN`).
    pub name: String,
    /// Human readable message.
    pub message: String,
}

impl ErrorPayload {
    /// Envelope or args failed validation.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            code: 400,
            name: "E_MALFORMED".to_owned(),
            message: message.into(),
        }
    }

    /// No usable credential was presented.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            code: 401,
            name: "E_UNAUTHORIZED".to_owned(),
            message: message.into(),
        }
    }

    /// The credential lacks the required capability.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            code: 403,
            name: "E_FORBIDDEN".to_owned(),
            message: message.into(),
        }
    }

    /// The hub failed internally; the request left no trace.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: 500,
            name: "E_INTERNAL".to_owned(),
            message: message.into(),
        }
    }
}

/// A subscription delivery batch: everything one epoch did to the docs a
/// stream watches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverFrame {
    /// Space the batch originates from.
    pub space: SpaceId,
    /// Stream this batch belongs to.
    pub stream_id: SubscriptionId,
    /// Epoch the batch covers. Within a stream, strictly increasing.
    pub epoch: Epoch,
    /// Affected documents.
    pub docs: Vec<DocEntry>,
}

/// One document's content within a delivery batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocEntry {
    /// Document the entry describes.
    pub doc: DocId,
    /// Snapshot or delta body.
    pub body: EntryBody,
    /// Paths the epoch touched on this document, when known. Snapshot
    /// backfills omit it.
    #[serde(default)]
    pub paths: Vec<Path>,
}

/// Whether a document entry carries a full snapshot or incremental changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    /// Full saved document bytes.
    Snapshot,
    /// Ordered change blobs added since the last delivered epoch.
    Delta,
}

/// Body of a document entry. Blob bytes travel base64-encoded, matching
/// the storage command contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EntryBody {
    /// Full saved document.
    Snapshot {
        /// Base64 of the codec's saved document bytes.
        body: String,
    },
    /// Incremental change blobs in application order.
    Delta {
        /// Base64 of each encoded change blob.
        body: Vec<String>,
    },
}

impl EntryBody {
    /// Builds a snapshot body from raw saved-document bytes.
    #[must_use]
    pub fn snapshot(bytes: &[u8]) -> Self {
        use base64::Engine as _;
        EntryBody::Snapshot {
            body: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Builds a delta body from raw change blobs.
    #[must_use]
    pub fn delta(blobs: &[Vec<u8>]) -> Self {
        use base64::Engine as _;
        EntryBody::Delta {
            body: blobs
                .iter()
                .map(|blob| base64::engine::general_purpose::STANDARD.encode(blob))
                .collect(),
        }
    }

    /// Which kind of body this is.
    #[must_use]
    pub fn kind(&self) -> EntryKind {
        match self {
            EntryBody::Snapshot { .. } => EntryKind::Snapshot,
            EntryBody::Delta { .. } => EntryKind::Delta,
        }
    }

    /// Decodes snapshot bytes, or `None` for delta bodies.
    ///
    /// # Errors
    /// Returns a decode error when the base64 payload is corrupt.
    pub fn snapshot_bytes(&self) -> Result<Option<Vec<u8>>, base64::DecodeError> {
        use base64::Engine as _;
        match self {
            EntryBody::Snapshot { body } => base64::engine::general_purpose::STANDARD
                .decode(body)
                .map(Some),
            EntryBody::Delta { .. } => Ok(None),
        }
    }

    /// Decodes delta blobs, or `None` for snapshot bodies.
    ///
    /// # Errors
    /// Returns a decode error when any base64 payload is corrupt.
    pub fn delta_blobs(&self) -> Result<Option<Vec<Vec<u8>>>, base64::DecodeError> {
        use base64::Engine as _;
        match self {
            EntryBody::Delta { body } => body
                .iter()
                .map(|blob| base64::engine::general_purpose::STANDARD.decode(blob))
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            EntryBody::Snapshot { .. } => Ok(None),
        }
    }
}
