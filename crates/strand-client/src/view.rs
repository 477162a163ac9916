// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-document view state: baseline, overlay stack, delivery marks.
//!
//! The overlay is an ordered sequence, not a closure chain: each entry
//! keeps the operations its mutators produced, so rolling one back is
//! "remove the entry and re-derive the stack from the baseline".

use std::collections::BTreeSet;

use strand_codec::{Doc, DocId, Head, Json, PathOp};
use strand_proto::Epoch;

/// The promoted server state of one document.
#[derive(Debug, Clone)]
pub(crate) struct Baseline {
    /// Materialized document as last promoted.
    pub doc: Doc,
    /// Epoch the baseline was promoted at.
    pub epoch: Epoch,
}

/// One in-flight transaction's effect on one document.
#[derive(Debug, Clone)]
pub(crate) struct PendingOverlay {
    /// Transaction the overlay belongs to.
    pub tx_id: u64,
    /// Operations the transaction's mutators produced, in order.
    pub ops: Vec<PathOp>,
    /// View after applying this overlay on its predecessor.
    pub json: Json,
}

/// A delivery the view has applied, kept for read-set invalidation.
#[derive(Debug, Clone)]
pub(crate) struct DeliveryMark {
    /// Epoch of the delivery.
    pub epoch: Epoch,
    /// Paths it touched; `None` for snapshot bodies (treat as root).
    pub paths: Option<Vec<Vec<String>>>,
}

/// How many delivery marks to keep per document. A transaction older than
/// this window is conservatively invalidated.
const MARKS_KEPT: usize = 64;

/// Everything the client holds for one (space, document).
#[derive(Debug, Default)]
pub(crate) struct DocView {
    pub baseline: Option<Baseline>,
    pub overlays: Vec<PendingOverlay>,
    pub marks: Vec<DeliveryMark>,
    pub marks_dropped: bool,
}

impl DocView {
    /// The JSON a reader sees: top overlay if any, else the baseline.
    pub fn visible_json(&self) -> Option<&Json> {
        self.overlays
            .last()
            .map(|o| &o.json)
            .or_else(|| self.baseline.as_ref().map(|b| b.doc.json()))
    }

    /// Version of the visible state: baseline epoch and heads.
    pub fn version(&self) -> Option<(Epoch, BTreeSet<Head>)> {
        self.baseline.as_ref().map(|b| (b.epoch, b.doc.heads()))
    }

    /// Baseline heads, or the genesis head when nothing was promoted yet.
    pub fn base_heads(&self, doc: &DocId) -> BTreeSet<Head> {
        self.baseline.as_ref().map_or_else(
            || {
                let mut set = BTreeSet::new();
                set.insert(strand_codec::genesis_head(doc));
                set
            },
            |b| b.doc.heads(),
        )
    }

    /// Epoch of the baseline a freshly opened transaction observes.
    pub fn observed_epoch(&self) -> Epoch {
        self.baseline.as_ref().map_or(0, |b| b.epoch)
    }

    /// Pushes an overlay derived by applying `ops` to the current visible
    /// view.
    pub fn push_overlay(&mut self, tx_id: u64, ops: Vec<PathOp>) {
        let mut json = self
            .visible_json()
            .cloned()
            .unwrap_or_else(Json::empty_object);
        apply_ops(&mut json, &ops);
        self.overlays.push(PendingOverlay { tx_id, ops, json });
    }

    /// Drops the overlay of a settled transaction and re-derives the rest
    /// of the stack from the (possibly advanced) baseline.
    pub fn remove_overlay(&mut self, tx_id: u64) {
        self.overlays.retain(|o| o.tx_id != tx_id);
        self.rederive();
    }

    /// Recomputes every overlay's view bottom-up from the baseline.
    pub fn rederive(&mut self) {
        let mut json = self
            .baseline
            .as_ref()
            .map_or_else(Json::empty_object, |b| b.doc.json().clone());
        for overlay in &mut self.overlays {
            apply_ops(&mut json, &overlay.ops);
            overlay.json = json.clone();
        }
    }

    /// Records a delivery for invalidation checks.
    pub fn mark_delivery(&mut self, epoch: Epoch, paths: Option<Vec<Vec<String>>>) {
        self.marks.push(DeliveryMark { epoch, paths });
        if self.marks.len() > MARKS_KEPT {
            let excess = self.marks.len() - MARKS_KEPT;
            self.marks.drain(..excess);
            self.marks_dropped = true;
        }
    }

    /// Whether a read of `path` observed at `observed` has been
    /// invalidated by a later delivery. Snapshot deliveries and marks
    /// beyond the retention window invalidate conservatively.
    pub fn read_invalidated(&self, path: &[String], observed: Epoch) -> bool {
        if self.marks_dropped {
            return true;
        }
        self.marks.iter().any(|mark| {
            mark.epoch > observed
                && mark.paths.as_ref().is_none_or(|paths| {
                    paths
                        .iter()
                        .any(|p| strand_codec::paths_intersect(p, path))
                })
        })
    }
}

pub(crate) fn apply_ops(json: &mut Json, ops: &[PathOp]) {
    for op in ops {
        match op {
            PathOp::Set { path, value } => json.set_path(path, value.clone()),
            PathOp::Delete { path } => json.delete_path(path),
        }
    }
}
