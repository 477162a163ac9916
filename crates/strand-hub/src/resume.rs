// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Resume backfill planning.
//!
//! On subscribe (and one-shot get), the hub decides how to bring the
//! consumer current from its declared `since_epoch`:
//!
//! - `since == current` — nothing to send, only the `complete` sentinel
//! - the consumer already holds a delivered baseline, `0 <= since <
//!   current`, the gap is within the retention bound, every epoch in
//!   `(since, current]` is still in the log, and the summed change bytes
//!   fit the delta budget — one delta batch at `current`
//! - otherwise — one snapshot batch at the latest epoch (this covers "no
//!   prior cursor" / `since == -1`, a cursor with no local state to apply
//!   a delta onto, compacted logs, oversized deltas, and a client
//!   claiming an epoch the server never issued)

use tracing::debug;

use strand_engine::SpaceClient;
use strand_proto::{
    DeliverFrame, DocEntry, Epoch, EntryBody, EpochCursor, Query, SubscriptionId,
};

use crate::registry::query_matches;
use crate::{HubConfig, HubError};

/// What the backfill will send, and the epoch it brings the consumer to.
#[derive(Debug)]
pub struct BackfillPlan {
    /// Zero or one frames; empty means "already current".
    pub frames: Vec<DeliverFrame>,
    /// Live batches at or below this epoch are covered by the backfill.
    pub floor: Epoch,
}

/// Plans the initial backfill for one query.
///
/// `has_baseline` says whether the consumer already materialized this
/// subscription's document from a prior delivery; a delta is only ever
/// chosen for a consumer that has something to apply it onto.
///
/// # Errors
/// Engine/store failures reading the epoch log or saving a snapshot.
pub async fn plan_backfill(
    space: &SpaceClient,
    stream: SubscriptionId,
    query: &Query,
    since_epoch: EpochCursor,
    has_baseline: bool,
    config: &HubConfig,
) -> Result<BackfillPlan, HubError> {
    let current = space.current_epoch().await?;

    #[allow(clippy::cast_sign_loss)]
    if since_epoch >= 0 && since_epoch as u64 >= current {
        return Ok(BackfillPlan {
            frames: Vec::new(),
            floor: current,
        });
    }

    #[allow(clippy::cast_sign_loss)]
    if has_baseline
        && since_epoch >= 0
        && current - (since_epoch as u64) <= config.resume_delta_epochs
    {
        let since = since_epoch as u64;
        let oldest = space.oldest_epoch().await?;
        let log_covers_gap = oldest.is_some_and(|oldest| oldest <= since + 1);
        if log_covers_gap {
            let records = space.epochs_since(since).await?;
            let mut blobs: Vec<Vec<u8>> = Vec::new();
            let mut paths = Vec::new();
            for record in &records {
                if !query_matches(query, record) {
                    continue;
                }
                blobs.extend(record.changes_for_doc(&query.doc));
                paths.extend(record.paths_for_doc(&query.doc));
            }
            let total: usize = blobs.iter().map(Vec::len).sum();
            if blobs.is_empty() {
                // Committed epochs exist but none touch this query.
                return Ok(BackfillPlan {
                    frames: Vec::new(),
                    floor: current,
                });
            }
            if total <= config.delta_budget_bytes {
                debug!(%stream, since, current, bytes = total, "delta backfill");
                return Ok(BackfillPlan {
                    frames: vec![DeliverFrame {
                        space: space.space().clone(),
                        stream_id: stream,
                        epoch: current,
                        docs: vec![DocEntry {
                            doc: query.doc.clone(),
                            body: EntryBody::delta(&blobs),
                            paths,
                        }],
                    }],
                    floor: current,
                });
            }
        }
    }

    // Snapshot path: latest state of the queried document.
    let (epoch, bytes) = space.snapshot_doc(query.doc.clone()).await?;
    debug!(%stream, epoch, bytes = bytes.len(), "snapshot backfill");
    Ok(BackfillPlan {
        frames: vec![DeliverFrame {
            space: space.space().clone(),
            stream_id: stream,
            epoch,
            docs: vec![DocEntry {
                doc: query.doc.clone(),
                body: EntryBody::snapshot(&bytes),
                paths: Vec::new(),
            }],
        }],
        floor: epoch,
    })
}
