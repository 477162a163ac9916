// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Client transactions: read-set capture, overlay staging, commit
//! settlement.
//!
//! A transaction observes baselines at `read`/`write` time and settles at
//! `commit` with exactly one of `Committed`, `Conflict`, or `Rejected`.
//! The rejected path never leaves the process: a delivery that touched
//! any read path after the transaction observed it makes the commit
//! locally unwinnable, so no round-trip is spent on it.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use strand_codec::{change_id, Change, DocId, Head, Json, Path, PathOp};
use strand_proto::{
    BranchName, Command, CommandArgs, ConflictEntry, Epoch, ReadAssertion, Receipt, ReturnValue,
    SpaceId, TxRequest, WriteRecord,
};

use crate::client::ClientInner;
use crate::view::Baseline;
use crate::ClientError;

/// A mutator: runs against the JSON value at the write's path (starting
/// from `Null` when the path is empty in the current view).
pub type Mutator = Box<dyn FnOnce(&mut Json) + Send>;

struct StagedRead {
    doc: DocId,
    path: Path,
    observed_epoch: Epoch,
    observed_heads: BTreeSet<Head>,
}

struct StagedWrite {
    doc: DocId,
    path: Path,
    mutator: Mutator,
}

/// How a commit settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The server committed the transaction at this epoch.
    Committed {
        /// Epoch the commit was assigned.
        epoch: Epoch,
    },
    /// The server found the transaction in conflict; nothing committed.
    Conflict {
        /// The server's conflict entries.
        conflicts: Vec<ConflictEntry>,
    },
    /// Rejected locally by read-set invalidation; no round-trip happened.
    Rejected,
}

/// An open transaction against one space.
pub struct Transaction {
    inner: Arc<ClientInner>,
    space: SpaceId,
    tx_id: u64,
    reads: Vec<StagedRead>,
    writes: Vec<StagedWrite>,
}

impl Transaction {
    pub(crate) fn new(inner: Arc<ClientInner>, space: SpaceId, tx_id: u64) -> Self {
        Self {
            inner,
            space,
            tx_id,
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// The client-assigned transaction identifier, echoed in receipts.
    #[must_use]
    pub fn tx_id(&self) -> u64 {
        self.tx_id
    }

    /// Reads the value at `path`, recording the observation in the
    /// read-set. Returns `None` when the document has no visible state or
    /// the path is absent.
    pub fn read(&mut self, doc: &DocId, path: &[String]) -> Option<Json> {
        let mut state = self.inner.lock();
        let space = ClientInner::space_mut(&mut state, &self.space);
        let view = space.docs.entry(doc.clone()).or_default();
        let observed = StagedRead {
            doc: doc.clone(),
            path: path.to_vec(),
            observed_epoch: view.observed_epoch(),
            observed_heads: view.base_heads(doc),
        };
        let value = view
            .visible_json()
            .and_then(|json| json.get_path(path))
            .cloned();
        drop(state);
        self.reads.push(observed);
        value
    }

    /// Stages a write: `mutator` runs against the value at `path` when
    /// the transaction commits.
    pub fn write(
        &mut self,
        doc: &DocId,
        path: &[String],
        mutator: impl FnOnce(&mut Json) + Send + 'static,
    ) {
        self.writes.push(StagedWrite {
            doc: doc.clone(),
            path: path.to_vec(),
            mutator: Box::new(mutator),
        });
    }

    /// Settles the transaction.
    ///
    /// # Errors
    /// Transport and timeout failures; the overlay is rolled back before
    /// the error is returned.
    pub async fn commit(self) -> Result<CommitOutcome, ClientError> {
        let Transaction {
            inner,
            space,
            tx_id,
            reads,
            writes,
        } = self;

        // Read-set invalidation happens before anything is staged or
        // sent: a delivery after the observation makes this transaction
        // locally unwinnable.
        {
            let mut state = inner.lock();
            let space_state = ClientInner::space_mut(&mut state, &space);
            for read in &reads {
                if let Some(view) = space_state.docs.get(&read.doc) {
                    if view.read_invalidated(&read.path, read.observed_epoch) {
                        debug!(tx = tx_id, doc = %read.doc, "read-set invalidated; rejecting locally");
                        return Ok(CommitOutcome::Rejected);
                    }
                }
            }
        }

        // Read-only transactions still round-trip so the read assertions
        // are checked against server truth.
        let mut assertions: Vec<ReadAssertion> = reads
            .iter()
            .map(|read| ReadAssertion {
                doc: read.doc.clone(),
                branch: BranchName::main(),
                expected_heads: read.observed_heads.clone(),
            })
            .collect();
        assertions.dedup_by(|a, b| a.doc == b.doc && a.expected_heads == b.expected_heads);

        // Stage writes: derive change blobs against the baselines and
        // push overlays so the optimistic view is visible while the
        // commit is in flight.
        let mut write_records: Vec<WriteRecord> = Vec::new();
        let mut touched: Vec<DocId> = Vec::new();
        {
            let mut state = inner.lock();
            let space_state = ClientInner::space_mut(&mut state, &space);
            let mut seq = 0u64;
            for staged in writes {
                let view = space_state.docs.entry(staged.doc.clone()).or_default();
                // Chain within the transaction: a second write to the same
                // doc descends from the first's change.
                let parents: Vec<Head> = write_records
                    .iter()
                    .rev()
                    .find(|w| w.doc == staged.doc)
                    .map_or_else(
                        || view.base_heads(&staged.doc).into_iter().collect(),
                        |w| {
                            w.changes
                                .last()
                                .map(|blob| vec![change_id(blob).as_head()])
                                .unwrap_or_default()
                        },
                    );

                let mut value = view
                    .visible_json()
                    .and_then(|json| json.get_path(&staged.path))
                    .cloned()
                    .unwrap_or(Json::Null);
                (staged.mutator)(&mut value);
                let ops = vec![PathOp::Set {
                    path: staged.path.clone(),
                    value,
                }];

                seq += 1;
                let change = Change {
                    doc: staged.doc.clone(),
                    parents: parents.clone(),
                    author: inner.config.client_id.clone(),
                    seq: (tx_id << 16) | seq,
                    ops: ops.clone(),
                };
                let Ok(blob) = change.encode() else {
                    return Err(ClientError::MalformedDelivery(
                        "change encoding failed".to_owned(),
                    ));
                };

                view.push_overlay(tx_id, ops);
                if !touched.contains(&staged.doc) {
                    touched.push(staged.doc.clone());
                }
                write_records.push(WriteRecord {
                    doc: staged.doc.clone(),
                    branch: BranchName::main(),
                    base_heads: view.base_heads(&staged.doc),
                    changes: vec![blob],
                    allow_server_merge: false,
                });
            }
            space_state.inflight_commits += 1;
        }

        let request = TxRequest {
            tx_id,
            reads: assertions,
            writes: write_records.clone(),
        };
        let result = inner
            .request(Command::Tx, &space, CommandArgs::Tx(request))
            .await;

        let mut state = inner.lock();
        let space_state = ClientInner::space_mut(&mut state, &space);
        space_state.inflight_commits -= 1;
        let outcome = match result {
            Ok(ReturnValue::Receipt(Receipt::Ok { epoch, .. })) => {
                // Promote: fold the committed changes into the baselines.
                // A delivery may have raced ahead; merge is idempotent.
                for record in &write_records {
                    let view = space_state.docs.entry(record.doc.clone()).or_default();
                    let baseline = view.baseline.get_or_insert_with(|| Baseline {
                        doc: strand_codec::Doc::new(record.doc.clone()),
                        epoch: 0,
                    });
                    if let Err(err) = baseline.doc.merge(&record.changes) {
                        debug!(tx = tx_id, %err, "promotion merge failed; awaiting server resync");
                    }
                    baseline.epoch = baseline.epoch.max(epoch);
                }
                for doc in &touched {
                    if let Some(view) = space_state.docs.get_mut(doc) {
                        view.remove_overlay(tx_id);
                    }
                }
                Ok(CommitOutcome::Committed { epoch })
            }
            Ok(ReturnValue::Receipt(Receipt::Conflict { conflicts, .. })) => {
                for doc in &touched {
                    if let Some(view) = space_state.docs.get_mut(doc) {
                        view.remove_overlay(tx_id);
                    }
                }
                Ok(CommitOutcome::Conflict { conflicts })
            }
            Ok(_) => {
                for doc in &touched {
                    if let Some(view) = space_state.docs.get_mut(doc) {
                        view.remove_overlay(tx_id);
                    }
                }
                Err(ClientError::UnexpectedReturn)
            }
            Err(err) => {
                for doc in &touched {
                    if let Some(view) = space_state.docs.get_mut(doc) {
                        view.remove_overlay(tx_id);
                    }
                }
                Err(err)
            }
        };
        space_state.release_if_settled();
        outcome
    }
}
