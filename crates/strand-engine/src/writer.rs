// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The per-space writer: validates, applies, and persists transactions.
//!
//! A `SpaceWriter` is the only code path that mutates a space. It keeps a
//! cache of materialized documents (hydrated lazily from snapshots plus the
//! epoch-log tail) and applies each transaction against staged clones, so a
//! rejected transaction leaves neither cache nor durable state behind.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, error, warn};

use strand_codec::{affected_paths, Codec, Doc, DocId, Head};
use strand_proto::{
    BranchName, ConflictEntry, ConflictReason, Epoch, Receipt, SpaceId, TxRequest, WriteOutcome,
    WriteRef,
};
use strand_store::{ChangeAt, EpochRecord, EpochWrite, SpaceHandle, StoreError};

/// Published after every successful commit, in epoch order.
#[derive(Debug, Clone)]
pub struct CommitEvent {
    /// Space the commit belongs to.
    pub space: SpaceId,
    /// The full epoch record, blobs included, shared with every consumer.
    pub record: Arc<EpochRecord>,
}

/// Serialized executor for one space.
pub struct SpaceWriter {
    codec: Arc<dyn Codec>,
    handle: SpaceHandle,
    docs: BTreeMap<(DocId, BranchName), Doc>,
    default_server_merge: bool,
}

impl SpaceWriter {
    /// Wraps an open space handle.
    pub fn new(codec: Arc<dyn Codec>, handle: SpaceHandle, default_server_merge: bool) -> Self {
        Self {
            codec,
            handle,
            docs: BTreeMap::new(),
            default_server_merge,
        }
    }

    /// The space this writer serves.
    #[must_use]
    pub fn space(&self) -> &SpaceId {
        self.handle.space()
    }

    /// Highest committed epoch.
    #[must_use]
    pub fn current_epoch(&self) -> Epoch {
        self.handle.current_epoch()
    }

    /// Read-only access to the durable handle, for resume bookkeeping that
    /// stays on the writer task.
    pub fn store(&mut self) -> &mut SpaceHandle {
        &mut self.handle
    }

    /// Saved bytes of a document's main branch at the current epoch.
    ///
    /// # Errors
    /// Store or codec failures while hydrating; both abort the writer's
    /// caller path the same way a transaction would.
    pub fn snapshot_doc(&mut self, doc: &DocId) -> Result<(Epoch, Vec<u8>), StoreError> {
        let state = self.hydrate(doc, &BranchName::main())?.clone();
        let bytes = self
            .codec
            .save(&state)
            .map_err(|err| StoreError::Corrupt(format!("save {doc}: {err}")))?;
        Ok((self.handle.current_epoch(), bytes))
    }

    /// Applies one transaction: validates read assertions and write bases
    /// against current heads, applies changes through the codec, assigns
    /// the next epoch, and persists the whole tuple atomically.
    ///
    /// Returns the receipt and, for committing transactions, the commit
    /// event to publish.
    ///
    /// # Errors
    /// Only fatal store drift (epoch gap, corruption) is an `Err` — it must
    /// stop the writer loop. Transient persistence failures are reported as
    /// a `conflict` receipt with no partial state, per the abort contract.
    pub fn transact(
        &mut self,
        tx: &TxRequest,
        now_ms: u64,
    ) -> Result<(Receipt, Option<CommitEvent>), StoreError> {
        // Phase 1: validate the read-set and write bases against a
        // consistent snapshot of current heads.
        let mut conflicts: Vec<ConflictEntry> = Vec::new();
        for (index, read) in tx.reads.iter().enumerate() {
            let current = self.normalized_heads(&read.doc, &read.branch)?;
            let expected = self.normalize(&read.doc, &read.expected_heads);
            if current != expected {
                conflicts.push(ConflictEntry {
                    r#ref: write_ref(index, &read.doc, &read.branch),
                    reason: ConflictReason::ReadSetStale,
                });
            }
        }
        for (index, write) in tx.writes.iter().enumerate() {
            if write.allow_server_merge || self.default_server_merge {
                continue;
            }
            let current = self.normalized_heads(&write.doc, &write.branch)?;
            let base = self.normalize(&write.doc, &write.base_heads);
            if current != base {
                conflicts.push(ConflictEntry {
                    r#ref: write_ref(index, &write.doc, &write.branch),
                    reason: ConflictReason::BaseHeadsMismatch,
                });
            }
        }
        if !conflicts.is_empty() {
            return Ok((
                Receipt::Conflict {
                    tx_id: tx.tx_id,
                    conflicts,
                },
                None,
            ));
        }

        // Read-only transactions succeed without an epoch bump.
        if tx.writes.is_empty() {
            return Ok((
                Receipt::Ok {
                    tx_id: tx.tx_id,
                    committed_at: now_ms,
                    epoch: self.handle.current_epoch(),
                    results: Vec::new(),
                },
                None,
            ));
        }

        // Phase 2: apply against staged clones. The cache stays untouched
        // until the commit is durable.
        let mut staged: BTreeMap<(DocId, BranchName), Doc> = BTreeMap::new();
        for (index, write) in tx.writes.iter().enumerate() {
            let key = (write.doc.clone(), write.branch.clone());
            if !staged.contains_key(&key) {
                let state = self.hydrate(&write.doc, &write.branch)?.clone();
                staged.insert(key.clone(), state);
            }
            let state = staged
                .get_mut(&key)
                .unwrap_or_else(|| unreachable!("staged entry was just inserted"));
            let merge = write.allow_server_merge || self.default_server_merge;
            let applied = if merge {
                self.codec.merge(state, &write.changes)
            } else {
                self.codec.apply(state, &write.changes)
            };
            if let Err(err) = applied {
                debug!(space = %self.space(), doc = %write.doc, %err, "codec rejected write");
                return Ok((
                    Receipt::Conflict {
                        tx_id: tx.tx_id,
                        conflicts: vec![ConflictEntry {
                            r#ref: write_ref(index, &write.doc, &write.branch),
                            reason: ConflictReason::Causality,
                        }],
                    },
                    None,
                ));
            }
        }

        // Phase 3: build the epoch record. Per-write head-sets are the
        // branch's final set; intermediate sets from multi-write branches
        // are internal.
        let epoch = self.handle.current_epoch() + 1;
        let mut writes: Vec<EpochWrite> = Vec::with_capacity(tx.writes.len());
        let mut changes: Vec<ChangeAt> = Vec::new();
        for (index, write) in tx.writes.iter().enumerate() {
            let key = (write.doc.clone(), write.branch.clone());
            let final_heads = staged
                .get(&key)
                .map_or_else(BTreeSet::new, |doc| self.codec.heads(doc));
            let mut paths = Vec::new();
            for blob in &write.changes {
                match affected_paths(blob) {
                    Ok(mut found) => paths.append(&mut found),
                    Err(err) => {
                        // Unreachable after a successful apply; keep the
                        // record usable regardless.
                        warn!(space = %self.space(), doc = %write.doc, %err, "unreadable paths in applied change");
                    }
                }
            }
            #[allow(clippy::cast_possible_truncation)]
            let index32 = index as u32;
            writes.push(EpochWrite {
                index: index32,
                doc: write.doc.clone(),
                branch: write.branch.clone(),
                new_heads: final_heads,
                paths,
            });
            for blob in &write.changes {
                changes.push(ChangeAt {
                    write: index32,
                    bytes: blob.clone(),
                });
            }
        }
        let record = EpochRecord {
            epoch,
            committed_at: now_ms,
            writes,
            changes,
        };

        // Snapshot rows accelerate backfill for main-branch documents.
        let mut snapshots: Vec<(DocId, Vec<u8>)> = Vec::new();
        for ((doc, branch), state) in &staged {
            if branch == &BranchName::main() {
                match self.codec.save(state) {
                    Ok(bytes) => snapshots.push((doc.clone(), bytes)),
                    Err(err) => {
                        warn!(space = %self.space(), %doc, %err, "snapshot save failed; backfill will replay the log");
                    }
                }
            }
        }

        // Phase 4: persist atomically, then promote the staged docs.
        match self.handle.commit(&record, &snapshots) {
            Ok(()) => {}
            Err(err @ (StoreError::EpochGap { .. } | StoreError::Corrupt(_))) => {
                error!(space = %self.space(), %err, "fatal store drift; stopping writer");
                return Err(err);
            }
            Err(err) => {
                error!(space = %self.space(), %err, "commit persistence failed; transaction aborted");
                return Ok((
                    Receipt::Conflict {
                        tx_id: tx.tx_id,
                        conflicts: vec![ConflictEntry {
                            r#ref: tx
                                .writes
                                .first()
                                .map_or_else(placeholder_ref, |w| write_ref(0, &w.doc, &w.branch)),
                            reason: ConflictReason::Causality,
                        }],
                    },
                    None,
                ));
            }
        }
        for (key, state) in staged {
            self.docs.insert(key, state);
        }

        let results: Vec<WriteOutcome> = record
            .writes
            .iter()
            .map(|w| WriteOutcome {
                r#ref: WriteRef {
                    index: w.index,
                    doc: w.doc.clone(),
                    branch: w.branch.clone(),
                },
                new_heads: w.new_heads.clone(),
                applied: !record
                    .changes_for_branch(&w.doc, &w.branch)
                    .is_empty(),
            })
            .collect();
        let event = CommitEvent {
            space: self.space().clone(),
            record: Arc::new(record),
        };
        Ok((
            Receipt::Ok {
                tx_id: tx.tx_id,
                committed_at: now_ms,
                epoch,
                results,
            },
            Some(event),
        ))
    }

    /// Current heads with genesis normalization applied.
    fn normalized_heads(
        &mut self,
        doc: &DocId,
        branch: &BranchName,
    ) -> Result<BTreeSet<Head>, StoreError> {
        let heads = self.handle.branch_heads(doc, branch)?;
        Ok(self.normalize(doc, &heads))
    }

    /// Maps the empty set to `{genesis_head(doc)}` so "never written" and
    /// "explicitly at genesis" compare equal.
    fn normalize(&self, doc: &DocId, heads: &BTreeSet<Head>) -> BTreeSet<Head> {
        if heads.is_empty() {
            let mut set = BTreeSet::new();
            set.insert(self.codec.genesis_head(doc));
            set
        } else {
            heads.clone()
        }
    }

    /// Returns the cached document for a branch, hydrating from the latest
    /// snapshot row plus the epoch-log tail (or a full replay) on miss.
    fn hydrate(&mut self, doc: &DocId, branch: &BranchName) -> Result<&Doc, StoreError> {
        let key = (doc.clone(), branch.clone());
        if !self.docs.contains_key(&key) {
            let state = self.rebuild(doc, branch)?;
            if self.handle.branch_exists(doc, branch)? {
                let persisted = self.handle.branch_heads(doc, branch)?;
                let rebuilt = self.codec.heads(&state);
                if persisted != rebuilt {
                    return Err(StoreError::Corrupt(format!(
                        "head drift on {doc}/{branch}: log rebuilds {rebuilt:?}, heads row says {persisted:?}"
                    )));
                }
            }
            self.docs.insert(key.clone(), state);
        }
        Ok(self
            .docs
            .get(&key)
            .unwrap_or_else(|| unreachable!("hydrated entry was just inserted")))
    }

    fn rebuild(&mut self, doc: &DocId, branch: &BranchName) -> Result<Doc, StoreError> {
        let (mut state, replay_from) = if branch == &BranchName::main() {
            match self.handle.latest_snapshot(doc, self.handle.current_epoch())? {
                Some((epoch, bytes)) => {
                    let loaded = self.codec.load(&bytes).map_err(|err| {
                        StoreError::Corrupt(format!("snapshot for {doc} at {epoch}: {err}"))
                    })?;
                    (loaded, epoch)
                }
                None => (self.codec.genesis(doc), 0),
            }
        } else {
            (self.codec.genesis(doc), 0)
        };
        for record in self.handle.epochs_since(replay_from)? {
            let blobs = record.changes_for_branch(doc, branch);
            if blobs.is_empty() {
                continue;
            }
            self.codec.merge(&mut state, &blobs).map_err(|err| {
                StoreError::Corrupt(format!(
                    "epoch {epoch} replay for {doc}/{branch}: {err}",
                    epoch = record.epoch
                ))
            })?;
        }
        Ok(state)
    }
}

fn write_ref(index: usize, doc: &DocId, branch: &BranchName) -> WriteRef {
    #[allow(clippy::cast_possible_truncation)]
    WriteRef {
        index: index as u32,
        doc: doc.clone(),
        branch: branch.clone(),
    }
}

fn placeholder_ref() -> WriteRef {
    WriteRef {
        index: 0,
        doc: DocId::from(""),
        branch: BranchName::main(),
    }
}
