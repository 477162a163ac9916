// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-space writer actors and their supervising router.
//!
//! Each space gets one writer loop on a blocking task: it owns the
//! [`SpaceWriter`] (and through it the SQLite handle), drains a command
//! mailbox, and publishes commit events on a broadcast channel that
//! outlives writer restarts. The [`EngineRouter`] spawns actors lazily,
//! respawns them after fatal store drift, and marks a space degraded once
//! the restart budget is spent.
//!
//! Dispatch is at-most-once: a command whose *send* fails is retried
//! against a fresh actor, but once a transaction is accepted into a
//! mailbox it is never resubmitted — a dropped reply surfaces as
//! [`EngineError::Unavailable`] instead of risking a double commit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{error, info, warn};

use strand_codec::{Codec, DocId};
use strand_proto::{
    BranchName, ClientId, ConflictEntry, ConflictReason, Epoch, EpochCursor, Receipt, SpaceId,
    TxRequest, WriteRef,
};
use strand_store::{CursorRow, EpochRecord, SpaceStore, StoreError};

use crate::writer::{CommitEvent, SpaceWriter};
use crate::{EngineConfig, EngineError};

/// Commands a space actor serves. Every store mutation for the space goes
/// through exactly one of these.
enum SpaceCommand {
    Transact {
        tx: TxRequest,
        deadline: Instant,
        reply: oneshot::Sender<Receipt>,
    },
    Hello {
        client: ClientId,
        since_epoch: EpochCursor,
        reply: oneshot::Sender<Result<(CursorRow, Epoch), StoreError>>,
    },
    Ack {
        client: ClientId,
        epoch: Epoch,
    },
    CurrentEpoch {
        reply: oneshot::Sender<Epoch>,
    },
    OldestEpoch {
        reply: oneshot::Sender<Result<Option<Epoch>, StoreError>>,
    },
    EpochsSince {
        since: Epoch,
        reply: oneshot::Sender<Result<Vec<EpochRecord>, StoreError>>,
    },
    SnapshotDoc {
        doc: DocId,
        reply: oneshot::Sender<Result<(Epoch, Vec<u8>), StoreError>>,
    },
    Cursor {
        client: ClientId,
        reply: oneshot::Sender<Result<Option<CursorRow>, StoreError>>,
    },
}

struct SpaceSlot {
    cmd_tx: mpsc::Sender<SpaceCommand>,
    commits: broadcast::Sender<CommitEvent>,
    restarts: u32,
    degraded: bool,
}

struct RouterInner {
    codec: Arc<dyn Codec>,
    store: SpaceStore,
    config: EngineConfig,
    spaces: Mutex<HashMap<SpaceId, SpaceSlot>>,
}

/// Lazily spawns and supervises one writer actor per space.
#[derive(Clone)]
pub struct EngineRouter {
    inner: Arc<RouterInner>,
}

impl EngineRouter {
    /// Builds a router over a spaces directory.
    pub fn new(codec: Arc<dyn Codec>, store: SpaceStore, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                codec,
                store,
                config,
                spaces: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Handle for one space. Cheap; the actor spawns on first use.
    #[must_use]
    pub fn space(&self, space: &SpaceId) -> SpaceClient {
        SpaceClient {
            space: space.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl RouterInner {
    /// Returns the mailbox for a space, spawning or respawning its actor
    /// as needed.
    fn mailbox(
        self: &Arc<Self>,
        space: &SpaceId,
        respawn: bool,
    ) -> Result<mpsc::Sender<SpaceCommand>, EngineError> {
        let mut spaces = self
            .spaces
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(slot) = spaces.get_mut(space) {
            if slot.degraded {
                return Err(EngineError::Degraded(space.clone()));
            }
            if !respawn && !slot.cmd_tx.is_closed() {
                return Ok(slot.cmd_tx.clone());
            }
            slot.restarts += 1;
            if slot.restarts > self.config.max_writer_restarts {
                error!(space = %space, restarts = slot.restarts - 1, "writer restart budget spent; marking space degraded");
                slot.degraded = true;
                return Err(EngineError::Degraded(space.clone()));
            }
            warn!(space = %space, attempt = slot.restarts, "restarting space writer");
            let (cmd_tx, cmd_rx) = mpsc::channel(self.config.mailbox_depth);
            self.spawn_writer(space.clone(), cmd_rx, slot.commits.clone());
            slot.cmd_tx = cmd_tx.clone();
            return Ok(cmd_tx);
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(self.config.mailbox_depth);
        let (commits, _) = broadcast::channel(self.config.commit_buffer);
        self.spawn_writer(space.clone(), cmd_rx, commits.clone());
        spaces.insert(
            space.clone(),
            SpaceSlot {
                cmd_tx: cmd_tx.clone(),
                commits,
                restarts: 0,
                degraded: false,
            },
        );
        Ok(cmd_tx)
    }

    fn commits(self: &Arc<Self>, space: &SpaceId) -> broadcast::Sender<CommitEvent> {
        // Ensure the slot (and actor) exists so events flow.
        let _ = self.mailbox(space, false);
        let spaces = self
            .spaces
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        spaces
            .get(space)
            .map_or_else(|| broadcast::channel(1).0, |slot| slot.commits.clone())
    }

    fn spawn_writer(
        self: &Arc<Self>,
        space: SpaceId,
        cmd_rx: mpsc::Receiver<SpaceCommand>,
        commits: broadcast::Sender<CommitEvent>,
    ) {
        let codec = Arc::clone(&self.codec);
        let store = self.store.clone();
        let default_merge = self.config.default_server_merge;
        tokio::task::spawn_blocking(move || {
            let handle = match store.open(&space) {
                Ok(handle) => handle,
                Err(err) => {
                    error!(space = %space, %err, "failed to open space database");
                    return;
                }
            };
            info!(space = %space, epoch = handle.current_epoch(), "space writer started");
            let writer = SpaceWriter::new(codec, handle, default_merge);
            run_writer_loop(writer, cmd_rx, &commits);
        });
    }
}

/// Drains the mailbox until it closes or the store drifts fatally.
fn run_writer_loop(
    mut writer: SpaceWriter,
    mut cmd_rx: mpsc::Receiver<SpaceCommand>,
    commits: &broadcast::Sender<CommitEvent>,
) {
    while let Some(cmd) = cmd_rx.blocking_recv() {
        match cmd {
            SpaceCommand::Transact { tx, deadline, reply } => {
                if Instant::now() > deadline {
                    let _ = reply.send(timeout_receipt(&tx));
                    continue;
                }
                match writer.transact(&tx, unix_millis()) {
                    Ok((receipt, event)) => {
                        if let Some(event) = event {
                            // No receivers is fine; fan-out may attach later.
                            let _ = commits.send(event);
                        }
                        let _ = reply.send(receipt);
                    }
                    Err(err) => {
                        error!(space = %writer.space(), %err, "writer stopping on fatal store error");
                        let _ = reply.send(Receipt::Conflict {
                            tx_id: tx.tx_id,
                            conflicts: vec![ConflictEntry {
                                r#ref: WriteRef {
                                    index: 0,
                                    doc: tx
                                        .writes
                                        .first()
                                        .map_or_else(|| DocId::from(""), |w| w.doc.clone()),
                                    branch: BranchName::main(),
                                },
                                reason: ConflictReason::Causality,
                            }],
                        });
                        return;
                    }
                }
            }
            SpaceCommand::Hello {
                client,
                since_epoch,
                reply,
            } => {
                let now = unix_millis();
                let result = writer
                    .store()
                    .ensure_cursor(&client, since_epoch, now)
                    .map(|row| (row, writer.current_epoch()));
                let _ = reply.send(result);
            }
            SpaceCommand::Ack { client, epoch } => {
                let now = unix_millis();
                if let Err(err) = writer.store().set_cursor(&client, epoch, now) {
                    warn!(space = %writer.space(), %client, epoch, %err, "failed to persist ack cursor");
                }
            }
            SpaceCommand::CurrentEpoch { reply } => {
                let _ = reply.send(writer.current_epoch());
            }
            SpaceCommand::OldestEpoch { reply } => {
                let _ = reply.send(writer.store().oldest_epoch());
            }
            SpaceCommand::EpochsSince { since, reply } => {
                let _ = reply.send(writer.store().epochs_since(since));
            }
            SpaceCommand::SnapshotDoc { doc, reply } => {
                let _ = reply.send(writer.snapshot_doc(&doc));
            }
            SpaceCommand::Cursor { client, reply } => {
                let _ = reply.send(writer.store().cursor(&client));
            }
        }
    }
}

fn timeout_receipt(tx: &TxRequest) -> Receipt {
    Receipt::Conflict {
        tx_id: tx.tx_id,
        conflicts: vec![ConflictEntry {
            r#ref: WriteRef {
                index: 0,
                doc: tx
                    .writes
                    .first()
                    .map(|w| w.doc.clone())
                    .or_else(|| tx.reads.first().map(|r| r.doc.clone()))
                    .unwrap_or_else(|| DocId::from("")),
                branch: BranchName::main(),
            },
            reason: ConflictReason::Timeout,
        }],
    }
}

/// Milliseconds since the Unix epoch; clamps to zero on a pre-1970 clock.
fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Async handle to one space's writer.
#[derive(Clone)]
pub struct SpaceClient {
    space: SpaceId,
    inner: Arc<RouterInner>,
}

impl SpaceClient {
    /// The space this client addresses.
    #[must_use]
    pub fn space(&self) -> &SpaceId {
        &self.space
    }

    /// Subscribes to this space's commit events. The channel survives
    /// writer restarts.
    #[must_use]
    pub fn subscribe_commits(&self) -> broadcast::Receiver<CommitEvent> {
        self.inner.commits(&self.space).subscribe()
    }

    /// Submits a transaction with a deadline; expiry yields a
    /// `conflict{timeout}` receipt without committing.
    ///
    /// # Errors
    /// [`EngineError::Degraded`] / [`EngineError::Unavailable`] when the
    /// space writer cannot serve the command.
    pub async fn transact(&self, tx: TxRequest, deadline: Instant) -> Result<Receipt, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SpaceCommand::Transact {
            tx,
            deadline,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| EngineError::Unavailable(self.space.clone()))
    }

    /// Records (or refreshes) a client cursor and reports the current
    /// epoch.
    ///
    /// # Errors
    /// Store failures, or an unavailable/degraded writer.
    pub async fn hello(
        &self,
        client: ClientId,
        since_epoch: EpochCursor,
    ) -> Result<(CursorRow, Epoch), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SpaceCommand::Hello {
            client,
            since_epoch,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| EngineError::Unavailable(self.space.clone()))?
            .map_err(EngineError::from)
    }

    /// Durably advances a client's ACK cursor. Fire-and-forget.
    ///
    /// # Errors
    /// An unavailable/degraded writer.
    pub async fn ack(&self, client: ClientId, epoch: Epoch) -> Result<(), EngineError> {
        self.send(SpaceCommand::Ack { client, epoch }).await
    }

    /// Current epoch of the space.
    ///
    /// # Errors
    /// An unavailable/degraded writer.
    pub async fn current_epoch(&self) -> Result<Epoch, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SpaceCommand::CurrentEpoch { reply: reply_tx })
            .await?;
        reply_rx
            .await
            .map_err(|_| EngineError::Unavailable(self.space.clone()))
    }

    /// Oldest epoch still in the log (`None` when empty).
    ///
    /// # Errors
    /// Store failures, or an unavailable/degraded writer.
    pub async fn oldest_epoch(&self) -> Result<Option<Epoch>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SpaceCommand::OldestEpoch { reply: reply_tx })
            .await?;
        reply_rx
            .await
            .map_err(|_| EngineError::Unavailable(self.space.clone()))?
            .map_err(EngineError::from)
    }

    /// Epoch records with `epoch > since`, in order.
    ///
    /// # Errors
    /// Store failures, or an unavailable/degraded writer.
    pub async fn epochs_since(&self, since: Epoch) -> Result<Vec<EpochRecord>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SpaceCommand::EpochsSince {
            since,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| EngineError::Unavailable(self.space.clone()))?
            .map_err(EngineError::from)
    }

    /// Saved bytes of a document's main branch at the current epoch.
    ///
    /// # Errors
    /// Store failures, or an unavailable/degraded writer.
    pub async fn snapshot_doc(&self, doc: DocId) -> Result<(Epoch, Vec<u8>), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SpaceCommand::SnapshotDoc {
            doc,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| EngineError::Unavailable(self.space.clone()))?
            .map_err(EngineError::from)
    }

    /// Looks up a durable client cursor.
    ///
    /// # Errors
    /// Store failures, or an unavailable/degraded writer.
    pub async fn cursor(&self, client: ClientId) -> Result<Option<CursorRow>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SpaceCommand::Cursor {
            client,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| EngineError::Unavailable(self.space.clone()))?
            .map_err(EngineError::from)
    }

    /// Sends one command, respawning the actor when the previous one has
    /// stopped. The command is handed over at most once.
    async fn send(&self, cmd: SpaceCommand) -> Result<(), EngineError> {
        let mut cmd = cmd;
        loop {
            let mailbox = self.inner.mailbox(&self.space, false)?;
            match mailbox.send(cmd).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    // Actor stopped before accepting; request a respawn and
                    // retry (bounded by the restart budget).
                    cmd = returned;
                    self.inner.mailbox(&self.space, true)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;
    use strand_codec::{DagCodec, Json};
    use strand_proto::WriteRecord;
    use strand_testkit::ChangeBuilder;

    fn router(dir: &std::path::Path) -> EngineRouter {
        EngineRouter::new(
            Arc::new(DagCodec),
            SpaceStore::new(dir),
            EngineConfig::default(),
        )
    }

    fn genesis_write(doc: &DocId, key: &str, value: f64) -> WriteRecord {
        let blob = ChangeBuilder::from_genesis(doc)
            .author("actor-test")
            .set(&[key], Json::Num(value))
            .build();
        WriteRecord {
            doc: doc.clone(),
            branch: BranchName::main(),
            base_heads: BTreeSet::new(),
            changes: vec![blob],
            allow_server_merge: false,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn commits_flow_through_the_actor_and_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(dir.path());
        let space = router.space(&SpaceId::from("did:key:s1"));
        let mut commits = space.subscribe_commits();

        let doc = DocId::from("doc:x");
        let tx = TxRequest {
            tx_id: 1,
            reads: vec![],
            writes: vec![genesis_write(&doc, "count", 1.0)],
        };
        let receipt = space
            .transact(tx, Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(receipt, Receipt::Ok { epoch: 1, .. }));

        let event = commits.recv().await.unwrap();
        assert_eq!(event.record.epoch, 1);
        assert_eq!(event.space, SpaceId::from("did:key:s1"));
        assert_eq!(space.current_epoch().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn expired_deadline_times_out_without_committing() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(dir.path());
        let space = router.space(&SpaceId::from("did:key:s1"));
        let doc = DocId::from("doc:x");
        let tx = TxRequest {
            tx_id: 2,
            reads: vec![],
            writes: vec![genesis_write(&doc, "count", 1.0)],
        };
        let receipt = space
            .transact(tx, Instant::now() - Duration::from_millis(1))
            .await
            .unwrap();
        let Receipt::Conflict { conflicts, .. } = receipt else {
            panic!("expected timeout conflict");
        };
        assert_eq!(conflicts[0].reason, ConflictReason::Timeout);
        assert_eq!(space.current_epoch().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn hello_creates_a_durable_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(dir.path());
        let space = router.space(&SpaceId::from("did:key:s1"));
        let (row, epoch) = space
            .hello(ClientId::from("c1"), -1)
            .await
            .unwrap();
        assert_eq!(row.last_acked_epoch, -1);
        assert_eq!(epoch, 0);

        space.ack(ClientId::from("c1"), 4).await.unwrap();
        // Acks are fire-and-forget; poll the cursor until it lands.
        let mut acked = -1;
        for _ in 0..50 {
            if let Some(row) = space.cursor(ClientId::from("c1")).await.unwrap() {
                acked = row.last_acked_epoch;
                if acked == 4 {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(acked, 4);
    }
}
