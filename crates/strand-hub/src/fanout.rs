// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The hub: commit pumps, subscribe/get/ack/unsubscribe entry points.
//!
//! One pump task per space bridges the engine's commit broadcast to the
//! per-subscription delivery tasks. The pump computes matches and batch
//! bodies; it never blocks on a slow consumer — each subscription's queue
//! and window live in its own task. If the pump ever lags the broadcast
//! (commit bursts beyond its buffer), every live subscription in the space
//! is nudged with a snapshot batch so no gap is observable downstream.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use strand_engine::{CommitEvent, EngineRouter, SpaceClient};
use strand_proto::{
    ClientId, DeliverFrame, DocEntry, EntryBody, Epoch, EpochCursor, Query, RequestId,
    ReturnValue, ServerFrame, SpaceId, SubscriptionId,
};

use crate::registry::{ConnId, SubEntry, SubscriptionRegistry};
use crate::resume::plan_backfill;
use crate::subtask::{SubMsg, SubTask};
use crate::{HubConfig, HubError};

/// One-shot streams (`/storage/get`) draw ids from a high range so they
/// can never collide with registered subscriptions.
const ONE_SHOT_BASE: u64 = 1 << 48;

/// The subscription fan-out hub.
pub struct Hub {
    engine: EngineRouter,
    registry: Arc<SubscriptionRegistry>,
    config: HubConfig,
    pumps: Mutex<HashSet<SpaceId>>,
    one_shot_ids: AtomicU64,
}

impl Hub {
    /// Builds a hub over an engine router.
    #[must_use]
    pub fn new(engine: EngineRouter, config: HubConfig) -> Self {
        Self {
            engine,
            registry: Arc::new(SubscriptionRegistry::new()),
            config,
            pumps: Mutex::new(HashSet::new()),
            one_shot_ids: AtomicU64::new(ONE_SHOT_BASE),
        }
    }

    /// The engine this hub fans out for.
    #[must_use]
    pub fn engine(&self) -> &EngineRouter {
        &self.engine
    }

    /// Opens (or idempotently re-opens) a subscription and kicks off its
    /// initial backfill. The `complete` sentinel answering `of` is emitted
    /// on `sink` strictly after the backfill frames.
    ///
    /// # Errors
    /// Engine failures planning the backfill; [`HubError::SinkClosed`]
    /// when the consumer vanished mid-subscribe.
    pub async fn subscribe(
        &self,
        conn: ConnId,
        sink: mpsc::Sender<ServerFrame>,
        space: &SpaceId,
        consumer: ClientId,
        query: Query,
        since_epoch: EpochCursor,
        of: RequestId,
    ) -> Result<SubscriptionId, HubError> {
        self.ensure_pump(space);
        let space_client = self.engine.space(space);

        let (ctrl_tx, ctrl_rx) = mpsc::channel(self.config.sub_queue_depth);
        let last_delivered = Arc::new(AtomicI64::new(-1));
        let entry = SubEntry {
            consumer,
            query: query.clone(),
            conn,
            ctrl: ctrl_tx,
            last_delivered: Arc::clone(&last_delivered),
        };
        let (id, inserted) = self.registry.insert(space, entry);
        if !inserted {
            // Equivalent live subscription: nothing to stream, but the
            // request still gets its completion.
            debug!(%id, "equivalent subscribe; answering complete only");
            sink.send(ServerFrame::TaskReturn {
                of,
                is: ReturnValue::Complete {
                    subscription: Some(id),
                },
            })
            .await
            .map_err(|_| HubError::SinkClosed)?;
            return Ok(id);
        }

        // The registry may have adopted a prior delivery position for a
        // resubscribe after transport loss; only such a consumer has a
        // baseline a delta backfill could apply onto.
        let (adopted, has_baseline) = self.registry.get(space, id).map_or_else(
            || (last_delivered, false),
            |e| {
                let has_baseline = e.has_baseline();
                (e.last_delivered, has_baseline)
            },
        );
        let task = SubTask::new(
            id,
            query.clone(),
            space_client.clone(),
            sink,
            ctrl_rx,
            adopted,
            self.config.clone(),
        );
        tokio::spawn(task.run());

        let plan =
            plan_backfill(&space_client, id, &query, since_epoch, has_baseline, &self.config)
                .await?;
        let backfill = SubMsg::Backfill {
            frames: plan.frames,
            floor: plan.floor,
            of,
        };
        if let Some(entry) = self.registry.get(space, id) {
            if entry.ctrl.send(backfill).await.is_err() {
                self.registry.remove(space, id);
                return Err(HubError::SinkClosed);
            }
        }
        info!(%space, %id, "subscription opened");
        Ok(id)
    }

    /// One-shot read: current snapshot/delta for the query, then
    /// `complete`. Nothing is registered and no live deliveries follow.
    ///
    /// # Errors
    /// Engine failures planning the backfill; [`HubError::SinkClosed`]
    /// when the consumer vanished mid-read.
    pub async fn get(
        &self,
        sink: &mpsc::Sender<ServerFrame>,
        space: &SpaceId,
        query: Query,
        since_epoch: EpochCursor,
        of: RequestId,
    ) -> Result<(), HubError> {
        let space_client = self.engine.space(space);
        let id = SubscriptionId(self.one_shot_ids.fetch_add(1, Ordering::Relaxed));
        // One-shot reads carry no delivery state, so a delta is never an
        // option for them.
        let plan =
            plan_backfill(&space_client, id, &query, since_epoch, false, &self.config).await?;
        for frame in plan.frames {
            sink.send(ServerFrame::Deliver(frame))
                .await
                .map_err(|_| HubError::SinkClosed)?;
        }
        sink.send(ServerFrame::TaskReturn {
            of,
            is: ReturnValue::Complete { subscription: None },
        })
        .await
        .map_err(|_| HubError::SinkClosed)?;
        Ok(())
    }

    /// Routes a consumer ACK to its subscription's window.
    ///
    /// # Errors
    /// [`HubError::UnknownSubscription`] when the stream is not live.
    pub async fn ack(
        &self,
        space: &SpaceId,
        stream: SubscriptionId,
        epoch: Epoch,
    ) -> Result<(), HubError> {
        let entry = self
            .registry
            .get(space, stream)
            .ok_or(HubError::UnknownSubscription(stream))?;
        let _ = entry.ctrl.send(SubMsg::Ack(epoch)).await;
        Ok(())
    }

    /// Tears a subscription down; its queue is discarded, the consumer's
    /// durable cursor is not touched.
    ///
    /// # Errors
    /// [`HubError::UnknownSubscription`] when the stream is not live.
    pub async fn unsubscribe(
        &self,
        space: &SpaceId,
        stream: SubscriptionId,
    ) -> Result<(), HubError> {
        let entry = self
            .registry
            .remove(space, stream)
            .ok_or(HubError::UnknownSubscription(stream))?;
        let _ = entry.ctrl.send(SubMsg::Close).await;
        info!(%space, %stream, "subscription closed");
        Ok(())
    }

    /// Sweeps every subscription a dropped connection held. In-flight
    /// batches are discarded with the tasks; cursors persist.
    pub fn drop_connection(&self, conn: ConnId) {
        for (space, id, entry) in self.registry.remove_connection(conn) {
            debug!(%space, %id, "closing subscription on transport drop");
            let _ = entry.ctrl.try_send(SubMsg::Close);
        }
    }

    /// Starts the commit pump for a space once.
    fn ensure_pump(&self, space: &SpaceId) {
        let mut pumps = self.pumps.lock().unwrap_or_else(PoisonError::into_inner);
        if pumps.contains(space) {
            return;
        }
        pumps.insert(space.clone());
        let registry = Arc::clone(&self.registry);
        let client = self.engine.space(space);
        let commits = client.subscribe_commits();
        let config = self.config.clone();
        let space = space.clone();
        tokio::spawn(async move {
            run_pump(&space, client, commits, &registry, &config).await;
        });
    }
}

/// Bridges one space's commit broadcast to its subscription tasks.
async fn run_pump(
    space: &SpaceId,
    client: SpaceClient,
    mut commits: broadcast::Receiver<CommitEvent>,
    registry: &SubscriptionRegistry,
    config: &HubConfig,
) {
    info!(%space, "fan-out pump started");
    loop {
        match commits.recv().await {
            Ok(event) => {
                for (id, entry) in registry.matches(space, event.record.as_ref()) {
                    let frame =
                        build_frame(&client, id, &entry, event.record.as_ref(), config).await;
                    if let Some(frame) = frame {
                        if entry.ctrl.send(SubMsg::Commit(frame)).await.is_err() {
                            debug!(%space, %id, "subscription task gone; skipping");
                        }
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                // Gapless delivery is the contract; resynchronize every
                // live subscription with a snapshot at the latest epoch.
                warn!(%space, missed, "commit pump lagged; resyncing subscribers");
                resync_all(space, &client, registry).await;
            }
            Err(broadcast::error::RecvError::Closed) => {
                info!(%space, "commit stream closed; pump exiting");
                return;
            }
        }
    }
}

/// Builds the delivery batch one subscription receives for one commit.
///
/// Delta bodies carry the epoch's change blobs when they fit the byte
/// budget; otherwise the document is snapshotted at the latest epoch and
/// the subscription's floor logic swallows the superseded batches.
async fn build_frame(
    client: &SpaceClient,
    id: SubscriptionId,
    entry: &SubEntry,
    record: &strand_store::EpochRecord,
    config: &HubConfig,
) -> Option<DeliverFrame> {
    let doc = &entry.query.doc;
    let blobs = record.changes_for_doc(doc);
    let total: usize = blobs.iter().map(Vec::len).sum();
    if !blobs.is_empty() && total <= config.delta_budget_bytes {
        return Some(DeliverFrame {
            space: client.space().clone(),
            stream_id: id,
            epoch: record.epoch,
            docs: vec![DocEntry {
                doc: doc.clone(),
                body: EntryBody::delta(&blobs),
                paths: record.paths_for_doc(doc),
            }],
        });
    }
    match client.snapshot_doc(doc.clone()).await {
        Ok((epoch, bytes)) => Some(DeliverFrame {
            space: client.space().clone(),
            stream_id: id,
            epoch,
            docs: vec![DocEntry {
                doc: doc.clone(),
                body: EntryBody::snapshot(&bytes),
                paths: Vec::new(),
            }],
        }),
        Err(err) => {
            warn!(%id, %err, "failed to snapshot oversized batch");
            None
        }
    }
}

/// Sends every live subscription a snapshot batch at the latest epoch.
async fn resync_all(space: &SpaceId, client: &SpaceClient, registry: &SubscriptionRegistry) {
    for (id, entry) in registry.entries(space) {
        match client.snapshot_doc(entry.query.doc.clone()).await {
            Ok((epoch, bytes)) => {
                let frame = DeliverFrame {
                    space: space.clone(),
                    stream_id: id,
                    epoch,
                    docs: vec![DocEntry {
                        doc: entry.query.doc.clone(),
                        body: EntryBody::snapshot(&bytes),
                        paths: Vec::new(),
                    }],
                };
                let _ = entry.ctrl.send(SubMsg::Commit(frame)).await;
            }
            Err(err) => {
                warn!(%space, %id, %err, "resync snapshot failed");
            }
        }
    }
}
