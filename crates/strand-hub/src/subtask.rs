// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-subscription delivery task.
//!
//! Owns the subscription's FIFO and walks the state machine:
//! `Backfilling` (buffer live batches behind the initial backfill) →
//! `Live` (drain in epoch order, at most `unacked_window` batches in
//! flight) with implicit `Paused` whenever the sink has no capacity —
//! the drain awaits a send permit, so transport write-readiness is the
//! resume signal. A pending queue deeper than `coalesce_depth` collapses
//! to one snapshot batch at the latest epoch.
//!
//! Single producer (the space pump), single consumer (this task); the
//! registry lock is never held here.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use strand_engine::SpaceClient;
use strand_proto::{
    DeliverFrame, DocEntry, Epoch, EntryBody, Query, RequestId, ReturnValue, ServerFrame,
    SubscriptionId,
};

use crate::HubConfig;

/// Control messages into a subscription task.
#[derive(Debug)]
pub enum SubMsg {
    /// The initial backfill: frames to send, the epoch floor they bring
    /// the consumer to, and the subscribe request to complete afterwards.
    Backfill {
        /// Zero or one frames today; kept plural for multi-doc queries.
        frames: Vec<DeliverFrame>,
        /// Live batches at or below this epoch are already covered.
        floor: Epoch,
        /// Request to answer with the `complete` sentinel.
        of: RequestId,
    },
    /// A matched live commit batch.
    Commit(DeliverFrame),
    /// Consumer acknowledged every batch up to this epoch.
    Ack(Epoch),
    /// Tear the subscription down; the queue is discarded.
    Close,
}

enum Phase {
    Backfilling,
    Live,
}

pub(crate) struct SubTask {
    id: SubscriptionId,
    query: Query,
    space: SpaceClient,
    sink: mpsc::Sender<ServerFrame>,
    ctrl: mpsc::Receiver<SubMsg>,
    config: HubConfig,
    phase: Phase,
    pending: VecDeque<DeliverFrame>,
    inflight: VecDeque<Epoch>,
    last_delivered: Arc<AtomicI64>,
}

impl SubTask {
    pub(crate) fn new(
        id: SubscriptionId,
        query: Query,
        space: SpaceClient,
        sink: mpsc::Sender<ServerFrame>,
        ctrl: mpsc::Receiver<SubMsg>,
        last_delivered: Arc<AtomicI64>,
        config: HubConfig,
    ) -> Self {
        Self {
            id,
            query,
            space,
            sink,
            ctrl,
            config,
            phase: Phase::Backfilling,
            pending: VecDeque::new(),
            inflight: VecDeque::new(),
            last_delivered,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            self.discard_covered();
            let want_send = matches!(self.phase, Phase::Live)
                && !self.pending.is_empty()
                && self.inflight.len() < self.config.unacked_window;
            if want_send {
                let sink = self.sink.clone();
                tokio::select! {
                    permit = sink.reserve_owned() => {
                        let Ok(permit) = permit else {
                            debug!(sub = %self.id, "sink closed; subscription task exiting");
                            return;
                        };
                        if let Some(frame) = self.pending.pop_front() {
                            self.note_delivered(frame.epoch);
                            permit.send(ServerFrame::Deliver(frame));
                        }
                    }
                    msg = self.ctrl.recv() => {
                        let Some(msg) = msg else { return };
                        if !self.handle(msg).await {
                            return;
                        }
                    }
                }
            } else {
                let Some(msg) = self.ctrl.recv().await else {
                    return;
                };
                if !self.handle(msg).await {
                    return;
                }
            }
        }
    }

    /// Processes one control message; false ends the task.
    async fn handle(&mut self, msg: SubMsg) -> bool {
        match msg {
            SubMsg::Backfill { frames, floor, of } => {
                for frame in frames {
                    let epoch = frame.epoch;
                    if self.sink.send(ServerFrame::Deliver(frame)).await.is_err() {
                        return false;
                    }
                    self.note_delivered(epoch);
                }
                let done = ServerFrame::TaskReturn {
                    of,
                    is: ReturnValue::Complete {
                        subscription: Some(self.id),
                    },
                };
                if self.sink.send(done).await.is_err() {
                    return false;
                }
                self.set_floor(floor);
                self.phase = Phase::Live;
                true
            }
            SubMsg::Commit(frame) => {
                self.pending.push_back(frame);
                if matches!(self.phase, Phase::Live)
                    && self.pending.len() > self.config.coalesce_depth
                {
                    self.coalesce().await;
                }
                true
            }
            SubMsg::Ack(epoch) => {
                self.inflight.retain(|e| *e > epoch);
                true
            }
            SubMsg::Close => false,
        }
    }

    /// Collapses the pending queue to one snapshot batch at the latest
    /// epoch.
    async fn coalesce(&mut self) {
        let depth = self.pending.len();
        match self.space.snapshot_doc(self.query.doc.clone()).await {
            Ok((epoch, bytes)) => {
                self.pending.clear();
                self.pending.push_back(DeliverFrame {
                    space: self.space.space().clone(),
                    stream_id: self.id,
                    epoch,
                    docs: vec![DocEntry {
                        doc: self.query.doc.clone(),
                        body: EntryBody::snapshot(&bytes),
                        paths: Vec::new(),
                    }],
                });
                debug!(sub = %self.id, depth, epoch, "coalesced pending queue to snapshot");
            }
            Err(err) => {
                // Keep the queue; delivery stays correct, just not compact.
                warn!(sub = %self.id, %err, "coalesce snapshot failed");
            }
        }
    }

    /// Drops queued frames the consumer has already been brought past.
    fn discard_covered(&mut self) {
        let floor = self.last_delivered.load(Ordering::Acquire);
        while let Some(front) = self.pending.front() {
            #[allow(clippy::cast_possible_wrap)]
            if (front.epoch as i64) <= floor {
                self.pending.pop_front();
            } else {
                break;
            }
        }
    }

    fn note_delivered(&mut self, epoch: Epoch) {
        self.inflight.push_back(epoch);
        self.set_floor(epoch);
    }

    fn set_floor(&self, epoch: Epoch) {
        #[allow(clippy::cast_possible_wrap)]
        let epoch = epoch as i64;
        // Keep the maximum; an equivalent resubscribe may have advanced it.
        let mut current = self.last_delivered.load(Ordering::Acquire);
        while epoch > current {
            match self.last_delivered.compare_exchange(
                current,
                epoch,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(now) => current = now,
            }
        }
    }
}
