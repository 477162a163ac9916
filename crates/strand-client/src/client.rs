// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The client: request plumbing, delivery application, synced barrier.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use strand_codec::{Doc, DocId, Head, Json, Path};
use strand_proto::{
    Authorization, ClientFrame, ClientId, Command, CommandArgs, DeliverFrame, Envelope, Epoch,
    EpochCursor, Invocation, Query, RequestId, ReturnValue, ServerFrame, SpaceId, SubscriptionId,
};

use crate::tx::Transaction;
use crate::view::DocView;
use crate::{ClientConfig, ClientError};

/// One logical connection to the hub: frames out, frames in.
///
/// Adapters own the byte-level framing; the client core only ever sees
/// typed frames.
pub struct Connection {
    /// Client→server frames.
    pub outbound: mpsc::Sender<ClientFrame>,
    /// Server→client frames.
    pub inbound: mpsc::Receiver<ServerFrame>,
}

/// Fired when a server delivery promotes a new baseline.
#[derive(Debug, Clone)]
pub struct ChangeNotice {
    /// Space the change happened in.
    pub space: SpaceId,
    /// Document whose baseline advanced.
    pub doc: DocId,
    /// Path scope of the delivery; empty for snapshots.
    pub path: Path,
    /// Root JSON before the delivery, when a baseline existed.
    pub before: Option<Json>,
    /// Root JSON after the delivery.
    pub after: Json,
}

/// What a reader sees for one document.
#[derive(Debug, Clone)]
pub struct ViewSnapshot {
    /// Visible JSON: the top overlay if any, else the promoted baseline.
    pub json: Json,
    /// Baseline epoch underneath the view.
    pub epoch: Epoch,
    /// Baseline head-set underneath the view.
    pub heads: BTreeSet<Head>,
}

type ChangeHandler = Box<dyn Fn(&ChangeNotice) + Send + Sync>;

pub(crate) struct SpaceState {
    pub since_epoch: EpochCursor,
    pub current_epoch: Epoch,
    pub docs: HashMap<DocId, DocView>,
    pub pending_subscribes: usize,
    pub inflight_commits: usize,
    pub synced_waiters: Vec<oneshot::Sender<()>>,
}

impl SpaceState {
    fn new() -> Self {
        Self {
            since_epoch: strand_proto::CURSOR_NONE,
            current_epoch: 0,
            docs: HashMap::new(),
            pending_subscribes: 0,
            inflight_commits: 0,
            synced_waiters: Vec::new(),
        }
    }

    /// Releases `synced` waiters once nothing opened before them is
    /// outstanding.
    pub fn release_if_settled(&mut self) {
        if self.pending_subscribes == 0 && self.inflight_commits == 0 {
            for waiter in self.synced_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }
}

pub(crate) struct ClientState {
    pub next_request: u64,
    pub next_tx: u64,
    pub pending: HashMap<u64, oneshot::Sender<ReturnValue>>,
    pub spaces: HashMap<SpaceId, SpaceState>,
}

pub(crate) struct ClientInner {
    pub config: ClientConfig,
    pub outbound: mpsc::Sender<ClientFrame>,
    pub state: Mutex<ClientState>,
    handlers: Mutex<Vec<ChangeHandler>>,
}

impl ClientInner {
    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn space_mut<'a>(
        state: &'a mut ClientState,
        space: &SpaceId,
    ) -> &'a mut SpaceState {
        state
            .spaces
            .entry(space.clone())
            .or_insert_with(SpaceState::new)
    }

    /// Sends one request envelope and awaits its `task/return`.
    pub(crate) async fn request(
        self: &Arc<Self>,
        cmd: Command,
        space: &SpaceId,
        args: CommandArgs,
    ) -> Result<ReturnValue, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let id = {
            let mut state = self.lock();
            let id = state.next_request;
            state.next_request += 1;
            state.pending.insert(id, reply_tx);
            id
        };
        let envelope = Envelope {
            id: RequestId(id),
            invocation: Invocation {
                iss: self.config.client_id.clone(),
                cmd,
                sub: space.clone(),
                args,
                prf: Vec::new(),
            },
            authorization: Authorization {
                signature: Vec::new(),
                access: self.config.access_token.clone(),
            },
        };
        if self
            .outbound
            .send(ClientFrame::Request(envelope))
            .await
            .is_err()
        {
            self.lock().pending.remove(&id);
            return Err(ClientError::TransportClosed);
        }
        match timeout(self.config.op_timeout, reply_rx).await {
            Ok(Ok(value)) => match value {
                ReturnValue::Error(payload) => Err(ClientError::Server(payload)),
                other => Ok(other),
            },
            Ok(Err(_)) => Err(ClientError::TransportClosed),
            Err(_) => {
                self.lock().pending.remove(&id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Applies one delivery batch: advance baselines, re-derive overlays,
    /// record invalidation marks, then ack.
    ///
    /// A delta the view cannot apply — no baseline yet, or a merge the
    /// codec rejects — is a protocol error, not a reason to stall: the
    /// batch is still acknowledged (so the window keeps draining) and a
    /// one-shot get is issued for the document, whose snapshot repairs
    /// the baseline at a later epoch. Open reads of the document are
    /// conservatively invalidated in the meantime.
    async fn apply_delivery(self: &Arc<Self>, frame: DeliverFrame) -> Result<(), ClientError> {
        let mut notices = Vec::new();
        let mut resync: Vec<DocId> = Vec::new();
        {
            let mut state = self.lock();
            let space = Self::space_mut(&mut state, &frame.space);
            space.current_epoch = space.current_epoch.max(frame.epoch);
            for entry in &frame.docs {
                let view = space.docs.entry(entry.doc.clone()).or_default();
                let before = view.baseline.as_ref().map(|b| b.doc.json().clone());
                let mut changed = false;
                if let Some(bytes) = entry
                    .body
                    .snapshot_bytes()
                    .map_err(|err| ClientError::MalformedDelivery(err.to_string()))?
                {
                    let doc = Doc::load(&bytes)
                        .map_err(|err| ClientError::MalformedDelivery(err.to_string()))?;
                    let stale = view
                        .baseline
                        .as_ref()
                        .is_some_and(|b| b.epoch > frame.epoch);
                    if !stale {
                        view.baseline = Some(crate::view::Baseline {
                            doc,
                            epoch: frame.epoch,
                        });
                        changed = true;
                    }
                    view.mark_delivery(frame.epoch, None);
                } else if let Some(blobs) = entry
                    .body
                    .delta_blobs()
                    .map_err(|err| ClientError::MalformedDelivery(err.to_string()))?
                {
                    let applied = match view.baseline.as_mut() {
                        Some(baseline) => match baseline.doc.merge(&blobs) {
                            Ok(()) => {
                                baseline.epoch = baseline.epoch.max(frame.epoch);
                                true
                            }
                            Err(err) => {
                                warn!(doc = %entry.doc, %err, "delta did not apply; requesting snapshot");
                                false
                            }
                        },
                        None => {
                            warn!(doc = %entry.doc, "delta for a document with no baseline; requesting snapshot");
                            false
                        }
                    };
                    if applied {
                        let paths = if entry.paths.is_empty() {
                            None
                        } else {
                            Some(entry.paths.clone())
                        };
                        view.mark_delivery(frame.epoch, paths);
                        changed = true;
                    } else {
                        view.mark_delivery(frame.epoch, None);
                        resync.push(entry.doc.clone());
                    }
                }
                view.rederive();
                if changed {
                    let after = view
                        .baseline
                        .as_ref()
                        .map_or_else(Json::empty_object, |b| b.doc.json().clone());
                    notices.push(ChangeNotice {
                        space: frame.space.clone(),
                        doc: entry.doc.clone(),
                        path: entry.paths.first().cloned().unwrap_or_default(),
                        before,
                        after,
                    });
                }
            }
        }
        for doc in resync {
            let inner = Arc::clone(self);
            let space = frame.space.clone();
            tokio::spawn(async move {
                let consumer_id = ClientId::new(inner.config.client_id.clone());
                let query = Query::doc_root(doc);
                if let Err(err) = inner
                    .request(Command::Get, &space, CommandArgs::Get { consumer_id, query })
                    .await
                {
                    warn!(%space, %err, "snapshot resync failed");
                }
            });
        }
        for notice in &notices {
            let handlers = self
                .handlers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for handler in handlers.iter() {
                handler(notice);
            }
        }
        // Acknowledge after the batch is applied; this is what advances
        // the durable cursor.
        let ack = ClientFrame::Ack {
            stream_id: frame.stream_id,
            epoch: frame.epoch,
        };
        self.outbound
            .send(ack)
            .await
            .map_err(|_| ClientError::TransportClosed)
    }
}

/// A connected client core.
#[derive(Clone)]
pub struct StrandClient {
    inner: Arc<ClientInner>,
}

impl StrandClient {
    /// Wraps a connection and spawns the inbound driver.
    #[must_use]
    pub fn connect(conn: Connection, config: ClientConfig) -> Self {
        let inner = Arc::new(ClientInner {
            config,
            outbound: conn.outbound,
            state: Mutex::new(ClientState {
                next_request: 1,
                next_tx: 1,
                pending: HashMap::new(),
                spaces: HashMap::new(),
            }),
            handlers: Mutex::new(Vec::new()),
        });
        let driver = Arc::clone(&inner);
        let mut inbound = conn.inbound;
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                match frame {
                    ServerFrame::TaskReturn { of, is } => {
                        let waiter = driver.lock().pending.remove(&of.0);
                        match waiter {
                            Some(waiter) => {
                                let _ = waiter.send(is);
                            }
                            None => debug!(request = of.0, "return for unknown request"),
                        }
                    }
                    ServerFrame::Deliver(frame) => {
                        if let Err(err) = driver.apply_delivery(frame).await {
                            warn!(%err, "failed to apply delivery");
                        }
                    }
                }
            }
            debug!("client inbound closed");
        });
        Self { inner }
    }

    /// This client's durable identity.
    #[must_use]
    pub fn client_id(&self) -> ClientId {
        ClientId::new(self.inner.config.client_id.clone())
    }

    /// Resume negotiation: records the durable cursor server-side and
    /// remembers `since_epoch` for subscribes on this connection.
    ///
    /// # Errors
    /// Transport, timeout, or server-rejection failures.
    pub async fn hello(
        &self,
        space: &SpaceId,
        since_epoch: EpochCursor,
    ) -> Result<Epoch, ClientError> {
        let value = self
            .inner
            .request(
                Command::Hello,
                space,
                CommandArgs::Hello {
                    client_id: self.client_id(),
                    since_epoch,
                },
            )
            .await?;
        let ReturnValue::HelloOk { current_epoch } = value else {
            return Err(ClientError::UnexpectedReturn);
        };
        let mut state = self.inner.lock();
        let entry = ClientInner::space_mut(&mut state, space);
        entry.since_epoch = since_epoch;
        entry.current_epoch = current_epoch;
        Ok(current_epoch)
    }

    /// Opens a live subscription. Resolves once the initial backfill has
    /// completed; deliveries (including the backfill) populate baselines
    /// as they arrive.
    ///
    /// # Errors
    /// Transport, timeout, or server-rejection failures.
    pub async fn subscribe(
        &self,
        space: &SpaceId,
        query: Query,
    ) -> Result<SubscriptionHandle, ClientError> {
        {
            let mut state = self.inner.lock();
            ClientInner::space_mut(&mut state, space).pending_subscribes += 1;
        }
        let result = self
            .inner
            .request(
                Command::Subscribe,
                space,
                CommandArgs::Subscribe {
                    consumer_id: self.client_id(),
                    query,
                },
            )
            .await;
        let settled = {
            let mut state = self.inner.lock();
            let entry = ClientInner::space_mut(&mut state, space);
            entry.pending_subscribes -= 1;
            entry.release_if_settled();
            result
        };
        let ReturnValue::Complete { subscription } = settled? else {
            return Err(ClientError::UnexpectedReturn);
        };
        let id = subscription.ok_or(ClientError::UnexpectedReturn)?;
        Ok(SubscriptionHandle {
            inner: Arc::clone(&self.inner),
            space: space.clone(),
            id,
        })
    }

    /// One-shot read: populates baselines for the query and resolves on
    /// `complete`. No live deliveries follow.
    ///
    /// # Errors
    /// Transport, timeout, or server-rejection failures.
    pub async fn get(&self, space: &SpaceId, query: Query) -> Result<(), ClientError> {
        let value = self
            .inner
            .request(
                Command::Get,
                space,
                CommandArgs::Get {
                    consumer_id: self.client_id(),
                    query,
                },
            )
            .await?;
        match value {
            ReturnValue::Complete { .. } => Ok(()),
            _ => Err(ClientError::UnexpectedReturn),
        }
    }

    /// Opens a transaction against one space.
    #[must_use]
    pub fn new_transaction(&self, space: &SpaceId) -> Transaction {
        let tx_id = {
            let mut state = self.inner.lock();
            let id = state.next_tx;
            state.next_tx += 1;
            id
        };
        Transaction::new(Arc::clone(&self.inner), space.clone(), tx_id)
    }

    /// The visible view of a document: top overlay if any, else the
    /// promoted baseline, else `None`.
    #[must_use]
    pub fn read_view(&self, space: &SpaceId, doc: &DocId) -> Option<ViewSnapshot> {
        let state = self.inner.lock();
        let view = state.spaces.get(space)?.docs.get(doc)?;
        let json = view.visible_json()?.clone();
        let (epoch, heads) = view
            .version()
            .unwrap_or_else(|| (0, view.base_heads(doc)));
        Some(ViewSnapshot { json, epoch, heads })
    }

    /// Registers a handler invoked whenever a delivery promotes a new
    /// baseline.
    pub fn on_change(&self, handler: impl Fn(&ChangeNotice) + Send + Sync + 'static) {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(handler));
    }

    /// Resolves once every subscription opened before this call has
    /// completed its backfill and every commit submitted before it has
    /// settled.
    pub async fn synced(&self, space: &SpaceId) {
        let waiter = {
            let mut state = self.inner.lock();
            let entry = ClientInner::space_mut(&mut state, space);
            if entry.pending_subscribes == 0 && entry.inflight_commits == 0 {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                entry.synced_waiters.push(tx);
                Some(rx)
            }
        };
        if let Some(rx) = waiter {
            let _ = rx.await;
        }
    }
}

/// Handle for tearing a subscription down.
pub struct SubscriptionHandle {
    inner: Arc<ClientInner>,
    space: SpaceId,
    id: SubscriptionId,
}

impl SubscriptionHandle {
    /// The server-assigned stream identifier.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Tears the subscription down; no further deliveries arrive for it.
    ///
    /// # Errors
    /// Transport, timeout, or server-rejection failures.
    pub async fn unsubscribe(self) -> Result<(), ClientError> {
        let value = self
            .inner
            .request(
                Command::Unsubscribe,
                &self.space,
                CommandArgs::Unsubscribe {
                    subscription: self.id,
                },
            )
            .await?;
        match value {
            ReturnValue::Unsubscribed => Ok(()),
            _ => Err(ClientError::UnexpectedReturn),
        }
    }
}
