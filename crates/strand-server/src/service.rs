// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Connection handling and command dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use strand_hub::{ConnId, Hub, HubError};
use strand_proto::wire::{decode_frame, encode_frame, WireError};
use strand_proto::{
    ClientFrame, ClientId, CommandArgs, Envelope, EpochCursor, ErrorPayload, Receipt, RequestId,
    ReturnValue, ServerFrame, SpaceId, SubscriptionId, CURSOR_NONE,
};

use crate::auth::{AuthDecision, Authorizer, Capability};

/// Server tunables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Deadline applied to every transaction.
    pub op_deadline: Duration,
    /// Outbox depth per connection; a full outbox pauses delivery drains.
    pub outbox_depth: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            op_deadline: Duration::from_secs(30),
            outbox_depth: 256,
        }
    }
}

/// The storage hub service: one instance per process.
pub struct StorageService {
    hub: Hub,
    auth: Arc<dyn Authorizer>,
    config: ServiceConfig,
    next_conn: AtomicU64,
}

/// Per-connection session state, owned by the reader loop.
struct ConnSession {
    id: ConnId,
    outbox: mpsc::Sender<ServerFrame>,
    /// Per-space hello results: the declared resume position.
    hellos: HashMap<SpaceId, (ClientId, EpochCursor)>,
    /// Streams opened on this connection, for ack routing.
    streams: HashMap<SubscriptionId, (SpaceId, ClientId)>,
}

impl StorageService {
    /// Builds a service over a hub and an authorizer.
    #[must_use]
    pub fn new(hub: Hub, auth: Arc<dyn Authorizer>, config: ServiceConfig) -> Self {
        Self {
            hub,
            auth,
            config,
            next_conn: AtomicU64::new(1),
        }
    }

    /// The hub behind this service.
    #[must_use]
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Accept loop: one task per connection, until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    let service = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = service.handle_connection(stream).await {
                            debug!(%peer, %err, "connection ended");
                        }
                    });
                }
                Err(err) => {
                    warn!(%err, "accept failed; listener stopping");
                    return;
                }
            }
        }
    }

    /// Runs one connection to completion: reader loop plus outbox writer.
    ///
    /// # Errors
    /// Socket I/O failures; protocol violations end the connection
    /// without error.
    pub async fn handle_connection(self: &Arc<Self>, stream: TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();
        let (outbox_tx, mut outbox_rx) = mpsc::channel::<ServerFrame>(self.config.outbox_depth);
        let conn = ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed));

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbox_rx.recv().await {
                let packet = match encode_frame(&frame) {
                    Ok(packet) => packet,
                    Err(err) => {
                        warn!(%err, "dropping unencodable frame");
                        continue;
                    }
                };
                if writer.write_all(&packet).await.is_err() {
                    break;
                }
            }
        });

        let mut session = ConnSession {
            id: conn,
            outbox: outbox_tx,
            hellos: HashMap::new(),
            streams: HashMap::new(),
        };

        let mut buf: Vec<u8> = Vec::with_capacity(32 * 1024);
        let mut chunk = vec![0u8; 16 * 1024];
        'conn: loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            buf.extend_from_slice(&chunk[..n]);
            loop {
                match decode_frame::<ClientFrame>(&buf) {
                    Ok((frame, used)) => {
                        buf.drain(..used);
                        if self.dispatch(&mut session, frame).await.is_err() {
                            break 'conn;
                        }
                    }
                    Err(WireError::Incomplete { .. }) => break,
                    Err(err) => {
                        warn!(conn = conn.0, %err, "undecodable frame; dropping connection");
                        break 'conn;
                    }
                }
            }
        }

        // Transport drop: discard in-flight batches, keep durable cursors.
        self.hub.drop_connection(conn);
        writer_task.abort();
        info!(conn = conn.0, "connection closed");
        Ok(())
    }

    /// Handles one inbound frame. An error means the consumer is gone.
    async fn dispatch(
        self: &Arc<Self>,
        session: &mut ConnSession,
        frame: ClientFrame,
    ) -> Result<(), HubError> {
        match frame {
            ClientFrame::Request(envelope) => self.dispatch_request(session, envelope).await,
            ClientFrame::Ack { stream_id, epoch } => {
                let Some((space, client)) = session.streams.get(&stream_id).cloned() else {
                    debug!(stream = %stream_id, "ack for unknown stream");
                    return Ok(());
                };
                // Window first, then the durable cursor.
                if let Err(err) = self.hub.ack(&space, stream_id, epoch).await {
                    debug!(%err, "window ack failed");
                }
                if let Err(err) = self.hub.engine().space(&space).ack(client, epoch).await {
                    warn!(%err, "durable ack failed");
                }
                Ok(())
            }
        }
    }

    async fn dispatch_request(
        self: &Arc<Self>,
        session: &mut ConnSession,
        envelope: Envelope,
    ) -> Result<(), HubError> {
        let of = envelope.id;
        if let Err((cmd, got)) = envelope.invocation.validate() {
            let payload =
                ErrorPayload::malformed(format!("args for {} sent to {}", got.as_str(), cmd.as_str()));
            return self.answer(session, of, ReturnValue::Error(payload)).await;
        }

        let space = envelope.invocation.sub.clone();
        let capability = if envelope.invocation.cmd.is_write() {
            Capability::Write
        } else {
            Capability::Read
        };
        match self
            .auth
            .authorize(&envelope.authorization.access, &space, capability)
        {
            AuthDecision::Ok => {}
            AuthDecision::Unauthorized => {
                let payload = ErrorPayload::unauthorized("no usable credential");
                return self.answer(session, of, ReturnValue::Error(payload)).await;
            }
            AuthDecision::Forbidden => {
                let payload = ErrorPayload::forbidden(format!(
                    "token lacks {capability:?} on {space}",
                ));
                return self.answer(session, of, ReturnValue::Error(payload)).await;
            }
        }

        match envelope.invocation.args {
            CommandArgs::Hello {
                client_id,
                since_epoch,
            } => {
                match self
                    .hub
                    .engine()
                    .space(&space)
                    .hello(client_id.clone(), since_epoch)
                    .await
                {
                    Ok((_cursor, current_epoch)) => {
                        session
                            .hellos
                            .insert(space.clone(), (client_id, since_epoch));
                        self.answer(session, of, ReturnValue::HelloOk { current_epoch })
                            .await
                    }
                    Err(err) => {
                        warn!(%err, "hello failed");
                        let payload = ErrorPayload::internal("cursor unavailable");
                        self.answer(session, of, ReturnValue::Error(payload)).await
                    }
                }
            }
            CommandArgs::Subscribe { consumer_id, query } => {
                let since = session
                    .hellos
                    .get(&space)
                    .map_or(CURSOR_NONE, |(_, since)| *since);
                match self
                    .hub
                    .subscribe(
                        session.id,
                        session.outbox.clone(),
                        &space,
                        consumer_id.clone(),
                        query,
                        since,
                        of,
                    )
                    .await
                {
                    Ok(id) => {
                        session.streams.insert(id, (space, consumer_id));
                        Ok(())
                    }
                    Err(HubError::SinkClosed) => Err(HubError::SinkClosed),
                    Err(err) => {
                        warn!(%err, "subscribe failed");
                        let payload = ErrorPayload::internal("subscription unavailable");
                        self.answer(session, of, ReturnValue::Error(payload)).await
                    }
                }
            }
            CommandArgs::Get { query, .. } => {
                let since = session
                    .hellos
                    .get(&space)
                    .map_or(CURSOR_NONE, |(_, since)| *since);
                match self
                    .hub
                    .get(&session.outbox, &space, query, since, of)
                    .await
                {
                    Ok(()) => Ok(()),
                    Err(HubError::SinkClosed) => Err(HubError::SinkClosed),
                    Err(err) => {
                        warn!(%err, "get failed");
                        let payload = ErrorPayload::internal("read unavailable");
                        self.answer(session, of, ReturnValue::Error(payload)).await
                    }
                }
            }
            CommandArgs::Tx(tx) => {
                let deadline = Instant::now() + self.config.op_deadline;
                match self.hub.engine().space(&space).transact(tx, deadline).await {
                    Ok(receipt) => {
                        self.log_receipt(&space, &receipt);
                        self.answer(session, of, ReturnValue::Receipt(receipt)).await
                    }
                    Err(err) => {
                        warn!(%space, %err, "transaction unserviceable");
                        let payload = ErrorPayload::internal("space writer unavailable");
                        self.answer(session, of, ReturnValue::Error(payload)).await
                    }
                }
            }
            CommandArgs::Unsubscribe { subscription } => {
                match self.hub.unsubscribe(&space, subscription).await {
                    Ok(()) => {
                        session.streams.remove(&subscription);
                        self.answer(session, of, ReturnValue::Unsubscribed).await
                    }
                    Err(HubError::UnknownSubscription(_)) => {
                        let payload = ErrorPayload::malformed("unknown subscription");
                        self.answer(session, of, ReturnValue::Error(payload)).await
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    async fn answer(
        &self,
        session: &ConnSession,
        of: RequestId,
        value: ReturnValue,
    ) -> Result<(), HubError> {
        session
            .outbox
            .send(ServerFrame::TaskReturn { of, is: value })
            .await
            .map_err(|_| HubError::SinkClosed)
    }

    fn log_receipt(&self, space: &SpaceId, receipt: &Receipt) {
        match receipt {
            Receipt::Ok { epoch, results, .. } => {
                info!(%space, epoch, writes = results.len(), "transaction committed");
            }
            Receipt::Conflict { conflicts, .. } => {
                debug!(%space, reasons = ?conflicts.iter().map(|c| c.reason).collect::<Vec<_>>(), "transaction conflicted");
            }
        }
    }
}

/// Convenience used by the binary and the test harness: a full service
/// stack over one spaces directory.
#[must_use]
pub fn build_service(
    spaces_dir: &std::path::Path,
    auth: Arc<dyn Authorizer>,
    enable_server_merge: bool,
    config: ServiceConfig,
) -> Arc<StorageService> {
    use strand_codec::DagCodec;
    use strand_engine::{EngineConfig, EngineRouter};
    use strand_hub::HubConfig;
    use strand_store::SpaceStore;

    let engine = EngineRouter::new(
        Arc::new(DagCodec),
        SpaceStore::new(spaces_dir),
        EngineConfig {
            default_server_merge: enable_server_merge,
            op_deadline: config.op_deadline,
            ..EngineConfig::default()
        },
    );
    let hub = Hub::new(engine, HubConfig::default());
    Arc::new(StorageService::new(hub, auth, config))
}
