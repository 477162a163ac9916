// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! End-to-end scenarios over real TCP: client cores against an
//! in-process service, including server restarts from the same spaces
//! directory.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use strand_client::{ClientConfig, CommitOutcome, Connection, StrandClient};
use strand_codec::{DocId, Json};
use strand_proto::wire::{decode_frame, encode_frame, WireError};
use strand_proto::{
    Authorization, ClientFrame, ClientId, Command, CommandArgs, Envelope, Invocation, Query,
    RequestId, ReturnValue, ServerFrame, SpaceId,
};
use strand_server::{build_service, AllowAll, ServiceConfig, StorageService};

struct Server {
    service: Arc<StorageService>,
    addr: SocketAddr,
    accept: JoinHandle<()>,
}

impl Server {
    async fn start(dir: &Path) -> Self {
        let service = build_service(dir, Arc::new(AllowAll), false, ServiceConfig::default());
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.serve(listener).await }
        });
        Self {
            service,
            addr,
            accept,
        }
    }

    async fn stop(self) -> Arc<StorageService> {
        self.accept.abort();
        let service = self.service;
        // Give connection tasks a beat to observe their sockets closing.
        sleep(Duration::from_millis(50)).await;
        service
    }
}

async fn client(addr: SocketAddr, id: &str) -> StrandClient {
    let conn = Connection::tcp(addr).await.unwrap();
    StrandClient::connect(
        conn,
        ClientConfig {
            op_timeout: Duration::from_secs(5),
            ..ClientConfig::new(id)
        },
    )
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn num(view: &strand_client::ViewSnapshot, key: &str) -> Option<f64> {
    match view.json.get_path(&[key.to_owned()]) {
        Some(Json::Num(n)) => Some(*n),
        _ => None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn s1_happy_path_increment_reaches_a_subscriber() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::start(dir.path()).await;
    let space = SpaceId::from("did:key:s1");
    let doc = DocId::from("doc:x");

    let writer = client(server.addr, "c1").await;
    let mut tx = writer.new_transaction(&space);
    tx.write(&doc, &["count".to_owned()], |v| *v = Json::Num(1.0));
    let outcome = tx.commit().await.unwrap();
    assert_eq!(outcome, CommitOutcome::Committed { epoch: 1 });

    let reader = client(server.addr, "c2").await;
    reader
        .subscribe(&space, Query::doc_root("doc:x"))
        .await
        .unwrap();
    reader.synced(&space).await;

    wait_for("backfill to land", || {
        reader
            .read_view(&space, &doc)
            .is_some_and(|view| view.epoch == 1)
    })
    .await;
    let view = reader.read_view(&space, &doc).unwrap();
    assert_eq!(num(&view, "count"), Some(1.0));
}

#[tokio::test(flavor = "multi_thread")]
async fn s2_conflicting_writes_from_the_same_baseline() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::start(dir.path()).await;
    let space = SpaceId::from("did:key:s2");
    let doc = DocId::from("doc:y");

    // Seed v=1 (epoch 1).
    let seeder = client(server.addr, "seed").await;
    let mut tx = seeder.new_transaction(&space);
    tx.write(&doc, &["v".to_owned()], |v| *v = Json::Num(1.0));
    assert_eq!(
        tx.commit().await.unwrap(),
        CommitOutcome::Committed { epoch: 1 }
    );

    // Both clients read the same baseline; B via one-shot get so its
    // baseline cannot advance underneath it.
    let a = client(server.addr, "a").await;
    a.subscribe(&space, Query::doc_root("doc:y")).await.unwrap();
    a.synced(&space).await;
    wait_for("a baseline", || {
        a.read_view(&space, &doc).is_some_and(|v| v.epoch == 1)
    })
    .await;

    let b = client(server.addr, "b").await;
    b.get(&space, Query::doc_root("doc:y")).await.unwrap();
    wait_for("b baseline", || {
        b.read_view(&space, &doc).is_some_and(|v| v.epoch == 1)
    })
    .await;

    // A commits v += 1 first.
    let mut tx_a = a.new_transaction(&space);
    tx_a.write(&doc, &["v".to_owned()], |v| {
        let old = if let Json::Num(n) = v { *n } else { 0.0 };
        *v = Json::Num(old + 1.0);
    });
    assert_eq!(
        tx_a.commit().await.unwrap(),
        CommitOutcome::Committed { epoch: 2 }
    );

    // B commits the same increment from the stale baseline.
    let mut tx_b = b.new_transaction(&space);
    tx_b.write(&doc, &["v".to_owned()], |v| {
        let old = if let Json::Num(n) = v { *n } else { 0.0 };
        *v = Json::Num(old + 1.0);
    });
    let outcome = tx_b.commit().await.unwrap();
    let CommitOutcome::Conflict { conflicts } = outcome else {
        panic!("expected conflict, got {outcome:?}");
    };
    assert_eq!(
        conflicts[0].reason,
        strand_proto::ConflictReason::BaseHeadsMismatch
    );

    // B's overlay rolled back: its view shows 1 (its stale baseline) or,
    // had a delivery slipped in, 2 — never 3.
    let v = num(&b.read_view(&space, &doc).unwrap(), "v").unwrap();
    assert!(v == 1.0 || v == 2.0, "v must never show the phantom 3, got {v}");
}

#[tokio::test(flavor = "multi_thread")]
async fn s3_resume_with_exact_ack_needs_no_backfill() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::start(dir.path()).await;
    let space = SpaceId::from("did:key:s3");
    let doc = DocId::from("doc:x");

    let c = client(server.addr, "c").await;
    let mut tx = c.new_transaction(&space);
    tx.write(&doc, &["count".to_owned()], |v| *v = Json::Num(1.0));
    assert_eq!(
        tx.commit().await.unwrap(),
        CommitOutcome::Committed { epoch: 1 }
    );
    c.subscribe(&space, Query::doc_root("doc:x")).await.unwrap();
    c.synced(&space).await;
    // The delivery at epoch 1 is acked automatically; wait until the
    // durable cursor reflects it.
    let engine_space = server.service.hub().engine().space(&space);
    for _ in 0..200 {
        if let Ok(Some(row)) = engine_space.cursor(ClientId::from("c")).await {
            if row.last_acked_epoch == 1 {
                break;
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    drop(c);
    drop(engine_space);
    let _old = server.stop().await;

    // Restart from the same spaces dir.
    let server = Server::start(dir.path()).await;
    let resumed = client(server.addr, "c").await;
    let current = resumed.hello(&space, 1).await.unwrap();
    assert_eq!(current, 1, "epoch survives the restart");

    // Cursor survived too.
    let row = server
        .service
        .hub()
        .engine()
        .space(&space)
        .cursor(ClientId::from("c"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.last_acked_epoch, 1);

    resumed
        .subscribe(&space, Query::doc_root("doc:x"))
        .await
        .unwrap();
    resumed.synced(&space).await;
    sleep(Duration::from_millis(200)).await;
    assert!(
        resumed.read_view(&space, &doc).is_none(),
        "an exact cursor must produce no backfill deliver"
    );
}

/// Raw framed-CBOR client: subscribes, reads deliveries, never acks.
async fn raw_subscribe_without_ack(addr: SocketAddr, space: &SpaceId, doc: &str) -> u64 {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let envelope = Envelope {
        id: RequestId(1),
        invocation: Invocation {
            iss: "raw".into(),
            cmd: Command::Subscribe,
            sub: space.clone(),
            args: CommandArgs::Subscribe {
                consumer_id: ClientId::from("raw"),
                query: Query::doc_root(doc),
            },
            prf: vec![],
        },
        authorization: Authorization::default(),
    };
    let packet = encode_frame(&ClientFrame::Request(envelope)).unwrap();
    stream.write_all(&packet).await.unwrap();

    let mut buf = Vec::new();
    let mut chunk = vec![0u8; 16 * 1024];
    let mut delivered_epoch = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    'outer: loop {
        let n = timeout(deadline - tokio::time::Instant::now(), stream.read(&mut chunk))
            .await
            .expect("server responds")
            .unwrap();
        assert_ne!(n, 0, "server closed early");
        buf.extend_from_slice(&chunk[..n]);
        loop {
            match decode_frame::<ServerFrame>(&buf) {
                Ok((frame, used)) => {
                    buf.drain(..used);
                    match frame {
                        ServerFrame::Deliver(frame) => delivered_epoch = Some(frame.epoch),
                        ServerFrame::TaskReturn {
                            is: ReturnValue::Complete { .. },
                            ..
                        } => break 'outer,
                        ServerFrame::TaskReturn { .. } => {}
                    }
                }
                Err(WireError::Incomplete { .. }) => break,
                Err(err) => panic!("decode: {err}"),
            }
        }
    }
    delivered_epoch.expect("backfill deliver before complete")
}

#[tokio::test(flavor = "multi_thread")]
async fn s4_resume_without_ack_replays_state() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::start(dir.path()).await;
    let space = SpaceId::from("did:key:s4");
    let doc = DocId::from("doc:x");

    let writer = client(server.addr, "w").await;
    let mut tx = writer.new_transaction(&space);
    tx.write(&doc, &["count".to_owned()], |v| *v = Json::Num(7.0));
    assert_eq!(
        tx.commit().await.unwrap(),
        CommitOutcome::Committed { epoch: 1 }
    );

    // Receive epoch 1 but never ack it.
    let seen = raw_subscribe_without_ack(server.addr, &space, "doc:x").await;
    assert_eq!(seen, 1);
    drop(writer);
    let _old = server.stop().await;

    let server = Server::start(dir.path()).await;
    let resumed = client(server.addr, "raw").await;
    resumed.hello(&space, -1).await.unwrap();
    resumed
        .subscribe(&space, Query::doc_root("doc:x"))
        .await
        .unwrap();
    resumed.synced(&space).await;

    wait_for("replayed backfill", || {
        resumed
            .read_view(&space, &doc)
            .is_some_and(|view| view.epoch >= 1)
    })
    .await;
    let view = resumed.read_view(&space, &doc).unwrap();
    assert_eq!(num(&view, "count"), Some(7.0));
}

#[tokio::test(flavor = "multi_thread")]
async fn s5_read_set_invalidation_rejects_locally() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::start(dir.path()).await;
    let space = SpaceId::from("did:key:s5");
    let doc = DocId::from("doc:rs");

    // Seed and subscribe C1.
    let c2 = client(server.addr, "c2").await;
    let mut seed = c2.new_transaction(&space);
    seed.write(&doc, &["v".to_owned()], |v| *v = Json::Num(0.0));
    assert_eq!(
        seed.commit().await.unwrap(),
        CommitOutcome::Committed { epoch: 1 }
    );

    let c1 = client(server.addr, "c1").await;
    c1.subscribe(&space, Query::doc_root("doc:rs"))
        .await
        .unwrap();
    c1.synced(&space).await;
    wait_for("c1 baseline", || {
        c1.read_view(&space, &doc).is_some_and(|v| v.epoch == 1)
    })
    .await;

    // C1 opens a transaction and reads.
    let mut tx = c1.new_transaction(&space);
    assert_eq!(tx.read(&doc, &["v".to_owned()]), Some(Json::Num(0.0)));

    // C2 commits; the delivery advances C1's baseline.
    let mut bump = c2.new_transaction(&space);
    bump.write(&doc, &["v".to_owned()], |v| *v = Json::Num(5.0));
    assert_eq!(
        bump.commit().await.unwrap(),
        CommitOutcome::Committed { epoch: 2 }
    );
    wait_for("c1 sees epoch 2", || {
        c1.read_view(&space, &doc).is_some_and(|v| v.epoch == 2)
    })
    .await;

    // The commit settles locally as rejected.
    tx.write(&doc, &["v".to_owned()], |v| *v = Json::Num(99.0));
    assert_eq!(tx.commit().await.unwrap(), CommitOutcome::Rejected);
    let view = c1.read_view(&space, &doc).unwrap();
    assert_eq!(num(&view, "v"), Some(5.0), "overlay cleared");
}

#[tokio::test(flavor = "multi_thread")]
async fn s6_multi_consumer_batches_carry_exactly_the_affected_doc() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::start(dir.path()).await;
    let space = SpaceId::from("did:key:s6");
    let doc_a = DocId::from("doc:s1");
    let doc_b = DocId::from("doc:s2");

    let c1 = client(server.addr, "c1").await;
    let c2 = client(server.addr, "c2").await;
    for c in [&c1, &c2] {
        c.subscribe(&space, Query::doc_root("doc:s1")).await.unwrap();
        c.subscribe(&space, Query::doc_root("doc:s2")).await.unwrap();
        c.synced(&space).await;
    }

    let mut tx1 = c1.new_transaction(&space);
    tx1.write(&doc_a, &["v".to_owned()], |v| *v = Json::Num(1.0));
    let CommitOutcome::Committed { epoch: e1 } = tx1.commit().await.unwrap() else {
        panic!("first commit");
    };
    let mut tx2 = c2.new_transaction(&space);
    tx2.write(&doc_b, &["v".to_owned()], |v| *v = Json::Num(2.0));
    let CommitOutcome::Committed { epoch: e2 } = tx2.commit().await.unwrap() else {
        panic!("second commit");
    };
    assert_eq!(e2, e1 + 1);

    for (name, c) in [("c1", &c1), ("c2", &c2)] {
        wait_for("both docs delivered", || {
            c.read_view(&space, &doc_a).is_some_and(|v| v.epoch >= e1)
                && c.read_view(&space, &doc_b).is_some_and(|v| v.epoch >= e2)
        })
        .await;
        let va = c.read_view(&space, &doc_a).unwrap();
        let vb = c.read_view(&space, &doc_b).unwrap();
        assert_eq!(num(&va, "v"), Some(1.0), "{name} doc:s1");
        assert_eq!(num(&vb, "v"), Some(2.0), "{name} doc:s2");
        assert!(vb.epoch > va.epoch, "{name}: batches epoch-ordered per doc");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn unauthorized_and_forbidden_requests_are_rejected() {
    use strand_client::ClientError;
    use strand_server::{Capability, StaticTokens};

    let dir = tempfile::tempdir().unwrap();
    let space = SpaceId::from("did:key:locked");
    let auth = StaticTokens::new().grant("reader-token", &space, Capability::Read);
    let service = {
        let service = build_service(
            dir.path(),
            Arc::new(auth),
            false,
            ServiceConfig::default(),
        );
        service
    };
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.serve(listener).await }
    });

    // No token at all: 401.
    let anonymous = client(addr, "anon").await;
    let err = anonymous.hello(&space, -1).await.unwrap_err();
    let ClientError::Server(payload) = err else {
        panic!("expected server rejection, got {err:?}");
    };
    assert_eq!(payload.code, 401);

    // Read-only token submitting a transaction: 403, transport stays
    // usable for reads afterwards.
    let reader = {
        let conn = Connection::tcp(addr).await.unwrap();
        StrandClient::connect(
            conn,
            ClientConfig {
                access_token: "reader-token".to_owned(),
                op_timeout: Duration::from_secs(5),
                ..ClientConfig::new("reader")
            },
        )
    };
    let doc = DocId::from("doc:x");
    let mut tx = reader.new_transaction(&space);
    tx.write(&doc, &["v".to_owned()], |v| *v = Json::Num(1.0));
    let err = tx.commit().await.unwrap_err();
    let ClientError::Server(payload) = err else {
        panic!("expected forbidden, got {err:?}");
    };
    assert_eq!(payload.code, 403);
    assert_eq!(reader.hello(&space, -1).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_with_mid_range_cursor_materializes_current_state() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::start(dir.path()).await;
    let space = SpaceId::from("did:key:mid");
    let doc = DocId::from("doc:x");

    // Epochs 1 and 2 land; the subscriber acks up to 2.
    let writer = client(server.addr, "w").await;
    for (seq, value) in [(1u64, 1.0), (2, 2.0)] {
        let mut tx = writer.new_transaction(&space);
        tx.write(&doc, &["count".to_owned()], move |v| *v = Json::Num(value));
        assert_eq!(
            tx.commit().await.unwrap(),
            CommitOutcome::Committed { epoch: seq }
        );
    }
    let c = client(server.addr, "mid").await;
    c.subscribe(&space, Query::doc_root("doc:x")).await.unwrap();
    c.synced(&space).await;
    wait_for("subscriber catches up", || {
        c.read_view(&space, &doc).is_some_and(|v| v.epoch == 2)
    })
    .await;
    let engine_space = server.service.hub().engine().space(&space);
    for _ in 0..200 {
        if let Ok(Some(row)) = engine_space.cursor(ClientId::from("mid")).await {
            if row.last_acked_epoch == 2 {
                break;
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    drop(c);
    drop(writer);
    drop(engine_space);
    let _old = server.stop().await;

    // Epoch 3 lands while the subscriber is away; its cursor gap (one
    // epoch) is comfortably inside the delta retention bound.
    let server = Server::start(dir.path()).await;
    let writer = client(server.addr, "w").await;
    writer.get(&space, Query::doc_root("doc:x")).await.unwrap();
    wait_for("writer rematerializes", || {
        writer.read_view(&space, &doc).is_some_and(|v| v.epoch == 2)
    })
    .await;
    let mut tx = writer.new_transaction(&space);
    tx.write(&doc, &["count".to_owned()], |v| *v = Json::Num(3.0));
    assert_eq!(
        tx.commit().await.unwrap(),
        CommitOutcome::Committed { epoch: 3 }
    );

    // The reconnecting client declares its acked cursor. Its fresh core
    // has nothing to apply a delta onto, so the backfill must arrive as
    // a snapshot and still bring it fully current.
    let resumed = client(server.addr, "mid").await;
    assert_eq!(resumed.hello(&space, 2).await.unwrap(), 3);
    resumed
        .subscribe(&space, Query::doc_root("doc:x"))
        .await
        .unwrap();
    resumed.synced(&space).await;

    wait_for("resumed client materializes epoch 3", || {
        resumed
            .read_view(&space, &doc)
            .is_some_and(|view| view.epoch >= 3)
    })
    .await;
    let view = resumed.read_view(&space, &doc).unwrap();
    assert_eq!(num(&view, "count"), Some(3.0));
}
