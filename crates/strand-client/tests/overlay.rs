// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Client-core behavior against a scripted hub: overlay visibility,
//! promotion, rollback, and local read-set rejection.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::cast_precision_loss)]

use std::time::Duration;

use tokio::sync::mpsc;

use strand_client::{ClientConfig, CommitOutcome, Connection, StrandClient};
use strand_codec::{DocId, Json};
use strand_proto::{
    ClientFrame, Command, ConflictEntry, ConflictReason, DeliverFrame, DocEntry, EntryBody,
    Receipt, ReturnValue, ServerFrame, SpaceId, SubscriptionId, WriteRef,
};

/// A hand-rolled hub endpoint: exposes the frame channels and lets tests
/// script responses.
struct FakeHub {
    to_client: mpsc::Sender<ServerFrame>,
    from_client: mpsc::Receiver<ClientFrame>,
}

fn connect() -> (StrandClient, FakeHub) {
    let (out_tx, out_rx) = mpsc::channel(64);
    let (in_tx, in_rx) = mpsc::channel(64);
    let client = StrandClient::connect(
        Connection {
            outbound: out_tx,
            inbound: in_rx,
        },
        ClientConfig {
            op_timeout: Duration::from_secs(2),
            ..ClientConfig::new("c1")
        },
    );
    (
        client,
        FakeHub {
            to_client: in_tx,
            from_client: out_rx,
        },
    )
}

impl FakeHub {
    /// Waits for the next tx request and answers it with `receipt`.
    async fn answer_tx(&mut self, receipt: Receipt) {
        let mut receipt = Some(receipt);
        loop {
            match self.from_client.recv().await.expect("client alive") {
                ClientFrame::Request(envelope) if envelope.invocation.cmd == Command::Tx => {
                    self.to_client
                        .send(ServerFrame::TaskReturn {
                            of: envelope.id,
                            is: ReturnValue::Receipt(receipt.take().expect("single tx")),
                        })
                        .await
                        .unwrap();
                    return;
                }
                ClientFrame::Request(_) | ClientFrame::Ack { .. } => {}
            }
        }
    }

    /// Pushes a snapshot delivery for `doc` at `epoch`.
    async fn deliver_snapshot(&self, space: &SpaceId, doc: &DocId, epoch: u64, json_key: &str) {
        let mut fresh = strand_codec::Doc::new(doc.clone());
        let blob = strand_codec::Change {
            doc: doc.clone(),
            parents: vec![strand_codec::genesis_head(doc)],
            author: "server".into(),
            seq: epoch,
            ops: vec![strand_codec::PathOp::Set {
                path: vec![json_key.to_owned()],
                value: Json::Num(epoch as f64),
            }],
        }
        .encode()
        .unwrap();
        fresh.apply(&[blob]).unwrap();
        let bytes = fresh.save().unwrap();
        self.to_client
            .send(ServerFrame::Deliver(DeliverFrame {
                space: space.clone(),
                stream_id: SubscriptionId(1),
                epoch,
                docs: vec![DocEntry {
                    doc: doc.clone(),
                    body: EntryBody::snapshot(&bytes),
                    paths: Vec::new(),
                }],
            }))
            .await
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn overlay_is_visible_in_flight_and_promotes_on_ok() {
    let (client, mut hub) = connect();
    let space = SpaceId::from("did:key:s1");
    let doc = DocId::from("doc:x");

    let mut tx = client.new_transaction(&space);
    tx.write(&doc, &["count".to_owned()], |v| *v = Json::Num(1.0));

    let commit = tokio::spawn(async move { tx.commit().await });
    // While the commit is in flight the overlay must be readable.
    let mut saw_overlay = false;
    for _ in 0..50 {
        if let Some(view) = client.read_view(&space, &doc) {
            if view.json.get_path(&["count".to_owned()]) == Some(&Json::Num(1.0)) {
                saw_overlay = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(saw_overlay, "overlay must be visible before the receipt");

    hub.answer_tx(Receipt::Ok {
        tx_id: 1,
        committed_at: 1,
        epoch: 1,
        results: vec![],
    })
    .await;
    let outcome = commit.await.unwrap().unwrap();
    assert_eq!(outcome, CommitOutcome::Committed { epoch: 1 });

    let view = client.read_view(&space, &doc).unwrap();
    assert_eq!(view.epoch, 1);
    assert_eq!(view.json.get_path(&["count".to_owned()]), Some(&Json::Num(1.0)));
}

#[tokio::test(flavor = "multi_thread")]
async fn conflict_rolls_the_overlay_back() {
    let (client, mut hub) = connect();
    let space = SpaceId::from("did:key:s1");
    let doc = DocId::from("doc:y");

    // Seed a baseline so rollback has something to reveal.
    hub.deliver_snapshot(&space, &doc, 1, "v").await;
    let mut seeded = false;
    for _ in 0..50 {
        if client.read_view(&space, &doc).is_some() {
            seeded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(seeded);

    let mut tx = client.new_transaction(&space);
    tx.write(&doc, &["v".to_owned()], |v| *v = Json::Num(99.0));
    let commit = tokio::spawn(async move { tx.commit().await });

    hub.answer_tx(Receipt::Conflict {
        tx_id: 1,
        conflicts: vec![ConflictEntry {
            r#ref: WriteRef {
                index: 0,
                doc: doc.clone(),
                branch: strand_proto::BranchName::main(),
            },
            reason: ConflictReason::BaseHeadsMismatch,
        }],
    })
    .await;
    let outcome = commit.await.unwrap().unwrap();
    assert!(matches!(outcome, CommitOutcome::Conflict { .. }));

    // The mutated value must not be observable after settlement.
    let view = client.read_view(&space, &doc).unwrap();
    assert_eq!(view.json.get_path(&["v".to_owned()]), Some(&Json::Num(1.0)));
}

#[tokio::test(flavor = "multi_thread")]
async fn delivery_between_read_and_commit_rejects_locally() {
    let (client, mut hub) = connect();
    let space = SpaceId::from("did:key:s1");
    let doc = DocId::from("doc:rs");

    hub.deliver_snapshot(&space, &doc, 1, "v").await;
    for _ in 0..50 {
        if client.read_view(&space, &doc).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut tx = client.new_transaction(&space);
    let observed = tx.read(&doc, &["v".to_owned()]);
    assert_eq!(observed, Some(Json::Num(1.0)));

    // A concurrent writer advances the document before we commit.
    hub.deliver_snapshot(&space, &doc, 2, "v").await;
    for _ in 0..50 {
        if client
            .read_view(&space, &doc)
            .is_some_and(|view| view.epoch == 2)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    tx.write(&doc, &["v".to_owned()], |v| *v = Json::Num(42.0));
    let outcome = tx.commit().await.unwrap();
    assert_eq!(outcome, CommitOutcome::Rejected);

    // No tx request ever reached the hub: only the two delivery acks.
    let first = hub.from_client.recv().await.unwrap();
    assert!(matches!(first, ClientFrame::Ack { epoch: 1, .. }));
    let second = hub.from_client.recv().await.unwrap();
    assert!(matches!(second, ClientFrame::Ack { epoch: 2, .. }));
    assert!(
        tokio::time::timeout(Duration::from_millis(200), hub.from_client.recv())
            .await
            .is_err(),
        "rejected commit must not round-trip"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn deliveries_are_acked_automatically() {
    let (client, mut hub) = connect();
    let space = SpaceId::from("did:key:s1");
    let doc = DocId::from("doc:x");
    hub.deliver_snapshot(&space, &doc, 3, "v").await;

    let frame = hub.from_client.recv().await.unwrap();
    let ClientFrame::Ack { stream_id, epoch } = frame else {
        panic!("expected ack, got {frame:?}");
    };
    assert_eq!(stream_id, SubscriptionId(1));
    assert_eq!(epoch, 3);
    let _ = client;
}

#[tokio::test(flavor = "multi_thread")]
async fn unappliable_delta_acks_and_requests_a_snapshot() {
    let (client, mut hub) = connect();
    let space = SpaceId::from("did:key:s1");
    let doc = DocId::from("doc:x");

    // A delta arrives for a document this client has never materialized.
    // It must not wedge the stream: the batch is acked and a one-shot get
    // goes out to repair the baseline.
    hub.to_client
        .send(ServerFrame::Deliver(DeliverFrame {
            space: space.clone(),
            stream_id: SubscriptionId(1),
            epoch: 4,
            docs: vec![DocEntry {
                doc: doc.clone(),
                body: EntryBody::delta(&[b"opaque-change".to_vec()]),
                paths: Vec::new(),
            }],
        }))
        .await
        .unwrap();

    let mut acked = false;
    let mut get_request = None;
    for _ in 0..2 {
        match hub.from_client.recv().await.expect("client alive") {
            ClientFrame::Ack { epoch, .. } => {
                assert_eq!(epoch, 4, "the unappliable batch is still acked");
                acked = true;
            }
            ClientFrame::Request(envelope) => {
                assert_eq!(envelope.invocation.cmd, Command::Get);
                get_request = Some(envelope);
            }
        }
    }
    assert!(acked);
    let envelope = get_request.expect("a snapshot request must follow");

    // The view stayed empty in the meantime.
    assert!(client.read_view(&space, &doc).is_none());

    // Serve the get: snapshot deliver, then its completion.
    hub.deliver_snapshot(&space, &doc, 4, "v").await;
    hub.to_client
        .send(ServerFrame::TaskReturn {
            of: envelope.id,
            is: ReturnValue::Complete { subscription: None },
        })
        .await
        .unwrap();

    let mut repaired = false;
    for _ in 0..50 {
        if client
            .read_view(&space, &doc)
            .is_some_and(|view| view.epoch == 4)
        {
            repaired = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(repaired, "snapshot must repair the baseline");
    let view = client.read_view(&space, &doc).unwrap();
    assert_eq!(view.json.get_path(&["v".to_owned()]), Some(&Json::Num(4.0)));
}
