// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Hub behavior end to end: backfill ordering, live fan-out, teardown.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use strand_codec::{DocId, Json};
use strand_hub::{ConnId, Hub, HubConfig};
use strand_proto::{ClientId, Query, RequestId, ReturnValue, ServerFrame, SpaceId};
use strand_testkit::{commit_value, engine_router};

fn hub(dir: &std::path::Path) -> Hub {
    Hub::new(engine_router(dir), HubConfig::default())
}

async fn recv(sink: &mut mpsc::Receiver<ServerFrame>) -> ServerFrame {
    timeout(Duration::from_secs(2), sink.recv())
        .await
        .expect("frame within deadline")
        .expect("sink open")
}

#[tokio::test(flavor = "multi_thread")]
async fn subscribe_backfills_then_streams_in_epoch_order() {
    let dir = tempfile::tempdir().unwrap();
    let hub = hub(dir.path());
    let space_id = SpaceId::from("did:key:s1");
    let space = hub.engine().space(&space_id);
    let doc = DocId::from("doc:x");
    commit_value(&space, &doc, 1, "count", 1.0).await;

    let (sink_tx, mut sink_rx) = mpsc::channel(64);
    let sub = hub
        .subscribe(
            ConnId(1),
            sink_tx,
            &space_id,
            ClientId::from("c2"),
            Query::doc_root("doc:x"),
            -1,
            RequestId(1),
        )
        .await
        .unwrap();

    // Backfill snapshot at epoch 1 with the committed state.
    let ServerFrame::Deliver(backfill) = recv(&mut sink_rx).await else {
        panic!("expected backfill deliver first");
    };
    assert_eq!(backfill.epoch, 1);
    assert_eq!(backfill.stream_id, sub);
    let bytes = backfill.docs[0].body.snapshot_bytes().unwrap().unwrap();
    let loaded = strand_codec::Doc::load(&bytes).unwrap();
    assert_eq!(
        loaded.json().get_path(&["count".to_owned()]),
        Some(&Json::Num(1.0))
    );

    assert!(matches!(
        recv(&mut sink_rx).await,
        ServerFrame::TaskReturn {
            of: RequestId(1),
            is: ReturnValue::Complete { .. }
        }
    ));

    // Live commits stream afterwards, epochs strictly increasing.
    commit_value(&space, &doc, 2, "count", 2.0).await;
    commit_value(&space, &doc, 3, "count", 3.0).await;
    let mut last = 1;
    for _ in 0..2 {
        let ServerFrame::Deliver(frame) = recv(&mut sink_rx).await else {
            panic!("expected live deliver");
        };
        assert!(frame.epoch > last);
        last = frame.epoch;
        assert!(frame.docs[0].body.delta_blobs().unwrap().is_some());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn two_consumers_see_their_own_docs_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let hub = hub(dir.path());
    let space_id = SpaceId::from("did:key:s6");
    let space = hub.engine().space(&space_id);
    let doc_a = DocId::from("doc:s1");
    let doc_b = DocId::from("doc:s2");

    let mut sinks = Vec::new();
    for (i, consumer) in ["c1", "c2"].iter().enumerate() {
        for (j, doc) in ["doc:s1", "doc:s2"].iter().enumerate() {
            let (tx, mut rx) = mpsc::channel(64);
            let of = RequestId((i * 2 + j) as u64);
            hub.subscribe(
                ConnId(i as u64 + 1),
                tx,
                &space_id,
                ClientId::from(*consumer),
                Query::doc_root(*doc),
                -1,
                of,
            )
            .await
            .unwrap();
            // Drain the empty-space backfill (snapshot at epoch 0) and the
            // completion sentinel.
            loop {
                match recv(&mut rx).await {
                    ServerFrame::TaskReturn {
                        is: ReturnValue::Complete { .. },
                        ..
                    } => break,
                    ServerFrame::Deliver(_) | ServerFrame::TaskReturn { .. } => {}
                }
            }
            sinks.push(((*consumer).to_owned(), (*doc).to_owned(), rx));
        }
    }

    let e1 = commit_value(&space, &doc_a, 1, "v", 1.0).await;
    let e2 = commit_value(&space, &doc_b, 2, "v", 2.0).await;
    assert_eq!(e2, e1 + 1);

    for (consumer, doc, rx) in &mut sinks {
        let ServerFrame::Deliver(frame) = recv(rx).await else {
            panic!("{consumer}/{doc}: expected one deliver");
        };
        let expected_epoch = if doc == "doc:s1" { e1 } else { e2 };
        assert_eq!(frame.epoch, expected_epoch, "{consumer}/{doc}");
        assert_eq!(frame.docs.len(), 1);
        assert_eq!(frame.docs[0].doc, DocId::from(doc.as_str()));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn unsubscribe_stops_deliveries_and_get_is_one_shot() {
    let dir = tempfile::tempdir().unwrap();
    let hub = hub(dir.path());
    let space_id = SpaceId::from("did:key:s1");
    let space = hub.engine().space(&space_id);
    let doc = DocId::from("doc:x");
    commit_value(&space, &doc, 1, "v", 1.0).await;

    let (sink_tx, mut sink_rx) = mpsc::channel(64);
    let sub = hub
        .subscribe(
            ConnId(1),
            sink_tx.clone(),
            &space_id,
            ClientId::from("c1"),
            Query::doc_root("doc:x"),
            -1,
            RequestId(1),
        )
        .await
        .unwrap();
    loop {
        if matches!(
            recv(&mut sink_rx).await,
            ServerFrame::TaskReturn {
                is: ReturnValue::Complete { .. },
                ..
            }
        ) {
            break;
        }
    }

    hub.unsubscribe(&space_id, sub).await.unwrap();
    commit_value(&space, &doc, 2, "v", 2.0).await;
    assert!(
        timeout(Duration::from_millis(200), sink_rx.recv())
            .await
            .is_err(),
        "no deliveries after unsubscribe"
    );

    // One-shot get: snapshot + complete, then silence.
    let (get_tx, mut get_rx) = mpsc::channel(64);
    hub.get(
        &get_tx,
        &space_id,
        Query::doc_root("doc:x"),
        -1,
        RequestId(9),
    )
    .await
    .unwrap();
    let ServerFrame::Deliver(frame) = recv(&mut get_rx).await else {
        panic!("expected get snapshot");
    };
    assert_eq!(frame.epoch, 2);
    assert!(matches!(
        recv(&mut get_rx).await,
        ServerFrame::TaskReturn {
            of: RequestId(9),
            is: ReturnValue::Complete { subscription: None }
        }
    ));
    commit_value(&space, &doc, 3, "v", 3.0).await;
    assert!(
        timeout(Duration::from_millis(200), get_rx.recv())
            .await
            .is_err(),
        "get must not stream live deliveries"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn path_scoped_subscriptions_filter_commits() {
    let dir = tempfile::tempdir().unwrap();
    let hub = hub(dir.path());
    let space_id = SpaceId::from("did:key:s1");
    let space = hub.engine().space(&space_id);
    let doc = DocId::from("doc:x");

    let (sink_tx, mut sink_rx) = mpsc::channel(64);
    hub.subscribe(
        ConnId(1),
        sink_tx,
        &space_id,
        ClientId::from("c1"),
        Query {
            doc: doc.clone(),
            path: vec!["watched".to_owned()],
            schema: None,
        },
        -1,
        RequestId(1),
    )
    .await
    .unwrap();
    loop {
        if matches!(
            recv(&mut sink_rx).await,
            ServerFrame::TaskReturn {
                is: ReturnValue::Complete { .. },
                ..
            }
        ) {
            break;
        }
    }

    commit_value(&space, &doc, 1, "elsewhere", 1.0).await;
    assert!(
        timeout(Duration::from_millis(200), sink_rx.recv())
            .await
            .is_err(),
        "unrelated path must not match"
    );

    let epoch = commit_value(&space, &doc, 2, "watched", 1.0).await;
    let ServerFrame::Deliver(frame) = recv(&mut sink_rx).await else {
        panic!("expected watched-path deliver");
    };
    assert_eq!(frame.epoch, epoch);
}
