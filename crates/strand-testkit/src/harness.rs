// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Engine harness helpers: commit values through a real space writer.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use strand_codec::{DagCodec, DocId, Head, Json};
use strand_engine::{EngineConfig, EngineRouter, SpaceClient};
use strand_proto::{BranchName, Epoch, Receipt, TxRequest, WriteRecord};
use strand_store::SpaceStore;

use crate::changes::ChangeBuilder;

/// A default-config engine router over `dir`.
#[must_use]
pub fn engine_router(dir: &Path) -> EngineRouter {
    EngineRouter::new(
        Arc::new(DagCodec),
        SpaceStore::new(dir),
        EngineConfig::default(),
    )
}

/// A single-write transaction against the main branch.
#[must_use]
pub fn write_tx(tx_id: u64, doc: &DocId, base: BTreeSet<Head>, blobs: Vec<Vec<u8>>) -> TxRequest {
    TxRequest {
        tx_id,
        reads: vec![],
        writes: vec![WriteRecord {
            doc: doc.clone(),
            branch: BranchName::main(),
            base_heads: base,
            changes: blobs,
            allow_server_merge: false,
        }],
    }
}

/// Current main-branch heads of `doc` as recorded by the epoch log, empty
/// when the doc was never written.
pub async fn latest_heads(space: &SpaceClient, doc: &DocId) -> BTreeSet<Head> {
    space
        .epochs_since(0)
        .await
        .expect("epoch log readable")
        .iter()
        .rev()
        .find_map(|record| {
            record
                .writes
                .iter()
                .rev()
                .find(|w| &w.doc == doc && w.branch == BranchName::main())
                .map(|w| w.new_heads.clone())
        })
        .unwrap_or_default()
}

/// Commits `key = value` on `doc` through the writer, chaining from the
/// current heads. Returns the assigned epoch.
pub async fn commit_value(
    space: &SpaceClient,
    doc: &DocId,
    seq: u64,
    key: &str,
    value: f64,
) -> Epoch {
    let heads = latest_heads(space, doc).await;
    let blob = ChangeBuilder::from_heads(doc, &heads)
        .seq(seq)
        .set(&[key], Json::Num(value))
        .build();
    let receipt = space
        .transact(
            write_tx(seq, doc, heads, vec![blob]),
            Instant::now() + Duration::from_secs(5),
        )
        .await
        .expect("writer reachable");
    match receipt {
        Receipt::Ok { epoch, .. } => epoch,
        Receipt::Conflict { conflicts, .. } => panic!("commit conflicted: {conflicts:?}"),
    }
}
