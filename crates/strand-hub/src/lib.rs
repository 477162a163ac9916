// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Strand fan-out hub: commit events in, ordered per-subscriber batches out.
//!
//! Three cooperating parts:
//!
//! - [`registry`] — the catalog of live subscriptions per space, with
//!   idempotent equivalent-subscribe semantics
//! - [`fanout`] — one pump task per space that matches commit events to
//!   subscriptions, plus one delivery task per subscription that owns its
//!   FIFO, unacked window, pause/resume, and coalescing
//! - [`resume`] — the backfill planner: no-backfill vs delta vs snapshot,
//!   driven by the client's declared `since_epoch` and the epoch log's
//!   retention
//!
//! # Ordering
//!
//! Within a subscription, batches reach the sink in strictly increasing
//! epoch order: backfill first, then the `complete` sentinel, then live
//! batches above the backfill floor. Across subscriptions nothing is
//! promised.

pub mod fanout;
pub mod registry;
pub mod resume;

mod subtask;

pub use fanout::Hub;
pub use registry::{ConnId, SubEntry, SubscriptionRegistry};
pub use resume::BackfillPlan;
pub use subtask::SubMsg;

use strand_engine::EngineError;
use strand_proto::SubscriptionId;

/// Fan-out tunables. Defaults follow the shipped deployment profile.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Unacknowledged batches allowed in flight per subscription.
    pub unacked_window: usize,
    /// Pending-queue depth beyond which a subscription coalesces to a
    /// single snapshot batch at the latest epoch.
    pub coalesce_depth: usize,
    /// Byte budget above which a delta body is replaced by a snapshot.
    pub delta_budget_bytes: usize,
    /// Epoch-gap bound for delta backfill on resume.
    pub resume_delta_epochs: u64,
    /// Control-queue depth per subscription task.
    pub sub_queue_depth: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            unacked_window: 8,
            coalesce_depth: 64,
            delta_budget_bytes: 256 * 1024,
            resume_delta_epochs: 256,
            sub_queue_depth: 256,
        }
    }
}

/// Errors surfaced at the hub boundary.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The engine could not serve a backfill or cursor operation.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// An ack or unsubscribe referenced a subscription the hub does not
    /// hold.
    #[error("unknown subscription {0}")]
    UnknownSubscription(SubscriptionId),
    /// The consumer's transport went away while the hub was addressing it.
    #[error("subscriber transport dropped")]
    SinkClosed,
}
