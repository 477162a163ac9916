// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Strand transaction engine.
//!
//! One logical writer per space. The [`writer::SpaceWriter`] owns the
//! space's durable handle and document cache and applies transactions
//! serially; the [`actor`] module wraps a writer in a tokio task with a
//! command mailbox so every mutation happens on that task, and the
//! [`actor::EngineRouter`] lazily spawns and supervises one actor per
//! space.
//!
//! # Ordering guarantees
//!
//! - Within a space, commits form a strict total order: epoch assignment
//!   happens under the single writer, so epochs are gap-free `1..=E`.
//! - Commit events are published in epoch order on a per-space broadcast
//!   channel; fan-out consumes them in that order.
//!
//! # Failure policy
//!
//! A transaction that fails codec validation or persistence aborts whole —
//! a receipt reports `conflict` and no partial state is durable. Fatal
//! store drift (epoch gap, corrupt rows) stops the writer; the router
//! restarts it a bounded number of times and then marks the space
//! degraded, rejecting further commands.

pub mod actor;
pub mod writer;

pub use actor::{EngineRouter, SpaceClient};
pub use writer::{CommitEvent, SpaceWriter};

use std::time::Duration;

use strand_proto::SpaceId;
use strand_store::StoreError;

/// Engine-wide tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Global default for `allow_server_merge` when a write leaves it
    /// unset; wired to `ENABLE_SERVER_MERGE` at the server boundary.
    pub default_server_merge: bool,
    /// Deadline applied to a transaction that carries none of its own.
    pub op_deadline: Duration,
    /// Writer restarts allowed before a space is marked degraded.
    pub max_writer_restarts: u32,
    /// Mailbox depth per space actor.
    pub mailbox_depth: usize,
    /// Commit-event fan-out buffer per space.
    pub commit_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_server_merge: false,
            op_deadline: Duration::from_secs(30),
            max_writer_restarts: 3,
            mailbox_depth: 256,
            commit_buffer: 1024,
        }
    }
}

/// Errors surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Durable state failed underneath the writer.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The space exhausted its writer restarts and no longer accepts
    /// commands.
    #[error("space {0} is degraded")]
    Degraded(SpaceId),
    /// The space actor went away mid-command (shutdown or restart races).
    #[error("space {0} writer unavailable")]
    Unavailable(SpaceId),
}
