// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Durable per-space state for the Strand hub.
//!
//! One SQLite database file per space, holding the four persisted facts the
//! hub relies on across restarts:
//!
//! - `epoch_log` — the ordered record of committed transactions
//! - `branch_heads` — (doc, branch) → current head-set
//! - `client_cursors` — durable per-client ACK positions
//! - `snapshots` — optional saved-document rows for accelerated backfill
//!
//! # Atomicity contract
//!
//! [`SpaceHandle::commit`] persists the whole epoch tuple — the new epoch
//! row, every branch head update, and any snapshot row — inside a single
//! SQLite transaction. Either all of it is durable or none of it is; a
//! crash mid-commit leaves the previous epoch as the current one.
//!
//! # Single-writer contract
//!
//! A `SpaceHandle` is `Send` but not `Sync`: exactly one task owns it and
//! performs every mutation (the per-space writer actor in
//! `strand-engine`). Concurrent readers get their own read-only facts via
//! the commit events that writer publishes, never through this handle.

mod record;
mod space;

pub use record::{ChangeAt, EpochRecord, EpochWrite};
pub use space::{space_file_name, CursorRow, SpaceHandle, SpaceStore};

use strand_proto::Epoch;

/// Errors surfaced by the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Filesystem failure while locating or creating the space database.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// A persisted row did not decode; the database is damaged.
    #[error("[STORE_CORRUPT] {0}")]
    Corrupt(String),
    /// A commit tried to skip or repeat an epoch. Fatal for the space
    /// writer: state and log have drifted apart.
    #[error("[STORE_EPOCH_GAP] expected epoch {expected}, got {got}")]
    EpochGap {
        /// The epoch the log requires next.
        expected: Epoch,
        /// The epoch the commit carried.
        got: Epoch,
    },
    /// Compaction would have dropped epochs a durable cursor still needs.
    #[error("[STORE_RETENTION] cannot compact below {requested}: cursor at {min_cursor}")]
    RetentionViolation {
        /// The requested compaction floor.
        requested: Epoch,
        /// The lowest durable cursor across clients.
        min_cursor: i64,
    },
}
