// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Space database: open/create, commit, read-back, cursors, compaction.

use std::collections::BTreeSet;
use std::path::{Path as FsPath, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use strand_codec::{genesis_head, DocId, Head};
use strand_proto::{BranchName, ClientId, Epoch, EpochCursor, SpaceId};

use crate::record::{ChangeAt, EpochRecord, EpochWrite};
use crate::StoreError;

/// Factory for per-space handles, rooted at a spaces directory.
#[derive(Debug, Clone)]
pub struct SpaceStore {
    root: PathBuf,
}

impl SpaceStore {
    /// Creates a store rooted at `root`. The directory is created lazily on
    /// first open.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The spaces directory.
    #[must_use]
    pub fn root(&self) -> &FsPath {
        &self.root
    }

    /// True when the space already has a database file.
    #[must_use]
    pub fn exists(&self, space: &SpaceId) -> bool {
        self.root.join(space_file_name(space)).exists()
    }

    /// Opens (or lazily creates) the database for `space`.
    ///
    /// # Errors
    /// I/O errors creating the spaces directory, SQLite errors opening or
    /// migrating the database.
    pub fn open(&self, space: &SpaceId) -> Result<SpaceHandle, StoreError> {
        std::fs::create_dir_all(&self.root)?;
        let path = self.root.join(space_file_name(space));
        let fresh = !path.exists();
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        let current: Epoch = conn.query_row(
            "SELECT COALESCE(MAX(epoch), 0) FROM epoch_log",
            [],
            |row| row.get(0),
        )?;
        if fresh {
            info!(space = %space, path = %path.display(), "created space database");
        } else {
            debug!(space = %space, epoch = current, "opened space database");
        }
        Ok(SpaceHandle {
            space: space.clone(),
            conn,
            current,
        })
    }
}

/// Maps a space identifier to a filesystem-safe database file name.
///
/// Identifiers like `did:key:z6Mk...` carry characters filesystems dislike;
/// the readable prefix keeps listings greppable and the blake3 suffix keeps
/// distinct spaces from colliding after sanitization.
#[must_use]
pub fn space_file_name(space: &SpaceId) -> String {
    let mut prefix: String = space
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    prefix.truncate(48);
    let digest = blake3::hash(space.as_str().as_bytes());
    let tag = hex::encode(&digest.as_bytes()[..6]);
    format!("{prefix}-{tag}.db")
}

/// Durable cursor row for one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorRow {
    /// Client the cursor belongs to.
    pub client: ClientId,
    /// Last epoch the client acknowledged; `-1` before the first ACK.
    pub last_acked_epoch: EpochCursor,
    /// When the client was first seen, milliseconds since the Unix epoch.
    pub first_seen_at: u64,
    /// When the client was last seen, milliseconds since the Unix epoch.
    pub last_seen_at: u64,
}

/// Open handle to one space's database. Owned by that space's writer task.
#[derive(Debug)]
pub struct SpaceHandle {
    space: SpaceId,
    conn: Connection,
    current: Epoch,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS epoch_log (
    epoch        INTEGER PRIMARY KEY,
    committed_at INTEGER NOT NULL,
    writes       TEXT    NOT NULL,
    changes      BLOB    NOT NULL
);
CREATE TABLE IF NOT EXISTS branch_heads (
    doc_id TEXT NOT NULL,
    branch TEXT NOT NULL,
    heads  TEXT NOT NULL,
    PRIMARY KEY (doc_id, branch)
);
CREATE TABLE IF NOT EXISTS client_cursors (
    client_id        TEXT PRIMARY KEY,
    last_acked_epoch INTEGER NOT NULL,
    first_seen_at    INTEGER NOT NULL,
    last_seen_at     INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS snapshots (
    doc_id TEXT    NOT NULL,
    epoch  INTEGER NOT NULL,
    bytes  BLOB    NOT NULL,
    PRIMARY KEY (doc_id, epoch)
);
";

impl SpaceHandle {
    /// The space this handle serves.
    #[must_use]
    pub fn space(&self) -> &SpaceId {
        &self.space
    }

    /// Highest committed epoch; `0` when nothing has committed.
    #[must_use]
    pub fn current_epoch(&self) -> Epoch {
        self.current
    }

    /// True when the branch has ever been written.
    ///
    /// # Errors
    /// SQLite failures.
    pub fn branch_exists(&self, doc: &DocId, branch: &BranchName) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM branch_heads WHERE doc_id = ?1 AND branch = ?2",
                params![doc.as_str(), branch.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Current head-set of a branch. A never-written branch reports the
    /// genesis head of its document.
    ///
    /// # Errors
    /// SQLite failures; [`StoreError::Corrupt`] when the heads column does
    /// not decode.
    pub fn branch_heads(
        &self,
        doc: &DocId,
        branch: &BranchName,
    ) -> Result<BTreeSet<Head>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT heads FROM branch_heads WHERE doc_id = ?1 AND branch = ?2",
                params![doc.as_str(), branch.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => serde_json::from_str(&json).map_err(|err| {
                StoreError::Corrupt(format!(
                    "heads for {doc}/{branch} in {space}: {err}",
                    space = self.space
                ))
            }),
            None => {
                let mut set = BTreeSet::new();
                set.insert(genesis_head(doc));
                Ok(set)
            }
        }
    }

    /// Persists one committed epoch atomically: the log row, every branch
    /// head update, and optional snapshot rows.
    ///
    /// # Errors
    /// [`StoreError::EpochGap`] when `record.epoch` is not exactly the next
    /// epoch (fatal for the caller's writer loop); SQLite failures, after
    /// which nothing of the commit is durable.
    pub fn commit(
        &mut self,
        record: &EpochRecord,
        snapshots: &[(DocId, Vec<u8>)],
    ) -> Result<(), StoreError> {
        if record.epoch != self.current + 1 {
            return Err(StoreError::EpochGap {
                expected: self.current + 1,
                got: record.epoch,
            });
        }
        let writes_json = serde_json::to_string(&record.writes)
            .map_err(|err| StoreError::Corrupt(format!("encode writes: {err}")))?;
        let mut changes_blob = Vec::new();
        ciborium::into_writer(&record.changes, &mut changes_blob)
            .map_err(|err| StoreError::Corrupt(format!("encode changes: {err}")))?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO epoch_log (epoch, committed_at, writes, changes)
             VALUES (?1, ?2, ?3, ?4)",
            params![record.epoch, record.committed_at, writes_json, changes_blob],
        )?;
        for write in &record.writes {
            let heads_json = serde_json::to_string(&write.new_heads)
                .map_err(|err| StoreError::Corrupt(format!("encode heads: {err}")))?;
            tx.execute(
                "INSERT INTO branch_heads (doc_id, branch, heads) VALUES (?1, ?2, ?3)
                 ON CONFLICT (doc_id, branch) DO UPDATE SET heads = excluded.heads",
                params![write.doc.as_str(), write.branch.as_str(), heads_json],
            )?;
        }
        for (doc, bytes) in snapshots {
            tx.execute(
                "INSERT OR REPLACE INTO snapshots (doc_id, epoch, bytes) VALUES (?1, ?2, ?3)",
                params![doc.as_str(), record.epoch, bytes],
            )?;
        }
        tx.commit()?;
        self.current = record.epoch;
        debug!(space = %self.space, epoch = record.epoch, writes = record.writes.len(), "committed epoch");
        Ok(())
    }

    /// Reads one epoch record back, or `None` when it was never committed
    /// or has been compacted away.
    ///
    /// # Errors
    /// SQLite failures; [`StoreError::Corrupt`] when persisted columns do
    /// not decode.
    pub fn read_epoch(&self, epoch: Epoch) -> Result<Option<EpochRecord>, StoreError> {
        let row: Option<(u64, String, Vec<u8>)> = self
            .conn
            .query_row(
                "SELECT committed_at, writes, changes FROM epoch_log WHERE epoch = ?1",
                params![epoch],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        row.map(|(committed_at, writes_json, changes_blob)| {
            self.decode_record(epoch, committed_at, &writes_json, &changes_blob)
        })
        .transpose()
    }

    /// Reads every epoch record with `epoch > since`, in epoch order.
    ///
    /// # Errors
    /// Same taxonomy as [`SpaceHandle::read_epoch`].
    pub fn epochs_since(&self, since: Epoch) -> Result<Vec<EpochRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT epoch, committed_at, writes, changes FROM epoch_log
             WHERE epoch > ?1 ORDER BY epoch ASC",
        )?;
        let rows = stmt.query_map(params![since], |row| {
            Ok((
                row.get::<_, Epoch>(0)?,
                row.get::<_, u64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (epoch, committed_at, writes_json, changes_blob) = row?;
            records.push(self.decode_record(epoch, committed_at, &writes_json, &changes_blob)?);
        }
        Ok(records)
    }

    /// The oldest epoch still present in the log, or `None` when the log is
    /// empty. Delta backfill is only possible from epochs at or above this.
    ///
    /// # Errors
    /// SQLite failures.
    pub fn oldest_epoch(&self) -> Result<Option<Epoch>, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT MIN(epoch) FROM epoch_log", [], |row| {
                row.get::<_, Option<Epoch>>(0)
            })?)
    }

    fn decode_record(
        &self,
        epoch: Epoch,
        committed_at: u64,
        writes_json: &str,
        changes_blob: &[u8],
    ) -> Result<EpochRecord, StoreError> {
        let writes: Vec<EpochWrite> = serde_json::from_str(writes_json).map_err(|err| {
            StoreError::Corrupt(format!(
                "writes for epoch {epoch} in {space}: {err}",
                space = self.space
            ))
        })?;
        let changes: Vec<ChangeAt> = ciborium::from_reader(changes_blob).map_err(|err| {
            StoreError::Corrupt(format!(
                "changes for epoch {epoch} in {space}: {err}",
                space = self.space
            ))
        })?;
        Ok(EpochRecord {
            epoch,
            committed_at,
            writes,
            changes,
        })
    }

    /// Looks up a client cursor.
    ///
    /// # Errors
    /// SQLite failures.
    pub fn cursor(&self, client: &ClientId) -> Result<Option<CursorRow>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT last_acked_epoch, first_seen_at, last_seen_at
                 FROM client_cursors WHERE client_id = ?1",
                params![client.as_str()],
                |row| {
                    Ok(CursorRow {
                        client: client.clone(),
                        last_acked_epoch: row.get(0)?,
                        first_seen_at: row.get(1)?,
                        last_seen_at: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    /// Creates the cursor on first hello, or refreshes `last_seen_at` when
    /// it already exists. Never lowers an existing ACK position.
    ///
    /// # Errors
    /// SQLite failures.
    pub fn ensure_cursor(
        &mut self,
        client: &ClientId,
        initial: EpochCursor,
        now_ms: u64,
    ) -> Result<CursorRow, StoreError> {
        self.conn.execute(
            "INSERT INTO client_cursors (client_id, last_acked_epoch, first_seen_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT (client_id) DO UPDATE SET last_seen_at = excluded.last_seen_at",
            params![client.as_str(), initial.max(-1), now_ms],
        )?;
        self.cursor(client)?.ok_or_else(|| {
            StoreError::Corrupt(format!("cursor for {client} vanished after upsert"))
        })
    }

    /// Advances a client's durable ACK position. Lower epochs are ignored
    /// so redelivered ACKs cannot move the cursor backwards.
    ///
    /// # Errors
    /// SQLite failures.
    pub fn set_cursor(
        &mut self,
        client: &ClientId,
        epoch: Epoch,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        #[allow(clippy::cast_possible_wrap)]
        let acked = epoch as i64;
        self.conn.execute(
            "INSERT INTO client_cursors (client_id, last_acked_epoch, first_seen_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT (client_id) DO UPDATE SET
                 last_acked_epoch = MAX(last_acked_epoch, excluded.last_acked_epoch),
                 last_seen_at = excluded.last_seen_at",
            params![client.as_str(), acked, now_ms],
        )?;
        Ok(())
    }

    /// Latest snapshot row for `doc` at or below `at_or_below`.
    ///
    /// # Errors
    /// SQLite failures.
    pub fn latest_snapshot(
        &self,
        doc: &DocId,
        at_or_below: Epoch,
    ) -> Result<Option<(Epoch, Vec<u8>)>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT epoch, bytes FROM snapshots
                 WHERE doc_id = ?1 AND epoch <= ?2
                 ORDER BY epoch DESC LIMIT 1",
                params![doc.as_str(), at_or_below],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }

    /// Drops epoch-log rows below `floor`, refusing to outrun durable
    /// cursors: every epoch a resuming client could still need (anything
    /// above the minimum ACK position) is retained. Snapshot rows below the
    /// floor are dropped except each document's newest.
    ///
    /// # Errors
    /// [`StoreError::RetentionViolation`] when `floor` exceeds what cursors
    /// allow; SQLite failures.
    pub fn compact_below(&mut self, floor: Epoch) -> Result<u64, StoreError> {
        let min_cursor: Option<i64> = self.conn.query_row(
            "SELECT MIN(last_acked_epoch) FROM client_cursors",
            [],
            |row| row.get(0),
        )?;
        #[allow(clippy::cast_possible_wrap)]
        let allowed = min_cursor.unwrap_or(self.current as i64) + 1;
        #[allow(clippy::cast_possible_wrap)]
        if (floor as i64) > allowed {
            return Err(StoreError::RetentionViolation {
                requested: floor,
                min_cursor: allowed - 1,
            });
        }
        let tx = self.conn.transaction()?;
        let dropped = tx.execute("DELETE FROM epoch_log WHERE epoch < ?1", params![floor])?;
        tx.execute(
            "DELETE FROM snapshots WHERE epoch < ?1 AND epoch NOT IN (
                 SELECT MAX(epoch) FROM snapshots GROUP BY doc_id
             )",
            params![floor],
        )?;
        tx.commit()?;
        info!(space = %self.space, floor, dropped, "compacted epoch log");
        Ok(dropped as u64)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn file_names_are_sanitized_and_distinct() {
        let a = space_file_name(&SpaceId::from("did:key:s1"));
        let b = space_file_name(&SpaceId::from("did/key/s1"));
        assert!(a.starts_with("did_key_s1-"));
        assert!(a.ends_with(".db"));
        assert_ne!(a, b);
    }
}
