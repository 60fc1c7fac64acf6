use std::path::Path;

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, warn};

use blocksync_core::{
    block::Scope,
    ids::*,
    mutation::{payload_checksum, MutationKind, MutationPayload, PendingMutation},
};

use crate::error::StorageError;
use crate::traits::{MutationLog, QuarantinedEntry};

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

const SELECT_COLUMNS: &str = "SELECT seq, mutation_id, kind, target_id, workspace_id, parent_id, payload, checksum, enqueued_at, retry_count FROM pending_mutations";

type RawRow = (
    Vec<u8>,
    String,
    Vec<u8>,
    Option<Vec<u8>>,
    Option<Vec<u8>>,
    Vec<u8>,
    Vec<u8>,
    i64,
    i64,
);

fn raw_row(row: &rusqlite::Row) -> rusqlite::Result<(i64, RawRow)> {
    Ok((
        row.get(0)?,
        (
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
            row.get(8)?,
            row.get(9)?,
        ),
    ))
}

/// Decode a row, moving it to the quarantine table if it does not decode.
/// Only SQLite failures are returned as errors.
fn decode_or_quarantine(conn: &Connection, seq: i64, raw: RawRow) -> Result<Option<PendingMutation>, StorageError> {
    match decode_row(raw) {
        Ok(mutation) => Ok(Some(mutation)),
        Err(StorageError::Sqlite(err)) => Err(err.into()),
        Err(err) => {
            let reason = err.to_string();
            conn.execute(
                "INSERT OR REPLACE INTO quarantined_mutations (seq, mutation_id, kind, target_id, payload, reason, quarantined_at)
                 SELECT seq, mutation_id, kind, target_id, payload, ?2, unixepoch() FROM pending_mutations WHERE seq = ?1",
                rusqlite::params![seq, reason],
            )?;
            conn.execute("DELETE FROM pending_mutations WHERE seq = ?1", rusqlite::params![seq])?;
            warn!(seq, %reason, "corrupt log entry quarantined");
            Ok(None)
        }
    }
}

fn decode_row(raw: RawRow) -> Result<PendingMutation, StorageError> {
    let (mid, kind, target, workspace, parent, payload_bytes, checksum, enqueued_at, retry_count) = raw;
    let mutation_id = MutationId::from_bytes(to_array::<16>(mid, "mutation_id")?);
    let corrupt = |reason: String| StorageError::Corrupt {
        mutation_id: mutation_id.to_string(),
        reason,
    };

    let checksum = to_array::<32>(checksum, "checksum")?;
    if payload_checksum(&payload_bytes) != checksum {
        return Err(corrupt("checksum mismatch".into()));
    }
    let payload = MutationPayload::from_msgpack(&payload_bytes)?;
    let kind = MutationKind::parse(&kind)?;
    if payload.kind() != kind {
        return Err(corrupt(format!(
            "kind column {} disagrees with payload {}",
            kind.as_str(),
            payload.kind().as_str()
        )));
    }

    let target_id = BlockId::from_bytes(to_array::<16>(target, "target_id")?);
    let scope = match workspace {
        Some(ws) => {
            let workspace_id = WorkspaceId::from_bytes(to_array::<16>(ws, "workspace_id")?);
            let parent_id = parent
                .map(|p| to_array::<16>(p, "parent_id").map(BlockId::from_bytes))
                .transpose()?;
            Some(Scope::new(workspace_id, parent_id))
        }
        None => None,
    };

    Ok(PendingMutation {
        mutation_id,
        target_id,
        scope,
        payload,
        enqueued_at,
        retry_count: u32::try_from(retry_count).map_err(|_| corrupt("negative retry_count".into()))?,
    })
}

/// [`MutationLog`] backed by a single SQLite file.
pub struct SqliteMutationLog {
    conn: Connection,
}

impl SqliteMutationLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

impl MutationLog for SqliteMutationLog {
    fn put(&mut self, mutation: &PendingMutation) -> Result<(), StorageError> {
        let payload_bytes = mutation.payload.to_msgpack()?;
        let checksum = payload_checksum(&payload_bytes);
        let workspace = mutation.scope.map(|s| s.workspace_id.as_bytes().to_vec());
        let parent = mutation
            .scope
            .and_then(|s| s.parent_id)
            .map(|p| p.as_bytes().to_vec());

        self.conn.execute(
            "INSERT INTO pending_mutations (mutation_id, kind, target_id, workspace_id, parent_id, payload, checksum, enqueued_at, retry_count) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(mutation_id) DO UPDATE SET kind = excluded.kind, target_id = excluded.target_id, workspace_id = excluded.workspace_id, parent_id = excluded.parent_id, payload = excluded.payload, checksum = excluded.checksum, retry_count = excluded.retry_count",
            rusqlite::params![
                mutation.mutation_id.as_bytes().as_slice(),
                mutation.kind().as_str(),
                mutation.target_id.as_bytes().as_slice(),
                workspace,
                parent,
                payload_bytes,
                &checksum[..],
                mutation.enqueued_at,
                mutation.retry_count as i64,
            ],
        )?;
        debug!(mutation_id = %mutation.mutation_id, kind = mutation.kind().as_str(), "log entry persisted");
        Ok(())
    }

    fn get_all(&self) -> Result<Vec<PendingMutation>, StorageError> {
        let rows = {
            let mut stmt = self.conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY seq"))?;
            stmt.query_map([], raw_row)?
                .collect::<Result<Vec<_>, _>>()?
        };
        let mut all = Vec::with_capacity(rows.len());
        for (seq, raw) in rows {
            if let Some(mutation) = decode_or_quarantine(&self.conn, seq, raw)? {
                all.push(mutation);
            }
        }
        Ok(all)
    }

    fn get(&self, mutation_id: MutationId) -> Result<Option<PendingMutation>, StorageError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_COLUMNS} WHERE mutation_id = ?1"))?;
        let raw = stmt
            .query_row(rusqlite::params![mutation_id.as_bytes().as_slice()], raw_row)
            .optional()?;
        match raw {
            Some((seq, raw)) => decode_or_quarantine(&self.conn, seq, raw),
            None => Ok(None),
        }
    }

    fn delete(&mut self, mutation_id: MutationId) -> Result<bool, StorageError> {
        let removed = self.conn.execute(
            "DELETE FROM pending_mutations WHERE mutation_id = ?1",
            rusqlite::params![mutation_id.as_bytes().as_slice()],
        )?;
        Ok(removed > 0)
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.conn.execute("DELETE FROM pending_mutations", [])?;
        Ok(())
    }

    fn quarantined(&self) -> Result<Vec<QuarantinedEntry>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT seq, mutation_id, target_id, reason FROM quarantined_mutations ORDER BY seq")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?,
                    row.get::<_, Option<Vec<u8>>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(seq, mid, target, reason)| QuarantinedEntry {
                seq,
                mutation_id: mid
                    .and_then(|v| to_array::<16>(v, "mutation_id").ok())
                    .map(MutationId::from_bytes),
                target_id: target
                    .and_then(|v| to_array::<16>(v, "target_id").ok())
                    .map(BlockId::from_bytes),
                reason,
            })
            .collect())
    }

    fn len(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM pending_mutations", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn retarget(&mut self, old: BlockId, new: BlockId) -> Result<usize, StorageError> {
        let tx = self.conn.transaction()?;
        let rows = {
            let mut stmt = tx.prepare(&format!("{SELECT_COLUMNS} ORDER BY seq"))?;
            stmt.query_map([], raw_row)?
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut touched = 0;
        for (seq, raw) in rows {
            let Some(mut mutation) = decode_or_quarantine(&tx, seq, raw)? else {
                continue;
            };
            if !mutation.retarget(old, new) {
                continue;
            }
            let payload_bytes = mutation.payload.to_msgpack()?;
            let checksum = payload_checksum(&payload_bytes);
            tx.execute(
                "UPDATE pending_mutations SET target_id = ?1, workspace_id = ?2, parent_id = ?3, payload = ?4, checksum = ?5 WHERE mutation_id = ?6",
                rusqlite::params![
                    mutation.target_id.as_bytes().as_slice(),
                    mutation.scope.map(|s| s.workspace_id.as_bytes().to_vec()),
                    mutation.scope.and_then(|s| s.parent_id).map(|p| p.as_bytes().to_vec()),
                    payload_bytes,
                    &checksum[..],
                    mutation.mutation_id.as_bytes().as_slice(),
                ],
            )?;
            touched += 1;
        }
        tx.commit()?;
        Ok(touched)
    }
}
