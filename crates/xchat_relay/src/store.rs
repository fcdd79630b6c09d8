/*
 * SPDX-FileCopyrightText: 2026 XChat Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

use xchat_protocol::{CallLogEntry, CallLogKind, CallRecord, CallStatus};

/// Durable side of the coordinator: call records and per-user call logs.
/// Signals are never persisted, they are ephemeral transport.
#[derive(Clone)]
pub struct CallStore {
    db_path: PathBuf,
}

impl CallStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        init_db(&db_path)?;
        Ok(Self { db_path })
    }

    pub async fn put_call(&self, record: &CallRecord) -> Result<()> {
        let db_path = self.db_path.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = Connection::open(db_path)?;
            conn.execute(
                r#"
                INSERT OR REPLACE INTO calls (call_id, caller_id, receiver_id, is_video, status, created_at_ms)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    record.call_id,
                    record.caller_id,
                    record.receiver_id,
                    record.is_video as i64,
                    status_str(record.status),
                    record.timestamp_ms,
                ],
            )?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    pub async fn set_status(
        &self,
        call_id: &str,
        status: CallStatus,
        accepted_at_ms: Option<i64>,
        ended_at_ms: Option<i64>,
    ) -> Result<()> {
        let db_path = self.db_path.clone();
        let call_id = call_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = Connection::open(db_path)?;
            conn.execute(
                r#"
                UPDATE calls
                SET status = ?2,
                    accepted_at_ms = COALESCE(?3, accepted_at_ms),
                    ended_at_ms = COALESCE(?4, ended_at_ms)
                WHERE call_id = ?1
                "#,
                params![call_id, status_str(status), accepted_at_ms, ended_at_ms],
            )?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    pub async fn call(&self, call_id: &str) -> Result<Option<CallRecord>> {
        let db_path = self.db_path.clone();
        let call_id = call_id.to_string();
        let out = tokio::task::spawn_blocking(move || -> Result<Option<CallRecord>> {
            let conn = Connection::open(db_path)?;
            let row = conn
                .query_row(
                    r#"
                    SELECT call_id, caller_id, receiver_id, is_video, status, created_at_ms
                    FROM calls WHERE call_id = ?1
                    "#,
                    params![call_id],
                    |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, String>(2)?,
                            r.get::<_, i64>(3)?,
                            r.get::<_, String>(4)?,
                            r.get::<_, i64>(5)?,
                        ))
                    },
                )
                .optional()?;
            let Some((call_id, caller_id, receiver_id, is_video, status, created_at_ms)) = row else {
                return Ok(None);
            };
            Ok(Some(CallRecord {
                call_id,
                caller_id,
                receiver_id,
                is_video: is_video != 0,
                status: parse_status(&status).context("bad status in calls row")?,
                timestamp_ms: created_at_ms,
            }))
        })
        .await??;
        Ok(out)
    }

    /// Appends a call log entry owned by `owner_id` (one row per party).
    pub async fn put_log(&self, owner_id: &str, entry: &CallLogEntry) -> Result<()> {
        let db_path = self.db_path.clone();
        let owner_id = owner_id.to_string();
        let entry = entry.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = Connection::open(db_path)?;
            conn.execute(
                r#"
                INSERT INTO call_logs (owner_id, call_id, peer_id, kind, is_video, timestamp_ms, duration_secs)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    owner_id,
                    entry.call_id,
                    entry.peer_id,
                    log_kind_str(entry.kind),
                    entry.is_video as i64,
                    entry.timestamp_ms,
                    entry.duration_secs as i64,
                ],
            )?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    pub async fn list_logs(&self, owner_id: &str, limit: u32) -> Result<Vec<CallLogEntry>> {
        let db_path = self.db_path.clone();
        let owner_id = owner_id.to_string();
        let limit = limit.clamp(1, 500);
        let out = tokio::task::spawn_blocking(move || -> Result<Vec<CallLogEntry>> {
            let conn = Connection::open(db_path)?;
            let mut stmt = conn.prepare(
                r#"
                SELECT call_id, peer_id, kind, is_video, timestamp_ms, duration_secs
                FROM call_logs
                WHERE owner_id = ?1
                ORDER BY timestamp_ms DESC
                LIMIT ?2
                "#,
            )?;
            let mut rows = stmt.query(params![owner_id, limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let kind: String = row.get(2)?;
                out.push(CallLogEntry {
                    call_id: row.get(0)?,
                    peer_id: row.get(1)?,
                    kind: parse_log_kind(&kind).context("bad kind in call_logs row")?,
                    is_video: row.get::<_, i64>(3)? != 0,
                    timestamp_ms: row.get(4)?,
                    duration_secs: row.get::<_, i64>(5)?.max(0) as u64,
                });
            }
            Ok(out)
        })
        .await??;
        Ok(out)
    }

    /// Archival: terminal call rows older than the TTL are dropped. Call
    /// logs are kept, they are the durable history.
    pub async fn cleanup_terminal(&self, ttl_secs: u64) -> Result<u64> {
        let db_path = self.db_path.clone();
        let deleted = tokio::task::spawn_blocking(move || -> Result<u64> {
            let conn = Connection::open(db_path)?;
            let cutoff = now_ms().saturating_sub((ttl_secs as i64).saturating_mul(1000));
            let n = conn.execute(
                "DELETE FROM calls WHERE status IN ('declined', 'ended') AND COALESCE(ended_at_ms, created_at_ms) < ?1",
                params![cutoff],
            )?;
            Ok(n as u64)
        })
        .await??;
        Ok(deleted)
    }
}

fn status_str(status: CallStatus) -> &'static str {
    match status {
        CallStatus::Ringing => "ringing",
        CallStatus::Accepted => "accepted",
        CallStatus::Declined => "declined",
        CallStatus::Ended => "ended",
    }
}

fn parse_status(s: &str) -> Option<CallStatus> {
    match s {
        "ringing" => Some(CallStatus::Ringing),
        "accepted" => Some(CallStatus::Accepted),
        "declined" => Some(CallStatus::Declined),
        "ended" => Some(CallStatus::Ended),
        _ => None,
    }
}

fn log_kind_str(kind: CallLogKind) -> &'static str {
    match kind {
        CallLogKind::Incoming => "incoming",
        CallLogKind::Outgoing => "outgoing",
        CallLogKind::Missed => "missed",
    }
}

fn parse_log_kind(s: &str) -> Option<CallLogKind> {
    match s {
        "incoming" => Some(CallLogKind::Incoming),
        "outgoing" => Some(CallLogKind::Outgoing),
        "missed" => Some(CallLogKind::Missed),
        _ => None,
    }
}

fn init_db(path: &Path) -> Result<()> {
    let conn = Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS calls (
          call_id TEXT PRIMARY KEY,
          caller_id TEXT NOT NULL,
          receiver_id TEXT NOT NULL,
          is_video INTEGER NOT NULL,
          status TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          accepted_at_ms INTEGER,
          ended_at_ms INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_calls_status ON calls(status, ended_at_ms);
        CREATE TABLE IF NOT EXISTS call_logs (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          owner_id TEXT NOT NULL,
          call_id TEXT NOT NULL,
          peer_id TEXT NOT NULL,
          kind TEXT NOT NULL,
          is_video INTEGER NOT NULL,
          timestamp_ms INTEGER NOT NULL,
          duration_secs INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_call_logs_owner ON call_logs(owner_id, timestamp_ms DESC);
        "#,
    )?;
    Ok(())
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
pub(crate) fn temp_store() -> CallStore {
    let path = std::env::temp_dir().join(format!("xchat_relay_test_{:016x}.db", rand::random::<u64>()));
    CallStore::open(path).expect("open temp store")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_round_trip_and_status_update() {
        let store = temp_store();
        let record = CallRecord {
            call_id: "c1".into(),
            caller_id: "alice".into(),
            receiver_id: "bob".into(),
            is_video: true,
            status: CallStatus::Ringing,
            timestamp_ms: 1_000,
        };
        store.put_call(&record).await.unwrap();

        let loaded = store.call("c1").await.unwrap().unwrap();
        assert_eq!(loaded.caller_id, "alice");
        assert!(loaded.is_video);
        assert_eq!(loaded.status, CallStatus::Ringing);

        store.set_status("c1", CallStatus::Ended, Some(2_000), Some(9_000)).await.unwrap();
        let loaded = store.call("c1").await.unwrap().unwrap();
        assert_eq!(loaded.status, CallStatus::Ended);
    }

    #[tokio::test]
    async fn logs_listed_newest_first_per_owner() {
        let store = temp_store();
        for (i, kind) in [CallLogKind::Outgoing, CallLogKind::Missed].iter().enumerate() {
            store
                .put_log(
                    "alice",
                    &CallLogEntry {
                        call_id: format!("c{i}"),
                        peer_id: "bob".into(),
                        kind: *kind,
                        is_video: false,
                        timestamp_ms: 1_000 + i as i64,
                        duration_secs: 0,
                    },
                )
                .await
                .unwrap();
        }
        let logs = store.list_logs("alice", 10).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].call_id, "c1");
        assert!(store.list_logs("bob", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cleanup_drops_only_old_terminal_calls() {
        let store = temp_store();
        let mut record = CallRecord {
            call_id: "old".into(),
            caller_id: "a".into(),
            receiver_id: "b".into(),
            is_video: false,
            status: CallStatus::Ringing,
            timestamp_ms: 0,
        };
        store.put_call(&record).await.unwrap();
        store.set_status("old", CallStatus::Ended, None, Some(0)).await.unwrap();

        record.call_id = "live".into();
        record.timestamp_ms = now_ms();
        store.put_call(&record).await.unwrap();

        let deleted = store.cleanup_terminal(60).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.call("old").await.unwrap().is_none());
        assert!(store.call("live").await.unwrap().is_some());
    }
}
