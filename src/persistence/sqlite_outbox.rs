//! SQLite-backed [`OutboxStore`].
//!
//! Every state change runs inside an `IMMEDIATE` transaction, which takes the
//! database write lock up front. Claims additionally compare-and-set the
//! `extra_info` text they read, so a row only changes owner once even when
//! several processes share the same database file.

use super::schema;
use super::{ExtraInfo, OutboxError, OutboxStore, Payload, PendingMessage};
use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_COLUMNS: &str =
    "id, topic, payload, timestamp, sent, retry_count, connection_state, extra_info";

pub struct SqliteOutbox {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteOutbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteOutbox")
            .field("conn", &"rusqlite::Connection")
            .finish()
    }
}

/// A row as stored, before the JSON side-channel is parsed.
struct RawRow {
    id: i64,
    topic: String,
    payload: Vec<u8>,
    timestamp_ms: i64,
    sent: bool,
    retry_count: i64,
    connection_state: bool,
    extra_info: String,
}

impl RawRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            topic: row.get(1)?,
            payload: row.get(2)?,
            timestamp_ms: row.get(3)?,
            sent: row.get(4)?,
            retry_count: row.get(5)?,
            connection_state: row.get(6)?,
            extra_info: row.get(7)?,
        })
    }

    fn timestamp(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp_ms).unwrap_or_default()
    }

    /// Side-channel for a row whose `extra_info` could not be parsed.
    fn repaired_info(&self) -> ExtraInfo {
        ExtraInfo::stored(self.timestamp())
    }

    fn into_message(self, extra_info: ExtraInfo) -> PendingMessage {
        let timestamp = self.timestamp();
        PendingMessage {
            id: self.id,
            topic: self.topic,
            payload: self.payload,
            timestamp,
            sent: self.sent,
            retry_count: self.retry_count.max(0) as u32,
            connection_state: self.connection_state,
            extra_info,
        }
    }
}

impl SqliteOutbox {
    /// Opens (or creates) the database at `path`. Use [`migrate`](Self::migrate)
    /// before the first read or write.
    ///
    /// The special path `:memory:` opens a private in-memory database.
    pub fn open(path: &Path) -> Result<Self, OutboxError> {
        if path.as_os_str() == ":memory:" {
            return Self::open_in_memory();
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!("Opened outbox at {} (journal mode {})", path.display(), mode);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, OutboxError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Applies pending schema migrations, returning how many ran.
    pub fn migrate(&self) -> Result<usize, OutboxError> {
        let mut conn = self.lock("migrate")?;
        Ok(schema::migrate(&mut conn)?)
    }

    pub fn schema_version(&self) -> Result<usize, OutboxError> {
        let conn = self.lock("schema_version")?;
        Ok(schema::current_version(&conn)?)
    }

    fn lock(&self, operation: &'static str) -> Result<MutexGuard<'_, Connection>, OutboxError> {
        self.conn
            .lock()
            .map_err(|_| OutboxError::LockPoisoned(operation))
    }

    fn fetch(conn: &Connection, id: i64) -> Result<Option<RawRow>, OutboxError> {
        let sql = format!("SELECT {} FROM pending_messages WHERE id = ?1", SELECT_COLUMNS);
        Ok(conn.query_row(&sql, params![id], RawRow::read).optional()?)
    }

    /// Shared body of `mark_sent` and `release`: clears the claim, counts the
    /// attempt and optionally finalizes the row. Sent rows are left untouched.
    fn finish_attempt(&self, id: i64, sent: bool) -> Result<(), OutboxError> {
        let mut conn = self.lock(if sent { "mark_sent" } else { "release" })?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let raw = Self::fetch(&tx, id)?.ok_or(OutboxError::NotFound(id))?;
        if raw.sent {
            debug!("Message {} already sent, nothing to update", id);
            return Ok(());
        }

        let mut info = ExtraInfo::parse(&raw.extra_info).unwrap_or_else(|e| {
            warn!("Replacing unreadable extra_info of message {}: {}", id, e);
            raw.repaired_info()
        });
        info.processing = false;
        info.processing_started = None;
        if sent {
            info.sent_at = Some(Utc::now());
        }

        tx.execute(
            "UPDATE pending_messages
                SET sent = ?1, retry_count = retry_count + 1, extra_info = ?2
              WHERE id = ?3 AND sent = 0",
            params![sent, info.encode()?, id],
        )?;
        tx.commit()?;
        Ok(())
    }
}

impl OutboxStore for SqliteOutbox {
    fn enqueue(
        &self,
        topic: &str,
        payload: &Payload,
        connection_state: bool,
    ) -> Result<i64, OutboxError> {
        if topic.trim().is_empty() {
            return Err(OutboxError::EmptyTopic);
        }
        let bytes = payload.to_bytes()?;
        let now = Utc::now();
        let info = ExtraInfo::stored(now).encode()?;

        let conn = self.lock("enqueue")?;
        conn.execute(
            "INSERT INTO pending_messages
                (topic, payload, timestamp, sent, retry_count, connection_state, extra_info)
             VALUES (?1, ?2, ?3, 0, 0, ?4, ?5)",
            params![topic, bytes, now.timestamp_millis(), connection_state, info],
        )?;
        let id = conn.last_insert_rowid();
        debug!("Enqueued message {} on topic {}", id, topic);
        Ok(id)
    }

    fn claim_pending(&self, limit: usize) -> Result<Vec<PendingMessage>, OutboxError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.lock("claim_pending")?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut claimable = Vec::new();
        let mut unreadable = Vec::new();
        {
            let sql = format!(
                "SELECT {} FROM pending_messages WHERE sent = 0 ORDER BY id ASC",
                SELECT_COLUMNS
            );
            let mut stmt = tx.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let raw = RawRow::read(row)?;
                match ExtraInfo::parse(&raw.extra_info) {
                    Ok(info) if info.processing => continue,
                    Ok(info) => claimable.push((raw, info)),
                    Err(e) => {
                        warn!("Message {} has unreadable extra_info, skipping: {}", raw.id, e);
                        unreadable.push(raw);
                    }
                }
                if claimable.len() >= limit {
                    break;
                }
            }
        }

        for raw in &unreadable {
            tx.execute(
                "UPDATE pending_messages SET extra_info = ?1 WHERE id = ?2 AND extra_info = ?3",
                params![raw.repaired_info().encode()?, raw.id, raw.extra_info],
            )?;
        }

        let now = Utc::now();
        let mut claimed = Vec::with_capacity(claimable.len());
        for (raw, mut info) in claimable {
            info.processing = true;
            info.processing_started = Some(now);
            let changed = tx.execute(
                "UPDATE pending_messages SET extra_info = ?1
                  WHERE id = ?2 AND sent = 0 AND extra_info = ?3",
                params![info.encode()?, raw.id, raw.extra_info],
            )?;
            if changed == 1 {
                claimed.push(raw.into_message(info));
            }
        }

        tx.commit()?;
        if !claimed.is_empty() {
            debug!("Claimed {} message(s)", claimed.len());
        }
        Ok(claimed)
    }

    fn mark_sent(&self, id: i64) -> Result<(), OutboxError> {
        self.finish_attempt(id, true)
    }

    fn release(&self, id: i64) -> Result<(), OutboxError> {
        self.finish_attempt(id, false)
    }

    fn reset_stale_processing(&self, older_than: Option<Duration>) -> Result<usize, OutboxError> {
        let mut conn = self.lock("reset_stale_processing")?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();
        let threshold = older_than.map(|d| TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX));

        let mut stale = Vec::new();
        {
            let mut stmt =
                tx.prepare("SELECT id, extra_info FROM pending_messages WHERE sent = 0")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (id, raw) = row?;
                let Ok(info) = ExtraInfo::parse(&raw) else {
                    continue;
                };
                if !info.processing {
                    continue;
                }
                let expired = match (threshold, info.processing_started) {
                    (None, _) | (Some(_), None) => true,
                    (Some(limit), Some(started)) => now.signed_duration_since(started) >= limit,
                };
                if expired {
                    stale.push((id, raw, info));
                }
            }
        }

        let mut reset = 0;
        for (id, raw, mut info) in stale {
            info.processing = false;
            info.processing_started = None;
            reset += tx.execute(
                "UPDATE pending_messages SET extra_info = ?1 WHERE id = ?2 AND extra_info = ?3",
                params![info.encode()?, id, raw],
            )?;
        }
        tx.commit()?;

        if reset > 0 {
            info!("Reset {} stale processing claim(s)", reset);
        }
        Ok(reset)
    }

    fn count_pending(&self) -> Result<usize, OutboxError> {
        let conn = self.lock("count_pending")?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pending_messages WHERE sent = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    fn has_old_pending(&self, age: Duration) -> Result<bool, OutboxError> {
        let age_ms = i64::try_from(age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(age_ms);
        let conn = self.lock("has_old_pending")?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM pending_messages WHERE sent = 0 AND timestamp < ?1)",
            params![cutoff],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn get(&self, id: i64) -> Result<Option<PendingMessage>, OutboxError> {
        let conn = self.lock("get")?;
        match Self::fetch(&conn, id)? {
            Some(raw) => {
                let info = ExtraInfo::parse(&raw.extra_info)?;
                Ok(Some(raw.into_message(info)))
            }
            None => Ok(None),
        }
    }
}
