use rusqlite::Connection;
use tracing::info;

/// Ordered schema migrations. The index + 1 is the resulting `user_version`.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS pending_messages (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        topic            TEXT    NOT NULL,
        payload          BLOB    NOT NULL,
        timestamp        INTEGER NOT NULL,
        sent             INTEGER NOT NULL DEFAULT 0,
        retry_count      INTEGER NOT NULL DEFAULT 0,
        connection_state INTEGER NOT NULL DEFAULT 0,
        extra_info       TEXT    NOT NULL DEFAULT '{}'
    );",
    "CREATE INDEX IF NOT EXISTS idx_pending_messages_sent_id
        ON pending_messages (sent, id);",
];

pub(crate) fn current_version(conn: &Connection) -> rusqlite::Result<usize> {
    conn.query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))
        .map(|v| v.max(0) as usize)
}

/// Applies every migration newer than the stored `user_version`.
///
/// Returns the number of migrations applied.
pub(crate) fn migrate(conn: &mut Connection) -> rusqlite::Result<usize> {
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
    let version = current_version(&tx)?;

    let mut applied = 0;
    for (index, sql) in MIGRATIONS.iter().enumerate().skip(version) {
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", (index + 1) as i64)?;
        applied += 1;
    }
    tx.commit()?;

    if applied > 0 {
        info!(
            "Applied {} outbox migration(s), schema version {}",
            applied,
            latest_version()
        );
    }
    Ok(applied)
}

pub(crate) fn latest_version() -> usize {
    MIGRATIONS.len()
}
