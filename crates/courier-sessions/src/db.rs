use rusqlite::Connection;

use crate::error::Result;
use crate::types::Session;

/// Initialise the session tables.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            session_key    TEXT PRIMARY KEY,
            metadata       TEXT NOT NULL DEFAULT '{}',
            created_at     TEXT NOT NULL,
            last_active_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS session_messages (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            session_key  TEXT NOT NULL,
            position     INTEGER NOT NULL,
            role         TEXT NOT NULL,
            content      TEXT NOT NULL,
            summary      TEXT,
            is_interrupt INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT NOT NULL,
            UNIQUE (session_key, position)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session
            ON session_messages(session_key, position);",
    )?;
    Ok(())
}

/// Write one session snapshot. Replaces the metadata row and upserts any
/// history rows not yet persisted (rows are append-only in memory, so the
/// positions already on disk are left untouched).
pub fn flush_session(conn: &Connection, session: &Session) -> Result<()> {
    let key = session.key.format();
    let metadata = serde_json::to_string(&session.metadata)?;

    conn.execute(
        "INSERT INTO sessions (session_key, metadata, created_at, last_active_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(session_key) DO UPDATE
            SET metadata = ?2, last_active_at = ?4",
        rusqlite::params![
            key,
            metadata,
            session.created_at.to_rfc3339(),
            session.last_active_at.to_rfc3339()
        ],
    )?;

    let persisted: i64 = conn.query_row(
        "SELECT COUNT(*) FROM session_messages WHERE session_key = ?1",
        rusqlite::params![key],
        |row| row.get(0),
    )?;

    for (position, entry) in session.history.iter().enumerate().skip(persisted as usize) {
        conn.execute(
            "INSERT OR IGNORE INTO session_messages
             (session_key, position, role, content, summary, is_interrupt, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                key,
                position as i64,
                entry.role.as_str(),
                entry.content,
                entry.summary,
                entry.is_interrupt as i64,
                entry.created_at.to_rfc3339()
            ],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Role, SessionKey};

    #[test]
    fn flush_is_incremental() {
        let conn = Connection::open_in_memory().expect("open");
        init_db(&conn).expect("init");

        let mut session = Session::new(SessionKey::new("telegram", "c", "u"));
        session.add_message(Role::User, "one");
        session.add_message(Role::Assistant, "two");
        flush_session(&conn, &session).expect("flush");

        session.add_message(Role::User, "three");
        flush_session(&conn, &session).expect("flush again");

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM session_messages", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 3);
    }
}
