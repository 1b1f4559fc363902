//! Relational schema for events and their tags.

use crate::error::Result;
use rusqlite::Connection;
use tracing::info;

/// Bumped whenever the DDL below changes shape.
pub const SCHEMA_VERSION: i32 = 1;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS events (
            row_id      INTEGER PRIMARY KEY AUTOINCREMENT,
            id          TEXT NOT NULL UNIQUE,
            pubkey      TEXT NOT NULL,
            created_at  INTEGER NOT NULL,
            kind        INTEGER NOT NULL,
            content     TEXT NOT NULL,
            sig         TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_pubkey_kind
            ON events(pubkey, kind, created_at DESC);

        CREATE INDEX IF NOT EXISTS idx_events_kind
            ON events(kind, created_at DESC);

        CREATE INDEX IF NOT EXISTS idx_events_created
            ON events(created_at DESC);

        CREATE TABLE IF NOT EXISTS tags (
            event_row_id  INTEGER NOT NULL REFERENCES events(row_id) ON DELETE CASCADE,
            position      INTEGER NOT NULL,
            slot0         TEXT,
            slot1         TEXT,
            slot2         TEXT,
            slot3         TEXT,
            overflow      TEXT NOT NULL DEFAULT '[]',
            PRIMARY KEY (event_row_id, position)
        );

        CREATE INDEX IF NOT EXISTS idx_tags_name_value
            ON tags(slot0, slot1);

        CREATE TRIGGER IF NOT EXISTS events_prevent_update
            BEFORE UPDATE ON events
            FOR EACH ROW
            BEGIN
                SELECT RAISE(ABORT, 'events are immutable');
            END;

        CREATE TRIGGER IF NOT EXISTS tags_prevent_update
            BEFORE UPDATE ON tags
            FOR EACH ROW
            BEGIN
                SELECT RAISE(ABORT, 'tags are immutable');
            END;
        ",
    )?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

    info!(version = SCHEMA_VERSION, "Event store migrations complete");
    Ok(())
}
