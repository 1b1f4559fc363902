//! Relational event store.
//!
//! Events live in one table and their tags in another, joined by a store-local
//! surrogate key. Writes are idempotent on the event id: the same event arriving
//! from several relays is stored once.

use crate::error::{Result, SyncError};
use crate::filters::Filter;
use crate::records::query::{self, RowIdQuery};
use crate::records::{schema, tag_rows, TagRow, TAG_SLOTS};
use crate::types::{Event, Tag, Timestamp};
use crate::worker::Background;
use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Keeps `IN (...)` lists well under SQLite's bound-parameter limit.
const MAX_IN_PARAMS: usize = 500;

const EVENT_COLUMNS: &str = "e.row_id, e.id, e.pubkey, e.created_at, e.kind, e.content, e.sig";

/// Event store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// SQLite database file.
    pub path: PathBuf,

    /// Reconstructed events kept in memory by id (0 disables the cache).
    pub event_cache_size: usize,

    /// Whether to create the database if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./events.db"),
            event_cache_size: 1000,
            create_if_missing: true,
        }
    }
}

/// Result of a batch insert.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Events newly stored.
    pub inserted: usize,
    /// Events whose id was already present.
    pub duplicates: usize,
    /// Events that failed to store, with the error message.
    pub failed: Vec<(String, String)>,
}

/// Row of the `events` table before tags are attached.
struct EventRow {
    row_id: i64,
    event: Event,
}

/// Persistent store of events and their tags.
pub struct EventStore {
    conn: Mutex<Connection>,
    cache: Option<Mutex<LruCache<String, Event>>>,
}

impl EventStore {
    /// Open (or create) the database described by `config`.
    pub fn open(config: StoreConfig) -> Result<Self> {
        if !config.path.exists() {
            if !config.create_if_missing {
                return Err(SyncError::NotInitialized(config.path.display().to_string()));
            }
            if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&config.path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self::with_connection(conn, config.event_cache_size)?;

        info!(path = %config.path.display(), "Event store opened");
        Ok(store)
    }

    /// Open a private in-memory store.
    pub fn in_memory(event_cache_size: usize) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, event_cache_size)
    }

    fn with_connection(conn: Connection, event_cache_size: usize) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::run(&conn)?;

        let cache = NonZeroUsize::new(event_cache_size).map(|n| Mutex::new(LruCache::new(n)));
        Ok(Self {
            conn: Mutex::new(conn),
            cache,
        })
    }

    // --- Writes ---

    /// Store an event with its tags in one transaction.
    ///
    /// Returns `false` (and writes nothing) when the id is already stored.
    pub fn insert(&self, _bg: &Background, event: &Event) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let stored = insert_event(&tx, event)?;
        tx.commit()?;
        Ok(stored)
    }

    /// Store a replaceable or addressable event, dropping the versions it supersedes.
    ///
    /// A version is keyed by (author, kind), plus the `d` tag value when
    /// `address` is given. The newer `created_at` wins; on a tie the lower id
    /// wins. Returns `false` (and writes nothing) when a stored version wins.
    pub fn replace(&self, _bg: &Background, event: &Event, address: Option<&str>) -> Result<bool> {
        let (stored, superseded) = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;

            let current = current_versions(&tx, event, address)?;
            if current
                .iter()
                .any(|(_, id, created_at)| !supersedes(event, id, *created_at))
            {
                return Ok(false);
            }
            for (row_id, _, _) in &current {
                tx.execute("DELETE FROM events WHERE row_id = ?1", [row_id])?;
            }
            let stored = insert_event(&tx, event)?;
            tx.commit()?;

            let superseded: Vec<String> = current.into_iter().map(|(_, id, _)| id).collect();
            (stored, superseded)
        };

        if !superseded.is_empty() {
            debug!(
                id = %event.id,
                kind = event.kind,
                superseded = superseded.len(),
                "Replaced event"
            );
            if let Some(cache) = &self.cache {
                let mut cache = cache.lock();
                for id in &superseded {
                    cache.pop(id);
                }
            }
        }
        Ok(stored)
    }

    /// Insert each event independently; one failure does not stop the rest.
    pub fn insert_batch(&self, bg: &Background, events: &[Event]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for event in events {
            match self.insert(bg, event) {
                Ok(true) => outcome.inserted += 1,
                Ok(false) => outcome.duplicates += 1,
                Err(e) => {
                    warn!(id = %event.id, error = %e, "Failed to store event");
                    outcome.failed.push((event.id.clone(), e.to_string()));
                }
            }
        }
        debug!(
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            failed = outcome.failed.len(),
            "Stored event batch"
        );
        outcome
    }

    /// Delete events by id; their tags go with them. Returns rows removed.
    pub fn delete_by_ids(&self, _bg: &Background, ids: &[String]) -> Result<usize> {
        let mut removed = 0;
        {
            let conn = self.conn.lock();
            for chunk in ids.chunks(MAX_IN_PARAMS) {
                let sql = format!("DELETE FROM events WHERE id IN ({})", placeholders(chunk.len()));
                removed += conn.execute(&sql, params_from_iter(chunk.iter()))?;
            }
        }
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock();
            for id in ids {
                cache.pop(id);
            }
        }
        Ok(removed)
    }

    // --- Lookups ---

    pub fn contains(&self, id: &str) -> Result<bool> {
        if let Some(cache) = &self.cache {
            if cache.lock().contains(id) {
                return Ok(true);
            }
        }
        let conn = self.conn.lock();
        let found = conn
            .query_row("SELECT 1 FROM events WHERE id = ?1", [id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<Event>> {
        if let Some(cache) = &self.cache {
            if let Some(event) = cache.lock().get(id) {
                return Ok(Some(event.clone()));
            }
        }
        let events = self.select(
            &format!("SELECT {EVENT_COLUMNS} FROM events e WHERE e.id = ?1"),
            vec![SqlValue::Text(id.to_string())],
        )?;
        let event = events.into_iter().next();
        if let (Some(cache), Some(event)) = (&self.cache, &event) {
            cache.lock().put(event.id.clone(), event.clone());
        }
        Ok(event)
    }

    /// Events for the given ids that are stored, newest first.
    pub fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Event>> {
        let mut events = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events e WHERE e.id IN ({}) ORDER BY e.created_at DESC, e.id",
                placeholders(chunk.len())
            );
            events.extend(self.select(&sql, text_values(chunk))?);
        }
        sort_newest_first(&mut events);
        Ok(events)
    }

    pub fn get_by_author(&self, pubkey: &str) -> Result<Vec<Event>> {
        self.select(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM events e WHERE e.pubkey = ?1 ORDER BY e.created_at DESC, e.id"
            ),
            vec![SqlValue::Text(pubkey.to_string())],
        )
    }

    pub fn get_by_author_kind(&self, pubkey: &str, kind: u32) -> Result<Vec<Event>> {
        self.select(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM events e WHERE e.pubkey = ?1 AND e.kind = ?2 ORDER BY e.created_at DESC, e.id"
            ),
            vec![SqlValue::Text(pubkey.to_string()), SqlValue::Integer(i64::from(kind))],
        )
    }

    pub fn get_by_authors_kind(&self, pubkeys: &[String], kind: u32) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        for chunk in pubkeys.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events e WHERE e.kind = ? AND e.pubkey IN ({}) ORDER BY e.created_at DESC, e.id",
                placeholders(chunk.len())
            );
            let mut values = vec![SqlValue::Integer(i64::from(kind))];
            values.extend(text_values(chunk));
            events.extend(self.select(&sql, values)?);
        }
        sort_newest_first(&mut events);
        Ok(events)
    }

    /// Events carrying a tag whose first two elements are `name`, `value`.
    pub fn get_by_tag(&self, name: &str, value: &str) -> Result<Vec<Event>> {
        self.select(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM events e
                 WHERE e.row_id IN (SELECT t.event_row_id FROM tags t WHERE t.slot0 = ?1 AND t.slot1 = ?2)
                 ORDER BY e.created_at DESC, e.id"
            ),
            vec![SqlValue::Text(name.to_string()), SqlValue::Text(value.to_string())],
        )
    }

    /// Events matching any of `filters`, newest first.
    pub fn query(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        let RowIdQuery { sql, params } = query::row_ids_for_any(filters);
        self.select(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM events e WHERE e.row_id IN ({sql}) ORDER BY e.created_at DESC, e.id"
            ),
            params,
        )
    }

    // --- Counts ---

    pub fn count_all(&self) -> Result<usize> {
        self.count_sql("SELECT COUNT(*) FROM events", Vec::new())
    }

    pub fn count_by_ids(&self, ids: &[String]) -> Result<usize> {
        let mut total = 0;
        for chunk in ids.chunks(MAX_IN_PARAMS) {
            let sql = format!("SELECT COUNT(*) FROM events WHERE id IN ({})", placeholders(chunk.len()));
            total += self.count_sql(&sql, text_values(chunk))?;
        }
        Ok(total)
    }

    pub fn count_by_author(&self, pubkey: &str) -> Result<usize> {
        self.count_sql(
            "SELECT COUNT(*) FROM events WHERE pubkey = ?1",
            vec![SqlValue::Text(pubkey.to_string())],
        )
    }

    pub fn count_by_author_kind(&self, pubkey: &str, kind: u32) -> Result<usize> {
        self.count_sql(
            "SELECT COUNT(*) FROM events WHERE pubkey = ?1 AND kind = ?2",
            vec![SqlValue::Text(pubkey.to_string()), SqlValue::Integer(i64::from(kind))],
        )
    }

    pub fn count_by_authors_kind(&self, pubkeys: &[String], kind: u32) -> Result<usize> {
        let mut total = 0;
        for chunk in pubkeys.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "SELECT COUNT(*) FROM events WHERE kind = ? AND pubkey IN ({})",
                placeholders(chunk.len())
            );
            let mut values = vec![SqlValue::Integer(i64::from(kind))];
            values.extend(text_values(chunk));
            total += self.count_sql(&sql, values)?;
        }
        Ok(total)
    }

    pub fn count_by_tag(&self, name: &str, value: &str) -> Result<usize> {
        self.count_sql(
            "SELECT COUNT(DISTINCT event_row_id) FROM tags WHERE slot0 = ?1 AND slot1 = ?2",
            vec![SqlValue::Text(name.to_string()), SqlValue::Text(value.to_string())],
        )
    }

    pub fn count(&self, filters: &[Filter]) -> Result<usize> {
        let RowIdQuery { sql, params } = query::row_ids_for_any(filters);
        self.count_sql(&format!("SELECT COUNT(*) FROM ({sql})"), params)
    }

    // --- Internals ---

    fn count_sql(&self, sql: &str, values: Vec<SqlValue>) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(sql, params_from_iter(values), |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Run an event-row select and attach each event's tags.
    fn select(&self, sql: &str, values: Vec<SqlValue>) -> Result<Vec<Event>> {
        let conn = self.conn.lock();

        let rows = {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(params_from_iter(values), |row| {
                    Ok(EventRow {
                        row_id: row.get(0)?,
                        event: Event {
                            id: row.get(1)?,
                            author: row.get(2)?,
                            created_at: Timestamp(row.get::<_, i64>(3)? as u64),
                            kind: row.get::<_, i64>(4)? as u32,
                            tags: Vec::new(),
                            content: row.get(5)?,
                            signature: row.get(6)?,
                        },
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let row_ids: Vec<i64> = rows.iter().map(|r| r.row_id).collect();
        let mut tags = load_tags(&conn, &row_ids)?;

        Ok(rows
            .into_iter()
            .map(|mut r| {
                r.event.tags = tags.remove(&r.row_id).unwrap_or_default();
                r.event
            })
            .collect())
    }
}

/// Tags for each row id, in position order.
fn load_tags(conn: &Connection, row_ids: &[i64]) -> Result<HashMap<i64, Vec<Tag>>> {
    let mut out: HashMap<i64, Vec<Tag>> = HashMap::with_capacity(row_ids.len());

    for chunk in row_ids.chunks(MAX_IN_PARAMS) {
        let sql = format!(
            "SELECT event_row_id, position, slot0, slot1, slot2, slot3, overflow
             FROM tags WHERE event_row_id IN ({}) ORDER BY event_row_id, position",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(chunk.iter()), |row| {
                let slots: [Option<String>; TAG_SLOTS] =
                    [row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?];
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, u32>(1)?,
                    slots,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for (row_id, position, slots, overflow) in rows {
            let tag = TagRow::from_columns(position, slots, &overflow)?.into_tag();
            out.entry(row_id).or_default().push(tag);
        }
    }

    Ok(out)
}

/// Insert the event row and its tag rows. `false` when the id is already stored.
fn insert_event(conn: &Connection, event: &Event) -> Result<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO events (id, pubkey, created_at, kind, content, sig)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.id,
            event.author,
            event.created_at.0 as i64,
            i64::from(event.kind),
            event.content,
            event.signature
        ],
    )?;
    if changed == 0 {
        return Ok(false);
    }

    let row_id = conn.last_insert_rowid();
    let mut stmt = conn.prepare_cached(
        "INSERT INTO tags (event_row_id, position, slot0, slot1, slot2, slot3, overflow)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for row in tag_rows(&event.tags) {
        stmt.execute(params![
            row_id,
            row.position,
            row.slots[0],
            row.slots[1],
            row.slots[2],
            row.slots[3],
            row.overflow_json()?
        ])?;
    }
    Ok(true)
}

/// Stored versions sharing `event`'s (author, kind[, address]) as (row id, id, created_at).
fn current_versions(
    conn: &Connection,
    event: &Event,
    address: Option<&str>,
) -> Result<Vec<(i64, String, u64)>> {
    let mut sql = String::from(
        "SELECT e.row_id, e.id, e.created_at FROM events e WHERE e.pubkey = ?1 AND e.kind = ?2",
    );
    let mut values = vec![
        SqlValue::Text(event.author.clone()),
        SqlValue::Integer(i64::from(event.kind)),
    ];
    if let Some(address) = address {
        sql.push_str(
            " AND COALESCE((SELECT t.slot1 FROM tags t
                            WHERE t.event_row_id = e.row_id AND t.slot0 = 'd'
                            ORDER BY t.position LIMIT 1), '') = ?3",
        );
        values.push(SqlValue::Text(address.to_string()));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)? as u64,
        ))
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Whether `event` replaces a stored version with `id` created at `created_at`.
fn supersedes(event: &Event, id: &str, created_at: u64) -> bool {
    match event.created_at.0.cmp(&created_at) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Equal => event.id.as_str() < id,
        std::cmp::Ordering::Less => false,
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn text_values(values: &[String]) -> Vec<SqlValue> {
    values.iter().cloned().map(SqlValue::Text).collect()
}

fn sort_newest_first(events: &mut [Event]) {
    events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}
