//! Local event store.
//!
//! A durable, content-addressed cache of validated events backed by SQLite,
//! with reactive queries on top. The relay network stays authoritative: the
//! store can be cleared and rebuilt from relay data at the cost of latency
//! only.
//!
//! Upserts are serialized behind one lock, and live-query emission happens
//! inside that critical section, so subscribers never observe a torn
//! intermediate state and a duplicate insert never produces an emission.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chateau_core::{Event, KindClass, classify_kind};
use rusqlite::types::Value;
use rusqlite::{Connection, params};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::filter::Filter;

/// Reconciliation state of a locally originated event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStatus {
    /// Sent, no relay outcome yet
    Pending,
    /// At least one target relay accepted it
    Confirmed,
    /// Every target relay rejected it or was unreachable
    Failed,
}

impl PublishStatus {
    fn as_str(self) -> &'static str {
        match self {
            PublishStatus::Pending => "pending",
            PublishStatus::Confirmed => "confirmed",
            PublishStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PublishStatus::Pending),
            "confirmed" => Some(PublishStatus::Confirmed),
            "failed" => Some(PublishStatus::Failed),
            _ => None,
        }
    }
}

/// A reactive query handle. Emits the current matching set immediately and
/// again after every upsert that changes that set.
pub struct LiveQuery {
    receiver: mpsc::UnboundedReceiver<Vec<Event>>,
}

impl LiveQuery {
    /// Next emission, or `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<Vec<Event>> {
        self.receiver.recv().await
    }

    /// Non-blocking variant for callers draining on their own schedule.
    pub fn try_recv(&mut self) -> Option<Vec<Event>> {
        self.receiver.try_recv().ok()
    }
}

struct LiveEntry {
    filter: Filter,
    sender: mpsc::UnboundedSender<Vec<Event>>,
    last_ids: Vec<String>,
}

struct StoreInner {
    conn: Connection,
    live: Vec<LiveEntry>,
}

/// The durable event cache. Cheap to clone; all clones share the database.
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<Mutex<StoreInner>>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    pubkey TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    kind INTEGER NOT NULL,
    json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS tags (
    event_id TEXT NOT NULL,
    name TEXT NOT NULL,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS publish_status (
    event_id TEXT PRIMARY KEY,
    status TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS events_kind_created ON events(kind, created_at);
CREATE INDEX IF NOT EXISTS events_pubkey_created ON events(pubkey, created_at);
CREATE INDEX IF NOT EXISTS tags_name_value ON tags(name, value);
CREATE INDEX IF NOT EXISTS tags_event ON tags(event_id);
";

impl EventStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// An in-memory store, used in tests and as a cold-start fallback.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(StoreInner {
                conn,
                live: Vec::new(),
            })),
        })
    }

    /// Insert events, skipping ids already present (idempotent) and keeping
    /// only the newest row per author for replaceable and addressable
    /// kinds. Returns the events that were actually new.
    ///
    /// Callers are expected to have verified the events already; the store
    /// never surfaces anything it was not given.
    pub fn upsert(&self, events: &[Event]) -> Result<Vec<Event>> {
        let mut inner = self.lock();
        let mut fresh = Vec::new();

        for event in events {
            if Self::insert_one(&inner.conn, event)? {
                fresh.push(event.clone());
            }
        }

        if !fresh.is_empty() {
            Self::notify(&mut inner, &fresh)?;
        }
        Ok(fresh)
    }

    fn insert_one(conn: &Connection, event: &Event) -> Result<bool> {
        match classify_kind(event.kind) {
            KindClass::Replaceable => {
                if !Self::displace_older(conn, event, None)? {
                    return Ok(false);
                }
            }
            KindClass::Addressable => {
                let d = event.tag_value("d").unwrap_or_default().to_string();
                if !Self::displace_older(conn, event, Some(&d))? {
                    return Ok(false);
                }
            }
            _ => {}
        }

        let json = serde_json::to_string(event)?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO events (id, pubkey, created_at, kind, json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.id,
                event.pubkey,
                event.created_at as i64,
                event.kind as i64,
                json
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }

        let mut stmt =
            conn.prepare_cached("INSERT INTO tags (event_id, name, value) VALUES (?1, ?2, ?3)")?;
        for tag in &event.tags {
            if tag.len() >= 2 {
                stmt.execute(params![event.id, tag[0], tag[1]])?;
            }
        }
        Ok(true)
    }

    /// For replaceable kinds: drop stored rows for the same (pubkey, kind
    /// [, d]) that are older than `event`. Returns false when a stored row
    /// is newer (or the same age), meaning the incoming event loses.
    fn displace_older(conn: &Connection, event: &Event, d: Option<&str>) -> Result<bool> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, created_at FROM events WHERE pubkey = ?1 AND kind = ?2",
        )?;
        let rows: Vec<(String, i64)> = stmt
            .query_map(params![event.pubkey, event.kind as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut losers = Vec::new();
        for (id, created_at) in rows {
            if id == event.id {
                return Ok(false);
            }
            if let Some(d) = d {
                let stored_d: Option<String> = conn
                    .query_row(
                        "SELECT value FROM tags WHERE event_id = ?1 AND name = 'd' LIMIT 1",
                        params![id],
                        |row| row.get(0),
                    )
                    .ok();
                if stored_d.as_deref().unwrap_or_default() != d {
                    continue;
                }
            }
            if created_at as u64 >= event.created_at {
                return Ok(false);
            }
            losers.push(id);
        }

        for id in losers {
            debug!("replacing {id} with newer {}", event.id);
            conn.execute("DELETE FROM events WHERE id = ?1", params![id])?;
            conn.execute("DELETE FROM tags WHERE event_id = ?1", params![id])?;
            conn.execute("DELETE FROM publish_status WHERE event_id = ?1", params![id])?;
        }
        Ok(true)
    }

    /// Query matching events, newest first, ties broken by id. The order is
    /// total, so pagination over repeated queries is stable.
    pub fn query(&self, filter: &Filter) -> Result<Vec<Event>> {
        let inner = self.lock();
        Self::query_locked(&inner.conn, filter)
    }

    fn query_locked(conn: &Connection, filter: &Filter) -> Result<Vec<Event>> {
        let (sql, values) = build_select(filter);
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows: Vec<String> = stmt
            .query_map(rusqlite::params_from_iter(values), |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;

        let mut events = Vec::with_capacity(rows.len());
        for json in rows {
            match serde_json::from_str(&json) {
                Ok(event) => events.push(event),
                Err(e) => warn!("undecodable stored event dropped: {e}"),
            }
        }
        Ok(events)
    }

    /// Register a reactive query. The current matching set is emitted
    /// before this returns; afterwards, a new set is emitted exactly when
    /// an upsert changes it.
    pub fn live_query(&self, filter: Filter) -> Result<LiveQuery> {
        let mut inner = self.lock();
        let current = Self::query_locked(&inner.conn, &filter)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let last_ids = current.iter().map(|e| e.id.clone()).collect();
        let _ = tx.send(current);
        inner.live.push(LiveEntry {
            filter,
            sender: tx,
            last_ids,
        });
        Ok(LiveQuery { receiver: rx })
    }

    fn notify(inner: &mut StoreInner, fresh: &[Event]) -> Result<()> {
        let StoreInner { conn, live } = inner;
        let mut closed = Vec::new();

        for (idx, entry) in live.iter_mut().enumerate() {
            if !fresh.iter().any(|e| entry.filter.matches(e)) {
                continue;
            }
            let result = Self::query_locked(conn, &entry.filter)?;
            let ids: Vec<String> = result.iter().map(|e| e.id.clone()).collect();
            if ids == entry.last_ids {
                continue;
            }
            entry.last_ids = ids;
            if entry.sender.send(result).is_err() {
                closed.push(idx);
            }
        }

        for idx in closed.into_iter().rev() {
            live.swap_remove(idx);
        }
        Ok(())
    }

    /// Record the reconciliation state of a locally originated event.
    pub fn set_status(&self, event_id: &str, status: PublishStatus) -> Result<()> {
        let inner = self.lock();
        inner.conn.execute(
            "INSERT OR REPLACE INTO publish_status (event_id, status) VALUES (?1, ?2)",
            params![event_id, status.as_str()],
        )?;
        Ok(())
    }

    pub fn status(&self, event_id: &str) -> Result<Option<PublishStatus>> {
        let inner = self.lock();
        let status: Option<String> = inner
            .conn
            .query_row(
                "SELECT status FROM publish_status WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .ok();
        Ok(status.and_then(|s| PublishStatus::parse(&s)))
    }

    /// Drop every cached event. Live queries observe their sets emptying;
    /// the relay network can rebuild the cache.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.conn.execute_batch(
            "DELETE FROM events; DELETE FROM tags; DELETE FROM publish_status;",
        )?;

        let mut closed = Vec::new();
        for (idx, entry) in inner.live.iter_mut().enumerate() {
            if entry.last_ids.is_empty() {
                continue;
            }
            entry.last_ids = Vec::new();
            if entry.sender.send(Vec::new()).is_err() {
                closed.push(idx);
            }
        }
        for idx in closed.into_iter().rev() {
            inner.live.swap_remove(idx);
        }
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        let inner = self.lock();
        let count: i64 = inner
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Translate a filter into a SELECT over the indexed columns. Tag
/// conditions go through the tags side table so they never full-scan.
fn build_select(filter: &Filter) -> (String, Vec<Value>) {
    let mut conditions: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(ref ids) = filter.ids {
        conditions.push(format!("id IN ({})", placeholders(ids.len())));
        values.extend(ids.iter().map(|s| Value::Text(s.clone())));
    }
    if let Some(ref authors) = filter.authors {
        conditions.push(format!("pubkey IN ({})", placeholders(authors.len())));
        values.extend(authors.iter().map(|s| Value::Text(s.clone())));
    }
    if let Some(ref kinds) = filter.kinds {
        conditions.push(format!("kind IN ({})", placeholders(kinds.len())));
        values.extend(kinds.iter().map(|k| Value::Integer(*k as i64)));
    }
    if let Some(since) = filter.since {
        conditions.push("created_at >= ?".to_string());
        values.push(Value::Integer(since as i64));
    }
    if let Some(until) = filter.until {
        conditions.push("created_at <= ?".to_string());
        values.push(Value::Integer(until as i64));
    }
    for (key, wanted) in &filter.tags {
        let Some(name) = key.strip_prefix('#') else {
            continue;
        };
        conditions.push(format!(
            "id IN (SELECT event_id FROM tags WHERE name = ? AND value IN ({}))",
            placeholders(wanted.len())
        ));
        values.push(Value::Text(name.to_string()));
        values.extend(wanted.iter().map(|s| Value::Text(s.clone())));
    }

    let mut sql = String::from("SELECT json FROM events");
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(" ORDER BY created_at DESC, id ASC");
    if let Some(limit) = filter.limit {
        sql.push_str(" LIMIT ?");
        values.push(Value::Integer(limit as i64));
    }

    (sql, values)
}

fn placeholders(n: usize) -> String {
    let mut out = String::new();
    for i in 0..n {
        if i > 0 {
            out.push(',');
        }
        out.push('?');
    }
    out
}
