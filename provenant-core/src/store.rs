//! SQLite-backed audit store.
//!
//! Durable, append-only event log plus the request ledger and the known
//! fingerprint table. Volume is modest (this is an audit subsystem, not a
//! hot path), so all writes serialize through a single mutex-guarded
//! connection in WAL mode. Events survive process restarts; the reporting
//! surface is reconstructible from this store alone.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::tag::{DataTag, EventKind, ProvenanceEvent};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS requests (
    id          TEXT PRIMARY KEY,
    method      TEXT NOT NULL,
    path        TEXT NOT NULL,
    client_ip   TEXT,
    user_id     TEXT,
    started_at  TEXT NOT NULL,
    ended_at    TEXT,
    status_code INTEGER,
    error       TEXT
);

CREATE TABLE IF NOT EXISTS events (
    id           TEXT PRIMARY KEY,
    created_at   TEXT NOT NULL,
    event_type   TEXT NOT NULL,
    actor        TEXT NOT NULL,
    target       TEXT NOT NULL,
    payload      TEXT,
    request_id   TEXT,
    user_id      TEXT,
    matched_tags TEXT,
    extras       TEXT
);

CREATE TABLE IF NOT EXISTS fingerprints (
    fingerprint         TEXT PRIMARY KEY,
    first_seen_event_id TEXT,
    last_seen_at        TEXT NOT NULL,
    field               TEXT NOT NULL,
    category            TEXT NOT NULL,
    description         TEXT NOT NULL,
    owner               TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
CREATE INDEX IF NOT EXISTS idx_events_user ON events(user_id);
CREATE INDEX IF NOT EXISTS idx_events_target ON events(target);
CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at);
CREATE INDEX IF NOT EXISTS idx_fingerprints_owner ON fingerprints(owner);
";

/// Filter for event listings. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kind: Option<EventKind>,
    /// Matches events whose user or any matched tag owner equals this.
    pub owner: Option<String>,
    /// Substring match against the event target (destination).
    pub destination: Option<String>,
    /// Maximum events returned; `None` means unbounded.
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// One row of the request ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: Uuid,
    pub method: String,
    pub path: String,
    pub client_ip: Option<String>,
    pub user_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

/// A known fingerprint and the tag metadata last seen for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub fingerprint: String,
    pub first_seen_event_id: Option<Uuid>,
    pub last_seen_at: DateTime<Utc>,
    pub field: String,
    pub category: String,
    pub description: String,
    pub owner: Option<String>,
}

/// Aggregate counts over a trailing window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharingSummary {
    pub total_events: u64,
    pub by_type: BTreeMap<String, u64>,
    /// SHARE event counts keyed by destination.
    pub by_destination: BTreeMap<String, u64>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// A group of SHARE events surfaced by the suspicious-sharing detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharingPattern {
    pub event_type: String,
    pub destination: String,
    /// Sorted, deduplicated owner identifiers common to the group.
    pub owners: Vec<String>,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Full data-subject export for one owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerReport {
    pub owner: String,
    pub generated_at: DateTime<Utc>,
    pub tags: Vec<FingerprintRecord>,
    pub events: Vec<ProvenanceEvent>,
    pub summary: SharingSummary,
    pub suspicious_patterns: Vec<SharingPattern>,
}

/// Store-level diagnostics for the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub event_count: u64,
    pub request_count: u64,
    pub fingerprint_count: u64,
}

/// The durable audit log. Safe for concurrent use; writers serialize on the
/// internal connection mutex.
pub struct AuditStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for AuditStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditStore").field("path", &self.path).finish()
    }
}

impl AuditStore {
    /// Open (or create) the store at `path`, creating parent directories and
    /// initializing the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Open {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })?;
            }
        }
        let conn = Connection::open(path).map_err(|e| StoreError::Open {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::initialize(conn, path.to_path_buf())
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open {
            path: PathBuf::from(":memory:"),
            message: e.to_string(),
        })?;
        Self::initialize(conn, PathBuf::from(":memory:"))
    }

    fn initialize(conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        // WAL keeps concurrent readers cheap; in-memory connections ignore it.
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // -----------------------------------------------------------------
    // Request ledger
    // -----------------------------------------------------------------

    pub fn record_request_start(
        &self,
        request_id: Uuid,
        method: &str,
        path: &str,
        client_ip: Option<&str>,
        user_id: Option<&str>,
        started_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO requests (id, method, path, client_ip, user_id, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                request_id.to_string(),
                method,
                path,
                client_ip,
                user_id,
                started_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn record_request_end(
        &self,
        request_id: Uuid,
        status_code: Option<u16>,
        user_id: Option<&str>,
        error: Option<&str>,
        ended_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE requests SET ended_at = ?1, status_code = ?2, user_id = ?3, error = ?4
             WHERE id = ?5",
            params![
                ended_at.to_rfc3339(),
                status_code.map(i64::from),
                user_id,
                error,
                request_id.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Request ledger rows, newest first.
    pub fn fetch_requests(&self, limit: usize) -> Result<Vec<RequestRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, method, path, client_ip, user_id, started_at, ended_at, status_code, error
             FROM requests ORDER BY started_at DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<i64>>(7)?,
                row.get::<_, Option<String>>(8)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, method, path, client_ip, user_id, started_at, ended_at, status_code, error) =
                row?;
            records.push(RequestRecord {
                request_id: Uuid::parse_str(&id).map_err(|e| StoreError::Decode {
                    message: e.to_string(),
                })?,
                method,
                path,
                client_ip,
                user_id,
                started_at: parse_timestamp(&started_at)?,
                ended_at: ended_at.as_deref().map(parse_timestamp).transpose()?,
                status_code: status_code.map(|c| c as u16),
                error,
            });
        }
        Ok(records)
    }

    // -----------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------

    pub fn record_event(&self, event: &ProvenanceEvent) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&event.payload).map_err(decode_err)?;
        let matched = serde_json::to_string(&event.matched_tags).map_err(decode_err)?;
        let extras = serde_json::to_string(&event.extras).map_err(decode_err)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO events
                (id, created_at, event_type, actor, target, payload, request_id, user_id, matched_tags, extras)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.event_id.to_string(),
                event.created_at.to_rfc3339(),
                event.kind.as_str(),
                event.actor,
                event.target,
                payload,
                event.request_id.map(|id| id.to_string()),
                event.user_id,
                matched,
                extras,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_fingerprint(
        &self,
        tag: &DataTag,
        event_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO fingerprints
                (fingerprint, first_seen_event_id, last_seen_at, field, category, description, owner)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(fingerprint) DO UPDATE SET
                last_seen_at = excluded.last_seen_at,
                field = excluded.field,
                category = excluded.category,
                description = excluded.description,
                owner = excluded.owner",
            params![
                tag.fingerprint,
                event_id.map(|id| id.to_string()),
                Utc::now().to_rfc3339(),
                tag.field,
                tag.category,
                tag.description,
                tag.owner,
            ],
        )?;
        Ok(())
    }

    /// List events newest-first. The owner filter is applied precisely after
    /// decoding (user id or any matched tag owner), with an SQL substring
    /// pre-filter keeping the scan bounded. When an owner filter is present,
    /// paging happens after the precise check, so substring near-misses
    /// never consume limit slots.
    pub fn fetch_events(&self, filter: &EventFilter) -> Result<Vec<ProvenanceEvent>, StoreError> {
        let mut sql = String::from(
            "SELECT id, created_at, event_type, actor, target, payload, request_id, user_id, matched_tags, extras
             FROM events WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(kind) = filter.kind {
            sql.push_str(" AND event_type = ?");
            args.push(Box::new(kind.as_str().to_string()));
        }
        if let Some(destination) = &filter.destination {
            sql.push_str(" AND target LIKE ?");
            args.push(Box::new(format!("%{destination}%")));
        }
        if let Some(owner) = &filter.owner {
            sql.push_str(" AND (user_id = ? OR matched_tags LIKE ?)");
            args.push(Box::new(owner.clone()));
            args.push(Box::new(format!("%{owner}%")));
        }
        sql.push_str(" ORDER BY created_at DESC");
        let page_in_sql = filter.owner.is_none();
        if page_in_sql && (filter.limit.is_some() || filter.offset.is_some()) {
            // SQLite requires a LIMIT clause for OFFSET; -1 means unbounded.
            sql.push_str(" LIMIT ?");
            args.push(Box::new(filter.limit.map_or(-1, |l| l as i64)));
            if let Some(offset) = filter.offset {
                sql.push_str(" OFFSET ?");
                args.push(Box::new(offset as i64));
            }
        }

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            decode_event_row,
        )?;

        let mut events = Vec::new();
        for row in rows {
            let event = row?.map_err(|message| StoreError::Decode { message })?;
            if let Some(owner) = &filter.owner {
                if !event_references_owner(&event, owner) {
                    continue;
                }
            }
            events.push(event);
        }
        if !page_in_sql {
            let offset = filter.offset.unwrap_or(0);
            let limit = filter.limit.unwrap_or(usize::MAX);
            events = events.into_iter().skip(offset).take(limit).collect();
        }
        Ok(events)
    }

    pub fn fetch_fingerprints(&self) -> Result<Vec<FingerprintRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT fingerprint, first_seen_event_id, last_seen_at, field, category, description, owner
             FROM fingerprints ORDER BY last_seen_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            let event_id: Option<String> = row.get(1)?;
            let last_seen: String = row.get(2)?;
            Ok((
                row.get::<_, String>(0)?,
                event_id,
                last_seen,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (fingerprint, event_id, last_seen, field, category, description, owner) = row?;
            records.push(FingerprintRecord {
                fingerprint,
                first_seen_event_id: event_id.and_then(|s| Uuid::parse_str(&s).ok()),
                last_seen_at: parse_timestamp(&last_seen)?,
                field,
                category,
                description,
                owner,
            });
        }
        Ok(records)
    }

    pub fn fetch_fingerprints_for_owner(
        &self,
        owner: &str,
    ) -> Result<Vec<FingerprintRecord>, StoreError> {
        Ok(self
            .fetch_fingerprints()?
            .into_iter()
            .filter(|r| r.owner.as_deref() == Some(owner))
            .collect())
    }

    // -----------------------------------------------------------------
    // Aggregation & detection
    // -----------------------------------------------------------------

    /// Counts by event type and by SHARE destination within the trailing
    /// `window`.
    pub fn summarize(&self, window: Duration) -> Result<SharingSummary, StoreError> {
        let window_end = Utc::now();
        let window_start = window_end - window;
        let events = self.events_since(window_start, None)?;
        Ok(summarize_events(&events, window_start, window_end))
    }

    /// The core leak-detection heuristic: group SHARE events within the
    /// trailing window by (event type, destination, sorted owner set) and
    /// surface groups whose count reaches `threshold`, largest first.
    pub fn detect_suspicious_sharing(
        &self,
        threshold: usize,
        window: Duration,
    ) -> Result<Vec<SharingPattern>, StoreError> {
        let cutoff = Utc::now() - window;
        let shares = self.events_since(cutoff, Some(EventKind::Share))?;

        let mut groups: BTreeMap<(String, String, Vec<String>), SharingPattern> = BTreeMap::new();
        for event in &shares {
            let owners = event.owner_identifiers();
            let key = (
                event.kind.as_str().to_string(),
                event.target.clone(),
                owners.clone(),
            );
            let entry = groups.entry(key).or_insert_with(|| SharingPattern {
                event_type: event.kind.as_str().to_string(),
                destination: event.target.clone(),
                owners,
                count: 0,
                first_seen: event.created_at,
                last_seen: event.created_at,
            });
            entry.count += 1;
            entry.first_seen = entry.first_seen.min(event.created_at);
            entry.last_seen = entry.last_seen.max(event.created_at);
        }

        let mut patterns: Vec<SharingPattern> = groups
            .into_values()
            .filter(|p| p.count >= threshold as u64)
            .collect();
        patterns.sort_by(|a, b| b.count.cmp(&a.count));
        Ok(patterns)
    }

    /// Full export for a data-subject access request. Built from this store
    /// alone: the owner's tags, every event referencing them (unbounded, a
    /// subject-access export must be complete), the aggregate summary, and
    /// any suspicious patterns involving them.
    pub fn export_report(
        &self,
        owner: &str,
        suspicious_threshold: usize,
        window: Duration,
    ) -> Result<OwnerReport, StoreError> {
        let tags = self.fetch_fingerprints_for_owner(owner)?;
        let events = self.fetch_events(&EventFilter {
            owner: Some(owner.to_string()),
            ..Default::default()
        })?;
        let window_end = Utc::now();
        let summary = summarize_events(&events, window_end - window, window_end);
        let suspicious_patterns = self
            .detect_suspicious_sharing(suspicious_threshold, window)?
            .into_iter()
            .filter(|p| p.owners.iter().any(|o| o == owner))
            .collect();
        Ok(OwnerReport {
            owner: owner.to_string(),
            generated_at: window_end,
            tags,
            events,
            summary,
            suspicious_patterns,
        })
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.lock();
        let event_count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
        let request_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM requests", [], |r| r.get(0))?;
        let fingerprint_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM fingerprints", [], |r| r.get(0))?;
        Ok(StoreStats {
            event_count: event_count as u64,
            request_count: request_count as u64,
            fingerprint_count: fingerprint_count as u64,
        })
    }

    fn events_since(
        &self,
        cutoff: DateTime<Utc>,
        kind: Option<EventKind>,
    ) -> Result<Vec<ProvenanceEvent>, StoreError> {
        let mut sql = String::from(
            "SELECT id, created_at, event_type, actor, target, payload, request_id, user_id, matched_tags, extras
             FROM events WHERE created_at >= ?",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(cutoff.to_rfc3339())];
        if let Some(kind) = kind {
            sql.push_str(" AND event_type = ?");
            args.push(Box::new(kind.as_str().to_string()));
        }
        sql.push_str(" ORDER BY created_at ASC");

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            decode_event_row,
        )?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?.map_err(|message| StoreError::Decode { message })?);
        }
        Ok(events)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn summarize_events(
    events: &[ProvenanceEvent],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> SharingSummary {
    let mut by_type: BTreeMap<String, u64> = BTreeMap::new();
    let mut by_destination: BTreeMap<String, u64> = BTreeMap::new();
    for event in events {
        *by_type.entry(event.kind.as_str().to_string()).or_insert(0) += 1;
        if event.kind == EventKind::Share {
            *by_destination.entry(event.target.clone()).or_insert(0) += 1;
        }
    }
    SharingSummary {
        total_events: events.len() as u64,
        by_type,
        by_destination,
        window_start,
        window_end,
    }
}

fn event_references_owner(event: &ProvenanceEvent, owner: &str) -> bool {
    event.user_id.as_deref() == Some(owner)
        || event
            .matched_tags
            .iter()
            .any(|t| t.owner.as_deref() == Some(owner))
}

type DecodedEvent = std::result::Result<ProvenanceEvent, String>;

fn decode_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DecodedEvent> {
    let id: String = row.get(0)?;
    let created_at: String = row.get(1)?;
    let event_type: String = row.get(2)?;
    let actor: String = row.get(3)?;
    let target: String = row.get(4)?;
    let payload: Option<String> = row.get(5)?;
    let request_id: Option<String> = row.get(6)?;
    let user_id: Option<String> = row.get(7)?;
    let matched_tags: Option<String> = row.get(8)?;
    let extras: Option<String> = row.get(9)?;

    Ok(decode_event(
        id,
        created_at,
        event_type,
        actor,
        target,
        payload,
        request_id,
        user_id,
        matched_tags,
        extras,
    ))
}

#[allow(clippy::too_many_arguments)]
fn decode_event(
    id: String,
    created_at: String,
    event_type: String,
    actor: String,
    target: String,
    payload: Option<String>,
    request_id: Option<String>,
    user_id: Option<String>,
    matched_tags: Option<String>,
    extras: Option<String>,
) -> DecodedEvent {
    let kind =
        EventKind::parse(&event_type).ok_or_else(|| format!("unknown event type {event_type}"))?;
    let event_id = Uuid::parse_str(&id).map_err(|e| e.to_string())?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| e.to_string())?
        .with_timezone(&Utc);
    let payload: Value = match payload {
        Some(text) => serde_json::from_str(&text).map_err(|e| e.to_string())?,
        None => Value::Null,
    };
    let matched_tags: Vec<DataTag> = match matched_tags {
        Some(text) => serde_json::from_str(&text).map_err(|e| e.to_string())?,
        None => Vec::new(),
    };
    let extras: Value = match extras {
        Some(text) => serde_json::from_str(&text).map_err(|e| e.to_string())?,
        None => Value::Null,
    };
    let request_id = match request_id {
        Some(text) => Some(Uuid::parse_str(&text).map_err(|e| e.to_string())?),
        None => None,
    };
    Ok(ProvenanceEvent {
        event_id,
        kind,
        actor,
        target,
        payload,
        request_id,
        user_id,
        matched_tags,
        extras,
        created_at,
    })
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode {
            message: e.to_string(),
        })
}

fn decode_err(e: serde_json::Error) -> StoreError {
    StoreError::Decode {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn share_event(destination: &str, owner: &str) -> ProvenanceEvent {
        let tag = DataTag::for_value(
            &json!("alice@example.com"),
            "email",
            "contact.email",
            "Email address",
            Some(owner.to_string()),
            "HTTP POST /signup",
            100,
        );
        ProvenanceEvent::new(EventKind::Share, "http.egress", destination)
            .with_payload(json!({"method": "POST"}))
            .with_request(Some(Uuid::new_v4()), Some(owner.to_string()))
            .with_matched_tags(vec![tag])
    }

    #[test]
    fn test_record_and_fetch_round_trip() {
        let store = AuditStore::open_in_memory().unwrap();
        let event = share_event("https://api.partner.com", "alice");
        store.record_event(&event).unwrap();

        let fetched = store.fetch_events(&EventFilter::default()).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].event_id, event.event_id);
        assert_eq!(fetched[0].kind, EventKind::Share);
        assert_eq!(fetched[0].matched_tags.len(), 1);
        assert_eq!(fetched[0].payload, json!({"method": "POST"}));
    }

    #[test]
    fn test_fetch_events_filters() {
        let store = AuditStore::open_in_memory().unwrap();
        store
            .record_event(&share_event("https://api.partner.com", "alice"))
            .unwrap();
        store
            .record_event(&share_event("https://tracker.example.net", "bob"))
            .unwrap();
        store
            .record_event(
                &ProvenanceEvent::new(EventKind::Ingress, "http.ingress", "/signup")
                    .with_request(None, Some("alice".into())),
            )
            .unwrap();

        let shares = store
            .fetch_events(&EventFilter {
                kind: Some(EventKind::Share),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(shares.len(), 2);

        let partner = store
            .fetch_events(&EventFilter {
                destination: Some("partner".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(partner.len(), 1);

        let alice = store
            .fetch_events(&EventFilter {
                owner: Some("alice".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(alice.len(), 2);
    }

    #[test]
    fn test_fetch_events_limit_and_order() {
        let store = AuditStore::open_in_memory().unwrap();
        for _ in 0..5 {
            store
                .record_event(&share_event("https://api.partner.com", "alice"))
                .unwrap();
        }
        let events = store
            .fetch_events(&EventFilter {
                limit: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_owner_limit_counts_only_precise_matches() {
        let store = AuditStore::open_in_memory().unwrap();
        // "malice" passes the SQL substring pre-filter for "alice" but must
        // not consume limit slots.
        for _ in 0..3 {
            store
                .record_event(&share_event("https://api.partner.com", "malice"))
                .unwrap();
        }
        for _ in 0..2 {
            store
                .record_event(&share_event("https://api.partner.com", "alice"))
                .unwrap();
        }

        let events = store
            .fetch_events(&EventFilter {
                owner: Some("alice".into()),
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| e.user_id.as_deref() == Some("alice")));
    }

    #[test]
    fn test_owner_export_includes_every_event() {
        let store = AuditStore::open_in_memory().unwrap();
        for _ in 0..1001 {
            store
                .record_event(&share_event("https://api.partner.com", "alice"))
                .unwrap();
        }
        let report = store
            .export_report("alice", 5, Duration::hours(24))
            .unwrap();
        assert_eq!(report.events.len(), 1001);
    }

    #[test]
    fn test_upsert_fingerprint_is_idempotent() {
        let store = AuditStore::open_in_memory().unwrap();
        let tag = DataTag::for_value(
            &json!("alice@example.com"),
            "email",
            "contact.email",
            "Email address",
            Some("alice".into()),
            "test",
            100,
        );
        store.upsert_fingerprint(&tag, None).unwrap();
        store.upsert_fingerprint(&tag, None).unwrap();
        let records = store.fetch_fingerprints().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].owner.as_deref(), Some("alice"));
    }

    #[test]
    fn test_suspicious_sharing_threshold() {
        let store = AuditStore::open_in_memory().unwrap();
        for _ in 0..6 {
            store
                .record_event(&share_event("https://api.partner.com", "alice"))
                .unwrap();
        }
        // Below-threshold noise to a different destination.
        store
            .record_event(&share_event("https://other.example.com", "alice"))
            .unwrap();

        let patterns = store
            .detect_suspicious_sharing(5, Duration::hours(24))
            .unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].count, 6);
        assert_eq!(patterns[0].destination, "https://api.partner.com");
        assert_eq!(patterns[0].owners, vec!["alice"]);
    }

    #[test]
    fn test_suspicious_sharing_respects_window() {
        let store = AuditStore::open_in_memory().unwrap();
        for _ in 0..6 {
            let mut event = share_event("https://api.partner.com", "alice");
            event.created_at = Utc::now() - Duration::hours(48);
            store.record_event(&event).unwrap();
        }
        let patterns = store
            .detect_suspicious_sharing(5, Duration::hours(24))
            .unwrap();
        assert!(patterns.is_empty());
    }

    #[test]
    fn test_request_ledger_round_trip() {
        let store = AuditStore::open_in_memory().unwrap();
        let request_id = Uuid::new_v4();
        store
            .record_request_start(request_id, "POST", "/signup", None, None, Utc::now())
            .unwrap();
        store
            .record_request_end(request_id, Some(200), Some("alice"), None, Utc::now())
            .unwrap();

        let rows = store.fetch_requests(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].request_id, request_id);
        assert_eq!(rows[0].status_code, Some(200));
        assert_eq!(rows[0].user_id.as_deref(), Some("alice"));
        assert!(rows[0].ended_at.is_some());
        assert!(rows[0].error.is_none());
    }

    #[test]
    fn test_export_report_is_self_contained() {
        let store = AuditStore::open_in_memory().unwrap();
        let tag = DataTag::for_value(
            &json!("alice@example.com"),
            "email",
            "contact.email",
            "Email address",
            Some("alice".into()),
            "test",
            100,
        );
        store.upsert_fingerprint(&tag, None).unwrap();
        for _ in 0..6 {
            store
                .record_event(&share_event("https://api.partner.com", "alice"))
                .unwrap();
        }
        store
            .record_event(&share_event("https://api.partner.com", "bob"))
            .unwrap();

        let report = store
            .export_report("alice", 5, Duration::hours(24))
            .unwrap();
        assert_eq!(report.tags.len(), 1);
        assert_eq!(report.events.len(), 6);
        assert_eq!(report.summary.by_destination["https://api.partner.com"], 6);
        assert_eq!(report.suspicious_patterns.len(), 1);
    }

    #[test]
    fn test_store_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("audit.db");
        {
            let store = AuditStore::open(&path).unwrap();
            store
                .record_event(&share_event("https://api.partner.com", "alice"))
                .unwrap();
        }
        let store = AuditStore::open(&path).unwrap();
        assert_eq!(store.stats().unwrap().event_count, 1);
    }
}
