//! Durable URL catalog — the deduplication authority and lifecycle store.
//!
//! Single-file SQLite via rusqlite. `Connection` is not `Sync`, so the
//! handle lives behind `Arc<Mutex<_>>` and every operation runs the blocking
//! closure on the tokio blocking pool. The single connection also makes
//! claim/mark operations serializable without explicit transactions.

pub mod normalize;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use tokio::task::spawn_blocking;

use crate::core::error::CorruptionError;
use crate::core::types::{
    ApiCallRecord, ApiQuotaSnapshot, CatalogEntry, EntryStatus, InsertOutcome, RefreshPolicy,
    SourceKind,
};

/// Claims older than this are considered abandoned and eligible again.
const CLAIM_LEASE_MINUTES: i64 = 10;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS catalog (
    url_hash        TEXT PRIMARY KEY,
    url             TEXT NOT NULL,
    kind            TEXT NOT NULL,
    status          TEXT NOT NULL,
    priority        INTEGER NOT NULL,
    discovered_from TEXT,
    added_at        TEXT NOT NULL,
    last_fetched_at TEXT,
    next_refresh_at TEXT,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    last_error      TEXT,
    refresh_policy  TEXT NOT NULL,
    claimed_at      TEXT
);
CREATE INDEX IF NOT EXISTS idx_catalog_claim   ON catalog(status, priority DESC, added_at);
CREATE INDEX IF NOT EXISTS idx_catalog_refresh ON catalog(status, next_refresh_at);

CREATE TABLE IF NOT EXISTS api_call_log (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    api_name        TEXT NOT NULL,
    timestamp       TEXT NOT NULL,
    success         INTEGER NOT NULL,
    latency_ms      INTEGER NOT NULL,
    remaining_quota INTEGER
);
CREATE INDEX IF NOT EXISTS idx_api_call_log_name_ts ON api_call_log(api_name, timestamp);
";

pub struct UrlCatalog {
    conn: Arc<Mutex<Connection>>,
}

fn ts(t: DateTime<Utc>) -> String {
    // Fixed-width RFC 3339 so lexicographic TEXT ordering matches time order.
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp in catalog: '{s}'"))?
        .with_timezone(&Utc))
}

impl UrlCatalog {
    pub fn open(path: &Path) -> Result<UrlCatalog> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating catalog dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening catalog at {}", path.display()))?;
        conn.execute_batch(SCHEMA).context("catalog schema init")?;
        Ok(UrlCatalog {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<UrlCatalog> {
        let conn = Connection::open_in_memory().context("opening in-memory catalog")?;
        conn.execute_batch(SCHEMA).context("catalog schema init")?;
        Ok(UrlCatalog {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| anyhow!("catalog mutex poisoned"))?;
            f(&guard)
        })
        .await
        .context("catalog task join")?
    }

    /// Insert entries whose `url_hash` is not yet present. Existing rows are
    /// never touched through this path; duplicates are counted, not errors.
    pub async fn insert_if_absent(&self, entries: Vec<CatalogEntry>) -> Result<InsertOutcome> {
        self.with_conn(move |conn| {
            let mut out = InsertOutcome::default();
            let mut stmt = conn.prepare_cached(
                "INSERT INTO catalog
                   (url_hash, url, kind, status, priority, discovered_from, added_at,
                    last_fetched_at, next_refresh_at, retry_count, last_error, refresh_policy)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(url_hash) DO NOTHING",
            )?;
            for e in entries {
                let changed = stmt.execute(params![
                    e.url_hash,
                    e.url,
                    e.kind.as_str(),
                    e.status.as_str(),
                    e.priority,
                    e.discovered_from,
                    ts(e.added_at),
                    e.last_fetched_at.map(ts),
                    e.next_refresh_at.map(ts),
                    e.retry_count,
                    e.last_error,
                    e.refresh_policy.as_str(),
                ])?;
                if changed == 1 {
                    out.added += 1;
                } else {
                    out.skipped += 1;
                }
            }
            Ok(out)
        })
        .await
    }

    /// Atomically claim up to `n` pending entries, highest priority first,
    /// oldest first within a priority. Claimed rows carry a lease so a second
    /// worker (or a restarted process) cannot double-claim them until the
    /// lease expires.
    pub async fn claim_batch(&self, n: usize) -> Result<Vec<CatalogEntry>> {
        let now = Utc::now();
        self.with_conn(move |conn| {
            let stale = ts(now - Duration::minutes(CLAIM_LEASE_MINUTES));
            let mut stmt = conn.prepare_cached(
                "SELECT url_hash, url, kind, status, priority, discovered_from, added_at,
                        last_fetched_at, next_refresh_at, retry_count, last_error, refresh_policy
                 FROM catalog
                 WHERE status = 'pending' AND (claimed_at IS NULL OR claimed_at < ?1)
                 ORDER BY priority DESC, added_at ASC
                 LIMIT ?2",
            )?;
            let entries: Vec<CatalogEntry> = stmt
                .query_map(params![stale, n as i64], row_to_entry)?
                .collect::<rusqlite::Result<_>>()?;

            let mut mark = conn.prepare_cached(
                "UPDATE catalog SET claimed_at = ?1 WHERE url_hash = ?2",
            )?;
            for e in &entries {
                mark.execute(params![ts(now), e.url_hash])?;
            }
            Ok(entries)
        })
        .await
    }

    pub async fn mark_fetched(
        &self,
        url_hash: String,
        when: DateTime<Utc>,
        next_refresh_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE catalog
                 SET status = 'fetched', last_fetched_at = ?1, next_refresh_at = ?2,
                     last_error = NULL, claimed_at = NULL
                 WHERE url_hash = ?3",
                params![ts(when), next_refresh_at.map(ts), url_hash],
            )?;
            if changed == 0 {
                return Err(anyhow!("mark_fetched: unknown url_hash {url_hash}"));
            }
            Ok(())
        })
        .await
    }

    /// Record a failed attempt. Transient failures re-enter `pending` until
    /// `max_retries` attempts have been burned; permanent ones (and the final
    /// transient one) stick at `failed`.
    pub async fn mark_failed(
        &self,
        url_hash: String,
        error: String,
        when: DateTime<Utc>,
        permanent: bool,
        max_retries: u32,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            let retry_count: u32 = conn
                .query_row(
                    "SELECT retry_count FROM catalog WHERE url_hash = ?1",
                    params![&url_hash],
                    |row| row.get(0),
                )
                .with_context(|| format!("mark_failed: unknown url_hash {url_hash}"))?;
            let retry_count = retry_count + 1;
            let status = if permanent || retry_count >= max_retries {
                EntryStatus::Failed
            } else {
                EntryStatus::Pending
            };
            conn.execute(
                "UPDATE catalog
                 SET status = ?1, retry_count = ?2, last_error = ?3, claimed_at = NULL
                 WHERE url_hash = ?4",
                params![status.as_str(), retry_count, format!("{} ({})", error, ts(when)), url_hash],
            )?;
            Ok(())
        })
        .await
    }

    /// Entries whose refresh deadline has passed. Videos never appear here:
    /// their policy is `never` and `next_refresh_at` stays NULL.
    pub async fn due_for_refresh(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CatalogEntry>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT url_hash, url, kind, status, priority, discovered_from, added_at,
                        last_fetched_at, next_refresh_at, retry_count, last_error, refresh_policy
                 FROM catalog
                 WHERE status = 'fetched' AND refresh_policy != 'never'
                   AND next_refresh_at IS NOT NULL AND next_refresh_at <= ?1
                 ORDER BY next_refresh_at ASC
                 LIMIT ?2",
            )?;
            let entries = stmt
                .query_map(params![ts(now), limit as i64], row_to_entry)?
                .collect::<rusqlite::Result<_>>()?;
            Ok(entries)
        })
        .await
    }

    pub async fn get(&self, url_hash: String) -> Result<Option<CatalogEntry>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT url_hash, url, kind, status, priority, discovered_from, added_at,
                        last_fetched_at, next_refresh_at, retry_count, last_error, refresh_policy
                 FROM catalog WHERE url_hash = ?1",
            )?;
            let mut rows = stmt.query_map(params![url_hash], row_to_entry)?;
            match rows.next() {
                Some(row) => Ok(Some(row?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Bulk delete of `pending` and/or `failed` entries. `fetched` rows are
    /// never eligible: their chunks live in the vector index and must go
    /// through the paired wipe instead.
    pub async fn clear(&self, statuses: Vec<EntryStatus>) -> Result<usize> {
        let eligible: Vec<&'static str> = statuses
            .iter()
            .filter(|s| !matches!(s, EntryStatus::Fetched))
            .map(|s| s.as_str())
            .collect();
        if eligible.is_empty() {
            return Ok(0);
        }
        self.with_conn(move |conn| {
            let mut deleted = 0;
            for status in eligible {
                deleted += conn.execute("DELETE FROM catalog WHERE status = ?1", params![status])?;
            }
            Ok(deleted)
        })
        .await
    }

    /// Full wipe. Only call alongside the vector-store wipe.
    pub async fn delete_all(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM catalog", [])?;
            conn.execute("DELETE FROM api_call_log", [])?;
            Ok(())
        })
        .await
    }

    pub async fn counts(&self) -> Result<(BTreeMap<String, u64>, BTreeMap<String, u64>)> {
        self.with_conn(|conn| {
            let mut by_status = BTreeMap::new();
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM catalog GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (k, v) = row?;
                by_status.insert(k, v.max(0) as u64);
            }

            let mut by_kind = BTreeMap::new();
            let mut stmt = conn.prepare("SELECT kind, COUNT(*) FROM catalog GROUP BY kind")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (k, v) = row?;
                by_kind.insert(k, v.max(0) as u64);
            }
            Ok((by_status, by_kind))
        })
        .await
    }

    pub async fn log_api_call(&self, rec: ApiCallRecord) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO api_call_log (api_name, timestamp, success, latency_ms, remaining_quota)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    rec.api_name,
                    ts(rec.timestamp),
                    rec.success,
                    rec.latency_ms as i64,
                    rec.remaining_quota
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Per-API snapshot over the last 24h plus the most recent quota header.
    pub async fn api_quota(&self) -> Result<Vec<ApiQuotaSnapshot>> {
        let since = Utc::now() - Duration::hours(24);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT api_name,
                        COUNT(*),
                        SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END),
                        (SELECT remaining_quota FROM api_call_log l2
                          WHERE l2.api_name = l.api_name AND l2.remaining_quota IS NOT NULL
                          ORDER BY l2.timestamp DESC LIMIT 1)
                 FROM api_call_log l
                 WHERE timestamp >= ?1
                 GROUP BY api_name
                 ORDER BY api_name",
            )?;
            let rows = stmt.query_map(params![ts(since)], |row| {
                Ok(ApiQuotaSnapshot {
                    api_name: row.get(0)?,
                    calls_today: row.get::<_, i64>(1)?.max(0) as u64,
                    failures_today: row.get::<_, Option<i64>>(2)?.unwrap_or(0).max(0) as u64,
                    remaining_quota: row.get(3)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        })
        .await
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CatalogEntry> {
    let kind_raw: String = row.get(2)?;
    let status_raw: String = row.get(3)?;
    let entry = CatalogEntry {
        url_hash: row.get(0)?,
        url: row.get(1)?,
        kind: SourceKind::parse(&kind_raw).ok_or_else(|| bad_column(2, &kind_raw))?,
        status: EntryStatus::parse(&status_raw).ok_or_else(|| bad_column(3, &status_raw))?,
        priority: row.get(4)?,
        discovered_from: row.get(5)?,
        added_at: get_ts(row, 6)?,
        last_fetched_at: get_opt_ts(row, 7)?,
        next_refresh_at: get_opt_ts(row, 8)?,
        retry_count: row.get(9)?,
        last_error: row.get(10)?,
        refresh_policy: RefreshPolicy::parse(&row.get::<_, String>(11)?),
    };
    Ok(entry)
}

fn bad_column(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(CorruptionError(format!("unrecognized catalog value '{value}'"))),
    )
}

fn get_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|_| bad_column(idx, &raw))
}

fn get_opt_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(None),
        Some(s) => parse_ts(&s).map(Some).map_err(|_| bad_column(idx, &s)),
    }
}
