use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, types::Value, Connection, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, warn};

use zw_engine::alerts::{
    evaluate, AlertCandidate, AlertCounts, BackoffConfig, OccupancyRow, ZoneConfig,
};
use zw_engine::merger::{reconcile, WriteSet};
use zw_engine::{CandidateInterval, DetectionEvent, OpenInterval, PersonKey};

/// Ledger state for a claimed detection.
pub const LEDGER_PROCESSING: &str = "P";
/// Ledger state for a reconciled detection.
pub const LEDGER_DONE: &str = "D";

/// SQLite-backed persistence for detections, the processing ledger,
/// occupancy intervals, zone metadata and alerts.
///
/// Claiming and reconciliation each run as one immediate transaction;
/// SQLite's single-writer lock serializes reconciliation across
/// workers, so no finer-grained row locking is needed.
#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
}

/// A persisted occupancy interval, open when `to` is `None`.
#[derive(Debug, Clone, Serialize)]
pub struct IntervalRow {
    pub person: PersonKey,
    pub zone_id: i64,
    pub from: DateTime<Utc>,
    pub to: Option<DateTime<Utc>>,
    pub created_by: String,
    pub updated_by: Option<String>,
}

/// A persisted alert, never updated by this engine once inserted.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRow {
    pub id: String,
    pub zone_id: i64,
    pub kind: String,
    pub details: serde_json::Value,
    pub person: PersonKey,
    pub created_at: DateTime<Utc>,
    pub worker_id: String,
    pub dismissed: bool,
}

/// What one committed reconciliation transaction did.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BatchSummary {
    pub people: usize,
    pub closed: usize,
    pub inserted: usize,
    pub alerts: AlertCounts,
}

pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp {:?}", raw))?
        .with_timezone(&Utc))
}

fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

impl Kernel {
    pub fn open(dir: &Path) -> Result<Self> {
        let db_path = dir.join("zonewatch.sqlite");
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let busy_ms: u64 = std::env::var("ZW_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        conn.busy_timeout(std::time::Duration::from_millis(busy_ms))?;
        Self::init_schema(&conn)?;
        Ok(Self { db_path })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              zone_id INTEGER NOT NULL,
              creation_time TEXT NOT NULL,
              is_known INTEGER NOT NULL,
              person_id INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_detections_time ON detections(creation_time);

            CREATE TABLE IF NOT EXISTS processed_detections (
              detection_id INTEGER PRIMARY KEY,
              state TEXT NOT NULL,
              worker_id TEXT NOT NULL,
              claimed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS occupancy (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              person_id INTEGER NOT NULL,
              is_known INTEGER NOT NULL,
              zone_id INTEGER NOT NULL,
              from_ts TEXT NOT NULL,
              to_ts TEXT,
              created_by TEXT NOT NULL,
              updated_by TEXT,
              created_at TEXT NOT NULL,
              UNIQUE(person_id, is_known, from_ts)
            );
            CREATE INDEX IF NOT EXISTS idx_occupancy_open
              ON occupancy(person_id, is_known) WHERE to_ts IS NULL;

            CREATE TABLE IF NOT EXISTS zones (
              id INTEGER PRIMARY KEY,
              name TEXT NOT NULL,
              config TEXT
            );

            CREATE TABLE IF NOT EXISTS alerts (
              id TEXT PRIMARY KEY,
              zone_id INTEGER NOT NULL,
              kind TEXT NOT NULL,
              details TEXT NOT NULL,
              person_id INTEGER NOT NULL,
              is_known INTEGER NOT NULL,
              created_at TEXT NOT NULL,
              worker_id TEXT NOT NULL,
              dismissed INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_backoff
              ON alerts(zone_id, person_id, is_known, kind, created_at);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Record a raw detection. The camera ingestion path owns this
    /// table in production; the engine only ever reads it.
    pub fn insert_detection(
        &self,
        zone_id: i64,
        creation_time: DateTime<Utc>,
        person: PersonKey,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO detections(zone_id, creation_time, is_known, person_id) VALUES(?,?,?,?)",
            params![
                zone_id,
                fmt_ts(creation_time),
                person.is_known(),
                person.id()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Create or replace a zone row. Zone metadata is owned by the
    /// external CRUD surface; this exists for seeding and tests.
    pub fn upsert_zone(&self, id: i64, name: &str, config: Option<&ZoneConfig>) -> Result<()> {
        let conn = self.conn()?;
        let config_s = config.map(serde_json::to_string).transpose()?;
        conn.execute(
            "INSERT OR REPLACE INTO zones(id, name, config) VALUES(?,?,?)",
            params![id, name, config_s],
        )?;
        Ok(())
    }

    /// Claim the oldest unprocessed detections for `worker_id`, up to
    /// `limit` rows, and mark them Processing in the ledger.
    ///
    /// Rows already claimed by this same worker and still Processing
    /// are included again, so a worker that crashed mid-run picks its
    /// batch back up. The ledger upsert ignores duplicates instead of
    /// erroring. An empty result is normal and returns `vec![]`.
    pub fn claim_batch(&self, worker_id: &str, limit: i64) -> Result<Vec<DetectionEvent>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let events = {
            let mut stmt = tx.prepare(
                "SELECT d.id, d.zone_id, d.creation_time, d.is_known, d.person_id
                 FROM detections d
                 LEFT JOIN processed_detections p ON p.detection_id = d.id
                 WHERE p.state IS NULL OR (p.worker_id = ?1 AND p.state = ?2)
                 ORDER BY d.creation_time ASC, d.id ASC
                 LIMIT ?3",
            )?;
            let mut rows = stmt.query(params![worker_id, LEDGER_PROCESSING, limit])?;
            let mut events: Vec<DetectionEvent> = Vec::new();
            while let Some(row) = rows.next()? {
                let time_s: String = row.get(2)?;
                events.push(DetectionEvent {
                    id: row.get(0)?,
                    zone_id: row.get(1)?,
                    creation_time: parse_ts(&time_s)?,
                    person: PersonKey::new(row.get(3)?, row.get(4)?),
                });
            }
            if !events.is_empty() {
                let now = fmt_ts(Utc::now());
                let mut upsert = tx.prepare(
                    "INSERT INTO processed_detections(detection_id, state, worker_id, claimed_at)
                     VALUES(?,?,?,?) ON CONFLICT(detection_id) DO NOTHING",
                )?;
                for ev in &events {
                    upsert.execute(params![ev.id, LEDGER_PROCESSING, worker_id, now])?;
                }
            }
            events
        };
        tx.commit()?;
        if events.is_empty() {
            debug!(worker = worker_id, "no detections to claim");
        }
        Ok(events)
    }

    /// Delete the ledger rows for a claimed batch so the detections
    /// become claimable again. This is the compensation for a failed
    /// second phase; deleting rows that are already gone is a no-op.
    pub fn compensate_claim(&self, event_ids: &[i64]) -> Result<usize> {
        if event_ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn()?;
        let sql = format!(
            "DELETE FROM processed_detections WHERE detection_id IN ({})",
            placeholders(event_ids.len())
        );
        let n = conn.execute(&sql, params_from_iter(event_ids.iter()))?;
        warn!(deleted = n, "rolled back batch claim");
        Ok(n)
    }

    fn load_open_intervals(
        conn: &Connection,
        keys: &[PersonKey],
    ) -> Result<BTreeMap<PersonKey, OpenInterval>> {
        let mut out = BTreeMap::new();
        for is_known in [true, false] {
            let ids: Vec<i64> = keys
                .iter()
                .filter(|k| k.is_known() == is_known)
                .map(|k| k.id())
                .collect();
            if ids.is_empty() {
                continue;
            }
            let sql = format!(
                "SELECT person_id, zone_id, from_ts FROM occupancy
                 WHERE to_ts IS NULL AND is_known = ? AND person_id IN ({})",
                placeholders(ids.len())
            );
            let mut values: Vec<Value> = vec![Value::from(is_known)];
            values.extend(ids.into_iter().map(Value::from));
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(values))?;
            while let Some(row) = rows.next()? {
                let person = PersonKey::new(is_known, row.get(0)?);
                let from_s: String = row.get(2)?;
                out.insert(
                    person,
                    OpenInterval {
                        zone_id: row.get(1)?,
                        from: parse_ts(&from_s)?,
                    },
                );
            }
        }
        Ok(out)
    }

    fn apply_write_set(
        conn: &Connection,
        ws: &WriteSet,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut close = conn.prepare(
            "UPDATE occupancy SET to_ts = ?1, updated_by = ?2
             WHERE person_id = ?3 AND is_known = ?4 AND to_ts IS NULL",
        )?;
        for c in &ws.closes {
            close.execute(params![
                fmt_ts(c.to),
                worker_id,
                c.person.id(),
                c.person.is_known()
            ])?;
        }
        let mut insert = conn.prepare(
            "INSERT OR IGNORE INTO occupancy
               (person_id, is_known, zone_id, from_ts, to_ts, created_by, created_at)
             VALUES(?,?,?,?,?,?,?)",
        )?;
        for i in &ws.inserts {
            insert.execute(params![
                i.person.id(),
                i.person.is_known(),
                i.zone_id,
                fmt_ts(i.from),
                i.to.map(fmt_ts),
                worker_id,
                fmt_ts(now)
            ])?;
        }
        Ok(())
    }

    fn occupancy_snapshot(
        conn: &Connection,
        worker_id: &str,
        created_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<OccupancyRow>> {
        let mut sql = String::from(
            "SELECT o.person_id, o.is_known, o.zone_id, o.from_ts, z.config
             FROM occupancy o
             JOIN zones z ON z.id = o.zone_id
             WHERE o.to_ts IS NULL AND (o.created_by = ?1 OR o.updated_by = ?1)",
        );
        let mut values: Vec<Value> = vec![Value::from(worker_id.to_string())];
        if let Some(cutoff) = created_after {
            sql.push_str(" AND o.created_at >= ?2");
            values.push(Value::from(fmt_ts(cutoff)));
        }
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(values))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let from_s: String = row.get(3)?;
            let config_s: Option<String> = row.get(4)?;
            let config = match config_s.as_deref() {
                None | Some("") => ZoneConfig::default(),
                Some(raw) => serde_json::from_str(raw).unwrap_or_else(|err| {
                    warn!(%err, "unreadable zone config, treating as empty");
                    ZoneConfig::default()
                }),
            };
            out.push(OccupancyRow {
                person: PersonKey::new(row.get(1)?, row.get(0)?),
                zone_id: row.get(2)?,
                from: parse_ts(&from_s)?,
                config,
            });
        }
        Ok(out)
    }

    /// Insert the alert candidates that clear their backoff window.
    ///
    /// A matching alert newer than `now - backoff(kind)` suppresses the
    /// candidate; that is the normal dedup outcome, not an error.
    fn insert_alerts(
        conn: &Connection,
        candidates: &[AlertCandidate],
        now: DateTime<Utc>,
        backoff: &BackoffConfig,
        worker_id: &str,
    ) -> Result<AlertCounts> {
        let mut counts = AlertCounts::default();
        if candidates.is_empty() {
            return Ok(counts);
        }
        let mut check = conn.prepare(
            "SELECT EXISTS(
               SELECT 1 FROM alerts
               WHERE zone_id = ?1 AND person_id = ?2 AND is_known = ?3
                 AND kind = ?4 AND created_at > ?5)",
        )?;
        let mut insert = conn.prepare(
            "INSERT INTO alerts(id, zone_id, kind, details, person_id, is_known, created_at, worker_id)
             VALUES(?,?,?,?,?,?,?,?)",
        )?;
        for cand in candidates {
            let cutoff = fmt_ts(now - backoff.window(cand.kind));
            let suppressed: bool = check.query_row(
                params![
                    cand.zone_id,
                    cand.person.id(),
                    cand.person.is_known(),
                    cand.kind.code(),
                    cutoff
                ],
                |row| row.get(0),
            )?;
            if suppressed {
                debug!(person = %cand.person, zone = cand.zone_id, kind = cand.kind.code(),
                       "alert suppressed by backoff");
                continue;
            }
            let details = serde_json::json!({ "from": fmt_ts(cand.from) }).to_string();
            insert.execute(params![
                uuid::Uuid::new_v4().to_string(),
                cand.zone_id,
                cand.kind.code(),
                details,
                cand.person.id(),
                cand.person.is_known(),
                fmt_ts(now),
                worker_id
            ])?;
            counts.record(cand.kind);
        }
        Ok(counts)
    }

    fn mark_done(conn: &Connection, event_ids: &[i64], worker_id: &str) -> Result<usize> {
        if event_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE processed_detections SET state = '{}' WHERE worker_id = ? AND detection_id IN ({})",
            LEDGER_DONE,
            placeholders(event_ids.len())
        );
        let mut values: Vec<Value> = vec![Value::from(worker_id.to_string())];
        values.extend(event_ids.iter().copied().map(Value::from));
        Ok(conn.execute(&sql, params_from_iter(values))?)
    }

    /// Phase two of a reconciliation run, in one immediate transaction:
    /// read the batch's open intervals, apply the merger's writes,
    /// derive and insert backoff-filtered alerts from the resulting
    /// occupancy, and flip the ledger rows to Done.
    ///
    /// Nothing here commits partially; on any error the transaction
    /// rolls back and the caller compensates the claim.
    pub fn finish_batch(
        &self,
        worker_id: &str,
        candidates: &BTreeMap<PersonKey, Vec<CandidateInterval>>,
        event_ids: &[i64],
        now: DateTime<Utc>,
        backoff: &BackoffConfig,
    ) -> Result<BatchSummary> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        debug!(people = candidates.len(), "reconciling occupancy");
        let keys: Vec<PersonKey> = candidates.keys().copied().collect();
        let existing = Self::load_open_intervals(&tx, &keys).context("load open intervals")?;
        let ws = reconcile(&existing, candidates);
        Self::apply_write_set(&tx, &ws, worker_id, now).context("apply occupancy writes")?;

        debug!("deriving alerts");
        let snapshot =
            Self::occupancy_snapshot(&tx, worker_id, None).context("read occupancy for alerts")?;
        let fired = evaluate(&snapshot, now);
        let alerts =
            Self::insert_alerts(&tx, &fired, now, backoff, worker_id).context("insert alerts")?;

        debug!("marking batch done");
        Self::mark_done(&tx, event_ids, worker_id).context("mark ledger done")?;

        tx.commit().context("commit reconciliation")?;
        Ok(BatchSummary {
            people: candidates.len(),
            closed: ws.closes.len(),
            inserted: ws.inserts.len(),
            alerts,
        })
    }

    /// Standalone alert pass over this worker's current open occupancy,
    /// in its own transaction. Rows older than `freshness` are ignored
    /// so a long-dead deployment does not keep alerting.
    pub fn alert_pass(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        backoff: &BackoffConfig,
        freshness: chrono::Duration,
    ) -> Result<AlertCounts> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let snapshot = Self::occupancy_snapshot(&tx, worker_id, Some(now - freshness))
            .context("read occupancy for alerts")?;
        let fired = evaluate(&snapshot, now);
        let counts =
            Self::insert_alerts(&tx, &fired, now, backoff, worker_id).context("insert alerts")?;
        tx.commit().context("commit alert pass")?;
        Ok(counts)
    }

    /// All currently open occupancy intervals, for the
    /// "people currently in zone" consumers.
    pub fn open_intervals(&self) -> Result<Vec<IntervalRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT person_id, is_known, zone_id, from_ts, created_by, updated_by
             FROM occupancy WHERE to_ts IS NULL ORDER BY person_id, is_known",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let from_s: String = row.get(3)?;
            out.push(IntervalRow {
                person: PersonKey::new(row.get(1)?, row.get(0)?),
                zone_id: row.get(2)?,
                from: parse_ts(&from_s)?,
                to: None,
                created_by: row.get(4)?,
                updated_by: row.get(5)?,
            });
        }
        Ok(out)
    }

    /// A person's full interval history, oldest first.
    pub fn intervals_for(&self, person: PersonKey) -> Result<Vec<IntervalRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT zone_id, from_ts, to_ts, created_by, updated_by
             FROM occupancy WHERE person_id = ? AND is_known = ? ORDER BY from_ts ASC",
        )?;
        let mut rows = stmt.query(params![person.id(), person.is_known()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let from_s: String = row.get(1)?;
            let to_s: Option<String> = row.get(2)?;
            out.push(IntervalRow {
                person,
                zone_id: row.get(0)?,
                from: parse_ts(&from_s)?,
                to: to_s.as_deref().map(parse_ts).transpose()?,
                created_by: row.get(3)?,
                updated_by: row.get(4)?,
            });
        }
        Ok(out)
    }

    /// Most recent alerts first, for the alerts API consumer.
    pub fn list_alerts(&self, limit: i64) -> Result<Vec<AlertRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, zone_id, kind, details, person_id, is_known, created_at, worker_id, dismissed
             FROM alerts ORDER BY created_at DESC LIMIT ?",
        )?;
        let mut rows = stmt.query([limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let details_s: String = row.get(3)?;
            let created_s: String = row.get(6)?;
            out.push(AlertRow {
                id: row.get(0)?,
                zone_id: row.get(1)?,
                kind: row.get(2)?,
                details: serde_json::from_str(&details_s).unwrap_or(serde_json::json!({})),
                person: PersonKey::new(row.get(5)?, row.get(4)?),
                created_at: parse_ts(&created_s)?,
                worker_id: row.get(7)?,
                dismissed: row.get(8)?,
            });
        }
        Ok(out)
    }

    // Async wrappers: offload rusqlite work from async executors.

    pub async fn claim_batch_async(
        &self,
        worker_id: &str,
        limit: i64,
    ) -> Result<Vec<DetectionEvent>> {
        let k = self.clone();
        let worker = worker_id.to_string();
        tokio::task::spawn_blocking(move || k.claim_batch(&worker, limit))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn finish_batch_async(
        &self,
        worker_id: &str,
        candidates: BTreeMap<PersonKey, Vec<CandidateInterval>>,
        event_ids: Vec<i64>,
        now: DateTime<Utc>,
        backoff: BackoffConfig,
    ) -> Result<BatchSummary> {
        let k = self.clone();
        let worker = worker_id.to_string();
        tokio::task::spawn_blocking(move || {
            k.finish_batch(&worker, &candidates, &event_ids, now, &backoff)
        })
        .await
        .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn compensate_claim_async(&self, event_ids: Vec<i64>) -> Result<usize> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.compensate_claim(&event_ids))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn alert_pass_async(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        backoff: BackoffConfig,
        freshness: chrono::Duration,
    ) -> Result<AlertCounts> {
        let k = self.clone();
        let worker = worker_id.to_string();
        tokio::task::spawn_blocking(move || k.alert_pass(&worker, now, &backoff, freshness))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }
}
