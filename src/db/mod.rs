pub mod migrations;
pub mod workbook;

use crate::errors::{AppError, AppResult};
use crate::models::{normalize_entity_id, EntityMeta, MetaUpdate, Period, StatSheet, StatSnapshots};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const REVISION_KEY: &str = "revision";

/// Result of one committed ingest: the entity's fresh projection and the revision it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Ingested {
    pub stats: StatSheet,
    pub revision: u64,
}

/// Everything the cache needs for a rebuild, read under one connection lock.
#[derive(Debug, Clone, Default)]
pub struct StoreProjection {
    pub stats: BTreeMap<String, StatSheet>,
    pub meta: BTreeMap<String, EntityMeta>,
    pub revision: u64,
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    revision: AtomicU64,
}

impl Database {
    /// Opens the store, quarantining an unreadable file and starting fresh in its place.
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }

        let conn = match open_connection(path) {
            Ok(conn) => conn,
            Err(AppError::CorruptStore(reason)) => {
                let quarantined = quarantine_corrupt_store(path)?;
                tracing::error!(
                    path = %path.display(),
                    quarantined = %quarantined.display(),
                    reason = %reason,
                    "store unreadable; moved aside and starting empty"
                );
                open_connection(path)?
            }
            Err(error) => return Err(error),
        };

        let revision = read_revision(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
            revision: AtomicU64::new(revision),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Monotonic marker bumped by every committed mutation through this handle.
    pub fn version(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    // ─── Stat Records ────────────────────────────────────────────────────

    /// The single mutation entry point for lifetime values. All stats and the meta row
    /// for one call commit together or not at all.
    pub fn ingest(
        &self,
        entity_id: &str,
        stats: &BTreeMap<String, f64>,
        reset_periods: &BTreeSet<Period>,
        meta: Option<&MetaUpdate>,
    ) -> AppResult<Ingested> {
        let key = normalize_entity_id(entity_id)?;
        let now = Utc::now().to_rfc3339();
        let reset = |period: Period| reset_periods.contains(&period);

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO stat_records (
                   entity_id, stat_name, lifetime,
                   session_snapshot, daily_snapshot, yesterday_snapshot, monthly_snapshot, updated_at
                 ) VALUES (?1, ?2, ?3, ?3, ?3, ?3, ?3, ?4)
                 ON CONFLICT(entity_id, stat_name) DO UPDATE SET
                   lifetime = excluded.lifetime,
                   session_snapshot = CASE WHEN ?5 THEN excluded.lifetime ELSE session_snapshot END,
                   daily_snapshot = CASE WHEN ?6 THEN excluded.lifetime ELSE daily_snapshot END,
                   yesterday_snapshot = CASE WHEN ?7 THEN excluded.lifetime ELSE yesterday_snapshot END,
                   monthly_snapshot = CASE WHEN ?8 THEN excluded.lifetime ELSE monthly_snapshot END,
                   updated_at = excluded.updated_at",
            )?;
            for (stat_name, value) in stats {
                if !value.is_finite() {
                    return Err(AppError::InvalidInput(format!(
                        "stat '{}' for '{}' is not a finite number",
                        stat_name, key
                    )));
                }
                stmt.execute(params![
                    key,
                    stat_name,
                    value,
                    now,
                    reset(Period::Session),
                    reset(Period::Daily),
                    reset(Period::Yesterday),
                    reset(Period::Monthly),
                ])?;
            }
        }

        let display_name = meta
            .and_then(|update| update.display_name.clone())
            .unwrap_or_else(|| entity_id.trim().to_string());
        upsert_meta(&tx, &key, &display_name, meta, &now)?;

        let stats = read_sheet(&tx, &key)?;
        let revision = bump_revision(&tx)?;
        tx.commit()?;
        self.revision.store(revision, Ordering::SeqCst);
        Ok(Ingested { stats, revision })
    }

    pub fn read_with_deltas(&self, entity_id: &str) -> AppResult<StatSheet> {
        let key = normalize_entity_id(entity_id)?;
        let conn = self.lock_conn()?;
        read_sheet(&conn, &key)
    }

    pub fn read_snapshots(&self, entity_id: &str) -> AppResult<BTreeMap<String, StatSnapshots>> {
        let key = normalize_entity_id(entity_id)?;
        let conn = self.lock_conn()?;
        read_snapshot_rows(&conn, &key)
    }

    pub fn read_all_with_deltas(&self) -> AppResult<BTreeMap<String, StatSheet>> {
        let conn = self.lock_conn()?;
        read_all_sheets(&conn)
    }

    pub fn load_projection(&self) -> AppResult<StoreProjection> {
        let conn = self.lock_conn()?;
        Ok(StoreProjection {
            stats: read_all_sheets(&conn)?,
            meta: read_all_meta(&conn)?,
            revision: self.version(),
        })
    }

    /// Copies `from` into `to` for every stat of every listed entity; nothing else moves.
    pub fn rotate(&self, entity_ids: &[String], from: Period, to: Period) -> AppResult<usize> {
        if from == to {
            return Ok(0);
        }
        let keys = entity_ids
            .iter()
            .map(|id| normalize_entity_id(id))
            .collect::<AppResult<BTreeSet<_>>>()?;

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut touched = 0usize;
        {
            let sql = format!(
                "UPDATE stat_records SET {} = {} WHERE entity_id = ?1",
                to.snapshot_column(),
                from.snapshot_column()
            );
            let mut stmt = tx.prepare(&sql)?;
            for key in &keys {
                touched += stmt.execute([key])?;
            }
        }
        let revision = bump_revision(&tx)?;
        tx.commit()?;
        self.revision.store(revision, Ordering::SeqCst);

        tracing::info!(
            entities = keys.len(),
            rows = touched,
            from = from.as_str(),
            to = to.as_str(),
            "rotated period snapshots"
        );
        Ok(touched)
    }

    /// Removes stats, meta and tracked membership for one entity in one transaction.
    pub fn delete_entity(&self, entity_id: &str) -> AppResult<bool> {
        let key = normalize_entity_id(entity_id)?;
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut removed = tx.execute("DELETE FROM stat_records WHERE entity_id = ?1", [&key])?;
        removed += tx.execute("DELETE FROM entity_meta WHERE entity_id = ?1", [&key])?;
        removed += tx.execute("DELETE FROM tracked_entities WHERE entity_id = ?1", [&key])?;
        let revision = bump_revision(&tx)?;
        tx.commit()?;
        self.revision.store(revision, Ordering::SeqCst);
        Ok(removed > 0)
    }

    /// Writes stored snapshots verbatim (workbook import); unlike `ingest`, baselines are not reset.
    pub fn load_records(
        &self,
        entity_id: &str,
        display_name: &str,
        records: &BTreeMap<String, StatSnapshots>,
    ) -> AppResult<usize> {
        let key = normalize_entity_id(entity_id)?;
        let now = Utc::now().to_rfc3339();
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO stat_records (
                   entity_id, stat_name, lifetime,
                   session_snapshot, daily_snapshot, yesterday_snapshot, monthly_snapshot, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(entity_id, stat_name) DO UPDATE SET
                   lifetime = excluded.lifetime,
                   session_snapshot = excluded.session_snapshot,
                   daily_snapshot = excluded.daily_snapshot,
                   yesterday_snapshot = excluded.yesterday_snapshot,
                   monthly_snapshot = excluded.monthly_snapshot,
                   updated_at = excluded.updated_at",
            )?;
            for (stat_name, record) in records {
                stmt.execute(params![
                    key,
                    stat_name,
                    record.lifetime,
                    record.session,
                    record.daily,
                    record.yesterday,
                    record.monthly,
                    now,
                ])?;
            }
        }
        let update = MetaUpdate {
            display_name: Some(display_name.to_string()),
            fields: None,
        };
        upsert_meta(&tx, &key, display_name, Some(&update), &now)?;
        let revision = bump_revision(&tx)?;
        tx.commit()?;
        self.revision.store(revision, Ordering::SeqCst);
        Ok(records.len())
    }

    // ─── Entity Meta ─────────────────────────────────────────────────────

    pub fn get_meta(&self, entity_id: &str) -> AppResult<Option<EntityMeta>> {
        let key = normalize_entity_id(entity_id)?;
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT entity_id, display_name, fields_json, created_at, updated_at
             FROM entity_meta WHERE entity_id = ?1",
            [&key],
            parse_meta_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_meta(&self) -> AppResult<BTreeMap<String, EntityMeta>> {
        let conn = self.lock_conn()?;
        read_all_meta(&conn)
    }

    // ─── Tracked Set ─────────────────────────────────────────────────────

    pub fn track(&self, entity_id: &str) -> AppResult<bool> {
        let key = normalize_entity_id(entity_id)?;
        let conn = self.lock_conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO tracked_entities (entity_id, added_at) VALUES (?1, ?2)",
            params![key, Utc::now().to_rfc3339()],
        )?;
        Ok(inserted > 0)
    }

    pub fn untrack(&self, entity_id: &str) -> AppResult<bool> {
        let key = normalize_entity_id(entity_id)?;
        let conn = self.lock_conn()?;
        let removed = conn.execute("DELETE FROM tracked_entities WHERE entity_id = ?1", [&key])?;
        Ok(removed > 0)
    }

    pub fn is_tracked(&self, entity_id: &str) -> AppResult<bool> {
        let key = normalize_entity_id(entity_id)?;
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM tracked_entities WHERE entity_id = ?1",
            [&key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn tracked_entities(&self) -> AppResult<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT entity_id FROM tracked_entities ORDER BY entity_id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // ─── Store Meta ──────────────────────────────────────────────────────

    pub fn get_store_value(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.lock_conn()?;
        conn.query_row("SELECT value FROM store_meta WHERE key = ?1", [key], |row| row.get(0))
            .optional()
            .map_err(AppError::from)
    }

    pub fn set_store_value(&self, key: &str, value: &str) -> AppResult<()> {
        if key == REVISION_KEY {
            return Err(AppError::InvalidInput("revision is managed by the store".to_string()));
        }
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO store_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn lock_conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }
}

fn open_connection(path: &Path) -> AppResult<Connection> {
    let mut conn = Connection::open(path).map_err(AppError::from)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    let check: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    if check != "ok" {
        return Err(AppError::CorruptStore(check));
    }
    migrations::run_migrations(&mut conn)?;
    Ok(conn)
}

fn quarantine_corrupt_store(path: &Path) -> AppResult<PathBuf> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S");
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "store".to_string());
    let quarantined_name = format!("{}.corrupt-{}", file_name, stamp);
    let quarantined = path.with_file_name(&quarantined_name);
    fs::rename(path, &quarantined).map_err(|err| AppError::Io(err.to_string()))?;

    let journal = path.with_file_name(format!("{}-journal", file_name));
    if journal.exists() {
        let _ = fs::rename(&journal, path.with_file_name(format!("{}-journal", quarantined_name)));
    }
    Ok(quarantined)
}

fn read_revision(conn: &Connection) -> AppResult<u64> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM store_meta WHERE key = ?1", [REVISION_KEY], |row| row.get(0))
        .optional()?;
    Ok(raw.and_then(|value| value.parse::<u64>().ok()).unwrap_or(0))
}

fn bump_revision(tx: &Transaction<'_>) -> AppResult<u64> {
    let next = read_revision(tx)? + 1;
    tx.execute(
        "INSERT INTO store_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![REVISION_KEY, next.to_string()],
    )?;
    Ok(next)
}

fn upsert_meta(
    conn: &Connection,
    key: &str,
    display_name: &str,
    update: Option<&MetaUpdate>,
    now: &str,
) -> AppResult<()> {
    let fields_json = match update.and_then(|update| update.fields.as_ref()) {
        Some(fields) => Some(serde_json::to_string(fields)?),
        None => None,
    };
    let override_name = update.and_then(|update| update.display_name.as_deref());
    conn.execute(
        "INSERT INTO entity_meta (entity_id, display_name, fields_json, created_at, updated_at)
         VALUES (?1, ?2, COALESCE(?3, '{}'), ?4, ?4)
         ON CONFLICT(entity_id) DO UPDATE SET
           display_name = COALESCE(?5, entity_meta.display_name),
           fields_json = COALESCE(?3, entity_meta.fields_json),
           updated_at = excluded.updated_at",
        params![key, display_name, fields_json, now, override_name],
    )?;
    Ok(())
}

fn read_snapshot_rows(conn: &Connection, key: &str) -> AppResult<BTreeMap<String, StatSnapshots>> {
    let mut stmt = conn.prepare_cached(
        "SELECT stat_name, lifetime,
                COALESCE(session_snapshot, 0), COALESCE(daily_snapshot, 0),
                COALESCE(yesterday_snapshot, 0), COALESCE(monthly_snapshot, 0)
         FROM stat_records WHERE entity_id = ?1",
    )?;
    let rows = stmt.query_map([key], |row| Ok((row.get::<_, String>(0)?, parse_snapshots(row, 1)?)))?;
    let mut result = BTreeMap::new();
    for row in rows {
        let (stat_name, snapshots) = row?;
        result.insert(stat_name, snapshots);
    }
    Ok(result)
}

fn read_sheet(conn: &Connection, key: &str) -> AppResult<StatSheet> {
    Ok(read_snapshot_rows(conn, key)?
        .into_iter()
        .map(|(stat_name, snapshots)| (stat_name, snapshots.deltas()))
        .collect())
}

fn read_all_sheets(conn: &Connection) -> AppResult<BTreeMap<String, StatSheet>> {
    let mut stmt = conn.prepare_cached(
        "SELECT entity_id, stat_name, lifetime,
                COALESCE(session_snapshot, 0), COALESCE(daily_snapshot, 0),
                COALESCE(yesterday_snapshot, 0), COALESCE(monthly_snapshot, 0)
         FROM stat_records",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            parse_snapshots(row, 2)?,
        ))
    })?;
    let mut result: BTreeMap<String, StatSheet> = BTreeMap::new();
    for row in rows {
        let (entity_id, stat_name, snapshots) = row?;
        result
            .entry(entity_id)
            .or_default()
            .insert(stat_name, snapshots.deltas());
    }
    Ok(result)
}

fn read_all_meta(conn: &Connection) -> AppResult<BTreeMap<String, EntityMeta>> {
    let mut stmt = conn.prepare_cached(
        "SELECT entity_id, display_name, fields_json, created_at, updated_at FROM entity_meta",
    )?;
    let rows = stmt.query_map([], parse_meta_row)?;
    let mut result = BTreeMap::new();
    for row in rows {
        let meta = row?;
        result.insert(meta.entity_id.clone(), meta);
    }
    Ok(result)
}

fn parse_snapshots(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<StatSnapshots> {
    Ok(StatSnapshots {
        lifetime: row.get(offset)?,
        session: row.get(offset + 1)?,
        daily: row.get(offset + 2)?,
        yesterday: row.get(offset + 3)?,
        monthly: row.get(offset + 4)?,
    })
}

fn parse_meta_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityMeta> {
    let fields_raw: String = row.get(2)?;
    let fields = serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&fields_raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(err)))?;
    Ok(EntityMeta {
        entity_id: row.get(0)?,
        display_name: row.get(1)?,
        fields,
        created_at: parse_time(&row.get::<_, String>(3)?)?,
        updated_at: parse_time(&row.get::<_, String>(4)?)?,
    })
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err)))
}

#[cfg(test)]
mod tests {
    use super::Database;
    use crate::errors::AppError;
    use crate::models::{MetaUpdate, Period};
    use std::collections::{BTreeMap, BTreeSet};

    fn open(dir: &tempfile::TempDir) -> Database {
        Database::new(&dir.path().join("stats.sqlite")).expect("db")
    }

    fn stats(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(name, value)| (name.to_string(), *value)).collect()
    }

    fn periods(list: &[Period]) -> BTreeSet<Period> {
        list.iter().copied().collect()
    }

    #[test]
    fn first_ingest_starts_every_delta_at_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);

        db.ingest("alice", &stats(&[("kills", 100.0), ("deaths", 40.0)]), &BTreeSet::new(), None)
            .expect("ingest");
        let sheet = db.read_with_deltas("alice").expect("read");

        assert_eq!(sheet["kills"].lifetime, 100.0);
        for line in sheet.values() {
            for period in Period::ALL {
                assert_eq!(line.delta(period), 0.0);
            }
        }
    }

    #[test]
    fn daily_reset_leaves_other_baselines_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);

        db.ingest("alice", &stats(&[("kills", 100.0)]), &BTreeSet::new(), None)
            .expect("first ingest");
        db.ingest("alice", &stats(&[("kills", 110.0)]), &BTreeSet::new(), None)
            .expect("non-resetting ingest");
        let sheet = db
            .ingest("alice", &stats(&[("kills", 130.0)]), &periods(&[Period::Daily]), None)
            .expect("daily ingest")
            .stats;

        let kills = sheet["kills"];
        assert_eq!(kills.lifetime, 130.0);
        assert_eq!(kills.daily, 0.0);
        assert_eq!(kills.session, 30.0);
        assert_eq!(kills.yesterday, 30.0);
        assert_eq!(kills.monthly, 30.0);

        let raw = db.read_snapshots("alice").expect("snapshots");
        assert_eq!(raw["kills"].daily, 130.0);
        assert_eq!(raw["kills"].session, 100.0);
    }

    #[test]
    fn rotation_hands_daily_to_yesterday() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let daily = periods(&[Period::Daily]);

        db.ingest("alice", &stats(&[("kills", 100.0)]), &BTreeSet::new(), None)
            .expect("ingest");
        db.ingest("alice", &stats(&[("kills", 130.0)]), &daily, None)
            .expect("daily ingest");
        db.ingest("bob", &stats(&[("kills", 5.0)]), &BTreeSet::new(), None)
            .expect("bob ingest");
        db.ingest("bob", &stats(&[("kills", 9.0)]), &daily, None)
            .expect("bob daily ingest");

        let touched = db
            .rotate(&["alice".to_string()], Period::Daily, Period::Yesterday)
            .expect("rotate");
        assert_eq!(touched, 1);

        let raw = db.read_snapshots("alice").expect("snapshots");
        assert_eq!(raw["kills"].yesterday, 130.0);
        assert_eq!(raw["kills"].daily, 130.0);
        assert_eq!(raw["kills"].session, 100.0);
        assert_eq!(raw["kills"].lifetime, 130.0);
        assert_eq!(db.read_snapshots("bob").expect("bob")["kills"].yesterday, 5.0);

        let sheet = db
            .ingest("alice", &stats(&[("kills", 150.0)]), &daily, None)
            .expect("next day ingest")
            .stats;
        assert_eq!(sheet["kills"].yesterday, 20.0);
        assert_eq!(sheet["kills"].daily, 0.0);
    }

    #[test]
    fn failed_ingest_commits_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        db.ingest("bob", &stats(&[("kills", 10.0), ("wins", 1.0)]), &BTreeSet::new(), None)
            .expect("seed");
        let before = db.read_with_deltas("bob").expect("before");
        let version_before = db.version();

        // "kills" sorts ahead of the oversize name, so its update runs before the fault.
        let oversize = "z".repeat(80);
        let result = db.ingest(
            "bob",
            &stats(&[("kills", 99.0), ("wins", 50.0), (oversize.as_str(), 1.0)]),
            &periods(&[Period::Daily]),
            None,
        );
        assert!(matches!(result, Err(AppError::InvalidInput(_))));

        assert_eq!(db.read_with_deltas("bob").expect("after"), before);
        assert_eq!(db.version(), version_before);
    }

    #[test]
    fn non_finite_values_are_rejected_atomically() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let result = db.ingest("bob", &stats(&[("a", 1.0), ("b", f64::NAN)]), &BTreeSet::new(), None);
        assert!(result.is_err());
        assert!(db.read_with_deltas("bob").expect("read").is_empty());
        assert!(db.get_meta("bob").expect("meta").is_none());
    }

    #[test]
    fn entity_ids_are_case_insensitive_but_display_casing_is_kept() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        db.ingest("Alice", &stats(&[("kills", 1.0)]), &BTreeSet::new(), None)
            .expect("ingest");

        assert_eq!(db.read_with_deltas("ALICE").expect("read")["kills"].lifetime, 1.0);
        let meta = db.get_meta("alice").expect("meta").expect("meta exists");
        assert_eq!(meta.entity_id, "alice");
        assert_eq!(meta.display_name, "Alice");
    }

    #[test]
    fn meta_fields_pass_through_and_survive_plain_ingests() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let mut fields = serde_json::Map::new();
        fields.insert("rank".to_string(), serde_json::json!("MVP+"));
        let update = MetaUpdate {
            display_name: Some("ALiCe".to_string()),
            fields: Some(fields.clone()),
        };

        db.ingest("alice", &stats(&[("kills", 1.0)]), &BTreeSet::new(), Some(&update))
            .expect("ingest with meta");
        db.ingest("alice", &stats(&[("kills", 2.0)]), &BTreeSet::new(), None)
            .expect("plain ingest");

        let meta = db.get_meta("alice").expect("meta").expect("exists");
        assert_eq!(meta.display_name, "ALiCe");
        assert_eq!(meta.fields, fields);
    }

    #[test]
    fn delete_entity_removes_everything_for_that_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        db.ingest("alice", &stats(&[("kills", 1.0)]), &BTreeSet::new(), None)
            .expect("alice");
        db.ingest("bob", &stats(&[("kills", 2.0)]), &BTreeSet::new(), None)
            .expect("bob");
        db.track("alice").expect("track");

        assert!(db.delete_entity("Alice").expect("delete"));
        assert!(db.read_with_deltas("alice").expect("read").is_empty());
        assert!(db.get_meta("alice").expect("meta").is_none());
        assert!(!db.is_tracked("alice").expect("tracked"));
        assert_eq!(db.read_with_deltas("bob").expect("bob")["kills"].lifetime, 2.0);
        assert!(!db.delete_entity("alice").expect("second delete"));
    }

    #[test]
    fn tracked_set_is_independent_of_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        assert!(db.track("Carol").expect("track"));
        assert!(!db.track("carol").expect("track twice"));
        db.ingest("dave", &stats(&[("kills", 1.0)]), &BTreeSet::new(), None)
            .expect("on-demand ingest");

        assert_eq!(db.tracked_entities().expect("list"), vec!["carol".to_string()]);
        assert!(db.untrack("CAROL").expect("untrack"));
        assert!(db.tracked_entities().expect("list").is_empty());
    }

    #[test]
    fn missing_snapshots_read_as_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        {
            let conn = db.conn.lock().expect("conn");
            conn.execute(
                "INSERT INTO stat_records (entity_id, stat_name, lifetime, updated_at)
                 VALUES ('erin', 'kills', 42.0, '2024-01-01T00:00:00Z')",
                [],
            )
            .expect("insert bare row");
        }
        let line = db.read_with_deltas("erin").expect("read")["kills"];
        assert_eq!(line.daily, 42.0);
        assert_eq!(line.monthly, 42.0);
    }

    #[test]
    fn version_moves_on_writes_only_and_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stats.sqlite");
        let db = Database::new(&path).expect("db");
        let start = db.version();

        db.ingest("alice", &stats(&[("kills", 1.0)]), &BTreeSet::new(), None)
            .expect("ingest");
        db.read_with_deltas("alice").expect("read");
        db.track("alice").expect("track");
        assert_eq!(db.version(), start + 1);
        drop(db);

        let reopened = Database::new(&path).expect("reopen");
        assert_eq!(reopened.version(), start + 1);
    }

    #[test]
    fn corrupt_file_is_moved_aside_and_store_starts_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stats.sqlite");
        std::fs::write(&path, vec![0x5a_u8; 4096]).expect("write garbage");

        let db = Database::new(&path).expect("recovered db");
        assert!(db.read_all_with_deltas().expect("read").is_empty());

        let quarantined = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".corrupt-"))
            .count();
        assert_eq!(quarantined, 1);
    }

    #[test]
    fn legacy_string_meta_is_structured_once_on_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stats.sqlite");
        {
            let conn = rusqlite::Connection::open(&path).expect("raw conn");
            conn.execute_batch(
                "CREATE TABLE entity_meta (
                   entity_id TEXT PRIMARY KEY,
                   display_name TEXT NOT NULL,
                   fields_json TEXT NOT NULL DEFAULT '{}',
                   created_at TEXT NOT NULL,
                   updated_at TEXT NOT NULL
                 );
                 INSERT INTO entity_meta VALUES ('alice', 'Alice', '\"[MVP+]\"', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z');
                 INSERT INTO entity_meta VALUES ('bob', 'Bob', 'VIP', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z');
                 INSERT INTO entity_meta VALUES ('carol', 'Carol', '{\"rank\":\"MVP\"}', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z');",
            )
            .expect("legacy schema");
        }

        let db = Database::new(&path).expect("db");
        let meta = db.list_meta().expect("meta");
        assert_eq!(meta["alice"].fields["label"], serde_json::json!("[MVP+]"));
        assert_eq!(meta["bob"].fields["label"], serde_json::json!("VIP"));
        assert_eq!(meta["carol"].fields["rank"], serde_json::json!("MVP"));
        assert!(!meta["carol"].fields.contains_key("label"));
    }

    #[test]
    fn store_values_round_trip_but_revision_is_protected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        db.set_store_value("last_cycle_at", "2024-03-01T00:00:00Z").expect("set");
        assert_eq!(
            db.get_store_value("last_cycle_at").expect("get").as_deref(),
            Some("2024-03-01T00:00:00Z")
        );
        assert!(db.set_store_value("revision", "0").is_err());
    }
}
