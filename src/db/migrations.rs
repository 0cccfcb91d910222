use crate::errors::AppResult;
use rusqlite::{params, Connection, Transaction};
use serde_json::{json, Value};

pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    apply: fn(&Transaction<'_>) -> AppResult<()>,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "stat records, entity meta, tracked set, store meta",
        apply: create_core_tables,
    },
    Migration {
        version: 2,
        description: "structure legacy string-shaped entity meta",
        apply: structure_legacy_meta,
    },
];

pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|migration| migration.version).unwrap_or(0)
}

/// Applies each pending migration in its own transaction, recording progress in `user_version`.
pub fn run_migrations(conn: &mut Connection) -> AppResult<i64> {
    let mut current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        (migration.apply)(&tx)?;
        tx.pragma_update(None, "user_version", migration.version)?;
        tx.commit()?;
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "applied store migration"
        );
        current = migration.version;
    }
    Ok(current)
}

fn create_core_tables(tx: &Transaction<'_>) -> AppResult<()> {
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS stat_records (
           entity_id TEXT NOT NULL,
           stat_name TEXT NOT NULL CHECK (length(stat_name) BETWEEN 1 AND 64),
           lifetime REAL NOT NULL,
           session_snapshot REAL,
           daily_snapshot REAL,
           yesterday_snapshot REAL,
           monthly_snapshot REAL,
           updated_at TEXT NOT NULL,
           PRIMARY KEY (entity_id, stat_name)
         );
         CREATE TABLE IF NOT EXISTS entity_meta (
           entity_id TEXT PRIMARY KEY,
           display_name TEXT NOT NULL,
           fields_json TEXT NOT NULL DEFAULT '{}',
           created_at TEXT NOT NULL,
           updated_at TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS tracked_entities (
           entity_id TEXT PRIMARY KEY,
           added_at TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS store_meta (
           key TEXT PRIMARY KEY,
           value TEXT NOT NULL
         );
         INSERT OR IGNORE INTO store_meta (key, value) VALUES ('revision', '0');",
    )?;
    Ok(())
}

/// Older builds kept a single display tag as a bare string in `fields_json`.
fn structure_legacy_meta(tx: &Transaction<'_>) -> AppResult<()> {
    let mut stmt = tx.prepare("SELECT entity_id, fields_json FROM entity_meta")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    let mut converted = 0usize;
    for (entity_id, raw) in rows {
        let structured = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(_)) => continue,
            Ok(Value::Null) => json!({}),
            Ok(Value::String(label)) => json!({ "label": label }),
            Ok(other) => json!({ "label": other }),
            Err(_) if raw.trim().is_empty() => json!({}),
            Err(_) => json!({ "label": raw }),
        };
        tx.execute(
            "UPDATE entity_meta SET fields_json = ?1 WHERE entity_id = ?2",
            params![structured.to_string(), entity_id],
        )?;
        converted += 1;
    }

    if converted > 0 {
        tracing::info!(count = converted, "converted legacy entity meta rows");
    }
    Ok(())
}
