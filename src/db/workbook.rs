//! Spreadsheet-shaped view of the store: one sheet per entity, one row per stat.
//!
//! Older deployments kept their data in this shape, so it stays importable. Δ columns
//! are derived on export and ignored on import.

use super::Database;
use crate::atomic;
use crate::errors::{AppError, AppResult};
use crate::models::{normalize_entity_id, StatSnapshots};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::Path;

pub const HEADER: [&str; 10] = [
    "label",
    "lifetime",
    "session Δ",
    "session snapshot",
    "daily Δ",
    "daily snapshot",
    "yesterday Δ",
    "yesterday snapshot",
    "monthly Δ",
    "monthly snapshot",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Number(f64),
    Text(String),
    Empty,
}

impl Cell {
    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Text(raw) => raw.trim().replace(',', "").parse::<f64>().ok(),
            Self::Empty => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sheet {
    /// Set when the display name does not fold to the sheet title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub header: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workbook {
    pub sheets: BTreeMap<String, Sheet>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub sheets: usize,
    pub rows: usize,
    pub skipped: Vec<String>,
}

pub fn build_workbook(db: &Database) -> AppResult<Workbook> {
    let meta = db.list_meta()?;
    let mut entity_ids: BTreeSet<String> = meta.keys().cloned().collect();
    entity_ids.extend(db.read_all_with_deltas()?.into_keys());

    let mut workbook = Workbook::default();
    for entity_id in entity_ids {
        let snapshots = db.read_snapshots(&entity_id)?;
        let display_name = meta.get(&entity_id).map(|meta| meta.display_name.trim().to_string());
        // The title is the identity on import; display casing is kept only when it folds back.
        let (title, display_name) = match display_name {
            Some(name) if normalize_entity_id(&name).ok().as_deref() == Some(entity_id.as_str()) => (name, None),
            Some(name) => (entity_id.clone(), Some(name)),
            None => (entity_id.clone(), None),
        };
        let rows = snapshots
            .iter()
            .map(|(stat_name, record)| sheet_row(stat_name, record))
            .collect();
        workbook.sheets.insert(
            title,
            Sheet {
                display_name,
                header: HEADER.iter().map(|column| column.to_string()).collect(),
                rows,
            },
        );
    }
    Ok(workbook)
}

pub fn export_workbook(db: &Database, path: &Path) -> AppResult<usize> {
    let workbook = build_workbook(db)?;
    let written = atomic::write(path, |out| {
        serde_json::to_writer_pretty(out, &workbook).map_err(io::Error::from)
    });
    if !written {
        return Err(AppError::WriteFailure(format!(
            "could not write workbook to {}",
            path.display()
        )));
    }
    tracing::info!(path = %path.display(), sheets = workbook.sheets.len(), "exported workbook");
    Ok(workbook.sheets.len())
}

/// Loads every well-formed sheet; malformed sheets are skipped and named in the summary.
pub fn import_workbook(db: &Database, path: &Path) -> AppResult<ImportSummary> {
    let bytes = fs::read(path)?;
    let workbook: Workbook = serde_json::from_slice(&bytes)
        .map_err(|err| AppError::InvalidInput(format!("workbook {}: {}", path.display(), err)))?;

    let mut titles_by_id: BTreeMap<String, Vec<&String>> = BTreeMap::new();
    for title in workbook.sheets.keys() {
        if let Ok(key) = normalize_entity_id(title) {
            titles_by_id.entry(key).or_default().push(title);
        }
    }

    let mut summary = ImportSummary::default();
    for (title, sheet) in &workbook.sheets {
        let parsed = normalize_entity_id(title).and_then(|key| {
            match titles_by_id.get(&key) {
                Some(titles) if titles.len() > 1 => Err(AppError::InvalidInput(format!(
                    "sheets {:?} all name entity '{}'",
                    titles, key
                ))),
                _ => parse_sheet(sheet),
            }
        });
        let display_name = sheet
            .display_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| title.trim());
        match parsed.and_then(|records| db.load_records(title, display_name, &records)) {
            Ok(rows) => {
                summary.sheets += 1;
                summary.rows += rows;
            }
            Err(error) => {
                tracing::warn!(sheet = %title, error = %error, "skipping workbook sheet");
                summary.skipped.push(title.clone());
            }
        }
    }
    Ok(summary)
}

fn sheet_row(stat_name: &str, record: &StatSnapshots) -> Vec<Cell> {
    let deltas = record.deltas();
    vec![
        Cell::Text(stat_name.to_string()),
        Cell::Number(record.lifetime),
        Cell::Number(deltas.session),
        Cell::Number(record.session),
        Cell::Number(deltas.daily),
        Cell::Number(record.daily),
        Cell::Number(deltas.yesterday),
        Cell::Number(record.yesterday),
        Cell::Number(deltas.monthly),
        Cell::Number(record.monthly),
    ]
}

fn parse_sheet(sheet: &Sheet) -> AppResult<BTreeMap<String, StatSnapshots>> {
    let header_matches = sheet.header.len() == HEADER.len()
        && sheet
            .header
            .iter()
            .zip(HEADER.iter())
            .all(|(found, expected)| normalize_column(found) == normalize_column(expected));
    if !header_matches {
        return Err(AppError::InvalidInput(format!(
            "unexpected header {:?}",
            sheet.header
        )));
    }

    let mut records = BTreeMap::new();
    for (index, row) in sheet.rows.iter().enumerate() {
        let label = match row.first() {
            Some(Cell::Text(label)) if !label.trim().is_empty() => label.trim().to_string(),
            _ => return Err(AppError::InvalidInput(format!("row {} has no label", index + 1))),
        };
        let lifetime = row
            .get(1)
            .and_then(Cell::as_number)
            .ok_or_else(|| AppError::InvalidInput(format!("row '{}' has no lifetime value", label)))?;
        let snapshot = |column: usize| row.get(column).and_then(Cell::as_number).unwrap_or(0.0);
        records.insert(
            label,
            StatSnapshots {
                lifetime,
                session: snapshot(3),
                daily: snapshot(5),
                yesterday: snapshot(7),
                monthly: snapshot(9),
            },
        );
    }
    Ok(records)
}

fn normalize_column(raw: &str) -> String {
    raw.trim().to_lowercase().replace("delta", "δ").replace('Δ', "δ")
}

#[cfg(test)]
mod tests {
    use super::{export_workbook, import_workbook, Cell, Sheet, Workbook, HEADER};
    use crate::db::Database;
    use crate::errors::AppError;
    use crate::models::{MetaUpdate, Period};
    use std::collections::{BTreeMap, BTreeSet};

    fn seeded(dir: &tempfile::TempDir, name: &str) -> Database {
        Database::new(&dir.path().join(name)).expect("db")
    }

    #[test]
    fn exported_workbook_reloads_into_identical_snapshots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = seeded(&dir, "source.sqlite");
        let mut stats = BTreeMap::new();
        stats.insert("kills".to_string(), 100.0);
        source.ingest("Alice", &stats, &BTreeSet::new(), None).expect("ingest");
        stats.insert("kills".to_string(), 130.0);
        let daily: BTreeSet<Period> = [Period::Daily].into_iter().collect();
        source.ingest("Alice", &stats, &daily, None).expect("daily ingest");

        let path = dir.path().join("export").join("workbook.json");
        assert_eq!(export_workbook(&source, &path).expect("export"), 1);

        let target = seeded(&dir, "target.sqlite");
        let summary = import_workbook(&target, &path).expect("import");
        assert_eq!(summary.sheets, 1);
        assert_eq!(summary.rows, 1);
        assert!(summary.skipped.is_empty());
        assert_eq!(
            target.read_snapshots("alice").expect("target"),
            source.read_snapshots("alice").expect("source")
        );
        assert_eq!(
            target.get_meta("alice").expect("meta").expect("exists").display_name,
            "Alice"
        );
    }

    #[test]
    fn legacy_sheet_with_text_cells_and_gaps_loads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = seeded(&dir, "stats.sqlite");
        let mut legacy_header: Vec<String> = HEADER.iter().map(|column| column.to_string()).collect();
        legacy_header[2] = "Session Delta".to_string();

        let mut sheets = BTreeMap::new();
        sheets.insert(
            "Bob".to_string(),
            Sheet {
                display_name: None,
                header: legacy_header,
                rows: vec![vec![
                    Cell::Text("kills".to_string()),
                    Cell::Text("1,250".to_string()),
                    Cell::Empty,
                    Cell::Number(1200.0),
                    Cell::Empty,
                    Cell::Number(1240.0),
                ]],
            },
        );
        sheets.insert(
            "Broken".to_string(),
            Sheet {
                display_name: None,
                header: vec!["label".to_string()],
                rows: vec![],
            },
        );
        let path = dir.path().join("legacy.json");
        std::fs::write(&path, serde_json::to_vec(&Workbook { sheets }).expect("encode")).expect("write");

        let summary = import_workbook(&db, &path).expect("import");
        assert_eq!(summary.skipped, vec!["Broken".to_string()]);

        let line = db.read_with_deltas("bob").expect("read")["kills"];
        assert_eq!(line.lifetime, 1250.0);
        assert_eq!(line.session, 50.0);
        assert_eq!(line.daily, 10.0);
        assert_eq!(line.yesterday, 1250.0);
    }

    #[test]
    fn renamed_player_keeps_its_own_records_through_export() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = seeded(&dir, "source.sqlite");
        let mut stats = BTreeMap::new();
        stats.insert("kills".to_string(), 10.0);
        let renamed = MetaUpdate {
            display_name: Some("Bob".to_string()),
            fields: None,
        };
        source
            .ingest("alice", &stats, &BTreeSet::new(), Some(&renamed))
            .expect("ingest alice");
        stats.insert("kills".to_string(), 99.0);
        source.ingest("bob", &stats, &BTreeSet::new(), None).expect("ingest bob");

        let path = dir.path().join("workbook.json");
        assert_eq!(export_workbook(&source, &path).expect("export"), 2);

        let target = seeded(&dir, "target.sqlite");
        let summary = import_workbook(&target, &path).expect("import");
        assert_eq!(summary.sheets, 2);
        assert!(summary.skipped.is_empty());
        assert_eq!(target.read_with_deltas("alice").expect("alice")["kills"].lifetime, 10.0);
        assert_eq!(target.read_with_deltas("bob").expect("bob")["kills"].lifetime, 99.0);
        assert_eq!(
            target.get_meta("alice").expect("meta").expect("exists").display_name,
            "Bob"
        );
    }

    #[test]
    fn titles_folding_to_one_entity_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = seeded(&dir, "stats.sqlite");
        let sheet = |lifetime: f64| Sheet {
            display_name: None,
            header: HEADER.iter().map(|column| column.to_string()).collect(),
            rows: vec![vec![Cell::Text("kills".to_string()), Cell::Number(lifetime)]],
        };
        let mut sheets = BTreeMap::new();
        sheets.insert("Cara".to_string(), sheet(1.0));
        sheets.insert("cara".to_string(), sheet(2.0));
        sheets.insert("dane".to_string(), sheet(3.0));
        let path = dir.path().join("clash.json");
        std::fs::write(&path, serde_json::to_vec(&Workbook { sheets }).expect("encode")).expect("write");

        let summary = import_workbook(&db, &path).expect("import");
        assert_eq!(summary.sheets, 1);
        assert_eq!(summary.skipped, vec!["Cara".to_string(), "cara".to_string()]);
        assert!(db.read_with_deltas("cara").expect("read").is_empty());
        assert_eq!(db.read_with_deltas("dane").expect("read")["kills"].lifetime, 3.0);
    }

    #[test]
    fn unwritable_target_reports_write_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = seeded(&dir, "stats.sqlite");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").expect("write blocker");

        let result = export_workbook(&db, &blocker.join("workbook.json"));
        assert!(matches!(result, Err(AppError::WriteFailure(_))));
    }
}
