use crate::cache::{CacheMap, StatsCache};
use crate::config::TrackerConfig;
use crate::db::workbook::{self, ImportSummary};
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::lock::StoreLock;
use crate::models::{normalize_entity_id, CacheEntry, CycleReport, CycleState, Period, RefreshRequest};
use crate::orchestrator::{LockSettings, Orchestrator, StatsSource};
use crate::schedule::{offset_from_minutes, RefreshScheduler};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Entry point that owns the store, cache, orchestrator and scheduler for one data directory.
#[derive(Clone)]
pub struct StatTracker {
    config: TrackerConfig,
    db: Arc<Database>,
    cache: Arc<StatsCache>,
    orchestrator: Orchestrator,
    scheduler: RefreshScheduler,
}

impl StatTracker {
    pub fn open(config: TrackerConfig, source: Arc<dyn StatsSource>) -> AppResult<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        let db = Arc::new(Database::new(&config.database_path())?);
        let cache = Arc::new(StatsCache::new(Arc::clone(&db)));
        let orchestrator = Orchestrator::new(
            Arc::clone(&db),
            Arc::clone(&cache),
            source,
            StoreLock::new(config.lock_dir(), config.lock_poll_interval()),
            LockSettings {
                timeout: config.lock_timeout(),
                stale_after: config.lock_stale_after(),
            },
        );
        let scheduler = RefreshScheduler::new(
            orchestrator.clone(),
            Arc::clone(&db),
            config.refresh_interval(),
            offset_from_minutes(config.utc_offset_minutes)?,
        );

        tracing::info!(
            database = %config.database_path().display(),
            revision = db.version(),
            "stat tracker opened"
        );
        Ok(Self {
            config,
            db,
            cache,
            orchestrator,
            scheduler,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.scheduler
    }

    /// Spawns the periodic refresh loop on the current tokio runtime.
    pub fn start(&self) -> JoinHandle<()> {
        self.scheduler.start()
    }

    pub fn track(&self, entity_id: &str) -> AppResult<bool> {
        self.db.track(entity_id)
    }

    pub fn untrack(&self, entity_id: &str) -> AppResult<bool> {
        self.db.untrack(entity_id)
    }

    pub fn tracked(&self) -> AppResult<Vec<String>> {
        self.db.tracked_entities()
    }

    pub fn view(&self, entity_id: &str) -> AppResult<Option<CacheEntry>> {
        self.cache.get(entity_id)
    }

    pub fn all(&self) -> AppResult<Arc<CacheMap>> {
        self.cache.get_all()
    }

    /// Fetches one entity on demand, tracked or not. A failed fetch falls back to the last
    /// stored values when there are any.
    pub async fn lookup(&self, entity_id: &str) -> AppResult<CacheEntry> {
        let key = normalize_entity_id(entity_id)?;
        let report = self
            .orchestrator
            .run_cycle(narrow_request(&key, BTreeSet::new()))
            .await;

        if let Some(entry) = self.cache.get(&key)? {
            if report_error(&report, &key).is_some() {
                tracing::warn!(entity_id = %key, "lookup served last stored values");
            }
            return Ok(entry);
        }
        Err(report_error(&report, &key)
            .unwrap_or_else(|| AppError::NotFound(format!("no stats for '{}'", key))))
    }

    /// Refreshes lifetime values for `entity_ids`, or for the tracked set when empty.
    pub async fn refresh_now(&self, entity_ids: Vec<String>) -> AppResult<CycleReport> {
        let entity_ids = if entity_ids.is_empty() {
            self.db.tracked_entities()?
        } else {
            entity_ids
        };
        Ok(self
            .orchestrator
            .run_cycle(RefreshRequest::lifetime_only(entity_ids))
            .await)
    }

    /// Starts a new session for one entity: refresh, then pin the session snapshot to lifetime.
    pub async fn start_session(&self, entity_id: &str) -> AppResult<CycleReport> {
        let key = normalize_entity_id(entity_id)?;
        let report = self
            .orchestrator
            .run_cycle(narrow_request(&key, BTreeSet::from([Period::Session])))
            .await;
        match report_error(&report, &key) {
            Some(error) => Err(error),
            None => Ok(report),
        }
    }

    pub async fn remove_player(&self, entity_id: &str) -> AppResult<bool> {
        let key = normalize_entity_id(entity_id)?;
        let handle = self.orchestrator.lock_store().await?;
        let removed = self.db.delete_entity(&key)?;
        let revision = self.db.version();
        handle.release();

        self.cache.evict(&key, revision)?;
        tracing::info!(entity_id = %key, removed, "removed player");
        Ok(removed)
    }

    pub async fn export_workbook(&self, path: &Path) -> AppResult<usize> {
        let handle = self.orchestrator.lock_store().await?;
        let result = workbook::export_workbook(&self.db, path);
        handle.release();
        result
    }

    pub async fn import_workbook(&self, path: &Path) -> AppResult<ImportSummary> {
        let handle = self.orchestrator.lock_store().await?;
        let result = workbook::import_workbook(&self.db, path);
        handle.release();

        let summary = result?;
        self.cache.force_reload()?;
        tracing::info!(
            sheets = summary.sheets,
            rows = summary.rows,
            skipped = summary.skipped.len(),
            "imported workbook"
        );
        Ok(summary)
    }
}

fn narrow_request(entity_id: &str, reset_periods: BTreeSet<Period>) -> RefreshRequest {
    RefreshRequest {
        reset_periods,
        rotate_yesterday: false,
        entity_ids: vec![entity_id.to_string()],
        narrow: true,
    }
}

fn report_error(report: &CycleReport, entity_id: &str) -> Option<AppError> {
    if report.state == CycleState::Failed {
        let display = report.error.as_deref().unwrap_or_default();
        return Some(match report.error_code.as_deref() {
            Some(code) => AppError::from_code(code, display),
            None => AppError::StoreUnavailable(display.to_string()),
        });
    }
    match report.entities.get(entity_id) {
        Some(outcome) if outcome.success => None,
        Some(outcome) => Some(AppError::PartialIngestFailure(
            outcome.error.clone().unwrap_or_default(),
        )),
        None => Some(AppError::NotFound(format!("'{}' was not refreshed", entity_id))),
    }
}
