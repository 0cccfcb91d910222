use crate::cache::StatsCache;
use crate::db::{Database, Ingested};
use crate::errors::{AppError, AppResult};
use crate::lock::{LockHandle, StoreLock};
use crate::models::{
    normalize_entity_id, CycleReport, CycleState, EntityOutcome, MetaUpdate, Period, RefreshRequest,
};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub const STORE_LOCK_RESOURCE: &str = "stat-store";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedStats {
    pub stats: BTreeMap<String, f64>,
    pub meta: Option<MetaUpdate>,
}

pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<FetchedStats>> + Send + 'a>>;

/// Third-party stats API as seen by the tracker. Treated as unreliable.
pub trait StatsSource: Send + Sync {
    fn fetch_lifetime_values<'a>(&'a self, entity_id: &'a str) -> FetchFuture<'a>;
}

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub timeout: Duration,
    pub stale_after: Duration,
}

#[derive(Clone)]
pub struct Orchestrator {
    db: Arc<Database>,
    cache: Arc<StatsCache>,
    source: Arc<dyn StatsSource>,
    lock: StoreLock,
    lock_settings: LockSettings,
}

impl Orchestrator {
    pub fn new(
        db: Arc<Database>,
        cache: Arc<StatsCache>,
        source: Arc<dyn StatsSource>,
        lock: StoreLock,
        lock_settings: LockSettings,
    ) -> Self {
        Self {
            db,
            cache,
            source,
            lock,
            lock_settings,
        }
    }

    pub fn store_lock(&self) -> &StoreLock {
        &self.lock
    }

    /// Takes the store lock that serializes refresh cycles and administrative writes.
    pub async fn lock_store(&self) -> AppResult<LockHandle> {
        self.lock
            .acquire(
                STORE_LOCK_RESOURCE,
                self.lock_settings.timeout,
                self.lock_settings.stale_after,
            )
            .await
    }

    /// Runs one refresh cycle. Never fails: every outcome, including a skipped cycle,
    /// comes back as a report. The store lock is released on every exit path.
    pub async fn run_cycle(&self, request: RefreshRequest) -> CycleReport {
        let mut report = CycleReport {
            state: CycleState::Idle,
            rotated: false,
            error: None,
            error_code: None,
            entities: BTreeMap::new(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };

        let handle = match self.lock_store().await {
            Ok(handle) => handle,
            Err(error) => {
                tracing::warn!(error = %error, "refresh cycle skipped");
                return finish(report, CycleState::Failed, Some(error));
            }
        };
        report.state = CycleState::LockAcquired;

        let mut entity_ids = BTreeSet::new();
        for raw in &request.entity_ids {
            match normalize_entity_id(raw) {
                Ok(key) => {
                    entity_ids.insert(key);
                }
                Err(error) => {
                    report.entities.insert(raw.clone(), failure(&error));
                }
            }
        }
        let entity_ids: Vec<String> = entity_ids.into_iter().collect();

        if request.rotate_yesterday {
            report.state = CycleState::Rotating;
            if let Err(error) = self.db.rotate(&entity_ids, Period::Daily, Period::Yesterday) {
                tracing::warn!(error = %error, "period rotation failed; cycle aborted");
                handle.release();
                return finish(report, CycleState::Failed, Some(error));
            }
            report.rotated = true;
        }

        // Narrow cycles splice each entity into the cache right after its ingest so the
        // cache can account for exactly one store write at a time.
        let narrow = request.narrow && !report.rotated;
        report.state = CycleState::Ingesting;
        for entity_id in &entity_ids {
            match self.refresh_entity(entity_id, &request.reset_periods).await {
                Ok(ingested) => {
                    if narrow {
                        if let Err(error) = self.cache.update_one(entity_id, ingested) {
                            tracing::warn!(entity_id = %entity_id, error = %error, "cache update failed");
                        }
                    }
                    report.entities.insert(
                        entity_id.clone(),
                        EntityOutcome {
                            success: true,
                            error: None,
                        },
                    );
                }
                Err(error) => {
                    tracing::warn!(entity_id = %entity_id, error = %error, "entity refresh failed");
                    report.entities.insert(entity_id.clone(), failure(&error));
                }
            }
        }
        handle.release();

        if !narrow {
            if let Err(error) = self.cache.force_reload() {
                tracing::warn!(error = %error, "cache reload after refresh failed");
            }
        }
        finish(report, CycleState::Done, None)
    }

    async fn refresh_entity(&self, entity_id: &str, reset_periods: &BTreeSet<Period>) -> AppResult<Ingested> {
        let fetched = self
            .source
            .fetch_lifetime_values(entity_id)
            .await
            .map_err(|error| AppError::PartialIngestFailure(format!("{}: {:#}", entity_id, error)))?;
        if fetched.stats.is_empty() {
            return Err(AppError::PartialIngestFailure(format!(
                "{}: source returned no stats",
                entity_id
            )));
        }
        self.db
            .ingest(entity_id, &fetched.stats, reset_periods, fetched.meta.as_ref())
    }
}

fn failure(error: &AppError) -> EntityOutcome {
    EntityOutcome {
        success: false,
        error: Some(error.to_string()),
    }
}

fn finish(mut report: CycleReport, state: CycleState, error: Option<AppError>) -> CycleReport {
    report.state = state;
    report.error_code = error.as_ref().map(|error| error.code().to_string());
    report.error = error.map(|error| error.to_string());
    report.finished_at = Utc::now();
    tracing::info!(
        state = ?report.state,
        rotated = report.rotated,
        succeeded = report.succeeded(),
        failed = report.failed(),
        "refresh cycle finished"
    );
    report
}
