use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{CycleReport, CycleState, Period, RefreshRequest};
use crate::orchestrator::Orchestrator;
use chrono::{DateTime, Datelike, FixedOffset, Utc};
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};

pub const LAST_CYCLE_KEY: &str = "last_cycle_at";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CyclePlan {
    pub rotate_yesterday: bool,
    pub reset_periods: BTreeSet<Period>,
}

/// Decides which periods a timer tick at `now` has to roll, given the previous completed tick.
///
/// Boundaries are local calendar days and months at `utc_offset`. Several skipped days still
/// produce a single rotation. Session is never reset here.
pub fn plan_cycle(last_run: Option<DateTime<Utc>>, now: DateTime<Utc>, utc_offset: FixedOffset) -> CyclePlan {
    let Some(last_run) = last_run else {
        return CyclePlan::default();
    };
    let previous = last_run.with_timezone(&utc_offset).date_naive();
    let current = now.with_timezone(&utc_offset).date_naive();
    if current <= previous {
        return CyclePlan::default();
    }

    let mut reset_periods = BTreeSet::from([Period::Daily]);
    if (current.year(), current.month()) != (previous.year(), previous.month()) {
        reset_periods.insert(Period::Monthly);
    }
    CyclePlan {
        rotate_yesterday: true,
        reset_periods,
    }
}

pub fn offset_from_minutes(minutes: i32) -> AppResult<FixedOffset> {
    FixedOffset::east_opt(minutes * 60)
        .ok_or_else(|| AppError::InvalidInput(format!("invalid utc offset {} minutes", minutes)))
}

/// Periodic driver for tracked entities. Clones share state.
#[derive(Clone)]
pub struct RefreshScheduler {
    orchestrator: Orchestrator,
    db: Arc<Database>,
    notify: Arc<Notify>,
    last_report: Arc<RwLock<Option<CycleReport>>>,
    interval: Duration,
    utc_offset: FixedOffset,
}

impl RefreshScheduler {
    pub fn new(orchestrator: Orchestrator, db: Arc<Database>, interval: Duration, utc_offset: FixedOffset) -> Self {
        Self {
            orchestrator,
            db,
            notify: Arc::new(Notify::new()),
            last_report: Arc::new(RwLock::new(None)),
            interval,
            utc_offset,
        }
    }

    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_loop().await;
        })
    }

    /// Wakes the loop for an immediate tick.
    pub fn refresh_now(&self) {
        self.notify.notify_one();
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        self.last_report
            .read()
            .ok()
            .and_then(|report| report.clone())
    }

    pub fn last_cycle_at(&self) -> AppResult<Option<DateTime<Utc>>> {
        let Some(raw) = self.db.get_store_value(LAST_CYCLE_KEY)? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(value) => Ok(Some(value.with_timezone(&Utc))),
            Err(error) => {
                tracing::warn!(value = %raw, error = %error, "ignoring unparseable last cycle time");
                Ok(None)
            }
        }
    }

    /// One timer tick: plan against the persisted last run, refresh the tracked set, and record
    /// `now` only when the cycle completed.
    pub async fn tick(&self, now: DateTime<Utc>) -> AppResult<CycleReport> {
        let plan = plan_cycle(self.last_cycle_at()?, now, self.utc_offset);
        let request = RefreshRequest {
            reset_periods: plan.reset_periods,
            rotate_yesterday: plan.rotate_yesterday,
            entity_ids: self.db.tracked_entities()?,
            narrow: false,
        };

        let report = self.orchestrator.run_cycle(request).await;
        if report.state == CycleState::Done {
            self.db.set_store_value(LAST_CYCLE_KEY, &now.to_rfc3339())?;
        }
        if let Ok(mut slot) = self.last_report.write() {
            *slot = Some(report.clone());
        }
        Ok(report)
    }

    async fn run_loop(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.notify.notified() => {}
            }
            match self.tick(Utc::now()).await {
                Ok(report) if report.state == CycleState::Failed => {
                    tracing::warn!(error = report.error.as_deref().unwrap_or_default(), "scheduled refresh did not run");
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(error = %error, "scheduled refresh tick failed");
                }
            }
        }
    }
}
