//! Read-through cache over the snapshot store.
//!
//! The map is published wholesale behind an `Arc`, so readers see either the previous
//! map or the next one, never a half-built one. Rebuilds read a local SQLite file and
//! the reload gate has no timeout; revisit that if the store ever becomes remote.

use crate::db::{Database, Ingested};
use crate::errors::{AppError, AppResult};
use crate::models::{normalize_entity_id, CacheEntry};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

pub type CacheMap = HashMap<String, CacheEntry>;

const NEVER_LOADED: u64 = u64::MAX;

#[derive(Debug)]
pub struct StatsCache {
    db: Arc<Database>,
    entries: RwLock<Arc<CacheMap>>,
    last_seen_version: AtomicU64,
    reload_gate: Mutex<()>,
    reloads: AtomicU64,
}

impl StatsCache {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            entries: RwLock::new(Arc::new(CacheMap::new())),
            last_seen_version: AtomicU64::new(NEVER_LOADED),
            reload_gate: Mutex::new(()),
            reloads: AtomicU64::new(0),
        }
    }

    pub fn get_all(&self) -> AppResult<Arc<CacheMap>> {
        if self.is_current() {
            return self.current();
        }

        let _gate = self.lock_gate()?;
        // Another caller may have rebuilt while we waited on the gate.
        if self.is_current() {
            return self.current();
        }
        self.rebuild()
    }

    pub fn get(&self, entity_id: &str) -> AppResult<Option<CacheEntry>> {
        let key = normalize_entity_id(entity_id)?;
        Ok(self.get_all()?.get(&key).cloned())
    }

    pub fn force_reload(&self) -> AppResult<Arc<CacheMap>> {
        let _gate = self.lock_gate()?;
        self.rebuild()
    }

    /// Splices one freshly-ingested entity into the map without a full rebuild.
    ///
    /// The seen version only advances when `fresh` came from the single write since the
    /// last rebuild. Writes by anyone else leave the seen version behind the store, so the
    /// map is still patched but the next `get_all` does a full reload.
    pub fn update_one(&self, entity_id: &str, fresh: Ingested) -> AppResult<bool> {
        let key = normalize_entity_id(entity_id)?;
        let _gate = self.lock_gate()?;

        let seen = self.last_seen_version.load(Ordering::SeqCst);
        if seen == NEVER_LOADED {
            return Ok(false);
        }

        let meta = self.db.get_meta(&key)?;
        let current = self.current()?;
        let mut next = CacheMap::clone(&current);
        next.insert(key.clone(), CacheEntry { stats: fresh.stats, meta });
        self.publish(next)?;

        let advanced = seen.checked_add(1) == Some(fresh.revision) && self.db.version() == fresh.revision;
        if advanced {
            self.last_seen_version.store(fresh.revision, Ordering::SeqCst);
        } else {
            tracing::debug!(entity_id = %key, seen, revision = fresh.revision, "cache patched; full reload still pending");
        }
        Ok(advanced)
    }

    /// Drops one entry after an administrative delete that produced `revision`.
    pub fn evict(&self, entity_id: &str, revision: u64) -> AppResult<()> {
        let key = normalize_entity_id(entity_id)?;
        let _gate = self.lock_gate()?;

        let seen = self.last_seen_version.load(Ordering::SeqCst);
        if seen == NEVER_LOADED {
            return Ok(());
        }
        let current = self.current()?;
        let mut next = CacheMap::clone(&current);
        next.remove(&key);
        self.publish(next)?;
        if seen.checked_add(1) == Some(revision) && self.db.version() == revision {
            self.last_seen_version.store(revision, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::SeqCst)
    }

    fn is_current(&self) -> bool {
        let seen = self.last_seen_version.load(Ordering::SeqCst);
        seen != NEVER_LOADED && seen == self.db.version()
    }

    /// Caller must hold the reload gate.
    fn rebuild(&self) -> AppResult<Arc<CacheMap>> {
        let projection = self.db.load_projection()?;
        let mut entity_ids: BTreeSet<&String> = projection.stats.keys().collect();
        entity_ids.extend(projection.meta.keys());

        let mut next = CacheMap::with_capacity(entity_ids.len());
        for entity_id in entity_ids {
            next.insert(
                entity_id.clone(),
                CacheEntry {
                    stats: projection.stats.get(entity_id).cloned().unwrap_or_default(),
                    meta: projection.meta.get(entity_id).cloned(),
                },
            );
        }

        let published = self.publish(next)?;
        self.last_seen_version.store(projection.revision, Ordering::SeqCst);
        let reloads = self.reloads.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(
            entities = published.len(),
            revision = projection.revision,
            reloads,
            "stats cache rebuilt"
        );
        Ok(published)
    }

    fn publish(&self, next: CacheMap) -> AppResult<Arc<CacheMap>> {
        let next = Arc::new(next);
        let mut writer = self
            .entries
            .write()
            .map_err(|_| AppError::Internal("cache map lock poisoned".to_string()))?;
        *writer = Arc::clone(&next);
        Ok(next)
    }

    fn current(&self) -> AppResult<Arc<CacheMap>> {
        self.entries
            .read()
            .map(|entries| Arc::clone(&*entries))
            .map_err(|_| AppError::Internal("cache map lock poisoned".to_string()))
    }

    fn lock_gate(&self) -> AppResult<std::sync::MutexGuard<'_, ()>> {
        self.reload_gate
            .lock()
            .map_err(|_| AppError::Internal("cache reload gate poisoned".to_string()))
    }
}
