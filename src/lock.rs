//! Advisory lock over the persistent store: an exclusive create-if-absent marker file.
//!
//! Stale-marker reclamation is a liveness heuristic for crashed holders. It is not
//! mutual exclusion under adversarial timing: two waiters can both judge a marker
//! stale, and a holder paused longer than `stale_after` loses its lock silently.

use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockMarker {
    resource: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoreLock {
    dir: PathBuf,
    poll_interval: Duration,
}

/// Held lock. Released explicitly via [`LockHandle::release`] or implicitly on drop.
#[derive(Debug)]
pub struct LockHandle {
    resource: String,
    path: PathBuf,
    released: bool,
}

impl StoreLock {
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval,
        }
    }

    pub fn marker_path(&self, resource: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", sanitize_resource(resource)))
    }

    pub async fn acquire(&self, resource: &str, timeout: Duration, stale_after: Duration) -> AppResult<LockHandle> {
        fs::create_dir_all(&self.dir)?;
        let path = self.marker_path(resource);
        let started = Instant::now();

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let marker = LockMarker {
                        resource: resource.to_string(),
                        pid: std::process::id(),
                        acquired_at: Utc::now(),
                    };
                    let written = serde_json::to_vec(&marker)
                        .map_err(AppError::from)
                        .and_then(|bytes| file.write_all(&bytes).map_err(AppError::from));
                    if let Err(error) = written {
                        drop(file);
                        let _ = fs::remove_file(&path);
                        return Err(error);
                    }
                    tracing::debug!(resource, "store lock acquired");
                    return Ok(LockHandle {
                        resource: resource.to_string(),
                        path,
                        released: false,
                    });
                }
                Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                    if let Some(age) = marker_age(&path) {
                        if age > stale_after {
                            tracing::warn!(
                                resource,
                                age_secs = age.as_secs(),
                                stale_after_secs = stale_after.as_secs(),
                                "reclaiming stale store lock"
                            );
                            match fs::remove_file(&path) {
                                Ok(()) => continue,
                                Err(error) if error.kind() == ErrorKind::NotFound => continue,
                                Err(error) => return Err(AppError::from(error)),
                            }
                        }
                    }

                    let elapsed = started.elapsed();
                    if elapsed >= timeout {
                        return Err(AppError::LockTimeout(format!(
                            "'{}' still held after {:?}",
                            resource, timeout
                        )));
                    }
                    tokio::time::sleep(self.poll_interval.min(timeout - elapsed)).await;
                }
                Err(error) => return Err(AppError::from(error)),
            }
        }
    }

    pub fn release(&self, handle: LockHandle) {
        handle.release();
    }
}

impl LockHandle {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn release(mut self) {
        self.remove_marker();
    }

    fn remove_marker(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(resource = %self.resource, "store lock released"),
            // Another waiter may already have reclaimed it as stale.
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => {
                tracing::warn!(resource = %self.resource, error = %error, "failed to remove lock marker")
            }
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.remove_marker();
    }
}

fn marker_age(path: &Path) -> Option<Duration> {
    if let Some(marker) = fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<LockMarker>(&bytes).ok())
    {
        return Some((Utc::now() - marker.acquired_at).to_std().unwrap_or(Duration::ZERO));
    }
    // Marker written by a holder that died mid-write: fall back to the file clock.
    let modified = fs::metadata(path).and_then(|meta| meta.modified()).ok()?;
    Some(modified.elapsed().unwrap_or(Duration::ZERO))
}

fn sanitize_resource(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "store".to_string()
    } else {
        cleaned
    }
}
