use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DATA_DIR_ENV: &str = "STAT_TRACKER_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrackerConfig {
    pub data_dir: PathBuf,
    pub database_file: String,
    pub lock_timeout_secs: u64,
    pub lock_stale_after_secs: u64,
    pub lock_poll_millis: u64,
    pub refresh_interval_secs: u64,
    pub utc_offset_minutes: i32,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            database_file: "stats.sqlite".to_string(),
            lock_timeout_secs: 60,
            lock_stale_after_secs: 300,
            lock_poll_millis: 100,
            refresh_interval_secs: 600,
            utc_offset_minutes: 0,
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl TrackerConfig {
    /// Reads YAML config; a missing file yields defaults. `STAT_TRACKER_DATA_DIR` overrides `dataDir`.
    pub fn load(path: &Path) -> AppResult<Self> {
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path)?;
            if raw.trim().is_empty() {
                Self::default()
            } else {
                serde_yaml::from_str::<Self>(&raw)?
            }
        } else {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                config.data_dir = PathBuf::from(dir);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.database_file.trim().is_empty() {
            return Err(AppError::InvalidInput("databaseFile must not be empty".to_string()));
        }
        if self.lock_poll_millis == 0 {
            return Err(AppError::InvalidInput("lockPollMillis must be positive".to_string()));
        }
        if self.refresh_interval_secs == 0 {
            return Err(AppError::InvalidInput("refreshIntervalSecs must be positive".to_string()));
        }
        if self.utc_offset_minutes.abs() > 14 * 60 {
            return Err(AppError::InvalidInput(format!(
                "utcOffsetMinutes {} is outside +/-14h",
                self.utc_offset_minutes
            )));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.data_dir.join("locks")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| self.data_dir.join("logs"))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_after_secs)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_millis)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}
