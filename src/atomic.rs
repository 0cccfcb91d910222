use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Replaces `target` with whatever `producer` writes, or leaves it untouched.
///
/// Returns `false` on any I/O failure; the caller keeps its in-memory data for a retry.
pub fn write<F>(target: &Path, producer: F) -> bool
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    match stage(target, producer) {
        Ok(staged) => staged.commit(),
        Err(error) => {
            tracing::warn!(target = %target.display(), error = %error, "atomic write failed before rename");
            false
        }
    }
}

/// Fully written temp sibling of `target`, not yet renamed into place.
/// Dropping it without [`StagedWrite::commit`] deletes the temp file.
#[derive(Debug)]
pub struct StagedWrite {
    target: PathBuf,
    temp: PathBuf,
    done: bool,
}

pub fn stage<F>(target: &Path, producer: F) -> io::Result<StagedWrite>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let parent = target
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let temp = parent.join(format!(".{}.{}.tmp", file_name(target), Uuid::new_v4().simple()));
    // Constructed before the first write so a failing producer still cleans up.
    let staged = StagedWrite {
        target: target.to_path_buf(),
        temp,
        done: false,
    };

    let file = File::create(&staged.temp)?;
    let mut writer = BufWriter::new(file);
    producer(&mut writer)?;
    let file = writer.into_inner().map_err(|error| error.into_error())?;
    file.sync_all()?;
    Ok(staged)
}

impl StagedWrite {
    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    pub fn commit(mut self) -> bool {
        let backup = backup_path(&self.target);
        let had_original = self.target.exists();

        if had_original {
            if let Err(error) = fs::copy(&self.target, &backup) {
                tracing::warn!(target = %self.target.display(), error = %error, "failed to back up original");
                return false;
            }
        }

        if let Err(error) = fs::rename(&self.temp, &self.target) {
            tracing::warn!(target = %self.target.display(), error = %error, "failed to rename temp into place");
            if had_original {
                let _ = fs::remove_file(&backup);
            }
            return false;
        }
        self.done = true;
        sync_parent(&self.target);

        if had_original {
            if let Err(error) = fs::remove_file(&backup) {
                tracing::warn!(backup = %backup.display(), error = %error, "failed to remove backup after write");
            }
        }
        true
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(error) = fs::remove_file(&self.temp) {
            if error.kind() != io::ErrorKind::NotFound {
                tracing::warn!(temp = %self.temp.display(), error = %error, "failed to remove temp file");
            }
        }
    }
}

pub fn backup_path(target: &Path) -> PathBuf {
    target.with_file_name(format!("{}.bak", file_name(target)))
}

fn file_name(target: &Path) -> String {
    target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "store".to_string())
}

#[cfg(unix)]
fn sync_parent(target: &Path) {
    if let Some(parent) = target.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        if let Err(error) = File::open(parent).and_then(|dir| dir.sync_all()) {
            tracing::debug!(error = %error, "directory fsync after rename failed");
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_target: &Path) {}
