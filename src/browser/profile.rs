//! Browser profile directory management
//!
//! Pool instances get UUID-named user-data directories so concurrent
//! launches never collide on a SingletonLock, plus stale-profile cleanup for
//! directories orphaned by crashed processes.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

const PROFILE_PREFIX: &str = "browsermill_profile_";

/// RAII wrapper for a browser profile directory
///
/// Removes the directory on drop unless ownership is transferred via
/// [`BrowserProfile::into_path`] to another cleanup mechanism (the pool's
/// browser handle, normally).
#[derive(Debug)]
pub struct BrowserProfile {
    path: PathBuf,
    cleanup_on_drop: bool,
}

impl BrowserProfile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            cleanup_on_drop: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consume the profile and return the path, disabling auto-cleanup.
    pub fn into_path(mut self) -> PathBuf {
        self.cleanup_on_drop = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for BrowserProfile {
    fn drop(&mut self) {
        if self.cleanup_on_drop && self.path.exists() {
            debug!("Profile cleanup: removing {}", self.path.display());
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!(
                    "Failed to clean up profile directory {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

/// Create a unique profile directory under the system temp dir.
pub fn create_unique_profile() -> Result<BrowserProfile> {
    let path = std::env::temp_dir().join(format!("{PROFILE_PREFIX}{}", Uuid::new_v4()));
    std::fs::create_dir_all(&path)
        .with_context(|| format!("Failed to create profile directory {}", path.display()))?;
    debug!("Created browser profile: {}", path.display());
    Ok(BrowserProfile::new(path))
}

/// Remove leftover profile directories older than `max_age`.
///
/// Directories whose SingletonLock is held by a live browser are younger
/// than any sensible `max_age`, so an age check alone is safe here.
pub fn cleanup_stale_profiles(max_age: Duration) -> usize {
    let temp = std::env::temp_dir();
    let Ok(entries) = std::fs::read_dir(&temp) else {
        return 0;
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(PROFILE_PREFIX) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else { continue };
        let age = metadata
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age > max_age {
            if std::fs::remove_dir_all(entry.path()).is_ok() {
                info!("Removed stale browser profile: {}", entry.path().display());
                removed += 1;
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_cleans_up_on_drop() {
        let profile = create_unique_profile().expect("profile should be created");
        let path = profile.path().to_path_buf();
        assert!(path.exists());
        drop(profile);
        assert!(!path.exists());
    }

    #[test]
    fn into_path_disables_cleanup() {
        let profile = create_unique_profile().expect("profile should be created");
        let path = profile.into_path();
        assert!(path.exists());
        std::fs::remove_dir_all(&path).expect("manual cleanup succeeds");
    }
}
