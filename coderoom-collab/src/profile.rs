//! Remembers the last used display name and color between runs.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::presence::UserProfile;

/// Profile store errors.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Profile I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Profile is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A small JSON file holding one `UserProfile`.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/coderoom/user.json`, if the platform has a config dir.
    pub fn default_location() -> Option<Self> {
        dirs::config_dir().map(|dir| Self::new(dir.join("coderoom").join("user.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored profile. `Ok(None)` when nothing was saved yet.
    pub fn load(&self) -> Result<Option<UserProfile>, ProfileError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut profile: UserProfile = serde_json::from_str(&text)?;
        // Readiness is per session and never restored.
        profile.is_ready = false;
        Ok(Some(profile))
    }

    pub fn save(&self, profile: &UserProfile) -> Result<(), ProfileError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(profile)?;
        fs::write(&self.path, text)?;
        debug!("Saved profile to {}", self.path.display());
        Ok(())
    }

    /// The stored profile, or a fresh random one that is saved for next time.
    pub fn load_or_create(&self) -> UserProfile {
        match self.load() {
            Ok(Some(profile)) => return profile,
            Ok(None) => {}
            Err(e) => warn!("Ignoring unreadable profile {}: {}", self.path.display(), e),
        }

        let profile = UserProfile::random();
        if let Err(e) = self.save(&profile) {
            warn!("Could not save profile {}: {}", self.path.display(), e);
        }
        profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path().join("user.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path().join("nested").join("user.json"));
        let mut profile = UserProfile::new("Ada", "hsl(120, 100%, 50%)");
        profile.is_ready = true;

        store.save(&profile).unwrap();
        let loaded = store.load().unwrap().unwrap();

        assert_eq!(loaded.name, "Ada");
        assert_eq!(loaded.color, "hsl(120, 100%, 50%)");
        assert!(!loaded.is_ready);
    }

    #[test]
    fn test_load_or_create_persists_random_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path().join("user.json"));

        let first = store.load_or_create();
        let second = store.load_or_create();
        assert_eq!(first, second);
    }

    #[test]
    fn test_corrupt_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user.json");
        fs::write(&path, "not json").unwrap();
        let store = ProfileStore::new(&path);

        assert!(matches!(store.load(), Err(ProfileError::Json(_))));
        let profile = store.load_or_create();
        assert_eq!(store.load().unwrap(), Some(profile));
    }
}
