//! Persisted updater settings and static configuration.

use crate::error::{Result, UpdaterError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const MIN_CHECK_INTERVAL_DAYS: u32 = 7;
pub const MAX_CHECK_INTERVAL_DAYS: u32 = 9999;

/// Which tracks besides stable the user wants to be offered.
///
/// Persisted as `0` (stable only), `1` (also beta) or `2` (also nightly).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ChannelPreference {
    #[default]
    Stable,
    Beta,
    Nightly,
}

impl TryFrom<u8> for ChannelPreference {
    type Error = UpdaterError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ChannelPreference::Stable),
            1 => Ok(ChannelPreference::Beta),
            2 => Ok(ChannelPreference::Nightly),
            other => Err(UpdaterError::InvalidSetting {
                name: "channel",
                reason: format!("{other} is not one of 0, 1, 2"),
            }),
        }
    }
}

impl From<ChannelPreference> for u8 {
    fn from(value: ChannelPreference) -> Self {
        match value {
            ChannelPreference::Stable => 0,
            ChannelPreference::Beta => 1,
            ChannelPreference::Nightly => 2,
        }
    }
}

/// Values the updater reads from and writes back to the settings store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateSettings {
    /// Whether interval-driven checks run at all.
    pub check_enabled: bool,
    /// Days between automatic checks.
    pub check_interval_days: u32,
    pub channel: ChannelPreference,
    /// Raw body of the last successful version check.
    pub cached_metadata: String,
    pub last_check: Option<DateTime<Utc>>,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            check_enabled: true,
            check_interval_days: MIN_CHECK_INTERVAL_DAYS,
            channel: ChannelPreference::Stable,
            cached_metadata: String::new(),
            last_check: None,
        }
    }
}

impl UpdateSettings {
    /// Reject values outside their documented ranges.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_CHECK_INTERVAL_DAYS..=MAX_CHECK_INTERVAL_DAYS).contains(&self.check_interval_days) {
            return Err(UpdaterError::InvalidSetting {
                name: "check_interval_days",
                reason: format!(
                    "{} is outside {MIN_CHECK_INTERVAL_DAYS}..={MAX_CHECK_INTERVAL_DAYS}",
                    self.check_interval_days
                ),
            });
        }
        Ok(())
    }

    pub fn set_check_interval_days(&mut self, days: u32) -> Result<()> {
        let previous = std::mem::replace(&mut self.check_interval_days, days);
        if let Err(err) = self.validate() {
            self.check_interval_days = previous;
            return Err(err);
        }
        Ok(())
    }

    /// Whether an automatic check is due at `now`.
    pub fn check_due(&self, now: DateTime<Utc>) -> bool {
        if !self.check_enabled {
            return false;
        }
        match self.last_check {
            None => true,
            Some(last) if last > now => true,
            Some(last) => now - last >= chrono::Duration::days(i64::from(self.check_interval_days)),
        }
    }
}

/// Persistence collaborator for [`UpdateSettings`].
pub trait SettingsStore {
    fn settings(&self) -> &UpdateSettings;

    /// Replace and persist the settings.
    fn persist(&mut self, settings: UpdateSettings) -> Result<()>;
}

/// Settings kept only in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySettings {
    settings: UpdateSettings,
}

impl MemorySettings {
    pub fn new(settings: UpdateSettings) -> Self {
        Self { settings }
    }
}

impl SettingsStore for MemorySettings {
    fn settings(&self) -> &UpdateSettings {
        &self.settings
    }

    fn persist(&mut self, settings: UpdateSettings) -> Result<()> {
        settings.validate()?;
        self.settings = settings;
        Ok(())
    }
}

/// Settings stored as a JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonSettingsStore {
    path: PathBuf,
    settings: UpdateSettings,
}

impl JsonSettingsStore {
    /// Load `path`, or start from defaults if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = if path.exists() {
            let content = fs::read_to_string(&path)?;
            let settings: UpdateSettings = serde_json::from_str(&content)?;
            settings.validate()?;
            settings
        } else {
            UpdateSettings::default()
        };
        Ok(Self { path, settings })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    fn settings(&self) -> &UpdateSettings {
        &self.settings
    }

    fn persist(&mut self, settings: UpdateSettings) -> Result<()> {
        settings.validate()?;
        let content = serde_json::to_string_pretty(&settings)?;

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }

        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(content.as_bytes())?;
        temp.flush()?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|err| UpdaterError::Io(err.error))?;

        self.settings = settings;
        Ok(())
    }
}

/// Where the updater talks to and where it puts files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdaterConfig {
    /// Host serving `update.php`.
    pub update_host: String,
    /// Final home of verified artefacts.
    pub download_dir: PathBuf,
    /// Staging directory for in-flight downloads.
    pub temp_dir: PathBuf,
}

impl UpdaterConfig {
    /// Config for `update_host` using the user's download directory and the
    /// system temp directory.
    pub fn new(update_host: impl Into<String>) -> Self {
        let temp_dir = std::env::temp_dir();
        Self {
            update_host: update_host.into(),
            download_dir: dirs::download_dir().unwrap_or_else(|| temp_dir.clone()),
            temp_dir,
        }
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn channel_preference_serializes_as_integer() {
        let mut settings = UpdateSettings::default();
        settings.channel = ChannelPreference::Nightly;
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["channel"], 2);

        let bad = r#"{"channel": 7}"#;
        assert!(serde_json::from_str::<UpdateSettings>(bad).is_err());
    }

    #[test]
    fn interval_range_is_enforced() {
        let mut settings = UpdateSettings::default();
        assert!(settings.set_check_interval_days(6).is_err());
        assert_eq!(settings.check_interval_days, MIN_CHECK_INTERVAL_DAYS);
        assert!(settings.set_check_interval_days(10_000).is_err());
        settings.set_check_interval_days(9999).unwrap();
        assert_eq!(settings.check_interval_days, 9999);
    }

    #[test]
    fn check_due_respects_interval() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let mut settings = UpdateSettings::default();
        assert!(settings.check_due(now));

        settings.last_check = Some(now - chrono::Duration::days(3));
        assert!(!settings.check_due(now));

        settings.last_check = Some(now - chrono::Duration::days(7));
        assert!(settings.check_due(now));

        settings.check_enabled = false;
        assert!(!settings.check_due(now));
    }

    #[test]
    fn json_store_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conf").join("updater.json");

        let mut store = JsonSettingsStore::open(&path).unwrap();
        assert_eq!(store.settings(), &UpdateSettings::default());

        let mut settings = store.settings().clone();
        settings.cached_metadata = "release 3.5.0\n".into();
        settings.channel = ChannelPreference::Beta;
        store.persist(settings.clone()).unwrap();

        let reopened = JsonSettingsStore::open(&path).unwrap();
        assert_eq!(reopened.settings(), &settings);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn json_store_replaces_file_without_leftovers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("updater.json");
        let mut store = JsonSettingsStore::open(&path).unwrap();

        let mut settings = store.settings().clone();
        settings.check_interval_days = 14;
        store.persist(settings.clone()).unwrap();
        settings.check_interval_days = 30;
        store.persist(settings).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("updater.json")]);

        let mut invalid = store.settings().clone();
        invalid.check_interval_days = 1;
        assert!(store.persist(invalid).is_err());
        assert_eq!(
            JsonSettingsStore::open(&path)
                .unwrap()
                .settings()
                .check_interval_days,
            30
        );
    }

    #[test]
    fn json_store_rejects_out_of_range_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("updater.json");
        fs::write(&path, r#"{"check_interval_days": 3}"#).unwrap();

        assert!(matches!(
            JsonSettingsStore::open(&path),
            Err(UpdaterError::InvalidSetting { .. })
        ));
    }
}
