//! Local configuration. Mirrors the editor settings the agent cares about plus where to find
//! the remote service. Stored as `settings.json` in the application directory.

use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

pub const SETTINGS_FILE: &str = "settings.json";
pub const DEFAULT_API_ENDPOINT: &str = "https://api.software.com";
pub const DEFAULT_APP_URL: &str = "https://app.software.com";
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 60 * 15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api_endpoint: String,
    pub app_url: String,
    pub flush_interval_secs: u64,
    /// Unset until either the user or the first remote preference sync decides.
    pub show_git_metrics: Option<bool>,
    pub show_music_metrics: Option<bool>,
    pub show_weekly_ranking: Option<bool>,
    pub toggle_file_event_logging: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_endpoint: DEFAULT_API_ENDPOINT.into(),
            app_url: DEFAULT_APP_URL.into(),
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
            show_git_metrics: None,
            show_music_metrics: None,
            show_weekly_ranking: None,
            toggle_file_event_logging: false,
        }
    }
}

impl Settings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

/// Holds the current [Settings] and writes changes back to disk.
pub struct SettingsStore {
    path: PathBuf,
    settings: Mutex<Settings>,
}

impl SettingsStore {
    /// Loads settings from `path`. A missing file means defaults, a malformed one is an error
    /// so user edits are never silently discarded.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let settings = match fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Malformed settings file {path:?}"))?,
            Err(e) if e.kind() == ErrorKind::NotFound => Settings::default(),
            Err(e) => Err(e)?,
        };
        Ok(Self::new(path, settings))
    }

    pub fn new(path: PathBuf, settings: Settings) -> Self {
        Self {
            path,
            settings: Mutex::new(settings),
        }
    }

    pub fn get(&self) -> Settings {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies `change` and persists the result when anything changed.
    pub async fn update(&self, change: impl FnOnce(&mut Settings)) -> Result<bool> {
        let updated = {
            let mut settings = self.settings.lock().unwrap_or_else(PoisonError::into_inner);
            let before = settings.clone();
            change(&mut settings);
            (*settings != before).then(|| settings.clone())
        };

        let Some(updated) = updated else {
            return Ok(false);
        };
        debug!("Saving settings into {:?}", self.path);
        fs::write(&self.path, serde_json::to_vec_pretty(&updated)?).await?;
        Ok(true)
    }
}
