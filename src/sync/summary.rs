use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::Result;
use serde_json::{Map, Value};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::{
    api::RemoteApi,
    storage::session_store::{keys, SessionStore},
    utils::{clock::Clock, time::day_hour_marker},
};

use super::connectivity::Connectivity;

/// Local only field of the summary, the remote doesn't know about it.
const LAST_START_FIELD: &str = "lastStart";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryStatus {
    /// Fresh data was fetched and saved.
    Updated,
    /// Already refreshed this hour or offline, the saved summary is current enough.
    Cached,
    /// The remote didn't return a summary.
    NoData,
}

/// Refreshes the session summary and the dashboard at most once per wall-clock hour.
pub struct SummaryRefresher {
    api: Arc<dyn RemoteApi>,
    store: Arc<SessionStore>,
    connectivity: Arc<Connectivity>,
    clock: Arc<dyn Clock>,
    summary_path: PathBuf,
    dashboard_path: PathBuf,
    last_day_hour: Mutex<Option<String>>,
}

impl SummaryRefresher {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        store: Arc<SessionStore>,
        connectivity: Arc<Connectivity>,
        clock: Arc<dyn Clock>,
        summary_path: PathBuf,
        dashboard_path: PathBuf,
    ) -> Self {
        Self {
            api,
            store,
            connectivity,
            clock,
            summary_path,
            dashboard_path,
            last_day_hour: Mutex::new(None),
        }
    }

    /// True the first time it's called in a new hour.
    pub fn is_new_hour(&self) -> bool {
        let marker = day_hour_marker(self.clock.time());
        let mut last = self
            .last_day_hour
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if last.as_deref() == Some(marker.as_str()) {
            return false;
        }
        *last = Some(marker);
        true
    }

    /// Makes the next refresh go to the remote regardless of the hour.
    pub fn reset(&self) {
        *self
            .last_day_hour
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub async fn load_summary(&self) -> Result<Map<String, Value>> {
        match fs::read_to_string(&self.summary_path).await {
            Ok(content) => Ok(serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Session summary file is corrupted: {e}");
                Map::new()
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e)?,
        }
    }

    /// Clears the saved summary, e.g. after a different account logged in.
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.summary_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)?,
        }
    }

    pub async fn fetch_session_summary_info(&self) -> Result<SummaryStatus> {
        if !self.is_new_hour() || !self.connectivity.is_available().await {
            debug!("Using saved session summary");
            return Ok(SummaryStatus::Cached);
        }

        let token = self.store.get_string(keys::JWT).await.unwrap_or_default();
        let Some(mut summary) = self
            .api
            .session_summary(&token)
            .await
            .inspect_err(|e| warn!("Unable to fetch session summary: {e:#}"))
            .ok()
            .flatten()
        else {
            return Ok(SummaryStatus::NoData);
        };

        let saved = self.load_summary().await?;
        match saved.get(LAST_START_FIELD) {
            Some(last_start) => {
                summary.insert(LAST_START_FIELD.into(), last_start.clone());
            }
            None => {
                summary.remove(LAST_START_FIELD);
            }
        }
        fs::write(&self.summary_path, serde_json::to_vec_pretty(&summary)?).await?;
        info!("Saved session summary");

        self.fetch_dashboard(&token).await?;
        Ok(SummaryStatus::Updated)
    }

    async fn fetch_dashboard(&self, token: &str) -> Result<()> {
        let content = match self.api.dashboard(token).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Unable to fetch dashboard: {e:#}");
                "No data available\n".to_owned()
            }
        };
        fs::write(&self.dashboard_path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::{anyhow, Result};
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    use super::{SummaryRefresher, SummaryStatus};
    use crate::{
        api::MockRemoteApi,
        storage::session_store::{keys, SessionStore},
        sync::connectivity::Connectivity,
        utils::clock::test_clock::ManualClock,
    };

    async fn refresher(
        dir: &TempDir,
        api: MockRemoteApi,
        clock: ManualClock,
    ) -> Result<SummaryRefresher> {
        let store = Arc::new(SessionStore::open(dir.path().join("session.json")).await?);
        store.set(keys::JWT, "JWT local").await?;
        let api = Arc::new(api);
        let clock = Arc::new(clock);
        let connectivity = Arc::new(Connectivity::new(api.clone(), clock.clone()));
        Ok(SummaryRefresher::new(
            api,
            store,
            connectivity,
            clock,
            dir.path().join("sessionSummary.json"),
            dir.path().join("CodeTime.txt"),
        ))
    }

    #[tokio::test]
    async fn test_refreshes_once_per_hour() -> Result<()> {
        let dir = tempdir()?;
        let mut api = MockRemoteApi::new();
        api.expect_ping().returning(|| Ok(()));
        api.expect_session_summary()
            .times(2)
            .returning(|_| Ok(Some(serde_json::from_value(json!({ "currentDayMinutes": 42 }))?)));
        api.expect_dashboard()
            .times(2)
            .returning(|_| Ok("CODE TIME\n".into()));
        let clock = ManualClock::new();
        let refresher = refresher(&dir, api, clock.clone()).await?;

        assert_eq!(
            refresher.fetch_session_summary_info().await?,
            SummaryStatus::Updated
        );
        clock.advance(60 * 10);
        assert_eq!(
            refresher.fetch_session_summary_info().await?,
            SummaryStatus::Cached
        );
        clock.advance(60 * 60);
        assert_eq!(
            refresher.fetch_session_summary_info().await?,
            SummaryStatus::Updated
        );

        assert_eq!(
            tokio::fs::read_to_string(dir.path().join("CodeTime.txt")).await?,
            "CODE TIME\n"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_keeps_local_last_start() -> Result<()> {
        let dir = tempdir()?;
        tokio::fs::write(
            dir.path().join("sessionSummary.json"),
            r#"{"lastStart": 1530662400, "currentDayMinutes": 1}"#,
        )
        .await?;
        let mut api = MockRemoteApi::new();
        api.expect_ping().returning(|| Ok(()));
        api.expect_session_summary().returning(|_| {
            Ok(Some(serde_json::from_value(
                json!({ "currentDayMinutes": 42, "lastStart": 5 }),
            )?))
        });
        api.expect_dashboard()
            .returning(|_| Err(anyhow!("502 Bad Gateway")));
        let refresher = refresher(&dir, api, ManualClock::new()).await?;

        refresher.fetch_session_summary_info().await?;

        let summary = refresher.load_summary().await?;
        assert_eq!(summary.get("lastStart"), Some(&json!(1530662400)));
        assert_eq!(summary.get("currentDayMinutes"), Some(&json!(42)));
        assert_eq!(
            tokio::fs::read_to_string(dir.path().join("CodeTime.txt")).await?,
            "No data available\n"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_summary_is_no_data() -> Result<()> {
        let dir = tempdir()?;
        let mut api = MockRemoteApi::new();
        api.expect_ping().returning(|| Ok(()));
        api.expect_session_summary()
            .returning(|_| Err(anyhow!("401 Unauthorized")));
        api.expect_dashboard().never();
        let refresher = refresher(&dir, api, ManualClock::new()).await?;

        assert_eq!(
            refresher.fetch_session_summary_info().await?,
            SummaryStatus::NoData
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_reset_forces_refresh() -> Result<()> {
        let dir = tempdir()?;
        let mut api = MockRemoteApi::new();
        api.expect_ping().returning(|| Ok(()));
        api.expect_session_summary()
            .times(2)
            .returning(|_| Ok(Some(Default::default())));
        api.expect_dashboard().returning(|_| Ok(String::new()));
        let refresher = refresher(&dir, api, ManualClock::new()).await?;

        refresher.fetch_session_summary_info().await?;
        refresher.reset();
        assert_eq!(
            refresher.fetch_session_summary_info().await?,
            SummaryStatus::Updated
        );
        Ok(())
    }
}
