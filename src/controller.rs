//! The one object holding all cached agent state. It is built once per process and exposes the
//! operations the editor triggers: status queries, login, flushing and preference changes.

use std::{
    path::Path,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::{bail, Result};
use serde_json::Value;
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    api::{http::HttpApi, types::Heartbeat, RemoteApi},
    config::{SettingsStore, SETTINGS_FILE},
    editor::{ConsoleEditor, Editor},
    storage::{
        payload_log::PayloadLog,
        session_store::{keys, SessionStore},
        DASHBOARD_FILE, PAYLOAD_LOG_FILE, SESSION_FILE, SESSION_SUMMARY_FILE,
    },
    sync::{
        connectivity::Connectivity,
        preferences::PreferenceSync,
        reconciler::{CachedLoginState, Reconciler, UserStatus},
        summary::{SummaryRefresher, SummaryStatus},
        uploader::{BatchUploader, FlushReport},
    },
    utils::{
        clock::{Clock, DefaultClock},
        time::local_utc_offset,
    },
};

pub const DEFAULT_LOGIN_RETRIES: u32 = 50;
pub const LOGIN_RETRY_INTERVAL: Duration = Duration::from_secs(10);
/// Lets other effects of a fresh login settle before the dashboard is refreshed.
const DASHBOARD_REFRESH_DELAY: Duration = Duration::from_secs(1);
const PLUGIN_ID: u32 = 2;

pub const LOGGED_IN_MESSAGE: &str = "Successfully logged on to Code Time";
pub const OFFLINE_MESSAGE: &str =
    "Our service is temporarily unavailable. Please try again later.";

/// Scheduling state of the login retry loop. Only one loop exists at a time: it is started
/// from `Idle` and returns there when it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    Idle,
    /// Waiting for the next attempt.
    Scheduled,
    /// An attempt is checking the session right now.
    Running,
}

pub struct Controller {
    api: Arc<dyn RemoteApi>,
    store: Arc<SessionStore>,
    log: Arc<PayloadLog>,
    settings: Arc<SettingsStore>,
    editor: Arc<dyn Editor>,
    clock: Arc<dyn Clock>,
    connectivity: Arc<Connectivity>,
    reconciler: Reconciler,
    uploader: BatchUploader,
    preferences: PreferenceSync,
    summary: SummaryRefresher,
    retry_phase: Mutex<RetryPhase>,
    tasks: TaskTracker,
}

impl Controller {
    pub fn new(
        dir: &Path,
        api: Arc<dyn RemoteApi>,
        store: Arc<SessionStore>,
        settings: Arc<SettingsStore>,
        editor: Arc<dyn Editor>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let log = Arc::new(PayloadLog::new(dir.join(PAYLOAD_LOG_FILE)));
        let connectivity = Arc::new(Connectivity::new(api.clone(), clock.clone()));

        Arc::new(Self {
            reconciler: Reconciler::new(
                api.clone(),
                store.clone(),
                connectivity.clone(),
                clock.clone(),
            ),
            uploader: BatchUploader::new(
                api.clone(),
                store.clone(),
                log.clone(),
                connectivity.clone(),
            ),
            preferences: PreferenceSync::new(api.clone(), store.clone(), settings.clone()),
            summary: SummaryRefresher::new(
                api.clone(),
                store.clone(),
                connectivity.clone(),
                clock.clone(),
                dir.join(SESSION_SUMMARY_FILE),
                dir.join(DASHBOARD_FILE),
            ),
            api,
            store,
            log,
            settings,
            editor,
            clock,
            connectivity,
            retry_phase: Mutex::new(RetryPhase::Idle),
            tasks: TaskTracker::new(),
        })
    }

    /// Builds the production controller from the application directory.
    pub async fn open(dir: &Path, api_endpoint: Option<String>) -> Result<Arc<Self>> {
        let settings = Arc::new(SettingsStore::load(dir.join(SETTINGS_FILE)).await?);
        let endpoint = api_endpoint.unwrap_or_else(|| settings.get().api_endpoint);
        let api = Arc::new(HttpApi::new(endpoint)?);
        let store = Arc::new(SessionStore::open(dir.join(SESSION_FILE)).await?);

        Ok(Self::new(
            dir,
            api,
            store,
            settings,
            Arc::new(ConsoleEditor),
            Arc::new(DefaultClock),
        ))
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub async fn is_online(&self) -> bool {
        self.connectivity.is_available().await
    }

    pub fn cached_login(&self) -> Option<CachedLoginState> {
        self.reconciler.cached_state()
    }

    pub fn retry_phase(&self) -> RetryPhase {
        *self.lock_retry_phase()
    }

    /// Whether the user is logged in. Served from cache when fresh, see [Reconciler::check].
    /// Logging in kicks off a heartbeat, preference initialisation and a deferred dashboard
    /// refresh in the background.
    #[instrument(skip(self))]
    pub async fn get_user_status(self: &Arc<Self>, force_refresh: bool) -> UserStatus {
        let check = self.reconciler.check(force_refresh).await;
        if check.became_logged_in {
            self.on_logged_in();
        }
        check.status
    }

    fn on_logged_in(self: &Arc<Self>) {
        let this = self.clone();
        self.tasks.spawn(async move {
            this.send_heartbeat("STATE_CHANGE:LOGGED_IN:true").await;
            if let Err(e) = this.preferences.initialize().await {
                warn!("Unable to initialize preferences: {e:#}");
            }
        });

        let this = self.clone();
        self.tasks.spawn(async move {
            this.clock.sleep(DASHBOARD_REFRESH_DELAY).await;
            this.fetch_session_summary_info().await;
        });
    }

    /// Starts the browser login flow and polls for its result.
    #[instrument(skip(self))]
    pub async fn handle_code_time_login(self: &Arc<Self>) -> Result<()> {
        if !self.connectivity.is_available().await {
            self.editor.show_information_message(OFFLINE_MESSAGE);
            return Ok(());
        }

        let url = self.build_login_url().await?;
        self.editor.launch_url(&url)?;
        self.refetch_user_status_lazily(DEFAULT_LOGIN_RETRIES, LOGIN_RETRY_INTERVAL);
        Ok(())
    }

    /// Opens the web dashboard when logged in, the login page otherwise.
    #[instrument(skip(self))]
    pub async fn handle_kpm_clicked(self: &Arc<Self>) -> Result<()> {
        if self.get_user_status(false).await.logged_in {
            return self.launch_web_dashboard().await;
        }
        let url = self.build_login_url().await?;
        self.editor.launch_url(&url)?;
        self.refetch_user_status_lazily(DEFAULT_LOGIN_RETRIES, LOGIN_RETRY_INTERVAL);
        Ok(())
    }

    pub async fn launch_web_dashboard(&self) -> Result<()> {
        let jwt = self.store.get_string(keys::JWT).await.unwrap_or_default();
        let url = format!(
            "{}/login?token={}",
            self.settings.get().app_url.trim_end_matches('/'),
            urlencoding::encode(&jwt)
        );
        self.editor.launch_url(&url)
    }

    async fn build_login_url(&self) -> Result<String> {
        let callback_state = Uuid::new_v4().to_string();
        self.store
            .set(keys::AUTH_CALLBACK_STATE, callback_state.as_str())
            .await?;
        Ok(format!(
            "{}/onboarding?plugin=codetime&token={}",
            self.settings.get().app_url.trim_end_matches('/'),
            urlencoding::encode(&callback_state)
        ))
    }

    /// Polls the session status every `interval` until the user shows up as logged in, for
    /// `tries` retries after the first attempt. Returns `None` when a loop is already active.
    pub fn refetch_user_status_lazily(
        self: &Arc<Self>,
        tries: u32,
        interval: Duration,
    ) -> Option<JoinHandle<()>> {
        {
            let mut phase = self.lock_retry_phase();
            if *phase != RetryPhase::Idle {
                debug!("Login check already {:?}", *phase);
                return None;
            }
            *phase = RetryPhase::Scheduled;
        }

        let this = self.clone();
        Some(self.tasks.spawn(this.retry_login(tries, interval)))
    }

    async fn retry_login(self: Arc<Self>, mut remaining: u32, interval: Duration) {
        loop {
            self.clock.sleep(interval).await;
            self.set_retry_phase(RetryPhase::Running);

            if self.get_user_status(true).await.logged_in {
                self.finish_login().await;
                break;
            }
            if remaining == 0 {
                self.abandon_login().await;
                break;
            }
            remaining -= 1;
            self.set_retry_phase(RetryPhase::Scheduled);
        }
        self.set_retry_phase(RetryPhase::Idle);
    }

    async fn finish_login(&self) {
        if let Err(e) = self.clear_login_markers().await {
            warn!("Unable to clear login markers: {e:#}");
        }
        self.summary.reset();
        if let Err(e) = self.summary.clear().await {
            warn!("Unable to clear session summary: {e:#}");
        }
        self.editor.show_information_message(LOGGED_IN_MESSAGE);
    }

    async fn abandon_login(&self) {
        info!("Login wasn't detected, manual login required");
        let result = async {
            self.store.set(keys::CHECK_STATUS, true).await?;
            self.clear_login_markers().await
        }
        .await;
        if let Err(e) = result {
            warn!("Unable to reset login markers: {e:#}");
        }
    }

    async fn clear_login_markers(&self) -> Result<()> {
        self.store.remove(keys::SWITCHING_ACCOUNT).await?;
        self.store.remove(keys::AUTH_CALLBACK_STATE).await?;
        Ok(())
    }

    /// Queues a telemetry payload for the next flush.
    pub async fn record_payload(&self, payload: &Value) -> Result<()> {
        if payload.is_null() {
            bail!("Refusing to queue an empty payload");
        }
        if self.settings.get().toggle_file_event_logging {
            info!("Tracked payload {payload}");
        }
        self.log.append(payload).await
    }

    pub async fn pending_payloads(&self) -> Result<usize> {
        self.log.len().await
    }

    /// Uploads queued payloads and refreshes the summary afterwards. `None` when offline.
    #[instrument(skip(self))]
    pub async fn send_offline_data(&self) -> Option<FlushReport> {
        let report = self
            .uploader
            .flush()
            .await
            .inspect_err(|e| warn!("Unable to flush offline data: {e:#}"))
            .ok()
            .flatten()?;
        self.fetch_session_summary_info().await;
        Some(report)
    }

    pub async fn fetch_session_summary_info(&self) -> SummaryStatus {
        self.summary
            .fetch_session_summary_info()
            .await
            .unwrap_or_else(|e| {
                warn!("Unable to refresh session summary: {e:#}");
                SummaryStatus::NoData
            })
    }

    /// Configuration change hook. Returns whether the remote preferences were updated.
    #[instrument(skip(self))]
    pub async fn update_preferences(&self) -> bool {
        if !self.connectivity.is_available().await {
            return false;
        }
        self.preferences.sync().await.unwrap_or_else(|e| {
            warn!("Unable to sync preferences: {e:#}");
            false
        })
    }

    pub async fn send_heartbeat(&self, reason: &str) {
        let Some(jwt) = self.store.get_string(keys::JWT).await else {
            return;
        };
        if !self.connectivity.is_available().await {
            return;
        }

        let heartbeat = Heartbeat {
            plugin_id: PLUGIN_ID,
            os: std::env::consts::OS.to_owned(),
            start: self.clock.epoch_seconds(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            hostname: System::host_name().unwrap_or_default(),
            timezone: local_utc_offset(),
            trigger_annotation: reason.to_owned(),
        };
        if let Err(e) = self.api.send_heartbeat(&jwt, &heartbeat).await {
            warn!("Unable to send heartbeat ping: {e:#}");
        }
    }

    /// Forgets the current account.
    pub async fn logout(&self) -> Result<()> {
        for key in [
            keys::JWT,
            keys::NAME,
            keys::CHECK_STATUS,
            keys::SWITCHING_ACCOUNT,
            keys::AUTH_CALLBACK_STATE,
        ] {
            self.store.remove(key).await?;
        }
        self.reconciler.reset();
        self.summary.reset();
        self.summary.clear().await?;
        info!("Logged out");
        Ok(())
    }

    /// Waits for every background task spawned so far, including an active login loop.
    pub async fn wait_for_background_tasks(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    fn lock_retry_phase(&self) -> std::sync::MutexGuard<'_, RetryPhase> {
        self.retry_phase
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_retry_phase(&self, phase: RetryPhase) {
        *self.lock_retry_phase() = phase;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use anyhow::{anyhow, Result};
    use mockall::predicate::{always, eq, function};
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    use super::{Controller, RetryPhase, LOGGED_IN_MESSAGE, OFFLINE_MESSAGE};
    use crate::{
        api::{
            types::{PluginUser, SessionState, SessionStatus},
            MockRemoteApi,
        },
        config::{Settings, SettingsStore},
        editor::MockEditor,
        storage::session_store::{keys, SessionStore},
        utils::{
            clock::{test_clock::ManualClock, Clock},
            logging::TEST_LOGGING,
        },
    };

    struct Fixture {
        dir: TempDir,
        store: Arc<SessionStore>,
        clock: ManualClock,
        controller: Arc<Controller>,
    }

    async fn fixture(api: MockRemoteApi, editor: MockEditor) -> Result<Fixture> {
        fixture_with_clock(api, editor, ManualClock::new()).await
    }

    async fn fixture_with_clock(
        api: MockRemoteApi,
        editor: MockEditor,
        clock: ManualClock,
    ) -> Result<Fixture> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let store = Arc::new(SessionStore::open(dir.path().join("session.json")).await?);
        store.set(keys::JWT, "JWT local").await?;
        let settings = Arc::new(SettingsStore::new(
            dir.path().join("settings.json"),
            Settings::default(),
        ));
        let controller = Controller::new(
            dir.path(),
            Arc::new(api),
            store.clone(),
            settings,
            Arc::new(editor),
            Arc::new(clock.clone()),
        );
        Ok(Fixture {
            dir,
            store,
            clock,
            controller,
        })
    }

    fn logged_in() -> SessionStatus {
        SessionStatus {
            state: SessionState::Ok,
            user: Some(PluginUser {
                email: Some("dev@example.com".into()),
                plugin_jwt: Some("JWT local".into()),
                registered: 1,
            }),
        }
    }

    /// Expectations for everything a fresh login triggers in the background.
    fn expect_login_effects(api: &mut MockRemoteApi) {
        api.expect_send_heartbeat()
            .with(
                eq("JWT local"),
                function(|h: &crate::api::types::Heartbeat| {
                    h.trigger_annotation == "STATE_CHANGE:LOGGED_IN:true"
                }),
            )
            .times(1)
            .returning(|_, _| Ok(()));
        api.expect_current_user().times(1).returning(|_| Ok(None));
        api.expect_session_summary()
            .times(1)
            .returning(|_| Ok(None));
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_budget() -> Result<()> {
        let mut api = MockRemoteApi::new();
        api.expect_ping().returning(|| Ok(()));
        api.expect_session_status().times(3).returning(|_| {
            Ok(SessionStatus {
                state: SessionState::NotFound,
                user: None,
            })
        });
        let mut editor = MockEditor::new();
        editor.expect_show_information_message().never();
        let f = fixture(api, editor).await?;
        f.store.set(keys::SWITCHING_ACCOUNT, true).await?;
        f.store.set(keys::AUTH_CALLBACK_STATE, "callback-123").await?;

        let handle = f
            .controller
            .refetch_user_status_lazily(2, Duration::from_secs(10))
            .unwrap();
        assert_eq!(f.controller.retry_phase(), RetryPhase::Scheduled);
        assert!(f
            .controller
            .refetch_user_status_lazily(2, Duration::from_secs(10))
            .is_none());
        handle.await?;

        assert_eq!(f.controller.retry_phase(), RetryPhase::Idle);
        assert!(f.store.get_bool(keys::CHECK_STATUS).await);
        assert!(!f.store.get_bool(keys::SWITCHING_ACCOUNT).await);
        assert_eq!(f.store.get_string(keys::AUTH_CALLBACK_STATE).await, None);
        // Credentials are untouched by giving up.
        assert_eq!(
            f.store.get_string(keys::JWT).await.as_deref(),
            Some("JWT local")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_stops_once_logged_in() -> Result<()> {
        let mut api = MockRemoteApi::new();
        api.expect_ping().returning(|| Ok(()));
        let mut answers = vec![SessionStatus::unknown(), logged_in()].into_iter();
        api.expect_session_status()
            .times(2)
            .returning(move |_| Ok(answers.next().unwrap()));
        expect_login_effects(&mut api);
        let mut editor = MockEditor::new();
        editor
            .expect_show_information_message()
            .with(eq(LOGGED_IN_MESSAGE))
            .times(1)
            .return_const(());
        let f = fixture(api, editor).await?;

        f.controller
            .refetch_user_status_lazily(5, Duration::from_secs(10))
            .unwrap()
            .await?;
        f.controller.wait_for_background_tasks().await;

        assert_eq!(f.controller.retry_phase(), RetryPhase::Idle);
        assert!(!f.store.get_bool(keys::CHECK_STATUS).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_login_edge_runs_side_effects_once() -> Result<()> {
        let mut api = MockRemoteApi::new();
        api.expect_ping().returning(|| Ok(()));
        api.expect_session_status()
            .times(2)
            .returning(|_| Ok(logged_in()));
        expect_login_effects(&mut api);
        let f = fixture(api, MockEditor::new()).await?;

        assert!(f.controller.get_user_status(false).await.logged_in);
        assert!(f.controller.get_user_status(false).await.logged_in);
        assert!(f.controller.get_user_status(true).await.logged_in);
        f.controller.wait_for_background_tasks().await;

        assert_eq!(
            f.store.get(keys::SESSION_THRESHOLD_IN_SEC).await,
            Some(json!(120))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_login_effects_run_after_status_returns() -> Result<()> {
        let mut api = MockRemoteApi::new();
        api.expect_ping().returning(|| Ok(()));
        api.expect_session_status().returning(|_| Ok(logged_in()));
        let heartbeat_sent = Arc::new(AtomicBool::new(false));
        let sent = heartbeat_sent.clone();
        api.expect_send_heartbeat().times(1).returning(move |_, _| {
            sent.store(true, Ordering::SeqCst);
            Ok(())
        });
        api.expect_current_user().returning(|_| Ok(None));
        let summary_requested_at = Arc::new(Mutex::new(None));
        let requested_at = summary_requested_at.clone();
        let clock = ManualClock::new();
        let summary_clock = clock.clone();
        api.expect_session_summary().times(1).returning(move |_| {
            *requested_at.lock().unwrap() = Some(summary_clock.time());
            Ok(None)
        });
        let f = fixture_with_clock(api, MockEditor::new(), clock).await?;
        let logged_in_at = f.clock.time();

        assert!(f.controller.get_user_status(false).await.logged_in);
        assert!(!heartbeat_sent.load(Ordering::SeqCst));
        assert_eq!(*summary_requested_at.lock().unwrap(), None);

        f.controller.wait_for_background_tasks().await;
        assert!(heartbeat_sent.load(Ordering::SeqCst));
        assert_eq!(
            *summary_requested_at.lock().unwrap(),
            Some(logged_in_at + chrono::Duration::seconds(1))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_offline_login_shows_prompt() -> Result<()> {
        let mut api = MockRemoteApi::new();
        api.expect_ping()
            .times(1)
            .returning(|| Err(anyhow!("connection refused")));
        let mut editor = MockEditor::new();
        editor
            .expect_show_information_message()
            .with(eq(OFFLINE_MESSAGE))
            .times(1)
            .return_const(());
        editor.expect_launch_url().never();
        let f = fixture(api, editor).await?;

        f.controller.handle_code_time_login().await?;

        assert_eq!(f.controller.retry_phase(), RetryPhase::Idle);
        assert_eq!(f.store.get_string(keys::AUTH_CALLBACK_STATE).await, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_login_opens_browser_with_callback_state() -> Result<()> {
        let mut api = MockRemoteApi::new();
        api.expect_ping().returning(|| Ok(()));
        api.expect_session_status()
            .withf(|token| token.len() == 36)
            .times(1)
            .returning(|_| Ok(logged_in()));
        expect_login_effects(&mut api);
        let mut editor = MockEditor::new();
        editor
            .expect_launch_url()
            .withf(|url| {
                url.strip_prefix("https://app.software.com/onboarding?plugin=codetime&token=")
                    .is_some_and(|state| state.len() == 36)
            })
            .times(1)
            .returning(|_| Ok(()));
        editor
            .expect_show_information_message()
            .with(eq(LOGGED_IN_MESSAGE))
            .times(1)
            .return_const(());
        let f = fixture(api, editor).await?;

        f.controller.handle_code_time_login().await?;
        assert_eq!(f.controller.retry_phase(), RetryPhase::Scheduled);
        assert!(f.store.get_string(keys::AUTH_CALLBACK_STATE).await.is_some());

        f.controller.wait_for_background_tasks().await;
        assert_eq!(f.store.get_string(keys::AUTH_CALLBACK_STATE).await, None);
        assert_eq!(
            f.store.get_string(keys::NAME).await.as_deref(),
            Some("dev@example.com")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_send_offline_data_flushes_and_refreshes() -> Result<()> {
        let mut api = MockRemoteApi::new();
        api.expect_ping().returning(|| Ok(()));
        api.expect_send_batch()
            .with(eq("JWT local"), always())
            .times(1)
            .returning(|_, batch| {
                assert_eq!(batch.len(), 2);
                Ok(())
            });
        api.expect_session_summary()
            .times(1)
            .returning(|_| Ok(None));
        let f = fixture(api, MockEditor::new()).await?;

        f.controller
            .record_payload(&json!({ "keystrokes": 10 }))
            .await?;
        f.controller
            .record_payload(&json!({ "keystrokes": 20 }))
            .await?;
        assert!(f.controller.record_payload(&json!(null)).await.is_err());
        assert_eq!(f.controller.pending_payloads().await?, 2);

        let report = f.controller.send_offline_data().await.unwrap();
        assert_eq!(report.payloads, 2);
        assert_eq!(f.controller.pending_payloads().await?, 0);
        assert!(!f.dir.path().join("data.json").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_logout_clears_account() -> Result<()> {
        let mut api = MockRemoteApi::new();
        api.expect_ping().returning(|| Ok(()));
        api.expect_session_status().never();
        let f = fixture(api, MockEditor::new()).await?;
        f.store.set(keys::NAME, "dev@example.com").await?;

        f.controller.logout().await?;

        assert_eq!(f.store.get_string(keys::JWT).await, None);
        assert_eq!(f.store.get_string(keys::NAME).await, None);
        assert!(f.controller.cached_login().is_none());
        // No token left, so the status check stays local.
        assert!(!f.controller.get_user_status(false).await.logged_in);
        Ok(())
    }
}
