use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::{
    api::{types::UserPreferences, RemoteApi},
    config::{Settings, SettingsStore},
    storage::session_store::{keys, SessionStore},
};

pub const DEFAULT_SESSION_THRESHOLD_SECONDS: i64 = 60 * 2;

/// Boolean preferences kept in sync between the local settings and the user's profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedFlag {
    ShowGit,
    ShowMusic,
    ShowRank,
}

impl TrackedFlag {
    pub const ALL: [TrackedFlag; 3] = [Self::ShowGit, Self::ShowMusic, Self::ShowRank];

    fn remote(self, preferences: &UserPreferences) -> Option<bool> {
        match self {
            Self::ShowGit => preferences.show_git,
            Self::ShowMusic => preferences.show_music,
            Self::ShowRank => preferences.show_rank,
        }
    }

    fn set_remote(self, preferences: &mut UserPreferences, value: bool) {
        match self {
            Self::ShowGit => preferences.show_git = Some(value),
            Self::ShowMusic => preferences.show_music = Some(value),
            Self::ShowRank => preferences.show_rank = Some(value),
        }
    }

    fn local(self, settings: &Settings) -> Option<bool> {
        match self {
            Self::ShowGit => settings.show_git_metrics,
            Self::ShowMusic => settings.show_music_metrics,
            Self::ShowRank => settings.show_weekly_ranking,
        }
    }

    fn set_local(self, settings: &mut Settings, value: bool) {
        match self {
            Self::ShowGit => settings.show_git_metrics = Some(value),
            Self::ShowMusic => settings.show_music_metrics = Some(value),
            Self::ShowRank => settings.show_weekly_ranking = Some(value),
        }
    }
}

/// Keeps local settings and remote user preferences aligned. Local values win once they are
/// set; unset local values are seeded from the remote.
pub struct PreferenceSync {
    api: Arc<dyn RemoteApi>,
    store: Arc<SessionStore>,
    settings: Arc<SettingsStore>,
}

impl PreferenceSync {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        store: Arc<SessionStore>,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self {
            api,
            store,
            settings,
        }
    }

    /// Pulls the user's profile after a login and stores the values the tracker needs locally.
    /// Falls back to defaults when there is no user or the profile has no preferences.
    pub async fn initialize(&self) -> Result<()> {
        let mut session_threshold = DEFAULT_SESSION_THRESHOLD_SECONDS;
        let mut disable_git_data = false;

        if let Some(jwt) = self.store.get_string(keys::JWT).await {
            if let Some(user) = self.api.current_user(&jwt).await? {
                if user.is_registered() {
                    if let Some(email) = &user.email {
                        self.store.set(keys::NAME, email.as_str()).await?;
                    }
                }
                if let Some(mut preferences) = user.preferences {
                    session_threshold = preferences
                        .session_threshold_in_sec
                        .filter(|v| *v > 0)
                        .unwrap_or(DEFAULT_SESSION_THRESHOLD_SECONDS);
                    disable_git_data = preferences.disable_git_data.unwrap_or(false);
                    self.seed_local(&preferences).await?;

                    // Flags the profile doesn't have yet are filled in from local settings.
                    if apply_local(&mut preferences, &self.settings.get()) {
                        if let Err(e) = self.push(&jwt, user.id, &preferences).await {
                            warn!("Unable to push initial preferences: {e:#}");
                        }
                    }
                }
            }
        }

        self.store
            .set(keys::SESSION_THRESHOLD_IN_SEC, session_threshold)
            .await?;
        self.store.set(keys::DISABLE_GIT_DATA, disable_git_data).await?;
        Ok(())
    }

    /// Reacts to a local configuration change. Returns whether the remote preferences were
    /// updated.
    pub async fn sync(&self) -> Result<bool> {
        let Some(jwt) = self.store.get_string(keys::JWT).await else {
            return Ok(false);
        };
        let Some(user) = self.api.current_user(&jwt).await? else {
            debug!("No user for stored token, skipping preference sync");
            return Ok(false);
        };
        let Some(mut preferences) = self
            .api
            .user(&jwt, user.id)
            .await?
            .and_then(|u| u.preferences)
        else {
            return Ok(false);
        };

        self.seed_local(&preferences).await?;
        if !apply_local(&mut preferences, &self.settings.get()) {
            return Ok(false);
        }
        self.push(&jwt, user.id, &preferences).await?;
        Ok(true)
    }

    async fn push(&self, jwt: &str, user_id: i64, preferences: &UserPreferences) -> Result<()> {
        self.api
            .update_preferences(jwt, user_id, preferences)
            .await?;
        info!("Updated user code time preferences");
        Ok(())
    }

    async fn seed_local(&self, preferences: &UserPreferences) -> Result<()> {
        let seeded = self
            .settings
            .update(|settings| {
                for flag in TrackedFlag::ALL {
                    if let (None, Some(remote)) = (flag.local(settings), flag.remote(preferences)) {
                        flag.set_local(settings, remote);
                    }
                }
            })
            .await?;
        if seeded {
            info!("Seeded local settings from remote preferences");
        }
        Ok(())
    }
}

/// Copies every set local flag onto `preferences`. Returns whether any remote value changed
/// or was missing.
fn apply_local(preferences: &mut UserPreferences, settings: &Settings) -> bool {
    let mut diverged = false;
    for flag in TrackedFlag::ALL {
        match (flag.remote(preferences), flag.local(settings)) {
            (remote, Some(local)) if remote != Some(local) => {
                flag.set_remote(preferences, local);
                diverged = true;
            }
            _ => {}
        }
    }
    diverged
}
