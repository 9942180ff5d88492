//! Contract with the remote analytics service. [RemoteApi] is the seam the rest of the crate
//! talks to; [http::HttpApi] is the production implementation.

pub mod http;
pub mod types;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use types::{Heartbeat, SessionStatus, User, UserPreferences};

/// Remote endpoints used by the agent. Every call returns an error for transport failures and
/// non-2xx answers; deciding what an error means is left to the caller. An empty `token` sends
/// the request unauthenticated.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// `GET /ping`
    async fn ping(&self) -> Result<()>;

    /// `GET /users/plugin/state`
    async fn session_status(&self, token: &str) -> Result<SessionStatus>;

    /// `POST /data/batch`
    async fn send_batch(&self, token: &str, batch: &[Value]) -> Result<()>;

    /// `POST /data/heartbeat`
    async fn send_heartbeat(&self, token: &str, heartbeat: &Heartbeat) -> Result<()>;

    /// `GET /users/me`
    async fn current_user(&self, token: &str) -> Result<Option<User>>;

    /// `GET /users/:id`
    async fn user(&self, token: &str, user_id: i64) -> Result<Option<User>>;

    /// `PUT /users/:id/preferences`
    async fn update_preferences(
        &self,
        token: &str,
        user_id: i64,
        preferences: &UserPreferences,
    ) -> Result<()>;

    /// `GET /sessions/summary`
    async fn session_summary(&self, token: &str) -> Result<Option<Map<String, Value>>>;

    /// `GET /dashboard`
    async fn dashboard(&self, token: &str) -> Result<String>;
}
