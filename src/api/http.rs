use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{header::AUTHORIZATION, Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use super::{
    types::{Heartbeat, SessionStatus, User, UserPreferences},
    RemoteApi,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Responses of the user endpoints wrap the entity into `data`.
#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: Option<T>,
}

/// [RemoteApi] over HTTP.
pub struct HttpApi {
    client: Client,
    endpoint: String,
}

impl HttpApi {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_owned(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }

    fn authorized(builder: RequestBuilder, token: &str) -> RequestBuilder {
        if token.is_empty() {
            builder
        } else {
            builder.header(AUTHORIZATION, token)
        }
    }

    async fn send(builder: RequestBuilder, token: &str) -> Result<Response> {
        let response = Self::authorized(builder, token).send().await?;
        debug!("{} answered {}", response.url(), response.status());
        Ok(response.error_for_status()?)
    }
}

#[async_trait]
impl RemoteApi for HttpApi {
    #[instrument(skip(self))]
    async fn ping(&self) -> Result<()> {
        Self::send(self.client.get(self.url("/ping")).timeout(PING_TIMEOUT), "").await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn session_status(&self, token: &str) -> Result<SessionStatus> {
        let response = Self::send(self.client.get(self.url("/users/plugin/state")), token).await?;
        Ok(response.json().await?)
    }

    #[instrument(skip_all, fields(size = batch.len()))]
    async fn send_batch(&self, token: &str, batch: &[Value]) -> Result<()> {
        Self::send(self.client.post(self.url("/data/batch")).json(batch), token).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(reason = %heartbeat.trigger_annotation))]
    async fn send_heartbeat(&self, token: &str, heartbeat: &Heartbeat) -> Result<()> {
        Self::send(self.client.post(self.url("/data/heartbeat")).json(heartbeat), token).await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn current_user(&self, token: &str) -> Result<Option<User>> {
        let response = Self::send(self.client.get(self.url("/users/me")), token).await?;
        Ok(response.json::<DataEnvelope<User>>().await?.data)
    }

    #[instrument(skip(self, token))]
    async fn user(&self, token: &str, user_id: i64) -> Result<Option<User>> {
        let response =
            Self::send(self.client.get(self.url(&format!("/users/{user_id}"))), token).await?;
        Ok(response.json::<DataEnvelope<User>>().await?.data)
    }

    #[instrument(skip(self, token, preferences))]
    async fn update_preferences(
        &self,
        token: &str,
        user_id: i64,
        preferences: &UserPreferences,
    ) -> Result<()> {
        let url = self.url(&format!("/users/{user_id}/preferences"));
        Self::send(self.client.put(url).json(preferences), token).await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn session_summary(&self, token: &str) -> Result<Option<Map<String, Value>>> {
        let response = Self::send(self.client.get(self.url("/sessions/summary")), token).await?;
        match response.json::<Value>().await? {
            Value::Object(summary) => Ok(Some(summary)),
            _ => Ok(None),
        }
    }

    #[instrument(skip_all)]
    async fn dashboard(&self, token: &str) -> Result<String> {
        let request = self.client.get(self.url("/dashboard")).query(&dashboard_query());
        let response = Self::send(request, token).await?;
        Ok(response.text().await?)
    }
}

fn dashboard_query() -> [(&'static str, String); 2] {
    [
        ("linux", cfg!(target_os = "linux").to_string()),
        ("showToday", true.to_string()),
    ]
}
