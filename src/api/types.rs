use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Login state reported by `/users/plugin/state`. Anything the service sends that isn't one of
/// the known discriminants is treated as [SessionState::Unknown].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Ok,
    NotFound,
    Anonymous,
    #[default]
    #[serde(other)]
    Unknown,
}

/// User attached to a session status answer.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PluginUser {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub plugin_jwt: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub registered: i64,
}

/// Validated answer of the session status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SessionStatus {
    #[serde(default, deserialize_with = "null_as_default")]
    pub state: SessionState,
    #[serde(default)]
    pub user: Option<PluginUser>,
}

impl SessionStatus {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_logged_in(&self) -> bool {
        self.state == SessionState::Ok
    }
}

/// Remote preferences of a user. Keys the agent doesn't track are kept in `other` so pushing
/// an update never drops them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_threshold_in_sec: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_git_data: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_git: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_music: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_rank: Option<bool>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct User {
    #[serde(deserialize_with = "id_from_number_or_string")]
    pub id: i64,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub registered: i64,
    #[serde(default)]
    pub preferences: Option<UserPreferences>,
}

impl User {
    pub fn is_registered(&self) -> bool {
        self.registered == 1
    }
}

/// Keep-alive sent whenever the login state changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Heartbeat {
    #[serde(rename = "pluginId")]
    pub plugin_id: u32,
    pub os: String,
    pub start: i64,
    pub version: String,
    pub hostname: String,
    pub timezone: String,
    pub trigger_annotation: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn id_from_number_or_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(i64),
        Text(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Number(id) => Ok(id),
        RawId::Text(id) => id.trim().parse().map_err(serde::de::Error::custom),
    }
}
