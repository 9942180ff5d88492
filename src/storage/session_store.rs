use std::{io::ErrorKind, path::PathBuf};

use anyhow::Result;
use serde_json::{Map, Value};
use tokio::{fs, sync::Mutex};
use tracing::{debug, warn};

/// Keys persisted in the session store.
pub mod keys {
    pub const JWT: &str = "jwt";
    pub const NAME: &str = "name";
    pub const AUTH_TYPE: &str = "authType";
    pub const SESSION_THRESHOLD_IN_SEC: &str = "sessionThresholdInSec";
    pub const DISABLE_GIT_DATA: &str = "disableGitData";
    pub const SWITCHING_ACCOUNT: &str = "switching_account";
    /// Set when a login attempt ran out of retries and the user has to log in again manually.
    pub const CHECK_STATUS: &str = "check_status";
    pub const AUTH_CALLBACK_STATE: &str = "auth_callback_state";
}

/// Process-wide key-value store persisted as one JSON object. Values are cached in memory and
/// the file is rewritten on every change.
pub struct SessionStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl SessionStore {
    pub async fn open(path: PathBuf) -> Result<Self> {
        let values = match fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => Map::new(),
            Ok(content) => match serde_json::from_str::<Map<String, Value>>(&content) {
                Ok(values) => values,
                Err(e) => {
                    warn!("Session file {path:?} is corrupted, starting empty: {e}");
                    Map::new()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Map::new(),
            Err(e) => Err(e)?,
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.values
            .lock()
            .await
            .get(key)
            .filter(|v| !v.is_null())
            .cloned()
    }

    /// Returns a non-empty string value.
    pub async fn get_string(&self, key: &str) -> Option<String> {
        match self.get(key).await {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    pub async fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key).await, Some(Value::Bool(true)))
    }

    /// Stores a value. Returns whether the stored value changed; the file is only rewritten
    /// when it did.
    pub async fn set(&self, key: &str, value: impl Into<Value>) -> Result<bool> {
        let value = value.into();
        if value.is_null() {
            return self.remove(key).await;
        }

        let mut values = self.values.lock().await;
        if values.get(key) == Some(&value) {
            return Ok(false);
        }
        debug!("Updating session key {key}");
        values.insert(key.to_owned(), value);
        self.persist(&values).await?;
        Ok(true)
    }

    pub async fn remove(&self, key: &str) -> Result<bool> {
        let mut values = self.values.lock().await;
        if values.remove(key).is_none() {
            return Ok(false);
        }
        debug!("Clearing session key {key}");
        self.persist(&values).await?;
        Ok(true)
    }

    async fn persist(&self, values: &Map<String, Value>) -> Result<()> {
        let content = serde_json::to_vec_pretty(values)?;
        let temp = self.path.with_extension("json.tmp");
        fs::write(&temp, content).await?;
        fs::rename(&temp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use serde_json::json;
    use tempfile::tempdir;

    use super::{keys, SessionStore};

    #[tokio::test]
    async fn test_values_survive_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("session.json");

        let store = SessionStore::open(path.clone()).await?;
        store.set(keys::JWT, "token").await?;
        store.set(keys::SESSION_THRESHOLD_IN_SEC, 120).await?;
        store.set(keys::SWITCHING_ACCOUNT, true).await?;

        let reopened = SessionStore::open(path).await?;
        assert_eq!(reopened.get_string(keys::JWT).await.as_deref(), Some("token"));
        assert_eq!(
            reopened.get(keys::SESSION_THRESHOLD_IN_SEC).await,
            Some(json!(120))
        );
        assert!(reopened.get_bool(keys::SWITCHING_ACCOUNT).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_set_reports_changes_only() -> Result<()> {
        let dir = tempdir()?;
        let store = SessionStore::open(dir.path().join("session.json")).await?;

        assert!(store.set(keys::NAME, "a@b.c").await?);
        assert!(!store.set(keys::NAME, "a@b.c").await?);
        assert!(store.set(keys::NAME, "d@e.f").await?);
        assert!(store.remove(keys::NAME).await?);
        assert!(!store.remove(keys::NAME).await?);
        assert_eq!(store.get_string(keys::NAME).await, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_null_and_empty_values_read_as_missing() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("session.json");
        tokio::fs::write(&path, r#"{"jwt": "", "name": null, "check_status": "yes"}"#).await?;

        let store = SessionStore::open(path).await?;
        assert_eq!(store.get_string(keys::JWT).await, None);
        assert_eq!(store.get(keys::NAME).await, None);
        assert!(!store.get_bool(keys::CHECK_STATUS).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupted_file_starts_empty() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("session.json");
        tokio::fs::write(&path, "{not json").await?;

        let store = SessionStore::open(path).await?;
        assert_eq!(store.get(keys::JWT).await, None);
        store.set(keys::JWT, "fresh").await?;
        assert_eq!(store.get_string(keys::JWT).await.as_deref(), Some("fresh"));
        Ok(())
    }
}
