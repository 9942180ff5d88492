use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::{api::RemoteApi, utils::clock::Clock};

/// Minimum number of seconds between two reachability probes.
pub const PROBE_COOLDOWN_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
    pub available: bool,
    pub last_checked: i64,
}

/// Rate limited answer to "can the remote service be reached right now". A stale answer is
/// served for up to [PROBE_COOLDOWN_SECS].
pub struct Connectivity {
    api: Arc<dyn RemoteApi>,
    clock: Arc<dyn Clock>,
    state: Mutex<Option<ConnectivityState>>,
}

impl Connectivity {
    pub fn new(api: Arc<dyn RemoteApi>, clock: Arc<dyn Clock>) -> Self {
        Self {
            api,
            clock,
            state: Mutex::new(None),
        }
    }

    /// Never fails: transport errors and non-2xx answers just mean unavailable.
    pub async fn is_available(&self) -> bool {
        let now = self.clock.epoch_seconds();
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = *state;
            match previous {
                Some(s) if now - s.last_checked <= PROBE_COOLDOWN_SECS => return s.available,
                previous => {
                    // The check time is claimed before probing so the cooldown also holds
                    // while the probe is in flight and after it fails.
                    *state = Some(ConnectivityState {
                        available: previous.map_or(true, |s| s.available),
                        last_checked: now,
                    });
                }
            }
        }

        let available = self
            .api
            .ping()
            .await
            .inspect_err(|e| warn!("Remote service is unreachable: {e:#}"))
            .is_ok();
        debug!("Connectivity probe finished, available: {available}");

        if let Some(state) = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            state.available = available;
        }
        available
    }

    pub fn state(&self) -> Option<ConnectivityState> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
