use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Represents an entity responsible for providing dates across application. Every TTL and
/// cooldown in the crate reads time through it so tests can move time by hand.
#[async_trait]
pub trait Clock: Sync + Send + 'static {
    fn time(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);

    /// Unix time in whole seconds.
    fn epoch_seconds(&self) -> i64 {
        self.time().timestamp()
    }
}

pub struct DefaultClock;

#[async_trait]
impl Clock for DefaultClock {
    fn time(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
