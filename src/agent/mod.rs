use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    controller::Controller,
    utils::clock::{Clock, DefaultClock},
};

pub mod shutdown;

/// Represents the starting point for the agent. Runs until the process receives ctrl-c.
pub async fn start_agent(dir: PathBuf, api_endpoint: Option<String>) -> Result<()> {
    let controller = Controller::open(&dir, api_endpoint).await?;
    let interval = controller.settings().get().flush_interval();

    let shutdown_token = CancellationToken::new();

    tokio::join!(
        shutdown::detect_shutdown(shutdown_token.clone()),
        run_agent(controller, &DefaultClock, interval, shutdown_token.clone()),
    );

    Ok(())
}

/// Checks the session and flushes right away, then again every `interval`.
async fn run_agent(
    controller: Arc<Controller>,
    clock: &dyn Clock,
    interval: Duration,
    shutdown_token: CancellationToken,
) {
    info!("Agent started, flushing every {}s", interval.as_secs());
    controller.get_user_status(true).await;
    controller.send_offline_data().await;

    loop {
        select! {
            biased;
            _ = shutdown_token.cancelled() => break,
            _ = clock.sleep(interval) => {}
        }

        controller.send_offline_data().await;
        controller.get_user_status(false).await;
    }

    controller.wait_for_background_tasks().await;
    info!("Agent stopped");
}
