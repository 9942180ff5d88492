use tokio::select;
use tokio_util::sync::CancellationToken;

/// Cancels `cancelation` once the process is asked to stop. Returns early if something else
/// cancelled it first.
///
/// On Windows detached processes can't detect signals sent to them, so the agent there is best
/// run attached to a console.
pub async fn detect_shutdown(cancelation: CancellationToken) {
    select! {
        _ = tokio::signal::ctrl_c() => {
            cancelation.cancel();
        },
        _ = cancelation.cancelled() => {},
    };
}
