use core::time::Duration;
use psyche_tonic_core::psyche::ConnectionRegistry;
use std::sync::Arc;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

/// Logs the number of viewers on every known canvas once per `every`, until
/// `shutdown` is cancelled.
pub async fn log_connections(
    registry: Arc<ConnectionRegistry>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; nothing has connected yet.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let census = registry.census();
                if census.is_empty() {
                    tracing::info!("No canvases have been opened yet");
                }
                for (canvas, connections) in census {
                    tracing::info!(canvas = %canvas, connections, "Canvas connections");
                }
            }
        }
    }
}
