use std::time::Duration;

use tracing::info;

use signald_bridge_net::DaemonClient;
use signald_bridge_shared::DaemonFrame;

use crate::error::ServerError;

/// Collect one batch of incoming frames for `number`.
///
/// Returns once the daemon marks a frame as done; that frame is the last
/// element. The subscription is released on every exit path.
pub async fn receive(
    client: &DaemonClient,
    number: &str,
    deadline: Duration,
) -> Result<Vec<DaemonFrame>, ServerError> {
    if number.is_empty() {
        return Err(ServerError::Validation("Please provide a number".into()));
    }

    let mut subscription = client.subscribe(number).await?;
    let batch = subscription.collect_batch(deadline).await?;

    info!(number, frames = batch.len(), "Received batch");
    Ok(batch)
}
