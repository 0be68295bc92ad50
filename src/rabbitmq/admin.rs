// src/rabbitmq/admin.rs

use tracing::info;

use super::connection::ConnectionManager;
use super::errors::Result;

/// Drops every ready message in `queue`. Returns how many were purged.
pub async fn empty_queue(manager: &mut ConnectionManager, queue: &str) -> Result<u32> {
    let channel = manager.get_channel(false).await?;
    let purged = channel.purge(queue).await?;
    info!(queue, purged, "rabbitmq_queue_purged");
    Ok(purged)
}
