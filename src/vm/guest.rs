//! Messages to the guest.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Delivers text to every user logged into the guest.
#[async_trait]
pub trait GuestChannel: Send + Sync {
    /// Broadcast a message (wall-style).
    async fn broadcast(&self, message: &str) -> Result<()>;
}

/// Broadcast with an upper bound on how long the guest may take.
pub async fn broadcast_bounded(
    channel: &dyn GuestChannel,
    vm: &str,
    message: &str,
    timeout: Duration,
) -> Result<()> {
    match tokio::time::timeout(timeout, channel.broadcast(message)).await {
        Ok(result) => result,
        Err(_) => Err(Error::guest(
            vm,
            format!("no answer within {}", humantime::format_duration(timeout)),
        )),
    }
}
