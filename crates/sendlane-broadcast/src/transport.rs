//! Transport implementations.
//!
//! The real messaging client lives behind [`sendlane_core::traits::Transport`];
//! this module ships the dry-run transport used for rehearsing a broadcast
//! without touching the wire.

use async_trait::async_trait;

use sendlane_core::error::SendFailure;
use sendlane_core::traits::Transport;
use sendlane_core::types::Recipient;

/// Logs every send instead of transmitting. Every device reports connected,
/// so pacing, retries, and pool lifecycle behave exactly as in production.
#[derive(Debug, Default, Clone)]
pub struct DryRunTransport;

impl DryRunTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for DryRunTransport {
    async fn send(
        &self,
        device_id: &str,
        recipient: &Recipient,
        content: &str,
        media_url: Option<&str>,
    ) -> Result<(), SendFailure> {
        tracing::info!(
            "📤 [dry-run] {} → {}: {:?} (media: {:?})",
            device_id,
            recipient.address,
            content,
            media_url
        );
        Ok(())
    }

    async fn is_connected(&self, _device_id: &str) -> bool {
        true
    }
}
