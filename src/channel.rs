//! Outbound live-channel and status notification interfaces

use crate::error::Result;
use crate::types::{AgentName, ChannelId};
use async_trait::async_trait;

/// Sink that delivers text into a live conversation (phone call, socket)
#[async_trait]
pub trait LiveChannel: Send + Sync {
    /// Push a text fragment into the channel
    async fn push(&self, channel_id: &ChannelId, fragment: &str) -> Result<()>;

    /// Hand the channel back to its normal, non-collaborating behaviour
    async fn release(&self, _channel_id: &ChannelId) -> Result<()> {
        Ok(())
    }
}

/// Best-effort UI status broadcaster (e.g. "is typing" indicators)
#[async_trait]
pub trait StatusNotifier: Send + Sync {
    /// Clear typing indicators for every invited agent
    async fn clear_typing(&self, channel_id: Option<&ChannelId>, agents: &[AgentName]) -> Result<()>;
}
