//! Voice transports: where encoded audio ends up.

pub mod tcp;

#[cfg(feature = "discord")]
pub mod songbird;

use crate::{
    processor::EncodedStream,
    song::{ChannelId, GuildId, UserId},
};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub use tcp::TcpTransport;

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Voice channel `user` currently sits in, if any.
    async fn user_channel(&self, guild: GuildId, user: UserId) -> Option<ChannelId>;

    async fn connect(&self, guild: GuildId, channel: ChannelId) -> Result<Arc<dyn VoiceConnection>>;
}

#[async_trait]
pub trait VoiceConnection: Send + Sync {
    /// Resolves once the connection can carry audio.
    async fn ready(&self) -> Result<()>;

    /// Replaces the active audio resource with `stream`.
    async fn play(&self, stream: EncodedStream) -> Result<Arc<dyn VoiceResource>>;

    /// Silences the transport-level player without dropping the resource.
    fn pause(&self);
    fn unpause(&self);

    /// Drops the active resource.
    fn stop(&self);

    async fn destroy(&self);
}

/// One playing stream of encoded audio.
pub trait VoiceResource: Send + Sync {
    /// True once the stream has been played to its end.
    fn ended(&self) -> bool;

    /// Playback error reported by the transport, if any.
    fn error(&self) -> Option<String>;
}
