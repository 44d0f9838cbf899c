//! Discord voice transport built on serenity and songbird.

use super::{VoiceConnection, VoiceResource, VoiceTransport};
use crate::{
    config::DiscordConfig,
    processor::EncodedStream,
    song::{ChannelId, GuildId, UserId},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use serenity::{all as serenity_model, cache::Cache, prelude::GatewayIntents};
use songbird::{
    input::{AudioStream, Input, LiveInput},
    tracks::{PlayMode, TrackHandle},
    Call, Event as TrackEventKind, EventContext, EventHandler, SerenityInit, Songbird, TrackEvent,
};
use std::{
    io::{Read, Seek, SeekFrom},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use symphonia::core::{io::MediaSource, probe::Hint};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SongbirdTransport {
    cache: Arc<Cache>,
    manager: Arc<Songbird>,
}

impl SongbirdTransport {
    /// Logs in to Discord and starts the gateway client in the background.
    pub async fn start(config: &DiscordConfig) -> Result<Self> {
        let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;
        let manager = Songbird::serenity();

        let mut client = serenity::Client::builder(&config.discord_token, intents)
            .register_songbird_with(manager.clone())
            .await
            .context("Failed to create Discord client")?;

        let cache = client.cache.clone();

        tokio::spawn(async move {
            if let Err(e) = client.start().await {
                error!("Discord client error: {:?}", e);
            }
        });

        Ok(Self { cache, manager })
    }
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    async fn user_channel(&self, guild: GuildId, user: UserId) -> Option<ChannelId> {
        let guild = self.cache.guild(serenity_model::GuildId::new(guild))?;
        guild
            .voice_states
            .get(&serenity_model::UserId::new(user))
            .and_then(|state| state.channel_id)
            .map(|channel| channel.get())
    }

    async fn connect(&self, guild: GuildId, channel: ChannelId) -> Result<Arc<dyn VoiceConnection>> {
        let guild_id = serenity_model::GuildId::new(guild);

        let call = self
            .manager
            .join(guild_id, serenity_model::ChannelId::new(channel))
            .await
            .with_context(|| format!("Failed to join voice channel {channel}"))?;

        info!("[guild {guild}] Joined voice channel {channel}");

        Ok(Arc::new(SongbirdConnection {
            guild: guild_id,
            manager: self.manager.clone(),
            call,
            current: Mutex::new(None),
        }))
    }
}

pub struct SongbirdConnection {
    guild: serenity_model::GuildId,
    manager: Arc<Songbird>,
    call: Arc<tokio::sync::Mutex<Call>>,
    current: Mutex<Option<TrackHandle>>,
}

impl SongbirdConnection {
    fn with_track(&self, action: &str, f: impl FnOnce(&TrackHandle) -> songbird::tracks::TrackResult<()>) {
        if let Some(track) = lock(&self.current).as_ref() {
            if let Err(e) = f(track) {
                warn!("[guild {}] Failed to {action} track: {e}", self.guild);
            }
        }
    }
}

#[async_trait]
impl VoiceConnection for SongbirdConnection {
    async fn ready(&self) -> Result<()> {
        let call = self.call.lock().await;
        if call.current_connection().is_none() {
            anyhow::bail!("Voice connection not established");
        }
        Ok(())
    }

    async fn play(&self, stream: EncodedStream) -> Result<Arc<dyn VoiceResource>> {
        let mut hint = Hint::new();
        hint.with_extension("ogg");

        let source: Box<dyn MediaSource> = Box::new(EncodedMediaSource::new(stream));
        let input = Input::Live(
            LiveInput::Raw(AudioStream {
                input: source,
                hint: Some(hint),
            }),
            None,
        );

        let track = self.call.lock().await.play_only_input(input);

        let resource = Arc::new(SongbirdResource::default());
        for event in [TrackEvent::End, TrackEvent::Error] {
            track
                .add_event(TrackEventKind::Track(event), ResourceWatcher(resource.clone()))
                .context("Failed to watch voice track")?;
        }

        *lock(&self.current) = Some(track);

        Ok(resource)
    }

    fn pause(&self) {
        self.with_track("pause", |track| track.pause());
    }

    fn unpause(&self) {
        self.with_track("resume", |track| track.play());
    }

    fn stop(&self) {
        self.with_track("stop", |track| track.stop());
        lock(&self.current).take();
    }

    async fn destroy(&self) {
        self.stop();
        if let Err(e) = self.manager.remove(self.guild).await {
            warn!("[guild {}] Failed to leave voice channel: {e}", self.guild);
        }
    }
}

#[derive(Default)]
pub struct SongbirdResource {
    ended: AtomicBool,
    error: Mutex<Option<String>>,
}

impl VoiceResource for SongbirdResource {
    fn ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    fn error(&self) -> Option<String> {
        lock(&self.error).clone()
    }
}

struct ResourceWatcher(Arc<SongbirdResource>);

#[async_trait]
impl EventHandler for ResourceWatcher {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<TrackEventKind> {
        if let EventContext::Track(tracks) = ctx {
            for (state, _) in tracks.iter() {
                match &state.playing {
                    PlayMode::Errored(e) => {
                        *lock(&self.0.error) = Some(e.to_string());
                    }
                    PlayMode::End | PlayMode::Stop => {
                        self.0.ended.store(true, Ordering::SeqCst);
                    }
                    _ => {}
                }
            }
        }

        None
    }
}

/// Blocking reader over the encoded stream, pulled by songbird's decoder.
struct EncodedMediaSource {
    rx: EncodedStream,
    pending: Bytes,
}

impl EncodedMediaSource {
    fn new(rx: EncodedStream) -> Self {
        Self {
            rx,
            pending: Bytes::new(),
        }
    }
}

impl Read for EncodedMediaSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.pending.is_empty() {
            match self.rx.blocking_recv() {
                Some(data) => self.pending = data,
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);

        Ok(n)
    }
}

impl Seek for EncodedMediaSource {
    fn seek(&mut self, _pos: SeekFrom) -> std::io::Result<u64> {
        // Live audio source doesn't support seeking
        Ok(0)
    }
}

impl MediaSource for EncodedMediaSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}
