//! Audio sources.
//!
//! Every source kind shares one buffering/delivery engine
//! ([`buffered::BufferedSource`]) and differs only in the [`SongFetcher`]
//! that produces the song's encoded bytes. Supporting a new kind means
//! implementing [`SongFetcher`] and registering it in [`Fetchers`].

pub mod buffered;
pub mod cloud_file;
pub mod network;

use crate::{
    config::Config,
    event::{EventBus, PlaybackId},
    pipeline::{BoxedRead, Stage, StageLauncher},
    song::{Song, SourceKind},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::mpsc;

pub use buffered::BufferedSource;
pub use cloud_file::CloudFileFetcher;
pub use network::NetworkFetcher;

/// Raw PCM paced to real time by the delivery loop, one small chunk per message.
pub type RawStream = mpsc::Receiver<Bytes>;

#[async_trait]
pub trait AudioSource: Send + Sync {
    fn song(&self) -> &Song;

    fn playback_id(&self) -> PlaybackId;

    /// (Re)starts acquisition from `attempt`. Does nothing while an
    /// acquisition cycle is already running.
    fn buffer_stream(&self, attempt: u32);

    /// Returns the paced raw output. Can only be taken once per source.
    fn get_stream(&self) -> Result<RawStream>;

    /// Changes the delivery interval without restarting acquisition.
    fn set_chunk_timing(&self, interval: Duration);

    fn chunk_timing(&self) -> Duration;

    /// Audio delivered so far, excluding silence.
    fn played_duration(&self) -> Duration;

    fn pause(&self);
    fn resume(&self);
    fn is_paused(&self) -> bool;

    /// True while delivery writes silence because no audio is ready.
    fn is_buffering(&self) -> bool;

    fn is_destroyed(&self) -> bool;

    /// Stops every activity of the source and deletes its chunk store.
    async fn destroy(&self);
}

/// Encoded song bytes plus the process producing them, if any. The process
/// is killed when this is dropped.
pub struct Fetched {
    pub reader: BoxedRead,
    pub process: Option<Stage>,
}

impl Fetched {
    pub fn from_reader(reader: BoxedRead) -> Self {
        Self {
            reader,
            process: None,
        }
    }

    pub fn from_process(mut process: Stage) -> Result<Self> {
        let reader = process
            .take_output()
            .with_context(|| format!("Failed to get {} output", process.name()))?;

        // Nothing is ever written to the fetcher process
        drop(process.take_input());

        Ok(Self {
            reader,
            process: Some(process),
        })
    }

    /// Checks the producing process exited cleanly.
    pub async fn finish(&mut self) -> Result<()> {
        match self.process.as_mut() {
            Some(process) => process.finish().await,
            None => Ok(()),
        }
    }
}

/// Song metadata provider: gives access to a song's source audio.
#[async_trait]
pub trait SongFetcher: Send + Sync {
    /// Opens a readable stream of the song's encoded audio.
    async fn open(&self, song: &Song) -> Result<Fetched>;

    /// Returns refreshed metadata for `song`.
    async fn fetch_data(&self, song: &Song) -> Result<Song> {
        Ok(song.clone())
    }
}

/// Fetchers by source kind.
#[derive(Clone, Default)]
pub struct Fetchers {
    fetchers: HashMap<SourceKind, Arc<dyn SongFetcher>>,
}

impl Fetchers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: SourceKind, fetcher: Arc<dyn SongFetcher>) -> Self {
        self.fetchers.insert(kind, fetcher);
        self
    }

    pub fn get(&self, kind: SourceKind) -> Option<Arc<dyn SongFetcher>> {
        self.fetchers.get(&kind).cloned()
    }
}

/// Everything a source needs besides its song.
#[derive(Clone)]
pub struct SourceContext {
    pub config: Arc<Config>,
    pub launcher: Arc<dyn StageLauncher>,
    pub fetchers: Fetchers,
    pub bus: EventBus,
}

/// Fills in the metadata of a song queued without a known duration. The
/// song is kept as is when the lookup fails.
pub async fn complete_metadata(song: Song, ctx: &SourceContext) -> Song {
    if song.live || song.duration.is_some() {
        return song;
    }
    let Some(fetcher) = ctx.fetchers.get(song.kind) else {
        return song;
    };

    match fetcher.fetch_data(&song).await {
        Ok(refreshed) => refreshed,
        Err(e) => {
            warn!("Could not fetch metadata for '{}': {e:#}", song.title);
            song
        }
    }
}

/// Builds the source for `song` and starts acquiring it.
pub fn create(
    song: Song,
    playback: PlaybackId,
    ctx: &SourceContext,
) -> Result<Arc<dyn AudioSource>> {
    let fetcher = ctx
        .fetchers
        .get(song.kind)
        .with_context(|| format!("No fetcher registered for {:?} songs", song.kind))?;

    let source = BufferedSource::new(
        song,
        playback,
        fetcher,
        ctx.launcher.clone(),
        ctx.config.clone(),
        ctx.bus.clone(),
    );
    source.buffer_stream(1);

    Ok(Arc::new(source))
}
