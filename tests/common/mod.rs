//! Test infrastructure for guild-player integration tests.
//!
//! Provides in-memory stand-ins for every external collaborator: song
//! fetchers, transcoder stages, audio sources and the voice transport.

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

// Re-export key types from the main crate
pub use guild_player::config::Config;
pub use guild_player::constants::{pcm_bytes_for_ms, FRAME_BYTES};
pub use guild_player::event::{
    Event, EventBus, PlaybackId, PlayerEvent, ProcessorEvent, SourceEvent, Subscriber,
};
pub use guild_player::notify::{Notification, NotificationSink};
pub use guild_player::pipeline::{Stage, StageLauncher};
pub use guild_player::processor::{AudioProcessor, Effects, EncodedStream, TransportControl};
pub use guild_player::song::{ChannelId, GuildId, Song, SourceKind, UserId};
pub use guild_player::sources::{
    AudioSource, BufferedSource, Fetched, Fetchers, RawStream, SongFetcher, SourceContext,
};
pub use guild_player::transport::{VoiceConnection, VoiceResource, VoiceTransport};

pub const GUILD: GuildId = 10;
pub const USER: UserId = 20;
pub const CHANNEL: ChannelId = 30;

/// Small chunk duration used by tests.
pub const SMALL_MS: u64 = 10;

/// Test configuration: 1 s large chunks, 10 ms ticks, short retry delays.
pub fn test_config(scratch: &Path) -> Config {
    let mut config = Config {
        scratch_dir: Some(scratch.to_path_buf()),
        ..Default::default()
    };
    config.chunks.large_chunk_secs = 1;
    config.chunks.small_chunk_ms = SMALL_MS;
    config.retry.retry_backoff_ms = 10;
    config.retry.read_retry_delay_ms = 5;
    config.retry.first_byte_timeout_secs = 5;
    config.retry.join_timeout_secs = 2;
    config.retry.end_poll_ms = 10;
    config
}

pub fn large_chunk_bytes() -> usize {
    pcm_bytes_for_ms(1000)
}

pub fn small_chunk_bytes() -> usize {
    pcm_bytes_for_ms(SMALL_MS)
}

/// Creates a mock Song for testing.
pub fn mock_song(id: u64, kind: SourceKind) -> Song {
    Song {
        id,
        kind,
        title: format!("Song {id}"),
        url: format!("https://example.com/song/{id}"),
        duration: Some(180),
        thumbnail: None,
        artist: "Test Artist".to_string(),
        live: false,
        requested_by: Some(USER),
    }
}

pub fn mock_live_song(id: u64) -> Song {
    Song {
        live: true,
        duration: None,
        ..mock_song(id, SourceKind::Network)
    }
}

/// Raw PCM with a recognizable, never silent byte pattern.
pub fn pcm(ms: u64) -> Vec<u8> {
    (0..pcm_bytes_for_ms(ms))
        .map(|i| ((i / FRAME_BYTES) % 250 + 1) as u8)
        .collect()
}

/// Raw PCM where every byte is `fill`.
pub fn filled_pcm(ms: u64, fill: u8) -> Vec<u8> {
    vec![fill; pcm_bytes_for_ms(ms)]
}

pub fn is_silence(chunk: &[u8]) -> bool {
    chunk.iter().all(|b| *b == 0)
}

/// Number of entries directly inside `dir`.
pub fn dir_entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|e| e.count()).unwrap_or(0)
}

/// How one fetch of a song behaves.
#[derive(Clone)]
pub enum Attempt {
    /// Serve the bytes and end cleanly
    Serve(Vec<u8>),

    /// Serve the bytes, then fail the read
    FailAfter(Vec<u8>),

    /// Serve the bytes, then never produce anything again
    Stall(Vec<u8>),

    /// Fail to open at all
    Refuse,
}

/// Song fetcher scripted per song id. The last attempt of a script repeats.
#[derive(Default)]
pub struct MockFetcher {
    scripts: Mutex<HashMap<u64, VecDeque<Attempt>>>,
    metadata: Mutex<HashMap<u64, Song>>,
    opens: AtomicU32,
    lookups: AtomicU32,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, song_id: u64, attempts: Vec<Attempt>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(song_id, attempts.into());
        self
    }

    /// Metadata returned for the song with the same id.
    pub fn metadata(self, song: Song) -> Self {
        self.metadata.lock().unwrap().insert(song.id, song);
        self
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn lookups(&self) -> u32 {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SongFetcher for MockFetcher {
    async fn open(&self, song: &Song) -> Result<Fetched> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let attempt = {
            let mut scripts = self.scripts.lock().unwrap();
            let Some(script) = scripts.get_mut(&song.id) else {
                bail!("Unknown song {}", song.id);
            };
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };

        let reader: guild_player::pipeline::BoxedRead = match attempt {
            Some(Attempt::Serve(data)) => Box::new(std::io::Cursor::new(data)),
            Some(Attempt::FailAfter(data)) => Box::new(StreamReader::new(futures::stream::iter(vec![
                Ok(Bytes::from(data)),
                Err(std::io::Error::other("simulated network error")),
            ]))),
            Some(Attempt::Stall(data)) => Box::new(StreamReader::new(
                futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(data))])
                    .chain(futures::stream::pending()),
            )),
            Some(Attempt::Refuse) | None => bail!("simulated connection refused"),
        };

        Ok(Fetched::from_reader(reader))
    }

    async fn fetch_data(&self, song: &Song) -> Result<Song> {
        self.lookups.fetch_add(1, Ordering::SeqCst);

        match self.metadata.lock().unwrap().get(&song.id) {
            Some(refreshed) => Ok(refreshed.clone()),
            None => bail!("simulated metadata lookup failure"),
        }
    }
}

/// A stage that passes its input through unchanged.
pub fn identity_stage(name: &str) -> Stage {
    let (input, output) = tokio::io::duplex(64 * 1024);
    Stage::from_io(name, Box::new(input), Box::new(output))
}

/// Launcher of in-memory pass-through stages. Filter stages can be
/// prepared in advance to control their output.
#[derive(Default)]
pub struct MockLauncher {
    filters: Mutex<VecDeque<Stage>>,
    tempos: Mutex<Vec<f64>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_filter(&self, stage: Stage) {
        self.filters.lock().unwrap().push_back(stage);
    }

    /// Tempo of every filter stage launched so far.
    pub fn tempos(&self) -> Vec<f64> {
        self.tempos.lock().unwrap().clone()
    }
}

impl StageLauncher for MockLauncher {
    fn decoder(&self) -> Result<Stage> {
        Ok(identity_stage("decoder"))
    }

    fn filter(&self, tempo: f64) -> Result<Stage> {
        self.tempos.lock().unwrap().push(tempo);
        let prepared = self.filters.lock().unwrap().pop_front();
        Ok(prepared.unwrap_or_else(|| identity_stage("filter")))
    }

    fn encoder(&self) -> Result<Stage> {
        Ok(identity_stage("encoder"))
    }
}

/// A filter stage whose output is written by the test through the
/// returned handle. Its input is discarded.
pub fn gated_filter() -> (Stage, tokio::io::DuplexStream) {
    let (handle, output) = tokio::io::duplex(64 * 1024);
    let stage = Stage::from_io("gated-filter", Box::new(tokio::io::sink()), Box::new(output));
    (stage, handle)
}

pub fn source_context(
    config: Config,
    fetcher: Arc<dyn SongFetcher>,
    launcher: Arc<dyn StageLauncher>,
    bus: EventBus,
) -> SourceContext {
    SourceContext {
        config: Arc::new(config),
        launcher,
        fetchers: Fetchers::new()
            .with(SourceKind::Network, fetcher.clone())
            .with(SourceKind::CloudFile, fetcher),
        bus,
    }
}

pub fn buffered_source(song: Song, ctx: &SourceContext, fetcher: Arc<dyn SongFetcher>) -> BufferedSource {
    BufferedSource::new(
        song,
        ctx.bus.next_playback_id(),
        fetcher,
        ctx.launcher.clone(),
        ctx.config.clone(),
        ctx.bus.clone(),
    )
}

/// Waits for the first event matching `pred`.
pub async fn wait_for_event<F>(subscriber: &mut Subscriber, timeout: Duration, mut pred: F) -> Option<Event>
where
    F: FnMut(&Event) -> bool,
{
    tokio::time::timeout(timeout, async {
        while let Some(event) = subscriber.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Polls `cond` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Receives everything until the stream ends.
pub async fn collect(mut rx: mpsc::Receiver<Bytes>, timeout: Duration) -> Vec<Bytes> {
    let mut chunks = vec![];
    let _ = tokio::time::timeout(timeout, async {
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
    })
    .await;
    chunks
}

/// Audio source stand-in recording what the processor asks of it.
pub struct FakeSource {
    song: Song,
    playback: PlaybackId,
    timing: Mutex<Duration>,
    paused: AtomicBool,
}

impl FakeSource {
    pub fn new(playback: PlaybackId) -> Self {
        Self {
            song: mock_song(1, SourceKind::Network),
            playback,
            timing: Mutex::new(Duration::from_millis(SMALL_MS)),
            paused: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl AudioSource for FakeSource {
    fn song(&self) -> &Song {
        &self.song
    }

    fn playback_id(&self) -> PlaybackId {
        self.playback
    }

    fn buffer_stream(&self, _attempt: u32) {}

    fn get_stream(&self) -> Result<RawStream> {
        bail!("FakeSource has no stream")
    }

    fn set_chunk_timing(&self, interval: Duration) {
        *self.timing.lock().unwrap() = interval;
    }

    fn chunk_timing(&self) -> Duration {
        *self.timing.lock().unwrap()
    }

    fn played_duration(&self) -> Duration {
        Duration::ZERO
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn is_buffering(&self) -> bool {
        false
    }

    fn is_destroyed(&self) -> bool {
        false
    }

    async fn destroy(&self) {}
}

/// Transport control recording pause/resume requests.
#[derive(Default)]
pub struct FakeControl {
    pub transport_paused: AtomicBool,
    pub user_paused: AtomicBool,
    pub pauses: AtomicU32,
    pub resumes: AtomicU32,
}

impl TransportControl for FakeControl {
    fn pause_transport(&self) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        self.transport_paused.store(true, Ordering::SeqCst);
    }

    fn resume_transport(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        self.transport_paused.store(false, Ordering::SeqCst);
    }

    fn user_paused(&self) -> bool {
        self.user_paused.load(Ordering::SeqCst)
    }
}

/// In-memory voice transport. Users listed in `channels` sit in a channel.
#[derive(Default)]
pub struct MockTransport {
    pub channels: Mutex<HashMap<UserId, ChannelId>>,
    /// Connections never become ready when set
    pub hang: AtomicBool,
    pub connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockTransport {
    pub fn with_user(user: UserId, channel: ChannelId) -> Self {
        let transport = Self::default();
        transport.channels.lock().unwrap().insert(user, channel);
        transport
    }

    pub fn connection(&self) -> Option<Arc<MockConnection>> {
        self.connections.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl VoiceTransport for MockTransport {
    async fn user_channel(&self, _guild: GuildId, user: UserId) -> Option<ChannelId> {
        self.channels.lock().unwrap().get(&user).copied()
    }

    async fn connect(&self, _guild: GuildId, _channel: ChannelId) -> Result<Arc<dyn VoiceConnection>> {
        let connection = Arc::new(MockConnection {
            hang: self.hang.load(Ordering::SeqCst),
            ..Default::default()
        });
        self.connections.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}

/// Collects everything played into `received`.
#[derive(Default)]
pub struct MockConnection {
    hang: bool,
    pub received: Arc<Mutex<Vec<u8>>>,
    pub paused: AtomicBool,
    pub plays: AtomicU32,
    pub destroyed: AtomicBool,
}

#[async_trait]
impl VoiceConnection for MockConnection {
    async fn ready(&self) -> Result<()> {
        if self.hang {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn play(&self, mut stream: EncodedStream) -> Result<Arc<dyn VoiceResource>> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        let resource = Arc::new(MockResource::default());

        let received = self.received.clone();
        let ended = resource.clone();
        tokio::spawn(async move {
            while let Some(data) = stream.recv().await {
                received.lock().unwrap().extend_from_slice(&data);
            }
            ended.ended.store(true, Ordering::SeqCst);
        });

        Ok(resource)
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn unpause(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn stop(&self) {}

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockResource {
    pub ended: AtomicBool,
}

impl VoiceResource for MockResource {
    fn ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    fn error(&self) -> Option<String> {
        None
    }
}

/// Notification sink keeping everything it was sent.
#[derive(Default)]
pub struct RecordingNotifier {
    pub infos: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<String>>,
}

impl NotificationSink for RecordingNotifier {
    fn send_notification(&self, text: &str) {
        self.infos.lock().unwrap().push(text.to_string());
    }

    fn send_error(&self, text: &str, _persistent: bool) -> u64 {
        let mut errors = self.errors.lock().unwrap();
        errors.push(text.to_string());
        errors.len() as u64
    }
}

/// HTTP clients need a process-wide TLS provider. Repeated installs fail
/// harmlessly.
pub fn install_crypto() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}
