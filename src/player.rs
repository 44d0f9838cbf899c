//! Per-guild voice player: owns the current source, processor and voice
//! resource, and asks the queue what to play whenever a song is over.

use crate::{
    event::{Event, PlaybackId, PlayerEvent, ProcessorEvent, SourceEvent, Subscriber},
    notify::NotificationSink,
    processor::{AudioProcessor, Effects, TransportControl},
    queue::{NextSong, Queue},
    song::{GuildId, Song, UserId},
    sources::{self, AudioSource, SourceContext},
    transport::{VoiceConnection, VoiceResource, VoiceTransport},
};
use anyhow::{bail, Context, Result};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayerStatus {
    Disconnected,
    Connecting,
    Idle,
    Playing,
    Paused,
}

impl PlayerStatus {
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            PlayerStatus::Idle | PlayerStatus::Playing | PlayerStatus::Paused
        )
    }
}

/// Lets the processor silence the transport while it swaps pipelines.
struct ConnectionControl {
    connection: Arc<dyn VoiceConnection>,
    user_paused: Arc<AtomicBool>,
}

impl TransportControl for ConnectionControl {
    fn pause_transport(&self) {
        self.connection.pause();
    }

    fn resume_transport(&self) {
        self.connection.unpause();
    }

    fn user_paused(&self) -> bool {
        self.user_paused.load(Ordering::SeqCst)
    }
}

struct Active {
    playback: PlaybackId,
    song: Song,
    source: Arc<dyn AudioSource>,
    processor: AudioProcessor,
    watcher: JoinHandle<()>,
}

struct PlayerState {
    status: PlayerStatus,
    connection: Option<Arc<dyn VoiceConnection>>,
    active: Option<Active>,
    effects: Effects,
}

/// End of one playback attempt, with the diagnostic if it failed.
type Finished = (PlaybackId, Option<String>);

struct PlayerInner {
    guild: GuildId,
    queue: Arc<RwLock<Queue>>,
    notifier: Arc<dyn NotificationSink>,
    transport: Arc<dyn VoiceTransport>,
    ctx: SourceContext,
    user_paused: Arc<AtomicBool>,
    state: Mutex<PlayerState>,
    finished_tx: mpsc::UnboundedSender<Finished>,
}

#[derive(Clone)]
pub struct VcPlayer {
    inner: Arc<PlayerInner>,
}

impl VcPlayer {
    pub fn new(
        guild: GuildId,
        queue: Arc<RwLock<Queue>>,
        notifier: Arc<dyn NotificationSink>,
        transport: Arc<dyn VoiceTransport>,
        ctx: SourceContext,
    ) -> Self {
        let state = PlayerState {
            status: PlayerStatus::Disconnected,
            connection: None,
            active: None,
            effects: Effects::default(),
        };

        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PlayerInner {
            guild,
            queue,
            notifier,
            transport,
            ctx,
            user_paused: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(state),
            finished_tx,
        });

        tokio::spawn(run_finisher(Arc::downgrade(&inner), finished_rx));

        VcPlayer { inner }
    }

    pub fn guild(&self) -> GuildId {
        self.inner.guild
    }

    pub async fn status(&self) -> PlayerStatus {
        self.inner.state.lock().await.status
    }

    pub async fn connected(&self) -> bool {
        self.status().await.is_connected()
    }

    pub async fn playing(&self) -> bool {
        self.status().await == PlayerStatus::Playing
    }

    pub async fn paused(&self) -> bool {
        self.status().await == PlayerStatus::Paused
    }

    pub async fn current_source(&self) -> Option<Arc<dyn AudioSource>> {
        let state = self.inner.state.lock().await;
        state.active.as_ref().map(|active| active.source.clone())
    }

    pub async fn now_playing(&self) -> Option<Song> {
        let state = self.inner.state.lock().await;
        state.active.as_ref().map(|active| active.song.clone())
    }

    /// Progress of the current song.
    pub async fn played_duration(&self) -> Option<Duration> {
        let state = self.inner.state.lock().await;
        state
            .active
            .as_ref()
            .map(|active| active.source.played_duration())
    }

    pub async fn effects(&self) -> Effects {
        self.inner.state.lock().await.effects
    }

    /// Connects to the voice channel `user` is in.
    pub async fn join(&self, user: UserId) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        if state.status.is_connected() {
            return Ok(());
        }

        let Some(channel) = inner.transport.user_channel(inner.guild, user).await else {
            inner
                .notifier
                .send_error("You need to be in a voice channel first", false);
            bail!("User {user} is not in a voice channel");
        };

        state.status = PlayerStatus::Connecting;
        info!("[guild {}] Joining voice channel {channel}", inner.guild);

        let connect = async {
            let connection = inner.transport.connect(inner.guild, channel).await?;
            connection.ready().await?;
            Ok::<_, anyhow::Error>(connection)
        };

        let result = tokio::time::timeout(inner.ctx.config.retry.join_timeout(), connect)
            .await
            .context("Timed out waiting for the voice connection")
            .and_then(|result| result);

        match result {
            Ok(connection) => {
                state.connection = Some(connection);
                state.status = PlayerStatus::Idle;
                inner.ctx.bus.send(Event::Player(PlayerEvent::Connected));
                Ok(())
            }
            Err(e) => {
                state.status = PlayerStatus::Disconnected;
                inner
                    .notifier
                    .send_error(&format!("Failed to join voice channel: {e:#}"), false);
                Err(e)
            }
        }
    }

    /// Starts playback from the head of the queue.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if !state.status.is_connected() {
            bail!("Not connected to a voice channel");
        }
        if state.active.is_some() {
            return Ok(());
        }

        let next = self.inner.queue.write().await.next_song(true);
        self.play_next(&mut state, next).await;

        Ok(())
    }

    /// Plays `song`, replacing whatever plays now. Does nothing unless
    /// connected.
    pub async fn play(&self, song: Song) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if !state.status.is_connected() {
            debug!("[guild {}] Not connected, ignoring play", self.inner.guild);
            return Ok(());
        }

        self.teardown(&mut state).await;
        self.start_playback(&mut state, song).await
    }

    pub async fn pause(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        let Some(active) = state.active.as_ref() else {
            return;
        };
        if active.song.live {
            inner
                .notifier
                .send_error("Live streams cannot be paused", false);
            return;
        }
        if state.status == PlayerStatus::Paused {
            return;
        }

        inner.user_paused.store(true, Ordering::SeqCst);
        active.source.pause();
        if let Some(connection) = &state.connection {
            connection.pause();
        }

        state.status = PlayerStatus::Paused;
        inner.ctx.bus.send(Event::Player(PlayerEvent::Paused));
    }

    pub async fn resume(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        let Some(active) = state.active.as_ref() else {
            return;
        };
        if active.song.live {
            inner
                .notifier
                .send_error("Live streams cannot be paused or resumed", false);
            return;
        }
        if state.status != PlayerStatus::Paused {
            return;
        }

        inner.user_paused.store(false, Ordering::SeqCst);
        active.source.resume();
        if let Some(connection) = &state.connection {
            connection.unpause();
        }

        state.status = PlayerStatus::Playing;
        inner.ctx.bus.send(Event::Player(PlayerEvent::Resumed));
    }

    /// Applies effect settings to the current and all later songs.
    pub async fn set_effects(&self, effects: Effects) {
        let mut state = self.inner.state.lock().await;
        state.effects = effects;

        if let Some(active) = state.active.as_ref() {
            active.processor.set_effects(effects).await;
        }
    }

    /// Ends the current playback attempt and moves on to the next song.
    pub async fn finished_song(&self) {
        self.finish(None, None).await;
    }

    /// Stops playback and disconnects from voice.
    pub async fn leave(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock().await;
            state.status = PlayerStatus::Disconnected;
            self.finish_locked(&mut state, None, None).await;

            if let Some(connection) = state.connection.take() {
                connection.destroy().await;
            }
        }

        {
            let mut queue = inner.queue.write().await;
            queue.clear_queue();
            queue.stop();
        }

        info!("[guild {}] Left voice channel", inner.guild);
        inner.ctx.bus.send(Event::Player(PlayerEvent::Disconnected));
    }

    async fn finish(&self, expected: Option<PlaybackId>, fatal: Option<String>) {
        let mut state = self.inner.state.lock().await;
        self.finish_locked(&mut state, expected, fatal).await;
    }

    /// Single exit path of every playback attempt. `expected` restricts
    /// the call to one attempt so late signals of superseded ones are
    /// ignored.
    async fn finish_locked(
        &self,
        state: &mut PlayerState,
        expected: Option<PlaybackId>,
        fatal: Option<String>,
    ) {
        let inner = &self.inner;

        if let Some(expected) = expected {
            let current = state.active.as_ref().map(|active| active.playback);
            if current != Some(expected) {
                debug!(
                    "[guild {}] Ignoring end of superseded playback {expected}",
                    inner.guild
                );
                return;
            }
        }

        let Some(song) = self.teardown(state).await else {
            debug!("[guild {}] Nothing playing, queue left as is", inner.guild);
            return;
        };
        self.report_finished(song, fatal.as_deref()).await;

        if !state.status.is_connected() {
            return;
        }

        state.status = PlayerStatus::Idle;
        let next = inner.queue.write().await.next_song(false);
        self.play_next(state, next).await;
    }

    async fn report_finished(&self, song: Song, fatal: Option<&str>) {
        let inner = &self.inner;

        if let Some(diagnostic) = fatal {
            inner
                .notifier
                .send_error(&format!("Failed to play {}: {diagnostic}", song.title), false);

            // A broken song is not repeated
            inner.queue.write().await.repeat_song_count = 0;
        }

        inner.ctx.bus.send(Event::Player(PlayerEvent::SongFinished {
            song,
            fatal: fatal.is_some(),
        }));
    }

    /// Acts on a queue decision, skipping songs whose playback cannot start.
    async fn play_next(&self, state: &mut PlayerState, next: NextSong) {
        let inner = &self.inner;
        let mut next = next;
        let mut attempts_left = inner.queue.read().await.len() + 1;

        loop {
            match next {
                NextSong::Play(song) => {
                    let Err(e) = self.start_playback(state, song.clone()).await else {
                        return;
                    };

                    error!(
                        "[guild {}] Could not start {}: {e:#}",
                        inner.guild, song.title
                    );
                    self.report_finished(song, Some(&format!("{e:#}"))).await;

                    attempts_left = attempts_left.saturating_sub(1);
                    if attempts_left == 0 {
                        state.status = PlayerStatus::Idle;
                        inner.ctx.bus.send(Event::Player(PlayerEvent::Idle));
                        return;
                    }

                    next = inner.queue.write().await.next_song(false);
                }
                NextSong::Idle => {
                    info!("[guild {}] Queue finished", inner.guild);
                    state.status = PlayerStatus::Idle;
                    inner.ctx.bus.send(Event::Player(PlayerEvent::Idle));
                    return;
                }
                NextSong::NothingToPlay => {
                    inner.notifier.send_notification("There is nothing to play");
                    state.status = PlayerStatus::Idle;
                    inner
                        .ctx
                        .bus
                        .send(Event::Player(PlayerEvent::NothingToPlay));
                    return;
                }
            }
        }
    }

    /// Builds the source → processor → resource chain for `song`.
    async fn start_playback(&self, state: &mut PlayerState, song: Song) -> Result<()> {
        let inner = &self.inner;
        let connection = state
            .connection
            .clone()
            .context("Not connected to a voice channel")?;

        let song = sources::complete_metadata(song, &inner.ctx).await;
        let playback = inner.ctx.bus.next_playback_id();
        // Subscribe first so no fatal event of this attempt is missed
        let events = inner.ctx.bus.subscribe();

        info!(
            "[guild {}] Playing {} (playback {playback})",
            inner.guild, song.title
        );

        inner.user_paused.store(false, Ordering::SeqCst);

        let source = sources::create(song.clone(), playback, &inner.ctx)?;
        let raw = match source.get_stream() {
            Ok(raw) => raw,
            Err(e) => {
                source.destroy().await;
                return Err(e);
            }
        };

        let control = Arc::new(ConnectionControl {
            connection: connection.clone(),
            user_paused: inner.user_paused.clone(),
        });

        let processor = AudioProcessor::process_stream(
            raw,
            source.clone(),
            state.effects,
            inner.ctx.launcher.clone(),
            inner.ctx.config.clone(),
            inner.ctx.bus.clone(),
            control,
        )
        .await;
        let (processor, encoded) = match processor {
            Ok(processor) => processor,
            Err(e) => {
                source.destroy().await;
                return Err(e);
            }
        };

        let resource = match connection.play(encoded).await {
            Ok(resource) => resource,
            Err(e) => {
                processor.destroy().await;
                source.destroy().await;
                return Err(e);
            }
        };

        let watcher = tokio::spawn(watch_playback(
            inner.finished_tx.clone(),
            playback,
            resource,
            events,
            inner.ctx.config.retry.end_poll(),
        ));

        state.active = Some(Active {
            playback,
            song: song.clone(),
            source,
            processor,
            watcher,
        });
        state.status = PlayerStatus::Playing;

        inner
            .ctx
            .bus
            .send(Event::Player(PlayerEvent::NowPlaying { playback, song }));

        Ok(())
    }

    /// Tears down the active chain, returning the song it was playing.
    async fn teardown(&self, state: &mut PlayerState) -> Option<Song> {
        let active = state.active.take()?;

        active.watcher.abort();
        if let Some(connection) = &state.connection {
            connection.stop();
        }
        active.processor.destroy().await;
        active.source.destroy().await;

        debug!(
            "[guild {}] Tore down playback {}",
            self.inner.guild, active.playback
        );

        if state.status == PlayerStatus::Paused || state.status == PlayerStatus::Playing {
            state.status = PlayerStatus::Idle;
        }

        Some(active.song)
    }
}

/// Waits for the end of one playback attempt: natural end of the voice
/// resource, or a fatal error from the source, processor or transport.
async fn watch_playback(
    finished: mpsc::UnboundedSender<Finished>,
    playback: PlaybackId,
    resource: Arc<dyn VoiceResource>,
    mut events: Subscriber,
    poll: Duration,
) {
    let mut ticker = tokio::time::interval(poll);

    let fatal = loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(error) = resource.error() {
                    break Some(format!("Voice transport error: {error}"));
                }
                if resource.ended() {
                    break None;
                }
            }
            event = events.recv() => match event {
                Some(Event::Source {
                    playback: id,
                    event: SourceEvent::Fatal { diagnostic },
                }) if id == playback => break Some(diagnostic),
                Some(Event::Processor {
                    playback: id,
                    event: ProcessorEvent::Fatal { diagnostic },
                }) if id == playback => break Some(diagnostic),
                Some(_) => {}
                None => return,
            }
        }
    };

    // Finishing aborts this task, so the player's finisher does it
    let _ = finished.send((playback, fatal));
}

/// Finishes playback attempts reported by watchers, one at a time. Ends
/// with the player.
async fn run_finisher(
    player: Weak<PlayerInner>,
    mut finished: mpsc::UnboundedReceiver<Finished>,
) {
    while let Some((playback, fatal)) = finished.recv().await {
        let Some(inner) = player.upgrade() else {
            break;
        };
        VcPlayer { inner }.finish(Some(playback), fatal).await;
    }
}
