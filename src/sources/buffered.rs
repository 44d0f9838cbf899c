//! Disk-chunked buffering and real-time delivery shared by all source kinds.
//!
//! Acquisition fetches the song, decodes it to raw PCM and persists it as
//! large chunks in a [`ChunkStore`]. Delivery reads the chunks back, splits
//! them into small chunks and writes exactly one small chunk (or silence)
//! per tick of a timer anchored to a fixed start time.

use super::{AudioSource, RawStream, SongFetcher};
use crate::{
    buffer::{DeliveryBuffer, Pull},
    chunk_store::ChunkStore,
    config::Config,
    constants::{pcm_bytes_for_ms, BYTES_PER_SECOND, FRAME_BYTES},
    event::{Event, EventBus, PlaybackId, SourceEvent},
    pipeline::{BoxedRead, StageLauncher},
    song::Song,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    future::Future,
    ops::Range,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Small chunks that may sit in the output channel ahead of the consumer.
const STREAM_CAPACITY: usize = 4;

/// Ticks delivery may fall behind schedule before it stops catching up.
const MAX_LAG_TICKS: u32 = 10;

enum Acquired {
    /// The whole song has been persisted
    Complete,

    /// A live source hit its refresh interval and must restart
    Refresh,
}

struct SourceState {
    delivery: DeliveryBuffer,
    /// Large chunks persisted so far, also the index of the next one
    large_chunks: usize,
    /// Index of the next large chunk to load into the delivery buffer
    read_cursor: usize,
    chunk_timing: Duration,
    buffering: bool,
    ready: bool,
    finished: bool,
    loading: bool,
    acquiring: bool,
    fatal: bool,
    destroyed: bool,
}

struct Inner {
    song: Song,
    playback: PlaybackId,
    fetcher: Arc<dyn SongFetcher>,
    launcher: Arc<dyn StageLauncher>,
    config: Arc<Config>,
    bus: EventBus,
    store: ChunkStore,
    cancel: CancellationToken,
    ready_tx: watch::Sender<bool>,
    state: Mutex<SourceState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stream_taken: AtomicBool,
    large_chunk_bytes: usize,
    small_chunk_bytes: usize,
}

pub struct BufferedSource {
    inner: Arc<Inner>,
}

impl BufferedSource {
    pub fn new(
        song: Song,
        playback: PlaybackId,
        fetcher: Arc<dyn SongFetcher>,
        launcher: Arc<dyn StageLauncher>,
        config: Arc<Config>,
        bus: EventBus,
    ) -> Self {
        let large_chunk_bytes = pcm_bytes_for_ms(config.chunks.large_chunk_secs * 1000);
        let small_chunk_bytes = pcm_bytes_for_ms(config.chunks.small_chunk_ms);
        let (ready_tx, _) = watch::channel(false);

        let state = SourceState {
            delivery: DeliveryBuffer::new(small_chunk_bytes),
            large_chunks: 0,
            read_cursor: 0,
            chunk_timing: config.chunks.small_chunk(),
            buffering: true,
            ready: false,
            finished: false,
            loading: false,
            acquiring: false,
            fatal: false,
            destroyed: false,
        };

        let inner = Inner {
            store: ChunkStore::new(config.scratch_root()),
            song,
            playback,
            fetcher,
            launcher,
            config,
            bus,
            cancel: CancellationToken::new(),
            ready_tx,
            state: Mutex::new(state),
            tasks: Mutex::new(vec![]),
            stream_taken: AtomicBool::new(false),
            large_chunk_bytes,
            small_chunk_bytes,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Directory holding this source's chunks, if it has been created.
    pub fn scratch_dir(&self) -> Option<std::path::PathBuf> {
        self.inner.store.path()
    }

    /// Large chunks persisted by the current acquisition cycle.
    pub fn large_chunks(&self) -> usize {
        self.inner.lock().large_chunks
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().ready
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SourceEvent) {
        self.bus.send(Event::Source {
            playback: self.playback,
            event,
        });
    }

    /// Spawns a task that is dropped as soon as the source is cancelled.
    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = task => {}
            }
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    fn fatal(&self, diagnostic: String) {
        {
            let mut state = self.lock();
            if state.fatal || state.destroyed {
                return;
            }
            state.fatal = true;
        }

        error!(
            "[playback {}] Source for '{}' failed: {diagnostic}",
            self.playback, self.song.title
        );
        self.emit(SourceEvent::Fatal { diagnostic });
        self.cancel.cancel();
    }

    fn signal_ready(&self) {
        info!(
            "[playback {}] Buffer ready for '{}'",
            self.playback, self.song.title
        );
        self.ready_tx.send_replace(true);
        self.emit(SourceEvent::BufferReady);
    }

    async fn acquire(self: Arc<Self>, first_attempt: u32) {
        let max_attempts = self.config.retry.max_attempts;
        let mut diagnostics = vec![];
        let mut attempt = first_attempt;

        loop {
            let result = match self.prepare_attempt().await {
                Ok(skip) => self.acquire_once(attempt, skip).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(Acquired::Complete) => {
                    self.complete();
                    break;
                }
                Ok(Acquired::Refresh) => {
                    info!(
                        "[playback {}] Refreshing live acquisition for '{}'",
                        self.playback, self.song.title
                    );
                    // Each refresh cycle gets the full attempt budget
                    attempt = first_attempt;
                    diagnostics.clear();
                }
                Err(e) => {
                    warn!(
                        "[playback {}] Acquisition attempt {attempt}/{max_attempts} for '{}' failed: {e:#}",
                        self.playback, self.song.title
                    );
                    diagnostics.push(format!("attempt {attempt}: {e:#}"));

                    if attempt >= max_attempts {
                        self.fatal(diagnostics.join("; "));
                        break;
                    }

                    tokio::time::sleep(self.config.retry.retry_backoff()).await;
                    attempt += 1;
                }
            }
        }

        self.lock().acquiring = false;
    }

    /// Readies the chunk store for an attempt and returns how many decoded
    /// bytes the attempt must skip because they are already persisted.
    async fn prepare_attempt(&self) -> Result<usize> {
        self.store.ensure_created()?;

        let (ready, committed) = {
            let state = self.lock();
            (state.ready, state.large_chunks)
        };

        if !ready {
            // Nothing was delivered yet, start over from a clean store
            self.store.clear().await?;
            let mut state = self.lock();
            state.large_chunks = 0;
            state.read_cursor = 0;
            return Ok(0);
        }

        if self.song.live {
            Ok(0)
        } else {
            Ok(committed * self.large_chunk_bytes)
        }
    }

    async fn acquire_once(&self, attempt: u32, skip: usize) -> Result<Acquired> {
        debug!(
            "[playback {}] Acquisition attempt {attempt} for '{}', skipping {skip} bytes",
            self.playback, self.song.title
        );

        let mut fetched = self.fetcher.open(&self.song).await?;
        let mut decoder = self.launcher.decoder()?;
        let mut input = decoder.take_input().context("Decoder has no input")?;
        let mut output = decoder.take_output().context("Decoder has no output")?;

        let reader = &mut fetched.reader;
        let feed = async move {
            tokio::io::copy(reader, &mut input)
                .await
                .context("Failed to feed decoder")?;
            input
                .shutdown()
                .await
                .context("Failed to close decoder input")?;
            Ok::<_, anyhow::Error>(())
        };
        let drain = self.drain_decoder(&mut output, skip);
        let refresh = async {
            if self.song.live {
                tokio::time::sleep(self.config.retry.live_refresh()).await
            } else {
                std::future::pending::<()>().await
            }
        };

        let decoded = tokio::select! {
            result = futures::future::try_join(feed, drain) => result?.1,
            _ = refresh => return Ok(Acquired::Refresh),
        };

        fetched.finish().await?;
        decoder.finish().await?;

        if decoded == 0 {
            bail!("Decoder produced no audio");
        }

        Ok(Acquired::Complete)
    }

    /// Reads decoded PCM and persists it in large chunks. Returns the
    /// number of bytes decoded.
    async fn drain_decoder(&self, output: &mut BoxedRead, skip: usize) -> Result<usize> {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        let mut pending: Vec<u8> = Vec::with_capacity(self.large_chunk_bytes);
        let mut to_skip = skip;
        let mut decoded = 0;

        loop {
            let n = output
                .read(&mut buf)
                .await
                .context("Failed to read decoder output")?;
            if n == 0 {
                break;
            }
            decoded += n;

            let mut data = &buf[..n];
            if to_skip > 0 {
                let skipped = to_skip.min(data.len());
                data = &data[skipped..];
                to_skip -= skipped;
            }
            pending.extend_from_slice(data);

            while pending.len() >= self.large_chunk_bytes {
                let rest = pending.split_off(self.large_chunk_bytes);
                let chunk = std::mem::replace(&mut pending, rest);
                self.persist_chunk(&chunk).await?;
            }
        }

        // Final partial chunk, trimmed to whole frames
        pending.truncate(pending.len() / FRAME_BYTES * FRAME_BYTES);
        if !pending.is_empty() {
            self.persist_chunk(&pending).await?;
        }

        Ok(decoded)
    }

    async fn persist_chunk(&self, chunk: &[u8]) -> Result<()> {
        let index = self.lock().large_chunks;
        self.store.write(index, chunk).await?;

        let became_ready = {
            let mut state = self.lock();
            state.large_chunks = index + 1;
            if !state.ready && state.large_chunks >= self.config.chunks.ready_chunks {
                state.ready = true;
                true
            } else {
                false
            }
        };

        trace!(
            "[playback {}] Persisted chunk {index} ({} bytes)",
            self.playback,
            chunk.len()
        );

        if became_ready {
            self.signal_ready();
        }

        Ok(())
    }

    fn complete(&self) {
        let (chunks, became_ready) = {
            let mut state = self.lock();
            state.finished = true;
            let became_ready = !state.ready;
            state.ready = true;
            (state.large_chunks, became_ready)
        };

        info!(
            "[playback {}] Acquired '{}' in {chunks} chunks",
            self.playback, self.song.title
        );

        // Songs shorter than the ready threshold become ready once complete
        if became_ready {
            self.signal_ready();
        }
    }

    /// Picks the next chunk to load into the delivery buffer, if one is
    /// due. Returns the chunk index and any stale live chunks to discard.
    fn claim_refill(&self, state: &mut SourceState) -> Option<(usize, Range<usize>)> {
        let small_per_large = self.config.chunks.small_per_large();
        if state.loading || state.destroyed || state.delivery.queued() >= small_per_large {
            return None;
        }

        let mut stale = state.read_cursor..state.read_cursor;

        let on_disk = state.large_chunks.saturating_sub(state.read_cursor);
        if self.song.live && on_disk > self.config.chunks.live_window_chunks {
            let target = state.large_chunks - self.config.chunks.live_lag_chunks;
            stale = state.read_cursor..target;
            state.read_cursor = target;
        }

        if state.read_cursor >= state.large_chunks {
            return None;
        }

        let index = state.read_cursor;
        state.read_cursor += 1;
        state.loading = true;

        Some((index, stale))
    }

    async fn load_chunk(&self, index: usize, stale: Range<usize>) {
        if !stale.is_empty() {
            debug!(
                "[playback {}] Skipping stale live chunks {stale:?}",
                self.playback
            );
        }
        for stale_index in stale {
            self.store.remove(stale_index).await;
        }

        let retry = &self.config.retry;
        match self
            .store
            .read(index, retry.read_retries, retry.read_retry_delay())
            .await
        {
            Ok(data) => {
                self.store.remove(index).await;
                let mut state = self.lock();
                state.delivery.push_large(data);
                state.loading = false;
            }
            Err(e) => {
                self.lock().loading = false;
                self.fatal(format!("{e:#}"));
            }
        }
    }

    /// Produces the payload for one delivery tick. `None` ends the stream,
    /// the flag marks silence written while paused.
    fn tick(self: &Arc<Self>) -> Option<(Bytes, bool)> {
        let mut state = self.lock();

        let paused = state.delivery.is_paused();
        let payload = match state.delivery.pull() {
            Pull::Audio(chunk) => {
                state.buffering = false;
                chunk
            }
            Pull::Silence if paused => state.delivery.silence(),
            Pull::Silence => {
                if state.finished && !state.loading && state.read_cursor >= state.large_chunks {
                    return None;
                }

                if !state.buffering {
                    debug!(
                        "[playback {}] Delivery starved, writing silence",
                        self.playback
                    );
                }
                state.buffering = true;
                state.delivery.silence()
            }
        };

        if let Some((index, stale)) = self.claim_refill(&mut state) {
            let this = self.clone();
            self.spawn(async move { this.load_chunk(index, stale).await });
        }

        Some((payload, paused))
    }

    async fn deliver(self: Arc<Self>, tx: mpsc::Sender<Bytes>) {
        let mut ready = self.ready_tx.subscribe();
        if ready.wait_for(|ready| *ready).await.is_err() {
            return;
        }

        // Load the first chunk up front so playback does not open with silence
        let first = {
            let mut state = self.lock();
            self.claim_refill(&mut state)
        };
        if let Some((index, stale)) = first {
            self.load_chunk(index, stale).await;
        }

        let mut interval = self.lock().chunk_timing;
        let mut anchor = Instant::now();
        let mut ticks: u32 = 0;

        loop {
            let Some((payload, paused)) = self.tick() else {
                info!(
                    "[playback {}] Delivered all of '{}'",
                    self.playback, self.song.title
                );
                self.emit(SourceEvent::Finished);
                break;
            };

            trace!(
                "[playback {}] Tick {ticks}: {} bytes",
                self.playback,
                payload.len()
            );

            // Paused silence is dropped when the consumer is behind, so it
            // never queues up ahead of the audio that follows a resume
            let sent = if paused {
                !matches!(tx.try_send(payload), Err(TrySendError::Closed(_)))
            } else {
                tx.send(payload).await.is_ok()
            };
            if !sent {
                debug!("[playback {}] Raw stream receiver dropped", self.playback);
                break;
            }

            // Re-anchor on timing changes so earlier ticks keep their schedule
            let timing = self.lock().chunk_timing;
            if timing != interval {
                anchor += interval * ticks;
                ticks = 0;
                interval = timing;
            }

            ticks += 1;
            let deadline = anchor + interval * ticks;

            // A stalled consumer must not be answered with a burst of chunks
            let now = Instant::now();
            if now > deadline + interval * MAX_LAG_TICKS {
                debug!(
                    "[playback {}] Delivery fell {:?} behind, re-anchoring",
                    self.playback,
                    now - deadline
                );
                anchor = now;
                ticks = 0;
                continue;
            }

            tokio::time::sleep_until(deadline).await;
        }
    }
}

#[async_trait]
impl AudioSource for BufferedSource {
    fn song(&self) -> &Song {
        &self.inner.song
    }

    fn playback_id(&self) -> PlaybackId {
        self.inner.playback
    }

    fn buffer_stream(&self, attempt: u32) {
        {
            let mut state = self.inner.lock();
            if state.destroyed || state.fatal {
                return;
            }
            if state.acquiring {
                debug!(
                    "[playback {}] Acquisition already running",
                    self.inner.playback
                );
                return;
            }
            state.acquiring = true;
        }

        let inner = self.inner.clone();
        self.inner.spawn(async move { inner.acquire(attempt).await });
    }

    fn get_stream(&self) -> Result<RawStream> {
        if self.inner.stream_taken.swap(true, Ordering::SeqCst) {
            bail!("Stream of playback {} already taken", self.inner.playback);
        }

        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let inner = self.inner.clone();
        self.inner.spawn(async move { inner.deliver(tx).await });

        Ok(rx)
    }

    fn set_chunk_timing(&self, interval: Duration) {
        debug!(
            "[playback {}] Chunk timing set to {interval:?}",
            self.inner.playback
        );
        self.inner.lock().chunk_timing = interval;
    }

    fn chunk_timing(&self) -> Duration {
        self.inner.lock().chunk_timing
    }

    fn played_duration(&self) -> Duration {
        let consumed = self.inner.lock().delivery.consumed();
        let bytes = consumed * self.inner.small_chunk_bytes as u64;
        Duration::from_millis(bytes * 1000 / BYTES_PER_SECOND as u64)
    }

    fn pause(&self) {
        self.inner.lock().delivery.set_paused(true);
    }

    fn resume(&self) {
        self.inner.lock().delivery.set_paused(false);
    }

    fn is_paused(&self) -> bool {
        self.inner.lock().delivery.is_paused()
    }

    fn is_buffering(&self) -> bool {
        self.inner.lock().buffering
    }

    fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    async fn destroy(&self) {
        {
            let mut state = self.inner.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
        }

        self.inner.cancel.cancel();

        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        self.inner.store.destroy();

        info!(
            "[playback {}] Destroyed source for '{}'",
            self.inner.playback, self.inner.song.title
        );
    }
}

impl Drop for BufferedSource {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}
