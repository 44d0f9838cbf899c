//! Effect pipeline between a source's raw PCM and the voice transport.
//!
//! Raw PCM is pumped into a filter stage (loudness normalization, optional
//! nightcore tempo shift) whose output feeds a long-lived encoder stage.
//! The filter stage is rebuilt whenever effect settings change; the
//! transport stays paused until the new filter produces its first output.

use crate::{
    config::Config,
    event::{Event, EventBus, PlaybackId, ProcessorEvent},
    pipeline::{BoxedRead, BoxedWrite, Stage, StageLauncher},
    sources::{AudioSource, RawStream},
};
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

const READ_BUF_SIZE: usize = 16 * 1024;
const PASS_THROUGH_CAPACITY: usize = 4;
const ENCODER_CAPACITY: usize = 64;
const OUTPUT_CAPACITY: usize = 64;

/// Compressed audio ready for the voice transport.
pub type EncodedStream = mpsc::Receiver<Bytes>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Effects {
    /// Speed up and pitch up playback
    pub nightcore: bool,
}

impl Effects {
    pub fn tempo(&self, nightcore_rate: f64) -> f64 {
        if self.nightcore {
            nightcore_rate
        } else {
            1.0
        }
    }
}

/// Delivery interval that feeds the filter fast enough for `tempo`.
pub fn chunk_timing(small_chunk: Duration, tempo: f64) -> Duration {
    small_chunk.div_f64(tempo)
}

/// The player-side controls the processor needs while swapping pipelines.
pub trait TransportControl: Send + Sync {
    fn pause_transport(&self);
    fn resume_transport(&self);

    /// Whether the user asked for playback to be paused
    fn user_paused(&self) -> bool;
}

struct FilterHandle {
    generation: u64,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    playback: PlaybackId,
    source: Arc<dyn AudioSource>,
    launcher: Arc<dyn StageLauncher>,
    config: Arc<Config>,
    bus: EventBus,
    control: Arc<dyn TransportControl>,
    cancel: CancellationToken,
    effects: Mutex<Effects>,
    filter: tokio::sync::Mutex<Option<FilterHandle>>,
    filter_input: Mutex<Option<mpsc::Sender<Bytes>>>,
    encoder_input: Mutex<Option<mpsc::Sender<Bytes>>>,
    generation: AtomicU64,
    raw_finished: AtomicBool,
    fatal: AtomicBool,
    destroyed: AtomicBool,
    encoder_bytes: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct AudioProcessor {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AudioProcessor {
    /// Wires `raw` from `source` through the effect and encoder stages and
    /// returns the encoded output.
    pub async fn process_stream(
        raw: RawStream,
        source: Arc<dyn AudioSource>,
        effects: Effects,
        launcher: Arc<dyn StageLauncher>,
        config: Arc<Config>,
        bus: EventBus,
        control: Arc<dyn TransportControl>,
    ) -> Result<(Self, EncodedStream)> {
        let inner = Arc::new(Inner {
            playback: source.playback_id(),
            source,
            launcher,
            config,
            bus,
            control,
            cancel: CancellationToken::new(),
            effects: Mutex::new(effects),
            filter: tokio::sync::Mutex::new(None),
            filter_input: Mutex::new(None),
            encoder_input: Mutex::new(None),
            generation: AtomicU64::new(0),
            raw_finished: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            encoder_bytes: AtomicU64::new(0),
            tasks: Mutex::new(vec![]),
        });
        let processor = AudioProcessor { inner };

        let output = match processor.start(raw).await {
            Ok(output) => output,
            Err(e) => {
                processor.destroy().await;
                return Err(e);
            }
        };

        Ok((processor, output))
    }

    async fn start(&self, raw: RawStream) -> Result<EncodedStream> {
        let inner = &self.inner;

        let mut encoder = inner.launcher.encoder()?;
        let encoder_in = encoder.take_input().context("Encoder has no input")?;
        let encoder_out = encoder.take_output().context("Encoder has no output")?;

        let (encoder_tx, encoder_rx) = mpsc::channel(ENCODER_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CAPACITY);
        *lock(&inner.encoder_input) = Some(encoder_tx);

        {
            let this = inner.clone();
            inner.spawn(async move { this.run_encoder_input(encoder_rx, encoder_in).await });
        }
        {
            let this = inner.clone();
            inner.spawn(async move {
                this.run_encoder_output(encoder, encoder_out, output_tx)
                    .await
            });
        }

        inner.new_ffmpeg().await?;

        {
            let this = inner.clone();
            inner.spawn(async move { this.pump(raw).await });
        }

        Ok(output_rx)
    }

    pub fn playback_id(&self) -> PlaybackId {
        self.inner.playback
    }

    pub fn effects(&self) -> Effects {
        *lock(&self.inner.effects)
    }

    /// Applies new effect settings by rebuilding the filter stage.
    pub async fn set_effects(&self, effects: Effects) {
        *lock(&self.inner.effects) = effects;

        if let Err(e) = self.inner.new_ffmpeg().await {
            self.inner.fatal(format!("{e:#}"));
        }
    }

    /// Bytes handed to the encoder stage so far.
    pub fn encoder_input_bytes(&self) -> u64 {
        self.inner.encoder_bytes.load(Ordering::SeqCst)
    }

    /// Number of filter stages started so far.
    pub fn filter_generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Stops both stages and closes every internal buffer. Idempotent.
    pub async fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        inner.cancel.cancel();

        let filter = inner.filter.lock().await.take();
        let mut tasks = std::mem::take(&mut *lock(&inner.tasks));
        if let Some(filter) = filter {
            tasks.extend(filter.tasks);
        }
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        lock(&inner.filter_input).take();
        lock(&inner.encoder_input).take();

        debug!("[playback {}] Destroyed audio processor", inner.playback);
    }
}

impl Drop for AudioProcessor {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

/// Runs `task` until it completes or `token` is cancelled.
fn spawn_until<F>(token: CancellationToken, task: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = task => {}
        }
    })
}

impl Inner {
    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = spawn_until(self.cancel.clone(), task);
        let mut tasks = lock(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    fn fatal(&self, diagnostic: String) {
        if self.destroyed.load(Ordering::SeqCst) || self.fatal.swap(true, Ordering::SeqCst) {
            return;
        }

        error!(
            "[playback {}] Audio processor failed: {diagnostic}",
            self.playback
        );
        self.bus.send(Event::Processor {
            playback: self.playback,
            event: ProcessorEvent::Fatal { diagnostic },
        });
    }

    /// Rebuilds the filter stage for the current effect settings.
    async fn new_ffmpeg(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.filter.lock().await;
        if self.destroyed.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Silence the transport until the new filter produces output
        self.control.pause_transport();

        let effects = *lock(&self.effects);
        let tempo = effects.tempo(self.config.nightcore_rate);
        self.source
            .set_chunk_timing(chunk_timing(self.config.chunks.small_chunk(), tempo));

        // Fresh pass-through buffer, filled while the old stage is torn down
        let (input_tx, input_rx) = mpsc::channel(PASS_THROUGH_CAPACITY);
        {
            let mut filter_input = lock(&self.filter_input);
            if !self.raw_finished.load(Ordering::SeqCst) {
                *filter_input = Some(input_tx);
            }
        }

        if let Some(old) = slot.take() {
            debug!(
                "[playback {}] Tearing down filter stage {}",
                self.playback, old.generation
            );
            old.token.cancel();
            for task in old.tasks {
                let _ = task.await;
            }
        }

        let mut stage = self.launcher.filter(tempo)?;
        let stage_in = stage.take_input().context("Filter has no input")?;
        let stage_out = stage.take_output().context("Filter has no output")?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = self.cancel.child_token();
        let (first_input_tx, first_input_rx) = oneshot::channel();

        info!(
            "[playback {}] Starting filter stage {generation} ({effects:?}, tempo {tempo})",
            self.playback
        );

        let writer = {
            let this = self.clone();
            let token = token.clone();
            spawn_until(token.clone(), async move {
                this.run_filter_input(input_rx, stage_in, first_input_tx, token)
                    .await
            })
        };

        // The reader handles its own cancellation so it can kill the process
        let reader = {
            let this = self.clone();
            let token = token.clone();
            tokio::spawn(async move {
                this.run_filter_output(stage, stage_out, generation, first_input_rx, token)
                    .await
            })
        };

        *slot = Some(FilterHandle {
            generation,
            token,
            tasks: vec![writer, reader],
        });

        Ok(())
    }

    /// Moves raw PCM from the source into the current pass-through buffer.
    async fn pump(self: Arc<Self>, mut raw: RawStream) {
        while let Some(mut chunk) = raw.recv().await {
            loop {
                let tx = lock(&self.filter_input).clone();
                let Some(tx) = tx else {
                    break;
                };

                match tx.send(chunk).await {
                    Ok(()) => break,
                    Err(mpsc::error::SendError(unsent)) => {
                        // The buffer was swapped out under us, retry on the new one
                        chunk = unsent;
                        tokio::task::yield_now().await;
                    }
                }
            }
        }

        debug!("[playback {}] Raw stream ended", self.playback);
        let mut filter_input = lock(&self.filter_input);
        self.raw_finished.store(true, Ordering::SeqCst);
        filter_input.take();
    }

    async fn run_filter_input(
        &self,
        mut rx: mpsc::Receiver<Bytes>,
        mut input: BoxedWrite,
        first_input: oneshot::Sender<()>,
        token: CancellationToken,
    ) {
        let mut first_input = Some(first_input);

        while let Some(chunk) = rx.recv().await {
            if let Err(e) = input.write_all(&chunk).await {
                if !token.is_cancelled() {
                    debug!(
                        "[playback {}] Filter input closed: {e}",
                        self.playback
                    );
                }
                return;
            }

            if let Some(tx) = first_input.take() {
                let _ = tx.send(());
            }
        }

        if let Err(e) = input.shutdown().await {
            debug!("[playback {}] Failed to close filter input: {e}", self.playback);
        }
    }

    async fn run_filter_output(
        self: Arc<Self>,
        mut stage: Stage,
        output: BoxedRead,
        generation: u64,
        first_input: oneshot::Receiver<()>,
        token: CancellationToken,
    ) {
        let result = tokio::select! {
            _ = token.cancelled() => {
                stage.kill().await;
                return;
            }
            result = self.forward_filter_output(output, generation, first_input) => result,
        };

        if token.is_cancelled() {
            stage.kill().await;
            return;
        }

        let result = match result {
            Ok(()) => stage.finish().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) if self.raw_finished.load(Ordering::SeqCst) => {
                debug!(
                    "[playback {}] Filter stage {generation} drained",
                    self.playback
                );
                // Closing the encoder input lets the encoder flush and exit
                lock(&self.encoder_input).take();
            }
            Ok(()) => self.fatal(format!(
                "{} exited before the song ended",
                stage.name()
            )),
            Err(e) => self.fatal(format!("{e:#}")),
        }
    }

    async fn forward_filter_output(
        &self,
        mut output: BoxedRead,
        generation: u64,
        first_input: oneshot::Receiver<()>,
    ) -> Result<()> {
        // The first-output deadline only starts once the filter has input
        let _ = first_input.await;

        let mut buf = vec![0u8; READ_BUF_SIZE];
        let n = tokio::time::timeout(
            self.config.retry.first_byte_timeout(),
            output.read(&mut buf),
        )
        .await
        .context("Effect pipeline produced no output in time")?
        .context("Failed to read filter output")?;

        if n == 0 {
            return Ok(());
        }

        self.on_first_output(generation);
        self.forward_to_encoder(&buf[..n]).await?;

        loop {
            let n = output
                .read(&mut buf)
                .await
                .context("Failed to read filter output")?;
            if n == 0 {
                return Ok(());
            }
            self.forward_to_encoder(&buf[..n]).await?;
        }
    }

    fn on_first_output(&self, generation: u64) {
        if generation != self.generation.load(Ordering::SeqCst) {
            return;
        }

        debug!(
            "[playback {}] Filter stage {generation} produced first output",
            self.playback
        );

        if self.control.user_paused() {
            self.source.pause();
        } else {
            self.control.resume_transport();
        }

        self.bus.send(Event::Processor {
            playback: self.playback,
            event: ProcessorEvent::PipelineReady,
        });
    }

    async fn forward_to_encoder(&self, data: &[u8]) -> Result<()> {
        let tx = lock(&self.encoder_input).clone();
        let Some(tx) = tx else {
            return Ok(());
        };

        if tx.send(Bytes::copy_from_slice(data)).await.is_err() {
            bail!("Encoder input closed");
        }

        Ok(())
    }

    async fn run_encoder_input(&self, mut rx: mpsc::Receiver<Bytes>, mut input: BoxedWrite) {
        while let Some(chunk) = rx.recv().await {
            if let Err(e) = input.write_all(&chunk).await {
                self.fatal(format!("Failed to write encoder input: {e}"));
                return;
            }
            self.encoder_bytes
                .fetch_add(chunk.len() as u64, Ordering::SeqCst);
        }

        if let Err(e) = input.shutdown().await {
            debug!("[playback {}] Failed to close encoder input: {e}", self.playback);
        }
    }

    async fn run_encoder_output(
        &self,
        mut stage: Stage,
        mut output: BoxedRead,
        tx: mpsc::Sender<Bytes>,
    ) {
        let mut buf = vec![0u8; READ_BUF_SIZE];

        loop {
            let n = match output.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    self.fatal(format!("Failed to read encoder output: {e}"));
                    return;
                }
            };

            if n == 0 {
                break;
            }

            if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                debug!("[playback {}] Encoded stream receiver dropped", self.playback);
                return;
            }
        }

        match stage.finish().await {
            Ok(()) => debug!("[playback {}] Encoder finished", self.playback),
            Err(e) => self.fatal(format!("{e:#}")),
        }
    }
}
