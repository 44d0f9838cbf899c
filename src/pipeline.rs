//! External transcoder stages.
//!
//! A [`Stage`] is one transcoder process (or an in-memory stand-in) with a
//! writable input and a readable output. Sources use a decoder stage to turn
//! arbitrary fetched bytes into raw PCM, the processor chains a filter stage
//! and an encoder stage.

use crate::constants::{CHANNELS, SAMPLE_RATE};
use anyhow::{bail, Context, Result};
use std::{
    collections::VecDeque,
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite},
    process::{Child, Command},
};

pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Number of stderr lines kept for diagnostics.
const STDERR_TAIL_LINES: usize = 8;

pub struct Stage {
    name: String,
    input: Option<BoxedWrite>,
    output: Option<BoxedRead>,
    child: Option<Child>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl Stage {
    /// Wraps an already connected reader/writer pair, used for in-process stages.
    pub fn from_io(name: impl Into<String>, input: BoxedWrite, output: BoxedRead) -> Self {
        Self {
            name: name.into(),
            input: Some(input),
            output: Some(output),
            child: None,
            stderr_tail: Default::default(),
        }
    }

    /// Spawns `cmd` with piped stdio. The process is killed when the stage is dropped.
    pub fn spawn(name: impl Into<String>, mut cmd: Command) -> Result<Self> {
        let name = name.into();
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {name}"))?;

        let stdin = child
            .stdin
            .take()
            .with_context(|| format!("Failed to get {name} stdin"))?;
        let stdout = child
            .stdout
            .take()
            .with_context(|| format!("Failed to get {name} stdout"))?;
        let stderr = child
            .stderr
            .take()
            .with_context(|| format!("Failed to get {name} stderr"))?;

        let stderr_tail: Arc<Mutex<VecDeque<String>>> = Default::default();

        {
            let name = name.clone();
            let stderr_tail = stderr_tail.clone();
            tokio::spawn(async move {
                // Print stderr to log
                let mut reader = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    debug!("{name} stderr: {line}");
                    if let Ok(mut tail) = stderr_tail.lock() {
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
            });
        }

        Ok(Self {
            name,
            input: Some(Box::new(stdin)),
            output: Some(Box::new(stdout)),
            child: Some(child),
            stderr_tail,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn take_input(&mut self) -> Option<BoxedWrite> {
        self.input.take()
    }

    pub fn take_output(&mut self) -> Option<BoxedRead> {
        self.output.take()
    }

    /// Last stderr lines of the process, joined for a diagnostic message.
    pub fn diagnostic(&self) -> String {
        self.stderr_tail
            .lock()
            .map(|tail| tail.iter().cloned().collect::<Vec<_>>().join(" | "))
            .unwrap_or_default()
    }

    /// Waits for the process to exit and fails on a non-zero status.
    pub async fn finish(&mut self) -> Result<()> {
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };

        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for {}", self.name))?;

        if !status.success() {
            bail!(
                "{} failed (exit code {code}): {stderr}",
                self.name,
                code = status.code().unwrap_or_default(),
                stderr = self.diagnostic()
            );
        }

        Ok(())
    }

    pub async fn kill(&mut self) {
        self.input.take();
        self.output.take();

        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!("Failed to kill {}: {e}", self.name);
            }
        }
    }
}

/// Creates the transcoder stages used by sources and the processor.
pub trait StageLauncher: Send + Sync {
    /// Any container/codec in, raw PCM out.
    fn decoder(&self) -> Result<Stage>;

    /// Raw PCM in, effect-filtered raw PCM out. `tempo` > 1.0 speeds up
    /// and pitches up playback.
    fn filter(&self, tempo: f64) -> Result<Stage>;

    /// Raw PCM in, compressed audio for the voice transport out.
    fn encoder(&self) -> Result<Stage>;
}

pub struct Ffmpeg {
    path: PathBuf,
    opus_bitrate: u32,
}

impl Ffmpeg {
    pub fn new(path: PathBuf, opus_bitrate: u32) -> Self {
        Self { path, opus_bitrate }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.path);
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");
        cmd
    }

    fn raw_input(cmd: &mut Command) {
        cmd.arg("-f")
            .arg("s16le")
            .arg("-ar")
            .arg(SAMPLE_RATE.to_string())
            .arg("-ac")
            .arg(CHANNELS.to_string())
            .arg("-i")
            .arg("pipe:0");
    }

    fn raw_output(cmd: &mut Command) {
        cmd.arg("-f")
            .arg("s16le")
            .arg("-ar")
            .arg(SAMPLE_RATE.to_string())
            .arg("-ac")
            .arg(CHANNELS.to_string())
            .arg("pipe:1");
    }
}

/// ffmpeg audio filter chain for the given tempo factor.
pub fn filter_chain(tempo: f64) -> String {
    let mut filters = vec![];

    if (tempo - 1.0).abs() > f64::EPSILON {
        let shifted_rate = (SAMPLE_RATE as f64 * tempo).round() as u32;
        filters.push(format!("asetrate={shifted_rate}"));
    }

    filters.push("loudnorm=I=-16:LRA=11:TP=-1.5".to_string());

    // loudnorm upsamples internally
    filters.push(format!("aresample={SAMPLE_RATE}"));

    filters.join(",")
}

impl StageLauncher for Ffmpeg {
    fn decoder(&self) -> Result<Stage> {
        let mut cmd = self.command();
        cmd.arg("-i").arg("pipe:0").arg("-vn");
        Self::raw_output(&mut cmd);
        Stage::spawn("ffmpeg decoder", cmd)
    }

    fn filter(&self, tempo: f64) -> Result<Stage> {
        let mut cmd = self.command();
        Self::raw_input(&mut cmd);
        cmd.arg("-af").arg(filter_chain(tempo));
        Self::raw_output(&mut cmd);
        Stage::spawn("ffmpeg filter", cmd)
    }

    fn encoder(&self) -> Result<Stage> {
        let mut cmd = self.command();
        Self::raw_input(&mut cmd);
        cmd.arg("-c:a")
            .arg("libopus")
            .arg("-b:a")
            .arg(self.opus_bitrate.to_string())
            .arg("-f")
            .arg("ogg")
            .arg("pipe:1");
        Stage::spawn("ffmpeg encoder", cmd)
    }
}
