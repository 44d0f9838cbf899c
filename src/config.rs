use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use tokio::fs::read_to_string;

pub const CONFIG_FILE: &str = "Config.toml";

/// Chunk sizing and timing of the buffering/delivery engine.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Duration of one large chunk persisted to the chunk store
    pub large_chunk_secs: u64,

    /// Duration of one small chunk delivered per timer tick
    pub small_chunk_ms: u64,

    /// Number of large chunks required before delivery may begin
    pub ready_chunks: usize,

    /// Live sources: large chunks kept on disk before eager deletion starts
    pub live_window_chunks: usize,

    /// Live sources: how many large chunks the read cursor trails the live edge
    pub live_lag_chunks: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        ChunkConfig {
            large_chunk_secs: 10,
            small_chunk_ms: 100,
            ready_chunks: 3,
            live_window_chunks: 5,
            live_lag_chunks: 2,
        }
    }
}

impl ChunkConfig {
    /// How many small chunks make up one large chunk.
    pub fn small_per_large(&self) -> usize {
        (self.large_chunk_secs * 1000 / self.small_chunk_ms) as usize
    }

    pub fn small_chunk(&self) -> Duration {
        Duration::from_millis(self.small_chunk_ms)
    }
}

/// Retry and timeout policy.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Acquisition attempts before a source gives up
    pub max_attempts: u32,

    /// Fixed delay between acquisition attempts
    pub retry_backoff_ms: u64,

    /// Chunk store read attempts before a source gives up
    pub read_retries: u32,

    pub read_retry_delay_ms: u64,

    /// Live sources restart acquisition this often to refresh upstream links
    pub live_refresh_secs: u64,

    /// Upper bound for a voice connection to become ready
    pub join_timeout_secs: u64,

    /// Upper bound for a new effect pipeline to produce its first output
    pub first_byte_timeout_secs: u64,

    /// How often the player checks whether the active resource has ended
    pub end_poll_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            retry_backoff_ms: 1000,
            read_retries: 5,
            read_retry_delay_ms: 200,
            live_refresh_secs: 5 * 60 * 60,
            join_timeout_secs: 15,
            first_byte_timeout_secs: 30,
            end_poll_ms: 250,
        }
    }
}

impl RetryConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn read_retry_delay(&self) -> Duration {
        Duration::from_millis(self.read_retry_delay_ms)
    }

    pub fn live_refresh(&self) -> Duration {
        Duration::from_secs(self.live_refresh_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn first_byte_timeout(&self) -> Duration {
        Duration::from_secs(self.first_byte_timeout_secs)
    }

    pub fn end_poll(&self) -> Duration {
        Duration::from_millis(self.end_poll_ms)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of finished songs remembered in `played`
    pub played_history: usize,

    /// Autoplay list is replenished up to this many songs
    pub autoplay_target: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            played_history: 10,
            autoplay_target: 5,
        }
    }
}

#[cfg(feature = "discord")]
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DiscordConfig {
    /// Discord bot token
    pub discord_token: String,

    /// Guild the demo binary plays in
    pub discord_guild_id: u64,

    /// User whose voice channel the demo binary joins
    pub discord_user_id: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Parent directory for per-playback chunk store directories
    pub scratch_dir: Option<PathBuf>,

    pub ffmpeg_path: PathBuf,
    pub yt_dlp_path: PathBuf,

    /// Encoder output bitrate in bits per second
    pub opus_bitrate: u32,

    /// Tempo and pitch factor applied by the nightcore effect
    pub nightcore_rate: f64,

    /// Listen address of the local TCP voice transport
    pub tcp_listen: String,

    #[serde(flatten)]
    pub chunks: ChunkConfig,

    #[serde(flatten)]
    pub retry: RetryConfig,

    #[serde(flatten)]
    pub queue: QueueConfig,

    #[cfg(feature = "discord")]
    #[serde(flatten)]
    pub discord: Option<DiscordConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            scratch_dir: None,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            yt_dlp_path: PathBuf::from("./yt-dlp"),
            opus_bitrate: 128_000,
            nightcore_rate: 1.25,
            tcp_listen: "127.0.0.1:7878".to_string(),
            chunks: ChunkConfig::default(),
            retry: RetryConfig::default(),
            queue: QueueConfig::default(),
            #[cfg(feature = "discord")]
            discord: None,
        }
    }
}

impl Config {
    /// Resolved parent directory for chunk stores.
    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunks.large_chunk_secs == 0 || self.chunks.small_chunk_ms == 0 {
            bail!("Chunk durations must be greater than 0");
        }

        if (self.chunks.large_chunk_secs * 1000) % self.chunks.small_chunk_ms != 0 {
            bail!(
                "small_chunk_ms ({}) must evenly divide large_chunk_secs ({}s)",
                self.chunks.small_chunk_ms,
                self.chunks.large_chunk_secs
            );
        }

        if self.chunks.ready_chunks == 0 {
            bail!("ready_chunks must be greater than 0");
        }

        if self.chunks.live_lag_chunks >= self.chunks.live_window_chunks {
            bail!("live_lag_chunks must be smaller than live_window_chunks");
        }

        if self.retry.max_attempts == 0 || self.retry.read_retries == 0 {
            bail!("Retry counts must be greater than 0");
        }

        if self.nightcore_rate <= 0.0 {
            bail!("nightcore_rate must be positive, got: {}", self.nightcore_rate);
        }

        Ok(())
    }
}

pub async fn load(path: &str) -> Result<Config> {
    let config = read_to_string(path).await?;
    let config: Config = toml::from_str(&config)?;
    config.validate()?;

    Ok(config)
}

/// Reads `Config.toml` if present, otherwise falls back to defaults.
pub async fn load_or_default() -> Result<Config> {
    match tokio::fs::try_exists(CONFIG_FILE).await {
        Ok(true) => load(CONFIG_FILE).await,
        _ => {
            info!("No {CONFIG_FILE} found, using default configuration");
            Ok(Config::default())
        }
    }
}
