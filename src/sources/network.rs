use super::{Fetched, SongFetcher};
use crate::{
    pipeline::Stage,
    song::{Song, SourceKind, UserId},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::{
    hash::{DefaultHasher, Hash, Hasher},
    path::PathBuf,
};
use youtube_dl::{download_yt_dlp, SingleVideo, YoutubeDl};

/// Fetches network songs by running yt-dlp and streaming its stdout.
pub struct NetworkFetcher {
    yt_dlp_path: PathBuf,
}

impl NetworkFetcher {
    pub fn new(yt_dlp_path: PathBuf) -> Self {
        Self { yt_dlp_path }
    }

    /// Downloads the yt-dlp binary next to the configured path if it is missing.
    pub async fn ensure_binary(&self) -> Result<()> {
        let path = self.yt_dlp_path.clone();
        let exists = tokio::task::spawn_blocking(move || path.exists()).await?;

        if !exists {
            let dir = self
                .yt_dlp_path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .map(|dir| dir.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."));
            info!("Downloading yt-dlp binary into {}", dir.display());
            download_yt_dlp(dir).await?;
        }

        Ok(())
    }

    async fn video_info(&self, url_or_search_terms: &str) -> Result<SingleVideo> {
        let output = YoutubeDl::new(url_or_search_terms)
            .youtube_dl_path(&self.yt_dlp_path)
            .extra_arg("--default-search")
            .extra_arg("ytsearch")
            .extra_arg("--no-playlist")
            .run_async()
            .await?;

        let single_video = output.clone().into_single_video();
        let first_match = single_video.or_else(|| {
            let playlist = output.into_playlist()?;
            let entries = playlist.entries?;
            entries.first().cloned()
        });

        first_match.context("No video found")
    }

    /// Looks up a url or search terms and builds a song for it.
    pub async fn resolve(
        &self,
        url_or_search_terms: &str,
        requested_by: Option<UserId>,
    ) -> Result<Song> {
        let video = self.video_info(url_or_search_terms).await?;

        let mut hasher = DefaultHasher::new();
        video.id.hash(&mut hasher);

        let mut song = Song {
            id: hasher.finish(),
            kind: SourceKind::Network,
            title: String::new(),
            url: format!("https://youtu.be/{}", video.id),
            duration: None,
            thumbnail: None,
            artist: String::new(),
            live: false,
            requested_by,
        };
        apply_video_info(&mut song, video)?;

        Ok(song)
    }
}

fn apply_video_info(song: &mut Song, video: SingleVideo) -> Result<()> {
    song.title = video.title.context("No title found in yt-dlp JSON!")?;
    song.artist = video
        .channel
        .or(video.uploader)
        .unwrap_or_else(|| "Unknown".to_string());
    song.live = video.is_live.unwrap_or(false);
    song.duration = if song.live {
        None
    } else {
        video.duration.and_then(|duration| duration.as_f64()).map(|secs| secs.round() as u64)
    };
    song.thumbnail = video.thumbnail;

    Ok(())
}

#[async_trait]
impl SongFetcher for NetworkFetcher {
    async fn open(&self, song: &Song) -> Result<Fetched> {
        // Spawn yt-dlp ourselves so we can capture stdout as a stream
        let mut cmd = tokio::process::Command::new(&self.yt_dlp_path);
        cmd.arg(&song.url)
            .arg("--no-progress")
            .arg("--no-playlist")
            .arg("--format")
            .arg("bestaudio/best")
            .arg("-o")
            .arg("-");

        let process = Stage::spawn("yt-dlp", cmd)?;
        Fetched::from_process(process)
    }

    async fn fetch_data(&self, song: &Song) -> Result<Song> {
        let video = self.video_info(&song.url).await?;

        let mut refreshed = song.clone();
        apply_video_info(&mut refreshed, video)?;

        Ok(refreshed)
    }
}
