use super::{Fetched, SongFetcher};
use crate::song::Song;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use tokio_util::io::StreamReader;

/// Fetches cloud-hosted files with a streaming HTTP GET of the song url.
pub struct CloudFileFetcher {
    client: reqwest::Client,
}

impl Default for CloudFileFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudFileFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SongFetcher for CloudFileFetcher {
    async fn open(&self, song: &Song) -> Result<Fetched> {
        let response = self
            .client
            .get(&song.url)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", song.url))?
            .error_for_status()
            .with_context(|| format!("Cloud file {} not available", song.url))?;

        let stream = Box::pin(response.bytes_stream().map_err(std::io::Error::other));

        Ok(Fetched::from_reader(Box::new(StreamReader::new(stream))))
    }
}
