use serde::{Deserialize, Serialize};
use std::time::Duration;

pub type GuildId = u64;
pub type UserId = u64;
pub type ChannelId = u64;

/// Where a song's audio bytes come from.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Streamed from a video/audio site through yt-dlp
    Network,

    /// Read from a file hosted on a cloud drive
    CloudFile,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Song {
    pub id: u64,
    pub kind: SourceKind,
    pub title: String,

    /// Playable url or remote file reference
    pub url: String,

    /// Duration in seconds, `None` for live streams
    pub duration: Option<u64>,

    pub thumbnail: Option<String>,
    pub artist: String,
    pub live: bool,

    /// User who requested the song, `None` for autoplay picks
    pub requested_by: Option<UserId>,
}

impl PartialEq for Song {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind
    }
}

impl Song {
    pub fn duration(&self) -> Option<Duration> {
        self.duration.map(Duration::from_secs)
    }

    pub fn is_autoplay(&self) -> bool {
        self.requested_by.is_none()
    }
}
