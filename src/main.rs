use anyhow::{anyhow, Result};
use guild_player::{
    config,
    event,
    guild::Guilds,
    pipeline::Ffmpeg,
    song::{GuildId, Song, SourceKind, UserId},
    sources::{CloudFileFetcher, Fetchers, NetworkFetcher},
    transport::{TcpTransport, VoiceTransport},
};
use log::info;
use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
};

/// Guild and user the demo plays for on the local transport.
const LOCAL_GUILD: GuildId = 1;
const LOCAL_USER: UserId = 1;

/// Arguments prefixed with this are streamed as cloud files.
const CLOUD_FILE_PREFIX: &str = "file:";

fn cloud_file_song(url: &str) -> Song {
    let mut hasher = DefaultHasher::new();
    url.hash(&mut hasher);

    Song {
        id: hasher.finish(),
        kind: SourceKind::CloudFile,
        title: url.rsplit('/').next().unwrap_or(url).to_string(),
        url: url.to_string(),
        duration: None,
        thumbnail: None,
        artist: "Unknown".to_string(),
        live: false,
        requested_by: Some(LOCAL_USER),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "guild_player=info");
    }
    pretty_env_logger::init_timed();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let config = Arc::new(config::load_or_default().await?);

    let network = Arc::new(NetworkFetcher::new(config.yt_dlp_path.clone()));
    network.ensure_binary().await?;

    let fetchers = Fetchers::new()
        .with(SourceKind::Network, network.clone())
        .with(SourceKind::CloudFile, Arc::new(CloudFileFetcher::new()));
    let launcher = Arc::new(Ffmpeg::new(config.ffmpeg_path.clone(), config.opus_bitrate));

    let (transport, guild_id, user_id): (Arc<dyn VoiceTransport>, GuildId, UserId) = {
        #[cfg(feature = "discord")]
        {
            match &config.discord {
                Some(discord) => (
                    Arc::new(guild_player::transport::songbird::SongbirdTransport::start(discord).await?),
                    discord.discord_guild_id,
                    discord.discord_user_id,
                ),
                None => (
                    Arc::new(TcpTransport::new(config.tcp_listen.clone())),
                    LOCAL_GUILD,
                    LOCAL_USER,
                ),
            }
        }
        #[cfg(not(feature = "discord"))]
        {
            (
                Arc::new(TcpTransport::new(config.tcp_listen.clone())),
                LOCAL_GUILD,
                LOCAL_USER,
            )
        }
    };

    let guilds = Guilds::new(config.clone(), launcher, fetchers, transport);
    let guild = guilds.get_or_create(guild_id).await;
    event::debug(&guild.bus);

    for arg in std::env::args().skip(1) {
        let song = match arg.strip_prefix(CLOUD_FILE_PREFIX) {
            Some(url) => cloud_file_song(url),
            None => network.resolve(&arg, Some(user_id)).await?,
        };

        info!("Queueing {} by {}", song.title, song.artist);
        guild.queue.write().await.add_queue(song);
    }

    guild.player.join(user_id).await?;
    guild.player.start().await?;

    tokio::signal::ctrl_c().await?;
    guilds.remove(guild_id).await;

    Ok(())
}
