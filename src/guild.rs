use crate::{
    config::Config,
    event::EventBus,
    notify::{BusNotifier, NotificationSink},
    pipeline::StageLauncher,
    player::VcPlayer,
    queue::Queue,
    song::GuildId,
    sources::{Fetchers, SourceContext},
    transport::VoiceTransport,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;

/// Everything one guild plays with. Guilds share nothing but the
/// process-wide collaborators they are built from.
pub struct Guild {
    pub id: GuildId,
    pub bus: EventBus,
    pub queue: Arc<RwLock<Queue>>,
    pub player: VcPlayer,
    pub notifier: Arc<dyn NotificationSink>,
}

impl Guild {
    pub fn new(
        id: GuildId,
        config: Arc<Config>,
        launcher: Arc<dyn StageLauncher>,
        fetchers: Fetchers,
        transport: Arc<dyn VoiceTransport>,
    ) -> Self {
        let bus = EventBus::new();
        let notifier: Arc<dyn NotificationSink> = Arc::new(BusNotifier::new(bus.clone()));
        let queue = Arc::new(RwLock::new(Queue::new(id, &config.queue)));

        let ctx = SourceContext {
            config,
            launcher,
            fetchers,
            bus: bus.clone(),
        };
        let player = VcPlayer::new(id, queue.clone(), notifier.clone(), transport, ctx);

        Guild {
            id,
            bus,
            queue,
            player,
            notifier,
        }
    }
}

/// Creates guilds on first use and tears them down on removal.
pub struct Guilds {
    config: Arc<Config>,
    launcher: Arc<dyn StageLauncher>,
    fetchers: Fetchers,
    transport: Arc<dyn VoiceTransport>,
    guilds: RwLock<HashMap<GuildId, Arc<Guild>>>,
}

impl Guilds {
    pub fn new(
        config: Arc<Config>,
        launcher: Arc<dyn StageLauncher>,
        fetchers: Fetchers,
        transport: Arc<dyn VoiceTransport>,
    ) -> Self {
        Guilds {
            config,
            launcher,
            fetchers,
            transport,
            guilds: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, id: GuildId) -> Option<Arc<Guild>> {
        self.guilds.read().await.get(&id).cloned()
    }

    pub async fn get_or_create(&self, id: GuildId) -> Arc<Guild> {
        if let Some(guild) = self.get(id).await {
            return guild;
        }

        let mut guilds = self.guilds.write().await;
        guilds
            .entry(id)
            .or_insert_with(|| {
                info!("[guild {id}] Creating guild");
                Arc::new(Guild::new(
                    id,
                    self.config.clone(),
                    self.launcher.clone(),
                    self.fetchers.clone(),
                    self.transport.clone(),
                ))
            })
            .clone()
    }

    /// Disconnects the guild and forgets it.
    pub async fn remove(&self, id: GuildId) -> bool {
        let guild = self.guilds.write().await.remove(&id);

        match guild {
            Some(guild) => {
                guild.player.leave().await;
                info!("[guild {id}] Removed guild");
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.guilds.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.guilds.read().await.is_empty()
    }
}
