use crate::{notify::Notification, song::Song};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::{self, Receiver, Sender};

/// Identifies one playback attempt within a guild. Events from superseded
/// attempts carry an older id and are ignored by the player.
pub type PlaybackId = u64;

#[derive(Clone, Debug, PartialEq)]
pub enum SourceEvent {
    /// Enough large chunks exist for delivery to begin
    BufferReady,

    /// Output stream ended after the last chunk was delivered
    Finished,

    /// Acquisition or chunk reads gave up
    Fatal { diagnostic: String },
}

#[derive(Clone, Debug, PartialEq)]
pub enum ProcessorEvent {
    /// A (re)built effect pipeline produced its first output
    PipelineReady,

    /// A pipeline stage failed outside of a clean teardown
    Fatal { diagnostic: String },
}

#[derive(Clone, Debug)]
pub enum PlayerEvent {
    Connected,
    Disconnected,
    NowPlaying { playback: PlaybackId, song: Song },
    Paused,
    Resumed,
    SongFinished { song: Song, fatal: bool },

    /// Queue ran dry after a song finished
    Idle,

    /// Playback was requested from idle but nothing is queued
    NothingToPlay,
}

#[derive(Clone, Debug)]
pub enum Event {
    Source {
        playback: PlaybackId,
        event: SourceEvent,
    },
    Processor {
        playback: PlaybackId,
        event: ProcessorEvent,
    },
    Player(PlayerEvent),
    Notification(Notification),
}

#[derive(Clone)]
pub struct EventBus {
    tx: Sender<Event>,
    next_playback: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel::<Event>(100);
        Self {
            tx,
            next_playback: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn send(&self, event: Event) {
        // Having no subscribers is not an error for a status bus
        if let Err(e) = self.tx.send(event) {
            trace!("Event dropped, no subscribers: {:?}", e.0);
        }
    }

    pub fn subscribe(&self) -> Subscriber {
        Subscriber::new(self.tx.subscribe())
    }

    /// Allocates the id for a new playback attempt.
    pub fn next_playback_id(&self) -> PlaybackId {
        self.next_playback.fetch_add(1, Ordering::Relaxed)
    }
}

pub struct Subscriber {
    rx: Receiver<Event>,
}

impl Subscriber {
    pub fn new(rx: Receiver<Event>) -> Self {
        Self { rx }
    }

    pub fn try_recv(&mut self) -> Result<Event, TryRecvError> {
        self.rx.try_recv()
    }

    /// Waits for the next event. Returns `None` once every bus handle is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => break Some(event),
                Err(RecvError::Closed) => break None,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "EventBus::Subscriber lagging behind senders, skipping {skipped} messages"
                    );
                }
            }
        }
    }
}

pub fn debug(bus: &EventBus) {
    let bus = bus.clone();
    tokio::spawn(async move {
        let mut bus = bus.subscribe();
        while let Some(event) = bus.recv().await {
            debug!("Received event: {:?}", event);
        }
    });
}
