use crate::{
    config::QueueConfig,
    song::{GuildId, Song},
};
use rand::{seq::IndexedRandom, seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Remaining repeats: -1 repeats forever, 0 disables repeating.
pub type RepeatCount = i32;

pub const REPEAT_FOREVER: RepeatCount = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListKind {
    Played,
    Advanced,
    Queue,
    Autoplay,
}

/// Index walk order of the combined list.
const WALK_ORDER: [ListKind; 4] = [
    ListKind::Played,
    ListKind::Advanced,
    ListKind::Queue,
    ListKind::Autoplay,
];

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct QueueEntry {
    /// Identity within the list holding the entry, never reused
    pub id: u64,
    pub song: Song,

    /// List the song was originally added to
    pub origin: ListKind,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Resolved {
    pub list: ListKind,
    pub local_index: usize,
    pub song: Song,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NextSong {
    /// Start playing this song
    Play(Song),

    /// Playback was requested but every list is empty
    NothingToPlay,

    /// The last song finished and nothing follows it
    Idle,
}

#[derive(Default)]
struct IdCounters {
    played: u64,
    advanced: u64,
    queue: u64,
    autoplay: u64,
}

impl IdCounters {
    fn next(&mut self, list: ListKind) -> u64 {
        let counter = match list {
            ListKind::Played => &mut self.played,
            ListKind::Advanced => &mut self.advanced,
            ListKind::Queue => &mut self.queue,
            ListKind::Autoplay => &mut self.autoplay,
        };
        *counter += 1;
        *counter
    }
}

/// Per-guild song lists and the decision of what plays next.
///
/// The song now playing is the head of `advanced → queue → autoplay`.
/// Finished songs move from that head into `played`.
pub struct Queue {
    guild: GuildId,
    played: VecDeque<QueueEntry>,
    advanced: VecDeque<QueueEntry>,
    queue: VecDeque<QueueEntry>,
    autoplay: VecDeque<QueueEntry>,
    ids: IdCounters,

    /// Songs consumed from `queue` since it was last refilled
    queue_history: Vec<Song>,

    autoplay_pool: Vec<Song>,
    autoplay_cursor: usize,

    /// The head is no longer the song being played, so the next call to
    /// `next_song(false)` must not record it as finished
    head_detached: bool,

    played_limit: usize,
    autoplay_target: usize,

    pub repeat_song_count: RepeatCount,
    pub repeat_queue_count: RepeatCount,
    pub shuffle: bool,
}

impl Queue {
    pub fn new(guild: GuildId, config: &QueueConfig) -> Self {
        Queue {
            guild,
            played: VecDeque::new(),
            advanced: VecDeque::new(),
            queue: VecDeque::new(),
            autoplay: VecDeque::new(),
            ids: IdCounters::default(),
            queue_history: vec![],
            autoplay_pool: vec![],
            autoplay_cursor: 0,
            head_detached: false,
            played_limit: config.played_history,
            autoplay_target: config.autoplay_target,
            repeat_song_count: 0,
            repeat_queue_count: 0,
            shuffle: false,
        }
    }

    fn list(&self, list: ListKind) -> &VecDeque<QueueEntry> {
        match list {
            ListKind::Played => &self.played,
            ListKind::Advanced => &self.advanced,
            ListKind::Queue => &self.queue,
            ListKind::Autoplay => &self.autoplay,
        }
    }

    fn list_mut(&mut self, list: ListKind) -> &mut VecDeque<QueueEntry> {
        match list {
            ListKind::Played => &mut self.played,
            ListKind::Advanced => &mut self.advanced,
            ListKind::Queue => &mut self.queue,
            ListKind::Autoplay => &mut self.autoplay,
        }
    }

    /// Total number of entries over all four lists.
    pub fn len(&self) -> usize {
        WALK_ORDER.iter().map(|list| self.list(*list).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn played(&self) -> &VecDeque<QueueEntry> {
        &self.played
    }

    pub fn advanced(&self) -> &VecDeque<QueueEntry> {
        &self.advanced
    }

    pub fn queue(&self) -> &VecDeque<QueueEntry> {
        &self.queue
    }

    pub fn autoplay(&self) -> &VecDeque<QueueEntry> {
        &self.autoplay
    }

    /// Snapshot of every entry in index order.
    pub fn entries(&self) -> Vec<(ListKind, QueueEntry)> {
        WALK_ORDER
            .iter()
            .flat_map(|list| {
                self.list(*list)
                    .iter()
                    .map(move |entry| (*list, entry.clone()))
            })
            .collect()
    }

    /// Maps a combined index to the list and position holding it.
    pub fn resolve_index(&self, index: usize) -> Option<Resolved> {
        let mut index = index;

        for list in WALK_ORDER {
            let entries = self.list(list);
            if index < entries.len() {
                return Some(Resolved {
                    list,
                    local_index: index,
                    song: entries[index].song.clone(),
                });
            }
            index -= entries.len();
        }

        None
    }

    /// List holding the head of the combined ordering.
    fn head_list(&self) -> Option<ListKind> {
        [ListKind::Advanced, ListKind::Queue, ListKind::Autoplay]
            .into_iter()
            .find(|list| !self.list(*list).is_empty())
    }

    /// The song at the head of the combined ordering.
    pub fn current(&self) -> Option<&Song> {
        let list = self.head_list()?;
        self.list(list).front().map(|entry| &entry.song)
    }

    fn is_head(&self, list: ListKind, local_index: usize) -> bool {
        local_index == 0 && self.head_list() == Some(list)
    }

    /// True when the head is the song currently being played.
    fn head_pinned(&self) -> bool {
        !self.head_detached && self.head_list().is_some()
    }

    fn entry(&mut self, list: ListKind, song: Song, origin: ListKind) -> QueueEntry {
        QueueEntry {
            id: self.ids.next(list),
            song,
            origin,
        }
    }

    /// Adds a requested song and returns its entry id. With shuffle on the
    /// song lands at a random position behind the song now playing.
    pub fn add_queue(&mut self, song: Song) -> u64 {
        let entry = self.entry(ListKind::Queue, song, ListKind::Queue);
        let id = entry.id;

        if self.shuffle {
            let first = usize::from(self.head_pinned() && self.head_list() == Some(ListKind::Queue));
            let at = rand::rng().random_range(first..=self.queue.len().max(first));
            self.queue.insert(at, entry);
        } else {
            self.queue.push_back(entry);
        }

        debug!("[guild {}] Queued song entry {id}", self.guild);
        id
    }

    pub fn add_autoplay(&mut self, song: Song) -> u64 {
        let entry = self.entry(ListKind::Autoplay, song, ListKind::Autoplay);
        let id = entry.id;
        self.autoplay.push_back(entry);
        id
    }

    /// Removes the entry at a combined index.
    pub fn remove_song(&mut self, index: usize) -> Option<QueueEntry> {
        let resolved = self.resolve_index(index)?;

        if self.is_head(resolved.list, resolved.local_index) {
            // The player skips to whatever becomes the head
            self.head_detached = true;
        }

        let entry = self
            .list_mut(resolved.list)
            .remove(resolved.local_index)?;

        info!(
            "[guild {}] Removed {} from {:?}",
            self.guild, entry.song.title, resolved.list
        );
        Some(entry)
    }

    /// Makes the entry at a combined index play next. Returns false when the
    /// index is out of range or already the song playing.
    pub fn advance(&mut self, index: usize) -> bool {
        let Some(resolved) = self.resolve_index(index) else {
            return false;
        };

        if self.is_head(resolved.list, resolved.local_index) {
            return false;
        }

        let target = if resolved.list == ListKind::Played {
            // History stays intact, the song is played again
            resolved.song.clone()
        } else {
            match self.list_mut(resolved.list).remove(resolved.local_index) {
                Some(entry) => entry.song,
                None => return false,
            }
        };

        let origin = match resolved.list {
            ListKind::Played => ListKind::Advanced,
            list => list,
        };

        // The song playing keeps its place at the very front
        let mut at = 0;
        if self.head_pinned() {
            if let Some(head_list) = self.head_list().filter(|list| *list != ListKind::Advanced) {
                if let Some(head) = self.list_mut(head_list).pop_front() {
                    let moved = self.entry(ListKind::Advanced, head.song, head.origin);
                    self.advanced.push_front(moved);
                }
            }
            at = 1;
        }

        let entry = self.entry(ListKind::Advanced, target, origin);
        info!(
            "[guild {}] Advanced {} to play next",
            self.guild, entry.song.title
        );
        self.advanced.insert(at.min(self.advanced.len()), entry);

        true
    }

    /// Decides what plays next. `start` kicks off playback from idle;
    /// otherwise the song now playing has just finished.
    pub fn next_song(&mut self, start: bool) -> NextSong {
        let detached = std::mem::take(&mut self.head_detached);

        if !start && !detached {
            if let Some(song) = self.current().cloned() {
                if self.repeat_song_count != 0 {
                    if self.repeat_song_count > 0 {
                        self.repeat_song_count -= 1;
                    }
                    // The head stays in place, each finished repeat is history
                    let origin = self.head_list().unwrap_or(ListKind::Queue);
                    self.record_played(song.clone(), origin);
                    info!(
                        "[guild {}] Repeating {} ({} repeats left)",
                        self.guild, song.title, self.repeat_song_count
                    );
                    return NextSong::Play(song);
                }

                self.finish_head();
            }
        }

        if self.queue.is_empty() && !self.queue_history.is_empty() {
            self.refill_queue();
        }

        self.refresh_autoplay();

        match self.current() {
            Some(song) => NextSong::Play(song.clone()),
            None if start => NextSong::NothingToPlay,
            None => NextSong::Idle,
        }
    }

    /// Moves the head into `played`.
    fn finish_head(&mut self) {
        let Some(list) = self.head_list() else {
            return;
        };
        let Some(entry) = self.list_mut(list).pop_front() else {
            return;
        };

        if entry.origin == ListKind::Queue {
            self.queue_history.push(entry.song.clone());
        }

        self.record_played(entry.song, entry.origin);
    }

    /// Appends to `played`, evicting the oldest entries past the bound.
    fn record_played(&mut self, song: Song, origin: ListKind) {
        let played = self.entry(ListKind::Played, song, origin);
        self.played.push_back(played);
        while self.played.len() > self.played_limit {
            self.played.pop_front();
        }
    }

    fn refill_queue(&mut self) {
        let history = std::mem::take(&mut self.queue_history);

        if self.repeat_queue_count == 0 {
            return;
        }
        if self.repeat_queue_count > 0 {
            self.repeat_queue_count -= 1;
        }

        let mut songs = history;
        if self.shuffle {
            songs.shuffle(&mut rand::rng());
        }

        info!(
            "[guild {}] Repeating queue of {} songs ({} repeats left)",
            self.guild,
            songs.len(),
            self.repeat_queue_count
        );

        for song in songs {
            let entry = self.entry(ListKind::Queue, song, ListKind::Queue);
            self.queue.push_back(entry);
        }
    }

    /// Replaces the songs autoplay draws from.
    pub fn set_autoplay_pool(&mut self, songs: Vec<Song>) {
        self.autoplay_pool = songs;
        self.autoplay_cursor = 0;
    }

    /// Tops `autoplay` up to its target size from the autoplay pool.
    pub fn refresh_autoplay(&mut self) {
        if self.autoplay_pool.is_empty() {
            return;
        }

        let mut added = 0;
        while self.autoplay.len() < self.autoplay_target {
            let song = if self.shuffle {
                self.autoplay_pool.choose(&mut rand::rng()).cloned()
            } else {
                let song = self
                    .autoplay_pool
                    .get(self.autoplay_cursor % self.autoplay_pool.len())
                    .cloned();
                self.autoplay_cursor += 1;
                song
            };

            let Some(mut song) = song else {
                break;
            };
            song.requested_by = None;
            self.add_autoplay(song);
            added += 1;
        }

        if added > 0 {
            debug!("[guild {}] Added {added} autoplay songs", self.guild);
        }
    }

    /// Drops every requested song and the history that repeats them.
    pub fn clear_queue(&mut self) {
        if self.head_pinned() && self.head_list() == Some(ListKind::Queue) {
            self.head_detached = true;
        }

        self.queue.clear();
        self.queue_history.clear();
    }

    /// Playback stopped without the current song finishing. It plays again
    /// on the next start.
    pub fn stop(&mut self) {
        self.head_detached = true;
    }
}
