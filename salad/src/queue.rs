use std::{collections::VecDeque, str::FromStr};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::{error::InvalidLoopMode, konst, track::Track};

#[derive(Debug, Default, Hash, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    #[default]
    None,
    /// Replay the current track.
    Track,
    /// Re-append every finished track to the back of the queue.
    Queue,
}

impl LoopMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Track => "track",
            Self::Queue => "queue",
        }
    }
}

impl std::fmt::Display for LoopMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoopMode {
    type Err = InvalidLoopMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "off" => Ok(Self::None),
            "track" => Ok(Self::Track),
            "queue" => Ok(Self::Queue),
            _ => Err(InvalidLoopMode(s.to_owned())),
        }
    }
}

/// Tracks waiting to be played.
///
/// The head of the queue is the track that is playing (or about to). It is only peeked when
/// playback starts, and consumed once Lavalink reports the track has ended.
#[derive(Debug, Default)]
pub struct Queue {
    inner: VecDeque<Track>,
    previous: VecDeque<Track>,
    loop_mode: LoopMode,
    closed: bool,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, track: Track) -> bool {
        if self.closed {
            return false;
        }
        self.inner.push_back(track);
        true
    }

    /// Inserts `track` at `position`, clamped to the queue bounds.
    pub fn insert(&mut self, track: Track, position: usize) -> bool {
        if self.closed {
            return false;
        }
        let position = position.min(self.inner.len());
        self.inner.insert(position, track);
        true
    }

    pub fn remove(&mut self, index: usize) -> Option<Track> {
        self.inner.remove(index)
    }

    pub fn clear(&mut self) {
        self.inner.clear();
        self.previous.clear();
    }

    pub fn shuffle(&mut self) {
        self.inner.make_contiguous().shuffle(&mut rand::rng());
    }

    /// The track to play next, without removing it.
    ///
    /// With [`LoopMode::Track`] this is `current` whenever there is one. With
    /// [`LoopMode::Queue`] an exhausted queue is refilled from the history first.
    pub fn get_next(&mut self, current: Option<&Track>) -> Option<Track> {
        if self.closed {
            return None;
        }
        if let (LoopMode::Track, Some(current)) = (self.loop_mode, current) {
            return Some(current.clone());
        }
        if self.inner.is_empty() && self.loop_mode == LoopMode::Queue {
            self.inner.append(&mut self.previous);
        }
        self.inner.front().cloned()
    }

    /// Removes the head, remembering it in the bounded history.
    pub fn consume_next(&mut self) -> Option<Track> {
        let consumed = self.inner.pop_front()?;
        self.previous.push_back(consumed.clone());
        if self.previous.len() > konst::queue::PREVIOUS_LIMIT {
            self.previous.pop_front();
        }
        Some(consumed)
    }

    pub fn peek(&self, index: usize) -> Option<&Track> {
        self.inner.get(index)
    }

    /// A snapshot of every queued track, head first.
    pub fn tracks(&self) -> Vec<Track> {
        self.inner.iter().cloned().collect()
    }

    pub fn iter(&self) -> std::collections::vec_deque::Iter<'_, Track> {
        self.inner.iter()
    }

    pub const fn previous(&self) -> &VecDeque<Track> {
        &self.previous
    }

    pub const fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub const fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Empties the queue and makes it reject every further track.
    pub(crate) fn close(&mut self) {
        self.clear();
        self.loop_mode = LoopMode::None;
        self.closed = true;
    }

    pub(crate) const fn reopen(&mut self) {
        self.closed = false;
    }
}
