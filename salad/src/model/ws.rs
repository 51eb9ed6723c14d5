use serde::{Deserialize, Serialize};

use super::PlayerState;
use crate::track::TrackData;

/// A message received over the node websocket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Incoming {
    Ready(Ready),
    Stats(Stats),
    PlayerUpdate(PlayerUpdate),
    Event(Box<Event>),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ready {
    #[serde(default)]
    pub resumed: bool,
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Memory {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cpu {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub players: u64,
    pub playing_players: u64,
    /// Uptime in milliseconds.
    pub uptime: u64,
    #[serde(default)]
    pub memory: Memory,
    #[serde(default)]
    pub cpu: Cpu,
    #[serde(default)]
    pub frame_stats: Option<FrameStats>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    pub guild_id: String,
    pub state: PlayerState,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub guild_id: String,
    #[serde(flatten)]
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum EventData {
    #[serde(rename = "TrackStartEvent")]
    TrackStart { track: TrackData },
    #[serde(rename = "TrackEndEvent")]
    TrackEnd {
        #[serde(default)]
        track: Option<TrackData>,
        reason: TrackEndReason,
    },
    #[serde(rename = "TrackExceptionEvent")]
    TrackException {
        #[serde(default)]
        track: Option<TrackData>,
        exception: Exception,
    },
    #[serde(rename = "TrackStuckEvent", rename_all = "camelCase")]
    TrackStuck {
        #[serde(default)]
        track: Option<TrackData>,
        threshold_ms: u64,
    },
    #[serde(rename = "WebSocketClosedEvent", rename_all = "camelCase")]
    WebSocketClosed {
        code: u16,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        by_remote: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub cause: String,
}

impl std::fmt::Display for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.message.as_deref() {
            Some(message) => write!(f, "{message} ({})", self.severity),
            None => write!(f, "{} ({})", self.cause, self.severity),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "String")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
    Other(String),
}

impl TrackEndReason {
    /// Whether Lavalink expects the client to start the next track.
    pub const fn may_start_next(&self) -> bool {
        matches!(self, Self::Finished | Self::LoadFailed)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Finished => "finished",
            Self::LoadFailed => "loadFailed",
            Self::Stopped => "stopped",
            Self::Replaced => "replaced",
            Self::Cleanup => "cleanup",
            Self::Other(reason) => reason,
        }
    }
}

impl From<String> for TrackEndReason {
    fn from(value: String) -> Self {
        let normalised = value.replace('_', "").to_ascii_lowercase();
        match normalised.as_str() {
            "finished" => Self::Finished,
            "loadfailed" => Self::LoadFailed,
            "stopped" => Self::Stopped,
            "replaced" => Self::Replaced,
            "cleanup" => Self::Cleanup,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for TrackEndReason {
    fn from(value: &str) -> Self {
        Self::from(value.to_owned())
    }
}

impl std::fmt::Display for TrackEndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
