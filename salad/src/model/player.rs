use serde::{Deserialize, Serialize};

use crate::track::TrackData;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct PlayerState {
    /// Unix timestamp in milliseconds at which this state was taken.
    #[serde(default)]
    pub time: u64,
    #[serde(default)]
    pub position: u64,
    #[serde(default)]
    pub connected: bool,
    /// Round trip to the Discord voice server in milliseconds, `-1` when not connected.
    #[serde(default)]
    pub ping: i64,
}

/// The Discord voice credentials Lavalink needs to join a call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceState {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub session_id: String,
}

/// `PATCH /v4/sessions/{session}/players/{guild}` body. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayer {
    /// `Some(None)` stops the current track.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded_track: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceState>,
}

impl UpdatePlayer {
    pub fn play(encoded: impl Into<String>, volume: u16) -> Self {
        Self {
            encoded_track: Some(Some(encoded.into())),
            position: Some(0),
            volume: Some(volume),
            paused: Some(false),
            voice: None,
        }
    }

    pub fn stop() -> Self {
        Self {
            encoded_track: Some(None),
            ..Self::default()
        }
    }

    pub fn pause(paused: bool) -> Self {
        Self {
            paused: Some(paused),
            ..Self::default()
        }
    }

    pub fn volume(volume: u16) -> Self {
        Self {
            volume: Some(volume),
            ..Self::default()
        }
    }

    pub fn seek(position: u64) -> Self {
        Self {
            position: Some(position),
            ..Self::default()
        }
    }

    pub fn voice(voice: VoiceState, volume: u16) -> Self {
        Self {
            voice: Some(voice),
            volume: Some(volume),
            ..Self::default()
        }
    }
}

/// A player as Lavalink reports it over REST.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    #[serde(default)]
    pub guild_id: String,
    #[serde(default)]
    pub track: Option<TrackData>,
    #[serde(default)]
    pub volume: u16,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub state: PlayerState,
    #[serde(default)]
    pub voice: VoiceState,
}
