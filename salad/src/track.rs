use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use twilight_model::id::{Id, marker::UserMarker};

const fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    #[serde(default)]
    pub identifier: String,
    #[serde(default = "default_true")]
    pub is_seekable: bool,
    #[serde(default)]
    pub author: String,
    /// Length in milliseconds.
    #[serde(default)]
    pub length: u64,
    #[serde(default)]
    pub is_stream: bool,
    #[serde(default)]
    pub position: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub isrc: Option<String>,
    #[serde(default)]
    pub source_name: String,
}

impl Default for TrackInfo {
    fn default() -> Self {
        Self {
            identifier: String::new(),
            is_seekable: true,
            author: String::new(),
            length: 0,
            is_stream: false,
            position: 0,
            title: String::new(),
            uri: None,
            artwork_url: None,
            isrc: None,
            source_name: String::new(),
        }
    }
}

/// A track as Lavalink describes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackData {
    #[serde(default, alias = "track")]
    pub encoded: String,
    #[serde(default)]
    pub info: TrackInfo,
    #[serde(default)]
    pub plugin_info: Value,
    #[serde(default)]
    pub user_data: Value,
}

/// A resolved track waiting in, or playing from, a player's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    #[serde(flatten)]
    data: TrackData,
    requester: Option<Id<UserMarker>>,
}

impl Track {
    pub const fn new(data: TrackData, requester: Option<Id<UserMarker>>) -> Self {
        Self { data, requester }
    }

    /// The encoded track Lavalink plays, if there is one.
    pub fn resolve(&self) -> Option<&str> {
        Some(self.data.encoded.as_str()).filter(|e| !e.is_empty())
    }

    pub fn encoded(&self) -> &str {
        &self.data.encoded
    }

    pub const fn data(&self) -> &TrackData {
        &self.data
    }

    pub const fn info(&self) -> &TrackInfo {
        &self.data.info
    }

    pub fn title(&self) -> &str {
        &self.data.info.title
    }

    pub fn author(&self) -> &str {
        &self.data.info.author
    }

    pub const fn length(&self) -> Duration {
        Duration::from_millis(self.data.info.length)
    }

    pub const fn requester(&self) -> Option<Id<UserMarker>> {
        self.requester
    }

    pub const fn plugin_info(&self) -> &Value {
        &self.data.plugin_info
    }

    pub fn into_data(self) -> TrackData {
        self.data
    }
}

impl std::fmt::Display for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} by {}", self.title(), self.author())
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use twilight_model::id::Id;

    use super::{Track, TrackData};

    #[rstest]
    fn lavalink_track() {
        let data: TrackData = serde_json::from_str(
            r#"{
                "encoded": "QAAA",
                "info": {
                    "identifier": "dQw4w9WgXcQ",
                    "isSeekable": true,
                    "author": "Rick Astley",
                    "length": 212000,
                    "isStream": false,
                    "position": 0,
                    "title": "Never Gonna Give You Up",
                    "uri": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
                    "artworkUrl": null,
                    "isrc": null,
                    "sourceName": "youtube"
                },
                "pluginInfo": {},
                "userData": {}
            }"#,
        )
        .expect("valid track");

        let track = Track::new(data, Some(Id::new(7)));
        assert_eq!(track.resolve(), Some("QAAA"));
        assert_eq!(track.length().as_secs(), 212);
        assert_eq!(track.info().source_name, "youtube");
        assert_eq!(track.to_string(), "Never Gonna Give You Up by Rick Astley");
    }

    #[rstest]
    fn legacy_track_key() {
        let data: TrackData =
            serde_json::from_str(r#"{"track":"QBBB","info":{"title":"t"}}"#).expect("valid track");
        assert_eq!(data.encoded, "QBBB");
        assert!(data.info.is_seekable);
    }

    #[rstest]
    fn missing_encoded_is_unplayable() {
        let data: TrackData = serde_json::from_str(r#"{"info":{}}"#).expect("valid track");
        assert_eq!(Track::new(data, None).resolve(), None);
    }

    #[rstest]
    fn keeps_requester_through_serde() {
        let track = Track::new(
            TrackData {
                encoded: String::from("QCCC"),
                ..TrackData::default()
            },
            Some(Id::new(42)),
        );
        let json = serde_json::to_string(&track).expect("serialisable");
        let back: Track = serde_json::from_str(&json).expect("deserialisable");
        assert_eq!(back.requester(), Some(Id::new(42)));
        assert_eq!(back, track);
    }
}
