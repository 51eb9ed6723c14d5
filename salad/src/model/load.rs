use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use twilight_model::id::{Id, marker::UserMarker};

use super::Exception;
use crate::track::{Track, TrackData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadType {
    Track,
    Playlist,
    Search,
    Empty,
    Error,
}

impl LoadType {
    fn parse(raw: &str) -> Self {
        match raw {
            "track" | "TRACK_LOADED" => Self::Track,
            "playlist" | "PLAYLIST_LOADED" => Self::Playlist,
            "search" | "SEARCH_RESULT" => Self::Search,
            "error" | "LOAD_FAILED" => Self::Error,
            _ => Self::Empty,
        }
    }
}

/// `GET /v4/loadtracks` as it came off the wire.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResponse {
    #[serde(default)]
    pub load_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub plugin_info: Value,
    #[serde(default)]
    pub exception: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    pub name: String,
    /// Index of the track the playlist link pointed at, if any.
    pub selected_track: Option<usize>,
    pub thumbnail: Option<String>,
    /// The untouched playlist info object.
    pub raw: Map<String, Value>,
}

/// A normalised track lookup result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResult {
    pub load_type: LoadType,
    pub exception: Option<Exception>,
    pub playlist_info: Option<PlaylistInfo>,
    pub plugin_info: Value,
    pub tracks: Vec<Track>,
}

impl LoadResult {
    pub fn empty() -> Self {
        Self {
            load_type: LoadType::Empty,
            exception: None,
            playlist_info: None,
            plugin_info: Value::Object(Map::new()),
            tracks: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Builds the result for `response`, stamping every track with `requester`.
    ///
    /// Tracks without encoded data are dropped.
    pub fn from_response(response: LoadResponse, requester: Option<Id<UserMarker>>) -> Self {
        let load_type = LoadType::parse(&response.load_type);
        if load_type == LoadType::Empty {
            return Self::empty();
        }

        let mut result = Self {
            load_type,
            plugin_info: non_null_or_empty(response.plugin_info),
            ..Self::empty()
        };
        let make_tracks = |values: Vec<Value>| {
            values
                .into_iter()
                .filter_map(|v| serde_json::from_value::<TrackData>(v).ok())
                .map(|data| Track::new(data, requester))
                .filter(|track| track.resolve().is_some())
                .collect::<Vec<_>>()
        };

        match (load_type, response.data) {
            (LoadType::Error, data) => {
                let exception = if data.is_null() {
                    response.exception
                } else {
                    data
                };
                result.exception = serde_json::from_value(exception).ok();
            }
            (LoadType::Track, data @ Value::Object(_)) => {
                if let Some(plugin_info) = data.get("pluginInfo").filter(|v| !v.is_null()) {
                    result.plugin_info = plugin_info.clone();
                }
                result.tracks = make_tracks(vec![data]);
            }
            (LoadType::Playlist, Value::Object(mut data)) => {
                let tracks = match data.remove("tracks") {
                    Some(Value::Array(tracks)) => tracks,
                    _ => Vec::new(),
                };
                let plugin_info = data.remove("pluginInfo").unwrap_or_default();
                if let Some(Value::Object(info)) = data.remove("info") {
                    result.playlist_info = Some(playlist_info(info, &plugin_info, &tracks));
                }
                if !plugin_info.is_null() {
                    result.plugin_info = plugin_info;
                }
                result.tracks = make_tracks(tracks);
            }
            (LoadType::Search, Value::Array(data)) => result.tracks = make_tracks(data),
            _ => {}
        }
        result
    }
}

fn non_null_or_empty(value: Value) -> Value {
    if value.is_null() {
        Value::Object(Map::new())
    } else {
        value
    }
}

fn playlist_info(info: Map<String, Value>, plugin_info: &Value, tracks: &[Value]) -> PlaylistInfo {
    let thumbnail = plugin_info
        .get("artworkUrl")
        .and_then(Value::as_str)
        .or_else(|| {
            tracks
                .first()
                .and_then(|t| t.pointer("/info/artworkUrl"))
                .and_then(Value::as_str)
        })
        .map(str::to_owned);
    let name = info
        .get("name")
        .or_else(|| info.get("title"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let selected_track = info
        .get("selectedTrack")
        .and_then(Value::as_i64)
        .and_then(|i| usize::try_from(i).ok());

    PlaylistInfo {
        name,
        selected_track,
        thumbnail,
        raw: info,
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use serde_json::json;
    use twilight_model::id::Id;

    use super::{LoadResponse, LoadResult, LoadType};

    fn response(value: serde_json::Value) -> LoadResponse {
        serde_json::from_value(value).expect("valid response")
    }

    fn track(encoded: &str, artwork: Option<&str>) -> serde_json::Value {
        json!({
            "encoded": encoded,
            "info": {"title": encoded, "author": "a", "length": 1000, "artworkUrl": artwork},
            "pluginInfo": {}
        })
    }

    #[rstest]
    #[case(json!({"loadType": "empty", "data": {}}))]
    #[case(json!({"loadType": "NO_MATCHES"}))]
    #[case(json!({}))]
    fn empty(#[case] raw: serde_json::Value) {
        let result = LoadResult::from_response(response(raw), None);
        assert_eq!(result, LoadResult::empty());
    }

    #[rstest]
    fn single_track_carries_requester() {
        let raw = json!({"loadType": "track", "data": track("QAAA", None)});
        let result = LoadResult::from_response(response(raw), Some(Id::new(9)));
        assert_eq!(result.load_type, LoadType::Track);
        assert_eq!(result.tracks.len(), 1);
        assert_eq!(result.tracks[0].requester(), Some(Id::new(9)));
    }

    #[rstest]
    fn search_drops_unplayable() {
        let raw = json!({
            "loadType": "search",
            "data": [track("QAAA", None), {"info": {"title": "no data"}}, track("QBBB", None)]
        });
        let result = LoadResult::from_response(response(raw), None);
        let encoded: Vec<_> = result.tracks.iter().map(|t| t.encoded()).collect();
        assert_eq!(encoded, ["QAAA", "QBBB"]);
    }

    #[rstest]
    fn playlist_thumbnail_from_plugin() {
        let raw = json!({
            "loadType": "playlist",
            "data": {
                "info": {"name": "mix", "selectedTrack": -1},
                "pluginInfo": {"artworkUrl": "https://img/p.png"},
                "tracks": [track("QAAA", Some("https://img/a.png"))]
            }
        });
        let result = LoadResult::from_response(response(raw), None);
        let info = result.playlist_info.expect("playlist info");
        assert_eq!(info.name, "mix");
        assert_eq!(info.selected_track, None);
        assert_eq!(info.thumbnail.as_deref(), Some("https://img/p.png"));
    }

    #[rstest]
    fn playlist_thumbnail_from_first_track() {
        let raw = json!({
            "loadType": "playlist",
            "data": {
                "info": {"name": "mix", "selectedTrack": 1},
                "pluginInfo": {},
                "tracks": [track("QAAA", Some("https://img/a.png")), track("QBBB", None)]
            }
        });
        let result = LoadResult::from_response(response(raw), None);
        assert_eq!(result.tracks.len(), 2);
        let info = result.playlist_info.expect("playlist info");
        assert_eq!(info.selected_track, Some(1));
        assert_eq!(info.thumbnail.as_deref(), Some("https://img/a.png"));
    }

    #[rstest]
    #[case(json!({
        "loadType": "error",
        "data": {"message": "This video is unavailable", "severity": "common", "cause": "x"}
    }))]
    #[case(json!({
        "loadType": "LOAD_FAILED",
        "exception": {"message": "This video is unavailable", "severity": "common", "cause": "x"}
    }))]
    fn error_carries_exception(#[case] raw: serde_json::Value) {
        let result = LoadResult::from_response(response(raw), None);
        assert_eq!(result.load_type, LoadType::Error);
        assert!(result.tracks.is_empty());
        let exception = result.exception.expect("exception");
        assert_eq!(exception.message.as_deref(), Some("This video is unavailable"));
    }
}
