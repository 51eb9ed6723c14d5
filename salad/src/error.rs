use std::sync::Arc;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::{model::Exception, player::BoxError};

#[derive(Error, Debug)]
#[error("salad has not been started")]
pub struct NotStarted;

#[derive(Error, Debug)]
#[error("no connected node is available")]
pub struct NoNodeAvailable;

#[derive(Error, Debug)]
#[error("node has no session yet")]
pub struct NoSession;

#[derive(Error, Debug)]
#[error("node has no user id to identify with")]
pub struct MissingUserId;

#[derive(Error, Debug)]
#[error("node did not send a ready op in time")]
pub struct ReadyTimeout;

#[derive(Error, Debug)]
#[error("node closed the websocket before it was ready")]
pub struct ClosedBeforeReady;

#[derive(Error, Debug)]
#[error("node is already connecting")]
pub struct AlreadyConnecting;

#[derive(Error, Debug)]
#[error("loop mode must be none, track or queue, got {:?}", .0)]
pub struct InvalidLoopMode(pub String);

#[derive(Error, Debug)]
pub enum RestError {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    NoSession(#[from] NoSession),
    #[error("lavalink responded {status} to {method} {path}")]
    Status {
        method: reqwest::Method,
        path: String,
        status: reqwest::StatusCode,
    },
}

#[derive(Error, Debug)]
#[error("connecting to node failed: {}", .0)]
pub enum ConnectError {
    WebSocket(#[from] tungstenite::Error),
    InvalidHeader(#[from] tungstenite::http::header::InvalidHeaderValue),
    MissingUserId(#[from] MissingUserId),
    ReadyTimeout(#[from] ReadyTimeout),
    ClosedBeforeReady(#[from] ClosedBeforeReady),
    AlreadyConnecting(#[from] AlreadyConnecting),
}

#[derive(Error, Debug)]
#[error("starting salad failed: {}", .0)]
pub enum StartError {
    Rest(#[from] RestError),
    NoNodeAvailable(#[from] NoNodeAvailable),
}

#[derive(Error, Debug)]
#[error("creating a connection failed: {}", .0)]
pub enum ConnectionError {
    NotStarted(#[from] NotStarted),
    NoNodeAvailable(#[from] NoNodeAvailable),
}

#[derive(Error, Debug)]
#[error("resolving tracks failed: {}", .0)]
pub enum ResolveError {
    NotStarted(#[from] NotStarted),
    NoNodeAvailable(#[from] NoNodeAvailable),
    Rest(#[from] RestError),
}

#[derive(Error, Debug)]
#[error("persisting player states failed: {}", .0)]
pub enum StateError {
    Io(#[from] std::io::Error),
    Json(#[from] serde_json::Error),
}

/// Why a player could not bring its voice connection up.
#[derive(Error, Debug, Clone)]
pub enum VoiceError {
    #[error("voice state not ready for playback")]
    NotReady,
    #[error("not connected to lavalink")]
    NotConnected,
    #[error("sending the voice update failed: {}", .0)]
    Dispatch(Arc<RestError>),
    #[error("voice cleanup failed: {}", .0)]
    Cleanup(Arc<BoxError>),
}

/// Why a track failed to play.
#[derive(Error, Debug, Clone)]
pub enum TrackFailure {
    #[error("track has no encoded data")]
    Unplayable,
    #[error("sending the track failed: {}", .0)]
    Play(Arc<RestError>),
    #[error("track threw an exception: {}", .0)]
    Exception(Exception),
    #[error("track got stuck for {threshold_ms}ms")]
    Stuck { threshold_ms: u64 },
}
