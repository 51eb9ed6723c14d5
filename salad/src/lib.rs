//! A Lavalink v4 client for Discord music bots.
//!
//! [`Salad`] owns the node connections and a registry of [`Player`]s keyed by guild. Feed it the
//! bot's voice gateway events through [`Salad::process`] and drive playback through the players.

mod client;
mod config;
mod event;
mod konst;
mod node;
mod player;
mod queue;
mod rest;
mod state;
mod sync;
mod track;
mod traced;

pub mod error;
pub mod model;

pub use self::{
    client::{Salad, SearchSource},
    config::{NodeConfig, SaladOptions, SaladOptionsBuilder, SaladOptionsBuilderError},
    event::{Event, EventEmitter, EventKind, ListenerId},
    node::Node,
    player::{
        BoxError, ConnectionOptions, Player, PlayerLink, VoiceCleanup, VoiceStatus,
    },
    queue::{LoopMode, Queue},
    rest::Rest,
    state::{PlayerSnapshot, StateManager, VoiceReconnect},
    track::{Track, TrackData, TrackInfo},
};
