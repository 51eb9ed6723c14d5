//! Lavalink v4 wire types.

mod info;
mod load;
mod player;
mod ws;

pub use self::{
    info::{NodeInfo, Plugin, Version},
    load::{LoadResponse, LoadResult, LoadType, PlaylistInfo},
    player::{PlayerInfo, PlayerState, UpdatePlayer, VoiceState},
    ws::{
        Cpu, Event, EventData, Exception, FrameStats, Incoming, Memory, PlayerUpdate, Ready,
        Stats, TrackEndReason,
    },
};
