use std::sync::Arc;

use futures::future::BoxFuture;
use twilight_model::id::{Id, marker::GuildMarker};

use super::Player;
use crate::{
    error::RestError,
    model::{PlayerInfo, UpdatePlayer},
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Disconnects the bot from a guild's voice channel on the Discord side.
pub type VoiceCleanup =
    Arc<dyn Fn(Id<GuildMarker>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// What a [`Player`] needs from the node it plays on.
pub trait PlayerLink: Send + Sync {
    /// The node's current Lavalink session, `None` while it is not ready.
    fn session_id(&self) -> Option<String>;

    fn update_player<'a>(
        &'a self,
        guild_id: Id<GuildMarker>,
        update: &'a UpdatePlayer,
        no_replace: bool,
    ) -> BoxFuture<'a, Result<Option<PlayerInfo>, RestError>>;

    fn get_player(&self, guild_id: Id<GuildMarker>) -> BoxFuture<'_, Result<PlayerInfo, RestError>>;

    fn destroy_player(&self, guild_id: Id<GuildMarker>) -> BoxFuture<'_, Result<(), RestError>>;

    /// Routes Lavalink events for `player`'s guild to it.
    fn attach(&self, player: Arc<Player>);

    /// Stops routing Lavalink events to `player`. Another player registered for the same guild is
    /// left alone.
    fn detach(&self, player: &Player);
}
