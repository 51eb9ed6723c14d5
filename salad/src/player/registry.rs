use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use twilight_model::id::{Id, marker::GuildMarker};

use super::Player;
use crate::sync::lock;

/// Players keyed by guild.
#[derive(Debug, Default)]
pub struct Registry(Mutex<HashMap<Id<GuildMarker>, Arc<Player>>>);

impl Registry {
    pub fn get(&self, guild_id: Id<GuildMarker>) -> Option<Arc<Player>> {
        lock(&self.0).get(&guild_id).cloned()
    }

    pub fn insert(&self, player: Arc<Player>) -> Option<Arc<Player>> {
        lock(&self.0).insert(player.guild_id(), player)
    }

    pub fn remove(&self, guild_id: Id<GuildMarker>) -> Option<Arc<Player>> {
        lock(&self.0).remove(&guild_id)
    }

    /// Removes the entry for `player`'s guild only if it is `player` itself.
    pub fn remove_if_same(&self, player: &Player) -> bool {
        let mut players = lock(&self.0);
        let same = players
            .get(&player.guild_id())
            .is_some_and(|p| std::ptr::eq(Arc::as_ptr(p), player));
        if same {
            players.remove(&player.guild_id());
        }
        same
    }

    /// The live player for `guild_id`, or the one `create` makes. Destroyed players are replaced.
    pub fn live_or_insert_with(
        &self,
        guild_id: Id<GuildMarker>,
        create: impl FnOnce() -> Arc<Player>,
    ) -> (Arc<Player>, bool) {
        let mut players = lock(&self.0);
        if let Some(player) = players.get(&guild_id).filter(|p| !p.is_destroyed()) {
            return (player.clone(), false);
        }
        let player = create();
        players.insert(guild_id, player.clone());
        (player, true)
    }

    pub fn values(&self) -> Vec<Arc<Player>> {
        lock(&self.0).values().cloned().collect()
    }

    /// Empties the registry, handing back what it held.
    pub fn drain(&self) -> Vec<Arc<Player>> {
        lock(&self.0).drain().map(|(_, p)| p).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.0).len()
    }
}
