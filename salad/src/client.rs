use std::sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicBool, Ordering},
};

use futures::future::{BoxFuture, join_all};
use tokio::sync::broadcast;
use twilight_model::id::{
    Id,
    marker::{ChannelMarker, GuildMarker, UserMarker},
};

use crate::{
    config::{NodeConfig, SaladOptions},
    error::{
        ConnectionError, NoNodeAvailable, NotStarted, ResolveError, RestError, StartError,
        StateError,
    },
    event::{Event, EventEmitter},
    model::LoadResult,
    node::Node,
    player::{ConnectionOptions, Player, PlayerLink, Registry},
    state::{StateManager, VoiceReconnect},
    sync::lock,
};

/// Where a plain-text query is searched.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchSource {
    #[default]
    YouTube,
    YouTubeMusic,
    SoundCloud,
    /// Send the query to Lavalink untouched.
    Raw,
}

impl SearchSource {
    pub const fn prefix(self) -> Option<&'static str> {
        match self {
            Self::YouTube => Some("ytsearch"),
            Self::YouTubeMusic => Some("ytmsearch"),
            Self::SoundCloud => Some("scsearch"),
            Self::Raw => None,
        }
    }
}

fn format_query(query: &str, source: SearchSource) -> String {
    let query = query.trim();
    if query.starts_with("http://") || query.starts_with("https://") {
        return query.to_owned();
    }
    source
        .prefix()
        .map_or_else(|| query.to_owned(), |prefix| format!("{prefix}:{query}"))
}

struct Inner {
    options: Arc<SaladOptions>,
    events: Arc<EventEmitter>,
    nodes: Mutex<Vec<Arc<Node>>>,
    players: Arc<Registry>,
    user_id: Mutex<Option<Id<UserMarker>>>,
    started: AtomicBool,
    state: Option<StateManager>,
    voice_reconnect: Mutex<Option<VoiceReconnect>>,
}

/// The entry point: owns the nodes, the player registry and the event emitter.
///
/// Cloning is cheap and every clone drives the same client.
#[derive(Clone)]
pub struct Salad {
    inner: Arc<Inner>,
}

/// A handle that does not keep the client alive.
#[derive(Clone)]
pub(crate) struct WeakSalad(Weak<Inner>);

impl WeakSalad {
    pub fn upgrade(&self) -> Option<Salad> {
        self.0.upgrade().map(|inner| Salad { inner })
    }
}

impl std::fmt::Debug for Salad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Salad")
            .field("started", &self.is_started())
            .field("nodes", &lock(&self.inner.nodes).len())
            .field("players", &self.inner.players.len())
            .finish_non_exhaustive()
    }
}

impl Default for Salad {
    fn default() -> Self {
        Self::new(SaladOptions::default())
    }
}

impl Salad {
    pub fn new(options: SaladOptions) -> Self {
        let state = options
            .enable_state_persistence
            .then(|| StateManager::new(options.state_file.clone(), options.state_save_interval));
        let events = Arc::new(EventEmitter::new(options.max_listeners));

        Self {
            inner: Arc::new(Inner {
                options: Arc::new(options),
                events,
                nodes: Mutex::new(Vec::new()),
                players: Arc::new(Registry::default()),
                user_id: Mutex::new(None),
                started: AtomicBool::new(false),
                state,
                voice_reconnect: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakSalad {
        WeakSalad(Arc::downgrade(&self.inner))
    }

    pub fn options(&self) -> &Arc<SaladOptions> {
        &self.inner.options
    }

    pub fn events(&self) -> &Arc<EventEmitter> {
        &self.inner.events
    }

    /// A receiver for every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    pub fn user_id(&self) -> Option<Id<UserMarker>> {
        *lock(&self.inner.user_id)
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        lock(&self.inner.nodes).clone()
    }

    /// `None` when persistence is disabled.
    pub fn state_manager(&self) -> Option<&StateManager> {
        self.inner.state.as_ref()
    }

    /// Connects to every node and becomes ready once at least one has a session.
    ///
    /// Calling this again after a successful start does nothing.
    #[tracing::instrument(skip_all, name = "start", fields(%user_id))]
    pub async fn start(
        &self,
        nodes: impl IntoIterator<Item = NodeConfig> + Send,
        user_id: Id<UserMarker>,
    ) -> Result<(), StartError> {
        if self.is_started() {
            return Ok(());
        }
        *lock(&self.inner.user_id) = Some(user_id);

        let nodes = nodes
            .into_iter()
            .map(|config| {
                let node =
                    Node::new(config, self.inner.options.clone(), self.inner.events.clone())?;
                node.set_user_id(user_id);
                Ok(node)
            })
            .collect::<Result<Vec<_>, RestError>>()?;

        join_all(nodes.iter().map(|node| node.connect())).await;

        let stale = std::mem::replace(&mut *lock(&self.inner.nodes), nodes);
        stale.iter().for_each(|node| node.cleanup());

        if self.request_node().is_none() {
            tracing::warn!("no node came up");
            return Err(NoNodeAvailable.into());
        }

        self.inner.started.store(true, Ordering::Release);
        if let Some(state) = &self.inner.state {
            state.start(self.downgrade());
        }
        tracing::info!("ready");
        self.inner.events.emit(Event::Ready);
        Ok(())
    }

    /// The first node that has a Lavalink session.
    pub fn request_node(&self) -> Option<Arc<Node>> {
        lock(&self.inner.nodes)
            .iter()
            .find(|node| node.is_connected() && node.session_id().is_some())
            .cloned()
    }

    /// Returns the guild's live player, or creates one on `node` and starts connecting it.
    pub fn create_player(&self, node: &Arc<Node>, options: ConnectionOptions) -> Arc<Player> {
        let (player, created) = self.inner.players.live_or_insert_with(options.guild_id, || {
            Player::new(
                &options,
                node.clone(),
                self.inner.events.clone(),
                Arc::downgrade(&self.inner.players),
            )
        });
        if !created {
            return player;
        }

        tracing::debug!(guild_id = ?options.guild_id, node = %node.name(), "player created");
        node.attach(player.clone());
        player.connect(options.voice_channel);
        self.inner.events.emit(Event::PlayerCreate {
            player: player.clone(),
        });
        player
    }

    pub fn create_connection(
        &self,
        options: ConnectionOptions,
    ) -> Result<Arc<Player>, ConnectionError> {
        if !self.is_started() {
            return Err(NotStarted.into());
        }
        if let Some(player) = self.get_player(options.guild_id) {
            return Ok(player);
        }
        let node = self.request_node().ok_or(NoNodeAvailable)?;
        Ok(self.create_player(&node, options))
    }

    /// The guild's player, unless it has been destroyed.
    pub fn get_player(&self, guild_id: Id<GuildMarker>) -> Option<Arc<Player>> {
        self.inner
            .players
            .get(guild_id)
            .filter(|player| !player.is_destroyed())
    }

    pub fn players(&self) -> Vec<Arc<Player>> {
        self.inner.players.values()
    }

    /// Destroys the guild's player and forgets it.
    pub async fn destroy_player(&self, guild_id: Id<GuildMarker>) {
        if let Some(player) = self.inner.players.remove(guild_id) {
            player.destroy(true).await;
        }
    }

    /// Saves player states, destroys every player and closes every node.
    #[tracing::instrument(skip_all, name = "stop")]
    pub async fn stop(&self) {
        if let Some(state) = &self.inner.state
            && self.is_started()
        {
            match state.stop(&self.players()).await {
                Ok(saved) => tracing::debug!(saved, "saved player states"),
                Err(error) => tracing::warn!(%error, "failed to save player states"),
            }
        }

        let players = self.inner.players.drain();
        join_all(
            players
                .iter()
                .filter(|player| !player.is_destroyed())
                .map(|player| player.destroy(true)),
        )
        .await;

        let nodes = std::mem::take(&mut *lock(&self.inner.nodes));
        nodes.iter().for_each(|node| node.cleanup());

        self.inner.started.store(false, Ordering::Release);
        tracing::info!("shut down");
        self.inner.events.emit(Event::Shutdown);
    }

    /// Loads tracks for a search query or URL.
    pub async fn resolve(
        &self,
        query: &str,
        source: SearchSource,
        requester: Option<Id<UserMarker>>,
    ) -> Result<LoadResult, ResolveError> {
        if !self.is_started() {
            return Err(NotStarted.into());
        }
        let node = self.request_node().ok_or(NoNodeAvailable)?;

        let identifier = format_query(query, source);
        let response = node.rest().load_tracks(&identifier).await?;
        Ok(LoadResult::from_response(response, requester))
    }

    /// Feeds a gateway event to the player it concerns. Everything but voice updates is ignored.
    pub fn process(&self, event: &twilight_gateway::Event) {
        match event {
            twilight_gateway::Event::VoiceStateUpdate(update) => {
                if self.user_id() != Some(update.user_id) {
                    return;
                }
                let Some(player) = update.guild_id.and_then(|g| self.get_player(g)) else {
                    return;
                };
                player.handle_voice_state_update(update.channel_id, &update.session_id);
            }
            twilight_gateway::Event::VoiceServerUpdate(update) => {
                if let Some(player) = self.get_player(update.guild_id) {
                    player.handle_voice_server_update(&update.token, update.endpoint.as_deref());
                }
            }
            _ => {}
        }
    }

    /// Registers how to rejoin a voice channel when restoring saved players.
    ///
    /// The callback receives the guild, the channel, then whether to deafen and mute, and
    /// returns whether the join was requested.
    pub fn set_voice_reconnect(
        &self,
        reconnect: impl Fn(Id<GuildMarker>, Id<ChannelMarker>, bool, bool) -> BoxFuture<'static, bool>
        + Send
        + Sync
        + 'static,
    ) {
        *lock(&self.inner.voice_reconnect) = Some(Arc::new(reconnect));
    }

    pub(crate) fn voice_reconnect(&self) -> Option<VoiceReconnect> {
        lock(&self.inner.voice_reconnect).clone()
    }

    pub async fn save_player_states(&self) -> Result<usize, StateError> {
        match &self.inner.state {
            Some(state) if self.is_started() => state.save_all_states(&self.players()).await,
            _ => Ok(0),
        }
    }

    pub async fn restore_players(&self) -> Result<usize, StateError> {
        match &self.inner.state {
            Some(state) if self.is_started() => state.restore_all_players(self).await,
            _ => Ok(0),
        }
    }

    pub async fn clear_saved_states(&self) -> Result<(), StateError> {
        match &self.inner.state {
            Some(state) if self.is_started() => state.clear_states().await,
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::{Arc, atomic::Ordering};

    use rstest::rstest;
    use tokio::sync::broadcast;
    use twilight_model::{
        gateway::payload::incoming::{VoiceServerUpdate, VoiceStateUpdate},
        id::Id,
    };

    use super::{Salad, SearchSource, format_query};
    use crate::{
        config::{NodeConfig, SaladOptions},
        error::{ConnectionError, ResolveError, StartError},
        event::{Event, EventKind},
        node::Node,
        player::ConnectionOptions,
        sync::lock,
    };

    const BOT: u64 = 99;

    fn options() -> SaladOptions {
        SaladOptions::builder()
            .enable_state_persistence(false)
            .build()
            .expect("all fields have defaults")
    }

    /// A started client whose only node already holds a session.
    pub(crate) fn started(options: SaladOptions) -> (Salad, Arc<Node>) {
        let salad = Salad::new(options);
        let node = Node::new(
            NodeConfig::default(),
            salad.options().clone(),
            salad.events().clone(),
        )
        .expect("valid config");
        node.handle_message(r#"{"op":"ready","resumed":false,"sessionId":"abc"}"#);

        *lock(&salad.inner.nodes) = vec![node.clone()];
        *lock(&salad.inner.user_id) = Some(Id::new(BOT));
        salad.inner.started.store(true, Ordering::Release);
        (salad, node)
    }

    fn kinds(rx: &mut broadcast::Receiver<Event>) -> Vec<EventKind> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.kind())
            .collect()
    }

    fn voice_state(user_id: u64, channel_id: Option<u64>) -> twilight_gateway::Event {
        let update: VoiceStateUpdate = serde_json::from_value(serde_json::json!({
            "channel_id": channel_id.map(|c| c.to_string()),
            "deaf": false,
            "guild_id": "1",
            "mute": false,
            "self_deaf": true,
            "self_mute": false,
            "self_stream": false,
            "self_video": false,
            "session_id": "discord-session",
            "suppress": false,
            "user_id": user_id.to_string(),
            "request_to_speak_timestamp": null
        }))
        .expect("valid voice state");
        twilight_gateway::Event::VoiceStateUpdate(Box::new(update))
    }

    fn voice_server() -> twilight_gateway::Event {
        let update: VoiceServerUpdate = serde_json::from_value(serde_json::json!({
            "endpoint": "us-east1.discord.media:443",
            "guild_id": "1",
            "token": "voice-token"
        }))
        .expect("valid voice server");
        twilight_gateway::Event::VoiceServerUpdate(update)
    }

    #[rstest]
    #[case("never gonna", SearchSource::YouTube, "ytsearch:never gonna")]
    #[case("never gonna", SearchSource::YouTubeMusic, "ytmsearch:never gonna")]
    #[case("  lofi ", SearchSource::SoundCloud, "scsearch:lofi")]
    #[case("QAAA", SearchSource::Raw, "QAAA")]
    #[case("https://youtu.be/dQw4w9WgXcQ", SearchSource::YouTube, "https://youtu.be/dQw4w9WgXcQ")]
    fn queries(#[case] query: &str, #[case] source: SearchSource, #[case] expected: &str) {
        assert_eq!(format_query(query, source), expected);
    }

    #[tokio::test]
    async fn nothing_works_before_start() {
        let salad = Salad::new(options());
        assert!(matches!(
            salad.create_connection(ConnectionOptions::new(Id::new(1))),
            Err(ConnectionError::NotStarted(_))
        ));
        assert!(matches!(
            salad.resolve("anything", SearchSource::default(), None).await,
            Err(ResolveError::NotStarted(_))
        ));
        assert_eq!(salad.save_player_states().await.ok(), Some(0));
        assert_eq!(salad.restore_players().await.ok(), Some(0));
    }

    #[tokio::test]
    async fn started_without_a_session() {
        let (salad, node) = started(options());
        node.cleanup();
        assert!(matches!(
            salad.create_connection(ConnectionOptions::new(Id::new(1))),
            Err(ConnectionError::NoNodeAvailable(_))
        ));
        assert!(matches!(
            salad.resolve("anything", SearchSource::default(), None).await,
            Err(ResolveError::NoNodeAvailable(_))
        ));
    }

    #[tokio::test]
    async fn creates_one_player_per_guild() {
        let (salad, node) = started(options());
        let mut rx = salad.subscribe();

        let options = ConnectionOptions::new(Id::new(1)).voice_channel(Id::new(2));
        let player = salad.create_connection(options).expect("node is ready");
        assert_eq!(
            kinds(&mut rx),
            [EventKind::PlayerConnect, EventKind::PlayerCreate]
        );
        assert_eq!(player.voice_channel(), Some(Id::new(2)));
        assert!(node.player(Id::new(1)).is_some());

        let again = salad.create_connection(options).expect("node is ready");
        assert!(Arc::ptr_eq(&player, &again));
        assert!(kinds(&mut rx).is_empty());
        assert_eq!(salad.players().len(), 1);
    }

    #[tokio::test]
    async fn destroyed_players_are_replaced() {
        let (salad, _node) = started(options());
        let options = ConnectionOptions::new(Id::new(1)).voice_channel(Id::new(2));
        let first = salad.create_connection(options).expect("node is ready");

        first.destroy(false).await;
        assert!(salad.get_player(Id::new(1)).is_none());

        let second = salad.create_connection(options).expect("node is ready");
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_destroyed());
    }

    #[tokio::test]
    async fn destroy_player_forgets_it() {
        let (salad, node) = started(options());
        let player = salad
            .create_connection(ConnectionOptions::new(Id::new(1)).voice_channel(Id::new(2)))
            .expect("node is ready");

        salad.destroy_player(Id::new(1)).await;
        assert!(player.is_destroyed());
        assert!(salad.get_player(Id::new(1)).is_none());
        assert!(node.player(Id::new(1)).is_none());
    }

    #[tokio::test]
    async fn routes_our_voice_updates() {
        let (salad, _node) = started(options());
        let player = salad
            .create_connection(ConnectionOptions::new(Id::new(1)).voice_channel(Id::new(2)))
            .expect("node is ready");

        salad.process(&voice_state(BOT + 1, Some(3)));
        assert!(player.voice_state().session_id.is_none());

        salad.process(&voice_state(BOT, Some(3)));
        salad.process(&voice_server());
        let status = player.voice_state();
        assert_eq!(status.session_id.as_deref(), Some("discord-session"));
        assert_eq!(status.channel_id, Some(Id::new(3)));
        assert!(status.has_token && status.has_endpoint);
        assert!(player.is_voice_ready());
    }

    #[tokio::test]
    async fn stop_tears_everything_down() {
        let (salad, node) = started(options());
        let player = salad
            .create_connection(ConnectionOptions::new(Id::new(1)).voice_channel(Id::new(2)))
            .expect("node is ready");
        let mut rx = salad.subscribe();

        salad.stop().await;
        assert!(player.is_destroyed());
        assert!(!salad.is_started());
        assert!(salad.players().is_empty());
        assert!(salad.nodes().is_empty());
        assert!(!node.is_connected());

        let kinds = kinds(&mut rx);
        assert!(kinds.contains(&EventKind::PlayerDestroy));
        assert_eq!(kinds.last(), Some(&EventKind::Shutdown));
    }

    #[tokio::test]
    async fn start_without_nodes_fails() {
        let salad = Salad::new(options());
        let mut rx = salad.subscribe();

        let result = salad.start(Vec::new(), Id::new(BOT)).await;
        assert!(matches!(result, Err(StartError::NoNodeAvailable(_))));
        assert!(!salad.is_started());
        assert_eq!(salad.user_id(), Some(Id::new(BOT)));
        assert!(kinds(&mut rx).is_empty());
    }
}
