use std::sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use futures::{FutureExt, StreamExt, future::BoxFuture};
use tokio::{
    net::TcpStream,
    sync::{oneshot, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};
use twilight_model::id::{
    Id,
    marker::{GuildMarker, UserMarker},
};

use crate::{
    config::{NodeConfig, SaladOptions},
    error::{
        AlreadyConnecting, ClosedBeforeReady, ConnectError, MissingUserId, NoSession, ReadyTimeout,
        RestError,
    },
    event::{Event, EventEmitter},
    konst,
    model::{self, EventData, Incoming, NodeInfo, PlayerInfo, Stats, UpdatePlayer},
    player::{Player, PlayerLink, Registry},
    rest::Rest,
    sync::lock,
    traced,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One Lavalink node: its websocket session, its REST API and the players routed to it.
pub struct Node {
    config: NodeConfig,
    name: Arc<str>,
    options: Arc<SaladOptions>,
    rest: Rest,
    events: Arc<EventEmitter>,
    players: Registry,
    session: watch::Sender<Option<String>>,
    connected: AtomicBool,
    connecting: AtomicBool,
    closing: AtomicBool,
    reconnect_attempts: AtomicU32,
    info: Mutex<Option<NodeInfo>>,
    stats: Mutex<Option<Stats>>,
    user_id: Mutex<Option<Id<UserMarker>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    weak: Weak<Self>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .field("players", &self.players.len())
            .finish_non_exhaustive()
    }
}

impl Node {
    pub fn new(
        config: NodeConfig,
        options: Arc<SaladOptions>,
        events: Arc<EventEmitter>,
    ) -> Result<Arc<Self>, RestError> {
        let rest = Rest::new(&config, &options.client_name)?;
        let name = Arc::from(config.name());

        Ok(Arc::new_cyclic(|weak| Self {
            config,
            name,
            options,
            rest,
            events,
            players: Registry::default(),
            session: watch::channel(None).0,
            connected: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            info: Mutex::new(None),
            stats: Mutex::new(None),
            user_id: Mutex::new(None),
            listener: Mutex::new(None),
            shutdown: Mutex::new(None),
            weak: weak.clone(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub const fn rest(&self) -> &Rest {
        &self.rest
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn info(&self) -> Option<NodeInfo> {
        lock(&self.info).clone()
    }

    pub fn stats(&self) -> Option<Stats> {
        lock(&self.stats).clone()
    }

    pub fn player(&self, guild_id: Id<GuildMarker>) -> Option<Arc<Player>> {
        self.players.get(guild_id)
    }

    pub fn players(&self) -> Vec<Arc<Player>> {
        self.players.values()
    }

    pub fn set_user_id(&self, user_id: Id<UserMarker>) {
        *lock(&self.user_id) = Some(user_id);
        self.rest.set_user_id(user_id);
    }

    /// Opens the websocket and waits for Lavalink to hand out a session.
    ///
    /// Only one connect runs at a time; a second caller gets [`ConnectError::AlreadyConnecting`].
    #[tracing::instrument(skip_all, name = "node", fields(node = %self.name))]
    pub async fn connect(&self) -> Result<(), Arc<ConnectError>> {
        if self.connecting.swap(true, Ordering::SeqCst) {
            return Err(Arc::new(AlreadyConnecting.into()));
        }
        let mut result = self.open().await;
        self.connecting.store(false, Ordering::SeqCst);
        // the socket may have dropped while `connecting` kept the listener from rescheduling
        if result.is_ok() && !self.connected.load(Ordering::SeqCst) {
            result = Err(ClosedBeforeReady.into());
        }

        match result {
            Ok(()) => {
                self.reconnect_attempts.store(0, Ordering::Release);
                tracing::info!("connected");
                self.events.emit(Event::NodeConnect {
                    node: self.name.clone(),
                });
                Ok(())
            }
            Err(error) => {
                let error = Arc::new(error);
                tracing::warn!(%error, "failed to connect");
                self.teardown();
                self.events.emit(Event::NodeError {
                    node: self.name.clone(),
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    async fn open(&self) -> Result<(), ConnectError> {
        let user_id = lock(&self.user_id).ok_or(MissingUserId)?;

        let mut request = self.config.ws_url().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&self.config.auth)?);
        headers.insert("user-id", HeaderValue::from(user_id.get()));
        headers.insert(
            "client-name",
            HeaderValue::from_str(&self.options.client_name)?,
        );

        let (socket, _) = tokio_tungstenite::connect_async(request).await?;
        tracing::debug!("websocket opened");

        self.teardown();
        let mut session = self.session.subscribe();
        let (closed_tx, closed) = oneshot::channel::<()>();
        self.connected.store(true, Ordering::SeqCst);
        if let Some(node) = self.weak.upgrade() {
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            *lock(&self.shutdown) = Some(shutdown_tx);
            let listener = node.listen(socket, shutdown_rx, closed_tx);
            *lock(&self.listener) = Some(traced::spawn(listener));
        }

        let ready = tokio::select! {
            ready = tokio::time::timeout(
                konst::node::READY_TIMEOUT,
                session.wait_for(Option::is_some),
            ) => matches!(ready, Ok(Ok(_))),
            _ = closed => return Err(ClosedBeforeReady.into()),
        };
        if !ready {
            return Err(ReadyTimeout.into());
        }

        match self.rest.info().await {
            Ok(info) => {
                tracing::debug!(version = %info.version.semver, "fetched node info");
                *lock(&self.info) = Some(info);
            }
            Err(error) => tracing::warn!(%error, "failed to fetch node info"),
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, name = "listener", fields(node = %self.name))]
    async fn listen(
        self: Arc<Self>,
        mut socket: Socket,
        mut shutdown: oneshot::Receiver<()>,
        _closed: oneshot::Sender<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    if let Err(error) = socket.close(None).await {
                        tracing::debug!(%error, "failed to close websocket");
                    }
                    return;
                }
                message = socket.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_message(&text),
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(?frame, "node closed the websocket");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        tracing::warn!(%error, "websocket errored");
                        break;
                    }
                    None => break,
                },
            }
        }
        self.handle_disconnect();
    }

    /// Reschedules only for a live session. A connect still waiting for ready owns its retry.
    fn handle_disconnect(self: &Arc<Self>) {
        self.connected.store(false, Ordering::SeqCst);
        self.session.send_replace(None);
        tracing::info!("disconnected");
        self.events.emit(Event::NodeDisconnect {
            node: self.name.clone(),
        });

        if !self.closing.load(Ordering::Acquire) && !self.connecting.load(Ordering::SeqCst) {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let previous = self.reconnect_attempts.fetch_add(1, Ordering::AcqRel);
        let attempt = previous.saturating_add(1);
        if !self.options.may_reconnect(attempt) {
            tracing::warn!(attempt, "giving up reconnecting");
            return;
        }

        let delay = self.options.reconnect_delay(previous);
        tracing::debug!(attempt, ?delay, "scheduling reconnect");
        let node = self.clone();
        traced::spawn(async move {
            tokio::time::sleep(delay).await;
            node.reconnect().await;
        });
    }

    #[tracing::instrument(skip_all, name = "reconnect", fields(node = %self.name))]
    async fn reconnect(self: Arc<Self>) {
        if self.closing.load(Ordering::Acquire) || self.is_connected() {
            return;
        }
        match self.connect().await {
            Err(error) if !matches!(*error, ConnectError::AlreadyConnecting(_)) => {
                self.schedule_reconnect();
            }
            _ => {}
        }
    }

    fn teardown(&self) {
        if let Some(shutdown) = lock(&self.shutdown).take() {
            let _ = shutdown.send(());
        }
        lock(&self.listener).take();
        self.connected.store(false, Ordering::SeqCst);
        self.session.send_replace(None);
    }

    /// Closes the websocket for good. The node will not reconnect.
    pub fn cleanup(&self) {
        self.closing.store(true, Ordering::Release);
        self.teardown();
        tracing::debug!(node = %self.name, "cleaned up");
    }

    fn route(&self, guild_id: &str) -> Option<Arc<Player>> {
        let guild_id = guild_id.parse().ok().and_then(Id::new_checked)?;
        self.players.get(guild_id)
    }

    pub(crate) fn handle_message(&self, text: &str) {
        let message = match serde_json::from_str::<Incoming>(text) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(%error, "failed to parse message");
                return;
            }
        };
        tracing::trace!(?message, "received");

        match message {
            Incoming::Ready(ready) => {
                tracing::debug!(session_id = %ready.session_id, resumed = ready.resumed, "ready");
                self.connected.store(true, Ordering::SeqCst);
                self.session.send_replace(Some(ready.session_id.clone()));
                self.events.emit(Event::NodeReady {
                    node: self.name.clone(),
                    session_id: ready.session_id,
                    resumed: ready.resumed,
                });
            }
            Incoming::Stats(stats) => {
                *lock(&self.stats) = Some(stats.clone());
                self.events.emit(Event::NodeStats {
                    node: self.name.clone(),
                    stats,
                });
            }
            Incoming::PlayerUpdate(update) => {
                if let Some(player) = self.route(&update.guild_id) {
                    player.handle_position_update(update.state);
                }
            }
            Incoming::Event(event) => self.handle_event(*event),
            Incoming::Unknown => {}
        }
    }

    fn handle_event(&self, event: model::Event) {
        let Some(player) = self.route(&event.guild_id) else {
            tracing::trace!(guild_id = %event.guild_id, "event for unknown player");
            return;
        };

        match event.data {
            EventData::TrackStart { track } => player.handle_track_start(&track),
            EventData::TrackEnd { track, reason } => {
                player.handle_track_end(track.as_ref(), reason);
            }
            EventData::TrackException { track, exception } => {
                player.handle_track_exception(track.as_ref(), exception);
            }
            EventData::TrackStuck {
                track,
                threshold_ms,
            } => {
                traced::spawn(async move {
                    player.handle_track_stuck(track.as_ref(), threshold_ms).await;
                });
            }
            EventData::WebSocketClosed {
                code,
                reason,
                by_remote,
            } => {
                tracing::debug!(code, %reason, by_remote, "voice websocket closed");
                self.events.emit(Event::PlayerWebSocketClosed {
                    player: player.clone(),
                    code,
                    reason,
                    by_remote,
                });
                if code == konst::node::VOICE_CLOSE_DISCONNECTED {
                    traced::spawn(async move { player.handle_remote_destroy().await });
                }
            }
            EventData::Unknown => {}
        }
    }
}

impl PlayerLink for Node {
    fn session_id(&self) -> Option<String> {
        self.session.borrow().clone()
    }

    fn update_player<'a>(
        &'a self,
        guild_id: Id<GuildMarker>,
        update: &'a UpdatePlayer,
        no_replace: bool,
    ) -> BoxFuture<'a, Result<Option<PlayerInfo>, RestError>> {
        async move {
            let session_id = self.session_id().ok_or(NoSession)?;
            self.rest
                .update_player(&session_id, guild_id, update, no_replace)
                .await
        }
        .boxed()
    }

    fn get_player(&self, guild_id: Id<GuildMarker>) -> BoxFuture<'_, Result<PlayerInfo, RestError>> {
        async move {
            let session_id = self.session_id().ok_or(NoSession)?;
            self.rest.get_player(&session_id, guild_id).await
        }
        .boxed()
    }

    fn destroy_player(&self, guild_id: Id<GuildMarker>) -> BoxFuture<'_, Result<(), RestError>> {
        async move {
            let session_id = self.session_id().ok_or(NoSession)?;
            self.rest.destroy_player(&session_id, guild_id).await
        }
        .boxed()
    }

    fn attach(&self, player: Arc<Player>) {
        self.players.insert(player);
    }

    fn detach(&self, player: &Player) {
        self.players.remove_if_same(player);
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use futures::{SinkExt, StreamExt};
    use rstest::rstest;
    use tokio::{net::TcpListener, sync::broadcast};
    use tokio_tungstenite::tungstenite::Message;
    use twilight_model::id::Id;

    use super::Node;
    use crate::{
        config::{NodeConfig, SaladOptions},
        error::{ConnectError, RestError},
        event::{Event, EventEmitter, EventKind},
        model::UpdatePlayer,
        player::{ConnectionOptions, Player, PlayerLink},
    };

    fn node() -> (Arc<Node>, Arc<EventEmitter>) {
        node_with(NodeConfig::default(), SaladOptions::default())
    }

    fn node_with(config: NodeConfig, options: SaladOptions) -> (Arc<Node>, Arc<EventEmitter>) {
        let events = Arc::new(EventEmitter::default());
        let node = Node::new(config, Arc::new(options), events.clone()).expect("valid config");
        (node, events)
    }

    fn quick_retries(max_attempts: u32) -> SaladOptions {
        SaladOptions::builder()
            .max_reconnect_attempts(max_attempts)
            .base_reconnect_delay(Duration::from_millis(10))
            .max_reconnect_delay(Duration::from_millis(10))
            .build()
            .expect("valid options")
    }

    /// A local websocket server that either hands out a session or hangs up right after the
    /// handshake. Returns its config and a count of completed handshakes.
    async fn lavalink(sends_ready: bool) -> (NodeConfig, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let handshakes = Arc::new(AtomicUsize::new(0));

        let counter = handshakes.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let counter = counter.clone();
                tokio::spawn(async move {
                    let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    counter.fetch_add(1, Ordering::SeqCst);
                    if sends_ready {
                        let ready = r#"{"op":"ready","resumed":false,"sessionId":"s"}"#;
                        let _ = socket.send(Message::text(ready)).await;
                        while socket.next().await.is_some() {}
                    } else {
                        let _ = socket.close(None).await;
                    }
                });
            }
        });

        (NodeConfig::new("127.0.0.1", port, "pw"), handshakes)
    }

    fn attach(node: &Arc<Node>, events: &Arc<EventEmitter>, guild_id: u64) -> Arc<Player> {
        let options = ConnectionOptions::new(Id::new(guild_id));
        let link: Arc<dyn PlayerLink> = node.clone();
        let player = Player::new(&options, link, events.clone(), std::sync::Weak::new());
        node.attach(player.clone());
        player
    }

    async fn next_of(rx: &mut broadcast::Receiver<Event>, kind: EventKind) -> Event {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let event = rx.recv().await.expect("open channel");
                if event.kind() == kind {
                    return event;
                }
            }
        })
        .await
        .expect("event in time")
    }

    #[tokio::test]
    async fn ready_opens_a_session() {
        let (node, events) = node();
        let mut rx = events.subscribe();
        assert!(node.session_id().is_none());

        node.handle_message(r#"{"op":"ready","resumed":false,"sessionId":"abc"}"#);
        assert_eq!(node.session_id().as_deref(), Some("abc"));
        let Event::NodeReady { session_id, .. } = next_of(&mut rx, EventKind::NodeReady).await
        else {
            panic!("expected node ready");
        };
        assert_eq!(session_id, "abc");
    }

    #[tokio::test]
    async fn stats_are_kept() {
        let (node, _) = node();
        node.handle_message(
            r#"{"op":"stats","players":3,"playingPlayers":2,"uptime":10,
                "memory":{"free":1,"used":2,"allocated":3,"reservable":4},
                "cpu":{"cores":2,"systemLoad":0.1,"lavalinkLoad":0.1}}"#,
        );
        assert_eq!(node.stats().map(|s| s.players), Some(3));
    }

    #[rstest]
    #[case("not json")]
    #[case(r#"{"op":"playerUpdate","guildId":"999","state":{"position":1}}"#)]
    #[case(r#"{"op":"event","type":"TrackStartEvent","guildId":"nope","track":{"encoded":"x"}}"#)]
    #[tokio::test]
    async fn ignores_what_it_cannot_route(#[case] raw: &str) {
        let (node, events) = node();
        let player = attach(&node, &events, 1);
        node.handle_message(raw);
        assert_eq!(player.position(), 0);
        assert!(!player.is_playing());
    }

    #[tokio::test]
    async fn routes_player_updates_and_events() {
        let (node, events) = node();
        let player = attach(&node, &events, 42);

        node.handle_message(
            r#"{"op":"playerUpdate","guildId":"42",
                "state":{"time":5,"position":6000,"connected":true,"ping":12}}"#,
        );
        assert_eq!(player.position(), 6000);
        assert_eq!(player.ping(), 12);

        node.handle_message(
            r#"{"op":"event","type":"TrackStartEvent","guildId":"42",
                "track":{"encoded":"QAAA","info":{"title":"t"}}}"#,
        );
        assert!(player.is_playing());
        assert_eq!(player.current().as_deref(), Some("QAAA"));
    }

    #[tokio::test]
    async fn voice_disconnect_destroys_the_player() {
        let (node, events) = node();
        let mut rx = events.subscribe();
        let player = attach(&node, &events, 7);

        node.handle_message(
            r#"{"op":"event","type":"WebSocketClosedEvent","guildId":"7",
                "code":4014,"reason":"Disconnected.","byRemote":true}"#,
        );
        next_of(&mut rx, EventKind::PlayerWebSocketClosed).await;
        next_of(&mut rx, EventKind::PlayerDestroy).await;
        assert!(player.is_destroyed());
        assert!(node.player(Id::new(7)).is_none());
    }

    #[tokio::test]
    async fn detach_only_removes_the_same_player() {
        let (node, events) = node();
        let old = attach(&node, &events, 9);
        let new = attach(&node, &events, 9);

        node.detach(&old);
        assert!(node.player(Id::new(9)).is_some_and(|p| Arc::ptr_eq(&p, &new)));
        node.detach(&new);
        assert!(node.player(Id::new(9)).is_none());
    }

    #[tokio::test]
    async fn updates_need_a_session() {
        let (node, _) = node();
        let result = node
            .update_player(Id::new(1), &UpdatePlayer::pause(true), true)
            .await;
        assert!(matches!(result, Err(RestError::NoSession(_))));
    }

    #[tokio::test]
    async fn connecting_needs_a_user_id() {
        let (node, events) = node();
        let mut rx = events.subscribe();

        let error = node.connect().await.expect_err("no user id");
        assert!(matches!(*error, ConnectError::MissingUserId(_)));
        next_of(&mut rx, EventKind::NodeError).await;
        assert!(!node.is_connected());
    }

    #[tokio::test]
    async fn gives_up_after_the_last_attempt() {
        let (node, events) = node_with(NodeConfig::default(), quick_retries(2));
        let mut rx = events.subscribe();

        node.handle_disconnect();
        next_of(&mut rx, EventKind::NodeDisconnect).await;
        next_of(&mut rx, EventKind::NodeError).await;
        next_of(&mut rx, EventKind::NodeError).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(node.reconnect_attempts.load(Ordering::Acquire), 3);
        assert!(!node.is_connected());
    }

    #[tokio::test]
    async fn closing_stops_reconnects() {
        let (node, _) = node_with(NodeConfig::default(), quick_retries(2));
        node.cleanup();

        node.handle_disconnect();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(node.reconnect_attempts.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn connecting_resets_the_attempts() {
        let (config, handshakes) = lavalink(true).await;
        let (node, _) = node_with(config, quick_retries(2));
        node.set_user_id(Id::new(1));
        node.reconnect_attempts.store(2, Ordering::Release);

        node.connect().await.expect("connected");
        assert_eq!(node.reconnect_attempts.load(Ordering::Acquire), 0);
        assert_eq!(node.session_id().as_deref(), Some("s"));
        assert_eq!(handshakes.load(Ordering::SeqCst), 1);
        node.cleanup();
    }

    #[tokio::test]
    async fn hang_up_before_ready_fails_fast() {
        let (config, handshakes) = lavalink(false).await;
        let (node, _) = node_with(config, quick_retries(3));
        node.set_user_id(Id::new(1));

        let error = tokio::time::timeout(Duration::from_secs(2), node.connect())
            .await
            .expect("no ready timeout")
            .expect_err("closed before ready");
        assert!(matches!(*error, ConnectError::ClosedBeforeReady(_)));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handshakes.load(Ordering::SeqCst), 1);
        assert_eq!(node.reconnect_attempts.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn each_failed_reconnect_schedules_one_more() {
        let (config, handshakes) = lavalink(false).await;
        let (node, _) = node_with(config, quick_retries(3));
        node.set_user_id(Id::new(1));

        node.clone().reconnect().await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(handshakes.load(Ordering::SeqCst), 4);
        assert_eq!(node.reconnect_attempts.load(Ordering::Acquire), 4);
        node.cleanup();
    }
}
