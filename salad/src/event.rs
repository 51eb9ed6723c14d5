use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::broadcast;
use twilight_model::id::{Id, marker::ChannelMarker};

use crate::{
    error::{ConnectError, TrackFailure, VoiceError},
    konst,
    model::{Stats, TrackEndReason},
    player::Player,
    queue::LoopMode,
    sync::lock,
    track::Track,
};

/// Everything [`Salad`](crate::Salad) reports to its listeners.
#[derive(Debug, Clone)]
pub enum Event {
    Ready,
    Shutdown,
    NodeConnect {
        node: Arc<str>,
    },
    NodeReady {
        node: Arc<str>,
        session_id: String,
        resumed: bool,
    },
    NodeStats {
        node: Arc<str>,
        stats: Stats,
    },
    NodeError {
        node: Arc<str>,
        error: Arc<ConnectError>,
    },
    NodeDisconnect {
        node: Arc<str>,
    },
    PlayerCreate {
        player: Arc<Player>,
    },
    PlayerConnect {
        player: Arc<Player>,
    },
    PlayerDestroy {
        player: Arc<Player>,
    },
    PlayerVoiceStateUpdate {
        player: Arc<Player>,
        channel_id: Option<Id<ChannelMarker>>,
        session_id: String,
    },
    PlayerVoiceServerUpdate {
        player: Arc<Player>,
        endpoint: Option<String>,
    },
    PlayerVoiceUpdate {
        player: Arc<Player>,
    },
    PlayerVoiceError {
        player: Arc<Player>,
        error: VoiceError,
    },
    PlayerUpdate {
        player: Arc<Player>,
    },
    PlayerPositionUpdate {
        player: Arc<Player>,
        position: u64,
        time: u64,
    },
    PlayerStop {
        player: Arc<Player>,
    },
    PlayerPause {
        player: Arc<Player>,
    },
    PlayerResume {
        player: Arc<Player>,
    },
    PlayerVolumeChange {
        player: Arc<Player>,
        old: u16,
        new: u16,
    },
    PlayerSeek {
        player: Arc<Player>,
        position: u64,
    },
    PlayerLoopChange {
        player: Arc<Player>,
        mode: LoopMode,
    },
    PlayerReconnect {
        player: Arc<Player>,
    },
    PlayerWebSocketClosed {
        player: Arc<Player>,
        code: u16,
        reason: String,
        by_remote: bool,
    },
    TrackAdd {
        player: Arc<Player>,
        track: Track,
    },
    TrackStart {
        player: Arc<Player>,
        track: Option<Track>,
    },
    TrackEnd {
        player: Arc<Player>,
        track: Option<Track>,
        reason: TrackEndReason,
    },
    TrackError {
        player: Arc<Player>,
        track: Option<Track>,
        error: TrackFailure,
    },
    TrackSkip {
        player: Arc<Player>,
        track: Option<Track>,
    },
    QueueEnd {
        player: Arc<Player>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ready,
    Shutdown,
    NodeConnect,
    NodeReady,
    NodeStats,
    NodeError,
    NodeDisconnect,
    PlayerCreate,
    PlayerConnect,
    PlayerDestroy,
    PlayerVoiceStateUpdate,
    PlayerVoiceServerUpdate,
    PlayerVoiceUpdate,
    PlayerVoiceError,
    PlayerUpdate,
    PlayerPositionUpdate,
    PlayerStop,
    PlayerPause,
    PlayerResume,
    PlayerVolumeChange,
    PlayerSeek,
    PlayerLoopChange,
    PlayerReconnect,
    PlayerWebSocketClosed,
    TrackAdd,
    TrackStart,
    TrackEnd,
    TrackError,
    TrackSkip,
    QueueEnd,
}

impl EventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Shutdown => "shutdown",
            Self::NodeConnect => "nodeConnect",
            Self::NodeReady => "nodeReady",
            Self::NodeStats => "nodeStats",
            Self::NodeError => "nodeError",
            Self::NodeDisconnect => "nodeDisconnect",
            Self::PlayerCreate => "playerCreate",
            Self::PlayerConnect => "playerConnect",
            Self::PlayerDestroy => "playerDestroy",
            Self::PlayerVoiceStateUpdate => "playerVoiceStateUpdate",
            Self::PlayerVoiceServerUpdate => "playerVoiceServerUpdate",
            Self::PlayerVoiceUpdate => "playerVoiceUpdate",
            Self::PlayerVoiceError => "playerVoiceError",
            Self::PlayerUpdate => "playerUpdate",
            Self::PlayerPositionUpdate => "playerPositionUpdate",
            Self::PlayerStop => "playerStop",
            Self::PlayerPause => "playerPause",
            Self::PlayerResume => "playerResume",
            Self::PlayerVolumeChange => "playerVolumeChange",
            Self::PlayerSeek => "playerSeek",
            Self::PlayerLoopChange => "playerLoopChange",
            Self::PlayerReconnect => "playerReconnect",
            Self::PlayerWebSocketClosed => "playerWebSocketClosed",
            Self::TrackAdd => "trackAdd",
            Self::TrackStart => "trackStart",
            Self::TrackEnd => "trackEnd",
            Self::TrackError => "trackError",
            Self::TrackSkip => "trackSkip",
            Self::QueueEnd => "queueEnd",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Event {
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Ready => EventKind::Ready,
            Self::Shutdown => EventKind::Shutdown,
            Self::NodeConnect { .. } => EventKind::NodeConnect,
            Self::NodeReady { .. } => EventKind::NodeReady,
            Self::NodeStats { .. } => EventKind::NodeStats,
            Self::NodeError { .. } => EventKind::NodeError,
            Self::NodeDisconnect { .. } => EventKind::NodeDisconnect,
            Self::PlayerCreate { .. } => EventKind::PlayerCreate,
            Self::PlayerConnect { .. } => EventKind::PlayerConnect,
            Self::PlayerDestroy { .. } => EventKind::PlayerDestroy,
            Self::PlayerVoiceStateUpdate { .. } => EventKind::PlayerVoiceStateUpdate,
            Self::PlayerVoiceServerUpdate { .. } => EventKind::PlayerVoiceServerUpdate,
            Self::PlayerVoiceUpdate { .. } => EventKind::PlayerVoiceUpdate,
            Self::PlayerVoiceError { .. } => EventKind::PlayerVoiceError,
            Self::PlayerUpdate { .. } => EventKind::PlayerUpdate,
            Self::PlayerPositionUpdate { .. } => EventKind::PlayerPositionUpdate,
            Self::PlayerStop { .. } => EventKind::PlayerStop,
            Self::PlayerPause { .. } => EventKind::PlayerPause,
            Self::PlayerResume { .. } => EventKind::PlayerResume,
            Self::PlayerVolumeChange { .. } => EventKind::PlayerVolumeChange,
            Self::PlayerSeek { .. } => EventKind::PlayerSeek,
            Self::PlayerLoopChange { .. } => EventKind::PlayerLoopChange,
            Self::PlayerReconnect { .. } => EventKind::PlayerReconnect,
            Self::PlayerWebSocketClosed { .. } => EventKind::PlayerWebSocketClosed,
            Self::TrackAdd { .. } => EventKind::TrackAdd,
            Self::TrackStart { .. } => EventKind::TrackStart,
            Self::TrackEnd { .. } => EventKind::TrackEnd,
            Self::TrackError { .. } => EventKind::TrackError,
            Self::TrackSkip { .. } => EventKind::TrackSkip,
            Self::QueueEnd { .. } => EventKind::QueueEnd,
        }
    }

    /// The player this event is about, if any.
    pub const fn player(&self) -> Option<&Arc<Player>> {
        match self {
            Self::Ready
            | Self::Shutdown
            | Self::NodeConnect { .. }
            | Self::NodeReady { .. }
            | Self::NodeStats { .. }
            | Self::NodeError { .. }
            | Self::NodeDisconnect { .. } => None,
            Self::PlayerCreate { player }
            | Self::PlayerConnect { player }
            | Self::PlayerDestroy { player }
            | Self::PlayerVoiceStateUpdate { player, .. }
            | Self::PlayerVoiceServerUpdate { player, .. }
            | Self::PlayerVoiceUpdate { player }
            | Self::PlayerVoiceError { player, .. }
            | Self::PlayerUpdate { player }
            | Self::PlayerPositionUpdate { player, .. }
            | Self::PlayerStop { player }
            | Self::PlayerPause { player }
            | Self::PlayerResume { player }
            | Self::PlayerVolumeChange { player, .. }
            | Self::PlayerSeek { player, .. }
            | Self::PlayerLoopChange { player, .. }
            | Self::PlayerReconnect { player }
            | Self::PlayerWebSocketClosed { player, .. }
            | Self::TrackAdd { player, .. }
            | Self::TrackStart { player, .. }
            | Self::TrackEnd { player, .. }
            | Self::TrackError { player, .. }
            | Self::TrackSkip { player, .. }
            | Self::QueueEnd { player } => Some(player),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;
type Listeners = HashMap<EventKind, Vec<(ListenerId, Listener)>>;

#[derive(Default)]
struct Registered {
    persistent: Listeners,
    once: Listeners,
}

impl Registered {
    fn count(&self, kind: EventKind) -> usize {
        self.persistent.get(&kind).map_or(0, Vec::len) + self.once.get(&kind).map_or(0, Vec::len)
    }
}

/// Callback and channel based event fan-out.
pub struct EventEmitter {
    listeners: Mutex<Registered>,
    next_id: AtomicU64,
    max_listeners: usize,
    sender: broadcast::Sender<Event>,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("max_listeners", &self.max_listeners)
            .field("receivers", &self.sender.receiver_count())
            .finish_non_exhaustive()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(konst::client::MAX_LISTENERS)
    }
}

impl EventEmitter {
    pub fn new(max_listeners: usize) -> Self {
        Self {
            listeners: Mutex::default(),
            next_id: AtomicU64::new(0),
            max_listeners,
            sender: broadcast::channel(konst::client::EVENT_CHANNEL_CAPACITY).0,
        }
    }

    fn register(
        &self,
        kind: EventKind,
        listener: Listener,
        pick: fn(&mut Registered) -> &mut Listeners,
    ) -> Option<ListenerId> {
        let mut registered = lock(&self.listeners);
        if registered.count(kind) >= self.max_listeners {
            tracing::warn!(%kind, max = self.max_listeners, "listener limit reached");
            return None;
        }
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        pick(&mut registered)
            .entry(kind)
            .or_default()
            .push((id, listener));
        Some(id)
    }

    pub fn on(
        &self,
        kind: EventKind,
        listener: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Option<ListenerId> {
        self.register(kind, Arc::new(listener), |r| &mut r.persistent)
    }

    /// Like [`Self::on`], but the listener is dropped after its first call.
    pub fn once(
        &self,
        kind: EventKind,
        listener: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Option<ListenerId> {
        self.register(kind, Arc::new(listener), |r| &mut r.once)
    }

    /// Removes listener `id`, or every listener of `kind` when `id` is `None`.
    pub fn off(&self, kind: EventKind, id: Option<ListenerId>) {
        let mut registered = lock(&self.listeners);
        let Registered { persistent, once } = &mut *registered;
        for listeners in [persistent, once] {
            match id {
                Some(id) => {
                    if let Some(entries) = listeners.get_mut(&kind) {
                        entries.retain(|(i, _)| *i != id);
                    }
                }
                None => {
                    listeners.remove(&kind);
                }
            }
        }
    }

    pub fn remove_all_listeners(&self, kind: Option<EventKind>) {
        match kind {
            Some(kind) => self.off(kind, None),
            None => *lock(&self.listeners) = Registered::default(),
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        lock(&self.listeners).count(kind)
    }

    /// Every kind with at least one listener.
    pub fn event_names(&self) -> Vec<EventKind> {
        let registered = lock(&self.listeners);
        let mut kinds = registered
            .persistent
            .iter()
            .chain(&registered.once)
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| *k)
            .collect::<Vec<_>>();
        kinds.sort_by_key(|k| k.as_str());
        kinds.dedup();
        kinds
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        let kind = event.kind();
        let (persistent, once) = {
            let mut registered = lock(&self.listeners);
            let persistent = registered
                .persistent
                .get(&kind)
                .map(|v| v.iter().map(|(_, l)| l.clone()).collect::<Vec<_>>())
                .unwrap_or_default();
            let once = registered.once.remove(&kind).unwrap_or_default();
            (persistent, once)
        };

        tracing::trace!(%kind, "emitting");
        for listener in persistent
            .iter()
            .chain(once.iter().map(|(_, l)| l))
        {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::error!(%kind, "event listener panicked");
            }
        }

        let _ = self.sender.send(event);
    }
}
