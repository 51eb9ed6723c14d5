mod link;
mod registry;
mod voice;

use std::sync::{Arc, Mutex, Weak};

use tokio::{sync::watch, task::JoinHandle};
use twilight_model::id::{
    Id,
    marker::{ChannelMarker, GuildMarker},
};

pub use self::{
    link::{BoxError, PlayerLink, VoiceCleanup},
    voice::VoiceStatus,
};
pub(crate) use self::registry::Registry;
use crate::{
    error::{RestError, TrackFailure, VoiceError},
    event::{Event, EventEmitter},
    konst,
    model::{Exception, PlayerInfo, PlayerState, TrackEndReason, UpdatePlayer, VoiceState},
    queue::{LoopMode, Queue},
    sync::lock,
    track::{Track, TrackData},
    traced,
};

/// How a new player should join its guild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub guild_id: Id<GuildMarker>,
    pub voice_channel: Option<Id<ChannelMarker>>,
    pub text_channel: Option<Id<ChannelMarker>>,
    pub mute: bool,
    pub deaf: bool,
    pub volume: u16,
}

impl ConnectionOptions {
    pub const fn new(guild_id: Id<GuildMarker>) -> Self {
        Self {
            guild_id,
            voice_channel: None,
            text_channel: None,
            mute: false,
            deaf: true,
            volume: konst::player::DEFAULT_VOLUME,
        }
    }

    #[must_use]
    pub const fn voice_channel(mut self, channel_id: Id<ChannelMarker>) -> Self {
        self.voice_channel = Some(channel_id);
        self
    }

    #[must_use]
    pub const fn text_channel(mut self, channel_id: Id<ChannelMarker>) -> Self {
        self.text_channel = Some(channel_id);
        self
    }

    #[must_use]
    pub const fn mute(mut self, mute: bool) -> Self {
        self.mute = mute;
        self
    }

    #[must_use]
    pub const fn deaf(mut self, deaf: bool) -> Self {
        self.deaf = deaf;
        self
    }

    #[must_use]
    pub const fn volume(mut self, volume: u16) -> Self {
        self.volume = volume;
        self
    }
}

#[derive(Debug, Default)]
struct VoiceParts {
    session_id: Option<String>,
    token: Option<String>,
    endpoint: Option<String>,
}

impl VoiceParts {
    fn complete(&self) -> Option<VoiceState> {
        Some(VoiceState {
            session_id: self.session_id.clone()?,
            token: self.token.clone()?,
            endpoint: self.endpoint.clone()?,
        })
    }
}

#[derive(Debug)]
struct State {
    playing: bool,
    paused: bool,
    destroyed: bool,
    destroying: bool,
    current: Option<String>,
    current_track: Option<Track>,
    position: u64,
    timestamp: u64,
    ping: i64,
    volume: u16,
    mute: bool,
    deaf: bool,
    voice_channel: Option<Id<ChannelMarker>>,
    text_channel: Option<Id<ChannelMarker>>,
    voice: VoiceParts,
    last_voice: Option<VoiceState>,
    connect_attempts: u32,
}

impl State {
    const fn inactive(&self) -> bool {
        self.destroyed || self.destroying
    }

    fn clear_current(&mut self) {
        self.current = None;
        self.current_track = None;
        self.position = 0;
        self.playing = false;
    }

    fn reset_voice(&mut self) {
        self.voice = VoiceParts::default();
        self.last_voice = None;
        self.connect_attempts = 0;
    }

    fn is_current(&self, track: Option<&TrackData>) -> bool {
        match (track, self.current.as_deref()) {
            (Some(track), Some(current)) => track.encoded == current,
            (None, current) => current.is_some(),
            (Some(_), None) => false,
        }
    }
}

/// Playback for one guild, backed by a Lavalink player on a node.
pub struct Player {
    guild_id: Id<GuildMarker>,
    link: Arc<dyn PlayerLink>,
    events: Arc<EventEmitter>,
    registry: Weak<Registry>,
    state: Mutex<State>,
    queue: Mutex<Queue>,
    play_lock: tokio::sync::Mutex<()>,
    voice_task: Mutex<Option<JoinHandle<()>>>,
    voice_cleanup: Mutex<Option<VoiceCleanup>>,
    connected: watch::Sender<bool>,
    weak: Weak<Self>,
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("guild_id", &self.guild_id)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Player {
    pub(crate) fn new(
        options: &ConnectionOptions,
        link: Arc<dyn PlayerLink>,
        events: Arc<EventEmitter>,
        registry: Weak<Registry>,
    ) -> Arc<Self> {
        let state = State {
            playing: false,
            paused: false,
            destroyed: false,
            destroying: false,
            current: None,
            current_track: None,
            position: 0,
            timestamp: 0,
            ping: 0,
            volume: options.volume.min(konst::player::MAX_VOLUME),
            mute: options.mute,
            deaf: options.deaf,
            voice_channel: options.voice_channel,
            text_channel: options.text_channel,
            voice: VoiceParts::default(),
            last_voice: None,
            connect_attempts: 0,
        };

        Arc::new_cyclic(|weak| Self {
            guild_id: options.guild_id,
            link,
            events,
            registry,
            state: Mutex::new(state),
            queue: Mutex::new(Queue::new()),
            play_lock: tokio::sync::Mutex::new(()),
            voice_task: Mutex::new(None),
            voice_cleanup: Mutex::new(None),
            connected: watch::channel(false).0,
            weak: weak.clone(),
        })
    }

    #[inline]
    pub const fn guild_id(&self) -> Id<GuildMarker> {
        self.guild_id
    }

    pub fn voice_channel(&self) -> Option<Id<ChannelMarker>> {
        lock(&self.state).voice_channel
    }

    pub fn text_channel(&self) -> Option<Id<ChannelMarker>> {
        lock(&self.state).text_channel
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.state).playing
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.state).paused
    }

    /// Whether Lavalink has accepted this player's voice credentials.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.state).destroyed
    }

    /// The encoded track Lavalink was last told to play.
    pub fn current(&self) -> Option<String> {
        lock(&self.state).current.clone()
    }

    pub fn current_track(&self) -> Option<Track> {
        lock(&self.state).current_track.clone()
    }

    /// Playback position in milliseconds, as of [`Self::timestamp`].
    pub fn position(&self) -> u64 {
        lock(&self.state).position
    }

    pub fn timestamp(&self) -> u64 {
        lock(&self.state).timestamp
    }

    pub fn ping(&self) -> i64 {
        lock(&self.state).ping
    }

    pub fn volume(&self) -> u16 {
        lock(&self.state).volume
    }

    pub fn mute(&self) -> bool {
        lock(&self.state).mute
    }

    pub fn deaf(&self) -> bool {
        lock(&self.state).deaf
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn loop_mode(&self) -> LoopMode {
        lock(&self.queue).loop_mode()
    }

    /// Runs `f` against the queue. Changes made here emit no events.
    pub fn with_queue<R>(&self, f: impl FnOnce(&mut Queue) -> R) -> R {
        f(&mut lock(&self.queue))
    }

    fn is_inactive(&self) -> bool {
        lock(&self.state).inactive()
    }

    fn emit(&self, event: impl FnOnce(Arc<Self>) -> Event) {
        if let Some(player) = self.weak.upgrade() {
            self.events.emit(event(player));
        }
    }

    fn has_next(&self) -> bool {
        !lock(&self.queue).is_empty()
    }

    async fn update(&self, update: &UpdatePlayer, no_replace: bool) -> Result<(), RestError> {
        self.link
            .update_player(self.guild_id, update, no_replace)
            .await
            .map(|_| ())
    }

    /// Plays the next track after a short pause, or reports the queue as finished.
    fn advance(&self) {
        if !self.has_next() {
            self.emit(|player| Event::QueueEnd { player });
            return;
        }
        let Some(player) = self.weak.upgrade() else {
            return;
        };
        traced::spawn(async move {
            tokio::time::sleep(konst::player::NEXT_TRACK_DELAY).await;
            player.play().await;
        });
    }

    /// Sends the head of the queue to Lavalink.
    ///
    /// The track stays queued while it plays and is consumed when Lavalink reports its end.
    pub async fn play(&self) {
        let _guard = self.play_lock.lock().await;

        let (ready, volume, current) = {
            let state = lock(&self.state);
            if state.inactive() {
                return;
            }
            (
                state.voice.complete().is_some(),
                state.volume,
                state.current_track.clone(),
            )
        };
        if !ready {
            self.voice_error(VoiceError::NotReady);
            return;
        }
        if !self.is_connected() {
            self.voice_error(VoiceError::NotConnected);
            return;
        }

        let next = lock(&self.queue).get_next(current.as_ref());
        let Some(track) = next else {
            lock(&self.state).clear_current();
            self.emit(|player| Event::QueueEnd { player });
            return;
        };
        let Some(encoded) = track.resolve().map(str::to_owned) else {
            self.fail_track(track, TrackFailure::Unplayable);
            return;
        };

        {
            let mut state = lock(&self.state);
            state.current = Some(encoded.clone());
            state.current_track = Some(track.clone());
        }
        tracing::debug!(guild_id = ?self.guild_id, %track, "playing");

        let update = UpdatePlayer::play(encoded.as_str(), volume);
        match self.update(&update, true).await {
            Ok(()) => {
                let mut state = lock(&self.state);
                if state.current.as_deref() == Some(encoded.as_str()) {
                    state.position = 0;
                    state.playing = true;
                    state.paused = false;
                }
            }
            Err(error) => {
                tracing::warn!(guild_id = ?self.guild_id, %error, "failed to play track");
                self.fail_track(track, TrackFailure::Play(Arc::new(error)));
            }
        }
    }

    fn fail_track(&self, track: Track, error: TrackFailure) {
        lock(&self.state).clear_current();
        lock(&self.queue).consume_next();
        self.emit(|player| Event::TrackError {
            player,
            track: Some(track),
            error,
        });
        if self.has_next() {
            self.advance();
        }
    }

    pub fn add_to_queue(&self, track: Track) -> bool {
        if self.is_inactive() {
            return false;
        }
        let added = lock(&self.queue).add(track.clone());
        if added {
            self.emit(|player| Event::TrackAdd { player, track });
        }
        added
    }

    pub async fn skip(&self) {
        let _guard = self.play_lock.lock().await;
        if self.is_inactive() {
            return;
        }
        let skipped = lock(&self.state).current_track.clone();
        if let Err(error) = self.update(&UpdatePlayer::stop(), false).await {
            tracing::debug!(guild_id = ?self.guild_id, %error, "failed to stop skipped track");
        }

        lock(&self.queue).consume_next();
        lock(&self.state).clear_current();
        self.emit(|player| Event::TrackSkip {
            player,
            track: skipped,
        });
        self.advance();
    }

    /// Stops playback and empties the queue.
    pub async fn stop(&self) {
        let _guard = self.play_lock.lock().await;
        if self.is_inactive() {
            return;
        }
        if let Err(error) = self.update(&UpdatePlayer::stop(), false).await {
            tracing::debug!(guild_id = ?self.guild_id, %error, "failed to stop track");
        }

        lock(&self.queue).clear();
        {
            let mut state = lock(&self.state);
            state.clear_current();
            state.paused = false;
        }
        self.emit(|player| Event::PlayerStop { player });
    }

    pub async fn pause(&self) {
        {
            let state = lock(&self.state);
            if state.inactive() || !state.playing || state.paused {
                return;
            }
        }
        match self.update(&UpdatePlayer::pause(true), true).await {
            Ok(()) => {
                lock(&self.state).paused = true;
                self.emit(|player| Event::PlayerPause { player });
            }
            Err(error) => tracing::warn!(guild_id = ?self.guild_id, %error, "failed to pause"),
        }
    }

    pub async fn resume(&self) {
        {
            let state = lock(&self.state);
            if state.inactive() || !state.paused {
                return;
            }
        }
        match self.update(&UpdatePlayer::pause(false), true).await {
            Ok(()) => {
                lock(&self.state).paused = false;
                self.emit(|player| Event::PlayerResume { player });
            }
            Err(error) => tracing::warn!(guild_id = ?self.guild_id, %error, "failed to resume"),
        }
    }

    /// Sets the volume, clamped to `0..=1000`.
    pub async fn set_volume(&self, volume: u16) {
        let volume = volume.min(konst::player::MAX_VOLUME);
        let old = {
            let mut state = lock(&self.state);
            if state.inactive() {
                return;
            }
            std::mem::replace(&mut state.volume, volume)
        };
        match self.update(&UpdatePlayer::volume(volume), true).await {
            Ok(()) => self.emit(|player| Event::PlayerVolumeChange {
                player,
                old,
                new: volume,
            }),
            Err(error) => tracing::warn!(guild_id = ?self.guild_id, %error, "failed to set volume"),
        }
    }

    /// Seeks the playing track to `position` milliseconds.
    pub async fn seek(&self, position: u64) {
        {
            let state = lock(&self.state);
            if state.inactive() || !state.playing {
                return;
            }
        }
        match self.update(&UpdatePlayer::seek(position), true).await {
            Ok(()) => {
                lock(&self.state).position = position;
                self.emit(|player| Event::PlayerSeek { player, position });
            }
            Err(error) => tracing::warn!(guild_id = ?self.guild_id, %error, "failed to seek"),
        }
    }

    pub fn set_loop(&self, mode: LoopMode) {
        if self.is_inactive() {
            return;
        }
        lock(&self.queue).set_loop_mode(mode);
        self.emit(|player| Event::PlayerLoopChange { player, mode });
    }

    /// Applies a player object reported by Lavalink.
    pub fn sync(&self, info: &PlayerInfo) {
        let filled = {
            let mut state = lock(&self.state);
            if state.inactive() {
                return;
            }
            state.position = info.state.position;
            state.volume = info.volume;
            state.paused = info.paused;

            match info.track.as_ref().filter(|t| !t.encoded.is_empty()) {
                Some(track) => {
                    if state.current.as_deref() != Some(track.encoded.as_str()) {
                        state.current_track = Some(Track::new(track.clone(), None));
                    }
                    state.current = Some(track.encoded.clone());
                    state.playing = true;
                }
                None => {
                    state.current = None;
                    state.current_track = None;
                    state.playing = false;
                }
            }

            let voice = &mut state.voice;
            let mut filled = false;
            for (local, remote) in [
                (&mut voice.session_id, &info.voice.session_id),
                (&mut voice.token, &info.voice.token),
                (&mut voice.endpoint, &info.voice.endpoint),
            ] {
                if local.is_none() && !remote.is_empty() {
                    *local = Some(remote.clone());
                    filled = true;
                }
            }
            filled
        };

        if filled {
            self.schedule_voice_dispatch();
        }
        self.emit(|player| Event::PlayerUpdate { player });
    }

    /// Fetches this player from Lavalink and applies it.
    pub async fn refresh(&self) -> Result<(), RestError> {
        let info = self.link.get_player(self.guild_id).await?;
        self.sync(&info);
        Ok(())
    }

    /// Tears the player down. It stops receiving events and its queue rejects new tracks.
    pub async fn destroy(&self, cleanup_voice: bool) {
        {
            let mut state = lock(&self.state);
            if state.inactive() {
                return;
            }
            state.destroying = true;
            state.playing = false;
            state.paused = false;
        }
        tracing::debug!(guild_id = ?self.guild_id, "destroying player");
        self.connected.send_replace(false);

        if cleanup_voice {
            let _ = self.run_voice_cleanup().await;
        }
        self.cancel_voice_dispatch();

        if self.link.session_id().is_some()
            && let Err(error) = self.link.destroy_player(self.guild_id).await
        {
            tracing::debug!(guild_id = ?self.guild_id, %error, "failed to delete remote player");
        }

        lock(&self.queue).close();
        {
            let mut state = lock(&self.state);
            state.clear_current();
            state.paused = false;
            state.volume = konst::player::DEFAULT_VOLUME;
            state.reset_voice();
            state.voice_channel = None;
            state.text_channel = None;
            state.destroyed = true;
            state.destroying = false;
        }
        *lock(&self.voice_cleanup) = None;

        self.detach();
        self.emit(|player| Event::PlayerDestroy { player });
    }

    /// Lavalink lost the voice connection for good: the bot was disconnected from the channel.
    pub async fn handle_remote_destroy(&self) {
        {
            let mut state = lock(&self.state);
            if state.inactive() {
                return;
            }
            state.destroying = true;
        }
        tracing::debug!(guild_id = ?self.guild_id, "player destroyed remotely");

        let _ = self.run_voice_cleanup().await;
        self.cancel_voice_dispatch();
        lock(&self.queue).clear();
        self.connected.send_replace(false);
        {
            let mut state = lock(&self.state);
            state.clear_current();
            state.paused = false;
            state.reset_voice();
            state.destroyed = true;
            state.destroying = false;
        }

        self.detach();
        self.emit(|player| Event::PlayerDestroy { player });
    }

    fn detach(&self) {
        self.link.detach(self);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if_same(self);
        }
    }

    fn attach(&self) {
        let Some(player) = self.weak.upgrade() else {
            return;
        };
        self.link.attach(player.clone());
        if let Some(registry) = self.registry.upgrade() {
            registry.live_or_insert_with(self.guild_id, || player);
        }
    }

    pub fn handle_position_update(&self, update: PlayerState) {
        {
            let mut state = lock(&self.state);
            if state.inactive() {
                return;
            }
            state.position = update.position;
            state.timestamp = update.time;
            state.ping = update.ping;
        }
        self.emit(|player| Event::PlayerPositionUpdate {
            player,
            position: update.position,
            time: update.time,
        });
    }

    pub fn handle_track_start(&self, track: &TrackData) {
        let current = {
            let mut state = lock(&self.state);
            if state.inactive() {
                return;
            }
            state.playing = true;
            state.paused = false;
            if !state.is_current(Some(track)) {
                state.current = Some(track.encoded.clone());
                state.current_track = Some(Track::new(track.clone(), None));
            }
            state.current_track.clone()
        };
        self.emit(|player| Event::TrackStart {
            player,
            track: current,
        });
    }

    /// Handles the end of `track`. Ends of anything but the current track are ignored.
    pub fn handle_track_end(&self, track: Option<&TrackData>, reason: TrackEndReason) {
        let ended = {
            let mut state = lock(&self.state);
            if state.inactive() || !state.is_current(track) {
                tracing::trace!(guild_id = ?self.guild_id, %reason, "ignoring stale track end");
                return;
            }
            let ended = state.current_track.take();
            state.clear_current();
            ended
        };
        self.emit(|player| Event::TrackEnd {
            player,
            track: ended,
            reason: reason.clone(),
        });

        if !reason.may_start_next() {
            return;
        }
        {
            let mut queue = lock(&self.queue);
            match (&reason, queue.loop_mode()) {
                (TrackEndReason::Finished, LoopMode::Track) => {}
                (TrackEndReason::Finished, LoopMode::Queue) => {
                    if let Some(track) = queue.consume_next() {
                        queue.add(track);
                    }
                }
                _ => {
                    queue.consume_next();
                }
            }
        }
        self.advance();
    }

    /// Reports the failure. Lavalink follows up with a `loadFailed` end that advances the queue.
    pub fn handle_track_exception(&self, track: Option<&TrackData>, exception: Exception) {
        let Some(track) = self.failed_track(track) else {
            return;
        };
        tracing::warn!(guild_id = ?self.guild_id, %exception, "track exception");
        self.emit(|player| Event::TrackError {
            player,
            track,
            error: TrackFailure::Exception(exception),
        });
    }

    pub async fn handle_track_stuck(&self, track: Option<&TrackData>, threshold_ms: u64) {
        let Some(track) = self.failed_track(track) else {
            return;
        };
        tracing::warn!(guild_id = ?self.guild_id, threshold_ms, "track stuck");
        self.emit(|player| Event::TrackError {
            player,
            track,
            error: TrackFailure::Stuck { threshold_ms },
        });
        self.skip().await;
    }

    fn failed_track(&self, track: Option<&TrackData>) -> Option<Option<Track>> {
        let state = lock(&self.state);
        if state.inactive() {
            return None;
        }
        let failed = if state.is_current(track) {
            state.current_track.clone()
        } else {
            track.map(|t| Track::new(t.clone(), None))
        };
        Some(failed)
    }
}
