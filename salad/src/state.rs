use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use twilight_model::id::{
    Id,
    marker::{ChannelMarker, GuildMarker},
};

use crate::{
    client::{Salad, WeakSalad},
    error::{StateError, VoiceError},
    konst,
    player::{ConnectionOptions, Player},
    queue::LoopMode,
    sync::lock,
    track::Track,
    traced,
};

/// Rejoins a voice channel on the Discord side: `(guild, channel, deaf, mute) -> requested`.
pub type VoiceReconnect = Arc<
    dyn Fn(Id<GuildMarker>, Id<ChannelMarker>, bool, bool) -> BoxFuture<'static, bool>
        + Send
        + Sync,
>;

/// What is needed to bring a player back after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    pub guild_id: Id<GuildMarker>,
    pub voice_channel: Id<ChannelMarker>,
    #[serde(default)]
    pub text_channel: Option<Id<ChannelMarker>>,
    pub volume: u16,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub position: u64,
    #[serde(default)]
    pub loop_mode: LoopMode,
    #[serde(default)]
    pub mute: bool,
    #[serde(default)]
    pub deaf: bool,
    #[serde(default)]
    pub current: Option<Track>,
    /// Tracks after the current one.
    #[serde(default)]
    pub queue: Vec<Track>,
}

impl PlayerSnapshot {
    /// `None` for a player that is destroyed or not in a voice channel.
    pub fn capture(player: &Player) -> Option<Self> {
        if player.is_destroyed() {
            return None;
        }
        let voice_channel = player.voice_channel()?;
        let current = player.current_track();

        let mut queue = player.with_queue(|q| q.tracks());
        if let Some(current) = &current
            && queue.first().is_some_and(|t| t.encoded() == current.encoded())
        {
            queue.remove(0);
        }

        Some(Self {
            guild_id: player.guild_id(),
            voice_channel,
            text_channel: player.text_channel(),
            volume: player.volume(),
            paused: player.is_paused(),
            position: player.position(),
            loop_mode: player.loop_mode(),
            mute: player.mute(),
            deaf: player.deaf(),
            current,
            queue,
        })
    }

    pub const fn connection_options(&self) -> ConnectionOptions {
        let mut options = ConnectionOptions::new(self.guild_id)
            .voice_channel(self.voice_channel)
            .volume(self.volume)
            .mute(self.mute)
            .deaf(self.deaf);
        options.text_channel = self.text_channel;
        options
    }

    /// Refills `player` and resumes playback once its voice connection is up.
    fn apply(self, player: &Arc<Player>) {
        player.with_queue(|q| {
            for track in self.current.into_iter().chain(self.queue) {
                q.add(track);
            }
        });
        player.set_loop(self.loop_mode);

        traced::tokio_spawn(resume(player.clone(), self.position, self.paused));
    }
}

async fn resume(player: Arc<Player>, position: u64, paused: bool) -> Result<(), VoiceError> {
    if !player
        .wait_until_connected(konst::player::RESUME_VOICE_TIMEOUT)
        .await
    {
        return Err(VoiceError::NotConnected);
    }
    tracing::debug!(guild_id = ?player.guild_id(), position, "resuming restored player");

    player.play().await;
    if position > 0 {
        player.seek(position).await;
    }
    if paused {
        player.pause().await;
    }
    Ok(())
}

/// Keeps player snapshots in a JSON lines file.
#[derive(Debug)]
pub struct StateManager {
    path: PathBuf,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
    written: AtomicBool,
}

impl StateManager {
    pub const fn new(path: PathBuf, interval: Duration) -> Self {
        Self {
            path,
            interval,
            task: Mutex::new(None),
            written: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(".tmp");
        PathBuf::from(path)
    }

    /// Starts saving every interval. Does nothing if already running.
    pub(crate) fn start(&self, salad: WeakSalad) {
        let mut task = lock(&self.task);
        if task.is_some() {
            return;
        }

        let interval = self.interval;
        *task = Some(traced::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(salad) = salad.upgrade() else {
                    return;
                };
                let Some(state) = salad.state_manager() else {
                    return;
                };
                if let Err(error) = state.save_periodically(&salad.players()).await {
                    tracing::warn!(%error, "failed to save player states");
                }
            }
        }));
    }

    /// Stops the periodic save and saves one last time.
    pub(crate) async fn stop(&self, players: &[Arc<Player>]) -> Result<usize, StateError> {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        self.save_all_states(players).await
    }

    /// A previous run's file is left alone until this run has had something to save.
    async fn save_periodically(&self, players: &[Arc<Player>]) -> Result<usize, StateError> {
        let snapshots = players
            .iter()
            .filter_map(|p| PlayerSnapshot::capture(p))
            .collect::<Vec<_>>();
        if snapshots.is_empty() && !self.written.load(Ordering::Acquire) {
            return Ok(0);
        }
        self.write(&snapshots).await
    }

    pub async fn save_all_states(&self, players: &[Arc<Player>]) -> Result<usize, StateError> {
        let snapshots = players
            .iter()
            .filter_map(|p| PlayerSnapshot::capture(p))
            .collect::<Vec<_>>();
        self.write(&snapshots).await
    }

    async fn write(&self, snapshots: &[PlayerSnapshot]) -> Result<usize, StateError> {
        let mut contents = String::new();
        for snapshot in snapshots {
            contents.push_str(&serde_json::to_string(snapshot)?);
            contents.push('\n');
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, contents).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        self.written.store(true, Ordering::Release);

        tracing::trace!(count = snapshots.len(), path = %self.path.display(), "saved player states");
        Ok(snapshots.len())
    }

    /// Every snapshot in the file. A missing file holds none; malformed lines are skipped.
    pub async fn load_states(&self) -> Result<Vec<PlayerSnapshot>, StateError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let snapshots = contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(number, line)| match serde_json::from_str(line) {
                Ok(snapshot) => Some(snapshot),
                Err(error) => {
                    tracing::warn!(line = number + 1, %error, "skipping malformed player state");
                    None
                }
            })
            .collect();
        Ok(snapshots)
    }

    /// Brings back every saved player whose voice channel could be rejoined.
    pub(crate) async fn restore_all_players(&self, salad: &Salad) -> Result<usize, StateError> {
        let snapshots = self.load_states().await?;
        if snapshots.is_empty() {
            return Ok(0);
        }
        let Some(reconnect) = salad.voice_reconnect() else {
            tracing::warn!(
                saved = snapshots.len(),
                "no voice reconnect callback registered, not restoring players"
            );
            return Ok(0);
        };

        let mut restored = 0;
        for snapshot in snapshots {
            let guild_id = snapshot.guild_id;
            if salad.get_player(guild_id).is_some() {
                tracing::debug!(?guild_id, "player already live, not restoring");
                continue;
            }

            let player = match salad.create_connection(snapshot.connection_options()) {
                Ok(player) => player,
                Err(error) => {
                    tracing::warn!(?guild_id, %error, "failed to restore player");
                    continue;
                }
            };
            if !reconnect(guild_id, snapshot.voice_channel, snapshot.deaf, snapshot.mute).await {
                tracing::debug!(?guild_id, "voice reconnect declined, dropping player");
                salad.destroy_player(guild_id).await;
                continue;
            }

            snapshot.apply(&player);
            restored += 1;
        }

        tracing::info!(restored, "restored players");
        Ok(restored)
    }

    /// Deletes the file. A missing file is fine.
    pub async fn clear_states(&self) -> Result<(), StateError> {
        match tokio::fs::remove_file(&self.path).await {
            Err(error) if error.kind() != ErrorKind::NotFound => Err(error.into()),
            _ => Ok(()),
        }
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

    use futures::FutureExt;
    use rstest::rstest;
    use twilight_model::id::Id;

    use super::{PlayerSnapshot, StateManager, resume};
    use crate::{
        client::test::started,
        config::SaladOptions,
        error::VoiceError,
        model::UpdatePlayer,
        player::{ConnectionOptions, Player, Registry, test::RecordingLink},
        queue::LoopMode,
        track::{Track, TrackData},
    };

    fn track(encoded: &str) -> Track {
        Track::new(
            TrackData {
                encoded: encoded.to_owned(),
                ..TrackData::default()
            },
            Some(Id::new(7)),
        )
    }

    fn snapshot(guild_id: u64) -> PlayerSnapshot {
        PlayerSnapshot {
            guild_id: Id::new(guild_id),
            voice_channel: Id::new(2),
            text_channel: Some(Id::new(3)),
            volume: 80,
            paused: false,
            position: 42_000,
            loop_mode: LoopMode::Queue,
            mute: false,
            deaf: true,
            current: Some(track("QAAA")),
            queue: vec![track("QBBB")],
        }
    }

    fn manager(dir: &tempfile::TempDir) -> StateManager {
        StateManager::new(dir.path().join("states.jsonl"), Duration::from_secs(5))
    }

    fn player(options: &ConnectionOptions) -> (Arc<Player>, Arc<Registry>) {
        let registry = Arc::new(Registry::default());
        let player = Player::new(
            options,
            RecordingLink::ready(),
            Arc::default(),
            Arc::downgrade(&registry),
        );
        (player, registry)
    }

    #[rstest]
    fn captures_queue_after_current() {
        let options = ConnectionOptions::new(Id::new(1))
            .voice_channel(Id::new(2))
            .volume(70);
        let (player, _registry) = player(&options);
        player.add_to_queue(track("QAAA"));
        player.add_to_queue(track("QBBB"));

        let snapshot = PlayerSnapshot::capture(&player).expect("in a voice channel");
        assert_eq!(snapshot.volume, 70);
        assert!(snapshot.current.is_none());
        assert_eq!(snapshot.queue.len(), 2);
        assert_eq!(snapshot.queue[0].requester(), Some(Id::new(7)));
    }

    #[rstest]
    fn skips_players_outside_voice() {
        let (player, _registry) = player(&ConnectionOptions::new(Id::new(1)));
        assert!(PlayerSnapshot::capture(&player).is_none());
    }

    #[rstest]
    fn wire_format_is_camel_case() {
        let json = serde_json::to_value(snapshot(1)).expect("serialisable");
        assert_eq!(json["guildId"], "1");
        assert_eq!(json["loopMode"], "queue");
        assert_eq!(json["voiceChannel"], "2");
        assert_eq!(json["queue"][0]["encoded"], "QBBB");
    }

    #[tokio::test]
    async fn saves_and_loads() {
        let dir = tempfile::tempdir().expect("temp dir");
        let manager = manager(&dir);

        assert_eq!(
            manager
                .write(&[snapshot(1), snapshot(2)])
                .await
                .expect("writable"),
            2
        );
        assert!(!manager.temp_path().exists());

        let loaded = manager.load_states().await.expect("readable");
        assert_eq!(loaded, [snapshot(1), snapshot(2)]);
    }

    #[tokio::test]
    async fn skips_malformed_lines() {
        let dir = tempfile::tempdir().expect("temp dir");
        let manager = manager(&dir);
        let good = serde_json::to_string(&snapshot(1)).expect("serialisable");
        tokio::fs::write(manager.path(), format!("{{oops\n\n{good}\n[]\n"))
            .await
            .expect("writable");

        assert_eq!(
            manager.load_states().await.expect("readable"),
            [snapshot(1)]
        );
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("temp dir");
        let manager = manager(&dir);
        assert!(manager.load_states().await.expect("readable").is_empty());
        manager.clear_states().await.expect("nothing to clear");
    }

    #[tokio::test]
    async fn clear_removes_the_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let manager = manager(&dir);
        manager.write(&[snapshot(1)]).await.expect("writable");

        manager.clear_states().await.expect("removable");
        assert!(!manager.path().exists());
    }

    #[tokio::test]
    async fn periodic_save_keeps_previous_run() {
        let dir = tempfile::tempdir().expect("temp dir");
        let previous = manager(&dir);
        previous.write(&[snapshot(1)]).await.expect("writable");

        let manager = manager(&dir);
        assert_eq!(manager.save_periodically(&[]).await.expect("writable"), 0);
        assert_eq!(manager.load_states().await.expect("readable").len(), 1);

        assert_eq!(manager.save_all_states(&[]).await.expect("writable"), 0);
        assert!(manager.load_states().await.expect("readable").is_empty());
    }

    #[tokio::test]
    async fn restores_through_the_callback() {
        let dir = tempfile::tempdir().expect("temp dir");
        let options = SaladOptions::builder()
            .state_file(dir.path().join("states.jsonl"))
            .build()
            .expect("all fields have defaults");
        let (salad, _node) = started(options);
        let state = salad.state_manager().expect("persistence enabled");
        state
            .write(&[snapshot(1), snapshot(2)])
            .await
            .expect("writable");

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        salad.set_voice_reconnect(move |guild_id, channel_id, deaf, _| {
            counted.fetch_add(1, Ordering::SeqCst);
            assert_eq!(channel_id, Id::new(2));
            assert!(deaf);
            futures::future::ready(guild_id == Id::new(1)).boxed()
        });

        assert_eq!(salad.restore_players().await.expect("readable"), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(salad.get_player(Id::new(2)).is_none());

        let player = salad.get_player(Id::new(1)).expect("restored");
        assert_eq!(player.volume(), 80);
        assert_eq!(player.loop_mode(), LoopMode::Queue);
        assert_eq!(player.text_channel(), Some(Id::new(3)));
        let queued = player.with_queue(|q| q.tracks());
        assert_eq!(
            queued.iter().map(Track::encoded).collect::<Vec<_>>(),
            ["QAAA", "QBBB"]
        );
    }

    #[tokio::test]
    async fn restore_needs_a_callback() {
        let dir = tempfile::tempdir().expect("temp dir");
        let options = SaladOptions::builder()
            .state_file(dir.path().join("states.jsonl"))
            .build()
            .expect("all fields have defaults");
        let (salad, _node) = started(options);
        let state = salad.state_manager().expect("persistence enabled");
        state.write(&[snapshot(1)]).await.expect("writable");

        assert_eq!(salad.restore_players().await.expect("readable"), 0);
        assert!(salad.players().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_waits_for_voice_then_restores_playback() {
        let link = RecordingLink::ready();
        let registry = Arc::new(Registry::default());
        let options = ConnectionOptions::new(Id::new(1)).voice_channel(Id::new(2));
        let player = Player::new(
            &options,
            link.clone(),
            Arc::default(),
            Arc::downgrade(&registry),
        );
        player.add_to_queue(track("QAAA"));

        let resumed = tokio::spawn(resume(player.clone(), 42_000, true));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(link.updates().is_empty());

        player.handle_voice_state_update(Some(Id::new(2)), "sid");
        player.handle_voice_server_update("tok", Some("ep"));
        resumed.await.expect("resume task").expect("voice came up");

        let updates = link
            .updates()
            .into_iter()
            .map(|(update, _)| update)
            .collect::<Vec<_>>();
        assert_eq!(
            &updates[1..],
            &[
                UpdatePlayer::play("QAAA", 100),
                UpdatePlayer::seek(42_000),
                UpdatePlayer::pause(true),
            ]
        );
        assert_eq!(player.position(), 42_000);
        assert!(player.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_gives_up_without_voice() {
        let options = ConnectionOptions::new(Id::new(1)).voice_channel(Id::new(2));
        let (player, _registry) = player(&options);
        player.add_to_queue(track("QAAA"));

        let error = resume(player.clone(), 0, false)
            .await
            .expect_err("voice never came up");
        assert!(matches!(error, VoiceError::NotConnected));
        assert!(player.current().is_none());
    }
}
