use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use twilight_model::id::{
    Id,
    marker::{ChannelMarker, GuildMarker},
};

use super::{BoxError, Player};
use crate::{
    error::VoiceError, event::Event, konst, model::UpdatePlayer, sync::lock, traced,
};

/// A debugging snapshot of a player's voice connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceStatus {
    pub connected: bool,
    /// Whether the session id, token and endpoint are all known.
    pub ready: bool,
    pub channel_id: Option<Id<ChannelMarker>>,
    pub session_id: Option<String>,
    pub has_token: bool,
    pub has_endpoint: bool,
    pub connect_attempts: u32,
}

impl Player {
    /// Registers how to disconnect the bot from voice on the Discord side.
    pub fn set_voice_cleanup(
        &self,
        cleanup: impl Fn(Id<GuildMarker>) -> BoxFuture<'static, Result<(), BoxError>>
        + Send
        + Sync
        + 'static,
    ) {
        *lock(&self.voice_cleanup) = Some(Arc::new(cleanup));
    }

    pub fn is_voice_ready(&self) -> bool {
        lock(&self.state).voice.complete().is_some()
    }

    pub fn voice_state(&self) -> VoiceStatus {
        let state = lock(&self.state);
        VoiceStatus {
            connected: self.is_connected(),
            ready: state.voice.complete().is_some(),
            channel_id: state.voice_channel,
            session_id: state.voice.session_id.clone(),
            has_token: state.voice.token.is_some(),
            has_endpoint: state.voice.endpoint.is_some(),
            connect_attempts: state.connect_attempts,
        }
    }

    /// Forgets every voice credential so the next pair of gateway updates starts fresh.
    pub fn reset_voice_state(&self) {
        lock(&self.state).reset_voice();
        self.connected.send_replace(false);
    }

    /// Records an attempt to join `voice_channel`, or the last known channel.
    ///
    /// A destroyed player is revived and routed to again.
    pub fn connect(&self, voice_channel: Option<Id<ChannelMarker>>) {
        let revived = {
            let mut state = lock(&self.state);
            let Some(channel_id) = voice_channel.or(state.voice_channel) else {
                return;
            };
            state.voice_channel = Some(channel_id);

            let revived = state.destroyed;
            if revived {
                state.destroyed = false;
                state.destroying = false;
                state.clear_current();
                state.paused = false;
                state.reset_voice();
            }
            state.connect_attempts += 1;
            revived
        };

        if revived {
            tracing::debug!(guild_id = ?self.guild_id, "reviving destroyed player");
            self.connected.send_replace(false);
            lock(&self.queue).reopen();
            self.attach();
        }
        self.emit(|player| Event::PlayerConnect { player });
    }

    pub fn handle_voice_state_update(
        &self,
        channel_id: Option<Id<ChannelMarker>>,
        session_id: &str,
    ) {
        {
            let mut state = lock(&self.state);
            if state.inactive() {
                return;
            }
            if !session_id.is_empty() {
                state.voice.session_id = Some(session_id.to_owned());
            }
            state.voice_channel = channel_id;
        }
        if channel_id.is_none() {
            self.connected.send_replace(false);
        }

        self.schedule_voice_dispatch();
        self.emit(|player| Event::PlayerVoiceStateUpdate {
            player,
            channel_id,
            session_id: session_id.to_owned(),
        });
    }

    /// `endpoint` is `None` while Discord is moving the call to another voice server.
    pub fn handle_voice_server_update(&self, token: &str, endpoint: Option<&str>) {
        {
            let mut state = lock(&self.state);
            if state.inactive() {
                return;
            }
            state.voice.token = Some(token.to_owned());
            state.voice.endpoint = endpoint.map(str::to_owned);
        }

        self.schedule_voice_dispatch();
        self.emit(|player| Event::PlayerVoiceServerUpdate {
            player,
            endpoint: endpoint.map(str::to_owned),
        });
    }

    /// Sends the voice credentials once they settle, replacing any dispatch still pending.
    pub(super) fn schedule_voice_dispatch(&self) {
        if self.is_inactive() {
            return;
        }
        let Some(player) = self.weak.upgrade() else {
            return;
        };

        let mut task = lock(&self.voice_task);
        if let Some(pending) = task.take() {
            pending.abort();
        }
        *task = Some(traced::spawn(async move {
            tokio::time::sleep(konst::player::VOICE_UPDATE_DEBOUNCE).await;
            player.dispatch_voice().await;
        }));
    }

    pub(super) fn cancel_voice_dispatch(&self) {
        if let Some(pending) = lock(&self.voice_task).take() {
            pending.abort();
        }
    }

    async fn dispatch_voice(&self) {
        let (voice, volume) = {
            let state = lock(&self.state);
            if state.inactive() {
                return;
            }
            let Some(voice) = state.voice.complete() else {
                return;
            };
            if state.last_voice.as_ref() == Some(&voice) {
                return;
            }
            (voice, state.volume)
        };
        if self.link.session_id().is_none() {
            tracing::trace!(guild_id = ?self.guild_id, "node not ready, holding voice update");
            return;
        }

        let update = UpdatePlayer::voice(voice.clone(), volume);
        match self.update(&update, true).await {
            Ok(()) => {
                lock(&self.state).last_voice = Some(voice);
                self.connected.send_replace(true);
                tracing::debug!(guild_id = ?self.guild_id, "voice update sent");
                self.emit(|player| Event::PlayerVoiceUpdate { player });
            }
            Err(error) => {
                self.connected.send_replace(false);
                self.voice_error(VoiceError::Dispatch(Arc::new(error)));
            }
        }
    }

    pub(super) fn voice_error(&self, error: VoiceError) {
        tracing::debug!(guild_id = ?self.guild_id, %error, "voice error");
        self.emit(|player| Event::PlayerVoiceError { player, error });
    }

    /// Runs the registered voice cleanup, reporting a failure as a voice error.
    pub(super) async fn run_voice_cleanup(&self) -> bool {
        let cleanup = lock(&self.voice_cleanup).clone();
        let Some(cleanup) = cleanup else {
            return true;
        };
        match cleanup(self.guild_id).await {
            Ok(()) => true,
            Err(error) => {
                self.voice_error(VoiceError::Cleanup(Arc::new(error)));
                false
            }
        }
    }

    /// Resets voice and asks the bot to leave the call, so that joining again starts clean.
    pub async fn reconnect(&self) -> bool {
        if self.is_inactive() {
            return false;
        }
        self.reset_voice_state();
        if !self.run_voice_cleanup().await {
            return false;
        }
        self.emit(|player| Event::PlayerReconnect { player });
        true
    }

    /// Waits until Lavalink accepts this player's voice credentials. `false` on timeout.
    pub async fn wait_until_connected(&self, timeout: Duration) -> bool {
        let mut connected = self.connected.subscribe();
        tokio::time::timeout(timeout, connected.wait_for(|c| *c))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}
