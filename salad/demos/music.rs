//! A small music bot on top of `salad`.
//!
//! Reads `BOT_TOKEN` and `LAVALINK_{HOST,PORT,PASSWORD,SSL}` from the environment (or `.env`) and
//! answers `!play <query>`, `!skip`, `!pause`, `!resume`, `!stop` and `!leave` in guild channels.

use std::{
    collections::HashMap,
    env,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::FutureExt;
use salad::{ConnectionOptions, NodeConfig, Salad, SaladOptions, SearchSource, model::LoadType};
use tokio::sync::broadcast::error::RecvError;
use twilight_gateway::{
    CloseFrame, Event, EventTypeFlags, Intents, MessageSender, Shard, ShardId, StreamExt,
};
use twilight_model::{
    channel::Message,
    gateway::payload::outgoing::UpdateVoiceState,
    id::{
        Id,
        marker::{ChannelMarker, GuildMarker, UserMarker},
    },
};

const INTENTS: Intents = Intents::GUILDS
    .union(Intents::GUILD_VOICE_STATES)
    .union(Intents::GUILD_MESSAGES)
    .union(Intents::MESSAGE_CONTENT);
const VOICE_TIMEOUT: Duration = Duration::from_secs(10);

type VoiceChannels = Mutex<HashMap<(Id<GuildMarker>, Id<UserMarker>), Id<ChannelMarker>>>;

struct Bot {
    salad: Salad,
    sender: MessageSender,
    voice_channels: VoiceChannels,
}

fn node_config() -> color_eyre::Result<NodeConfig> {
    let mut config = NodeConfig::default();
    if let Ok(host) = env::var("LAVALINK_HOST") {
        config.host = host;
    }
    if let Ok(port) = env::var("LAVALINK_PORT") {
        config.port = port.parse()?;
    }
    if let Ok(auth) = env::var("LAVALINK_PASSWORD") {
        config.auth = auth;
    }
    if let Ok(ssl) = env::var("LAVALINK_SSL") {
        config.ssl = ssl.parse()?;
    }
    Ok(config)
}

fn join_voice(
    sender: &MessageSender,
    guild_id: Id<GuildMarker>,
    channel_id: Option<Id<ChannelMarker>>,
    deaf: bool,
    mute: bool,
) -> bool {
    match sender.command(&UpdateVoiceState::new(guild_id, channel_id, deaf, mute)) {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(?guild_id, %error, "failed to send voice state update");
            false
        }
    }
}

impl Bot {
    fn new(salad: Salad, sender: MessageSender) -> Arc<Self> {
        let reconnect_sender = sender.clone();
        salad.set_voice_reconnect(move |guild_id, channel_id, deaf, mute| {
            let joined = join_voice(&reconnect_sender, guild_id, Some(channel_id), deaf, mute);
            futures::future::ready(joined).boxed()
        });

        Arc::new(Self {
            salad,
            sender,
            voice_channels: Mutex::new(HashMap::new()),
        })
    }

    fn voice_channel_of(
        &self,
        guild_id: Id<GuildMarker>,
        user_id: Id<UserMarker>,
    ) -> Option<Id<ChannelMarker>> {
        self.voice_channels
            .lock()
            .ok()?
            .get(&(guild_id, user_id))
            .copied()
    }

    fn handle(self: &Arc<Self>, event: Event) {
        match event {
            Event::Ready(ready) => {
                let bot = self.clone();
                let user_id = ready.user.id;
                tokio::spawn(async move { bot.start(user_id).await });
            }
            Event::VoiceStateUpdate(update) => {
                let Some(guild_id) = update.guild_id else {
                    return;
                };
                let Ok(mut channels) = self.voice_channels.lock() else {
                    return;
                };
                match update.channel_id {
                    Some(channel_id) => channels.insert((guild_id, update.user_id), channel_id),
                    None => channels.remove(&(guild_id, update.user_id)),
                };
            }
            Event::MessageCreate(message) if !message.author.bot => {
                let bot = self.clone();
                tokio::spawn(async move { bot.command(&message).await });
            }
            _ => {}
        }
    }

    async fn start(&self, user_id: Id<UserMarker>) {
        let config = match node_config() {
            Ok(config) => config,
            Err(error) => {
                tracing::error!(%error, "invalid lavalink config");
                return;
            }
        };
        if let Err(error) = self.salad.start([config], user_id).await {
            tracing::error!(%error, "failed to start salad");
            return;
        }
        match self.salad.restore_players().await {
            Ok(restored) => tracing::info!(restored, "restored players"),
            Err(error) => tracing::warn!(%error, "failed to restore players"),
        }
    }

    async fn command(&self, message: &Message) {
        let Some(guild_id) = message.guild_id else {
            return;
        };
        let (command, argument) = message
            .content
            .split_once(' ')
            .unwrap_or((message.content.as_str(), ""));
        let player = self.salad.get_player(guild_id);

        match (command, player) {
            ("!play", _) => self.play(message, guild_id, argument).await,
            ("!skip", Some(player)) => player.skip().await,
            ("!pause", Some(player)) => player.pause().await,
            ("!resume", Some(player)) => player.resume().await,
            ("!stop", Some(player)) => player.stop().await,
            ("!leave", Some(_)) => self.salad.destroy_player(guild_id).await,
            _ => {}
        }
    }

    async fn play(&self, message: &Message, guild_id: Id<GuildMarker>, query: &str) {
        let Some(channel_id) = self.voice_channel_of(guild_id, message.author.id) else {
            tracing::info!(?guild_id, "requester is not in a voice channel");
            return;
        };

        let options = ConnectionOptions::new(guild_id)
            .voice_channel(channel_id)
            .text_channel(message.channel_id);
        let player = match self.salad.create_connection(options) {
            Ok(player) => player,
            Err(error) => {
                tracing::warn!(%error, "failed to create a player");
                return;
            }
        };
        let cleanup_sender = self.sender.clone();
        player.set_voice_cleanup(move |guild_id| {
            join_voice(&cleanup_sender, guild_id, None, false, false);
            futures::future::ready(Ok(())).boxed()
        });
        if !player.is_connected() {
            join_voice(&self.sender, guild_id, Some(channel_id), options.deaf, options.mute);
        }

        let result = match self
            .salad
            .resolve(query, SearchSource::YouTube, Some(message.author.id))
            .await
        {
            Ok(result) => result,
            Err(error) => {
                tracing::warn!(%error, "failed to resolve");
                return;
            }
        };
        let tracks = match result.load_type {
            LoadType::Playlist => result.tracks,
            _ => result.tracks.into_iter().take(1).collect(),
        };
        if tracks.is_empty() {
            tracing::info!(query, "nothing found");
            return;
        }
        for track in tracks {
            player.add_to_queue(track);
        }

        if !player.is_playing() && player.wait_until_connected(VOICE_TIMEOUT).await {
            player.play().await;
        }
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("a crypto provider was already installed");
    }

    let mut shard = Shard::new(ShardId::ONE, env::var("BOT_TOKEN")?, INTENTS);
    let salad = Salad::new(SaladOptions::default());
    let bot = Bot::new(salad.clone(), shard.sender());

    let mut events = salad.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let guild_id = event.player().map(|p| p.guild_id());
                    tracing::info!(event = %event.kind(), ?guild_id, "salad event");
                }
                Err(RecvError::Lagged(missed)) => tracing::warn!(missed, "event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            item = shard.next_event(EventTypeFlags::all()) => {
                let event = match item {
                    Some(Ok(event)) => event,
                    Some(Err(source)) => {
                        tracing::warn!(?source, "error receiving event");
                        continue;
                    }
                    None => break,
                };
                salad.process(&event);
                bot.handle(event);
            }
        }
    }

    tracing::info!("shutting down");
    salad.stop().await;
    let _ = shard.sender().close(CloseFrame::NORMAL);
    Ok(())
}
