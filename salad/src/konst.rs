pub mod node {
    use std::time::Duration;

    pub const WS_PATH: &str = "v4/websocket";
    pub const DEFAULT_HOST: &str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 8000;
    pub const DEFAULT_AUTH: &str = "youshallnotpass";
    pub const READY_TIMEOUT: Duration = Duration::from_secs(5);
    /// Discord voice close code sent when the bot was disconnected from the channel.
    pub const VOICE_CLOSE_DISCONNECTED: u16 = 4014;
}

pub mod reconnect {
    use std::time::Duration;

    pub const MAX_ATTEMPTS: u32 = 5;
    pub const BASE_DELAY: Duration = Duration::from_secs(1);
    pub const MAX_DELAY: Duration = Duration::from_secs(30);
}

pub mod player {
    use std::time::Duration;

    pub const VOICE_UPDATE_DEBOUNCE: Duration = Duration::from_millis(50);
    pub const NEXT_TRACK_DELAY: Duration = Duration::from_millis(100);
    pub const RESUME_VOICE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_VOLUME: u16 = 100;
    pub const MAX_VOLUME: u16 = 1000;
}

pub mod queue {
    pub const PREVIOUS_LIMIT: usize = 10;
}

pub mod client {
    pub const CLIENT_NAME: &str = concat!("Salad/v", env!("CARGO_PKG_VERSION"));
    pub const MAX_LISTENERS: usize = 1000;
    pub const EVENT_CHANNEL_CAPACITY: usize = 0xFF;
}

pub mod state {
    use std::time::Duration;

    pub const STATE_FILE: &str = "player_states.jsonl";
    pub const SAVE_INTERVAL: Duration = Duration::from_secs(5);
}
