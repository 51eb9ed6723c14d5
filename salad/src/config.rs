use std::{path::PathBuf, time::Duration};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::konst;

/// Where a Lavalink node lives and how to authenticate with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Display name used in logs and events; defaults to `host:port`.
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    /// The node password, sent as the `Authorization` header.
    pub auth: String,
    pub ssl: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: None,
            host: String::from(konst::node::DEFAULT_HOST),
            port: konst::node::DEFAULT_PORT,
            auth: String::from(konst::node::DEFAULT_AUTH),
            ssl: false,
        }
    }
}

impl NodeConfig {
    pub fn new(host: impl Into<String>, port: u16, auth: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            auth: auth.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port))
    }

    pub fn rest_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.ssl { "wss" } else { "ws" };
        format!(
            "{scheme}://{}:{}/{}",
            self.host,
            self.port,
            konst::node::WS_PATH
        )
    }
}

#[derive(Builder, Debug, Clone)]
#[builder(setter(into), pattern = "owned", default)]
pub struct SaladOptions {
    /// Reconnect to a node after its websocket drops.
    pub enable_reconnect: bool,
    /// Ignore `max_reconnect_attempts` and keep retrying forever.
    pub infinite_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub base_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Periodically write player snapshots to `state_file` so they can be restored.
    pub enable_state_persistence: bool,
    pub state_file: PathBuf,
    pub state_save_interval: Duration,
    pub client_name: String,
    /// Listener cap per event kind.
    pub max_listeners: usize,
}

impl Default for SaladOptions {
    fn default() -> Self {
        Self {
            enable_reconnect: true,
            infinite_reconnect: false,
            max_reconnect_attempts: konst::reconnect::MAX_ATTEMPTS,
            base_reconnect_delay: konst::reconnect::BASE_DELAY,
            max_reconnect_delay: konst::reconnect::MAX_DELAY,
            enable_state_persistence: true,
            state_file: PathBuf::from(konst::state::STATE_FILE),
            state_save_interval: konst::state::SAVE_INTERVAL,
            client_name: String::from(konst::client::CLIENT_NAME),
            max_listeners: konst::client::MAX_LISTENERS,
        }
    }
}

impl SaladOptions {
    pub fn builder() -> SaladOptionsBuilder {
        SaladOptionsBuilder::default()
    }

    /// Exponential backoff for the `attempt`th reconnect, capped at `max_reconnect_delay`.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        2_u32
            .checked_pow(attempt)
            .map_or(self.max_reconnect_delay, |factor| {
                self.base_reconnect_delay.saturating_mul(factor)
            })
            .min(self.max_reconnect_delay)
    }

    pub const fn may_reconnect(&self, attempt: u32) -> bool {
        self.enable_reconnect && (self.infinite_reconnect || attempt <= self.max_reconnect_attempts)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use rstest::rstest;

    use super::{NodeConfig, SaladOptions};

    #[rstest]
    #[case(1, Duration::from_secs(2))]
    #[case(2, Duration::from_secs(4))]
    #[case(4, Duration::from_secs(16))]
    #[case(5, Duration::from_secs(30))]
    #[case(40, Duration::from_secs(30))]
    fn reconnect_delay(#[case] attempt: u32, #[case] expected: Duration) {
        assert_eq!(SaladOptions::default().reconnect_delay(attempt), expected);
    }

    #[rstest]
    #[case(false, 5, true)]
    #[case(false, 6, false)]
    #[case(true, 600, true)]
    fn may_reconnect(#[case] infinite: bool, #[case] attempt: u32, #[case] expected: bool) {
        let options = SaladOptions::builder()
            .infinite_reconnect(infinite)
            .build()
            .expect("all fields have defaults");
        assert_eq!(options.may_reconnect(attempt), expected);
    }

    #[rstest]
    fn disabled_reconnect() {
        let options = SaladOptions::builder()
            .enable_reconnect(false)
            .infinite_reconnect(true)
            .build()
            .expect("all fields have defaults");
        assert!(!options.may_reconnect(1));
    }

    #[rstest]
    #[case(false, "http://lava.local:2333", "ws://lava.local:2333/v4/websocket")]
    #[case(true, "https://lava.local:2333", "wss://lava.local:2333/v4/websocket")]
    fn urls(#[case] ssl: bool, #[case] rest: &str, #[case] ws: &str) {
        let config = NodeConfig::new("lava.local", 2333, "pw").with_ssl(ssl);
        assert_eq!(config.rest_url(), rest);
        assert_eq!(config.ws_url(), ws);
        assert_eq!(config.name(), "lava.local:2333");
    }

    #[rstest]
    fn partial_config_uses_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"host":"10.0.0.2","ssl":true}"#).expect("valid config");
        assert_eq!(config.port, 8000);
        assert_eq!(config.auth, "youshallnotpass");
        assert!(config.ssl);
    }
}
