use std::sync::Mutex;

use reqwest::{
    Method, StatusCode,
    header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue},
};
use serde::de::DeserializeOwned;
use twilight_model::id::{
    Id,
    marker::{GuildMarker, UserMarker},
};

use crate::{
    config::NodeConfig,
    error::RestError,
    model::{LoadResponse, NodeInfo, PlayerInfo, UpdatePlayer},
    sync::lock,
};

const USER_ID: HeaderName = HeaderName::from_static("user-id");
const CLIENT_NAME: HeaderName = HeaderName::from_static("client-name");

fn player_path(session_id: &str, guild_id: Id<GuildMarker>) -> String {
    format!("/v4/sessions/{session_id}/players/{guild_id}")
}

/// The REST half of one Lavalink node.
#[derive(Debug)]
pub struct Rest {
    client: reqwest::Client,
    base_url: String,
    headers: Mutex<HeaderMap>,
}

impl Rest {
    pub fn new(config: &NodeConfig, client_name: &str) -> Result<Self, RestError> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&config.auth)?);
        headers.insert(CLIENT_NAME, HeaderValue::from_str(client_name)?);

        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url: config.rest_url(),
            headers: Mutex::new(headers),
        })
    }

    pub fn set_user_id(&self, user_id: Id<UserMarker>) {
        lock(&self.headers).insert(USER_ID, HeaderValue::from(user_id.get()));
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let headers = lock(&self.headers).clone();
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .headers(headers)
    }

    fn unexpected(method: Method, path: &str, status: StatusCode) -> RestError {
        RestError::Status {
            method,
            path: path.to_owned(),
            status,
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RestError> {
        let response = self.request(Method::GET, path).send().await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            status => Err(Self::unexpected(Method::GET, path, status)),
        }
    }

    pub async fn info(&self) -> Result<NodeInfo, RestError> {
        self.get("/v4/info").await
    }

    /// Resolves `identifier`, a search such as `ytsearch:...` or a URL.
    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResponse, RestError> {
        const PATH: &str = "/v4/loadtracks";

        tracing::trace!(identifier, "loading tracks");
        let response = self
            .request(Method::GET, PATH)
            .query(&[("identifier", identifier)])
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            status => Err(Self::unexpected(Method::GET, PATH, status)),
        }
    }

    /// Patches the guild's player. `Ok(None)` means Lavalink sent no usable player back.
    pub async fn update_player(
        &self,
        session_id: &str,
        guild_id: Id<GuildMarker>,
        update: &UpdatePlayer,
        no_replace: bool,
    ) -> Result<Option<PlayerInfo>, RestError> {
        let path = player_path(session_id, guild_id);
        tracing::trace!(?guild_id, ?update, no_replace, "updating player");

        let response = self
            .request(Method::PATCH, &path)
            .query(&[("noReplace", no_replace)])
            .json(update)
            .send()
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(response.json().await.ok()),
            StatusCode::NO_CONTENT => Ok(None),
            status => Err(Self::unexpected(Method::PATCH, &path, status)),
        }
    }

    pub async fn get_player(
        &self,
        session_id: &str,
        guild_id: Id<GuildMarker>,
    ) -> Result<PlayerInfo, RestError> {
        self.get(&player_path(session_id, guild_id)).await
    }

    pub async fn destroy_player(
        &self,
        session_id: &str,
        guild_id: Id<GuildMarker>,
    ) -> Result<(), RestError> {
        let path = player_path(session_id, guild_id);
        let response = self.request(Method::DELETE, &path).send().await?;
        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            status => Err(Self::unexpected(Method::DELETE, &path, status)),
        }
    }
}
