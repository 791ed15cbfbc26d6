use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::auth::{self, TOKEN_URL, TokenSet, load_tokens, save_tokens, token_path};
use crate::config::Account;
use crate::error::{Error, Result};
use crate::session::{HistoryPage, PlayedItem, Playback, RemoteSession, SessionProvider, TrackPayload};
use crate::watermark::Watermark;

pub const API_BASE: &str = "https://api.spotify.com/v1";

#[derive(Debug, Clone)]
pub struct SpotifyClient {
    http: Client,
    api_base: String,
    token_url: String,
}

impl SpotifyClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| Error::Config(format!("failed building HTTP client: {err}")))?;
        Ok(Self {
            http,
            api_base: API_BASE.to_string(),
            token_url: TOKEN_URL.to_string(),
        })
    }

    #[cfg(test)]
    pub fn with_endpoints(mut self, api_base: &str, token_url: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.token_url = token_url.to_string();
        self
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    /// `Ok(None)` for 204 No Content and empty bodies.
    async fn get<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        access_token: &str,
    ) -> Result<Option<T>> {
        let mut request = self.http.get(url).bearer_auth(access_token);
        if !query.is_empty() {
            request = request.query(query);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(Error::from_status(status.as_u16(), &text));
        }
        if status == StatusCode::NO_CONTENT || text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&text)?))
    }
}

#[derive(Debug, Deserialize)]
struct CurrentlyPlayingResponse {
    #[serde(default)]
    is_playing: bool,
    #[serde(default)]
    item: Option<SpotifyItem>,
}

#[derive(Debug, Deserialize)]
struct SpotifyItem {
    name: String,
    #[serde(default)]
    artists: Vec<SpotifyArtist>,
    #[serde(default)]
    explicit: bool,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpotifyArtist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RecentlyPlayedResponse {
    #[serde(default)]
    items: Vec<PlayHistoryEntry>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlayHistoryEntry {
    track: SpotifyItem,
    played_at: DateTime<Utc>,
}

impl SpotifyItem {
    fn into_track(self) -> Option<TrackPayload> {
        if self.kind.as_deref().is_some_and(|kind| kind != "track") {
            return None;
        }
        Some(TrackPayload {
            title: self.name,
            artists: self.artists.into_iter().map(|artist| artist.name).collect(),
            explicit: self.explicit,
        })
    }
}

impl From<RecentlyPlayedResponse> for HistoryPage {
    fn from(response: RecentlyPlayedResponse) -> Self {
        let items = response
            .items
            .into_iter()
            .filter_map(|entry| {
                let played_at = entry.played_at;
                entry
                    .track
                    .into_track()
                    .map(|track| PlayedItem { track, played_at })
            })
            .collect();
        HistoryPage {
            items,
            next_cursor: response.next,
        }
    }
}

/// One account's authenticated handle. The access token is refreshed, and the
/// token cache rewritten, whenever it is about to expire.
#[derive(Debug)]
pub struct SpotifySession {
    client: SpotifyClient,
    account: Account,
    token_path: PathBuf,
    tokens: Mutex<TokenSet>,
}

impl SpotifySession {
    pub fn new(client: SpotifyClient, account: Account, token_path: PathBuf, tokens: TokenSet) -> Self {
        Self {
            client,
            account,
            token_path,
            tokens: Mutex::new(tokens),
        }
    }

    async fn access_token(&self) -> Result<String> {
        let mut tokens = self.tokens.lock().await;
        if tokens.is_expired(Utc::now()) {
            debug!(account = self.account.username.as_str(), "Refreshing access token");
            let refreshed = auth::refresh(
                self.client.http(),
                self.client.token_url(),
                &self.account,
                &tokens,
            )
            .await?;
            let path = self.token_path.clone();
            let cached = refreshed.clone();
            let saved = tokio::task::spawn_blocking(move || save_tokens(&path, &cached))
                .await
                .map_err(anyhow::Error::from)
                .and_then(|saved| saved);
            if let Err(err) = saved {
                warn!(
                    account = self.account.username.as_str(),
                    "Keeping refreshed token in memory only: {err:#}"
                );
            }
            *tokens = refreshed;
        }
        Ok(tokens.access_token.clone())
    }
}

#[async_trait]
impl RemoteSession for SpotifySession {
    async fn currently_playing(&self) -> Result<Playback> {
        let token = self.access_token().await?;
        let url = format!("{}/me/player/currently-playing", self.client.api_base);
        let response: Option<CurrentlyPlayingResponse> = self.client.get(&url, &[], &token).await?;
        let Some(response) = response else {
            return Ok(Playback::idle());
        };
        Ok(Playback {
            is_playing: response.is_playing,
            track: response.item.and_then(SpotifyItem::into_track),
        })
    }

    async fn recently_played(&self, after: Option<Watermark>, limit: u32) -> Result<HistoryPage> {
        let token = self.access_token().await?;
        let url = format!("{}/me/player/recently-played", self.client.api_base);
        let mut query = vec![("limit", limit.to_string())];
        if let Some(after) = after {
            query.push(("after", after.unix_millis().to_string()));
        }
        let response: Option<RecentlyPlayedResponse> = self.client.get(&url, &query, &token).await?;
        Ok(response.map(HistoryPage::from).unwrap_or_default())
    }

    async fn next_page(&self, cursor: &str) -> Result<HistoryPage> {
        let token = self.access_token().await?;
        let response: Option<RecentlyPlayedResponse> = self.client.get(cursor, &[], &token).await?;
        Ok(response.map(HistoryPage::from).unwrap_or_default())
    }
}

/// Lazily opens one `SpotifySession` per configured account and keeps it for
/// the lifetime of the process.
pub struct SpotifySessions {
    client: SpotifyClient,
    accounts: HashMap<String, Account>,
    token_dir: PathBuf,
    sessions: Mutex<HashMap<String, Arc<SpotifySession>>>,
}

impl SpotifySessions {
    pub fn new(
        client: SpotifyClient,
        accounts: impl IntoIterator<Item = Account>,
        token_dir: PathBuf,
    ) -> Self {
        Self {
            client,
            accounts: accounts
                .into_iter()
                .map(|account| (account.username.clone(), account))
                .collect(),
            token_dir,
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SessionProvider for SpotifySessions {
    type Session = SpotifySession;

    async fn session(&self, username: &str) -> Result<Arc<SpotifySession>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(username) {
            return Ok(session.clone());
        }
        let account = self
            .accounts
            .get(username)
            .ok_or_else(|| Error::Auth(format!("account {username} is not configured")))?;
        let path = token_path(&self.token_dir, username);
        let tokens = tokio::task::spawn_blocking({
            let path = path.clone();
            move || load_tokens(&path)
        })
        .await
        .map_err(|err| Error::Auth(format!("token cache worker failed: {err}")))?
        .map_err(|err| Error::Auth(format!("{err:#}")))?
        .ok_or_else(|| {
            Error::Auth(format!(
                "{username} is not authorized yet, run `turntable login --username {username}`"
            ))
        })?;
        let session = Arc::new(SpotifySession::new(
            self.client.clone(),
            account.clone(),
            path,
            tokens,
        ));
        sessions.insert(username.to_string(), session.clone());
        debug!(account = username, "Opened session");
        Ok(session)
    }
}
