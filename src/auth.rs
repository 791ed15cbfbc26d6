use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::Account;
use crate::error::{Error, Result};

pub const AUTHORIZE_URL: &str = "https://accounts.spotify.com/authorize";
pub const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
pub const SCOPES: &str =
    "user-read-recently-played user-read-currently-playing user-read-playback-state";

const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenSet {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now + TimeDelta::seconds(EXPIRY_MARGIN_SECS) >= self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

pub fn authorize_url(account: &Account) -> Result<Url> {
    Url::parse_with_params(
        AUTHORIZE_URL,
        &[
            ("client_id", account.client_id.as_str()),
            ("response_type", "code"),
            ("redirect_uri", account.redirect_uri.as_str()),
            ("scope", SCOPES),
        ],
    )
    .map_err(|err| Error::Config(format!("invalid authorization URL: {err}")))
}

/// Accepts the URL the browser was redirected to, or just the code it carries.
pub fn code_from_redirect(input: &str) -> Result<String> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::Auth("no authorization code given".to_string()));
    }
    let Ok(url) = Url::parse(input) else {
        return Ok(input.to_string());
    };
    let mut code = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "error" => return Err(Error::Auth(format!("authorization denied: {value}"))),
            _ => {}
        }
    }
    code.ok_or_else(|| Error::Auth("redirect URL carries no code".to_string()))
}

pub async fn exchange_code(
    http: &Client,
    token_url: &str,
    account: &Account,
    code: &str,
) -> Result<TokenSet> {
    let params = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", account.redirect_uri.as_str()),
    ];
    let response = request_token(http, token_url, account, &params).await?;
    let refresh_token = response
        .refresh_token
        .clone()
        .ok_or_else(|| Error::Auth("token response carries no refresh token".to_string()))?;
    Ok(token_set(response, refresh_token))
}

pub async fn refresh(
    http: &Client,
    token_url: &str,
    account: &Account,
    previous: &TokenSet,
) -> Result<TokenSet> {
    let params = [
        ("grant_type", "refresh_token"),
        ("refresh_token", previous.refresh_token.as_str()),
    ];
    let response = request_token(http, token_url, account, &params).await?;
    let refresh_token = response
        .refresh_token
        .clone()
        .unwrap_or_else(|| previous.refresh_token.clone());
    Ok(token_set(response, refresh_token))
}

async fn request_token(
    http: &Client,
    token_url: &str,
    account: &Account,
    params: &[(&str, &str)],
) -> Result<TokenResponse> {
    let response = http
        .post(token_url)
        .basic_auth(&account.client_id, Some(&account.client_secret))
        .form(params)
        .send()
        .await?;
    let status = response.status();
    let text = response.text().await?;
    if status.is_success() {
        return Ok(serde_json::from_str(&text)?);
    }
    match serde_json::from_str::<TokenError>(&text) {
        Ok(err) if status.is_client_error() => Err(Error::Auth(format!(
            "{}: {}",
            err.error,
            err.error_description.unwrap_or_default()
        ))),
        _ => Err(Error::from_status(status.as_u16(), &text)),
    }
}

fn token_set(response: TokenResponse, refresh_token: String) -> TokenSet {
    TokenSet {
        access_token: response.access_token,
        refresh_token,
        expires_at: Utc::now() + TimeDelta::seconds(response.expires_in),
        scope: response.scope,
    }
}

pub fn token_path(dir: &Path, username: &str) -> PathBuf {
    let file: String = username
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect();
    dir.join(format!("{file}.json"))
}

pub fn load_tokens(path: &Path) -> anyhow::Result<Option<TokenSet>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed reading token cache at {}", path.display()))?;
    let tokens = serde_json::from_str(&raw)
        .with_context(|| format!("Failed parsing token cache at {}", path.display()))?;
    Ok(Some(tokens))
}

pub fn save_tokens(path: &Path, tokens: &TokenSet) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed creating token directory {}", parent.display()))?;
    }
    let serialized =
        serde_json::to_string_pretty(tokens).context("Failed serializing token cache")?;
    fs::write(path, format!("{serialized}\n"))
        .with_context(|| format!("Failed writing token cache at {}", path.display()))?;
    Ok(())
}
