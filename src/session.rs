//! The per-account capability the monitor core polls through.
//!
//! `service.rs` implements it against the Spotify Web API; tests use the
//! scripted fakes in `testing.rs`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::watermark::Watermark;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackPayload {
    pub title: String,
    pub artists: Vec<String>,
    pub explicit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayedItem {
    pub track: TrackPayload,
    pub played_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub items: Vec<PlayedItem>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Playback {
    pub is_playing: bool,
    pub track: Option<TrackPayload>,
}

impl Playback {
    pub fn idle() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn playing(track: TrackPayload) -> Self {
        Self {
            is_playing: true,
            track: Some(track),
        }
    }
}

#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn currently_playing(&self) -> Result<Playback>;

    /// First page of the listening history, limited to items played after `after`.
    async fn recently_played(&self, after: Option<Watermark>, limit: u32) -> Result<HistoryPage>;

    async fn next_page(&self, cursor: &str) -> Result<HistoryPage>;
}

/// Hands out the authenticated session of an account. Implementations keep one
/// session per account for the lifetime of the process.
#[async_trait]
pub trait SessionProvider: Send + Sync + 'static {
    type Session: RemoteSession + 'static;

    async fn session(&self, account: &str) -> Result<Arc<Self::Session>>;
}

/// Runs one remote call, failing with `Error::Remote` once `limit` elapses.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or_else(|_| Err(Error::timeout(limit)))
}
