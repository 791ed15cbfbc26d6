use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::session::TrackPayload;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackEvent {
    pub title: String,
    pub artists: Vec<String>,
    pub explicit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub played_at: Option<DateTime<Utc>>,
}

/// Identity of a track for "now playing" comparisons: title plus the joined artist line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlaybackSignature {
    title: String,
    artists: String,
}

impl PlaybackSignature {
    pub fn new(title: impl Into<String>, artists: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artists: artists.into(),
        }
    }
}

impl TrackEvent {
    pub fn artist_line(&self) -> String {
        self.artists.join(" ")
    }

    pub fn signature(&self) -> PlaybackSignature {
        PlaybackSignature::new(self.title.clone(), self.artist_line())
    }
}

impl fmt::Display for TrackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.title, self.artist_line())
    }
}

pub fn normalize(track: &TrackPayload, played_at: Option<DateTime<Utc>>) -> TrackEvent {
    TrackEvent {
        title: track.title.trim().to_string(),
        artists: track
            .artists
            .iter()
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect(),
        explicit: track.explicit,
        played_at,
    }
}
