//! Scripted in-memory stand-ins for the remote service, shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::session::{HistoryPage, PlayedItem, Playback, RemoteSession, SessionProvider, TrackPayload};
use crate::sink::{EventSink, Origin};
use crate::track::TrackEvent;
use crate::watermark::Watermark;

pub fn track(title: &str, artist: &str) -> TrackPayload {
    TrackPayload {
        title: title.to_string(),
        artists: vec![artist.to_string()],
        explicit: false,
    }
}

pub fn at(offset_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + offset_secs, 0).unwrap()
}

pub fn played(title: &str, artist: &str, offset_secs: i64) -> PlayedItem {
    PlayedItem {
        track: track(title, artist),
        played_at: at(offset_secs),
    }
}

#[derive(Default)]
pub struct FakeSession {
    playback: Mutex<Playback>,
    probe_fails: AtomicBool,
    pages: Mutex<Vec<Vec<PlayedItem>>>,
    failing_page: Option<usize>,
    probe_calls: AtomicUsize,
    history_calls: AtomicUsize,
    afters: Mutex<Vec<Option<Watermark>>>,
    probe_gate: Mutex<Option<Arc<Notify>>>,
    history_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeSession {
    pub fn with_history(self, pages: Vec<Vec<PlayedItem>>) -> Self {
        *self.pages.lock().unwrap() = pages;
        self
    }

    pub fn failing_page(mut self, index: usize) -> Self {
        self.failing_page = Some(index);
        self
    }

    pub fn set_history(&self, pages: Vec<Vec<PlayedItem>>) {
        *self.pages.lock().unwrap() = pages;
    }

    pub fn set_playback(&self, playback: Playback) {
        *self.playback.lock().unwrap() = playback;
    }

    pub fn fail_probes(&self, fail: bool) {
        self.probe_fails.store(fail, Ordering::SeqCst);
    }

    /// The next `currently_playing` call reads the playback state and then
    /// waits for the returned gate before answering.
    pub fn hold_next_probe(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.probe_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// The next `recently_played` call waits for the returned gate.
    pub fn hold_next_history(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.history_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    pub fn afters(&self) -> Vec<Option<Watermark>> {
        self.afters.lock().unwrap().clone()
    }

    fn page(&self, index: usize) -> Result<HistoryPage> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_page == Some(index) {
            return Err(Error::Remote(format!("page {index} unavailable")));
        }
        let pages = self.pages.lock().unwrap();
        let items = pages.get(index).cloned().unwrap_or_default();
        let next_cursor = (index + 1 < pages.len()).then(|| format!("page-{}", index + 1));
        Ok(HistoryPage { items, next_cursor })
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn currently_playing(&self) -> Result<Playback> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if self.probe_fails.load(Ordering::SeqCst) {
            return Err(Error::Remote("player endpoint unavailable".to_string()));
        }
        let playback = self.playback.lock().unwrap().clone();
        let gate = self.probe_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(playback)
    }

    async fn recently_played(&self, after: Option<Watermark>, _limit: u32) -> Result<HistoryPage> {
        self.afters.lock().unwrap().push(after);
        let gate = self.history_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.page(0)
    }

    async fn next_page(&self, cursor: &str) -> Result<HistoryPage> {
        let index = cursor
            .strip_prefix("page-")
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| Error::Remote(format!("unknown cursor {cursor}")))?;
        self.page(index)
    }
}

#[derive(Default)]
pub struct FakeProvider {
    sessions: HashMap<String, Arc<FakeSession>>,
}

impl FakeProvider {
    pub fn with(mut self, account: &str, session: Arc<FakeSession>) -> Self {
        self.sessions.insert(account.to_string(), session);
        self
    }
}

#[async_trait]
impl SessionProvider for FakeProvider {
    type Session = FakeSession;

    async fn session(&self, account: &str) -> Result<Arc<FakeSession>> {
        self.sessions
            .get(account)
            .cloned()
            .ok_or_else(|| Error::Auth(format!("no session for {account}")))
    }
}

#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<(String, Origin, TrackEvent)>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<(String, Origin, TrackEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn titles_for(&self, account: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _, _)| name == account)
            .map(|(_, _, event)| event.title.clone())
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, account: &str, origin: Origin, event: &TrackEvent) {
        self.events
            .lock()
            .unwrap()
            .push((account.to_string(), origin, event.clone()));
    }
}
