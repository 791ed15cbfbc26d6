use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::pager::{HistoryQuery, fetch_all};
use crate::session::SessionProvider;
use crate::sink::{EventSink, Origin};
use crate::track::{PlaybackSignature, normalize};
use crate::watermark::{Watermark, WatermarkStore};

#[derive(Debug, Default)]
pub struct HistoryReport {
    pub emitted: usize,
    pub failed: Vec<String>,
    pub watermark: Option<Watermark>,
}

type EmittedKey = (DateTime<Utc>, PlaybackSignature);

/// Entries at or above the watermark are fetched again on every run; the
/// emitted keys keep them from being reported twice.
struct HistoryState {
    watermark: WatermarkStore,
    emitted: HashMap<String, HashSet<EmittedKey>>,
}

impl HistoryState {
    fn prune_below(&mut self, floor: DateTime<Utc>) {
        for keys in self.emitted.values_mut() {
            keys.retain(|(played_at, _)| *played_at >= floor);
        }
        self.emitted.retain(|_, keys| !keys.is_empty());
    }
}

pub struct HistoryPoller<P> {
    provider: Arc<P>,
    sink: Arc<dyn EventSink>,
    page_size: u32,
    timeout: Duration,
    state: Mutex<HistoryState>,
}

impl<P: SessionProvider> HistoryPoller<P> {
    pub fn new(
        provider: Arc<P>,
        sink: Arc<dyn EventSink>,
        skew: TimeDelta,
        page_size: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            sink,
            page_size,
            timeout,
            state: Mutex::new(HistoryState {
                watermark: WatermarkStore::new(skew),
                emitted: HashMap::new(),
            }),
        }
    }

    pub async fn poll(&self, accounts: &[String]) -> HistoryReport {
        self.poll_at(accounts, Utc::now()).await
    }

    /// One history run over `accounts`. Runs never interleave: the state lock is
    /// held from reading the watermark until it has been advanced.
    pub async fn poll_at(&self, accounts: &[String], now: DateTime<Utc>) -> HistoryReport {
        let mut state = self.state.lock().await;
        let after = state.watermark.current();
        let mut report = HistoryReport::default();
        let mut fetched = 0;

        for account in accounts {
            match self.poll_account(account, after, &mut state).await {
                Ok(emitted) => {
                    fetched += 1;
                    report.emitted += emitted;
                }
                Err(err) => {
                    warn!(account = account.as_str(), "Skipping history: {err}");
                    report.failed.push(account.clone());
                }
            }
        }

        if fetched > 0 || accounts.is_empty() {
            let advanced = state.watermark.advance(now);
            state.prune_below(advanced.instant());
            debug!("History watermark advanced to {advanced}");
        }
        report.watermark = state.watermark.current();
        report
    }

    async fn poll_account(
        &self,
        account: &str,
        after: Option<Watermark>,
        state: &mut HistoryState,
    ) -> Result<usize> {
        let session = self.provider.session(account).await?;
        let query = HistoryQuery {
            after,
            page_size: self.page_size,
            timeout: self.timeout,
        };
        let mut items = fetch_all(session.as_ref(), query).await?;
        items.sort_by_key(|item| item.played_at);

        let floor = after.map(Watermark::instant);
        let seen = state.emitted.entry(account.to_string()).or_default();
        let mut emitted = 0;
        for item in items {
            if floor.is_some_and(|floor| item.played_at < floor) {
                continue;
            }
            let event = normalize(&item.track, Some(item.played_at));
            if !seen.insert((item.played_at, event.signature())) {
                continue;
            }
            self.sink.emit(account, Origin::History, &event);
            emitted += 1;
        }
        if emitted > 0 {
            info!(account, "Emitted {emitted} history entries");
        }
        Ok(emitted)
    }
}
