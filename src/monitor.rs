use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dedup::DedupTracker;
use crate::error::Result;
use crate::session::{RemoteSession, bounded};
use crate::sink::{EventSink, Origin};
use crate::track::{TrackEvent, normalize};

/// Fine-cadence "now playing" poller for a single account. Started and
/// cancelled by the scheduler; it never changes its own lifecycle.
pub struct LiveMonitor<S: ?Sized> {
    account: String,
    session: Arc<S>,
    tracker: Arc<DedupTracker>,
    sink: Arc<dyn EventSink>,
    timeout: Duration,
}

impl<S: RemoteSession + ?Sized> LiveMonitor<S> {
    pub fn new(
        account: impl Into<String>,
        session: Arc<S>,
        tracker: Arc<DedupTracker>,
        sink: Arc<dyn EventSink>,
        timeout: Duration,
    ) -> Self {
        Self {
            account: account.into(),
            session,
            tracker,
            sink,
            timeout,
        }
    }

    /// Polls once and returns the event it emitted, if any.
    pub async fn tick(&self) -> Result<Option<TrackEvent>> {
        let playback = bounded(self.timeout, self.session.currently_playing()).await?;
        let Some(track) = playback.track else {
            self.tracker.stopped(&self.account);
            return Ok(None);
        };
        let event = normalize(&track, None);
        if !self.tracker.observe(&self.account, event.signature()) {
            return Ok(None);
        }
        self.sink.emit(&self.account, Origin::Live, &event);
        Ok(Some(event))
    }

    pub async fn run(self, every: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(account = self.account.as_str(), "Live monitor started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!(account = self.account.as_str(), "Live tick failed: {err}");
                    }
                }
            }
        }
        debug!(account = self.account.as_str(), "Live monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::StopPolicy;
    use crate::session::Playback;
    use crate::testing::{FakeSession, MemorySink, track};

    fn monitor(
        session: Arc<FakeSession>,
        policy: StopPolicy,
        sink: Arc<MemorySink>,
    ) -> LiveMonitor<FakeSession> {
        LiveMonitor::new(
            "alice",
            session,
            Arc::new(DedupTracker::new(policy)),
            sink,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn reports_only_track_changes() {
        let session = Arc::new(FakeSession::default());
        let sink = Arc::new(MemorySink::default());
        let live = monitor(session.clone(), StopPolicy::Keep, sink.clone());

        session.set_playback(Playback::playing(track("Song X", "Artist Y")));
        assert!(live.tick().await.unwrap().is_some());
        assert!(live.tick().await.unwrap().is_none());
        session.set_playback(Playback::playing(track("Song Z", "Artist Y")));
        let event = live.tick().await.unwrap().unwrap();

        assert_eq!(event.title, "Song Z");
        assert_eq!(event.played_at, None);
        assert_eq!(sink.titles_for("alice"), vec!["Song X", "Song Z"]);
        assert!(sink.events().iter().all(|(_, origin, _)| *origin == Origin::Live));
    }

    #[tokio::test]
    async fn nothing_playing_emits_nothing_and_keeps_the_slot() {
        let session = Arc::new(FakeSession::default());
        let sink = Arc::new(MemorySink::default());
        let live = monitor(session.clone(), StopPolicy::Keep, sink.clone());

        session.set_playback(Playback::playing(track("Song X", "Artist Y")));
        live.tick().await.unwrap();
        session.set_playback(Playback::idle());
        assert!(live.tick().await.unwrap().is_none());
        session.set_playback(Playback::playing(track("Song X", "Artist Y")));
        assert!(live.tick().await.unwrap().is_none());

        assert_eq!(sink.titles_for("alice"), vec!["Song X"]);
    }

    #[tokio::test]
    async fn clear_policy_reports_a_replay_after_silence() {
        let session = Arc::new(FakeSession::default());
        let sink = Arc::new(MemorySink::default());
        let live = monitor(session.clone(), StopPolicy::Clear, sink.clone());

        session.set_playback(Playback::playing(track("Song X", "Artist Y")));
        live.tick().await.unwrap();
        session.set_playback(Playback::idle());
        live.tick().await.unwrap();
        session.set_playback(Playback::playing(track("Song X", "Artist Y")));
        live.tick().await.unwrap();

        assert_eq!(sink.titles_for("alice"), vec!["Song X", "Song X"]);
    }

    #[tokio::test]
    async fn remote_failure_fails_only_the_tick() {
        let session = Arc::new(FakeSession::default());
        let sink = Arc::new(MemorySink::default());
        let live = monitor(session.clone(), StopPolicy::Keep, sink.clone());

        session.fail_probes(true);
        assert!(live.tick().await.is_err());
        session.fail_probes(false);
        session.set_playback(Playback::playing(track("Song X", "Artist Y")));
        assert!(live.tick().await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_ticking_once_cancelled() {
        let session = Arc::new(FakeSession::default());
        let sink = Arc::new(MemorySink::default());
        let live = monitor(session.clone(), StopPolicy::Keep, sink);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(live.run(Duration::from_secs(10), cancel.clone()));
        tokio::time::sleep(Duration::from_secs(25)).await;
        cancel.cancel();
        task.await.unwrap();
        let calls = session.probe_calls();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(calls, 3);
        assert_eq!(session.probe_calls(), calls);
    }
}
