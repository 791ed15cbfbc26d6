use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dedup::{DedupTracker, StopPolicy};
use crate::error::Result;
use crate::history::HistoryPoller;
use crate::monitor::LiveMonitor;
use crate::session::{RemoteSession, SessionProvider, bounded};
use crate::sink::EventSink;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub sweep_interval: Duration,
    pub history_interval: Duration,
    pub live_interval: Duration,
    pub request_timeout: Duration,
    pub watermark_skew: TimeDelta,
    pub page_size: u32,
    pub stop_policy: StopPolicy,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub started: usize,
    pub stopped: usize,
    pub failed: usize,
}

struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Drives both cadences: a coarse sweep that probes every account and starts or
/// cancels its live monitor, and the periodic history poll.
///
/// The job registry is only touched from the scheduler's own task, so creating
/// and cancelling the monitor of an account never race with each other.
pub struct Scheduler<P: SessionProvider> {
    accounts: Vec<String>,
    provider: Arc<P>,
    tracker: Arc<DedupTracker>,
    sink: Arc<dyn EventSink>,
    history: HistoryPoller<P>,
    settings: SchedulerSettings,
    jobs: HashMap<String, MonitorHandle>,
}

impl<P: SessionProvider> Scheduler<P> {
    pub fn new(
        accounts: Vec<String>,
        provider: Arc<P>,
        sink: Arc<dyn EventSink>,
        settings: SchedulerSettings,
    ) -> Self {
        let history = HistoryPoller::new(
            provider.clone(),
            sink.clone(),
            settings.watermark_skew,
            settings.page_size,
            settings.request_timeout,
        );
        Self {
            accounts,
            provider,
            tracker: Arc::new(DedupTracker::new(settings.stop_policy)),
            sink,
            history,
            settings,
            jobs: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn active_jobs(&self) -> Vec<String> {
        let mut accounts: Vec<_> = self.jobs.keys().cloned().collect();
        accounts.sort();
        accounts
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut sweeps = tokio::time::interval(self.settings.sweep_interval);
        sweeps.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut history = tokio::time::interval(self.settings.history_interval);
        history.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Watching {} accounts (sweep {:?}, history {:?}, live {:?})",
            self.accounts.len(),
            self.settings.sweep_interval,
            self.settings.history_interval,
            self.settings.live_interval
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = history.tick() => {
                    // A run cut short leaves the watermark where it was.
                    let report = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        report = self.history.poll(&self.accounts) => report,
                    };
                    debug!(
                        emitted = report.emitted,
                        failed = report.failed.len(),
                        "History poll finished, watermark {}",
                        report.watermark.map_or_else(|| "unset".to_string(), |mark| mark.to_string())
                    );
                }
                _ = sweeps.tick() => {
                    let report = self.sweep().await;
                    debug!(
                        started = report.started,
                        stopped = report.stopped,
                        failed = report.failed,
                        "Sweep finished"
                    );
                }
            }
        }

        self.shutdown().await;
    }

    /// Probes every account once and applies the Idle/Playing transition.
    /// A failed probe leaves that account's job as it was.
    pub async fn sweep(&mut self) -> SweepReport {
        self.reap_finished();
        let mut report = SweepReport::default();
        let accounts = self.accounts.clone();
        for account in &accounts {
            match self.probe(account).await {
                Ok((session, true)) => {
                    if self.start_job(account, session) {
                        report.started += 1;
                    }
                }
                Ok((_, false)) => {
                    if self.stop_job(account).await {
                        report.stopped += 1;
                    }
                }
                Err(err) if err.is_auth() => {
                    warn!(account = account.as_str(), "Skipping unauthorized account: {err}");
                    report.failed += 1;
                }
                Err(err) => {
                    warn!(account = account.as_str(), "Playback probe failed: {err}");
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn probe(&self, account: &str) -> Result<(Arc<P::Session>, bool)> {
        let session = self.provider.session(account).await?;
        let playback = bounded(self.settings.request_timeout, session.currently_playing()).await?;
        Ok((session, playback.is_playing))
    }

    fn start_job(&mut self, account: &str, session: Arc<P::Session>) -> bool {
        if self.jobs.contains_key(account) {
            return false;
        }
        let cancel = CancellationToken::new();
        let monitor = LiveMonitor::new(
            account,
            session,
            self.tracker.clone(),
            self.sink.clone(),
            self.settings.request_timeout,
        );
        let task = tokio::spawn(monitor.run(self.settings.live_interval, cancel.clone()));
        self.jobs
            .insert(account.to_string(), MonitorHandle { cancel, task });
        info!(account, "Playback started, live monitor running");
        true
    }

    /// Cancels the job and waits out its in-flight tick, which is bounded by the
    /// request timeout, before the dedup slot is released.
    async fn stop_job(&mut self, account: &str) -> bool {
        let Some(handle) = self.jobs.remove(account) else {
            return false;
        };
        handle.cancel.cancel();
        if let Err(err) = handle.task.await {
            warn!(account, "Live monitor ended abnormally: {err}");
        }
        self.tracker.stopped(account);
        info!(account, "Playback stopped, live monitor cancelled");
        true
    }

    fn reap_finished(&mut self) {
        self.jobs.retain(|account, handle| {
            let finished = handle.task.is_finished();
            if finished {
                warn!(account = account.as_str(), "Live monitor exited on its own");
            }
            !finished
        });
    }

    async fn shutdown(&mut self) {
        for handle in self.jobs.values() {
            handle.cancel.cancel();
        }
        for (account, handle) in self.jobs.drain() {
            if let Err(err) = handle.task.await {
                warn!(account = account.as_str(), "Live monitor ended abnormally: {err}");
            }
        }
        info!("Scheduler stopped");
    }
}

impl<P: SessionProvider> Drop for Scheduler<P> {
    fn drop(&mut self) {
        for handle in self.jobs.values() {
            handle.cancel.cancel();
        }
    }
}
