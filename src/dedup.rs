use std::collections::HashMap;
use std::sync::Mutex;

use crate::track::PlaybackSignature;

/// What happens to an account's last signature once playback stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopPolicy {
    /// Keep it: replaying the same track after a pause is not reported again.
    #[default]
    Keep,
    /// Forget it: the next observation after a stop is always reported.
    Clear,
}

#[derive(Debug, Default)]
pub struct DedupTracker {
    slots: Mutex<HashMap<String, PlaybackSignature>>,
    policy: StopPolicy,
}

impl DedupTracker {
    pub fn new(policy: StopPolicy) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            policy,
        }
    }

    /// Records `signature` for `account` and returns whether it should be reported.
    pub fn observe(&self, account: &str, signature: PlaybackSignature) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match slots.get_mut(account) {
            Some(previous) if *previous == signature => false,
            Some(previous) => {
                *previous = signature;
                true
            }
            None => {
                slots.insert(account.to_string(), signature);
                true
            }
        }
    }

    pub fn stopped(&self, account: &str) {
        if self.policy == StopPolicy::Clear {
            self.slots
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(account);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(title: &str) -> PlaybackSignature {
        PlaybackSignature::new(title, "Artist Y")
    }

    #[test]
    fn reports_first_then_suppresses_repeats() {
        let tracker = DedupTracker::default();
        assert!(tracker.observe("alice", sig("Song X")));
        assert!(!tracker.observe("alice", sig("Song X")));
        assert!(!tracker.observe("alice", sig("Song X")));
        assert!(tracker.observe("alice", sig("Song Z")));
        assert!(tracker.observe("alice", sig("Song X")));
    }

    #[test]
    fn accounts_have_independent_slots() {
        let tracker = DedupTracker::default();
        assert!(tracker.observe("alice", sig("Song X")));
        assert!(tracker.observe("bob", sig("Song X")));
        assert!(!tracker.observe("bob", sig("Song X")));
    }

    #[test]
    fn keep_policy_suppresses_the_same_track_after_a_stop() {
        let tracker = DedupTracker::new(StopPolicy::Keep);
        assert!(tracker.observe("alice", sig("Song X")));
        tracker.stopped("alice");
        assert!(!tracker.observe("alice", sig("Song X")));
    }

    #[test]
    fn clear_policy_reports_the_same_track_after_a_stop() {
        let tracker = DedupTracker::new(StopPolicy::Clear);
        assert!(tracker.observe("alice", sig("Song X")));
        tracker.stopped("alice");
        assert!(tracker.observe("alice", sig("Song X")));
    }

    #[test]
    fn stopping_an_unseen_account_is_harmless() {
        let tracker = DedupTracker::new(StopPolicy::Clear);
        tracker.stopped("nobody");
        assert!(tracker.observe("nobody", sig("Song X")));
    }
}
