use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};

/// Boundary between history that has already been emitted and history that has not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Watermark(DateTime<Utc>);

impl Watermark {
    #[cfg(test)]
    pub fn at(instant: DateTime<Utc>) -> Self {
        Self(instant)
    }

    pub fn instant(self) -> DateTime<Utc> {
        self.0
    }

    pub fn unix_millis(self) -> i64 {
        self.0.timestamp_millis()
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

#[derive(Debug)]
pub struct WatermarkStore {
    current: Option<Watermark>,
    skew: TimeDelta,
}

impl WatermarkStore {
    pub fn new(skew: TimeDelta) -> Self {
        Self {
            current: None,
            skew,
        }
    }

    /// `None` until the first advance: fetch all the history the remote still has.
    pub fn current(&self) -> Option<Watermark> {
        self.current
    }

    /// Moves the watermark to `now - skew`. Never moves it backwards.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Watermark {
        let candidate = Watermark(now - self.skew);
        let next = match self.current {
            Some(current) if current > candidate => current,
            _ => candidate,
        };
        self.current = Some(next);
        next
    }
}
