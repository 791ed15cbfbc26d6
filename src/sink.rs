use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::track::TrackEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    History,
    Live,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::History => "history",
            Origin::Live => "live",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, account: &str, origin: Origin, event: &TrackEvent);
}

pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, account: &str, origin: Origin, event: &TrackEvent) {
        match (origin, event.played_at) {
            (Origin::History, Some(played_at)) => info!(
                account,
                origin = origin.as_str(),
                explicit = event.explicit,
                played_at = %played_at.to_rfc3339(),
                "Played from {account}: {event}"
            ),
            _ => info!(
                account,
                origin = origin.as_str(),
                explicit = event.explicit,
                "Now playing for {account}: {event}"
            ),
        }
    }
}

#[derive(Serialize)]
struct Record<'a> {
    account: &'a str,
    origin: Origin,
    #[serde(flatten)]
    event: &'a TrackEvent,
}

/// Appends one JSON object per event. Lines are handed to a writer thread so
/// emitting never blocks the async runtime on file I/O; dropping the sink
/// flushes whatever is still queued.
pub struct JsonLinesSink {
    lines: Option<Sender<String>>,
    writer: Option<JoinHandle<()>>,
}

impl JsonLinesSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed creating output directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed opening event log at {}", path.display()))?;
        let (lines, queue) = mpsc::channel();
        let path = path.to_path_buf();
        let writer = thread::Builder::new()
            .name("turntable-events".to_string())
            .spawn(move || write_lines(file, &path, queue))
            .context("Failed starting event log writer")?;
        Ok(Self {
            lines: Some(lines),
            writer: Some(writer),
        })
    }
}

fn write_lines(mut file: File, path: &Path, queue: Receiver<String>) {
    for line in queue {
        if let Err(err) = writeln!(file, "{line}") {
            warn!("Failed appending event to {}: {err}", path.display());
        }
    }
    if let Err(err) = file.flush() {
        warn!("Failed flushing event log {}: {err}", path.display());
    }
}

impl EventSink for JsonLinesSink {
    fn emit(&self, account: &str, origin: Origin, event: &TrackEvent) {
        let record = Record {
            account,
            origin,
            event,
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(err) => {
                warn!(account, "Dropped {} event: {err}", origin.as_str());
                return;
            }
        };
        let queued = self
            .lines
            .as_ref()
            .is_some_and(|lines| lines.send(line).is_ok());
        if !queued {
            warn!(account, "Dropped {} event: event log writer is gone", origin.as_str());
        }
    }
}

impl Drop for JsonLinesSink {
    fn drop(&mut self) {
        self.lines.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!("Event log writer panicked");
            }
        }
    }
}
