//! Run lifecycle events, sinks, and the on-disk run store.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use super::context::{NodeStatus, RunStatus};
use crate::error::{Error, Result};

/// A single lifecycle event, serialized as one NDJSON line in the run store.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        workflow: String,
        at: DateTime<Utc>,
    },
    NodeStarted {
        run_id: String,
        node: String,
        at: DateTime<Utc>,
    },
    NodeLog {
        run_id: String,
        node: String,
        at: DateTime<Utc>,
        message: String,
    },
    NodeFinished {
        run_id: String,
        node: String,
        status: NodeStatus,
        at: DateTime<Utc>,
        attempts: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    RunFinished {
        run_id: String,
        status: RunStatus,
        at: DateTime<Utc>,
    },
}

/// Receives events as they are emitted. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: RunEvent);
}

/// Discards everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: RunEvent) {}
}

/// Forwards events over an unbounded channel; dropped receivers are ignored.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }
}

/// Fans one event out to several sinks in order.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: RunEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

/// Metadata written to `meta.json` in a run directory.
#[derive(Debug, Clone, Serialize)]
pub struct RunMeta {
    pub run_id: String,
    pub workflow: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
}

/// Persists one run as a directory: `meta.json` plus an append-only
/// `events.ndjson`.
pub struct RunStore {
    dir: PathBuf,
    events: Mutex<File>,
}

impl RunStore {
    /// Create the run directory (and parents) and open the event log.
    pub fn create(base: &Path, run_id: &str) -> Result<Self> {
        let dir = base.join(run_id);
        std::fs::create_dir_all(&dir)?;
        let events = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("events.ndjson"))?;
        Ok(Self {
            dir,
            events: Mutex::new(events),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_meta(&self, meta: &RunMeta) -> Result<()> {
        let json = serde_json::to_vec_pretty(meta).map_err(Error::Json)?;
        std::fs::write(self.dir.join("meta.json"), json)?;
        Ok(())
    }

    fn append(&self, event: &RunEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event).map_err(Error::Json)?;
        line.push(b'\n');
        let mut file = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        file.write_all(&line)?;
        Ok(())
    }
}

impl EventSink for RunStore {
    fn emit(&self, event: RunEvent) {
        if let Err(e) = self.append(&event) {
            tracing::warn!("failed to append run event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_shape() {
        let event = RunEvent::NodeFinished {
            run_id: "r-1".to_string(),
            node: "fetch".to_string(),
            status: NodeStatus::Succeeded,
            at: Utc::now(),
            attempts: 1,
            error: None,
        };
        let json: serde_json::Value =
            serde_json::from_slice(&serde_json::to_vec(&event).unwrap()).unwrap();
        assert_eq!(json["event"], "node_finished");
        assert_eq!(json["status"], "succeeded");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit(RunEvent::RunStarted {
            run_id: "r-1".to_string(),
            workflow: "w".to_string(),
            at: Utc::now(),
        });
        sink.emit(RunEvent::RunFinished {
            run_id: "r-1".to_string(),
            status: RunStatus::Succeeded,
            at: Utc::now(),
        });
        assert!(matches!(
            rx.try_recv().unwrap(),
            RunEvent::RunStarted { .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            RunEvent::RunFinished { .. }
        ));
    }

    #[test]
    fn test_run_store_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RunStore::create(tmp.path(), "r-42").unwrap();
        store
            .write_meta(&RunMeta {
                run_id: "r-42".to_string(),
                workflow: "w".to_string(),
                started_at: Utc::now(),
                finished_at: None,
                status: None,
            })
            .unwrap();
        store.emit(RunEvent::RunStarted {
            run_id: "r-42".to_string(),
            workflow: "w".to_string(),
            at: Utc::now(),
        });
        let dir = tmp.path().join("r-42");
        assert!(dir.join("meta.json").exists());
        let log = std::fs::read_to_string(dir.join("events.ndjson")).unwrap();
        assert_eq!(log.lines().count(), 1);
    }
}
