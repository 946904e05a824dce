#![forbid(unsafe_code)]

//! Publish/subscribe seam for download progress.
//!
//! The orchestrator publishes percentage events against the [`ProgressSink`]
//! trait and never learns how they travel. The backend wires the sink to an
//! in-memory hub that HTTP clients poll; the CLI wires it to a JSON file
//! rewritten atomically after every update. Delivery is best-effort: a slow
//! or absent consumer never blocks the download loop.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub percent: f32,
}

pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

/// Sink that drops every event. Used where nobody is watching.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn publish(&self, _event: ProgressEvent) {}
}

struct SessionState {
    latest: f32,
    tx: broadcast::Sender<ProgressEvent>,
}

/// In-memory fan-out keyed by download session (one session per user scope).
/// Keeps the latest percent for polling clients and broadcasts each event to
/// any push subscribers.
pub struct ProgressHub {
    sessions: RwLock<HashMap<String, SessionState>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Returns a cloneable sink bound to one session key.
    pub fn sink_for(hub: &Arc<Self>, session: &str) -> HubSink {
        HubSink {
            hub: Arc::clone(hub),
            session: session.to_string(),
        }
    }

    /// Latest percent published for the session, if any.
    pub fn latest(&self, session: &str) -> Option<f32> {
        self.sessions.read().get(session).map(|state| state.latest)
    }

    /// Subscribes to future events for the session, creating it if needed.
    pub fn subscribe(&self, session: &str) -> broadcast::Receiver<ProgressEvent> {
        let mut sessions = self.sessions.write();
        sessions
            .entry(session.to_string())
            .or_insert_with(new_session)
            .tx
            .subscribe()
    }

    fn publish(&self, session: &str, event: ProgressEvent) {
        let mut sessions = self.sessions.write();
        let state = sessions
            .entry(session.to_string())
            .or_insert_with(new_session);
        state.latest = event.percent;
        // An Err only means nobody is subscribed right now.
        let _ = state.tx.send(event);
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

fn new_session() -> SessionState {
    let (tx, _) = broadcast::channel(64);
    SessionState { latest: 0.0, tx }
}

#[derive(Clone)]
pub struct HubSink {
    hub: Arc<ProgressHub>,
    session: String,
}

impl ProgressSink for HubSink {
    fn publish(&self, event: ProgressEvent) {
        self.hub.publish(&self.session, event);
    }
}

/// Writes `{"percent": <n>}` to a file via temp-file + rename so observers
/// always read a complete JSON document. Write failures are warnings only.
pub struct ProgressFileWriter {
    path: PathBuf,
}

impl ProgressFileWriter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ProgressSink for ProgressFileWriter {
    fn publish(&self, event: ProgressEvent) {
        if let Some(parent) = self.path.parent()
            && let Err(err) = fs::create_dir_all(parent)
        {
            eprintln!("Warning: could not create progress dir: {err}");
            return;
        }

        let tmp_path = self.path.with_extension("tmp");
        match serde_json::to_vec(&event) {
            Ok(payload) => {
                if let Err(err) = fs::write(&tmp_path, payload) {
                    eprintln!("Warning: could not write progress file: {err}");
                    return;
                }
                if let Err(err) = fs::rename(&tmp_path, &self.path) {
                    eprintln!("Warning: could not finalize progress file: {err}");
                }
            }
            Err(err) => {
                eprintln!("Warning: could not serialize progress event: {err}");
            }
        }
    }
}
