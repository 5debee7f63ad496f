use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::warn;
use uuid::Uuid;

use ac_core::runlog::RunPaths;

use crate::message::AgentMessage;

/// Default wait applied by [`MessageBus::poll`].
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("recipient queue closed: {0}")]
    QueueClosed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persisted message corrupt at {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

pub type Result<T> = std::result::Result<T, BusError>;

// ---------------------------------------------------------------------------
// MessageBus
// ---------------------------------------------------------------------------

/// One unbounded FIFO per recipient keeps the ordering promise simple:
/// sends from a fixed sender to a fixed recipient arrive in send order,
/// and nothing is promised across pairs.
struct Mailbox {
    tx: flume::Sender<AgentMessage>,
    rx: flume::Receiver<AgentMessage>,
}

impl Mailbox {
    fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }
}

/// Thread-safe message bus; clones share the same queues.
#[derive(Clone)]
pub struct MessageBus {
    mailboxes: Arc<DashMap<String, Mailbox>>,
    /// When set, messages that carry a run id are persisted under
    /// `runtime/runs/<run-id>/bus/` before enqueue.
    runtime_root: Option<PathBuf>,
    seq: Arc<AtomicU64>,
}

impl MessageBus {
    /// In-memory only bus (no persistence).
    pub fn new() -> Self {
        Self {
            mailboxes: Arc::new(DashMap::new()),
            runtime_root: None,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bus with per-run file persistence rooted at `runtime_root`.
    pub fn with_runtime_root(root: impl Into<PathBuf>) -> Self {
        Self {
            mailboxes: Arc::new(DashMap::new()),
            runtime_root: Some(root.into()),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue a message for its recipient. When the message names a run
    /// and the bus has a runtime root, the message is written to the run's
    /// bus directory first so a crashed consumer can replay it.
    pub fn send(&self, msg: AgentMessage) -> Result<()> {
        self.persist(&msg);

        let mailbox = self
            .mailboxes
            .entry(msg.to.clone())
            .or_insert_with(Mailbox::new);
        mailbox
            .tx
            .send(msg)
            .map_err(|e| BusError::QueueClosed(e.to_string()))
    }

    /// Wait up to `timeout` for the recipient's next message.
    pub async fn poll(&self, recipient: &str, timeout: Duration) -> Option<AgentMessage> {
        let rx = {
            let mailbox = self
                .mailboxes
                .entry(recipient.to_string())
                .or_insert_with(Mailbox::new);
            mailbox.rx.clone()
        };
        match tokio::time::timeout(timeout, rx.recv_async()).await {
            Ok(Ok(msg)) => Some(msg),
            _ => None,
        }
    }

    /// [`poll`](Self::poll) with the default 5-second wait.
    pub async fn poll_default(&self, recipient: &str) -> Option<AgentMessage> {
        self.poll(recipient, DEFAULT_POLL_TIMEOUT).await
    }

    /// Non-blocking variant of [`poll`](Self::poll).
    pub fn try_poll(&self, recipient: &str) -> Option<AgentMessage> {
        let mailbox = self
            .mailboxes
            .entry(recipient.to_string())
            .or_insert_with(Mailbox::new);
        mailbox.rx.try_recv().ok()
    }

    /// Drain every message currently queued for the recipient.
    pub fn drain(&self, recipient: &str) -> Vec<AgentMessage> {
        let mut out = Vec::new();
        while let Some(msg) = self.try_poll(recipient) {
            out.push(msg);
        }
        out
    }

    /// Number of messages currently queued for the recipient.
    pub fn queued_len(&self, recipient: &str) -> usize {
        self.mailboxes
            .get(recipient)
            .map(|m| m.rx.len())
            .unwrap_or(0)
    }

    /// Acknowledge a processed message: removes its persisted copy.
    pub fn ack(&self, msg: &AgentMessage) {
        if let Some(ref run_id) = msg.run_id {
            self.ack_by_id(run_id, msg.id);
        }
    }

    /// Replay persisted, un-acked messages for a run in persistence order.
    pub fn pending(&self, run_id: &str) -> Result<Vec<AgentMessage>> {
        let Some(ref root) = self.runtime_root else {
            return Ok(Vec::new());
        };
        let dir = RunPaths::new(root, run_id).bus_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        names.sort(); // the zero-padded sequence prefix makes this chronological

        let mut out = Vec::with_capacity(names.len());
        for path in names {
            let content = std::fs::read_to_string(&path)?;
            let msg: AgentMessage =
                serde_json::from_str(&content).map_err(|e| BusError::Corrupt {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            out.push(msg);
        }
        Ok(out)
    }

    fn persist(&self, msg: &AgentMessage) {
        let (Some(root), Some(run_id)) = (self.runtime_root.as_ref(), msg.run_id.as_ref()) else {
            return;
        };
        let dir = RunPaths::new(root, run_id).bus_dir();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "bus persistence dir create failed");
            return;
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let path = dir.join(persisted_name(msg.id, seq));
        match serde_json::to_string_pretty(msg) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    warn!(path = %path.display(), error = %e, "bus persistence write failed");
                }
            }
            Err(e) => warn!(error = %e, "bus message serialize failed"),
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Persisted file name: `<seq:06>-<id>.json`. The zero-padded sequence
/// keeps directory order chronological; ack matches on the id suffix.
fn persisted_name(id: Uuid, seq: u64) -> String {
    format!("{:06}-{}.json", seq, id)
}

impl MessageBus {
    /// Ack by scanning the run's bus directory for the id suffix. Needed
    /// because the sender allocated the sequence prefix, not the consumer.
    pub fn ack_by_id(&self, run_id: &str, id: Uuid) {
        let Some(ref root) = self.runtime_root else {
            return;
        };
        let dir = RunPaths::new(root, run_id).bus_dir();
        let suffix = format!("{}.json", id);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(&suffix) {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!(path = %entry.path().display(), error = %e, "bus ack failed");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
