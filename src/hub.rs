use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::types::{ScanKind, StepStatus};

/// Default time a single observer gets to accept one event before it is dropped.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-observer queue depth the server uses when it opens a subscription.
pub const SUBSCRIBER_BUFFER: usize = 256;

/// Message pushed to observers of a run.
///
/// `RunComplete` is the end-of-stream marker: nothing else is sent for that run afterwards.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Output {
        text: String,
    },
    StepStarted {
        kind: ScanKind,
        index: usize,
        total: usize,
    },
    StepFinished {
        kind: ScanKind,
        status: StepStatus,
        exit_code: i32,
    },
    ReportSaved {
        location: String,
    },
    RunError {
        message: String,
    },
    RunComplete {
        status: StepStatus,
    },
}

impl RunEvent {
    pub fn output(text: impl Into<String>) -> Self {
        RunEvent::Output { text: text.into() }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::RunComplete { .. })
    }
}

pub type Subscriber = mpsc::Sender<RunEvent>;

/// Registry of observers keyed by run id.
///
/// - Cloning is cheap; clones share the same registry.
/// - Entries with no subscribers are removed as soon as the last one leaves.
/// - A broadcast never waits on a slow observer for longer than the send timeout; observers
///   that time out or have gone away are pruned.
#[derive(Clone, Debug)]
pub struct BroadcastHub {
    subscribers: Arc<Mutex<HashMap<String, Vec<Subscriber>>>>,
    send_timeout: Duration,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::with_send_timeout(DEFAULT_SEND_TIMEOUT)
    }

    pub fn with_send_timeout(send_timeout: Duration) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            send_timeout,
        }
    }

    /// Register `tx` to receive every later broadcast for `run_id`.
    pub async fn subscribe(&self, run_id: &str, tx: Subscriber) {
        let mut map = self.subscribers.lock().await;
        map.entry(run_id.to_string()).or_default().push(tx);
        debug!(run_id, subscribers = map[run_id].len(), "observer subscribed");
    }

    /// Remove `tx` from `run_id`. Unknown channels are ignored.
    pub async fn unsubscribe(&self, run_id: &str, tx: &Subscriber) {
        let mut map = self.subscribers.lock().await;
        if let Some(set) = map.get_mut(run_id) {
            set.retain(|s| !s.same_channel(tx));
            if set.is_empty() {
                map.remove(run_id);
            }
        }
        debug!(run_id, "observer unsubscribed");
    }

    /// Deliver `event` to every current subscriber of `run_id`.
    ///
    /// Without subscribers the event is dropped. Delivery failures never reach the caller.
    pub async fn broadcast(&self, run_id: &str, event: RunEvent) {
        // Snapshot so that sends happen without holding the lock.
        let targets: Vec<Subscriber> = {
            let map = self.subscribers.lock().await;
            match map.get(run_id) {
                Some(set) => set.clone(),
                None => return,
            }
        };

        let mut dead: Vec<Subscriber> = Vec::new();
        for tx in targets {
            if let Err(e) = tx.send_timeout(event.clone(), self.send_timeout).await {
                debug!(run_id, error = %e, "dropping observer after failed send");
                dead.push(tx);
            }
        }

        if dead.is_empty() {
            return;
        }
        let mut map = self.subscribers.lock().await;
        if let Some(set) = map.get_mut(run_id) {
            set.retain(|s| !dead.iter().any(|d| d.same_channel(s)));
            if set.is_empty() {
                map.remove(run_id);
            }
        }
    }

    pub async fn subscriber_count(&self, run_id: &str) -> usize {
        let map = self.subscribers.lock().await;
        map.get(run_id).map(Vec::len).unwrap_or(0)
    }

    /// Number of run ids with at least one subscriber.
    pub async fn run_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}
