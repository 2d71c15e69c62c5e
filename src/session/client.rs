//! Client back-reference and the assembled result table

use crate::transport::messages::ClientEvent;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};

/// How long an event may wait for room in a client's queue before the client
/// is treated as gone.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a session's progress and results go.
///
/// `client_ref` names the front connection; it is forwarded to the hub so
/// the hub can route per-client traffic.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    client_ref: String,
    events: mpsc::Sender<ClientEvent>,
    disconnected: Arc<AtomicBool>,
    send_timeout: Duration,
}

impl ClientHandle {
    pub fn new(client_ref: impl Into<String>, events: mpsc::Sender<ClientEvent>) -> Self {
        Self {
            client_ref: client_ref.into(),
            events,
            disconnected: Arc::new(AtomicBool::new(false)),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Handle plus the receiving end, for embedding and tests.
    pub fn channel(client_ref: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(client_ref, tx), rx)
    }

    pub fn client_ref(&self) -> &str {
        &self.client_ref
    }

    pub fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst) && !self.events.is_closed()
    }

    pub fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    /// Queue an event, waiting at most the send timeout for room.
    ///
    /// Returns false once the client is gone. A client whose queue stays full
    /// past the timeout is marked disconnected.
    pub async fn send(&self, event: ClientEvent) -> bool {
        if self.disconnected.load(Ordering::SeqCst) {
            return false;
        }
        match self.events.send_timeout(event, self.send_timeout).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                log::warn!(
                    "⚠️  Client {} not reading events for {:?}, disconnecting",
                    self.client_ref,
                    self.send_timeout
                );
                self.mark_disconnected();
                false
            }
            Err(SendTimeoutError::Closed(_)) => {
                self.mark_disconnected();
                false
            }
        }
    }

    /// Queue an event without waiting. A full queue marks the client
    /// disconnected.
    pub fn try_send(&self, event: ClientEvent) -> bool {
        if self.disconnected.load(Ordering::SeqCst) {
            return false;
        }
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("⚠️  Client {} event queue full, disconnecting", self.client_ref);
                self.mark_disconnected();
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.mark_disconnected();
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub group: Vec<Option<String>>,
    pub values: Vec<Option<f64>>,
}

/// Final answer of a completed query: one row per domain tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    /// Group-by column labels followed by aggregate labels.
    pub columns: Vec<String>,
    pub rows: Vec<ResultRow>,
}

pub fn round_to_scale(value: f64, scale: u32) -> f64 {
    let factor = 10f64.powi(scale.min(15) as i32);
    (value * factor).round() / factor
}
