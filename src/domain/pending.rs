//! Pending-request correlation table.
//!
//! A station has exactly one outbound WebSocket connection, so unlike the
//! CSMS-side `CommandSender` (keyed by `(charge_point_id, message_id)`),
//! this table only needs the OCPP-J `uniqueId` as a key. Each in-flight
//! `Call` registers a oneshot receiver before the frame is written to the
//! socket; the dispatcher resolves it when the matching `CallResult` or
//! `CallError` arrives, or the entry is reaped on timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::warn;

use crate::domain::frame::OcppFrame;
use crate::support::ProtocolError;

const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 10;

/// Resolution of an in-flight `Call`: either the matched payload, or the
/// CallError raised in reply.
pub type PendingResult = Result<Value, ProtocolError>;

struct PendingEntry {
    action: String,
    responder: oneshot::Sender<PendingResult>,
}

/// Correlates outgoing `Call` frames with their eventual reply.
pub struct PendingRequestTable {
    entries: DashMap<String, PendingEntry>,
    counter: AtomicU64,
    timeout: Duration,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_RESPONSE_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            counter: AtomicU64::new(1),
            timeout,
        }
    }

    /// Register a new `Call` awaiting a reply, returning the frame to send
    /// and a future that resolves once the matching reply arrives or the
    /// deadline expires.
    pub fn register(
        &self,
        action: impl Into<String>,
        payload: Value,
    ) -> (OcppFrame, impl std::future::Future<Output = PendingResult> + '_) {
        let action = action.into();
        let frame = OcppFrame::new_call(action.clone(), payload);
        let unique_id = frame.unique_id().to_string();

        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            unique_id.clone(),
            PendingEntry {
                action: action.clone(),
                responder: tx,
            },
        );

        let wait = async move {
            match timeout(self.timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => {
                    self.entries.remove(&unique_id);
                    Err(ProtocolError::InternalError(
                        "pending request channel closed".into(),
                    ))
                }
                Err(_) => {
                    self.entries.remove(&unique_id);
                    warn!(unique_id = %unique_id, action = %action, "command timed out");
                    Err(ProtocolError::InternalError("response timeout".into()))
                }
            }
        };

        (frame, wait)
    }

    /// Resolve a `CallResult` frame against its pending entry. No-op if
    /// the `uniqueId` is unknown (late/duplicate reply, already reaped).
    pub fn resolve_result(&self, unique_id: &str, payload: Value) {
        if let Some((_, entry)) = self.entries.remove(unique_id) {
            let _ = entry.responder.send(Ok(payload));
        }
    }

    /// Resolve a `CallError` frame against its pending entry.
    pub fn resolve_error(&self, unique_id: &str, error: ProtocolError) {
        if let Some((_, entry)) = self.entries.remove(unique_id) {
            let _ = entry.responder.send(Err(error));
        }
    }

    /// Generate a locally-unique counter value, for callers that need a
    /// monotonic sequence alongside the UUID message IDs (e.g. connector
    /// transaction numbering in OCPP 1.6).
    pub fn next_sequence(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    /// Fail every outstanding entry, used when the connection drops so
    /// callers awaiting a reply don't hang past a reconnect.
    pub fn fail_all(&self, error: ProtocolError) {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(&key) {
                let _ = entry.responder.send(Err(error.clone()));
            }
        }
    }

    pub fn action_for(&self, unique_id: &str) -> Option<String> {
        self.entries.get(unique_id).map(|e| e.action.clone())
    }
}

impl Default for PendingRequestTable {
    fn default() -> Self {
        Self::new()
    }
}
