// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cross-tab coordination.
//!
//! Every execution context (tab, standalone agent) shares one broadcast slot
//! in the persisted store; writes are single "latest wins" sets with no
//! locking. Where the host offers a direct pub/sub channel we use it as a
//! low-latency fast path, but both paths carry identical semantics and
//! either can be absent: lost intermediate messages are acceptable as long
//! as terminal ones (logout) are eventually observed on some path.
//!
//! A tab never processes its own messages (self-echo suppression), and a
//! message seen on both paths is delivered once. Because the slot is never
//! cleared, a coordinator also ignores anything written before it spawned:
//! a terminal logout left over from a previous session must not kill the
//! next one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;

use crate::error::{EngineError, EngineResult};
use crate::store::{with_retry, KeyValueStore, KEY_BROADCAST};

/// Recent-fingerprint memory for cross-path dedupe.
const DEDUPE_DEPTH: usize = 32;

/// Store write attempts before a broadcast is reported as failed.
const BROADCAST_RETRY_ATTEMPTS: u32 = 3;

/// Lifecycle message kinds exchanged between contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Heartbeat,
    Logout,
    ForceLogout,
    Warning,
    ActivityUpdate,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::Logout => "logout",
            Self::ForceLogout => "force_logout",
            Self::Warning => "warning",
            Self::ActivityUpdate => "activity_update",
        }
    }
}

/// Ephemeral message written to the shared slot. Read by peers, never owned
/// by any single tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossTabMessage {
    pub kind: MessageKind,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
    /// Disambiguates messages from one session inside one millisecond.
    #[serde(default)]
    pub nonce: u32,
}

impl CrossTabMessage {
    pub fn new(kind: MessageKind, session_id: impl Into<String>) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            timestamp: Utc::now(),
            payload: Value::Null,
            nonce: rand::random(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Parse a raw slot value. Malformed input is a protocol inconsistency,
    /// never a crash.
    pub fn parse(raw: &str) -> EngineResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| EngineError::ProtocolInconsistency(format!("cross-tab message: {e}")))
    }

    /// String payload field accessor, e.g. the `keep` hint on `ForceLogout`.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }

    fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.kind.as_str(),
            self.session_id,
            self.timestamp.timestamp_millis(),
            self.nonce
        )
    }
}

/// Builder for one context's coordinator.
pub struct CrossTabCoordinator {
    session_id: String,
    store: Arc<dyn KeyValueStore>,
    poll_interval: Duration,
    fast_path: Option<broadcast::Sender<CrossTabMessage>>,
}

impl CrossTabCoordinator {
    pub fn new(
        session_id: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            store,
            poll_interval,
            fast_path: None,
        }
    }

    /// Attach the host's direct pub/sub channel. Contexts sharing a process
    /// (or a real BroadcastChannel equivalent) pass clones of one sender.
    pub fn with_fast_path(mut self, tx: broadcast::Sender<CrossTabMessage>) -> Self {
        self.fast_path = Some(tx);
        self
    }

    /// Start polling and (if present) the fast path. Returns the outbound
    /// handle and the deduplicated inbound message stream.
    pub fn spawn(self) -> (CrossTabHandle, mpsc::UnboundedReceiver<CrossTabMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let fast_rx = self.fast_path.as_ref().map(|tx| tx.subscribe());
        let task = tokio::spawn(run(
            self.session_id.clone(),
            Arc::clone(&self.store),
            self.poll_interval,
            fast_rx,
            inbound_tx,
        ));
        let handle = CrossTabHandle {
            session_id: self.session_id,
            store: self.store,
            fast_path: self.fast_path,
            task,
        };
        (handle, inbound_rx)
    }
}

/// Outbound side of a running coordinator.
pub struct CrossTabHandle {
    session_id: String,
    store: Arc<dyn KeyValueStore>,
    fast_path: Option<broadcast::Sender<CrossTabMessage>>,
    task: JoinHandle<()>,
}

impl CrossTabHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Convenience constructor stamped with this context's session id.
    pub fn message(&self, kind: MessageKind) -> CrossTabMessage {
        CrossTabMessage::new(kind, self.session_id.clone())
    }

    /// Publish to every other context: one latest-wins store write (retried
    /// on transient failure) plus the fast path when available.
    pub async fn broadcast(&self, message: CrossTabMessage) -> EngineResult<()> {
        let raw = serde_json::to_string(&message)
            .map_err(|e| EngineError::ProtocolInconsistency(format!("serialize: {e}")))?;
        let store = Arc::clone(&self.store);
        with_retry("crosstab.broadcast", BROADCAST_RETRY_ATTEMPTS, || {
            store.set(KEY_BROADCAST, &raw)
        })
        .await?;
        tracing::debug!(
            "CROSSTAB_SENT | kind={} session={}",
            message.kind.as_str(),
            message.session_id
        );
        if let Some(tx) = &self.fast_path {
            let _ = tx.send(message);
        }
        Ok(())
    }
}

impl Drop for CrossTabHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    session_id: String,
    store: Arc<dyn KeyValueStore>,
    poll_interval: Duration,
    mut fast_rx: Option<broadcast::Receiver<CrossTabMessage>>,
    inbound_tx: mpsc::UnboundedSender<CrossTabMessage>,
) {
    let mut recent: VecDeque<String> = VecDeque::with_capacity(DEDUPE_DEPTH);
    let mut poll = time::interval(poll_interval);
    poll.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
    // the slot is never cleared; anything older than this context is not
    // addressed to it
    let started = Utc::now();

    loop {
        let message = tokio::select! {
            _ = poll.tick() => {
                match store.get(KEY_BROADCAST) {
                    Ok(Some(raw)) => match CrossTabMessage::parse(&raw) {
                        Ok(message) if message.timestamp < started => None,
                        Ok(message) => Some(message),
                        Err(e) => {
                            // logged and dropped; the handler keeps running
                            tracing::warn!("PROTOCOL_INCONSISTENCY | error={e}");
                            None
                        }
                    },
                    Ok(None) => None,
                    Err(e) => {
                        tracing::warn!("IO_TRANSIENT | op=crosstab.poll error={e}");
                        None
                    }
                }
            }
            fast = recv_fast(&mut fast_rx) => fast,
        };

        let Some(message) = message else { continue };

        // self-echo suppression
        if message.session_id == session_id {
            continue;
        }
        let fingerprint = message.fingerprint();
        if recent.contains(&fingerprint) {
            continue;
        }
        if recent.len() == DEDUPE_DEPTH {
            recent.pop_front();
        }
        recent.push_back(fingerprint);

        tracing::debug!(
            "CROSSTAB_RECEIVED | kind={} from={}",
            message.kind.as_str(),
            message.session_id
        );
        if inbound_tx.send(message).is_err() {
            // consumer gone; nothing left to coordinate
            break;
        }
    }
}

/// Await the fast path when present; otherwise park forever so the poll
/// branch drives the loop alone.
async fn recv_fast(
    rx: &mut Option<broadcast::Receiver<CrossTabMessage>>,
) -> Option<CrossTabMessage> {
    match rx {
        Some(receiver) => loop {
            match receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("CROSSTAB_LAGGED | skipped={skipped}");
                }
                Err(broadcast::error::RecvError::Closed) => std::future::pending().await,
            }
        },
        None => std::future::pending().await,
    }
}
