// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session engine.
//!
//! Composition root for one execution context: the login gate, the session
//! lifecycle, the idle monitor, the cross-tab coordinator, and the security
//! monitor, wired together over channels. The engine owns policy: which
//! component's signal turns into a logout, who gets told about it, and in
//! what order teardown runs. The components themselves stay mechanism-only.
//!
//! Logout ordering is fixed: preserve drafts, notify the server (best
//! effort), end the local session, tell the other tabs (only when the logout
//! originated here; a logout learned from a peer is never re-broadcast),
//! tell the background agent, clear persisted state, then emit the terminal
//! event carrying the reason-appropriate message.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::activity::{ActivityTracker, InputKind};
use crate::background::{AgentMessage, SessionSnapshot};
use crate::config::EngineConfig;
use crate::crosstab::{CrossTabCoordinator, CrossTabHandle, CrossTabMessage, MessageKind};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::idle::{IdleMonitor, IdlePhase};
use crate::security::{SecurityMonitor, SuspiciousKind};
use crate::session::{
    Session, SessionLifecycle, SessionReport, SessionSignal, TerminationReason,
};
use crate::store::{KeyValueStore, KEY_SESSION_SNAPSHOT};

/// Login credentials as presented to the backing auth service.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user_id: String,
    pub secret: String,
}

/// What the auth service hands back on a successful login.
#[derive(Debug, Clone)]
pub struct AuthGrant {
    pub user_id: String,
    pub token: String,
}

/// Backing auth service.
///
/// `login` distinguishes rejected credentials (`Ok(None)`, which consumes a
/// failed-attempt slot) from transport failures (`Err`, which does not; a
/// flaky network must never walk a user into a lockout).
#[allow(async_fn_in_trait)]
pub trait AuthClient {
    async fn login(&self, credentials: &Credentials) -> EngineResult<Option<AuthGrant>>;
    async fn refresh(&self) -> EngineResult<()>;
    async fn logout(&self, session_id: &str, reason: TerminationReason) -> EngineResult<()>;
}

/// Unsaved-work hook invoked synchronously before any teardown step.
pub trait DraftSink: Send + Sync {
    fn preserve(&self);
}

/// Result of a login attempt that reached the auth service.
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    Granted(Session),
    /// Credentials rejected. `locked_until` is set when this failure tripped
    /// the lockout.
    Rejected {
        locked_until: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Clone, Copy)]
struct PeerInfo {
    last_heartbeat: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
}

struct ActiveSession {
    lifecycle: SessionLifecycle,
    // held for its Drop abort; the pulse stream feeds it internally
    idle: IdleMonitor,
    tracker: Arc<ActivityTracker>,
    crosstab: CrossTabHandle,
    inbound: mpsc::UnboundedReceiver<CrossTabMessage>,
    signals: mpsc::UnboundedReceiver<SessionSignal>,
    peers: HashMap<String, PeerInfo>,
    multi_flagged: bool,
    logged_out: bool,
    pending_reason: Option<TerminationReason>,
    last_activity_wall: DateTime<Utc>,
}

enum Step {
    Signal(Option<SessionSignal>),
    Inbound(Option<CrossTabMessage>),
    Event(EngineEvent),
}

/// One context's session engine.
pub struct SessionEngine<A: AuthClient> {
    config: EngineConfig,
    auth: A,
    store: Arc<dyn KeyValueStore>,
    bus: EventBus,
    security: Arc<SecurityMonitor>,
    drafts: Option<Arc<dyn DraftSink>>,
    fast_path: Option<broadcast::Sender<CrossTabMessage>>,
    agent: Option<mpsc::UnboundedSender<AgentMessage>>,
    active: Option<ActiveSession>,
}

impl<A: AuthClient> SessionEngine<A> {
    pub fn new(config: EngineConfig, auth: A, store: Arc<dyn KeyValueStore>) -> EngineResult<Self> {
        let config = config.validated()?;
        let bus = EventBus::new();
        let security = Arc::new(SecurityMonitor::new(&config, Arc::clone(&store), bus.clone()));
        Ok(Self {
            config,
            auth,
            store,
            bus,
            security,
            drafts: None,
            fast_path: None,
            agent: None,
            active: None,
        })
    }

    /// Attach the host's direct pub/sub channel for low-latency cross-tab
    /// delivery. Contexts sharing a process pass clones of one sender.
    pub fn with_fast_path(mut self, tx: broadcast::Sender<CrossTabMessage>) -> Self {
        self.fast_path = Some(tx);
        self
    }

    pub fn with_draft_sink(mut self, drafts: Arc<dyn DraftSink>) -> Self {
        self.drafts = Some(drafts);
        self
    }

    /// Wire up the background agent's inbox.
    pub fn with_agent(mut self, agent: mpsc::UnboundedSender<AgentMessage>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    pub fn security(&self) -> &SecurityMonitor {
        &self.security
    }

    pub fn session(&self) -> Option<&Session> {
        self.active.as_ref().map(|a| a.lifecycle.session())
    }

    pub fn status(&self) -> Option<SessionReport> {
        self.active.as_ref().map(|a| a.lifecycle.status())
    }

    pub fn idle_phase(&self) -> Option<IdlePhase> {
        self.active.as_ref().map(|a| a.idle.phase())
    }

    /// Attempt a login. The lockout gate runs first and short-circuits
    /// without touching the auth service.
    pub async fn login(&mut self, credentials: &Credentials) -> EngineResult<LoginOutcome> {
        if self.active.is_some() {
            return Err(EngineError::config("a session is already active"));
        }
        self.security.check_login_allowed()?;

        let Some(grant) = self.auth.login(credentials).await? else {
            self.security.record_failed_attempt();
            return Ok(LoginOutcome::Rejected {
                locked_until: self.security.locked_out(),
            });
        };
        self.security.record_success();

        let (signal_tx, signals) = mpsc::unbounded_channel();
        let lifecycle =
            SessionLifecycle::start(&self.config, &grant.user_id, self.bus.clone(), signal_tx)?;
        let tracker = Arc::new(ActivityTracker::all_inputs(self.config.throttle_delay()));
        let idle = IdleMonitor::spawn(&self.config, tracker.observe(), self.bus.clone())?;

        let mut coordinator = CrossTabCoordinator::new(
            lifecycle.session_id(),
            Arc::clone(&self.store),
            self.config.poll_interval(),
        );
        if let Some(tx) = &self.fast_path {
            coordinator = coordinator.with_fast_path(tx.clone());
        }
        let (crosstab, inbound) = coordinator.spawn();

        let now = Utc::now();
        let snapshot =
            SessionSnapshot::capture(lifecycle.session(), self.config.idle_timeout_ms, now);
        self.write_snapshot(&snapshot);
        if let Some(agent) = &self.agent {
            let _ = agent.send(AgentMessage::SessionStart { snapshot });
        }

        let session = lifecycle.session().clone();
        self.active = Some(ActiveSession {
            lifecycle,
            idle,
            tracker,
            crosstab,
            inbound,
            signals,
            peers: HashMap::new(),
            multi_flagged: false,
            logged_out: false,
            pending_reason: None,
            last_activity_wall: now,
        });
        Ok(LoginOutcome::Granted(session))
    }

    /// Report one raw input event. Returns `true` when the event survived
    /// throttling and reset the idle timers.
    pub fn report_activity(&mut self, kind: InputKind) -> bool {
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        if active.logged_out || !active.tracker.report(kind) {
            return false;
        }
        active.lifecycle.touch();
        active.last_activity_wall = Utc::now();
        if let Some(agent) = &self.agent {
            let _ = agent.send(AgentMessage::ActivityUpdate {
                at: active.last_activity_wall,
            });
        }
        true
    }

    /// Extend the current session: server-side renewal first, then the local
    /// timers reschedule so the new expiry is `now + extra`.
    pub async fn extend_session(&mut self, extra: Duration) -> EngineResult<()> {
        let Some(active) = self.active.as_ref() else {
            return Err(EngineError::config("no active session to extend"));
        };
        if active.logged_out {
            return Err(EngineError::config("session already ended"));
        }
        self.auth.refresh().await?;
        active.lifecycle.extend(extra);
        Ok(())
    }

    /// Tell the background agent the context lost foreground status.
    pub fn go_background(&self) {
        if let Some(agent) = &self.agent {
            let _ = agent.send(AgentMessage::GoBackground);
        }
    }

    pub fn go_foreground(&self) {
        if let Some(agent) = &self.agent {
            let _ = agent.send(AgentMessage::GoForeground);
        }
    }

    /// User-initiated logout.
    pub async fn logout(&mut self, reason: TerminationReason) -> EngineResult<()> {
        self.logout_with(reason, true).await
    }

    /// Drive the engine until the session terminates. Returns the reason.
    pub async fn run(&mut self) -> EngineResult<TerminationReason> {
        let mut events = self.bus.subscribe();
        loop {
            let step = {
                let Some(active) = self.active.as_mut() else {
                    return Err(EngineError::config("run() requires a live session"));
                };
                tokio::select! {
                    signal = active.signals.recv() => Step::Signal(signal),
                    message = active.inbound.recv() => Step::Inbound(message),
                    event = events.recv() => match event {
                        Ok(event) => Step::Event(event),
                        // the engine holds the bus sender, so Closed cannot
                        // occur; Lagged skips ahead
                        Err(_) => continue,
                    },
                }
            };

            match step {
                Step::Signal(Some(SessionSignal::Heartbeat { session_id, at })) => {
                    self.on_heartbeat(session_id, at).await;
                }
                Step::Signal(Some(SessionSignal::Warning { .. })) => {
                    // the bus already carried session:warning to the shell
                }
                Step::Signal(Some(SessionSignal::Expired)) => {
                    self.logout_with(TerminationReason::SessionExpired, true)
                        .await?;
                    self.active = None;
                    return Ok(TerminationReason::SessionExpired);
                }
                Step::Signal(Some(SessionSignal::Ended { reason })) => {
                    self.active = None;
                    return Ok(reason);
                }
                Step::Signal(None) => {
                    let reason = self
                        .active
                        .take()
                        .and_then(|a| a.pending_reason)
                        .unwrap_or(TerminationReason::UserLogout);
                    return Ok(reason);
                }
                Step::Inbound(Some(message)) => {
                    self.on_peer_message(message).await?;
                }
                Step::Inbound(None) => {
                    // coordinator task gone; the session can still end on its
                    // own timers, so keep running
                    tracing::warn!("CROSSTAB_CHANNEL_CLOSED | continuing=true");
                }
                Step::Event(EngineEvent::IdleTimeout) => {
                    self.logout_with(TerminationReason::IdleTimeout, true).await?;
                }
                Step::Event(EngineEvent::ForcedLogout { reason, .. }) => {
                    // security monitor (or our own teardown); idempotent
                    self.logout_with(reason, true).await?;
                }
                Step::Event(_) => {}
            }
        }
    }

    async fn on_heartbeat(&self, session_id: String, at: DateTime<Utc>) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let message = active
            .crosstab
            .message(MessageKind::Heartbeat)
            .with_payload(json!({
                "start_time": active.lifecycle.session().start_time.to_rfc3339(),
            }));
        if let Err(e) = active.crosstab.broadcast(message).await {
            tracing::warn!("IO_TRANSIENT | op=heartbeat.broadcast error={e}");
        }
        if let Some(agent) = &self.agent {
            let _ = agent.send(AgentMessage::Heartbeat { session_id, at });
        }
        let snapshot = SessionSnapshot::capture(
            active.lifecycle.session(),
            self.config.idle_timeout_ms,
            active.last_activity_wall,
        );
        self.write_snapshot(&snapshot);
    }

    async fn on_peer_message(&mut self, message: CrossTabMessage) -> EngineResult<()> {
        match message.kind {
            MessageKind::Logout => {
                self.logout_with(TerminationReason::RemoteLogout, false).await
            }
            MessageKind::ForceLogout => {
                let self_id = self
                    .active
                    .as_ref()
                    .map(|a| a.lifecycle.session_id().to_string())
                    .unwrap_or_default();
                if message.payload_str("keep") == Some(self_id.as_str()) {
                    tracing::info!("FORCE_LOGOUT_SPARED | session={self_id}");
                    return Ok(());
                }
                let reason = message
                    .payload_str("reason")
                    .and_then(parse_reason)
                    .unwrap_or(TerminationReason::RemoteLogout);
                self.logout_with(reason, false).await
            }
            MessageKind::Heartbeat => {
                self.on_peer_heartbeat(message).await;
                Ok(())
            }
            MessageKind::Warning | MessageKind::ActivityUpdate => Ok(()),
        }
    }

    /// Track peer liveness and sweep excess concurrent sessions, keeping the
    /// newest one running.
    async fn on_peer_heartbeat(&mut self, message: CrossTabMessage) {
        let silence =
            ChronoDuration::milliseconds((self.config.heartbeat_interval_ms * 3) as i64);
        let limit = self.config.max_concurrent_sessions;
        let now = Utc::now();

        let Some(active) = self.active.as_mut() else {
            return;
        };
        let start_time = message
            .payload_str("start_time")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));
        active.peers.insert(
            message.session_id.clone(),
            PeerInfo {
                last_heartbeat: message.timestamp,
                start_time,
            },
        );
        active.peers.retain(|_, p| now - p.last_heartbeat <= silence);

        let live = active.peers.len() + 1;
        if live <= limit {
            active.multi_flagged = false;
            return;
        }
        if active.multi_flagged {
            return;
        }
        active.multi_flagged = true;

        let self_id = active.lifecycle.session_id().to_string();
        let mut keeper = (self_id.clone(), active.lifecycle.session().start_time);
        for (id, peer) in &active.peers {
            if let Some(start) = peer.start_time {
                if start > keeper.1 {
                    keeper = (id.clone(), start);
                }
            }
        }
        tracing::warn!(
            "MULTI_SESSION_SWEEP | live={live} limit={limit} keep={}",
            keeper.0
        );
        let sweep = active
            .crosstab
            .message(MessageKind::ForceLogout)
            .with_payload(json!({
                "keep": keeper.0,
                "reason": TerminationReason::SecurityForced.as_str(),
            }));
        if let Err(e) = active.crosstab.broadcast(sweep).await {
            tracing::warn!("IO_TRANSIENT | op=sweep.broadcast error={e}");
        }

        if keeper.0 == self_id {
            // this context survives; record the alert without the critical
            // path that would force logout here too
            self.bus.emit(EngineEvent::SecurityAlert {
                kind: SuspiciousKind::MultipleSessions,
                detail: format!("{live} live sessions, limit {limit}; peers swept"),
                critical: false,
            });
        } else {
            self.security.detect_suspicious(
                SuspiciousKind::MultipleSessions,
                &format!("{live} live sessions, limit {limit}"),
            );
            // the sweep broadcast above already tells every context what to
            // do; ending here without a second broadcast keeps the keeper up
            if let Err(e) = self
                .logout_with(TerminationReason::SecurityForced, false)
                .await
            {
                tracing::warn!("LOGOUT_FAILED | error={e}");
            }
        }
    }

    async fn logout_with(
        &mut self,
        reason: TerminationReason,
        locally_originated: bool,
    ) -> EngineResult<()> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        if active.logged_out {
            return Ok(());
        }
        active.logged_out = true;
        active.pending_reason = Some(reason);
        let session_id = active.lifecycle.session_id().to_string();
        tracing::info!(
            "LOGOUT_BEGIN | session={session_id} reason={} local={locally_originated}",
            reason.as_str()
        );

        if let Some(drafts) = &self.drafts {
            drafts.preserve();
        }

        // server notification is best effort; local termination proceeds
        if let Err(e) = self.auth.logout(&session_id, reason).await {
            tracing::warn!("LOGOUT_SERVER_FAILED | session={session_id} error={e}");
        }

        active.lifecycle.end(reason);

        if locally_originated {
            let message = active
                .crosstab
                .message(MessageKind::Logout)
                .with_payload(json!({ "reason": reason.as_str() }));
            if let Err(e) = active.crosstab.broadcast(message).await {
                tracing::warn!("IO_TRANSIENT | op=logout.broadcast error={e}");
            }
        }

        if let Some(agent) = &self.agent {
            let _ = agent.send(AgentMessage::SessionEnd { reason });
        }
        if let Err(e) = self.store.remove(KEY_SESSION_SNAPSHOT) {
            tracing::warn!("IO_TRANSIENT | op=snapshot.clear error={e}");
        }
        self.bus.emit(EngineEvent::ForcedLogout {
            reason,
            message: reason.user_message().to_string(),
        });
        Ok(())
    }

    fn write_snapshot(&self, snapshot: &SessionSnapshot) {
        match serde_json::to_string(snapshot) {
            Ok(raw) => {
                if let Err(e) = self.store.set(KEY_SESSION_SNAPSHOT, &raw) {
                    tracing::warn!("IO_TRANSIENT | op=snapshot.persist error={e}");
                }
            }
            Err(e) => tracing::error!("SNAPSHOT_ENCODE_FAILED | error={e}"),
        }
    }
}

fn parse_reason(raw: &str) -> Option<TerminationReason> {
    serde_json::from_value(Value::String(raw.to_owned())).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SecurityViolation;
    use crate::store::{MemoryStore, KEY_BROADCAST};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct MockAuth {
        accept: Arc<AtomicBool>,
        logouts: Arc<Mutex<Vec<(String, TerminationReason)>>>,
    }

    impl MockAuth {
        fn accepting() -> Self {
            let auth = Self::default();
            auth.accept.store(true, Ordering::SeqCst);
            auth
        }

        fn logouts(&self) -> Vec<(String, TerminationReason)> {
            self.logouts.lock().unwrap().clone()
        }
    }

    impl AuthClient for MockAuth {
        async fn login(&self, credentials: &Credentials) -> EngineResult<Option<AuthGrant>> {
            if self.accept.load(Ordering::SeqCst) {
                Ok(Some(AuthGrant {
                    user_id: credentials.user_id.clone(),
                    token: "tok".to_string(),
                }))
            } else {
                Ok(None)
            }
        }

        async fn refresh(&self) -> EngineResult<()> {
            Ok(())
        }

        async fn logout(&self, session_id: &str, reason: TerminationReason) -> EngineResult<()> {
            self.logouts
                .lock()
                .unwrap()
                .push((session_id.to_string(), reason));
            Ok(())
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            user_id: "user-1".to_string(),
            secret: "hunter2".to_string(),
        }
    }

    #[tokio::test]
    async fn test_rejected_logins_walk_into_lockout() {
        let config = EngineConfig {
            max_failed_attempts: 3,
            ..EngineConfig::default()
        };
        let auth = MockAuth::default(); // rejects everything
        let store = Arc::new(MemoryStore::new());
        let mut engine = SessionEngine::new(config, auth, store).unwrap();

        for _ in 0..2 {
            match engine.login(&credentials()).await.unwrap() {
                LoginOutcome::Rejected { locked_until: None } => {}
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        // third failure trips the lockout
        match engine.login(&credentials()).await.unwrap() {
            LoginOutcome::Rejected {
                locked_until: Some(_),
            } => {}
            other => panic!("expected lockout, got {other:?}"),
        }
        // the gate now rejects before reaching the auth service
        let err = engine.login(&credentials()).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::SecurityViolation(SecurityViolation::LockedOut { .. })
        ));
    }

    #[tokio::test]
    async fn test_login_starts_session_and_persists_snapshot() {
        let auth = MockAuth::accepting();
        let store = Arc::new(MemoryStore::new());
        let mut engine = SessionEngine::new(
            EngineConfig::default(),
            auth,
            Arc::clone(&store) as Arc<dyn KeyValueStore>,
        )
        .unwrap();

        let outcome = engine.login(&credentials()).await.unwrap();
        let session = match outcome {
            LoginOutcome::Granted(session) => session,
            other => panic!("expected grant, got {other:?}"),
        };
        assert!(session.session_id.starts_with("sess_"));
        assert_eq!(session.user_id, "user-1");
        assert_eq!(engine.session().unwrap().session_id, session.session_id);

        let raw = store.get(KEY_SESSION_SNAPSHOT).unwrap().unwrap();
        let snapshot: SessionSnapshot = serde_json::from_str(&raw).unwrap();
        assert_eq!(snapshot.session_id, session.session_id);

        // double login is a usage error
        assert!(engine.login(&credentials()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_runs_full_logout() {
        let config = EngineConfig {
            idle_timeout_ms: 5_000,
            idle_warning_lead_ms: 1_000,
            ..EngineConfig::default()
        };
        let auth = MockAuth::accepting();
        let store = Arc::new(MemoryStore::new());
        let mut engine =
            SessionEngine::new(config, auth.clone(), Arc::clone(&store) as Arc<dyn KeyValueStore>)
                .unwrap();
        let mut events = engine.subscribe();

        engine.login(&credentials()).await.unwrap();
        let session_id = engine.session().unwrap().session_id.clone();

        let reason = engine.run().await.unwrap();
        assert_eq!(reason, TerminationReason::IdleTimeout);

        // server notified with the right reason
        assert_eq!(auth.logouts(), vec![(session_id, TerminationReason::IdleTimeout)]);
        // persisted snapshot cleaned up, peers told
        assert!(store.get(KEY_SESSION_SNAPSHOT).unwrap().is_none());
        let broadcast = CrossTabMessage::parse(&store.get(KEY_BROADCAST).unwrap().unwrap()).unwrap();
        assert_eq!(broadcast.kind, MessageKind::Logout);
        assert_eq!(broadcast.payload_str("reason"), Some("idle_timeout"));

        // the shell saw warning, timeout, and the terminal event in order
        let mut saw_warning = false;
        let mut terminal = None;
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::IdleWarning { .. } => saw_warning = true,
                EngineEvent::ForcedLogout { reason, message } => {
                    terminal = Some((reason, message));
                }
                _ => {}
            }
        }
        assert!(saw_warning);
        let (reason, message) = terminal.unwrap();
        assert_eq!(reason, TerminationReason::IdleTimeout);
        assert_eq!(message, TerminationReason::IdleTimeout.user_message());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_expiry_ends_run() {
        let config = EngineConfig {
            session_max_duration_ms: 10_000,
            session_warning_lead_ms: 2_000,
            idle_timeout_ms: 60_000,
            idle_warning_lead_ms: 5_000,
            ..EngineConfig::default()
        };
        let auth = MockAuth::accepting();
        let store = Arc::new(MemoryStore::new());
        let mut engine =
            SessionEngine::new(config, auth.clone(), Arc::clone(&store) as Arc<dyn KeyValueStore>)
                .unwrap();

        engine.login(&credentials()).await.unwrap();
        let reason = engine.run().await.unwrap();
        assert_eq!(reason, TerminationReason::SessionExpired);
        assert_eq!(auth.logouts()[0].1, TerminationReason::SessionExpired);
        assert!(engine.session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_logout_is_not_rebroadcast() {
        let config = EngineConfig {
            idle_timeout_ms: 600_000,
            ..EngineConfig::default()
        };
        let auth = MockAuth::accepting();
        let store = Arc::new(MemoryStore::new());
        let mut engine =
            SessionEngine::new(config, auth.clone(), Arc::clone(&store) as Arc<dyn KeyValueStore>)
                .unwrap();

        engine.login(&credentials()).await.unwrap();
        // let the coordinator task come up before the peer writes
        tokio::task::yield_now().await;

        // another tab announces its logout through the shared slot
        let peer = CrossTabMessage::new(MessageKind::Logout, "sess_peer");
        store
            .set(KEY_BROADCAST, &serde_json::to_string(&peer).unwrap())
            .unwrap();

        let reason = engine.run().await.unwrap();
        assert_eq!(reason, TerminationReason::RemoteLogout);

        // no echo: the slot still holds the peer's message
        let slot = CrossTabMessage::parse(&store.get(KEY_BROADCAST).unwrap().unwrap()).unwrap();
        assert_eq!(slot.session_id, "sess_peer");
    }

    #[tokio::test(start_paused = true)]
    async fn test_relogin_survives_stale_logout_in_slot() {
        let auth = MockAuth::accepting();
        let store = Arc::new(MemoryStore::new());

        // first context logs in and out, leaving its logout in the slot
        let mut first = SessionEngine::new(
            EngineConfig::default(),
            auth.clone(),
            Arc::clone(&store) as Arc<dyn KeyValueStore>,
        )
        .unwrap();
        first.login(&credentials()).await.unwrap();
        first.logout(TerminationReason::UserLogout).await.unwrap();
        let slot = CrossTabMessage::parse(&store.get(KEY_BROADCAST).unwrap().unwrap()).unwrap();
        assert_eq!(slot.kind, MessageKind::Logout);

        // a new context on the same store must not be killed by the leftover
        let mut second = SessionEngine::new(
            EngineConfig::default(),
            auth.clone(),
            Arc::clone(&store) as Arc<dyn KeyValueStore>,
        )
        .unwrap();
        second.login(&credentials()).await.unwrap();
        tokio::select! {
            reason = second.run() => panic!("fresh session terminated: {reason:?}"),
            _ = tokio::time::sleep(Duration::from_secs(10)) => {}
        }
        assert!(second.session().is_some());
    }

    #[tokio::test]
    async fn test_activity_reporting_requires_session() {
        let auth = MockAuth::accepting();
        let store = Arc::new(MemoryStore::new());
        let mut engine =
            SessionEngine::new(EngineConfig::default(), auth, store).unwrap();
        assert!(!engine.report_activity(InputKind::Pointer));

        engine.login(&credentials()).await.unwrap();
        assert!(engine.report_activity(InputKind::Pointer));
        // throttled immediately after
        assert!(!engine.report_activity(InputKind::Pointer));
    }

    #[tokio::test]
    async fn test_user_logout_notifies_everyone() {
        let auth = MockAuth::accepting();
        let store = Arc::new(MemoryStore::new());
        let (agent_tx, mut agent_rx) = mpsc::unbounded_channel();
        let mut engine = SessionEngine::new(
            EngineConfig::default(),
            auth.clone(),
            Arc::clone(&store) as Arc<dyn KeyValueStore>,
        )
        .unwrap()
        .with_agent(agent_tx);

        engine.login(&credentials()).await.unwrap();
        // agent learned about the session start
        assert!(matches!(
            agent_rx.try_recv().unwrap(),
            AgentMessage::SessionStart { .. }
        ));

        engine.logout(TerminationReason::UserLogout).await.unwrap();
        assert_eq!(auth.logouts()[0].1, TerminationReason::UserLogout);
        assert!(matches!(
            agent_rx.try_recv().unwrap(),
            AgentMessage::SessionEnd {
                reason: TerminationReason::UserLogout
            }
        ));
        // idempotent
        engine.logout(TerminationReason::UserLogout).await.unwrap();
        assert_eq!(auth.logouts().len(), 1);
    }

    #[test]
    fn test_parse_reason_round_trip() {
        assert_eq!(
            parse_reason("session_expired"),
            Some(TerminationReason::SessionExpired)
        );
        assert_eq!(parse_reason("not_a_reason"), None);
    }
}
