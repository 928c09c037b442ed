// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! vigil - Client-resident session lifecycle engine
//!
//! Watches everything that can end a session (inactivity, absolute
//! duration, failed logins, suspicious behavior, peers in other tabs) and
//! coordinates a clean, cross-context logout when any of them fires.
//!
//! # Core Modules
//!
//! - [`engine`] - Composition root: login gate, logout ordering, peer policy
//! - [`session`] - Absolute session envelope with warning and expiry timers
//! - [`idle`] - Two-stage inactivity timer fed by activity pulses
//! - [`activity`] - Throttled normalization of raw input into pulses
//! - [`warning`] - 1 Hz countdown with first-resolution-wins semantics
//! - [`crosstab`] - Latest-wins broadcast slot plus optional fast path
//! - [`security`] - Failed-attempt lockout and suspicious-activity tracking
//! - [`background`] - Store-driven agent that enforces while tabs are gone
//! - [`store`] - Shared persisted key-value medium (memory and file backed)
//! - [`events`] - Structured events the UI shell subscribes to
//! - [`config`] - Timer configuration, validated at construction
//! - [`error`] - Error taxonomy with per-category propagation policy

pub mod activity;
pub mod background;
pub mod config;
pub mod crosstab;
pub mod engine;
pub mod error;
pub mod events;
pub mod idle;
pub mod security;
pub mod session;
pub mod store;
pub mod warning;

// Re-export the types most hosts touch directly
pub use config::EngineConfig;
pub use engine::{AuthClient, AuthGrant, Credentials, DraftSink, LoginOutcome, SessionEngine};
pub use error::{EngineError, EngineResult, SecurityViolation};
pub use events::{EngineEvent, EventBus};

pub use activity::{ActivityTracker, InputKind, Pulse};
pub use background::{AgentMessage, BackgroundMonitor, SessionSnapshot, WakeForeground};
pub use crosstab::{CrossTabCoordinator, CrossTabHandle, CrossTabMessage, MessageKind};
pub use idle::{IdleMonitor, IdlePhase};
pub use security::{SecurityMonitor, Severity, SuspiciousEvent, SuspiciousKind};
pub use session::{
    Session, SessionLifecycle, SessionReport, SessionSignal, SessionStatus, TerminationReason,
};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use warning::{CountdownFeedback, WarningCountdown, WarningHandle, WarningOutcome};
