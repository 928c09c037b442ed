// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Security monitoring.
//!
//! Failed-login lockout, suspicious-activity tracking, and the poisoning-
//! resilient lock helpers the rest of the engine shares. The monitor can
//! unilaterally force session termination; its state outlives any single
//! session because it gates login itself.

pub mod locks;
pub mod monitor;

pub use locks::{resilient_read, resilient_write};
pub use monitor::{
    load_lockout, LockoutRecord, SecurityMonitor, Severity, SuspiciousEvent, SuspiciousKind,
    DEFAULT_ALERT_THRESHOLD, MAX_SUSPICIOUS_EVENTS,
};
