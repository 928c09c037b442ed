// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Warning countdown presented when an idle or session warning fires.
//!
//! The countdown ticks at 1 Hz and resolves exactly once to `Continue`,
//! `Logout`, or `Timeout`. A timer elapse and a user click can race; the
//! first resolution wins and later calls are no-ops. Non-visual feedback
//! (haptics, audio) plugs in through [`CountdownFeedback`] and is never
//! required for correctness.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time;

/// Terminal resolution of a countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningOutcome {
    /// User chose to stay signed in.
    Continue,
    /// User chose to sign out now.
    Logout,
    /// The countdown reached zero.
    Timeout,
}

impl WarningOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Logout => "logout",
            Self::Timeout => "timeout",
        }
    }
}

/// Optional side-channel feedback. Default impls make every hook opt-in.
pub trait CountdownFeedback: Send + Sync {
    fn on_tick(&self, _remaining: Duration) {}
    fn on_resolved(&self, _outcome: WarningOutcome) {}
}

struct Resolution {
    outcome: Mutex<Option<WarningOutcome>>,
    notify: Notify,
}

impl Resolution {
    fn try_resolve(&self, outcome: WarningOutcome) -> bool {
        let mut slot = match self.outcome.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.notify.notify_one();
        true
    }

    fn get(&self) -> Option<WarningOutcome> {
        match self.outcome.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Remote control for a running countdown. Cloneable; any holder may resolve.
#[derive(Clone)]
pub struct WarningHandle {
    resolution: Arc<Resolution>,
    ticks: watch::Receiver<Duration>,
}

impl WarningHandle {
    /// Resolve the countdown. Returns `true` when this call was the first.
    pub fn resolve(&self, outcome: WarningOutcome) -> bool {
        let first = self.resolution.try_resolve(outcome);
        if !first {
            tracing::debug!("COUNTDOWN_RESOLVE_IGNORED | outcome={}", outcome.as_str());
        }
        first
    }

    /// Watch the remaining time, updated once per second.
    pub fn ticks(&self) -> watch::Receiver<Duration> {
        self.ticks.clone()
    }
}

/// One countdown interaction.
pub struct WarningCountdown {
    initial: Duration,
    resolution: Arc<Resolution>,
    tick_tx: watch::Sender<Duration>,
    feedback: Vec<Arc<dyn CountdownFeedback>>,
}

impl WarningCountdown {
    /// Create a countdown and its handle.
    pub fn new(initial: Duration) -> (Self, WarningHandle) {
        let resolution = Arc::new(Resolution {
            outcome: Mutex::new(None),
            notify: Notify::new(),
        });
        let (tick_tx, ticks) = watch::channel(initial);
        let countdown = Self {
            initial,
            resolution: Arc::clone(&resolution),
            tick_tx,
            feedback: Vec::new(),
        };
        let handle = WarningHandle { resolution, ticks };
        (countdown, handle)
    }

    /// Attach a feedback channel.
    pub fn with_feedback(mut self, feedback: Arc<dyn CountdownFeedback>) -> Self {
        self.feedback.push(feedback);
        self
    }

    /// Run to resolution. Ticks at 1 Hz; resolves to `Timeout` when the
    /// initial duration runs out first.
    pub async fn run(self) -> WarningOutcome {
        let mut remaining = self.initial;
        let mut ticker = time::interval(Duration::from_secs(1));
        // the first interval tick completes immediately; skip it
        ticker.tick().await;

        loop {
            if self.resolution.get().is_some() {
                break;
            }
            tokio::select! {
                _ = self.resolution.notify.notified() => break,
                _ = ticker.tick() => {
                    remaining = remaining.saturating_sub(Duration::from_secs(1));
                    let _ = self.tick_tx.send(remaining);
                    for feedback in &self.feedback {
                        feedback.on_tick(remaining);
                    }
                    if remaining.is_zero() {
                        self.resolution.try_resolve(WarningOutcome::Timeout);
                        break;
                    }
                }
            }
        }

        let outcome = self.resolution.get().unwrap_or(WarningOutcome::Timeout);
        tracing::info!("COUNTDOWN_RESOLVED | outcome={}", outcome.as_str());
        for feedback in &self.feedback {
            feedback.on_resolved(outcome);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TickCounter {
        ticks: AtomicUsize,
        resolved: AtomicUsize,
    }

    impl CountdownFeedback for TickCounter {
        fn on_tick(&self, _remaining: Duration) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
        fn on_resolved(&self, _outcome: WarningOutcome) {
            self.resolved.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_after_initial_duration() {
        let (countdown, _handle) = WarningCountdown::new(Duration::from_secs(5));
        let outcome = countdown.run().await;
        assert_eq!(outcome, WarningOutcome::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_resolution_beats_timer() {
        let (countdown, handle) = WarningCountdown::new(Duration::from_secs(60));
        let runner = tokio::spawn(countdown.run());
        tokio::task::yield_now().await;

        time::advance(Duration::from_secs(3)).await;
        assert!(handle.resolve(WarningOutcome::Continue));
        let outcome = runner.await.unwrap();
        assert_eq!(outcome, WarningOutcome::Continue);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolution_is_idempotent() {
        let (countdown, handle) = WarningCountdown::new(Duration::from_secs(60));
        let runner = tokio::spawn(countdown.run());
        tokio::task::yield_now().await;

        assert!(handle.resolve(WarningOutcome::Logout));
        assert!(!handle.resolve(WarningOutcome::Continue));
        assert!(!handle.resolve(WarningOutcome::Timeout));
        assert_eq!(runner.await.unwrap(), WarningOutcome::Logout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_resolve_after_timeout_is_noop() {
        let (countdown, handle) = WarningCountdown::new(Duration::from_secs(2));
        let outcome = countdown.run().await;
        assert_eq!(outcome, WarningOutcome::Timeout);
        assert!(!handle.resolve(WarningOutcome::Continue));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_and_feedback() {
        let counter = Arc::new(TickCounter {
            ticks: AtomicUsize::new(0),
            resolved: AtomicUsize::new(0),
        });
        let (countdown, handle) = WarningCountdown::new(Duration::from_secs(4));
        let countdown =
            countdown.with_feedback(Arc::clone(&counter) as Arc<dyn CountdownFeedback>);
        let mut ticks = handle.ticks();

        let outcome = countdown.run().await;
        assert_eq!(outcome, WarningOutcome::Timeout);
        assert_eq!(counter.ticks.load(Ordering::SeqCst), 4);
        assert_eq!(counter.resolved.load(Ordering::SeqCst), 1);
        assert!(ticks.borrow_and_update().is_zero());
    }
}
