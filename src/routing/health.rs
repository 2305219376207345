//! Per-Backend Health Metering
//!
//! Rolling health signals for one backend: call counters over trailing 60 s
//! and 600 s windows, a bounded history of recent response latencies, and a
//! consecutive-failure streak valid within a trailing 5-minute window.
//!
//! # Windowing Model
//!
//! Counters are lazily rebased, not actively decayed: the first record after
//! a window has fully elapsed since the last activity opens a fresh window
//! seeded with that call. This trades a small staleness window for having no
//! background timers. Read accessors report a window-expired value as zero
//! without mutating anything; the selection path stays read-only and the
//! actual rebase happens on the next record.
//!
//! # Thread Safety
//!
//! All state lives behind a single `parking_lot::Mutex`, so counters and the
//! latency history can never tear apart under concurrent recording.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

// ============================================================================
// Window and Threshold Constants
// ============================================================================

/// Trailing window for the 1-minute call counter
pub const MINUTE_WINDOW: Duration = Duration::from_secs(60);

/// Trailing window for the 10-minute call counter and latency history
pub const TEN_MINUTE_WINDOW: Duration = Duration::from_secs(600);

/// Trailing window within which a failure streak stays valid
pub const FAILURE_WINDOW: Duration = Duration::from_secs(300);

/// Bounded capacity of the latency history
pub const LATENCY_HISTORY_CAP: usize = 10;

/// Failure streak at which a backend is considered overloaded
pub const OVERLOAD_FAILURE_STREAK: u32 = 2;

/// 1-minute call count at which a backend is considered overloaded
pub const OVERLOAD_CALLS_PER_MINUTE: u32 = 3;

/// 10-minute call count at which a backend is considered overloaded
pub const OVERLOAD_CALLS_PER_TEN_MINUTES: u32 = 30;

/// Average latency at which a backend is considered overloaded
pub const OVERLOAD_AVG_LATENCY: Duration = Duration::from_secs(20);

// ============================================================================
// Meter State
// ============================================================================

#[derive(Debug, Default)]
struct MeterState {
    total_calls: u64,
    calls_last_60s: u32,
    calls_last_600s: u32,
    latencies: VecDeque<Duration>,
    consecutive_failures: u32,
    last_activity: Option<Instant>,
}

impl MeterState {
    /// Whether `window` has fully elapsed since the last activity.
    /// No prior activity counts as elapsed: the next record opens a fresh window.
    fn window_elapsed(&self, now: Instant, window: Duration) -> bool {
        self.last_activity
            .is_none_or(|last| now.saturating_duration_since(last) > window)
    }

    fn average_latency(&self) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.latencies.iter().sum();
        total / self.latencies.len() as u32
    }
}

// ============================================================================
// Meter Snapshot
// ============================================================================

/// Point-in-time view of a meter, with window expiry already applied
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MeterSnapshot {
    /// Lifetime successful call count
    pub total_calls: u64,
    /// Successful calls in the trailing 60 s window
    pub calls_last_60s: u32,
    /// Successful calls in the trailing 600 s window
    pub calls_last_600s: u32,
    /// Failure streak within the trailing 5-minute window
    pub consecutive_failures: u32,
    /// Mean of the bounded latency history (zero when empty)
    pub average_latency: Duration,
}

impl MeterSnapshot {
    /// Whether any overload threshold holds for this snapshot
    #[must_use]
    pub fn is_overloaded(&self) -> bool {
        self.consecutive_failures >= OVERLOAD_FAILURE_STREAK
            || self.calls_last_60s >= OVERLOAD_CALLS_PER_MINUTE
            || self.calls_last_600s >= OVERLOAD_CALLS_PER_TEN_MINUTES
            || self.average_latency >= OVERLOAD_AVG_LATENCY
    }
}

// ============================================================================
// Backend Meter
// ============================================================================

/// Rolling health state for a single backend.
///
/// Mutated only by the recording step after a call completes or fails; the
/// selection step only reads snapshots.
#[derive(Debug, Default)]
pub struct BackendMeter {
    state: Mutex<MeterState>,
}

impl BackendMeter {
    /// Create a meter with no recorded activity
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful call and its response latency
    pub fn record_success(&self, elapsed: Duration) {
        self.record_success_at(Instant::now(), elapsed);
    }

    /// Record a failed call. Failures do not count toward the 1-/10-minute
    /// call counters; they only feed the failure streak.
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    /// Mean of the latency history, or zero when nothing has been recorded
    #[must_use]
    pub fn average_latency(&self) -> Duration {
        self.state.lock().average_latency()
    }

    /// Successful calls in the trailing 60 s window
    #[must_use]
    pub fn calls_last_60s(&self) -> u32 {
        self.snapshot().calls_last_60s
    }

    /// Successful calls in the trailing 600 s window
    #[must_use]
    pub fn calls_last_600s(&self) -> u32 {
        self.snapshot().calls_last_600s
    }

    /// Failure streak, zero once the 5-minute window has elapsed
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.snapshot().consecutive_failures
    }

    /// Lifetime successful call count
    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.state.lock().total_calls
    }

    /// Consistent point-in-time view of all signals
    #[must_use]
    pub fn snapshot(&self) -> MeterSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub(crate) fn record_success_at(&self, now: Instant, elapsed: Duration) {
        let mut state = self.state.lock();

        state.total_calls += 1;
        state.consecutive_failures = 0;

        if state.window_elapsed(now, MINUTE_WINDOW) {
            // This call opens the fresh 1-minute window
            state.calls_last_60s = 1;
        } else {
            state.calls_last_60s += 1;
        }

        if state.window_elapsed(now, TEN_MINUTE_WINDOW) {
            state.calls_last_600s = 1;
            state.latencies.clear();
        } else {
            state.calls_last_600s += 1;
        }
        if state.latencies.len() == LATENCY_HISTORY_CAP {
            state.latencies.pop_front();
        }
        state.latencies.push_back(elapsed);

        state.last_activity = Some(now);
    }

    pub(crate) fn record_failure_at(&self, now: Instant) {
        let mut state = self.state.lock();

        if state.window_elapsed(now, FAILURE_WINDOW) {
            state.consecutive_failures = 1;
        } else {
            state.consecutive_failures += 1;
        }

        state.last_activity = Some(now);
    }

    pub(crate) fn snapshot_at(&self, now: Instant) -> MeterSnapshot {
        let state = self.state.lock();

        MeterSnapshot {
            total_calls: state.total_calls,
            calls_last_60s: if state.window_elapsed(now, MINUTE_WINDOW) {
                0
            } else {
                state.calls_last_60s
            },
            calls_last_600s: if state.window_elapsed(now, TEN_MINUTE_WINDOW) {
                0
            } else {
                state.calls_last_600s
            },
            consecutive_failures: if state.window_elapsed(now, FAILURE_WINDOW) {
                0
            } else {
                state.consecutive_failures
            },
            average_latency: state.average_latency(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
