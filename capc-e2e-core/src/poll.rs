//! Deadline poller.
//!
//! [`poll_until`] runs a [`Probe`] immediately and then once per interval
//! until the probe settles (`Found` / `Error`), the deadline budget is spent,
//! or the run is cancelled. Timing guarantees:
//! - the probe is never invoked again after it settles
//! - total wall time is bounded by `deadline + interval`; a single slow probe
//!   is abandoned (and asked to stop) rather than allowed to overrun
//! - a zero deadline probes exactly once
//! - cancellation is observed while sleeping and while a probe is in flight

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Serialize, Serializer};
use tracing::{debug, info};

use crate::cancel::CancelToken;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Longest deadline or interval a wait honours; anything larger is clamped.
pub const MAX_WAIT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Result of a single probe invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum PollResult {
    /// Satisfied; carries the evidence (for log scans, the matching path).
    Found(String),
    /// Not yet satisfied; keep polling.
    NotFound,
    /// The probe itself failed; polling stops.
    Error(String),
}

impl PollResult {
    /// `Found` and `Error` end polling.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::NotFound)
    }
}

/// Terminal condition of a [`poll_until`] run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum PollOutcome {
    Found(String),
    /// Deadline spent without the probe settling.
    NotFound,
    Error(String),
    /// Stopped by external cancellation; not a verdict on the probe.
    Cancelled,
}

impl From<PollResult> for PollOutcome {
    fn from(result: PollResult) -> Self {
        match result {
            PollResult::Found(evidence) => Self::Found(evidence),
            PollResult::NotFound => Self::NotFound,
            PollResult::Error(cause) => Self::Error(cause),
        }
    }
}

impl fmt::Display for PollOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Found(evidence) => write!(f, "found ({evidence})"),
            Self::NotFound => write!(f, "not found"),
            Self::Error(cause) => write!(f, "error ({cause})"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Summary of a [`poll_until`] run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub outcome: PollOutcome,
    pub attempts: u32,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

pub(crate) fn serialize_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

/// Tick spacing and total wait budget for one named wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeadlineBudget {
    #[serde(rename = "deadline_ms", serialize_with = "serialize_millis")]
    pub deadline: Duration,
    #[serde(rename = "interval_ms", serialize_with = "serialize_millis")]
    pub interval: Duration,
}

impl DeadlineBudget {
    /// Intervals below 1ms are raised to 1ms so a misconfigured budget
    /// cannot spin. Both values are capped at [`MAX_WAIT`].
    pub fn new(deadline: Duration, interval: Duration) -> Self {
        Self {
            deadline: deadline.min(MAX_WAIT),
            interval: interval.clamp(MIN_INTERVAL, MAX_WAIT),
        }
    }
}

impl fmt::Display for DeadlineBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "deadline {} / interval {}",
            humantime::format_duration(self.deadline),
            humantime::format_duration(self.interval)
        )
    }
}

/// Stop request for an in-flight probe.
///
/// Raised when the poller abandons an attempt (cancellation or a probe that
/// overran its slot). Long-running probes should check it between units of
/// work.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A single "is it there yet?" check.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Human-readable description for logs.
    fn describe(&self) -> String;

    async fn probe(&self, stop: &StopFlag) -> PollResult;
}

/// Poll `probe` under `budget` until it settles, the deadline passes, or
/// `cancel` fires.
pub async fn poll_until<P>(probe: &P, budget: DeadlineBudget, cancel: &CancelToken) -> PollReport
where
    P: Probe + ?Sized,
{
    let started = Instant::now();
    // Fields are public, so a budget built by hand may skip the cap in `new`.
    let deadline = started + budget.deadline.min(MAX_WAIT);
    let description = probe.describe();
    let mut attempts: u32 = 0;

    let finish = |outcome: PollOutcome, attempts: u32| PollReport {
        outcome,
        attempts,
        elapsed: started.elapsed(),
    };

    debug!(probe = %description, %budget, "Polling");

    loop {
        if cancel.is_cancelled() {
            return finish(PollOutcome::Cancelled, attempts);
        }

        attempts = attempts.saturating_add(1);
        let stop = StopFlag::new();
        // At least one interval per attempt so a zero or nearly-spent
        // deadline still gets one real look.
        let slot = deadline
            .saturating_duration_since(Instant::now())
            .max(budget.interval);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                stop.raise();
                debug!(probe = %description, attempt = attempts, "Cancelled during probe");
                return finish(PollOutcome::Cancelled, attempts);
            }
            res = tokio::time::timeout(slot, probe.probe(&stop)) => match res {
                Ok(result) => result,
                Err(_) => {
                    stop.raise();
                    debug!(probe = %description, attempt = attempts, ?slot, "Probe overran its slot");
                    PollResult::NotFound
                }
            },
        };

        if result.is_settled() {
            info!(
                probe = %description,
                attempt = attempts,
                elapsed = ?started.elapsed(),
                "Probe settled"
            );
            return finish(result.into(), attempts);
        }

        let now = Instant::now();
        if now >= deadline {
            debug!(probe = %description, attempts, "Deadline reached");
            return finish(PollOutcome::NotFound, attempts);
        }

        let wait = budget.interval.min(deadline - now);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(probe = %description, attempt = attempts, "Cancelled while waiting");
                return finish(PollOutcome::Cancelled, attempts);
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
