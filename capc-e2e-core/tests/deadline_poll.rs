//! Deadline poller timing against real log trees.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use capc_e2e_core::signature::{CAPC_CONTROLLER_MARKER, NO_MATCH_FOUND_PREFIX};
use capc_e2e_core::{
    CancelSource, CancelToken, DeadlineBudget, ExpectedSignature, LogFileFilter, PollOutcome,
    PollResult, Probe, SignatureMatcher, StopFlag, poll_until,
};
use common::LogTree;
use common::fixtures::{BAD_OFFERING, CONTROLLER_LOG, rejection_log};

#[ctor::ctor]
fn setup() {
    common::init_test_logging();
}

/// Wraps a matcher and counts invocations, including any after it settled.
struct CountingProbe {
    inner: SignatureMatcher,
    calls: AtomicU32,
    calls_after_settle: AtomicU32,
    settled: AtomicBool,
}

impl CountingProbe {
    fn new(tree: &LogTree) -> Self {
        Self {
            inner: SignatureMatcher::new(
                tree.root(),
                LogFileFilter::controller_manager_log(CAPC_CONTROLLER_MARKER),
                ExpectedSignature::new(NO_MATCH_FOUND_PREFIX, BAD_OFFERING),
            ),
            calls: AtomicU32::new(0),
            calls_after_settle: AtomicU32::new(0),
            settled: AtomicBool::new(false),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Probe for CountingProbe {
    fn describe(&self) -> String {
        format!("counting {}", self.inner.describe())
    }

    async fn probe(&self, stop: &StopFlag) -> PollResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.settled.load(Ordering::SeqCst) {
            self.calls_after_settle.fetch_add(1, Ordering::SeqCst);
        }
        let result = self.inner.probe(stop).await;
        if result.is_settled() {
            self.settled.store(true, Ordering::SeqCst);
        }
        result
    }
}

fn budget(deadline_ms: u64, interval_ms: u64) -> DeadlineBudget {
    DeadlineBudget::new(Duration::from_millis(deadline_ms), Duration::from_millis(interval_ms))
}

#[tokio::test]
async fn test_no_probe_after_found() {
    let tree = LogTree::new();
    let path = tree.write(CONTROLLER_LOG, rejection_log(BAD_OFFERING));
    let probe = CountingProbe::new(&tree);

    let report = poll_until(&probe, budget(2_000, 20), &CancelToken::never()).await;
    // Give a misbehaving poller the chance to probe again.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(report.outcome, PollOutcome::Found(path.display().to_string()));
    assert_eq!(probe.calls(), 1);
    assert_eq!(probe.calls_after_settle.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_found_after_signature_appears() {
    let tree = LogTree::new();
    tree.write(CONTROLLER_LOG, "I1016 10:00:00 starting manager\n");
    let probe = CountingProbe::new(&tree);

    let writer = {
        let path = tree.root().join(CONTROLLER_LOG);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            common::fixtures::write_file(&path, rejection_log(BAD_OFFERING).as_bytes());
        })
    };

    let report = poll_until(&probe, budget(3_000, 20), &CancelToken::never()).await;
    writer.await.unwrap();

    assert!(matches!(report.outcome, PollOutcome::Found(_)));
    assert!(report.attempts > 1);
    assert_eq!(report.attempts, probe.calls());
    assert_eq!(probe.calls_after_settle.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_not_found_only_after_deadline_and_within_bound() {
    let tree = LogTree::new();
    tree.write(CONTROLLER_LOG, rejection_log("another-offering"));
    let probe = CountingProbe::new(&tree);
    let budget = budget(250, 40);

    let started = Instant::now();
    let report = poll_until(&probe, budget, &CancelToken::never()).await;
    let wall = started.elapsed();

    assert_eq!(report.outcome, PollOutcome::NotFound);
    assert!(report.elapsed >= budget.deadline, "gave up early: {:?}", report.elapsed);
    // deadline + interval, plus scheduler slack.
    assert!(wall < budget.deadline + budget.interval + Duration::from_millis(200), "{wall:?}");
    assert_eq!(report.attempts, probe.calls());
}

#[tokio::test]
async fn test_zero_deadline_probes_exactly_once() {
    let tree = LogTree::new();
    let probe = CountingProbe::new(&tree);

    let started = Instant::now();
    let report = poll_until(&probe, budget(0, 50), &CancelToken::never()).await;

    assert_eq!(report.outcome, PollOutcome::NotFound);
    assert_eq!(report.attempts, 1);
    assert_eq!(probe.calls(), 1);
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn test_cancel_mid_poll_returns_within_one_tick() {
    let tree = LogTree::new();
    let probe = CountingProbe::new(&tree);
    let source = CancelSource::new();
    let token = source.token();
    let interval = Duration::from_millis(300);

    let cancel_at = Duration::from_millis(150);
    tokio::spawn(async move {
        tokio::time::sleep(cancel_at).await;
        source.cancel();
    });

    let started = Instant::now();
    let report = poll_until(&probe, DeadlineBudget::new(Duration::from_secs(30), interval), &token).await;
    let wall = started.elapsed();

    assert_eq!(report.outcome, PollOutcome::Cancelled);
    assert_ne!(report.outcome, PollOutcome::NotFound);
    assert!(wall >= cancel_at);
    assert!(wall < cancel_at + interval, "{wall:?}");
}

#[tokio::test]
async fn test_already_cancelled_never_probes() {
    let tree = LogTree::new();
    let probe = CountingProbe::new(&tree);
    let source = CancelSource::new();
    source.cancel();

    let report = poll_until(&probe, budget(1_000, 10), &source.token()).await;
    assert_eq!(report.outcome, PollOutcome::Cancelled);
    assert_eq!(report.attempts, 0);
    assert_eq!(probe.calls(), 0);
}
