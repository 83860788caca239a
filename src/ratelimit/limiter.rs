//! Per-principal admission limiter.
//!
//! Every principal with a rate gets a FIFO release queue. The first request
//! of an idle principal passes immediately and arms a release timer; later
//! requests wait in the queue and are released one per interval. When a
//! timer fires on an empty queue the principal returns to idle.

use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::rate::{parse_rate, RateSpec};
use super::scheduler::{Scheduler, Task, TokioScheduler};
use crate::config::LimiterConfig;
use crate::error::{GuardError, Result};
use crate::token::Principal;

/// One admission slot in a principal's queue.
enum QueueEntry {
    /// A waiting request
    Continuation(Task),
    /// Capacity consumed elsewhere; occupies a slot, runs nothing
    Placeholder,
}

impl QueueEntry {
    fn run(self) {
        if let QueueEntry::Continuation(task) = self {
            task();
        }
    }
}

/// Queue state of an active principal.
///
/// A map entry exists exactly while a release timer is armed for it.
struct PrincipalQueue {
    entries: VecDeque<QueueEntry>,
    /// Interval resolved when the principal became active, reused on every rearm
    interval_ms: u64,
}

impl PrincipalQueue {
    fn new(interval_ms: u64) -> Self {
        Self {
            entries: VecDeque::new(),
            interval_ms,
        }
    }
}

struct Shared<S> {
    queues: Mutex<HashMap<String, PrincipalQueue>>,
    settings: RwLock<LimiterConfig>,
    scheduler: S,
}

/// FIFO release scheduler keyed by principal id.
///
/// Cloning yields another handle to the same queues.
pub struct AdmissionLimiter<S: Scheduler = TokioScheduler> {
    shared: Arc<Shared<S>>,
}

impl<S: Scheduler> Clone for AdmissionLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl AdmissionLimiter<TokioScheduler> {
    /// Create a limiter that schedules releases on the current tokio runtime.
    pub fn new(config: LimiterConfig) -> Result<Self> {
        Self::with_scheduler(config, TokioScheduler::current()?)
    }
}

impl<S: Scheduler> AdmissionLimiter<S> {
    /// Create a limiter on an explicit scheduler.
    pub fn with_scheduler(config: LimiterConfig, scheduler: S) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                queues: Mutex::new(HashMap::new()),
                settings: RwLock::new(config),
                scheduler,
            }),
        })
    }

    /// Admit a request for `principal`.
    ///
    /// `continuation` runs synchronously when the principal has no rate or is
    /// idle, otherwise it is queued and runs on a later release. Fails with
    /// [`GuardError::AdmissionRejected`] when the estimated wait exceeds the
    /// timeout budget; nothing is enqueued in that case.
    pub fn check<F>(&self, principal: &Principal, continuation: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(rate) = principal.rate.as_ref() else {
            trace!(id = %principal.id, "Principal is unthrottled, bypassing queue");
            continuation();
            return Ok(());
        };

        let interval_ms = self.effective_interval(rate)?;
        let budget = self.shared.settings.read().timeout_ms;

        let run_now = {
            let mut queues = self.shared.queues.lock();
            match queues.entry(principal.id.clone()) {
                Entry::Occupied(mut occupied) => {
                    let queue = occupied.get_mut();
                    let wait_ms = (queue.entries.len() as u64).saturating_mul(interval_ms);

                    if let Some(budget_ms) = budget {
                        if wait_ms > budget_ms {
                            warn!(
                                id = %principal.id,
                                queued = queue.entries.len(),
                                wait_ms = wait_ms,
                                budget_ms = budget_ms,
                                "Rate limit exceeded"
                            );
                            return Err(GuardError::AdmissionRejected {
                                id: principal.id.clone(),
                                wait_ms,
                                budget_ms,
                            });
                        }
                    }

                    queue
                        .entries
                        .push_back(QueueEntry::Continuation(Box::new(continuation)));
                    trace!(
                        id = %principal.id,
                        position = queue.entries.len(),
                        wait_ms = wait_ms,
                        "Request queued"
                    );
                    None
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(PrincipalQueue::new(interval_ms));
                    debug!(
                        id = %principal.id,
                        interval_ms = interval_ms,
                        "Principal became active"
                    );
                    Some(continuation)
                }
            }
        };

        if let Some(continuation) = run_now {
            Shared::arm(&self.shared, principal.id.clone(), interval_ms);
            continuation();
        }
        Ok(())
    }

    /// Account for `count` requests of `principal` served outside this process.
    ///
    /// On an active principal this appends `count` placeholders, delaying
    /// everything behind them by `count` intervals. On an idle principal the
    /// activation itself stands for the first request, so `count - 1`
    /// placeholders are queued behind it.
    /// [`queue_len`](Self::queue_len) therefore reports `count - 1` right
    /// after a notification activates an idle principal.
    pub fn notify(&self, principal: &Principal, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let Some(rate) = principal.rate.as_ref() else {
            trace!(id = %principal.id, "Principal is unthrottled, ignoring notification");
            return Ok(());
        };
        let interval_ms = self.effective_interval(rate)?;

        let activated = {
            let mut queues = self.shared.queues.lock();
            match queues.entry(principal.id.clone()) {
                Entry::Occupied(mut occupied) => {
                    let queue = occupied.get_mut();
                    queue
                        .entries
                        .extend((0..count).map(|_| QueueEntry::Placeholder));
                    false
                }
                Entry::Vacant(vacant) => {
                    let mut queue = PrincipalQueue::new(interval_ms);
                    queue
                        .entries
                        .extend((1..count).map(|_| QueueEntry::Placeholder));
                    vacant.insert(queue);
                    true
                }
            }
        };

        debug!(
            id = %principal.id,
            count = count,
            activated = activated,
            "Recorded external consumption"
        );
        if activated {
            Shared::arm(&self.shared, principal.id.clone(), interval_ms);
        }
        Ok(())
    }

    /// Resolve a rate and scale it by the node-count multiplier.
    pub fn effective_interval(&self, rate: &RateSpec) -> Result<u64> {
        let nodes = self.shared.settings.read().nodes;
        Ok(parse_rate(rate)?.saturating_mul(u64::from(nodes)))
    }

    /// Number of entries waiting behind the current release of `id`, or
    /// `None` when the principal is idle.
    pub fn queue_len(&self, id: &str) -> Option<usize> {
        self.shared.queues.lock().get(id).map(|q| q.entries.len())
    }

    /// Number of principals that currently have an armed release timer.
    pub fn active_principals(&self) -> usize {
        self.shared.queues.lock().len()
    }

    /// Current limiter settings.
    pub fn config(&self) -> LimiterConfig {
        self.shared.settings.read().clone()
    }

    /// Replace the limiter settings. Active queues keep the interval they
    /// were activated with.
    pub fn set_config(&self, config: LimiterConfig) -> Result<()> {
        config.validate()?;
        *self.shared.settings.write() = config;
        Ok(())
    }

    /// Update the node-count multiplier.
    pub fn set_nodes(&self, nodes: u32) -> Result<()> {
        let mut config = self.config();
        config.nodes = nodes;
        self.set_config(config)
    }
}

impl<S: Scheduler> Shared<S> {
    fn arm(shared: &Arc<Self>, id: String, interval_ms: u64) {
        let handle = Arc::clone(shared);
        shared.scheduler.schedule(
            Duration::from_millis(interval_ms),
            Box::new(move || Shared::release(&handle, id)),
        );
    }

    fn release(shared: &Arc<Self>, id: String) {
        let (entry, interval_ms) = {
            let mut queues = shared.queues.lock();
            let Entry::Occupied(mut occupied) = queues.entry(id.clone()) else {
                return;
            };
            let interval_ms = occupied.get().interval_ms;
            match occupied.get_mut().entries.pop_front() {
                Some(entry) => (entry, interval_ms),
                None => {
                    occupied.remove();
                    debug!(id = %id, "Queue drained, principal idle");
                    return;
                }
            }
        };

        trace!(id = %id, interval_ms = interval_ms, "Releasing queued entry");
        Shared::arm(shared, id, interval_ms);
        entry.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    /// Scheduler that holds tasks until the test fires them.
    #[derive(Clone, Default)]
    struct ManualScheduler {
        pending: Arc<Mutex<VecDeque<(Duration, Task)>>>,
    }

    impl Scheduler for ManualScheduler {
        fn schedule(&self, delay: Duration, task: Task) {
            self.pending.lock().push_back((delay, task));
        }
    }

    impl ManualScheduler {
        fn fire_next(&self) -> Option<Duration> {
            let next = self.pending.lock().pop_front();
            next.map(|(delay, task)| {
                task();
                delay
            })
        }

        fn pending(&self) -> usize {
            self.pending.lock().len()
        }

        fn next_delay(&self) -> Option<Duration> {
            self.pending.lock().front().map(|(delay, _)| *delay)
        }
    }

    fn manual_limiter(config: LimiterConfig) -> (AdmissionLimiter<ManualScheduler>, ManualScheduler) {
        let scheduler = ManualScheduler::default();
        let limiter = AdmissionLimiter::with_scheduler(config, scheduler.clone()).unwrap();
        (limiter, scheduler)
    }

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn FnOnce() + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |label: &'static str| {
            let sink = Arc::clone(&sink);
            Box::new(move || sink.lock().push(label)) as Box<dyn FnOnce() + Send>
        };
        (log, make)
    }

    #[test]
    fn test_unthrottled_principal_bypasses_queue() {
        let (limiter, scheduler) = manual_limiter(LimiterConfig::default());
        let (log, record) = recorder();
        let principal = Principal::new("free");

        for _ in 0..3 {
            limiter.check(&principal, record("free")).unwrap();
        }

        assert_eq!(*log.lock(), vec!["free", "free", "free"]);
        assert_eq!(limiter.active_principals(), 0);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_idle_principal_passes_and_arms_timer() {
        let (limiter, scheduler) = manual_limiter(LimiterConfig::default());
        let (log, record) = recorder();
        let principal = Principal::new("a").with_rate("100ms");

        limiter.check(&principal, record("first")).unwrap();

        assert_eq!(*log.lock(), vec!["first"]);
        assert_eq!(limiter.queue_len("a"), Some(0));
        assert_eq!(scheduler.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_queue_releases_in_order_then_tears_down() {
        let (limiter, scheduler) = manual_limiter(LimiterConfig::default());
        let (log, record) = recorder();
        let principal = Principal::new("a").with_rate("100ms");

        limiter.check(&principal, record("first")).unwrap();
        limiter.check(&principal, record("second")).unwrap();
        limiter.check(&principal, record("third")).unwrap();
        assert_eq!(*log.lock(), vec!["first"]);
        assert_eq!(limiter.queue_len("a"), Some(2));

        scheduler.fire_next();
        assert_eq!(*log.lock(), vec!["first", "second"]);
        scheduler.fire_next();
        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
        assert_eq!(limiter.queue_len("a"), Some(0));

        // Empty queue on fire returns the principal to idle without rearming
        scheduler.fire_next();
        assert_eq!(limiter.queue_len("a"), None);
        assert_eq!(limiter.active_principals(), 0);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_node_multiplier_scales_interval() {
        let config = LimiterConfig {
            nodes: 3,
            timeout_ms: None,
        };
        let (limiter, scheduler) = manual_limiter(config);
        let principal = Principal::new("a").with_rate("100ms");

        limiter.check(&principal, || {}).unwrap();
        assert_eq!(scheduler.next_delay(), Some(Duration::from_millis(300)));
    }

    #[test]
    fn test_set_nodes_applies_to_new_activations() {
        let (limiter, scheduler) = manual_limiter(LimiterConfig::default());
        limiter.set_nodes(2).unwrap();
        assert!(limiter.set_nodes(0).is_err());
        assert_eq!(limiter.config().nodes, 2);

        limiter
            .check(&Principal::new("a").with_rate("1s"), || {})
            .unwrap();
        assert_eq!(scheduler.next_delay(), Some(Duration::from_millis(2_000)));
    }

    #[test]
    fn test_backlog_over_budget_rejected() {
        let config = LimiterConfig {
            nodes: 1,
            timeout_ms: Some(100),
        };
        let (limiter, _scheduler) = manual_limiter(config);
        let principal = Principal::new("a").with_rate("50ms");

        // One immediate admission, then queue lengths 0, 1 and 2 at enqueue time
        for _ in 0..4 {
            limiter.check(&principal, || {}).unwrap();
        }
        assert_eq!(limiter.queue_len("a"), Some(3));

        let (log, record) = recorder();
        let err = limiter.check(&principal, record("rejected")).unwrap_err();
        match err {
            GuardError::AdmissionRejected {
                id,
                wait_ms,
                budget_ms,
            } => {
                assert_eq!(id, "a");
                assert_eq!(wait_ms, 150);
                assert_eq!(budget_ms, 100);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(log.lock().is_empty());
        assert_eq!(limiter.queue_len("a"), Some(3));
    }

    #[test]
    fn test_short_backlog_within_budget() {
        let config = LimiterConfig {
            nodes: 1,
            timeout_ms: Some(100),
        };
        let (limiter, _scheduler) = manual_limiter(config);
        let principal = Principal::new("b").with_rate("50ms");

        limiter.check(&principal, || {}).unwrap();
        limiter.check(&principal, || {}).unwrap(); // wait 0ms
        limiter.check(&principal, || {}).unwrap(); // wait 50ms
        limiter.check(&principal, || {}).unwrap(); // wait 100ms, not above budget
        assert_eq!(limiter.queue_len("b"), Some(3));
    }

    #[test]
    fn test_rejection_does_not_affect_other_principals() {
        let config = LimiterConfig {
            nodes: 1,
            timeout_ms: Some(0),
        };
        let (limiter, _scheduler) = manual_limiter(config);
        let busy = Principal::new("busy").with_rate("10ms");
        let other = Principal::new("other").with_rate("10ms");

        limiter.check(&busy, || {}).unwrap();
        limiter.check(&busy, || {}).unwrap();
        assert!(limiter.check(&busy, || {}).is_err());

        let (log, record) = recorder();
        limiter.check(&other, record("other")).unwrap();
        assert_eq!(*log.lock(), vec!["other"]);
    }

    #[test]
    fn test_invalid_rate_rejected_without_side_effects() {
        let (limiter, scheduler) = manual_limiter(LimiterConfig::default());
        let (log, record) = recorder();
        let principal = Principal::new("a").with_rate("6x");

        let result = limiter.check(&principal, record("never"));

        assert!(matches!(result, Err(GuardError::InvalidRateUnit(_))));
        assert!(log.lock().is_empty());
        assert_eq!(limiter.active_principals(), 0);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_notify_on_idle_principal_occupies_first_slot() {
        let (limiter, scheduler) = manual_limiter(LimiterConfig::default());
        let (log, record) = recorder();
        let principal = Principal::new("a").with_rate("100ms");

        limiter.notify(&principal, 1).unwrap();
        assert_eq!(limiter.queue_len("a"), Some(0));
        assert_eq!(scheduler.pending(), 1);

        limiter.check(&principal, record("after-notify")).unwrap();
        assert!(log.lock().is_empty());

        scheduler.fire_next();
        assert_eq!(*log.lock(), vec!["after-notify"]);
    }

    #[test]
    fn test_notify_count_on_idle_principal() {
        let (limiter, _scheduler) = manual_limiter(LimiterConfig::default());
        let principal = Principal::new("a").with_rate("100ms");

        limiter.notify(&principal, 3).unwrap();
        assert_eq!(limiter.queue_len("a"), Some(2));
    }

    #[test]
    fn test_notify_interleaves_placeholders_in_fifo_order() {
        let (limiter, scheduler) = manual_limiter(LimiterConfig::default());
        let (log, record) = recorder();
        let principal = Principal::new("a").with_rate("100ms");

        limiter.check(&principal, record("immediate")).unwrap();
        limiter.check(&principal, record("queued-1")).unwrap();
        limiter.notify(&principal, 2).unwrap();
        limiter.check(&principal, record("queued-2")).unwrap();
        assert_eq!(limiter.queue_len("a"), Some(4));

        scheduler.fire_next();
        assert_eq!(*log.lock(), vec!["immediate", "queued-1"]);
        scheduler.fire_next();
        scheduler.fire_next();
        assert_eq!(*log.lock(), vec!["immediate", "queued-1"]);
        scheduler.fire_next();
        assert_eq!(*log.lock(), vec!["immediate", "queued-1", "queued-2"]);
    }

    #[test]
    fn test_notify_without_rate_or_count_is_noop() {
        let (limiter, scheduler) = manual_limiter(LimiterConfig::default());

        limiter.notify(&Principal::new("free"), 5).unwrap();
        limiter
            .notify(&Principal::new("a").with_rate("1s"), 0)
            .unwrap();

        assert_eq!(limiter.active_principals(), 0);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_continuation_may_reenter_limiter() {
        let (limiter, scheduler) = manual_limiter(LimiterConfig::default());
        let (log, record) = recorder();
        let principal = Principal::new("a").with_rate("10ms");

        let inner = limiter.clone();
        let inner_principal = principal.clone();
        let nested = record("nested");
        limiter
            .check(&principal, move || {
                inner.check(&inner_principal, nested).unwrap();
            })
            .unwrap();

        assert_eq!(limiter.queue_len("a"), Some(1));
        scheduler.fire_next();
        assert_eq!(*log.lock(), vec!["nested"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_principal_is_serialized_others_are_not() {
        let limiter = AdmissionLimiter::new(LimiterConfig::default()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = Principal::new("a").with_rate("100ms");
        let b = Principal::new("b").with_rate("100ms");
        let start = Instant::now();

        for (label, principal) in [("a1", &a), ("a2", &a), ("b1", &b)] {
            let tx = tx.clone();
            limiter
                .check(principal, move || {
                    let _ = tx.send((label, Instant::now()));
                })
                .unwrap();
        }

        let mut fired = Vec::new();
        for _ in 0..3 {
            fired.push(rx.recv().await.unwrap());
        }

        let offset = |label: &str| {
            fired
                .iter()
                .find(|(l, _)| *l == label)
                .map(|(_, at)| *at - start)
                .unwrap()
        };
        assert_eq!(offset("a1"), Duration::ZERO);
        assert_eq!(offset("b1"), Duration::ZERO);
        assert!(offset("a2") >= Duration::from_millis(100));
        assert!(offset("a2") < Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_delays_next_request_by_one_interval() {
        let limiter = AdmissionLimiter::new(LimiterConfig::default()).unwrap();
        let principal = Principal::new("a").with_rate("100ms");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let start = Instant::now();

        limiter.notify(&principal, 1).unwrap();
        limiter
            .check(&principal, move || {
                let _ = tx.send(Instant::now());
            })
            .unwrap();

        let fired_at = rx.recv().await.unwrap();
        assert!(fired_at - start >= Duration::from_millis(100));
        assert!(fired_at - start < Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_principal_returns_to_idle_after_drain() {
        let limiter = AdmissionLimiter::new(LimiterConfig::default()).unwrap();
        let principal = Principal::new("a").with_rate("50ms");

        limiter.check(&principal, || {}).unwrap();
        assert_eq!(limiter.active_principals(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(limiter.active_principals(), 0);
    }
}
