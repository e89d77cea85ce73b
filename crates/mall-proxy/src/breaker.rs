//! Per-method circuit breaker.
//!
//! ```text
//! Closed   → Open:     volume ≥ threshold and error% ≥ threshold in the window
//! Open     → HalfOpen: sleep window elapsed; one trial call admitted
//! HalfOpen → Closed:   trial succeeds (window reset)
//! HalfOpen → Open:     trial fails or times out
//! ```
//!
//! Independently of state, at most `max_concurrent` calls per circuit are in
//! flight; callers beyond that are rejected without waiting.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use mall_types::{FabricError, MethodDescriptor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Upper bound on one call, further capped by the caller's deadline.
    pub timeout: Duration,
    pub max_concurrent: usize,
    pub error_percent_threshold: u8,
    /// Calls the window must hold before the error rate is considered.
    pub request_volume_threshold: u64,
    pub sleep_window: Duration,
    pub rolling_window: Duration,
    pub rolling_buckets: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            timeout: Duration::from_secs(1),
            max_concurrent: 100,
            error_percent_threshold: 50,
            request_volume_threshold: 20,
            sleep_window: Duration::from_secs(5),
            rolling_window: Duration::from_secs(10),
            rolling_buckets: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Why a call was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Open,
    Saturated,
}

impl Rejection {
    pub fn into_error(self, desc: &MethodDescriptor) -> FabricError {
        match self {
            Rejection::Open => FabricError::CircuitOpen(desc.clone()),
            Rejection::Saturated => FabricError::Saturated(desc.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counts {
    successes: u64,
    failures: u64,
    timeouts: u64,
    rejections: u64,
}

impl Counts {
    fn add(&mut self, other: &Counts) {
        self.successes += other.successes;
        self.failures += other.failures;
        self.timeouts += other.timeouts;
        self.rejections += other.rejections;
    }
}

struct RollingWindow {
    span: Duration,
    bucket_width: Duration,
    buckets: VecDeque<(Instant, Counts)>,
}

impl RollingWindow {
    fn new(span: Duration, buckets: u32) -> Self {
        let bucket_width = (span / buckets.max(1)).max(Duration::from_millis(1));
        RollingWindow { span, bucket_width, buckets: VecDeque::new() }
    }

    fn evict(&mut self, now: Instant) {
        while let Some((start, _)) = self.buckets.front() {
            if *start + self.span <= now {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn current(&mut self, now: Instant) -> &mut Counts {
        self.evict(now);
        let stale = self
            .buckets
            .back()
            .map_or(true, |(start, _)| *start + self.bucket_width <= now);
        if stale {
            self.buckets.push_back((now, Counts::default()));
        }
        let last = self.buckets.len() - 1;
        &mut self.buckets[last].1
    }

    fn totals(&mut self, now: Instant) -> Counts {
        self.evict(now);
        let mut sum = Counts::default();
        for (_, counts) in &self.buckets {
            sum.add(counts);
        }
        sum
    }

    fn reset(&mut self) {
        self.buckets.clear();
    }
}

/// Point-in-time view of one circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejections: u64,
}

impl CircuitSnapshot {
    /// Failures plus timeouts over completed calls, 0 with no traffic.
    pub fn error_percent(&self) -> u64 {
        let total = self.successes + self.failures + self.timeouts;
        if total == 0 {
            return 0;
        }
        (self.failures + self.timeouts) * 100 / total
    }
}

struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    window: RollingWindow,
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Failure,
    Timeout,
}

pub struct CircuitBreaker {
    desc: MethodDescriptor,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    slots: Arc<Semaphore>,
}

impl CircuitBreaker {
    pub fn new(desc: MethodDescriptor, config: BreakerConfig) -> Self {
        let window = RollingWindow::new(config.rolling_window, config.rolling_buckets);
        let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        CircuitBreaker {
            desc,
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
                trial_in_flight: false,
                window,
            }),
            slots,
        }
    }

    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.desc
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Admit one call or say why not. The returned permit must be resolved
    /// with [`CallPermit::success`], [`CallPermit::failure`] or
    /// [`CallPermit::timeout`]; dropping it unresolved records nothing.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CallPermit, Rejection> {
        let now = Instant::now();
        let trial = {
            let mut g = self.inner.lock();
            match g.state {
                CircuitState::Closed => false,
                CircuitState::Open => {
                    let reopen_at = g.opened_at.map(|t| t + self.config.sleep_window);
                    if reopen_at.is_some_and(|t| now >= t) {
                        g.state = CircuitState::HalfOpen;
                        g.trial_in_flight = true;
                        tracing::info!(
                            circuit = %self.desc,
                            "circuit half-open; admitting trial call"
                        );
                        true
                    } else {
                        return Err(Rejection::Open);
                    }
                }
                CircuitState::HalfOpen => {
                    if g.trial_in_flight {
                        return Err(Rejection::Open);
                    }
                    g.trial_in_flight = true;
                    true
                }
            }
        };

        match self.slots.clone().try_acquire_owned() {
            Ok(slot) => {
                Ok(CallPermit { breaker: self.clone(), _slot: slot, trial, resolved: false })
            }
            Err(_) => {
                let mut g = self.inner.lock();
                if trial {
                    g.trial_in_flight = false;
                }
                g.window.current(now).rejections += 1;
                Err(Rejection::Saturated)
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut g = self.inner.lock();
        let state = g.state;
        let totals = g.window.totals(Instant::now());
        CircuitSnapshot {
            state,
            successes: totals.successes,
            failures: totals.failures,
            timeouts: totals.timeouts,
            rejections: totals.rejections,
        }
    }

    fn record(&self, outcome: Outcome, trial: bool) {
        let now = Instant::now();
        let mut g = self.inner.lock();
        {
            let bucket = g.window.current(now);
            match outcome {
                Outcome::Success => bucket.successes += 1,
                Outcome::Failure => bucket.failures += 1,
                Outcome::Timeout => bucket.timeouts += 1,
            }
        }

        if trial {
            g.trial_in_flight = false;
            match outcome {
                Outcome::Success => {
                    g.state = CircuitState::Closed;
                    g.opened_at = None;
                    g.window.reset();
                    tracing::info!(circuit = %self.desc, "circuit closed");
                }
                Outcome::Failure | Outcome::Timeout => {
                    g.state = CircuitState::Open;
                    g.opened_at = Some(now);
                    tracing::warn!(circuit = %self.desc, "trial call failed; circuit re-opened");
                }
            }
            return;
        }

        if g.state != CircuitState::Closed || matches!(outcome, Outcome::Success) {
            return;
        }
        let totals = g.window.totals(now);
        let total = totals.successes + totals.failures + totals.timeouts;
        let errors = totals.failures + totals.timeouts;
        if total >= self.config.request_volume_threshold
            && errors * 100 >= u64::from(self.config.error_percent_threshold) * total
        {
            g.state = CircuitState::Open;
            g.opened_at = Some(now);
            tracing::warn!(circuit = %self.desc, total, errors, "circuit opened");
        }
    }

    fn abandon(&self, trial: bool) {
        if trial {
            self.inner.lock().trial_in_flight = false;
        }
    }
}

/// An admitted call. Holds one concurrency slot until resolved or dropped.
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    _slot: OwnedSemaphorePermit,
    trial: bool,
    resolved: bool,
}

impl CallPermit {
    /// Whether this call is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(self) {
        self.resolve(Outcome::Success);
    }

    pub fn failure(self) {
        self.resolve(Outcome::Failure);
    }

    pub fn timeout(self) {
        self.resolve(Outcome::Timeout);
    }

    fn resolve(mut self, outcome: Outcome) {
        self.resolved = true;
        self.breaker.record(outcome, self.trial);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.abandon(self.trial);
        }
    }
}

/// Lazily created breakers, one per method.
pub(crate) struct Circuits {
    config: BreakerConfig,
    breakers: Mutex<HashMap<MethodDescriptor, Arc<CircuitBreaker>>>,
}

impl Circuits {
    pub(crate) fn new(config: BreakerConfig) -> Self {
        Circuits { config, breakers: Mutex::new(HashMap::new()) }
    }

    pub(crate) fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub(crate) fn get(&self, desc: &MethodDescriptor) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(desc.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(desc.clone(), self.config.clone())))
            .clone()
    }

    pub(crate) fn peek(&self, desc: &MethodDescriptor) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().get(desc).cloned()
    }
}
