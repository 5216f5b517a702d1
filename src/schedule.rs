//! Time sources and keyed scheduling primitives.
//!
//! Nothing in the engine reads the wall clock directly. Managers hold a
//! [`SharedClock`] and deferred work goes through a [`Scheduler`], which
//! keeps at most one deadline per key. The host drives everything by
//! calling `poll` from its event loop, and tests use [`ManualClock`]
//! to advance time deterministically.

use std::cell::Cell;
use std::collections::HashMap;
use std::hash::Hash;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::trace;

pub trait Clock {
    fn now(&self) -> Instant;
}

pub type SharedClock = Rc<dyn Clock>;

/// Monotonic system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    elapsed: Cell<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            elapsed: Cell::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.elapsed.set(self.elapsed.get() + by);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed.get()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed.get()
    }
}

/// Single-flight deadlines per key.
///
/// Scheduling a key that is already pending replaces its deadline rather
/// than queueing a second run.
#[derive(Debug)]
pub struct Scheduler<K> {
    tasks: HashMap<K, (Instant, u64)>,
    seq: u64,
}

impl<K> Default for Scheduler<K> {
    fn default() -> Self {
        Self {
            tasks: HashMap::new(),
            seq: 0,
        }
    }
}

impl<K> Scheduler<K>
where
    K: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the deadline of `key`. Returns `true` if a pending deadline was replaced.
    pub fn schedule(&mut self, key: K, at: Instant) -> bool {
        self.seq += 1;
        self.tasks.insert(key, (at, self.seq)).is_some()
    }

    pub fn cancel(&mut self, key: &K) -> bool {
        self.tasks.remove(key).is_some()
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn deadline(&self, key: &K) -> Option<Instant> {
        self.tasks.get(key).map(|(at, _)| *at)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.tasks.values().map(|(at, _)| *at).min()
    }

    /// Remove and return every key due at `now`, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<K> {
        let mut due: Vec<(Instant, u64, K)> = self
            .tasks
            .iter()
            .filter(|(_, (at, _))| *at <= now)
            .map(|(key, (at, seq))| (*at, *seq, key.clone()))
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        for (_, _, key) in &due {
            self.tasks.remove(key);
        }
        due.into_iter().map(|(_, _, key)| key).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
    }
}

/// How a refresh request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshRequest {
    /// A new debounced run was armed.
    Scheduled,
    /// A pending run was pushed back by the debounce interval.
    Rescheduled,
    /// A run is in flight; one follow-up will be armed when it completes.
    Coalesced,
}

#[derive(Debug, Default, Clone, Copy)]
struct KeyState {
    in_flight: usize,
    follow_up: bool,
}

/// Debounced, coalescing refresh per key (typically per node).
#[derive(Debug)]
pub struct RefreshCoordinator<K> {
    debounce: Duration,
    max_in_flight: usize,
    scheduler: Scheduler<K>,
    keys: HashMap<K, KeyState>,
}

impl<K> RefreshCoordinator<K>
where
    K: Clone + Eq + Hash + std::fmt::Debug,
{
    pub fn new(debounce: Duration, max_in_flight: usize) -> Self {
        Self {
            debounce,
            max_in_flight: max_in_flight.max(1),
            scheduler: Scheduler::new(),
            keys: HashMap::new(),
        }
    }

    pub fn request(&mut self, key: K, now: Instant) -> RefreshRequest {
        let state = self.keys.entry(key.clone()).or_default();
        if state.in_flight >= self.max_in_flight {
            state.follow_up = true;
            trace!(?key, "refresh coalesced");
            return RefreshRequest::Coalesced;
        }
        if self.scheduler.schedule(key, now + self.debounce) {
            RefreshRequest::Rescheduled
        } else {
            RefreshRequest::Scheduled
        }
    }

    /// Keys whose debounce expired, now marked in flight.
    ///
    /// Every returned key must be handed back through [`complete`](Self::complete).
    pub fn take_due(&mut self, now: Instant) -> Vec<K> {
        let mut started = Vec::new();
        for key in self.scheduler.take_due(now) {
            let state = self.keys.entry(key.clone()).or_default();
            if state.in_flight >= self.max_in_flight {
                state.follow_up = true;
                continue;
            }
            state.in_flight += 1;
            started.push(key);
        }
        started
    }

    /// Mark a refresh finished, arming the coalesced follow-up if any.
    pub fn complete(&mut self, key: &K, now: Instant) {
        let Some(state) = self.keys.get_mut(key) else {
            return;
        };
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.follow_up {
            state.follow_up = false;
            self.scheduler.schedule(key.clone(), now + self.debounce);
        } else if state.in_flight == 0 {
            self.keys.remove(key);
        }
    }

    pub fn cancel(&mut self, key: &K) {
        self.scheduler.cancel(key);
        if let Some(state) = self.keys.get_mut(key) {
            state.follow_up = false;
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.scheduler.is_scheduled(key) || self.keys.get(key).is_some_and(|s| s.follow_up)
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.keys.get(key).is_some_and(|s| s.in_flight > 0)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }
}
