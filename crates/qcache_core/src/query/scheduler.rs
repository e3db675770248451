//! Everything in the Query Engine that runs off a clock: debounced
//! parameter-change refetches, and the GCD-based refetch-interval clock
//! that drives every instance with a `refetchInterval` off a single timer
//! (§4.5 "Debounce", "Refetch interval").
//!
//! Both are built on `tokio::task::spawn_local` — the engine's
//! single-threaded cooperative scheduling model (§5) means none of the
//! state these callbacks close over is `Send`.

use qcache_common::QueryId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::Hash;
use std::rc::Rc;
use std::time::Duration;

/// A caller-supplied stable identity for one reactive query binding — e.g.
/// one call site that re-derives its parameters as an upstream signal
/// changes. Kept stable across those parameter changes, unlike the
/// [`QueryId`] each resolved parameter set hashes to: flipping a bound
/// `id` from 123 to 456 to 789 produces three different `QueryId`s but one
/// `DebounceSlot`, so the second change supersedes the first's pending
/// fire instead of scheduling an independent timer next to it (§4.5
/// "Debounce", §8 scenario 5).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DebounceSlot(pub u64);

/// Delays refetches triggered by parameter-signal changes, collapsing
/// repeats within the window into one trailing-edge fire. The initial
/// fetch never goes through this — callers only debounce subsequent
/// refetches (§4.5 "Debounce", §9 "the initial fetch is never debounced").
///
/// Generic over the key a caller debounces by: the Query Client debounces
/// by [`DebounceSlot`] (one logical binding survives parameter changes),
/// while `QueryId` remains available for any consumer that genuinely wants
/// per-resolved-query debounce.
pub struct DebounceScheduler<K = QueryId>
where
    K: Eq + Hash + Copy + 'static,
{
    generations: Rc<RefCell<HashMap<K, u64>>>,
}

impl<K> Clone for DebounceScheduler<K>
where
    K: Eq + Hash + Copy + 'static,
{
    fn clone(&self) -> Self {
        Self { generations: self.generations.clone() }
    }
}

impl<K> Default for DebounceScheduler<K>
where
    K: Eq + Hash + Copy + 'static,
{
    fn default() -> Self {
        Self { generations: Rc::new(RefCell::new(HashMap::new())) }
    }
}

impl<K> DebounceScheduler<K>
where
    K: Eq + Hash + Copy + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `action` to run after `delay_ms` of quiescence for `key`.
    /// A call for the same `key` before the delay elapses supersedes the
    /// prior one — only the last call's action fires, at
    /// `last_call_time + delay_ms`.
    pub fn schedule<F>(&self, key: K, delay_ms: u64, action: F)
    where
        F: std::future::Future<Output = ()> + 'static,
    {
        let generation = {
            let mut generations = self.generations.borrow_mut();
            let next = generations.get(&key).copied().unwrap_or(0) + 1;
            generations.insert(key, next);
            next
        };
        let generations = self.generations.clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let is_current = generations.borrow().get(&key).copied() == Some(generation);
            if is_current {
                action.await;
            }
        });
    }

    /// Bypasses debounce entirely — an explicit `refetch()` call (§4.5).
    /// Invalidates any pending debounced fire for `key` so it doesn't also
    /// run afterward.
    pub fn bypass(&self, key: K) {
        self.generations.borrow_mut().entry(key).and_modify(|g| *g += 1).or_insert(1);
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Drives every instance with a `refetchInterval` off one timer ticking at
/// the GCD of all active intervals (§4.5 "Refetch interval"). Each
/// instance fires on its own multiple of that base; a tick is skipped for
/// an instance whose prior fetch is still in flight.
pub struct RefetchIntervalScheduler {
    inner: Rc<RefCell<SchedulerInner>>,
}

struct SchedulerInner {
    intervals_ms: HashMap<QueryId, u64>,
    elapsed_ms: HashMap<QueryId, u64>,
    base_ms: u64,
    multiplier: f64,
    running: bool,
}

impl Default for RefetchIntervalScheduler {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl RefetchIntervalScheduler {
    pub fn new(multiplier: f64) -> Self {
        Self {
            inner: Rc::new(RefCell::new(SchedulerInner {
                intervals_ms: HashMap::new(),
                elapsed_ms: HashMap::new(),
                base_ms: 0,
                multiplier,
                running: false,
            })),
        }
    }

    /// Registers (or updates) `key`'s refetch interval.
    pub fn register(&self, key: QueryId, interval_ms: u64) {
        let mut inner = self.inner.borrow_mut();
        inner.intervals_ms.insert(key, interval_ms);
        inner.elapsed_ms.insert(key, 0);
        inner.recompute_base();
    }

    /// Deregisters `key` — called on instance deactivation (§5
    /// "Cancellation": "cancels its refetch-interval scheduling").
    pub fn unregister(&self, key: QueryId) {
        let mut inner = self.inner.borrow_mut();
        inner.intervals_ms.remove(&key);
        inner.elapsed_ms.remove(&key);
        inner.recompute_base();
    }

    /// Starts the shared timer loop if it isn't already running. `on_tick`
    /// is invoked with every `QueryId` whose accumulated elapsed time has
    /// reached a multiple of its own interval this tick.
    ///
    /// Built on a plain `sleep` loop rather than `tokio::time::interval` so
    /// the wait re-reads `base_ms`/`multiplier` on every iteration — a
    /// `register()`/`unregister()` call that shifts the GCD after the loop
    /// has already started retunes both the sleep duration and the
    /// elapsed-time step on the very next tick, instead of the loop staying
    /// locked to whatever base was live at spawn time.
    pub fn ensure_running<F>(&self, on_tick: F)
    where
        F: Fn(QueryId) + 'static,
    {
        let mut inner_mut = self.inner.borrow_mut();
        if inner_mut.running || inner_mut.base_ms == 0 {
            return;
        }
        inner_mut.running = true;
        drop(inner_mut);

        let inner = self.inner.clone();
        tokio::task::spawn_local(async move {
            loop {
                let scaled = {
                    let guard = inner.borrow();
                    ((guard.base_ms as f64) * guard.multiplier).max(1.0) as u64
                };
                tokio::time::sleep(Duration::from_millis(scaled)).await;

                let mut guard = inner.borrow_mut();
                if guard.intervals_ms.is_empty() {
                    guard.running = false;
                    return;
                }
                let base_ms = guard.base_ms;
                let due: Vec<QueryId> = guard
                    .intervals_ms
                    .iter()
                    .filter_map(|(key, interval)| {
                        let elapsed = guard.elapsed_ms.entry(*key).or_insert(0);
                        *elapsed += base_ms;
                        if *elapsed >= *interval {
                            *elapsed = 0;
                            Some(*key)
                        } else {
                            None
                        }
                    })
                    .collect();
                drop(guard);
                for key in due {
                    on_tick(key);
                }
            }
        });
    }
}

impl SchedulerInner {
    fn recompute_base(&mut self) {
        self.base_ms = self.intervals_ms.values().copied().fold(0, gcd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcd_of_empty_set_is_zero() {
        let mut inner = SchedulerInner {
            intervals_ms: HashMap::new(),
            elapsed_ms: HashMap::new(),
            base_ms: 0,
            multiplier: 1.0,
            running: false,
        };
        inner.recompute_base();
        assert_eq!(inner.base_ms, 0);
    }

    #[test]
    fn gcd_drives_a_common_base() {
        let mut inner = SchedulerInner {
            intervals_ms: [(QueryId(1), 2000), (QueryId(2), 3000)].into_iter().collect(),
            elapsed_ms: HashMap::new(),
            base_ms: 0,
            multiplier: 1.0,
            running: false,
        };
        inner.recompute_base();
        assert_eq!(inner.base_ms, 1000);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn debounce_collapses_repeated_calls_into_one_fire() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let scheduler = DebounceScheduler::new();
                let count = Rc::new(RefCell::new(0));
                for _ in 0..3 {
                    let count = count.clone();
                    scheduler.schedule(QueryId(1), 100, async move {
                        *count.borrow_mut() += 1;
                    });
                    tokio::time::advance(Duration::from_millis(10)).await;
                }
                tokio::time::advance(Duration::from_millis(200)).await;
                tokio::task::yield_now().await;
                assert_eq!(*count.borrow(), 1);
            })
            .await;
    }
}
