//! Per-kind work queue with deduplication, delayed requeues and backoff.

use cirrus_core::ResourceKey;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Keys waiting to be reconciled.
///
/// A key is in at most one of three places: ready, in flight, or delayed.
/// Adding a key that is in flight marks it dirty; it is re-queued as soon as
/// the running pass completes, so one object is never reconciled twice at
/// the same time.
#[derive(Debug)]
pub struct WorkQueue {
    ready: VecDeque<ResourceKey>,
    queued: HashSet<ResourceKey>,
    in_flight: HashSet<ResourceKey>,
    dirty: HashSet<ResourceKey>,
    delayed: HashMap<ResourceKey, Instant>,
    failures: HashMap<ResourceKey, u32>,
    base_backoff: Duration,
    max_backoff: Duration,
}

/// How a reconcile pass ended, as far as scheduling is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Done { requeue_after: Option<Duration> },
    /// Retry with backoff
    Failed,
    /// Failed in a way only an object change fixes
    Terminal,
}

impl WorkQueue {
    pub fn new(base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            ready: VecDeque::new(),
            queued: HashSet::new(),
            in_flight: HashSet::new(),
            dirty: HashSet::new(),
            delayed: HashMap::new(),
            failures: HashMap::new(),
            base_backoff,
            max_backoff,
        }
    }

    /// Queue a key for immediate processing
    pub fn add(&mut self, key: ResourceKey) {
        if self.in_flight.contains(&key) {
            self.dirty.insert(key);
            return;
        }
        if self.queued.insert(key.clone()) {
            self.delayed.remove(&key);
            self.ready.push_back(key);
        }
    }

    /// Queue a key once `delay` has passed. An earlier pending deadline wins.
    pub fn add_after(&mut self, key: ResourceKey, delay: Duration, now: Instant) {
        if self.queued.contains(&key) {
            return;
        }
        let deadline = now + delay;
        self.delayed
            .entry(key)
            .and_modify(|d| *d = (*d).min(deadline))
            .or_insert(deadline);
    }

    /// Take the next ready key and mark it in flight
    pub fn pop(&mut self) -> Option<ResourceKey> {
        let key = self.ready.pop_front()?;
        self.queued.remove(&key);
        self.in_flight.insert(key.clone());
        Some(key)
    }

    /// Record the end of a pass started by [`WorkQueue::pop`]
    pub fn done(&mut self, key: ResourceKey, completion: Completion, now: Instant) {
        self.in_flight.remove(&key);
        match completion {
            Completion::Done { requeue_after } => {
                self.failures.remove(&key);
                if let Some(delay) = requeue_after {
                    self.add_after(key.clone(), delay, now);
                }
            }
            Completion::Failed => {
                let failures = {
                    let count = self.failures.entry(key.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                let delay = self.backoff(failures);
                self.add_after(key.clone(), delay, now);
            }
            Completion::Terminal => {
                self.failures.remove(&key);
            }
        }
        if self.dirty.remove(&key) {
            self.add(key);
        }
    }

    /// Move every delayed key whose deadline has passed to the ready queue
    pub fn promote_due(&mut self, now: Instant) {
        let due: Vec<ResourceKey> = self
            .delayed
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            self.delayed.remove(&key);
            self.add(key);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.delayed.values().min().copied()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Delay before retry number `failures` (1-based)
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::{Resource, VSphereVM};

    fn key(name: &str) -> ResourceKey {
        VSphereVM::key_for("default", name)
    }

    fn queue() -> WorkQueue {
        WorkQueue::new(Duration::from_secs(1), Duration::from_secs(300))
    }

    #[test]
    fn test_add_deduplicates() {
        let mut q = queue();
        q.add(key("a"));
        q.add(key("a"));
        q.add(key("b"));

        assert_eq!(q.pop(), Some(key("a")));
        assert_eq!(q.pop(), Some(key("b")));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_in_flight_key_is_not_handed_out_twice() {
        let mut q = queue();
        let now = Instant::now();
        q.add(key("a"));
        let running = q.pop().unwrap();

        q.add(key("a"));
        assert_eq!(q.pop(), None);

        let done = Completion::Done {
            requeue_after: None,
        };
        q.done(running, done, now);
        assert_eq!(q.pop(), Some(key("a")));
    }

    #[test]
    fn test_requeue_after_delay() {
        let mut q = queue();
        let now = Instant::now();
        q.add(key("a"));
        let running = q.pop().unwrap();
        q.done(
            running,
            Completion::Done {
                requeue_after: Some(Duration::from_secs(10)),
            },
            now,
        );

        assert_eq!(q.next_deadline(), Some(now + Duration::from_secs(10)));
        q.promote_due(now + Duration::from_secs(9));
        assert!(!q.has_ready());
        q.promote_due(now + Duration::from_secs(10));
        assert_eq!(q.pop(), Some(key("a")));
    }

    #[test]
    fn test_failures_back_off_exponentially() {
        let mut q = queue();
        let now = Instant::now();

        for expected in [1, 2, 4, 8] {
            q.add(key("a"));
            let running = q.pop().unwrap();
            q.done(running, Completion::Failed, now);
            assert_eq!(q.next_deadline(), Some(now + Duration::from_secs(expected)));
            q.promote_due(now + Duration::from_secs(expected));
        }

        assert_eq!(q.backoff(20), Duration::from_secs(300));
    }

    #[test]
    fn test_second_failure_doubles_delay() {
        let mut q = WorkQueue::new(Duration::from_millis(100), Duration::from_secs(5));
        let now = Instant::now();

        q.add(key("a"));
        let running = q.pop().unwrap();
        q.done(running, Completion::Failed, now);
        let first = q.next_deadline().unwrap() - now;

        q.promote_due(now + first);
        let running = q.pop().unwrap();
        q.done(running, Completion::Failed, now);
        let second = q.next_deadline().unwrap() - now;

        assert_eq!(first, Duration::from_millis(100));
        assert_eq!(second, first * 2);
    }

    #[test]
    fn test_success_resets_backoff() {
        let mut q = queue();
        let now = Instant::now();

        q.add(key("a"));
        let running = q.pop().unwrap();
        q.done(running, Completion::Failed, now);
        q.promote_due(now + Duration::from_secs(1));
        let running = q.pop().unwrap();
        let done = Completion::Done {
            requeue_after: None,
        };
        q.done(running, done, now);

        q.add(key("a"));
        let running = q.pop().unwrap();
        q.done(running, Completion::Failed, now);
        assert_eq!(q.next_deadline(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_terminal_failure_is_not_retried() {
        let mut q = queue();
        let now = Instant::now();
        q.add(key("a"));
        let running = q.pop().unwrap();
        q.done(running, Completion::Terminal, now);

        assert_eq!(q.next_deadline(), None);
        assert_eq!(q.in_flight(), 0);
    }

    #[test]
    fn test_immediate_add_cancels_delay() {
        let mut q = queue();
        let now = Instant::now();
        q.add_after(key("a"), Duration::from_secs(30), now);
        q.add(key("a"));

        assert_eq!(q.next_deadline(), None);
        assert_eq!(q.pop(), Some(key("a")));
    }
}
