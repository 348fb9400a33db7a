//! Clock and timer queue shared by the transaction state machine and the router.
//!
//! Nothing in the stack sleeps. Every timeout is an entry in one ordered
//! [`TimerQueue`] keyed by deadline; the owner asks for
//! [`TimerQueue::next_deadline`] and calls back in with the current time from a
//! [`Clock`]. Tests swap in a [`ManualClock`] to step time deterministically.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::transaction::TransactionKey;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    offset_nanos: Arc<AtomicU64>,
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
            offset_nanos: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.offset_nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Time elapsed since the clock was created
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }

    /// Jump to `elapsed` after creation; never moves backwards
    pub fn set(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.offset_nanos.fetch_max(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }
}

/// What a timer is for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// APDU, segment or application timeout of one transaction
    Transaction(TransactionKey),
    /// Give up waiting for an I-Am-Router-To-Network for this network
    RouteResolution(u16),
    /// Re-enable communication after a timed DeviceCommunicationControl
    CommunicationControl,
}

/// Cancellation token for a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle {
    deadline: Instant,
    id: u64,
}

impl TimerHandle {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Timers ordered by deadline, ties broken by scheduling order
#[derive(Debug)]
pub struct TimerQueue<E = TimerEvent> {
    entries: BTreeMap<(Instant, u64), E>,
    next_id: u64,
}

impl<E> Default for TimerQueue<E> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 0,
        }
    }
}

impl<E> TimerQueue<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: Instant, event: E) -> TimerHandle {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.entries.insert((deadline, id), event);
        TimerHandle { deadline, id }
    }

    /// Returns the event if the timer had not fired yet
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<E> {
        self.entries.remove(&(handle.deadline, handle.id))
    }

    pub fn is_scheduled(&self, handle: TimerHandle) -> bool {
        self.entries.contains_key(&(handle.deadline, handle.id))
    }

    /// Remove and return the earliest timer whose deadline is at or before `now`
    pub fn pop_next_expired(&mut self, now: Instant) -> Option<(TimerHandle, E)> {
        let (&(deadline, id), _) = self.entries.first_key_value()?;
        if deadline > now {
            return None;
        }
        self.entries
            .remove(&(deadline, id))
            .map(|event| (TimerHandle { deadline, id }, event))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        let start = clock.now();
        let shared = clock.clone();
        shared.advance(Duration::from_millis(1500));
        assert_eq!(clock.now() - start, Duration::from_millis(1500));

        clock.set(Duration::from_millis(1000));
        assert_eq!(clock.elapsed(), Duration::from_millis(1500));
        clock.set(Duration::from_secs(4));
        assert_eq!(shared.elapsed(), Duration::from_secs(4));
    }

    #[test]
    fn test_timer_queue_order() {
        let clock = ManualClock::new();
        let now = clock.now();
        let mut timers = TimerQueue::new();
        timers.schedule(now + Duration::from_millis(30), "c");
        let first = timers.schedule(now + Duration::from_millis(10), "a");
        timers.schedule(now + Duration::from_millis(10), "b");

        assert_eq!(timers.next_deadline(), Some(first.deadline()));
        assert!(timers.pop_next_expired(now).is_none());

        let later = now + Duration::from_millis(20);
        assert_eq!(timers.pop_next_expired(later).map(|(_, e)| e), Some("a"));
        assert_eq!(timers.pop_next_expired(later).map(|(_, e)| e), Some("b"));
        assert!(timers.pop_next_expired(later).is_none());
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_timer_cancel() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        let handle = timers.schedule(now, TimerEvent::RouteResolution(5));
        assert!(timers.is_scheduled(handle));
        assert_eq!(timers.cancel(handle), Some(TimerEvent::RouteResolution(5)));
        assert_eq!(timers.cancel(handle), None);
        assert!(timers.is_empty());
        assert!(timers.pop_next_expired(now).is_none());
    }
}
