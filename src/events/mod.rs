//! Event Bus
//!
//! Change notifications for the cluster database:
//! - Blocking reads with class and per-object filters
//! - Monotone tokens so subscribers can resume where they left off
//! - Bounded retained history with explicit events-lost signalling
//! - Injection of synthetic events to wake subscribers deterministically
//! - Named integer barriers giving a "processed up to here" signal

mod types;

pub use types::{ClassFilter, DbEvent, EventBatch, EventError, EventFilter, EventOp, Token};

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::db::models::{Class, Ref};

/// Subscription identifier
pub type SubscriptionId = u64;

/// Default retained history window
pub const DEFAULT_MAX_HISTORY: usize = 16384;

struct SubscriptionState {
    filter: EventFilter,
    /// Highest token this subscriber has reported as applied
    processed: Token,
}

struct BarrierState {
    /// The subscription the barrier is attached to
    subscription: SubscriptionId,
    /// Every event with id <= target must be processed before the barrier trips
    target: Token,
}

struct BusInner {
    history: VecDeque<DbEvent>,
    /// Highest token emitted so far
    last_token: Token,
    /// Tokens at or below this mark have been dropped from history
    floor: Token,
    max_history: usize,
    next_subscription: SubscriptionId,
    subscriptions: HashMap<SubscriptionId, SubscriptionState>,
    barriers: HashMap<u64, BarrierState>,
}

/// Central change-notification bus
pub struct EventBus {
    inner: Mutex<BusInner>,
    cond: Condvar,
}

impl EventBus {
    pub fn new(max_history: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                history: VecDeque::with_capacity(max_history.min(1024)),
                last_token: 0,
                floor: 0,
                max_history,
                next_subscription: 1,
                subscriptions: HashMap::new(),
                barriers: HashMap::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Emit an event whose token was assigned by the database write path.
    /// Tokens must arrive strictly increasing.
    pub fn publish(&self, event: DbEvent) {
        let mut inner = self.inner.lock();
        debug_assert!(event.id > inner.last_token);
        inner.last_token = event.id;
        if inner.history.len() >= inner.max_history {
            if let Some(dropped) = inner.history.pop_front() {
                inner.floor = dropped.id;
            }
        }
        inner.history.push_back(event);
        drop(inner);
        self.cond.notify_all();
    }

    /// Register a long-lived subscription; needed for barrier tracking
    pub fn subscribe(&self, filter: EventFilter) -> SubscriptionId {
        let mut inner = self.inner.lock();
        let id = inner.next_subscription;
        inner.next_subscription += 1;
        let processed = inner.last_token;
        inner.subscriptions.insert(
            id,
            SubscriptionState {
                filter,
                processed,
            },
        );
        id
    }

    /// Replace the filter on an existing subscription
    pub fn set_filter(&self, id: SubscriptionId, filter: EventFilter) -> Result<(), EventError> {
        let mut inner = self.inner.lock();
        let sub = inner
            .subscriptions
            .get_mut(&id)
            .ok_or(EventError::UnknownSubscription(id))?;
        sub.filter = filter;
        Ok(())
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.lock().subscriptions.remove(&id);
    }

    /// Blocking read: wait until at least one event past `token` matches the
    /// filter, or the timeout expires. Returns the batch and the resume token.
    pub fn from(
        &self,
        filter: &EventFilter,
        token: &str,
        timeout: Duration,
    ) -> Result<EventBatch, EventError> {
        let from = parse_token(token)?;
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        if from > 0 && from < inner.floor {
            return Err(EventError::EventsLost(from));
        }
        loop {
            let events: Vec<DbEvent> = inner
                .history
                .iter()
                .filter(|e| e.id > from && filter.matches(e))
                .cloned()
                .collect();
            if !events.is_empty() {
                let token = inner.last_token.to_string();
                return Ok(EventBatch { events, token });
            }
            let now = Instant::now();
            if now >= deadline {
                let token = inner.last_token.max(from).to_string();
                return Ok(EventBatch {
                    events: Vec::new(),
                    token,
                });
            }
            self.cond.wait_until(&mut inner, deadline);
        }
    }

    /// Same as `from` but bound to a registered subscription's filter
    pub fn next(
        &self,
        id: SubscriptionId,
        token: &str,
        timeout: Duration,
    ) -> Result<EventBatch, EventError> {
        let filter = {
            let inner = self.inner.lock();
            inner
                .subscriptions
                .get(&id)
                .map(|s| s.filter.clone())
                .ok_or(EventError::UnknownSubscription(id))?
        };
        self.from(&filter, token, timeout)
    }

    /// The token a fresh subscriber should start from
    pub fn current_token(&self) -> String {
        self.inner.lock().last_token.to_string()
    }

    /// Associate a barrier id with a subscription at the current point in the
    /// stream. The barrier trips once the subscription has processed every
    /// event emitted before this call.
    pub fn inject_barrier(&self, barrier_id: u64, subscription: SubscriptionId) {
        let mut inner = self.inner.lock();
        let target = inner.last_token;
        inner.barriers.insert(
            barrier_id,
            BarrierState {
                subscription,
                target,
            },
        );
        drop(inner);
        self.cond.notify_all();
    }

    pub fn remove_barrier(&self, barrier_id: u64) {
        self.inner.lock().barriers.remove(&barrier_id);
    }

    /// A subscriber reports that every event up to `token` has been applied
    pub fn note_processed(&self, id: SubscriptionId, token: Token) {
        let mut inner = self.inner.lock();
        if let Some(sub) = inner.subscriptions.get_mut(&id) {
            if token > sub.processed {
                sub.processed = token;
            }
        }
        drop(inner);
        self.cond.notify_all();
    }

    /// Block until the barrier's subscription has processed past the barrier
    /// point. Returns false on timeout; the barrier is removed either way.
    pub fn wait_barrier(&self, barrier_id: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            let tripped = match inner.barriers.get(&barrier_id) {
                None => true,
                Some(barrier) => inner
                    .subscriptions
                    .get(&barrier.subscription)
                    .map(|s| s.processed >= barrier.target)
                    .unwrap_or(true),
            };
            if tripped {
                inner.barriers.remove(&barrier_id);
                return true;
            }
            if Instant::now() >= deadline {
                inner.barriers.remove(&barrier_id);
                return false;
            }
            self.cond.wait_until(&mut inner, deadline);
        }
    }

    /// Wake any subscriber watching this row with a synthetic modification
    /// event. The token is minted by the caller (the database), keeping the
    /// stream strictly ordered.
    pub fn inject(&self, token: Token, class: Class, reference: Ref, snapshot: serde_json::Value) {
        self.publish(DbEvent {
            id: token,
            class,
            operation: EventOp::Mod,
            reference,
            snapshot: Some(snapshot),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

fn parse_token(token: &str) -> Result<Token, EventError> {
    if token.is_empty() {
        return Ok(0);
    }
    token
        .parse::<u64>()
        .map_err(|_| EventError::BadToken(token.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn event(id: Token, class: Class, reference: &Ref) -> DbEvent {
        DbEvent {
            id,
            class,
            operation: EventOp::Mod,
            reference: reference.clone(),
            snapshot: Some(serde_json::json!({"id": id})),
        }
    }

    #[test]
    fn test_from_returns_matching_events() {
        let bus = EventBus::default();
        let vm = Ref::generate();
        let sr = Ref::generate();
        bus.publish(event(1, Class::Vm, &vm));
        bus.publish(event(2, Class::Sr, &sr));
        bus.publish(event(3, Class::Vm, &vm));

        let batch = bus
            .from(&EventFilter::class(Class::Vm), "", Duration::from_millis(10))
            .unwrap();
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.token, "3");

        // Resuming from the returned token yields nothing new
        let batch = bus
            .from(&EventFilter::class(Class::Vm), &batch.token, Duration::from_millis(10))
            .unwrap();
        assert!(batch.events.is_empty());
    }

    #[test]
    fn test_blocking_wakeup() {
        let bus = Arc::new(EventBus::default());
        let vm = Ref::generate();
        let bus2 = bus.clone();
        let vm2 = vm.clone();
        let handle = thread::spawn(move || {
            bus2.from(&EventFilter::class(Class::Vm), "", Duration::from_secs(5))
                .unwrap()
        });
        thread::sleep(Duration::from_millis(20));
        bus.publish(event(1, Class::Vm, &vm2));
        let batch = handle.join().unwrap();
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].reference, vm);
    }

    #[test]
    fn test_events_lost() {
        let bus = EventBus::new(2);
        let vm = Ref::generate();
        for id in 1..=5 {
            bus.publish(event(id, Class::Vm, &vm));
        }
        let err = bus
            .from(&EventFilter::all(), "1", Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(err, EventError::EventsLost(1)));
    }

    #[test]
    fn test_barrier_trips_after_processing() {
        let bus = Arc::new(EventBus::default());
        let vm = Ref::generate();
        let sub = bus.subscribe(EventFilter::class(Class::Vm));
        bus.publish(event(1, Class::Vm, &vm));
        bus.publish(event(2, Class::Vm, &vm));
        bus.inject_barrier(42, sub);

        // Nothing processed yet: barrier must not trip
        assert!(!bus.wait_barrier(42, Duration::from_millis(20)));

        bus.inject_barrier(43, sub);
        bus.note_processed(sub, 2);
        assert!(bus.wait_barrier(43, Duration::from_millis(100)));
    }

    #[test]
    fn test_object_filter() {
        let bus = EventBus::default();
        let a = Ref::generate();
        let b = Ref::generate();
        bus.publish(event(1, Class::Vm, &a));
        bus.publish(event(2, Class::Vm, &b));
        let batch = bus
            .from(
                &EventFilter::object(Class::Vm, a.clone()),
                "",
                Duration::from_millis(5),
            )
            .unwrap();
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].reference, a);
    }
}
