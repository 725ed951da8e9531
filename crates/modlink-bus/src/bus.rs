//! # Event Bus
//!
//! Typed publish/subscribe registry.
//!
//! Subscriptions are indexed by event kind name. Each subscription belongs to
//! an [`OwnerToken`]; [`EventBus::unsubscribe_all`] removes everything a token
//! registered, and once every clone of a token is dropped its subscriptions
//! are pruned on the next publish of their kind.

use crate::error::{HandlerError, HandlerResult};
use crate::event::{Event, SharedEvent, TypedEvent};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn};

/// Type-erased subscriber callback.
pub type HandlerFn = Arc<dyn Fn(&SharedEvent) -> HandlerResult + Send + Sync>;

/// Type-erased subscription filter.
pub type FilterFn = Arc<dyn Fn(&dyn Event) -> bool + Send + Sync>;

type DiagnosticFn = Arc<dyn Fn(&dyn Event) + Send + Sync>;

/// Handle for one registered subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Lifetime token identifying the owner of a group of subscriptions.
///
/// Clones share identity. The owner counts as gone once every clone has
/// been dropped.
#[derive(Clone)]
pub struct OwnerToken {
    id: u64,
    label: Arc<str>,
    alive: Arc<()>,
}

impl OwnerToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn watch(&self) -> Weak<()> {
        Arc::downgrade(&self.alive)
    }
}

impl fmt::Debug for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerToken")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish()
    }
}

impl PartialEq for OwnerToken {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for OwnerToken {}

struct SubscriptionEntry {
    id: SubscriptionId,
    owner_id: u64,
    owner_label: Arc<str>,
    owner: Weak<()>,
    handler: HandlerFn,
    filter: Option<FilterFn>,
}

impl SubscriptionEntry {
    fn owner_alive(&self) -> bool {
        self.owner.strong_count() > 0
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Events passed to `publish*`.
    pub published: u64,
    /// Handler invocations (filter passed).
    pub delivered: u64,
    /// Handlers that returned an error or panicked.
    pub handler_failures: u64,
    /// Subscriptions dropped because their owner was gone.
    pub pruned: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    handler_failures: AtomicU64,
    pruned: AtomicU64,
}

/// In-process publish/subscribe bus.
pub struct EventBus {
    /// Subscriptions by event kind, in registration order.
    subscriptions: Mutex<HashMap<String, Vec<Arc<SubscriptionEntry>>>>,

    /// Bus-wide listener notified of every publish before delivery.
    diagnostic: RwLock<Option<DiagnosticFn>>,

    next_id: AtomicU64,

    counters: Counters,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            diagnostic: RwLock::new(None),
            next_id: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    /// Create a new owner token.
    pub fn owner(&self, label: impl Into<String>) -> OwnerToken {
        let label: String = label.into();
        OwnerToken {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            label: Arc::from(label),
            alive: Arc::new(()),
        }
    }

    /// Subscribe a typed handler to every event of kind `E`.
    pub fn subscribe<E, F>(&self, owner: &OwnerToken, handler: F) -> SubscriptionId
    where
        E: TypedEvent,
        F: Fn(&E) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe_kind(E::KIND, owner, typed_handler(handler), None)
    }

    /// Subscribe a typed handler that only sees events passing `filter`.
    pub fn subscribe_filtered<E, F, P>(
        &self,
        owner: &OwnerToken,
        handler: F,
        filter: P,
    ) -> SubscriptionId
    where
        E: TypedEvent,
        F: Fn(&E) -> HandlerResult + Send + Sync + 'static,
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        let filter: FilterFn = Arc::new(move |event: &dyn Event| {
            event.downcast_ref::<E>().map(&filter).unwrap_or(false)
        });
        self.subscribe_kind(E::KIND, owner, typed_handler(handler), Some(filter))
    }

    /// Subscribe an untyped handler by kind name.
    ///
    /// No uniqueness check: the same handler may be registered any number of
    /// times, each with its own filter.
    pub fn subscribe_kind<F>(
        &self,
        kind: &str,
        owner: &OwnerToken,
        handler: F,
        filter: Option<FilterFn>,
    ) -> SubscriptionId
    where
        F: Fn(&SharedEvent) -> HandlerResult + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(SubscriptionEntry {
            id,
            owner_id: owner.id,
            owner_label: Arc::clone(&owner.label),
            owner: owner.watch(),
            handler: Arc::new(handler),
            filter,
        });

        self.subscriptions
            .lock()
            .entry(kind.to_string())
            .or_default()
            .push(entry);

        debug!(kind, subscription = %id, owner = %owner.label, "Subscribed");
        id
    }

    /// Remove one subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.remove_where(id, |_| true)
    }

    /// Remove one subscription only if it was registered with `owner`.
    ///
    /// Returns false if it was not registered or belongs to another owner.
    pub fn unsubscribe_owned(&self, id: SubscriptionId, owner: &OwnerToken) -> bool {
        let removed = self.remove_where(id, |e| e.owner_id == owner.id);
        if !removed {
            debug!(subscription = %id, owner = %owner.label, "Unsubscribe refused or unknown");
        }
        removed
    }

    fn remove_where(&self, id: SubscriptionId, allowed: impl Fn(&SubscriptionEntry) -> bool) -> bool {
        let mut index = self.subscriptions.lock();
        let mut found = None;

        for (kind, entries) in index.iter_mut() {
            if let Some(pos) = entries.iter().position(|e| e.id == id) {
                if !allowed(&*entries[pos]) {
                    return false;
                }
                entries.remove(pos);
                found = Some((kind.clone(), entries.is_empty()));
                break;
            }
        }

        match found {
            Some((kind, now_empty)) => {
                if now_empty {
                    index.remove(&kind);
                }
                trace!(kind = %kind, subscription = %id, "Unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Remove every subscription registered with `owner`.
    ///
    /// Returns the number removed.
    pub fn unsubscribe_all(&self, owner: &OwnerToken) -> usize {
        let mut index = self.subscriptions.lock();
        let mut removed = 0;

        index.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| e.owner_id != owner.id);
            removed += before - entries.len();
            !entries.is_empty()
        });

        if removed > 0 {
            debug!(owner = %owner.label, removed, "Removed all subscriptions for owner");
        }
        removed
    }

    /// Install the bus-wide diagnostic listener, replacing any previous one.
    pub fn set_diagnostic_listener<F>(&self, listener: F)
    where
        F: Fn(&dyn Event) + Send + Sync + 'static,
    {
        *self.diagnostic.write() = Some(Arc::new(listener));
    }

    pub fn clear_diagnostic_listener(&self) {
        *self.diagnostic.write() = None;
    }

    /// Publish an event.
    ///
    /// Returns the number of handlers invoked.
    pub fn publish<E: Event>(&self, mut event: E) -> usize {
        event.meta_mut().timestamp = Some(Utc::now());
        self.dispatch(Arc::new(event))
    }

    /// Publish an event constructed dynamically (e.g. from the registry).
    pub fn publish_boxed(&self, mut event: Box<dyn Event>) -> usize {
        event.meta_mut().timestamp = Some(Utc::now());
        self.dispatch(Arc::from(event))
    }

    fn dispatch(&self, event: SharedEvent) -> usize {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        let kind = event.kind();

        let listener = self.diagnostic.read().clone();
        if let Some(listener) = listener {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(&*event))).is_err() {
                warn!(kind, "Diagnostic listener panicked");
            }
        }

        let snapshot = self.snapshot(kind);
        if snapshot.is_empty() {
            trace!(kind, sender = %event.sender(), "Event published with no subscribers");
            return 0;
        }

        let mut invoked = 0;
        for entry in &snapshot {
            if let Some(filter) = &entry.filter {
                match panic::catch_unwind(AssertUnwindSafe(|| filter(&*event))) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(payload) => {
                        self.report_failure(entry, kind, &panic_message(payload.as_ref()));
                        continue;
                    }
                }
            }

            invoked += 1;
            match panic::catch_unwind(AssertUnwindSafe(|| (entry.handler)(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => self.report_failure(entry, kind, err.message()),
                Err(payload) => self.report_failure(entry, kind, &panic_message(payload.as_ref())),
            }
        }

        self.counters
            .delivered
            .fetch_add(invoked as u64, Ordering::Relaxed);
        trace!(kind, invoked, "Event delivered");
        invoked
    }

    // Copy out the subscriber list under the lock, pruning dead owners.
    fn snapshot(&self, kind: &str) -> Vec<Arc<SubscriptionEntry>> {
        let mut index = self.subscriptions.lock();
        let Some(entries) = index.get_mut(kind) else {
            return Vec::new();
        };

        let before = entries.len();
        entries.retain(|e| e.owner_alive());
        let pruned = before - entries.len();
        let snapshot = entries.clone();

        if entries.is_empty() {
            index.remove(kind);
        }
        drop(index);

        if pruned > 0 {
            self.counters
                .pruned
                .fetch_add(pruned as u64, Ordering::Relaxed);
            debug!(kind, pruned, "Pruned subscriptions whose owner is gone");
        }
        snapshot
    }

    fn report_failure(&self, entry: &SubscriptionEntry, kind: &str, message: &str) {
        self.counters
            .handler_failures
            .fetch_add(1, Ordering::Relaxed);
        error!(
            kind,
            subscription = %entry.id,
            owner = %entry.owner_label,
            error = message,
            "Event handler failed"
        );
    }

    /// Number of live subscriptions for a kind.
    pub fn subscription_count(&self, kind: &str) -> usize {
        self.subscriptions
            .lock()
            .get(kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn total_subscriptions(&self) -> usize {
        self.subscriptions.lock().values().map(Vec::len).sum()
    }

    /// Kinds with at least one subscription.
    pub fn subscribed_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.subscriptions.lock().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
            pruned: self.counters.pruned.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn typed_handler<E, F>(handler: F) -> impl Fn(&SharedEvent) -> HandlerResult + Send + Sync + 'static
where
    E: TypedEvent,
    F: Fn(&E) -> HandlerResult + Send + Sync + 'static,
{
    move |event: &SharedEvent| match (**event).downcast_ref::<E>() {
        Some(typed) => handler(typed),
        None => Err(HandlerError::new(format!(
            "expected event of type '{}', got '{}'",
            E::KIND,
            event.kind()
        ))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMeta;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct Tick {
        meta: EventMeta,
        n: u32,
    }

    crate::impl_event!(Tick, "Tick");

    #[test]
    fn test_publish_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(Tick::default()), 0);
        assert_eq!(bus.stats().published, 1);
    }

    #[test]
    fn test_publish_stamps_timestamp() {
        let bus = EventBus::new();
        let owner = bus.owner("test");
        let stamped = Arc::new(Mutex::new(false));
        let seen = Arc::clone(&stamped);

        bus.subscribe::<Tick, _>(&owner, move |tick| {
            *seen.lock() = tick.meta.timestamp.is_some();
            Ok(())
        });

        bus.publish(Tick::default());
        assert!(*stamped.lock());
    }

    #[test]
    fn test_filter() {
        let bus = EventBus::new();
        let owner = bus.owner("test");
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);

        bus.subscribe_filtered::<Tick, _, _>(
            &owner,
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            |tick| tick.n % 2 == 0,
        );

        for n in 0..4 {
            bus.publish(Tick {
                n,
                ..Default::default()
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_drops_empty_kind() {
        let bus = EventBus::new();
        let owner = bus.owner("test");
        let id = bus.subscribe::<Tick, _>(&owner, |_| Ok(()));

        assert_eq!(bus.subscription_count("Tick"), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert!(bus.subscribed_kinds().is_empty());
    }

    #[test]
    fn test_unsubscribe_owned_checks_owner() {
        let bus = EventBus::new();
        let a = bus.owner("a");
        let b = bus.owner("b");
        let id = bus.subscribe::<Tick, _>(&a, |_| Ok(()));

        assert!(!bus.unsubscribe_owned(id, &b));
        assert_eq!(bus.subscription_count("Tick"), 1);
        assert!(bus.unsubscribe_owned(id, &a.clone()));
        assert!(!bus.unsubscribe_owned(id, &a));
        assert!(bus.subscribed_kinds().is_empty());
    }

    #[test]
    fn test_unsubscribe_all() {
        let bus = EventBus::new();
        let a = bus.owner("a");
        let b = bus.owner("b");

        bus.subscribe::<Tick, _>(&a, |_| Ok(()));
        bus.subscribe::<Tick, _>(&a, |_| Ok(()));
        bus.subscribe::<Tick, _>(&b, |_| Ok(()));

        assert_eq!(bus.unsubscribe_all(&a), 2);
        assert_eq!(bus.subscription_count("Tick"), 1);
        assert_eq!(bus.publish(Tick::default()), 1);
    }

    #[test]
    fn test_dropped_owner_pruned_on_publish() {
        let bus = EventBus::new();
        {
            let owner = bus.owner("short-lived");
            bus.subscribe::<Tick, _>(&owner, |_| Ok(()));
        }

        assert_eq!(bus.subscription_count("Tick"), 1);
        assert_eq!(bus.publish(Tick::default()), 0);
        assert_eq!(bus.subscription_count("Tick"), 0);
        assert_eq!(bus.stats().pruned, 1);
    }

    #[test]
    fn test_handler_error_and_panic_isolated() {
        let bus = EventBus::new();
        let owner = bus.owner("test");
        let reached = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&reached);

        bus.subscribe::<Tick, _>(&owner, |_| Err("boom".into()));
        bus.subscribe::<Tick, _>(&owner, |_| panic!("handler panic"));
        bus.subscribe::<Tick, _>(&owner, move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(bus.publish(Tick::default()), 3);
        assert_eq!(reached.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().handler_failures, 2);
    }

    #[test]
    fn test_diagnostic_listener() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        bus.set_diagnostic_listener(move |event| {
            assert_eq!(event.kind(), "Tick");
            s.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(Tick::default());
        bus.clear_diagnostic_listener();
        bus.publish(Tick::default());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
