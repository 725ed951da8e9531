//! Request/response correlation.
//!
//! Turns two one-way events joined by a [`CorrelationId`] into a single
//! awaitable call.
//!
//! Flow:
//! 1. Caller builds a request event whose metadata carries a correlation id
//! 2. [`RequestResponseManager::send_request`] registers a pending entry and a
//!    response subscription filtered on that id, then publishes the request
//! 3. A responder publishes the response kind with the same correlation id
//! 4. The first matching response resolves the entry; later duplicates are
//!    ignored
//!
//! A background sweep reclaims entries older than the stale threshold even
//! if their own timeout wiring never fires.

use crate::bus::{EventBus, OwnerToken, SubscriptionId};
use crate::error::RequestError;
use crate::event::{downcast_shared, CorrelationId, Event, SharedEvent, TypedEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A request event and the kind of event that answers it.
pub trait Request: TypedEvent {
    type Response: TypedEvent;
}

/// Correlator timing configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelatorConfig {
    /// Timeout used by [`RequestResponseManager::request`].
    pub default_timeout: Duration,

    /// How often the stale sweep runs.
    pub sweep_interval: Duration,

    /// Age after which the sweep force-fails a pending entry.
    pub stale_threshold: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            stale_threshold: Duration::from_secs(60),
        }
    }
}

/// Snapshot of correlator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelatorStats {
    pub sent: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub swept: u64,
    /// Responses with no matching outstanding entry.
    pub ignored: u64,
}

type Completion = oneshot::Sender<Result<SharedEvent, RequestError>>;

struct PendingEntry {
    completion: Completion,
    response_kind: &'static str,
    created_at: Instant,
    subscription: SubscriptionId,
}

#[derive(Default)]
struct PendingTable {
    entries: Mutex<HashMap<CorrelationId, PendingEntry>>,
    sent: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    swept: AtomicU64,
    ignored: AtomicU64,
}

impl PendingTable {
    /// Resolve an entry with a response. No-op for unknown ids.
    fn resolve(&self, correlation_id: CorrelationId, response: SharedEvent) -> bool {
        let entry = self.entries.lock().remove(&correlation_id);
        match entry {
            Some(entry) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    correlation_id = %correlation_id,
                    kind = entry.response_kind,
                    elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
                    "Request resolved"
                );
                // Receiver may already be gone if the caller timed out in the same instant.
                let _ = entry.completion.send(Ok(response));
                true
            }
            None => {
                self.ignored.fetch_add(1, Ordering::Relaxed);
                debug!(correlation_id = %correlation_id, "Ignoring response with no pending request");
                false
            }
        }
    }

    /// Force-fail every entry older than `stale`. Returns their subscriptions.
    fn reclaim_stale(&self, stale: Duration) -> Vec<SubscriptionId> {
        let expired: Vec<(CorrelationId, PendingEntry)> = {
            let mut entries = self.entries.lock();
            let ids: Vec<CorrelationId> = entries
                .iter()
                .filter(|(_, e)| e.created_at.elapsed() > stale)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|e| (id, e)))
                .collect()
        };

        let mut subscriptions = Vec::with_capacity(expired.len());
        for (correlation_id, entry) in expired {
            let waited = entry.created_at.elapsed();
            warn!(
                correlation_id = %correlation_id,
                kind = entry.response_kind,
                waited_ms = waited.as_millis() as u64,
                "Reclaiming stale pending request"
            );
            self.swept.fetch_add(1, Ordering::Relaxed);
            let _ = entry.completion.send(Err(RequestError::Timeout {
                correlation_id,
                waited,
                swept: true,
            }));
            subscriptions.push(entry.subscription);
        }
        subscriptions
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Removes the pending entry and its subscription however the wait ends,
/// including when the caller drops the request future.
struct PendingGuard {
    table: Arc<PendingTable>,
    bus: Arc<EventBus>,
    correlation_id: CorrelationId,
    subscription: SubscriptionId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let removed = self.table.entries.lock().remove(&self.correlation_id);
        if removed.is_some() {
            debug!(correlation_id = %self.correlation_id, "Pending request abandoned");
        }
        self.bus.unsubscribe(self.subscription);
    }
}

/// Joins request and response events by correlation id.
pub struct RequestResponseManager {
    bus: Arc<EventBus>,
    owner: OwnerToken,
    pending: Arc<PendingTable>,
    config: CorrelatorConfig,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RequestResponseManager {
    /// Create a correlator with default timings.
    ///
    /// The stale sweep is spawned on the current tokio runtime; outside a
    /// runtime the sweep is disabled and a warning is logged.
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_config(bus, CorrelatorConfig::default())
    }

    pub fn with_config(bus: Arc<EventBus>, config: CorrelatorConfig) -> Self {
        let pending = Arc::new(PendingTable::default());
        let owner = bus.owner("request-response");

        let sweeper = match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn(sweep_loop(
                Arc::downgrade(&pending),
                Arc::downgrade(&bus),
                config.sweep_interval,
                config.stale_threshold,
            ))),
            Err(_) => {
                warn!("No tokio runtime available; stale request sweep disabled");
                None
            }
        };

        Self {
            bus,
            owner,
            pending,
            config,
            sweeper: Mutex::new(sweeper),
        }
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Send a request using the configured default timeout.
    pub async fn request<R: Request>(&self, request: R) -> Result<Arc<R::Response>, RequestError> {
        self.send_request(request, self.config.default_timeout).await
    }

    /// Publish `request` and wait for the response carrying its correlation id.
    pub async fn send_request<R: Request>(
        &self,
        request: R,
        timeout: Duration,
    ) -> Result<Arc<R::Response>, RequestError> {
        self.send_request_until(request, timeout, std::future::pending::<()>())
            .await
    }

    /// Like [`send_request`](Self::send_request), but fails with
    /// [`RequestError::Cancelled`] as soon as `cancel` completes.
    pub async fn send_request_until<R, C>(
        &self,
        request: R,
        timeout: Duration,
        cancel: C,
    ) -> Result<Arc<R::Response>, RequestError>
    where
        R: Request,
        C: Future<Output = ()>,
    {
        let correlation_id = request
            .meta()
            .correlation_id
            .ok_or_else(|| RequestError::MissingCorrelationId(R::KIND.to_string()))?;

        if self.pending.entries.lock().contains_key(&correlation_id) {
            return Err(RequestError::DuplicateCorrelationId(correlation_id));
        }

        let response_kind = <R::Response as TypedEvent>::KIND;
        let (tx, rx) = oneshot::channel();

        let table: Weak<PendingTable> = Arc::downgrade(&self.pending);
        let subscription = self.bus.subscribe_kind(
            response_kind,
            &self.owner,
            move |event: &SharedEvent| {
                if let Some(table) = table.upgrade() {
                    table.resolve(correlation_id, Arc::clone(event));
                }
                Ok(())
            },
            Some(Arc::new(move |event: &dyn Event| {
                event.correlation_id() == Some(correlation_id)
            })),
        );

        {
            let mut entries = self.pending.entries.lock();
            if entries.contains_key(&correlation_id) {
                drop(entries);
                self.bus.unsubscribe(subscription);
                return Err(RequestError::DuplicateCorrelationId(correlation_id));
            }
            entries.insert(
                correlation_id,
                PendingEntry {
                    completion: tx,
                    response_kind,
                    created_at: Instant::now(),
                    subscription,
                },
            );
        }
        self.pending.sent.fetch_add(1, Ordering::Relaxed);

        let _guard = PendingGuard {
            table: Arc::clone(&self.pending),
            bus: Arc::clone(&self.bus),
            correlation_id,
            subscription,
        };

        debug!(
            correlation_id = %correlation_id,
            request = R::KIND,
            response = response_kind,
            timeout_ms = timeout.as_millis() as u64,
            "Sending request"
        );
        let started = Instant::now();
        self.bus.publish(request);

        let outcome = tokio::select! {
            resolved = rx => match resolved {
                Ok(result) => result,
                Err(_) => Err(RequestError::Disposed(correlation_id)),
            },
            _ = tokio::time::sleep(timeout) => {
                self.pending.timed_out.fetch_add(1, Ordering::Relaxed);
                Err(RequestError::Timeout {
                    correlation_id,
                    waited: started.elapsed(),
                    swept: false,
                })
            }
            _ = cancel => {
                self.pending.cancelled.fetch_add(1, Ordering::Relaxed);
                Err(RequestError::Cancelled(correlation_id))
            }
        };

        let response = outcome?;
        let actual = response.kind();
        downcast_shared::<R::Response>(response).ok_or(RequestError::UnexpectedResponse {
            expected: response_kind,
            actual,
        })
    }

    /// Number of outstanding requests.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> CorrelatorStats {
        CorrelatorStats {
            sent: self.pending.sent.load(Ordering::Relaxed),
            completed: self.pending.completed.load(Ordering::Relaxed),
            timed_out: self.pending.timed_out.load(Ordering::Relaxed),
            cancelled: self.pending.cancelled.load(Ordering::Relaxed),
            swept: self.pending.swept.load(Ordering::Relaxed),
            ignored: self.pending.ignored.load(Ordering::Relaxed),
        }
    }

    /// Run one stale sweep immediately. Returns the number of entries reclaimed.
    pub fn sweep_now(&self) -> usize {
        let subscriptions = self.pending.reclaim_stale(self.config.stale_threshold);
        for id in &subscriptions {
            self.bus.unsubscribe(*id);
        }
        subscriptions.len()
    }

    /// Stop the sweep and fail every outstanding request.
    pub fn dispose(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }

        let drained: Vec<(CorrelationId, PendingEntry)> =
            self.pending.entries.lock().drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "Failing outstanding requests on dispose");
        }
        for (correlation_id, entry) in drained {
            let _ = entry
                .completion
                .send(Err(RequestError::Disposed(correlation_id)));
        }

        self.bus.unsubscribe_all(&self.owner);
    }
}

impl Drop for RequestResponseManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn sweep_loop(
    pending: Weak<PendingTable>,
    bus: Weak<EventBus>,
    interval: Duration,
    stale: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(table) = pending.upgrade() else {
            break;
        };

        let subscriptions = table.reclaim_stale(stale);
        if subscriptions.is_empty() {
            continue;
        }
        debug!(reclaimed = subscriptions.len(), "Stale sweep reclaimed pending requests");
        if let Some(bus) = bus.upgrade() {
            for id in subscriptions {
                bus.unsubscribe(id);
            }
        }
    }
}
