//! The communication router.
//!
//! Subscribes one handler per source event kind and, for each received
//! event, evaluates that kind's routes in priority order and runs the
//! actions of every route that passes.

use crate::condition::Condition;
use crate::config::{RouteConfig, RouterConfig, RouterSettings};
use crate::error::{RouterError, RouterResult};
use crate::placeholder::resolve_parameters;
use modlink_bus::{Event, EventBus, EventRegistry, OwnerToken, SharedEvent, SubscriptionId, Value};
use serde_json::Map;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Per-route lines go to `info` when debug logging is enabled, `debug` otherwise.
macro_rules! route_log {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            info!($($arg)+);
        } else {
            debug!($($arg)+);
        }
    };
}

#[derive(Debug)]
struct CompiledRoute {
    name: String,
    priority: i32,
    conditions: Vec<Condition>,
    actions: Vec<Arc<CompiledAction>>,
}

#[derive(Debug)]
struct CompiledAction {
    target: String,
    parameters: Map<String, Value>,
    delay: Option<Duration>,
}

/// Summary of routing one received event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingOutcome {
    pub kind: String,
    pub routes_evaluated: usize,
    pub routes_matched: usize,
    /// Names of matched routes, in evaluation order.
    pub matched: Vec<String>,
    pub actions_published: usize,
    pub actions_failed: usize,
}

/// Router-wide counters and gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub events_routed: u64,
    pub actions_published: u64,
    pub actions_failed: u64,
    /// Actions currently holding a limiter slot.
    pub active_actions: usize,
    /// Highest value `active_actions` has reached.
    pub peak_actions: usize,
}

struct RouterInner {
    bus: Arc<EventBus>,
    registry: Arc<EventRegistry>,
    settings: RouterSettings,
    /// Source kind -> routes, priority descending, declaration order on ties.
    index: HashMap<String, Vec<Arc<CompiledRoute>>>,
    limiter: Arc<Semaphore>,
    runtime: Handle,

    active: AtomicUsize,
    peak: AtomicUsize,
    in_flight: AtomicUsize,
    idle: Notify,

    events_routed: AtomicU64,
    actions_published: AtomicU64,
    actions_failed: AtomicU64,
}

/// Configuration-driven event router.
///
/// Dropping the router removes its bus subscriptions; routing tasks already
/// in flight run to completion.
pub struct CommunicationRouter {
    inner: Arc<RouterInner>,
    owner: OwnerToken,
    subscriptions: Vec<SubscriptionId>,
}

impl CommunicationRouter {
    /// Build the route index and subscribe to every resolvable source kind.
    ///
    /// Must be called from within a tokio runtime; routing work is spawned
    /// onto it.
    pub fn new(
        config: &RouterConfig,
        bus: Arc<EventBus>,
        registry: Arc<EventRegistry>,
    ) -> RouterResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| RouterError::NoRuntime)?;

        let index = build_index(config, &registry);
        let verbose = config.settings.enable_debug_logging;

        let inner = Arc::new(RouterInner {
            bus: Arc::clone(&bus),
            registry,
            settings: config.settings.clone(),
            index,
            limiter: Arc::new(Semaphore::new(config.settings.max_concurrent_actions)),
            runtime,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            events_routed: AtomicU64::new(0),
            actions_published: AtomicU64::new(0),
            actions_failed: AtomicU64::new(0),
        });

        let owner = bus.owner("communication-router");
        let mut kinds: Vec<&String> = inner.index.keys().collect();
        kinds.sort();

        let mut subscriptions = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let weak: Weak<RouterInner> = Arc::downgrade(&inner);
            let id = bus.subscribe_kind(
                kind,
                &owner,
                move |event: &SharedEvent| {
                    if let Some(inner) = weak.upgrade() {
                        RouterInner::spawn_routing(inner, Arc::clone(event));
                    }
                    Ok(())
                },
                None,
            );
            route_log!(verbose, kind = %kind, routes = inner.index[kind].len(), "Router subscribed to source kind");
            subscriptions.push(id);
        }

        info!(
            routes = config.routes.len(),
            source_kinds = subscriptions.len(),
            max_concurrent_actions = config.settings.max_concurrent_actions,
            "Communication router ready"
        );

        Ok(Self {
            inner,
            owner,
            subscriptions,
        })
    }

    /// Route one event and wait for all of its actions.
    ///
    /// This is what the bus subscription runs for each received event.
    pub async fn route_event(&self, event: SharedEvent) -> RoutingOutcome {
        RouterInner::route_event(Arc::clone(&self.inner), event).await
    }

    /// Route names for a source kind, in evaluation order.
    pub fn routes_for(&self, kind: &str) -> Vec<String> {
        self.inner
            .index
            .get(kind)
            .map(|routes| routes.iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Source kinds the router is subscribed to.
    pub fn source_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.inner.index.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.inner.settings
    }

    pub fn stats(&self) -> RouterStats {
        let inner = &self.inner;
        RouterStats {
            events_routed: inner.events_routed.load(Ordering::Relaxed),
            actions_published: inner.actions_published.load(Ordering::Relaxed),
            actions_failed: inner.actions_failed.load(Ordering::Relaxed),
            active_actions: inner.active.load(Ordering::SeqCst),
            peak_actions: inner.peak.load(Ordering::SeqCst),
        }
    }

    /// Wait until no routing task started by a bus delivery is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for CommunicationRouter {
    fn drop(&mut self) {
        let removed = self.inner.bus.unsubscribe_all(&self.owner);
        debug!(
            removed,
            subscriptions = self.subscriptions.len(),
            "Communication router detached from bus"
        );
    }
}

impl RouterInner {
    fn verbose(&self) -> bool {
        self.settings.enable_debug_logging
    }

    fn spawn_routing(inner: Arc<Self>, event: SharedEvent) {
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let runtime = inner.runtime.clone();
        runtime.spawn(async move {
            let tracker = Arc::clone(&inner);
            let outcome = Self::route_event(inner, event).await;
            if outcome.actions_failed > 0 {
                warn!(
                    kind = %outcome.kind,
                    failed = outcome.actions_failed,
                    published = outcome.actions_published,
                    "Routing finished with failed actions"
                );
            }
            if tracker.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                tracker.idle.notify_waiters();
            }
        });
    }

    async fn route_event(inner: Arc<Self>, event: SharedEvent) -> RoutingOutcome {
        let kind = event.kind();
        let mut outcome = RoutingOutcome {
            kind: kind.to_string(),
            ..Default::default()
        };

        let Some(routes) = inner.index.get(kind) else {
            return outcome;
        };
        inner.events_routed.fetch_add(1, Ordering::Relaxed);

        let mut actions = JoinSet::new();
        for route in routes {
            outcome.routes_evaluated += 1;
            if !inner.conditions_pass(route, &*event) {
                continue;
            }

            outcome.routes_matched += 1;
            outcome.matched.push(route.name.clone());
            route_log!(
                inner.verbose(),
                route = %route.name,
                kind,
                priority = route.priority,
                actions = route.actions.len(),
                "Route matched"
            );

            for action in &route.actions {
                actions.spawn(Self::execute_action(
                    Arc::clone(&inner),
                    Arc::clone(route),
                    Arc::clone(action),
                    Arc::clone(&event),
                ));
            }
        }

        while let Some(joined) = actions.join_next().await {
            match joined {
                Ok(Ok(())) => outcome.actions_published += 1,
                Ok(Err(err)) => {
                    outcome.actions_failed += 1;
                    warn!(kind, error = %err, "Route action skipped");
                }
                Err(err) => {
                    outcome.actions_failed += 1;
                    error!(kind, error = %err, "Route action task failed");
                }
            }
        }

        inner
            .actions_published
            .fetch_add(outcome.actions_published as u64, Ordering::Relaxed);
        inner
            .actions_failed
            .fetch_add(outcome.actions_failed as u64, Ordering::Relaxed);
        outcome
    }

    /// Conjunctive, in declaration order, stopping at the first failure.
    fn conditions_pass(&self, route: &CompiledRoute, event: &dyn Event) -> bool {
        for condition in &route.conditions {
            match condition.evaluate(&self.registry, event) {
                Ok(true) => {}
                Ok(false) => {
                    route_log!(self.verbose(), route = %route.name, condition = %condition, "Condition not met");
                    return false;
                }
                Err(err) => {
                    route_log!(self.verbose(), route = %route.name, condition = %condition, error = %err, "Condition could not be evaluated");
                    return false;
                }
            }
        }
        true
    }

    async fn execute_action(
        inner: Arc<Self>,
        route: Arc<CompiledRoute>,
        action: Arc<CompiledAction>,
        source: SharedEvent,
    ) -> RouterResult<()> {
        let descriptor = inner
            .registry
            .resolve(&action.target)
            .ok_or_else(|| RouterError::UnknownEventKind(action.target.clone()))?;

        let wait_limit = inner.settings.default_timeout();
        let started = Instant::now();
        let permit = tokio::time::timeout(wait_limit, Arc::clone(&inner.limiter).acquire_owned())
            .await
            .map_err(|_| RouterError::LimiterTimeout {
                route: route.name.clone(),
                target: action.target.clone(),
                waited: started.elapsed(),
            })?
            .map_err(|_| RouterError::LimiterClosed)?;
        let _slot = ActiveSlot::enter(&inner);

        if let Some(delay) = action.delay {
            tokio::time::sleep(delay).await;
        }

        let registry = &inner.registry;
        let parameters = resolve_parameters(&action.parameters, |path| {
            registry.read_path(&*source, path).ok()
        });

        let mut event = descriptor.create();
        event.meta_mut().sender = format!("router:{}", route.name);
        for (field, value) in &parameters {
            if let Err(err) = descriptor.set(event.as_mut(), field, value) {
                warn!(
                    route = %route.name,
                    target = %action.target,
                    field = %field,
                    error = %err,
                    "Action parameter not applied"
                );
            }
        }

        let delivered = inner.bus.publish_boxed(event);
        route_log!(
            inner.verbose(),
            route = %route.name,
            target = %action.target,
            delivered,
            "Action published"
        );

        drop(permit);
        Ok(())
    }
}

/// Tracks the active-action gauge for the lifetime of a limiter slot.
struct ActiveSlot<'a> {
    inner: &'a RouterInner,
}

impl<'a> ActiveSlot<'a> {
    fn enter(inner: &'a RouterInner) -> Self {
        let now = inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        inner.peak.fetch_max(now, Ordering::SeqCst);
        Self { inner }
    }
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn build_index(
    config: &RouterConfig,
    registry: &EventRegistry,
) -> HashMap<String, Vec<Arc<CompiledRoute>>> {
    let mut index: HashMap<String, Vec<Arc<CompiledRoute>>> = HashMap::new();

    for route in config.enabled_routes() {
        if !registry.contains(&route.source_event) {
            warn!(
                route = %route.name,
                kind = %route.source_event,
                "Route skipped: unknown source event kind"
            );
            continue;
        }

        match compile_route(route, registry) {
            Ok(compiled) => index
                .entry(route.source_event.clone())
                .or_default()
                .push(Arc::new(compiled)),
            Err(err) => warn!(route = %route.name, error = %err, "Route skipped"),
        }
    }

    // Stable: equal priorities keep declaration order.
    for routes in index.values_mut() {
        routes.sort_by(|a, b| b.priority.cmp(&a.priority));
    }
    index
}

fn compile_route(route: &RouteConfig, registry: &EventRegistry) -> RouterResult<CompiledRoute> {
    let conditions = route
        .conditions
        .iter()
        .map(Condition::compile)
        .collect::<RouterResult<Vec<_>>>()?;

    let actions = route
        .actions
        .iter()
        .filter(|action| {
            let known = registry.contains(&action.target_event);
            if !known {
                warn!(
                    route = %route.name,
                    target = %action.target_event,
                    "Action skipped: unknown target event kind"
                );
            }
            known
        })
        .map(|action| {
            Arc::new(CompiledAction {
                target: action.target_event.clone(),
                parameters: action.parameters.clone(),
                delay: action.delay(),
            })
        })
        .collect();

    Ok(CompiledRoute {
        name: route.name.clone(),
        priority: route.priority,
        conditions,
        actions,
    })
}
