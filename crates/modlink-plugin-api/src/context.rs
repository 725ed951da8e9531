//! The handle a mod's behaviours use to reach the host.
//!
//! Every operation is checked against the mod's [`SecurityContext`]:
//!
//! | Operation | Permission | Quota |
//! |-----------|------------|-------|
//! | `publish` | `events.publish` | `max_event_publish_rate` per second |
//! | `subscribe` | `events.subscribe` | |
//! | `request` | `services.call` | `max_service_call_rate` per second |
//! | `create_object` | `objects.create` | `max_objects` live |
//!
//! A rate of zero means no limit.

use crate::error::ContextError;
use crate::host::{HostServices, LogLevel, ObjectHandle, PathProvider};
use crate::resources::ResourceTable;
use modlink_bus::{
    Event, EventBus, HandlerResult, OwnerToken, Request, RequestResponseManager, SubscriptionId,
    TypedEvent,
};
use modlink_runtime::{Permission, ResourceLimits, SecurityContext};
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Sliding one-second window of call timestamps.
#[derive(Debug)]
struct RateWindow {
    stamps: Mutex<VecDeque<Instant>>,
}

impl RateWindow {
    fn new() -> Self {
        Self {
            stamps: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a call if fewer than `limit` happened in the last second.
    fn try_acquire(&self, limit: u32) -> bool {
        if limit == 0 {
            return true;
        }

        let now = Instant::now();
        let mut stamps = self.stamps.lock();
        while let Some(&oldest) = stamps.front() {
            if now.duration_since(oldest) >= RATE_WINDOW {
                stamps.pop_front();
            } else {
                break;
            }
        }

        if stamps.len() >= limit as usize {
            return false;
        }
        stamps.push_back(now);
        true
    }
}

/// Host access for one loaded mod.
pub struct ModContext {
    security: SecurityContext,
    bus: Arc<EventBus>,
    requests: Option<Arc<RequestResponseManager>>,
    services: HostServices,
    resources: Arc<ResourceTable>,
    owner: OwnerToken,
    publish_window: RateWindow,
    call_window: RateWindow,
    objects: Mutex<BTreeSet<ObjectHandle>>,
}

impl ModContext {
    pub fn new(
        security: SecurityContext,
        bus: Arc<EventBus>,
        requests: Option<Arc<RequestResponseManager>>,
        services: HostServices,
        resources: Arc<ResourceTable>,
    ) -> Self {
        let owner = bus.owner(format!("mod:{}", security.mod_id()));
        Self {
            security,
            bus,
            requests,
            services,
            resources,
            owner,
            publish_window: RateWindow::new(),
            call_window: RateWindow::new(),
            objects: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn mod_id(&self) -> &str {
        self.security.mod_id()
    }

    pub fn security(&self) -> &SecurityContext {
        &self.security
    }

    pub fn limits(&self) -> &ResourceLimits {
        self.security.limits()
    }

    pub fn resources(&self) -> &ResourceTable {
        &self.resources
    }

    pub fn paths(&self) -> &dyn PathProvider {
        self.services.paths.as_ref()
    }

    /// Persistent data directory of this mod.
    pub fn data_dir(&self) -> PathBuf {
        self.services.paths.mod_data_dir(self.mod_id())
    }

    /// Owner token of every subscription made through this context.
    pub fn owner(&self) -> &OwnerToken {
        &self.owner
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        self.services.log.log(self.mod_id(), level, message);
    }

    /// Publish an event as this mod.
    ///
    /// The sender is set to the mod id. Returns the number of handlers
    /// invoked.
    pub fn publish<E: Event>(&self, mut event: E) -> Result<usize, ContextError> {
        self.security.require(&Permission::EventsPublish)?;

        let limit = self.limits().max_event_publish_rate;
        if !self.publish_window.try_acquire(limit) {
            warn!(mod_id = %self.mod_id(), kind = event.kind(), limit, "Publish rate exceeded");
            return Err(ContextError::RateLimited {
                mod_id: self.mod_id().to_string(),
                what: "event publish",
                limit,
            });
        }

        event.meta_mut().sender = self.mod_id().to_string();
        Ok(self.bus.publish(event))
    }

    /// Subscribe to events of kind `E`. Removed automatically on unload.
    pub fn subscribe<E, F>(&self, handler: F) -> Result<SubscriptionId, ContextError>
    where
        E: TypedEvent,
        F: Fn(&E) -> HandlerResult + Send + Sync + 'static,
    {
        self.security.require(&Permission::EventsSubscribe)?;
        Ok(self.bus.subscribe(&self.owner, handler))
    }

    /// Remove a subscription made through this context.
    ///
    /// Ids owned by anyone else are left alone and yield false.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe_owned(id, &self.owner)
    }

    /// Send a request and wait for its response.
    ///
    /// `timeout` defaults to the correlator's configured timeout.
    pub async fn request<R: Request>(
        &self,
        mut request: R,
        timeout: Option<Duration>,
    ) -> Result<Arc<R::Response>, ContextError> {
        self.security.require(&Permission::ServicesCall)?;
        let requests = self.requests.as_ref().ok_or(ContextError::NoCorrelator)?;

        let limit = self.limits().max_service_call_rate;
        if !self.call_window.try_acquire(limit) {
            return Err(ContextError::RateLimited {
                mod_id: self.mod_id().to_string(),
                what: "service call",
                limit,
            });
        }

        request.meta_mut().sender = self.mod_id().to_string();
        let timeout = timeout.unwrap_or(requests.config().default_timeout);
        Ok(requests.send_request(request, timeout).await?)
    }

    /// Create a host object from a definition in the resource table.
    pub fn create_object(&self, definition: &str) -> Result<ObjectHandle, ContextError> {
        self.security.require(&Permission::ObjectsCreate)?;
        let factory = self
            .services
            .objects
            .as_ref()
            .ok_or(ContextError::NoObjectFactory)?;
        let definition = self
            .resources
            .object(definition)
            .ok_or_else(|| ContextError::UnknownObject(definition.to_string()))?;

        let max = self.limits().max_objects;
        let mut live = self.objects.lock();
        if live.len() >= max as usize {
            return Err(ContextError::ObjectLimit {
                mod_id: self.mod_id().to_string(),
                max,
            });
        }

        let handle = factory
            .create(self.mod_id(), definition)
            .map_err(ContextError::Object)?;
        live.insert(handle);
        debug!(mod_id = %self.mod_id(), object = %handle, definition = %definition.name, "Created object");
        Ok(handle)
    }

    /// Destroy an object this mod created. Returns false for unknown handles.
    pub fn destroy_object(&self, handle: ObjectHandle) -> bool {
        if !self.objects.lock().remove(&handle) {
            return false;
        }
        if let Some(factory) = &self.services.objects {
            factory.destroy(self.mod_id(), handle);
        }
        true
    }

    pub fn live_objects(&self) -> usize {
        self.objects.lock().len()
    }

    /// Drop every subscription and object owned by the mod.
    pub(crate) fn release_all(&self) -> (usize, usize) {
        let subscriptions = self.bus.unsubscribe_all(&self.owner);

        let objects = std::mem::take(&mut *self.objects.lock());
        if let Some(factory) = &self.services.objects {
            for handle in &objects {
                factory.destroy(self.mod_id(), *handle);
            }
        }

        (subscriptions, objects.len())
    }
}

impl std::fmt::Debug for ModContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModContext")
            .field("mod_id", &self.mod_id())
            .field("permissions", self.security.permissions())
            .field("live_objects", &self.live_objects())
            .finish()
    }
}
