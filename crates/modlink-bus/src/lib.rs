//! # modlink-bus
//!
//! In-process event bus used by modlink mods to talk to each other without
//! holding direct references.
//!
//! This crate provides:
//! - The [`Event`] model and the [`impl_event!`] helper for concrete kinds
//! - An [`EventRegistry`] mapping kind names to factories and typed field
//!   accessor tables
//! - The [`EventBus`] publish/subscribe registry with owner tokens
//! - The [`RequestResponseManager`] that joins a request event and its
//!   response event into one awaitable call
//!
//! ## Delivery Model
//!
//! ```text
//!  publish(event)
//!       │
//!       ├── stamp timestamp
//!       ├── diagnostic listener
//!       ├── lock ─ snapshot subscribers for kind ─ unlock
//!       │
//!       └── for each snapshot entry (filter passes):
//!               handler(event)   // errors and panics are isolated
//! ```
//!
//! Handlers run with no bus lock held, so they may publish re-entrantly.

pub mod bus;
pub mod error;
pub mod event;
pub mod registry;
pub mod request;

pub use bus::{BusStats, EventBus, FilterFn, HandlerFn, OwnerToken, SubscriptionId};
pub use error::{FieldError, HandlerError, HandlerResult, RequestError};
pub use event::{downcast_shared, CorrelationId, Event, EventMeta, SharedEvent, TypedEvent};
pub use registry::{DescriptorBuilder, EventDescriptor, EventRegistry, FieldType};
pub use request::{CorrelatorConfig, CorrelatorStats, Request, RequestResponseManager};

/// Re-exported so field accessors and router parameters share one value type.
pub use serde_json::Value;
