//! Event model.
//!
//! Every concrete event kind is a plain struct with a `meta: EventMeta`
//! field plus its payload fields. [`impl_event!`](crate::impl_event) wires the
//! struct into the [`Event`] trait:
//!
//! ```
//! use modlink_bus::{impl_event, EventMeta};
//!
//! #[derive(Debug, Default, Clone)]
//! pub struct ButtonClicked {
//!     pub meta: EventMeta,
//!     pub button_id: String,
//! }
//!
//! impl_event!(ButtonClicked, "ButtonClicked");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Identifier linking a request event to its response event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Metadata carried by every event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Mod or component that published the event.
    pub sender: String,

    /// Set by the bus at publish time; any caller-supplied value is overwritten.
    pub timestamp: Option<DateTime<Utc>>,

    /// Present on request and response events.
    pub correlation_id: Option<CorrelationId>,
}

impl EventMeta {
    pub fn from_sender(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            ..Default::default()
        }
    }

    /// Metadata for one side of a request/response exchange.
    pub fn correlated(sender: impl Into<String>, correlation_id: CorrelationId) -> Self {
        Self {
            sender: sender.into(),
            timestamp: None,
            correlation_id: Some(correlation_id),
        }
    }
}

/// A message published on the bus.
///
/// Implement through [`impl_event!`](crate::impl_event) rather than by hand.
pub trait Event: Send + Sync + fmt::Debug + 'static {
    /// Kind name used for subscription matching and registry lookup.
    fn kind(&self) -> &'static str;

    fn meta(&self) -> &EventMeta;

    fn meta_mut(&mut self) -> &mut EventMeta;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// An event type whose kind name is known statically.
pub trait TypedEvent: Event + Sized {
    const KIND: &'static str;
}

/// An event after publication: shared, immutable.
pub type SharedEvent = Arc<dyn Event>;

impl dyn Event {
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.as_any().downcast_ref::<E>()
    }

    pub fn downcast_mut<E: Event>(&mut self) -> Option<&mut E> {
        self.as_any_mut().downcast_mut::<E>()
    }

    pub fn is<E: TypedEvent>(&self) -> bool {
        self.kind() == E::KIND && self.as_any().is::<E>()
    }

    pub fn sender(&self) -> &str {
        &self.meta().sender
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.meta().correlation_id
    }
}

/// Recover the concrete type of a published event.
pub fn downcast_shared<E: Event>(event: SharedEvent) -> Option<Arc<E>> {
    event.into_any().downcast::<E>().ok()
}

/// Implement [`Event`] and [`TypedEvent`] for a struct with a `meta` field.
#[macro_export]
macro_rules! impl_event {
    ($ty:ty, $kind:expr) => {
        impl $crate::Event for $ty {
            fn kind(&self) -> &'static str {
                $kind
            }

            fn meta(&self) -> &$crate::EventMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut $crate::EventMeta {
                &mut self.meta
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
                self
            }

            fn into_any(
                self: ::std::sync::Arc<Self>,
            ) -> ::std::sync::Arc<dyn ::std::any::Any + Send + Sync> {
                self
            }
        }

        impl $crate::TypedEvent for $ty {
            const KIND: &'static str = $kind;
        }
    };
}
