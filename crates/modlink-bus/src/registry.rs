//! Event-kind registry.
//!
//! Maps a kind name to a factory and a table of named field accessors. The
//! router uses it to construct events it has never seen at compile time and
//! to read or assign their fields by name, without scanning loaded code.
//!
//! Accessor tables are built once, at registration:
//!
//! ```
//! use modlink_bus::{impl_event, EventDescriptor, EventMeta, EventRegistry};
//!
//! #[derive(Debug, Default)]
//! pub struct ButtonClicked {
//!     pub meta: EventMeta,
//!     pub button_id: String,
//! }
//! impl_event!(ButtonClicked, "ButtonClicked");
//!
//! let registry = EventRegistry::new();
//! registry.register(
//!     EventDescriptor::builder::<ButtonClicked>()
//!         .field("ButtonId", |e| &e.button_id, |e| &mut e.button_id)
//!         .build(),
//! );
//! assert!(registry.contains("ButtonClicked"));
//! ```

use crate::error::FieldError;
use crate::event::{Event, TypedEvent};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

type Factory = Arc<dyn Fn() -> Box<dyn Event> + Send + Sync>;
type FieldGetter = Arc<dyn Fn(&dyn Event) -> Result<Value, FieldError> + Send + Sync>;
type FieldSetter = Arc<dyn Fn(&mut dyn Event, &Value) -> Result<(), FieldError> + Send + Sync>;

/// Conversion between a concrete field type and the dynamic [`Value`].
pub trait FieldType: Sized {
    /// Name used in type-mismatch errors.
    const TYPE_NAME: &'static str;

    fn to_value(&self) -> Value;

    fn from_value(value: &Value) -> Option<Self>;
}

impl FieldType for String {
    const TYPE_NAME: &'static str = "string";

    fn to_value(&self) -> Value {
        Value::String(self.clone())
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

impl FieldType for bool {
    const TYPE_NAME: &'static str = "bool";

    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FieldType for i64 {
    const TYPE_NAME: &'static str = "integer";

    fn to_value(&self) -> Value {
        Value::from(*self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| f as i64)
            }),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FieldType for i32 {
    const TYPE_NAME: &'static str = "integer";

    fn to_value(&self) -> Value {
        Value::from(*self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        i64::from_value(value).and_then(|v| i32::try_from(v).ok())
    }
}

impl FieldType for u64 {
    const TYPE_NAME: &'static str = "unsigned integer";

    fn to_value(&self) -> Value {
        Value::from(*self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FieldType for f64 {
    const TYPE_NAME: &'static str = "number";

    fn to_value(&self) -> Value {
        serde_json::Number::from_f64(*self)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FieldType for Value {
    const TYPE_NAME: &'static str = "value";

    fn to_value(&self) -> Value {
        self.clone()
    }

    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl<T: FieldType> FieldType for Option<T> {
    const TYPE_NAME: &'static str = T::TYPE_NAME;

    fn to_value(&self) -> Value {
        self.as_ref().map(T::to_value).unwrap_or(Value::Null)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// Named accessor pair for one field.
#[derive(Clone)]
struct FieldAccessor {
    get: FieldGetter,
    set: FieldSetter,
}

/// Factory and accessor table for one event kind.
pub struct EventDescriptor {
    name: &'static str,
    factory: Factory,
    fields: HashMap<String, FieldAccessor>,
    field_order: Vec<String>,
}

impl std::fmt::Debug for EventDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDescriptor")
            .field("name", &self.name)
            .field("fields", &self.field_order)
            .finish()
    }
}

impl EventDescriptor {
    /// Start building a descriptor for `E`.
    pub fn builder<E: TypedEvent + Default>() -> DescriptorBuilder<E> {
        DescriptorBuilder {
            fields: HashMap::new(),
            field_order: Vec::new(),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Construct a fresh, default-valued instance of this kind.
    pub fn create(&self) -> Box<dyn Event> {
        (self.factory)()
    }

    /// Declared field names in registration order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.field_order.iter().map(String::as_str)
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.lookup(field).is_some()
    }

    /// Read a top-level field.
    ///
    /// Falls back to the metadata pseudo-fields `Sender`, `Timestamp` and
    /// `CorrelationId` when the kind declares no field of that name.
    pub fn get(&self, event: &dyn Event, field: &str) -> Result<Value, FieldError> {
        if let Some(accessor) = self.lookup(field) {
            return (accessor.get)(event);
        }

        let meta = event.meta();
        match field {
            "Sender" | "sender" => Ok(Value::String(meta.sender.clone())),
            "Timestamp" | "timestamp" => Ok(meta
                .timestamp
                .map(|t| Value::String(t.to_rfc3339()))
                .unwrap_or(Value::Null)),
            "CorrelationId" | "correlation_id" => Ok(meta
                .correlation_id
                .map(|id| Value::String(id.to_string()))
                .unwrap_or(Value::Null)),
            _ => Err(FieldError::UnknownField {
                kind: self.name.to_string(),
                field: field.to_string(),
            }),
        }
    }

    /// Assign a top-level field.
    pub fn set(&self, event: &mut dyn Event, field: &str, value: &Value) -> Result<(), FieldError> {
        match self.lookup(field) {
            Some(accessor) => (accessor.set)(event, value),
            None if matches!(field, "Timestamp" | "timestamp" | "CorrelationId") => {
                Err(FieldError::ReadOnly(field.to_string()))
            }
            None => Err(FieldError::UnknownField {
                kind: self.name.to_string(),
                field: field.to_string(),
            }),
        }
    }

    // Exact match first, then case-insensitive.
    fn lookup(&self, field: &str) -> Option<&FieldAccessor> {
        self.fields.get(field).or_else(|| {
            self.field_order
                .iter()
                .find(|name| name.eq_ignore_ascii_case(field))
                .and_then(|name| self.fields.get(name))
        })
    }
}

/// Typed builder for an [`EventDescriptor`].
pub struct DescriptorBuilder<E> {
    fields: HashMap<String, FieldAccessor>,
    field_order: Vec<String>,
    _marker: PhantomData<fn() -> E>,
}

impl<E: TypedEvent + Default> DescriptorBuilder<E> {
    /// Declare a named field with a typed getter and mutable getter.
    pub fn field<T, G, M>(mut self, name: &str, get: G, get_mut: M) -> Self
    where
        T: FieldType + 'static,
        G: Fn(&E) -> &T + Send + Sync + 'static,
        M: Fn(&mut E) -> &mut T + Send + Sync + 'static,
    {
        let getter: FieldGetter = Arc::new(move |event: &dyn Event| {
            event
                .downcast_ref::<E>()
                .map(|e| get(e).to_value())
                .ok_or_else(|| FieldError::KindMismatch {
                    expected: E::KIND.to_string(),
                    actual: event.kind().to_string(),
                })
        });

        let field = name.to_string();
        let setter: FieldSetter = Arc::new(move |event: &mut dyn Event, value: &Value| {
            let actual = event.kind();
            let target = event
                .downcast_mut::<E>()
                .ok_or_else(|| FieldError::KindMismatch {
                    expected: E::KIND.to_string(),
                    actual: actual.to_string(),
                })?;
            let converted = T::from_value(value).ok_or_else(|| FieldError::TypeMismatch {
                kind: E::KIND.to_string(),
                field: field.clone(),
                expected: T::TYPE_NAME,
                actual: value.to_string(),
            })?;
            *get_mut(target) = converted;
            Ok(())
        });

        if self
            .fields
            .insert(name.to_string(), FieldAccessor { get: getter, set: setter })
            .is_none()
        {
            self.field_order.push(name.to_string());
        }
        self
    }

    pub fn build(self) -> EventDescriptor {
        EventDescriptor {
            name: E::KIND,
            factory: Arc::new(|| Box::new(E::default()) as Box<dyn Event>),
            fields: self.fields,
            field_order: self.field_order,
        }
    }
}

/// Registry of event kinds, keyed by kind name.
#[derive(Default)]
pub struct EventRegistry {
    kinds: RwLock<HashMap<String, Arc<EventDescriptor>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. Replaces (and warns about) an existing one.
    pub fn register(&self, descriptor: EventDescriptor) -> Arc<EventDescriptor> {
        let descriptor = Arc::new(descriptor);
        let name = descriptor.name().to_string();
        let previous = self.kinds.write().insert(name.clone(), Arc::clone(&descriptor));

        if previous.is_some() {
            warn!(kind = %name, "Event kind re-registered; previous descriptor replaced");
        } else {
            debug!(kind = %name, "Registered event kind");
        }
        descriptor
    }

    /// Register a kind with no named fields.
    pub fn register_kind<E: TypedEvent + Default>(&self) -> Arc<EventDescriptor> {
        self.register(EventDescriptor::builder::<E>().build())
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<EventDescriptor>> {
        self.kinds.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kinds.read().contains_key(name)
    }

    /// Construct a default instance of a kind by name.
    pub fn create(&self, name: &str) -> Option<Box<dyn Event>> {
        self.resolve(name).map(|d| d.create())
    }

    /// All registered kind names, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut names: Vec<String> = self.kinds.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.kinds.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.read().is_empty()
    }

    /// Resolve a dotted property path against an event.
    ///
    /// The first segment goes through the kind's accessor table; remaining
    /// segments walk object keys or array indices of the returned value.
    pub fn read_path(&self, event: &dyn Event, path: &str) -> Result<Value, FieldError> {
        let mut segments = path.split('.');
        let head = segments
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| FieldError::InvalidPath(path.to_string()))?;

        let descriptor = self
            .resolve(event.kind())
            .ok_or_else(|| FieldError::UnknownKind(event.kind().to_string()))?;

        let mut current = descriptor.get(event, head)?;
        for segment in segments {
            let segment = segment.trim();
            if segment.is_empty() {
                return Err(FieldError::InvalidPath(path.to_string()));
            }
            current = step_into(&current, segment).ok_or_else(|| FieldError::UnknownField {
                kind: event.kind().to_string(),
                field: path.to_string(),
            })?;
        }
        Ok(current)
    }
}

fn step_into(value: &Value, segment: &str) -> Option<Value> {
    match value {
        Value::Object(map) => map.get(segment).cloned().or_else(|| {
            map.iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(segment))
                .map(|(_, v)| v.clone())
        }),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i).cloned()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMeta;
    use serde_json::json;

    #[derive(Debug, Default)]
    struct Purchase {
        meta: EventMeta,
        item: String,
        amount: i64,
        parameters: Value,
        note: Option<String>,
    }

    crate::impl_event!(Purchase, "Purchase");

    fn registry() -> EventRegistry {
        let registry = EventRegistry::new();
        registry.register(
            EventDescriptor::builder::<Purchase>()
                .field("Item", |e| &e.item, |e| &mut e.item)
                .field("Amount", |e| &e.amount, |e| &mut e.amount)
                .field("Parameters", |e| &e.parameters, |e| &mut e.parameters)
                .field("Note", |e| &e.note, |e| &mut e.note)
                .build(),
        );
        registry
    }

    #[test]
    fn test_create_and_set_fields() {
        let registry = registry();
        let descriptor = registry.resolve("Purchase").unwrap();

        let mut event = registry.create("Purchase").unwrap();
        descriptor.set(event.as_mut(), "Item", &json!("sword")).unwrap();
        descriptor.set(event.as_mut(), "Amount", &json!("150")).unwrap();
        descriptor.set(event.as_mut(), "Note", &Value::Null).unwrap();

        let purchase = event.downcast_ref::<Purchase>().unwrap();
        assert_eq!(purchase.item, "sword");
        assert_eq!(purchase.amount, 150);
        assert_eq!(purchase.note, None);
    }

    #[test]
    fn test_type_mismatch() {
        let registry = registry();
        let descriptor = registry.resolve("Purchase").unwrap();
        let mut event = registry.create("Purchase").unwrap();

        let err = descriptor
            .set(event.as_mut(), "Amount", &json!({"nested": true}))
            .unwrap_err();
        assert!(matches!(err, FieldError::TypeMismatch { .. }));
    }

    #[test]
    fn test_read_nested_path() {
        let registry = registry();
        let event = Purchase {
            meta: EventMeta::from_sender("shop"),
            item: "potion".to_string(),
            amount: 3,
            parameters: json!({"amount": 120, "tags": ["a", "b"]}),
            note: None,
        };

        assert_eq!(registry.read_path(&event, "Item").unwrap(), json!("potion"));
        assert_eq!(
            registry.read_path(&event, "Parameters.amount").unwrap(),
            json!(120)
        );
        assert_eq!(
            registry.read_path(&event, "Parameters.tags.1").unwrap(),
            json!("b")
        );
        assert_eq!(registry.read_path(&event, "Sender").unwrap(), json!("shop"));
        // Case-insensitive fallback
        assert_eq!(registry.read_path(&event, "amount").unwrap(), json!(3));
    }

    #[test]
    fn test_read_missing_path() {
        let registry = registry();
        let event = Purchase::default();

        assert!(matches!(
            registry.read_path(&event, "Missing"),
            Err(FieldError::UnknownField { .. })
        ));
        assert!(matches!(
            registry.read_path(&event, "Parameters.amount"),
            Err(FieldError::UnknownField { .. })
        ));
        assert!(matches!(
            registry.read_path(&event, ""),
            Err(FieldError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_unknown_kind() {
        let registry = EventRegistry::new();
        assert!(registry.create("Nope").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_field_order() {
        let registry = registry();
        let descriptor = registry.resolve("Purchase").unwrap();
        let names: Vec<&str> = descriptor.field_names().collect();
        assert_eq!(names, vec!["Item", "Amount", "Parameters", "Note"]);
    }
}
