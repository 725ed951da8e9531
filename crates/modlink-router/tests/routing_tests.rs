//! Integration tests for the communication router.
//!
//! These tests drive the router through the bus, the way mods use it:
//! - Priority ordering of condition evaluation
//! - Numeric conditions and placeholder substitution
//! - Limiter bound under a burst of triggering events

use modlink_bus::{impl_event, EventBus, EventDescriptor, EventMeta, EventRegistry, Value};
use modlink_router::{CommunicationRouter, RouterConfig};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ============================================================================
// Test Events
// ============================================================================

#[derive(Debug, Default)]
struct Purchase {
    meta: EventMeta,
    item: String,
    parameters: Value,
}
impl_event!(Purchase, "Purchase");

#[derive(Debug, Default)]
struct Receipt {
    meta: EventMeta,
    item: String,
    amount: f64,
}
impl_event!(Receipt, "Receipt");

#[derive(Debug, Default)]
struct ButtonClicked {
    meta: EventMeta,
    button_id: String,
    click_count: i64,
}
impl_event!(ButtonClicked, "ButtonClicked");

#[derive(Debug, Default)]
struct Broadcast {
    meta: EventMeta,
    message: String,
}
impl_event!(Broadcast, "Broadcast");

fn registry() -> Arc<EventRegistry> {
    let registry = EventRegistry::new();
    registry.register(
        EventDescriptor::builder::<Purchase>()
            .field("Item", |e| &e.item, |e| &mut e.item)
            .field("Parameters", |e| &e.parameters, |e| &mut e.parameters)
            .build(),
    );
    registry.register(
        EventDescriptor::builder::<Receipt>()
            .field("Item", |e| &e.item, |e| &mut e.item)
            .field("Amount", |e| &e.amount, |e| &mut e.amount)
            .build(),
    );
    registry.register(
        EventDescriptor::builder::<ButtonClicked>()
            .field("ButtonId", |e| &e.button_id, |e| &mut e.button_id)
            .field("ClickCount", |e| &e.click_count, |e| &mut e.click_count)
            .build(),
    );
    registry.register(
        EventDescriptor::builder::<Broadcast>()
            .field("Message", |e| &e.message, |e| &mut e.message)
            .build(),
    );
    Arc::new(registry)
}

fn purchase(item: &str, amount: f64) -> Purchase {
    Purchase {
        meta: EventMeta::from_sender("shop"),
        item: item.to_string(),
        parameters: json!({ "amount": amount }),
    }
}

fn collect<E, T>(bus: &EventBus, map: fn(&E) -> T) -> (Arc<Mutex<Vec<T>>>, modlink_bus::OwnerToken)
where
    E: modlink_bus::TypedEvent,
    T: Send + 'static,
{
    let seen = Arc::new(Mutex::new(Vec::new()));
    let owner = bus.owner("collector");
    let sink = Arc::clone(&seen);
    bus.subscribe::<E, _>(&owner, move |e| {
        sink.lock().push(map(e));
        Ok(())
    });
    (seen, owner)
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_threshold_condition() {
    let bus = Arc::new(EventBus::new());
    let config = RouterConfig::from_json_str(
        r#"{ "routes": [ {
            "name": "big-purchase",
            "sourceEvent": "Purchase",
            "conditions": [ { "property": "Parameters.amount", "operator": ">", "value": 100 } ],
            "actions": [ { "targetEvent": "Receipt",
                           "parameters": { "Item": "${Item}", "Amount": "${Parameters.amount}" } } ]
        } ] }"#,
    )
    .unwrap();
    let router = CommunicationRouter::new(&config, Arc::clone(&bus), registry()).unwrap();
    let (receipts, _owner) = collect::<Receipt, (String, f64)>(&bus, |r| (r.item.clone(), r.amount));

    bus.publish(purchase("pebble", 50.0));
    router.wait_idle().await;
    assert!(receipts.lock().is_empty());

    bus.publish(purchase("boulder", 150.0));
    router.wait_idle().await;
    assert_eq!(*receipts.lock(), vec![("boulder".to_string(), 150.0)]);
}

#[tokio::test]
async fn test_higher_priority_route_evaluated_first() {
    let bus = Arc::new(EventBus::new());
    let config = RouterConfig::from_json_str(
        r#"{ "routes": [
            { "name": "five", "sourceEvent": "Purchase", "priority": 5 },
            { "name": "ten", "sourceEvent": "Purchase", "priority": 10 }
        ] }"#,
    )
    .unwrap();
    let router = CommunicationRouter::new(&config, Arc::clone(&bus), registry()).unwrap();

    let outcome = router.route_event(Arc::new(purchase("x", 1.0))).await;
    assert_eq!(outcome.matched, vec!["ten", "five"]);
    assert_eq!(outcome.routes_evaluated, 2);
}

#[tokio::test]
async fn test_placeholder_copies_source_field() {
    let bus = Arc::new(EventBus::new());
    let config = RouterConfig::from_json_str(
        r#"{ "routes": [ {
            "name": "echo-id",
            "sourceEvent": "ButtonClicked",
            "actions": [ { "targetEvent": "Broadcast", "parameters": { "Message": "${ButtonId}" } } ]
        } ] }"#,
    )
    .unwrap();
    let router = CommunicationRouter::new(&config, Arc::clone(&bus), registry()).unwrap();
    let (messages, _owner) = collect::<Broadcast, String>(&bus, |b| b.message.clone());

    bus.publish(ButtonClicked {
        meta: EventMeta::from_sender("ui"),
        button_id: "start".to_string(),
        click_count: 1,
    });
    router.wait_idle().await;

    assert_eq!(*messages.lock(), vec!["start".to_string()]);
}

#[tokio::test]
async fn test_actions_of_one_event_all_complete() {
    let bus = Arc::new(EventBus::new());
    let config = RouterConfig::from_json_str(
        r#"{ "routes": [
            { "name": "a", "sourceEvent": "ButtonClicked",
              "actions": [ { "targetEvent": "Broadcast", "parameters": { "Message": "one" }, "delay": 0.02 },
                           { "targetEvent": "Broadcast", "parameters": { "Message": "two" } } ] },
            { "name": "b", "sourceEvent": "ButtonClicked",
              "actions": [ { "targetEvent": "Broadcast", "parameters": { "Message": "three", "Bogus": 1 } } ] }
        ] }"#,
    )
    .unwrap();
    let router = CommunicationRouter::new(&config, Arc::clone(&bus), registry()).unwrap();
    let (messages, _owner) = collect::<Broadcast, String>(&bus, |b| b.message.clone());

    let outcome = router.route_event(Arc::new(ButtonClicked::default())).await;
    assert_eq!(outcome.routes_matched, 2);
    assert_eq!(outcome.actions_published, 3);

    let mut got = messages.lock().clone();
    got.sort();
    assert_eq!(got, vec!["one", "three", "two"]);
}

// ============================================================================
// Limiter
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_burst_never_exceeds_limiter() {
    let bus = Arc::new(EventBus::new());
    let config = RouterConfig::from_json_str(
        r#"{
            "routes": [ {
                "name": "broadcast",
                "sourceEvent": "ButtonClicked",
                "conditions": [ { "property": "ButtonId", "operator": "==", "value": "broadcast" } ],
                "actions": [ { "targetEvent": "Broadcast",
                               "parameters": { "Message": "Hello! (clicks: ${ClickCount})" },
                               "delay": 0.001 } ]
            } ],
            "settings": { "maxConcurrentActions": 4 }
        }"#,
    )
    .unwrap();
    let router = CommunicationRouter::new(&config, Arc::clone(&bus), registry()).unwrap();

    let received = Arc::new(AtomicUsize::new(0));
    let owner = bus.owner("listener");
    {
        let received = Arc::clone(&received);
        bus.subscribe::<Broadcast, _>(&owner, move |b| {
            assert!(b.message.starts_with("Hello! (clicks: "));
            received.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }

    for i in 0..1000 {
        bus.publish(ButtonClicked {
            meta: EventMeta::from_sender("ui"),
            button_id: "broadcast".to_string(),
            click_count: i,
        });
    }
    router.wait_idle().await;

    let stats = router.stats();
    assert_eq!(received.load(Ordering::SeqCst), 1000);
    assert_eq!(stats.actions_published, 1000);
    assert!(stats.peak_actions >= 1);
    assert!(stats.peak_actions <= 4, "peak was {}", stats.peak_actions);
    assert_eq!(stats.active_actions, 0);
}
