//! Demo event kinds, behaviours and routes.
//!
//! A clicker mod publishes `ButtonClicked` on a timer; the router turns each
//! click on the `broadcast` button into a `Broadcast`; an announcer mod
//! subscribes to `Broadcast` and logs it.

use modlink_bus::{impl_event, EventDescriptor, EventMeta, EventRegistry, SubscriptionId};
use modlink_plugin_api::{BehaviourRegistry, BehaviourResult, LogLevel, ModBehaviour, ModContext};
use modlink_router::{RouterConfig, RouterResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

pub const CLICKER_CLASS: &str = "ClickerBehaviour";
pub const ANNOUNCER_CLASS: &str = "AnnouncerBehaviour";

/// Routes wiring the demo kinds together.
pub const DEMO_ROUTES: &str = r#"{
  "routes": [
    {
      "name": "broadcast-on-click",
      "sourceEvent": "ButtonClicked",
      "conditions": [{ "property": "ButtonId", "operator": "==", "value": "broadcast" }],
      "actions": [
        { "targetEvent": "Broadcast", "parameters": { "Message": "Hello! (clicks: ${ClickCount})" } }
      ],
      "priority": 10
    }
  ],
  "settings": { "maxConcurrentActions": 4, "defaultTimeout": 5 }
}"#;

#[derive(Debug, Default, Clone)]
pub struct ButtonClicked {
    pub meta: EventMeta,
    pub button_id: String,
    pub click_count: i64,
}

impl_event!(ButtonClicked, "ButtonClicked");

#[derive(Debug, Default, Clone)]
pub struct Broadcast {
    pub meta: EventMeta,
    pub message: String,
}

impl_event!(Broadcast, "Broadcast");

pub fn register_demo_kinds(registry: &EventRegistry) {
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
}

pub fn register_demo_behaviours(registry: &BehaviourRegistry) {
    registry.register_default::<ClickerBehaviour>(CLICKER_CLASS);
    registry.register_default::<AnnouncerBehaviour>(ANNOUNCER_CLASS);
}

pub fn demo_router_config() -> RouterResult<RouterConfig> {
    RouterConfig::from_json_str(DEMO_ROUTES)
}

/// Clicks a button every `period` seconds of tick time.
///
/// Reads `button_id` and `period` from an optional `clicker` config resource.
#[derive(Debug)]
pub struct ClickerBehaviour {
    button_id: String,
    period: f64,
    elapsed: f64,
    clicks: i64,
}

impl Default for ClickerBehaviour {
    fn default() -> Self {
        Self {
            button_id: "broadcast".to_string(),
            period: 1.0,
            elapsed: 0.0,
            clicks: 0,
        }
    }
}

impl ModBehaviour for ClickerBehaviour {
    fn initialize(&mut self, ctx: &ModContext) -> BehaviourResult {
        if let Some(config) = ctx.resources().config("clicker") {
            if let Some(id) = config.get("button_id").and_then(|v| v.as_str()) {
                self.button_id = id.to_string();
            }
            if let Some(period) = config.get("period").and_then(|v| v.as_f64()) {
                if period <= 0.0 {
                    return Err(format!("clicker period must be positive, got {}", period).into());
                }
                self.period = period;
            }
        }
        ctx.log(
            LogLevel::Info,
            &format!("clicking '{}' every {}s", self.button_id, self.period),
        );
        Ok(())
    }

    fn on_tick(&mut self, ctx: &ModContext, dt: f64) -> BehaviourResult {
        self.elapsed += dt;
        while self.elapsed >= self.period {
            self.elapsed -= self.period;
            self.clicks += 1;
            ctx.publish(ButtonClicked {
                meta: EventMeta::default(),
                button_id: self.button_id.clone(),
                click_count: self.clicks,
            })?;
        }
        Ok(())
    }

    fn teardown(&mut self, ctx: &ModContext) -> BehaviourResult {
        ctx.log(LogLevel::Debug, &format!("clicked {} times", self.clicks));
        Ok(())
    }
}

/// Logs every `Broadcast`.
#[derive(Debug, Default)]
pub struct AnnouncerBehaviour {
    heard: Arc<AtomicU64>,
    subscription: Option<SubscriptionId>,
}

impl ModBehaviour for AnnouncerBehaviour {
    fn initialize(&mut self, ctx: &ModContext) -> BehaviourResult {
        let heard = Arc::clone(&self.heard);
        let mod_id = ctx.mod_id().to_string();
        let id = ctx.subscribe::<Broadcast, _>(move |event| {
            heard.fetch_add(1, Ordering::Relaxed);
            info!(mod_id = %mod_id, from = %event.meta.sender, "{}", event.message);
            Ok(())
        })?;
        self.subscription = Some(id);
        Ok(())
    }

    fn teardown(&mut self, ctx: &ModContext) -> BehaviourResult {
        if let Some(id) = self.subscription.take() {
            ctx.unsubscribe(id);
        }
        ctx.log(
            LogLevel::Debug,
            &format!("heard {} broadcasts", self.heard.load(Ordering::Relaxed)),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modlink_bus::Value;

    #[test]
    fn test_demo_kinds_registered() {
        let registry = EventRegistry::new();
        register_demo_kinds(&registry);
        assert_eq!(registry.kinds(), vec!["Broadcast", "ButtonClicked"]);

        let mut event = registry.create("ButtonClicked").unwrap();
        let descriptor = registry.resolve("ButtonClicked").unwrap();
        descriptor
            .set(event.as_mut(), "ClickCount", &Value::from(7))
            .unwrap();
        assert_eq!(descriptor.get(event.as_ref(), "ClickCount").unwrap(), Value::from(7));
    }

    #[test]
    fn test_demo_routes_parse() {
        let config = demo_router_config().unwrap();
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].source_event, "ButtonClicked");
        assert_eq!(config.settings.max_concurrent_actions, 4);
    }

    #[test]
    fn test_demo_behaviours_registered() {
        let registry = BehaviourRegistry::new();
        register_demo_behaviours(&registry);
        assert_eq!(registry.classes(), vec![ANNOUNCER_CLASS, CLICKER_CLASS]);
    }
}
