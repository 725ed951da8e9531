//! Integration tests for modlink-host.
//!
//! These tests drive a complete host from bundles on disk:
//! - Clicker mod → router → announcer mod
//! - Router concurrency cap under a burst of clicks
//! - Background tick loop and shutdown ordering
//! - Rejected bundles reported by discovery

use modlink_bus::{EventBus, EventMeta, EventRegistry, OwnerToken};
use modlink_host::config::Config;
use modlink_host::demo::{self, Broadcast, ButtonClicked, ANNOUNCER_CLASS, CLICKER_CLASS};
use modlink_host::mods::{ManagerOptions, ModManager};
use modlink_plugin_api::{BehaviourRegistry, DefaultPaths, HostServices, ModState};
use modlink_runtime::ValidationStage;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

fn write_bundle(mods: &Path, id: &str, class: &str, permissions: &[&str], clicker_period: Option<f64>) {
    let dir = mods.join(id);
    std::fs::create_dir_all(dir.join("code")).unwrap();

    let permissions: Vec<String> = permissions.iter().map(|p| format!("\"{}\"", p)).collect();
    let mut manifest = format!(
        "id = \"{id}\"\nname = \"{id}\"\nversion = \"1.0.0\"\nentry_class = \"{class}\"\npermissions = [{}]\n",
        permissions.join(", ")
    );
    if let Some(period) = clicker_period {
        std::fs::create_dir_all(dir.join("config")).unwrap();
        std::fs::write(
            dir.join("config/clicker.toml"),
            format!("button_id = \"broadcast\"\nperiod = {:?}\n", period),
        )
        .unwrap();
        manifest.push_str("\n[resources]\nconfigs = [\"config/clicker.toml\"]\n");
    }
    std::fs::write(dir.join("manifest.toml"), manifest).unwrap();

    let module = serde_json::json!({
        "version": 1,
        "name": "main",
        "types": [{ "name": class, "base_type": "ModBehaviour" }],
    });
    std::fs::write(dir.join("code/main.mlm"), module.to_string()).unwrap();
}

/// Collects every `Broadcast` message seen on the bus while alive.
struct Recorder {
    _owner: OwnerToken,
    seen: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn messages(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

fn record_broadcasts(bus: &EventBus) -> Recorder {
    let owner = bus.owner("test-recorder");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe::<Broadcast, _>(&owner, move |event| {
        sink.lock().push(event.message.clone());
        Ok(())
    });
    Recorder { _owner: owner, seen }
}

struct Host {
    _temp: TempDir,
    manager: ModManager,
}

fn host(setup: impl FnOnce(&Path)) -> Host {
    let temp = TempDir::new().unwrap();
    let paths = DefaultPaths::under(temp.path());
    std::fs::create_dir_all(&paths.bundle_root).unwrap();
    setup(&paths.bundle_root);

    let kinds = Arc::new(EventRegistry::new());
    demo::register_demo_kinds(&kinds);
    let behaviours = Arc::new(BehaviourRegistry::new());
    demo::register_demo_behaviours(&behaviours);

    let config = Config::default();
    let manager = ModManager::new(ManagerOptions {
        policy: config.load_policy(&paths.bundle_root).unwrap(),
        router: demo::demo_router_config().unwrap(),
        correlator: config.requests.correlator_config(),
        services: HostServices::new(Arc::new(paths)),
        kinds,
        behaviours,
    })
    .unwrap();

    Host {
        _temp: temp,
        manager,
    }
}

fn demo_bundles(mods: &Path) {
    write_bundle(mods, "announcer", ANNOUNCER_CLASS, &["events.subscribe"], None);
    write_bundle(mods, "clicker", CLICKER_CLASS, &["events.publish"], None);
}

// ============================================================================
// End-to-End Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_click_is_routed_to_broadcast() {
    let mut host = host(demo_bundles);
    let manager = &mut host.manager;

    let summary = manager.discover_and_load().unwrap();
    assert_eq!(summary.loaded, vec!["announcer", "clicker"]);
    assert!(summary.failed.is_empty());
    assert!(manager.activate_all().is_empty());

    let seen = record_broadcasts(manager.bus());

    // One full period of tick time produces exactly one click.
    assert_eq!(manager.tick(1.0), 0);
    manager.router().wait_idle().await;

    assert_eq!(seen.messages(), vec!["Hello! (clicks: 1)".to_string()]);
    assert_eq!(manager.bus().subscription_count("Broadcast"), 2);

    let reports = manager.shutdown().await;
    let order: Vec<&str> = reports.iter().map(|r| r.mod_id.as_str()).collect();
    assert_eq!(order, vec!["clicker", "announcer"]);
    assert_eq!(manager.bus().subscription_count("Broadcast"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_burst_respects_concurrency_cap() {
    let host = host(|_| {});
    let manager = &host.manager;
    let seen = record_broadcasts(manager.bus());

    for i in 0..1000 {
        manager.bus().publish(ButtonClicked {
            meta: EventMeta::from_sender("burst"),
            button_id: "broadcast".to_string(),
            click_count: i,
        });
    }
    for _ in 0..10 {
        manager.bus().publish(ButtonClicked {
            meta: EventMeta::from_sender("burst"),
            button_id: "other".to_string(),
            click_count: 0,
        });
    }
    manager.router().wait_idle().await;

    assert_eq!(seen.messages().len(), 1000);
    let stats = manager.router().stats();
    assert_eq!(stats.events_routed, 1010);
    assert_eq!(stats.actions_published, 1000);
    assert_eq!(stats.actions_failed, 0);
    assert!(stats.peak_actions <= 4, "peak was {}", stats.peak_actions);
    assert_eq!(stats.active_actions, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tick_loop_drives_clicker() {
    let mut host = host(|mods| {
        write_bundle(mods, "announcer", ANNOUNCER_CLASS, &["events.subscribe"], None);
        write_bundle(mods, "clicker", CLICKER_CLASS, &["events.publish"], Some(0.05));
    });
    let manager = &mut host.manager;
    manager.discover_and_load().unwrap();
    assert!(manager.activate_all().is_empty());
    let seen = record_broadcasts(manager.bus());

    manager.start_ticking(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(400)).await;
    manager.shutdown().await;

    let seen = seen.messages();
    assert!(!seen.is_empty());
    assert_eq!(seen[0], "Hello! (clicks: 1)");
    assert!(manager.loader().is_empty());
}

#[tokio::test]
async fn test_rejected_bundle_is_reported() {
    let host = host(|mods| {
        demo_bundles(mods);
        write_bundle(mods, "greedy", CLICKER_CLASS, &["files.write"], None);
    });
    let manager = &host.manager;

    let summary = manager.discover_and_load().unwrap();
    assert_eq!(summary.loaded, vec!["announcer", "clicker"]);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].mod_id.as_deref(), Some("greedy"));
    assert_eq!(summary.failed[0].stage, Some(ValidationStage::Permissions));
    assert_eq!(manager.loader().state_of("greedy"), ModState::Error);
}

#[tokio::test]
async fn test_unknown_behaviour_class_fails_load() {
    let host = host(|mods| {
        write_bundle(mods, "mystery", "MysteryBehaviour", &[], None);
    });
    let manager = &host.manager;

    let summary = manager.discover_and_load().unwrap();
    assert!(summary.loaded.is_empty());
    assert_eq!(summary.failed.len(), 1);
    assert!(manager.list_mods().is_empty());
}
