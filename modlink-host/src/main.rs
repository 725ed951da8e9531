//! # modlink-host
//!
//! Reference host for modlink.
//!
//! The host is responsible for:
//! - Reading the host configuration, the security policy and the router document
//! - Registering the event kinds and behaviour classes it supports
//! - Discovering, validating, loading and activating mod bundles
//! - Ticking active behaviours on an interval
//! - Unloading every mod cleanly on shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      modlink-host                         │
//! │                                                           │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐    │
//! │  │  Mod Loader  │  │ Comm. Router │  │  Correlator  │    │
//! │  │ (+ security) │  │   (routes)   │  │ (req / resp) │    │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘    │
//! │         └─────────────────┼─────────────────┘            │
//! │                  ┌────────▼────────┐                      │
//! │                  │    Event Bus    │                      │
//! │                  └─────────────────┘                      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration
//!
//! The host reads configuration from `$XDG_CONFIG_HOME/modlink/config.toml`,
//! creating a commented default on first run.
//!
//! ## Running
//!
//! ```bash
//! cargo run --bin modlink-host
//!
//! # With debug logging
//! RUST_LOG=debug cargo run --bin modlink-host
//! ```

use anyhow::Result;
use modlink_bus::EventRegistry;
use modlink_host::config::Config;
use modlink_host::demo;
use modlink_host::mods::{ManagerOptions, ModManager};
use modlink_plugin_api::{BehaviourRegistry, HostServices};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let config = match Config::load_default() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config, using defaults: {:#}", e);
            Config::default()
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.host.log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting modlink-host v{}", env!("CARGO_PKG_VERSION"));

    let paths = config.host_paths()?;
    let policy = config.load_policy(&paths.bundle_root)?;
    let router = if config.router.document.is_some() {
        config.load_router()?
    } else {
        info!("No router document configured, using demo routes");
        demo::demo_router_config()?
    };

    let kinds = Arc::new(EventRegistry::new());
    demo::register_demo_kinds(&kinds);
    let behaviours = Arc::new(BehaviourRegistry::new());
    demo::register_demo_behaviours(&behaviours);

    info!(
        "Registered {} event kind(s): {:?}",
        kinds.len(),
        kinds.kinds()
    );

    let mut manager = ModManager::new(ManagerOptions {
        policy,
        router,
        correlator: config.requests.correlator_config(),
        services: HostServices::new(Arc::new(paths)),
        kinds,
        behaviours,
    })?;

    match manager.discover_and_load() {
        Ok(summary) => info!(
            "Loaded {} mod(s), {} rejected",
            summary.loaded.len(),
            summary.failed.len()
        ),
        Err(e) => warn!("Mod discovery: {:#}", e),
    }

    let failed = manager.activate_all();
    if !failed.is_empty() {
        warn!("Failed to activate: {:?}", failed);
    }

    for m in manager.list_mods() {
        info!(
            "Mod: {} v{} ({}) - behaviours: {:?}, packaged: {}",
            m.name, m.version, m.state, m.behaviours, m.packaged
        );
    }

    manager.start_ticking(config.tick_interval());

    info!("Host startup complete");
    info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    manager.shutdown().await;

    info!("Host stopped");
    Ok(())
}
