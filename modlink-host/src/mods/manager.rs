//! Mod manager owning the bus, router and loader of one host.

use anyhow::{Context, Result};
use modlink_bus::{CorrelatorConfig, EventBus, EventRegistry, RequestResponseManager};
use modlink_plugin_api::{
    BehaviourRegistry, HostServices, LoadSummary, ModInfo, ModLoader, UnloadReport,
};
use modlink_router::{CommunicationRouter, RouterConfig};
use modlink_runtime::{SecurityManager, SecurityPolicy};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Everything a [`ModManager`] is built from.
///
/// `kinds` and `behaviours` must be populated before construction: the
/// router resolves its source and target kinds once, when it is built.
pub struct ManagerOptions {
    pub policy: SecurityPolicy,
    pub router: RouterConfig,
    pub correlator: CorrelatorConfig,
    pub services: HostServices,
    pub kinds: Arc<EventRegistry>,
    pub behaviours: Arc<BehaviourRegistry>,
}

/// Owns the communication stack and the loaded mods.
///
/// Must be created inside a tokio runtime.
pub struct ModManager {
    bus: Arc<EventBus>,
    kinds: Arc<EventRegistry>,
    requests: Arc<RequestResponseManager>,
    router: CommunicationRouter,
    behaviours: Arc<BehaviourRegistry>,
    loader: Arc<ModLoader>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl ModManager {
    pub fn new(options: ManagerOptions) -> Result<Self> {
        let bus = Arc::new(EventBus::new());
        bus.set_diagnostic_listener(|event| {
            tracing::trace!(
                kind = event.kind(),
                sender = %event.meta().sender,
                "Event published"
            );
        });

        let requests = Arc::new(RequestResponseManager::with_config(
            Arc::clone(&bus),
            options.correlator,
        ));

        let router = CommunicationRouter::new(
            &options.router,
            Arc::clone(&bus),
            Arc::clone(&options.kinds),
        )
        .context("Failed to build communication router")?;

        let security =
            SecurityManager::new(options.policy).context("Failed to initialize security manager")?;

        let loader = ModLoader::new(
            security,
            Arc::clone(&options.behaviours),
            Arc::clone(&bus),
            options.services,
        )
        .with_requests(Arc::clone(&requests));

        info!(
            kinds = options.kinds.len(),
            behaviours = options.behaviours.len(),
            routes = options.router.routes.len(),
            "Mod manager ready"
        );

        Ok(Self {
            bus,
            kinds: options.kinds,
            requests,
            router,
            behaviours: options.behaviours,
            loader: Arc::new(loader),
            shutdown_tx: None,
            ticker: None,
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn kinds(&self) -> &Arc<EventRegistry> {
        &self.kinds
    }

    pub fn requests(&self) -> &Arc<RequestResponseManager> {
        &self.requests
    }

    pub fn router(&self) -> &CommunicationRouter {
        &self.router
    }

    pub fn behaviours(&self) -> &Arc<BehaviourRegistry> {
        &self.behaviours
    }

    pub fn loader(&self) -> &Arc<ModLoader> {
        &self.loader
    }

    /// Discover and load every bundle under the bundle root.
    ///
    /// The bundle root is created if missing.
    pub fn discover_and_load(&self) -> Result<LoadSummary> {
        let root = self.loader.services().paths.bundle_root().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create bundle root: {}", root.display()))?;

        info!("Discovering mods in {}", root.display());
        let summary = self
            .loader
            .discover_and_load()
            .context("Bundle discovery failed")?;

        for failure in &summary.failed {
            warn!(
                path = %failure.path.display(),
                mod_id = failure.mod_id.as_deref().unwrap_or("?"),
                stage = failure.stage.map(|s| s.as_str()).unwrap_or("load"),
                "Mod rejected: {}",
                failure.reason
            );
        }
        Ok(summary)
    }

    /// Load a single bundle directory or package.
    pub fn load(&self, path: &Path) -> Result<String> {
        self.loader
            .load(path)
            .with_context(|| format!("Failed to load mod from {}", path.display()))
    }

    /// Activate every loaded mod; returns the ids that failed.
    pub fn activate_all(&self) -> Vec<String> {
        self.loader.activate_all()
    }

    /// Tick every active mod once.
    pub fn tick(&self, dt: f64) -> usize {
        self.loader.tick_all(dt)
    }

    pub fn list_mods(&self) -> Vec<ModInfo> {
        self.loader.list()
    }

    /// Start the background tick loop.
    ///
    /// Each tick passes the measured seconds since the previous one.
    pub fn start_ticking(&mut self, period: Duration) {
        if self.ticker.is_some() {
            warn!("Tick loop already running");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let loader = Arc::clone(&self.loader);

        let handle = tokio::spawn(async move {
            let mut ticks = interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last = Instant::now();

            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        let now = Instant::now();
                        let dt = now.duration_since(last).as_secs_f64();
                        last = now;
                        let failed = loader.tick_all(dt);
                        if failed > 0 {
                            debug!(failed, "Behaviour ticks failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Tick loop received shutdown signal");
                        break;
                    }
                }
            }
        });

        info!(period_ms = period.as_millis() as u64, "Tick loop started");
        self.shutdown_tx = Some(shutdown_tx);
        self.ticker = Some(handle);
    }

    /// Stop ticking, unload every mod in reverse load order, drain routing
    /// and fail outstanding requests.
    pub async fn shutdown(&mut self) -> Vec<UnloadReport> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            drop(shutdown_tx);
        }
        if let Some(handle) = self.ticker.take() {
            if let Err(e) = handle.await {
                warn!("Tick loop ended abnormally: {}", e);
            }
        }

        let reports = self.loader.unload_all();
        self.router.wait_idle().await;
        self.requests.dispose();

        let stats = self.bus.stats();
        info!(
            unloaded = reports.len(),
            published = stats.published,
            delivered = stats.delivered,
            "Mod manager shut down"
        );
        reports
    }
}
