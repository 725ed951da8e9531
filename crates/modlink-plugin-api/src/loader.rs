//! Bundle loader and mod table.
//!
//! The loader runs each bundle through the [`SecurityManager`] pipeline,
//! checks dependencies, builds the security context and resource table,
//! instantiates the declared behaviours and records the resulting
//! [`ModInstance`]. It also drives activation, ticking and unloading.
//!
//! No lock is held while behaviour code runs: callers clone the instance
//! handle out of the mod table first, and the instance checks its
//! behaviours out before invoking them. Behaviour code may therefore call
//! back into the loader, for example from an event handler.

use crate::behaviour::BehaviourRegistry;
use crate::context::ModContext;
use crate::error::{LoaderError, LoaderResult};
use crate::host::HostServices;
use crate::instance::{ModInstance, ModState, UnloadReport};
use crate::resources::ResourceTable;
use modlink_bus::{EventBus, RequestResponseManager};
use modlink_runtime::{
    discover_bundles, extract_package, is_package, BundleSource, DiscoveredBundle, ManifestFile,
    ModManifest, SecurityManager, ValidatedBundle, ValidationStage, Version,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Shared handle to a loaded mod.
pub type SharedInstance = Arc<ModInstance>;

/// A load attempt that did not produce a mod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFailure {
    pub path: PathBuf,
    /// Known once the manifest was read.
    pub mod_id: Option<String>,
    pub stage: Option<ValidationStage>,
    pub reason: String,
}

/// Outcome of loading a batch of bundles.
#[derive(Debug, Clone, Default)]
pub struct LoadSummary {
    pub loaded: Vec<String>,
    pub failed: Vec<LoadFailure>,
}

/// Information about a loaded mod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub state: ModState,
    pub behaviours: Vec<String>,
    pub packaged: bool,
}

#[derive(Default)]
struct ModTable {
    by_id: HashMap<String, SharedInstance>,
    /// Load order; activation follows it and unloading reverses it.
    order: Vec<String>,
}

impl ModTable {
    fn insert(&mut self, id: String, instance: SharedInstance) -> Option<SharedInstance> {
        let previous = self.by_id.insert(id.clone(), instance);
        self.order.retain(|o| o != &id);
        self.order.push(id);
        previous
    }

    fn remove(&mut self, id: &str) -> Option<SharedInstance> {
        self.order.retain(|o| o != id);
        self.by_id.remove(id)
    }

    fn ordered(&self) -> Vec<(String, SharedInstance)> {
        self.order
            .iter()
            .filter_map(|id| self.by_id.get(id).map(|i| (id.clone(), Arc::clone(i))))
            .collect()
    }
}

/// Loads, drives and unloads mods.
pub struct ModLoader {
    security: SecurityManager,
    behaviours: Arc<BehaviourRegistry>,
    bus: Arc<EventBus>,
    requests: Option<Arc<RequestResponseManager>>,
    services: HostServices,
    mods: RwLock<ModTable>,
    failures: Mutex<HashMap<PathBuf, LoadFailure>>,
}

impl ModLoader {
    pub fn new(
        security: SecurityManager,
        behaviours: Arc<BehaviourRegistry>,
        bus: Arc<EventBus>,
        services: HostServices,
    ) -> Self {
        Self {
            security,
            behaviours,
            bus,
            requests: None,
            services,
            mods: RwLock::new(ModTable::default()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Give mods access to request/response exchanges.
    pub fn with_requests(mut self, requests: Arc<RequestResponseManager>) -> Self {
        self.requests = Some(requests);
        self
    }

    pub fn security(&self) -> &SecurityManager {
        &self.security
    }

    pub fn services(&self) -> &HostServices {
        &self.services
    }

    /// Load one bundle directory or `.mlpkg` package.
    ///
    /// Loading an id that is already loaded replaces the old instance after
    /// the new one is fully built; the old instance is unloaded.
    pub fn load(&self, path: &Path) -> LoaderResult<String> {
        let mut mod_id = None;

        match self.try_load(path, &mut mod_id) {
            Ok(id) => {
                self.failures.lock().remove(path);
                Ok(id)
            }
            Err(e) => {
                error!(
                    path = %path.display(),
                    mod_id = mod_id.as_deref().unwrap_or("?"),
                    stage = e.stage().map(|s| s.as_str()).unwrap_or("load"),
                    error = %e,
                    "Failed to load mod"
                );
                self.failures.lock().insert(
                    path.to_path_buf(),
                    LoadFailure {
                        path: path.to_path_buf(),
                        mod_id,
                        stage: e.stage(),
                        reason: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    fn try_load(&self, path: &Path, mod_id: &mut Option<String>) -> LoaderResult<String> {
        // Nothing is read from a path outside the allowed roots.
        self.security.check_path(path)?;

        let (source, extracted) = if is_package(path) {
            let limits = self.security.policy().package_limits();
            let extracted = extract_package(path, Some(self.services.paths.temp_root()), &limits)?;
            let source = BundleSource::extracted(path, extracted.root());
            (source, Some(extracted))
        } else {
            (BundleSource::directory(path), None)
        };

        // Best effort, so a rejection can be attributed to its mod id.
        *mod_id = ManifestFile::locate(&source.root)
            .and_then(|file| file.parse())
            .ok()
            .map(|manifest| manifest.id);

        // A rejected package's extraction directory is removed when
        // `extracted` drops on the error path.
        let bundle = self.security.validate_bundle(&source)?;
        let id = bundle.manifest.id.clone();
        *mod_id = Some(id.clone());

        self.check_dependencies(&bundle.manifest)?;

        let security = self.security.create_context(&bundle.manifest);
        let resources = ResourceTable::collect(
            &id,
            &bundle.root,
            &bundle.manifest.resources,
            security.limits().max_file_size_bytes(),
        )?;

        let context = Arc::new(ModContext::new(
            security,
            Arc::clone(&self.bus),
            self.requests.clone(),
            self.services.clone(),
            Arc::new(resources),
        ));

        let instance = ModInstance::begin(
            bundle.manifest.clone(),
            bundle.origin.clone(),
            bundle.root.clone(),
            context,
            extracted,
        );

        if let Err(e) = self.instantiate(&instance, &bundle) {
            if instance.fail().is_ok() {
                if let Err(cleanup) = instance.unload() {
                    debug!(mod_id = %id, error = %cleanup, "Cleanup after failed load");
                }
            }
            return Err(e);
        }

        let previous = self.mods.write().insert(id.clone(), Arc::new(instance));
        if let Some(previous) = previous {
            warn!(mod_id = %id, "Mod was already loaded; replacing the previous instance");
            match previous.unload() {
                Ok(report) => log_unload(&report),
                Err(e) => warn!(mod_id = %id, error = %e, "Previous instance did not unload cleanly"),
            }
        }

        info!(
            mod_id = %id,
            version = %bundle.manifest.version,
            behaviours = bundle.manifest.behaviour_classes().len(),
            "Mod loaded"
        );
        Ok(id)
    }

    /// Build every declared behaviour. Leaves the instance `Loaded`.
    fn instantiate(&self, instance: &ModInstance, bundle: &ValidatedBundle) -> LoaderResult<()> {
        let manifest = &bundle.manifest;

        for class in manifest.behaviour_classes() {
            let declared = bundle
                .modules
                .iter()
                .filter_map(|m| m.module.find_type(class))
                .any(|t| t.is_behaviour());
            if !declared {
                return Err(LoaderError::ClassNotDeclared {
                    mod_id: manifest.id.clone(),
                    class: class.to_string(),
                });
            }

            let behaviour = self
                .behaviours
                .create(class)
                .ok_or_else(|| LoaderError::NoFactory {
                    mod_id: manifest.id.clone(),
                    class: class.to_string(),
                })?;
            instance.attach(class, behaviour)?;
            debug!(mod_id = %manifest.id, class, "Instantiated behaviour");
        }

        instance.finish_loading()
    }

    fn check_dependencies(&self, manifest: &ModManifest) -> LoaderResult<()> {
        for dep in &manifest.dependencies {
            let required: Version = dep.version.parse()?;
            let loaded = self.get(&dep.id);

            let problem = match loaded {
                None => Some("not loaded".to_string()),
                Some(instance) => {
                    let found = instance.manifest().parsed_version()?;
                    if found.satisfies(&required) {
                        None
                    } else {
                        Some(format!("found {}", found))
                    }
                }
            };

            match problem {
                None => {}
                Some(reason) if dep.optional => {
                    warn!(mod_id = %manifest.id, dependency = %dep.id, reason = %reason, "Optional dependency unavailable");
                }
                Some(reason) => {
                    return Err(LoaderError::MissingDependency {
                        mod_id: manifest.id.clone(),
                        dependency: dep.id.clone(),
                        version: dep.version.clone(),
                        reason,
                    });
                }
            }
        }
        Ok(())
    }

    /// Load discovered bundles, deferring bundles whose required
    /// dependencies are still waiting to be loaded in the same batch.
    pub fn load_all(&self, bundles: &[DiscoveredBundle]) -> LoadSummary {
        let mut summary = LoadSummary::default();
        let mut pending: Vec<&DiscoveredBundle> = bundles.iter().collect();

        loop {
            let waiting: HashSet<&str> = pending.iter().map(|b| b.id()).collect();
            let (ready, deferred): (Vec<_>, Vec<_>) = pending.into_iter().partition(|b| {
                !b.manifest
                    .dependencies
                    .iter()
                    .any(|d| !d.optional && waiting.contains(d.id.as_str()) && !self.is_loaded(&d.id))
            });

            if ready.is_empty() {
                // Nothing can make progress: load the rest so they report why.
                self.load_batch(&deferred, &mut summary);
                break;
            }

            self.load_batch(&ready, &mut summary);
            if deferred.is_empty() {
                break;
            }
            pending = deferred;
        }

        info!(
            loaded = summary.loaded.len(),
            failed = summary.failed.len(),
            "Finished loading mods"
        );
        summary
    }

    fn load_batch(&self, batch: &[&DiscoveredBundle], summary: &mut LoadSummary) {
        for bundle in batch {
            match self.load(&bundle.path) {
                Ok(id) => summary.loaded.push(id),
                Err(_) => {
                    if let Some(failure) = self.failures.lock().get(&bundle.path) {
                        summary.failed.push(failure.clone());
                    }
                }
            }
        }
    }

    /// Discover bundles under the bundle root and load them.
    pub fn discover_and_load(&self) -> LoaderResult<LoadSummary> {
        let root = self.services.paths.bundle_root().to_path_buf();
        let bundles = discover_bundles(&[root])?;
        Ok(self.load_all(&bundles))
    }

    pub fn activate(&self, id: &str) -> LoaderResult<()> {
        self.require(id)?.activate()
    }

    /// Activate every `Loaded` mod in load order. Returns the ids that
    /// failed to activate.
    pub fn activate_all(&self) -> Vec<String> {
        let mut failed = Vec::new();
        for (id, instance) in self.snapshot() {
            if instance.state() != ModState::Loaded {
                continue;
            }
            if let Err(e) = instance.activate() {
                warn!(mod_id = %id, error = %e, "Activation failed");
                failed.push(id);
            }
        }
        failed
    }

    pub fn pause(&self, id: &str) -> LoaderResult<()> {
        self.require(id)?.pause()
    }

    pub fn resume(&self, id: &str) -> LoaderResult<()> {
        self.require(id)?.resume()
    }

    /// Tick every active mod. Returns the number of failed behaviour ticks.
    pub fn tick_all(&self, dt: f64) -> usize {
        self.snapshot()
            .into_iter()
            .map(|(_, instance)| instance.tick(dt))
            .sum()
    }

    /// Unload a mod and remove its record.
    pub fn unload(&self, id: &str) -> LoaderResult<UnloadReport> {
        let instance = self
            .mods
            .write()
            .remove(id)
            .ok_or_else(|| LoaderError::NotLoaded(id.to_string()))?;

        let report = instance.unload()?;
        log_unload(&report);
        Ok(report)
    }

    /// Unload every mod in reverse load order.
    pub fn unload_all(&self) -> Vec<UnloadReport> {
        let mut ids: Vec<String> = self.mods.read().order.clone();
        ids.reverse();

        ids.iter()
            .filter_map(|id| match self.unload(id) {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(mod_id = %id, error = %e, "Unload failed");
                    None
                }
            })
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<SharedInstance> {
        self.mods.read().by_id.get(id).cloned()
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.mods.read().by_id.contains_key(id)
    }

    /// Lifecycle state of `id`: the instance state if loaded, `Error` if the
    /// last attempt for that id failed, else `NotLoaded`.
    pub fn state_of(&self, id: &str) -> ModState {
        if let Some(instance) = self.get(id) {
            return instance.state();
        }
        let failed = self
            .failures
            .lock()
            .values()
            .any(|f| f.mod_id.as_deref() == Some(id));
        if failed {
            ModState::Error
        } else {
            ModState::NotLoaded
        }
    }

    /// Loaded mod ids in load order.
    pub fn mod_ids(&self) -> Vec<String> {
        self.mods.read().order.clone()
    }

    pub fn len(&self) -> usize {
        self.mods.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn failures(&self) -> Vec<LoadFailure> {
        self.failures.lock().values().cloned().collect()
    }

    pub fn list(&self) -> Vec<ModInfo> {
        self.snapshot()
            .into_iter()
            .map(|(id, instance)| ModInfo {
                id,
                name: instance.manifest().name.clone(),
                version: instance.manifest().version.clone(),
                state: instance.state(),
                behaviours: instance.behaviour_classes(),
                packaged: instance.is_packaged(),
            })
            .collect()
    }

    fn require(&self, id: &str) -> LoaderResult<SharedInstance> {
        self.get(id).ok_or_else(|| LoaderError::NotLoaded(id.to_string()))
    }

    fn snapshot(&self) -> Vec<(String, SharedInstance)> {
        self.mods.read().ordered()
    }
}

fn log_unload(report: &UnloadReport) {
    if report.failures.is_empty() {
        info!(
            mod_id = %report.mod_id,
            behaviours = report.torn_down,
            subscriptions = report.subscriptions_removed,
            objects = report.objects_destroyed,
            "Mod unloaded"
        );
    } else {
        warn!(
            mod_id = %report.mod_id,
            behaviours = report.torn_down,
            failed = report.failures.len(),
            "Mod unloaded with teardown failures"
        );
    }
}

impl std::fmt::Debug for ModLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModLoader")
            .field("mods", &self.mod_ids())
            .field("failures", &self.failures.lock().len())
            .finish()
    }
}
