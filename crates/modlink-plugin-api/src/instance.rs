//! Loaded mod instances and their lifecycle.
//!
//! ```text
//!  NotLoaded ─► Loading ─► Loaded ─► Active ⇄ Paused
//!                 │          │         │        │
//!                 └─► Error ◄┘         └─► Unloading ◄┘
//! ```
//!
//! `Error` is terminal for an instance; a fresh load attempt builds a new
//! one. `Unloading` can be entered from `Loaded`, `Active`, `Paused` and
//! `Error`.

use crate::behaviour::ModBehaviour;
use crate::context::ModContext;
use crate::error::{BehaviourError, BehaviourResult, LoaderError, LoaderResult};
use modlink_runtime::{ExtractedPackage, ModManifest};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a mod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModState {
    NotLoaded,
    Loading,
    Loaded,
    Active,
    Paused,
    Unloading,
    Error,
}

impl ModState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModState::NotLoaded => "not_loaded",
            ModState::Loading => "loading",
            ModState::Loaded => "loaded",
            ModState::Active => "active",
            ModState::Paused => "paused",
            ModState::Unloading => "unloading",
            ModState::Error => "error",
        }
    }

    /// Whether `self -> to` is an edge of the lifecycle graph.
    pub fn can_transition(self, to: ModState) -> bool {
        use ModState::*;
        matches!(
            (self, to),
            (NotLoaded, Loading)
                | (Loading, Loaded)
                | (Loading, Error)
                | (Loaded, Active)
                | (Loaded, Error)
                | (Active, Paused)
                | (Paused, Active)
                | (Loaded | Active | Paused | Error, Unloading)
        )
    }
}

impl fmt::Display for ModState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A behaviour together with the class name it was built from.
pub struct BehaviourSlot {
    pub class: String,
    pub behaviour: Box<dyn ModBehaviour>,
}

/// Where a mod's behaviours currently are.
///
/// Hooks check the behaviours out, run with no lock held and check them
/// back in, so behaviour code may call back into the loader.
enum Slots {
    Ready(Vec<BehaviourSlot>),
    /// Checked out by a running hook.
    InUse,
    /// The mod was unloaded; behaviours checked in now are torn down.
    Released,
}

/// Result of unloading one mod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnloadReport {
    pub mod_id: String,
    /// Behaviours whose teardown ran.
    pub torn_down: usize,
    /// `(class, error)` for every teardown that failed.
    pub failures: Vec<(String, String)>,
    pub subscriptions_removed: usize,
    pub objects_destroyed: usize,
    /// Whether an extracted package directory was deleted.
    pub temp_removed: bool,
}

/// Runtime record of one loaded mod.
///
/// Shared between the loader and the tick loop; every method takes `&self`.
pub struct ModInstance {
    manifest: ModManifest,
    origin: PathBuf,
    root: PathBuf,
    state: Mutex<ModState>,
    classes: RwLock<Vec<String>>,
    behaviours: Mutex<Slots>,
    context: Arc<ModContext>,
    extracted: Mutex<Option<ExtractedPackage>>,
}

impl ModInstance {
    /// Start a load: the instance enters `Loading` with no behaviours.
    pub fn begin(
        manifest: ModManifest,
        origin: PathBuf,
        root: PathBuf,
        context: Arc<ModContext>,
        extracted: Option<ExtractedPackage>,
    ) -> Self {
        let instance = Self {
            manifest,
            origin,
            root,
            state: Mutex::new(ModState::Loading),
            classes: RwLock::new(Vec::new()),
            behaviours: Mutex::new(Slots::Ready(Vec::new())),
            context,
            extracted: Mutex::new(extracted),
        };
        debug!(mod_id = %instance.id(), "Loading");
        instance
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn manifest(&self) -> &ModManifest {
        &self.manifest
    }

    pub fn state(&self) -> ModState {
        *self.state.lock()
    }

    /// Bundle directory or package file the mod was loaded from.
    pub fn origin(&self) -> &Path {
        &self.origin
    }

    /// Directory holding the bundle's files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn context(&self) -> &Arc<ModContext> {
        &self.context
    }

    pub fn is_packaged(&self) -> bool {
        self.extracted.lock().is_some()
    }

    pub fn behaviour_classes(&self) -> Vec<String> {
        self.classes.read().clone()
    }

    pub fn behaviour_count(&self) -> usize {
        self.classes.read().len()
    }

    fn transition(&self, to: ModState) -> LoaderResult<()> {
        let mut state = self.state.lock();
        if !state.can_transition(to) {
            return Err(LoaderError::InvalidTransition {
                mod_id: self.id().to_string(),
                from: *state,
                to,
            });
        }
        debug!(mod_id = %self.id(), from = %*state, to = %to, "State change");
        *state = to;
        Ok(())
    }

    /// Add an instantiated behaviour. Only valid while `Loading`.
    pub fn attach(&self, class: impl Into<String>, behaviour: Box<dyn ModBehaviour>) -> LoaderResult<()> {
        let state = self.state();
        if state != ModState::Loading {
            return Err(LoaderError::InvalidTransition {
                mod_id: self.id().to_string(),
                from: state,
                to: ModState::Loading,
            });
        }

        let class = class.into();
        match &mut *self.behaviours.lock() {
            Slots::Ready(slots) => slots.push(BehaviourSlot {
                class: class.clone(),
                behaviour,
            }),
            Slots::InUse | Slots::Released => return Err(self.busy()),
        }
        self.classes.write().push(class);
        Ok(())
    }

    /// `Loading -> Loaded`.
    pub fn finish_loading(&self) -> LoaderResult<()> {
        self.transition(ModState::Loaded)
    }

    /// Move to `Error` from `Loading` or `Loaded`.
    pub fn fail(&self) -> LoaderResult<()> {
        self.transition(ModState::Error)
    }

    /// `Loaded -> Active`, initializing every behaviour in order.
    ///
    /// The first failing behaviour moves the mod to `Error`.
    pub fn activate(&self) -> LoaderResult<()> {
        let state = self.state();
        if state != ModState::Loaded {
            return Err(LoaderError::InvalidTransition {
                mod_id: self.id().to_string(),
                from: state,
                to: ModState::Active,
            });
        }

        let mut slots = self.check_out().ok_or_else(|| self.busy())?;
        let ctx = Arc::clone(&self.context);
        let mut failed = None;
        for slot in &mut slots {
            if let Err(source) = guarded(|| slot.behaviour.initialize(&ctx)) {
                error!(mod_id = %ctx.mod_id(), class = %slot.class, error = %source, "Behaviour failed to initialize");
                failed = Some((slot.class.clone(), source));
                break;
            }
        }
        self.check_in(slots);

        if let Some((class, source)) = failed {
            if let Err(e) = self.transition(ModState::Error) {
                debug!(mod_id = %self.id(), error = %e, "Mod left Loaded during initialization");
            }
            return Err(LoaderError::Behaviour {
                mod_id: ctx.mod_id().to_string(),
                class,
                source,
            });
        }

        self.transition(ModState::Active)?;
        info!(mod_id = %self.id(), behaviours = self.behaviour_count(), "Mod activated");
        Ok(())
    }

    /// `Active -> Paused`.
    pub fn pause(&self) -> LoaderResult<()> {
        self.transition(ModState::Paused)?;
        self.run_hooks("on_pause", |b, ctx| b.on_pause(ctx));
        Ok(())
    }

    /// `Paused -> Active`.
    pub fn resume(&self) -> LoaderResult<()> {
        self.transition(ModState::Active)?;
        self.run_hooks("on_resume", |b, ctx| b.on_resume(ctx));
        Ok(())
    }

    /// Forward a tick to every behaviour. No-op unless `Active`, and skipped
    /// while another hook of this mod is running.
    ///
    /// Returns the number of behaviours whose tick failed.
    pub fn tick(&self, dt: f64) -> usize {
        if self.state() != ModState::Active {
            return 0;
        }
        self.run_hooks("on_tick", |b, ctx| b.on_tick(ctx, dt)).len()
    }

    /// Enter `Unloading`, tear down every behaviour and release everything
    /// the mod holds.
    ///
    /// Teardown failures are collected; they never stop the remaining
    /// behaviours from being torn down. If a hook of this mod is running,
    /// its behaviours are torn down when that hook returns.
    pub fn unload(&self) -> LoaderResult<UnloadReport> {
        self.transition(ModState::Unloading)?;

        let slots = match std::mem::replace(&mut *self.behaviours.lock(), Slots::Released) {
            Slots::Ready(slots) => Some(slots),
            Slots::InUse => None,
            Slots::Released => Some(Vec::new()),
        };
        self.classes.write().clear();

        let (torn_down, failures) = match slots {
            Some(mut slots) => {
                let failures = run_isolated(&self.context, &mut slots, "teardown", |b, ctx| b.teardown(ctx));
                (slots.len(), failures)
            }
            None => {
                debug!(mod_id = %self.id(), "Teardown deferred until the running hook returns");
                (0, Vec::new())
            }
        };

        let (subscriptions_removed, objects_destroyed) = self.context.release_all();

        let extracted = self.extracted.lock().take();
        let temp_removed = match extracted {
            Some(extracted) => {
                let dir = extracted.dir().to_path_buf();
                match extracted.cleanup() {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(mod_id = %self.id(), dir = %dir.display(), error = %e, "Failed to remove extracted package");
                        false
                    }
                }
            }
            None => false,
        };

        Ok(UnloadReport {
            mod_id: self.id().to_string(),
            torn_down,
            failures: failures
                .into_iter()
                .map(|(class, e)| (class, e.to_string()))
                .collect(),
            subscriptions_removed,
            objects_destroyed,
            temp_removed,
        })
    }

    fn busy(&self) -> LoaderError {
        LoaderError::HooksBusy(self.id().to_string())
    }

    fn check_out(&self) -> Option<Vec<BehaviourSlot>> {
        let mut cell = self.behaviours.lock();
        match std::mem::replace(&mut *cell, Slots::InUse) {
            Slots::Ready(slots) => Some(slots),
            other => {
                *cell = other;
                None
            }
        }
    }

    fn check_in(&self, mut slots: Vec<BehaviourSlot>) {
        {
            let mut cell = self.behaviours.lock();
            if let Slots::InUse = *cell {
                *cell = Slots::Ready(slots);
                return;
            }
        }

        // Unloaded while the hook ran.
        let failures = run_isolated(&self.context, &mut slots, "teardown", |b, ctx| b.teardown(ctx));
        info!(
            mod_id = %self.id(),
            behaviours = slots.len(),
            failed = failures.len(),
            "Deferred teardown finished"
        );
    }

    /// Run `hook` on every behaviour with no lock held.
    fn run_hooks<F>(&self, hook: &'static str, f: F) -> Vec<(String, BehaviourError)>
    where
        F: FnMut(&mut dyn ModBehaviour, &ModContext) -> BehaviourResult,
    {
        match self.check_out() {
            Some(mut slots) => {
                let failures = run_isolated(&self.context, &mut slots, hook, f);
                self.check_in(slots);
                failures
            }
            None => {
                debug!(mod_id = %self.id(), hook, "Hook skipped while another hook runs");
                Vec::new()
            }
        }
    }
}

impl fmt::Debug for ModInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModInstance")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("behaviours", &self.behaviour_classes())
            .field("origin", &self.origin)
            .finish()
    }
}

/// Run `f` on every behaviour; failures and panics are logged and returned
/// but do not stop the loop.
fn run_isolated<F>(
    ctx: &ModContext,
    slots: &mut [BehaviourSlot],
    hook: &'static str,
    mut f: F,
) -> Vec<(String, BehaviourError)>
where
    F: FnMut(&mut dyn ModBehaviour, &ModContext) -> BehaviourResult,
{
    let mut failures = Vec::new();
    for slot in slots {
        if let Err(e) = guarded(|| f(slot.behaviour.as_mut(), ctx)) {
            warn!(mod_id = %ctx.mod_id(), class = %slot.class, hook, error = %e, "Behaviour hook failed");
            failures.push((slot.class.clone(), e));
        }
    }
    failures
}

/// Run a behaviour hook, turning a panic into an error.
fn guarded<F>(f: F) -> BehaviourResult
where
    F: FnOnce() -> BehaviourResult,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(BehaviourError::new(format!("panicked: {}", message)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{DefaultPaths, HostServices};
    use modlink_bus::EventBus;
    use modlink_runtime::{PermissionSet, ResourceLimits, SecurityContext};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manifest() -> ModManifest {
        ModManifest::from_toml_str(
            r#"
id = "lifecycle"
name = "Lifecycle"
version = "1.0.0"
entry_class = "Main"
"#,
        )
        .unwrap()
    }

    fn instance() -> ModInstance {
        let security = SecurityContext::new(
            "lifecycle",
            PermissionSet::new(),
            ResourceLimits::default(),
            false,
        );
        let services = HostServices::new(Arc::new(DefaultPaths::under(Path::new("/tmp/ml"))));
        let ctx = ModContext::new(security, Arc::new(EventBus::new()), None, services, Arc::default());
        ModInstance::begin(
            manifest(),
            PathBuf::from("/mods/lifecycle"),
            PathBuf::from("/mods/lifecycle"),
            Arc::new(ctx),
            None,
        )
    }

    struct Counter {
        ticks: Arc<AtomicUsize>,
        fail_teardown: bool,
    }

    impl ModBehaviour for Counter {
        fn on_tick(&mut self, _ctx: &ModContext, _dt: f64) -> BehaviourResult {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn teardown(&mut self, _ctx: &ModContext) -> BehaviourResult {
            if self.fail_teardown {
                panic!("teardown exploded");
            }
            self.ticks.fetch_add(100, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_transitions() {
        use ModState::*;
        assert!(NotLoaded.can_transition(Loading));
        assert!(!NotLoaded.can_transition(Active));
        assert!(!Error.can_transition(Loading));
        assert!(Error.can_transition(Unloading));
        assert!(Paused.can_transition(Active));
        assert!(!Loading.can_transition(Active));
    }

    #[test]
    fn test_tick_only_while_active() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let inst = instance();
        inst.attach(
            "Main",
            Box::new(Counter {
                ticks: Arc::clone(&ticks),
                fail_teardown: false,
            }),
        )
        .unwrap();
        assert_eq!(inst.state(), ModState::Loading);
        assert!(inst.activate().is_err());

        inst.finish_loading().unwrap();
        inst.tick(0.016);
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        inst.activate().unwrap();
        inst.tick(0.016);
        inst.pause().unwrap();
        inst.tick(0.016);
        inst.resume().unwrap();
        inst.tick(0.016);
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        assert!(inst.attach("Late", Box::new(Counter { ticks, fail_teardown: false })).is_err());
    }

    #[test]
    fn test_unload_isolates_failures() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let inst = instance();
        for (class, fail) in [("A", false), ("B", true), ("C", false)] {
            inst.attach(
                class,
                Box::new(Counter {
                    ticks: Arc::clone(&ticks),
                    fail_teardown: fail,
                }),
            )
            .unwrap();
        }
        inst.finish_loading().unwrap();
        inst.activate().unwrap();

        let report = inst.unload().unwrap();
        assert_eq!(report.torn_down, 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "B");
        assert_eq!(ticks.load(Ordering::SeqCst), 200);
        assert_eq!(inst.state(), ModState::Unloading);
        assert_eq!(inst.behaviour_count(), 0);
    }
}
