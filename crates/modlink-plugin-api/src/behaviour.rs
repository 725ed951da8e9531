//! Mod behaviours and the registry that constructs them by class name.
//!
//! A bundle's manifest names its entry behaviour class and any additional
//! behaviour classes. The loader checks that a code module declares each
//! class, then asks the [`BehaviourRegistry`] for a factory registered under
//! the same name.

use crate::context::ModContext;
use crate::error::BehaviourResult;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle hooks of one mod behaviour.
///
/// Every hook has an empty default so behaviours implement only what they
/// need. Hooks run with no loader lock held.
pub trait ModBehaviour: Send {
    /// Called once when the mod is activated.
    fn initialize(&mut self, ctx: &ModContext) -> BehaviourResult {
        let _ = ctx;
        Ok(())
    }

    /// Called by the host scheduler on every tick while the mod is active.
    /// `dt` is the elapsed time since the previous tick, in seconds.
    fn on_tick(&mut self, ctx: &ModContext, dt: f64) -> BehaviourResult {
        let _ = (ctx, dt);
        Ok(())
    }

    fn on_pause(&mut self, ctx: &ModContext) -> BehaviourResult {
        let _ = ctx;
        Ok(())
    }

    fn on_resume(&mut self, ctx: &ModContext) -> BehaviourResult {
        let _ = ctx;
        Ok(())
    }

    /// Called once on unload. A failure here never stops the teardown of the
    /// mod's other behaviours.
    fn teardown(&mut self, ctx: &ModContext) -> BehaviourResult {
        let _ = ctx;
        Ok(())
    }
}

/// Constructs a fresh behaviour instance.
pub type BehaviourFactory = Arc<dyn Fn() -> Box<dyn ModBehaviour> + Send + Sync>;

/// Class name to factory mapping, populated at startup.
#[derive(Default)]
pub struct BehaviourRegistry {
    factories: RwLock<HashMap<String, BehaviourFactory>>,
}

impl BehaviourRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `class`. A later registration replaces an
    /// earlier one.
    pub fn register<F>(&self, class: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn ModBehaviour> + Send + Sync + 'static,
    {
        let class = class.into();
        let previous = self.factories.write().insert(class.clone(), Arc::new(factory));
        if previous.is_some() {
            warn!(class = %class, "Replaced behaviour factory");
        } else {
            debug!(class = %class, "Registered behaviour factory");
        }
    }

    /// Register a `Default` behaviour type.
    pub fn register_default<B>(&self, class: impl Into<String>)
    where
        B: ModBehaviour + Default + 'static,
    {
        self.register(class, || Box::new(B::default()));
    }

    /// Construct a behaviour by class name.
    pub fn create(&self, class: &str) -> Option<Box<dyn ModBehaviour>> {
        let factory = self.factories.read().get(class).cloned()?;
        Some(factory())
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.read().contains_key(class)
    }

    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.factories.read().keys().cloned().collect();
        classes.sort();
        classes
    }

    pub fn len(&self) -> usize {
        self.factories.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for BehaviourRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BehaviourRegistry")
            .field("classes", &self.classes())
            .finish()
    }
}
