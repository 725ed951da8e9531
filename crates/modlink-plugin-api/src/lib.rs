//! # modlink-plugin-api
//!
//! The side of modlink that mods and hosts program against.
//!
//! This crate provides:
//! - The [`ModBehaviour`] trait and the [`BehaviourRegistry`] that builds
//!   behaviours by class name
//! - Collaborator interfaces the host implements: [`LogSink`],
//!   [`PathProvider`] and [`ObjectFactory`]
//! - [`ModContext`], the permission-checked handle behaviours use to publish,
//!   subscribe, send requests and create objects
//! - [`ModInstance`] and its lifecycle state machine
//! - The [`ModLoader`] that validates bundles, instantiates them and tears
//!   them down again
//!
//! ## Loading
//!
//! ```text
//!  bundle dir / .mlpkg
//!        │
//!        ├── SecurityManager::validate_bundle   (path, signature, scan, permissions)
//!        ├── dependency check
//!        ├── SecurityContext + ResourceTable
//!        ├── BehaviourRegistry::create for each declared class
//!        │
//!        └── ModInstance (Loaded) ──activate──► Active
//! ```

pub mod behaviour;
pub mod context;
pub mod error;
pub mod host;
pub mod instance;
pub mod loader;
pub mod resources;

pub use behaviour::{BehaviourFactory, BehaviourRegistry, ModBehaviour};
pub use context::ModContext;
pub use error::{BehaviourError, BehaviourResult, ContextError, LoaderError, LoaderResult};
pub use host::{
    DefaultPaths, HostServices, LogLevel, LogSink, ObjectFactory, ObjectHandle, PathProvider,
    TracingLogSink,
};
pub use instance::{ModInstance, ModState, UnloadReport};
pub use loader::{LoadFailure, LoadSummary, ModInfo, ModLoader, SharedInstance};
pub use resources::{ObjectDefinition, ResourceTable};
