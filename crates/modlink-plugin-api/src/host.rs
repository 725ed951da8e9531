//! Interfaces the host application provides to the mod runtime.
//!
//! The runtime consumes these but never implements the host-side behaviour:
//! turning object definitions into engine objects, deciding where files live
//! and where log lines go are all up to the host.

use crate::resources::ObjectDefinition;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Log level for mod logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Destination for log lines written by mods.
pub trait LogSink: Send + Sync {
    fn log(&self, mod_id: &str, level: LogLevel, message: &str);
}

/// Forwards mod log lines to `tracing`, tagged with the mod id.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, mod_id: &str, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(mod_id = %mod_id, "{}", message),
            LogLevel::Info => tracing::info!(mod_id = %mod_id, "{}", message),
            LogLevel::Warn => tracing::warn!(mod_id = %mod_id, "{}", message),
            LogLevel::Error => tracing::error!(mod_id = %mod_id, "{}", message),
        }
    }
}

/// Well-known directories.
pub trait PathProvider: Send + Sync {
    /// Directory scanned for bundles.
    fn bundle_root(&self) -> &Path;

    fn config_root(&self) -> &Path;

    /// Scratch space; packages are extracted here.
    fn temp_root(&self) -> &Path;

    /// Persistent per-mod data lives below this.
    fn data_root(&self) -> &Path;

    fn mod_data_dir(&self, mod_id: &str) -> PathBuf {
        self.data_root().join(mod_id)
    }
}

/// Platform directories for modlink.
///
/// - Bundles: `$XDG_DATA_HOME/modlink/mods`
/// - Config: `$XDG_CONFIG_HOME/modlink`
/// - Data: `$XDG_DATA_HOME/modlink/data`
/// - Temp: `$TMPDIR/modlink`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultPaths {
    pub bundle_root: PathBuf,
    pub config_root: PathBuf,
    pub temp_root: PathBuf,
    pub data_root: PathBuf,
}

impl DefaultPaths {
    /// Resolve platform directories. `None` if no home directory is known.
    pub fn new() -> Option<Self> {
        let dirs = directories::ProjectDirs::from("com", "raibid-labs", "modlink")?;
        Some(Self {
            bundle_root: dirs.data_dir().join("mods"),
            config_root: dirs.config_dir().to_path_buf(),
            temp_root: std::env::temp_dir().join("modlink"),
            data_root: dirs.data_dir().join("data"),
        })
    }

    /// Every root below one base directory.
    pub fn under(base: &Path) -> Self {
        Self {
            bundle_root: base.join("mods"),
            config_root: base.join("config"),
            temp_root: base.join("tmp"),
            data_root: base.join("data"),
        }
    }
}

impl PathProvider for DefaultPaths {
    fn bundle_root(&self) -> &Path {
        &self.bundle_root
    }

    fn config_root(&self) -> &Path {
        &self.config_root
    }

    fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    fn data_root(&self) -> &Path {
        &self.data_root
    }
}

/// Handle to a live host object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle(pub u64);

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Turns resource-table object definitions into engine objects.
pub trait ObjectFactory: Send + Sync {
    fn create(&self, mod_id: &str, definition: &ObjectDefinition) -> Result<ObjectHandle, String>;

    fn destroy(&self, mod_id: &str, handle: ObjectHandle);
}

/// The collaborators handed to every mod.
#[derive(Clone)]
pub struct HostServices {
    pub log: Arc<dyn LogSink>,
    pub paths: Arc<dyn PathProvider>,
    pub objects: Option<Arc<dyn ObjectFactory>>,
}

impl HostServices {
    pub fn new(paths: Arc<dyn PathProvider>) -> Self {
        Self {
            log: Arc::new(TracingLogSink),
            paths,
            objects: None,
        }
    }

    pub fn with_log_sink(mut self, log: Arc<dyn LogSink>) -> Self {
        self.log = log;
        self
    }

    pub fn with_object_factory(mut self, objects: Arc<dyn ObjectFactory>) -> Self {
        self.objects = Some(objects);
        self
    }
}

impl fmt::Debug for HostServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostServices")
            .field("bundle_root", &self.paths.bundle_root())
            .field("objects", &self.objects.is_some())
            .finish()
    }
}
