//! Code module declaration tables.
//!
//! Each bundle ships its code modules under `code/` as `.mlm` files. A
//! module file starts with a declaration table: every type the module
//! defines, its base type, the methods it declares and the external
//! methods it references. The runtime reads only this table; nothing in
//! the module is executed while it is inspected.
//!
//! ## Format
//!
//! ```text
//! +----------------+
//! | Magic (4 bytes)|  "MLM\x01" (version 1), optional
//! +----------------+
//! | Declarations   |  JSON document
//! +----------------+
//! ```

use crate::error::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Magic bytes for code module files.
pub const MAGIC: &[u8; 4] = b"MLM\x01";

/// Code module file extension.
pub const MODULE_EXTENSION: &str = "mlm";

/// Directory holding code modules, relative to the bundle root.
pub const CODE_DIR: &str = "code";

/// Base type every behaviour class derives from.
pub const BEHAVIOUR_BASE: &str = "ModBehaviour";

/// Declaration table of one code module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeModule {
    /// Version of the module format.
    pub version: u8,

    pub name: String,

    #[serde(default)]
    pub types: Vec<TypeDecl>,
}

/// A type defined by a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDecl {
    pub name: String,

    #[serde(default)]
    pub base_type: Option<String>,

    /// Interfaces the type implements.
    #[serde(default)]
    pub implements: Vec<String>,

    #[serde(default)]
    pub methods: Vec<MethodDecl>,

    /// External methods called from this type's bodies.
    #[serde(default)]
    pub references: Vec<MethodRef>,
}

impl TypeDecl {
    pub fn is_behaviour(&self) -> bool {
        self.base_type.as_deref() == Some(BEHAVIOUR_BASE)
    }
}

/// A method defined by a type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDecl {
    pub name: String,

    #[serde(default)]
    pub params: Vec<String>,

    #[serde(default)]
    pub returns: Option<String>,
}

/// A reference to a method on another type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    /// Fully qualified declaring type, e.g. `std::process::Command`.
    pub owner: String,

    pub method: String,
}

impl MethodRef {
    /// `owner::method`.
    pub fn signature(&self) -> String {
        format!("{}::{}", self.owner, self.method)
    }
}

impl CodeModule {
    pub fn find_type(&self, name: &str) -> Option<&TypeDecl> {
        self.types.iter().find(|t| t.name == name)
    }

    /// Types deriving from the behaviour base.
    pub fn behaviour_types(&self) -> impl Iterator<Item = &TypeDecl> {
        self.types.iter().filter(|t| t.is_behaviour())
    }
}

/// A module together with the file it came from.
#[derive(Debug, Clone)]
pub struct ModuleFile {
    pub path: PathBuf,
    pub module: CodeModule,
}

/// Reads module declaration tables.
pub struct ModuleLoader;

impl ModuleLoader {
    /// Load a module from a file.
    pub fn load(path: &Path) -> RuntimeResult<CodeModule> {
        let content = std::fs::read(path)?;
        let module = Self::parse(&content)
            .map_err(|e| RuntimeError::ModuleError(format!("{}: {}", path.display(), e)))?;
        Self::validate(&module)?;
        Ok(module)
    }

    /// Load every module under `<bundle_root>/code`, sorted by file name.
    pub fn load_dir(bundle_root: &Path) -> RuntimeResult<Vec<ModuleFile>> {
        let dir = bundle_root.join(CODE_DIR);
        if !dir.is_dir() {
            return Err(RuntimeError::ModuleError(format!(
                "Bundle has no {}/ directory",
                CODE_DIR
            )));
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.is_file() && p.extension().and_then(|e| e.to_str()) == Some(MODULE_EXTENSION)
            })
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(RuntimeError::ModuleError(format!(
                "No .{} modules in {}",
                MODULE_EXTENSION,
                dir.display()
            )));
        }

        paths
            .into_iter()
            .map(|path| -> RuntimeResult<ModuleFile> {
                let module = Self::load(&path)?;
                debug!(module = %module.name, types = module.types.len(), "Read module declarations");
                Ok(ModuleFile { path, module })
            })
            .collect()
    }

    /// Parse a module from bytes.
    pub fn parse(bytes: &[u8]) -> RuntimeResult<CodeModule> {
        let body = bytes.strip_prefix(MAGIC.as_slice()).unwrap_or(bytes);

        let content = std::str::from_utf8(body)
            .map_err(|e| RuntimeError::ModuleError(format!("Invalid UTF-8: {}", e)))?;

        serde_json::from_str(content)
            .map_err(|e| RuntimeError::ModuleError(format!("Invalid declaration table: {}", e)))
    }

    /// Validate module structure.
    pub fn validate(module: &CodeModule) -> RuntimeResult<()> {
        if module.version != 1 {
            return Err(RuntimeError::ModuleError(format!(
                "Unsupported module version: {}",
                module.version
            )));
        }

        if module.name.trim().is_empty() {
            return Err(RuntimeError::ModuleError(
                "Module name cannot be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for decl in &module.types {
            if !seen.insert(decl.name.as_str()) {
                return Err(RuntimeError::ModuleError(format!(
                    "Type '{}' declared twice in module '{}'",
                    decl.name, module.name
                )));
            }
        }

        Ok(())
    }
}
