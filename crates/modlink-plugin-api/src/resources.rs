//! Per-mod resource table.
//!
//! Built once at load time from the manifest's declared resource lists.
//! Object definitions and configuration documents are parsed into memory;
//! media files (models, textures, audio) are indexed by path only.

use crate::error::{LoaderError, LoaderResult};
use modlink_runtime::ResourceLists;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// An object/component definition read from the bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDefinition {
    /// `name` key of the document, else the file stem.
    pub name: String,
    pub path: PathBuf,
    pub data: Value,
}

/// Resources declared by one bundle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceTable {
    objects: BTreeMap<String, ObjectDefinition>,
    configs: BTreeMap<String, Value>,
    models: Vec<PathBuf>,
    textures: Vec<PathBuf>,
    audio: Vec<PathBuf>,
}

impl ResourceTable {
    /// Read every declared resource under `root`.
    ///
    /// Fails if a path leaves the bundle, a file is missing, a file exceeds
    /// `max_file_size` bytes, or a definition document does not parse.
    pub fn collect(
        mod_id: &str,
        root: &Path,
        lists: &ResourceLists,
        max_file_size: u64,
    ) -> LoaderResult<Self> {
        let reader = Reader {
            mod_id,
            root,
            max_file_size,
        };
        let mut table = Self::default();

        for rel in &lists.objects {
            let path = reader.checked(rel)?;
            let data = reader.parse_document(&path)?;
            let name = data
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| file_stem(&path));
            table.objects.insert(name.clone(), ObjectDefinition { name, path, data });
        }

        for rel in &lists.configs {
            let path = reader.checked(rel)?;
            let value = match extension(&path).as_deref() {
                Some("json") | Some("toml") => reader.parse_document(&path)?,
                _ => Value::String(reader.read_text(&path)?),
            };
            table.configs.insert(file_stem(&path), value);
        }

        for (rels, out) in [
            (&lists.models, &mut table.models),
            (&lists.textures, &mut table.textures),
            (&lists.audio, &mut table.audio),
        ] {
            for rel in rels {
                out.push(reader.checked(rel)?);
            }
        }

        debug!(
            mod_id,
            objects = table.objects.len(),
            configs = table.configs.len(),
            media = table.models.len() + table.textures.len() + table.audio.len(),
            "Collected resources"
        );
        Ok(table)
    }

    pub fn object(&self, name: &str) -> Option<&ObjectDefinition> {
        self.objects.get(name)
    }

    pub fn objects(&self) -> impl Iterator<Item = &ObjectDefinition> {
        self.objects.values()
    }

    /// Configuration document by file stem.
    pub fn config(&self, name: &str) -> Option<&Value> {
        self.configs.get(name)
    }

    pub fn config_names(&self) -> impl Iterator<Item = &str> {
        self.configs.keys().map(String::as_str)
    }

    pub fn models(&self) -> &[PathBuf] {
        &self.models
    }

    pub fn textures(&self) -> &[PathBuf] {
        &self.textures
    }

    pub fn audio(&self) -> &[PathBuf] {
        &self.audio
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
            && self.configs.is_empty()
            && self.models.is_empty()
            && self.textures.is_empty()
            && self.audio.is_empty()
    }
}

struct Reader<'a> {
    mod_id: &'a str,
    root: &'a Path,
    max_file_size: u64,
}

impl Reader<'_> {
    fn error(&self, path: &Path, reason: impl Into<String>) -> LoaderError {
        LoaderError::Resource {
            mod_id: self.mod_id.to_string(),
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Resolve a declared path and check it stays inside the bundle, exists
    /// and is within the size limit.
    fn checked(&self, rel: &str) -> LoaderResult<PathBuf> {
        let rel_path = Path::new(rel);
        if rel_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(self.error(rel_path, "path leaves the bundle"));
        }

        let path = self.root.join(rel_path);
        let meta = std::fs::metadata(&path).map_err(|e| self.error(&path, e.to_string()))?;
        if !meta.is_file() {
            return Err(self.error(&path, "not a file"));
        }
        if meta.len() > self.max_file_size {
            return Err(self.error(
                &path,
                format!("{} bytes exceeds the {} byte limit", meta.len(), self.max_file_size),
            ));
        }
        Ok(path)
    }

    fn read_text(&self, path: &Path) -> LoaderResult<String> {
        std::fs::read_to_string(path).map_err(|e| self.error(path, e.to_string()))
    }

    fn parse_document(&self, path: &Path) -> LoaderResult<Value> {
        let text = self.read_text(path)?;
        match extension(path).as_deref() {
            Some("json") => serde_json::from_str(&text).map_err(|e| self.error(path, e.to_string())),
            Some("toml") => toml::from_str(&text).map_err(|e| self.error(path, e.to_string())),
            _ => Err(self.error(path, "definitions must be .json or .toml")),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lists() -> ResourceLists {
        ResourceLists {
            objects: vec!["objects/crate.json".to_string()],
            configs: vec!["config/settings.toml".to_string(), "config/motd.txt".to_string()],
            textures: vec!["textures/crate.png".to_string()],
            ..Default::default()
        }
    }

    fn bundle() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        for sub in ["objects", "config", "textures"] {
            std::fs::create_dir_all(root.join(sub)).unwrap();
        }
        std::fs::write(
            root.join("objects/crate.json"),
            r#"{ "name": "WoodenCrate", "mass": 12.5 }"#,
        )
        .unwrap();
        std::fs::write(root.join("config/settings.toml"), "volume = 3").unwrap();
        std::fs::write(root.join("config/motd.txt"), "welcome").unwrap();
        std::fs::write(root.join("textures/crate.png"), [0u8; 64]).unwrap();
        dir
    }

    #[test]
    fn test_collect() {
        let dir = bundle();
        let table = ResourceTable::collect("m", dir.path(), &lists(), 1024).unwrap();

        let object = table.object("WoodenCrate").unwrap();
        assert_eq!(object.data["mass"], 12.5);
        assert_eq!(table.config("settings").unwrap()["volume"], 3);
        assert_eq!(table.config("motd").unwrap(), "welcome");
        assert_eq!(table.textures().len(), 1);
    }

    #[test]
    fn test_size_limit() {
        let dir = bundle();
        let err = ResourceTable::collect("m", dir.path(), &lists(), 16).unwrap_err();
        assert!(matches!(err, LoaderError::Resource { .. }));
    }

    #[test]
    fn test_escape_and_missing() {
        let dir = bundle();
        let escaping = ResourceLists {
            models: vec!["../outside.bin".to_string()],
            ..Default::default()
        };
        assert!(ResourceTable::collect("m", dir.path(), &escaping, 1024).is_err());

        let missing = ResourceLists {
            audio: vec!["audio/none.ogg".to_string()],
            ..Default::default()
        };
        assert!(ResourceTable::collect("m", dir.path(), &missing, 1024).is_err());
    }
}
