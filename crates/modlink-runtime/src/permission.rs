//! Permission model for mods.
//!
//! Mods request permissions in their manifest. The security policy decides
//! which requests are allowed at all and which are granted to each mod.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A permission that a mod can request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Permission {
    /// Publish events on the bus.
    EventsPublish,

    /// Subscribe to events on the bus.
    EventsSubscribe,

    /// Call services provided by other mods.
    ServicesCall,

    /// Register services for other mods.
    ServicesRegister,

    /// Create host objects from object definitions.
    ObjectsCreate,

    /// Modify host objects the mod does not own.
    ObjectsModify,

    /// Read files under the mod's data directory.
    FilesRead,

    /// Write files under the mod's data directory.
    FilesWrite,

    /// Open network connections.
    Network,

    /// Any other permission string.
    Custom(String),
}

impl Permission {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "events.publish" => Permission::EventsPublish,
            "events.subscribe" => Permission::EventsSubscribe,
            "services.call" => Permission::ServicesCall,
            "services.register" => Permission::ServicesRegister,
            "objects.create" => Permission::ObjectsCreate,
            "objects.modify" => Permission::ObjectsModify,
            "files.read" => Permission::FilesRead,
            "files.write" => Permission::FilesWrite,
            "network" => Permission::Network,
            other => Permission::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Permission::EventsPublish => "events.publish",
            Permission::EventsSubscribe => "events.subscribe",
            Permission::ServicesCall => "services.call",
            Permission::ServicesRegister => "services.register",
            Permission::ObjectsCreate => "objects.create",
            Permission::ObjectsModify => "objects.modify",
            Permission::FilesRead => "files.read",
            Permission::FilesWrite => "files.write",
            Permission::Network => "network",
            Permission::Custom(s) => s,
        }
    }
}

impl From<String> for Permission {
    fn from(s: String) -> Self {
        Permission::parse(&s)
    }
}

impl From<Permission> for String {
    fn from(p: Permission) -> Self {
        p.as_str().to_string()
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered set of permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet {
    permissions: BTreeSet<Permission>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a permission set from a list of permission strings.
    pub fn from_strings<I, S>(strings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        strings
            .into_iter()
            .map(|s| Permission::parse(s.as_ref()))
            .collect()
    }

    pub fn insert(&mut self, permission: Permission) -> bool {
        self.permissions.insert(permission)
    }

    pub fn contains(&self, permission: &Permission) -> bool {
        self.permissions.contains(permission)
    }

    /// Check if this set is a superset of another.
    pub fn contains_all(&self, other: &PermissionSet) -> bool {
        other.permissions.is_subset(&self.permissions)
    }

    /// Members of `self` that are missing from `allowed`.
    pub fn missing_from(&self, allowed: &PermissionSet) -> Vec<Permission> {
        self.permissions
            .difference(&allowed.permissions)
            .cloned()
            .collect()
    }

    pub fn intersection(&self, other: &PermissionSet) -> PermissionSet {
        self.permissions
            .intersection(&other.permissions)
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.permissions.iter()
    }

    pub fn len(&self) -> usize {
        self.permissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<T: IntoIterator<Item = Permission>>(iter: T) -> Self {
        Self {
            permissions: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.permissions.iter().map(Permission::as_str).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_and_custom() {
        assert_eq!(Permission::parse("events.publish"), Permission::EventsPublish);
        assert_eq!(
            Permission::parse("telemetry.upload"),
            Permission::Custom("telemetry.upload".to_string())
        );
        assert_eq!(Permission::Network.to_string(), "network");
    }

    #[test]
    fn test_set_operations() {
        let requested = PermissionSet::from_strings(["events.publish", "network", "files.write"]);
        let allowed = PermissionSet::from_strings(["events.publish", "events.subscribe", "network"]);

        assert!(!allowed.contains_all(&requested));
        assert_eq!(requested.missing_from(&allowed), vec![Permission::FilesWrite]);
        assert_eq!(
            requested.intersection(&allowed),
            PermissionSet::from_strings(["events.publish", "network"])
        );
    }

    #[test]
    fn test_serde_as_strings() {
        let set = PermissionSet::from_strings(["network", "events.publish"]);
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["events.publish","network"]"#);

        let back: PermissionSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
