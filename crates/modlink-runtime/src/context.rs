//! Per-mod security context.

use crate::error::{RuntimeError, RuntimeResult};
use crate::permission::{Permission, PermissionSet};
use crate::policy::ResourceLimits;

/// Permissions and resource limits granted to one loaded mod.
///
/// Built once per successful load by
/// [`SecurityManager::create_context`](crate::SecurityManager::create_context)
/// and owned by that mod's instance.
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityContext {
    mod_id: String,
    permissions: PermissionSet,
    limits: ResourceLimits,
    trusted: bool,
}

impl SecurityContext {
    pub fn new(
        mod_id: impl Into<String>,
        permissions: PermissionSet,
        limits: ResourceLimits,
        trusted: bool,
    ) -> Self {
        Self {
            mod_id: mod_id.into(),
            permissions,
            limits,
            trusted,
        }
    }

    pub fn mod_id(&self) -> &str {
        &self.mod_id
    }

    pub fn permissions(&self) -> &PermissionSet {
        &self.permissions
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    pub fn has(&self, permission: &Permission) -> bool {
        self.permissions.contains(permission)
    }

    /// Fail with [`RuntimeError::PermissionDenied`] unless granted.
    pub fn require(&self, permission: &Permission) -> RuntimeResult<()> {
        if self.has(permission) {
            Ok(())
        } else {
            Err(RuntimeError::PermissionDenied {
                mod_id: self.mod_id.clone(),
                permission: permission.to_string(),
            })
        }
    }
}
