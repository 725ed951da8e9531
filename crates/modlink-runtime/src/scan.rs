//! Static capability scan.
//!
//! Matches every declared base type and referenced method of a code module
//! against a denylist of dangerous capabilities. Works purely on the
//! declaration table.

use crate::module::CodeModule;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability class a denylist rule guards against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DangerousCapability {
    ProcessSpawn,
    FileDeletion,
    RawProcessAccess,
    RegistryAccess,
    OsConfig,
    DynamicCodeLoading,
    MemoryInterop,
    /// Added by the security policy.
    PolicyDenied,
}

impl DangerousCapability {
    pub fn as_str(&self) -> &'static str {
        match self {
            DangerousCapability::ProcessSpawn => "process spawning",
            DangerousCapability::FileDeletion => "filesystem deletion",
            DangerousCapability::RawProcessAccess => "raw process access",
            DangerousCapability::RegistryAccess => "registry access",
            DangerousCapability::OsConfig => "OS configuration access",
            DangerousCapability::DynamicCodeLoading => "dynamic code loading",
            DangerousCapability::MemoryInterop => "low-level memory interop",
            DangerousCapability::PolicyDenied => "policy-denied API",
        }
    }
}

impl fmt::Display for DangerousCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A symbol prefix and the capability it grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenyRule {
    pub prefix: String,
    pub capability: DangerousCapability,
}

impl DenyRule {
    pub fn new(prefix: impl Into<String>, capability: DangerousCapability) -> Self {
        Self {
            prefix: normalize_symbol(&prefix.into()),
            capability,
        }
    }

    /// `symbol` must already be normalized.
    fn matches(&self, symbol: &str) -> bool {
        symbol.starts_with(self.prefix.as_str())
    }
}

/// Canonical spelling of a path for denylist matching.
///
/// Drops whitespace and a leading `::`, and rewrites the `core::` and
/// `alloc::` roots to the `std::` paths that re-export them.
pub fn normalize_symbol(symbol: &str) -> String {
    let compact: String = symbol.chars().filter(|c| !c.is_whitespace()).collect();
    let path = compact.trim_start_matches("::");

    for root in ["core::", "alloc::"] {
        if let Some(rest) = path.strip_prefix(root) {
            return format!("std::{}", rest);
        }
    }
    path.to_string()
}

/// One denylist hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFinding {
    pub module: String,
    pub type_name: String,
    /// Base type or `owner::method` that matched.
    pub symbol: String,
    pub capability: DangerousCapability,
}

impl fmt::Display for ScanFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{} uses {} ({})",
            self.module, self.type_name, self.symbol, self.capability
        )
    }
}

/// Denylist scanner.
#[derive(Debug, Clone)]
pub struct CapabilityScanner {
    rules: Vec<DenyRule>,
}

impl Default for CapabilityScanner {
    fn default() -> Self {
        use DangerousCapability::*;

        let rules = [
            ("std::process::Command", ProcessSpawn),
            ("tokio::process::", ProcessSpawn),
            ("std::os::unix::process::", ProcessSpawn),
            ("std::fs::remove_file", FileDeletion),
            ("std::fs::remove_dir", FileDeletion),
            ("tokio::fs::remove_", FileDeletion),
            ("std::process::", RawProcessAccess),
            ("nix::sys::ptrace", RawProcessAccess),
            ("winreg::", RegistryAccess),
            ("windows::Win32::System::Registry", RegistryAccess),
            ("std::env::set_var", OsConfig),
            ("std::env::remove_var", OsConfig),
            ("nix::unistd::", OsConfig),
            ("libloading::", DynamicCodeLoading),
            ("modlink::ModuleLoader", DynamicCodeLoading),
            ("std::mem::transmute", MemoryInterop),
            ("std::ptr::", MemoryInterop),
            ("std::alloc::", MemoryInterop),
        ]
        .into_iter()
        .map(|(prefix, capability)| DenyRule::new(prefix, capability))
        .collect();

        Self { rules }
    }
}

impl CapabilityScanner {
    /// Scanner with an explicit rule list.
    pub fn with_rules(rules: Vec<DenyRule>) -> Self {
        Self { rules }
    }

    /// Add prefixes denied by the security policy.
    pub fn deny_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules.extend(
            prefixes
                .into_iter()
                .map(|p| DenyRule::new(p, DangerousCapability::PolicyDenied)),
        );
        self
    }

    pub fn rules(&self) -> &[DenyRule] {
        &self.rules
    }

    /// The first rule matching `symbol`, in any legal spelling.
    pub fn classify(&self, symbol: &str) -> Option<DangerousCapability> {
        let symbol = normalize_symbol(symbol);
        self.rules
            .iter()
            .find(|r| r.matches(&symbol))
            .map(|r| r.capability)
    }

    /// Every finding in the module, in declaration order.
    pub fn scan(&self, module: &CodeModule) -> Vec<ScanFinding> {
        let mut findings = Vec::new();

        for decl in &module.types {
            let base = decl.base_type.iter().cloned();
            let refs = decl.references.iter().map(|r| r.signature());

            for symbol in base.chain(refs) {
                if let Some(capability) = self.classify(&symbol) {
                    findings.push(ScanFinding {
                        module: module.name.clone(),
                        type_name: decl.name.clone(),
                        symbol,
                        capability,
                    });
                }
            }
        }

        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{MethodRef, TypeDecl};

    fn module_with(base: Option<&str>, refs: &[(&str, &str)]) -> CodeModule {
        CodeModule {
            version: 1,
            name: "suspect".to_string(),
            types: vec![TypeDecl {
                name: "Suspect".to_string(),
                base_type: base.map(str::to_string),
                implements: vec![],
                methods: vec![],
                references: refs
                    .iter()
                    .map(|(owner, method)| MethodRef {
                        owner: owner.to_string(),
                        method: method.to_string(),
                    })
                    .collect(),
            }],
        }
    }

    #[test]
    fn test_clean_module() {
        let module = module_with(
            Some("ModBehaviour"),
            &[("modlink::ModContext", "publish"), ("std::fs", "read_to_string")],
        );
        assert!(CapabilityScanner::default().scan(&module).is_empty());
    }

    #[test]
    fn test_denylisted_references() {
        let module = module_with(
            Some("ModBehaviour"),
            &[
                ("std::process::Command", "spawn"),
                ("std::fs", "remove_dir_all"),
                ("libloading::Library", "new"),
                ("::std::process::Command", "spawn"),
                ("core :: ptr", "write"),
                ("::alloc::alloc", "alloc"),
            ],
        );
        let findings = CapabilityScanner::default().scan(&module);
        let caps: Vec<_> = findings.iter().map(|f| f.capability).collect();
        assert_eq!(
            caps,
            vec![
                DangerousCapability::ProcessSpawn,
                DangerousCapability::FileDeletion,
                DangerousCapability::DynamicCodeLoading,
                DangerousCapability::ProcessSpawn,
                DangerousCapability::MemoryInterop,
                DangerousCapability::MemoryInterop,
            ]
        );
        assert_eq!(findings[1].symbol, "std::fs::remove_dir_all");
        assert_eq!(findings[3].symbol, "::std::process::Command::spawn");
    }

    #[test]
    fn test_normalize_symbol() {
        assert_eq!(normalize_symbol("::std::fs::remove_file"), "std::fs::remove_file");
        assert_eq!(normalize_symbol("std :: env :: set_var"), "std::env::set_var");
        assert_eq!(normalize_symbol("core::mem::transmute"), "std::mem::transmute");
        assert_eq!(normalize_symbol("modlink::ModContext"), "modlink::ModContext");
    }

    #[test]
    fn test_denylisted_base_type() {
        let module = module_with(Some("std::alloc::System"), &[]);
        let findings = CapabilityScanner::default().scan(&module);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].capability, DangerousCapability::MemoryInterop);
    }

    #[test]
    fn test_policy_prefixes() {
        let scanner = CapabilityScanner::default().deny_prefixes(["core::net::"]);
        let module = module_with(None, &[("::std::net::TcpStream", "connect")]);
        assert_eq!(
            scanner.scan(&module)[0].capability,
            DangerousCapability::PolicyDenied
        );
    }
}
