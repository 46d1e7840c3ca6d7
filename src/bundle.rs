//! Bundle Model
//!
//! The in-memory representation of a policy bundle: a manifest declaring
//! roots and resolvers, parsed modules keyed by URL, and base data.
//! Reading and writing the archive format is an external concern.

use crate::ast::{Module, ModuleSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A Wasm resolver entry in the manifest: which module answers which
/// entrypoint. Stable across implementations for downstream caching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WasmResolver {
    pub entrypoint: String,
    pub module: String,
}

/// A bundle manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roots: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wasm_resolvers: Vec<WasmResolver>,
}

impl Manifest {
    /// Declared roots; an absent declaration owns everything.
    pub fn roots(&self) -> Vec<String> {
        match &self.roots {
            Some(roots) => roots.clone(),
            None => vec![String::new()],
        }
    }

    /// Add a root if not already declared.
    pub fn add_root(&mut self, root: &str) {
        let roots = self.roots.get_or_insert_with(Vec::new);
        if !roots.iter().any(|r| r == root) {
            roots.push(root.to_string());
        }
    }

    /// Check that no root is a prefix of another.
    pub fn validate(&self) -> Result<(), String> {
        let roots = self.roots();
        for (i, a) in roots.iter().enumerate() {
            for b in roots.iter().skip(i + 1) {
                if path_overlaps(a, b) {
                    return Err(format!("manifest roots {a} and {b} overlap"));
                }
            }
        }
        Ok(())
    }
}

fn path_overlaps(a: &str, b: &str) -> bool {
    let a: Vec<&str> = a.split('/').filter(|p| !p.is_empty()).collect();
    let b: Vec<&str> = b.split('/').filter(|p| !p.is_empty()).collect();
    let n = a.len().min(b.len());
    a[..n] == b[..n]
}

/// A parsed module carried in a bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleFile {
    /// Unique path of the module within the bundle
    pub url: String,
    pub parsed: Module,
}

/// An in-memory bundle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bundle {
    pub manifest: Manifest,
    pub modules: Vec<ModuleFile>,
    /// Base documents shipped with the bundle
    pub data: serde_json::Value,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// The modules as a compiler input set, keyed by URL.
    pub fn module_set(&self) -> ModuleSet {
        self.modules
            .iter()
            .map(|m| (m.url.clone(), m.parsed.clone()))
            .collect()
    }

    /// Check whether a module with the given URL exists.
    pub fn has_url(&self, url: &str) -> bool {
        self.modules.iter().any(|m| m.url == url)
    }

    /// Sort modules by URL (stable output ordering).
    pub fn sort_modules_by_url(&mut self) {
        self.modules.sort_by(|a, b| a.url.cmp(&b.url));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::builders::ModuleBuilder;

    #[test]
    fn test_default_manifest_owns_everything() {
        let m = Manifest::default();
        assert_eq!(m.roots(), vec![String::new()]);
    }

    #[test]
    fn test_add_root_dedupes() {
        let mut m = Manifest {
            roots: Some(vec!["a/b".to_string()]),
            ..Default::default()
        };
        m.add_root("partial");
        m.add_root("partial");
        assert_eq!(m.roots().len(), 2);
    }

    #[test]
    fn test_overlapping_roots_invalid() {
        let m = Manifest {
            roots: Some(vec!["a".to_string(), "a/b".to_string()]),
            ..Default::default()
        };
        assert!(m.validate().is_err());

        let m = Manifest {
            roots: Some(vec!["a/b".to_string(), "a/c".to_string()]),
            ..Default::default()
        };
        assert!(m.validate().is_ok());
    }

    #[test]
    fn test_manifest_json_shape() {
        let m = Manifest {
            revision: Some("abc".to_string()),
            roots: Some(vec!["a".to_string()]),
            metadata: BTreeMap::new(),
            wasm_resolvers: vec![WasmResolver {
                entrypoint: "a/p".to_string(),
                module: "/policy.wasm".to_string(),
            }],
        };
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["revision"], "abc");
        assert_eq!(json["wasm_resolvers"][0]["entrypoint"], "a/p");
    }

    #[test]
    fn test_module_set_keyed_by_url() {
        let mut b = Bundle::new();
        b.modules.push(ModuleFile {
            url: "z.rego".to_string(),
            parsed: ModuleBuilder::new(&["z"]).build(),
        });
        b.modules.push(ModuleFile {
            url: "a.rego".to_string(),
            parsed: ModuleBuilder::new(&["a"]).build(),
        });
        let set = b.module_set();
        assert_eq!(set.len(), 2);
        assert!(set.contains_key("a.rego"));

        b.sort_modules_by_url();
        assert_eq!(b.modules[0].url, "a.rego");
    }
}
