//! Capabilities
//!
//! A capabilities document declares which built-ins, language features and
//! future keywords a program may use, the network allow-list for schema
//! fetching, and the Wasm ABI versions a consumer supports. The compiler
//! checks programs against a caller-supplied document and reports the
//! subset a compiled program actually requires.

use crate::builtins;
use crate::types::Type;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Feature flag: the newer language variant is the module default.
pub const FEATURE_REGO_V1: &str = "rego_v1";
/// Feature flag: the `rego.v1` import is available.
pub const FEATURE_REGO_V1_IMPORT: &str = "rego_v1_import";
/// Feature flag: rules may be declared with general refs in their heads.
pub const FEATURE_RULE_HEAD_REFS: &str = "rule_head_refs";
/// Feature flag: rule head refs may carry string prefixes.
pub const FEATURE_RULE_HEAD_REF_STRING_PREFIXES: &str = "rule_head_ref_string_prefixes";

const ALL_FEATURES: &[&str] = &[
    FEATURE_REGO_V1,
    FEATURE_REGO_V1_IMPORT,
    FEATURE_RULE_HEAD_REFS,
    FEATURE_RULE_HEAD_REF_STRING_PREFIXES,
];

/// A built-in declaration as carried in a capabilities document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltinDecl {
    pub name: String,
    pub decl: Type,
}

/// A Wasm ABI version pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WasmAbiVersion {
    pub version: u32,
    #[serde(default)]
    pub minor_version: u32,
}

/// A capabilities document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub builtins: Vec<BuiltinDecl>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub future_keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_net: Option<Vec<String>>,
    #[serde(default)]
    pub wasm_abi_versions: Vec<WasmAbiVersion>,
}

impl Default for Capabilities {
    /// The full capability set of this compiler build.
    fn default() -> Self {
        let builtins = builtins::builtins()
            .values()
            .map(|b| BuiltinDecl {
                name: b.name.to_string(),
                decl: b.decl.clone(),
            })
            .collect();
        Capabilities {
            builtins,
            features: ALL_FEATURES.iter().map(ToString::to_string).collect(),
            future_keywords: crate::ast::FUTURE_KEYWORDS
                .iter()
                .map(ToString::to_string)
                .collect(),
            allow_net: None,
            wasm_abi_versions: vec![WasmAbiVersion {
                version: 1,
                minor_version: 2,
            }],
        }
    }
}

impl Capabilities {
    /// Look up a declared built-in by name.
    pub fn builtin(&self, name: &str) -> Option<&BuiltinDecl> {
        self.builtins.iter().find(|b| b.name == name)
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    pub fn has_future_keyword(&self, keyword: &str) -> bool {
        self.future_keywords.iter().any(|k| k == keyword)
    }
}

/// The capabilities a compiled program requires: populated by the final
/// compiler pass and serialized for consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequiredCapabilities {
    pub builtins: BTreeSet<String>,
    pub features: BTreeSet<String>,
    pub future_keywords: BTreeSet<String>,
}

impl RequiredCapabilities {
    pub fn is_empty(&self) -> bool {
        self.builtins.is_empty() && self.features.is_empty() && self.future_keywords.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_includes_registry() {
        let caps = Capabilities::default();
        assert!(caps.builtin("eq").is_some());
        assert!(caps.builtin("walk").is_some());
        assert!(caps.builtin("nope").is_none());
    }

    #[test]
    fn test_default_features() {
        let caps = Capabilities::default();
        assert!(caps.has_feature(FEATURE_REGO_V1));
        assert!(caps.has_future_keyword("every"));
        assert!(!caps.has_feature("made_up"));
    }

    #[test]
    fn test_round_trips_through_json() {
        let caps = Capabilities::default();
        let json = serde_json::to_string(&caps).unwrap();
        let back: Capabilities = serde_json::from_str(&json).unwrap();
        assert_eq!(back.builtins.len(), caps.builtins.len());
        assert_eq!(back.features, caps.features);
    }

    #[test]
    fn test_restricted_document() {
        let caps = Capabilities {
            builtins: vec![BuiltinDecl {
                name: "eq".to_string(),
                decl: Type::func(vec![Type::Any, Type::Any], Type::Any),
            }],
            features: vec![],
            future_keywords: vec![],
            allow_net: Some(vec!["schemas.example.com".to_string()]),
            wasm_abi_versions: vec![],
        };
        assert!(caps.builtin("eq").is_some());
        assert!(caps.builtin("count").is_none());
        assert!(!caps.has_feature(FEATURE_REGO_V1));
    }
}
