//! Metadata Annotations
//!
//! Structured metadata attached to rules and packages, parsed from
//! `# METADATA` comment blocks. The block body is a JSON document; parsing
//! is only performed when a module actually calls the metadata built-ins.

use crate::ast::{Comment, Ref, RuleId, Value};
use crate::errors::{Error, ErrorCode};
use crate::location::Location;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Annotation scope: applies to the next rule.
pub const SCOPE_RULE: &str = "rule";
/// Annotation scope: applies to all rules with the same path.
pub const SCOPE_DOCUMENT: &str = "document";
/// Annotation scope: applies to the enclosing package.
pub const SCOPE_PACKAGE: &str = "package";
/// Annotation scope: applies to the package and everything below it.
pub const SCOPE_SUBPACKAGES: &str = "subpackages";

fn default_scope() -> String {
    SCOPE_RULE.to_string()
}

/// A related resource link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedResource {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A schema attachment: associates a document path with a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaAnnotation {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
}

/// One parsed metadata block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotations {
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub entrypoint: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organizations: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_resources: Vec<RelatedResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schemas: Vec<SchemaAnnotation>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, serde_json::Value>,
    #[serde(skip)]
    pub location: Location,
}

impl Default for Annotations {
    fn default() -> Self {
        Annotations {
            scope: default_scope(),
            title: None,
            description: None,
            entrypoint: false,
            organizations: Vec::new(),
            authors: Vec::new(),
            related_resources: Vec::new(),
            schemas: Vec::new(),
            custom: BTreeMap::new(),
            location: Location::default(),
        }
    }
}

impl Annotations {
    /// Serialize this annotation block into a policy value, as exposed by
    /// the metadata built-ins.
    pub fn to_value(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(json) => Value::from_json(&json),
            Err(_) => Value::Null,
        }
    }
}

/// The marker line opening a metadata block.
const METADATA_MARKER: &str = "METADATA";

/// Parse `# METADATA` blocks out of a module's comments. A block is the
/// marker comment followed by contiguous comment lines holding a JSON
/// document. Malformed blocks produce parse errors.
pub fn parse_metadata_blocks(comments: &[Comment]) -> Result<Vec<Annotations>, Vec<Error>> {
    let mut out = Vec::new();
    let mut errors = Vec::new();

    let mut i = 0;
    while i < comments.len() {
        if comments[i].text.trim() != METADATA_MARKER {
            i += 1;
            continue;
        }
        let marker = &comments[i];
        let mut body = String::new();
        let mut row = marker.location.row;
        i += 1;
        while i < comments.len() && comments[i].location.row == row + 1 {
            body.push_str(&comments[i].text);
            body.push('\n');
            row = comments[i].location.row;
            i += 1;
        }

        match serde_json::from_str::<Annotations>(&body) {
            Ok(mut a) => {
                a.location = marker.location.clone();
                out.push(a);
            }
            Err(e) => errors.push(Error::new(
                ErrorCode::ParseErr,
                Some(marker.location.clone()),
                format!("invalid metadata block: {e}"),
            )),
        }
    }

    if errors.is_empty() {
        Ok(out)
    } else {
        Err(errors)
    }
}

/// An annotation paired with the path it applies to, used when serializing
/// the metadata chain.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationRef {
    pub path: Ref,
    pub annotations: Annotations,
}

impl AnnotationRef {
    /// The chain-entry value: `{"path": "...", "annotations": {...}}`.
    pub fn to_value(&self) -> Value {
        Value::Object(vec![
            (
                crate::ast::Term::string("path"),
                crate::ast::Term::new(Value::String(self.path.to_string())),
            ),
            (
                crate::ast::Term::string("annotations"),
                crate::ast::Term::new(self.annotations.to_value()),
            ),
        ])
    }
}

/// Annotations indexed by the entity they apply to.
#[derive(Debug, Clone, Default)]
pub struct AnnotationSet {
    by_rule: BTreeMap<RuleId, Vec<Annotations>>,
    by_module: BTreeMap<usize, Vec<Annotations>>,
}

impl AnnotationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_to_rule(&mut self, id: RuleId, annotations: Annotations) {
        self.by_rule.entry(id).or_default().push(annotations);
    }

    pub fn attach_to_module(&mut self, module: usize, annotations: Annotations) {
        self.by_module.entry(module).or_default().push(annotations);
    }

    /// Annotations scoped to a rule.
    pub fn for_rule(&self, id: RuleId) -> &[Annotations] {
        self.by_rule.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Annotations scoped to a module's package.
    pub fn for_module(&self, module: usize) -> &[Annotations] {
        self.by_module.get(&module).map_or(&[], Vec::as_slice)
    }

    /// The metadata chain for a rule: rule-scoped annotations first, then
    /// the enclosing package's annotations.
    pub fn chain(&self, id: RuleId, rule_path: &Ref, package_path: &Ref) -> Vec<AnnotationRef> {
        let mut out = Vec::new();
        for a in self.for_rule(id) {
            out.push(AnnotationRef {
                path: rule_path.clone(),
                annotations: a.clone(),
            });
        }
        for a in self.for_module(id.module) {
            out.push(AnnotationRef {
                path: package_path.clone(),
                annotations: a.clone(),
            });
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.by_rule.is_empty() && self.by_module.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(text: &str, row: usize) -> Comment {
        Comment {
            text: text.to_string(),
            location: Location::new("policy.rego", row, 1),
        }
    }

    #[test]
    fn test_parse_single_block() {
        let comments = vec![
            comment("METADATA", 1),
            comment("{\"title\": \"Allow rule\",", 2),
            comment(" \"scope\": \"document\"}", 3),
        ];
        let blocks = parse_metadata_blocks(&comments).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].title.as_deref(), Some("Allow rule"));
        assert_eq!(blocks[0].scope, "document");
        assert_eq!(blocks[0].location.row, 1);
    }

    #[test]
    fn test_parse_defaults_scope_to_rule() {
        let comments = vec![comment("METADATA", 1), comment("{\"title\": \"t\"}", 2)];
        let blocks = parse_metadata_blocks(&comments).unwrap();
        assert_eq!(blocks[0].scope, SCOPE_RULE);
    }

    #[test]
    fn test_parse_skips_plain_comments() {
        let comments = vec![comment("just a note", 1), comment("another", 2)];
        let blocks = parse_metadata_blocks(&comments).unwrap();
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_malformed_block_is_parse_error() {
        let comments = vec![comment("METADATA", 1), comment("{not json", 2)];
        let errs = parse_metadata_blocks(&comments).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].code, ErrorCode::ParseErr);
    }

    #[test]
    fn test_annotation_value_shape() {
        let a = Annotations {
            title: Some("t".to_string()),
            ..Default::default()
        };
        let v = a.to_value();
        let json = v.to_json().unwrap();
        assert_eq!(json["title"], "t");
        assert_eq!(json["scope"], "rule");
    }

    #[test]
    fn test_chain_order() {
        let mut set = AnnotationSet::new();
        let id = RuleId::new(0, 0);
        set.attach_to_rule(
            id,
            Annotations {
                title: Some("rule level".to_string()),
                ..Default::default()
            },
        );
        set.attach_to_module(
            0,
            Annotations {
                scope: SCOPE_PACKAGE.to_string(),
                title: Some("package level".to_string()),
                ..Default::default()
            },
        );

        let rule_path = Ref::dotted(&["data", "a", "p"]);
        let pkg_path = Ref::dotted(&["data", "a"]);
        let chain = set.chain(id, &rule_path, &pkg_path);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].annotations.title.as_deref(), Some("rule level"));
        assert_eq!(chain[1].annotations.title.as_deref(), Some("package level"));
    }
}
