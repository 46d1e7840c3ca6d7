//! JSON-schema loading for external document types.
//!
//! Consumes JSON-schema-like documents and produces the equivalent
//! structural types. Definitions referenced via `$ref` are cached so that
//! self-referential schemas terminate (the cycle widens to `any`). Remote
//! references are gated by the capability-configured network allow-list;
//! fetching itself is an external concern, so even permitted hosts must
//! have their documents registered up front.

use super::{DynamicProperty, StaticProperty, Type};
use crate::ast::{Ref, Value};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use thiserror::Error;

/// Maps document paths (`input`, `data.servers`, ...) to JSON schemas.
#[derive(Debug, Clone, Default)]
pub struct SchemaSet {
    schemas: BTreeMap<String, Json>,
}

impl SchemaSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the schema for the `input` document.
    pub fn put_input(&mut self, schema: Json) {
        self.schemas.insert("input".to_string(), schema);
    }

    /// Register a schema for an arbitrary document path.
    pub fn put(&mut self, path: &Ref, schema: Json) {
        self.schemas.insert(path.to_string(), schema);
    }

    /// Look up a schema by its path string.
    pub fn get(&self, path: &str) -> Option<&Json> {
        self.schemas.get(path)
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Iterate registered (path, schema) pairs in sorted path order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Json)> {
        self.schemas.iter()
    }
}

/// Errors produced while converting a schema into a type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("unsupported schema type: {0}")]
    UnsupportedType(String),

    #[error("invalid schema: {0}")]
    Invalid(String),

    #[error("unresolvable schema reference: {0}")]
    UnresolvableRef(String),

    #[error("remote schema reference {0} not permitted by capabilities")]
    RemoteRefNotAllowed(String),

    #[error("remote schema reference {0} cannot be fetched; register the document in the schema set")]
    RemoteRefUnavailable(String),
}

/// Convert a JSON schema into the equivalent structural type.
///
/// `allow_net` is the capability-configured host allow-list: `None` permits
/// nothing, which makes any remote `$ref` an error.
pub fn type_from_schema(schema: &Json, allow_net: Option<&[String]>) -> Result<Type, SchemaError> {
    let mut resolver = Resolver {
        root: schema,
        allow_net,
        cache: BTreeMap::new(),
    };
    resolver.convert(schema)
}

struct Resolver<'a> {
    root: &'a Json,
    allow_net: Option<&'a [String]>,
    /// `None` marks a definition currently being resolved; hitting it again
    /// means the schema is self-referential and widens to `any`.
    cache: BTreeMap<String, Option<Type>>,
}

impl<'a> Resolver<'a> {
    fn convert(&mut self, schema: &Json) -> Result<Type, SchemaError> {
        match schema {
            Json::Bool(true) => return Ok(Type::Any),
            Json::Bool(false) => return Ok(Type::Or { of: Vec::new() }),
            Json::Object(_) => {}
            other => {
                return Err(SchemaError::Invalid(format!(
                    "expected schema object, got {other}"
                )))
            }
        }

        if let Some(reference) = schema.get("$ref").and_then(Json::as_str) {
            return self.resolve_ref(reference);
        }

        if let Some(any_of) = schema.get("anyOf").or_else(|| schema.get("oneOf")) {
            return self.convert_any_of(any_of);
        }

        if let Some(all_of) = schema.get("allOf") {
            return self.convert_all_of(all_of);
        }

        if let Some(values) = schema.get("enum").and_then(Json::as_array) {
            let members: Vec<Type> = values
                .iter()
                .map(|v| super::type_of_value(&Value::from_json(v)))
                .collect();
            return Ok(Type::or_of(members));
        }

        match schema.get("type") {
            None => Ok(Type::Any),
            Some(Json::String(name)) => self.convert_typed(name, schema),
            Some(Json::Array(names)) => {
                let mut members = Vec::new();
                for n in names {
                    let name = n
                        .as_str()
                        .ok_or_else(|| SchemaError::Invalid("non-string type name".to_string()))?;
                    members.push(self.convert_typed(name, schema)?);
                }
                Ok(Type::or_of(members))
            }
            Some(other) => Err(SchemaError::Invalid(format!("invalid type keyword: {other}"))),
        }
    }

    fn convert_typed(&mut self, name: &str, schema: &Json) -> Result<Type, SchemaError> {
        match name {
            "null" => Ok(Type::Null),
            "boolean" => Ok(Type::Boolean),
            "number" | "integer" => Ok(Type::Number),
            "string" => Ok(Type::String),
            "array" => self.convert_array(schema),
            "object" => self.convert_object(schema),
            other => Err(SchemaError::UnsupportedType(other.to_string())),
        }
    }

    fn convert_array(&mut self, schema: &Json) -> Result<Type, SchemaError> {
        match schema.get("items") {
            None => Ok(Type::array_of(Type::Any)),
            Some(Json::Array(items)) => {
                let out: Result<Vec<Type>, SchemaError> =
                    items.iter().map(|i| self.convert(i)).collect();
                Ok(Type::tuple(out?))
            }
            Some(item) => Ok(Type::array_of(self.convert(item)?)),
        }
    }

    fn convert_object(&mut self, schema: &Json) -> Result<Type, SchemaError> {
        let mut static_props = Vec::new();
        if let Some(props) = schema.get("properties").and_then(Json::as_object) {
            for (key, prop_schema) in props {
                static_props.push(StaticProperty {
                    key: Value::String(key.clone()),
                    value: self.convert(prop_schema)?,
                });
            }
        }
        static_props.sort();

        let dynamic = match schema.get("additionalProperties") {
            Some(Json::Bool(false)) => None,
            Some(Json::Bool(true)) | None => {
                if static_props.is_empty() {
                    Some(Box::new(DynamicProperty {
                        key: Type::Any,
                        value: Type::Any,
                    }))
                } else {
                    None
                }
            }
            Some(additional) => Some(Box::new(DynamicProperty {
                key: Type::String,
                value: self.convert(additional)?,
            })),
        };

        Ok(Type::Object {
            static_props,
            dynamic,
        })
    }

    fn convert_any_of(&mut self, schemas: &Json) -> Result<Type, SchemaError> {
        let list = schemas
            .as_array()
            .ok_or_else(|| SchemaError::Invalid("anyOf must be an array".to_string()))?;
        let mut out: Option<Type> = None;
        for s in list {
            let t = self.convert(s)?;
            out = Some(match out.take() {
                Some(acc) => Type::union(acc, t),
                None => t,
            });
        }
        out.ok_or_else(|| SchemaError::Invalid("anyOf must not be empty".to_string()))
    }

    fn convert_all_of(&mut self, schemas: &Json) -> Result<Type, SchemaError> {
        let list = schemas
            .as_array()
            .ok_or_else(|| SchemaError::Invalid("allOf must be an array".to_string()))?;
        let mut out: Option<Type> = None;
        for s in list {
            let t = self.convert(s)?;
            out = Some(match out.take() {
                Some(acc) => merge_types(acc, t),
                None => t,
            });
        }
        out.ok_or_else(|| SchemaError::Invalid("allOf must not be empty".to_string()))
    }

    fn resolve_ref(&mut self, reference: &str) -> Result<Type, SchemaError> {
        if reference.contains("://") {
            return self.remote_ref(reference);
        }

        match self.cache.get(reference) {
            // In progress: the schema refers to itself.
            Some(None) => return Ok(Type::Any),
            Some(Some(t)) => return Ok(t.clone()),
            None => {}
        }

        let pointer = reference
            .strip_prefix('#')
            .ok_or_else(|| SchemaError::UnresolvableRef(reference.to_string()))?;
        let target = self
            .root
            .pointer(pointer)
            .ok_or_else(|| SchemaError::UnresolvableRef(reference.to_string()))?;

        self.cache.insert(reference.to_string(), None);
        let t = self.convert(target)?;
        self.cache.insert(reference.to_string(), Some(t.clone()));
        Ok(t)
    }

    fn remote_ref(&self, reference: &str) -> Result<Type, SchemaError> {
        let host = reference
            .split("://")
            .nth(1)
            .and_then(|rest| rest.split('/').next())
            .unwrap_or_default();
        let allowed = self
            .allow_net
            .is_some_and(|hosts| hosts.iter().any(|h| h == host));
        if allowed {
            Err(SchemaError::RemoteRefUnavailable(reference.to_string()))
        } else {
            Err(SchemaError::RemoteRefNotAllowed(reference.to_string()))
        }
    }
}

/// Intersection-flavored merge used by `allOf`: objects combine their
/// properties; everything else widens to the union.
fn merge_types(a: Type, b: Type) -> Type {
    match (a, b) {
        (
            Type::Object {
                static_props: mut pa,
                dynamic: da,
            },
            Type::Object {
                static_props: pb,
                dynamic: db,
            },
        ) => {
            for prop in pb {
                match pa.iter_mut().find(|p| p.key == prop.key) {
                    Some(existing) => {
                        let merged =
                            merge_types(existing.value.clone(), prop.value);
                        existing.value = merged;
                    }
                    None => pa.push(prop),
                }
            }
            pa.sort();
            let dynamic = match (da, db) {
                (Some(x), Some(y)) => Some(Box::new(DynamicProperty {
                    key: Type::union(x.key, y.key),
                    value: Type::union(x.value, y.value),
                })),
                (x, None) => x,
                (None, y) => y,
            };
            Type::Object {
                static_props: pa,
                dynamic,
            }
        }
        (a, b) if a == b => a,
        (a, b) => Type::union(a, b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_schema() {
        let t = type_from_schema(&json!({"type": "string"}), None).unwrap();
        assert_eq!(t, Type::String);

        let t = type_from_schema(&json!({"type": "integer"}), None).unwrap();
        assert_eq!(t, Type::Number);
    }

    #[test]
    fn test_object_schema_with_properties() {
        let schema = json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "age": {"type": "number"}
            },
            "additionalProperties": false
        });
        let t = type_from_schema(&schema, None).unwrap();
        assert_eq!(
            t.select_constant(&Value::String("name".into())),
            Some(Type::String)
        );
        assert_eq!(
            t.select_constant(&Value::String("age".into())),
            Some(Type::Number)
        );
        assert_eq!(t.select_constant(&Value::String("other".into())), None);
    }

    #[test]
    fn test_array_schema() {
        let t = type_from_schema(&json!({"type": "array", "items": {"type": "string"}}), None)
            .unwrap();
        assert_eq!(t, Type::array_of(Type::String));

        let t = type_from_schema(
            &json!({"type": "array", "items": [{"type": "string"}, {"type": "number"}]}),
            None,
        )
        .unwrap();
        assert_eq!(t, Type::tuple(vec![Type::String, Type::Number]));
    }

    #[test]
    fn test_any_of_widens() {
        let t = type_from_schema(
            &json!({"anyOf": [{"type": "string"}, {"type": "number"}]}),
            None,
        )
        .unwrap();
        assert_eq!(t, Type::or_of(vec![Type::String, Type::Number]));
    }

    #[test]
    fn test_all_of_merges_objects() {
        let schema = json!({
            "allOf": [
                {"type": "object", "properties": {"a": {"type": "string"}}, "additionalProperties": false},
                {"type": "object", "properties": {"b": {"type": "number"}}, "additionalProperties": false}
            ]
        });
        let t = type_from_schema(&schema, None).unwrap();
        assert_eq!(
            t.select_constant(&Value::String("a".into())),
            Some(Type::String)
        );
        assert_eq!(
            t.select_constant(&Value::String("b".into())),
            Some(Type::Number)
        );
    }

    #[test]
    fn test_local_ref_resolution() {
        let schema = json!({
            "definitions": {
                "name": {"type": "string"}
            },
            "type": "object",
            "properties": {
                "user": {"$ref": "#/definitions/name"}
            },
            "additionalProperties": false
        });
        let t = type_from_schema(&schema, None).unwrap();
        assert_eq!(
            t.select_constant(&Value::String("user".into())),
            Some(Type::String)
        );
    }

    #[test]
    fn test_self_referential_schema_terminates() {
        let schema = json!({
            "definitions": {
                "node": {
                    "type": "object",
                    "properties": {
                        "next": {"$ref": "#/definitions/node"}
                    },
                    "additionalProperties": false
                }
            },
            "$ref": "#/definitions/node"
        });
        let t = type_from_schema(&schema, None).unwrap();
        // The cycle widens to any.
        assert_eq!(
            t.select_constant(&Value::String("next".into())),
            Some(Type::Any)
        );
    }

    #[test]
    fn test_remote_ref_gated_by_allow_list() {
        let schema = json!({"$ref": "https://schemas.example.com/user.json"});

        let err = type_from_schema(&schema, None).unwrap_err();
        assert!(matches!(err, SchemaError::RemoteRefNotAllowed(_)));

        let hosts = vec!["schemas.example.com".to_string()];
        let err = type_from_schema(&schema, Some(&hosts)).unwrap_err();
        assert!(matches!(err, SchemaError::RemoteRefUnavailable(_)));
    }

    #[test]
    fn test_boolean_schemas() {
        assert_eq!(type_from_schema(&json!(true), None).unwrap(), Type::Any);
        assert_eq!(
            type_from_schema(&json!(false), None).unwrap(),
            Type::Or { of: vec![] }
        );
    }

    #[test]
    fn test_enum_schema() {
        let t = type_from_schema(&json!({"enum": ["a", "b", 3]}), None).unwrap();
        assert_eq!(t, Type::or_of(vec![Type::String, Type::Number]));
    }

    #[test]
    fn test_schema_set_paths() {
        let mut set = SchemaSet::new();
        set.put_input(json!({"type": "object"}));
        set.put(&Ref::dotted(&["data", "servers"]), json!({"type": "array"}));

        assert!(set.get("input").is_some());
        assert!(set.get("data.servers").is_some());
        assert!(set.get("data.other").is_none());
    }
}
