//! # Structural Type System
//!
//! A structural type lattice for policy values: bottom is the empty `Or`,
//! top is `Any`. Types are inferred for terms, checked against function
//! declarations, and loaded from JSON schemas (see [`schema`]).
//!
//! ```text
//! AST (rules in dependency order) -> [Type Checker] -> TypeEnv + errors
//! ```

use crate::ast::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod check;
pub mod schema;

pub use check::{TypeChecker, TypeEnv};
pub use schema::{SchemaError, SchemaSet};

/// A structural type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Type {
    /// Top: any value
    Any,
    Null,
    Boolean,
    Number,
    String,
    /// Arrays with optional positional (tuple) types and a dynamic element type
    Array {
        #[serde(default, rename = "static", skip_serializing_if = "Vec::is_empty")]
        static_items: Vec<Type>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dynamic: Option<Box<Type>>,
    },
    /// Objects with statically known properties and a dynamic key/value part
    Object {
        #[serde(default, rename = "static", skip_serializing_if = "Vec::is_empty")]
        static_props: Vec<StaticProperty>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dynamic: Option<Box<DynamicProperty>>,
    },
    /// Sets of a homogeneous element type
    Set { of: Box<Type> },
    /// Function signatures; `result` of `None` marks void built-ins
    Function {
        args: Vec<Type>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Box<Type>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variadic: Option<Box<Type>>,
    },
    /// A union of alternatives, kept sorted and deduplicated
    Or { of: Vec<Type> },
}

/// A statically known object property.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StaticProperty {
    pub key: Value,
    pub value: Type,
}

/// The dynamic key/value part of an object type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DynamicProperty {
    pub key: Type,
    pub value: Type,
}

impl Type {
    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    /// An array of a single dynamic element type.
    pub fn array_of(elem: Type) -> Type {
        Type::Array {
            static_items: Vec::new(),
            dynamic: Some(Box::new(elem)),
        }
    }

    /// A tuple-shaped array.
    pub fn tuple(items: Vec<Type>) -> Type {
        Type::Array {
            static_items: items,
            dynamic: None,
        }
    }

    /// A set of an element type.
    pub fn set_of(elem: Type) -> Type {
        Type::Set { of: Box::new(elem) }
    }

    /// An object with only a dynamic part.
    pub fn object_dynamic(key: Type, value: Type) -> Type {
        Type::Object {
            static_props: Vec::new(),
            dynamic: Some(Box::new(DynamicProperty { key, value })),
        }
    }

    /// An object with static properties only.
    pub fn object_static(props: Vec<StaticProperty>) -> Type {
        Type::Object {
            static_props: props,
            dynamic: None,
        }
    }

    /// A function signature.
    pub fn func(args: Vec<Type>, result: Type) -> Type {
        Type::Function {
            args,
            result: Some(Box::new(result)),
            variadic: None,
        }
    }

    /// A void function (produces no result).
    pub fn void_func(args: Vec<Type>) -> Type {
        Type::Function {
            args,
            result: None,
            variadic: None,
        }
    }

    /// A variadic function signature.
    pub fn variadic_func(args: Vec<Type>, variadic: Type, result: Type) -> Type {
        Type::Function {
            args,
            result: Some(Box::new(result)),
            variadic: Some(Box::new(variadic)),
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn is_any(&self) -> bool {
        matches!(self, Type::Any)
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Type::Function { .. })
    }

    /// The declared arity of a function type.
    pub fn arity(&self) -> Option<usize> {
        match self {
            Type::Function { args, .. } => Some(args.len()),
            _ => None,
        }
    }

    /// The result type of a function type. `Some(None)` marks void.
    pub fn function_result(&self) -> Option<Option<&Type>> {
        match self {
            Type::Function { result, .. } => Some(result.as_deref()),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Lattice operations
    // ------------------------------------------------------------------

    /// Smallest supertype of `a` and `b`. Sets and arrays widen
    /// componentwise; anything else unions into `Or`.
    pub fn union(a: Type, b: Type) -> Type {
        if a == b {
            return a;
        }
        match (a, b) {
            (Type::Any, _) | (_, Type::Any) => Type::Any,
            (Type::Set { of: a }, Type::Set { of: b }) => Type::set_of(Type::union(*a, *b)),
            (
                Type::Array {
                    static_items: sa,
                    dynamic: da,
                },
                Type::Array {
                    static_items: sb,
                    dynamic: db,
                },
            ) => Self::union_arrays(sa, da, sb, db),
            (a, b) => {
                let mut members = Vec::new();
                Self::flatten_into(a, &mut members);
                Self::flatten_into(b, &mut members);
                Self::or_of(members)
            }
        }
    }

    fn union_arrays(
        sa: Vec<Type>,
        da: Option<Box<Type>>,
        sb: Vec<Type>,
        db: Option<Box<Type>>,
    ) -> Type {
        if sa.len() == sb.len() {
            let static_items: Vec<Type> = sa
                .into_iter()
                .zip(sb)
                .map(|(x, y)| Type::union(x, y))
                .collect();
            let dynamic = match (da, db) {
                (Some(x), Some(y)) => Some(Box::new(Type::union(*x, *y))),
                (Some(x), None) | (None, Some(x)) => Some(x),
                (None, None) => None,
            };
            Type::Array {
                static_items,
                dynamic,
            }
        } else {
            // Tuple shapes disagree: widen to a dynamic array over the
            // union of every element type.
            let mut elem: Option<Type> = None;
            let mut feed = |t: Type| {
                elem = Some(match elem.take() {
                    Some(acc) => Type::union(acc, t),
                    None => t,
                });
            };
            for t in sa.into_iter().chain(sb) {
                feed(t);
            }
            if let Some(d) = da {
                feed(*d);
            }
            if let Some(d) = db {
                feed(*d);
            }
            Type::array_of(elem.unwrap_or(Type::Any))
        }
    }

    fn flatten_into(t: Type, out: &mut Vec<Type>) {
        match t {
            Type::Or { of } => {
                for m in of {
                    Self::flatten_into(m, out);
                }
            }
            other => out.push(other),
        }
    }

    /// Normalize a list of alternatives into a type.
    pub fn or_of(mut members: Vec<Type>) -> Type {
        members.sort();
        members.dedup();
        if members.iter().any(Type::is_any) {
            return Type::Any;
        }
        match members.len() {
            0 => Type::Or { of: Vec::new() },
            1 => members.pop().unwrap_or(Type::Any),
            _ => Type::Or { of: members },
        }
    }

    /// Check whether `self` contains (is a supertype of) `other`.
    pub fn contains(&self, other: &Type) -> bool {
        if self == other || self.is_any() {
            return true;
        }
        match (self, other) {
            (_, Type::Any) => false,
            (_, Type::Or { of }) => of.iter().all(|m| self.contains(m)),
            (Type::Or { of }, _) => of.iter().any(|m| m.contains(other)),
            (Type::Set { of: a }, Type::Set { of: b }) => a.contains(b),
            (
                Type::Array {
                    static_items: sa,
                    dynamic: da,
                },
                Type::Array {
                    static_items: sb,
                    dynamic: db,
                },
            ) => {
                for (i, b) in sb.iter().enumerate() {
                    let a = sa.get(i).or(da.as_deref());
                    match a {
                        Some(a) if a.contains(b) => {}
                        _ => return false,
                    }
                }
                match (da, db) {
                    (_, None) => true,
                    (Some(a), Some(b)) => a.contains(b),
                    (None, Some(_)) => false,
                }
            }
            (
                Type::Object {
                    static_props: pa,
                    dynamic: da,
                },
                Type::Object {
                    static_props: pb,
                    dynamic: db,
                },
            ) => {
                for prop in pb {
                    let found = pa.iter().find(|p| p.key == prop.key);
                    let ok = match found {
                        Some(p) => p.value.contains(&prop.value),
                        None => da
                            .as_ref()
                            .is_some_and(|d| d.key.contains(&type_of_value(&prop.key)) && d.value.contains(&prop.value)),
                    };
                    if !ok {
                        return false;
                    }
                }
                match (da, db) {
                    (_, None) => true,
                    (Some(a), Some(b)) => a.key.contains(&b.key) && a.value.contains(&b.value),
                    (None, Some(_)) => false,
                }
            }
            (
                Type::Function {
                    args: aa,
                    result: ra,
                    ..
                },
                Type::Function {
                    args: ab,
                    result: rb,
                    ..
                },
            ) => {
                aa.len() == ab.len()
                    && aa.iter().zip(ab).all(|(x, y)| x.contains(y))
                    && match (ra, rb) {
                        (None, None) => true,
                        (Some(x), Some(y)) => x.contains(y),
                        _ => false,
                    }
            }
            _ => false,
        }
    }

    /// The type selected by a constant key, if selection is defined.
    pub fn select_constant(&self, key: &Value) -> Option<Type> {
        match self {
            Type::Any => Some(Type::Any),
            Type::Array {
                static_items,
                dynamic,
            } => {
                if let Value::Number(n) = key {
                    if let Some(i) = n.as_usize() {
                        if let Some(t) = static_items.get(i) {
                            return Some(t.clone());
                        }
                    }
                    return dynamic.as_deref().cloned();
                }
                None
            }
            Type::Object {
                static_props,
                dynamic,
            } => {
                if let Some(p) = static_props.iter().find(|p| &p.key == key) {
                    return Some(p.value.clone());
                }
                dynamic.as_ref().map(|d| d.value.clone())
            }
            Type::Set { of } => {
                if of.contains(&type_of_value(key)) || of.is_any() {
                    Some(*of.clone())
                } else {
                    None
                }
            }
            Type::Or { of } => {
                let selected: Vec<Type> = of
                    .iter()
                    .filter_map(|m| m.select_constant(key))
                    .collect();
                if selected.is_empty() {
                    None
                } else {
                    Some(Type::or_of(selected))
                }
            }
            _ => None,
        }
    }

    /// The type of values produced when iterating with a variable key.
    pub fn select_dynamic(&self) -> Option<Type> {
        match self {
            Type::Any => Some(Type::Any),
            Type::Array {
                static_items,
                dynamic,
            } => {
                let mut members: Vec<Type> = static_items.clone();
                if let Some(d) = dynamic {
                    members.push(*d.clone());
                }
                if members.is_empty() {
                    None
                } else {
                    Some(Type::or_of(members))
                }
            }
            Type::Object {
                static_props,
                dynamic,
            } => {
                let mut members: Vec<Type> =
                    static_props.iter().map(|p| p.value.clone()).collect();
                if let Some(d) = dynamic {
                    members.push(d.value.clone());
                }
                if members.is_empty() {
                    None
                } else {
                    Some(Type::or_of(members))
                }
            }
            Type::Set { of } => Some(*of.clone()),
            Type::Or { of } => {
                let selected: Vec<Type> = of.iter().filter_map(Type::select_dynamic).collect();
                if selected.is_empty() {
                    None
                } else {
                    Some(Type::or_of(selected))
                }
            }
            _ => None,
        }
    }

    /// The type of keys produced when iterating.
    pub fn keys_type(&self) -> Option<Type> {
        match self {
            Type::Any => Some(Type::Any),
            Type::Array { .. } => Some(Type::Number),
            Type::Object {
                static_props,
                dynamic,
            } => {
                let mut members: Vec<Type> = static_props
                    .iter()
                    .map(|p| type_of_value(&p.key))
                    .collect();
                if let Some(d) = dynamic {
                    members.push(d.key.clone());
                }
                if members.is_empty() {
                    None
                } else {
                    Some(Type::or_of(members))
                }
            }
            Type::Set { of } => Some(*of.clone()),
            Type::Or { of } => {
                let selected: Vec<Type> = of.iter().filter_map(Type::keys_type).collect();
                if selected.is_empty() {
                    None
                } else {
                    Some(Type::or_of(selected))
                }
            }
            _ => None,
        }
    }
}

/// The type of a ground scalar value; composites infer recursively.
pub fn type_of_value(v: &Value) -> Type {
    match v {
        Value::Null => Type::Null,
        Value::Bool(_) => Type::Boolean,
        Value::Number(_) => Type::Number,
        Value::String(_) => Type::String,
        Value::Array(items) => Type::tuple(items.iter().map(|t| type_of_value(&t.value)).collect()),
        Value::Set(items) => {
            let elems: Vec<Type> = items.iter().map(|t| type_of_value(&t.value)).collect();
            Type::set_of(Type::or_of(elems))
        }
        Value::Object(pairs) => Type::object_static(
            pairs
                .iter()
                .map(|(k, v)| StaticProperty {
                    key: k.value.clone(),
                    value: type_of_value(&v.value),
                })
                .collect(),
        ),
        _ => Type::Any,
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Any => write!(f, "any"),
            Type::Null => write!(f, "null"),
            Type::Boolean => write!(f, "boolean"),
            Type::Number => write!(f, "number"),
            Type::String => write!(f, "string"),
            Type::Array {
                static_items,
                dynamic,
            } => {
                write!(f, "array")?;
                if !static_items.is_empty() {
                    write!(f, "<")?;
                    for (i, t) in static_items.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{t}")?;
                    }
                    write!(f, ">")?;
                }
                if let Some(d) = dynamic {
                    write!(f, "[{d}]")?;
                }
                Ok(())
            }
            Type::Object {
                static_props,
                dynamic,
            } => {
                write!(f, "object")?;
                if !static_props.is_empty() {
                    write!(f, "<")?;
                    for (i, p) in static_props.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}: {}", p.key, p.value)?;
                    }
                    write!(f, ">")?;
                }
                if let Some(d) = dynamic {
                    write!(f, "[{}: {}]", d.key, d.value)?;
                }
                Ok(())
            }
            Type::Set { of } => write!(f, "set[{of}]"),
            Type::Function {
                args,
                result,
                variadic,
            } => {
                write!(f, "(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                if let Some(v) = variadic {
                    write!(f, ", {v}...")?;
                }
                write!(f, ")")?;
                match result {
                    Some(r) => write!(f, " => {r}"),
                    None => Ok(()),
                }
            }
            Type::Or { of } => {
                if of.is_empty() {
                    return write!(f, "never");
                }
                for (i, t) in of.iter().enumerate() {
                    if i > 0 {
                        write!(f, "|")?;
                    }
                    write!(f, "{t}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Term;
    use proptest::prelude::*;

    #[test]
    fn test_union_identical() {
        assert_eq!(Type::union(Type::Number, Type::Number), Type::Number);
    }

    #[test]
    fn test_union_any_absorbs() {
        assert_eq!(Type::union(Type::Any, Type::String), Type::Any);
        assert_eq!(Type::union(Type::String, Type::Any), Type::Any);
    }

    #[test]
    fn test_union_scalars_forms_or() {
        let t = Type::union(Type::Number, Type::String);
        assert_eq!(
            t,
            Type::Or {
                of: vec![Type::Number, Type::String]
            }
        );
    }

    #[test]
    fn test_union_sets_widen_componentwise() {
        let t = Type::union(Type::set_of(Type::Number), Type::set_of(Type::String));
        assert_eq!(t, Type::set_of(Type::union(Type::Number, Type::String)));
    }

    #[test]
    fn test_union_tuples_same_length() {
        let a = Type::tuple(vec![Type::Number, Type::String]);
        let b = Type::tuple(vec![Type::Number, Type::Null]);
        let t = Type::union(a, b);
        assert_eq!(
            t,
            Type::tuple(vec![Type::Number, Type::union(Type::String, Type::Null)])
        );
    }

    #[test]
    fn test_union_tuples_different_length_widen_dynamic() {
        let a = Type::tuple(vec![Type::Number]);
        let b = Type::tuple(vec![Type::Number, Type::String]);
        let t = Type::union(a, b);
        assert_eq!(t, Type::array_of(Type::union(Type::Number, Type::String)));
    }

    #[test]
    fn test_contains_or_members() {
        let t = Type::or_of(vec![Type::Number, Type::String]);
        assert!(t.contains(&Type::Number));
        assert!(!t.contains(&Type::Boolean));
        assert!(Type::Any.contains(&t));
        assert!(!t.contains(&Type::Any));
    }

    #[test]
    fn test_select_constant_object() {
        let t = Type::object_static(vec![StaticProperty {
            key: Value::String("a".into()),
            value: Type::Number,
        }]);
        assert_eq!(t.select_constant(&Value::String("a".into())), Some(Type::Number));
        assert_eq!(t.select_constant(&Value::String("b".into())), None);
    }

    #[test]
    fn test_select_dynamic_array() {
        let t = Type::array_of(Type::String);
        assert_eq!(t.select_dynamic(), Some(Type::String));
        assert_eq!(t.keys_type(), Some(Type::Number));
    }

    #[test]
    fn test_type_of_value_composites() {
        let v = Value::Array(vec![Term::int(1), Term::string("x")]);
        assert_eq!(
            type_of_value(&v),
            Type::tuple(vec![Type::Number, Type::String])
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Type::set_of(Type::Number).to_string(), "set[number]");
        assert_eq!(
            Type::func(vec![Type::Any], Type::Boolean).to_string(),
            "(any) => boolean"
        );
        assert_eq!(Type::Or { of: vec![] }.to_string(), "never");
    }

    fn arb_scalar_type() -> impl Strategy<Value = Type> {
        prop_oneof![
            Just(Type::Any),
            Just(Type::Null),
            Just(Type::Boolean),
            Just(Type::Number),
            Just(Type::String),
        ]
    }

    fn arb_type() -> impl Strategy<Value = Type> {
        arb_scalar_type().prop_recursive(3, 16, 4, |inner| {
            prop_oneof![
                inner.clone().prop_map(Type::set_of),
                inner.clone().prop_map(Type::array_of),
                prop::collection::vec(inner, 0..3).prop_map(Type::or_of),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_union_is_commutative(a in arb_type(), b in arb_type()) {
            prop_assert_eq!(Type::union(a.clone(), b.clone()), Type::union(b, a));
        }

        #[test]
        fn prop_union_is_idempotent(a in arb_type()) {
            prop_assert_eq!(Type::union(a.clone(), a.clone()), a);
        }

        #[test]
        fn prop_union_contains_operands(a in arb_type(), b in arb_type()) {
            let u = Type::union(a.clone(), b.clone());
            prop_assert!(u.contains(&a));
            prop_assert!(u.contains(&b));
        }
    }
}
