//! # Policy AST - Abstract Syntax Tree Types
//!
//! Abstract Syntax Tree types for policy modules.
//! Used across the compiler pipeline for resolution, rewriting, safety
//! analysis, type checking and planning.
//!
//! ## Builders
//!
//! For programmatic construction of AST nodes, see the [`builders`] module
//! which provides fluent APIs like `RuleBuilder` and `ModuleBuilder`.
//!
//! ## Identity
//!
//! Equality, ordering and hashing of AST nodes ignore source locations:
//! two terms are equal iff their values are equal. `Clone` produces a deep,
//! structurally equal copy with no shared mutable substructure.

use crate::location::Location;
use crate::number::Number;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

pub mod builders;
pub mod visitor;

// ============================================================================
// Reserved names
// ============================================================================

/// Prefix marking wildcard variables.
pub const WILDCARD_PREFIX: &str = "$";

/// Prefix of compiler-generated local variables.
pub const LOCAL_VAR_PREFIX: &str = "__local";

/// Names of the root documents addressable from policy code.
pub const ROOT_DOCUMENT_NAMES: &[&str] = &["data", "input"];

/// Keywords reserved by the newer language variant.
pub const FUTURE_KEYWORDS: &[&str] = &["contains", "every", "if", "in"];

/// The root under which all rules live.
pub const DEFAULT_ROOT_DOCUMENT: &str = "data";

/// The hidden system namespace (`data.system`).
pub const SYSTEM_DOCUMENT_KEY: &str = "system";

// ============================================================================
// Variables
// ============================================================================

/// A variable identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Var(String);

impl Var {
    /// Create a variable from a name.
    pub fn new(name: impl Into<String>) -> Self {
        Var(name.into())
    }

    /// The variable name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether this is a wildcard (`_` in source, `$n` after parsing).
    pub fn is_wildcard(&self) -> bool {
        self.0.starts_with(WILDCARD_PREFIX)
    }

    /// Check whether this variable was generated by a compiler rewrite.
    pub fn is_generated(&self) -> bool {
        self.0.starts_with(LOCAL_VAR_PREFIX)
    }

    /// Check whether this names a root document (`data` or `input`).
    pub fn is_root_document(&self) -> bool {
        ROOT_DOCUMENT_NAMES.contains(&self.0.as_str())
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Var {
    fn from(s: &str) -> Self {
        Var::new(s)
    }
}

// ============================================================================
// References
// ============================================================================

/// A path-like reference into the document tree.
///
/// The head term is a variable naming a root (`data`, `input`, or an
/// imported name before resolution); subsequent terms are selectors.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ref(Vec<Term>);

impl Ref {
    /// Create a reference from its terms.
    pub fn new(terms: Vec<Term>) -> Self {
        Ref(terms)
    }

    /// Create a reference `<head>.<elem>...` where `head` is a variable and
    /// the remaining elements are strings.
    pub fn dotted(parts: &[&str]) -> Self {
        let mut terms = Vec::with_capacity(parts.len());
        for (i, p) in parts.iter().enumerate() {
            if i == 0 {
                terms.push(Term::var(*p));
            } else {
                terms.push(Term::string(*p));
            }
        }
        Ref(terms)
    }

    /// The head term, if any.
    pub fn head(&self) -> Option<&Term> {
        self.0.first()
    }

    /// The term at position `i`.
    pub fn get(&self, i: usize) -> Option<&Term> {
        self.0.get(i)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Term> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Term> {
        self.0.iter_mut()
    }

    /// All terms.
    pub fn terms(&self) -> &[Term] {
        &self.0
    }

    /// Check whether every term after the head is ground.
    pub fn is_ground(&self) -> bool {
        self.0.iter().skip(1).all(Term::is_ground)
    }

    /// The longest prefix of this reference whose selectors are all ground.
    pub fn ground_prefix(&self) -> Ref {
        let mut out = Vec::new();
        for (i, t) in self.0.iter().enumerate() {
            if i > 0 && !t.is_ground() {
                break;
            }
            out.push(t.clone());
        }
        Ref(out)
    }

    /// Append a term, returning a new reference.
    pub fn append(&self, term: Term) -> Ref {
        let mut terms = self.0.clone();
        terms.push(term);
        Ref(terms)
    }

    /// Concatenate additional selector terms onto this reference.
    pub fn concat(&self, other: &[Term]) -> Ref {
        let mut terms = self.0.clone();
        terms.extend(other.iter().cloned());
        Ref(terms)
    }

    /// A new reference holding the first `n` terms.
    pub fn truncate(&self, n: usize) -> Ref {
        Ref(self.0.iter().take(n).cloned().collect())
    }

    /// Check whether `prefix` is a prefix of this reference.
    pub fn has_prefix(&self, prefix: &Ref) -> bool {
        if prefix.len() > self.len() {
            return false;
        }
        self.0[..prefix.len()] == prefix.0[..]
    }

    /// The string selectors after the head, for refs that are all-string.
    /// Returns `None` if any selector is not a string.
    pub fn string_path(&self) -> Option<Vec<String>> {
        let mut out = Vec::new();
        for t in self.0.iter().skip(1) {
            match &t.value {
                Value::String(s) => out.push(s.clone()),
                _ => return None,
            }
        }
        Some(out)
    }
}

impl From<Vec<Term>> for Ref {
    fn from(terms: Vec<Term>) -> Self {
        Ref(terms)
    }
}

fn is_ident(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_')
        && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, t) in self.0.iter().enumerate() {
            if i == 0 {
                write!(f, "{}", t.value)?;
                continue;
            }
            match &t.value {
                Value::String(s) if is_ident(s) => write!(f, ".{s}")?,
                v => write!(f, "[{v}]")?,
            }
        }
        Ok(())
    }
}

/// Extract a dotted operator name from a reference (`rego.metadata.chain`).
/// Returns `None` if the reference mixes in non-string selectors.
pub fn ref_operator_name(r: &Ref) -> Option<String> {
    let head = r.head()?;
    let mut name = match &head.value {
        Value::Var(v) => v.as_str().to_string(),
        _ => return None,
    };
    for t in r.iter().skip(1) {
        match &t.value {
            Value::String(s) => {
                name.push('.');
                name.push_str(s);
            }
            _ => return None,
        }
    }
    Some(name)
}

// ============================================================================
// Values and terms
// ============================================================================

/// A policy value.
///
/// Sets are stored sorted and deduplicated; objects preserve insertion
/// order for iteration but compare order-insensitively.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    /// A variable, possibly generated or a wildcard
    Var(Var),
    /// Path navigation into the document tree
    Ref(Ref),
    /// Ordered collection, duplicates allowed
    Array(Vec<Term>),
    /// Unordered unique collection, kept sorted
    Set(Vec<Term>),
    /// Key-value pairs in insertion order
    Object(Vec<(Term, Term)>),
    /// Operator reference followed by operand terms
    Call(Vec<Term>),
    /// `[term | body]`
    ArrayComprehension { term: Box<Term>, body: Body },
    /// `{term | body}`
    SetComprehension { term: Box<Term>, body: Body },
    /// `{key: value | body}`
    ObjectComprehension {
        key: Box<Term>,
        value: Box<Term>,
        body: Body,
    },
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl Value {
    /// Construct a set value: elements are sorted and deduplicated.
    pub fn set(mut items: Vec<Term>) -> Value {
        items.sort();
        items.dedup();
        Value::Set(items)
    }

    /// Variant rank used for the total order over values.
    fn sort_order(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Var(_) => 4,
            Value::Ref(_) => 5,
            Value::Array(_) => 6,
            Value::Object(_) => 7,
            Value::Set(_) => 8,
            Value::ArrayComprehension { .. } => 9,
            Value::ObjectComprehension { .. } => 10,
            Value::SetComprehension { .. } => 11,
            Value::Call(_) => 12,
        }
    }

    /// Check whether the value contains no variables, references, calls or
    /// comprehensions.
    pub fn is_ground(&self) -> bool {
        match self {
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => true,
            Value::Var(_)
            | Value::Ref(_)
            | Value::Call(_)
            | Value::ArrayComprehension { .. }
            | Value::SetComprehension { .. }
            | Value::ObjectComprehension { .. } => false,
            Value::Array(items) | Value::Set(items) => items.iter().all(Term::is_ground),
            Value::Object(pairs) => pairs.iter().all(|(k, v)| k.is_ground() && v.is_ground()),
        }
    }

    /// Check whether the value is a scalar constant.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
        )
    }

    /// Check whether the value is a comprehension.
    pub fn is_comprehension(&self) -> bool {
        matches!(
            self,
            Value::ArrayComprehension { .. }
                | Value::SetComprehension { .. }
                | Value::ObjectComprehension { .. }
        )
    }

    /// A short name for the value kind, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Var(_) => "var",
            Value::Ref(_) => "ref",
            Value::Array(_) => "array",
            Value::Set(_) => "set",
            Value::Object(_) => "object",
            Value::Call(_) => "call",
            Value::ArrayComprehension { .. } => "arraycomprehension",
            Value::SetComprehension { .. } => "setcomprehension",
            Value::ObjectComprehension { .. } => "objectcomprehension",
        }
    }

    /// Get the variable if this is a var value.
    pub fn as_var(&self) -> Option<&Var> {
        if let Value::Var(v) = self {
            Some(v)
        } else {
            None
        }
    }

    /// Get the reference if this is a ref value.
    pub fn as_ref_value(&self) -> Option<&Ref> {
        if let Value::Ref(r) = self {
            Some(r)
        } else {
            None
        }
    }

    /// Get the string if this is a string value.
    pub fn as_string(&self) -> Option<&str> {
        if let Value::String(s) = self {
            Some(s)
        } else {
            None
        }
    }

    /// Convert a ground value to JSON. Returns `None` for non-ground values.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Value::Null => Some(serde_json::Value::Null),
            Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
            Value::Number(n) => {
                let num = n.as_i64().map_or_else(
                    || serde_json::Number::from_f64(n.as_f64()),
                    |i| Some(serde_json::Number::from(i)),
                )?;
                Some(serde_json::Value::Number(num))
            }
            Value::String(s) => Some(serde_json::Value::String(s.clone())),
            Value::Array(items) | Value::Set(items) => {
                let out: Option<Vec<_>> = items.iter().map(|t| t.value.to_json()).collect();
                Some(serde_json::Value::Array(out?))
            }
            Value::Object(pairs) => {
                let mut map = serde_json::Map::new();
                for (k, v) in pairs {
                    let key = match &k.value {
                        Value::String(s) => s.clone(),
                        other => other.to_json()?.to_string(),
                    };
                    map.insert(key, v.value.to_json()?);
                }
                Some(serde_json::Value::Object(map))
            }
            _ => None,
        }
    }

    /// Build a value from a JSON document.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Number(Number::from(i))
                } else if let Some(u) = n.as_u64() {
                    Value::Number(Number::from(u))
                } else {
                    Value::Number(Number::from_f64(n.as_f64().unwrap_or(0.0)))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(|v| Term::new(Value::from_json(v))).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (Term::string(k.as_str()), Term::new(Value::from_json(v))))
                    .collect(),
            ),
        }
    }

    fn object_sorted(pairs: &[(Term, Term)]) -> Vec<(&Term, &Term)> {
        let mut out: Vec<_> = pairs.iter().map(|(k, v)| (k, v)).collect();
        out.sort_by(|a, b| a.0.cmp(b.0).then_with(|| a.1.cmp(b.1)));
        out
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank = self.sort_order().cmp(&other.sort_order());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Var(a), Value::Var(b)) => a.cmp(b),
            (Value::Ref(a), Value::Ref(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) | (Value::Set(a), Value::Set(b)) => a.cmp(b),
            (Value::Object(a), Value::Object(b)) => {
                Value::object_sorted(a).cmp(&Value::object_sorted(b))
            }
            (Value::Call(a), Value::Call(b)) => a.cmp(b),
            (
                Value::ArrayComprehension { term: t1, body: b1 },
                Value::ArrayComprehension { term: t2, body: b2 },
            )
            | (
                Value::SetComprehension { term: t1, body: b1 },
                Value::SetComprehension { term: t2, body: b2 },
            ) => t1.cmp(t2).then_with(|| b1.cmp(b2)),
            (
                Value::ObjectComprehension {
                    key: k1,
                    value: v1,
                    body: b1,
                },
                Value::ObjectComprehension {
                    key: k2,
                    value: v2,
                    body: b2,
                },
            ) => k1.cmp(k2).then_with(|| v1.cmp(v2)).then_with(|| b1.cmp(b2)),
            _ => unreachable!("sort order discriminates variants"),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Var(v) => write!(f, "{v}"),
            Value::Ref(r) => write!(f, "{r}"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, t) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", t.value)?;
                }
                write!(f, "]")
            }
            Value::Set(items) => {
                if items.is_empty() {
                    return write!(f, "set()");
                }
                write!(f, "{{")?;
                for (i, t) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", t.value)?;
                }
                write!(f, "}}")
            }
            Value::Object(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k.value, v.value)?;
                }
                write!(f, "}}")
            }
            Value::Call(terms) => {
                if let Some((op, args)) = terms.split_first() {
                    write!(f, "{}(", op.value)?;
                    for (i, a) in args.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", a.value)?;
                    }
                    write!(f, ")")
                } else {
                    write!(f, "()")
                }
            }
            Value::ArrayComprehension { term, body } => write!(f, "[{} | {}]", term.value, body),
            Value::SetComprehension { term, body } => write!(f, "{{{} | {}}}", term.value, body),
            Value::ObjectComprehension { key, value, body } => {
                write!(f, "{{{}: {} | {}}}", key.value, value.value, body)
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.to_json() {
            Some(json) => json.serialize(serializer),
            None => self.to_string().serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Ok(Value::from_json(&json))
    }
}

/// A value paired with its source location.
#[derive(Debug, Clone, Default)]
pub struct Term {
    pub value: Value,
    pub location: Location,
}

impl Term {
    /// Create a term with no location.
    pub fn new(value: Value) -> Self {
        Term {
            value,
            location: Location::default(),
        }
    }

    /// Create a term at a location.
    pub fn with_location(value: Value, location: Location) -> Self {
        Term { value, location }
    }

    pub fn null() -> Self {
        Term::new(Value::Null)
    }

    pub fn boolean(b: bool) -> Self {
        Term::new(Value::Bool(b))
    }

    pub fn number(n: impl Into<Number>) -> Self {
        Term::new(Value::Number(n.into()))
    }

    pub fn int(i: i64) -> Self {
        Term::new(Value::Number(Number::from(i)))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Term::new(Value::String(s.into()))
    }

    pub fn var(name: impl Into<String>) -> Self {
        Term::new(Value::Var(Var::new(name)))
    }

    pub fn ref_term(r: Ref) -> Self {
        Term::new(Value::Ref(r))
    }

    pub fn array(items: Vec<Term>) -> Self {
        Term::new(Value::Array(items))
    }

    pub fn set(items: Vec<Term>) -> Self {
        Term::new(Value::set(items))
    }

    pub fn object(pairs: Vec<(Term, Term)>) -> Self {
        Term::new(Value::Object(pairs))
    }

    pub fn call(terms: Vec<Term>) -> Self {
        Term::new(Value::Call(terms))
    }

    /// Check whether the term is ground.
    pub fn is_ground(&self) -> bool {
        self.value.is_ground()
    }

    /// Check whether the term requires evaluation before its value is known:
    /// it is, or contains, a non-trivial reference, call or comprehension.
    pub fn requires_eval(&self) -> bool {
        match &self.value {
            Value::Ref(r) => r.len() > 1,
            Value::Call(_)
            | Value::ArrayComprehension { .. }
            | Value::SetComprehension { .. }
            | Value::ObjectComprehension { .. } => true,
            Value::Array(items) | Value::Set(items) => items.iter().any(Term::requires_eval),
            Value::Object(pairs) => pairs
                .iter()
                .any(|(k, v)| k.requires_eval() || v.requires_eval()),
            _ => false,
        }
    }
}

impl Ord for Term {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.cmp(&other.value)
    }
}

impl PartialOrd for Term {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for Term {}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

// ============================================================================
// Expressions and bodies
// ============================================================================

/// A `with` modifier: `expr with target as value`.
#[derive(Debug, Clone)]
pub struct With {
    pub target: Term,
    pub value: Term,
    pub location: Location,
}

impl With {
    pub fn new(target: Term, value: Term) -> Self {
        With {
            target,
            value,
            location: Location::default(),
        }
    }
}

impl Ord for With {
    fn cmp(&self, other: &Self) -> Ordering {
        self.target
            .cmp(&other.target)
            .then_with(|| self.value.cmp(&other.value))
    }
}

impl PartialOrd for With {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for With {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for With {}

/// A `some` declaration introducing local variables.
#[derive(Debug, Clone)]
pub struct SomeDecl {
    pub symbols: Vec<Term>,
    pub location: Location,
}

impl SomeDecl {
    pub fn new(symbols: Vec<Term>) -> Self {
        SomeDecl {
            symbols,
            location: Location::default(),
        }
    }
}

impl Ord for SomeDecl {
    fn cmp(&self, other: &Self) -> Ordering {
        self.symbols.cmp(&other.symbols)
    }
}

impl PartialOrd for SomeDecl {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SomeDecl {
    fn eq(&self, other: &Self) -> bool {
        self.symbols == other.symbols
    }
}

impl Eq for SomeDecl {}

/// An `every` quantifier: `every k, v in domain { body }`.
#[derive(Debug, Clone)]
pub struct Every {
    pub key: Option<Term>,
    pub value: Term,
    pub domain: Term,
    pub body: Body,
    pub location: Location,
}

impl Every {
    /// The key and value variables bound inside the body.
    pub fn key_value_vars(&self) -> Vec<Var> {
        let mut out = Vec::new();
        if let Some(k) = &self.key {
            if let Value::Var(v) = &k.value {
                out.push(v.clone());
            }
        }
        if let Value::Var(v) = &self.value.value {
            out.push(v.clone());
        }
        out
    }
}

impl Ord for Every {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.value.cmp(&other.value))
            .then_with(|| self.domain.cmp(&other.domain))
            .then_with(|| self.body.cmp(&other.body))
    }
}

impl PartialOrd for Every {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Every {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Every {}

/// The payload of an expression.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExprTerms {
    /// A single term
    Term(Term),
    /// A call: operator term followed by operands
    Call(Vec<Term>),
    /// A `some` declaration
    SomeDecl(SomeDecl),
    /// An `every` quantifier
    Every(Every),
}

/// A single expression in a rule body.
#[derive(Debug, Clone)]
pub struct Expr {
    pub terms: ExprTerms,
    pub negated: bool,
    /// Set on expressions synthesized by compiler rewrites
    pub generated: bool,
    pub with: Vec<With>,
    pub location: Location,
}

impl Expr {
    /// Create an expression holding a single term.
    pub fn term(t: Term) -> Self {
        Expr {
            terms: ExprTerms::Term(t),
            negated: false,
            generated: false,
            with: Vec::new(),
            location: Location::default(),
        }
    }

    /// Create a call expression from an operator reference and operands.
    pub fn call(operator: Ref, operands: Vec<Term>) -> Self {
        let mut terms = Vec::with_capacity(operands.len() + 1);
        terms.push(Term::ref_term(operator));
        terms.extend(operands);
        Expr {
            terms: ExprTerms::Call(terms),
            negated: false,
            generated: false,
            with: Vec::new(),
            location: Location::default(),
        }
    }

    /// Create a generated unification `eq(a, b)`.
    pub fn eq(a: Term, b: Term) -> Self {
        let mut e = Expr::call(Ref::new(vec![Term::var("eq")]), vec![a, b]);
        e.generated = true;
        e
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    pub fn negate(mut self) -> Self {
        self.negated = true;
        self
    }

    /// The operator reference of a call expression.
    pub fn operator(&self) -> Option<&Ref> {
        match &self.terms {
            ExprTerms::Call(terms) => terms.first().and_then(|t| t.value.as_ref_value()),
            _ => None,
        }
    }

    /// The dotted operator name of a call expression.
    pub fn operator_name(&self) -> Option<String> {
        self.operator().and_then(ref_operator_name)
    }

    /// The operand terms of a call expression.
    pub fn operands(&self) -> &[Term] {
        match &self.terms {
            ExprTerms::Call(terms) => &terms[1..],
            _ => &[],
        }
    }

    /// Mutable operand terms of a call expression.
    pub fn operands_mut(&mut self) -> &mut [Term] {
        match &mut self.terms {
            ExprTerms::Call(terms) => &mut terms[1..],
            _ => &mut [],
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self.terms, ExprTerms::Call(_))
    }

    /// Check whether this is a unification (`eq` call).
    pub fn is_equality(&self) -> bool {
        self.operator_name().as_deref() == Some("eq")
    }

    /// Check whether this is an assignment (`assign` call, i.e. `:=`).
    pub fn is_assignment(&self) -> bool {
        self.operator_name().as_deref() == Some("assign")
    }

    pub fn is_every(&self) -> bool {
        matches!(self.terms, ExprTerms::Every(_))
    }

    pub fn is_some_decl(&self) -> bool {
        matches!(self.terms, ExprTerms::SomeDecl(_))
    }
}

impl Ord for Expr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.negated
            .cmp(&other.negated)
            .then_with(|| self.terms.cmp(&other.terms))
            .then_with(|| self.with.cmp(&other.with))
    }
}

impl PartialOrd for Expr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Expr {}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            write!(f, "not ")?;
        }
        match &self.terms {
            ExprTerms::Term(t) => write!(f, "{t}")?,
            ExprTerms::Call(terms) => {
                if let Some((op, args)) = terms.split_first() {
                    write!(f, "{}(", op.value)?;
                    for (i, a) in args.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{a}")?;
                    }
                    write!(f, ")")?;
                }
            }
            ExprTerms::SomeDecl(decl) => {
                write!(f, "some ")?;
                for (i, s) in decl.symbols.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{s}")?;
                }
            }
            ExprTerms::Every(every) => {
                write!(f, "every ")?;
                if let Some(k) = &every.key {
                    write!(f, "{k}, ")?;
                }
                write!(f, "{} in {} {{ {} }}", every.value, every.domain, every.body)?;
            }
        }
        for w in &self.with {
            write!(f, " with {} as {}", w.target, w.value)?;
        }
        Ok(())
    }
}

/// An ordered list of expressions.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Body(pub Vec<Expr>);

impl Body {
    pub fn new(exprs: Vec<Expr>) -> Self {
        Body(exprs)
    }

    /// A body holding the single generated expression `true`.
    pub fn truthy() -> Self {
        let mut e = Expr::term(Term::boolean(true));
        e.generated = true;
        Body(vec![e])
    }

    pub fn push(&mut self, e: Expr) {
        self.0.push(e);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Expr> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Expr> {
        self.0.iter_mut()
    }
}

impl fmt::Display for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl IntoIterator for Body {
    type Item = Expr;
    type IntoIter = std::vec::IntoIter<Expr>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

// ============================================================================
// Rules, packages, modules
// ============================================================================

/// Classification of a rule by its head shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    /// Produces a single value at a ground or dynamic path
    SingleValue,
    /// Produces set entries (partial set rule)
    MultiValue,
    /// A function with arguments
    Function,
}

/// A rule head.
#[derive(Debug, Clone)]
pub struct Head {
    /// Canonical path of the rule; fully qualified after resolution
    pub reference: Ref,
    /// Arguments, for functions
    pub args: Vec<Term>,
    /// Key term, for multi-value rules
    pub key: Option<Term>,
    /// Value term, for single-value rules and functions
    pub value: Option<Term>,
    /// Whether the head used `:=`
    pub assign: bool,
    /// Whether this is a default rule
    pub default: bool,
    pub location: Location,
}

impl Head {
    /// Create a head for a named rule.
    pub fn new(name: &str) -> Self {
        Head {
            reference: Ref::new(vec![Term::var(name)]),
            args: Vec::new(),
            key: None,
            value: None,
            assign: false,
            default: false,
            location: Location::default(),
        }
    }

    /// The kind of rule this head defines.
    pub fn kind(&self) -> RuleKind {
        if !self.args.is_empty() {
            RuleKind::Function
        } else if self.key.is_some() && self.value.is_none() {
            RuleKind::MultiValue
        } else {
            RuleKind::SingleValue
        }
    }

    /// The short name of the rule: the last ground string element of the
    /// reference, or the head variable for unresolved heads.
    pub fn name(&self) -> String {
        for t in self.reference.terms().iter().rev() {
            match &t.value {
                Value::String(s) => return s.clone(),
                Value::Var(v) if !v.is_generated() && !v.is_wildcard() => {
                    return v.as_str().to_string()
                }
                _ => {}
            }
        }
        self.reference.to_string()
    }
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.reference == other.reference
            && self.args == other.args
            && self.key == other.key
            && self.value == other.value
            && self.default == other.default
    }
}

impl Eq for Head {}

/// A rule: a conditional definition under a package path.
#[derive(Debug, Clone)]
pub struct Rule {
    pub head: Head,
    pub body: Body,
    pub else_rule: Option<Box<Rule>>,
    /// Set on rules synthesized by the compiler or optimizer
    pub generated: bool,
    pub location: Location,
}

impl Rule {
    pub fn new(head: Head, body: Body) -> Self {
        Rule {
            head,
            body,
            else_rule: None,
            generated: false,
            location: Location::default(),
        }
    }

    /// The kind of this rule.
    pub fn kind(&self) -> RuleKind {
        self.head.kind()
    }

    /// Number of declared arguments.
    pub fn arity(&self) -> usize {
        self.head.args.len()
    }

    /// Iterate this rule followed by its else-branches.
    pub fn iter_chain(&self) -> RuleChainIter<'_> {
        RuleChainIter { next: Some(self) }
    }
}

/// Iterator over a rule and its else-branches.
pub struct RuleChainIter<'a> {
    next: Option<&'a Rule>,
}

impl<'a> Iterator for RuleChainIter<'a> {
    type Item = &'a Rule;
    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next?;
        self.next = cur.else_rule.as_deref();
        Some(cur)
    }
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.head == other.head && self.body == other.body && self.else_rule == other.else_rule
    }
}

impl Eq for Rule {}

/// A package declaration.
#[derive(Debug, Clone)]
pub struct Package {
    /// Full path rooted at `data`
    pub path: Ref,
    pub location: Location,
}

impl Package {
    /// Create a package from its dotted path (without the `data` root).
    pub fn new(parts: &[&str]) -> Self {
        let mut terms = vec![Term::var(DEFAULT_ROOT_DOCUMENT)];
        terms.extend(parts.iter().map(|p| Term::string(*p)));
        Package {
            path: Ref::new(terms),
            location: Location::default(),
        }
    }
}

impl PartialEq for Package {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for Package {}

/// An import declaration.
#[derive(Debug, Clone)]
pub struct Import {
    /// Imported path (a ref rooted at `data`, `input`, `future` or `rego`)
    pub path: Term,
    pub alias: Option<Var>,
    pub location: Location,
}

impl Import {
    pub fn new(path: Ref) -> Self {
        Import {
            path: Term::ref_term(path),
            alias: None,
            location: Location::default(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(Var::new(alias));
        self
    }

    /// The name this import binds: the alias, or the last path element.
    pub fn name(&self) -> Option<Var> {
        if let Some(alias) = &self.alias {
            return Some(alias.clone());
        }
        let r = self.path.value.as_ref_value()?;
        match &r.terms().last()?.value {
            Value::String(s) => Some(Var::new(s.clone())),
            Value::Var(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Check whether this is a `future.keywords...` import.
    pub fn is_future_import(&self) -> bool {
        self.root_name() == Some("future")
    }

    /// Check whether this is the language-version import (`rego.v1`).
    pub fn is_rego_version_import(&self) -> bool {
        self.root_name() == Some("rego")
    }

    fn root_name(&self) -> Option<&str> {
        let r = self.path.value.as_ref_value()?;
        r.head()?.value.as_var().map(Var::as_str)
    }
}

impl PartialEq for Import {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.alias == other.alias
    }
}

impl Eq for Import {}

/// A source comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub text: String,
    pub location: Location,
}

/// Language variant of a module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegoVersion {
    V0,
    #[default]
    V1,
}

/// A parsed policy module.
#[derive(Debug, Clone)]
pub struct Module {
    pub package: Package,
    pub imports: Vec<Import>,
    pub rules: Vec<Rule>,
    pub annotations: Vec<crate::annotations::Annotations>,
    pub comments: Vec<Comment>,
    pub rego_version: RegoVersion,
}

impl Module {
    pub fn new(package: Package) -> Self {
        Module {
            package,
            imports: Vec::new(),
            rules: Vec::new(),
            annotations: Vec::new(),
            comments: Vec::new(),
            rego_version: RegoVersion::default(),
        }
    }
}

impl PartialEq for Module {
    fn eq(&self, other: &Self) -> bool {
        self.package == other.package
            && self.imports == other.imports
            && self.rules == other.rules
            && self.rego_version == other.rego_version
    }
}

impl Eq for Module {}

/// Stable identifier of a rule within a compiled module set: an index into
/// the compiler's sorted module list plus the rule's position in the module.
///
/// Identifiers remain valid across rewrite passes (which never add or remove
/// rules) but must be re-acquired after a recompile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleId {
    pub module: usize,
    pub rule: usize,
}

impl RuleId {
    pub fn new(module: usize, rule: usize) -> Self {
        RuleId { module, rule }
    }
}

/// A sorted map of module keys (file names) to modules, the compiler's
/// canonical input shape. Sorted keys give deterministic pass iteration.
pub type ModuleSet = BTreeMap<String, Module>;
