//! Built-in Function Declarations
//!
//! The static registry of built-in functions known to the compiler: name,
//! optional infix form, type declaration, and flags used by individual
//! passes (relation built-ins cannot be `with`-targets, void built-ins
//! cannot produce values, deprecated built-ins error in strict mode).

use crate::types::Type;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// A built-in function declaration.
#[derive(Debug, Clone)]
pub struct Builtin {
    pub name: &'static str,
    /// Infix operator form, where one exists (`=`, `==`, `+`, ...)
    pub infix: Option<&'static str>,
    /// Type declaration; always a `Type::Function`
    pub decl: Type,
    /// Relation built-ins enumerate results and cannot be replaced
    pub relation: bool,
    /// Deprecated built-ins error in strict mode
    pub deprecated: bool,
}

impl Builtin {
    /// Declared number of arguments.
    pub fn arity(&self) -> usize {
        self.decl.arity().unwrap_or(0)
    }

    /// Check whether the built-in produces no result.
    pub fn is_void(&self) -> bool {
        matches!(self.decl.function_result(), Some(None))
    }

    /// Internal built-ins are implementation details and cannot be
    /// replaced via `with`.
    pub fn is_internal(&self) -> bool {
        self.name.starts_with("internal.") || self.name == "eq" || self.name == "assign"
    }
}

/// Built-ins whose semantics prevent comprehension-index output-var
/// pushdown. Kept as a table so evaluator-specific additions stay local.
pub const COMPREHENSION_INDEX_BLOCKLIST: &[&str] = &["walk"];

fn decl_cmp2_bool() -> Type {
    Type::func(vec![Type::Any, Type::Any], Type::Boolean)
}

fn decl_arith2() -> Type {
    Type::func(vec![Type::Number, Type::Number], Type::Number)
}

fn decl_str1(result: Type) -> Type {
    Type::func(vec![Type::String], result)
}

fn collection_of_any() -> Type {
    Type::or_of(vec![
        Type::String,
        Type::array_of(Type::Any),
        Type::object_dynamic(Type::Any, Type::Any),
        Type::set_of(Type::Any),
    ])
}

fn registry() -> BTreeMap<&'static str, Builtin> {
    let defs: Vec<Builtin> = vec![
        // Unification and assignment
        Builtin {
            name: "eq",
            infix: Some("="),
            decl: Type::func(vec![Type::Any, Type::Any], Type::Any),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "assign",
            infix: Some(":="),
            decl: Type::func(vec![Type::Any, Type::Any], Type::Any),
            relation: false,
            deprecated: false,
        },
        // Comparisons
        Builtin {
            name: "equal",
            infix: Some("=="),
            decl: decl_cmp2_bool(),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "neq",
            infix: Some("!="),
            decl: decl_cmp2_bool(),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "lt",
            infix: Some("<"),
            decl: decl_cmp2_bool(),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "lte",
            infix: Some("<="),
            decl: decl_cmp2_bool(),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "gt",
            infix: Some(">"),
            decl: decl_cmp2_bool(),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "gte",
            infix: Some(">="),
            decl: decl_cmp2_bool(),
            relation: false,
            deprecated: false,
        },
        // Arithmetic
        Builtin {
            name: "plus",
            infix: Some("+"),
            decl: decl_arith2(),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "minus",
            infix: Some("-"),
            decl: decl_arith2(),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "mul",
            infix: Some("*"),
            decl: decl_arith2(),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "div",
            infix: Some("/"),
            decl: decl_arith2(),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "rem",
            infix: Some("%"),
            decl: decl_arith2(),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "abs",
            infix: None,
            decl: Type::func(vec![Type::Number], Type::Number),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "round",
            infix: None,
            decl: Type::func(vec![Type::Number], Type::Number),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "numbers.range",
            infix: None,
            decl: Type::func(
                vec![Type::Number, Type::Number],
                Type::array_of(Type::Number),
            ),
            relation: false,
            deprecated: false,
        },
        // Aggregates
        Builtin {
            name: "count",
            infix: None,
            decl: Type::func(vec![collection_of_any()], Type::Number),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "sum",
            infix: None,
            decl: Type::func(
                vec![Type::or_of(vec![
                    Type::array_of(Type::Number),
                    Type::set_of(Type::Number),
                ])],
                Type::Number,
            ),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "product",
            infix: None,
            decl: Type::func(
                vec![Type::or_of(vec![
                    Type::array_of(Type::Number),
                    Type::set_of(Type::Number),
                ])],
                Type::Number,
            ),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "max",
            infix: None,
            decl: Type::func(
                vec![Type::or_of(vec![
                    Type::array_of(Type::Any),
                    Type::set_of(Type::Any),
                ])],
                Type::Any,
            ),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "min",
            infix: None,
            decl: Type::func(
                vec![Type::or_of(vec![
                    Type::array_of(Type::Any),
                    Type::set_of(Type::Any),
                ])],
                Type::Any,
            ),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "sort",
            infix: None,
            decl: Type::func(
                vec![Type::or_of(vec![
                    Type::array_of(Type::Any),
                    Type::set_of(Type::Any),
                ])],
                Type::array_of(Type::Any),
            ),
            relation: false,
            deprecated: false,
        },
        // Strings
        Builtin {
            name: "concat",
            infix: None,
            decl: Type::func(
                vec![
                    Type::String,
                    Type::or_of(vec![
                        Type::array_of(Type::String),
                        Type::set_of(Type::String),
                    ]),
                ],
                Type::String,
            ),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "sprintf",
            infix: None,
            decl: Type::func(vec![Type::String, Type::array_of(Type::Any)], Type::String),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "format_int",
            infix: None,
            decl: Type::func(vec![Type::Number, Type::Number], Type::String),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "startswith",
            infix: None,
            decl: Type::func(vec![Type::String, Type::String], Type::Boolean),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "endswith",
            infix: None,
            decl: Type::func(vec![Type::String, Type::String], Type::Boolean),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "contains",
            infix: None,
            decl: Type::func(vec![Type::String, Type::String], Type::Boolean),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "lower",
            infix: None,
            decl: decl_str1(Type::String),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "upper",
            infix: None,
            decl: decl_str1(Type::String),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "split",
            infix: None,
            decl: Type::func(
                vec![Type::String, Type::String],
                Type::array_of(Type::String),
            ),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "replace",
            infix: None,
            decl: Type::func(vec![Type::String, Type::String, Type::String], Type::String),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "to_number",
            infix: None,
            decl: Type::func(vec![Type::Any], Type::Number),
            relation: false,
            deprecated: false,
        },
        // Type checks
        Builtin {
            name: "is_number",
            infix: None,
            decl: Type::func(vec![Type::Any], Type::Boolean),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "is_string",
            infix: None,
            decl: Type::func(vec![Type::Any], Type::Boolean),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "is_array",
            infix: None,
            decl: Type::func(vec![Type::Any], Type::Boolean),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "is_object",
            infix: None,
            decl: Type::func(vec![Type::Any], Type::Boolean),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "is_set",
            infix: None,
            decl: Type::func(vec![Type::Any], Type::Boolean),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "type_name",
            infix: None,
            decl: Type::func(vec![Type::Any], Type::String),
            relation: false,
            deprecated: false,
        },
        // Objects and arrays
        Builtin {
            name: "object.get",
            infix: None,
            decl: Type::func(
                vec![
                    Type::object_dynamic(Type::Any, Type::Any),
                    Type::Any,
                    Type::Any,
                ],
                Type::Any,
            ),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "object.keys",
            infix: None,
            decl: Type::func(
                vec![Type::object_dynamic(Type::Any, Type::Any)],
                Type::set_of(Type::Any),
            ),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "array.concat",
            infix: None,
            decl: Type::func(
                vec![Type::array_of(Type::Any), Type::array_of(Type::Any)],
                Type::array_of(Type::Any),
            ),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "array.slice",
            infix: None,
            decl: Type::func(
                vec![Type::array_of(Type::Any), Type::Number, Type::Number],
                Type::array_of(Type::Any),
            ),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "intersection",
            infix: None,
            decl: Type::func(
                vec![Type::set_of(Type::set_of(Type::Any))],
                Type::set_of(Type::Any),
            ),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "union",
            infix: None,
            decl: Type::func(
                vec![Type::set_of(Type::set_of(Type::Any))],
                Type::set_of(Type::Any),
            ),
            relation: false,
            deprecated: false,
        },
        // Relations
        Builtin {
            name: "walk",
            infix: None,
            decl: Type::func(
                vec![Type::Any],
                Type::tuple(vec![Type::array_of(Type::Any), Type::Any]),
            ),
            relation: true,
            deprecated: false,
        },
        // Membership (desugared `x in xs`)
        Builtin {
            name: "internal.member_2",
            infix: Some("in"),
            decl: decl_cmp2_bool(),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "internal.member_3",
            infix: None,
            decl: Type::func(vec![Type::Any, Type::Any, Type::Any], Type::Boolean),
            relation: false,
            deprecated: false,
        },
        // Tracing and printing
        Builtin {
            name: "trace",
            infix: None,
            decl: Type::func(vec![Type::String], Type::Boolean),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "print",
            infix: None,
            decl: Type::Function {
                args: Vec::new(),
                result: None,
                variadic: Some(Box::new(Type::Any)),
            },
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "internal.print",
            infix: None,
            decl: Type::void_func(vec![Type::array_of(Type::set_of(Type::Any))]),
            relation: false,
            deprecated: false,
        },
        // Metadata
        Builtin {
            name: "rego.metadata.chain",
            infix: None,
            decl: Type::func(Vec::new(), Type::array_of(Type::Any)),
            relation: false,
            deprecated: false,
        },
        Builtin {
            name: "rego.metadata.rule",
            infix: None,
            decl: Type::func(Vec::new(), Type::object_dynamic(Type::Any, Type::Any)),
            relation: false,
            deprecated: false,
        },
        // Deprecated
        Builtin {
            name: "all",
            infix: None,
            decl: Type::func(
                vec![Type::or_of(vec![
                    Type::array_of(Type::Any),
                    Type::set_of(Type::Any),
                ])],
                Type::Boolean,
            ),
            relation: false,
            deprecated: true,
        },
        Builtin {
            name: "any",
            infix: None,
            decl: Type::func(
                vec![Type::or_of(vec![
                    Type::array_of(Type::Any),
                    Type::set_of(Type::Any),
                ])],
                Type::Boolean,
            ),
            relation: false,
            deprecated: true,
        },
    ];

    defs.into_iter().map(|b| (b.name, b)).collect()
}

/// The full registry of built-ins, keyed by name.
pub fn builtins() -> &'static BTreeMap<&'static str, Builtin> {
    static REGISTRY: OnceLock<BTreeMap<&'static str, Builtin>> = OnceLock::new();
    REGISTRY.get_or_init(registry)
}

/// Look up a built-in by name.
pub fn get(name: &str) -> Option<&'static Builtin> {
    builtins().get(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_arity() {
        let eq = get("eq").unwrap();
        assert_eq!(eq.arity(), 2);
        assert_eq!(eq.infix, Some("="));

        let walk = get("walk").unwrap();
        assert!(walk.relation);
        assert_eq!(walk.arity(), 1);
    }

    #[test]
    fn test_void_builtins() {
        assert!(get("print").unwrap().is_void());
        assert!(get("internal.print").unwrap().is_void());
        assert!(!get("count").unwrap().is_void());
    }

    #[test]
    fn test_internal_builtins() {
        assert!(get("internal.print").unwrap().is_internal());
        assert!(get("eq").unwrap().is_internal());
        assert!(!get("count").unwrap().is_internal());
    }

    #[test]
    fn test_deprecated_flags() {
        assert!(get("all").unwrap().deprecated);
        assert!(get("any").unwrap().deprecated);
        assert!(!get("count").unwrap().deprecated);
    }

    #[test]
    fn test_blocklist_contains_walk() {
        assert!(COMPREHENSION_INDEX_BLOCKLIST.contains(&"walk"));
    }

    #[test]
    fn test_unknown_builtin() {
        assert!(get("does_not_exist").is_none());
    }
}
