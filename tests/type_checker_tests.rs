//! Type Checker Integration Tests
//!
//! Schema-driven typing and call checking through the full pipeline.

use regolith::ast::builders::{call_expr, eq_expr, ModuleBuilder, RuleBuilder};
use regolith::ast::{ModuleSet, Ref, Term};
use regolith::types::SchemaSet;
use regolith::{Compiler, ErrorCode, Type};
use serde_json::json;

fn single(module: regolith::ast::Module) -> ModuleSet {
    let mut set = ModuleSet::new();
    set.insert("m.rego".to_string(), module);
    set
}

#[test]
fn test_rule_types_recorded_in_env() {
    let modules = single(
        ModuleBuilder::new(&["a"])
            .rule(RuleBuilder::new("limit").value(Term::int(10)).build())
            .build(),
    );
    let mut compiler = Compiler::new();
    compiler.compile(&modules).unwrap();
    assert_eq!(
        compiler.type_env().get(&Ref::dotted(&["data", "a", "limit"])),
        Some(&Type::Number)
    );
}

#[test]
fn test_input_schema_mismatch_rejected() {
    let mut schemas = SchemaSet::new();
    schemas.put_input(json!({
        "type": "object",
        "properties": {"user": {"type": "string"}},
        "additionalProperties": false
    }));

    let modules = single(
        ModuleBuilder::new(&["a"])
            .rule(
                RuleBuilder::new("p")
                    .value(Term::boolean(true))
                    .body(eq_expr(
                        Term::ref_term(Ref::dotted(&["input", "user"])),
                        Term::int(1),
                    ))
                    .build(),
            )
            .build(),
    );
    let mut compiler = Compiler::new().with_schemas(schemas);
    let errs = compiler.compile(&modules).unwrap_err();
    assert!(errs.has_code(ErrorCode::TypeErr));
    assert!(errs.to_string().contains("match error"));
}

#[test]
fn test_input_schema_match_accepted() {
    let mut schemas = SchemaSet::new();
    schemas.put_input(json!({
        "type": "object",
        "properties": {"user": {"type": "string"}},
        "additionalProperties": false
    }));

    let modules = single(
        ModuleBuilder::new(&["a"])
            .rule(
                RuleBuilder::new("p")
                    .value(Term::boolean(true))
                    .body(eq_expr(
                        Term::ref_term(Ref::dotted(&["input", "user"])),
                        Term::string("admin"),
                    ))
                    .build(),
            )
            .build(),
    );
    let mut compiler = Compiler::new().with_schemas(schemas);
    assert!(compiler.compile(&modules).is_ok());
}

#[test]
fn test_builtin_operand_mismatch_through_pipeline() {
    // startswith(1, "x") — first operand must be a string
    let modules = single(
        ModuleBuilder::new(&["a"])
            .rule(
                RuleBuilder::new("p")
                    .value(Term::boolean(true))
                    .body(call_expr(
                        "startswith",
                        vec![Term::int(1), Term::string("x")],
                    ))
                    .build(),
            )
            .build(),
    );
    let mut compiler = Compiler::new();
    let errs = compiler.compile(&modules).unwrap_err();
    assert!(errs.has_code(ErrorCode::TypeErr));
    assert!(errs.to_string().contains("must be string but got number"));
}

#[test]
fn test_data_schema_types_refs() {
    let mut schemas = SchemaSet::new();
    schemas.put(
        &Ref::dotted(&["data", "servers"]),
        json!({"type": "array", "items": {"type": "string"}}),
    );

    // eq(data.servers, 1) cannot unify an array with a number
    let modules = single(
        ModuleBuilder::new(&["a"])
            .rule(
                RuleBuilder::new("p")
                    .value(Term::boolean(true))
                    .body(eq_expr(
                        Term::ref_term(Ref::dotted(&["data", "servers"])),
                        Term::int(1),
                    ))
                    .build(),
            )
            .build(),
    );
    let mut compiler = Compiler::new().with_schemas(schemas);
    let errs = compiler.compile(&modules).unwrap_err();
    assert!(errs.has_code(ErrorCode::TypeErr));
}

#[test]
fn test_function_result_flows_to_callers() {
    // f(x) := x; p { f(1, out); startswith(out, "s") } — out is any via f,
    // so no error; the call itself type-checks.
    let modules = single(
        ModuleBuilder::new(&["a"])
            .rule(
                RuleBuilder::new("f")
                    .args(vec![Term::var("x")])
                    .value(Term::var("x"))
                    .build(),
            )
            .rule(
                RuleBuilder::new("p")
                    .value(Term::boolean(true))
                    .body(eq_expr(
                        Term::var("out"),
                        Term::call(vec![Term::ref_term(
                            regolith::ast::builders::operator_ref("f"),
                        ), Term::int(1)]),
                    ))
                    .build(),
            )
            .build(),
    );
    let mut compiler = Compiler::new();
    assert!(compiler.compile(&modules).is_ok());
    assert!(matches!(
        compiler.type_env().get(&Ref::dotted(&["data", "a", "f"])),
        Some(Type::Function { .. })
    ));
}

#[test]
fn test_type_errors_accumulate_to_limit() {
    let mut builder = ModuleBuilder::new(&["a"]);
    for i in 0..6 {
        builder = builder.rule(
            RuleBuilder::new(&format!("r{i}"))
                .value(Term::boolean(true))
                .body(eq_expr(Term::string("s"), Term::int(1)))
                .build(),
        );
    }
    let modules = single(builder.build());
    let mut compiler = Compiler::new().with_max_errors(3);
    let errs = compiler.compile(&modules).unwrap_err();
    assert!(errs.0.last().is_some_and(regolith::Error::is_limit_marker));
    assert!(errs.len() <= 5);
}
