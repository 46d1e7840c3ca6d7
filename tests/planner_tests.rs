//! Planner Integration Tests
//!
//! Entrypoint lowering and the stability of the IR JSON surface.

use regolith::ast::builders::{eq_expr, ModuleBuilder, RuleBuilder};
use regolith::ast::{ModuleSet, Ref, Term};
use regolith::{plan, Compiler, EvalMode};

fn compiled(modules: Vec<(&str, regolith::ast::Module)>) -> Compiler {
    let mut set = ModuleSet::new();
    for (k, m) in modules {
        set.insert(k.to_string(), m);
    }
    let mut compiler = Compiler::new().with_eval_mode(EvalMode::IR);
    compiler.compile(&set).unwrap();
    compiler
}

fn sample_compiler() -> Compiler {
    compiled(vec![(
        "m.rego",
        ModuleBuilder::new(&["authz"])
            .rule(
                RuleBuilder::new("allow")
                    .value(Term::boolean(true))
                    .body(eq_expr(
                        Term::ref_term(Ref::dotted(&["input", "role"])),
                        Term::string("admin"),
                    ))
                    .build(),
            )
            .build(),
    )])
}

#[test]
fn test_policy_json_surface_is_stable() {
    let compiler = sample_compiler();
    let policy = plan(&compiler, &["authz/allow"]).unwrap();
    let json = policy.to_json().unwrap();

    // Top-level shape: {static, plans, funcs}
    let obj = json.as_object().unwrap();
    assert!(obj.contains_key("static"));
    assert!(obj.contains_key("plans"));
    assert!(obj.contains_key("funcs"));

    // Plans carry name + blocks of stmts.
    assert_eq!(json["plans"][0]["name"], "authz/allow");
    assert!(json["plans"][0]["blocks"][0]["stmts"].is_array());

    // Statements are dispatchable by their type tag.
    let stmt = &json["plans"][0]["blocks"][0]["stmts"][0];
    assert!(stmt["type"].is_string());
    assert!(stmt["stmt"].is_object());

    // Interned strings appear once in static.
    let strings: Vec<&str> = json["static"]["strings"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["value"].as_str().unwrap())
        .collect();
    assert!(strings.contains(&"admin"));
    let admin_count = strings.iter().filter(|s| **s == "admin").count();
    assert_eq!(admin_count, 1);
}

#[test]
fn test_policy_round_trips_through_json() {
    let compiler = sample_compiler();
    let policy = plan(&compiler, &["authz/allow"]).unwrap();
    let json = serde_json::to_string(&policy).unwrap();
    let back: regolith::Policy = serde_json::from_str(&json).unwrap();
    assert_eq!(back, policy);
}

#[test]
fn test_one_plan_per_entrypoint() {
    let compiler = compiled(vec![(
        "m.rego",
        ModuleBuilder::new(&["a"])
            .rule(RuleBuilder::new("p").value(Term::int(1)).build())
            .rule(RuleBuilder::new("q").value(Term::int(2)).build())
            .build(),
    )]);
    let policy = plan(&compiler, &["a/p", "a/q"]).unwrap();
    let names: Vec<&str> = policy.plans.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["a/p", "a/q"]);
}

#[test]
fn test_function_rules_planned_with_params() {
    let compiler = compiled(vec![(
        "m.rego",
        ModuleBuilder::new(&["a"])
            .rule(
                RuleBuilder::new("double")
                    .args(vec![Term::var("x")])
                    .value(Term::var("x"))
                    .build(),
            )
            .rule(
                RuleBuilder::new("p")
                    .value(Term::boolean(true))
                    .body(eq_expr(
                        Term::var("y"),
                        Term::call(vec![
                            Term::ref_term(regolith::ast::builders::operator_ref("double")),
                            Term::int(2),
                        ]),
                    ))
                    .build(),
            )
            .build(),
    )]);
    let policy = plan(&compiler, &["a/p"]).unwrap();
    let double = policy
        .funcs
        .iter()
        .find(|f| f.name == "g0.data.a.double")
        .expect("function rule planned");
    // input, data, and one declared argument
    assert_eq!(double.params.len(), 3);
}

#[test]
fn test_entrypoint_package_materializes_children() {
    let compiler = compiled(vec![(
        "m.rego",
        ModuleBuilder::new(&["a"])
            .rule(RuleBuilder::new("p").value(Term::int(1)).build())
            .rule(RuleBuilder::new("q").value(Term::int(2)).build())
            .build(),
    )]);
    // Entrypoint at the package: both rule sets become functions.
    let policy = plan(&compiler, &["a"]).unwrap();
    let names: Vec<&str> = policy.funcs.iter().map(|f| f.name.as_str()).collect();
    assert!(names.contains(&"g0.data.a.p"));
    assert!(names.contains(&"g0.data.a.q"));
}

#[test]
fn test_default_rule_guarded() {
    let compiler = compiled(vec![(
        "m.rego",
        ModuleBuilder::new(&["a"])
            .rule(RuleBuilder::new("p").default_value(Term::boolean(false)).build())
            .rule(
                RuleBuilder::new("p")
                    .value(Term::boolean(true))
                    .body(eq_expr(
                        Term::ref_term(Ref::dotted(&["input", "x"])),
                        Term::int(1),
                    ))
                    .build(),
            )
            .build(),
    )]);
    let policy = plan(&compiler, &["a/p"]).unwrap();
    let func = policy
        .funcs
        .iter()
        .find(|f| f.name == "g0.data.a.p")
        .unwrap();
    let json = serde_json::to_value(func).unwrap().to_string();
    assert!(json.contains("IsUndefinedStmt"));
}
