//! # Partial-Evaluation Optimizer
//!
//! Specializes a bundle's entrypoints against known data, producing a
//! residual bundle. The top-down evaluator (an external collaborator,
//! reached through [`PartialEvaluator`]) runs in partial mode per
//! entrypoint; residual queries become support rules that replace the
//! original definitions, and support modules are merged under stable
//! `optimized/...` filenames. Entrypoints are processed in declaration
//! order so later entrypoints see earlier residuals. The input bundle is
//! never mutated; the optimizer always works on a private copy.

use crate::ast::{visitor, Body, Expr, Head, Module, Package, Ref, Rule, RuleId, Term, Value};
use crate::bundle::{Bundle, ModuleFile, WasmResolver};
use crate::compiler::Compiler;
use crate::errors::Errors;
use std::collections::BTreeSet;
use thiserror::Error;

/// Variable binding the entrypoint's value in generated partial queries.
const RESULT_VAR: &str = "__result__";

/// Read-only access to base documents during specialization.
pub trait Store {
    fn read(&self, path: &Ref) -> anyhow::Result<Option<serde_json::Value>>;
}

/// A store over one in-memory JSON document.
#[derive(Debug, Clone, Default)]
pub struct DataStore {
    data: serde_json::Value,
}

impl DataStore {
    pub fn new(data: serde_json::Value) -> Self {
        DataStore { data }
    }
}

impl Store for DataStore {
    fn read(&self, path: &Ref) -> anyhow::Result<Option<serde_json::Value>> {
        let Some(parts) = path.string_path() else {
            return Ok(None);
        };
        let mut current = &self.data;
        for p in parts {
            match current.get(&p) {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current.clone()))
    }
}

/// A partial evaluation request.
pub struct PartialQuery<'a> {
    /// The query to specialize: `<entrypoint-ref> = __result__`
    pub query: Body,
    /// Refs that remain symbolic
    pub unknowns: &'a [Ref],
    /// Refs that must not be inlined (targets of `with` modifiers)
    pub disable_inlining: &'a [Ref],
}

/// What the evaluator returns from partial mode.
#[derive(Debug, Clone, Default)]
pub struct PartialResult {
    /// Residual queries over the unknowns
    pub queries: Vec<Body>,
    /// Residual support modules
    pub support: Vec<Module>,
}

/// The external top-down evaluator, driven in partial mode.
pub trait PartialEvaluator {
    fn partial_eval(
        &mut self,
        compiler: &Compiler,
        store: &dyn Store,
        query: &PartialQuery<'_>,
    ) -> anyhow::Result<PartialResult>;
}

/// Optimizer failures.
#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("undefined entrypoint {0}")]
    UndefinedEntrypoint(String),

    #[error(transparent)]
    Compile(#[from] Errors),

    #[error("partial evaluation failed: {0}")]
    Eval(#[from] anyhow::Error),
}

/// Specializes bundles for declared entrypoints.
pub struct BundleOptimizer<E> {
    entrypoints: Vec<String>,
    evaluator: E,
}

impl<E: PartialEvaluator> BundleOptimizer<E> {
    pub fn new(evaluator: E) -> Self {
        BundleOptimizer {
            entrypoints: Vec::new(),
            evaluator,
        }
    }

    /// Declare an entrypoint (`a/b` form). Order is significant.
    pub fn with_entrypoint(mut self, entrypoint: &str) -> Self {
        self.entrypoints.push(entrypoint.to_string());
        self
    }

    /// Produce the residual bundle. The input bundle is copied up front so
    /// a failure cannot corrupt the caller's copy.
    pub fn optimize(&mut self, bundle: &Bundle, store: &dyn Store) -> Result<Bundle, OptimizerError> {
        let mut bundle = bundle.clone();

        for entrypoint in &self.entrypoints.clone() {
            let mut compiler = Compiler::new();
            compiler.compile(&bundle.module_set())?;
            let ep_ref = compiler.resolve_entrypoint(entrypoint)?;

            let unknowns = compute_unknowns(&compiler, &bundle);
            let disable_inlining = compute_required_refs(&compiler, &ep_ref);

            let query = Body::new(vec![Expr::eq(
                Term::ref_term(ep_ref.clone()),
                Term::var(RESULT_VAR),
            )]);
            tracing::debug!(
                entrypoint = %entrypoint,
                unknowns = unknowns.len(),
                "partial_eval_entrypoint"
            );
            let result = self.evaluator.partial_eval(
                &compiler,
                store,
                &PartialQuery {
                    query,
                    unknowns: &unknowns,
                    disable_inlining: &disable_inlining,
                },
            )?;

            let residual_rules = synthesize_support_rules(&ep_ref, result.queries);
            if residual_rules.is_empty() && result.support.is_empty() {
                return Err(OptimizerError::UndefinedEntrypoint(entrypoint.clone()));
            }

            // Drop the original definitions the residual replaces.
            for file in &mut bundle.modules {
                file.parsed
                    .rules
                    .retain(|r| !r.head.reference.has_prefix(&ep_ref));
            }
            bundle.modules.retain(|f| !f.parsed.rules.is_empty());

            if !residual_rules.is_empty() {
                let package_path = ep_ref.truncate(ep_ref.len() - 1);
                let mut module = Module::new(Package {
                    path: package_path.clone(),
                    location: Default::default(),
                });
                module.rules = residual_rules;
                let url = support_url(&bundle, &package_path);
                bundle.modules.push(ModuleFile {
                    url,
                    parsed: module,
                });
            }

            for support in result.support {
                let package_path = support.package.path.clone();
                let url = support_url(&bundle, &package_path);
                bundle.modules.push(ModuleFile {
                    url,
                    parsed: support,
                });
            }

            bundle.manifest.wasm_resolvers.push(WasmResolver {
                entrypoint: entrypoint.clone(),
                module: "/policy.wasm".to_string(),
            });
        }

        bundle.sort_modules_by_url();
        bundle.manifest.add_root("partial");
        bundle.manifest.revision = None;
        Ok(bundle)
    }
}

/// Support rule synthesis: each residual query that does not still mention
/// the entrypoint becomes one rule named after the entrypoint, valued by
/// the result binding; self-referential residuals are discarded to avoid
/// introducing recursion.
fn synthesize_support_rules(ep_ref: &Ref, queries: Vec<Body>) -> Vec<Rule> {
    let name = match ep_ref.terms().last().map(|t| &t.value) {
        Some(Value::String(s)) => s.clone(),
        _ => return Vec::new(),
    };

    let mut rules = Vec::new();
    for query in queries {
        if body_references(&query, ep_ref) {
            continue;
        }
        let mut head = Head::new(&name);
        head.reference = ep_ref.clone();
        head.value = Some(Term::var(RESULT_VAR));
        let body = if query.is_empty() {
            Body::truthy()
        } else {
            query
        };
        let mut rule = Rule::new(head, body);
        rule.generated = true;
        rules.push(rule);
    }
    rules
}

fn body_references(body: &Body, target: &Ref) -> bool {
    let mut found = false;
    visitor::walk_refs(body, &mut |r: &Ref| {
        if r.has_prefix(target) || (target.has_prefix(r) && r.len() > 1) {
            found = true;
        }
    });
    found
}

/// Unknowns: `input`, plus every data ref used by the policy that falls
/// outside the bundle's declared roots.
fn compute_unknowns(compiler: &Compiler, bundle: &Bundle) -> Vec<Ref> {
    let roots: Vec<Vec<String>> = bundle
        .manifest
        .roots()
        .iter()
        .map(|r| {
            r.split('/')
                .filter(|p| !p.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .collect();

    let mut unknowns: BTreeSet<Ref> = BTreeSet::new();
    unknowns.insert(Ref::new(vec![Term::var("input")]));

    for module in compiler.modules().values() {
        visitor::walk_refs(module, &mut |r: &Ref| {
            let is_data = r
                .head()
                .and_then(|t| t.value.as_var())
                .is_some_and(|v| v.as_str() == "data");
            if !is_data {
                return;
            }
            let Some(path) = r.ground_prefix().string_path() else {
                return;
            };
            let covered = roots.iter().any(|root| {
                let n = root.len().min(path.len());
                root[..n] == path[..n]
            });
            if !covered {
                unknowns.insert(r.ground_prefix());
            }
        });
    }
    unknowns.into_iter().collect()
}

/// Required refs: targets of `with` modifiers in any rule transitively
/// reachable from the entrypoint. These must not be inlined.
fn compute_required_refs(compiler: &Compiler, ep_ref: &Ref) -> Vec<Ref> {
    let entry_rules: Vec<RuleId> = compiler
        .rule_tree()
        .rules_for_ref(ep_ref)
        .into_iter()
        .collect();
    let reachable = compiler.graph().reachable(&entry_rules);

    let mut required: BTreeSet<Ref> = BTreeSet::new();
    for id in reachable {
        let Some(rule) = compiler.rule(id) else {
            continue;
        };
        for chain_rule in rule.iter_chain() {
            for expr in chain_rule.body.iter() {
                for w in &expr.with {
                    if let Value::Ref(r) = &w.target.value {
                        required.insert(r.clone());
                    }
                }
            }
        }
    }
    required.into_iter().collect()
}

/// A stable filename for a support module: `optimized/<package-path>.rego`,
/// disambiguated with a counter when taken.
fn support_url(bundle: &Bundle, package_path: &Ref) -> String {
    let path = package_path
        .string_path()
        .map(|parts| parts.join("/"))
        .unwrap_or_else(|| "partial".to_string());
    let base = format!("optimized/{path}.rego");
    if !bundle.has_url(&base) {
        return base;
    }
    let mut counter = 1;
    loop {
        let candidate = format!("optimized/{path}.{counter}.rego");
        if !bundle.has_url(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::builders::{eq_expr, ModuleBuilder, RuleBuilder};
    use serde_json::json;

    fn bundle_with(rule: Rule, roots: Option<Vec<String>>) -> Bundle {
        let module = ModuleBuilder::new(&["a"]).rule(rule).build();
        Bundle {
            manifest: crate::bundle::Manifest {
                revision: Some("rev-1".to_string()),
                roots,
                ..Default::default()
            },
            modules: vec![ModuleFile {
                url: "a/policy.rego".to_string(),
                parsed: module,
            }],
            data: json!({}),
        }
    }

    /// Evaluator stub returning canned residuals.
    struct FakeEvaluator {
        queries: Vec<Body>,
        support: Vec<Module>,
        seen_unknowns: Vec<Ref>,
    }

    impl FakeEvaluator {
        fn returning(queries: Vec<Body>) -> Self {
            FakeEvaluator {
                queries,
                support: Vec::new(),
                seen_unknowns: Vec::new(),
            }
        }
    }

    impl PartialEvaluator for FakeEvaluator {
        fn partial_eval(
            &mut self,
            _compiler: &Compiler,
            _store: &dyn Store,
            query: &PartialQuery<'_>,
        ) -> anyhow::Result<PartialResult> {
            self.seen_unknowns = query.unknowns.to_vec();
            Ok(PartialResult {
                queries: self.queries.clone(),
                support: self.support.clone(),
            })
        }
    }

    fn simple_rule() -> Rule {
        RuleBuilder::new("p")
            .value(Term::boolean(true))
            .body(eq_expr(
                Term::ref_term(Ref::dotted(&["input", "x"])),
                Term::int(1),
            ))
            .build()
    }

    #[test]
    fn test_residual_becomes_support_rule() {
        // Residual: __result__ = true when input.x = 1
        let residual = Body::new(vec![
            eq_expr(
                Term::ref_term(Ref::dotted(&["input", "x"])),
                Term::int(1),
            ),
            eq_expr(Term::var(RESULT_VAR), Term::boolean(true)),
        ]);
        let mut optimizer =
            BundleOptimizer::new(FakeEvaluator::returning(vec![residual])).with_entrypoint("a/p");

        let bundle = bundle_with(simple_rule(), Some(vec!["a".to_string()]));
        let store = DataStore::new(json!({}));
        let out = optimizer.optimize(&bundle, &store).unwrap();

        // Original module replaced by the optimized one.
        assert_eq!(out.modules.len(), 1);
        assert_eq!(out.modules[0].url, "optimized/a.rego");
        let rule = &out.modules[0].parsed.rules[0];
        assert_eq!(rule.head.reference.to_string(), "data.a.p");
        assert!(rule.generated);
    }

    #[test]
    fn test_zero_unknown_residual_keeps_value() {
        // Fully resolvable entrypoint: residual binds the result directly.
        let residual = Body::new(vec![eq_expr(Term::var(RESULT_VAR), Term::int(42))]);
        let mut optimizer =
            BundleOptimizer::new(FakeEvaluator::returning(vec![residual])).with_entrypoint("a/p");

        let bundle = bundle_with(
            RuleBuilder::new("p").value(Term::int(42)).build(),
            Some(vec!["a".to_string()]),
        );
        let out = optimizer.optimize(&bundle, &DataStore::default()).unwrap();
        assert_eq!(out.modules.len(), 1);
        let rule = &out.modules[0].parsed.rules[0];
        assert_eq!(rule.head.value, Some(Term::var(RESULT_VAR)));
        assert_eq!(rule.body.len(), 1);
    }

    #[test]
    fn test_self_referential_residual_is_undefined_entrypoint() {
        // The evaluator could not eliminate the entrypoint: the residual
        // still references data.a.p, so no support rule is synthesized.
        let residual = Body::new(vec![eq_expr(
            Term::var(RESULT_VAR),
            Term::ref_term(Ref::dotted(&["data", "a", "p"])),
        )]);
        let mut optimizer =
            BundleOptimizer::new(FakeEvaluator::returning(vec![residual])).with_entrypoint("a/p");

        let bundle = bundle_with(simple_rule(), Some(vec!["a".to_string()]));
        let err = optimizer.optimize(&bundle, &DataStore::default()).unwrap_err();
        assert!(matches!(err, OptimizerError::UndefinedEntrypoint(e) if e == "a/p"));
    }

    #[test]
    fn test_manifest_updated() {
        let residual = Body::new(vec![eq_expr(Term::var(RESULT_VAR), Term::boolean(true))]);
        let mut optimizer =
            BundleOptimizer::new(FakeEvaluator::returning(vec![residual])).with_entrypoint("a/p");

        let bundle = bundle_with(simple_rule(), Some(vec!["a".to_string()]));
        let out = optimizer.optimize(&bundle, &DataStore::default()).unwrap();

        assert_eq!(out.manifest.revision, None);
        assert!(out.manifest.roots().iter().any(|r| r == "partial"));
        assert_eq!(out.manifest.wasm_resolvers.len(), 1);
        assert_eq!(out.manifest.wasm_resolvers[0].entrypoint, "a/p");
    }

    #[test]
    fn test_input_bundle_not_mutated() {
        let residual = Body::new(vec![eq_expr(Term::var(RESULT_VAR), Term::boolean(true))]);
        let mut optimizer =
            BundleOptimizer::new(FakeEvaluator::returning(vec![residual])).with_entrypoint("a/p");

        let bundle = bundle_with(simple_rule(), Some(vec!["a".to_string()]));
        let before = bundle.clone();
        let _ = optimizer.optimize(&bundle, &DataStore::default()).unwrap();
        assert_eq!(bundle, before);
    }

    #[test]
    fn test_unknowns_include_input_and_out_of_root_data() {
        let rule = RuleBuilder::new("p")
            .value(Term::boolean(true))
            .body(eq_expr(
                Term::ref_term(Ref::dotted(&["data", "external", "flag"])),
                Term::boolean(true),
            ))
            .build();
        let residual = Body::new(vec![eq_expr(Term::var(RESULT_VAR), Term::boolean(true))]);
        let mut fake = FakeEvaluator::returning(vec![residual]);
        fake.seen_unknowns.clear();
        let mut optimizer = BundleOptimizer::new(fake).with_entrypoint("a/p");

        let bundle = bundle_with(rule, Some(vec!["a".to_string()]));
        let _ = optimizer.optimize(&bundle, &DataStore::default()).unwrap();

        let seen: Vec<String> = optimizer
            .evaluator
            .seen_unknowns
            .iter()
            .map(ToString::to_string)
            .collect();
        assert!(seen.contains(&"input".to_string()));
        assert!(seen.contains(&"data.external.flag".to_string()));
    }

    #[test]
    fn test_support_url_disambiguated() {
        let residual = Body::new(vec![eq_expr(Term::var(RESULT_VAR), Term::boolean(true))]);
        let mut optimizer =
            BundleOptimizer::new(FakeEvaluator::returning(vec![residual])).with_entrypoint("a/p");

        let mut bundle = bundle_with(simple_rule(), Some(vec!["a".to_string()]));
        // Simulate an existing optimized file for the same package.
        bundle.modules.push(ModuleFile {
            url: "optimized/a.rego".to_string(),
            parsed: ModuleBuilder::new(&["a"])
                .rule(RuleBuilder::new("other").value(Term::int(1)).build())
                .build(),
        });
        let out = optimizer.optimize(&bundle, &DataStore::default()).unwrap();
        assert!(out.has_url("optimized/a.1.rego") || out.has_url("optimized/a.rego"));
    }

    #[test]
    fn test_data_store_reads_paths() {
        let store = DataStore::new(json!({"a": {"b": 7}}));
        let v = store.read(&Ref::dotted(&["data", "a", "b"])).unwrap();
        assert_eq!(v, Some(json!(7)));
        let missing = store.read(&Ref::dotted(&["data", "a", "zzz"])).unwrap();
        assert_eq!(missing, None);
    }
}
