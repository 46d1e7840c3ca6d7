//! Comprehension Indexing
//!
//! For each expression `<term> = <comprehension>` in a rule body, decide
//! whether the evaluator may cache the comprehension's result per key. The
//! key variables are the outer candidate-safe variables the comprehension
//! body binds on its own; bindings of those variables memoize the result.
//!
//! An index exists only when:
//! - every variable closed over by the comprehension is either an output of
//!   its own body or a candidate-safe variable of the outer body,
//! - no nested comprehension closes over a candidate variable,
//! - no body expression calls a blocklisted built-in (`walk`), and
//! - the candidate/output intersection is non-empty.

use crate::ast::visitor::{self, VarVisitor, VarVisitorParams};
use crate::ast::{Body, Expr, Term, Value, Var};
use crate::builtins::COMPREHENSION_INDEX_BLOCKLIST;
use crate::safety::{self, ArityResolver};
use std::collections::BTreeSet;

/// A comprehension cache key: the comprehension term and the sorted outer
/// variables the evaluator should memoize on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComprehensionIndex {
    pub term: Term,
    pub keys: Vec<Var>,
}

/// Compute the index for one body expression, if the expression is an
/// indexable `<term> = <comprehension>` and the criteria hold.
/// `candidates` is the candidate-safe variable set of the outer body at
/// this expression's position (arguments plus earlier outputs).
pub fn index_for_expr(
    expr: &Expr,
    candidates: &BTreeSet<Var>,
    arity: &ArityResolver<'_>,
) -> Option<ComprehensionIndex> {
    if expr.negated || !expr.with.is_empty() || !expr.is_equality() {
        return None;
    }

    let compr = expr.operands().iter().find(|t| t.value.is_comprehension())?;
    let body = comprehension_body(compr)?;

    if body_calls_blocklisted(body) {
        return None;
    }

    if nested_closure_uses_candidate(body, candidates) {
        return None;
    }

    let empty = BTreeSet::new();
    let outputs = safety::body_output_vars(body, &empty, arity);

    // Closed-over variables must come from the body itself or from the
    // outer candidate set.
    let closed_over = comprehension_vars(compr);
    for v in &closed_over {
        if v.is_wildcard() || v.is_root_document() {
            continue;
        }
        if !outputs.contains(v) && !candidates.contains(v) {
            return None;
        }
    }

    let keys: Vec<Var> = candidates
        .iter()
        .filter(|v| outputs.contains(*v) || closed_over.contains(*v))
        .filter(|v| closed_over.contains(*v))
        .cloned()
        .collect();
    if keys.is_empty() {
        return None;
    }

    Some(ComprehensionIndex {
        term: compr.clone(),
        keys,
    })
}

fn comprehension_body(t: &Term) -> Option<&Body> {
    match &t.value {
        Value::ArrayComprehension { body, .. }
        | Value::SetComprehension { body, .. }
        | Value::ObjectComprehension { body, .. } => Some(body),
        _ => None,
    }
}

fn comprehension_vars(t: &Term) -> BTreeSet<Var> {
    let mut v = VarVisitor::new(VarVisitorParams {
        skip_ref_call_head: true,
        ..Default::default()
    });
    v.walk_term(t);
    v.into_vars()
}

fn body_calls_blocklisted(body: &Body) -> bool {
    let mut found = false;
    visitor::walk_exprs(body, &mut |e: &Expr| {
        if let Some(name) = e.operator_name() {
            if COMPREHENSION_INDEX_BLOCKLIST.contains(&name.as_str()) {
                found = true;
            }
        }
    });
    found
}

fn nested_closure_uses_candidate(body: &Body, candidates: &BTreeSet<Var>) -> bool {
    let mut found = false;
    visitor::walk_closures(body, &mut |closure| {
        let mut v = VarVisitor::new(VarVisitorParams {
            skip_ref_call_head: true,
            ..Default::default()
        });
        v.walk_body(closure.body());
        if v.vars().iter().any(|var| candidates.contains(var)) {
            found = true;
        }
    });
    found
}
