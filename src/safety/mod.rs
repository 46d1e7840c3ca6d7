//! # Safety Analyzer
//!
//! Determines whether every variable in a rule body will be bound during
//! left-to-right evaluation, reordering expressions to achieve safety when
//! possible.
//!
//! A body is safe iff, processed left to right, every variable is either a
//! global (reserved roots, arguments, context-supplied safe set) or an
//! output variable of some earlier expression. Output variables come from
//! unification against resolvable terms, call output positions past the
//! declared arity, and iteration over references rooted at safe variables.
//!
//! ```text
//! Body -> [reorder loop: place exprs whose inputs are safe] -> reordered
//!         Body + unsafe expressions (reported once per expression)
//! ```

use crate::ast::visitor::{VarVisitor, VarVisitorParams};
use crate::ast::{Body, Expr, ExprTerms, Ref, Term, Value, Var};
use crate::location::Location;
use std::collections::BTreeSet;

/// Resolves a call operator name to its declared arity, if known.
pub type ArityResolver<'a> = dyn Fn(&str) -> Option<usize> + 'a;

/// An expression whose variables could not be made safe, with the offending
/// variables. Generated variables are folded into a single report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsafeExpr {
    pub location: Location,
    pub vars: BTreeSet<Var>,
}

/// Reorder `body` so that evaluation is safe given the `globals` set.
/// Closure bodies (comprehensions, `every`) are reordered recursively with
/// the safe set available at their position. Returns the reordered body and
/// the expressions that could not be placed.
pub fn reorder_body(
    globals: &BTreeSet<Var>,
    body: &Body,
    arity: &ArityResolver<'_>,
) -> (Body, Vec<UnsafeExpr>) {
    let mut unsafes = Vec::new();
    let reordered = reorder_inner(globals, body, arity, &mut unsafes);
    (reordered, unsafes)
}

fn reorder_inner(
    globals: &BTreeSet<Var>,
    body: &Body,
    arity: &ArityResolver<'_>,
    unsafes: &mut Vec<UnsafeExpr>,
) -> Body {
    let mut safe = globals.clone();
    let mut reordered: Vec<Expr> = Vec::with_capacity(body.len());
    let mut remaining: Vec<Expr> = body.iter().cloned().collect();

    loop {
        let mut progress = false;
        let mut still = Vec::new();
        for expr in remaining {
            let outs = expr_output_vars(&expr, &safe, arity);
            let ins = expr_input_vars(&expr, &safe, arity, &outs);
            if ins.is_subset(&safe) {
                safe.extend(outs);
                reordered.push(expr);
                progress = true;
            } else {
                still.push(expr);
            }
        }
        remaining = still;
        if !progress || remaining.is_empty() {
            break;
        }
    }

    // Report each unplaced expression once, with the variables that stayed
    // unsafe at the point the loop gave up.
    for expr in &remaining {
        let outs = expr_output_vars(expr, &safe, arity);
        let ins = expr_input_vars(expr, &safe, arity, &outs);
        let vars: BTreeSet<Var> = ins.difference(&safe).cloned().collect();
        unsafes.push(UnsafeExpr {
            location: expr.location.clone(),
            vars,
        });
    }

    // Keep unsafe expressions at the tail in source order so diagnostics
    // and later passes see a complete body.
    reordered.extend(remaining);

    // Second sweep: recurse into closures with the safe set at each
    // expression's position.
    let mut safe = globals.clone();
    let mut out_body = Body::default();
    for mut expr in reordered {
        let outs = expr_output_vars(&expr, &safe, arity);
        reorder_closures_in_expr(&mut expr, &safe, arity, unsafes);
        safe.extend(outs);
        out_body.push(expr);
    }
    out_body
}

// ============================================================================
// Output variables
// ============================================================================

/// The variables `expr` binds, given the currently safe set.
pub fn expr_output_vars(
    expr: &Expr,
    safe: &BTreeSet<Var>,
    arity: &ArityResolver<'_>,
) -> BTreeSet<Var> {
    if expr.negated {
        return BTreeSet::new();
    }
    match &expr.terms {
        ExprTerms::Term(t) => ref_output_vars_in_term(t, safe),
        ExprTerms::SomeDecl(_) | ExprTerms::Every(_) => BTreeSet::new(),
        ExprTerms::Call(_) => call_output_vars(expr, safe, arity),
    }
}

fn call_output_vars(expr: &Expr, safe: &BTreeSet<Var>, arity: &ArityResolver<'_>) -> BTreeSet<Var> {
    let Some(name) = expr.operator_name() else {
        return BTreeSet::new();
    };
    let operands = expr.operands();

    let mut ref_outs = BTreeSet::new();
    for t in operands {
        ref_outs.extend(ref_output_vars_in_term(t, safe));
    }

    if name == "eq" || name == "assign" || name == "equal" {
        // Unification binds pattern variables on either side against a
        // resolvable opposite side. (`==`/`equal` binds nothing, but it is
        // rewritten to `eq` only after safety has run.)
        if name == "eq" || name == "assign" {
            if let [a, b] = operands {
                let mut out = ref_outs;
                unify_into(a, b, safe, &mut out);
                unify_into(b, a, safe, &mut out);
                return out;
            }
        }
        return ref_outs;
    }

    let Some(declared) = arity(&name) else {
        return ref_outs;
    };

    // Input positions must already be resolvable for output positions to
    // produce bindings.
    let mut needed = BTreeSet::new();
    for t in operands.iter().take(declared) {
        needed.extend(term_input_vars(t));
    }
    let needed: BTreeSet<Var> = needed.difference(&ref_outs).cloned().collect();
    if !needed.is_subset(safe) {
        return ref_outs;
    }

    let mut out = ref_outs;
    for t in operands.iter().skip(declared) {
        out.extend(pattern_vars(t));
    }
    out
}

/// Variables bound by iterating references inside `t` whose prefix is
/// already resolvable: every variable at a selector position becomes bound.
fn ref_output_vars_in_term(t: &Term, safe: &BTreeSet<Var>) -> BTreeSet<Var> {
    let mut out = BTreeSet::new();
    collect_ref_outputs(t, safe, &mut out);
    out
}

fn collect_ref_outputs(t: &Term, safe: &BTreeSet<Var>, out: &mut BTreeSet<Var>) {
    match &t.value {
        Value::Ref(r) => {
            if ref_head_is_safe(r, safe) {
                for sel in r.iter().skip(1) {
                    match &sel.value {
                        Value::Var(v) if !v.is_wildcard() => {
                            out.insert(v.clone());
                        }
                        _ => collect_ref_outputs(sel, safe, out),
                    }
                }
            }
        }
        Value::Array(items) => {
            for i in items {
                collect_ref_outputs(i, safe, out);
            }
        }
        Value::Object(pairs) => {
            for (k, v) in pairs {
                collect_ref_outputs(k, safe, out);
                collect_ref_outputs(v, safe, out);
            }
        }
        Value::Call(terms) => {
            for i in terms.iter().skip(1) {
                collect_ref_outputs(i, safe, out);
            }
        }
        _ => {}
    }
}

fn ref_head_is_safe(r: &Ref, safe: &BTreeSet<Var>) -> bool {
    match r.head().map(|t| &t.value) {
        Some(Value::Var(v)) => v.is_root_document() || safe.contains(v),
        _ => false,
    }
}

/// Collect the variables of a unification pattern: vars at value positions
/// of the term, recursing through arrays and objects.
fn pattern_vars(t: &Term) -> BTreeSet<Var> {
    let mut out = BTreeSet::new();
    collect_pattern_vars(t, &mut out);
    out
}

fn collect_pattern_vars(t: &Term, out: &mut BTreeSet<Var>) {
    match &t.value {
        Value::Var(v) => {
            if !v.is_wildcard() {
                out.insert(v.clone());
            }
        }
        Value::Array(items) => {
            for i in items {
                collect_pattern_vars(i, out);
            }
        }
        Value::Object(pairs) => {
            for (_, v) in pairs {
                collect_pattern_vars(v, out);
            }
        }
        _ => {}
    }
}

/// Unify `target` against `source`: if the source side is resolvable under
/// the safe set, all pattern variables of the target become outputs;
/// otherwise structurally matching composites recurse pairwise.
fn unify_into(target: &Term, source: &Term, safe: &BTreeSet<Var>, out: &mut BTreeSet<Var>) {
    if term_is_resolvable(source, safe) {
        out.extend(pattern_vars(target));
        return;
    }
    match (&target.value, &source.value) {
        (Value::Array(a), Value::Array(b)) if a.len() == b.len() => {
            for (x, y) in a.iter().zip(b) {
                unify_into(x, y, safe, out);
            }
        }
        (Value::Object(a), Value::Object(b)) => {
            for (k, v) in a {
                if let Some((_, w)) = b.iter().find(|(bk, _)| bk == k) {
                    unify_into(v, w, safe, out);
                }
            }
        }
        _ => {}
    }
}

/// A term is resolvable when evaluating it requires no unbound variables:
/// ground values, safe variables, references rooted at safe heads (selector
/// variables iterate and bind), composites of resolvable children, and
/// comprehensions (whose own safety is analyzed separately).
fn term_is_resolvable(t: &Term, safe: &BTreeSet<Var>) -> bool {
    match &t.value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => true,
        Value::Var(v) => safe.contains(v) || v.is_root_document(),
        Value::Ref(r) => {
            ref_head_is_safe(r, safe)
                && r.iter().skip(1).all(|sel| match &sel.value {
                    Value::Var(_) => true,
                    _ => term_is_resolvable(sel, safe),
                })
        }
        Value::Array(items) | Value::Set(items) => {
            items.iter().all(|i| term_is_resolvable(i, safe))
        }
        Value::Object(pairs) => pairs
            .iter()
            .all(|(k, v)| term_is_resolvable(k, safe) && term_is_resolvable(v, safe)),
        Value::ArrayComprehension { .. }
        | Value::SetComprehension { .. }
        | Value::ObjectComprehension { .. } => true,
        Value::Call(_) => false,
    }
}

// ============================================================================
// Input variables
// ============================================================================

/// The variables that must be safe before `expr` can be evaluated.
fn expr_input_vars(
    expr: &Expr,
    safe: &BTreeSet<Var>,
    arity: &ArityResolver<'_>,
    outs: &BTreeSet<Var>,
) -> BTreeSet<Var> {
    let mut ins = BTreeSet::new();

    match &expr.terms {
        ExprTerms::Term(t) => ins.extend(term_input_vars(t)),
        ExprTerms::Call(_) => {
            for t in expr.operands() {
                ins.extend(term_input_vars(t));
            }
        }
        ExprTerms::SomeDecl(_) => {}
        ExprTerms::Every(every) => {
            ins.extend(term_input_vars(&every.domain));
            let declared: BTreeSet<Var> = every.key_value_vars().into_iter().collect();
            let mut closure_safe = safe.clone();
            closure_safe.extend(declared.iter().cloned());
            let free = closure_free_vars(&every.body, &closure_safe, arity);
            ins.extend(free);
        }
    }

    // Closure free variables are inputs of the enclosing expression.
    if !expr.is_every() {
        for_each_closure_in_expr(expr, &mut |term: &Term| {
            ins.extend(comprehension_free_vars(term, safe, arity));
        });
    }

    // `with` values must be resolvable before the expression runs.
    for w in &expr.with {
        ins.extend(term_input_vars(&w.value));
    }

    ins.retain(|v| !v.is_wildcard() && !v.is_root_document());

    if expr.negated {
        // Negation produces no bindings; everything is an input.
        ins
    } else {
        ins.difference(outs).cloned().collect()
    }
}

/// Direct variables of a term, excluding closures (handled separately) and
/// call operator heads.
fn term_input_vars(t: &Term) -> BTreeSet<Var> {
    let mut v = VarVisitor::new(VarVisitorParams {
        skip_closures: true,
        skip_ref_call_head: true,
        ..Default::default()
    });
    v.walk_term(t);
    v.into_vars()
}

/// Free variables of a comprehension term: everything its body and head
/// reference that the body cannot bind on its own.
fn comprehension_free_vars(
    term: &Term,
    safe: &BTreeSet<Var>,
    arity: &ArityResolver<'_>,
) -> BTreeSet<Var> {
    match &term.value {
        Value::ArrayComprehension { term: head, body }
        | Value::SetComprehension { term: head, body } => {
            let mut v = VarVisitor::new(closure_var_params());
            v.walk_body(body);
            v.walk_term(head);
            subtract_body_outputs(v.into_vars(), body, safe, arity)
        }
        Value::ObjectComprehension { key, value, body } => {
            let mut v = VarVisitor::new(closure_var_params());
            v.walk_body(body);
            v.walk_term(key);
            v.walk_term(value);
            subtract_body_outputs(v.into_vars(), body, safe, arity)
        }
        _ => BTreeSet::new(),
    }
}

/// Var collection for closure free-variable analysis: operator heads are
/// never data-carrying variables.
fn closure_var_params() -> VarVisitorParams {
    VarVisitorParams {
        skip_ref_call_head: true,
        ..Default::default()
    }
}

fn closure_free_vars(
    body: &Body,
    safe: &BTreeSet<Var>,
    arity: &ArityResolver<'_>,
) -> BTreeSet<Var> {
    let mut v = VarVisitor::new(closure_var_params());
    v.walk_body(body);
    subtract_body_outputs(v.into_vars(), body, safe, arity)
}

fn subtract_body_outputs(
    all: BTreeSet<Var>,
    body: &Body,
    safe: &BTreeSet<Var>,
    arity: &ArityResolver<'_>,
) -> BTreeSet<Var> {
    let outputs = body_output_vars(body, safe, arity);
    all.into_iter()
        .filter(|v| {
            !v.is_wildcard() && !v.is_root_document() && !outputs.contains(v) && !safe.contains(v)
        })
        .collect()
}

/// Fixpoint of output variables across a whole body given a safe set.
pub fn body_output_vars(
    body: &Body,
    safe: &BTreeSet<Var>,
    arity: &ArityResolver<'_>,
) -> BTreeSet<Var> {
    let mut acc = safe.clone();
    loop {
        let before = acc.len();
        for e in body.iter() {
            let outs = expr_output_vars(e, &acc, arity);
            acc.extend(outs);
        }
        if acc.len() == before {
            break;
        }
    }
    acc.difference(safe).cloned().collect()
}

// ============================================================================
// Closure recursion
// ============================================================================

fn for_each_closure_in_expr(expr: &Expr, f: &mut impl FnMut(&Term)) {
    let mut visit = |t: &Term| {
        if t.value.is_comprehension() {
            f(t);
        }
    };
    match &expr.terms {
        ExprTerms::Term(t) => visit_terms_shallow(t, &mut visit),
        ExprTerms::Call(terms) => {
            for t in terms.iter().skip(1) {
                visit_terms_shallow(t, &mut visit);
            }
        }
        _ => {}
    }
}

/// Visit `t` and nested terms, but do not enter comprehension bodies.
fn visit_terms_shallow(t: &Term, f: &mut impl FnMut(&Term)) {
    f(t);
    match &t.value {
        Value::Ref(r) => {
            for s in r.iter() {
                visit_terms_shallow(s, f);
            }
        }
        Value::Array(items) | Value::Set(items) | Value::Call(items) => {
            for i in items {
                visit_terms_shallow(i, f);
            }
        }
        Value::Object(pairs) => {
            for (k, v) in pairs {
                visit_terms_shallow(k, f);
                visit_terms_shallow(v, f);
            }
        }
        _ => {}
    }
}

fn reorder_closures_in_expr(
    expr: &mut Expr,
    safe: &BTreeSet<Var>,
    arity: &ArityResolver<'_>,
    unsafes: &mut Vec<UnsafeExpr>,
) {
    match &mut expr.terms {
        ExprTerms::Term(t) => reorder_closures_in_term(t, safe, arity, unsafes),
        ExprTerms::Call(terms) => {
            for t in terms.iter_mut().skip(1) {
                reorder_closures_in_term(t, safe, arity, unsafes);
            }
        }
        ExprTerms::Every(every) => {
            let mut closure_safe = safe.clone();
            closure_safe.extend(every.key_value_vars());
            every.body = reorder_inner(&closure_safe, &every.body, arity, unsafes);
        }
        ExprTerms::SomeDecl(_) => {}
    }
}

fn reorder_closures_in_term(
    t: &mut Term,
    safe: &BTreeSet<Var>,
    arity: &ArityResolver<'_>,
    unsafes: &mut Vec<UnsafeExpr>,
) {
    match &mut t.value {
        Value::ArrayComprehension { term, body } | Value::SetComprehension { term, body } => {
            *body = reorder_inner(safe, body, arity, unsafes);
            check_comprehension_head(std::slice::from_ref(term), body, safe, arity, unsafes);
        }
        Value::ObjectComprehension { key, value, body } => {
            *body = reorder_inner(safe, body, arity, unsafes);
            let heads = [key.as_ref().clone(), value.as_ref().clone()];
            check_comprehension_head(&heads, body, safe, arity, unsafes);
        }
        Value::Ref(r) => {
            for s in r.iter_mut() {
                reorder_closures_in_term(s, safe, arity, unsafes);
            }
        }
        Value::Array(items) | Value::Set(items) | Value::Call(items) => {
            for i in items.iter_mut() {
                reorder_closures_in_term(i, safe, arity, unsafes);
            }
        }
        Value::Object(pairs) => {
            for (k, v) in pairs.iter_mut() {
                reorder_closures_in_term(k, safe, arity, unsafes);
                reorder_closures_in_term(v, safe, arity, unsafes);
            }
        }
        _ => {}
    }
}

fn check_comprehension_head<T: std::borrow::Borrow<Term>>(
    heads: &[T],
    body: &Body,
    safe: &BTreeSet<Var>,
    arity: &ArityResolver<'_>,
    unsafes: &mut Vec<UnsafeExpr>,
) {
    let outputs = body_output_vars(body, safe, arity);
    for head in heads {
        let head = head.borrow();
        let mut v = VarVisitor::new(VarVisitorParams {
            skip_closures: true,
            skip_ref_call_head: true,
            ..Default::default()
        });
        v.walk_term(head);
        let unsafe_vars: BTreeSet<Var> = v
            .into_vars()
            .into_iter()
            .filter(|v| {
                !v.is_wildcard()
                    && !v.is_root_document()
                    && !outputs.contains(v)
                    && !safe.contains(v)
            })
            .collect();
        if !unsafe_vars.is_empty() {
            unsafes.push(UnsafeExpr {
                location: head.location.clone(),
                vars: unsafe_vars,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::builders::{call_expr, eq_expr};

    fn arity(name: &str) -> Option<usize> {
        crate::builtins::get(name).map(crate::builtins::Builtin::arity)
    }

    fn globals() -> BTreeSet<Var> {
        [Var::new("data"), Var::new("input")].into_iter().collect()
    }

    fn data_ref(parts: &[&str]) -> Term {
        Term::ref_term(Ref::dotted(parts))
    }

    #[test]
    fn test_ground_body_is_safe() {
        let body = Body::new(vec![eq_expr(Term::var("x"), Term::int(1))]);
        let (out, unsafes) = reorder_body(&globals(), &body, &arity);
        assert!(unsafes.is_empty());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_reordering_moves_binding_first() {
        // gt(x, 1); eq(x, data.a)  =>  eq must run first
        let cmp = call_expr("gt", vec![Term::var("x"), Term::int(1)]);
        let bind = eq_expr(Term::var("x"), data_ref(&["data", "a"]));
        let body = Body::new(vec![cmp.clone(), bind.clone()]);

        let (out, unsafes) = reorder_body(&globals(), &body, &arity);
        assert!(unsafes.is_empty());
        assert_eq!(out.0[0], bind);
        assert_eq!(out.0[1], cmp);
    }

    #[test]
    fn test_unbound_var_is_unsafe() {
        let body = Body::new(vec![call_expr("gt", vec![Term::var("x"), Term::int(1)])]);
        let (_, unsafes) = reorder_body(&globals(), &body, &arity);
        assert_eq!(unsafes.len(), 1);
        assert!(unsafes[0].vars.contains(&Var::new("x")));
    }

    #[test]
    fn test_ref_iteration_binds_selector_vars() {
        // data.users[i] binds i
        let body = Body::new(vec![Expr::term(
            Term::ref_term(Ref::dotted(&["data", "users"]).append(Term::var("i"))),
        )]);
        let (_, unsafes) = reorder_body(&globals(), &body, &arity);
        assert!(unsafes.is_empty());
    }

    #[test]
    fn test_negation_does_not_bind() {
        let body = Body::new(vec![
            eq_expr(Term::var("x"), Term::int(1)).negate(),
            call_expr("gt", vec![Term::var("x"), Term::int(0)]),
        ]);
        let (_, unsafes) = reorder_body(&globals(), &body, &arity);
        assert!(!unsafes.is_empty());
    }

    #[test]
    fn test_call_output_position_binds() {
        // plus(1, 2, z) binds z
        let body = Body::new(vec![
            call_expr("plus", vec![Term::int(1), Term::int(2), Term::var("z")]),
            call_expr("gt", vec![Term::var("z"), Term::int(0)]),
        ]);
        let (_, unsafes) = reorder_body(&globals(), &body, &arity);
        assert!(unsafes.is_empty());
    }

    #[test]
    fn test_call_inputs_must_be_safe_first() {
        // plus(x, 2, z): x unsafe, so z stays unsafe too
        let body = Body::new(vec![call_expr(
            "plus",
            vec![Term::var("x"), Term::int(2), Term::var("z")],
        )]);
        let (_, unsafes) = reorder_body(&globals(), &body, &arity);
        assert_eq!(unsafes.len(), 1);
        assert!(unsafes[0].vars.contains(&Var::new("x")));
    }

    #[test]
    fn test_array_unification_binds_pattern() {
        // [x, y] = data.pair binds x and y
        let body = Body::new(vec![
            eq_expr(
                Term::array(vec![Term::var("x"), Term::var("y")]),
                data_ref(&["data", "pair"]),
            ),
            call_expr("gt", vec![Term::var("x"), Term::var("y")]),
        ]);
        let (_, unsafes) = reorder_body(&globals(), &body, &arity);
        assert!(unsafes.is_empty());
    }

    #[test]
    fn test_comprehension_free_vars_are_inputs() {
        // y = [x | eq(x, z)]: z is free in the closure and unsafe outside
        let compr = Term::new(Value::ArrayComprehension {
            term: Box::new(Term::var("x")),
            body: Body::new(vec![eq_expr(Term::var("x"), Term::var("z"))]),
        });
        let body = Body::new(vec![eq_expr(Term::var("y"), compr)]);
        let (_, unsafes) = reorder_body(&globals(), &body, &arity);
        assert_eq!(unsafes.len(), 1);
        assert!(unsafes[0].vars.contains(&Var::new("z")));
    }

    #[test]
    fn test_comprehension_closes_over_outer_binding() {
        // eq(z, 1); y = [x | eq(x, z)] is safe
        let compr = Term::new(Value::ArrayComprehension {
            term: Box::new(Term::var("x")),
            body: Body::new(vec![eq_expr(Term::var("x"), Term::var("z"))]),
        });
        let body = Body::new(vec![
            eq_expr(Term::var("z"), Term::int(1)),
            eq_expr(Term::var("y"), compr),
        ]);
        let (_, unsafes) = reorder_body(&globals(), &body, &arity);
        assert!(unsafes.is_empty(), "unexpected unsafe: {unsafes:?}");
    }

    #[test]
    fn test_every_domain_must_be_safe() {
        let every = Expr {
            terms: ExprTerms::Every(crate::ast::Every {
                key: None,
                value: Term::var("v"),
                domain: Term::var("xs"),
                body: Body::new(vec![call_expr("gt", vec![Term::var("v"), Term::int(0)])]),
                location: Location::default(),
            }),
            negated: false,
            generated: false,
            with: Vec::new(),
            location: Location::default(),
        };
        let body = Body::new(vec![every]);
        let (_, unsafes) = reorder_body(&globals(), &body, &arity);
        assert_eq!(unsafes.len(), 1);
        assert!(unsafes[0].vars.contains(&Var::new("xs")));
    }

    #[test]
    fn test_body_output_vars_fixpoint() {
        // eq(x, data.a); eq(y, x)
        let body = Body::new(vec![
            eq_expr(Term::var("x"), data_ref(&["data", "a"])),
            eq_expr(Term::var("y"), Term::var("x")),
        ]);
        let outs = body_output_vars(&body, &globals(), &arity);
        assert!(outs.contains(&Var::new("x")));
        assert!(outs.contains(&Var::new("y")));
    }
}
