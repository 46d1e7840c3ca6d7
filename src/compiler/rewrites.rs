//! Compiler Rewrite Passes
//!
//! The term- and body-level rewrites of the pipeline: local variable
//! declaration handling, nested call flattening, comprehension and head
//! rewriting, `with` value hoisting, print erasure, and the equality and
//! dynamic-term normalizations the evaluator depends on. All rewrites
//! allocate fresh names through [`LocalVarGenerator`], which guarantees
//! generated names never collide with user variables.

use crate::ast::{
    builders::operator_ref, Body, Expr, ExprTerms, Module, Ref, Rule, Term, Value, Var,
};
use crate::builtins;
use crate::errors::{Error, Errors};
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// Local variable generation
// ============================================================================

/// Produces fresh variable names of the form `__local<suffix><n>__`,
/// guaranteed disjoint from every variable in the excluded set.
#[derive(Debug, Clone, Default)]
pub struct LocalVarGenerator {
    suffix: String,
    next: usize,
    exclude: BTreeSet<Var>,
}

impl LocalVarGenerator {
    pub fn new(suffix: impl Into<String>) -> Self {
        LocalVarGenerator {
            suffix: suffix.into(),
            next: 0,
            exclude: BTreeSet::new(),
        }
    }

    /// A generator seeded against every variable occurring in the modules.
    pub fn for_modules<'a, I>(suffix: impl Into<String>, modules: I) -> Self
    where
        I: IntoIterator<Item = &'a Module>,
    {
        let mut exclude = BTreeSet::new();
        for module in modules {
            crate::ast::visitor::walk_vars(module, &mut |v: &Var| {
                exclude.insert(v.clone());
            });
        }
        LocalVarGenerator {
            suffix: suffix.into(),
            next: 0,
            exclude,
        }
    }

    /// The next fresh variable.
    pub fn fresh(&mut self) -> Var {
        loop {
            let candidate = Var::new(format!("__local{}{}__", self.suffix, self.next));
            self.next += 1;
            if !self.exclude.contains(&candidate) {
                return candidate;
            }
        }
    }
}

// ============================================================================
// Body traversal helpers
// ============================================================================

/// Apply `f` to `body` and every nested body (comprehensions, `every`),
/// innermost first.
pub fn for_each_body_mut(body: &mut Body, f: &mut impl FnMut(&mut Body)) {
    for expr in body.iter_mut() {
        for_each_body_in_expr_mut(expr, f);
    }
    f(body);
}

fn for_each_body_in_expr_mut(expr: &mut Expr, f: &mut impl FnMut(&mut Body)) {
    match &mut expr.terms {
        ExprTerms::Term(t) => for_each_body_in_term_mut(t, f),
        ExprTerms::Call(terms) => {
            for t in terms.iter_mut() {
                for_each_body_in_term_mut(t, f);
            }
        }
        ExprTerms::SomeDecl(_) => {}
        ExprTerms::Every(every) => {
            for_each_body_in_term_mut(&mut every.domain, f);
            for_each_body_mut(&mut every.body, f);
        }
    }
    for w in &mut expr.with {
        for_each_body_in_term_mut(&mut w.value, f);
    }
}

fn for_each_body_in_term_mut(t: &mut Term, f: &mut impl FnMut(&mut Body)) {
    match &mut t.value {
        Value::Ref(r) => {
            for s in r.iter_mut() {
                for_each_body_in_term_mut(s, f);
            }
        }
        Value::Array(items) | Value::Set(items) | Value::Call(items) => {
            for i in items.iter_mut() {
                for_each_body_in_term_mut(i, f);
            }
        }
        Value::Object(pairs) => {
            for (k, v) in pairs.iter_mut() {
                for_each_body_in_term_mut(k, f);
                for_each_body_in_term_mut(v, f);
            }
        }
        Value::ArrayComprehension { term, body } | Value::SetComprehension { term, body } => {
            for_each_body_in_term_mut(term, f);
            for_each_body_mut(body, f);
        }
        Value::ObjectComprehension { key, value, body } => {
            for_each_body_in_term_mut(key, f);
            for_each_body_in_term_mut(value, f);
            for_each_body_mut(body, f);
        }
        _ => {}
    }
}

/// Apply `f` to a rule and each of its else-branches.
pub fn for_each_rule_in_chain_mut(rule: &mut Rule, f: &mut impl FnMut(&mut Rule)) {
    f(rule);
    if let Some(else_rule) = &mut rule.else_rule {
        for_each_rule_in_chain_mut(else_rule, f);
    }
}

// ============================================================================
// RewriteRuleHeadRefs
// ============================================================================

/// Replace non-scalar, non-var selector terms in rule head refs with fresh
/// locals bound in the body. Multi-value rules and intermediate positions
/// must otherwise use string or var terms only.
pub fn rewrite_rule_head_refs(rule: &mut Rule, gen: &mut LocalVarGenerator, errors: &mut Errors) {
    for_each_rule_in_chain_mut(rule, &mut |rule| {
        let multi_value = rule.head.key.is_some() && rule.head.value.is_none();
        let len = rule.head.reference.len();
        let mut appended = Vec::new();
        for (i, t) in rule.head.reference.iter_mut().enumerate() {
            if i == 0 {
                continue;
            }
            let last = i == len - 1;
            match &t.value {
                Value::String(_) | Value::Var(_) => {}
                v if v.is_scalar() => {
                    if !last || multi_value {
                        errors.push(Error::compile(
                            t.location.clone(),
                            format!(
                                "rule head ref must only contain string terms: {}",
                                t.value
                            ),
                        ));
                    }
                }
                _ => {
                    let fresh = gen.fresh();
                    let original = std::mem::replace(&mut t.value, Value::Var(fresh.clone()));
                    appended.push(Expr::eq(
                        Term::var(fresh.as_str()),
                        Term::with_location(original, t.location.clone()),
                    ));
                }
            }
        }
        for e in appended {
            rule.body.push(e);
        }
    });
}

// ============================================================================
// RewriteLocalVars
// ============================================================================

struct Binding {
    generated: Var,
    location: crate::location::Location,
}

struct DeclScope {
    bindings: BTreeMap<Var, Binding>,
    used: BTreeSet<Var>,
}

impl DeclScope {
    fn new() -> Self {
        DeclScope {
            bindings: BTreeMap::new(),
            used: BTreeSet::new(),
        }
    }
}

/// Rewrite `:=` assignments and `some` declarations: each declared variable
/// gets a fresh generated name and subsequent references are rewritten.
/// Detects re-declaration, assignment inside negation, and assignment to
/// root documents. In strict mode, unused declared variables are errors.
pub fn rewrite_local_vars(
    rule: &mut Rule,
    gen: &mut LocalVarGenerator,
    rewritten: &mut BTreeMap<Var, Var>,
    strict: bool,
    errors: &mut Errors,
) {
    for_each_rule_in_chain_mut(rule, &mut |rule| {
        let mut scopes = vec![DeclScope::new()];
        rewrite_body_locals_open(
            &mut rule.body,
            gen,
            &mut scopes,
            rewritten,
            strict,
            false,
            errors,
        );
        // Head positions may reference body-declared locals
        // (`p[x] { x := "a" }`); rewrite them against the same scope.
        for t in rule.head.reference.iter_mut().skip(1) {
            rewrite_uses_in_term(t, &mut scopes, gen, rewritten, strict, false, errors);
        }
        if let Some(key) = &mut rule.head.key {
            rewrite_uses_in_term(key, &mut scopes, gen, rewritten, strict, false, errors);
        }
        if let Some(value) = &mut rule.head.value {
            rewrite_uses_in_term(value, &mut scopes, gen, rewritten, strict, false, errors);
        }
        close_scope(&mut scopes, strict, errors);
    });
}

/// Process a body against the current top scope (pushed by the caller).
fn rewrite_body_locals_open(
    body: &mut Body,
    gen: &mut LocalVarGenerator,
    scopes: &mut Vec<DeclScope>,
    rewritten: &mut BTreeMap<Var, Var>,
    strict: bool,
    negated_context: bool,
    errors: &mut Errors,
) {
    let exprs = std::mem::take(&mut body.0);
    for mut expr in exprs {
        if let ExprTerms::SomeDecl(decl) = &expr.terms {
            for symbol in &decl.symbols {
                if let Value::Var(v) = &symbol.value {
                    declare_local(v, &symbol.location, gen, scopes, rewritten, errors);
                }
            }
            // Declarations carry no runtime semantics once recorded.
            continue;
        }

        if expr.is_assignment() {
            if expr.negated || negated_context {
                errors.push(Error::compile(
                    expr.location.clone(),
                    "cannot assign vars inside negated expression",
                ));
            }
            // Rewrite the value side against the outer scope before the
            // target declarations become visible.
            let location = expr.location.clone();
            if let ExprTerms::Call(terms) = &mut expr.terms {
                if let Some(value_side) = terms.get_mut(2) {
                    rewrite_uses_in_term(
                        value_side,
                        scopes,
                        gen,
                        rewritten,
                        strict,
                        negated_context,
                        errors,
                    );
                }
                if let Some(target_side) = terms.get_mut(1) {
                    declare_assignment_pattern(
                        target_side,
                        &location,
                        gen,
                        scopes,
                        rewritten,
                        errors,
                    );
                }
                // The evaluator sees one unification form.
                terms[0] = Term::ref_term(operator_ref("eq"));
            }
            body.push(expr);
            continue;
        }

        rewrite_uses_in_expr(&mut expr, scopes, gen, rewritten, strict, negated_context, errors);
        body.push(expr);
    }

    if body.is_empty() {
        *body = Body::truthy();
    }
}

/// Pop the top scope, reporting unused declarations in strict mode.
fn close_scope(scopes: &mut Vec<DeclScope>, strict: bool, errors: &mut Errors) {
    let Some(scope) = scopes.pop() else {
        return;
    };
    if strict {
        for (orig, binding) in &scope.bindings {
            if orig.is_wildcard() || scope.used.contains(&binding.generated) {
                continue;
            }
            errors.push(Error::compile(
                binding.location.clone(),
                format!("assigned var {orig} unused"),
            ));
        }
    }
}

fn declare_local(
    v: &Var,
    location: &crate::location::Location,
    gen: &mut LocalVarGenerator,
    scopes: &mut Vec<DeclScope>,
    rewritten: &mut BTreeMap<Var, Var>,
    errors: &mut Errors,
) {
    if v.is_wildcard() {
        return;
    }
    if v.is_root_document() {
        errors.push(Error::compile(
            location.clone(),
            format!("variables must not shadow {v} (use a different variable name)"),
        ));
        return;
    }
    let Some(current) = scopes.last_mut() else {
        return;
    };
    if current.bindings.contains_key(v) {
        errors.push(Error::compile(
            location.clone(),
            format!("var {v} declared above"),
        ));
        return;
    }
    let fresh = gen.fresh();
    rewritten.insert(fresh.clone(), v.clone());
    current.bindings.insert(
        v.clone(),
        Binding {
            generated: fresh,
            location: location.clone(),
        },
    );
}

fn declare_assignment_pattern(
    t: &mut Term,
    location: &crate::location::Location,
    gen: &mut LocalVarGenerator,
    scopes: &mut Vec<DeclScope>,
    rewritten: &mut BTreeMap<Var, Var>,
    errors: &mut Errors,
) {
    match &mut t.value {
        Value::Var(v) => {
            declare_local(v, location, gen, scopes, rewritten, errors);
            if let Some(generated) = lookup_local(scopes, v) {
                *v = generated;
            }
        }
        Value::Array(items) => {
            for i in items.iter_mut() {
                declare_assignment_pattern(i, location, gen, scopes, rewritten, errors);
            }
        }
        Value::Object(pairs) => {
            for (_, v) in pairs.iter_mut() {
                declare_assignment_pattern(v, location, gen, scopes, rewritten, errors);
            }
        }
        _ => {}
    }
}

fn lookup_local(scopes: &[DeclScope], v: &Var) -> Option<Var> {
    for scope in scopes.iter().rev() {
        if let Some(binding) = scope.bindings.get(v) {
            return Some(binding.generated.clone());
        }
    }
    None
}

fn mark_used(scopes: &mut [DeclScope], generated: &Var) {
    for scope in scopes.iter_mut().rev() {
        if scope.bindings.values().any(|b| &b.generated == generated) {
            scope.used.insert(generated.clone());
            return;
        }
    }
}

fn declare_and_rewrite_var(
    term: &mut Term,
    gen: &mut LocalVarGenerator,
    scopes: &mut Vec<DeclScope>,
    rewritten: &mut BTreeMap<Var, Var>,
    errors: &mut Errors,
) {
    let location = term.location.clone();
    if let Value::Var(v) = &mut term.value {
        declare_local(v, &location, gen, scopes, rewritten, errors);
        if let Some(generated) = lookup_local(scopes, v) {
            mark_used(scopes, &generated);
            *v = generated;
        }
    }
}

fn rewrite_uses_in_expr(
    expr: &mut Expr,
    scopes: &mut Vec<DeclScope>,
    gen: &mut LocalVarGenerator,
    rewritten: &mut BTreeMap<Var, Var>,
    strict: bool,
    negated_context: bool,
    errors: &mut Errors,
) {
    let negated_here = negated_context || expr.negated;
    match &mut expr.terms {
        ExprTerms::Term(t) => {
            rewrite_uses_in_term(t, scopes, gen, rewritten, strict, negated_here, errors);
        }
        ExprTerms::Call(terms) => {
            for t in terms.iter_mut().skip(1) {
                rewrite_uses_in_term(t, scopes, gen, rewritten, strict, negated_here, errors);
            }
        }
        ExprTerms::SomeDecl(_) => {}
        ExprTerms::Every(every) => {
            rewrite_uses_in_term(
                &mut every.domain,
                scopes,
                gen,
                rewritten,
                strict,
                negated_here,
                errors,
            );
            // Key and value variables are declarations scoped to the body.
            scopes.push(DeclScope::new());
            if let Some(key) = &mut every.key {
                declare_and_rewrite_var(key, gen, scopes, rewritten, errors);
            }
            declare_and_rewrite_var(&mut every.value, gen, scopes, rewritten, errors);
            rewrite_body_locals_open(
                &mut every.body,
                gen,
                scopes,
                rewritten,
                strict,
                negated_here,
                errors,
            );
            close_scope(scopes, strict, errors);
        }
    }
    for w in &mut expr.with {
        rewrite_uses_in_term(&mut w.value, scopes, gen, rewritten, strict, negated_here, errors);
    }
}

fn rewrite_uses_in_term(
    t: &mut Term,
    scopes: &mut Vec<DeclScope>,
    gen: &mut LocalVarGenerator,
    rewritten: &mut BTreeMap<Var, Var>,
    strict: bool,
    negated_context: bool,
    errors: &mut Errors,
) {
    match &mut t.value {
        Value::Var(v) => {
            if let Some(generated) = lookup_local(scopes, v) {
                mark_used(scopes, &generated);
                *v = generated;
            }
        }
        Value::Ref(r) => {
            for s in r.iter_mut() {
                rewrite_uses_in_term(s, scopes, gen, rewritten, strict, negated_context, errors);
            }
        }
        Value::Array(items) | Value::Call(items) => {
            for i in items.iter_mut() {
                rewrite_uses_in_term(i, scopes, gen, rewritten, strict, negated_context, errors);
            }
        }
        Value::Set(items) => {
            let mut moved = std::mem::take(items);
            for i in moved.iter_mut() {
                rewrite_uses_in_term(i, scopes, gen, rewritten, strict, negated_context, errors);
            }
            t.value = Value::set(moved);
        }
        Value::Object(pairs) => {
            for (k, v) in pairs.iter_mut() {
                rewrite_uses_in_term(k, scopes, gen, rewritten, strict, negated_context, errors);
                rewrite_uses_in_term(v, scopes, gen, rewritten, strict, negated_context, errors);
            }
        }
        Value::ArrayComprehension { term, body } | Value::SetComprehension { term, body } => {
            scopes.push(DeclScope::new());
            rewrite_body_locals_open(body, gen, scopes, rewritten, strict, negated_context, errors);
            rewrite_uses_in_term(term, scopes, gen, rewritten, strict, negated_context, errors);
            close_scope(scopes, strict, errors);
        }
        Value::ObjectComprehension { key, value, body } => {
            scopes.push(DeclScope::new());
            rewrite_body_locals_open(body, gen, scopes, rewritten, strict, negated_context, errors);
            rewrite_uses_in_term(key, scopes, gen, rewritten, strict, negated_context, errors);
            rewrite_uses_in_term(value, scopes, gen, rewritten, strict, negated_context, errors);
            close_scope(scopes, strict, errors);
        }
        _ => {}
    }
}

// ============================================================================
// RewritePrintCalls
// ============================================================================

/// When printing is disabled, erase `print(...)` expressions entirely.
/// Otherwise rewrite each argument into a set comprehension so that an
/// undefined argument does not short-circuit evaluation of the print call:
/// `print(x)` becomes `internal.print([{__local__ | __local__ = x}])`.
pub fn rewrite_print_calls(body: &mut Body, gen: &mut LocalVarGenerator, enable: bool) {
    for_each_body_mut(body, &mut |b| {
        let exprs = std::mem::take(&mut b.0);
        for mut expr in exprs {
            if expr.operator_name().as_deref() != Some("print") {
                b.push(expr);
                continue;
            }
            if !enable {
                continue;
            }
            let args: Vec<Term> = expr.operands().to_vec();
            let wrapped: Vec<Term> = args
                .into_iter()
                .map(|arg| {
                    let fresh = gen.fresh();
                    let capture = Expr::eq(Term::var(fresh.as_str()), arg);
                    Term::new(Value::SetComprehension {
                        term: Box::new(Term::var(fresh.as_str())),
                        body: Body::new(vec![capture]),
                    })
                })
                .collect();
            let mut call = Expr::call(operator_ref("internal.print"), vec![Term::array(wrapped)]);
            call.location = expr.location.clone();
            call.negated = expr.negated;
            call.with = std::mem::take(&mut expr.with);
            call.generated = true;
            b.push(call);
        }
        if b.is_empty() {
            *b = Body::truthy();
        }
    });
}

// ============================================================================
// RewriteExprTerms
// ============================================================================

/// Flatten nested calls inside terms: `f(g(x))` becomes
/// `g(x, __local0__); f(__local0__)`. Collection elements are flattened in
/// place, and indirect references (`[1,2,3][i]`) get an anonymous binding.
pub fn rewrite_expr_terms(body: &mut Body, gen: &mut LocalVarGenerator) {
    for_each_body_mut(body, &mut |b| {
        let exprs = std::mem::take(&mut b.0);
        for mut expr in exprs {
            let mut support = Vec::new();
            match &mut expr.terms {
                ExprTerms::Term(t) => expand_in_place(t, gen, &mut support),
                ExprTerms::Call(terms) => {
                    for t in terms.iter_mut().skip(1) {
                        expand_in_place(t, gen, &mut support);
                    }
                }
                ExprTerms::SomeDecl(_) => {}
                ExprTerms::Every(every) => {
                    expand_in_place(&mut every.domain, gen, &mut support);
                }
            }
            for s in support {
                b.push(s);
            }
            b.push(expr);
        }
    });
}

/// Expand nested calls within a term, pushing hoisted call expressions into
/// `support`. The term itself is preserved; only embedded calls move out.
fn expand_in_place(t: &mut Term, gen: &mut LocalVarGenerator, support: &mut Vec<Expr>) {
    match &mut t.value {
        Value::Call(_) => {
            let hoisted = hoist_call(t, gen, support);
            *t = hoisted;
        }
        Value::Ref(r) => {
            // Indirect reference: a composite head gets an anonymous
            // binding so the selectors apply to a plain variable.
            if r.len() > 1 {
                if let Some(head) = r.iter_mut().next() {
                    expand_in_place(head, gen, support);
                    if !matches!(head.value, Value::Var(_)) {
                        let fresh = gen.fresh();
                        let original = std::mem::take(head);
                        support.push(Expr::eq(Term::var(fresh.as_str()), original));
                        head.value = Value::Var(fresh);
                    }
                }
            }
            for s in r.iter_mut().skip(1) {
                expand_in_place(s, gen, support);
            }
        }
        Value::Array(items) => {
            for i in items.iter_mut() {
                expand_in_place(i, gen, support);
            }
        }
        Value::Set(items) => {
            let mut moved = std::mem::take(items);
            for i in moved.iter_mut() {
                expand_in_place(i, gen, support);
            }
            t.value = Value::set(moved);
        }
        Value::Object(pairs) => {
            for (k, v) in pairs.iter_mut() {
                expand_in_place(k, gen, support);
                expand_in_place(v, gen, support);
            }
        }
        // Comprehension bodies are handled by the enclosing body walk.
        _ => {}
    }
}

/// Hoist a call term into a generated expression binding a fresh result
/// variable; the returned term is that variable.
fn hoist_call(t: &mut Term, gen: &mut LocalVarGenerator, support: &mut Vec<Expr>) -> Term {
    if let Value::Call(terms) = &mut t.value {
        for operand in terms.iter_mut().skip(1) {
            expand_in_place(operand, gen, support);
        }
        let fresh = gen.fresh();
        let mut call_terms = std::mem::take(terms);
        call_terms.push(Term::var(fresh.as_str()));
        support.push(Expr {
            terms: ExprTerms::Call(call_terms),
            negated: false,
            generated: true,
            with: Vec::new(),
            location: t.location.clone(),
        });
        Term::with_location(Value::Var(fresh), t.location.clone())
    } else {
        std::mem::take(t)
    }
}

// ============================================================================
// RewriteComprehensionTerms
// ============================================================================

/// Hoist comprehension head terms that require evaluation into the
/// comprehension body, bound to fresh variables.
pub fn rewrite_comprehension_terms(body: &mut Body, gen: &mut LocalVarGenerator) {
    for_each_body_mut(body, &mut |b| {
        for expr in b.iter_mut() {
            rewrite_comprehension_heads_in_expr(expr, gen);
        }
    });
}

fn rewrite_comprehension_heads_in_expr(expr: &mut Expr, gen: &mut LocalVarGenerator) {
    let mut rewrite_term = |t: &mut Term| rewrite_comprehension_heads_in_term(t, gen);
    match &mut expr.terms {
        ExprTerms::Term(t) => rewrite_term(t),
        ExprTerms::Call(terms) => {
            for t in terms.iter_mut().skip(1) {
                rewrite_term(t);
            }
        }
        ExprTerms::SomeDecl(_) => {}
        ExprTerms::Every(every) => rewrite_term(&mut every.domain),
    }
}

fn rewrite_comprehension_heads_in_term(t: &mut Term, gen: &mut LocalVarGenerator) {
    match &mut t.value {
        Value::ArrayComprehension { term, body } | Value::SetComprehension { term, body } => {
            if term.requires_eval() {
                let fresh = gen.fresh();
                let original = std::mem::replace(term.as_mut(), Term::var(fresh.as_str()));
                body.push(Expr::eq(Term::var(fresh.as_str()), original));
            }
            // Nested comprehensions under this body are reached by the
            // enclosing body walk.
        }
        Value::ObjectComprehension { key, value, body } => {
            if key.requires_eval() {
                let fresh = gen.fresh();
                let original = std::mem::replace(key.as_mut(), Term::var(fresh.as_str()));
                body.push(Expr::eq(Term::var(fresh.as_str()), original));
            }
            if value.requires_eval() {
                let fresh = gen.fresh();
                let original = std::mem::replace(value.as_mut(), Term::var(fresh.as_str()));
                body.push(Expr::eq(Term::var(fresh.as_str()), original));
            }
        }
        Value::Ref(r) => {
            for s in r.iter_mut() {
                rewrite_comprehension_heads_in_term(s, gen);
            }
        }
        Value::Array(items) | Value::Set(items) | Value::Call(items) => {
            for i in items.iter_mut() {
                rewrite_comprehension_heads_in_term(i, gen);
            }
        }
        Value::Object(pairs) => {
            for (k, v) in pairs.iter_mut() {
                rewrite_comprehension_heads_in_term(k, gen);
                rewrite_comprehension_heads_in_term(v, gen);
            }
        }
        _ => {}
    }
}

// ============================================================================
// RewriteRefsInHead
// ============================================================================

/// Hoist head key/value/args terms that require evaluation into the body.
pub fn rewrite_refs_in_head(rule: &mut Rule, gen: &mut LocalVarGenerator) {
    for_each_rule_in_chain_mut(rule, &mut |rule| {
        let mut appended = Vec::new();
        let mut hoist = |slot: &mut Term| {
            if slot.requires_eval() {
                let fresh = gen.fresh();
                let original = std::mem::take(slot);
                slot.value = Value::Var(fresh.clone());
                appended.push(Expr::eq(Term::var(fresh.as_str()), original));
            }
        };
        if let Some(key) = &mut rule.head.key {
            hoist(key);
        }
        if let Some(value) = &mut rule.head.value {
            hoist(value);
        }
        for arg in &mut rule.head.args {
            hoist(arg);
        }
        for e in appended {
            rule.body.push(e);
        }
    });
}

// ============================================================================
// RewriteWithValues
// ============================================================================

/// Validate `with` targets and hoist values that require evaluation into a
/// preceding equality. Targets must be `input.*`/`data.*` paths or
/// replaceable functions; internal built-ins, relations and void functions
/// cannot be replaced.
pub fn rewrite_with_values(
    body: &mut Body,
    gen: &mut LocalVarGenerator,
    is_function_rule: &dyn Fn(&Ref) -> bool,
    errors: &mut Errors,
) {
    for_each_body_mut(body, &mut |b| {
        let exprs = std::mem::take(&mut b.0);
        for mut expr in exprs {
            let mut hoisted = Vec::new();
            for w in &mut expr.with {
                let target_ok = validate_with_target(&w.target, &w.value, is_function_rule, errors);
                if target_ok && w.value.requires_eval() {
                    let fresh = gen.fresh();
                    let original = std::mem::take(&mut w.value);
                    w.value = Term::var(fresh.as_str());
                    hoisted.push(Expr::eq(Term::var(fresh.as_str()), original));
                }
            }
            for h in hoisted {
                b.push(h);
            }
            b.push(expr);
        }
    });
}

fn validate_with_target(
    target: &Term,
    value: &Term,
    is_function_rule: &dyn Fn(&Ref) -> bool,
    errors: &mut Errors,
) -> bool {
    let Some(r) = target.value.as_ref_value() else {
        errors.push(Error::compile(
            target.location.clone(),
            "with keyword target must reference existing input, data, or a function",
        ));
        return false;
    };

    let root = r.head().and_then(|t| t.value.as_var()).map(Var::as_str);
    if matches!(root, Some("input" | "data")) && !is_function_rule(r) {
        return true;
    }

    let name = crate::ast::ref_operator_name(r).unwrap_or_else(|| r.to_string());
    if let Some(builtin) = builtins::get(&name) {
        if builtin.is_internal() {
            errors.push(Error::compile(
                target.location.clone(),
                format!("with keyword replacing built-in function: target must not be internal: {name}"),
            ));
            return false;
        }
        if builtin.relation {
            errors.push(Error::compile(
                target.location.clone(),
                format!("with keyword replacing built-in function: target must not be a relation: {name}"),
            ));
            return false;
        }
        if builtin.is_void() {
            errors.push(Error::compile(
                target.location.clone(),
                format!(
                    "with keyword replacing built-in function: target must not be a void function: {name}"
                ),
            ));
            return false;
        }
        return validate_function_replacement(value, is_function_rule, target, errors);
    }

    if is_function_rule(r) {
        return validate_function_replacement(value, is_function_rule, target, errors);
    }

    errors.push(Error::compile(
        target.location.clone(),
        format!("with keyword target must reference existing input, data, or a function: {name}"),
    ));
    false
}

fn validate_function_replacement(
    value: &Term,
    is_function_rule: &dyn Fn(&Ref) -> bool,
    target: &Term,
    errors: &mut Errors,
) -> bool {
    let ok = match &value.value {
        Value::Ref(r) => {
            let name = crate::ast::ref_operator_name(r).unwrap_or_else(|| r.to_string());
            builtins::get(&name).is_some() || is_function_rule(r)
        }
        // A variable may hold a function value bound upstream.
        Value::Var(_) => true,
        _ => false,
    };
    if !ok {
        errors.push(Error::compile(
            target.location.clone(),
            "with keyword replacing built-in function: value must be a function",
        ));
    }
    ok
}

// ============================================================================
// RewriteEquals
// ============================================================================

/// Rewrite `==` expressions to `=` so the evaluator sees one form. Safety
/// analysis must already have run because `==` produces no output vars.
pub fn rewrite_equals(body: &mut Body) {
    for_each_body_mut(body, &mut |b| {
        for expr in b.iter_mut() {
            if expr.operator_name().as_deref() == Some("equal") {
                if let ExprTerms::Call(terms) = &mut expr.terms {
                    terms[0] = Term::ref_term(operator_ref("eq"));
                }
            }
        }
    });
}

// ============================================================================
// RewriteDynamicTerms
// ============================================================================

/// Hoist references and comprehensions inside calls and equality
/// right-hand sides into explicit local bindings to force eager evaluation.
pub fn rewrite_dynamic_terms(body: &mut Body, gen: &mut LocalVarGenerator) {
    for_each_body_mut(body, &mut |b| {
        let exprs = std::mem::take(&mut b.0);
        for mut expr in exprs {
            if expr.generated {
                b.push(expr);
                continue;
            }
            let mut support = Vec::new();
            match &mut expr.terms {
                ExprTerms::Call(terms) => {
                    let is_eq = terms
                        .first()
                        .and_then(|t| t.value.as_ref_value())
                        .and_then(crate::ast::ref_operator_name)
                        .is_some_and(|n| n == "eq");
                    if is_eq {
                        // Only the right-hand side is forced.
                        if let Some(rhs) = terms.get_mut(2) {
                            hoist_dynamic(rhs, gen, &mut support);
                        }
                    } else {
                        for operand in terms.iter_mut().skip(1) {
                            hoist_dynamic(operand, gen, &mut support);
                        }
                    }
                }
                ExprTerms::Every(every) => hoist_dynamic(&mut every.domain, gen, &mut support),
                _ => {}
            }
            for s in support {
                b.push(s);
            }
            b.push(expr);
        }
    });
}

fn hoist_dynamic(t: &mut Term, gen: &mut LocalVarGenerator, support: &mut Vec<Expr>) {
    let needs_hoist = matches!(&t.value, Value::Ref(r) if r.len() > 1)
        || t.value.is_comprehension();
    if needs_hoist {
        let fresh = gen.fresh();
        let original = std::mem::replace(&mut t.value, Value::Var(fresh.clone()));
        support.push(Expr::eq(
            Term::var(fresh.as_str()),
            Term::with_location(original, t.location.clone()),
        ));
    }
}

// ============================================================================
// RewriteTestRulesForTracing
// ============================================================================

/// Prefix of rules treated as tests.
pub const TEST_RULE_PREFIX: &str = "test_";

/// In test rules, hoist equality operands into locals so traces can display
/// the intermediate values on failure.
pub fn rewrite_test_equalities(body: &mut Body, gen: &mut LocalVarGenerator) {
    let exprs = std::mem::take(&mut body.0);
    for mut expr in exprs {
        let is_equality = matches!(
            expr.operator_name().as_deref(),
            Some("eq" | "equal" | "neq")
        );
        if is_equality && !expr.generated {
            let mut support = Vec::new();
            for operand in expr.operands_mut() {
                if operand.requires_eval() {
                    let fresh = gen.fresh();
                    let original = std::mem::take(operand);
                    operand.value = Value::Var(fresh.clone());
                    support.push(Expr::eq(Term::var(fresh.as_str()), original));
                }
            }
            for s in support {
                body.push(s);
            }
        }
        body.push(expr);
    }
}

// ============================================================================
// RewriteRegoMetadataCalls
// ============================================================================

/// Replace metadata built-in calls with references to pre-computed locals
/// holding the serialized annotation chain/rule objects. Returns whether
/// any call was rewritten.
pub fn rewrite_metadata_calls(
    body: &mut Body,
    gen: &mut LocalVarGenerator,
    chain_value: &Value,
    rule_value: &Value,
) -> bool {
    let mut changed = false;
    for_each_body_mut(body, &mut |b| {
        let exprs = std::mem::take(&mut b.0);
        for expr in exprs {
            let replacement = match expr.operator_name().as_deref() {
                Some("rego.metadata.chain") => Some(chain_value.clone()),
                Some("rego.metadata.rule") => Some(rule_value.clone()),
                _ => None,
            };
            let Some(metadata) = replacement else {
                b.push(expr);
                continue;
            };
            changed = true;

            let fresh = gen.fresh();
            let mut bind = Expr::eq(Term::var(fresh.as_str()), Term::new(metadata));
            bind.location = expr.location.clone();
            b.push(bind);

            match expr.operands() {
                // Flattened form: the call captured its result.
                [out] => {
                    let mut e = Expr::eq(out.clone(), Term::var(fresh.as_str()));
                    e.location = expr.location.clone();
                    b.push(e);
                }
                // Statement position: the metadata value is always defined.
                _ => {
                    let mut e = Expr::term(Term::var(fresh.as_str()));
                    e.generated = true;
                    e.location = expr.location.clone();
                    b.push(e);
                }
            }
        }
    });
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::builders::{assign_expr, call_expr, eq_expr};

    fn new_gen() -> LocalVarGenerator {
        LocalVarGenerator::new("")
    }

    #[test]
    fn test_generator_format_and_disjointness() {
        let mut exclude = LocalVarGenerator::new("");
        exclude.exclude.insert(Var::new("__local0__"));
        let v = exclude.fresh();
        assert_eq!(v.as_str(), "__local1__");
        assert!(v.is_generated());

        let mut suffixed = LocalVarGenerator::new("q");
        assert_eq!(suffixed.fresh().as_str(), "__localq0__");
    }

    #[test]
    fn test_flatten_nested_call() {
        // f(g(x)) => g(x, __local0__); f(__local0__)
        let inner = Term::call(vec![
            Term::ref_term(operator_ref("g")),
            Term::var("x"),
        ]);
        let mut body = Body::new(vec![call_expr("f", vec![inner])]);
        rewrite_expr_terms(&mut body, &mut new_gen());

        assert_eq!(body.len(), 2);
        assert_eq!(body.0[0].operator_name().as_deref(), Some("g"));
        assert!(body.0[0].generated);
        assert_eq!(body.0[0].operands().len(), 2);
        assert_eq!(body.0[1].operator_name().as_deref(), Some("f"));
        assert_eq!(
            body.0[1].operands()[0].value,
            Value::Var(Var::new("__local0__"))
        );
    }

    #[test]
    fn test_indirect_ref_gets_binding() {
        // [1,2,3][i] => __local0__ = [1,2,3]; __local0__[i]
        let r = Ref::new(vec![
            Term::array(vec![Term::int(1), Term::int(2), Term::int(3)]),
            Term::var("i"),
        ]);
        let mut body = Body::new(vec![Expr::term(Term::ref_term(r))]);
        rewrite_expr_terms(&mut body, &mut new_gen());

        assert_eq!(body.len(), 2);
        assert!(body.0[0].is_equality());
        let rewritten = match &body.0[1].terms {
            ExprTerms::Term(t) => t.value.as_ref_value().unwrap(),
            other => panic!("expected term expr, got {other:?}"),
        };
        assert!(matches!(
            rewritten.head().unwrap().value,
            Value::Var(_)
        ));
    }

    #[test]
    fn test_assignment_declares_and_rewrites() {
        // x := 1; f(x)
        let mut rule = Rule::new(
            crate::ast::Head::new("p"),
            Body::new(vec![
                assign_expr(Term::var("x"), Term::int(1)),
                call_expr("count", vec![Term::var("x"), Term::var("n")]),
            ]),
        );
        let mut rewritten = BTreeMap::new();
        let mut errors = Errors::new();
        rewrite_local_vars(&mut rule, &mut new_gen(), &mut rewritten, false, &mut errors);
        assert!(errors.is_empty(), "{errors}");

        // Assignment became eq on a generated var.
        assert!(rule.body.0[0].is_equality());
        let generated = rule.body.0[0].operands()[0]
            .value
            .as_var()
            .cloned()
            .unwrap();
        assert!(generated.is_generated());
        assert_eq!(rewritten.get(&generated), Some(&Var::new("x")));

        // Subsequent use rewritten to the generated name.
        assert_eq!(
            rule.body.0[1].operands()[0].value,
            Value::Var(generated)
        );
    }

    #[test]
    fn test_redeclaration_is_error() {
        let mut rule = Rule::new(
            crate::ast::Head::new("p"),
            Body::new(vec![
                assign_expr(Term::var("x"), Term::int(1)),
                assign_expr(Term::var("x"), Term::int(2)),
            ]),
        );
        let mut errors = Errors::new();
        rewrite_local_vars(
            &mut rule,
            &mut new_gen(),
            &mut BTreeMap::new(),
            false,
            &mut errors,
        );
        assert_eq!(errors.len(), 1);
        assert!(errors.0[0].message.contains("declared above"));
    }

    #[test]
    fn test_assignment_to_root_document_is_error() {
        let mut rule = Rule::new(
            crate::ast::Head::new("p"),
            Body::new(vec![assign_expr(Term::var("input"), Term::int(1))]),
        );
        let mut errors = Errors::new();
        rewrite_local_vars(
            &mut rule,
            &mut new_gen(),
            &mut BTreeMap::new(),
            false,
            &mut errors,
        );
        assert_eq!(errors.len(), 1);
        assert!(errors.0[0].message.contains("must not shadow input"));
    }

    #[test]
    fn test_assignment_inside_negation_is_error() {
        let mut rule = Rule::new(
            crate::ast::Head::new("p"),
            Body::new(vec![assign_expr(Term::var("x"), Term::int(1)).negate()]),
        );
        let mut errors = Errors::new();
        rewrite_local_vars(
            &mut rule,
            &mut new_gen(),
            &mut BTreeMap::new(),
            false,
            &mut errors,
        );
        assert_eq!(errors.len(), 1);
        assert!(errors.0[0].message.contains("negated"));
    }

    #[test]
    fn test_strict_unused_assignment_is_error() {
        let mut rule = Rule::new(
            crate::ast::Head::new("p"),
            Body::new(vec![assign_expr(Term::var("x"), Term::int(1))]),
        );
        let mut errors = Errors::new();
        rewrite_local_vars(
            &mut rule,
            &mut new_gen(),
            &mut BTreeMap::new(),
            true,
            &mut errors,
        );
        assert_eq!(errors.len(), 1);
        assert!(errors.0[0].message.contains("unused"));
    }

    #[test]
    fn test_some_decl_is_erased() {
        let mut rule = Rule::new(
            crate::ast::Head::new("p"),
            Body::new(vec![
                Expr {
                    terms: ExprTerms::SomeDecl(crate::ast::SomeDecl::new(vec![Term::var("x")])),
                    negated: false,
                    generated: false,
                    with: Vec::new(),
                    location: Default::default(),
                },
                eq_expr(Term::var("x"), Term::int(1)),
            ]),
        );
        let mut errors = Errors::new();
        rewrite_local_vars(
            &mut rule,
            &mut new_gen(),
            &mut BTreeMap::new(),
            false,
            &mut errors,
        );
        assert!(errors.is_empty());
        assert_eq!(rule.body.len(), 1);
        let v = rule.body.0[0].operands()[0].value.as_var().unwrap();
        assert!(v.is_generated());
    }

    #[test]
    fn test_print_erased_when_disabled() {
        let mut body = Body::new(vec![call_expr("print", vec![Term::var("x")])]);
        rewrite_print_calls(&mut body, &mut new_gen(), false);
        assert_eq!(body.len(), 1);
        assert_eq!(body.0[0], Body::truthy().0[0]);
    }

    #[test]
    fn test_print_wrapped_when_enabled() {
        let mut body = Body::new(vec![call_expr("print", vec![Term::var("x")])]);
        rewrite_print_calls(&mut body, &mut new_gen(), true);
        assert_eq!(body.len(), 1);
        assert_eq!(
            body.0[0].operator_name().as_deref(),
            Some("internal.print")
        );
        // Single operand: array of set comprehensions.
        let operand = &body.0[0].operands()[0];
        match &operand.value {
            Value::Array(items) => {
                assert!(matches!(items[0].value, Value::SetComprehension { .. }));
            }
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn test_rewrite_equals() {
        let mut body = Body::new(vec![call_expr(
            "equal",
            vec![Term::var("x"), Term::int(1)],
        )]);
        rewrite_equals(&mut body);
        assert!(body.0[0].is_equality());
    }

    #[test]
    fn test_dynamic_rhs_hoisted() {
        // x = data.a.b => __local0__ = data.a.b; x = __local0__
        let mut body = Body::new(vec![{
            let mut e = eq_expr(
                Term::var("x"),
                Term::ref_term(Ref::dotted(&["data", "a", "b"])),
            );
            e.generated = false;
            e
        }]);
        rewrite_dynamic_terms(&mut body, &mut new_gen());
        assert_eq!(body.len(), 2);
        assert!(body.0[0].generated);
        assert!(matches!(
            body.0[1].operands()[1].value,
            Value::Var(_)
        ));
    }

    #[test]
    fn test_with_target_validation() {
        let not_function = |_: &Ref| false;

        // Valid: input path
        let mut body = Body::new(vec![{
            let mut e = eq_expr(Term::var("x"), Term::int(1));
            e.with.push(crate::ast::With::new(
                Term::ref_term(Ref::dotted(&["input", "user"])),
                Term::string("admin"),
            ));
            e
        }]);
        let mut errors = Errors::new();
        rewrite_with_values(&mut body, &mut new_gen(), &not_function, &mut errors);
        assert!(errors.is_empty(), "{errors}");

        // Invalid: internal built-in
        let mut body = Body::new(vec![{
            let mut e = eq_expr(Term::var("x"), Term::int(1));
            e.with.push(crate::ast::With::new(
                Term::ref_term(operator_ref("internal.print")),
                Term::ref_term(operator_ref("count")),
            ));
            e
        }]);
        let mut errors = Errors::new();
        rewrite_with_values(&mut body, &mut new_gen(), &not_function, &mut errors);
        assert_eq!(errors.len(), 1);
        assert!(errors.0[0].message.contains("internal"));

        // Invalid: relation target
        let mut body = Body::new(vec![{
            let mut e = eq_expr(Term::var("x"), Term::int(1));
            e.with.push(crate::ast::With::new(
                Term::ref_term(operator_ref("walk")),
                Term::ref_term(operator_ref("count")),
            ));
            e
        }]);
        let mut errors = Errors::new();
        rewrite_with_values(&mut body, &mut new_gen(), &not_function, &mut errors);
        assert_eq!(errors.len(), 1);
        assert!(errors.0[0].message.contains("relation"));
    }

    #[test]
    fn test_with_value_hoisted() {
        let not_function = |_: &Ref| false;
        let mut body = Body::new(vec![{
            let mut e = eq_expr(Term::var("x"), Term::int(1));
            e.with.push(crate::ast::With::new(
                Term::ref_term(Ref::dotted(&["input", "user"])),
                Term::ref_term(Ref::dotted(&["data", "users", "alice"])),
            ));
            e
        }]);
        let mut errors = Errors::new();
        rewrite_with_values(&mut body, &mut new_gen(), &not_function, &mut errors);
        assert!(errors.is_empty());
        assert_eq!(body.len(), 2);
        assert!(body.0[0].is_equality());
        assert!(matches!(body.0[1].with[0].value.value, Value::Var(_)));
    }

    #[test]
    fn test_head_ref_composite_selector_rewritten() {
        let mut rule = Rule::new(crate::ast::Head::new("p"), Body::truthy());
        rule.head.reference = Ref::new(vec![
            Term::var("p"),
            Term::array(vec![Term::int(1)]),
        ]);
        let mut errors = Errors::new();
        rewrite_rule_head_refs(&mut rule, &mut new_gen(), &mut errors);
        assert!(errors.is_empty());
        assert!(matches!(
            rule.head.reference.get(1).unwrap().value,
            Value::Var(_)
        ));
        assert!(rule.body.0.last().unwrap().is_equality());
    }

    #[test]
    fn test_head_ref_scalar_in_middle_is_error() {
        let mut rule = Rule::new(crate::ast::Head::new("p"), Body::truthy());
        rule.head.reference = Ref::new(vec![
            Term::var("p"),
            Term::int(1),
            Term::string("q"),
        ]);
        let mut errors = Errors::new();
        rewrite_rule_head_refs(&mut rule, &mut new_gen(), &mut errors);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_comprehension_head_hoisted() {
        // [data.a[x] | ...] => [__local0__ | ...; __local0__ = data.a[x]]
        let compr = Term::new(Value::ArrayComprehension {
            term: Box::new(Term::ref_term(
                Ref::dotted(&["data", "a"]).append(Term::var("x")),
            )),
            body: Body::truthy(),
        });
        let mut body = Body::new(vec![eq_expr(Term::var("y"), compr)]);
        rewrite_comprehension_terms(&mut body, &mut new_gen());

        match &body.0[0].operands()[1].value {
            Value::ArrayComprehension { term, body } => {
                assert!(matches!(term.value, Value::Var(_)));
                assert_eq!(body.len(), 2);
            }
            other => panic!("expected comprehension, got {other:?}"),
        }
    }

    #[test]
    fn test_refs_in_head_hoisted() {
        let mut rule = Rule::new(crate::ast::Head::new("p"), Body::truthy());
        rule.head.value = Some(Term::ref_term(Ref::dotted(&["data", "a", "b"])));
        rewrite_refs_in_head(&mut rule, &mut new_gen());
        assert!(matches!(
            rule.head.value.as_ref().unwrap().value,
            Value::Var(_)
        ));
        assert!(rule.body.0.last().unwrap().is_equality());
    }

    #[test]
    fn test_metadata_call_rewritten() {
        let mut body = Body::new(vec![call_expr(
            "rego.metadata.rule",
            vec![Term::var("__local9__")],
        )]);
        let rule_value = Value::Object(vec![(
            Term::string("title"),
            Term::string("t"),
        )]);
        let changed = rewrite_metadata_calls(
            &mut body,
            &mut new_gen(),
            &Value::Array(vec![]),
            &rule_value,
        );
        assert!(changed);
        assert_eq!(body.len(), 2);
        assert!(body.0[0].is_equality());
        assert!(body.0[1].is_equality());
    }

    #[test]
    fn test_test_rule_equality_operands_hoisted() {
        let mut body = Body::new(vec![call_expr(
            "equal",
            vec![
                Term::ref_term(Ref::dotted(&["data", "a"])),
                Term::int(1),
            ],
        )]);
        rewrite_test_equalities(&mut body, &mut new_gen());
        assert_eq!(body.len(), 2);
        assert!(body.0[0].is_equality());
    }
}
