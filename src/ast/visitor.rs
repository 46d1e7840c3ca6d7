//! Generic AST traversal.
//!
//! `walk` performs a depth-first pre-order traversal in which the callback
//! controls descent. `walk_before_after` adds an after-hook for scope
//! tracking. Specialized sweeps collect vars, refs, rules, exprs, bodies and
//! closures. Children are visited in declaration order; object pairs in
//! insertion order; set elements in their stored (sorted) order.

use super::{
    Body, Every, Expr, ExprTerms, Head, Import, Module, Package, Ref, Rule, SomeDecl, Term, Value,
    Var, With,
};
use std::collections::BTreeSet;

/// A borrowed AST node handed to traversal callbacks.
#[derive(Debug, Clone, Copy)]
pub enum Node<'a> {
    Module(&'a Module),
    Package(&'a Package),
    Import(&'a Import),
    Rule(&'a Rule),
    Head(&'a Head),
    Body(&'a Body),
    Expr(&'a Expr),
    Term(&'a Term),
    With(&'a With),
    SomeDecl(&'a SomeDecl),
    Every(&'a Every),
}

impl<'a> From<&'a Module> for Node<'a> {
    fn from(m: &'a Module) -> Self {
        Node::Module(m)
    }
}

impl<'a> From<&'a Rule> for Node<'a> {
    fn from(r: &'a Rule) -> Self {
        Node::Rule(r)
    }
}

impl<'a> From<&'a Body> for Node<'a> {
    fn from(b: &'a Body) -> Self {
        Node::Body(b)
    }
}

impl<'a> From<&'a Expr> for Node<'a> {
    fn from(e: &'a Expr) -> Self {
        Node::Expr(e)
    }
}

impl<'a> From<&'a Term> for Node<'a> {
    fn from(t: &'a Term) -> Self {
        Node::Term(t)
    }
}

/// Depth-first pre-order walk. The callback returns whether to descend into
/// the node's children.
pub fn walk<'a, N, F>(node: N, f: &mut F)
where
    N: Into<Node<'a>>,
    F: FnMut(Node<'a>) -> bool,
{
    walk_node(node.into(), f);
}

fn walk_node<'a, F>(node: Node<'a>, f: &mut F)
where
    F: FnMut(Node<'a>) -> bool,
{
    if !f(node) {
        return;
    }
    descend(node, &mut |child| walk_node(child, f));
}

/// Depth-first walk with before and after hooks. The before hook returns
/// whether to descend; the after hook runs once the subtree is done.
pub fn walk_before_after<'a, N, B, A>(node: N, before: &mut B, after: &mut A)
where
    N: Into<Node<'a>>,
    B: FnMut(Node<'a>) -> bool,
    A: FnMut(Node<'a>),
{
    walk_node_before_after(node.into(), before, after);
}

fn walk_node_before_after<'a, B, A>(node: Node<'a>, before: &mut B, after: &mut A)
where
    B: FnMut(Node<'a>) -> bool,
    A: FnMut(Node<'a>),
{
    if !before(node) {
        return;
    }
    descend(node, &mut |child| {
        walk_node_before_after(child, before, after);
    });
    after(node);
}

/// Invoke `f` on each direct child of `node`, in declaration order.
fn descend<'a, F>(node: Node<'a>, f: &mut F)
where
    F: FnMut(Node<'a>),
{
    match node {
        Node::Module(m) => {
            f(Node::Package(&m.package));
            for imp in &m.imports {
                f(Node::Import(imp));
            }
            for rule in &m.rules {
                f(Node::Rule(rule));
            }
        }
        Node::Package(p) => {
            for t in p.path.iter() {
                f(Node::Term(t));
            }
        }
        Node::Import(imp) => f(Node::Term(&imp.path)),
        Node::Rule(r) => {
            f(Node::Head(&r.head));
            f(Node::Body(&r.body));
            if let Some(else_rule) = &r.else_rule {
                f(Node::Rule(else_rule));
            }
        }
        Node::Head(h) => {
            for t in h.reference.iter() {
                f(Node::Term(t));
            }
            for a in &h.args {
                f(Node::Term(a));
            }
            if let Some(k) = &h.key {
                f(Node::Term(k));
            }
            if let Some(v) = &h.value {
                f(Node::Term(v));
            }
        }
        Node::Body(b) => {
            for e in b.iter() {
                f(Node::Expr(e));
            }
        }
        Node::Expr(e) => {
            match &e.terms {
                ExprTerms::Term(t) => f(Node::Term(t)),
                ExprTerms::Call(terms) => {
                    for t in terms {
                        f(Node::Term(t));
                    }
                }
                ExprTerms::SomeDecl(decl) => f(Node::SomeDecl(decl)),
                ExprTerms::Every(every) => f(Node::Every(every)),
            }
            for w in &e.with {
                f(Node::With(w));
            }
        }
        Node::Term(t) => descend_value(&t.value, f),
        Node::With(w) => {
            f(Node::Term(&w.target));
            f(Node::Term(&w.value));
        }
        Node::SomeDecl(decl) => {
            for s in &decl.symbols {
                f(Node::Term(s));
            }
        }
        Node::Every(every) => {
            if let Some(k) = &every.key {
                f(Node::Term(k));
            }
            f(Node::Term(&every.value));
            f(Node::Term(&every.domain));
            f(Node::Body(&every.body));
        }
    }
}

fn descend_value<'a, F>(value: &'a Value, f: &mut F)
where
    F: FnMut(Node<'a>),
{
    match value {
        Value::Ref(r) => {
            for t in r.iter() {
                f(Node::Term(t));
            }
        }
        Value::Array(items) | Value::Set(items) | Value::Call(items) => {
            for t in items {
                f(Node::Term(t));
            }
        }
        Value::Object(pairs) => {
            for (k, v) in pairs {
                f(Node::Term(k));
                f(Node::Term(v));
            }
        }
        Value::ArrayComprehension { term, body } | Value::SetComprehension { term, body } => {
            f(Node::Term(term));
            f(Node::Body(body));
        }
        Value::ObjectComprehension { key, value, body } => {
            f(Node::Term(key));
            f(Node::Term(value));
            f(Node::Body(body));
        }
        _ => {}
    }
}

// ============================================================================
// Specialized sweeps
// ============================================================================

/// Visit every variable, including ref heads and call operator heads.
pub fn walk_vars<'a, N, F>(node: N, f: &mut F)
where
    N: Into<Node<'a>>,
    F: FnMut(&'a Var),
{
    walk(node, &mut |n| {
        if let Node::Term(t) = n {
            if let Value::Var(v) = &t.value {
                f(v);
            }
        }
        true
    });
}

/// Visit every reference, including operator refs of calls.
pub fn walk_refs<'a, N, F>(node: N, f: &mut F)
where
    N: Into<Node<'a>>,
    F: FnMut(&'a Ref),
{
    walk(node, &mut |n| {
        if let Node::Term(t) = n {
            if let Value::Ref(r) = &t.value {
                f(r);
            }
        }
        true
    });
}

/// Visit every rule, including else-branches.
pub fn walk_rules<'a, N, F>(node: N, f: &mut F)
where
    N: Into<Node<'a>>,
    F: FnMut(&'a Rule),
{
    walk(node, &mut |n| {
        if let Node::Rule(r) = n {
            f(r);
        }
        true
    });
}

/// Visit every expression, including those in nested closures.
pub fn walk_exprs<'a, N, F>(node: N, f: &mut F)
where
    N: Into<Node<'a>>,
    F: FnMut(&'a Expr),
{
    walk(node, &mut |n| {
        if let Node::Expr(e) = n {
            f(e);
        }
        true
    });
}

/// Visit every body, including comprehension and `every` bodies.
pub fn walk_bodies<'a, N, F>(node: N, f: &mut F)
where
    N: Into<Node<'a>>,
    F: FnMut(&'a Body),
{
    walk(node, &mut |n| {
        if let Node::Body(b) = n {
            f(b);
        }
        true
    });
}

/// A closure node: a comprehension or an `every` quantifier.
#[derive(Debug, Clone, Copy)]
pub enum Closure<'a> {
    ArrayComprehension { term: &'a Term, body: &'a Body },
    SetComprehension { term: &'a Term, body: &'a Body },
    ObjectComprehension {
        key: &'a Term,
        value: &'a Term,
        body: &'a Body,
    },
    Every(&'a Every),
}

impl<'a> Closure<'a> {
    /// The closure body.
    pub fn body(&self) -> &'a Body {
        match self {
            Closure::ArrayComprehension { body, .. }
            | Closure::SetComprehension { body, .. }
            | Closure::ObjectComprehension { body, .. } => body,
            Closure::Every(e) => &e.body,
        }
    }
}

/// Visit every closure at any depth, pre-order.
pub fn walk_closures<'a, N, F>(node: N, f: &mut F)
where
    N: Into<Node<'a>>,
    F: FnMut(Closure<'a>),
{
    walk(node, &mut |n| {
        match n {
            Node::Term(t) => match &t.value {
                Value::ArrayComprehension { term, body } => {
                    f(Closure::ArrayComprehension { term, body });
                }
                Value::SetComprehension { term, body } => {
                    f(Closure::SetComprehension { term, body });
                }
                Value::ObjectComprehension { key, value, body } => {
                    f(Closure::ObjectComprehension { key, value, body });
                }
                _ => {}
            },
            Node::Every(e) => f(Closure::Every(e)),
            _ => {}
        }
        true
    });
}

// ============================================================================
// Var collection
// ============================================================================

/// Options controlling which sub-positions contribute variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct VarVisitorParams {
    /// Do not collect the head variable of references
    pub skip_ref_head: bool,
    /// Do not collect the head variable of call operator references
    pub skip_ref_call_head: bool,
    /// Do not collect variables in object keys
    pub skip_object_keys: bool,
    /// Do not descend into comprehension and `every` bodies
    pub skip_closures: bool,
    /// Do not collect variables in `with` targets
    pub skip_with_target: bool,
    /// Do not collect variables inside sets
    pub skip_sets: bool,
}

/// Collects variables from AST nodes according to [`VarVisitorParams`].
#[derive(Debug, Default)]
pub struct VarVisitor {
    params: VarVisitorParams,
    vars: BTreeSet<Var>,
}

impl VarVisitor {
    pub fn new(params: VarVisitorParams) -> Self {
        VarVisitor {
            params,
            vars: BTreeSet::new(),
        }
    }

    /// The collected variables, sorted.
    pub fn vars(&self) -> &BTreeSet<Var> {
        &self.vars
    }

    /// Consume the visitor, returning the collected variables.
    pub fn into_vars(self) -> BTreeSet<Var> {
        self.vars
    }

    pub fn walk_body(&mut self, body: &Body) {
        for e in body.iter() {
            self.walk_expr(e);
        }
    }

    pub fn walk_expr(&mut self, expr: &Expr) {
        match &expr.terms {
            ExprTerms::Term(t) => self.walk_term(t),
            ExprTerms::Call(terms) => self.walk_call_terms(terms),
            ExprTerms::SomeDecl(decl) => {
                for s in &decl.symbols {
                    self.walk_term(s);
                }
            }
            ExprTerms::Every(every) => {
                if let Some(k) = &every.key {
                    self.walk_term(k);
                }
                self.walk_term(&every.value);
                self.walk_term(&every.domain);
                if !self.params.skip_closures {
                    self.walk_body(&every.body);
                }
            }
        }
        for w in &expr.with {
            if !self.params.skip_with_target {
                self.walk_term(&w.target);
            }
            self.walk_term(&w.value);
        }
    }

    pub fn walk_term(&mut self, term: &Term) {
        match &term.value {
            Value::Var(v) => {
                self.vars.insert(v.clone());
            }
            Value::Ref(r) => self.walk_ref(r, self.params.skip_ref_head),
            Value::Array(items) => {
                for t in items {
                    self.walk_term(t);
                }
            }
            Value::Set(items) => {
                if !self.params.skip_sets {
                    for t in items {
                        self.walk_term(t);
                    }
                }
            }
            Value::Object(pairs) => {
                for (k, v) in pairs {
                    if !self.params.skip_object_keys {
                        self.walk_term(k);
                    }
                    self.walk_term(v);
                }
            }
            Value::Call(terms) => self.walk_call_terms(terms),
            Value::ArrayComprehension { term: t, body }
            | Value::SetComprehension { term: t, body } => {
                if !self.params.skip_closures {
                    self.walk_term(t);
                    self.walk_body(body);
                }
            }
            Value::ObjectComprehension { key, value, body } => {
                if !self.params.skip_closures {
                    self.walk_term(key);
                    self.walk_term(value);
                    self.walk_body(body);
                }
            }
            _ => {}
        }
    }

    fn walk_call_terms(&mut self, terms: &[Term]) {
        if let Some((op, args)) = terms.split_first() {
            match &op.value {
                Value::Ref(r) => self.walk_ref(r, self.params.skip_ref_call_head),
                _ => self.walk_term(op),
            }
            for a in args {
                self.walk_term(a);
            }
        }
    }

    fn walk_ref(&mut self, r: &Ref, skip_head: bool) {
        for (i, t) in r.iter().enumerate() {
            if i == 0 && skip_head {
                continue;
            }
            self.walk_term(t);
        }
    }
}

/// Collect all variables in an expression, including closures and ref heads.
pub fn expr_vars(expr: &Expr) -> BTreeSet<Var> {
    let mut v = VarVisitor::new(VarVisitorParams::default());
    v.walk_expr(expr);
    v.into_vars()
}

/// Collect all variables in a body, including closures and ref heads.
pub fn body_vars(body: &Body) -> BTreeSet<Var> {
    let mut v = VarVisitor::new(VarVisitorParams::default());
    v.walk_body(body);
    v.into_vars()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Head, Rule};

    fn sample_expr() -> Expr {
        // f(x, data.a[y]) with some substructure
        Expr::call(
            Ref::new(vec![Term::var("f")]),
            vec![
                Term::var("x"),
                Term::ref_term(Ref::dotted(&["data", "a"]).append(Term::var("y"))),
            ],
        )
    }

    #[test]
    fn test_walk_visits_all_terms() {
        let e = sample_expr();
        let mut terms = 0;
        walk(&e, &mut |n| {
            if matches!(n, Node::Term(_)) {
                terms += 1;
            }
            true
        });
        assert!(terms >= 6, "expected operator, operands and ref terms, got {terms}");
    }

    #[test]
    fn test_walk_prunes_on_false() {
        let e = sample_expr();
        let mut terms = 0;
        walk(&e, &mut |n| {
            if matches!(n, Node::Term(_)) {
                terms += 1;
                return false; // do not descend into term children
            }
            true
        });
        // Only the direct call terms are seen: operator + 2 operands.
        assert_eq!(terms, 3);
    }

    #[test]
    fn test_before_after_ordering() {
        let body = Body::new(vec![sample_expr()]);
        let events = std::cell::RefCell::new(Vec::new());
        walk_before_after(
            &body,
            &mut |n| {
                if matches!(n, Node::Expr(_)) {
                    events.borrow_mut().push("before");
                }
                true
            },
            &mut |n| {
                if matches!(n, Node::Expr(_)) {
                    events.borrow_mut().push("after");
                }
            },
        );
        assert_eq!(events.into_inner(), vec!["before", "after"]);
    }

    #[test]
    fn test_var_visitor_collects_all() {
        let e = sample_expr();
        let vars = expr_vars(&e);
        let names: Vec<_> = vars.iter().map(Var::as_str).collect();
        assert_eq!(names, vec!["data", "f", "x", "y"]);
    }

    #[test]
    fn test_var_visitor_skip_ref_call_head() {
        let e = sample_expr();
        let mut v = VarVisitor::new(VarVisitorParams {
            skip_ref_call_head: true,
            skip_ref_head: true,
            ..Default::default()
        });
        v.walk_expr(&e);
        let names: Vec<_> = v.vars().iter().map(Var::as_str).collect();
        assert_eq!(names, vec!["x", "y"]);
    }

    #[test]
    fn test_var_visitor_skip_closures() {
        let compr = Term::new(Value::SetComprehension {
            term: Box::new(Term::var("z")),
            body: Body::new(vec![Expr::eq(Term::var("z"), Term::int(1))]),
        });
        let e = Expr::eq(Term::var("out"), compr);

        let mut v = VarVisitor::new(VarVisitorParams {
            skip_closures: true,
            skip_ref_call_head: true,
            ..Default::default()
        });
        v.walk_expr(&e);
        let names: Vec<_> = v.vars().iter().map(Var::as_str).collect();
        assert_eq!(names, vec!["out"]);
    }

    #[test]
    fn test_walk_closures_finds_nested() {
        let inner = Term::new(Value::ArrayComprehension {
            term: Box::new(Term::var("a")),
            body: Body::truthy(),
        });
        let outer = Term::new(Value::SetComprehension {
            term: Box::new(inner),
            body: Body::truthy(),
        });
        let e = Expr::term(outer);

        let mut count = 0;
        walk_closures(&e, &mut |_c| count += 1);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_walk_rules_includes_else() {
        let mut r = Rule::new(Head::new("p"), Body::truthy());
        r.else_rule = Some(Box::new(Rule::new(Head::new("p"), Body::truthy())));
        let mut count = 0;
        walk_rules(&r, &mut |_r| count += 1);
        assert_eq!(count, 2);
    }
}
