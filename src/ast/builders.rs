//! Builder Patterns for AST Construction
//!
//! Provides fluent APIs for constructing AST nodes, particularly useful for tests.
//!
//! ## Example
//!
//! ```rust
//! use regolith::ast::builders::{call_expr, ModuleBuilder, RuleBuilder};
//! use regolith::ast::Term;
//!
//! // Build a module:
//! //   package example
//! //   allow { input.user == "admin" }
//! let module = ModuleBuilder::new(&["example"])
//!     .rule(
//!         RuleBuilder::new("allow")
//!             .value(Term::boolean(true))
//!             .body(call_expr(
//!                 "equal",
//!                 vec![
//!                     Term::ref_term(regolith::ast::Ref::dotted(&["input", "user"])),
//!                     Term::string("admin"),
//!                 ],
//!             ))
//!             .build(),
//!     )
//!     .build();
//!
//! assert_eq!(module.rules.len(), 1);
//! ```

use super::{Body, Expr, Head, Import, Module, Package, Ref, Rule, Term};

/// Build a call expression from a dotted operator name and operands.
pub fn call_expr(operator: &str, operands: Vec<Term>) -> Expr {
    Expr::call(operator_ref(operator), operands)
}

/// Build an assignment expression `target := value`.
pub fn assign_expr(target: Term, value: Term) -> Expr {
    call_expr("assign", vec![target, value])
}

/// Build a unification expression `a = b`.
pub fn eq_expr(a: Term, b: Term) -> Expr {
    call_expr("eq", vec![a, b])
}

/// Build an operator reference from a dotted name: the first element is the
/// head variable, the rest are string selectors.
pub fn operator_ref(name: &str) -> Ref {
    let mut terms = Vec::new();
    for (i, part) in name.split('.').enumerate() {
        if i == 0 {
            terms.push(Term::var(part));
        } else {
            terms.push(Term::string(part));
        }
    }
    Ref::new(terms)
}

/// Builder for constructing Rule instances.
#[derive(Debug, Clone)]
pub struct RuleBuilder {
    head: Head,
    body: Body,
    else_rule: Option<Box<Rule>>,
}

impl RuleBuilder {
    /// Start a rule with the given name.
    pub fn new(name: &str) -> Self {
        RuleBuilder {
            head: Head::new(name),
            body: Body::default(),
            else_rule: None,
        }
    }

    /// Set the head key, making this a multi-value rule.
    pub fn key(mut self, key: Term) -> Self {
        self.head.key = Some(key);
        self
    }

    /// Set the head value.
    pub fn value(mut self, value: Term) -> Self {
        self.head.value = Some(value);
        self
    }

    /// Set function arguments.
    pub fn args<I: IntoIterator<Item = Term>>(mut self, args: I) -> Self {
        self.head.args = args.into_iter().collect();
        self
    }

    /// Mark this as a default rule with the given value.
    pub fn default_value(mut self, value: Term) -> Self {
        self.head.default = true;
        self.head.value = Some(value);
        self
    }

    /// Replace the head reference with an explicit one.
    pub fn reference(mut self, reference: Ref) -> Self {
        self.head.reference = reference;
        self
    }

    /// Append a body expression.
    pub fn body(mut self, expr: Expr) -> Self {
        self.body.push(expr);
        self
    }

    /// Append a body expression holding a single term.
    pub fn body_term(mut self, term: Term) -> Self {
        self.body.push(Expr::term(term));
        self
    }

    /// Attach an else-branch.
    pub fn else_rule(mut self, rule: Rule) -> Self {
        self.else_rule = Some(Box::new(rule));
        self
    }

    /// Finalize the rule. An empty body becomes `true`.
    pub fn build(self) -> Rule {
        let body = if self.body.is_empty() {
            Body::truthy()
        } else {
            self.body
        };
        let mut rule = Rule::new(self.head, body);
        rule.else_rule = self.else_rule;
        rule
    }
}

/// Builder for constructing Module instances.
#[derive(Debug, Clone)]
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    /// Start a module under the given package path (without the `data` root).
    pub fn new(package: &[&str]) -> Self {
        ModuleBuilder {
            module: Module::new(Package::new(package)),
        }
    }

    /// Add an import.
    pub fn import(mut self, import: Import) -> Self {
        self.module.imports.push(import);
        self
    }

    /// Add a rule.
    pub fn rule(mut self, rule: Rule) -> Self {
        self.module.rules.push(rule);
        self
    }

    /// Set the module's language version.
    pub fn version(mut self, version: super::RegoVersion) -> Self {
        self.module.rego_version = version;
        self
    }

    /// Finalize the module.
    pub fn build(self) -> Module {
        self.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::RuleKind;

    #[test]
    fn test_rule_builder_defaults_to_truthy_body() {
        let rule = RuleBuilder::new("p").value(Term::int(1)).build();
        assert_eq!(rule.body.len(), 1);
        assert_eq!(rule.kind(), RuleKind::SingleValue);
    }

    #[test]
    fn test_rule_builder_multi_value() {
        let rule = RuleBuilder::new("p")
            .key(Term::var("x"))
            .body(eq_expr(Term::var("x"), Term::string("a")))
            .build();
        assert_eq!(rule.kind(), RuleKind::MultiValue);
    }

    #[test]
    fn test_operator_ref_dotted() {
        let r = operator_ref("rego.metadata.chain");
        assert_eq!(r.len(), 3);
        assert_eq!(super::super::ref_operator_name(&r).as_deref(), Some("rego.metadata.chain"));
    }

    #[test]
    fn test_module_builder() {
        let m = ModuleBuilder::new(&["a", "b"])
            .rule(RuleBuilder::new("p").value(Term::boolean(true)).build())
            .build();
        assert_eq!(m.package.path.to_string(), "data.a.b");
        assert_eq!(m.rules.len(), 1);
    }
}
