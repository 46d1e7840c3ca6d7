//! Type Checker
//!
//! Walks rules in dependency order (leaves first), inferring rule head
//! types from their bodies and checking call expressions against function
//! declarations. External document types come from the schema set; virtual
//! document types accumulate in the [`TypeEnv`] as rules are checked.
//! Type errors are non-fatal up to the error limit.

use super::schema::{type_from_schema, SchemaSet};
use super::{type_of_value, Type};
use crate::annotations::SchemaAnnotation;
use crate::ast::{
    ref_operator_name, Body, Expr, ExprTerms, Ref, Rule, RuleId, RuleKind, Term, Value, Var,
};
use crate::errors::Error;
use std::collections::BTreeMap;

/// Types of document paths, keyed by the successive elements of a ref.
#[derive(Debug, Clone, Default)]
pub struct TypeEnv {
    root: TypeTreeNode,
}

#[derive(Debug, Clone, Default)]
struct TypeTreeNode {
    value: Option<Type>,
    children: BTreeMap<Value, TypeTreeNode>,
}

impl TypeEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a type at a path, widening with any existing type.
    pub fn insert(&mut self, path: &Ref, t: Type) {
        let mut node = &mut self.root;
        for term in path.iter() {
            node = node.children.entry(term.value.clone()).or_default();
        }
        node.value = Some(match node.value.take() {
            Some(existing) => Type::union(existing, t),
            None => t,
        });
    }

    /// The type recorded at exactly this path, if any.
    pub fn get(&self, path: &Ref) -> Option<&Type> {
        let mut node = &self.root;
        for term in path.iter() {
            node = node.children.get(&term.value)?;
        }
        node.value.as_ref()
    }

    fn node(&self, value: &Value) -> Option<&TypeTreeNode> {
        self.root.children.get(value)
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty() && self.root.value.is_none()
    }
}

/// Inputs to a type-checking run.
pub struct CheckParams<'a> {
    /// Rules in dependency order, leaves first
    pub ordered: &'a [(RuleId, &'a Rule)],
    /// Resolves a built-in name to its declaration
    pub builtin_decl: &'a dyn Fn(&str) -> Option<Type>,
    pub schemas: &'a SchemaSet,
    /// Network allow-list for remote schema references
    pub allow_net: Option<&'a [String]>,
    /// Per-rule schema annotations (when annotation checking is enabled)
    pub rule_schemas: &'a BTreeMap<RuleId, Vec<SchemaAnnotation>>,
    /// Remaining error allowance before the limit marker
    pub max_errors: usize,
}

/// Check all rules, returning the resulting type environment and errors.
pub fn check_types(params: CheckParams<'_>) -> (TypeEnv, Vec<Error>) {
    let mut checker = TypeChecker::new(&params);
    checker.seed_schemas(params.schemas, params.allow_net);
    for (id, rule) in params.ordered {
        if checker.errors.len() >= params.max_errors {
            break;
        }
        checker.check_rule(*id, rule);
    }
    (checker.env, checker.errors)
}

/// The checker state for one run.
pub struct TypeChecker<'a> {
    builtin_decl: &'a dyn Fn(&str) -> Option<Type>,
    rule_schemas: &'a BTreeMap<RuleId, Vec<SchemaAnnotation>>,
    env: TypeEnv,
    /// Function rule types, keyed by dotted rule path
    func_types: BTreeMap<String, Type>,
    input_type: Type,
    errors: Vec<Error>,
}

impl<'a> TypeChecker<'a> {
    fn new(params: &CheckParams<'a>) -> Self {
        TypeChecker {
            builtin_decl: params.builtin_decl,
            rule_schemas: params.rule_schemas,
            env: TypeEnv::new(),
            func_types: BTreeMap::new(),
            input_type: Type::Any,
            errors: Vec::new(),
        }
    }

    fn seed_schemas(&mut self, schemas: &SchemaSet, allow_net: Option<&[String]>) {
        for (path, schema) in schemas.iter() {
            match type_from_schema(schema, allow_net) {
                Ok(t) => {
                    if path == "input" {
                        self.input_type = t;
                    } else {
                        let parts: Vec<&str> = path.split('.').collect();
                        self.env.insert(&Ref::dotted(&parts), t);
                    }
                }
                Err(e) => self.errors.push(Error::new(
                    crate::errors::ErrorCode::TypeErr,
                    None,
                    format!("schema for {path}: {e}"),
                )),
            }
        }
    }

    fn check_rule(&mut self, id: RuleId, rule: &Rule) {
        for chain_rule in rule.iter_chain() {
            self.check_rule_definition(id, chain_rule);
        }
    }

    fn check_rule_definition(&mut self, id: RuleId, rule: &Rule) {
        let mut locals: BTreeMap<Var, Type> = BTreeMap::new();
        for arg in &rule.head.args {
            bind_pattern(arg, &Type::Any, &mut locals);
        }

        // Annotation-scoped schemas override the input type for this rule.
        let saved_input = self.input_type.clone();
        if let Some(schemas) = self.rule_schemas.get(&id) {
            for annotation in schemas {
                if let Some(schema) = &annotation.schema {
                    match type_from_schema(schema, None) {
                        Ok(t) if annotation.path == "input" => self.input_type = t,
                        Ok(t) => {
                            let parts: Vec<&str> = annotation.path.split('.').collect();
                            self.env.insert(&Ref::dotted(&parts), t);
                        }
                        Err(e) => self.errors.push(Error::new(
                            crate::errors::ErrorCode::TypeErr,
                            Some(rule.location.clone()),
                            format!("schema for {}: {e}", annotation.path),
                        )),
                    }
                }
            }
        }

        self.check_body(&rule.body, &mut locals);

        // Infer and record the head type.
        let path = rule.head.reference.ground_prefix();
        match rule.kind() {
            RuleKind::Function => {
                let args: Vec<Type> = rule
                    .head
                    .args
                    .iter()
                    .map(|a| self.infer(a, &mut locals))
                    .collect();
                let result = rule
                    .head
                    .value
                    .as_ref()
                    .map_or(Type::Boolean, |v| self.infer(v, &mut locals));
                let func = Type::func(args, result);
                if let Some(name) = ref_operator_name(&rule.head.reference) {
                    let merged = match self.func_types.remove(&name) {
                        Some(existing) => Type::union(existing, func.clone()),
                        None => func.clone(),
                    };
                    self.func_types.insert(name, merged);
                }
                self.env.insert(&path, func);
            }
            RuleKind::MultiValue => {
                let key = rule
                    .head
                    .key
                    .as_ref()
                    .map_or(Type::Any, |k| self.infer(k, &mut locals));
                self.env.insert(&path, Type::set_of(key));
            }
            RuleKind::SingleValue => {
                let value = rule
                    .head
                    .value
                    .as_ref()
                    .map_or(Type::Boolean, |v| self.infer(v, &mut locals));
                let recorded = if rule.head.key.is_some() {
                    // Key-value form: a partial object.
                    let key = rule
                        .head
                        .key
                        .as_ref()
                        .map_or(Type::Any, |k| self.infer(k, &mut locals));
                    Type::object_dynamic(key, value)
                } else if rule.head.reference.is_ground() {
                    value
                } else {
                    // General ref head: values land at dynamic positions.
                    Type::object_dynamic(Type::Any, value)
                };
                self.env.insert(&path, recorded);
            }
        }

        self.input_type = saved_input;
    }

    fn check_body(&mut self, body: &Body, locals: &mut BTreeMap<Var, Type>) {
        for expr in body.iter() {
            self.check_expr(expr, locals);
        }
    }

    fn check_expr(&mut self, expr: &Expr, locals: &mut BTreeMap<Var, Type>) {
        match &expr.terms {
            ExprTerms::Term(t) => {
                self.infer(t, locals);
            }
            ExprTerms::Call(_) => self.check_call(expr, locals),
            ExprTerms::SomeDecl(_) => {}
            ExprTerms::Every(every) => {
                let domain = self.infer(&every.domain, locals);
                if let Some(key) = &every.key {
                    if let Value::Var(v) = &key.value {
                        let t = domain.keys_type().unwrap_or(Type::Any);
                        locals.insert(v.clone(), t);
                    }
                }
                if let Value::Var(v) = &every.value.value {
                    let t = domain.select_dynamic().unwrap_or(Type::Any);
                    locals.insert(v.clone(), t);
                }
                let mut inner = locals.clone();
                self.check_body(&every.body, &mut inner);
            }
        }
        for w in &expr.with {
            self.infer(&w.value, locals);
        }
    }

    fn check_call(&mut self, expr: &Expr, locals: &mut BTreeMap<Var, Type>) {
        let Some(name) = expr.operator_name() else {
            return;
        };
        let operands = expr.operands();

        if name == "eq" || name == "assign" || name == "equal" || name == "neq" {
            if let [a, b] = operands {
                let ta = self.infer(a, locals);
                let tb = self.infer(b, locals);
                if !ta.contains(&tb) && !tb.contains(&ta) {
                    self.errors.push(Error::type_err(
                        expr.location.clone(),
                        format!("match error: cannot unify {ta} with {tb}"),
                    ));
                    return;
                }
                bind_pattern(a, &tb, locals);
                bind_pattern(b, &ta, locals);
            }
            return;
        }

        let decl = (self.builtin_decl)(&name).or_else(|| self.func_types.get(&name).cloned());
        let Some(Type::Function {
            args: decl_args,
            result,
            variadic,
        }) = decl
        else {
            return;
        };

        let declared = decl_args.len();
        for (i, operand) in operands.iter().enumerate().take(declared) {
            let got = self.infer(operand, locals);
            let want = &decl_args[i];
            if !want.contains(&got) && !got.contains(want) {
                self.errors.push(Error::type_err(
                    operand.location.clone(),
                    format!("operand {} must be {want} but got {got}", i + 1),
                ));
            }
        }
        if let Some(variadic) = &variadic {
            for operand in operands.iter().skip(declared) {
                let got = self.infer(operand, locals);
                if !variadic.contains(&got) && !got.contains(variadic) {
                    self.errors.push(Error::type_err(
                        operand.location.clone(),
                        format!("operand must be {variadic} but got {got}"),
                    ));
                }
            }
            return;
        }

        // Capture position binds the result type.
        if operands.len() == declared + 1 {
            let result_type = result.map_or(Type::Any, |r| *r);
            if let Some(capture) = operands.last() {
                bind_pattern(capture, &result_type, locals);
            }
        }
    }

    /// Infer the type of a term, binding reference selector variables as a
    /// side effect.
    fn infer(&mut self, term: &Term, locals: &mut BTreeMap<Var, Type>) -> Type {
        match &term.value {
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
                type_of_value(&term.value)
            }
            Value::Var(v) => {
                if v.as_str() == "input" {
                    self.input_type.clone()
                } else {
                    locals.get(v).cloned().unwrap_or(Type::Any)
                }
            }
            Value::Ref(r) => self.infer_ref(r, locals),
            Value::Array(items) => Type::tuple(
                items.iter().map(|t| self.infer(t, locals)).collect(),
            ),
            Value::Set(items) => {
                let elems: Vec<Type> = items.iter().map(|t| self.infer(t, locals)).collect();
                Type::set_of(Type::or_of(elems))
            }
            Value::Object(pairs) => {
                let props = pairs
                    .iter()
                    .map(|(k, v)| super::StaticProperty {
                        key: k.value.clone(),
                        value: self.infer(v, locals),
                    })
                    .collect();
                Type::object_static(props)
            }
            Value::Call(_) => Type::Any,
            Value::ArrayComprehension { term, body } => {
                let mut inner = locals.clone();
                self.check_body(body, &mut inner);
                Type::array_of(self.infer(term, &mut inner))
            }
            Value::SetComprehension { term, body } => {
                let mut inner = locals.clone();
                self.check_body(body, &mut inner);
                Type::set_of(self.infer(term, &mut inner))
            }
            Value::ObjectComprehension { key, value, body } => {
                let mut inner = locals.clone();
                self.check_body(body, &mut inner);
                let kt = self.infer(key, &mut inner);
                let vt = self.infer(value, &mut inner);
                Type::object_dynamic(kt, vt)
            }
        }
    }

    fn infer_ref(&mut self, r: &Ref, locals: &mut BTreeMap<Var, Type>) -> Type {
        let Some(head) = r.head() else {
            return Type::Any;
        };

        // Walk the type tree as long as selectors stay ground and nodes
        // exist; fall back to structural navigation afterwards.
        let mut node = self.env.node(&head.value);
        let mut current: Option<Type> = match &head.value {
            Value::Var(v) if v.as_str() == "input" => Some(self.input_type.clone()),
            Value::Var(v) if v.as_str() == "data" => None,
            Value::Var(v) => Some(locals.get(v).cloned().unwrap_or(Type::Any)),
            _ => Some(Type::Any),
        };

        for selector in r.iter().skip(1) {
            if let Some(n) = node {
                match &selector.value {
                    value if value.is_ground() => {
                        if let Some(child) = n.children.get(value) {
                            node = Some(child);
                            current = child.value.clone();
                            continue;
                        }
                        node = None;
                        current = n
                            .value
                            .as_ref()
                            .and_then(|t| t.select_constant(value))
                            .or(Some(Type::Any));
                        continue;
                    }
                    Value::Var(v) => {
                        // Dynamic selector over the tree: the variable
                        // iterates child keys and recorded value keys.
                        if !v.is_wildcard() {
                            locals.entry(v.clone()).or_insert(Type::Any);
                        }
                        node = None;
                        current = Some(Type::Any);
                        continue;
                    }
                    _ => {
                        node = None;
                        current = Some(Type::Any);
                        continue;
                    }
                }
            }

            let base = current.take().unwrap_or(Type::Any);
            match &selector.value {
                value if value.is_ground() => {
                    current = Some(base.select_constant(value).unwrap_or_else(|| {
                        if !base.is_any() {
                            self.errors.push(Error::type_err(
                                selector.location.clone(),
                                format!("undefined ref: {r} ({base} has no key {value})"),
                            ));
                        }
                        Type::Any
                    }));
                }
                Value::Var(v) => {
                    if !v.is_wildcard() {
                        let key_type = base.keys_type().unwrap_or(Type::Any);
                        let entry = locals.entry(v.clone()).or_insert(Type::Any);
                        if entry.is_any() {
                            *entry = key_type;
                        }
                    }
                    current = Some(base.select_dynamic().unwrap_or(Type::Any));
                }
                _ => current = Some(Type::Any),
            }
        }

        current.or_else(|| node.and_then(|n| n.value.clone())).unwrap_or(Type::Any)
    }
}

/// Bind variables in a unification pattern to (components of) a type.
fn bind_pattern(term: &Term, t: &Type, locals: &mut BTreeMap<Var, Type>) {
    match &term.value {
        Value::Var(v) => {
            if !v.is_wildcard() && v.as_str() != "input" && v.as_str() != "data" {
                let entry = locals.entry(v.clone()).or_insert(Type::Any);
                if entry.is_any() {
                    *entry = t.clone();
                }
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                let elem = t
                    .select_constant(&Value::Number(crate::number::Number::from(i)))
                    .unwrap_or(Type::Any);
                bind_pattern(item, &elem, locals);
            }
        }
        Value::Object(pairs) => {
            for (k, v) in pairs {
                let elem = t.select_constant(&k.value).unwrap_or(Type::Any);
                bind_pattern(v, &elem, locals);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::builders::{call_expr, eq_expr, RuleBuilder};
    use serde_json::json;

    fn builtin_decl(name: &str) -> Option<Type> {
        crate::builtins::get(name).map(|b| b.decl.clone())
    }

    fn run(rules: Vec<Rule>, schemas: SchemaSet) -> (TypeEnv, Vec<Error>) {
        let ordered: Vec<(RuleId, &Rule)> = rules
            .iter()
            .enumerate()
            .map(|(i, r)| (RuleId::new(0, i), r))
            .collect();
        check_types(CheckParams {
            ordered: &ordered,
            builtin_decl: &builtin_decl,
            schemas: &schemas,
            allow_net: None,
            rule_schemas: &BTreeMap::new(),
            max_errors: 10,
        })
    }

    fn qualified(name: &str, rule: RuleBuilder) -> Rule {
        let mut r = rule.build();
        r.head.reference = Ref::dotted(&["data", "a", name]);
        r
    }

    #[test]
    fn test_complete_rule_head_type_recorded() {
        let rule = qualified("p", RuleBuilder::new("p").value(Term::int(1)));
        let (env, errors) = run(vec![rule], SchemaSet::new());
        assert!(errors.is_empty());
        assert_eq!(env.get(&Ref::dotted(&["data", "a", "p"])), Some(&Type::Number));
    }

    #[test]
    fn test_multi_value_rule_records_set_type() {
        let rule = qualified(
            "p",
            RuleBuilder::new("p")
                .key(Term::var("x"))
                .body(eq_expr(Term::var("x"), Term::string("a"))),
        );
        let (env, errors) = run(vec![rule], SchemaSet::new());
        assert!(errors.is_empty());
        assert_eq!(
            env.get(&Ref::dotted(&["data", "a", "p"])),
            Some(&Type::set_of(Type::String))
        );
    }

    #[test]
    fn test_rules_widen_to_union() {
        let r1 = qualified("p", RuleBuilder::new("p").value(Term::int(1)));
        let r2 = qualified("p", RuleBuilder::new("p").value(Term::string("x")));
        let (env, errors) = run(vec![r1, r2], SchemaSet::new());
        assert!(errors.is_empty());
        assert_eq!(
            env.get(&Ref::dotted(&["data", "a", "p"])),
            Some(&Type::or_of(vec![Type::Number, Type::String]))
        );
    }

    #[test]
    fn test_builtin_operand_type_mismatch() {
        // plus("a", 1, out)
        let mut call = call_expr(
            "plus",
            vec![Term::string("a"), Term::int(1), Term::var("out")],
        );
        call.generated = true;
        let rule = qualified("p", RuleBuilder::new("p").value(Term::boolean(true)).body(call));
        let (_, errors) = run(vec![rule], SchemaSet::new());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("operand 1 must be number but got string"));
    }

    #[test]
    fn test_capture_binds_result_type() {
        // plus(1, 2, out); startswith(out, "x")  => out is number, mismatch
        let mut add = call_expr("plus", vec![Term::int(1), Term::int(2), Term::var("out")]);
        add.generated = true;
        let bad = call_expr("startswith", vec![Term::var("out"), Term::string("x")]);
        let rule = qualified(
            "p",
            RuleBuilder::new("p").value(Term::boolean(true)).body(add).body(bad),
        );
        let (_, errors) = run(vec![rule], SchemaSet::new());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("must be string but got number"));
    }

    #[test]
    fn test_unification_mismatch() {
        let rule = qualified(
            "p",
            RuleBuilder::new("p")
                .value(Term::boolean(true))
                .body(eq_expr(Term::string("s"), Term::int(1))),
        );
        let (_, errors) = run(vec![rule], SchemaSet::new());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("match error"));
    }

    #[test]
    fn test_input_schema_drives_ref_types() {
        let mut schemas = SchemaSet::new();
        schemas.put_input(json!({
            "type": "object",
            "properties": {"user": {"type": "string"}},
            "additionalProperties": false
        }));

        // eq(input.user, 1) is a type mismatch under the schema
        let rule = qualified(
            "p",
            RuleBuilder::new("p").value(Term::boolean(true)).body(eq_expr(
                Term::ref_term(Ref::dotted(&["input", "user"])),
                Term::int(1),
            )),
        );
        let (_, errors) = run(vec![rule], schemas);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("match error"));
    }

    #[test]
    fn test_data_schema_seeded_into_env() {
        let mut schemas = SchemaSet::new();
        schemas.put(
            &Ref::dotted(&["data", "servers"]),
            json!({"type": "array", "items": {"type": "string"}}),
        );
        let (env, errors) = run(vec![], schemas);
        assert!(errors.is_empty());
        assert_eq!(
            env.get(&Ref::dotted(&["data", "servers"])),
            Some(&Type::array_of(Type::String))
        );
    }

    #[test]
    fn test_function_type_recorded_and_checked() {
        // f(x) := x  then  p { f(1, out); startswith(out, "s") }
        let f = {
            let mut r = RuleBuilder::new("f")
                .args(vec![Term::var("x")])
                .value(Term::var("x"))
                .build();
            r.head.reference = Ref::dotted(&["data", "a", "f"]);
            r
        };
        let mut call = call_expr("data.a.f", vec![Term::int(1), Term::var("out")]);
        call.generated = true;
        let p = qualified(
            "p",
            RuleBuilder::new("p").value(Term::boolean(true)).body(call),
        );
        let (env, errors) = run(vec![f, p], SchemaSet::new());
        assert!(errors.is_empty(), "{errors:?}");
        assert!(matches!(
            env.get(&Ref::dotted(&["data", "a", "f"])),
            Some(Type::Function { .. })
        ));
    }

    #[test]
    fn test_comprehension_types() {
        // xs = [x | x = 1]  records array[number] via unification binding
        let compr = Term::new(Value::ArrayComprehension {
            term: Box::new(Term::var("x")),
            body: Body::new(vec![eq_expr(Term::var("x"), Term::int(1))]),
        });
        let rule = qualified(
            "p",
            RuleBuilder::new("p")
                .value(Term::var("xs"))
                .body(eq_expr(Term::var("xs"), compr)),
        );
        let (env, errors) = run(vec![rule], SchemaSet::new());
        assert!(errors.is_empty());
        assert_eq!(
            env.get(&Ref::dotted(&["data", "a", "p"])),
            Some(&Type::array_of(Type::Number))
        );
    }

    #[test]
    fn test_error_limit_respected() {
        let mut rules = Vec::new();
        for i in 0..5 {
            rules.push(qualified(
                "p",
                RuleBuilder::new(&format!("p{i}"))
                    .value(Term::boolean(true))
                    .body(eq_expr(Term::string("s"), Term::int(1))),
            ));
        }
        let ordered: Vec<(RuleId, &Rule)> = rules
            .iter()
            .enumerate()
            .map(|(i, r)| (RuleId::new(0, i), r))
            .collect();
        let (_, errors) = check_types(CheckParams {
            ordered: &ordered,
            builtin_decl: &builtin_decl,
            schemas: &SchemaSet::new(),
            allow_net: None,
            rule_schemas: &BTreeMap::new(),
            max_errors: 2,
        });
        assert!(errors.len() <= 3);
    }
}
