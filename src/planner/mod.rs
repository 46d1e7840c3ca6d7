//! # Planner
//!
//! Lowers a compiled module set and a list of entrypoints into the
//! imperative [`Policy`](crate::ir::Policy) IR. Each entrypoint becomes a
//! plan that resolves its rule path through function dispatch and adds the
//! result to the result set; every rule set reachable from an entrypoint is
//! planned as a function. Statements that iterate (reference scans,
//! comprehension bodies) nest their continuations inside the scan block.
//!
//! ```text
//! Compiled AST + entrypoints -> [Planner] -> Policy {static, plans, funcs}
//! ```

use crate::ast::{Expr, ExprTerms, Ref, Rule, RuleId, RuleKind, Term, Value, Var};
use crate::builtins;
use crate::compiler::Compiler;
use crate::errors::{CompileResult, Error, ErrorCode, Errors};
use crate::ir::{
    Block, BuiltinFuncDecl, Func, Local, Operand, Plan, Policy, Static, Stmt, StringConst, DATA,
    FIRST_UNUSED, INPUT,
};
use std::collections::BTreeMap;

/// Plan the given entrypoints against a compiled module set.
pub fn plan(compiler: &Compiler, entrypoints: &[&str]) -> CompileResult<Policy> {
    let mut planner = Planner::new(compiler);
    for ep in entrypoints {
        let reference = compiler.resolve_entrypoint(ep)?;
        let name = plan_name(ep);
        planner.plan_entrypoint(&name, &reference)?;
    }
    Ok(planner.finish())
}

fn plan_name(entrypoint: &str) -> String {
    let dotted = entrypoint.replace('/', ".");
    let trimmed = dotted.strip_prefix("data.").unwrap_or(&dotted);
    trimmed.replace('.', "/")
}

/// Per-function planning state: variable bindings and local allocation.
#[derive(Debug, Clone, Default)]
struct Frame {
    vars: BTreeMap<Var, Local>,
    next: Local,
}

impl Frame {
    fn new() -> Self {
        Frame {
            vars: BTreeMap::new(),
            next: FIRST_UNUSED,
        }
    }

    fn alloc(&mut self) -> Local {
        let l = self.next;
        self.next += 1;
        l
    }
}

struct Planner<'c> {
    compiler: &'c Compiler,
    strings: Vec<String>,
    string_index: BTreeMap<String, usize>,
    builtin_decls: BTreeMap<String, BuiltinFuncDecl>,
    funcs: Vec<Func>,
    funcs_by_path: BTreeMap<String, String>,
    plans: Vec<Plan>,
    frame: Frame,
}

impl<'c> Planner<'c> {
    fn new(compiler: &'c Compiler) -> Self {
        Planner {
            compiler,
            strings: Vec::new(),
            string_index: BTreeMap::new(),
            builtin_decls: BTreeMap::new(),
            funcs: Vec::new(),
            funcs_by_path: BTreeMap::new(),
            plans: Vec::new(),
            frame: Frame::new(),
        }
    }

    fn finish(self) -> Policy {
        Policy {
            static_data: Static {
                strings: self
                    .strings
                    .into_iter()
                    .map(|value| StringConst { value })
                    .collect(),
                builtin_funcs: self.builtin_decls.into_values().collect(),
                files: Vec::new(),
            },
            plans: self.plans,
            funcs: self.funcs,
        }
    }

    fn intern(&mut self, s: &str) -> usize {
        if let Some(&i) = self.string_index.get(s) {
            return i;
        }
        let i = self.strings.len();
        self.strings.push(s.to_string());
        self.string_index.insert(s.to_string(), i);
        i
    }

    // ------------------------------------------------------------------
    // Entrypoints
    // ------------------------------------------------------------------

    fn plan_entrypoint(&mut self, name: &str, reference: &Ref) -> CompileResult<()> {
        self.frame = Frame::new();
        let mut block = Block::new();
        let value = self.plan_ref_value(reference, &mut block)?;
        let result = self.frame.alloc();
        block.push(Stmt::AssignVarStmt {
            source: Operand::Local(value),
            target: result,
        });
        block.push(Stmt::ResultSetAddStmt { value: result });
        self.plans.push(Plan {
            name: name.to_string(),
            blocks: vec![block],
        });
        Ok(())
    }

    /// Resolve a ground reference to a value local: rule dispatch for the
    /// longest rule-set prefix, `Dot` for base-document or residual
    /// selectors, and package materialization for pure-package paths.
    fn plan_ref_value(&mut self, reference: &Ref, block: &mut Block) -> CompileResult<Local> {
        // Find the longest prefix holding rules.
        let mut rule_prefix: Option<usize> = None;
        for n in (1..=reference.len()).rev() {
            let prefix = reference.truncate(n);
            if let Some(node) = self.compiler.rule_tree().lookup(&prefix) {
                if !node.values.is_empty() {
                    rule_prefix = Some(n);
                    break;
                }
            }
        }

        let (mut local, consumed) = match rule_prefix {
            Some(n) => {
                let prefix = reference.truncate(n);
                let ids: Vec<RuleId> = self
                    .compiler
                    .rule_tree()
                    .lookup(&prefix)
                    .map(|node| node.values.clone())
                    .unwrap_or_default();
                let func = self.plan_rules(&prefix, &ids)?;
                let target = self.frame.alloc();
                block.push(Stmt::CallStmt {
                    func,
                    args: vec![Operand::Local(INPUT), Operand::Local(DATA)],
                    result: target,
                });
                (target, n)
            }
            None => {
                let node = self.compiler.rule_tree().lookup(reference);
                if node.is_some_and(|n| !n.children.is_empty()) {
                    // A package: materialize the subtree of rule sets.
                    let local = self.plan_virtual_document(reference, block)?;
                    (local, reference.len())
                } else {
                    // Base document: navigate from the data local.
                    let root = match reference.head().map(|t| &t.value) {
                        Some(Value::Var(v)) if v.as_str() == "input" => INPUT,
                        _ => DATA,
                    };
                    (root, 1)
                }
            }
        };

        for selector in reference.iter().skip(consumed.max(1)) {
            let key = self.plan_operand(selector, block)?;
            let target = self.frame.alloc();
            block.push(Stmt::DotStmt {
                source: Operand::Local(local),
                key,
                target,
            });
            local = target;
        }
        Ok(local)
    }

    /// Build an object holding every rule set under a package path.
    fn plan_virtual_document(
        &mut self,
        reference: &Ref,
        block: &mut Block,
    ) -> CompileResult<Local> {
        let target = self.frame.alloc();
        block.push(Stmt::MakeObjectStmt { target });

        let Some(node) = self.compiler.rule_tree().lookup(reference) else {
            return Ok(target);
        };
        let children: Vec<(Value, bool)> = node
            .children
            .iter()
            .map(|(k, child)| (k.clone(), !child.values.is_empty() || !child.children.is_empty()))
            .collect();
        for (key, populated) in children {
            if !populated {
                continue;
            }
            let Value::String(name) = &key else { continue };
            let child_ref = reference.append(Term::string(name.clone()));
            let value = self.plan_ref_value(&child_ref, block)?;
            let key_idx = self.intern(name);
            block.push(Stmt::ObjectInsertStmt {
                object: target,
                key: Operand::StringIndex(key_idx),
                value: Operand::Local(value),
            });
        }
        Ok(target)
    }

    // ------------------------------------------------------------------
    // Rule sets
    // ------------------------------------------------------------------

    fn plan_rules(&mut self, path: &Ref, ids: &[RuleId]) -> CompileResult<String> {
        let path_str = path.to_string();
        if let Some(name) = self.funcs_by_path.get(&path_str) {
            return Ok(name.clone());
        }
        let name = format!("g0.{path_str}");
        // Register before planning bodies so recursive lookups terminate;
        // recursion itself was rejected earlier in the pipeline.
        self.funcs_by_path.insert(path_str.clone(), name.clone());

        let saved = std::mem::replace(&mut self.frame, Frame::new());

        let rules: Vec<&Rule> = ids
            .iter()
            .filter_map(|id| self.compiler.rule(*id))
            .collect();
        let kind = rules.first().map_or(RuleKind::SingleValue, |r| r.kind());
        let return_local = self.frame.alloc();

        let mut blocks = Vec::new();
        match kind {
            RuleKind::SingleValue => {
                for rule in rules.iter().filter(|r| !r.head.default) {
                    blocks.push(self.plan_rule_chain(rule, return_local)?);
                }
                for rule in rules.iter().filter(|r| r.head.default) {
                    let mut b = Block::new();
                    b.push(Stmt::IsUndefinedStmt {
                        source: return_local,
                    });
                    let value = rule.head.value.clone().unwrap_or_else(Term::null);
                    let v = self.plan_term_value(&value, &mut b)?;
                    b.push(Stmt::AssignVarStmt {
                        source: Operand::Local(v),
                        target: return_local,
                    });
                    blocks.push(b);
                }
            }
            RuleKind::MultiValue => {
                let mut init = Block::new();
                init.push(Stmt::MakeSetStmt {
                    target: return_local,
                });
                blocks.push(init);
                for rule in &rules {
                    let mut b = Block::new();
                    let key = rule.head.key.clone().unwrap_or_else(Term::null);
                    self.plan_body_then(&rule.body.0.clone(), &mut b, &mut |p, inner| {
                        let k = p.plan_term_value(&key, inner)?;
                        inner.push(Stmt::SetAddStmt {
                            set: return_local,
                            value: Operand::Local(k),
                        });
                        Ok(())
                    })?;
                    blocks.push(b);
                }
            }
            RuleKind::Function => {
                // Function parameters follow input and data.
                let arity = rules.first().map_or(0, |r| r.arity());
                let mut params = vec![INPUT, DATA];
                let mut arg_locals = Vec::new();
                for _ in 0..arity {
                    let l = self.frame.alloc();
                    params.push(l);
                    arg_locals.push(l);
                }
                for rule in rules.iter().filter(|r| !r.head.default) {
                    let mut b = Block::new();
                    for (arg, local) in rule.head.args.iter().zip(&arg_locals) {
                        self.bind_pattern_to_local(arg, *local, &mut b)?;
                    }
                    let value = rule.head.value.clone().unwrap_or_else(|| Term::boolean(true));
                    self.plan_body_then(&rule.body.0.clone(), &mut b, &mut |p, inner| {
                        let v = p.plan_term_value(&value, inner)?;
                        inner.push(Stmt::AssignVarOnceStmt {
                            source: Operand::Local(v),
                            target: return_local,
                        });
                        Ok(())
                    })?;
                    blocks.push(b);
                }
                let mut ret = Block::new();
                ret.push(Stmt::ReturnLocalStmt {
                    source: return_local,
                });
                blocks.push(ret);

                let func = Func {
                    name: name.clone(),
                    path: func_path(&name),
                    params,
                    return_local,
                    blocks,
                };
                self.funcs.push(func);
                self.frame = saved;
                return Ok(name);
            }
        }

        let mut ret = Block::new();
        ret.push(Stmt::ReturnLocalStmt {
            source: return_local,
        });
        blocks.push(ret);

        let func = Func {
            name: name.clone(),
            path: func_path(&name),
            params: vec![INPUT, DATA],
            return_local,
            blocks,
        };
        self.funcs.push(func);
        self.frame = saved;
        Ok(name)
    }

    /// Plan a complete rule and its else-branches: each branch after the
    /// first runs only if no earlier branch assigned a value.
    fn plan_rule_chain(&mut self, rule: &Rule, return_local: Local) -> CompileResult<Block> {
        let chain: Vec<&Rule> = rule.iter_chain().collect();
        let mut branches = Vec::new();
        for (i, member) in chain.iter().enumerate() {
            let mut b = Block::new();
            if i > 0 {
                b.push(Stmt::IsUndefinedStmt {
                    source: return_local,
                });
            }
            let value = member.head.value.clone().unwrap_or_else(|| Term::boolean(true));
            self.plan_body_then(&member.body.0.clone(), &mut b, &mut |p, inner| {
                let v = p.plan_term_value(&value, inner)?;
                inner.push(Stmt::AssignVarOnceStmt {
                    source: Operand::Local(v),
                    target: return_local,
                });
                Ok(())
            })?;
            branches.push(b);
        }
        if branches.len() == 1 {
            return Ok(branches.remove(0));
        }
        let mut outer = Block::new();
        outer.push(Stmt::BlockStmt { blocks: branches });
        Ok(outer)
    }

    // ------------------------------------------------------------------
    // Bodies and expressions
    // ------------------------------------------------------------------

    /// Plan a sequence of expressions, nesting the continuation inside any
    /// iteration the expressions introduce.
    fn plan_body_then(
        &mut self,
        exprs: &[Expr],
        block: &mut Block,
        done: &mut dyn FnMut(&mut Self, &mut Block) -> CompileResult<()>,
    ) -> CompileResult<()> {
        match exprs.split_first() {
            None => done(self, block),
            Some((expr, rest)) => {
                let rest = rest.to_vec();
                self.plan_expr_then(expr, block, &mut |p, b| {
                    p.plan_body_then(&rest, b, &mut *done)
                })
            }
        }
    }

    fn plan_expr_then(
        &mut self,
        expr: &Expr,
        block: &mut Block,
        k: &mut dyn FnMut(&mut Self, &mut Block) -> CompileResult<()>,
    ) -> CompileResult<()> {
        if !expr.with.is_empty() {
            let mut errs = Errors::new();
            errs.push(Error::new(
                ErrorCode::CompileErr,
                Some(expr.location.clone()),
                "with modifier is not supported by the planner",
            ));
            return Err(errs);
        }

        if expr.negated {
            let mut inner = Block::new();
            let mut stripped = expr.clone();
            stripped.negated = false;
            self.plan_expr_then(&stripped, &mut inner, &mut |_p, _b| Ok(()))?;
            block.push(Stmt::NotStmt { block: inner });
            return k(self, block);
        }

        match &expr.terms {
            ExprTerms::Term(t) => self.plan_truth_term(t, block, k),
            ExprTerms::Call(_) => self.plan_call_expr(expr, block, k),
            ExprTerms::SomeDecl(_) => k(self, block),
            ExprTerms::Every(every) => {
                let domain = self.plan_term_value(&every.domain, block)?;
                let counterexamples = self.frame.alloc();
                block.push(Stmt::MakeSetStmt {
                    target: counterexamples,
                });

                let key = self.local_for_term(&every.key.clone().unwrap_or_else(Term::null));
                let value = self.local_for_term(&every.value);
                let mut scan_block = Block::new();
                let mut body_block = Block::new();
                self.plan_body_then(&every.body.0.clone(), &mut body_block, &mut |_p, _b| Ok(()))?;
                scan_block.push(Stmt::NotStmt { block: body_block });
                scan_block.push(Stmt::SetAddStmt {
                    set: counterexamples,
                    value: Operand::Bool(true),
                });
                block.push(Stmt::ScanStmt {
                    source: domain,
                    key,
                    value,
                    block: scan_block,
                });

                // The quantifier holds iff no element produced a
                // counterexample.
                let count = self.frame.alloc();
                self.record_builtin("count");
                block.push(Stmt::CallStmt {
                    func: "count".to_string(),
                    args: vec![Operand::Local(counterexamples)],
                    result: count,
                });
                let zero = self.frame.alloc();
                block.push(Stmt::MakeNumberIntStmt {
                    value: 0,
                    target: zero,
                });
                block.push(Stmt::EqualStmt {
                    a: Operand::Local(count),
                    b: Operand::Local(zero),
                });
                k(self, block)
            }
        }
    }

    /// A bare term is truthy iff it is defined and not `false`.
    fn plan_truth_term(
        &mut self,
        t: &Term,
        block: &mut Block,
        k: &mut dyn FnMut(&mut Self, &mut Block) -> CompileResult<()>,
    ) -> CompileResult<()> {
        if let Value::Ref(r) = &t.value {
            return self.plan_ref_then(
                r,
                block,
                &mut |_p, b, local| {
                    b.push(Stmt::NotEqualStmt {
                        a: Operand::Local(local),
                        b: Operand::Bool(false),
                    });
                    Ok(())
                },
                k,
            );
        }
        let v = self.plan_term_value(t, block)?;
        block.push(Stmt::NotEqualStmt {
            a: Operand::Local(v),
            b: Operand::Bool(false),
        });
        k(self, block)
    }

    fn plan_call_expr(
        &mut self,
        expr: &Expr,
        block: &mut Block,
        k: &mut dyn FnMut(&mut Self, &mut Block) -> CompileResult<()>,
    ) -> CompileResult<()> {
        let Some(name) = expr.operator_name() else {
            return k(self, block);
        };
        let operands = expr.operands();

        match name.as_str() {
            "eq" => {
                if let [a, b] = operands {
                    let (a, b) = (a.clone(), b.clone());
                    return self.plan_eq_then(&a, &b, block, k);
                }
                return k(self, block);
            }
            "equal" => {
                if let [a, b] = operands {
                    let la = self.plan_term_value(a, block)?;
                    let lb = self.plan_term_value(b, block)?;
                    block.push(Stmt::EqualStmt {
                        a: Operand::Local(la),
                        b: Operand::Local(lb),
                    });
                }
                return k(self, block);
            }
            "neq" => {
                if let [a, b] = operands {
                    let la = self.plan_term_value(a, block)?;
                    let lb = self.plan_term_value(b, block)?;
                    block.push(Stmt::NotEqualStmt {
                        a: Operand::Local(la),
                        b: Operand::Local(lb),
                    });
                }
                return k(self, block);
            }
            _ => {}
        }

        // Resolve the callee: built-in or planned rule function.
        let (func, declared) = if let Some(b) = builtins::get(&name) {
            self.record_builtin(&name);
            (name.clone(), b.arity())
        } else {
            let operator = expr
                .operator()
                .cloned()
                .unwrap_or_default();
            let ids: Vec<RuleId> = self
                .compiler
                .rule_tree()
                .lookup(&operator)
                .map(|n| n.values.clone())
                .unwrap_or_default();
            let arity = self.compiler.operator_arity(&name).unwrap_or(0);
            (self.plan_rules(&operator, &ids)?, arity)
        };

        let mut args = vec![];
        if builtins::get(&name).is_none() {
            args.push(Operand::Local(INPUT));
            args.push(Operand::Local(DATA));
        }
        for operand in operands.iter().take(declared) {
            let l = self.plan_term_value(operand, block)?;
            args.push(Operand::Local(l));
        }
        let result = self.frame.alloc();
        block.push(Stmt::CallStmt { func, args, result });

        if operands.len() == declared + 1 {
            // Capture form: unify the result into the final operand.
            if let Some(capture) = operands.last() {
                self.unify_local(capture, result, block)?;
            }
        } else {
            block.push(Stmt::NotEqualStmt {
                a: Operand::Local(result),
                b: Operand::Bool(false),
            });
        }
        k(self, block)
    }

    // ------------------------------------------------------------------
    // Unification
    // ------------------------------------------------------------------

    /// Unify two terms, nesting the continuation when one side is a
    /// reference that iterates (unbound selector variables).
    fn plan_eq_then(
        &mut self,
        a: &Term,
        b: &Term,
        block: &mut Block,
        k: &mut dyn FnMut(&mut Self, &mut Block) -> CompileResult<()>,
    ) -> CompileResult<()> {
        let iterates = |p: &Self, t: &Term| {
            matches!(&t.value, Value::Ref(r)
                if r.len() > 1 && r.iter().skip(1).any(|s| p.is_unbound_var(s)))
        };
        if iterates(self, b) {
            if let Value::Ref(r) = &b.value {
                let r = r.clone();
                let a = a.clone();
                return self.plan_ref_then(
                    &r,
                    block,
                    &mut |p, blk, local| p.unify_local(&a, local, blk),
                    k,
                );
            }
        }
        if iterates(self, a) {
            if let Value::Ref(r) = &a.value {
                let r = r.clone();
                let b = b.clone();
                return self.plan_ref_then(
                    &r,
                    block,
                    &mut |p, blk, local| p.unify_local(&b, local, blk),
                    k,
                );
            }
        }
        self.plan_unify(a, b, block)?;
        k(self, block)
    }

    fn plan_unify(&mut self, a: &Term, b: &Term, block: &mut Block) -> CompileResult<()> {
        // Prefer binding an unbound variable side against the other side.
        if self.is_unbound_var(a) {
            let v = self.plan_term_value(b, block)?;
            return self.unify_local(a, v, block);
        }
        if self.is_unbound_var(b) {
            let v = self.plan_term_value(a, block)?;
            return self.unify_local(b, v, block);
        }
        let v = self.plan_term_value(b, block)?;
        self.unify_local(a, v, block)
    }

    /// Unify a term against a value held in a local.
    fn unify_local(&mut self, t: &Term, source: Local, block: &mut Block) -> CompileResult<()> {
        match &t.value {
            Value::Var(v) => {
                if v.is_wildcard() {
                    return Ok(());
                }
                if let Some(&existing) = self.frame.vars.get(v) {
                    block.push(Stmt::EqualStmt {
                        a: Operand::Local(existing),
                        b: Operand::Local(source),
                    });
                } else {
                    let l = self.local_for_var(v);
                    block.push(Stmt::AssignVarStmt {
                        source: Operand::Local(source),
                        target: l,
                    });
                }
                Ok(())
            }
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    let idx = self.frame.alloc();
                    block.push(Stmt::MakeNumberIntStmt {
                        value: i as i64,
                        target: idx,
                    });
                    let elem = self.frame.alloc();
                    block.push(Stmt::DotStmt {
                        source: Operand::Local(source),
                        key: Operand::Local(idx),
                        target: elem,
                    });
                    self.unify_local(item, elem, block)?;
                }
                Ok(())
            }
            Value::Object(pairs) => {
                for (key, value) in pairs {
                    let key_op = self.plan_operand(key, block)?;
                    let elem = self.frame.alloc();
                    block.push(Stmt::DotStmt {
                        source: Operand::Local(source),
                        key: key_op,
                        target: elem,
                    });
                    self.unify_local(value, elem, block)?;
                }
                Ok(())
            }
            _ => {
                let other = self.plan_term_value(t, block)?;
                block.push(Stmt::EqualStmt {
                    a: Operand::Local(other),
                    b: Operand::Local(source),
                });
                Ok(())
            }
        }
    }

    fn is_unbound_var(&self, t: &Term) -> bool {
        matches!(&t.value, Value::Var(v) if !v.is_wildcard() && !self.frame.vars.contains_key(v))
    }

    /// Bind a function argument pattern to its parameter local: plain
    /// variables alias the local, composites destructure against it.
    fn bind_pattern_to_local(
        &mut self,
        t: &Term,
        local: Local,
        block: &mut Block,
    ) -> CompileResult<()> {
        match &t.value {
            Value::Var(v) if !v.is_wildcard() => {
                self.frame.vars.insert(v.clone(), local);
                Ok(())
            }
            Value::Var(_) => Ok(()),
            _ => self.unify_local(t, local, block),
        }
    }

    // ------------------------------------------------------------------
    // Terms
    // ------------------------------------------------------------------

    /// Plan a term to a value local. Iterating references must already be
    /// bound; unbound selector variables only occur at expression level,
    /// where `plan_ref_then` introduces the scan.
    fn plan_term_value(&mut self, t: &Term, block: &mut Block) -> CompileResult<Local> {
        match &t.value {
            Value::Null => {
                let target = self.frame.alloc();
                block.push(Stmt::MakeNullStmt { target });
                Ok(target)
            }
            Value::Bool(b) => {
                let target = self.frame.alloc();
                block.push(Stmt::AssignVarStmt {
                    source: Operand::Bool(*b),
                    target,
                });
                Ok(target)
            }
            Value::Number(n) => {
                let target = self.frame.alloc();
                if let Some(i) = n.as_i64() {
                    block.push(Stmt::MakeNumberIntStmt { value: i, target });
                } else {
                    let idx = self.intern(&n.to_string());
                    block.push(Stmt::MakeNumberRefStmt { index: idx, target });
                }
                Ok(target)
            }
            Value::String(s) => {
                let idx = self.intern(s);
                let target = self.frame.alloc();
                block.push(Stmt::AssignVarStmt {
                    source: Operand::StringIndex(idx),
                    target,
                });
                Ok(target)
            }
            Value::Var(v) => Ok(self.local_for_var(v)),
            Value::Ref(r) => {
                if r.len() == 1 {
                    match r.head().map(|h| &h.value) {
                        Some(Value::Var(v)) if v.as_str() == "input" => return Ok(INPUT),
                        Some(Value::Var(v)) if v.as_str() == "data" => return Ok(DATA),
                        Some(Value::Var(v)) => return Ok(self.local_for_var(v)),
                        _ => {}
                    }
                }
                self.plan_bound_ref(r, block)
            }
            Value::Array(items) => {
                let target = self.frame.alloc();
                block.push(Stmt::MakeArrayStmt {
                    capacity: items.len() as u32,
                    target,
                });
                for item in items {
                    let v = self.plan_term_value(item, block)?;
                    block.push(Stmt::ArrayAppendStmt {
                        array: target,
                        value: Operand::Local(v),
                    });
                }
                Ok(target)
            }
            Value::Set(items) => {
                let target = self.frame.alloc();
                block.push(Stmt::MakeSetStmt { target });
                for item in items {
                    let v = self.plan_term_value(item, block)?;
                    block.push(Stmt::SetAddStmt {
                        set: target,
                        value: Operand::Local(v),
                    });
                }
                Ok(target)
            }
            Value::Object(pairs) => {
                let target = self.frame.alloc();
                block.push(Stmt::MakeObjectStmt { target });
                for (key, value) in pairs {
                    let key_op = self.plan_operand(key, block)?;
                    let v = self.plan_term_value(value, block)?;
                    block.push(Stmt::ObjectInsertStmt {
                        object: target,
                        key: key_op,
                        value: Operand::Local(v),
                    });
                }
                Ok(target)
            }
            Value::Call(_) => {
                // Nested calls were flattened by the compiler.
                let mut errs = Errors::new();
                errs.push(Error::new(
                    ErrorCode::CompileErr,
                    Some(t.location.clone()),
                    "unexpected call term in planner input",
                ));
                Err(errs)
            }
            Value::ArrayComprehension { term, body } => {
                let target = self.frame.alloc();
                block.push(Stmt::MakeArrayStmt {
                    capacity: 0,
                    target,
                });
                let term = term.as_ref().clone();
                let mut inner = Block::new();
                self.plan_body_then(&body.0.clone(), &mut inner, &mut |p, b| {
                    let v = p.plan_term_value(&term, b)?;
                    b.push(Stmt::ArrayAppendStmt {
                        array: target,
                        value: Operand::Local(v),
                    });
                    Ok(())
                })?;
                block.push(Stmt::BlockStmt {
                    blocks: vec![inner],
                });
                Ok(target)
            }
            Value::SetComprehension { term, body } => {
                let target = self.frame.alloc();
                block.push(Stmt::MakeSetStmt { target });
                let term = term.as_ref().clone();
                let mut inner = Block::new();
                self.plan_body_then(&body.0.clone(), &mut inner, &mut |p, b| {
                    let v = p.plan_term_value(&term, b)?;
                    b.push(Stmt::SetAddStmt {
                        set: target,
                        value: Operand::Local(v),
                    });
                    Ok(())
                })?;
                block.push(Stmt::BlockStmt {
                    blocks: vec![inner],
                });
                Ok(target)
            }
            Value::ObjectComprehension { key, value, body } => {
                let target = self.frame.alloc();
                block.push(Stmt::MakeObjectStmt { target });
                let key = key.as_ref().clone();
                let value = value.as_ref().clone();
                let mut inner = Block::new();
                self.plan_body_then(&body.0.clone(), &mut inner, &mut |p, b| {
                    let kv = p.plan_term_value(&key, b)?;
                    let vv = p.plan_term_value(&value, b)?;
                    b.push(Stmt::ObjectInsertOnceStmt {
                        object: target,
                        key: Operand::Local(kv),
                        value: Operand::Local(vv),
                    });
                    Ok(())
                })?;
                block.push(Stmt::BlockStmt {
                    blocks: vec![inner],
                });
                Ok(target)
            }
        }
    }

    /// Plan a reference whose selector variables may be unbound; unbound
    /// selectors become scans with the continuation nested inside. `on_value`
    /// runs with the resolved value local, then `k` continues the body.
    fn plan_ref_then(
        &mut self,
        r: &Ref,
        block: &mut Block,
        on_value: &mut dyn FnMut(&mut Self, &mut Block, Local) -> CompileResult<()>,
        k: &mut dyn FnMut(&mut Self, &mut Block) -> CompileResult<()>,
    ) -> CompileResult<()> {
        let has_unbound = r.iter().skip(1).any(|s| self.is_unbound_var(s));
        if !has_unbound {
            let local = self.plan_term_value(&Term::ref_term(r.clone()), block)?;
            on_value(self, block, local)?;
            return k(self, block);
        }

        // Split at the first unbound selector.
        let mut split = 1;
        for (i, s) in r.iter().enumerate().skip(1) {
            if self.is_unbound_var(s) {
                split = i;
                break;
            }
        }
        let prefix = r.truncate(split);
        let base = self.plan_term_value(&Term::ref_term(prefix), block)?;

        let Some(Value::Var(key_var)) = r.get(split).map(|t| &t.value) else {
            let mut errs = Errors::new();
            errs.push(Error::new(
                ErrorCode::CompileErr,
                None,
                format!("cannot plan reference {r}"),
            ));
            return Err(errs);
        };
        let key_local = self.local_for_var(key_var);
        let value_local = self.frame.alloc();

        let rest = Ref::new(
            std::iter::once(Term::var("__scan__"))
                .chain(r.terms()[split + 1..].iter().cloned())
                .collect(),
        );

        let mut scan_block = Block::new();
        if rest.len() > 1 {
            // Continue resolving the remaining selectors inside the scan.
            let mut remaining_terms = rest.terms().to_vec();
            remaining_terms[0] = Term::var("__scan_value__");
            let scan_value_var = Var::new("__scan_value__");
            self.frame.vars.insert(scan_value_var, value_local);
            let remaining = Ref::new(remaining_terms);
            self.plan_ref_then(&remaining, &mut scan_block, &mut *on_value, &mut *k)?;
        } else {
            on_value(self, &mut scan_block, value_local)?;
            k(self, &mut scan_block)?;
        }

        block.push(Stmt::ScanStmt {
            source: base,
            key: key_local,
            value: value_local,
            block: scan_block,
        });
        Ok(())
    }

    /// Plan a ground-selector reference to a value local via rule dispatch
    /// and `Dot` navigation.
    fn plan_bound_ref(&mut self, r: &Ref, block: &mut Block) -> CompileResult<Local> {
        match r.head().map(|h| &h.value) {
            Some(Value::Var(v)) if v.as_str() == "data" => self.plan_ref_value(r, block),
            Some(Value::Var(v)) if v.as_str() == "input" => {
                let mut local = INPUT;
                for selector in r.iter().skip(1) {
                    let key = self.plan_operand(selector, block)?;
                    let target = self.frame.alloc();
                    block.push(Stmt::DotStmt {
                        source: Operand::Local(local),
                        key,
                        target,
                    });
                    local = target;
                }
                Ok(local)
            }
            Some(Value::Var(v)) => {
                let mut local = self.local_for_var(v);
                for selector in r.iter().skip(1) {
                    let key = self.plan_operand(selector, block)?;
                    let target = self.frame.alloc();
                    block.push(Stmt::DotStmt {
                        source: Operand::Local(local),
                        key,
                        target,
                    });
                    local = target;
                }
                Ok(local)
            }
            _ => {
                let mut errs = Errors::new();
                errs.push(Error::new(
                    ErrorCode::CompileErr,
                    None,
                    format!("cannot plan reference {r}"),
                ));
                Err(errs)
            }
        }
    }

    /// Plan a term as an instruction operand, preferring inline operands
    /// for strings and booleans.
    fn plan_operand(&mut self, t: &Term, block: &mut Block) -> CompileResult<Operand> {
        match &t.value {
            Value::String(s) => Ok(Operand::StringIndex(self.intern(s))),
            Value::Bool(b) => Ok(Operand::Bool(*b)),
            _ => {
                let l = self.plan_term_value(t, block)?;
                Ok(Operand::Local(l))
            }
        }
    }

    fn local_for_var(&mut self, v: &Var) -> Local {
        if let Some(&l) = self.frame.vars.get(v) {
            return l;
        }
        let l = self.frame.alloc();
        self.frame.vars.insert(v.clone(), l);
        l
    }

    fn local_for_term(&mut self, t: &Term) -> Local {
        match &t.value {
            Value::Var(v) if !v.is_wildcard() => self.local_for_var(v),
            _ => self.frame.alloc(),
        }
    }

    fn record_builtin(&mut self, name: &str) {
        if let Some(b) = builtins::get(name) {
            self.builtin_decls
                .entry(name.to_string())
                .or_insert_with(|| BuiltinFuncDecl {
                    name: name.to_string(),
                    decl: b.decl.clone(),
                });
        }
    }
}

fn func_path(name: &str) -> Vec<String> {
    name.split('.').map(ToString::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::builders::{eq_expr, ModuleBuilder, RuleBuilder};
    use crate::ast::ModuleSet;
    use crate::compiler::{Compiler, EvalMode};

    fn compile(modules: Vec<(&str, crate::ast::Module)>) -> Compiler {
        let mut set = ModuleSet::new();
        for (k, m) in modules {
            set.insert(k.to_string(), m);
        }
        let mut c = Compiler::new().with_eval_mode(EvalMode::IR);
        c.compile(&set).unwrap();
        c
    }

    #[test]
    fn test_plan_simple_entrypoint() {
        let module = ModuleBuilder::new(&["a"])
            .rule(
                RuleBuilder::new("p")
                    .value(Term::boolean(true))
                    .body(eq_expr(
                        Term::ref_term(Ref::dotted(&["input", "x"])),
                        Term::int(1),
                    ))
                    .build(),
            )
            .build();
        let c = compile(vec![("m.rego", module)]);
        let policy = plan(&c, &["a/p"]).unwrap();

        assert_eq!(policy.plans.len(), 1);
        assert_eq!(policy.plans[0].name, "a/p");
        assert_eq!(policy.funcs.len(), 1);
        assert_eq!(policy.funcs[0].name, "g0.data.a.p");

        // The plan calls the rule function and adds a result.
        let stmts = &policy.plans[0].blocks[0].stmts;
        assert!(stmts.iter().any(|s| matches!(s, Stmt::CallStmt { func, .. } if func == "g0.data.a.p")));
        assert!(stmts.iter().any(|s| matches!(s, Stmt::ResultSetAddStmt { .. })));
    }

    #[test]
    fn test_plan_interns_strings() {
        let module = ModuleBuilder::new(&["a"])
            .rule(
                RuleBuilder::new("p")
                    .value(Term::string("allow"))
                    .build(),
            )
            .build();
        let c = compile(vec![("m.rego", module)]);
        let policy = plan(&c, &["a/p"]).unwrap();
        assert!(policy
            .static_data
            .strings
            .iter()
            .any(|s| s.value == "allow"));
    }

    #[test]
    fn test_plan_dependent_rules_compiled_together() {
        let module = ModuleBuilder::new(&["a"])
            .rule(RuleBuilder::new("q").value(Term::int(7)).build())
            .rule(
                RuleBuilder::new("p")
                    .value(Term::boolean(true))
                    .body(eq_expr(
                        Term::var("x"),
                        Term::ref_term(Ref::dotted(&["data", "a", "q"])),
                    ))
                    .build(),
            )
            .build();
        let c = compile(vec![("m.rego", module)]);
        let policy = plan(&c, &["a/p"]).unwrap();
        let names: Vec<&str> = policy.funcs.iter().map(|f| f.name.as_str()).collect();
        assert!(names.contains(&"g0.data.a.p"));
        assert!(names.contains(&"g0.data.a.q"));
    }

    #[test]
    fn test_plan_multi_value_rule() {
        let module = ModuleBuilder::new(&["a"])
            .rule(
                RuleBuilder::new("p")
                    .key(Term::var("x"))
                    .body(eq_expr(Term::var("x"), Term::string("k")))
                    .build(),
            )
            .build();
        let c = compile(vec![("m.rego", module)]);
        let policy = plan(&c, &["a/p"]).unwrap();
        let func = &policy.funcs[0];
        let has_make_set = func
            .blocks
            .iter()
            .flat_map(|b| &b.stmts)
            .any(|s| matches!(s, Stmt::MakeSetStmt { .. }));
        assert!(has_make_set);
    }

    #[test]
    fn test_plan_builtin_recorded() {
        let module = ModuleBuilder::new(&["a"])
            .rule(
                RuleBuilder::new("p")
                    .value(Term::boolean(true))
                    .body({
                        let mut e = crate::ast::builders::call_expr(
                            "gt",
                            vec![
                                Term::ref_term(Ref::dotted(&["input", "x"])),
                                Term::int(1),
                            ],
                        );
                        e.generated = false;
                        e
                    })
                    .build(),
            )
            .build();
        let c = compile(vec![("m.rego", module)]);
        let policy = plan(&c, &["a/p"]).unwrap();
        assert!(policy
            .static_data
            .builtin_funcs
            .iter()
            .any(|b| b.name == "gt"));
    }

    #[test]
    fn test_plan_unknown_entrypoint_fails() {
        let module = ModuleBuilder::new(&["a"])
            .rule(RuleBuilder::new("p").value(Term::int(1)).build())
            .build();
        let c = compile(vec![("m.rego", module)]);
        assert!(plan(&c, &["a/missing"]).is_err());
    }

    #[test]
    fn test_plan_iteration_becomes_scan() {
        // p { data.users[i] = u; u = "admin" } — hoisted by rewrites into a
        // scan over data.users.
        let module = ModuleBuilder::new(&["a"])
            .rule(
                RuleBuilder::new("p")
                    .value(Term::boolean(true))
                    .body(Expr::term(Term::ref_term(
                        Ref::dotted(&["data", "users"]).append(Term::var("i")),
                    )))
                    .build(),
            )
            .build();
        let c = compile(vec![("m.rego", module)]);
        let policy = plan(&c, &["a/p"]).unwrap();

        fn contains_scan(blocks: &[Block]) -> bool {
            blocks.iter().flat_map(|b| &b.stmts).any(|s| match s {
                Stmt::ScanStmt { .. } => true,
                Stmt::BlockStmt { blocks } => contains_scan(blocks),
                Stmt::NotStmt { block } => contains_scan(std::slice::from_ref(block)),
                _ => false,
            })
        }
        assert!(contains_scan(&policy.funcs[0].blocks));
    }

    #[test]
    fn test_plan_name_normalization() {
        assert_eq!(plan_name("a/b"), "a/b");
        assert_eq!(plan_name("data.a.b"), "a/b");
        assert_eq!(plan_name("a.b"), "a/b");
    }

    #[test]
    fn test_with_rejected_by_planner() {
        let module = ModuleBuilder::new(&["a"])
            .rule(
                RuleBuilder::new("p")
                    .value(Term::boolean(true))
                    .body({
                        let mut e = eq_expr(
                            Term::ref_term(Ref::dotted(&["input", "x"])),
                            Term::int(1),
                        );
                        e.with.push(crate::ast::With::new(
                            Term::ref_term(Ref::dotted(&["input", "x"])),
                            Term::int(1),
                        ));
                        e
                    })
                    .build(),
            )
            .build();
        let c = compile(vec![("m.rego", module)]);
        let errs = plan(&c, &["a/p"]).unwrap_err();
        assert!(errs.to_string().contains("not supported by the planner"));
    }
}
