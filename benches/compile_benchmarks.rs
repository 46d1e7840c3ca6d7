//! Compilation benchmarks: pipeline throughput over synthetic module sets.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use regolith::ast::builders::{eq_expr, ModuleBuilder, RuleBuilder};
use regolith::ast::{Expr, ModuleSet, Ref, Term};
use regolith::Compiler;

/// A module with a linear chain of dependent rules:
/// `r0 = input.x`, `ri { r(i-1) }`.
fn chain_modules(rules: usize) -> ModuleSet {
    let mut builder = ModuleBuilder::new(&["bench"]).rule(
        RuleBuilder::new("r0")
            .value(Term::boolean(true))
            .body(eq_expr(
                Term::ref_term(Ref::dotted(&["input", "x"])),
                Term::int(1),
            ))
            .build(),
    );
    for i in 1..rules {
        builder = builder.rule(
            RuleBuilder::new(&format!("r{i}"))
                .value(Term::boolean(true))
                .body(Expr::term(Term::var(format!("r{}", i - 1))))
                .build(),
        );
    }
    let mut modules = ModuleSet::new();
    modules.insert("bench.rego".to_string(), builder.build());
    modules
}

fn bench_compile_chain(c: &mut Criterion) {
    for size in [10usize, 100] {
        let modules = chain_modules(size);
        c.bench_function(&format!("compile_chain_{size}"), |b| {
            b.iter(|| {
                let mut compiler = Compiler::new();
                compiler.compile(black_box(&modules)).unwrap();
                black_box(compiler.rule_tree().size())
            })
        });
    }
}

fn bench_plan_chain(c: &mut Criterion) {
    let modules = chain_modules(50);
    let mut compiler = Compiler::new().with_eval_mode(regolith::EvalMode::IR);
    compiler.compile(&modules).unwrap();
    c.bench_function("plan_chain_50", |b| {
        b.iter(|| {
            let policy = regolith::plan(black_box(&compiler), &["bench/r49"]).unwrap();
            black_box(policy.funcs.len())
        })
    });
}

criterion_group!(benches, bench_compile_chain, bench_plan_chain);
criterion_main!(benches);
