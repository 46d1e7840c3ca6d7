//! # Regolith Policy Compiler
//!
//! A compiler front-end and IR planner for a declarative, datalog-style
//! policy language. Parsed modules go through a staged pipeline that
//! resolves references, rewrites local variables and expressions, checks
//! conflicts, safety and types, and builds the evaluator's lookup indices;
//! the planner then lowers entrypoints into an imperative query plan, and
//! the partial-evaluation optimizer specializes bundles against known data.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Parsed Modules
//!     ↓
//! [Compiler]            → checked, rewritten AST
//!     ├── RuleTree / ModuleTree / Graph
//!     ├── TypeEnv (schema-aware)
//!     ├── RuleIndex / ComprehensionIndex
//!     └── RequiredCapabilities
//!     ↓
//! [Planner]             → Policy IR {static, plans, funcs}
//!     ↓
//! [Partial Optimizer]   → residual bundle (via external evaluator)
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use regolith::ast::builders::{eq_expr, ModuleBuilder, RuleBuilder};
//! use regolith::ast::{ModuleSet, Ref, Term};
//! use regolith::Compiler;
//!
//! // package example
//! // allow { input.user = "admin" }
//! let module = ModuleBuilder::new(&["example"])
//!     .rule(
//!         RuleBuilder::new("allow")
//!             .value(Term::boolean(true))
//!             .body(eq_expr(
//!                 Term::ref_term(Ref::dotted(&["input", "user"])),
//!                 Term::string("admin"),
//!             ))
//!             .build(),
//!     )
//!     .build();
//!
//! let mut modules = ModuleSet::new();
//! modules.insert("example.rego".to_string(), module);
//!
//! let mut compiler = Compiler::new();
//! compiler.compile(&modules).expect("compilation succeeds");
//! assert!(compiler.is_compiled());
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `ast` | AST types, visitors, builders |
//! | `compiler` | Staged compilation pipeline |
//! | `safety` | Body reordering and unsafe-variable analysis |
//! | `types` | Structural type lattice, checker, JSON-schema loader |
//! | `rule_index` | Discrimination trees over rule heads |
//! | `comprehension_index` | Per-key comprehension caching analysis |
//! | `ir` | Query-plan IR types (stable JSON surface) |
//! | `planner` | AST → IR lowering |
//! | `bundle` / `partial` | Bundle model and partial-eval optimizer |

// AST and IR
pub mod ast;
pub mod ir;

// Compilation pipeline
pub mod compiler;
pub mod safety;
pub mod types;

// Symbol tables and dependency graph
pub mod graph;
pub mod module_tree;
pub mod rule_tree;

// Evaluator support artifacts
pub mod comprehension_index;
pub mod rule_index;

// Planning and bundle optimization
pub mod bundle;
pub mod partial;
pub mod planner;

// Declarations and metadata
pub mod annotations;
pub mod builtins;
pub mod capabilities;

// Shared leaf types
pub mod errors;
pub mod location;
pub mod metrics;
pub mod number;

// Re-export the types most callers need
pub use annotations::{AnnotationSet, Annotations};
pub use bundle::{Bundle, Manifest, ModuleFile, WasmResolver};
pub use capabilities::{Capabilities, RequiredCapabilities};
pub use compiler::{Compiler, CompilerConfig, EvalMode, QueryCompiler};
pub use comprehension_index::ComprehensionIndex;
pub use errors::{CompileResult, Error, ErrorCode, Errors};
pub use graph::Graph;
pub use ir::Policy;
pub use location::Location;
pub use metrics::CompilerMetrics;
pub use module_tree::ModuleTree;
pub use number::Number;
pub use partial::{BundleOptimizer, DataStore, PartialEvaluator, PartialResult, Store};
pub use planner::plan;
pub use rule_index::RuleIndex;
pub use rule_tree::RuleTree;
pub use types::{SchemaSet, Type, TypeEnv};
