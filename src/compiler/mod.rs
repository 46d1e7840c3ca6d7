//! # Compiler Pipeline
//!
//! The ordered list of passes that turns parsed modules into a checked,
//! rewritten AST plus the derived artifacts the evaluator and planner
//! consume (rule tree, dependency graph, type environment, indices,
//! required capabilities).
//!
//! ```text
//! Parsed Modules
//!     ↓
//! [ResolveRefs .. RemoveImports]     → fully qualified refs
//!     ↓
//! [SetModuleTree / SetRuleTree]      → symbol tables
//!     ↓
//! [RewriteLocalVars .. RewriteWithValues] → normalized bodies
//!     ↓
//! [CheckRuleConflicts .. CheckSafetyRuleBodies] → checked + reordered
//!     ↓
//! [RewriteEquals .. CheckTypes]      → evaluator-ready AST + TypeEnv
//!     ↓
//! [BuildRuleIndices / BuildComprehensionIndices / BuildRequiredCapabilities]
//! ```
//!
//! Each stage has a name and a metric tag; failure in one stage
//! short-circuits the rest, and errors accumulate up to the configured
//! limit, at which point a sentinel marker terminates compilation.

use crate::annotations::{self, AnnotationSet};
use crate::ast::visitor::{self, VarVisitor, VarVisitorParams};
use crate::ast::{
    ref_operator_name, Body, Expr, ExprTerms, Import, Module, ModuleSet, Ref, RegoVersion, Rule,
    RuleId, RuleKind, Term, Value, Var, FUTURE_KEYWORDS,
};
use crate::builtins;
use crate::capabilities::{
    Capabilities, RequiredCapabilities, FEATURE_REGO_V1, FEATURE_REGO_V1_IMPORT,
    FEATURE_RULE_HEAD_REFS, FEATURE_RULE_HEAD_REF_STRING_PREFIXES,
};
use crate::comprehension_index::{self, ComprehensionIndex};
use crate::errors::{CompileResult, Error, ErrorCode, Errors};
use crate::graph::Graph;
use crate::metrics::CompilerMetrics;
use crate::module_tree::ModuleTree;
use crate::rule_index::RuleIndex;
use crate::rule_tree::RuleTree;
use crate::safety;
use crate::types::{self, SchemaSet, Type, TypeEnv};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

pub mod rewrites;

use rewrites::{LocalVarGenerator, TEST_RULE_PREFIX};

/// Target of a compilation: the top-down evaluator or the IR planner.
/// IR mode skips the evaluator-only index passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvalMode {
    #[default]
    Topdown,
    IR,
}

/// Compiler configuration.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Errors tolerated before compilation halts with a limit marker
    pub max_errors: usize,
    /// Strict mode: unused imports/assignments and deprecated built-ins
    /// become errors
    pub strict: bool,
    /// Keep a copy of the unmodified input modules
    pub keep_modules: bool,
    pub capabilities: Capabilities,
    pub schemas: SchemaSet,
    pub default_rego_version: RegoVersion,
    /// When false, `print` calls are erased
    pub enable_print: bool,
    /// Roots for which the `path_exists` callback is consulted
    pub path_conflict_roots: BTreeSet<String>,
    /// Apply schema annotations during type checking
    pub use_type_check_annotations: bool,
    /// Tolerate calls to unknown functions (used by partial evaluation)
    pub allow_undefined_func_calls: bool,
    pub eval_mode: EvalMode,
    /// Rewrite `test_` rule equalities for tracing
    pub rewrite_test_rules: bool,
    /// Caller-supplied blocklist of built-ins
    pub unsafe_builtins: BTreeSet<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            max_errors: 10,
            strict: false,
            keep_modules: false,
            capabilities: Capabilities::default(),
            schemas: SchemaSet::new(),
            default_rego_version: RegoVersion::default(),
            enable_print: false,
            path_conflict_roots: BTreeSet::new(),
            use_type_check_annotations: false,
            allow_undefined_func_calls: false,
            eval_mode: EvalMode::Topdown,
            rewrite_test_rules: false,
            unsafe_builtins: BTreeSet::new(),
        }
    }
}

type ModuleLoaderFn = Box<dyn FnMut(&ModuleSet) -> anyhow::Result<ModuleSet>>;
type PathExistsFn = Box<dyn Fn(&[String]) -> anyhow::Result<bool>>;
type StageHook = Box<dyn Fn(&mut Compiler) -> Result<(), Error>>;
type DebugSink = Box<dyn FnMut(&str)>;
type MetricsSink = Box<dyn FnMut(&CompilerMetrics)>;

/// One pipeline stage.
struct Stage {
    name: &'static str,
    metric: &'static str,
    run: fn(&mut Compiler),
}

fn stages() -> Vec<Stage> {
    vec![
        Stage { name: "ResolveRefs", metric: "compile_stage_resolve_refs", run: Compiler::resolve_refs },
        Stage { name: "InitLocalVarGen", metric: "compile_stage_init_local_var_gen", run: Compiler::init_local_var_gen },
        Stage { name: "RewriteRuleHeadRefs", metric: "compile_stage_rewrite_rule_head_refs", run: Compiler::rewrite_rule_head_refs },
        Stage { name: "CheckKeywordOverrides", metric: "compile_stage_check_keyword_overrides", run: Compiler::check_keyword_overrides },
        Stage { name: "CheckDuplicateImports", metric: "compile_stage_check_duplicate_imports", run: Compiler::check_duplicate_imports },
        Stage { name: "RemoveImports", metric: "compile_stage_remove_imports", run: Compiler::remove_imports },
        Stage { name: "SetModuleTree", metric: "compile_stage_set_module_tree", run: Compiler::set_module_tree },
        Stage { name: "SetRuleTree", metric: "compile_stage_set_rule_tree", run: Compiler::set_rule_tree },
        Stage { name: "RewriteLocalVars", metric: "compile_stage_rewrite_local_vars", run: Compiler::rewrite_local_vars },
        Stage { name: "CheckVoidCalls", metric: "compile_stage_check_void_calls", run: Compiler::check_void_calls },
        Stage { name: "RewritePrintCalls", metric: "compile_stage_rewrite_print_calls", run: Compiler::rewrite_print_calls },
        Stage { name: "RewriteExprTerms", metric: "compile_stage_rewrite_expr_terms", run: Compiler::rewrite_expr_terms },
        Stage { name: "ParseMetadataBlocks", metric: "compile_stage_parse_metadata_blocks", run: Compiler::parse_metadata_blocks },
        Stage { name: "SetAnnotationSet", metric: "compile_stage_set_annotation_set", run: Compiler::set_annotation_set },
        Stage { name: "RewriteRegoMetadataCalls", metric: "compile_stage_rewrite_rego_metadata_calls", run: Compiler::rewrite_rego_metadata_calls },
        Stage { name: "SetGraph", metric: "compile_stage_set_graph", run: Compiler::set_graph },
        Stage { name: "RewriteComprehensionTerms", metric: "compile_stage_rewrite_comprehension_terms", run: Compiler::rewrite_comprehension_terms },
        Stage { name: "RewriteRefsInHead", metric: "compile_stage_rewrite_refs_in_head", run: Compiler::rewrite_refs_in_head },
        Stage { name: "RewriteWithValues", metric: "compile_stage_rewrite_with_values", run: Compiler::rewrite_with_values },
        Stage { name: "CheckRuleConflicts", metric: "compile_stage_check_rule_conflicts", run: Compiler::check_rule_conflicts },
        Stage { name: "CheckUndefinedFuncs", metric: "compile_stage_check_undefined_funcs", run: Compiler::check_undefined_funcs },
        Stage { name: "CheckSafetyRuleHeads", metric: "compile_stage_check_safety_rule_heads", run: Compiler::check_safety_rule_heads },
        Stage { name: "CheckSafetyRuleBodies", metric: "compile_stage_check_safety_rule_bodies", run: Compiler::check_safety_rule_bodies },
        Stage { name: "RewriteEquals", metric: "compile_stage_rewrite_equals", run: Compiler::rewrite_equals },
        Stage { name: "RewriteDynamicTerms", metric: "compile_stage_rewrite_dynamic_terms", run: Compiler::rewrite_dynamic_terms },
        Stage { name: "RewriteTestRulesForTracing", metric: "compile_stage_rewrite_test_rules", run: Compiler::rewrite_test_rules },
        Stage { name: "CheckRecursion", metric: "compile_stage_check_recursion", run: Compiler::check_recursion },
        Stage { name: "CheckTypes", metric: "compile_stage_check_types", run: Compiler::check_types },
        Stage { name: "CheckUnsafeBuiltins", metric: "compile_stage_check_unsafe_builtins", run: Compiler::check_unsafe_builtins },
        Stage { name: "CheckDeprecatedBuiltins", metric: "compile_stage_check_deprecated_builtins", run: Compiler::check_deprecated_builtins },
        Stage { name: "BuildRuleIndices", metric: "compile_stage_build_rule_indices", run: Compiler::build_rule_indices },
        Stage { name: "BuildComprehensionIndices", metric: "compile_stage_build_comprehension_indices", run: Compiler::build_comprehension_indices },
        Stage { name: "BuildRequiredCapabilities", metric: "compile_stage_build_required_capabilities", run: Compiler::build_required_capabilities },
    ]
}

/// The compiler. Owns the module set after `compile` and every derived
/// artifact; artifacts are valid until the next `compile` call. Not
/// re-entrant: one compilation runs start to finish.
pub struct Compiler {
    config: CompilerConfig,
    module_loader: Option<ModuleLoaderFn>,
    path_exists: Option<PathExistsFn>,
    debug_sink: Option<DebugSink>,
    metrics_sink: Option<MetricsSink>,
    after_hooks: Vec<(String, StageHook)>,

    modules: ModuleSet,
    module_keys: Vec<String>,
    input_modules: Option<ModuleSet>,

    errors: Errors,
    metrics: CompilerMetrics,
    local_var_gen: Option<LocalVarGenerator>,
    rewritten_vars: BTreeMap<Var, Var>,
    stashed_imports: BTreeMap<String, Vec<Import>>,
    module_tree: ModuleTree,
    rule_tree: RuleTree,
    graph: Graph,
    /// Arities of function rules, keyed by dotted rule path
    function_arities: BTreeMap<String, usize>,
    annotation_set: AnnotationSet,
    type_env: TypeEnv,
    rule_indices: BTreeMap<String, RuleIndex>,
    comprehension_indices: BTreeMap<(RuleId, usize), ComprehensionIndex>,
    required: RequiredCapabilities,
    compiled: bool,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler").finish_non_exhaustive()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Compiler {
            config: CompilerConfig::default(),
            module_loader: None,
            path_exists: None,
            debug_sink: None,
            metrics_sink: None,
            after_hooks: Vec::new(),
            modules: ModuleSet::new(),
            module_keys: Vec::new(),
            input_modules: None,
            errors: Errors::new(),
            metrics: CompilerMetrics::new(),
            local_var_gen: None,
            rewritten_vars: BTreeMap::new(),
            stashed_imports: BTreeMap::new(),
            module_tree: ModuleTree::default(),
            rule_tree: RuleTree::default(),
            graph: Graph::new(),
            function_arities: BTreeMap::new(),
            annotation_set: AnnotationSet::new(),
            type_env: TypeEnv::new(),
            rule_indices: BTreeMap::new(),
            comprehension_indices: BTreeMap::new(),
            required: RequiredCapabilities::default(),
            compiled: false,
        }
    }

    pub fn with_config(mut self, config: CompilerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.config.strict = strict;
        self
    }

    pub fn with_max_errors(mut self, max_errors: usize) -> Self {
        self.config.max_errors = max_errors;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.config.capabilities = capabilities;
        self
    }

    pub fn with_schemas(mut self, schemas: SchemaSet) -> Self {
        self.config.schemas = schemas;
        self
    }

    pub fn with_eval_mode(mut self, mode: EvalMode) -> Self {
        self.config.eval_mode = mode;
        self
    }

    pub fn with_enable_print(mut self, enable: bool) -> Self {
        self.config.enable_print = enable;
        self
    }

    pub fn with_module_loader(mut self, loader: ModuleLoaderFn) -> Self {
        self.module_loader = Some(loader);
        self
    }

    pub fn with_path_exists(mut self, f: PathExistsFn, roots: BTreeSet<String>) -> Self {
        self.path_exists = Some(f);
        self.config.path_conflict_roots = roots;
        self
    }

    pub fn with_debug_sink(mut self, sink: DebugSink) -> Self {
        self.debug_sink = Some(sink);
        self
    }

    pub fn with_metrics_sink(mut self, sink: MetricsSink) -> Self {
        self.metrics_sink = Some(sink);
        self
    }

    pub fn with_unsafe_builtins(mut self, names: BTreeSet<String>) -> Self {
        self.config.unsafe_builtins = names;
        self
    }

    /// Register a hook to run immediately after the named stage. Hooks run
    /// in registration order; a hook failure is a stage failure.
    pub fn with_stage_after(mut self, stage: &str, hook: StageHook) -> Self {
        self.after_hooks.push((stage.to_string(), hook));
        self
    }

    // ------------------------------------------------------------------
    // Driver
    // ------------------------------------------------------------------

    /// Compile a module set. The input is deep-copied; the compiler owns
    /// its copy and all derived artifacts afterwards.
    pub fn compile(&mut self, modules: &ModuleSet) -> CompileResult<()> {
        self.reset();
        self.modules = modules.clone();
        if self.config.keep_modules {
            self.input_modules = Some(modules.clone());
        }
        self.module_keys = self.modules.keys().cloned().collect();

        let hooks = std::mem::take(&mut self.after_hooks);
        for stage in stages() {
            let start = Instant::now();
            (stage.run)(self);
            self.metrics.add_timer(stage.metric, start.elapsed());
            tracing::debug!(
                stage = stage.name,
                errors = self.errors.len(),
                "compile_stage_done"
            );
            self.debug(stage.name);

            if self.errors.len() >= self.config.max_errors {
                self.errors.push(Error::limit_reached());
                break;
            }
            if !self.errors.is_empty() {
                break;
            }

            let mut hook_failed = false;
            for (name, hook) in &hooks {
                if name == stage.name {
                    if let Err(e) = hook(self) {
                        self.errors.push(e);
                        hook_failed = true;
                    }
                }
            }
            if hook_failed {
                break;
            }
        }
        self.after_hooks = hooks;

        if let Some(sink) = &mut self.metrics_sink {
            sink(&self.metrics);
        }

        self.compiled = self.errors.is_empty();
        if self.compiled {
            Ok(())
        } else {
            Err(self.errors.clone())
        }
    }

    fn reset(&mut self) {
        self.modules = ModuleSet::new();
        self.module_keys = Vec::new();
        self.input_modules = None;
        self.errors = Errors::new();
        self.metrics.clear();
        self.local_var_gen = None;
        self.rewritten_vars = BTreeMap::new();
        self.stashed_imports = BTreeMap::new();
        self.module_tree = ModuleTree::default();
        self.rule_tree = RuleTree::default();
        self.graph = Graph::new();
        self.function_arities = BTreeMap::new();
        self.annotation_set = AnnotationSet::new();
        self.type_env = TypeEnv::new();
        self.rule_indices = BTreeMap::new();
        self.comprehension_indices = BTreeMap::new();
        self.required = RequiredCapabilities::default();
        self.compiled = false;
    }

    fn debug(&mut self, message: &str) {
        if let Some(sink) = &mut self.debug_sink {
            sink(message);
        }
    }

    fn at_error_limit(&self) -> bool {
        self.errors.len() >= self.config.max_errors
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Whether the last compilation succeeded.
    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    pub fn errors(&self) -> &Errors {
        &self.errors
    }

    pub fn metrics(&self) -> &CompilerMetrics {
        &self.metrics
    }

    /// The compiled modules, keyed by file name.
    pub fn modules(&self) -> &ModuleSet {
        &self.modules
    }

    /// The unmodified input modules, when `keep_modules` was set.
    pub fn input_modules(&self) -> Option<&ModuleSet> {
        self.input_modules.as_ref()
    }

    pub fn module_keys(&self) -> &[String] {
        &self.module_keys
    }

    pub fn module_by_index(&self, idx: usize) -> Option<&Module> {
        self.module_keys.get(idx).and_then(|k| self.modules.get(k))
    }

    pub fn rule(&self, id: RuleId) -> Option<&Rule> {
        self.module_by_index(id.module)?.rules.get(id.rule)
    }

    pub fn module_tree(&self) -> &ModuleTree {
        &self.module_tree
    }

    pub fn rule_tree(&self) -> &RuleTree {
        &self.rule_tree
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn type_env(&self) -> &TypeEnv {
        &self.type_env
    }

    /// Generated-name to user-name mapping produced by local rewriting.
    pub fn rewritten_vars(&self) -> &BTreeMap<Var, Var> {
        &self.rewritten_vars
    }

    /// Imports removed from modules, kept for capability reporting.
    pub fn stashed_imports(&self) -> &BTreeMap<String, Vec<Import>> {
        &self.stashed_imports
    }

    pub fn rule_index(&self, path: &str) -> Option<&RuleIndex> {
        self.rule_indices.get(path)
    }

    pub fn comprehension_index(&self, rule: RuleId, expr: usize) -> Option<&ComprehensionIndex> {
        self.comprehension_indices.get(&(rule, expr))
    }

    pub fn comprehension_indices(&self) -> &BTreeMap<(RuleId, usize), ComprehensionIndex> {
        &self.comprehension_indices
    }

    pub fn required_capabilities(&self) -> &RequiredCapabilities {
        &self.required
    }

    /// Declared arity for a call operator: built-in or function rule.
    pub fn operator_arity(&self, name: &str) -> Option<usize> {
        if let Some(b) = builtins::get(name) {
            return Some(b.arity());
        }
        self.function_arities.get(name).copied()
    }

    /// Resolve an entrypoint string (`a/b` or `data.a.b`) to a rule path.
    pub fn resolve_entrypoint(&self, entrypoint: &str) -> CompileResult<Ref> {
        let dotted = entrypoint.replace('/', ".");
        let mut parts: Vec<&str> = dotted.split('.').filter(|p| !p.is_empty()).collect();
        if parts.first() != Some(&"data") {
            parts.insert(0, "data");
        }
        if parts.len() < 2 {
            let mut errs = Errors::new();
            errs.push(Error::new(
                ErrorCode::CompileErr,
                None,
                format!("invalid entrypoint {entrypoint}"),
            ));
            return Err(errs);
        }
        let reference = Ref::dotted(&parts);
        let defined = self
            .rule_tree
            .lookup(&reference)
            .is_some_and(|node| !node.values.is_empty() || !node.children.is_empty());
        if !defined {
            let mut errs = Errors::new();
            errs.push(Error::new(
                ErrorCode::CompileErr,
                None,
                format!("undefined entrypoint {entrypoint}"),
            ));
            return Err(errs);
        }
        Ok(reference)
    }

    /// A query compiler sharing this compiler's artifacts.
    pub fn query_compiler(&self) -> QueryCompiler<'_> {
        QueryCompiler {
            compiler: self,
            imports: Vec::new(),
        }
    }

    fn arity_map(&self) -> BTreeMap<String, usize> {
        let mut m = self.function_arities.clone();
        for b in builtins::builtins().values() {
            m.insert(b.name.to_string(), b.arity());
        }
        m
    }

    fn take_gen(&mut self) -> LocalVarGenerator {
        self.local_var_gen.take().unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Stage: ResolveRefs
    // ------------------------------------------------------------------

    fn resolve_refs(&mut self) {
        loop {
            self.resolve_all_refs();
            if !self.errors.is_empty() {
                return;
            }
            let Some(loader) = &mut self.module_loader else {
                break;
            };
            match loader(&self.modules) {
                Ok(extra) if extra.is_empty() => break,
                Ok(extra) => {
                    let count = extra.len();
                    for (key, module) in extra {
                        if self.modules.contains_key(&key) {
                            self.errors.push(Error::new(
                                ErrorCode::CompileErr,
                                None,
                                format!("module loader returned duplicate module {key}"),
                            ));
                            return;
                        }
                        self.modules.insert(key, module);
                    }
                    self.module_keys = self.modules.keys().cloned().collect();
                    tracing::debug!(loaded = count, "module_loader_supplied_modules");
                }
                Err(e) => {
                    self.errors.push(Error::new(
                        ErrorCode::CompileErr,
                        None,
                        format!("module loader error: {e}"),
                    ));
                    return;
                }
            }
        }
        if self.config.strict {
            self.check_unused_imports();
        }
    }

    fn resolve_all_refs(&mut self) {
        let mut modules = std::mem::take(&mut self.modules);
        for module in modules.values_mut() {
            let globals = build_globals(module);
            let mut used: BTreeSet<Var> = BTreeSet::new();
            resolve_module(module, &globals, &mut used);
        }
        self.modules = modules;
    }

    /// Strict mode: every import must be referenced. After resolution an
    /// import was used iff some reference in the module starts with its
    /// target path. The `future.*` and language-version imports are never
    /// reported.
    fn check_unused_imports(&mut self) {
        let mut errors = std::mem::take(&mut self.errors);
        for module in self.modules.values() {
            for imp in &module.imports {
                if imp.is_future_import() || imp.is_rego_version_import() {
                    continue;
                }
                let Some(target) = imp.path.value.as_ref_value() else {
                    continue;
                };
                let mut used = false;
                for rule in &module.rules {
                    visitor::walk_refs(rule, &mut |r: &Ref| {
                        if r.has_prefix(target) {
                            used = true;
                        }
                    });
                }
                if !used {
                    errors.push(Error::compile(
                        imp.location.clone(),
                        format!("import {} unused", imp.path.value),
                    ));
                }
            }
        }
        self.errors = errors;
    }

    // ------------------------------------------------------------------
    // Stage: InitLocalVarGen
    // ------------------------------------------------------------------

    fn init_local_var_gen(&mut self) {
        self.local_var_gen = Some(LocalVarGenerator::for_modules("", self.modules.values()));
    }

    // ------------------------------------------------------------------
    // Stage: RewriteRuleHeadRefs
    // ------------------------------------------------------------------

    fn rewrite_rule_head_refs(&mut self) {
        let mut gen = self.take_gen();
        let mut errors = std::mem::take(&mut self.errors);
        for module in self.modules.values_mut() {
            for rule in &mut module.rules {
                rewrites::rewrite_rule_head_refs(rule, &mut gen, &mut errors);
            }
        }
        self.errors = errors;
        self.local_var_gen = Some(gen);
    }

    // ------------------------------------------------------------------
    // Stage: CheckKeywordOverrides
    // ------------------------------------------------------------------

    fn check_keyword_overrides(&mut self) {
        let strict = self.config.strict;
        for module in self.modules.values() {
            if !strict && module.rego_version != RegoVersion::V1 {
                continue;
            }
            let prefix_len = module.package.path.len();
            for rule in &module.rules {
                let name = declared_rule_name(rule, prefix_len);
                let Some(name) = name else { continue };
                if crate::ast::ROOT_DOCUMENT_NAMES.contains(&name.as_str()) {
                    self.errors.push(Error::compile(
                        rule.head.location.clone(),
                        format!("rules must not shadow {name} (use a different rule name)"),
                    ));
                } else if FUTURE_KEYWORDS.contains(&name.as_str()) {
                    self.errors.push(Error::compile(
                        rule.head.location.clone(),
                        format!("rules must not shadow reserved keyword {name}"),
                    ));
                }
                if self.at_error_limit() {
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Stage: CheckDuplicateImports
    // ------------------------------------------------------------------

    fn check_duplicate_imports(&mut self) {
        let strict = self.config.strict;
        for module in self.modules.values() {
            let mut seen: BTreeMap<Var, &Import> = BTreeMap::new();
            for imp in &module.imports {
                if imp.is_future_import() || imp.is_rego_version_import() {
                    continue;
                }
                let Some(name) = imp.name() else { continue };
                match seen.get(&name) {
                    Some(prev) if prev.path == imp.path => {
                        // Exact duplicate: a warning outside strict mode.
                        if strict {
                            self.errors.push(Error::compile(
                                imp.location.clone(),
                                format!("import {} declared multiple times", imp.path.value),
                            ));
                        }
                    }
                    Some(prev) => {
                        self.errors.push(Error::compile(
                            imp.location.clone(),
                            format!(
                                "import {} shadows import {} under the name {name}",
                                imp.path.value, prev.path.value
                            ),
                        ));
                    }
                    None => {
                        seen.insert(name, imp);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Stage: RemoveImports
    // ------------------------------------------------------------------

    fn remove_imports(&mut self) {
        for (key, module) in &mut self.modules {
            let imports = std::mem::take(&mut module.imports);
            self.stashed_imports.insert(key.clone(), imports);
        }
    }

    // ------------------------------------------------------------------
    // Stages: SetModuleTree / SetRuleTree
    // ------------------------------------------------------------------

    fn set_module_tree(&mut self) {
        self.module_tree = ModuleTree::build(
            self.module_keys
                .iter()
                .enumerate()
                .filter_map(|(i, k)| self.modules.get(k).map(|m| (i, m))),
        );
    }

    fn set_rule_tree(&mut self) {
        let mut entries = Vec::new();
        let mut arities = BTreeMap::new();
        for (idx, key) in self.module_keys.iter().enumerate() {
            let Some(module) = self.modules.get(key) else {
                continue;
            };
            for (ridx, rule) in module.rules.iter().enumerate() {
                let id = RuleId::new(idx, ridx);
                entries.push((id, rule.head.reference.clone()));
                if rule.kind() == RuleKind::Function {
                    if let Some(name) = ref_operator_name(&rule.head.reference) {
                        arities.insert(name, rule.arity());
                    }
                }
            }
        }
        self.rule_tree = RuleTree::build(entries);
        self.function_arities = arities;
    }

    // ------------------------------------------------------------------
    // Stage: RewriteLocalVars
    // ------------------------------------------------------------------

    fn rewrite_local_vars(&mut self) {
        let strict = self.config.strict;
        let mut gen = self.take_gen();
        let mut errors = std::mem::take(&mut self.errors);
        let mut rewritten = std::mem::take(&mut self.rewritten_vars);
        for module in self.modules.values_mut() {
            for rule in &mut module.rules {
                rewrites::rewrite_local_vars(rule, &mut gen, &mut rewritten, strict, &mut errors);
            }
        }
        self.rewritten_vars = rewritten;
        self.errors = errors;
        self.local_var_gen = Some(gen);
    }

    // ------------------------------------------------------------------
    // Stage: CheckVoidCalls
    // ------------------------------------------------------------------

    fn check_void_calls(&mut self) {
        let mut errors = std::mem::take(&mut self.errors);
        for module in self.modules.values() {
            for rule in &module.rules {
                visitor::walk(rule, &mut |node| {
                    if let visitor::Node::Term(t) = node {
                        if let Value::Call(terms) = &t.value {
                            let name = terms
                                .first()
                                .and_then(|op| op.value.as_ref_value())
                                .and_then(ref_operator_name);
                            if let Some(name) = name {
                                if builtins::get(&name).is_some_and(builtins::Builtin::is_void) {
                                    errors.push(Error::type_err(
                                        t.location.clone(),
                                        format!("{name} used as value"),
                                    ));
                                }
                            }
                        }
                    }
                    true
                });
            }
        }
        self.errors = errors;
    }

    // ------------------------------------------------------------------
    // Stage: RewritePrintCalls
    // ------------------------------------------------------------------

    fn rewrite_print_calls(&mut self) {
        let enable = self.config.enable_print;
        let mut gen = self.take_gen();
        for module in self.modules.values_mut() {
            for rule in &mut module.rules {
                rewrites::for_each_rule_in_chain_mut(rule, &mut |r| {
                    rewrites::rewrite_print_calls(&mut r.body, &mut gen, enable);
                });
            }
        }
        self.local_var_gen = Some(gen);
    }

    // ------------------------------------------------------------------
    // Stage: RewriteExprTerms
    // ------------------------------------------------------------------

    fn rewrite_expr_terms(&mut self) {
        let mut gen = self.take_gen();
        for module in self.modules.values_mut() {
            for rule in &mut module.rules {
                rewrites::for_each_rule_in_chain_mut(rule, &mut |r| {
                    rewrites::rewrite_expr_terms(&mut r.body, &mut gen);
                });
            }
        }
        self.local_var_gen = Some(gen);
    }

    // ------------------------------------------------------------------
    // Stage: ParseMetadataBlocks
    // ------------------------------------------------------------------

    fn uses_metadata_builtins(&self) -> bool {
        let mut used = false;
        for module in self.modules.values() {
            visitor::walk_exprs(module, &mut |e: &Expr| {
                if matches!(
                    e.operator_name().as_deref(),
                    Some("rego.metadata.chain" | "rego.metadata.rule")
                ) {
                    used = true;
                }
            });
        }
        used
    }

    fn parse_metadata_blocks(&mut self) {
        if !self.uses_metadata_builtins() {
            return;
        }
        let mut errors = std::mem::take(&mut self.errors);
        for module in self.modules.values_mut() {
            match annotations::parse_metadata_blocks(&module.comments) {
                Ok(blocks) => module.annotations.extend(blocks),
                Err(errs) => {
                    for e in errs {
                        errors.push(e);
                    }
                }
            }
        }
        self.errors = errors;
    }

    // ------------------------------------------------------------------
    // Stage: SetAnnotationSet
    // ------------------------------------------------------------------

    fn set_annotation_set(&mut self) {
        let mut set = AnnotationSet::new();
        for (idx, key) in self.module_keys.iter().enumerate() {
            let Some(module) = self.modules.get(key) else {
                continue;
            };
            for annotation in &module.annotations {
                match annotation.scope.as_str() {
                    annotations::SCOPE_PACKAGE | annotations::SCOPE_SUBPACKAGES => {
                        set.attach_to_module(idx, annotation.clone());
                    }
                    _ => {
                        // Bind to the first rule declared after the block.
                        let target = module
                            .rules
                            .iter()
                            .enumerate()
                            .filter(|(_, r)| r.location.row > annotation.location.row)
                            .min_by_key(|(_, r)| r.location.row)
                            .map(|(ridx, _)| ridx);
                        match target {
                            Some(ridx) => {
                                set.attach_to_rule(RuleId::new(idx, ridx), annotation.clone());
                            }
                            None => set.attach_to_module(idx, annotation.clone()),
                        }
                    }
                }
            }
        }
        self.annotation_set = set;
    }

    // ------------------------------------------------------------------
    // Stage: RewriteRegoMetadataCalls
    // ------------------------------------------------------------------

    fn rewrite_rego_metadata_calls(&mut self) {
        let mut gen = self.take_gen();
        let annotation_set = std::mem::take(&mut self.annotation_set);
        for (idx, key) in self.module_keys.clone().into_iter().enumerate() {
            let Some(module) = self.modules.get_mut(&key) else {
                continue;
            };
            let package_path = module.package.path.clone();
            for (ridx, rule) in module.rules.iter_mut().enumerate() {
                let id = RuleId::new(idx, ridx);
                let chain = annotation_set.chain(id, &rule.head.reference, &package_path);
                let chain_value = Value::Array(
                    chain
                        .iter()
                        .map(|a| Term::new(a.to_value()))
                        .collect(),
                );
                let rule_value = annotation_set
                    .for_rule(id)
                    .first()
                    .map_or(Value::Object(Vec::new()), |a| a.to_value());
                rewrites::for_each_rule_in_chain_mut(rule, &mut |r| {
                    rewrites::rewrite_metadata_calls(
                        &mut r.body,
                        &mut gen,
                        &chain_value,
                        &rule_value,
                    );
                });
            }
        }
        self.annotation_set = annotation_set;
        self.local_var_gen = Some(gen);
    }

    // ------------------------------------------------------------------
    // Stage: SetGraph
    // ------------------------------------------------------------------

    fn set_graph(&mut self) {
        let mut graph = Graph::new();
        for (idx, key) in self.module_keys.iter().enumerate() {
            let Some(module) = self.modules.get(key) else {
                continue;
            };
            for (ridx, rule) in module.rules.iter().enumerate() {
                let id = RuleId::new(idx, ridx);
                graph.add_node(id);
                for chain_rule in rule.iter_chain() {
                    let mut visit_ref = |r: &Ref| {
                        for target in self.rule_tree.rules_for_ref(r) {
                            graph.add_edge(id, target);
                        }
                    };
                    visitor::walk_refs(&chain_rule.body, &mut visit_ref);
                    for arg in &chain_rule.head.args {
                        visitor::walk_refs(arg, &mut visit_ref);
                    }
                    if let Some(k) = &chain_rule.head.key {
                        visitor::walk_refs(k, &mut visit_ref);
                    }
                    if let Some(v) = &chain_rule.head.value {
                        visitor::walk_refs(v, &mut visit_ref);
                    }
                }
            }
        }
        self.graph = graph;
    }

    // ------------------------------------------------------------------
    // Stages: RewriteComprehensionTerms / RewriteRefsInHead
    // ------------------------------------------------------------------

    fn rewrite_comprehension_terms(&mut self) {
        let mut gen = self.take_gen();
        for module in self.modules.values_mut() {
            for rule in &mut module.rules {
                rewrites::for_each_rule_in_chain_mut(rule, &mut |r| {
                    rewrites::rewrite_comprehension_terms(&mut r.body, &mut gen);
                });
            }
        }
        self.local_var_gen = Some(gen);
    }

    fn rewrite_refs_in_head(&mut self) {
        let mut gen = self.take_gen();
        for module in self.modules.values_mut() {
            for rule in &mut module.rules {
                rewrites::rewrite_refs_in_head(rule, &mut gen);
            }
        }
        self.local_var_gen = Some(gen);
    }

    // ------------------------------------------------------------------
    // Stage: RewriteWithValues
    // ------------------------------------------------------------------

    fn rewrite_with_values(&mut self) {
        let mut gen = self.take_gen();
        let mut errors = std::mem::take(&mut self.errors);
        let arities = self.function_arities.clone();
        let is_function = move |r: &Ref| {
            ref_operator_name(r).is_some_and(|name| arities.contains_key(&name))
        };
        for module in self.modules.values_mut() {
            for rule in &mut module.rules {
                rewrites::for_each_rule_in_chain_mut(rule, &mut |r| {
                    rewrites::rewrite_with_values(&mut r.body, &mut gen, &is_function, &mut errors);
                });
            }
        }
        self.errors = errors;
        self.local_var_gen = Some(gen);
    }

    // ------------------------------------------------------------------
    // Stage: CheckRuleConflicts
    // ------------------------------------------------------------------

    fn check_rule_conflicts(&mut self) {
        let mut errors = std::mem::take(&mut self.errors);

        let mut path = Vec::new();
        let rule_tree = std::mem::take(&mut self.rule_tree);
        rule_tree.root().walk(&mut path, &mut |path, node| {
            if node.values.is_empty() {
                return;
            }
            let path_str = render_path(path);
            let rules: Vec<&Rule> = node
                .values
                .iter()
                .filter_map(|id| self.rule(*id))
                .collect();

            let kinds: BTreeSet<&str> = rules
                .iter()
                .map(|r| match r.kind() {
                    RuleKind::SingleValue => "single-value",
                    RuleKind::MultiValue => "multi-value",
                    RuleKind::Function => "function",
                })
                .collect();
            let arities: BTreeSet<usize> = rules.iter().map(|r| r.arity()).collect();
            if kinds.len() > 1 || arities.len() > 1 {
                if let Some(first) = rules.first() {
                    errors.push(Error::type_err(
                        first.location.clone(),
                        format!("conflicting rules {path_str} found"),
                    ));
                }
            }

            let defaults = rules.iter().filter(|r| r.head.default).count();
            if defaults > 1 {
                if let Some(first) = rules.first() {
                    errors.push(Error::type_err(
                        first.location.clone(),
                        format!("multiple default rules {path_str} found"),
                    ));
                }
            }

            // A ground single-value rule owns its extent: nothing may be
            // defined beneath it.
            let ground_single = rules.iter().any(|r| {
                r.kind() == RuleKind::SingleValue
                    && r.head.reference.is_ground()
                    && r.head.key.is_none()
            });
            if ground_single && !node.children.is_empty() {
                let mut child_paths = Vec::new();
                for key in node.children.keys() {
                    let mut child = path.to_vec();
                    child.push(key.clone());
                    child_paths.push(render_path(&child));
                }
                if let Some(first) = rules.first() {
                    errors.push(Error::type_err(
                        first.location.clone(),
                        format!("rule {path_str} conflicts with [{}]", child_paths.join(", ")),
                    ));
                }
            }
        });
        self.rule_tree = rule_tree;

        // External base-document conflicts, via the caller-supplied hook.
        if let Some(exists) = &self.path_exists {
            let mut path = Vec::new();
            let mut checks = Vec::new();
            self.rule_tree.root().walk(&mut path, &mut |path, node| {
                if node.values.is_empty() {
                    return;
                }
                let strings: Vec<String> = path
                    .iter()
                    .skip(1)
                    .map(ToString::to_string)
                    .map(|s| s.trim_matches('"').to_string())
                    .collect();
                if let Some(root) = strings.first() {
                    if self.config.path_conflict_roots.is_empty()
                        || self.config.path_conflict_roots.contains(root)
                    {
                        checks.push((render_path(path), strings));
                    }
                }
            });
            for (path_str, strings) in checks {
                match exists(&strings) {
                    Ok(true) => errors.push(Error::new(
                        ErrorCode::CompileErr,
                        None,
                        format!("conflicting rule for data path {path_str} found"),
                    )),
                    Ok(false) => {}
                    Err(e) => errors.push(Error::new(
                        ErrorCode::CompileErr,
                        None,
                        format!("conflict check for {path_str} failed: {e}"),
                    )),
                }
            }
        }

        self.errors = errors;
    }

    // ------------------------------------------------------------------
    // Stage: CheckUndefinedFuncs
    // ------------------------------------------------------------------

    fn check_undefined_funcs(&mut self) {
        let allow_undefined = self.config.allow_undefined_func_calls;
        let mut errors = std::mem::take(&mut self.errors);
        for module in self.modules.values() {
            for rule in &module.rules {
                visitor::walk_exprs(rule, &mut |e: &Expr| {
                    if !e.is_call() {
                        return;
                    }
                    let Some(name) = e.operator_name() else {
                        return;
                    };
                    let nops = e.operands().len();
                    let declared = if let Some(b) = self.config.capabilities.builtin(&name) {
                        b.decl.arity()
                    } else if let Some(arity) = self.function_arities.get(&name) {
                        Some(*arity)
                    } else {
                        if !allow_undefined {
                            errors.push(Error::compile(
                                e.location.clone(),
                                format!("undefined function {name}"),
                            ));
                        }
                        return;
                    };
                    let Some(declared) = declared else { return };
                    if is_variadic(&name) {
                        return;
                    }
                    let ok = if e.generated {
                        nops == declared || nops == declared + 1
                    } else {
                        nops == declared
                    };
                    if !ok {
                        errors.push(Error::type_err(
                            e.location.clone(),
                            format!("function {name} has arity {declared}, got {nops} arguments"),
                        ));
                    }
                });
            }
        }
        self.errors = errors;
    }

    // ------------------------------------------------------------------
    // Stage: CheckSafetyRuleHeads
    // ------------------------------------------------------------------

    fn check_safety_rule_heads(&mut self) {
        let mut errors = std::mem::take(&mut self.errors);
        for module in self.modules.values() {
            for rule in &module.rules {
                for chain_rule in rule.iter_chain() {
                    let mut head_vars = VarVisitor::new(VarVisitorParams::default());
                    for t in chain_rule.head.reference.iter().skip(1) {
                        head_vars.walk_term(t);
                    }
                    if let Some(k) = &chain_rule.head.key {
                        head_vars.walk_term(k);
                    }
                    if let Some(v) = &chain_rule.head.value {
                        head_vars.walk_term(v);
                    }

                    let mut bound = visitor::body_vars(&chain_rule.body);
                    for arg in &chain_rule.head.args {
                        let mut args = VarVisitor::new(VarVisitorParams::default());
                        args.walk_term(arg);
                        bound.extend(args.into_vars());
                    }

                    for v in head_vars.into_vars() {
                        if v.is_wildcard() || bound.contains(&v) {
                            continue;
                        }
                        errors.push(Error::unsafe_var(chain_rule.head.location.clone(), v));
                    }
                }
            }
        }
        self.errors = errors;
    }

    // ------------------------------------------------------------------
    // Stage: CheckSafetyRuleBodies
    // ------------------------------------------------------------------

    fn check_safety_rule_bodies(&mut self) {
        let arities = self.arity_map();
        let arity = move |name: &str| arities.get(name).copied();
        let rewritten = self.rewritten_vars.clone();

        let mut errors = std::mem::take(&mut self.errors);
        for module in self.modules.values_mut() {
            for rule in &mut module.rules {
                rewrites::for_each_rule_in_chain_mut(rule, &mut |r| {
                    let mut globals: BTreeSet<Var> = BTreeSet::new();
                    for arg in &r.head.args {
                        let mut v = VarVisitor::new(VarVisitorParams::default());
                        v.walk_term(arg);
                        globals.extend(v.into_vars());
                    }
                    let (reordered, unsafes) = safety::reorder_body(&globals, &r.body, &arity);
                    r.body = reordered;
                    for u in unsafes {
                        let mut named = false;
                        for v in &u.vars {
                            if let Some(original) = rewritten.get(v) {
                                errors.push(Error::unsafe_var(u.location.clone(), original.clone()));
                                named = true;
                            } else if !v.is_generated() {
                                errors.push(Error::unsafe_var(u.location.clone(), v.clone()));
                                named = true;
                            }
                        }
                        if !named {
                            // Only anonymous generated vars: one report per
                            // expression rather than one per variable.
                            errors.push(Error::new(
                                ErrorCode::UnsafeVarErr,
                                Some(u.location.clone()),
                                "expression is unsafe",
                            ));
                        }
                    }
                });
            }
        }
        self.errors = errors;
    }

    // ------------------------------------------------------------------
    // Stages: RewriteEquals / RewriteDynamicTerms / RewriteTestRules
    // ------------------------------------------------------------------

    fn rewrite_equals(&mut self) {
        for module in self.modules.values_mut() {
            for rule in &mut module.rules {
                rewrites::for_each_rule_in_chain_mut(rule, &mut |r| {
                    rewrites::rewrite_equals(&mut r.body);
                });
            }
        }
    }

    fn rewrite_dynamic_terms(&mut self) {
        let mut gen = self.take_gen();
        for module in self.modules.values_mut() {
            for rule in &mut module.rules {
                rewrites::for_each_rule_in_chain_mut(rule, &mut |r| {
                    rewrites::rewrite_dynamic_terms(&mut r.body, &mut gen);
                });
            }
        }
        self.local_var_gen = Some(gen);
    }

    fn rewrite_test_rules(&mut self) {
        if !self.config.rewrite_test_rules {
            return;
        }
        let mut gen = self.take_gen();
        for module in self.modules.values_mut() {
            for rule in &mut module.rules {
                if !rule.head.name().starts_with(TEST_RULE_PREFIX) {
                    continue;
                }
                rewrites::for_each_rule_in_chain_mut(rule, &mut |r| {
                    rewrites::rewrite_test_equalities(&mut r.body, &mut gen);
                });
            }
        }
        self.local_var_gen = Some(gen);
    }

    // ------------------------------------------------------------------
    // Stage: CheckRecursion
    // ------------------------------------------------------------------

    fn check_recursion(&mut self) {
        let (_, ok) = self.graph.sort();
        if ok {
            return;
        }
        if let Some(cycle) = self.graph.find_cycle() {
            let names: Vec<String> = cycle
                .iter()
                .filter_map(|id| self.rule(*id))
                .map(|r| r.head.name())
                .collect();
            let location = cycle
                .first()
                .and_then(|id| self.rule(*id))
                .map(|r| r.location.clone())
                .unwrap_or_default();
            self.errors.push(Error::recursion(location, &names));
        }
    }

    // ------------------------------------------------------------------
    // Stage: CheckTypes
    // ------------------------------------------------------------------

    fn check_types(&mut self) {
        let (order, ok) = self.graph.sort();
        if !ok {
            return;
        }
        let ordered: Vec<(RuleId, &Rule)> = order
            .iter()
            .filter_map(|id| self.rule(*id).map(|r| (*id, r)))
            .collect();

        let capabilities = &self.config.capabilities;
        let builtin_decl =
            |name: &str| -> Option<Type> { capabilities.builtin(name).map(|b| b.decl.clone()) };

        let annotations = if self.config.use_type_check_annotations {
            let mut per_rule = BTreeMap::new();
            for (id, _) in &ordered {
                let schemas: Vec<crate::annotations::SchemaAnnotation> = self
                    .annotation_set
                    .for_rule(*id)
                    .iter()
                    .flat_map(|a| a.schemas.iter().cloned())
                    .collect();
                if !schemas.is_empty() {
                    per_rule.insert(*id, schemas);
                }
            }
            per_rule
        } else {
            BTreeMap::new()
        };

        let (env, type_errors) = types::check::check_types(types::check::CheckParams {
            ordered: &ordered,
            builtin_decl: &builtin_decl,
            schemas: &self.config.schemas,
            allow_net: self.config.capabilities.allow_net.as_deref(),
            rule_schemas: &annotations,
            max_errors: self.config.max_errors.saturating_sub(self.errors.len()),
        });
        self.type_env = env;
        for e in type_errors {
            self.errors.push(e);
        }
    }

    // ------------------------------------------------------------------
    // Stages: CheckUnsafeBuiltins / CheckDeprecatedBuiltins
    // ------------------------------------------------------------------

    fn check_unsafe_builtins(&mut self) {
        if self.config.unsafe_builtins.is_empty() {
            return;
        }
        let mut errors = std::mem::take(&mut self.errors);
        for module in self.modules.values() {
            for rule in &module.rules {
                visitor::walk_exprs(rule, &mut |e: &Expr| {
                    if let Some(name) = e.operator_name() {
                        if self.config.unsafe_builtins.contains(&name) {
                            errors.push(Error::type_err(
                                e.location.clone(),
                                format!("unsafe built-in function calls in expression: {name}"),
                            ));
                        }
                    }
                });
            }
        }
        self.errors = errors;
    }

    fn check_deprecated_builtins(&mut self) {
        if !self.config.strict {
            return;
        }
        let mut errors = std::mem::take(&mut self.errors);
        for module in self.modules.values() {
            for rule in &module.rules {
                visitor::walk_exprs(rule, &mut |e: &Expr| {
                    if let Some(name) = e.operator_name() {
                        if builtins::get(&name).is_some_and(|b| b.deprecated) {
                            errors.push(Error::type_err(
                                e.location.clone(),
                                format!("deprecated built-in function calls in expression: {name}"),
                            ));
                        }
                    }
                });
            }
        }
        self.errors = errors;
    }

    // ------------------------------------------------------------------
    // Stages: BuildRuleIndices / BuildComprehensionIndices
    // ------------------------------------------------------------------

    fn build_rule_indices(&mut self) {
        if self.config.eval_mode == EvalMode::IR {
            return;
        }
        let mut sets: Vec<(String, Vec<RuleId>)> = Vec::new();
        let mut path = Vec::new();
        self.rule_tree.root().walk(&mut path, &mut |path, node| {
            if !node.values.is_empty() {
                sets.push((render_path(path), node.values.clone()));
            }
        });
        let mut indices = BTreeMap::new();
        for (path, ids) in sets {
            let rules: Vec<(RuleId, &Rule)> = ids
                .iter()
                .filter_map(|id| self.rule(*id).map(|r| (*id, r)))
                .collect();
            indices.insert(path, RuleIndex::build(rules));
        }
        self.rule_indices = indices;
    }

    fn build_comprehension_indices(&mut self) {
        if self.config.eval_mode == EvalMode::IR {
            return;
        }
        let arities = self.arity_map();
        let arity = move |name: &str| arities.get(name).copied();

        let mut indices = BTreeMap::new();
        for (idx, key) in self.module_keys.iter().enumerate() {
            let Some(module) = self.modules.get(key) else {
                continue;
            };
            for (ridx, rule) in module.rules.iter().enumerate() {
                let id = RuleId::new(idx, ridx);
                let mut candidates: BTreeSet<Var> = BTreeSet::new();
                for arg in &rule.head.args {
                    let mut v = VarVisitor::new(VarVisitorParams::default());
                    v.walk_term(arg);
                    candidates.extend(v.into_vars());
                }
                for (eidx, expr) in rule.body.iter().enumerate() {
                    if let Some(index) =
                        comprehension_index::index_for_expr(expr, &candidates, &arity)
                    {
                        indices.insert((id, eidx), index);
                    }
                    candidates.extend(safety::expr_output_vars(expr, &candidates, &arity));
                }
            }
        }
        self.comprehension_indices = indices;
    }

    // ------------------------------------------------------------------
    // Stage: BuildRequiredCapabilities
    // ------------------------------------------------------------------

    fn build_required_capabilities(&mut self) {
        let mut required = RequiredCapabilities::default();
        for module in self.modules.values() {
            if module.rego_version == RegoVersion::V1 {
                required.features.insert(FEATURE_REGO_V1.to_string());
            }
            for rule in &module.rules {
                visitor::walk_exprs(rule, &mut |e: &Expr| {
                    if let Some(name) = e.operator_name() {
                        if builtins::get(&name).is_some() {
                            required.builtins.insert(name);
                        }
                    }
                });
                let package_len = module.package.path.len();
                let reference = &rule.head.reference;
                if reference.len() > package_len + 1 {
                    if reference.string_path().is_some() {
                        required
                            .features
                            .insert(FEATURE_RULE_HEAD_REF_STRING_PREFIXES.to_string());
                    } else {
                        required.features.insert(FEATURE_RULE_HEAD_REFS.to_string());
                    }
                }
            }
        }
        for imports in self.stashed_imports.values() {
            for imp in imports {
                if imp.is_rego_version_import() {
                    required.features.insert(FEATURE_REGO_V1_IMPORT.to_string());
                }
                if imp.is_future_import() {
                    if let Some(r) = imp.path.value.as_ref_value() {
                        if let Some(last) = r.terms().last().and_then(|t| t.value.as_string()) {
                            if last != "keywords" {
                                required.future_keywords.insert(last.to_string());
                            } else {
                                for kw in FUTURE_KEYWORDS {
                                    required.future_keywords.insert((*kw).to_string());
                                }
                            }
                        }
                    }
                }
            }
        }
        self.required = required;
    }
}

fn is_variadic(name: &str) -> bool {
    builtins::get(name)
        .map(|b| matches!(&b.decl, Type::Function { variadic: Some(_), .. }))
        .unwrap_or(false)
}

/// The rule's declared (unqualified) name, given the package prefix length.
fn declared_rule_name(rule: &Rule, package_len: usize) -> Option<String> {
    let reference = &rule.head.reference;
    let idx = if reference.len() > package_len { package_len } else { 0 };
    match &reference.get(idx)?.value {
        Value::String(s) => Some(s.clone()),
        Value::Var(v) if !v.is_root_document() => Some(v.as_str().to_string()),
        _ => None,
    }
}

fn render_path(path: &[Value]) -> String {
    let mut out = String::new();
    for (i, v) in path.iter().enumerate() {
        match v {
            Value::Var(var) if i == 0 => out.push_str(var.as_str()),
            Value::String(s) => {
                out.push('.');
                out.push_str(s);
            }
            other => {
                out.push('[');
                out.push_str(&other.to_string());
                out.push(']');
            }
        }
    }
    out
}

// ============================================================================
// Reference resolution
// ============================================================================

/// Per-module globals: rule names and import names mapped to their fully
/// qualified paths.
fn build_globals(module: &Module) -> BTreeMap<Var, Ref> {
    let mut globals = BTreeMap::new();
    let package_len = module.package.path.len();

    for rule in &module.rules {
        let reference = &rule.head.reference;
        match reference.head().map(|t| &t.value) {
            Some(Value::Var(v)) if !v.is_root_document() => {
                let target = module.package.path.append(Term::string(v.as_str()));
                globals.insert(v.clone(), target);
            }
            Some(Value::Var(v)) if v.is_root_document() => {
                // Already qualified; re-derive the name for siblings.
                if let Some(Value::String(name)) =
                    reference.get(package_len).map(|t| &t.value)
                {
                    let target = module.package.path.append(Term::string(name.clone()));
                    globals.insert(Var::new(name.clone()), target);
                }
            }
            _ => {}
        }
    }

    for imp in &module.imports {
        if imp.is_future_import() || imp.is_rego_version_import() {
            continue;
        }
        let (Some(name), Some(path)) = (imp.name(), imp.path.value.as_ref_value()) else {
            continue;
        };
        globals.insert(name, path.clone());
    }

    globals
}

/// Qualify rule heads and rewrite vars/refs in bodies against the globals.
fn resolve_module(module: &mut Module, globals: &BTreeMap<Var, Ref>, used: &mut BTreeSet<Var>) {
    let package_path = module.package.path.clone();
    for rule in &mut module.rules {
        resolve_rule(rule, &package_path, globals, used);
    }
}

fn resolve_rule(
    rule: &mut Rule,
    package_path: &Ref,
    globals: &BTreeMap<Var, Ref>,
    used: &mut BTreeSet<Var>,
) {
    // Qualify the head reference.
    let head_ref = &rule.head.reference;
    if let Some(Value::Var(v)) = head_ref.head().map(|t| &t.value) {
        if !v.is_root_document() {
            let mut terms = package_path.terms().to_vec();
            terms.push(Term::string(v.as_str()));
            terms.extend(head_ref.terms().iter().skip(1).cloned());
            rule.head.reference = Ref::new(terms);
        }
    }

    // Locally declared names shadow globals.
    let ignore = local_declarations(rule);

    for arg in &mut rule.head.args {
        resolve_term(arg, globals, &ignore, used);
    }
    if let Some(k) = &mut rule.head.key {
        resolve_term(k, globals, &ignore, used);
    }
    if let Some(v) = &mut rule.head.value {
        resolve_term(v, globals, &ignore, used);
    }
    resolve_body(&mut rule.body, globals, &ignore, used);

    if let Some(else_rule) = &mut rule.else_rule {
        resolve_rule(else_rule, package_path, globals, used);
    }
}

/// Variables declared locally anywhere in the rule: arguments, `some`
/// declarations, assignment targets and `every` key/value bindings.
fn local_declarations(rule: &Rule) -> BTreeSet<Var> {
    let mut out = BTreeSet::new();
    for arg in &rule.head.args {
        let mut v = VarVisitor::new(VarVisitorParams::default());
        v.walk_term(arg);
        out.extend(v.into_vars());
    }
    visitor::walk_exprs(&rule.body, &mut |e: &Expr| {
        match &e.terms {
            ExprTerms::SomeDecl(decl) => {
                for s in &decl.symbols {
                    if let Value::Var(v) = &s.value {
                        out.insert(v.clone());
                    }
                }
            }
            ExprTerms::Every(every) => {
                out.extend(every.key_value_vars());
            }
            _ => {}
        }
        if e.is_assignment() {
            if let Some(target) = e.operands().first() {
                let mut v = VarVisitor::new(VarVisitorParams::default());
                v.walk_term(target);
                out.extend(v.into_vars());
            }
        }
    });
    out
}

fn resolve_body(
    body: &mut Body,
    globals: &BTreeMap<Var, Ref>,
    ignore: &BTreeSet<Var>,
    used: &mut BTreeSet<Var>,
) {
    for expr in body.iter_mut() {
        match &mut expr.terms {
            ExprTerms::Term(t) => resolve_term(t, globals, ignore, used),
            ExprTerms::Call(terms) => {
                for t in terms.iter_mut() {
                    resolve_term(t, globals, ignore, used);
                }
            }
            ExprTerms::SomeDecl(_) => {}
            ExprTerms::Every(every) => {
                resolve_term(&mut every.domain, globals, ignore, used);
                resolve_body(&mut every.body, globals, ignore, used);
            }
        }
        for w in &mut expr.with {
            resolve_term(&mut w.target, globals, ignore, used);
            resolve_term(&mut w.value, globals, ignore, used);
        }
    }
}

fn resolve_term(
    t: &mut Term,
    globals: &BTreeMap<Var, Ref>,
    ignore: &BTreeSet<Var>,
    used: &mut BTreeSet<Var>,
) {
    match &mut t.value {
        Value::Var(v) => {
            if !ignore.contains(v) {
                if let Some(target) = globals.get(v) {
                    used.insert(v.clone());
                    t.value = Value::Ref(target.clone());
                }
            }
        }
        Value::Ref(r) => {
            let spliced = match r.head().map(|h| &h.value) {
                Some(Value::Var(v)) if !ignore.contains(v) => globals.get(v).map(|target| {
                    used.insert(v.clone());
                    target.concat(&r.terms()[1..])
                }),
                _ => None,
            };
            if let Some(new_ref) = spliced {
                *r = new_ref;
            }
            for s in r.iter_mut().skip(1) {
                resolve_term(s, globals, ignore, used);
            }
        }
        Value::Array(items) | Value::Call(items) => {
            for i in items.iter_mut() {
                resolve_term(i, globals, ignore, used);
            }
        }
        Value::Set(items) => {
            let mut moved = std::mem::take(items);
            for i in moved.iter_mut() {
                resolve_term(i, globals, ignore, used);
            }
            t.value = Value::set(moved);
        }
        Value::Object(pairs) => {
            for (k, v) in pairs.iter_mut() {
                resolve_term(k, globals, ignore, used);
                resolve_term(v, globals, ignore, used);
            }
        }
        Value::ArrayComprehension { term, body } | Value::SetComprehension { term, body } => {
            resolve_term(term, globals, ignore, used);
            resolve_body(body, globals, ignore, used);
        }
        Value::ObjectComprehension { key, value, body } => {
            resolve_term(key, globals, ignore, used);
            resolve_term(value, globals, ignore, used);
            resolve_body(body, globals, ignore, used);
        }
        _ => {}
    }
}

// ============================================================================
// Query compilation
// ============================================================================

/// Compiles ad-hoc query bodies against a compiled module set: reference
/// resolution, local rewriting, expression flattening and safety
/// reordering, sharing the parent compiler's artifacts.
pub struct QueryCompiler<'c> {
    compiler: &'c Compiler,
    imports: Vec<Import>,
}

impl<'c> QueryCompiler<'c> {
    /// Supply imports visible to the query.
    pub fn with_imports(mut self, imports: Vec<Import>) -> Self {
        self.imports = imports;
        self
    }

    pub fn compile(&self, query: &Body) -> CompileResult<Body> {
        let mut errors = Errors::new();
        let mut body = query.clone();

        // Resolve against query imports only.
        let mut globals = BTreeMap::new();
        for imp in &self.imports {
            if imp.is_future_import() || imp.is_rego_version_import() {
                continue;
            }
            if let (Some(name), Some(path)) = (imp.name(), imp.path.value.as_ref_value()) {
                globals.insert(name, path.clone());
            }
        }
        let ignore = BTreeSet::new();
        let mut used = BTreeSet::new();
        resolve_body(&mut body, &globals, &ignore, &mut used);

        let mut gen = LocalVarGenerator::for_modules("q", self.compiler.modules().values());
        let mut rewritten = BTreeMap::new();
        let mut rule = Rule::new(crate::ast::Head::new("__query__"), body);
        rewrites::rewrite_local_vars(&mut rule, &mut gen, &mut rewritten, false, &mut errors);
        rewrites::rewrite_expr_terms(&mut rule.body, &mut gen);
        rewrites::rewrite_print_calls(
            &mut rule.body,
            &mut gen,
            self.compiler.config.enable_print,
        );

        let arities = self.compiler.arity_map();
        let arity = move |name: &str| arities.get(name).copied();
        let globals_set: BTreeSet<Var> = BTreeSet::new();
        let (reordered, unsafes) = safety::reorder_body(&globals_set, &rule.body, &arity);
        for u in unsafes {
            for v in &u.vars {
                let display = rewritten.get(v).cloned().unwrap_or_else(|| v.clone());
                errors.push(Error::unsafe_var(u.location.clone(), display));
            }
        }
        let mut body = reordered;
        rewrites::rewrite_equals(&mut body);
        rewrites::rewrite_dynamic_terms(&mut body, &mut gen);

        if errors.is_empty() {
            Ok(body)
        } else {
            Err(errors)
        }
    }
}
