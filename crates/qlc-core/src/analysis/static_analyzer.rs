//! Static analysis: one depth-first traversal of the Program Model.
//!
//! Collects functions, variables, loops, conditionals and call sites, then
//! resolves the call graph and marks recursive functions.

use std::collections::HashMap;

use indexmap::IndexMap;

use super::callgraph::{build_call_graph, collect_call_sites, CallSite};
use super::static_facts::*;
use crate::errors::QlcResult;
use crate::program::ast::*;
use crate::program::{parse_program, Program};

/// Parse `source` and extract its static facts.
pub fn analyze_source(source: &str) -> QlcResult<(Program, StaticFacts)> {
    let program = parse_program(source)?;
    let facts = analyze_program(&program);
    Ok((program, facts))
}

/// Extract static facts from an already lowered program.
pub fn analyze_program(program: &Program) -> StaticFacts {
    let mut collector = Collector::new(program);
    collector.visit_block(&program.body, Ctx::module());
    let facts = collector.finish();
    tracing::debug!(
        functions = facts.summary.total_functions,
        loops = facts.summary.total_loops,
        calls = facts.summary.total_calls,
        has_recursion = facts.summary.has_recursion,
        "static facts extracted"
    );
    facts
}

// ---------------------------------------------------------------------------
// Traversal state
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct Ctx {
    /// Innermost function, lambdas included.
    function: Option<FunctionId>,
    /// Innermost named function; owner for loops and complexity.
    named: Option<FunctionId>,
    loop_depth: usize,
}

impl Ctx {
    fn module() -> Self {
        Self {
            function: None,
            named: None,
            loop_depth: 0,
        }
    }
}

#[derive(Default, Clone)]
struct FunctionStats {
    has_conditionals: bool,
    has_loops: bool,
    return_count: usize,
    complexity: usize,
}

struct Collector<'p> {
    program: &'p Program,
    line_limit: usize,
    /// Display name per function id, see [`function_labels`].
    labels: Vec<String>,
    variables: IndexMap<(String, String), usize>,
    loops: Vec<LoopInfo>,
    conditionals: Vec<ConditionalInfo>,
    sites: Vec<CallSite>,
    stats: Vec<FunctionStats>,
    module_complexity: usize,
}

impl<'p> Collector<'p> {
    fn new(program: &'p Program) -> Self {
        Self {
            program,
            line_limit: program.line_count.max(1),
            labels: function_labels(program),
            variables: IndexMap::new(),
            loops: Vec::new(),
            conditionals: Vec::new(),
            sites: Vec::new(),
            stats: vec![
                FunctionStats {
                    complexity: 1,
                    ..FunctionStats::default()
                };
                program.functions.len()
            ],
            module_complexity: 1,
        }
    }

    fn clamp(&self, line: usize) -> usize {
        line.clamp(1, self.line_limit)
    }

    fn owner_name(&self, id: Option<FunctionId>) -> String {
        match id {
            Some(id) => self.labels[id].clone(),
            None => GLOBAL_SCOPE.to_string(),
        }
    }

    fn add_complexity(&mut self, ctx: Ctx, amount: usize) {
        match ctx.named {
            Some(id) => self.stats[id].complexity += amount,
            None => self.module_complexity += amount,
        }
    }

    fn stats_mut(&mut self, ctx: Ctx) -> Option<&mut FunctionStats> {
        ctx.named.map(|id| &mut self.stats[id])
    }

    /// Scope that owns a binding of `name` made inside `ctx.named`.
    fn binding_owner(&self, ctx: Ctx, name: &str) -> Option<FunctionId> {
        let id = ctx.named?;
        let def = self.program.function(id);
        if def.globals.contains(name) {
            return None;
        }
        if def.nonlocals.contains(name) {
            let mut scope = def.parent;
            while let Some(p) = scope {
                let parent = self.program.function(p);
                if parent.locals.contains(name) {
                    return Some(p);
                }
                scope = parent.parent;
            }
            return None;
        }
        Some(id)
    }

    fn record_target(&mut self, target: &Target, line: usize, ctx: Ctx) {
        for name in target.bound_names() {
            let owner = self.binding_owner(ctx, name);
            let key = (self.owner_name(owner), name.to_string());
            let line = self.clamp(line);
            self.variables.entry(key).or_insert(line);
        }
        self.visit_target_exprs(target, ctx);
    }

    fn visit_target_exprs(&mut self, target: &Target, ctx: Ctx) {
        match target {
            Target::Name(_) => {}
            Target::Attribute { value, .. } => self.visit_expr(value, ctx),
            Target::Subscript { value, index } => {
                self.visit_expr(value, ctx);
                self.visit_expr(index, ctx);
            }
            Target::Tuple(items) => items.iter().for_each(|t| self.visit_target_exprs(t, ctx)),
            Target::Starred(inner) => self.visit_target_exprs(inner, ctx),
        }
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn visit_block(&mut self, body: &[Stmt], ctx: Ctx) {
        for stmt in body {
            self.visit_stmt(stmt, ctx);
        }
    }

    fn visit_stmt(&mut self, stmt: &Stmt, ctx: Ctx) {
        let line = stmt.span.start_line;
        match &stmt.kind {
            StmtKind::Expr(e) => self.visit_expr(e, ctx),
            StmtKind::Assign { targets, value } => {
                self.visit_expr(value, ctx);
                for target in targets {
                    self.record_target(target, line, ctx);
                }
            }
            StmtKind::AugAssign { target, value, .. } => {
                self.visit_expr(value, ctx);
                self.record_target(target, line, ctx);
            }
            StmtKind::If { branches, orelse } => {
                self.conditionals.push(ConditionalInfo {
                    start_line: self.clamp(stmt.span.start_line),
                    end_line: self.clamp(stmt.span.end_line),
                    branch_count: branches.len() + usize::from(orelse.is_some()),
                    has_elif: branches.len() > 1,
                    has_else: orelse.is_some(),
                });
                if let Some(stats) = self.stats_mut(ctx) {
                    stats.has_conditionals = true;
                }
                self.add_complexity(ctx, branches.len());
                for branch in branches {
                    self.visit_expr(&branch.test, ctx);
                    self.visit_block(&branch.body, ctx);
                }
                if let Some(body) = orelse {
                    self.visit_block(body, ctx);
                }
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                let loop_variable = match target {
                    Target::Name(n) => Some(n.clone()),
                    _ => None,
                };
                self.push_loop(LoopKind::For, stmt, loop_variable, ctx);
                self.visit_expr(iter, ctx);
                self.record_target(target, line, ctx);
                let inner = Ctx {
                    loop_depth: ctx.loop_depth + 1,
                    ..ctx
                };
                self.visit_block(body, inner);
                if let Some(orelse) = orelse {
                    self.visit_block(orelse, ctx);
                }
            }
            StmtKind::While { test, body, orelse } => {
                self.push_loop(LoopKind::While, stmt, None, ctx);
                self.visit_expr(test, ctx);
                let inner = Ctx {
                    loop_depth: ctx.loop_depth + 1,
                    ..ctx
                };
                self.visit_block(body, inner);
                if let Some(orelse) = orelse {
                    self.visit_block(orelse, ctx);
                }
            }
            StmtKind::FunctionDef(id) => self.visit_function(*id, ctx),
            StmtKind::Return(value) => {
                if let Some(stats) = self.stats_mut(ctx) {
                    stats.return_count += 1;
                }
                if let Some(v) = value {
                    self.visit_expr(v, ctx);
                }
            }
            StmtKind::Assert { test, msg } => {
                self.visit_expr(test, ctx);
                if let Some(m) = msg {
                    self.visit_expr(m, ctx);
                }
            }
            StmtKind::Raise(Some(e)) => self.visit_expr(e, ctx),
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                self.visit_block(body, ctx);
                self.add_complexity(ctx, handlers.len());
                for handler in handlers {
                    if let Some(t) = &handler.exc_type {
                        self.visit_expr(t, ctx);
                    }
                    if let Some(alias) = &handler.alias {
                        self.record_target(&Target::Name(alias.clone()), handler.line, ctx);
                    }
                    self.visit_block(&handler.body, ctx);
                }
                for block in [orelse, finalbody].into_iter().flatten() {
                    self.visit_block(block, ctx);
                }
            }
            StmtKind::Delete(targets) => {
                for target in targets {
                    self.visit_target_exprs(target, ctx);
                }
            }
            StmtKind::Raise(None)
            | StmtKind::Pass
            | StmtKind::Break
            | StmtKind::Continue
            | StmtKind::Global(_)
            | StmtKind::Nonlocal(_)
            | StmtKind::Unsupported { .. } => {}
        }
    }

    fn push_loop(&mut self, kind: LoopKind, stmt: &Stmt, loop_variable: Option<String>, ctx: Ctx) {
        self.loops.push(LoopInfo {
            kind,
            start_line: self.clamp(stmt.span.start_line),
            end_line: self.clamp(stmt.span.end_line),
            nesting_depth: ctx.loop_depth,
            loop_variable,
            owner: self.owner_name(ctx.named),
        });
        if let Some(stats) = self.stats_mut(ctx) {
            stats.has_loops = true;
        }
        self.add_complexity(ctx, 1);
    }

    fn visit_function(&mut self, id: FunctionId, ctx: Ctx) {
        let def = self.program.function(id);
        for param in &def.params {
            if let Some(default) = &param.default {
                self.visit_expr(default, ctx);
            }
        }
        let inner = Ctx {
            function: Some(id),
            named: if def.is_lambda { ctx.named } else { Some(id) },
            loop_depth: 0,
        };
        match &def.body {
            FunctionBody::Block(body) => self.visit_block(body, inner),
            FunctionBody::Expr(expr) => self.visit_expr(expr, inner),
        }
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn visit_expr(&mut self, expr: &Expr, ctx: Ctx) {
        collect_call_sites(expr, ctx.function, &mut self.sites);
        let mut branches = 0usize;
        let mut lambdas = Vec::new();
        expr.walk(&mut |e| match &e.kind {
            ExprKind::BoolOp { .. } | ExprKind::IfExp { .. } => branches += 1,
            ExprKind::Comprehension { clauses, .. } => {
                branches += clauses
                    .iter()
                    .filter(|c| matches!(c, CompClause::If(_)))
                    .count();
            }
            ExprKind::Lambda(id) => lambdas.push(*id),
            _ => {}
        });
        self.add_complexity(ctx, branches);
        for id in lambdas {
            self.visit_function(id, ctx);
        }
    }

    // -----------------------------------------------------------------------
    // Assembly
    // -----------------------------------------------------------------------

    fn finish(self) -> StaticFacts {
        let program = self.program;
        let (graph, resolution) = build_call_graph(program, &self.sites);
        let recursive = graph.recursive_functions();

        let mut functions = Vec::new();
        for def in program.named_functions() {
            let mut calls: Vec<String> = Vec::new();
            for site in self.sites.iter().filter(|s| {
                s.caller == Some(def.id) && !s.is_attribute_call()
            }) {
                if !calls.contains(&site.callee_name) {
                    calls.push(site.callee_name.clone());
                }
            }
            // Calls made inside lambdas count for the enclosing function.
            for site in self.sites.iter().filter(|s| {
                s.caller.is_some_and(|c| {
                    program.function(c).is_lambda && nearest_named(program, c) == Some(def.id)
                }) && !s.is_attribute_call()
            }) {
                if !calls.contains(&site.callee_name) {
                    calls.push(site.callee_name.clone());
                }
            }
            let stats = &self.stats[def.id];
            functions.push(FunctionInfo {
                name: def.name.clone(),
                qualified_name: def.qualified_name.clone(),
                display_name: self.labels[def.id].clone(),
                parameters: def
                    .params
                    .iter()
                    .map(|p| match p.kind {
                        ParamKind::VarArgs => format!("*{}", p.name),
                        ParamKind::KwArgs => format!("**{}", p.name),
                        _ => p.name.clone(),
                    })
                    .collect(),
                start_line: def.span.start_line.clamp(1, self.line_limit),
                end_line: def.span.end_line.clamp(1, self.line_limit),
                is_recursive: recursive.contains(&def.id),
                calls,
                parent: def.parent.map(|p| self.labels[p].clone()),
                has_conditionals: stats.has_conditionals,
                has_loops: stats.has_loops,
                return_count: stats.return_count,
                cyclomatic_complexity: stats.complexity,
            });
        }

        let function_calls: Vec<CallSiteInfo> = self
            .sites
            .iter()
            .zip(resolution.iter())
            .map(|(site, target)| CallSiteInfo {
                callee: site.callee_name.clone(),
                line: site.line_number.clamp(1, self.line_limit),
                argument_count: site.argument_count,
                caller: match site.caller.and_then(|c| nearest_named(program, c)) {
                    Some(id) => self.labels[id].clone(),
                    None => GLOBAL_SCOPE.to_string(),
                },
                resolved: target.map(|t| self.labels[t].clone()),
            })
            .collect();

        let variables: Vec<VariableInfo> = self
            .variables
            .into_iter()
            .map(|((scope_owner, name), line)| VariableInfo {
                name,
                first_assignment_line: line,
                scope_owner,
            })
            .collect();

        let summary = StaticSummary {
            total_functions: functions.len(),
            total_variables: variables.len(),
            total_loops: self.loops.len(),
            total_conditionals: self.conditionals.len(),
            total_calls: function_calls.len(),
            total_lines: program.line_count,
            max_loop_nesting: self.loops.iter().map(|l| l.nesting_depth).max().unwrap_or(0),
            module_complexity: self.module_complexity,
            has_recursion: functions.iter().any(|f| f.is_recursive),
        };

        StaticFacts {
            functions,
            variables,
            loops: self.loops,
            conditionals: self.conditionals,
            function_calls,
            summary,
        }
    }
}

/// Qualified name of every function, suffixed with its definition line
/// when a redefinition reuses the same qualified name.
fn function_labels(program: &Program) -> Vec<String> {
    let mut uses: HashMap<&str, usize> = HashMap::new();
    for def in &program.functions {
        *uses.entry(def.qualified_name.as_str()).or_default() += 1;
    }
    program
        .functions
        .iter()
        .map(|def| {
            if uses[def.qualified_name.as_str()] > 1 {
                format!("{} (line {})", def.qualified_name, def.span.start_line)
            } else {
                def.qualified_name.clone()
            }
        })
        .collect()
}

fn nearest_named(program: &Program, id: FunctionId) -> Option<FunctionId> {
    let mut current = Some(id);
    while let Some(c) = current {
        let def = program.function(c);
        if !def.is_lambda {
            return Some(c);
        }
        current = def.parent;
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(src: &str) -> StaticFacts {
        analyze_source(src).unwrap().1
    }

    #[test]
    fn test_direct_recursion_detected() {
        let f = facts("def f(n):\n    return 1 if n <= 1 else n * f(n - 1)\n\nprint(f(5))\n");
        assert_eq!(f.functions.len(), 1);
        assert!(f.functions[0].is_recursive);
        assert!(f.summary.has_recursion);
        assert_eq!(f.functions[0].calls, vec!["f"]);
        assert_eq!(f.functions[0].cyclomatic_complexity, 2);
    }

    #[test]
    fn test_mutual_recursion_detected() {
        let src = "def is_even(n):\n    if n == 0:\n        return True\n    return is_odd(n - 1)\n\ndef is_odd(n):\n    if n == 0:\n        return False\n    return is_even(n - 1)\n\ndef show(n):\n    print(is_even(n))\n";
        let f = facts(src);
        let recursive: Vec<&str> = f.recursive_functions().map(|x| x.name.as_str()).collect();
        assert_eq!(recursive, vec!["is_even", "is_odd"]);
        assert_eq!(f.functions[0].return_count, 2);
    }

    #[test]
    fn test_redefinitions_get_distinct_display_names() {
        let f = facts("def f(n):\n    return n\ndef f(n):\n    return f(n - 1) if n else 0\nf(2)\n");
        let names: Vec<&str> = f.functions.iter().map(|x| x.display_name.as_str()).collect();
        assert_eq!(names, vec!["f (line 1)", "f (line 3)"]);
        assert!(!f.functions[0].is_recursive);
        assert!(f.functions[1].is_recursive);
        let module_call = f.function_calls.iter().find(|c| c.caller == GLOBAL_SCOPE).unwrap();
        assert_eq!(module_call.resolved.as_deref(), Some("f (line 3)"));
        assert_eq!(f.function("f (line 3)").unwrap().start_line, 3);
    }

    #[test]
    fn test_builtin_calls_are_unresolved() {
        let f = facts("def len2(x):\n    return len(x)\n");
        assert!(!f.functions[0].is_recursive);
        assert_eq!(f.function_calls[0].callee, "len");
        assert_eq!(f.function_calls[0].resolved, None);
        assert_eq!(f.function_calls[0].caller, "len2");
    }

    #[test]
    fn test_loop_nesting_and_owner() {
        let src = "def grid(n):\n    for i in range(n):\n        for j in range(n):\n            print(i, j)\nwhile False:\n    pass\n";
        let f = facts(src);
        assert_eq!(f.loops.len(), 3);
        assert_eq!(f.loops[0].nesting_depth, 0);
        assert_eq!(f.loops[1].nesting_depth, 1);
        assert_eq!(f.loops[1].loop_variable.as_deref(), Some("j"));
        assert_eq!(f.loops[0].owner, "grid");
        assert_eq!(f.loops[2].owner, GLOBAL_SCOPE);
        assert_eq!(f.loops[2].kind, LoopKind::While);
        assert_eq!(f.summary.max_loop_nesting, 1);
    }

    #[test]
    fn test_conditional_chain_counts_branches() {
        let src = "x = 5\nif x > 3:\n    y = 1\nelif x > 1:\n    y = 2\nelse:\n    y = 3\n";
        let f = facts(src);
        assert_eq!(f.conditionals.len(), 1);
        let c = &f.conditionals[0];
        assert_eq!(c.branch_count, 3);
        assert!(c.has_elif && c.has_else);
        assert_eq!((c.start_line, c.end_line), (2, 7));
    }

    #[test]
    fn test_variables_tracked_per_scope() {
        let src = "x = 1\ndef f():\n    x = 2\n    return x\ndef g():\n    global x\n    x = 3\n";
        let f = facts(src);
        let owners: Vec<(String, String)> = f
            .variables
            .iter()
            .map(|v| (v.scope_owner.clone(), v.name.clone()))
            .collect();
        assert_eq!(
            owners,
            vec![
                ("global".to_string(), "x".to_string()),
                ("f".to_string(), "x".to_string()),
            ]
        );
    }

    #[test]
    fn test_empty_function_body() {
        let f = facts("def noop():\n    pass\n\ndef other(a, *rest):\n    return a\n");
        assert!(f.functions[0].calls.is_empty());
        assert_eq!(f.functions[1].parameters, vec!["a", "*rest"]);
        assert_eq!(f.summary.total_lines, 5);
    }
}
