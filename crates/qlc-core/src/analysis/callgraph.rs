//! Call graph construction over the Program Model.
//!
//! Call sites are collected during the static traversal, resolved by static
//! name lookup through the visible scopes (own nested definitions, enclosing
//! functions, then module level), and fed into a `petgraph` digraph. A
//! function is recursive iff it sits in a strongly connected component with
//! more than one member or has a self edge.

use std::collections::HashSet;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::program::ast::{Arg, Expr, ExprKind, FunctionId, Program};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A single call site found in the Program Model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    pub callee_name: String,
    pub line_number: usize,
    /// Receiver text for attribute calls such as `items.append(x)`.
    pub receiver_name: Option<String>,
    pub argument_count: usize,
    /// Function whose body contains the call; `None` for module level.
    pub caller: Option<FunctionId>,
}

impl CallSite {
    pub fn is_attribute_call(&self) -> bool {
        self.receiver_name.is_some()
    }
}

/// A resolved call edge between two user-defined functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallEdge {
    pub source: FunctionId,
    pub target: FunctionId,
    pub line_number: usize,
}

// ---------------------------------------------------------------------------
// Call extraction
// ---------------------------------------------------------------------------

/// Append every call inside `expr` to `out`, in evaluation-ish pre-order.
pub fn collect_call_sites(expr: &Expr, caller: Option<FunctionId>, out: &mut Vec<CallSite>) {
    expr.walk(&mut |e| {
        let ExprKind::Call { func, args } = &e.kind else {
            return;
        };
        let (callee_name, receiver_name) = match &func.kind {
            ExprKind::Name(name) => (name.clone(), None),
            ExprKind::Attribute { value, attr } => {
                let receiver = match &value.kind {
                    ExprKind::Name(n) => n.clone(),
                    _ => "<expr>".to_string(),
                };
                (attr.clone(), Some(receiver))
            }
            _ => return,
        };
        out.push(CallSite {
            callee_name,
            line_number: e.line,
            receiver_name,
            argument_count: args
                .iter()
                .filter(|a| !matches!(a, Arg::DoubleStarred(_)))
                .count(),
            caller,
        });
    });
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve a plain-name call made from `caller` to a user function.
///
/// Attribute calls and builtins never resolve. A scope that binds `name` to
/// something other than a definition (a parameter, say) shadows outer
/// definitions and makes the call unresolved.
pub fn resolve_callee(
    program: &Program,
    caller: Option<FunctionId>,
    name: &str,
    line: usize,
) -> Option<FunctionId> {
    let mut scope = caller;
    if let Some(id) = caller {
        if program.function(id).globals.contains(name) {
            scope = None;
        }
    }
    loop {
        if let Some(found) = definition_in_scope(program, scope, name, line) {
            return Some(found);
        }
        let id = scope?;
        let def = program.function(id);
        if def.locals.contains(name) && !def.nonlocals.contains(name) {
            return None;
        }
        scope = def.parent;
    }
}

/// Latest named definition of `name` directly inside `scope` that starts at
/// or before `line`, falling back to the first one.
fn definition_in_scope(
    program: &Program,
    scope: Option<FunctionId>,
    name: &str,
    line: usize,
) -> Option<FunctionId> {
    let candidates: Vec<&crate::program::ast::FunctionDef> = program
        .named_functions()
        .filter(|f| f.parent == scope && f.name == name)
        .collect();
    candidates
        .iter()
        .rev()
        .find(|f| f.span.start_line <= line)
        .or_else(|| candidates.first())
        .map(|f| f.id)
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Directed call graph over all functions of a program, lambdas included.
pub struct CallGraph {
    graph: DiGraph<FunctionId, usize>,
    nodes: Vec<NodeIndex>,
}

impl CallGraph {
    pub fn new(function_count: usize) -> Self {
        let mut graph = DiGraph::with_capacity(function_count, function_count * 2);
        let nodes = (0..function_count).map(|id| graph.add_node(id)).collect();
        Self { graph, nodes }
    }

    pub fn add_edge(&mut self, edge: CallEdge) {
        let (Some(&a), Some(&b)) = (self.nodes.get(edge.source), self.nodes.get(edge.target))
        else {
            return;
        };
        if self.graph.find_edge(a, b).is_none() {
            self.graph.add_edge(a, b, edge.line_number);
        }
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Functions on a call cycle, including direct self-recursion.
    pub fn recursive_functions(&self) -> HashSet<FunctionId> {
        let mut recursive = HashSet::new();
        for component in tarjan_scc(&self.graph) {
            if component.len() > 1 {
                recursive.extend(component.iter().map(|n| self.graph[*n]));
            } else if let Some(&node) = component.first() {
                if self.graph.find_edge(node, node).is_some() {
                    recursive.insert(self.graph[node]);
                }
            }
        }
        recursive
    }
}

/// Resolve every call site and build the graph. Returns the graph and the
/// per-site resolution, aligned with `sites`.
pub fn build_call_graph(program: &Program, sites: &[CallSite]) -> (CallGraph, Vec<Option<FunctionId>>) {
    let mut graph = CallGraph::new(program.functions.len());
    let mut resolution = Vec::with_capacity(sites.len());
    for site in sites {
        let target = if site.is_attribute_call() {
            None
        } else {
            resolve_callee(program, site.caller, &site.callee_name, site.line_number)
        };
        if let (Some(source), Some(target)) = (site.caller, target) {
            graph.add_edge(CallEdge {
                source,
                target,
                line_number: site.line_number,
            });
        }
        resolution.push(target);
    }
    (graph, resolution)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scc_marks_mutual_recursion() {
        let mut graph = CallGraph::new(4);
        graph.add_edge(CallEdge { source: 0, target: 1, line_number: 2 });
        graph.add_edge(CallEdge { source: 1, target: 0, line_number: 5 });
        graph.add_edge(CallEdge { source: 2, target: 2, line_number: 8 });
        graph.add_edge(CallEdge { source: 3, target: 0, line_number: 9 });
        let recursive = graph.recursive_functions();
        assert!(recursive.contains(&0));
        assert!(recursive.contains(&1));
        assert!(recursive.contains(&2));
        assert!(!recursive.contains(&3));
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let mut graph = CallGraph::new(2);
        graph.add_edge(CallEdge { source: 0, target: 1, line_number: 2 });
        graph.add_edge(CallEdge { source: 0, target: 1, line_number: 3 });
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_resolution_respects_shadowing_parameter() {
        let src = "def helper():\n    return 1\ndef run(helper):\n    return helper()\ndef main():\n    return helper()\n";
        let program = crate::program::parse_program(src).unwrap();
        assert_eq!(resolve_callee(&program, Some(1), "helper", 4), None);
        assert_eq!(resolve_callee(&program, Some(2), "helper", 6), Some(0));
        assert_eq!(resolve_callee(&program, None, "print", 7), None);
    }

    #[test]
    fn test_resolution_prefers_nested_definition() {
        let src = "def step():\n    return 0\ndef outer():\n    def step():\n        return 1\n    return step()\n";
        let program = crate::program::parse_program(src).unwrap();
        let resolved = resolve_callee(&program, Some(1), "step", 6);
        assert_eq!(resolved, Some(2));
        assert_eq!(program.function(2).qualified_name, "outer.step");
    }
}
