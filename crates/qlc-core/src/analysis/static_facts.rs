//! Serializable records produced by the static analyzer.

use serde::{Deserialize, Serialize};

/// Scope owner name used for module-level bindings and loops.
pub const GLOBAL_SCOPE: &str = "global";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
    pub qualified_name: String,
    /// Unique among the program's functions: the qualified name, plus
    /// `(line N)` when several definitions share it.
    pub display_name: String,
    pub parameters: Vec<String>,
    pub start_line: usize,
    pub end_line: usize,
    pub is_recursive: bool,
    /// Distinct callee names in first-seen order, builtins included.
    pub calls: Vec<String>,
    pub parent: Option<String>,
    pub has_conditionals: bool,
    pub has_loops: bool,
    pub return_count: usize,
    pub cyclomatic_complexity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    pub first_assignment_line: usize,
    pub scope_owner: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    For,
    While,
}

impl LoopKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopKind::For => "for",
            LoopKind::While => "while",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopInfo {
    pub kind: LoopKind,
    pub start_line: usize,
    pub end_line: usize,
    /// Number of enclosing loops within the same function body.
    pub nesting_depth: usize,
    pub loop_variable: Option<String>,
    pub owner: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalInfo {
    pub start_line: usize,
    pub end_line: usize,
    pub branch_count: usize,
    pub has_elif: bool,
    pub has_else: bool,
}

/// One call site, resolved or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSiteInfo {
    pub callee: String,
    pub line: usize,
    pub argument_count: usize,
    /// Display name of the calling function, or `global`.
    pub caller: String,
    /// Display name of the user-defined target when resolution succeeded.
    pub resolved: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticSummary {
    pub total_functions: usize,
    pub total_variables: usize,
    pub total_loops: usize,
    pub total_conditionals: usize,
    pub total_calls: usize,
    pub total_lines: usize,
    pub max_loop_nesting: usize,
    pub module_complexity: usize,
    pub has_recursion: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticFacts {
    pub functions: Vec<FunctionInfo>,
    pub variables: Vec<VariableInfo>,
    pub loops: Vec<LoopInfo>,
    pub conditionals: Vec<ConditionalInfo>,
    pub function_calls: Vec<CallSiteInfo>,
    pub summary: StaticSummary,
}

impl StaticFacts {
    /// Looks a function up by its display name.
    pub fn function(&self, display_name: &str) -> Option<&FunctionInfo> {
        self.functions
            .iter()
            .find(|f| f.display_name == display_name)
    }

    pub fn recursive_functions(&self) -> impl Iterator<Item = &FunctionInfo> {
        self.functions.iter().filter(|f| f.is_recursive)
    }

    /// Call sites whose caller is `display_name`.
    pub fn calls_from<'a>(&'a self, display_name: &'a str) -> impl Iterator<Item = &'a CallSiteInfo> {
        self.function_calls
            .iter()
            .filter(move |c| c.caller == display_name)
    }

    /// Qualified names of functions whose name is `name`, in declaration order.
    pub fn qualified_names_for(&self, name: &str) -> Vec<&str> {
        self.functions
            .iter()
            .filter(|f| f.name == name)
            .map(|f| f.qualified_name.as_str())
            .collect()
    }
}
