//! Lowering from the tree-sitter concrete syntax tree into the owned
//! Program Model.
//!
//! Structural errors the grammar accepts but the language rejects (`return`
//! outside a function, `break` outside a loop, bad assignment targets, ...)
//! are reported here as [`SyntaxError`]s.

use std::collections::BTreeSet;

use num_bigint::BigInt;
use num_traits::Num;
use tree_sitter::Node;

use super::ast::*;
use super::parser::{count_lines, syntax_error_at, ParsedSource};
use crate::engine::guards::MAX_SYNTAX_DEPTH;
use crate::errors::SyntaxError;

type LResult<T> = Result<T, SyntaxError>;

/// Lower a parsed source unit into a [`Program`].
pub fn lower(parsed: &ParsedSource<'_>) -> LResult<Program> {
    let mut lowerer = Lowerer {
        src: parsed.source,
        line_count: count_lines(parsed.source).max(1),
        functions: Vec::new(),
        scopes: vec![ScopeCtx::new(None)],
        depth: 0,
    };
    let body = lowerer.lower_block(parsed.root())?;
    Ok(Program {
        body,
        functions: lowerer.functions,
        line_count: count_lines(parsed.source),
    })
}

struct ScopeCtx {
    function: Option<FunctionId>,
    loop_depth: usize,
    comprehension_depth: usize,
    bound: BTreeSet<String>,
    globals: BTreeSet<String>,
    nonlocals: BTreeSet<String>,
}

impl ScopeCtx {
    fn new(function: Option<FunctionId>) -> Self {
        Self {
            function,
            loop_depth: 0,
            comprehension_depth: 0,
            bound: BTreeSet::new(),
            globals: BTreeSet::new(),
            nonlocals: BTreeSet::new(),
        }
    }
}

struct Lowerer<'s> {
    src: &'s str,
    line_count: usize,
    functions: Vec<FunctionDef>,
    scopes: Vec<ScopeCtx>,
    depth: usize,
}

fn line_of(node: Node<'_>) -> usize {
    node.start_position().row + 1
}

/// Children that carry syntax, without comments and line continuations.
fn named_children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor)
        .filter(|c| !matches!(c.kind(), "comment" | "line_continuation"))
        .collect()
}

fn first_named(node: Node<'_>) -> Option<Node<'_>> {
    named_children(node).into_iter().next()
}

impl<'s> Lowerer<'s> {
    fn text(&self, node: Node<'_>) -> &'s str {
        let src: &'s str = self.src;
        src.get(node.start_byte()..node.end_byte()).unwrap_or("")
    }

    fn span(&self, node: Node<'_>) -> Span {
        let start = node.start_position();
        let end = node.end_position();
        let mut end_line = if end.column == 0 && end.row > start.row {
            end.row
        } else {
            end.row + 1
        };
        end_line = end_line.clamp(start.row + 1, self.line_count.max(start.row + 1));
        Span {
            start_line: start.row + 1,
            end_line,
            column: start.column + 1,
        }
    }

    fn scope(&mut self) -> &mut ScopeCtx {
        let last = self.scopes.len() - 1;
        &mut self.scopes[last]
    }

    fn bind(&mut self, name: &str) {
        let scope = self.scope();
        if scope.comprehension_depth == 0 {
            scope.bound.insert(name.to_string());
        }
    }

    fn descend(&mut self, node: Node<'_>) -> LResult<()> {
        if self.depth >= MAX_SYNTAX_DEPTH {
            return Err(syntax_error_at(node, "too many nested blocks or expressions"));
        }
        self.depth += 1;
        Ok(())
    }

    fn required<'t>(&self, node: Node<'t>, field: &str) -> LResult<Node<'t>> {
        node.child_by_field_name(field).ok_or_else(|| {
            syntax_error_at(node, format!("incomplete {}", node.kind().replace('_', " ")))
        })
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn lower_block(&mut self, node: Node<'_>) -> LResult<Vec<Stmt>> {
        let mut out = Vec::new();
        for child in named_children(node) {
            out.push(self.lower_stmt(child)?);
        }
        Ok(out)
    }

    fn lower_stmt(&mut self, node: Node<'_>) -> LResult<Stmt> {
        self.descend(node)?;
        let result = self.lower_stmt_inner(node);
        self.depth -= 1;
        result
    }

    fn lower_stmt_inner(&mut self, node: Node<'_>) -> LResult<Stmt> {
        let span = self.span(node);
        let kind = match node.kind() {
            "expression_statement" => self.lower_expression_statement(node)?,
            "if_statement" => self.lower_if(node)?,
            "for_statement" => self.lower_for(node)?,
            "while_statement" => self.lower_while(node)?,
            "function_definition" => StmtKind::FunctionDef(self.lower_function(node)?),
            "decorated_definition" => {
                if let Some(def) = node.child_by_field_name("definition") {
                    if def.kind() == "function_definition" {
                        self.lower_function(def)?;
                    }
                }
                StmtKind::Unsupported {
                    construct: "decorator".to_string(),
                }
            }
            "return_statement" => {
                if self.scope().function.is_none() {
                    return Err(syntax_error_at(node, "'return' outside function"));
                }
                let value = match first_named(node) {
                    Some(child) => Some(self.lower_rhs(child)?),
                    None => None,
                };
                StmtKind::Return(value)
            }
            "pass_statement" => StmtKind::Pass,
            "break_statement" | "continue_statement" => {
                if self.scope().loop_depth == 0 {
                    let word = if node.kind() == "break_statement" {
                        "break"
                    } else {
                        "continue"
                    };
                    return Err(syntax_error_at(
                        node,
                        format!("'{word}' outside loop"),
                    ));
                }
                if node.kind() == "break_statement" {
                    StmtKind::Break
                } else {
                    StmtKind::Continue
                }
            }
            "global_statement" => {
                let names = self.declared_names(node);
                let scope = self.scope();
                scope.globals.extend(names.iter().cloned());
                StmtKind::Global(names)
            }
            "nonlocal_statement" => {
                if self.scope().function.is_none() {
                    return Err(syntax_error_at(
                        node,
                        "nonlocal declaration not allowed at module level",
                    ));
                }
                let names = self.declared_names(node);
                let scope = self.scope();
                scope.nonlocals.extend(names.iter().cloned());
                StmtKind::Nonlocal(names)
            }
            "assert_statement" => {
                let parts = named_children(node);
                let test = match parts.first() {
                    Some(n) => self.lower_expr(*n)?,
                    None => return Err(syntax_error_at(node, "assert needs a condition")),
                };
                let msg = match parts.get(1) {
                    Some(n) => Some(self.lower_expr(*n)?),
                    None => None,
                };
                StmtKind::Assert { test, msg }
            }
            "raise_statement" => {
                let cause = node.child_by_field_name("cause").map(|c| c.id());
                let exc = named_children(node)
                    .into_iter()
                    .find(|c| Some(c.id()) != cause);
                let exc = match exc {
                    Some(n) => Some(self.lower_rhs(n)?),
                    None => None,
                };
                StmtKind::Raise(exc)
            }
            "try_statement" => self.lower_try(node)?,
            "delete_statement" => {
                let mut targets = Vec::new();
                for child in named_children(node) {
                    if child.kind() == "expression_list" {
                        for item in named_children(child) {
                            targets.push(self.lower_target(item)?);
                        }
                    } else {
                        targets.push(self.lower_target(child)?);
                    }
                }
                StmtKind::Delete(targets)
            }
            "class_definition" => {
                if let Some(name) = node.child_by_field_name("name") {
                    let name = self.text(name);
                    self.bind(name);
                }
                StmtKind::Unsupported {
                    construct: "class definition".to_string(),
                }
            }
            "import_statement" | "import_from_statement" | "future_import_statement" => {
                StmtKind::Unsupported {
                    construct: "import".to_string(),
                }
            }
            "with_statement" => StmtKind::Unsupported {
                construct: "with statement".to_string(),
            },
            "match_statement" => StmtKind::Unsupported {
                construct: "match statement".to_string(),
            },
            "print_statement" => {
                return Err(syntax_error_at(
                    node,
                    "Missing parentheses in call to 'print'",
                ))
            }
            "exec_statement" => {
                return Err(syntax_error_at(
                    node,
                    "Missing parentheses in call to 'exec'",
                ))
            }
            "ERROR" => return Err(syntax_error_at(node, "invalid syntax")),
            other => StmtKind::Unsupported {
                construct: other.replace('_', " "),
            },
        };
        Ok(Stmt { span, kind })
    }

    fn declared_names(&self, node: Node<'_>) -> Vec<String> {
        named_children(node)
            .into_iter()
            .filter(|c| matches!(c.kind(), "identifier" | "keyword_identifier"))
            .map(|c| self.text(c).to_string())
            .collect()
    }

    fn lower_expression_statement(&mut self, node: Node<'_>) -> LResult<StmtKind> {
        let children = named_children(node);
        if children.len() > 1 {
            let line = line_of(node);
            let mut items = Vec::with_capacity(children.len());
            for child in children {
                items.push(self.lower_expr(child)?);
            }
            return Ok(StmtKind::Expr(Expr::new(line, ExprKind::Tuple(items))));
        }
        let Some(child) = children.into_iter().next() else {
            return Ok(StmtKind::Pass);
        };
        match child.kind() {
            "assignment" => self.lower_assignment(child),
            "augmented_assignment" => self.lower_aug_assignment(child),
            _ => Ok(StmtKind::Expr(self.lower_rhs(child)?)),
        }
    }

    fn lower_assignment(&mut self, node: Node<'_>) -> LResult<StmtKind> {
        let mut targets = Vec::new();
        let mut current = node;
        loop {
            let left = self.required(current, "left")?;
            let Some(right) = current.child_by_field_name("right") else {
                // Bare annotation such as `x: int`.
                if targets.is_empty() {
                    return Ok(StmtKind::Pass);
                }
                return Err(syntax_error_at(current, "invalid syntax"));
            };
            targets.push(left);
            match right.kind() {
                "assignment" => current = right,
                "augmented_assignment" => {
                    return Err(syntax_error_at(right, "invalid syntax"));
                }
                _ => {
                    let value = self.lower_rhs(right)?;
                    let mut lowered = Vec::with_capacity(targets.len());
                    for target in targets {
                        lowered.push(self.lower_target(target)?);
                    }
                    return Ok(StmtKind::Assign {
                        targets: lowered,
                        value,
                    });
                }
            }
        }
    }

    fn lower_aug_assignment(&mut self, node: Node<'_>) -> LResult<StmtKind> {
        let left = self.required(node, "left")?;
        let right = self.required(node, "right")?;
        let op_node = self.required(node, "operator")?;
        let op = BinOp::from_symbol(self.text(op_node))
            .ok_or_else(|| syntax_error_at(op_node, "unknown augmented operator"))?;
        if !matches!(left.kind(), "identifier" | "keyword_identifier" | "attribute" | "subscript") {
            return Err(syntax_error_at(
                left,
                "illegal expression for augmented assignment",
            ));
        }
        let value = self.lower_rhs(right)?;
        let target = self.lower_target(left)?;
        Ok(StmtKind::AugAssign { target, op, value })
    }

    fn lower_if(&mut self, node: Node<'_>) -> LResult<StmtKind> {
        let mut branches = Vec::new();
        let test = self.lower_expr(self.required(node, "condition")?)?;
        let body = self.lower_block(self.required(node, "consequence")?)?;
        branches.push(IfBranch {
            line: line_of(node),
            test,
            body,
        });
        let mut orelse = None;
        let mut cursor = node.walk();
        let alternatives: Vec<Node<'_>> =
            node.children_by_field_name("alternative", &mut cursor).collect();
        for alt in alternatives {
            match alt.kind() {
                "elif_clause" => {
                    let test = self.lower_expr(self.required(alt, "condition")?)?;
                    let body = self.lower_block(self.required(alt, "consequence")?)?;
                    branches.push(IfBranch {
                        line: line_of(alt),
                        test,
                        body,
                    });
                }
                "else_clause" => {
                    orelse = Some(self.lower_block(self.required(alt, "body")?)?);
                }
                _ => {}
            }
        }
        Ok(StmtKind::If { branches, orelse })
    }

    fn lower_loop_body(&mut self, body: Node<'_>) -> LResult<Vec<Stmt>> {
        self.scope().loop_depth += 1;
        let lowered = self.lower_block(body);
        self.scope().loop_depth -= 1;
        lowered
    }

    fn lower_else(&mut self, node: Node<'_>) -> LResult<Option<Vec<Stmt>>> {
        match node.child_by_field_name("alternative") {
            Some(alt) => Ok(Some(self.lower_block(self.required(alt, "body")?)?)),
            None => Ok(None),
        }
    }

    fn lower_for(&mut self, node: Node<'_>) -> LResult<StmtKind> {
        let iter = self.lower_rhs(self.required(node, "right")?)?;
        let target = self.lower_target(self.required(node, "left")?)?;
        let body = self.lower_loop_body(self.required(node, "body")?)?;
        let orelse = self.lower_else(node)?;
        Ok(StmtKind::For {
            target,
            iter,
            body,
            orelse,
        })
    }

    fn lower_while(&mut self, node: Node<'_>) -> LResult<StmtKind> {
        let test = self.lower_expr(self.required(node, "condition")?)?;
        let body = self.lower_loop_body(self.required(node, "body")?)?;
        let orelse = self.lower_else(node)?;
        Ok(StmtKind::While { test, body, orelse })
    }

    fn lower_try(&mut self, node: Node<'_>) -> LResult<StmtKind> {
        let body = self.lower_block(self.required(node, "body")?)?;
        let mut handlers = Vec::new();
        let mut orelse = None;
        let mut finalbody = None;
        for child in named_children(node) {
            match child.kind() {
                "except_clause" | "except_group_clause" => {
                    handlers.push(self.lower_except(child)?);
                }
                "else_clause" => {
                    orelse = Some(self.lower_block(self.required(child, "body")?)?);
                }
                "finally_clause" => {
                    let block = named_children(child)
                        .into_iter()
                        .find(|c| c.kind() == "block");
                    finalbody = Some(match block {
                        Some(b) => self.lower_block(b)?,
                        None => Vec::new(),
                    });
                }
                _ => {}
            }
        }
        Ok(StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
        })
    }

    /// Accepts both `except_clause` shapes the grammar has produced over
    /// time: `[type, alias?, block]` and `[as_pattern(type, target), block]`.
    fn lower_except(&mut self, node: Node<'_>) -> LResult<ExceptHandler> {
        let mut exc_type = None;
        let mut alias = None;
        let mut body = Vec::new();
        let mut header = Vec::new();
        for child in named_children(node) {
            if child.kind() == "block" {
                body = self.lower_block(child)?;
            } else {
                header.push(child);
            }
        }
        if let Some(first) = header.first().copied() {
            if first.kind() == "as_pattern" {
                let parts = named_children(first);
                if let Some(ty) = parts.first() {
                    exc_type = Some(self.lower_expr(*ty)?);
                }
                if let Some(target) = parts.get(1) {
                    let ident = first_named(*target).unwrap_or(*target);
                    alias = Some(self.text(ident).to_string());
                }
            } else {
                exc_type = Some(self.lower_expr(first)?);
                if let Some(name) = header.get(1) {
                    alias = Some(self.text(*name).to_string());
                }
            }
        }
        if let Some(name) = &alias {
            let name = name.clone();
            self.bind(&name);
        }
        Ok(ExceptHandler {
            line: line_of(node),
            exc_type,
            alias,
            body,
        })
    }

    // -----------------------------------------------------------------------
    // Functions
    // -----------------------------------------------------------------------

    fn reserve_function(&mut self, name: &str, node: Node<'_>, is_lambda: bool) -> FunctionId {
        let id = self.functions.len();
        let parent = self.scopes.last().and_then(|s| s.function);
        let qualified_name = match parent {
            Some(p) => format!("{}.{}", self.functions[p].qualified_name, name),
            None => name.to_string(),
        };
        self.functions.push(FunctionDef {
            id,
            name: name.to_string(),
            qualified_name,
            params: Vec::new(),
            body: FunctionBody::Block(Vec::new()),
            span: self.span(node),
            parent,
            is_lambda,
            locals: BTreeSet::new(),
            globals: BTreeSet::new(),
            nonlocals: BTreeSet::new(),
        });
        id
    }

    fn lower_function(&mut self, node: Node<'_>) -> LResult<FunctionId> {
        let name_node = self.required(node, "name")?;
        let name = self.text(name_node).to_string();
        self.bind(&name);
        let params = match node.child_by_field_name("parameters") {
            Some(p) => self.lower_params(p)?,
            None => Vec::new(),
        };
        let id = self.reserve_function(&name, node, false);
        let body_node = self.required(node, "body")?;
        self.enter_function(id, &params);
        let body = self.lower_block(body_node);
        self.leave_function(id, params, body.map(FunctionBody::Block)?);
        Ok(id)
    }

    fn lower_lambda(&mut self, node: Node<'_>) -> LResult<FunctionId> {
        let params = match node.child_by_field_name("parameters") {
            Some(p) => self.lower_params(p)?,
            None => Vec::new(),
        };
        let id = self.reserve_function("<lambda>", node, true);
        let body_node = self.required(node, "body")?;
        self.enter_function(id, &params);
        let body = self.lower_expr(body_node);
        self.leave_function(id, params, body.map(|e| FunctionBody::Expr(Box::new(e)))?);
        Ok(id)
    }

    fn enter_function(&mut self, id: FunctionId, params: &[Param]) {
        let mut scope = ScopeCtx::new(Some(id));
        scope.bound.extend(params.iter().map(|p| p.name.clone()));
        self.scopes.push(scope);
    }

    fn leave_function(&mut self, id: FunctionId, params: Vec<Param>, body: FunctionBody) {
        let scope = self.scopes.pop().unwrap_or_else(|| ScopeCtx::new(Some(id)));
        let def = &mut self.functions[id];
        def.locals = scope
            .bound
            .iter()
            .filter(|n| !scope.globals.contains(*n) && !scope.nonlocals.contains(*n))
            .cloned()
            .collect();
        def.globals = scope.globals;
        def.nonlocals = scope.nonlocals;
        def.params = params;
        def.body = body;
    }

    /// Defaults are lowered in the enclosing scope, before the function's
    /// own scope is entered.
    fn lower_params(&mut self, node: Node<'_>) -> LResult<Vec<Param>> {
        let mut params: Vec<Param> = Vec::new();
        let mut keyword_only = false;
        for child in named_children(node) {
            let positional = if keyword_only {
                ParamKind::KeywordOnly
            } else {
                ParamKind::Positional
            };
            let (name_node, kind, default) = match child.kind() {
                "identifier" | "keyword_identifier" => (child, positional, None),
                "default_parameter" | "typed_default_parameter" => {
                    let name = self.required(child, "name")?;
                    let value = self.lower_expr(self.required(child, "value")?)?;
                    (name, positional, Some(value))
                }
                "typed_parameter" => {
                    let inner = first_named(child)
                        .ok_or_else(|| syntax_error_at(child, "invalid parameter"))?;
                    match inner.kind() {
                        "list_splat_pattern" => {
                            keyword_only = true;
                            (first_named(inner).unwrap_or(inner), ParamKind::VarArgs, None)
                        }
                        "dictionary_splat_pattern" => {
                            (first_named(inner).unwrap_or(inner), ParamKind::KwArgs, None)
                        }
                        _ => (inner, positional, None),
                    }
                }
                "list_splat_pattern" => {
                    keyword_only = true;
                    (first_named(child).unwrap_or(child), ParamKind::VarArgs, None)
                }
                "dictionary_splat_pattern" => {
                    (first_named(child).unwrap_or(child), ParamKind::KwArgs, None)
                }
                "keyword_separator" => {
                    keyword_only = true;
                    continue;
                }
                "positional_separator" => continue,
                _ => return Err(syntax_error_at(child, "invalid parameter")),
            };
            if name_node.kind() != "identifier" && name_node.kind() != "keyword_identifier" {
                return Err(syntax_error_at(name_node, "invalid parameter"));
            }
            let name = self.text(name_node).to_string();
            if params.iter().any(|p| p.name == name) {
                return Err(syntax_error_at(
                    name_node,
                    format!("duplicate argument '{name}' in function definition"),
                ));
            }
            if default.is_none()
                && kind == ParamKind::Positional
                && params
                    .iter()
                    .any(|p| p.kind == ParamKind::Positional && p.default.is_some())
            {
                return Err(syntax_error_at(
                    name_node,
                    "non-default argument follows default argument",
                ));
            }
            params.push(Param {
                name,
                default,
                kind,
            });
        }
        Ok(params)
    }

    // -----------------------------------------------------------------------
    // Targets
    // -----------------------------------------------------------------------

    fn lower_target(&mut self, node: Node<'_>) -> LResult<Target> {
        self.descend(node)?;
        let result = self.lower_target_inner(node);
        self.depth -= 1;
        result
    }

    fn lower_target_inner(&mut self, node: Node<'_>) -> LResult<Target> {
        match node.kind() {
            "identifier" | "keyword_identifier" => {
                let name = self.text(node).to_string();
                self.bind(&name);
                Ok(Target::Name(name))
            }
            "attribute" => {
                let value = self.lower_expr(self.required(node, "object")?)?;
                let attr = self.text(self.required(node, "attribute")?).to_string();
                Ok(Target::Attribute { value, attr })
            }
            "subscript" => {
                let value = self.lower_expr(self.required(node, "value")?)?;
                let index = self.lower_subscript_index(node)?;
                Ok(Target::Subscript { value, index })
            }
            "pattern_list" | "tuple_pattern" | "list_pattern" | "tuple" | "list"
            | "expression_list" => {
                let mut items = Vec::new();
                for child in named_children(node) {
                    items.push(self.lower_target(child)?);
                }
                if items.iter().filter(|t| matches!(t, Target::Starred(_))).count() > 1 {
                    return Err(syntax_error_at(
                        node,
                        "multiple starred expressions in assignment",
                    ));
                }
                Ok(Target::Tuple(items))
            }
            "parenthesized_expression" => match first_named(node) {
                Some(inner) => self.lower_target(inner),
                None => Err(syntax_error_at(node, "cannot assign to ()")),
            },
            "list_splat_pattern" | "list_splat" => match first_named(node) {
                Some(inner) => Ok(Target::Starred(Box::new(self.lower_target(inner)?))),
                None => Err(syntax_error_at(node, "invalid starred target")),
            },
            other => Err(syntax_error_at(
                node,
                format!("cannot assign to {}", other.replace('_', " ")),
            )),
        }
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    /// Right-hand sides may be bare tuples (`return a, b`).
    fn lower_rhs(&mut self, node: Node<'_>) -> LResult<Expr> {
        match node.kind() {
            "expression_list" | "pattern_list" => {
                let mut items = Vec::new();
                for child in named_children(node) {
                    items.push(self.lower_expr(child)?);
                }
                Ok(Expr::new(line_of(node), ExprKind::Tuple(items)))
            }
            _ => self.lower_expr(node),
        }
    }

    fn lower_expr(&mut self, node: Node<'_>) -> LResult<Expr> {
        self.descend(node)?;
        let result = self.lower_expr_inner(node);
        self.depth -= 1;
        result
    }

    fn lower_exprs(&mut self, nodes: Vec<Node<'_>>) -> LResult<Vec<Expr>> {
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            out.push(self.lower_expr(node)?);
        }
        Ok(out)
    }

    fn boxed(&mut self, node: Node<'_>, field: &str) -> LResult<Box<Expr>> {
        let child = self.required(node, field)?;
        Ok(Box::new(self.lower_expr(child)?))
    }

    fn lower_expr_inner(&mut self, node: Node<'_>) -> LResult<Expr> {
        let line = line_of(node);
        let kind = match node.kind() {
            "identifier" | "keyword_identifier" => ExprKind::Name(self.text(node).to_string()),
            "integer" => self.lower_integer(node)?,
            "float" => {
                let raw = self.text(node).replace('_', "");
                if raw.ends_with(['j', 'J']) {
                    ExprKind::Unsupported("complex number".to_string())
                } else {
                    let value = raw
                        .parse::<f64>()
                        .map_err(|_| syntax_error_at(node, "invalid float literal"))?;
                    ExprKind::Float(value)
                }
            }
            "true" => ExprKind::Bool(true),
            "false" => ExprKind::Bool(false),
            "none" | "ellipsis" => ExprKind::None,
            "string" => self.lower_string(node)?,
            "concatenated_string" => self.lower_concatenated(node)?,
            "list" => ExprKind::List(self.lower_elements(node)?),
            "tuple" | "expression_list" => ExprKind::Tuple(self.lower_elements(node)?),
            "set" => ExprKind::Set(self.lower_elements(node)?),
            "dictionary" => {
                let mut entries = Vec::new();
                for child in named_children(node) {
                    match child.kind() {
                        "pair" => {
                            let key = self.lower_expr(self.required(child, "key")?)?;
                            let value = self.lower_expr(self.required(child, "value")?)?;
                            entries.push((Some(key), value));
                        }
                        "dictionary_splat" => {
                            let inner = first_named(child)
                                .ok_or_else(|| syntax_error_at(child, "invalid syntax"))?;
                            entries.push((None, self.lower_expr(inner)?));
                        }
                        _ => return Err(syntax_error_at(child, "invalid dictionary entry")),
                    }
                }
                ExprKind::Dict(entries)
            }
            "parenthesized_expression" => match first_named(node) {
                Some(inner) if inner.kind() == "yield" => {
                    ExprKind::Unsupported("yield".to_string())
                }
                Some(inner) => return self.lower_expr(inner),
                None => ExprKind::Tuple(Vec::new()),
            },
            "list_splat" | "parenthesized_list_splat" => {
                let inner = first_named(node)
                    .ok_or_else(|| syntax_error_at(node, "invalid starred expression"))?;
                ExprKind::Starred(Box::new(self.lower_expr(inner)?))
            }
            "binary_operator" => {
                let op_node = self.required(node, "operator")?;
                let op = BinOp::from_symbol(self.text(op_node))
                    .ok_or_else(|| syntax_error_at(op_node, "unknown operator"))?;
                ExprKind::BinOp {
                    left: self.boxed(node, "left")?,
                    op,
                    right: self.boxed(node, "right")?,
                }
            }
            "unary_operator" => {
                let op = match self.text(self.required(node, "operator")?) {
                    "-" => UnaryOp::Neg,
                    "+" => UnaryOp::Pos,
                    _ => UnaryOp::Invert,
                };
                ExprKind::UnaryOp {
                    op,
                    operand: self.boxed(node, "argument")?,
                }
            }
            "not_operator" => ExprKind::UnaryOp {
                op: UnaryOp::Not,
                operand: self.boxed(node, "argument")?,
            },
            "boolean_operator" => {
                let op = match self.text(self.required(node, "operator")?) {
                    "and" => BoolOp::And,
                    _ => BoolOp::Or,
                };
                ExprKind::BoolOp {
                    op,
                    left: self.boxed(node, "left")?,
                    right: self.boxed(node, "right")?,
                }
            }
            "comparison_operator" => self.lower_comparison(node)?,
            "conditional_expression" => {
                let parts = named_children(node);
                if parts.len() != 3 {
                    return Err(syntax_error_at(node, "invalid conditional expression"));
                }
                ExprKind::IfExp {
                    body: Box::new(self.lower_expr(parts[0])?),
                    test: Box::new(self.lower_expr(parts[1])?),
                    orelse: Box::new(self.lower_expr(parts[2])?),
                }
            }
            "call" => self.lower_call(node)?,
            "attribute" => ExprKind::Attribute {
                value: self.boxed(node, "object")?,
                attr: self.text(self.required(node, "attribute")?).to_string(),
            },
            "subscript" => ExprKind::Subscript {
                value: self.boxed(node, "value")?,
                index: Box::new(self.lower_subscript_index(node)?),
            },
            "slice" => self.lower_slice(node)?,
            "lambda" => ExprKind::Lambda(self.lower_lambda(node)?),
            "list_comprehension" => self.lower_comprehension(node, CompKind::List)?,
            "set_comprehension" => self.lower_comprehension(node, CompKind::Set)?,
            "dictionary_comprehension" => self.lower_comprehension(node, CompKind::Dict)?,
            "generator_expression" => self.lower_comprehension(node, CompKind::Generator)?,
            "ERROR" => return Err(syntax_error_at(node, "invalid syntax")),
            other => ExprKind::Unsupported(other.replace('_', " ")),
        };
        Ok(Expr::new(line, kind))
    }

    fn lower_elements(&mut self, node: Node<'_>) -> LResult<Vec<Expr>> {
        self.lower_exprs(named_children(node))
    }

    fn lower_integer(&self, node: Node<'_>) -> LResult<ExprKind> {
        let raw = self.text(node).replace('_', "");
        if raw.ends_with(['j', 'J']) {
            return Ok(ExprKind::Unsupported("complex number".to_string()));
        }
        let lower = raw.to_ascii_lowercase();
        let (digits, radix) = if let Some(rest) = lower.strip_prefix("0x") {
            (rest.to_string(), 16)
        } else if let Some(rest) = lower.strip_prefix("0o") {
            (rest.to_string(), 8)
        } else if let Some(rest) = lower.strip_prefix("0b") {
            (rest.to_string(), 2)
        } else {
            (lower, 10)
        };
        BigInt::from_str_radix(&digits, radix)
            .map(ExprKind::Int)
            .map_err(|_| syntax_error_at(node, "invalid integer literal"))
    }

    fn lower_comparison(&mut self, node: Node<'_>) -> LResult<ExprKind> {
        let operands = named_children(node);
        let mut cursor = node.walk();
        let op_nodes: Vec<Node<'_>> =
            node.children_by_field_name("operators", &mut cursor).collect();
        if operands.len() < 2 || op_nodes.len() != operands.len() - 1 {
            return Err(syntax_error_at(node, "invalid comparison"));
        }
        let mut ops = Vec::with_capacity(op_nodes.len());
        for op_node in op_nodes {
            let op = CmpOp::from_symbol(self.text(op_node))
                .ok_or_else(|| syntax_error_at(op_node, "unknown comparison operator"))?;
            ops.push(op);
        }
        let mut iter = operands.into_iter();
        let left = match iter.next() {
            Some(first) => Box::new(self.lower_expr(first)?),
            None => return Err(syntax_error_at(node, "invalid comparison")),
        };
        let comparators = self.lower_exprs(iter.collect())?;
        Ok(ExprKind::Compare {
            left,
            ops,
            comparators,
        })
    }

    fn lower_call(&mut self, node: Node<'_>) -> LResult<ExprKind> {
        let func = self.boxed(node, "function")?;
        let arguments = self.required(node, "arguments")?;
        let mut args = Vec::new();
        if arguments.kind() == "generator_expression" {
            args.push(Arg::Positional(self.lower_expr(arguments)?));
            return Ok(ExprKind::Call { func, args });
        }
        let mut seen_keyword = false;
        for child in named_children(arguments) {
            match child.kind() {
                "keyword_argument" => {
                    seen_keyword = true;
                    let name = self.text(self.required(child, "name")?).to_string();
                    let value = self.lower_expr(self.required(child, "value")?)?;
                    if args
                        .iter()
                        .any(|a| matches!(a, Arg::Keyword(n, _) if *n == name))
                    {
                        return Err(syntax_error_at(
                            child,
                            format!("keyword argument repeated: {name}"),
                        ));
                    }
                    args.push(Arg::Keyword(name, value));
                }
                "list_splat" | "parenthesized_list_splat" => {
                    let inner = first_named(child)
                        .ok_or_else(|| syntax_error_at(child, "invalid syntax"))?;
                    args.push(Arg::Starred(self.lower_expr(inner)?));
                }
                "dictionary_splat" => {
                    seen_keyword = true;
                    let inner = first_named(child)
                        .ok_or_else(|| syntax_error_at(child, "invalid syntax"))?;
                    args.push(Arg::DoubleStarred(self.lower_expr(inner)?));
                }
                _ => {
                    if seen_keyword {
                        return Err(syntax_error_at(
                            child,
                            "positional argument follows keyword argument",
                        ));
                    }
                    args.push(Arg::Positional(self.lower_expr(child)?));
                }
            }
        }
        Ok(ExprKind::Call { func, args })
    }

    fn lower_subscript_index(&mut self, node: Node<'_>) -> LResult<Expr> {
        let mut cursor = node.walk();
        let parts: Vec<Node<'_>> = node
            .children_by_field_name("subscript", &mut cursor)
            .collect();
        match parts.len() {
            0 => Err(syntax_error_at(node, "missing subscript")),
            1 => self.lower_expr(parts[0]),
            _ => {
                let items = self.lower_exprs(parts)?;
                Ok(Expr::new(line_of(node), ExprKind::Tuple(items)))
            }
        }
    }

    /// `slice` has no fields; components are delimited by `:` tokens.
    fn lower_slice(&mut self, node: Node<'_>) -> LResult<ExprKind> {
        let mut slots: Vec<Option<Box<Expr>>> = vec![None];
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        for child in children {
            if child.kind() == ":" {
                slots.push(None);
            } else if child.is_named() && child.kind() != "comment" {
                let expr = self.lower_expr(child)?;
                if let Some(slot) = slots.last_mut() {
                    *slot = Some(Box::new(expr));
                }
            }
        }
        let mut slots = slots.into_iter();
        Ok(ExprKind::Slice {
            lower: slots.next().flatten(),
            upper: slots.next().flatten(),
            step: slots.next().flatten(),
        })
    }

    fn lower_comprehension(&mut self, node: Node<'_>, kind: CompKind) -> LResult<ExprKind> {
        let body = self.required(node, "body")?;
        self.scope().comprehension_depth += 1;
        let result = self.lower_comprehension_parts(node, body, kind);
        self.scope().comprehension_depth -= 1;
        result
    }

    fn lower_comprehension_parts(
        &mut self,
        node: Node<'_>,
        body: Node<'_>,
        kind: CompKind,
    ) -> LResult<ExprKind> {
        let mut clauses = Vec::new();
        for child in named_children(node) {
            match child.kind() {
                "for_in_clause" => {
                    let mut cursor = child.walk();
                    let rights: Vec<Node<'_>> =
                        child.children_by_field_name("right", &mut cursor).collect();
                    let iter = match rights.len() {
                        0 => return Err(syntax_error_at(child, "invalid comprehension")),
                        1 => self.lower_rhs(rights[0])?,
                        _ => Expr::new(line_of(child), ExprKind::Tuple(self.lower_exprs(rights)?)),
                    };
                    let target = self.lower_target(self.required(child, "left")?)?;
                    clauses.push(CompClause::For { target, iter });
                }
                "if_clause" => {
                    let cond = first_named(child)
                        .ok_or_else(|| syntax_error_at(child, "invalid comprehension"))?;
                    clauses.push(CompClause::If(self.lower_expr(cond)?));
                }
                _ => {}
            }
        }
        let (element, value) = if kind == CompKind::Dict {
            let key = self.lower_expr(self.required(body, "key")?)?;
            let value = self.lower_expr(self.required(body, "value")?)?;
            (Box::new(key), Some(Box::new(value)))
        } else {
            (Box::new(self.lower_expr(body)?), None)
        };
        Ok(ExprKind::Comprehension {
            kind,
            element,
            value,
            clauses,
        })
    }

    // -----------------------------------------------------------------------
    // Strings
    // -----------------------------------------------------------------------

    fn lower_concatenated(&mut self, node: Node<'_>) -> LResult<ExprKind> {
        let mut parts: Vec<FStringPart> = Vec::new();
        let mut formatted = false;
        for child in named_children(node) {
            match self.lower_string(child)? {
                ExprKind::Str(s) => parts.push(FStringPart::Literal(s)),
                ExprKind::FString(inner) => {
                    formatted = true;
                    parts.extend(inner);
                }
                other => return Ok(other),
            }
        }
        if formatted {
            return Ok(ExprKind::FString(parts));
        }
        let joined = parts
            .into_iter()
            .map(|p| match p {
                FStringPart::Literal(s) => s,
                FStringPart::Field { .. } => String::new(),
            })
            .collect();
        Ok(ExprKind::Str(joined))
    }

    fn lower_string(&mut self, node: Node<'_>) -> LResult<ExprKind> {
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        let start = children.iter().find(|c| c.kind() == "string_start");
        let end = children.iter().rev().find(|c| c.kind() == "string_end");
        let (Some(start), Some(end)) = (start, end) else {
            return Err(syntax_error_at(node, "unterminated string literal"));
        };
        let opener = self.text(*start);
        let prefix: String = opener
            .chars()
            .take_while(|c| *c != '"' && *c != '\'')
            .collect::<String>()
            .to_ascii_lowercase();
        if prefix.contains('b') {
            return Ok(ExprKind::Unsupported("bytes literal".to_string()));
        }
        let raw = prefix.contains('r');
        let formatted = prefix.contains('f');

        let mut parts = Vec::new();
        let mut cursor_byte = start.end_byte();
        for child in &children {
            if child.kind() != "interpolation" {
                continue;
            }
            let literal = self
                .src
                .get(cursor_byte..child.start_byte())
                .unwrap_or("");
            if !literal.is_empty() {
                parts.push(FStringPart::Literal(decode_literal(literal, raw, formatted)));
            }
            parts.push(self.lower_interpolation(*child)?);
            cursor_byte = child.end_byte();
        }
        let tail = self.src.get(cursor_byte..end.start_byte()).unwrap_or("");
        if !tail.is_empty() {
            parts.push(FStringPart::Literal(decode_literal(tail, raw, formatted)));
        }

        if !formatted {
            let text = parts
                .into_iter()
                .map(|p| match p {
                    FStringPart::Literal(s) => s,
                    FStringPart::Field { .. } => String::new(),
                })
                .collect();
            return Ok(ExprKind::Str(text));
        }
        Ok(ExprKind::FString(parts))
    }

    fn lower_interpolation(&mut self, node: Node<'_>) -> LResult<FStringPart> {
        let children = named_children(node);
        let expr_node = node
            .child_by_field_name("expression")
            .or_else(|| children.first().copied())
            .ok_or_else(|| syntax_error_at(node, "f-string: empty expression not allowed"))?;
        let expr = self.lower_rhs(expr_node)?;
        let mut conversion = None;
        let mut spec = None;
        for child in children {
            match child.kind() {
                "type_conversion" => {
                    conversion = self.text(child).trim_start_matches('!').chars().next();
                }
                "format_specifier" => {
                    spec = Some(self.text(child).trim_start_matches(':').to_string());
                }
                _ => {}
            }
        }
        Ok(FStringPart::Field {
            expr,
            conversion,
            spec,
        })
    }
}

/// Decode escape sequences in a literal string segment.
fn decode_literal(raw_text: &str, raw: bool, formatted: bool) -> String {
    let text = if formatted {
        raw_text.replace("{{", "{").replace("}}", "}")
    } else {
        raw_text.to_string()
    };
    if raw {
        return text;
    }
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(next) = chars.next() else {
            out.push('\\');
            break;
        };
        match next {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '0'..='7' => {
                let mut value = next.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|d| d.to_digit(8)) {
                        Some(d) => {
                            value = value * 8 + d;
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.push(char::from_u32(value).unwrap_or('\u{fffd}'));
            }
            'a' => out.push('\u{7}'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'v' => out.push('\u{b}'),
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            '\n' => {}
            'x' | 'u' | 'U' => {
                let width = match next {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let hex: String = (0..width).filter_map(|_| chars.next()).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(ch) => out.push(ch),
                    None => {
                        out.push('\\');
                        out.push(next);
                        out.push_str(&hex);
                    }
                }
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::parse_program;

    fn stmt_kinds(src: &str) -> Vec<String> {
        let program = parse_program(src).unwrap();
        program
            .body
            .iter()
            .map(|s| format!("{:?}", s.kind).split([' ', '(', '{']).next().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_lower_function_and_locals() {
        let src = "def f(a, b=2, *rest, flag=False, **opts):\n    total = a + b\n    return total\n";
        let program = parse_program(src).unwrap();
        assert_eq!(program.functions.len(), 1);
        let f = &program.functions[0];
        assert_eq!(f.name, "f");
        assert_eq!(f.params.len(), 5);
        assert_eq!(f.params[2].kind, ParamKind::VarArgs);
        assert_eq!(f.params[3].kind, ParamKind::KeywordOnly);
        assert_eq!(f.params[4].kind, ParamKind::KwArgs);
        assert!(f.locals.contains("total"));
        assert!(f.locals.contains("opts"));
        assert_eq!(f.span.start_line, 1);
        assert_eq!(f.span.end_line, 3);
    }

    #[test]
    fn test_lower_nested_qualified_names_and_global() {
        let src = "count = 0\ndef outer():\n    global count\n    def inner():\n        return 1\n    count = inner()\n";
        let program = parse_program(src).unwrap();
        assert_eq!(program.functions[1].qualified_name, "outer.inner");
        assert_eq!(program.functions[1].parent, Some(0));
        let outer = &program.functions[0];
        assert!(outer.globals.contains("count"));
        assert!(!outer.locals.contains("count"));
        assert!(outer.locals.contains("inner"));
    }

    #[test]
    fn test_lower_if_chain_and_loops() {
        let src = "x = 3\nif x > 2:\n    y = 1\nelif x > 1:\n    y = 2\nelse:\n    y = 3\nfor i in range(3):\n    pass\nwhile x:\n    x -= 1\n";
        assert_eq!(stmt_kinds(src), vec!["Assign", "If", "For", "While"]);
        let program = parse_program(src).unwrap();
        match &program.body[1].kind {
            StmtKind::If { branches, orelse } => {
                assert_eq!(branches.len(), 2);
                assert_eq!(branches[1].line, 4);
                assert!(orelse.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_lower_fstring_parts() {
        let program = parse_program("n = 2\nprint(f\"n={n:>3} {{ok}}\\n\")\n").unwrap();
        let StmtKind::Expr(call) = &program.body[1].kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Call { args, .. } = &call.kind else {
            panic!("expected call");
        };
        let Arg::Positional(Expr {
            kind: ExprKind::FString(parts),
            ..
        }) = &args[0]
        else {
            panic!("expected f-string");
        };
        assert!(matches!(&parts[0], FStringPart::Literal(s) if s == "n="));
        assert!(matches!(&parts[1], FStringPart::Field { spec: Some(s), .. } if s == ">3"));
        assert!(matches!(&parts[2], FStringPart::Literal(s) if s == " {ok}\n"));
    }

    #[test]
    fn test_lower_structural_syntax_errors() {
        let err = parse_program("return 5\n").err().unwrap();
        assert!(err.to_string().contains("'return' outside function"));
        let err = parse_program("break\n").err().unwrap();
        assert!(err.to_string().contains("'break' outside loop"));
        let err = parse_program("nonlocal x\n").err().unwrap();
        assert!(err.to_string().contains("module level"));
    }

    #[test]
    fn test_lower_unsupported_constructs_still_parse() {
        let src = "import math\nclass A:\n    pass\nx = 1\n";
        assert_eq!(stmt_kinds(src), vec!["Unsupported", "Unsupported", "Assign"]);
    }

    #[test]
    fn test_lower_integer_radix_and_underscores() {
        let program = parse_program("a = 0x1F\nb = 1_000\n").unwrap();
        let values: Vec<String> = program
            .body
            .iter()
            .filter_map(|s| match &s.kind {
                StmtKind::Assign {
                    value: Expr {
                        kind: ExprKind::Int(v),
                        ..
                    },
                    ..
                } => Some(v.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(values, vec!["31", "1000"]);
    }

    #[test]
    fn test_decode_literal_escapes() {
        assert_eq!(decode_literal("a\\tb\\x41", false, false), "a\tbA");
        assert_eq!(decode_literal("a\\tb", true, false), "a\\tb");
    }
}
