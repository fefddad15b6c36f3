//! Owned Program Model shared by the static and dynamic analyzers.
//!
//! The tree is built once by [`super::lower`] and never mutated afterwards.
//! Function bodies live in an arena on [`Program`] and are referenced by
//! [`FunctionId`], so the interpreter can hand out closures without cloning
//! statement trees.

use std::collections::BTreeSet;

use num_bigint::BigInt;

pub type FunctionId = usize;

/// 1-based source position of a statement or definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start_line: usize,
    pub end_line: usize,
    pub column: usize,
}

impl Span {
    pub fn line(line: usize) -> Self {
        Self {
            start_line: line,
            end_line: line,
            column: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Program {
    pub body: Vec<Stmt>,
    pub functions: Vec<FunctionDef>,
    pub line_count: usize,
}

impl Program {
    pub fn function(&self, id: FunctionId) -> &FunctionDef {
        &self.functions[id]
    }

    /// Named (non-lambda) definitions in source order.
    pub fn named_functions(&self) -> impl Iterator<Item = &FunctionDef> {
        self.functions.iter().filter(|f| !f.is_lambda)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Positional,
    KeywordOnly,
    VarArgs,
    KwArgs,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
    pub kind: ParamKind,
}

#[derive(Debug, Clone)]
pub enum FunctionBody {
    Block(Vec<Stmt>),
    /// Lambda body.
    Expr(Box<Expr>),
}

#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub id: FunctionId,
    pub name: String,
    pub qualified_name: String,
    pub params: Vec<Param>,
    pub body: FunctionBody,
    pub span: Span,
    pub parent: Option<FunctionId>,
    pub is_lambda: bool,
    /// Names bound in this scope, parameters included, minus `global` and
    /// `nonlocal` declarations.
    pub locals: BTreeSet<String>,
    pub globals: BTreeSet<String>,
    pub nonlocals: BTreeSet<String>,
}

impl FunctionDef {
    pub fn positional_count(&self) -> usize {
        self.params
            .iter()
            .filter(|p| p.kind == ParamKind::Positional)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Stmt {
    pub span: Span,
    pub kind: StmtKind,
}

#[derive(Debug, Clone)]
pub struct IfBranch {
    pub line: usize,
    pub test: Expr,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct ExceptHandler {
    pub line: usize,
    pub exc_type: Option<Expr>,
    pub alias: Option<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Expr(Expr),
    /// `a = b = value` keeps every target in order.
    Assign {
        targets: Vec<Target>,
        value: Expr,
    },
    AugAssign {
        target: Target,
        op: BinOp,
        value: Expr,
    },
    /// First branch is the `if`, the rest are `elif`s.
    If {
        branches: Vec<IfBranch>,
        orelse: Option<Vec<Stmt>>,
    },
    For {
        target: Target,
        iter: Expr,
        body: Vec<Stmt>,
        orelse: Option<Vec<Stmt>>,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Option<Vec<Stmt>>,
    },
    FunctionDef(FunctionId),
    Return(Option<Expr>),
    Pass,
    Break,
    Continue,
    Global(Vec<String>),
    Nonlocal(Vec<String>),
    Assert {
        test: Expr,
        msg: Option<Expr>,
    },
    Raise(Option<Expr>),
    Try {
        body: Vec<Stmt>,
        handlers: Vec<ExceptHandler>,
        orelse: Option<Vec<Stmt>>,
        finalbody: Option<Vec<Stmt>>,
    },
    Delete(Vec<Target>),
    /// Parsed but not executable in the sandbox (classes, imports, `with`, ...).
    Unsupported { construct: String },
}

#[derive(Debug, Clone)]
pub enum Target {
    Name(String),
    Attribute { value: Expr, attr: String },
    Subscript { value: Expr, index: Expr },
    Tuple(Vec<Target>),
    Starred(Box<Target>),
}

impl Target {
    /// Plain names bound by this target, in source order.
    pub fn bound_names(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_names(&mut out);
        out
    }

    fn collect_names<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Target::Name(n) => out.push(n),
            Target::Tuple(items) => items.iter().for_each(|t| t.collect_names(out)),
            Target::Starred(inner) => inner.collect_names(out),
            Target::Attribute { .. } | Target::Subscript { .. } => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Expr {
    pub line: usize,
    pub kind: ExprKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    MatMul,
    BitAnd,
    BitOr,
    BitXor,
    LShift,
    RShift,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
            BinOp::MatMul => "@",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::LShift => "<<",
            BinOp::RShift => ">>",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        let op = match symbol.trim_end_matches('=') {
            "+" => BinOp::Add,
            "-" => BinOp::Sub,
            "*" => BinOp::Mul,
            "/" => BinOp::Div,
            "//" => BinOp::FloorDiv,
            "%" => BinOp::Mod,
            "**" => BinOp::Pow,
            "@" => BinOp::MatMul,
            "&" => BinOp::BitAnd,
            "|" => BinOp::BitOr,
            "^" => BinOp::BitXor,
            "<<" => BinOp::LShift,
            ">>" => BinOp::RShift,
            _ => return None,
        };
        Some(op)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Invert,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    In,
    NotIn,
    Is,
    IsNot,
}

impl CmpOp {
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        let normalized: String = symbol.split_whitespace().collect::<Vec<_>>().join(" ");
        let op = match normalized.as_str() {
            "==" => CmpOp::Eq,
            "!=" | "<>" => CmpOp::NotEq,
            "<" => CmpOp::Lt,
            "<=" => CmpOp::LtE,
            ">" => CmpOp::Gt,
            ">=" => CmpOp::GtE,
            "in" => CmpOp::In,
            "not in" => CmpOp::NotIn,
            "is" => CmpOp::Is,
            "is not" => CmpOp::IsNot,
            _ => return None,
        };
        Some(op)
    }
}

#[derive(Debug, Clone)]
pub enum Arg {
    Positional(Expr),
    Starred(Expr),
    Keyword(String, Expr),
    DoubleStarred(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompKind {
    List,
    Set,
    Dict,
    /// Generator expressions are evaluated eagerly into a list.
    Generator,
}

#[derive(Debug, Clone)]
pub enum CompClause {
    For { target: Target, iter: Expr },
    If(Expr),
}

#[derive(Debug, Clone)]
pub enum FStringPart {
    Literal(String),
    Field {
        expr: Expr,
        conversion: Option<char>,
        spec: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Name(String),
    Int(BigInt),
    Float(f64),
    Str(String),
    FString(Vec<FStringPart>),
    Bool(bool),
    None,
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Set(Vec<Expr>),
    /// `None` key marks a `**mapping` entry.
    Dict(Vec<(Option<Expr>, Expr)>),
    Starred(Box<Expr>),
    BinOp {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    UnaryOp {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    BoolOp {
        op: BoolOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        left: Box<Expr>,
        ops: Vec<CmpOp>,
        comparators: Vec<Expr>,
    },
    IfExp {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Arg>,
    },
    Attribute {
        value: Box<Expr>,
        attr: String,
    },
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    Lambda(FunctionId),
    Comprehension {
        kind: CompKind,
        element: Box<Expr>,
        /// Value expression for dict comprehensions.
        value: Option<Box<Expr>>,
        clauses: Vec<CompClause>,
    },
    Unsupported(String),
}

impl Expr {
    pub fn new(line: usize, kind: ExprKind) -> Self {
        Self { line, kind }
    }

    /// Visit this expression and every sub-expression, pre-order. Lambda
    /// bodies are not entered; they belong to their own function.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Expr)) {
        visit(self);
        match &self.kind {
            ExprKind::List(items) | ExprKind::Tuple(items) | ExprKind::Set(items) => {
                items.iter().for_each(|e| e.walk(visit))
            }
            ExprKind::Dict(pairs) => {
                for (k, v) in pairs {
                    if let Some(k) = k {
                        k.walk(visit);
                    }
                    v.walk(visit);
                }
            }
            ExprKind::Starred(inner) => inner.walk(visit),
            ExprKind::BinOp { left, right, .. } | ExprKind::BoolOp { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            ExprKind::UnaryOp { operand, .. } => operand.walk(visit),
            ExprKind::Compare {
                left, comparators, ..
            } => {
                left.walk(visit);
                comparators.iter().for_each(|e| e.walk(visit));
            }
            ExprKind::IfExp { test, body, orelse } => {
                body.walk(visit);
                test.walk(visit);
                orelse.walk(visit);
            }
            ExprKind::Call { func, args } => {
                func.walk(visit);
                for arg in args {
                    match arg {
                        Arg::Positional(e)
                        | Arg::Starred(e)
                        | Arg::Keyword(_, e)
                        | Arg::DoubleStarred(e) => e.walk(visit),
                    }
                }
            }
            ExprKind::Attribute { value, .. } => value.walk(visit),
            ExprKind::Subscript { value, index } => {
                value.walk(visit);
                index.walk(visit);
            }
            ExprKind::Slice { lower, upper, step } => {
                for part in [lower, upper, step].into_iter().flatten() {
                    part.walk(visit);
                }
            }
            ExprKind::FString(parts) => {
                for part in parts {
                    if let FStringPart::Field { expr, .. } = part {
                        expr.walk(visit);
                    }
                }
            }
            ExprKind::Comprehension {
                element,
                value,
                clauses,
                ..
            } => {
                for clause in clauses {
                    match clause {
                        CompClause::For { target, iter } => {
                            iter.walk(visit);
                            target.walk_exprs(visit);
                        }
                        CompClause::If(cond) => cond.walk(visit),
                    }
                }
                element.walk(visit);
                if let Some(v) = value {
                    v.walk(visit);
                }
            }
            ExprKind::Name(_)
            | ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Str(_)
            | ExprKind::Bool(_)
            | ExprKind::None
            | ExprKind::Lambda(_)
            | ExprKind::Unsupported(_) => {}
        }
    }
}

impl Target {
    /// Visit expressions embedded in attribute/subscript targets.
    pub fn walk_exprs<'a>(&'a self, visit: &mut dyn FnMut(&'a Expr)) {
        match self {
            Target::Name(_) => {}
            Target::Attribute { value, .. } => value.walk(visit),
            Target::Subscript { value, index } => {
                value.walk(visit);
                index.walk(visit);
            }
            Target::Tuple(items) => items.iter().for_each(|t| t.walk_exprs(visit)),
            Target::Starred(inner) => inner.walk_exprs(visit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_bound_names_flattens_unpacking() {
        let target = Target::Tuple(vec![
            Target::Name("a".into()),
            Target::Starred(Box::new(Target::Name("rest".into()))),
            Target::Subscript {
                value: Expr::new(1, ExprKind::Name("xs".into())),
                index: Expr::new(1, ExprKind::Int(BigInt::from(0))),
            },
        ]);
        assert_eq!(target.bound_names(), vec!["a", "rest"]);
    }

    #[test]
    fn test_cmp_op_from_symbol_normalizes_whitespace() {
        assert_eq!(CmpOp::from_symbol("not  in"), Some(CmpOp::NotIn));
        assert_eq!(CmpOp::from_symbol("is not"), Some(CmpOp::IsNot));
        assert_eq!(CmpOp::from_symbol("<="), Some(CmpOp::LtE));
        assert_eq!(BinOp::from_symbol("//="), Some(BinOp::FloorDiv));
    }
}
