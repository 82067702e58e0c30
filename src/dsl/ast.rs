//! AST node types for the shapescript language.
//!
//! Nodes are immutable once the parser returns them. Later phases attach
//! information through side tables keyed by [`NodeId`] instead of
//! mutating the tree.

use std::collections::HashMap;

/// Source span for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Dense per-script node identifier, assigned by the parser in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// A complete script: a list of top-level statements.
#[derive(Debug, Clone)]
pub struct Script {
    pub body: Vec<Stmt>,
    /// Number of node ids handed out while parsing.
    pub node_count: u32,
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub id: NodeId,
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    /// `{ ... }`
    Block(Vec<Stmt>),
    /// `var x;` or `var x = expr;`
    Var {
        name: String,
        name_span: Span,
        init: Option<Expr>,
    },
    If {
        condition: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    While {
        condition: Expr,
        body: Box<Stmt>,
    },
    /// `for (init; condition; step) body`
    For {
        init: Option<Box<Stmt>>,
        condition: Option<Expr>,
        step: Option<Box<Stmt>>,
        body: Box<Stmt>,
    },
    Return(Option<Expr>),
    Print(Expr),
    Expr(Expr),
    /// `target = value;` where target is an identifier, member or index expression.
    Assign {
        target: Expr,
        value: Expr,
    },
    /// `target++;` / `target--;`
    Increment {
        target: Expr,
        op: IncOp,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncOp {
    Increment,
    Decrement,
}

/// Expressions.
#[derive(Debug, Clone)]
pub struct Expr {
    pub id: NodeId,
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Literal(Literal),
    /// Arithmetic, comparison and equality: `a + b`, `a < b`
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Short-circuit logic: `a && b`, `a || b`
    Logical {
        op: LogicOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    /// `( expr )`
    Grouping(Box<Expr>),
    /// A bare name: a variable, a lambda parameter, or a member of the input object.
    Ident(String),
    /// `object.name`
    Member {
        object: Box<Expr>,
        name: String,
        name_span: Span,
    },
    /// `object[index]`
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    /// `callee(args)`
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Lambda(Box<Lambda>),
    /// `{ x: 1, y: "s" }`
    Object(Vec<Property>),
    /// `[1, 2, 3]`
    Array(Vec<Expr>),
    /// `$"total {a + b}"`
    Interpolated(Vec<InterpPart>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone)]
pub struct Lambda {
    pub params: Vec<Param>,
    pub body: LambdaBody,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub id: NodeId,
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum LambdaBody {
    /// `x => x * 2`
    Expr(Box<Expr>),
    /// `x => { return x * 2; }`
    Block(Vec<Stmt>),
}

#[derive(Debug, Clone)]
pub struct Property {
    pub name: String,
    pub value: Expr,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum InterpPart {
    Text(String),
    Expr(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(self, Self::Add | Self::Sub | Self::Mul | Self::Div | Self::Mod)
    }

    pub fn is_ordering(self) -> bool {
        matches!(self, Self::Lt | Self::Gt | Self::Le | Self::Ge)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Neg => "-",
            Self::Not => "!",
        }
    }
}

/// True if executing `stmts` in order always reaches a `return`.
pub fn always_returns(stmts: &[Stmt]) -> bool {
    stmts.iter().any(stmt_always_returns)
}

fn stmt_always_returns(stmt: &Stmt) -> bool {
    match &stmt.kind {
        StmtKind::Return(_) => true,
        StmtKind::Block(body) => always_returns(body),
        StmtKind::If {
            then_branch,
            else_branch: Some(else_branch),
            ..
        } => stmt_always_returns(then_branch) && stmt_always_returns(else_branch),
        _ => false,
    }
}

/// Index every lambda literal in `script` by its expression node.
pub fn collect_lambdas(script: &Script) -> HashMap<NodeId, &Lambda> {
    let mut out = HashMap::new();
    for stmt in &script.body {
        lambdas_in_stmt(stmt, &mut out);
    }
    out
}

fn lambdas_in_stmt<'a>(stmt: &'a Stmt, out: &mut HashMap<NodeId, &'a Lambda>) {
    match &stmt.kind {
        StmtKind::Block(body) => body.iter().for_each(|s| lambdas_in_stmt(s, out)),
        StmtKind::Var { init, .. } => {
            if let Some(e) = init {
                lambdas_in_expr(e, out);
            }
        }
        StmtKind::If {
            condition,
            then_branch,
            else_branch,
        } => {
            lambdas_in_expr(condition, out);
            lambdas_in_stmt(then_branch, out);
            if let Some(e) = else_branch {
                lambdas_in_stmt(e, out);
            }
        }
        StmtKind::While { condition, body } => {
            lambdas_in_expr(condition, out);
            lambdas_in_stmt(body, out);
        }
        StmtKind::For {
            init,
            condition,
            step,
            body,
        } => {
            if let Some(s) = init {
                lambdas_in_stmt(s, out);
            }
            if let Some(c) = condition {
                lambdas_in_expr(c, out);
            }
            if let Some(s) = step {
                lambdas_in_stmt(s, out);
            }
            lambdas_in_stmt(body, out);
        }
        StmtKind::Return(value) => {
            if let Some(e) = value {
                lambdas_in_expr(e, out);
            }
        }
        StmtKind::Print(e) | StmtKind::Expr(e) => lambdas_in_expr(e, out),
        StmtKind::Assign { target, value } => {
            lambdas_in_expr(target, out);
            lambdas_in_expr(value, out);
        }
        StmtKind::Increment { target, .. } => lambdas_in_expr(target, out),
    }
}

fn lambdas_in_expr<'a>(expr: &'a Expr, out: &mut HashMap<NodeId, &'a Lambda>) {
    match &expr.kind {
        ExprKind::Literal(_) | ExprKind::Ident(_) => {}
        ExprKind::Binary { left, right, .. } | ExprKind::Logical { left, right, .. } => {
            lambdas_in_expr(left, out);
            lambdas_in_expr(right, out);
        }
        ExprKind::Unary { operand: inner, .. }
        | ExprKind::Grouping(inner)
        | ExprKind::Member { object: inner, .. } => lambdas_in_expr(inner, out),
        ExprKind::Index { object, index } => {
            lambdas_in_expr(object, out);
            lambdas_in_expr(index, out);
        }
        ExprKind::Call { callee, args } => {
            lambdas_in_expr(callee, out);
            args.iter().for_each(|a| lambdas_in_expr(a, out));
        }
        ExprKind::Lambda(lambda) => {
            out.insert(expr.id, &**lambda);
            match &lambda.body {
                LambdaBody::Expr(e) => lambdas_in_expr(e, out),
                LambdaBody::Block(body) => body.iter().for_each(|s| lambdas_in_stmt(s, out)),
            }
        }
        ExprKind::Object(props) => props.iter().for_each(|p| lambdas_in_expr(&p.value, out)),
        ExprKind::Array(items) => items.iter().for_each(|e| lambdas_in_expr(e, out)),
        ExprKind::Interpolated(parts) => {
            for part in parts {
                if let InterpPart::Expr(e) = part {
                    lambdas_in_expr(e, out);
                }
            }
        }
    }
}
