//! Syntax tree with exact source ranges.
//!
//! Node ids are assigned by the parser in creation order. Instrumentation
//! records each id's original range before rewriting, so a marker call in
//! rewritten source can always be traced back to the exact span the user
//! wrote.

use std::rc::Rc;

use transport::types::TextRange;

pub type NodeId = u32;

#[derive(Debug, Clone)]
pub struct Module {
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub id: NodeId,
    pub range: TextRange,
    pub kind: StmtKind,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Expr(Expr),
    Assign {
        target: Target,
        value: Expr,
    },
    AugAssign {
        target: Target,
        op: BinOp,
        value: Expr,
    },
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        orelse: Vec<Stmt>,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
    },
    For {
        target: Target,
        iter: Expr,
        body: Vec<Stmt>,
    },
    FuncDef {
        name: String,
        params: Vec<String>,
        body: Rc<Vec<Stmt>>,
        /// Set by a `# no-instrument` directive on the `def` line; the body
        /// must never be rewritten.
        no_instrument: bool,
    },
    Return(Option<Expr>),
    Pass,
    Break,
    Continue,
}

/// Assignment target (store context - never instrumented).
#[derive(Debug, Clone)]
pub enum Target {
    Name { name: String, range: TextRange },
    Subscript { value: Expr, index: Expr },
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub id: NodeId,
    pub range: TextRange,
    pub kind: ExprKind,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    NoneLit,
    Name(String),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    UnaryOp {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    BinOp {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    BoolOp {
        op: BoolOpKind,
        values: Vec<Expr>,
    },
    Compare {
        left: Box<Expr>,
        rest: Vec<(CmpOp, Expr)>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
    },
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
    },
}

impl Expr {
    pub fn is_literal(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Int(_)
                | ExprKind::Float(_)
                | ExprKind::Str(_)
                | ExprKind::Bool(_)
                | ExprKind::NoneLit
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
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
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOpKind {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    NotEq,
    In,
    NotIn,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Gt => ">",
            CmpOp::Le => "<=",
            CmpOp::Ge => ">=",
            CmpOp::Eq => "==",
            CmpOp::NotEq => "!=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
        }
    }
}

/// Finds the innermost node whose range contains the given position,
/// preferring the most deeply nested match (child-first traversal, last
/// visited wins among equals).
pub fn find_innermost_at(module: &Module, lineno: u32, col_offset: u32) -> Option<FoundNode<'_>> {
    let mut found = None;
    for stmt in &module.body {
        visit_stmt(stmt, lineno, col_offset, &mut found);
    }
    found
}

#[derive(Debug, Clone, Copy)]
pub enum FoundNode<'a> {
    Stmt(&'a Stmt),
    Expr(&'a Expr),
}

impl FoundNode<'_> {
    pub fn range(&self) -> TextRange {
        match self {
            FoundNode::Stmt(s) => s.range,
            FoundNode::Expr(e) => e.range,
        }
    }

    pub fn id(&self) -> NodeId {
        match self {
            FoundNode::Stmt(s) => s.id,
            FoundNode::Expr(e) => e.id,
        }
    }
}

fn visit_stmt<'a>(
    stmt: &'a Stmt,
    lineno: u32,
    col: u32,
    found: &mut Option<FoundNode<'a>>,
) {
    if !stmt.range.contains_position(lineno, col) {
        return;
    }
    *found = Some(FoundNode::Stmt(stmt));

    match &stmt.kind {
        StmtKind::Expr(e) => visit_expr(e, lineno, col, found),
        StmtKind::Assign { target, value } | StmtKind::AugAssign { target, value, .. } => {
            visit_target(target, lineno, col, found);
            visit_expr(value, lineno, col, found);
        }
        StmtKind::If { branches, orelse } => {
            for (test, body) in branches {
                visit_expr(test, lineno, col, found);
                for s in body {
                    visit_stmt(s, lineno, col, found);
                }
            }
            for s in orelse {
                visit_stmt(s, lineno, col, found);
            }
        }
        StmtKind::While { test, body } => {
            visit_expr(test, lineno, col, found);
            for s in body {
                visit_stmt(s, lineno, col, found);
            }
        }
        StmtKind::For { target, iter, body } => {
            visit_target(target, lineno, col, found);
            visit_expr(iter, lineno, col, found);
            for s in body {
                visit_stmt(s, lineno, col, found);
            }
        }
        StmtKind::FuncDef { body, .. } => {
            for s in body.iter() {
                visit_stmt(s, lineno, col, found);
            }
        }
        StmtKind::Return(value) => {
            if let Some(e) = value {
                visit_expr(e, lineno, col, found);
            }
        }
        StmtKind::Pass | StmtKind::Break | StmtKind::Continue => {}
    }
}

fn visit_target<'a>(
    target: &'a Target,
    lineno: u32,
    col: u32,
    found: &mut Option<FoundNode<'a>>,
) {
    if let Target::Subscript { value, index } = target {
        visit_expr(value, lineno, col, found);
        visit_expr(index, lineno, col, found);
    }
}

fn visit_expr<'a>(expr: &'a Expr, lineno: u32, col: u32, found: &mut Option<FoundNode<'a>>) {
    if !expr.range.contains_position(lineno, col) {
        return;
    }
    *found = Some(FoundNode::Expr(expr));

    match &expr.kind {
        ExprKind::List(items) | ExprKind::Tuple(items) => {
            for e in items {
                visit_expr(e, lineno, col, found);
            }
        }
        ExprKind::Dict(pairs) => {
            for (k, v) in pairs {
                visit_expr(k, lineno, col, found);
                visit_expr(v, lineno, col, found);
            }
        }
        ExprKind::UnaryOp { operand, .. } => visit_expr(operand, lineno, col, found),
        ExprKind::BinOp { left, right, .. } => {
            visit_expr(left, lineno, col, found);
            visit_expr(right, lineno, col, found);
        }
        ExprKind::BoolOp { values, .. } => {
            for e in values {
                visit_expr(e, lineno, col, found);
            }
        }
        ExprKind::Compare { left, rest } => {
            visit_expr(left, lineno, col, found);
            for (_, e) in rest {
                visit_expr(e, lineno, col, found);
            }
        }
        ExprKind::Call { func, args } => {
            visit_expr(func, lineno, col, found);
            for e in args {
                visit_expr(e, lineno, col, found);
            }
        }
        ExprKind::Subscript { value, index } => {
            visit_expr(value, lineno, col, found);
            visit_expr(index, lineno, col, found);
        }
        _ => {}
    }
}
