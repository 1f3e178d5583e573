//! Source instrumentation by textual splicing.
//!
//! Rewrites user source so that marker calls report execution progress,
//! without changing what the program computes. Edits are collected as
//! `(offset, text)` insertions against the original source and applied
//! back-to-front, so earlier insertions never invalidate later offsets.
//! Marker calls carry the node id of the original AST node; the recorded
//! [`NodeTable`] maps ids back to the exact ranges the user wrote, keeping
//! reported positions aligned with the original source even though the
//! rewritten text has shifted columns.
//!
//! Instrumentation is best effort by contract: callers fall back to the
//! uninstrumented source on any failure instead of refusing to run the
//! program.

use std::collections::HashMap;

use transport::types::TextRange;

use crate::lang::ast::*;
use crate::{
    AFTER_EXPRESSION_MARKER, AFTER_STATEMENT_MARKER, BEFORE_EXPRESSION_MARKER,
    BEFORE_STATEMENT_MARKER, LAST_VALUE_BUILTIN,
};

/// What instrumentation remembers about one original node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub range: TextRange,
    pub is_statement: bool,
    pub kind: &'static str,
}

#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: HashMap<NodeId, NodeInfo>,
}

impl NodeTable {
    pub fn get(&self, id: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn record(&mut self, id: NodeId, info: NodeInfo) {
        self.nodes.insert(id, info);
    }
}

pub struct InstrumentedSource {
    pub source: String,
    pub nodes: NodeTable,
}

/// Rewrites `source` (already parsed as `module`) with statement and
/// expression markers.
pub fn instrument_source(source: &str, module: &Module) -> InstrumentedSource {
    let mut ctx = Ctx {
        edits: Vec::new(),
        nodes: NodeTable::default(),
        offsets: LineOffsets::new(source),
    };

    for stmt in &module.body {
        ctx.visit_stmt(stmt, None, false);
    }

    InstrumentedSource {
        source: apply_edits(source, ctx.edits),
        nodes: ctx.nodes,
    }
}

/// Byte offset of the position right after the end of the statement starting
/// the given range. Used by the shell executor to split "all but last
/// statement" from the trailing expression.
pub fn offset_of(source: &str, lineno: u32, col_offset: u32) -> usize {
    LineOffsets::new(source).offset(lineno, col_offset)
}

/// Conservative rewrite of the REPL convenience name `_`.
///
/// Returns the rewritten source when the program only ever reads `_`. When
/// the program itself binds `_` the reference is ambiguous; the rewrite is
/// skipped and a warning is returned instead of guessing.
pub fn rewrite_last_value_refs(source: &str, module: &Module) -> LastValueRewrite {
    let mut binds = false;
    let mut loads: Vec<TextRange> = Vec::new();
    for stmt in &module.body {
        scan_underscore(stmt, &mut binds, &mut loads);
    }

    if loads.is_empty() {
        return LastValueRewrite::Unchanged;
    }
    if binds {
        return LastValueRewrite::Ambiguous {
            warning: "program assigns to '_'; not substituting the last value".to_owned(),
        };
    }

    let offsets = LineOffsets::new(source);
    let mut edits: Vec<Edit> = loads
        .iter()
        .enumerate()
        .map(|(i, range)| Edit {
            start: offsets.offset(range.lineno, range.col_offset),
            end: offsets.offset(range.end_lineno, range.end_col_offset),
            seq: i as u32,
            text: format!("{LAST_VALUE_BUILTIN}()"),
        })
        .collect();
    edits.sort_by_key(|e| (e.start, e.seq));
    LastValueRewrite::Rewritten(apply_sorted_edits(source, edits))
}

pub enum LastValueRewrite {
    Unchanged,
    Rewritten(String),
    Ambiguous { warning: String },
}

// ---- edit machinery ------------------------------------------------------

struct Edit {
    start: usize,
    /// Equal to `start` for pure insertions.
    end: usize,
    seq: u32,
    text: String,
}

fn apply_edits(source: &str, mut edits: Vec<Edit>) -> String {
    edits.sort_by_key(|e| (e.start, e.seq));
    apply_sorted_edits(source, edits)
}

fn apply_sorted_edits(source: &str, edits: Vec<Edit>) -> String {
    let mut result = source.to_owned();
    // back to front; at equal offsets the later-applied edit lands first,
    // which together with the enter/exit sequence numbers nests wrapping
    // calls correctly
    for edit in edits.iter().rev() {
        result.replace_range(edit.start..edit.end, &edit.text);
    }
    result
}

struct LineOffsets {
    starts: Vec<usize>,
    lines: Vec<String>,
}

impl LineOffsets {
    fn new(source: &str) -> Self {
        let mut starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                starts.push(i + 1);
            }
        }
        Self {
            starts,
            lines: source.split('\n').map(str::to_owned).collect(),
        }
    }

    /// Byte offset of the `col`-th character (0-based) on 1-based `lineno`.
    fn offset(&self, lineno: u32, col: u32) -> usize {
        let line_idx = (lineno as usize).saturating_sub(1);
        let start = self.starts[line_idx.min(self.starts.len() - 1)];
        let line = &self.lines[line_idx.min(self.lines.len() - 1)];
        let byte_in_line = line
            .char_indices()
            .nth(col as usize)
            .map(|(i, _)| i)
            .unwrap_or(line.len());
        start + byte_in_line
    }
}

// ---- the walker ----------------------------------------------------------

struct Ctx {
    edits: Vec<Edit>,
    nodes: NodeTable,
    offsets: LineOffsets,
}

impl Ctx {
    fn push_insert(&mut self, offset: usize, text: String) {
        let seq = self.edits.len() as u32;
        self.edits.push(Edit {
            start: offset,
            end: offset,
            seq,
            text,
        });
    }

    /// `header_line`: line of the suite header when this statement sits in
    /// an inline (single-line) suite - statement markers cannot be spliced
    /// there, so they are skipped and only expressions get wrapped.
    fn visit_stmt(&mut self, stmt: &Stmt, header_line: Option<u32>, unsafe_ctx: bool) {
        self.nodes.record(
            stmt.id,
            NodeInfo {
                range: stmt.range,
                is_statement: true,
                kind: stmt_kind_name(&stmt.kind),
            },
        );

        let inline = header_line == Some(stmt.range.lineno);
        let marked = !unsafe_ctx && !inline;
        if marked {
            let col = stmt.range.col_offset;
            let indent = " ".repeat(col as usize);
            let start = self.offsets.offset(stmt.range.lineno, col);
            self.push_insert(
                start,
                format!("{BEFORE_STATEMENT_MARKER}({})\n{indent}", stmt.id),
            );
        }

        match &stmt.kind {
            StmtKind::Expr(expr) => self.visit_expr(expr, unsafe_ctx),
            StmtKind::Assign { target, value } => {
                self.visit_target(target);
                self.visit_expr(value, unsafe_ctx);
            }
            StmtKind::AugAssign { target, value, .. } => {
                self.visit_target(target);
                self.visit_expr(value, unsafe_ctx);
            }
            StmtKind::If { branches, orelse } => {
                for (test, body) in branches {
                    self.visit_expr(test, unsafe_ctx);
                    self.visit_suite(body, stmt.range.lineno, unsafe_ctx);
                }
                self.visit_suite(orelse, stmt.range.lineno, unsafe_ctx);
            }
            StmtKind::While { test, body } => {
                self.visit_expr(test, unsafe_ctx);
                self.visit_suite(body, stmt.range.lineno, unsafe_ctx);
            }
            StmtKind::For { target, iter, body } => {
                self.visit_target(target);
                self.visit_expr(iter, unsafe_ctx);
                self.visit_suite(body, stmt.range.lineno, unsafe_ctx);
            }
            StmtKind::FuncDef {
                body, no_instrument, ..
            } => {
                self.visit_suite(body, stmt.range.lineno, unsafe_ctx || *no_instrument);
            }
            StmtKind::Return(value) => {
                if let Some(expr) = value {
                    self.visit_expr(expr, unsafe_ctx);
                }
            }
            StmtKind::Pass | StmtKind::Break | StmtKind::Continue => {}
        }

        // pushed after the children so that, at a shared end offset, the
        // children's closing parens land before this marker line
        if marked && wants_after_marker(&stmt.kind) {
            let indent = " ".repeat(stmt.range.col_offset as usize);
            let end = self
                .offsets
                .offset(stmt.range.end_lineno, stmt.range.end_col_offset);
            self.push_insert(
                end,
                format!("\n{indent}{AFTER_STATEMENT_MARKER}({})", stmt.id),
            );
        }
    }

    fn visit_suite(&mut self, body: &[Stmt], header_line: u32, unsafe_ctx: bool) {
        for stmt in body {
            self.visit_stmt(stmt, Some(header_line), unsafe_ctx);
        }
    }

    fn visit_target(&mut self, target: &Target) {
        // store context: never wrapped, but subscript positions contain
        // ordinary load expressions worth recording
        if let Target::Subscript { value, index } = target {
            self.record_expr_tree(value);
            self.record_expr_tree(index);
        }
    }

    fn visit_expr(&mut self, expr: &Expr, unsafe_ctx: bool) {
        self.nodes.record(
            expr.id,
            NodeInfo {
                range: expr.range,
                is_statement: false,
                kind: expr_kind_name(&expr.kind),
            },
        );

        if !unsafe_ctx {
            let start = self
                .offsets
                .offset(expr.range.lineno, expr.range.col_offset);
            self.push_insert(
                start,
                format!("{AFTER_EXPRESSION_MARKER}({BEFORE_EXPRESSION_MARKER}({}), ", expr.id),
            );
        }

        self.visit_expr_children(expr, unsafe_ctx);

        if !unsafe_ctx {
            let end = self
                .offsets
                .offset(expr.range.end_lineno, expr.range.end_col_offset);
            self.push_insert(end, ")".to_owned());
        }
    }

    fn visit_expr_children(&mut self, expr: &Expr, unsafe_ctx: bool) {
        match &expr.kind {
            ExprKind::List(items) | ExprKind::Tuple(items) => {
                for item in items {
                    self.visit_expr(item, unsafe_ctx);
                }
            }
            ExprKind::Dict(pairs) => {
                for (k, v) in pairs {
                    self.visit_expr(k, unsafe_ctx);
                    self.visit_expr(v, unsafe_ctx);
                }
            }
            ExprKind::UnaryOp { operand, .. } => self.visit_expr(operand, unsafe_ctx),
            ExprKind::BinOp { left, right, .. } => {
                self.visit_expr(left, unsafe_ctx);
                self.visit_expr(right, unsafe_ctx);
            }
            ExprKind::BoolOp { values, .. } => {
                for value in values {
                    self.visit_expr(value, unsafe_ctx);
                }
            }
            ExprKind::Compare { left, rest } => {
                self.visit_expr(left, unsafe_ctx);
                for (_, right) in rest {
                    self.visit_expr(right, unsafe_ctx);
                }
            }
            ExprKind::Call { func, args } => {
                // the callee is looked up, not evaluated as a step of its
                // own; wrapping it would make every call pause twice
                self.record_expr_tree(func);
                for arg in args {
                    self.visit_expr(arg, unsafe_ctx);
                }
            }
            ExprKind::Subscript { value, index } => {
                self.visit_expr(value, unsafe_ctx);
                self.visit_expr(index, unsafe_ctx);
            }
            _ => {}
        }
    }

    /// Records ranges without splicing markers (positions that must stay
    /// textually untouched).
    fn record_expr_tree(&mut self, expr: &Expr) {
        self.nodes.record(
            expr.id,
            NodeInfo {
                range: expr.range,
                is_statement: false,
                kind: expr_kind_name(&expr.kind),
            },
        );
        self.visit_expr_children_recording(expr);
    }

    fn visit_expr_children_recording(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::List(items) | ExprKind::Tuple(items) => {
                for item in items {
                    self.record_expr_tree(item);
                }
            }
            ExprKind::Dict(pairs) => {
                for (k, v) in pairs {
                    self.record_expr_tree(k);
                    self.record_expr_tree(v);
                }
            }
            ExprKind::UnaryOp { operand, .. } => self.record_expr_tree(operand),
            ExprKind::BinOp { left, right, .. } => {
                self.record_expr_tree(left);
                self.record_expr_tree(right);
            }
            ExprKind::BoolOp { values, .. } => {
                for value in values {
                    self.record_expr_tree(value);
                }
            }
            ExprKind::Compare { left, rest } => {
                self.record_expr_tree(left);
                for (_, right) in rest {
                    self.record_expr_tree(right);
                }
            }
            ExprKind::Call { func, args } => {
                self.record_expr_tree(func);
                for arg in args {
                    self.record_expr_tree(arg);
                }
            }
            ExprKind::Subscript { value, index } => {
                self.record_expr_tree(value);
                self.record_expr_tree(index);
            }
            _ => {}
        }
    }
}

/// Statements whose completion is worth a marker of its own. Expression
/// statements and compound statements report enough through their parts.
fn wants_after_marker(kind: &StmtKind) -> bool {
    matches!(
        kind,
        StmtKind::Assign { .. } | StmtKind::AugAssign { .. } | StmtKind::FuncDef { .. }
    )
}

fn stmt_kind_name(kind: &StmtKind) -> &'static str {
    match kind {
        StmtKind::Expr(_) => "Expr",
        StmtKind::Assign { .. } => "Assign",
        StmtKind::AugAssign { .. } => "AugAssign",
        StmtKind::If { .. } => "If",
        StmtKind::While { .. } => "While",
        StmtKind::For { .. } => "For",
        StmtKind::FuncDef { .. } => "FuncDef",
        StmtKind::Return(_) => "Return",
        StmtKind::Pass => "Pass",
        StmtKind::Break => "Break",
        StmtKind::Continue => "Continue",
    }
}

fn expr_kind_name(kind: &ExprKind) -> &'static str {
    match kind {
        ExprKind::Int(_) => "Int",
        ExprKind::Float(_) => "Float",
        ExprKind::Str(_) => "Str",
        ExprKind::Bool(_) => "Bool",
        ExprKind::NoneLit => "None",
        ExprKind::Name(_) => "Name",
        ExprKind::List(_) => "List",
        ExprKind::Tuple(_) => "Tuple",
        ExprKind::Dict(_) => "Dict",
        ExprKind::UnaryOp { .. } => "UnaryOp",
        ExprKind::BinOp { .. } => "BinOp",
        ExprKind::BoolOp { .. } => "BoolOp",
        ExprKind::Compare { .. } => "Compare",
        ExprKind::Call { .. } => "Call",
        ExprKind::Subscript { .. } => "Subscript",
    }
}

fn scan_underscore(stmt: &Stmt, binds: &mut bool, loads: &mut Vec<TextRange>) {
    fn scan_target(target: &Target, binds: &mut bool, loads: &mut Vec<TextRange>) {
        match target {
            Target::Name { name, .. } => {
                if name == "_" {
                    *binds = true;
                }
            }
            Target::Subscript { value, index } => {
                scan_expr(value, loads);
                scan_expr(index, loads);
            }
        }
    }

    fn scan_expr(expr: &Expr, loads: &mut Vec<TextRange>) {
        if let ExprKind::Name(name) = &expr.kind {
            if name == "_" {
                loads.push(expr.range);
            }
            return;
        }
        match &expr.kind {
            ExprKind::List(items) | ExprKind::Tuple(items) => {
                items.iter().for_each(|e| scan_expr(e, loads))
            }
            ExprKind::Dict(pairs) => pairs.iter().for_each(|(k, v)| {
                scan_expr(k, loads);
                scan_expr(v, loads);
            }),
            ExprKind::UnaryOp { operand, .. } => scan_expr(operand, loads),
            ExprKind::BinOp { left, right, .. } => {
                scan_expr(left, loads);
                scan_expr(right, loads);
            }
            ExprKind::BoolOp { values, .. } => values.iter().for_each(|e| scan_expr(e, loads)),
            ExprKind::Compare { left, rest } => {
                scan_expr(left, loads);
                rest.iter().for_each(|(_, e)| scan_expr(e, loads));
            }
            ExprKind::Call { func, args } => {
                scan_expr(func, loads);
                args.iter().for_each(|e| scan_expr(e, loads));
            }
            ExprKind::Subscript { value, index } => {
                scan_expr(value, loads);
                scan_expr(index, loads);
            }
            _ => {}
        }
    }

    match &stmt.kind {
        StmtKind::Expr(e) => scan_expr(e, loads),
        StmtKind::Assign { target, value } => {
            scan_target(target, binds, loads);
            scan_expr(value, loads);
        }
        StmtKind::AugAssign { target, value, .. } => {
            scan_target(target, binds, loads);
            scan_expr(value, loads);
        }
        StmtKind::If { branches, orelse } => {
            for (test, body) in branches {
                scan_expr(test, loads);
                body.iter().for_each(|s| scan_underscore(s, binds, loads));
            }
            orelse.iter().for_each(|s| scan_underscore(s, binds, loads));
        }
        StmtKind::While { test, body } => {
            scan_expr(test, loads);
            body.iter().for_each(|s| scan_underscore(s, binds, loads));
        }
        StmtKind::For { target, iter, body } => {
            scan_target(target, binds, loads);
            scan_expr(iter, loads);
            body.iter().for_each(|s| scan_underscore(s, binds, loads));
        }
        StmtKind::FuncDef { body, .. } => {
            body.iter().for_each(|s| scan_underscore(s, binds, loads));
        }
        StmtKind::Return(value) => {
            if let Some(e) = value {
                scan_expr(e, loads);
            }
        }
        StmtKind::Pass | StmtKind::Break | StmtKind::Continue => {}
    }
}
