//! Recursive-descent parser.

use std::rc::Rc;

use transport::types::TextRange;

use super::ast::*;
use super::token::{tokenize, Tok, Token};
use super::SyntaxError;

/// Directive comment marking a `def` whose body must not be rewritten by
/// instrumentation.
pub const NO_INSTRUMENT_DIRECTIVE: &str = "# no-instrument";

pub fn parse_module(source: &str) -> Result<Module, SyntaxError> {
    let tokens = tokenize(source)?;
    let lines: Vec<String> = source.split('\n').map(|l| l.to_owned()).collect();
    let mut parser = Parser {
        tokens,
        pos: 0,
        next_id: 1,
        lines,
    };
    parser.module()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    next_id: NodeId,
    lines: Vec<String>,
}

impl Parser {
    fn module(&mut self) -> Result<Module, SyntaxError> {
        let mut body = Vec::new();
        while !self.check(&Tok::Eof) {
            body.push(self.statement()?);
        }
        Ok(Module { body })
    }

    // ---- statements ------------------------------------------------------

    fn statement(&mut self) -> Result<Stmt, SyntaxError> {
        match self.peek().tok.clone() {
            Tok::If => self.if_statement(),
            Tok::While => self.while_statement(),
            Tok::For => self.for_statement(),
            Tok::Def => self.def_statement(),
            _ => {
                let stmt = self.simple_statement()?;
                self.expect(Tok::Newline, "expected end of line")?;
                Ok(stmt)
            }
        }
    }

    fn simple_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let start = self.peek().clone();
        match start.tok {
            Tok::Pass => self.keyword_statement(StmtKind::Pass),
            Tok::Break => self.keyword_statement(StmtKind::Break),
            Tok::Continue => self.keyword_statement(StmtKind::Continue),
            Tok::Return => {
                self.advance();
                let value = if self.check(&Tok::Newline) {
                    None
                } else {
                    Some(self.expression()?)
                };
                let end = value
                    .as_ref()
                    .map(|e| (e.range.end_lineno, e.range.end_col_offset))
                    .unwrap_or((start.end_lineno, start.end_col_offset));
                Ok(self.make_stmt(
                    StmtKind::Return(value),
                    token_start(&start),
                    end,
                ))
            }
            _ => self.expr_or_assign_statement(),
        }
    }

    fn keyword_statement(&mut self, kind: StmtKind) -> Result<Stmt, SyntaxError> {
        let tok = self.advance().clone();
        Ok(self.make_stmt(kind, token_start(&tok), (tok.end_lineno, tok.end_col_offset)))
    }

    fn expr_or_assign_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let first = self.expression()?;
        let start = (first.range.lineno, first.range.col_offset);

        let aug_op = match self.peek().tok {
            Tok::PlusAssign => Some(BinOp::Add),
            Tok::MinusAssign => Some(BinOp::Sub),
            Tok::StarAssign => Some(BinOp::Mul),
            Tok::SlashAssign => Some(BinOp::Div),
            _ => None,
        };

        if let Some(op) = aug_op {
            self.advance();
            let value = self.expression()?;
            let end = (value.range.end_lineno, value.range.end_col_offset);
            let target = self.to_target(first)?;
            return Ok(self.make_stmt(StmtKind::AugAssign { target, op, value }, start, end));
        }

        if self.check(&Tok::Assign) {
            self.advance();
            let value = self.expression()?;
            let end = (value.range.end_lineno, value.range.end_col_offset);
            let target = self.to_target(first)?;
            return Ok(self.make_stmt(StmtKind::Assign { target, value }, start, end));
        }

        let end = (first.range.end_lineno, first.range.end_col_offset);
        Ok(self.make_stmt(StmtKind::Expr(first), start, end))
    }

    fn to_target(&self, expr: Expr) -> Result<Target, SyntaxError> {
        match expr.kind {
            ExprKind::Name(name) => Ok(Target::Name {
                name,
                range: expr.range,
            }),
            ExprKind::Subscript { value, index } => Ok(Target::Subscript {
                value: *value,
                index: *index,
            }),
            _ => Err(SyntaxError::new(
                "cannot assign to this expression",
                expr.range.lineno,
                expr.range.col_offset,
            )),
        }
    }

    fn if_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let start_tok = self.advance().clone(); // 'if'
        let mut branches = Vec::new();
        let test = self.expression()?;
        let body = self.suite()?;
        let mut end = body_end(&body);
        branches.push((test, body));

        let mut orelse = Vec::new();
        loop {
            if self.check(&Tok::Elif) {
                self.advance();
                let test = self.expression()?;
                let body = self.suite()?;
                end = body_end(&body);
                branches.push((test, body));
            } else if self.check(&Tok::Else) {
                self.advance();
                orelse = self.suite()?;
                end = body_end(&orelse);
                break;
            } else {
                break;
            }
        }

        Ok(self.make_stmt(
            StmtKind::If { branches, orelse },
            token_start(&start_tok),
            end,
        ))
    }

    fn while_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let start_tok = self.advance().clone();
        let test = self.expression()?;
        let body = self.suite()?;
        let end = body_end(&body);
        Ok(self.make_stmt(StmtKind::While { test, body }, token_start(&start_tok), end))
    }

    fn for_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let start_tok = self.advance().clone();
        // parsed below comparison level, else the `in` would be eaten as a
        // comparison operator
        let target_expr = self.postfix()?;
        let target = self.to_target(target_expr)?;
        self.expect(Tok::In, "expected 'in'")?;
        let iter = self.expression()?;
        let body = self.suite()?;
        let end = body_end(&body);
        Ok(self.make_stmt(
            StmtKind::For { target, iter, body },
            token_start(&start_tok),
            end,
        ))
    }

    fn def_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let start_tok = self.advance().clone();
        let name = self.expect_name("expected function name")?;
        self.expect(Tok::LParen, "expected '(' after function name")?;
        let mut params = Vec::new();
        if !self.check(&Tok::RParen) {
            loop {
                params.push(self.expect_name("expected parameter name")?);
                if self.check(&Tok::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(Tok::RParen, "expected ')' after parameters")?;

        let def_line = start_tok.lineno;
        let no_instrument = self
            .lines
            .get((def_line - 1) as usize)
            .is_some_and(|l| l.contains(NO_INSTRUMENT_DIRECTIVE));

        let body = self.suite()?;
        let end = body_end(&body);
        Ok(self.make_stmt(
            StmtKind::FuncDef {
                name,
                params,
                body: Rc::new(body),
                no_instrument,
            },
            token_start(&start_tok),
            end,
        ))
    }

    /// `":" NEWLINE INDENT stmt+ DEDENT` or an inline `": simple_stmt"`.
    fn suite(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        self.expect(Tok::Colon, "expected ':'")?;

        if self.check(&Tok::Newline) {
            self.advance();
            self.expect(Tok::Indent, "expected an indented block")?;
            let mut body = Vec::new();
            while !self.check(&Tok::Dedent) && !self.check(&Tok::Eof) {
                body.push(self.statement()?);
            }
            self.expect(Tok::Dedent, "expected end of block")?;
            Ok(body)
        } else {
            let stmt = self.simple_statement()?;
            self.expect(Tok::Newline, "expected end of line")?;
            Ok(vec![stmt])
        }
    }

    // ---- expressions -----------------------------------------------------

    fn expression(&mut self) -> Result<Expr, SyntaxError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, SyntaxError> {
        let first = self.and_expr()?;
        if !self.check(&Tok::Or) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.check(&Tok::Or) {
            self.advance();
            values.push(self.and_expr()?);
        }
        Ok(self.span_expr(
            ExprKind::BoolOp {
                op: BoolOpKind::Or,
                values,
            },
        ))
    }

    fn and_expr(&mut self) -> Result<Expr, SyntaxError> {
        let first = self.not_expr()?;
        if !self.check(&Tok::And) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.check(&Tok::And) {
            self.advance();
            values.push(self.not_expr()?);
        }
        Ok(self.span_expr(
            ExprKind::BoolOp {
                op: BoolOpKind::And,
                values,
            },
        ))
    }

    fn not_expr(&mut self) -> Result<Expr, SyntaxError> {
        if self.check(&Tok::Not) {
            let start = token_start(self.peek());
            self.advance();
            let operand = self.not_expr()?;
            let end = (operand.range.end_lineno, operand.range.end_col_offset);
            return Ok(self.make_expr(
                ExprKind::UnaryOp {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                start,
                end,
            ));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, SyntaxError> {
        let left = self.arith()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek().tok {
                Tok::Lt => CmpOp::Lt,
                Tok::Gt => CmpOp::Gt,
                Tok::Le => CmpOp::Le,
                Tok::Ge => CmpOp::Ge,
                Tok::EqEq => CmpOp::Eq,
                Tok::NotEq => CmpOp::NotEq,
                Tok::In => CmpOp::In,
                Tok::Not => {
                    // 'not in'
                    if matches!(self.peek_ahead(1).map(|t| &t.tok), Some(Tok::In)) {
                        self.advance();
                        CmpOp::NotIn
                    } else {
                        break;
                    }
                }
                _ => break,
            };
            self.advance();
            rest.push((op, self.arith()?));
        }
        if rest.is_empty() {
            return Ok(left);
        }
        Ok(self.span_expr_from(
            left.range,
            rest.last().unwrap().1.range,
            ExprKind::Compare {
                left: Box::new(left),
                rest,
            },
        ))
    }

    fn arith(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek().tok {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.term()?;
            left = self.span_expr_from(
                left.range,
                right.range,
                ExprKind::BinOp {
                    left: Box::new(left),
                    op,
                    right: Box::new(right),
                },
            );
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.factor()?;
        loop {
            let op = match self.peek().tok {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::DoubleSlash => BinOp::FloorDiv,
                Tok::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.factor()?;
            left = self.span_expr_from(
                left.range,
                right.range,
                ExprKind::BinOp {
                    left: Box::new(left),
                    op,
                    right: Box::new(right),
                },
            );
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr, SyntaxError> {
        if self.check(&Tok::Minus) {
            let start = token_start(self.peek());
            self.advance();
            let operand = self.factor()?;
            let end = (operand.range.end_lineno, operand.range.end_col_offset);
            return Ok(self.make_expr(
                ExprKind::UnaryOp {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                },
                start,
                end,
            ));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.atom()?;
        loop {
            match self.peek().tok {
                Tok::LParen => {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.check(&Tok::RParen) {
                        loop {
                            args.push(self.expression()?);
                            if self.check(&Tok::Comma) {
                                self.advance();
                            } else {
                                break;
                            }
                        }
                    }
                    let close = self.expect(Tok::RParen, "expected ')'")?.clone();
                    expr = self.span_expr_from(
                        expr.range,
                        token_range(&close),
                        ExprKind::Call {
                            func: Box::new(expr),
                            args,
                        },
                    );
                }
                Tok::LBracket => {
                    self.advance();
                    let index = self.expression()?;
                    let close = self.expect(Tok::RBracket, "expected ']'")?.clone();
                    expr = self.span_expr_from(
                        expr.range,
                        token_range(&close),
                        ExprKind::Subscript {
                            value: Box::new(expr),
                            index: Box::new(index),
                        },
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn atom(&mut self) -> Result<Expr, SyntaxError> {
        let tok = self.peek().clone();
        let start = token_start(&tok);
        let single = (tok.end_lineno, tok.end_col_offset);
        match tok.tok {
            Tok::Int(v) => {
                self.advance();
                Ok(self.make_expr(ExprKind::Int(v), start, single))
            }
            Tok::Float(v) => {
                self.advance();
                Ok(self.make_expr(ExprKind::Float(v), start, single))
            }
            Tok::Str(s) => {
                self.advance();
                Ok(self.make_expr(ExprKind::Str(s), start, single))
            }
            Tok::True => {
                self.advance();
                Ok(self.make_expr(ExprKind::Bool(true), start, single))
            }
            Tok::False => {
                self.advance();
                Ok(self.make_expr(ExprKind::Bool(false), start, single))
            }
            Tok::None => {
                self.advance();
                Ok(self.make_expr(ExprKind::NoneLit, start, single))
            }
            Tok::Name(name) => {
                self.advance();
                Ok(self.make_expr(ExprKind::Name(name), start, single))
            }
            Tok::LParen => {
                self.advance();
                if self.check(&Tok::RParen) {
                    let close = self.advance().clone();
                    return Ok(self.make_expr(
                        ExprKind::Tuple(Vec::new()),
                        start,
                        (close.end_lineno, close.end_col_offset),
                    ));
                }
                let first = self.expression()?;
                if self.check(&Tok::Comma) {
                    let mut items = vec![first];
                    while self.check(&Tok::Comma) {
                        self.advance();
                        if self.check(&Tok::RParen) {
                            break;
                        }
                        items.push(self.expression()?);
                    }
                    let close = self.expect(Tok::RParen, "expected ')'")?.clone();
                    Ok(self.make_expr(
                        ExprKind::Tuple(items),
                        start,
                        (close.end_lineno, close.end_col_offset),
                    ))
                } else {
                    // parenthesized expression keeps its inner node but the
                    // outer parens do not become a node of their own
                    self.expect(Tok::RParen, "expected ')'")?;
                    Ok(first)
                }
            }
            Tok::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if !self.check(&Tok::RBracket) {
                    loop {
                        items.push(self.expression()?);
                        if self.check(&Tok::Comma) {
                            self.advance();
                            if self.check(&Tok::RBracket) {
                                break;
                            }
                        } else {
                            break;
                        }
                    }
                }
                let close = self.expect(Tok::RBracket, "expected ']'")?.clone();
                Ok(self.make_expr(
                    ExprKind::List(items),
                    start,
                    (close.end_lineno, close.end_col_offset),
                ))
            }
            Tok::LBrace => {
                self.advance();
                let mut pairs = Vec::new();
                if !self.check(&Tok::RBrace) {
                    loop {
                        let key = self.expression()?;
                        self.expect(Tok::Colon, "expected ':' in dict literal")?;
                        let value = self.expression()?;
                        pairs.push((key, value));
                        if self.check(&Tok::Comma) {
                            self.advance();
                            if self.check(&Tok::RBrace) {
                                break;
                            }
                        } else {
                            break;
                        }
                    }
                }
                let close = self.expect(Tok::RBrace, "expected '}'")?.clone();
                Ok(self.make_expr(
                    ExprKind::Dict(pairs),
                    start,
                    (close.end_lineno, close.end_col_offset),
                ))
            }
            other => Err(SyntaxError::new(
                format!("unexpected token: {other:?}"),
                tok.lineno,
                tok.col_offset,
            )),
        }
    }

    // ---- plumbing --------------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_ahead(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n)
    }

    fn check(&self, tok: &Tok) -> bool {
        &self.peek().tok == tok
    }

    fn advance(&mut self) -> &Token {
        let tok = &self.tokens[self.pos];
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, tok: Tok, message: &str) -> Result<&Token, SyntaxError> {
        if self.peek().tok == tok {
            Ok(self.advance())
        } else {
            let t = self.peek();
            Err(SyntaxError::new(
                format!("{message}, found {:?}", t.tok),
                t.lineno,
                t.col_offset,
            ))
        }
    }

    fn expect_name(&mut self, message: &str) -> Result<String, SyntaxError> {
        match self.peek().tok.clone() {
            Tok::Name(name) => {
                self.advance();
                Ok(name)
            }
            other => {
                let t = self.peek();
                Err(SyntaxError::new(
                    format!("{message}, found {other:?}"),
                    t.lineno,
                    t.col_offset,
                ))
            }
        }
    }

    fn fresh_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn make_stmt(&mut self, kind: StmtKind, start: (u32, u32), end: (u32, u32)) -> Stmt {
        Stmt {
            id: self.fresh_id(),
            range: TextRange::new(start.0, start.1, end.0, end.1),
            kind,
        }
    }

    fn make_expr(&mut self, kind: ExprKind, start: (u32, u32), end: (u32, u32)) -> Expr {
        Expr {
            id: self.fresh_id(),
            range: TextRange::new(start.0, start.1, end.0, end.1),
            kind,
        }
    }

    /// Expression spanning from the first to the last of its children.
    fn span_expr(&mut self, kind: ExprKind) -> Expr {
        let (first, last) = match &kind {
            ExprKind::BoolOp { values, .. } => {
                (values.first().unwrap().range, values.last().unwrap().range)
            }
            _ => unreachable!("span_expr used for variadic nodes only"),
        };
        self.span_expr_from(first, last, kind)
    }

    fn span_expr_from(&mut self, first: TextRange, last: TextRange, kind: ExprKind) -> Expr {
        self.make_expr(
            kind,
            (first.lineno, first.col_offset),
            (last.end_lineno, last.end_col_offset),
        )
    }
}

fn token_start(tok: &Token) -> (u32, u32) {
    (tok.lineno, tok.col_offset)
}

fn token_range(tok: &Token) -> TextRange {
    TextRange::new(tok.lineno, tok.col_offset, tok.end_lineno, tok.end_col_offset)
}

fn body_end(body: &[Stmt]) -> (u32, u32) {
    let last = body.last().expect("suite is never empty");
    (last.range.end_lineno, last.range.end_col_offset)
}
