//! The evaluator.
//!
//! Executes an AST against a global scope, reporting progress to a
//! [`TraceHook`] and doing program I/O through a [`ProgramIo`]. Marker calls
//! spliced in by instrumentation are routed to the hook instead of the normal
//! call machinery, so stepping works without the evaluator knowing anything
//! about debugging policy.

use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use transport::types::{PauseEvent, TextRange};

use crate::lang::ast::*;
use crate::{
    is_marker_name, AFTER_EXPRESSION_MARKER, AFTER_STATEMENT_MARKER, BEFORE_EXPRESSION_MARKER,
    BEFORE_STATEMENT_MARKER, LAST_VALUE_BUILTIN,
};

use super::value::{range_len, FunctionObject, RunError, Value};

const MAX_CALL_DEPTH: usize = 200;
/// Refuses to materialize absurd ranges instead of exhausting memory.
const MAX_RANGE_ITEMS: i64 = 10_000_000;

pub const BUILTIN_NAMES: &[&str] = &[
    "print", "input", "len", "range", "str", "int", "float", "bool", "abs", "min", "max", "sum",
    "exit",
];

#[derive(Debug)]
pub enum TraceEvent {
    /// About to execute a (non-marker) statement.
    Line { range: TextRange },
    /// A user function frame was just pushed.
    Call,
    /// The current frame is about to return.
    Return,
    BeforeStmt { node: NodeId },
    AfterStmt { node: NodeId },
    BeforeExpr { node: NodeId },
    AfterExpr { node: NodeId, value: Value },
}

pub trait TraceHook {
    fn on_event(&mut self, state: &mut ExecState, event: TraceEvent) -> Result<(), RunError>;
}

pub struct NoopHook;

impl TraceHook for NoopHook {
    fn on_event(&mut self, _state: &mut ExecState, _event: TraceEvent) -> Result<(), RunError> {
        Ok(())
    }
}

pub trait ProgramIo {
    fn write_stdout(&mut self, data: &str) -> Result<(), RunError>;
    fn write_stderr(&mut self, data: &str) -> Result<(), RunError>;
    /// Blocks until a line of stdin arrives; returned without its newline.
    fn read_line(&mut self) -> Result<String, RunError>;
}

/// Frame stack plus globals: everything a trace hook may inspect or export.
pub struct ExecState {
    pub filename: String,
    pub globals: BTreeMap<String, Value>,
    pub frames: Vec<Frame>,
}

pub struct Frame {
    pub id: u64,
    pub code_name: String,
    pub firstlineno: u32,
    /// `None` at module level, where locals are the globals.
    pub locals: Option<BTreeMap<String, Value>>,
    pub lineno: u32,
    pub event: PauseEvent,
    pub focus: Option<TextRange>,
    pub current_statement: Option<TextRange>,
    pub current_root_expression: Option<TextRange>,
    pub current_evaluations: Vec<(TextRange, Value)>,
}

impl Frame {
    fn new(id: u64, code_name: String, firstlineno: u32, locals: Option<BTreeMap<String, Value>>) -> Self {
        Self {
            id,
            code_name,
            firstlineno,
            locals,
            lineno: firstlineno,
            event: PauseEvent::Call,
            focus: None,
            current_statement: None,
            current_root_expression: None,
            current_evaluations: Vec::new(),
        }
    }
}

enum Flow {
    Break(TextRange),
    Continue(TextRange),
    Return(Value),
    Err(RunError),
}

impl From<RunError> for Flow {
    fn from(e: RunError) -> Self {
        Flow::Err(e)
    }
}

type StmtResult = Result<(), Flow>;
type ExprResult = Result<Value, RunError>;

pub struct Interp<'a> {
    pub state: ExecState,
    hook: &'a mut dyn TraceHook,
    io: &'a mut dyn ProgramIo,
    interrupt: Arc<AtomicBool>,
    next_frame_id: u64,
    /// Value the REPL convenience name `_` resolves to.
    last_value: Value,
}

impl<'a> Interp<'a> {
    pub fn new(
        filename: impl Into<String>,
        globals: BTreeMap<String, Value>,
        hook: &'a mut dyn TraceHook,
        io: &'a mut dyn ProgramIo,
        interrupt: Arc<AtomicBool>,
        last_value: Value,
    ) -> Self {
        let filename = filename.into();
        let mut interp = Self {
            state: ExecState {
                filename,
                globals,
                frames: Vec::new(),
            },
            hook,
            io,
            interrupt,
            next_frame_id: 1,
            last_value,
        };
        let module_frame = Frame::new(interp.fresh_frame_id(), "<module>".to_owned(), 1, None);
        interp.state.frames.push(module_frame);
        interp
    }

    pub fn into_globals(self) -> BTreeMap<String, Value> {
        self.state.globals
    }

    /// Runs a module body to completion.
    pub fn exec_module(&mut self, body: &[Stmt]) -> Result<(), RunError> {
        for stmt in body {
            self.exec_stmt(stmt).map_err(|flow| self.flow_to_error(flow))?;
        }
        Ok(())
    }

    /// Evaluates a single expression (the trailing expression of shell
    /// input).
    pub fn eval_expression(&mut self, expr: &Expr) -> Result<Value, RunError> {
        self.eval_expr(expr)
    }

    fn flow_to_error(&self, flow: Flow) -> RunError {
        match flow {
            Flow::Err(e) => e,
            Flow::Break(range) => {
                RunError::new("SyntaxError", "'break' outside loop").at(range)
            }
            Flow::Continue(range) => {
                RunError::new("SyntaxError", "'continue' not properly in loop").at(range)
            }
            Flow::Return(_) => RunError::new("SyntaxError", "'return' outside function"),
        }
    }

    // ---- statements ------------------------------------------------------

    fn exec_suite(&mut self, body: &[Stmt]) -> StmtResult {
        for stmt in body {
            self.exec_stmt(stmt)?;
        }
        Ok(())
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> StmtResult {
        self.check_interrupt()?;
        self.current_frame_mut().lineno = stmt.range.lineno;

        if !is_marker_stmt(stmt) {
            self.hook
                .on_event(&mut self.state, TraceEvent::Line { range: stmt.range })?;
        }

        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval_expr(expr)?;
                Ok(())
            }
            StmtKind::Assign { target, value } => {
                let value = self.eval_expr(value)?;
                self.assign_target(target, value)?;
                Ok(())
            }
            StmtKind::AugAssign { target, op, value } => {
                let current = self.load_target(target)?;
                let rhs = self.eval_expr(value)?;
                let combined = binary_op(&current, *op, &rhs).map_err(|e| e.at(stmt.range))?;
                self.assign_target(target, combined)?;
                Ok(())
            }
            StmtKind::If { branches, orelse } => {
                for (test, body) in branches {
                    if self.eval_expr(test)?.is_truthy() {
                        return self.exec_suite(body);
                    }
                }
                self.exec_suite(orelse)
            }
            StmtKind::While { test, body } => {
                loop {
                    self.check_interrupt()?;
                    if !self.eval_expr(test)?.is_truthy() {
                        break;
                    }
                    match self.exec_suite(body) {
                        Ok(()) => {}
                        Err(Flow::Break(_)) => break,
                        Err(Flow::Continue(_)) => continue,
                        Err(other) => return Err(other),
                    }
                }
                Ok(())
            }
            StmtKind::For { target, iter, body } => {
                let iterable = self.eval_expr(iter)?;
                let items = iter_values(&iterable).map_err(|e| e.at(iter.range))?;
                for item in items {
                    self.check_interrupt()?;
                    self.assign_target(target, item)?;
                    match self.exec_suite(body) {
                        Ok(()) => {}
                        Err(Flow::Break(_)) => break,
                        Err(Flow::Continue(_)) => continue,
                        Err(other) => return Err(other),
                    }
                }
                Ok(())
            }
            StmtKind::FuncDef {
                name, params, body, ..
            } => {
                let func = Value::Func(Rc::new(FunctionObject {
                    name: name.clone(),
                    params: params.clone(),
                    body: Rc::clone(body),
                    firstlineno: stmt.range.lineno,
                }));
                self.assign_name(name, func);
                Ok(())
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval_expr(expr)?,
                    None => Value::None,
                };
                Err(Flow::Return(value))
            }
            StmtKind::Pass => Ok(()),
            StmtKind::Break => Err(Flow::Break(stmt.range)),
            StmtKind::Continue => Err(Flow::Continue(stmt.range)),
        }
    }

    fn check_interrupt(&mut self) -> Result<(), RunError> {
        if self.interrupt.swap(false, Ordering::SeqCst) {
            Err(RunError::interrupt())
        } else {
            Ok(())
        }
    }

    // ---- names and targets -----------------------------------------------

    fn current_frame_mut(&mut self) -> &mut Frame {
        self.state.frames.last_mut().expect("frame stack never empty")
    }

    fn assign_name(&mut self, name: &str, value: Value) {
        match self.current_frame_mut().locals.as_mut() {
            Some(locals) => {
                locals.insert(name.to_owned(), value);
            }
            None => {
                self.state.globals.insert(name.to_owned(), value);
            }
        }
    }

    fn lookup_name(&self, name: &str, range: TextRange) -> ExprResult {
        if let Some(locals) = self.state.frames.last().and_then(|f| f.locals.as_ref()) {
            if let Some(v) = locals.get(name) {
                return Ok(v.clone());
            }
        }
        if let Some(v) = self.state.globals.get(name) {
            return Ok(v.clone());
        }
        if let Some(interned) = BUILTIN_NAMES.iter().copied().find(|n| *n == name) {
            return Ok(Value::Builtin(interned));
        }
        Err(RunError::new("NameError", format!("name '{name}' is not defined")).at(range))
    }

    fn assign_target(&mut self, target: &Target, value: Value) -> Result<(), RunError> {
        match target {
            Target::Name { name, .. } => {
                self.assign_name(name, value);
                Ok(())
            }
            Target::Subscript {
                value: container,
                index,
            } => {
                let container_v = self.eval_expr(container)?;
                let index_v = self.eval_expr(index)?;
                store_subscript(&container_v, &index_v, value).map_err(|e| e.at(container.range))
            }
        }
    }

    fn load_target(&mut self, target: &Target) -> ExprResult {
        match target {
            Target::Name { name, range } => self.lookup_name(name, *range),
            Target::Subscript {
                value: container,
                index,
            } => {
                let container_v = self.eval_expr(container)?;
                let index_v = self.eval_expr(index)?;
                load_subscript(&container_v, &index_v).map_err(|e| e.at(container.range))
            }
        }
    }

    // ---- expressions -----------------------------------------------------

    fn eval_expr(&mut self, expr: &Expr) -> ExprResult {
        match &expr.kind {
            ExprKind::Int(v) => Ok(Value::Int(*v)),
            ExprKind::Float(v) => Ok(Value::Float(*v)),
            ExprKind::Str(v) => Ok(Value::str(v.clone())),
            ExprKind::Bool(v) => Ok(Value::Bool(*v)),
            ExprKind::NoneLit => Ok(Value::None),
            ExprKind::Name(name) => self.lookup_name(name, expr.range),
            ExprKind::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval_expr(item)?);
                }
                Ok(Value::list(values))
            }
            ExprKind::Tuple(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval_expr(item)?);
                }
                Ok(Value::Tuple(Rc::new(values)))
            }
            ExprKind::Dict(pairs) => {
                let mut values = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    let key = self.eval_expr(k)?;
                    let value = self.eval_expr(v)?;
                    if let Some(slot) = values.iter_mut().find(|(k2, _): &&mut (Value, Value)| {
                        k2.py_eq(&key)
                    }) {
                        slot.1 = value;
                    } else {
                        values.push((key, value));
                    }
                }
                Ok(Value::Dict(Rc::new(std::cell::RefCell::new(values))))
            }
            ExprKind::UnaryOp { op, operand } => {
                let v = self.eval_expr(operand)?;
                unary_op(*op, &v).map_err(|e| e.at(expr.range))
            }
            ExprKind::BinOp { left, op, right } => {
                let l = self.eval_expr(left)?;
                let r = self.eval_expr(right)?;
                binary_op(&l, *op, &r).map_err(|e| e.at(expr.range))
            }
            ExprKind::BoolOp { op, values } => {
                let mut result = Value::None;
                for (i, value) in values.iter().enumerate() {
                    result = self.eval_expr(value)?;
                    let truthy = result.is_truthy();
                    let last = i == values.len() - 1;
                    match op {
                        BoolOpKind::And if !truthy => return Ok(result),
                        BoolOpKind::Or if truthy => return Ok(result),
                        _ if last => return Ok(result),
                        _ => {}
                    }
                }
                Ok(result)
            }
            ExprKind::Compare { left, rest } => {
                let mut prev = self.eval_expr(left)?;
                for (op, right) in rest {
                    let next = self.eval_expr(right)?;
                    if !compare(&prev, *op, &next).map_err(|e| e.at(expr.range))? {
                        return Ok(Value::Bool(false));
                    }
                    prev = next;
                }
                Ok(Value::Bool(true))
            }
            ExprKind::Call { func, args } => self.eval_call(expr, func, args),
            ExprKind::Subscript { value, index } => {
                let container = self.eval_expr(value)?;
                let index_v = self.eval_expr(index)?;
                load_subscript(&container, &index_v).map_err(|e| e.at(expr.range))
            }
        }
    }

    fn eval_call(&mut self, call: &Expr, func: &Expr, args: &[Expr]) -> ExprResult {
        // marker calls spliced by instrumentation bypass normal dispatch
        if let ExprKind::Name(name) = &func.kind {
            if is_marker_name(name) {
                return self.eval_marker_call(name, args);
            }
            if name == LAST_VALUE_BUILTIN {
                return Ok(self.last_value.clone());
            }
        }

        let callee = self.eval_expr(func)?;
        let mut arg_values = Vec::with_capacity(args.len());
        for arg in args {
            arg_values.push(self.eval_expr(arg)?);
        }

        match callee {
            Value::Func(f) => self.call_function(&f, arg_values, call.range),
            Value::Builtin(name) => self.call_builtin(name, arg_values, call.range),
            other => Err(RunError::new(
                "TypeError",
                format!("'{}' object is not callable", other.type_name()),
            )
            .at(func.range)),
        }
    }

    fn eval_marker_call(&mut self, name: &str, args: &[Expr]) -> ExprResult {
        match name {
            BEFORE_STATEMENT_MARKER | AFTER_STATEMENT_MARKER => {
                let node = marker_node_id(args)?;
                let event = if name == BEFORE_STATEMENT_MARKER {
                    TraceEvent::BeforeStmt { node }
                } else {
                    TraceEvent::AfterStmt { node }
                };
                self.hook.on_event(&mut self.state, event)?;
                Ok(Value::None)
            }
            BEFORE_EXPRESSION_MARKER => {
                let node = marker_node_id(args)?;
                self.hook
                    .on_event(&mut self.state, TraceEvent::BeforeExpr { node })?;
                Ok(Value::Int(node as i64))
            }
            AFTER_EXPRESSION_MARKER => {
                if args.len() != 2 {
                    return Err(RunError::new("RuntimeError", "malformed marker call"));
                }
                // evaluating the first argument fires the nested
                // before-expression marker
                let token = self.eval_expr(&args[0])?;
                let value = self.eval_expr(&args[1])?;
                let node = match token {
                    Value::Int(id) => id as NodeId,
                    other => {
                        return Err(RunError::new(
                            "RuntimeError",
                            format!("bad marker token: {}", other.repr()),
                        ))
                    }
                };
                self.hook.on_event(
                    &mut self.state,
                    TraceEvent::AfterExpr {
                        node,
                        value: value.clone(),
                    },
                )?;
                Ok(value)
            }
            _ => unreachable!("not a marker name: {name}"),
        }
    }

    fn call_function(
        &mut self,
        func: &Rc<FunctionObject>,
        args: Vec<Value>,
        call_range: TextRange,
    ) -> ExprResult {
        if self.state.frames.len() >= MAX_CALL_DEPTH {
            return Err(RunError::new(
                "RecursionError",
                "maximum recursion depth exceeded",
            )
            .at(call_range));
        }
        if args.len() != func.params.len() {
            return Err(RunError::new(
                "TypeError",
                format!(
                    "{}() takes {} positional arguments but {} were given",
                    func.name,
                    func.params.len(),
                    args.len()
                ),
            )
            .at(call_range));
        }

        let locals: BTreeMap<String, Value> = func
            .params
            .iter()
            .cloned()
            .zip(args)
            .collect();
        let frame = Frame::new(
            self.fresh_frame_id(),
            func.name.clone(),
            func.firstlineno,
            Some(locals),
        );
        self.state.frames.push(frame);
        self.hook.on_event(&mut self.state, TraceEvent::Call)?;

        let mut result = match self.exec_suite(&func.body) {
            Ok(()) => Ok(Value::None),
            Err(Flow::Return(v)) => Ok(v),
            Err(other) => Err(self.flow_to_error(other)),
        };

        if result.is_ok() {
            if let Err(e) = self.hook.on_event(&mut self.state, TraceEvent::Return) {
                result = Err(e);
            }
        }
        if let Err(e) = &mut result {
            let frame = self.state.frames.last().expect("callee frame present");
            e.traceback.push((frame.code_name.clone(), frame.lineno));
        }
        self.state.frames.pop();
        result
    }

    fn call_builtin(&mut self, name: &str, args: Vec<Value>, range: TextRange) -> ExprResult {
        match name {
            "print" => {
                let rendered: Vec<String> = args.iter().map(Value::str_value).collect();
                self.io.write_stdout(&(rendered.join(" ") + "\n"))?;
                Ok(Value::None)
            }
            "input" => {
                if let Some(prompt) = args.first() {
                    self.io.write_stdout(&prompt.str_value())?;
                }
                let line = self.io.read_line()?;
                Ok(Value::str(line))
            }
            "len" => match args.as_slice() {
                [Value::Str(s)] => Ok(Value::Int(s.chars().count() as i64)),
                [Value::List(items)] => Ok(Value::Int(items.borrow().len() as i64)),
                [Value::Tuple(items)] => Ok(Value::Int(items.len() as i64)),
                [Value::Dict(pairs)] => Ok(Value::Int(pairs.borrow().len() as i64)),
                [Value::Range { start, stop, step }] => {
                    Ok(Value::Int(range_len(*start, *stop, *step)))
                }
                [other] => Err(RunError::new(
                    "TypeError",
                    format!("object of type '{}' has no len()", other.type_name()),
                )
                .at(range)),
                _ => Err(arity_error("len", 1, args.len()).at(range)),
            },
            "range" => {
                let ints: Result<Vec<i64>, RunError> = args
                    .iter()
                    .map(|v| match v {
                        Value::Int(i) => Ok(*i),
                        Value::Bool(b) => Ok(*b as i64),
                        other => Err(RunError::new(
                            "TypeError",
                            format!(
                                "'{}' object cannot be interpreted as an integer",
                                other.type_name()
                            ),
                        )),
                    })
                    .collect();
                let ints = ints.map_err(|e| e.at(range))?;
                match ints.as_slice() {
                    [stop] => Ok(Value::Range {
                        start: 0,
                        stop: *stop,
                        step: 1,
                    }),
                    [start, stop] => Ok(Value::Range {
                        start: *start,
                        stop: *stop,
                        step: 1,
                    }),
                    [start, stop, step] if *step != 0 => Ok(Value::Range {
                        start: *start,
                        stop: *stop,
                        step: *step,
                    }),
                    [_, _, _] => {
                        Err(RunError::new("ValueError", "range() arg 3 must not be zero").at(range))
                    }
                    _ => Err(arity_error("range", 3, args.len()).at(range)),
                }
            }
            "str" => match args.as_slice() {
                [] => Ok(Value::str("")),
                [v] => Ok(Value::str(v.str_value())),
                _ => Err(arity_error("str", 1, args.len()).at(range)),
            },
            "int" => match args.as_slice() {
                [Value::Int(i)] => Ok(Value::Int(*i)),
                [Value::Bool(b)] => Ok(Value::Int(*b as i64)),
                [Value::Float(f)] => Ok(Value::Int(f.trunc() as i64)),
                [Value::Str(s)] => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                    RunError::new(
                        "ValueError",
                        format!("invalid literal for int() with base 10: {}", repr_of(s)),
                    )
                    .at(range)
                }),
                [other] => Err(RunError::new(
                    "TypeError",
                    format!("int() argument must not be '{}'", other.type_name()),
                )
                .at(range)),
                _ => Err(arity_error("int", 1, args.len()).at(range)),
            },
            "float" => match args.as_slice() {
                [Value::Int(i)] => Ok(Value::Float(*i as f64)),
                [Value::Float(f)] => Ok(Value::Float(*f)),
                [Value::Bool(b)] => Ok(Value::Float(*b as i64 as f64)),
                [Value::Str(s)] => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                    RunError::new(
                        "ValueError",
                        format!("could not convert string to float: {}", repr_of(s)),
                    )
                    .at(range)
                }),
                [other] => Err(RunError::new(
                    "TypeError",
                    format!("float() argument must not be '{}'", other.type_name()),
                )
                .at(range)),
                _ => Err(arity_error("float", 1, args.len()).at(range)),
            },
            "bool" => match args.as_slice() {
                [] => Ok(Value::Bool(false)),
                [v] => Ok(Value::Bool(v.is_truthy())),
                _ => Err(arity_error("bool", 1, args.len()).at(range)),
            },
            "abs" => match args.as_slice() {
                [Value::Int(i)] => Ok(Value::Int(i.abs())),
                [Value::Float(f)] => Ok(Value::Float(f.abs())),
                [other] => Err(RunError::new(
                    "TypeError",
                    format!("bad operand type for abs(): '{}'", other.type_name()),
                )
                .at(range)),
                _ => Err(arity_error("abs", 1, args.len()).at(range)),
            },
            "min" | "max" => {
                let items = if args.len() == 1 {
                    iter_values(&args[0]).map_err(|e| e.at(range))?
                } else {
                    args
                };
                if items.is_empty() {
                    return Err(
                        RunError::new("ValueError", format!("{name}() arg is an empty sequence"))
                            .at(range),
                    );
                }
                let mut best = items[0].clone();
                for item in &items[1..] {
                    let cmp = if name == "min" { CmpOp::Lt } else { CmpOp::Gt };
                    if compare(item, cmp, &best).map_err(|e| e.at(range))? {
                        best = item.clone();
                    }
                }
                Ok(best)
            }
            "sum" => match args.as_slice() {
                [container] => {
                    let items = iter_values(container).map_err(|e| e.at(range))?;
                    let mut acc = Value::Int(0);
                    for item in items {
                        acc = binary_op(&acc, BinOp::Add, &item).map_err(|e| e.at(range))?;
                    }
                    Ok(acc)
                }
                _ => Err(arity_error("sum", 1, args.len()).at(range)),
            },
            "exit" => {
                let code = match args.first() {
                    Some(Value::Int(i)) => *i,
                    _ => 0,
                };
                Err(RunError::system_exit(code))
            }
            other => Err(RunError::new(
                "NameError",
                format!("name '{other}' is not defined"),
            )
            .at(range)),
        }
    }

    fn fresh_frame_id(&mut self) -> u64 {
        let id = self.next_frame_id;
        self.next_frame_id += 1;
        id
    }
}

fn marker_node_id(args: &[Expr]) -> Result<NodeId, RunError> {
    match args.first().map(|a| &a.kind) {
        Some(ExprKind::Int(id)) => Ok(*id as NodeId),
        _ => Err(RunError::new("RuntimeError", "malformed marker call")),
    }
}

fn is_marker_stmt(stmt: &Stmt) -> bool {
    if let StmtKind::Expr(expr) = &stmt.kind {
        if let ExprKind::Call { func, .. } = &expr.kind {
            if let ExprKind::Name(name) = &func.kind {
                return is_marker_name(name);
            }
        }
    }
    false
}

fn repr_of(s: &str) -> String {
    Value::str(s).repr()
}

fn arity_error(name: &str, expected: usize, got: usize) -> RunError {
    RunError::new(
        "TypeError",
        format!("{name}() takes at most {expected} arguments ({got} given)"),
    )
}

// ---- operators -----------------------------------------------------------

fn unary_op(op: UnaryOp, v: &Value) -> ExprResult {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!v.is_truthy())),
        UnaryOp::Neg => match v {
            Value::Int(i) => Ok(Value::Int(-i)),
            Value::Float(f) => Ok(Value::Float(-f)),
            Value::Bool(b) => Ok(Value::Int(-(*b as i64))),
            other => Err(RunError::new(
                "TypeError",
                format!("bad operand type for unary -: '{}'", other.type_name()),
            )),
        },
    }
}

pub fn binary_op(left: &Value, op: BinOp, right: &Value) -> ExprResult {
    use Value::*;

    // numeric promotion first
    if let (Some(a), Some(b)) = (as_int(left), as_int(right)) {
        return int_binary_op(a, op, b);
    }
    if let (Some(a), Some(b)) = (as_float(left), as_float(right)) {
        return float_binary_op(a, op, b);
    }

    match (left, op, right) {
        (Str(a), BinOp::Add, Str(b)) => Ok(Value::str(format!("{a}{b}"))),
        (List(a), BinOp::Add, List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Ok(Value::list(items))
        }
        (Tuple(a), BinOp::Add, Tuple(b)) => {
            let mut items = a.as_ref().clone();
            items.extend(b.iter().cloned());
            Ok(Value::Tuple(Rc::new(items)))
        }
        (Str(s), BinOp::Mul, Int(n)) | (Int(n), BinOp::Mul, Str(s)) => {
            Ok(Value::str(s.repeat((*n).max(0) as usize)))
        }
        (List(items), BinOp::Mul, Int(n)) | (Int(n), BinOp::Mul, List(items)) => {
            let source = items.borrow();
            let mut result = Vec::with_capacity(source.len() * (*n).max(0) as usize);
            for _ in 0..(*n).max(0) {
                result.extend(source.iter().cloned());
            }
            Ok(Value::list(result))
        }
        _ => Err(RunError::new(
            "TypeError",
            format!(
                "unsupported operand type(s) for {}: '{}' and '{}'",
                op.symbol(),
                left.type_name(),
                right.type_name()
            ),
        )),
    }
}

fn as_int(v: &Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(*i),
        Value::Bool(b) => Some(*b as i64),
        _ => None,
    }
}

fn as_float(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Bool(b) => Some(*b as i64 as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn int_binary_op(a: i64, op: BinOp, b: i64) -> ExprResult {
    let overflow = || RunError::new("OverflowError", "integer result too large");
    match op {
        BinOp::Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
        BinOp::Sub => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
        BinOp::Mul => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
        BinOp::Div => {
            if b == 0 {
                Err(RunError::new("ZeroDivisionError", "division by zero"))
            } else {
                Ok(Value::Float(a as f64 / b as f64))
            }
        }
        BinOp::FloorDiv => {
            if b == 0 {
                Err(RunError::new(
                    "ZeroDivisionError",
                    "integer division or modulo by zero",
                ))
            } else {
                let q = a / b;
                let r = a % b;
                Ok(Value::Int(if r != 0 && (r < 0) != (b < 0) {
                    q - 1
                } else {
                    q
                }))
            }
        }
        BinOp::Mod => {
            if b == 0 {
                Err(RunError::new(
                    "ZeroDivisionError",
                    "integer division or modulo by zero",
                ))
            } else {
                let r = a % b;
                Ok(Value::Int(if r != 0 && (r < 0) != (b < 0) {
                    r + b
                } else {
                    r
                }))
            }
        }
    }
}

fn float_binary_op(a: f64, op: BinOp, b: f64) -> ExprResult {
    match op {
        BinOp::Add => Ok(Value::Float(a + b)),
        BinOp::Sub => Ok(Value::Float(a - b)),
        BinOp::Mul => Ok(Value::Float(a * b)),
        BinOp::Div => {
            if b == 0.0 {
                Err(RunError::new("ZeroDivisionError", "float division by zero"))
            } else {
                Ok(Value::Float(a / b))
            }
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                Err(RunError::new("ZeroDivisionError", "float floor division by zero"))
            } else {
                Ok(Value::Float((a / b).floor()))
            }
        }
        BinOp::Mod => {
            if b == 0.0 {
                Err(RunError::new("ZeroDivisionError", "float modulo"))
            } else {
                let r = a % b;
                Ok(Value::Float(if r != 0.0 && (r < 0.0) != (b < 0.0) {
                    r + b
                } else {
                    r
                }))
            }
        }
    }
}

pub fn compare(left: &Value, op: CmpOp, right: &Value) -> Result<bool, RunError> {
    match op {
        CmpOp::Eq => return Ok(left.py_eq(right)),
        CmpOp::NotEq => return Ok(!left.py_eq(right)),
        CmpOp::In => return contains(right, left),
        CmpOp::NotIn => return contains(right, left).map(|b| !b),
        _ => {}
    }

    let ordering = match (as_float(left), as_float(right)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (left, right) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => {
                return Err(RunError::new(
                    "TypeError",
                    format!(
                        "'{}' not supported between instances of '{}' and '{}'",
                        op.symbol(),
                        left.type_name(),
                        right.type_name()
                    ),
                ))
            }
        },
    };

    let Some(ordering) = ordering else {
        return Ok(false); // NaN comparisons
    };
    Ok(match op {
        CmpOp::Lt => ordering.is_lt(),
        CmpOp::Le => ordering.is_le(),
        CmpOp::Gt => ordering.is_gt(),
        CmpOp::Ge => ordering.is_ge(),
        _ => unreachable!(),
    })
}

fn contains(container: &Value, needle: &Value) -> Result<bool, RunError> {
    match container {
        Value::List(items) => Ok(items.borrow().iter().any(|v| v.py_eq(needle))),
        Value::Tuple(items) => Ok(items.iter().any(|v| v.py_eq(needle))),
        Value::Dict(pairs) => Ok(pairs.borrow().iter().any(|(k, _)| k.py_eq(needle))),
        Value::Str(haystack) => match needle {
            Value::Str(sub) => Ok(haystack.contains(sub.as_str())),
            other => Err(RunError::new(
                "TypeError",
                format!(
                    "'in <string>' requires string as left operand, not {}",
                    other.type_name()
                ),
            )),
        },
        Value::Range { .. } => {
            let items = iter_values(container)?;
            Ok(items.iter().any(|v| v.py_eq(needle)))
        }
        other => Err(RunError::new(
            "TypeError",
            format!("argument of type '{}' is not iterable", other.type_name()),
        )),
    }
}

pub fn iter_values(v: &Value) -> Result<Vec<Value>, RunError> {
    match v {
        Value::List(items) => Ok(items.borrow().clone()),
        Value::Tuple(items) => Ok(items.as_ref().clone()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::str(c.to_string())).collect()),
        Value::Dict(pairs) => Ok(pairs.borrow().iter().map(|(k, _)| k.clone()).collect()),
        Value::Range { start, stop, step } => {
            let len = range_len(*start, *stop, *step);
            if len > MAX_RANGE_ITEMS {
                return Err(RunError::new("MemoryError", "range result too large"));
            }
            let mut items = Vec::with_capacity(len as usize);
            let mut current = *start;
            for _ in 0..len {
                items.push(Value::Int(current));
                current += step;
            }
            Ok(items)
        }
        other => Err(RunError::new(
            "TypeError",
            format!("'{}' object is not iterable", other.type_name()),
        )),
    }
}

fn load_subscript(container: &Value, index: &Value) -> ExprResult {
    match container {
        Value::List(items) => {
            let items = items.borrow();
            let idx = normalize_index(index, items.len(), "list")?;
            Ok(items[idx].clone())
        }
        Value::Tuple(items) => {
            let idx = normalize_index(index, items.len(), "tuple")?;
            Ok(items[idx].clone())
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = normalize_index(index, chars.len(), "string")?;
            Ok(Value::str(chars[idx].to_string()))
        }
        Value::Dict(pairs) => {
            let pairs = pairs.borrow();
            pairs
                .iter()
                .find(|(k, _)| k.py_eq(index))
                .map(|(_, v)| v.clone())
                .ok_or_else(|| RunError::new("KeyError", index.repr()))
        }
        other => Err(RunError::new(
            "TypeError",
            format!("'{}' object is not subscriptable", other.type_name()),
        )),
    }
}

fn store_subscript(container: &Value, index: &Value, value: Value) -> Result<(), RunError> {
    match container {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            let idx = normalize_index(index, items.len(), "list")?;
            items[idx] = value;
            Ok(())
        }
        Value::Dict(pairs) => {
            let mut pairs = pairs.borrow_mut();
            if let Some(slot) = pairs.iter_mut().find(|(k, _)| k.py_eq(index)) {
                slot.1 = value;
            } else {
                pairs.push((index.clone(), value));
            }
            Ok(())
        }
        other => Err(RunError::new(
            "TypeError",
            format!(
                "'{}' object does not support item assignment",
                other.type_name()
            ),
        )),
    }
}

fn normalize_index(index: &Value, len: usize, what: &str) -> Result<usize, RunError> {
    let i = match index {
        Value::Int(i) => *i,
        Value::Bool(b) => *b as i64,
        other => {
            return Err(RunError::new(
                "TypeError",
                format!(
                    "{what} indices must be integers, not {}",
                    other.type_name()
                ),
            ))
        }
    };
    let adjusted = if i < 0 { i + len as i64 } else { i };
    if adjusted < 0 || adjusted >= len as i64 {
        Err(RunError::new(
            "IndexError",
            format!("{what} index out of range"),
        ))
    } else {
        Ok(adjusted as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::parse_module;

    struct CollectingIo {
        stdout: String,
        stdin: Vec<String>,
    }

    impl CollectingIo {
        fn new() -> Self {
            Self {
                stdout: String::new(),
                stdin: Vec::new(),
            }
        }
    }

    impl ProgramIo for CollectingIo {
        fn write_stdout(&mut self, data: &str) -> Result<(), RunError> {
            self.stdout.push_str(data);
            Ok(())
        }

        fn write_stderr(&mut self, _data: &str) -> Result<(), RunError> {
            Ok(())
        }

        fn read_line(&mut self) -> Result<String, RunError> {
            if self.stdin.is_empty() {
                return Err(RunError::new("EOFError", "EOF when reading a line"));
            }
            Ok(self.stdin.remove(0))
        }
    }

    fn run(source: &str) -> (BTreeMap<String, Value>, String) {
        run_with(source, CollectingIo::new())
    }

    fn run_with(source: &str, mut io: CollectingIo) -> (BTreeMap<String, Value>, String) {
        let module = parse_module(source).expect("parsing");
        let mut hook = NoopHook;
        let mut interp = Interp::new(
            "<test>",
            BTreeMap::new(),
            &mut hook,
            &mut io,
            Arc::new(AtomicBool::new(false)),
            Value::None,
        );
        interp.exec_module(&module.body).expect("running");
        (interp.into_globals(), io.stdout)
    }

    fn run_err(source: &str) -> RunError {
        let module = parse_module(source).expect("parsing");
        let mut hook = NoopHook;
        let mut io = CollectingIo::new();
        let mut interp = Interp::new(
            "<test>",
            BTreeMap::new(),
            &mut hook,
            &mut io,
            Arc::new(AtomicBool::new(false)),
            Value::None,
        );
        interp.exec_module(&module.body).expect_err("an error")
    }

    #[test]
    fn arithmetic_and_precedence() {
        let (globals, _) = run("x = 2 + 3 * 4\ny = (2 + 3) * 4\nz = 7 // 2\nw = -7 // 2\n");
        assert!(globals["x"].py_eq(&Value::Int(14)));
        assert!(globals["y"].py_eq(&Value::Int(20)));
        assert!(globals["z"].py_eq(&Value::Int(3)));
        assert!(globals["w"].py_eq(&Value::Int(-4)));
    }

    #[test]
    fn while_loop_with_break_and_continue() {
        let (globals, _) = run(
            "total = 0\nn = 0\nwhile True:\n    n += 1\n    if n == 3:\n        continue\n    if n > 5:\n        break\n    total += n\n",
        );
        assert!(globals["total"].py_eq(&Value::Int(1 + 2 + 4 + 5)));
    }

    #[test]
    fn functions_and_recursion() {
        let (globals, _) = run(
            "def fib(n):\n    if n < 2:\n        return n\n    return fib(n - 1) + fib(n - 2)\nr = fib(10)\n",
        );
        assert!(globals["r"].py_eq(&Value::Int(55)));
    }

    #[test]
    fn print_goes_through_program_io() {
        let (_, out) = run("print('hi')\nprint(1, 2.0, [3])\n");
        assert_eq!(out, "hi\n1 2.0 [3]\n");
    }

    #[test]
    fn input_reads_submitted_lines() {
        let mut io = CollectingIo::new();
        io.stdin.push("Alice".to_owned());
        let (globals, out) = run_with("name = input('who? ')\n", io);
        assert_eq!(out, "who? ");
        assert!(globals["name"].py_eq(&Value::str("Alice")));
    }

    #[test]
    fn for_over_range_and_list() {
        let (globals, _) = run(
            "total = 0\nfor i in range(5):\n    total += i\nitems = []\nfor c in 'ab':\n    items = items + [c]\n",
        );
        assert!(globals["total"].py_eq(&Value::Int(10)));
        assert!(globals["items"].py_eq(&Value::list(vec![Value::str("a"), Value::str("b")])));
    }

    #[test]
    fn subscripts_and_dicts() {
        let (globals, _) = run(
            "d = {'a': 1}\nd['b'] = 2\nxs = [10, 20, 30]\nxs[1] = 5\nlast = xs[-1]\nn = d['b']\n",
        );
        assert!(globals["last"].py_eq(&Value::Int(30)));
        assert!(globals["n"].py_eq(&Value::Int(2)));
    }

    #[test]
    fn name_error_has_position_and_type() {
        let err = run_err("x = 1\ny = z + 1\n");
        assert_eq!(err.type_name(), "NameError");
        assert_eq!(err.message, "name 'z' is not defined");
        assert_eq!(err.range.unwrap().lineno, 2);
    }

    #[test]
    fn zero_division_is_classified() {
        let err = run_err("x = 1 / 0\n");
        assert_eq!(err.type_name(), "ZeroDivisionError");
    }

    #[test]
    fn function_error_records_traceback() {
        let err = run_err("def f():\n    return 1 / 0\nf()\n");
        assert_eq!(err.type_name(), "ZeroDivisionError");
        assert_eq!(err.traceback.len(), 1);
        assert_eq!(err.traceback[0].0, "f");
        assert_eq!(err.traceback[0].1, 2);
    }

    #[test]
    fn interrupt_flag_stops_a_loop() {
        let module = parse_module("while True: pass\n").expect("parsing");
        let flag = Arc::new(AtomicBool::new(false));
        let mut hook = NoopHook;
        let mut io = CollectingIo::new();

        let watcher = Arc::clone(&flag);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(30));
            watcher.store(true, Ordering::SeqCst);
        });

        let mut interp = Interp::new(
            "<test>",
            BTreeMap::new(),
            &mut hook,
            &mut io,
            flag,
            Value::None,
        );
        let err = interp.exec_module(&module.body).expect_err("interrupted");
        assert_eq!(err.type_name(), "KeyboardInterrupt");
        handle.join().unwrap();
    }

    #[test]
    fn exit_raises_system_exit() {
        let err = run_err("exit(3)\n");
        assert!(matches!(
            err.kind,
            crate::eval::value::RunErrorKind::SystemExit(3)
        ));
    }

    #[test]
    fn locals_do_not_leak_into_globals() {
        let (globals, _) = run("def f():\n    t = 42\n    return t\nr = f()\n");
        assert!(globals["r"].py_eq(&Value::Int(42)));
        assert!(!globals.contains_key("t"));
    }

    #[test]
    fn shadowing_a_builtin_wins() {
        let (globals, _) = run("len = 10\nx = len + 1\n");
        assert!(globals["x"].py_eq(&Value::Int(11)));
    }

    #[test]
    fn boolean_short_circuit_returns_operand() {
        let (globals, _) = run("a = 0 or 'fallback'\nb = 1 and 2\nc = None and boom\n");
        assert!(globals["a"].py_eq(&Value::str("fallback")));
        assert!(globals["b"].py_eq(&Value::Int(2)));
        assert!(globals["c"].py_eq(&Value::None));
    }

    #[test]
    fn chained_comparison_short_circuits() {
        let (globals, _) = run("x = 5\nr = 1 < x < 10\ns = 1 < x < 3\n");
        assert!(globals["r"].py_eq(&Value::Bool(true)));
        assert!(globals["s"].py_eq(&Value::Bool(false)));
    }
}
