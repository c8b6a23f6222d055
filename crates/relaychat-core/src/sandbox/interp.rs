//! Tree-walking evaluator for parsed fragments.
//!
//! Each evaluation gets a fresh `Interpreter` with its own heap and scope
//! arena. Nothing is shared between runs and there is no path from here to
//! the host: the only effects are the captured console lines.

use std::collections::HashMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use super::error::{ExecutionError, RuntimeErrorKind};
use super::parser::{BinaryOp, DeclKind, Expr, FunctionBody, FunctionDef, LogicalOp, Program, Stmt, UnaryOp};
use super::value::{
    array_index, format_number, parse_float_prefix, parse_int_prefix, parse_numeric_string, to_int32,
    to_uint32, Closure, HeapObject, HeapRef, MathFn, Native, ScopeId, Value,
};

/// Resource ceilings for a single evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// Statements plus expressions evaluated
    pub max_steps: u64,
    pub max_call_depth: usize,
    pub max_console_lines: usize,
    pub max_collection_len: usize,
    /// In bytes
    pub max_string_len: usize,
    /// Approximate bytes a run may allocate in total. Nothing is reclaimed
    /// during a run, so this bounds the interpreter's peak memory.
    pub max_heap_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_steps: 100_000,
            max_call_depth: 64,
            max_console_lines: 200,
            max_collection_len: 10_000,
            max_string_len: 100_000,
            max_heap_bytes: 16 * 1024 * 1024,
        }
    }
}

/// What a run produced: console lines (kept even on failure) and either the
/// completion value rendered like `JSON.stringify`, or the error.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub console: Vec<String>,
    pub result: Result<String, ExecutionError>,
}

pub fn evaluate(program: &Program, limits: &SandboxLimits) -> Evaluation {
    let mut interp = Interpreter::new(limits.clone());
    let result = interp.run(program);
    Evaluation {
        console: interp.console,
        result,
    }
}

const INTRINSICS: ScopeId = ScopeId(0);
const GLOBAL: ScopeId = ScopeId(1);

/// Nesting cutoff for stringifying containers, which also stops cycles
const MAX_FORMAT_DEPTH: usize = 64;
const MAX_INSPECT_DEPTH: usize = 3;

/// Charged per array slot or object entry
const VALUE_BYTES: usize = 16;
/// Charged per heap object on top of its contents
const OBJECT_BYTES: usize = 48;

#[derive(Debug, Clone)]
struct Binding {
    value: Value,
    mutable: bool,
}

#[derive(Debug)]
struct ScopeData {
    vars: HashMap<String, Binding>,
    parent: Option<ScopeId>,
}

enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

enum Place {
    Var(String),
    Property(Value, String),
}

struct Interpreter {
    limits: SandboxLimits,
    steps: u64,
    call_depth: usize,
    /// Bytes charged against `max_heap_bytes` so far
    allocated: usize,
    heap: Vec<HeapObject>,
    scopes: Vec<ScopeData>,
    console: Vec<String>,
    console_truncated: bool,
    /// Value of the last expression statement run outside any function
    completion: Value,
    /// Value passed to the most recent `throw`, for `catch` to bind
    thrown: Option<Value>,
}

impl Interpreter {
    fn new(limits: SandboxLimits) -> Self {
        let mut interp = Self {
            limits,
            steps: 0,
            call_depth: 0,
            allocated: 0,
            heap: Vec::new(),
            scopes: vec![
                ScopeData {
                    vars: HashMap::new(),
                    parent: None,
                },
                ScopeData {
                    vars: HashMap::new(),
                    parent: Some(INTRINSICS),
                },
            ],
            console: Vec::new(),
            console_truncated: false,
            completion: Value::Undefined,
            thrown: None,
        };
        interp.install_intrinsics();
        interp
    }

    fn install_intrinsics(&mut self) {
        let log = Value::Native(Native::ConsoleLog);
        let console = self.alloc_object(
            ["log", "info", "warn", "error", "debug"]
                .iter()
                .map(|name| (name.to_string(), log.clone()))
                .collect(),
        );

        let mut math: Vec<(String, Value)> = MathFn::ALL
            .iter()
            .map(|f| (f.name().to_string(), Value::Native(Native::Math(*f))))
            .collect();
        for (name, value) in [
            ("PI", std::f64::consts::PI),
            ("E", std::f64::consts::E),
            ("LN2", std::f64::consts::LN_2),
            ("LN10", std::f64::consts::LN_10),
            ("SQRT2", std::f64::consts::SQRT_2),
        ] {
            math.push((name.to_string(), Value::Number(value)));
        }
        let math = self.alloc_object(math);

        let json = self.alloc_object(vec![
            ("stringify".to_string(), Value::Native(Native::JsonStringify)),
            ("parse".to_string(), Value::Native(Native::JsonParse)),
        ]);
        let object = self.alloc_object(vec![
            ("keys".to_string(), Value::Native(Native::ObjectKeys)),
            ("values".to_string(), Value::Native(Native::ObjectValues)),
            ("entries".to_string(), Value::Native(Native::ObjectEntries)),
        ]);
        let array = self.alloc_object(vec![("isArray".to_string(), Value::Native(Native::ArrayIsArray))]);

        let globals = [
            ("console", console),
            ("Math", math),
            ("JSON", json),
            ("Object", object),
            ("Array", array),
            ("String", Value::Native(Native::String)),
            ("Number", Value::Native(Native::Number)),
            ("Boolean", Value::Native(Native::Boolean)),
            ("parseInt", Value::Native(Native::ParseInt)),
            ("parseFloat", Value::Native(Native::ParseFloat)),
            ("isNaN", Value::Native(Native::IsNaN)),
            ("isFinite", Value::Native(Native::IsFinite)),
            ("Error", Value::Native(Native::Error)),
            ("NaN", Value::Number(f64::NAN)),
            ("Infinity", Value::Number(f64::INFINITY)),
        ];
        let vars = &mut self.scopes[INTRINSICS.0].vars;
        for (name, value) in globals {
            vars.insert(
                name.to_string(),
                Binding {
                    value,
                    mutable: false,
                },
            );
        }
    }

    fn run(&mut self, program: &Program) -> Result<String, ExecutionError> {
        if let Flow::Return(value) = self.exec_block(&program.body, GLOBAL)? {
            self.completion = value;
        }
        let completion = self.completion.clone();
        Ok(self
            .json(&completion, None, "", 0)?
            .unwrap_or_else(|| "undefined".to_string()))
    }

    // ------------------------------------------------------------------
    // Budget
    // ------------------------------------------------------------------

    fn tick(&mut self) -> Result<(), ExecutionError> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(ExecutionError::Limit(format!(
                "Execution exceeded the budget of {} steps",
                self.limits.max_steps
            )));
        }
        self.check_memory()
    }

    fn check_memory(&self) -> Result<(), ExecutionError> {
        if self.allocated > self.limits.max_heap_bytes {
            return Err(ExecutionError::Limit(format!(
                "Execution exceeded the memory budget of {} bytes",
                self.limits.max_heap_bytes
            )));
        }
        Ok(())
    }

    fn charge(&mut self, bytes: usize) -> Result<(), ExecutionError> {
        self.allocated = self.allocated.saturating_add(bytes);
        self.check_memory()
    }

    /// Charge a freshly built string result
    fn charge_value(&mut self, value: &Value) -> Result<(), ExecutionError> {
        match value {
            Value::Str(s) => self.charge(s.len()),
            _ => Ok(()),
        }
    }

    fn check_collection_len(&self, len: usize) -> Result<(), ExecutionError> {
        if len > self.limits.max_collection_len {
            return Err(ExecutionError::Limit(format!(
                "Collection exceeds {} elements",
                self.limits.max_collection_len
            )));
        }
        Ok(())
    }

    fn check_string_len(&self, len: usize) -> Result<(), ExecutionError> {
        if len > self.limits.max_string_len {
            return Err(ExecutionError::Limit("Invalid string length".to_string()));
        }
        Ok(())
    }

    fn log_line(&mut self, line: String) {
        if self.console.len() >= self.limits.max_console_lines {
            if !self.console_truncated {
                self.console.push("... (output truncated)".to_string());
                self.console_truncated = true;
            }
            return;
        }
        // Checked on the next step
        self.allocated = self.allocated.saturating_add(line.len());
        self.console.push(line);
    }

    // ------------------------------------------------------------------
    // Heap and scopes
    // ------------------------------------------------------------------

    /// Infallible; an overdrawn budget fails at the next check
    fn alloc(&mut self, object: HeapObject) -> HeapRef {
        let contents = match &object {
            HeapObject::Array(items) => items.len() * VALUE_BYTES,
            HeapObject::Object(entries) => entries.iter().map(|(k, _)| k.len() + VALUE_BYTES).sum(),
            _ => 0,
        };
        self.allocated = self.allocated.saturating_add(OBJECT_BYTES + contents);
        self.heap.push(object);
        HeapRef(self.heap.len() - 1)
    }

    fn alloc_object(&mut self, entries: Vec<(String, Value)>) -> Value {
        Value::Object(self.alloc(HeapObject::Object(entries)))
    }

    fn alloc_array(&mut self, items: Vec<Value>) -> Result<Value, ExecutionError> {
        self.check_collection_len(items.len())?;
        let r = self.alloc(HeapObject::Array(items));
        self.check_memory()?;
        Ok(Value::Array(r))
    }

    fn alloc_closure(&mut self, def: Rc<FunctionDef>, scope: ScopeId) -> Value {
        Value::Function(self.alloc(HeapObject::Closure(Closure { def, scope })))
    }

    fn array_items(&self, r: HeapRef) -> &[Value] {
        match &self.heap[r.0] {
            HeapObject::Array(items) => items,
            _ => &[],
        }
    }

    fn array_mut(&mut self, r: HeapRef) -> Option<&mut Vec<Value>> {
        match &mut self.heap[r.0] {
            HeapObject::Array(items) => Some(items),
            _ => None,
        }
    }

    fn object_entries(&self, r: HeapRef) -> &[(String, Value)] {
        match &self.heap[r.0] {
            HeapObject::Object(entries) => entries,
            _ => &[],
        }
    }

    fn function_name(&self, r: HeapRef) -> Option<String> {
        match &self.heap[r.0] {
            HeapObject::Closure(closure) => closure.def.name.clone(),
            _ => None,
        }
    }

    fn new_scope(&mut self, parent: ScopeId) -> ScopeId {
        self.allocated = self.allocated.saturating_add(OBJECT_BYTES);
        self.scopes.push(ScopeData {
            vars: HashMap::new(),
            parent: Some(parent),
        });
        ScopeId(self.scopes.len() - 1)
    }

    /// Fresh scope holding copies of `from`'s bindings, for per-iteration `let`
    fn copy_scope(&mut self, from: ScopeId, parent: ScopeId) -> ScopeId {
        let vars = self.scopes[from.0].vars.clone();
        self.scopes.push(ScopeData {
            vars,
            parent: Some(parent),
        });
        ScopeId(self.scopes.len() - 1)
    }

    fn declare(&mut self, scope: ScopeId, name: &str, value: Value, kind: DeclKind) -> Result<(), ExecutionError> {
        let vars = &mut self.scopes[scope.0].vars;
        if let Some(existing) = vars.get_mut(name) {
            if kind == DeclKind::Var && existing.mutable {
                existing.value = value;
                return Ok(());
            }
            return Err(ExecutionError::syntax(
                format!("Identifier '{}' has already been declared", name),
                0,
            ));
        }
        vars.insert(
            name.to_string(),
            Binding {
                value,
                mutable: kind != DeclKind::Const,
            },
        );
        Ok(())
    }

    fn lookup(&self, scope: ScopeId, name: &str) -> Result<Value, ExecutionError> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let data = &self.scopes[id.0];
            if let Some(binding) = data.vars.get(name) {
                return Ok(binding.value.clone());
            }
            current = data.parent;
        }
        Err(ExecutionError::reference_error(format!("{} is not defined", name)))
    }

    fn assign_var(&mut self, scope: ScopeId, name: &str, value: Value) -> Result<(), ExecutionError> {
        let mut current = Some(scope);
        while let Some(id) = current {
            if id == INTRINSICS {
                break;
            }
            let data = &mut self.scopes[id.0];
            if let Some(binding) = data.vars.get_mut(name) {
                if !binding.mutable {
                    return Err(ExecutionError::type_error("Assignment to constant variable."));
                }
                binding.value = value;
                return Ok(());
            }
            current = data.parent;
        }

        // Sloppy-mode assignment: undeclared names (and built-ins) become globals
        self.scopes[GLOBAL.0].vars.insert(
            name.to_string(),
            Binding {
                value,
                mutable: true,
            },
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn exec_block(&mut self, stmts: &[Stmt], scope: ScopeId) -> Result<Flow, ExecutionError> {
        // Function declarations are hoisted to the top of their block
        for stmt in stmts {
            if let Stmt::Function(def) = stmt {
                if let Some(name) = &def.name {
                    let closure = self.alloc_closure(Rc::clone(def), scope);
                    self.declare(scope, name, closure, DeclKind::Var)?;
                }
            }
        }

        for stmt in stmts {
            match self.exec(stmt, scope)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt, scope: ScopeId) -> Result<Flow, ExecutionError> {
        self.tick()?;

        match stmt {
            Stmt::Expr(expr) => {
                let value = self.eval(expr, scope)?;
                if self.call_depth == 0 {
                    self.completion = value;
                }
                Ok(Flow::Normal)
            }
            Stmt::Declare { kind, declarations } => {
                for (name, init) in declarations {
                    match init {
                        Some(expr) => {
                            let value = self.eval(expr, scope)?;
                            self.declare(scope, name, value, *kind)?;
                        }
                        // `var x;` never resets an existing binding
                        None if *kind == DeclKind::Var && self.scopes[scope.0].vars.contains_key(name) => {}
                        None => self.declare(scope, name, Value::Undefined, *kind)?,
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Function(_) | Stmt::Empty => Ok(Flow::Normal),
            Stmt::If {
                test,
                consequent,
                alternate,
            } => {
                if self.eval(test, scope)?.truthy() {
                    self.exec(consequent, scope)
                } else if let Some(alternate) = alternate {
                    self.exec(alternate, scope)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::While { test, body } => {
                while self.eval(test, scope)?.truthy() {
                    match self.exec(body, scope)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::DoWhile { body, test } => {
                loop {
                    match self.exec(body, scope)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    if !self.eval(test, scope)?.truthy() {
                        break;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                init,
                test,
                update,
                body,
            } => self.exec_for(init.as_deref(), test.as_ref(), update.as_ref(), body, scope),
            Stmt::ForOf {
                kind,
                name,
                iterable,
                body,
            } => {
                let items: Vec<Value> = match self.eval(iterable, scope)? {
                    Value::Array(r) => self.array_items(r).to_vec(),
                    Value::Str(s) => s.chars().map(|c| Value::str(c.to_string())).collect(),
                    other => {
                        let shown = self.inspect(&other, 0)?;
                        return Err(ExecutionError::type_error(format!("{} is not iterable", shown)));
                    }
                };
                for item in items {
                    let iter_scope = self.new_scope(scope);
                    self.declare(iter_scope, name, item, *kind)?;
                    match self.exec(body, iter_scope)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Block(stmts) => {
                let inner = self.new_scope(scope);
                self.exec_block(stmts, inner)
            }
            Stmt::Return(argument) => {
                let value = match argument {
                    Some(expr) => self.eval(expr, scope)?,
                    None => Value::Undefined,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Throw(argument) => {
                let value = self.eval(argument, scope)?;
                let err = self.thrown_error(&value)?;
                self.thrown = Some(value);
                Err(err)
            }
            Stmt::Try {
                block,
                param,
                handler,
                finalizer,
            } => self.exec_try(block, param.as_deref(), handler.as_deref(), finalizer.as_deref(), scope),
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
        }
    }

    fn exec_for(
        &mut self,
        init: Option<&Stmt>,
        test: Option<&Expr>,
        update: Option<&Expr>,
        body: &Stmt,
        scope: ScopeId,
    ) -> Result<Flow, ExecutionError> {
        let mut iter_scope = self.new_scope(scope);
        match init {
            // `var` belongs to the enclosing scope
            Some(stmt @ Stmt::Declare { kind: DeclKind::Var, .. }) => {
                self.exec(stmt, scope)?;
            }
            Some(stmt) => {
                self.exec(stmt, iter_scope)?;
            }
            None => {}
        }

        loop {
            // Each iteration sees its own copy of the loop variables, so
            // closures created in the body capture that iteration's values
            iter_scope = self.copy_scope(iter_scope, scope);

            if let Some(test) = test {
                if !self.eval(test, iter_scope)?.truthy() {
                    break;
                }
            }
            match self.exec(body, iter_scope)? {
                Flow::Break => break,
                Flow::Return(value) => return Ok(Flow::Return(value)),
                Flow::Normal | Flow::Continue => {}
            }
            if let Some(update) = update {
                self.eval(update, iter_scope)?;
            } else {
                self.tick()?;
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_try(
        &mut self,
        block: &[Stmt],
        param: Option<&str>,
        handler: Option<&[Stmt]>,
        finalizer: Option<&[Stmt]>,
        scope: ScopeId,
    ) -> Result<Flow, ExecutionError> {
        let block_scope = self.new_scope(scope);
        let mut outcome = self.exec_block(block, block_scope);

        let catchable = match &outcome {
            // Sandbox limits are final; user code cannot swallow them
            Err(ExecutionError::Limit(_)) | Ok(_) => None,
            Err(err) => Some(err.clone()),
        };
        if let Some(handler) = handler {
            if let Some(err) = catchable {
                let caught = match self.thrown.take() {
                    Some(value) => value,
                    None => self.error_object(&err),
                };
                let handler_scope = self.new_scope(scope);
                if let Some(param) = param {
                    self.declare(handler_scope, param, caught, DeclKind::Let)?;
                }
                outcome = self.exec_block(handler, handler_scope);
            }
        }

        if let Some(finalizer) = finalizer {
            let final_scope = self.new_scope(scope);
            match self.exec_block(finalizer, final_scope)? {
                Flow::Normal => {}
                flow => {
                    self.thrown = None;
                    return Ok(flow);
                }
            }
        }
        outcome
    }

    fn error_object(&mut self, err: &ExecutionError) -> Value {
        let name = match err {
            ExecutionError::Syntax { .. } => "SyntaxError",
            ExecutionError::Runtime { kind, .. } => kind.as_str(),
            ExecutionError::Limit(_) => "RangeError",
        };
        self.alloc_object(vec![
            ("name".to_string(), Value::str(name)),
            ("message".to_string(), Value::str(err.message())),
        ])
    }

    fn thrown_error(&mut self, value: &Value) -> Result<ExecutionError, ExecutionError> {
        if let Value::Object(r) = value {
            let entries = self.object_entries(*r);
            let name = entries.iter().find(|(k, _)| k == "name").map(|(_, v)| v.clone());
            let message = entries.iter().find(|(k, _)| k == "message").map(|(_, v)| v.clone());
            if let Some(message) = message {
                let kind = match name {
                    Some(Value::Str(n)) if &*n == "TypeError" => RuntimeErrorKind::TypeError,
                    Some(Value::Str(n)) if &*n == "RangeError" => RuntimeErrorKind::RangeError,
                    Some(Value::Str(n)) if &*n == "ReferenceError" => RuntimeErrorKind::ReferenceError,
                    _ => RuntimeErrorKind::Error,
                };
                let message = self.to_js_string(&message)?;
                return Ok(ExecutionError::runtime(kind, message));
            }
        }
        let message = match value {
            Value::Str(s) => s.to_string(),
            other => self.inspect(other, 0)?,
        };
        Ok(ExecutionError::runtime(RuntimeErrorKind::Error, message))
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn eval(&mut self, expr: &Expr, scope: ScopeId) -> Result<Value, ExecutionError> {
        self.tick()?;

        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Str(s) => Ok(Value::str(s)),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Null => Ok(Value::Null),
            Expr::Undefined => Ok(Value::Undefined),
            Expr::Template { quasis, exprs } => {
                let mut out = String::new();
                for (i, quasi) in quasis.iter().enumerate() {
                    out.push_str(quasi);
                    if let Some(expr) = exprs.get(i) {
                        let value = self.eval(expr, scope)?;
                        out.push_str(&self.to_js_string(&value)?);
                        self.check_string_len(out.len())?;
                    }
                }
                self.charge(out.len())?;
                Ok(Value::str(out))
            }
            Expr::Ident(name) => self.lookup(scope, name),
            Expr::Array(elements) => {
                let mut items = Vec::with_capacity(elements.len());
                for element in elements {
                    items.push(self.eval(element, scope)?);
                }
                self.alloc_array(items)
            }
            Expr::Object(entries) => {
                let mut props: Vec<(String, Value)> = Vec::with_capacity(entries.len());
                for (key, expr) in entries {
                    let value = self.eval(expr, scope)?;
                    set_entry(&mut props, key, value);
                }
                Ok(self.alloc_object(props))
            }
            Expr::Function(def) => Ok(self.alloc_closure(Rc::clone(def), scope)),
            Expr::Unary { op, argument } => {
                if *op == UnaryOp::TypeOf {
                    if let Expr::Ident(name) = argument.as_ref() {
                        // typeof on an undeclared name is not an error
                        let type_name = self.lookup(scope, name).map(|v| v.type_of()).unwrap_or("undefined");
                        return Ok(Value::str(type_name));
                    }
                }
                let value = self.eval(argument, scope)?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!value.truthy()),
                    UnaryOp::Neg => Value::Number(-self.to_number(&value)?),
                    UnaryOp::Plus => Value::Number(self.to_number(&value)?),
                    UnaryOp::BitNot => Value::Number(!to_int32(self.to_number(&value)?) as f64),
                    UnaryOp::TypeOf => Value::str(value.type_of()),
                })
            }
            Expr::Update {
                increment,
                prefix,
                target,
            } => {
                let place = self.resolve_place(target, scope)?;
                let current = self.read_place(&place, scope)?;
                let old = self.to_number(&current)?;
                let new = if *increment { old + 1.0 } else { old - 1.0 };
                self.write_place(place, Value::Number(new), scope)?;
                Ok(Value::Number(if *prefix { new } else { old }))
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                self.binary(*op, left, right)
            }
            Expr::Logical { op, left, right } => {
                let left = self.eval(left, scope)?;
                let short_circuit = match op {
                    LogicalOp::And => !left.truthy(),
                    LogicalOp::Or => left.truthy(),
                    LogicalOp::Nullish => !left.is_nullish(),
                };
                if short_circuit {
                    Ok(left)
                } else {
                    self.eval(right, scope)
                }
            }
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                if self.eval(test, scope)?.truthy() {
                    self.eval(consequent, scope)
                } else {
                    self.eval(alternate, scope)
                }
            }
            Expr::Assign { op, target, value } => {
                let place = self.resolve_place(target, scope)?;
                let new = match op {
                    None => self.eval(value, scope)?,
                    Some(op) => {
                        let current = self.read_place(&place, scope)?;
                        let rhs = self.eval(value, scope)?;
                        self.binary(*op, current, rhs)?
                    }
                };
                self.write_place(place, new.clone(), scope)?;
                Ok(new)
            }
            Expr::Member {
                object,
                property,
                optional,
            } => {
                let object = self.eval(object, scope)?;
                if *optional && object.is_nullish() {
                    return Ok(Value::Undefined);
                }
                self.get_property(&object, property)
            }
            Expr::Index {
                object,
                index,
                optional,
            } => {
                let object = self.eval(object, scope)?;
                if *optional && object.is_nullish() {
                    return Ok(Value::Undefined);
                }
                let key = self.eval(index, scope)?;
                let key = self.property_key(&key)?;
                self.get_property(&object, &key)
            }
            Expr::Call {
                callee,
                args,
                optional,
            } => self.eval_call(callee, args, *optional, scope),
        }
    }

    fn resolve_place(&mut self, target: &Expr, scope: ScopeId) -> Result<Place, ExecutionError> {
        match target {
            Expr::Ident(name) => Ok(Place::Var(name.clone())),
            Expr::Member { object, property, .. } => {
                let object = self.eval(object, scope)?;
                Ok(Place::Property(object, property.clone()))
            }
            Expr::Index { object, index, .. } => {
                let object = self.eval(object, scope)?;
                let key = self.eval(index, scope)?;
                let key = self.property_key(&key)?;
                Ok(Place::Property(object, key))
            }
            _ => Err(ExecutionError::syntax("Invalid left-hand side in assignment", 0)),
        }
    }

    fn read_place(&mut self, place: &Place, scope: ScopeId) -> Result<Value, ExecutionError> {
        match place {
            Place::Var(name) => self.lookup(scope, name),
            Place::Property(object, key) => self.get_property(object, key),
        }
    }

    fn write_place(&mut self, place: Place, value: Value, scope: ScopeId) -> Result<(), ExecutionError> {
        match place {
            Place::Var(name) => self.assign_var(scope, &name, value),
            Place::Property(object, key) => self.set_property(&object, &key, value),
        }
    }

    fn eval_args(&mut self, args: &[Expr], scope: ScopeId) -> Result<Vec<Value>, ExecutionError> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg, scope)?);
        }
        Ok(values)
    }

    fn eval_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        optional: bool,
        scope: ScopeId,
    ) -> Result<Value, ExecutionError> {
        let description = callee_name(callee);

        let (receiver, key) = match callee {
            Expr::Member {
                object,
                property,
                optional: member_optional,
            } => {
                let receiver = self.eval(object, scope)?;
                if *member_optional && receiver.is_nullish() {
                    return Ok(Value::Undefined);
                }
                (receiver, property.clone())
            }
            Expr::Index {
                object,
                index,
                optional: index_optional,
            } => {
                let receiver = self.eval(object, scope)?;
                if *index_optional && receiver.is_nullish() {
                    return Ok(Value::Undefined);
                }
                let key = self.eval(index, scope)?;
                let key = self.property_key(&key)?;
                (receiver, key)
            }
            _ => {
                let func = self.eval(callee, scope)?;
                if optional && func.is_nullish() {
                    return Ok(Value::Undefined);
                }
                let args = self.eval_args(args, scope)?;
                return self.call_value(&func, args, &description);
            }
        };

        if optional && !has_builtin_methods(&receiver) && self.get_property(&receiver, &key)?.is_nullish() {
            return Ok(Value::Undefined);
        }
        let args = self.eval_args(args, scope)?;
        self.call_method(receiver, &key, args, &description)
    }

    fn call_method(
        &mut self,
        receiver: Value,
        name: &str,
        args: Vec<Value>,
        description: &str,
    ) -> Result<Value, ExecutionError> {
        let builtin = match &receiver {
            Value::Str(s) => self.string_method(s, name, &args)?,
            Value::Array(r) => self.array_method(*r, name, &args)?,
            Value::Number(n) => self.number_method(*n, name, &args)?,
            Value::Bool(b) if name == "toString" => Some(Value::str(b.to_string())),
            _ => None,
        };
        if let Some(value) = builtin {
            self.charge_value(&value)?;
            return Ok(value);
        }

        let func = self.get_property(&receiver, name)?;
        if !func.is_callable() {
            return Err(ExecutionError::type_error(format!("{} is not a function", description)));
        }
        self.call_value(&func, args, description)
    }

    fn call_value(&mut self, func: &Value, args: Vec<Value>, description: &str) -> Result<Value, ExecutionError> {
        match func {
            Value::Native(native) => {
                let value = self.call_native(*native, args)?;
                self.charge_value(&value)?;
                Ok(value)
            }
            Value::Function(r) => self.call_closure(*r, args),
            _ => Err(ExecutionError::type_error(format!("{} is not a function", description))),
        }
    }

    fn call_closure(&mut self, r: HeapRef, args: Vec<Value>) -> Result<Value, ExecutionError> {
        let (def, closure_scope) = match &self.heap[r.0] {
            HeapObject::Closure(closure) => (Rc::clone(&closure.def), closure.scope),
            _ => return Err(ExecutionError::type_error("value is not a function")),
        };
        if self.call_depth >= self.limits.max_call_depth {
            return Err(ExecutionError::Limit("Maximum call stack size exceeded".to_string()));
        }

        let call_scope = self.new_scope(closure_scope);
        {
            let vars = &mut self.scopes[call_scope.0].vars;
            if let Some(name) = &def.name {
                vars.insert(
                    name.clone(),
                    Binding {
                        value: Value::Function(r),
                        mutable: true,
                    },
                );
            }
            let mut args = args.into_iter();
            for param in &def.params {
                vars.insert(
                    param.clone(),
                    Binding {
                        value: args.next().unwrap_or(Value::Undefined),
                        mutable: true,
                    },
                );
            }
        }

        self.call_depth += 1;
        let result = match &def.body {
            FunctionBody::Block(stmts) => self.exec_block(stmts, call_scope).map(|flow| match flow {
                Flow::Return(value) => value,
                _ => Value::Undefined,
            }),
            FunctionBody::Expr(expr) => self.eval(expr, call_scope),
        };
        self.call_depth -= 1;
        result
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    fn property_key(&mut self, key: &Value) -> Result<String, ExecutionError> {
        match key {
            Value::Str(s) => Ok(s.to_string()),
            Value::Number(n) => Ok(format_number(*n)),
            other => self.to_js_string(other),
        }
    }

    fn get_property(&mut self, object: &Value, key: &str) -> Result<Value, ExecutionError> {
        match object {
            Value::Undefined | Value::Null => Err(ExecutionError::type_error(format!(
                "Cannot read properties of {} (reading '{}')",
                if matches!(object, Value::Null) { "null" } else { "undefined" },
                key
            ))),
            Value::Str(s) => Ok(if key == "length" {
                Value::Number(s.chars().count() as f64)
            } else if let Some(index) = array_index(key) {
                s.chars()
                    .nth(index)
                    .map(|c| Value::str(c.to_string()))
                    .unwrap_or(Value::Undefined)
            } else {
                Value::Undefined
            }),
            Value::Array(r) => {
                let items = self.array_items(*r);
                Ok(if key == "length" {
                    Value::Number(items.len() as f64)
                } else if let Some(index) = array_index(key) {
                    items.get(index).cloned().unwrap_or(Value::Undefined)
                } else {
                    Value::Undefined
                })
            }
            Value::Object(r) => Ok(self
                .object_entries(*r)
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .unwrap_or(Value::Undefined)),
            Value::Function(r) if key == "name" => Ok(Value::str(self.function_name(*r).unwrap_or_default())),
            Value::Native(native) if key == "name" => Ok(Value::str(native.name())),
            _ => Ok(Value::Undefined),
        }
    }

    fn set_property(&mut self, object: &Value, key: &str, value: Value) -> Result<(), ExecutionError> {
        match object {
            Value::Undefined | Value::Null => Err(ExecutionError::type_error(format!(
                "Cannot set properties of {} (setting '{}')",
                if matches!(object, Value::Null) { "null" } else { "undefined" },
                key
            ))),
            Value::Array(r) => {
                if key == "length" {
                    let n = self.to_number(&value)?;
                    if n < 0.0 || n.fract() != 0.0 || n > self.limits.max_collection_len as f64 {
                        return Err(ExecutionError::range_error("Invalid array length"));
                    }
                    let len = self.array_items(*r).len();
                    self.charge((n as usize).saturating_sub(len) * VALUE_BYTES)?;
                    if let Some(items) = self.array_mut(*r) {
                        items.resize(n as usize, Value::Undefined);
                    }
                } else if let Some(index) = array_index(key) {
                    self.check_collection_len(index + 1)?;
                    let len = self.array_items(*r).len();
                    self.charge((index + 1).saturating_sub(len) * VALUE_BYTES)?;
                    if let Some(items) = self.array_mut(*r) {
                        if index >= items.len() {
                            items.resize(index + 1, Value::Undefined);
                        }
                        items[index] = value;
                    }
                }
                Ok(())
            }
            Value::Object(r) => {
                let entries = self.object_entries(*r);
                let len = entries.len();
                let is_new = !entries.iter().any(|(k, _)| k == key);
                self.check_collection_len(len + 1)?;
                if is_new {
                    self.charge(key.len() + VALUE_BYTES)?;
                }
                if let HeapObject::Object(entries) = &mut self.heap[r.0] {
                    set_entry(entries, key, value);
                }
                Ok(())
            }
            // Writes to primitives are silently dropped, as in sloppy mode
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Conversions
    // ------------------------------------------------------------------

    fn to_number(&mut self, value: &Value) -> Result<f64, ExecutionError> {
        Ok(match value {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Number(n) => *n,
            Value::Str(s) => parse_numeric_string(s),
            Value::Array(_) | Value::Object(_) => {
                let s = self.to_js_string(value)?;
                parse_numeric_string(&s)
            }
            Value::Function(_) | Value::Native(_) => f64::NAN,
        })
    }

    fn to_primitive(&mut self, value: Value) -> Result<Value, ExecutionError> {
        match value {
            Value::Array(_) | Value::Object(_) | Value::Function(_) | Value::Native(_) => {
                let s = self.to_js_string(&value)?;
                Ok(Value::str(s))
            }
            other => Ok(other),
        }
    }

    /// `String(value)`
    fn to_js_string(&mut self, value: &Value) -> Result<String, ExecutionError> {
        self.stringify(value, 0)
    }

    fn stringify(&mut self, value: &Value, depth: usize) -> Result<String, ExecutionError> {
        self.tick()?;
        Ok(match value {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Str(s) => s.to_string(),
            Value::Array(r) => {
                if depth > MAX_FORMAT_DEPTH {
                    return Ok(String::new());
                }
                let items = self.array_items(*r).to_vec();
                let mut out = String::new();
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    if !item.is_nullish() {
                        out.push_str(&self.stringify(item, depth + 1)?);
                    }
                    self.check_string_len(out.len())?;
                }
                out
            }
            Value::Object(_) => "[object Object]".to_string(),
            Value::Function(r) => format!("function {}() {{ ... }}", self.function_name(*r).unwrap_or_default()),
            Value::Native(native) => format!("function {}() {{ [native code] }}", native.name()),
        })
    }

    /// Console rendering: strings print raw, everything else is inspected
    fn console_format(&mut self, value: &Value) -> Result<String, ExecutionError> {
        match value {
            Value::Str(s) => Ok(s.to_string()),
            other => self.inspect(other, 0),
        }
    }

    fn inspect(&mut self, value: &Value, depth: usize) -> Result<String, ExecutionError> {
        self.tick()?;
        let out = match value {
            Value::Str(s) if depth > 0 => format!("'{}'", s),
            Value::Array(r) => {
                if depth > MAX_INSPECT_DEPTH {
                    return Ok("[Array]".to_string());
                }
                let items = self.array_items(*r).to_vec();
                if items.is_empty() {
                    return Ok("[]".to_string());
                }
                let mut parts = Vec::with_capacity(items.len());
                for item in &items {
                    parts.push(self.inspect(item, depth + 1)?);
                }
                format!("[ {} ]", parts.join(", "))
            }
            Value::Object(r) => {
                if depth > MAX_INSPECT_DEPTH {
                    return Ok("[Object]".to_string());
                }
                let entries = self.object_entries(*r).to_vec();
                if entries.is_empty() {
                    return Ok("{}".to_string());
                }
                let mut parts = Vec::with_capacity(entries.len());
                for (key, item) in &entries {
                    parts.push(format!("{}: {}", key, self.inspect(item, depth + 1)?));
                }
                format!("{{ {} }}", parts.join(", "))
            }
            Value::Function(r) => match self.function_name(*r) {
                Some(name) => format!("[Function: {}]", name),
                None => "[Function (anonymous)]".to_string(),
            },
            Value::Native(native) => format!("[Function: {}]", native.name()),
            other => self.to_js_string(other)?,
        };
        self.check_string_len(out.len())?;
        Ok(out)
    }

    /// `JSON.stringify`; `None` where JS returns `undefined`
    fn json(
        &mut self,
        value: &Value,
        indent: Option<&str>,
        current: &str,
        depth: usize,
    ) -> Result<Option<String>, ExecutionError> {
        self.tick()?;
        if depth > MAX_FORMAT_DEPTH {
            return Err(ExecutionError::type_error("Converting circular structure to JSON"));
        }

        let inner = indent.map(|step| format!("{}{}", current, step));
        let (open_sep, item_sep, close_sep) = match &inner {
            Some(inner) => (format!("\n{}", inner), format!(",\n{}", inner), format!("\n{}", current)),
            None => (String::new(), ",".to_string(), String::new()),
        };
        let next_indent = inner.as_deref().unwrap_or("");

        let out = match value {
            Value::Undefined | Value::Function(_) | Value::Native(_) => return Ok(None),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) if n.is_finite() => format_number(*n),
            Value::Number(_) => "null".to_string(),
            Value::Str(s) => quote_json(s),
            Value::Array(r) => {
                let items = self.array_items(*r).to_vec();
                if items.is_empty() {
                    return Ok(Some("[]".to_string()));
                }
                let mut parts = Vec::with_capacity(items.len());
                for item in &items {
                    let part = self.json(item, indent, next_indent, depth + 1)?;
                    parts.push(part.unwrap_or_else(|| "null".to_string()));
                }
                format!("[{}{}{}]", open_sep, parts.join(&item_sep), close_sep)
            }
            Value::Object(r) => {
                let entries = self.object_entries(*r).to_vec();
                let colon = if indent.is_some() { ": " } else { ":" };
                let mut parts = Vec::with_capacity(entries.len());
                for (key, item) in &entries {
                    if let Some(part) = self.json(item, indent, next_indent, depth + 1)? {
                        parts.push(format!("{}{}{}", quote_json(key), colon, part));
                    }
                }
                if parts.is_empty() {
                    return Ok(Some("{}".to_string()));
                }
                format!("{{{}{}{}}}", open_sep, parts.join(&item_sep), close_sep)
            }
        };
        self.check_string_len(out.len())?;
        Ok(Some(out))
    }

    fn from_json(&mut self, value: &serde_json::Value) -> Result<Value, ExecutionError> {
        self.tick()?;
        Ok(match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::str(s),
            serde_json::Value::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.from_json(item)?);
                }
                self.alloc_array(values)?
            }
            serde_json::Value::Object(map) => {
                self.check_collection_len(map.len())?;
                let mut entries = Vec::with_capacity(map.len());
                for (key, item) in map {
                    entries.push((key.clone(), self.from_json(item)?));
                }
                self.alloc_object(entries)
            }
        })
    }

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    fn binary(&mut self, op: BinaryOp, left: Value, right: Value) -> Result<Value, ExecutionError> {
        use BinaryOp::*;

        let value = match op {
            Add => {
                let left = self.to_primitive(left)?;
                let right = self.to_primitive(right)?;
                if matches!(left, Value::Str(_)) || matches!(right, Value::Str(_)) {
                    let mut s = self.to_js_string(&left)?;
                    s.push_str(&self.to_js_string(&right)?);
                    self.check_string_len(s.len())?;
                    self.charge(s.len())?;
                    Value::str(s)
                } else {
                    Value::Number(self.to_number(&left)? + self.to_number(&right)?)
                }
            }
            Sub => Value::Number(self.to_number(&left)? - self.to_number(&right)?),
            Mul => Value::Number(self.to_number(&left)? * self.to_number(&right)?),
            Div => Value::Number(self.to_number(&left)? / self.to_number(&right)?),
            Rem => Value::Number(self.to_number(&left)? % self.to_number(&right)?),
            Pow => Value::Number(js_pow(self.to_number(&left)?, self.to_number(&right)?)),
            Eq => Value::Bool(self.loose_equals(&left, &right)?),
            NotEq => Value::Bool(!self.loose_equals(&left, &right)?),
            StrictEq => Value::Bool(left == right),
            StrictNotEq => Value::Bool(left != right),
            Lt | Gt | LtEq | GtEq => Value::Bool(self.compare(op, left, right)?),
            BitAnd | BitOr | BitXor | Shl | Shr => {
                let a = to_int32(self.to_number(&left)?);
                let b = to_int32(self.to_number(&right)?);
                let shift = (b as u32) & 31;
                let result = match op {
                    BitAnd => a & b,
                    BitOr => a | b,
                    BitXor => a ^ b,
                    Shl => a.wrapping_shl(shift),
                    _ => a >> shift,
                };
                Value::Number(result as f64)
            }
            UShr => {
                let a = to_uint32(self.to_number(&left)?);
                let b = to_uint32(self.to_number(&right)?) & 31;
                Value::Number((a >> b) as f64)
            }
        };
        Ok(value)
    }

    fn compare(&mut self, op: BinaryOp, left: Value, right: Value) -> Result<bool, ExecutionError> {
        let left = self.to_primitive(left)?;
        let right = self.to_primitive(right)?;

        if let (Value::Str(a), Value::Str(b)) = (&left, &right) {
            return Ok(match op {
                BinaryOp::Lt => a < b,
                BinaryOp::Gt => a > b,
                BinaryOp::LtEq => a <= b,
                _ => a >= b,
            });
        }

        let a = self.to_number(&left)?;
        let b = self.to_number(&right)?;
        // Comparisons with NaN are always false
        Ok(match op {
            BinaryOp::Lt => a < b,
            BinaryOp::Gt => a > b,
            BinaryOp::LtEq => a <= b,
            _ => a >= b,
        })
    }

    fn loose_equals(&mut self, left: &Value, right: &Value) -> Result<bool, ExecutionError> {
        use Value::*;
        Ok(match (left, right) {
            (Undefined | Null, Undefined | Null) => true,
            (Undefined | Null, _) | (_, Undefined | Null) => false,
            (Number(a), Str(s)) | (Str(s), Number(a)) => *a == parse_numeric_string(s),
            (Bool(b), other) | (other, Bool(b)) => {
                let n = Number(if *b { 1.0 } else { 0.0 });
                let other = other.clone();
                return self.loose_equals(&n, &other);
            }
            (Array(_) | Object(_), Str(_) | Number(_)) => {
                let primitive = self.to_primitive(left.clone())?;
                return self.loose_equals(&primitive, right);
            }
            (Str(_) | Number(_), Array(_) | Object(_)) => {
                let primitive = self.to_primitive(right.clone())?;
                return self.loose_equals(left, &primitive);
            }
            _ => left == right,
        })
    }

    // ------------------------------------------------------------------
    // Argument helpers
    // ------------------------------------------------------------------

    fn arg_string(&mut self, args: &[Value], i: usize) -> Result<String, ExecutionError> {
        match args.get(i) {
            Some(value) => self.to_js_string(value),
            None => Ok("undefined".to_string()),
        }
    }

    fn arg_number(&mut self, args: &[Value], i: usize) -> Result<Option<f64>, ExecutionError> {
        match args.get(i) {
            None | Some(Value::Undefined) => Ok(None),
            Some(value) => self.to_number(value).map(Some),
        }
    }

    /// Resolve a possibly negative, possibly missing position against `len`
    fn arg_position(&mut self, args: &[Value], i: usize, len: usize, default: usize) -> Result<usize, ExecutionError> {
        Ok(match self.arg_number(args, i)? {
            None => default,
            Some(n) if n.is_nan() => 0,
            Some(n) if n < 0.0 => len.saturating_sub((-n).min(len as f64) as usize),
            Some(n) => n.min(len as f64) as usize,
        })
    }

    fn callback(&self, args: &[Value], method: &str) -> Result<Value, ExecutionError> {
        match args.first() {
            Some(func) if func.is_callable() => Ok(func.clone()),
            _ => Err(ExecutionError::type_error(format!(
                "{}: callback is not a function",
                method
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Built-ins
    // ------------------------------------------------------------------

    fn call_native(&mut self, native: Native, args: Vec<Value>) -> Result<Value, ExecutionError> {
        let first = args.first().cloned().unwrap_or(Value::Undefined);

        match native {
            Native::ConsoleLog => {
                let mut parts = Vec::with_capacity(args.len());
                for arg in &args {
                    parts.push(self.console_format(arg)?);
                }
                self.log_line(parts.join(" "));
                Ok(Value::Undefined)
            }
            Native::Math(f) => {
                let mut numbers = Vec::with_capacity(args.len());
                for arg in &args {
                    numbers.push(self.to_number(arg)?);
                }
                Ok(Value::Number(f.apply(&numbers)))
            }
            Native::JsonStringify => {
                let indent = match args.get(2) {
                    Some(Value::Number(n)) if *n >= 1.0 => Some(" ".repeat(n.min(10.0) as usize)),
                    Some(Value::Str(s)) if !s.is_empty() => Some(s.chars().take(10).collect()),
                    _ => None,
                };
                Ok(match self.json(&first, indent.as_deref(), "", 0)? {
                    Some(s) => Value::str(s),
                    None => Value::Undefined,
                })
            }
            Native::JsonParse => {
                let text = self.to_js_string(&first)?;
                let parsed: serde_json::Value = serde_json::from_str(&text)
                    .map_err(|e| ExecutionError::syntax(format!("JSON.parse: {}", e), 0))?;
                self.from_json(&parsed)
            }
            Native::String => Ok(if args.is_empty() {
                Value::str("")
            } else {
                Value::str(self.to_js_string(&first)?)
            }),
            Native::Number => Ok(Value::Number(if args.is_empty() {
                0.0
            } else {
                self.to_number(&first)?
            })),
            Native::Boolean => Ok(Value::Bool(first.truthy())),
            Native::ParseInt => {
                let text = self.to_js_string(&first)?;
                let radix = self
                    .arg_number(&args, 1)?
                    .filter(|r| r.is_finite())
                    .map(|r| r as u32);
                Ok(Value::Number(parse_int_prefix(&text, radix)))
            }
            Native::ParseFloat => {
                let text = self.to_js_string(&first)?;
                Ok(Value::Number(parse_float_prefix(&text)))
            }
            Native::IsNaN => Ok(Value::Bool(self.to_number(&first)?.is_nan())),
            Native::IsFinite => Ok(Value::Bool(self.to_number(&first)?.is_finite())),
            Native::ArrayIsArray => Ok(Value::Bool(matches!(first, Value::Array(_)))),
            Native::ObjectKeys | Native::ObjectValues | Native::ObjectEntries => {
                let entries: Vec<(String, Value)> = match &first {
                    Value::Object(r) => self.object_entries(*r).to_vec(),
                    Value::Array(r) => self
                        .array_items(*r)
                        .iter()
                        .enumerate()
                        .map(|(i, v)| (i.to_string(), v.clone()))
                        .collect(),
                    Value::Undefined | Value::Null => {
                        return Err(ExecutionError::type_error("Cannot convert undefined or null to object"))
                    }
                    _ => Vec::new(),
                };
                let mut items = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    items.push(match native {
                        Native::ObjectKeys => Value::str(key),
                        Native::ObjectValues => value,
                        _ => self.alloc_array(vec![Value::str(key), value])?,
                    });
                }
                self.alloc_array(items)
            }
            Native::Error => {
                let message = if first == Value::Undefined {
                    String::new()
                } else {
                    self.to_js_string(&first)?
                };
                Ok(self.alloc_object(vec![
                    ("name".to_string(), Value::str("Error")),
                    ("message".to_string(), Value::str(message)),
                ]))
            }
        }
    }

    fn number_method(&mut self, n: f64, name: &str, args: &[Value]) -> Result<Option<Value>, ExecutionError> {
        let value = match name {
            "toFixed" => {
                let digits = self.arg_number(args, 0)?.unwrap_or(0.0);
                if !(0.0..=100.0).contains(&digits) {
                    return Err(ExecutionError::range_error("toFixed() digits argument must be between 0 and 100"));
                }
                if !n.is_finite() || n.abs() >= 1e21 {
                    Value::str(format_number(n))
                } else {
                    Value::str(format!("{:.*}", digits as usize, n))
                }
            }
            "toString" => {
                let radix = self.arg_number(args, 0)?.unwrap_or(10.0);
                if !(2.0..=36.0).contains(&radix) {
                    return Err(ExecutionError::range_error("toString() radix must be between 2 and 36"));
                }
                let radix = radix as u32;
                if radix == 10 || !n.is_finite() || n.fract() != 0.0 || n.abs() > u64::MAX as f64 {
                    Value::str(format_number(n))
                } else {
                    Value::str(format_radix(n, radix))
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(value))
    }

    fn string_method(&mut self, s: &Rc<str>, name: &str, args: &[Value]) -> Result<Option<Value>, ExecutionError> {
        let value = match name {
            "toUpperCase" => Value::str(s.to_uppercase()),
            "toLowerCase" => Value::str(s.to_lowercase()),
            "trim" => Value::str(s.trim()),
            "trimStart" => Value::str(s.trim_start()),
            "trimEnd" => Value::str(s.trim_end()),
            "toString" | "valueOf" => Value::Str(Rc::clone(s)),
            "includes" => {
                let needle = self.arg_string(args, 0)?;
                Value::Bool(s.contains(needle.as_str()))
            }
            "startsWith" => {
                let needle = self.arg_string(args, 0)?;
                Value::Bool(s.starts_with(needle.as_str()))
            }
            "endsWith" => {
                let needle = self.arg_string(args, 0)?;
                Value::Bool(s.ends_with(needle.as_str()))
            }
            "indexOf" | "lastIndexOf" => {
                let needle = self.arg_string(args, 0)?;
                let found = if name == "indexOf" {
                    s.find(needle.as_str())
                } else {
                    s.rfind(needle.as_str())
                };
                Value::Number(match found {
                    Some(byte) => s[..byte].chars().count() as f64,
                    None => -1.0,
                })
            }
            "slice" | "substring" => {
                let chars: Vec<char> = s.chars().collect();
                let len = chars.len();
                let (start, end) = if name == "slice" {
                    let start = self.arg_position(args, 0, len, 0)?;
                    let end = self.arg_position(args, 1, len, len)?;
                    (start, end.max(start))
                } else {
                    let a = self.arg_number(args, 0)?.unwrap_or(0.0);
                    let b = self.arg_number(args, 1)?.unwrap_or(len as f64);
                    let clamp = |v: f64| if v.is_nan() { 0 } else { v.max(0.0).min(len as f64) as usize };
                    let (a, b) = (clamp(a), clamp(b));
                    (a.min(b), a.max(b))
                };
                Value::str(chars[start..end].iter().collect::<String>())
            }
            "charAt" | "at" | "charCodeAt" => {
                let chars: Vec<char> = s.chars().collect();
                let raw = self.arg_number(args, 0)?.unwrap_or(0.0);
                let index = if name == "at" && raw < 0.0 {
                    chars.len() as f64 + raw.trunc()
                } else {
                    raw.trunc()
                };
                let found = if index >= 0.0 { chars.get(index as usize) } else { None };
                match (name, found) {
                    ("charCodeAt", Some(c)) => Value::Number(*c as u32 as f64),
                    ("charCodeAt", None) => Value::Number(f64::NAN),
                    (_, Some(c)) => Value::str(c.to_string()),
                    ("at", None) => Value::Undefined,
                    (_, None) => Value::str(""),
                }
            }
            "split" => {
                let parts: Vec<Value> = match args.first() {
                    None | Some(Value::Undefined) => vec![Value::Str(Rc::clone(s))],
                    Some(_) => {
                        let separator = self.arg_string(args, 0)?;
                        if separator.is_empty() {
                            s.chars().map(|c| Value::str(c.to_string())).collect()
                        } else {
                            s.split(separator.as_str()).map(Value::str).collect()
                        }
                    }
                };
                let limit = self.arg_number(args, 1)?.map(|n| n.max(0.0) as usize);
                let parts: Vec<Value> = match limit {
                    Some(limit) => parts.into_iter().take(limit).collect(),
                    None => parts,
                };
                self.alloc_array(parts)?
            }
            "repeat" => {
                let count = self.arg_number(args, 0)?.unwrap_or(0.0);
                if count < 0.0 || !count.is_finite() {
                    return Err(ExecutionError::range_error(format!("Invalid count value: {}", format_number(count))));
                }
                let count = count as usize;
                self.check_string_len(s.len().saturating_mul(count))?;
                Value::str(s.repeat(count))
            }
            "replace" | "replaceAll" => {
                let pattern = self.arg_string(args, 0)?;
                let replacement = args.get(1).cloned().unwrap_or(Value::Undefined);
                let mut out = String::new();
                let mut rest: &str = s;
                let mut replaced_any = false;
                while let Some(pos) = rest.find(pattern.as_str()) {
                    if replaced_any && name == "replace" {
                        break;
                    }
                    out.push_str(&rest[..pos]);
                    let with = if replacement.is_callable() {
                        let result = self.call_value(&replacement, vec![Value::str(&pattern)], "replacer")?;
                        self.to_js_string(&result)?
                    } else {
                        self.to_js_string(&replacement)?
                    };
                    out.push_str(&with);
                    self.check_string_len(out.len())?;
                    replaced_any = true;

                    let advance = pos + pattern.len();
                    if pattern.is_empty() {
                        // Empty pattern matches between every character
                        match rest[advance..].chars().next() {
                            Some(c) => {
                                out.push(c);
                                rest = &rest[advance + c.len_utf8()..];
                            }
                            None => {
                                rest = "";
                                break;
                            }
                        }
                    } else {
                        rest = &rest[advance..];
                    }
                }
                out.push_str(rest);
                Value::str(out)
            }
            "padStart" | "padEnd" => {
                let target = self.arg_number(args, 0)?.unwrap_or(0.0).max(0.0) as usize;
                self.check_string_len(target)?;
                let fill = match args.get(1) {
                    None | Some(Value::Undefined) => " ".to_string(),
                    Some(_) => self.arg_string(args, 1)?,
                };
                let len = s.chars().count();
                if target <= len || fill.is_empty() {
                    Value::Str(Rc::clone(s))
                } else {
                    let padding: String = fill.chars().cycle().take(target - len).collect();
                    if name == "padStart" {
                        Value::str(format!("{}{}", padding, s))
                    } else {
                        Value::str(format!("{}{}", s, padding))
                    }
                }
            }
            "concat" => {
                let mut out = s.to_string();
                for i in 0..args.len() {
                    out.push_str(&self.arg_string(args, i)?);
                    self.check_string_len(out.len())?;
                }
                Value::str(out)
            }
            _ => return Ok(None),
        };
        Ok(Some(value))
    }

    fn array_method(&mut self, r: HeapRef, name: &str, args: &[Value]) -> Result<Option<Value>, ExecutionError> {
        let array = Value::Array(r);
        let value = match name {
            "push" | "unshift" => {
                let len = self.array_items(r).len();
                self.check_collection_len(len + args.len())?;
                self.charge(args.len() * VALUE_BYTES)?;
                let items = match self.array_mut(r) {
                    Some(items) => items,
                    None => return Ok(None),
                };
                if name == "push" {
                    items.extend(args.iter().cloned());
                } else {
                    items.splice(0..0, args.iter().cloned());
                }
                Value::Number(items.len() as f64)
            }
            "pop" => self.array_mut(r).and_then(|items| items.pop()).unwrap_or(Value::Undefined),
            "shift" => match self.array_mut(r) {
                Some(items) if !items.is_empty() => items.remove(0),
                _ => Value::Undefined,
            },
            "join" | "toString" => {
                let separator = match args.first() {
                    None | Some(Value::Undefined) => ",".to_string(),
                    Some(_) if name == "toString" => ",".to_string(),
                    Some(_) => self.arg_string(args, 0)?,
                };
                let items = self.array_items(r).to_vec();
                let mut out = String::new();
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(&separator);
                    }
                    if !item.is_nullish() {
                        out.push_str(&self.to_js_string(item)?);
                    }
                    self.check_string_len(out.len())?;
                }
                Value::str(out)
            }
            "map" | "filter" | "forEach" | "find" | "findIndex" | "some" | "every" => {
                let callback = self.callback(args, name)?;
                let items = self.array_items(r).to_vec();
                let mut mapped = Vec::new();
                for (i, item) in items.into_iter().enumerate() {
                    let result = self.call_value(
                        &callback,
                        vec![item.clone(), Value::Number(i as f64), array.clone()],
                        name,
                    )?;
                    match name {
                        "map" => mapped.push(result),
                        "filter" if result.truthy() => mapped.push(item),
                        "find" if result.truthy() => return Ok(Some(item)),
                        "findIndex" if result.truthy() => return Ok(Some(Value::Number(i as f64))),
                        "some" if result.truthy() => return Ok(Some(Value::Bool(true))),
                        "every" if !result.truthy() => return Ok(Some(Value::Bool(false))),
                        _ => {}
                    }
                }
                match name {
                    "map" | "filter" => self.alloc_array(mapped)?,
                    "findIndex" => Value::Number(-1.0),
                    "some" => Value::Bool(false),
                    "every" => Value::Bool(true),
                    _ => Value::Undefined,
                }
            }
            "reduce" => {
                let callback = self.callback(args, name)?;
                let items = self.array_items(r).to_vec();
                let mut iter = items.into_iter().enumerate();
                let mut acc = match args.get(1) {
                    Some(initial) => initial.clone(),
                    None => match iter.next() {
                        Some((_, first)) => first,
                        None => {
                            return Err(ExecutionError::type_error("Reduce of empty array with no initial value"))
                        }
                    },
                };
                for (i, item) in iter {
                    acc = self.call_value(
                        &callback,
                        vec![acc, item, Value::Number(i as f64), array.clone()],
                        name,
                    )?;
                }
                acc
            }
            "includes" => {
                let needle = args.first().cloned().unwrap_or(Value::Undefined);
                let found = self.array_items(r).iter().any(|item| {
                    *item == needle
                        || matches!((item, &needle), (Value::Number(a), Value::Number(b)) if a.is_nan() && b.is_nan())
                });
                Value::Bool(found)
            }
            "indexOf" => {
                let needle = args.first().cloned().unwrap_or(Value::Undefined);
                let position = self.array_items(r).iter().position(|item| *item == needle);
                Value::Number(position.map_or(-1.0, |p| p as f64))
            }
            "slice" => {
                let items = self.array_items(r).to_vec();
                let len = items.len();
                let start = self.arg_position(args, 0, len, 0)?;
                let end = self.arg_position(args, 1, len, len)?;
                let slice = if start < end { items[start..end].to_vec() } else { Vec::new() };
                self.alloc_array(slice)?
            }
            "concat" => {
                let mut items = self.array_items(r).to_vec();
                for arg in args {
                    match arg {
                        Value::Array(other) => items.extend(self.array_items(*other).iter().cloned()),
                        other => items.push(other.clone()),
                    }
                }
                self.alloc_array(items)?
            }
            "flat" => {
                let mut items = Vec::new();
                for item in self.array_items(r).to_vec() {
                    match item {
                        Value::Array(inner) => items.extend(self.array_items(inner).iter().cloned()),
                        other => items.push(other),
                    }
                }
                self.alloc_array(items)?
            }
            "reverse" => {
                if let Some(items) = self.array_mut(r) {
                    items.reverse();
                }
                array
            }
            "sort" => {
                let comparator = args.first().filter(|f| f.is_callable()).cloned();
                let items = self.array_items(r).to_vec();
                let sorted = self.merge_sort(items, comparator.as_ref())?;
                if let Some(items) = self.array_mut(r) {
                    *items = sorted;
                }
                array
            }
            "at" => {
                let len = self.array_items(r).len() as f64;
                let raw = self.arg_number(args, 0)?.unwrap_or(0.0).trunc();
                let index = if raw < 0.0 { len + raw } else { raw };
                if index >= 0.0 && index < len {
                    self.array_items(r)[index as usize].clone()
                } else {
                    Value::Undefined
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(value))
    }

    /// Stable bottom-up merge sort with a comparator that may call user code
    fn merge_sort(&mut self, mut items: Vec<Value>, comparator: Option<&Value>) -> Result<Vec<Value>, ExecutionError> {
        let n = items.len();
        let mut width = 1;
        let mut buffer = Vec::with_capacity(n);
        while width < n {
            buffer.clear();
            let mut start = 0;
            while start < n {
                let mid = (start + width).min(n);
                let end = (start + 2 * width).min(n);
                let (mut i, mut j) = (start, mid);
                while i < mid && j < end {
                    if self.sort_compare(&items[j], &items[i], comparator)? < 0.0 {
                        buffer.push(items[j].clone());
                        j += 1;
                    } else {
                        buffer.push(items[i].clone());
                        i += 1;
                    }
                }
                buffer.extend_from_slice(&items[i..mid]);
                buffer.extend_from_slice(&items[j..end]);
                start = end;
            }
            std::mem::swap(&mut items, &mut buffer);
            width *= 2;
        }
        Ok(items)
    }

    fn sort_compare(&mut self, a: &Value, b: &Value, comparator: Option<&Value>) -> Result<f64, ExecutionError> {
        // undefined always sorts last
        match (a, b) {
            (Value::Undefined, Value::Undefined) => return Ok(0.0),
            (Value::Undefined, _) => return Ok(1.0),
            (_, Value::Undefined) => return Ok(-1.0),
            _ => {}
        }
        match comparator {
            Some(func) => {
                let result = self.call_value(func, vec![a.clone(), b.clone()], "comparator")?;
                let n = self.to_number(&result)?;
                Ok(if n.is_nan() { 0.0 } else { n })
            }
            None => {
                let a = self.to_js_string(a)?;
                let b = self.to_js_string(b)?;
                Ok(match a.cmp(&b) {
                    std::cmp::Ordering::Less => -1.0,
                    std::cmp::Ordering::Equal => 0.0,
                    std::cmp::Ordering::Greater => 1.0,
                })
            }
        }
    }
}

fn set_entry(entries: &mut Vec<(String, Value)>, key: &str, value: Value) {
    match entries.iter_mut().find(|(k, _)| k == key) {
        Some(entry) => entry.1 = value,
        None => entries.push((key.to_string(), value)),
    }
}

fn quote_json(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
}

fn js_pow(base: f64, exponent: f64) -> f64 {
    if exponent.is_nan() {
        f64::NAN
    } else if exponent == 0.0 {
        1.0
    } else if base.abs() == 1.0 && exponent.is_infinite() {
        f64::NAN
    } else {
        base.powf(exponent)
    }
}

fn format_radix(n: f64, radix: u32) -> String {
    let negative = n < 0.0;
    let mut value = n.abs() as u64;
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        let digit = (value % radix as u64) as u32;
        digits.push(std::char::from_digit(digit, radix).unwrap_or('?'));
        value /= radix as u64;
    }
    if negative {
        digits.push('-');
    }
    digits.iter().rev().collect()
}

/// Receivers whose methods are resolved by name rather than via properties
fn has_builtin_methods(receiver: &Value) -> bool {
    matches!(receiver, Value::Str(_) | Value::Array(_) | Value::Number(_) | Value::Bool(_))
}

/// Source-like name of a callee for error messages, e.g. `console.lg`
fn callee_name(expr: &Expr) -> String {
    match expr {
        Expr::Ident(name) => name.clone(),
        Expr::Member { object, property, .. } => format!("{}.{}", callee_name(object), property),
        Expr::Index { object, .. } => format!("{}[...]", callee_name(object)),
        Expr::Call { callee, .. } => format!("{}(...)", callee_name(callee)),
        _ => "expression".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::parser::parse_program;

    fn run(src: &str) -> Evaluation {
        let src = src.to_string();
        std::thread::Builder::new()
            .stack_size(super::super::EVAL_STACK_SIZE)
            .spawn(move || {
                let program = parse_program(&src).unwrap();
                evaluate(&program, &SandboxLimits::default())
            })
            .unwrap()
            .join()
            .unwrap()
    }

    fn value_of(src: &str) -> String {
        let evaluation = run(src);
        evaluation.result.unwrap_or_else(|e| panic!("{} failed: {}", src, e))
    }

    fn error_of(src: &str) -> ExecutionError {
        run(src).result.unwrap_err()
    }

    #[test]
    fn test_arithmetic_completion_value() {
        assert_eq!(value_of("2+2"), "4");
        assert_eq!(value_of("let x = 2; x * 21"), "42");
        assert_eq!(value_of("0.1 + 0.2"), "0.30000000000000004");
        assert_eq!(value_of("2 ** 10"), "1024");
        assert_eq!(value_of("7 % 3"), "1");
    }

    #[test]
    fn test_declarations_do_not_reset_completion() {
        assert_eq!(value_of("1; let x = 2"), "1");
        assert_eq!(value_of("let x = 2"), "undefined");
    }

    #[test]
    fn test_value_display_is_json() {
        assert_eq!(value_of("'hi'"), "\"hi\"");
        assert_eq!(value_of("[1, 'a', null, undefined]"), "[1,\"a\",null,null]");
        assert_eq!(value_of("({a: 1, b: [true]})"), "{\"a\":1,\"b\":[true]}");
        assert_eq!(value_of("1 / 0"), "null");
        assert_eq!(value_of("x => x"), "undefined");
    }

    #[test]
    fn test_console_capture() {
        let evaluation = run("console.log(1+1)\nconsole.log('a', [1, 2], {k: 'v'})");
        assert_eq!(evaluation.console, vec!["2", "a [ 1, 2 ] { k: 'v' }"]);
        assert_eq!(evaluation.result.unwrap(), "undefined");
    }

    #[test]
    fn test_string_concatenation_and_coercion() {
        assert_eq!(value_of("'a' + 1 + 2"), "\"a12\"");
        assert_eq!(value_of("1 + 2 + 'a'"), "\"3a\"");
        assert_eq!(value_of("[1, 2] + ''"), "\"1,2\"");
        assert_eq!(value_of("'5' * '2'"), "10");
        assert_eq!(value_of("`sum: ${1 + 2}`"), "\"sum: 3\"");
    }

    #[test]
    fn test_equality() {
        assert_eq!(value_of("1 == '1'"), "true");
        assert_eq!(value_of("1 === '1'"), "false");
        assert_eq!(value_of("null == undefined"), "true");
        assert_eq!(value_of("null === undefined"), "false");
        assert_eq!(value_of("NaN === NaN"), "false");
        assert_eq!(value_of("true == 1"), "true");
    }

    #[test]
    fn test_functions_and_closures() {
        assert_eq!(value_of("function add(a, b) { return a + b }\nadd(2, 3)"), "5");
        assert_eq!(value_of("const sq = x => x * x; sq(9)"), "81");
        assert_eq!(
            value_of("function counter() { let n = 0; return () => ++n }\nconst c = counter(); c(); c(); c()"),
            "3"
        );
        // Hoisting
        assert_eq!(value_of("f(); function f() { return 'ok' }"), "\"ok\"");
    }

    #[test]
    fn test_recursion() {
        assert_eq!(
            value_of("function fib(n) { return n < 2 ? n : fib(n - 1) + fib(n - 2) }\nfib(15)"),
            "610"
        );
    }

    #[test]
    fn test_loops() {
        assert_eq!(value_of("let s = 0; for (let i = 1; i <= 10; i++) { s += i } s"), "55");
        assert_eq!(value_of("let s = 0; for (const x of [1, 2, 3]) s += x; s"), "6");
        assert_eq!(value_of("let i = 0; while (true) { if (++i > 4) break } i"), "5");
        assert_eq!(value_of("let i = 0; do { i++ } while (i < 3); i"), "3");
        assert_eq!(
            value_of("let out = []; for (let i = 0; i < 5; i++) { if (i % 2) continue; out.push(i) } out"),
            "[0,2,4]"
        );
    }

    #[test]
    fn test_loop_closures_capture_each_iteration() {
        assert_eq!(
            value_of("const fs = []; for (let i = 0; i < 3; i++) { fs.push(() => i) } fs.map(f => f())"),
            "[0,1,2]"
        );
    }

    #[test]
    fn test_array_methods() {
        assert_eq!(value_of("[1, 2, 3].map(x => x * 2)"), "[2,4,6]");
        assert_eq!(value_of("[1, 2, 3, 4].filter(x => x % 2 === 0)"), "[2,4]");
        assert_eq!(value_of("[1, 2, 3].reduce((a, b) => a + b, 0)"), "6");
        assert_eq!(value_of("[3, 1, 2].sort()"), "[1,2,3]");
        assert_eq!(value_of("[10, 9, 1].sort((a, b) => a - b)"), "[1,9,10]");
        assert_eq!(value_of("[1, 2, 3].join('-')"), "\"1-2-3\"");
        assert_eq!(value_of("[1, 2, 3].includes(2)"), "true");
        assert_eq!(value_of("[1, [2, 3]].flat()"), "[1,2,3]");
        assert_eq!(value_of("[1, 2, 3].slice(-2)"), "[2,3]");
        assert_eq!(value_of("const a = [1]; a.push(2, 3); a.length"), "3");
    }

    #[test]
    fn test_string_methods() {
        assert_eq!(value_of("'Hello'.toUpperCase()"), "\"HELLO\"");
        assert_eq!(value_of("'a,b,c'.split(',')"), "[\"a\",\"b\",\"c\"]");
        assert_eq!(value_of("'hello'.slice(1, 3)"), "\"el\"");
        assert_eq!(value_of("'abc'.length"), "3");
        assert_eq!(value_of("'ab'.repeat(3)"), "\"ababab\"");
        assert_eq!(value_of("'5'.padStart(3, '0')"), "\"005\"");
        assert_eq!(value_of("'a-b-c'.replace('-', '+')"), "\"a+b-c\"");
        assert_eq!(value_of("'a-b-c'.replaceAll('-', '+')"), "\"a+b+c\"");
        assert_eq!(value_of("'hello'.split('').reverse().join('')"), "\"olleh\"");
    }

    #[test]
    fn test_builtins() {
        assert_eq!(value_of("Math.max(1, 5, 3)"), "5");
        assert_eq!(value_of("Math.floor(Math.PI * 100)"), "314");
        assert_eq!(value_of("JSON.stringify({a: [1, 2]})"), "\"{\\\"a\\\":[1,2]}\"");
        assert_eq!(value_of("JSON.parse('{\"x\": 3}').x"), "3");
        assert_eq!(value_of("parseInt('42px')"), "42");
        assert_eq!(value_of("Number('3.5') + 1"), "4.5");
        assert_eq!(value_of("(3.14159).toFixed(2)"), "\"3.14\"");
        assert_eq!(value_of("(255).toString(16)"), "\"ff\"");
        assert_eq!(value_of("Object.keys({a: 1, b: 2})"), "[\"a\",\"b\"]");
        assert_eq!(value_of("typeof undeclared"), "\"undefined\"");
        assert_eq!(value_of("typeof console.log"), "\"function\"");
    }

    #[test]
    fn test_runtime_errors() {
        let err = error_of("foo + 1");
        assert_eq!(err.to_string(), "ReferenceError: foo is not defined");

        let err = error_of("const x = 1; x = 2");
        assert_eq!(err.message(), "Assignment to constant variable.");

        let err = error_of("let o; o.field");
        assert!(err.message().contains("Cannot read properties of undefined"));

        let err = error_of("console.lg('x')");
        assert_eq!(err.message(), "console.lg is not a function");
    }

    #[test]
    fn test_console_survives_errors() {
        let evaluation = run("console.log('before'); missing()");
        assert_eq!(evaluation.console, vec!["before"]);
        assert!(evaluation.result.is_err());
    }

    #[test]
    fn test_try_catch_finally() {
        assert_eq!(
            value_of("let r; try { throw Error('boom') } catch (e) { r = e.message } r"),
            "\"boom\""
        );
        assert_eq!(value_of("let r; try { null.x } catch (e) { r = e.name } r"), "\"TypeError\"");
        assert_eq!(
            value_of("let log = []; try { log.push(1) } finally { log.push(2) } log"),
            "[1,2]"
        );
        let err = error_of("throw 'plain'");
        assert_eq!(err.message(), "plain");
    }

    #[test]
    fn test_infinite_loop_hits_step_budget() {
        let err = error_of("while (true) {}");
        assert!(matches!(err, ExecutionError::Limit(_)));
    }

    #[test]
    fn test_limits_cannot_be_caught() {
        let err = error_of("try { for (;;) {} } catch (e) { 'swallowed' }");
        assert!(matches!(err, ExecutionError::Limit(_)));
    }

    #[test]
    fn test_unbounded_recursion_hits_call_depth() {
        let err = error_of("function f() { return f() } f()");
        assert_eq!(err.message(), "Maximum call stack size exceeded");
    }

    #[test]
    fn test_collection_and_string_limits() {
        let err = error_of("const a = []; a[20000] = 1");
        assert!(matches!(err, ExecutionError::Limit(_)));
        let err = error_of("'x'.repeat(1000000)");
        assert!(matches!(err, ExecutionError::Limit(_)));
    }

    #[test]
    fn test_memory_budget_stops_repeated_copies() {
        let err = error_of("const b = []; b.length = 10000; while (true) { b.slice() }");
        assert!(matches!(err, ExecutionError::Limit(_)));
        assert!(err.message().contains("memory budget"));
    }

    #[test]
    fn test_memory_budget_counts_strings() {
        let err = error_of("const s = 'x'.repeat(99990); const a = []; for (let i = 0; i < 9000; i++) a.push(s + i)");
        assert!(matches!(err, ExecutionError::Limit(_)));
        assert!(err.message().contains("memory budget"));
    }

    #[test]
    fn test_console_is_capped() {
        let limits = SandboxLimits {
            max_console_lines: 3,
            ..SandboxLimits::default()
        };
        let program = parse_program("for (let i = 0; i < 10; i++) console.log(i)").unwrap();
        let evaluation = evaluate(&program, &limits);
        assert_eq!(evaluation.console.len(), 4);
        assert_eq!(evaluation.console[3], "... (output truncated)");
    }

    #[test]
    fn test_no_host_access() {
        for src in ["require('fs')", "process.exit(1)", "fetch('http://example.com')", "Math.random()"] {
            assert!(run(src).result.is_err(), "{} should fail", src);
        }
    }

    #[test]
    fn test_cyclic_structures_do_not_hang() {
        let err = error_of("const a = []; a.push(a); JSON.stringify(a)");
        assert!(err.message().contains("circular") || matches!(err, ExecutionError::Limit(_)));
    }
}
