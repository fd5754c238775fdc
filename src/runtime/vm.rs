// src/runtime/vm.rs
//! Virtual Machine that executes bytecode
//!
//! Every Lua call runs in its own [`Frame`]: local slots, cells for
//! captured locals, an operand stack and the varargs. Host and library
//! functions are called directly on the Rust stack, so the call depth is
//! bounded by [`ScriptConfig::max_call_depth`](crate::ScriptConfig).

use crate::compiler::bytecode::{Capture, Instruction, Proto, Results, Storage};
use crate::module::{HostFailure, HostFunction};
use crate::runtime::context::{CancelReason, ExecutionContext};
use crate::runtime::pool::Instance;
use crate::runtime::value::{new_cell, Cell, Closure, Function, Val};
use crate::{ArgumentError, Error};
use std::fmt;
use std::sync::Arc;

/// Why guest code stopped
#[derive(Debug, Clone)]
pub enum GuestError {
    /// A Lua error carrying any value, catchable by `pcall`
    Runtime(Val),
    /// A host call boundary rejected a value
    Argument(ArgumentError),
    /// The host context is done; never caught by `pcall`
    Cancelled(CancelReason),
}

impl GuestError {
    pub fn message(message: impl fmt::Display) -> Self {
        GuestError::Runtime(Val::str(&message.to_string()))
    }
}

impl fmt::Display for GuestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestError::Runtime(value) => write!(f, "{}", value),
            GuestError::Argument(err) => write!(f, "{}", err),
            GuestError::Cancelled(reason) => write!(f, "{}", reason),
        }
    }
}

impl From<GuestError> for Error {
    fn from(err: GuestError) -> Self {
        match err {
            GuestError::Runtime(value) => Error::Runtime(value.to_string()),
            GuestError::Argument(err) => Error::Argument(err),
            GuestError::Cancelled(reason) => Error::Cancelled(reason),
        }
    }
}

/// Executes functions of one VM instance on behalf of one run
pub struct Machine<'m, 'r> {
    pub ctx: &'m mut ExecutionContext<'r>,
    pub instance: &'m Instance,
    chunk: &'m str,
    /// Line of the innermost Lua call site, used to locate library errors
    line: u32,
}

impl<'m, 'r> Machine<'m, 'r> {
    pub fn new(ctx: &'m mut ExecutionContext<'r>, instance: &'m Instance, chunk: &'m str) -> Self {
        Self {
            ctx,
            instance,
            chunk,
            line: 0,
        }
    }

    pub fn chunk(&self) -> &str {
        self.chunk
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    /// A runtime error prefixed with the current call site
    pub fn error(&self, message: impl fmt::Display) -> GuestError {
        GuestError::message(format!("{}:{}: {}", self.chunk, self.line, message))
    }

    /// Call any function value
    pub fn call(&mut self, func: &Val, args: Vec<Val>) -> Result<Vec<Val>, GuestError> {
        let Val::Function(function) = func else {
            return Err(GuestError::message(format!(
                "attempt to call a {} value",
                func.type_name()
            )));
        };

        self.ctx.enter()?;
        let line = self.line;
        let result = match function {
            Function::Lua(closure) => self.execute(closure, args),
            Function::Builtin(builtin) => (builtin.func)(self, args),
            Function::Host(host) => self.call_host(host, args),
        };
        self.line = line;
        self.ctx.leave();
        result
    }

    fn call_host(&mut self, host: &HostFunction, args: Vec<Val>) -> Result<Vec<Val>, GuestError> {
        let args = args
            .iter()
            .enumerate()
            .map(|(i, arg)| {
                self.ctx
                    .export(arg)
                    .map_err(|e| e.at(i + 1).in_function(host.qualified()))
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(GuestError::Argument)?;

        match host.call(args) {
            Ok(value) => Ok(vec![Val::import(value)]),
            Err(HostFailure::Argument(err)) => Err(GuestError::Argument(err)),
            Err(HostFailure::Failed(message)) => Err(GuestError::message(message)),
        }
    }

    /// `object[key]` for tables, strings and records
    pub fn index(&self, object: &Val, key: &Val) -> Result<Val, String> {
        match object {
            Val::Table(table) => Ok(table.get(key)),
            Val::Str(_) => Ok(self.instance.string_lib.get(key)),
            Val::Record(handle) => {
                let record = self.ctx.record(*handle)?;
                let Val::Str(name) = key else {
                    return Ok(Val::Nil);
                };
                match record.get_field(name) {
                    Ok(Some(value)) => Ok(Val::import(value)),
                    Ok(None) => Ok(Val::Nil),
                    Err(e) => Err(format!("cannot read field '{}': {}", name, e)),
                }
            }
            other => Err(format!("attempt to index a {} value", other.type_name())),
        }
    }

    /// `object[key] = value` for tables and records
    pub fn set_index(&mut self, object: &Val, key: Val, value: Val) -> Result<(), String> {
        match object {
            Val::Table(table) => table.set(key, value).map_err(str::to_string),
            Val::Record(handle) => {
                let Val::Str(name) = &key else {
                    return Err(format!("cannot assign a {} key on a record", key.type_name()));
                };
                let value = self
                    .ctx
                    .export(&value)
                    .map_err(|e| format!("cannot assign field '{}': {}", name, e))?;
                let record = self.ctx.record_mut(*handle)?;
                match record.set_field(name, value) {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(format!("record has no field '{}'", name)),
                    Err(e) => Err(format!("cannot assign field '{}': {}", name, e)),
                }
            }
            other => Err(format!("attempt to index a {} value", other.type_name())),
        }
    }

    /// `#value`
    pub fn length(&self, value: &Val) -> Result<Val, String> {
        let len = match value {
            Val::Str(s) => s.len(),
            Val::Table(table) => table.len(),
            Val::Record(handle) => self.ctx.record(*handle)?.fields().len(),
            other => {
                return Err(format!("attempt to get length of a {} value", other.type_name()));
            }
        };
        Ok(Val::Number(len as f64))
    }

    fn locate(&self, proto: &Proto, ip: usize, message: impl fmt::Display) -> GuestError {
        GuestError::message(format!("{}:{}: {}", self.chunk, proto.line_at(ip), message))
    }

    /// Run a Lua closure to completion
    fn execute(&mut self, closure: &Arc<Closure>, mut args: Vec<Val>) -> Result<Vec<Val>, GuestError> {
        let proto = &*closure.proto;
        let mut frame = Frame::new(proto);

        let nparams = proto.params.len();
        if proto.is_vararg && args.len() > nparams {
            frame.varargs = args.split_off(nparams);
        }
        args.resize(nparams, Val::Nil);
        for (storage, arg) in proto.params.iter().zip(args) {
            match *storage {
                Storage::Slot(slot) => frame.slots[slot as usize] = arg,
                Storage::Cell(cell) => frame.cells[cell as usize] = new_cell(arg),
            }
        }

        let code = &proto.code;
        let mut pc = 0;

        while let Some(instruction) = code.get(pc) {
            let ip = pc;
            pc += 1;

            match instruction {
                Instruction::Nil => frame.push(Val::Nil),
                Instruction::True => frame.push(Val::Bool(true)),
                Instruction::False => frame.push(Val::Bool(false)),
                Instruction::Number(n) => frame.push(Val::Number(*n)),
                Instruction::Str(s) => frame.push(Val::Str(Arc::clone(s))),

                Instruction::Pop(n) => {
                    frame.take(*n as usize);
                }

                Instruction::LoadLocal(slot) => {
                    let value = frame.slots[*slot as usize].clone();
                    frame.push(value);
                }

                Instruction::StoreLocal(slot) => {
                    frame.slots[*slot as usize] = frame.pop();
                }

                Instruction::NewCell(cell) => {
                    frame.cells[*cell as usize] = new_cell(Val::Nil);
                }

                Instruction::LoadCell(cell) => {
                    let value = frame.cells[*cell as usize].lock().clone();
                    frame.push(value);
                }

                Instruction::StoreCell(cell) => {
                    let value = frame.pop();
                    *frame.cells[*cell as usize].lock() = value;
                }

                Instruction::LoadUpvalue(index) => {
                    let value = closure.upvalues[*index as usize].lock().clone();
                    frame.push(value);
                }

                Instruction::StoreUpvalue(index) => {
                    let value = frame.pop();
                    *closure.upvalues[*index as usize].lock() = value;
                }

                Instruction::LoadGlobal(name) => {
                    let value = self.instance.globals.get(&Val::Str(Arc::clone(name)));
                    frame.push(value);
                }

                Instruction::StoreGlobal(name) => {
                    let value = frame.pop();
                    // String keys are always valid
                    let _ = self.instance.globals.set(Val::Str(Arc::clone(name)), value);
                }

                Instruction::NewTable => frame.push(Val::Table(Default::default())),

                Instruction::GetIndex => {
                    let key = frame.pop();
                    let object = frame.pop();
                    let value = self
                        .index(&object, &key)
                        .map_err(|m| self.locate(proto, ip, m))?;
                    frame.push(value);
                }

                Instruction::GetField(name) => {
                    let object = frame.pop();
                    let value = self
                        .index(&object, &Val::Str(Arc::clone(name)))
                        .map_err(|m| self.locate(proto, ip, m))?;
                    frame.push(value);
                }

                Instruction::SetIndex => {
                    let value = frame.pop();
                    let key = frame.pop();
                    let object = frame.pop();
                    self.set_index(&object, key, value)
                        .map_err(|m| self.locate(proto, ip, m))?;
                }

                Instruction::InitField => {
                    let value = frame.pop();
                    let key = frame.pop();
                    if let Some(Val::Table(table)) = frame.stack.last() {
                        table
                            .set(key, value)
                            .map_err(|m| self.locate(proto, ip, m))?;
                    }
                }

                Instruction::InitList {
                    start,
                    count,
                    expand,
                } => {
                    let n = *count as usize + if *expand { frame.multi } else { 0 };
                    let values = frame.take(n);
                    if let Some(Val::Table(table)) = frame.stack.last() {
                        let mut data = table.lock();
                        for (i, value) in values.into_iter().enumerate() {
                            let key = Val::Number(*start as f64 + i as f64);
                            // Positive integer keys are always valid
                            let _ = data.set(key, value);
                        }
                    }
                }

                Instruction::Closure(index) => {
                    let child = &proto.children[*index as usize];
                    let upvalues = child
                        .upvalues
                        .iter()
                        .map(|capture| match *capture {
                            Capture::Cell(cell) => Arc::clone(&frame.cells[cell as usize]),
                            Capture::Upvalue(index) => Arc::clone(&closure.upvalues[index as usize]),
                        })
                        .collect();
                    frame.push(Val::Function(Function::Lua(Arc::new(Closure {
                        proto: Arc::clone(child),
                        upvalues,
                    }))));
                }

                Instruction::SelfMethod(name) => {
                    let object = frame.pop();
                    let method = self
                        .index(&object, &Val::Str(Arc::clone(name)))
                        .map_err(|m| self.locate(proto, ip, m))?;
                    frame.push(method);
                    frame.push(object);
                }

                Instruction::Call {
                    argc,
                    expand,
                    results,
                } => {
                    let n = *argc as usize + if *expand { frame.multi } else { 0 };
                    let args = frame.take(n);
                    let func = frame.pop();
                    if !matches!(func, Val::Function(_)) {
                        return Err(self.locate(
                            proto,
                            ip,
                            format!("attempt to call a {} value", func.type_name()),
                        ));
                    }
                    self.line = proto.line_at(ip);
                    let values = self.call(&func, args)?;
                    frame.push_results(values, *results);
                }

                Instruction::Vararg(results) => {
                    let values = frame.varargs.clone();
                    frame.push_results(values, *results);
                }

                Instruction::Return { count, expand } => {
                    let n = *count as usize + if *expand { frame.multi } else { 0 };
                    return Ok(frame.take(n));
                }

                Instruction::Add
                | Instruction::Sub
                | Instruction::Mul
                | Instruction::Div
                | Instruction::Mod
                | Instruction::Pow => {
                    let b = frame.pop();
                    let a = frame.pop();
                    let value = arith(instruction, &a, &b).map_err(|m| self.locate(proto, ip, m))?;
                    frame.push(value);
                }

                Instruction::Neg => {
                    let a = frame.pop();
                    match a.to_number() {
                        Some(n) => frame.push(Val::Number(-n)),
                        None => {
                            return Err(self.locate(proto, ip, arith_error(&a)));
                        }
                    }
                }

                Instruction::Concat => {
                    let b = frame.pop();
                    let a = frame.pop();
                    let value = concat(&a, &b).map_err(|m| self.locate(proto, ip, m))?;
                    frame.push(value);
                }

                Instruction::Len => {
                    let a = frame.pop();
                    let value = self.length(&a).map_err(|m| self.locate(proto, ip, m))?;
                    frame.push(value);
                }

                Instruction::Eq => {
                    let b = frame.pop();
                    let a = frame.pop();
                    frame.push(Val::Bool(a.raw_equal(&b)));
                }

                Instruction::Ne => {
                    let b = frame.pop();
                    let a = frame.pop();
                    frame.push(Val::Bool(!a.raw_equal(&b)));
                }

                Instruction::Lt | Instruction::Lte | Instruction::Gt | Instruction::Gte => {
                    let b = frame.pop();
                    let a = frame.pop();
                    let result = match instruction {
                        Instruction::Lt => less_than(&a, &b),
                        Instruction::Lte => less_equal(&a, &b),
                        Instruction::Gt => less_than(&b, &a),
                        _ => less_equal(&b, &a),
                    };
                    let result = result.map_err(|m| self.locate(proto, ip, m))?;
                    frame.push(Val::Bool(result));
                }

                Instruction::Not => {
                    let a = frame.pop();
                    frame.push(Val::Bool(!a.is_truthy()));
                }

                Instruction::Jump(target) => {
                    pc = *target;
                }

                Instruction::JumpIfFalse(target) => {
                    if !frame.pop().is_truthy() {
                        pc = *target;
                    }
                }

                Instruction::JumpIfTrue(target) => {
                    if frame.pop().is_truthy() {
                        pc = *target;
                    }
                }

                Instruction::JumpIfFalseKeep(target) => {
                    if frame.stack.last().is_some_and(|v| !v.is_truthy()) {
                        pc = *target;
                    } else {
                        frame.pop();
                    }
                }

                Instruction::JumpIfTrueKeep(target) => {
                    if frame.stack.last().is_some_and(Val::is_truthy) {
                        pc = *target;
                    } else {
                        frame.pop();
                    }
                }

                Instruction::Loop(target) => {
                    self.ctx.checkpoint()?;
                    pc = *target;
                }

                Instruction::ForPrep { base, exit } => {
                    let base = *base as usize;
                    let mut control = [0.0; 3];
                    for (i, what) in ["initial value", "limit", "step"].iter().enumerate() {
                        control[i] = frame.slots[base + i].to_number().ok_or_else(|| {
                            self.locate(proto, ip, format!("'for' {} must be a number", what))
                        })?;
                        frame.slots[base + i] = Val::Number(control[i]);
                    }
                    let [start, limit, step] = control;
                    if step == 0.0 {
                        return Err(self.locate(proto, ip, "'for' step is zero"));
                    }
                    if (step > 0.0 && start > limit) || (step < 0.0 && start < limit) {
                        pc = *exit;
                    }
                }

                Instruction::ForLoop { base, body } => {
                    self.ctx.checkpoint()?;
                    let base = *base as usize;
                    if let (Val::Number(i), Val::Number(limit), Val::Number(step)) =
                        (&frame.slots[base], &frame.slots[base + 1], &frame.slots[base + 2])
                    {
                        let next = i + step;
                        let in_range = if *step > 0.0 { next <= *limit } else { next >= *limit };
                        if in_range {
                            frame.slots[base] = Val::Number(next);
                            pc = *body;
                        }
                    }
                }

                Instruction::TForCall { base, nvars, exit } => {
                    let base = *base as usize;
                    let iterator = frame.slots[base].clone();
                    if !matches!(iterator, Val::Function(_)) {
                        return Err(self.locate(
                            proto,
                            ip,
                            format!("attempt to call a {} value", iterator.type_name()),
                        ));
                    }
                    let args = vec![frame.slots[base + 1].clone(), frame.slots[base + 2].clone()];
                    self.line = proto.line_at(ip);
                    let mut values = self.call(&iterator, args)?;

                    match values.first() {
                        None | Some(Val::Nil) => pc = *exit,
                        Some(first) => {
                            frame.slots[base + 2] = first.clone();
                            values.resize(*nvars as usize, Val::Nil);
                            frame.stack.extend(values);
                        }
                    }
                }
            }
        }

        Ok(Vec::new())
    }
}

/// Activation record of one Lua call
struct Frame {
    slots: Vec<Val>,
    cells: Vec<Cell>,
    stack: Vec<Val>,
    varargs: Vec<Val>,
    /// Number of values pushed by the last multi-result instruction
    multi: usize,
}

impl Frame {
    fn new(proto: &Proto) -> Self {
        Self {
            slots: vec![Val::Nil; proto.nslots as usize],
            cells: (0..proto.ncells).map(|_| new_cell(Val::Nil)).collect(),
            stack: Vec::with_capacity(16),
            varargs: Vec::new(),
            multi: 0,
        }
    }

    #[inline]
    fn push(&mut self, value: Val) {
        self.stack.push(value);
    }

    #[inline]
    fn pop(&mut self) -> Val {
        self.stack.pop().unwrap_or_default()
    }

    /// Remove the top `n` values, in push order
    #[inline]
    fn take(&mut self, n: usize) -> Vec<Val> {
        let at = self.stack.len().saturating_sub(n);
        self.stack.split_off(at)
    }

    fn push_results(&mut self, mut values: Vec<Val>, results: Results) {
        match results {
            Results::Fixed(n) => {
                values.resize(n as usize, Val::Nil);
                self.stack.extend(values);
            }
            Results::Multi => {
                self.multi = values.len();
                self.stack.extend(values);
            }
        }
    }
}

#[inline]
fn arith(op: &Instruction, a: &Val, b: &Val) -> Result<Val, String> {
    let (x, y) = match (a, b) {
        (Val::Number(x), Val::Number(y)) => (*x, *y),
        _ => match (a.to_number(), b.to_number()) {
            (Some(x), Some(y)) => (x, y),
            (None, _) => return Err(arith_error(a)),
            (_, None) => return Err(arith_error(b)),
        },
    };
    let n = match op {
        Instruction::Add => x + y,
        Instruction::Sub => x - y,
        Instruction::Mul => x * y,
        Instruction::Div => x / y,
        Instruction::Mod => x - (x / y).floor() * y,
        Instruction::Pow => x.powf(y),
        _ => f64::NAN,
    };
    Ok(Val::Number(n))
}

fn arith_error(value: &Val) -> String {
    format!("attempt to perform arithmetic on a {} value", value.type_name())
}

fn concat(a: &Val, b: &Val) -> Result<Val, String> {
    match (a.to_str(), b.to_str()) {
        (Some(x), Some(y)) => {
            let mut out = String::with_capacity(x.len() + y.len());
            out.push_str(&x);
            out.push_str(&y);
            Ok(Val::Str(Arc::from(out)))
        }
        (None, _) => Err(format!("attempt to concatenate a {} value", a.type_name())),
        (_, None) => Err(format!("attempt to concatenate a {} value", b.type_name())),
    }
}

pub(crate) fn less_than(a: &Val, b: &Val) -> Result<bool, String> {
    match (a, b) {
        (Val::Number(x), Val::Number(y)) => Ok(x < y),
        (Val::Str(x), Val::Str(y)) => Ok(x < y),
        _ => Err(compare_error(a, b)),
    }
}

pub(crate) fn less_equal(a: &Val, b: &Val) -> Result<bool, String> {
    match (a, b) {
        (Val::Number(x), Val::Number(y)) => Ok(x <= y),
        (Val::Str(x), Val::Str(y)) => Ok(x <= y),
        _ => Err(compare_error(a, b)),
    }
}

fn compare_error(a: &Val, b: &Val) -> String {
    let (ta, tb) = (a.type_name(), b.type_name());
    if ta == tb {
        format!("attempt to compare two {} values", ta)
    } else {
        format!("attempt to compare {} with {}", ta, tb)
    }
}
