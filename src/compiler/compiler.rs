// src/compiler/compiler.rs
//! Compiler that converts AST to bytecode

use crate::compiler::bytecode::{Capture, Instruction, Proto, Results, Storage};
use crate::parser::ast::*;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct CodegenError {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for CodegenError {}

/// Positional items buffered before one `InitList`
const LIST_BATCH: u16 = 50;

pub struct Compiler<'f> {
    function: &'f Function,
    storage: Vec<Storage>,
    nslots: u16,
    ncells: u16,
    instructions: Vec<Instruction>,
    lines: Vec<u32>,
    line: u32,
    label_counter: usize,
    labels: Vec<Option<usize>>,
    loop_exits: Vec<usize>,
    children: Vec<Arc<Proto>>,
}

impl<'f> Compiler<'f> {
    fn new(function: &'f Function) -> Result<Self, CodegenError> {
        let mut compiler = Self {
            function,
            storage: Vec::with_capacity(function.locals.len()),
            nslots: 0,
            ncells: 0,
            instructions: Vec::new(),
            lines: Vec::new(),
            line: function.line,
            label_counter: 0,
            labels: Vec::new(),
            loop_exits: Vec::new(),
            children: Vec::new(),
        };

        for local in &function.locals {
            let storage = if local.captured {
                Storage::Cell(compiler.bump_cells()?)
            } else {
                Storage::Slot(compiler.hidden_slots(1)?)
            };
            compiler.storage.push(storage);
        }

        Ok(compiler)
    }

    /// Compile a function and, recursively, every function nested in it
    ///
    /// Upvalue captures of the returned prototype are left empty; the
    /// enclosing function fills them in because only it knows where the
    /// captured locals live.
    pub fn compile_function(function: &Function) -> Result<Proto, CodegenError> {
        let mut compiler = Compiler::new(function)?;

        compiler.compile_block(&function.body)?;
        compiler.emit(Instruction::Return {
            count: 0,
            expand: false,
        });

        let params = function
            .params
            .iter()
            .map(|id| compiler.storage[*id])
            .collect();
        let code = compiler.resolve_labels()?;

        Ok(Proto {
            name: function.name.clone(),
            line: function.line,
            params,
            is_vararg: function.is_vararg,
            nslots: compiler.nslots,
            ncells: compiler.ncells,
            code,
            lines: compiler.lines,
            children: compiler.children,
            upvalues: Vec::new(),
        })
    }

    fn compile_block(&mut self, block: &[Stat]) -> Result<(), CodegenError> {
        for stmt in block {
            self.compile_statement(stmt)?;
        }
        Ok(())
    }

    fn compile_statement(&mut self, stmt: &Stat) -> Result<(), CodegenError> {
        self.line = stmt.line;

        match &stmt.kind {
            StatKind::Local { names, values } => {
                self.compile_expression_list(values, names.len())?;
                for id in names.iter().rev() {
                    self.emit_new_local(*id);
                }
            }

            StatKind::LocalFunction { var, function } => {
                // The cell exists before the closure so the function can
                // capture itself
                let storage = self.storage[*var];
                if let Storage::Cell(cell) = storage {
                    self.emit(Instruction::NewCell(cell));
                }
                self.compile_closure(function)?;
                match storage {
                    Storage::Slot(slot) => self.emit(Instruction::StoreLocal(slot)),
                    Storage::Cell(cell) => self.emit(Instruction::StoreCell(cell)),
                }
            }

            StatKind::Assign { targets, values } => {
                if let [target] = targets.as_slice() {
                    self.compile_single_assignment(target, values)?;
                } else {
                    self.compile_multiple_assignment(targets, values)?;
                }
            }

            StatKind::Call(call) => {
                self.compile_call(call, Results::Fixed(0))?;
            }

            StatKind::Do(block) => {
                self.compile_block(block)?;
            }

            StatKind::While { condition, body } => {
                let top_label = self.new_label();
                let end_label = self.new_label();

                self.place_label(top_label);
                self.compile_expression(condition)?;
                self.emit(Instruction::JumpIfFalse(end_label));

                self.compile_loop_body(body, end_label)?;
                self.emit(Instruction::Loop(top_label));

                self.place_label(end_label);
            }

            StatKind::Repeat { body, condition } => {
                let top_label = self.new_label();
                let end_label = self.new_label();

                self.place_label(top_label);
                self.compile_loop_body(body, end_label)?;
                self.compile_expression(condition)?;
                self.emit(Instruction::JumpIfTrue(end_label));
                self.emit(Instruction::Loop(top_label));

                self.place_label(end_label);
            }

            StatKind::If {
                branches,
                else_block,
            } => {
                let end_label = self.new_label();

                for (condition, block) in branches {
                    let next_label = self.new_label();
                    self.compile_expression(condition)?;
                    self.emit(Instruction::JumpIfFalse(next_label));
                    self.compile_block(block)?;
                    self.emit(Instruction::Jump(end_label));
                    self.place_label(next_label);
                }

                if let Some(block) = else_block {
                    self.compile_block(block)?;
                }

                self.place_label(end_label);
            }

            StatKind::NumericFor {
                var,
                start,
                limit,
                step,
                body,
            } => {
                let base = self.hidden_slots(3)?;
                let body_label = self.new_label();
                let end_label = self.new_label();

                self.compile_expression(start)?;
                self.emit(Instruction::StoreLocal(base));
                self.compile_expression(limit)?;
                self.emit(Instruction::StoreLocal(base + 1));
                match step {
                    Some(step) => self.compile_expression(step)?,
                    None => self.emit(Instruction::Number(1.0)),
                }
                self.emit(Instruction::StoreLocal(base + 2));

                self.emit(Instruction::ForPrep {
                    base,
                    exit: end_label,
                });
                self.place_label(body_label);

                // Each iteration gets a fresh copy of the counter
                self.emit(Instruction::LoadLocal(base));
                self.emit_new_local(*var);
                self.compile_loop_body(body, end_label)?;

                self.emit(Instruction::ForLoop {
                    base,
                    body: body_label,
                });
                self.place_label(end_label);
            }

            StatKind::GenericFor { vars, values, body } => {
                let base = self.hidden_slots(3)?;
                let nvars = self.narrow(vars.len())?;
                let top_label = self.new_label();
                let end_label = self.new_label();

                // iterator function, state, control
                self.compile_expression_list(values, 3)?;
                self.emit(Instruction::StoreLocal(base + 2));
                self.emit(Instruction::StoreLocal(base + 1));
                self.emit(Instruction::StoreLocal(base));

                self.place_label(top_label);
                self.emit(Instruction::TForCall {
                    base,
                    nvars,
                    exit: end_label,
                });
                for id in vars.iter().rev() {
                    self.emit_new_local(*id);
                }
                self.compile_loop_body(body, end_label)?;
                self.emit(Instruction::Jump(top_label));

                self.place_label(end_label);
            }

            StatKind::Return(values) => {
                let (count, expand) = self.compile_expression_list_multi(values)?;
                self.emit(Instruction::Return { count, expand });
            }

            StatKind::Break => {
                let Some(&exit) = self.loop_exits.last() else {
                    return Err(self.error("no loop to break"));
                };
                self.emit(Instruction::Jump(exit));
            }
        }

        Ok(())
    }

    fn compile_loop_body(&mut self, body: &[Stat], exit: usize) -> Result<(), CodegenError> {
        self.loop_exits.push(exit);
        let result = self.compile_block(body);
        self.loop_exits.pop();
        result
    }

    fn compile_single_assignment(&mut self, target: &Expr, values: &[Expr]) -> Result<(), CodegenError> {
        match target {
            Expr::Index(table, key) => {
                self.compile_expression(table)?;
                self.compile_expression(key)?;
                self.compile_expression_list(values, 1)?;
                self.emit(Instruction::SetIndex);
            }
            _ => {
                self.compile_expression_list(values, 1)?;
                self.emit_store(target)?;
            }
        }
        Ok(())
    }

    /// `a, t[k] = x, y`: every table and key is evaluated, then every
    /// value, then the stores happen left to right
    fn compile_multiple_assignment(
        &mut self,
        targets: &[Expr],
        values: &[Expr],
    ) -> Result<(), CodegenError> {
        let mut places = Vec::with_capacity(targets.len());
        for target in targets {
            if let Expr::Index(table, key) = target {
                let slots = self.hidden_slots(2)?;
                self.compile_expression(table)?;
                self.emit(Instruction::StoreLocal(slots));
                self.compile_expression(key)?;
                self.emit(Instruction::StoreLocal(slots + 1));
                places.push(Some(slots));
            } else {
                places.push(None);
            }
        }

        let temps = self.hidden_slots(targets.len())?;
        self.compile_expression_list(values, targets.len())?;
        for i in (0..targets.len()).rev() {
            self.emit(Instruction::StoreLocal(temps + i as u16));
        }

        for (i, (target, place)) in targets.iter().zip(places).enumerate() {
            match place {
                Some(slots) => {
                    self.emit(Instruction::LoadLocal(slots));
                    self.emit(Instruction::LoadLocal(slots + 1));
                    self.emit(Instruction::LoadLocal(temps + i as u16));
                    self.emit(Instruction::SetIndex);
                }
                None => {
                    self.emit(Instruction::LoadLocal(temps + i as u16));
                    self.emit_store(target)?;
                }
            }
        }
        Ok(())
    }

    /// Compile an expression that leaves exactly one value on the stack
    fn compile_expression(&mut self, expr: &Expr) -> Result<(), CodegenError> {
        match expr {
            Expr::Nil => self.emit(Instruction::Nil),
            Expr::True => self.emit(Instruction::True),
            Expr::False => self.emit(Instruction::False),
            Expr::Number(n) => self.emit(Instruction::Number(*n)),
            Expr::Str(s) => self.emit(Instruction::Str(Arc::from(s.as_str()))),
            Expr::Vararg => self.emit(Instruction::Vararg(Results::Fixed(1))),

            Expr::Function(function) => self.compile_closure(function)?,

            Expr::Local(id) => match self.storage[*id] {
                Storage::Slot(slot) => self.emit(Instruction::LoadLocal(slot)),
                Storage::Cell(cell) => self.emit(Instruction::LoadCell(cell)),
            },
            Expr::Upvalue(index) => {
                let index = self.narrow(*index)?;
                self.emit(Instruction::LoadUpvalue(index));
            }
            Expr::Global(name) => self.emit(Instruction::LoadGlobal(Arc::from(name.as_str()))),

            Expr::Index(table, key) => {
                self.compile_expression(table)?;
                if let Expr::Str(name) = key.as_ref() {
                    self.emit(Instruction::GetField(Arc::from(name.as_str())));
                } else {
                    self.compile_expression(key)?;
                    self.emit(Instruction::GetIndex);
                }
            }

            Expr::Call { .. } | Expr::Method { .. } => {
                self.compile_call(expr, Results::Fixed(1))?;
            }

            Expr::Binary { op, left, right } => {
                self.compile_expression(left)?;
                self.compile_expression(right)?;
                self.emit(match op {
                    BinaryOp::Add => Instruction::Add,
                    BinaryOp::Sub => Instruction::Sub,
                    BinaryOp::Mul => Instruction::Mul,
                    BinaryOp::Div => Instruction::Div,
                    BinaryOp::Mod => Instruction::Mod,
                    BinaryOp::Pow => Instruction::Pow,
                    BinaryOp::Concat => Instruction::Concat,
                    BinaryOp::Eq => Instruction::Eq,
                    BinaryOp::NotEq => Instruction::Ne,
                    BinaryOp::Lt => Instruction::Lt,
                    BinaryOp::Lte => Instruction::Lte,
                    BinaryOp::Gt => Instruction::Gt,
                    BinaryOp::Gte => Instruction::Gte,
                });
            }

            Expr::Unary { op, operand } => {
                self.compile_expression(operand)?;
                self.emit(match op {
                    UnaryOp::Neg => Instruction::Neg,
                    UnaryOp::Not => Instruction::Not,
                    UnaryOp::Len => Instruction::Len,
                });
            }

            Expr::And(left, right) => {
                let end_label = self.new_label();
                self.compile_expression(left)?;
                self.emit(Instruction::JumpIfFalseKeep(end_label));
                self.compile_expression(right)?;
                self.place_label(end_label);
            }

            Expr::Or(left, right) => {
                let end_label = self.new_label();
                self.compile_expression(left)?;
                self.emit(Instruction::JumpIfTrueKeep(end_label));
                self.compile_expression(right)?;
                self.place_label(end_label);
            }

            Expr::Table(fields) => self.compile_table(fields)?,

            Expr::Paren(inner) => self.compile_expression(inner)?,
        }

        Ok(())
    }

    fn compile_table(&mut self, fields: &[TableField]) -> Result<(), CodegenError> {
        self.emit(Instruction::NewTable);

        let mut next_index: u32 = 1;
        let mut pending: u16 = 0;

        for (i, field) in fields.iter().enumerate() {
            match field {
                TableField::Keyed(key, value) => {
                    self.flush_list(&mut next_index, &mut pending, false);
                    self.compile_expression(key)?;
                    self.compile_expression(value)?;
                    self.emit(Instruction::InitField);
                }
                TableField::Positional(value) => {
                    if i == fields.len() - 1 && value.is_multi() {
                        self.compile_call(value, Results::Multi)?;
                        self.flush_list(&mut next_index, &mut pending, true);
                    } else {
                        self.compile_expression(value)?;
                        pending += 1;
                        if pending == LIST_BATCH {
                            self.flush_list(&mut next_index, &mut pending, false);
                        }
                    }
                }
            }
        }

        self.flush_list(&mut next_index, &mut pending, false);
        Ok(())
    }

    fn flush_list(&mut self, next_index: &mut u32, pending: &mut u16, expand: bool) {
        if *pending == 0 && !expand {
            return;
        }
        self.emit(Instruction::InitList {
            start: *next_index,
            count: *pending,
            expand,
        });
        *next_index += *pending as u32;
        *pending = 0;
    }

    /// Compile a call or `...` producing `results` values
    fn compile_call(&mut self, expr: &Expr, results: Results) -> Result<(), CodegenError> {
        match expr {
            Expr::Call { func, args } => {
                self.compile_expression(func)?;
                let (argc, expand) = self.compile_expression_list_multi(args)?;
                self.emit(Instruction::Call {
                    argc,
                    expand,
                    results,
                });
            }
            Expr::Method { object, name, args } => {
                self.compile_expression(object)?;
                self.emit(Instruction::SelfMethod(Arc::from(name.as_str())));
                let (argc, expand) = self.compile_expression_list_multi(args)?;
                self.emit(Instruction::Call {
                    argc: argc + 1,
                    expand,
                    results,
                });
            }
            Expr::Vararg => self.emit(Instruction::Vararg(results)),
            other => {
                // Single-valued expression in a multi-value position
                self.compile_expression(other)?;
                match results {
                    Results::Fixed(0) => self.emit(Instruction::Pop(1)),
                    Results::Fixed(n) => {
                        for _ in 1..n {
                            self.emit(Instruction::Nil);
                        }
                    }
                    Results::Multi => return Err(self.error("expression cannot expand")),
                }
            }
        }
        Ok(())
    }

    /// Push exactly `want` values from an expression list
    fn compile_expression_list(&mut self, exprs: &[Expr], want: usize) -> Result<(), CodegenError> {
        for (i, expr) in exprs.iter().enumerate() {
            let last = i == exprs.len() - 1;
            if i < want {
                if last && expr.is_multi() {
                    let remaining = u8::try_from(want - i)
                        .map_err(|_| self.error("too many values in assignment"))?;
                    return self.compile_call(expr, Results::Fixed(remaining));
                }
                self.compile_expression(expr)?;
            } else if expr.is_multi() {
                self.compile_call(expr, Results::Fixed(0))?;
            } else {
                self.compile_expression(expr)?;
                self.emit(Instruction::Pop(1));
            }
        }

        for _ in exprs.len()..want {
            self.emit(Instruction::Nil);
        }
        Ok(())
    }

    /// Push every value of an expression list; a call or `...` in last
    /// position expands to all of its results
    fn compile_expression_list_multi(&mut self, exprs: &[Expr]) -> Result<(u16, bool), CodegenError> {
        let count = self.narrow(exprs.len())?;
        for (i, expr) in exprs.iter().enumerate() {
            if i == exprs.len() - 1 && expr.is_multi() {
                self.compile_call(expr, Results::Multi)?;
                return Ok((count - 1, true));
            }
            self.compile_expression(expr)?;
        }
        Ok((count, false))
    }

    fn compile_closure(&mut self, function: &Function) -> Result<(), CodegenError> {
        let mut proto = Compiler::compile_function(function)?;

        proto.upvalues = function
            .upvalues
            .iter()
            .map(|upvalue| match upvalue.source {
                UpvalueSource::Local(id) => match self.storage[id] {
                    Storage::Cell(cell) => Ok(Capture::Cell(cell)),
                    Storage::Slot(_) => Err(self.error(format!(
                        "upvalue '{}' refers to an uncaptured local",
                        upvalue.name
                    ))),
                },
                UpvalueSource::Upvalue(index) => self.narrow(index).map(Capture::Upvalue),
            })
            .collect::<Result<_, _>>()?;

        let index = self.narrow(self.children.len())?;
        self.children.push(Arc::new(proto));
        self.emit(Instruction::Closure(index));
        Ok(())
    }

    /// Store the value on top of the stack into a freshly declared local
    fn emit_new_local(&mut self, id: LocalId) {
        match self.storage[id] {
            Storage::Slot(slot) => self.emit(Instruction::StoreLocal(slot)),
            Storage::Cell(cell) => {
                self.emit(Instruction::NewCell(cell));
                self.emit(Instruction::StoreCell(cell));
            }
        }
    }

    fn emit_store(&mut self, target: &Expr) -> Result<(), CodegenError> {
        match target {
            Expr::Local(id) => match self.storage[*id] {
                Storage::Slot(slot) => self.emit(Instruction::StoreLocal(slot)),
                Storage::Cell(cell) => self.emit(Instruction::StoreCell(cell)),
            },
            Expr::Upvalue(index) => {
                let index = self.narrow(*index)?;
                self.emit(Instruction::StoreUpvalue(index));
            }
            Expr::Global(name) => self.emit(Instruction::StoreGlobal(Arc::from(name.as_str()))),
            _ => return Err(self.error("cannot assign to this expression")),
        }
        Ok(())
    }

    // Helper methods

    fn emit(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
        self.lines.push(self.line);
    }

    fn hidden_slots(&mut self, count: usize) -> Result<u16, CodegenError> {
        let first = self.nslots;
        let count = self.narrow(count)?;
        self.nslots = first
            .checked_add(count)
            .ok_or_else(|| self.error("too many local variables"))?;
        Ok(first)
    }

    fn bump_cells(&mut self) -> Result<u16, CodegenError> {
        let cell = self.ncells;
        self.ncells = cell
            .checked_add(1)
            .ok_or_else(|| self.error("too many captured variables"))?;
        Ok(cell)
    }

    fn narrow(&self, n: usize) -> Result<u16, CodegenError> {
        u16::try_from(n).map_err(|_| self.error("function or expression too complex"))
    }

    fn new_label(&mut self) -> usize {
        let label = self.label_counter;
        self.label_counter += 1;
        self.labels.push(None);
        label
    }

    fn place_label(&mut self, label: usize) {
        self.labels[label] = Some(self.instructions.len());
    }

    fn resolve_labels(&mut self) -> Result<Vec<Instruction>, CodegenError> {
        let labels = std::mem::take(&mut self.labels);
        let target = |label: usize| -> Result<usize, CodegenError> {
            labels.get(label).copied().flatten().ok_or(CodegenError {
                message: format!("unplaced label {}", label),
                line: self.function.line,
            })
        };

        let mut code = std::mem::take(&mut self.instructions);
        for instruction in code.iter_mut() {
            match instruction {
                Instruction::Jump(label)
                | Instruction::JumpIfFalse(label)
                | Instruction::JumpIfTrue(label)
                | Instruction::JumpIfFalseKeep(label)
                | Instruction::JumpIfTrueKeep(label)
                | Instruction::Loop(label)
                | Instruction::ForPrep { exit: label, .. }
                | Instruction::ForLoop { body: label, .. }
                | Instruction::TForCall { exit: label, .. } => {
                    *label = target(*label)?;
                }
                _ => {}
            }
        }
        Ok(code)
    }

    fn error(&self, message: impl Into<String>) -> CodegenError {
        CodegenError {
            message: message.into(),
            line: self.line,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parser::Parser;

    fn compile(source: &str) -> Proto {
        let chunk = Parser::new(source).unwrap().parse().unwrap();
        Compiler::compile_function(&chunk).unwrap()
    }

    #[test]
    fn test_compile_global_function() {
        let proto = compile("function main(a, b) return a + b end");
        assert_eq!(proto.children.len(), 1);

        let main = &proto.children[0];
        assert_eq!(main.params, vec![Storage::Slot(0), Storage::Slot(1)]);
        assert_eq!(
            main.code[..4],
            [
                Instruction::LoadLocal(0),
                Instruction::LoadLocal(1),
                Instruction::Add,
                Instruction::Return {
                    count: 1,
                    expand: false
                },
            ]
        );
        assert!(proto.code.contains(&Instruction::StoreGlobal(Arc::from("main"))));
    }

    #[test]
    fn test_captured_locals_use_cells() {
        let proto = compile("local n = 0\nlocal function inc() n = n + 1 end");
        assert_eq!(proto.ncells, 1);
        assert_eq!(proto.code[0], Instruction::Number(0.0));
        assert_eq!(proto.code[1], Instruction::NewCell(0));
        assert_eq!(proto.children[0].upvalues, vec![Capture::Cell(0)]);
        assert!(proto.children[0].code.contains(&Instruction::StoreUpvalue(0)));
    }

    #[test]
    fn test_jumps_are_resolved() {
        let proto = compile("local i = 0\nwhile i < 10 do i = i + 1 end");
        let len = proto.code.len();
        for inst in &proto.code {
            match inst {
                Instruction::JumpIfFalse(t) | Instruction::Loop(t) => assert!(*t <= len),
                _ => {}
            }
        }
        assert!(proto.code.iter().any(|i| matches!(i, Instruction::Loop(_))));
    }

    #[test]
    fn test_multi_results_expand_in_last_position() {
        let proto = compile("print(1, f())");
        assert!(proto.code.contains(&Instruction::Call {
            argc: 0,
            expand: false,
            results: Results::Multi
        }));
        assert!(proto.code.contains(&Instruction::Call {
            argc: 1,
            expand: true,
            results: Results::Fixed(0)
        }));
    }

    #[test]
    fn test_line_table_matches_code() {
        let proto = compile("local a = 1\n\nlocal b = a");
        assert_eq!(proto.code.len(), proto.lines.len());
        assert_eq!(proto.lines[0], 1);
        assert_eq!(proto.lines[2], 3);
    }
}
