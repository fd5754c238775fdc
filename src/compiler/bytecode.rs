// src/compiler/bytecode.rs
//! Bytecode instructions for the script VM

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Bumped whenever the serialized layout of [`Proto`] changes
pub const BYTECODE_VERSION: u32 = 1;

/// How many values a call or `...` leaves on the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Results {
    /// Exactly this many, padded with nil or truncated
    Fixed(u8),
    /// All of them; the count is kept for the next expanding instruction
    Multi,
}

/// Where a local variable lives in its frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Storage {
    Slot(u16),
    Cell(u16),
}

/// How a closure obtains one of its upvalues when it is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capture {
    /// A cell of the frame creating the closure
    Cell(u16),
    /// An upvalue of the closure creating the closure
    Upvalue(u16),
}

/// Bytecode instructions executed by the VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    // Constants
    Nil,
    True,
    False,
    Number(f64),
    Str(Arc<str>),

    // Stack operations
    Pop(u16),

    // Variable access
    LoadLocal(u16),
    StoreLocal(u16),
    NewCell(u16),
    LoadCell(u16),
    StoreCell(u16),
    LoadUpvalue(u16),
    StoreUpvalue(u16),
    LoadGlobal(Arc<str>),
    StoreGlobal(Arc<str>),

    // Tables
    NewTable,
    /// [t, k] -> [t[k]]
    GetIndex,
    /// [t] -> [t.name]
    GetField(Arc<str>),
    /// [t, k, v] -> []
    SetIndex,
    /// [t, k, v] -> [t], used by table constructors
    InitField,
    /// [t, v1..vn] -> [t], storing t[start + i] = vi
    InitList { start: u32, count: u16, expand: bool },

    // Functions
    Closure(u16),
    /// [obj] -> [obj.name, obj]
    SelfMethod(Arc<str>),
    /// [f, a1..an] -> results
    Call { argc: u16, expand: bool, results: Results },
    Vararg(Results),
    Return { count: u16, expand: bool },

    // Arithmetic operations
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Neg,
    Concat,
    Len,

    // Comparison operations
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Not,

    // Control flow
    Jump(usize),
    JumpIfFalse(usize),
    JumpIfTrue(usize),
    /// Jump when the top is falsy, leaving it; otherwise pop it (`and`)
    JumpIfFalseKeep(usize),
    /// Jump when the top is truthy, leaving it; otherwise pop it (`or`)
    JumpIfTrueKeep(usize),
    /// Backward jump of `while` and `repeat`, a cancellation checkpoint
    Loop(usize),
    /// Validate the numeric `for` control slots; skip the loop when it runs
    /// zero times
    ForPrep { base: u16, exit: usize },
    /// Step the numeric `for` counter and jump back while in range
    ForLoop { base: u16, body: usize },
    /// Call the generic `for` iterator and push `nvars` results, or exit
    TForCall { base: u16, nvars: u16, exit: usize },
}

impl Instruction {
    /// Destination of an instruction that transfers control
    pub fn jump_target(&self) -> Option<usize> {
        match *self {
            Instruction::Jump(target)
            | Instruction::JumpIfFalse(target)
            | Instruction::JumpIfTrue(target)
            | Instruction::JumpIfFalseKeep(target)
            | Instruction::JumpIfTrueKeep(target)
            | Instruction::Loop(target)
            | Instruction::ForPrep { exit: target, .. }
            | Instruction::ForLoop { body: target, .. }
            | Instruction::TForCall { exit: target, .. } => Some(target),
            _ => None,
        }
    }
}

/// A compiled function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proto {
    pub name: String,
    pub line: u32,
    /// Storage of each declared parameter, in order
    pub params: Vec<Storage>,
    pub is_vararg: bool,
    pub nslots: u16,
    pub ncells: u16,
    pub code: Vec<Instruction>,
    /// Source line of each instruction
    pub lines: Vec<u32>,
    pub children: Vec<Arc<Proto>>,
    pub upvalues: Vec<Capture>,
}

impl Proto {
    pub fn line_at(&self, pc: usize) -> u32 {
        self.lines.get(pc).copied().unwrap_or(self.line)
    }

    /// Check that every slot, cell, upvalue, child and jump target this
    /// function and its children refer to exists
    ///
    /// `ncaptures` is the number of upvalues the function is created with.
    /// The VM indexes frames without bounds checks of its own, so bytecode
    /// from outside the compiler must pass this before it runs.
    pub fn verify(&self, ncaptures: usize) -> Result<(), String> {
        let fail = |pc: usize, what: String| {
            Err(format!("{} (function '{}', instruction {})", what, self.name, pc))
        };

        if self.upvalues.len() != ncaptures {
            return Err(format!(
                "function '{}' declares {} upvalues but is created with {}",
                self.name,
                self.upvalues.len(),
                ncaptures
            ));
        }
        if self.lines.len() != self.code.len() {
            return Err(format!("function '{}' has a truncated line table", self.name));
        }
        for storage in &self.params {
            self.check_storage(*storage)
                .map_err(|what| format!("{} (function '{}', parameter)", what, self.name))?;
        }

        let slot = |index: usize, span: usize| {
            if index + span <= self.nslots as usize {
                Ok(())
            } else {
                Err(format!("slot {} out of range", index + span - 1))
            }
        };

        for (pc, instruction) in self.code.iter().enumerate() {
            let checked = match instruction {
                Instruction::LoadLocal(i) | Instruction::StoreLocal(i) => slot(*i as usize, 1),
                Instruction::NewCell(i) | Instruction::LoadCell(i) | Instruction::StoreCell(i) => {
                    self.check_storage(Storage::Cell(*i))
                }
                Instruction::LoadUpvalue(i) | Instruction::StoreUpvalue(i) => {
                    if (*i as usize) < self.upvalues.len() {
                        Ok(())
                    } else {
                        Err(format!("upvalue {} out of range", i))
                    }
                }
                Instruction::ForPrep { base, .. }
                | Instruction::ForLoop { base, .. }
                | Instruction::TForCall { base, .. } => slot(*base as usize, 3),
                Instruction::Closure(i) => match self.children.get(*i as usize) {
                    Some(child) => child.upvalues.iter().try_for_each(|capture| match *capture {
                        Capture::Cell(cell) => self.check_storage(Storage::Cell(cell)),
                        Capture::Upvalue(up) if (up as usize) < self.upvalues.len() => Ok(()),
                        Capture::Upvalue(up) => Err(format!("captured upvalue {} out of range", up)),
                    }),
                    None => Err(format!("function {} out of range", i)),
                },
                _ => Ok(()),
            };
            if let Err(what) = checked {
                return fail(pc, what);
            }
            if let Some(target) = instruction.jump_target() {
                if target > self.code.len() {
                    return fail(pc, format!("jump target {} out of range", target));
                }
            }
        }

        for child in &self.children {
            child.verify(child.upvalues.len())?;
        }
        Ok(())
    }

    fn check_storage(&self, storage: Storage) -> Result<(), String> {
        match storage {
            Storage::Slot(i) if i < self.nslots => Ok(()),
            Storage::Cell(i) if i < self.ncells => Ok(()),
            Storage::Slot(i) => Err(format!("slot {} out of range", i)),
            Storage::Cell(i) => Err(format!("cell {} out of range", i)),
        }
    }
}

/// Serialized form of a compiled chunk
#[derive(Debug, Serialize, Deserialize)]
pub struct Bytecode {
    pub version: u32,
    pub chunk: Arc<Proto>,
}
