// src/parser/ast.rs
//! Abstract Syntax Tree definitions
//!
//! Names are resolved while parsing: every variable reference is already a
//! local of the enclosing function, an upvalue captured from an outer
//! function, or a global.

/// Index into [`Function::locals`]
pub type LocalId = usize;

pub type Block = Vec<Stat>;

/// A function body, including the implicit function of the whole chunk
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub line: u32,
    pub params: Vec<LocalId>,
    pub is_vararg: bool,
    /// Every local declared anywhere in the body, in declaration order
    pub locals: Vec<LocalInfo>,
    pub upvalues: Vec<Upvalue>,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalInfo {
    pub name: String,
    /// Referenced by an inner function, so it lives in a shared cell
    pub captured: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Upvalue {
    pub name: String,
    pub source: UpvalueSource,
}

/// Where an upvalue comes from, seen from the enclosing function
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpvalueSource {
    Local(LocalId),
    Upvalue(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
    pub line: u32,
    pub kind: StatKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatKind {
    Local {
        names: Vec<LocalId>,
        values: Vec<Expr>,
    },
    Assign {
        targets: Vec<Expr>,
        values: Vec<Expr>,
    },
    Call(Expr),
    Do(Block),
    While {
        condition: Expr,
        body: Block,
    },
    Repeat {
        body: Block,
        condition: Expr,
    },
    If {
        branches: Vec<(Expr, Block)>,
        else_block: Option<Block>,
    },
    NumericFor {
        var: LocalId,
        start: Expr,
        limit: Expr,
        step: Option<Expr>,
        body: Block,
    },
    GenericFor {
        vars: Vec<LocalId>,
        values: Vec<Expr>,
        body: Block,
    },
    LocalFunction {
        var: LocalId,
        function: Box<Function>,
    },
    Return(Vec<Expr>),
    Break,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Nil,
    True,
    False,
    Vararg,
    Number(f64),
    Str(String),
    Function(Box<Function>),

    Local(LocalId),
    Upvalue(usize),
    Global(String),
    Index(Box<Expr>, Box<Expr>),

    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
    },
    Method {
        object: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },

    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),

    Table(Vec<TableField>),
    /// Parenthesized expression, truncated to a single value
    Paren(Box<Expr>),
}

impl Expr {
    /// Calls and `...` can produce any number of values
    pub fn is_multi(&self) -> bool {
        matches!(self, Expr::Call { .. } | Expr::Method { .. } | Expr::Vararg)
    }

    pub fn is_assignable(&self) -> bool {
        matches!(
            self,
            Expr::Local(_) | Expr::Upvalue(_) | Expr::Global(_) | Expr::Index(..)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableField {
    Positional(Expr),
    Keyed(Expr, Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    Len,
}
