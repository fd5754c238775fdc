// src/lib.rs
//! # hostlua
//!
//! Embed Lua scripts in a Rust host. A script is compiled once and its
//! `main` function is invoked many times, concurrently, with host-supplied
//! arguments. Host values cross the boundary through a serde-based
//! marshaler, host functions are exposed to scripts as modules, and every
//! run can be cancelled or bounded by a deadline.
//!
//! ## Example
//!
//! ```rust
//! use hostlua::{args, Context, Module, Script, Value};
//!
//! let mut strings = Module::new("strings");
//! strings
//!     .register("shout", |s: String| s.to_uppercase())
//!     .unwrap();
//!
//! let source = r#"
//!     local strings = require("strings")
//!     function main(name)
//!         return strings.shout("hello, " .. name)
//!     end
//! "#;
//!
//! let script = Script::from_string("greet.lua", source, &[strings]).unwrap();
//! let out = script.run(&Context::background(), args!["roman"]).unwrap();
//! assert_eq!(out, Value::from("HELLO, ROMAN"));
//! ```
//!
//! ## Reference arguments
//!
//! Structs implementing [`Record`] (usually through the [`record!`] macro)
//! can be passed by mutable reference; writes made by the script land in
//! the host value.
//!
//! ```rust
//! use hostlua::{args, record, Context, Script};
//!
//! struct Person {
//!     name: String,
//!     age: u32,
//! }
//!
//! record!(Person { "Name" => name, "Age" => age });
//!
//! let script = Script::from_string(
//!     "update.lua",
//!     "function main(p) p.Name = 'Updated'; p.Age = p.Age + 1 end",
//!     &[],
//! )
//! .unwrap();
//!
//! let mut person = Person { name: "Roman".into(), age: 15 };
//! script.run(&Context::background(), args![&mut person]).unwrap();
//! assert_eq!(person.name, "Updated");
//! assert_eq!(person.age, 16);
//! ```

pub mod compiler;
pub mod config;
pub mod marshal;
pub mod module;
pub mod parser;
pub mod runtime;
pub mod script;
pub mod value;

use std::fmt;
use thiserror::Error;

pub use config::ScriptConfig;
pub use marshal::{from_value, to_value, Arg, Record};
pub use module::{Kind, Module, Param, Signature};
pub use runtime::context::{CancelReason, Context};
pub use script::Script;
pub use tokio_util::sync::CancellationToken;
pub use value::{Table, Type, Value};

/// Errors raised while turning source into a runnable [`Script`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("{chunk}:{line}: {message}")]
    Syntax {
        chunk: String,
        line: u32,
        message: String,
    },

    #[error("{0}: no main function defined")]
    MissingMain(String),

    #[error("{chunk}: main is a {found} value, expected a function")]
    MainNotFunction { chunk: String, found: String },

    #[error("{chunk}: error while loading chunk: {message}")]
    Load { chunk: String, message: String },

    #[error("module '{0}' is passed more than once")]
    DuplicateModule(String),

    #[error("unable to read script source: {0}")]
    Read(String),

    #[error("invalid bytecode: {0}")]
    Bytecode(String),
}

/// A value could not be converted at a call boundary
///
/// Produced by the marshaler and by the dispatcher when arguments for
/// `main` or a registered host function have the wrong count or shape.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{}", self.render())]
pub struct ArgumentError {
    /// Function being called, when known
    pub function: Option<String>,
    /// 1-based argument position, when the error concerns one argument
    pub position: Option<usize>,
    /// What the destination expected
    pub expected: String,
    /// What was actually supplied (empty when not applicable)
    pub actual: String,
}

impl ArgumentError {
    pub fn mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self {
            function: None,
            position: None,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn custom(message: impl fmt::Display) -> Self {
        Self::mismatch(message.to_string(), String::new())
    }

    pub(crate) fn count(function: &str, expected: impl fmt::Display, actual: usize) -> Self {
        Self {
            function: Some(function.to_string()),
            position: None,
            expected: format!("{} argument(s)", expected),
            actual: format!("{}", actual),
        }
    }

    /// Attach the argument position, keeping an existing one
    pub fn at(mut self, position: usize) -> Self {
        self.position.get_or_insert(position);
        self
    }

    /// Attach the function name, keeping an existing one
    pub fn in_function(mut self, function: &str) -> Self {
        self.function.get_or_insert_with(|| function.to_string());
        self
    }

    fn render(&self) -> String {
        let mut out = String::from("bad argument");
        if let Some(position) = self.position {
            out.push_str(&format!(" #{}", position));
        }
        if let Some(function) = &self.function {
            out.push_str(&format!(" to '{}'", function));
        }
        if self.actual.is_empty() {
            out.push_str(&format!(" ({})", self.expected));
        } else {
            out.push_str(&format!(" ({} expected, got {})", self.expected, self.actual));
        }
        out
    }
}

/// Errors raised by [`Module::register`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegisterError {
    #[error("invalid function name '{0}'")]
    InvalidName(String),

    #[error("function '{name}' is already registered in module '{module}'")]
    Duplicate { module: String, name: String },

    #[error("parameter #{position} of '{name}' has an unsupported type: {reason}")]
    Unsupported {
        name: String,
        position: usize,
        reason: String,
    },
}

/// Errors returned by [`Script::run`] and friends
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Argument(#[from] ArgumentError),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("script cancelled: {0}")]
    Cancelled(CancelReason),
}

impl Error {
    /// True when the run was stopped by its [`Context`]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}
