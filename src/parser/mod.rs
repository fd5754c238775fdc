// src/parser/mod.rs
//! Parser for the script language
//!
//! Converts source code into an Abstract Syntax Tree (AST)

pub mod ast;
pub mod lexer;
pub mod parser;

use crate::CompileError;
pub use ast::Function;

/// Parse a chunk into the AST of its top-level function
pub fn parse(chunk: &str, source: &str) -> Result<Function, CompileError> {
    let syntax = |e: parser::ParseError| CompileError::Syntax {
        chunk: chunk.to_string(),
        line: e.line,
        message: e.message,
    };

    let mut parser = parser::Parser::new(source).map_err(syntax)?;
    parser.parse().map_err(syntax)
}
