// src/compiler/mod.rs
//! Compiler that converts AST to bytecode

pub mod bytecode;
pub mod compiler;

use crate::parser;
use crate::CompileError;
use bytecode::{Bytecode, Proto, BYTECODE_VERSION};
use std::sync::Arc;

/// Parse and compile a chunk into the prototype of its top-level function
pub fn compile(chunk: &str, source: &str) -> Result<Arc<Proto>, CompileError> {
    let function = parser::parse(chunk, source)?;

    let proto = compiler::Compiler::compile_function(&function).map_err(|e| CompileError::Syntax {
        chunk: chunk.to_string(),
        line: e.line,
        message: e.message,
    })?;

    tracing::debug!(
        target: "hostlua",
        chunk,
        instructions = proto.code.len(),
        functions = proto.children.len(),
        "compiled chunk"
    );
    Ok(Arc::new(proto))
}

/// Serialize a compiled chunk
pub fn to_bytecode(chunk: &Arc<Proto>) -> Result<Vec<u8>, CompileError> {
    let bytecode = Bytecode {
        version: BYTECODE_VERSION,
        chunk: Arc::clone(chunk),
    };
    bincode::serialize(&bytecode).map_err(|e| CompileError::Bytecode(e.to_string()))
}

/// Load a chunk serialized by [`to_bytecode`]
pub fn from_bytecode(bytes: &[u8]) -> Result<Arc<Proto>, CompileError> {
    let bytecode: Bytecode =
        bincode::deserialize(bytes).map_err(|e| CompileError::Bytecode(e.to_string()))?;
    if bytecode.version != BYTECODE_VERSION {
        return Err(CompileError::Bytecode(format!(
            "unsupported bytecode version {} (expected {})",
            bytecode.version, BYTECODE_VERSION
        )));
    }
    // The top-level chunk is created without upvalues
    bytecode.chunk.verify(0).map_err(CompileError::Bytecode)?;
    Ok(bytecode.chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytecode::{Capture, Instruction};

    #[test]
    fn test_bytecode_round_trip() {
        let chunk = compile("test.lua", "function main(x) return x * 2 end").unwrap();
        let bytes = to_bytecode(&chunk).unwrap();
        let loaded = from_bytecode(&bytes).unwrap();
        assert_eq!(*loaded, *chunk);
    }

    #[test]
    fn test_rejects_garbage_bytecode() {
        assert!(matches!(
            from_bytecode(&[1, 2, 3]),
            Err(CompileError::Bytecode(_))
        ));
    }

    /// Re-encode a compiled chunk after `edit` has changed it
    fn tampered(source: &str, edit: impl FnOnce(&mut Proto)) -> Vec<u8> {
        let chunk = compile("tampered.lua", source).unwrap();
        let mut proto = (*chunk).clone();
        edit(&mut proto);
        to_bytecode(&Arc::new(proto)).unwrap()
    }

    fn rejected(bytes: &[u8]) -> String {
        match from_bytecode(bytes) {
            Err(CompileError::Bytecode(message)) => message,
            other => panic!("expected a bytecode error, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_out_of_range_references() {
        let source = "local x = 1\nfunction main() return x end";

        let bytes = tampered("local a = 1\nreturn a", |p| p.nslots = 0);
        assert!(rejected(&bytes).contains("slot 0 out of range"));

        let bytes = tampered(source, |p| p.ncells = 0);
        assert!(rejected(&bytes).contains("cell 0 out of range"));

        let bytes = tampered(source, |p| p.children.clear());
        assert!(rejected(&bytes).contains("function 0 out of range"));

        let bytes = tampered(source, |p| {
            let mut child = (*p.children[0]).clone();
            child.code.push(Instruction::LoadUpvalue(9));
            child.lines.push(2);
            p.children[0] = Arc::new(child);
        });
        assert!(rejected(&bytes).contains("upvalue 9 out of range"));
    }

    #[test]
    fn test_rejects_bad_jumps_and_line_tables() {
        let source = "function main(n) while n > 0 do n = n - 1 end return n end";

        let bytes = tampered(source, |p| {
            p.code.push(Instruction::Jump(usize::MAX));
            p.lines.push(1);
        });
        assert!(rejected(&bytes).contains("jump target"));

        let bytes = tampered(source, |p| {
            p.lines.pop();
        });
        assert!(rejected(&bytes).contains("line table"));

        let bytes = tampered(source, |p| p.upvalues.push(Capture::Cell(0)));
        assert!(rejected(&bytes).contains("upvalues"));
    }

    #[test]
    fn test_syntax_error_carries_chunk_and_line() {
        let err = compile("bad.lua", "function main()\n  return 1 +\nend").unwrap_err();
        match err {
            CompileError::Syntax { chunk, line, .. } => {
                assert_eq!(chunk, "bad.lua");
                assert_eq!(line, 3);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
