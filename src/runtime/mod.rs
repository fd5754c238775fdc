// src/runtime/mod.rs
//! Guest VM: values, the interpreter loop, the standard library and the
//! instance pool

pub mod context;
pub mod pool;
pub mod stdlib;
pub mod value;
pub mod vm;

pub use context::ExecutionContext;
pub use pool::{Instance, Pool};
pub use vm::{GuestError, Machine};
