// src/script.rs
//! Compiled scripts and their execution entry points

use crate::compiler::{self, bytecode::Proto};
use crate::config::ScriptConfig;
use crate::marshal::Arg;
use crate::module::Module;
use crate::runtime::context::{Context, ExecutionContext};
use crate::runtime::pool::{Instance, Pool};
use crate::runtime::value::{Function, Val};
use crate::runtime::vm::Machine;
use crate::value::Value;
use crate::{ArgumentError, CompileError, Error};
use ahash::HashSet;
use std::any::Any;
use std::fmt;
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// A compiled script whose `main` function can be run many times
///
/// Cloning is cheap: clones share the compiled chunk, the modules and the
/// pool of VM instances. `Script::default()` is an uninitialized script
/// whose every run fails.
#[derive(Clone, Default)]
pub struct Script {
    inner: Option<Arc<Inner>>,
}

struct Inner {
    name: String,
    chunk: Arc<Proto>,
    modules: Arc<[Module]>,
    config: ScriptConfig,
    pool: Pool,
}

impl Script {
    /// Read and compile a script
    pub fn from_reader(
        name: &str,
        mut reader: impl Read,
        modules: &[Module],
    ) -> Result<Self, CompileError> {
        let mut source = String::new();
        reader
            .read_to_string(&mut source)
            .map_err(|e| CompileError::Read(e.to_string()))?;
        Self::from_string(name, &source, modules)
    }

    /// Compile a script held in memory with the default limits
    pub fn from_string(name: &str, source: &str, modules: &[Module]) -> Result<Self, CompileError> {
        Self::compile(name, source, modules, ScriptConfig::default())
    }

    /// Compile a script with explicit limits
    ///
    /// The top-level chunk runs once here, in the first VM instance, and
    /// must define a global `main` function.
    pub fn compile(
        name: &str,
        source: &str,
        modules: &[Module],
        config: ScriptConfig,
    ) -> Result<Self, CompileError> {
        let chunk = compiler::compile(name, source)?;
        Self::load(name, chunk, modules, config)
    }

    /// Load a chunk produced by [`Script::to_bytecode`]
    pub fn from_bytecode(name: &str, bytes: &[u8], modules: &[Module]) -> Result<Self, CompileError> {
        let chunk = compiler::from_bytecode(bytes)?;
        Self::load(name, chunk, modules, ScriptConfig::default())
    }

    /// Serialize the compiled chunk for storage or hot reload
    pub fn to_bytecode(&self) -> Result<Vec<u8>, Error> {
        let inner = self.inner()?;
        Ok(compiler::to_bytecode(&inner.chunk)?)
    }

    fn load(
        name: &str,
        chunk: Arc<Proto>,
        modules: &[Module],
        config: ScriptConfig,
    ) -> Result<Self, CompileError> {
        let mut seen = HashSet::default();
        for module in modules {
            if !seen.insert(module.name()) {
                return Err(CompileError::DuplicateModule(module.name().to_string()));
            }
        }
        let modules: Arc<[Module]> = modules.to_vec().into();

        let loaded = panic::catch_unwind(AssertUnwindSafe(|| {
            Instance::load(name, &chunk, Arc::clone(&modules), &config)
        }));
        let first = match loaded {
            Ok(result) => result.map_err(|e| CompileError::Load {
                chunk: name.to_string(),
                message: e.to_string(),
            })?,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::warn!(target: "hostlua", chunk = name, panic = %message, "top-level chunk panicked");
                return Err(CompileError::Load {
                    chunk: name.to_string(),
                    message: format!("panic: {}", message),
                });
            }
        };
        match first.main() {
            Val::Function(_) => {}
            Val::Nil => return Err(CompileError::MissingMain(name.to_string())),
            other => {
                return Err(CompileError::MainNotFunction {
                    chunk: name.to_string(),
                    found: other.type_name().to_string(),
                })
            }
        }

        tracing::debug!(
            target: "hostlua",
            chunk = name,
            modules = modules.len(),
            "compiled script"
        );

        Ok(Self {
            inner: Some(Arc::new(Inner {
                name: name.to_string(),
                chunk,
                modules,
                config,
                pool: Pool::new(first),
            })),
        })
    }

    /// Call `main` with `args` and return its first result
    ///
    /// # Example
    ///
    /// ```rust
    /// use hostlua::{args, Context, Script, Value};
    ///
    /// let script = Script::from_string(
    ///     "fib.lua",
    ///     "function main(n) if n < 2 then return 1 end return main(n - 1) + main(n - 2) end",
    ///     &[],
    /// )
    /// .unwrap();
    ///
    /// let out = script.run(&Context::background(), args![10]).unwrap();
    /// assert_eq!(out, Value::Number(89.0));
    /// ```
    pub fn run<'a>(
        &self,
        ctx: &Context,
        args: impl IntoIterator<Item = Arg<'a>>,
    ) -> Result<Value, Error> {
        let inner = self.inner()?;
        if inner.pool.is_closed() {
            return Err(Error::Runtime(format!("script '{}' is closed", inner.name)));
        }
        if let Some(reason) = ctx.done() {
            return Err(Error::Cancelled(reason));
        }

        match panic::catch_unwind(AssertUnwindSafe(|| inner.execute(ctx, args))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::warn!(target: "hostlua", chunk = %inner.name, panic = %message, "recovered from panic");
                Err(Error::Runtime(format!("panic: {}", message)))
            }
        }
    }

    /// [`run`](Script::run) on tokio's blocking thread pool
    #[cfg(feature = "async")]
    pub async fn run_async(&self, ctx: Context, args: Vec<Value>) -> Result<Value, Error> {
        let script = self.clone();
        tokio::task::spawn_blocking(move || script.run(&ctx, args.into_iter().map(Arg::Value)))
            .await
            .map_err(|e| Error::Runtime(e.to_string()))?
    }

    pub fn name(&self) -> &str {
        self.inner.as_ref().map_or("", |inner| inner.name.as_str())
    }

    /// Stop accepting runs and drop idle VM instances
    ///
    /// Runs in progress finish normally; their instances are discarded.
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<(), Error> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        if inner.pool.is_closed() {
            return Ok(());
        }
        let dropped = inner.pool.close();
        tracing::debug!(target: "hostlua", chunk = %inner.name, dropped, "closed script");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.as_ref().is_some_and(|inner| inner.pool.is_closed())
    }

    /// Number of idle VM instances
    pub fn pool_size(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.pool.idle())
    }

    fn inner(&self) -> Result<&Inner, Error> {
        self.inner
            .as_deref()
            .ok_or_else(|| Error::Runtime("script is not initialized".to_string()))
    }
}

impl Inner {
    fn execute<'a>(
        &self,
        ctx: &Context,
        args: impl IntoIterator<Item = Arg<'a>>,
    ) -> Result<Value, Error> {
        let instance = self.pool.acquire(|| {
            Instance::load(&self.name, &self.chunk, Arc::clone(&self.modules), &self.config)
                .map_err(Error::from)
        })?;

        let mut exec = ExecutionContext::new(ctx, &self.config);
        let args: Vec<Val> = args
            .into_iter()
            .map(|arg| match arg {
                Arg::Value(value) => Val::import(value),
                Arg::Record(record) => exec.bind(record),
            })
            .collect();

        let main = instance.main();
        if let Val::Function(Function::Lua(closure)) = &main {
            let declared = closure.proto.params.len();
            if !closure.proto.is_vararg && args.len() > declared {
                return Err(ArgumentError::count("main", declared, args.len()).into());
            }
        }

        let results = Machine::new(&mut exec, &instance, &self.name).call(&main, args)?;
        let first = results.into_iter().next().unwrap_or_default();
        Ok(exec.export(&first)?)
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("Script")
                .field("name", &inner.name)
                .field("modules", &inner.modules.len())
                .field("idle", &inner.pool.idle())
                .field("closed", &inner.pool.is_closed())
                .finish(),
            None => f.write_str("Script(uninitialized)"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{args, CancelReason};

    fn script(source: &str) -> Script {
        Script::from_string("test.lua", source, &[]).unwrap()
    }

    #[test]
    fn test_uninitialized_script() {
        let script = Script::default();
        assert!(matches!(
            script.run(&Context::background(), args![]),
            Err(Error::Runtime(_))
        ));
        assert_eq!(script.name(), "");
        assert_eq!(script.pool_size(), 0);
        assert!(!script.is_closed());
        assert!(script.to_bytecode().is_err());
    }

    #[test]
    fn test_construction_errors() {
        let err = Script::from_string("a.lua", "function main(", &[]).unwrap_err();
        assert!(matches!(err, CompileError::Syntax { .. }));

        let err = Script::from_string("a.lua", "x = 1", &[]).unwrap_err();
        assert_eq!(err, CompileError::MissingMain("a.lua".into()));

        let err = Script::from_string("a.lua", "main = 1", &[]).unwrap_err();
        assert_eq!(
            err,
            CompileError::MainNotFunction {
                chunk: "a.lua".into(),
                found: "number".into()
            }
        );

        let err = Script::from_string("a.lua", "error('boom')\nfunction main() end", &[]).unwrap_err();
        assert_eq!(
            err,
            CompileError::Load {
                chunk: "a.lua".into(),
                message: "a.lua:1: boom".into()
            }
        );
    }

    #[test]
    fn test_duplicate_modules() {
        let modules = [Module::new("m"), Module::new("m")];
        let err = Script::from_string("a.lua", "function main() end", &modules).unwrap_err();
        assert_eq!(err, CompileError::DuplicateModule("m".into()));
    }

    #[test]
    fn test_argument_count() {
        let script = script("function main(a, b) return b end");
        assert_eq!(script.run(&Context::background(), args![1]).unwrap(), Value::Nil);
        let err = script.run(&Context::background(), args![1, 2, 3]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "bad argument to 'main' (2 argument(s) expected, got 3)"
        );

        let varargs = self::script("function main(...) return select('#', ...) end");
        assert_eq!(
            varargs.run(&Context::background(), args![1, 2, 3]).unwrap(),
            Value::Number(3.0)
        );
    }

    #[test]
    fn test_returned_function_is_rejected() {
        let script = script("function main() return main end");
        assert!(matches!(
            script.run(&Context::background(), args![]),
            Err(Error::Argument(_))
        ));
    }

    #[test]
    fn test_done_context_fails_fast() {
        let script = script("function main() return 1 end");
        let token = crate::CancellationToken::new();
        token.cancel();
        let err = script.run(&Context::with_cancel(token), args![]).unwrap_err();
        assert_eq!(err, Error::Cancelled(CancelReason::Cancelled));
    }

    #[test]
    fn test_close_is_idempotent() {
        let script = script("function main() return 1 end");
        assert_eq!(script.pool_size(), 1);
        script.close().unwrap();
        script.close().unwrap();
        assert!(script.is_closed());
        assert_eq!(script.pool_size(), 0);
        assert!(matches!(
            script.run(&Context::background(), args![]),
            Err(Error::Runtime(_))
        ));
    }

    #[test]
    fn test_panicking_host_function() {
        let mut module = Module::new("bad");
        module
            .register("explode", || -> f64 { panic!("kaboom") })
            .unwrap();
        let script = Script::from_string(
            "p.lua",
            "local bad = require('bad') function main() return bad.explode() end",
            &[module],
        )
        .unwrap();

        let err = script.run(&Context::background(), args![]).unwrap_err();
        assert_eq!(err, Error::Runtime("panic: kaboom".into()));
        // The poisoned instance was discarded, later runs build a new one
        assert_eq!(script.pool_size(), 0);
        assert!(script.run(&Context::background(), args![]).is_err());
    }

    #[test]
    fn test_bytecode_round_trip() {
        let script = script("local base = 40 function main(n) return base + n end");
        let bytes = script.to_bytecode().unwrap();
        let reloaded = Script::from_bytecode("reloaded.lua", &bytes, &[]).unwrap();
        assert_eq!(reloaded.name(), "reloaded.lua");
        assert_eq!(
            reloaded.run(&Context::background(), args![2]).unwrap(),
            Value::Number(42.0)
        );
    }

    #[test]
    fn test_tampered_bytecode_is_a_compile_error() {
        let script = script("local base = 40 function main(n) return base + n end");
        let mut chunk = (*script.inner.as_ref().unwrap().chunk).clone();
        chunk.ncells = 0;
        let bytes = compiler::to_bytecode(&Arc::new(chunk)).unwrap();
        assert!(matches!(
            Script::from_bytecode("tampered.lua", &bytes, &[]),
            Err(CompileError::Bytecode(_))
        ));
    }

    #[test]
    fn test_panic_in_top_level_chunk() {
        let mut boom = Module::new("boom");
        boom.register("now", || -> f64 { panic!("exploded") }).unwrap();
        let err = Script::from_string(
            "a.lua",
            "local x = require('boom').now() function main() return x end",
            &[boom],
        )
        .unwrap_err();
        match err {
            CompileError::Load { chunk, message } => {
                assert_eq!(chunk, "a.lua");
                assert!(message.contains("panic: exploded"), "{}", message);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_globals_persist_within_an_instance() {
        let script = script("count = 0 function main() count = count + 1 return count end");
        let ctx = Context::background();
        assert_eq!(script.run(&ctx, args![]).unwrap(), Value::Number(1.0));
        assert_eq!(script.run(&ctx, args![]).unwrap(), Value::Number(2.0));
    }
}
