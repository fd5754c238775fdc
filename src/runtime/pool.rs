// src/runtime/pool.rs
//! VM instances and the free list they are leased from

use crate::compiler::bytecode::Proto;
use crate::config::ScriptConfig;
use crate::module::Module;
use crate::runtime::context::{Context, ExecutionContext};
use crate::runtime::stdlib;
use crate::runtime::value::{Closure, Function, TableRef, Val};
use crate::runtime::vm::{GuestError, Machine};
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Globals and library state of one guest VM
pub struct Instance {
    pub globals: TableRef,
    /// `require` cache
    pub loaded: TableRef,
    /// Methods available on string values
    pub string_lib: TableRef,
    pub modules: Arc<[Module]>,
}

impl Instance {
    /// A fresh instance with the standard library installed
    pub fn new(modules: Arc<[Module]>) -> Self {
        let globals = TableRef::new();
        let loaded = TableRef::new();
        let string_lib = stdlib::install(&globals);
        Self {
            globals,
            loaded,
            string_lib,
            modules,
        }
    }

    /// Create an instance and run the top-level chunk in it
    pub fn load(
        name: &str,
        chunk: &Arc<Proto>,
        modules: Arc<[Module]>,
        config: &ScriptConfig,
    ) -> Result<Self, GuestError> {
        let instance = Instance::new(modules);
        let context = Context::background();
        let mut exec = ExecutionContext::new(&context, config);

        let top = Val::Function(Function::Lua(Arc::new(Closure {
            proto: Arc::clone(chunk),
            upvalues: Vec::new(),
        })));
        Machine::new(&mut exec, &instance, name).call(&top, Vec::new())?;
        Ok(instance)
    }

    /// Current value of the global `main`
    pub fn main(&self) -> Val {
        self.globals.get_str("main")
    }
}

/// Free list of idle instances
pub struct Pool {
    free: Mutex<Vec<Instance>>,
    closed: AtomicBool,
}

impl Pool {
    pub fn new(first: Instance) -> Self {
        Self {
            free: Mutex::new(vec![first]),
            closed: AtomicBool::new(false),
        }
    }

    /// Take an idle instance, or build one with `create` when none is free
    pub fn acquire<E>(
        &self,
        create: impl FnOnce() -> Result<Instance, E>,
    ) -> Result<Lease<'_>, E> {
        let idle = self.free.lock().pop();
        let instance = match idle {
            Some(instance) => instance,
            None => {
                let instance = create()?;
                tracing::debug!(target: "hostlua", "pool grew by one instance");
                instance
            }
        };
        Ok(Lease {
            pool: self,
            instance: Some(instance),
        })
    }

    /// Drop every idle instance and refuse new returns; returns how many
    /// instances were dropped
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let drained = std::mem::take(&mut *self.free.lock());
        drained.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of idle instances
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

/// An instance checked out of a [`Pool`]; returned when dropped
pub struct Lease<'p> {
    pool: &'p Pool,
    instance: Option<Instance>,
}

impl Deref for Lease<'_> {
    type Target = Instance;

    fn deref(&self) -> &Instance {
        // Only `drop` takes the instance out
        self.instance.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        let Some(instance) = self.instance.take() else {
            return;
        };
        // An instance that was executing when a panic hit is not reused
        if std::thread::panicking() || self.pool.is_closed() {
            return;
        }
        self.pool.free.lock().push(instance);
    }
}
